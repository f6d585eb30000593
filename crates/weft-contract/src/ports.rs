//! Narrow interfaces the runtime depends on, implemented by the host.

use crate::error::AgentError;
use crate::run::{AgentOutput, RunContext, RunStatus};
use crate::thread::{Message, ToolCall, ToolOutput};
use crate::tool::{ToolContext, ToolDescriptor, ToolError};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use thiserror::Error;

// ---------------------------------------------------------------------------
// LLM port
// ---------------------------------------------------------------------------

/// Token accounting reported by the LLM port per completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Credits the port attributes to this completion. Zero for BYOK keys.
    pub credits_used: f64,
}

/// Stream terminator payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    pub message_id: String,
    pub usage: LlmUsage,
}

/// One event in a model completion stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LlmEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// A structured (provider-native) tool call, complete.
    ToolCall(ToolCall),
    End(StreamEnd),
}

/// Request sent to the LLM port.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, Error)]
#[error("llm transport error: {message}")]
pub struct LlmError {
    pub message: String,
}

impl LlmError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type LlmEventStream = Pin<Box<dyn Stream<Item = Result<LlmEvent, LlmError>> + Send>>;

/// Non-streaming completion result.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: LlmUsage,
}

/// Structured completion result.
#[derive(Debug, Clone)]
pub struct StructuredCompletion {
    pub value: Value,
    pub usage: LlmUsage,
}

/// Abstraction over model inference backends.
///
/// Provider wire formats, fallbacks, and wire-level retries live behind this
/// trait; the runtime only consumes the abstract event stream.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn stream(&self, request: LlmRequest) -> Result<LlmEventStream, LlmError>;

    async fn complete(&self, request: LlmRequest) -> Result<Completion, LlmError>;

    /// Completion constrained to a JSON schema. The default implementation
    /// parses the plain completion text.
    async fn structured(
        &self,
        request: LlmRequest,
        _schema: Value,
    ) -> Result<StructuredCompletion, LlmError> {
        let completion = self.complete(request).await?;
        let value = serde_json::from_str(completion.text.trim())
            .map_err(|e| LlmError::new(format!("structured output was not valid JSON: {e}")))?;
        Ok(StructuredCompletion {
            value,
            usage: completion.usage,
        })
    }

    /// Stable label for logging.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Client-delegated tool port
// ---------------------------------------------------------------------------

/// Forwarding port for tools executed by the surrounding application
/// (file reads, shell, editor integration).
///
/// Cancel semantics are host-dependent: the abort token rides along in the
/// context, but the runtime treats an unresponsive host like any other
/// handler failure.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn request(
        &self,
        tool_name: &str,
        arguments: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

// ---------------------------------------------------------------------------
// Spawn port
// ---------------------------------------------------------------------------

/// One requested child agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub agent_type: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Whether the spawn tool waits for its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// Await all children; the tool result carries their outputs.
    Sync,
    /// Fire and forget; the tool result carries only run ids.
    Async,
}

/// What the spawner reports per child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnedRun {
    pub run_id: String,
    pub agent_id: String,
    /// Terminal status; `None` while an async child is still running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<AgentOutput>,
    #[serde(default)]
    pub credits_used: f64,
}

/// Child-agent factory, implemented in-process by the orchestrator.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(
        &self,
        requests: Vec<SpawnRequest>,
        mode: SpawnMode,
        parent: &RunContext,
    ) -> Result<Vec<SpawnedRun>, AgentError>;
}

// ---------------------------------------------------------------------------
// Telemetry sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStartRecord {
    pub run_id: String,
    pub parent_run_ids: Vec<String>,
    pub agent_id: String,
    pub user_id: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub step_number: u32,
    pub credits: f64,
    pub child_run_ids: Vec<String>,
    pub message_id: Option<String>,
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinishRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub total_steps: u32,
    pub direct_credits: f64,
    pub total_credits: f64,
}

#[derive(Debug, Clone, Error)]
#[error("telemetry sink error: {0}")]
pub struct TelemetryError(pub String);

/// Fire-and-forget persistence of run/step records. Failures are logged by
/// the caller and never fail the run.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn start_run(&self, record: RunStartRecord) -> Result<(), TelemetryError>;
    async fn add_step(&self, record: StepRecord) -> Result<(), TelemetryError>;
    async fn finish_run(&self, record: RunFinishRecord) -> Result<(), TelemetryError>;
}

/// Sink that drops everything; for hosts without persistence.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

#[async_trait]
impl TelemetrySink for NullTelemetry {
    async fn start_run(&self, _record: RunStartRecord) -> Result<(), TelemetryError> {
        Ok(())
    }
    async fn add_step(&self, _record: StepRecord) -> Result<(), TelemetryError> {
        Ok(())
    }
    async fn finish_run(&self, _record: RunFinishRecord) -> Result<(), TelemetryError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Credit backend
// ---------------------------------------------------------------------------

/// Whether a charge was the agent's own or rolled up from a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditKind {
    Direct,
    Spawned,
}

/// One ledger mutation. `operation_id` is the idempotency key: the backend
/// returns the prior receipt for a repeated id without charging again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditLedgerEntry {
    pub user_id: String,
    pub amount: f64,
    pub operation_id: String,
    pub kind: CreditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub charged: f64,
    pub charged_to_organization: bool,
}

/// Backend failure with its transaction status code (SQLSTATE-style).
#[derive(Debug, Clone, Error)]
#[error("credit backend error [{code}]: {message}")]
pub struct CreditBackendError {
    pub code: String,
    pub message: String,
}

impl CreditBackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Well-known code the gate maps to an insufficient-balance result.
    pub const INSUFFICIENT: &'static str = "insufficient_credits";
}

/// Serializable-transaction ledger access.
#[async_trait]
pub trait CreditBackend: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<f64, CreditBackendError>;
    async fn charge(&self, entry: CreditLedgerEntry) -> Result<ChargeReceipt, CreditBackendError>;
}

// ---------------------------------------------------------------------------
// Template store
// ---------------------------------------------------------------------------

/// Remote template lookup, sibling of the credit backend. The registry
/// caches successful fetches by identifier.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn fetch(
        &self,
        identifier: &crate::identifier::AgentIdentifier,
    ) -> Result<Option<crate::template::AgentTemplate>, AgentError>;
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvTag {
    Dev,
    Test,
    Prod,
}

/// Host-provided environment. The core never reads `std::env` directly.
#[derive(Debug, Clone)]
pub struct Environment {
    pub api_keys: HashMap<String, String>,
    pub env: EnvTag,
    pub base_url: String,
}

impl Environment {
    pub fn for_tests() -> Self {
        Self {
            api_keys: HashMap::new(),
            env: EnvTag::Test,
            base_url: "http://localhost".into(),
        }
    }
}
