//! Per-run state and context records.

use crate::thread::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Immutable context threaded through a run and its descendants.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    /// Ancestor run ids, outermost first. Empty for root runs.
    pub parent_run_ids: Vec<String>,
    pub user_id: String,
    pub client_session_id: String,
    pub fingerprint_id: String,
    pub repo_id: Option<String>,
    /// Single abort signal shared by the run tree.
    pub cancellation: CancellationToken,
    /// Opaque workspace context forwarded to client-delegated tools.
    pub file_context: Option<Value>,
}

impl RunContext {
    pub fn new(user_id: impl Into<String>, client_session_id: impl Into<String>) -> Self {
        Self {
            run_id: gen_run_id(),
            parent_run_ids: Vec::new(),
            user_id: user_id.into(),
            client_session_id: client_session_id.into(),
            fingerprint_id: String::new(),
            repo_id: None,
            cancellation: CancellationToken::new(),
            file_context: None,
        }
    }

    /// Derive the context for a child run: fresh run id, extended ancestry,
    /// child abort token linked to the parent's.
    pub fn child(&self) -> Self {
        let mut parent_run_ids = self.parent_run_ids.clone();
        parent_run_ids.push(self.run_id.clone());
        Self {
            run_id: gen_run_id(),
            parent_run_ids,
            user_id: self.user_id.clone(),
            client_session_id: self.client_session_id.clone(),
            fingerprint_id: self.fingerprint_id.clone(),
            repo_id: self.repo_id.clone(),
            cancellation: self.cancellation.child_token(),
            file_context: self.file_context.clone(),
        }
    }

    #[must_use]
    pub fn with_repo_id(mut self, repo_id: impl Into<String>) -> Self {
        self.repo_id = Some(repo_id.into());
        self
    }

    #[must_use]
    pub fn with_file_context(mut self, file_context: Value) -> Self {
        self.file_context = Some(file_context);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn for_tests() -> Self {
        Self::new("user-test", "session-test")
    }
}

/// Generate a time-ordered run identifier.
pub fn gen_run_id() -> String {
    format!("run_{}", Uuid::now_v7().simple())
}

/// Mutable per-agent record, owned by the orchestrator and mutated only by
/// the step runner driving the run.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub agent_id: String,
    pub messages: Vec<Message>,
    pub steps_remaining: u32,
    /// Total credits, own charges plus finished children.
    pub credits_used: f64,
    /// Own charges only.
    pub direct_credits_used: f64,
    pub spawned_run_ids: Vec<String>,
    pub output: Option<Value>,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>, steps_remaining: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            messages: Vec::new(),
            steps_remaining,
            credits_used: 0.0,
            direct_credits_used: 0.0,
            spawned_run_ids: Vec::new(),
            output: None,
        }
    }

    /// Final assistant text, if the last assistant message carries any.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find_map(|m| m.as_assistant_text())
            .filter(|text| !text.is_empty())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    MaxSteps,
    OutOfCredits,
    Aborted,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::MaxSteps => "max_steps",
            Self::OutOfCredits => "out_of_credits",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }
}

/// Terminal payload returned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentOutput {
    Text { text: String },
    StructuredOutput { value: Value },
    LastMessage { message: Message },
    Error { kind: crate::error::ErrorKind, message: String },
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub output: AgentOutput,
    pub total_steps: u32,
    pub credits_used: f64,
    pub direct_credits_used: f64,
    pub spawned_run_ids: Vec<String>,
}
