//! Shared in-memory port fakes for runtime tests.
//!
//! Kept in the contract crate so every layer's tests script the same ports.

use crate::ports::*;
use crate::thread::ToolOutput;
use crate::tool::{ToolContext, ToolError};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

/// One scripted stream event with an optional artificial delay before it.
#[derive(Debug, Clone)]
pub struct ScriptedEvent {
    pub delay: Duration,
    pub event: LlmEvent,
}

impl ScriptedEvent {
    pub fn now(event: LlmEvent) -> Self {
        Self {
            delay: Duration::ZERO,
            event,
        }
    }

    pub fn after(delay_ms: u64, event: LlmEvent) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            event,
        }
    }
}

/// LLM port that replays pre-scripted streams, one per `stream()` call.
///
/// A script without a terminal `End` event gets one appended with a
/// generated message id.
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    scripts: Arc<Mutex<VecDeque<Vec<ScriptedEvent>>>>,
    requests: Arc<Mutex<Vec<LlmRequest>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, events: Vec<ScriptedEvent>) {
        self.scripts.lock().unwrap().push_back(events);
    }

    /// Convenience: script of immediate events.
    pub fn push_events(&self, events: Vec<LlmEvent>) {
        self.push_script(events.into_iter().map(ScriptedEvent::now).collect());
    }

    /// Requests seen so far, for prompt-assembly assertions.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn stream(&self, request: LlmRequest) -> Result<LlmEventStream, LlmError> {
        self.requests.lock().unwrap().push(request);
        let mut script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::new("scripted llm: no script queued"))?;

        let has_end = script
            .iter()
            .any(|s| matches!(s.event, LlmEvent::End(_)));
        if !has_end {
            script.push(ScriptedEvent::now(LlmEvent::End(StreamEnd {
                message_id: crate::ids::gen_message_id(),
                usage: LlmUsage::default(),
            })));
        }

        let stream = futures::stream::iter(script).then(|scripted| async move {
            if !scripted.delay.is_zero() {
                tokio::time::sleep(scripted.delay).await;
            }
            Ok::<LlmEvent, LlmError>(scripted.event)
        });
        Ok(Box::pin(stream))
    }

    async fn complete(&self, request: LlmRequest) -> Result<Completion, LlmError> {
        let mut stream = self.stream(request).await?;
        let mut text = String::new();
        let mut usage = LlmUsage::default();
        while let Some(event) = stream.next().await {
            match event? {
                LlmEvent::TextDelta(delta) => text.push_str(&delta),
                LlmEvent::End(end) => usage = end.usage,
                _ => {}
            }
        }
        Ok(Completion { text, usage })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Static tool client
// ---------------------------------------------------------------------------

/// Client-tool port answering from a canned response table.
#[derive(Clone, Default)]
pub struct StaticToolClient {
    responses: Arc<Mutex<HashMap<String, ToolOutput>>>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl StaticToolClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, tool_name: impl Into<String>, output: ToolOutput) {
        self.responses
            .lock()
            .unwrap()
            .insert(tool_name.into(), output);
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolClient for StaticToolClient {
    async fn request(
        &self,
        tool_name: &str,
        arguments: Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        self.requests
            .lock()
            .unwrap()
            .push((tool_name.to_string(), arguments));
        self.responses
            .lock()
            .unwrap()
            .get(tool_name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(format!("no canned response for '{tool_name}'")))
    }
}

// ---------------------------------------------------------------------------
// Recording telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TelemetryLog {
    pub runs_started: Vec<RunStartRecord>,
    pub steps: Vec<StepRecord>,
    pub runs_finished: Vec<RunFinishRecord>,
}

/// Sink that records everything for assertions.
#[derive(Clone, Default)]
pub struct RecordingTelemetry {
    log: Arc<Mutex<TelemetryLog>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> TelemetryLog {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelemetrySink for RecordingTelemetry {
    async fn start_run(&self, record: RunStartRecord) -> Result<(), TelemetryError> {
        self.log.lock().unwrap().runs_started.push(record);
        Ok(())
    }

    async fn add_step(&self, record: StepRecord) -> Result<(), TelemetryError> {
        self.log.lock().unwrap().steps.push(record);
        Ok(())
    }

    async fn finish_run(&self, record: RunFinishRecord) -> Result<(), TelemetryError> {
        self.log.lock().unwrap().runs_finished.push(record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory credit backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, f64>,
    receipts: HashMap<String, ChargeReceipt>,
    /// Error codes injected into upcoming `charge` calls, front first.
    failures: VecDeque<String>,
    charge_attempts: u64,
}

/// Idempotent in-memory ledger with scriptable transient failures.
#[derive(Clone, Default)]
pub struct InMemoryCreditBackend {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryCreditBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(user_id: impl Into<String>, balance: f64) -> Self {
        let backend = Self::new();
        backend.set_balance(user_id, balance);
        backend
    }

    pub fn set_balance(&self, user_id: impl Into<String>, balance: f64) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(user_id.into(), balance);
    }

    /// Make the next `charge` calls fail with the given codes, in order.
    pub fn fail_next_charges(&self, codes: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .extend(codes.iter().map(|c| c.to_string()));
    }

    pub fn charge_attempts(&self) -> u64 {
        self.state.lock().unwrap().charge_attempts
    }
}

#[async_trait]
impl CreditBackend for InMemoryCreditBackend {
    async fn balance(&self, user_id: &str) -> Result<f64, CreditBackendError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(user_id)
            .copied()
            .unwrap_or(0.0))
    }

    async fn charge(&self, entry: CreditLedgerEntry) -> Result<ChargeReceipt, CreditBackendError> {
        let mut state = self.state.lock().unwrap();
        state.charge_attempts += 1;

        if let Some(code) = state.failures.pop_front() {
            return Err(CreditBackendError::new(code, "injected failure"));
        }

        if let Some(receipt) = state.receipts.get(&entry.operation_id) {
            return Ok(*receipt);
        }

        let balance = state.balances.entry(entry.user_id.clone()).or_insert(0.0);
        if *balance < entry.amount {
            return Err(CreditBackendError::new(
                CreditBackendError::INSUFFICIENT,
                format!("balance {balance} below charge {}", entry.amount),
            ));
        }
        *balance -= entry.amount;
        let receipt = ChargeReceipt {
            charged: entry.amount,
            charged_to_organization: false,
        };
        state.receipts.insert(entry.operation_id, receipt);
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{CreditKind, LlmEvent};

    fn entry(op: &str, amount: f64) -> CreditLedgerEntry {
        CreditLedgerEntry {
            user_id: "u1".into(),
            amount,
            operation_id: op.into(),
            kind: CreditKind::Direct,
            repo_id: None,
        }
    }

    #[tokio::test]
    async fn ledger_charge_is_idempotent() {
        let backend = InMemoryCreditBackend::with_balance("u1", 10.0);
        let first = backend.charge(entry("op-1", 4.0)).await.unwrap();
        let second = backend.charge(entry("op-1", 4.0)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.balance("u1").await.unwrap(), 6.0);
    }

    #[tokio::test]
    async fn ledger_rejects_overdraft() {
        let backend = InMemoryCreditBackend::with_balance("u1", 1.0);
        let err = backend.charge(entry("op-1", 5.0)).await.unwrap_err();
        assert_eq!(err.code, CreditBackendError::INSUFFICIENT);
    }

    #[tokio::test]
    async fn injected_failures_fire_in_order() {
        let backend = InMemoryCreditBackend::with_balance("u1", 10.0);
        backend.fail_next_charges(&["40001", "40P01"]);
        assert_eq!(
            backend.charge(entry("op", 1.0)).await.unwrap_err().code,
            "40001"
        );
        assert_eq!(
            backend.charge(entry("op", 1.0)).await.unwrap_err().code,
            "40P01"
        );
        assert!(backend.charge(entry("op", 1.0)).await.is_ok());
        assert_eq!(backend.charge_attempts(), 3);
    }

    #[tokio::test]
    async fn scripted_llm_appends_missing_end() {
        let llm = ScriptedLlm::new();
        llm.push_events(vec![LlmEvent::TextDelta("hello".into())]);
        let completion = llm.complete(LlmRequest::default()).await.unwrap();
        assert_eq!(completion.text, "hello");
    }
}
