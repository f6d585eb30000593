//! The per-step tool dispatcher.
//!
//! Handlers may overlap in wall-clock time, but their externally observable
//! effects — recorded calls and results, UI events — are serialized by a
//! chain of one-shot completion handles: each dispatched handler awaits the
//! previous handle, runs, records, emits, then resolves its own. The log
//! and the UI stream therefore see tool effects in parse order no matter
//! how the underlying futures interleave.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use weft_contract::event::AgentEvent;
use weft_contract::ids::CallIdGen;
use weft_contract::thread::{ToolCall, ToolOutput};
use weft_contract::tool::{ToolContext, ToolError, ToolRegistry};

/// One recorded result, paired with its originating call.
#[derive(Debug, Clone)]
pub struct ToolResultRecord {
    pub call: ToolCall,
    pub output: ToolOutput,
}

/// Everything a step's dispatch produced, in serialized order.
#[derive(Debug, Clone, Default)]
pub struct DispatchRecords {
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResultRecord>,
    /// Rejection notices, appended after all tool results at commit.
    pub user_errors: Vec<String>,
    pub had_tool_call_error: bool,
    pub step_ended: bool,
    pub direct_credits: f64,
    pub spawned_credits: f64,
    pub spawned_run_ids: Vec<String>,
}

/// Outcome of a dispatch attempt.
pub enum Dispatched {
    /// The call never reached a handler; a user-visible error was queued.
    Rejected,
    Running(RunningDispatch),
}

pub struct RunningDispatch {
    /// Resolves when this handler's effects are recorded.
    pub completed: oneshot::Receiver<()>,
    pub ends_step: bool,
    pub waits_for_stream_end: bool,
}

pub struct ToolDispatcher {
    registry: ToolRegistry,
    spawnable_agents: Vec<String>,
    ctx: ToolContext,
    ids: CallIdGen,
    events: mpsc::UnboundedSender<AgentEvent>,
    shared: Arc<Mutex<DispatchRecords>>,
    /// Tail of the serialization spine.
    previous_finished: Option<oneshot::Receiver<()>>,
    stream_done: watch::Sender<bool>,
    end_dispatched: bool,
}

impl ToolDispatcher {
    pub fn new(
        registry: ToolRegistry,
        spawnable_agents: Vec<String>,
        ctx: ToolContext,
        ids: CallIdGen,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        let (stream_done, _) = watch::channel(false);
        Self {
            registry,
            spawnable_agents,
            ctx,
            ids,
            events,
            shared: Arc::new(Mutex::new(DispatchRecords::default())),
            previous_finished: None,
            stream_done,
            end_dispatched: false,
        }
    }

    /// Route one parsed tool call.
    pub fn dispatch(&mut self, name: &str, arguments: Value) -> Dispatched {
        // Providers emit null arguments for zero-argument tools.
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let (name, arguments) = self.resolve_name(name, arguments);

        let Some(tool) = self.registry.get(&name) else {
            self.reject(format!("Unknown tool '{name}'"));
            return Dispatched::Rejected;
        };
        let descriptor = tool.descriptor();

        if descriptor.ends_agent_step && self.end_dispatched {
            self.reject(format!(
                "Tool '{name}' was ignored because a step-ending tool was already invoked in this step"
            ));
            return Dispatched::Rejected;
        }

        if let Err(err) = tool.validate_args(&arguments) {
            let details = match err {
                ToolError::InvalidArguments(details) => details,
                other => other.to_string(),
            };
            self.reject(format!("Invalid parameters for {name}: {details}"));
            return Dispatched::Rejected;
        }

        if descriptor.ends_agent_step {
            self.end_dispatched = true;
        }

        let call = ToolCall::new(self.ids.next(), name, arguments);
        let previous = self.previous_finished.take();
        let (chain_tx, chain_rx) = oneshot::channel();
        self.previous_finished = Some(chain_rx);
        let (done_tx, done_rx) = oneshot::channel();

        let ends_step = descriptor.ends_agent_step;
        let waits_for_stream_end = descriptor.waits_for_stream_end;
        let mut stream_done = self.stream_done.subscribe();
        let shared = self.shared.clone();
        let events = self.events.clone();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if waits_for_stream_end {
                let _ = stream_done.wait_for(|done| *done).await;
            }

            // Once aborted, no new handlers start; handlers already past
            // this point settle so the committed log stays paired.
            if !ctx.run.cancellation.is_cancelled() {
                tracing::debug!(tool = %call.name, id = %call.id, "executing tool");
                let output = match tool.execute(call.arguments.clone(), &ctx).await {
                    Ok(output) => output,
                    Err(err) => {
                        tracing::warn!(tool = %call.name, error = %err, "tool handler failed");
                        ToolOutput::error_json(json!({"error": err.to_string()}))
                    }
                };
                {
                    let mut records = shared.lock().expect("dispatch records poisoned");
                    records.tool_calls.push(call.clone());
                    records.direct_credits += output.credits_used;
                    records.spawned_credits += output.spawned_credits;
                    records
                        .spawned_run_ids
                        .extend(output.spawned_run_ids.iter().cloned());
                    records.tool_results.push(ToolResultRecord {
                        call: call.clone(),
                        output: output.clone(),
                    });
                    if ends_step {
                        records.step_ended = true;
                    }
                }
                let _ = events.send(AgentEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                let _ = events.send(AgentEvent::ToolResult {
                    id: call.id,
                    name: call.name,
                    output,
                });
            }

            let _ = chain_tx.send(());
            let _ = done_tx.send(());
        });

        Dispatched::Running(RunningDispatch {
            completed: done_rx,
            ends_step,
            waits_for_stream_end,
        })
    }

    /// Unknown names that match a spawnable agent id become `spawn_agents`
    /// calls (compatibility shim).
    fn resolve_name(&self, name: &str, arguments: Value) -> (String, Value) {
        if self.registry.contains(name) || !self.spawnable_agents.iter().any(|a| a == name) {
            return (name.to_string(), arguments);
        }
        let prompt = arguments
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| arguments.to_string());
        (
            "spawn_agents".to_string(),
            json!({
                "agents": [{
                    "agent_type": name,
                    "prompt": prompt,
                    "params": arguments,
                }],
            }),
        )
    }

    fn reject(&self, message: String) {
        tracing::warn!(%message, "tool call rejected");
        let _ = self.events.send(AgentEvent::Error {
            message: message.clone(),
        });
        let mut records = self.shared.lock().expect("dispatch records poisoned");
        records.had_tool_call_error = true;
        records.user_errors.push(format!(
            "Error during tool call: {message}. Please check the tool name and arguments and try again."
        ));
    }

    /// A step-ending tool's result has been recorded.
    pub fn step_ended(&self) -> bool {
        self.shared.lock().expect("dispatch records poisoned").step_ended
    }

    pub fn last_result(&self) -> Option<ToolOutput> {
        self.shared
            .lock()
            .expect("dispatch records poisoned")
            .tool_results
            .last()
            .map(|record| record.output.clone())
    }

    /// Signal end-of-stream to gated handlers and await the spine's tail.
    pub async fn drain(&mut self) {
        self.stream_done.send_replace(true);
        if let Some(tail) = self.previous_finished.take() {
            let _ = tail.await;
        }
    }

    /// Consume the recorded effects. Call after [`drain`](Self::drain).
    pub fn take_records(&mut self) -> DispatchRecords {
        std::mem::take(&mut *self.shared.lock().expect("dispatch records poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use weft_contract::run::RunContext;
    use weft_contract::thread::ToolOutputPart;
    use weft_contract::tool::{Tool, ToolDescriptor};

    struct SleepyTool {
        name: &'static str,
        delay: Duration,
        ends: bool,
    }

    #[async_trait]
    impl Tool for SleepyTool {
        fn descriptor(&self) -> ToolDescriptor {
            let mut descriptor = ToolDescriptor::new(self.name, "test tool");
            descriptor.ends_agent_step = self.ends;
            descriptor
        }

        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(ToolOutput::text(self.name))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("boom", "always fails")
        }

        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Err(ToolError::ExecutionFailed("kaput".into()))
        }
    }

    fn dispatcher_with(
        tools: Vec<Arc<dyn Tool>>,
        spawnable: Vec<String>,
    ) -> (ToolDispatcher, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = ToolDispatcher::new(
            weft_contract::tool::tool_map(tools),
            spawnable,
            ToolContext::new(RunContext::for_tests()),
            CallIdGen::sequential(),
            events_tx,
        );
        (dispatcher, events_rx)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn effects_serialize_in_parse_order_despite_delays() {
        let (mut dispatcher, mut events_rx) = dispatcher_with(
            vec![
                Arc::new(SleepyTool {
                    name: "slow",
                    delay: Duration::from_millis(30),
                    ends: false,
                }),
                Arc::new(SleepyTool {
                    name: "fast",
                    delay: Duration::ZERO,
                    ends: false,
                }),
            ],
            vec![],
        );

        dispatcher.dispatch("slow", json!({}));
        dispatcher.dispatch("fast", json!({}));
        dispatcher.drain().await;

        let records = dispatcher.take_records();
        let names: Vec<&str> = records
            .tool_results
            .iter()
            .map(|r| r.call.name.as_str())
            .collect();
        assert_eq!(names, vec!["slow", "fast"], "recorded order is parse order");
        assert_eq!(records.tool_calls[0].id, "call_1");
        assert_eq!(records.tool_calls[1].id, "call_2");

        let events = drain_events(&mut events_rx);
        let order: Vec<(&str, String)> = events
            .iter()
            .map(|e| match e {
                AgentEvent::ToolCall { id, .. } => ("call", id.clone()),
                AgentEvent::ToolResult { id, .. } => ("result", id.clone()),
                other => ("other", other.type_name().to_string()),
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ("call", "call_1".to_string()),
                ("result", "call_1".to_string()),
                ("call", "call_2".to_string()),
                ("result", "call_2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_tool_queues_user_error_and_no_records() {
        let (mut dispatcher, mut events_rx) = dispatcher_with(vec![], vec![]);
        assert!(matches!(
            dispatcher.dispatch("nope", json!({})),
            Dispatched::Rejected
        ));
        dispatcher.drain().await;

        let records = dispatcher.take_records();
        assert!(records.tool_calls.is_empty());
        assert!(records.tool_results.is_empty());
        assert!(records.had_tool_call_error);
        assert_eq!(records.user_errors.len(), 1);
        assert!(records.user_errors[0].contains("Unknown tool 'nope'"));
        assert!(records.user_errors[0].contains("Please check the tool name"));

        let events = drain_events(&mut events_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AgentEvent::Error { message } if message.contains("nope")));
    }

    #[tokio::test]
    async fn invalid_arguments_rejected_without_orphans() {
        struct Strict;

        #[async_trait]
        impl Tool for Strict {
            fn descriptor(&self) -> ToolDescriptor {
                ToolDescriptor::new("spawn_agents", "spawn children").with_parameters(json!({
                    "type": "object",
                    "properties": { "agents": { "type": "array" } },
                    "required": ["agents"],
                }))
            }

            async fn execute(
                &self,
                _args: Value,
                _ctx: &ToolContext,
            ) -> Result<ToolOutput, ToolError> {
                Ok(ToolOutput::text("unreachable"))
            }
        }

        let (mut dispatcher, mut events_rx) = dispatcher_with(vec![Arc::new(Strict)], vec![]);
        assert!(matches!(
            dispatcher.dispatch("spawn_agents", json!({"agents": "not-an-array"})),
            Dispatched::Rejected
        ));
        dispatcher.drain().await;

        let records = dispatcher.take_records();
        assert!(records.tool_calls.is_empty());
        assert!(records.tool_results.is_empty());
        assert!(records.had_tool_call_error);
        assert!(records.user_errors[0].contains("Invalid parameters for spawn_agents"));

        let events = drain_events(&mut events_rx);
        assert!(
            matches!(&events[0], AgentEvent::Error { message } if message.contains("Invalid parameters for spawn_agents"))
        );
    }

    #[tokio::test]
    async fn second_end_tool_is_rejected() {
        let (mut dispatcher, mut events_rx) = dispatcher_with(
            vec![
                Arc::new(SleepyTool {
                    name: "task_completed",
                    delay: Duration::ZERO,
                    ends: true,
                }),
                Arc::new(SleepyTool {
                    name: "end_turn",
                    delay: Duration::ZERO,
                    ends: true,
                }),
            ],
            vec![],
        );

        assert!(matches!(
            dispatcher.dispatch("task_completed", json!({})),
            Dispatched::Running(_)
        ));
        assert!(matches!(
            dispatcher.dispatch("end_turn", json!({})),
            Dispatched::Rejected
        ));
        dispatcher.drain().await;

        let records = dispatcher.take_records();
        assert!(records.step_ended);
        assert_eq!(records.tool_results.len(), 1);
        assert_eq!(records.tool_results[0].call.name, "task_completed");
        assert!(records.user_errors[0].contains("end_turn"));
        assert!(!drain_events(&mut events_rx).is_empty());
    }

    #[tokio::test]
    async fn handler_failure_becomes_error_output() {
        let (mut dispatcher, mut events_rx) = dispatcher_with(vec![Arc::new(FailingTool)], vec![]);
        dispatcher.dispatch("boom", json!({}));
        dispatcher.drain().await;

        let records = dispatcher.take_records();
        assert_eq!(records.tool_results.len(), 1);
        let output = &records.tool_results[0].output;
        assert!(output.is_error());
        assert!(matches!(
            &output.parts[0],
            ToolOutputPart::ErrorJson(v) if v["error"].as_str().unwrap().contains("kaput")
        ));
        // Handler failure is a tool result, not an inline error event.
        assert!(records.user_errors.is_empty());
        assert!(!records.had_tool_call_error);
        let events = drain_events(&mut events_rx);
        assert!(events
            .iter()
            .all(|e| !matches!(e, AgentEvent::Error { .. })));
    }

    #[tokio::test]
    async fn abort_skips_not_yet_started_handlers() {
        let ctx = ToolContext::new(RunContext::for_tests());
        let token = ctx.run.cancellation.clone();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut dispatcher = ToolDispatcher::new(
            weft_contract::tool::tool_map(vec![
                Arc::new(SleepyTool {
                    name: "slow",
                    delay: Duration::from_millis(50),
                    ends: false,
                }) as Arc<dyn Tool>,
                Arc::new(SleepyTool {
                    name: "later",
                    delay: Duration::ZERO,
                    ends: false,
                }) as Arc<dyn Tool>,
            ]),
            vec![],
            ctx,
            CallIdGen::sequential(),
            events_tx,
        );

        dispatcher.dispatch("slow", json!({}));
        dispatcher.dispatch("later", json!({}));
        // Give the first handler time to start, then abort.
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        dispatcher.drain().await;

        let records = dispatcher.take_records();
        let names: Vec<&str> = records
            .tool_results
            .iter()
            .map(|r| r.call.name.as_str())
            .collect();
        assert_eq!(names, vec!["slow"], "in-flight settles, queued is skipped");
    }

    #[tokio::test]
    async fn spawnable_agent_name_rewrites_to_spawn_agents() {
        struct CaptureSpawn {
            seen: Arc<Mutex<Option<Value>>>,
        }

        #[async_trait]
        impl Tool for CaptureSpawn {
            fn descriptor(&self) -> ToolDescriptor {
                ToolDescriptor::new("spawn_agents", "spawn children")
            }

            async fn execute(
                &self,
                args: Value,
                _ctx: &ToolContext,
            ) -> Result<ToolOutput, ToolError> {
                *self.seen.lock().unwrap() = Some(args);
                Ok(ToolOutput::text("spawned"))
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let (mut dispatcher, _events_rx) = dispatcher_with(
            vec![Arc::new(CaptureSpawn { seen: seen.clone() })],
            vec!["reviewer".into()],
        );

        dispatcher.dispatch("reviewer", json!({"prompt": "check the diff"}));
        dispatcher.drain().await;

        let args = seen.lock().unwrap().clone().unwrap();
        assert_eq!(args["agents"][0]["agent_type"], "reviewer");
        assert_eq!(args["agents"][0]["prompt"], "check the diff");
        let records = dispatcher.take_records();
        assert_eq!(records.tool_calls[0].name, "spawn_agents");
    }

    #[tokio::test]
    async fn stream_end_gated_tool_waits_for_drain() {
        let (mut dispatcher, _events_rx) = dispatcher_with(
            vec![Arc::new({
                struct Gated;

                #[async_trait]
                impl Tool for Gated {
                    fn descriptor(&self) -> ToolDescriptor {
                        ToolDescriptor::new("summarize", "needs full stream").waits_for_stream()
                    }

                    async fn execute(
                        &self,
                        _args: Value,
                        _ctx: &ToolContext,
                    ) -> Result<ToolOutput, ToolError> {
                        Ok(ToolOutput::text("summary"))
                    }
                }
                Gated
            }) as Arc<dyn Tool>],
            vec![],
        );

        let Dispatched::Running(running) = dispatcher.dispatch("summarize", json!({})) else {
            panic!("expected running dispatch");
        };
        assert!(running.waits_for_stream_end);

        // Not complete until the stream is done.
        tokio::task::yield_now().await;
        assert!(dispatcher.take_records().tool_results.is_empty());

        dispatcher.drain().await;
        let records = dispatcher.take_records();
        assert_eq!(records.tool_results.len(), 1);
    }
}
