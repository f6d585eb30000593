//! One agent step: prepare, stream, dispatch, finalize.

use crate::engine::tag_parser::{InlineEvent, InlineToolParser};
use crate::runtime::dispatcher::{Dispatched, ToolDispatcher};
use crate::runtime::run_context::{await_or_cancel, CancelAware};
use crate::runtime::streaming::StreamTally;
use crate::runtime::transcript::StepTranscript;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use weft_contract::error::AgentError;
use weft_contract::event::AgentEvent;
use weft_contract::ids::CallIdGen;
use weft_contract::ports::{LlmClient, LlmEvent, LlmRequest, LlmUsage};
use weft_contract::template::{ScriptCommand, StepProgram};
use weft_contract::thread::{Message, ToolOutput};
use weft_contract::tool::{ToolContext, ToolRegistry};

/// Step lifecycle, logged at transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Preparing,
    Streaming,
    Draining,
    Committed,
    Aborted,
    Failed,
}

/// How the step ended.
#[derive(Debug)]
pub enum StepDisposition {
    /// Log committed. `ended` is set when a step-ending tool landed.
    Committed { ended: bool },
    /// Abort observed; partial results committed with an interruption
    /// marker.
    Aborted,
    /// Transport failure or invariant breach; the log is unchanged.
    Failed(AgentError),
}

/// Everything one step produced.
#[derive(Debug)]
pub struct StepOutcome {
    pub disposition: StepDisposition,
    /// The committed history (the pre-step history for failed steps).
    pub messages: Vec<Message>,
    pub message_id: Option<String>,
    pub usage: LlmUsage,
    /// This agent's own charges for the step.
    pub direct_credits: f64,
    /// Own charges plus finished children spawned this step.
    pub total_credits: f64,
    pub spawned_run_ids: Vec<String>,
    pub had_tool_call_error: bool,
}

/// Immutable per-step configuration, resolved from the template.
#[derive(Clone)]
pub struct StepSetup {
    pub model: String,
    /// Fully composed (parent inheritance already applied).
    pub system_prompt: String,
    /// Rendered into the request each step, not persisted to the log.
    pub step_prompt: String,
    pub registry: ToolRegistry,
    pub spawnable_agents: Vec<String>,
    pub handle_steps: Option<Arc<dyn StepProgram>>,
}

/// Ports and context one step executes against.
#[derive(Clone)]
pub struct StepPorts {
    pub llm: Arc<dyn LlmClient>,
    pub ctx: ToolContext,
    pub ids: CallIdGen,
    pub events: mpsc::UnboundedSender<AgentEvent>,
}

fn build_request(setup: &StepSetup, history: &[Message]) -> LlmRequest {
    let mut messages = history.to_vec();
    if !setup.step_prompt.is_empty() {
        messages.push(Message::user(setup.step_prompt.clone()));
    }
    LlmRequest {
        model: setup.model.clone(),
        system: (!setup.system_prompt.is_empty()).then(|| setup.system_prompt.clone()),
        messages,
        tools: setup.registry.descriptors(),
    }
}

fn failed_outcome(history: &[Message], error: AgentError) -> StepOutcome {
    tracing::warn!(error = %error, "step failed");
    StepOutcome {
        disposition: StepDisposition::Failed(error),
        messages: history.to_vec(),
        message_id: None,
        usage: LlmUsage::default(),
        direct_credits: 0.0,
        total_credits: 0.0,
        spawned_run_ids: Vec::new(),
        had_tool_call_error: false,
    }
}

/// Run one agent step against `history`.
///
/// Stop criteria: parser end, abort, a step-ending tool's result landing,
/// or a transport failure. The committed history is returned rather than
/// written in place; the caller owns the agent state.
pub async fn run_step(setup: &StepSetup, ports: &StepPorts, history: &[Message]) -> StepOutcome {
    let mut phase = StepPhase::Preparing;
    tracing::debug!(model = %setup.model, ?phase, "step start");

    let transcript = StepTranscript::snapshot(history);
    let dispatcher = ToolDispatcher::new(
        setup.registry.clone(),
        setup.spawnable_agents.clone(),
        ports.ctx.clone(),
        ports.ids.clone(),
        ports.events.clone(),
    );

    if let Some(program) = setup.handle_steps.clone() {
        return run_scripted_step(program, transcript, dispatcher, ports, history).await;
    }

    let request = build_request(setup, history);
    let stream = match ports.llm.stream(request).await {
        Ok(stream) => stream,
        Err(err) => return failed_outcome(history, AgentError::llm_transport(err.to_string())),
    };

    phase = StepPhase::Streaming;
    tracing::debug!(?phase, "stream opened");

    let token = ports.ctx.run.cancellation.clone();
    let mut stream = stream;
    let mut transcript = transcript;
    let mut dispatcher = dispatcher;
    let mut tally = StreamTally::new();
    let mut inline = InlineToolParser::new();
    let mut aborted = token.is_cancelled();
    let mut transport_error: Option<AgentError> = None;

    'stream: while !aborted {
        let next = match await_or_cancel(&token, stream.next()).await {
            CancelAware::Cancelled => {
                aborted = true;
                break;
            }
            CancelAware::Value(next) => next,
        };
        let Some(event) = next else { break };
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                transport_error = Some(AgentError::llm_transport(err.to_string()));
                break;
            }
        };

        match event {
            LlmEvent::TextDelta(delta) => {
                tally.note_text(&delta);
                for inline_event in inline.push(&delta) {
                    match inline_event {
                        InlineEvent::Text(text) => {
                            transcript.push_text(&text);
                            let _ = ports.events.send(AgentEvent::TextDelta { delta: text });
                        }
                        InlineEvent::ToolCall { name, arguments } => {
                            if let Dispatched::Running(running) =
                                dispatcher.dispatch(&name, arguments)
                            {
                                // Text after the closing tag must follow the
                                // tool's result, so the parser waits here.
                                // Stream-gated tools are the exception: they
                                // resolve during drain.
                                if !running.waits_for_stream_end {
                                    if let CancelAware::Cancelled =
                                        await_or_cancel(&token, running.completed).await
                                    {
                                        aborted = true;
                                        break 'stream;
                                    }
                                }
                            }
                            if dispatcher.step_ended() {
                                break 'stream;
                            }
                        }
                    }
                }
            }
            LlmEvent::ReasoningDelta(delta) => {
                let _ = ports.events.send(AgentEvent::ReasoningDelta { delta });
            }
            LlmEvent::ToolCall(call) => {
                if let Dispatched::Running(running) = dispatcher.dispatch(&call.name, call.arguments)
                {
                    if running.ends_step && !running.waits_for_stream_end {
                        if let CancelAware::Cancelled =
                            await_or_cancel(&token, running.completed).await
                        {
                            aborted = true;
                            break;
                        }
                    }
                }
                if dispatcher.step_ended() {
                    break;
                }
            }
            LlmEvent::End(end) => tally.note_end(end),
        }
    }

    if !aborted && transport_error.is_none() && !dispatcher.step_ended() {
        for inline_event in inline.finish() {
            if let InlineEvent::Text(text) = inline_event {
                transcript.push_text(&text);
                let _ = ports.events.send(AgentEvent::TextDelta { delta: text });
            }
        }
    }

    phase = StepPhase::Draining;
    tracing::debug!(?phase, aborted, "draining dispatch spine");
    dispatcher.drain().await;

    if let Some(error) = transport_error {
        return failed_outcome(history, error);
    }

    finalize(transcript, dispatcher, tally, aborted, history)
}

fn finalize(
    transcript: StepTranscript,
    mut dispatcher: ToolDispatcher,
    tally: StreamTally,
    aborted: bool,
    history: &[Message],
) -> StepOutcome {
    let records = dispatcher.take_records();
    let ended = records.step_ended;
    let had_tool_call_error = records.had_tool_call_error;
    let usage = tally.usage();
    let direct_credits = usage.credits_used + records.direct_credits;
    let total_credits = direct_credits + records.spawned_credits;
    let spawned_run_ids = records.spawned_run_ids.clone();
    let message_id = tally.message_id().map(str::to_string);

    match transcript.commit(records, aborted) {
        Ok(messages) => {
            let phase = if aborted {
                StepPhase::Aborted
            } else {
                StepPhase::Committed
            };
            tracing::debug!(?phase, ended, "step finalized");
            StepOutcome {
                disposition: if aborted {
                    StepDisposition::Aborted
                } else {
                    StepDisposition::Committed { ended }
                },
                messages,
                message_id,
                usage,
                direct_credits,
                total_credits,
                spawned_run_ids,
                had_tool_call_error,
            }
        }
        Err(error) => failed_outcome(history, error),
    }
}

async fn run_scripted_step(
    program: Arc<dyn StepProgram>,
    mut transcript: StepTranscript,
    mut dispatcher: ToolDispatcher,
    ports: &StepPorts,
    history: &[Message],
) -> StepOutcome {
    let token = ports.ctx.run.cancellation.clone();
    let mut cursor = program.start();
    let mut last: Option<ToolOutput> = None;
    let mut pending: Option<oneshot::Receiver<()>> = None;
    let mut aborted = false;
    let mut script_ended = false;

    loop {
        if token.is_cancelled() {
            aborted = true;
            break;
        }
        match cursor.next(last.as_ref()) {
            ScriptCommand::EmitText(text) => {
                transcript.push_text(&text);
                let _ = ports.events.send(AgentEvent::TextDelta { delta: text });
            }
            ScriptCommand::CallTool { name, arguments } => {
                if let Dispatched::Running(running) = dispatcher.dispatch(&name, arguments) {
                    pending = Some(running.completed);
                }
                if dispatcher.step_ended() {
                    break;
                }
            }
            ScriptCommand::WaitForTool => {
                if let Some(ticket) = pending.take() {
                    if let CancelAware::Cancelled = await_or_cancel(&token, ticket).await {
                        aborted = true;
                        break;
                    }
                    last = dispatcher.last_result();
                }
                if dispatcher.step_ended() {
                    break;
                }
            }
            ScriptCommand::End => {
                script_ended = true;
                break;
            }
        }
    }

    dispatcher.drain().await;
    let mut outcome = finalize(transcript, dispatcher, StreamTally::new(), aborted, history);
    if script_ended {
        if let StepDisposition::Committed { ended } = outcome.disposition {
            outcome.disposition = StepDisposition::Committed { ended: ended || script_ended };
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use weft_contract::ports::StreamEnd;
    use weft_contract::run::RunContext;
    use weft_contract::testing::{ScriptedEvent, ScriptedLlm};
    use weft_contract::thread::{AssistantPart, ToolCall};
    use weft_contract::tool::{tool_map, Tool, ToolDescriptor, ToolError};

    struct JsonTool {
        name: &'static str,
        delay: Duration,
        ends: bool,
        response: Value,
    }

    #[async_trait]
    impl Tool for JsonTool {
        fn descriptor(&self) -> ToolDescriptor {
            let mut descriptor = ToolDescriptor::new(self.name, "test tool");
            descriptor.ends_agent_step = self.ends;
            descriptor
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(ToolOutput::json(self.response.clone()))
        }
    }

    fn setup_with(tools: Vec<Arc<dyn Tool>>) -> StepSetup {
        StepSetup {
            model: "test-model".into(),
            system_prompt: "You are a coding agent.".into(),
            step_prompt: String::new(),
            registry: tool_map(tools),
            spawnable_agents: Vec::new(),
            handle_steps: None,
        }
    }

    fn ports_with(llm: ScriptedLlm) -> (StepPorts, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ports = StepPorts {
            llm: Arc::new(llm),
            ctx: ToolContext::new(RunContext::for_tests()),
            ids: CallIdGen::sequential(),
            events: events_tx,
        };
        (ports, events_rx)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn end(message_id: &str) -> LlmEvent {
        LlmEvent::End(StreamEnd {
            message_id: message_id.into(),
            usage: LlmUsage {
                input_tokens: 100,
                output_tokens: 20,
                credits_used: 1.0,
            },
        })
    }

    #[tokio::test]
    async fn happy_path_single_tool() {
        let llm = ScriptedLlm::new();
        llm.push_events(vec![
            LlmEvent::TextDelta("ok: ".into()),
            LlmEvent::ToolCall(ToolCall::new(
                "ignored",
                "read_files",
                json!({"paths": ["a.ts"]}),
            )),
            end("msg_1"),
        ]);
        let setup = setup_with(vec![Arc::new(JsonTool {
            name: "read_files",
            delay: Duration::ZERO,
            ends: false,
            response: json!({"a.ts": "x"}),
        })]);
        let (ports, mut events_rx) = ports_with(llm);

        let outcome = run_step(&setup, &ports, &[Message::user("list files")]).await;

        assert!(matches!(
            outcome.disposition,
            StepDisposition::Committed { ended: false }
        ));
        assert!(!outcome.had_tool_call_error);
        assert_eq!(outcome.message_id.as_deref(), Some("msg_1"));
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(
            outcome.messages[1].as_assistant_text().as_deref(),
            Some("ok: ")
        );
        assert_eq!(outcome.messages[1].tool_call_ids(), vec!["call_1"]);
        assert!(matches!(
            &outcome.messages[2],
            Message::Tool { tool_call_id, .. } if tool_call_id == "call_1"
        ));

        let events = drain_events(&mut events_rx);
        let kinds: Vec<&str> = events.iter().map(AgentEvent::type_name).collect();
        assert_eq!(kinds, vec!["text_delta", "tool_call", "tool_result"]);
    }

    #[tokio::test]
    async fn schema_invalid_call_leaves_no_tool_messages() {
        struct StrictSpawn;

        #[async_trait]
        impl Tool for StrictSpawn {
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
                unreachable!("validation must reject first")
            }
        }

        let llm = ScriptedLlm::new();
        llm.push_events(vec![
            LlmEvent::ToolCall(ToolCall::new(
                "x",
                "spawn_agents",
                json!({"agents": "not-an-array"}),
            )),
            end("msg_2"),
        ]);
        let setup = setup_with(vec![Arc::new(StrictSpawn)]);
        let (ports, mut events_rx) = ports_with(llm);

        let outcome = run_step(&setup, &ports, &[]).await;

        assert!(outcome.had_tool_call_error);
        // No assistant tool-call part, no tool message; only the user error.
        assert_eq!(outcome.messages.len(), 1);
        assert!(matches!(
            &outcome.messages[0],
            Message::User { content }
                if content.contains("Error during tool call")
                    && content.contains("Invalid parameters for spawn_agents")
        ));

        let events = drain_events(&mut events_rx);
        let kinds: Vec<&str> = events.iter().map(AgentEvent::type_name).collect();
        assert_eq!(kinds, vec!["error"]);
        assert!(matches!(
            &events[0],
            AgentEvent::Error { message } if message.contains("Invalid parameters for spawn_agents")
        ));
    }

    #[tokio::test]
    async fn commit_waits_for_slow_handler() {
        let llm = ScriptedLlm::new();
        llm.push_events(vec![
            LlmEvent::ToolCall(ToolCall::new("x", "slow_tool", json!({}))),
            end("msg_3"),
        ]);
        let setup = setup_with(vec![Arc::new(JsonTool {
            name: "slow_tool",
            delay: Duration::from_millis(20),
            ends: false,
            response: json!({"done": true}),
        })]);
        let (ports, mut events_rx) = ports_with(llm);

        let outcome = run_step(&setup, &ports, &[]).await;

        assert!(matches!(
            outcome.disposition,
            StepDisposition::Committed { ended: false }
        ));
        assert_eq!(outcome.messages[0].tool_call_ids(), vec!["call_1"]);
        assert!(matches!(&outcome.messages[1], Message::Tool { .. }));

        let kinds: Vec<&str> = drain_events(&mut events_rx)
            .iter()
            .map(AgentEvent::type_name)
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["tool_call", "tool_result"]);
    }

    #[tokio::test]
    async fn end_turn_stops_consuming_the_stream() {
        let llm = ScriptedLlm::new();
        llm.push_events(vec![
            LlmEvent::ToolCall(ToolCall::new("x", "end_turn", json!({}))),
            LlmEvent::TextDelta("ignored".into()),
            end("msg_4"),
        ]);
        let setup = setup_with(vec![Arc::new(JsonTool {
            name: "end_turn",
            delay: Duration::ZERO,
            ends: true,
            response: json!({}),
        })]);
        let (ports, _events_rx) = ports_with(llm);

        let outcome = run_step(&setup, &ports, &[]).await;

        assert!(matches!(
            outcome.disposition,
            StepDisposition::Committed { ended: true }
        ));
        for message in &outcome.messages {
            if let Some(text) = message.as_assistant_text() {
                assert!(!text.contains("ignored"));
            }
        }
    }

    #[tokio::test]
    async fn abort_mid_stream_commits_marker() {
        let llm = ScriptedLlm::new();
        llm.push_script(vec![
            ScriptedEvent::now(LlmEvent::TextDelta("partial ".into())),
            ScriptedEvent::after(5_000, LlmEvent::TextDelta("never arrives".into())),
        ]);
        let setup = setup_with(vec![]);
        let (ports, mut events_rx) = ports_with(llm);
        let token = ports.ctx.run.cancellation.clone();

        let abort = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let outcome = run_step(&setup, &ports, &[Message::user("go")]).await;
        abort.await.unwrap();

        assert!(matches!(outcome.disposition, StepDisposition::Aborted));
        let text = outcome.messages[1].as_assistant_text().unwrap();
        assert!(text.starts_with("partial "));
        assert!(text.ends_with("[Request interrupted by user]"));
        assert!(outcome.message_id.is_none());

        let kinds: Vec<&str> = drain_events(&mut events_rx)
            .iter()
            .map(AgentEvent::type_name)
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["text_delta"]);
    }

    #[tokio::test]
    async fn inline_tag_call_dispatches_and_orders_text() {
        let llm = ScriptedLlm::new();
        llm.push_events(vec![
            LlmEvent::TextDelta("before <read_files><paths>[\"a.ts\"]</paths></read_files> after".into()),
            end("msg_5"),
        ]);
        let setup = setup_with(vec![Arc::new(JsonTool {
            name: "read_files",
            delay: Duration::from_millis(10),
            ends: false,
            response: json!({"a.ts": "x"}),
        })]);
        let (ports, mut events_rx) = ports_with(llm);

        let outcome = run_step(&setup, &ports, &[]).await;

        let kinds: Vec<&str> = drain_events(&mut events_rx)
            .iter()
            .map(AgentEvent::type_name)
            .collect::<Vec<_>>();
        // Post-tag text is emitted after the tool result.
        assert_eq!(
            kinds,
            vec!["text_delta", "tool_call", "tool_result", "text_delta"]
        );

        // History commits text parts first, then tool-call parts.
        let parts = match &outcome.messages[0] {
            Message::Assistant { parts } => parts,
            other => panic!("expected assistant message, got {other:?}"),
        };
        assert_eq!(parts.len(), 2, "merged text then the call part: {parts:?}");
        assert!(matches!(&parts[0], AssistantPart::Text { text } if text == "before  after"));
        assert!(matches!(&parts[1], AssistantPart::ToolCall(_)));
    }

    #[tokio::test]
    async fn transport_error_fails_step_without_commit() {
        let llm = ScriptedLlm::new();
        // No scripts queued: stream() itself errors.
        let setup = setup_with(vec![]);
        let (ports, _events_rx) = ports_with(llm);

        let history = vec![Message::user("hello")];
        let outcome = run_step(&setup, &ports, &history).await;

        match outcome.disposition {
            StepDisposition::Failed(error) => {
                assert_eq!(error.kind, weft_contract::error::ErrorKind::LlmTransport)
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(outcome.messages, history);
    }

    #[tokio::test]
    async fn step_prompt_is_rendered_but_not_persisted() {
        let llm = ScriptedLlm::new();
        llm.push_events(vec![LlmEvent::TextDelta("done".into()), end("msg_6")]);
        let mut setup = setup_with(vec![]);
        setup.step_prompt = "Continue the task.".into();
        let llm_handle = llm.clone();
        let (ports, _events_rx) = ports_with(llm);

        let outcome = run_step(&setup, &ports, &[Message::user("start")]).await;

        let request = &llm_handle.requests()[0];
        assert!(matches!(
            request.messages.last().unwrap(),
            Message::User { content } if content == "Continue the task."
        ));
        // Persisted history gains only the assistant turn.
        assert_eq!(outcome.messages.len(), 2);
    }

    struct TwoCallScript;

    struct TwoCallCursor {
        stage: usize,
    }

    impl weft_contract::template::ScriptCursor for TwoCallCursor {
        fn next(&mut self, last: Option<&ToolOutput>) -> ScriptCommand {
            self.stage += 1;
            match self.stage {
                1 => ScriptCommand::EmitText("running checks".into()),
                2 => ScriptCommand::CallTool {
                    name: "read_files".into(),
                    arguments: json!({"paths": ["a.ts"]}),
                },
                3 => ScriptCommand::WaitForTool,
                _ => {
                    assert!(last.is_some(), "script sees the awaited result");
                    ScriptCommand::End
                }
            }
        }
    }

    impl StepProgram for TwoCallScript {
        fn start(&self) -> Box<dyn weft_contract::template::ScriptCursor> {
            Box::new(TwoCallCursor { stage: 0 })
        }
    }

    #[tokio::test]
    async fn scripted_step_drives_tools_without_llm() {
        let llm = ScriptedLlm::new(); // never called
        let mut setup = setup_with(vec![Arc::new(JsonTool {
            name: "read_files",
            delay: Duration::ZERO,
            ends: false,
            response: json!({"a.ts": "x"}),
        })]);
        setup.handle_steps = Some(Arc::new(TwoCallScript));
        let llm_handle = llm.clone();
        let (ports, _events_rx) = ports_with(llm);

        let outcome = run_step(&setup, &ports, &[]).await;

        assert!(llm_handle.requests().is_empty(), "script bypasses inference");
        assert!(matches!(
            outcome.disposition,
            StepDisposition::Committed { ended: true }
        ));
        assert_eq!(outcome.messages[0].tool_call_ids(), vec!["call_1"]);
        assert!(matches!(&outcome.messages[1], Message::Tool { .. }));
    }
}
