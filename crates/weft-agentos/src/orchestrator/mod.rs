//! The agent orchestrator: outer loop over steps, spawn lifecycle, budgets,
//! abort propagation, and terminal mapping.

pub mod registry;
pub mod tools;

use crate::credits::{CreditGate, Preflight, Settlement};
use futures::StreamExt;
use registry::TemplateRegistry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tools::{
    ClientTool, EndTurn, SpawnAgents, SpawnAgentsAsync, TaskCompleted, END_TURN, SPAWN_AGENTS,
    SPAWN_AGENTS_ASYNC, TASK_COMPLETED,
};
use weft_agent_loop::{run_step, StepDisposition, StepPorts, StepSetup};
use weft_contract::error::{AgentError, ErrorKind};
use weft_contract::event::AgentEvent;
use weft_contract::ids::CallIdGen;
use weft_contract::ports::{
    CreditKind, Environment, LlmClient, RunFinishRecord, RunStartRecord, SpawnMode, SpawnRequest,
    SpawnedRun, Spawner, StepRecord, StepStatus, TelemetrySink, ToolClient,
};
use weft_contract::run::{AgentOutput, AgentState, RunContext, RunOutcome, RunStatus};
use weft_contract::template::{AgentTemplate, OutputMode};
use weft_contract::thread::{AssistantPart, Message};
use weft_contract::tool::{validate_against_schema, Tool, ToolContext, ToolRegistry};

/// Minimum balance required before a step is attempted.
const ESTIMATED_STEP_FLOOR: f64 = 1.0;
const DEFAULT_MAX_STEPS: u32 = 20;
const DEFAULT_SIBLING_CONCURRENCY: usize = 4;

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis().min(u128::from(u64::MAX)) as u64)
}

/// Inputs for a root run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub agent_id: String,
    pub prompt: String,
    pub params: Option<Value>,
    pub max_steps: Option<u32>,
}

impl RunRequest {
    pub fn new(agent_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            params: None,
            max_steps: None,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

/// Lifecycle entry for a run in this process.
#[derive(Debug, Clone)]
pub enum RunRecord {
    Running,
    Finished(RunOutcome),
}

/// The orchestrator. Holds the wiring a run executes against; cheap to
/// share behind an `Arc`.
pub struct AgentOs {
    registry: TemplateRegistry,
    llm: Arc<dyn LlmClient>,
    tool_client: Option<Arc<dyn ToolClient>>,
    base_tools: ToolRegistry,
    telemetry: Arc<dyn TelemetrySink>,
    credits: CreditGate,
    env: Environment,
    ids: CallIdGen,
    default_max_steps: u32,
    sibling_concurrency: usize,
    /// Child references are run ids into this table, never owning pointers.
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl AgentOs {
    pub fn new(
        registry: TemplateRegistry,
        llm: Arc<dyn LlmClient>,
        credits: CreditGate,
        telemetry: Arc<dyn TelemetrySink>,
        env: Environment,
    ) -> Self {
        Self {
            registry,
            llm,
            tool_client: None,
            base_tools: ToolRegistry::new(),
            telemetry,
            credits,
            env,
            ids: CallIdGen::default(),
            default_max_steps: DEFAULT_MAX_STEPS,
            sibling_concurrency: DEFAULT_SIBLING_CONCURRENCY,
            runs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_tool_client(mut self, client: Arc<dyn ToolClient>) -> Self {
        self.tool_client = Some(client);
        self
    }

    #[must_use]
    pub fn with_base_tools(mut self, tools: ToolRegistry) -> Self {
        self.base_tools = tools;
        self
    }

    #[must_use]
    pub fn with_call_ids(mut self, ids: CallIdGen) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_default_max_steps(mut self, max_steps: u32) -> Self {
        self.default_max_steps = max_steps;
        self
    }

    #[must_use]
    pub fn with_sibling_concurrency(mut self, concurrency: usize) -> Self {
        self.sibling_concurrency = concurrency.max(1);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Lifecycle lookup by run id.
    pub fn run_record(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.lock().expect("run table poisoned").get(run_id).cloned()
    }

    /// Run an agent to a terminal state, discarding the event stream.
    pub async fn run(self: &Arc<Self>, request: RunRequest, ctx: RunContext) -> RunOutcome {
        let (events, _drain) = mpsc::unbounded_channel();
        self.run_with_events(request, ctx, events).await
    }

    /// Run an agent to a terminal state, emitting [`AgentEvent`]s along the
    /// way. This never returns an error: every failure maps to a terminal
    /// outcome.
    pub async fn run_with_events(
        self: &Arc<Self>,
        request: RunRequest,
        ctx: RunContext,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> RunOutcome {
        let template = match self.registry.resolve(&request.agent_id).await {
            Ok(template) => template,
            Err(error) => {
                tracing::warn!(agent_id = %request.agent_id, error = %error, "agent resolution failed");
                return failed_outcome_for(
                    &ctx,
                    &request.agent_id,
                    AgentError::new(ErrorKind::UnknownAgent, error.to_string()),
                );
            }
        };
        let max_steps = request.max_steps.unwrap_or(self.default_max_steps);
        self.clone()
            .run_internal(
                template,
                ctx,
                request.prompt,
                request.params,
                max_steps,
                None,
                Vec::new(),
                events,
            )
            .await
    }

    fn mark_running(&self, run_id: &str) {
        self.runs
            .lock()
            .expect("run table poisoned")
            .insert(run_id.to_string(), RunRecord::Running);
    }

    fn mark_finished(&self, outcome: RunOutcome) {
        self.runs
            .lock()
            .expect("run table poisoned")
            .insert(outcome.run_id.clone(), RunRecord::Finished(outcome));
    }

    /// Resolve the tool set for a template. Step-ending tools are always
    /// available; spawn tools ride along with spawnable agents; names the
    /// runtime does not know fall through to the client port.
    fn step_registry(&self, template: &AgentTemplate) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in &template.tool_names {
            let tool: Option<Arc<dyn Tool>> = match name.as_str() {
                TASK_COMPLETED => Some(Arc::new(TaskCompleted)),
                END_TURN => Some(Arc::new(EndTurn)),
                SPAWN_AGENTS => Some(Arc::new(SpawnAgents)),
                SPAWN_AGENTS_ASYNC => Some(Arc::new(SpawnAgentsAsync)),
                other => {
                    if let Some(tool) = self.base_tools.get(other) {
                        Some(tool)
                    } else if self.tool_client.is_some() {
                        Some(Arc::new(ClientTool::new(other)))
                    } else {
                        tracing::warn!(tool = other, "template names an unavailable tool");
                        None
                    }
                }
            };
            if let Some(tool) = tool {
                register_quiet(&mut registry, tool);
            }
        }
        if !registry.contains(TASK_COMPLETED) {
            register_quiet(&mut registry, Arc::new(TaskCompleted));
        }
        if !registry.contains(END_TURN) {
            register_quiet(&mut registry, Arc::new(EndTurn));
        }
        if !template.spawnable_agents.is_empty() {
            if !registry.contains(SPAWN_AGENTS) {
                register_quiet(&mut registry, Arc::new(SpawnAgents));
            }
            if !registry.contains(SPAWN_AGENTS_ASYNC) {
                register_quiet(&mut registry, Arc::new(SpawnAgentsAsync));
            }
        }
        registry
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_internal(
        self: Arc<Self>,
        template: Arc<AgentTemplate>,
        ctx: RunContext,
        prompt: String,
        params: Option<Value>,
        max_steps: u32,
        parent_system_prompt: Option<String>,
        initial_history: Vec<Message>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> RunOutcome {
        let run_id = ctx.run_id.clone();

        if let (Some(schema), Some(params)) = (&template.input_schema, params.as_ref()) {
            if let Err(error) = validate_against_schema(schema, params) {
                return failed_outcome_for(
                    &ctx,
                    &template.id,
                    AgentError::new(
                        ErrorKind::ToolInputInvalid,
                        format!("invalid params for agent '{}': {error}", template.id),
                    ),
                );
            }
        }

        self.mark_running(&run_id);
        if let Err(error) = self
            .telemetry
            .start_run(RunStartRecord {
                run_id: run_id.clone(),
                parent_run_ids: ctx.parent_run_ids.clone(),
                agent_id: template.id.clone(),
                user_id: ctx.user_id.clone(),
                started_at_unix_ms: now_unix_ms(),
            })
            .await
        {
            tracing::warn!(error = %error, "telemetry start_run failed");
        }
        let _ = events.send(AgentEvent::RunStart {
            run_id: run_id.clone(),
            agent_id: template.id.clone(),
            parent_run_ids: ctx.parent_run_ids.clone(),
        });

        let mut state = AgentState::new(&template.id, max_steps);
        state.messages = initial_history;
        let prompt_text = match &params {
            Some(params) => format!("{prompt}\n\nParameters:\n{params}"),
            None => prompt,
        };
        state.messages.push(Message::user(prompt_text));

        let system_prompt = match parent_system_prompt {
            Some(parent) if template.inherit_parent_system_prompt && !parent.is_empty() => {
                format!("{parent}\n\n{}", template.system_prompt)
            }
            _ => template.system_prompt.clone(),
        };

        let shared_history = Arc::new(Mutex::new(state.messages.clone()));
        let spawner: Arc<dyn Spawner> = Arc::new(OsSpawner {
            os: self.clone(),
            parent_system_prompt: system_prompt.clone(),
            parent_history: shared_history.clone(),
            events: events.clone(),
        });
        let mut tool_ctx = ToolContext::new(ctx.clone()).with_spawner(spawner);
        if let Some(client) = &self.tool_client {
            tool_ctx = tool_ctx.with_client(client.clone());
        }

        let setup = StepSetup {
            model: template.model.clone(),
            system_prompt,
            step_prompt: template.step_prompt.clone(),
            registry: self.step_registry(&template),
            spawnable_agents: template.spawnable_agents.clone(),
            handle_steps: template.handle_steps.clone(),
        };
        let ports = StepPorts {
            llm: self.llm.clone(),
            ctx: tool_ctx,
            ids: self.ids.clone(),
            events: events.clone(),
        };

        let free = self.credits.is_free_tier(&template.id);
        let mut step_number: u32 = 0;
        let mut transport_retry_used = false;
        let mut terminal_error: Option<AgentError> = None;

        let status = loop {
            if ctx.cancellation.is_cancelled() {
                break RunStatus::Aborted;
            }
            if state.steps_remaining == 0 {
                break RunStatus::MaxSteps;
            }
            state.steps_remaining -= 1;

            if !free {
                match self.credits.preflight(&ctx.user_id, ESTIMATED_STEP_FLOOR).await {
                    Ok(Preflight::Ok) => {}
                    Ok(Preflight::Insufficient { balance }) => {
                        terminal_error = Some(AgentError::new(
                            ErrorKind::OutOfCredits,
                            format!("insufficient credits: balance {balance}"),
                        ));
                        break RunStatus::OutOfCredits;
                    }
                    Err(error) => {
                        terminal_error =
                            Some(AgentError::new(ErrorKind::OutOfCredits, error.to_string()));
                        break RunStatus::Error;
                    }
                }
            }

            step_number += 1;
            let started_at = now_unix_ms();
            let _ = events.send(AgentEvent::StepStart { step: step_number });
            tracing::debug!(run_id = %run_id, step = step_number, "step start");
            let outcome = run_step(&setup, &ports, &state.messages).await;
            let _ = events.send(AgentEvent::StepEnd { step: step_number });

            let (step_status, error_message) = match &outcome.disposition {
                StepDisposition::Committed { .. } => (StepStatus::Completed, None),
                StepDisposition::Aborted => (StepStatus::Aborted, None),
                StepDisposition::Failed(error) => (StepStatus::Error, Some(error.message.clone())),
            };
            if let Err(error) = self
                .telemetry
                .add_step(StepRecord {
                    run_id: run_id.clone(),
                    step_number,
                    credits: outcome.total_credits,
                    child_run_ids: outcome.spawned_run_ids.clone(),
                    message_id: outcome.message_id.clone(),
                    status: step_status,
                    error_message,
                    started_at_unix_ms: started_at,
                })
                .await
            {
                tracing::warn!(error = %error, "telemetry add_step failed");
            }

            match outcome.disposition {
                StepDisposition::Committed { ended } => {
                    state.messages = outcome.messages;
                    *shared_history.lock().expect("history mirror poisoned") =
                        state.messages.clone();
                    state.credits_used += outcome.total_credits;
                    state.direct_credits_used += outcome.direct_credits;
                    state.spawned_run_ids.extend(outcome.spawned_run_ids);

                    if !free && outcome.direct_credits > 0.0 {
                        let operation_id = format!("{run_id}:{step_number}");
                        match self
                            .credits
                            .settle(
                                &ctx.user_id,
                                outcome.direct_credits,
                                &operation_id,
                                ctx.repo_id.clone(),
                                CreditKind::Direct,
                            )
                            .await
                        {
                            Ok(Settlement::Charged { .. }) => {}
                            Ok(Settlement::Insufficient) => {
                                terminal_error = Some(AgentError::new(
                                    ErrorKind::OutOfCredits,
                                    "credit balance exhausted during settlement",
                                ));
                                break RunStatus::OutOfCredits;
                            }
                            Err(error) => {
                                terminal_error = Some(AgentError::new(
                                    ErrorKind::OutOfCredits,
                                    error.to_string(),
                                ));
                                break RunStatus::Error;
                            }
                        }
                    }
                    if ended {
                        break RunStatus::Completed;
                    }
                }
                StepDisposition::Aborted => {
                    state.messages = outcome.messages;
                    state.credits_used += outcome.total_credits;
                    state.direct_credits_used += outcome.direct_credits;
                    state.spawned_run_ids.extend(outcome.spawned_run_ids);
                    if !free && outcome.direct_credits > 0.0 {
                        let operation_id = format!("{run_id}:{step_number}");
                        if let Err(error) = self
                            .credits
                            .settle(
                                &ctx.user_id,
                                outcome.direct_credits,
                                &operation_id,
                                ctx.repo_id.clone(),
                                CreditKind::Direct,
                            )
                            .await
                        {
                            tracing::warn!(error = %error, "settlement after abort failed");
                        }
                    }
                    break RunStatus::Aborted;
                }
                StepDisposition::Failed(error) => {
                    if error.kind == ErrorKind::LlmTransport
                        && !transport_retry_used
                        && state.steps_remaining > 0
                    {
                        transport_retry_used = true;
                        tracing::warn!(error = %error, "transport failure, retrying step once");
                        continue;
                    }
                    terminal_error = Some(error);
                    break RunStatus::Error;
                }
            }
        };

        if status == RunStatus::Completed {
            state.output = extract_structured_output(&state.messages);
        }
        let output = terminal_output(&template, status, &state, terminal_error);

        if let Err(error) = self
            .telemetry
            .finish_run(RunFinishRecord {
                run_id: run_id.clone(),
                status,
                total_steps: step_number,
                direct_credits: state.direct_credits_used,
                total_credits: state.credits_used,
            })
            .await
        {
            tracing::warn!(error = %error, "telemetry finish_run failed");
        }

        let outcome = RunOutcome {
            run_id: run_id.clone(),
            agent_id: template.id.clone(),
            status,
            output: output.clone(),
            total_steps: step_number,
            credits_used: state.credits_used,
            direct_credits_used: state.direct_credits_used,
            spawned_run_ids: state.spawned_run_ids.clone(),
        };
        let _ = events.send(AgentEvent::RunFinish {
            run_id,
            status,
            output,
        });
        self.mark_finished(outcome.clone());
        outcome
    }

    async fn run_child(
        self: Arc<Self>,
        request: SpawnRequest,
        ctx: RunContext,
        parent_system_prompt: String,
        parent_history: Vec<Message>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> SpawnedRun {
        let run_id = ctx.run_id.clone();
        let template = match self.registry.resolve(&request.agent_type).await {
            Ok(template) => template,
            Err(error) => {
                tracing::warn!(agent = %request.agent_type, error = %error, "child agent resolution failed");
                let outcome = failed_outcome_for(
                    &ctx,
                    &request.agent_type,
                    AgentError::new(ErrorKind::UnknownAgent, error.to_string()),
                );
                self.mark_finished(outcome.clone());
                return SpawnedRun {
                    run_id,
                    agent_id: request.agent_type,
                    status: Some(outcome.status),
                    output: Some(outcome.output),
                    credits_used: 0.0,
                };
            }
        };

        let initial_history = if template.include_message_history {
            parent_history
        } else {
            Vec::new()
        };
        let max_steps = self.default_max_steps;
        let outcome = self
            .run_internal(
                template,
                ctx,
                request.prompt,
                request.params,
                max_steps,
                Some(parent_system_prompt),
                initial_history,
                events,
            )
            .await;

        SpawnedRun {
            run_id: outcome.run_id.clone(),
            agent_id: outcome.agent_id.clone(),
            status: Some(outcome.status),
            output: Some(outcome.output.clone()),
            credits_used: outcome.credits_used,
        }
    }
}

impl std::fmt::Debug for AgentOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOs")
            .field("registry", &self.registry)
            .field("llm", &self.llm.name())
            .field("default_max_steps", &self.default_max_steps)
            .field("sibling_concurrency", &self.sibling_concurrency)
            .finish()
    }
}

fn register_quiet(registry: &mut ToolRegistry, tool: Arc<dyn Tool>) {
    if let Err(error) = registry.register(tool) {
        tracing::warn!(error = %error, "duplicate tool registration skipped");
    }
}

fn failed_outcome_for(ctx: &RunContext, agent_id: &str, error: AgentError) -> RunOutcome {
    RunOutcome {
        run_id: ctx.run_id.clone(),
        agent_id: agent_id.to_string(),
        status: RunStatus::Error,
        output: AgentOutput::Error {
            kind: error.kind,
            message: error.message,
        },
        total_steps: 0,
        credits_used: 0.0,
        direct_credits_used: 0.0,
        spawned_run_ids: Vec::new(),
    }
}

/// The structured result recorded by `task_completed`, if the run ended
/// through it.
fn extract_structured_output(messages: &[Message]) -> Option<Value> {
    messages.iter().rev().find_map(|message| match message {
        Message::Assistant { parts } => parts.iter().rev().find_map(|part| match part {
            AssistantPart::ToolCall(call) if call.name == TASK_COMPLETED => Some(
                call.arguments
                    .get("result")
                    .cloned()
                    .unwrap_or_else(|| call.arguments.clone()),
            ),
            _ => None,
        }),
        _ => None,
    })
}

fn terminal_output(
    template: &AgentTemplate,
    status: RunStatus,
    state: &AgentState,
    terminal_error: Option<AgentError>,
) -> AgentOutput {
    match status {
        RunStatus::Completed | RunStatus::MaxSteps | RunStatus::Aborted => {
            match template.output_mode {
                OutputMode::Text => AgentOutput::Text {
                    text: state.last_assistant_text().unwrap_or_default(),
                },
                OutputMode::StructuredOutput => AgentOutput::StructuredOutput {
                    value: state.output.clone().unwrap_or(Value::Null),
                },
                OutputMode::LastMessage => AgentOutput::LastMessage {
                    message: state
                        .messages
                        .last()
                        .cloned()
                        .unwrap_or_else(|| Message::assistant_text("")),
                },
            }
        }
        RunStatus::OutOfCredits => AgentOutput::Error {
            kind: ErrorKind::OutOfCredits,
            message: terminal_error
                .map(|e| e.message)
                .unwrap_or_else(|| "insufficient credits".into()),
        },
        RunStatus::Error => {
            let error = terminal_error.unwrap_or_else(|| {
                AgentError::new(ErrorKind::ToolHandlerError, "run failed")
            });
            AgentOutput::Error {
                kind: error.kind,
                message: error.message,
            }
        }
    }
}

/// In-process spawn port handed to spawn tools; children recurse back into
/// the orchestrator with their own state and a linked abort token.
struct OsSpawner {
    os: Arc<AgentOs>,
    parent_system_prompt: String,
    /// Mirror of the parent's committed history, for children that opt in.
    parent_history: Arc<Mutex<Vec<Message>>>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

#[async_trait::async_trait]
impl Spawner for OsSpawner {
    async fn spawn(
        &self,
        requests: Vec<SpawnRequest>,
        mode: SpawnMode,
        parent: &RunContext,
    ) -> Result<Vec<SpawnedRun>, AgentError> {
        let history = self
            .parent_history
            .lock()
            .expect("history mirror poisoned")
            .clone();
        match mode {
            SpawnMode::Sync => {
                let children = requests.into_iter().map(|request| {
                    let os = self.os.clone();
                    let ctx = parent.child();
                    let system = self.parent_system_prompt.clone();
                    let history = history.clone();
                    let events = self.events.clone();
                    os.run_child(request, ctx, system, history, events)
                });
                // Bounded sibling concurrency, results in request order.
                let spawned = futures::stream::iter(children)
                    .buffered(self.os.sibling_concurrency)
                    .collect::<Vec<_>>()
                    .await;
                Ok(spawned)
            }
            SpawnMode::Async => {
                let mut spawned = Vec::with_capacity(requests.len());
                for request in requests {
                    let ctx = parent.child();
                    spawned.push(SpawnedRun {
                        run_id: ctx.run_id.clone(),
                        agent_id: request.agent_type.clone(),
                        status: None,
                        output: None,
                        credits_used: 0.0,
                    });
                    let os = self.os.clone();
                    let system = self.parent_system_prompt.clone();
                    let history = history.clone();
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let child = os.run_child(request, ctx, system, history, events).await;
                        tracing::debug!(
                            run_id = %child.run_id,
                            status = ?child.status,
                            "async child settled"
                        );
                    });
                }
                Ok(spawned)
            }
        }
    }
}
