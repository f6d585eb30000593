//! Agent template: the immutable descriptor a run is instantiated from.

use crate::thread::ToolOutput;
use serde_json::Value;
use std::sync::Arc;

/// How the orchestrator derives the terminal output of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Final assistant text.
    #[default]
    Text,
    /// The value handed to `task_completed`.
    StructuredOutput,
    /// The final committed message verbatim.
    LastMessage,
}

/// One command from a scripted step policy.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCommand {
    EmitText(String),
    CallTool { name: String, arguments: Value },
    WaitForTool,
    End,
}

/// Cursor over a scripted policy, advanced by the step runner.
///
/// `last_result` carries the most recent tool output once one is available.
pub trait ScriptCursor: Send {
    fn next(&mut self, last_result: Option<&ToolOutput>) -> ScriptCommand;
}

/// Factory for scripted step policies carried by a template.
pub trait StepProgram: Send + Sync {
    fn start(&self) -> Box<dyn ScriptCursor>;
}

/// Immutable agent descriptor, loaded once per run and cached by id.
#[derive(Clone)]
pub struct AgentTemplate {
    pub id: String,
    pub model: String,
    pub system_prompt: String,
    /// Appended as a user message at the top of every step.
    pub step_prompt: String,
    pub tool_names: Vec<String>,
    /// Agent ids this agent may spawn.
    pub spawnable_agents: Vec<String>,
    /// Schema for spawn-time params.
    pub input_schema: Option<Value>,
    pub output_mode: OutputMode,
    /// Child sees the parent's message history.
    pub include_message_history: bool,
    /// Child system prompt is prefixed with the parent's.
    pub inherit_parent_system_prompt: bool,
    /// Scripted policy driven instead of the model, when present.
    pub handle_steps: Option<Arc<dyn StepProgram>>,
}

impl std::fmt::Debug for AgentTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTemplate")
            .field("id", &self.id)
            .field("model", &self.model)
            .field(
                "system_prompt",
                &format!("[{} chars]", self.system_prompt.len()),
            )
            .field("tool_names", &self.tool_names)
            .field("spawnable_agents", &self.spawnable_agents)
            .field("output_mode", &self.output_mode)
            .field("handle_steps", &self.handle_steps.as_ref().map(|_| "<program>"))
            .finish()
    }
}

impl AgentTemplate {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            system_prompt: String::new(),
            step_prompt: String::new(),
            tool_names: Vec::new(),
            spawnable_agents: Vec::new(),
            input_schema: None,
            output_mode: OutputMode::default(),
            include_message_history: false,
            inherit_parent_system_prompt: false,
            handle_steps: None,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn with_step_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.step_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn with_tools(mut self, names: Vec<String>) -> Self {
        self.tool_names = names;
        self
    }

    #[must_use]
    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tool_names.push(name.into());
        self
    }

    #[must_use]
    pub fn with_spawnable_agents(mut self, agents: Vec<String>) -> Self {
        self.spawnable_agents = agents;
        self
    }

    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    #[must_use]
    pub fn include_message_history(mut self) -> Self {
        self.include_message_history = true;
        self
    }

    #[must_use]
    pub fn inherit_parent_system_prompt(mut self) -> Self {
        self.inherit_parent_system_prompt = true;
        self
    }

    #[must_use]
    pub fn with_handle_steps(mut self, program: Arc<dyn StepProgram>) -> Self {
        self.handle_steps = Some(program);
        self
    }
}
