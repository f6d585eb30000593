//! Shared contracts for the weft agent runtime.
//!
//! This crate holds the data model (conversation history, tool calls and
//! outputs), the tool trait and registry, the narrow ports the runtime
//! depends on, and the structured error taxonomy. It contains no runtime
//! logic; `weft-agent-loop` and `weft-agentos` build on it.

pub mod error;
pub mod event;
pub mod identifier;
pub mod ids;
pub mod ports;
pub mod run;
pub mod template;
pub mod testing;
pub mod thread;
pub mod tool;

pub use error::{AgentError, ErrorKind};
pub use event::AgentEvent;
pub use identifier::{AgentIdentifier, IdentifierError, VersionSpec};
pub use ids::{gen_message_id, CallIdGen};
pub use run::{AgentOutput, AgentState, RunContext, RunOutcome, RunStatus};
pub use template::{AgentTemplate, OutputMode, ScriptCommand, ScriptCursor, StepProgram};
pub use thread::{
    validate_history, AssistantPart, HistoryViolation, Message, ToolCall, ToolOutput,
    ToolOutputPart,
};
pub use tool::{
    tool_map, FileLocks, Tool, ToolContext, ToolDescriptor, ToolError, ToolRegistry,
    ToolRegistryError, TypedTool,
};
