//! Structured error taxonomy shared across the runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Tool name not in the registry and not a spawnable agent.
    ToolUnknown,
    /// Tool arguments failed schema validation.
    ToolInputInvalid,
    /// A handler threw or a port returned an error.
    ToolHandlerError,
    /// The LLM port failed after its own retries.
    LlmTransport,
    /// The credit gate reported an insufficient balance.
    OutOfCredits,
    /// The user aborted the run.
    Aborted,
    /// A committed history violated a log invariant.
    InvariantBreach,
    /// Agent identifier did not resolve to a template.
    UnknownAgent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolUnknown => "tool_unknown",
            Self::ToolInputInvalid => "tool_input_invalid",
            Self::ToolHandlerError => "tool_handler_error",
            Self::LlmTransport => "llm_transport",
            Self::OutOfCredits => "out_of_credits",
            Self::Aborted => "aborted",
            Self::InvariantBreach => "invariant_breach",
            Self::UnknownAgent => "unknown_agent",
        }
    }
}

/// Runtime error carrying its classification.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn llm_transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LlmTransport, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantBreach, message)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "run aborted")
    }

    pub fn unknown_agent(identifier: &str) -> Self {
        Self::new(
            ErrorKind::UnknownAgent,
            format!("unknown agent '{identifier}'"),
        )
    }
}
