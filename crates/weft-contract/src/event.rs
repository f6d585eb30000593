//! Protocol-agnostic events emitted by a running agent.
//!
//! Consumers (TTY front-end, web surface) subscribe to this stream; the
//! runtime guarantees `tool_call` / `tool_result` pairs appear in parse
//! order, with a result always following its own call.

use crate::run::{AgentOutput, RunStatus};
use crate::thread::ToolOutput;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    RunStart {
        run_id: String,
        agent_id: String,
        parent_run_ids: Vec<String>,
    },
    StepStart {
        step: u32,
    },
    TextDelta {
        delta: String,
    },
    ReasoningDelta {
        delta: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: ToolOutput,
    },
    Error {
        message: String,
    },
    StepEnd {
        step: u32,
    },
    RunFinish {
        run_id: String,
        status: RunStatus,
        output: AgentOutput,
    },
}

impl AgentEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run_start",
            Self::StepStart { .. } => "step_start",
            Self::TextDelta { .. } => "text_delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
            Self::StepEnd { .. } => "step_end",
            Self::RunFinish { .. } => "run_finish",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialization_uses_snake_case_tags() {
        let event = AgentEvent::ToolCall {
            id: "call_1".into(),
            name: "read_files".into(),
            arguments: json!({"paths": ["a.ts"]}),
        };
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"type\":\"tool_call\""));
        let back: AgentEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn type_names_cover_variants() {
        assert_eq!(
            AgentEvent::TextDelta { delta: "x".into() }.type_name(),
            "text_delta"
        );
        assert_eq!(AgentEvent::StepEnd { step: 0 }.type_name(), "step_end");
    }
}
