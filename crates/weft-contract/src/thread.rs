//! Conversation history model: messages, assistant parts, tool outputs.
//!
//! The history is append-only during a step; the step runner replaces it
//! wholesale at commit time. [`validate_history`] checks the pairing and
//! adjacency rules every committed history must satisfy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Process-unique call identifier, assigned at parse time.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as JSON.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One ordered piece of an assistant message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantPart {
    Text { text: String },
    ToolCall(ToolCall),
}

/// One typed piece of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum ToolOutputPart {
    Text(String),
    Json(Value),
    ErrorText(String),
    ErrorJson(Value),
    Media(Value),
}

impl ToolOutputPart {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::ErrorText(_) | Self::ErrorJson(_))
    }
}

/// The full result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub parts: Vec<ToolOutputPart>,
    /// Credits charged directly by this handler (LLM sub-calls, client work).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub credits_used: f64,
    /// Credits accumulated by child agents this handler spawned.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub spawned_credits: f64,
    /// Run ids of child agents this handler spawned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spawned_run_ids: Vec<String>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::from_part(ToolOutputPart::Text(text.into()))
    }

    pub fn json(value: Value) -> Self {
        Self::from_part(ToolOutputPart::Json(value))
    }

    pub fn error_text(text: impl Into<String>) -> Self {
        Self::from_part(ToolOutputPart::ErrorText(text.into()))
    }

    pub fn error_json(value: Value) -> Self {
        Self::from_part(ToolOutputPart::ErrorJson(value))
    }

    fn from_part(part: ToolOutputPart) -> Self {
        Self {
            parts: vec![part],
            credits_used: 0.0,
            spawned_credits: 0.0,
            spawned_run_ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_credits(mut self, credits: f64) -> Self {
        self.credits_used = credits;
        self
    }

    pub fn is_error(&self) -> bool {
        self.parts.iter().any(ToolOutputPart::is_error)
    }

    /// Render the output as plain text for providers that take string tool
    /// results.
    pub fn render_text(&self) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                ToolOutputPart::Text(t) | ToolOutputPart::ErrorText(t) => t.clone(),
                ToolOutputPart::Json(v)
                | ToolOutputPart::ErrorJson(v)
                | ToolOutputPart::Media(v) => v.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A message in the conversation, tagged by role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        parts: Vec<AssistantPart>,
    },
    Tool {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        output: Vec<ToolOutputPart>,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::Assistant {
            parts: vec![AssistantPart::Text { text: text.into() }],
        }
    }

    pub fn assistant(parts: Vec<AssistantPart>) -> Self {
        Self::Assistant { parts }
    }

    pub fn tool(call: &ToolCall, output: &ToolOutput) -> Self {
        Self::Tool {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output: output.parts.clone(),
        }
    }

    /// Ids of the tool-call parts carried by this message, in part order.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match self {
            Self::Assistant { parts } => parts
                .iter()
                .filter_map(|p| match p {
                    AssistantPart::ToolCall(call) => Some(call.id.as_str()),
                    AssistantPart::Text { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Concatenated text of an assistant message, `None` for other roles.
    pub fn as_assistant_text(&self) -> Option<String> {
        match self {
            Self::Assistant { parts } => Some(
                parts
                    .iter()
                    .filter_map(|p| match p {
                        AssistantPart::Text { text } => Some(text.as_str()),
                        AssistantPart::ToolCall(_) => None,
                    })
                    .collect::<Vec<_>>()
                    .join(""),
            ),
            _ => None,
        }
    }
}

/// A history rule broken by a candidate commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryViolation {
    /// Tool message whose id matches no preceding assistant tool call.
    #[error("orphan tool message for call '{tool_call_id}'")]
    OrphanToolMessage { tool_call_id: String },
    /// Two tool messages answer the same call id.
    #[error("duplicate tool message for call '{tool_call_id}'")]
    DuplicateToolMessage { tool_call_id: String },
    /// Tool messages do not form a contiguous, in-order block directly after
    /// their assistant message.
    #[error("tool messages for assistant at index {assistant_index} are not adjacent and in call order")]
    NonAdjacentToolBlock { assistant_index: usize },
}

/// Check the committed-history invariants.
///
/// Every tool message must answer exactly one earlier assistant tool-call
/// part, and the tool messages for an assistant message must appear as a
/// contiguous block immediately after it, in the same order as the calls.
pub fn validate_history(messages: &[Message]) -> Result<(), HistoryViolation> {
    use std::collections::HashSet;

    let mut answered: HashSet<&str> = HashSet::new();
    let mut seen_calls: HashSet<&str> = HashSet::new();

    for (idx, message) in messages.iter().enumerate() {
        match message {
            Message::Assistant { .. } => {
                let call_ids = message.tool_call_ids();
                for id in &call_ids {
                    seen_calls.insert(*id);
                }
                if call_ids.is_empty() {
                    continue;
                }
                // The next call_ids.len() messages must be the matching tool
                // messages, in order.
                for (offset, expected_id) in call_ids.iter().enumerate() {
                    match messages.get(idx + 1 + offset) {
                        Some(Message::Tool { tool_call_id, .. })
                            if tool_call_id.as_str() == *expected_id => {}
                        _ => {
                            return Err(HistoryViolation::NonAdjacentToolBlock {
                                assistant_index: idx,
                            })
                        }
                    }
                }
            }
            Message::Tool { tool_call_id, .. } => {
                if !seen_calls.contains(tool_call_id.as_str()) {
                    return Err(HistoryViolation::OrphanToolMessage {
                        tool_call_id: tool_call_id.clone(),
                    });
                }
                if !answered.insert(tool_call_id.as_str()) {
                    return Err(HistoryViolation::DuplicateToolMessage {
                        tool_call_id: tool_call_id.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "read_files", json!({"paths": ["a.ts"]}))
    }

    fn assistant_with_calls(ids: &[&str]) -> Message {
        let mut parts = vec![AssistantPart::Text {
            text: "ok: ".into(),
        }];
        parts.extend(ids.iter().map(|id| AssistantPart::ToolCall(call(id))));
        Message::assistant(parts)
    }

    fn tool_msg(id: &str) -> Message {
        Message::tool(&call(id), &ToolOutput::json(json!({"a.ts": "x"})))
    }

    #[test]
    fn paired_history_is_valid() {
        let history = vec![
            Message::user("list files"),
            assistant_with_calls(&["call_1", "call_2"]),
            tool_msg("call_1"),
            tool_msg("call_2"),
            Message::user("Error during tool call: ..."),
        ];
        assert!(validate_history(&history).is_ok());
    }

    #[test]
    fn orphan_tool_message_rejected() {
        let history = vec![Message::user("hi"), tool_msg("call_9")];
        assert_eq!(
            validate_history(&history),
            Err(HistoryViolation::OrphanToolMessage {
                tool_call_id: "call_9".into()
            })
        );
    }

    #[test]
    fn tool_message_before_its_call_rejected() {
        let history = vec![tool_msg("call_1"), assistant_with_calls(&["call_1"])];
        assert!(matches!(
            validate_history(&history),
            Err(HistoryViolation::OrphanToolMessage { .. })
        ));
    }

    #[test]
    fn out_of_order_tool_block_rejected() {
        let history = vec![
            assistant_with_calls(&["call_1", "call_2"]),
            tool_msg("call_2"),
            tool_msg("call_1"),
        ];
        assert_eq!(
            validate_history(&history),
            Err(HistoryViolation::NonAdjacentToolBlock { assistant_index: 0 })
        );
    }

    #[test]
    fn interleaved_user_message_breaks_adjacency() {
        let history = vec![
            assistant_with_calls(&["call_1"]),
            Message::user("in between"),
            tool_msg("call_1"),
        ];
        assert!(matches!(
            validate_history(&history),
            Err(HistoryViolation::NonAdjacentToolBlock { .. })
        ));
    }

    #[test]
    fn duplicate_tool_result_rejected() {
        let history = vec![
            assistant_with_calls(&["call_1"]),
            tool_msg("call_1"),
            tool_msg("call_1"),
        ];
        assert!(matches!(
            validate_history(&history),
            Err(HistoryViolation::NonAdjacentToolBlock { .. })
                | Err(HistoryViolation::DuplicateToolMessage { .. })
        ));
    }

    #[test]
    fn assistant_without_calls_needs_no_block() {
        let history = vec![Message::assistant_text("done"), Message::user("thanks")];
        assert!(validate_history(&history).is_ok());
    }

    #[test]
    fn message_serde_round_trip() {
        let msg = assistant_with_calls(&["call_1"]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"assistant\""));
        assert!(json.contains("\"type\":\"tool_call\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn tool_message_wire_field_names() {
        let msg = tool_msg("call_1");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"toolCallId\":\"call_1\""));
        assert!(json.contains("\"toolName\":\"read_files\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn tool_output_part_tags_match_wire_format() {
        let part = ToolOutputPart::ErrorJson(json!({"error": "boom"}));
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"error-json\""));

        let text: ToolOutputPart = serde_json::from_str(r#"{"type":"text","value":"hi"}"#).unwrap();
        assert_eq!(text, ToolOutputPart::Text("hi".into()));
    }

    #[test]
    fn tool_output_error_detection() {
        assert!(ToolOutput::error_text("bad").is_error());
        assert!(!ToolOutput::json(json!({"ok": true})).is_error());
    }

    #[test]
    fn assistant_text_view_skips_tool_calls() {
        let msg = assistant_with_calls(&["call_1"]);
        assert_eq!(msg.as_assistant_text().as_deref(), Some("ok: "));
        assert_eq!(Message::user("x").as_assistant_text(), None);
    }
}
