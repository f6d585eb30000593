//! The transactional step transcript.
//!
//! Append-only buffers during a step, one rewrite at step end. The commit
//! ordering — snapshot, assistant text parts, tool-call parts, tool
//! results in call order, user errors — is what makes the pairing and
//! adjacency invariants hold regardless of the order async handlers
//! resolved in.

use crate::runtime::dispatcher::DispatchRecords;
use weft_contract::error::AgentError;
use weft_contract::thread::{validate_history, AssistantPart, Message};

const INTERRUPTED_MARKER: &str = "[Request interrupted by user]";

/// Per-step transcript: pre-step snapshot plus accumulated assistant text.
#[derive(Debug)]
pub struct StepTranscript {
    snapshot: Vec<Message>,
    text_parts: Vec<AssistantPart>,
}

impl StepTranscript {
    /// Capture the pre-step prefix.
    pub fn snapshot(history: &[Message]) -> Self {
        Self {
            snapshot: history.to_vec(),
            text_parts: Vec::new(),
        }
    }

    /// Append streamed assistant text, merging into the trailing text part.
    pub fn push_text(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if let Some(AssistantPart::Text { text }) = self.text_parts.last_mut() {
            text.push_str(delta);
        } else {
            self.text_parts.push(AssistantPart::Text {
                text: delta.to_string(),
            });
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text_parts.is_empty()
    }

    /// Replace the log with the step's final ordering and re-validate.
    ///
    /// An aborted step commits whatever results it has, with an
    /// interruption marker appended to the assistant text.
    pub fn commit(
        mut self,
        records: DispatchRecords,
        aborted: bool,
    ) -> Result<Vec<Message>, AgentError> {
        if aborted {
            match self.text_parts.last_mut() {
                Some(AssistantPart::Text { text }) if !text.is_empty() => {
                    text.push_str("\n\n");
                    text.push_str(INTERRUPTED_MARKER);
                }
                _ => self.text_parts.push(AssistantPart::Text {
                    text: INTERRUPTED_MARKER.to_string(),
                }),
            }
        }

        let mut history = self.snapshot;
        let mut parts = self.text_parts;
        parts.extend(
            records
                .tool_calls
                .iter()
                .map(|call| AssistantPart::ToolCall(call.clone())),
        );
        if !parts.is_empty() {
            history.push(Message::Assistant { parts });
        }
        for record in &records.tool_results {
            history.push(Message::tool(&record.call, &record.output));
        }
        for error in &records.user_errors {
            history.push(Message::user(error.clone()));
        }

        validate_history(&history)
            .map_err(|violation| AgentError::invariant(violation.to_string()))?;
        Ok(history)
    }
}
