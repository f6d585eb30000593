//! Bookkeeping over the abstract LLM event stream.

use weft_contract::ports::{LlmUsage, StreamEnd};

/// Terminal value of one consumed stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed { message_id: String, usage: LlmUsage },
    Aborted,
}

/// Accumulates per-stream totals while the step runner forwards events.
#[derive(Debug, Default)]
pub struct StreamTally {
    text_chars: usize,
    end: Option<StreamEnd>,
}

impl StreamTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_text(&mut self, delta: &str) {
        self.text_chars += delta.len();
    }

    pub fn note_end(&mut self, end: StreamEnd) {
        self.end = Some(end);
    }

    pub fn text_chars(&self) -> usize {
        self.text_chars
    }

    pub fn message_id(&self) -> Option<&str> {
        self.end.as_ref().map(|e| e.message_id.as_str())
    }

    pub fn usage(&self) -> LlmUsage {
        self.end.as_ref().map(|e| e.usage.clone()).unwrap_or_default()
    }

    pub fn into_outcome(self, aborted: bool) -> StreamOutcome {
        if aborted {
            return StreamOutcome::Aborted;
        }
        match self.end {
            Some(end) => StreamOutcome::Completed {
                message_id: end.message_id,
                usage: end.usage,
            },
            // Stream dropped without a terminator; treat like an abort.
            None => StreamOutcome::Aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_outcome_carries_end_payload() {
        let mut tally = StreamTally::new();
        tally.note_text("hello");
        tally.note_end(StreamEnd {
            message_id: "msg_1".into(),
            usage: LlmUsage {
                input_tokens: 10,
                output_tokens: 5,
                credits_used: 0.5,
            },
        });
        assert_eq!(tally.text_chars(), 5);
        assert_eq!(
            tally.into_outcome(false),
            StreamOutcome::Completed {
                message_id: "msg_1".into(),
                usage: LlmUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    credits_used: 0.5,
                },
            }
        );
    }

    #[test]
    fn abort_wins_over_end() {
        let mut tally = StreamTally::new();
        tally.note_end(StreamEnd::default());
        assert_eq!(tally.into_outcome(true), StreamOutcome::Aborted);
    }

    #[test]
    fn missing_terminator_reads_as_aborted() {
        assert_eq!(StreamTally::new().into_outcome(false), StreamOutcome::Aborted);
    }
}
