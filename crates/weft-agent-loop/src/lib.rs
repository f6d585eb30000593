//! The agent step engine.
//!
//! One step is `prepare → stream → dispatch → finalize`:
//!
//! ```text
//! LlmClient stream ──▶ StreamTally / InlineToolParser
//!                              │
//!                              ▼
//!                        ToolDispatcher ──▶ serialized handler effects
//!                              │
//!                              ▼
//!                        StepTranscript.commit ──▶ new message history
//! ```
//!
//! The dispatcher serializes handler effects over a chain of one-shot
//! completion handles, so committed history and UI events observe tool
//! calls in parse order regardless of handler timing. The outer run loop
//! (budgets, credits, spawning) lives in `weft-agentos`.

pub mod engine;
pub mod runtime;

pub use engine::tag_parser::{InlineEvent, InlineToolParser};
pub use runtime::dispatcher::{
    DispatchRecords, Dispatched, RunningDispatch, ToolDispatcher, ToolResultRecord,
};
pub use runtime::run_context::{await_or_cancel, is_cancelled, CancelAware, RunCancellationToken};
pub use runtime::step_runner::{
    run_step, StepDisposition, StepOutcome, StepPhase, StepPorts, StepSetup,
};
pub use runtime::streaming::{StreamOutcome, StreamTally};
pub use runtime::transcript::StepTranscript;
