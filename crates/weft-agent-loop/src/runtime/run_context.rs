//! Cancellation-aware await helpers.
//!
//! One abort token per run, threaded through the step runner, dispatcher,
//! and orchestrator. Consumers re-check at suspension points; cancellation
//! is cooperative.

use tokio_util::sync::CancellationToken;

pub type RunCancellationToken = CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelAware<T> {
    Value(T),
    Cancelled,
}

pub fn is_cancelled(token: &RunCancellationToken) -> bool {
    token.is_cancelled()
}

pub async fn await_or_cancel<T, F>(token: &RunCancellationToken, fut: F) -> CancelAware<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        _ = token.cancelled() => CancelAware::Cancelled,
        value = fut => CancelAware::Value(value),
    }
}
