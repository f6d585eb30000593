//! Identifier generation seams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Generates process-unique, compact tool-call ids.
///
/// The default generator derives ids from UUID v7; tests swap in
/// [`CallIdGen::sequential`] for deterministic transcripts.
#[derive(Clone)]
pub struct CallIdGen {
    inner: Arc<dyn Fn() -> String + Send + Sync>,
}

impl CallIdGen {
    pub fn uuid() -> Self {
        Self {
            inner: Arc::new(|| format!("call_{}", Uuid::now_v7().simple())),
        }
    }

    /// `call_1`, `call_2`, ... for deterministic tests.
    pub fn sequential() -> Self {
        let counter = Arc::new(AtomicU64::new(0));
        Self {
            inner: Arc::new(move || {
                format!("call_{}", counter.fetch_add(1, Ordering::Relaxed) + 1)
            }),
        }
    }

    pub fn next(&self) -> String {
        (self.inner)()
    }
}

impl Default for CallIdGen {
    fn default() -> Self {
        Self::uuid()
    }
}

impl std::fmt::Debug for CallIdGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CallIdGen")
    }
}

/// Generate a message identifier for a committed assistant turn.
pub fn gen_message_id() -> String {
    format!("msg_{}", Uuid::now_v7().simple())
}
