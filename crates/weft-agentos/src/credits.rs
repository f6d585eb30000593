//! The credit gate: reserve-then-consume accounting over the ledger port.
//!
//! Ledger mutations run in serializable transactions on the backend side;
//! conflict-class failures are retried here with exponential backoff and
//! jitter. Everything else propagates immediately.

use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use weft_contract::ports::{
    CreditBackend, CreditBackendError, CreditKind, CreditLedgerEntry,
};

/// Tries are capped at five; waits follow 1s, 2s, 4s, 8s (16s cap) ±20%.
const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 16_000;

#[derive(Debug, Clone, Error)]
#[error("credit backend error [{code}]: {message}")]
pub struct CreditError {
    pub code: String,
    pub message: String,
}

/// Preflight result; never mutates the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Preflight {
    Ok,
    Insufficient { balance: f64 },
}

/// Settlement result, idempotent on the operation id.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Charged { charged_to_organization: bool },
    Insufficient,
}

/// Transaction status codes worth retrying: serialization failures and
/// deadlocks (40001, 40P01), connection exceptions (class 08), operator
/// intervention (class 57), and resource exhaustion (53200, 53300).
fn is_retryable_code(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "53200" | "53300")
        || code.starts_with("08")
        || code.starts_with("57")
}

fn backoff_after(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF_MS
        .checked_shl(attempt - 1)
        .unwrap_or(u64::MAX)
        .min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(-(base as i64 / 5)..=base as i64 / 5);
    Duration::from_millis((base as i64 + jitter).max(0) as u64)
}

pub struct CreditGate {
    backend: Arc<dyn CreditBackend>,
    /// Agent ids that never charge.
    free_agents: HashSet<String>,
}

impl CreditGate {
    pub fn new(backend: Arc<dyn CreditBackend>) -> Self {
        Self {
            backend,
            free_agents: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_free_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.free_agents = agents.into_iter().map(Into::into).collect();
        self
    }

    /// Closed allowlist of agents that bypass settlement entirely.
    pub fn is_free_tier(&self, agent_id: &str) -> bool {
        self.free_agents.contains(agent_id)
    }

    /// Read-only balance check before a step starts.
    pub async fn preflight(
        &self,
        user_id: &str,
        min_required: f64,
    ) -> Result<Preflight, CreditError> {
        let balance = self
            .with_retries(|| self.backend.balance(user_id))
            .await?;
        if balance >= min_required {
            Ok(Preflight::Ok)
        } else {
            Ok(Preflight::Insufficient { balance })
        }
    }

    /// Charge `amount` under `operation_id`. Repeats with the same id are
    /// no-ops returning the prior result; zero amounts (free tier, BYOK)
    /// short-circuit without touching the backend.
    pub async fn settle(
        &self,
        user_id: &str,
        amount: f64,
        operation_id: &str,
        repo_id: Option<String>,
        kind: CreditKind,
    ) -> Result<Settlement, CreditError> {
        if amount <= 0.0 {
            return Ok(Settlement::Charged {
                charged_to_organization: false,
            });
        }
        let entry = CreditLedgerEntry {
            user_id: user_id.to_string(),
            amount,
            operation_id: operation_id.to_string(),
            kind,
            repo_id,
        };
        match self
            .with_retries(|| self.backend.charge(entry.clone()))
            .await
        {
            Ok(receipt) => Ok(Settlement::Charged {
                charged_to_organization: receipt.charged_to_organization,
            }),
            Err(error) if error.code == CreditBackendError::INSUFFICIENT => {
                Ok(Settlement::Insufficient)
            }
            Err(error) => Err(error),
        }
    }

    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, CreditError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CreditBackendError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if is_retryable_code(&error.code) && attempt < MAX_ATTEMPTS => {
                    let wait = backoff_after(attempt);
                    tracing::warn!(
                        code = %error.code,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "credit backend conflict, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(CreditError {
                        code: error.code,
                        message: error.message,
                    })
                }
            }
        }
    }
}

impl std::fmt::Debug for CreditGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditGate")
            .field("free_agents", &self.free_agents)
            .finish()
    }
}
