//! Agent orchestration for the weft runtime.
//!
//! `AgentOs` drives the outer loop over agent steps: template resolution,
//! step budgets, credit preflight/settlement, spawn lifecycle, abort
//! propagation, and telemetry. The per-step engine lives in
//! `weft-agent-loop`; this crate wires it to real ports, including the
//! default genai-backed LLM adapter.

pub mod credits;
pub mod genai_llm;
pub mod orchestrator;

pub use credits::{CreditError, CreditGate, Preflight, Settlement};
pub use genai_llm::GenaiLlm;
pub use orchestrator::registry::{RegistryError, TemplateRegistry};
pub use orchestrator::tools::{
    ClientTool, EndTurn, SpawnAgents, SpawnAgentsAsync, TaskCompleted,
};
pub use orchestrator::{AgentOs, RunRecord, RunRequest};
