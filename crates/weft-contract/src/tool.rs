//! Tool trait, descriptors, and the per-step registry.

use crate::run::RunContext;
use crate::thread::ToolOutput;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Tool metadata surfaced to the model and the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name (snake_case).
    pub name: String,
    /// Description shown to the LLM.
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameters: Value,
    /// A successful invocation finalizes the current agent step.
    #[serde(default)]
    pub ends_agent_step: bool,
    /// The handler must observe the complete model stream before running.
    #[serde(default)]
    pub waits_for_stream_end: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            ends_agent_step: false,
            waits_for_stream_end: false,
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    #[must_use]
    pub fn ends_step(mut self) -> Self {
        self.ends_agent_step = true;
        self
    }

    #[must_use]
    pub fn waits_for_stream(mut self) -> Self {
        self.waits_for_stream_end = true;
        self
    }
}

/// Tool execution errors.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Per-path write serialization shared by file-editing tools within a step.
///
/// Locks for distinct paths are independent; repeated edits to one path
/// chain behind each other.
#[derive(Debug, Clone, Default)]
pub struct FileLocks {
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `path`, creating it on first use.
    pub async fn lock(&self, path: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("file lock table poisoned");
            locks
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Execution context handed to tool handlers.
#[derive(Clone)]
pub struct ToolContext {
    /// The run this step belongs to (carries the abort token).
    pub run: RunContext,
    /// Client port for delegated tools, when the host provides one.
    pub client: Option<Arc<dyn crate::ports::ToolClient>>,
    /// Child-agent spawner, when the orchestrator provides one.
    pub spawner: Option<Arc<dyn crate::ports::Spawner>>,
    /// Per-path write locks for this step.
    pub file_locks: FileLocks,
}

impl ToolContext {
    pub fn new(run: RunContext) -> Self {
        Self {
            run,
            client: None,
            spawner: None,
            file_locks: FileLocks::new(),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn crate::ports::ToolClient>) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn with_spawner(mut self, spawner: Arc<dyn crate::ports::Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("run_id", &self.run.run_id)
            .field("client", &self.client.as_ref().map(|_| "<port>"))
            .field("spawner", &self.spawner.as_ref().map(|_| "<port>"))
            .finish()
    }
}

/// Tool trait for agent actions.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool descriptor.
    fn descriptor(&self) -> ToolDescriptor;

    /// Validate arguments against the descriptor's JSON Schema before
    /// execution. Override to customise or skip validation.
    fn validate_args(&self, args: &Value) -> Result<(), ToolError> {
        validate_against_schema(&self.descriptor().parameters, args)
    }

    /// Execute the tool.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Validate a JSON value against a JSON Schema.
pub fn validate_against_schema(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| ToolError::Internal(format!("invalid tool schema: {e}")))?;
    if validator.is_valid(args) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    Err(ToolError::InvalidArguments(errors.join("; ")))
}

/// Strongly-typed variant of [`Tool`] with automatic schema generation.
///
/// A blanket impl provides [`Tool`]; deserialization replaces schema
/// validation.
#[async_trait]
pub trait TypedTool: Send + Sync {
    /// Argument type — must derive `Deserialize` and `JsonSchema`.
    type Args: for<'de> Deserialize<'de> + JsonSchema + Send;

    fn tool_name(&self) -> &str;

    fn description(&self) -> &str;

    fn ends_agent_step(&self) -> bool {
        false
    }

    async fn execute(&self, args: Self::Args, ctx: &ToolContext)
        -> Result<ToolOutput, ToolError>;
}

#[async_trait]
impl<T: TypedTool> Tool for T {
    fn descriptor(&self) -> ToolDescriptor {
        let mut descriptor = ToolDescriptor::new(self.tool_name(), self.description())
            .with_parameters(typed_tool_schema::<T::Args>());
        descriptor.ends_agent_step = self.ends_agent_step();
        descriptor
    }

    /// Deserialization in `execute` covers validation.
    fn validate_args(&self, _args: &Value) -> Result<(), ToolError> {
        Ok(())
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let typed: T::Args =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        TypedTool::execute(self, typed, ctx).await
    }
}

fn typed_tool_schema<T: JsonSchema>() -> Value {
    let mut v = serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));
    // LLM providers don't need the $schema key.
    if let Some(obj) = v.as_object_mut() {
        obj.remove("$schema");
    }
    v
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum ToolRegistryError {
    #[error("tool id conflict: '{0}' is already registered")]
    NameConflict(String),
    #[error("tool id must not be empty")]
    EmptyName,
}

/// Catalogue of tools available to one agent step.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("len", &self.tools.len())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolRegistryError> {
        let name = tool.descriptor().name;
        if name.trim().is_empty() {
            return Err(ToolRegistryError::EmptyName);
        }
        if self.tools.contains_key(&name) {
            return Err(ToolRegistryError::NameConflict(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Insert-if-absent merge of another registry's tools.
    pub fn overlay(&mut self, other: &ToolRegistry) {
        for (name, tool) in &other.tools {
            self.tools.entry(name.clone()).or_insert_with(|| tool.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors sorted by name, for prompt assembly.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// Build a registry from an iterator of tools, panicking on conflicts.
///
/// Test-and-wiring convenience; production wiring goes through
/// [`ToolRegistry::register`].
pub fn tool_map<I>(tools: I) -> ToolRegistry
where
    I: IntoIterator<Item = Arc<dyn Tool>>,
{
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry
            .register(tool)
            .unwrap_or_else(|e| panic!("tool_map: {e}"));
    }
    registry
}
