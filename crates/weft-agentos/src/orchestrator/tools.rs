//! Built-in tools wired into every step registry.

use async_trait::async_trait;
use serde_json::{json, Value};
use weft_contract::ports::{SpawnMode, SpawnRequest};
use weft_contract::thread::ToolOutput;
use weft_contract::tool::{Tool, ToolContext, ToolDescriptor, ToolError};

/// Forwards a named tool to the host application over the client port.
pub struct ClientTool {
    name: String,
    description: String,
}

impl ClientTool {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: format!("Client-delegated tool '{name}'"),
            name,
        }
    }
}

#[async_trait]
impl Tool for ClientTool {
    fn descriptor(&self) -> ToolDescriptor {
        // The host owns the real schema; the runtime stays permissive.
        ToolDescriptor::new(&self.name, &self.description)
            .with_parameters(json!({"type": "object"}))
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let client = ctx
            .client
            .as_ref()
            .ok_or_else(|| ToolError::Internal("no tool client connected".into()))?;
        client.request(&self.name, args, ctx).await
    }
}

/// Finalizes the step and records the agent's structured result.
pub struct TaskCompleted;

pub const TASK_COMPLETED: &str = "task_completed";
pub const END_TURN: &str = "end_turn";
pub const SPAWN_AGENTS: &str = "spawn_agents";
pub const SPAWN_AGENTS_ASYNC: &str = "spawn_agents_async";

#[async_trait]
impl Tool for TaskCompleted {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            TASK_COMPLETED,
            "Report the task as finished, with an optional structured result",
        )
        .with_parameters(json!({
            "type": "object",
            "properties": { "result": {} },
        }))
        .ends_step()
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::json(json!({"acknowledged": true})))
    }
}

/// Ends the current step without marking the task complete.
pub struct EndTurn;

#[async_trait]
impl Tool for EndTurn {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(END_TURN, "Yield the turn back to the user")
            .with_parameters(json!({"type": "object", "properties": {}}))
            .ends_step()
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::json(json!({})))
    }
}

fn spawn_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "agents": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "agent_type": { "type": "string" },
                        "prompt": { "type": "string" },
                        "params": {},
                    },
                    "required": ["agent_type", "prompt"],
                },
            },
        },
        "required": ["agents"],
    })
}

fn parse_spawn_requests(args: &Value) -> Result<Vec<SpawnRequest>, ToolError> {
    serde_json::from_value(args.get("agents").cloned().unwrap_or(Value::Null))
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Spawns child agents and waits for their structured outputs.
pub struct SpawnAgents;

#[async_trait]
impl Tool for SpawnAgents {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            SPAWN_AGENTS,
            "Spawn child agents and wait for their results",
        )
        .with_parameters(spawn_parameters())
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let spawner = ctx
            .spawner
            .as_ref()
            .ok_or_else(|| ToolError::Internal("no spawner connected".into()))?;
        let requests = parse_spawn_requests(&args)?;
        let spawned = spawner
            .spawn(requests, SpawnMode::Sync, &ctx.run)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let mut output = ToolOutput::json(json!({
            "agents": spawned
                .iter()
                .map(|run| {
                    json!({
                        "run_id": run.run_id,
                        "agent_type": run.agent_id,
                        "status": run.status,
                        "output": run.output,
                    })
                })
                .collect::<Vec<_>>(),
        }));
        output.spawned_credits = spawned.iter().map(|run| run.credits_used).sum();
        output.spawned_run_ids = spawned.into_iter().map(|run| run.run_id).collect();
        Ok(output)
    }
}

/// Fire-and-forget spawn; the result records only the child run ids. Ends
/// the step so the next inference sees the spawn barrier.
pub struct SpawnAgentsAsync;

#[async_trait]
impl Tool for SpawnAgentsAsync {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            SPAWN_AGENTS_ASYNC,
            "Spawn child agents without waiting for them",
        )
        .with_parameters(spawn_parameters())
        .ends_step()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let spawner = ctx
            .spawner
            .as_ref()
            .ok_or_else(|| ToolError::Internal("no spawner connected".into()))?;
        let requests = parse_spawn_requests(&args)?;
        let spawned = spawner
            .spawn(requests, SpawnMode::Async, &ctx.run)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let run_ids: Vec<String> = spawned.into_iter().map(|run| run.run_id).collect();
        let mut output = ToolOutput::json(json!({"spawned_run_ids": run_ids.clone()}));
        output.spawned_run_ids = run_ids;
        Ok(output)
    }
}
