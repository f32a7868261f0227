//! Queue entry handlers: `interval_job` and `task_recovery`.

mod interval_job;
mod task_recovery;

pub use self::interval_job::IntervalJobArgs;
pub use self::task_recovery::TaskRecoveryArgs;

use anyhow::Context as _;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::agent::{AgentClient, execute_plan, extract_final_response};
use crate::config::RecoveryConfig;
use crate::models::{AgentTarget, Payload, ResourceName};
use crate::store::{JobStore, TaskStore};

/// Shared state handed to every queue handler.
#[derive(Clone)]
pub struct WorkerContext {
    /// The shared connection pool, used for follow-up enqueues.
    pub pool: PgPool,
    /// Job records.
    pub jobs: JobStore,
    /// Task records.
    pub tasks: TaskStore,
    /// Remote agent client.
    pub agent: AgentClient,
    /// Recovery knobs.
    pub recovery: RecoveryConfig,
}

/// Move the task to `running` and dispatch on the payload's resource
/// kind. Returns the raw result value; callers decide how to persist it.
pub(crate) async fn execute_resource(
    ctx: &WorkerContext,
    task_id: Uuid,
    payload: &Payload,
) -> anyhow::Result<Value> {
    ctx.tasks.mark_running(task_id).await?;
    dispatch_payload(ctx, payload).await
}

/// Dispatch on the payload's resource kind without touching any task row.
pub(crate) async fn dispatch_payload(
    ctx: &WorkerContext,
    payload: &Payload,
) -> anyhow::Result<Value> {
    match payload.resource_name {
        ResourceName::AiAgent => execute_ai_agent(ctx, payload).await,
        ResourceName::ClientAgent => execute_client_agent(ctx, payload).await,
    }
}

async fn execute_ai_agent(ctx: &WorkerContext, payload: &Payload) -> anyhow::Result<Value> {
    let target: AgentTarget =
        serde_json::from_str(&payload.resource_data).context("invalid ai_agent resource data")?;

    let url = format!("{}/messages", target.url);
    let message_id = Uuid::new_v4().to_string();
    let task = ctx
        .agent
        .send_message_and_wait(&url, &message_id, &payload.prompt)
        .await?;
    let content = extract_final_response(&task);

    Ok(serde_json::json!({
        "agent_name": target.name,
        "task_id": message_id,
        "content": content,
    }))
}

async fn execute_client_agent(ctx: &WorkerContext, payload: &Payload) -> anyhow::Result<Value> {
    let target: AgentTarget = serde_json::from_str(&payload.resource_data)
        .context("invalid client_agent resource data")?;

    let url = format!("{}/messages", target.url);
    let reply = ctx.agent.send_client_message(&url, &payload.prompt).await?;

    if reply.reply_type == "agent_plan" {
        let results = execute_plan(&ctx.agent, reply.content).await?;
        Ok(serde_json::to_value(results)?)
    } else {
        Ok(Value::String("No Result Found".into()))
    }
}

/// Render an execution result for the task's `result` column: strings as
/// themselves, everything else JSON-encoded.
pub(crate) fn render_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_results_are_stored_verbatim() {
        assert_eq!(render_result(&Value::String("done".into())), "done");
    }

    #[test]
    fn structured_results_are_json_encoded() {
        let value = serde_json::json!({"agent_name": "a", "content": "x"});
        let rendered = render_result(&value);
        let back: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(back, value);
    }
}
