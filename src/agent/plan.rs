//! Execution of client-agent plans.
//!
//! An `agent_plan` reply is a list of steps with dependencies. Steps are
//! sorted by step number and split into two buckets: the first step and
//! every step with dependencies run sequentially, in order, each seeing
//! the results of the steps it depends on; the rest fan out in parallel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use super::client::{AgentClient, extract_final_response};

/// One step of an agent plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Position in the plan; drives the sequential ordering.
    pub step: i64,
    /// Display name of the executing agent.
    pub agent_name: String,
    /// Base URL of the executing agent.
    pub agent_address: String,
    /// Plan-scoped task identifier, referenced by `dependencies`.
    pub task_id: String,
    /// The instruction sent to the agent.
    pub task: String,
    /// Task ids whose results this step needs.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Reply of a client agent's `POST {url}/messages`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientAgentReply {
    /// Plan steps when `reply_type == "agent_plan"`.
    #[serde(default)]
    pub content: Vec<PlanStep>,
    /// Reply discriminator.
    #[serde(rename = "replyType")]
    pub reply_type: String,
}

/// Outcome of one executed plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// The executing agent's display name.
    pub agent_name: String,
    /// The plan-scoped task id of the step.
    pub task_id: String,
    /// The step's result text (or structured content).
    pub content: Value,
}

/// Sort by step and split into (sequential, parallel) buckets: the first
/// entry and any entry with dependencies are sequential, the rest run in
/// parallel.
pub(crate) fn split_buckets(mut steps: Vec<PlanStep>) -> (Vec<PlanStep>, Vec<PlanStep>) {
    steps.sort_by_key(|step| step.step);

    let mut sequential = Vec::new();
    let mut parallel = Vec::new();
    for (index, step) in steps.into_iter().enumerate() {
        if index == 0 || !step.dependencies.is_empty() {
            sequential.push(step);
        } else {
            parallel.push(step);
        }
    }
    (sequential, parallel)
}

/// Format the dependency results a step should see, if it has any.
pub(crate) fn dependency_context(results: &[StepResult], step: &PlanStep) -> Option<String> {
    let prior: Vec<&StepResult> = results
        .iter()
        .filter(|result| step.dependencies.contains(&result.task_id))
        .collect();
    if prior.is_empty() {
        return None;
    }
    serde_json::to_string(&prior)
        .ok()
        .map(|json| format!("\nPrevious results: {json}"))
}

/// Execute a full plan and return the union of all step results.
///
/// A failing step is logged and skipped; it does not abort its bucket.
/// Errors only if no step produced a result at all.
pub async fn execute_plan(
    client: &AgentClient,
    steps: Vec<PlanStep>,
) -> anyhow::Result<Vec<StepResult>> {
    let (sequential, parallel) = split_buckets(steps);
    debug!(
        sequential = sequential.len(),
        parallel = parallel.len(),
        "executing agent plan"
    );

    let mut results: Vec<StepResult> = Vec::new();

    for step in sequential {
        let mut task_text = step.task.clone();
        if let Some(context) = dependency_context(&results, &step) {
            task_text.push_str(&context);
        }

        match run_step(client, &step, &task_text).await {
            Ok(result) => {
                debug!(step = step.step, task_id = %step.task_id, "completed sequential plan step");
                results.push(result);
            }
            Err(error) => warn!(step = step.step, %error, "plan step failed"),
        }
    }

    // One task per parallel step; the join loop runs until it has seen as
    // many outcomes as the bucket holds.
    let mut fan_out = JoinSet::new();
    for step in parallel {
        let client = client.clone();
        fan_out.spawn(async move {
            let task_text = step.task.clone();
            run_step(&client, &step, &task_text).await
        });
    }

    while let Some(joined) = fan_out.join_next().await {
        match joined {
            Ok(Ok(result)) => {
                debug!(task_id = %result.task_id, "completed parallel plan step");
                results.push(result);
            }
            Ok(Err(error)) => warn!(%error, "parallel plan step failed"),
            Err(error) => warn!(%error, "parallel plan step panicked"),
        }
    }

    if results.is_empty() {
        anyhow::bail!("no final result found");
    }
    Ok(results)
}

async fn run_step(
    client: &AgentClient,
    step: &PlanStep,
    task_text: &str,
) -> anyhow::Result<StepResult> {
    let message_id = Uuid::new_v4().to_string();
    let url = format!("{}/messages", step.agent_address);
    let completed = client
        .send_message_and_wait(&url, &message_id, task_text)
        .await?;
    let content = extract_final_response(&completed);

    Ok(StepResult {
        agent_name: step.agent_name.clone(),
        task_id: step.task_id.clone(),
        content: Value::String(content),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(number: i64, task_id: &str, dependencies: &[&str]) -> PlanStep {
        PlanStep {
            step: number,
            agent_name: format!("agent-{number}"),
            agent_address: "http://agent.local".into(),
            task_id: task_id.into(),
            task: format!("do thing {number}"),
            dependencies: dependencies.iter().map(|d| (*d).to_string()).collect(),
        }
    }

    #[test]
    fn first_step_and_dependent_steps_are_sequential() {
        let steps = vec![
            step(1, "a", &[]),
            step(2, "b", &["a"]),
            step(3, "c", &[]),
            step(4, "d", &[]),
        ];
        let (sequential, parallel) = split_buckets(steps);

        let seq_ids: Vec<&str> = sequential.iter().map(|s| s.task_id.as_str()).collect();
        let par_ids: Vec<&str> = parallel.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(seq_ids, vec!["a", "b"]);
        assert_eq!(par_ids, vec!["c", "d"]);
    }

    #[test]
    fn buckets_respect_step_order_not_input_order() {
        let steps = vec![step(3, "c", &["a"]), step(1, "a", &[]), step(2, "b", &[])];
        let (sequential, parallel) = split_buckets(steps);

        let seq_ids: Vec<&str> = sequential.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(seq_ids, vec!["a", "c"]);
        assert_eq!(parallel.len(), 1);
        assert_eq!(parallel[0].task_id, "b");
    }

    #[test]
    fn dependency_context_filters_by_task_id() {
        let results = vec![
            StepResult {
                agent_name: "agent-1".into(),
                task_id: "a".into(),
                content: Value::String("alpha".into()),
            },
            StepResult {
                agent_name: "agent-3".into(),
                task_id: "c".into(),
                content: Value::String("gamma".into()),
            },
        ];

        let dependent = step(2, "b", &["a"]);
        let context = dependency_context(&results, &dependent).unwrap();
        assert!(context.starts_with("\nPrevious results: "));
        assert!(context.contains("alpha"));
        assert!(!context.contains("gamma"));

        let independent = step(5, "e", &[]);
        assert!(dependency_context(&results, &independent).is_none());
    }

    #[test]
    fn plan_reply_deserializes_with_defaults() {
        let reply: ClientAgentReply = serde_json::from_str(
            r#"{"replyType":"agent_plan","content":[{"step":1,"agent_name":"a","agent_address":"http://x","task_id":"t","task":"go"}]}"#,
        )
        .unwrap();
        assert_eq!(reply.reply_type, "agent_plan");
        assert_eq!(reply.content.len(), 1);
        assert!(reply.content[0].dependencies.is_empty());
    }
}
