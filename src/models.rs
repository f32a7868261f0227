//! Database rows, payload shapes, and request/response types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible for new firings.
    Active,
    /// Paused; pending queue entries are cancelled at dispatch time.
    Inactive,
    /// Soft-deleted tombstone.
    Deleted,
}

/// Lifecycle state of a task. Transitions form the DAG
/// `created → running → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Materialized, not yet started.
    Created,
    /// Agent invocation in flight.
    Running,
    /// Terminal: finished with a result.
    Completed,
    /// Terminal: the invocation errored.
    Failed,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// How a job computes its firing times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobType {
    /// One-shot wall-clock instant.
    Scheduled,
    /// Recurring cron expression.
    Interval,
}

/// Which kind of remote agent a job invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceName {
    /// Synchronous JSON-RPC agent (`tasks/send` + `tasks/get` polling).
    AiAgent,
    /// REST agent that may reply with a multi-step plan.
    ClientAgent,
}

/// The work definition carried by a job's `payload` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    /// The user prompt sent to the agent.
    pub prompt: String,
    /// Which agent capability executes the prompt.
    pub resource_name: ResourceName,
    /// JSON-encoded [`AgentTarget`].
    pub resource_data: String,
}

impl Payload {
    /// Parse a payload out of the opaque JSON column.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Connection details for a remote agent, stored JSON-encoded inside
/// [`Payload::resource_data`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTarget {
    /// Opaque agent identifier.
    pub id: String,
    /// Display name, echoed into results.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Base URL; the client POSTs to `{url}/messages`.
    pub url: String,
}

/// One-shot schedule descriptor: `{"execute_at": "<RFC3339>" | "now"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// RFC3339 instant with millisecond precision, or the literal `"now"`.
    pub execute_at: Option<String>,
}

/// Recurring schedule descriptor: `{"interval_type": ..., "value": "<cron>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalSpec {
    /// Coarse label supplied by the caller (`minutes`, `hours`, ...).
    pub interval_type: String,
    /// Standard 5-field cron expression.
    pub value: Option<String>,
}

/// A user-registered recurring or one-shot work definition.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Job {
    /// Opaque unique identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Owning user.
    pub user_id: Uuid,
    /// Workspace the owner acts within.
    pub workspace_id: Uuid,
    /// Opaque JSON payload; see [`Payload`].
    pub payload: Value,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Whether `schedule` or `interval` drives firings.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Populated iff `job_type == Scheduled`.
    pub schedule: Option<Value>,
    /// Populated iff `job_type == Interval`.
    pub interval: Option<Value>,
    /// Soft-delete flag; tombstones are retained.
    pub is_deleted: bool,
    /// Whether interval-progress replay applies to this job.
    pub enable_recovery: bool,
    /// Next computed firing instant.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Last firing instant.
    pub last_run_at: Option<DateTime<Utc>>,
    /// The in-flight task, if any.
    pub current_task_id: Option<Uuid>,
    /// Serialized [`IntervalProgress`] for the current interval.
    pub interval_progress: Option<Value>,
    /// Identifier of the current interval execution.
    pub current_interval_id: Option<String>,
    /// When the current interval execution started.
    pub interval_started_at: Option<DateTime<Utc>>,
    /// Queue entry id of the pending firing (0 when none).
    pub queue_entry_id: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Monotonic version, incremented on every mutation.
    pub version: i64,
}

/// A single execution of a job against the remote agent.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Task {
    /// Opaque unique identifier.
    pub id: Uuid,
    /// Parent job.
    pub job_id: Uuid,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Snapshot of the job payload at firing time.
    pub payload: Value,
    /// Free-form result; empty until terminal.
    pub result: String,
    /// Soft-deleted together with the parent job.
    pub is_deleted: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Monotonic version.
    pub version: i64,
}

/// Status of an interval execution tracked in [`IntervalProgress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalStatus {
    /// Sub-tasks still outstanding.
    Running,
    /// All sub-tasks accounted for; set exactly once.
    Completed,
}

/// Per-sub-task record inside [`IntervalProgress::task_results`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultRecord {
    /// Task identifier (matches the `tasks` row when one exists).
    pub task_id: String,
    /// Sub-task status.
    pub status: TaskStatus,
    /// When execution of this sub-task started.
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal state.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Result payload on completion.
    #[serde(default)]
    pub result: String,
    /// Error message on failure.
    #[serde(default)]
    pub error: String,
}

/// Progress of one interval execution, persisted on the job row so a
/// restart can replay the unfinished portion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalProgress {
    /// Identifier guarding set-once completion.
    pub interval_id: String,
    /// How many sub-tasks this interval fires.
    pub total_tasks: i32,
    /// Count of completed sub-tasks.
    pub completed_tasks: i32,
    /// Count of failed sub-tasks.
    pub failed_tasks: i32,
    /// Per-sub-task outcomes, keyed by task id.
    #[serde(default)]
    pub task_results: HashMap<String, TaskResultRecord>,
    /// Whether the interval is still running.
    pub status: IntervalStatus,
    /// When the interval started.
    pub started_at: DateTime<Utc>,
    /// Last bookkeeping update.
    pub last_updated_at: DateTime<Utc>,
}

impl IntervalProgress {
    /// Start a fresh interval with `total_tasks` outstanding sub-tasks.
    pub fn start(total_tasks: i32, now: DateTime<Utc>) -> Self {
        Self {
            interval_id: Uuid::new_v4().to_string(),
            total_tasks,
            completed_tasks: 0,
            failed_tasks: 0,
            task_results: HashMap::new(),
            status: IntervalStatus::Running,
            started_at: now,
            last_updated_at: now,
        }
    }

    /// Whether every sub-task has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.completed_tasks + self.failed_tasks >= self.total_tasks
    }
}

/// Body of `POST /api/jobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    /// Display name.
    pub name: String,
    /// Workspace to create the job in.
    pub workspace_id: Uuid,
    /// Opaque JSON payload; see [`Payload`].
    pub payload: Value,
    /// Schedule kind.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// One-shot descriptor; required when `type == scheduled`.
    pub schedule: Option<Value>,
    /// Recurring descriptor; required when `type == interval`.
    pub interval: Option<Value>,
    /// Per-job recovery override; defaults from configuration.
    pub enable_recovery: Option<bool>,
}

/// Body of `PUT /api/jobs/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateJobRequest {
    /// New display name.
    pub name: Option<String>,
    /// New payload; only the `prompt` is applied in place.
    pub payload: Option<Value>,
    /// New schedule kind; any change replaces the job.
    #[serde(rename = "type")]
    pub job_type: Option<JobType>,
    /// New one-shot descriptor; any change replaces the job.
    pub schedule: Option<Value>,
    /// New recurring descriptor; any change replaces the job.
    pub interval: Option<Value>,
}

/// One page of a listing, with pagination bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    /// The page contents, newest first.
    pub data: Vec<T>,
    /// Total number of matching rows.
    pub total: i64,
    /// Total number of pages at this limit.
    #[serde(rename = "totalPage")]
    pub total_page: i64,
    /// 1-based page number.
    pub page: i64,
    /// Effective page size.
    pub limit: i64,
}

/// Response of `GET /api/jobs/{id}`: the job plus a page of its tasks.
#[derive(Debug, Clone, Serialize)]
pub struct JobWithTasks {
    /// The job row.
    pub job: Job,
    /// Its tasks, newest first.
    pub tasks: Page<Task>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_parses_from_job_column() {
        let value = serde_json::json!({
            "prompt": "summarize the inbox",
            "resource_name": "ai_agent",
            "resource_data": "{\"id\":\"a1\",\"name\":\"mailbot\",\"description\":\"\",\"url\":\"http://agent.local\"}",
        });
        let payload = Payload::from_value(&value).unwrap();
        assert_eq!(payload.resource_name, ResourceName::AiAgent);
        let target: AgentTarget = serde_json::from_str(&payload.resource_data).unwrap();
        assert_eq!(target.url, "http://agent.local");
    }

    #[test]
    fn interval_progress_round_trips_with_defaults() {
        let progress = IntervalProgress::start(2, Utc::now());
        let value = serde_json::to_value(&progress).unwrap();
        let back: IntervalProgress = serde_json::from_value(value).unwrap();
        assert_eq!(back.total_tasks, 2);
        assert_eq!(back.status, IntervalStatus::Running);
        assert!(!back.is_settled());
    }

    #[test]
    fn settled_counts_failures_too() {
        let mut progress = IntervalProgress::start(2, Utc::now());
        progress.completed_tasks = 1;
        progress.failed_tasks = 1;
        assert!(progress.is_settled());
    }
}
