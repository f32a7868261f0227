//! JSON-RPC client for synchronous AI agents.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

use super::plan::ClientAgentReply;

/// How long a single agent invocation may take, end to end.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Delay between `tasks/get` polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Why an agent call failed.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    /// The agent answered with a non-success status.
    #[error("HTTP error {status}: {body}")]
    HttpStatus {
        /// The response status code.
        status: reqwest::StatusCode,
        /// The response body, best effort.
        body: String,
    },
    /// The agent answered with a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },
    /// The overall request deadline elapsed.
    #[error("timed out waiting for agent response")]
    Timeout,
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err)
        }
    }
}

/// One part of an agent message. Only `text` parts are interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPart {
    /// Part discriminator; `"text"` for text parts.
    #[serde(rename = "type")]
    pub part_type: String,
    /// The text content.
    #[serde(default)]
    pub text: String,
}

/// A message exchanged with an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// `"user"` or `"agent"`.
    pub role: String,
    /// Ordered message parts.
    pub parts: Vec<TextPart>,
}

/// Status block of a remote agent task.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentTaskStatus {
    /// `submitted`, `working`, `completed`, `failed`, or `canceled`.
    pub state: String,
    /// The final (or latest) agent message.
    #[serde(default)]
    pub message: Option<AgentMessage>,
}

/// A remote agent task as returned by `tasks/send` / `tasks/get`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentTask {
    /// The task id the caller assigned.
    pub id: String,
    /// Current status.
    pub status: AgentTaskStatus,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SendTaskResponse {
    result: Option<AgentTask>,
    error: Option<JsonRpcError>,
}

/// HTTP client for remote agents. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    bearer_token: Option<String>,
}

impl AgentClient {
    /// Build a client with the standard 10-minute request deadline.
    pub fn new() -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(AgentError::Transport)?;
        Ok(Self {
            http,
            bearer_token: None,
        })
    }

    /// Attach a bearer token to every outgoing request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Issue `tasks/send` with the user prompt under a fresh task id.
    pub async fn send_message(
        &self,
        url: &str,
        task_id: &str,
        message: &str,
    ) -> Result<AgentTask, AgentError> {
        let params = serde_json::json!({
            "id": task_id,
            "message": {
                "role": "user",
                "parts": [{ "type": "text", "text": message }],
            },
        });
        self.post_rpc(url, "tasks/send", params).await
    }

    /// Issue `tasks/get` for a previously sent task.
    pub async fn get_task(&self, url: &str, task_id: &str) -> Result<AgentTask, AgentError> {
        let params = serde_json::json!({ "id": task_id });
        self.post_rpc(url, "tasks/get", params).await
    }

    /// Send a message and poll `tasks/get` until the task reaches a
    /// terminal state.
    pub async fn send_message_and_wait(
        &self,
        url: &str,
        task_id: &str,
        message: &str,
    ) -> Result<AgentTask, AgentError> {
        let task = self.send_message(url, task_id, message).await?;
        if is_terminal(&task.status.state) {
            return Ok(task);
        }

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let task = self.get_task(url, task_id).await?;
            trace!(task.id = %task.id, state = %task.status.state, "polled agent task");
            if is_terminal(&task.status.state) {
                return Ok(task);
            }
        }
    }

    /// `POST {url}` with `{"message": ...}` against a client agent.
    pub async fn send_client_message(
        &self,
        url: &str,
        message: &str,
    ) -> Result<ClientAgentReply, AgentError> {
        let body = serde_json::json!({ "message": message });
        let response = self.request(url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::HttpStatus { status, body });
        }
        Ok(response.json().await?)
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(url);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn post_rpc(
        &self,
        url: &str,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<AgentTask, AgentError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self.request(url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::HttpStatus { status, body });
        }

        let envelope: SendTaskResponse = response.json().await?;
        if let Some(error) = envelope.error {
            return Err(AgentError::JsonRpc {
                code: error.code,
                message: error.message,
            });
        }
        envelope.result.ok_or(AgentError::JsonRpc {
            code: -32603,
            message: "response carried neither result nor error".into(),
        })
    }
}

fn is_terminal(state: &str) -> bool {
    matches!(state, "completed" | "failed" | "canceled")
}

/// Concatenate the text of every `text` part in the task's final status
/// message.
pub fn extract_final_response(task: &AgentTask) -> String {
    let Some(message) = &task.status.message else {
        return String::new();
    };

    message
        .parts
        .iter()
        .filter(|part| part.part_type == "text")
        .map(|part| part.text.as_str())
        .collect()
}
