//! Clients for the remote agents the scheduler invokes.
//!
//! Two wire protocols exist: JSON-RPC `tasks/send` + `tasks/get` polling
//! for AI agents, and a plain REST `POST {url}/messages` for client
//! agents, whose reply may be a multi-step plan.

mod client;
mod plan;

pub use self::client::{
    AgentClient, AgentError, AgentMessage, AgentTask, AgentTaskStatus, TextPart,
    extract_final_response,
};
pub use self::plan::{ClientAgentReply, PlanStep, StepResult, execute_plan};
