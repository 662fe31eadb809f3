//! Model port: the interface the session runner drives an agent through.
//!
//! Exactly one adapter ships (the agent CLI as a child process), but the port
//! keeps provider quirks out of the session logic and lets tests substitute a
//! scripted fake.

pub mod claude;
pub mod mcp;

pub use claude::ClaudeAgent;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Token usage reported by the agent for one query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    pub fn parse(v: &serde_json::Value) -> Self {
        let get = |k: &str| v.get(k).and_then(|x| x.as_u64()).unwrap_or(0);
        Self {
            input_tokens: get("input_tokens"),
            output_tokens: get("output_tokens"),
            cache_read_input_tokens: get("cache_read_input_tokens"),
            cache_creation_input_tokens: get("cache_creation_input_tokens"),
        }
    }
}

/// Decoded agent stream events.
///
/// The agent's event catalog evolves; anything with an unrecognized top-level
/// `type` lands in `Unknown` with the original object intact, logged at trace
/// and never fatal.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    /// First event of a run; carries the session id used for resume.
    SessionInit { session_id: String },
    /// Full text snapshot of an all-text assistant message.
    AssistantText { text: String },
    AssistantThinking { text: String },
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    ToolProgress { raw: serde_json::Value },
    Result {
        usage: Option<TokenUsage>,
        duration_ms: Option<u64>,
        text: Option<String>,
        is_error: bool,
    },
    Unknown { raw: serde_json::Value },
}

/// Model capabilities for feature gating.
#[derive(Clone, Copy, Debug)]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub vision: bool,
    pub thinking: bool,
    pub mcp: bool,
}

/// Normalized request for one query.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub add_dirs: Vec<PathBuf>,
    pub mcp_config_path: Option<PathBuf>,
    pub system_prompt: Option<String>,
    pub resume: Option<String>,
    pub max_thinking_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub session_id: Option<String>,
    pub is_error: bool,
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Model client interface used by the session runner.
///
/// Streaming is callback-based so adapters drive their own decode loops;
/// `steer` injects a user frame into a running query at the adapter's input
/// channel, and `cancel` aborts the in-flight run.
#[async_trait]
pub trait AgentClient: Send + Sync {
    fn capabilities(&self) -> AgentCapabilities;

    async fn run(
        &self,
        req: RunRequest,
        on_event: &mut (dyn FnMut(AgentEvent) -> Result<()> + Send),
    ) -> Result<RunResult>;

    /// Write a steering frame into the running query's input stream.
    async fn steer(&self, text: &str) -> Result<()>;

    async fn cancel(&self) -> Result<()>;
}
