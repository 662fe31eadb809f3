//! Relaybot: a Telegram bridge to a local coding agent.
//!
//! Inbound updates are authenticated and rate-limited, then forwarded to a
//! long-lived agent CLI process whose NDJSON event stream is rendered back
//! into the chat as live-edited messages. File and shell operations requested
//! by the agent are checked against a path/command policy before they are
//! allowed to proceed.

pub mod agent;
pub mod archive;
pub mod audit;
pub mod buttons;
pub mod config;
pub mod cron;
pub mod error;
pub mod format;
pub mod handlers;
pub mod messaging;
pub mod quota;
pub mod security;
pub mod session;
pub mod startup;
pub mod stream;
pub mod transcribe;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Telegram user id (numeric, unforgeable by clients).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Telegram message id within a chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i32);

/// A stable reference to a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
