//! Messaging port and its adapters.
//!
//! The port is designed so a future platform (Slack, Discord) fits behind the
//! same interface with capability flags; Telegram is the one shipped adapter.
//! The throttled decorator sits in front of any adapter to respect platform
//! flood limits.

pub mod telegram;
pub mod throttled;
pub mod types;

pub use telegram::TelegramMessenger;
pub use throttled::{ThrottleConfig, ThrottledMessenger};
pub use types::{ChatAction, InlineButton, InlineKeyboard, MessagingCapabilities};

use crate::{ChatId, MessageRef, Result};
use async_trait::async_trait;

/// Cross-platform messaging port.
///
/// All bodies are pre-rendered HTML in the platform's restricted tag set; an
/// adapter without HTML support renders the same visible text as plain text.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()>;
    async fn delete_message(&self, msg: MessageRef) -> Result<()>;

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()>;

    /// Best-effort; adapters without reaction support return Ok(()).
    async fn set_reaction(&self, msg: MessageRef, emoji: &str) -> Result<()>;

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()>;
}
