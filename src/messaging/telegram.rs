//! Telegram messaging adapter (teloxide).

use crate::error::TransportError;
use crate::messaging::{ChatAction, InlineKeyboard, MessagingCapabilities, MessagingPort};
use crate::{ChatId, Error, MessageId, MessageRef, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode, ReactionType};
use teloxide::ApiError;

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        match e {
            teloxide::RequestError::RetryAfter(secs) => Error::Transport(TransportError::RateLimited {
                retry_after: secs.duration(),
            }),
            teloxide::RequestError::Api(ApiError::BotBlocked)
            | teloxide::RequestError::Api(ApiError::NotEnoughRightsToPostMessages) => {
                Error::Transport(TransportError::Forbidden(e.to_string()))
            }
            teloxide::RequestError::Api(ApiError::MessageToDeleteNotFound)
            | teloxide::RequestError::Api(ApiError::MessageIdInvalid) => {
                Error::Transport(TransportError::NotFound(e.to_string()))
            }
            other => Error::Transport(TransportError::Other(other.to_string())),
        }
    }

    fn is_parse_rejection(e: &teloxide::RequestError) -> bool {
        matches!(e, teloxide::RequestError::Api(ApiError::CantParseEntities(_)))
    }
}

/// Drop tags so the plain-text fallback shows the same visible text.
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_html: true,
            supports_edit: true,
            supports_reactions: true,
            supports_chat_actions: true,
            supports_inline_keyboards: true,
            max_message_len: 4096,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let sent = self
            .bot
            .send_message(Self::tg_chat(chat_id), html.to_string())
            .parse_mode(ParseMode::Html)
            .await;

        let msg = match sent {
            Ok(m) => m,
            Err(e) if Self::is_parse_rejection(&e) => {
                tracing::debug!(chat_id = chat_id.0, "HTML rejected, falling back to plain text");
                self.bot
                    .send_message(Self::tg_chat(chat_id), strip_html_tags(html))
                    .await
                    .map_err(Self::map_err)?
            }
            Err(e) => return Err(Self::map_err(e)),
        };

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        let edited = self
            .bot
            .edit_message_text(
                Self::tg_chat(msg.chat_id),
                Self::tg_msg(msg.message_id),
                html.to_string(),
            )
            .parse_mode(ParseMode::Html)
            .await;

        match edited {
            Ok(_) => Ok(()),
            Err(e) if Self::is_parse_rejection(&e) => {
                self.bot
                    .edit_message_text(
                        Self::tg_chat(msg.chat_id),
                        Self::tg_msg(msg.message_id),
                        strip_html_tags(html),
                    )
                    .await
                    .map_err(Self::map_err)?;
                Ok(())
            }
            Err(e) => Err(Self::map_err(e)),
        }
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.bot
            .delete_message(Self::tg_chat(msg.chat_id), Self::tg_msg(msg.message_id))
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        let tg_action = match action {
            ChatAction::Typing => teloxide::types::ChatAction::Typing,
            ChatAction::UploadPhoto => teloxide::types::ChatAction::UploadPhoto,
            ChatAction::UploadDocument => teloxide::types::ChatAction::UploadDocument,
        };
        self.bot
            .send_chat_action(Self::tg_chat(chat_id), tg_action)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn set_reaction(&self, msg: MessageRef, emoji: &str) -> Result<()> {
        self.bot
            .set_message_reaction(Self::tg_chat(msg.chat_id), Self::tg_msg(msg.message_id))
            .reaction(vec![ReactionType::Emoji {
                emoji: emoji.to_string(),
            }])
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
            .buttons
            .into_iter()
            .map(|b| vec![InlineKeyboardButton::callback(b.label, b.callback_data)])
            .collect();

        let msg = self
            .bot
            .send_message(Self::tg_chat(chat_id), html.to_string())
            .parse_mode(ParseMode::Html)
            .reply_markup(InlineKeyboardMarkup::new(rows))
            .await
            .map_err(Self::map_err)?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut req = self.bot.answer_callback_query(callback_id.to_string());
        if let Some(t) = text {
            req = req.text(t.to_string());
        }
        req.await.map_err(Self::map_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html_tags() {
        assert_eq!(
            strip_html_tags("<b>hi</b> &lt;x&gt; <code>a &amp; b</code>"),
            "hi <x> a & b"
        );
    }
}
