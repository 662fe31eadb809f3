//! Inbound update routing.
//!
//! Normal messages from one chat are processed strictly in arrival order via a
//! per-chat lock. Commands, `!`-prefixed interrupts and button callbacks
//! bypass the lock: they must never queue behind a long-running query.
//! Steering (a plain message while a query runs) also bypasses — it feeds the
//! running query instead of starting a new one.

pub mod callback;
pub mod commands;
pub mod document;
pub mod media_group;
pub mod photo;
pub mod prompt;
pub mod text;
pub mod voice;

use crate::audit::{AuditEvent, AuditLog};
use crate::buttons::ButtonChannel;
use crate::config::Config;
use crate::cron::CronScheduler;
use crate::messaging::MessagingPort;
use crate::quota::QuotaService;
use crate::security::{is_authorized, RateLimiter};
use crate::session::SessionManager;
use crate::transcribe::TranscriptionPort;
use crate::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};

/// Global ceiling on concurrent media downloads.
pub static DOWNLOAD_SLOTS: Semaphore = Semaphore::const_new(25);

/// Shared state handed to every handler.
pub struct AppState {
    pub cfg: Arc<Config>,
    pub session: Arc<SessionManager>,
    pub messenger: Arc<dyn MessagingPort>,
    pub scheduler: CronScheduler,
    pub quota: QuotaService,
    pub transcriber: Option<Arc<dyn TranscriptionPort>>,
    pub buttons: Arc<dyn ButtonChannel>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub chat_locks: ChatLocks,
    pub audit: Arc<AuditLog>,
}

/// Per-chat FIFO keys. Holding the guard serializes normal message handling
/// for that chat.
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, chat_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let user_id = msg.from.as_ref().map(|u| UserId(u.id.0 as i64));
    let username = msg
        .from
        .as_ref()
        .and_then(|u| u.username.clone())
        .unwrap_or_else(|| "unknown".to_string());

    if !is_authorized(user_id, &state.cfg.allowed_users) {
        if let Some(id) = user_id {
            tracing::warn!(user_id = id.0, chat_id, "unauthorized access attempt");
            state
                .audit
                .append_best_effort(AuditEvent::auth(id.0, &username, false));
        }
        let _ = bot
            .send_message(msg.chat.id, "Unauthorized. Contact the bot owner for access.")
            .await;
        return Ok(());
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(bot, msg, state).await;
        }

        // Interrupts bypass the serializer entirely.
        if text.starts_with('!') {
            return text::handle_text(bot, msg, state).await;
        }

        // A plain message while a query runs becomes steering input.
        if state.session.is_running().await {
            return text::handle_steering(bot, msg, state).await;
        }

        let _guard = state.chat_locks.lock_chat(chat_id).await;
        return text::handle_text(bot, msg, state).await;
    }

    if msg.photo().is_some() {
        // Album items are buffered; only singles take the chat lock here.
        if msg.media_group_id().is_none() {
            let _guard = state.chat_locks.lock_chat(chat_id).await;
            return photo::handle_photo(bot, msg, state).await;
        }
        return photo::handle_photo(bot, msg, state).await;
    }

    if msg.document().is_some() {
        if msg.media_group_id().is_none() {
            let _guard = state.chat_locks.lock_chat(chat_id).await;
            return document::handle_document(bot, msg, state).await;
        }
        return document::handle_document(bot, msg, state).await;
    }

    if msg.voice().is_some() {
        let _guard = state.chat_locks.lock_chat(chat_id).await;
        return voice::handle_voice(bot, msg, state).await;
    }

    let _ = bot
        .send_message(msg.chat.id, "Unsupported message type.")
        .await;
    Ok(())
}
