//! Album buffering.
//!
//! Telegram delivers an album as independent updates sharing a
//! `media_group_id`. Items are buffered per group with a timer that restarts
//! on each arrival; when it expires the whole group is submitted as one
//! prompt under the chat lock.

use crate::handlers::prompt::{check_rate_limit, PromptContext};
use crate::ChatId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct MediaGroupConfig {
    pub emoji: &'static str,
    pub item_label_plural: &'static str,
}

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type ProcessFn = Arc<dyn Fn(PromptContext, Vec<String>, Option<String>) -> BoxFuture + Send + Sync>;

struct PendingGroup {
    items: Vec<String>,
    caption: Option<String>,
    ctx: PromptContext,
    status_msg: Option<crate::MessageRef>,
    cancel: CancellationToken,
}

pub struct MediaGroupBuffer {
    cfg: MediaGroupConfig,
    process: ProcessFn,
    pending: tokio::sync::Mutex<HashMap<String, PendingGroup>>,
}

impl MediaGroupBuffer {
    pub fn new(cfg: MediaGroupConfig, process: ProcessFn) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            process,
            pending: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Add an item to its group, creating the group (and its timer) on first
    /// sight. Returns false when the group was rejected by rate limiting.
    pub async fn add_to_group(
        self: &Arc<Self>,
        ctx: PromptContext,
        media_group_id: String,
        item_path: String,
        caption: Option<String>,
        timeout: Duration,
    ) -> bool {
        let mut map = self.pending.lock().await;

        if let Some(group) = map.get_mut(&media_group_id) {
            group.items.push(item_path);
            if group.caption.is_none() {
                group.caption = caption;
            }

            // Restart the flush timer.
            group.cancel.cancel();
            let cancel = CancellationToken::new();
            group.cancel = cancel.clone();
            drop(map);
            self.spawn_timer(media_group_id, cancel, timeout);
            return true;
        }

        // First item: the whole group consumes one rate-limit token.
        if !check_rate_limit(&ctx).await {
            return false;
        }

        let status = format!("{} Receiving {}...", self.cfg.emoji, self.cfg.item_label_plural);
        let status_msg = ctx
            .state
            .messenger
            .send_html(ChatId(ctx.chat_id), &status)
            .await
            .ok();

        let cancel = CancellationToken::new();
        map.insert(
            media_group_id.clone(),
            PendingGroup {
                items: vec![item_path],
                caption,
                ctx,
                status_msg,
                cancel: cancel.clone(),
            },
        );
        drop(map);
        self.spawn_timer(media_group_id, cancel, timeout);
        true
    }

    fn spawn_timer(self: &Arc<Self>, media_group_id: String, cancel: CancellationToken, timeout: Duration) {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    buffer.flush_group(&media_group_id).await;
                }
            }
        });
    }

    async fn flush_group(self: &Arc<Self>, media_group_id: &str) {
        let group = {
            let mut map = self.pending.lock().await;
            map.remove(media_group_id)
        };
        let Some(group) = group else {
            return;
        };

        tracing::debug!(
            media_group_id,
            items = group.items.len(),
            "processing media group"
        );

        if let Some(status) = group.status_msg {
            let note = format!(
                "{} Processing {} {}...",
                self.cfg.emoji,
                group.items.len(),
                self.cfg.item_label_plural
            );
            let _ = group.ctx.state.messenger.edit_html(status, &note).await;
        }

        // Serialize with other messages from this chat.
        let state = group.ctx.state.clone();
        let _guard = state.chat_locks.lock_chat(group.ctx.chat_id).await;
        (self.process)(group.ctx.clone(), group.items, group.caption).await;

        if let Some(status) = group.status_msg {
            let _ = state.messenger.delete_message(status).await;
        }
    }
}
