//! Outbound throttling decorator for any messaging adapter.
//!
//! Streaming edits can easily exceed the platform's flood limits. This
//! decorator spaces calls globally (~25/sec) and per chat (~1 msg/sec) before
//! they reach the wire. It reduces 429s, it does not eliminate them; the
//! renderer still handles the ones that get through.

use crate::messaging::{ChatAction, InlineKeyboard, MessagingCapabilities, MessagingPort};
use crate::{ChatId, MessageRef, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two API calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls targeting the same private chat.
    pub per_chat_min_interval: Duration,
    /// Minimum spacing for group chats, which allow ~20 messages/min.
    pub per_group_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1050),
            per_group_min_interval: Duration::from_millis(3200),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot; returns how long the caller must wait first.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn throttle_chat(&self, chat_id: i64) {
        // Group chats have negative ids and a tighter per-minute budget.
        let interval = if chat_id < 0 {
            self.cfg.per_group_min_interval
        } else {
            self.cfg.per_chat_min_interval
        };

        let global_wait = self.global.lock().await.reserve();
        let chat_wait = {
            let limiter = {
                let mut map = self.per_chat.lock().await;
                map.entry(chat_id)
                    .or_insert_with(|| Arc::new(Mutex::new(IntervalLimiter::new(interval))))
                    .clone()
            };
            let mut guard = limiter.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = self.global.lock().await.reserve();
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.throttle_chat(msg.chat_id.0).await;
        self.inner.edit_html(msg, html).await
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.throttle_chat(msg.chat_id.0).await;
        self.inner.delete_message(msg).await
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_chat_action(chat_id, action).await
    }

    async fn set_reaction(&self, msg: MessageRef, emoji: &str) -> Result<()> {
        self.throttle_chat(msg.chat_id.0).await;
        self.inner.set_reaction(msg, emoji).await
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_inline_keyboard(chat_id, html, keyboard).await
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        // No chat id on callback answers; only the global limiter applies.
        self.throttle_global().await;
        self.inner.answer_callback_query(callback_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_limiter_spacing() {
        let mut limiter = IntervalLimiter::new(Duration::from_millis(100));
        assert!(limiter.reserve().is_zero());
        let second = limiter.reserve();
        assert!(second > Duration::from_millis(50));
        let third = limiter.reserve();
        assert!(third > second);
    }
}
