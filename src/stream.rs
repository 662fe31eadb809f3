//! Streaming renderer: maps status events onto live-edited chat messages.
//!
//! Each text segment (a contiguous run of assistant text between tool
//! invocations) owns one chat message that is edited as deltas arrive, with
//! per-segment throttling and duplicate suppression. Segments that outgrow the
//! platform limit are re-sent as chunks. Thinking and tool lines are separate
//! messages, optionally deleted on completion. A bottom progress indicator is
//! recreated after anything that would push it off the end.

use crate::config::Config;
use crate::error::TransportError;
use crate::format::{markdown_to_html, split_text, truncate_with_ellipsis};
use crate::messaging::MessagingPort;
use crate::{ChatId, Error, MessageRef, Result};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Status event kinds emitted by the session runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Thinking,
    Tool,
    Text,
    SegmentEnd,
    Done,
}

/// Renderer policy knobs, a snapshot of the relevant config.
#[derive(Clone, Copy, Debug)]
pub struct RenderOptions {
    pub message_limit: usize,
    pub safe_limit: usize,
    pub throttle: Duration,
    pub spinner_enabled: bool,
    pub show_elapsed: bool,
    pub reaction_enabled: bool,
    pub delete_thinking_messages: bool,
    pub delete_tool_messages: bool,
}

impl From<&Config> for RenderOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            message_limit: cfg.message_limit,
            safe_limit: cfg.safe_limit,
            throttle: cfg.streaming_throttle,
            spinner_enabled: cfg.spinner_enabled,
            show_elapsed: cfg.show_elapsed,
            reaction_enabled: cfg.reaction_enabled,
            delete_thinking_messages: cfg.delete_thinking_messages,
            delete_tool_messages: cfg.delete_tool_messages,
        }
    }
}

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

pub const REACTION_RECEIVED: &str = "👀";
pub const REACTION_WORKING: &str = "✍";
pub const REACTION_WAITING: &str = "🙏";
pub const REACTION_DONE: &str = "👍";

#[derive(Clone, Debug)]
struct ProgressStart {
    instant: Instant,
    wallclock: DateTime<Local>,
}

/// Per-request rendering state.
pub struct StreamRenderer {
    pub chat_id: ChatId,
    opts: RenderOptions,
    /// The user message that triggered this request, for reactions.
    origin: Option<MessageRef>,

    text_messages: HashMap<u32, MessageRef>,
    thinking_messages: Vec<MessageRef>,
    tool_messages: Vec<MessageRef>,

    last_edit_at: HashMap<u32, Instant>,
    last_sent_content: HashMap<u32, String>,

    progress_message: Option<MessageRef>,
    start: Option<ProgressStart>,
    frame_index: usize,

    rate_limited_notified: bool,
    done: bool,
}

impl StreamRenderer {
    pub fn new(chat_id: ChatId, origin: Option<MessageRef>, opts: RenderOptions) -> Self {
        Self {
            chat_id,
            opts,
            origin,
            text_messages: HashMap::new(),
            thinking_messages: Vec::new(),
            tool_messages: Vec::new(),
            last_edit_at: HashMap::new(),
            last_sent_content: HashMap::new(),
            progress_message: None,
            start: None,
            frame_index: 0,
            rate_limited_notified: false,
            done: false,
        }
    }

    pub async fn on_status(
        &mut self,
        api: &dyn MessagingPort,
        kind: StatusKind,
        content: &str,
        segment_id: Option<u32>,
    ) -> Result<()> {
        self.on_status_at(api, kind, content, segment_id, Instant::now())
            .await
    }

    pub async fn on_status_at(
        &mut self,
        api: &dyn MessagingPort,
        kind: StatusKind,
        content: &str,
        segment_id: Option<u32>,
        now: Instant,
    ) -> Result<()> {
        if self.done {
            return Ok(());
        }

        if self.start.is_none() {
            self.start = Some(ProgressStart {
                instant: now,
                wallclock: Local::now(),
            });
            if self.opts.reaction_enabled {
                self.react_origin(api, REACTION_WORKING).await;
            }
            self.recreate_progress(api).await;
        }

        match kind {
            StatusKind::Thinking => {
                let preview = truncate_with_ellipsis(content, 500);
                let html = format!("🧠 <i>{}</i>", crate::format::escape_html(&preview));
                if let Some(msg) = self.send(api, &html).await {
                    self.thinking_messages.push(msg);
                }
                self.recreate_progress(api).await;
            }
            StatusKind::Tool => {
                if let Some(msg) = self.send(api, content).await {
                    self.tool_messages.push(msg);
                }
                self.recreate_progress(api).await;
            }
            StatusKind::Text => {
                if let Some(seg) = segment_id {
                    self.handle_text(api, seg, content, now).await;
                }
            }
            StatusKind::SegmentEnd => {
                if let Some(seg) = segment_id {
                    self.handle_segment_end(api, seg, content).await;
                }
            }
            StatusKind::Done => {
                self.handle_done(api).await;
                self.done = true;
            }
        }

        Ok(())
    }

    /// Advance the spinner; call from a 1 s interval while a query runs.
    pub async fn tick_progress(&mut self, api: &dyn MessagingPort) {
        if self.done || !self.opts.spinner_enabled {
            return;
        }
        let (Some(start), Some(msg)) = (self.start.as_ref(), self.progress_message) else {
            return;
        };
        self.frame_index = self.frame_index.wrapping_add(1);
        let text = format!(
            "{} Working... ({})",
            SPINNER_FRAMES[self.frame_index % SPINNER_FRAMES.len()],
            format_elapsed(start.instant)
        );
        let _ = api.edit_html(msg, &text).await;
    }

    async fn handle_text(
        &mut self,
        api: &dyn MessagingPort,
        segment_id: u32,
        content: &str,
        now: Instant,
    ) {
        if !self.text_messages.contains_key(&segment_id) {
            let display = truncate_with_ellipsis(content, self.opts.safe_limit);
            let formatted = markdown_to_html(&display);
            if let Some(msg) = self.send(api, &formatted).await {
                self.text_messages.insert(segment_id, msg);
                self.last_sent_content.insert(segment_id, formatted);
                self.last_edit_at.insert(segment_id, now);
            }
            self.recreate_progress(api).await;
            return;
        }

        if let Some(last) = self.last_edit_at.get(&segment_id) {
            if now.duration_since(*last) <= self.opts.throttle {
                return;
            }
        }

        let display = truncate_with_ellipsis(content, self.opts.safe_limit);
        let formatted = markdown_to_html(&display);
        if self.last_sent_content.get(&segment_id) == Some(&formatted) {
            return;
        }

        let msg = self.text_messages[&segment_id];
        if self.edit(api, msg, &formatted).await {
            self.last_sent_content.insert(segment_id, formatted);
            self.last_edit_at.insert(segment_id, now);
        }
    }

    async fn handle_segment_end(&mut self, api: &dyn MessagingPort, segment_id: u32, content: &str) {
        if content.is_empty() {
            return;
        }

        let formatted = markdown_to_html(content);

        if !self.text_messages.contains_key(&segment_id) {
            // Short segment that never streamed: send it whole (or split).
            if formatted.len() <= self.opts.message_limit {
                if let Some(msg) = self.send(api, &formatted).await {
                    self.text_messages.insert(segment_id, msg);
                    self.last_sent_content.insert(segment_id, formatted);
                }
                self.recreate_progress(api).await;
                return;
            }
            self.split_and_send(api, segment_id, content).await;
            return;
        }

        if self.last_sent_content.get(&segment_id) == Some(&formatted) {
            return;
        }

        if formatted.len() <= self.opts.message_limit {
            let msg = self.text_messages[&segment_id];
            if self.edit(api, msg, &formatted).await {
                self.last_sent_content.insert(segment_id, formatted);
            }
            return;
        }

        // Overflow: drop the tracked message and re-send as chunks.
        let msg = self.text_messages[&segment_id];
        let _ = api.delete_message(msg).await;
        self.text_messages.remove(&segment_id);
        self.last_sent_content.remove(&segment_id);
        self.last_edit_at.remove(&segment_id);
        self.split_and_send(api, segment_id, content).await;
    }

    /// Re-send an overflowing segment as chunks; the last chunk's handle
    /// becomes the tracked handle for the segment.
    async fn split_and_send(&mut self, api: &dyn MessagingPort, segment_id: u32, content: &str) {
        for chunk in split_text(content, self.opts.safe_limit) {
            let html = markdown_to_html(&chunk);
            if let Some(msg) = self.send(api, &html).await {
                self.text_messages.insert(segment_id, msg);
                self.last_sent_content.insert(segment_id, html);
            }
        }
        self.recreate_progress(api).await;
    }

    async fn handle_done(&mut self, api: &dyn MessagingPort) {
        // Completion footer onto the last segment message.
        if self.opts.show_elapsed {
            let last = self
                .text_messages
                .iter()
                .max_by_key(|(k, _)| **k)
                .map(|(k, v)| (*k, *v));
            if let (Some(start), Some((seg, last_msg))) = (self.start.as_ref(), last) {
                let footer = format!(
                    "\n\n<i>⏱ {} → {} ({})</i>",
                    start.wallclock.format("%H:%M:%S"),
                    Local::now().format("%H:%M:%S"),
                    format_elapsed(start.instant)
                );
                if let Some(body) = self.last_sent_content.get(&seg) {
                    let combined = format!("{body}{footer}");
                    if combined.len() <= self.opts.message_limit {
                        let _ = api.edit_html(last_msg, &combined).await;
                    }
                }
            }
        }

        if let Some(progress) = self.progress_message.take() {
            let _ = api.delete_message(progress).await;
        }

        if self.opts.delete_thinking_messages {
            for m in self.thinking_messages.drain(..) {
                let _ = api.delete_message(m).await;
            }
        }
        if self.opts.delete_tool_messages {
            for m in self.tool_messages.drain(..) {
                let _ = api.delete_message(m).await;
            }
        }

        if self.opts.reaction_enabled {
            self.react_origin(api, REACTION_DONE).await;
        }
    }

    async fn recreate_progress(&mut self, api: &dyn MessagingPort) {
        if !self.opts.spinner_enabled {
            return;
        }
        let Some(start) = self.start.as_ref() else {
            return;
        };

        if let Some(old) = self.progress_message.take() {
            let _ = api.delete_message(old).await;
        }

        let text = format!(
            "{} Working... ({})",
            SPINNER_FRAMES[self.frame_index % SPINNER_FRAMES.len()],
            format_elapsed(start.instant)
        );
        self.progress_message = self.send(api, &text).await;
    }

    /// Reactions are best-effort; failures are logged at debug.
    async fn react_origin(&self, api: &dyn MessagingPort, emoji: &str) {
        let Some(origin) = self.origin else {
            return;
        };
        if !api.capabilities().supports_reactions {
            return;
        }
        if let Err(error) = api.set_reaction(origin, emoji).await {
            tracing::debug!(%error, emoji, "reaction failed");
        }
    }

    async fn send(&mut self, api: &dyn MessagingPort, html: &str) -> Option<MessageRef> {
        match api.send_html(self.chat_id, html).await {
            Ok(msg) => Some(msg),
            Err(e) => {
                self.note_transport_error(api, &e).await;
                None
            }
        }
    }

    async fn edit(&mut self, api: &dyn MessagingPort, msg: MessageRef, html: &str) -> bool {
        match api.edit_html(msg, html).await {
            Ok(()) => true,
            Err(e) => {
                self.note_transport_error(api, &e).await;
                false
            }
        }
    }

    /// First flood-control error in a request marks the originating message
    /// with a waiting reaction; repeats are squelched until the next request.
    async fn note_transport_error(&mut self, api: &dyn MessagingPort, e: &Error) {
        match e {
            Error::Transport(TransportError::RateLimited { retry_after }) => {
                if self.rate_limited_notified {
                    return;
                }
                self.rate_limited_notified = true;
                tracing::warn!(chat_id = self.chat_id.0, ?retry_after, "chat API flood control hit");
                if self.opts.reaction_enabled {
                    self.react_origin(api, REACTION_WAITING).await;
                }
                tokio::time::sleep((*retry_after).min(Duration::from_secs(30))).await;
            }
            other => {
                tracing::debug!(error = %other, chat_id = self.chat_id.0, "outbound message failed");
            }
        }
    }
}

fn format_elapsed(start: Instant) -> String {
    let elapsed = start.elapsed().as_secs();
    format!("{}:{:02}", elapsed / 60, elapsed % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{ChatAction, InlineKeyboard, MessagingCapabilities};
    use crate::MessageId;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMessenger {
        next_id: Mutex<i32>,
        sends: Mutex<Vec<String>>,
        edits: Mutex<Vec<(MessageRef, String)>>,
        deletes: Mutex<Vec<MessageRef>>,
        reactions: Mutex<Vec<(MessageRef, String)>>,
        fail_next_edit_with_429: Mutex<u32>,
    }

    impl FakeMessenger {
        fn alloc(&self, chat_id: ChatId) -> MessageRef {
            let mut guard = self.next_id.lock().unwrap();
            *guard += 1;
            MessageRef {
                chat_id,
                message_id: MessageId(*guard),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagingPort for FakeMessenger {
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
            self.sends.lock().unwrap().push(html.to_string());
            Ok(self.alloc(chat_id))
        }

        async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
            {
                let mut fail = self.fail_next_edit_with_429.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(Error::Transport(TransportError::RateLimited {
                        retry_after: Duration::from_millis(1),
                    }));
                }
            }
            self.edits.lock().unwrap().push((msg, html.to_string()));
            Ok(())
        }

        async fn delete_message(&self, msg: MessageRef) -> Result<()> {
            self.deletes.lock().unwrap().push(msg);
            Ok(())
        }

        async fn send_chat_action(&self, _chat_id: ChatId, _action: ChatAction) -> Result<()> {
            Ok(())
        }

        async fn set_reaction(&self, msg: MessageRef, emoji: &str) -> Result<()> {
            self.reactions.lock().unwrap().push((msg, emoji.to_string()));
            Ok(())
        }

        async fn send_inline_keyboard(
            &self,
            chat_id: ChatId,
            _html: &str,
            _keyboard: InlineKeyboard,
        ) -> Result<MessageRef> {
            Ok(self.alloc(chat_id))
        }

        async fn answer_callback_query(&self, _id: &str, _text: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    fn opts() -> RenderOptions {
        RenderOptions {
            message_limit: 4096,
            safe_limit: 4000,
            throttle: Duration::from_millis(500),
            spinner_enabled: true,
            show_elapsed: false,
            reaction_enabled: true,
            delete_thinking_messages: true,
            delete_tool_messages: true,
        }
    }

    fn origin() -> MessageRef {
        MessageRef {
            chat_id: ChatId(1),
            message_id: MessageId(1000),
        }
    }

    #[tokio::test]
    async fn test_text_edits_are_throttled_and_deduped() {
        let api = FakeMessenger::default();
        let mut r = StreamRenderer::new(ChatId(1), Some(origin()), opts());
        let now = Instant::now();

        r.on_status_at(&api, StatusKind::Text, "hello world", Some(0), now)
            .await
            .unwrap();
        assert!(api.sent().iter().any(|s| s.contains("hello world")));

        // Inside the throttle window: no edit.
        r.on_status_at(
            &api,
            StatusKind::Text,
            "hello world again",
            Some(0),
            now + Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(api.edits.lock().unwrap().is_empty());

        // Past the window: one edit.
        r.on_status_at(
            &api,
            StatusKind::Text,
            "hello world again",
            Some(0),
            now + Duration::from_millis(600),
        )
        .await
        .unwrap();
        assert_eq!(api.edits.lock().unwrap().len(), 1);

        // Identical content: skipped even past the window.
        r.on_status_at(
            &api,
            StatusKind::Text,
            "hello world again",
            Some(0),
            now + Duration::from_millis(1200),
        )
        .await
        .unwrap();
        assert_eq!(api.edits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overflow_segment_splits_into_chunks() {
        let api = FakeMessenger::default();
        let mut small = opts();
        small.message_limit = 120;
        small.safe_limit = 100;
        small.spinner_enabled = false;
        let mut r = StreamRenderer::new(ChatId(1), None, small);
        let now = Instant::now();

        r.on_status_at(&api, StatusKind::Text, "start", Some(0), now)
            .await
            .unwrap();

        let long = "word ".repeat(60); // 300 chars
        r.on_status_at(&api, StatusKind::SegmentEnd, &long, Some(0), now)
            .await
            .unwrap();

        // Tracked message deleted, content re-sent in ≤100-char chunks.
        assert_eq!(api.deletes.lock().unwrap().len(), 1);
        let sends = api.sent();
        let chunks: Vec<&String> = sends.iter().filter(|s| s.contains("word")).collect();
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.len() <= 120));

        // The tracked handle now points at the last chunk.
        let last_ref = *r.text_messages.get(&0).unwrap();
        assert_eq!(last_ref.message_id.0, api.next_id.lock().unwrap().clone());
    }

    #[tokio::test]
    async fn test_done_cleans_up_and_reacts() {
        let api = FakeMessenger::default();
        let mut r = StreamRenderer::new(ChatId(1), Some(origin()), opts());
        let now = Instant::now();

        r.on_status_at(&api, StatusKind::Thinking, "pondering", None, now)
            .await
            .unwrap();
        r.on_status_at(&api, StatusKind::Tool, "▶️ ls", None, now)
            .await
            .unwrap();
        r.on_status_at(&api, StatusKind::Text, "result text", Some(0), now)
            .await
            .unwrap();
        r.on_status_at(&api, StatusKind::Done, "", None, now)
            .await
            .unwrap();

        // Thinking + tool + progress deleted; text retained.
        assert!(api.deletes.lock().unwrap().len() >= 3);
        let reactions = api.reactions.lock().unwrap();
        assert!(reactions.iter().any(|(_, e)| e == REACTION_WORKING));
        assert!(reactions.iter().any(|(_, e)| e == REACTION_DONE));

        // Nothing renders after done.
        drop(reactions);
        let sends_before = api.sent().len();
        r.on_status_at(&api, StatusKind::Text, "late", Some(1), now)
            .await
            .unwrap();
        assert_eq!(api.sent().len(), sends_before);
    }

    #[tokio::test]
    async fn test_rate_limit_reaction_set_once() {
        let api = FakeMessenger::default();
        *api.fail_next_edit_with_429.lock().unwrap() = 2;
        let mut o = opts();
        o.spinner_enabled = false;
        let mut r = StreamRenderer::new(ChatId(1), Some(origin()), o);
        let now = Instant::now();

        r.on_status_at(&api, StatusKind::Text, "hello world", Some(0), now)
            .await
            .unwrap();
        // Two edits that both 429.
        r.on_status_at(&api, StatusKind::Text, "hello world 2!", Some(0), now + Duration::from_millis(600))
            .await
            .unwrap();
        r.on_status_at(&api, StatusKind::Text, "hello world 3!", Some(0), now + Duration::from_millis(1200))
            .await
            .unwrap();

        let waits = api
            .reactions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e == REACTION_WAITING)
            .count();
        assert_eq!(waits, 1);
    }
}
