//! Session manager and the event pipeline behind every query.
//!
//! One session object per process. A query spawns (or resumes) the agent,
//! decodes its event stream, enforces tool policy per event, segments
//! assistant text for the renderer, drains steering messages at tool
//! boundaries, and accumulates usage into persisted counters with
//! context-budget alarms.

use crate::agent::{AgentClient, AgentEvent, RunRequest, TokenUsage};
use crate::audit::{AuditEvent, AuditLog};
use crate::buttons::ButtonChannel;
use crate::config::Config;
use crate::error::{AgentError, SecurityError};
use crate::format::{escape_html, tool_status};
use crate::messaging::{InlineKeyboard, MessagingPort};
use crate::security::{check_command, PathPolicy};
use crate::stream::{RenderOptions, StatusKind, StreamRenderer};
use crate::{ChatId, Error, MessageRef, Result, UserId};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};

/// Cumulative context budget before the agent's window fills.
pub const CONTEXT_LIMIT: u64 = 200_000;
/// Crossing this arms the auto-save flow.
pub const SAVE_THRESHOLD: u64 = 180_000;
/// Completed queries after a restore during which alarms stay silent.
pub const RESTORE_COOLDOWN_QUERIES: u64 = 50;

const STEERING_BUFFER_MAX: usize = 8;

/// Returned instead of assistant text when an inline keyboard was surfaced
/// and the bridge is waiting for a button press.
pub const WAITING_SENTINEL: &str = "[Waiting for user selection]";

/// Outcome of a `stop()` call; stop is idempotent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// A running query was told to abort.
    Stopped,
    /// The query had not spawned yet; it will fail before starting.
    Pending,
    /// Nothing was running.
    Noop,
}

/// Context-budget thresholds crossed by the just-completed query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextAlarm {
    Warn70,
    Warn85,
    Warn95,
    SaveRequired,
}

impl ContextAlarm {
    pub fn percent(self) -> u8 {
        match self {
            ContextAlarm::Warn70 => 70,
            ContextAlarm::Warn85 => 85,
            ContextAlarm::Warn95 => 95,
            ContextAlarm::SaveRequired => 90,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    session_id: Option<String>,
    is_running: bool,
    stop_requested: bool,
    interrupted_by_new_message: bool,
    last_message: Option<String>,

    session_start_time: Option<String>,
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_cache_read_tokens: u64,
    total_cache_create_tokens: u64,
    total_queries: u64,
    last_usage: Option<TokenUsage>,

    warned_70: bool,
    warned_85: bool,
    warned_95: bool,
    save_required: bool,

    recently_restored: bool,
    messages_since_restore: u64,
}

/// Snapshot of session state for `/status`, `/stats` and `/context`.
#[derive(Clone, Debug)]
pub struct SessionStats {
    pub session_id: Option<String>,
    pub is_running: bool,
    pub last_message: Option<String>,
    pub session_start_time: Option<String>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_cache_create_tokens: u64,
    pub total_queries: u64,
    pub last_usage: Option<TokenUsage>,
    pub save_required: bool,
    pub recently_restored: bool,
    pub messages_since_restore: u64,
}

impl SessionStats {
    pub fn context_used(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }

    pub fn context_percent(&self) -> f64 {
        (self.context_used() as f64 / CONTEXT_LIMIT as f64) * 100.0
    }
}

/// Result of one query.
#[derive(Clone, Debug)]
pub struct TurnOutput {
    pub text: String,
    pub waiting_for_user: bool,
    pub usage: Option<TokenUsage>,
    pub session_id: Option<String>,
    pub context_alarms: Vec<ContextAlarm>,
}

/// Persisted session checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionFileData {
    session_id: String,
    saved_at: String,
    working_dir: String,
    #[serde(rename = "totalInputTokens")]
    total_input_tokens: u64,
    #[serde(rename = "totalOutputTokens")]
    total_output_tokens: u64,
    #[serde(rename = "totalQueries")]
    total_queries: u64,
    #[serde(rename = "sessionStartTime")]
    session_start_time: Option<String>,
}

/// High-level session manager owned by the dispatcher.
pub struct SessionManager {
    cfg: Arc<Config>,
    agent: Arc<dyn AgentClient>,
    buttons: Arc<dyn ButtonChannel>,
    audit: Arc<AuditLog>,
    state: Mutex<SessionState>,
    steering: Mutex<VecDeque<String>>,
}

impl SessionManager {
    pub fn new(
        cfg: Arc<Config>,
        agent: Arc<dyn AgentClient>,
        buttons: Arc<dyn ButtonChannel>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            cfg,
            agent,
            buttons,
            audit,
            state: Mutex::new(SessionState::default()),
            steering: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.session_id.is_some()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_running
    }

    /// Flag the next cancellation as user-initiated so the "Query stopped"
    /// notice is suppressed.
    pub async fn mark_interrupt(&self) {
        self.state.lock().await.interrupted_by_new_message = true;
    }

    pub async fn clear_stop_requested(&self) {
        self.state.lock().await.stop_requested = false;
    }

    pub async fn consume_interrupt_flag(&self) -> bool {
        let mut st = self.state.lock().await;
        let was = st.interrupted_by_new_message;
        st.interrupted_by_new_message = false;
        if was {
            st.stop_requested = false;
        }
        was
    }

    /// Idempotent stop. Phase A (pre-spawn) sets a flag the runner checks;
    /// phase B (running) aborts the agent.
    pub async fn stop(&self) -> StopOutcome {
        let outcome = {
            let mut st = self.state.lock().await;
            if !st.is_running {
                return StopOutcome::Noop;
            }
            let was_pending = st.stop_requested;
            st.stop_requested = true;
            if was_pending {
                StopOutcome::Pending
            } else {
                StopOutcome::Stopped
            }
        };

        // Post-completion cancellation can race the final result event.
        if let Err(error) = self.agent.cancel().await {
            tracing::warn!(%error, "cancel after completion (ignored)");
        }
        outcome
    }

    /// Clear the session entirely: id, counters, flags, steering backlog.
    pub async fn reset(&self) {
        {
            let mut st = self.state.lock().await;
            *st = SessionState::default();
        }
        self.steering.lock().await.clear();
        let _ = std::fs::remove_file(&self.cfg.session_file);
    }

    pub async fn set_last_message(&self, message: String) {
        self.state.lock().await.last_message = Some(message);
    }

    pub async fn last_message(&self) -> Option<String> {
        self.state.lock().await.last_message.clone()
    }

    /// Enter the restore cooldown: alarms silenced, flags cleared.
    pub async fn mark_restored(&self) {
        let mut st = self.state.lock().await;
        st.recently_restored = true;
        st.messages_since_restore = 0;
        st.warned_70 = false;
        st.warned_85 = false;
        st.warned_95 = false;
        st.save_required = false;
    }

    /// Consume the save-required flag; the caller runs the auto-save prompt.
    pub async fn take_save_required(&self) -> bool {
        let mut st = self.state.lock().await;
        std::mem::take(&mut st.save_required)
    }

    /// Buffer a steering message for injection at the next tool boundary.
    /// Returns false when the buffer is full.
    pub async fn queue_steering(&self, message: String) -> bool {
        let mut queue = self.steering.lock().await;
        if queue.len() >= STEERING_BUFFER_MAX {
            return false;
        }
        queue.push_back(message);
        true
    }

    pub async fn stats(&self) -> SessionStats {
        let st = self.state.lock().await;
        SessionStats {
            session_id: st.session_id.clone(),
            is_running: st.is_running,
            last_message: st.last_message.clone(),
            session_start_time: st.session_start_time.clone(),
            total_input_tokens: st.total_input_tokens,
            total_output_tokens: st.total_output_tokens,
            total_cache_read_tokens: st.total_cache_read_tokens,
            total_cache_create_tokens: st.total_cache_create_tokens,
            total_queries: st.total_queries,
            last_usage: st.last_usage.clone(),
            save_required: st.save_required,
            recently_restored: st.recently_restored,
            messages_since_restore: st.messages_since_restore,
        }
    }

    /// Restore the persisted session if it belongs to this working dir.
    pub async fn resume_last(&self) -> Result<(bool, String)> {
        let Some(data) = load_session_file(&self.cfg.session_file)? else {
            return Ok((false, "No saved session found".to_string()));
        };

        if data.working_dir != self.cfg.working_dir.to_string_lossy() {
            return Ok((
                false,
                format!("Session was for a different directory: {}", data.working_dir),
            ));
        }

        let mut st = self.state.lock().await;
        st.session_id = Some(data.session_id.clone());
        st.total_input_tokens = data.total_input_tokens;
        st.total_output_tokens = data.total_output_tokens;
        st.total_queries = data.total_queries;
        st.session_start_time = data.session_start_time.clone();

        Ok((
            true,
            format!(
                "Resumed session `{}` (saved at {})",
                short_id(&data.session_id),
                data.saved_at
            ),
        ))
    }

    /// Run one query and stream user-visible updates to the messenger.
    pub async fn send_message_to_chat(
        &self,
        chat_id: ChatId,
        actor: UserId,
        username: &str,
        prompt: &str,
        messenger: Arc<dyn MessagingPort>,
        origin: Option<MessageRef>,
    ) -> Result<TurnOutput> {
        let (resume, is_new_session) = {
            let st = self.state.lock().await;
            (st.session_id.clone(), st.session_id.is_none())
        };

        // The first query of a fresh session learns the wall-clock context.
        let prompt_to_send = if is_new_session {
            let now = Local::now().format("%A, %B %d, %Y, %H:%M %Z");
            format!("[Current date/time: {now}]\n\n{prompt}")
        } else {
            prompt.to_string()
        };

        let max_thinking_tokens = thinking_tokens_for_prompt(&self.cfg, &prompt_to_send);
        let mcp_config_path = crate::agent::mcp::prepare_for_chat(&self.cfg, chat_id)?;

        let req = RunRequest {
            prompt: prompt_to_send,
            cwd: self.cfg.working_dir.clone(),
            add_dirs: self.cfg.allowed_paths.clone(),
            mcp_config_path,
            system_prompt: Some(self.cfg.safety_prompt.clone()),
            resume,
            max_thinking_tokens,
        };

        {
            let mut st = self.state.lock().await;
            if st.stop_requested {
                st.stop_requested = false;
                return Err(Error::Agent(AgentError::Cancelled));
            }
            st.is_running = true;
        }

        let result = self
            .run_pipeline(chat_id, actor, username, req, messenger, origin)
            .await;

        {
            let mut st = self.state.lock().await;
            st.is_running = false;
            st.stop_requested = false;
        }

        result
    }

    async fn run_pipeline(
        &self,
        chat_id: ChatId,
        actor: UserId,
        username: &str,
        req: RunRequest,
        messenger: Arc<dyn MessagingPort>,
        origin: Option<MessageRef>,
    ) -> Result<TurnOutput> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();

        let mut pipeline = EventPipeline {
            cfg: self.cfg.clone(),
            agent: self.agent.clone(),
            buttons: self.buttons.clone(),
            audit: self.audit.clone(),
            messenger: messenger.clone(),
            steering: &self.steering,
            renderer: StreamRenderer::new(chat_id, origin, RenderOptions::from(&*self.cfg)),
            paths: PathPolicy::from_config(&self.cfg),
            actor,
            username: username.to_string(),
            response_parts: Vec::new(),
            segment_id: 0,
            segment_text: String::new(),
            last_snapshot: String::new(),
            last_text_emit: None,
            observed_session: None,
            last_usage: None,
            final_result_text: None,
            ask_user_triggered: false,
            ask_user_buttons_sent: false,
        };

        // Drive the model and the pipeline concurrently: the pipeline owns the
        // renderer and ticks its progress spinner between events. The event
        // sender lives inside the run future so the pipeline's receiver sees
        // end-of-stream exactly when the model loop ends.
        let run_fut = async {
            let mut on_event = move |ev: AgentEvent| -> Result<()> {
                tx.send(ev)
                    .map_err(|_| Error::Agent(AgentError::Protocol("event pipeline closed".into())))
            };
            let run = self.agent.run(req, &mut on_event);
            match tokio::time::timeout(self.cfg.query_timeout, run).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = self.agent.cancel().await;
                    Err(Error::Agent(AgentError::Timeout(self.cfg.query_timeout)))
                }
            }
        };

        let pipeline_fut = async {
            let mut tick = interval(Duration::from_secs(1));
            let mut failure: Option<Error> = None;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        pipeline.renderer.tick_progress(messenger.as_ref()).await;
                    }
                    maybe = rx.recv() => {
                        let Some(ev) = maybe else { break };
                        if let Err(e) = pipeline.handle_event(ev).await {
                            failure = Some(e);
                            break;
                        }
                        if pipeline.ask_user_triggered {
                            break;
                        }
                    }
                }
            }
            // Drain whatever the decoder still sends after a break.
            rx.close();
            match failure {
                Some(e) => Err(e),
                None => pipeline.finish().await,
            }
        };

        let (model_result, pipeline_result) = tokio::join!(run_fut, pipeline_fut);
        let out = pipeline_result?;

        // The session id is checkpointed as soon as it is seen, even when the
        // run itself failed or was cancelled.
        if let Some(id) = out.session_id.clone() {
            self.persist_observed_session(&id).await?;
        }

        let mut out = out;
        if let Some(usage) = out.usage.clone() {
            out.context_alarms = self.accumulate_usage(&usage).await;
            self.checkpoint().await;
        }

        if out.waiting_for_user {
            return Ok(out);
        }
        match model_result {
            Ok(_) => Ok(out),
            Err(e) => Err(e),
        }
    }

    async fn persist_observed_session(&self, session_id: &str) -> Result<()> {
        {
            let mut st = self.state.lock().await;
            if st.session_id.is_none() {
                st.session_id = Some(session_id.to_string());
            }
        }
        self.checkpoint().await;
        Ok(())
    }

    /// Write the session file from current state. Best-effort.
    async fn checkpoint(&self) {
        let data = {
            let st = self.state.lock().await;
            let Some(id) = st.session_id.clone() else {
                return;
            };
            SessionFileData {
                session_id: id,
                saved_at: Utc::now().to_rfc3339(),
                working_dir: self.cfg.working_dir.to_string_lossy().to_string(),
                total_input_tokens: st.total_input_tokens,
                total_output_tokens: st.total_output_tokens,
                total_queries: st.total_queries,
                session_start_time: st.session_start_time.clone(),
            }
        };
        if let Err(error) = save_session_file(&self.cfg.session_file, &data) {
            tracing::warn!(%error, "session checkpoint failed");
        }
    }

    /// Fold a completed query's usage into the cumulative counters and
    /// report any newly crossed context thresholds.
    async fn accumulate_usage(&self, usage: &TokenUsage) -> Vec<ContextAlarm> {
        let mut st = self.state.lock().await;
        if st.session_start_time.is_none() {
            st.session_start_time = Some(Utc::now().to_rfc3339());
        }

        st.total_input_tokens += usage.input_tokens;
        st.total_output_tokens += usage.output_tokens;
        st.total_cache_read_tokens += usage.cache_read_input_tokens;
        st.total_cache_create_tokens += usage.cache_creation_input_tokens;
        st.total_queries += 1;
        st.last_usage = Some(usage.clone());

        if st.recently_restored {
            st.messages_since_restore += 1;
            if st.messages_since_restore >= RESTORE_COOLDOWN_QUERIES {
                st.recently_restored = false;
            }
            return Vec::new();
        }

        let used = st.total_input_tokens + st.total_output_tokens;
        let mut alarms = Vec::new();

        if !st.warned_70 && used * 100 >= CONTEXT_LIMIT * 70 {
            st.warned_70 = true;
            alarms.push(ContextAlarm::Warn70);
        }
        if !st.warned_85 && used * 100 >= CONTEXT_LIMIT * 85 {
            st.warned_85 = true;
            alarms.push(ContextAlarm::Warn85);
        }
        if !st.warned_95 && used * 100 >= CONTEXT_LIMIT * 95 {
            st.warned_95 = true;
            alarms.push(ContextAlarm::Warn95);
        }
        if !st.save_required && used >= SAVE_THRESHOLD {
            st.save_required = true;
            alarms.push(ContextAlarm::SaveRequired);
        }

        alarms
    }
}

/// Append a human timestamp to a user prompt.
pub fn add_timestamp(message: &str) -> String {
    let ts = Local::now().format("%a %b %d %H:%M %Z");
    format!("{message}\n\n<timestamp>{ts}</timestamp>")
}

fn thinking_tokens_for_prompt(cfg: &Config, prompt: &str) -> u32 {
    let lower = prompt.to_lowercase();
    if cfg
        .thinking_deep_keywords
        .iter()
        .any(|k| !k.is_empty() && lower.contains(k))
    {
        return 50_000;
    }
    if cfg
        .thinking_keywords
        .iter()
        .any(|k| !k.is_empty() && lower.contains(k))
    {
        return 10_000;
    }
    cfg.default_thinking_tokens
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn load_session_file(path: &std::path::Path) -> Result<Option<SessionFileData>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&txt)?))
}

fn save_session_file(path: &std::path::Path, data: &SessionFileData) -> Result<()> {
    std::fs::write(path, serde_json::to_string(data)?)?;
    Ok(())
}

fn is_ask_user_tool(tool_name: &str) -> bool {
    tool_name.starts_with("mcp__ask-user") || tool_name == "AskUserQuestion"
}

/// Per-query event processor. Owns the renderer and segmentation state.
struct EventPipeline<'a> {
    cfg: Arc<Config>,
    agent: Arc<dyn AgentClient>,
    buttons: Arc<dyn ButtonChannel>,
    audit: Arc<AuditLog>,
    messenger: Arc<dyn MessagingPort>,
    steering: &'a Mutex<VecDeque<String>>,
    renderer: StreamRenderer,
    paths: PathPolicy,
    actor: UserId,
    username: String,

    response_parts: Vec<String>,
    segment_id: u32,
    segment_text: String,
    last_snapshot: String,
    last_text_emit: Option<Instant>,

    observed_session: Option<String>,
    last_usage: Option<TokenUsage>,
    final_result_text: Option<String>,
    ask_user_triggered: bool,
    ask_user_buttons_sent: bool,
}

impl EventPipeline<'_> {
    async fn handle_event(&mut self, ev: AgentEvent) -> Result<()> {
        match ev {
            AgentEvent::SessionInit { session_id } => {
                if self.observed_session.is_none() {
                    tracing::debug!(session_id = %session_id, "agent session started");
                    self.observed_session = Some(session_id);
                }
                Ok(())
            }
            AgentEvent::AssistantThinking { text } => {
                self.renderer
                    .on_status(self.messenger.as_ref(), StatusKind::Thinking, &text, None)
                    .await
            }
            AgentEvent::AssistantText { text } => self.handle_text_snapshot(&text).await,
            AgentEvent::ToolUse { name, input } => self.handle_tool_use(&name, input).await,
            AgentEvent::ToolProgress { raw } => {
                tracing::trace!(?raw, "tool progress");
                Ok(())
            }
            AgentEvent::Result { usage, text, .. } => {
                self.last_usage = usage;
                self.final_result_text = text;
                Ok(())
            }
            AgentEvent::Unknown { raw } => {
                tracing::trace!(?raw, "ignoring unknown agent event");
                Ok(())
            }
        }
    }

    /// Assistant text arrives as growing snapshots; emit only the new suffix.
    async fn handle_text_snapshot(&mut self, snapshot: &str) -> Result<()> {
        if snapshot.starts_with(&self.last_snapshot) {
            let delta = snapshot[self.last_snapshot.len()..].to_string();
            if !delta.is_empty() {
                self.append_text_delta(&delta).await?;
            }
            self.last_snapshot = snapshot.to_string();
            return Ok(());
        }

        // Not an extension of what we saw; treat as a fresh delta.
        if !snapshot.is_empty() {
            self.append_text_delta(snapshot).await?;
        }
        self.last_snapshot = self.segment_text.clone();
        Ok(())
    }

    async fn append_text_delta(&mut self, text: &str) -> Result<()> {
        self.response_parts.push(text.to_string());
        self.segment_text.push_str(text);

        let now = Instant::now();
        let should_emit = self.segment_text.len() > 20
            && self
                .last_text_emit
                .map(|t| now.duration_since(t) > self.cfg.streaming_throttle)
                .unwrap_or(true);

        if should_emit {
            self.renderer
                .on_status(
                    self.messenger.as_ref(),
                    StatusKind::Text,
                    &self.segment_text,
                    Some(self.segment_id),
                )
                .await?;
            self.last_text_emit = Some(now);
        }
        Ok(())
    }

    async fn handle_tool_use(&mut self, name: &str, input: serde_json::Value) -> Result<()> {
        if let Err(reason) = self.check_tool_policy(name, &input).await {
            self.audit.append_best_effort(AuditEvent::tool_use(
                self.actor.0,
                &self.username,
                name,
                input,
                true,
                Some(&reason),
            ));

            let _ = self.agent.cancel().await;
            let _ = self
                .renderer
                .on_status(
                    self.messenger.as_ref(),
                    StatusKind::Tool,
                    &format!("🚫 BLOCKED: {}", escape_html(&reason)),
                    None,
                )
                .await;

            return Err(match name {
                "Bash" => Error::Security(SecurityError::BlockedCommand { reason }),
                _ => Error::Security(SecurityError::BlockedPath { path: reason }),
            });
        }

        self.audit.append_best_effort(AuditEvent::tool_use(
            self.actor.0,
            &self.username,
            name,
            input.clone(),
            false,
            None,
        ));

        // Segment ends when a tool starts.
        if !self.segment_text.is_empty() {
            self.renderer
                .on_status(
                    self.messenger.as_ref(),
                    StatusKind::SegmentEnd,
                    &self.segment_text,
                    Some(self.segment_id),
                )
                .await?;
            self.segment_id += 1;
            self.segment_text.clear();
            self.last_snapshot.clear();
            self.last_text_emit = None;
        }

        // Steering messages are injected only at tool boundaries.
        self.inject_steering().await;

        if is_ask_user_tool(name) {
            self.ask_user_triggered = true;
            self.surface_button_request().await?;
            let _ = self.agent.cancel().await;
            return Ok(());
        }

        self.renderer
            .on_status(
                self.messenger.as_ref(),
                StatusKind::Tool,
                &tool_status(name, &input),
                None,
            )
            .await
    }

    async fn check_tool_policy(
        &self,
        name: &str,
        input: &serde_json::Value,
    ) -> std::result::Result<(), String> {
        if name.eq_ignore_ascii_case("Bash") {
            let cmd = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
            return check_command(cmd, &self.cfg.blocked_patterns, &self.paths);
        }

        if ["Read", "Write", "Edit"]
            .iter()
            .any(|t| name.eq_ignore_ascii_case(t))
        {
            let file_path = input.get("file_path").and_then(|v| v.as_str()).unwrap_or("");
            if file_path.is_empty() {
                return Ok(());
            }

            // Reads from bot-owned temp files and agent config are always fine.
            let read_exempt = name.eq_ignore_ascii_case("Read")
                && (file_path.contains("/.claude/")
                    || self
                        .cfg
                        .temp_paths
                        .iter()
                        .any(|p| file_path.starts_with(&*p.to_string_lossy())));

            if !read_exempt && !self.paths.is_path_allowed(file_path) {
                return Err(format!("access denied: {file_path}"));
            }
        }

        Ok(())
    }

    async fn inject_steering(&mut self) {
        let queued: Vec<String> = {
            let mut queue = self.steering.lock().await;
            queue.drain(..).collect()
        };
        if queued.is_empty() {
            return;
        }

        let frame = format!(
            "[USER SENT MESSAGE DURING EXECUTION]\n{}\n[END USER MESSAGE]",
            queued.join("\n")
        );
        if let Err(error) = self.agent.steer(&frame).await {
            tracing::warn!(%error, "steering injection failed");
        } else {
            tracing::debug!(count = queued.len(), "steering messages injected");
        }
    }

    /// Render a pending button request for this chat, with a short retry
    /// window for the tool server's file write.
    async fn surface_button_request(&mut self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        for attempt in 0..3 {
            if let Some(req) = self.buttons.poll(self.renderer.chat_id).await? {
                let keyboard = InlineKeyboard::one_per_row(
                    &req.request_id,
                    &req.options,
                    self.cfg.button_label_max,
                );
                self.messenger
                    .send_inline_keyboard(
                        self.renderer.chat_id,
                        &format!("❓ {}", escape_html(&req.question)),
                        keyboard,
                    )
                    .await?;
                self.buttons.mark_sent(&req.request_id).await?;
                self.ask_user_buttons_sent = true;
                return Ok(());
            }
            if attempt < 2 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        tracing::warn!(chat_id = %self.renderer.chat_id, "button tool fired but no request file appeared");
        Ok(())
    }

    async fn finish(mut self) -> Result<TurnOutput> {
        if self.ask_user_triggered {
            self.renderer
                .on_status(self.messenger.as_ref(), StatusKind::Done, "", None)
                .await?;
            return Ok(TurnOutput {
                text: WAITING_SENTINEL.to_string(),
                waiting_for_user: true,
                usage: self.last_usage,
                session_id: self.observed_session,
                context_alarms: Vec::new(),
            });
        }

        if !self.segment_text.is_empty() {
            self.renderer
                .on_status(
                    self.messenger.as_ref(),
                    StatusKind::SegmentEnd,
                    &self.segment_text,
                    Some(self.segment_id),
                )
                .await?;
        }

        self.renderer
            .on_status(self.messenger.as_ref(), StatusKind::Done, "", None)
            .await?;

        let text = if self.response_parts.is_empty() {
            self.final_result_text
                .unwrap_or_else(|| "No response from the agent.".to_string())
        } else {
            self.response_parts.join("")
        };

        Ok(TurnOutput {
            text,
            waiting_for_user: false,
            usage: self.last_usage,
            session_id: self.observed_session,
            context_alarms: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentCapabilities;
    use crate::buttons::ButtonRequest;
    use crate::messaging::{ChatAction, MessagingCapabilities};
    use crate::MessageId;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn tmp_path(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        PathBuf::from(format!("/tmp/{prefix}-{}-{ts}", std::process::id()))
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            bot_token: "x".into(),
            allowed_users: vec![1],
            working_dir: "/tmp".into(),
            allowed_paths: vec!["/tmp".into()],
            temp_paths: vec!["/tmp/".into()],
            blocked_patterns: vec!["rm -rf /".into()],
            safety_prompt: "safety".into(),
            agent_path: "/usr/bin/true".into(),
            agent_config_dir: None,
            agent_model: None,
            query_timeout: Duration::from_secs(5),
            temp_dir: "/tmp".into(),
            session_file: tmp_path("session").with_extension("json"),
            restart_file: tmp_path("restart").with_extension("json"),
            message_limit: 4096,
            safe_limit: 4000,
            streaming_throttle: Duration::from_millis(0),
            button_label_max: 30,
            default_thinking_tokens: 0,
            thinking_keywords: vec!["think".into()],
            thinking_deep_keywords: vec!["ultrathink".into()],
            spinner_enabled: false,
            show_elapsed: false,
            reaction_enabled: false,
            delete_thinking_messages: false,
            delete_tool_messages: false,
            audit_log_path: tmp_path("audit").with_extension("log"),
            audit_log_json: true,
            rate_limit_enabled: false,
            rate_limit_requests: 20,
            rate_limit_window: Duration::from_secs(60),
            media_group_timeout: Duration::from_millis(1000),
            openai_api_key: None,
            transcription_prompt: "t".into(),
        })
    }

    /// Scripted agent: plays back events, records steering and cancels.
    struct FakeAgent {
        script: Vec<AgentEvent>,
        steered: StdMutex<Vec<String>>,
        cancels: AtomicUsize,
    }

    impl FakeAgent {
        fn new(script: Vec<AgentEvent>) -> Self {
            Self {
                script,
                steered: StdMutex::new(Vec::new()),
                cancels: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentClient for FakeAgent {
        fn capabilities(&self) -> AgentCapabilities {
            AgentCapabilities {
                streaming: true,
                tools: true,
                vision: true,
                thinking: true,
                mcp: true,
            }
        }

        async fn run(
            &self,
            _req: RunRequest,
            on_event: &mut (dyn FnMut(AgentEvent) -> Result<()> + Send),
        ) -> Result<crate::agent::RunResult> {
            for ev in &self.script {
                if on_event(ev.clone()).is_err() {
                    break;
                }
            }
            Ok(crate::agent::RunResult {
                session_id: Some("s1".into()),
                is_error: false,
                text: String::new(),
                usage: None,
            })
        }

        async fn steer(&self, text: &str) -> Result<()> {
            self.steered.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn cancel(&self) -> Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeButtons {
        pending: StdMutex<Vec<ButtonRequest>>,
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ButtonChannel for FakeButtons {
        async fn poll(&self, chat_id: ChatId) -> Result<Option<ButtonRequest>> {
            Ok(self
                .pending
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.chat_id == chat_id)
                .cloned())
        }

        async fn mark_sent(&self, request_id: &str) -> Result<()> {
            self.sent.lock().unwrap().push(request_id.to_string());
            self.pending
                .lock()
                .unwrap()
                .retain(|r| r.request_id != request_id);
            Ok(())
        }

        async fn get(&self, _request_id: &str) -> Result<Option<ButtonRequest>> {
            Ok(None)
        }

        async fn remove(&self, _request_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMessenger {
        next_id: StdMutex<i32>,
        sends: StdMutex<Vec<String>>,
        keyboards: StdMutex<Vec<(ChatId, String, InlineKeyboard)>>,
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

        async fn edit_html(&self, _msg: MessageRef, html: &str) -> Result<()> {
            self.sends.lock().unwrap().push(html.to_string());
            Ok(())
        }

        async fn delete_message(&self, _msg: MessageRef) -> Result<()> {
            Ok(())
        }

        async fn send_chat_action(&self, _chat_id: ChatId, _action: ChatAction) -> Result<()> {
            Ok(())
        }

        async fn set_reaction(&self, _msg: MessageRef, _emoji: &str) -> Result<()> {
            Ok(())
        }

        async fn send_inline_keyboard(
            &self,
            chat_id: ChatId,
            html: &str,
            keyboard: InlineKeyboard,
        ) -> Result<MessageRef> {
            self.keyboards
                .lock()
                .unwrap()
                .push((chat_id, html.to_string(), keyboard));
            Ok(self.alloc(chat_id))
        }

        async fn answer_callback_query(&self, _id: &str, _text: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    fn manager(agent: Arc<FakeAgent>, buttons: Arc<FakeButtons>) -> SessionManager {
        let cfg = test_config();
        let audit = Arc::new(AuditLog::new(cfg.audit_log_path.clone(), true));
        SessionManager::new(cfg, agent, buttons, audit)
    }

    fn text_event(s: &str) -> AgentEvent {
        AgentEvent::AssistantText { text: s.into() }
    }

    fn result_event(input: u64, output: u64) -> AgentEvent {
        AgentEvent::Result {
            usage: Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
                ..Default::default()
            }),
            duration_ms: Some(10),
            text: None,
            is_error: false,
        }
    }

    #[tokio::test]
    async fn test_segments_split_on_tool_use() {
        let agent = Arc::new(FakeAgent::new(vec![
            AgentEvent::SessionInit { session_id: "s1".into() },
            text_event("hello "),
            text_event("hello world"),
            AgentEvent::ToolUse {
                name: "Write".into(),
                input: serde_json::json!({"file_path": "/tmp/x.txt"}),
            },
            text_event("done"),
            result_event(10, 20),
        ]));
        let m = manager(agent.clone(), Arc::new(FakeButtons::default()));
        let api = Arc::new(FakeMessenger::default());

        let out = m
            .send_message_to_chat(ChatId(1), UserId(1), "u", "hi", api.clone(), None)
            .await
            .unwrap();

        // Snapshot prefix-diff: "hello " + "world" + "done".
        assert_eq!(out.text, "hello worlddone");
        assert_eq!(out.session_id.as_deref(), Some("s1"));

        let sent = api.sent();
        let seg0 = sent.iter().position(|s| s == "hello world").unwrap();
        let tool = sent.iter().position(|s| s.contains("Writing")).unwrap();
        let seg1 = sent.iter().position(|s| s == "done").unwrap();
        assert!(seg0 < tool && tool < seg1, "order was {sent:?}");
    }

    #[tokio::test]
    async fn test_blocked_command_cancels_and_reports() {
        let agent = Arc::new(FakeAgent::new(vec![
            AgentEvent::SessionInit { session_id: "s1".into() },
            AgentEvent::ToolUse {
                name: "Bash".into(),
                input: serde_json::json!({"command": "bash -c 'rm -rf /tmp/../..'"}),
            },
        ]));
        let m = manager(agent.clone(), Arc::new(FakeButtons::default()));
        let api = Arc::new(FakeMessenger::default());

        let err = m
            .send_message_to_chat(ChatId(1), UserId(1), "u", "hi", api.clone(), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Security(SecurityError::BlockedCommand { .. })
        ));
        assert!(agent.cancels.load(Ordering::SeqCst) >= 1);
        assert!(api.sent().iter().any(|s| s.contains("BLOCKED")));
    }

    #[tokio::test]
    async fn test_file_write_outside_allowed_blocked() {
        let agent = Arc::new(FakeAgent::new(vec![AgentEvent::ToolUse {
            name: "Write".into(),
            input: serde_json::json!({"file_path": "/etc/passwd"}),
        }]));
        let m = manager(agent.clone(), Arc::new(FakeButtons::default()));
        let api = Arc::new(FakeMessenger::default());

        let err = m
            .send_message_to_chat(ChatId(1), UserId(1), "u", "hi", api.clone(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Security(SecurityError::BlockedPath { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_from_temp_exempt() {
        let agent = Arc::new(FakeAgent::new(vec![
            AgentEvent::ToolUse {
                name: "Read".into(),
                input: serde_json::json!({"file_path": "/tmp/relaybot/photo_1.jpg"}),
            },
            result_event(1, 1),
        ]));
        let m = manager(agent.clone(), Arc::new(FakeButtons::default()));
        let api = Arc::new(FakeMessenger::default());

        let out = m
            .send_message_to_chat(ChatId(1), UserId(1), "u", "hi", api.clone(), None)
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn test_steering_injected_at_tool_boundary() {
        let agent = Arc::new(FakeAgent::new(vec![
            text_event("working on it"),
            AgentEvent::ToolUse {
                name: "Bash".into(),
                input: serde_json::json!({"command": "ls"}),
            },
            result_event(1, 1),
        ]));
        let m = manager(agent.clone(), Arc::new(FakeButtons::default()));
        let api = Arc::new(FakeMessenger::default());

        assert!(m.queue_steering("also check tests".into()).await);

        m.send_message_to_chat(ChatId(1), UserId(1), "u", "hi", api, None)
            .await
            .unwrap();

        let steered = agent.steered.lock().unwrap();
        assert_eq!(steered.len(), 1);
        assert_eq!(
            steered[0],
            "[USER SENT MESSAGE DURING EXECUTION]\nalso check tests\n[END USER MESSAGE]"
        );
        drop(steered);
        assert!(m.steering.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_ask_user_short_circuits_with_sentinel() {
        let buttons = Arc::new(FakeButtons::default());
        buttons.pending.lock().unwrap().push(ButtonRequest {
            request_id: "r1".into(),
            chat_id: ChatId(1),
            question: "Pick one".into(),
            options: vec!["a".into(), "b".into()],
        });

        let agent = Arc::new(FakeAgent::new(vec![AgentEvent::ToolUse {
            name: "mcp__ask-user__ask_user".into(),
            input: serde_json::json!({}),
        }]));
        let m = manager(agent.clone(), buttons.clone());
        let api = Arc::new(FakeMessenger::default());

        let out = m
            .send_message_to_chat(ChatId(1), UserId(1), "u", "hi", api.clone(), None)
            .await
            .unwrap();

        assert!(out.waiting_for_user);
        assert_eq!(out.text, WAITING_SENTINEL);
        assert!(agent.cancels.load(Ordering::SeqCst) >= 1);

        let keyboards = api.keyboards.lock().unwrap();
        assert_eq!(keyboards.len(), 1);
        assert!(keyboards[0].1.contains("Pick one"));
        assert_eq!(buttons.sent.lock().unwrap().as_slice(), &["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_usage_accumulates_and_alarms_fire_once() {
        let agent = Arc::new(FakeAgent::new(vec![result_event(100_000, 50_000)]));
        let m = manager(agent.clone(), Arc::new(FakeButtons::default()));
        let api = Arc::new(FakeMessenger::default());

        let out = m
            .send_message_to_chat(ChatId(1), UserId(1), "u", "one", api.clone(), None)
            .await
            .unwrap();
        assert_eq!(out.context_alarms, vec![ContextAlarm::Warn70]);

        let stats = m.stats().await;
        assert_eq!(stats.total_queries, 1);
        assert_eq!(stats.context_used(), 150_000);

        // Second query pushes to 190k: 85%, 95% and the save threshold.
        let agent2: Arc<dyn AgentClient> = Arc::new(FakeAgent::new(vec![result_event(30_000, 10_000)]));
        let m2 = SessionManager { agent: agent2, ..m };
        let out = m2
            .send_message_to_chat(ChatId(1), UserId(1), "u", "two", api, None)
            .await
            .unwrap();
        assert_eq!(
            out.context_alarms,
            vec![
                ContextAlarm::Warn85,
                ContextAlarm::Warn95,
                ContextAlarm::SaveRequired
            ]
        );
        assert!(m2.take_save_required().await);
        assert!(!m2.take_save_required().await);
    }

    #[tokio::test]
    async fn test_restore_cooldown_silences_alarms() {
        let agent = Arc::new(FakeAgent::new(vec![result_event(150_000, 40_000)]));
        let m = manager(agent, Arc::new(FakeButtons::default()));
        let api = Arc::new(FakeMessenger::default());

        m.mark_restored().await;
        let out = m
            .send_message_to_chat(ChatId(1), UserId(1), "u", "hi", api, None)
            .await
            .unwrap();

        assert!(out.context_alarms.is_empty());
        let stats = m.stats().await;
        assert!(stats.recently_restored);
        assert_eq!(stats.messages_since_restore, 1);
    }

    #[tokio::test]
    async fn test_session_file_round_trip() {
        let agent = Arc::new(FakeAgent::new(vec![
            AgentEvent::SessionInit { session_id: "sess-abc".into() },
            result_event(123, 456),
        ]));
        let cfg = test_config();
        let session_file = cfg.session_file.clone();
        let audit = Arc::new(AuditLog::new(cfg.audit_log_path.clone(), true));
        let m = SessionManager::new(cfg.clone(), agent, Arc::new(FakeButtons::default()), audit);
        let api = Arc::new(FakeMessenger::default());

        m.send_message_to_chat(ChatId(1), UserId(1), "u", "hi", api, None)
            .await
            .unwrap();

        let raw = std::fs::read_to_string(&session_file).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["session_id"], "sess-abc");
        assert_eq!(v["totalInputTokens"], 123);
        assert_eq!(v["totalOutputTokens"], 456);
        assert_eq!(v["totalQueries"], 1);

        // A fresh manager over the same file restores the counters.
        let audit = Arc::new(AuditLog::new(cfg.audit_log_path.clone(), true));
        let m2 = SessionManager::new(
            cfg,
            Arc::new(FakeAgent::new(vec![])),
            Arc::new(FakeButtons::default()),
            audit,
        );
        let (ok, _) = m2.resume_last().await.unwrap();
        assert!(ok);
        let stats = m2.stats().await;
        assert_eq!(stats.session_id.as_deref(), Some("sess-abc"));
        assert_eq!(stats.total_input_tokens, 123);
        assert_eq!(stats.total_output_tokens, 456);
        assert_eq!(stats.total_queries, 1);

        let _ = std::fs::remove_file(&session_file);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_idle() {
        let m = manager(
            Arc::new(FakeAgent::new(vec![])),
            Arc::new(FakeButtons::default()),
        );
        assert_eq!(m.stop().await, StopOutcome::Noop);
        assert_eq!(m.stop().await, StopOutcome::Noop);
    }

    #[tokio::test]
    async fn test_thinking_budget_keywords() {
        let cfg = test_config();
        assert_eq!(thinking_tokens_for_prompt(&cfg, "just do it"), 0);
        assert_eq!(thinking_tokens_for_prompt(&cfg, "think about this"), 10_000);
        assert_eq!(thinking_tokens_for_prompt(&cfg, "ULTRATHINK deeply"), 50_000);
    }
}
