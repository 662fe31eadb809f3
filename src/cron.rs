//! Scheduled prompts: a YAML manifest of cron jobs run against the session.
//!
//! Each enabled job gets its own timer task. Firings that land while the
//! session is busy are queued (bounded, oldest dropped) and drained one at a
//! time when a query completes. A sliding one-hour window caps total
//! executions. The manifest is watched by mtime and hot-reloaded.

use crate::config::Config;
use crate::format::escape_html;
use crate::messaging::{ChatAction, InlineKeyboard, MessagingCapabilities, MessagingPort};
use crate::session::SessionManager;
use crate::{ChatId, Error, MessageId, MessageRef, Result, UserId};
use chrono::Local;
use cron::Schedule;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_PROMPT_LENGTH: usize = 10_000;
const MAX_JOBS_PER_HOUR: usize = 60;
const MAX_PENDING: usize = 100;
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// One scheduled prompt from the manifest.
#[derive(Clone, Debug, Deserialize)]
pub struct CronJob {
    pub name: String,
    pub cron: String,
    pub prompt: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub notify: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct CronManifest {
    #[serde(default)]
    schedules: Vec<CronJob>,
}

struct JobEntry {
    schedule: Schedule,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, JobEntry>,
    watcher: Option<JoinHandle<()>>,
    watcher_cancel: Option<CancellationToken>,
    last_modified: Option<SystemTime>,

    execution_lock: bool,
    executions: VecDeque<Instant>,
    pending: VecDeque<CronJob>,
}

impl SchedulerState {
    /// Queue a job for later, dropping the oldest entry when full.
    fn queue(&mut self, job: CronJob) {
        if self.pending.len() >= MAX_PENDING {
            let dropped = self.pending.pop_front();
            tracing::warn!(
                dropped = dropped.as_ref().map(|j| j.name.as_str()),
                "cron queue full, dropping oldest"
            );
        }
        self.pending.push_back(job);
    }

    /// Record an execution if the hourly window allows another one.
    fn admit_execution(&mut self, now: Instant) -> bool {
        let one_hour = Duration::from_secs(3600);
        while self
            .executions
            .front()
            .map(|t| now.duration_since(*t) > one_hour)
            .unwrap_or(false)
        {
            self.executions.pop_front();
        }
        if self.executions.len() >= MAX_JOBS_PER_HOUR {
            return false;
        }
        self.executions.push_back(now);
        true
    }
}

/// Scheduler driving the manifest's jobs against the shared session.
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    cfg: Arc<Config>,
    session: Arc<SessionManager>,
    messenger: Arc<dyn MessagingPort>,
    state: Mutex<SchedulerState>,
}

impl CronScheduler {
    pub fn new(
        cfg: Arc<Config>,
        session: Arc<SessionManager>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                cfg,
                session,
                messenger,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// (Re)load the manifest and start timer tasks for enabled jobs.
    pub async fn start(&self) -> Result<usize> {
        self.stop_jobs().await;

        let path = self.inner.cfg.cron_manifest_path();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no cron manifest");
            return Ok(0);
        }

        let manifest = load_manifest(&path)?;
        let mut loaded = 0usize;

        for job in manifest.schedules {
            if !job.enabled {
                tracing::debug!(job = %job.name, "skipping disabled cron job");
                continue;
            }

            let schedule = match parse_cron_expr(&job.cron) {
                Ok(s) => s,
                Err(error) => {
                    tracing::error!(job = %job.name, %error, "invalid cron expression");
                    continue;
                }
            };

            let cancel = CancellationToken::new();
            let scheduler = self.clone();
            let job_for_task = job.clone();
            let schedule_for_task = schedule.clone();
            let cancel_for_task = cancel.clone();
            let handle = tokio::spawn(async move {
                scheduler
                    .job_loop(job_for_task, schedule_for_task, cancel_for_task)
                    .await;
            });

            let mut st = self.inner.state.lock().await;
            st.jobs.insert(
                job.name.clone(),
                JobEntry {
                    schedule,
                    cancel,
                    handle,
                },
            );
            loaded += 1;
        }

        tracing::info!(count = loaded, "cron jobs started");
        Ok(loaded)
    }

    /// Start the manifest watcher if it is not already running.
    pub async fn ensure_watcher(&self) {
        let path = self.inner.cfg.cron_manifest_path();

        let mut st = self.inner.state.lock().await;
        if st.watcher.is_some() {
            return;
        }

        let token = CancellationToken::new();
        st.watcher_cancel = Some(token.clone());

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(WATCH_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        scheduler.watch_tick(&path).await;
                    }
                }
            }
        });
        st.watcher = Some(handle);
        tracing::debug!("cron manifest watcher started");
    }

    async fn watch_tick(&self, path: &PathBuf) {
        if path.exists() {
            let modified = std::fs::metadata(path).and_then(|md| md.modified()).ok();
            let should_reload = {
                let mut st = self.inner.state.lock().await;
                match (st.last_modified, modified) {
                    (None, Some(m)) => {
                        st.last_modified = Some(m);
                        false
                    }
                    (Some(prev), Some(m)) if m > prev => {
                        st.last_modified = Some(m);
                        true
                    }
                    _ => false,
                }
            };

            if should_reload {
                tracing::info!("cron manifest changed, reloading");
                tokio::time::sleep(Duration::from_millis(100)).await;
                if let Err(error) = self.start().await {
                    tracing::error!(%error, "cron reload failed");
                }
            }
        }

        // Opportunistically drain the pending queue.
        if let Err(error) = self.process_queued_jobs().await {
            tracing::error!(%error, "queued cron job failed");
        }
    }

    pub async fn stop(&self) {
        {
            let mut st = self.inner.state.lock().await;
            if let Some(token) = st.watcher_cancel.take() {
                token.cancel();
            }
            if let Some(handle) = st.watcher.take() {
                handle.abort();
            }
        }
        self.stop_jobs().await;
    }

    pub async fn reload(&self) -> Result<usize> {
        self.start().await
    }

    async fn stop_jobs(&self) {
        let mut st = self.inner.state.lock().await;
        for (_, job) in st.jobs.drain() {
            job.cancel.cancel();
            job.handle.abort();
        }
        st.execution_lock = false;
    }

    /// Status overview for `/cron`.
    pub async fn status_html(&self) -> String {
        let st = self.inner.state.lock().await;
        if st.jobs.is_empty() {
            return "No scheduled jobs".to_string();
        }

        let mut lines = vec![format!("📅 <b>Scheduled Jobs ({})</b>", st.jobs.len())];
        let mut names: Vec<_> = st.jobs.keys().cloned().collect();
        names.sort();

        for name in names {
            let Some(job) = st.jobs.get(&name) else {
                continue;
            };
            let next = job
                .schedule
                .upcoming(Local)
                .next()
                .map(|dt| dt.format("%H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            lines.push(format!("• {}: next at {}", escape_html(&name), next));
        }

        if !st.pending.is_empty() {
            lines.push(format!("\n⏳ <b>Queued Jobs ({})</b>", st.pending.len()));
            for job in st.pending.iter() {
                lines.push(format!("• {}", escape_html(&job.name)));
            }
        }

        lines.join("\n")
    }

    /// Run at most one queued job, if the session is free.
    pub async fn process_queued_jobs(&self) -> Result<()> {
        if self.inner.session.is_running().await {
            return Ok(());
        }

        let job = {
            let mut st = self.inner.state.lock().await;
            if st.execution_lock {
                return Ok(());
            }
            st.pending.pop_front()
        };

        let Some(job) = job else {
            return Ok(());
        };

        tracing::info!(job = %job.name, "running queued cron job");
        self.execute(job).await
    }

    async fn job_loop(&self, job: CronJob, schedule: Schedule, cancel: CancellationToken) {
        loop {
            let Some(next) = schedule.upcoming(Local).next() else {
                tracing::warn!(job = %job.name, "cron job has no next firing, stopping");
                break;
            };
            let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    if let Err(error) = self.execute(job.clone()).await {
                        tracing::error!(job = %job.name, %error, "cron job failed");
                    }
                }
            }
        }
    }

    async fn execute(&self, job: CronJob) -> Result<()> {
        if self.inner.session.is_running().await {
            tracing::info!(job = %job.name, "session busy, queueing cron job");
            self.inner.state.lock().await.queue(job);
            return Ok(());
        }

        {
            let mut st = self.inner.state.lock().await;
            if st.execution_lock {
                drop(st);
                tracing::info!(job = %job.name, "execution in progress, queueing cron job");
                self.inner.state.lock().await.queue(job);
                return Ok(());
            }
            if !st.admit_execution(Instant::now()) {
                tracing::warn!(job = %job.name, "hourly cron cap reached, skipping");
                return Ok(());
            }
            st.execution_lock = true;
        }

        let result = self.run_job(&job).await;

        self.inner.state.lock().await.execution_lock = false;
        result
    }

    async fn run_job(&self, job: &CronJob) -> Result<()> {
        let Some(&owner) = self.inner.cfg.allowed_users.first() else {
            return Err(Error::Other(anyhow::anyhow!("no allowed users configured")));
        };
        let chat_id = ChatId(owner);

        tracing::info!(job = %job.name, "executing cron job");

        // Cron runs suppress the usual streaming chatter but keep inline
        // keyboards so interactive flows still reach the user.
        let quiet: Arc<dyn MessagingPort> =
            Arc::new(QuietMessenger::new(self.inner.messenger.clone()));

        let result = self
            .inner
            .session
            .send_message_to_chat(chat_id, UserId(owner), "cron", &job.prompt, quiet, None)
            .await;

        match result {
            Ok(out) => {
                tracing::info!(job = %job.name, "cron job completed");
                if job.notify {
                    let mut snippet = out.text;
                    snippet.truncate(3500);
                    let msg = format!(
                        "🕐 <b>Scheduled: {}</b>\n\n{}",
                        escape_html(&job.name),
                        escape_html(&snippet)
                    );
                    if let Err(error) = self.inner.messenger.send_html(chat_id, &msg).await {
                        tracing::error!(job = %job.name, %error, "cron notification failed");
                    }
                }
                Ok(())
            }
            Err(error) => {
                if job.notify {
                    let mut text = error.to_string();
                    text.truncate(500);
                    let msg = format!(
                        "❌ <b>Scheduled job failed: {}</b>\n\n{}",
                        escape_html(&job.name),
                        escape_html(&text)
                    );
                    let _ = self.inner.messenger.send_html(chat_id, &msg).await;
                }
                Err(error)
            }
        }
    }
}

fn load_manifest(path: &PathBuf) -> Result<CronManifest> {
    let raw = std::fs::read_to_string(path)?;
    let manifest: CronManifest = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Other(anyhow::anyhow!("cron manifest parse error: {e}")))?;

    for job in &manifest.schedules {
        validate_job(job)?;
    }
    Ok(manifest)
}

fn validate_job(job: &CronJob) -> Result<()> {
    if job.name.trim().is_empty() {
        return Err(Error::Other(anyhow::anyhow!("cron job missing name")));
    }
    if job.cron.trim().is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "cron job {} missing expression",
            job.name
        )));
    }
    if job.prompt.trim().is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "cron job {} missing prompt",
            job.name
        )));
    }
    if job.prompt.len() > MAX_PROMPT_LENGTH {
        return Err(Error::Other(anyhow::anyhow!(
            "cron job {} prompt too long ({} chars)",
            job.name,
            job.prompt.len()
        )));
    }
    Ok(())
}

/// Parse a standard 5-field cron expression (minute hour dom month dow) by
/// pinning the seconds field to zero.
fn parse_cron_expr(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::Other(anyhow::anyhow!("cron expression '{expr}': {e}")))
}

/// Messenger wrapper for cron runs: swallows streaming output, forwards
/// inline keyboards and callback answers.
struct QuietMessenger {
    real: Arc<dyn MessagingPort>,
    next_id: AtomicI32,
}

impl QuietMessenger {
    fn new(real: Arc<dyn MessagingPort>) -> Self {
        Self {
            real,
            next_id: AtomicI32::new(1),
        }
    }

    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        MessageRef {
            chat_id,
            message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)),
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for QuietMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.real.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, _html: &str) -> Result<MessageRef> {
        Ok(self.alloc(chat_id))
    }

    async fn edit_html(&self, _msg: MessageRef, _html: &str) -> Result<()> {
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
        self.real.send_inline_keyboard(chat_id, html, keyboard).await
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.real.answer_callback_query(callback_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_manifest_parses_block_scalar() {
        let yaml = r#"
schedules:
  - name: heartbeat
    cron: "0 * * * *"
    prompt: |
      line1
      line2
    enabled: true
    notify: false
  - name: quick
    cron: "*/5 * * * *"
    prompt: check the queue
"#;
        let manifest: CronManifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.schedules.len(), 2);

        let hb = &manifest.schedules[0];
        assert_eq!(hb.name, "heartbeat");
        assert!(hb.prompt.contains("line1"));
        assert!(hb.prompt.contains("line2"));
        assert!(hb.enabled);
        assert!(!hb.notify);

        // Defaults apply when omitted.
        let quick = &manifest.schedules[1];
        assert!(quick.enabled);
        assert!(!quick.notify);
    }

    #[test]
    fn test_validation_rejects_bad_jobs() {
        let bad = CronJob {
            name: "".into(),
            cron: "0 * * * *".into(),
            prompt: "p".into(),
            enabled: true,
            notify: false,
        };
        assert!(validate_job(&bad).is_err());

        let long = CronJob {
            name: "x".into(),
            cron: "0 * * * *".into(),
            prompt: "p".repeat(MAX_PROMPT_LENGTH + 1),
            enabled: true,
            notify: false,
        };
        assert!(validate_job(&long).is_err());
    }

    #[test]
    fn test_five_field_expression_normalized() {
        let schedule = parse_cron_expr("*/5 * * * *").unwrap();
        let next = schedule.upcoming(Local).next().unwrap();
        assert_eq!(next.minute() % 5, 0);
        assert_eq!(next.second(), 0);

        assert!(parse_cron_expr("not a cron").is_err());
    }

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let mut st = SchedulerState::default();
        for i in 0..MAX_PENDING + 2 {
            st.queue(CronJob {
                name: format!("job-{i}"),
                cron: "0 * * * *".into(),
                prompt: "p".into(),
                enabled: true,
                notify: false,
            });
        }
        assert_eq!(st.pending.len(), MAX_PENDING);
        assert_eq!(st.pending.front().unwrap().name, "job-2");
        assert_eq!(
            st.pending.back().unwrap().name,
            format!("job-{}", MAX_PENDING + 1)
        );
    }

    #[test]
    fn test_hourly_execution_cap() {
        let mut st = SchedulerState::default();
        let now = Instant::now();

        for _ in 0..MAX_JOBS_PER_HOUR {
            assert!(st.admit_execution(now));
        }
        assert!(!st.admit_execution(now));

        // Entries older than the window free capacity again.
        let later = now + Duration::from_secs(3601);
        assert!(st.admit_execution(later));
    }
}
