//! Relaybot entry point.

use anyhow::Context as _;
use clap::Parser;
use relaybot::agent::claude::{ClaudeAgent, ClaudeConfig};
use relaybot::audit::AuditLog;
use relaybot::buttons::FileButtonChannel;
use relaybot::config::Config;
use relaybot::cron::CronScheduler;
use relaybot::handlers::{self, AppState, ChatLocks};
use relaybot::messaging::{MessagingPort, TelegramMessenger, ThrottleConfig, ThrottledMessenger};
use relaybot::quota::QuotaService;
use relaybot::security::RateLimiter;
use relaybot::session::SessionManager;
use relaybot::startup;
use relaybot::transcribe::{OpenAiTranscriber, TranscriptionPort};
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaybot")]
#[command(about = "Telegram bridge to a local coding agent")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting relaybot");

    let cfg = Arc::new(Config::load().context("failed to load configuration")?);
    tracing::info!(
        working_dir = %cfg.working_dir.display(),
        allowed_users = cfg.allowed_users.len(),
        "configuration loaded"
    );

    let bot = Bot::new(cfg.bot_token.clone());
    if let Ok(me) = bot.get_me().await {
        tracing::info!(username = %me.username(), "connected to Telegram");
    }

    let agent = Arc::new(ClaudeAgent::new(ClaudeConfig {
        agent_path: cfg.agent_path.clone(),
        model: cfg.agent_model.clone(),
        config_dir: cfg.agent_config_dir.clone(),
    }));
    let buttons = Arc::new(FileButtonChannel::default());
    let audit = Arc::new(AuditLog::new(cfg.audit_log_path.clone(), cfg.audit_log_json));

    let session = Arc::new(SessionManager::new(
        cfg.clone(),
        agent,
        buttons.clone(),
        audit.clone(),
    ));

    // Resume the previous session when the checkpoint matches this workdir.
    let resumed = match session.resume_last().await {
        Ok((true, note)) => {
            tracing::info!(%note, "auto-resumed previous session");
            true
        }
        Ok((false, _)) => false,
        Err(error) => {
            tracing::warn!(%error, "session resume failed");
            false
        }
    };

    startup::finish_restart_marker(&bot, &cfg.restart_file).await;

    // The throttling decorator sits in front of the raw adapter so streaming
    // edits respect platform flood limits.
    let raw: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> =
        Arc::new(ThrottledMessenger::new(raw, ThrottleConfig::default()));

    let scheduler = CronScheduler::new(cfg.clone(), session.clone(), messenger.clone());
    if let Err(error) = scheduler.start().await {
        tracing::error!(%error, "cron scheduler failed to start");
    }
    scheduler.ensure_watcher().await;

    let transcriber: Option<Arc<dyn TranscriptionPort>> = cfg
        .openai_api_key
        .clone()
        .map(|key| Arc::new(OpenAiTranscriber::new(key)) as Arc<dyn TranscriptionPort>);

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        session,
        messenger,
        scheduler,
        quota: QuotaService::new(),
        transcriber,
        buttons,
        rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
            cfg.rate_limit_enabled,
            cfg.rate_limit_requests,
            cfg.rate_limit_window,
        ))),
        chat_locks: ChatLocks::default(),
        audit,
    });

    // Startup notification (and possible auto-restore) in the background so
    // polling starts immediately.
    {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            startup::announce_startup(state, resumed).await;
        });
    }

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state.clone()])
        .enable_ctrlc_handler()
        .build();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = dispatcher.dispatch() => {}
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, writing restart context");
                startup::write_restart_context(&state).await;
                state.scheduler.stop().await;
            }
        }
    }
    #[cfg(not(unix))]
    dispatcher.dispatch().await;

    tracing::info!("relaybot stopped");
    Ok(())
}
