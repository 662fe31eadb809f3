//! Shared prompt execution path for all handler types.
//!
//! Rate limit, auto-save when the context budget demands it, run the query
//! with a single retry on agent crash, surface context alarms, audit, and
//! release queued cron jobs afterwards.

use crate::audit::AuditEvent;
use crate::handlers::AppState;
use crate::session::{add_timestamp, ContextAlarm, CONTEXT_LIMIT};
use crate::{ChatId, MessageId, MessageRef, UserId};
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use teloxide::prelude::*;
use teloxide::types::ChatAction;

#[derive(Clone)]
pub struct PromptContext {
    pub bot: Bot,
    pub state: Arc<AppState>,
    pub chat_id: i64,
    pub user_id: i64,
    pub username: String,
    /// The user message that triggered this prompt, for reactions.
    pub origin: Option<MessageRef>,
}

#[derive(Clone, Copy, Debug)]
pub struct PromptOptions {
    pub record_last_message: bool,
    pub skip_rate_limit: bool,
}

/// Check the user's token bucket; replies and audits on denial.
pub async fn check_rate_limit(ctx: &PromptContext) -> bool {
    let (ok, retry_after) = {
        let mut limiter = ctx.state.rate_limiter.lock().await;
        limiter.check(UserId(ctx.user_id))
    };
    if ok {
        return true;
    }

    let retry = retry_after.unwrap_or_default().as_secs_f64();
    ctx.state
        .audit
        .append_best_effort(AuditEvent::rate_limit(ctx.user_id, &ctx.username, retry));
    let _ = ctx
        .bot
        .send_message(
            teloxide::types::ChatId(ctx.chat_id),
            format!("⏳ Rate limited. Please wait {retry:.1} seconds."),
        )
        .await;
    false
}

pub async fn run_text_prompt(ctx: PromptContext, message_type: &str, text: String) -> ResponseResult<()> {
    run_prompt(
        ctx,
        message_type,
        text,
        PromptOptions {
            record_last_message: true,
            skip_rate_limit: false,
        },
    )
    .await
}

pub async fn run_prompt(
    ctx: PromptContext,
    message_type: &str,
    text: String,
    opts: PromptOptions,
) -> ResponseResult<()> {
    if text.trim().is_empty() {
        return Ok(());
    }

    if !opts.skip_rate_limit && !check_rate_limit(&ctx).await {
        return Ok(());
    }

    let PromptContext {
        bot,
        state,
        chat_id,
        user_id,
        username,
        origin,
    } = ctx;

    // Context nearly full: save before taking on more work.
    if state.session.take_save_required().await {
        auto_save(&bot, &state, chat_id, user_id, &username).await;
    }

    if opts.record_last_message {
        state.session.set_last_message(text.clone()).await;
    }
    let prompt = add_timestamp(&text);

    // Typing indicator while the query runs.
    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    let bot_typing = bot.clone();
    let chat_typing = teloxide::types::ChatId(chat_id);
    let typing_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(3));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let _ = bot_typing.send_chat_action(chat_typing, ChatAction::Typing).await;
                }
                _ = &mut stop_rx => break,
            }
        }
    });

    const MAX_RETRIES: usize = 1;
    for attempt in 0..=MAX_RETRIES {
        let result = state
            .session
            .send_message_to_chat(
                ChatId(chat_id),
                UserId(user_id),
                &username,
                &prompt,
                state.messenger.clone(),
                origin,
            )
            .await;

        match result {
            Ok(out) => {
                state.audit.append_best_effort(AuditEvent::message(
                    user_id,
                    &username,
                    message_type,
                    &text,
                    Some(&out.text),
                ));

                send_context_alarms(&state, chat_id, &out.context_alarms).await;

                if !out.waiting_for_user {
                    if let Err(error) = state.scheduler.process_queued_jobs().await {
                        tracing::error!(%error, "queued cron job failed");
                    }
                }
                break;
            }
            Err(err) if err.is_agent_crash() && attempt < MAX_RETRIES => {
                tracing::warn!(%err, "agent crashed, retrying once with a fresh session");
                state.session.reset().await;
                let _ = bot
                    .send_message(
                        teloxide::types::ChatId(chat_id),
                        "⚠️ Agent crashed, retrying...",
                    )
                    .await;
                continue;
            }
            Err(err) if err.is_cancelled() => {
                let was_interrupt = state.session.consume_interrupt_flag().await;
                if !was_interrupt {
                    let _ = bot
                        .send_message(teloxide::types::ChatId(chat_id), "🛑 Query stopped.")
                        .await;
                }
                break;
            }
            Err(err) => {
                let truncated = crate::audit::truncate(&err.to_string(), 200);
                let _ = bot
                    .send_message(
                        teloxide::types::ChatId(chat_id),
                        format!("❌ Error: {truncated}"),
                    )
                    .await;
                state.audit.append_best_effort(AuditEvent::error(
                    user_id,
                    &username,
                    &truncated,
                    Some(message_type),
                ));
                break;
            }
        }
    }

    let _ = stop_tx.send(());
    let _ = typing_task.await;

    Ok(())
}

/// Issue the auto-save prompt and persist the returned save id.
async fn auto_save(bot: &Bot, state: &Arc<AppState>, chat_id: i64, user_id: i64, username: &str) {
    let _ = bot
        .send_message(
            teloxide::types::ChatId(chat_id),
            "💾 Context is nearly full, saving session state first...",
        )
        .await;

    let save_prompt =
        "Save the current session context now using the save skill. Reply with the save ID.";
    let result = state
        .session
        .send_message_to_chat(
            ChatId(chat_id),
            UserId(user_id),
            username,
            save_prompt,
            state.messenger.clone(),
            None,
        )
        .await;

    match result {
        Ok(out) => {
            static SAVE_ID_RE: OnceLock<Regex> = OnceLock::new();
            let re = SAVE_ID_RE
                .get_or_init(|| Regex::new(r"\b(\d{8}_\d{6})\b").expect("valid regex"));
            match re.captures(&out.text).and_then(|c| c.get(1)) {
                Some(id) => {
                    let path = state.cfg.save_id_file();
                    if let Err(error) = std::fs::write(&path, id.as_str()) {
                        tracing::error!(%error, "failed to write save id file");
                    } else {
                        tracing::info!(save_id = id.as_str(), "session state saved");
                    }
                }
                None => {
                    tracing::warn!("auto-save response contained no save id");
                }
            }
        }
        Err(error) => {
            tracing::error!(%error, "auto-save failed");
            let _ = bot
                .send_message(
                    teloxide::types::ChatId(chat_id),
                    "⚠️ Auto-save failed; continuing without a checkpoint.",
                )
                .await;
        }
    }
}

async fn send_context_alarms(state: &Arc<AppState>, chat_id: i64, alarms: &[ContextAlarm]) {
    for alarm in alarms {
        let stats = state.session.stats().await;
        let used = stats.context_used();
        let body = match alarm {
            ContextAlarm::Warn70 | ContextAlarm::Warn85 | ContextAlarm::Warn95 => format!(
                "⚠️ Context {}% used ({used}/{CONTEXT_LIMIT} tokens). Consider /new for unrelated work.",
                alarm.percent()
            ),
            ContextAlarm::SaveRequired => {
                "💾 Context save threshold reached; the session will be saved before the next message."
                    .to_string()
            }
        };
        let _ = state
            .messenger
            .send_html(ChatId(chat_id), &crate::format::escape_html(&body))
            .await;
    }
}

/// Build a [`MessageRef`] for the user message that triggered a handler.
pub fn origin_of(msg: &teloxide::types::Message) -> MessageRef {
    MessageRef {
        chat_id: ChatId(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
    }
}
