//! Inline-keyboard callback handling.
//!
//! A button press completes an ask-user request the runner is waiting on, so
//! callbacks are never serialized behind the chat lock: the selected option
//! becomes the next prompt immediately.

use crate::handlers::prompt::{run_prompt, PromptContext, PromptOptions};
use crate::handlers::AppState;
use crate::security::is_authorized;
use crate::UserId;
use std::sync::Arc;
use teloxide::prelude::*;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let cb_id = q.id.clone();
    let data = q.data.clone().unwrap_or_default();
    let message = q.regular_message().cloned();

    let Some(chat_id) = message.as_ref().map(|m| m.chat.id) else {
        let _ = bot.answer_callback_query(cb_id).await;
        return Ok(());
    };
    if data.is_empty() {
        let _ = bot.answer_callback_query(cb_id).await;
        return Ok(());
    }

    let user_id = q.from.id.0 as i64;
    let username = q.from.username.clone().unwrap_or_else(|| "unknown".into());

    if !is_authorized(Some(UserId(user_id)), &state.cfg.allowed_users) {
        let _ = bot
            .answer_callback_query(cb_id)
            .text("Unauthorized")
            .await;
        return Ok(());
    }

    // Callback data shape: askuser:<request_id>:<option_index>
    let Some(rest) = data.strip_prefix("askuser:") else {
        let _ = bot.answer_callback_query(cb_id).await;
        return Ok(());
    };
    let Some((request_id, index)) = rest.rsplit_once(':') else {
        let _ = bot
            .answer_callback_query(cb_id)
            .text("Invalid callback data")
            .await;
        return Ok(());
    };
    let Ok(option_index) = index.parse::<usize>() else {
        let _ = bot.answer_callback_query(cb_id).text("Invalid option").await;
        return Ok(());
    };

    let request = match state.buttons.get(request_id).await {
        Ok(Some(req)) if req.chat_id.0 == chat_id.0 => req,
        _ => {
            let _ = bot
                .answer_callback_query(cb_id)
                .text("Request expired or invalid")
                .await;
            return Ok(());
        }
    };

    let Some(selected) = request.options.get(option_index).cloned() else {
        let _ = bot.answer_callback_query(cb_id).text("Invalid option").await;
        return Ok(());
    };

    // Show the selection in place of the keyboard.
    if let Some(m) = &message {
        let _ = bot
            .edit_message_text(m.chat.id, m.id, format!("✓ {selected}"))
            .await;
    }

    let preview: String = selected.chars().take(50).collect();
    let _ = bot
        .answer_callback_query(cb_id)
        .text(format!("Selected: {preview}"))
        .await;

    let _ = state.buttons.remove(request_id).await;

    // The runner cancelled itself when it surfaced the keyboard, but a newer
    // query may be running; the answer takes precedence.
    if state.session.is_running().await {
        state.session.stop().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        state.session.clear_stop_requested().await;
    }

    tracing::info!(chat_id = chat_id.0, request_id, "button answer received");

    run_prompt(
        PromptContext {
            bot,
            state,
            chat_id: chat_id.0,
            user_id,
            username,
            origin: None,
        },
        "CALLBACK",
        selected,
        PromptOptions {
            record_last_message: false,
            skip_rate_limit: true,
        },
    )
    .await
}
