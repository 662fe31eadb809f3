//! Text message handling: prompts, `!` interrupts and steering.

use crate::handlers::prompt::{origin_of, run_text_prompt, PromptContext};
use crate::handlers::AppState;
use crate::stream::REACTION_RECEIVED;
use std::sync::Arc;
use teloxide::prelude::*;

/// Strip the interrupt prefix; the caller decides what to do with the rest.
pub fn strip_interrupt_prefix(text: &str) -> (bool, String) {
    match text.strip_prefix('!') {
        Some(rest) => (true, rest.trim_start().to_string()),
        None => (false, text.to_string()),
    }
}

pub async fn handle_text(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    let Some(text) = msg.text().map(str::to_string) else {
        return Ok(());
    };

    let user_id = user.id.0 as i64;
    let username = user.username.clone().unwrap_or_else(|| "unknown".into());
    let chat_id = msg.chat.id.0;

    let (is_interrupt, text) = strip_interrupt_prefix(&text);

    if is_interrupt && state.session.is_running().await {
        state.session.mark_interrupt().await;
        state.session.stop().await;

        // Give the runner a moment to observe the abort before the new query.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while state.session.is_running().await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        state.session.clear_stop_requested().await;
    }

    if text.trim().is_empty() {
        return Ok(());
    }

    let origin = origin_of(&msg);
    if state.cfg.reaction_enabled {
        let _ = state.messenger.set_reaction(origin, REACTION_RECEIVED).await;
    }

    run_text_prompt(
        PromptContext {
            bot,
            state,
            chat_id,
            user_id,
            username,
            origin: Some(origin),
        },
        "TEXT",
        text,
    )
    .await
}

/// A plain message while a query runs: buffer it for injection at the next
/// tool boundary and acknowledge with a reaction.
pub async fn handle_steering(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text().map(str::to_string) else {
        return Ok(());
    };
    if text.trim().is_empty() {
        return Ok(());
    }

    if state.session.queue_steering(text).await {
        tracing::debug!(chat_id = msg.chat.id.0, "steering message buffered");
        let origin = origin_of(&msg);
        if state.cfg.reaction_enabled {
            let _ = state.messenger.set_reaction(origin, REACTION_RECEIVED).await;
        }
    } else {
        let _ = bot
            .send_message(
                msg.chat.id,
                "⏳ Too many queued messages; wait for the current query or use ! to interrupt.",
            )
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_interrupt_prefix() {
        assert_eq!(strip_interrupt_prefix("!stop this"), (true, "stop this".into()));
        assert_eq!(strip_interrupt_prefix("! spaced"), (true, "spaced".into()));
        assert_eq!(strip_interrupt_prefix("normal"), (false, "normal".into()));
        assert_eq!(strip_interrupt_prefix("!"), (true, "".into()));
    }
}
