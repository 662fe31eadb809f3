//! Voice message handling: download, transcribe, run as a prompt.

use crate::handlers::prompt::{check_rate_limit, origin_of, run_prompt, PromptContext, PromptOptions};
use crate::handlers::AppState;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use teloxide::net::Download;
use teloxide::prelude::*;

static VOICE_COUNTER: AtomicUsize = AtomicUsize::new(1);

async fn download_voice(
    bot: &Bot,
    state: &AppState,
    voice: &teloxide::types::Voice,
) -> anyhow::Result<PathBuf> {
    let _slot = crate::handlers::DOWNLOAD_SLOTS.acquire().await;
    let file = bot.get_file(voice.file.id.clone()).await?;

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let n = VOICE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = state.cfg.temp_dir.join(format!("voice_{ts}_{n}.ogg"));

    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;
    Ok(path)
}

pub async fn handle_voice(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    let Some(voice) = msg.voice().cloned() else {
        return Ok(());
    };

    let user_id = user.id.0 as i64;
    let username = user.username.clone().unwrap_or_else(|| "unknown".into());
    let chat_id = msg.chat.id.0;

    let Some(transcriber) = state.transcriber.clone() else {
        let _ = bot
            .send_message(
                msg.chat.id,
                "Voice transcription is not configured. Set OPENAI_API_KEY.",
            )
            .await;
        return Ok(());
    };

    let ctx = PromptContext {
        bot: bot.clone(),
        state: state.clone(),
        chat_id,
        user_id,
        username: username.clone(),
        origin: Some(origin_of(&msg)),
    };
    if !check_rate_limit(&ctx).await {
        return Ok(());
    }

    let status = bot.send_message(msg.chat.id, "🎤 Transcribing...").await.ok();

    let voice_path = match download_voice(&bot, &state, &voice).await {
        Ok(p) => p,
        Err(error) => {
            tracing::error!(%error, "voice download failed");
            let _ = bot
                .send_message(
                    msg.chat.id,
                    format!(
                        "❌ Failed to download voice: {}",
                        crate::audit::truncate(&error.to_string(), 200)
                    ),
                )
                .await;
            return Ok(());
        }
    };

    let transcript = transcriber
        .transcribe(&voice_path, Some(&state.cfg.transcription_prompt))
        .await;
    let _ = tokio::fs::remove_file(&voice_path).await;

    let transcript = match transcript {
        Ok(t) => t,
        Err(error) => {
            tracing::error!(%error, "transcription failed");
            let note = "❌ Transcription failed.";
            match &status {
                Some(st) => {
                    let _ = bot.edit_message_text(st.chat.id, st.id, note).await;
                }
                None => {
                    let _ = bot.send_message(msg.chat.id, note).await;
                }
            }
            return Ok(());
        }
    };

    // Show the transcript in place of the progress note.
    if let Some(st) = &status {
        let preview: String = transcript.chars().take(300).collect();
        let _ = bot
            .edit_message_text(st.chat.id, st.id, format!("🎤 \"{preview}\""))
            .await;
    }

    run_prompt(
        ctx,
        "VOICE",
        transcript,
        PromptOptions {
            record_last_message: false,
            skip_rate_limit: true,
        },
    )
    .await
}
