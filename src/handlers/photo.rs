//! Photo handling: download the best resolution, buffer albums.

use crate::handlers::media_group::{BoxFuture, MediaGroupBuffer, MediaGroupConfig};
use crate::handlers::prompt::{
    check_rate_limit, origin_of, run_prompt, PromptContext, PromptOptions,
};
use crate::handlers::AppState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use teloxide::net::Download;
use teloxide::prelude::*;

static PHOTO_COUNTER: AtomicUsize = AtomicUsize::new(1);
static PHOTO_BUFFER: OnceLock<Arc<MediaGroupBuffer>> = OnceLock::new();

fn photo_buffer() -> &'static Arc<MediaGroupBuffer> {
    PHOTO_BUFFER.get_or_init(|| {
        let process = Arc::new(
            |ctx: PromptContext, items: Vec<String>, caption: Option<String>| {
                let fut: BoxFuture = Box::pin(async move {
                    let prompt = build_photo_prompt(&items, caption.as_deref());
                    let _ = run_prompt(
                        ctx,
                        "PHOTO",
                        prompt,
                        PromptOptions {
                            record_last_message: false,
                            skip_rate_limit: true,
                        },
                    )
                    .await;
                });
                fut
            },
        );

        MediaGroupBuffer::new(
            MediaGroupConfig {
                emoji: "📷",
                item_label_plural: "photos",
            },
            process,
        )
    })
}

fn build_photo_prompt(photo_paths: &[String], caption: Option<&str>) -> String {
    if let [single] = photo_paths {
        return match caption {
            Some(c) if !c.trim().is_empty() => format!("[Photo: {single}]\n\n{c}"),
            _ => format!("Please analyze this image: {single}"),
        };
    }

    let list = photo_paths
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}. {p}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    match caption {
        Some(c) if !c.trim().is_empty() => format!("[Photos:\n{list}]\n\n{c}"),
        _ => format!("Please analyze these {} images:\n{list}", photo_paths.len()),
    }
}

async fn download_photo(
    bot: &Bot,
    state: &AppState,
    photos: &[teloxide::types::PhotoSize],
) -> anyhow::Result<String> {
    // Sizes are ordered smallest to largest; take the best one.
    let best = photos
        .last()
        .ok_or_else(|| anyhow::anyhow!("no photo sizes"))?;
    let _slot = crate::handlers::DOWNLOAD_SLOTS.acquire().await;
    let file = bot.get_file(best.file.id.clone()).await?;

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let n = PHOTO_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = state.cfg.temp_dir.join(format!("photo_{ts}_{n}.jpg"));

    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;
    Ok(path.to_string_lossy().to_string())
}

pub async fn handle_photo(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    let Some(photos) = msg.photo().map(|p| p.to_vec()) else {
        return Ok(());
    };

    let user_id = user.id.0 as i64;
    let username = user.username.clone().unwrap_or_else(|| "unknown".into());
    let chat_id = msg.chat.id.0;

    let media_group_id = msg.media_group_id().map(str::to_string);
    let caption = msg.caption().map(str::to_string);

    let ctx = PromptContext {
        bot: bot.clone(),
        state: state.clone(),
        chat_id,
        user_id,
        username,
        origin: Some(origin_of(&msg)),
    };

    // Singles are rate-limited and processed right away; albums go through
    // the group buffer which rate-limits once per group.
    let mut status_msg: Option<Message> = None;
    if media_group_id.is_none() {
        if !check_rate_limit(&ctx).await {
            return Ok(());
        }
        status_msg = bot
            .send_message(msg.chat.id, "📷 Processing image...")
            .await
            .ok();
    }

    let photo_path = match download_photo(&bot, &state, &photos).await {
        Ok(p) => p,
        Err(error) => {
            tracing::error!(%error, "photo download failed");
            let _ = bot
                .send_message(
                    msg.chat.id,
                    format!(
                        "❌ Failed to download photo: {}",
                        crate::audit::truncate(&error.to_string(), 100)
                    ),
                )
                .await;
            return Ok(());
        }
    };

    match media_group_id {
        None => {
            let prompt = build_photo_prompt(std::slice::from_ref(&photo_path), caption.as_deref());
            let _ = run_prompt(
                ctx,
                "PHOTO",
                prompt,
                PromptOptions {
                    record_last_message: false,
                    skip_rate_limit: true,
                },
            )
            .await;

            if let Some(st) = status_msg {
                let _ = bot.delete_message(st.chat.id, st.id).await;
            }
        }
        Some(group_id) => {
            let timeout = state.cfg.media_group_timeout;
            photo_buffer()
                .add_to_group(ctx, group_id, photo_path, caption, timeout)
                .await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_prompt_single_vs_album() {
        let single = vec!["/tmp/a.jpg".to_string()];
        assert_eq!(
            build_photo_prompt(&single, None),
            "Please analyze this image: /tmp/a.jpg"
        );
        assert_eq!(
            build_photo_prompt(&single, Some("what is this?")),
            "[Photo: /tmp/a.jpg]\n\nwhat is this?"
        );

        let album = vec!["/tmp/a.jpg".to_string(), "/tmp/b.jpg".to_string()];
        let prompt = build_photo_prompt(&album, None);
        assert!(prompt.contains("1. /tmp/a.jpg"));
        assert!(prompt.contains("2. /tmp/b.jpg"));
        assert!(prompt.contains("2 images"));
    }
}
