//! Boot and shutdown paths.
//!
//! On startup: finish a pending `/restart` by editing its progress message,
//! auto-restore saved context when a `.last-save-id` handoff file is present,
//! otherwise announce the startup type to the owner. On SIGTERM: write a
//! restart-context file so the next boot can pick the work back up.

use crate::format::{escape_html, markdown_to_html};
use crate::handlers::AppState;
use crate::{ChatId, UserId};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teloxide::prelude::*;

const RESTART_MARKER_MAX_AGE_MS: u64 = 30_000;

/// Sentinel the load skill must echo for a restore to count as verified.
const LOADED_MARKER: &str = "Loaded Context:";

#[derive(serde::Deserialize)]
struct RestartMarker {
    chat_id: i64,
    message_id: i32,
    timestamp: u64,
}

/// If `/restart` wrote a marker less than 30 s ago, flip its progress message
/// to a confirmation. The marker is removed either way.
pub async fn finish_restart_marker(bot: &Bot, restart_file: &Path) {
    if !restart_file.exists() {
        return;
    }

    let marker = std::fs::read_to_string(restart_file)
        .ok()
        .and_then(|txt| serde_json::from_str::<RestartMarker>(&txt).ok());

    if let Some(marker) = marker {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        if now_ms.saturating_sub(marker.timestamp) < RESTART_MARKER_MAX_AGE_MS {
            let _ = bot
                .edit_message_text(
                    teloxide::types::ChatId(marker.chat_id),
                    teloxide::types::MessageId(marker.message_id),
                    "✅ Bot restarted",
                )
                .await;
        }
    }
    let _ = std::fs::remove_file(restart_file);
}

/// Strictly eight digits, an underscore, six digits.
pub fn is_valid_save_id(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[9..].iter().all(u8::is_ascii_digit)
}

/// Startup notification with save/restore handoff.
///
/// Priority 1 is the `.last-save-id` auto-load; priority 2 is surfacing the
/// newest restart-context file alongside a plain startup notice.
pub async fn announce_startup(state: Arc<AppState>, resumed: bool) {
    let Some(&owner) = state.cfg.allowed_users.first() else {
        return;
    };
    let chat_id = ChatId(owner);

    let save_id_file = state.cfg.save_id_file();
    if save_id_file.exists() {
        match try_auto_load(&state, chat_id, owner, &save_id_file).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(error) => {
                tracing::error!(%error, "auto-load failed, starting fresh");
                let msg = format!(
                    "🚨 <b>Auto-load failed</b>\n\n<code>{}</code>\n\n⚠️ Starting a fresh session.",
                    escape_html(&error.to_string())
                );
                let _ = state.messenger.send_html(chat_id, &msg).await;
            }
        }
    }

    let context = latest_restart_context(&state.cfg.restart_context_dir());

    let startup_type = if context.is_some() {
        "🔄 **Restart** (graceful shutdown context found)"
    } else if resumed {
        "♻️ **Session resumed** (no saved context found)"
    } else {
        "🆕 **Fresh start** (new session)"
    };

    let mut header = startup_type.to_string();
    if let Some(id) = state.session.stats().await.session_id {
        header.push_str(&format!(
            "\nSession: `{}`",
            id.chars().take(8).collect::<String>()
        ));
    }
    let _ = state
        .messenger
        .send_html(chat_id, &markdown_to_html(&header))
        .await;

    let mut prompt = format!("{startup_type}\n\nBot restarted. Briefly report the current state.");
    if let Some((name, content)) = context {
        prompt.push_str(&format!("\n\n📋 Saved context ({name}):\n\n{content}"));
    }

    let result = state
        .session
        .send_message_to_chat(
            chat_id,
            UserId(owner),
            "startup",
            &prompt,
            state.messenger.clone(),
            None,
        )
        .await;
    if let Err(error) = result {
        tracing::warn!(%error, "startup greeting failed");
    }
}

async fn try_auto_load(
    state: &Arc<AppState>,
    chat_id: ChatId,
    owner: i64,
    save_id_file: &Path,
) -> anyhow::Result<bool> {
    let save_id = std::fs::read_to_string(save_id_file)
        .unwrap_or_default()
        .trim()
        .to_string();

    if !is_valid_save_id(&save_id) {
        let _ = std::fs::remove_file(save_id_file);
        anyhow::bail!("invalid save id: {save_id}");
    }

    let notice = format!(
        "🔄 <b>Auto-restoring context</b>\n\nSave ID: <code>{}</code>",
        escape_html(&save_id)
    );
    let _ = state.messenger.send_html(chat_id, &notice).await;

    let load_prompt = format!(
        "Load the saved session context with save ID {save_id} using the load skill. \
         Start your reply with 'Loaded Context:' followed by a one-line summary."
    );
    let out = state
        .session
        .send_message_to_chat(
            chat_id,
            UserId(owner),
            "startup",
            &load_prompt,
            state.messenger.clone(),
            None,
        )
        .await
        .map_err(|e| anyhow::anyhow!("load failed: {e}"))?;

    if !out.text.contains(LOADED_MARKER) {
        anyhow::bail!("restore verification failed for save id {save_id}");
    }

    // Only a verified restore consumes the handoff file.
    state.session.mark_restored().await;
    let _ = std::fs::remove_file(save_id_file);
    tracing::info!(save_id = %save_id, "context restored");

    let ok_msg = format!(
        "✅ <b>Context restored</b>\n\nResumed from save: <code>{}</code>",
        escape_html(&save_id)
    );
    let _ = state.messenger.send_html(chat_id, &ok_msg).await;

    Ok(true)
}

/// Newest `restart-context-*.md` by filename (timestamps sort lexically).
fn latest_restart_context(dir: &Path) -> Option<(String, String)> {
    let rd = std::fs::read_dir(dir).ok()?;
    let mut best: Option<(String, PathBuf)> = None;

    for ent in rd.flatten() {
        let name = ent.file_name().to_string_lossy().to_string();
        if !name.starts_with("restart-context-") || !name.ends_with(".md") {
            continue;
        }
        if best.as_ref().map(|(b, _)| name > *b).unwrap_or(true) {
            best = Some((name, ent.path()));
        }
    }

    let (name, path) = best?;
    let content = std::fs::read_to_string(path).ok()?;
    Some((name, content))
}

/// SIGTERM handler body: persist a short context note for the next boot.
pub async fn write_restart_context(state: &Arc<AppState>) {
    let dir = state.cfg.restart_context_dir();
    if let Err(error) = std::fs::create_dir_all(&dir) {
        tracing::error!(%error, "cannot create restart-context dir");
        return;
    }

    let stats = state.session.stats().await;
    let ts = Local::now().format("%Y-%m-%dT%H-%M-%S");
    let path = dir.join(format!("restart-context-{ts}.md"));

    let mut body = String::from("# Restart context\n\n");
    body.push_str(&format!("Written: {}\n\n", Local::now().to_rfc3339()));
    match &stats.session_id {
        Some(id) => body.push_str(&format!("Active session: `{id}`\n")),
        None => body.push_str("No active session.\n"),
    }
    body.push_str(&format!(
        "Queries: {}\nContext used: {} tokens ({:.1}%)\n",
        stats.total_queries,
        stats.context_used(),
        stats.context_percent()
    ));
    if let Some(last) = &stats.last_message {
        body.push_str(&format!(
            "\nLast user message:\n\n> {}\n",
            crate::audit::truncate(last, 400)
        ));
    }

    match std::fs::write(&path, body) {
        Ok(()) => tracing::info!(path = %path.display(), "restart context written"),
        Err(error) => tracing::error!(%error, "restart context write failed"),
    }
}
