//! In-band command handling (`/start`, `/new`, `/status`, ...).

use crate::format::{escape_html, split_text};
use crate::handlers::prompt::{run_text_prompt, PromptContext};
use crate::handlers::AppState;
use crate::quota::ProviderUsage;
use crate::session::{SessionStats, CONTEXT_LIMIT, RESTORE_COOLDOWN_QUERIES, SAVE_THRESHOLD};
use crate::ChatId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use teloxide::prelude::*;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`.
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {mins}m {secs}s")
    } else if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

fn format_time_remaining(reset_time: Option<&str>) -> String {
    let Some(reset) = reset_time
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
    else {
        return String::new();
    };

    let diff = reset.signed_duration_since(Utc::now()).num_seconds();
    if diff <= 0 {
        return "now".to_string();
    }
    let days = diff / 86400;
    let hours = (diff % 86400) / 3600;
    let mins = (diff % 3600) / 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}

async fn send_split(state: &AppState, chat_id: i64, html: &str) {
    for chunk in split_text(html, state.cfg.safe_limit.max(200)) {
        let _ = state.messenger.send_html(ChatId(chat_id), &chunk).await;
    }
}

fn session_duration(stats: &SessionStats) -> Option<i64> {
    let start = stats.session_start_time.as_deref()?;
    let dt = DateTime::parse_from_rfc3339(start).ok()?;
    Some((Utc::now() - dt.with_timezone(&Utc)).num_seconds())
}

fn provider_usage_lines(usage: Option<&ProviderUsage>) -> Vec<String> {
    let mut lines = vec!["\n🌐 <b>Provider Usage</b>".to_string()];
    let Some(usage) = usage else {
        lines.push("   <i>Not authenticated</i>".to_string());
        return lines;
    };

    for (label, window) in [("5h", &usage.five_hour), ("7d", &usage.seven_day)] {
        if let Some(w) = window {
            let reset = format_time_remaining(w.resets_at.as_deref());
            let reset = if reset.is_empty() {
                String::new()
            } else {
                format!(" (resets in {reset})")
            };
            lines.push(format!("   {label}: {}%{reset}", w.utilization.round()));
        }
    }
    lines
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = user.id.0 as i64;
    let username = user.username.clone().unwrap_or_else(|| "unknown".into());
    let chat_id = msg.chat.id.0;

    let (cmd, arg) = parse_command(text);
    tracing::debug!(%cmd, chat_id, "command received");

    match cmd.as_str() {
        "start" | "help" => {
            let status = if state.session.is_active().await {
                "Active session"
            } else {
                "No active session"
            };
            let work_dir = escape_html(&state.cfg.working_dir.display().to_string());

            let body = format!(
                "🤖 <b>Relaybot</b>\n\n\
Status: {status}\n\
Working directory: <code>{work_dir}</code>\n\n\
<b>📋 Commands:</b>\n\
/start - Show this help message\n\
/new - Start fresh session\n\
/stop - Stop current query (silent)\n\
/status - Show current session status\n\
/stats - Token usage &amp; cost stats\n\
/context - Context budget status\n\
/resume - Resume last saved session\n\
/retry - Retry last message\n\
/cron [reload] - Scheduled jobs status/reload\n\
/restart - Restart the bot process\n\n\
<b>💡 Tips:</b>\n\
• Prefix with <code>!</code> to interrupt the current query\n\
• Message during a query to steer it without stopping\n\
• Use \"think\" / \"ultrathink\" for extended reasoning\n\
• Send photos, voice messages, documents or archives"
            );

            send_split(&state, chat_id, &body).await;
            Ok(())
        }

        "new" => {
            if state.session.is_running().await {
                state.session.stop().await;
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                state.session.clear_stop_requested().await;
            }
            state.session.reset().await;
            send_split(&state, chat_id, "🆕 Session cleared. Next message starts fresh.").await;
            Ok(())
        }

        "stop" => {
            // Silent by design.
            if state.session.is_running().await {
                state.session.stop().await;
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                state.session.clear_stop_requested().await;
            }
            Ok(())
        }

        "status" => {
            let stats = state.session.stats().await;
            let mut lines: Vec<String> = vec!["📊 <b>Bot Status</b>\n".to_string()];

            match stats.session_id.as_deref() {
                Some(id) => {
                    let short: String = id.chars().take(8).collect();
                    lines.push(format!("✅ Session: Active ({short}...)"));
                    if let Some(dur) = session_duration(&stats) {
                        lines.push(format!(
                            "   └─ Duration: {} | {} queries",
                            format_duration(dur),
                            stats.total_queries
                        ));
                    }
                }
                None => lines.push("⚪ Session: None".to_string()),
            }

            lines.push(if stats.is_running {
                "🔄 Query: Running".to_string()
            } else {
                "⚪ Query: Idle".to_string()
            });

            if let Some(u) = stats.last_usage.as_ref() {
                lines.push("\n📈 Last query usage:".to_string());
                lines.push(format!("   Input: {} tokens", u.input_tokens));
                lines.push(format!("   Output: {} tokens", u.output_tokens));
                if u.cache_read_input_tokens > 0 {
                    lines.push(format!("   Cache read: {}", u.cache_read_input_tokens));
                }
            }

            lines.push(format!(
                "\n📁 Working dir: <code>{}</code>",
                escape_html(&state.cfg.working_dir.display().to_string())
            ));

            send_split(&state, chat_id, &lines.join("\n")).await;
            Ok(())
        }

        "context" => {
            let stats = state.session.stats().await;
            let used = stats.context_used();
            let pct = stats.context_percent();

            let mut lines = vec!["🧮 <b>Context Budget</b>\n".to_string()];
            lines.push(format!("Used: {used} / {CONTEXT_LIMIT} tokens ({pct:.1}%)"));
            lines.push(format!("Save threshold: {SAVE_THRESHOLD} tokens"));
            if stats.save_required {
                lines.push("💾 Save pending: the next message triggers an auto-save".to_string());
            }
            if stats.recently_restored {
                lines.push(format!(
                    "♻️ Restore cooldown: {} of {RESTORE_COOLDOWN_QUERIES} queries",
                    stats.messages_since_restore
                ));
            }

            send_split(&state, chat_id, &lines.join("\n")).await;
            Ok(())
        }

        "stats" => {
            let stats = state.session.stats().await;
            let mut lines: Vec<String> = vec!["📊 <b>Session Statistics</b>\n".to_string()];

            match session_duration(&stats) {
                Some(dur) => {
                    lines.push(format!("⏱️ Session duration: {}", format_duration(dur)));
                    lines.push(format!("🔢 Total queries: {}", stats.total_queries));
                }
                None => lines.push("⚪ No active session".to_string()),
            }

            if stats.total_queries > 0 {
                let total_in = stats.total_input_tokens;
                let total_out = stats.total_output_tokens;
                let total_cache =
                    stats.total_cache_read_tokens + stats.total_cache_create_tokens;

                lines.push("\n🧠 <b>Token Usage</b>".to_string());
                lines.push(format!("   Input: {total_in} tokens"));
                lines.push(format!("   Output: {total_out} tokens"));
                if total_cache > 0 {
                    lines.push(format!("   Cache: {total_cache} tokens"));
                    lines.push(format!("     └─ Read: {}", stats.total_cache_read_tokens));
                    lines.push(format!("     └─ Create: {}", stats.total_cache_create_tokens));
                }
                lines.push(format!("   <b>Total: {} tokens</b>", total_in + total_out));

                let cost_in = (total_in as f64 / 1e6) * 3.0;
                let cost_out = (total_out as f64 / 1e6) * 15.0;
                let cost_cache = (stats.total_cache_read_tokens as f64 / 1e6) * 0.3
                    + (stats.total_cache_create_tokens as f64 / 1e6) * 3.75;
                let total_cost = cost_in + cost_out + cost_cache;

                lines.push("\n💰 <b>Estimated Cost</b>".to_string());
                lines.push(format!("   Input: ${cost_in:.4}"));
                lines.push(format!("   Output: ${cost_out:.4}"));
                if total_cache > 0 {
                    lines.push(format!("   Cache: ${cost_cache:.4}"));
                }
                lines.push(format!("   <b>Total: ${total_cost:.4}</b>"));

                if stats.total_queries > 1 {
                    lines.push("\n📈 <b>Per Query Average</b>".to_string());
                    lines.push(format!("   Input: {} tokens", total_in / stats.total_queries));
                    lines.push(format!("   Output: {} tokens", total_out / stats.total_queries));
                    lines.push(format!(
                        "   Cost: ${:.4}",
                        total_cost / stats.total_queries as f64
                    ));
                }
            } else {
                lines.push("\n📭 No queries in this session yet".to_string());
            }

            let usage = state.quota.fetch().await;
            lines.extend(provider_usage_lines(usage.as_ref()));

            send_split(&state, chat_id, &lines.join("\n")).await;
            Ok(())
        }

        "resume" => {
            if state.session.is_active().await {
                send_split(
                    &state,
                    chat_id,
                    "Session already active. Use /new to start fresh first.",
                )
                .await;
                return Ok(());
            }
            match state.session.resume_last().await {
                Ok((true, note)) => {
                    send_split(&state, chat_id, &format!("✅ {}", escape_html(&note))).await
                }
                Ok((false, note)) => {
                    send_split(&state, chat_id, &format!("❌ {}", escape_html(&note))).await
                }
                Err(e) => {
                    send_split(&state, chat_id, &format!("❌ {}", escape_html(&e.to_string())))
                        .await
                }
            }
            Ok(())
        }

        "cron" => {
            if arg.trim().eq_ignore_ascii_case("reload") {
                match state.scheduler.reload().await {
                    Ok(0) => send_split(&state, chat_id, "⚠️ No schedules found in cron.yaml").await,
                    Ok(count) => {
                        send_split(
                            &state,
                            chat_id,
                            &format!(
                                "🔄 Reloaded {count} scheduled job{}",
                                if count == 1 { "" } else { "s" }
                            ),
                        )
                        .await
                    }
                    Err(e) => {
                        send_split(&state, chat_id, &format!("❌ {}", escape_html(&e.to_string())))
                            .await
                    }
                }
                return Ok(());
            }

            let status = state.scheduler.status_html().await;
            let note = "\n\n<i>cron.yaml is watched for changes; /cron reload forces one.</i>";
            send_split(&state, chat_id, &format!("{status}{note}")).await;
            Ok(())
        }

        "retry" => {
            let Some(last) = state.session.last_message().await else {
                send_split(&state, chat_id, "❌ No message to retry.").await;
                return Ok(());
            };

            if state.session.is_running().await {
                send_split(&state, chat_id, "⏳ A query is already running. Use /stop first.")
                    .await;
                return Ok(());
            }

            let preview: String = last.chars().take(50).collect();
            let _ = bot
                .send_message(msg.chat.id, format!("🔄 Retrying: \"{preview}\""))
                .await;

            run_text_prompt(
                PromptContext {
                    bot: bot.clone(),
                    state: state.clone(),
                    chat_id,
                    user_id,
                    username,
                    origin: None,
                },
                "RETRY",
                last,
            )
            .await
        }

        "restart" => {
            let sent = bot.send_message(msg.chat.id, "🔄 Restarting bot...").await?;
            let payload = serde_json::json!({
                "chat_id": chat_id,
                "message_id": sent.id.0,
                "timestamp": std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            });
            if let Err(error) = std::fs::write(
                &state.cfg.restart_file,
                serde_json::to_string(&payload).unwrap_or_default(),
            ) {
                tracing::error!(%error, "failed to write restart file");
            }

            tracing::info!("restart requested, exiting for supervisor relaunch");
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            std::process::exit(0);
        }

        other => {
            send_split(
                &state,
                chat_id,
                &format!("Unknown command: /{}", escape_html(other)),
            )
            .await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_strips_bot_name() {
        assert_eq!(parse_command("/start"), ("start".into(), "".into()));
        assert_eq!(
            parse_command("/cron@relay_bot reload"),
            ("cron".into(), "reload".into())
        );
        assert_eq!(
            parse_command("/retry  extra  args"),
            ("retry".into(), "extra  args".into())
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3665), "1h 1m 5s");
        assert_eq!(format_duration(-3), "0s");
    }

    #[test]
    fn test_format_time_remaining() {
        assert_eq!(format_time_remaining(None), "");
        assert_eq!(format_time_remaining(Some("garbage")), "");
        let past = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        assert_eq!(format_time_remaining(Some(&past)), "now");
        let future = (Utc::now() + chrono::Duration::minutes(90)).to_rfc3339();
        assert_eq!(format_time_remaining(Some(&future)), "1h 29m");
    }
}
