//! Document handling: text files, PDFs and archives.
//!
//! Content is extracted on the bridge side and inlined into the prompt so the
//! agent never touches the raw upload. Archives go through the hardened
//! extractor with a bounded tree/content digest.

use crate::archive::{safe_extract_archive, sanitize_filename, ExtractLimits};
use crate::handlers::media_group::{BoxFuture, MediaGroupBuffer, MediaGroupConfig};
use crate::handlers::prompt::{
    check_rate_limit, origin_of, run_prompt, PromptContext, PromptOptions,
};
use crate::handlers::AppState;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use teloxide::net::Download;
use teloxide::prelude::*;

static DOC_COUNTER: AtomicUsize = AtomicUsize::new(1);
static DOC_BUFFER: OnceLock<Arc<MediaGroupBuffer>> = OnceLock::new();

const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
/// Per-file read-back cap for text inside archives.
const MAX_ARCHIVE_FILE_READ: u64 = 100 * 1024;
/// Total archive content returned to the agent.
const MAX_ARCHIVE_CONTENT: usize = 1024 * 1024;
/// Ceiling for text inlined into one prompt.
const MAX_PROMPT_TEXT: usize = 50_000;

fn text_extensions() -> &'static [&'static str] {
    &[
        ".md", ".txt", ".json", ".yaml", ".yml", ".csv", ".xml", ".html", ".css", ".js", ".ts",
        ".py", ".rs", ".sh", ".env", ".log", ".cfg", ".ini", ".toml",
    ]
}

fn is_text_file(name: &str, mime: Option<&str>) -> bool {
    if mime.is_some_and(|m| m.starts_with("text/")) {
        return true;
    }
    let lower = name.to_lowercase();
    text_extensions().iter().any(|ext| lower.ends_with(ext))
}

fn is_pdf(name: &str, mime: Option<&str>) -> bool {
    mime == Some("application/pdf") || name.to_lowercase().ends_with(".pdf")
}

fn is_archive(name: &str) -> bool {
    crate::archive::detect_archive_kind(name).is_some()
}

fn uniquify_filename(name: &str, ts: u128, n: usize) -> String {
    let base = sanitize_filename(name);
    if let Some((stem, ext)) = base.rsplit_once('.') {
        if !stem.is_empty() && !ext.is_empty() {
            return format!("{stem}_{ts}_{n}.{ext}");
        }
    }
    format!("{base}_{ts}_{n}")
}

fn doc_buffer() -> &'static Arc<MediaGroupBuffer> {
    DOC_BUFFER.get_or_init(|| {
        let process = Arc::new(
            |ctx: PromptContext, items: Vec<String>, caption: Option<String>| {
                let fut: BoxFuture = Box::pin(async move {
                    let docs = extract_documents(&items).await;
                    if docs.is_empty() {
                        let _ = ctx
                            .bot
                            .send_message(
                                teloxide::types::ChatId(ctx.chat_id),
                                "❌ Failed to extract any documents.",
                            )
                            .await;
                        return;
                    }

                    let prompt = build_documents_prompt(&docs, caption.as_deref());
                    let _ = run_prompt(
                        ctx,
                        "DOCUMENT",
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
                emoji: "📄",
                item_label_plural: "documents",
            },
            process,
        )
    })
}

async fn download_document(
    bot: &Bot,
    state: &AppState,
    doc: &teloxide::types::Document,
) -> anyhow::Result<String> {
    let _slot = crate::handlers::DOWNLOAD_SLOTS.acquire().await;
    let file = bot.get_file(doc.file.id.clone()).await?;

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let n = DOC_COUNTER.fetch_add(1, Ordering::SeqCst);
    let file_name = doc
        .file_name
        .as_deref()
        .map(|s| uniquify_filename(s, ts, n))
        .unwrap_or_else(|| format!("doc_{ts}_{n}"));

    let path = state.cfg.temp_dir.join(file_name);
    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;
    Ok(path.to_string_lossy().to_string())
}

/// Extract PDF text via the external `pdftotext` CLI.
async fn extract_pdf(path: &str) -> String {
    let out = tokio::process::Command::new("pdftotext")
        .arg("-layout")
        .arg(path)
        .arg("-")
        .output()
        .await;

    match out {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).into_owned(),
        _ => "[PDF parsing failed - ensure pdftotext is installed]".to_string(),
    }
}

async fn extract_text_file(path: &str) -> Option<String> {
    let path = path.to_string();
    let raw = tokio::task::spawn_blocking(move || std::fs::read_to_string(path))
        .await
        .ok()?
        .ok()?;
    Some(raw.chars().take(MAX_PROMPT_TEXT).collect())
}

async fn extract_documents(paths: &[String]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for p in paths {
        let name = p.rsplit('/').next().unwrap_or("document").to_string();
        if name.to_lowercase().ends_with(".pdf") {
            out.push((name, extract_pdf(p).await));
            continue;
        }
        if let Some(txt) = extract_text_file(p).await {
            out.push((name, txt));
        }
    }
    out
}

fn build_documents_prompt(docs: &[(String, String)], caption: Option<&str>) -> String {
    if let [(name, content)] = docs {
        return match caption {
            Some(c) if !c.trim().is_empty() => {
                format!("Document: {name}\n\nContent:\n{content}\n\n---\n\n{c}")
            }
            _ => format!("Please analyze this document ({name}):\n\n{content}"),
        };
    }

    let list = docs
        .iter()
        .enumerate()
        .map(|(i, (name, content))| format!("--- Document {}: {name} ---\n{content}", i + 1))
        .collect::<Vec<_>>()
        .join("\n\n");

    match caption {
        Some(c) if !c.trim().is_empty() => {
            format!("{} Documents:\n\n{list}\n\n---\n\n{c}", docs.len())
        }
        _ => format!("Please analyze these {} documents:\n\n{list}", docs.len()),
    }
}

/// Walk an extraction directory into a bounded file tree plus text digests.
fn digest_archive_dir(extract_dir: &Path) -> (Vec<String>, Vec<(String, String)>) {
    let mut tree: Vec<String> = Vec::new();
    let mut contents: Vec<(String, String)> = Vec::new();

    let Ok(rd) = std::fs::read_dir(extract_dir) else {
        return (tree, contents);
    };

    let mut stack: Vec<std::path::PathBuf> = rd.flatten().map(|e| e.path()).collect();
    while let Some(path) = stack.pop() {
        if tree.len() >= 100 {
            break;
        }
        let Ok(md) = std::fs::metadata(&path) else {
            continue;
        };
        if md.is_dir() {
            if let Ok(rd2) = std::fs::read_dir(&path) {
                stack.extend(rd2.flatten().map(|e| e.path()));
            }
            continue;
        }

        let rel = path
            .strip_prefix(extract_dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string_lossy().into_owned());
        tree.push(rel.clone());

        let lower = rel.to_lowercase();
        if !text_extensions().iter().any(|ext| lower.ends_with(ext)) {
            continue;
        }
        if md.len() > MAX_ARCHIVE_FILE_READ {
            continue;
        }
        if let Ok(txt) = std::fs::read_to_string(&path) {
            let truncated: String = txt.chars().take(10_000).collect();
            let total: usize = contents.iter().map(|(_, c)| c.len()).sum();
            if total + truncated.len() > MAX_ARCHIVE_CONTENT {
                break;
            }
            contents.push((rel, truncated));
        }
    }

    tree.sort();
    (tree, contents)
}

async fn handle_archive(
    bot: Bot,
    state: Arc<AppState>,
    ctx: PromptContext,
    doc: &teloxide::types::Document,
    file_name: String,
    caption: Option<String>,
) -> ResponseResult<()> {
    if !check_rate_limit(&ctx).await {
        return Ok(());
    }

    let status = state
        .messenger
        .send_html(
            crate::ChatId(ctx.chat_id),
            &format!(
                "📦 Extracting <b>{}</b>...",
                crate::format::escape_html(&file_name)
            ),
        )
        .await
        .ok();

    let archive_path = match download_document(&bot, &state, doc).await {
        Ok(p) => p,
        Err(error) => {
            tracing::error!(%error, "archive download failed");
            let _ = bot
                .send_message(
                    teloxide::types::ChatId(ctx.chat_id),
                    "❌ Failed to download archive.",
                )
                .await;
            return Ok(());
        }
    };

    let extract_dir = state.cfg.temp_dir.join(format!(
        "archive_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    ));

    let extraction = tokio::task::spawn_blocking({
        let archive_path = std::path::PathBuf::from(&archive_path);
        let file_name = file_name.clone();
        let extract_dir = extract_dir.clone();
        move || {
            safe_extract_archive(
                &archive_path,
                &file_name,
                &extract_dir,
                ExtractLimits::default(),
            )
        }
    })
    .await;

    match extraction {
        Ok(Ok(report)) => {
            let (tree, contents) = digest_archive_dir(&extract_dir);

            let tree_str = if tree.is_empty() {
                "(empty)".to_string()
            } else {
                tree.join("\n")
            };
            let contents_str = if contents.is_empty() {
                "(no readable text files)".to_string()
            } else {
                contents
                    .iter()
                    .map(|(n, c)| format!("--- {n} ---\n{c}"))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            };

            let mut prompt = match caption.as_deref().filter(|c| !c.trim().is_empty()) {
                Some(c) => format!(
                    "Archive: {file_name}\n\nFile tree ({} files):\n{tree_str}\n\nExtracted contents:\n{contents_str}\n\n---\n\n{c}",
                    report.extracted_files.len()
                ),
                None => format!(
                    "Please analyze this archive ({file_name}):\n\nFile tree ({} files):\n{tree_str}\n\nExtracted contents:\n{contents_str}",
                    report.extracted_files.len()
                ),
            };
            if prompt.len() > MAX_PROMPT_TEXT {
                prompt.truncate(MAX_PROMPT_TEXT);
            }

            let _ = run_prompt(
                ctx.clone(),
                "ARCHIVE",
                prompt,
                PromptOptions {
                    record_last_message: false,
                    skip_rate_limit: true,
                },
            )
            .await;

            let _ = std::fs::remove_dir_all(&extract_dir);
        }
        Ok(Err(error)) => {
            tracing::warn!(%error, file = %file_name, "archive rejected");
            let _ = bot
                .send_message(
                    teloxide::types::ChatId(ctx.chat_id),
                    format!("❌ Failed to extract archive: {error}"),
                )
                .await;
        }
        Err(_) => {
            let _ = bot
                .send_message(
                    teloxide::types::ChatId(ctx.chat_id),
                    "❌ Failed to extract archive.",
                )
                .await;
        }
    }

    if let Some(st) = status {
        let _ = state.messenger.delete_message(st).await;
    }

    state.audit.append_best_effort(crate::audit::AuditEvent::message(
        ctx.user_id,
        &ctx.username,
        "ARCHIVE",
        &file_name,
        None,
    ));

    Ok(())
}

pub async fn handle_document(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    let Some(doc) = msg.document().cloned() else {
        return Ok(());
    };

    let user_id = user.id.0 as i64;
    let username = user.username.clone().unwrap_or_else(|| "unknown".into());
    let chat_id = msg.chat.id.0;

    if doc.file.size as u64 > MAX_FILE_SIZE {
        let _ = bot
            .send_message(msg.chat.id, "❌ File too large. Maximum size is 10MB.")
            .await;
        return Ok(());
    }

    let file_name = doc
        .file_name
        .clone()
        .unwrap_or_else(|| "document".to_string());
    let mime = doc.mime_type.as_ref().map(|m| m.essence_str().to_string());
    let mime = mime.as_deref();

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

    // Archives are handled on their own path (no album support).
    if is_archive(&file_name) {
        return handle_archive(bot, state, ctx, &doc, file_name, caption).await;
    }

    if !is_pdf(&file_name, mime) && !is_text_file(&file_name, mime) {
        let _ = bot
            .send_message(
                msg.chat.id,
                format!(
                    "❌ Unsupported file type.\n\nSupported: PDF, archives (.zip, .tar, .tar.gz, .tgz), {}",
                    text_extensions().join(", ")
                ),
            )
            .await;
        return Ok(());
    }

    let doc_path = match download_document(&bot, &state, &doc).await {
        Ok(p) => p,
        Err(error) => {
            tracing::error!(%error, "document download failed");
            let _ = bot
                .send_message(
                    msg.chat.id,
                    format!(
                        "❌ Failed to download document: {}",
                        crate::audit::truncate(&error.to_string(), 100)
                    ),
                )
                .await;
            return Ok(());
        }
    };

    match media_group_id {
        None => {
            if !check_rate_limit(&ctx).await {
                return Ok(());
            }

            let content = if is_pdf(&file_name, mime) {
                extract_pdf(&doc_path).await
            } else {
                extract_text_file(&doc_path).await.unwrap_or_default()
            };

            let prompt = build_documents_prompt(&[(file_name, content)], caption.as_deref());
            run_prompt(
                ctx,
                "DOCUMENT",
                prompt,
                PromptOptions {
                    record_last_message: false,
                    skip_rate_limit: true,
                },
            )
            .await
        }
        Some(group_id) => {
            let timeout = state.cfg.media_group_timeout;
            doc_buffer()
                .add_to_group(ctx, group_id, doc_path, caption, timeout)
                .await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_detection() {
        assert!(is_text_file("notes.md", None));
        assert!(is_text_file("data.bin", Some("text/plain")));
        assert!(!is_text_file("data.bin", Some("application/octet-stream")));
        assert!(is_pdf("paper.PDF", None));
        assert!(is_pdf("x", Some("application/pdf")));
        assert!(is_archive("src.tar.gz"));
        assert!(!is_archive("src.rar"));
    }

    #[test]
    fn test_uniquify_preserves_extension() {
        let name = uniquify_filename("my report.pdf", 123, 1);
        assert!(name.starts_with("my_report_123_1"));
        assert!(name.ends_with(".pdf"));

        let bare = uniquify_filename("README", 123, 2);
        assert_eq!(bare, "README_123_2");
    }

    #[test]
    fn test_documents_prompt_shapes() {
        let single = vec![("a.txt".to_string(), "body".to_string())];
        let p = build_documents_prompt(&single, Some("summarize"));
        assert!(p.contains("Document: a.txt"));
        assert!(p.contains("summarize"));

        let multi = vec![
            ("a.txt".to_string(), "one".to_string()),
            ("b.txt".to_string(), "two".to_string()),
        ];
        let p = build_documents_prompt(&multi, None);
        assert!(p.contains("Document 1: a.txt"));
        assert!(p.contains("Document 2: b.txt"));
    }
}
