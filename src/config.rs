//! Configuration loading and validation.
//!
//! Everything comes from the environment (optionally seeded from a `.env`
//! file next to the binary). Required: `TELEGRAM_BOT_TOKEN` and
//! `TELEGRAM_ALLOWED_USERS`. Everything else has defaults matching a
//! single-operator deployment.

use crate::error::{ConfigError, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Relaybot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot API token.
    pub bot_token: String,

    /// Users allowed to talk to the bot. Must be non-empty.
    pub allowed_users: Vec<i64>,

    /// Working directory the agent runs in.
    pub working_dir: PathBuf,

    /// Directories the agent may touch (`--add-dir` plus policy checks).
    pub allowed_paths: Vec<PathBuf>,

    /// Prefixes that are always readable (downloaded media lives here).
    pub temp_paths: Vec<PathBuf>,

    /// Literal substrings that make a Bash command an automatic deny.
    pub blocked_patterns: Vec<String>,

    /// Safety preamble appended to the agent's system prompt.
    pub safety_prompt: String,

    /// Path to the agent CLI binary.
    pub agent_path: PathBuf,

    /// Writable config dir handed to the agent via `CLAUDE_CONFIG_DIR`.
    pub agent_config_dir: Option<PathBuf>,

    /// Model alias passed to the agent, if any.
    pub agent_model: Option<String>,

    /// Soft wall-clock ceiling for one query.
    pub query_timeout: Duration,

    /// Scratch directory for downloaded media and generated MCP configs.
    pub temp_dir: PathBuf,

    /// Session checkpoint file.
    pub session_file: PathBuf,

    /// Restart pointer file written by `/restart`.
    pub restart_file: PathBuf,

    /// Hard platform message limit (Telegram: 4096).
    pub message_limit: usize,

    /// Safe chunk size used when splitting overflowing segments.
    pub safe_limit: usize,

    /// Minimum spacing between streaming edits of one segment.
    pub streaming_throttle: Duration,

    /// Inline keyboard button labels are truncated to this length.
    pub button_label_max: usize,

    /// Thinking-token budget when no keyword matches.
    pub default_thinking_tokens: u32,
    pub thinking_keywords: Vec<String>,
    pub thinking_deep_keywords: Vec<String>,

    /// Progress/cleanup behavior for the streaming renderer.
    pub spinner_enabled: bool,
    pub show_elapsed: bool,
    pub reaction_enabled: bool,
    pub delete_thinking_messages: bool,
    pub delete_tool_messages: bool,

    /// Audit log sink.
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,

    /// Per-user token bucket.
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    /// How long to wait for more items of a media album.
    pub media_group_timeout: Duration,

    /// Voice transcription (absent key disables the feature).
    pub openai_api_key: Option<String>,
    pub transcription_prompt: String,
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        load_dotenv(Path::new(".env"));

        let bot_token = env_str("TELEGRAM_BOT_TOKEN")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingEnv("TELEGRAM_BOT_TOKEN"))?;

        let allowed_users = parse_csv_i64(env_str("TELEGRAM_ALLOWED_USERS"));
        if allowed_users.is_empty() {
            return Err(ConfigError::MissingEnv("TELEGRAM_ALLOWED_USERS").into());
        }

        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("cannot determine home directory".into()))?;
        let working_dir = env_path("CLAUDE_WORKING_DIR").unwrap_or_else(|| home.clone());

        let default_allowed = vec![
            working_dir.clone(),
            home.join("Documents"),
            home.join("Downloads"),
            home.join("Desktop"),
            home.join(".claude"),
        ];
        let allowed_paths = parse_csv_paths(env_str("ALLOWED_PATHS")).unwrap_or(default_allowed);

        let temp_paths = vec![
            PathBuf::from("/tmp/"),
            PathBuf::from("/private/tmp/"),
            PathBuf::from("/var/folders/"),
        ];

        let blocked_patterns = [
            "rm -rf /",
            "rm -rf ~",
            "rm -rf $HOME",
            "sudo rm",
            ":(){ :|:& };:",
            "> /dev/sd",
            "mkfs.",
            "dd if=",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let safety_prompt = build_safety_prompt(&allowed_paths);

        let agent_path = env_path("CLAUDE_CLI_PATH")
            .or_else(|| which("claude"))
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/claude"));

        let temp_dir =
            env_path("TEMP_DIR").unwrap_or_else(|| PathBuf::from("/tmp/relaybot"));
        // Failing to create the scratch dir is fatal; downloads have nowhere to go.
        std::fs::create_dir_all(&temp_dir)?;

        let openai_api_key = env_str("OPENAI_API_KEY").filter(|s| !s.trim().is_empty());

        Ok(Self {
            bot_token,
            allowed_users,
            working_dir,
            allowed_paths,
            temp_paths,
            blocked_patterns,
            safety_prompt,
            agent_path,
            agent_config_dir: env_path("CLAUDE_CONFIG_DIR"),
            agent_model: env_str("CLAUDE_MODEL").filter(|s| !s.trim().is_empty()),
            query_timeout: Duration::from_millis(env_u64("QUERY_TIMEOUT_MS").unwrap_or(180_000)),
            temp_dir,
            session_file: env_path("SESSION_FILE")
                .unwrap_or_else(|| PathBuf::from("/tmp/relaybot-session.json")),
            restart_file: env_path("RESTART_FILE")
                .unwrap_or_else(|| PathBuf::from("/tmp/relaybot-restart.json")),
            message_limit: env_usize("TELEGRAM_MESSAGE_LIMIT").unwrap_or(4096),
            safe_limit: env_usize("TELEGRAM_SAFE_LIMIT").unwrap_or(4000),
            streaming_throttle: Duration::from_millis(
                env_u64("STREAMING_THROTTLE_MS").unwrap_or(500),
            ),
            button_label_max: env_usize("BUTTON_LABEL_MAX_LENGTH").unwrap_or(30),
            default_thinking_tokens: env_u32("DEFAULT_THINKING_TOKENS").unwrap_or(0).min(128_000),
            thinking_keywords: parse_csv_lower(
                env_str("THINKING_KEYWORDS").unwrap_or_else(|| "think".into()),
            ),
            thinking_deep_keywords: parse_csv_lower(
                env_str("THINKING_DEEP_KEYWORDS")
                    .unwrap_or_else(|| "ultrathink,think hard".into()),
            ),
            spinner_enabled: env_bool("PROGRESS_SPINNER").unwrap_or(true),
            show_elapsed: env_bool("PROGRESS_SHOW_ELAPSED").unwrap_or(true),
            reaction_enabled: env_bool("PROGRESS_REACTIONS").unwrap_or(true),
            delete_thinking_messages: env_bool("DELETE_THINKING_MESSAGES").unwrap_or(false),
            delete_tool_messages: env_bool("DELETE_TOOL_MESSAGES").unwrap_or(true),
            audit_log_path: env_path("AUDIT_LOG_PATH")
                .unwrap_or_else(|| PathBuf::from("/tmp/relaybot-audit.log")),
            audit_log_json: env_bool("AUDIT_LOG_JSON").unwrap_or(false),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED").unwrap_or(true),
            rate_limit_requests: env_u32("RATE_LIMIT_REQUESTS").unwrap_or(20),
            rate_limit_window: Duration::from_secs(env_u64("RATE_LIMIT_WINDOW").unwrap_or(60)),
            media_group_timeout: Duration::from_millis(
                env_u64("MEDIA_GROUP_TIMEOUT").unwrap_or(1000),
            ),
            transcription_prompt: build_transcription_prompt(),
            openai_api_key,
        })
    }

    pub fn transcription_available(&self) -> bool {
        self.openai_api_key.is_some()
    }

    pub fn cron_manifest_path(&self) -> PathBuf {
        self.working_dir.join("cron.yaml")
    }

    pub fn save_id_file(&self) -> PathBuf {
        self.working_dir.join(".last-save-id")
    }

    pub fn restart_context_dir(&self) -> PathBuf {
        self.working_dir.join("docs/tasks/save")
    }
}

fn build_safety_prompt(allowed_paths: &[PathBuf]) -> String {
    let paths_list = allowed_paths
        .iter()
        .map(|p| format!("   - {} (and subdirectories)", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"CRITICAL SAFETY RULES:

1. NEVER delete, remove, or overwrite files without EXPLICIT confirmation from the user.
   - If the user asks to delete something, ask them to confirm first.
   - Only proceed after an explicit confirmation like "yes delete it".

2. You can ONLY access files in these directories:
{paths_list}
   - REFUSE any file operations outside these paths.

3. NEVER run dangerous commands like recursive force deletes or anything that
   affects files outside the allowed directories.

4. For any destructive or irreversible action, ALWAYS ask for confirmation first.

You are running via a chat bot, so the user cannot easily undo mistakes. Be extra careful!"#
    )
}

fn build_transcription_prompt() -> String {
    const BASE: &str = "Transcribe this voice message accurately.\n\
The speaker may use multiple languages.\n\
Focus on accuracy for proper nouns, technical terms, and commands.";

    match env_str("TRANSCRIPTION_CONTEXT").filter(|s| !s.trim().is_empty()) {
        Some(ctx) => format!("{BASE}\n\nAdditional context:\n{ctx}"),
        None => BASE.to_string(),
    }
}

/// Seed the environment from a `.env` file without overriding existing vars.
fn load_dotenv(path: &Path) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue;
        }

        let mut val = v.trim();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = &val[1..val.len() - 1];
        }
        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

fn parse_csv_lower(v: String) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_csv_paths(v: Option<String>) -> Option<Vec<PathBuf>> {
    let out: Vec<PathBuf> = v?
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    (!out.is_empty()).then_some(out)
}

fn which(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parsing_skips_garbage() {
        let users = parse_csv_i64(Some("42, 99,nope,  7".into()));
        assert_eq!(users, vec![42, 99, 7]);
    }

    #[test]
    fn dotenv_does_not_override_existing() {
        let key = format!("RELAYBOT_TEST_{}", std::process::id());
        env::set_var(&key, "kept");

        let path = std::env::temp_dir().join(format!("{key}.env"));
        std::fs::write(&path, format!("{key}=overwritten\nNEW_{key}=\"quoted\"\n")).unwrap();
        load_dotenv(&path);

        assert_eq!(env::var(&key).unwrap(), "kept");
        assert_eq!(env::var(format!("NEW_{key}")).unwrap(), "quoted");

        let _ = std::fs::remove_file(&path);
        env::remove_var(&key);
        env::remove_var(format!("NEW_{key}"));
    }
}
