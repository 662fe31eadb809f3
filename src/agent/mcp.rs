//! Typed MCP server configuration.
//!
//! Loaded once from `mcp-config.json` at the repo root, `${VAR}` placeholders
//! interpolated from the environment, then materialised per chat into a temp
//! file so the button-question server knows which conversation it serves.

use crate::config::Config;
use crate::{ChatId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One MCP server entry, either a stdio child process or an HTTP endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        #[serde(rename = "type")]
        kind: McpHttpKind,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum McpHttpKind {
    #[serde(rename = "http")]
    Http,
}

pub type McpServers = HashMap<String, McpServerConfig>;

/// Load MCP servers from a JSON file with `${VAR}` interpolation.
/// A missing file is an empty map, not an error.
pub fn load_mcp_servers(path: &Path) -> Result<McpServers> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let servers: McpServers = serde_json::from_value(interpolate_env(value))?;
    Ok(servers)
}

/// Materialise the MCP config for one chat, injecting the chat id into the
/// ask-user server's environment. Returns `None` when no servers are
/// configured.
pub fn prepare_for_chat(cfg: &Config, chat_id: ChatId) -> Result<Option<PathBuf>> {
    let base = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("mcp-config.json");

    let mut servers = load_mcp_servers(&base)?;
    if servers.is_empty() {
        return Ok(None);
    }

    if let Some(McpServerConfig::Stdio { env, .. }) = servers.get_mut("ask-user") {
        env.insert("TELEGRAM_CHAT_ID".to_string(), chat_id.0.to_string());
    }

    let path = cfg.temp_dir.join(format!(
        "mcp-config-{}-{}.json",
        chat_id.0,
        std::process::id()
    ));
    std::fs::write(&path, serde_json::to_string_pretty(&servers)?)?;
    Ok(Some(path))
}

fn interpolate_env(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::String(s) => serde_json::Value::String(interpolate_env_str(&s)),
        serde_json::Value::Array(xs) => {
            serde_json::Value::Array(xs.into_iter().map(interpolate_env).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter().map(|(k, v)| (k, interpolate_env(v))).collect(),
        ),
        other => other,
    }
}

/// `${VAR}` expansion; unset variables become the empty string.
fn interpolate_env_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_interpolation() {
        let key = format!("RELAYBOT_MCP_TEST_{}", std::process::id());
        std::env::set_var(&key, "abc123");
        assert_eq!(
            interpolate_env_str(&format!("https://x.test/?k=${{{key}}}")),
            "https://x.test/?k=abc123"
        );
        assert_eq!(interpolate_env_str("no placeholders"), "no placeholders");
        assert_eq!(interpolate_env_str("${UNSET_DOES_NOT_EXIST_XYZ}"), "");
        std::env::remove_var(&key);
    }

    #[test]
    fn test_load_typed_servers() {
        let key = format!("RELAYBOT_MCP_KEY_{}", std::process::id());
        std::env::set_var(&key, "k1");

        let path = std::env::temp_dir().join(format!("mcp-{}.json", std::process::id()));
        std::fs::write(
            &path,
            format!(
                r#"{{
                  "ask-user": {{ "command": "ask-user-mcp", "args": [] }},
                  "remote": {{ "type": "http", "url": "https://mcp.example/?key=${{{key}}}" }}
                }}"#
            ),
        )
        .unwrap();

        let servers = load_mcp_servers(&path).unwrap();
        assert!(matches!(
            servers.get("ask-user"),
            Some(McpServerConfig::Stdio { command, .. }) if command == "ask-user-mcp"
        ));
        assert!(matches!(
            servers.get("remote"),
            Some(McpServerConfig::Http { url, .. }) if url.ends_with("key=k1")
        ));

        let _ = std::fs::remove_file(&path);
        std::env::remove_var(&key);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let servers = load_mcp_servers(Path::new("/nonexistent/mcp.json")).unwrap();
        assert!(servers.is_empty());
    }
}
