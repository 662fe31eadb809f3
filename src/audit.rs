//! Append-only audit logging.
//!
//! Every authorization decision, message, tool use, rate-limit hit and error
//! gets one entry. The sink is best-effort: a failed write is logged and
//! swallowed, never fatal.

use chrono::Utc;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const MAX_TEXT: usize = 500;

#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl AuditEvent {
    fn base(event: &str, user_id: i64, username: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event: event.to_string(),
            user_id: Some(user_id),
            username: Some(username.to_string()),
            message_type: None,
            content: None,
            response: None,
            authorized: None,
            tool_name: None,
            tool_input: None,
            blocked: None,
            reason: None,
            error: None,
            context: None,
            retry_after: None,
        }
    }

    pub fn message(
        user_id: i64,
        username: &str,
        message_type: &str,
        content: &str,
        response: Option<&str>,
    ) -> Self {
        Self {
            message_type: Some(message_type.to_string()),
            content: Some(content.to_string()),
            response: response.map(String::from),
            ..Self::base("message", user_id, username)
        }
    }

    pub fn auth(user_id: i64, username: &str, authorized: bool) -> Self {
        Self {
            authorized: Some(authorized),
            ..Self::base("auth", user_id, username)
        }
    }

    pub fn tool_use(
        user_id: i64,
        username: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
        blocked: bool,
        reason: Option<&str>,
    ) -> Self {
        Self {
            tool_name: Some(tool_name.to_string()),
            tool_input: Some(tool_input),
            blocked: Some(blocked),
            reason: reason.map(String::from),
            ..Self::base("tool_use", user_id, username)
        }
    }

    pub fn error(user_id: i64, username: &str, error: &str, context: Option<&str>) -> Self {
        Self {
            error: Some(error.to_string()),
            context: context.map(String::from),
            ..Self::base("error", user_id, username)
        }
    }

    pub fn rate_limit(user_id: i64, username: &str, retry_after: f64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::base("rate_limit", user_id, username)
        }
    }
}

/// Audit sink with two selectable serializations: one JSON object per line,
/// or a human-readable block.
#[derive(Clone, Debug)]
pub struct AuditLog {
    path: PathBuf,
    json: bool,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event, truncating oversized payloads first.
    pub fn append(&self, mut event: AuditEvent) -> crate::Result<()> {
        if let Some(s) = &event.content {
            event.content = Some(truncate(s, MAX_TEXT));
        }
        if let Some(s) = &event.response {
            event.response = Some(truncate(s, MAX_TEXT));
        }
        if let Some(v) = &event.tool_input {
            event.tool_input = Some(truncate_json_strings(v, MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        let value = serde_json::to_value(&event)?;
        let Some(obj) = value.as_object() else {
            return Ok(());
        };

        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            match v {
                serde_json::Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        out.push('\n');
        file.write_all(out.as_bytes())?;
        Ok(())
    }

    /// Append, logging failures instead of propagating them.
    pub fn append_best_effort(&self, event: AuditEvent) {
        if let Err(error) = self.append(event) {
            tracing::warn!(%error, path = %self.path.display(), "audit write failed");
        }
    }
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_len).collect();
    out.push_str("...");
    out
}

fn truncate_json_strings(v: &serde_json::Value, max_len: usize) -> serde_json::Value {
    match v {
        serde_json::Value::String(s) => serde_json::Value::String(truncate(s, max_len)),
        serde_json::Value::Array(xs) => serde_json::Value::Array(
            xs.iter().map(|x| truncate_json_strings(x, max_len)).collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_json_strings(v, max_len)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis();
        PathBuf::from(format!("/tmp/{prefix}-{}-{ts}.log", std::process::id()))
    }

    #[test]
    fn test_json_lines_format() {
        let log = AuditLog::new(tmp_file("audit-json"), true);
        log.append(AuditEvent::auth(42, "alice", false)).unwrap();
        log.append(AuditEvent::rate_limit(42, "alice", 12.5)).unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "auth");
        assert_eq!(first["authorized"], false);
    }

    #[test]
    fn test_payload_truncation() {
        let log = AuditLog::new(tmp_file("audit-trunc"), true);
        let long = "x".repeat(MAX_TEXT + 50);
        log.append(AuditEvent::message(1, "u", "TEXT", &long, Some(&long)))
            .unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        assert!(written.contains("..."));
        assert!(!written.contains(&long));
    }

    #[test]
    fn test_tool_input_truncated_recursively() {
        let log = AuditLog::new(tmp_file("audit-tool"), true);
        let long = "z".repeat(MAX_TEXT + 10);
        let input = serde_json::json!({ "command": long, "nested": { "arg": long } });
        log.append(AuditEvent::tool_use(1, "u", "Bash", input, true, Some("blocked pattern")))
            .unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        assert!(written.contains("..."));
        assert!(written.contains("blocked pattern"));
    }

    #[test]
    fn test_human_block_format() {
        let log = AuditLog::new(tmp_file("audit-human"), false);
        log.append(AuditEvent::auth(7, "bob", true)).unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        assert!(written.contains("="));
        assert!(written.contains("event: auth"));
        assert!(written.contains("username: bob"));
    }
}
