//! Agent CLI adapter.
//!
//! Spawns the agent in non-interactive streaming mode, writes the prompt (and
//! any steering frames) as JSON lines on stdin, and decodes the NDJSON event
//! stream from stdout. Stderr is captured in a bounded buffer for diagnostics
//! when the process dies.

use crate::agent::{
    AgentCapabilities, AgentClient, AgentEvent, RunRequest, RunResult, TokenUsage,
};
use crate::error::AgentError;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const MAX_STDERR_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ClaudeConfig {
    pub agent_path: PathBuf,
    pub model: Option<String>,
    pub config_dir: Option<PathBuf>,
}

/// Child-process adapter for the agent CLI.
#[derive(Clone)]
pub struct ClaudeAgent {
    cfg: ClaudeConfig,
    child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl ClaudeAgent {
    pub fn new(cfg: ClaudeConfig) -> Self {
        Self {
            cfg,
            child: Arc::new(Mutex::new(None)),
            stdin: Arc::new(Mutex::new(None)),
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    fn build_command(&self, req: &RunRequest) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.cfg.agent_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--permission-mode")
            .arg("bypassPermissions")
            .arg("--dangerously-skip-permissions");

        if let Some(model) = &self.cfg.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(sys) = &req.system_prompt {
            cmd.arg("--append-system-prompt").arg(sys);
        }
        for dir in &req.add_dirs {
            cmd.arg("--add-dir").arg(dir);
        }
        if let Some(id) = &req.resume {
            cmd.arg("--resume").arg(id);
        }
        if let Some(path) = &req.mcp_config_path {
            cmd.arg("--mcp-config").arg(path);
        }

        if let Some(dir) = &self.cfg.config_dir {
            cmd.env("CLAUDE_CONFIG_DIR", dir);
        }
        if req.max_thinking_tokens > 0 {
            cmd.env("MAX_THINKING_TOKENS", req.max_thinking_tokens.to_string());
        }

        cmd.current_dir(&req.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn write_user_frame(stdin: &mut ChildStdin, text: &str) -> Result<()> {
        let frame = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": text }]
            }
        });
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|e| Error::Agent(AgentError::Protocol(format!("stdin write: {e}"))))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Agent(AgentError::Protocol(format!("stdin flush: {e}"))))?;
        Ok(())
    }

    async fn teardown(&self) {
        {
            let mut stdin = self.stdin.lock().await;
            *stdin = None; // dropping closes the pipe
        }
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.kill().await;
        }
        *guard = None;
    }
}

#[async_trait]
impl AgentClient for ClaudeAgent {
    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            streaming: true,
            tools: true,
            vision: true,
            thinking: true,
            mcp: true,
        }
    }

    async fn run(
        &self,
        req: RunRequest,
        on_event: &mut (dyn FnMut(AgentEvent) -> Result<()> + Send),
    ) -> Result<RunResult> {
        // A previous run still holding the child is stale at this point.
        let _ = self.cancel().await;

        let token = CancellationToken::new();
        *self.cancel.lock().await = Some(token.clone());

        let mut child = self
            .build_command(&req)
            .spawn()
            .map_err(|e| Error::Agent(AgentError::Spawn(e.to_string())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Agent(AgentError::Spawn("stdout not captured".into())))?;
        let stderr = child.stderr.take();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Agent(AgentError::Spawn("stdin not captured".into())))?;

        Self::write_user_frame(&mut stdin, &req.prompt).await?;

        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);

        // Bounded stderr capture for crash diagnostics.
        let stderr_task = tokio::spawn(async move {
            let Some(stderr) = stderr else {
                return String::new();
            };
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::with_capacity(4096);
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let remaining = MAX_STDERR_BYTES.saturating_sub(buf.len());
                        if remaining > 0 {
                            buf.extend_from_slice(&chunk[..n.min(remaining)]);
                        }
                    }
                    Err(_) => break,
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut decoder = StreamDecoder::default();
        let mut reader = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.teardown().await;
                    stderr_task.abort();
                    return Err(Error::Agent(AgentError::Cancelled));
                }
                line = reader.next_line() => {
                    let line = line.map_err(|e| {
                        Error::Agent(AgentError::Protocol(format!("stdout read: {e}")))
                    })?;
                    let Some(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }

                    for ev in decoder.decode_line(&line) {
                        if let Err(e) = on_event(ev) {
                            self.teardown().await;
                            stderr_task.abort();
                            return Err(e);
                        }
                    }
                }
            }
        }

        let status = {
            let mut guard = self.child.lock().await;
            match guard.take() {
                Some(mut child) => child.wait().await?,
                // Cancelled concurrently; the child is already gone.
                None => return Err(Error::Agent(AgentError::Cancelled)),
            }
        };
        *self.stdin.lock().await = None;
        *self.cancel.lock().await = None;

        if !status.success() && decoder.final_text.is_none() {
            let stderr_tail = stderr_task.await.unwrap_or_default();
            let code = status.code().unwrap_or(-1);
            tracing::error!(code, stderr = %stderr_tail.chars().take(2000).collect::<String>(), "agent exited abnormally");
            return Err(Error::Agent(AgentError::Crashed { code }));
        }
        stderr_task.abort();

        Ok(RunResult {
            session_id: decoder.session_id,
            is_error: decoder.final_is_error.unwrap_or(!status.success()),
            text: decoder.final_text.unwrap_or_default(),
            usage: decoder.final_usage,
        })
    }

    async fn steer(&self, text: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(Error::Agent(AgentError::Protocol(
                "no active query to steer".into(),
            )));
        };
        Self::write_user_frame(stdin, text).await
    }

    async fn cancel(&self) -> Result<()> {
        if let Some(token) = self.cancel.lock().await.take() {
            token.cancel();
        }
        self.teardown().await;
        Ok(())
    }
}

/// Line-by-line NDJSON decoder. Tracks the session id and final result fields
/// while translating lines into [`AgentEvent`]s.
#[derive(Default)]
struct StreamDecoder {
    session_id: Option<String>,
    final_text: Option<String>,
    final_is_error: Option<bool>,
    final_usage: Option<TokenUsage>,
}

impl StreamDecoder {
    fn decode_line(&mut self, line: &str) -> Vec<AgentEvent> {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(error) => {
                // Malformed lines are recovered silently.
                tracing::trace!(%error, line, "unparseable agent output line");
                return vec![AgentEvent::Unknown {
                    raw: json!({ "type": "unparsed_line", "line": line }),
                }];
            }
        };

        let mut events = Vec::new();

        // The session id rides on every event; capture the first sighting.
        if self.session_id.is_none() {
            if let Some(id) = value.get("session_id").and_then(|v| v.as_str()) {
                self.session_id = Some(id.to_string());
                events.push(AgentEvent::SessionInit {
                    session_id: id.to_string(),
                });
            }
        }

        match value.get("type").and_then(|v| v.as_str()) {
            Some("system") => {}
            Some("assistant") => self.decode_assistant(&value, &mut events),
            Some("result") => {
                if let Some(text) = value.get("result").and_then(|v| v.as_str()) {
                    self.final_text = Some(text.to_string());
                }
                self.final_is_error = value.get("is_error").and_then(|v| v.as_bool());
                self.final_usage = value.get("usage").map(TokenUsage::parse);

                events.push(AgentEvent::Result {
                    usage: self.final_usage.clone(),
                    duration_ms: value.get("duration_ms").and_then(|v| v.as_u64()),
                    text: self.final_text.clone(),
                    is_error: self.final_is_error.unwrap_or(false),
                });
            }
            Some("tool_progress") | Some("tool_use_summary") => {
                events.push(AgentEvent::ToolProgress { raw: value });
            }
            other => {
                tracing::trace!(event_type = ?other, "unknown agent event type");
                events.push(AgentEvent::Unknown { raw: value });
            }
        }

        events
    }

    fn decode_assistant(&mut self, value: &serde_json::Value, events: &mut Vec<AgentEvent>) {
        let Some(content) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        else {
            return;
        };

        let all_text = content
            .iter()
            .all(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"));

        if all_text {
            let snapshot: String = content
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            events.push(AgentEvent::AssistantText { text: snapshot });
            return;
        }

        for block in content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("thinking") => {
                    if let Some(t) = block.get("thinking").and_then(|t| t.as_str()) {
                        events.push(AgentEvent::AssistantThinking {
                            text: t.to_string(),
                        });
                    }
                }
                Some("tool_use") => {
                    events.push(AgentEvent::ToolUse {
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("Tool")
                            .to_string(),
                        input: block.get("input").cloned().unwrap_or(serde_json::Value::Null),
                    });
                }
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        events.push(AgentEvent::AssistantText {
                            text: t.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_emitted_once() {
        let mut d = StreamDecoder::default();
        let events = d.decode_line(r#"{"type":"system","subtype":"init","session_id":"s1"}"#);
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::SessionInit { session_id }] if session_id == "s1"
        ));

        let events = d.decode_line(
            r#"{"type":"assistant","session_id":"s1","message":{"content":[{"type":"text","text":"hi"}]}}"#,
        );
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::AssistantText { text }] if text == "hi"
        ));
    }

    #[test]
    fn test_mixed_blocks_decode_in_order() {
        let mut d = StreamDecoder::default();
        let events = d.decode_line(
            r#"{"type":"assistant","session_id":"s","message":{"content":[
                {"type":"thinking","thinking":"hmm"},
                {"type":"tool_use","name":"Bash","input":{"command":"ls"}},
                {"type":"text","text":"done"}
            ]}}"#,
        );
        assert_eq!(events.len(), 4); // init + three blocks
        assert!(matches!(events[1], AgentEvent::AssistantThinking { .. }));
        assert!(matches!(events[2], AgentEvent::ToolUse { .. }));
        assert!(matches!(events[3], AgentEvent::AssistantText { .. }));
    }

    #[test]
    fn test_result_captures_usage_and_text() {
        let mut d = StreamDecoder::default();
        let events = d.decode_line(
            r#"{"type":"result","session_id":"s","result":"final","is_error":false,
                "duration_ms":1234,"usage":{"input_tokens":10,"output_tokens":20}}"#,
        );
        let result = events
            .iter()
            .find(|e| matches!(e, AgentEvent::Result { .. }))
            .unwrap();
        if let AgentEvent::Result {
            usage,
            duration_ms,
            text,
            is_error,
        } = result
        {
            assert_eq!(usage.as_ref().unwrap().input_tokens, 10);
            assert_eq!(usage.as_ref().unwrap().output_tokens, 20);
            assert_eq!(*duration_ms, Some(1234));
            assert_eq!(text.as_deref(), Some("final"));
            assert!(!is_error);
        }
        assert_eq!(d.final_text.as_deref(), Some("final"));
    }

    #[test]
    fn test_unknown_type_preserved_not_fatal() {
        let mut d = StreamDecoder::default();
        let events = d.decode_line(r#"{"type":"totally_new_event","payload":1}"#);
        assert!(matches!(events.as_slice(), [AgentEvent::Unknown { raw }]
            if raw["type"] == "totally_new_event"));
    }

    #[test]
    fn test_malformed_line_recovered() {
        let mut d = StreamDecoder::default();
        let events = d.decode_line("not json at all {");
        assert!(matches!(events.as_slice(), [AgentEvent::Unknown { raw }]
            if raw["type"] == "unparsed_line"));
    }
}
