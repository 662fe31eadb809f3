//! Button-question channel shared with the auxiliary tool server.
//!
//! The ask-user MCP server (a separate process spawned by the agent) writes
//! request files under `/tmp`; the bridge polls for a pending request matching
//! the current chat, renders an inline keyboard, and flips the file to "sent".
//! The file protocol is a contract with that server; the port exists so tests
//! substitute an in-memory implementation.

use crate::{ChatId, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A pending question from the auxiliary server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ButtonRequest {
    pub request_id: String,
    pub chat_id: ChatId,
    pub question: String,
    pub options: Vec<String>,
}

/// Port over the request-file handoff.
#[async_trait]
pub trait ButtonChannel: Send + Sync {
    /// Next pending request for this chat, if any.
    async fn poll(&self, chat_id: ChatId) -> Result<Option<ButtonRequest>>;

    /// Mark a request as surfaced to the user.
    async fn mark_sent(&self, request_id: &str) -> Result<()>;

    /// Look up a request by id (for callback validation).
    async fn get(&self, request_id: &str) -> Result<Option<ButtonRequest>>;

    /// Consume a request after the user answered.
    async fn remove(&self, request_id: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestFile {
    request_id: String,
    question: String,
    options: Vec<String>,
    status: String,
    // The server writes the chat id as a string; tolerate numbers too.
    chat_id: serde_json::Value,
}

/// File-backed implementation over `<dir>/ask-user-<id>.json`.
#[derive(Clone, Debug)]
pub struct FileButtonChannel {
    dir: PathBuf,
}

impl Default for FileButtonChannel {
    fn default() -> Self {
        Self::new("/tmp")
    }
}

impl FileButtonChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("ask-user-{request_id}.json"))
    }

    fn read_file(path: &Path) -> Option<RequestFile> {
        let txt = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&txt).ok()
    }

    fn parse_chat_id(v: &serde_json::Value) -> Option<i64> {
        v.as_i64().or_else(|| v.as_str()?.parse().ok())
    }

    fn to_request(file: RequestFile) -> Option<ButtonRequest> {
        let chat = Self::parse_chat_id(&file.chat_id)?;
        if file.request_id.is_empty() || file.options.is_empty() {
            return None;
        }
        Some(ButtonRequest {
            request_id: file.request_id,
            chat_id: ChatId(chat),
            question: file.question,
            options: file.options,
        })
    }
}

#[async_trait]
impl ButtonChannel for FileButtonChannel {
    async fn poll(&self, chat_id: ChatId) -> Result<Option<ButtonRequest>> {
        let Ok(rd) = std::fs::read_dir(&self.dir) else {
            return Ok(None);
        };

        for ent in rd.flatten() {
            let name = ent.file_name().to_string_lossy().to_string();
            if !name.starts_with("ask-user-") || !name.ends_with(".json") {
                continue;
            }
            let Some(file) = Self::read_file(&ent.path()) else {
                continue;
            };
            if file.status != "pending" {
                continue;
            }
            let Some(req) = Self::to_request(file) else {
                continue;
            };
            if req.chat_id == chat_id {
                return Ok(Some(req));
            }
        }
        Ok(None)
    }

    async fn mark_sent(&self, request_id: &str) -> Result<()> {
        let path = self.path_for(request_id);
        let txt = std::fs::read_to_string(&path)?;
        let mut v: serde_json::Value = serde_json::from_str(&txt)?;
        v["status"] = serde_json::Value::String("sent".to_string());
        std::fs::write(&path, serde_json::to_string(&v)?)?;
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<ButtonRequest>> {
        Ok(Self::read_file(&self.path_for(request_id)).and_then(Self::to_request))
    }

    async fn remove(&self, request_id: &str) -> Result<()> {
        let _ = std::fs::remove_file(self.path_for(request_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let dir = PathBuf::from(format!("/tmp/{prefix}-{}-{ts}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_request(dir: &Path, id: &str, chat_id: i64, status: &str) {
        let payload = serde_json::json!({
            "request_id": id,
            "question": "Pick one",
            "options": ["a", "b"],
            "status": status,
            "chat_id": chat_id.to_string(),
        });
        std::fs::write(
            dir.join(format!("ask-user-{id}.json")),
            serde_json::to_string(&payload).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_poll_matches_chat_and_status() {
        let dir = tmp_dir("buttons");
        let ch = FileButtonChannel::new(&dir);

        write_request(&dir, "r1", 1, "pending");
        write_request(&dir, "r2", 2, "pending");
        write_request(&dir, "r3", 1, "sent");

        let req = ch.poll(ChatId(1)).await.unwrap().unwrap();
        assert_eq!(req.request_id, "r1");
        assert_eq!(req.options, vec!["a", "b"]);

        assert!(ch.poll(ChatId(3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_sent_and_lifecycle() {
        let dir = tmp_dir("buttons-sent");
        let ch = FileButtonChannel::new(&dir);
        write_request(&dir, "r1", 5, "pending");

        ch.mark_sent("r1").await.unwrap();
        assert!(ch.poll(ChatId(5)).await.unwrap().is_none());

        // Still retrievable by id for callback validation, then consumable.
        let req = ch.get("r1").await.unwrap().unwrap();
        assert_eq!(req.chat_id, ChatId(5));
        ch.remove("r1").await.unwrap();
        assert!(ch.get("r1").await.unwrap().is_none());
    }
}
