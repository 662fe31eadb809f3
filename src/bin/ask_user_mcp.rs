//! Auxiliary button-question MCP server.
//!
//! Speaks JSON-RPC over stdio and exposes a single `ask_user` tool. A call
//! writes `/tmp/ask-user-<id>.json` with status "pending"; the bridge polls
//! for those files, renders inline buttons and flips the status. The chat to
//! target comes from the `TELEGRAM_CHAT_ID` env var the bridge injects into
//! this server's MCP config.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};

static COUNTER: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<serde_json::Value>,
    method: String,
    params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

fn ok(id: serde_json::Value, result: serde_json::Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

fn err(id: serde_json::Value, code: i64, message: &str) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(json!({ "code": code, "message": message })),
    }
}

/// Dependency-free 8-char hex id.
fn next_request_id() -> String {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let n = COUNTER.fetch_add(1, Ordering::SeqCst) as u128;
    let pid = std::process::id() as u128;
    let x = ts ^ (n << 17) ^ (pid << 5);
    format!("{x:016x}").chars().take(8).collect()
}

#[derive(Debug, Serialize)]
struct RequestFile {
    request_id: String,
    question: String,
    options: Vec<String>,
    status: String,
    chat_id: String,
    created_at: String,
}

fn write_request_file(
    chat_id: &str,
    question: &str,
    options: Vec<String>,
) -> std::io::Result<String> {
    let request_id = next_request_id();
    let path = PathBuf::from(format!("/tmp/ask-user-{request_id}.json"));

    let data = RequestFile {
        request_id: request_id.clone(),
        question: question.to_string(),
        options,
        status: "pending".to_string(),
        chat_id: chat_id.to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };

    std::fs::write(&path, serde_json::to_string_pretty(&data)?)?;
    Ok(request_id)
}

fn handle_rpc(req: RpcRequest) -> Option<RpcResponse> {
    // Notifications carry no id and get no response.
    let id = req.id?;

    match req.method.as_str() {
        "initialize" => {
            let proto = req
                .params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");

            Some(ok(
                id,
                json!({
                    "protocolVersion": proto,
                    "serverInfo": { "name": "ask-user", "version": "1.0.0" },
                    "capabilities": { "tools": {} }
                }),
            ))
        }

        "tools/list" => Some(ok(
            id,
            json!({
                "tools": [{
                    "name": "ask_user",
                    "description": "Present options to the user as tappable inline buttons. \
IMPORTANT: after calling this tool, STOP and wait. Do NOT add any text after the call; \
the user's tap becomes their next message.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "question": { "type": "string", "description": "The question to ask" },
                            "options": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "Choices to offer (2-6 recommended)",
                                "minItems": 2,
                                "maxItems": 10
                            }
                        },
                        "required": ["question", "options"]
                    }
                }]
            }),
        )),

        "tools/call" => {
            let Some(params) = req.params.as_ref() else {
                return Some(err(id, -32602, "Missing params"));
            };
            if params.get("name").and_then(|v| v.as_str()) != Some("ask_user") {
                return Some(err(id, -32602, "Unknown tool"));
            }

            let args = params.get("arguments").cloned().unwrap_or(serde_json::Value::Null);
            let question = args
                .get("question")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let options: Vec<String> = args
                .get("options")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|x| x.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();

            if question.trim().is_empty() || options.len() < 2 {
                return Some(err(id, -32602, "question and at least 2 options required"));
            }

            let chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
            if chat_id.trim().is_empty() {
                return Some(err(id, -32602, "TELEGRAM_CHAT_ID env var is required"));
            }

            match write_request_file(&chat_id, &question, options) {
                Ok(_) => Some(ok(
                    id,
                    json!({
                        "content": [{
                            "type": "text",
                            "text": "[Buttons sent to user. STOP HERE - do not output any more text. Wait for the user to tap a button.]"
                        }]
                    }),
                )),
                Err(e) => Some(err(id, -32000, &format!("failed to write request file: {e}"))),
            }
        }

        _ => Some(err(id, -32601, "Method not found")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eprintln!("ask-user MCP server running on stdio");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = std::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(req) = serde_json::from_str::<RpcRequest>(&line) else {
            continue;
        };
        let Some(resp) = handle_rpc(req) else {
            continue;
        };

        let out = serde_json::to_string(&resp)?;
        stdout.write_all(out.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_8_hex_chars() {
        let id = next_request_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(next_request_id(), id);
    }

    #[test]
    fn test_tools_list_contains_ask_user() {
        let req = RpcRequest {
            jsonrpc: Some("2.0".into()),
            id: Some(json!(1)),
            method: "tools/list".into(),
            params: None,
        };
        let resp = handle_rpc(req).unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
        assert!(tools
            .iter()
            .any(|t| t["name"].as_str() == Some("ask_user")));
    }

    #[test]
    fn test_call_requires_chat_id_env() {
        std::env::remove_var("TELEGRAM_CHAT_ID");
        let req = RpcRequest {
            jsonrpc: Some("2.0".into()),
            id: Some(json!(2)),
            method: "tools/call".into(),
            params: Some(json!({
                "name": "ask_user",
                "arguments": { "question": "Q?", "options": ["a", "b"] }
            })),
        };
        let resp = handle_rpc(req).unwrap();
        assert!(resp.error.is_some());
    }

    #[test]
    fn test_request_file_schema() {
        let id = write_request_file("123", "Q?", vec!["a".into(), "b".into()]).unwrap();
        let path = format!("/tmp/ask-user-{id}.json");
        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(v["request_id"], id.as_str());
        assert_eq!(v["question"], "Q?");
        assert_eq!(v["status"], "pending");
        assert_eq!(v["chat_id"], "123");
        assert_eq!(v["options"].as_array().unwrap().len(), 2);

        let _ = std::fs::remove_file(&path);
    }
}
