//! Best-effort provider quota lookup for `/stats`.
//!
//! Reads the agent's OAuth credentials from the standard credential file (or
//! the macOS keychain) and queries the usage endpoint for the rolling
//! utilization windows. Missing credentials or API failures simply yield
//! `None`; the stats command renders token counters either way.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const API_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageWindow {
    pub utilization: f64,
    pub resets_at: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub five_hour: Option<UsageWindow>,
    pub seven_day: Option<UsageWindow>,
}

struct CacheEntry {
    data: ProviderUsage,
    at: Instant,
}

/// Quota client with a short in-memory cache keyed by a token hash.
#[derive(Clone)]
pub struct QuotaService {
    http: reqwest::Client,
    cache: Arc<tokio::sync::Mutex<HashMap<String, CacheEntry>>>,
}

impl Default for QuotaService {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaService {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .user_agent("relaybot/0.3")
            .build()
            .expect("reqwest client build");
        Self {
            http,
            cache: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub async fn fetch(&self) -> Option<ProviderUsage> {
        let token = access_token().await?;
        let key = hash_token(&token);

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.at.elapsed() < CACHE_TTL {
                    return Some(entry.data.clone());
                }
            }
        }

        let resp = self
            .http
            .get("https://api.anthropic.com/api/oauth/usage")
            .bearer_auth(&token)
            .header("Accept", "application/json")
            .header("anthropic-beta", "oauth-2025-04-20")
            .send()
            .await
            .ok()?;

        if !resp.status().is_success() {
            return None;
        }

        let v: serde_json::Value = resp.json().await.ok()?;
        let usage = ProviderUsage {
            five_hour: parse_window(v.get("five_hour")),
            seven_day: parse_window(v.get("seven_day")),
        };

        self.cache.lock().await.insert(
            key,
            CacheEntry {
                data: usage.clone(),
                at: Instant::now(),
            },
        );
        Some(usage)
    }
}

fn parse_window(v: Option<&serde_json::Value>) -> Option<UsageWindow> {
    let v = v?;
    if v.is_null() {
        return None;
    }
    Some(UsageWindow {
        utilization: v.get("utilization").and_then(|x| x.as_f64()).unwrap_or(0.0),
        resets_at: v
            .get("resets_at")
            .and_then(|x| x.as_str())
            .map(String::from),
    })
}

fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    let digest = h.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

async fn access_token() -> Option<String> {
    #[cfg(target_os = "macos")]
    if let Some(raw) = keychain_password("Claude Code-credentials").await {
        if let Some(token) = token_from_credentials(&raw) {
            return Some(token);
        }
    }

    let path = dirs::home_dir()?.join(".claude").join(".credentials.json");
    let raw = read_file(path).await?;
    token_from_credentials(&raw)
}

fn token_from_credentials(raw: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(raw).ok()?;
    v.get("claudeAiOauth")
        .and_then(|x| x.get("accessToken"))
        .and_then(|x| x.as_str())
        .map(String::from)
}

async fn read_file(path: PathBuf) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

#[cfg(target_os = "macos")]
async fn keychain_password(service: &str) -> Option<String> {
    let out = tokio::time::timeout(
        Duration::from_secs(3),
        tokio::process::Command::new("security")
            .args(["find-generic-password", "-s", service, "-w"])
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !out.status.success() {
        return None;
    }
    String::from_utf8(out.stdout).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_hash_is_stable_prefix() {
        let a = hash_token("secret");
        let b = hash_token("secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(hash_token("other"), a);
    }

    #[test]
    fn test_credentials_parsing() {
        let raw = r#"{"claudeAiOauth":{"accessToken":"tok-123"}}"#;
        assert_eq!(token_from_credentials(raw).as_deref(), Some("tok-123"));
        assert!(token_from_credentials("{}").is_none());
        assert!(token_from_credentials("not json").is_none());
    }

    #[test]
    fn test_window_parsing() {
        let v = serde_json::json!({"utilization": 42.5, "resets_at": "2026-08-02T00:00:00Z"});
        let w = parse_window(Some(&v)).unwrap();
        assert_eq!(w.utilization, 42.5);
        assert!(w.resets_at.is_some());
        assert!(parse_window(Some(&serde_json::Value::Null)).is_none());
        assert!(parse_window(None).is_none());
    }
}
