//! Voice transcription port and its OpenAI adapter.
//!
//! Voice notes arrive as OGG files; the adapter posts them to the
//! `audio/transcriptions` endpoint as multipart form data. The port exists so
//! tests (and future local backends) can substitute an implementation.

use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

#[async_trait]
pub trait TranscriptionPort: Send + Sync {
    async fn transcribe(&self, path: &Path, prompt: Option<&str>) -> Result<String>;
}

/// OpenAI `audio/transcriptions` client.
#[derive(Clone, Debug)]
pub struct OpenAiTranscriber {
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn new(api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client build");
        Self {
            api_key: api_key.into(),
            http,
        }
    }
}

#[async_trait]
impl TranscriptionPort for OpenAiTranscriber {
    async fn transcribe(&self, path: &Path, prompt: Option<&str>) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("audio.ogg")
            .to_string();

        let mut form = reqwest::multipart::Form::new()
            .text("model", "gpt-4o-transcribe")
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("audio/ogg")
                    .map_err(|e| Error::Transcription(format!("multipart: {e}")))?,
            );

        if let Some(p) = prompt.filter(|p| !p.trim().is_empty()) {
            form = form.text("prompt", p.to_string());
        }

        let resp = self
            .http
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transcription(format!("request: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Transcription(format!(
                "{status}: {}",
                crate::audit::truncate(&body, 200)
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Transcription(format!("decode: {e}")))?;

        let text = v
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();

        if text.trim().is_empty() {
            return Err(Error::Transcription("empty transcript".into()));
        }
        Ok(text)
    }
}
