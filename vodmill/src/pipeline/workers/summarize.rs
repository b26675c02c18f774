//! Summarization worker.
//!
//! Sends each item's text artifact to an OpenAI-compatible chat-completion
//! endpoint and stores the returned summary inline as the stage result.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info};

use super::traits::{StageWorker, WorkerOutcome};
use crate::database::models::{ItemRecord, Stage};
use crate::{Error, Result};

/// Truncation guard for very long transcripts; roughly fits common context
/// windows with room for the prompt and completion.
const MAX_INPUT_CHARS: usize = 120_000;

pub struct SummarizeWorker {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    prompt: String,
}

impl SummarizeWorker {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        prompt: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            prompt: prompt.into(),
        })
    }

    async fn request_summary(&self, text: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": format!("{}\n\n{}", self.prompt, text) }
            ],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| Error::transient(format!("summarization request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let excerpt: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(300)
                .collect();
            return Err(classify_http_failure(status, &excerpt));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|err| Error::transient(format!("unreadable summarization response: {err}")))?;
        extract_summary(&payload)
            .ok_or_else(|| Error::transient("summarization response had no message content"))
    }
}

/// Auth rejections are operator trouble and abort the stage; rate limits and
/// server-side errors are retryable.
fn classify_http_failure(status: StatusCode, excerpt: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::config(format!(
            "summarization endpoint rejected credentials ({status}): {excerpt}"
        )),
        _ => Error::transient(format!("summarization endpoint returned {status}: {excerpt}")),
    }
}

fn extract_summary(payload: &serde_json::Value) -> Option<String> {
    let content = payload
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()?
        .trim();
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

#[async_trait]
impl StageWorker for SummarizeWorker {
    fn stage(&self) -> Stage {
        Stage::Summarization
    }

    fn name(&self) -> &'static str {
        "SummarizeWorker"
    }

    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome> {
        let Some(text_path) = item.text_artifact() else {
            return Ok(WorkerOutcome::skipped("no text artifact to summarize"));
        };

        let mut text = match tokio::fs::read_to_string(text_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::transient(format!(
                    "text artifact missing on disk: {text_path}"
                )));
            }
            Err(err) => return Err(err.into()),
        };

        if text.trim().is_empty() {
            return Ok(WorkerOutcome::skipped("text artifact is empty"));
        }
        if text.chars().count() > MAX_INPUT_CHARS {
            debug!(item = %item.item_id, "Truncating oversized transcript");
            text = text.chars().take(MAX_INPUT_CHARS).collect();
        }

        let summary = self.request_summary(&text).await?;
        info!(item = %item.item_id, chars = summary.len(), "Summarized");
        Ok(WorkerOutcome::completed(summary))
    }
}
