//! Export worker: builds the per-item tabular record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

use super::traits::{StageWorker, WorkerOutcome};
use super::stderr_excerpt;
use crate::database::models::{ItemRecord, Stage};
use crate::{Error, Result};

/// One row of the final export table, stored as JSON in the stage result and
/// assembled into a CSV after the stage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub item_id: String,
    pub title: Option<String>,
    pub source_url: String,
    pub published_at: Option<String>,
    pub text_path: Option<String>,
    pub transcript_link: Option<String>,
    pub summary: String,
}

pub struct ExportWorker {
    uploader: String,
    remote_target: Option<String>,
}

impl ExportWorker {
    pub fn new(uploader: impl Into<String>, remote_target: Option<String>) -> Self {
        Self {
            uploader: uploader.into(),
            remote_target,
        }
    }

    /// Copy the text artifact to the remote target and derive its link.
    ///
    /// Upload trouble never fails the record; the row simply carries no
    /// link, matching how operators actually consume partial exports.
    async fn upload_artifact(&self, item_id: &str, text_path: &str) -> Option<String> {
        let target = self.remote_target.as_deref()?;
        if !Path::new(text_path).exists() {
            warn!(item = %item_id, path = %text_path, "Text artifact missing, skipping upload");
            return None;
        }

        let result = Command::new(&self.uploader)
            .args(["--log-level", "ERROR", "copy"])
            .arg(text_path)
            .arg(target)
            .kill_on_drop(true)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                let file_name = Path::new(text_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let link = format!("{}/{}", target.trim_end_matches('/'), file_name);
                debug!(item = %item_id, link = %link, "Uploaded text artifact");
                Some(link)
            }
            Ok(output) => {
                warn!(
                    item = %item_id,
                    "Upload failed ({}): {}",
                    output.status.code().unwrap_or(-1),
                    stderr_excerpt(&output.stderr)
                );
                None
            }
            Err(err) => {
                warn!(item = %item_id, "Could not run {}: {err}", self.uploader);
                None
            }
        }
    }
}

#[async_trait]
impl StageWorker for ExportWorker {
    fn stage(&self) -> Stage {
        Stage::Export
    }

    fn name(&self) -> &'static str {
        "ExportWorker"
    }

    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome> {
        let summary = item
            .result(Stage::Summarization)
            .ok_or_else(|| {
                Error::transient("summarization completed but recorded no payload")
            })?
            .to_string();

        let text_path = item.text_artifact().map(str::to_string);
        let transcript_link = match &text_path {
            Some(path) => self.upload_artifact(&item.item_id, path).await,
            None => None,
        };

        let record = ExportRecord {
            item_id: item.item_id.clone(),
            title: item.title.clone(),
            source_url: item.source_url.clone(),
            published_at: item.published_at.clone(),
            text_path,
            transcript_link,
            summary,
        };

        Ok(WorkerOutcome::completed(serde_json::to_string(&record)?))
    }
}
