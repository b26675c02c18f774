//! Speech-to-text fallback worker.
//!
//! Runs only for items whose subtitle acquisition ended unavailable or
//! exhausted its retries. Two externals: the fetch tool downloads the audio,
//! then the configured transcriber turns it into text.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use super::traits::{StageWorker, WorkerOutcome};
use super::{find_artifact, is_gone_message, stderr_excerpt};
use crate::database::models::{ItemRecord, Stage};
use crate::{Error, Result};

/// The transcriber contract: `{bin} <audio-file> <text-output>` writes plain
/// text and exits zero. Anything fancier goes behind a wrapper script.
pub struct TranscribeWorker {
    fetcher: String,
    transcriber: String,
    media_dir: PathBuf,
    text_dir: PathBuf,
}

impl TranscribeWorker {
    pub fn new(
        fetcher: impl Into<String>,
        transcriber: impl Into<String>,
        media_dir: impl Into<PathBuf>,
        text_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher: fetcher.into(),
            transcriber: transcriber.into(),
            media_dir: media_dir.into(),
            text_dir: text_dir.into(),
        }
    }

    async fn ensure_audio(&self, item: &ItemRecord) -> Result<Option<PathBuf>> {
        if let Some(existing) = find_artifact(&self.media_dir, &item.item_id, None).await? {
            debug!(item = %item.item_id, "Audio already on disk");
            return Ok(Some(existing));
        }

        let template = self
            .media_dir
            .join("%(id)s.%(ext)s")
            .to_string_lossy()
            .into_owned();

        let output = Command::new(&self.fetcher)
            .args(["-f", "bestaudio/best", "-o"])
            .arg(template)
            .arg(&item.source_url)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::tool(&self.fetcher, "binary not found on PATH")
                }
                _ => Error::transient(format!("failed to spawn {}: {err}", self.fetcher)),
            })?;

        if !output.status.success() {
            let excerpt = stderr_excerpt(&output.stderr);
            if is_gone_message(&excerpt) {
                return Ok(None);
            }
            return Err(Error::transient(format!(
                "{} exited with {}: {excerpt}",
                self.fetcher,
                output.status.code().unwrap_or(-1)
            )));
        }

        match find_artifact(&self.media_dir, &item.item_id, None).await? {
            Some(path) => Ok(Some(path)),
            None => Err(Error::transient(
                "audio download reported success but produced no file",
            )),
        }
    }

    async fn run_transcriber(&self, audio: &Path, text_out: &Path) -> Result<()> {
        let output = Command::new(&self.transcriber)
            .arg(audio)
            .arg(text_out)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::tool(&self.transcriber, "binary not found on PATH")
                }
                _ => Error::transient(format!("failed to spawn {}: {err}", self.transcriber)),
            })?;

        if !output.status.success() {
            return Err(Error::transient(format!(
                "{} exited with {}: {}",
                self.transcriber,
                output.status.code().unwrap_or(-1),
                stderr_excerpt(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StageWorker for TranscribeWorker {
    fn stage(&self) -> Stage {
        Stage::Transcription
    }

    fn name(&self) -> &'static str {
        "TranscribeWorker"
    }

    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome> {
        let Some(audio) = self.ensure_audio(item).await? else {
            return Ok(WorkerOutcome::unavailable("source media is gone"));
        };

        let text_path = self.text_dir.join(format!("{}.txt", item.item_id));
        self.run_transcriber(&audio, &text_path).await?;

        let produced = tokio::fs::read_to_string(&text_path).await.map_err(|err| {
            Error::transient(format!(
                "transcriber exited cleanly but output is unreadable: {err}"
            ))
        })?;
        if produced.trim().is_empty() {
            return Ok(WorkerOutcome::unavailable("transcriber produced no text"));
        }

        info!(
            item = %item.item_id,
            path = %text_path.display(),
            chars = produced.len(),
            "Transcribed audio"
        );
        Ok(WorkerOutcome::completed(text_path.to_string_lossy()))
    }
}
