//! Subtitle acquisition worker.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use super::traits::{StageWorker, WorkerOutcome};
use super::{find_artifact, is_gone_message, stderr_excerpt};
use crate::database::models::{ItemRecord, Stage};
use crate::{Error, Result};

/// Fetches an item's subtitle track via a yt-dlp-compatible tool and
/// converts it to SRT on disk.
pub struct SubtitleFetchWorker {
    fetcher: String,
    subtitle_dir: PathBuf,
    langs: Vec<String>,
}

impl SubtitleFetchWorker {
    pub fn new(fetcher: impl Into<String>, subtitle_dir: impl Into<PathBuf>, langs: Vec<String>) -> Self {
        Self {
            fetcher: fetcher.into(),
            subtitle_dir: subtitle_dir.into(),
            langs,
        }
    }

    fn output_template(&self) -> String {
        self.subtitle_dir
            .join("%(id)s.%(ext)s")
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl StageWorker for SubtitleFetchWorker {
    fn stage(&self) -> Stage {
        Stage::Acquisition
    }

    fn name(&self) -> &'static str {
        "SubtitleFetchWorker"
    }

    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome> {
        // A previous interrupted run may have left the artifact behind.
        if let Some(existing) = find_artifact(&self.subtitle_dir, &item.item_id, Some(".srt")).await?
        {
            debug!(item = %item.item_id, "Subtitle artifact already on disk");
            return Ok(WorkerOutcome::completed(existing.to_string_lossy()));
        }

        let output = Command::new(&self.fetcher)
            .args([
                "--skip-download",
                "--write-subs",
                "--write-auto-subs",
                "--convert-subs",
                "srt",
                "--sub-langs",
            ])
            .arg(self.langs.join(","))
            .arg("-o")
            .arg(self.output_template())
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
                return Ok(WorkerOutcome::unavailable(excerpt));
            }
            return Err(Error::transient(format!(
                "{} exited with {}: {excerpt}",
                self.fetcher,
                output.status.code().unwrap_or(-1)
            )));
        }

        match find_artifact(&self.subtitle_dir, &item.item_id, Some(".srt")).await? {
            Some(path) => {
                info!(item = %item.item_id, path = %path.display(), "Fetched subtitles");
                Ok(WorkerOutcome::completed(path.to_string_lossy()))
            }
            // The tool succeeding without writing anything means the source
            // simply has no subtitle track.
            None => Ok(WorkerOutcome::unavailable("no subtitles published")),
        }
    }
}
