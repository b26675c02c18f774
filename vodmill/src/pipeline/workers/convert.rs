//! Subtitle-to-text conversion worker.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use super::traits::{StageWorker, WorkerOutcome};
use crate::database::models::{ItemRecord, Stage};
use crate::{Error, Result};

/// Turns an acquired SRT/VTT artifact into a plain-text file.
pub struct SubtitleConvertWorker {
    text_dir: PathBuf,
}

impl SubtitleConvertWorker {
    pub fn new(text_dir: impl Into<PathBuf>) -> Self {
        Self {
            text_dir: text_dir.into(),
        }
    }
}

#[async_trait]
impl StageWorker for SubtitleConvertWorker {
    fn stage(&self) -> Stage {
        Stage::Conversion
    }

    fn name(&self) -> &'static str {
        "SubtitleConvertWorker"
    }

    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome> {
        let source = item.result(Stage::Acquisition).ok_or_else(|| {
            Error::transient("acquisition completed but recorded no artifact path")
        })?;

        let raw = match tokio::fs::read_to_string(source).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::transient(format!(
                    "subtitle file missing on disk: {source}"
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let text = strip_subtitle_markup(&raw);
        if text.trim().is_empty() {
            return Ok(WorkerOutcome::unavailable(
                "subtitle file contained no text",
            ));
        }

        let out_path = self.text_dir.join(format!("{}.txt", item.item_id));
        tokio::fs::write(&out_path, &text).await?;

        debug!(item = %item.item_id, chars = text.len(), "Converted subtitles to text");
        info!(item = %item.item_id, path = %out_path.display(), "Wrote plain text");
        Ok(WorkerOutcome::completed(out_path.to_string_lossy()))
    }
}

/// Strip SRT/VTT structure down to caption text.
///
/// Drops cue sequence numbers, timestamp lines, WEBVTT headers and NOTE/STYLE
/// blocks, and inline tags. Consecutive duplicate lines collapse to one;
/// auto-generated subtitles repeat nearly every caption while scrolling.
pub fn strip_subtitle_markup(raw: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_note_block = false;

    for line in raw.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            in_note_block = false;
            continue;
        }
        if in_note_block {
            continue;
        }
        if trimmed.starts_with("WEBVTT") {
            continue;
        }
        if trimmed.starts_with("NOTE") || trimmed.starts_with("STYLE") || trimmed.starts_with("REGION") {
            in_note_block = true;
            continue;
        }
        // Cue sequence number
        if trimmed.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        // Timestamp line
        if trimmed.contains("-->") {
            continue;
        }

        let cleaned = strip_inline_tags(trimmed);
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            continue;
        }
        if out.last().map(String::as_str) == Some(cleaned) {
            continue;
        }
        out.push(cleaned.to_string());
    }

    out.join("\n")
}

/// Remove `<i>`-style tags and VTT voice/timing spans without touching bare
/// `<` or `>` in caption text.
fn strip_inline_tags(line: &str) -> String {
    let mut result = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '<' {
            let mut tag = String::new();
            let mut closed = false;
            for t in chars.by_ref() {
                if t == '>' {
                    closed = true;
                    break;
                }
                tag.push(t);
            }
            if !closed {
                // Unterminated: keep the literal text.
                result.push('<');
                result.push_str(&tag);
            }
        } else {
            result.push(c);
        }
    }
    result
}
