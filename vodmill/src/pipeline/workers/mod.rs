//! Stage worker implementations.
//!
//! One worker per stage, all built from [`crate::config::PipelineConfig`].
//! External tools are invoked generically; nothing here knows about any
//! particular platform's API.

pub mod convert;
pub mod export;
pub mod fetch;
pub mod summarize;
pub mod traits;
pub mod transcribe;

pub use convert::SubtitleConvertWorker;
pub use export::ExportWorker;
pub use fetch::SubtitleFetchWorker;
pub use summarize::SummarizeWorker;
pub use traits::{StageWorker, WorkerOutcome};
pub use transcribe::TranscribeWorker;

/// Last non-empty stderr line, truncated for status columns and logs.
pub(crate) fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    let mut excerpt: String = line.chars().take(300).collect();
    if excerpt.is_empty() {
        excerpt = "no error output".to_string();
    }
    excerpt
}

/// Tool output phrasings that mean the source content is gone for good
/// rather than temporarily unreachable.
pub(crate) fn is_gone_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "video unavailable",
        "content isn't available",
        "no longer available",
        "private video",
        "has been removed",
        "account associated with this video has been terminated",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

/// First file in `dir` named `{stem}.<anything>`, lexically smallest for
/// determinism when several languages/extensions match.
pub(crate) async fn find_artifact(
    dir: &std::path::Path,
    stem: &str,
    extension: Option<&str>,
) -> crate::Result<Option<std::path::PathBuf>> {
    let prefix = format!("{stem}.");
    let mut matches: Vec<std::path::PathBuf> = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) {
            continue;
        }
        if let Some(ext) = extension
            && !name.ends_with(ext)
        {
            continue;
        }
        matches.push(entry.path());
    }
    matches.sort();
    Ok(matches.into_iter().next())
}
