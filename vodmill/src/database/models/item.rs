//! Item database model and the per-stage status machine.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Per-item pipeline stages, in execution order.
///
/// Discovery is not here: it produces items rather than processing them, so
/// it carries no per-item status columns.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquisition,
    Conversion,
    Transcription,
    Summarization,
    Export,
}

impl Stage {
    /// All stages, in the order the orchestrator runs them.
    pub const ALL: [Stage; 5] = [
        Stage::Acquisition,
        Stage::Conversion,
        Stage::Transcription,
        Stage::Summarization,
        Stage::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquisition => "acquisition",
            Self::Conversion => "conversion",
            Self::Transcription => "transcription",
            Self::Summarization => "summarization",
            Self::Export => "export",
        }
    }

    pub fn status_column(&self) -> &'static str {
        match self {
            Self::Acquisition => "acquisition_status",
            Self::Conversion => "conversion_status",
            Self::Transcription => "transcription_status",
            Self::Summarization => "summarization_status",
            Self::Export => "export_status",
        }
    }

    pub fn attempts_column(&self) -> &'static str {
        match self {
            Self::Acquisition => "acquisition_attempts",
            Self::Conversion => "conversion_attempts",
            Self::Transcription => "transcription_attempts",
            Self::Summarization => "summarization_attempts",
            Self::Export => "export_attempts",
        }
    }

    pub fn result_column(&self) -> &'static str {
        match self {
            Self::Acquisition => "acquisition_result",
            Self::Conversion => "conversion_result",
            Self::Transcription => "transcription_result",
            Self::Summarization => "summarization_result",
            Self::Export => "export_result",
        }
    }

    pub fn error_column(&self) -> &'static str {
        match self {
            Self::Acquisition => "acquisition_error",
            Self::Conversion => "conversion_error",
            Self::Transcription => "transcription_error",
            Self::Summarization => "summarization_error",
            Self::Export => "export_error",
        }
    }

    /// SQL fragment gating this stage on the outcome of earlier stages.
    ///
    /// Transcription is deliberately the fallback path: it only runs for
    /// items whose subtitle acquisition came up empty-handed.
    pub fn gate_sql(&self) -> Option<&'static str> {
        match self {
            Self::Acquisition => None,
            Self::Conversion => Some("acquisition_status = 'COMPLETED'"),
            Self::Transcription => Some("acquisition_status IN ('UNAVAILABLE', 'FAILED')"),
            Self::Summarization => {
                Some("(conversion_status = 'COMPLETED' OR transcription_status = 'COMPLETED')")
            }
            Self::Export => Some("summarization_status = 'COMPLETED'"),
        }
    }
}

/// Per-stage status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// Never successfully processed for this stage.
    Pending,
    /// Claimed by a live worker in the current run.
    InProgress,
    /// Terminal success; never re-processed.
    Completed,
    /// Retryable failure; the stage attempt counter was incremented.
    Failed,
    /// Terminal: the item's content cannot satisfy this stage.
    Unavailable,
    /// Terminal for this stage; deliberately not processed.
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Unavailable => "UNAVAILABLE",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "UNAVAILABLE" => Some(Self::Unavailable),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Absorbing statuses: once here, the stage never runs again for the item
    /// (short of an operator reset).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Unavailable | Self::Skipped)
    }

    /// Statuses a stage run may pick up, attempt budget permitting.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

/// One catalog/partition row. Columns mirror migrations/0001_init.sql.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: i64,
    pub item_id: String,
    pub source_url: String,
    pub collection_id: Option<String>,
    pub title: Option<String>,
    pub published_at: Option<String>,
    /// ISO 8601 timestamp of first insertion
    pub added_at: String,
    /// ISO 8601 timestamp of the last mutation
    pub updated_at: String,

    pub acquisition_status: String,
    pub acquisition_attempts: i64,
    pub acquisition_result: Option<String>,
    pub acquisition_error: Option<String>,

    pub conversion_status: String,
    pub conversion_attempts: i64,
    pub conversion_result: Option<String>,
    pub conversion_error: Option<String>,

    pub transcription_status: String,
    pub transcription_attempts: i64,
    pub transcription_result: Option<String>,
    pub transcription_error: Option<String>,

    pub summarization_status: String,
    pub summarization_attempts: i64,
    pub summarization_result: Option<String>,
    pub summarization_error: Option<String>,

    pub export_status: String,
    pub export_attempts: i64,
    pub export_result: Option<String>,
    pub export_error: Option<String>,
}

impl ItemRecord {
    pub fn raw_status(&self, stage: Stage) -> &str {
        match stage {
            Stage::Acquisition => &self.acquisition_status,
            Stage::Conversion => &self.conversion_status,
            Stage::Transcription => &self.transcription_status,
            Stage::Summarization => &self.summarization_status,
            Stage::Export => &self.export_status,
        }
    }

    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        StageStatus::parse(self.raw_status(stage))
    }

    pub fn attempts(&self, stage: Stage) -> i64 {
        match stage {
            Stage::Acquisition => self.acquisition_attempts,
            Stage::Conversion => self.conversion_attempts,
            Stage::Transcription => self.transcription_attempts,
            Stage::Summarization => self.summarization_attempts,
            Stage::Export => self.export_attempts,
        }
    }

    pub fn result(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Acquisition => self.acquisition_result.as_deref(),
            Stage::Conversion => self.conversion_result.as_deref(),
            Stage::Transcription => self.transcription_result.as_deref(),
            Stage::Summarization => self.summarization_result.as_deref(),
            Stage::Export => self.export_result.as_deref(),
        }
    }

    pub fn error(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Acquisition => self.acquisition_error.as_deref(),
            Stage::Conversion => self.conversion_error.as_deref(),
            Stage::Transcription => self.transcription_error.as_deref(),
            Stage::Summarization => self.summarization_error.as_deref(),
            Stage::Export => self.export_error.as_deref(),
        }
    }

    /// The plain-text artifact for summarization: conversion output when the
    /// subtitle path succeeded, transcription output on the fallback path.
    pub fn text_artifact(&self) -> Option<&str> {
        if self.status(Stage::Conversion) == Some(StageStatus::Completed) {
            self.conversion_result.as_deref()
        } else if self.status(Stage::Transcription) == Some(StageStatus::Completed) {
            self.transcription_result.as_deref()
        } else {
            None
        }
    }
}

/// Metadata for inserting or refreshing a catalog item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewItem {
    pub item_id: String,
    pub source_url: String,
    pub collection_id: Option<String>,
    pub title: Option<String>,
    pub published_at: Option<String>,
}

impl NewItem {
    pub fn new(item_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            source_url: source_url.into(),
            collection_id: None,
            title: None,
            published_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_collection(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = Some(collection_id.into());
        self
    }

    pub fn with_published_at(mut self, published_at: impl Into<String>) -> Self {
        self.published_at = Some(published_at.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_terminal() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Unavailable.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::InProgress.is_terminal());
        assert!(!StageStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_runnable() {
        assert!(StageStatus::Pending.is_runnable());
        assert!(StageStatus::Failed.is_runnable());
        assert!(!StageStatus::InProgress.is_runnable());
        assert!(!StageStatus::Completed.is_runnable());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            StageStatus::Pending,
            StageStatus::InProgress,
            StageStatus::Completed,
            StageStatus::Failed,
            StageStatus::Unavailable,
            StageStatus::Skipped,
        ] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StageStatus::parse("fetched"), None);
    }

    #[test]
    fn test_stage_columns() {
        assert_eq!(Stage::Acquisition.status_column(), "acquisition_status");
        assert_eq!(Stage::Export.attempts_column(), "export_attempts");
        assert_eq!(Stage::Summarization.result_column(), "summarization_result");
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!(Stage::from_str("conversion").ok(), Some(Stage::Conversion));
        assert!(Stage::from_str("discovery").is_err());
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::ALL[0], Stage::Acquisition);
        assert_eq!(Stage::ALL[4], Stage::Export);
    }

    #[test]
    fn test_gates() {
        assert!(Stage::Acquisition.gate_sql().is_none());
        assert!(
            Stage::Transcription
                .gate_sql()
                .unwrap()
                .contains("UNAVAILABLE")
        );
    }
}
