//! Stage worker trait.

use async_trait::async_trait;

use crate::Result;
use crate::database::models::{ItemRecord, Stage};

/// Non-error outcomes of processing one item.
///
/// Transient trouble (network, tool exit, timeout) is an
/// `Err(Error::Transient(..))` so the runner records a retryable failure.
/// Outcomes here are final for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The stage succeeded; `result` is stored in the stage result column
    /// (a path, a link, or inline payload).
    Completed { result: Option<String> },
    /// The item's content cannot satisfy this stage, now or ever.
    Unavailable { reason: String },
    /// Deliberately not processed; terminal for this stage.
    Skipped { reason: String },
}

impl WorkerOutcome {
    pub fn completed(result: impl Into<String>) -> Self {
        Self::Completed {
            result: Some(result.into()),
        }
    }

    pub fn completed_empty() -> Self {
        Self::Completed { result: None }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// A pluggable per-item stage implementation.
///
/// Workers are stateless with respect to the store: they read the item
/// record, do their work, and report an outcome. Status writes belong to the
/// stage runner alone.
#[async_trait]
pub trait StageWorker: Send + Sync {
    /// Which stage this worker implements.
    fn stage(&self) -> Stage;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Process one item. Runs under the runner's timeout; must be
    /// cancel-safe since a timed-out future is dropped.
    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome>;
}
