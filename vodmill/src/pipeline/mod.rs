//! Pipeline engine: stage runner, orchestrator, discovery and workers.

pub mod discovery;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod runner;
pub mod workers;

pub use discovery::{CommandSourceLister, DiscoveredItem, DiscoveryStats, SourceLister};
pub use orchestrator::{Pipeline, PipelineReport, RunOptions, StageReport};
pub use retry::RetryPolicy;
pub use runner::{StageRunner, StageRunnerConfig, StageStats};
pub use workers::{StageWorker, WorkerOutcome};

pub use crate::database::models::{Stage, StageStatus};
