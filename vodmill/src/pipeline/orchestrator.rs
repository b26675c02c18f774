//! End-to-end run orchestration.
//!
//! A [`Pipeline`] owns the stores, the source lister and one worker per
//! stage. [`Pipeline::run`] executes discovery, resolves the working
//! partition, recovers crash leftovers and then drives the stage sequence
//! through the [`StageRunner`](super::runner::StageRunner), collecting a
//! [`PipelineReport`] as it goes.

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::discovery::{DiscoveryStats, SourceLister, run_discovery};
use super::report::write_export_csv;
use super::runner::{StageRunner, StageRunnerConfig, StageStats};
use super::workers::StageWorker;
use crate::database::models::{SelectionPredicate, Stage, StageStatus};
use crate::database::repositories::{
    CollectionRepository, ItemStore, PartitionRepository, SqlxPartitionRepository,
};
use crate::{Error, Result};

/// Per-run options, assembled from config and CLI flags.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run inside a partition registered under this job name. `None` runs
    /// directly against the catalog.
    pub job: Option<String>,
    /// Reuse the job's newest partition instead of creating a fresh one.
    pub resume: bool,
    /// Which catalog rows a fresh partition snapshots.
    pub predicate: SelectionPredicate,
    pub skip_discovery: bool,
    /// Per-collection cap on newly discovered items.
    pub discovery_limit: Option<u32>,
    pub skipped_stages: Vec<Stage>,
    pub stage_limits: Vec<(Stage, u32)>,
    /// Stop the sequence after a stage that selected items but completed
    /// none of them.
    pub halt_on_error: bool,
    /// Keep running later stages after a systemic stage error.
    pub keep_going: bool,
}

impl RunOptions {
    pub fn skips(&self, stage: Stage) -> bool {
        self.skipped_stages.contains(&stage)
    }

    pub fn limit_for(&self, stage: Stage) -> Option<u32> {
        self.stage_limits
            .iter()
            .find(|(candidate, _)| *candidate == stage)
            .map(|(_, limit)| *limit)
    }
}

/// What happened to one stage during a run.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    /// Stage was disabled for this run; nothing was selected.
    pub skipped: bool,
    pub stats: Option<StageStats>,
    /// Systemic error that aborted the stage, if any.
    pub error: Option<String>,
}

impl StageReport {
    fn skipped(stage: Stage) -> Self {
        Self {
            stage,
            skipped: true,
            stats: None,
            error: None,
        }
    }

    fn finished(stage: Stage, stats: StageStats) -> Self {
        Self {
            stage,
            skipped: false,
            stats: Some(stats),
            error: None,
        }
    }

    fn aborted(stage: Stage, error: &Error) -> Self {
        Self {
            stage,
            skipped: false,
            stats: None,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of one [`Pipeline::run`] call.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Name of the partition the run executed in, `None` for catalog runs.
    pub partition: Option<String>,
    pub discovery: Option<DiscoveryStats>,
    /// One entry per stage the run reached, in execution order.
    pub stages: Vec<StageReport>,
    pub export_csv: Option<PathBuf>,
    pub export_rows: u64,
}

impl PipelineReport {
    /// True when any stage hit a systemic error. Item-level failures do not
    /// count; they only move stats.
    pub fn has_systemic_failure(&self) -> bool {
        self.stages.iter().any(|stage| stage.error.is_some())
    }

    fn stats_for(&self, stage: Stage) -> Option<&StageStats> {
        self.stages
            .iter()
            .find(|report| report.stage == stage && !report.skipped && report.error.is_none())
            .and_then(|report| report.stats.as_ref())
    }

    /// Human-readable run summary, one line per phase.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(discovery) = &self.discovery {
            out.push_str(&format!(
                "discovery      listed {} from {} collections ({} failed), {} upserted\n",
                discovery.listed,
                discovery.collections,
                discovery.failed_collections,
                discovery.upserted,
            ));
        }
        if let Some(partition) = &self.partition {
            out.push_str(&format!("partition      {partition}\n"));
        }
        for report in &self.stages {
            if report.skipped {
                out.push_str(&format!("{:<15}skipped\n", report.stage.as_str()));
            } else if let Some(error) = &report.error {
                out.push_str(&format!("{:<15}aborted: {error}\n", report.stage.as_str()));
            } else if let Some(stats) = &report.stats {
                out.push_str(&format!(
                    "{:<15}selected {}, completed {}, failed {}, unavailable {}, skipped {}, deferred {}, cancelled {}\n",
                    report.stage.as_str(),
                    stats.selected,
                    stats.completed,
                    stats.failed,
                    stats.unavailable,
                    stats.skipped,
                    stats.deferred,
                    stats.cancelled,
                ));
            }
        }
        if let Some(path) = &self.export_csv {
            out.push_str(&format!(
                "export csv     {} ({} rows)\n",
                path.display(),
                self.export_rows
            ));
        }
        if out.is_empty() {
            out.push_str("nothing to do\n");
        }
        out
    }
}

/// The full pipeline: discovery, partitioning and the five-stage sequence.
pub struct Pipeline {
    catalog: Arc<dyn ItemStore>,
    collections: Arc<dyn CollectionRepository>,
    partitions: Arc<SqlxPartitionRepository>,
    lister: Arc<dyn SourceLister>,
    workers: Vec<(Stage, Arc<dyn StageWorker>)>,
    runner_config: StageRunnerConfig,
    export_dir: PathBuf,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<dyn ItemStore>,
        collections: Arc<dyn CollectionRepository>,
        partitions: Arc<SqlxPartitionRepository>,
        lister: Arc<dyn SourceLister>,
        export_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            collections,
            partitions,
            lister,
            workers: Vec::new(),
            runner_config: StageRunnerConfig::default(),
            export_dir: export_dir.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind the worker that processes `stage`. Rebinding replaces the
    /// previous worker.
    pub fn with_worker(mut self, stage: Stage, worker: Arc<dyn StageWorker>) -> Self {
        self.workers.retain(|(bound, _)| *bound != stage);
        self.workers.push((stage, worker));
        self
    }

    pub fn with_runner_config(mut self, config: StageRunnerConfig) -> Self {
        self.runner_config = config;
        self
    }

    /// Cancellation token shared with the embedding process; cancelling it
    /// stops dispatch after in-flight items finish.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn worker_for(&self, stage: Stage) -> Option<Arc<dyn StageWorker>> {
        self.workers
            .iter()
            .find(|(bound, _)| *bound == stage)
            .map(|(_, worker)| worker.clone())
    }

    /// Execute one full run.
    ///
    /// Returns `Err` only for failures outside the stage sequence (partition
    /// resolution, discovery tooling, the stores themselves). Systemic stage
    /// errors are recorded in the report; check
    /// [`PipelineReport::has_systemic_failure`].
    pub async fn run(&self, options: &RunOptions) -> Result<PipelineReport> {
        for stage in Stage::ALL {
            if !options.skips(stage) && self.worker_for(stage).is_none() {
                return Err(Error::config(format!("no worker bound for stage {stage}")));
            }
        }

        let mut report = PipelineReport::default();

        // Discovery seeds the catalog, so it has to happen before a fresh
        // partition snapshots it. A resumed partition is already frozen;
        // discovery would only feed future partitions, so skip it.
        let run_discovery_phase = !options.skip_discovery && !options.resume;
        if run_discovery_phase && !self.cancel.is_cancelled() {
            let stats = run_discovery(
                self.catalog.as_ref(),
                self.collections.as_ref(),
                self.lister.as_ref(),
                options.discovery_limit,
            )
            .await?;
            report.discovery = Some(stats);
        }

        let store = self.resolve_store(options, &mut report).await?;

        // Crash leftovers: items claimed by an interrupted run stay
        // IN_PROGRESS forever unless somebody puts them back.
        for stage in Stage::ALL {
            let recovered = store
                .reset_stage(stage, &[StageStatus::InProgress], StageStatus::Pending, false)
                .await?;
            if recovered > 0 {
                warn!(
                    stage = %stage,
                    count = recovered,
                    "Recovered items left in progress by an interrupted run"
                );
            }
        }

        let runner = StageRunner::new(self.runner_config, self.cancel.clone());
        for stage in Stage::ALL {
            if self.cancel.is_cancelled() {
                info!("Run cancelled, remaining stages left untouched");
                break;
            }
            if options.skips(stage) {
                info!(stage = %stage, "Stage disabled for this run");
                report.stages.push(StageReport::skipped(stage));
                continue;
            }
            let worker = self
                .worker_for(stage)
                .ok_or_else(|| Error::config(format!("no worker bound for stage {stage}")))?;

            match runner
                .run(store.clone(), stage, worker, options.limit_for(stage))
                .await
            {
                Ok(stats) => {
                    let halt =
                        options.halt_on_error && stats.selected > 0 && stats.completed == 0;
                    report.stages.push(StageReport::finished(stage, stats));
                    if halt {
                        warn!(
                            stage = %stage,
                            selected = stats.selected,
                            "No item completed, halting the sequence"
                        );
                        break;
                    }
                }
                Err(err) => {
                    error!(stage = %stage, "Stage aborted by systemic error: {err}");
                    report.stages.push(StageReport::aborted(stage, &err));
                    if !options.keep_going {
                        break;
                    }
                }
            }
        }

        if report.stats_for(Stage::Export).is_some()
            && let Some((path, rows)) = write_export_csv(store.as_ref(), &self.export_dir).await?
        {
            report.export_csv = Some(path);
            report.export_rows = rows;
        }

        Ok(report)
    }

    /// Discovery only, against the catalog.
    pub async fn discover(&self, limit: Option<u32>) -> Result<DiscoveryStats> {
        run_discovery(
            self.catalog.as_ref(),
            self.collections.as_ref(),
            self.lister.as_ref(),
            limit,
        )
        .await
    }

    /// Pick the item store this run operates on and note the partition in
    /// the report.
    async fn resolve_store(
        &self,
        options: &RunOptions,
        report: &mut PipelineReport,
    ) -> Result<Arc<dyn ItemStore>> {
        let Some(job) = &options.job else {
            info!("No job name, running against the catalog");
            return Ok(self.catalog.clone());
        };

        let partition = if options.resume {
            self.partitions.latest(job).await?.ok_or_else(|| {
                Error::validation(format!("nothing to resume: job '{job}' has no partition"))
            })?
        } else {
            self.partitions.create(job, &options.predicate).await?
        };

        info!(
            partition = %partition.name,
            resumed = options.resume,
            "Running inside job partition"
        );
        report.partition = Some(partition.name.clone());
        Ok(Arc::new(self.partitions.store_for(&partition)))
    }
}
