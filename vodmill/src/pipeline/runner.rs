//! Bounded-concurrency stage runner.
//!
//! One `run` call selects every item currently eligible for a stage,
//! dispatches them to worker tasks behind a semaphore, and writes each
//! item's verdict back through the store. Item-level failures only ever move
//! counters; the first systemic error stops dispatch, lets in-flight items
//! finish, and is returned to the caller.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use super::workers::{StageWorker, WorkerOutcome};
use crate::database::models::{ItemRecord, Stage, StageStatus};
use crate::database::repositories::ItemStore;
use crate::{Error, Result};

/// Configuration for a stage run.
#[derive(Debug, Clone, Copy)]
pub struct StageRunnerConfig {
    /// Maximum concurrent worker invocations.
    pub concurrency: usize,
    /// An item is retried until its stage attempt counter reaches this.
    pub retry_limit: u32,
    /// Per-invocation timeout in seconds. A timeout counts as a transient
    /// failure; the worker future is dropped.
    pub timeout_secs: u64,
    /// Backoff between in-run retries of one item.
    pub backoff: RetryPolicy,
}

impl Default for StageRunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry_limit: 3,
            timeout_secs: 600,
            backoff: RetryPolicy::default(),
        }
    }
}

/// Aggregate counts for one stage run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageStats {
    /// Eligible items picked up this run (after the item limit).
    pub selected: u64,
    /// Eligible items left behind by the item limit; statuses untouched.
    pub deferred: u64,
    pub completed: u64,
    /// Items left `FAILED` with no retry budget remaining in this run.
    pub failed: u64,
    pub unavailable: u64,
    pub skipped: u64,
    /// Selected but never dispatched because the run was cancelled.
    pub cancelled: u64,
}

impl StageStats {
    /// Items that reached a worker and got a verdict.
    pub fn processed(&self) -> u64 {
        self.completed + self.failed + self.unavailable + self.skipped
    }
}

enum ItemVerdict {
    Completed,
    Failed,
    Unavailable,
    Skipped,
    Systemic(Error),
}

/// Runs one stage over one item table.
pub struct StageRunner {
    config: StageRunnerConfig,
    cancel: CancellationToken,
}

impl StageRunner {
    pub fn new(config: StageRunnerConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Process every currently-eligible item for `stage`.
    ///
    /// `limit` caps how many items this run takes on; the rest are counted
    /// as deferred and left untouched for the next run.
    pub async fn run(
        &self,
        store: Arc<dyn ItemStore>,
        stage: Stage,
        worker: Arc<dyn StageWorker>,
        limit: Option<u32>,
    ) -> Result<StageStats> {
        let eligible_total = store
            .count_eligible_for_run(stage, self.config.retry_limit)
            .await?;
        let batch = store
            .select_for_run(stage, self.config.retry_limit, limit)
            .await?;

        let mut stats = StageStats {
            selected: batch.len() as u64,
            deferred: eligible_total.saturating_sub(batch.len() as u64),
            ..StageStats::default()
        };

        if batch.is_empty() {
            info!(stage = %stage, "No eligible items, nothing to do");
            return Ok(stats);
        }

        info!(
            stage = %stage,
            selected = stats.selected,
            deferred = stats.deferred,
            concurrency = self.config.concurrency,
            worker = worker.name(),
            "Starting stage run"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        // Trips on the first systemic error so no further items dispatch.
        let abort = CancellationToken::new();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut tasks: JoinSet<ItemVerdict> = JoinSet::new();
        let mut dispatched: u64 = 0;

        for item in batch {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(stage = %stage, "Cancellation requested, stopping dispatch");
                    break;
                }
                _ = abort.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            dispatched += 1;
            let store = Arc::clone(&store);
            let worker = Arc::clone(&worker);
            let abort = abort.clone();
            let retry_limit = self.config.retry_limit;
            let backoff = self.config.backoff;

            tasks.spawn(async move {
                let verdict = process_item(
                    store,
                    stage,
                    worker,
                    item,
                    retry_limit,
                    timeout,
                    backoff,
                    &abort,
                )
                .await;
                drop(permit);
                verdict
            });
        }

        let mut systemic: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ItemVerdict::Completed) => stats.completed += 1,
                Ok(ItemVerdict::Failed) => stats.failed += 1,
                Ok(ItemVerdict::Unavailable) => stats.unavailable += 1,
                Ok(ItemVerdict::Skipped) => stats.skipped += 1,
                Ok(ItemVerdict::Systemic(err)) => {
                    if systemic.is_none() {
                        systemic = Some(err);
                    }
                }
                Err(join_err) => {
                    error!(stage = %stage, "Stage worker task failed: {join_err}");
                    if systemic.is_none() {
                        systemic = Some(Error::Other(format!(
                            "stage worker task failed: {join_err}"
                        )));
                    }
                }
            }
        }

        stats.cancelled = stats.selected.saturating_sub(dispatched);

        if let Some(err) = systemic {
            error!(stage = %stage, error = %err, "Stage aborted on systemic error");
            return Err(err);
        }

        info!(
            stage = %stage,
            completed = stats.completed,
            failed = stats.failed,
            unavailable = stats.unavailable,
            skipped = stats.skipped,
            cancelled = stats.cancelled,
            deferred = stats.deferred,
            "Stage run finished"
        );

        Ok(stats)
    }
}

/// Claim, invoke and record one item, retrying transient failures in place
/// while the attempt budget lasts.
#[allow(clippy::too_many_arguments)]
async fn process_item(
    store: Arc<dyn ItemStore>,
    stage: Stage,
    worker: Arc<dyn StageWorker>,
    item: ItemRecord,
    retry_limit: u32,
    timeout: Duration,
    backoff: RetryPolicy,
    abort: &CancellationToken,
) -> ItemVerdict {
    let item_id = item.item_id.clone();
    // Durable failure count so far; this task is the item's only claimant,
    // so tracking increments locally is safe.
    let mut attempts = item.attempts(stage).max(0) as u32;

    loop {
        if let Err(err) = store
            .set_stage_status(&item_id, stage, StageStatus::InProgress, None, None)
            .await
        {
            error!(stage = %stage, item = %item_id, "Failed to claim item: {err}");
            abort.cancel();
            return ItemVerdict::Systemic(err);
        }

        let outcome = match tokio::time::timeout(timeout, worker.process(&item)).await {
            Ok(result) => result,
            Err(_) => Err(Error::WorkerTimeout(timeout.as_secs())),
        };

        match outcome {
            Ok(WorkerOutcome::Completed { result }) => {
                debug!(stage = %stage, item = %item_id, "Item completed");
                return match store
                    .set_stage_status(
                        &item_id,
                        stage,
                        StageStatus::Completed,
                        result.as_deref(),
                        None,
                    )
                    .await
                {
                    Ok(()) => ItemVerdict::Completed,
                    Err(err) => {
                        abort.cancel();
                        ItemVerdict::Systemic(err)
                    }
                };
            }
            Ok(WorkerOutcome::Unavailable { reason }) => {
                info!(stage = %stage, item = %item_id, reason = %reason, "Item unavailable");
                return match store
                    .set_stage_status(
                        &item_id,
                        stage,
                        StageStatus::Unavailable,
                        None,
                        Some(&reason),
                    )
                    .await
                {
                    Ok(()) => ItemVerdict::Unavailable,
                    Err(err) => {
                        abort.cancel();
                        ItemVerdict::Systemic(err)
                    }
                };
            }
            Ok(WorkerOutcome::Skipped { reason }) => {
                debug!(stage = %stage, item = %item_id, reason = %reason, "Item skipped");
                return match store
                    .set_stage_status(&item_id, stage, StageStatus::Skipped, None, Some(&reason))
                    .await
                {
                    Ok(()) => ItemVerdict::Skipped,
                    Err(err) => {
                        abort.cancel();
                        ItemVerdict::Systemic(err)
                    }
                };
            }
            Err(err) if err.is_transient() => {
                warn!(stage = %stage, item = %item_id, "Attempt failed: {err}");
                if let Err(store_err) = store
                    .set_stage_status(
                        &item_id,
                        stage,
                        StageStatus::Failed,
                        None,
                        Some(&err.to_string()),
                    )
                    .await
                {
                    abort.cancel();
                    return ItemVerdict::Systemic(store_err);
                }
                attempts += 1;

                if attempts >= retry_limit {
                    warn!(
                        stage = %stage,
                        item = %item_id,
                        attempts,
                        "Retry budget exhausted, leaving item failed"
                    );
                    return ItemVerdict::Failed;
                }

                let delay = backoff.delay_for(attempts);
                debug!(
                    stage = %stage,
                    item = %item_id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                // Systemic: leave the claim in place, the next run's stuck
                // recovery resets it. Stop taking new work.
                error!(stage = %stage, item = %item_id, "Systemic worker error: {err}");
                abort.cancel();
                return ItemVerdict::Systemic(err);
            }
        }
    }
}
