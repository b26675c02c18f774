//! End-to-end pipeline tests with scripted stage workers.
//!
//! Real SQLite underneath, fake workers on top: every test drives
//! [`Pipeline::run`] and then checks both the report and the durable state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vodmill::database::models::{
    CollectionRecord, ItemRecord, NewCollection, NewItem, Stage, StageStatus,
};
use vodmill::database::repositories::{
    CollectionRepository, ItemStore, PartitionRepository, SqlxCollectionRepository, SqlxItemStore,
    SqlxPartitionRepository,
};
use vodmill::database::{DbPool, WritePool, init_pool, init_write_pool, run_migrations};
use vodmill::pipeline::workers::export::ExportRecord;
use vodmill::pipeline::{
    DiscoveredItem, Pipeline, PipelineReport, RetryPolicy, RunOptions, SourceLister,
    StageRunnerConfig, StageStats, StageWorker, WorkerOutcome,
};
use vodmill::{Error, Result};

// ---------------------------------------------------------------------------
// Fixtures

async fn setup() -> (TempDir, DbPool, WritePool) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("test.db");
    let url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let read = init_pool(&url).await.expect("Failed to create read pool");
    let write = init_write_pool(&url)
        .await
        .expect("Failed to create write pool");
    run_migrations(&read).await.expect("Failed to run migrations");

    (dir, read, write)
}

async fn seed_items(store: &dyn ItemStore, count: usize) {
    for i in 0..count {
        store
            .upsert_item(
                &NewItem::new(format!("vid-{i}"), format!("https://example.com/v/{i}"))
                    .with_title(format!("Video {i}"))
                    .with_published_at("2024-05-01T00:00:00Z"),
            )
            .await
            .expect("seed item");
    }
}

/// Backoff shrunk to microscopic so retry tests finish instantly.
fn fast_config() -> StageRunnerConfig {
    StageRunnerConfig {
        concurrency: 4,
        retry_limit: 3,
        timeout_secs: 5,
        backoff: RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
    }
}

fn base_pipeline(read: &DbPool, write: &WritePool, export_dir: &std::path::Path) -> Pipeline {
    Pipeline::new(
        Arc::new(SqlxItemStore::catalog(read.clone(), write.clone())),
        Arc::new(SqlxCollectionRepository::new(read.clone(), write.clone())),
        Arc::new(SqlxPartitionRepository::new(read.clone(), write.clone())),
        Arc::new(StaticLister { items: Vec::new() }),
        export_dir,
    )
    .with_runner_config(fast_config())
}

fn skip_all_but(kept: &[Stage]) -> Vec<Stage> {
    Stage::ALL
        .into_iter()
        .filter(|stage| !kept.contains(stage))
        .collect()
}

fn stage_stats(report: &PipelineReport, stage: Stage) -> StageStats {
    report
        .stages
        .iter()
        .find(|entry| entry.stage == stage)
        .and_then(|entry| entry.stats)
        .unwrap_or_else(|| panic!("no stats recorded for stage {stage}"))
}

// ---------------------------------------------------------------------------
// Scripted workers

/// Returns the same outcome for every item and counts invocations.
struct StaticWorker {
    stage: Stage,
    outcome: WorkerOutcome,
    calls: AtomicUsize,
}

impl StaticWorker {
    fn completing(stage: Stage, result: &str) -> Arc<Self> {
        Arc::new(Self {
            stage,
            outcome: WorkerOutcome::completed(result),
            calls: AtomicUsize::new(0),
        })
    }

    fn unavailable(stage: Stage, reason: &str) -> Arc<Self> {
        Arc::new(Self {
            stage,
            outcome: WorkerOutcome::unavailable(reason),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageWorker for StaticWorker {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn name(&self) -> &'static str {
        "static"
    }

    async fn process(&self, _item: &ItemRecord) -> Result<WorkerOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }
}

/// Fails transiently `failures_per_item` times per item, then completes.
struct FlakyWorker {
    stage: Stage,
    failures_per_item: u32,
    seen: DashMap<String, u32>,
}

impl FlakyWorker {
    fn new(stage: Stage, failures_per_item: u32) -> Arc<Self> {
        Arc::new(Self {
            stage,
            failures_per_item,
            seen: DashMap::new(),
        })
    }

    fn total_calls(&self) -> u32 {
        self.seen.iter().map(|entry| *entry.value()).sum()
    }
}

#[async_trait]
impl StageWorker for FlakyWorker {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome> {
        let mut count = self.seen.entry(item.item_id.clone()).or_insert(0);
        *count += 1;
        let attempt = *count;
        drop(count);

        if attempt <= self.failures_per_item {
            return Err(Error::transient(format!("synthetic failure {attempt}")));
        }
        Ok(WorkerOutcome::completed(format!("artifact/{}", item.item_id)))
    }
}

/// Hangs on the first `slow_calls` invocations per item, then completes
/// instantly. Drives the per-invocation timeout path rather than a
/// worker-returned error.
struct SlowStartWorker {
    stage: Stage,
    slow_calls: u32,
    seen: DashMap<String, u32>,
}

impl SlowStartWorker {
    fn new(stage: Stage, slow_calls: u32) -> Arc<Self> {
        Arc::new(Self {
            stage,
            slow_calls,
            seen: DashMap::new(),
        })
    }

    fn total_calls(&self) -> u32 {
        self.seen.iter().map(|entry| *entry.value()).sum()
    }
}

#[async_trait]
impl StageWorker for SlowStartWorker {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn name(&self) -> &'static str {
        "slow-start"
    }

    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome> {
        let mut count = self.seen.entry(item.item_id.clone()).or_insert(0);
        *count += 1;
        let attempt = *count;
        drop(count);

        if attempt <= self.slow_calls {
            // Far past the configured timeout; the runner drops this future.
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        Ok(WorkerOutcome::completed(format!("artifact/{}", item.item_id)))
    }
}

/// Non-transient tool error: the stage cannot run for anyone.
struct BrokenToolWorker {
    stage: Stage,
}

#[async_trait]
impl StageWorker for BrokenToolWorker {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn name(&self) -> &'static str {
        "broken-tool"
    }

    async fn process(&self, _item: &ItemRecord) -> Result<WorkerOutcome> {
        Err(Error::tool("yt-dlp", "No such file or directory"))
    }
}

/// Export worker that stores a real per-item record, so CSV assembly has
/// something to collect.
struct RecordingExportWorker;

#[async_trait]
impl StageWorker for RecordingExportWorker {
    fn stage(&self) -> Stage {
        Stage::Export
    }

    fn name(&self) -> &'static str {
        "recording-export"
    }

    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome> {
        let record = ExportRecord {
            item_id: item.item_id.clone(),
            title: item.title.clone(),
            source_url: item.source_url.clone(),
            published_at: item.published_at.clone(),
            text_path: None,
            transcript_link: Some(format!("https://files.example.com/{}.txt", item.item_id)),
            summary: "A short synthetic summary.".to_string(),
        };
        Ok(WorkerOutcome::completed(serde_json::to_string(&record)?))
    }
}

struct StaticLister {
    items: Vec<DiscoveredItem>,
}

#[async_trait]
impl SourceLister for StaticLister {
    async fn list(&self, _collection: &CollectionRecord) -> Result<Vec<DiscoveredItem>> {
        Ok(self.items.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests

#[tokio::test]
async fn test_full_pipeline_completes_and_writes_csv() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 2).await;

    let acquisition = StaticWorker::completing(Stage::Acquisition, "subs/file.en.vtt");
    let conversion = StaticWorker::completing(Stage::Conversion, "text/file.txt");
    let transcription = StaticWorker::completing(Stage::Transcription, "text/file.txt");
    let summarization = StaticWorker::completing(Stage::Summarization, "A short synthetic summary.");

    let pipeline = base_pipeline(&read, &write, dir.path())
        .with_worker(Stage::Acquisition, acquisition.clone())
        .with_worker(Stage::Conversion, conversion.clone())
        .with_worker(Stage::Transcription, transcription.clone())
        .with_worker(Stage::Summarization, summarization.clone())
        .with_worker(Stage::Export, Arc::new(RecordingExportWorker));

    let options = RunOptions {
        skip_discovery: true,
        ..RunOptions::default()
    };
    let report = pipeline.run(&options).await.expect("run");

    assert_eq!(report.stages.len(), 5);
    assert!(!report.has_systemic_failure());
    assert_eq!(stage_stats(&report, Stage::Acquisition).completed, 2);
    assert_eq!(stage_stats(&report, Stage::Conversion).completed, 2);
    // Subtitles were found, so the fallback path stays idle.
    assert_eq!(stage_stats(&report, Stage::Transcription).selected, 0);
    assert_eq!(transcription.calls(), 0);
    assert_eq!(stage_stats(&report, Stage::Summarization).completed, 2);
    assert_eq!(stage_stats(&report, Stage::Export).completed, 2);

    let csv_path = report.export_csv.as_ref().expect("csv written");
    assert_eq!(report.export_rows, 2);
    let csv = tokio::fs::read_to_string(csv_path).await.expect("read csv");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "item_id,title,url,published,transcript_link,summary");
    assert!(csv.contains("vid-0"));
    assert!(csv.contains("https://files.example.com/vid-1.txt"));

    let item = store.get_item("vid-0").await.expect("get");
    assert_eq!(item.status(Stage::Acquisition), Some(StageStatus::Completed));
    assert_eq!(item.status(Stage::Transcription), Some(StageStatus::Pending));
    assert_eq!(item.status(Stage::Export), Some(StageStatus::Completed));
}

#[tokio::test]
async fn test_second_run_selects_nothing() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 2).await;

    let options = RunOptions {
        skip_discovery: true,
        skipped_stages: skip_all_but(&[Stage::Acquisition]),
        ..RunOptions::default()
    };

    let first_worker = StaticWorker::completing(Stage::Acquisition, "subs/file.en.vtt");
    let first = base_pipeline(&read, &write, dir.path())
        .with_worker(Stage::Acquisition, first_worker.clone());
    let report = first.run(&options).await.expect("first run");
    assert_eq!(stage_stats(&report, Stage::Acquisition).completed, 2);
    assert_eq!(first_worker.calls(), 2);

    // Completed is absorbing: a rerun dispatches nothing.
    let second_worker = StaticWorker::completing(Stage::Acquisition, "subs/file.en.vtt");
    let second = base_pipeline(&read, &write, dir.path())
        .with_worker(Stage::Acquisition, second_worker.clone());
    let report = second.run(&options).await.expect("second run");
    let stats = stage_stats(&report, Stage::Acquisition);
    assert_eq!(stats.selected, 0);
    assert_eq!(stats.processed(), 0);
    assert_eq!(second_worker.calls(), 0);
}

#[tokio::test]
async fn test_transient_failures_retry_within_the_run() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 1).await;

    let worker = FlakyWorker::new(Stage::Acquisition, 2);
    let pipeline =
        base_pipeline(&read, &write, dir.path()).with_worker(Stage::Acquisition, worker.clone());
    let options = RunOptions {
        skip_discovery: true,
        skipped_stages: skip_all_but(&[Stage::Acquisition]),
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run");
    let stats = stage_stats(&report, Stage::Acquisition);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(worker.total_calls(), 3);

    let item = store.get_item("vid-0").await.expect("get");
    assert_eq!(item.status(Stage::Acquisition), Some(StageStatus::Completed));
    // Both transient failures left a durable trace.
    assert_eq!(item.attempts(Stage::Acquisition), 2);
    assert!(item.error(Stage::Acquisition).is_none());
    assert_eq!(item.result(Stage::Acquisition), Some("artifact/vid-0"));
}

#[tokio::test]
async fn test_worker_timeout_is_retried_like_any_transient_failure() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 1).await;

    let mut config = fast_config();
    config.timeout_secs = 1;

    // Times out twice, succeeds on the third invocation.
    let worker = SlowStartWorker::new(Stage::Acquisition, 2);
    let pipeline = base_pipeline(&read, &write, dir.path())
        .with_runner_config(config)
        .with_worker(Stage::Acquisition, worker.clone());
    let options = RunOptions {
        skip_discovery: true,
        skipped_stages: skip_all_but(&[Stage::Acquisition]),
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run");
    let stats = stage_stats(&report, Stage::Acquisition);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(worker.total_calls(), 3);

    let item = store.get_item("vid-0").await.expect("get");
    assert_eq!(item.status(Stage::Acquisition), Some(StageStatus::Completed));
    // Both timed-out attempts left their durable trace; success did not add one.
    assert_eq!(item.attempts(Stage::Acquisition), 2);
    assert!(item.error(Stage::Acquisition).is_none());
    assert_eq!(item.result(Stage::Acquisition), Some("artifact/vid-0"));
}

#[tokio::test]
async fn test_retry_budget_exhausts_and_item_freezes() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 1).await;

    let mut config = fast_config();
    config.retry_limit = 2;

    let worker = FlakyWorker::new(Stage::Acquisition, 10);
    let pipeline = base_pipeline(&read, &write, dir.path())
        .with_runner_config(config)
        .with_worker(Stage::Acquisition, worker.clone());
    let options = RunOptions {
        skip_discovery: true,
        skipped_stages: skip_all_but(&[Stage::Acquisition]),
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run");
    assert_eq!(stage_stats(&report, Stage::Acquisition).failed, 1);
    assert_eq!(worker.total_calls(), 2);

    let item = store.get_item("vid-0").await.expect("get");
    assert_eq!(item.status(Stage::Acquisition), Some(StageStatus::Failed));
    assert_eq!(item.attempts(Stage::Acquisition), 2);
    assert_eq!(item.error(Stage::Acquisition), Some("synthetic failure 2"));

    // Out of budget: the next run leaves the item frozen.
    let retry_worker = FlakyWorker::new(Stage::Acquisition, 0);
    let second = base_pipeline(&read, &write, dir.path())
        .with_runner_config(config)
        .with_worker(Stage::Acquisition, retry_worker.clone());
    let report = second.run(&options).await.expect("second run");
    assert_eq!(stage_stats(&report, Stage::Acquisition).selected, 0);
    assert_eq!(retry_worker.total_calls(), 0);
}

#[tokio::test]
async fn test_skipped_stage_blocks_downstream_without_failing() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 1).await;

    let summarization = StaticWorker::completing(Stage::Summarization, "summary");
    let pipeline = base_pipeline(&read, &write, dir.path())
        .with_worker(
            Stage::Acquisition,
            StaticWorker::completing(Stage::Acquisition, "subs/file.en.vtt"),
        )
        .with_worker(Stage::Summarization, summarization.clone());
    let options = RunOptions {
        skip_discovery: true,
        skipped_stages: vec![Stage::Conversion, Stage::Transcription, Stage::Export],
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run");
    assert!(!report.has_systemic_failure());

    let conversion = report
        .stages
        .iter()
        .find(|entry| entry.stage == Stage::Conversion)
        .expect("conversion entry");
    assert!(conversion.skipped);
    assert!(conversion.stats.is_none());

    // No text was produced, so summarization has nothing to select.
    assert_eq!(stage_stats(&report, Stage::Summarization).selected, 0);
    assert_eq!(summarization.calls(), 0);

    let item = store.get_item("vid-0").await.expect("get");
    assert_eq!(item.status(Stage::Conversion), Some(StageStatus::Pending));
}

#[tokio::test]
async fn test_unavailable_acquisition_falls_back_to_transcription() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 1).await;

    let conversion = StaticWorker::completing(Stage::Conversion, "text/file.txt");
    let transcription = StaticWorker::completing(Stage::Transcription, "text/vid-0.txt");
    let pipeline = base_pipeline(&read, &write, dir.path())
        .with_worker(
            Stage::Acquisition,
            StaticWorker::unavailable(Stage::Acquisition, "no subtitles in any language"),
        )
        .with_worker(Stage::Conversion, conversion.clone())
        .with_worker(Stage::Transcription, transcription.clone());
    let options = RunOptions {
        skip_discovery: true,
        skipped_stages: vec![Stage::Summarization, Stage::Export],
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run");
    assert_eq!(stage_stats(&report, Stage::Acquisition).unavailable, 1);
    assert_eq!(stage_stats(&report, Stage::Conversion).selected, 0);
    assert_eq!(conversion.calls(), 0);
    assert_eq!(stage_stats(&report, Stage::Transcription).completed, 1);
    assert_eq!(transcription.calls(), 1);

    let item = store.get_item("vid-0").await.expect("get");
    assert_eq!(
        item.status(Stage::Acquisition),
        Some(StageStatus::Unavailable)
    );
    assert_eq!(
        item.error(Stage::Acquisition),
        Some("no subtitles in any language")
    );
    assert_eq!(
        item.status(Stage::Transcription),
        Some(StageStatus::Completed)
    );
}

#[tokio::test]
async fn test_halt_on_error_stops_the_sequence() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 2).await;

    let mut config = fast_config();
    config.retry_limit = 1;

    let conversion = StaticWorker::completing(Stage::Conversion, "text/file.txt");
    let pipeline = base_pipeline(&read, &write, dir.path())
        .with_runner_config(config)
        .with_worker(Stage::Acquisition, FlakyWorker::new(Stage::Acquisition, 100))
        .with_worker(Stage::Conversion, conversion.clone())
        .with_worker(
            Stage::Transcription,
            StaticWorker::completing(Stage::Transcription, "text/file.txt"),
        )
        .with_worker(
            Stage::Summarization,
            StaticWorker::completing(Stage::Summarization, "summary"),
        )
        .with_worker(Stage::Export, Arc::new(RecordingExportWorker));
    let options = RunOptions {
        skip_discovery: true,
        halt_on_error: true,
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run");
    // Everything selected failed: the sequence stops right there.
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].stage, Stage::Acquisition);
    let stats = stage_stats(&report, Stage::Acquisition);
    assert_eq!(stats.selected, 2);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.failed, 2);
    assert!(!report.has_systemic_failure());
    assert_eq!(conversion.calls(), 0);
}

#[tokio::test]
async fn test_systemic_error_is_reported_and_recovered_next_run() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 1).await;

    let pipeline = base_pipeline(&read, &write, dir.path()).with_worker(
        Stage::Acquisition,
        Arc::new(BrokenToolWorker {
            stage: Stage::Acquisition,
        }),
    );
    let options = RunOptions {
        skip_discovery: true,
        skipped_stages: skip_all_but(&[Stage::Acquisition]),
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run returns a report");
    assert!(report.has_systemic_failure());
    let entry = &report.stages[0];
    assert_eq!(entry.stage, Stage::Acquisition);
    assert!(entry.error.as_deref().expect("error recorded").contains("yt-dlp"));

    // The claim stays behind; only stuck recovery may touch it.
    let item = store.get_item("vid-0").await.expect("get");
    assert_eq!(
        item.status(Stage::Acquisition),
        Some(StageStatus::InProgress)
    );

    let healed = StaticWorker::completing(Stage::Acquisition, "subs/file.en.vtt");
    let second = base_pipeline(&read, &write, dir.path())
        .with_worker(Stage::Acquisition, healed.clone());
    let report = second.run(&options).await.expect("second run");
    assert_eq!(stage_stats(&report, Stage::Acquisition).completed, 1);
    assert_eq!(healed.calls(), 1);

    let item = store.get_item("vid-0").await.expect("get");
    assert_eq!(item.status(Stage::Acquisition), Some(StageStatus::Completed));
}

#[tokio::test]
async fn test_job_partition_run_then_resume() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 2).await;

    // Fresh partition run: acquisition only.
    let first = base_pipeline(&read, &write, dir.path()).with_worker(
        Stage::Acquisition,
        StaticWorker::completing(Stage::Acquisition, "subs/file.en.vtt"),
    );
    let fresh = RunOptions {
        job: Some("nightly".to_string()),
        skip_discovery: true,
        skipped_stages: skip_all_but(&[Stage::Acquisition]),
        ..RunOptions::default()
    };
    let report = first.run(&fresh).await.expect("fresh run");
    let partition_name = report.partition.clone().expect("partition recorded");
    assert!(partition_name.starts_with("nightly_"));
    assert_eq!(stage_stats(&report, Stage::Acquisition).completed, 2);

    // Progress lives in the partition, not the catalog.
    let repo = SqlxPartitionRepository::new(read.clone(), write.clone());
    let partition = repo
        .latest("nightly")
        .await
        .expect("latest")
        .expect("partition exists");
    let snapshot = repo.store_for(&partition);
    let in_partition = snapshot.get_item("vid-0").await.expect("get partition");
    assert_eq!(
        in_partition.status(Stage::Acquisition),
        Some(StageStatus::Completed)
    );
    let in_catalog = store.get_item("vid-0").await.expect("get catalog");
    assert_eq!(
        in_catalog.status(Stage::Acquisition),
        Some(StageStatus::Pending)
    );

    // Resume picks up the same partition and carries on with conversion.
    let second = base_pipeline(&read, &write, dir.path())
        .with_worker(
            Stage::Acquisition,
            StaticWorker::completing(Stage::Acquisition, "subs/file.en.vtt"),
        )
        .with_worker(
            Stage::Conversion,
            StaticWorker::completing(Stage::Conversion, "text/file.txt"),
        );
    let resumed = RunOptions {
        job: Some("nightly".to_string()),
        resume: true,
        // Deliberately not skipping discovery: resume alone must suppress it.
        skipped_stages: skip_all_but(&[Stage::Acquisition, Stage::Conversion]),
        ..RunOptions::default()
    };
    let report = second.run(&resumed).await.expect("resumed run");
    assert!(report.discovery.is_none());
    assert_eq!(report.partition.as_deref(), Some(partition_name.as_str()));
    assert_eq!(stage_stats(&report, Stage::Acquisition).selected, 0);
    assert_eq!(stage_stats(&report, Stage::Conversion).completed, 2);
}

#[tokio::test]
async fn test_resume_without_partition_is_an_error() {
    let (dir, read, write) = setup().await;

    let pipeline = base_pipeline(&read, &write, dir.path()).with_worker(
        Stage::Acquisition,
        StaticWorker::completing(Stage::Acquisition, "subs/file.en.vtt"),
    );
    let options = RunOptions {
        job: Some("ghost".to_string()),
        resume: true,
        skip_discovery: true,
        skipped_stages: skip_all_but(&[Stage::Acquisition]),
        ..RunOptions::default()
    };

    let err = pipeline.run(&options).await.expect_err("must fail");
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn test_discovery_phase_seeds_the_catalog() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    let collections = SqlxCollectionRepository::new(read.clone(), write.clone());
    collections
        .upsert_collection(&NewCollection::new("chan-1", "https://example.com/chan-1"))
        .await
        .expect("register collection");

    let listed = vec![
        DiscoveredItem {
            item_id: "vid-a".to_string(),
            title: Some("First".to_string()),
            url: Some("https://example.com/v/a".to_string()),
            published_at: Some("2024-05-01T00:00:00Z".to_string()),
        },
        // No URL: logged and dropped, not upserted.
        DiscoveredItem {
            item_id: "vid-b".to_string(),
            title: None,
            url: None,
            published_at: None,
        },
        DiscoveredItem {
            item_id: "vid-c".to_string(),
            title: Some("Third".to_string()),
            url: Some("https://example.com/v/c".to_string()),
            published_at: None,
        },
    ];

    let pipeline = Pipeline::new(
        Arc::new(SqlxItemStore::catalog(read.clone(), write.clone())),
        Arc::new(SqlxCollectionRepository::new(read.clone(), write.clone())),
        Arc::new(SqlxPartitionRepository::new(read.clone(), write.clone())),
        Arc::new(StaticLister { items: listed }),
        dir.path(),
    );
    let options = RunOptions {
        skipped_stages: Stage::ALL.to_vec(),
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run");
    let discovery = report.discovery.expect("discovery ran");
    assert_eq!(discovery.collections, 1);
    assert_eq!(discovery.listed, 3);
    assert_eq!(discovery.upserted, 2);
    assert_eq!(store.count_items().await.expect("count"), 2);

    let item = store.get_item("vid-a").await.expect("get");
    assert_eq!(item.collection_id.as_deref(), Some("chan-1"));
    assert_eq!(item.title.as_deref(), Some("First"));
}

#[tokio::test]
async fn test_discovery_limit_caps_upserts_per_collection() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    let collections = SqlxCollectionRepository::new(read.clone(), write.clone());
    collections
        .upsert_collection(&NewCollection::new("chan-1", "https://example.com/chan-1"))
        .await
        .expect("register collection");

    let listed: Vec<DiscoveredItem> = (0..3)
        .map(|i| DiscoveredItem {
            item_id: format!("vid-{i}"),
            title: None,
            url: Some(format!("https://example.com/v/{i}")),
            published_at: None,
        })
        .collect();

    let pipeline = Pipeline::new(
        Arc::new(SqlxItemStore::catalog(read.clone(), write.clone())),
        Arc::new(SqlxCollectionRepository::new(read.clone(), write.clone())),
        Arc::new(SqlxPartitionRepository::new(read.clone(), write.clone())),
        Arc::new(StaticLister { items: listed }),
        dir.path(),
    );
    let options = RunOptions {
        discovery_limit: Some(1),
        skipped_stages: Stage::ALL.to_vec(),
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run");
    assert_eq!(report.discovery.expect("discovery ran").upserted, 1);
    assert_eq!(store.count_items().await.expect("count"), 1);
}

#[tokio::test]
async fn test_cancelled_run_dispatches_nothing() {
    let (dir, read, write) = setup().await;
    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    seed_items(&store, 1).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let worker = StaticWorker::completing(Stage::Acquisition, "subs/file.en.vtt");
    let pipeline = base_pipeline(&read, &write, dir.path())
        .with_cancellation(cancel)
        .with_worker(Stage::Acquisition, worker.clone());
    let options = RunOptions {
        skip_discovery: true,
        skipped_stages: skip_all_but(&[Stage::Acquisition]),
        ..RunOptions::default()
    };

    let report = pipeline.run(&options).await.expect("run");
    assert!(report.stages.is_empty());
    assert_eq!(worker.calls(), 0);

    let item = store.get_item("vid-0").await.expect("get");
    assert_eq!(item.status(Stage::Acquisition), Some(StageStatus::Pending));
}

#[tokio::test]
async fn test_unbound_stage_is_a_config_error() {
    let (dir, read, write) = setup().await;

    let pipeline = base_pipeline(&read, &write, dir.path());
    let options = RunOptions {
        skip_discovery: true,
        ..RunOptions::default()
    };

    let err = pipeline.run(&options).await.expect_err("must fail");
    assert!(matches!(err, Error::Configuration(_)));
}
