//! Dispatch correctness under concurrency.
//!
//! The stage runner must hand each eligible item to exactly one worker task
//! per run, and every verdict must land durably, even while another
//! connection holds the write lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use rand::random;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vodmill::Result;
use vodmill::database::models::{ItemRecord, NewItem, Stage, StageStatus};
use vodmill::database::repositories::{ItemStore, SqlxItemStore};
use vodmill::database::{DbPool, WritePool, init_pool, init_write_pool, run_migrations};
use vodmill::pipeline::{RetryPolicy, StageRunner, StageRunnerConfig, StageWorker, WorkerOutcome};

async fn setup() -> (TempDir, String, DbPool, WritePool) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("stress.db");
    let url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let read = init_pool(&url).await.expect("Failed to create read pool");
    let write = init_write_pool(&url)
        .await
        .expect("Failed to create write pool");
    run_migrations(&read).await.expect("Failed to run migrations");

    (dir, url, read, write)
}

/// Asserts each item is delivered to at most one worker task, then completes
/// it after a tiny jitter to shake up interleavings.
struct ClaimTrackingWorker {
    claimed: DashSet<String>,
}

#[async_trait]
impl StageWorker for ClaimTrackingWorker {
    fn stage(&self) -> Stage {
        Stage::Acquisition
    }

    fn name(&self) -> &'static str {
        "claim-tracking"
    }

    async fn process(&self, item: &ItemRecord) -> Result<WorkerOutcome> {
        let inserted = self.claimed.insert(item.item_id.clone());
        assert!(inserted, "double-dispatched item {}", item.item_id);

        if random::<u8>().is_multiple_of(3) {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(random::<u64>() % 3)).await;
        }

        Ok(WorkerOutcome::completed(format!(
            "artifact/{}",
            item.item_id
        )))
    }
}

async fn run_claim_round(
    read: DbPool,
    write: WritePool,
    items: usize,
    concurrency: usize,
) -> Arc<ClaimTrackingWorker> {
    let store = Arc::new(SqlxItemStore::catalog(read, write));
    for i in 0..items {
        store
            .upsert_item(&NewItem::new(
                format!("item-{i:03}"),
                format!("https://example.com/v/{i}"),
            ))
            .await
            .expect("seed item");
    }

    let worker = Arc::new(ClaimTrackingWorker {
        claimed: DashSet::new(),
    });
    let runner = StageRunner::new(
        StageRunnerConfig {
            concurrency,
            retry_limit: 3,
            timeout_secs: 10,
            backoff: RetryPolicy {
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
        },
        CancellationToken::new(),
    );

    let stats = tokio::time::timeout(
        Duration::from_secs(60),
        runner.run(store.clone(), Stage::Acquisition, worker.clone(), None),
    )
    .await
    .expect("stage run timed out (possible deadlock)")
    .expect("stage run failed");

    assert_eq!(stats.selected, items as u64, "not every item was selected");
    assert_eq!(stats.completed, items as u64, "not every item completed");
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.cancelled, 0);

    // Durable state has to agree with the stats.
    let counts = store
        .count_by_status(Stage::Acquisition)
        .await
        .expect("count");
    assert_eq!(
        counts,
        vec![("COMPLETED".to_string(), items as i64)],
        "unexpected status distribution after the run"
    );

    worker
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_run_dispatches_each_item_exactly_once() {
    const ITEMS: usize = 48;

    let (_dir, _url, read, write) = setup().await;
    let worker = run_claim_round(read, write, ITEMS, 8).await;
    assert_eq!(worker.claimed.len(), ITEMS, "not every item was dispatched");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "stress test; run explicitly to validate dispatch correctness under write-lock contention"]
async fn claim_stress_with_contending_writer() {
    const ITEMS: usize = 300;

    let (_dir, url, read, write) = setup().await;

    // A second connection periodically holds the write lock so the runner's
    // status writes hit SQLITE_BUSY and have to retry.
    let locker_pool = init_write_pool(&url)
        .await
        .expect("Failed to create locker pool");
    let locker = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            if let Ok(mut tx) = locker_pool.begin().await {
                let _ = sqlx::query(
                    "UPDATE items SET updated_at = updated_at WHERE id IN (SELECT id FROM items LIMIT 1)",
                )
                .execute(&mut *tx)
                .await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.commit().await;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let store = SqlxItemStore::catalog(read.clone(), write.clone());
    let worker = run_claim_round(read, write, ITEMS, 24).await;
    assert_eq!(worker.claimed.len(), ITEMS, "not every item was dispatched");

    let _ = locker.await;

    // Every completion recorded its artifact pointer.
    for status in [StageStatus::InProgress, StageStatus::Pending] {
        let leftovers = store
            .get_eligible(Stage::Acquisition, &[status], None)
            .await
            .expect("leftover query");
        assert!(leftovers.is_empty(), "items left {status}");
    }
    let missing = store
        .get_eligible(Stage::Acquisition, &[StageStatus::Completed], None)
        .await
        .expect("completed query")
        .into_iter()
        .filter(|item| item.result(Stage::Acquisition).is_none())
        .count();
    assert_eq!(missing, 0, "some completions lost their artifact pointer");
}
