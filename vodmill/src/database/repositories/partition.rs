//! Job partition repository.
//!
//! A partition is a timestamp-versioned snapshot of the catalog: its own
//! `items_{name}` table with every stage column reset, plus a registry row.
//! Runs against one partition can never touch another partition's rows.

use async_trait::async_trait;
use tracing::info;

use crate::database::models::{PartitionRecord, SelectionPredicate, Stage};
use crate::database::models::partition::validate_job_name;
use crate::database::repositories::SqlxItemStore;
use crate::database::{DbPool, WritePool, begin_immediate};
use crate::{Error, Result};

/// Timestamp suffix for partition names, second resolution.
const PARTITION_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

#[async_trait]
pub trait PartitionRepository: Send + Sync {
    /// Create `{job_name}_{timestamp}`: registry row, physical table and
    /// catalog snapshot in one transaction. Fails with
    /// [`Error::DuplicateJob`] if the partition already exists and
    /// [`Error::InvalidName`] if the job name has characters that cannot go
    /// into a SQL identifier.
    async fn create(
        &self,
        job_name: &str,
        predicate: &SelectionPredicate,
    ) -> Result<PartitionRecord>;

    /// Most recently created partition for the job, if any.
    async fn latest(&self, job_name: &str) -> Result<Option<PartitionRecord>>;

    /// All registered partitions, newest first.
    async fn list(&self) -> Result<Vec<PartitionRecord>>;

    /// Row count of a partition's item table.
    async fn item_count(&self, partition: &PartitionRecord) -> Result<u64>;
}

/// SQLx implementation of [`PartitionRepository`].
pub struct SqlxPartitionRepository {
    read: DbPool,
    write: WritePool,
}

impl SqlxPartitionRepository {
    pub fn new(read: DbPool, write: WritePool) -> Self {
        Self { read, write }
    }

    /// Item store bound to a partition's physical table.
    pub fn store_for(&self, partition: &PartitionRecord) -> SqlxItemStore {
        SqlxItemStore::for_table(self.read.clone(), self.write.clone(), partition.table_name())
    }
}

/// DDL for a partition item table; keep in step with migrations/0001_init.sql.
fn item_table_ddl(table: &str) -> String {
    let mut columns = vec![
        "id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "item_id TEXT NOT NULL UNIQUE".to_string(),
        "source_url TEXT NOT NULL".to_string(),
        "collection_id TEXT".to_string(),
        "title TEXT".to_string(),
        "published_at TEXT".to_string(),
        "added_at TEXT NOT NULL".to_string(),
        "updated_at TEXT NOT NULL".to_string(),
    ];
    for stage in Stage::ALL {
        columns.push(format!(
            "{} TEXT NOT NULL DEFAULT 'PENDING'",
            stage.status_column()
        ));
        columns.push(format!(
            "{} INTEGER NOT NULL DEFAULT 0",
            stage.attempts_column()
        ));
        columns.push(format!("{} TEXT", stage.result_column()));
        columns.push(format!("{} TEXT", stage.error_column()));
    }
    format!(
        "CREATE TABLE \"{}\" (\n    {}\n)",
        table,
        columns.join(",\n    ")
    )
}

#[async_trait]
impl PartitionRepository for SqlxPartitionRepository {
    async fn create(
        &self,
        job_name: &str,
        predicate: &SelectionPredicate,
    ) -> Result<PartitionRecord> {
        validate_job_name(job_name)?;

        let now = chrono::Utc::now();
        let name = format!("{}_{}", job_name, now.format(PARTITION_TS_FORMAT));
        let table = format!("items_{name}");
        let created_at = now.to_rfc3339();
        let predicate_json = serde_json::to_string(predicate)?;

        let mut tx = begin_immediate(&self.write).await?;

        // Register first: the UNIQUE(name) constraint rejects a second
        // partition for the same job in the same second.
        let registered = sqlx::query(
            "INSERT INTO partitions (name, job_name, created_at, predicate) VALUES (?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(job_name)
        .bind(&created_at)
        .bind(&predicate_json)
        .execute(&mut *tx)
        .await;

        let registered = match registered {
            Ok(done) => done,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(Error::DuplicateJob(name));
            }
            Err(err) => return Err(err.into()),
        };

        sqlx::query(&item_table_ddl(&table)).execute(&mut *tx).await?;
        for stage in Stage::ALL {
            sqlx::query(&format!(
                r#"CREATE INDEX "idx_{table}_{col}" ON "{table}" ({col})"#,
                col = stage.status_column(),
            ))
            .execute(&mut *tx)
            .await?;
        }

        // Snapshot matching catalog rows with fresh stage columns.
        let mut where_clauses: Vec<String> = Vec::new();
        if !predicate.collections.is_empty() {
            let placeholders = vec!["?"; predicate.collections.len()].join(", ");
            where_clauses.push(format!("collection_id IN ({placeholders})"));
        }
        if predicate.title_keyword.is_some() {
            where_clauses.push("title LIKE ?".to_string());
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clauses.join(" AND "))
        };

        let snapshot_sql = format!(
            r#"
            INSERT INTO "{table}" (item_id, source_url, collection_id, title, published_at, added_at, updated_at)
            SELECT item_id, source_url, collection_id, title, published_at, added_at, ?
            FROM items{where_sql}
            ORDER BY id ASC
            "#,
        );
        let mut snapshot = sqlx::query(&snapshot_sql).bind(&created_at);
        for collection in &predicate.collections {
            snapshot = snapshot.bind(collection);
        }
        if let Some(keyword) = &predicate.title_keyword {
            snapshot = snapshot.bind(format!("%{keyword}%"));
        }
        let snapshotted = snapshot.execute(&mut *tx).await?;

        tx.commit().await?;

        info!(
            partition = %name,
            items = snapshotted.rows_affected(),
            "Created job partition"
        );

        Ok(PartitionRecord {
            id: registered.last_insert_rowid(),
            name,
            job_name: job_name.to_string(),
            created_at,
            predicate: predicate_json,
        })
    }

    async fn latest(&self, job_name: &str) -> Result<Option<PartitionRecord>> {
        let partition = sqlx::query_as::<_, PartitionRecord>(
            "SELECT * FROM partitions WHERE job_name = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(job_name)
        .fetch_optional(&self.read)
        .await?;
        Ok(partition)
    }

    async fn list(&self) -> Result<Vec<PartitionRecord>> {
        let partitions = sqlx::query_as::<_, PartitionRecord>(
            "SELECT * FROM partitions ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.read)
        .await?;
        Ok(partitions)
    }

    async fn item_count(&self, partition: &PartitionRecord) -> Result<u64> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, partition.table_name());
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.read).await?;
        Ok(count as u64)
    }
}
