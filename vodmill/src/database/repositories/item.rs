//! Item store: the per-stage status ledger.
//!
//! One [`SqlxItemStore`] is bound to one physical item table. The catalog
//! binds `items`; partition views bind `items_{name}`. Table names come only
//! from the migration or from validated partition registry rows, never from
//! raw user input.

use async_trait::async_trait;

use crate::database::models::{ItemRecord, NewItem, Stage, StageStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{DbPool, WritePool};
use crate::{Error, Result};

/// Store contract for one item table.
///
/// Eligibility reads and status writes are deliberately separate operations;
/// exactly-once dispatch within a run is the stage runner's job.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert the item, or refresh its metadata if `item_id` already exists.
    /// Never touches status, attempt, result or error columns.
    async fn upsert_item(&self, item: &NewItem) -> Result<()>;

    /// Single item fetch by stable id.
    async fn get_item(&self, item_id: &str) -> Result<ItemRecord>;

    /// Items whose status for `stage` is in `statuses`, oldest inserted
    /// first. Looks only at the named stage's own status column.
    async fn get_eligible(
        &self,
        stage: Stage,
        statuses: &[StageStatus],
        limit: Option<u32>,
    ) -> Result<Vec<ItemRecord>>;

    /// What a stage run picks up: `PENDING` items plus `FAILED` items with
    /// attempts below `retry_limit`, restricted by the stage's prerequisite
    /// gate, oldest inserted first.
    async fn select_for_run(
        &self,
        stage: Stage,
        retry_limit: u32,
        limit: Option<u32>,
    ) -> Result<Vec<ItemRecord>>;

    /// Uncapped count of what [`Self::select_for_run`] would return.
    async fn count_eligible_for_run(&self, stage: Stage, retry_limit: u32) -> Result<u64>;

    /// Atomically set one stage's status. Increments the stage attempt
    /// counter when the new status is `FAILED`. A `Some` result replaces the
    /// stored result pointer; `None` leaves it alone. The error message is
    /// always overwritten (pass `None` to clear it). Unknown `item_id` is
    /// [`Error::ItemNotFound`]. Durable once this returns.
    async fn set_stage_status(
        &self,
        item_id: &str,
        stage: Stage,
        status: StageStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Bulk operator reset: move every item whose `stage` status is in
    /// `from` to `to`. With `clear_attempts` the attempt counter and error
    /// message are wiped too. Returns the number of rows changed.
    async fn reset_stage(
        &self,
        stage: Stage,
        from: &[StageStatus],
        to: StageStatus,
        clear_attempts: bool,
    ) -> Result<u64>;

    /// Per-status row counts for one stage.
    async fn count_by_status(&self, stage: Stage) -> Result<Vec<(String, i64)>>;

    /// Total rows in this table.
    async fn count_items(&self) -> Result<u64>;

    /// Name of the physical table this store is bound to.
    fn table(&self) -> &str;
}

/// SQLx implementation of [`ItemStore`] bound to one table.
#[derive(Clone)]
pub struct SqlxItemStore {
    read: DbPool,
    write: WritePool,
    table: String,
}

impl SqlxItemStore {
    /// Store over the canonical catalog table.
    pub fn catalog(read: DbPool, write: WritePool) -> Self {
        Self::for_table(read, write, "items")
    }

    /// Store over a partition table. `table` must come from a validated
    /// partition registry row.
    pub fn for_table(read: DbPool, write: WritePool, table: impl Into<String>) -> Self {
        Self {
            read,
            write,
            table: table.into(),
        }
    }

    fn runnable_clause(&self, stage: Stage, gated: bool) -> String {
        let mut clause = format!(
            "({status} = 'PENDING' OR ({status} = 'FAILED' AND {attempts} < ?))",
            status = stage.status_column(),
            attempts = stage.attempts_column(),
        );
        if gated && let Some(gate) = stage.gate_sql() {
            clause.push_str(" AND ");
            clause.push_str(gate);
        }
        clause
    }
}

#[async_trait]
impl ItemStore for SqlxItemStore {
    async fn upsert_item(&self, item: &NewItem) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let sql = format!(
            r#"
            INSERT INTO "{table}" (item_id, source_url, collection_id, title, published_at, added_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                source_url = excluded.source_url,
                collection_id = COALESCE(excluded.collection_id, collection_id),
                title = COALESCE(excluded.title, title),
                published_at = COALESCE(excluded.published_at, published_at),
                updated_at = excluded.updated_at
            "#,
            table = self.table
        );

        retry_on_sqlite_busy("upsert_item", || async {
            sqlx::query(&sql)
                .bind(&item.item_id)
                .bind(&item.source_url)
                .bind(&item.collection_id)
                .bind(&item.title)
                .bind(&item.published_at)
                .bind(&now)
                .bind(&now)
                .execute(&self.write)
                .await?;
            Ok(())
        })
        .await
    }

    async fn get_item(&self, item_id: &str) -> Result<ItemRecord> {
        let sql = format!(r#"SELECT * FROM "{}" WHERE item_id = ?"#, self.table);
        sqlx::query_as::<_, ItemRecord>(&sql)
            .bind(item_id)
            .fetch_optional(&self.read)
            .await?
            .ok_or_else(|| Error::ItemNotFound(item_id.to_string()))
    }

    async fn get_eligible(
        &self,
        stage: Stage,
        statuses: &[StageStatus],
        limit: Option<u32>,
    ) -> Result<Vec<ItemRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let mut sql = format!(
            r#"SELECT * FROM "{table}" WHERE {status} IN ({placeholders}) ORDER BY id ASC"#,
            table = self.table,
            status = stage.status_column(),
        );
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query_as::<_, ItemRecord>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        if let Some(limit) = limit {
            query = query.bind(limit as i64);
        }

        Ok(query.fetch_all(&self.read).await?)
    }

    async fn select_for_run(
        &self,
        stage: Stage,
        retry_limit: u32,
        limit: Option<u32>,
    ) -> Result<Vec<ItemRecord>> {
        let mut sql = format!(
            r#"SELECT * FROM "{table}" WHERE {clause} ORDER BY id ASC"#,
            table = self.table,
            clause = self.runnable_clause(stage, true),
        );
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query_as::<_, ItemRecord>(&sql).bind(retry_limit as i64);
        if let Some(limit) = limit {
            query = query.bind(limit as i64);
        }

        Ok(query.fetch_all(&self.read).await?)
    }

    async fn count_eligible_for_run(&self, stage: Stage, retry_limit: u32) -> Result<u64> {
        let sql = format!(
            r#"SELECT COUNT(*) FROM "{table}" WHERE {clause}"#,
            table = self.table,
            clause = self.runnable_clause(stage, true),
        );
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(retry_limit as i64)
            .fetch_one(&self.read)
            .await?;
        Ok(count as u64)
    }

    async fn set_stage_status(
        &self,
        item_id: &str,
        stage: Stage,
        status: StageStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let sql = format!(
            r#"
            UPDATE "{table}" SET
                {status_col} = ?,
                {attempts_col} = {attempts_col} + (CASE WHEN ? = 'FAILED' THEN 1 ELSE 0 END),
                {result_col} = COALESCE(?, {result_col}),
                {error_col} = ?,
                updated_at = ?
            WHERE item_id = ?
            "#,
            table = self.table,
            status_col = stage.status_column(),
            attempts_col = stage.attempts_column(),
            result_col = stage.result_column(),
            error_col = stage.error_column(),
        );

        let affected = retry_on_sqlite_busy("set_stage_status", || async {
            let done = sqlx::query(&sql)
                .bind(status.as_str())
                .bind(status.as_str())
                .bind(result)
                .bind(error)
                .bind(&now)
                .bind(item_id)
                .execute(&self.write)
                .await?;
            Ok(done.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(Error::ItemNotFound(item_id.to_string()));
        }
        Ok(())
    }

    async fn reset_stage(
        &self,
        stage: Stage,
        from: &[StageStatus],
        to: StageStatus,
        clear_attempts: bool,
    ) -> Result<u64> {
        if from.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().to_rfc3339();
        let placeholders = vec!["?"; from.len()].join(", ");
        let clear = if clear_attempts {
            format!(
                ", {attempts} = 0, {error} = NULL",
                attempts = stage.attempts_column(),
                error = stage.error_column(),
            )
        } else {
            String::new()
        };
        let sql = format!(
            r#"UPDATE "{table}" SET {status} = ?, updated_at = ?{clear} WHERE {status} IN ({placeholders})"#,
            table = self.table,
            status = stage.status_column(),
        );

        retry_on_sqlite_busy("reset_stage", || async {
            let mut query = sqlx::query(&sql).bind(to.as_str()).bind(&now);
            for status in from {
                query = query.bind(status.as_str());
            }
            let done = query.execute(&self.write).await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn count_by_status(&self, stage: Stage) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            r#"SELECT {status} AS status, COUNT(*) AS n FROM "{table}" GROUP BY {status} ORDER BY {status}"#,
            table = self.table,
            status = stage.status_column(),
        );
        Ok(sqlx::query_as::<_, (String, i64)>(&sql)
            .fetch_all(&self.read)
            .await?)
    }

    async fn count_items(&self) -> Result<u64> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, self.table);
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.read).await?;
        Ok(count as u64)
    }

    fn table(&self) -> &str {
        &self.table
    }
}
