//! Source collection repository.

use async_trait::async_trait;

use crate::Result;
use crate::database::models::{CollectionRecord, NewCollection};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{DbPool, WritePool};

#[async_trait]
pub trait CollectionRepository: Send + Sync {
    /// Register the collection, or refresh its metadata if already known.
    async fn upsert_collection(&self, collection: &NewCollection) -> Result<()>;
    async fn list_collections(&self) -> Result<Vec<CollectionRecord>>;
    /// Stamp a successful listing time.
    async fn mark_listed(&self, collection_id: &str) -> Result<()>;
}

/// SQLx implementation of [`CollectionRepository`].
pub struct SqlxCollectionRepository {
    read: DbPool,
    write: WritePool,
}

impl SqlxCollectionRepository {
    pub fn new(read: DbPool, write: WritePool) -> Self {
        Self { read, write }
    }
}

#[async_trait]
impl CollectionRepository for SqlxCollectionRepository {
    async fn upsert_collection(&self, collection: &NewCollection) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        retry_on_sqlite_busy("upsert_collection", || async {
            sqlx::query(
                r#"
                INSERT INTO collections (collection_id, title, source_url, added_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(collection_id) DO UPDATE SET
                    title = COALESCE(excluded.title, title),
                    source_url = excluded.source_url
                "#,
            )
            .bind(&collection.collection_id)
            .bind(&collection.title)
            .bind(&collection.source_url)
            .bind(&now)
            .execute(&self.write)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_collections(&self) -> Result<Vec<CollectionRecord>> {
        let collections =
            sqlx::query_as::<_, CollectionRecord>("SELECT * FROM collections ORDER BY id ASC")
                .fetch_all(&self.read)
                .await?;
        Ok(collections)
    }

    async fn mark_listed(&self, collection_id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        retry_on_sqlite_busy("mark_listed", || async {
            sqlx::query("UPDATE collections SET last_listed_at = ? WHERE collection_id = ?")
                .bind(&now)
                .bind(collection_id)
                .execute(&self.write)
                .await?;
            Ok(())
        })
        .await
    }
}
