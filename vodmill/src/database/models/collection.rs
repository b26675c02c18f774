//! Source collection models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A source collection (channel, playlist) the discovery stage lists.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: i64,
    pub collection_id: String,
    pub title: Option<String>,
    pub source_url: String,
    /// ISO 8601 timestamp of registration
    pub added_at: String,
    /// ISO 8601 timestamp of the last successful listing
    pub last_listed_at: Option<String>,
}

/// Registration data for a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCollection {
    pub collection_id: String,
    pub title: Option<String>,
    pub source_url: String,
}

impl NewCollection {
    pub fn new(collection_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            title: None,
            source_url: source_url.into(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}
