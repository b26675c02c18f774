//! Catalog seeding: list source collections and upsert their items.

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::database::models::{CollectionRecord, NewItem};
use crate::database::repositories::{CollectionRepository, ItemStore};
use crate::{Error, Result};

/// One listed entry from a source collection.
#[derive(Debug, Clone)]
pub struct DiscoveredItem {
    pub item_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<String>,
}

/// Lists the items of one collection.
#[async_trait]
pub trait SourceLister: Send + Sync {
    async fn list(&self, collection: &CollectionRecord) -> Result<Vec<DiscoveredItem>>;
}

/// Shells out to a yt-dlp-compatible tool in flat-playlist mode and parses
/// the JSON dump. Works for channels and playlists alike; the collection's
/// URL decides what gets listed.
pub struct CommandSourceLister {
    fetcher: String,
}

impl CommandSourceLister {
    pub fn new(fetcher: impl Into<String>) -> Self {
        Self {
            fetcher: fetcher.into(),
        }
    }
}

#[async_trait]
impl SourceLister for CommandSourceLister {
    async fn list(&self, collection: &CollectionRecord) -> Result<Vec<DiscoveredItem>> {
        let output = Command::new(&self.fetcher)
            .args(["--flat-playlist", "--dump-single-json"])
            .arg(&collection.source_url)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::tool(&self.fetcher, "binary not found on PATH")
                }
                _ => Error::transient(format!("failed to spawn {}: {err}", self.fetcher)),
            })?;

        if !output.status.success() {
            let excerpt = super::workers::stderr_excerpt(&output.stderr);
            return Err(Error::transient(format!(
                "listing {} failed with {}: {excerpt}",
                collection.collection_id,
                output.status.code().unwrap_or(-1)
            )));
        }

        let dump: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|err| Error::transient(format!("unparseable listing dump: {err}")))?;

        let entries = dump
            .get("entries")
            .and_then(|e| e.as_array())
            .cloned()
            .unwrap_or_default();

        let mut items = Vec::with_capacity(entries.len());
        for entry in &entries {
            let Some(item_id) = entry.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            items.push(DiscoveredItem {
                item_id: item_id.to_string(),
                title: entry
                    .get("title")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                url: entry
                    .get("url")
                    .or_else(|| entry.get("webpage_url"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                published_at: entry
                    .get("upload_date")
                    .and_then(|v| v.as_str())
                    .map(normalize_upload_date),
            });
        }
        Ok(items)
    }
}

/// yt-dlp reports dates as `YYYYMMDD`; store them dashed.
fn normalize_upload_date(raw: &str) -> String {
    if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
        format!("{}-{}-{}", &raw[..4], &raw[4..6], &raw[6..8])
    } else {
        raw.to_string()
    }
}

/// Aggregate counts for one discovery pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiscoveryStats {
    /// Collections listed without error.
    pub collections: u64,
    /// Collections whose listing failed (logged, not fatal).
    pub failed_collections: u64,
    /// Entries seen across all listings.
    pub listed: u64,
    /// Entries upserted into the catalog.
    pub upserted: u64,
}

/// List every registered collection and upsert its items into the catalog.
///
/// A failed listing affects only its own collection; systemic trouble (a
/// missing tool, a broken catalog) still propagates. `limit` caps upserts
/// per collection.
pub async fn run_discovery(
    catalog: &dyn ItemStore,
    collections: &dyn CollectionRepository,
    lister: &dyn SourceLister,
    limit: Option<u32>,
) -> Result<DiscoveryStats> {
    let mut stats = DiscoveryStats::default();

    for collection in collections.list_collections().await? {
        let listed = match lister.list(&collection).await {
            Ok(listed) => listed,
            Err(err) if err.is_transient() => {
                warn!(
                    collection = %collection.collection_id,
                    "Listing failed, moving on: {err}"
                );
                stats.failed_collections += 1;
                continue;
            }
            Err(err) => return Err(err),
        };

        stats.collections += 1;
        stats.listed += listed.len() as u64;

        let mut upserted_here: u64 = 0;
        for discovered in listed {
            if let Some(limit) = limit
                && upserted_here >= u64::from(limit)
            {
                break;
            }
            let Some(url) = discovered.url else {
                warn!(item = %discovered.item_id, "Listing entry has no URL, skipping");
                continue;
            };

            let mut item = NewItem::new(&discovered.item_id, url)
                .with_collection(&collection.collection_id);
            if let Some(title) = discovered.title {
                item = item.with_title(title);
            }
            if let Some(published_at) = discovered.published_at {
                item = item.with_published_at(published_at);
            }

            catalog.upsert_item(&item).await?;
            upserted_here += 1;
        }

        stats.upserted += upserted_here;
        collections.mark_listed(&collection.collection_id).await?;
        info!(
            collection = %collection.collection_id,
            upserted = upserted_here,
            "Collection listed"
        );
    }

    info!(
        collections = stats.collections,
        failed = stats.failed_collections,
        listed = stats.listed,
        upserted = stats.upserted,
        "Discovery finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_upload_date() {
        assert_eq!(normalize_upload_date("20260115"), "2026-01-15");
        assert_eq!(normalize_upload_date("2026-01-15"), "2026-01-15");
        assert_eq!(normalize_upload_date("unknown"), "unknown");
    }
}
