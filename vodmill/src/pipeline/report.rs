//! Run reporting: CSV assembly and status tables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::workers::export::ExportRecord;
use crate::Result;
use crate::database::models::{Stage, StageStatus};
use crate::database::repositories::ItemStore;

const CSV_HEADER: &str = "item_id,title,url,published,transcript_link,summary";

/// Assemble `export_{timestamp}.csv` from every completed export record.
///
/// Workers store one JSON record per item; collecting them here after the
/// stage run means no two workers ever share a file handle. Returns the
/// path and row count, or `None` when there is nothing to export.
pub async fn write_export_csv(
    store: &dyn ItemStore,
    export_dir: &Path,
) -> Result<Option<(PathBuf, u64)>> {
    let items = store
        .get_eligible(Stage::Export, &[StageStatus::Completed], None)
        .await?;
    if items.is_empty() {
        return Ok(None);
    }

    let mut csv = String::from(CSV_HEADER);
    csv.push('\n');
    let mut rows: u64 = 0;

    for item in &items {
        let Some(raw) = item.result(Stage::Export) else {
            warn!(item = %item.item_id, "Completed export with no record, skipping row");
            continue;
        };
        let record: ExportRecord = match serde_json::from_str(raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(item = %item.item_id, "Unparseable export record, skipping row: {err}");
                continue;
            }
        };

        let fields = [
            record.item_id.as_str(),
            record.title.as_deref().unwrap_or(""),
            record.source_url.as_str(),
            record.published_at.as_deref().unwrap_or(""),
            record.transcript_link.as_deref().unwrap_or(""),
            record.summary.as_str(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
        csv.push_str(&row.join(","));
        csv.push('\n');
        rows += 1;
    }

    if rows == 0 {
        return Ok(None);
    }

    let file_name = format!(
        "export_{}.csv",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    );
    let path = export_dir.join(file_name);
    tokio::fs::write(&path, csv).await?;
    info!(path = %path.display(), rows, "Wrote export CSV");
    Ok(Some((path, rows)))
}

/// RFC 4180 quoting: quote when the field holds a comma, quote or newline;
/// double embedded quotes.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Aligned per-stage status counts for the `status` command.
pub async fn format_status_table(store: &dyn ItemStore) -> Result<String> {
    const STATUSES: [StageStatus; 6] = [
        StageStatus::Pending,
        StageStatus::InProgress,
        StageStatus::Completed,
        StageStatus::Failed,
        StageStatus::Unavailable,
        StageStatus::Skipped,
    ];

    let total = store.count_items().await?;
    let mut out = format!("table: {} ({} items)\n\n", store.table(), total);
    out.push_str(&format!("{:<15}", "stage"));
    for status in STATUSES {
        out.push_str(&format!("{:>13}", status.as_str()));
    }
    out.push('\n');

    for stage in Stage::ALL {
        let counts: HashMap<String, i64> =
            store.count_by_status(stage).await?.into_iter().collect();
        out.push_str(&format!("{:<15}", stage.as_str()));
        for status in STATUSES {
            let count = counts.get(status.as_str()).copied().unwrap_or(0);
            out.push_str(&format!("{count:>13}"));
        }
        out.push('\n');
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("two\nlines"), "\"two\nlines\"");
        assert_eq!(csv_escape(""), "");
    }
}
