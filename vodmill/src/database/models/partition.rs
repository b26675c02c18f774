//! Job partition registry models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

/// One registered job partition. The physical item table is
/// `items_{name}`; `name` is `{job_name}_{yyyymmdd_hhmmss}`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub id: i64,
    pub name: String,
    pub job_name: String,
    /// ISO 8601 timestamp
    pub created_at: String,
    /// JSON-encoded [`SelectionPredicate`]
    pub predicate: String,
}

impl PartitionRecord {
    /// Physical table name backing this partition.
    pub fn table_name(&self) -> String {
        format!("items_{}", self.name)
    }

    pub fn predicate(&self) -> Result<SelectionPredicate> {
        Ok(serde_json::from_str(&self.predicate)?)
    }
}

/// Which catalog rows a new partition snapshots.
///
/// Empty collections and no keyword means the whole catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionPredicate {
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_keyword: Option<String>,
}

impl SelectionPredicate {
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty() && self.title_keyword.is_none()
    }
}

/// Job names end up inside SQL identifiers, so the character set is strict.
pub fn validate_job_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_job_name() {
        assert!(validate_job_name("weekly-digest_2").is_ok());
        assert!(validate_job_name("").is_err());
        assert!(validate_job_name("bad name").is_err());
        assert!(validate_job_name("drop;--").is_err());
        assert!(validate_job_name("items\"").is_err());
    }

    #[test]
    fn test_predicate_json_round_trip() {
        let predicate = SelectionPredicate {
            collections: vec!["chan-a".into()],
            title_keyword: Some("keynote".into()),
        };
        let json = serde_json::to_string(&predicate).unwrap();
        let back: SelectionPredicate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.collections, vec!["chan-a".to_string()]);
        assert_eq!(back.title_keyword.as_deref(), Some("keynote"));
        assert!(!back.is_empty());
        assert!(SelectionPredicate::default().is_empty());
    }
}
