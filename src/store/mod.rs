//! Storage seams: the source registry the fetch cycle reads from and the
//! day-partitioned result store it writes into.

pub mod memory;
pub mod seed;
pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fetch::types::{FetchResult, SourceDefinition};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const DEFAULT_PARTITION_PREFIX: &str = "content";

/// `<prefix>_<YYYY>_<MM>_<DD>` for a reference-timezone calendar day.
pub fn partition_name(prefix: &str, date: NaiveDate) -> String {
    format!("{prefix}_{}", date.format("%Y_%m_%d"))
}

/// Partition names end up as table names, so only `[A-Za-z0-9_]` passes.
pub fn check_partition_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ok {
        bail!("invalid partition name {name:?}");
    }
    Ok(())
}

/// A fetch result as read back, with its row id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResult {
    pub id: i64,
    #[serde(flatten)]
    pub result: FetchResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Output of a post-processing transform, kept in `processed_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub source: String,
    pub category: String,
    pub info_type: String,
    pub date: String,
    pub processed_at: DateTime<Utc>,
    pub data: Map<String, Value>,
    pub raw_partition: String,
    pub raw_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

/// Filter over one partition. `None` fields match everything; `page: None`
/// returns all matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentQuery {
    pub source: Option<String>,
    pub category: Option<String>,
    pub info_type: Option<String>,
    pub processed: Option<bool>,
    pub page: Option<Page>,
}

impl ContentQuery {
    pub fn matches(&self, r: &FetchResult) -> bool {
        self.source.as_deref().map_or(true, |s| s == r.source)
            && self.category.as_deref().map_or(true, |c| c == r.category)
            && self.info_type.as_deref().map_or(true, |i| i == r.info_type)
            && self.processed.map_or(true, |p| p == r.processed)
    }
}

/// Read-only view of fetch targets.
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    async fn enabled_sources(&self) -> Result<Vec<SourceDefinition>>;
    async fn all_sources(&self) -> Result<Vec<SourceDefinition>>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create the partition and its indexes. Safe to call every cycle.
    async fn ensure_partition(&self, partition: &str) -> Result<()>;
    /// Append one result; returns its id.
    async fn insert(&self, partition: &str, result: &FetchResult) -> Result<i64>;
    /// Returns (total matches, requested page) ordered by `created_at`.
    /// A partition that was never created reads as empty.
    async fn find(&self, partition: &str, query: &ContentQuery)
        -> Result<(u64, Vec<StoredResult>)>;
    async fn mark_processed(&self, partition: &str, id: i64, at: DateTime<Utc>) -> Result<()>;
    async fn save_processed(&self, record: &ProcessedRecord) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_name_uses_underscored_date() {
        let d = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(partition_name("content", d), "content_2025_03_07");
        assert!(check_partition_name("content_2025_03_07").is_ok());
    }

    #[test]
    fn rejects_partition_names_that_are_not_identifiers() {
        assert!(check_partition_name("").is_err());
        assert!(check_partition_name("1abc").is_err());
        assert!(check_partition_name("content; DROP TABLE apis").is_err());
        assert!(check_partition_name("content-2025").is_err());
    }

    #[test]
    fn page_offset_starts_at_zero() {
        assert_eq!(Page { page: 1, limit: 20 }.offset(), 0);
        assert_eq!(Page { page: 3, limit: 20 }.offset(), 40);
        assert_eq!(Page { page: 0, limit: 20 }.offset(), 0);
    }
}
