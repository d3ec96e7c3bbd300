// src/store/memory.rs
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{ContentQuery, ProcessedRecord, ResultStore, SourceRegistry, StoredResult};
use crate::fetch::types::{FetchResult, SourceDefinition};

/// In-memory registry + result store. Backs tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    sources: Vec<SourceDefinition>,
    partitions: BTreeMap<String, Vec<StoredResult>>,
    processed: Vec<ProcessedRecord>,
    next_id: i64,
    failing_writes: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: Vec<SourceDefinition>) -> Self {
        let store = Self::new();
        store.inner.lock().unwrap().sources = sources;
        store
    }

    /// The next `n` calls to `insert` fail with a storage error.
    pub fn fail_next_writes(&self, n: u32) {
        self.inner.lock().unwrap().failing_writes = n;
    }

    pub fn partitions(&self) -> Vec<String> {
        self.inner.lock().unwrap().partitions.keys().cloned().collect()
    }

    pub fn documents(&self, partition: &str) -> Vec<StoredResult> {
        self.inner
            .lock()
            .unwrap()
            .partitions
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    pub fn processed_records(&self) -> Vec<ProcessedRecord> {
        self.inner.lock().unwrap().processed.clone()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }
}

#[async_trait]
impl SourceRegistry for MemoryStore {
    async fn enabled_sources(&self) -> Result<Vec<SourceDefinition>> {
        Ok(self
            .lock()?
            .sources
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn all_sources(&self) -> Result<Vec<SourceDefinition>> {
        Ok(self.lock()?.sources.clone())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn ensure_partition(&self, partition: &str) -> Result<()> {
        super::check_partition_name(partition)?;
        self.lock()?
            .partitions
            .entry(partition.to_string())
            .or_default();
        Ok(())
    }

    async fn insert(&self, partition: &str, result: &FetchResult) -> Result<i64> {
        let mut inner = self.lock()?;
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            bail!("injected write failure");
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let docs = inner
            .partitions
            .get_mut(partition)
            .ok_or_else(|| anyhow!("partition {partition} does not exist"))?;
        docs.push(StoredResult {
            id,
            result: result.clone(),
            processed_at: None,
        });
        Ok(id)
    }

    async fn find(
        &self,
        partition: &str,
        query: &ContentQuery,
    ) -> Result<(u64, Vec<StoredResult>)> {
        let inner = self.lock()?;
        let Some(docs) = inner.partitions.get(partition) else {
            return Ok((0, vec![]));
        };
        let mut hits: Vec<StoredResult> = docs
            .iter()
            .filter(|d| query.matches(&d.result))
            .cloned()
            .collect();
        hits.sort_by_key(|d| (d.result.created_at, d.id));
        let total = hits.len() as u64;
        let page = match query.page {
            Some(p) => hits
                .into_iter()
                .skip(p.offset() as usize)
                .take(p.limit as usize)
                .collect(),
            None => hits,
        };
        Ok((total, page))
    }

    async fn mark_processed(&self, partition: &str, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let doc = inner
            .partitions
            .get_mut(partition)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
            .ok_or_else(|| anyhow!("document {id} not found in {partition}"))?;
        doc.result.processed = true;
        doc.processed_at = Some(at);
        Ok(())
    }

    async fn save_processed(&self, record: &ProcessedRecord) -> Result<i64> {
        let mut inner = self.lock()?;
        inner.processed.push(record.clone());
        Ok(inner.processed.len() as i64)
    }
}
