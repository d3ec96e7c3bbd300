//! Turns raw fetch results into `processed_data` records. Runs on its own
//! schedule, a fixed delay after each fetch anchor.

pub mod article_list;

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::zone::ReferenceZone;
use crate::store::{partition_name, ContentQuery, ProcessedRecord, ResultStore, StoredResult};
use article_list::{ArticleList, ArticleListConfig};

fn default_true() -> bool {
    true
}

/// One configured post-processing job, matched against raw results by label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProcessJob {
    pub source: String,
    pub category: String,
    #[serde(alias = "infoType")]
    pub info_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub transform: TransformConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformConfig {
    ArticleList(ArticleListConfig),
}

impl TransformConfig {
    pub fn build(&self) -> Arc<dyn Transform> {
        match self {
            Self::ArticleList(cfg) => Arc::new(ArticleList::new(cfg.clone())),
        }
    }
}

/// Maps one stored raw payload to the processed payload.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, raw: &StoredResult) -> Result<Map<String, Value>>;
}

struct Registered {
    source: String,
    category: String,
    info_type: String,
    transform: Arc<dyn Transform>,
}

pub struct PostProcessor {
    store: Arc<dyn ResultStore>,
    zone: ReferenceZone,
    partition_prefix: String,
    jobs: Vec<Registered>,
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "postprocess_docs_total",
            "Raw results turned into processed records."
        );
    });
}

impl PostProcessor {
    /// Disabled jobs are dropped here and never run.
    pub fn new(
        store: Arc<dyn ResultStore>,
        zone: ReferenceZone,
        partition_prefix: impl Into<String>,
        jobs: &[PostProcessJob],
    ) -> Self {
        ensure_metrics_described();
        let mut me = Self {
            store,
            zone,
            partition_prefix: partition_prefix.into(),
            jobs: Vec::new(),
        };
        for job in jobs.iter().filter(|j| j.enabled) {
            me = me.with_transform(&job.source, &job.category, &job.info_type, job.transform.build());
        }
        me
    }

    pub fn with_transform(
        mut self,
        source: &str,
        category: &str,
        info_type: &str,
        transform: Arc<dyn Transform>,
    ) -> Self {
        self.jobs.push(Registered {
            source: source.to_string(),
            category: category.to_string(),
            info_type: info_type.to_string(),
            transform,
        });
        self
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Process every unprocessed result in the partition for `now`'s local
    /// day. Returns the number of records written.
    pub async fn run(&self, now: DateTime<Utc>) -> usize {
        let partition = partition_name(&self.partition_prefix, self.zone.local_date(now));
        let mut total = 0;
        for job in &self.jobs {
            total += self.run_job(job, &partition).await;
        }
        tracing::info!(target: "postprocess", partition = %partition, processed = total, "Post-process cycle completed");
        total
    }

    async fn run_job(&self, job: &Registered, partition: &str) -> usize {
        let query = ContentQuery {
            source: Some(job.source.clone()),
            category: Some(job.category.clone()),
            info_type: Some(job.info_type.clone()),
            processed: Some(false),
            page: None,
        };
        let docs = match self.store.find(partition, &query).await {
            Ok((_, docs)) => docs,
            Err(e) => {
                tracing::error!(
                    target: "postprocess",
                    partition = %partition,
                    source = %job.source,
                    error = %format!("{e:#}"),
                    "Failed to query unprocessed results"
                );
                return 0;
            }
        };

        let mut done = 0;
        for raw in docs {
            match self.process_one(job, partition, &raw).await {
                Ok(()) => done += 1,
                Err(e) => tracing::warn!(
                    target: "postprocess",
                    partition = %partition,
                    raw_id = raw.id,
                    transform = job.transform.name(),
                    error = %format!("{e:#}"),
                    "Failed to process document"
                ),
            }
        }
        if done > 0 {
            counter!("postprocess_docs_total").increment(done as u64);
            tracing::info!(
                target: "postprocess",
                source = %job.source,
                category = %job.category,
                info_type = %job.info_type,
                processed = done,
                "Data processing completed"
            );
        }
        done
    }

    async fn process_one(&self, job: &Registered, partition: &str, raw: &StoredResult) -> Result<()> {
        let data = job.transform.apply(raw)?;
        let now = Utc::now();
        let record = ProcessedRecord {
            source: raw.result.source.clone(),
            category: raw.result.category.clone(),
            info_type: raw.result.info_type.clone(),
            date: raw.result.date.clone(),
            processed_at: now,
            data,
            raw_partition: partition.to_string(),
            raw_id: raw.id,
        };
        self.store.save_processed(&record).await?;
        self.store.mark_processed(partition, raw.id, now).await?;
        Ok(())
    }
}
