use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;

use crate::config::zone::ReferenceZone;
use crate::fetch::retry::{DispatchOutcome, RetryCoordinator};
use crate::fetch::types::FetchJob;
use crate::store::{partition_name, ResultStore, SourceRegistry};

/// Tally of one fetch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub partition: Option<String>,
    pub dispatched: usize,
    pub stored: usize,
    pub retrying: usize,
    pub gave_up: usize,
    pub cancelled: usize,
}

/// Per-cycle driver: reads the registry, prepares the day's partition and
/// hands every enabled source to the retry coordinator.
pub struct FetchOrchestrator {
    registry: Arc<dyn SourceRegistry>,
    store: Arc<dyn ResultStore>,
    coordinator: Arc<RetryCoordinator>,
    zone: ReferenceZone,
    partition_prefix: String,
    concurrency: usize,
}

impl FetchOrchestrator {
    pub fn new(
        registry: Arc<dyn SourceRegistry>,
        store: Arc<dyn ResultStore>,
        coordinator: Arc<RetryCoordinator>,
        zone: ReferenceZone,
        partition_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            coordinator,
            zone,
            partition_prefix: partition_prefix.into(),
            concurrency: 4,
        }
    }

    /// Max first attempts in flight at once. 1 dispatches strictly in order.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn coordinator(&self) -> &Arc<RetryCoordinator> {
        &self.coordinator
    }

    /// Run one cycle for the instant `now`. Never fails: registry or storage
    /// problems are logged and end the cycle early.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleSummary {
        counter!("fetch_cycles_total").increment(1);
        tracing::info!(target: "fetch", execution_time = %now, "Starting scheduled API fetch execution");

        let mut summary = CycleSummary::default();
        self.coordinator.reap_finished();

        let sources = match self.registry.enabled_sources().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(target: "fetch", error = %format!("{e:#}"), "Failed to find enabled APIs");
                return summary;
            }
        };

        let date = self.zone.local_date(now);
        let partition = partition_name(&self.partition_prefix, date);
        if let Err(e) = self.store.ensure_partition(&partition).await {
            tracing::error!(target: "fetch", partition = %partition, error = %format!("{e:#}"), "Failed to ensure partition");
            return summary;
        }
        summary.partition = Some(partition.clone());

        let date = date.format("%Y-%m-%d").to_string();
        let jobs = sources.into_iter().map(|def| {
            tracing::info!(
                target: "fetch",
                source = %def.source,
                category = %def.category,
                url = %def.url,
                "Processing API"
            );
            FetchJob {
                def: Arc::new(def),
                partition: partition.clone(),
                date: date.clone(),
            }
        });

        let outcomes: Vec<DispatchOutcome> = stream::iter(jobs)
            .map(|job| self.coordinator.dispatch(job))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for o in outcomes {
            summary.dispatched += 1;
            match o {
                DispatchOutcome::Stored => summary.stored += 1,
                DispatchOutcome::RetryScheduled => summary.retrying += 1,
                DispatchOutcome::GaveUp => summary.gave_up += 1,
                DispatchOutcome::Cancelled => summary.cancelled += 1,
            }
        }

        gauge!("fetch_last_cycle_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            target: "fetch",
            execution_time = %now,
            partition = %partition,
            processed_apis = summary.dispatched,
            stored = summary.stored,
            retrying = summary.retrying,
            gave_up = summary.gave_up,
            "Scheduled API fetch execution completed"
        );
        summary
    }
}
