//! Two clock-driven loops: fetch cycles at every anchor, post-processing a
//! fixed delay after each anchor. Both stop on the shutdown signal; the
//! fetch side then waits for its background retries to finish.

pub mod anchor;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::config::zone::ReferenceZone;
use crate::fetch::{FetchOrchestrator, RetryReport};
use crate::postprocess::PostProcessor;
use crate::shutdown::Shutdown;
use anchor::AnchorSet;

pub struct Scheduler {
    orchestrator: Arc<FetchOrchestrator>,
    post: Arc<PostProcessor>,
    anchors: AnchorSet,
    zone: ReferenceZone,
    post_delay: ChronoDuration,
    run_on_startup: bool,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<FetchOrchestrator>,
        post: Arc<PostProcessor>,
        anchors: AnchorSet,
        zone: ReferenceZone,
    ) -> Self {
        Self {
            orchestrator,
            post,
            anchors,
            zone,
            post_delay: ChronoDuration::minutes(15),
            run_on_startup: false,
        }
    }

    pub fn with_post_delay(mut self, d: ChronoDuration) -> Self {
        self.post_delay = d;
        self
    }

    /// Run one fetch cycle immediately, before waiting for the first anchor.
    pub fn run_on_startup(mut self, yes: bool) -> Self {
        self.run_on_startup = yes;
        self
    }

    /// Runs until `shutdown` fires, then drains outstanding retries and
    /// returns their reports.
    pub async fn run(self, shutdown: Shutdown) -> Vec<RetryReport> {
        let post_task = tokio::spawn(post_loop(
            self.post.clone(),
            self.anchors.clone(),
            self.zone,
            self.post_delay,
            shutdown.clone(),
        ));

        if self.run_on_startup && !shutdown.is_triggered() {
            tracing::info!(target: "scheduler", "Running startup fetch cycle");
            self.orchestrator.run_cycle(Utc::now()).await;
        }

        let mut floor: Option<DateTime<Utc>> = None;
        while !shutdown.is_triggered() {
            let now = Utc::now();
            let from = floor.map_or(now, |f| now.max(f));
            let anchor = self.anchors.next_anchor(from, &self.zone);
            tracing::info!(target: "scheduler", next_run = %anchor, "Next fetch cycle scheduled");

            if !sleep_until(anchor, &shutdown).await {
                break;
            }
            self.orchestrator.run_cycle(Utc::now().max(anchor)).await;
            // never fire the same anchor twice, even if the clock lags
            floor = Some(anchor + ChronoDuration::seconds(1));
        }

        tracing::info!(target: "scheduler", "Shutdown requested, draining async retries");
        let reports = self.orchestrator.coordinator().drain().await;
        if let Err(e) = post_task.await {
            tracing::error!(target: "scheduler", error = %e, "Post-process loop failed");
        }
        tracing::info!(target: "scheduler", drained = reports.len(), "Scheduler stopped");
        reports
    }
}

async fn post_loop(
    post: Arc<PostProcessor>,
    anchors: AnchorSet,
    zone: ReferenceZone,
    delay: ChronoDuration,
    shutdown: Shutdown,
) {
    if post.job_count() == 0 {
        tracing::info!(target: "scheduler", "No post-process jobs configured");
        return;
    }
    let mut floor: Option<DateTime<Utc>> = None;
    while !shutdown.is_triggered() {
        let now = Utc::now();
        let from = floor.map_or(now, |f| now.max(f));
        let at = anchors.next_offset_anchor(from, &zone, delay);
        tracing::info!(target: "scheduler", next_run = %at, "Next post-process cycle scheduled");

        if !sleep_until(at, &shutdown).await {
            break;
        }
        post.run(Utc::now().max(at)).await;
        floor = Some(at + ChronoDuration::seconds(1));
    }
}

/// Sleep until the wall-clock instant `at`. Returns false if shutdown fired
/// first.
async fn sleep_until(at: DateTime<Utc>, shutdown: &Shutdown) -> bool {
    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::select! {
        biased;
        _ = shutdown.triggered() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}
