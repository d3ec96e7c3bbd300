//! Attempt 1 runs inline; a retryable failure moves the rest of the attempts
//! into a background task with exponential backoff. Every background task
//! lives in one `JoinSet` so shutdown can wait for all of them.

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;

use crate::fetch::error::FetchError;
use crate::fetch::transport::Transport;
use crate::fetch::types::FetchJob;
use crate::shutdown::Shutdown;
use crate::store::ResultStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt` (>= 2): `base * 2^(attempt - 2)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2).min(31);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// What happened inside `dispatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Stored,
    RetryScheduled,
    GaveUp,
    Cancelled,
}

/// How a background retry task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Stored { attempt: u32 },
    GaveUp { attempts: u32 },
    Cancelled { next_attempt: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub name: String,
    pub source: String,
    pub outcome: RetryOutcome,
}

/// Everything one attempt needs; cloned into each background task.
#[derive(Clone)]
struct Attempter {
    transport: Arc<dyn Transport>,
    store: Arc<dyn ResultStore>,
    shutdown: Shutdown,
}

impl Attempter {
    async fn attempt(&self, job: &FetchJob, n: u32) -> Result<(), FetchError> {
        counter!("fetch_attempts_total").increment(1);
        let res = tokio::select! {
            biased;
            _ = self.shutdown.triggered() => Err(FetchError::Cancelled),
            r = super::run_attempt(self.transport.as_ref(), self.store.as_ref(), job, n) => r,
        };
        match &res {
            Ok(()) => counter!("fetch_success_total").increment(1),
            Err(FetchError::Cancelled) => {}
            Err(e) => {
                counter!("fetch_failures_total", "kind" => e.kind()).increment(1);
                tracing::warn!(
                    target: "fetch",
                    source = %job.def.source,
                    category = %job.def.category,
                    url = %job.def.url,
                    attempt = n,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Fetch attempt failed"
                );
            }
        }
        res
    }
}

/// Counts a retry task as running until it is dropped, finished or not.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("fetch_retry_tasks_inflight").set(n as f64);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let n = self.0.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("fetch_retry_tasks_inflight").set(n as f64);
    }
}

pub struct RetryCoordinator {
    attempter: Attempter,
    policy: RetryPolicy,
    tasks: Mutex<JoinSet<RetryReport>>,
    running: Arc<AtomicUsize>,
}

impl RetryCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ResultStore>,
        policy: RetryPolicy,
        shutdown: Shutdown,
    ) -> Self {
        super::ensure_metrics_described();
        Self {
            attempter: Attempter {
                transport,
                store,
                shutdown,
            },
            policy,
            tasks: Mutex::new(JoinSet::new()),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run attempt 1 now. On a retryable failure, schedule the remaining
    /// attempts in the background and return without waiting for them.
    pub async fn dispatch(&self, job: FetchJob) -> DispatchOutcome {
        match self.attempter.attempt(&job, 1).await {
            Ok(()) => DispatchOutcome::Stored,
            Err(FetchError::Cancelled) => DispatchOutcome::Cancelled,
            Err(e) if e.is_retryable() && self.policy.max_attempts > 1 => {
                self.spawn_retries(job);
                DispatchOutcome::RetryScheduled
            }
            Err(e) => {
                counter!("fetch_giveup_total").increment(1);
                tracing::error!(
                    target: "fetch",
                    source = %job.def.source,
                    category = %job.def.category,
                    error = %e,
                    "Giving up after first attempt"
                );
                DispatchOutcome::GaveUp
            }
        }
    }

    fn spawn_retries(&self, job: FetchJob) {
        let attempter = self.attempter.clone();
        let policy = self.policy;
        let guard = InFlight::enter(&self.running);
        self.lock_tasks().spawn(async move {
            let _guard = guard;
            retry_loop(attempter, policy, job).await
        });
    }

    /// Background tasks still retrying. Finished tasks drop out immediately,
    /// before they are reaped.
    pub fn in_flight(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Background tasks not yet joined (finished ones included until reaped).
    pub fn tracked(&self) -> usize {
        self.lock_tasks().len()
    }

    /// Join tasks that already finished, without waiting for running ones.
    pub fn reap_finished(&self) -> Vec<RetryReport> {
        let mut tasks = self.lock_tasks();
        let mut out = Vec::new();
        while let Some(res) = tasks.try_join_next() {
            match res {
                Ok(report) => out.push(report),
                Err(e) => tracing::error!(target: "fetch", error = %e, "Retry task failed"),
            }
        }
        out
    }

    /// Wait for every background task to finish. Used on shutdown, after the
    /// signal fired, so pending backoffs end immediately.
    pub async fn drain(&self) -> Vec<RetryReport> {
        let mut reports = Vec::new();
        loop {
            let mut set = std::mem::take(&mut *self.lock_tasks());
            if set.is_empty() {
                break;
            }
            while let Some(res) = set.join_next().await {
                match res {
                    Ok(report) => reports.push(report),
                    Err(e) => tracing::error!(target: "fetch", error = %e, "Retry task failed"),
                }
            }
        }
        reports
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<RetryReport>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn retry_loop(attempter: Attempter, policy: RetryPolicy, job: FetchJob) -> RetryReport {
    let report = |outcome| RetryReport {
        name: job.def.name.clone(),
        source: job.def.source.clone(),
        outcome,
    };

    for n in 2..=policy.max_attempts {
        let delay = policy.delay_before(n);
        tracing::info!(
            target: "fetch",
            source = %job.def.source,
            category = %job.def.category,
            attempt = n,
            max_attempts = policy.max_attempts,
            delay_secs = delay.as_secs(),
            "Async retry scheduled"
        );

        tokio::select! {
            biased;
            _ = attempter.shutdown.triggered() => {
                tracing::info!(
                    target: "fetch",
                    source = %job.def.source,
                    category = %job.def.category,
                    attempt = n,
                    "Shutdown requested, stopping async retries"
                );
                return report(RetryOutcome::Cancelled { next_attempt: n });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match attempter.attempt(&job, n).await {
            Ok(()) => {
                tracing::info!(
                    target: "fetch",
                    source = %job.def.source,
                    category = %job.def.category,
                    attempt = n,
                    "Async retry succeeded"
                );
                return report(RetryOutcome::Stored { attempt: n });
            }
            Err(FetchError::Cancelled) => {
                return report(RetryOutcome::Cancelled { next_attempt: n });
            }
            Err(e) if e.is_retryable() => {}
            Err(e) => {
                counter!("fetch_giveup_total").increment(1);
                tracing::error!(
                    target: "fetch",
                    source = %job.def.source,
                    category = %job.def.category,
                    attempt = n,
                    error = %e,
                    "Terminal failure during async retry, giving up"
                );
                return report(RetryOutcome::GaveUp { attempts: n });
            }
        }
    }

    counter!("fetch_giveup_total").increment(1);
    tracing::error!(
        target: "fetch",
        source = %job.def.source,
        category = %job.def.category,
        max_attempts = policy.max_attempts,
        "Async retry max attempts exceeded, giving up"
    );
    report(RetryOutcome::GaveUp {
        attempts: policy.max_attempts,
    })
}
