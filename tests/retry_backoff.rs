// tests/retry_backoff.rs
//
// Retry coordinator behaviour under tokio's paused clock: backoff timing,
// give-up rules and cancellation. Uses the scripted transport and the
// in-memory store so no real I/O blocks the virtual clock.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use api_fetcher::fetch::request::OutboundRequest;
use api_fetcher::fetch::transport::{RawResponse, ScriptedTransport, Step, Transport};
use api_fetcher::fetch::types::FetchJob;
use api_fetcher::fetch::{DispatchOutcome, FetchError, RetryCoordinator, RetryOutcome, RetryPolicy, SourceDefinition};
use api_fetcher::shutdown::{self, ShutdownTrigger};
use api_fetcher::store::{ContentQuery, MemoryStore, ResultStore};

const PARTITION: &str = "content_2025_09_06";

fn def(extra: serde_json::Value) -> SourceDefinition {
    let mut base = json!({
        "name": "hot-list",
        "method": "GET",
        "url": "http://api.test/hot",
        "source": "news",
        "category": "general",
        "info_type": "trending"
    });
    if let (Some(b), Some(e)) = (base.as_object_mut(), extra.as_object()) {
        b.extend(e.clone());
    }
    serde_json::from_value(base).expect("valid definition")
}

fn job(def: SourceDefinition) -> FetchJob {
    FetchJob {
        def: Arc::new(def),
        partition: PARTITION.to_string(),
        date: "2025-09-06".to_string(),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    transport: Arc<ScriptedTransport>,
    coordinator: RetryCoordinator,
    trigger: ShutdownTrigger,
}

async fn harness(steps: Vec<Step>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.ensure_partition(PARTITION).await.unwrap();
    let transport = Arc::new(ScriptedTransport::new(steps));
    let (trigger, shutdown) = shutdown::channel();
    let coordinator = RetryCoordinator::new(
        transport.clone(),
        store.clone(),
        RetryPolicy::default(),
        shutdown,
    );
    Harness {
        store,
        transport,
        coordinator,
        trigger,
    }
}

fn transport_err() -> Step {
    Step::TransportError("connection reset".into())
}

#[tokio::test(start_paused = true)]
async fn first_attempt_success_stores_once_without_background_work() {
    let h = harness(vec![Step::json(json!({"code": 0, "data": {"k": "v"}}))]).await;

    let out = h.coordinator.dispatch(job(def(json!({})))).await;

    assert_eq!(out, DispatchOutcome::Stored);
    assert_eq!(h.coordinator.tracked(), 0);
    assert_eq!(h.transport.calls(), 1);
    let docs = h.store.documents(PARTITION);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].result.data.get("k"), Some(&json!("v")));
    assert!(!docs[0].result.processed);
}

#[tokio::test(start_paused = true)]
async fn four_failures_then_success_waits_the_full_backoff() {
    let mut steps = vec![transport_err(); 4];
    steps.push(Step::json(json!({"data": {"attempt": 5}})));
    let h = harness(steps).await;
    let start = Instant::now();

    let out = h.coordinator.dispatch(job(def(json!({})))).await;
    assert_eq!(out, DispatchOutcome::RetryScheduled);
    assert_eq!(h.coordinator.tracked(), 1);

    let reports = h.coordinator.drain().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, RetryOutcome::Stored { attempt: 5 });
    assert_eq!(h.transport.calls(), 5);

    // 15 + 30 + 60 + 120 seconds of backoff
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(225), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(226), "elapsed {elapsed:?}");

    let docs = h.store.documents(PARTITION);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].result.data.get("attempt"), Some(&json!(5)));
    assert_eq!(docs[0].result.date, "2025-09-06");
}

#[tokio::test(start_paused = true)]
async fn required_field_mismatch_is_retried_until_exhausted() {
    let h = harness(vec![Step::json(json!({"status": "error", "data": {}}))]).await;
    let d = def(json!({"required": {"status": "ok"}}));

    assert_eq!(h.coordinator.dispatch(job(d)).await, DispatchOutcome::RetryScheduled);
    let reports = h.coordinator.drain().await;

    assert_eq!(reports[0].outcome, RetryOutcome::GaveUp { attempts: 5 });
    assert_eq!(reports[0].source, "news");
    assert_eq!(h.transport.calls(), 5);
    assert!(h.store.documents(PARTITION).is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_a_pending_backoff() {
    let h = harness(vec![transport_err()]).await;

    assert_eq!(
        h.coordinator.dispatch(job(def(json!({})))).await,
        DispatchOutcome::RetryScheduled
    );
    // attempt 2 fires at 15s; at 20s the task waits 30s for attempt 3
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.transport.calls(), 2);

    let before = Instant::now();
    h.trigger.trigger();
    let reports = h.coordinator.drain().await;

    assert!(before.elapsed() < Duration::from_secs(1));
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, RetryOutcome::Cancelled { next_attempt: 3 });
    assert_eq!(h.transport.calls(), 2);
    assert_eq!(h.coordinator.tracked(), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_json_gives_up_immediately() {
    let h = harness(vec![Step::Respond(200, "<html>busy</html>".into())]).await;

    let out = h.coordinator.dispatch(job(def(json!({})))).await;

    assert_eq!(out, DispatchOutcome::GaveUp);
    assert_eq!(h.coordinator.tracked(), 0);
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn unsupported_method_never_reaches_the_transport() {
    let h = harness(vec![Step::json(json!({"data": {}}))]).await;

    let out = h.coordinator.dispatch(job(def(json!({"method": "DELETE"})))).await;

    assert_eq!(out, DispatchOutcome::GaveUp);
    assert_eq!(h.transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn storage_failure_is_retried() {
    let h = harness(vec![Step::json(json!({"data": {"ok": true}}))]).await;
    h.store.fail_next_writes(1);

    assert_eq!(
        h.coordinator.dispatch(job(def(json!({})))).await,
        DispatchOutcome::RetryScheduled
    );
    let reports = h.coordinator.drain().await;

    assert_eq!(reports[0].outcome, RetryOutcome::Stored { attempt: 2 });
    assert_eq!(h.store.documents(PARTITION).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn single_attempt_policy_gives_up_on_retryable_failure() {
    let store = Arc::new(MemoryStore::new());
    store.ensure_partition(PARTITION).await.unwrap();
    let transport = Arc::new(ScriptedTransport::always(transport_err()));
    let (_trigger, shutdown) = shutdown::channel();
    let coordinator = RetryCoordinator::new(
        transport.clone(),
        store.clone(),
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_secs(15),
        },
        shutdown,
    );

    assert_eq!(coordinator.dispatch(job(def(json!({})))).await, DispatchOutcome::GaveUp);
    assert_eq!(coordinator.tracked(), 0);
    let (total, _) = store.find(PARTITION, &ContentQuery::default()).await.unwrap();
    assert_eq!(total, 0);
}

/// Fails the first `fail_first` calls, then hangs for ten minutes per call.
struct Hanging {
    fail_first: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for Hanging {
    async fn execute(&self, _req: OutboundRequest) -> Result<RawResponse, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(FetchError::Transport("connection reset".into()));
        }
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(RawResponse {
            status: 200,
            body: br#"{"data":{}}"#.to_vec(),
        })
    }
}

fn hanging_coordinator(
    fail_first: usize,
) -> (Arc<RetryCoordinator>, Arc<MemoryStore>, ShutdownTrigger) {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(Hanging {
        fail_first,
        calls: AtomicUsize::new(0),
    });
    let (trigger, shutdown) = shutdown::channel();
    let coordinator = Arc::new(RetryCoordinator::new(
        transport,
        store.clone(),
        RetryPolicy::default(),
        shutdown,
    ));
    (coordinator, store, trigger)
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_an_in_flight_first_attempt() {
    let (coordinator, store, trigger) = hanging_coordinator(0);
    store.ensure_partition(PARTITION).await.unwrap();

    let c = coordinator.clone();
    let handle = tokio::spawn(async move { c.dispatch(job(def(json!({})))).await });
    // let the request get under way
    tokio::time::sleep(Duration::from_secs(1)).await;

    let before = Instant::now();
    trigger.trigger();
    let out = handle.await.unwrap();

    assert_eq!(out, DispatchOutcome::Cancelled);
    assert!(before.elapsed() < Duration::from_secs(1));
    assert_eq!(coordinator.tracked(), 0);
    assert!(store.documents(PARTITION).is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_an_in_flight_retry() {
    let (coordinator, store, trigger) = hanging_coordinator(1);
    store.ensure_partition(PARTITION).await.unwrap();

    assert_eq!(
        coordinator.dispatch(job(def(json!({})))).await,
        DispatchOutcome::RetryScheduled
    );
    // attempt 2 starts at 15s and is still waiting on the server at 20s
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(coordinator.in_flight(), 1);

    let before = Instant::now();
    trigger.trigger();
    let reports = coordinator.drain().await;

    assert!(before.elapsed() < Duration::from_secs(1));
    assert_eq!(reports[0].outcome, RetryOutcome::Cancelled { next_attempt: 2 });
    assert_eq!(coordinator.in_flight(), 0);
    assert!(store.documents(PARTITION).is_empty());
}

#[tokio::test(start_paused = true)]
async fn finished_retry_stops_counting_before_it_is_reaped() {
    let h = harness(vec![transport_err(), Step::json(json!({"data": {}}))]).await;

    assert_eq!(
        h.coordinator.dispatch(job(def(json!({})))).await,
        DispatchOutcome::RetryScheduled
    );
    assert_eq!(h.coordinator.in_flight(), 1);

    // attempt 2 succeeds at 15s
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(h.coordinator.in_flight(), 0);
    assert_eq!(h.coordinator.tracked(), 1);

    let reports = h.coordinator.reap_finished();
    assert_eq!(reports[0].outcome, RetryOutcome::Stored { attempt: 2 });
    assert_eq!(h.coordinator.tracked(), 0);
}
