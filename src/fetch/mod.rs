pub mod error;
pub mod extract;
pub mod orchestrator;
pub mod request;
pub mod retry;
pub mod transport;
pub mod types;

use chrono::Utc;
use metrics::{describe_counter, describe_gauge};
use once_cell::sync::OnceCell;

use crate::fetch::transport::Transport;
use crate::fetch::types::{FetchJob, FetchResult};
use crate::store::ResultStore;

pub use error::{BuildError, FetchError};
pub use orchestrator::{CycleSummary, FetchOrchestrator};
pub use retry::{DispatchOutcome, RetryCoordinator, RetryOutcome, RetryPolicy, RetryReport};
pub use types::{Method, SourceDefinition};

const PREVIEW_CHARS: usize = 256;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("fetch_cycles_total", "Fetch cycles started.");
        describe_counter!("fetch_attempts_total", "Fetch attempts started.");
        describe_counter!("fetch_success_total", "Attempts that stored a result.");
        describe_counter!(
            "fetch_failures_total",
            "Failed attempts, labelled by failure kind."
        );
        describe_counter!(
            "fetch_giveup_total",
            "Sources dropped after a terminal failure or exhausted retries."
        );
        describe_gauge!(
            "fetch_retry_tasks_inflight",
            "Background retry tasks still running."
        );
        describe_gauge!(
            "fetch_last_cycle_ts",
            "Unix ts when the fetch cycle last ran."
        );
    });
}

/// One complete build -> fetch -> validate -> persist sequence.
pub async fn run_attempt(
    transport: &dyn Transport,
    store: &dyn ResultStore,
    job: &FetchJob,
    attempt: u32,
) -> Result<(), FetchError> {
    let def = &job.def;
    let req = request::build_request(def)?;
    let resp = transport.execute(req).await?;

    tracing::debug!(
        target: "fetch",
        source = %def.source,
        category = %def.category,
        attempt,
        status = resp.status,
        body_size = resp.body.len(),
        "Fetched API response"
    );

    let data = match extract::shape_response(&resp.body, def) {
        Ok(data) => data,
        Err(e @ (FetchError::MalformedJson(_) | FetchError::NotAnObject)) => {
            tracing::warn!(
                target: "fetch",
                source = %def.source,
                category = %def.category,
                attempt,
                status = resp.status,
                body = %extract::body_preview(&resp.body, PREVIEW_CHARS),
                "Unusable response body"
            );
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let doc = FetchResult {
        date: job.date.clone(),
        source: def.source.clone(),
        category: def.category.clone(),
        info_type: def.info_type.clone(),
        data,
        processed: false,
        created_at: Utc::now(),
    };
    store
        .insert(&job.partition, &doc)
        .await
        .map_err(|e| FetchError::Persist(format!("{e:#}")))?;

    tracing::info!(
        target: "fetch",
        source = %def.source,
        category = %def.category,
        attempt,
        partition = %job.partition,
        extraction = %def.extraction(),
        "Successfully processed API"
    );
    Ok(())
}
