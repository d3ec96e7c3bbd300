//! api-fetcher binary entrypoint.
//! Wires config, storage, the fetch/post-process scheduler and the read API,
//! then runs until Ctrl-C or SIGTERM.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use api_fetcher::api::{create_router, AppState};
use api_fetcher::config::load_config_default;
use api_fetcher::fetch::transport::ReqwestTransport;
use api_fetcher::fetch::{FetchOrchestrator, RetryCoordinator};
use api_fetcher::metrics::Metrics;
use api_fetcher::postprocess::PostProcessor;
use api_fetcher::scheduler::Scheduler;
use api_fetcher::shutdown;
use api_fetcher::store::seed::{load_sources_from, seed_registry};
use api_fetcher::store::SqliteStore;

/// Compact logs by default; `LOG_FORMAT=json` for structured output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_config_default().context("loading config")?;
    let zone = cfg.zone();
    let anchors = cfg.anchors()?;
    tracing::info!(
        timezone = %cfg.timezone,
        anchors = ?anchors.hours(),
        db = %cfg.database_path.display(),
        "Configuration loaded"
    );

    let sqlite = SqliteStore::open(&cfg.database_path)?;
    if let Some(path) = &cfg.sources_path {
        let defs = load_sources_from(path)?;
        let n = seed_registry(&sqlite, &defs).await?;
        tracing::info!(target: "store", path = %path.display(), seeded = n, "Source registry seeded");
    }
    let store = Arc::new(sqlite);

    let metrics = Metrics::init()?;
    let transport = Arc::new(ReqwestTransport::new(cfg.http_timeout(), &cfg.user_agent)?);
    let (trigger, shutdown) = shutdown::channel();

    let coordinator = Arc::new(RetryCoordinator::new(
        transport,
        store.clone(),
        cfg.retry_policy(),
        shutdown.clone(),
    ));
    let orchestrator = Arc::new(
        FetchOrchestrator::new(
            store.clone(),
            store.clone(),
            coordinator,
            zone,
            cfg.partition_prefix.clone(),
        )
        .with_concurrency(cfg.dispatch_concurrency),
    );
    let post = Arc::new(PostProcessor::new(
        store.clone(),
        zone,
        cfg.partition_prefix.clone(),
        &cfg.post_process,
    ));
    let scheduler = Scheduler::new(orchestrator, post, anchors, zone)
        .with_post_delay(cfg.post_process_delay())
        .run_on_startup(cfg.run_on_startup);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let app = create_router(AppState {
        registry: store.clone(),
        store: store.clone(),
        zone,
        partition_prefix: cfg.partition_prefix.clone(),
    })
    .merge(metrics.router());

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    tracing::info!(target: "api", addr = %cfg.listen_addr, "Read API listening");

    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.triggered().await })
            .await
    });

    let mut server_done = false;
    tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("Shutdown signal received");
        }
        res = &mut server => {
            server_done = true;
            match res {
                Ok(Ok(())) => tracing::warn!(target: "api", "HTTP server exited"),
                Ok(Err(e)) => tracing::error!(target: "api", error = %e, "HTTP server failed"),
                Err(e) => tracing::error!(target: "api", error = %e, "HTTP server task panicked"),
            }
        }
    }

    trigger.trigger();
    if !server_done {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(target: "api", error = %e, "HTTP server failed"),
            Err(e) => tracing::error!(target: "api", error = %e, "HTTP server task panicked"),
        }
    }
    let reports = scheduler_task.await.context("scheduler task")?;
    tracing::info!(drained_retries = reports.len(), "Shutdown complete");
    Ok(())
}
