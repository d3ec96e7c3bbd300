// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod fetch;
pub mod metrics;
pub mod postprocess;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use crate::api::{create_router, AppState};
pub use crate::config::{load_config_default, AppConfig};
pub use crate::fetch::{FetchError, FetchOrchestrator, RetryCoordinator, RetryPolicy, SourceDefinition};
pub use crate::scheduler::Scheduler;
