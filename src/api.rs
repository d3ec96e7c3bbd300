//! Read-only HTTP view over the registry and the day partitions.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::config::zone::ReferenceZone;
use crate::fetch::SourceDefinition;
use crate::store::{partition_name, ContentQuery, Page, ResultStore, SourceRegistry, StoredResult};

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn SourceRegistry>,
    pub store: Arc<dyn ResultStore>,
    pub zone: ReferenceZone,
    pub partition_prefix: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/apis", get(list_apis))
        .route("/contents", get(list_contents))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// JSON `{"error": ...}` with a status code.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!(target: "api", error = %format!("{e:#}"), "Request failed");
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Serialize)]
struct ApisResp {
    data: Vec<SourceDefinition>,
}

async fn list_apis(State(state): State<AppState>) -> Result<Json<ApisResp>, ApiError> {
    let data = state.registry.all_sources().await.map_err(internal)?;
    Ok(Json(ApisResp { data }))
}

/// Raw query values; unparsable numbers fall back to defaults.
#[derive(Deserialize, Default)]
struct ContentsParams {
    date: Option<String>,
    source: Option<String>,
    category: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

#[derive(Serialize)]
struct ContentsResp {
    date: String,
    total: u64,
    page: u32,
    limit: u32,
    data: Vec<StoredResult>,
}

fn page_params(page: Option<&str>, limit: Option<&str>) -> Page {
    let num = |s: Option<&str>| s.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(0);
    let page = match num(page) {
        p if p <= 0 => 1,
        p => u32::try_from(p).unwrap_or(u32::MAX),
    };
    let limit = match num(limit) {
        l if l <= 0 || l > i64::from(MAX_LIMIT) => DEFAULT_LIMIT,
        l => l as u32,
    };
    Page { page, limit }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

async fn list_contents(
    State(state): State<AppState>,
    Query(q): Query<ContentsParams>,
) -> Result<Json<ContentsResp>, ApiError> {
    let date = match non_empty(q.date) {
        Some(d) => NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").map_err(|_| {
            ApiError(StatusCode::BAD_REQUEST, format!("invalid date {d:?}, expected YYYY-MM-DD"))
        })?,
        None => state.zone.local_date(Utc::now()),
    };
    let page = page_params(q.page.as_deref(), q.limit.as_deref());
    let query = ContentQuery {
        source: non_empty(q.source),
        category: non_empty(q.category),
        page: Some(page),
        ..ContentQuery::default()
    };

    let partition = partition_name(&state.partition_prefix, date);
    let (total, data) = state.store.find(&partition, &query).await.map_err(internal)?;
    Ok(Json(ContentsResp {
        date: date.format("%Y-%m-%d").to_string(),
        total,
        page: page.page,
        limit: page.limit,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_params_clamp_like_the_read_api_documents() {
        assert_eq!(page_params(None, None), Page { page: 1, limit: 20 });
        assert_eq!(page_params(Some("0"), Some("0")), Page { page: 1, limit: 20 });
        assert_eq!(page_params(Some("-3"), Some("201")), Page { page: 1, limit: 20 });
        assert_eq!(page_params(Some("abc"), Some("200")), Page { page: 1, limit: 200 });
        assert_eq!(page_params(Some("4"), Some("5")), Page { page: 4, limit: 5 });
    }
}
