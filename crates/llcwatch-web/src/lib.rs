//! Axum JSON facade: paginated read API over the record store plus a manual
//! scrape trigger. Parameter parsing and status mapping only; all pipeline
//! logic lives behind [`IngestionPipeline`].

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use llcwatch_core::{cutoff_for_days_back, EntityRecord};
use llcwatch_fetch::{FetchError, RegistryFetcher, RowSource};
use llcwatch_ingest::{IngestConfig, IngestError, IngestionPipeline};
use llcwatch_store::{Store, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "llcwatch-web";

const DEFAULT_DAYS: u32 = 7;
const DEFAULT_PAGE: u32 = 1;
const DEFAULT_PER_PAGE: u32 = 10;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub source: Arc<dyn RowSource>,
    pub max_pages: u32,
}

impl AppState {
    pub fn new(store: Store, source: Arc<dyn RowSource>, max_pages: u32) -> Self {
        Self {
            store,
            source,
            max_pages,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("scrape failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Fetch(e) => ApiError::Fetch(e),
            IngestError::Store(e) => ApiError::Storage(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Fetch(_) | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Params arrive as raw strings so that a non-integer value becomes a
/// structured 400 instead of an extractor rejection.
#[derive(Debug, Deserialize, Default)]
struct RecentQuery {
    days: Option<String>,
    page: Option<String>,
    per_page: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ScrapeQuery {
    days: Option<String>,
}

fn parse_param(name: &str, raw: Option<&str>, default: u32, min: u32) -> Result<u32, ApiError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value: u32 = raw.trim().parse().map_err(|_| {
        ApiError::Validation(format!("{name} must be a non-negative integer, got {raw:?}"))
    })?;
    if value < min {
        return Err(ApiError::Validation(format!("{name} must be >= {min}")));
    }
    Ok(value)
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/llcs/recent", get(recent_handler))
        .route("/api/llcs/scrape", post(scrape_handler))
        .route("/api/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let port: u16 = std::env::var("LLCWATCH_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5000);

    let store = Store::open(&config.db_path)
        .await
        .context("opening record store")?;
    let source = Arc::new(RegistryFetcher::new(config.fetch.clone()));
    let state = AppState::new(store, source, config.fetch.max_pages);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving llcwatch api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn recent_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<EntityRecord>>, ApiError> {
    let days = parse_param("days", query.days.as_deref(), DEFAULT_DAYS, 0)?;
    let page = parse_param("page", query.page.as_deref(), DEFAULT_PAGE, 1)?;
    let per_page = parse_param("per_page", query.per_page.as_deref(), DEFAULT_PER_PAGE, 1)?;

    let cutoff = cutoff_for_days_back(Utc::now().date_naive(), days);
    let offset = i64::from(page - 1) * i64::from(per_page);
    let records = state
        .store
        .query_recent(cutoff, offset, i64::from(per_page))
        .await?;
    Ok(Json(records))
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScrapeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let days = parse_param("days", query.days.as_deref(), DEFAULT_DAYS, 0)?;

    // Blocking trigger: the response waits for the full fetch->filter->persist
    // pass of this run.
    let pipeline =
        IngestionPipeline::new(state.store.clone(), state.source.clone(), state.max_pages);
    let summary = pipeline.run_once(days).await?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "scraped": summary.scraped,
    })))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
