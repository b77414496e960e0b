//! Read-only HTTP surface over the READ store.
//!
//! Every JSON response wears the same envelope: `success` always, `data`
//! (+ optional `meta`) on success, `error` on failure. Expected failures
//! (missing parameter, unknown symbol) are HTTP 200 with `success: false`;
//! 404 is reserved for unknown routes and 500 for genuine runtime errors.

pub mod routes;

use crate::storage::{ReadStore, WriteStore};
use crate::tracker::TrackerHandle;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared state injected into every handler. The WRITE handle exists only
/// for short-range raw queries; everything else reads the READ store.
#[derive(Clone)]
pub struct AppState {
    pub read: Arc<ReadStore>,
    pub write: Arc<WriteStore>,
    pub trackers: Arc<HashMap<String, TrackerHandle>>,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        meta: None,
        error: None,
    })
}

pub fn ok_with_meta<T: Serialize>(data: T, meta: serde_json::Value) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        meta: Some(meta),
        error: None,
    })
}

/// Expected failure: HTTP 200, `success: false`.
pub fn fail<T: Serialize>(message: impl Into<String>) -> Json<Envelope<T>> {
    Json(Envelope {
        success: false,
        data: None,
        meta: None,
        error: Some(message.into()),
    })
}

/// Unexpected runtime failure: HTTP 500 with the same envelope shape.
pub struct ApiError(pub anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "handler failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            fail::<serde_json::Value>(self.0.to_string()),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/latest", get(routes::get_latest))
        .route("/api/markets", get(routes::get_markets))
        .route("/api/stats", get(routes::get_stats))
        .route("/api/normalized-data", get(routes::get_normalized_data))
        .route("/api/tokens", get(routes::get_tokens))
        .route("/api/compare", get(routes::get_compare))
        .route("/api/funding/ma", get(routes::get_funding_ma))
        .route("/api/funding/ma/bulk", get(routes::get_funding_ma_bulk))
        .route("/api/arbitrage", get(routes::get_arbitrage))
        .route("/api/status", get(routes::get_tracker_status))
        .route("/api/trackers", get(routes::get_tracker_status))
        .route("/tracker/:exchange/status", get(routes::get_tracker_detail))
        .route("/tracker/:exchange/debug", get(routes::get_tracker_debug))
        .route("/tracker/:exchange/start", post(routes::post_tracker_start))
        .route("/tracker/:exchange/stop", post(routes::post_tracker_stop))
        .fallback(routes::not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
