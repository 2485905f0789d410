//! HTTP surface for the comparison pipeline.
//!
//! ```text
//! POST /api/compare          - compare two pages, returns the summary JSON
//! GET  <prefix>/{name}       - stored screenshot or diff image (image/png)
//! GET  /health               - liveness
//! ```

use crate::compare::{BrowserBackend, Comparator};
use crate::store::ArtifactRef;
use crate::{CaptureRequest, Error, Viewport};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared state of the HTTP handlers
pub struct AppState<B> {
    pub comparator: Comparator<B>,
    /// Path prefix artifacts are served under, e.g. `/screenshots`
    pub public_prefix: String,
}

impl<B: BrowserBackend> AppState<B> {
    pub fn new(comparator: Comparator<B>, public_prefix: impl Into<String>) -> Self {
        Self {
            comparator,
            public_prefix: public_prefix.into(),
        }
    }
}

/// Request body of `POST /api/compare`. Every field is optional on the wire
/// so that missing ones produce the validation response, not a parse error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareBody {
    pub url_a: Option<String>,
    pub url_b: Option<String>,
    pub viewport: Option<ViewportBody>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ViewportBody {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl CompareBody {
    /// Build the request. Zero or missing dimensions fall back per axis to the default viewport.
    pub fn into_request(self) -> CaptureRequest {
        let default = Viewport::default();
        let (width, height) = self
            .viewport
            .map(|v| (v.width, v.height))
            .unwrap_or_default();
        let viewport = Viewport::new(
            width.filter(|w| *w > 0).unwrap_or(default.width),
            height.filter(|h| *h > 0).unwrap_or(default.height),
        );
        CaptureRequest::new(
            self.url_a.unwrap_or_default(),
            self.url_b.unwrap_or_default(),
            viewport,
        )
    }
}

/// Build the router for `state`.
pub fn router<B>(state: Arc<AppState<B>>) -> Router
where
    B: BrowserBackend + 'static,
{
    let artifacts = format!("{}/{{name}}", state.public_prefix.trim_end_matches('/'));
    Router::new()
        .route("/api/compare", post(compare_handler::<B>))
        .route(&artifacts, get(artifact_handler::<B>))
        .route("/health", get(health_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<B, F>(addr: SocketAddr, state: Arc<AppState<B>>, shutdown: F) -> crate::Result<()>
where
    B: BrowserBackend + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn compare_handler<B>(
    State(state): State<Arc<AppState<B>>>,
    body: Result<Json<CompareBody>, JsonRejection>,
) -> Response
where
    B: BrowserBackend + 'static,
{
    let request = match body {
        Ok(Json(body)) => body.into_request(),
        Err(rejection) => {
            debug!("Rejected compare body: {}", rejection);
            let err = Error::ValidationError(rejection.body_text());
            return error_response(StatusCode::BAD_REQUEST, err.public_message());
        }
    };

    match state.comparator.compare(&request).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) if err.is_client_error() => {
            debug!("Rejected compare request: {}", err);
            error_response(StatusCode::BAD_REQUEST, err.public_message())
        }
        Err(err) => {
            error!("Comparison of {} and {} failed: {}", request.url_a, request.url_b, error_chain(&err));
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.public_message())
        }
    }
}

async fn artifact_handler<B>(State(state): State<Arc<AppState<B>>>, Path(name): Path<String>) -> Response
where
    B: BrowserBackend + 'static,
{
    let store = Arc::clone(state.comparator.store());
    let reference = ArtifactRef::from(name.as_str());
    let fetched = tokio::task::spawn_blocking(move || store.retrieve(&reference)).await;
    match fetched {
        Ok(Ok(bytes)) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Ok(Err(Error::NotFound(_))) => StatusCode::NOT_FOUND.into_response(),
        Ok(Err(err)) => {
            error!("Failed to read artifact {}: {}", name, err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(err) => {
            error!("Artifact read task failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
