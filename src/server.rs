//! Axum HTTP surface for the conversion service.
//!
//! Four routes, all `GET`:
//!
//! * `/iiif`: run the pipeline, respond with the PDF body.
//! * `/iiif2`: run the pipeline, respond with an SSE progress stream
//!   ending in a `pdfurl:` frame.
//! * `/tmp/{path}`: serve an artifact produced by `/iiif2`, deleting its
//!   workspace once the body has been fully sent. One-shot: the second
//!   request for the same path is a 404.
//! * `/health`: liveness check.
//!
//! ## Why delete on response-body drop?
//!
//! The artifact must outlive the SSE stream (the client fetches it in a
//! separate request) but must not accumulate on disk. Tying removal to
//! the drop of the response body guarantees it happens after the last
//! byte is handed to the connection, whether the transfer completed or
//! the client went away mid-download.

use crate::convert::{ConversionRequest, Converter};
use crate::error::Iiif2PdfError;
use crate::workspace;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::path::{Component, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_stream::Stream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

// ── Request / error types ────────────────────────────────────────────────

/// Query parameters shared by `/iiif` and `/iiif2`.
#[derive(Debug, Deserialize)]
pub struct IiifParams {
    #[serde(default, rename = "manifestURL")]
    manifest_url: String,
    #[serde(default = "default_ocr")]
    ocr: bool,
    #[serde(default = "default_pct_size", rename = "pctSize")]
    pct_size: f32,
}

fn default_ocr() -> bool {
    true
}

fn default_pct_size() -> f32 {
    crate::config::DEFAULT_PCT_SIZE
}

/// HTTP-facing error: status code plus the message for the JSON body.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "File not found".to_owned(),
        }
    }
}

impl From<Iiif2PdfError> for ApiError {
    fn from(e: Iiif2PdfError) -> Self {
        let status = if e.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        // Clients match this body verbatim; the richer display with the
        // rejected URL stays in the logs.
        let message = match &e {
            Iiif2PdfError::InvalidManifestUrl { .. } => "Invalid manifest URL".to_owned(),
            other => other.to_string().replace('\n', " "),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────

/// `GET /iiif`: synchronous conversion, PDF in the response body.
async fn iiif(
    State(converter): State<Converter>,
    Query(params): Query<IiifParams>,
) -> Result<Response, ApiError> {
    let request = ConversionRequest::new(params.manifest_url, params.ocr, params.pct_size)?;
    let bytes = converter.convert(&request).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pdf")],
        bytes,
    )
        .into_response())
}

/// `GET /iiif2`: conversion with progress streamed as SSE frames.
async fn iiif2(
    State(converter): State<Converter>,
    Query(params): Query<IiifParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request = ConversionRequest::new(params.manifest_url, params.ocr, params.pct_size)?;
    let events = converter
        .convert_stream(request)
        .map(|event| Ok(Event::default().data(event.to_string())));
    Ok(Sse::new(events))
}

/// `GET /tmp/{path}`: serve an artifact once, then remove its workspace.
async fn retrieve(
    State(converter): State<Converter>,
    Path(file_path): Path<String>,
) -> Result<Response, ApiError> {
    // Traversal attempts get the same 404 as a plain miss.
    let relative = sanitize_artifact_path(&file_path).ok_or_else(ApiError::not_found)?;
    let data_root = converter.config().data_root.clone();
    let artifact = data_root.join(&relative);

    let bytes = match tokio::fs::read(&artifact).await {
        Ok(bytes) => bytes,
        Err(_) => return Err(ApiError::not_found()),
    };
    info!(
        "Serving artifact {} ({} bytes), workspace will be removed after delivery",
        relative.display(),
        bytes.len()
    );

    let body = Body::from_stream(ArtifactBody {
        bytes: Some(Bytes::from(bytes)),
        _cleanup: CleanupOnDrop {
            data_root,
            artifact,
        },
    });
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pdf")],
        body,
    )
        .into_response())
}

/// `GET /health`: liveness check.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Artifact delivery ────────────────────────────────────────────────────

/// Response body yielding the artifact in one chunk. The cleanup guard
/// fires when the body is dropped, which happens only after hyper has
/// finished with it (sent fully, or the connection died).
struct ArtifactBody {
    bytes: Option<Bytes>,
    _cleanup: CleanupOnDrop,
}

struct CleanupOnDrop {
    data_root: PathBuf,
    artifact: PathBuf,
}

impl Drop for CleanupOnDrop {
    fn drop(&mut self) {
        workspace::cleanup_artifact(&self.data_root, &self.artifact);
    }
}

impl Stream for ArtifactBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().bytes.take().map(Ok))
    }
}

/// Reduce a raw `/tmp/{path}` remainder to a path that stays inside the
/// data root: only normal components allowed, and at least one of them.
fn sanitize_artifact_path(raw: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in std::path::Path::new(raw).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

// ── Router / startup ─────────────────────────────────────────────────────

/// Build the application router. Exposed for in-process testing.
pub fn build_router(converter: Converter) -> Router {
    let cors = cors_layer(&converter.config().allowed_origins);
    Router::new()
        .route("/iiif", get(iiif))
        .route("/iiif2", get(iiif2))
        .route("/tmp/{*file_path}", get(retrieve))
        .route("/health", get(health))
        .layer(cors)
        .with_state(converter)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let mut allowed = Vec::with_capacity(origins.len());
    for origin in origins {
        match origin.parse::<HeaderValue>() {
            Ok(value) => allowed.push(value),
            Err(_) => warn!("Ignoring unparseable CORS origin {:?}", origin),
        }
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET])
        .allow_headers(Any)
}

/// Bind and run the service until Ctrl+C or SIGTERM.
pub async fn serve(config: crate::config::ServiceConfig) -> Result<(), Iiif2PdfError> {
    let addr = format!("{}:{}", config.bind_addr, config.port);
    let converter = Converter::new(config)?;

    info!(
        "Serving /iiif, /iiif2, /tmp/{{path}} and /health on {} (data root {})",
        addr,
        converter.config().data_root.display()
    );

    let router = build_router(converter);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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
    info!("Shutdown signal received");
}
