//! # iiif2pdf
//!
//! Turn IIIF Presentation manifests into downloadable PDFs over HTTP.
//!
//! ## Why this crate?
//!
//! Digitised books and archival scans are published page-by-page behind IIIF
//! image servers. Reading a 400-page volume that way is painful, and most
//! institutions offer no bulk download. This crate walks a IIIF Presentation
//! manifest (v2 or v3), downloads every page image, binds them into a single
//! PDF, and optionally runs OCR so the scan becomes searchable text.
//!
//! ## Pipeline Overview
//!
//! ```text
//! manifest URL
//!  │
//!  ├─ 1. Fetch     parse the manifest, download page images concurrently
//!  ├─ 2. Assemble  embed JPEGs into one PDF (CPU-bound, spawn_blocking)
//!  ├─ 3. OCR       optional ocrmypdf subprocess for a text layer
//!  └─ 4. Deliver   response body, or SSE progress + one-shot retrieval URL
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use iiif2pdf::{ConversionRequest, Converter, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let converter = Converter::new(ServiceConfig::default())?;
//!     let request = ConversionRequest::new(
//!         "https://example.org/iiif/book1/manifest",
//!         false, // skip OCR
//!         0.35,  // downscale pages to 35%
//!     )?;
//!     let pdf = converter.convert(&request).await?;
//!     std::fs::write("book1.pdf", pdf)?;
//!     Ok(())
//! }
//! ```
//!
//! ## HTTP Endpoints
//!
//! With the `server` feature (default), [`server::serve`] exposes:
//!
//! | Route | Behaviour |
//! |-------|-----------|
//! | `GET /iiif` | Convert synchronously, PDF in the response body |
//! | `GET /iiif2` | Convert with live SSE progress, ends with a `pdfurl:` frame |
//! | `GET /tmp/{path}` | Serve a streamed run's artifact once, then delete it |
//! | `GET /health` | Liveness check |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `server` | on | HTTP layer and the `iiif2pdf` binary (axum + tower-http + clap) |
//!
//! Disable `server` when using only the conversion pipeline:
//! ```toml
//! iiif2pdf = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod pipeline;
pub mod progress;
#[cfg(feature = "server")]
pub mod server;
pub mod stream;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ServiceConfig, ServiceConfigBuilder, DEFAULT_PCT_SIZE};
pub use convert::{
    ConversionRequest, Converter, MSG_CONVERTING, MSG_OCR_DONE, MSG_OCR_RUNNING, MSG_PDF_CREATED,
};
pub use error::Iiif2PdfError;
pub use pipeline::fetch::{HttpManifestDownloader, ManifestDownloader};
pub use pipeline::ocr::{OcrEngine, OcrmypdfEngine};
pub use progress::{NoopSink, ProgressLog, ProgressSink, SENTINEL};
pub use stream::{EventStream, ProgressEvent};
pub use workspace::Workspace;
