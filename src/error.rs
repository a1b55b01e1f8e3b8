//! Error types for the iiif2pdf library.
//!
//! One enum, [`Iiif2PdfError`], covers every failure the pipeline can hit.
//! Variants are grouped by phase (validation → download → assembly → OCR →
//! filesystem) because the HTTP layer maps whole groups to status codes:
//! validation variants become 400, everything else a request can surface
//! becomes 500. The streaming endpoint instead renders the `Display` text
//! into an `error:` frame, so messages are written to be shown to a client
//! as-is.
//!
//! Cleanup-time filesystem races (a file deleted between the existence
//! check and the remove call) are deliberately NOT represented here; they
//! are tolerated and logged where they happen, never propagated.

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the iiif2pdf library.
#[derive(Debug, Error)]
pub enum Iiif2PdfError {
    // ── Request validation ────────────────────────────────────────────────
    /// The manifest URL failed the syntactic check (non-empty, starts with
    /// `http`, contains `manifest`).
    #[error("Invalid manifest URL: '{url}'\nA manifest URL must start with 'http' and contain the word 'manifest'.")]
    InvalidManifestUrl { url: String },

    /// The requested resize percentage is outside the usable range.
    #[error("pctSize must be greater than 0 and at most 1, got {value}")]
    InvalidPctSize { value: f32 },

    // ── Manifest & image download ─────────────────────────────────────────
    /// The manifest document could not be fetched.
    #[error("Failed to fetch manifest '{url}': {reason}")]
    ManifestFetchFailed { url: String, reason: String },

    /// The manifest was fetched but is not parseable IIIF JSON.
    #[error("Failed to parse manifest '{url}': {detail}")]
    ManifestParseFailed { url: String, detail: String },

    /// The manifest parsed but references no page images.
    #[error("Manifest '{url}' contains no page images")]
    EmptyManifest { url: String },

    /// A page image download failed.
    #[error("Failed to download page image '{url}': {reason}")]
    ImageDownloadFailed { url: String, reason: String },

    /// A network operation exceeded the configured timeout.
    #[error("Request to '{url}' timed out after {secs}s\nIncrease --http-timeout for slow image servers.")]
    RequestTimeout { url: String, secs: u64 },

    // ── PDF assembly ──────────────────────────────────────────────────────
    /// The workspace holds no page images to assemble.
    #[error("No page images found in '{}'", .dir.display())]
    NoPageImages { dir: PathBuf },

    /// A downloaded page image could not be decoded.
    #[error("Failed to decode page image '{}': {}", .path.display(), .detail)]
    ImageDecodeFailed { path: PathBuf, detail: String },

    /// PDF document construction or serialisation failed.
    #[error("PDF assembly failed: {detail}")]
    AssemblyFailed { detail: String },

    // ── OCR ───────────────────────────────────────────────────────────────
    /// The OCR executable could not be started at all.
    #[error("Could not run OCR command '{command}': {reason}\nInstall ocrmypdf or point --ocr-command at it.")]
    OcrUnavailable { command: String, reason: String },

    /// The OCR process ran but exited with a failure status.
    #[error("OCR failed: {detail}")]
    OcrFailed { detail: String },

    /// The OCR process exceeded the configured time budget.
    #[error("OCR timed out after {secs}s\nLarge scans may need a higher --ocr-timeout.")]
    OcrTimeout { secs: u64 },

    // ── Workspace & I/O ───────────────────────────────────────────────────
    /// Could not create the per-request workspace directory tree.
    #[error("Failed to create workspace at '{}': {}", .path.display(), .source)]
    WorkspaceCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The finished artifact is missing from the workspace.
    #[error("Artifact not found at '{}'", .path.display())]
    ArtifactMissing { path: PathBuf },

    /// Any other filesystem failure inside the pipeline.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (task panic, channel misuse).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Iiif2PdfError {
    /// True for errors the HTTP layer should report as the client's fault
    /// (status 400) rather than a server-side failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Iiif2PdfError::InvalidManifestUrl { .. } | Iiif2PdfError::InvalidPctSize { .. }
        )
    }
}
