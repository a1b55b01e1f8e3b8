//! Pipeline stages for manifest-to-PDF conversion.
//!
//! Each submodule wraps exactly one external collaborator behind a small
//! seam, so stages stay independently testable and the orchestrator can be
//! exercised with stub implementations (a scripted downloader, a no-op OCR
//! engine) in integration tests.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ─────────▶ assemble ─────────▶ ocr
//! (manifest +      (images → one       (ocrmypdf text
//!  page images)     PDF, printpdf)      layer, optional)
//! ```
//!
//! 1. [`fetch`]: resolve the IIIF manifest, download and resize the
//!    page images into the workspace; the only stage with network I/O
//! 2. [`assemble`]: build one PDF page per image; runs in
//!    `spawn_blocking` because decoding and PDF serialisation are CPU-bound
//! 3. [`ocr`]: spawn the external OCR process to add a searchable
//!    text layer; CPU-heavy and by far the slowest stage

pub mod assemble;
pub mod fetch;
pub mod ocr;
