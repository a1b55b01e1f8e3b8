//! End-to-end tests for the iiif2pdf HTTP surface.
//!
//! The wire tests bind a real listener on a loopback port and talk to the
//! server over HTTP. They stub the manifest downloader, so no outside
//! network is touched. The live tests at the bottom fetch a real IIIF
//! manifest and are gated behind the `E2E_ENABLED` environment variable so
//! they do not run in CI unless explicitly requested.
//!
//! Run with:
//!   cargo test --test e2e
//!   E2E_ENABLED=1 cargo test --test e2e -- --nocapture

#![cfg(feature = "server")]

use futures::future::BoxFuture;
use iiif2pdf::pipeline::fetch::ManifestDownloader;
use iiif2pdf::pipeline::ocr::OcrEngine;
use iiif2pdf::progress::ProgressLog;
use iiif2pdf::server::build_router;
use iiif2pdf::{ConversionRequest, Converter, Iiif2PdfError, ServiceConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

// ── Test doubles ─────────────────────────────────────────────────────────────

/// Downloader that writes `pages` real JPEGs and logs the same milestone
/// lines the HTTP downloader does.
struct StubDownloader {
    pages: usize,
}

impl ManifestDownloader for StubDownloader {
    fn download<'a>(
        &'a self,
        _manifest_url: &'a str,
        target: &'a Path,
        _pct_size: f32,
        log: Option<&'a ProgressLog>,
    ) -> BoxFuture<'a, Result<usize, Iiif2PdfError>> {
        Box::pin(async move {
            if let Some(log) = log {
                log.append("Fetching IIIF manifest...").await?;
                log.append(&format!("Downloading {} page images...", self.pages))
                    .await?;
            }
            for i in 1..=self.pages {
                image::RgbImage::from_pixel(40, 40, image::Rgb([140, 140, 140]))
                    .save(target.join(format!("{:04}.jpg", i)))
                    .expect("test JPEG must encode");
                if let Some(log) = log {
                    log.append(&format!("Downloaded image {}/{}.", i, self.pages))
                        .await?;
                }
            }
            if let Some(log) = log {
                log.finish().await?;
            }
            Ok(self.pages)
        })
    }
}

/// OCR stand-in that copies the input to the output path.
struct CopyOcr;

impl OcrEngine for CopyOcr {
    fn process<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), Iiif2PdfError>> {
        Box::pin(async move {
            tokio::fs::copy(input, output).await?;
            Ok(())
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn stub_converter(data_root: &Path, pages: usize) -> Converter {
    let config = ServiceConfig::builder()
        .data_root(data_root)
        .poll_interval_ms(10)
        .build()
        .expect("config must build");
    Converter::new(config)
        .expect("converter must build")
        .with_downloader(Arc::new(StubDownloader { pages }))
        .with_ocr_engine(Arc::new(CopyOcr))
}

/// Serve the router on an ephemeral loopback port.
async fn spawn_server(converter: Converter) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("loopback bind must succeed");
    let addr = listener.local_addr().expect("bound socket has an address");
    tokio::spawn(async move {
        axum::serve(listener, build_router(converter))
            .await
            .expect("server must run");
    });
    addr
}

async fn error_message(resp: reqwest::Response) -> String {
    let body = resp.text().await.expect("error body must arrive");
    let value: serde_json::Value = serde_json::from_str(&body).expect("error body must be JSON");
    value["error"]
        .as_str()
        .expect("error body must carry an error string")
        .to_string()
}

/// Skip this test unless E2E_ENABLED is set.
macro_rules! e2e_skip_unless_enabled {
    () => {
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run live IIIF tests");
            return;
        }
    };
}

/// Small, stable IIIF Cookbook fixture; override for other collections.
fn e2e_manifest_url() -> String {
    std::env::var("IIIF2PDF_E2E_MANIFEST")
        .unwrap_or_else(|_| "https://iiif.io/api/cookbook/recipe/0009-book-1/manifest.json".into())
}

fn ocrmypdf_available() -> bool {
    std::process::Command::new("ocrmypdf")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

// ── Wire tests (loopback, always run) ────────────────────────────────────────

#[tokio::test]
async fn health_answers_ok() {
    let root = tempdir().unwrap();
    let addr = spawn_server(stub_converter(root.path(), 1)).await;

    let resp = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("request must reach the server");
    assert_eq!(resp.status(), 200);

    let value: serde_json::Value =
        serde_json::from_str(&resp.text().await.unwrap()).expect("health body must be JSON");
    assert_eq!(value["status"], "ok");
}

#[tokio::test]
async fn invalid_manifest_url_yields_400_json() {
    let root = tempdir().unwrap();
    let addr = spawn_server(stub_converter(root.path(), 1)).await;

    // Wrong scheme, and the missing-parameter case behind it.
    for query in ["?manifestURL=ftp://example.org/manifest", ""] {
        let resp = reqwest::get(format!("http://{addr}/iiif{query}"))
            .await
            .expect("request must reach the server");
        assert_eq!(resp.status(), 400, "query: {query:?}");
        assert_eq!(error_message(resp).await, "Invalid manifest URL");
    }
}

#[tokio::test]
async fn unknown_artifact_yields_404_json() {
    let root = tempdir().unwrap();
    let addr = spawn_server(stub_converter(root.path(), 1)).await;

    let resp = reqwest::get(format!("http://{addr}/tmp/no-such-run/pdf/out.pdf"))
        .await
        .expect("request must reach the server");
    assert_eq!(resp.status(), 404);
    assert_eq!(error_message(resp).await, "File not found");
}

#[tokio::test]
async fn iiif_round_trip_delivers_a_pdf() {
    let root = tempdir().unwrap();
    let addr = spawn_server(stub_converter(root.path(), 3)).await;

    let resp = reqwest::get(format!(
        "http://{addr}/iiif?manifestURL=https://example.org/iiif/book/manifest&ocr=false"
    ))
    .await
    .expect("request must reach the server");
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()[reqwest::header::CONTENT_TYPE],
        "application/pdf"
    );

    let bytes = resp.bytes().await.expect("PDF body must arrive");
    let doc = lopdf::Document::load_mem(&bytes).expect("body must parse as PDF");
    assert_eq!(doc.get_pages().len(), 3);

    // Synchronous delivery cleans up as it goes.
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn iiif2_streams_progress_then_serves_the_artifact_once() {
    let root = tempdir().unwrap();
    let addr = spawn_server(stub_converter(root.path(), 2)).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!(
            "http://{addr}/iiif2?manifestURL=https://example.org/iiif/book/manifest&ocr=false"
        ))
        .send()
        .await
        .expect("request must reach the server");
    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()[reqwest::header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .to_string();
    assert!(
        content_type.starts_with("text/event-stream"),
        "got: {content_type}"
    );

    let body = resp.text().await.expect("SSE body must arrive");
    assert!(
        body.contains("data: Converting images to PDF..."),
        "got: {body}"
    );
    assert!(
        body.contains("data: PDF created successfully."),
        "got: {body}"
    );
    assert!(body.contains("data: close"), "got: {body}");

    let url = body
        .lines()
        .find_map(|line| line.strip_prefix("data: pdfurl:"))
        .expect("stream must carry a pdfurl frame")
        .trim()
        .to_string();
    assert!(url.starts_with("/tmp/"), "got: {url}");
    assert!(url.ends_with("/pdf/out.pdf"), "got: {url}");

    // First retrieval delivers the artifact.
    let first = client
        .get(format!("http://{addr}{url}"))
        .send()
        .await
        .expect("retrieval must reach the server");
    assert_eq!(first.status(), 200);
    assert_eq!(
        first.headers()[reqwest::header::CONTENT_TYPE],
        "application/pdf"
    );
    let bytes = first.bytes().await.expect("PDF body must arrive");
    let doc = lopdf::Document::load_mem(&bytes).expect("artifact must parse as PDF");
    assert_eq!(doc.get_pages().len(), 2);

    // Retrieval is one-shot.
    let second = client
        .get(format!("http://{addr}{url}"))
        .send()
        .await
        .expect("second retrieval must reach the server");
    assert_eq!(second.status(), 404);
    assert_eq!(error_message(second).await, "File not found");
}

// ── Live IIIF tests (gated) ──────────────────────────────────────────────────

#[tokio::test]
async fn live_manifest_converts_to_pdf() {
    e2e_skip_unless_enabled!();

    let root = tempdir().unwrap();
    let config = ServiceConfig::builder()
        .data_root(root.path())
        .build()
        .expect("config must build");
    let converter = Converter::new(config).expect("converter must build");

    let request =
        ConversionRequest::new(e2e_manifest_url(), false, 0.2).expect("request must validate");
    let pdf = converter
        .convert(&request)
        .await
        .expect("live conversion must succeed");

    let doc = lopdf::Document::load_mem(&pdf).expect("output must parse as PDF");
    assert!(doc.get_pages().len() >= 1, "live manifest yielded no pages");
    println!(
        "[live] {} pages, {} bytes from {}",
        doc.get_pages().len(),
        pdf.len(),
        e2e_manifest_url()
    );
}

#[tokio::test]
async fn live_manifest_converts_with_ocr() {
    e2e_skip_unless_enabled!();
    if !ocrmypdf_available() {
        println!("SKIP: ocrmypdf not on PATH");
        return;
    }

    let root = tempdir().unwrap();
    let config = ServiceConfig::builder()
        .data_root(root.path())
        .build()
        .expect("config must build");
    let converter = Converter::new(config).expect("converter must build");

    let request =
        ConversionRequest::new(e2e_manifest_url(), true, 0.2).expect("request must validate");
    let pdf = converter
        .convert(&request)
        .await
        .expect("live OCR conversion must succeed");

    let doc = lopdf::Document::load_mem(&pdf).expect("output must parse as PDF");
    assert!(doc.get_pages().len() >= 1);
    println!(
        "[live-ocr] {} pages, {} bytes",
        doc.get_pages().len(),
        pdf.len()
    );
}
