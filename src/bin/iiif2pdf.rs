//! HTTP server binary for iiif2pdf.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ServiceConfig` and runs the Axum server.

use anyhow::{Context, Result};
use clap::Parser;
use iiif2pdf::config::ServiceConfig;
use iiif2pdf::server;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve on the default port (8000)
  iiif2pdf

  # Bind to localhost only, different port
  iiif2pdf --bind 127.0.0.1 --port 9000

  # Give OCR more time on large volumes
  iiif2pdf --ocr-timeout 1800

  # Store workspaces on a scratch volume
  iiif2pdf --data-root /var/tmp/iiif2pdf

  # Lock CORS down to one origin
  iiif2pdf --allowed-origins https://viewer.example.org

ENDPOINTS:
  GET /iiif?manifestURL=...&ocr=true&pctSize=0.35   PDF in the response body
  GET /iiif2?manifestURL=...                        SSE progress + pdfurl frame
  GET /tmp/{uuid}/pdf/out.pdf                       one-shot artifact retrieval
  GET /health                                       liveness check

ENVIRONMENT VARIABLES:
  IIIF2PDF_BIND               Bind address
  IIIF2PDF_PORT               Listen port
  IIIF2PDF_DATA_ROOT          Workspace directory
  IIIF2PDF_OCR_COMMAND        OCR executable (default: ocrmypdf)
  IIIF2PDF_ALLOWED_ORIGINS    Comma-separated CORS origin allowlist
  RUST_LOG                    Tracing filter (overrides -v/-q)

SETUP:
  1. Install ocrmypdf:   apt install ocrmypdf   (or: pip install ocrmypdf)
  2. Run the server:     iiif2pdf
  3. Convert:            curl 'http://localhost:8000/iiif?manifestURL=...&ocr=false' -o out.pdf
"#;

/// Serve IIIF manifest to PDF conversion over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "iiif2pdf",
    version,
    about = "HTTP service that turns IIIF manifests into downloadable PDFs",
    long_about = "Downloads every page image referenced by a IIIF Presentation manifest (v2 or v3), \
binds them into a single PDF, optionally runs OCR for a searchable text layer, and serves the \
result over HTTP with live progress streaming.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Bind address.
    #[arg(long, env = "IIIF2PDF_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Listen port.
    #[arg(short, long, env = "IIIF2PDF_PORT", default_value_t = 8000)]
    port: u16,

    /// Directory that holds per-request workspaces.
    #[arg(long, env = "IIIF2PDF_DATA_ROOT", default_value = "img")]
    data_root: PathBuf,

    /// Progress log poll interval in milliseconds (10-2000).
    #[arg(long, env = "IIIF2PDF_POLL_INTERVAL_MS", default_value_t = 100)]
    poll_interval_ms: u64,

    /// Concurrent page-image downloads per request.
    #[arg(long, env = "IIIF2PDF_DOWNLOAD_CONCURRENCY", default_value_t = 4)]
    download_concurrency: usize,

    /// Concurrent CPU-heavy jobs (PDF assembly, OCR) across all requests.
    #[arg(long, env = "IIIF2PDF_BLOCKING_JOBS", default_value_t = 2)]
    blocking_jobs: usize,

    /// HTTP timeout for manifest and image requests, in seconds.
    #[arg(long, env = "IIIF2PDF_HTTP_TIMEOUT", default_value_t = 120)]
    http_timeout: u64,

    /// OCR executable to spawn.
    #[arg(long, env = "IIIF2PDF_OCR_COMMAND", default_value = "ocrmypdf")]
    ocr_command: String,

    /// OCR language passed to the OCR tool.
    #[arg(long, env = "IIIF2PDF_OCR_LANGUAGE", default_value = "eng")]
    ocr_language: String,

    /// OCR timeout in seconds.
    #[arg(long, env = "IIIF2PDF_OCR_TIMEOUT", default_value_t = 600)]
    ocr_timeout: u64,

    /// CORS origin allowlist, comma separated. Pass '*' to allow any origin;
    /// omit the flag to keep the built-in default list.
    #[arg(long, env = "IIIF2PDF_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Option<Vec<String>>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "IIIF2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "IIIF2PDF_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli).context("Invalid configuration")?;
    server::serve(config).await.context("Server failed")?;

    Ok(())
}

/// Map CLI args to `ServiceConfig`.
fn build_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut builder = ServiceConfig::builder()
        .bind_addr(cli.bind.clone())
        .port(cli.port)
        .data_root(cli.data_root.clone())
        .poll_interval_ms(cli.poll_interval_ms)
        .download_concurrency(cli.download_concurrency)
        .blocking_jobs(cli.blocking_jobs)
        .http_timeout_secs(cli.http_timeout)
        .ocr_command(cli.ocr_command.clone())
        .ocr_language(cli.ocr_language.clone())
        .ocr_timeout_secs(cli.ocr_timeout);

    if let Some(ref origins) = cli.allowed_origins {
        let origins = if origins.len() == 1 && origins[0] == "*" {
            Vec::new()
        } else {
            origins.clone()
        };
        builder = builder.allowed_origins(origins);
    }

    Ok(builder.build()?)
}
