//! Configuration for the iiif2pdf service.
//!
//! Every knob lives in [`ServiceConfig`], built via its
//! [`ServiceConfigBuilder`]. One struct keeps the handler state cheap to
//! clone into spawned tasks and makes a running instance's behaviour fully
//! describable by a single `Debug` line in the startup log.
//!
//! # Design choice: builder over constructor
//! The service has a dozen knobs and most deployments change two of them.
//! The builder lets callers set only what they care about; setters clamp
//! obviously-wrong values into range and `build()` rejects the rest.

use crate::error::Iiif2PdfError;
use std::path::PathBuf;

/// Default resize percentage applied to downloaded page images when the
/// request does not specify one.
pub const DEFAULT_PCT_SIZE: f32 = 0.35;

/// Configuration for the service and its pipeline.
///
/// Built via [`ServiceConfig::builder()`] or [`ServiceConfig::default()`].
///
/// # Example
/// ```rust
/// use iiif2pdf::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .data_root("img")
///     .poll_interval_ms(100)
///     .download_concurrency(4)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory that holds all per-request workspaces. Default: `img`.
    ///
    /// Each request gets `<data_root>/<uuid>/` and the retrieval endpoint
    /// maps `/tmp/<uuid>/...` URLs back onto this directory. The directory
    /// is created on demand; it only ever contains reclaimable scratch
    /// state, so it is safe to wipe between restarts.
    pub data_root: PathBuf,

    /// Address the HTTP server binds to. Default: `0.0.0.0`.
    pub bind_addr: String,

    /// Port the HTTP server listens on. Default: 8000.
    pub port: u16,

    /// Progress-log poll interval in milliseconds. Range: 10–2000. Default: 100.
    ///
    /// The streamed endpoint tails the workspace log by polling: read a
    /// line, and if none is complete yet, sleep this long and retry. 100 ms
    /// keeps perceived latency well under human reaction time while costing
    /// at most ten wakeups per second per in-flight stream. Raising it
    /// trades snappiness for idle wakeups; values under ~10 ms just burn
    /// CPU re-reading an unchanged file.
    pub poll_interval_ms: u64,

    /// Number of concurrent page-image downloads per request. Default: 4.
    ///
    /// IIIF image servers are usually happy to serve a handful of parallel
    /// requests but some institutions throttle aggressively. 4 is a polite
    /// default that still overlaps network latency; raise it for servers
    /// you control.
    pub download_concurrency: usize,

    /// Maximum CPU-bound jobs (PDF assembly, OCR) running at once. Range: 1–8. Default: 2.
    ///
    /// Assembly and OCR run on the blocking thread pool. Without a cap, a
    /// burst of requests would grow that pool without bound and thrash the
    /// machine; with it, excess requests queue on a semaphore and their
    /// streams simply show the download phase taking longer to hand over.
    pub blocking_jobs: usize,

    /// HTTP timeout for manifest and image requests, in seconds. Default: 120.
    pub http_timeout_secs: u64,

    /// OCR executable to spawn. Default: `ocrmypdf`.
    ///
    /// Must accept `--language <lang> --output-type pdf --optimize 0
    /// <input> <output>`. Point this at an absolute path when the binary
    /// is not on `PATH`.
    pub ocr_command: String,

    /// OCR recognition language passed to the executable. Default: `eng`.
    pub ocr_language: String,

    /// Wall-clock budget for one OCR run, in seconds. Default: 600.
    ///
    /// OCR time scales with page count and scan resolution. Ten minutes
    /// covers multi-hundred-page volumes at typical IIIF resolutions; the
    /// stream reports a timeout error rather than hanging past it.
    pub ocr_timeout_secs: u64,

    /// CORS origin allowlist. An empty list means a permissive layer.
    ///
    /// Defaults to the origins the public frontend is served from. Clear
    /// it for local development against arbitrary dev-server ports.
    pub allowed_origins: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("img"),
            bind_addr: "0.0.0.0".to_string(),
            port: 8000,
            poll_interval_ms: 100,
            download_concurrency: 4,
            blocking_jobs: 2,
            http_timeout_secs: 120,
            ocr_command: "ocrmypdf".to_string(),
            ocr_language: "eng".to_string(),
            ocr_timeout_secs: 600,
            allowed_origins: vec![
                "http://iiif-downloader.liamengland.com".to_string(),
                "http://localhost".to_string(),
                "http://localhost:5173".to_string(),
            ],
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn data_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_root = path.into();
        self
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms.clamp(10, 2000);
        self
    }

    pub fn download_concurrency(mut self, n: usize) -> Self {
        self.config.download_concurrency = n.max(1);
        self
    }

    pub fn blocking_jobs(mut self, n: usize) -> Self {
        self.config.blocking_jobs = n.clamp(1, 8);
        self
    }

    pub fn http_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http_timeout_secs = secs;
        self
    }

    pub fn ocr_command(mut self, command: impl Into<String>) -> Self {
        self.config.ocr_command = command.into();
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn ocr_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_timeout_secs = secs;
        self
    }

    pub fn allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.config.allowed_origins = origins;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, Iiif2PdfError> {
        let c = &self.config;
        if c.data_root.as_os_str().is_empty() {
            return Err(Iiif2PdfError::InvalidConfig(
                "data_root must not be empty".into(),
            ));
        }
        if c.poll_interval_ms == 0 {
            return Err(Iiif2PdfError::InvalidConfig(
                "poll_interval_ms must be ≥ 1".into(),
            ));
        }
        if c.download_concurrency == 0 {
            return Err(Iiif2PdfError::InvalidConfig(
                "download_concurrency must be ≥ 1".into(),
            ));
        }
        if c.blocking_jobs == 0 {
            return Err(Iiif2PdfError::InvalidConfig(
                "blocking_jobs must be ≥ 1".into(),
            ));
        }
        if c.http_timeout_secs == 0 {
            return Err(Iiif2PdfError::InvalidConfig(
                "http_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.ocr_command.trim().is_empty() {
            return Err(Iiif2PdfError::InvalidConfig(
                "ocr_command must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
