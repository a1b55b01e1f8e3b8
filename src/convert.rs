//! Conversion orchestration.
//!
//! Both public entry points run the same pipeline and differ only in how
//! progress leaves the process:
//!
//! * [`Converter::convert`] runs silently and returns the PDF bytes.
//! * [`Converter::convert_stream`] (in [`crate::stream`]) attaches a
//!   channel-backed sink and yields one event per progress line.
//!
//! ## Why spawn the download instead of awaiting it inline?
//!
//! Progress lines are written to the workspace log *by* the download as it
//! works. Forwarding them live means reading the log concurrently with the
//! writer, so the download runs as its own task while [`Converter::run_pipeline`]
//! tails the file. The silent path skips the log entirely and just awaits
//! the task.

use crate::config::ServiceConfig;
use crate::error::Iiif2PdfError;
use crate::pipeline::assemble::assemble;
use crate::pipeline::fetch::{HttpManifestDownloader, ManifestDownloader};
use crate::pipeline::ocr::{OcrEngine, OcrmypdfEngine};
use crate::progress::{tail_log, NoopSink, ProgressLog, ProgressSink, TailEnd};
use crate::workspace::Workspace;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

// ── Progress messages ────────────────────────────────────────────────────
//
// These strings are the streamed wire payloads. Existing clients match on
// them verbatim, so they must never change.

pub const MSG_CONVERTING: &str = "Converting images to PDF...";
pub const MSG_PDF_CREATED: &str = "PDF created successfully.";
pub const MSG_OCR_RUNNING: &str =
    "Running OCR on the PDF... this can take a while. Please be patient!";
pub const MSG_OCR_DONE: &str = "OCR completed successfully.";

// ── Request ──────────────────────────────────────────────────────────────

/// A validated conversion request.
///
/// Construction is the only validation point: once a value exists, the URL
/// has passed the manifest heuristic and `pct_size` is within (0, 1].
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub manifest_url: String,
    /// Run OCR after assembly and serve the OCR'd artifact.
    pub ocr: bool,
    /// Per-dimension scale factor applied to every page image.
    pub pct_size: f32,
}

impl ConversionRequest {
    /// Validate and build a request.
    ///
    /// The URL check is a syntactic heuristic (`http` prefix plus a
    /// `manifest` substring), not a reachability check. It admits URLs that
    /// will fail later at fetch time, and rejects working IIIF endpoints
    /// whose path happens not to contain the word.
    pub fn new(
        manifest_url: impl Into<String>,
        ocr: bool,
        pct_size: f32,
    ) -> Result<Self, Iiif2PdfError> {
        let manifest_url = manifest_url.into();
        if manifest_url.is_empty()
            || !manifest_url.starts_with("http")
            || !manifest_url.contains("manifest")
        {
            return Err(Iiif2PdfError::InvalidManifestUrl { url: manifest_url });
        }
        // NaN fails the first comparison and lands here too.
        if !(pct_size > 0.0 && pct_size <= 1.0) {
            return Err(Iiif2PdfError::InvalidPctSize { value: pct_size });
        }
        Ok(Self {
            manifest_url,
            ocr,
            pct_size,
        })
    }
}

// ── Pipeline outcome ─────────────────────────────────────────────────────

/// A pipeline run that made it to the end. The workspace is still armed:
/// dropping this value deletes the artifact along with everything else.
pub(crate) struct FinishedRun {
    pub workspace: Workspace,
    pub ocr_applied: bool,
}

pub(crate) enum RunOutcome {
    Finished(FinishedRun),
    /// The progress receiver went away mid-run; all work was rolled back.
    Disconnected,
}

// ── Converter ────────────────────────────────────────────────────────────

/// Shared pipeline state. Cheap to clone; clones share the HTTP client and
/// the blocking-job budget.
#[derive(Clone)]
pub struct Converter {
    config: ServiceConfig,
    downloader: Arc<dyn ManifestDownloader>,
    ocr: Arc<dyn OcrEngine>,
    blocking_jobs: Arc<Semaphore>,
}

impl Converter {
    pub fn new(config: ServiceConfig) -> Result<Self, Iiif2PdfError> {
        // One semaphore for every CPU-bound stage; the downloader's page
        // resizes draw from the same pool as assembly and OCR.
        let blocking_jobs = Arc::new(Semaphore::new(config.blocking_jobs));
        let downloader = Arc::new(HttpManifestDownloader::new(
            &config,
            Arc::clone(&blocking_jobs),
        )?);
        let ocr = Arc::new(OcrmypdfEngine::new(&config));
        Ok(Self {
            config,
            downloader,
            ocr,
            blocking_jobs,
        })
    }

    /// Replace the manifest downloader (tests, alternative image sources).
    pub fn with_downloader(mut self, downloader: Arc<dyn ManifestDownloader>) -> Self {
        self.downloader = downloader;
        self
    }

    /// Replace the OCR engine.
    pub fn with_ocr_engine(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Run the full pipeline and return the finished PDF.
    ///
    /// The workspace lives exactly as long as the call: the artifact is
    /// read into memory and the directory is deleted before returning.
    pub async fn convert(&self, request: &ConversionRequest) -> Result<Vec<u8>, Iiif2PdfError> {
        let outcome = self.run_pipeline(request, &NoopSink).await?;
        let RunOutcome::Finished(finished) = outcome else {
            return Err(Iiif2PdfError::Internal(
                "conversion cancelled without an active stream".into(),
            ));
        };

        let artifact = finished.workspace.artifact_path(finished.ocr_applied);
        let bytes = tokio::fs::read(&artifact).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Iiif2PdfError::ArtifactMissing {
                    path: artifact.clone(),
                }
            } else {
                Iiif2PdfError::Io(e)
            }
        })?;
        // `finished` drops here and takes the workspace directory with it.
        Ok(bytes)
    }

    /// Shared pipeline core.
    ///
    /// Every progress message goes through `sink`; a sink that reports its
    /// receiver gone aborts the run and rolls back the workspace.
    pub(crate) async fn run_pipeline(
        &self,
        request: &ConversionRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RunOutcome, Iiif2PdfError> {
        let workspace = Workspace::create(&self.config.data_root).await?;
        info!(
            "Starting conversion of {} (workspace {}, ocr={}, pct_size={})",
            request.manifest_url,
            workspace.id(),
            request.ocr,
            request.pct_size
        );

        // ── Step 1: Download page images ─────────────────────────────────
        let log = if sink.is_active() {
            Some(ProgressLog::create(workspace.events_log()).await?)
        } else {
            None
        };

        let downloader = Arc::clone(&self.downloader);
        let url = request.manifest_url.clone();
        let target = workspace.root().to_path_buf();
        let pct_size = request.pct_size;
        let task_log = log.clone();
        let download = tokio::spawn(async move {
            downloader
                .download(&url, &target, pct_size, task_log.as_ref())
                .await
        });

        if log.is_some() {
            let poll = Duration::from_millis(self.config.poll_interval_ms);
            let tailed = tail_log(&workspace.events_log(), poll, sink, || {
                download.is_finished()
            })
            .await;
            match tailed {
                Ok(TailEnd::Sentinel) | Ok(TailEnd::ProducerFinished) => {}
                Ok(TailEnd::ReceiverGone) => {
                    info!("Client left during download, rolling back {}", workspace.id());
                    download.abort();
                    let _ = download.await;
                    return Ok(RunOutcome::Disconnected);
                }
                Err(e) => {
                    download.abort();
                    let _ = download.await;
                    return Err(e);
                }
            }
        }

        let pages = download
            .await
            .map_err(|e| Iiif2PdfError::Internal(format!("download task panicked: {}", e)))??;
        debug!("Downloaded {} page images", pages);

        // ── Step 2: Assemble the PDF ─────────────────────────────────────
        if !sink.emit(MSG_CONVERTING) {
            return Ok(RunOutcome::Disconnected);
        }
        {
            let _permit = self.acquire_blocking_permit().await?;
            let pdf = assemble(workspace.root()).await?;
            write_artifact(&workspace.artifact_path(false), &pdf).await?;
        }
        if !sink.emit(MSG_PDF_CREATED) {
            return Ok(RunOutcome::Disconnected);
        }

        // ── Step 3: OCR (optional) ───────────────────────────────────────
        if request.ocr {
            if !sink.emit(MSG_OCR_RUNNING) {
                return Ok(RunOutcome::Disconnected);
            }
            {
                let _permit = self.acquire_blocking_permit().await?;
                self.ocr
                    .process(
                        &workspace.artifact_path(false),
                        &workspace.artifact_path(true),
                    )
                    .await?;
            }
            if !sink.emit(MSG_OCR_DONE) {
                return Ok(RunOutcome::Disconnected);
            }
        }

        info!(
            "Conversion finished: {} pages in workspace {} (ocr={})",
            pages,
            workspace.id(),
            request.ocr
        );
        Ok(RunOutcome::Finished(FinishedRun {
            workspace,
            ocr_applied: request.ocr,
        }))
    }

    async fn acquire_blocking_permit(
        &self,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, Iiif2PdfError> {
        self.blocking_jobs
            .acquire()
            .await
            .map_err(|_| Iiif2PdfError::Internal("blocking-job semaphore closed".into()))
    }
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Write `bytes` next to `path` and rename into place, so a concurrent
/// retrieval never observes a half-written artifact.
async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), Iiif2PdfError> {
    let tmp = path.with_extension("pdf.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
