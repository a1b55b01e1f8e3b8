//! Streaming conversion API: progress events as they happen.
//!
//! ## Why stream?
//!
//! A large manifest takes minutes to download and OCR. The streaming entry
//! point yields one [`ProgressEvent`] per pipeline step so an SSE client
//! can show live progress, then hands over the retrieval URL once the
//! artifact is on disk. Unlike [`Converter::convert`], the workspace is
//! *kept* at the end; the retrieval endpoint deletes it after serving.
//!
//! The wire payloads, one per SSE `data:` frame:
//!
//! ```text
//! Fetching IIIF manifest...
//! Downloading 12 page images...
//! Downloaded image 1/12.
//! ...
//! Converting images to PDF...
//! PDF created successfully.
//! Running OCR on the PDF... this can take a while. Please be patient!
//! OCR completed successfully.
//! pdfurl:/tmp/<uuid>/pdf/out_ocr.pdf
//! close
//! ```
//!
//! A failed run ends with `error:<message>` followed by `close` instead.

use crate::convert::{ConversionRequest, Converter, FinishedRun, RunOutcome};
use crate::progress::ProgressSink;
use std::fmt;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::{info, warn};

/// A boxed stream of progress events.
pub type EventStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// One frame of the streamed conversion protocol.
///
/// `Display` renders the exact wire payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A human-readable progress line, forwarded verbatim.
    Message(String),
    /// Retrieval path of the finished artifact.
    PdfUrl(String),
    /// The run failed; no artifact will follow.
    Error(String),
    /// Terminal frame. Nothing is ever sent after it.
    Close,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Message(message) => f.write_str(message),
            ProgressEvent::PdfUrl(path) => write!(f, "pdfurl:{}", path),
            ProgressEvent::Error(message) => write!(f, "error:{}", message),
            ProgressEvent::Close => f.write_str("close"),
        }
    }
}

/// Sink feeding the pipeline's progress into the event channel.
///
/// A failed send means the receiver (and with it the client) is gone,
/// which [`Converter::run_pipeline`] treats as a disconnect.
struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink for ChannelSink {
    fn emit(&self, message: &str) -> bool {
        self.tx
            .send(ProgressEvent::Message(message.to_owned()))
            .is_ok()
    }
}

impl Converter {
    /// Run the pipeline in a background task and stream its progress.
    ///
    /// The stream always terminates: with `pdfurl:` + `close` on success,
    /// with `error:` + `close` on failure, or by ending early when the
    /// pipeline notices the receiver is gone. Dropping the stream aborts
    /// the run and rolls its workspace back.
    pub fn convert_stream(&self, request: ConversionRequest) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let converter = self.clone();

        tokio::spawn(async move {
            let sink = ChannelSink { tx: tx.clone() };
            match converter.run_pipeline(&request, &sink).await {
                Ok(RunOutcome::Finished(finished)) => deliver_artifact(&tx, finished),
                Ok(RunOutcome::Disconnected) => {
                    info!("Streaming client disconnected; run rolled back");
                }
                Err(e) => {
                    warn!("Streamed conversion failed: {}", e);
                    let _ = tx.send(ProgressEvent::Error(single_line(&e.to_string())));
                    let _ = tx.send(ProgressEvent::Close);
                }
            }
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

/// Hand a finished run over to the streaming client.
///
/// The workspace is persisted only once the `pdfurl:` frame is accepted:
/// a client that is already gone can never call the retrieval endpoint,
/// so its run rolls back instead of stranding the artifact on disk.
fn deliver_artifact(tx: &mpsc::UnboundedSender<ProgressEvent>, finished: FinishedRun) {
    let retrieval = finished.workspace.retrieval_path(finished.ocr_applied);
    if tx.send(ProgressEvent::PdfUrl(retrieval.clone())).is_err() {
        info!(
            "Client left before the artifact URL was delivered, rolling back {}",
            finished.workspace.id()
        );
        return;
    }
    let kept = finished.workspace.persist();
    info!("Artifact ready at {} (kept in {})", retrieval, kept.display());
    let _ = tx.send(ProgressEvent::Close);
}

/// Error displays may span lines (remediation hints); frames are one line.
fn single_line(message: &str) -> String {
    message.replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::error::Iiif2PdfError;
    use crate::pipeline::fetch::ManifestDownloader;
    use crate::progress::ProgressLog;
    use crate::workspace::Workspace;
    use futures::future::BoxFuture;
    use futures::StreamExt;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn display_matches_the_wire_format() {
        assert_eq!(
            ProgressEvent::Message("PDF created successfully.".into()).to_string(),
            "PDF created successfully."
        );
        assert_eq!(
            ProgressEvent::PdfUrl("/tmp/abc/pdf/out.pdf".into()).to_string(),
            "pdfurl:/tmp/abc/pdf/out.pdf"
        );
        assert_eq!(
            ProgressEvent::Error("boom".into()).to_string(),
            "error:boom"
        );
        assert_eq!(ProgressEvent::Close.to_string(), "close");
    }

    #[test]
    fn single_line_flattens_hints() {
        assert_eq!(single_line("a\nb"), "a b");
        assert_eq!(single_line("plain"), "plain");
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChannelSink { tx };
        assert!(sink.emit("hello"));
        drop(rx);
        assert!(!sink.emit("anyone there?"));
    }

    /// Downloader that fails after one progress line.
    struct FailingDownloader;

    impl ManifestDownloader for FailingDownloader {
        fn download<'a>(
            &'a self,
            manifest_url: &'a str,
            _target: &'a Path,
            _pct_size: f32,
            log: Option<&'a ProgressLog>,
        ) -> BoxFuture<'a, Result<usize, Iiif2PdfError>> {
            Box::pin(async move {
                if let Some(log) = log {
                    log.append("Fetching IIIF manifest...").await?;
                }
                Err(Iiif2PdfError::ManifestFetchFailed {
                    url: manifest_url.to_owned(),
                    reason: "connection refused".into(),
                })
            })
        }
    }

    /// Downloader that trickles progress lines forever (until aborted).
    struct TricklingDownloader;

    impl ManifestDownloader for TricklingDownloader {
        fn download<'a>(
            &'a self,
            _manifest_url: &'a str,
            _target: &'a Path,
            _pct_size: f32,
            log: Option<&'a ProgressLog>,
        ) -> BoxFuture<'a, Result<usize, Iiif2PdfError>> {
            Box::pin(async move {
                for i in 1..=9999 {
                    if let Some(log) = log {
                        log.append(&format!("Downloaded image {}/9999.", i)).await?;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Ok(9999)
            })
        }
    }

    fn converter_with(
        data_root: std::path::PathBuf,
        downloader: Arc<dyn ManifestDownloader>,
    ) -> Converter {
        let config = ServiceConfig::builder()
            .data_root(data_root)
            .poll_interval_ms(10)
            .build()
            .unwrap();
        Converter::new(config).unwrap().with_downloader(downloader)
    }

    #[tokio::test]
    async fn failed_run_ends_with_error_then_close() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("img");
        let converter = converter_with(root.clone(), Arc::new(FailingDownloader));
        let request = ConversionRequest::new("http://example.org/manifest", false, 0.5).unwrap();

        let events: Vec<ProgressEvent> = converter.convert_stream(request).collect().await;

        assert_eq!(
            events.first(),
            Some(&ProgressEvent::Message("Fetching IIIF manifest...".into()))
        );
        let tail = &events[events.len() - 2..];
        assert!(matches!(tail[0], ProgressEvent::Error(ref m) if m.contains("connection refused")));
        assert_eq!(tail[1], ProgressEvent::Close);

        // The failed run's workspace must be gone by the time the stream ends.
        let leftovers: Vec<_> = std::fs::read_dir(&root).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn dropped_stream_rolls_back_the_run() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("img");
        let converter = converter_with(root.clone(), Arc::new(TricklingDownloader));
        let request = ConversionRequest::new("http://example.org/manifest", false, 0.5).unwrap();

        let mut stream = converter.convert_stream(request);
        assert!(stream.next().await.is_some(), "expected initial progress");
        drop(stream);

        // Rollback happens in the detached supervisor; give it a moment.
        for _ in 0..100 {
            let empty = std::fs::read_dir(&root)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false);
            if empty {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("workspace still present after the stream was dropped");
    }

    #[tokio::test]
    async fn departed_client_rolls_back_a_finished_run() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("img");
        let workspace = Workspace::create(&root).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        deliver_artifact(
            &tx,
            FinishedRun {
                workspace,
                ocr_applied: false,
            },
        );

        let leftovers: Vec<_> = std::fs::read_dir(&root).unwrap().collect();
        assert!(leftovers.is_empty(), "workspace outlived its departed client");
    }

    #[tokio::test]
    async fn accepted_url_frame_persists_the_workspace() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("img");
        let workspace = Workspace::create(&root).await.unwrap();
        let retrieval = workspace.retrieval_path(true);
        let kept = workspace.root().to_path_buf();
        let (tx, mut rx) = mpsc::unbounded_channel();

        deliver_artifact(
            &tx,
            FinishedRun {
                workspace,
                ocr_applied: true,
            },
        );

        assert_eq!(rx.recv().await, Some(ProgressEvent::PdfUrl(retrieval)));
        assert_eq!(rx.recv().await, Some(ProgressEvent::Close));
        assert!(kept.is_dir(), "persisted workspace must survive");
    }
}
