//! Progress plumbing: the emit capability, the workspace log, and the tailer.
//!
//! The pipeline runs identically for the blocking and the streaming
//! endpoint; what differs is whether anyone watches it. That difference is
//! captured by [`ProgressSink`]: the orchestrator emits milestone messages
//! through the sink and never knows whether they land in an SSE channel or
//! in [`NoopSink`].
//!
//! ## Why a log file between downloader and stream?
//!
//! The download phase reports sub-progress (one line per fetched image)
//! while it is still running. Rather than threading a channel through the
//! downloader, it appends lines to the workspace's `events.log` and the
//! orchestrator tails that file:
//!
//! ```text
//!   download task ──append──▶ events.log ◀──poll── tailer ──▶ ProgressSink
//! ```
//!
//! The file is the full integration surface, so any producer that can
//! append lines (including an external process) can feed the stream. The
//! tailer polls at a fixed interval instead of using a file-watch
//! primitive; the latency cost is bounded by the interval and the
//! mechanism works on every filesystem.
//!
//! Two invariants make the handoff safe with zero locking:
//!
//! * exactly one writer and one reader per log, and
//! * every append is one complete `\n`-terminated line per write call, so
//!   the reader never treats a torn line as finished.
//!
//! The producer ends its output with [`SENTINEL`]. A producer that dies
//! without writing it would leave a naive tailer polling forever, so
//! [`tail_log`] also watches a `producer_done` signal and stops once the
//! producer is gone and the file is drained.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::Iiif2PdfError;

/// Reserved log line marking end-of-producer-output. Never forwarded.
pub const SENTINEL: &str = "END---";

// ── The emit capability ──────────────────────────────────────────────────

/// Destination for human-readable progress messages.
///
/// Implementations must be cheap and non-blocking: the orchestrator calls
/// [`emit`](Self::emit) between pipeline stages and from the tail loop.
pub trait ProgressSink: Send + Sync {
    /// Deliver one progress message.
    ///
    /// Returns `false` when the receiving side is gone (client
    /// disconnected); the caller should stop producing and clean up.
    fn emit(&self, message: &str) -> bool;

    /// Whether anything observes emitted messages. When `false` the
    /// orchestrator skips the progress-log plumbing entirely.
    fn is_active(&self) -> bool {
        true
    }
}

/// Sink for the blocking endpoint: discards everything.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _message: &str) -> bool {
        true
    }

    fn is_active(&self) -> bool {
        false
    }
}

// ── The workspace progress log ───────────────────────────────────────────

/// Single-writer handle for a workspace's `events.log`.
///
/// Cloneable so it can move into the download task while the path stays
/// known to the orchestrator.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    /// Create (and truncate) the log file.
    ///
    /// Must happen before the writer task is spawned or the tailer starts,
    /// so neither side ever races a nonexistent file.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, Iiif2PdfError> {
        let path = path.into();
        File::create(&path).await?;
        Ok(Self { path })
    }

    /// Append one message as a complete line.
    ///
    /// The trailing newline and the message go down in a single write call;
    /// that is what lets the tailer treat "ends with `\n`" as "complete".
    pub async fn append(&self, message: &str) -> Result<(), Iiif2PdfError> {
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');

        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Append the end-of-output sentinel.
    pub async fn finish(&self) -> Result<(), Iiif2PdfError> {
        self.append(SENTINEL).await
    }
}

// ── The tailer ───────────────────────────────────────────────────────────

/// Why [`tail_log`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailEnd {
    /// The producer wrote the sentinel line.
    Sentinel,
    /// The producer finished without a sentinel and the file is drained.
    ProducerFinished,
    /// The sink reported its receiver gone; tailing is pointless.
    ReceiverGone,
}

/// Forward complete lines from `path` to `sink` until the producer is done.
///
/// Polls at `poll_interval` when no complete line is available. Stops on
/// the [`SENTINEL`] line (not forwarded), or when `producer_done` returned
/// `true` *before* a read that found nothing new; that ordering guarantees
/// every line written before the producer finished has been drained.
pub async fn tail_log(
    path: &Path,
    poll_interval: Duration,
    sink: &dyn ProgressSink,
    producer_done: impl Fn() -> bool,
) -> Result<TailEnd, Iiif2PdfError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut buf = String::new();

    loop {
        // Sampled before the read: a `true` here means everything the
        // producer will ever write is already on disk.
        let done_before_read = producer_done();

        let n = reader.read_line(&mut buf).await?;
        if n == 0 {
            if done_before_read {
                return Ok(TailEnd::ProducerFinished);
            }
            tokio::time::sleep(poll_interval).await;
            continue;
        }

        if !buf.ends_with('\n') {
            // Torn line: the writer is mid-append. `read_line` extends the
            // buffer on the next pass, so just wait for the rest.
            continue;
        }

        let line = buf.trim_end();
        if line.starts_with(SENTINEL) {
            return Ok(TailEnd::Sentinel);
        }
        if !line.is_empty() {
            trace!(line, "tailed progress line");
            if !sink.emit(line) {
                return Ok(TailEnd::ReceiverGone);
            }
        }
        buf.clear();
    }
}
