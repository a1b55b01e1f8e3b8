//! Per-request scratch directories.
//!
//! Every request owns exactly one [`Workspace`]: a UUID-named directory
//! under the configured data root holding the downloaded page images, a
//! `pdf/` subdirectory for the assembled artifacts, and (for streamed
//! requests) the `events.log` progress file. Nothing is shared between
//! requests, so the pipeline never needs cross-request locking.
//!
//! # Lifecycle
//!
//! A workspace is removed when the value drops. Failure paths therefore
//! clean up for free: an `?` anywhere in the pipeline unwinds through the
//! owning function and the directory goes with it. The two ways a
//! workspace outlives its request are explicit:
//!
//! * [`Workspace::persist`] disarms the drop cleanup once an artifact must
//!   survive for the retrieval endpoint to serve later.
//! * [`cleanup_artifact`] is the deferred, retrieval-time removal that runs
//!   after the artifact body has been fully sent to the client.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Iiif2PdfError;

/// File name of the progress log inside a workspace.
pub const EVENTS_LOG: &str = "events.log";

/// File name of the assembled PDF inside the workspace's `pdf/` directory.
pub const PDF_NAME: &str = "out.pdf";

/// File name of the OCR'd PDF inside the workspace's `pdf/` directory.
pub const OCR_PDF_NAME: &str = "out_ocr.pdf";

/// An exclusively-owned scratch directory for one request.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    root: PathBuf,
    keep: bool,
}

impl Workspace {
    /// Allocate a fresh workspace under `data_root`.
    ///
    /// Creates `<data_root>/<uuid>/pdf/` so both the image directory and
    /// the artifact directory exist before any pipeline stage runs.
    pub async fn create(data_root: &Path) -> Result<Self, Iiif2PdfError> {
        let id = Uuid::new_v4().to_string();
        let root = data_root.join(&id);

        tokio::fs::create_dir_all(root.join("pdf"))
            .await
            .map_err(|source| Iiif2PdfError::WorkspaceCreateFailed {
                path: root.clone(),
                source,
            })?;

        debug!(workspace = %id, path = %root.display(), "workspace created");
        Ok(Self {
            id,
            root,
            keep: false,
        })
    }

    /// The workspace's UUID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The workspace directory itself (holds the raw page images).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `pdf/` artifact directory.
    pub fn pdf_dir(&self) -> PathBuf {
        self.root.join("pdf")
    }

    /// Path of the progress log file.
    pub fn events_log(&self) -> PathBuf {
        self.root.join(EVENTS_LOG)
    }

    /// On-disk path of the final artifact.
    pub fn artifact_path(&self, ocr: bool) -> PathBuf {
        self.pdf_dir()
            .join(if ocr { OCR_PDF_NAME } else { PDF_NAME })
    }

    /// Client-facing retrieval path for the final artifact, as emitted in
    /// the `pdfurl:` frame and accepted by `GET /tmp/{path}`.
    pub fn retrieval_path(&self, ocr: bool) -> String {
        format!(
            "/tmp/{}/pdf/{}",
            self.id,
            if ocr { OCR_PDF_NAME } else { PDF_NAME }
        )
    }

    /// Disarm the drop cleanup and hand the directory over to the
    /// retrieval endpoint's deferred [`cleanup_artifact`].
    ///
    /// Returns the workspace root for logging.
    pub fn persist(mut self) -> PathBuf {
        self.keep = true;
        self.root.clone()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        // Removal is best-effort: a failed cleanup must never mask the
        // error that caused the unwind.
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    workspace = %self.id,
                    path = %self.root.display(),
                    error = %e,
                    "failed to remove workspace"
                );
            }
        } else {
            debug!(workspace = %self.id, "workspace removed");
        }
    }
}

/// Retrieval-time cleanup: remove the workspace that owns `artifact`, or
/// the bare file if its workspace directory is already gone.
///
/// Invariant: never deletes anything outside `data_root`. The workspace
/// directory is only removed when it is a direct child of `data_root`
/// (i.e. the artifact sits at `<data_root>/<uuid>/pdf/<name>`); any other
/// shape falls back to removing just the file.
///
/// Races are tolerated: a path that vanished between the caller's
/// existence check and the removal here counts as already clean and is
/// only logged.
pub fn cleanup_artifact(data_root: &Path, artifact: &Path) {
    let workspace_dir = artifact
        .parent()
        .and_then(Path::parent)
        .filter(|dir| dir.parent() == Some(data_root));

    let result = match workspace_dir {
        Some(dir) if dir.is_dir() => {
            debug!(path = %dir.display(), "removing workspace after delivery");
            std::fs::remove_dir_all(dir)
        }
        _ => std::fs::remove_file(artifact),
    };

    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %artifact.display(), error = %e, "artifact cleanup failed");
        }
    }
}
