//! OCR text-layer extraction.
//!
//! OCR happens out-of-process: [`OcrmypdfEngine`] spawns the `ocrmypdf`
//! executable with a fixed option set (language from config, PDF output,
//! optimize level 0, no deskew, no page rotation) and waits for it under a
//! timeout. Keeping it a subprocess isolates a large native dependency
//! chain (tesseract, ghostscript) from the service process; if the tool is
//! missing the request fails with an actionable error instead of the
//! service failing to build.
//!
//! [`OcrEngine`] is the seam: integration tests substitute an engine that
//! copies its input, since real OCR on fixture images is minutes of work.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::error::Iiif2PdfError;

/// Adds a searchable text layer to an assembled PDF.
pub trait OcrEngine: Send + Sync {
    /// Read `input`, write `output` with an embedded text layer.
    fn process<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), Iiif2PdfError>>;
}

/// Production engine shelling out to ocrmypdf.
pub struct OcrmypdfEngine {
    command: String,
    language: String,
    timeout: Duration,
}

impl OcrmypdfEngine {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            command: config.ocr_command.clone(),
            language: config.ocr_language.clone(),
            timeout: Duration::from_secs(config.ocr_timeout_secs),
        }
    }
}

impl OcrEngine for OcrmypdfEngine {
    fn process<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), Iiif2PdfError>> {
        Box::pin(async move {
            debug!(command = %self.command, input = %input.display(), "starting OCR");

            let child = Command::new(&self.command)
                .arg("--language")
                .arg(&self.language)
                .arg("--output-type")
                .arg("pdf")
                .arg("--optimize")
                .arg("0")
                .arg(input)
                .arg(output)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                // If the timeout wins the race below, dropping the child
                // must take the process down with it.
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Iiif2PdfError::OcrUnavailable {
                    command: self.command.clone(),
                    reason: e.to_string(),
                })?;

            let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
            match waited {
                Err(_) => Err(Iiif2PdfError::OcrTimeout {
                    secs: self.timeout.as_secs(),
                }),
                Ok(Err(e)) => Err(Iiif2PdfError::OcrFailed {
                    detail: format!("failed to wait for OCR process: {}", e),
                }),
                Ok(Ok(out)) if !out.status.success() => {
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    Err(Iiif2PdfError::OcrFailed {
                        detail: format!("{}: {}", out.status, stderr.trim()),
                    })
                }
                Ok(Ok(_)) => {
                    info!(output = %output.display(), "OCR complete");
                    Ok(())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(command: &str, timeout_secs: u64) -> OcrmypdfEngine {
        let config = ServiceConfig::builder()
            .ocr_command(command)
            .ocr_timeout_secs(timeout_secs)
            .build()
            .unwrap();
        OcrmypdfEngine::new(&config)
    }

    #[tokio::test]
    async fn missing_executable_is_unavailable() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.pdf");
        let output = dir.path().join("out.pdf");
        std::fs::write(&input, b"%PDF-").unwrap();

        let engine = engine("definitely-not-an-ocr-binary-7f3a", 5);
        let err = engine.process(&input, &output).await;
        assert!(matches!(err, Err(Iiif2PdfError::OcrUnavailable { .. })));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.pdf");
        let output = dir.path().join("out.pdf");
        std::fs::write(&input, b"%PDF-").unwrap();

        // `false` ignores its arguments and exits 1 with no stderr; the
        // status code alone must still produce a useful message.
        let engine = engine("false", 5);
        match engine.process(&input, &output).await {
            Err(Iiif2PdfError::OcrFailed { detail }) => {
                assert!(detail.contains("exit status"), "got: {detail}");
            }
            other => panic!("expected OcrFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_process_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let input = dir.path().join("in.pdf");
        let output = dir.path().join("out.pdf");
        std::fs::write(&input, b"%PDF-").unwrap();

        // Fake OCR tool that swallows its arguments and hangs.
        let script = dir.path().join("slow-ocr");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = OcrmypdfEngine {
            command: script.to_string_lossy().into_owned(),
            language: "eng".into(),
            timeout: Duration::from_millis(200),
        };

        let err = engine.process(&input, &output).await;
        assert!(matches!(err, Err(Iiif2PdfError::OcrTimeout { .. })));
    }
}
