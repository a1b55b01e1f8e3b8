//! Manifest resolution and page-image download.
//!
//! [`HttpManifestDownloader`] fetches the IIIF manifest, pulls the page
//! image URLs out of it (Presentation v2 and v3 shapes), downloads the
//! images concurrently into the workspace, and optionally narrates its
//! milestones into the workspace progress log for the tailer to forward.
//!
//! The [`ManifestDownloader`] trait is the seam the orchestrator depends
//! on; integration tests substitute a scripted implementation that writes
//! fixture images and fabricated progress lines.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use image::codecs::jpeg::JpegEncoder;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::error::Iiif2PdfError;
use crate::progress::ProgressLog;

/// Downloads the page images referenced by a IIIF manifest.
pub trait ManifestDownloader: Send + Sync {
    /// Populate `target` with lexicographically sortable page images
    /// (`0001.jpg`, `0002.jpg`, …), resized to `pct_size` of their source
    /// dimensions. When `log` is given, append one milestone line per
    /// event and finish with the sentinel on success; on failure, leave
    /// the log unterminated (the tailer's producer-done bound covers it).
    ///
    /// Returns the number of page images written.
    fn download<'a>(
        &'a self,
        manifest_url: &'a str,
        target: &'a Path,
        pct_size: f32,
        log: Option<&'a ProgressLog>,
    ) -> BoxFuture<'a, Result<usize, Iiif2PdfError>>;
}

/// Production downloader backed by reqwest.
pub struct HttpManifestDownloader {
    client: reqwest::Client,
    timeout_secs: u64,
    concurrency: usize,
    blocking_jobs: Arc<Semaphore>,
}

impl HttpManifestDownloader {
    /// `blocking_jobs` is the shared CPU-work semaphore: page resizes draw
    /// their permits from the same pool as assembly and OCR.
    pub fn new(
        config: &ServiceConfig,
        blocking_jobs: Arc<Semaphore>,
    ) -> Result<Self, Iiif2PdfError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| Iiif2PdfError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout_secs: config.http_timeout_secs,
            concurrency: config.download_concurrency,
            blocking_jobs,
        })
    }

    async fn fetch_manifest(&self, url: &str) -> Result<Value, Iiif2PdfError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                Iiif2PdfError::RequestTimeout {
                    url: url.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                Iiif2PdfError::ManifestFetchFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(Iiif2PdfError::ManifestFetchFailed {
                url: url.to_string(),
                reason: format!("HTTP status {}", response.status()),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| Iiif2PdfError::ManifestFetchFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        serde_json::from_str(&body).map_err(|e| Iiif2PdfError::ManifestParseFailed {
            url: url.to_string(),
            detail: e.to_string(),
        })
    }

    async fn fetch_page(
        &self,
        url: &str,
        path: &Path,
        pct_size: f32,
        total: usize,
        completed: &AtomicUsize,
        log: Option<&ProgressLog>,
    ) -> Result<(), Iiif2PdfError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                Iiif2PdfError::RequestTimeout {
                    url: url.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                Iiif2PdfError::ImageDownloadFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(Iiif2PdfError::ImageDownloadFailed {
                url: url.to_string(),
                reason: format!("HTTP status {}", response.status()),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Iiif2PdfError::ImageDownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        // At 100% the source bytes pass through without a decode cycle.
        if pct_size < 1.0 {
            let resized = self.resize_on_worker(bytes.to_vec(), pct_size, path).await?;
            tokio::fs::write(path, &resized).await?;
        } else {
            tokio::fs::write(path, &bytes).await?;
        }

        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(url, page = done, total, "page image stored");
        if let Some(log) = log {
            log.append(&format!("Downloaded image {}/{}.", done, total))
                .await?;
        }
        Ok(())
    }

    /// Run [`resize_to_jpeg`] on the blocking pool, holding a worker permit
    /// for the duration. Decoding and Lanczos resampling a scan is CPU
    /// work; inline it would stall the async threads that drive the other
    /// downloads and the progress tailer.
    async fn resize_on_worker(
        &self,
        bytes: Vec<u8>,
        pct: f32,
        path: &Path,
    ) -> Result<Vec<u8>, Iiif2PdfError> {
        let _permit = self
            .blocking_jobs
            .acquire()
            .await
            .map_err(|_| Iiif2PdfError::Internal("blocking-job semaphore closed".into()))?;
        let page = path.to_path_buf();
        tokio::task::spawn_blocking(move || resize_to_jpeg(&bytes, pct, &page))
            .await
            .map_err(|e| Iiif2PdfError::Internal(format!("resize task panicked: {}", e)))?
    }
}

impl ManifestDownloader for HttpManifestDownloader {
    fn download<'a>(
        &'a self,
        manifest_url: &'a str,
        target: &'a Path,
        pct_size: f32,
        log: Option<&'a ProgressLog>,
    ) -> BoxFuture<'a, Result<usize, Iiif2PdfError>> {
        Box::pin(async move {
            if let Some(log) = log {
                log.append("Fetching IIIF manifest...").await?;
            }

            let manifest = self.fetch_manifest(manifest_url).await?;
            let image_urls = extract_image_urls(&manifest);
            if image_urls.is_empty() {
                return Err(Iiif2PdfError::EmptyManifest {
                    url: manifest_url.to_string(),
                });
            }

            let total = image_urls.len();
            info!(url = manifest_url, images = total, "manifest resolved");
            if let Some(log) = log {
                log.append(&format!("Downloading {} page images...", total))
                    .await?;
            }

            // Each page future owns its URL; handing the closure borrowed
            // vec items does not get past closure lifetime inference here.
            let completed = AtomicUsize::new(0);
            let mut fetches = stream::iter(image_urls.into_iter().enumerate().map(|(idx, url)| {
                let path = target.join(page_file_name(idx));
                let completed = &completed;
                async move {
                    self.fetch_page(&url, &path, pct_size, total, completed, log)
                        .await
                }
            }))
            .buffer_unordered(self.concurrency);

            while let Some(result) = fetches.next().await {
                result?;
            }

            if let Some(log) = log {
                log.finish().await?;
            }
            Ok(total)
        })
    }
}

/// File name for the page image at `index` (0-based), zero-padded so a
/// lexicographic sort recovers page order.
fn page_file_name(index: usize) -> String {
    format!("{:04}.jpg", index + 1)
}

/// Pull page-image URLs out of a IIIF Presentation manifest.
///
/// v2 nests them as `sequences[].canvases[].images[].resource.@id`,
/// v3 as `items[].items[].items[].body.id`. A manifest that matches
/// neither shape yields an empty list.
fn extract_image_urls(manifest: &Value) -> Vec<String> {
    fn arr<'a>(value: &'a Value, key: &str) -> &'a [Value] {
        value
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    let mut urls = Vec::new();

    for sequence in arr(manifest, "sequences") {
        for canvas in arr(sequence, "canvases") {
            for image in arr(canvas, "images") {
                if let Some(id) = image
                    .get("resource")
                    .and_then(|r| r.get("@id"))
                    .and_then(Value::as_str)
                {
                    urls.push(id.to_string());
                }
            }
        }
    }

    if urls.is_empty() {
        for canvas in arr(manifest, "items") {
            for page in arr(canvas, "items") {
                for annotation in arr(page, "items") {
                    if let Some(id) = annotation
                        .get("body")
                        .and_then(|b| b.get("id"))
                        .and_then(Value::as_str)
                    {
                        urls.push(id.to_string());
                    }
                }
            }
        }
    }

    urls
}

/// Decode `bytes`, scale both dimensions by `pct`, re-encode as JPEG.
fn resize_to_jpeg(bytes: &[u8], pct: f32, path: &Path) -> Result<Vec<u8>, Iiif2PdfError> {
    let img = image::load_from_memory(bytes).map_err(|e| Iiif2PdfError::ImageDecodeFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let width = ((img.width() as f32 * pct).round().max(1.0)) as u32;
    let height = ((img.height() as f32 * pct).round().max(1.0)) as u32;
    let resized = img.resize_exact(width, height, image::imageops::FilterType::Lanczos3);

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, 85);
    encoder
        .encode_image(&resized.to_rgb8())
        .map_err(|e| Iiif2PdfError::Internal(format!("JPEG encoding failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_file_names_sort_into_page_order() {
        assert_eq!(page_file_name(0), "0001.jpg");
        assert_eq!(page_file_name(11), "0012.jpg");
        assert!(page_file_name(998) < page_file_name(999));
        assert!(page_file_name(999) < page_file_name(1000));
    }

    #[test]
    fn extracts_v2_manifest_urls() {
        let manifest = json!({
            "@context": "http://iiif.io/api/presentation/2/context.json",
            "sequences": [{
                "canvases": [
                    { "images": [{ "resource": { "@id": "https://example.org/p1.jpg" } }] },
                    { "images": [{ "resource": { "@id": "https://example.org/p2.jpg" } }] }
                ]
            }]
        });

        assert_eq!(
            extract_image_urls(&manifest),
            vec!["https://example.org/p1.jpg", "https://example.org/p2.jpg"]
        );
    }

    #[test]
    fn extracts_v3_manifest_urls() {
        let manifest = json!({
            "@context": "http://iiif.io/api/presentation/3/context.json",
            "items": [{
                "items": [{
                    "items": [{ "body": { "id": "https://example.org/p1.jpg" } }]
                }]
            }, {
                "items": [{
                    "items": [{ "body": { "id": "https://example.org/p2.jpg" } }]
                }]
            }]
        });

        assert_eq!(
            extract_image_urls(&manifest),
            vec!["https://example.org/p1.jpg", "https://example.org/p2.jpg"]
        );
    }

    #[test]
    fn unrecognised_manifest_yields_no_urls() {
        let manifest = json!({ "label": "not a manifest" });
        assert!(extract_image_urls(&manifest).is_empty());
    }

    #[test]
    fn resize_halves_dimensions() {
        let src = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            100,
            80,
            image::Rgba([120, 40, 200, 255]),
        ));
        let mut bytes = Vec::new();
        src.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();

        let out = resize_to_jpeg(&bytes, 0.5, Path::new("0001.jpg")).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.width(), 50);
        assert_eq!(decoded.height(), 40);
    }

    #[test]
    fn resize_rejects_garbage_bytes() {
        let err = resize_to_jpeg(b"definitely not an image", 0.5, Path::new("0001.jpg"));
        assert!(matches!(
            err,
            Err(Iiif2PdfError::ImageDecodeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn worker_resize_returns_its_permit_to_the_pool() {
        let jobs = Arc::new(Semaphore::new(1));
        let config = ServiceConfig::builder().build().unwrap();
        let downloader = HttpManifestDownloader::new(&config, Arc::clone(&jobs)).unwrap();

        let src = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            100,
            80,
            image::Rgba([120, 40, 200, 255]),
        ));
        let mut bytes = Vec::new();
        src.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();

        let out = downloader
            .resize_on_worker(bytes, 0.5, Path::new("0001.jpg"))
            .await
            .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (50, 40));
        assert_eq!(jobs.available_permits(), 1, "permit must be released");
    }
}
