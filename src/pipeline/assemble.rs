//! Image-to-PDF assembly.
//!
//! Takes the workspace's downloaded page images (sorted by file name, which
//! [`crate::pipeline::fetch`] guarantees is page order) and produces the
//! bytes of a single PDF with one page per image. Pages are sized so the
//! image fills them exactly at [`PAGE_DPI`]; the bitmap goes in untouched,
//! with no recompression and no optimization.
//!
//! ## Why `spawn_blocking`?
//!
//! Decoding a few hundred JPEGs and serialising a multi-megabyte document
//! is pure CPU work. Run on the async executor it would stall every other
//! in-flight stream's polling; [`assemble`] therefore does the work inside
//! [`tokio::task::spawn_blocking`] and the orchestrator additionally gates
//! entry through the shared blocking-jobs semaphore.

use std::io::Write;
use std::path::{Path, PathBuf};

use printpdf::image_crate::GenericImageView;
use printpdf::{Image, ImageTransform, Mm, PdfDocument, PdfLayerIndex, PdfPageIndex, Px};
use tracing::{debug, info};

use crate::error::Iiif2PdfError;

/// Resolution at which page pixels map onto PDF points.
///
/// Page images arrive pre-scaled by the download stage, so the PDF page is
/// simply the image at a fixed density; 96 DPI gives familiar screen-sized
/// pages.
const PAGE_DPI: f32 = 96.0;

/// Assemble every page image in `image_dir` into a single PDF.
///
/// Returns the PDF bytes; the caller decides where they land.
pub async fn assemble(image_dir: &Path) -> Result<Vec<u8>, Iiif2PdfError> {
    let images = collect_page_images(image_dir).await?;
    if images.is_empty() {
        return Err(Iiif2PdfError::NoPageImages {
            dir: image_dir.to_path_buf(),
        });
    }

    let count = images.len();
    debug!(pages = count, dir = %image_dir.display(), "assembling PDF");

    let bytes = tokio::task::spawn_blocking(move || assemble_blocking(&images))
        .await
        .map_err(|e| Iiif2PdfError::Internal(format!("PDF assembly task panicked: {}", e)))??;

    info!(pages = count, bytes = bytes.len(), "PDF assembled");
    Ok(bytes)
}

/// List the page images in `dir`, sorted by file name.
async fn collect_page_images(dir: &Path) -> Result<Vec<PathBuf>, Iiif2PdfError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut images = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            .unwrap_or(false);
        if is_image && entry.file_type().await?.is_file() {
            images.push(path);
        }
    }

    images.sort();
    Ok(images)
}

/// Synchronous assembly core. Call from a blocking context only.
fn assemble_blocking(images: &[PathBuf]) -> Result<Vec<u8>, Iiif2PdfError> {
    let first = load_image(&images[0])?;
    let (width, height) = page_size_mm(&first);
    let (doc, page_idx, layer_idx) = PdfDocument::new("iiif2pdf", width, height, "Page 1");
    place_image(&doc, page_idx, layer_idx, &first);

    for (i, path) in images.iter().enumerate().skip(1) {
        let img = load_image(path)?;
        let (width, height) = page_size_mm(&img);
        let (page_idx, layer_idx) = doc.add_page(width, height, format!("Page {}", i + 1));
        place_image(&doc, page_idx, layer_idx, &img);
    }

    let mut bytes = Vec::new();
    {
        let mut writer = std::io::BufWriter::new(&mut bytes);
        doc.save(&mut writer)
            .map_err(|e| Iiif2PdfError::AssemblyFailed {
                detail: e.to_string(),
            })?;
        writer.flush()?;
    }
    Ok(bytes)
}

/// Decode a page image, selecting the format by content rather than file
/// extension. Full-size downloads store the server's bytes verbatim under
/// a `.jpg` name, and some IIIF servers deliver PNG.
fn load_image(path: &Path) -> Result<printpdf::image_crate::DynamicImage, Iiif2PdfError> {
    printpdf::image_crate::io::Reader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| Iiif2PdfError::ImageDecodeFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?
        .decode()
        .map_err(|e| Iiif2PdfError::ImageDecodeFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

fn page_size_mm(img: &printpdf::image_crate::DynamicImage) -> (Mm, Mm) {
    let (w, h) = img.dimensions();
    (
        Mm::from(Px(w as usize).into_pt(PAGE_DPI)),
        Mm::from(Px(h as usize).into_pt(PAGE_DPI)),
    )
}

fn place_image(
    doc: &printpdf::PdfDocumentReference,
    page: PdfPageIndex,
    layer: PdfLayerIndex,
    img: &printpdf::image_crate::DynamicImage,
) {
    let layer_ref = doc.get_page(page).get_layer(layer);
    let pdf_image = Image::from_dynamic_image(img);
    pdf_image.add_to_layer(
        layer_ref,
        ImageTransform {
            dpi: Some(PAGE_DPI),
            ..Default::default()
        },
    );
}
