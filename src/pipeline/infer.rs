//! Inference stage: run the detector over every rasterised page.
//!
//! Each call opens a fresh run directory under the runs root and writes,
//! per page, an annotated copy of the image plus `labels/<stem>.txt`.
//! Prior runs are never touched.

use crate::error::{DrawScanError, UnitError};
use crate::output::{InferenceReport, Status, UnitFailure};
use crate::pipeline::detect::{Detection, DetectionModel, ModelService};
use crate::pipeline::executor::{run_parallel_with, ExecutorOptions};
use crate::pipeline::render::save_jpeg;
use crate::pipeline::runs::{self, page_number_from_stem, LABELS_DIR, RUN_PREFIX};
use crate::progress::{ProgressCallback, Stage};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

const BOX_COLOUR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 3;

/// List the page images of a rasterisation run in page order.
///
/// Files named `page_<n>` are ordered by `n`; anything else follows, by
/// modification time and then name.
pub fn list_page_images(images_dir: &Path) -> Result<Vec<PathBuf>, DrawScanError> {
    let entries = match std::fs::read_dir(images_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DrawScanError::io(images_dir, e)),
    };

    let mut images: Vec<(Option<usize>, Option<SystemTime>, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_image(p))
        .map(|p| {
            let page = p
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(page_number_from_stem);
            let mtime = p.metadata().and_then(|m| m.modified()).ok();
            (page, mtime, p)
        })
        .collect();

    // `None` sorts before `Some`; numbered pages must come first.
    images.sort_by(|a, b| {
        (a.0.is_none(), a.0, a.1, &a.2).cmp(&(b.0.is_none(), b.0, b.1, &b.2))
    });
    Ok(images.into_iter().map(|(_, _, p)| p).collect())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

/// Run detection over every image in `images_dir`.
///
/// Fails fast with [`DrawScanError::ModelNotLoaded`] before touching the
/// filesystem if the model has not been loaded.
pub async fn infer(
    images_dir: &Path,
    runs_root: &Path,
    models: &ModelService,
    opts: ExecutorOptions,
    progress: Option<&ProgressCallback>,
) -> Result<InferenceReport, DrawScanError> {
    let model = models.get().await?;

    // ── Step 1: discover pages and open a fresh run ──────────────────────
    let images = list_page_images(images_dir)?;
    if images.is_empty() {
        return Err(DrawScanError::NoImages {
            dir: images_dir.to_path_buf(),
        });
    }
    let run_dir = runs::create_run_dir(runs_root, RUN_PREFIX)?;
    let labels_dir = run_dir.join(LABELS_DIR);
    std::fs::create_dir(&labels_dir).map_err(|e| DrawScanError::io(&labels_dir, e))?;

    let total = images.len();
    if let Some(cb) = progress {
        cb.on_stage_start(Stage::Inference, total);
    }
    info!(
        "Running inference on {} pages with {} workers → {}",
        total,
        opts.max_workers,
        run_dir.display()
    );

    // ── Step 2: one unit per page ────────────────────────────────────────
    let worker_run_dir = run_dir.clone();
    let outcomes = run_parallel_with(
        images.clone(),
        move |image: PathBuf| detect_page(model.as_ref(), &image, &worker_run_dir),
        opts,
        |idx, outcome| {
            if let Some(cb) = progress {
                match outcome {
                    Ok(_) => cb.on_unit_complete(Stage::Inference, idx + 1, total),
                    Err(e) => cb.on_unit_error(Stage::Inference, idx + 1, total, &e.to_string()),
                }
            }
        },
    )
    .await;

    // ── Step 3: fold outcomes ────────────────────────────────────────────
    let mut successful = 0;
    let mut total_detections = 0;
    let mut errors = Vec::new();
    for (idx, (image, outcome)) in images.into_iter().zip(outcomes).enumerate() {
        let page = idx + 1;
        match outcome {
            Ok(count) => {
                successful += 1;
                total_detections += count;
                info!("Page {}/{}: {} detections", page, total, count);
            }
            Err(e) => {
                warn!("Page {}/{} failed: {}", page, total, e);
                errors.push(UnitFailure::new(page, Some(image), e));
            }
        }
    }

    if let Some(cb) = progress {
        cb.on_stage_complete(Stage::Inference, total, successful);
    }
    info!(
        "Inference completed: {}/{} pages, {} total detections",
        successful, total, total_detections
    );

    Ok(InferenceReport {
        status: Status::from_counts(total, successful),
        run_dir,
        total_pages: total,
        successful,
        failed: errors.len(),
        total_detections,
        errors,
    })
}

/// Detect one page and persist its artifacts. Runs on the blocking pool.
fn detect_page(model: &dyn DetectionModel, image_path: &Path, run_dir: &Path) -> Result<usize, UnitError> {
    let mut detector = model.instance().map_err(UnitError::failed)?;
    let mut image = image::open(image_path)
        .map_err(|e| UnitError::failed(format!("decode {}: {e}", image_path.display())))?
        .to_rgb8();

    let detections = detector.detect(&image).map_err(UnitError::failed)?;

    let file_name = image_path
        .file_name()
        .ok_or_else(|| UnitError::failed("image path has no file name"))?;
    let stem = image_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| UnitError::failed("image path has no stem"))?;

    let label_path = run_dir.join(LABELS_DIR).join(format!("{stem}.txt"));
    let mut body: String = detections
        .iter()
        .map(|d| d.to_label_line())
        .collect::<Vec<_>>()
        .join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    std::fs::write(&label_path, body)
        .map_err(|e| UnitError::failed(format!("write {}: {e}", label_path.display())))?;

    draw_detections(&mut image, &detections);
    let annotated = run_dir.join(file_name).with_extension("jpg");
    save_jpeg(&image, &annotated).map_err(UnitError::failed)?;

    Ok(detections.len())
}

/// Outline every detection on `image`.
fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    for d in detections {
        let x = (d.bbox.x * w).round() as i32;
        let y = (d.bbox.y * h).round() as i32;
        let bw = (d.bbox.width * w).round().max(1.0) as u32;
        let bh = (d.bbox.height * h).round().max(1.0) as u32;
        for t in 0..BOX_THICKNESS {
            let (tw, th) = (bw.saturating_sub(2 * t), bh.saturating_sub(2 * t));
            if tw == 0 || th == 0 {
                break;
            }
            let rect = Rect::at(x + t as i32, y + t as i32).of_size(tw, th);
            draw_hollow_rect_mut(image, rect, BOX_COLOUR);
        }
    }
}
