//! Page enumeration and rasterisation.
//!
//! ## Why a worker process per page?
//!
//! pdfium is not thread-safe, and pdfium-render serialises every call behind
//! one process-wide lock that a [`Pdfium`] value holds for its whole life.
//! Rendering on threads would therefore draw one page at a time. The
//! [`ProcessRenderer`] launches one [`RenderWorker`] process per page instead;
//! each binds its own pdfium, opens the document and writes `page_<n>.jpg`.
//! Pages render side by side, and a pdfium crash or hang only takes out that
//! page's process. A worker over its budget is killed.
//!
//! Without a worker command (plain library use) the [`InProcessRenderer`]
//! renders inside this process, one page at a time, so each page's budget
//! starts once pdfium is free.
//!
//! ## Why a scale factor plus a pixel cap?
//!
//! Fixture symbols on a drawing sheet are tiny, so pages are rendered at a
//! fixed high scale (6× by default). `max_rendered_pixels` caps either edge
//! so an A0 sheet does not allocate gigabytes per worker.

use crate::config::RenderWorker;
use crate::error::{DrawScanError, UnitError};
use crate::output::{RasterizeReport, Status, UnitFailure};
use crate::pipeline::executor::{join_outcome, run_parallel_async_with, ExecutorOptions};
use crate::pipeline::pdfium;
use crate::pipeline::runs::{self, page_file_name};
use crate::progress::{ProgressCallback, Stage};
use futures::future::BoxFuture;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader, RgbImage};
use pdfium_render::prelude::*;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, info, warn};

const JPEG_QUALITY: u8 = 92;

/// One page of a document: the unit of parallel rasterisation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUnit {
    /// 0-based page index inside the document.
    pub index: usize,
    pub source: PathBuf,
    pub dest_dir: PathBuf,
}

impl PageUnit {
    /// One unit per page of a `total`-page document.
    pub fn all(document: &Path, dest_dir: &Path, total: usize) -> Vec<PageUnit> {
        (0..total)
            .map(|index| PageUnit {
                index,
                source: document.to_path_buf(),
                dest_dir: dest_dir.to_path_buf(),
            })
            .collect()
    }

    /// 1-based page number used in every visible artifact.
    pub fn page_number(&self) -> usize {
        self.index + 1
    }

    pub fn image_path(&self) -> PathBuf {
        self.dest_dir.join(page_file_name(self.page_number()))
    }
}

/// Rendering parameters handed to every unit.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub scale: f32,
    pub max_pixels: u32,
    pub pdfium_lib_path: Option<PathBuf>,
}

/// Counts and renders the pages of a paginated document.
pub trait PageRenderer: Send + Sync {
    /// Number of pages in `document`. Called once, off the async runtime.
    ///
    /// An unreadable document is a [`DrawScanError::DocumentOpen`].
    fn page_count(&self, document: &Path) -> Result<usize, DrawScanError>;

    /// Render `unit` to [`PageUnit::image_path`] and return that path.
    fn render(&self, unit: PageUnit) -> BoxFuture<'static, Result<PathBuf, UnitError>>;

    /// Extra ceiling on pages in flight, below the executor's.
    fn max_parallel(&self) -> Option<usize> {
        None
    }
}

/// The renderer for `settings`: worker processes when a worker command is
/// configured, otherwise in-process.
pub fn renderer(settings: &RenderSettings, worker: Option<&RenderWorker>) -> Arc<dyn PageRenderer> {
    match worker {
        Some(worker) => Arc::new(ProcessRenderer::new(worker.clone(), settings.clone())),
        None => Arc::new(InProcessRenderer::new(settings.clone())),
    }
}

fn count_pages(document: &Path, lib_path: Option<&Path>) -> Result<usize, DrawScanError> {
    let pdfium = pdfium::bind(lib_path)?;
    pdfium::page_count(&pdfium, document)
}

/// Renders each page in its own [`RenderWorker`] process.
pub struct ProcessRenderer {
    worker: RenderWorker,
    settings: RenderSettings,
}

impl ProcessRenderer {
    pub fn new(worker: RenderWorker, settings: RenderSettings) -> Self {
        Self { worker, settings }
    }

    fn command(&self, unit: &PageUnit) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.worker.program);
        cmd.args(&self.worker.args)
            .arg(&unit.source)
            .arg(unit.index.to_string())
            .arg(unit.image_path())
            .arg("--scale")
            .arg(self.settings.scale.to_string())
            .arg("--max-pixels")
            .arg(self.settings.max_pixels.to_string());
        if let Some(ref lib) = self.settings.pdfium_lib_path {
            cmd.arg("--pdfium-lib").arg(lib);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl PageRenderer for ProcessRenderer {
    fn page_count(&self, document: &Path) -> Result<usize, DrawScanError> {
        count_pages(document, self.settings.pdfium_lib_path.as_deref())
    }

    fn render(&self, unit: PageUnit) -> BoxFuture<'static, Result<PathBuf, UnitError>> {
        let mut cmd = self.command(&unit);
        Box::pin(async move {
            let output = cmd
                .output()
                .await
                .map_err(|e| UnitError::failed(format!("spawn render worker: {e}")))?;
            if output.status.success() {
                debug!("Worker rendered page {}", unit.page_number());
                return Ok(unit.image_path());
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("no diagnostics");
            Err(UnitError::failed(format!(
                "render worker {}: {reason}",
                output.status
            )))
        })
    }
}

/// Renders on the blocking pool of this process, one page at a time.
pub struct InProcessRenderer {
    settings: RenderSettings,
}

impl InProcessRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }
}

impl PageRenderer for InProcessRenderer {
    fn page_count(&self, document: &Path) -> Result<usize, DrawScanError> {
        count_pages(document, self.settings.pdfium_lib_path.as_deref())
    }

    fn render(&self, unit: PageUnit) -> BoxFuture<'static, Result<PathBuf, UnitError>> {
        let settings = self.settings.clone();
        Box::pin(async move {
            let handle = tokio::task::spawn_blocking(move || {
                let path = unit.image_path();
                render_page_file(&unit.source, unit.index, &path, &settings)
                    .map(|_| path)
                    .map_err(UnitError::failed)
            });
            join_outcome(handle.await)
        })
    }

    fn max_parallel(&self) -> Option<usize> {
        // pdfium-render holds a process-wide lock per bound `Pdfium`.
        Some(1)
    }
}

/// Read the page count of `document` through `renderer` and return one
/// [`PageUnit`] per page.
///
/// Fails with [`DrawScanError::DocumentOpen`] if the document is unreadable;
/// no partial list is ever returned. Blocking.
pub fn enumerate_pages(
    document: &Path,
    dest_dir: &Path,
    renderer: &dyn PageRenderer,
) -> Result<Vec<PageUnit>, DrawScanError> {
    let total = renderer.page_count(document)?;
    info!("{}: {} pages", document.display(), total);
    Ok(PageUnit::all(document, dest_dir, total))
}

/// Rasterise every page of a paginated document into `output_dir`.
///
/// `output_dir` is cleared first. Page failures are collected in the
/// report; only an unreadable document (or pdfium missing) is fatal.
pub async fn rasterize(
    document: &Path,
    output_dir: &Path,
    renderer: Arc<dyn PageRenderer>,
    opts: ExecutorOptions,
    progress: Option<&ProgressCallback>,
) -> Result<RasterizeReport, DrawScanError> {
    // ── Step 1: clear stale pages and enumerate ──────────────────────────
    let (doc, dir, counter) = (
        document.to_path_buf(),
        output_dir.to_path_buf(),
        Arc::clone(&renderer),
    );
    let units = tokio::task::spawn_blocking(move || {
        runs::clear_dir(&dir)?;
        enumerate_pages(&doc, &dir, counter.as_ref())
    })
    .await
    .map_err(|e| DrawScanError::Internal(format!("Page enumeration task panicked: {e}")))??;

    let total = units.len();
    let opts = match renderer.max_parallel() {
        Some(ceiling) => ExecutorOptions::new(opts.max_workers.min(ceiling), opts.unit_timeout),
        None => opts,
    };
    if let Some(cb) = progress {
        cb.on_stage_start(Stage::Rasterize, total);
    }
    info!("Rasterising {} pages with {} workers", total, opts.max_workers);

    // ── Step 2: fan out one unit per page ────────────────────────────────
    let outcomes = run_parallel_async_with(
        units.clone(),
        |unit: PageUnit| renderer.render(unit),
        opts,
        |idx, outcome| {
            if let Some(cb) = progress {
                match outcome {
                    Ok(_) => cb.on_unit_complete(Stage::Rasterize, idx + 1, total),
                    Err(e) => cb.on_unit_error(Stage::Rasterize, idx + 1, total, &e.to_string()),
                }
            }
        },
    )
    .await;

    // ── Step 3: assemble the report in page order ────────────────────────
    let mut images = Vec::with_capacity(total);
    let mut failed = Vec::new();
    for (unit, outcome) in units.iter().zip(outcomes) {
        match outcome {
            Ok(path) => images.push(path),
            Err(e) => {
                warn!("Page {} failed to rasterise: {}", unit.page_number(), e);
                failed.push(UnitFailure::new(unit.page_number(), None, e));
            }
        }
    }

    if let Some(cb) = progress {
        cb.on_stage_complete(Stage::Rasterize, total, images.len());
    }
    info!("Rasterised {}/{} pages", images.len(), total);

    Ok(RasterizeReport {
        status: Status::from_counts(total, images.len()),
        total_pages: total,
        images,
        failed,
        run_dir: output_dir.to_path_buf(),
    })
}

/// Render page `index` (0-based) of `source` as a JPEG at `dest`.
///
/// Blocking. This is the whole job of a render worker process.
pub fn render_page_file(
    source: &Path,
    index: usize,
    dest: &Path,
    settings: &RenderSettings,
) -> Result<(), DrawScanError> {
    let page_err = |detail: String| DrawScanError::PageRender {
        page: index + 1,
        detail,
    };
    let pdfium = pdfium::bind(settings.pdfium_lib_path.as_deref())?;
    let document = pdfium
        .load_pdf_from_file(source, None)
        .map_err(|e| DrawScanError::DocumentOpen {
            path: source.to_path_buf(),
            detail: format!("{e:?}"),
        })?;
    let page = document
        .pages()
        .get(index as u16)
        .map_err(|e| page_err(format!("{e:?}")))?;

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(settings.scale)
        .set_maximum_width(settings.max_pixels as i32)
        .set_maximum_height(settings.max_pixels as i32);
    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| page_err(format!("render: {e:?}")))?;

    let image = bitmap.as_image().to_rgb8();
    save_jpeg(&image, dest).map_err(page_err)?;

    debug!(
        "Rendered page {} → {}x{} px",
        index + 1,
        image.width(),
        image.height()
    );
    Ok(())
}

/// Single-page raster input: write it as `page_1.jpg` without the executor.
///
/// JPEGs are copied byte for byte; anything else is decoded and re-encoded.
pub async fn copy_raster(image: &Path, output_dir: &Path) -> Result<RasterizeReport, DrawScanError> {
    let (src, dir) = (image.to_path_buf(), output_dir.to_path_buf());
    let dest = tokio::task::spawn_blocking(move || -> Result<PathBuf, DrawScanError> {
        runs::clear_dir(&dir)?;
        let dest = dir.join(page_file_name(1));
        let is_jpeg = src
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg"))
            .unwrap_or(false);

        if is_jpeg {
            std::fs::copy(&src, &dest).map_err(|e| DrawScanError::io(&src, e))?;
        } else {
            let decoded = decode_image(&src)?;
            save_jpeg(&decoded.to_rgb8(), &dest).map_err(DrawScanError::Internal)?;
        }
        Ok(dest)
    })
    .await
    .map_err(|e| DrawScanError::Internal(format!("Image copy task panicked: {e}")))??;

    info!("Image copied to {}", dest.display());
    Ok(RasterizeReport {
        status: Status::Success,
        total_pages: 1,
        images: vec![dest],
        failed: Vec::new(),
        run_dir: output_dir.to_path_buf(),
    })
}

fn decode_image(path: &Path) -> Result<DynamicImage, DrawScanError> {
    let open_err = |detail: String| DrawScanError::DocumentOpen {
        path: path.to_path_buf(),
        detail,
    };
    ImageReader::open(path)
        .map_err(|e| open_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| open_err(e.to_string()))?
        .decode()
        .map_err(|e| open_err(e.to_string()))
}

/// Encode `image` as JPEG at `path`.
pub(crate) fn save_jpeg(image: &RgbImage, path: &Path) -> Result<(), String> {
    let file = File::create(path).map_err(|e| format!("create {}: {e}", path.display()))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|e| format!("encode {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::time::{Duration, Instant};

    /// Draws a flat page per unit; listed page numbers fail.
    struct FakeRenderer {
        pages: usize,
        broken: Vec<usize>,
    }

    impl PageRenderer for FakeRenderer {
        fn page_count(&self, _document: &Path) -> Result<usize, DrawScanError> {
            Ok(self.pages)
        }

        fn render(&self, unit: PageUnit) -> BoxFuture<'static, Result<PathBuf, UnitError>> {
            let broken = self.broken.contains(&unit.page_number());
            Box::pin(async move {
                if broken {
                    return Err(UnitError::failed("bad xref"));
                }
                let path = unit.image_path();
                save_jpeg(&RgbImage::from_pixel(4, 4, Rgb([250, 250, 250])), &path)
                    .map_err(UnitError::failed)?;
                Ok(path)
            })
        }
    }

    fn pdf_settings() -> RenderSettings {
        RenderSettings {
            scale: 2.0,
            max_pixels: 1000,
            pdfium_lib_path: None,
        }
    }

    fn jpegs_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn rasterize_clears_stale_pages_and_numbers_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pages");
        std::fs::create_dir(&out).unwrap();
        for stale in ["page_4.jpg", "page_9.jpg"] {
            std::fs::write(out.join(stale), b"stale").unwrap();
        }
        let renderer = Arc::new(FakeRenderer {
            pages: 3,
            broken: vec![],
        });

        let report = rasterize(
            Path::new("doc.pdf"),
            &out,
            renderer,
            ExecutorOptions::new(2, None),
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.status, Status::Success);
        assert_eq!(report.total_pages, 3);
        assert_eq!(
            report.images,
            vec![out.join("page_1.jpg"), out.join("page_2.jpg"), out.join("page_3.jpg")]
        );
        assert_eq!(jpegs_in(&out), vec!["page_1.jpg", "page_2.jpg", "page_3.jpg"]);
    }

    #[tokio::test]
    async fn failed_page_is_reported_by_number() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pages");
        let renderer = Arc::new(FakeRenderer {
            pages: 3,
            broken: vec![2],
        });

        let report = rasterize(
            Path::new("doc.pdf"),
            &out,
            renderer,
            ExecutorOptions::new(3, None),
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.status, Status::Partial);
        assert_eq!(report.images, vec![out.join("page_1.jpg"), out.join("page_3.jpg")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].page, 2);
    }

    #[test]
    fn worker_command_carries_page_and_settings() {
        let renderer = ProcessRenderer::new(
            RenderWorker {
                program: PathBuf::from("drawscan"),
                args: vec!["render-page".into()],
            },
            RenderSettings {
                pdfium_lib_path: Some(PathBuf::from("/opt/pdfium")),
                ..pdf_settings()
            },
        );
        let unit = PageUnit {
            index: 4,
            source: PathBuf::from("in/doc.pdf"),
            dest_dir: PathBuf::from("out"),
        };

        let cmd = renderer.command(&unit);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "render-page",
                "in/doc.pdf",
                "4",
                "out/page_5.jpg",
                "--scale",
                "2",
                "--max-pixels",
                "1000",
                "--pdfium-lib",
                "/opt/pdfium",
            ]
        );
    }

    /// A render worker played by `sh`: `$1` source, `$2` page index, `$3` dest.
    #[cfg(unix)]
    fn sh_worker(dir: &Path, body: &str) -> ProcessRenderer {
        let script = dir.join("worker.sh");
        std::fs::write(&script, body).unwrap();
        ProcessRenderer::new(
            RenderWorker {
                program: PathBuf::from("/bin/sh"),
                args: vec![script.to_string_lossy().into_owned()],
            },
            pdf_settings(),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_processes_render_pages_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = sh_worker(dir.path(), "sleep 0.4\ncp \"$1\" \"$3\"\n");
        let source = dir.path().join("sheet.jpg");
        save_jpeg(&RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])), &source).unwrap();
        let out = dir.path().join("pages");
        std::fs::create_dir(&out).unwrap();

        // Four 400 ms pages against a 1 s budget only pass if they overlap.
        let started = Instant::now();
        let outcomes = run_parallel_async_with(
            PageUnit::all(&source, &out, 4),
            |unit: PageUnit| renderer.render(unit),
            ExecutorOptions::new(4, Some(Duration::from_secs(1))),
            |_, _| {},
        )
        .await;

        assert!(outcomes.iter().all(|o| o.is_ok()), "{outcomes:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            jpegs_in(&out),
            vec!["page_1.jpg", "page_2.jpg", "page_3.jpg", "page_4.jpg"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_exit_status_and_stderr_become_the_page_error() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = sh_worker(dir.path(), "echo 'page tree is corrupt' >&2\nexit 3\n");
        let unit = PageUnit {
            index: 0,
            source: dir.path().join("doc.pdf"),
            dest_dir: dir.path().to_path_buf(),
        };

        let err = renderer.render(unit).await.unwrap_err();
        let detail = err.to_string();
        assert!(detail.contains("page tree is corrupt"), "{detail}");
        assert!(detail.contains('3'), "{detail}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_worker_is_killed_at_its_budget() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = sh_worker(dir.path(), "sleep 2\ntouch \"$3\"\n");
        let out = dir.path().join("pages");
        std::fs::create_dir(&out).unwrap();

        let outcomes = run_parallel_async_with(
            PageUnit::all(Path::new("doc.pdf"), &out, 1),
            |unit: PageUnit| renderer.render(unit),
            ExecutorOptions::new(1, Some(Duration::from_secs(1))),
            |_, _| {},
        )
        .await;
        assert_eq!(outcomes[0], Err(UnitError::Timeout { secs: 1 }));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!out.join("page_1.jpg").exists());
    }

    #[test]
    fn in_process_rendering_is_one_page_at_a_time() {
        assert_eq!(InProcessRenderer::new(pdf_settings()).max_parallel(), Some(1));
    }

    #[test]
    fn page_unit_paths_are_one_based() {
        let unit = PageUnit {
            index: 0,
            source: PathBuf::from("doc.pdf"),
            dest_dir: PathBuf::from("out"),
        };
        assert_eq!(unit.page_number(), 1);
        assert_eq!(unit.image_path(), PathBuf::from("out/page_1.jpg"));
    }

    #[tokio::test]
    async fn png_input_becomes_single_jpeg_page() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("file.png");
        RgbImage::from_pixel(32, 16, Rgb([200, 10, 10]))
            .save_with_format(&src, ImageFormat::Png)
            .unwrap();
        let out = dir.path().join("pages");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("page_7.jpg"), b"stale").unwrap();

        let report = copy_raster(&src, &out).await.unwrap();

        assert_eq!(report.status, Status::Success);
        assert_eq!(report.total_pages, 1);
        assert_eq!(report.images, vec![out.join("page_1.jpg")]);
        assert!(!out.join("page_7.jpg").exists());

        let reread = image::open(out.join("page_1.jpg")).unwrap();
        assert_eq!((reread.width(), reread.height()), (32, 16));
        assert_eq!(
            ImageReader::open(out.join("page_1.jpg"))
                .unwrap()
                .with_guessed_format()
                .unwrap()
                .format(),
            Some(ImageFormat::Jpeg)
        );
    }

    #[tokio::test]
    async fn jpeg_input_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("file.jpg");
        save_jpeg(&RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])), &src).unwrap();
        let out = dir.path().join("pages");

        copy_raster(&src, &out).await.unwrap();
        assert_eq!(
            std::fs::read(&src).unwrap(),
            std::fs::read(out.join("page_1.jpg")).unwrap()
        );
    }

    #[tokio::test]
    async fn corrupt_png_is_a_document_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("file.png");
        std::fs::write(&src, b"not an image").unwrap();

        let err = copy_raster(&src, &dir.path().join("pages")).await.unwrap_err();
        assert!(matches!(err, DrawScanError::DocumentOpen { .. }));
    }
}
