//! [`DrawingService`]: the operations behind the HTTP surface.
//!
//! Each method is one request: `upload`, `preprocess`, `load_model`,
//! `inference`, `results`, `reset`. State lives on disk (uploads, page
//! images, inference runs); the only in-memory state is the lazily loaded
//! detection model and the title-block extraction provider.
//!
//! ## Why resolve before creating the pages directory?
//!
//! A CAD upload is converted by an external service that can fail. The
//! conversion runs first, so a failed `/preprocess` leaves no `page_*.jpg`
//! and no empty run directory behind for `/inference` to pick up.

use crate::config::PipelineConfig;
use crate::error::DrawScanError;
use crate::output::{AggregatedSummary, InferenceReport, RasterizeReport, Status};
use crate::pipeline::aggregate;
use crate::pipeline::convert_api::ConvertApiSettings;
use crate::pipeline::detect::{DetectionBackend, ModelService, OnnxYoloBackend};
use crate::pipeline::executor::ExecutorOptions;
use crate::pipeline::infer;
use crate::pipeline::input::{self, DocumentFormat};
use crate::pipeline::llm::{self, ExtractSettings};
use crate::pipeline::render::{self, RenderSettings};
use crate::pipeline::runs::{self, PAGES_PREFIX};
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Body returned by a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub filename: String,
    pub path: PathBuf,
    pub status: String,
}

/// The drawing pipeline, one method per request.
pub struct DrawingService {
    config: PipelineConfig,
    models: ModelService,
    extractor: Option<Arc<dyn LLMProvider>>,
}

impl DrawingService {
    /// Service backed by the ONNX detector at `config.model_path`.
    pub fn new(config: PipelineConfig) -> Self {
        let backend = OnnxYoloBackend::new(config.model_path.clone(), config.thresholds);
        Self::with_backend(config, Arc::new(backend))
    }

    /// Service backed by any [`DetectionBackend`].
    pub fn with_backend(config: PipelineConfig, backend: Arc<dyn DetectionBackend>) -> Self {
        let extractor = llm::resolve_extractor(&config);
        Self {
            config,
            models: ModelService::new(backend),
            extractor,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Create the upload and output roots if they are missing.
    pub async fn ensure_dirs(&self) -> Result<(), DrawScanError> {
        for dir in [&self.config.upload_dir, &self.config.output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DrawScanError::io(dir, e))?;
        }
        Ok(())
    }

    /// Store an upload as `file.<ext>`, replacing the previous one.
    ///
    /// The response names the stored file, not the client's file name.
    pub async fn upload(&self, file_name: &str, bytes: &[u8]) -> Result<UploadResponse, DrawScanError> {
        let path = input::store_upload(&self.config.upload_dir, file_name, bytes).await?;
        let stored = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(UploadResponse {
            filename: stored,
            path,
            status: "Complete".to_string(),
        })
    }

    /// Rasterise the current upload into a fresh pages directory.
    pub async fn preprocess(&self) -> Result<RasterizeReport, DrawScanError> {
        // ── Step 1: locate and classify the upload ───────────────────────
        let upload_dir = self.config.upload_dir.clone();
        let upload = tokio::task::spawn_blocking(move || input::find_upload(&upload_dir))
            .await
            .map_err(|e| DrawScanError::Internal(format!("Upload lookup task panicked: {e}")))??;
        let format = DocumentFormat::from_path(&upload)?;
        info!("Preprocessing {} as {:?}", upload.display(), format);

        // ── Step 2: resolve (CAD → PDF) before anything is written ───────
        let document = input::resolve_document(&upload, format, &self.convert_settings()).await?;

        // ── Step 3: rasterise into a new pages run ───────────────────────
        let pages_dir = runs::create_run_dir(&self.config.pages_root(), PAGES_PREFIX)?;
        let report = match format {
            DocumentFormat::Raster => render::copy_raster(document.path(), &pages_dir).await,
            DocumentFormat::Pdf | DocumentFormat::Cad => {
                let renderer = render::renderer(
                    &self.render_settings(),
                    self.config.render_worker.as_ref(),
                );
                render::rasterize(
                    document.path(),
                    &pages_dir,
                    renderer,
                    self.executor_options(None),
                    self.config.progress_callback.as_ref(),
                )
                .await
            }
        };

        match report {
            Ok(report) => {
                // Older page runs are never read again once a newer one exists.
                if report.status != Status::Failed {
                    let (root, keep) = (self.config.pages_root(), pages_dir.clone());
                    let pruned = tokio::task::spawn_blocking(move || {
                        runs::prune_runs_before(&root, PAGES_PREFIX, &keep)
                    })
                    .await
                    .map_err(|e| DrawScanError::Internal(format!("Prune task panicked: {e}")))?;
                    if let Err(e) = pruned {
                        warn!("Could not prune old page runs: {}", e);
                    }
                }
                Ok(report)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(&pages_dir).await {
                    warn!("Could not remove {}: {}", pages_dir.display(), rm);
                }
                Err(e)
            }
        }
    }

    /// Load the detection model. Idempotent.
    pub async fn load_model(&self) -> Result<(), DrawScanError> {
        self.models.ensure_loaded().await.map(|_| ())
    }

    pub async fn model_loaded(&self) -> bool {
        self.models.is_loaded().await
    }

    /// Run detection over the newest pages directory.
    ///
    /// `max_workers` overrides the configured worker count for this call.
    pub async fn inference(&self, max_workers: Option<usize>) -> Result<InferenceReport, DrawScanError> {
        self.models.get().await?;
        let pages_root = self.config.pages_root();
        let images_dir = runs::latest_run_dir(&pages_root, PAGES_PREFIX)?
            .ok_or(DrawScanError::NoImages { dir: pages_root })?;

        infer::infer(
            &images_dir,
            &self.config.runs_root(),
            &self.models,
            self.executor_options(max_workers),
            self.config.progress_callback.as_ref(),
        )
        .await
    }

    /// Aggregate inference artifacts into the summary report.
    pub async fn results(&self) -> Result<AggregatedSummary, DrawScanError> {
        aggregate::aggregate(
            &self.config.runs_root(),
            &self.config.output_dir,
            self.config.aggregate_scope,
            &self.config.class_names,
            self.extractor.as_ref(),
            ExtractSettings::from_config(&self.config),
        )
        .await
    }

    /// Delete everything under the upload and output roots.
    ///
    /// The loaded model is kept.
    pub async fn reset(&self) -> Result<(), DrawScanError> {
        let dirs = [self.config.upload_dir.clone(), self.config.output_dir.clone()];
        tokio::task::spawn_blocking(move || dirs.iter().try_for_each(|d| runs::clear_dir(d)))
            .await
            .map_err(|e| DrawScanError::Internal(format!("Reset task panicked: {e}")))??;
        info!("Uploads and outputs cleared");
        Ok(())
    }

    fn executor_options(&self, max_workers: Option<usize>) -> ExecutorOptions {
        ExecutorOptions::new(
            max_workers.unwrap_or(self.config.max_workers),
            Some(Duration::from_secs(self.config.unit_timeout_secs)),
        )
    }

    fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            scale: self.config.render_scale,
            max_pixels: self.config.max_rendered_pixels,
            pdfium_lib_path: self.config.pdfium_lib_path.clone(),
        }
    }

    fn convert_settings(&self) -> ConvertApiSettings {
        ConvertApiSettings {
            base_url: self.config.convert_api_base_url.clone(),
            secret: self.config.convert_api_secret.clone(),
            timeout: Duration::from_secs(self.config.conversion_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(root: &std::path::Path) -> DrawingService {
        let config = PipelineConfig::builder()
            .upload_dir(root.join("uploads"))
            .output_dir(root.join("outputs"))
            .model_path(root.join("missing.onnx"))
            .disable_extraction()
            .build()
            .unwrap();
        DrawingService::new(config)
    }

    #[tokio::test]
    async fn preprocess_without_upload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.ensure_dirs().await.unwrap();
        let err = svc.preprocess().await.unwrap_err();
        assert!(matches!(err, DrawScanError::NoUpload));
    }

    #[tokio::test]
    async fn missing_model_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc.load_model().await.unwrap_err();
        assert!(matches!(err, DrawScanError::ModelLoad { .. }));
        assert!(!svc.model_loaded().await);
    }

    #[tokio::test]
    async fn inference_before_load_is_model_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc.inference(None).await.unwrap_err();
        assert!(matches!(err, DrawScanError::ModelNotLoaded));
    }

    #[tokio::test]
    async fn reset_empties_both_roots() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.upload("plan.pdf", b"%PDF-1.4").await.unwrap();
        std::fs::create_dir_all(dir.path().join("outputs/run/run_1")).unwrap();

        svc.reset().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("outputs")).unwrap().count(), 0);
    }

    fn png(path: &std::path::Path) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::from_pixel(8, 8, image::Rgb([240, 240, 240]))
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        std::fs::write(path, &bytes).unwrap();
        bytes
    }

    #[tokio::test]
    async fn upload_reports_the_stored_name() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let bytes = png(&dir.path().join("scan.png"));

        let resp = svc.upload("Ground Floor.PNG", &bytes).await.unwrap();
        assert_eq!(resp.filename, "file.png");
        assert_eq!(resp.path.file_name().unwrap(), "file.png");
    }

    #[tokio::test]
    async fn repeated_preprocess_keeps_only_the_newest_pages() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let bytes = png(&dir.path().join("scan.png"));
        svc.upload("scan.png", &bytes).await.unwrap();

        svc.preprocess().await.unwrap();
        let second = svc.preprocess().await.unwrap();

        let pages = runs::list_run_dirs(&svc.config().pages_root(), PAGES_PREFIX).unwrap();
        assert_eq!(pages, vec![second.run_dir]);
    }
}
