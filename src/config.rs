//! Configuration types for the drawing pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. One struct holds every knob so the HTTP
//! server, the offline CLI and the tests share the same defaults.

use crate::error::DrawScanError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Class names of the fixture detector, indexed by class id.
pub const DEFAULT_CLASS_NAMES: &[&str] = &[
    "Cove Light",
    "Door",
    "Downlight",
    "Emergency Light Fitting",
    "Fluorescent Light",
    "Socket Outlet",
    "Exit Sign",
];

/// External command that rasterises a single PDF page.
///
/// Invoked as `program args.. <source> <page-index> <dest> --scale <s>
/// --max-pixels <px> [--pdfium-lib <path>]`. It must write `dest` and exit 0,
/// or exit non-zero with the reason on stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderWorker {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Configuration for the drawing pipeline.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_drawscan::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .output_dir("/tmp/drawscan/outputs")
///     .max_workers(8)
///     .unit_timeout_secs(120)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory holding the single current upload (`file.<ext>`). Default: `uploads`.
    pub upload_dir: PathBuf,

    /// Root of every generated artifact: rasterised pages and inference runs.
    /// Default: `outputs`.
    pub output_dir: PathBuf,

    /// Detection model in ONNX format. Default: `model/best.onnx`.
    pub model_path: PathBuf,

    /// Concurrency ceiling of the bounded executor. Default: 4.
    ///
    /// Used for both rasterisation and inference. `/inference?max_workers=N`
    /// overrides it per request.
    pub max_workers: usize,

    /// Page scale factor applied when rasterising. Default: 6.0.
    ///
    /// Fixture symbols on a full drawing sheet are a few points wide; the
    /// detector needs them tens of pixels wide.
    pub render_scale: f32,

    /// Cap on either edge of a rasterised page, in pixels. Default: 10 000.
    ///
    /// An A0 sheet at scale 6 would otherwise allocate over a gigabyte of
    /// RGBA pixels per worker.
    pub max_rendered_pixels: u32,

    /// Per-unit timeout in seconds. Default: 300.
    ///
    /// A unit exceeding it is reported as `timeout` and its pool slot is freed.
    pub unit_timeout_secs: u64,

    /// Detection thresholds, applied uniformly across all pages of a run.
    pub thresholds: DetectionThresholds,

    /// Class id → class name table. Ids outside it resolve to `"Unknown"`.
    pub class_names: Vec<String>,

    /// Which inference runs `/results` aggregates. Default: [`AggregateScope::Latest`].
    pub aggregate_scope: AggregateScope,

    /// Credential of the CAD conversion service.
    pub convert_api_secret: Option<String>,

    /// Base URL of the CAD conversion service. Default: `https://v2.convertapi.com`.
    pub convert_api_base_url: String,

    /// Conversion call timeout in seconds. Default: 300.
    pub conversion_timeout_secs: u64,

    /// Vision provider name for title-block extraction (e.g. "gemini", "openai").
    /// Default: `gemini`.
    pub extractor_provider: Option<String>,

    /// Vision model for title-block extraction. Default: `gemini-2.5-flash`.
    pub extractor_model: Option<String>,

    /// Pre-constructed provider. Takes precedence over `extractor_provider`.
    pub extractor: Option<Arc<dyn LLMProvider>>,

    /// Number of concurrent title-block extraction calls. Default: 4.
    pub extract_concurrency: usize,

    /// Per-call extraction timeout in seconds. Default: 60.
    pub extract_timeout_secs: u64,

    /// Longest edge of the image sent to the multimodal model. Default: 2048.
    pub extract_max_pixels: u32,

    /// Explicit path to libpdfium. If None, the system library is used.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Command that renders one PDF page in a child process. Default: None.
    ///
    /// When unset, pages render inside this process one at a time.
    pub render_worker: Option<RenderWorker>,

    /// Per-unit progress events. Default: None.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            model_path: PathBuf::from("model/best.onnx"),
            max_workers: 4,
            render_scale: 6.0,
            max_rendered_pixels: 10_000,
            unit_timeout_secs: 300,
            thresholds: DetectionThresholds::default(),
            class_names: DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
            aggregate_scope: AggregateScope::default(),
            convert_api_secret: None,
            convert_api_base_url: "https://v2.convertapi.com".to_string(),
            conversion_timeout_secs: 300,
            extractor_provider: Some("gemini".to_string()),
            extractor_model: Some("gemini-2.5-flash".to_string()),
            extractor: None,
            extract_concurrency: 4,
            extract_timeout_secs: 60,
            extract_max_pixels: 2048,
            pdfium_lib_path: None,
            render_worker: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("upload_dir", &self.upload_dir)
            .field("output_dir", &self.output_dir)
            .field("model_path", &self.model_path)
            .field("max_workers", &self.max_workers)
            .field("render_scale", &self.render_scale)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("unit_timeout_secs", &self.unit_timeout_secs)
            .field("thresholds", &self.thresholds)
            .field("class_names", &self.class_names)
            .field("aggregate_scope", &self.aggregate_scope)
            .field(
                "convert_api_secret",
                &self.convert_api_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("convert_api_base_url", &self.convert_api_base_url)
            .field("extractor_provider", &self.extractor_provider)
            .field("extractor_model", &self.extractor_model)
            .field("extractor", &self.extractor.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("extract_concurrency", &self.extract_concurrency)
            .field("pdfium_lib_path", &self.pdfium_lib_path)
            .field("render_worker", &self.render_worker)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory holding the timestamped rasterisation runs.
    pub fn pages_root(&self) -> PathBuf {
        self.output_dir.join("pages")
    }

    /// Directory holding the timestamped inference runs.
    pub fn runs_root(&self) -> PathBuf {
        self.output_dir.join("run")
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.config.fmt(f)
    }
}

impl PipelineConfigBuilder {
    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.upload_dir = dir.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = path.into();
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n.max(1);
        self
    }

    pub fn render_scale(mut self, scale: f32) -> Self {
        self.config.render_scale = scale;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn unit_timeout_secs(mut self, secs: u64) -> Self {
        self.config.unit_timeout_secs = secs;
        self
    }

    pub fn thresholds(mut self, thresholds: DetectionThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    pub fn class_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.class_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn aggregate_scope(mut self, scope: AggregateScope) -> Self {
        self.config.aggregate_scope = scope;
        self
    }

    pub fn convert_api_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.convert_api_secret = Some(secret.into());
        self
    }

    pub fn convert_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.convert_api_base_url = url.into();
        self
    }

    pub fn conversion_timeout_secs(mut self, secs: u64) -> Self {
        self.config.conversion_timeout_secs = secs;
        self
    }

    pub fn extractor_provider(mut self, name: impl Into<String>) -> Self {
        self.config.extractor_provider = Some(name.into());
        self
    }

    pub fn extractor_model(mut self, model: impl Into<String>) -> Self {
        self.config.extractor_model = Some(model.into());
        self
    }

    pub fn extractor(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.extractor = Some(provider);
        self
    }

    /// Turn title-block extraction off; every page gets an empty record.
    pub fn disable_extraction(mut self) -> Self {
        self.config.extractor = None;
        self.config.extractor_provider = None;
        self
    }

    pub fn extract_concurrency(mut self, n: usize) -> Self {
        self.config.extract_concurrency = n.max(1);
        self
    }

    pub fn extract_timeout_secs(mut self, secs: u64) -> Self {
        self.config.extract_timeout_secs = secs;
        self
    }

    pub fn extract_max_pixels(mut self, px: u32) -> Self {
        self.config.extract_max_pixels = px.max(64);
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    /// Render PDF pages by running `program args.. <source> <index> <dest>`.
    pub fn render_worker(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.config.render_worker = Some(RenderWorker {
            program: program.into(),
            args,
        });
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, DrawScanError> {
        let c = &self.config;
        if !(0.5..=12.0).contains(&c.render_scale) {
            return Err(DrawScanError::InvalidConfig(format!(
                "render scale must be 0.5–12, got {}",
                c.render_scale
            )));
        }
        if c.unit_timeout_secs == 0 {
            return Err(DrawScanError::InvalidConfig(
                "unit timeout must be ≥ 1 second".into(),
            ));
        }
        c.thresholds.validate()?;
        if c.class_names.is_empty() {
            return Err(DrawScanError::InvalidConfig(
                "class name table must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Fixed detection policy: one set of thresholds for every page of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionThresholds {
    /// Minimum class confidence kept. Default: 0.10.
    pub confidence: f32,
    /// IoU above which a lower-confidence box of the same class is suppressed. Default: 0.20.
    pub iou: f32,
    /// Square model input size in pixels. Default: 640.
    pub input_size: u32,
    /// Detections kept per page after suppression. Default: 1000.
    pub max_detections: usize,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            confidence: 0.10,
            iou: 0.20,
            input_size: 640,
            max_detections: 1000,
        }
    }
}

impl DetectionThresholds {
    fn validate(&self) -> Result<(), DrawScanError> {
        if !(0.0..=1.0).contains(&self.confidence) || !(0.0..=1.0).contains(&self.iou) {
            return Err(DrawScanError::InvalidConfig(format!(
                "thresholds must be within 0–1, got confidence={} iou={}",
                self.confidence, self.iou
            )));
        }
        if self.input_size < 32 || self.input_size % 32 != 0 {
            return Err(DrawScanError::InvalidConfig(format!(
                "model input size must be a positive multiple of 32, got {}",
                self.input_size
            )));
        }
        Ok(())
    }
}

/// Which inference runs the result aggregator scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateScope {
    /// Only the newest run directory (default).
    #[default]
    Latest,
    /// Every run directory under the runs root, oldest first.
    All,
}
