//! # edgequake-drawscan
//!
//! Find fixture symbols and title-block metadata in engineering drawings.
//!
//! ## Why this crate?
//!
//! Lighting and power layouts arrive as PDF sets, CAD exports or scans, and
//! counting downlights, sockets and exit signs by hand across dozens of
//! sheets is slow and error-prone. This crate rasterises every sheet, runs a
//! YOLO detector over each page in parallel, and asks a vision model to read
//! the title block, then folds everything into one per-page, per-class
//! report served over HTTP.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload (pdf / dwg / dwf / dxf / png / jpg)
//!  │
//!  ├─ 1. Input      locate file.*, convert CAD sheets to PDF (external API)
//!  ├─ 2. Rasterise  one worker process per page, bounded pool
//!  ├─ 3. Inference  one detector instance per page, fresh timestamped run
//!  └─ 4. Results    join images ↔ labels by name, count classes,
//!                   title-block metadata per page (fails closed)
//! ```
//!
//! A page that fails never fails its siblings: stages report
//! `success` / `partial` / `failed` with the failing pages listed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_drawscan::{DrawingService, PipelineConfig, Stage, StageProgressCallback};
//! use std::sync::Arc;
//!
//! struct Log;
//! impl StageProgressCallback for Log {
//!     fn on_unit_complete(&self, stage: Stage, page: usize, total: usize) {
//!         eprintln!("{stage}: page {page}/{total}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .model_path("model/best.onnx")
//!         .progress_callback(Arc::new(Log))
//!         .build()?;
//!     let service = DrawingService::new(config);
//!
//!     service.upload("plan.pdf", &std::fs::read("plan.pdf")?).await?;
//!     service.preprocess().await?;
//!     service.load_model().await?;
//!     service.inference(None).await?;
//!     let report = service.results().await?;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `drawscan` binary (clap + anyhow + tracing-subscriber) |
//!
//! ## Environment
//!
//! | Variable | Used for |
//! |----------|----------|
//! | `MODEL_PATH` | ONNX detector (default `model/best.onnx`) |
//! | `CONVERT_API_SECRET` | CAD → PDF conversion service |
//! | `GEMINI_API_KEY` | title-block extraction (default provider) |
//! | `PDFIUM_LIB_PATH` | explicit pdfium library location |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod server;
pub mod service;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    AggregateScope, DetectionThresholds, PipelineConfig, PipelineConfigBuilder, RenderWorker,
};
pub use error::{DrawScanError, UnitError};
pub use output::{
    AggregatedSummary, DetectionRecord, DrawingMetadata, InferenceReport, PagePreview,
    RasterizeReport, Status, Summary, UnitFailure,
};
pub use progress::{NoopProgressCallback, ProgressCallback, Stage, StageProgressCallback};
pub use service::{DrawingService, UploadResponse};
