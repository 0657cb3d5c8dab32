//! Error types for the edgequake-drawscan library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DrawScanError`]: **Fatal**: the request cannot proceed at all
//!   (nothing uploaded, unsupported format, unreadable document, conversion
//!   service down, model not loaded). Returned as `Err(DrawScanError)` from
//!   the stage entry points and rendered by the HTTP layer as
//!   `{status: "failed", error}`.
//!
//! * [`UnitError`]: **Non-fatal**: a single page failed (render glitch,
//!   undecodable image, detector fault, timeout) while its siblings are fine.
//!   The bounded executor records it positionally and the stage reports it
//!   in its `failed` / `errors` list; it never aborts the batch.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-drawscan library.
///
/// Per-page failures use [`UnitError`] and are stored in the stage reports
/// rather than propagated here.
#[derive(Debug, Error)]
pub enum DrawScanError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// `/preprocess` was called before anything was uploaded.
    #[error("No uploaded file found")]
    NoUpload,

    /// The uploaded file has an extension the pipeline cannot handle.
    #[error("Unsupported file format: {ext}")]
    UnsupportedFormat { ext: String },

    /// The document could not be opened to read its page count.
    #[error("Failed to open document '{path}': {detail}")]
    DocumentOpen { path: PathBuf, detail: String },

    /// The file claims to be a PDF but does not start with `%PDF`.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// A single page could not be rendered (render worker entry point).
    #[error("Failed to render page {page}: {detail}")]
    PageRender { page: usize, detail: String },

    // ── Conversion service errors ─────────────────────────────────────────
    /// No credential configured for the CAD conversion service.
    #[error("CAD conversion is not configured.\nSet CONVERT_API_SECRET to enable .dwf/.dwfx/.dwg/.dxf uploads.")]
    ConversionCredentialMissing,

    /// The external CAD → PDF conversion call failed.
    #[error("CAD conversion failed: {reason}")]
    ConversionService { reason: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// Inference was requested before `/load_model` succeeded.
    #[error("Model not loaded")]
    ModelNotLoaded,

    /// The detection model file could not be loaded.
    #[error("Failed to load detection model '{path}': {detail}")]
    ModelLoad { path: PathBuf, detail: String },

    /// Inference found nothing to run on.
    #[error("No images found for inference in '{dir}'")]
    NoImages { dir: PathBuf },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Reading or writing a pipeline artifact failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install libpdfium for your platform and either place it next to the binary,\n\
on the system library path, or set PDFIUM_LIB_PATH=/path/to/libpdfium.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DrawScanError {
    /// Wrap an `std::io::Error` with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DrawScanError::Io {
            path: path.into(),
            source,
        }
    }

    /// HTTP status code the server answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            DrawScanError::NoUpload
            | DrawScanError::UnsupportedFormat { .. }
            | DrawScanError::NotAPdf { .. }
            | DrawScanError::NoImages { .. } => 400,
            DrawScanError::DocumentOpen { .. } => 422,
            DrawScanError::ModelNotLoaded => 409,
            DrawScanError::ConversionService { .. } => 502,
            DrawScanError::ConversionCredentialMissing
            | DrawScanError::PdfiumBindingFailed(_) => 503,
            DrawScanError::ModelLoad { .. }
            | DrawScanError::Io { .. }
            | DrawScanError::PageRender { .. }
            | DrawScanError::InvalidConfig(_)
            | DrawScanError::Internal(_) => 500,
        }
    }
}

/// A non-fatal error for a single unit of parallel work.
///
/// Produced at the worker boundary of
/// [`crate::pipeline::executor::run_parallel`]; the stage attaches the page
/// number when it builds its report.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitError {
    /// The worker function returned an error.
    #[error("{detail}")]
    Failed { detail: String },

    /// The worker did not finish within the per-unit timeout.
    #[error("timeout after {secs}s")]
    Timeout { secs: u64 },

    /// The worker panicked; the panic was contained at the worker boundary.
    #[error("worker panicked: {detail}")]
    Panicked { detail: String },
}

impl UnitError {
    pub fn failed(detail: impl std::fmt::Display) -> Self {
        UnitError::Failed {
            detail: detail.to_string(),
        }
    }
}
