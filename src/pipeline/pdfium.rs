//! Binding to the pdfium shared library.
//!
//! A bound [`Pdfium`] holds pdfium-render's process-wide lock until it is
//! dropped, so keep bindings short-lived. Each render worker process binds
//! its own.

use crate::error::DrawScanError;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::trace;

/// Bind to pdfium, trying (in order) the explicit `lib_path`, the current
/// directory, then the system library path.
///
/// `lib_path` may name either the library file or the directory holding it.
pub fn bind(lib_path: Option<&Path>) -> Result<Pdfium, DrawScanError> {
    let bindings = match lib_path {
        Some(path) if path.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
        }
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| DrawScanError::PdfiumBindingFailed(format!("{e:?}")))?;

    trace!("pdfium bound");
    Ok(Pdfium::new(bindings))
}

/// Read the page count of `path` and close it again.
///
/// Only the cross-reference table is read; no page is decoded.
pub fn page_count(pdfium: &Pdfium, path: &Path) -> Result<usize, DrawScanError> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| DrawScanError::DocumentOpen {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })?;
    Ok(document.pages().len() as usize)
}
