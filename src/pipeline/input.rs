//! Input resolution: find the current upload and normalise it to something
//! the rasteriser can open.
//!
//! ## Why convert into a temp dir?
//!
//! pdfium requires a file-system path. CAD sheets are converted by an external
//! service and the resulting PDF is written to a `TempDir` owned by
//! [`ResolvedInput`], so it is removed when preprocessing finishes and never
//! lands next to the upload where it would be mistaken for a new `file.*`.
//! PDF magic bytes (`%PDF`) are checked up front so callers get a meaningful
//! error rather than a pdfium failure.

use crate::error::DrawScanError;
use crate::pipeline::convert_api::{self, ConvertApiSettings};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Stem every upload is stored under.
pub const UPLOAD_STEM: &str = "file";

/// Source format of an upload, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    /// `.pdf`, rasterised page by page.
    Pdf,
    /// `.dwf`, `.dwfx`, `.dwg`, `.dxf`, converted to PDF first.
    Cad,
    /// `.jpg`, `.jpeg`, `.png`, a single page.
    Raster,
}

impl DocumentFormat {
    /// Classify a path by its (case-insensitive) extension.
    pub fn from_path(path: &Path) -> Result<Self, DrawScanError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "pdf" => Ok(DocumentFormat::Pdf),
            "dwf" | "dwfx" | "dwg" | "dxf" => Ok(DocumentFormat::Cad),
            "jpg" | "jpeg" | "png" => Ok(DocumentFormat::Raster),
            "" => Err(DrawScanError::UnsupportedFormat { ext: String::new() }),
            other => Err(DrawScanError::UnsupportedFormat {
                ext: format!(".{other}"),
            }),
        }
    }
}

/// A document ready for rasterisation.
pub enum ResolvedInput {
    /// The upload itself (PDF or raster image).
    Local(PathBuf),
    /// A CAD upload converted to PDF. The `TempDir` is kept alive until the
    /// rasterisation stage is done with the file.
    Converted { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Converted { path, .. } => path,
        }
    }
}

/// Reduce a client-supplied file name to a safe, lower-case extension
/// (without the dot). Returns an empty string when there is none.
pub fn sanitise_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            e.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(8)
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .unwrap_or_default()
}

fn is_upload(path: &Path) -> bool {
    path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(UPLOAD_STEM)
}

/// Store an uploaded file as `file.<ext>`, replacing any previous upload.
pub async fn store_upload(
    upload_dir: &Path,
    original_name: &str,
    bytes: &[u8],
) -> Result<PathBuf, DrawScanError> {
    tokio::fs::create_dir_all(upload_dir)
        .await
        .map_err(|e| DrawScanError::io(upload_dir, e))?;

    let mut entries = tokio::fs::read_dir(upload_dir)
        .await
        .map_err(|e| DrawScanError::io(upload_dir, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DrawScanError::io(upload_dir, e))?
    {
        let path = entry.path();
        if is_upload(&path) {
            debug!("Removing previous upload {}", path.display());
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| DrawScanError::io(&path, e))?;
        }
    }

    let ext = sanitise_extension(original_name);
    let name = if ext.is_empty() {
        UPLOAD_STEM.to_string()
    } else {
        format!("{UPLOAD_STEM}.{ext}")
    };
    let dest = upload_dir.join(name);
    tokio::fs::write(&dest, bytes)
        .await
        .map_err(|e| DrawScanError::io(&dest, e))?;

    info!("Stored upload '{}' as {} ({} bytes)", original_name, dest.display(), bytes.len());
    Ok(dest)
}

/// Locate the current upload (`file.*`) in `upload_dir`.
///
/// Fails with [`DrawScanError::NoUpload`] when there is none. If several
/// exist (files dropped in by hand), the most recently modified wins.
pub fn find_upload(upload_dir: &Path) -> Result<PathBuf, DrawScanError> {
    let entries = match std::fs::read_dir(upload_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DrawScanError::NoUpload)
        }
        Err(e) => return Err(DrawScanError::io(upload_dir, e)),
    };

    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_upload(p))
        .max_by_key(|p| p.metadata().and_then(|m| m.modified()).ok())
        .ok_or(DrawScanError::NoUpload)
}

/// Verify that `path` starts with the PDF magic bytes.
pub async fn check_pdf_magic(path: &Path) -> Result<(), DrawScanError> {
    use tokio::io::AsyncReadExt;

    let mut f = tokio::fs::File::open(path)
        .await
        .map_err(|e| DrawScanError::DocumentOpen {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    let mut magic = [0u8; 4];
    match f.read_exact(&mut magic).await {
        Ok(_) if &magic == b"%PDF" => Ok(()),
        Ok(_) => Err(DrawScanError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        }),
        Err(e) => Err(DrawScanError::DocumentOpen {
            path: path.to_path_buf(),
            detail: e.to_string(),
        }),
    }
}

/// Turn an upload into a rasterisable document.
///
/// PDFs are checked for their magic bytes, CAD sheets are converted through
/// the external service, raster images pass through untouched.
pub async fn resolve_document(
    upload: &Path,
    format: DocumentFormat,
    convert: &ConvertApiSettings,
) -> Result<ResolvedInput, DrawScanError> {
    match format {
        DocumentFormat::Pdf => {
            check_pdf_magic(upload).await?;
            Ok(ResolvedInput::Local(upload.to_path_buf()))
        }
        DocumentFormat::Raster => Ok(ResolvedInput::Local(upload.to_path_buf())),
        DocumentFormat::Cad => {
            let temp_dir = TempDir::new().map_err(|e| DrawScanError::Internal(e.to_string()))?;
            let path = convert_api::convert_to_pdf(upload, temp_dir.path(), convert).await?;
            check_pdf_magic(&path).await?;
            Ok(ResolvedInput::Converted {
                path,
                _temp_dir: temp_dir,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_supported_extensions() {
        let f = |p: &str| DocumentFormat::from_path(Path::new(p));
        assert_eq!(f("a/file.pdf").unwrap(), DocumentFormat::Pdf);
        assert_eq!(f("file.PDF").unwrap(), DocumentFormat::Pdf);
        assert_eq!(f("file.dwg").unwrap(), DocumentFormat::Cad);
        assert_eq!(f("file.dwfx").unwrap(), DocumentFormat::Cad);
        assert_eq!(f("file.dxf").unwrap(), DocumentFormat::Cad);
        assert_eq!(f("file.jpeg").unwrap(), DocumentFormat::Raster);
        assert_eq!(f("file.png").unwrap(), DocumentFormat::Raster);
    }

    #[test]
    fn rejects_unknown_extension_with_dot() {
        let err = DocumentFormat::from_path(Path::new("file.docx")).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported file format: .docx");
        let err = DocumentFormat::from_path(Path::new("file")).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported file format: ");
    }

    #[test]
    fn sanitises_client_extension() {
        assert_eq!(sanitise_extension("Plan.DWG"), "dwg");
        assert_eq!(sanitise_extension("x.p\u{0}df"), "pdf");
        assert_eq!(sanitise_extension("noext"), "");
    }

    #[tokio::test]
    async fn upload_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        store_upload(dir.path(), "first.pdf", b"%PDF-1.4").await.unwrap();
        let second = store_upload(dir.path(), "photo.PNG", b"png").await.unwrap();

        assert_eq!(second, dir.path().join("file.png"));
        assert!(!dir.path().join("file.pdf").exists());
        assert_eq!(find_upload(dir.path()).unwrap(), second);
    }

    #[test]
    fn missing_upload_dir_means_no_upload() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_upload(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, DrawScanError::NoUpload));
        let err = find_upload(dir.path()).unwrap_err();
        assert!(matches!(err, DrawScanError::NoUpload));
    }

    #[tokio::test]
    async fn pdf_magic_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("file.pdf");
        std::fs::write(&fake, b"PK\x03\x04zip").unwrap();
        assert!(matches!(
            check_pdf_magic(&fake).await,
            Err(DrawScanError::NotAPdf { magic, .. }) if &magic == b"PK\x03\x04"
        ));

        std::fs::write(&fake, b"%PDF-1.7").unwrap();
        assert!(check_pdf_magic(&fake).await.is_ok());

        std::fs::write(&fake, b"%P").unwrap();
        assert!(matches!(
            check_pdf_magic(&fake).await,
            Err(DrawScanError::DocumentOpen { .. })
        ));
    }

    #[tokio::test]
    async fn cad_without_credential_fails_before_rasterising() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("file.dwg");
        std::fs::write(&src, b"AC1032").unwrap();
        let settings = ConvertApiSettings {
            base_url: "http://127.0.0.1:1".into(),
            secret: None,
            timeout: std::time::Duration::from_secs(1),
        };
        let result = resolve_document(&src, DocumentFormat::Cad, &settings).await;
        assert!(matches!(
            result,
            Err(DrawScanError::ConversionCredentialMissing)
        ));
    }
}
