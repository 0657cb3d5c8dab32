//! Client for the external CAD → PDF conversion service.
//!
//! `.dwf`, `.dwfx`, `.dwg` and `.dxf` sheets are sent to a ConvertAPI-style
//! endpoint (`POST {base}/convert/{ext}/to/pdf`) and the returned PDF is
//! written to a caller-owned directory. The call is plain async I/O, so it
//! never occupies a blocking-pool thread.
//!
//! Failures (missing credential, network, HTTP status, malformed body) are
//! fatal for the request and reported as [`DrawScanError`]. Nothing is
//! retried.

use crate::error::DrawScanError;
use base64::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Connection settings of the conversion service.
#[derive(Clone)]
pub struct ConvertApiSettings {
    pub base_url: String,
    pub secret: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ConvertApiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertApiSettings")
            .field("base_url", &self.base_url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConversionResponse {
    #[serde(default)]
    files: Vec<ConvertedFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConvertedFile {
    file_name: String,
    file_data: String,
}

/// Convert `source` to PDF, writing the result into `dest_dir`.
///
/// Returns the path of the written PDF.
pub async fn convert_to_pdf(
    source: &Path,
    dest_dir: &Path,
    settings: &ConvertApiSettings,
) -> Result<PathBuf, DrawScanError> {
    let secret = settings
        .secret
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or(DrawScanError::ConversionCredentialMissing)?;

    let from_format = source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .ok_or_else(|| DrawScanError::ConversionService {
            reason: format!("'{}' has no extension", source.display()),
        })?;

    let url = format!(
        "{}/convert/{}/to/pdf",
        settings.base_url.trim_end_matches('/'),
        from_format
    );
    info!("Converting {} via {}", source.display(), url);

    let bytes = tokio::fs::read(source)
        .await
        .map_err(|e| DrawScanError::io(source, e))?;
    let file_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("drawing")
        .to_string();

    let form = reqwest::multipart::Form::new()
        .part(
            "File",
            reqwest::multipart::Part::bytes(bytes).file_name(file_name),
        )
        .text("SpaceToConvert", "all")
        .text("StoreFile", "false");

    let client = reqwest::Client::builder()
        .timeout(settings.timeout)
        .build()
        .map_err(|e| service_error(e.to_string()))?;

    let response = client
        .post(&url)
        .bearer_auth(secret)
        .multipart(form)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                service_error(format!("timed out after {}s", settings.timeout.as_secs()))
            } else {
                service_error(e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(service_error(format!(
            "HTTP {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| service_error(e.to_string()))?;
    let (name, pdf) = decode_response(&body)?;

    let dest = dest_dir.join(sanitise_file_name(&name));
    tokio::fs::write(&dest, &pdf)
        .await
        .map_err(|e| DrawScanError::io(&dest, e))?;

    debug!("Converted PDF written to {} ({} bytes)", dest.display(), pdf.len());
    Ok(dest)
}

/// Pull the first returned file out of a conversion response body.
fn decode_response(body: &[u8]) -> Result<(String, Vec<u8>), DrawScanError> {
    let parsed: ConversionResponse = serde_json::from_slice(body)
        .map_err(|e| service_error(format!("malformed response: {e}")))?;

    let file = parsed
        .files
        .into_iter()
        .next()
        .ok_or_else(|| service_error("service did not return any files"))?;

    let data = base64::engine::general_purpose::STANDARD
        .decode(file.file_data.as_bytes())
        .map_err(|e| service_error(format!("file data is not base64: {e}")))?;

    if !data.starts_with(b"%PDF") {
        return Err(service_error("service returned a file that is not a PDF"));
    }
    Ok((file.file_name, data))
}

fn sanitise_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("converted.pdf");
    if base.to_ascii_lowercase().ends_with(".pdf") {
        base.to_string()
    } else {
        "converted.pdf".to_string()
    }
}

fn service_error(reason: impl Into<String>) -> DrawScanError {
    DrawScanError::ConversionService {
        reason: reason.into(),
    }
}
