//! Timestamped run directories and artifact naming.
//!
//! Every rasterisation and inference call writes into a directory of its own
//! (`<root>/<prefix>_<YYYYmmdd_HHMMSS_mmm>`). A run directory is created with
//! `create_dir`, never `create_dir_all`, so two calls can never end up
//! sharing one: the loser of a same-millisecond race takes a `_<n>` suffix.

use crate::error::DrawScanError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prefix of rasterisation runs under `<output>/pages`.
pub const PAGES_PREFIX: &str = "pages";
/// Prefix of inference runs under `<output>/run`.
pub const RUN_PREFIX: &str = "run";
/// Sub-directory of an inference run holding the label artifacts.
pub const LABELS_DIR: &str = "labels";

/// File name of the rasterised image for 1-based `page`.
pub fn page_file_name(page: usize) -> String {
    format!("page_{page}.jpg")
}

/// Parse the page number out of a `page_<n>` stem.
pub fn page_number_from_stem(stem: &str) -> Option<usize> {
    stem.strip_prefix("page_")?.parse().ok()
}

/// Create a fresh, uniquely named run directory under `root`.
pub fn create_run_dir(root: &Path, prefix: &str) -> Result<PathBuf, DrawScanError> {
    std::fs::create_dir_all(root).map_err(|e| DrawScanError::io(root, e))?;

    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string();
    let base = format!("{prefix}_{stamp}");

    for attempt in 0..1000u32 {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{base}_{attempt}")
        };
        let dir = root.join(name);
        match std::fs::create_dir(&dir) {
            Ok(()) => {
                debug!("Created run directory {}", dir.display());
                return Ok(dir);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(DrawScanError::io(&dir, e)),
        }
    }

    Err(DrawScanError::Internal(format!(
        "could not allocate a run directory under '{}'",
        root.display()
    )))
}

/// Ordering key of a run directory name: timestamp, then collision suffix.
fn run_sort_key(name: &str, prefix: &str) -> Option<(String, u32)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    // `YYYYmmdd_HHMMSS_mmm` is three `_`-separated fields; a fourth is the suffix.
    let mut fields = rest.splitn(4, '_');
    let stamp: Vec<&str> = fields.by_ref().take(3).collect();
    if stamp.len() < 2 || !stamp.iter().all(|f| f.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    let suffix = match fields.next() {
        Some(s) => s.parse().ok()?,
        None => 0,
    };
    Some((stamp.join("_"), suffix))
}

/// All run directories under `root` with the given prefix, oldest first.
///
/// A missing `root` yields an empty list.
pub fn list_run_dirs(root: &Path, prefix: &str) -> Result<Vec<PathBuf>, DrawScanError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DrawScanError::io(root, e)),
    };

    let mut runs: Vec<((String, u32), PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            run_sort_key(&name, prefix).map(|key| (key, e.path()))
        })
        .collect();
    runs.sort();
    Ok(runs.into_iter().map(|(_, path)| path).collect())
}

/// The newest run directory under `root`, if any.
pub fn latest_run_dir(root: &Path, prefix: &str) -> Result<Option<PathBuf>, DrawScanError> {
    Ok(list_run_dirs(root, prefix)?.pop())
}

/// Delete every run directory under `root` older than `keep`.
///
/// Returns how many were removed. A run that vanishes concurrently is
/// ignored.
pub fn prune_runs_before(root: &Path, prefix: &str, keep: &Path) -> Result<usize, DrawScanError> {
    let runs = list_run_dirs(root, prefix)?;
    let Some(position) = runs.iter().position(|run| run == keep) else {
        return Ok(0);
    };

    let mut removed = 0;
    for stale in &runs[..position] {
        match std::fs::remove_dir_all(stale) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(DrawScanError::io(stale, e)),
        }
    }
    if removed > 0 {
        debug!("Pruned {} old run(s) under {}", removed, root.display());
    }
    Ok(removed)
}

/// Remove everything inside `dir`, keeping `dir` itself. Creates it if missing.
pub fn clear_dir(dir: &Path) -> Result<(), DrawScanError> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                let path = entry.map_err(|e| DrawScanError::io(dir, e))?.path();
                let removed = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                match removed {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(DrawScanError::io(&path, e)),
                }
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            std::fs::create_dir_all(dir).map_err(|e| DrawScanError::io(dir, e))
        }
        Err(e) => Err(DrawScanError::io(dir, e)),
    }
}
