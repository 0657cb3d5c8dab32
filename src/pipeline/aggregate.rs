//! Result aggregation: fold the artifacts of inference runs into one report.
//!
//! ## Which runs?
//!
//! [`AggregateScope::Latest`] reads only the newest run directory, so
//! repeated `/inference` calls do not double-count pages.
//! [`AggregateScope::All`] reads every run, oldest first.
//!
//! ## Joining images to labels
//!
//! Within a run, an annotated image `page_<n>.jpg` and its label artifact
//! `labels/page_<n>.txt` are joined by stem, never by position. An image
//! without a label contributes zero detections; a label without an image
//! is ignored. Both are logged.

use crate::config::AggregateScope;
use crate::error::DrawScanError;
use crate::output::{AggregatedSummary, DetectionRecord, PagePreview, Summary};
use crate::pipeline::detect::parse_label_line;
use crate::pipeline::llm::{self, ExtractSettings};
use crate::pipeline::runs::{self, page_number_from_stem, LABELS_DIR, RUN_PREFIX};
use edgequake_llm::LLMProvider;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A page image joined with its (optional) label artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageArtifacts {
    pub image: PathBuf,
    pub label: Option<PathBuf>,
}

/// Collect the page artifacts of one run directory, in page order.
pub fn collect_run(run_dir: &Path) -> Vec<PageArtifacts> {
    let mut images: Vec<PathBuf> = Vec::new();
    let mut labels: HashMap<String, PathBuf> = HashMap::new();

    for entry in WalkDir::new(run_dir)
        .min_depth(1)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let stem = path.file_stem().and_then(|s| s.to_str()).map(String::from);
        let in_labels = path
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|n| n == LABELS_DIR);

        match (entry.depth(), ext.as_deref(), stem) {
            (1, Some("jpg" | "jpeg" | "png"), Some(_)) => images.push(path.to_path_buf()),
            (2, Some("txt"), Some(stem)) if in_labels => {
                labels.insert(stem, path.to_path_buf());
            }
            _ => {}
        }
    }

    images.sort_by_key(|p| page_sort_key(p));

    let pages: Vec<PageArtifacts> = images
        .into_iter()
        .map(|image| {
            let stem = image
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let label = labels.remove(&stem);
            if label.is_none() {
                warn!(
                    "No label artifact for {}; counting zero detections",
                    image.display()
                );
            }
            PageArtifacts { image, label }
        })
        .collect();

    for orphan in labels.values() {
        warn!("Label artifact {} has no matching image; ignored", orphan.display());
    }
    pages
}

/// Natural ordering: `page_2` before `page_10`, unnumbered names last.
fn page_sort_key(path: &Path) -> (bool, usize, String) {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    match page_number_from_stem(stem) {
        Some(n) => (false, n, stem.to_string()),
        None => (true, 0, stem.to_string()),
    }
}

/// Parse a label artifact into `(class id, confidence)` pairs.
///
/// Malformed lines are skipped and do not count. An unreadable file counts
/// as empty.
pub fn read_label_file(path: &Path) -> Vec<(usize, f32)> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("Cannot read label artifact {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let parsed = parse_label_line(line);
            if parsed.is_none() {
                debug!("Skipping malformed label line in {}: {:?}", path.display(), line);
            }
            parsed
        })
        .collect()
}

/// Map a class id onto the name table; out-of-range ids are `"Unknown"`.
pub fn class_name(names: &[String], class_id: usize) -> String {
    names
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| "Unknown".to_string())
}

/// URL under the `/outputs` static mount for a file inside `output_root`.
pub fn preview_url(output_root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(output_root).unwrap_or(file);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("/outputs/{}", parts.join("/"))
}

fn round2(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}

/// Build the aggregated report over the selected inference runs.
///
/// No runs (or runs without images) yield an all-zero summary, not an error.
pub async fn aggregate(
    runs_root: &Path,
    output_root: &Path,
    scope: AggregateScope,
    class_names: &[String],
    extractor: Option<&Arc<dyn LLMProvider>>,
    extract: ExtractSettings,
) -> Result<AggregatedSummary, DrawScanError> {
    // ── Step 1: discover artifacts and parse labels ──────────────────────
    let (root, out, names) = (
        runs_root.to_path_buf(),
        output_root.to_path_buf(),
        class_names.to_vec(),
    );
    let scan = tokio::task::spawn_blocking(move || scan_runs(&root, &out, scope, &names))
        .await
        .map_err(|e| DrawScanError::Internal(format!("Result scan task panicked: {e}")))??;

    // ── Step 2: title-block metadata, one call per page ──────────────────
    let meta_data = llm::extract_all(extractor, scan.images.clone(), extract).await;

    // ── Step 3: summary ──────────────────────────────────────────────────
    let items_found = scan
        .detections
        .iter()
        .map(|d| d.class_name.as_str())
        .collect::<BTreeSet<_>>()
        .len();
    let summary = Summary {
        total_pages: scan.images.len(),
        items_found,
        total_detections: scan.detections.len(),
        pages: scan.pages.clone(),
    };
    info!(
        "Aggregated {} pages, {} detections, {} classes",
        summary.total_pages, summary.total_detections, summary.items_found
    );

    Ok(AggregatedSummary {
        summary,
        detections: scan.detections,
        page_detections: scan.page_detections,
        preview: scan.pages.last().map(|p| p.url.clone()),
        pages: scan.pages,
        meta_data,
    })
}

struct Scan {
    images: Vec<(usize, PathBuf)>,
    pages: Vec<PagePreview>,
    detections: Vec<DetectionRecord>,
    page_detections: BTreeMap<usize, Vec<DetectionRecord>>,
}

fn scan_runs(
    runs_root: &Path,
    output_root: &Path,
    scope: AggregateScope,
    class_names: &[String],
) -> Result<Scan, DrawScanError> {
    let run_dirs = match scope {
        AggregateScope::Latest => runs::latest_run_dir(runs_root, RUN_PREFIX)?
            .into_iter()
            .collect(),
        AggregateScope::All => runs::list_run_dirs(runs_root, RUN_PREFIX)?,
    };
    debug!("Aggregating {} run(s) under {}", run_dirs.len(), runs_root.display());

    let mut scan = Scan {
        images: Vec::new(),
        pages: Vec::new(),
        detections: Vec::new(),
        page_detections: BTreeMap::new(),
    };

    let artifacts = run_dirs.iter().flat_map(|dir| collect_run(dir));
    for (idx, artifact) in artifacts.enumerate() {
        let page = idx + 1;
        let records: Vec<DetectionRecord> = artifact
            .label
            .as_deref()
            .map(read_label_file)
            .unwrap_or_default()
            .into_iter()
            .map(|(class_id, confidence)| DetectionRecord {
                class_id,
                class_name: class_name(class_names, class_id),
                confidence: round2(confidence),
            })
            .collect();

        scan.detections.extend(records.iter().cloned());
        scan.page_detections.insert(page, records);
        scan.pages.push(PagePreview {
            page,
            url: preview_url(output_root, &artifact.image),
        });
        scan.images.push((page, artifact.image));
    }
    Ok(scan)
}
