//! Serialisable report types returned by the pipeline stages.
//!
//! These are the JSON bodies of the HTTP surface. Field names are part of
//! the contract with the browser client, so renames go through `#[serde]`.

use crate::error::UnitError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Three-valued outcome shared by the rasterisation and inference stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Every unit succeeded.
    Success,
    /// At least one unit succeeded and at least one failed.
    Partial,
    /// No unit succeeded.
    Failed,
}

impl Status {
    /// `success` iff every unit succeeded, else `partial` if any did, else `failed`.
    ///
    /// A stage with zero units is a `success`; callers reject empty inputs
    /// before dispatching.
    pub fn from_counts(total: usize, successful: usize) -> Self {
        if successful >= total {
            Status::Success
        } else if successful > 0 {
            Status::Partial
        } else {
            Status::Failed
        }
    }
}

/// A unit that failed inside a stage, tagged with its page number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    /// 1-based page number.
    pub page: usize,
    /// Source image of the unit, when the unit had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    /// Human-readable error text.
    pub error: String,
    #[serde(flatten)]
    pub cause: UnitError,
}

impl UnitFailure {
    pub fn new(page: usize, image: Option<PathBuf>, cause: UnitError) -> Self {
        Self {
            page,
            image,
            error: cause.to_string(),
            cause,
        }
    }
}

/// Result of the rasterisation stage (`GET /preprocess`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterizeReport {
    pub status: Status,
    /// Number of pages in the source document.
    #[serde(rename = "pages")]
    pub total_pages: usize,
    /// Written page images, in page order.
    pub images: Vec<PathBuf>,
    /// Pages that could not be rasterised.
    pub failed: Vec<UnitFailure>,
    /// Directory holding this run's `page_<n>.jpg` files.
    pub run_dir: PathBuf,
}

/// Result of the inference stage (`GET /inference`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceReport {
    pub status: Status,
    pub run_dir: PathBuf,
    pub total_pages: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_detections: usize,
    pub errors: Vec<UnitFailure>,
}

/// One parsed detection, as shown to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub class_id: usize,
    pub class_name: String,
    /// Rounded to two decimals.
    pub confidence: f32,
}

/// Preview link to one annotated page image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePreview {
    pub page: usize,
    pub url: String,
}

/// Title-block fields of one drawing sheet. Every field is optional; a page
/// whose extraction failed serialises as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawingMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contractor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_contractor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drawing_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drawing_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_engineer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drawn_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_engineer: Option<String>,
}

impl DrawingMetadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Headline numbers of an aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    /// Number of annotated page images discovered.
    pub total_pages: usize,
    /// Number of distinct class names across all detections.
    pub items_found: usize,
    /// Number of parsed detection lines.
    pub total_detections: usize,
    pub pages: Vec<PagePreview>,
}

/// Result of the aggregator (`GET /results`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSummary {
    pub summary: Summary,
    /// Every detection of every page, in page order.
    pub detections: Vec<DetectionRecord>,
    /// Detections keyed by 1-based page number.
    pub page_detections: BTreeMap<usize, Vec<DetectionRecord>>,
    /// URL of the most recent page image, if any.
    pub preview: Option<String>,
    pub pages: Vec<PagePreview>,
    /// Title-block metadata keyed by 1-based page number.
    pub meta_data: BTreeMap<usize, DrawingMetadata>,
}
