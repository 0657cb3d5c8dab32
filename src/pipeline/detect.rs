//! Fixture detection: the per-image detection primitive and the model service.
//!
//! ## Model lifecycle
//!
//! [`ModelService`] owns a lazily loaded [`DetectionModel`]. `ensure_loaded`
//! loads it at most once; `get` hands out the shared handle or fails with
//! [`DrawScanError::ModelNotLoaded`]. Stateful inference sessions are never
//! shared: every inference unit calls [`DetectionModel::instance`] and gets
//! a [`PageDetector`] of its own.
//!
//! ## ONNX backend
//!
//! [`OnnxYoloBackend`] runs a YOLOv8-style export through `ort`. The model
//! bytes are read once at load time; each instance builds its own session
//! from them. Output layout is `[1, 4 + classes, anchors]`.
//!
//! ## Label artifacts
//!
//! Detections are persisted one per line as
//! `class cx cy w h conf` with geometry normalised to the image size.

use crate::config::DetectionThresholds;
use crate::error::DrawScanError;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Axis-aligned box, normalised to 0–1 of the image size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection over union with `other`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// One detected symbol on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    /// Serialise as one label-artifact line.
    pub fn to_label_line(&self) -> String {
        let (cx, cy) = self.bbox.center();
        format!(
            "{} {:.6} {:.6} {:.6} {:.6} {:.6}",
            self.class_id, cx, cy, self.bbox.width, self.bbox.height, self.confidence
        )
    }
}

/// Parse one label-artifact line into `(class id, confidence)`.
///
/// Returns `None` for blank lines, lines with fewer than 5 fields, and lines
/// whose class id or confidence do not parse. The confidence is the last
/// field.
pub fn parse_label_line(line: &str) -> Option<(usize, f32)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }
    let class_id = parts[0].parse::<usize>().ok().or_else(|| {
        // Some exporters write the class as a float ("3.0").
        let v = parts[0].parse::<f32>().ok()?;
        (v >= 0.0 && v.fract() == 0.0).then_some(v as usize)
    })?;
    let confidence = parts[parts.len() - 1].parse::<f32>().ok()?;
    confidence.is_finite().then_some((class_id, confidence))
}

/// Greedy per-class non-maximum suppression.
///
/// Keeps the most confident box and drops same-class boxes overlapping it by
/// `iou_threshold` or more. Output is sorted by confidence, highest first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = keep
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) >= iou_threshold);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}

/// Decode a raw `[1, 4 + classes, anchors]` YOLO output into detections.
///
/// Box coordinates are in model-input pixels and are normalised by
/// `thresholds.input_size`. Confidence filtering, NMS and the
/// `max_detections` cap are applied here.
pub fn decode_yolo_output(
    dims: &[i64],
    data: &[f32],
    thresholds: &DetectionThresholds,
) -> Result<Vec<Detection>, String> {
    if dims.len() != 3 || dims[1] < 5 {
        return Err(format!("unexpected output shape {dims:?}"));
    }
    let features = dims[1] as usize;
    let anchors = dims[2] as usize;
    if data.len() < features * anchors {
        return Err(format!(
            "output holds {} values, shape {dims:?} needs {}",
            data.len(),
            features * anchors
        ));
    }

    let num_classes = features - 4;
    let size = thresholds.input_size as f32;
    let at = |feature: usize, anchor: usize| data[feature * anchors + anchor];

    let mut raw = Vec::new();
    for anchor in 0..anchors {
        let (class_id, confidence) = (0..num_classes)
            .map(|c| (c, at(4 + c, anchor)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        if confidence < thresholds.confidence {
            continue;
        }

        raw.push(Detection {
            class_id,
            confidence,
            bbox: BoundingBox::from_center(
                at(0, anchor) / size,
                at(1, anchor) / size,
                at(2, anchor) / size,
                at(3, anchor) / size,
            ),
        });
    }
    debug!("Raw detections before NMS: {}", raw.len());

    let mut kept = non_max_suppression(raw, thresholds.iou);
    kept.truncate(thresholds.max_detections);
    Ok(kept)
}

/// Resize to the square model input and lay out as normalised NCHW.
pub fn preprocess(image: &RgbImage, input_size: u32) -> Array4<f32> {
    let resized = image::imageops::resize(
        image,
        input_size,
        input_size,
        image::imageops::FilterType::Triangle,
    );

    let n = input_size as usize;
    let mut input = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        input[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
        input[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
        input[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
    }
    input
}

// ── Backend traits ───────────────────────────────────────────────────────

/// Runs detection on one page image. Owned by exactly one worker.
pub trait PageDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, String>;
}

/// A loaded model. Shared across workers; hands out independent detectors.
pub trait DetectionModel: Send + Sync {
    fn instance(&self) -> Result<Box<dyn PageDetector>, String>;
}

/// Knows how to load a model. Called from the blocking pool.
pub trait DetectionBackend: Send + Sync {
    fn load(&self) -> Result<Arc<dyn DetectionModel>, DrawScanError>;
}

// ── ONNX / YOLO backend ──────────────────────────────────────────────────

/// Loads a YOLO detector exported to ONNX.
#[derive(Debug, Clone)]
pub struct OnnxYoloBackend {
    pub model_path: PathBuf,
    pub thresholds: DetectionThresholds,
}

impl OnnxYoloBackend {
    pub fn new(model_path: impl Into<PathBuf>, thresholds: DetectionThresholds) -> Self {
        Self {
            model_path: model_path.into(),
            thresholds,
        }
    }
}

impl DetectionBackend for OnnxYoloBackend {
    fn load(&self) -> Result<Arc<dyn DetectionModel>, DrawScanError> {
        info!("Loading detection model from {}", self.model_path.display());
        let model_err = |detail: String| DrawScanError::ModelLoad {
            path: self.model_path.clone(),
            detail,
        };

        let bytes = std::fs::read(&self.model_path).map_err(|e| model_err(e.to_string()))?;
        let model = OnnxYoloModel {
            bytes: Arc::from(bytes),
            thresholds: self.thresholds,
        };
        // Build one session now so a broken file fails the load, not every page.
        model.session().map_err(model_err)?;

        info!("Detection model loaded");
        Ok(Arc::new(model))
    }
}

struct OnnxYoloModel {
    bytes: Arc<[u8]>,
    thresholds: DetectionThresholds,
}

impl OnnxYoloModel {
    fn session(&self) -> Result<Session, String> {
        Session::builder()
            .map_err(|e| e.to_string())?
            .with_intra_threads(1)
            .map_err(|e| e.to_string())?
            .commit_from_memory(&self.bytes)
            .map_err(|e| e.to_string())
    }
}

impl DetectionModel for OnnxYoloModel {
    fn instance(&self) -> Result<Box<dyn PageDetector>, String> {
        Ok(Box::new(YoloDetector {
            session: self.session()?,
            thresholds: self.thresholds,
        }))
    }
}

struct YoloDetector {
    session: Session,
    thresholds: DetectionThresholds,
}

impl PageDetector for YoloDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, String> {
        let input = preprocess(image, self.thresholds.input_size);
        let tensor = TensorRef::from_array_view(input.view()).map_err(|e| e.to_string())?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| e.to_string())?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("failed to extract tensor: {e}"))?;
        let dims: Vec<i64> = shape.iter().copied().collect();
        decode_yolo_output(&dims, data, &self.thresholds)
    }
}

// ── Model service ────────────────────────────────────────────────────────

/// Owns the lazily loaded detection model.
pub struct ModelService {
    backend: Arc<dyn DetectionBackend>,
    model: RwLock<Option<Arc<dyn DetectionModel>>>,
}

impl ModelService {
    pub fn new(backend: Arc<dyn DetectionBackend>) -> Self {
        Self {
            backend,
            model: RwLock::new(None),
        }
    }

    /// Load the model unless it is already loaded.
    ///
    /// Concurrent callers wait on the same load; the backend is invoked at
    /// most once until [`reset`](Self::reset).
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn DetectionModel>, DrawScanError> {
        if let Some(model) = self.model.read().await.as_ref() {
            debug!("Model already loaded");
            return Ok(Arc::clone(model));
        }

        let mut slot = self.model.write().await;
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }

        let backend = Arc::clone(&self.backend);
        let model = tokio::task::spawn_blocking(move || backend.load())
            .await
            .map_err(|e| DrawScanError::Internal(format!("Model load task panicked: {e}")))??;
        *slot = Some(Arc::clone(&model));
        Ok(model)
    }

    /// The loaded model, or [`DrawScanError::ModelNotLoaded`].
    pub async fn get(&self) -> Result<Arc<dyn DetectionModel>, DrawScanError> {
        self.model
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(DrawScanError::ModelNotLoaded)
    }

    pub async fn is_loaded(&self) -> bool {
        self.model.read().await.is_some()
    }

    /// Drop the loaded model; the next `ensure_loaded` reloads it.
    pub async fn reset(&self) {
        *self.model.write().await = None;
    }
}
