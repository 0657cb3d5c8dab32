//! Progress-callback trait for per-unit stage events.
//!
//! Inject an [`Arc<dyn StageProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the rasterisation and inference stages work through their pages.
//!
//! # Why callbacks instead of channels?
//!
//! The library does not know how the host reports progress. The CLI drives an
//! `indicatif` bar from it; the HTTP server leaves it unset. Units run on the
//! blocking pool in parallel, so the trait is `Send + Sync` and methods may be
//! called concurrently.
//!
//! # Example
//!
//! ```rust
//! use edgequake_drawscan::{PipelineConfig, Stage, StageProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl StageProgressCallback for CountingCallback {
//!     fn on_unit_complete(&self, stage: Stage, page: usize, total: usize) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{stage}: page {page}/{total} done ({done} so far)");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::fmt;
use std::sync::Arc;

/// The parallel stage a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Rasterize,
    Inference,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Rasterize => f.write_str("rasterize"),
            Stage::Inference => f.write_str("inference"),
        }
    }
}

/// Called by the pipeline stages as units finish.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `page` is always the 1-based page number.
pub trait StageProgressCallback: Send + Sync {
    /// Called once before any unit of the stage is dispatched.
    fn on_stage_start(&self, stage: Stage, total: usize) {
        let _ = (stage, total);
    }

    /// Called when a unit finishes successfully.
    fn on_unit_complete(&self, stage: Stage, page: usize, total: usize) {
        let _ = (stage, page, total);
    }

    /// Called when a unit fails, times out or panics.
    fn on_unit_error(&self, stage: Stage, page: usize, total: usize, error: &str) {
        let _ = (stage, page, total, error);
    }

    /// Called once after every unit of the stage has been awaited.
    fn on_stage_complete(&self, stage: Stage, total: usize, success_count: usize) {
        let _ = (stage, total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl StageProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn StageProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        completes: AtomicUsize,
        errors: AtomicUsize,
        stages: Mutex<Vec<(Stage, usize)>>,
    }

    impl StageProgressCallback for TrackingCallback {
        fn on_stage_start(&self, stage: Stage, total: usize) {
            self.stages.lock().unwrap().push((stage, total));
        }

        fn on_unit_complete(&self, _stage: Stage, _page: usize, _total: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unit_error(&self, _stage: Stage, _page: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage_start(Stage::Rasterize, 5);
        cb.on_unit_complete(Stage::Rasterize, 1, 5);
        cb.on_unit_error(Stage::Inference, 2, 5, "timeout after 3s");
        cb.on_stage_complete(Stage::Inference, 5, 4);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_stage_start(Stage::Inference, 3);
        tracker.on_unit_complete(Stage::Inference, 1, 3);
        tracker.on_unit_complete(Stage::Inference, 3, 3);
        tracker.on_unit_error(Stage::Inference, 2, 3, "worker panicked: boom");

        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(*tracker.stages.lock().unwrap(), vec![(Stage::Inference, 3)]);
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::Rasterize.to_string(), "rasterize");
        assert_eq!(Stage::Inference.to_string(), "inference");
    }
}
