//! Pipeline stages for drawing analysis.
//!
//! Each submodule implements one step. The HTTP service
//! ([`crate::service`]) sequences them; nothing in here knows about HTTP.
//!
//! ## Data Flow
//!
//! ```text
//! upload ──▶ input ──▶ render ──▶ infer ──▶ aggregate
//! (file.*)  (CAD→PDF)  (pdfium)   (YOLO)    (labels + VLM title block)
//! ```
//!
//! 1. [`input`]: locate the stored upload, classify it, convert CAD
//!    files to PDF through [`convert_api`]
//! 2. [`render`]: rasterise every page to `page_<n>.jpg`; pdfium work
//!    runs on the blocking pool via [`executor`]
//! 3. [`infer`]: run the detector from [`detect`] over each page image,
//!    writing an annotated image and a label artifact per page
//! 4. [`aggregate`]: join images to labels inside a run, count classes and
//!    ask a vision model ([`llm`], [`encode`]) for title-block metadata
//!
//! [`runs`] owns the timestamped output directory layout shared by steps
//! 2–4.

pub mod aggregate;
pub mod convert_api;
pub mod detect;
pub mod encode;
pub mod executor;
pub mod infer;
pub mod input;
pub mod llm;
pub mod pdfium;
pub mod render;
pub mod runs;
