//! Integration tests for the HTTP surface of edgequake-drawscan.
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`; the
//! detector is a deterministic fake so no ONNX model is needed. Title-block
//! extraction is disabled, so `meta_data` entries are empty records.
//!
//! Tests that rasterise a PDF need a pdfium library and are gated behind
//! `E2E_ENABLED`:
//!   E2E_ENABLED=1 PDFIUM_LIB_PATH=/path/to/libpdfium cargo test --test pipeline

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use edgequake_drawscan::pipeline::detect::{
    BoundingBox, Detection, DetectionBackend, DetectionModel, PageDetector,
};
use edgequake_drawscan::{DrawScanError, DrawingService, PipelineConfig, PipelineConfigBuilder};
use image::{Rgb, RgbImage};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Finds one Door per page; fails pages whose top-left pixel is dark.
struct FakeDetector;

impl PageDetector for FakeDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, String> {
        if image.get_pixel(0, 0)[0] < 100 {
            return Err("dark page".into());
        }
        Ok(vec![Detection {
            class_id: 1,
            confidence: 0.912,
            bbox: BoundingBox::new(0.1, 0.1, 0.3, 0.3),
        }])
    }
}

struct FakeModel;

impl DetectionModel for FakeModel {
    fn instance(&self) -> Result<Box<dyn PageDetector>, String> {
        Ok(Box::new(FakeDetector))
    }
}

struct FakeBackend;

impl DetectionBackend for FakeBackend {
    fn load(&self) -> Result<Arc<dyn DetectionModel>, DrawScanError> {
        Ok(Arc::new(FakeModel))
    }
}

struct TestApp {
    dir: TempDir,
    router: Router,
}

impl TestApp {
    async fn new() -> Self {
        Self::with_config(|builder| builder).await
    }

    async fn with_config(configure: impl FnOnce(PipelineConfigBuilder) -> PipelineConfigBuilder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = PipelineConfig::builder()
            .upload_dir(dir.path().join("uploads"))
            .output_dir(dir.path().join("outputs"))
            .max_workers(2)
            .disable_extraction();
        if let Ok(lib) = std::env::var("PDFIUM_LIB_PATH") {
            builder = builder.pdfium_lib_path(lib);
        }
        let builder = configure(builder);
        let service = DrawingService::with_backend(builder.build().unwrap(), Arc::new(FakeBackend));
        service.ensure_dirs().await.unwrap();

        Self {
            router: edgequake_drawscan::server::router(Arc::new(service)),
            dir,
        }
    }

    fn outputs(&self) -> PathBuf {
        self.dir.path().join("outputs")
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(req).await
    }

    async fn upload(&self, file_name: &str, bytes: &[u8]) -> (StatusCode, Value) {
        let boundary = "drawscan-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();
        self.send(req).await
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}

fn png_bytes(value: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(64, 48, Rgb([value, value, value]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Every `page_*.jpg` anywhere under `root`, sorted by path.
fn page_images_under(root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("page_") && n.ends_with(".jpg"))
        })
        .collect();
    found.sort();
    found
}

/// A minimal valid PDF with `pages` blank 200×200 pt pages.
fn minimal_pdf(pages: usize) -> Vec<u8> {
    let mut objects = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            (0..pages)
                .map(|i| format!("{} 0 R", i + 3))
                .collect::<Vec<_>>()
                .join(" "),
            pages
        ),
    ];
    for _ in 0..pages {
        objects.push("<< /Type /Page /Parent 2 0 R /MediaBox [0 0 200 200] >>".to_string());
    }

    let mut pdf = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref = pdf.len();
    pdf.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
    for off in offsets {
        pdf.extend_from_slice(format!("{off:010} 00000 n \n").as_bytes());
    }
    pdf.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref
        )
        .as_bytes(),
    );
    pdf
}

// ── HTTP surface ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_version() {
    let app = TestApp::new().await;
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn upload_stores_file_under_fixed_stem() {
    let app = TestApp::new().await;
    let (status, body) = app.upload("Ground Floor.PNG", &png_bytes(200)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filename"], "file.png");
    assert_eq!(body["status"], "Complete");
    assert!(app.dir.path().join("uploads/file.png").is_file());
}

#[tokio::test]
async fn upload_without_file_is_rejected() {
    let app = TestApp::new().await;
    let req = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("content-type", "multipart/form-data; boundary=x")
        .body(Body::from("--x\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhi\r\n--x--\r\n"))
        .unwrap();
    let (status, body) = app.send(req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "failed");
}

#[tokio::test]
async fn upload_that_is_not_multipart_gets_json_error() {
    let app = TestApp::new().await;
    let req = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("content-type", "text/plain")
        .body(Body::from("just text"))
        .unwrap();
    let (status, body) = app.send(req).await;
    assert!(status.is_client_error(), "{status}");
    assert_eq!(body["status"], "failed");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn malformed_inference_query_gets_json_error() {
    let app = TestApp::new().await;
    let (status, body) = app.get("/inference?max_workers=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "failed");
    assert!(!body["error"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn preprocess_without_upload_fails() {
    let app = TestApp::new().await;
    let (status, body) = app.get("/preprocess").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "No uploaded file found");
}

#[tokio::test]
async fn unsupported_format_is_rejected_without_side_effects() {
    let app = TestApp::new().await;
    app.upload("notes.docx", b"PK\x03\x04").await;

    let (status, body) = app.get("/preprocess").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "Unsupported file format: .docx");
    assert!(page_images_under(&app.outputs()).is_empty());
}

#[tokio::test]
async fn png_upload_becomes_single_page() {
    let app = TestApp::new().await;
    app.upload("photo.png", &png_bytes(200)).await;

    let (status, body) = app.get("/preprocess").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["pages"], 1);
    assert_eq!(body["images"].as_array().unwrap().len(), 1);
    assert!(body["images"][0].as_str().unwrap().ends_with("page_1.jpg"));

    let written = page_images_under(&app.outputs());
    assert_eq!(written.len(), 1);
    let decoded = image::open(&written[0]).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (64, 48));
}

#[tokio::test]
async fn cad_upload_without_conversion_service_writes_nothing() {
    let app = TestApp::new().await;
    app.upload("plan.dwg", b"AC1032 not really a drawing").await;

    let (status, body) = app.get("/preprocess").await;
    assert!(status.is_server_error(), "got {status}");
    assert_eq!(body["status"], "failed");
    assert!(body["error"].as_str().unwrap().contains("CONVERT_API_SECRET"));
    assert!(page_images_under(&app.outputs()).is_empty());
    let pages_root = app.outputs().join("pages");
    let leftover_runs = std::fs::read_dir(&pages_root).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftover_runs, 0);
}

#[tokio::test]
async fn inference_before_load_model_is_conflict() {
    let app = TestApp::new().await;
    app.upload("photo.png", &png_bytes(200)).await;
    app.get("/preprocess").await;

    let (status, body) = app.get("/inference").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "Model not loaded");
}

#[tokio::test]
async fn load_model_is_idempotent() {
    let app = TestApp::new().await;
    for _ in 0..2 {
        let (status, body) = app.get("/load_model").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}

#[tokio::test]
async fn results_with_no_runs_are_empty() {
    let app = TestApp::new().await;
    let (status, body) = app.get("/results").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["total_pages"], 0);
    assert_eq!(body["summary"]["total_detections"], 0);
    assert_eq!(body["summary"]["items_found"], 0);
    assert_eq!(body["preview"], Value::Null);
}

// ── Full flow ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn image_flow_end_to_end() {
    let app = TestApp::new().await;

    let (_, body) = app.upload("photo.png", &png_bytes(220)).await;
    assert_eq!(body["status"], "Complete");

    let (_, body) = app.get("/preprocess").await;
    assert_eq!(body["status"], "success");

    let (_, body) = app.get("/load_model").await;
    assert_eq!(body["status"], "ok");

    let (status, body) = app.get("/inference?max_workers=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["total_pages"], 1);
    assert_eq!(body["successful"], 1);
    assert_eq!(body["failed"], 0);
    assert_eq!(body["total_detections"], 1);

    let (status, body) = app.get("/results").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["total_pages"], 1);
    assert_eq!(body["summary"]["total_detections"], 1);
    assert_eq!(body["summary"]["items_found"], 1);
    assert_eq!(body["detections"][0]["class_name"], "Door");
    assert_eq!(body["page_detections"]["1"][0]["class_id"], 1);
    assert!(body["meta_data"]["1"].is_object());

    let preview = body["preview"].as_str().unwrap().to_string();
    assert!(preview.starts_with("/outputs/run/run_"), "preview {preview}");
    assert_eq!(body["pages"][0]["url"], preview.as_str());

    let req = Request::builder().uri(&preview).body(Body::empty()).unwrap();
    let resp = app.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn failing_page_is_reported_not_fatal() {
    let app = TestApp::new().await;
    app.upload("dark.png", &png_bytes(10)).await;
    app.get("/preprocess").await;
    app.get("/load_model").await;

    let (status, body) = app.get("/inference").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["successful"], 0);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["errors"][0]["page"], 1);
    assert_eq!(body["errors"][0]["error"], "dark page");
}

#[tokio::test]
async fn repeated_inference_reports_latest_run_only() {
    let app = TestApp::new().await;
    app.upload("photo.png", &png_bytes(220)).await;
    app.get("/preprocess").await;
    app.get("/load_model").await;
    app.get("/inference").await;
    app.get("/inference").await;

    let runs = std::fs::read_dir(app.outputs().join("run")).unwrap().count();
    assert_eq!(runs, 2);

    let (_, body) = app.get("/results").await;
    assert_eq!(body["summary"]["total_pages"], 1);
    assert_eq!(body["summary"]["total_detections"], 1);
}

#[tokio::test]
async fn reset_clears_uploads_and_outputs() {
    let app = TestApp::new().await;
    app.upload("photo.png", &png_bytes(220)).await;
    app.get("/preprocess").await;

    let (status, body) = app.get("/reset").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(std::fs::read_dir(app.dir.path().join("uploads")).unwrap().count(), 0);
    assert_eq!(std::fs::read_dir(app.outputs()).unwrap().count(), 0);

    let (status, _) = app.get("/preprocess").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ── Requires pdfium ──────────────────────────────────────────────────────────

#[tokio::test]
async fn three_page_pdf_end_to_end() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP: set E2E_ENABLED=1 (and PDFIUM_LIB_PATH) to run");
        return;
    }
    let app = TestApp::new().await;
    app.upload("drawing.pdf", &minimal_pdf(3)).await;

    let (status, body) = app.get("/preprocess").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "success");
    assert_eq!(body["pages"], 3);
    assert_eq!(body["images"].as_array().unwrap().len(), 3);
    for (i, image) in body["images"].as_array().unwrap().iter().enumerate() {
        assert!(image.as_str().unwrap().ends_with(&format!("page_{}.jpg", i + 1)));
    }

    let (_, body) = app.get("/load_model").await;
    assert_eq!(body["status"], "ok");

    let (_, body) = app.get("/inference").await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["total_pages"], 3);
    assert_eq!(body["successful"], 3);
    assert_eq!(body["failed"], 0);

    let (_, body) = app.get("/results").await;
    assert_eq!(body["summary"]["total_pages"], 3);
    let keys: Vec<&str> = body["meta_data"]
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(keys, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn rasterising_twice_leaves_no_stale_pages() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP: set E2E_ENABLED=1 (and PDFIUM_LIB_PATH) to run");
        return;
    }
    let app = TestApp::new().await;
    app.upload("a.pdf", &minimal_pdf(3)).await;
    let (_, first) = app.get("/preprocess").await;
    assert_eq!(first["pages"], 3);

    app.upload("b.pdf", &minimal_pdf(1)).await;
    let (_, second) = app.get("/preprocess").await;
    assert_eq!(second["pages"], 1);

    let run_dir = PathBuf::from(second["run_dir"].as_str().unwrap());
    assert_eq!(page_images_under(&app.outputs()), vec![run_dir.join("page_1.jpg")]);
}

#[cfg(feature = "cli")]
#[tokio::test]
async fn pdf_pages_render_in_worker_processes() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP: set E2E_ENABLED=1 (and PDFIUM_LIB_PATH) to run");
        return;
    }
    let app = TestApp::with_config(|builder| {
        builder
            .max_workers(4)
            .render_worker(env!("CARGO_BIN_EXE_drawscan"), vec!["render-page".into()])
    })
    .await;
    app.upload("drawing.pdf", &minimal_pdf(4)).await;

    let (status, body) = app.get("/preprocess").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "success");
    assert_eq!(body["pages"], 4);
    let run_dir = PathBuf::from(body["run_dir"].as_str().unwrap());
    let expected: Vec<PathBuf> = (1..=4)
        .map(|n| run_dir.join(format!("page_{n}.jpg")))
        .collect();
    assert_eq!(page_images_under(&app.outputs()), expected);
}
