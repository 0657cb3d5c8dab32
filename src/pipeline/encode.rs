//! Image encoding: page image → base64 PNG wrapped in `ImageData`.
//!
//! Rasterised drawing sheets are several thousand pixels wide, far more than
//! a vision model can use, so pages are downscaled to `max_pixels` on the
//! longest edge first. PNG keeps title-block lettering crisp; JPEG artefacts
//! around thin strokes confuse the model.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Downscale `img` to fit `max_pixels` and encode it for a multimodal request.
pub fn encode_page(img: &DynamicImage, max_pixels: u32) -> Result<ImageData, image::ImageError> {
    let img = if img.width() > max_pixels || img.height() > max_pixels {
        img.resize(max_pixels, max_pixels, FilterType::Triangle)
    } else {
        img.clone()
    };

    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded {}x{} image → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Read a page image from disk and encode it. Blocking.
pub fn encode_page_file(path: &Path, max_pixels: u32) -> Result<ImageData, image::ImageError> {
    let img = image::open(path)?;
    encode_page(&img, max_pixels)
}
