//! CPU-side texture helpers: decoding with an optional size cap, constant
//! and noise images, and encoding for bakes.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::context::Context;
use crate::error::Result;

// ─────────────────────────────────────────────────────────────────────────────
// Decoded texture
// ─────────────────────────────────────────────────────────────────────────────

/// RGBA8 pixels ready for upload, plus the size the source had before any
/// downsampling.
#[derive(Debug, Clone)]
pub struct DecodedTexture {
    pub pixels: RgbaImage,
    pub original_size: (u32, u32),
}

impl DecodedTexture {
    pub fn size(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn was_downsampled(&self) -> bool {
        self.size() != self.original_size
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Decode encoded image bytes (PNG / JPEG) into RGBA8.
pub fn decode(bytes: &[u8]) -> Result<RgbaImage> {
    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgba8())
}

/// Decode and, when either edge exceeds `max_dimension`, downsample once with
/// Lanczos3 so that the result fits (aspect ratio kept).
pub fn decode_limited(bytes: &[u8], max_dimension: Option<u32>) -> Result<DecodedTexture> {
    let img = image::load_from_memory(bytes)?;
    let original_size = img.dimensions();
    let pixels = fit_within(img, max_dimension).to_rgba8();
    Ok(DecodedTexture {
        pixels,
        original_size,
    })
}

fn fit_within(img: DynamicImage, max_dimension: Option<u32>) -> DynamicImage {
    match max_dimension {
        Some(max) if max > 0 => {
            let (w, h) = img.dimensions();
            if w > max || h > max {
                img.resize(max, max, FilterType::Lanczos3)
            } else {
                img
            }
        }
        _ => img,
    }
}

// ── Constant images ──────────────────────────────────────────────────────────

/// 1×1 image of a single color.
pub fn solid(color: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(1, 1, Rgba(color))
}

/// Convert a `[0, 1]` float color to RGBA8.
pub fn color_to_rgba8(color: [f32; 4]) -> [u8; 4] {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

pub fn rgba8_to_color(color: [u8; 4]) -> [f32; 4] {
    color.map(|c| c as f32 / 255.0)
}

// ── Procedural ───────────────────────────────────────────────────────────────

/// Square grayscale white-noise texture. Every texel is independent so the
/// image tiles seamlessly under repeat addressing; the same `(size, seed)`
/// always produces the same pixels.
pub fn noise(size: u32, seed: u64) -> RgbaImage {
    let size = size.max(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = RgbaImage::new(size, size);
    for px in img.pixels_mut() {
        let v: u8 = rng.gen();
        *px = Rgba([v, v, v, 255]);
    }
    img
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Write `pixels` to `path`; the encoder is picked by the file extension.
/// JPEG has no alpha, so alpha is dropped for `.jpg` / `.jpeg`.
pub fn save(pixels: &RgbaImage, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let format = ImageFormat::from_path(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgba8(pixels.clone())
            .to_rgb8()
            .save_with_format(path, format),
        _ => pixels.save_with_format(path, format),
    }
    .with_context(|| format!("saving {}", path.display()))?;
    log::debug!(
        "Saved {}x{} texture to {}",
        pixels.width(),
        pixels.height(),
        path.display()
    );
    Ok(())
}

/// Encode to PNG in memory.
pub fn encode_png(pixels: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    pixels.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
