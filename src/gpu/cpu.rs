//! CPU reference backend.
//!
//! Evaluates every [`Technique`] per pixel with the same math as
//! `shaders/paint_shop.wgsl`: `f32` shading, bilinear sampling at texel
//! centers, clamp addressing except for the flake noise (repeat), and RGBA8
//! storage rounded to nearest like an `Rgba8Unorm` target.
//!
//! Input binding convention (shared with the WGSL module):
//!
//! | technique             | t0       | t1     | t2      | t3   |
//! |-----------------------|----------|--------|---------|------|
//! | flakes                | noise    |        |         |      |
//! | pattern               | pattern  | ao     | overlay |      |
//! | colorful pattern      | pattern  | ao     | overlay | mask |
//! | maps / tint / desat.  | source   |        |         |      |
//! | combine               | layer 0  | 1      | 2       | 3    |
//! | find limits (both)    | source   |        |         |      |
//! | normalize             | source   | limits |         |      |
//!
//! An unbound input samples as opaque white.

use std::collections::HashMap;

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;

use super::{
    BackendStats, BufferId, BufferUsage, ChannelAdjust, DrawCall, EffectUniforms, ImageId,
    RenderBackend, StatCounters, Technique, LIMITS_BLOCK, LUMINANCE, MAX_INPUTS,
    NORMALIZE_EPSILON,
};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct CpuBackend {
    images: Mutex<HashMap<ImageId, RgbaImage>>,
    buffers: Mutex<HashMap<BufferId, (BufferUsage, Vec<u8>)>>,
    stats: StatCounters,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn create_image(&self, pixels: &RgbaImage, _label: &str) -> Result<ImageId> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(Error::gpu("cannot upload an empty image"));
        }
        let id = ImageId(self.stats.next_id());
        self.images.lock().insert(id, pixels.clone());
        self.stats.image_created(true);
        Ok(id)
    }

    fn create_target(&self, width: u32, height: u32, label: &str) -> Result<ImageId> {
        if width == 0 || height == 0 {
            return Err(Error::gpu(format!("zero-sized target `{label}`")));
        }
        let id = ImageId(self.stats.next_id());
        self.images.lock().insert(id, RgbaImage::new(width, height));
        self.stats.image_created(false);
        Ok(id)
    }

    fn image_size(&self, id: ImageId) -> Option<(u32, u32)> {
        self.images.lock().get(&id).map(|img| img.dimensions())
    }

    fn draw(&self, call: &DrawCall<'_>) -> Result<()> {
        if call.inputs.iter().flatten().any(|id| *id == call.target) {
            return Err(Error::gpu("a draw cannot sample its own target"));
        }
        let mut images = self.images.lock();
        let mut target = images
            .remove(&call.target)
            .ok_or_else(|| Error::gpu(format!("unknown target {:?}", call.target)))?;

        if let Some(missing) = call.inputs.iter().flatten().find(|id| !images.contains_key(*id)) {
            let err = Error::gpu(format!("unknown input {missing:?}"));
            images.insert(call.target, target);
            return Err(err);
        }
        let inputs: [Option<&RgbaImage>; MAX_INPUTS] =
            std::array::from_fn(|i| call.inputs[i].and_then(|id| images.get(&id)));

        let (w, h) = target.dimensions();
        let ctx = ShadeContext {
            u: call.uniforms,
            inputs,
            target_size: (w, h),
        };
        for y in 0..h {
            for x in 0..w {
                let uv = [(x as f32 + 0.5) / w as f32, (y as f32 + 0.5) / h as f32];
                let out = ctx.shade(call.technique, x, y, uv);
                target.put_pixel(x, y, Rgba(quantize(out)));
            }
        }

        images.insert(call.target, target);
        self.stats.drew();
        Ok(())
    }

    fn read_pixels(&self, id: ImageId) -> Result<RgbaImage> {
        let pixels = self
            .images
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::gpu(format!("unknown image {id:?}")))?;
        self.stats.read_back();
        Ok(pixels)
    }

    fn create_buffer(&self, contents: &[u8], usage: BufferUsage, _label: &str) -> Result<BufferId> {
        let id = BufferId(self.stats.next_id());
        self.buffers.lock().insert(id, (usage, contents.to_vec()));
        self.stats.buffer_created();
        Ok(id)
    }

    fn release_image(&self, id: ImageId) {
        if self.images.lock().remove(&id).is_some() {
            self.stats.image_released();
        }
    }

    fn release_buffer(&self, id: BufferId) {
        if self.buffers.lock().remove(&id).is_some() {
            self.stats.buffer_released();
        }
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-pixel evaluation
// ─────────────────────────────────────────────────────────────────────────────

type Color = [f32; 4];

const WHITE: Color = [1.0; 4];

struct ShadeContext<'a> {
    u: &'a EffectUniforms,
    inputs: [Option<&'a RgbaImage>; MAX_INPUTS],
    target_size: (u32, u32),
}

impl ShadeContext<'_> {
    fn shade(&self, technique: Technique, x: u32, y: u32, uv: [f32; 2]) -> Color {
        let u = self.u;
        match technique {
            Technique::Fill => u.color,

            Technique::Flakes => {
                let n = sample(
                    self.inputs[0],
                    [uv[0] * u.noise_scale[0], uv[1] * u.noise_scale[1]],
                    true,
                )[0];
                let a = 1.0 - u.params[0] * (1.0 - n);
                [u.color[0], u.color[1], u.color[2], a.clamp(0.0, 1.0)]
            }

            Technique::Pattern | Technique::ColorfulPattern => {
                let pattern = sample(self.inputs[0], uv, false);
                let ao = sample(self.inputs[1], uv, false);
                let mut rgb = [pattern[0], pattern[1], pattern[2]];
                if technique == Technique::ColorfulPattern {
                    let mask = sample(self.inputs[3], uv, false);
                    for (i, color) in u.palette.iter().enumerate() {
                        let t = (mask[i] * color[3]).clamp(0.0, 1.0);
                        for c in 0..3 {
                            rgb[c] = mix(rgb[c], color[c], t);
                        }
                    }
                }
                for c in 0..3 {
                    rgb[c] *= ao[c];
                }
                if u.flags[1] != 0 {
                    let overlay = sample(self.inputs[2], uv, false);
                    for c in 0..3 {
                        rgb[c] = mix(rgb[c], overlay[c], overlay[3]);
                    }
                }
                [rgb[0], rgb[1], rgb[2], pattern[3]]
            }

            Technique::Maps => {
                let s = sample(self.inputs[0], uv, false);
                let m = u.multipliers;
                [s[0] * m[0], s[1] * m[1], s[2] * m[2], s[3]]
            }

            Technique::MapsFillGreen => {
                let s = sample(self.inputs[0], uv, false);
                let m = u.multipliers;
                [s[0] * m[0], u.params[0] * m[1], s[2] * m[2], s[3]]
            }

            Technique::Tint => {
                let s = sample(self.inputs[0], uv, false);
                let c = u.color;
                [
                    s[0] * c[0],
                    s[1] * c[1],
                    s[2] * c[2],
                    (s[3] + u.params[0]).clamp(0.0, 1.0),
                ]
            }

            Technique::Desaturate => {
                let s = sample(self.inputs[0], uv, false);
                let l = s[0] * LUMINANCE[0] + s[1] * LUMINANCE[1] + s[2] * LUMINANCE[2];
                [l, l, l, s[3]]
            }

            Technique::Combine => {
                let layers: [Color; MAX_INPUTS] =
                    std::array::from_fn(|i| sample(self.inputs[i], uv, false));
                std::array::from_fn(|ch| {
                    let layer = (u.channel_input[ch] as usize).min(MAX_INPUTS - 1);
                    let source = (u.channel_source[ch] as usize).min(3);
                    ChannelAdjust::from_u32(u.channel_adjust[ch]).apply(layers[layer][source])
                })
            }

            Technique::FindLimitsFirstStep => self.find_limits(x, y, false),
            Technique::FindLimits => self.find_limits(x, y, true),

            Technique::Normalize => {
                let s = sample(self.inputs[0], uv, false);
                let Some(limits) = self.inputs[1] else {
                    return s;
                };
                let lo = load(limits, 0, 0);
                let hi = load(limits, limits.width() / 2, 0);
                std::array::from_fn(|c| {
                    let range = hi[c] - lo[c];
                    if range > NORMALIZE_EPSILON {
                        (s[c] - lo[c]) / range
                    } else {
                        s[c]
                    }
                })
            }
        }
    }

    /// Left half of the target holds minimums, right half maximums. The
    /// first step reads the whole source; later steps read the matching half
    /// of the previous limits image.
    fn find_limits(&self, x: u32, y: u32, from_limits: bool) -> Color {
        let Some(src) = self.inputs[0] else {
            return WHITE;
        };
        let half = (self.target_size.0 / 2).max(1);
        let want_max = x >= half;
        let bx = if want_max { x - half } else { x };

        let (src_w, src_h) = src.dimensions();
        let (region_x, region_w) = if from_limits {
            let src_half = (src_w / 2).max(1);
            (if want_max { src_half } else { 0 }, src_half)
        } else {
            (0, src_w)
        };

        let mut acc = if want_max { [f32::MIN; 4] } else { [f32::MAX; 4] };
        for dy in 0..LIMITS_BLOCK {
            for dx in 0..LIMITS_BLOCK {
                let sx = region_x + (bx * LIMITS_BLOCK + dx).min(region_w - 1);
                let sy = (y * LIMITS_BLOCK + dy).min(src_h - 1);
                let v = load(src, sx, sy);
                for c in 0..4 {
                    acc[c] = if want_max { acc[c].max(v[c]) } else { acc[c].min(v[c]) };
                }
            }
        }
        acc
    }
}

#[inline]
fn mix(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[inline]
fn quantize(c: Color) -> [u8; 4] {
    c.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
}

#[inline]
fn load(img: &RgbaImage, x: u32, y: u32) -> Color {
    let x = x.min(img.width() - 1);
    let y = y.min(img.height() - 1);
    img.get_pixel(x, y).0.map(|v| v as f32 / 255.0)
}

fn texel(img: &RgbaImage, x: i64, y: i64, wrap: bool) -> Color {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let (x, y) = if wrap {
        (x.rem_euclid(w), y.rem_euclid(h))
    } else {
        (x.clamp(0, w - 1), y.clamp(0, h - 1))
    };
    load(img, x as u32, y as u32)
}

/// Bilinear sample at normalized `uv`, texel centers at `(i + 0.5) / size`.
fn sample(img: Option<&RgbaImage>, uv: [f32; 2], wrap: bool) -> Color {
    let Some(img) = img else {
        return WHITE;
    };
    let px = uv[0] * img.width() as f32 - 0.5;
    let py = uv[1] * img.height() as f32 - 0.5;
    let x0 = px.floor();
    let y0 = py.floor();
    let fx = px - x0;
    let fy = py - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let a = texel(img, x0, y0, wrap);
    let b = texel(img, x0 + 1, y0, wrap);
    let c = texel(img, x0, y0 + 1, wrap);
    let d = texel(img, x0 + 1, y0 + 1, wrap);
    std::array::from_fn(|i| mix(mix(a[i], b[i], fx), mix(c[i], d[i], fx), fy))
}
