//! # GPU abstraction for the paint shop and the car cache
//!
//! Everything that touches GPU memory goes through [`RenderBackend`]:
//!
//! * images (decoded textures and render targets) addressed by [`ImageId`],
//! * vertex / index buffers addressed by [`BufferId`],
//! * one full-screen draw per [`DrawCall`], shading with a fixed [`Technique`].
//!
//! Callers never hold raw ids for long. [`GpuImage`] and [`GpuBuffer`] are
//! reference-counted RAII handles that release the backing storage exactly
//! once when the last clone is dropped, and [`GpuArena`] groups the handles
//! owned by one loaded car.
//!
//! Two backends ship with the crate: [`WgpuBackend`] (WGSL, headless device)
//! and [`CpuBackend`] (per-pixel reference implementation of the same
//! techniques, used by tests and GPU-less hosts).

pub mod cpu;
pub mod wgpu_backend;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use image::RgbaImage;

use crate::error::Result;

pub use cpu::CpuBackend;
pub use wgpu_backend::WgpuBackend;

/// Number of texture inputs a technique can bind.
pub const MAX_INPUTS: usize = 4;

/// Rec. 709 luminance weights used by the desaturate technique.
pub const LUMINANCE: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// Below this range a channel is treated as flat and normalize leaves it alone.
pub const NORMALIZE_EPSILON: f32 = 1.0e-5;

/// Block edge used by every find-limits step.
pub const LIMITS_BLOCK: u32 = 4;

// ─────────────────────────────────────────────────────────────────────────────
// Handles
// ─────────────────────────────────────────────────────────────────────────────

/// Backend-local image id.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ImageId(pub u64);

/// Backend-local buffer id.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BufferId(pub u64);

/// What a buffer is bound as.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BufferUsage {
    Vertex,
    Index,
}

pub type SharedBackend = Arc<dyn RenderBackend>;

// ─────────────────────────────────────────────────────────────────────────────
// Techniques & uniforms
// ─────────────────────────────────────────────────────────────────────────────

/// Shader techniques of the compositing pipeline.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Technique {
    Fill,
    Flakes,
    Pattern,
    ColorfulPattern,
    Maps,
    MapsFillGreen,
    Tint,
    Desaturate,
    Combine,
    FindLimitsFirstStep,
    FindLimits,
    Normalize,
}

impl Technique {
    pub const ALL: [Technique; 12] = [
        Technique::Fill,
        Technique::Flakes,
        Technique::Pattern,
        Technique::ColorfulPattern,
        Technique::Maps,
        Technique::MapsFillGreen,
        Technique::Tint,
        Technique::Desaturate,
        Technique::Combine,
        Technique::FindLimitsFirstStep,
        Technique::FindLimits,
        Technique::Normalize,
    ];

    /// WGSL fragment entry point.
    pub fn entry_point(self) -> &'static str {
        match self {
            Technique::Fill => "fs_fill",
            Technique::Flakes => "fs_flakes",
            Technique::Pattern => "fs_pattern",
            Technique::ColorfulPattern => "fs_colorful_pattern",
            Technique::Maps => "fs_maps",
            Technique::MapsFillGreen => "fs_maps_fill_green",
            Technique::Tint => "fs_tint",
            Technique::Desaturate => "fs_desaturate",
            Technique::Combine => "fs_combine",
            Technique::FindLimitsFirstStep => "fs_find_limits_first_step",
            Technique::FindLimits => "fs_find_limits",
            Technique::Normalize => "fs_normalize",
        }
    }

    pub fn name(self) -> &'static str {
        &self.entry_point()[3..]
    }
}

/// Per-channel value adjustment applied by the combine technique.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum ChannelAdjust {
    #[default]
    Identity = 0,
    Invert = 1,
    Zero = 2,
    One = 3,
}

impl ChannelAdjust {
    #[inline]
    pub fn apply(self, v: f32) -> f32 {
        match self {
            ChannelAdjust::Identity => v,
            ChannelAdjust::Invert => 1.0 - v,
            ChannelAdjust::Zero => 0.0,
            ChannelAdjust::One => 1.0,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => ChannelAdjust::Invert,
            2 => ChannelAdjust::Zero,
            3 => ChannelAdjust::One,
            _ => ChannelAdjust::Identity,
        }
    }
}

/// Uniform block shared by every technique. Layout matches `EffectUniforms`
/// in `shaders/paint_shop.wgsl` (176 bytes, std140-compatible).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct EffectUniforms {
    /// Fill / flakes base color, tint color.
    pub color: [f32; 4],
    /// Colorful pattern palette; alpha is the blend strength.
    pub palette: [[f32; 4]; 3],
    /// x: flakes amount / alpha add / fixed gloss.
    pub params: [f32; 4],
    /// Maps: specular, gloss, reflection.
    pub multipliers: [f32; 4],
    pub noise_scale: [f32; 2],
    pub output_size: [f32; 2],
    /// Combine: which input feeds each output channel.
    pub channel_input: [u32; 4],
    /// Combine: which channel of that input.
    pub channel_source: [u32; 4],
    /// Combine: [`ChannelAdjust`] per output channel.
    pub channel_adjust: [u32; 4],
    /// y: overlay bound, z: mask bound.
    pub flags: [u32; 4],
}

impl Default for EffectUniforms {
    fn default() -> Self {
        Self {
            color: [1.0; 4],
            palette: [[0.0; 4]; 3],
            params: [0.0; 4],
            multipliers: [1.0; 4],
            noise_scale: [1.0, 1.0],
            output_size: [1.0, 1.0],
            channel_input: [0; 4],
            channel_source: [0, 1, 2, 3],
            channel_adjust: [0; 4],
            flags: [0; 4],
        }
    }
}

/// One full-screen draw.
#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub technique: Technique,
    pub uniforms: &'a EffectUniforms,
    pub inputs: [Option<ImageId>; MAX_INPUTS],
    pub target: ImageId,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend trait
// ─────────────────────────────────────────────────────────────────────────────

/// Counters every backend keeps; snapshot through [`RenderBackend::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub live_images: u64,
    pub live_buffers: u64,
    pub images_created: u64,
    pub uploads: u64,
    pub draws: u64,
    pub readbacks: u64,
}

/// The render-thread GPU surface. Implementations must not be touched from
/// the background decode workers; they are `Send + Sync` only so that the
/// handles owning them can move between tasks on the render thread.
pub trait RenderBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Upload decoded RGBA8 pixels as a sampled image.
    fn create_image(&self, pixels: &RgbaImage, label: &str) -> Result<ImageId>;

    /// Allocate a render target (sampled + readable).
    fn create_target(&self, width: u32, height: u32, label: &str) -> Result<ImageId>;

    fn image_size(&self, id: ImageId) -> Option<(u32, u32)>;

    /// Bind the technique, draw a full-screen triangle into `call.target`.
    fn draw(&self, call: &DrawCall<'_>) -> Result<()>;

    /// Blocking readback of an image as RGBA8.
    fn read_pixels(&self, id: ImageId) -> Result<RgbaImage>;

    fn create_buffer(&self, contents: &[u8], usage: BufferUsage, label: &str) -> Result<BufferId>;

    fn release_image(&self, id: ImageId);

    fn release_buffer(&self, id: BufferId);

    fn stats(&self) -> BackendStats;
}

/// Atomic counters shared by both backends.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    live_images: AtomicU64,
    live_buffers: AtomicU64,
    images_created: AtomicU64,
    uploads: AtomicU64,
    draws: AtomicU64,
    readbacks: AtomicU64,
    next_id: AtomicU64,
}

impl StatCounters {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn image_created(&self, uploaded: bool) {
        self.live_images.fetch_add(1, Ordering::Relaxed);
        self.images_created.fetch_add(1, Ordering::Relaxed);
        if uploaded {
            self.uploads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn image_released(&self) {
        self.live_images.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn buffer_created(&self) {
        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn buffer_released(&self) {
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn drew(&self) {
        self.draws.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn read_back(&self) {
        self.readbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BackendStats {
        BackendStats {
            live_images: self.live_images.load(Ordering::Relaxed),
            live_buffers: self.live_buffers.load(Ordering::Relaxed),
            images_created: self.images_created.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            draws: self.draws.load(Ordering::Relaxed),
            readbacks: self.readbacks.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII image handle
// ─────────────────────────────────────────────────────────────────────────────

struct ImageInner {
    backend: SharedBackend,
    id: ImageId,
    width: u32,
    height: u32,
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        self.backend.release_image(self.id);
    }
}

/// Shared, reference-counted GPU image. Clones are cheap and compare equal by
/// identity ([`GpuImage::same_as`]); storage is released when the last clone drops.
#[derive(Clone)]
pub struct GpuImage {
    inner: Arc<ImageInner>,
}

impl GpuImage {
    pub fn upload(backend: &SharedBackend, pixels: &RgbaImage, label: &str) -> Result<Self> {
        let id = backend.create_image(pixels, label)?;
        Ok(Self::wrap(backend, id, pixels.width(), pixels.height()))
    }

    pub fn target(backend: &SharedBackend, width: u32, height: u32, label: &str) -> Result<Self> {
        let id = backend.create_target(width, height, label)?;
        Ok(Self::wrap(backend, id, width, height))
    }

    fn wrap(backend: &SharedBackend, id: ImageId, width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(ImageInner {
                backend: Arc::clone(backend),
                id,
                width,
                height,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> ImageId {
        self.inner.id
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.inner.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.inner.height
    }

    #[inline]
    pub fn size(&self) -> (u32, u32) {
        (self.inner.width, self.inner.height)
    }

    /// True when both handles point at the same backing image.
    #[inline]
    pub fn same_as(&self, other: &GpuImage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn read_pixels(&self) -> Result<RgbaImage> {
        self.inner.backend.read_pixels(self.inner.id)
    }
}

impl fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuImage")
            .field("id", &self.inner.id)
            .field("size", &(self.inner.width, self.inner.height))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII buffer handle
// ─────────────────────────────────────────────────────────────────────────────

struct BufferInner {
    backend: SharedBackend,
    id: BufferId,
    len: usize,
    usage: BufferUsage,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.backend.release_buffer(self.id);
    }
}

#[derive(Clone)]
pub struct GpuBuffer {
    inner: Arc<BufferInner>,
}

impl GpuBuffer {
    pub fn upload(
        backend: &SharedBackend,
        contents: &[u8],
        usage: BufferUsage,
        label: &str,
    ) -> Result<Self> {
        let id = backend.create_buffer(contents, usage, label)?;
        Ok(Self {
            inner: Arc::new(BufferInner {
                backend: Arc::clone(backend),
                id,
                len: contents.len(),
                usage,
            }),
        })
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .field("usage", &self.inner.usage)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arena
// ─────────────────────────────────────────────────────────────────────────────

/// Every GPU object created for one owner (a loaded car). Dropping the arena
/// drops its handles; objects still shared elsewhere stay alive until their
/// last clone goes.
#[derive(Default)]
pub struct GpuArena {
    label: String,
    images: Vec<GpuImage>,
    buffers: Vec<GpuBuffer>,
}

impl GpuArena {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            images: Vec::new(),
            buffers: Vec::new(),
        }
    }

    /// Keep `image` alive for the arena's lifetime and hand back a clone.
    pub fn track_image(&mut self, image: GpuImage) -> GpuImage {
        self.images.push(image.clone());
        image
    }

    pub fn track_buffer(&mut self, buffer: GpuBuffer) -> GpuBuffer {
        self.buffers.push(buffer.clone());
        buffer
    }

    /// Drop handles of images that are no longer needed by the owner.
    pub fn forget_images<F: Fn(&GpuImage) -> bool>(&mut self, predicate: F) {
        self.images.retain(|img| !predicate(img));
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for GpuArena {
    fn drop(&mut self) {
        if !self.images.is_empty() || !self.buffers.is_empty() {
            log::debug!(
                "Releasing GPU arena `{}`: {} images, {} buffers",
                self.label,
                self.images.len(),
                self.buffers.len()
            );
        }
    }
}

impl fmt::Debug for GpuArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuArena")
            .field("label", &self.label)
            .field("images", &self.images.len())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniforms_match_wgsl_layout() {
        assert_eq!(std::mem::size_of::<EffectUniforms>(), 176);
        assert_eq!(std::mem::size_of::<EffectUniforms>() % 16, 0);
    }

    #[test]
    fn technique_names_strip_prefix() {
        assert_eq!(Technique::FindLimitsFirstStep.name(), "find_limits_first_step");
        assert_eq!(Technique::Fill.entry_point(), "fs_fill");
    }

    #[test]
    fn image_handles_release_on_last_drop() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let pixels = RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 4]));
        let a = GpuImage::upload(&backend, &pixels, "a").unwrap();
        let b = a.clone();
        assert!(a.same_as(&b));
        assert_eq!(backend.stats().live_images, 1);
        drop(a);
        assert_eq!(backend.stats().live_images, 1);
        drop(b);
        assert_eq!(backend.stats().live_images, 0);
    }

    #[test]
    fn arena_releases_everything_it_tracks() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let mut arena = GpuArena::new("car");
        let pixels = RgbaImage::new(1, 1);
        let _ = arena.track_image(GpuImage::upload(&backend, &pixels, "tex").unwrap());
        let _ = arena.track_buffer(
            GpuBuffer::upload(&backend, &[0u8; 12], BufferUsage::Vertex, "vb").unwrap(),
        );
        assert_eq!(backend.stats().live_images, 1);
        assert_eq!(backend.stats().live_buffers, 1);
        drop(arena);
        assert_eq!(backend.stats().live_images, 0);
        assert_eq!(backend.stats().live_buffers, 0);
    }
}
