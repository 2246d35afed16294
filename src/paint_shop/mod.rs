//! # Paint shop
//!
//! Live livery compositing on top of a loaded car:
//!
//! * **Recipes** ([`TextureRecipe`]) describe a source texture plus channel
//!   remaps, desaturate / normalize and per-channel adjustments.
//! * The **resolver** turns recipes into GPU images, memoized per source and
//!   per prepared recipe.
//! * The **effect pipeline** draws one full-screen technique per operation
//!   into a per-slot target held by the **output cache**.
//! * Results go live through a [`MaterialTarget`] override, or get baked to a
//!   file (`save_texture*_async`).

pub mod effects;
pub mod material_target;
pub mod output_cache;
pub mod preprocess;
pub mod recipe;
pub mod resolver;

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::RgbaImage;
use parking_lot::Mutex;

use crate::config::PaintShopConfig;
use crate::error::{Error, Result};
use crate::gpu::{GpuImage, SharedBackend, MAX_INPUTS};
use crate::texture;

pub use effects::{Effect, EffectPipeline};
pub use material_target::{MaterialTarget, NoModel, OverrideOutcome, OverrideSource};
pub use output_cache::OutputCache;
pub use recipe::{Channel, ChannelSource, RawBytes, RecipeKey, SourceKind, TextureRecipe};
pub use resolver::{Resolved, ResolverStats, SourceResolver};

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// Metal flakes: base color with noise-driven alpha.
#[derive(Clone, Debug, PartialEq)]
pub struct FlakesRequest {
    pub color: [f32; 3],
    /// 0 = flat alpha of 1, 1 = alpha follows the noise fully.
    pub flakes: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternRequest {
    pub pattern: TextureRecipe,
    pub ao: Option<TextureRecipe>,
    pub overlay: Option<TextureRecipe>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColorfulPatternRequest {
    pub pattern: PatternRequest,
    /// Channel R/G/B selects palette color 0/1/2. Falls back to the AO image.
    pub mask: Option<TextureRecipe>,
    /// Up to three colors; alpha is the blend strength.
    pub colors: Vec<[f32; 4]>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MapsRequest {
    pub source: TextureRecipe,
    pub specular: f32,
    pub gloss: f32,
    pub reflection: f32,
    /// Write this gloss instead of reading the source's green channel.
    pub fixed_gloss: Option<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TintRequest {
    pub source: TextureRecipe,
    pub color: [f32; 3],
    pub alpha_add: f32,
}

/// One paint operation.
#[derive(Clone, Debug, PartialEq)]
pub enum PaintOp {
    Texture(TextureRecipe),
    Color([f32; 4]),
    Flakes(FlakesRequest),
    Pattern(PatternRequest),
    ColorfulPattern(ColorfulPatternRequest),
    Maps(MapsRequest),
    Tint(TintRequest),
}

impl PaintOp {
    fn recipes(&self) -> Vec<&TextureRecipe> {
        match self {
            PaintOp::Texture(r) => vec![r],
            PaintOp::Color(_) | PaintOp::Flakes(_) => Vec::new(),
            PaintOp::Pattern(p) => pattern_recipes(p),
            PaintOp::ColorfulPattern(c) => {
                let mut all = pattern_recipes(&c.pattern);
                all.extend(c.mask.iter());
                all
            }
            PaintOp::Maps(m) => vec![&m.source],
            PaintOp::Tint(t) => vec![&t.source],
        }
    }

    pub fn reads_model(&self) -> bool {
        self.recipes().iter().any(|r| r.reads_model())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PaintOp::Texture(_) => "texture",
            PaintOp::Color(_) => "color",
            PaintOp::Flakes(_) => "flakes",
            PaintOp::Pattern(_) => "pattern",
            PaintOp::ColorfulPattern(_) => "colorful_pattern",
            PaintOp::Maps(_) => "maps",
            PaintOp::Tint(_) => "tint",
        }
    }
}

fn pattern_recipes(p: &PatternRequest) -> Vec<&TextureRecipe> {
    let mut all = vec![&p.pattern];
    all.extend(p.ao.iter());
    all.extend(p.overlay.iter());
    all
}

// ─────────────────────────────────────────────────────────────────────────────
// Plans
// ─────────────────────────────────────────────────────────────────────────────

/// A resolved operation, ready to draw at any size.
struct Plan {
    /// `None`: the output is `inputs[0]` itself.
    effect: Option<Effect>,
    inputs: [Option<GpuImage>; MAX_INPUTS],
    size: (u32, u32),
    original_size: Option<(u32, u32)>,
}

impl Plan {
    fn input_refs(&self) -> [Option<&GpuImage>; MAX_INPUTS] {
        std::array::from_fn(|i| self.inputs[i].as_ref())
    }
}

fn largest(sizes: impl IntoIterator<Item = (u32, u32)>) -> (u32, u32) {
    sizes
        .into_iter()
        .fold((1, 1), |acc, s| (acc.0.max(s.0), acc.1.max(s.1)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Paint shop
// ─────────────────────────────────────────────────────────────────────────────

pub struct PaintShop {
    config: PaintShopConfig,
    pipeline: EffectPipeline,
    resolver: SourceResolver,
    outputs: OutputCache,
    noise: Mutex<Option<GpuImage>>,
}

impl PaintShop {
    pub fn new(backend: SharedBackend, config: PaintShopConfig) -> Self {
        let pipeline = EffectPipeline::new(backend.clone());
        Self {
            config,
            resolver: SourceResolver::new(pipeline.clone()),
            outputs: OutputCache::new(backend),
            pipeline,
            noise: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PaintShopConfig {
        &self.config
    }

    pub fn resolver(&self) -> &SourceResolver {
        &self.resolver
    }

    pub fn outputs(&self) -> &OutputCache {
        &self.outputs
    }

    pub fn backend(&self) -> &SharedBackend {
        self.pipeline.backend()
    }

    /// Drop cached sources and prepared images read from `model_id`.
    pub fn forget_model(&self, model_id: &str) {
        let released = self.resolver.forget_model(model_id);
        if released > 0 {
            log::debug!("Released {released} cached images of `{model_id}`");
        }
    }

    /// Drop every cached source, prepared image and output target.
    pub fn clear(&self) {
        self.resolver.clear();
        self.outputs.dispose_all();
        *self.noise.lock() = None;
    }

    fn noise(&self) -> Result<GpuImage> {
        let mut noise = self.noise.lock();
        if let Some(image) = noise.as_ref() {
            return Ok(image.clone());
        }
        let pixels = texture::noise(self.config.noise_texture_size, self.config.noise_seed);
        let image = GpuImage::upload(self.backend(), &pixels, "flakes_noise")?;
        *noise = Some(image.clone());
        Ok(image)
    }

    fn flakes_effect(&self, request_color: [f32; 3], flakes: f32, size: (u32, u32)) -> Effect {
        let noise_size = self.config.noise_texture_size.max(1) as f32;
        Effect::Flakes {
            color: request_color,
            flakes,
            noise_scale: size.0.max(size.1) as f32 / noise_size,
        }
    }

    fn resolve(
        &self,
        recipe: &TextureRecipe,
        max_size: Option<u32>,
        target: &dyn MaterialTarget,
        slot: &str,
    ) -> Result<Resolved> {
        self.resolver.resolve(recipe, max_size, target, slot)
    }

    /// Resolve every input of `op`. `limited` applies the per-operation
    /// maximum sizes (live previews); bakes resolve at full resolution.
    fn plan(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        op: &PaintOp,
        limited: bool,
    ) -> Result<Plan> {
        let cfg = &self.config;
        let limit = |max: u32| limited.then_some(max);

        let plan = match op {
            PaintOp::Texture(recipe) => {
                let resolved = self.resolve(recipe, None, target, slot)?;
                Plan {
                    effect: None,
                    size: resolved.image.size(),
                    original_size: Some(resolved.original_size),
                    inputs: [Some(resolved.image), None, None, None],
                }
            }

            PaintOp::Color(color) => Plan {
                effect: Some(Effect::Fill { color: *color }),
                inputs: [None, None, None, None],
                size: (cfg.max_color_size.max(1), cfg.max_color_size.max(1)),
                original_size: None,
            },

            PaintOp::Flakes(req) => {
                let size = (cfg.max_flakes_size.max(1), cfg.max_flakes_size.max(1));
                Plan {
                    effect: Some(self.flakes_effect(req.color, req.flakes, size)),
                    inputs: [Some(self.noise()?), None, None, None],
                    size,
                    original_size: None,
                }
            }

            PaintOp::Pattern(req) => {
                let (inputs, size, original) =
                    self.resolve_pattern(req, None, limit(cfg.max_pattern_size), target, slot)?;
                Plan {
                    effect: Some(Effect::Pattern {
                        has_overlay: req.overlay.is_some(),
                    }),
                    inputs,
                    size,
                    original_size: Some(original),
                }
            }

            PaintOp::ColorfulPattern(req) => {
                let (inputs, size, original) = self.resolve_pattern(
                    &req.pattern,
                    req.mask.as_ref(),
                    limit(cfg.max_pattern_size),
                    target,
                    slot,
                )?;
                if req.colors.len() > 3 {
                    return Err(Error::InvalidRecipe(format!(
                        "{} palette colors given, at most 3 supported",
                        req.colors.len()
                    )));
                }
                let mut palette = [[0.0f32; 4]; 3];
                for (dst, src) in palette.iter_mut().zip(&req.colors) {
                    *dst = *src;
                }
                Plan {
                    effect: Some(Effect::ColorfulPattern {
                        palette,
                        has_overlay: req.pattern.overlay.is_some(),
                    }),
                    inputs,
                    size,
                    original_size: Some(original),
                }
            }

            PaintOp::Maps(req) => {
                let source = self.resolve(&req.source, limit(cfg.max_maps_size), target, slot)?;
                Plan {
                    effect: Some(Effect::Maps {
                        specular: req.specular,
                        gloss: req.gloss,
                        reflection: req.reflection,
                        fixed_gloss: req.fixed_gloss,
                    }),
                    size: source.image.size(),
                    original_size: Some(source.original_size),
                    inputs: [Some(source.image), None, None, None],
                }
            }

            PaintOp::Tint(req) => {
                let source = self.resolve(&req.source, limit(cfg.max_tint_size), target, slot)?;
                Plan {
                    effect: Some(Effect::Tint {
                        color: req.color,
                        alpha_add: req.alpha_add,
                    }),
                    size: source.image.size(),
                    original_size: Some(source.original_size),
                    inputs: [Some(source.image), None, None, None],
                }
            }
        };
        Ok(plan)
    }

    /// Pattern, AO, overlay and (for colorful patterns) mask. The output is as
    /// large as the largest of pattern, AO and overlay.
    #[allow(clippy::type_complexity)]
    fn resolve_pattern(
        &self,
        req: &PatternRequest,
        mask: Option<&TextureRecipe>,
        max_size: Option<u32>,
        target: &dyn MaterialTarget,
        slot: &str,
    ) -> Result<([Option<GpuImage>; MAX_INPUTS], (u32, u32), (u32, u32))> {
        let pattern = self.resolve(&req.pattern, max_size, target, slot)?;
        let ao = req
            .ao
            .as_ref()
            .map(|r| self.resolve(r, max_size, target, slot))
            .transpose()?;
        let overlay = req
            .overlay
            .as_ref()
            .map(|r| self.resolve(r, max_size, target, slot))
            .transpose()?;
        let mask = match mask {
            Some(r) => Some(self.resolve(r, max_size, target, slot)?.image),
            None => ao.as_ref().map(|r| r.image.clone()),
        };

        let parts = [Some(&pattern), ao.as_ref(), overlay.as_ref()];
        let size = largest(parts.iter().flatten().map(|r| r.image.size()));
        let original = largest(parts.iter().flatten().map(|r| r.original_size));
        let inputs = [
            Some(pattern.image.clone()),
            ao.map(|r| r.image),
            overlay.map(|r| r.image),
            mask,
        ];
        Ok((inputs, size, original))
    }

    // ── Live overrides ───────────────────────────────────────────────────────

    /// Run `op` for `slot` and install the result on `target`.
    pub fn apply(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        op: &PaintOp,
    ) -> Result<OverrideOutcome> {
        if target.model_id().is_none() {
            if op.reads_model() {
                return Err(Error::source_unavailable(format!(
                    "`{slot}`: no model loaded"
                )));
            }
            log::debug!("No model loaded, dropping {} override of `{slot}`", op.kind());
            return Ok(OverrideOutcome::NoModelLoaded);
        }

        if let PaintOp::Texture(recipe) = op {
            if recipe.is_plain() && recipe.source == SourceKind::InputSlot {
                // The slot's own texture: make sure it exists, then drop any override.
                self.resolve(recipe, None, target, slot)?;
                return target.set_override(slot, None);
            }
        }

        let plan = self.plan(target, slot, op, true)?;
        let image = match &plan.effect {
            None => plan.inputs[0]
                .clone()
                .ok_or_else(|| Error::source_unavailable(format!("`{slot}`: nothing resolved")))?,
            Some(effect) => {
                let (image, drew) = self.outputs.composite(
                    &self.pipeline,
                    target.seat(),
                    slot,
                    effect,
                    &plan.input_refs(),
                    plan.size,
                )?;
                if drew {
                    log::debug!("Composited {} into `{slot}` at {:?}", op.kind(), plan.size);
                }
                image
            }
        };
        target.set_override(slot, Some(OverrideSource::Image(image)))
    }

    /// Override `slot` with a recipe, or revert it with `None`.
    pub fn override_texture(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        recipe: Option<&TextureRecipe>,
    ) -> Result<OverrideOutcome> {
        match recipe {
            Some(recipe) => self.apply(target, slot, &PaintOp::Texture(recipe.clone())),
            None => target.set_override(slot, None),
        }
    }

    pub fn override_texture_color(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        color: [f32; 4],
    ) -> Result<OverrideOutcome> {
        self.apply(target, slot, &PaintOp::Color(color))
    }

    pub fn override_texture_flakes(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        request: &FlakesRequest,
    ) -> Result<OverrideOutcome> {
        self.apply(target, slot, &PaintOp::Flakes(request.clone()))
    }

    pub fn override_texture_pattern(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        request: &PatternRequest,
    ) -> Result<OverrideOutcome> {
        self.apply(target, slot, &PaintOp::Pattern(request.clone()))
    }

    pub fn override_texture_colorful_pattern(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        request: &ColorfulPatternRequest,
    ) -> Result<OverrideOutcome> {
        self.apply(target, slot, &PaintOp::ColorfulPattern(request.clone()))
    }

    pub fn override_texture_maps(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        request: &MapsRequest,
    ) -> Result<OverrideOutcome> {
        self.apply(target, slot, &PaintOp::Maps(request.clone()))
    }

    pub fn override_texture_tint(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        request: &TintRequest,
    ) -> Result<OverrideOutcome> {
        self.apply(target, slot, &PaintOp::Tint(request.clone()))
    }

    // ── Bakes ────────────────────────────────────────────────────────────────

    /// Render `op` at bake size and read it back. Size: `size` when given,
    /// else the source's original resolution, else the composited size.
    pub fn bake_pixels(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        op: &PaintOp,
        size: Option<(u32, u32)>,
    ) -> Result<RgbaImage> {
        let plan = self.plan(target, slot, op, false)?;
        let bake_size = size.or(plan.original_size).unwrap_or(plan.size);
        crate::ensure!(
            bake_size.0 > 0 && bake_size.1 > 0,
            "bake size {:?} must be non-zero",
            bake_size
        );

        match &plan.effect {
            None => {
                let image = plan.inputs[0]
                    .as_ref()
                    .ok_or_else(|| Error::source_unavailable(format!("`{slot}`: nothing resolved")))?;
                let pixels = image.read_pixels()?;
                if pixels.dimensions() == bake_size {
                    Ok(pixels)
                } else {
                    Ok(image::imageops::resize(
                        &pixels,
                        bake_size.0,
                        bake_size.1,
                        FilterType::Lanczos3,
                    ))
                }
            }
            Some(effect) => {
                let effect = match effect {
                    Effect::Flakes { color, flakes, .. } => {
                        self.flakes_effect(*color, *flakes, bake_size)
                    }
                    other => other.clone(),
                };
                let out = self
                    .pipeline
                    .draw_new(&effect, &plan.input_refs(), bake_size, "bake")?;
                out.read_pixels()
            }
        }
    }

    /// Bake `op` and write it to `path` (encoder picked by extension). The
    /// readback happens on the calling thread; encoding and the file write
    /// run on the blocking pool.
    pub async fn save_async(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        op: &PaintOp,
        path: impl AsRef<Path>,
        size: Option<(u32, u32)>,
    ) -> Result<PathBuf> {
        let pixels = self.bake_pixels(target, slot, op, size)?;
        let path = path.as_ref().to_path_buf();
        let out = path.clone();
        tokio::task::spawn_blocking(move || texture::save(&pixels, &out))
            .await
            .map_err(|e| Error::custom(format!("bake writer failed: {e}")))??;
        log::info!("Baked {} for `{slot}` to {}", op.kind(), path.display());
        Ok(path)
    }

    pub async fn save_texture_async(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        recipe: &TextureRecipe,
        path: impl AsRef<Path>,
        size: Option<(u32, u32)>,
    ) -> Result<PathBuf> {
        self.save_async(target, slot, &PaintOp::Texture(recipe.clone()), path, size)
            .await
    }

    pub async fn save_texture_color_async(
        &self,
        color: [f32; 4],
        path: impl AsRef<Path>,
        size: Option<(u32, u32)>,
    ) -> Result<PathBuf> {
        self.save_async(&NoModel, "color", &PaintOp::Color(color), path, size)
            .await
    }

    pub async fn save_texture_flakes_async(
        &self,
        request: &FlakesRequest,
        path: impl AsRef<Path>,
        size: Option<(u32, u32)>,
    ) -> Result<PathBuf> {
        self.save_async(&NoModel, "flakes", &PaintOp::Flakes(request.clone()), path, size)
            .await
    }

    pub async fn save_texture_pattern_async(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        request: &PatternRequest,
        path: impl AsRef<Path>,
        size: Option<(u32, u32)>,
    ) -> Result<PathBuf> {
        self.save_async(target, slot, &PaintOp::Pattern(request.clone()), path, size)
            .await
    }

    pub async fn save_texture_colorful_pattern_async(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        request: &ColorfulPatternRequest,
        path: impl AsRef<Path>,
        size: Option<(u32, u32)>,
    ) -> Result<PathBuf> {
        self.save_async(
            target,
            slot,
            &PaintOp::ColorfulPattern(request.clone()),
            path,
            size,
        )
        .await
    }

    pub async fn save_texture_maps_async(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        request: &MapsRequest,
        path: impl AsRef<Path>,
        size: Option<(u32, u32)>,
    ) -> Result<PathBuf> {
        self.save_async(target, slot, &PaintOp::Maps(request.clone()), path, size)
            .await
    }

    pub async fn save_texture_tint_async(
        &self,
        target: &dyn MaterialTarget,
        slot: &str,
        request: &TintRequest,
        path: impl AsRef<Path>,
        size: Option<(u32, u32)>,
    ) -> Result<PathBuf> {
        self.save_async(target, slot, &PaintOp::Tint(request.clone()), path, size)
            .await
    }
}

impl std::fmt::Debug for PaintShop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaintShop")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("outputs", &self.outputs)
            .finish()
    }
}
