//! Source resolver: recipe → GPU image, memoized.
//!
//! - Decoded sources are cached by the source alone (so every transform of
//!   one source shares a single decode), prepared results by the full recipe.
//! - Oversized sources are downsampled once on the CPU before upload.
//! - Nothing is cached for a recipe that failed.
//! - Entries that read a model are indexed by model id so they can be
//!   dropped once that car is gone ([`SourceResolver::forget_model`]).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::gpu::GpuImage;
use crate::texture::{self, DecodedTexture};

use super::effects::EffectPipeline;
use super::material_target::MaterialTarget;
use super::preprocess;
use super::recipe::{KeyContext, RecipeKey, SourceKind, TextureRecipe};

/// A resolved recipe.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub image: GpuImage,
    /// Size of the source before any downsampling.
    pub original_size: (u32, u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub decodes: u64,
    pub hits: u64,
    pub misses: u64,
    pub decoded_entries: usize,
    pub prepared_entries: usize,
}

pub struct SourceResolver {
    pipeline: EffectPipeline,
    decoded: Mutex<HashMap<RecipeKey, GpuImage>>,
    prepared: Mutex<HashMap<RecipeKey, GpuImage>>,
    original_sizes: Mutex<HashMap<RecipeKey, (u32, u32)>>,
    /// Model id → keys of entries that read that model.
    by_model: Mutex<HashMap<String, HashSet<RecipeKey>>>,
    decodes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SourceResolver {
    pub fn new(pipeline: EffectPipeline) -> Self {
        Self {
            pipeline,
            decoded: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashMap::new()),
            original_sizes: Mutex::new(HashMap::new()),
            by_model: Mutex::new(HashMap::new()),
            decodes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve `recipe` for `slot` of `target`, downsampled to `max_size`.
    pub fn resolve(
        &self,
        recipe: &TextureRecipe,
        max_size: Option<u32>,
        target: &dyn MaterialTarget,
        slot: &str,
    ) -> Result<Resolved> {
        recipe.validate()?;
        let model_id = target.model_id();
        if recipe.reads_model() && model_id.is_none() {
            return Err(Error::source_unavailable(format!(
                "`{slot}`: no model loaded"
            )));
        }
        let skin_id = target.skin_id();
        let ctx = KeyContext {
            model_id: model_id.as_deref(),
            skin_id: skin_id.as_deref(),
            slot: Some(slot),
        };
        self.resolve_with(recipe, max_size, target, slot, ctx)
    }

    fn resolve_with(
        &self,
        recipe: &TextureRecipe,
        max_size: Option<u32>,
        target: &dyn MaterialTarget,
        slot: &str,
        ctx: KeyContext<'_>,
    ) -> Result<Resolved> {
        if recipe.is_plain() {
            return self.load_source(&recipe.source, max_size, target, slot, ctx);
        }

        let key = RecipeKey::new(recipe, max_size, ctx);
        let cached = self.prepared.lock().get(&key).cloned();
        if let Some(image) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            let source_key = RecipeKey::new(&recipe.source_only(), max_size, ctx);
            let original_size = self
                .original_sizes
                .lock()
                .get(&source_key)
                .copied()
                .unwrap_or_else(|| image.size());
            log::debug!("Prepared cache hit for `{slot}`");
            return Ok(Resolved {
                image,
                original_size,
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let source = self.load_source(&recipe.source, max_size, target, slot, ctx)?;
        let mut image = source.image;
        if recipe.needs_combine() {
            let layers = recipe
                .layers
                .iter()
                .map(|layer| {
                    self.resolve_with(layer, max_size, target, slot, ctx)
                        .map(|r| r.image)
                })
                .collect::<Result<Vec<_>>>()?;
            image = preprocess::combine(&self.pipeline, recipe, &image, &layers)?;
        }
        if recipe.needs_preparation() {
            image = preprocess::prepare(&self.pipeline, recipe, &image)?;
        }

        self.prepared.lock().insert(key, image.clone());
        if recipe.reads_model() {
            self.index(ctx, key);
        }
        Ok(Resolved {
            image,
            original_size: source.original_size,
        })
    }

    fn load_source(
        &self,
        source: &SourceKind,
        max_size: Option<u32>,
        target: &dyn MaterialTarget,
        slot: &str,
        ctx: KeyContext<'_>,
    ) -> Result<Resolved> {
        let key = RecipeKey::new(&TextureRecipe::new(source.clone()), max_size, ctx);
        let cached = self.decoded.lock().get(&key).cloned();
        if let Some(image) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            let original_size = self
                .original_sizes
                .lock()
                .get(&key)
                .copied()
                .unwrap_or_else(|| image.size());
            return Ok(Resolved {
                image,
                original_size,
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let (decoded, label) = match source {
            SourceKind::InputSlot => {
                let bytes = target
                    .texture_bytes(slot)
                    .ok_or_else(|| Error::source_unavailable(format!("input slot `{slot}`")))?;
                (texture::decode_limited(&bytes, max_size)?, slot.to_string())
            }
            SourceKind::NamedEntry(name) => {
                let bytes = target
                    .texture_bytes(name)
                    .ok_or_else(|| Error::source_unavailable(format!("texture entry `{name}`")))?;
                (texture::decode_limited(&bytes, max_size)?, name.clone())
            }
            SourceKind::RawBytes(raw) => (
                texture::decode_limited(raw.data(), max_size)?,
                format!("raw:{:016x}", raw.content_hash()),
            ),
            SourceKind::SolidColor(rgba) => (
                DecodedTexture {
                    pixels: texture::solid(*rgba),
                    original_size: (1, 1),
                },
                "solid".to_string(),
            ),
        };
        self.decodes.fetch_add(1, Ordering::Relaxed);
        if decoded.was_downsampled() {
            log::debug!(
                "Downsampled `{label}` from {:?} to {:?}",
                decoded.original_size,
                decoded.size()
            );
        }

        let image = GpuImage::upload(self.pipeline.backend(), &decoded.pixels, &label)?;
        self.decoded.lock().insert(key, image.clone());
        self.original_sizes.lock().insert(key, decoded.original_size);
        if source.reads_model() {
            self.index(ctx, key);
        }
        Ok(Resolved {
            image,
            original_size: decoded.original_size,
        })
    }

    fn index(&self, ctx: KeyContext<'_>, key: RecipeKey) {
        if let Some(model_id) = ctx.model_id {
            self.by_model
                .lock()
                .entry(model_id.to_string())
                .or_default()
                .insert(key);
        }
    }

    /// Drop every entry that read `model_id` (any skin). Returns how many
    /// decoded and prepared images were released.
    pub fn forget_model(&self, model_id: &str) -> usize {
        let Some(keys) = self.by_model.lock().remove(model_id) else {
            return 0;
        };
        let mut released = 0;
        {
            let mut decoded = self.decoded.lock();
            let mut prepared = self.prepared.lock();
            let mut sizes = self.original_sizes.lock();
            for key in &keys {
                released += usize::from(decoded.remove(key).is_some());
                released += usize::from(prepared.remove(key).is_some());
                sizes.remove(key);
            }
        }
        log::debug!("Forgot {released} cached images of `{model_id}`");
        released
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        let decoded = std::mem::take(&mut *self.decoded.lock());
        let prepared = std::mem::take(&mut *self.prepared.lock());
        self.original_sizes.lock().clear();
        self.by_model.lock().clear();
        log::debug!(
            "Cleared resolver caches ({} decoded, {} prepared)",
            decoded.len(),
            prepared.len()
        );
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            decodes: self.decodes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            decoded_entries: self.decoded.lock().len(),
            prepared_entries: self.prepared.lock().len(),
        }
    }
}

impl std::fmt::Debug for SourceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceResolver")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{CpuBackend, SharedBackend};
    use crate::paint_shop::material_target::{NoModel, OverrideOutcome, OverrideSource};
    use image::{Rgba, RgbaImage};
    use std::sync::Arc;

    struct FakeModel {
        id: String,
        textures: HashMap<String, Arc<[u8]>>,
    }

    impl MaterialTarget for FakeModel {
        fn seat(&self) -> &str {
            "fake"
        }
        fn model_id(&self) -> Option<String> {
            Some(self.id.clone())
        }
        fn skin_id(&self) -> Option<String> {
            None
        }
        fn texture_bytes(&self, name: &str) -> Option<Arc<[u8]>> {
            self.textures.get(name).cloned()
        }
        fn set_override(&self, _: &str, _: Option<OverrideSource>) -> Result<OverrideOutcome> {
            Ok(OverrideOutcome::Applied)
        }
    }

    fn png(w: u32, h: u32, color: [u8; 4]) -> Arc<[u8]> {
        texture::encode_png(&RgbaImage::from_pixel(w, h, Rgba(color)))
            .unwrap()
            .into()
    }

    fn resolver() -> (SharedBackend, SourceResolver) {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let resolver = SourceResolver::new(EffectPipeline::new(backend.clone()));
        (backend, resolver)
    }

    #[test]
    fn test_same_source_decodes_once() {
        let (_backend, resolver) = resolver();
        let bytes = png(8, 8, [10, 20, 30, 255]);
        let plain = TextureRecipe::raw(bytes.clone());
        let desat = TextureRecipe::raw(bytes).desaturated();

        let a = resolver.resolve(&plain, Some(64), &NoModel, "s").unwrap();
        let b = resolver.resolve(&plain, Some(64), &NoModel, "s").unwrap();
        assert!(a.image.same_as(&b.image));
        let c = resolver.resolve(&desat, Some(64), &NoModel, "s").unwrap();
        let d = resolver.resolve(&desat, Some(64), &NoModel, "s").unwrap();
        assert!(c.image.same_as(&d.image));
        assert!(!c.image.same_as(&a.image));

        let stats = resolver.stats();
        assert_eq!(stats.decodes, 1);
        assert_eq!(stats.decoded_entries, 1);
        assert_eq!(stats.prepared_entries, 1);
        assert!(stats.hits >= 2);
    }

    #[test]
    fn test_downsample_records_original_size() {
        let (_backend, resolver) = resolver();
        let recipe = TextureRecipe::raw(png(64, 32, [1, 2, 3, 255]));
        let r = resolver.resolve(&recipe, Some(16), &NoModel, "s").unwrap();
        assert_eq!(r.image.size(), (16, 8));
        assert_eq!(r.original_size, (64, 32));
        let full = resolver.resolve(&recipe, None, &NoModel, "s").unwrap();
        assert_eq!(full.image.size(), (64, 32));
        assert_eq!(resolver.stats().decodes, 2);
    }

    #[test]
    fn test_model_reads_without_model_fail() {
        let (_backend, resolver) = resolver();
        let err = resolver
            .resolve(&TextureRecipe::input_slot(), None, &NoModel, "body")
            .unwrap_err();
        assert!(err.is_source_unavailable());
        let err = resolver
            .resolve(&TextureRecipe::named("x.png"), None, &NoModel, "body")
            .unwrap_err();
        assert!(err.is_source_unavailable());
        assert_eq!(resolver.stats().decoded_entries, 0);
    }

    #[test]
    fn test_missing_slot_and_bad_bytes_are_not_cached() {
        let (_backend, resolver) = resolver();
        let model = FakeModel {
            id: "abc".into(),
            textures: HashMap::from([("body".to_string(), png(4, 4, [9, 9, 9, 255]))]),
        };
        assert!(resolver
            .resolve(&TextureRecipe::input_slot(), None, &model, "wheels")
            .unwrap_err()
            .is_source_unavailable());
        let err = resolver
            .resolve(&TextureRecipe::raw(vec![0u8, 1, 2]), None, &model, "body")
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(resolver.stats().decoded_entries, 0);

        let ok = resolver
            .resolve(&TextureRecipe::input_slot(), None, &model, "body")
            .unwrap();
        assert_eq!(ok.image.size(), (4, 4));
    }

    #[test]
    fn test_forget_model_drops_only_its_entries() {
        let (_backend, resolver) = resolver();
        let model = |id: &str| FakeModel {
            id: id.into(),
            textures: HashMap::from([("body".to_string(), png(4, 4, [50, 100, 150, 255]))]),
        };
        let (a, b) = (model("a"), model("b"));
        let slot = TextureRecipe::input_slot();
        let desat = TextureRecipe::input_slot().desaturated();
        for car in [&a, &b] {
            resolver.resolve(&slot, None, car, "body").unwrap();
            resolver.resolve(&desat, None, car, "body").unwrap();
        }
        resolver
            .resolve(&TextureRecipe::solid([1, 2, 3, 4]), None, &a, "body")
            .unwrap();
        assert_eq!(resolver.stats().decoded_entries, 3);
        assert_eq!(resolver.stats().prepared_entries, 2);

        assert_eq!(resolver.forget_model("a"), 2);
        assert_eq!(resolver.forget_model("a"), 0);
        let stats = resolver.stats();
        assert_eq!(stats.decoded_entries, 2);
        assert_eq!(stats.prepared_entries, 1);

        // `b` still hits, `a` decodes again
        resolver.resolve(&desat, None, &b, "body").unwrap();
        assert_eq!(resolver.stats().decodes, stats.decodes);
        resolver.resolve(&slot, None, &a, "body").unwrap();
        assert_eq!(resolver.stats().decodes, stats.decodes + 1);
    }

    #[test]
    fn test_layers_and_clear() {
        let (backend, resolver) = resolver();
        let recipe = TextureRecipe::solid([200, 100, 50, 255])
            .with_layer(TextureRecipe::solid([7, 8, 9, 10]))
            .with_channel(
                crate::paint_shop::recipe::Channel::A,
                crate::paint_shop::recipe::ChannelSource::Layer {
                    layer: 0,
                    channel: crate::paint_shop::recipe::Channel::B,
                },
            );
        let r = resolver.resolve(&recipe, None, &NoModel, "s").unwrap();
        assert_eq!(r.image.read_pixels().unwrap().get_pixel(0, 0).0, [200, 100, 50, 9]);
        assert!(backend.stats().live_images > 0);
        drop(r);
        resolver.clear();
        assert_eq!(backend.stats().live_images, 0);
    }
}
