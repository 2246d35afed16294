// src/lib.rs
//! # livery_engine
//!
//! Live car livery compositing plus a hot-swappable car model cache.
//!
//! - [`paint_shop`]: recipes, source resolution, compositing techniques and
//!   per-slot outputs, pushed live into the loaded car or baked to files.
//! - [`car`]: car slots with sync / async swaps, skins, LODs, presentation
//!   state and a shared eviction pool.
//! - [`gpu`]: the render backend seam (`wgpu` or the CPU reference backend)
//!   and RAII handles for images and buffers.

pub mod car;
pub mod config;
pub mod context;
pub mod error;
pub mod gpu;
pub mod paint_shop;
pub mod texture;

use std::sync::Arc;

pub use car::{CarCache, CarSlot, ContainerReader, GltfContainerReader, MemoryContainer, SetCarOutcome, SlotState};
pub use config::{CarCacheConfig, EngineConfig, PaintShopConfig};
pub use context::{Context, OptionContext};
pub use error::{Error, Result};
pub use gpu::{CpuBackend, RenderBackend, SharedBackend, WgpuBackend};
pub use paint_shop::{MaterialTarget, OverrideOutcome, OverrideSource, PaintOp, PaintShop, TextureRecipe};

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// One paint shop and one car cache sharing a backend. Cars released by the
/// pool take their cached paint-shop sources with them.
pub struct LiveryEngine {
    paint_shop: Arc<PaintShop>,
    cars: CarCache,
}

impl LiveryEngine {
    pub fn new(backend: SharedBackend, reader: Arc<dyn ContainerReader>, config: EngineConfig) -> Self {
        log::info!("Livery engine on `{}` backend", backend.name());
        let paint_shop = Arc::new(PaintShop::new(Arc::clone(&backend), config.paint_shop));
        let cars = CarCache::new(backend, reader, config.cars);
        let shop = Arc::downgrade(&paint_shop);
        cars.set_eviction_hook(move |id| {
            if let Some(shop) = shop.upgrade() {
                shop.forget_model(id);
            }
        });
        Self { paint_shop, cars }
    }

    pub fn paint_shop(&self) -> &PaintShop {
        &self.paint_shop
    }

    pub fn cars(&self) -> &CarCache {
        &self.cars
    }

    /// Release every cached paint-shop image and pooled car.
    pub fn clear(&self) {
        self.paint_shop.clear();
        self.cars.clear_pool();
    }
}

impl std::fmt::Debug for LiveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveryEngine")
            .field("paint_shop", &self.paint_shop)
            .field("cars", &self.cars)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Logging
// ----------------------------------------------------------------------------

/// Install `env_logger` (debug in debug builds, warn otherwise; `RUST_LOG`
/// overrides). Safe to call more than once.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging() {
    let _ = env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_wires_shop_and_cache() {
        init_logging();
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let container = MemoryContainer::new().with(car::fixtures::test_car("abc"));
        let engine = LiveryEngine::new(
            backend.clone(),
            Arc::new(container),
            EngineConfig::default().with_cars(CarCacheConfig::default().with_pool_capacity(1)),
        );
        let slot = engine.cars().create_slot("main");
        slot.set_car("abc", Some("red")).unwrap();

        let outcome = engine
            .paint_shop()
            .override_texture_color(&slot, "rims", [0.0, 1.0, 0.0, 1.0])
            .unwrap();
        assert_eq!(outcome, OverrideOutcome::Applied);
        let px = slot.effective_texture("rims").unwrap().read_pixels().unwrap();
        assert_eq!(px.get_pixel(0, 0).0, [0, 255, 0, 255]);

        slot.clear_car();
        engine.clear();
        assert_eq!(backend.stats().live_buffers, 0);
    }

    #[test]
    fn test_evicted_car_releases_cached_sources() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let container = MemoryContainer::new()
            .with(car::fixtures::test_car("a"))
            .with(car::fixtures::test_car("b"))
            .with(car::fixtures::test_car("c"));
        let engine = LiveryEngine::new(
            backend,
            Arc::new(container),
            EngineConfig::default().with_cars(CarCacheConfig::default().with_pool_capacity(1)),
        );
        let slot = engine.cars().create_slot("main");
        let tint = paint_shop::TintRequest {
            source: TextureRecipe::input_slot(),
            color: [1.0, 0.0, 0.0],
            alpha_add: 0.0,
        };

        slot.set_car("a", None).unwrap();
        engine
            .paint_shop()
            .override_texture_tint(&slot, "rims", &tint)
            .unwrap();
        assert_eq!(engine.paint_shop().resolver().stats().decoded_entries, 1);

        // `a` is pooled, so its sources stay
        slot.set_car("b", None).unwrap();
        assert_eq!(engine.paint_shop().resolver().stats().decoded_entries, 1);

        // Pooling `b` evicts `a`
        slot.set_car("c", None).unwrap();
        assert_eq!(engine.cars().pooled_ids(), vec!["b".to_string()]);
        assert_eq!(engine.paint_shop().resolver().stats().decoded_entries, 0);
    }
}
