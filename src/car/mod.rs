//! # Car cache
//!
//! Hot-swappable car models for the viewport:
//!
//! * [`ContainerReader`] reads a model container into a [`CarDescription`]
//!   ([`MemoryContainer`] for host-registered cars, [`GltfContainerReader`]
//!   for `.glb` / `.gltf` on disk).
//! * [`CarSlot`] is one viewport seat: sync and async swaps, skins, LODs,
//!   presentation state, live material overrides.
//! * [`EvictionPool`] keeps the last few detached cars' GPU objects so that
//!   switching back does not re-upload. One pool is shared by every slot of a
//!   [`CarCache`].

pub mod container;
pub mod gltf_reader;
pub mod pool;
pub mod resource;
pub mod slot;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::CarCacheConfig;
use crate::gpu::SharedBackend;

pub use container::{
    Aabb, CarDescription, ContainerReader, LodDescription, MaterialDescription, MemoryContainer,
    NodeDescription, NodeRole,
};
pub use gltf_reader::GltfContainerReader;
pub use pool::{EvictionHook, EvictionPool};
pub use resource::{CarAggregates, CarResource, DecodedCar, NodeResource, PresentationState};
pub use slot::{CarSlot, SetCarOutcome, SlotState};

/// Owns the reader and the shared eviction pool; hands out slots.
pub struct CarCache {
    backend: SharedBackend,
    reader: Arc<dyn ContainerReader>,
    pool: Arc<Mutex<EvictionPool>>,
    config: CarCacheConfig,
}

impl CarCache {
    pub fn new(
        backend: SharedBackend,
        reader: Arc<dyn ContainerReader>,
        config: CarCacheConfig,
    ) -> Self {
        log::debug!("Car cache with pool capacity {}", config.pool_capacity);
        Self {
            backend,
            reader,
            pool: Arc::new(Mutex::new(EvictionPool::new(config.pool_capacity))),
            config,
        }
    }

    pub fn create_slot(&self, name: impl Into<String>) -> CarSlot {
        CarSlot::new(
            name,
            Arc::clone(&self.backend),
            Arc::clone(&self.reader),
            Arc::clone(&self.pool),
        )
    }

    pub fn config(&self) -> &CarCacheConfig {
        &self.config
    }

    /// Pooled car ids, oldest first.
    pub fn pooled_ids(&self) -> Vec<String> {
        self.pool.lock().ids()
    }

    /// Run `hook` with the id of every car the pool releases.
    pub fn set_eviction_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.pool.lock().set_eviction_hook(Arc::new(hook));
    }

    /// Release every pooled car.
    pub fn clear_pool(&self) {
        self.pool.lock().clear();
    }
}

impl std::fmt::Debug for CarCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarCache")
            .field("config", &self.config)
            .field("pool", &*self.pool.lock())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    use glam::Vec3;

    use super::container::*;
    use crate::texture;

    fn png(color: [u8; 4], size: u32) -> Arc<[u8]> {
        let img = image::RgbaImage::from_pixel(size, size, image::Rgba(color));
        Arc::from(texture::encode_png(&img).unwrap())
    }

    fn node(name: &str, min: Vec3, max: Vec3, door_open_offset: Vec3) -> NodeDescription {
        let positions = [min.to_array(), max.to_array(), [min.x, max.y, max.z]];
        NodeDescription {
            name: name.to_string(),
            role: NodeRole::from_name(name),
            material: Some(0),
            vertices: Arc::from(bytemuck::cast_slice::<[f32; 3], u8>(&positions)),
            indices: Arc::from(bytemuck::cast_slice::<u32, u8>(&[0, 1, 2])),
            bounds: Aabb::new(min, max),
            door_open_offset,
        }
    }

    /// Two LODs (body + left door, body only), textures `body_detail`
    /// (white) and `rims` (gray), skins `red` and `blue` replacing `body_detail`.
    pub(crate) fn test_car(id: &str) -> CarDescription {
        let body = node("body", Vec3::ZERO, Vec3::new(4.0, 1.0, 2.0), Vec3::ZERO);
        let door = node(
            "door_lf",
            Vec3::ZERO,
            Vec3::ONE,
            Vec3::new(-0.6, 0.0, 0.0),
        );

        let mut slots = BTreeMap::new();
        slots.insert("base_color".to_string(), "body_detail".to_string());

        let mut skins = BTreeMap::new();
        for (skin, color) in [("red", [255, 0, 0, 255]), ("blue", [0, 0, 255, 255])] {
            let mut table = HashMap::new();
            table.insert("body_detail".to_string(), png(color, 4));
            skins.insert(skin.to_string(), table);
        }

        CarDescription {
            id: id.to_string(),
            lods: vec![
                LodDescription {
                    nodes: vec![body.clone(), door],
                },
                LodDescription { nodes: vec![body] },
            ],
            materials: vec![MaterialDescription {
                name: "paint".into(),
                slots,
            }],
            textures: HashMap::from([
                ("body_detail".to_string(), png([255, 255, 255, 255], 4)),
                ("rims".to_string(), png([128, 128, 128, 255], 2)),
            ]),
            skins,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaintShopConfig;
    use crate::gpu::CpuBackend;
    use crate::paint_shop::PaintShop;

    fn two_car_cache() -> (SharedBackend, CarCache) {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let container = MemoryContainer::new()
            .with(fixtures::test_car("a"))
            .with(fixtures::test_car("b"));
        let cache = CarCache::new(
            backend.clone(),
            Arc::new(container),
            CarCacheConfig::default(),
        );
        (backend, cache)
    }

    #[test]
    fn test_slots_share_one_pool() {
        let (backend, cache) = two_car_cache();
        let left = cache.create_slot("left");
        let right = cache.create_slot("right");

        left.set_car("a", None).unwrap();
        left.clear_car();
        assert_eq!(cache.pooled_ids(), vec!["a".to_string()]);

        assert_eq!(right.set_car("a", None).unwrap(), SetCarOutcome::Reattached);
        assert!(cache.pooled_ids().is_empty());
        assert_eq!(right.car_id().as_deref(), Some("a"));

        right.set_car("b", None).unwrap();
        cache.clear_pool();
        assert_eq!(backend.stats().live_buffers, 6);
    }

    #[test]
    fn test_same_slot_overrides_stay_per_car() {
        let (_backend, cache) = two_car_cache();
        let shop = PaintShop::new(cache.backend.clone(), PaintShopConfig::default());
        let left = cache.create_slot("left");
        let right = cache.create_slot("right");
        left.set_car("a", None).unwrap();
        right.set_car("b", None).unwrap();

        shop.override_texture_color(&left, "rims", [1.0, 0.0, 0.0, 1.0])
            .unwrap();
        shop.override_texture_color(&right, "rims", [0.0, 0.0, 1.0, 1.0])
            .unwrap();

        let rims = |slot: &CarSlot| {
            slot.effective_texture("rims")
                .unwrap()
                .read_pixels()
                .unwrap()
                .get_pixel(0, 0)
                .0
        };
        assert_eq!(rims(&left), [255, 0, 0, 255]);
        assert_eq!(rims(&right), [0, 0, 255, 255]);
        assert_eq!(shop.outputs().len(), 2);
    }
}
