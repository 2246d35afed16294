// src/config.rs
//! Engine configuration.
//!
//! - Per-operation maximum texture sizes for the paint shop.
//! - Noise texture size and seed for metal flakes.
//! - Eviction pool capacity for the car cache.
//!
//! Everything has a sensible `Default`, `with_*` builders, and JSON loading.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::Result;

// ─────────────────────────────────────────────────────────────────────────────
// Paint shop
// ─────────────────────────────────────────────────────────────────────────────

/// Limits and constants for the compositing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaintShopConfig {
    /// Largest edge of a solid color output.
    pub max_color_size: u32,
    pub max_flakes_size: u32,
    pub max_pattern_size: u32,
    pub max_maps_size: u32,
    pub max_tint_size: u32,
    /// Edge of the square tileable noise texture used by flakes.
    pub noise_texture_size: u32,
    pub noise_seed: u64,
    /// Gloss written by the fixed-gloss maps variant when none is given.
    pub default_fixed_gloss: f32,
}

impl Default for PaintShopConfig {
    fn default() -> Self {
        Self {
            max_color_size: 16,
            max_flakes_size: 256,
            max_pattern_size: 2048,
            max_maps_size: 1024,
            max_tint_size: 1024,
            noise_texture_size: 256,
            noise_seed: 0x5eed_f1a6,
            default_fixed_gloss: 1.0,
        }
    }
}

impl PaintShopConfig {
    pub fn with_max_color_size(mut self, size: u32) -> Self {
        self.max_color_size = size;
        self
    }

    pub fn with_max_flakes_size(mut self, size: u32) -> Self {
        self.max_flakes_size = size;
        self
    }

    pub fn with_max_pattern_size(mut self, size: u32) -> Self {
        self.max_pattern_size = size;
        self
    }

    pub fn with_max_maps_size(mut self, size: u32) -> Self {
        self.max_maps_size = size;
        self
    }

    pub fn with_max_tint_size(mut self, size: u32) -> Self {
        self.max_tint_size = size;
        self
    }

    pub fn with_noise(mut self, size: u32, seed: u64) -> Self {
        self.noise_texture_size = size;
        self.noise_seed = seed;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Car cache
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarCacheConfig {
    /// Recently unloaded cars kept ready for reattach. `0` disables pooling.
    pub pool_capacity: usize,
}

impl Default for CarCacheConfig {
    fn default() -> Self {
        Self { pool_capacity: 2 }
    }
}

impl CarCacheConfig {
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub paint_shop: PaintShopConfig,
    pub cars: CarCacheConfig,
}

impl EngineConfig {
    pub fn with_paint_shop(mut self, paint_shop: PaintShopConfig) -> Self {
        self.paint_shop = paint_shop;
        self
    }

    pub fn with_cars(mut self, cars: CarCacheConfig) -> Self {
        self.cars = cars;
        self
    }

    /// Parse a (possibly partial) JSON document; missing fields keep defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{ "cars": { "pool_capacity": 0 } }"#).unwrap();
        assert_eq!(cfg.cars.pool_capacity, 0);
        assert_eq!(cfg.paint_shop, PaintShopConfig::default());
    }

    #[test]
    fn test_builders() {
        let cfg = EngineConfig::default()
            .with_paint_shop(PaintShopConfig::default().with_max_flakes_size(64).with_noise(32, 7))
            .with_cars(CarCacheConfig::default().with_pool_capacity(5));
        assert_eq!(cfg.paint_shop.max_flakes_size, 64);
        assert_eq!(cfg.paint_shop.noise_texture_size, 32);
        assert_eq!(cfg.paint_shop.noise_seed, 7);
        assert_eq!(cfg.cars.pool_capacity, 5);
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let cfg = EngineConfig::default().with_cars(CarCacheConfig::default().with_pool_capacity(4));
        std::fs::write(&path, cfg.to_json_string().unwrap()).unwrap();
        assert_eq!(EngineConfig::from_json_file(&path).unwrap(), cfg);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = EngineConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
