//! Car container descriptions and the reader seam.
//!
//! A [`CarDescription`] is everything the cache needs from a model container:
//! LOD scene lists, materials, the texture table and skins. Readers run on
//! the blocking pool and never touch GPU handles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;
use parking_lot::RwLock;

use crate::error::{Error, Result};

// ─── Bounds ───────────────────────────────────────────────────────────────────

/// Axis-aligned box in car space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// The identity for [`Aabb::union`].
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points.into_iter().fold(Self::EMPTY, |acc, p| Aabb {
            min: acc.min.min(p),
            max: acc.max.max(p),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn translated(&self, offset: Vec3) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        Aabb {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

// ─── Descriptions ─────────────────────────────────────────────────────────────

/// What a node does in the presentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Body,
    LeftDoor,
    RightDoor,
    SteeringWheel,
    FrontWheel,
    RearWheel,
    HeadLight,
    BrakeLight,
    Other,
}

impl NodeRole {
    /// Guess the role from a node name (`DOOR_LF`, `steer`, `light_brake`...).
    pub fn from_name(name: &str) -> Self {
        let n = name.to_ascii_lowercase();
        if n.contains("door_l") {
            NodeRole::LeftDoor
        } else if n.contains("door_r") {
            NodeRole::RightDoor
        } else if n.contains("steer") {
            NodeRole::SteeringWheel
        } else if n.contains("wheel_lf") || n.contains("wheel_rf") {
            NodeRole::FrontWheel
        } else if n.contains("wheel_lr") || n.contains("wheel_rr") {
            NodeRole::RearWheel
        } else if n.contains("brake") {
            NodeRole::BrakeLight
        } else if n.contains("light") {
            NodeRole::HeadLight
        } else if n.contains("body") {
            NodeRole::Body
        } else {
            NodeRole::Other
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeDescription {
    pub name: String,
    pub role: NodeRole,
    pub material: Option<usize>,
    /// Tightly packed `f32x3` positions.
    pub vertices: Arc<[u8]>,
    /// `u32` little-endian triangle list.
    pub indices: Arc<[u8]>,
    pub bounds: Aabb,
    /// Translation applied while the door this node belongs to is open.
    pub door_open_offset: Vec3,
}

impl NodeDescription {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 4 / 3
    }
}

#[derive(Clone, Debug, Default)]
pub struct LodDescription {
    pub nodes: Vec<NodeDescription>,
}

#[derive(Clone, Debug, Default)]
pub struct MaterialDescription {
    pub name: String,
    /// Material slot → texture name.
    pub slots: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct CarDescription {
    /// Primary container path / id.
    pub id: String,
    pub lods: Vec<LodDescription>,
    pub materials: Vec<MaterialDescription>,
    /// Texture name → encoded bytes.
    pub textures: HashMap<String, Arc<[u8]>>,
    /// Skin id → texture name → encoded bytes.
    pub skins: BTreeMap<String, HashMap<String, Arc<[u8]>>>,
}

impl CarDescription {
    pub fn skin_ids(&self) -> Vec<String> {
        self.skins.keys().cloned().collect()
    }

    /// Texture bound to a material slot (`base_color` → `body_detail`).
    /// Names no material binds are taken as texture names.
    pub fn texture_for_slot<'a>(&'a self, slot: &'a str) -> &'a str {
        self.materials
            .iter()
            .find_map(|m| m.slots.get(slot))
            .map_or(slot, String::as_str)
    }

    /// A texture name bound by the texture table or by any material slot.
    pub fn has_texture(&self, name: &str) -> bool {
        self.textures.contains_key(name)
            || self
                .materials
                .iter()
                .any(|m| m.slots.values().any(|t| t == name))
    }
}

// ─── Reader seam ──────────────────────────────────────────────────────────────

/// Reads a car container. Runs on a blocking worker.
pub trait ContainerReader: Send + Sync {
    fn read(&self, id: &str) -> Result<CarDescription>;
}

/// Host-registered descriptions. Optional per-id delays simulate slow reads.
#[derive(Default)]
pub struct MemoryContainer {
    cars: RwLock<HashMap<String, Arc<CarDescription>>>,
    delays: RwLock<HashMap<String, Duration>>,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, description: CarDescription) {
        self.cars
            .write()
            .insert(description.id.clone(), Arc::new(description));
    }

    pub fn with(self, description: CarDescription) -> Self {
        self.insert(description);
        self
    }

    pub fn set_delay(&self, id: impl Into<String>, delay: Duration) {
        self.delays.write().insert(id.into(), delay);
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cars.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl ContainerReader for MemoryContainer {
    fn read(&self, id: &str) -> Result<CarDescription> {
        let delay = self.delays.read().get(id).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.cars
            .read()
            .get(id)
            .map(|d| (**d).clone())
            .ok_or_else(|| Error::load_failure(id, "not registered"))
    }
}
