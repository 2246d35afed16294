//! A loaded car: GPU buffers per LOD, textures, skins and overrides.
//!
//! Loading is split in two stages:
//!
//! * [`DecodedCar::decode`] runs on a blocking worker. It reads nothing but
//!   the description and produces CPU pixels.
//! * [`CarResource::build`] runs on the render thread and uploads everything
//!   into one [`GpuArena`]. Dropping the resource releases that arena.

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbaImage;

use super::container::{Aabb, CarDescription, NodeRole};
use crate::context::OptionContext;
use crate::error::{Error, Result};
use crate::gpu::{BufferUsage, GpuArena, GpuBuffer, GpuImage, SharedBackend};
use crate::paint_shop::OverrideSource;
use crate::texture;

// ─── Presentation ─────────────────────────────────────────────────────────────

/// Viewport-facing state of a car seat. Survives swaps and empty periods.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PresentationState {
    pub lights: bool,
    pub brake_lights: bool,
    pub left_door_open: bool,
    pub right_door_open: bool,
    /// Degrees, positive to the right.
    pub steering_angle: f32,
}

impl PresentationState {
    fn door_open(&self, role: NodeRole) -> bool {
        match role {
            NodeRole::LeftDoor => self.left_door_open,
            NodeRole::RightDoor => self.right_door_open,
            _ => false,
        }
    }
}

/// Counts over the current LOD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CarAggregates {
    pub node_count: usize,
    pub triangle_count: usize,
}

// ─── Stage 1: decode ──────────────────────────────────────────────────────────

/// CPU side of a load. Holds no GPU handles, so it can be built anywhere.
pub struct DecodedCar {
    pub description: Arc<CarDescription>,
    textures: HashMap<String, RgbaImage>,
    skin: Option<(String, HashMap<String, RgbaImage>)>,
}

impl DecodedCar {
    /// Decode every texture plus the requested skin. Undecodable textures are
    /// skipped with a warning; they read as absent afterwards.
    pub fn decode(description: CarDescription, skin: Option<&str>) -> Self {
        let textures = decode_table(&description.id, &description.textures);
        let skin = skin.and_then(|skin_id| match description.skins.get(skin_id) {
            Some(table) => Some((skin_id.to_string(), decode_table(&description.id, table))),
            None => {
                log::warn!("{}: unknown skin `{skin_id}`", description.id);
                None
            }
        });
        Self {
            description: Arc::new(description),
            textures,
            skin,
        }
    }

    pub fn id(&self) -> &str {
        &self.description.id
    }
}

fn decode_table(car: &str, table: &HashMap<String, Arc<[u8]>>) -> HashMap<String, RgbaImage> {
    table
        .iter()
        .filter_map(|(name, bytes)| match texture::decode(bytes) {
            Ok(pixels) => Some((name.clone(), pixels)),
            Err(e) => {
                log::warn!("{car}: cannot decode texture `{name}`: {e}");
                None
            }
        })
        .collect()
}

// ─── Stage 2: GPU resource ────────────────────────────────────────────────────

/// One drawable node of one LOD.
#[derive(Debug)]
pub struct NodeResource {
    pub name: String,
    pub role: NodeRole,
    pub material: Option<usize>,
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub triangle_count: usize,
    pub bounds: Aabb,
    pub door_open_offset: glam::Vec3,
}

pub struct CarResource {
    backend: SharedBackend,
    description: Arc<CarDescription>,
    lods: Vec<Vec<NodeResource>>,
    originals: HashMap<String, GpuImage>,
    skin_textures: HashMap<String, GpuImage>,
    current_skin: Option<String>,
    current_lod: usize,
    overrides: HashMap<String, GpuImage>,
    presentation: PresentationState,
    stable_bounds: Aabb,
    aggregates: CarAggregates,
    arena: GpuArena,
}

impl CarResource {
    /// Upload a decoded car. Any error drops the partial arena with it.
    pub fn build(backend: &SharedBackend, decoded: DecodedCar) -> Result<Self> {
        let DecodedCar {
            description,
            textures,
            skin,
        } = decoded;
        let id = description.id.clone();
        let mut arena = GpuArena::new(id.clone());

        let mut lods = Vec::with_capacity(description.lods.len());
        for (lod_index, lod) in description.lods.iter().enumerate() {
            let mut nodes = Vec::with_capacity(lod.nodes.len());
            for node in &lod.nodes {
                let label = format!("{id}/lod{lod_index}/{}", node.name);
                let vertices = arena.track_buffer(GpuBuffer::upload(
                    backend,
                    &node.vertices,
                    BufferUsage::Vertex,
                    &label,
                )?);
                let indices = arena.track_buffer(GpuBuffer::upload(
                    backend,
                    &node.indices,
                    BufferUsage::Index,
                    &label,
                )?);
                nodes.push(NodeResource {
                    name: node.name.clone(),
                    role: node.role,
                    material: node.material,
                    vertices,
                    indices,
                    triangle_count: node.triangle_count(),
                    bounds: node.bounds,
                    door_open_offset: node.door_open_offset,
                });
            }
            lods.push(nodes);
        }

        let mut originals = HashMap::with_capacity(textures.len());
        for (name, pixels) in &textures {
            let image = GpuImage::upload(backend, pixels, &format!("{id}/{name}"))?;
            originals.insert(name.clone(), arena.track_image(image));
        }

        let mut resource = Self {
            backend: Arc::clone(backend),
            description,
            lods,
            originals,
            skin_textures: HashMap::new(),
            current_skin: None,
            current_lod: 0,
            overrides: HashMap::new(),
            presentation: PresentationState::default(),
            stable_bounds: Aabb::EMPTY,
            aggregates: CarAggregates::default(),
            arena,
        };
        if let Some((skin_id, pixels)) = skin {
            resource.install_skin(Some(skin_id), pixels)?;
        }
        resource.refresh();
        log::info!(
            "Built car `{id}`: {} LODs, {} textures, {} buffers",
            resource.lods.len(),
            resource.originals.len(),
            resource.arena.buffer_count()
        );
        Ok(resource)
    }

    pub fn id(&self) -> &str {
        &self.description.id
    }

    pub fn description(&self) -> &Arc<CarDescription> {
        &self.description
    }

    // ---------- textures ----------

    /// Encoded bytes behind a material slot or texture name, current skin
    /// first.
    pub fn texture_bytes(&self, slot: &str) -> Option<Arc<[u8]>> {
        let name = self.description.texture_for_slot(slot);
        self.current_skin
            .as_ref()
            .and_then(|skin| self.description.skins.get(skin))
            .and_then(|table| table.get(name))
            .or_else(|| self.description.textures.get(name))
            .cloned()
    }

    /// Override, then skin, then original.
    pub fn effective_texture(&self, slot: &str) -> Option<GpuImage> {
        let name = self.description.texture_for_slot(slot);
        self.overrides
            .get(name)
            .or_else(|| self.skin_textures.get(name))
            .or_else(|| self.originals.get(name))
            .cloned()
    }

    pub fn has_slot(&self, slot: &str) -> bool {
        let name = self.description.texture_for_slot(slot);
        self.originals.contains_key(name) || self.description.has_texture(name)
    }

    pub fn override_slots(&self) -> Vec<String> {
        let mut slots: Vec<String> = self.overrides.keys().cloned().collect();
        slots.sort();
        slots
    }

    /// Install or revert the override of `slot`. One override per texture:
    /// a material slot and the texture it binds share it.
    pub fn set_override(&mut self, slot: &str, source: Option<OverrideSource>) -> Result<()> {
        if !self.has_slot(slot) {
            return Err(Error::source_unavailable(format!(
                "`{}` has no texture slot `{slot}`",
                self.id()
            )));
        }
        let name = self.description.texture_for_slot(slot).to_string();
        match source {
            None => {
                if self.overrides.remove(&name).is_some() {
                    log::debug!("{}: reverted `{name}`", self.id());
                }
            }
            Some(OverrideSource::Image(image)) => {
                self.overrides.insert(name, image);
            }
            Some(OverrideSource::Bytes(bytes)) => {
                let pixels = texture::decode(&bytes)?;
                let image =
                    GpuImage::upload(&self.backend, &pixels, &format!("{}/override/{name}", self.id()))?;
                self.overrides.insert(name, image);
            }
        }
        Ok(())
    }

    pub fn clear_overrides(&mut self) {
        self.overrides.clear();
    }

    // ---------- skins ----------

    pub fn skin_ids(&self) -> Vec<String> {
        self.description.skin_ids()
    }

    pub fn current_skin(&self) -> Option<&str> {
        self.current_skin.as_deref()
    }

    /// Switch skins, decoding on the calling thread. `None` shows the
    /// original textures. Unknown ids fail with `SourceUnavailable`.
    pub fn apply_skin(&mut self, skin: Option<&str>) -> Result<()> {
        if self.current_skin.as_deref() == skin {
            return Ok(());
        }
        let pixels = match skin {
            Some(skin_id) => {
                let table = self
                    .description
                    .skins
                    .get(skin_id)
                    .or_unavailable(|| format!("`{}` has no skin `{skin_id}`", self.id()))?;
                decode_table(self.id(), table)
            }
            None => HashMap::new(),
        };
        self.install_skin(skin.map(str::to_string), pixels)
    }

    fn install_skin(&mut self, skin: Option<String>, pixels: HashMap<String, RgbaImage>) -> Result<()> {
        let mut uploaded = HashMap::with_capacity(pixels.len());
        for (name, image) in &pixels {
            let label = format!("{}/skin/{name}", self.id());
            uploaded.insert(name.clone(), GpuImage::upload(&self.backend, image, &label)?);
        }

        let old = std::mem::take(&mut self.skin_textures);
        self.arena
            .forget_images(|img| old.values().any(|o| o.same_as(img)));
        drop(old);

        for (name, image) in uploaded {
            let image = self.arena.track_image(image);
            self.skin_textures.insert(name, image);
        }
        log::debug!("{}: skin {:?} -> {:?}", self.id(), self.current_skin, skin);
        self.current_skin = skin;
        Ok(())
    }

    // ---------- LODs ----------

    pub fn lod(&self) -> usize {
        self.current_lod
    }

    pub fn lod_count(&self) -> usize {
        self.lods.len()
    }

    /// Clamped to the available range.
    pub fn select_lod(&mut self, lod: usize) {
        let lod = lod.min(self.lods.len().saturating_sub(1));
        if lod != self.current_lod {
            self.current_lod = lod;
            self.refresh();
        }
    }

    pub fn nodes(&self) -> &[NodeResource] {
        self.lods
            .get(self.current_lod)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    // ---------- presentation & bounds ----------

    pub fn presentation(&self) -> &PresentationState {
        &self.presentation
    }

    pub fn apply_presentation(&mut self, state: &PresentationState) {
        self.presentation = state.clone();
    }

    /// Current bounds, with open doors moved by their swing offset.
    pub fn bounding_box(&self) -> Aabb {
        self.nodes().iter().fold(Aabb::EMPTY, |acc, node| {
            let bounds = if self.presentation.door_open(node.role) {
                node.bounds.translated(node.door_open_offset)
            } else {
                node.bounds
            };
            acc.union(&bounds)
        })
    }

    /// Bounds with doors closed and steering centered, taken on attach and
    /// LOD change.
    pub fn stable_bounding_box(&self) -> Aabb {
        self.stable_bounds
    }

    pub fn aggregates(&self) -> CarAggregates {
        self.aggregates
    }

    fn refresh(&mut self) {
        let nodes = self.nodes();
        let stable_bounds = nodes
            .iter()
            .fold(Aabb::EMPTY, |acc, node| acc.union(&node.bounds));
        let aggregates = CarAggregates {
            node_count: nodes.len(),
            triangle_count: nodes.iter().map(|n| n.triangle_count).sum(),
        };
        self.stable_bounds = stable_bounds;
        self.aggregates = aggregates;
    }

    pub fn arena(&self) -> &GpuArena {
        &self.arena
    }
}

impl std::fmt::Debug for CarResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarResource")
            .field("id", &self.id())
            .field("skin", &self.current_skin)
            .field("lod", &self.current_lod)
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::fixtures::test_car;
    use crate::gpu::CpuBackend;
    use glam::Vec3;

    fn build(backend: &SharedBackend, skin: Option<&str>) -> CarResource {
        CarResource::build(backend, DecodedCar::decode(test_car("abc"), skin)).unwrap()
    }

    fn pixel(image: &GpuImage) -> [u8; 4] {
        image.read_pixels().unwrap().get_pixel(0, 0).0
    }

    #[test]
    fn test_build_and_drop_release_everything() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let car = build(&backend, Some("red"));
        let stats = backend.stats();
        // 2 LODs: 2 + 1 nodes, vertex + index buffer each
        assert_eq!(stats.live_buffers, 6);
        // body_detail + rims originals, body_detail skin
        assert_eq!(stats.live_images, 3);
        drop(car);
        let stats = backend.stats();
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.live_images, 0);
    }

    #[test]
    fn test_effective_texture_priority() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let mut car = build(&backend, None);
        assert_eq!(pixel(&car.effective_texture("body_detail").unwrap()), [255, 255, 255, 255]);

        car.apply_skin(Some("red")).unwrap();
        assert_eq!(car.current_skin(), Some("red"));
        assert_eq!(pixel(&car.effective_texture("body_detail").unwrap()), [255, 0, 0, 255]);
        // Skin does not replace rims
        assert_eq!(pixel(&car.effective_texture("rims").unwrap()), [128, 128, 128, 255]);

        let green = GpuImage::upload(&backend, &texture::solid([0, 255, 0, 255]), "green").unwrap();
        car.set_override("body_detail", Some(OverrideSource::Image(green)))
            .unwrap();
        assert_eq!(pixel(&car.effective_texture("body_detail").unwrap()), [0, 255, 0, 255]);

        car.set_override("body_detail", None).unwrap();
        assert_eq!(pixel(&car.effective_texture("body_detail").unwrap()), [255, 0, 0, 255]);
    }

    #[test]
    fn test_skin_bytes_win_for_named_entries() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let car = build(&backend, Some("blue"));
        let bytes = car.texture_bytes("body_detail").unwrap();
        assert_eq!(texture::decode(&bytes).unwrap().get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert!(car.texture_bytes("rims").is_some());
        assert!(car.texture_bytes("missing").is_none());
    }

    #[test]
    fn test_skin_switch_releases_previous_skin_images() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let mut car = build(&backend, Some("red"));
        assert_eq!(backend.stats().live_images, 3);
        car.apply_skin(Some("blue")).unwrap();
        assert_eq!(backend.stats().live_images, 3);
        car.apply_skin(None).unwrap();
        assert_eq!(backend.stats().live_images, 2);
        assert!(car.apply_skin(Some("chrome")).unwrap_err().is_source_unavailable());
        assert_eq!(car.current_skin(), None);
    }

    #[test]
    fn test_override_bytes_and_unknown_slot() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let mut car = build(&backend, None);
        let png = texture::encode_png(&texture::solid([1, 2, 3, 4])).unwrap();
        car.set_override("rims", Some(OverrideSource::Bytes(Arc::from(png))))
            .unwrap();
        assert_eq!(pixel(&car.effective_texture("rims").unwrap()), [1, 2, 3, 4]);
        assert_eq!(car.override_slots(), vec!["rims".to_string()]);

        let err = car.set_override("spoiler", None).unwrap_err();
        assert!(err.is_source_unavailable());
    }

    #[test]
    fn test_material_slot_names_resolve_to_textures() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let mut car = build(&backend, Some("red"));
        assert!(car.has_slot("base_color"));
        let bytes = car.texture_bytes("base_color").unwrap();
        assert_eq!(texture::decode(&bytes).unwrap().get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(pixel(&car.effective_texture("base_color").unwrap()), [255, 0, 0, 255]);

        let green = GpuImage::upload(&backend, &texture::solid([0, 255, 0, 255]), "green").unwrap();
        car.set_override("base_color", Some(OverrideSource::Image(green)))
            .unwrap();
        assert_eq!(pixel(&car.effective_texture("body_detail").unwrap()), [0, 255, 0, 255]);
        assert_eq!(car.override_slots(), vec!["body_detail".to_string()]);

        car.set_override("body_detail", None).unwrap();
        assert_eq!(pixel(&car.effective_texture("base_color").unwrap()), [255, 0, 0, 255]);
    }

    #[test]
    fn test_bounds_doors_and_lod() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let mut car = build(&backend, None);
        let closed = car.bounding_box();
        assert_eq!(closed.min, Vec3::ZERO);
        assert_eq!(closed.max, Vec3::new(4.0, 1.0, 2.0));
        assert_eq!(
            car.aggregates(),
            CarAggregates {
                node_count: 2,
                triangle_count: 2
            }
        );

        car.apply_presentation(&PresentationState {
            left_door_open: true,
            ..Default::default()
        });
        assert_eq!(car.bounding_box().min, Vec3::new(-0.6, 0.0, 0.0));
        assert_eq!(car.stable_bounding_box(), closed);

        car.select_lod(7);
        assert_eq!(car.lod(), 1);
        assert_eq!(car.aggregates().node_count, 1);
        assert_eq!(car.bounding_box(), car.stable_bounding_box());
    }
}
