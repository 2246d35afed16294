//! glTF container reader.
//!
//! Layout on disk:
//!
//! ```text
//! <root>/<id>.glb | <id>.gltf     model, one LOD per scene
//! <root>/<image uri>              external textures
//! <root>/skins/<skin>/<stem>.*    skin textures, matched by file stem
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use glam::{Mat4, Vec3};

use super::container::{
    Aabb, CarDescription, ContainerReader, LodDescription, MaterialDescription, NodeDescription,
    NodeRole,
};
use crate::error::Error;

/// How far an open door moves outwards, in model units.
const DOOR_SWING: f32 = 0.6;

const SKINS_DIR: &str = "skins";

pub struct GltfContainerReader {
    root: PathBuf,
}

impl GltfContainerReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_path(&self, id: &str) -> Result<PathBuf> {
        let direct = self.root.join(id);
        if direct.is_file() {
            return Ok(direct);
        }
        ["glb", "gltf"]
            .iter()
            .map(|ext| self.root.join(format!("{id}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| anyhow!("no model file for `{id}` under {}", self.root.display()))
    }

    fn read_inner(&self, id: &str) -> Result<CarDescription> {
        let path = self.model_path(id)?;
        let base = path.parent().unwrap_or(Path::new("."));
        let gltf::Gltf { document, blob } =
            gltf::Gltf::open(&path).with_context(|| format!("parse {}", path.display()))?;
        let buffers = gltf::import_buffers(&document, Some(base), blob).context("load buffers")?;

        // ---------- textures ----------
        let mut image_names = Vec::with_capacity(document.images().len());
        let mut textures = HashMap::new();
        for image in document.images() {
            let name = image_name(&image);
            match image_bytes(&image, &buffers, base) {
                Ok(bytes) => {
                    textures.insert(name.clone(), bytes);
                }
                Err(e) => log::warn!("{id}: skipping texture `{name}`: {e:#}"),
            }
            image_names.push(name);
        }

        // ---------- materials ----------
        let materials = document
            .materials()
            .map(|m| read_material(&m, &image_names))
            .collect();

        // ---------- LODs ----------
        let mut lods = Vec::new();
        for scene in document.scenes() {
            let mut lod = LodDescription::default();
            for node in scene.nodes() {
                collect_nodes(&node, Mat4::IDENTITY, &buffers, &mut lod.nodes)
                    .with_context(|| format!("scene {}", scene.index()))?;
            }
            lods.push(lod);
        }
        if lods.is_empty() {
            return Err(anyhow!("model has no scenes"));
        }

        let skins = read_skins(&base.join(SKINS_DIR), &image_names)?;
        log::debug!(
            "Read `{id}`: {} LODs, {} materials, {} textures, {} skins",
            lods.len(),
            document.materials().len(),
            textures.len(),
            skins.len()
        );

        Ok(CarDescription {
            id: id.to_string(),
            lods,
            materials,
            textures,
            skins,
        })
    }
}

impl ContainerReader for GltfContainerReader {
    fn read(&self, id: &str) -> crate::error::Result<CarDescription> {
        self.read_inner(id)
            .map_err(|e| Error::load_failure(id, format!("{e:#}")))
    }
}

// ─── helpers ──────────────────────────────────────────────────────────────────

fn image_name(image: &gltf::Image) -> String {
    if let gltf::image::Source::Uri { uri, .. } = image.source() {
        if !uri.starts_with("data:") {
            if let Some(file) = Path::new(uri).file_name() {
                return file.to_string_lossy().into_owned();
            }
        }
    }
    image
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("image_{}", image.index()))
}

fn image_bytes(
    image: &gltf::Image,
    buffers: &[gltf::buffer::Data],
    base: &Path,
) -> Result<Arc<[u8]>> {
    match image.source() {
        gltf::image::Source::View { view, .. } => {
            let data = &buffers
                .get(view.buffer().index())
                .context("buffer index out of range")?
                .0;
            let range = view.offset()..view.offset() + view.length();
            let slice = data.get(range).context("buffer view out of range")?;
            Ok(Arc::from(slice))
        }
        gltf::image::Source::Uri { uri, .. } => {
            if uri.starts_with("data:") {
                return Err(anyhow!("inline data URIs are not supported for images"));
            }
            let path = base.join(uri);
            let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            Ok(Arc::from(bytes))
        }
    }
}

fn read_material(material: &gltf::Material, image_names: &[String]) -> MaterialDescription {
    let name_of = |texture: gltf::Texture| image_names.get(texture.source().index()).cloned();
    let pbr = material.pbr_metallic_roughness();
    let bindings = [
        ("base_color", pbr.base_color_texture().map(|t| t.texture())),
        (
            "metallic_roughness",
            pbr.metallic_roughness_texture().map(|t| t.texture()),
        ),
        ("normal", material.normal_texture().map(|t| t.texture())),
        ("occlusion", material.occlusion_texture().map(|t| t.texture())),
        ("emissive", material.emissive_texture().map(|t| t.texture())),
    ];

    let slots = bindings
        .into_iter()
        .filter_map(|(slot, texture)| Some((slot.to_string(), name_of(texture?)?)))
        .collect();

    MaterialDescription {
        name: material
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("material_{}", material.index().unwrap_or(0))),
        slots,
    }
}

fn collect_nodes(
    node: &gltf::Node,
    parent: Mat4,
    buffers: &[gltf::buffer::Data],
    out: &mut Vec<NodeDescription>,
) -> Result<()> {
    let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());
    let name = node
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("node_{}", node.index()));
    let role = NodeRole::from_name(&name);

    if let Some(mesh) = node.mesh() {
        for primitive in mesh.primitives() {
            let reader = primitive.reader(|b| buffers.get(b.index()).map(|d| d.0.as_slice()));
            let positions: Vec<Vec3> = reader
                .read_positions()
                .with_context(|| format!("`{name}` has no positions"))?
                .map(|p| world.transform_point3(Vec3::from(p)))
                .collect();
            let indices: Vec<u32> = match reader.read_indices() {
                Some(iter) => iter.into_u32().collect(),
                None => (0..positions.len() as u32).collect(),
            };

            let flat: Vec<[f32; 3]> = positions.iter().map(|p| p.to_array()).collect();
            out.push(NodeDescription {
                name: name.clone(),
                role,
                material: primitive.material().index(),
                vertices: Arc::from(bytemuck::cast_slice::<[f32; 3], u8>(&flat)),
                indices: Arc::from(bytemuck::cast_slice::<u32, u8>(&indices)),
                bounds: Aabb::from_points(positions.iter().copied()),
                door_open_offset: door_offset(role),
            });
        }
    }

    for child in node.children() {
        collect_nodes(&child, world, buffers, out)?;
    }
    Ok(())
}

fn door_offset(role: NodeRole) -> Vec3 {
    match role {
        NodeRole::LeftDoor => Vec3::new(-DOOR_SWING, 0.0, 0.0),
        NodeRole::RightDoor => Vec3::new(DOOR_SWING, 0.0, 0.0),
        _ => Vec3::ZERO,
    }
}

/// `skins/<skin>/<file>`, each file bound to the model texture with the same stem.
fn read_skins(
    dir: &Path,
    image_names: &[String],
) -> Result<BTreeMap<String, HashMap<String, Arc<[u8]>>>> {
    let mut skins = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(skins);
    }

    let by_stem: HashMap<String, &String> = image_names
        .iter()
        .map(|name| (file_stem(Path::new(name)), name))
        .collect();

    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let skin_id = entry.file_name().to_string_lossy().into_owned();
        let mut textures = HashMap::new();
        for file in fs::read_dir(entry.path())? {
            let path = file?.path();
            if !path.is_file() {
                continue;
            }
            match by_stem.get(&file_stem(&path)) {
                Some(name) => {
                    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
                    textures.insert((*name).clone(), Arc::from(bytes));
                }
                None => log::debug!("Skin `{skin_id}`: {} matches no texture", path.display()),
            }
        }
        skins.insert(skin_id, textures);
    }
    Ok(skins)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // One triangle, two scenes (LOD 0 has a body and a left door, LOD 1 only a body).
    const MODEL: &str = r#"{
        "asset": { "version": "2.0" },
        "scene": 0,
        "scenes": [ { "nodes": [0, 1] }, { "nodes": [2] } ],
        "nodes": [
            { "name": "body", "mesh": 0 },
            { "name": "DOOR_LF", "mesh": 0, "translation": [0.0, 0.0, 1.0] },
            { "name": "body_lod1", "mesh": 0 }
        ],
        "meshes": [ { "primitives": [ { "attributes": { "POSITION": 0 }, "indices": 1, "material": 0 } ] } ],
        "materials": [ { "name": "paint", "pbrMetallicRoughness": { "baseColorTexture": { "index": 0 } } } ],
        "textures": [ { "source": 0 } ],
        "images": [ { "uri": "body.png" } ],
        "buffers": [ {
            "byteLength": 48,
            "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAAAAQAAAAAAAAAAAAAAAAAAAgD8AAAA/AAAAAAEAAAACAAAA"
        } ],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
            { "buffer": 0, "byteOffset": 36, "byteLength": 12 }
        ],
        "accessors": [
            { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
              "min": [0.0, 0.0, 0.0], "max": [2.0, 1.0, 0.5] },
            { "bufferView": 1, "componentType": 5125, "count": 3, "type": "SCALAR" }
        ]
    }"#;

    fn write_png(path: &Path, color: [u8; 4]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        crate::texture::save(&crate::texture::solid(color), path).unwrap();
    }

    #[test]
    fn test_reads_lods_materials_textures_and_skins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("abc.gltf"), MODEL).unwrap();
        write_png(&dir.path().join("body.png"), [255, 255, 255, 255]);
        write_png(&dir.path().join("skins/red/BODY.png"), [255, 0, 0, 255]);
        write_png(&dir.path().join("skins/red/unused.png"), [0, 0, 0, 255]);

        let reader = GltfContainerReader::new(dir.path());
        let car = reader.read("abc").unwrap();

        assert_eq!(car.id, "abc");
        assert_eq!(car.lods.len(), 2);
        assert_eq!(car.lods[0].nodes.len(), 2);
        assert_eq!(car.lods[1].nodes.len(), 1);

        let door = &car.lods[0].nodes[1];
        assert_eq!(door.role, NodeRole::LeftDoor);
        assert_eq!(door.triangle_count(), 1);
        assert_eq!(door.bounds.min, Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(door.bounds.max, Vec3::new(2.0, 1.0, 1.5));
        assert_eq!(door.door_open_offset, Vec3::new(-DOOR_SWING, 0.0, 0.0));

        assert_eq!(car.materials[0].name, "paint");
        assert_eq!(car.materials[0].slots["base_color"], "body.png");
        assert!(car.textures.contains_key("body.png"));

        assert_eq!(car.skin_ids(), vec!["red".to_string()]);
        let red = &car.skins["red"];
        assert_eq!(red.len(), 1);
        let decoded = crate::texture::decode(&red["body.png"]).unwrap();
        assert_eq!(decoded.get_pixel(0, 0).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_missing_model_is_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = GltfContainerReader::new(dir.path()).read("ghost").unwrap_err();
        assert!(err.is_load_failure());
        assert!(err.to_string().contains("ghost"));
    }
}
