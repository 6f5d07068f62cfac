use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec2, Vec3};
use log::warn;

use super::texture::Texture;
use crate::error::LoadError;
use crate::formats::{Amt, MeshFlags, Pol, PolBone, PolMaterial, PolMesh, TextureKind};
use crate::geometry::Aabb;

/// Number of bone influences kept per vertex.
pub const MAX_INFLUENCES: usize = 4;
/// Bones one skinned model may carry.
pub const MAX_BONES: usize = 128;

/// Identity of a loaded model; the renderer keys its GPU buffers by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u32);

impl ModelId {
    fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// GPU vertex layout shared by every model batch.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub light_uv: [f32; 2],
    pub bone_index: [u32; MAX_INFLUENCES],
    /// All zero for rigid vertices.
    pub bone_weight: [f32; MAX_INFLUENCES],
}

#[derive(Debug, Clone)]
pub struct Bone {
    pub name: String,
    pub id: i32,
    /// Always lower than this bone's own index.
    pub parent: Option<usize>,
    pub position: Vec3,
    pub rotation: Quat,
    pub inverse_bind: Mat4,
}

#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    pub color: Option<Arc<Texture>>,
    pub specular_map: Option<Arc<Texture>>,
    pub alpha_map: Option<Arc<Texture>>,
    pub light_map: Option<Arc<Texture>>,
    pub normal_map: Option<Arc<Texture>>,
    pub height_map: Option<Arc<Texture>>,
    pub specular_strength: f32,
    pub specular_shininess: f32,
    pub shadow_darkness: f32,
    pub rim_exponent: f32,
    pub rim_color: Vec3,
    pub sub_materials: Vec<Material>,
}

impl Material {
    pub fn has_alpha(&self) -> bool {
        self.color.as_ref().is_some_and(|texture| texture.has_alpha)
    }

    /// Material used to shade a batch.
    pub fn batch_material(&self, sub_material: Option<usize>) -> &Material {
        sub_material
            .and_then(|index| self.sub_materials.get(index))
            .unwrap_or(self)
    }
}

/// Triangles of one mesh sharing a shading material.
#[derive(Debug, Clone)]
pub struct MeshBatch {
    pub sub_material: Option<usize>,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Mesh {
    pub name: String,
    pub flags: MeshFlags,
    pub material: usize,
    pub batches: Vec<MeshBatch>,
    pub transparent: bool,
    /// Local-space triangle corners, used to build colliders.
    pub triangles: Vec<[Vec3; 3]>,
}

impl Mesh {
    pub fn casts_shadow(&self) -> bool {
        !self.flags.contains(MeshFlags::NO_MAKE_SHADOW)
    }
}

/// Immutable model shared through the asset cache.
#[derive(Debug)]
pub struct Model {
    pub id: ModelId,
    pub path: String,
    /// Directory that holds the model's files; motions resolve against it.
    pub dir: String,
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Material>,
    pub bones: Vec<Bone>,
    pub bone_by_id: HashMap<i32, usize>,
    pub bone_by_name: HashMap<String, usize>,
    pub aabb: Aabb,
}

impl Model {
    /// Builds a model from a parsed POL file and optional AMT parameters.
    ///
    /// `load_texture` resolves a texture file name relative to `dir`.
    pub fn build(
        path: &str,
        dir: &str,
        pol: Pol,
        amt: Option<&Amt>,
        load_texture: &mut dyn FnMut(&str) -> Result<Arc<Texture>, LoadError>,
    ) -> Result<Self, LoadError> {
        let bones = order_bones(path, &pol.bones)?;
        let bone_by_id: HashMap<i32, usize> = bones
            .iter()
            .enumerate()
            .map(|(index, bone)| (bone.id, index))
            .collect();
        let bone_by_name: HashMap<String, usize> = bones
            .iter()
            .enumerate()
            .map(|(index, bone)| (bone.name.clone(), index))
            .collect();

        let materials = pol
            .materials
            .iter()
            .map(|material| build_material(path, material, amt, load_texture))
            .collect::<Result<Vec<_>, _>>()?;

        let mut aabb = Aabb::EMPTY;
        let mut meshes = Vec::with_capacity(pol.meshes.len());
        for mesh in &pol.meshes {
            for vertex in &mesh.vertices {
                aabb.grow(vertex.position);
            }
            meshes.push(build_mesh(path, mesh, &materials, &bone_by_id));
        }

        Ok(Self {
            id: ModelId::next(),
            path: path.to_string(),
            dir: dir.to_string(),
            meshes,
            materials,
            bones,
            bone_by_id,
            bone_by_name,
            aabb,
        })
    }

    pub fn has_bones(&self) -> bool {
        !self.bones.is_empty()
    }

    pub fn bone_index(&self, name: &str) -> Option<usize> {
        self.bone_by_name.get(name).copied()
    }
}

/// Reorders bones so parents precede children and computes bind matrices.
fn order_bones(path: &str, source: &[PolBone]) -> Result<Vec<Bone>, LoadError> {
    let structural = |message: String| LoadError::Structural {
        path: path.to_string(),
        message,
    };

    if source.len() > MAX_BONES {
        return Err(structural(format!(
            "{} bones exceed the skinning limit of {MAX_BONES}",
            source.len()
        )));
    }
    let mut by_id = HashMap::with_capacity(source.len());
    for (index, bone) in source.iter().enumerate() {
        if by_id.insert(bone.id, index).is_some() {
            return Err(structural(format!("duplicate bone id {}", bone.id)));
        }
    }
    for bone in source {
        if let Some(parent) = bone.parent_id {
            if !by_id.contains_key(&parent) {
                return Err(structural(format!(
                    "bone {} references missing parent id {parent}",
                    bone.name
                )));
            }
        }
    }

    // source index -> new index
    let mut placed: Vec<Option<usize>> = vec![None; source.len()];
    let mut order = Vec::with_capacity(source.len());
    while order.len() < source.len() {
        let before = order.len();
        for (index, bone) in source.iter().enumerate() {
            if placed[index].is_some() {
                continue;
            }
            let ready = match bone.parent_id {
                None => true,
                Some(parent) => placed[by_id[&parent]].is_some(),
            };
            if ready {
                placed[index] = Some(order.len());
                order.push(index);
            }
        }
        if order.len() == before {
            return Err(structural("bone hierarchy contains a cycle".to_string()));
        }
    }

    let mut bones: Vec<Bone> = Vec::with_capacity(source.len());
    let mut world: Vec<Mat4> = Vec::with_capacity(source.len());
    for &index in &order {
        let bone = &source[index];
        let parent = bone.parent_id.and_then(|id| placed[by_id[&id]]);
        let local = Mat4::from_rotation_translation(bone.rotation, bone.position);
        let bind = match parent {
            Some(parent) => world[parent] * local,
            None => local,
        };
        world.push(bind);
        bones.push(Bone {
            name: bone.name.clone(),
            id: bone.id,
            parent,
            position: bone.position,
            rotation: bone.rotation,
            inverse_bind: bind.inverse(),
        });
    }
    Ok(bones)
}

fn build_material(
    path: &str,
    source: &PolMaterial,
    amt: Option<&Amt>,
    load_texture: &mut dyn FnMut(&str) -> Result<Arc<Texture>, LoadError>,
) -> Result<Material, LoadError> {
    let color = match source.texture(TextureKind::Color) {
        Some(file) => Some(load_texture(file).map_err(|err| {
            warn!("{path}: material {}: colour texture {file}: {err}", source.name);
            LoadError::Material {
                path: path.to_string(),
                material: source.name.clone(),
                reason: err.to_string(),
            }
        })?),
        None => None,
    };
    let mut optional = |kind: TextureKind| -> Option<Arc<Texture>> {
        let file = source.texture(kind)?;
        match load_texture(file) {
            Ok(texture) => Some(texture),
            Err(err) => {
                warn!("{path}: material {}: ignoring {kind:?} map: {err}", source.name);
                None
            }
        }
    };
    let specular_map = optional(TextureKind::Specular);
    let alpha_map = optional(TextureKind::Alpha);
    let light_map = optional(TextureKind::Light);
    let normal_map = optional(TextureKind::Normal);
    let height_map = optional(TextureKind::Height);

    let params = amt.and_then(|amt| amt.material(&source.name));
    let sub_materials = source
        .children
        .iter()
        .map(|child| build_material(path, child, amt, load_texture))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Material {
        name: source.name.clone(),
        color,
        specular_map,
        alpha_map,
        light_map,
        normal_map,
        height_map,
        specular_strength: params.map_or(0.0, |p| p.specular_strength),
        specular_shininess: params.map_or(1.0, |p| p.specular_shininess),
        shadow_darkness: params.and_then(|p| p.shadow_darkness).unwrap_or(0.5),
        rim_exponent: params.and_then(|p| p.rim_exponent).unwrap_or(0.0),
        rim_color: params.and_then(|p| p.rim_color).unwrap_or(Vec3::ZERO),
        sub_materials,
    })
}

fn build_mesh(
    path: &str,
    source: &PolMesh,
    materials: &[Material],
    bone_by_id: &HashMap<i32, usize>,
) -> Mesh {
    let material = &materials[source.material];
    let influences: Vec<([u32; MAX_INFLUENCES], [f32; MAX_INFLUENCES])> = source
        .vertices
        .iter()
        .map(|vertex| skin_influences(path, &source.name, &vertex.weights, bone_by_id))
        .collect();

    let mut batches: BTreeMap<Option<usize>, MeshBatch> = BTreeMap::new();
    let mut triangles = Vec::with_capacity(source.triangles.len());
    for triangle in &source.triangles {
        let group = triangle.material_group as usize;
        let sub_material = (group < material.sub_materials.len()).then_some(group);
        let batch = batches.entry(sub_material).or_insert_with(|| MeshBatch {
            sub_material,
            vertices: Vec::new(),
            indices: Vec::new(),
        });
        let mut corners = [Vec3::ZERO; 3];
        for corner in 0..3 {
            let vertex_index = triangle.vertices[corner] as usize;
            let position = source.vertices[vertex_index].position;
            corners[corner] = position;
            let uv = source.uvs[triangle.uvs[corner] as usize];
            let light_uv = triangle
                .light_uvs
                .map_or(Vec2::ZERO, |indices| source.light_uvs[indices[corner] as usize]);
            let (bone_index, bone_weight) = influences[vertex_index];
            batch.indices.push(batch.vertices.len() as u32);
            batch.vertices.push(Vertex {
                position: position.to_array(),
                normal: triangle.normal.to_array(),
                uv: uv.to_array(),
                light_uv: light_uv.to_array(),
                bone_index,
                bone_weight,
            });
        }
        triangles.push(corners);
    }

    let blended = MeshFlags::SPRITE.union(MeshFlags::ALPHA);
    let transparent = source.flags.0 & blended.0 != 0
        || source.flags.contains(MeshFlags::ADDITIVE)
        || batches
            .keys()
            .any(|&sub| material.batch_material(sub).has_alpha());

    Mesh {
        name: source.name.clone(),
        flags: source.flags,
        material: source.material,
        batches: batches.into_values().collect(),
        transparent,
        triangles,
    }
}

/// Keeps the strongest influences and renormalises them.
fn skin_influences(
    path: &str,
    mesh: &str,
    weights: &[crate::formats::BoneWeight],
    bone_by_id: &HashMap<i32, usize>,
) -> ([u32; MAX_INFLUENCES], [f32; MAX_INFLUENCES]) {
    let mut mapped: Vec<(usize, f32)> = Vec::with_capacity(weights.len());
    for weight in weights {
        match bone_by_id.get(&weight.bone_id) {
            Some(&index) => mapped.push((index, weight.weight)),
            None => warn!(
                "{path}: mesh {mesh}: weight references unknown bone id {}, dropped",
                weight.bone_id
            ),
        }
    }
    mapped.sort_by(|a, b| b.1.total_cmp(&a.1));
    mapped.truncate(MAX_INFLUENCES);

    let mut indices = [0u32; MAX_INFLUENCES];
    let mut values = [0.0f32; MAX_INFLUENCES];
    let total: f32 = mapped.iter().map(|(_, weight)| weight.max(0.0)).sum();
    if total > f32::EPSILON {
        for (slot, (index, weight)) in mapped.into_iter().enumerate() {
            indices[slot] = index as u32;
            values[slot] = weight.max(0.0) / total;
        }
    }
    (indices, values)
}
