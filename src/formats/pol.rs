use glam::{Quat, Vec2, Vec3};
use log::warn;

use super::reader::Reader;
use crate::error::ParseError;

const FORMAT: &str = "POL";

/// Decoded POL file: materials, meshes and the bind-pose skeleton.
#[derive(Debug, Clone, PartialEq)]
pub struct Pol {
    pub version: u32,
    pub materials: Vec<PolMaterial>,
    pub meshes: Vec<PolMesh>,
    pub bones: Vec<PolBone>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolMaterial {
    pub name: String,
    pub textures: Vec<PolTexture>,
    /// Independent shading materials selected by a triangle's material group.
    pub children: Vec<PolMaterial>,
}

impl PolMaterial {
    /// Returns the first texture of the given kind.
    pub fn texture(&self, kind: TextureKind) -> Option<&str> {
        self.textures
            .iter()
            .find(|texture| texture.kind == kind)
            .map(|texture| texture.file.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolTexture {
    pub file: String,
    pub kind: TextureKind,
}

/// Role of a texture referenced by a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    Color,
    Specular,
    Alpha,
    Light,
    Normal,
    Height,
}

impl TextureKind {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            1 => Self::Color,
            2 => Self::Specular,
            3 => Self::Alpha,
            4 => Self::Light,
            5 => Self::Normal,
            6 => Self::Height,
            _ => return None,
        })
    }

    pub fn tag(self) -> u32 {
        match self {
            Self::Color => 1,
            Self::Specular => 2,
            Self::Alpha => 3,
            Self::Light => 4,
            Self::Normal => 5,
            Self::Height => 6,
        }
    }
}

/// Rendering flags encoded as bracketed tokens in a mesh name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct MeshFlags(pub u32);

impl MeshFlags {
    pub const NONE: Self = Self(0);
    pub const NO_LIGHTING: Self = Self(1 << 0);
    pub const NO_MAKE_SHADOW: Self = Self(1 << 1);
    pub const ENV_MAP: Self = Self(1 << 2);
    pub const BOTH_FACE: Self = Self(1 << 3);
    pub const ADDITIVE: Self = Self(1 << 4);
    pub const SPRITE: Self = Self(1 << 5);
    pub const ALPHA: Self = Self(1 << 6);

    #[inline]
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Extracts flags from tokens such as `body(NoLighting)[BothFace]`.
    pub fn from_mesh_name(name: &str) -> Self {
        let mut flags = Self::NONE;
        let mut rest = name;
        while let Some(start) = rest.find(['(', '[']) {
            let close = if rest.as_bytes()[start] == b'(' { ')' } else { ']' };
            let Some(len) = rest[start + 1..].find(close) else {
                break;
            };
            let token = &rest[start + 1..start + 1 + len];
            match token.trim().to_ascii_lowercase().as_str() {
                "nolighting" => flags = flags.union(Self::NO_LIGHTING),
                "nomakeshadow" => flags = flags.union(Self::NO_MAKE_SHADOW),
                "envmap" => flags = flags.union(Self::ENV_MAP),
                "bothface" => flags = flags.union(Self::BOTH_FACE),
                "additive" | "add" => flags = flags.union(Self::ADDITIVE),
                "sprite" => flags = flags.union(Self::SPRITE),
                "alpha" | "alphablend" => flags = flags.union(Self::ALPHA),
                _ => {}
            }
            rest = &rest[start + 1 + len + 1..];
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolMesh {
    pub name: String,
    pub flags: MeshFlags,
    pub material: usize,
    pub vertices: Vec<PolVertex>,
    pub uvs: Vec<Vec2>,
    pub light_uvs: Vec<Vec2>,
    pub triangles: Vec<PolTriangle>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolVertex {
    pub position: Vec3,
    pub weights: Vec<BoneWeight>,
}

/// Raw weight keyed by the file's numeric bone id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoneWeight {
    pub bone_id: i32,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolTriangle {
    pub vertices: [u32; 3],
    pub uvs: [u32; 3],
    pub light_uvs: Option<[u32; 3]>,
    pub normal: Vec3,
    pub material_group: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolBone {
    pub name: String,
    pub id: i32,
    /// Numeric id of the parent bone, or `None` for roots.
    pub parent_id: Option<i32>,
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pol {
    /// Decodes a POL buffer.
    ///
    /// Unknown texture tags and trailing bytes only produce warnings; every
    /// other inconsistency fails the whole file.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(data, FORMAT);
        r.expect_magic(b"POL\0")?;
        let version = r.u32()?;
        if version != 1 && version != 2 {
            return Err(ParseError::UnsupportedVersion {
                format: FORMAT,
                version,
            });
        }

        let nr_materials = r.count(9)?;
        let mut materials = Vec::with_capacity(nr_materials);
        for _ in 0..nr_materials {
            materials.push(parse_material(&mut r, true)?);
        }

        let nr_meshes = r.count(4)?;
        let mut meshes = Vec::with_capacity(nr_meshes);
        for _ in 0..nr_meshes {
            if let Some(mesh) = parse_mesh(&mut r, version, materials.len())? {
                meshes.push(mesh);
            }
        }

        let nr_bones = r.count(37)?;
        let mut bones = Vec::with_capacity(nr_bones);
        for _ in 0..nr_bones {
            let name = r.cstring()?;
            let id = r.i32()?;
            let parent = r.i32()?;
            let position = r.position3()?;
            let rotation = r.rotation()?;
            bones.push(PolBone {
                name,
                id,
                parent_id: (parent >= 0).then_some(parent),
                position,
                rotation,
            });
        }

        if r.remaining() > 0 {
            warn!(
                "POL: {} trailing bytes after offset {}",
                r.remaining(),
                r.position()
            );
        }

        Ok(Self {
            version,
            materials,
            meshes,
            bones,
        })
    }
}

fn parse_material(r: &mut Reader<'_>, allow_children: bool) -> Result<PolMaterial, ParseError> {
    let name = r.cstring()?;
    let nr_textures = r.count(5)?;
    let mut textures = Vec::with_capacity(nr_textures);
    for _ in 0..nr_textures {
        let file = r.cstring()?;
        let tag = r.u32()?;
        match TextureKind::from_tag(tag) {
            Some(kind) => textures.push(PolTexture { file, kind }),
            None => warn!("POL: material {name}: dropping texture {file} with unknown type {tag}"),
        }
    }
    let nr_children = r.count(9)?;
    if nr_children > 0 && !allow_children {
        return Err(r.invalid(format!("sub-material {name} has its own sub-materials")));
    }
    let mut children = Vec::with_capacity(nr_children);
    for _ in 0..nr_children {
        children.push(parse_material(r, false)?);
    }
    Ok(PolMaterial {
        name,
        textures,
        children,
    })
}

fn parse_mesh(
    r: &mut Reader<'_>,
    version: u32,
    nr_materials: usize,
) -> Result<Option<PolMesh>, ParseError> {
    match r.u32()? {
        0 => return Ok(None),
        1 => {}
        other => return Err(r.invalid(format!("unknown mesh slot marker {other}"))),
    }
    let name = r.cstring()?;
    let material = r.u32()? as usize;
    if material >= nr_materials {
        return Err(r.invalid(format!(
            "mesh {name} references material {material} of {nr_materials}"
        )));
    }

    let nr_vertices = r.count(16)?;
    let mut vertices = Vec::with_capacity(nr_vertices);
    for _ in 0..nr_vertices {
        let position = r.position3()?;
        let nr_weights = r.count(8)?;
        let mut weights = Vec::with_capacity(nr_weights);
        for _ in 0..nr_weights {
            weights.push(BoneWeight {
                bone_id: r.i32()?,
                weight: r.f32()?,
            });
        }
        vertices.push(PolVertex { position, weights });
    }

    let nr_uvs = r.count(8)?;
    let mut uvs = Vec::with_capacity(nr_uvs);
    for _ in 0..nr_uvs {
        uvs.push(r.vec2()?);
    }

    let mut light_uvs = Vec::new();
    if version == 2 {
        let nr_light_uvs = r.count(8)?;
        light_uvs.reserve(nr_light_uvs);
        for _ in 0..nr_light_uvs {
            light_uvs.push(r.vec2()?);
        }
    }

    let corner_size = if light_uvs.is_empty() { 40 } else { 52 };
    let nr_triangles = r.count(corner_size)?;
    let mut triangles = Vec::with_capacity(nr_triangles);
    for _ in 0..nr_triangles {
        let verts = read_indices(r)?;
        let tri_uvs = read_indices(r)?;
        let tri_light_uvs = if light_uvs.is_empty() {
            None
        } else {
            Some(read_indices(r)?)
        };
        let normal = r.direction3()?;
        let material_group = r.u32()?;

        check_indices(r, &name, "vertex", &verts, vertices.len())?;
        check_indices(r, &name, "uv", &tri_uvs, uvs.len())?;
        if let Some(indices) = &tri_light_uvs {
            check_indices(r, &name, "light uv", indices, light_uvs.len())?;
        }

        // The Z flip mirrors the geometry, so corners are swapped to keep
        // counter-clockwise front faces.
        triangles.push(PolTriangle {
            vertices: [verts[0], verts[2], verts[1]],
            uvs: [tri_uvs[0], tri_uvs[2], tri_uvs[1]],
            light_uvs: tri_light_uvs.map(|l| [l[0], l[2], l[1]]),
            normal,
            material_group,
        });
    }

    Ok(Some(PolMesh {
        flags: MeshFlags::from_mesh_name(&name),
        name,
        material,
        vertices,
        uvs,
        light_uvs,
        triangles,
    }))
}

fn read_indices(r: &mut Reader<'_>) -> Result<[u32; 3], ParseError> {
    Ok([r.u32()?, r.u32()?, r.u32()?])
}

fn check_indices(
    r: &Reader<'_>,
    mesh: &str,
    what: &str,
    indices: &[u32; 3],
    len: usize,
) -> Result<(), ParseError> {
    match indices.iter().find(|index| **index as usize >= len) {
        Some(bad) => Err(r.invalid(format!(
            "mesh {mesh}: {what} index {bad} out of range ({len})"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::testdata::{PolBuilder, TestBone, TestMesh};

    fn sample() -> PolBuilder {
        PolBuilder::new(1)
            .material("skin", &[("skin.png", 1)])
            .mesh(TestMesh::quad("body(NoLighting)[BothFace]", 0))
            .bone(TestBone::new("root", 10, -1, [0.0, 0.0, 0.0]))
            .bone(TestBone::new("arm", 11, 10, [0.0, 39.37, 0.0]))
    }

    #[test]
    fn parses_sample_file() {
        let pol = Pol::parse(&sample().build()).unwrap();
        assert_eq!(pol.version, 1);
        assert_eq!(pol.materials.len(), 1);
        assert_eq!(pol.materials[0].texture(TextureKind::Color), Some("skin.png"));
        assert_eq!(pol.meshes.len(), 1);
        let mesh = &pol.meshes[0];
        assert!(mesh.flags.contains(MeshFlags::NO_LIGHTING));
        assert!(mesh.flags.contains(MeshFlags::BOTH_FACE));
        assert!(!mesh.flags.contains(MeshFlags::ENV_MAP));
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.triangles.len(), 2);
        assert_eq!(pol.bones.len(), 2);
        assert_eq!(pol.bones[0].parent_id, None);
        assert_eq!(pol.bones[1].parent_id, Some(10));
        assert!((pol.bones[1].position.y - 1.0).abs() < 1e-3);
    }

    #[test]
    fn mesh_flag_tokens_are_case_insensitive() {
        let flags = MeshFlags::from_mesh_name("leaf(sprite)(NOMAKESHADOW)[EnvMap]");
        assert!(flags.contains(MeshFlags::SPRITE));
        assert!(flags.contains(MeshFlags::NO_MAKE_SHADOW));
        assert!(flags.contains(MeshFlags::ENV_MAP));
        assert_eq!(MeshFlags::from_mesh_name("plain"), MeshFlags::NONE);
        assert_eq!(MeshFlags::from_mesh_name("broken(NoLighting"), MeshFlags::NONE);
    }

    #[test]
    fn triangle_winding_is_reversed() {
        let pol = Pol::parse(&sample().build()).unwrap();
        assert_eq!(pol.meshes[0].triangles[0].vertices, [0, 2, 1]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = sample().build();
        data[0] = b'X';
        assert!(matches!(Pol::parse(&data), Err(ParseError::BadMagic { .. })));
    }

    #[test]
    fn rejects_unsupported_version() {
        let data = PolBuilder::new(3).build();
        assert!(matches!(
            Pol::parse(&data),
            Err(ParseError::UnsupportedVersion { version: 3, .. })
        ));
    }

    #[test]
    fn rejects_truncated_file() {
        let data = sample().build();
        let cut = &data[..data.len() - 6];
        assert!(matches!(Pol::parse(cut), Err(ParseError::Truncated { .. })));
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let mut data = sample().build();
        data.extend_from_slice(b"garbage");
        assert!(Pol::parse(&data).is_ok());
    }

    #[test]
    fn unknown_texture_tags_are_dropped() {
        let data = PolBuilder::new(1)
            .material("m", &[("a.png", 1), ("b.png", 42)])
            .build();
        let pol = Pol::parse(&data).unwrap();
        assert_eq!(pol.materials[0].textures.len(), 1);
    }

    #[test]
    fn rejects_out_of_range_material() {
        let data = PolBuilder::new(1).mesh(TestMesh::quad("m", 0)).build();
        assert!(matches!(Pol::parse(&data), Err(ParseError::Invalid { .. })));
    }

    #[test]
    fn version_two_reads_light_uvs() {
        let data = PolBuilder::new(2)
            .material("m", &[])
            .mesh(TestMesh::quad("m", 0).with_light_uvs())
            .build();
        let pol = Pol::parse(&data).unwrap();
        assert_eq!(pol.meshes[0].light_uvs.len(), 4);
        assert!(pol.meshes[0].triangles[0].light_uvs.is_some());
    }

    #[test]
    fn sub_materials_are_kept_under_parent() {
        let data = PolBuilder::new(1)
            .material_with_children("parent", &[("p.png", 1)], &[("child", "c.png")])
            .build();
        let pol = Pol::parse(&data).unwrap();
        assert_eq!(pol.materials[0].children.len(), 1);
        assert_eq!(pol.materials[0].children[0].texture(TextureKind::Color), Some("c.png"));
    }
}
