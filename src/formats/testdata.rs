//! Writers producing small POL/MOT/AMT buffers for unit tests.

/// One meter expressed in file units.
pub const METER: f32 = 1.0 / super::INCHES_TO_METERS;

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

pub struct TestMesh {
    name: String,
    material: u32,
    height: f32,
    size: f32,
    weights: Vec<(i32, f32)>,
    light_uvs: bool,
    group: u32,
}

impl TestMesh {
    /// A one-meter square in the XZ plane made of two triangles.
    pub fn quad(name: &str, material: u32) -> Self {
        Self {
            name: name.to_string(),
            material,
            height: 0.0,
            size: METER,
            weights: Vec::new(),
            light_uvs: false,
            group: 0,
        }
    }

    /// Height in meters.
    pub fn at_height(mut self, meters: f32) -> Self {
        self.height = meters * METER;
        self
    }

    /// Side length in meters.
    pub fn sized(mut self, meters: f32) -> Self {
        self.size = meters * METER;
        self
    }

    pub fn weighted(mut self, weights: &[(i32, f32)]) -> Self {
        self.weights = weights.to_vec();
        self
    }

    pub fn with_light_uvs(mut self) -> Self {
        self.light_uvs = true;
        self
    }

    pub fn group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    fn write(&self, out: &mut Vec<u8>, version: u32) {
        put_u32(out, 1);
        put_str(out, &self.name);
        put_u32(out, self.material);
        let s = self.size;
        let corners = [[0.0, 0.0], [s, 0.0], [s, s], [0.0, s]];
        put_u32(out, 4);
        for [x, z] in corners {
            put_f32(out, x);
            put_f32(out, self.height);
            put_f32(out, z);
            put_u32(out, self.weights.len() as u32);
            for (id, weight) in &self.weights {
                put_i32(out, *id);
                put_f32(out, *weight);
            }
        }
        put_u32(out, 4);
        for [u, v] in [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]] {
            put_f32(out, u);
            put_f32(out, v);
        }
        let light = version == 2 && self.light_uvs;
        if version == 2 {
            put_u32(out, if light { 4 } else { 0 });
            if light {
                for [u, v] in [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]] {
                    put_f32(out, u);
                    put_f32(out, v);
                }
            }
        }
        put_u32(out, 2);
        for tri in [[0u32, 1, 2], [0, 2, 3]] {
            for index in tri {
                put_u32(out, index);
            }
            for index in tri {
                put_u32(out, index);
            }
            if light {
                for index in tri {
                    put_u32(out, index);
                }
            }
            put_f32(out, 0.0);
            put_f32(out, 1.0);
            put_f32(out, 0.0);
            put_u32(out, self.group);
        }
    }
}

pub struct TestBone {
    name: String,
    id: i32,
    parent: i32,
    position: [f32; 3],
}

impl TestBone {
    /// Position is given in file units (inches).
    pub fn new(name: &str, id: i32, parent: i32, position: [f32; 3]) -> Self {
        Self {
            name: name.to_string(),
            id,
            parent,
            position,
        }
    }
}

struct TestMaterial {
    name: String,
    textures: Vec<(String, u32)>,
    children: Vec<(String, String)>,
}

pub struct PolBuilder {
    version: u32,
    materials: Vec<TestMaterial>,
    meshes: Vec<TestMesh>,
    bones: Vec<TestBone>,
}

impl PolBuilder {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            materials: Vec::new(),
            meshes: Vec::new(),
            bones: Vec::new(),
        }
    }

    pub fn material(mut self, name: &str, textures: &[(&str, u32)]) -> Self {
        self.materials.push(TestMaterial {
            name: name.to_string(),
            textures: textures
                .iter()
                .map(|(file, tag)| (file.to_string(), *tag))
                .collect(),
            children: Vec::new(),
        });
        self
    }

    pub fn material_with_children(
        mut self,
        name: &str,
        textures: &[(&str, u32)],
        children: &[(&str, &str)],
    ) -> Self {
        self = self.material(name, textures);
        if let Some(material) = self.materials.last_mut() {
            material.children = children
                .iter()
                .map(|(name, file)| (name.to_string(), file.to_string()))
                .collect();
        }
        self
    }

    pub fn mesh(mut self, mesh: TestMesh) -> Self {
        self.meshes.push(mesh);
        self
    }

    pub fn bone(mut self, bone: TestBone) -> Self {
        self.bones.push(bone);
        self
    }

    /// A chain of `count` bones one meter apart along +Y.
    pub fn bone_chain(mut self, count: usize) -> Self {
        for i in 0..count {
            let parent = if i == 0 { -1 } else { i as i32 - 1 };
            let y = if i == 0 { 0.0 } else { METER };
            self.bones
                .push(TestBone::new(&format!("bone{i}"), i as i32, parent, [0.0, y, 0.0]));
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"POL\0");
        put_u32(&mut out, self.version);
        put_u32(&mut out, self.materials.len() as u32);
        for material in &self.materials {
            put_str(&mut out, &material.name);
            put_u32(&mut out, material.textures.len() as u32);
            for (file, tag) in &material.textures {
                put_str(&mut out, file);
                put_u32(&mut out, *tag);
            }
            put_u32(&mut out, material.children.len() as u32);
            for (name, file) in &material.children {
                put_str(&mut out, name);
                put_u32(&mut out, 1);
                put_str(&mut out, file);
                put_u32(&mut out, 1);
                put_u32(&mut out, 0);
            }
        }
        put_u32(&mut out, self.meshes.len() as u32);
        for mesh in &self.meshes {
            mesh.write(&mut out, self.version);
        }
        put_u32(&mut out, self.bones.len() as u32);
        for bone in &self.bones {
            put_str(&mut out, &bone.name);
            put_i32(&mut out, bone.id);
            put_i32(&mut out, bone.parent);
            for value in bone.position {
                put_f32(&mut out, value);
            }
            // identity rotation, w first
            for value in [1.0, 0.0, 0.0, 0.0] {
                put_f32(&mut out, value);
            }
        }
        out
    }
}

pub struct MotBuilder {
    nr_frames: u32,
    bones: Vec<(String, i32, i32, Vec<[f32; 7]>)>,
}

impl MotBuilder {
    pub fn new(nr_frames: u32) -> Self {
        Self {
            nr_frames,
            bones: Vec::new(),
        }
    }

    /// Adds a bone whose frame `f` is produced by `frame(f)` as
    /// `[x, y, z, w, qx, qy, qz]` in file units.
    pub fn bone(
        mut self,
        name: &str,
        id: i32,
        parent: i32,
        frame: impl Fn(u32) -> [f32; 7],
    ) -> Self {
        let frames = (0..self.nr_frames).map(frame).collect();
        self.bones.push((name.to_string(), id, parent, frames));
        self
    }

    /// Bones matching [`PolBuilder::bone_chain`] resting in bind pose.
    pub fn rest_chain(mut self, count: usize) -> Self {
        for i in 0..count {
            let parent = if i == 0 { -1 } else { i as i32 - 1 };
            let y = if i == 0 { 0.0 } else { METER };
            self = self.bone(&format!("bone{i}"), i as i32, parent, move |_| {
                [0.0, y, 0.0, 1.0, 0.0, 0.0, 0.0]
            });
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"MOT\0");
        put_u32(&mut out, 0);
        put_u32(&mut out, self.nr_frames);
        put_u32(&mut out, self.bones.len() as u32);
        for (name, id, parent, frames) in &self.bones {
            put_str(&mut out, name);
            put_i32(&mut out, *id);
            put_i32(&mut out, *parent);
            for frame in frames {
                for value in frame {
                    put_f32(&mut out, *value);
                }
                out.extend_from_slice(&[0xAB; 16]);
            }
        }
        out
    }
}

pub struct AmtBuilder {
    version: u32,
    materials: Vec<(String, Vec<f32>)>,
}

impl AmtBuilder {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            materials: Vec::new(),
        }
    }

    /// `values` must hold exactly the float count of the builder's version.
    pub fn material(mut self, name: &str, values: &[f32]) -> Self {
        self.materials.push((name.to_string(), values.to_vec()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"AMT\0");
        put_u32(&mut out, self.version);
        put_u32(&mut out, self.materials.len() as u32);
        for (name, values) in &self.materials {
            put_str(&mut out, name);
            for value in values {
                put_f32(&mut out, *value);
            }
        }
        out
    }
}
