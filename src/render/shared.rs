//! GPU-side data layouts and the WGSL source shared by every pass.

use bytemuck::{Pod, Zeroable};

/// Bones addressable by the skinning shader.
pub const MAX_GPU_BONES: usize = crate::assets::MAX_BONES;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameUniform {
    pub view_proj: [[f32; 4]; 4],
    pub light_view_proj: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    pub light_direction: [f32; 4],
    pub light_color: [f32; 4],
    /// rgb specular light colour, w specular switch.
    pub specular_color: [f32; 4],
    /// rgb fog colour, w fog switch.
    pub fog_color: [f32; 4],
    /// fog near, fog far, shadow switch, edge width.
    pub fog_range: [f32; 4],
    /// rgb global ambient, w light-map switch.
    pub ambient: [f32; 4],
    pub edge_color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ObjectUniform {
    pub model: [[f32; 4]; 4],
    pub normal: [[f32; 4]; 3],
    /// rgb diffuse, w alpha.
    pub diffuse: [f32; 4],
    /// rgb ambient, w lighting switch.
    pub ambient: [f32; 4],
    /// specular strength, shininess, shadow darkness, rim exponent.
    pub material: [f32; 4],
    /// rgb rim colour, w fog switch.
    pub rim_color: [f32; 4],
    /// skinned, light map present, height range min, height range max.
    pub params: [f32; 4],
}

/// Byte size of the per-draw bone buffer: three rows per bone.
pub const BONE_BUFFER_SIZE: u64 = (MAX_GPU_BONES * 3 * 16) as u64;

pub(crate) const SHADER: &str = r#"
struct FrameUniform {
    view_proj: mat4x4<f32>,
    light_view_proj: mat4x4<f32>,
    camera_position: vec4<f32>,
    light_direction: vec4<f32>,
    light_color: vec4<f32>,
    specular_color: vec4<f32>,
    fog_color: vec4<f32>,
    fog_range: vec4<f32>,
    ambient: vec4<f32>,
    edge_color: vec4<f32>,
}

struct ObjectUniform {
    model: mat4x4<f32>,
    normal: mat3x4<f32>,
    diffuse: vec4<f32>,
    ambient: vec4<f32>,
    material: vec4<f32>,
    rim_color: vec4<f32>,
    params: vec4<f32>,
}

struct BoneUniform {
    rows: array<vec4<f32>, 384>,
}

@group(0) @binding(0)
var<uniform> globals: FrameUniform;

@group(1) @binding(0)
var<uniform> object: ObjectUniform;
@group(1) @binding(1)
var<uniform> bones: BoneUniform;

@group(2) @binding(0)
var color_map: texture_2d<f32>;
@group(2) @binding(1)
var light_map: texture_2d<f32>;
@group(2) @binding(2)
var specular_map: texture_2d<f32>;
@group(2) @binding(3)
var material_sampler: sampler;

@group(3) @binding(0)
var shadow_map: texture_depth_2d;
@group(3) @binding(1)
var shadow_sampler: sampler_comparison;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) light_uv: vec2<f32>,
    @location(4) bone_index: vec4<u32>,
    @location(5) bone_weight: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) world_pos: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) light_uv: vec2<f32>,
    @location(4) shadow_pos: vec4<f32>,
}

fn bone_transform(index: u32, p: vec4<f32>) -> vec3<f32> {
    let base = index * 3u;
    return vec3<f32>(
        dot(bones.rows[base], p),
        dot(bones.rows[base + 1u], p),
        dot(bones.rows[base + 2u], p),
    );
}

fn skin(value: vec3<f32>, w: f32, input: VertexInput) -> vec3<f32> {
    let weights = input.bone_weight;
    let total = weights.x + weights.y + weights.z + weights.w;
    if (object.params.x < 0.5 || total <= 0.0) {
        return value;
    }
    let p = vec4<f32>(value, w);
    return weights.x * bone_transform(input.bone_index.x, p)
        + weights.y * bone_transform(input.bone_index.y, p)
        + weights.z * bone_transform(input.bone_index.z, p)
        + weights.w * bone_transform(input.bone_index.w, p);
}

fn world_normal(normal: vec3<f32>) -> vec3<f32> {
    let matrix = mat3x3<f32>(
        object.normal[0].xyz,
        object.normal[1].xyz,
        object.normal[2].xyz
    );
    return normalize(matrix * normal);
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let world = object.model * vec4<f32>(skin(input.position, 1.0, input), 1.0);
    out.position = globals.view_proj * world;
    out.world_pos = world.xyz;
    out.normal = world_normal(skin(input.normal, 0.0, input));
    out.uv = input.uv;
    out.light_uv = input.light_uv;
    out.shadow_pos = globals.light_view_proj * world;
    return out;
}

fn shadow_factor(shadow_pos: vec4<f32>) -> f32 {
    let ndc = shadow_pos.xyz / max(shadow_pos.w, 1e-5);
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, -ndc.y * 0.5 + 0.5);
    let lit = textureSampleCompareLevel(shadow_map, shadow_sampler, uv, ndc.z - 0.002);
    let inside = all(uv >= vec2<f32>(0.0)) && all(uv <= vec2<f32>(1.0)) && ndc.z <= 1.0;
    return select(1.0, lit, inside && globals.fog_range.z > 0.5);
}

fn apply_fog(color: vec3<f32>, world_pos: vec3<f32>) -> vec3<f32> {
    if (globals.fog_color.w < 0.5 || object.rim_color.w < 0.5) {
        return color;
    }
    let eye_distance = length(world_pos - globals.camera_position.xyz);
    let span = max(globals.fog_range.y - globals.fog_range.x, 1e-3);
    let amount = clamp((eye_distance - globals.fog_range.x) / span, 0.0, 1.0);
    return mix(color, globals.fog_color.rgb, amount);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let base = textureSample(color_map, material_sampler, input.uv);
    let baked = textureSample(light_map, material_sampler, input.light_uv).rgb;
    let specular_mask = textureSample(specular_map, material_sampler, input.uv).r;
    let shadow = shadow_factor(input.shadow_pos);

    var color = base.rgb * object.diffuse.rgb;
    if (object.ambient.w > 0.5) {
        let normal = normalize(input.normal);
        let to_light = normalize(-globals.light_direction.xyz);
        let to_eye = normalize(globals.camera_position.xyz - input.world_pos);
        let lambert = max(dot(normal, to_light), 0.0);
        let darkness = object.material.z;
        let direct = globals.light_color.rgb * lambert * mix(1.0 - darkness, 1.0, shadow);
        color = color * (object.ambient.rgb + globals.ambient.rgb + direct);

        if (globals.specular_color.w > 0.5 && object.material.x > 0.0) {
            let half_vector = normalize(to_light + to_eye);
            let highlight = pow(max(dot(normal, half_vector), 0.0), max(object.material.y, 1.0));
            color += globals.specular_color.rgb * highlight * object.material.x * specular_mask * shadow;
        }
        if (object.material.w > 0.0) {
            let rim = pow(1.0 - max(dot(normal, to_eye), 0.0), object.material.w);
            color += object.rim_color.rgb * rim;
        }
    }
    if (object.params.y > 0.5 && globals.ambient.w > 0.5) {
        color = color * baked;
    }
    return vec4<f32>(apply_fog(color, input.world_pos), base.a * object.diffuse.a);
}

@vertex
fn vs_shadow(input: VertexInput) -> @builtin(position) vec4<f32> {
    let world = object.model * vec4<f32>(skin(input.position, 1.0, input), 1.0);
    return globals.light_view_proj * world;
}

@vertex
fn vs_outline(input: VertexInput) -> @builtin(position) vec4<f32> {
    let normal = world_normal(skin(input.normal, 0.0, input));
    let world = object.model * vec4<f32>(skin(input.position, 1.0, input), 1.0);
    return globals.view_proj * vec4<f32>(world.xyz + normal * globals.fog_range.w, 1.0);
}

@fragment
fn fs_outline() -> @location(0) vec4<f32> {
    return vec4<f32>(globals.edge_color.rgb, object.diffuse.a);
}

struct SpriteOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_sprite(input: VertexInput) -> SpriteOutput {
    var out: SpriteOutput;
    out.position = globals.view_proj * object.model * vec4<f32>(input.position, 1.0);
    out.uv = input.uv;
    return out;
}

@vertex
fn vs_background(input: VertexInput) -> SpriteOutput {
    var out: SpriteOutput;
    out.position = object.model * vec4<f32>(input.position, 1.0);
    out.uv = input.uv;
    return out;
}

@fragment
fn fs_sprite(input: SpriteOutput) -> @location(0) vec4<f32> {
    let texel = textureSample(color_map, material_sampler, input.uv);
    return texel * object.diffuse;
}

@vertex
fn vs_line(input: VertexInput) -> @builtin(position) vec4<f32> {
    return globals.view_proj * object.model * vec4<f32>(input.position, 1.0);
}

@fragment
fn fs_line() -> @location(0) vec4<f32> {
    return object.diffuse;
}

struct HeightOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) height: f32,
}

@vertex
fn vs_height(input: VertexInput) -> HeightOutput {
    var out: HeightOutput;
    let world = object.model * vec4<f32>(skin(input.position, 1.0, input), 1.0);
    out.position = globals.view_proj * world;
    out.height = world.y;
    return out;
}

@fragment
fn fs_height(input: HeightOutput) -> @location(0) vec4<u32> {
    let range = max(object.params.w - object.params.z, 1e-6);
    let t = clamp((input.height - object.params.z) / range, 0.0, 1.0);
    return vec4<u32>(1u + u32(round(t * 65534.0)), 0u, 0u, 0u);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_sizes_match_the_shader_layout() {
        assert_eq!(std::mem::size_of::<FrameUniform>(), 272);
        assert_eq!(std::mem::size_of::<ObjectUniform>(), 192);
        assert_eq!(BONE_BUFFER_SIZE, 384 * 16);
    }

    #[test]
    fn shader_declares_every_entry_point() {
        for entry in [
            "fn vs_main",
            "fn fs_main",
            "fn vs_shadow",
            "fn vs_outline",
            "fn vs_sprite",
            "fn vs_background",
            "fn vs_line",
            "fn vs_height",
            "fn fs_height",
        ] {
            assert!(SHADER.contains(entry), "missing {entry}");
        }
    }
}
