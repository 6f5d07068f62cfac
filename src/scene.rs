//! XML scene descriptions used by the viewer.
//!
//! ```xml
//! <scene>
//!   <settings><capacity>64</capacity><shadow>true</shadow></settings>
//!   <camera><position>0 1.5 5</position><yaw>180</yaw></camera>
//!   <instance>
//!     <name>hero</name>
//!     <kind>skinned</kind>
//!     <model>chara/hero.pol</model>
//!     <motion>idle</motion>
//!   </instance>
//! </scene>
//! ```

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use glam::{Vec2, Vec3};
use log::debug;
use roxmltree::{Document, Node};

use crate::engine::{EngineConfig, ReignEngine};
use crate::instance::{DrawFlags, InstanceId, InstanceKind, Light};
use crate::render::{Camera, EdgeMode, RenderOptions};

/// Parsed scene file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Scene {
    pub config: EngineConfig,
    pub options: RenderOptions,
    pub camera: Camera,
    pub instances: Vec<SceneInstance>,
    pub backgrounds: Vec<SceneBackground>,
}

/// One `<instance>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneInstance {
    pub name: String,
    pub kind: InstanceKind,
    pub model: Option<String>,
    pub motion: Option<String>,
    pub next_motion: Option<String>,
    /// Blend rate towards the next motion.
    pub blend: Option<f32>,
    pub effect: Option<String>,
    /// Names of the instances an effect is aimed at.
    pub targets: Vec<String>,
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
    pub alpha: f32,
    pub diffuse: Vec3,
    pub ambient: Option<Vec3>,
    pub draw: DrawFlags,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneBackground {
    pub layer: usize,
    pub image: u32,
    pub position: Vec2,
    pub scale: Vec2,
    pub blend_rate: f32,
}

impl Scene {
    pub fn from_xml(xml: &str) -> Result<Self> {
        let document = Document::parse(xml).context("invalid scene XML")?;
        let root = document.root_element();
        let mut scene = Scene::default();

        if let Some(settings) = child(&root, "settings") {
            parse_settings(&settings, &mut scene.config, &mut scene.options)?;
        }
        if let Some(camera) = child(&root, "camera") {
            scene.camera = parse_camera(&camera)?;
        }
        for node in root.children().filter(|n| n.has_tag_name("instance")) {
            scene.instances.push(parse_instance(&node)?);
        }
        for node in root.children().filter(|n| n.has_tag_name("background")) {
            scene.backgrounds.push(SceneBackground {
                layer: parse_num(optional_text(&node, "layer"), 0)?,
                image: parse_num(Some(required_text(&node, "image")?), 0)?,
                position: parse_vec2(optional_text(&node, "position"), Vec2::ZERO)?,
                scale: parse_vec2(optional_text(&node, "scale"), Vec2::ONE)?,
                blend_rate: parse_num(optional_text(&node, "blend"), 1.0)?,
            });
        }
        Ok(scene)
    }

    /// Creates every instance on `engine` and returns their ids by name.
    pub fn instantiate(&self, engine: &mut ReignEngine) -> Result<BTreeMap<String, InstanceId>> {
        engine.camera = self.camera;
        engine.options = self.options;

        let mut ids = BTreeMap::new();
        for description in &self.instances {
            let id = engine
                .create_instance(description.kind.clone())
                .with_context(|| format!("failed to create instance {}", description.name))?;
            ids.insert(description.name.clone(), id);
            apply_instance(engine, id, description)
                .with_context(|| format!("failed to set up instance {}", description.name))?;
        }

        for description in self.instances.iter().filter(|d| !d.targets.is_empty()) {
            let targets = description
                .targets
                .iter()
                .map(|name| {
                    ids.get(name)
                        .copied()
                        .ok_or_else(|| anyhow!("{}: unknown target {name}", description.name))
                })
                .collect::<Result<Vec<_>>>()?;
            if let Some(&id) = ids.get(&description.name) {
                engine.set_effect_targets(id, targets)?;
            }
        }

        for background in &self.backgrounds {
            engine
                .set_background_image(background.layer, background.image)
                .with_context(|| format!("failed to load background image {}", background.image))?;
            if let Some(layer) = engine.background_mut(background.layer) {
                layer.position = background.position;
                layer.scale = background.scale;
                layer.blend_rate = background.blend_rate.clamp(0.0, 1.0);
                layer.visible = true;
            }
        }
        debug!("scene created {} instances", ids.len());
        Ok(ids)
    }
}

fn apply_instance(engine: &mut ReignEngine, id: InstanceId, description: &SceneInstance) -> Result<()> {
    engine.set_position(id, description.position)?;
    engine.set_rotation(id, description.rotation)?;
    engine.set_scale(id, description.scale)?;
    engine.set_alpha(id, description.alpha)?;
    engine.set_diffuse(id, description.diffuse)?;
    if let Some(ambient) = description.ambient {
        engine.set_ambient(id, ambient)?;
    }
    engine.set_draw_flags(id, description.draw)?;

    if let Some(model) = &description.model {
        engine.load_model(id, model)?;
    }
    if let Some(motion) = &description.motion {
        engine.load_motion(id, motion)?;
    }
    if let Some(next) = &description.next_motion {
        engine.load_next_motion(id, next)?;
        engine.set_motion_blend(id, true, description.blend.unwrap_or(0.5))?;
    }
    if let Some(effect) = &description.effect {
        engine.load_effect(id, effect)?;
    }
    Ok(())
}

fn parse_settings(node: &Node<'_, '_>, config: &mut EngineConfig, options: &mut RenderOptions) -> Result<()> {
    config.capacity = parse_num(optional_text(node, "capacity"), config.capacity)?;
    config.frames_per_second = parse_num(optional_text(node, "fps"), config.frames_per_second)?;
    config.shadow_map_size = parse_num(optional_text(node, "shadow_map_size"), config.shadow_map_size)?;
    config.height_map_size = parse_num(optional_text(node, "height_map_size"), config.height_map_size)?;
    config.seed = parse_num(optional_text(node, "seed"), config.seed)?;

    options.shadow = parse_bool(optional_text(node, "shadow"), options.shadow)?;
    options.fog = parse_bool(optional_text(node, "fog"), options.fog)?;
    options.bump = parse_bool(optional_text(node, "bump"), options.bump)?;
    options.specular = parse_bool(optional_text(node, "specular"), options.specular)?;
    options.light_map = parse_bool(optional_text(node, "light_map"), options.light_map)?;
    options.ssao = parse_bool(optional_text(node, "ssao"), options.ssao)?;
    options.bloom = parse_bool(optional_text(node, "bloom"), options.bloom)?;
    options.glare = parse_bool(optional_text(node, "glare"), options.glare)?;
    if let Some(mode) = optional_text(node, "edge") {
        options.edge_mode = parse_edge_mode(&mode)?;
    }
    options.edge_width = parse_num(optional_text(node, "edge_width"), options.edge_width)?;
    options.edge_color = parse_color(optional_text(node, "edge_color"), options.edge_color)?;
    options.fog_near = parse_num(optional_text(node, "fog_near"), options.fog_near)?;
    options.fog_far = parse_num(optional_text(node, "fog_far"), options.fog_far)?;
    options.fog_color = parse_color(optional_text(node, "fog_color"), options.fog_color)?;
    options.global_ambient = parse_color(optional_text(node, "ambient"), options.global_ambient)?;
    options.clear_color = parse_color(optional_text(node, "clear_color"), options.clear_color)?;
    Ok(())
}

fn parse_camera(node: &Node<'_, '_>) -> Result<Camera> {
    let defaults = Camera::default();
    Ok(Camera {
        position: parse_vec3(optional_text(node, "position"), defaults.position)?,
        pitch: parse_num(optional_text(node, "pitch"), defaults.pitch)?,
        yaw: parse_num(optional_text(node, "yaw"), defaults.yaw)?,
        roll: parse_num(optional_text(node, "roll"), defaults.roll)?,
        fov_y: parse_num(optional_text(node, "fov"), defaults.fov_y)?,
        near: parse_num(optional_text(node, "near"), defaults.near)?,
        far: parse_num(optional_text(node, "far"), defaults.far)?,
        ..defaults
    })
}

fn parse_instance(node: &Node<'_, '_>) -> Result<SceneInstance> {
    let name = required_text(node, "name")?;
    let kind_name = optional_text(node, "kind").unwrap_or_else(|| "mesh".to_string());
    let mut kind = InstanceKind::from_name(&kind_name)
        .ok_or_else(|| anyhow!("{name}: unknown instance kind {kind_name}"))?;
    match &mut kind {
        InstanceKind::DirectionalLight(light) | InstanceKind::SpecularLight(light) => {
            *light = parse_light(node, *light)?;
        }
        InstanceKind::PathLine(points) => {
            *points = parse_points(optional_text(node, "points"))
                .with_context(|| format!("{name}: invalid path points"))?;
        }
        _ => {}
    }

    let defaults = DrawFlags::default();
    let draw = DrawFlags {
        visible: parse_bool(optional_text(node, "visible"), defaults.visible)?,
        cast_shadow: parse_bool(optional_text(node, "cast_shadow"), defaults.cast_shadow)?,
        lighting: parse_bool(optional_text(node, "lighting"), defaults.lighting)?,
        fog: parse_bool(optional_text(node, "fog"), defaults.fog)?,
        outline: parse_bool(optional_text(node, "outline"), defaults.outline)?,
        character: parse_bool(
            optional_text(node, "character"),
            matches!(kind, InstanceKind::SkinnedMesh),
        )?,
    };

    Ok(SceneInstance {
        kind,
        model: optional_text(node, "model"),
        motion: optional_text(node, "motion"),
        next_motion: optional_text(node, "next_motion"),
        blend: optional_text(node, "blend")
            .map(|value| parse_num(Some(value), 0.5))
            .transpose()?,
        effect: optional_text(node, "effect"),
        targets: optional_text(node, "targets")
            .map(|value| {
                value
                    .split([',', ' '])
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        position: parse_vec3(optional_text(node, "position"), Vec3::ZERO)?,
        rotation: parse_vec3(optional_text(node, "rotation"), Vec3::ZERO)?,
        scale: parse_vec3(optional_text(node, "scale"), Vec3::ONE)?,
        alpha: parse_num(optional_text(node, "alpha"), 1.0)?,
        diffuse: parse_color(optional_text(node, "diffuse"), Vec3::ONE)?,
        ambient: optional_text(node, "ambient")
            .map(|value| parse_color(Some(value), Vec3::ZERO))
            .transpose()?,
        draw,
        name,
    })
}

fn parse_light(node: &Node<'_, '_>, default: Light) -> Result<Light> {
    let direction = parse_vec3(optional_text(node, "direction"), default.direction)?;
    if direction.length_squared() <= f32::EPSILON {
        return Err(anyhow!("light direction must not be zero"));
    }
    Ok(Light {
        direction: direction.normalize(),
        color: parse_color(optional_text(node, "color"), default.color)?,
    })
}

fn parse_edge_mode(value: &str) -> Result<EdgeMode> {
    match value.to_ascii_lowercase().as_str() {
        "none" | "off" => Ok(EdgeMode::None),
        "characters" | "characters_only" => Ok(EdgeMode::CharactersOnly),
        "all" | "on" => Ok(EdgeMode::All),
        other => Err(anyhow!("unknown edge mode {other}")),
    }
}

fn child<'a, 'input>(node: &Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|child| child.has_tag_name(tag))
}

fn required_text(node: &Node<'_, '_>, tag: &str) -> Result<String> {
    optional_text(node, tag).ok_or_else(|| anyhow!("<{tag}> tag is missing"))
}

fn optional_text(node: &Node<'_, '_>, tag: &str) -> Option<String> {
    child(node, tag)
        .and_then(|child| child.text())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(|text| text.to_string())
}

fn components(value: &str) -> Result<Vec<f32>> {
    value
        .split_whitespace()
        .map(|component| {
            component
                .parse::<f32>()
                .map_err(|err| anyhow!("invalid number {component}: {err}"))
        })
        .collect()
}

fn parse_vec3(value: Option<String>, default: Vec3) -> Result<Vec3> {
    let Some(value) = value else {
        return Ok(default);
    };
    match components(&value)?.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(anyhow!("expected three components in {value:?}")),
    }
}

fn parse_vec2(value: Option<String>, default: Vec2) -> Result<Vec2> {
    let Some(value) = value else {
        return Ok(default);
    };
    match components(&value)?.as_slice() {
        [x, y] => Ok(Vec2::new(*x, *y)),
        _ => Err(anyhow!("expected two components in {value:?}")),
    }
}

/// Colours are written as 0..255 triples.
fn parse_color(value: Option<String>, default: Vec3) -> Result<Vec3> {
    Ok(parse_vec3(value, default * 255.0)? / 255.0)
}

fn parse_points(value: Option<String>) -> Result<Vec<Vec3>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    value
        .split(';')
        .map(str::trim)
        .filter(|point| !point.is_empty())
        .map(|point| parse_vec3(Some(point.to_string()), Vec3::ZERO))
        .collect()
}

fn parse_num<T>(value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(value) => value
            .parse::<T>()
            .map_err(|err| anyhow!("failed to parse {value:?}: {err}")),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<String>, default: bool) -> Result<bool> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(anyhow!("expected a boolean, found {other}")),
    }
}
