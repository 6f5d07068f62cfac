use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytemuck::bytes_of;
use glam::{EulerRot, Mat3, Mat4, Quat, Vec2, Vec3};
use log::{debug, info, warn};
use wgpu::util::DeviceExt;

use super::camera::{front_face, Camera};
use super::frame::{height_view_projection, shadow_view_projection, DrawList, HeightMap};
use super::shared::{FrameUniform, ObjectUniform, BONE_BUFFER_SIZE, MAX_GPU_BONES, SHADER};
use super::target::RenderTarget;
use crate::assets::{Model, ModelId, Texture, TextureId, Vertex};
use crate::engine::{BackgroundLayer, EngineConfig, ReignEngine};
use crate::formats::MeshFlags;
use crate::geometry::BoundingSphere;
use crate::instance::{Instance, InstanceId, InstanceKind};
use crate::pae::{BlendType, ParticleType};
use crate::particle::{ParticleBlur, ParticleEffectState, ParticleSprite};

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const HEIGHT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R16Uint;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 6] = wgpu::vertex_attr_array![
    0 => Float32x3,
    1 => Float32x3,
    2 => Float32x2,
    3 => Float32x2,
    4 => Uint32x4,
    5 => Float32x4,
];

const ADDITIVE_BLENDING: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::SrcAlpha,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::Zero,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
};

/// Headless wgpu renderer that draws a [`ReignEngine`] scene into a
/// [`RenderTarget`].
pub struct Renderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    flip_y: bool,
    size: (u32, u32),
    color: ColorTexture,
    depth: DepthBuffer,
    shadow: ShadowMap,
    layouts: Layouts,
    pipelines: Pipelines,
    frame_buffer: wgpu::Buffer,
    frame_group: wgpu::BindGroup,
    shadow_group: wgpu::BindGroup,
    sampler: wgpu::Sampler,
    white: GpuTexture,
    white_material: wgpu::BindGroup,
    no_bones: wgpu::Buffer,
    quad: MeshBuffers,
    models: HashMap<ModelId, GpuModel>,
    textures: HashMap<TextureId, GpuTexture>,
    sprite_materials: HashMap<TextureId, wgpu::BindGroup>,
    height_map_size: u32,
}

impl Renderer {
    /// Creates a renderer on the first available adapter. With `flip_y`
    /// the image is produced bottom row first.
    pub async fn new(config: &EngineConfig, flip_y: bool) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: Default::default(),
            backend_options: Default::default(),
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("failed to acquire GPU adapter")?;
        info!("rendering on {}", adapter.get_info().name);

        let device_descriptor = wgpu::DeviceDescriptor {
            label: Some("reign-device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: Default::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
        };
        let (device, queue) = adapter
            .request_device(&device_descriptor)
            .await
            .context("failed to create GPU device")?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("reign-shader"),
            source: wgpu::ShaderSource::Wgsl(SHADER.into()),
        });

        let layouts = Layouts::create(&device);
        let pipelines = Pipelines::create(&device, &shader, &layouts, front_face(flip_y));

        let frame_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame-uniform"),
            size: std::mem::size_of::<FrameUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let frame_group = frame_bind_group(&device, &layouts.frame, &frame_buffer);

        let shadow_size = config.shadow_map_size.max(1);
        let shadow = ShadowMap::create(&device, shadow_size);
        let shadow_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("shadow-bind-group"),
            layout: &layouts.shadow,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&shadow.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&shadow.sampler),
                },
            ],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("material-sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let white = GpuTexture::upload(&device, &queue, &Texture::solid("white", [255; 4]));
        let white_material =
            material_bind_group(&device, &layouts.material, &sampler, [&white.view; 3], "white");
        let no_bones = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("no-bones"),
            size: BONE_BUFFER_SIZE,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        let quad = MeshBuffers::from_vertices(&device, &quad_vertices(), &[0, 1, 2, 0, 2, 3], "quad");
        let color = ColorTexture::create(&device, 1, 1);
        let depth = DepthBuffer::create(&device, 1, 1);

        Ok(Self {
            device,
            queue,
            flip_y,
            size: (1, 1),
            color,
            depth,
            shadow,
            layouts,
            pipelines,
            frame_buffer,
            frame_group,
            shadow_group,
            sampler,
            white,
            white_material,
            no_bones,
            quad,
            models: HashMap::new(),
            textures: HashMap::new(),
            sprite_materials: HashMap::new(),
            height_map_size: config.height_map_size.max(1),
        })
    }

    pub fn flip_y(&self) -> bool {
        self.flip_y
    }

    /// Number of models with GPU buffers.
    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    fn resize(&mut self, width: u32, height: u32) {
        if self.size == (width, height) {
            return;
        }
        debug!("resizing render targets to {width}x{height}");
        self.color = ColorTexture::create(&self.device, width, height);
        self.depth = DepthBuffer::create(&self.device, width, height);
        self.size = (width, height);
    }

    /// Renders one frame of `engine` and hands the pixels to `target`.
    pub fn render(&mut self, engine: &ReignEngine, target: &mut dyn RenderTarget) -> Result<()> {
        let (width, height) = target.size();
        if width == 0 || height == 0 {
            return Err(anyhow!("render target has zero area"));
        }
        self.resize(width, height);
        self.prepare(engine);

        let frame = self.frame_state(engine, width as f32 / height as f32);
        self.queue
            .write_buffer(&self.frame_buffer, 0, bytes_of(&frame.uniform));
        let plan = self.plan(engine, &frame);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame-encoder"),
            });

        if !plan.shadow.is_empty() {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("shadow-pass"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.shadow.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_bind_group(0, &self.frame_group, &[]);
            for draw in &plan.shadow {
                draw.record(&mut pass, &self.shadow_group);
            }
        }

        {
            let clear = engine.options.clear_color;
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("main-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.color.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: clear.x as f64,
                            g: clear.y as f64,
                            b: clear.z as f64,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_bind_group(0, &self.frame_group, &[]);
            for draw in plan
                .background
                .iter()
                .chain(&plan.opaque)
                .chain(&plan.transparent)
                .chain(&plan.outline)
            {
                draw.record(&mut pass, &self.shadow_group);
            }
        }

        let copy = self.copy_to_staging(&mut encoder, &self.color.texture, width, height, 4);
        self.queue.submit(std::iter::once(encoder.finish()));
        let pixels = self.finish_readback(copy, width, height, 4)?;
        let pixels = if self.flip_y != target.bottom_up() {
            reverse_rows(&pixels, width as usize * 4)
        } else {
            pixels
        };
        target.write_rgba(&pixels);
        target.mark_dirty();
        Ok(())
    }

    /// Uploads every model and texture the scene references.
    fn prepare(&mut self, engine: &ReignEngine) {
        for instance in engine.instances().iter() {
            if let Some(model) = instance.model() {
                self.ensure_model(model);
            }
            if let Some(effect) = instance.effect() {
                for texture in effect.effect.textures.values() {
                    self.ensure_sprite_material(texture);
                }
                for model in effect.effect.models.values() {
                    self.ensure_model(model);
                }
            }
        }
        for layer in engine.backgrounds() {
            if let (true, Some(texture)) = (layer.is_drawn(), layer.texture.as_ref()) {
                self.ensure_sprite_material(texture);
            }
        }
    }

    fn ensure_texture(&mut self, texture: Option<&Arc<Texture>>) {
        if let Some(texture) = texture {
            if !self.textures.contains_key(&texture.id) {
                let gpu = GpuTexture::upload(&self.device, &self.queue, texture);
                self.textures.insert(texture.id, gpu);
            }
        }
    }

    fn texture_view(&self, texture: Option<&Arc<Texture>>) -> &wgpu::TextureView {
        texture
            .and_then(|texture| self.textures.get(&texture.id))
            .map_or(&self.white.view, |gpu| &gpu.view)
    }

    fn ensure_sprite_material(&mut self, texture: &Arc<Texture>) {
        if self.sprite_materials.contains_key(&texture.id) {
            return;
        }
        self.ensure_texture(Some(texture));
        let view = self.texture_view(Some(texture));
        let group = material_bind_group(
            &self.device,
            &self.layouts.material,
            &self.sampler,
            [view, &self.white.view, &self.white.view],
            &texture.path,
        );
        self.sprite_materials.insert(texture.id, group);
    }

    fn ensure_model(&mut self, model: &Model) {
        if self.models.contains_key(&model.id) {
            return;
        }
        let mut meshes = Vec::with_capacity(model.meshes.len());
        for mesh in &model.meshes {
            let mut batches = Vec::with_capacity(mesh.batches.len());
            if let Some(parent) = model.materials.get(mesh.material) {
                for (index, batch) in mesh.batches.iter().enumerate() {
                    if batch.indices.is_empty() {
                        continue;
                    }
                    let material = parent.batch_material(batch.sub_material);
                    self.ensure_texture(material.color.as_ref());
                    self.ensure_texture(material.light_map.as_ref());
                    self.ensure_texture(material.specular_map.as_ref());
                    let label = format!("{}/{}#{index}", model.path, mesh.name);
                    let group = material_bind_group(
                        &self.device,
                        &self.layouts.material,
                        &self.sampler,
                        [
                            self.texture_view(material.color.as_ref()),
                            self.texture_view(material.light_map.as_ref()),
                            self.texture_view(material.specular_map.as_ref()),
                        ],
                        &label,
                    );
                    batches.push(GpuBatch {
                        buffers: MeshBuffers::from_vertices(
                            &self.device,
                            &batch.vertices,
                            &batch.indices,
                            &label,
                        ),
                        material: group,
                        params: [
                            material.specular_strength,
                            material.specular_shininess,
                            material.shadow_darkness,
                            material.rim_exponent,
                        ],
                        rim_color: material.rim_color,
                        has_light_map: material.light_map.is_some(),
                    });
                }
            }
            meshes.push(GpuMesh {
                flags: mesh.flags,
                transparent: mesh.transparent,
                casts_shadow: mesh.casts_shadow(),
                batches,
            });
        }
        debug!("uploaded model {} ({} meshes)", model.path, meshes.len());
        self.models.insert(model.id, GpuModel { meshes });
    }

    fn frame_state(&self, engine: &ReignEngine, aspect: f32) -> FrameState {
        let options = &engine.options;
        let camera = engine.camera;
        let light = engine
            .directional_light()
            .map(|(_, light)| light)
            .unwrap_or_default();
        let specular = engine.specular_light().map_or(light.color, |light| light.color);

        let shadow = if options.shadow {
            let casters: Vec<BoundingSphere> = engine
                .instances()
                .iter()
                .filter(|instance| {
                    instance.draw.visible && instance.draw.cast_shadow && instance.model().is_some()
                })
                .map(Instance::bounding_sphere)
                .collect();
            shadow_view_projection(&casters, light.direction)
        } else {
            None
        };

        let view_proj = camera.view_projection(aspect, self.flip_y);
        let switch = |on: bool| if on { 1.0 } else { 0.0 };
        let uniform = FrameUniform {
            view_proj: view_proj.to_cols_array_2d(),
            light_view_proj: shadow.unwrap_or(Mat4::IDENTITY).to_cols_array_2d(),
            camera_position: camera.position.extend(1.0).into(),
            light_direction: light.direction.extend(0.0).into(),
            light_color: light.color.extend(1.0).into(),
            specular_color: specular.extend(switch(options.specular)).into(),
            fog_color: options.fog_color.extend(switch(options.fog)).into(),
            fog_range: [
                options.fog_near,
                options.fog_far,
                switch(shadow.is_some()),
                options.edge_width,
            ],
            ambient: options.global_ambient.extend(switch(options.light_map)).into(),
            edge_color: options.edge_color.extend(1.0).into(),
        };
        FrameState {
            uniform,
            camera,
            shadow,
        }
    }

    fn plan<'a>(&'a self, engine: &'a ReignEngine, frame: &FrameState) -> Plan<'a> {
        let mut plan = Plan::default();
        let (width, height) = self.size;

        for layer in engine.backgrounds() {
            let Some(texture) = layer.texture.as_ref().filter(|_| layer.is_drawn()) else {
                continue;
            };
            let Some(material) = self.sprite_materials.get(&texture.id) else {
                continue;
            };
            let transform = background_transform(layer, texture, width, height, self.flip_y);
            let uniform = flat_uniform(transform, Vec3::ONE.extend(layer.blend_rate.min(1.0)));
            plan.background.push(DrawCall {
                pipeline: &self.pipelines.background,
                object: self.object_group(&uniform, None),
                material: Some(material),
                geometry: Geometry::Indexed(&self.quad),
            });
        }

        if frame.shadow.is_some() {
            for instance in engine.instances().iter() {
                if !instance.draw.visible || !instance.draw.cast_shadow {
                    continue;
                }
                let Some((model, gpu)) = self.gpu_model(instance) else {
                    continue;
                };
                let transform = instance_transform(instance, &frame.camera);
                for mesh in gpu.meshes.iter().filter(|mesh| mesh.casts_shadow && !mesh.transparent) {
                    for batch in &mesh.batches {
                        let uniform = self.mesh_uniform(instance, model, transform, mesh, batch);
                        plan.shadow.push(DrawCall {
                            pipeline: &self.pipelines.shadow,
                            object: self.object_group(&uniform, instance_bones(instance)),
                            material: None,
                            geometry: Geometry::Indexed(&batch.buffers),
                        });
                    }
                }
            }
        }

        let list = DrawList::from_instances(engine.instances(), &frame.camera);
        for item in &list.opaque {
            let Some(instance) = engine.instances().get(item.id) else {
                continue;
            };
            if let InstanceKind::PathLine(points) = instance.kind() {
                plan.opaque.push(self.path_line(instance, points));
                continue;
            }
            let Some((model, gpu)) = self.gpu_model(instance) else {
                continue;
            };
            let transform = instance_transform(instance, &frame.camera);
            let outline = engine.options.edge_mode.wants_outline(&instance.draw);
            for mesh in gpu.meshes.iter().filter(|mesh| !mesh.transparent) {
                let pipeline = if mesh.flags.contains(MeshFlags::BOTH_FACE) {
                    &self.pipelines.opaque_both
                } else {
                    &self.pipelines.opaque
                };
                for batch in &mesh.batches {
                    let uniform = self.mesh_uniform(instance, model, transform, mesh, batch);
                    let object = self.object_group(&uniform, instance_bones(instance));
                    if outline {
                        plan.outline.push(DrawCall {
                            pipeline: &self.pipelines.outline,
                            object: object.clone(),
                            material: None,
                            geometry: Geometry::Indexed(&batch.buffers),
                        });
                    }
                    plan.opaque.push(DrawCall {
                        pipeline,
                        object,
                        material: Some(&batch.material),
                        geometry: Geometry::Indexed(&batch.buffers),
                    });
                }
            }
        }

        for item in &list.transparent {
            let Some(instance) = engine.instances().get(item.id) else {
                continue;
            };
            if let Some(effect) = instance.effect() {
                self.plan_particles(&mut plan, instance, effect, &frame.camera);
                continue;
            }
            let Some((model, gpu)) = self.gpu_model(instance) else {
                continue;
            };
            let transform = instance_transform(instance, &frame.camera);
            let faded = instance.alpha < 1.0;
            for mesh in gpu.meshes.iter().filter(|mesh| faded || mesh.transparent) {
                let pipeline = if mesh.flags.contains(MeshFlags::ADDITIVE) {
                    &self.pipelines.additive
                } else {
                    &self.pipelines.alpha
                };
                for batch in &mesh.batches {
                    let uniform = self.mesh_uniform(instance, model, transform, mesh, batch);
                    plan.transparent.push(DrawCall {
                        pipeline,
                        object: self.object_group(&uniform, instance_bones(instance)),
                        material: Some(&batch.material),
                        geometry: Geometry::Indexed(&batch.buffers),
                    });
                }
            }
        }
        plan
    }

    fn plan_particles<'a>(
        &'a self,
        plan: &mut Plan<'a>,
        instance: &Instance,
        state: &ParticleEffectState,
        camera: &Camera,
    ) {
        let mut sprites: Vec<&ParticleSprite> = state
            .frame()
            .sprites
            .iter()
            .filter(|sprite| sprite.kind != ParticleType::CameraQuake && sprite.alpha > 0.0)
            .collect();
        sprites.sort_by(|a, b| {
            camera
                .depth_of(b.position)
                .total_cmp(&camera.depth_of(a.position))
        });

        for sprite in sprites {
            let Some(object) = state.effect.objects.get(sprite.object) else {
                continue;
            };
            let alpha = sprite.alpha * instance.alpha;
            let additive = sprite.blend == BlendType::Additive;
            match sprite.kind {
                ParticleType::PolygonObject => {
                    let Some(model) = object
                        .polygon
                        .as_deref()
                        .and_then(|name| state.effect.model(name))
                    else {
                        continue;
                    };
                    let Some(gpu) = self.models.get(&model.id) else {
                        continue;
                    };
                    let transform = polygon_transform(sprite);
                    let pipeline = if additive {
                        &self.pipelines.additive
                    } else {
                        &self.pipelines.alpha
                    };
                    for mesh in &gpu.meshes {
                        for batch in &mesh.batches {
                            let mut uniform = flat_uniform(transform, instance.diffuse.extend(alpha));
                            uniform.material = batch.params;
                            plan.transparent.push(DrawCall {
                                pipeline,
                                object: self.object_group(&uniform, None),
                                material: Some(&batch.material),
                                geometry: Geometry::Indexed(&batch.buffers),
                            });
                        }
                    }
                }
                ParticleType::Billboard => {
                    let transform = sprite_transform(sprite, camera);
                    plan.transparent.push(self.sprite_call(
                        transform,
                        alpha,
                        additive,
                        self.sprite_material(state, sprite.object, sprite.texture),
                    ));
                }
                ParticleType::SwordBlur | ParticleType::CameraQuake => {}
            }
        }

        let mut blurs: Vec<&ParticleBlur> = state
            .frame()
            .blurs
            .iter()
            .filter(|blur| blur.alpha > 0.0)
            .collect();
        blurs.sort_by(|a, b| {
            let far = |blur: &ParticleBlur| camera.depth_of((blur.start + blur.end) * 0.5);
            far(b).total_cmp(&far(a))
        });
        for blur in blurs {
            let Some(transform) = blur_transform(blur, camera) else {
                continue;
            };
            plan.transparent.push(self.sprite_call(
                transform,
                blur.alpha * instance.alpha,
                blur.blend == BlendType::Additive,
                self.sprite_material(state, blur.object, blur.texture),
            ));
        }
    }

    fn sprite_material(
        &self,
        state: &ParticleEffectState,
        object: usize,
        texture: Option<usize>,
    ) -> &wgpu::BindGroup {
        texture
            .zip(state.effect.objects.get(object))
            .and_then(|(index, object)| object.textures.get(index))
            .and_then(|name| state.effect.texture(name))
            .and_then(|texture| self.sprite_materials.get(&texture.id))
            .unwrap_or(&self.white_material)
    }

    fn sprite_call<'a>(
        &'a self,
        transform: Mat4,
        alpha: f32,
        additive: bool,
        material: &'a wgpu::BindGroup,
    ) -> DrawCall<'a> {
        let uniform = flat_uniform(transform, Vec3::ONE.extend(alpha));
        DrawCall {
            pipeline: if additive {
                &self.pipelines.sprite_additive
            } else {
                &self.pipelines.sprite_alpha
            },
            object: self.object_group(&uniform, None),
            material: Some(material),
            geometry: Geometry::Indexed(&self.quad),
        }
    }

    fn path_line(&self, instance: &Instance, points: &[Vec3]) -> DrawCall<'_> {
        let vertices: Vec<Vertex> = points
            .iter()
            .map(|point| Vertex {
                position: point.to_array(),
                normal: [0.0, 1.0, 0.0],
                uv: [0.0; 2],
                light_uv: [0.0; 2],
                bone_index: [0; 4],
                bone_weight: [0.0; 4],
            })
            .collect();
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("path-line"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let uniform = flat_uniform(Mat4::IDENTITY, instance.diffuse.extend(instance.alpha));
        DrawCall {
            pipeline: &self.pipelines.line,
            object: self.object_group(&uniform, None),
            material: None,
            geometry: Geometry::Lines {
                buffer,
                count: vertices.len() as u32,
            },
        }
    }

    fn gpu_model<'a>(&'a self, instance: &'a Instance) -> Option<(&'a Model, &'a GpuModel)> {
        let model = instance.model()?;
        let gpu = self.models.get(&model.id)?;
        Some((model.as_ref(), gpu))
    }

    fn mesh_uniform(
        &self,
        instance: &Instance,
        model: &Model,
        transform: Mat4,
        mesh: &GpuMesh,
        batch: &GpuBatch,
    ) -> ObjectUniform {
        let lighting = instance.draw.lighting && !mesh.flags.contains(MeshFlags::NO_LIGHTING);
        let skinned = model.has_bones() && instance.pose().is_some();
        ObjectUniform {
            model: transform.to_cols_array_2d(),
            normal: normal_matrix(transform),
            diffuse: instance.diffuse.extend(instance.alpha).into(),
            ambient: instance.ambient.extend(flag(lighting)).into(),
            material: batch.params,
            rim_color: batch.rim_color.extend(flag(instance.draw.fog)).into(),
            params: [flag(skinned), flag(batch.has_light_map), 0.0, 0.0],
        }
    }

    /// Per-draw uniform and bone buffers bound as group 1.
    fn object_group(&self, uniform: &ObjectUniform, bones: Option<&[[[f32; 4]; 3]]>) -> wgpu::BindGroup {
        let object = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("object-uniform"),
                contents: bytes_of(uniform),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bone_buffer = bones.map(|bones| {
            let mut rows = vec![[[0.0f32; 4]; 3]; MAX_GPU_BONES];
            let count = bones.len().min(MAX_GPU_BONES);
            rows[..count].copy_from_slice(&bones[..count]);
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("bone-uniform"),
                    contents: bytemuck::cast_slice(&rows),
                    usage: wgpu::BufferUsages::UNIFORM,
                })
        });
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("object-bind-group"),
            layout: &self.layouts.object,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: object.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: bone_buffer.as_ref().unwrap_or(&self.no_bones).as_entire_binding(),
                },
            ],
        })
    }

    /// Renders a top-down height image of the instance's model.
    pub fn height_map(&mut self, instance: &Instance) -> Result<HeightMap> {
        let model = instance
            .model()
            .ok_or_else(|| anyhow!("instance {} has no model", instance.id()))?;
        self.ensure_model(model);
        let gpu = self
            .models
            .get(&model.id)
            .ok_or_else(|| anyhow!("model {} was not uploaded", model.path))?;
        let transform = instance.transform();
        let bounds = model.aabb.transformed(&transform);
        if bounds.is_empty() {
            return Err(anyhow!("model {} has no geometry", model.path));
        }
        let size = self.height_map_size;

        let globals = FrameUniform {
            view_proj: height_view_projection(&bounds).to_cols_array_2d(),
            ..bytemuck::Zeroable::zeroed()
        };
        let globals_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("height-frame-uniform"),
                contents: bytes_of(&globals),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let globals_group = frame_bind_group(&self.device, &self.layouts.frame, &globals_buffer);

        let mut draws = Vec::new();
        for mesh in &gpu.meshes {
            for batch in &mesh.batches {
                let mut uniform = self.mesh_uniform(instance, model, transform, mesh, batch);
                uniform.params[2] = bounds.min.y;
                uniform.params[3] = bounds.max.y;
                draws.push(DrawCall {
                    pipeline: &self.pipelines.height,
                    object: self.object_group(&uniform, instance_bones(instance)),
                    material: None,
                    geometry: Geometry::Indexed(&batch.buffers),
                });
            }
        }

        let extent = wgpu::Extent3d {
            width: size,
            height: size,
            depth_or_array_layers: 1,
        };
        let color = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("height-target"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: HEIGHT_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());
        let depth = DepthBuffer::create(&self.device, size, size);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("height-encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("height-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &color_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &depth.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_bind_group(0, &globals_group, &[]);
            for draw in &draws {
                draw.record(&mut pass, &self.shadow_group);
            }
        }
        let copy = self.copy_to_staging(&mut encoder, &color, size, size, 2);
        self.queue.submit(std::iter::once(encoder.finish()));
        let bytes = self.finish_readback(copy, size, size, 2)?;
        Ok(HeightMap {
            width: size,
            height: size,
            bounds,
            values: bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        })
    }

    /// Height of the instance's model surface under world `(x, z)`, from
    /// an off-screen top-down render.
    pub fn detect_height(&mut self, engine: &ReignEngine, id: InstanceId, x: f32, z: f32) -> Result<Option<f32>> {
        let instance = engine.instance(id)?;
        Ok(self.height_map(instance)?.sample(x, z))
    }

    fn copy_to_staging(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        texture: &wgpu::Texture,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    ) -> Staging {
        // rows must be aligned to COPY_BYTES_PER_ROW_ALIGNMENT
        let padded_bytes_per_row = padded_row(width * bytes_per_pixel);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback-staging"),
            size: (padded_bytes_per_row * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Staging {
            buffer,
            padded_bytes_per_row,
        }
    }

    fn finish_readback(&self, staging: Staging, width: u32, height: u32, bytes_per_pixel: u32) -> Result<Vec<u8>> {
        let slice = staging.buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .context("failed to poll GPU device")?;
        rx.recv()
            .context("GPU readback was cancelled")?
            .context("failed to map readback buffer")?;

        let mapped = slice.get_mapped_range();
        let pixels = unpad_rows(
            &mapped,
            staging.padded_bytes_per_row as usize,
            (width * bytes_per_pixel) as usize,
            height as usize,
        );
        drop(mapped);
        staging.buffer.unmap();
        Ok(pixels)
    }
}

struct FrameState {
    uniform: FrameUniform,
    camera: Camera,
    shadow: Option<Mat4>,
}

struct Staging {
    buffer: wgpu::Buffer,
    padded_bytes_per_row: u32,
}

enum Geometry<'a> {
    Indexed(&'a MeshBuffers),
    Lines { buffer: wgpu::Buffer, count: u32 },
}

struct DrawCall<'a> {
    pipeline: &'a wgpu::RenderPipeline,
    object: wgpu::BindGroup,
    material: Option<&'a wgpu::BindGroup>,
    geometry: Geometry<'a>,
}

impl DrawCall<'_> {
    fn record(&self, pass: &mut wgpu::RenderPass<'_>, shadow: &wgpu::BindGroup) {
        pass.set_pipeline(self.pipeline);
        pass.set_bind_group(1, &self.object, &[]);
        if let Some(material) = self.material {
            pass.set_bind_group(2, material, &[]);
            pass.set_bind_group(3, shadow, &[]);
        }
        match &self.geometry {
            Geometry::Indexed(mesh) => {
                pass.set_vertex_buffer(0, mesh.vertex.slice(..));
                pass.set_index_buffer(mesh.index.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..mesh.index_count, 0, 0..1);
            }
            Geometry::Lines { buffer, count } => {
                pass.set_vertex_buffer(0, buffer.slice(..));
                pass.draw(0..*count, 0..1);
            }
        }
    }
}

#[derive(Default)]
struct Plan<'a> {
    shadow: Vec<DrawCall<'a>>,
    background: Vec<DrawCall<'a>>,
    opaque: Vec<DrawCall<'a>>,
    transparent: Vec<DrawCall<'a>>,
    outline: Vec<DrawCall<'a>>,
}

struct GpuModel {
    meshes: Vec<GpuMesh>,
}

struct GpuMesh {
    flags: MeshFlags,
    transparent: bool,
    casts_shadow: bool,
    batches: Vec<GpuBatch>,
}

struct GpuBatch {
    buffers: MeshBuffers,
    material: wgpu::BindGroup,
    params: [f32; 4],
    rim_color: Vec3,
    has_light_map: bool,
}

struct MeshBuffers {
    vertex: wgpu::Buffer,
    index: wgpu::Buffer,
    index_count: u32,
}

impl MeshBuffers {
    fn from_vertices(device: &wgpu::Device, vertices: &[Vertex], indices: &[u32], label: &str) -> Self {
        let vertex = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label}-vertices")),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label}-indices")),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self {
            vertex,
            index,
            index_count: indices.len() as u32,
        }
    }
}

struct GpuTexture {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl GpuTexture {
    fn upload(device: &wgpu::Device, queue: &wgpu::Queue, texture: &Texture) -> Self {
        let size = wgpu::Extent3d {
            width: texture.width.max(1),
            height: texture.height.max(1),
            depth_or_array_layers: 1,
        };
        let gpu = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&texture.path),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let expected = size.width as usize * size.height as usize * 4;
        if texture.rgba.len() == expected {
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &gpu,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &texture.rgba,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(size.width * 4),
                    rows_per_image: Some(size.height),
                },
                size,
            );
        } else {
            warn!("{}: pixel data does not match {}x{}", texture.path, size.width, size.height);
        }
        let view = gpu.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            _texture: gpu,
            view,
        }
    }
}

struct ColorTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl ColorTexture {
    fn create(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("color-target"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

struct DepthBuffer {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl DepthBuffer {
    fn create(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("depth-texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            _texture: texture,
            view,
        }
    }
}

struct ShadowMap {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

impl ShadowMap {
    fn create(device: &wgpu::Device, size: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("shadow-map"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("shadow-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });
        Self {
            _texture: texture,
            view,
            sampler,
        }
    }
}

struct Layouts {
    frame: wgpu::BindGroupLayout,
    object: wgpu::BindGroupLayout,
    material: wgpu::BindGroupLayout,
    shadow: wgpu::BindGroupLayout,
}

impl Layouts {
    fn create(device: &wgpu::Device) -> Self {
        let frame = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame-bind-layout"),
            entries: &[uniform_entry(0, std::mem::size_of::<FrameUniform>() as u64)],
        });
        let object = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("object-bind-layout"),
            entries: &[
                uniform_entry(0, std::mem::size_of::<ObjectUniform>() as u64),
                uniform_entry(1, BONE_BUFFER_SIZE),
            ],
        });
        let material = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("material-bind-layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let shadow = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("shadow-bind-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                    count: None,
                },
            ],
        });
        Self {
            frame,
            object,
            material,
            shadow,
        }
    }
}

fn uniform_entry(binding: u32, size: u64) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: NonZeroU64::new(size),
        },
        count: None,
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn frame_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    buffer: &wgpu::Buffer,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("frame-bind-group"),
        layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: buffer.as_entire_binding(),
        }],
    })
}

/// Colour, light map and specular map views plus the shared sampler.
fn material_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    sampler: &wgpu::Sampler,
    views: [&wgpu::TextureView; 3],
    label: &str,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(views[0]),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(views[1]),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::TextureView(views[2]),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: wgpu::BindingResource::Sampler(sampler),
            },
        ],
    })
}

struct Pipelines {
    opaque: wgpu::RenderPipeline,
    opaque_both: wgpu::RenderPipeline,
    alpha: wgpu::RenderPipeline,
    additive: wgpu::RenderPipeline,
    outline: wgpu::RenderPipeline,
    sprite_alpha: wgpu::RenderPipeline,
    sprite_additive: wgpu::RenderPipeline,
    background: wgpu::RenderPipeline,
    line: wgpu::RenderPipeline,
    shadow: wgpu::RenderPipeline,
    height: wgpu::RenderPipeline,
}

struct PipelineSpec<'a> {
    label: &'a str,
    layout: &'a wgpu::PipelineLayout,
    vertex: &'a str,
    fragment: Option<&'a str>,
    color: Option<(wgpu::TextureFormat, Option<wgpu::BlendState>)>,
    cull: Option<wgpu::Face>,
    topology: wgpu::PrimitiveTopology,
    depth_write: bool,
    depth_compare: wgpu::CompareFunction,
    bias: wgpu::DepthBiasState,
}

impl<'a> PipelineSpec<'a> {
    fn new(label: &'a str, layout: &'a wgpu::PipelineLayout, vertex: &'a str, fragment: &'a str) -> Self {
        Self {
            label,
            layout,
            vertex,
            fragment: Some(fragment),
            color: Some((COLOR_FORMAT, Some(wgpu::BlendState::ALPHA_BLENDING))),
            cull: None,
            topology: wgpu::PrimitiveTopology::TriangleList,
            depth_write: true,
            depth_compare: wgpu::CompareFunction::Less,
            bias: wgpu::DepthBiasState::default(),
        }
    }

    fn blended(mut self, blend: wgpu::BlendState) -> Self {
        self.color = Some((COLOR_FORMAT, Some(blend)));
        self.depth_write = false;
        self
    }

    fn culled(mut self, face: wgpu::Face) -> Self {
        self.cull = Some(face);
        self
    }

    fn build(self, device: &wgpu::Device, shader: &wgpu::ShaderModule, front_face: wgpu::FrontFace) -> wgpu::RenderPipeline {
        let targets = [self.color.map(|(format, blend)| wgpu::ColorTargetState {
            format,
            blend,
            write_mask: wgpu::ColorWrites::ALL,
        })];
        let fragment = self.fragment.map(|entry| wgpu::FragmentState {
            module: shader,
            entry_point: Some(entry),
            compilation_options: Default::default(),
            targets: if self.color.is_some() { &targets } else { &[] },
        });
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(self.label),
            layout: Some(self.layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some(self.vertex),
                compilation_options: Default::default(),
                buffers: &[vertex_layout()],
            },
            primitive: wgpu::PrimitiveState {
                topology: self.topology,
                front_face,
                cull_mode: self.cull,
                polygon_mode: wgpu::PolygonMode::Fill,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: self.depth_write,
                depth_compare: self.depth_compare,
                stencil: Default::default(),
                bias: self.bias,
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment,
            multiview: None,
            cache: None,
        })
    }
}

impl Pipelines {
    fn create(
        device: &wgpu::Device,
        shader: &wgpu::ShaderModule,
        layouts: &Layouts,
        front_face: wgpu::FrontFace,
    ) -> Self {
        let lit = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("lit-pipeline-layout"),
            bind_group_layouts: &[&layouts.frame, &layouts.object, &layouts.material, &layouts.shadow],
            push_constant_ranges: &[],
        });
        let textured = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("textured-pipeline-layout"),
            bind_group_layouts: &[&layouts.frame, &layouts.object, &layouts.material],
            push_constant_ranges: &[],
        });
        let plain = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("plain-pipeline-layout"),
            bind_group_layouts: &[&layouts.frame, &layouts.object],
            push_constant_ranges: &[],
        });

        let build = |spec: PipelineSpec| spec.build(device, shader, front_face);
        Self {
            opaque: build(PipelineSpec::new("opaque", &lit, "vs_main", "fs_main").culled(wgpu::Face::Back)),
            opaque_both: build(PipelineSpec::new("opaque-both", &lit, "vs_main", "fs_main")),
            alpha: build(
                PipelineSpec::new("alpha", &lit, "vs_main", "fs_main")
                    .blended(wgpu::BlendState::ALPHA_BLENDING),
            ),
            additive: build(
                PipelineSpec::new("additive", &lit, "vs_main", "fs_main").blended(ADDITIVE_BLENDING),
            ),
            outline: build(
                PipelineSpec::new("outline", &plain, "vs_outline", "fs_outline").culled(wgpu::Face::Front),
            ),
            sprite_alpha: build(
                PipelineSpec::new("sprite-alpha", &textured, "vs_sprite", "fs_sprite")
                    .blended(wgpu::BlendState::ALPHA_BLENDING),
            ),
            sprite_additive: build(
                PipelineSpec::new("sprite-additive", &textured, "vs_sprite", "fs_sprite")
                    .blended(ADDITIVE_BLENDING),
            ),
            background: build(PipelineSpec {
                depth_compare: wgpu::CompareFunction::Always,
                ..PipelineSpec::new("background", &textured, "vs_background", "fs_sprite")
                    .blended(wgpu::BlendState::ALPHA_BLENDING)
            }),
            line: build(PipelineSpec {
                topology: wgpu::PrimitiveTopology::LineStrip,
                ..PipelineSpec::new("path-line", &plain, "vs_line", "fs_line")
            }),
            shadow: build(PipelineSpec {
                fragment: None,
                color: None,
                bias: wgpu::DepthBiasState {
                    constant: 2,
                    slope_scale: 2.0,
                    clamp: 0.0,
                },
                ..PipelineSpec::new("shadow", &plain, "vs_shadow", "")
            }),
            height: build(PipelineSpec {
                color: Some((HEIGHT_FORMAT, None)),
                ..PipelineSpec::new("height", &plain, "vs_height", "fs_height")
            }),
        }
    }
}

fn vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<Vertex>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &VERTEX_ATTRIBUTES,
    }
}

/// Unit quad in the XY plane facing +Z, V running downwards.
fn quad_vertices() -> [Vertex; 4] {
    let corner = |x: f32, y: f32, u: f32, v: f32| Vertex {
        position: [x, y, 0.0],
        normal: [0.0, 0.0, 1.0],
        uv: [u, v],
        light_uv: [u, v],
        bone_index: [0; 4],
        bone_weight: [0.0; 4],
    };
    [
        corner(-0.5, 0.5, 0.0, 0.0),
        corner(0.5, 0.5, 1.0, 0.0),
        corner(0.5, -0.5, 1.0, 1.0),
        corner(-0.5, -0.5, 0.0, 1.0),
    ]
}

fn flag(on: bool) -> f32 {
    if on {
        1.0
    } else {
        0.0
    }
}

fn instance_bones(instance: &Instance) -> Option<&[[[f32; 4]; 3]]> {
    instance.pose().map(|pose| pose.skin.as_slice())
}

/// Billboards face the camera; everything else uses its own transform.
fn instance_transform(instance: &Instance, camera: &Camera) -> Mat4 {
    match instance.kind() {
        InstanceKind::Billboard => Mat4::from_scale_rotation_translation(
            instance.scale(),
            camera.billboard_rotation(),
            instance.position(),
        ),
        _ => instance.transform(),
    }
}

fn sprite_transform(sprite: &ParticleSprite, camera: &Camera) -> Mat4 {
    let rotation = camera.billboard_rotation() * Quat::from_rotation_z(sprite.rotation.z.to_radians());
    Mat4::from_scale_rotation_translation(sprite.size.extend(1.0), rotation, sprite.position)
}

/// Maps the unit quad onto a ribbon from `blur.start` to `blur.end`,
/// turned towards the camera. `None` when the ribbon has no length or
/// points straight at the camera.
fn blur_transform(blur: &ParticleBlur, camera: &Camera) -> Option<Mat4> {
    let axis = blur.end - blur.start;
    let middle = (blur.start + blur.end) * 0.5;
    let side = axis.cross(camera.position - middle).try_normalize()?;
    let normal = axis.cross(side).try_normalize()?;
    Some(Mat4::from_cols(
        axis.extend(0.0),
        (side * blur.width).extend(0.0),
        normal.extend(0.0),
        middle.extend(1.0),
    ))
}

fn polygon_transform(sprite: &ParticleSprite) -> Mat4 {
    let rotation = Quat::from_euler(
        EulerRot::XYZ,
        sprite.rotation.x.to_radians(),
        sprite.rotation.y.to_radians(),
        sprite.rotation.z.to_radians(),
    );
    Mat4::from_scale_rotation_translation(Vec3::splat(sprite.size.x), rotation, sprite.position)
}

/// Clip-space placement of a background layer measured in target pixels.
fn background_transform(layer: &BackgroundLayer, texture: &Texture, width: u32, height: u32, flip_y: bool) -> Mat4 {
    let target = Vec2::new(width.max(1) as f32, height.max(1) as f32);
    let size = Vec2::new(texture.width as f32, texture.height as f32) * layer.scale;
    let center = layer.position + size * 0.5;
    let direction = if flip_y { -1.0 } else { 1.0 };
    let ndc = Vec3::new(
        center.x / target.x * 2.0 - 1.0,
        (1.0 - center.y / target.y * 2.0) * direction,
        0.0,
    );
    let scale = Vec3::new(size.x / target.x * 2.0, size.y / target.y * 2.0 * direction, 1.0);
    Mat4::from_translation(ndc) * Mat4::from_scale(scale)
}

fn flat_uniform(transform: Mat4, diffuse: glam::Vec4) -> ObjectUniform {
    ObjectUniform {
        model: transform.to_cols_array_2d(),
        normal: normal_matrix(transform),
        diffuse: diffuse.into(),
        ambient: [0.0; 4],
        material: [0.0; 4],
        rim_color: [0.0; 4],
        params: [0.0; 4],
    }
}

fn normal_matrix(transform: Mat4) -> [[f32; 4]; 3] {
    let matrix = Mat3::from_mat4(transform);
    let normal = if matrix.determinant().abs() > f32::EPSILON {
        matrix.inverse().transpose()
    } else {
        matrix
    };
    mat3_to_3x4(normal)
}

fn mat3_to_3x4(matrix: Mat3) -> [[f32; 4]; 3] {
    let cols = matrix.to_cols_array();
    [
        [cols[0], cols[1], cols[2], 0.0],
        [cols[3], cols[4], cols[5], 0.0],
        [cols[6], cols[7], cols[8], 0.0],
    ]
}

fn padded_row(unpadded: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

fn unpad_rows(data: &[u8], padded: usize, unpadded: usize, rows: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(unpadded * rows);
    for row in 0..rows {
        let start = row * padded;
        out.extend_from_slice(&data[start..start + unpadded]);
    }
    out
}

fn reverse_rows(data: &[u8], row: usize) -> Vec<u8> {
    data.chunks_exact(row).rev().flatten().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_padded_to_copy_alignment() {
        assert_eq!(padded_row(4), 256);
        assert_eq!(padded_row(256), 256);
        assert_eq!(padded_row(1028), 1280);
    }

    #[test]
    fn unpadding_and_reversing_rows() {
        let data = [1, 2, 0, 0, 3, 4, 0, 0];
        let rows = unpad_rows(&data, 4, 2, 2);
        assert_eq!(rows, vec![1, 2, 3, 4]);
        assert_eq!(reverse_rows(&rows, 2), vec![3, 4, 1, 2]);
    }

    #[test]
    fn backgrounds_map_pixels_to_clip_space() {
        let texture = Texture::solid("bg", [0, 0, 0, 255]);
        let layer = BackgroundLayer {
            scale: Vec2::new(100.0, 50.0),
            visible: true,
            ..BackgroundLayer::default()
        };
        let transform = background_transform(&layer, &texture, 200, 100, false);
        let top_left = transform.transform_point3(Vec3::new(-0.5, 0.5, 0.0));
        let bottom_right = transform.transform_point3(Vec3::new(0.5, -0.5, 0.0));
        assert!((top_left.truncate() - Vec2::new(-1.0, 1.0)).length() < 1e-5);
        assert!((bottom_right.truncate() - Vec2::new(0.0, 0.0)).length() < 1e-5);

        let flipped = background_transform(&layer, &texture, 200, 100, true);
        let top_left = flipped.transform_point3(Vec3::new(-0.5, 0.5, 0.0));
        assert!((top_left.truncate() - Vec2::new(-1.0, -1.0)).length() < 1e-5);
    }

    #[test]
    fn sprites_face_the_camera() {
        let camera = Camera {
            yaw: 90.0,
            ..Camera::default()
        };
        let sprite = ParticleSprite {
            object: 0,
            kind: ParticleType::Billboard,
            blend: BlendType::Normal,
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Vec3::ZERO,
            size: Vec2::new(2.0, 1.0),
            alpha: 1.0,
            texture: None,
        };
        let transform = sprite_transform(&sprite, &camera);
        let normal = transform.transform_vector3(Vec3::Z).normalize();
        assert!((normal + camera.forward()).length() < 1e-5);
        assert!((transform.transform_point3(Vec3::ZERO) - sprite.position).length() < 1e-5);
    }

    #[test]
    fn blur_quads_stretch_between_anchors() {
        let camera = Camera {
            position: Vec3::new(0.0, 0.0, 10.0),
            ..Camera::default()
        };
        let blur = ParticleBlur {
            object: 0,
            blend: BlendType::Additive,
            start: Vec3::new(-1.0, 1.0, 0.0),
            end: Vec3::new(3.0, 1.0, 0.0),
            width: 0.5,
            alpha: 1.0,
            texture: None,
        };
        let transform = blur_transform(&blur, &camera).unwrap();
        let left = transform.transform_point3(Vec3::new(-0.5, 0.0, 0.0));
        let right = transform.transform_point3(Vec3::new(0.5, 0.0, 0.0));
        assert!((left - blur.start).length() < 1e-5);
        assert!((right - blur.end).length() < 1e-5);
        let top = transform.transform_point3(Vec3::new(0.0, 0.5, 0.0));
        assert!(((top - Vec3::new(1.0, 1.0, 0.0)).length() - 0.25).abs() < 1e-5);
        assert!(transform.transform_vector3(Vec3::Z).z.abs() > 0.99);

        let degenerate = ParticleBlur {
            end: blur.start,
            ..blur
        };
        assert!(blur_transform(&degenerate, &camera).is_none());
    }

    #[test]
    fn normal_matrix_survives_degenerate_scale() {
        let matrix = normal_matrix(Mat4::from_scale(Vec3::new(1.0, 0.0, 1.0)));
        assert!(matrix.iter().flatten().all(|value| value.is_finite()));
    }
}
