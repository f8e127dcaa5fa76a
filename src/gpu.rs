//! The wgpu implementation of [`RenderDevice`].
//!
//! [`GpuContext`] owns the device, queue and window surface, plus every image, buffer,
//! sampler and pass pipeline created through the [`RenderDevice`] trait. Resources are
//! kept in slot maps keyed by the ids the rest of the crate passes around.
//!
//! # Pass pipelines
//!
//! A pass fragment shader is GLSL assembled from
//!
//! 1. `#version 450` and the pass defines,
//! 2. the prelude (uniform block, combined sampler and compatibility macros),
//! 3. one texture and one sampler declaration per channel, shaped by the pipeline's
//!    [`ChannelLayout`]s,
//! 4. the preprocessed pass source,
//! 5. the epilogue defining `main`.
//!
//! Every pass shares the WGSL full-screen triangle vertex shader, which hands the
//! instance index to the fragment stage as the cube face index.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use toyframe::GpuContext;
//!
//! let mut gpu = GpuContext::new(window)?;
//! gpu.resize(1920, 1080);
//! println!("{}x{}", gpu.width(), gpu.height());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use slotmap::SlotMap;
use winit::window::Window;

use crate::device::{
    AddressMode, BufferDesc, BufferId, CHANNEL_COUNT, ChannelBinding, ChannelLayout, Command,
    DrawCommand,
    Filter, ImageDesc, ImageDimension, ImageFormat, ImageId, PipelineDesc, PipelineId, Rect,
    RenderDevice, SampleKind, SamplerDesc, SamplerId, ViewDimension,
};
use crate::error::{Error, Result};
use crate::uniforms::GpuInput;

const PRELUDE: &str = include_str!("shaders/prelude.glsl");
const EPILOGUE: &str = include_str!("shaders/epilogue.glsl");
const FULLSCREEN_WGSL: &str = include_str!("shaders/fullscreen.wgsl");
const DOWNSAMPLE_WGSL: &str = include_str!("shaders/downsample.wgsl");
const PRESENT_WGSL: &str = include_str!("shaders/present.wgsl");

struct GpuImage {
    desc: ImageDesc,
    /// `None` for placeholders.
    texture: Option<wgpu::Texture>,
}

struct GpuPipeline {
    pipeline: wgpu::RenderPipeline,
    channel_layout: wgpu::BindGroupLayout,
    channels: [ChannelLayout; CHANNEL_COUNT],
}

/// 1x1 views bound to channels with nothing usable attached.
struct Fallbacks {
    d2: wgpu::TextureView,
    d2_uint: wgpu::TextureView,
    cube: wgpu::TextureView,
    d3: wgpu::TextureView,
}

impl Fallbacks {
    fn new(device: &wgpu::Device) -> Self {
        let view = |label: &str, format, dimension, layers, view_dimension| {
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: layers,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension,
                format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            });
            texture.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(view_dimension),
                ..Default::default()
            })
        };
        Self {
            d2: view(
                "fallback 2d",
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureDimension::D2,
                1,
                wgpu::TextureViewDimension::D2,
            ),
            d2_uint: view(
                "fallback 2d uint",
                wgpu::TextureFormat::Rgba32Uint,
                wgpu::TextureDimension::D2,
                1,
                wgpu::TextureViewDimension::D2,
            ),
            cube: view(
                "fallback cube",
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureDimension::D2,
                6,
                wgpu::TextureViewDimension::Cube,
            ),
            d3: view(
                "fallback 3d",
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureDimension::D3,
                1,
                wgpu::TextureViewDimension::D3,
            ),
        }
    }

    fn get(&self, layout: ChannelLayout) -> &wgpu::TextureView {
        match (layout.dimension, layout.sample) {
            (ViewDimension::D2, SampleKind::Uint) => &self.d2_uint,
            (ViewDimension::D2, SampleKind::Float) => &self.d2,
            (ViewDimension::Cube, _) => &self.cube,
            (ViewDimension::D3, _) => &self.d3,
        }
    }
}

/// Core GPU context holding wgpu resources.
///
/// The surface, device, queue and surface configuration are public for direct wgpu
/// access; everything created through [`RenderDevice`] is owned internally.
pub struct GpuContext {
    /// The surface for presenting rendered frames to the window.
    pub surface: wgpu::Surface<'static>,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Current surface configuration (format, size, present mode).
    pub config: wgpu::SurfaceConfiguration,
    /// `Rgba32Float` images can be sampled with linear filtering.
    float32_filterable: bool,

    images: SlotMap<ImageId, GpuImage>,
    buffers: SlotMap<BufferId, wgpu::Buffer>,
    samplers: SlotMap<SamplerId, wgpu::Sampler>,
    pipelines: SlotMap<PipelineId, GpuPipeline>,

    vertex_module: wgpu::ShaderModule,
    uniform_layout: wgpu::BindGroupLayout,
    fallbacks: Fallbacks,
    nearest_sampler: wgpu::Sampler,

    downsample_module: wgpu::ShaderModule,
    downsample_layout: wgpu::BindGroupLayout,
    downsample_pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,

    present_layout: wgpu::BindGroupLayout,
    present_pipeline: wgpu::RenderPipeline,
    present_sampler: wgpu::Sampler,
}

impl GpuContext {
    /// Creates a GPU context rendering to `window`.
    ///
    /// Picks a non-sRGB surface format, since ShaderToy shaders write display values
    /// directly. `FLOAT32_FILTERABLE` is enabled when the adapter offers it; without
    /// it `Rgba32Float` images are stored as `Rgba16Float`.
    pub fn new(window: Arc<Window>) -> Result<Self> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let surface = instance
            .create_surface(window)
            .map_err(|e| Error::Gpu(format!("failed to create surface: {e}")))?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .map_err(|e| Error::Gpu(format!("no suitable GPU adapter: {e}")))?;

        let float32_filterable = adapter
            .features()
            .contains(wgpu::Features::FLOAT32_FILTERABLE);
        let required_features = if float32_filterable {
            wgpu::Features::FLOAT32_FILTERABLE
        } else {
            wgpu::Features::empty()
        };
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("toyframe device"),
            required_features,
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
            experimental_features: Default::default(),
        }))
        .map_err(|e| Error::Gpu(format!("failed to create device: {e}")))?;

        let info = adapter.get_info();
        log::info!("using {} ({:?})", info.name, info.backend);
        if !float32_filterable {
            log::warn!("adapter cannot filter 32-bit float images, buffers use 16-bit floats");
        }

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| Error::Gpu("surface reports no formats".into()))?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fullscreen vertex"),
            source: wgpu::ShaderSource::Wgsl(FULLSCREEN_WGSL.into()),
        });
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame uniforms layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<GpuInput>() as u64),
                },
                count: None,
            }],
        });
        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("nearest sampler"),
            ..Default::default()
        });
        let fallbacks = Fallbacks::new(&device);

        let downsample_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("downsample"),
            source: wgpu::ShaderSource::Wgsl(DOWNSAMPLE_WGSL.into()),
        });
        let downsample_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("downsample layout"),
            entries: &[texture_entry(
                0,
                wgpu::TextureSampleType::Float { filterable: false },
                wgpu::TextureViewDimension::D2,
            )],
        });

        let present_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("present"),
            source: wgpu::ShaderSource::Wgsl(PRESENT_WGSL.into()),
        });
        let present_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("present layout"),
            entries: &[
                texture_entry(
                    0,
                    wgpu::TextureSampleType::Float { filterable: true },
                    wgpu::TextureViewDimension::D2,
                ),
                sampler_entry(1, wgpu::SamplerBindingType::Filtering),
            ],
        });
        let present_pipeline = fullscreen_pipeline(
            &device,
            "present",
            &[&present_layout],
            &vertex_module,
            &present_module,
            "fs",
            format,
        );
        let present_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("present sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            surface,
            device,
            queue,
            config,
            float32_filterable,
            images: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            vertex_module,
            uniform_layout,
            fallbacks,
            nearest_sampler,
            downsample_module,
            downsample_layout,
            downsample_pipelines: HashMap::new(),
            present_layout,
            present_pipeline,
            present_sampler,
        })
    }

    /// Resize the surface to new dimensions.
    ///
    /// Ignores zero-sized dimensions, which occur while the window is minimized.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.config.width = width;
            self.config.height = height;
            self.surface.configure(&self.device, &self.config);
        }
    }

    /// Returns the current surface width in pixels.
    pub fn width(&self) -> u32 {
        self.config.width
    }

    /// Returns the current surface height in pixels.
    pub fn height(&self) -> u32 {
        self.config.height
    }

    fn texture_format(&self, format: ImageFormat) -> Option<wgpu::TextureFormat> {
        match format {
            ImageFormat::Undefined => None,
            ImageFormat::R8Unorm => Some(wgpu::TextureFormat::R8Unorm),
            ImageFormat::Rgba8Unorm => Some(wgpu::TextureFormat::Rgba8Unorm),
            ImageFormat::Rgba16Float => Some(wgpu::TextureFormat::Rgba16Float),
            ImageFormat::Rgba32Float if self.float32_filterable => {
                Some(wgpu::TextureFormat::Rgba32Float)
            }
            ImageFormat::Rgba32Float => Some(wgpu::TextureFormat::Rgba16Float),
            ImageFormat::Rgba32Uint => Some(wgpu::TextureFormat::Rgba32Uint),
        }
    }

    fn texture(&self, id: ImageId) -> Result<&wgpu::Texture> {
        let image = self.images.get(id).ok_or(Error::UnknownResource("image"))?;
        image
            .texture
            .as_ref()
            .ok_or_else(|| Error::Gpu(format!("image '{}' has no storage", image.desc.name)))
    }

    fn channel_layout(&self, channels: &[ChannelLayout; CHANNEL_COUNT]) -> wgpu::BindGroupLayout {
        let mut entries = Vec::with_capacity(CHANNEL_COUNT * 2);
        for (i, channel) in channels.iter().enumerate() {
            let (sample_type, sampler_type) = match channel.sample {
                SampleKind::Float => (
                    wgpu::TextureSampleType::Float { filterable: true },
                    wgpu::SamplerBindingType::Filtering,
                ),
                SampleKind::Uint => (
                    wgpu::TextureSampleType::Uint,
                    wgpu::SamplerBindingType::NonFiltering,
                ),
            };
            entries.push(texture_entry(
                i as u32,
                sample_type,
                view_dimension(channel.dimension),
            ));
            entries.push(sampler_entry((CHANNEL_COUNT + i) as u32, sampler_type));
        }
        self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("channel layout"),
            entries: &entries,
        })
    }

    fn write_buffer(&self, id: BufferId, data: &[u8]) -> Result<()> {
        let buffer = self.buffers.get(id).ok_or(Error::UnknownResource("buffer"))?;
        if data.len() as u64 > buffer.size() {
            return Err(Error::Gpu(format!(
                "buffer write of {} bytes exceeds {} bytes",
                data.len(),
                buffer.size()
            )));
        }
        self.queue.write_buffer(buffer, 0, data);
        Ok(())
    }

    fn write_image(&self, id: ImageId, layer: u32, data: &[u8]) -> Result<()> {
        let image = self.images.get(id).ok_or(Error::UnknownResource("image"))?;
        let Some(texture) = &image.texture else {
            return Ok(());
        };
        let desc = &image.desc;
        let texel = texture.format().block_copy_size(None).unwrap_or(0);
        let (depth, z) = match desc.dimension {
            ImageDimension::D2 => (1, layer),
            ImageDimension::D3 => (desc.depth_or_layers, 0),
        };
        let expected = desc.width as usize * desc.height as usize * depth as usize * texel as usize;
        if data.len() != expected {
            return Err(Error::Gpu(format!(
                "image write of {} bytes does not match layer {layer} of '{}'",
                data.len(),
                desc.name
            )));
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * texel),
                rows_per_image: Some(desc.height),
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: depth,
            },
        );
        Ok(())
    }

    fn encode_draw(&self, encoder: &mut wgpu::CommandEncoder, draw: &DrawCommand) -> Result<()> {
        let pipeline = self
            .pipelines
            .get(draw.pipeline)
            .ok_or(Error::UnknownResource("pipeline"))?;
        let uniforms = self
            .buffers
            .get(draw.uniforms)
            .ok_or(Error::UnknownResource("buffer"))?;
        if let Some(image) = self.images.get(draw.target)
            && draw.layer >= image.desc.depth_or_layers
        {
            return Err(Error::Gpu(format!(
                "draw into layer {} of '{}', which has {} layers",
                draw.layer, image.desc.name, image.desc.depth_or_layers
            )));
        }
        let target = self.texture(draw.target)?.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_mip_level: 0,
            mip_level_count: Some(1),
            base_array_layer: draw.layer,
            array_layer_count: Some(1),
            ..Default::default()
        });

        let mut views = Vec::with_capacity(CHANNEL_COUNT);
        let mut samplers = Vec::with_capacity(CHANNEL_COUNT);
        for (layout, binding) in pipeline.channels.iter().zip(&draw.channels) {
            let bound = binding.as_ref().and_then(|binding| {
                let image = self.images.get(binding.image)?;
                let texture = image.texture.as_ref()?;
                (binding.dimension == layout.dimension && view_fits(binding, &image.desc))
                    .then_some((binding, texture))
            });
            let Some((binding, texture)) = bound else {
                views.push(self.fallbacks.get(*layout).clone());
                samplers.push(&self.nearest_sampler);
                continue;
            };
            views.push(texture.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(view_dimension(binding.dimension)),
                mip_level_count: Some(binding.mip_levels.max(1)),
                array_layer_count: match binding.dimension {
                    ViewDimension::Cube => Some(6),
                    _ => None,
                },
                ..Default::default()
            }));
            let sampler = match layout.sample {
                SampleKind::Uint => &self.nearest_sampler,
                SampleKind::Float => self
                    .samplers
                    .get(binding.sampler)
                    .ok_or(Error::UnknownResource("sampler"))?,
            };
            samplers.push(sampler);
        }

        let mut entries = Vec::with_capacity(CHANNEL_COUNT * 2);
        for (i, view) in views.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        for (i, sampler) in samplers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: (CHANNEL_COUNT + i) as u32,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }
        let channel_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("channels"),
            layout: &pipeline.channel_layout,
            entries: &entries,
        });
        let uniform_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("frame uniforms"),
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.as_entire_binding(),
            }],
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("pass draw"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&pipeline.pipeline);
        pass.set_bind_group(0, &uniform_group, &[]);
        pass.set_bind_group(1, &channel_group, &[]);
        pass.draw(0..3, draw.face_index..draw.face_index + 1);
        Ok(())
    }

    fn encode_copy(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        src: ImageId,
        dst: ImageId,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let copy = |texture| wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        };
        encoder.copy_texture_to_texture(
            copy(self.texture(src)?),
            copy(self.texture(dst)?),
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn encode_downsample(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        image: ImageId,
        level: u32,
    ) -> Result<()> {
        let texture = self.texture(image)?;
        let format = texture.format();
        let mip_view = |mip| {
            texture.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_mip_level: mip,
                mip_level_count: Some(1),
                base_array_layer: 0,
                array_layer_count: Some(1),
                ..Default::default()
            })
        };
        let src = mip_view(level);
        let dst = mip_view(level + 1);

        if !self.downsample_pipelines.contains_key(&format) {
            let pipeline = fullscreen_pipeline(
                &self.device,
                "downsample",
                &[&self.downsample_layout],
                &self.vertex_module,
                &self.downsample_module,
                "fs",
                format,
            );
            self.downsample_pipelines.insert(format, pipeline);
        }
        let pipeline = self
            .downsample_pipelines
            .get(&format)
            .ok_or_else(|| Error::Gpu(format!("no downsample pipeline for {format:?}")))?;

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("downsample"),
            layout: &self.downsample_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&src),
            }],
        });
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("downsample"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &dst,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &group, &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }

    /// Acquires the next surface texture, or `None` when this frame cannot present.
    fn acquire(&mut self) -> Result<Option<wgpu::SurfaceTexture>> {
        match self.surface.get_current_texture() {
            Ok(frame) => Ok(Some(frame)),
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                log::debug!("surface outdated, reconfiguring");
                self.surface.configure(&self.device, &self.config);
                Ok(None)
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                Err(Error::Gpu("out of memory acquiring the surface".into()))
            }
            Err(e) => {
                log::warn!("skipping present: {e}");
                Ok(None)
            }
        }
    }

    fn encode_present(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        frame: &wgpu::SurfaceTexture,
        source: ImageId,
        rect: Option<Rect>,
    ) -> Result<()> {
        let src = self.texture(source)?.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_mip_level: 0,
            mip_level_count: Some(1),
            ..Default::default()
        });
        let target = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("present"),
            layout: &self.present_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&src),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.present_sampler),
                },
            ],
        });

        let (width, height) = (self.config.width, self.config.height);
        let rect = rect.map_or(
            Rect {
                x: 0,
                y: 0,
                width,
                height,
            },
            |r| {
                let x = r.x.min(width);
                let y = r.y.min(height);
                Rect {
                    x,
                    y,
                    width: r.width.min(width - x),
                    height: r.height.min(height - y),
                }
            },
        );

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("present"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        if rect.width == 0 || rect.height == 0 {
            return Ok(());
        }
        pass.set_viewport(
            rect.x as f32,
            rect.y as f32,
            rect.width as f32,
            rect.height as f32,
            0.0,
            1.0,
        );
        pass.set_pipeline(&self.present_pipeline);
        pass.set_bind_group(0, &group, &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }

    /// Applies writes, encodes everything else into one command buffer and submits it.
    fn run(&mut self, commands: &[Command]) -> Result<()> {
        for command in commands {
            match command {
                Command::WriteBuffer { buffer, data } => self.write_buffer(*buffer, data)?,
                Command::WriteImage { image, layer, data } => {
                    self.write_image(*image, *layer, data)?
                }
                _ => {}
            }
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("toyframe commands"),
            });
        let mut frame = None;
        for command in commands {
            match command {
                Command::WriteBuffer { .. } | Command::WriteImage { .. } => {}
                Command::Draw(draw) => self.encode_draw(&mut encoder, draw)?,
                Command::CopyRegion {
                    src,
                    dst,
                    width,
                    height,
                } => self.encode_copy(&mut encoder, *src, *dst, *width, *height)?,
                Command::Downsample { image, level } => {
                    self.encode_downsample(&mut encoder, *image, *level)?
                }
                Command::Present { source, rect } => {
                    if frame.is_none() {
                        frame = self.acquire()?;
                    }
                    if let Some(frame) = &frame {
                        self.encode_present(&mut encoder, frame, *source, *rect)?;
                    }
                }
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(frame) = frame {
            frame.present();
        }
        Ok(())
    }
}

impl RenderDevice for GpuContext {
    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageId> {
        let texture = match self.texture_format(desc.format) {
            None => None,
            Some(format) => {
                let (dimension, usage) = match desc.dimension {
                    ImageDimension::D2 => (
                        wgpu::TextureDimension::D2,
                        wgpu::TextureUsages::TEXTURE_BINDING
                            | wgpu::TextureUsages::RENDER_ATTACHMENT
                            | wgpu::TextureUsages::COPY_SRC
                            | wgpu::TextureUsages::COPY_DST,
                    ),
                    ImageDimension::D3 => (
                        wgpu::TextureDimension::D3,
                        wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    ),
                };
                check_image_limits(desc, &self.device.limits())?;
                self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
                self.device.push_error_scope(wgpu::ErrorFilter::Validation);
                let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&desc.name),
                    size: wgpu::Extent3d {
                        width: desc.width.max(1),
                        height: desc.height.max(1),
                        depth_or_array_layers: desc.depth_or_layers.max(1),
                    },
                    mip_level_count: desc.mip_levels.max(1),
                    sample_count: 1,
                    dimension,
                    format,
                    usage,
                    view_formats: &[],
                });
                let invalid = pollster::block_on(self.device.pop_error_scope());
                let out_of_memory = pollster::block_on(self.device.pop_error_scope());
                if let Some(error) = invalid.or(out_of_memory) {
                    return Err(Error::Gpu(format!(
                        "failed to allocate image '{}': {error}",
                        desc.name
                    )));
                }
                Some(texture)
            }
        };
        Ok(self.images.insert(GpuImage {
            desc: desc.clone(),
            texture,
        }))
    }

    fn destroy_image(&mut self, id: ImageId) {
        if let Some(GpuImage {
            texture: Some(texture),
            ..
        }) = self.images.remove(id)
        {
            texture.destroy();
        }
    }

    fn image_desc(&self, id: ImageId) -> Option<&ImageDesc> {
        self.images.get(id).map(|image| &image.desc)
    }

    fn max_image_size(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.name),
            size: desc.size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(self.buffers.insert(buffer))
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(id) {
            buffer.destroy();
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> SamplerId {
        let filter = |filter| match filter {
            Filter::Nearest => wgpu::FilterMode::Nearest,
            Filter::Linear => wgpu::FilterMode::Linear,
        };
        let address_mode = match desc.address_mode {
            AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
        };
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("channel sampler"),
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            mag_filter: filter(desc.filter),
            min_filter: filter(desc.filter),
            mipmap_filter: filter(desc.mipmap_filter),
            lod_min_clamp: 0.0,
            lod_max_clamp: desc.max_lod,
            ..Default::default()
        });
        self.samplers.insert(sampler)
    }

    fn destroy_sampler(&mut self, id: SamplerId) {
        self.samplers.remove(id);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId, String> {
        let target_format = self
            .texture_format(desc.target_format)
            .ok_or_else(|| format!("pass '{}' has no target format", desc.name))?;
        let source = fragment_source(desc);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let fragment = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&desc.name),
            source: wgpu::ShaderSource::Glsl {
                shader: source.into(),
                stage: wgpu::naga::ShaderStage::Fragment,
                defines: Default::default(),
            },
        });
        let channel_layout = self.channel_layout(&desc.channels);
        let pipeline = fullscreen_pipeline(
            &self.device,
            &desc.name,
            &[&self.uniform_layout, &channel_layout],
            &self.vertex_module,
            &fragment,
            "main",
            target_format,
        );
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(error.to_string());
        }

        Ok(self.pipelines.insert(GpuPipeline {
            pipeline,
            channel_layout,
            channels: desc.channels,
        }))
    }

    fn destroy_pipeline(&mut self, id: PipelineId) {
        self.pipelines.remove(id);
    }

    fn submit(&mut self, commands: &[Command]) -> Result<()> {
        self.run(commands)
    }

    fn submit_and_wait(&mut self, commands: &[Command]) -> Result<()> {
        self.run(commands)?;
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| Error::Gpu(format!("waiting for the device failed: {e}")))?;
        Ok(())
    }
}

/// The complete GLSL fragment shader of a pass.
fn fragment_source(desc: &PipelineDesc) -> String {
    let mut source = String::with_capacity(PRELUDE.len() + desc.source.len() + EPILOGUE.len() + 1024);
    source.push_str("#version 450\n");
    for (name, value) in &desc.defines {
        source.push_str(&format!("#define {name} {value}\n"));
    }
    source.push_str(PRELUDE);
    for (i, channel) in desc.channels.iter().enumerate() {
        let prefix = match channel.sample {
            SampleKind::Float => "",
            SampleKind::Uint => "u",
        };
        let dimension = match channel.dimension {
            ViewDimension::D2 => "2D",
            ViewDimension::Cube => "Cube",
            ViewDimension::D3 => "3D",
        };
        source.push_str(&format!(
            "layout(set = 1, binding = {i}) uniform {prefix}texture{dimension} _iChannel{i}_tex;\n\
             layout(set = 1, binding = {}) uniform sampler _iChannel{i}_smp;\n",
            CHANNEL_COUNT + i
        ));
    }
    source.push_str(&sampler_functions(&desc.channels));
    source.push_str(&desc.source);
    source.push('\n');
    source.push_str(EPILOGUE);
    source
}

/// Sampling functions taking one of the `CombinedImageSampler*` handle types.
struct SamplerFunctions {
    handle: &'static str,
    sampler: &'static str,
    dimension: ViewDimension,
    sample: SampleKind,
    /// Return type, name, parameters after the handle, forwarded arguments, fallback.
    functions: &'static [(&'static str, &'static str, &'static str, &'static str, &'static str)],
}

// Integer textures cannot be filtered, so the uint handle only fetches.
const SAMPLER_FUNCTIONS: [SamplerFunctions; 4] = [
    SamplerFunctions {
        handle: "CombinedImageSampler2D",
        sampler: "sampler2D",
        dimension: ViewDimension::D2,
        sample: SampleKind::Float,
        functions: &[
            ("vec4", "texture", "vec2 P", "P", "vec4(0.0)"),
            ("vec4", "texture", "vec2 P, float bias", "P, bias", "vec4(0.0)"),
            ("vec4", "textureLod", "vec2 P, float lod", "P, lod", "vec4(0.0)"),
            ("vec4", "textureGrad", "vec2 P, vec2 dPdx, vec2 dPdy", "P, dPdx, dPdy", "vec4(0.0)"),
            ("vec4", "texelFetch", "ivec2 P, int lod", "P, lod", "vec4(0.0)"),
            ("ivec2", "textureSize", "int lod", "lod", "ivec2(0)"),
        ],
    },
    SamplerFunctions {
        handle: "CombinedImageSampler2D_uint",
        sampler: "usampler2D",
        dimension: ViewDimension::D2,
        sample: SampleKind::Uint,
        functions: &[
            ("uvec4", "texelFetch", "ivec2 P, int lod", "P, lod", "uvec4(0u)"),
            ("ivec2", "textureSize", "int lod", "lod", "ivec2(0)"),
        ],
    },
    SamplerFunctions {
        handle: "CombinedImageSamplerCube",
        sampler: "samplerCube",
        dimension: ViewDimension::Cube,
        sample: SampleKind::Float,
        functions: &[
            ("vec4", "texture", "vec3 P", "P", "vec4(0.0)"),
            ("vec4", "texture", "vec3 P, float bias", "P, bias", "vec4(0.0)"),
            ("vec4", "textureLod", "vec3 P, float lod", "P, lod", "vec4(0.0)"),
            ("ivec2", "textureSize", "int lod", "lod", "ivec2(0)"),
        ],
    },
    SamplerFunctions {
        handle: "CombinedImageSampler3D",
        sampler: "sampler3D",
        dimension: ViewDimension::D3,
        sample: SampleKind::Float,
        functions: &[
            ("vec4", "texture", "vec3 P", "P", "vec4(0.0)"),
            ("vec4", "texture", "vec3 P, float bias", "P, bias", "vec4(0.0)"),
            ("vec4", "textureLod", "vec3 P, float lod", "P, lod", "vec4(0.0)"),
            ("vec4", "textureGrad", "vec3 P, vec3 dPdx, vec3 dPdy", "P, dPdx, dPdy", "vec4(0.0)"),
            ("vec4", "texelFetch", "ivec3 P, int lod", "P, lod", "vec4(0.0)"),
            ("ivec3", "textureSize", "int lod", "lod", "ivec3(0)"),
        ],
    },
];

/// Overloads of the GLSL sampling functions for every handle type. Each one branches
/// on the handle's channel index over the channels bound with a matching layout, and
/// returns a zero value for any other channel.
fn sampler_functions(channels: &[ChannelLayout; CHANNEL_COUNT]) -> String {
    let mut block = String::new();
    for kind in &SAMPLER_FUNCTIONS {
        let bound: Vec<usize> = channels
            .iter()
            .enumerate()
            .filter(|(_, layout)| {
                layout.dimension == kind.dimension && layout.sample == kind.sample
            })
            .map(|(channel, _)| channel)
            .collect();
        for (ret, name, params, args, fallback) in kind.functions {
            block.push_str(&format!("{ret} {name}({} s, {params}) {{\n", kind.handle));
            for channel in &bound {
                let sampler = format!(
                    "{}(_iChannel{channel}_tex, _iChannel{channel}_smp)",
                    kind.sampler
                );
                block.push_str(&format!(
                    "    if (s.ch == {channel}) return {name}({sampler}, {args});\n"
                ));
            }
            block.push_str(&format!("    return {fallback};\n}}\n"));
        }
    }
    block
}

/// Rejects images the device cannot create, before wgpu reports it as an uncaptured
/// validation error.
fn check_image_limits(desc: &ImageDesc, limits: &wgpu::Limits) -> Result<()> {
    let (max_extent, max_depth) = match desc.dimension {
        ImageDimension::D2 => (limits.max_texture_dimension_2d, limits.max_texture_array_layers),
        ImageDimension::D3 => (limits.max_texture_dimension_3d, limits.max_texture_dimension_3d),
    };
    if desc.width > max_extent || desc.height > max_extent || desc.depth_or_layers > max_depth {
        return Err(Error::Gpu(format!(
            "image '{}' is {}x{}x{}, over the device limit of {max_extent} texels and {max_depth} \
             layers",
            desc.name, desc.width, desc.height, desc.depth_or_layers
        )));
    }
    Ok(())
}

/// Whether `binding` describes a view that can be created on `desc`.
fn view_fits(binding: &ChannelBinding, desc: &ImageDesc) -> bool {
    if binding.mip_levels.max(1) > desc.mip_levels.max(1) {
        return false;
    }
    match binding.dimension {
        ViewDimension::D2 => desc.dimension == ImageDimension::D2 && desc.depth_or_layers <= 1,
        ViewDimension::Cube => {
            desc.dimension == ImageDimension::D2
                && desc.depth_or_layers == 6
                && desc.width == desc.height
        }
        ViewDimension::D3 => desc.dimension == ImageDimension::D3,
    }
}

fn view_dimension(dimension: ViewDimension) -> wgpu::TextureViewDimension {
    match dimension {
        ViewDimension::D2 => wgpu::TextureViewDimension::D2,
        ViewDimension::Cube => wgpu::TextureViewDimension::Cube,
        ViewDimension::D3 => wgpu::TextureViewDimension::D3,
    }
}

fn texture_entry(
    binding: u32,
    sample_type: wgpu::TextureSampleType,
    view_dimension: wgpu::TextureViewDimension,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type,
            view_dimension,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32, ty: wgpu::SamplerBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(ty),
        count: None,
    }
}

/// A pipeline drawing the full-screen triangle into one color target.
fn fullscreen_pipeline(
    device: &wgpu::Device,
    label: &str,
    layouts: &[&wgpu::BindGroupLayout],
    vertex: &wgpu::ShaderModule,
    fragment: &wgpu::ShaderModule,
    fragment_entry: &str,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: layouts,
        push_constant_ranges: &[],
    });
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module: vertex,
            entry_point: Some("vs"),
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: fragment,
            entry_point: Some(fragment_entry),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}
