//! The per-frame task list and the builder that derives it from a pass set.

use crate::device::{
    BufferDesc, BufferId, CHANNEL_COUNT, ChannelBinding, Command, DrawCommand, ImageDesc,
    ImageDimension, ImageFormat, ImageId, MAX_MIP, Rect, RenderDevice, ViewDimension,
};
use crate::error::{Error, Result};
use crate::input::{KEY_COUNT, KeyboardState};
use crate::pass::{BUFFER_FORMAT, CUBE_FORMAT, InputSource, Pass, PassSet, VIEWPORT_FORMAT};
use crate::render_graph::{ChannelRef, DrawTask, ImageRef, Task};
use crate::texture::TextureCache;
use crate::uniforms::GpuInput;

/// Default edge length of cube map pass faces.
pub const DEFAULT_CUBE_FACE_SIZE: u32 = 1024;

/// Builder for [`FrameGraph`]s.
///
/// # Example
///
/// ```ignore
/// let graph = FrameGraph::builder()
///     .surface_size(1280, 720)
///     .cube_face_size(512)
///     .compose_rect(None)
///     .build(&mut device, &mut passes)?;
/// ```
#[derive(Debug, Clone)]
pub struct FrameGraphBuilder {
    surface_size: (u32, u32),
    cube_face_size: u32,
    compose_rect: Option<Rect>,
}

impl FrameGraphBuilder {
    pub fn new() -> Self {
        Self {
            surface_size: (1, 1),
            cube_face_size: DEFAULT_CUBE_FACE_SIZE,
            compose_rect: None,
        }
    }

    /// Size of the surface the image pass renders for. Zero is raised to one.
    pub fn surface_size(mut self, width: u32, height: u32) -> Self {
        self.surface_size = (width.max(1), height.max(1));
        self
    }

    pub fn cube_face_size(mut self, size: u32) -> Self {
        self.cube_face_size = size.max(1);
        self
    }

    /// Restricts composition to `rect` of the surface. `None` covers all of it.
    pub fn compose_rect(mut self, rect: Option<Rect>) -> Self {
        self.compose_rect = rect;
        self
    }

    /// Allocates or migrates the feedback images of `passes` and records the task
    /// list for one frame.
    ///
    /// Buffer feedback images follow the surface size; when an existing pair has a
    /// different extent its content is carried over. Cube map feedback images are
    /// allocated once at the face size.
    pub fn build<D: RenderDevice>(self, device: &mut D, passes: &mut PassSet) -> Result<FrameGraph> {
        let (width, height) = self.surface_size;

        for pass in &mut passes.buffers {
            let desc = ImageDesc::new_2d(pass.name.clone(), BUFFER_FORMAT, width, height)
                .with_mip_levels(MAX_MIP);
            match pass.feedback.extent() {
                Some(extent) if extent != (width, height) => pass.feedback.resize(device, &desc)?,
                _ => {
                    pass.feedback.get(device, &desc)?;
                }
            }
        }
        for pass in &mut passes.cubemaps {
            let size = self.cube_face_size;
            let desc = ImageDesc::new_2d(pass.name.clone(), CUBE_FORMAT, size, size).with_layers(6);
            pass.feedback.get(device, &desc)?;
        }

        let uniforms = device.create_buffer(&BufferDesc {
            name: "frame uniforms".to_owned(),
            size: std::mem::size_of::<GpuInput>() as u64,
        })?;
        let keyboard_desc = ImageDesc::new_2d("keyboard", ImageFormat::R8Unorm, KEY_COUNT as u32, 3);
        let keyboard = match device.create_image(&keyboard_desc) {
            Ok(image) => image,
            Err(e) => {
                device.destroy_buffer(uniforms);
                return Err(e);
            }
        };
        let viewport_mips = if passes.image.needs_mipmap { MAX_MIP } else { 1 };
        let viewport_desc = ImageDesc::new_2d("viewport", VIEWPORT_FORMAT, width, height)
            .with_mip_levels(viewport_mips);
        let viewport = match device.create_image(&viewport_desc) {
            Ok(image) => image,
            Err(e) => {
                device.destroy_image(keyboard);
                device.destroy_buffer(uniforms);
                return Err(e);
            }
        };

        let mut tasks = vec![Task::UploadUniforms, Task::UploadKeyboard];
        for (i, pass) in passes.buffers.iter().enumerate() {
            let target = ImageRef::PassOutput(i);
            tasks.push(Task::Draw(draw_task(pass, target, 1)));
            if pass.needs_mipmap {
                let levels = pass.feedback.desc().map_or(1, |desc| desc.mip_levels);
                push_mip_chain(&mut tasks, target, levels);
            }
        }
        for (i, pass) in passes.cubemaps.iter().enumerate() {
            tasks.push(Task::Draw(draw_task(pass, ImageRef::CubeOutput(i), 6)));
        }
        tasks.push(Task::Draw(draw_task(&passes.image, ImageRef::Viewport, 1)));
        if passes.image.needs_mipmap {
            push_mip_chain(&mut tasks, ImageRef::Viewport, viewport_desc.mip_levels);
        }
        tasks.push(Task::Compose {
            source: ImageRef::Viewport,
            rect: self.compose_rect,
        });

        log::debug!(
            "built frame graph: {} tasks at {width}x{height}",
            tasks.len()
        );
        Ok(FrameGraph {
            tasks,
            uniforms,
            keyboard,
            viewport,
            surface_size: self.surface_size,
            compose_rect: self.compose_rect,
        })
    }
}

impl Default for FrameGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn draw_task(pass: &Pass, target: ImageRef, layers: u32) -> DrawTask {
    let mut channels: [Option<ChannelRef>; CHANNEL_COUNT] = Default::default();
    for input in &pass.inputs {
        let image = match input.source {
            InputSource::Buffer { index } => ImageRef::PassHistory(index),
            InputSource::Cube { index } => ImageRef::CubeHistory(index),
            InputSource::Keyboard => ImageRef::Keyboard,
            InputSource::Texture { slot }
            | InputSource::CubeTexture { slot }
            | InputSource::VolumeTexture { slot } => ImageRef::Texture(slot),
        };
        channels[input.channel] = Some(ChannelRef {
            image,
            dimension: input.source.view_dimension(),
            sampler: input.sampler,
        });
    }
    DrawTask {
        pass: pass.name.clone(),
        pipeline: pass.pipeline,
        target,
        layers,
        channels,
    }
}

fn push_mip_chain(tasks: &mut Vec<Task>, image: ImageRef, levels: u32) {
    for level in 0..levels.saturating_sub(1) {
        tasks.push(Task::Mip { image, level });
    }
}

/// The recorded work of one frame.
///
/// Tasks name images logically, so a graph stays valid across feedback swaps and is
/// only rebuilt when the pass set or the surface size changes. The graph owns the
/// uniform buffer, the keyboard image and the viewport image the image pass renders
/// into.
pub struct FrameGraph {
    tasks: Vec<Task>,
    uniforms: BufferId,
    keyboard: ImageId,
    viewport: ImageId,
    surface_size: (u32, u32),
    compose_rect: Option<Rect>,
}

impl FrameGraph {
    pub fn builder() -> FrameGraphBuilder {
        FrameGraphBuilder::new()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    pub fn viewport(&self) -> ImageId {
        self.viewport
    }

    /// Resolves every task against the current feedback roles and submits the frame
    /// as one command list.
    ///
    /// `iResolution` and `iChannelResolution` are filled in here from the surface
    /// size and the images bound to the image pass.
    pub fn execute<D: RenderDevice>(
        &self,
        device: &mut D,
        passes: &PassSet,
        textures: &TextureCache,
        input: &GpuInput,
        keyboard: &KeyboardState,
    ) -> Result<()> {
        let mut input = *input;
        input.resolution = [self.surface_size.0 as f32, self.surface_size.1 as f32, 1.0];
        self.fill_channel_resolution(device, passes, textures, &mut input)?;

        let mut commands = Vec::with_capacity(self.tasks.len() + 5);
        for task in &self.tasks {
            match task {
                Task::UploadUniforms => commands.push(Command::WriteBuffer {
                    buffer: self.uniforms,
                    data: bytemuck::bytes_of(&input).to_vec(),
                }),
                Task::UploadKeyboard => commands.push(Command::WriteImage {
                    image: self.keyboard,
                    layer: 0,
                    data: keyboard.texels(),
                }),
                Task::Draw(draw) => {
                    let target = self.resolve(draw.target, passes, textures)?;
                    let channels = self.bind_channels(device, draw, passes, textures)?;
                    for layer in 0..draw.layers {
                        commands.push(Command::Draw(DrawCommand {
                            pipeline: draw.pipeline,
                            target,
                            layer,
                            face_index: layer,
                            uniforms: self.uniforms,
                            channels,
                        }));
                    }
                }
                Task::Mip { image, level } => commands.push(Command::Downsample {
                    image: self.resolve(*image, passes, textures)?,
                    level: *level,
                }),
                Task::Compose { source, rect } => commands.push(Command::Present {
                    source: self.resolve(*source, passes, textures)?,
                    rect: *rect,
                }),
            }
        }
        log::trace!("frame {}: submitting {} commands", input.frame, commands.len());
        device.submit(&commands)
    }

    /// Presents the last rendered viewport without drawing anything.
    pub fn present<D: RenderDevice>(&self, device: &mut D) -> Result<()> {
        device.submit(&[Command::Present {
            source: self.viewport,
            rect: self.compose_rect,
        }])
    }

    /// Releases the uniform buffer, keyboard and viewport images.
    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        device.destroy_image(self.viewport);
        device.destroy_image(self.keyboard);
        device.destroy_buffer(self.uniforms);
    }

    fn resolve(&self, image: ImageRef, passes: &PassSet, textures: &TextureCache) -> Result<ImageId> {
        let feedback = |list: &[Pass], i: usize, output: bool| {
            list.get(i).and_then(|pass| {
                if output {
                    pass.feedback.output()
                } else {
                    pass.feedback.history()
                }
            })
        };
        let id = match image {
            ImageRef::PassOutput(i) => feedback(&passes.buffers, i, true),
            ImageRef::PassHistory(i) => feedback(&passes.buffers, i, false),
            ImageRef::CubeOutput(i) => feedback(&passes.cubemaps, i, true),
            ImageRef::CubeHistory(i) => feedback(&passes.cubemaps, i, false),
            ImageRef::Texture(slot) => textures.image(slot),
            ImageRef::Keyboard => Some(self.keyboard),
            ImageRef::Viewport => Some(self.viewport),
        };
        id.ok_or(Error::UnknownResource("image"))
    }

    fn bind_channels<D: RenderDevice>(
        &self,
        device: &D,
        draw: &DrawTask,
        passes: &PassSet,
        textures: &TextureCache,
    ) -> Result<[Option<ChannelBinding>; CHANNEL_COUNT]> {
        let mut bindings = [None; CHANNEL_COUNT];
        for (binding, channel) in bindings.iter_mut().zip(&draw.channels) {
            let Some(channel) = channel else { continue };
            let image = self.resolve(channel.image, passes, textures)?;
            let mip_levels = device.image_desc(image).map_or(1, |desc| desc.mip_levels);
            *binding = Some(ChannelBinding {
                image,
                dimension: channel.dimension,
                mip_levels,
                sampler: channel.sampler,
            });
        }
        Ok(bindings)
    }

    fn fill_channel_resolution<D: RenderDevice>(
        &self,
        device: &D,
        passes: &PassSet,
        textures: &TextureCache,
        input: &mut GpuInput,
    ) -> Result<()> {
        input.channel_resolution = [[0.0; 4]; 4];
        let image_draw = self.tasks.iter().find_map(|task| match task {
            Task::Draw(draw) if draw.target == ImageRef::Viewport => Some(draw),
            _ => None,
        });
        let Some(draw) = image_draw else {
            return Ok(());
        };
        for (resolution, channel) in input.channel_resolution.iter_mut().zip(&draw.channels) {
            let Some(channel) = channel else { continue };
            let image = self.resolve(channel.image, passes, textures)?;
            if let Some(desc) = device.image_desc(image) {
                let depth = match (desc.dimension, channel.dimension) {
                    (ImageDimension::D3, ViewDimension::D3) => desc.depth_or_layers as f32,
                    _ => 1.0,
                };
                *resolution = [desc.width as f32, desc.height as f32, depth, 0.0];
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::PassGraphCompiler;
    use crate::description::{Document, parse_document};
    use crate::pass::SamplerSet;
    use crate::testing::RecordingDevice;

    struct Fixture {
        device: RecordingDevice,
        textures: TextureCache,
        passes: PassSet,
    }

    impl Fixture {
        fn load(json: &str) -> Self {
            let mut device = RecordingDevice::new();
            let mut textures = TextureCache::new(".", Vec::new());
            let samplers = SamplerSet::new(&mut device);
            let Document::Shader(desc) = parse_document(json).unwrap() else {
                panic!("expected a shader");
            };
            let passes = PassGraphCompiler::new(16)
                .compile(&mut device, &mut textures, &samplers, &desc)
                .unwrap();
            Self {
                device,
                textures,
                passes,
            }
        }

        fn build(&mut self, width: u32, height: u32) -> FrameGraph {
            FrameGraph::builder()
                .surface_size(width, height)
                .cube_face_size(16)
                .build(&mut self.device, &mut self.passes)
                .unwrap()
        }

        fn frame(&mut self, graph: &FrameGraph, frame: i32) {
            self.passes.swap_feedback();
            let input = GpuInput {
                frame,
                ..GpuInput::default()
            };
            graph
                .execute(
                    &mut self.device,
                    &self.passes,
                    &self.textures,
                    &input,
                    &KeyboardState::default(),
                )
                .unwrap();
        }
    }

    const FEEDBACK: &str = r#"{ "renderpass": [
        { "name": "Buffer A", "type": "buffer", "code": "", "outputs": [ { "id": "A" } ],
          "inputs": [ { "channel": 0, "type": "buffer", "id": "A",
                        "sampler": { "filter": "linear", "wrap": "clamp" } } ] },
        { "name": "Image", "type": "image", "code": "", "inputs": [
            { "channel": 1, "type": "buffer", "id": "A",
              "sampler": { "filter": "linear", "wrap": "clamp" } } ] }
    ] }"#;

    const FULL: &str = r#"{ "renderpass": [
        { "name": "Buffer A", "type": "buffer", "code": "", "outputs": [ { "id": "A" } ] },
        { "name": "Cube A", "type": "cubemap", "code": "", "outputs": [ { "id": "C" } ],
          "inputs": [ { "channel": 0, "type": "buffer", "id": "A",
                        "sampler": { "filter": "linear", "wrap": "clamp" } } ] },
        { "name": "Image", "type": "image", "code": "", "inputs": [
            { "channel": 0, "type": "buffer", "id": "A",
              "sampler": { "filter": "mipmap", "wrap": "repeat" } },
            { "channel": 1, "type": "cubemap", "id": "C",
              "sampler": { "filter": "linear", "wrap": "clamp" } },
            { "channel": 2, "type": "keyboard", "sampler": {} },
            { "channel": 3, "type": "volume", "id": "abc", "sampler": {} } ] }
    ] }"#;

    fn stamp(frame: i32) -> Option<Vec<u8>> {
        Some(RecordingDevice::stamp_texel(BUFFER_FORMAT, frame))
    }

    #[test]
    fn task_order() {
        let mut fx = Fixture::load(FULL);
        let graph = fx.build(512, 512);
        let tasks = graph.tasks();

        assert_eq!(tasks[0], Task::UploadUniforms);
        assert_eq!(tasks[1], Task::UploadKeyboard);
        let Task::Draw(buffer) = &tasks[2] else {
            panic!("expected the buffer draw, got {:?}", tasks[2]);
        };
        assert_eq!(buffer.target, ImageRef::PassOutput(0));

        let mips: Vec<_> = tasks
            .iter()
            .filter_map(|task| match task {
                Task::Mip { image, level } => Some((*image, *level)),
                _ => None,
            })
            .collect();
        assert_eq!(mips.len(), (MAX_MIP - 1) as usize);
        assert_eq!(mips[0], (ImageRef::PassOutput(0), 0));
        assert_eq!(mips[7], (ImageRef::PassOutput(0), 7));

        let Task::Draw(cube) = &tasks[11] else {
            panic!("expected the cube draw, got {:?}", tasks[11]);
        };
        assert_eq!((cube.target, cube.layers), (ImageRef::CubeOutput(0), 6));
        let Task::Draw(image) = &tasks[12] else {
            panic!("expected the image draw, got {:?}", tasks[12]);
        };
        assert_eq!(image.target, ImageRef::Viewport);
        assert_eq!(image.channels[0].unwrap().image, ImageRef::PassHistory(0));
        assert_eq!(image.channels[1].unwrap().image, ImageRef::CubeHistory(0));
        assert_eq!(image.channels[1].unwrap().dimension, ViewDimension::Cube);
        assert_eq!(image.channels[2].unwrap().image, ImageRef::Keyboard);
        assert_eq!(image.channels[3].unwrap().image, ImageRef::Texture(0));
        assert_eq!(
            tasks[13],
            Task::Compose {
                source: ImageRef::Viewport,
                rect: None
            }
        );
        assert_eq!(tasks.len(), 14);
    }

    #[test]
    fn feedback_lags_one_frame() {
        let mut fx = Fixture::load(FEEDBACK);
        let graph = fx.build(8, 8);
        for frame in 0..5 {
            fx.frame(&graph, frame);
        }

        let buffer: Vec<_> = fx.device.draws.iter().filter(|d| d.pass == "Buffer A").collect();
        let image: Vec<_> = fx.device.draws.iter().filter(|d| d.pass == "Image").collect();
        assert_eq!(buffer.len(), 5);
        assert_eq!(image.len(), 5);
        assert_eq!(buffer[0].inputs[0], stamp(0), "history starts zeroed");
        for frame in 1..5 {
            let i = frame as usize;
            assert_eq!(buffer[i].frame, frame);
            assert_eq!(buffer[i].inputs[0], stamp(frame - 1), "self feedback in frame {frame}");
            assert_eq!(image[i].inputs[1], stamp(frame - 1), "image read in frame {frame}");
        }
    }

    #[test]
    fn cube_pass_draws_every_face() {
        let mut fx = Fixture::load(FULL);
        let graph = fx.build(64, 32);
        fx.frame(&graph, 0);

        let faces: Vec<_> = fx
            .device
            .draws
            .iter()
            .filter(|d| d.pass == "Cube A")
            .map(|d| (d.layer, d.face_index))
            .collect();
        assert_eq!(faces, (0..6).map(|f| (f, f)).collect::<Vec<_>>());
        let cube = fx.passes.cubemaps[0].feedback.desc().unwrap();
        assert_eq!((cube.width, cube.depth_or_layers, cube.mip_levels), (16, 6, 1));
        assert_eq!(fx.device.submit_count, 1);
        // 64x32 holds 7 mip levels.
        assert_eq!(fx.device.downsamples.len(), 6);
    }

    #[test]
    fn compose_rect_and_paused_present() {
        let mut fx = Fixture::load(FEEDBACK);
        let rect = Rect {
            x: 10,
            y: 20,
            width: 30,
            height: 40,
        };
        let graph = FrameGraph::builder()
            .surface_size(100, 100)
            .compose_rect(Some(rect))
            .build(&mut fx.device, &mut fx.passes)
            .unwrap();
        fx.frame(&graph, 0);
        graph.present(&mut fx.device).unwrap();

        assert_eq!(fx.device.draws.len(), 2);
        assert_eq!(
            fx.device.presents,
            vec![(graph.viewport(), Some(rect)), (graph.viewport(), Some(rect))]
        );
    }

    #[test]
    fn uniforms_carry_resolutions() {
        let mut fx = Fixture::load(FULL);
        let graph = fx.build(40, 30);
        let mut input = GpuInput::default();
        fx.passes.swap_feedback();
        graph
            .fill_channel_resolution(&fx.device, &fx.passes, &fx.textures, &mut input)
            .unwrap();
        assert_eq!(input.channel_resolution[0], [40.0, 30.0, 1.0, 0.0]);
        assert_eq!(input.channel_resolution[1], [16.0, 16.0, 1.0, 0.0]);
        assert_eq!(input.channel_resolution[2], [256.0, 3.0, 1.0, 0.0]);
        assert_eq!(input.channel_resolution[3], [32.0, 32.0, 32.0, 0.0]);
    }

    #[test]
    fn rebuild_at_new_size_migrates_history() {
        let mut fx = Fixture::load(FEEDBACK);
        let graph = fx.build(8, 8);
        fx.frame(&graph, 1);
        fx.frame(&graph, 2);
        graph.destroy(&mut fx.device);

        let graph = fx.build(4, 16);
        assert_eq!(fx.passes.buffers[0].feedback.extent(), Some((4, 16)));
        fx.frame(&graph, 3);

        let last = fx.device.draws.last().unwrap();
        let seen = fx.device.draws[fx.device.draws.len() - 2].inputs[0].clone();
        assert_eq!(last.pass, "Image");
        // The history of frame 2 (what frame 1 wrote) survives the resize.
        assert_eq!(seen, stamp(1));
        graph.destroy(&mut fx.device);
        // Only the feedback pair remains.
        assert_eq!(fx.device.live_images(), 2);
        assert_eq!(fx.device.live_buffers(), 0);
    }
}
