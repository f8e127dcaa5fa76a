//! A CPU [`RenderDevice`] for unit tests.
//!
//! Images are plain byte vectors. Copies and downsamples are executed on the CPU,
//! and a draw fills its target with the frame counter read from the bound uniform
//! buffer, so tests can follow which frame's output each pass observed.

use slotmap::SlotMap;

use crate::device::{
    BufferDesc, BufferId, CHANNEL_COUNT, Command, DrawCommand, ImageDesc, ImageDimension,
    ImageFormat, ImageId, PipelineDesc, PipelineId, Rect, RenderDevice, SamplerDesc, SamplerId,
};
use crate::error::{Error, Result};
use crate::uniforms::GpuInput;

struct CpuImage {
    desc: ImageDesc,
    /// One byte vector per mip level, array layers stored back to back.
    mips: Vec<Vec<u8>>,
}

impl CpuImage {
    fn new(desc: &ImageDesc) -> Self {
        let texel = desc.format.texel_size();
        let mips = (0..desc.mip_levels)
            .map(|level| {
                let (w, h) = desc.mip_extent(level);
                let layers = desc.depth_or_layers as usize;
                vec![0; w as usize * h as usize * layers * texel]
            })
            .collect();
        Self {
            desc: desc.clone(),
            mips,
        }
    }
}

/// What one executed draw saw and wrote.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawRecord {
    /// Name of the pipeline that was drawn.
    pub pass: String,
    pub target: ImageId,
    pub layer: u32,
    pub face_index: u32,
    /// Frame counter taken from the uniform buffer.
    pub frame: i32,
    /// First texel of every bound channel at the time of the draw.
    pub inputs: [Option<Vec<u8>>; CHANNEL_COUNT],
}

#[derive(Default)]
pub struct RecordingDevice {
    images: SlotMap<ImageId, CpuImage>,
    buffers: SlotMap<BufferId, Vec<u8>>,
    samplers: SlotMap<SamplerId, SamplerDesc>,
    pipelines: SlotMap<PipelineId, PipelineDesc>,
    /// Pipelines whose source contains this text fail to compile.
    pub fail_marker: Option<String>,
    pub submit_count: usize,
    pub wait_count: usize,
    pub draws: Vec<DrawRecord>,
    pub downsamples: Vec<(ImageId, u32)>,
    pub presents: Vec<(ImageId, Option<Rect>)>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn texels(&self, id: ImageId, mip: u32) -> Option<&[u8]> {
        self.images
            .get(id)
            .and_then(|image| image.mips.get(mip as usize))
            .map(Vec::as_slice)
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn pipeline(&self, id: PipelineId) -> Option<&PipelineDesc> {
        self.pipelines.get(id)
    }

    pub fn sampler(&self, id: SamplerId) -> Option<&SamplerDesc> {
        self.samplers.get(id)
    }

    /// Encodes `value` the way draws stamp their targets.
    pub fn stamp_texel(format: ImageFormat, value: i32) -> Vec<u8> {
        match format {
            ImageFormat::Rgba32Float => bytemuck::cast_slice(&[value as f32; 4]).to_vec(),
            other => vec![value as u8; other.texel_size()],
        }
    }

    fn run(&mut self, commands: &[Command]) -> Result<()> {
        let (writes, work): (Vec<&Command>, Vec<&Command>) = commands.iter().partition(|c| {
            matches!(c, Command::WriteBuffer { .. } | Command::WriteImage { .. })
        });
        for command in writes.into_iter().chain(work) {
            self.execute(command)?;
        }
        Ok(())
    }

    fn execute(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::WriteBuffer { buffer, data } => {
                let dst = self
                    .buffers
                    .get_mut(*buffer)
                    .ok_or(Error::UnknownResource("buffer"))?;
                if data.len() > dst.len() {
                    return Err(Error::Gpu("buffer write out of bounds".into()));
                }
                dst[..data.len()].copy_from_slice(data);
            }
            Command::WriteImage { image, layer, data } => {
                let dst = self
                    .images
                    .get_mut(*image)
                    .ok_or(Error::UnknownResource("image"))?;
                let size = dst.desc.layer_size();
                let layers = match dst.desc.dimension {
                    ImageDimension::D2 => dst.desc.depth_or_layers,
                    ImageDimension::D3 => 1,
                };
                if data.len() != size || *layer >= layers {
                    return Err(Error::Gpu(format!(
                        "image write of {} bytes does not match layer {layer} of '{}'",
                        data.len(),
                        dst.desc.name
                    )));
                }
                let offset = *layer as usize * size;
                dst.mips[0][offset..offset + size].copy_from_slice(data);
            }
            Command::Draw(draw) => self.draw(draw)?,
            Command::CopyRegion {
                src,
                dst,
                width,
                height,
            } => self.copy_region(*src, *dst, *width, *height)?,
            Command::Downsample { image, level } => {
                self.downsample(*image, *level)?;
                self.downsamples.push((*image, *level));
            }
            Command::Present { source, rect } => {
                if !self.images.contains_key(*source) {
                    return Err(Error::UnknownResource("image"));
                }
                self.presents.push((*source, *rect));
            }
        }
        Ok(())
    }

    fn draw(&mut self, draw: &DrawCommand) -> Result<()> {
        let pass = self
            .pipelines
            .get(draw.pipeline)
            .ok_or(Error::UnknownResource("pipeline"))?
            .name
            .clone();
        let uniforms = self
            .buffers
            .get(draw.uniforms)
            .ok_or(Error::UnknownResource("buffer"))?;
        let input: GpuInput =
            bytemuck::pod_read_unaligned(&uniforms[..std::mem::size_of::<GpuInput>()]);

        let mut inputs: [Option<Vec<u8>>; CHANNEL_COUNT] = Default::default();
        for (slot, binding) in inputs.iter_mut().zip(&draw.channels) {
            if let Some(binding) = binding {
                if !self.samplers.contains_key(binding.sampler) {
                    return Err(Error::UnknownResource("sampler"));
                }
                let image = self
                    .images
                    .get(binding.image)
                    .ok_or(Error::UnknownResource("image"))?;
                let texel = image.desc.format.texel_size();
                *slot = Some(image.mips[0][..texel].to_vec());
            }
        }

        let target = self
            .images
            .get_mut(draw.target)
            .ok_or(Error::UnknownResource("image"))?;
        let stamp = Self::stamp_texel(target.desc.format, input.frame);
        let size = target.desc.layer_size();
        let offset = draw.layer as usize * size;
        for texel in target.mips[0][offset..offset + size].chunks_exact_mut(stamp.len()) {
            texel.copy_from_slice(&stamp);
        }

        self.draws.push(DrawRecord {
            pass,
            target: draw.target,
            layer: draw.layer,
            face_index: draw.face_index,
            frame: input.frame,
            inputs,
        });
        Ok(())
    }

    fn copy_region(&mut self, src: ImageId, dst: ImageId, width: u32, height: u32) -> Result<()> {
        let source = self.images.get(src).ok_or(Error::UnknownResource("image"))?;
        let texel = source.desc.format.texel_size();
        let src_stride = source.desc.width as usize * texel;
        if width > source.desc.width || height > source.desc.height {
            return Err(Error::Gpu("copy region exceeds source".into()));
        }
        let rows: Vec<Vec<u8>> = (0..height as usize)
            .map(|y| source.mips[0][y * src_stride..y * src_stride + width as usize * texel].to_vec())
            .collect();

        let dest = self.images.get_mut(dst).ok_or(Error::UnknownResource("image"))?;
        if width > dest.desc.width || height > dest.desc.height || dest.desc.format.texel_size() != texel {
            return Err(Error::Gpu("copy region exceeds destination".into()));
        }
        let dst_stride = dest.desc.width as usize * texel;
        for (y, row) in rows.iter().enumerate() {
            dest.mips[0][y * dst_stride..y * dst_stride + row.len()].copy_from_slice(row);
        }
        Ok(())
    }

    fn downsample(&mut self, id: ImageId, level: u32) -> Result<()> {
        let image = self.images.get_mut(id).ok_or(Error::UnknownResource("image"))?;
        if level + 1 >= image.desc.mip_levels {
            return Err(Error::Gpu(format!("'{}' has no mip {}", image.desc.name, level + 1)));
        }
        let texel = image.desc.format.texel_size();
        let (sw, _) = image.desc.mip_extent(level);
        let (dw, dh) = image.desc.mip_extent(level + 1);
        let (upper, lower) = image.mips.split_at_mut(level as usize + 1);
        let (src, dst) = (&upper[level as usize], &mut lower[0]);
        for y in 0..dh as usize {
            for x in 0..dw as usize {
                let s = (2 * y * sw as usize + 2 * x) * texel;
                let d = (y * dw as usize + x) * texel;
                dst[d..d + texel].copy_from_slice(&src[s..s + texel]);
            }
        }
        Ok(())
    }
}

impl RenderDevice for RecordingDevice {
    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageId> {
        Ok(self.images.insert(CpuImage::new(desc)))
    }

    fn destroy_image(&mut self, id: ImageId) {
        self.images.remove(id);
    }

    fn image_desc(&self, id: ImageId) -> Option<&ImageDesc> {
        self.images.get(id).map(|image| &image.desc)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId> {
        Ok(self.buffers.insert(vec![0; desc.size as usize]))
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        self.buffers.remove(id);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> SamplerId {
        self.samplers.insert(*desc)
    }

    fn destroy_sampler(&mut self, id: SamplerId) {
        self.samplers.remove(id);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId, String> {
        if let Some(marker) = &self.fail_marker
            && desc.source.contains(marker.as_str())
        {
            return Err(format!("0:1: error: '{marker}' : undeclared identifier"));
        }
        Ok(self.pipelines.insert(desc.clone()))
    }

    fn destroy_pipeline(&mut self, id: PipelineId) {
        self.pipelines.remove(id);
    }

    fn submit(&mut self, commands: &[Command]) -> Result<()> {
        self.submit_count += 1;
        self.run(commands)
    }

    fn submit_and_wait(&mut self, commands: &[Command]) -> Result<()> {
        self.wait_count += 1;
        self.run(commands)
    }
}
