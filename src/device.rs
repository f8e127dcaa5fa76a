//! The rendering device seam.
//!
//! Everything above this module (texture loading, pass compilation, the frame graph)
//! talks to the GPU through [`RenderDevice`]. Resources are named by small copyable
//! generational ids, so a stale id left behind after a reload is detected instead of
//! silently aliasing a new resource.
//!
//! The real implementation is [`GpuContext`](crate::GpuContext). Tests use a CPU
//! implementation that stores texels in memory.
//!
//! # Recording work
//!
//! Work is described as a list of [`Command`]s and handed to the device in one call:
//!
//! ```ignore
//! device.submit(&[
//!     Command::WriteBuffer { buffer: uniforms, data: bytemuck::bytes_of(&input).to_vec() },
//!     Command::Draw(draw),
//!     Command::Present { source: viewport, rect: None },
//! ])?;
//! ```
//!
//! Writes are applied before any draw or copy of the same submission.

use crate::error::Result;

/// Number of input channels a pass can bind (`iChannel0..iChannel3`).
pub const CHANNEL_COUNT: usize = 4;

/// Mip levels allocated for images that may need a mip chain.
pub const MAX_MIP: u32 = 9;

/// Largest width or height of a 2D image every device accepts.
pub const MAX_IMAGE_SIZE: u32 = 8192;

slotmap::new_key_type! {
    /// Handle to a device image.
    pub struct ImageId;
    /// Handle to a device buffer.
    pub struct BufferId;
    /// Handle to a device sampler.
    pub struct SamplerId;
    /// Handle to a compiled pass pipeline.
    pub struct PipelineId;
}

/// Texel formats used by the viewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// No storage. Used for textures that could not be loaded at all.
    Undefined,
    R8Unorm,
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    Rgba32Uint,
}

impl ImageFormat {
    /// Bytes per texel.
    pub fn texel_size(self) -> usize {
        match self {
            ImageFormat::Undefined => 0,
            ImageFormat::R8Unorm => 1,
            ImageFormat::Rgba8Unorm => 4,
            ImageFormat::Rgba16Float => 8,
            ImageFormat::Rgba32Float | ImageFormat::Rgba32Uint => 16,
        }
    }

    /// How shaders read this format.
    pub fn sample_kind(self) -> SampleKind {
        match self {
            ImageFormat::Rgba32Uint => SampleKind::Uint,
            _ => SampleKind::Float,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageDimension {
    D2,
    D3,
}

/// Description of a device image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageDesc {
    /// Debug name.
    pub name: String,
    pub format: ImageFormat,
    pub dimension: ImageDimension,
    pub width: u32,
    pub height: u32,
    /// Depth for 3D images, array layer count for 2D images.
    pub depth_or_layers: u32,
    pub mip_levels: u32,
}

impl ImageDesc {
    /// A single-layer 2D image without mips.
    pub fn new_2d(name: impl Into<String>, format: ImageFormat, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            format,
            dimension: ImageDimension::D2,
            width,
            height,
            depth_or_layers: 1,
            mip_levels: 1,
        }
    }

    /// A volume image without mips.
    pub fn new_3d(
        name: impl Into<String>,
        format: ImageFormat,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            dimension: ImageDimension::D3,
            width,
            height,
            depth_or_layers: depth,
            mip_levels: 1,
        }
    }

    /// A zero-sized image of [`ImageFormat::Undefined`].
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::new_2d(name, ImageFormat::Undefined, 0, 0)
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.depth_or_layers = layers;
        self
    }

    /// Requests `levels` mips, clamped to what the extent can hold.
    pub fn with_mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels.clamp(1, full_mip_count(self.width, self.height));
        self
    }

    /// Width and height of a mip level.
    pub fn mip_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// Bytes of one array layer at mip 0. For volumes this covers every slice.
    pub fn layer_size(&self) -> usize {
        let slices = match self.dimension {
            ImageDimension::D2 => 1,
            ImageDimension::D3 => self.depth_or_layers as usize,
        };
        self.width as usize * self.height as usize * slices * self.format.texel_size()
    }

    pub fn is_placeholder(&self) -> bool {
        self.format == ImageFormat::Undefined
    }
}

/// Length of a full mip chain for a `width` x `height` image.
pub fn full_mip_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Description of a device buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    /// Minification and magnification filter.
    pub filter: Filter,
    pub mipmap_filter: Filter,
    pub address_mode: AddressMode,
    /// Highest mip level the sampler may read.
    pub max_lod: f32,
}

/// How a channel is viewed by a pass shader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ViewDimension {
    #[default]
    D2,
    Cube,
    D3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SampleKind {
    #[default]
    Float,
    Uint,
}

/// Shape of one channel slot in a pipeline's bind layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChannelLayout {
    pub dimension: ViewDimension,
    pub sample: SampleKind,
}

/// Everything needed to build one pass pipeline.
///
/// `source` is the pass's fragment code after preprocessing: shared common code,
/// the channel macro block and the user code. The device supplies the version
/// line, uniform and channel declarations and the `main` entry point around it.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineDesc {
    pub name: String,
    pub source: String,
    /// `#define NAME VALUE` pairs placed ahead of all code.
    pub defines: Vec<(String, String)>,
    /// Format of the image the pass renders into.
    pub target_format: ImageFormat,
    pub channels: [ChannelLayout; CHANNEL_COUNT],
}

/// An image bound to a channel slot for one draw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelBinding {
    pub image: ImageId,
    pub dimension: ViewDimension,
    /// Mip levels visible through the view, starting at level 0.
    pub mip_levels: u32,
    pub sampler: SamplerId,
}

/// A full-screen draw of a pass into one layer of `target`, at mip 0.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawCommand {
    pub pipeline: PipelineId,
    pub target: ImageId,
    pub layer: u32,
    /// Cube face being rendered. Zero for 2D passes.
    pub face_index: u32,
    pub uniforms: BufferId,
    pub channels: [Option<ChannelBinding>; CHANNEL_COUNT],
}

/// Pixel rectangle, origin top-left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One unit of recorded GPU work.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Replaces the start of a buffer with `data`.
    WriteBuffer { buffer: BufferId, data: Vec<u8> },
    /// Replaces mip 0 of one array layer (or a whole volume) with tightly packed texels.
    WriteImage {
        image: ImageId,
        layer: u32,
        data: Vec<u8>,
    },
    Draw(DrawCommand),
    /// Nearest-filtered copy of the top-left `width` x `height` texels of mip 0, layer 0.
    CopyRegion {
        src: ImageId,
        dst: ImageId,
        width: u32,
        height: u32,
    },
    /// Linear downsample of mip `level` into mip `level + 1`.
    Downsample { image: ImageId, level: u32 },
    /// Linear blit of `source` to the window surface, optionally into `rect` only.
    Present { source: ImageId, rect: Option<Rect> },
}

/// A device that owns images, buffers, samplers and pass pipelines and executes
/// recorded [`Command`] lists.
pub trait RenderDevice {
    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageId>;
    fn destroy_image(&mut self, id: ImageId);
    /// Description of a live image, `None` once destroyed.
    fn image_desc(&self, id: ImageId) -> Option<&ImageDesc>;
    /// Largest width or height accepted for a 2D image.
    fn max_image_size(&self) -> u32 {
        MAX_IMAGE_SIZE
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId>;
    fn destroy_buffer(&mut self, id: BufferId);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> SamplerId;
    fn destroy_sampler(&mut self, id: SamplerId);

    /// Compiles a pass. On failure returns the compiler diagnostics.
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId, String>;
    fn destroy_pipeline(&mut self, id: PipelineId);

    /// Submits work without waiting for it.
    fn submit(&mut self, commands: &[Command]) -> Result<()>;
    /// Submits work and blocks until the device has finished it.
    fn submit_and_wait(&mut self, commands: &[Command]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_mip_counts() {
        assert_eq!(full_mip_count(1, 1), 1);
        assert_eq!(full_mip_count(2, 1), 2);
        assert_eq!(full_mip_count(100, 100), 7);
        assert_eq!(full_mip_count(512, 256), 10);
        assert_eq!(full_mip_count(0, 0), 1);
    }

    #[test]
    fn mip_levels_clamped_to_extent() {
        let desc = ImageDesc::new_2d("a", ImageFormat::Rgba32Float, 100, 100).with_mip_levels(MAX_MIP);
        assert_eq!(desc.mip_levels, 7);
        let desc = ImageDesc::new_2d("b", ImageFormat::Rgba32Float, 1024, 768).with_mip_levels(MAX_MIP);
        assert_eq!(desc.mip_levels, MAX_MIP);
        assert_eq!(desc.mip_extent(8), (4, 3));
    }

    #[test]
    fn layer_size() {
        let volume = ImageDesc::new_3d("v", ImageFormat::Rgba8Unorm, 32, 32, 32);
        assert_eq!(volume.layer_size(), 32 * 32 * 32 * 4);
        let cube = ImageDesc::new_2d("c", ImageFormat::Rgba8Unorm, 8, 8).with_layers(6);
        assert_eq!(cube.layer_size(), 8 * 8 * 4);
        assert_eq!(ImageDesc::placeholder("p").layer_size(), 0);
    }
}
