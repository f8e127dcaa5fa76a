//! The compiled form of a shader description.
//!
//! A [`PassSet`] is produced by one load and replaced wholesale by the next. It owns
//! the pipelines of its passes and their feedback images; textures live in the
//! [`TextureCache`](crate::TextureCache) that was filled during the same load.

use crate::device::{
    AddressMode, Filter, ImageFormat, PipelineId, RenderDevice, SamplerDesc, SamplerId,
    ViewDimension, MAX_MIP,
};
use crate::render_graph::PingPongImage;

/// Storage format of buffer pass outputs.
pub const BUFFER_FORMAT: ImageFormat = ImageFormat::Rgba32Float;
/// Storage format of cube map pass outputs and of the final viewport image.
pub const CUBE_FORMAT: ImageFormat = ImageFormat::Rgba16Float;
pub const VIEWPORT_FORMAT: ImageFormat = ImageFormat::Rgba16Float;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    Buffer,
    Cubemap,
    Image,
}

/// ShaderToy sampler filter names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FilterMode {
    #[default]
    Nearest = 0,
    Linear = 1,
    Mipmap = 2,
}

/// ShaderToy sampler wrap names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WrapMode {
    #[default]
    Clamp = 0,
    Repeat = 1,
}

/// A sampler as requested by a description, before any downgrade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerSpec {
    pub filter: FilterMode,
    pub wrap: WrapMode,
}

impl SamplerSpec {
    /// Parses description names. Unknown names fall back to nearest and clamp.
    pub fn from_names(filter: &str, wrap: &str) -> Self {
        let filter = match filter {
            "linear" => FilterMode::Linear,
            "mipmap" => FilterMode::Mipmap,
            _ => FilterMode::Nearest,
        };
        let wrap = match wrap {
            "repeat" => WrapMode::Repeat,
            _ => WrapMode::Clamp,
        };
        Self { filter, wrap }
    }

    fn index(self) -> usize {
        self.filter as usize + self.wrap as usize * 3
    }

    fn desc(self) -> SamplerDesc {
        let (filter, mipmap_filter, max_lod) = match self.filter {
            FilterMode::Nearest => (Filter::Nearest, Filter::Nearest, 0.0),
            FilterMode::Linear => (Filter::Linear, Filter::Nearest, 0.0),
            FilterMode::Mipmap => (Filter::Linear, Filter::Linear, (MAX_MIP - 1) as f32),
        };
        let address_mode = match self.wrap {
            WrapMode::Clamp => AddressMode::ClampToEdge,
            WrapMode::Repeat => AddressMode::Repeat,
        };
        SamplerDesc {
            filter,
            mipmap_filter,
            address_mode,
            max_lod,
        }
    }
}

/// The six samplers every filter and wrap combination maps to.
pub struct SamplerSet {
    samplers: [SamplerId; 6],
}

impl SamplerSet {
    pub fn new<D: RenderDevice>(device: &mut D) -> Self {
        let mut samplers = [SamplerId::default(); 6];
        for filter in [FilterMode::Nearest, FilterMode::Linear, FilterMode::Mipmap] {
            for wrap in [WrapMode::Clamp, WrapMode::Repeat] {
                let spec = SamplerSpec { filter, wrap };
                samplers[spec.index()] = device.create_sampler(&spec.desc());
            }
        }
        Self { samplers }
    }

    pub fn get(&self, spec: SamplerSpec) -> SamplerId {
        self.samplers[spec.index()]
    }

    /// The sampler actually bound for `spec`.
    ///
    /// Static textures carry no mip chain, so a mipmap request on one binds the
    /// linear sampler of the same wrap mode.
    pub fn bind(&self, spec: SamplerSpec, is_static_texture: bool) -> SamplerId {
        if is_static_texture && spec.filter == FilterMode::Mipmap {
            self.get(SamplerSpec {
                filter: FilterMode::Linear,
                ..spec
            })
        } else {
            self.get(spec)
        }
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        for sampler in self.samplers {
            device.destroy_sampler(sampler);
        }
    }
}

/// What a channel reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputSource {
    /// Previous frame of the buffer pass at this index.
    Buffer { index: usize },
    /// Previous frame of the cube map pass at this index.
    Cube { index: usize },
    Keyboard,
    /// Texture cache slots.
    Texture { slot: usize },
    CubeTexture { slot: usize },
    VolumeTexture { slot: usize },
}

impl InputSource {
    /// Whether this reads a static texture owned by the texture cache.
    pub fn is_static_texture(self) -> bool {
        matches!(
            self,
            InputSource::Texture { .. }
                | InputSource::CubeTexture { .. }
                | InputSource::VolumeTexture { .. }
        )
    }

    pub fn view_dimension(self) -> ViewDimension {
        match self {
            InputSource::Cube { .. } | InputSource::CubeTexture { .. } => ViewDimension::Cube,
            InputSource::VolumeTexture { .. } => ViewDimension::D3,
            _ => ViewDimension::D2,
        }
    }
}

/// One bound channel of a pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Input {
    /// Channel slot, `0..CHANNEL_COUNT`.
    pub channel: usize,
    pub source: InputSource,
    /// The sampler bound at draw time.
    pub sampler: SamplerId,
    /// The sampler the description asked for.
    pub requested: SamplerSpec,
}

/// One compiled shader stage.
pub struct Pass {
    pub name: String,
    pub kind: PassKind,
    /// Bound channels in declaration order, at most one per channel slot.
    pub inputs: Vec<Input>,
    pub pipeline: PipelineId,
    /// Set when another pass samples this one with a mipmap filter.
    pub needs_mipmap: bool,
    /// Double-buffered output. Unused by the image pass.
    pub feedback: PingPongImage,
}

impl Pass {
    pub fn new(name: impl Into<String>, kind: PassKind, pipeline: PipelineId) -> Self {
        let name = name.into();
        Self {
            feedback: PingPongImage::new(name.clone()),
            name,
            kind,
            inputs: Vec::new(),
            pipeline,
            needs_mipmap: false,
        }
    }

    pub fn input(&self, channel: usize) -> Option<&Input> {
        self.inputs.iter().find(|input| input.channel == channel)
    }
}

/// Every pass of one loaded description.
pub struct PassSet {
    pub buffers: Vec<Pass>,
    pub cubemaps: Vec<Pass>,
    pub image: Pass,
    /// Shared code prepended to every pass, before preprocessing.
    pub common: String,
}

impl PassSet {
    /// Buffer, cube map and image passes in draw order.
    pub fn passes(&self) -> impl Iterator<Item = &Pass> {
        self.buffers
            .iter()
            .chain(&self.cubemaps)
            .chain(std::iter::once(&self.image))
    }

    /// Flips every feedback image so last frame's output becomes this frame's history.
    pub fn swap_feedback(&mut self) {
        for pass in self.buffers.iter_mut().chain(&mut self.cubemaps) {
            pass.feedback.swap();
        }
    }

    /// Releases pipelines and feedback images.
    pub fn destroy<D: RenderDevice>(mut self, device: &mut D) {
        for pass in self
            .buffers
            .iter_mut()
            .chain(&mut self.cubemaps)
            .chain(std::iter::once(&mut self.image))
        {
            device.destroy_pipeline(pass.pipeline);
            pass.feedback.destroy(device);
        }
    }
}
