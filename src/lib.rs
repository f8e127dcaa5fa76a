//! # toyframe
//!
//! **ShaderToy shaders on the desktop, on wgpu.**
//!
//! A ShaderToy JSON description (buffer, cube map, common and image passes with their
//! channel inputs) is compiled into a set of GPU pipelines and replayed every frame
//! with the usual uniforms: `iTime`, `iFrame`, `iMouse`, `iDate`, the keyboard
//! texture and last frame's output of every buffer.
//!
//! ## Quick Start
//!
//! ```no_run
//! use toyframe::ViewerConfig;
//!
//! fn main() -> toyframe::Result<()> {
//!     toyframe::run(ViewerConfig::new().title("Seascape").shader("seascape.json"))
//! }
//! ```
//!
//! ## Layers
//!
//! - [`PassGraphCompiler`] turns a [`ShaderDescription`] into a [`PassSet`]: pipelines,
//!   resolved channel bindings and feedback images.
//! - [`FrameGraph`] records one frame of work for a pass set at a surface size and
//!   replays it, resolving feedback images through their current ping-pong state.
//! - [`Viewer`] owns both plus the clock and input state, and handles reloads.
//! - [`RenderDevice`] is the seam to the GPU. [`GpuContext`] implements it on wgpu.

mod app;
mod compiler;
mod config;
mod description;
mod device;
mod error;
mod gpu;
mod input;
mod pass;
mod preprocess;
mod render_graph;
mod texture;
mod uniforms;
mod viewer;

#[cfg(test)]
mod testing;

pub use app::run;
pub use compiler::PassGraphCompiler;
pub use config::ViewerConfig;
pub use description::{
    Document, InputDesc, InputType, OutputDesc, PassDesc, PassType, ResourceId, SamplerNames,
    ShaderDescription, parse_document, write_export,
};
pub use device::{
    AddressMode, BufferDesc, BufferId, CHANNEL_COUNT, ChannelBinding, ChannelLayout, Command,
    DrawCommand, Filter, ImageDesc, ImageDimension, ImageFormat, ImageId, MAX_IMAGE_SIZE, MAX_MIP,
    PipelineDesc, PipelineId, Rect, RenderDevice, SampleKind, SamplerDesc, SamplerId,
    ViewDimension, full_mip_count,
};
pub use error::{Error, Result};
pub use gpu::GpuContext;
pub use input::{Input, KeyboardState, MouseState, js_key_code};
pub use pass::{
    BUFFER_FORMAT, CUBE_FORMAT, FilterMode, Input as PassInput, InputSource, Pass, PassKind,
    PassSet, SamplerSet, SamplerSpec, VIEWPORT_FORMAT, WrapMode,
};
pub use preprocess::{rewrite, unescape_newlines};
pub use render_graph::{
    ChannelRef, DEFAULT_CUBE_FACE_SIZE, DrawTask, FrameGraph, FrameGraphBuilder, ImageRef,
    PingPongImage, Task,
};
pub use texture::{DefaultDecoder, ImageDecoder, PathRemap, TextureCache, TextureKey};
pub use uniforms::{FrameClock, GpuInput, SAMPLE_RATE, local_date};
pub use viewer::{Loaded, Viewer};

// Re-export commonly used winit types for convenience
pub use winit::event::MouseButton;
pub use winit::keyboard::KeyCode;
