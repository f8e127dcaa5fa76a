//! Per-frame recording of a compiled pass set.
//!
//! A [`FrameGraph`] is the ordered list of work for one frame. It is built once per
//! pass set and surface size, then replayed every frame:
//!
//! ```text
//! UploadUniforms ─▶ UploadKeyboard ─▶ Buffer 0 ─▶ (mips) ─▶ ... ─▶ Cube 0 (6 faces) ─▶ ...
//!                                                                           │
//!                                            Compose ◀─ (mips) ◀─ Image ◀──┘
//! ```
//!
//! Every buffer and cube map pass owns a [`PingPongImage`]. Passes write their
//! output image and sample the history image of whatever pass they reference, so a
//! reader always sees the previous frame regardless of pass order. Swapping the pairs
//! between frames advances the history without copying and without rebuilding the
//! graph.
//!
//! # Example
//!
//! ```ignore
//! let graph = FrameGraph::builder()
//!     .surface_size(width, height)
//!     .build(&mut device, &mut passes)?;
//!
//! loop {
//!     passes.swap_feedback();
//!     graph.execute(&mut device, &passes, &textures, &input, &keyboard)?;
//! }
//! ```

mod graph;
mod ping_pong;
mod task;

pub use graph::{DEFAULT_CUBE_FACE_SIZE, FrameGraph, FrameGraphBuilder};
pub use ping_pong::PingPongImage;
pub use task::{ChannelRef, DrawTask, ImageRef, Task};
