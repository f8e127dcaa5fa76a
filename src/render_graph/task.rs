//! The recorded units of one frame.

use crate::device::{CHANNEL_COUNT, PipelineId, Rect, SamplerId, ViewDimension};

/// An image named by its role rather than its physical id.
///
/// Feedback images swap roles every frame, so tasks keep these references and the
/// graph resolves them against the pass set at execution time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageRef {
    /// Image receiving this frame's output of buffer pass `i`.
    PassOutput(usize),
    /// Last frame's output of buffer pass `i`.
    PassHistory(usize),
    CubeOutput(usize),
    CubeHistory(usize),
    /// Texture cache slot.
    Texture(usize),
    Keyboard,
    /// The image pass target, presented at the end of the frame.
    Viewport,
}

/// A channel binding in logical form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelRef {
    pub image: ImageRef,
    pub dimension: ViewDimension,
    pub sampler: SamplerId,
}

/// A full-screen draw of one pass.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawTask {
    pub pass: String,
    pub pipeline: PipelineId,
    pub target: ImageRef,
    /// 1 for 2D targets, 6 for cube targets (one draw per face).
    pub layers: u32,
    pub channels: [Option<ChannelRef>; CHANNEL_COUNT],
}

#[derive(Clone, Debug, PartialEq)]
pub enum Task {
    /// Upload the frame's `GpuInput` into the graph's uniform buffer.
    UploadUniforms,
    /// Upload the current keyboard rows.
    UploadKeyboard,
    Draw(DrawTask),
    /// Generate mip `level + 1` of `image` from mip `level`.
    Mip { image: ImageRef, level: u32 },
    /// Present `source` to the surface, into `rect` if set.
    Compose { source: ImageRef, rect: Option<Rect> },
}
