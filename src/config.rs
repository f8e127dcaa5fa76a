//! Viewer configuration.
//!
//! Built in code with the builder methods, or loaded from a JSON file where every
//! field is optional:
//!
//! ```json
//! {
//!   "title": "toyframe",
//!   "width": 1280,
//!   "height": 720,
//!   "media_root": "/home/me/shadertoy",
//!   "remaps": [{ "from": "/media/a/", "to": "media/images/" }],
//!   "compose_rect": { "x": 0, "y": 0, "width": 640, "height": 360 }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::device::Rect;
use crate::error::{Error, Result};
use crate::render_graph::DEFAULT_CUBE_FACE_SIZE;
use crate::texture::PathRemap;

/// Configuration for the viewer window and shader loading.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    /// Directory texture paths are resolved against.
    pub media_root: PathBuf,
    /// Prefix rewrites applied to texture paths, in order.
    pub remaps: Vec<PathRemap>,
    /// Edge length of cube map pass faces.
    pub cube_face_size: u32,
    /// Part of the window the image pass is presented into. Whole window when unset.
    pub compose_rect: Option<Rect>,
    /// Description loaded at startup.
    pub shader: Option<PathBuf>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            title: "toyframe".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
            media_root: PathBuf::from("."),
            remaps: vec![PathRemap::new("/media/a/", "media/images/")],
            cube_face_size: DEFAULT_CUBE_FACE_SIZE,
            compose_rect: None,
            shader: None,
        }
    }
}

impl ViewerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config = serde_json::from_str(&text)?;
        log::debug!("read config {}", path.display());
        Ok(config)
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn fullscreen(mut self, fullscreen: bool) -> Self {
        self.fullscreen = fullscreen;
        self
    }

    pub fn media_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.media_root = root.into();
        self
    }

    /// Adds a path remap after the existing ones.
    pub fn remap(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.remaps.push(PathRemap::new(from, to));
        self
    }

    pub fn cube_face_size(mut self, size: u32) -> Self {
        self.cube_face_size = size.max(1);
        self
    }

    pub fn compose_rect(mut self, rect: Option<Rect>) -> Self {
        self.compose_rect = rect;
        self
    }

    pub fn shader(mut self, path: impl Into<PathBuf>) -> Self {
        self.shader = Some(path.into());
        self
    }
}
