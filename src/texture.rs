//! Texture loading and caching for pass inputs.
//!
//! [`TextureCache`] owns every static image a pass set can sample: 2D textures and
//! cube maps loaded from disk, and procedurally generated noise volumes. Each distinct
//! source is decoded and uploaded once; later requests for the same source return the
//! cached image and its slot index.
//!
//! Loading never fails because of bad image data:
//!
//! - a 2D file that does not decode is uploaded as raw bytes in `Rgba32Uint` texels,
//!   which lets shaders read arbitrary binary data,
//! - a missing or empty file yields a zero-sized [`ImageFormat::Undefined`]
//!   placeholder,
//! - unreadable or non-square cube faces are skipped,
//! - anything wider or taller than the size limit becomes the placeholder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::{Command, ImageDesc, ImageFormat, ImageId, MAX_IMAGE_SIZE, RenderDevice};
use crate::error::Result;

/// Edge length of procedural noise volumes.
pub const VOLUME_SIZE: u32 = 32;

/// Volume id that ShaderToy serves as single channel noise.
const GRAY_VOLUME_ID: &str = "4sfGRr";

/// Texel size used when a file is uploaded as raw bytes.
const RAW_TEXEL_SIZE: usize = 16;
/// Row width of a raw byte upload, in texels.
const RAW_ROW_TEXELS: usize = 1024;

/// Turns encoded image bytes into RGBA8 pixels.
pub trait ImageDecoder {
    /// Returns `None` when `bytes` are not a supported image.
    fn decode(&self, bytes: &[u8]) -> Option<RgbaImage>;
}

/// [`ImageDecoder`] backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoder;

impl ImageDecoder for DefaultDecoder {
    fn decode(&self, bytes: &[u8]) -> Option<RgbaImage> {
        match image::load_from_memory(bytes) {
            Ok(img) => Some(img.to_rgba8()),
            Err(e) => {
                log::debug!("image decode failed: {e}");
                None
            }
        }
    }
}

/// Cache key. Kinds are kept apart so the same path can back both a 2D texture and a
/// cube map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureKey {
    Texture(String),
    Cube(String),
    Volume(String),
}

/// Path remapping applied before a texture path is resolved.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct PathRemap {
    pub from: String,
    pub to: String,
}

impl PathRemap {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Loads, deduplicates and owns the static textures of a pass set.
pub struct TextureCache {
    decoder: Rc<dyn ImageDecoder>,
    media_root: PathBuf,
    remaps: Vec<PathRemap>,
    entries: HashMap<TextureKey, (ImageId, usize)>,
    /// Images by slot.
    images: Vec<ImageId>,
    max_size: u32,
}

impl TextureCache {
    /// Creates an empty cache that resolves relative paths against `media_root`.
    pub fn new(media_root: impl Into<PathBuf>, remaps: Vec<PathRemap>) -> Self {
        Self {
            decoder: Rc::new(DefaultDecoder),
            media_root: media_root.into(),
            remaps,
            entries: HashMap::new(),
            images: Vec::new(),
            max_size: MAX_IMAGE_SIZE,
        }
    }

    /// Replaces the decoder used for 2D and cube textures.
    pub fn with_decoder(mut self, decoder: Rc<dyn ImageDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Lowers the largest accepted width or height. The device limit still applies.
    pub fn with_max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    /// An empty cache with the same settings and decoder.
    pub fn fresh(&self) -> Self {
        Self {
            decoder: Rc::clone(&self.decoder),
            media_root: self.media_root.clone(),
            remaps: self.remaps.clone(),
            entries: HashMap::new(),
            images: Vec::new(),
            max_size: self.max_size,
        }
    }

    /// Number of loaded images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// The image in `slot`.
    pub fn image(&self, slot: usize) -> Option<ImageId> {
        self.images.get(slot).copied()
    }

    /// Applies the path remaps and resolves the result against the media root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let mut path = path.to_owned();
        for remap in &self.remaps {
            path = path.replace(&remap.from, &remap.to);
        }
        let path = Path::new(&path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.media_root.join(path)
        }
    }

    /// Loads a 2D texture, flipped so that row 0 is the bottom of the image.
    pub fn load_texture<D: RenderDevice>(
        &mut self,
        device: &mut D,
        path: &str,
    ) -> Result<(ImageId, usize)> {
        let key = TextureKey::Texture(path.to_owned());
        if let Some(&entry) = self.entries.get(&key) {
            return Ok(entry);
        }

        let resolved = self.resolve(path);
        let (desc, data) = match std::fs::read(&resolved) {
            Ok(bytes) if bytes.is_empty() => {
                log::warn!("texture '{}' is empty", resolved.display());
                (ImageDesc::placeholder(path), None)
            }
            Ok(bytes) => match self.decoder.decode(&bytes) {
                Some(mut img) => {
                    image::imageops::flip_vertical_in_place(&mut img);
                    let desc =
                        ImageDesc::new_2d(path, ImageFormat::Rgba8Unorm, img.width(), img.height());
                    (desc, Some(img.into_raw()))
                }
                None => {
                    log::info!(
                        "'{}' is not an image, uploading {} raw bytes",
                        resolved.display(),
                        bytes.len()
                    );
                    let (desc, data) = raw_texels(path, bytes);
                    (desc, Some(data))
                }
            },
            Err(e) => {
                log::warn!("failed to read texture '{}': {e}", resolved.display());
                (ImageDesc::placeholder(path), None)
            }
        };

        let max_size = self.max_size.min(device.max_image_size());
        if desc.width > max_size || desc.height > max_size {
            log::warn!(
                "texture '{}' is {}x{}, larger than {max_size}",
                resolved.display(),
                desc.width,
                desc.height
            );
            return self.insert(device, key, &ImageDesc::placeholder(path), Vec::new());
        }
        let commands = data.map(|data| vec![(0, data)]).unwrap_or_default();
        self.insert(device, key, &desc, commands)
    }

    /// Loads a cube map from `<stem><ext>` and `<stem>_1<ext>` .. `<stem>_5<ext>`.
    ///
    /// Faces are not flipped. A face that fails to load, is not square, is over the size
    /// limit or differs in size from the first good face is skipped.
    pub fn load_cube_texture<D: RenderDevice>(
        &mut self,
        device: &mut D,
        path: &str,
    ) -> Result<(ImageId, usize)> {
        let key = TextureKey::Cube(path.to_owned());
        if let Some(&entry) = self.entries.get(&key) {
            return Ok(entry);
        }

        let first = self.resolve(path);
        let max_size = self.max_size.min(device.max_image_size());
        let mut size = None;
        let mut faces = Vec::new();
        for (layer, face_path) in cube_face_paths(&first).into_iter().enumerate() {
            let Some(img) = std::fs::read(&face_path)
                .ok()
                .and_then(|bytes| self.decoder.decode(&bytes))
            else {
                log::warn!("skipping cube face '{}'", face_path.display());
                continue;
            };
            let dims = img.dimensions();
            if dims.0 != dims.1 || dims.0 > max_size {
                log::warn!(
                    "skipping cube face '{}': {}x{} is not a square of at most {max_size}",
                    face_path.display(),
                    dims.0,
                    dims.1
                );
                continue;
            }
            match size {
                None => size = Some(dims),
                Some(expected) if expected != dims => {
                    log::warn!(
                        "cube face '{}' is {}x{}, expected {}x{}",
                        face_path.display(),
                        dims.0,
                        dims.1,
                        expected.0,
                        expected.1
                    );
                    continue;
                }
                Some(_) => {}
            }
            faces.push((layer as u32, img.into_raw()));
        }

        let desc = match size {
            Some((width, height)) => {
                ImageDesc::new_2d(path, ImageFormat::Rgba8Unorm, width, height).with_layers(6)
            }
            None => ImageDesc::placeholder(path),
        };
        self.insert(device, key, &desc, faces)
    }

    /// Builds the deterministic noise volume for a ShaderToy volume id.
    ///
    /// No file is read. The same id always produces the same bytes.
    pub fn load_volume_texture<D: RenderDevice>(
        &mut self,
        device: &mut D,
        id: &str,
    ) -> Result<(ImageId, usize)> {
        let key = TextureKey::Volume(id.to_owned());
        if let Some(&entry) = self.entries.get(&key) {
            return Ok(entry);
        }

        let (desc, data) = noise_volume(id);
        self.insert(device, key, &desc, vec![(0, data)])
    }

    /// Destroys every cached image.
    pub fn clear<D: RenderDevice>(&mut self, device: &mut D) {
        for image in self.images.drain(..) {
            device.destroy_image(image);
        }
        self.entries.clear();
    }

    /// Creates the image, uploads `layers` in one waited submission and records the
    /// entry.
    fn insert<D: RenderDevice>(
        &mut self,
        device: &mut D,
        key: TextureKey,
        desc: &ImageDesc,
        layers: Vec<(u32, Vec<u8>)>,
    ) -> Result<(ImageId, usize)> {
        let image = device.create_image(desc)?;
        if !layers.is_empty() {
            let commands: Vec<Command> = layers
                .into_iter()
                .map(|(layer, data)| Command::WriteImage { image, layer, data })
                .collect();
            if let Err(e) = device.submit_and_wait(&commands) {
                device.destroy_image(image);
                return Err(e);
            }
        }

        let slot = self.images.len();
        self.images.push(image);
        self.entries.insert(key, (image, slot));
        log::debug!(
            "loaded texture '{}' ({}x{}x{} {:?}) into slot {slot}",
            desc.name,
            desc.width,
            desc.height,
            desc.depth_or_layers,
            desc.format
        );
        Ok((image, slot))
    }
}

/// Packs arbitrary bytes into `Rgba32Uint` texels, up to 1024 per row, zero padded.
fn raw_texels(name: &str, mut bytes: Vec<u8>) -> (ImageDesc, Vec<u8>) {
    let texels = bytes.len().div_ceil(RAW_TEXEL_SIZE);
    let width = texels.min(RAW_ROW_TEXELS);
    let height = texels.div_ceil(RAW_ROW_TEXELS);
    bytes.resize(width * height * RAW_TEXEL_SIZE, 0);
    let desc = ImageDesc::new_2d(name, ImageFormat::Rgba32Uint, width as u32, height as u32);
    (desc, bytes)
}

/// `dir/stem.ext`, then `dir/stem_1.ext` .. `dir/stem_5.ext`.
fn cube_face_paths(first: &Path) -> Vec<PathBuf> {
    let stem = first
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = first
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut paths = vec![first.to_path_buf()];
    paths.extend((1..6).map(|i| first.with_file_name(format!("{stem}_{i}{ext}"))));
    paths
}

fn noise_volume(id: &str) -> (ImageDesc, Vec<u8>) {
    let (channels, format, name) = if id == GRAY_VOLUME_ID {
        (1, ImageFormat::R8Unorm, "gray_rnd_volume")
    } else {
        (4, ImageFormat::Rgba8Unorm, "rgba_rnd_volume")
    };
    let len = (VOLUME_SIZE * VOLUME_SIZE * VOLUME_SIZE) as usize * channels;
    let mut rng = StdRng::seed_from_u64(xxhash_rust::xxh3::xxh3_64(id.as_bytes()));
    let data = (0..len).map(|_| rng.random::<u8>()).collect();
    let desc = ImageDesc::new_3d(name, format, VOLUME_SIZE, VOLUME_SIZE, VOLUME_SIZE);
    (desc, data)
}
