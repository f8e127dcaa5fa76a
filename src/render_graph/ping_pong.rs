//! Double-buffered feedback images.

use crate::device::{Command, ImageDesc, ImageId, RenderDevice};
use crate::error::Result;

struct Slots {
    images: [ImageId; 2],
    /// Index into `images` of the image receiving the current frame.
    output: usize,
    desc: ImageDesc,
}

/// A pair of images whose roles alternate every frame.
///
/// A pass renders into [`output`](Self::output) while any pass reading it samples
/// [`history`](Self::history), the image written one frame earlier. [`swap`](Self::swap)
/// exchanges the roles without copying.
///
/// The physical images are named `<name>_a` and `<name>_b` and are created on the
/// first [`get`](Self::get).
///
/// ```text
/// frame N:    output = A   history = B
/// swap
/// frame N+1:  output = B   history = A   (A holds frame N)
/// ```
pub struct PingPongImage {
    name: String,
    slots: Option<Slots>,
}

impl PingPongImage {
    /// Creates an empty pair. Nothing is allocated until [`get`](Self::get).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: None,
        }
    }

    /// Allocates both images from `desc` if needed and returns `(output, history)`.
    ///
    /// `desc.name` is ignored. Calling again returns the existing images even if
    /// `desc` differs; use [`resize`](Self::resize) to change the extent.
    pub fn get<D: RenderDevice>(&mut self, device: &mut D, desc: &ImageDesc) -> Result<(ImageId, ImageId)> {
        if let Some(slots) = &self.slots {
            return Ok((slots.images[slots.output], slots.images[1 - slots.output]));
        }

        let mut desc = desc.clone();
        desc.name = format!("{}_a", self.name);
        let a = device.create_image(&desc)?;
        desc.name = format!("{}_b", self.name);
        let b = match device.create_image(&desc) {
            Ok(b) => b,
            Err(e) => {
                device.destroy_image(a);
                return Err(e);
            }
        };
        desc.name = self.name.clone();
        log::debug!(
            "allocated feedback '{}' at {}x{}",
            self.name,
            desc.width,
            desc.height
        );
        self.slots = Some(Slots {
            images: [a, b],
            output: 0,
            desc,
        });
        Ok((a, b))
    }

    /// Exchanges output and history.
    pub fn swap(&mut self) {
        if let Some(slots) = &mut self.slots {
            slots.output = 1 - slots.output;
        }
    }

    pub fn output(&self) -> Option<ImageId> {
        self.slots.as_ref().map(|s| s.images[s.output])
    }

    pub fn history(&self) -> Option<ImageId> {
        self.slots.as_ref().map(|s| s.images[1 - s.output])
    }

    /// Width and height once allocated.
    pub fn extent(&self) -> Option<(u32, u32)> {
        self.slots.as_ref().map(|s| (s.desc.width, s.desc.height))
    }

    pub fn desc(&self) -> Option<&ImageDesc> {
        self.slots.as_ref().map(|s| &s.desc)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reallocates at the extent of `desc`, keeping content.
    ///
    /// The overlapping top-left rectangle of the current history is copied into the
    /// new output and waited on, then the old pair is destroyed. After the next swap
    /// the preserved content is what readers see as history.
    pub fn resize<D: RenderDevice>(&mut self, device: &mut D, desc: &ImageDesc) -> Result<()> {
        let Some(old_history) = self.history() else {
            self.get(device, desc)?;
            return Ok(());
        };
        let (old_w, old_h) = self.extent().unwrap_or_default();

        let mut resized = PingPongImage::new(self.name.clone());
        let (new_output, _) = resized.get(device, desc)?;
        let copy = Command::CopyRegion {
            src: old_history,
            dst: new_output,
            width: old_w.min(desc.width),
            height: old_h.min(desc.height),
        };
        if let Err(e) = device.submit_and_wait(&[copy]) {
            resized.destroy(device);
            return Err(e);
        }

        log::debug!(
            "resized feedback '{}' {old_w}x{old_h} -> {}x{}",
            self.name,
            desc.width,
            desc.height
        );
        self.destroy(device);
        *self = resized;
        Ok(())
    }

    /// Destroys both images. The pair can be allocated again with [`get`](Self::get).
    pub fn destroy<D: RenderDevice>(&mut self, device: &mut D) {
        if let Some(slots) = self.slots.take() {
            for image in slots.images {
                device.destroy_image(image);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ImageFormat;
    use crate::testing::RecordingDevice;

    fn desc(width: u32, height: u32) -> ImageDesc {
        ImageDesc::new_2d("ignored", ImageFormat::Rgba8Unorm, width, height)
    }

    #[test]
    fn get_is_lazy_and_idempotent() {
        let mut device = RecordingDevice::new();
        let mut pair = PingPongImage::new("Buffer A");
        assert!(pair.output().is_none());

        let (out, hist) = pair.get(&mut device, &desc(4, 4)).unwrap();
        assert_ne!(out, hist);
        assert_eq!(pair.get(&mut device, &desc(8, 8)).unwrap(), (out, hist));
        assert_eq!(device.live_images(), 2);
        assert_eq!(device.image_desc(out).unwrap().name, "Buffer A_a");
        assert_eq!(device.image_desc(hist).unwrap().name, "Buffer A_b");
    }

    #[test]
    fn swap_alternates_roles() {
        let mut device = RecordingDevice::new();
        let mut pair = PingPongImage::new("p");
        let (a, b) = pair.get(&mut device, &desc(2, 2)).unwrap();

        pair.swap();
        assert_eq!((pair.output(), pair.history()), (Some(b), Some(a)));
        pair.swap();
        assert_eq!((pair.output(), pair.history()), (Some(a), Some(b)));
    }

    #[test]
    fn resize_preserves_overlap() {
        let mut device = RecordingDevice::new();
        let mut pair = PingPongImage::new("p");
        let (_, history) = pair.get(&mut device, &desc(100, 100)).unwrap();

        let pattern: Vec<u8> = (0..100 * 100)
            .flat_map(|i: u32| [(i % 251) as u8, (i / 251) as u8, 7, 255])
            .collect();
        device
            .submit(&[Command::WriteImage {
                image: history,
                layer: 0,
                data: pattern.clone(),
            }])
            .unwrap();

        pair.resize(&mut device, &desc(50, 200)).unwrap();
        assert_eq!(pair.extent(), Some((50, 200)));
        assert_eq!(device.live_images(), 2);
        assert!(device.image_desc(history).is_none());
        assert_eq!(device.wait_count, 1);

        pair.swap();
        let texels = device.texels(pair.history().unwrap(), 0).unwrap();
        for y in 0..100 {
            for x in 0..50 {
                let old = (y * 100 + x) * 4;
                let new = (y * 50 + x) * 4;
                assert_eq!(texels[new..new + 4], pattern[old..old + 4], "texel {x},{y}");
            }
        }
        // Rows below the old extent start out empty.
        assert!(texels[100 * 50 * 4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn resize_unallocated_just_allocates() {
        let mut device = RecordingDevice::new();
        let mut pair = PingPongImage::new("p");
        pair.resize(&mut device, &desc(3, 3)).unwrap();
        assert_eq!(pair.extent(), Some((3, 3)));
        assert_eq!(device.wait_count, 0);
    }

    #[test]
    fn destroy_releases_both() {
        let mut device = RecordingDevice::new();
        let mut pair = PingPongImage::new("p");
        pair.get(&mut device, &desc(1, 1)).unwrap();
        pair.destroy(&mut device);
        assert_eq!(device.live_images(), 0);
        assert!(pair.extent().is_none());
    }
}
