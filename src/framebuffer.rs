use crate::{
    depth::{DepthBuffer, DepthPrecision},
    device::{Device, DeviceAllocation},
};

use anyhow::Result;
use log::debug;

/// The output surface the kernel writes into: RGBA8 bytes with
/// the row stride padded to a power of two, so a presenter can
/// hand the buffer straight to a texture upload. Only
/// `width x height` pixels are ever written; the padding stays
/// zero. The optional depth image is tightly packed.
pub struct Framebuffer {
    width: usize,
    height: usize,
    tex_width: usize,
    color: Vec<u8>,
    depth: Option<DepthBuffer>,
    _color_memory: DeviceAllocation,
    _depth_memory: Option<DeviceAllocation>,
}

impl Framebuffer {
    pub fn new(
        device: &Device,
        width: usize,
        height: usize,
        precision: Option<DepthPrecision>,
    ) -> Result<Self> {
        let tex_width = width.next_power_of_two();
        let color_bytes = tex_width * height * 4;
        let color_memory = device.allocate(color_bytes as u64, "framebuffer")?;

        let depth_memory = match precision {
            Some(p) => Some(device.allocate(
                (width * height * p.bytes_per_pixel()) as u64,
                "depth buffer",
            )?),
            None => None,
        };

        debug!("Framebuffer allocated ({width}x{height}, row stride {tex_width}).");
        Ok(Self {
            width,
            height,
            tex_width,
            color: vec![0; color_bytes],
            depth: precision.map(|p| DepthBuffer::new(p, width * height)),
            _color_memory: color_memory,
            _depth_memory: depth_memory,
        })
    }

    /// Reallocates the color surface and the depth buffer for a
    /// new viewport or precision; a no-op when nothing changed.
    /// On failure the previous surface stays intact.
    pub fn resize(
        &mut self,
        device: &Device,
        width: usize,
        height: usize,
        precision: Option<DepthPrecision>,
    ) -> Result<()> {
        if width == self.width
            && height == self.height
            && precision == self.depth.as_ref().map(|d| d.precision())
        {
            return Ok(());
        }

        *self = Self::new(device, width, height, precision)?;
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row stride of the color surface, in pixels.
    pub fn tex_width(&self) -> usize {
        self.tex_width
    }

    pub fn color(&self) -> &[u8] {
        &self.color
    }

    pub fn depth(&self) -> Option<&DepthBuffer> {
        self.depth.as_ref()
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let offset = (y * self.tex_width + x) * 4;
        [
            self.color[offset],
            self.color[offset + 1],
            self.color[offset + 2],
            self.color[offset + 3],
        ]
    }

    /// Blacks out both surfaces, the image shown while the
    /// renderer is not viable.
    pub fn clear(&mut self) {
        self.color.fill(0);
        if let Some(depth) = &mut self.depth {
            depth.clear();
        }
    }

    pub(crate) fn put_pixel(&mut self, x: usize, y: usize, rgba: [u8; 4], depth: f32) {
        let offset = (y * self.tex_width + x) * 4;
        self.color[offset..offset + 4].copy_from_slice(&rgba);

        if let Some(buffer) = &mut self.depth {
            buffer.write(y * self.width + x, depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_stride_rounds_up_to_a_power_of_two() {
        let device = Device::with_budget(1 << 24).unwrap();
        let fb = Framebuffer::new(&device, 100, 10, None).unwrap();

        assert_eq!(fb.tex_width(), 128);
        assert_eq!(fb.color().len(), 128 * 10 * 4);
    }

    #[test]
    fn resize_reallocates_color_and_depth() {
        let device = Device::with_budget(1 << 24).unwrap();
        let mut fb = Framebuffer::new(&device, 64, 64, None).unwrap();
        assert_eq!(device.used(), 64 * 64 * 4);

        fb.resize(&device, 128, 32, Some(DepthPrecision::U16))
            .unwrap();
        assert_eq!(fb.width(), 128);
        assert_eq!(fb.depth().unwrap().len(), 128 * 32);
        assert_eq!(device.used(), (128 * 32 * 4 + 128 * 32 * 2) as u64);
    }

    #[test]
    fn writes_land_at_the_strided_offset() {
        let device = Device::with_budget(1 << 24).unwrap();
        let mut fb = Framebuffer::new(&device, 100, 4, Some(DepthPrecision::U8)).unwrap();

        fb.put_pixel(99, 2, [1, 2, 3, 4], 0.5);
        assert_eq!(fb.pixel(99, 2), [1, 2, 3, 4]);
        assert_eq!(fb.color()[(2 * 128 + 99) * 4], 1);
        assert!((fb.depth().unwrap().read_normalized(2 * 100 + 99) - 0.5).abs() < 1.0 / 255.0);
    }
}
