use crate::{
    device::Device, texture::Tex3d, transfer::TransferFunction, volume::VolumeDescriptor,
};

use anyhow::Result;
use log::{debug, info};

/// Default cell resolution of the skipping grid.
pub const DEFAULT_GRID: (usize, usize, usize) = (16, 16, 16);

/// Coarse min/max grid over an 8-bit volume. The scalar ranges
/// are scanned once per volume; whenever the transfer function
/// changes they are collapsed into a boolean texture of "cell
/// is fully transparent" flags the kernel steps over.
pub struct SkipGrid {
    device: Device,
    grid: (usize, usize, usize),
    cell_min: Vec<u8>,
    cell_max: Vec<u8>,
    flags: Option<Tex3d<bool>>,
}

impl SkipGrid {
    /// Scans the voxels and records each cell's scalar range.
    /// Cells partition the volume evenly; the last cell along
    /// every axis absorbs the remainder when the voxel count
    /// does not divide.
    pub fn build(device: Device, desc: &VolumeDescriptor, voxels: &[u8]) -> Self {
        let (nx, ny, nz) = desc.size;
        let grid = (
            DEFAULT_GRID.0.min(nx),
            DEFAULT_GRID.1.min(ny),
            DEFAULT_GRID.2.min(nz),
        );
        let (gx, gy, gz) = grid;
        let (sx, sy, sz) = (nx / gx, ny / gy, nz / gz);

        let mut cell_min = vec![u8::MAX; gx * gy * gz];
        let mut cell_max = vec![u8::MIN; gx * gy * gz];

        for z in 0..nz {
            let cz = (z / sz).min(gz - 1);
            for y in 0..ny {
                let cy = (y / sy).min(gy - 1);
                for x in 0..nx {
                    let cx = (x / sx).min(gx - 1);

                    let v = voxels[(z * ny + y) * nx + x];
                    let c = (cz * gy + cy) * gx + cx;
                    cell_min[c] = cell_min[c].min(v);
                    cell_max[c] = cell_max[c].max(v);
                }
            }
        }

        info!("Space-skipping grid built ({gx}x{gy}x{gz} cells).");
        Self {
            device,
            grid,
            cell_min,
            cell_max,
            flags: None,
        }
    }

    /// Collapses the scalar ranges against the current transfer
    /// function: a cell is skippable iff every scalar it spans
    /// maps to zero opacity.
    pub fn collapse(&mut self, transfer: &TransferFunction) -> Result<()> {
        let flags: Vec<bool> = self
            .cell_min
            .iter()
            .zip(&self.cell_max)
            .map(|(&lo, &hi)| (lo..=hi).all(|s| transfer.alpha_at(s as usize) == 0.0))
            .collect();

        let skippable = flags.iter().filter(|&&f| f).count();
        self.flags = Some(Tex3d::new(&self.device, self.grid, flags, "skip flags")?);
        debug!(
            "Skip flags rebuilt: {skippable}/{} cells transparent.",
            self.cell_min.len(),
        );

        Ok(())
    }

    /// The boolean texture of the last collapse, if any.
    pub fn flags(&self) -> Option<&Tex3d<bool>> {
        self.flags.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::{Filter, Sampler};
    use glam::Vec3;

    fn descriptor(size: (usize, usize, usize)) -> VolumeDescriptor {
        VolumeDescriptor {
            size,
            bpc: 1,
            extent: Vec3::splat(2.0),
            position: Vec3::ZERO,
        }
    }

    #[test]
    fn cell_ranges_cover_their_voxels() {
        let device = Device::with_budget(1 << 20).unwrap();

        // 32 voxels along x, value equals the x index; the grid
        // clamps to 16x1x1 cells of two voxels each
        let desc = descriptor((32, 1, 1));
        let voxels = (0u8..32).collect::<Vec<_>>();
        let grid = SkipGrid::build(device, &desc, &voxels);

        assert_eq!(grid.grid, (16, 1, 1));
        assert_eq!(grid.cell_min[0], 0);
        assert_eq!(grid.cell_max[0], 1);
        assert_eq!(grid.cell_min[15], 30);
        assert_eq!(grid.cell_max[15], 31);
    }

    #[test]
    fn trailing_cells_absorb_the_remainder() {
        let device = Device::with_budget(1 << 20).unwrap();

        // 35 voxels over 16 cells: two voxels per cell, the
        // last takes five
        let desc = descriptor((35, 1, 1));
        let voxels = (0u8..35).collect::<Vec<_>>();
        let grid = SkipGrid::build(device, &desc, &voxels);

        assert_eq!(grid.cell_min[15], 30);
        assert_eq!(grid.cell_max[15], 34);
    }

    #[test]
    fn collapse_marks_fully_transparent_cells() {
        let device = Device::with_budget(1 << 20).unwrap();

        // left half zeros, right half opaque values
        let desc = descriptor((32, 1, 1));
        let voxels = (0..32).map(|x| if x < 16 { 0u8 } else { 200 }).collect::<Vec<_>>();
        let mut grid = SkipGrid::build(device.clone(), &desc, &voxels);

        // opacity only above scalar 100
        let mut lut = vec![[0.0f32; 4]; 256];
        for entry in lut.iter_mut().skip(100) {
            entry[3] = 1.0;
        }
        let mut tf = TransferFunction::new(&device, 1).unwrap();
        tf.recompute(&lut).unwrap();

        grid.collapse(&tf).unwrap();
        let flags = grid.flags().unwrap();
        let nearest = Sampler {
            filter: Filter::Nearest,
        };

        // cells in the zero half are skippable, the rest are not
        assert_eq!(flags.sample(nearest, Vec3::new(0.1, 0.5, 0.5)), 1.0);
        assert_eq!(flags.sample(nearest, Vec3::new(0.9, 0.5, 0.5)), 0.0);
    }
}
