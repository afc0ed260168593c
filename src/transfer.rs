use crate::{device::Device, texture::Tex1d};

use anyhow::{ensure, Result};
use glam::Vec4;
use log::{debug, info};

/// Table lengths per voxel format: one entry per 8-bit scalar,
/// and one per 12-bit reading for 16-bit volumes.
pub const TABLE_SIZE_8BIT: usize = 256;
pub const TABLE_SIZE_16BIT: usize = 4096;

/// The pre-classified transfer function: a 1-D RGBA texture
/// mapping a normalized scalar to color and opacity at the
/// reference step. Linear filtering, clamp addressing.
pub struct TransferFunction {
    device: Device,
    table: Tex1d,
}

impl TransferFunction {
    pub fn table_size(bpc: u8) -> usize {
        if bpc == 2 {
            TABLE_SIZE_16BIT
        } else {
            TABLE_SIZE_8BIT
        }
    }

    /// Starts as a grayscale identity ramp, so a fresh renderer
    /// produces sensible images before the first edit arrives.
    pub fn new(device: &Device, bpc: u8) -> Result<Self> {
        let n = Self::table_size(bpc);
        let ramp = (0..n)
            .map(|i| {
                let t = i as f32 / (n - 1) as f32;
                Vec4::new(t, t, t, t)
            })
            .collect();

        let table = Tex1d::new(device, ramp, "transfer function")?;
        info!("Transfer function table created ({n} entries).");

        Ok(Self {
            device: device.clone(),
            table,
        })
    }

    /// Replaces the whole table. The renderer resolves updates
    /// between kernel launches, never during one, so a launch
    /// always sees either the old table or the new one.
    pub fn recompute(&mut self, lut: &[[f32; 4]]) -> Result<()> {
        ensure!(
            lut.len() == self.table.len(),
            "transfer function has {} entries, the table holds {}",
            lut.len(),
            self.table.len(),
        );

        let texels = lut.iter().map(|c| Vec4::from_array(*c)).collect();
        self.table = Tex1d::new(&self.device, texels, "transfer function")?;
        debug!("Transfer function reuploaded ({} entries).", lut.len());

        Ok(())
    }

    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Classifies a normalized scalar into RGBA.
    pub fn classify(&self, scalar: f32) -> Vec4 {
        self.table.sample(scalar)
    }

    /// Raw opacity of one table entry, used by the skipping
    /// grid to test whole scalar ranges.
    pub fn alpha_at(&self, index: usize) -> f32 {
        self.table.fetch(index).w
    }
}
