use crate::{device::Device, texture::Tex1d};

use anyhow::Result;
use glam::{Vec3, Vec4};
use log::info;
use rand::Rng;

/// Number of random offsets in the table.
pub const NUM_RAND_VECS: usize = 8192;

/// Start-position dither offsets that break up slice aliasing.
/// Generated once at construction so the noise pattern stays
/// coherent across frames; the alpha lane is padding and never
/// read.
pub struct JitterTable {
    table: Tex1d,
}

impl JitterTable {
    pub fn new(device: &Device, rng: &mut impl Rng) -> Result<Self> {
        let texels = (0..NUM_RAND_VECS)
            .map(|_| {
                Vec4::new(
                    rng.gen::<f32>() * 2.0,
                    rng.gen::<f32>() * 2.0,
                    rng.gen::<f32>() * 2.0,
                    0.0,
                )
            })
            .collect();

        let table = Tex1d::new(device, texels, "jitter table")?;
        info!("Jitter table created ({NUM_RAND_VECS} offsets).");

        Ok(Self { table })
    }

    /// The offset for one pixel; rays share entries modulo the
    /// table length.
    pub fn offset(&self, pixel_index: usize) -> Vec3 {
        self.table.fetch(pixel_index % NUM_RAND_VECS).truncate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn offsets_are_in_range_and_repeat_modulo_the_table() {
        let device = Device::with_budget(1 << 20).unwrap();
        let table = JitterTable::new(&device, &mut StdRng::seed_from_u64(7)).unwrap();

        for i in 0..256 {
            let offset = table.offset(i);
            assert!(offset.min_element() >= 0.0);
            assert!(offset.max_element() < 2.0);
        }

        assert_eq!(table.offset(3), table.offset(3 + NUM_RAND_VECS));
    }
}
