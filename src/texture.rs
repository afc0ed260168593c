use crate::device::{Device, DeviceAllocation};

use anyhow::{ensure, Result};
use glam::{Vec3, Vec4};

/// Filtering mode of a sampler: nearest picks the closest
/// texel, linear blends the neighboring ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

/// Sampler state, passed explicitly next to every texture
/// instead of living in a process-wide binding table. A sampler
/// describes how stored texels turn into a value at an
/// arbitrary coordinate, through a few parameters:
/// - Filtering: when a coordinate falls between texel centers,
///   NEAREST snaps to the single closest texel, keeping hard
///   cell boundaries visible. That is the right choice for
///   unsmoothed voxel data, and the only correct choice for
///   boolean flag textures, where blending two flags would
///   manufacture an in-between value that means nothing.
///   LINEAR blends the surrounding texels in proportion to the
///   distance from their centers, which is what a continuous
///   scalar field wants.
/// - Addressing: what happens to coordinates outside [0,1].
///   Samplers in general offer REPEAT (wrap around, tiling the
///   texture), MIRRORED_REPEAT (wrap and flip), CLAMP_TO_EDGE
///   (extend the border texel outwards) and CLAMP_TO_BORDER (a
///   fixed border color). A ray caster wants clamp-to-edge on
///   every axis: sample positions routinely land just outside
///   the volume after the ray entry distance is snapped onto
///   the step grid, and a wrapping mode would bleed the
///   opposite face of the volume into the boundary. Extending
///   the border texel is the correct continuation of the
///   field, so clamp-to-edge is the one mode implemented here.
/// - Coordinates: normalized to [0,1] along each axis, so the
///   code sampling a texture never has to know its resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sampler {
    pub filter: Filter,
}

/// A scalar texel read back as a normalized float. This is how
/// a device reads "normalized integer" texture formats: the
/// stored integer is divided by the type's maximum, so an
/// 8-bit 255 and a 16-bit 65535 both sample as 1.0 and the
/// kernel never learns the storage width.
pub trait Texel: Copy + Send + Sync {
    fn to_f32(self) -> f32;
}

impl Texel for u8 {
    fn to_f32(self) -> f32 {
        self as f32 / 255.0
    }
}

impl Texel for u16 {
    fn to_f32(self) -> f32 {
        self as f32 / 65535.0
    }
}

// Boolean flags read as 0 or 1; sampled with nearest filtering,
// a comparison against 0.5 recovers the stored flag exactly.
impl Texel for bool {
    fn to_f32(self) -> f32 {
        if self {
            1.0
        } else {
            0.0
        }
    }
}

/// A 1-D RGBA texture, the shape of every lookup table in the
/// renderer: the transfer function is classified through one,
/// and the jitter offsets are stored in one. `sample` performs
/// the filtered read a device would, `fetch` is raw indexed
/// access for host-side table scans.
pub struct Tex1d {
    texels: Vec<Vec4>,
    _memory: DeviceAllocation,
}

impl Tex1d {
    pub fn new(device: &Device, texels: Vec<Vec4>, what: &'static str) -> Result<Self> {
        ensure!(!texels.is_empty(), "{what}: a texture needs at least one texel");

        // The allocation guard keeps the table's footprint
        // accounted against the device budget for as long as
        // the texture lives.
        let bytes = (texels.len() * std::mem::size_of::<Vec4>()) as u64;
        let memory = device.allocate(bytes, what)?;

        Ok(Self {
            texels,
            _memory: memory,
        })
    }

    pub fn len(&self) -> usize {
        self.texels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texels.is_empty()
    }

    /// Raw texel access with a clamped index.
    pub fn fetch(&self, index: usize) -> Vec4 {
        self.texels[index.min(self.texels.len() - 1)]
    }

    /// Filtered lookup at a normalized coordinate. The texel
    /// centers of an n-entry table sit at (i + 0.5) / n, which
    /// means coordinate 0.0 lies half a texel before the first
    /// center and 1.0 half a texel past the last; subtracting
    /// 0.5 below moves from coordinate space into that
    /// center-relative space. The two nearest entries are then
    /// blended by the fractional distance between their
    /// centers. Clamping both indices into the table makes the
    /// outer half texel on each end read as a constant, which
    /// is precisely the clamp-to-edge rule in one dimension.
    pub fn sample(&self, u: f32) -> Vec4 {
        let n = self.texels.len();
        let x = u.clamp(0.0, 1.0) * n as f32 - 0.5;
        let x0 = x.floor();
        let frac = x - x0;

        let i0 = (x0 as isize).clamp(0, n as isize - 1) as usize;
        let i1 = (x0 as isize + 1).clamp(0, n as isize - 1) as usize;

        self.texels[i0].lerp(self.texels[i1], frac)
    }
}

/// A 3-D scalar texture in x-fastest-z-slowest order: the voxel
/// at (x, y, z) lives at index (z*ny + y)*nx + x. The volume
/// frames and the space-skipping flags are stored here, each
/// behind the element type its data actually has.
#[derive(Debug)]
pub struct Tex3d<T: Texel> {
    size: (usize, usize, usize),
    texels: Vec<T>,
    _memory: DeviceAllocation,
}

impl<T: Texel> Tex3d<T> {
    pub fn new(
        device: &Device,
        size: (usize, usize, usize),
        texels: Vec<T>,
        what: &'static str,
    ) -> Result<Self> {
        let (nx, ny, nz) = size;
        ensure!(
            nx > 0 && ny > 0 && nz > 0 && texels.len() == nx * ny * nz,
            "{what}: {} texels do not fill {nx}x{ny}x{nz}",
            texels.len(),
        );

        let bytes = (texels.len() * std::mem::size_of::<T>()) as u64;
        let memory = device.allocate(bytes, what)?;

        Ok(Self {
            size,
            texels,
            _memory: memory,
        })
    }

    pub fn size(&self) -> (usize, usize, usize) {
        self.size
    }

    // Integer texel access with clamp-to-edge addressing. All
    // out-of-range indices land on the border texels, which
    // also covers the cast results of non-finite coordinates
    // (they saturate to the index bounds instead of trapping),
    // so a ray fed garbage matrices reads border data rather
    // than aborting the launch.
    fn fetch(&self, x: isize, y: isize, z: isize) -> f32 {
        let (nx, ny, nz) = self.size;
        let x = x.clamp(0, nx as isize - 1) as usize;
        let y = y.clamp(0, ny as isize - 1) as usize;
        let z = z.clamp(0, nz as isize - 1) as usize;

        self.texels[(z * ny + y) * nx + x].to_f32()
    }

    /// Filtered lookup at a normalized coordinate.
    pub fn sample(&self, sampler: Sampler, tc: Vec3) -> f32 {
        let (nx, ny, nz) = self.size;

        match sampler.filter {
            // Nearest filtering scales the coordinate up to the
            // voxel lattice and truncates: whichever cell the
            // position falls into supplies the value unchanged.
            Filter::Nearest => self.fetch(
                (tc.x * nx as f32).floor() as isize,
                (tc.y * ny as f32).floor() as isize,
                (tc.z * nz as f32).floor() as isize,
            ),
            // Trilinear interpolation. The coordinate (shifted
            // by half a texel, as in the 1-D case, so that
            // texel centers become the lattice points) selects
            // the eight texels whose centers surround it, the
            // corners of one cell of the sampling lattice. The
            // result is the blend of those corners weighted by
            // the fractional position inside the cell, applied
            // one axis at a time: four lerps along x collapse
            // the cube to a face, two along y collapse the face
            // to an edge, and the last lerp along z produces
            // the value. This is exactly the filtering a 3-D
            // hardware sampler performs, which keeps a frame
            // rendered here comparable with one rendered on a
            // device.
            Filter::Linear => {
                let x = tc.x * nx as f32 - 0.5;
                let y = tc.y * ny as f32 - 0.5;
                let z = tc.z * nz as f32 - 0.5;

                let (x0, y0, z0) = (x.floor(), y.floor(), z.floor());
                let (fx, fy, fz) = (x - x0, y - y0, z - z0);
                let (xi, yi, zi) = (x0 as isize, y0 as isize, z0 as isize);

                let c000 = self.fetch(xi, yi, zi);
                let c100 = self.fetch(xi + 1, yi, zi);
                let c010 = self.fetch(xi, yi + 1, zi);
                let c110 = self.fetch(xi + 1, yi + 1, zi);
                let c001 = self.fetch(xi, yi, zi + 1);
                let c101 = self.fetch(xi + 1, yi, zi + 1);
                let c011 = self.fetch(xi, yi + 1, zi + 1);
                let c111 = self.fetch(xi + 1, yi + 1, zi + 1);

                let c00 = c000 + (c100 - c000) * fx;
                let c10 = c010 + (c110 - c010) * fx;
                let c01 = c001 + (c101 - c001) * fx;
                let c11 = c011 + (c111 - c011) * fx;

                let c0 = c00 + (c10 - c00) * fy;
                let c1 = c01 + (c11 - c01) * fy;

                c0 + (c1 - c0) * fz
            }
        }
    }
}
