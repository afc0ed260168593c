use crate::{
    config::{MipMode, RenderConfig},
    framebuffer::Framebuffer,
    kernel::{self, KernelParams, KernelSpec, KernelTextures, PixelOutput},
};

use log::debug;
use rayon::prelude::*;

/// Launches cover the viewport with square blocks of this many
/// threads per side.
pub const BLOCK_SIZE: usize = 16;

/// Normalizes the renderer configuration into the kernel flag
/// set for the next launch. Illegal combinations are resolved
/// here so the kernel never sees them: projection modes keep
/// the full ray, only 8-bit volumes carry a skipping grid, and
/// the sphere flags require an active spherical region.
pub fn select(config: &RenderConfig, bpc: u8, skip_available: bool) -> KernelSpec {
    let sphere = config.roi_used && config.spherical_roi;

    KernelSpec {
        early_ray_termination: config.early_ray_termination && config.mip_mode == MipMode::None,
        opacity_correction: config.opacity_correction,
        illumination: config.illumination,
        jittering: config.jittering,
        clip_plane: config.clipping,
        clip_sphere: sphere,
        sphere_as_probe: sphere,
        space_skipping: config.space_skipping && bpc == 1 && skip_available,
        mip_mode: config.mip_mode,
    }
}

/// Issues one launch: a grid of 16x16 blocks, one thread per
/// output pixel. Blocks are independent work items with no
/// shared mutable state; each produces its tile of results,
/// and the host scatters the tiles into the framebuffer once
/// every block has finished.
pub fn launch(
    spec: KernelSpec,
    params: &KernelParams,
    textures: &KernelTextures,
    framebuffer: &mut Framebuffer,
) {
    let (width, height) = (params.width, params.height);
    let grid = (
        (width + BLOCK_SIZE - 1) / BLOCK_SIZE,
        (height + BLOCK_SIZE - 1) / BLOCK_SIZE,
    );
    debug!(
        "Kernel launch: {}x{} blocks of {BLOCK_SIZE}x{BLOCK_SIZE} threads.",
        grid.0, grid.1,
    );

    // The collect is the launch barrier: the host resumes only
    // after the last block has retired.
    let tiles: Vec<_> = (0..grid.0 * grid.1)
        .into_par_iter()
        .map(|block| {
            let (bx, by) = (block % grid.0, block / grid.0);
            let mut tile = [PixelOutput::default(); BLOCK_SIZE * BLOCK_SIZE];

            for ty in 0..BLOCK_SIZE {
                for tx in 0..BLOCK_SIZE {
                    let (x, y) = (bx * BLOCK_SIZE + tx, by * BLOCK_SIZE + ty);
                    if x < width && y < height {
                        tile[ty * BLOCK_SIZE + tx] =
                            kernel::shade_pixel(x, y, spec, params, textures);
                    }
                }
            }

            (bx, by, tile)
        })
        .collect();

    // Writes are partitioned by pixel coordinate, so the
    // scatter never overlaps.
    for (bx, by, tile) in tiles {
        for ty in 0..BLOCK_SIZE {
            for tx in 0..BLOCK_SIZE {
                let (x, y) = (bx * BLOCK_SIZE + tx, by * BLOCK_SIZE + ty);
                if x < width && y < height {
                    let out = tile[ty * BLOCK_SIZE + tx];
                    framebuffer.put_pixel(x, y, out.rgba, out.depth);
                }
            }
        }
    }
}
