use crate::{
    config::MipMode,
    jitter::JitterTable,
    texture::{Filter, Sampler, Tex3d},
    transfer::TransferFunction,
    volume::BoundVolume,
};

use glam::{Mat4, Vec3, Vec4};

/// Accumulated opacity above which a ray stops early.
pub const EARLY_TERMINATION_ALPHA: f32 = 0.95;

// Samples more transparent than this are not worth shading.
const LIGHTING_ALPHA_THRESHOLD: f32 = 0.1;

// Central-difference offset for gradients, in normalized
// texture coordinates.
const GRADIENT_DELTA: f32 = 0.01;

// Blinn-Phong material constants.
const AMBIENT: Vec3 = Vec3::ZERO;
const DIFFUSE: Vec3 = Vec3::new(0.8, 0.8, 0.8);
const SPECULAR: Vec3 = Vec3::new(0.8, 0.8, 0.8);
const SHININESS: f32 = 1000.0;

/// The flag set one kernel launch is specialized over. The
/// dispatcher normalizes the renderer configuration into this
/// before a launch, so illegal combinations (early termination
/// under a projection mode, skipping without a grid) never
/// reach the loop below; the interpolation flag is carried by
/// the volume sampler instead of appearing here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelSpec {
    pub early_ray_termination: bool,
    pub opacity_correction: bool,
    pub illumination: bool,
    pub jittering: bool,
    pub clip_plane: bool,
    pub clip_sphere: bool,
    pub sphere_as_probe: bool,
    pub space_skipping: bool,
    pub mip_mode: MipMode,
}

/// Per-launch arguments: viewport, stepping geometry, clip
/// shapes, lighting vectors and the camera constants. Uploaded
/// once per frame and shared read-only by every thread of the
/// launch.
#[derive(Clone, Copy, Debug)]
pub struct KernelParams {
    pub width: usize,
    pub height: usize,
    /// Initial destination color in MIP modes.
    pub background: Vec4,
    /// Object-space distance between consecutive samples.
    pub step: f32,
    pub vol_pos: Vec3,
    pub vol_half: Vec3,
    /// The probe box; equals the volume box when no region of
    /// interest is active.
    pub probe_pos: Vec3,
    pub probe_half: Vec3,
    pub light: Vec3,
    pub half_vector: Vec3,
    pub sphere_center: Vec3,
    pub sphere_radius_sq: f32,
    pub plane_normal: Vec3,
    pub plane_dist: f32,
    pub mvp: Mat4,
    pub inverse_mvp: Mat4,
}

/// Read-only texture bindings for one launch.
pub struct KernelTextures<'a> {
    pub volume: BoundVolume<'a>,
    pub transfer: &'a TransferFunction,
    pub jitter: &'a JitterTable,
    pub skip: Option<&'a Tex3d<bool>>,
}

/// What one thread hands back for its pixel. Rays that miss the
/// probe leave both fields zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct PixelOutput {
    pub rgba: [u8; 4],
    /// Window depth of the sample with the largest opacity
    /// gain, normalized to [0,1].
    pub depth: f32,
}

struct Ray {
    origin: Vec3,
    dir: Vec3,
}

/// Shades a single pixel, the work of one thread in a launch.
/// The sequence is: recover the pixel's viewing ray, intersect
/// it with the probe box, then march from entry to exit in
/// fixed steps, at each step classifying the interpolated
/// scalar through the transfer function and folding the result
/// into the destination color (alpha blending front to back, or
/// keeping the extremum in a projection mode). The function is
/// pure and allocation free: it reads the bound textures, never
/// writes shared state, and degrades non-finite inputs to black
/// output instead of trapping, so one bad matrix costs an image
/// but never a launch.
pub fn shade_pixel(
    x: usize,
    y: usize,
    spec: KernelSpec,
    params: &KernelParams,
    textures: &KernelTextures,
) -> PixelOutput {
    // Un-project the pixel through the near and far clip planes
    // to recover its viewing ray in object space.
    let ray = generate_ray(x, y, params.width, params.height, &params.inverse_mvp);

    // Entry and exit distances on the probe box; rays that miss
    // it (or only hit behind the eye) contribute nothing, and
    // the pixel stays fully transparent black with a zero
    // depth.
    let Some((tnear, tfar)) = intersect_box(
        &ray,
        params.probe_pos - params.probe_half,
        params.probe_pos + params.probe_half,
    ) else {
        return PixelOutput::default();
    };

    // Snap the entry distance down onto the step grid. Without
    // this, neighboring rays would start sampling at slightly
    // different depths along their own entry points and the
    // volume would shimmer under camera motion; quantized, all
    // rays sample the same family of concentric shells. The
    // max keeps the start in front of the eye when the eye sits
    // inside the box.
    let d = params.step;
    let mut t = ((tnear / d).floor() * d).max(0.0);

    // A spherical probe that the ray never enters is a miss as
    // well.
    if spec.clip_sphere
        && spec.sphere_as_probe
        && intersect_sphere(&ray, params.sphere_center, params.sphere_radius_sq).is_none()
    {
        return PixelOutput::default();
    }

    // The clip plane crosses the ray at a single parameter,
    // found by solving dot(N, origin + t*dir) = dist for t.
    // Which side of that crossing is removed depends on whether
    // the ray runs with the plane normal (nddot >= 0, the part
    // before the crossing is clipped) or against it (the part
    // after). Both cases are evaluated per step below; the
    // division may produce a non-finite tpnear for rays
    // parallel to the plane, which the comparisons tolerate.
    let nddot = params.plane_normal.dot(ray.dir);
    let tpnear = (params.plane_dist - params.plane_normal.dot(ray.origin)) / nddot;

    // Alpha blending starts from an empty destination and
    // accumulates into it; the projection modes start from the
    // background so that a ray which never beats it keeps the
    // clear color.
    let mut dst = match spec.mip_mode {
        MipMode::None => Vec4::ZERO,
        MipMode::Max | MipMode::Min => params.background,
    };

    let mut pos = ray.origin + ray.dir * t;
    if spec.jittering {
        // Dither the start by up to two steps to break up the
        // slicing pattern the quantized start depths would
        // otherwise show as banding. Every pixel keeps reusing
        // its own table entry, so the noise is frozen in place
        // and does not crawl between frames.
        pos += textures.jitter.offset(y * params.width + x) * d;
    }

    // Depth bookkeeping: the pixel's depth is the sample that
    // contributed the largest single jump in accumulated
    // opacity, a good stand-in for "the surface this pixel
    // shows". Tracked across the whole march.
    let mut last_alpha = 0.0_f32;
    let mut max_diff = 0.0_f32;
    let mut max_diff_pos = pos;

    // Surface normal of the clip shape the previous iteration
    // stopped at, if any; it bleeds into the first gradient
    // behind the cut so the cut face catches light instead of
    // shading as if the removed material were still there.
    let mut clip_normal: Option<Vec3> = None;

    loop {
        // Clip membership at the current parameter. A clipped
        // sample is not consumed, only stepped over: the ray
        // stays alive and resumes compositing once it leaves
        // the clipped region.
        let mut clipped_by = None;
        if spec.clip_plane {
            let clipped = (t <= tpnear && nddot >= 0.0) || (t >= tpnear && nddot < 0.0);
            if clipped {
                clipped_by = Some(params.plane_normal);
            }
        }
        if spec.clip_sphere {
            // The sphere clips its inside when it is a cutout,
            // and everything but its inside when it acts as the
            // probe. Its surface normal at the sample position
            // is the direction out from the center.
            let inside =
                (pos - params.sphere_center).length_squared() < params.sphere_radius_sq;
            let clipped = if spec.sphere_as_probe { !inside } else { inside };
            if clipped {
                clipped_by = Some((pos - params.sphere_center).normalize_or_zero());
            }
        }
        if let Some(normal) = clipped_by {
            clip_normal = Some(normal);
            if !advance(&mut t, &mut pos, ray.dir, d, tfar) {
                break;
            }
            continue;
        }

        // Map the object-space position into the volume's
        // normalized texture space: the box spans
        // [vol_pos - vol_half, vol_pos + vol_half], which this
        // affine rescale sends onto [0,1] per axis.
        let tc = (pos - params.vol_pos + params.vol_half) / (params.vol_half * 2.0);

        // Empty-space skipping: whole cells whose scalar range
        // the transfer function maps to zero opacity are
        // stepped over without touching the volume texture at
        // all. The flags are a coarse boolean grid, read with
        // nearest filtering since a blended flag would be
        // meaningless.
        if spec.space_skipping {
            if let Some(flags) = textures.skip {
                let nearest = Sampler {
                    filter: Filter::Nearest,
                };
                if flags.sample(nearest, tc) > 0.5 {
                    if !advance(&mut t, &mut pos, ray.dir, d, tfar) {
                        break;
                    }
                    continue;
                }
            }
        }

        // Sample the scalar field through the bound sampler and
        // classify it: the transfer function turns the bare
        // scalar into color and opacity at the reference step.
        let scalar = textures.volume.sample(tc);
        let mut src = textures.transfer.classify(scalar);

        match spec.mip_mode {
            // The projection modes keep the running per-channel
            // extremum of every classified sample and pin the
            // destination opaque; lighting, opacity correction
            // and blending are front-to-back work and play no
            // part here.
            MipMode::Max => {
                dst = dst.max(src);
                dst.w = 1.0;
            }
            MipMode::Min => {
                dst = dst.min(src);
                dst.w = 1.0;
            }
            MipMode::None => {
                // Local illumination on everything opaque
                // enough to read as a surface. The volume has
                // no explicit geometry, so the normal is the
                // field gradient: the direction the scalar
                // falls off fastest, which is perpendicular to
                // any iso-surface through the sample.
                if spec.illumination && src.w > LIGHTING_ALPHA_THRESHOLD {
                    let mut normal = gradient(&textures.volume, tc);
                    if let Some(cut) = clip_normal {
                        // Fade from the cut-face normal into the
                        // field gradient as the sample gets more
                        // opaque, so the flat cut blends into
                        // the curved material behind it.
                        normal = cut.lerp(normal, src.w).normalize_or_zero();
                    }
                    src = blinn_phong(src, normal, params.light, params.half_vector)
                        .extend(src.w);
                }

                // Opacity correction. The table stores opacity
                // for one reference step; marching at a
                // different step length would make the volume
                // look denser or thinner as quality changes.
                // Treating the sample as an absorber over the
                // actual step length d gives the corrected
                // opacity 1 - (1 - a)^d, which renders the same
                // material the same regardless of sample rate.
                if spec.opacity_correction {
                    src.w = 1.0 - (1.0 - src.w).powf(d);
                }

                // Front-to-back accumulation over premultiplied
                // colors: the source is weighted by its own
                // opacity, then by the transparency (1 - dst.w)
                // still left in front of it. Once dst.w reaches
                // one, later samples are weighted zero, which
                // is what makes stopping early sound.
                let src = Vec4::new(src.x * src.w, src.y * src.w, src.z * src.w, src.w);
                dst += src * (1.0 - dst.w);
            }
        }
        clip_normal = None;

        // Track the sample behind the largest opacity gain; it
        // becomes the pixel's depth.
        if dst.w - last_alpha > max_diff {
            max_diff = dst.w - last_alpha;
            max_diff_pos = pos;
        }
        last_alpha = dst.w;

        // Early ray termination, blending mode only: behind an
        // almost opaque accumulation the remaining samples
        // cannot change the final byte, so the march stops. The
        // projection modes must see the full ray, since the
        // extremum can appear anywhere along it.
        if spec.early_ray_termination
            && spec.mip_mode == MipMode::None
            && dst.w > EARLY_TERMINATION_ALPHA
        {
            break;
        }

        if !advance(&mut t, &mut pos, ray.dir, d, tfar) {
            break;
        }
    }

    // Project the remembered sample back through the camera:
    // the perspective divide yields its normalized device z in
    // [-1,1], which maps linearly onto window depth in [0,1].
    // Rays that never composited anything report zero.
    let depth = if max_diff > 0.0 {
        let clip = params.mvp * max_diff_pos.extend(1.0);
        (clip.z / clip.w * 0.5 + 0.5).clamp(0.0, 1.0)
    } else {
        0.0
    };

    PixelOutput {
        rgba: rgba_to_bytes(dst),
        depth,
    }
}

// One step along the ray; false once the exit distance is
// passed.
fn advance(t: &mut f32, pos: &mut Vec3, dir: Vec3, step: f32, tfar: f32) -> bool {
    *t += step;
    if *t > tfar {
        return false;
    }
    *pos += dir * step;
    true
}

// A pixel's viewing ray, rebuilt from the camera matrices. The
// pixel center maps to normalized device coordinates in
// [-1,1]^2; lifting that point onto the near plane (z = -1) and
// the far plane (z = 1) and pushing both through the inverse
// model-view-projection (with the perspective divide restoring
// the homogeneous points to 3-D) gives two object-space points
// on the same line of sight. The ray starts at the near one and
// heads towards the far one.
fn generate_ray(x: usize, y: usize, width: usize, height: usize, inverse_mvp: &Mat4) -> Ray {
    let u = 2.0 * x as f32 / width as f32 - 1.0;
    let v = 2.0 * y as f32 / height as f32 - 1.0;

    let near = *inverse_mvp * Vec4::new(u, v, -1.0, 1.0);
    let far = *inverse_mvp * Vec4::new(u, v, 1.0, 1.0);
    let near = near.truncate() / near.w;
    let far = far.truncate() / far.w;

    Ray {
        origin: near,
        dir: (far - near).normalize_or_zero(),
    }
}

// Slab test against an axis-aligned box. Each axis bounds the
// ray parameter to the interval between its two box planes (a
// "slab"); the ray is inside the box exactly where all three
// intervals overlap, so the entry distance is the largest of
// the per-axis minima and the exit the smallest of the maxima.
// An axis-parallel ray divides by zero into infinities, which
// the min/max comparisons sort correctly: the slab becomes
// either unbounded or empty depending on the origin. Hits
// entirely behind the eye do not count, and non-finite inputs
// fail the final comparison and read as a miss.
fn intersect_box(ray: &Ray, box_min: Vec3, box_max: Vec3) -> Option<(f32, f32)> {
    let inv_dir = ray.dir.recip();
    let t1 = (box_min - ray.origin) * inv_dir;
    let t2 = (box_max - ray.origin) * inv_dir;

    let tnear = t1.min(t2).max_element();
    let tfar = t1.max(t2).min_element();

    (tnear <= tfar && tfar >= 0.0).then_some((tnear, tfar))
}

// Quadratic ray-sphere intersection. Substituting the ray into
// |p - center|^2 = r^2 gives t^2 + 2bt + c = 0 with the
// coefficients below; the direction is unit length, so the
// leading coefficient is one and the discriminant decides
// between a miss and the two crossing distances.
fn intersect_sphere(ray: &Ray, center: Vec3, radius_sq: f32) -> Option<(f32, f32)> {
    let oc = ray.origin - center;
    let b = oc.dot(ray.dir);
    let c = oc.length_squared() - radius_sq;

    let discriminant = b * b - c;
    (discriminant >= 0.0).then(|| {
        let root = discriminant.sqrt();
        (-b - root, -b + root)
    })
}

// Gradient of the scalar field by central differences: six
// extra texture reads, one pair per axis, a small fixed offset
// to each side of the sample. The difference quotient points
// from denser into thinner material, which makes it usable as a
// surface normal on iso-surfaces. A flat neighborhood yields
// the zero vector, which shades ambient-only rather than
// normalizing into NaN.
fn gradient(volume: &BoundVolume, tc: Vec3) -> Vec3 {
    let dx = Vec3::new(GRADIENT_DELTA, 0.0, 0.0);
    let dy = Vec3::new(0.0, GRADIENT_DELTA, 0.0);
    let dz = Vec3::new(0.0, 0.0, GRADIENT_DELTA);

    Vec3::new(
        volume.sample(tc - dx) - volume.sample(tc + dx),
        volume.sample(tc - dy) - volume.sample(tc + dy),
        volume.sample(tc - dz) - volume.sample(tc + dz),
    )
    .normalize_or_zero()
}

// Blinn-Phong with the fixed material above. The diffuse term
// is two-sided (the absolute value of the cosine) because a
// field gradient has no consistent winding: the same surface
// can face either way depending on whether density rises or
// falls across it. The highlight is the cosine against the
// half-vector raised to a high power, and is added only when
// the exponentiation comes out positive.
fn blinn_phong(src: Vec4, normal: Vec3, light: Vec3, half_vector: Vec3) -> Vec3 {
    let diffuse = normal.dot(light).abs();
    let mut color = AMBIENT + DIFFUSE * diffuse * src.truncate();

    let specular = normal.dot(half_vector).powf(SHININESS);
    if specular > 0.0 {
        color += SPECULAR * specular;
    }

    color
}

// Clamp, scale and round each channel into a byte. Rounding
// (rather than truncating) keeps a 0.5 channel on byte 128 and
// makes the byte the closest representable value to the float
// result.
fn rgba_to_bytes(color: Vec4) -> [u8; 4] {
    let c = color.clamp(Vec4::ZERO, Vec4::ONE) * 255.0;
    [
        c.x.round() as u8,
        c.y.round() as u8,
        c.z.round() as u8,
        c.w.round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_test_finds_entry_and_exit() {
        let ray = Ray {
            origin: Vec3::new(0.0, 0.0, 3.0),
            dir: Vec3::new(0.0, 0.0, -1.0),
        };

        let (tnear, tfar) = intersect_box(&ray, Vec3::splat(-1.0), Vec3::ONE).unwrap();
        assert_eq!(tnear, 2.0);
        assert_eq!(tfar, 4.0);
    }

    #[test]
    fn boxes_behind_the_eye_do_not_hit() {
        let ray = Ray {
            origin: Vec3::new(0.0, 0.0, 3.0),
            dir: Vec3::new(0.0, 0.0, 1.0),
        };

        assert!(intersect_box(&ray, Vec3::splat(-1.0), Vec3::ONE).is_none());
    }

    #[test]
    fn sideways_rays_miss() {
        let ray = Ray {
            origin: Vec3::new(0.0, 5.0, 3.0),
            dir: Vec3::new(0.0, 0.0, -1.0),
        };

        assert!(intersect_box(&ray, Vec3::splat(-1.0), Vec3::ONE).is_none());
    }

    #[test]
    fn sphere_intersection_is_symmetric_around_the_center() {
        let ray = Ray {
            origin: Vec3::new(0.0, 0.0, 3.0),
            dir: Vec3::new(0.0, 0.0, -1.0),
        };

        let (t0, t1) = intersect_sphere(&ray, Vec3::ZERO, 1.0).unwrap();
        assert_eq!(t0, 2.0);
        assert_eq!(t1, 4.0);

        assert!(intersect_sphere(&ray, Vec3::new(5.0, 0.0, 0.0), 1.0).is_none());
    }

    #[test]
    fn identity_camera_shoots_along_plus_z() {
        let ray = generate_ray(1, 1, 2, 2, &Mat4::IDENTITY);

        assert_eq!(ray.origin, Vec3::new(0.0, 0.0, -1.0));
        assert_eq!(ray.dir, Vec3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn byte_conversion_rounds_to_nearest() {
        assert_eq!(
            rgba_to_bytes(Vec4::new(0.5, 1.1, -0.2, 0.96875)),
            [128, 255, 0, 247],
        );
    }

    #[test]
    fn headlight_shading_adds_diffuse_and_highlight() {
        let n = Vec3::Z;
        let lit = blinn_phong(Vec4::new(1.0, 0.0, 0.0, 1.0), n, n, n);

        assert!((lit - Vec3::new(1.6, 0.8, 0.8)).length() < 1e-6);
    }

    #[test]
    fn grazing_half_vector_adds_no_highlight() {
        let lit = blinn_phong(Vec4::new(1.0, 0.0, 0.0, 1.0), Vec3::Z, Vec3::Z, Vec3::X);

        // diffuse only: the zero specular term is not positive
        assert!((lit - Vec3::new(0.8, 0.0, 0.0)).length() < 1e-6);
    }
}
