use crate::depth::DepthPrecision;

use glam::Vec3;

/// Compositing mode of the ray kernel: front-to-back alpha
/// blending, or a maximum/minimum intensity projection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MipMode {
    #[default]
    None,
    Max,
    Min,
}

/// A sub-region rendering is restricted to. The box is given by
/// its center and full size; when used as a spherical probe the
/// x component of `size` is the sphere diameter.
#[derive(Clone, Copy, Debug)]
pub struct RegionOfInterest {
    pub center: Vec3,
    pub size: Vec3,
}

/// An oriented clip plane in object space. Points on the side
/// the normal faces away from are removed.
#[derive(Clone, Copy, Debug)]
pub struct ClipPlane {
    pub normal: Vec3,
    pub point: Vec3,
}

impl ClipPlane {
    /// Signed distance of the plane from the origin, along the
    /// normal.
    pub fn signed_distance(&self) -> f32 {
        self.normal.dot(self.point)
    }
}

/// Renderer state the kernel dispatcher specializes over. The
/// booleans and the MIP mode span the kernel-variant lattice;
/// quality scales the sample count, and the rest parameterizes
/// the enabled features.
#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub early_ray_termination: bool,
    pub opacity_correction: bool,
    pub illumination: bool,
    pub jittering: bool,
    pub clipping: bool,
    pub space_skipping: bool,
    pub roi_used: bool,
    pub spherical_roi: bool,
    pub mip_mode: MipMode,
    pub quality: f32,
    pub depth_precision: Option<DepthPrecision>,
    pub roi: Option<RegionOfInterest>,
    pub clip_plane: ClipPlane,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            early_ray_termination: true,
            opacity_correction: true,
            illumination: false,
            jittering: false,
            clipping: false,
            space_skipping: false,
            roi_used: false,
            spherical_roi: false,
            mip_mode: MipMode::None,
            quality: 1.0,
            depth_precision: None,
            roi: None,
            clip_plane: ClipPlane {
                normal: Vec3::Y,
                point: Vec3::ZERO,
            },
        }
    }
}

/// The typed parameter surface the user interface drives.
#[derive(Clone, Copy, Debug)]
pub enum RendererParameter {
    SliceInterpolation(bool),
    Lighting(bool),
    OpacityCorrection(bool),
    TerminateRayEarly(bool),
    MipMode(MipMode),
    RoiUsed(bool),
    SphericalRoi(bool),
    ClipMode(bool),
    Quality(f32),
}
