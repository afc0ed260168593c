use crate::{
    camera::CameraMatrices,
    config::{ClipPlane, RegionOfInterest, RenderConfig, RendererParameter},
    depth::DepthPrecision,
    device::Device,
    dispatch,
    error::RenderError,
    framebuffer::Framebuffer,
    jitter::JitterTable,
    kernel::{KernelParams, KernelTextures},
    skip::SkipGrid,
    transfer::TransferFunction,
    volume::{VolumeDescriptor, VolumeStore},
};

use anyhow::{ensure, Result};
use glam::{Mat4, Vec3, Vec4};
use log::{debug, error, info, warn};

/// Everything the presentation layer provides for one frame:
/// the viewport, the camera as two column-major matrices, and
/// the clear color.
#[derive(Clone, Debug)]
pub struct FrameInput {
    pub width: usize,
    pub height: usize,
    pub model_view: [f32; 16],
    pub projection: [f32; 16],
    pub background: [f32; 4],
}

/// The host orchestrator. Owns every device resource the
/// kernel reads, and runs the synchronous per-frame sequence:
/// resolve dirty textures, upload the camera constants, pick
/// the kernel variant, launch, wait, hand the framebuffer to
/// the presenter.
pub struct Renderer {
    device: Device,
    volume: VolumeStore,
    transfer: TransferFunction,
    jitter: JitterTable,
    skip: Option<SkipGrid>,
    framebuffer: Framebuffer,
    config: RenderConfig,
    current_frame: usize,
    skip_dirty: bool,
    viable: bool,
}

impl Renderer {
    /// Builds a renderer on the default device and uploads
    /// every volume frame. A refused allocation rolls back all
    /// partial uploads before the error is returned.
    pub fn new(desc: VolumeDescriptor, frames: &[Vec<u8>]) -> Result<Self> {
        Self::with_device(Device::new()?, desc, frames)
    }

    pub fn with_device(device: Device, desc: VolumeDescriptor, frames: &[Vec<u8>]) -> Result<Self> {
        ensure!(!frames.is_empty(), "a volume needs at least one frame");

        let mut volume = VolumeStore::new(device.clone(), desc)?;
        for (i, raw) in frames.iter().enumerate() {
            volume.load_frame(i, raw)?;
        }

        let transfer = TransferFunction::new(&device, volume.descriptor().bpc)?;
        let jitter = JitterTable::new(&device, &mut rand::thread_rng())?;

        // The min/max cells are scanned now, while the raw
        // voxels are still at hand; 16-bit volumes render
        // without skipping.
        let skip = (volume.descriptor().bpc == 1)
            .then(|| SkipGrid::build(device.clone(), volume.descriptor(), &frames[0]));

        let framebuffer = Framebuffer::new(&device, 0, 0, None)?;

        info!("Renderer created ({} volume frame(s)).", volume.frame_count());
        Ok(Self {
            device,
            volume,
            transfer,
            jitter,
            skip,
            framebuffer,
            config: RenderConfig::default(),
            current_frame: 0,
            skip_dirty: true,
            viable: true,
        })
    }

    pub fn set_parameter(&mut self, parameter: RendererParameter) {
        match parameter {
            RendererParameter::SliceInterpolation(on) => self.volume.set_interpolation(on),
            RendererParameter::Lighting(on) => self.config.illumination = on,
            RendererParameter::OpacityCorrection(on) => self.config.opacity_correction = on,
            RendererParameter::TerminateRayEarly(on) => self.config.early_ray_termination = on,
            RendererParameter::MipMode(mode) => self.config.mip_mode = mode,
            RendererParameter::RoiUsed(on) => self.config.roi_used = on,
            RendererParameter::SphericalRoi(on) => self.config.spherical_roi = on,
            RendererParameter::ClipMode(on) => self.config.clipping = on,
            RendererParameter::Quality(quality) => {
                if quality > 0.0 {
                    self.config.quality = quality;
                } else {
                    warn!("Ignoring non-positive quality {quality}.");
                }
            }
        }
    }

    pub fn set_jittering(&mut self, on: bool) {
        self.config.jittering = on;
    }

    pub fn set_space_skipping(&mut self, on: bool) {
        if on && self.skip.is_none() {
            debug!("Space skipping is unavailable for 16-bit volumes.");
        }
        self.config.space_skipping = on;
    }

    pub fn set_region_of_interest(&mut self, roi: Option<RegionOfInterest>) {
        self.config.roi = roi;
        self.config.roi_used = roi.is_some();
    }

    pub fn set_clip_plane(&mut self, normal: Vec3, point: Vec3) {
        self.config.clip_plane = ClipPlane {
            normal: normal.normalize_or_zero(),
            point,
        };
    }

    pub fn set_depth_precision(&mut self, precision: Option<DepthPrecision>) {
        self.config.depth_precision = precision;
    }

    /// Selects the time frame rendered next; out-of-range
    /// indices clamp to the last frame.
    pub fn set_current_frame(&mut self, frame: usize) {
        let last = self.volume.frame_count() - 1;
        if frame > last {
            warn!("Frame {frame} is out of range, clamping to {last}.");
        }
        self.current_frame = frame.min(last);
    }

    /// Installs a user-edited lookup table. The skipping grid
    /// is collapsed against it before the next launch.
    pub fn update_transfer_function(&mut self, lut: &[[f32; 4]]) -> Result<()> {
        self.transfer.recompute(lut)?;
        self.skip_dirty = true;
        Ok(())
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn is_viable(&self) -> bool {
        self.viable
    }

    /// Renders one frame into the framebuffer. While the
    /// renderer is not viable every call is a no-op with a
    /// diagnostic; the presenter keeps showing black.
    pub fn render(&mut self, input: &FrameInput) -> Result<()> {
        if !self.viable {
            warn!("Renderer is not viable; frame skipped.");
            return Ok(());
        }

        // A collapsed viewport happens while the host window is
        // minimized; the next frame simply retries.
        if input.width == 0 || input.height == 0 {
            let e = RenderError::TransientDevice("empty viewport".into());
            debug!("{e}; frame skipped.");
            return Ok(());
        }

        if let Err(e) = self.prepare(input) {
            // Sticky until the renderer is reconfigured; the
            // user sees a black frame and this log line.
            self.viable = false;
            self.framebuffer.clear();
            error!("Frame preparation failed: {e}; rendering disabled.");
            return Err(e);
        }

        // The camera constants are rebuilt from the host
        // matrices every frame; nothing about the previous
        // frame's view is kept around.
        let camera = CameraMatrices::from_column_major(&input.model_view, &input.projection);

        // The dispatcher picks the kernel variant matching the
        // current configuration. The normalization happening
        // inside select is part of the contract: by the time a
        // spec exists, contradictory flag combinations have
        // been resolved and the kernel can branch on the flags
        // without re-checking legality.
        let spec = dispatch::select(
            &self.config,
            self.volume.descriptor().bpc,
            self.skip.as_ref().and_then(|grid| grid.flags()).is_some(),
        );
        let params = self.kernel_params(&camera, input);

        // Bind every texture the launch reads. The bindings are
        // shared borrows, which is exactly the guarantee the
        // launch needs: no upload or rebuild can touch these
        // resources until the launch returns and the borrows
        // end.
        let textures = KernelTextures {
            volume: self.volume.bind(self.current_frame)?,
            transfer: &self.transfer,
            jitter: &self.jitter,
            skip: self.skip.as_ref().and_then(|grid| grid.flags()),
        };

        // The launch blocks until every block has retired, so
        // when it returns the framebuffer is complete and can
        // be handed to the presenter as-is.
        dispatch::launch(spec, &params, &textures, &mut self.framebuffer);
        debug!("Frame rendered ({}x{}).", input.width, input.height);

        Ok(())
    }

    // Everything that must settle before a launch: the output
    // surface matches the viewport, and a dirty transfer
    // function has been folded into the skipping flags. Both
    // can exhaust device memory.
    fn prepare(&mut self, input: &FrameInput) -> Result<()> {
        self.framebuffer.resize(
            &self.device,
            input.width,
            input.height,
            self.config.depth_precision,
        )?;

        if self.config.space_skipping && self.skip_dirty {
            if let Some(grid) = &mut self.skip {
                grid.collapse(&self.transfer)?;
            }
            self.skip_dirty = false;
        }

        Ok(())
    }

    fn kernel_params(&self, camera: &CameraMatrices, input: &FrameInput) -> KernelParams {
        let desc = self.volume.descriptor();
        let vol_half = desc.half_size();

        // The probe defaults to the whole volume box.
        let (probe_pos, probe_half) =
            match (self.config.roi_used && !self.config.spherical_roi, self.config.roi) {
                (true, Some(roi)) => (roi.center, roi.size * 0.5),
                _ => (desc.position, vol_half),
            };

        // For a spherical probe the x component of the region
        // size is the diameter.
        let (sphere_center, sphere_radius_sq) = match self.config.roi {
            Some(roi) if self.config.roi_used && self.config.spherical_roi => {
                let radius = roi.size.x * 0.5;
                (roi.center, radius * radius)
            }
            _ => (Vec3::ZERO, 0.0),
        };

        // The sample count follows the voxel diagonal: at
        // quality 1 a ray crossing the volume corner to corner
        // takes about one sample per voxel on its way, and the
        // quality factor scales that count up or down. The step
        // is the physical diagonal divided by the count, so it
        // is an object-space distance independent of the voxel
        // resolution.
        let num_slices = ((self.config.quality * desc.voxel_diagonal()) as u32).max(1);
        let step = desc.extent.length() / num_slices as f32;

        // Headlight lighting: the light rides on the camera,
        // shining along the viewing axis. The model-view matrix
        // maps object space into eye space, so its inverse
        // carries the eye-space view axis back into object
        // space, which is where the kernel shades. With light
        // and viewer in the same direction the Blinn-Phong
        // half-vector coincides with both.
        let light = Mat4::from_cols_array(&input.model_view)
            .inverse()
            .transform_vector3(Vec3::Z)
            .normalize_or_zero();

        KernelParams {
            width: input.width,
            height: input.height,
            background: Vec4::from_array(input.background),
            step,
            vol_pos: desc.position,
            vol_half,
            probe_pos,
            probe_half,
            light,
            half_vector: light,
            sphere_center,
            sphere_radius_sq,
            plane_normal: self.config.clip_plane.normal,
            plane_dist: self.config.clip_plane.signed_distance(),
            mvp: camera.mvp,
            inverse_mvp: camera.inverse_mvp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MipMode;

    fn solid_volume(value: u8) -> (VolumeDescriptor, Vec<Vec<u8>>) {
        let desc = VolumeDescriptor {
            size: (32, 32, 32),
            bpc: 1,
            extent: Vec3::splat(2.0),
            position: Vec3::ZERO,
        };
        let raw = vec![value; desc.voxel_count()];
        (desc, vec![raw])
    }

    fn flat_lut(color: [f32; 4]) -> Vec<[f32; 4]> {
        vec![color; 256]
    }

    fn frame_input(eye: Vec3, target: Vec3, width: usize, height: usize) -> FrameInput {
        let model_view = Mat4::look_at_rh(eye, target, Vec3::Y);
        let projection = Mat4::perspective_rh_gl(
            45.0_f32.to_radians(),
            width as f32 / height as f32,
            0.1,
            100.0,
        );

        FrameInput {
            width,
            height,
            model_view: model_view.to_cols_array(),
            projection: projection.to_cols_array(),
            background: [0.0; 4],
        }
    }

    fn front_view(width: usize, height: usize) -> FrameInput {
        frame_input(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, width, height)
    }

    fn renderer(value: u8) -> Renderer {
        let (desc, frames) = solid_volume(value);
        Renderer::new(desc, &frames).unwrap()
    }

    #[test]
    fn rays_that_miss_write_zero_color_and_depth() {
        let mut r = renderer(128);
        r.set_depth_precision(Some(DepthPrecision::U16));

        // looking away from the volume: every ray misses
        let input = frame_input(
            Vec3::new(10.0, 10.0, 10.0),
            Vec3::new(20.0, 10.0, 10.0),
            32,
            32,
        );
        r.render(&input).unwrap();

        let fb = r.framebuffer();
        for y in 0..32 {
            for x in 0..32 {
                assert_eq!(fb.pixel(x, y), [0, 0, 0, 0]);
            }
        }

        let depth = fb.depth().unwrap();
        for i in 0..32 * 32 {
            assert_eq!(depth.read_normalized(i), 0.0);
        }
    }

    #[test]
    fn solid_volume_under_mip_max_keeps_the_classified_color() {
        let mut r = renderer(128);
        r.update_transfer_function(&flat_lut([0.5, 0.5, 0.5, 1.0]))
            .unwrap();
        r.set_parameter(RendererParameter::MipMode(MipMode::Max));

        r.render(&front_view(64, 64)).unwrap();
        assert_eq!(r.framebuffer().pixel(32, 32), [128, 128, 128, 255]);
    }

    #[test]
    fn front_to_back_crosses_the_threshold_on_the_fifth_sample() {
        let mut r = renderer(64);
        r.update_transfer_function(&flat_lut([1.0, 1.0, 0.0, 0.5]))
            .unwrap();
        r.set_parameter(RendererParameter::OpacityCorrection(false));
        r.set_parameter(RendererParameter::TerminateRayEarly(true));

        r.render(&front_view(64, 64)).unwrap();

        // five samples at half opacity: 1 - 0.5^5 = 0.96875,
        // the first value above the 0.95 threshold
        assert_eq!(r.framebuffer().pixel(32, 32), [247, 247, 0, 247]);
    }

    #[test]
    fn clip_plane_removes_the_half_space_behind_the_normal() {
        let mut r = renderer(64);
        r.update_transfer_function(&flat_lut([1.0, 1.0, 0.0, 0.5]))
            .unwrap();
        r.set_parameter(RendererParameter::ClipMode(true));
        r.set_clip_plane(Vec3::Y, Vec3::ZERO);

        r.render(&front_view(64, 64)).unwrap();

        let fb = r.framebuffer();
        // rays through the lower half (against the normal) are
        // fully clipped, the upper half accumulates
        assert_eq!(fb.pixel(32, 16), [0, 0, 0, 0]);
        assert!(fb.pixel(32, 48)[3] > 0);
    }

    #[test]
    fn early_termination_leaves_saturated_rays_unchanged() {
        // A nearly opaque sample pushes the accumulated alpha
        // to 0.999 on the first step, crossing the 0.95
        // threshold right away. The transmittance left behind
        // the break point is 0.001, so everything a full-length
        // ray could still gather is far below one byte step:
        // stopping early must not show in the output, color or
        // depth.
        let lut = flat_lut([1.0, 1.0, 1.0, 0.999]);
        let input = front_view(48, 48);

        let mut with = renderer(128);
        with.update_transfer_function(&lut).unwrap();
        with.set_depth_precision(Some(DepthPrecision::U16));
        with.set_parameter(RendererParameter::OpacityCorrection(false));
        with.set_parameter(RendererParameter::TerminateRayEarly(true));
        with.render(&input).unwrap();

        let mut without = renderer(128);
        without.update_transfer_function(&lut).unwrap();
        without.set_depth_precision(Some(DepthPrecision::U16));
        without.set_parameter(RendererParameter::OpacityCorrection(false));
        without.set_parameter(RendererParameter::TerminateRayEarly(false));
        without.render(&input).unwrap();

        assert_eq!(with.framebuffer().color(), without.framebuffer().color());

        // the depth sample is the first one either way: later
        // samples never beat its opacity gain
        let d0 = with.framebuffer().depth().unwrap();
        let d1 = without.framebuffer().depth().unwrap();
        for i in 0..48 * 48 {
            assert_eq!(d0.read_normalized(i), d1.read_normalized(i));
        }
    }

    #[test]
    fn depth_records_the_entry_of_an_opaque_volume() {
        let mut r = renderer(200);
        r.update_transfer_function(&flat_lut([1.0, 1.0, 1.0, 1.0]))
            .unwrap();
        r.set_depth_precision(Some(DepthPrecision::U16));

        let (width, height) = (64, 64);
        let input = front_view(width, height);
        r.render(&input).unwrap();

        // The center ray starts on the near plane (0.1 in
        // front of the eye), runs straight down the axis and
        // meets the box at z = 1, snapped onto the step grid;
        // its first (fully opaque) sample is the depth sample.
        let (desc, _) = solid_volume(200);
        let num_slices = desc.voxel_diagonal() as u32;
        let step = desc.extent.length() / num_slices as f32;
        let origin_z = 3.0 - 0.1;
        let tnear = ((origin_z - 1.0) / step).floor() * step;
        let sample = Vec3::new(0.0, 0.0, origin_z - tnear);

        let mvp = Mat4::from_cols_array(&input.projection) * Mat4::from_cols_array(&input.model_view);
        let clip = mvp * sample.extend(1.0);
        let expected = (clip.z / clip.w * 0.5 + 0.5).clamp(0.0, 1.0);

        let got = r
            .framebuffer()
            .depth()
            .unwrap()
            .read_normalized((height / 2) * width + width / 2);
        assert!(
            (got - expected).abs() <= 1.5 / 65535.0,
            "depth {got} vs {expected}",
        );
    }

    #[test]
    fn unchanged_table_and_repeated_renders_are_byte_identical() {
        let mut r = renderer(90);
        r.update_transfer_function(&flat_lut([0.3, 0.6, 0.9, 0.4]))
            .unwrap();

        let input = front_view(48, 48);
        r.render(&input).unwrap();
        let first = r.framebuffer().color().to_vec();

        // re-uploading an identical table must not perturb the
        // image, and neither must rendering again
        r.update_transfer_function(&flat_lut([0.3, 0.6, 0.9, 0.4]))
            .unwrap();
        r.render(&input).unwrap();

        assert_eq!(first, r.framebuffer().color());
    }

    #[test]
    fn probe_box_restricts_rendering() {
        let mut r = renderer(128);
        r.update_transfer_function(&flat_lut([1.0, 1.0, 1.0, 1.0]))
            .unwrap();
        r.set_region_of_interest(Some(RegionOfInterest {
            center: Vec3::ZERO,
            size: Vec3::splat(0.5),
        }));

        r.render(&front_view(64, 64)).unwrap();

        let fb = r.framebuffer();
        assert_eq!(fb.pixel(32, 32)[3], 255);
        // corner rays pass well outside the shrunken probe
        assert_eq!(fb.pixel(4, 4), [0, 0, 0, 0]);
    }

    #[test]
    fn fully_transparent_table_skips_to_an_empty_image() {
        let mut r = renderer(40);
        r.update_transfer_function(&flat_lut([1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        r.set_space_skipping(true);

        r.render(&front_view(32, 32)).unwrap();

        let fb = r.framebuffer();
        for y in 0..32 {
            for x in 0..32 {
                assert_eq!(fb.pixel(x, y)[3], 0);
            }
        }
    }

    #[test]
    fn frame_selection_clamps_to_the_loaded_range() {
        let (desc, mut frames) = solid_volume(10);
        frames.push(vec![200u8; desc.voxel_count()]);

        let mut r = Renderer::new(desc, &frames).unwrap();
        r.set_parameter(RendererParameter::MipMode(MipMode::Max));
        let input = front_view(32, 32);

        // index 5 clamps onto the second (brighter) frame
        r.set_current_frame(5);
        r.render(&input).unwrap();
        let bright = r.framebuffer().pixel(16, 16);

        r.set_current_frame(0);
        r.render(&input).unwrap();
        let dim = r.framebuffer().pixel(16, 16);

        assert!(bright[0] > dim[0]);
    }

    #[test]
    fn a_starved_device_refuses_to_build_and_rolls_back() {
        let device = Device::with_budget(1024).unwrap();
        let (desc, frames) = solid_volume(1);

        assert!(Renderer::with_device(device.clone(), desc, &frames).is_err());
        assert_eq!(device.used(), 0);
    }
}
