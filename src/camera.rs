use glam::Mat4;

/// The two matrices every launch uploads as device constants:
/// the full model-view-projection for projecting sample points
/// back to window depth, and its inverse for un-projecting
/// pixel rays.
#[derive(Clone, Copy, Debug)]
pub struct CameraMatrices {
    pub mvp: Mat4,
    pub inverse_mvp: Mat4,
}

impl CameraMatrices {
    /// Builds both matrices from the column-major model-view
    /// and projection arrays the graphics host hands over. A
    /// singular product inverts to a non-finite matrix, which
    /// the kernel turns into black pixels rather than a trap.
    pub fn from_column_major(model_view: &[f32; 16], projection: &[f32; 16]) -> Self {
        let mvp = Mat4::from_cols_array(projection) * Mat4::from_cols_array(model_view);

        Self {
            mvp,
            inverse_mvp: mvp.inverse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn identity_inputs_yield_identity_matrices() {
        let identity = Mat4::IDENTITY.to_cols_array();
        let camera = CameraMatrices::from_column_major(&identity, &identity);

        assert_eq!(camera.mvp, Mat4::IDENTITY);
        assert_eq!(camera.inverse_mvp, Mat4::IDENTITY);
    }

    #[test]
    fn inverse_undoes_the_projection() {
        let model_view = Mat4::look_at_rh(
            glam::Vec3::new(0.0, 0.0, 3.0),
            glam::Vec3::ZERO,
            glam::Vec3::Y,
        );
        let projection = Mat4::perspective_rh_gl(1.0, 1.0, 0.1, 100.0);
        let camera = CameraMatrices::from_column_major(
            &model_view.to_cols_array(),
            &projection.to_cols_array(),
        );

        let p = Vec4::new(0.3, -0.2, 0.5, 1.0);
        let there_and_back = camera.inverse_mvp * (camera.mvp * p);
        let recovered = there_and_back / there_and_back.w;

        assert!((recovered - p).length() < 1e-4);
    }
}
