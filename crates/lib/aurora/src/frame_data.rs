use crate::{
    environment::matrix_rows,
    light::{DistantLightData, MAX_DISTANT_LIGHTS},
    options::Options,
};
use glam::{Mat4, Vec2};

/// Per-sample constants, as laid out by the `FrameData` shader struct.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameData {
    pub inv_view_rows: [[f32; 4]; 4],
    pub view_size: [f32; 2],
    pub is_orthographic: f32,
    pub units: f32,
    pub focal_distance: f32,
    pub lens_radius: f32,
    pub scene_size: f32,
    pub max_luminance: f32,
    pub trace_depth: u32,
    pub is_diffuse_only: u32,
    pub is_denoising_enabled: u32,
    pub is_alpha_enabled: u32,
    pub brightness: [f32; 4],
    pub is_tone_mapping_enabled: u32,
    pub is_gamma_correction_enabled: u32,
    pub importance_sampling_mode: u32,
    pub light_count: u32,
    pub lights: [DistantLightData; MAX_DISTANT_LIGHTS],
}

/// Distance between the per-task copies of `FrameData` in its buffer.
pub const FRAME_DATA_STRIDE: usize = (std::mem::size_of::<FrameData>() + 255) & !255;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
    pub focal_distance: f32,
    pub lens_radius: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::perspective_rh(std::f32::consts::FRAC_PI_3, 1.0, 0.1, 1000.0),
            focal_distance: 1.0,
            lens_radius: 0.0,
        }
    }
}

impl Camera {
    /// An orthographic projection has no perspective divide.
    pub fn is_orthographic(&self) -> bool {
        self.projection.w_axis.w == 1.0
    }

    /// Tangents of the half field of view for perspective cameras; the full
    /// extent of the view volume for orthographic ones.
    pub fn view_size(&self) -> Vec2 {
        let scale = Vec2::new(self.projection.x_axis.x, self.projection.y_axis.y);
        if self.is_orthographic() {
            2.0 / scale
        } else {
            1.0 / scale
        }
    }
}

impl FrameData {
    pub fn new(
        camera: &Camera,
        options: &Options,
        scene_size: f32,
        lights: &[DistantLightData],
    ) -> Self {
        let mut packed = [DistantLightData::default(); MAX_DISTANT_LIGHTS];
        let light_count = lights.len().min(MAX_DISTANT_LIGHTS);
        packed[..light_count].copy_from_slice(&lights[..light_count]);

        let shader_options = options.shader_options();

        Self {
            inv_view_rows: matrix_rows(camera.view.inverse()),
            view_size: camera.view_size().to_array(),
            is_orthographic: camera.is_orthographic() as u32 as f32,
            units: options.units().per_meter(),
            focal_distance: camera.focal_distance,
            lens_radius: camera.lens_radius,
            scene_size,
            max_luminance: options.max_luminance(),
            trace_depth: shader_options.trace_depth,
            is_diffuse_only: shader_options.is_diffuse_only as u32,
            is_denoising_enabled: options.is_denoising_enabled() as u32,
            is_alpha_enabled: options.is_alpha_enabled() as u32,
            brightness: options.brightness().extend(1.0).to_array(),
            is_tone_mapping_enabled: options.is_tone_mapping_enabled() as u32,
            is_gamma_correction_enabled: options.is_gamma_correction_enabled() as u32,
            importance_sampling_mode: shader_options.importance_sampling_mode as u32,
            light_count: light_count as u32,
            lights: packed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_shader() {
        assert_eq!(std::mem::size_of::<FrameData>(), 272);
        assert_eq!(FRAME_DATA_STRIDE, 512);
    }

    #[test]
    fn projections_are_classified() {
        let mut camera = Camera::default();
        assert!(!camera.is_orthographic());
        let tan_half = (std::f32::consts::FRAC_PI_3 * 0.5).tan();
        assert!((camera.view_size().y - tan_half).abs() < 1e-5);

        camera.projection = Mat4::orthographic_rh(-2.0, 2.0, -1.0, 1.0, 0.1, 100.0);
        assert!(camera.is_orthographic());
        assert!((camera.view_size() - Vec2::new(4.0, 2.0)).length() < 1e-5);
    }

    #[test]
    fn frame_data_reflects_options() {
        let mut options = Options::default();
        options.set("trace_depth", 3).unwrap();
        options.set("units", "meter").unwrap();

        let light = DistantLightData {
            direction: [0.0, 1.0, 0.0],
            cos_radius: 1.0,
            color_and_intensity: [1.0; 4],
        };
        let data = FrameData::new(&Camera::default(), &options, 10.0, &[light; 6]);
        assert_eq!(data.trace_depth, 3);
        assert_eq!(data.units, 1.0);
        assert_eq!(data.light_count, MAX_DISTANT_LIGHTS as u32);
        assert_eq!(data.scene_size, 10.0);
    }
}
