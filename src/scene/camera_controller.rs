//! Orbit camera
//!
//! Left drag rotates around the target, the scroll wheel zooms.

use glam::{Mat4, Vec2, Vec3};

/// Input state for the camera, gathered from window events
#[derive(Debug, Clone, Default)]
pub struct CameraInput {
    /// Mouse delta since last frame (in pixels)
    pub mouse_delta: Vec2,

    /// Mouse scroll delta (positive = scroll up)
    pub scroll_delta: f32,

    /// Whether the orbit button is held
    pub orbit_active: bool,
}

impl CameraInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-frame deltas (call after update)
    pub fn reset_deltas(&mut self) {
        self.mouse_delta = Vec2::ZERO;
        self.scroll_delta = 0.0;
    }
}

/// Camera orbiting a target point at a given distance
#[derive(Debug, Clone)]
pub struct OrbitCamera {
    /// Target point to orbit around
    pub target: Vec3,
    /// Distance from target
    pub distance: f32,
    pub min_distance: f32,
    pub max_distance: f32,
    /// Horizontal angle in radians, measured from +X towards +Z
    pub azimuth: f32,
    /// Vertical angle in radians
    pub elevation: f32,
    pub min_elevation: f32,
    pub max_elevation: f32,
    /// Orbit sensitivity (radians per pixel)
    pub orbit_sensitivity: f32,
    /// Zoom factor per scroll unit
    pub zoom_factor: f32,
}

impl Default for OrbitCamera {
    /// Looking at the origin from `-normalize(1, 0, -1) * 1.5`
    fn default() -> Self {
        Self::looking_at(Vec3::ZERO, -Vec3::new(1.0, 0.0, -1.0).normalize() * 1.5)
    }
}

impl OrbitCamera {
    /// Camera at `eye` looking at `target`
    pub fn looking_at(target: Vec3, eye: Vec3) -> Self {
        let offset = eye - target;
        let distance = offset.length().max(f32::EPSILON);
        Self {
            target,
            distance,
            min_distance: 0.1,
            max_distance: 9.0,
            azimuth: offset.z.atan2(offset.x),
            elevation: (offset.y / distance).clamp(-1.0, 1.0).asin(),
            min_elevation: -std::f32::consts::FRAC_PI_2 + 0.01,
            max_elevation: std::f32::consts::FRAC_PI_2 - 0.01,
            orbit_sensitivity: 0.005,
            zoom_factor: 1.1,
        }
    }

    /// Apply one frame of input
    pub fn update(&mut self, input: &CameraInput) {
        if input.scroll_delta != 0.0 {
            if input.scroll_delta > 0.0 {
                self.distance /= self.zoom_factor;
            } else {
                self.distance *= self.zoom_factor;
            }
            self.distance = self.distance.clamp(self.min_distance, self.max_distance);
        }

        if input.orbit_active && input.mouse_delta != Vec2::ZERO {
            self.azimuth += input.mouse_delta.x * self.orbit_sensitivity;
            self.elevation += input.mouse_delta.y * self.orbit_sensitivity;
            self.elevation = self.elevation.clamp(self.min_elevation, self.max_elevation);
            self.azimuth = self.azimuth.rem_euclid(std::f32::consts::TAU);
        }
    }

    /// Eye position in world space
    pub fn position(&self) -> Vec3 {
        let x = self.distance * self.elevation.cos() * self.azimuth.cos();
        let y = self.distance * self.elevation.sin();
        let z = self.distance * self.elevation.cos() * self.azimuth.sin();
        self.target + Vec3::new(x, y, z)
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position(), self.target, Vec3::Y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_view() {
        let camera = OrbitCamera::default();
        let eye = -Vec3::new(1.0, 0.0, -1.0).normalize() * 1.5;
        let expected = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        assert!(camera.position().abs_diff_eq(eye, 1e-5));
        assert!(camera.view_matrix().abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_zoom_is_clamped() {
        let mut camera = OrbitCamera::default();
        let input = CameraInput {
            scroll_delta: 1.0,
            ..Default::default()
        };
        for _ in 0..100 {
            camera.update(&input);
        }
        assert_eq!(camera.distance, camera.min_distance);
    }

    #[test]
    fn test_orbit_requires_button() {
        let mut camera = OrbitCamera::default();
        let before = camera.position();
        let mut input = CameraInput {
            mouse_delta: Vec2::new(100.0, 0.0),
            ..Default::default()
        };
        camera.update(&input);
        assert_eq!(camera.position(), before);

        input.orbit_active = true;
        camera.update(&input);
        assert!(!camera.position().abs_diff_eq(before, 1e-3));
        assert!((camera.position().length() - 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_elevation_is_clamped() {
        let mut camera = OrbitCamera::default();
        let input = CameraInput {
            mouse_delta: Vec2::new(0.0, 1.0e6),
            orbit_active: true,
            ..Default::default()
        };
        camera.update(&input);
        assert_eq!(camera.elevation, camera.max_elevation);
    }
}
