//! Uniform records shared with `shaders/common.wgsl`

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Per-frame scene uniforms (std140, 144 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneData {
    pub view: Mat4,
    pub light_pos_world: Vec3,
    pub _pad0: f32,
    pub eye_pos_world: Vec3,
    pub _pad1: f32,
    pub eye_pos_view: Vec3,
    pub _pad2: f32,
    /// Number of tori drawn this frame
    pub load_factor: i32,
    /// Iterations of the synthetic fragment workload
    pub fragment_load_factor: i32,
    pub visualize_shading_rate: i32,
    pub full_shading_rate_for_green_objects: i32,
    /// Pixels covered by one rate image texel
    pub shading_rate_tile: [i32; 2],
    pub _pad3: [i32; 2],
}

impl Default for SceneData {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            ..Zeroable::zeroed()
        }
    }
}

/// Transform block at the head of every object upload (256 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObjectTransforms {
    pub model: Mat4,
    pub model_view: Mat4,
    /// Inverse transpose of `model_view`, for normals
    pub model_view_it: Mat4,
    pub model_view_proj: Mat4,
}

impl ObjectTransforms {
    pub fn new(model: Mat4, view: Mat4, projection: Mat4) -> Self {
        let model_view = view * model;
        Self {
            model,
            model_view,
            model_view_it: model_view.inverse().transpose(),
            model_view_proj: projection * model_view,
        }
    }
}

/// Per-object extras of the demo program: the surface color
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObjectColor {
    pub color: Vec3,
    pub _pad0: f32,
}

impl ObjectColor {
    pub fn new(color: Vec3) -> Self {
        Self { color, _pad0: 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_scene_data_layout() {
        assert_eq!(size_of::<SceneData>(), 144);
        assert_eq!(offset_of!(SceneData, light_pos_world), 64);
        assert_eq!(offset_of!(SceneData, eye_pos_world), 80);
        assert_eq!(offset_of!(SceneData, eye_pos_view), 96);
        assert_eq!(offset_of!(SceneData, load_factor), 112);
        assert_eq!(offset_of!(SceneData, full_shading_rate_for_green_objects), 124);
        assert_eq!(offset_of!(SceneData, shading_rate_tile), 128);
    }

    #[test]
    fn test_object_layout() {
        assert_eq!(size_of::<ObjectTransforms>(), 256);
        assert_eq!(size_of::<ObjectColor>(), 16);
    }

    #[test]
    fn test_transforms() {
        let model =
            Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)) * Mat4::from_scale(Vec3::splat(2.0));
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(1.0, 1.5, 0.01, 10.0);
        let transforms = ObjectTransforms::new(model, view, projection);

        assert_eq!(transforms.model_view, view * model);
        assert!(transforms
            .model_view_proj
            .abs_diff_eq(projection * view * model, 1e-5));
        // Uniform scale keeps normals parallel to the model-view rotation
        let normal = transforms.model_view_it.transform_vector3(Vec3::X).normalize();
        let expected = transforms.model_view.transform_vector3(Vec3::X).normalize();
        assert!(normal.abs_diff_eq(expected, 1e-5));
    }
}
