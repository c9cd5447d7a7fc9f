//! VRS Torus Demo - variable rate shading on a grid of procedural tori
//!
//! The demo renders a configurable number of torus meshes and drives the
//! shading rate through a rate image and a pair of viewport palettes:
//! - **Vulkan**: Direct Vulkan API via ash with `VK_NV_shading_rate_image`
//! - **Recording**: Command recorder for tests and headless runs
//!
//! # Features
//! - Foveated, constant and pointer-tracking shading rate images
//! - Full shading rate exemption for every fifth (green) torus
//! - Shading rate visualization and a synthetic fragment load
//! - WGSL shaders with `#include` support and hot reload

pub mod backend;
pub mod demo;
pub mod egui_integration;
pub mod logging;
pub mod pipeline;
pub mod resources;
pub mod scene;
pub mod shader;
pub mod window;

use std::path::PathBuf;

use backend::ShadingRate;
use resources::ShadingMode;

pub use backend::{GraphicsBackend, RecordingBackend};
pub use demo::{DemoError, FrameDriver, FrameSteps, VrsDemo};
pub use egui_integration::VulkanEguiIntegration;
pub use pipeline::VrsPipeline;
pub use resources::{ShadingRateImages, Torus};
pub use window::Window;

/// Values of every control in the demo settings panel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemoSettings {
    /// Number of tori drawn per frame
    pub load_factor: u32,
    /// Iterations of the synthetic per-fragment workload
    pub fragment_load_factor: u32,
    pub tessellation_n: u32,
    pub tessellation_m: u32,
    /// Window size divided by this gives the scene framebuffer size
    pub framebuffer_scaling: u32,
    pub shading_mode: ShadingMode,
    pub activate_shading_rate: bool,
    pub visualize_shading_rate: bool,
    pub full_shading_rate_for_green_objects: bool,
}

impl DemoSettings {
    pub const LOAD_FACTOR_RANGE: (u32, u32) = (1, 1000);
    pub const FRAGMENT_LOAD_RANGE: (u32, u32) = (1, 250);
    pub const TESSELLATION_RANGE: (u32, u32) = (3, 64);
    pub const SCALING_RANGE: (u32, u32) = (1, 16);

    /// Clamp every numeric control into its UI range
    pub fn clamp(mut self) -> Self {
        let clamp = |v: u32, (lo, hi): (u32, u32)| v.clamp(lo, hi);
        self.load_factor = clamp(self.load_factor, Self::LOAD_FACTOR_RANGE);
        self.fragment_load_factor = clamp(self.fragment_load_factor, Self::FRAGMENT_LOAD_RANGE);
        self.tessellation_n = clamp(self.tessellation_n, Self::TESSELLATION_RANGE);
        self.tessellation_m = clamp(self.tessellation_m, Self::TESSELLATION_RANGE);
        self.framebuffer_scaling = clamp(self.framebuffer_scaling, Self::SCALING_RANGE);
        self
    }
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            load_factor: 16,
            fragment_load_factor: 16,
            tessellation_n: 8,
            tessellation_m: 8,
            framebuffer_scaling: 1,
            shading_mode: ShadingMode::Varying,
            activate_shading_rate: true,
            visualize_shading_rate: false,
            full_shading_rate_for_green_objects: true,
        }
    }
}

/// Configuration for starting the demo
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Directories searched, in order, for shader sources
    pub shader_dirs: Vec<PathBuf>,
    /// Density of rate class 0 in the adaptive palette
    pub periphery_rate: ShadingRate,
    /// Control values the demo starts with
    pub initial: DemoSettings,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            title: "VRS Demo".to_string(),
            width: 1200,
            height: 900,
            vsync: true,
            shader_dirs: vec![
                PathBuf::from("shaders"),
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders"),
            ],
            periphery_rate: ShadingRate::NoInvocations,
            initial: DemoSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_settings_match_panel_defaults() {
        let settings = DemoSettings::default();
        assert_eq!(settings.load_factor, 16);
        assert_eq!(settings.fragment_load_factor, 16);
        assert_eq!((settings.tessellation_n, settings.tessellation_m), (8, 8));
        assert_eq!(settings.shading_mode, ShadingMode::Varying);
        assert!(settings.activate_shading_rate);
        assert!(!settings.visualize_shading_rate);
        assert!(settings.full_shading_rate_for_green_objects);
    }

    #[rstest]
    #[case::below(0, 1)]
    #[case::inside(500, 500)]
    #[case::above(5000, 1000)]
    fn test_clamp_load_factor(#[case] input: u32, #[case] expected: u32) {
        let settings = DemoSettings {
            load_factor: input,
            ..Default::default()
        }
        .clamp();
        assert_eq!(settings.load_factor, expected);
    }

    #[test]
    fn test_clamp_tessellation_and_scaling() {
        let settings = DemoSettings {
            tessellation_n: 1,
            tessellation_m: 100,
            framebuffer_scaling: 0,
            fragment_load_factor: 999,
            ..Default::default()
        }
        .clamp();
        assert_eq!(settings.tessellation_n, 3);
        assert_eq!(settings.tessellation_m, 64);
        assert_eq!(settings.framebuffer_scaling, 1);
        assert_eq!(settings.fragment_load_factor, 250);
    }
}
