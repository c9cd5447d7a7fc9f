//! Frame orchestration
//!
//! [`VrsDemo`] owns every resource of the demo and implements [`FrameSteps`].
//! [`FrameDriver`] runs those steps in a fixed order each frame:
//!
//! 1. UI panel
//! 2. Bind render targets (clear, resize, rate image refresh)
//! 3. Draw calls (rate control, scene uniforms, one draw per torus)
//! 4. Resolve the scene framebuffer to the window

mod framebuffer;
mod layout;

pub use framebuffer::SceneFramebuffer;
pub use layout::{
    grid_layout, instance_color, instance_transforms, is_full_rate_candidate, GridLayout,
};

use std::time::Instant;

use glam::{Mat4, Vec2, Vec4Swizzles};
use thiserror::Error;

use crate::backend::{BackendError, BackendResult, GraphicsBackend};
use crate::pipeline::VrsPipeline;
use crate::resources::{
    ShadingMode, ShadingRateImages, Torus, ADAPTIVE_PALETTE, FULL_RATE_PALETTE,
};
use crate::scene::{CameraInput, OrbitCamera};
use crate::{DemoConfig, DemoSettings};

/// Extensions the demo cannot run without
pub const REQUIRED_EXTENSIONS: [&str; 2] = ["VK_NV_shading_rate_image", "VK_NV_viewport_array2"];

/// Demo error type
#[derive(Error, Debug)]
pub enum DemoError {
    #[error("Required extension not supported: {0}")]
    CapabilityMissing(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Per-frame information handed to the frame steps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    /// Window surface size in pixels
    pub width: u32,
    pub height: u32,
    /// Pointer position, normalized to [0, 1] over the window
    pub cursor: Option<Vec2>,
    pub frame_index: u64,
}

/// The hooks a demo provides to [`FrameDriver`]
pub trait FrameSteps {
    /// Add controls to the demo panel
    fn customize_ui_panel(&mut self, ui: &mut egui::Ui);

    /// Prepare and clear the render targets
    fn bind_render_targets(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        frame: &FrameInfo,
    ) -> BackendResult<()>;

    /// Record the scene
    fn issue_draw_calls(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        frame: &FrameInfo,
    ) -> BackendResult<()>;

    /// Copy the rendered scene onto the window surface
    fn resolve(&mut self, backend: &mut dyn GraphicsBackend, frame: &FrameInfo);
}

/// Runs [`FrameSteps`] in order and keeps frame timing
#[derive(Debug)]
pub struct FrameDriver {
    frame_index: u64,
    last_frame: Option<Instant>,
    /// Smoothed frame time in milliseconds
    frame_time_ms: f32,
}

impl Default for FrameDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDriver {
    pub fn new() -> Self {
        Self {
            frame_index: 0,
            last_frame: None,
            frame_time_ms: 0.0,
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn frame_time_ms(&self) -> f32 {
        self.frame_time_ms
    }

    /// Run one frame.
    ///
    /// `overlay` runs after the resolve and before presentation; the window
    /// uses it to draw egui on top of the scene.
    pub fn run_frame<B: GraphicsBackend>(
        &mut self,
        steps: &mut dyn FrameSteps,
        backend: &mut B,
        ui: Option<&egui::Context>,
        cursor: Option<Vec2>,
        overlay: impl FnOnce(&mut B),
    ) -> Result<FrameInfo, DemoError> {
        let now = Instant::now();
        if let Some(last) = self.last_frame.replace(now) {
            let ms = now.duration_since(last).as_secs_f32() * 1000.0;
            self.frame_time_ms = if self.frame_time_ms == 0.0 {
                ms
            } else {
                self.frame_time_ms * 0.9 + ms * 0.1
            };
        }

        if let Some(ctx) = ui {
            let frame_time_ms = self.frame_time_ms;
            egui::Window::new("VRS Demo")
                .default_pos([10.0, 10.0])
                .resizable(false)
                .show(ctx, |ui| {
                    ui.label(format!(
                        "{:.2} ms ({:.0} FPS)",
                        frame_time_ms,
                        if frame_time_ms > 0.0 { 1000.0 / frame_time_ms } else { 0.0 }
                    ));
                    ui.separator();
                    steps.customize_ui_panel(ui);
                });
        }

        let context = backend.begin_frame()?;
        let frame = FrameInfo {
            width: context.width,
            height: context.height,
            cursor,
            frame_index: self.frame_index,
        };

        steps.bind_render_targets(backend, &frame)?;
        steps.issue_draw_calls(backend, &frame)?;
        steps.resolve(backend, &frame);
        overlay(backend);
        backend.end_frame()?;

        self.frame_index += 1;
        Ok(frame)
    }
}

/// The variable rate shading torus demo
pub struct VrsDemo {
    settings: DemoSettings,
    pipeline: VrsPipeline,
    torus: Torus,
    rate_images: ShadingRateImages,
    framebuffer: SceneFramebuffer,
    camera: OrbitCamera,
    reload_requested: bool,
}

impl VrsDemo {
    /// Create every resource and verify device support.
    ///
    /// On failure, whatever was created so far is released before the error
    /// is returned.
    pub fn begin(
        backend: &mut dyn GraphicsBackend,
        config: &DemoConfig,
    ) -> Result<Self, DemoError> {
        let settings = config.initial.clamp();
        let (surface_width, surface_height) = backend.surface_size();

        let mut framebuffer = SceneFramebuffer::new();
        framebuffer.ensure_size(
            backend,
            surface_width / settings.framebuffer_scaling,
            surface_height / settings.framebuffer_scaling,
        )?;

        let mut pipeline = match VrsPipeline::create(backend, config) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                framebuffer.destroy(backend);
                return Err(e.into());
            }
        };

        let mut torus = Torus::new();
        torus.set_tessellation(settings.tessellation_n, settings.tessellation_m);
        torus.set_vertex_attribute_locations(0, 1);

        let missing = REQUIRED_EXTENSIONS
            .iter()
            .find(|extension| !backend.has_extension(extension));
        if let Some(extension) = missing {
            log::error!("{} is not supported by this device", extension);
            pipeline.destroy(backend);
            torus.destroy(backend);
            framebuffer.destroy(backend);
            return Err(DemoError::CapabilityMissing(extension.to_string()));
        }

        let properties = backend.shading_rate_properties();
        log::info!(
            "Shading rate image: {}x{} pixel tiles, palette size {}",
            properties.tile_width,
            properties.tile_height,
            properties.palette_size
        );

        let mut rate_images =
            ShadingRateImages::with_periphery_rate(properties, config.periphery_rate);
        let (width, height) = (framebuffer.width(), framebuffer.height());
        if let Err(e) = rate_images.update_textures(backend, width, height) {
            rate_images.destroy(backend);
            pipeline.destroy(backend);
            torus.destroy(backend);
            framebuffer.destroy(backend);
            return Err(e.into());
        }
        rate_images.setup_shading_rate_palette(backend);

        Ok(Self {
            settings,
            pipeline,
            torus,
            rate_images,
            framebuffer,
            camera: OrbitCamera::default(),
            reload_requested: false,
        })
    }

    pub fn settings(&self) -> &DemoSettings {
        &self.settings
    }

    /// Replace the control values; out of range values are clamped
    pub fn set_settings(&mut self, settings: DemoSettings) {
        self.settings = settings.clamp();
    }

    pub fn pipeline(&self) -> &VrsPipeline {
        &self.pipeline
    }

    pub fn torus(&self) -> &Torus {
        &self.torus
    }

    pub fn rate_images(&self) -> &ShadingRateImages {
        &self.rate_images
    }

    pub fn framebuffer(&self) -> &SceneFramebuffer {
        &self.framebuffer
    }

    pub fn camera(&self) -> &OrbitCamera {
        &self.camera
    }

    /// Feed pointer input to the orbit camera
    pub fn update_camera(&mut self, input: &CameraInput) {
        self.camera.update(input);
    }

    /// Recompile shaders at the start of the next frame
    pub fn request_shader_reload(&mut self) {
        self.reload_requested = true;
    }

    /// Stage view, projection and the scene record for a `width` x `height` target
    pub fn update_per_frame_uniforms(&mut self, width: u32, height: u32) {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        // 45 is passed as radians
        let projection = Mat4::perspective_rh(45.0, aspect, 0.01, 10.0);
        let view = self.camera.view_matrix();
        let eye_pos_world = view.inverse().w_axis.xyz();
        let eye_pos_view = view.transform_point3(eye_pos_world);
        let properties = self.rate_images.properties();

        self.pipeline.set_projection_matrix(projection);
        self.pipeline.set_view_matrix(view);

        let settings = self.settings;
        let scene = self.pipeline.scene_data_mut();
        scene.view = view;
        scene.light_pos_world = eye_pos_world;
        scene.eye_pos_world = eye_pos_world;
        scene.eye_pos_view = eye_pos_view;
        scene.load_factor = settings.load_factor as i32;
        scene.fragment_load_factor = settings.fragment_load_factor as i32;
        scene.visualize_shading_rate = settings.visualize_shading_rate as i32;
        scene.full_shading_rate_for_green_objects =
            settings.full_shading_rate_for_green_objects as i32;
        scene.shading_rate_tile = [properties.tile_width as i32, properties.tile_height as i32];
    }

    /// Release every resource in a fixed order
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        self.pipeline.destroy(backend);
        self.torus.destroy(backend);
        self.rate_images.destroy(backend);
        self.framebuffer.destroy(backend);
    }
}

impl FrameSteps for VrsDemo {
    fn customize_ui_panel(&mut self, ui: &mut egui::Ui) {
        let mut settings = self.settings;

        if ui.button("Reload Shader").clicked() {
            self.reload_requested = true;
        }
        let (lo, hi) = DemoSettings::SCALING_RANGE;
        ui.add(
            egui::Slider::new(&mut settings.framebuffer_scaling, lo..=hi)
                .text("Framebuffer scaling"),
        );
        ui.separator();

        let (lo, hi) = DemoSettings::LOAD_FACTOR_RANGE;
        ui.add(egui::Slider::new(&mut settings.load_factor, lo..=hi).text("Tori"));
        let (lo, hi) = DemoSettings::FRAGMENT_LOAD_RANGE;
        ui.add(
            egui::Slider::new(&mut settings.fragment_load_factor, lo..=hi).text("Fragment load"),
        );
        let (lo, hi) = DemoSettings::TESSELLATION_RANGE;
        ui.add(egui::Slider::new(&mut settings.tessellation_n, lo..=hi).text("Tessellation N"));
        ui.add(egui::Slider::new(&mut settings.tessellation_m, lo..=hi).text("Tessellation M"));

        egui::ComboBox::from_label("Shading mode")
            .selected_text(settings.shading_mode.name())
            .show_ui(ui, |ui| {
                for mode in ShadingMode::ALL {
                    ui.selectable_value(&mut settings.shading_mode, mode, mode.name());
                }
            });

        ui.checkbox(&mut settings.activate_shading_rate, "Enable VRS");
        ui.checkbox(&mut settings.visualize_shading_rate, "Visualize shading rate");
        ui.checkbox(
            &mut settings.full_shading_rate_for_green_objects,
            "Full shading rate for green objects",
        );

        ui.separator();
        let triangles = 2 * settings.tessellation_n * settings.tessellation_m;
        ui.label(format!("Triangles per torus: {}", triangles));

        self.set_settings(settings);
    }

    fn bind_render_targets(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        frame: &FrameInfo,
    ) -> BackendResult<()> {
        if std::mem::take(&mut self.reload_requested) {
            self.pipeline.reload_shaders(backend);
        }

        self.torus
            .set_tessellation(self.settings.tessellation_n, self.settings.tessellation_m);

        let scaling = self.settings.framebuffer_scaling;
        self.framebuffer
            .ensure_size(backend, frame.width / scaling, frame.height / scaling)?;
        self.rate_images
            .update_textures(backend, self.framebuffer.width(), self.framebuffer.height())?;

        if self.settings.shading_mode == ShadingMode::MouseTracking {
            if let Some(cursor) = frame.cursor {
                self.rate_images.update_mouse_tracking(backend, cursor.x, cursor.y)?;
            }
        }

        if let Some(desc) = self.framebuffer.render_pass_descriptor() {
            backend.begin_render_pass(&desc);
        }
        backend.set_viewport(
            0.0,
            0.0,
            self.framebuffer.width() as f32,
            self.framebuffer.height() as f32,
            0.0,
            1.0,
        );
        Ok(())
    }

    fn issue_draw_calls(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        _frame: &FrameInfo,
    ) -> BackendResult<()> {
        let settings = self.settings;
        let (width, height) = (self.framebuffer.width(), self.framebuffer.height());

        self.rate_images.bind_shading_rate_texture(
            backend,
            settings.shading_mode,
            settings.activate_shading_rate,
        );

        self.update_per_frame_uniforms(width, height);
        self.pipeline.update_scene_uniforms(backend);

        if self.pipeline.has_shader_program() {
            self.pipeline.set_shader_program(backend);
            self.torus.set_buffer_state(backend)?;

            let aspect = width as f32 / height as f32;
            for (index, model) in (0u32..).zip(instance_transforms(settings.load_factor, aspect)) {
                let exempt =
                    settings.full_shading_rate_for_green_objects && is_full_rate_candidate(index);
                backend.select_shading_rate_palette(if exempt {
                    FULL_RATE_PALETTE
                } else {
                    ADAPTIVE_PALETTE
                });

                self.pipeline.set_model_matrix(model);
                self.pipeline.set_object_color(instance_color(index));
                self.pipeline.update_object_uniforms(backend);
                self.torus.draw(backend);
            }

            self.torus.unset_buffer_state(backend);
        }

        backend.set_shading_rate_image_enabled(false);
        backend.end_render_pass();
        Ok(())
    }

    fn resolve(&mut self, backend: &mut dyn GraphicsBackend, _frame: &FrameInfo) {
        if let Some(color) = self.framebuffer.color_texture() {
            backend.blit_to_surface(color, self.framebuffer.width(), self.framebuffer.height());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Command, RecordingBackend, ShadingRateProperties};
    use std::path::PathBuf;

    fn config() -> DemoConfig {
        DemoConfig {
            shader_dirs: vec![PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders")],
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_extension_releases_resources() {
        let mut backend = RecordingBackend::with_capabilities(
            320,
            240,
            &["VK_NV_shading_rate_image"],
            ShadingRateProperties::default(),
        );
        let result = VrsDemo::begin(&mut backend, &config());

        assert!(matches!(
            result,
            Err(DemoError::CapabilityMissing(ref name)) if name == "VK_NV_viewport_array2"
        ));
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_texture_count(), 0);
        assert_eq!(backend.live_program_count(), 0);
    }

    #[test]
    fn test_begin_programs_palettes() {
        let mut backend = RecordingBackend::new(320, 240);
        let demo = VrsDemo::begin(&mut backend, &config()).unwrap();

        let palettes: Vec<u32> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::SetShadingRatePalette { palette, .. } => Some(*palette),
                _ => None,
            })
            .collect();
        assert_eq!(palettes, vec![ADAPTIVE_PALETTE, FULL_RATE_PALETTE]);
        assert_eq!((demo.rate_images().width(), demo.rate_images().height()), (20, 15));
    }

    #[test]
    fn test_per_frame_uniforms() {
        let mut backend = RecordingBackend::new(320, 240);
        let mut demo = VrsDemo::begin(&mut backend, &config()).unwrap();
        demo.update_per_frame_uniforms(320, 240);

        let scene = *demo.pipeline().scene_data();
        let eye = demo.camera().position();
        assert!(scene.eye_pos_world.abs_diff_eq(eye, 1e-5));
        assert_eq!(scene.light_pos_world, scene.eye_pos_world);
        assert!(scene.eye_pos_view.length() < 1e-5);
        assert_eq!(scene.load_factor, 16);
        assert_eq!(scene.full_shading_rate_for_green_objects, 1);
        assert_eq!(scene.shading_rate_tile, [16, 16]);
        assert_eq!(
            demo.pipeline().projection_matrix(),
            Mat4::perspective_rh(45.0, 320.0 / 240.0, 0.01, 10.0)
        );
    }

    #[test]
    fn test_ui_panel_builds_headless() {
        let mut backend = RecordingBackend::new(320, 240);
        let mut demo = VrsDemo::begin(&mut backend, &config()).unwrap();
        let ctx = egui::Context::default();
        let _ = ctx.run(egui::RawInput::default(), |ctx| {
            egui::CentralPanel::default().show(ctx, |ui| demo.customize_ui_panel(ui));
        });
        assert_eq!(*demo.settings(), DemoSettings::default());
    }
}
