//! Uniform pipeline
//!
//! A [`Pipeline`] owns the scene and object uniform buffers together with the
//! shader program that reads them. The scene record `S` is uploaded once per
//! frame; every draw uploads the object transforms followed by the extras
//! record `E`.
//!
//! Uploads are "write then bind": each update rewrites the buffer and binds
//! it, and the draws recorded afterwards see that value.

pub mod uniforms;

pub use uniforms::{ObjectColor, ObjectTransforms, SceneData};

use std::path::PathBuf;

use bytemuck::Pod;
use glam::{Mat4, Vec3};

use crate::backend::{BackendResult, BufferHandle, GraphicsBackend, ShaderStage};
use crate::shader::{ProgramDefinition, ProgramId, ProgramLayout, ShaderProgramManager};
use crate::DemoConfig;

/// Scene and object uniforms plus the program consuming them
pub struct Pipeline<S: Pod, E: Pod> {
    scene: S,
    extras: E,
    model: Mat4,
    view: Mat4,
    projection: Mat4,
    scene_binding: u32,
    object_binding: u32,
    scene_buffer: Option<BufferHandle>,
    object_buffer: Option<BufferHandle>,
    object_bytes: Vec<u8>,
    programs: ShaderProgramManager,
    program: Option<ProgramId>,
}

impl<S: Pod, E: Pod> Pipeline<S, E> {
    /// Size in bytes of one object upload
    pub const OBJECT_UNIFORM_SIZE: usize =
        std::mem::size_of::<ObjectTransforms>() + std::mem::size_of::<E>();

    pub fn new(
        backend: &mut dyn GraphicsBackend,
        scene_binding: u32,
        object_binding: u32,
        shader_dirs: Vec<PathBuf>,
    ) -> BackendResult<Self> {
        let scene_buffer =
            backend.create_uniform_buffer("Scene Uniforms", std::mem::size_of::<S>() as u64)?;
        let object_size = Self::OBJECT_UNIFORM_SIZE as u64;
        let object_buffer = match backend.create_uniform_buffer("Object Uniforms", object_size) {
            Ok(buffer) => buffer,
            Err(e) => {
                backend.destroy_buffer(scene_buffer);
                return Err(e);
            }
        };

        Ok(Self {
            scene: S::zeroed(),
            extras: E::zeroed(),
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            scene_binding,
            object_binding,
            scene_buffer: Some(scene_buffer),
            object_buffer: Some(object_buffer),
            object_bytes: Vec::with_capacity(Self::OBJECT_UNIFORM_SIZE),
            programs: ShaderProgramManager::new(shader_dirs),
            program: None,
        })
    }

    pub fn set_model_matrix(&mut self, model: Mat4) {
        self.model = model;
    }

    pub fn set_view_matrix(&mut self, view: Mat4) {
        self.view = view;
    }

    pub fn set_projection_matrix(&mut self, projection: Mat4) {
        self.projection = projection;
    }

    pub fn model_matrix(&self) -> Mat4 {
        self.model
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.view
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection
    }

    pub fn scene_data(&self) -> &S {
        &self.scene
    }

    pub fn scene_data_mut(&mut self) -> &mut S {
        &mut self.scene
    }

    pub fn object_extras(&self) -> &E {
        &self.extras
    }

    pub fn object_extras_mut(&mut self) -> &mut E {
        &mut self.extras
    }

    pub fn shader_programs(&self) -> &ShaderProgramManager {
        &self.programs
    }

    pub fn shader_programs_mut(&mut self) -> &mut ShaderProgramManager {
        &mut self.programs
    }

    /// Register the program activated by [`set_shader_program`](Self::set_shader_program)
    pub fn set_program_definitions(&mut self, definitions: &[ProgramDefinition]) {
        self.program = Some(self.programs.create_program(definitions));
    }

    /// Transforms the next object upload will carry
    pub fn object_transforms(&self) -> ObjectTransforms {
        ObjectTransforms::new(self.model, self.view, self.projection)
    }

    /// Upload the scene record and bind it. Call once per frame before any object upload.
    pub fn update_scene_uniforms(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(buffer) = self.scene_buffer {
            backend.update_uniform_buffer(buffer, bytemuck::bytes_of(&self.scene));
            backend.bind_uniform_buffer(self.scene_binding, buffer);
        }
    }

    /// Upload transforms followed by the extras record and bind them
    pub fn update_object_uniforms(&mut self, backend: &mut dyn GraphicsBackend) {
        let Some(buffer) = self.object_buffer else {
            return;
        };
        let transforms = self.object_transforms();

        self.object_bytes.clear();
        self.object_bytes.extend_from_slice(bytemuck::bytes_of(&transforms));
        self.object_bytes.extend_from_slice(bytemuck::bytes_of(&self.extras));

        backend.update_uniform_buffer(buffer, &self.object_bytes);
        backend.bind_uniform_buffer(self.object_binding, buffer);
    }

    /// Recompile the programs. A failing compile keeps the previous program.
    pub fn reload_shaders(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        let valid = self.programs.reload_programs(backend);
        if !valid {
            log::error!("Shader reload failed, keeping the previous programs");
        }
        valid
    }

    /// Whether a program has ever compiled
    pub fn has_shader_program(&self) -> bool {
        self.program.and_then(|id| self.programs.get(id)).is_some()
    }

    /// Activate the compiled program for subsequent draws
    pub fn set_shader_program(&self, backend: &mut dyn GraphicsBackend) {
        match self.program.and_then(|id| self.programs.get(id)) {
            Some(handle) => backend.set_program(handle),
            None => log::warn!("No valid shader program to activate"),
        }
    }

    /// Release programs and uniform buffers
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        self.programs.delete_programs(backend);
        if let Some(buffer) = self.scene_buffer.take() {
            backend.destroy_buffer(buffer);
        }
        if let Some(buffer) = self.object_buffer.take() {
            backend.destroy_buffer(buffer);
        }
    }
}

/// The pipeline used by the demo
pub type VrsPipeline = Pipeline<SceneData, ObjectColor>;

impl VrsPipeline {
    pub const SCENE_BINDING: u32 = 0;
    pub const OBJECT_BINDING: u32 = 1;
    pub const RATE_IMAGE_BINDING: u32 = 2;

    /// Create the pipeline and compile the scene program.
    ///
    /// A program that fails to compile is logged, not returned as an error;
    /// draws are skipped until a reload succeeds.
    pub fn create(backend: &mut dyn GraphicsBackend, config: &DemoConfig) -> BackendResult<Self> {
        let mut pipeline = Self::new(
            backend,
            Self::SCENE_BINDING,
            Self::OBJECT_BINDING,
            config.shader_dirs.clone(),
        )?;
        *pipeline.scene_data_mut() = SceneData::default();

        let programs = pipeline.shader_programs_mut();
        programs.set_layout(ProgramLayout {
            uniform_bindings: vec![Self::SCENE_BINDING, Self::OBJECT_BINDING],
            rate_image_binding: Some(Self::RATE_IMAGE_BINDING),
            ..Default::default()
        });
        programs.register_include("common.wgsl", "common.wgsl");
        programs.register_include("noise.wgsl", "noise.wgsl");

        pipeline.set_program_definitions(&[
            ProgramDefinition::new(ShaderStage::Vertex, "scene.vert.wgsl")
                .with_definitions("const USE_VIEWPORT: bool = true;"),
            ProgramDefinition::new(ShaderStage::Fragment, "scene.frag.wgsl"),
        ]);

        if !pipeline.shader_programs_mut().reload_programs(backend) {
            log::error!(
                "Scene program is not valid (searched {:?})",
                pipeline.shader_programs().directories()
            );
        }

        Ok(pipeline)
    }

    pub fn set_object_color(&mut self, color: Vec3) {
        *self.object_extras_mut() = ObjectColor::new(color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Command, RecordingBackend};

    fn pipeline(backend: &mut RecordingBackend) -> VrsPipeline {
        let config = DemoConfig {
            shader_dirs: vec![PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders")],
            ..Default::default()
        };
        VrsPipeline::create(backend, &config).unwrap()
    }

    #[test]
    fn test_create_compiles_program() {
        let mut backend = RecordingBackend::new(64, 64);
        let pipeline = pipeline(&mut backend);
        assert!(pipeline.shader_programs().are_programs_valid());
        assert_eq!(backend.live_program_count(), 1);
        assert_eq!(backend.live_buffer_count(), 2);
    }

    #[test]
    fn test_missing_shaders_are_not_fatal() {
        let mut backend = RecordingBackend::new(64, 64);
        let config = DemoConfig {
            shader_dirs: vec![PathBuf::from("/nonexistent/shader/dir")],
            ..Default::default()
        };
        let pipeline = VrsPipeline::create(&mut backend, &config).unwrap();
        assert!(!pipeline.shader_programs().are_programs_valid());

        backend.clear_commands();
        pipeline.set_shader_program(&mut backend);
        assert!(backend.commands().is_empty());
    }

    #[test]
    fn test_scene_upload_binds_scene_slot() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut pipeline = pipeline(&mut backend);
        backend.clear_commands();

        pipeline.scene_data_mut().load_factor = 16;
        pipeline.update_scene_uniforms(&mut backend);

        let commands = backend.commands();
        assert!(matches!(commands[0], Command::UpdateUniformBuffer { size: 144, .. }));
        assert!(matches!(
            commands[1],
            Command::BindUniformBuffer { binding: 0, .. }
        ));
    }

    #[test]
    fn test_object_upload_carries_transforms_and_color() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut pipeline = pipeline(&mut backend);
        backend.clear_commands();

        pipeline.set_object_color(Vec3::new(0.0, 1.0, 0.0));
        pipeline.set_model_matrix(Mat4::from_scale(Vec3::splat(0.5)));
        pipeline.update_object_uniforms(&mut backend);

        assert_eq!(VrsPipeline::OBJECT_UNIFORM_SIZE, 272);
        let commands = backend.commands();
        assert!(matches!(commands[0], Command::UpdateUniformBuffer { size: 272, .. }));
        assert!(matches!(
            commands[1],
            Command::BindUniformBuffer { binding: 1, .. }
        ));

        let color: ObjectColor = bytemuck::pod_read_unaligned(&pipeline.object_bytes[256..]);
        assert_eq!(color.color, Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut pipeline = pipeline(&mut backend);
        pipeline.destroy(&mut backend);
        assert_eq!(backend.live_program_count(), 0);
        assert_eq!(backend.live_buffer_count(), 0);
    }
}
