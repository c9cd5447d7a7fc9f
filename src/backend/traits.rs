//! Core backend abstraction traits
//!
//! These traits define the interface that the Vulkan and recording backends implement.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Required extension missing: {0}")]
    ExtensionMissing(String),
    #[error("Failed to upload data: {0}")]
    UploadFailed(String),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureViewHandle(pub(crate) u64);

/// Handle to a linked shader program (vertex + fragment stage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub(crate) u64);

/// One stage of a program, as WGSL source text
#[derive(Debug, Clone)]
pub struct ShaderModuleSource {
    pub stage: ShaderStage,
    pub source: String,
    pub entry_point: String,
}

/// Everything a backend needs to build a graphics program.
///
/// The vertex input layout is not part of the program; it comes from the
/// vertex buffer bound at draw time.
#[derive(Debug, Clone)]
pub struct ProgramDescriptor {
    pub label: Option<String>,
    pub vertex: ShaderModuleSource,
    pub fragment: ShaderModuleSource,
    /// Uniform buffer binding points read by the program
    pub uniform_bindings: Vec<u32>,
    /// Binding point of the shading rate image, when the program samples it
    pub rate_image_binding: Option<u32>,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth_compare: CompareFunction,
}

#[derive(Debug, Clone)]
pub enum LoadOp {
    Clear([f32; 4]),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

/// Color attachment for render pass
#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub view: TextureViewHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

/// Depth stencil attachment for render pass
#[derive(Debug, Clone)]
pub struct DepthStencilAttachment {
    pub view: TextureViewHandle,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub depth_clear_value: f32,
    pub stencil_clear_value: u32,
}

/// Render pass descriptor
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub color_attachment: ColorAttachment,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
    pub width: u32,
    pub height: u32,
}

/// Frame context returned when beginning a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub width: u32,
    pub height: u32,
}

/// Main graphics backend trait
pub trait GraphicsBackend {
    /// Human readable backend name
    fn name(&self) -> &'static str;

    /// Whether a named device extension is present
    fn has_extension(&self, name: &str) -> bool;

    /// Shading rate image granularity and palette capacity
    fn shading_rate_properties(&self) -> ShadingRateProperties;

    /// Resize the swapchain
    fn resize(&mut self, width: u32, height: u32);

    /// Get the actual surface size (may be clamped by device limits)
    fn surface_size(&self) -> (u32, u32);

    /// Begin a new frame
    fn begin_frame(&mut self) -> BackendResult<FrameContext>;

    /// End and present the frame
    fn end_frame(&mut self) -> BackendResult<()>;

    // Resource creation

    /// Create a buffer with initial data
    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8])
        -> BackendResult<BufferHandle>;

    /// Create a uniform buffer that is rewritten many times per frame.
    ///
    /// Every [`update_uniform_buffer`](Self::update_uniform_buffer) call must stay
    /// visible to the draws recorded between it and the next update, so the
    /// backend may version the storage behind the handle.
    fn create_uniform_buffer(&mut self, label: &str, size: u64) -> BackendResult<BufferHandle>;

    /// Replace the contents of a uniform buffer
    fn update_uniform_buffer(&mut self, buffer: BufferHandle, data: &[u8]);

    /// Bind a uniform buffer to a binding point for subsequent draws
    fn bind_uniform_buffer(&mut self, binding: u32, buffer: BufferHandle);

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Create a texture view
    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle>;

    /// Write data to a texture
    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32)
        -> BackendResult<()>;

    /// Destroy a texture together with the views created from it
    fn destroy_texture(&mut self, texture: TextureHandle);

    // Programs

    /// Compile and link a program
    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle>;

    /// Destroy a program
    fn destroy_program(&mut self, program: ProgramHandle);

    /// Use a program for subsequent draws
    fn set_program(&mut self, program: ProgramHandle);

    // Command recording

    /// Begin a render pass
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor);

    /// End the current render pass
    fn end_render_pass(&mut self);

    /// Set viewport
    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32);

    /// Set vertex buffer and the attribute layout it feeds
    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, layout: &VertexBufferLayout);

    /// Set index buffer
    fn set_index_buffer(&mut self, buffer: BufferHandle, format: IndexFormat);

    /// Drop all vertex and index buffer bindings
    fn clear_vertex_buffers(&mut self);

    /// Draw indexed primitives
    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    );

    // Variable rate shading

    /// Program one viewport palette. `rates` must hold exactly `palette_size` entries.
    fn set_shading_rate_palette(&mut self, palette: u32, rates: &[ShadingRate]);

    /// Select which programmed palette applies to subsequent draws
    fn select_shading_rate_palette(&mut self, palette: u32);

    /// Bind the image whose texels index into the palette
    fn bind_shading_rate_image(&mut self, texture: TextureHandle);

    /// Enable or disable rate-controlled shading for subsequent draws
    fn set_shading_rate_image_enabled(&mut self, enabled: bool);

    // Presentation

    /// Copy a color texture onto the whole surface using nearest filtering
    fn blit_to_surface(&mut self, texture: TextureHandle, src_width: u32, src_height: u32);
}
