//! Recording backend for tests and headless runs.
//!
//! This backend doesn't perform any GPU work. Every call is appended to a
//! command list so callers can assert on what a frame issued and in which
//! order, without requiring GPU hardware.

use std::collections::{HashMap, HashSet};

use crate::backend::traits::*;
use crate::backend::types::*;

/// A command issued against the [`RecordingBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginFrame,
    EndFrame,
    CreateBuffer { buffer: BufferHandle, size: u64 },
    CreateUniformBuffer { buffer: BufferHandle, size: u64 },
    UpdateUniformBuffer { buffer: BufferHandle, size: u64 },
    BindUniformBuffer { binding: u32, buffer: BufferHandle },
    DestroyBuffer(BufferHandle),
    CreateTexture { texture: TextureHandle, width: u32, height: u32, format: TextureFormat },
    WriteTexture { texture: TextureHandle, width: u32, height: u32 },
    DestroyTexture(TextureHandle),
    CreateProgram(ProgramHandle),
    DestroyProgram(ProgramHandle),
    SetProgram(ProgramHandle),
    BeginRenderPass { width: u32, height: u32 },
    EndRenderPass,
    SetViewport { width: f32, height: f32 },
    SetVertexBuffer { slot: u32, buffer: BufferHandle },
    SetIndexBuffer(BufferHandle),
    ClearVertexBuffers,
    DrawIndexed { index_count: u32, instance_count: u32 },
    SetShadingRatePalette { palette: u32, rates: Vec<ShadingRate> },
    SelectShadingRatePalette(u32),
    BindShadingRateImage(TextureHandle),
    SetShadingRateImageEnabled(bool),
    BlitToSurface { texture: TextureHandle, src_width: u32, src_height: u32 },
}

/// Backend that records commands instead of executing them
#[derive(Debug)]
pub struct RecordingBackend {
    commands: Vec<Command>,
    extensions: HashSet<String>,
    properties: ShadingRateProperties,
    surface: (u32, u32),
    buffers: HashSet<u64>,
    textures: HashMap<u64, TextureDescriptor>,
    texture_data: HashMap<u64, Vec<u8>>,
    programs: HashSet<u64>,
    fail_program_creation: bool,
    next_id: u64,
}

impl RecordingBackend {
    /// Extensions a VRS capable device reports
    pub const VRS_EXTENSIONS: [&'static str; 2] =
        ["VK_NV_shading_rate_image", "VK_NV_viewport_array2"];

    /// Create a backend reporting full VRS support and the given surface size
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_capabilities(width, height, &Self::VRS_EXTENSIONS, ShadingRateProperties::default())
    }

    /// Create a backend with an explicit extension list and rate image limits
    pub fn with_capabilities(
        width: u32,
        height: u32,
        extensions: &[&str],
        properties: ShadingRateProperties,
    ) -> Self {
        Self {
            commands: Vec::new(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            properties,
            surface: (width.max(1), height.max(1)),
            buffers: HashSet::new(),
            textures: HashMap::new(),
            texture_data: HashMap::new(),
            programs: HashSet::new(),
            fail_program_creation: false,
            next_id: 1,
        }
    }

    /// Make every following `create_program` call fail, as a broken shader would
    pub fn set_program_creation_fails(&mut self, fails: bool) {
        self.fail_program_creation = fails;
    }

    /// All commands recorded so far
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Forget the recorded commands (live resources are kept)
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Number of recorded commands matching a predicate
    pub fn count(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands.iter().filter(|c| predicate(c)).count()
    }

    /// Last data written to a texture
    pub fn texture_data(&self, texture: TextureHandle) -> Option<&[u8]> {
        self.texture_data.get(&texture.0).map(Vec::as_slice)
    }

    /// Descriptor of a live texture
    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn live_program_count(&self) -> usize {
        self.programs.len()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, command: Command) {
        log::trace!("RecordingBackend: {:?}", command);
        self.commands.push(command);
    }
}

impl GraphicsBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "Recording Backend"
    }

    fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    fn shading_rate_properties(&self) -> ShadingRateProperties {
        self.properties
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface = (width, height);
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        self.record(Command::BeginFrame);
        Ok(FrameContext {
            width: self.surface.0,
            height: self.surface.1,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.record(Command::EndFrame);
        Ok(())
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        if (data.len() as u64) > desc.size {
            return Err(BackendError::BufferCreationFailed(format!(
                "{} bytes do not fit into {:?} of size {}",
                data.len(),
                desc.label,
                desc.size
            )));
        }
        let buffer = BufferHandle(self.next_id());
        self.buffers.insert(buffer.0);
        self.record(Command::CreateBuffer { buffer, size: desc.size });
        Ok(buffer)
    }

    fn create_uniform_buffer(&mut self, _label: &str, size: u64) -> BackendResult<BufferHandle> {
        let buffer = BufferHandle(self.next_id());
        self.buffers.insert(buffer.0);
        self.record(Command::CreateUniformBuffer { buffer, size });
        Ok(buffer)
    }

    fn update_uniform_buffer(&mut self, buffer: BufferHandle, data: &[u8]) {
        self.record(Command::UpdateUniformBuffer {
            buffer,
            size: data.len() as u64,
        });
    }

    fn bind_uniform_buffer(&mut self, binding: u32, buffer: BufferHandle) {
        self.record(Command::BindUniformBuffer { binding, buffer });
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
        self.record(Command::DestroyBuffer(buffer));
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} has zero extent",
                desc.label
            )));
        }
        let texture = TextureHandle(self.next_id());
        self.textures.insert(texture.0, desc.clone());
        self.record(Command::CreateTexture {
            texture,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        });
        Ok(texture)
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::TextureCreationFailed("Texture not found".into()));
        }
        Ok(TextureViewHandle(self.next_id()))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let desc = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::UploadFailed("Texture not found".into()))?;
        let expected = (width * height * desc.format.bytes_per_pixel()) as usize;
        if desc.width != width || desc.height != height || data.len() != expected {
            return Err(BackendError::UploadFailed(format!(
                "{}x{} upload ({} bytes) does not match texture {:?}",
                width,
                height,
                data.len(),
                desc.label
            )));
        }
        self.texture_data.insert(texture.0, data.to_vec());
        self.record(Command::WriteTexture { texture, width, height });
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
        self.texture_data.remove(&texture.0);
        self.record(Command::DestroyTexture(texture));
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        if self.fail_program_creation {
            return Err(BackendError::ShaderCreationFailed(format!(
                "{:?} rejected by recording backend",
                desc.label
            )));
        }
        let program = ProgramHandle(self.next_id());
        self.programs.insert(program.0);
        self.record(Command::CreateProgram(program));
        Ok(program)
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program.0);
        self.record(Command::DestroyProgram(program));
    }

    fn set_program(&mut self, program: ProgramHandle) {
        self.record(Command::SetProgram(program));
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.record(Command::BeginRenderPass {
            width: desc.width,
            height: desc.height,
        });
    }

    fn end_render_pass(&mut self) {
        self.record(Command::EndRenderPass);
    }

    fn set_viewport(&mut self, _x: f32, _y: f32, width: f32, height: f32, _min_depth: f32, _max_depth: f32) {
        self.record(Command::SetViewport { width, height });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, _layout: &VertexBufferLayout) {
        self.record(Command::SetVertexBuffer { slot, buffer });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _format: IndexFormat) {
        self.record(Command::SetIndexBuffer(buffer));
    }

    fn clear_vertex_buffers(&mut self) {
        self.record(Command::ClearVertexBuffers);
    }

    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        _base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) {
        self.record(Command::DrawIndexed {
            index_count: indices.end - indices.start,
            instance_count: instances.end - instances.start,
        });
    }

    fn set_shading_rate_palette(&mut self, palette: u32, rates: &[ShadingRate]) {
        self.record(Command::SetShadingRatePalette {
            palette,
            rates: rates.to_vec(),
        });
    }

    fn select_shading_rate_palette(&mut self, palette: u32) {
        self.record(Command::SelectShadingRatePalette(palette));
    }

    fn bind_shading_rate_image(&mut self, texture: TextureHandle) {
        self.record(Command::BindShadingRateImage(texture));
    }

    fn set_shading_rate_image_enabled(&mut self, enabled: bool) {
        self.record(Command::SetShadingRateImageEnabled(enabled));
    }

    fn blit_to_surface(&mut self, texture: TextureHandle, src_width: u32, src_height: u32) {
        self.record(Command::BlitToSurface {
            texture,
            src_width,
            src_height,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_vrs_extensions() {
        let backend = RecordingBackend::new(64, 64);
        assert!(backend.has_extension("VK_NV_shading_rate_image"));
        assert!(backend.has_extension("VK_NV_viewport_array2"));
        assert!(!backend.has_extension("VK_KHR_fragment_shading_rate"));
    }

    #[test]
    fn test_write_texture_rejects_wrong_size() {
        let mut backend = RecordingBackend::new(64, 64);
        let texture = backend
            .create_texture(&TextureDescriptor {
                label: Some("rate".into()),
                width: 4,
                height: 2,
                format: TextureFormat::R8Uint,
                usage: TextureUsage::SHADING_RATE | TextureUsage::COPY_DST,
            })
            .unwrap();

        assert!(backend.write_texture(texture, &[0; 8], 4, 2).is_ok());
        assert!(backend.write_texture(texture, &[0; 7], 4, 2).is_err());
        assert_eq!(backend.texture_data(texture), Some(&[0u8; 8][..]));
    }

    #[test]
    fn test_destroy_releases_resources() {
        let mut backend = RecordingBackend::new(64, 64);
        let buffer = backend.create_uniform_buffer("scene", 128).unwrap();
        assert_eq!(backend.live_buffer_count(), 1);
        backend.destroy_buffer(buffer);
        assert_eq!(backend.live_buffer_count(), 0);
    }
}
