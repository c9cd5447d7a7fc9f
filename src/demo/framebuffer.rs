//! Off-screen scene framebuffer

use crate::backend::{
    BackendResult, ColorAttachment, DepthStencilAttachment, GraphicsBackend, LoadOp,
    RenderPassDescriptor, StoreOp, TextureDescriptor, TextureFormat, TextureHandle, TextureUsage,
    TextureViewHandle,
};

#[derive(Debug, Clone, Copy)]
struct Attachment {
    texture: TextureHandle,
    view: TextureViewHandle,
}

/// RGBA8 color plus D24S8 depth-stencil, resolved to the window every frame
#[derive(Debug, Default)]
pub struct SceneFramebuffer {
    color: Option<Attachment>,
    depth: Option<Attachment>,
    width: u32,
    height: u32,
    generation: u32,
}

impl SceneFramebuffer {
    pub const CLEAR_COLOR: [f32; 4] = [1.0, 1.0, 1.0, 1.0];
    pub const CLEAR_DEPTH: f32 = 1.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_texture(&self) -> Option<TextureHandle> {
        self.color.map(|a| a.texture)
    }

    /// Number of times the attachments have been (re)allocated
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Reallocate the attachments if the size differs. Returns whether it did.
    pub fn ensure_size(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> BackendResult<bool> {
        let (width, height) = (width.max(1), height.max(1));
        if self.color.is_some() && self.width == width && self.height == height {
            return Ok(false);
        }

        self.destroy(backend);
        log::debug!("Scene framebuffer resized to {}x{}", width, height);

        self.color = Some(Self::create_attachment(
            backend,
            "Scene Color",
            width,
            height,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
        )?);
        self.depth = Some(Self::create_attachment(
            backend,
            "Scene Depth",
            width,
            height,
            TextureFormat::Depth24PlusStencil8,
            TextureUsage::RENDER_ATTACHMENT,
        )?);
        self.width = width;
        self.height = height;
        self.generation += 1;
        Ok(true)
    }

    fn create_attachment(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> BackendResult<Attachment> {
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(label.to_string()),
            width,
            height,
            format,
            usage,
        })?;
        match backend.create_texture_view(texture) {
            Ok(view) => Ok(Attachment { texture, view }),
            Err(e) => {
                backend.destroy_texture(texture);
                Err(e)
            }
        }
    }

    /// Render pass clearing color to white and depth to 1
    pub fn render_pass_descriptor(&self) -> Option<RenderPassDescriptor> {
        let color = self.color?;
        let depth = self.depth?;
        Some(RenderPassDescriptor {
            label: Some("Scene Pass".into()),
            color_attachment: ColorAttachment {
                view: color.view,
                load_op: LoadOp::Clear(Self::CLEAR_COLOR),
                store_op: StoreOp::Store,
            },
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth.view,
                depth_load_op: LoadOp::Clear([Self::CLEAR_DEPTH; 4]),
                depth_store_op: StoreOp::Discard,
                depth_clear_value: Self::CLEAR_DEPTH,
                stencil_clear_value: 0,
            }),
            width: self.width,
            height: self.height,
        })
    }

    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        for attachment in [self.color.take(), self.depth.take()].into_iter().flatten() {
            backend.destroy_texture(attachment.texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    #[test]
    fn test_ensure_size_reallocates_only_on_change() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut framebuffer = SceneFramebuffer::new();

        assert!(framebuffer.ensure_size(&mut backend, 800, 600).unwrap());
        assert!(!framebuffer.ensure_size(&mut backend, 800, 600).unwrap());
        assert!(framebuffer.ensure_size(&mut backend, 400, 300).unwrap());

        assert_eq!(framebuffer.generation(), 2);
        assert_eq!(backend.live_texture_count(), 2);
        let color = framebuffer.color_texture().unwrap();
        let desc = backend.texture_descriptor(color).unwrap();
        assert_eq!((desc.width, desc.height, desc.format), (400, 300, TextureFormat::Rgba8Unorm));
    }

    #[test]
    fn test_clear_values() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut framebuffer = SceneFramebuffer::new();
        assert!(framebuffer.render_pass_descriptor().is_none());

        framebuffer.ensure_size(&mut backend, 0, 0).unwrap();
        let desc = framebuffer.render_pass_descriptor().unwrap();
        assert_eq!((desc.width, desc.height), (1, 1));
        assert!(matches!(desc.color_attachment.load_op, LoadOp::Clear(c) if c == [1.0; 4]));
        assert_eq!(desc.depth_stencil_attachment.unwrap().depth_clear_value, 1.0);

        framebuffer.destroy(&mut backend);
        assert_eq!(backend.live_texture_count(), 0);
    }
}
