//! Vulkan egui integration using egui-ash-renderer
//!
//! The settings panel is drawn straight onto the swapchain image after the
//! scene blit, in the backend's overlay render pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;
use egui_ash_renderer::{Options, Renderer};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use winit::event::WindowEvent;
use winit::window::Window;

use crate::backend::vulkan::VulkanBackend;
use crate::backend::{BackendError, BackendResult};

/// Vulkan-specific egui integration
pub struct VulkanEguiIntegration {
    ctx: egui::Context,
    winit_state: egui_winit::State,
    /// Must be dropped before the allocator
    renderer: Option<Renderer>,
    /// egui-ash-renderer wants its own `std::sync::Mutex` allocator. It uses
    /// cloned device handles and has to go before the backend's device.
    allocator: Option<Arc<Mutex<Allocator>>>,
    paint_jobs: Vec<egui::ClippedPrimitive>,
    textures_delta: egui::TexturesDelta,
    /// Framebuffers per swapchain image view, valid for one swapchain generation
    framebuffers: HashMap<vk::ImageView, vk::Framebuffer>,
    framebuffer_generation: u64,
}

impl VulkanEguiIntegration {
    pub fn new(backend: &VulkanBackend, window: &Window) -> BackendResult<Self> {
        let ctx = egui::Context::default();

        let winit_state = egui_winit::State::new(
            ctx.clone(),
            egui::ViewportId::ROOT,
            window,
            Some(window.scale_factor() as f32),
            None,
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: backend.instance().clone(),
            device: backend.device().clone(),
            physical_device: backend.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| BackendError::InitializationFailed(format!("egui allocator: {}", e)))?;
        let allocator = Arc::new(Mutex::new(allocator));

        let renderer = Renderer::with_gpu_allocator(
            allocator.clone(),
            backend.device().clone(),
            backend.egui_render_pass(),
            Options {
                srgb_framebuffer: backend.swapchain_is_srgb(),
                ..Default::default()
            },
        )
        .map_err(|e| BackendError::InitializationFailed(format!("egui renderer: {}", e)))?;

        Ok(Self {
            ctx,
            winit_state,
            renderer: Some(renderer),
            allocator: Some(allocator),
            paint_jobs: Vec::new(),
            textures_delta: egui::TexturesDelta::default(),
            framebuffers: HashMap::new(),
            framebuffer_generation: backend.swapchain_generation(),
        })
    }

    /// Destroy GPU resources. Must be called before VulkanBackend is dropped.
    pub fn destroy(&mut self, backend: &VulkanBackend) {
        unsafe {
            let _ = backend.device().device_wait_idle();
        }
        self.release_framebuffers(backend);

        // Renderer first, it allocates from the allocator
        self.renderer = None;
        self.allocator = None;
    }

    /// Feed a window event to egui. Returns `true` when egui consumed it.
    pub fn on_window_event(&mut self, window: &Window, event: &WindowEvent) -> bool {
        self.winit_state.on_window_event(window, event).consumed
    }

    pub fn begin_frame(&mut self, window: &Window) {
        let raw_input = self.winit_state.take_egui_input(window);
        self.ctx.begin_frame(raw_input);
    }

    pub fn end_frame(&mut self, window: &Window) {
        let full_output = self.ctx.end_frame();

        self.winit_state
            .handle_platform_output(window, full_output.platform_output);

        self.paint_jobs = self
            .ctx
            .tessellate(full_output.shapes, full_output.pixels_per_point);
        self.textures_delta.append(full_output.textures_delta);
    }

    /// Record the egui draw into the frame being recorded by `backend`.
    ///
    /// Does nothing outside of a frame.
    pub fn render(&mut self, backend: &mut VulkanBackend) -> BackendResult<()> {
        if !backend.is_recording() {
            return Ok(());
        }
        backend.prepare_overlay_target();

        if backend.swapchain_generation() != self.framebuffer_generation {
            // Swapchain recreation waits for the device, the old framebuffers are idle
            self.release_framebuffers(backend);
            self.framebuffer_generation = backend.swapchain_generation();
        }

        let extent = backend.swapchain_extent();
        let view = backend.current_swapchain_image_view();
        let framebuffer = match self.framebuffers.get(&view) {
            Some(&framebuffer) => framebuffer,
            None => {
                let attachments = [view];
                let framebuffer_info = vk::FramebufferCreateInfo::default()
                    .render_pass(backend.egui_render_pass())
                    .attachments(&attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);
                let framebuffer = unsafe {
                    backend
                        .device()
                        .create_framebuffer(&framebuffer_info, None)
                        .map_err(|e| {
                            BackendError::InitializationFailed(format!("egui framebuffer: {:?}", e))
                        })?
                };
                self.framebuffers.insert(view, framebuffer);
                framebuffer
            }
        };

        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };

        let textures: Vec<_> = self.textures_delta.set.drain(..).collect();
        renderer
            .set_textures(backend.graphics_queue(), backend.command_pool(), &textures)
            .map_err(|e| BackendError::UploadFailed(format!("egui textures: {}", e)))?;

        let command_buffer = backend.command_buffer();
        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(backend.egui_render_pass())
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            });

        let device = backend.device();
        let draw_result = unsafe {
            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_begin,
                vk::SubpassContents::INLINE,
            );
            let result = renderer.cmd_draw(
                command_buffer,
                extent,
                self.ctx.pixels_per_point(),
                &self.paint_jobs,
            );
            device.cmd_end_render_pass(command_buffer);
            result
        };
        backend.mark_overlay_recorded();
        draw_result.map_err(|e| BackendError::PipelineCreationFailed(format!("egui draw: {}", e)))?;

        // TODO: defer these until the frame fence so a freed texture is never in flight
        let freed: Vec<_> = self.textures_delta.free.drain(..).collect();
        renderer
            .free_textures(&freed)
            .map_err(|e| BackendError::UploadFailed(format!("egui textures: {}", e)))?;
        Ok(())
    }

    fn release_framebuffers(&mut self, backend: &VulkanBackend) {
        for (_, framebuffer) in self.framebuffers.drain() {
            unsafe { backend.device().destroy_framebuffer(framebuffer, None) };
        }
    }

    pub fn context(&self) -> &egui::Context {
        &self.ctx
    }

    /// Check if egui wants keyboard input
    pub fn wants_keyboard_input(&self) -> bool {
        self.ctx.wants_keyboard_input()
    }

    /// Check if egui wants pointer input
    pub fn wants_pointer_input(&self) -> bool {
        self.ctx.wants_pointer_input()
    }
}

impl Drop for VulkanEguiIntegration {
    fn drop(&mut self) {
        if self.renderer.is_some() || self.allocator.is_some() {
            log::warn!("VulkanEguiIntegration::destroy() was not called before drop");
        }
    }
}
