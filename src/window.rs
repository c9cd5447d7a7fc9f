//! Window management using winit

use std::sync::Arc;

use glam::Vec2;
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::EventLoop,
    keyboard::{Key, NamedKey},
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::scene::CameraInput;

/// Pixels of a touchpad scroll that count as one wheel notch
const PIXELS_PER_SCROLL_LINE: f32 = 40.0;

/// Wrapper around winit window with pointer and camera input state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
    /// Last pointer position in physical pixels
    cursor: Option<Vec2>,
    camera_input: CameraInput,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, winit::error::OsError> {
        let window = Arc::new(
            WindowBuilder::new()
                .with_title(title)
                .with_inner_size(PhysicalSize::new(width, height))
                .build(event_loop)?,
        );
        let size = window.inner_size();

        Ok(Self {
            window,
            width: size.width,
            height: size.height,
            resized: false,
            close_requested: false,
            cursor: None,
            camera_input: CameraInput::new(),
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Get current window dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Check if window was resized since last frame
    pub fn was_resized(&self) -> bool {
        self.resized
    }

    /// Clear the resize flag
    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    /// Check if close was requested
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Pointer position normalized to [0, 1] over the window, if inside it
    pub fn cursor_normalized(&self) -> Option<Vec2> {
        let cursor = self.cursor?;
        if self.is_minimized() {
            return None;
        }
        Some(cursor / Vec2::new(self.width as f32, self.height as f32))
    }

    /// Camera input gathered since the last [`reset_input_deltas`](Self::reset_input_deltas)
    pub fn camera_input(&self) -> &CameraInput {
        &self.camera_input
    }

    pub fn reset_input_deltas(&mut self) {
        self.camera_input.reset_deltas();
    }

    /// Handle window events.
    ///
    /// With `ui_captured` set, buttons and the wheel belong to the UI and
    /// only the pointer position is tracked.
    pub fn handle_event(&mut self, event: &WindowEvent, ui_captured: bool) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if !ui_captured
                    && event.state == ElementState::Pressed
                    && event.logical_key == Key::Named(NamedKey::Escape)
                {
                    self.close_requested = true;
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                let position = Vec2::new(position.x as f32, position.y as f32);
                if let Some(last) = self.cursor {
                    if self.camera_input.orbit_active {
                        self.camera_input.mouse_delta += position - last;
                    }
                }
                self.cursor = Some(position);
            }
            WindowEvent::CursorLeft { .. } => {
                self.cursor = None;
                self.camera_input.orbit_active = false;
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => {
                self.camera_input.orbit_active = *state == ElementState::Pressed && !ui_captured;
            }
            WindowEvent::MouseWheel { delta, .. } if !ui_captured => {
                self.camera_input.scroll_delta += match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y,
                    MouseScrollDelta::PixelDelta(p) => p.y as f32 / PIXELS_PER_SCROLL_LINE,
                };
            }
            _ => {}
        }
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}
