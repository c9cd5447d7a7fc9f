//! VRS torus demo
//!
//! Run with:
//!   cargo run --release
//!   cargo run --release -- --tori 200 --mode 4x4
//!
//! Controls:
//!   Left drag  - Orbit the camera
//!   Scroll     - Zoom
//!   Escape     - Exit

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vrs_demo::{
    backend::{vulkan::VulkanBackend, BackendError, GraphicsBackend, ShadingRate},
    logging::{init_logging, LoggingConfig},
    resources::ShadingMode,
    DemoConfig, DemoError, DemoSettings, FrameDriver, VrsDemo, VulkanEguiIntegration, Window,
};
use winit::{
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
};

#[derive(Parser, Debug)]
#[command(
    name = "vrs-demo",
    about = "Variable rate shading on a grid of procedural tori",
    long_about = "Renders a grid of tori with VK_NV_shading_rate_image.\n\n\
        The shading rate comes from a rate image (foveated, constant or\n\
        following the pointer) and a pair of viewport palettes. Every fifth\n\
        torus can be exempted from rate reduction.",
    version
)]
struct Args {
    /// Initial window width
    #[arg(long, default_value_t = 1200)]
    width: u32,

    /// Initial window height
    #[arg(long, default_value_t = 900)]
    height: u32,

    /// Present without waiting for vertical blank
    #[arg(long)]
    no_vsync: bool,

    /// Extra shader directory, searched before the defaults (repeatable)
    #[arg(long = "shader-dir", value_name = "DIR")]
    shader_dirs: Vec<PathBuf>,

    /// Number of tori
    #[arg(long, default_value_t = 16)]
    tori: u32,

    /// Iterations of the synthetic fragment workload
    #[arg(long, default_value_t = 16)]
    fragment_load: u32,

    /// Shading rate image: varying, 1x1, 2x2, 4x4 or mouse
    #[arg(long, default_value = "varying")]
    mode: ShadingMode,

    /// Density of the outer rate class: none, 1x1, 2x2 or 4x4
    #[arg(long, default_value = "none")]
    periphery: ShadingRate,

    /// Log filter in env_logger syntax, overrides RUST_LOG
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,
}

impl Args {
    fn demo_config(&self) -> DemoConfig {
        let defaults = DemoConfig::default();
        let mut shader_dirs = self.shader_dirs.clone();
        shader_dirs.extend(defaults.shader_dirs);

        DemoConfig {
            width: self.width,
            height: self.height,
            vsync: !self.no_vsync,
            shader_dirs,
            periphery_rate: self.periphery,
            initial: DemoSettings {
                load_factor: self.tori,
                fragment_load_factor: self.fragment_load,
                shading_mode: self.mode,
                ..DemoSettings::default()
            }
            .clamp(),
            ..defaults
        }
    }
}

/// Everything the event loop drives. Fields drop in order, the window last.
struct App {
    egui: VulkanEguiIntegration,
    demo: VrsDemo,
    backend: VulkanBackend,
    window: Window,
    driver: FrameDriver,
    failed: bool,
}

impl App {
    fn render_frame(&mut self) -> Result<(), DemoError> {
        if self.window.is_minimized() {
            return Ok(());
        }
        if self.window.was_resized() {
            let (width, height) = self.window.dimensions();
            self.backend.resize(width, height);
            self.window.clear_resize_flag();
        }

        self.demo.update_camera(self.window.camera_input());
        self.window.reset_input_deltas();

        let cursor = self.window.cursor_normalized();
        let winit_window = self.window.window();
        let egui = &mut self.egui;
        egui.begin_frame(winit_window);
        let ctx = egui.context().clone();

        self.driver.run_frame(
            &mut self.demo,
            &mut self.backend,
            Some(&ctx),
            cursor,
            |backend| {
                egui.end_frame(winit_window);
                if let Err(e) = egui.render(backend) {
                    log::warn!("UI overlay skipped: {}", e);
                }
            },
        )?;
        Ok(())
    }

    fn handle_window_event(&mut self, event: WindowEvent, elwt: &EventLoopWindowTarget<()>) {
        let consumed = self.egui.on_window_event(self.window.window(), &event);
        let ui_captured = consumed || self.egui.wants_pointer_input();
        self.window.handle_event(&event, ui_captured);

        if self.window.should_close() {
            elwt.exit();
            return;
        }

        if let WindowEvent::RedrawRequested = event {
            match self.render_frame() {
                Ok(()) => {}
                Err(DemoError::Backend(BackendError::SurfaceLost)) => {
                    let (width, height) = self.window.dimensions();
                    log::debug!("Surface out of date, recreating at {}x{}", width, height);
                    self.backend.resize(width, height);
                }
                Err(e) => {
                    log::error!("Frame failed: {}", e);
                    self.failed = true;
                    elwt.exit();
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.egui.destroy(&self.backend);
        self.demo.destroy(&mut self.backend);
        log::info!("Rendered {} frames", self.driver.frame_index());
    }
}

fn start(event_loop: &EventLoop<()>, config: &DemoConfig) -> Result<App, DemoError> {
    let window = Window::new(event_loop, &config.title, config.width, config.height)
        .map_err(|e| BackendError::InitializationFailed(format!("Window: {}", e)))?;
    let mut backend = VulkanBackend::new(window.window(), config.vsync)?;
    let egui = VulkanEguiIntegration::new(&backend, window.window())?;

    let demo = match VrsDemo::begin(&mut backend, config) {
        Ok(demo) => demo,
        Err(e) => {
            let mut egui = egui;
            egui.destroy(&backend);
            return Err(e);
        }
    };

    Ok(App {
        window,
        backend,
        egui,
        demo,
        driver: FrameDriver::new(),
        failed: false,
    })
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&LoggingConfig {
        env_filter: args.log_filter.clone(),
        ..Default::default()
    });

    let config = args.demo_config();
    log::info!(
        "Starting VRS demo: {} tori, mode '{}', periphery {}",
        config.initial.load_factor,
        config.initial.shading_mode,
        config.periphery_rate.label()
    );

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("Failed to create event loop: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut app = match start(&event_loop, &config) {
        Ok(app) => app,
        Err(e) => {
            log::error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = event_loop.run(|event, elwt: &EventLoopWindowTarget<()>| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => app.handle_window_event(event, elwt),
            Event::AboutToWait => app.window.request_redraw(),
            Event::LoopExiting => app.shutdown(),
            _ => {}
        }
    });

    if let Err(e) = result {
        log::error!("Event loop failed: {}", e);
        return ExitCode::FAILURE;
    }
    if app.failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_match_demo_config() {
        let args = Args::try_parse_from(["vrs-demo"]).unwrap();
        let config = args.demo_config();
        assert_eq!((config.width, config.height), (1200, 900));
        assert!(config.vsync);
        assert_eq!(config.periphery_rate, ShadingRate::NoInvocations);
        assert_eq!(config.initial, DemoSettings::default());
        assert_eq!(config.shader_dirs, DemoConfig::default().shader_dirs);
    }

    #[test]
    fn test_shader_dirs_are_searched_first() {
        let args = Args::try_parse_from([
            "vrs-demo",
            "--shader-dir",
            "/a",
            "--shader-dir",
            "/b",
        ])
        .unwrap();
        let dirs = args.demo_config().shader_dirs;
        assert_eq!(dirs[0], PathBuf::from("/a"));
        assert_eq!(dirs[1], PathBuf::from("/b"));
        assert_eq!(dirs.len(), 2 + DemoConfig::default().shader_dirs.len());
    }

    #[rstest]
    #[case("varying", ShadingMode::Varying)]
    #[case("4x4", ShadingMode::Rate4x4)]
    #[case("mouse", ShadingMode::MouseTracking)]
    fn test_mode_flag(#[case] value: &str, #[case] expected: ShadingMode) {
        let args = Args::try_parse_from(["vrs-demo", "--mode", value]).unwrap();
        assert_eq!(args.demo_config().initial.shading_mode, expected);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let args =
            Args::try_parse_from(["vrs-demo", "--tori", "5000", "--fragment-load", "0"]).unwrap();
        let settings = args.demo_config().initial;
        assert_eq!(settings.load_factor, 1000);
        assert_eq!(settings.fragment_load_factor, 1);
    }

    #[test]
    fn test_invalid_periphery_is_rejected() {
        assert!(Args::try_parse_from(["vrs-demo", "--periphery", "8x8"]).is_err());
    }

    #[test]
    fn test_no_vsync_and_periphery() {
        let args =
            Args::try_parse_from(["vrs-demo", "--no-vsync", "--periphery", "4x4"]).unwrap();
        let config = args.demo_config();
        assert!(!config.vsync);
        assert_eq!(config.periphery_rate, ShadingRate::OneInvocationPer4x4Pixels);
    }
}
