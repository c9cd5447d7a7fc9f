//! Frame orchestration tests against the recording backend

use std::path::PathBuf;

use glam::Vec2;
use rstest::rstest;
use vrs_demo::backend::{Command, GraphicsBackend, RecordingBackend, ShadingRateProperties};
use vrs_demo::demo::{FrameDriver, VrsDemo};
use vrs_demo::resources::{ShadingMode, ShadingRateImage};
use vrs_demo::{DemoConfig, DemoSettings};

fn config(initial: DemoSettings) -> DemoConfig {
    DemoConfig {
        shader_dirs: vec![PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders")],
        initial,
        ..Default::default()
    }
}

fn start(width: u32, height: u32, initial: DemoSettings) -> (RecordingBackend, VrsDemo) {
    let mut backend = RecordingBackend::new(width, height);
    let demo = VrsDemo::begin(&mut backend, &config(initial)).expect("demo should start");
    backend.clear_commands();
    (backend, demo)
}

fn run_frame(driver: &mut FrameDriver, demo: &mut VrsDemo, backend: &mut RecordingBackend) {
    driver
        .run_frame(demo, backend, None, None, |_| {})
        .expect("frame should succeed");
}

fn is_object_upload(command: &Command) -> bool {
    matches!(command, Command::UpdateUniformBuffer { size: 272, .. })
}

fn is_scene_upload(command: &Command) -> bool {
    matches!(command, Command::UpdateUniformBuffer { size: 144, .. })
}

#[test]
fn test_sixteen_tori_one_upload_per_draw() {
    let (mut backend, mut demo) = start(1200, 900, DemoSettings::default());
    let mut driver = FrameDriver::new();
    run_frame(&mut driver, &mut demo, &mut backend);

    let commands = backend.commands();
    let draws: Vec<&Command> = commands
        .iter()
        .filter(|c| matches!(c, Command::DrawIndexed { .. }))
        .collect();
    assert_eq!(draws.len(), 16);
    assert!(draws
        .iter()
        .all(|c| matches!(c, Command::DrawIndexed { index_count: 384, instance_count: 1 })));

    // Exactly one object upload between consecutive draws
    let mut uploads_since_draw = 0;
    for command in commands {
        if is_object_upload(command) {
            uploads_since_draw += 1;
        } else if matches!(command, Command::DrawIndexed { .. }) {
            assert_eq!(uploads_since_draw, 1);
            uploads_since_draw = 0;
        }
    }

    assert_eq!(backend.count(is_scene_upload), 1);
    let scene_upload = commands.iter().position(is_scene_upload).unwrap();
    let first_object_upload = commands.iter().position(is_object_upload).unwrap();
    assert!(scene_upload < first_object_upload);
}

#[test]
fn test_frame_order() {
    let (mut backend, mut demo) = start(640, 480, DemoSettings::default());
    let mut driver = FrameDriver::new();
    run_frame(&mut driver, &mut demo, &mut backend);

    let commands = backend.commands();
    let position = |predicate: fn(&Command) -> bool| commands.iter().position(predicate).unwrap();

    let begin_frame = position(|c| matches!(c, Command::BeginFrame));
    let begin_pass = position(|c| matches!(c, Command::BeginRenderPass { .. }));
    let bind_rate = position(|c| matches!(c, Command::BindShadingRateImage(_)));
    let scene = position(is_scene_upload);
    let first_draw = position(|c| matches!(c, Command::DrawIndexed { .. }));
    let disable = position(|c| matches!(c, Command::SetShadingRateImageEnabled(false)));
    let end_pass = position(|c| matches!(c, Command::EndRenderPass));
    let blit = position(|c| matches!(c, Command::BlitToSurface { .. }));
    let end_frame = position(|c| matches!(c, Command::EndFrame));

    let order = [
        begin_frame,
        begin_pass,
        bind_rate,
        scene,
        first_draw,
        disable,
        end_pass,
        blit,
        end_frame,
    ];
    assert!(order.windows(2).all(|w| w[0] < w[1]), "unexpected order {:?}", order);
    assert_eq!(driver.frame_index(), 1);
}

#[rstest]
#[case::active(true)]
#[case::inactive(false)]
fn test_constant_4x4_mode(#[case] activate: bool) {
    let settings = DemoSettings {
        shading_mode: ShadingMode::Rate4x4,
        activate_shading_rate: activate,
        ..Default::default()
    };
    let (mut backend, mut demo) = start(640, 480, settings);
    let mut driver = FrameDriver::new();
    run_frame(&mut driver, &mut demo, &mut backend);

    let image = demo.rate_images().texture(ShadingRateImage::Rate4x4).unwrap();
    let commands = backend.commands();
    let bind = commands
        .iter()
        .position(|c| *c == Command::BindShadingRateImage(image))
        .expect("4x4 image should be bound");
    assert_eq!(commands[bind + 1], Command::SetShadingRateImageEnabled(activate));
    assert_eq!(backend.count(|c| matches!(c, Command::BindShadingRateImage(_))), 1);
    assert_eq!(
        backend.count(|c| *c == Command::SetShadingRateImageEnabled(true)),
        activate as usize
    );
    assert_eq!(backend.texture_data(image).unwrap()[0], 3);
}

#[rstest]
#[case::exempt(true, vec![0, 0, 0, 0, 1, 0, 0, 0, 0, 1])]
#[case::not_exempt(false, vec![0; 10])]
fn test_green_objects_use_full_rate_palette(#[case] exempt: bool, #[case] expected: Vec<u32>) {
    let settings = DemoSettings {
        load_factor: 10,
        full_shading_rate_for_green_objects: exempt,
        ..Default::default()
    };
    let (mut backend, mut demo) = start(640, 480, settings);
    let mut driver = FrameDriver::new();
    run_frame(&mut driver, &mut demo, &mut backend);

    let palettes: Vec<u32> = backend
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::SelectShadingRatePalette(palette) => Some(*palette),
            _ => None,
        })
        .collect();
    assert_eq!(palettes, expected);
}

#[test]
fn test_resize_reallocates_once() {
    let (mut backend, mut demo) = start(640, 480, DemoSettings::default());
    let mut driver = FrameDriver::new();

    run_frame(&mut driver, &mut demo, &mut backend);
    run_frame(&mut driver, &mut demo, &mut backend);
    assert_eq!(demo.framebuffer().generation(), 1);
    assert_eq!(demo.rate_images().generation(), 1);

    backend.resize(1280, 720);
    run_frame(&mut driver, &mut demo, &mut backend);
    run_frame(&mut driver, &mut demo, &mut backend);
    assert_eq!(demo.framebuffer().generation(), 2);
    assert_eq!(demo.rate_images().generation(), 2);
    assert_eq!((demo.rate_images().width(), demo.rate_images().height()), (80, 45));
}

#[rstest]
#[case::full(1, 1200, 900)]
#[case::half(2, 600, 450)]
#[case::sixteenth(16, 75, 56)]
fn test_framebuffer_scaling(#[case] scaling: u32, #[case] width: u32, #[case] height: u32) {
    let settings = DemoSettings {
        framebuffer_scaling: scaling,
        ..Default::default()
    };
    let (mut backend, mut demo) = start(1200, 900, settings);
    let mut driver = FrameDriver::new();
    run_frame(&mut driver, &mut demo, &mut backend);

    assert_eq!((demo.framebuffer().width(), demo.framebuffer().height()), (width, height));
    let blitted = backend.commands().iter().any(|c| match c {
        Command::BlitToSurface {
            src_width,
            src_height,
            ..
        } => (*src_width, *src_height) == (width, height),
        _ => false,
    });
    assert!(blitted);
}

#[test]
fn test_tessellation_change_rebuilds_once() {
    let (mut backend, mut demo) = start(640, 480, DemoSettings::default());
    let mut driver = FrameDriver::new();
    run_frame(&mut driver, &mut demo, &mut backend);
    assert_eq!(demo.torus().rebuild_count(), 1);

    demo.set_settings(DemoSettings {
        tessellation_n: 32,
        tessellation_m: 16,
        ..*demo.settings()
    });
    run_frame(&mut driver, &mut demo, &mut backend);
    run_frame(&mut driver, &mut demo, &mut backend);

    assert_eq!(demo.torus().rebuild_count(), 2);
    assert_eq!(demo.torus().triangle_count(), 1024);
}

#[test]
fn test_mouse_tracking_follows_cursor() {
    let settings = DemoSettings {
        shading_mode: ShadingMode::MouseTracking,
        ..Default::default()
    };
    let (mut backend, mut demo) = start(320, 320, settings);
    let mut driver = FrameDriver::new();
    driver
        .run_frame(&mut demo, &mut backend, None, Some(Vec2::new(0.0, 0.0)), |_| {})
        .unwrap();

    let image = demo.rate_images().texture(ShadingRateImage::MouseTracking).unwrap();
    assert_eq!(
        backend.count(|c| matches!(c, Command::WriteTexture { texture, .. } if *texture == image)),
        1
    );
    let data = backend.texture_data(image).unwrap();
    assert_eq!(data[0], 1);
    assert_eq!(*data.last().unwrap(), 0);
}

#[test]
fn test_missing_base_extension_fails() {
    let mut backend = RecordingBackend::with_capabilities(
        640,
        480,
        &["VK_NV_viewport_array2"],
        ShadingRateProperties::default(),
    );
    let result = VrsDemo::begin(&mut backend, &config(DemoSettings::default()));
    assert!(result.is_err());
    assert_eq!(backend.live_texture_count(), 0);
    assert_eq!(backend.live_buffer_count(), 0);
}

#[test]
fn test_shader_reload_replaces_program() {
    let (mut backend, mut demo) = start(640, 480, DemoSettings::default());
    let mut driver = FrameDriver::new();

    demo.request_shader_reload();
    run_frame(&mut driver, &mut demo, &mut backend);
    assert_eq!(backend.count(|c| matches!(c, Command::CreateProgram(_))), 1);
    assert_eq!(backend.count(|c| matches!(c, Command::DestroyProgram(_))), 1);

    backend.clear_commands();
    run_frame(&mut driver, &mut demo, &mut backend);
    assert_eq!(backend.count(|c| matches!(c, Command::CreateProgram(_))), 0);
}

#[test]
fn test_destroy_releases_everything() {
    let (mut backend, mut demo) = start(640, 480, DemoSettings::default());
    let mut driver = FrameDriver::new();
    run_frame(&mut driver, &mut demo, &mut backend);

    demo.destroy(&mut backend);
    assert_eq!(backend.live_buffer_count(), 0);
    assert_eq!(backend.live_texture_count(), 0);
    assert_eq!(backend.live_program_count(), 0);
}
