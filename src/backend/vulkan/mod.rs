//! Vulkan backend implementation using ash
//!
//! Rate-controlled shading goes through `VK_NV_shading_rate_image`. The
//! enable bit is pipeline state, so every program gets a pipeline per
//! (vertex layout, render pass, enable) combination, created on first draw.
//! Palettes are dynamic state and are recorded before each draw.
//!
//! Uniform updates are sub-allocated from one host-visible ring per frame and
//! bound with dynamic offsets, so every draw keeps the value written for it.

mod pipeline;
mod ring;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::CStr;
use std::sync::Arc;

use ash::khr::{surface, swapchain};
use ash::nv::shading_rate_image;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::traits::*;
use crate::backend::types::*;

use self::pipeline::{convert_format, convert_shading_rate, PipelineKey, VkProgram};
use self::ring::{RingAllocation, RingCursor};

const VIEWPORT_ARRAY2_NAME: &CStr = c"VK_NV_viewport_array2";

/// Descriptor sets one frame may allocate
const MAX_FRAME_DESCRIPTOR_SETS: u32 = 1024;

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    shading_rate_fn: Option<shading_rate_image::Device>,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    allocator: Option<Arc<Mutex<Allocator>>>,
    device_extensions: HashSet<String>,
    shading_rate_properties: ShadingRateProperties,

    // Swapchain
    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_image_views: Vec<vk::ImageView>,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    current_image_index: u32,
    swapchain_outdated: bool,
    swapchain_generation: u64,
    vsync: bool,

    // Synchronization
    image_available_semaphore: vk::Semaphore,
    render_finished_semaphore: vk::Semaphore,
    in_flight_fence: vk::Fence,

    // Command pool and buffer
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    is_recording: bool,

    // Per-frame allocations, released after the frame fence
    descriptor_pool: vk::DescriptorPool,
    frame_descriptor_sets: HashMap<DescriptorKey, vk::DescriptorSet>,
    frame_framebuffers: Vec<vk::Framebuffer>,
    uniform_ring: Option<VkBuffer>,
    ring: RingCursor,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    uniform_buffers: HashMap<u64, UniformSlot>,
    textures: HashMap<u64, VkTexture>,
    texture_views: HashMap<u64, VkTextureView>,
    programs: HashMap<u64, VkProgram>,
    render_passes: HashMap<RenderPassKey, vk::RenderPass>,
    pipelines: HashMap<PipelineKey, vk::Pipeline>,
    next_id: u64,

    state: DrawState,

    // Presentation
    egui_render_pass: vk::RenderPass,
    surface_written: bool,
    overlay_recorded: bool,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
}

struct VkTexture {
    image: vk::Image,
    allocation: Allocation,
    /// View used for the shading rate binding and the rate image descriptor
    default_view: vk::ImageView,
    format: TextureFormat,
    usage: TextureUsage,
    width: u32,
    height: u32,
    layout: vk::ImageLayout,
}

struct VkTextureView {
    view: vk::ImageView,
    texture: u64,
}

/// A uniform buffer handle; its storage is the slice of the latest update
struct UniformSlot {
    size: u64,
    current: Option<RingAllocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RenderPassKey {
    color_format: vk::Format,
    color_load: bool,
    color_store: bool,
    color_initial: vk::ImageLayout,
    depth_format: Option<vk::Format>,
    depth_load: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DescriptorKey {
    program: u64,
    uniform_sizes: Vec<(u32, u64)>,
    rate_view: vk::ImageView,
}

/// Recording state tracked between draw calls
#[derive(Default)]
struct DrawState {
    render_pass: Option<vk::RenderPass>,
    program: Option<u64>,
    vertex_layouts: Vec<(u32, VertexBufferLayout)>,
    bound_uniforms: BTreeMap<u32, RingAllocation>,
    bound_pipeline: Option<vk::Pipeline>,
    rate_image: Option<u64>,
    rate_image_recorded: bool,
    shading_rate_enabled: bool,
    palettes: Vec<Vec<vk::ShadingRatePaletteEntryNV>>,
    selected_palette: u32,
}

impl DrawState {
    /// Forget everything tied to the previous command buffer
    fn begin_frame(&mut self) {
        self.render_pass = None;
        self.vertex_layouts.clear();
        self.bound_uniforms.clear();
        self.bound_pipeline = None;
        self.rate_image_recorded = false;
    }
}

impl VulkanBackend {
    /// Create the instance, device and swapchain for `window`.
    ///
    /// Devices exposing `VK_NV_shading_rate_image` are preferred. The
    /// extension is enabled when present; callers check [`GraphicsBackend::has_extension`].
    pub fn new(window: &winit::window::Window, vsync: bool) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"VRS Demo")
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(c"vrs-demo")
                .engine_version(vk::make_api_version(0, 1, 0, 0))
                .api_version(vk::API_VERSION_1_2);

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extensions);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

            let candidates: Vec<(vk::PhysicalDevice, u32, HashSet<String>)> = instance
                .enumerate_physical_devices()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                .into_iter()
                .filter_map(|pd| {
                    let family = Self::find_queue_family(&instance, pd, &surface_fn, surface)?;
                    Some((pd, family, Self::device_extension_names(&instance, pd)))
                })
                .collect();

            let (physical_device, graphics_queue_family, available_extensions) = candidates
                .iter()
                .find(|(_, _, exts)| exts.contains(Self::extension_str(shading_rate_image::NAME)))
                .or_else(|| candidates.first())
                .cloned()
                .ok_or_else(|| {
                    BackendError::InitializationFailed("No suitable physical device".into())
                })?;

            let device_properties = instance.get_physical_device_properties(physical_device);
            log::info!(
                "Using {}",
                device_properties
                    .device_name_as_c_str()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "unknown device".into())
            );

            // Shading rate support needs both the extension and the feature bit
            let mut shading_rate_features = vk::PhysicalDeviceShadingRateImageFeaturesNV::default();
            let has_shading_rate_ext =
                available_extensions.contains(Self::extension_str(shading_rate_image::NAME));
            if has_shading_rate_ext {
                let mut features2 =
                    vk::PhysicalDeviceFeatures2::default().push_next(&mut shading_rate_features);
                instance.get_physical_device_features2(physical_device, &mut features2);
            }
            let shading_rate_supported =
                has_shading_rate_ext && shading_rate_features.shading_rate_image == vk::TRUE;

            let mut extension_names = vec![swapchain::NAME];
            if shading_rate_supported {
                extension_names.push(shading_rate_image::NAME);
            }
            if available_extensions.contains(Self::extension_str(VIEWPORT_ARRAY2_NAME)) {
                extension_names.push(VIEWPORT_ARRAY2_NAME);
            }
            let extension_ptrs: Vec<*const std::ffi::c_char> =
                extension_names.iter().map(|name| name.as_ptr()).collect();
            let device_extensions: HashSet<String> = extension_names
                .iter()
                .map(|name| Self::extension_str(name).to_string())
                .collect();

            let shading_rate_properties = if shading_rate_supported {
                let mut properties = vk::PhysicalDeviceShadingRateImagePropertiesNV::default();
                let mut properties2 =
                    vk::PhysicalDeviceProperties2::default().push_next(&mut properties);
                instance.get_physical_device_properties2(physical_device, &mut properties2);
                ShadingRateProperties {
                    tile_width: properties.shading_rate_texel_size.width,
                    tile_height: properties.shading_rate_texel_size.height,
                    palette_size: properties.shading_rate_palette_size,
                }
            } else {
                ShadingRateProperties::default()
            };

            let queue_priorities = [1.0f32];
            let queue_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .queue_priorities(&queue_priorities)];
            let device_features = vk::PhysicalDeviceFeatures::default();
            let mut enabled_shading_rate = vk::PhysicalDeviceShadingRateImageFeaturesNV::default()
                .shading_rate_image(true);

            let mut device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&extension_ptrs)
                .enabled_features(&device_features);
            if shading_rate_supported {
                device_info = device_info.push_next(&mut enabled_shading_rate);
            }

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);
            let shading_rate_fn = shading_rate_supported
                .then(|| shading_rate_image::Device::new(&instance, &device));

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?[0];

            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let image_available_semaphore = device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let render_finished_semaphore = device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let in_flight_fence = device
                .create_fence(&fence_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    descriptor_count: MAX_FRAME_DESCRIPTOR_SETS * 2,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: MAX_FRAME_DESCRIPTOR_SETS,
                },
            ];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
                .pool_sizes(&pool_sizes)
                .max_sets(MAX_FRAME_DESCRIPTOR_SETS);
            let descriptor_pool = device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let alignment = device_properties.limits.min_uniform_buffer_offset_alignment;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                shading_rate_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                allocator: Some(Arc::new(Mutex::new(allocator))),
                device_extensions,
                shading_rate_properties,
                swapchain: vk::SwapchainKHR::null(),
                swapchain_images: Vec::new(),
                swapchain_image_views: Vec::new(),
                swapchain_format: vk::Format::B8G8R8A8_SRGB,
                swapchain_extent: vk::Extent2D { width: 0, height: 0 },
                current_image_index: 0,
                swapchain_outdated: false,
                swapchain_generation: 0,
                vsync,
                image_available_semaphore,
                render_finished_semaphore,
                in_flight_fence,
                command_pool,
                command_buffer,
                is_recording: false,
                descriptor_pool,
                frame_descriptor_sets: HashMap::new(),
                frame_framebuffers: Vec::new(),
                uniform_ring: None,
                ring: RingCursor::new(RingCursor::DEFAULT_CAPACITY, alignment),
                buffers: HashMap::new(),
                uniform_buffers: HashMap::new(),
                textures: HashMap::new(),
                texture_views: HashMap::new(),
                programs: HashMap::new(),
                render_passes: HashMap::new(),
                pipelines: HashMap::new(),
                next_id: 1,
                state: DrawState::default(),
                egui_render_pass: vk::RenderPass::null(),
                surface_written: false,
                overlay_recorded: false,
            };

            let ring_buffer = backend.allocate_buffer(
                "Uniform Ring",
                backend.ring.capacity(),
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )?;
            backend.uniform_ring = Some(ring_buffer);

            let size = window.inner_size();
            backend.create_swapchain(size.width.max(1), size.height.max(1))?;
            backend.egui_render_pass =
                Self::create_egui_render_pass(&backend.device, backend.swapchain_format)?;

            log::info!(
                "Vulkan backend ready (shading rate image: {}, {}x{} tiles, {} palette entries)",
                backend.shading_rate_fn.is_some(),
                shading_rate_properties.tile_width,
                shading_rate_properties.tile_height,
                shading_rate_properties.palette_size
            );

            Ok(backend)
        }
    }

    /// Get the Vulkan instance
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the command pool
    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Get the current command buffer (only valid during frame recording)
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    /// Get the current swapchain image view
    pub fn current_swapchain_image_view(&self) -> vk::ImageView {
        self.swapchain_image_views[self.current_image_index as usize]
    }

    /// Get the egui render pass
    pub fn egui_render_pass(&self) -> vk::RenderPass {
        self.egui_render_pass
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain_extent
    }

    /// Changes every time the swapchain images are recreated
    pub fn swapchain_generation(&self) -> u64 {
        self.swapchain_generation
    }

    pub fn swapchain_is_srgb(&self) -> bool {
        matches!(
            self.swapchain_format,
            vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB
        )
    }

    /// Make sure the current swapchain image holds the scene (or a white
    /// clear) in `COLOR_ATTACHMENT_OPTIMAL`, ready for an overlay pass
    /// using [`egui_render_pass`](Self::egui_render_pass).
    pub fn prepare_overlay_target(&mut self) {
        if !self.is_recording {
            return;
        }
        self.end_open_render_pass();
        if !self.surface_written {
            self.clear_surface();
        }
    }

    /// Record that the overlay pass left the swapchain image in `PRESENT_SRC_KHR`
    pub fn mark_overlay_recorded(&mut self) {
        self.overlay_recorded = true;
    }

    fn extension_str(name: &CStr) -> &str {
        name.to_str().unwrap_or_default()
    }

    fn device_extension_names(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> HashSet<String> {
        unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(|name| name.to_string_lossy().into_owned())
            .collect()
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        (0u32..).zip(queue_families.iter()).find_map(|(index, family)| {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index, surface)
                    .unwrap_or(false)
            };
            (supports_graphics && supports_surface).then_some(index)
        })
    }

    /// The overlay pass loads the blitted scene and hands the image to presentation
    fn create_egui_render_pass(
        device: &ash::Device,
        format: vk::Format,
    ) -> BackendResult<vk::RenderPass> {
        let attachments = [vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];

        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ..Default::default()
        }];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe { device.create_render_pass(&render_pass_info, None) }.map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to create egui render pass: {:?}", e))
        })
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        unsafe {
            self.device.device_wait_idle().ok();

            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_image_views.clear();
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }

            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .or_else(|| formats.first())
                .copied()
                .ok_or_else(|| {
                    BackendError::SwapchainCreationFailed("Surface reports no formats".into())
                })?;

            if self.egui_render_pass != vk::RenderPass::null() && format.format != self.swapchain_format
            {
                log::warn!(
                    "Swapchain format changed from {:?} to {:?}",
                    self.swapchain_format,
                    format.format
                );
            }

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .or_else(|| {
                        present_modes
                            .iter()
                            .copied()
                            .find(|&m| m == vk::PresentModeKHR::IMMEDIATE)
                    })
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(
                if capabilities.max_image_count > 0 {
                    capabilities.max_image_count
                } else {
                    u32::MAX
                },
            );

            // The scene reaches the surface through a blit
            let swapchain_info = vk::SwapchainCreateInfoKHR::default()
                .surface(self.surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true);

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            self.swapchain_images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            self.swapchain_format = format.format;
            self.swapchain_extent = extent;
            self.swapchain_outdated = false;
            self.swapchain_generation += 1;

            self.swapchain_image_views = self
                .swapchain_images
                .iter()
                .map(|&image| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(format.format)
                        .subresource_range(color_range());
                    self.device.create_image_view(&view_info, None)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            log::debug!("Swapchain created: {}x{}", extent.width, extent.height);
            Ok(())
        }
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&self) -> BackendResult<&Arc<Mutex<Allocator>>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator not available".into()))
    }

    /// Host-visible buffer bound to fresh memory
    fn allocate_buffer(
        &self,
        label: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> BackendResult<VkBuffer> {
        if size == 0 {
            return Err(BackendError::BufferCreationFailed(format!("{}: zero size", label)));
        }
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;

            let requirements = self.device.get_buffer_memory_requirements(buffer);
            let allocation = match self.allocator()?.lock().allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(BackendError::BufferCreationFailed(e.to_string()));
                }
            };

            if let Err(e) =
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(buffer, None);
                let _ = self.allocator()?.lock().free(allocation);
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }

            Ok(VkBuffer { buffer, allocation })
        }
    }

    fn free_buffer(&self, buffer: VkBuffer) {
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        if let Some(allocator) = &self.allocator {
            let _ = allocator.lock().free(buffer.allocation);
        }
    }

    /// Resources destroyed between frames may still be read by the last submission
    fn wait_if_between_frames(&self) {
        if !self.is_recording {
            unsafe {
                let _ = self.device.device_wait_idle();
            }
        }
    }

    fn begin_single_time_commands(&self) -> BackendResult<vk::CommandBuffer> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::UploadFailed(e.to_string()))?[0];

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
                self.device.free_command_buffers(self.command_pool, &[cmd]);
                return Err(BackendError::UploadFailed(e.to_string()));
            }
            Ok(cmd)
        }
    }

    fn end_single_time_commands(&self, cmd: vk::CommandBuffer) -> BackendResult<()> {
        unsafe {
            let result = self
                .device
                .end_command_buffer(cmd)
                .and_then(|_| {
                    let command_buffers = [cmd];
                    let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
                    self.device
                        .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                })
                .and_then(|_| self.device.queue_wait_idle(self.graphics_queue));
            self.device.free_command_buffers(self.command_pool, &[cmd]);
            result.map_err(|e| BackendError::UploadFailed(e.to_string()))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src: (vk::PipelineStageFlags, vk::AccessFlags),
        dst: (vk::PipelineStageFlags, vk::AccessFlags),
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .src_access_mask(src.1)
            .dst_access_mask(dst.1);
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src.0,
                dst.0,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn end_open_render_pass(&mut self) {
        if self.state.render_pass.take().is_some() {
            unsafe { self.device.cmd_end_render_pass(self.command_buffer) };
        }
    }

    /// Fill the swapchain image with white when nothing was blitted
    fn clear_surface(&mut self) {
        let image = self.swapchain_images[self.current_image_index as usize];
        let cmd = self.command_buffer;
        self.image_barrier(
            cmd,
            image,
            color_range(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        );
        let clear = vk::ClearColorValue {
            float32: [1.0, 1.0, 1.0, 1.0],
        };
        unsafe {
            self.device.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[color_range()],
            );
        }
        self.image_barrier(
            cmd,
            image,
            color_range(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
            (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
        );
        self.surface_written = true;
    }

    fn render_pass_for(&mut self, key: RenderPassKey) -> BackendResult<vk::RenderPass> {
        if let Some(&render_pass) = self.render_passes.get(&key) {
            return Ok(render_pass);
        }

        let mut attachments = vec![vk::AttachmentDescription::default()
            .format(key.color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(if key.color_load {
                vk::AttachmentLoadOp::LOAD
            } else {
                vk::AttachmentLoadOp::CLEAR
            })
            .store_op(if key.color_store {
                vk::AttachmentStoreOp::STORE
            } else {
                vk::AttachmentStoreOp::DONT_CARE
            })
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(key.color_initial)
            .final_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        if let Some(depth_format) = key.depth_format {
            let load_op = if key.depth_load {
                vk::AttachmentLoadOp::LOAD
            } else {
                vk::AttachmentLoadOp::CLEAR
            };
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(depth_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(load_op)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(load_op)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(if key.depth_load {
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                    } else {
                        vk::ImageLayout::UNDEFINED
                    })
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
        }

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if key.depth_format.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass];

        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: attachment_stages | vk::PipelineStageFlags::TRANSFER,
                dst_stage_mask: attachment_stages,
                src_access_mask: vk::AccessFlags::TRANSFER_READ,
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                ..Default::default()
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::TRANSFER,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::TRANSFER_READ,
                ..Default::default()
            },
        ];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { self.device.create_render_pass(&render_pass_info, None) }
            .map_err(|e| BackendError::PipelineCreationFailed(format!("Render pass: {:?}", e)))?;
        self.render_passes.insert(key, render_pass);
        Ok(render_pass)
    }

    /// Bind the pipeline, descriptors and shading rate state a draw needs.
    /// Returns `false` when the draw has to be skipped.
    fn prepare_draw(&mut self) -> bool {
        let Some(render_pass) = self.state.render_pass else {
            log::warn!("Draw outside of a render pass ignored");
            return false;
        };
        let Some(program_id) = self.state.program else {
            log::warn!("Draw without a program ignored");
            return false;
        };
        let Some(program) = self.programs.get(&program_id) else {
            return false;
        };

        let shading_rate = self.state.shading_rate_enabled && self.shading_rate_fn.is_some();
        let key = PipelineKey {
            program: program_id,
            vertex_layouts: self.state.vertex_layouts.clone(),
            render_pass,
            shading_rate,
        };

        let pipeline = match self.pipelines.get(&key) {
            Some(&pipeline) => pipeline,
            None => match pipeline::create_graphics_pipeline(&self.device, program, &key) {
                Ok(pipeline) => {
                    log::debug!(
                        "Created pipeline for program {} (shading rate image {})",
                        program_id,
                        if shading_rate { "on" } else { "off" }
                    );
                    self.pipelines.insert(key, pipeline);
                    pipeline
                }
                Err(e) => {
                    log::error!("{}", e);
                    return false;
                }
            },
        };

        let cmd = self.command_buffer;
        if self.state.bound_pipeline != Some(pipeline) {
            unsafe {
                self.device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
            };
            self.state.bound_pipeline = Some(pipeline);
        }

        let Some(program) = self.programs.get(&program_id) else {
            return false;
        };
        let mut uniforms = Vec::with_capacity(program.uniform_bindings.len());
        for &binding in &program.uniform_bindings {
            match self.state.bound_uniforms.get(&binding) {
                Some(allocation) => uniforms.push((binding, *allocation)),
                None => {
                    log::warn!("Uniform binding {} has no buffer bound", binding);
                    return false;
                }
            }
        }

        let rate_view = match program.rate_image_binding {
            Some(_) => match self.state.rate_image.and_then(|id| self.textures.get(&id)) {
                Some(texture) => texture.default_view,
                None => {
                    log::warn!("Program samples the shading rate image but none is bound");
                    return false;
                }
            },
            None => vk::ImageView::null(),
        };

        let descriptor_key = DescriptorKey {
            program: program_id,
            uniform_sizes: uniforms.iter().map(|(b, a)| (*b, a.size)).collect(),
            rate_view,
        };
        let descriptor_set = match self.frame_descriptor_sets.get(&descriptor_key) {
            Some(&set) => set,
            None => match self.allocate_descriptor_set(program, &uniforms, rate_view) {
                Ok(set) => {
                    self.frame_descriptor_sets.insert(descriptor_key, set);
                    set
                }
                Err(e) => {
                    log::error!("{}", e);
                    return false;
                }
            },
        };

        let dynamic_offsets: Vec<u32> = uniforms.iter().map(|(_, a)| a.offset as u32).collect();
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                program.pipeline_layout,
                0,
                &[descriptor_set],
                &dynamic_offsets,
            );
        }

        if shading_rate {
            self.record_shading_rate_state();
        }
        true
    }

    fn allocate_descriptor_set(
        &self,
        program: &VkProgram,
        uniforms: &[(u32, RingAllocation)],
        rate_view: vk::ImageView,
    ) -> BackendResult<vk::DescriptorSet> {
        let ring = self
            .uniform_ring
            .as_ref()
            .ok_or_else(|| BackendError::BufferCreationFailed("Uniform ring missing".into()))?;

        let set_layouts = [program.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| BackendError::PipelineCreationFailed(format!("Descriptor set: {:?}", e)))?
            [0];

        let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = uniforms
            .iter()
            .map(|(_, allocation)| {
                [vk::DescriptorBufferInfo {
                    buffer: ring.buffer,
                    offset: 0,
                    range: allocation.size,
                }]
            })
            .collect();
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: rate_view,
            image_layout: vk::ImageLayout::GENERAL,
        }];

        let mut writes: Vec<vk::WriteDescriptorSet> = uniforms
            .iter()
            .zip(buffer_infos.iter())
            .map(|((binding, _), info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                    .buffer_info(info)
            })
            .collect();
        if let Some(binding) = program.rate_image_binding {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(&image_info),
            );
        }

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        Ok(set)
    }

    fn record_shading_rate_state(&mut self) {
        let Some(shading_rate_fn) = &self.shading_rate_fn else {
            return;
        };
        let cmd = self.command_buffer;

        if !self.state.rate_image_recorded {
            if let Some(texture) = self.state.rate_image.and_then(|id| self.textures.get(&id)) {
                unsafe {
                    (shading_rate_fn.fp().cmd_bind_shading_rate_image_nv)(
                        cmd,
                        texture.default_view,
                        vk::ImageLayout::GENERAL,
                    );
                }
                self.state.rate_image_recorded = true;
            }
        }

        if let Some(entries) = selected_palette(&self.state.palettes, self.state.selected_palette) {
            let palettes = [vk::ShadingRatePaletteNV::default().shading_rate_palette_entries(entries)];
            unsafe {
                (shading_rate_fn.fp().cmd_set_viewport_shading_rate_palette_nv)(
                    cmd,
                    0,
                    palettes.len() as u32,
                    palettes.as_ptr(),
                );
            }
        }
    }
}

/// Palette recorded for viewport 0. Falls back to the first one when
/// `selected` was never set. Empty palettes are never recorded.
fn selected_palette(
    palettes: &[Vec<vk::ShadingRatePaletteEntryNV>],
    selected: u32,
) -> Option<&[vk::ShadingRatePaletteEntryNV]> {
    palettes
        .get(selected as usize)
        .filter(|entries| !entries.is_empty())
        .or_else(|| palettes.first().filter(|entries| !entries.is_empty()))
        .map(Vec::as_slice)
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn aspect_for(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

impl GraphicsBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn has_extension(&self, name: &str) -> bool {
        self.device_extensions.contains(name)
    }

    fn shading_rate_properties(&self) -> ShadingRateProperties {
        self.shading_rate_properties
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            if let Err(e) = self.create_swapchain(width, height) {
                log::error!("Swapchain resize failed: {}", e);
            }
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.swapchain_extent.width, self.swapchain_extent.height)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;

            if self.swapchain_outdated {
                let extent = self.swapchain_extent;
                self.create_swapchain(extent.width, extent.height)?;
            }

            let (image_index, _) = self
                .swapchain_fn
                .acquire_next_image(
                    self.swapchain,
                    u64::MAX,
                    self.image_available_semaphore,
                    vk::Fence::null(),
                )
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => BackendError::SurfaceLost,
                    _ => BackendError::AcquireImageFailed(e.to_string()),
                })?;

            self.current_image_index = image_index;

            self.device
                .reset_fences(&[self.in_flight_fence])
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;

            // The previous frame has retired; its transient allocations can go
            self.device
                .reset_descriptor_pool(self.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;
            self.frame_descriptor_sets.clear();
            for framebuffer in self.frame_framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            self.ring.reset();
            for slot in self.uniform_buffers.values_mut() {
                slot.current = None;
            }

            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;

            self.is_recording = true;
            self.state.begin_frame();
            self.surface_written = false;
            self.overlay_recorded = false;

            Ok(FrameContext {
                width: self.swapchain_extent.width,
                height: self.swapchain_extent.height,
            })
        }
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.is_recording {
            return Ok(());
        }
        self.end_open_render_pass();
        if !self.surface_written {
            self.clear_surface();
        }
        if !self.overlay_recorded {
            let image = self.swapchain_images[self.current_image_index as usize];
            self.image_barrier(
                self.command_buffer,
                image,
                color_range(),
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                (
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                ),
                (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()),
            );
        }

        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(|e| BackendError::PresentFailed(e.to_string()))?;
            self.is_recording = false;

            let wait_semaphores = [self.image_available_semaphore];
            let wait_stages = [vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [self.render_finished_semaphore];
            let command_buffers = [self.command_buffer];

            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);

            self.device
                .queue_submit(self.graphics_queue, &[submit_info], self.in_flight_fence)
                .map_err(|e| BackendError::PresentFailed(e.to_string()))?;

            let swapchains = [self.swapchain];
            let image_indices = [self.current_image_index];
            let present_info = vk::PresentInfoKHR::default()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);

            match self.swapchain_fn.queue_present(self.graphics_queue, &present_info) {
                Ok(false) => {}
                Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.swapchain_outdated = true;
                }
                Err(e) => return Err(BackendError::PresentFailed(e.to_string())),
            }
        }
        Ok(())
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let mut usage = vk::BufferUsageFlags::empty();
        if desc.usage.contains(BufferUsage::VERTEX) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if desc.usage.contains(BufferUsage::INDEX) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if desc.usage.contains(BufferUsage::UNIFORM) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if desc.usage.contains(BufferUsage::COPY_SRC) {
            usage |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if desc.usage.contains(BufferUsage::COPY_DST) {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let label = desc.label.as_deref().unwrap_or("buffer");
        let size = desc.size.max(data.len() as u64);
        let mut buffer = self.allocate_buffer(label, size, usage)?;

        match buffer.allocation.mapped_slice_mut() {
            Some(mapped) if mapped.len() >= data.len() => {
                mapped[..data.len()].copy_from_slice(data);
            }
            _ => {
                self.free_buffer(buffer);
                return Err(BackendError::UploadFailed(format!("{}: memory not mappable", label)));
            }
        }

        let id = self.next_handle();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn create_uniform_buffer(&mut self, label: &str, size: u64) -> BackendResult<BufferHandle> {
        if size == 0 {
            return Err(BackendError::BufferCreationFailed(format!("{}: zero size", label)));
        }
        let id = self.next_handle();
        self.uniform_buffers.insert(id, UniformSlot { size, current: None });
        log::debug!("Uniform buffer '{}' ({} bytes) streams through the ring", label, size);
        Ok(BufferHandle(id))
    }

    fn update_uniform_buffer(&mut self, buffer: BufferHandle, data: &[u8]) {
        let Some(slot) = self.uniform_buffers.get(&buffer.0) else {
            log::warn!("Update of unknown uniform buffer {:?}", buffer);
            return;
        };
        if data.len() as u64 > slot.size {
            log::warn!(
                "Uniform update of {} bytes truncated to {}",
                data.len(),
                slot.size
            );
        }
        let size = slot.size;
        let Some(allocation) = self.ring.allocate(size) else {
            return;
        };
        let Some(mapped) = self
            .uniform_ring
            .as_mut()
            .and_then(|ring| ring.allocation.mapped_slice_mut())
        else {
            return;
        };

        let start = allocation.offset as usize;
        let len = data.len().min(size as usize);
        mapped[start..start + len].copy_from_slice(&data[..len]);
        mapped[start + len..start + size as usize].fill(0);

        if let Some(slot) = self.uniform_buffers.get_mut(&buffer.0) {
            slot.current = Some(allocation);
        }
    }

    fn bind_uniform_buffer(&mut self, binding: u32, buffer: BufferHandle) {
        match self.uniform_buffers.get(&buffer.0).and_then(|slot| slot.current) {
            Some(allocation) => {
                self.state.bound_uniforms.insert(binding, allocation);
            }
            None => log::warn!("Uniform buffer {:?} bound before any update", buffer),
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.uniform_buffers.remove(&buffer.0).is_some() {
            return;
        }
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            self.wait_if_between_frames();
            self.free_buffer(vk_buffer);
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{}: zero extent {}x{}",
                desc.label.as_deref().unwrap_or("texture"),
                desc.width,
                desc.height
            )));
        }

        let format = convert_format(desc.format);
        let is_depth = desc.format.is_depth();

        let mut usage = vk::ImageUsageFlags::empty();
        if desc.usage.contains(TextureUsage::COPY_SRC) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if desc.usage.contains(TextureUsage::COPY_DST) {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if desc.usage.contains(TextureUsage::TEXTURE_BINDING) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if desc.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            if is_depth {
                usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            } else {
                usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
        }
        if desc.usage.contains(TextureUsage::SHADING_RATE) {
            if self.shading_rate_fn.is_some() {
                usage |= vk::ImageUsageFlags::SHADING_RATE_IMAGE_NV;
            } else {
                log::warn!("Shading rate usage requested without VK_NV_shading_rate_image");
            }
        }

        unsafe {
            let image_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .extent(vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .format(format)
                .tiling(vk::ImageTiling::OPTIMAL)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .samples(vk::SampleCountFlags::TYPE_1);

            let image = self
                .device
                .create_image(&image_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

            let requirements = self.device.get_image_memory_requirements(image);
            let allocation = match self.allocator()?.lock().allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("texture"),
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(BackendError::TextureCreationFailed(e.to_string()));
                }
            };

            let view_result = self
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|_| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: aspect_for(desc.format),
                            ..color_range()
                        });
                    self.device.create_image_view(&view_info, None)
                });
            let default_view = match view_result {
                Ok(view) => view,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    let _ = self.allocator()?.lock().free(allocation);
                    return Err(BackendError::TextureCreationFailed(e.to_string()));
                }
            };

            let id = self.next_handle();
            self.textures.insert(
                id,
                VkTexture {
                    image,
                    allocation,
                    default_view,
                    format: desc.format,
                    usage: desc.usage,
                    width: desc.width,
                    height: desc.height,
                    layout: vk::ImageLayout::UNDEFINED,
                },
            );
            Ok(TextureHandle(id))
        }
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::TextureCreationFailed("Texture not found".into()))?;

        // Depth-stencil attachments need both aspects
        let view_info = vk::ImageViewCreateInfo::default()
            .image(tex.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert_format(tex.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_for(tex.format),
                ..color_range()
            });

        let view = unsafe {
            self.device
                .create_image_view(&view_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?
        };

        let id = self.next_handle();
        self.texture_views.insert(
            id,
            VkTextureView {
                view,
                texture: texture.0,
            },
        );
        Ok(TextureViewHandle(id))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::UploadFailed(format!("Unknown texture {:?}", texture)))?;
        if width != tex.width || height != tex.height {
            return Err(BackendError::UploadFailed(format!(
                "Write of {}x{} into a {}x{} texture",
                width, height, tex.width, tex.height
            )));
        }
        let expected = (width * height * tex.format.bytes_per_pixel()) as usize;
        if data.len() != expected {
            return Err(BackendError::UploadFailed(format!(
                "Expected {} bytes, got {}",
                expected,
                data.len()
            )));
        }

        let (image, old_layout, format) = (tex.image, tex.layout, tex.format);
        // Rate images stay in GENERAL, which both the rate binding and sampling accept
        let final_layout = if tex.usage.contains(TextureUsage::SHADING_RATE) {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };
        let range = vk::ImageSubresourceRange {
            aspect_mask: aspect_for(format),
            ..color_range()
        };

        let mut staging = self.allocate_buffer(
            "Texture Staging",
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        match staging.allocation.mapped_slice_mut() {
            Some(mapped) => mapped[..data.len()].copy_from_slice(data),
            None => {
                self.free_buffer(staging);
                return Err(BackendError::UploadFailed("Staging memory not mappable".into()));
            }
        }

        let cmd = match self.begin_single_time_commands() {
            Ok(cmd) => cmd,
            Err(e) => {
                self.free_buffer(staging);
                return Err(e);
            }
        };

        self.image_barrier(
            cmd,
            image,
            range,
            old_layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            (
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            ),
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        );

        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: range.aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        self.image_barrier(
            cmd,
            image,
            range,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            final_layout,
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
            (
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADING_RATE_IMAGE_READ_NV,
            ),
        );

        let result = self.end_single_time_commands(cmd);
        self.free_buffer(staging);
        result?;

        if let Some(tex) = self.textures.get_mut(&texture.0) {
            tex.layout = final_layout;
        }
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        let Some(vk_texture) = self.textures.remove(&texture.0) else {
            return;
        };
        self.wait_if_between_frames();

        let views: Vec<u64> = self
            .texture_views
            .iter()
            .filter(|(_, view)| view.texture == texture.0)
            .map(|(&id, _)| id)
            .collect();
        for id in views {
            if let Some(view) = self.texture_views.remove(&id) {
                unsafe { self.device.destroy_image_view(view.view, None) };
            }
        }

        if self.state.rate_image == Some(texture.0) {
            self.state.rate_image = None;
            self.state.rate_image_recorded = false;
        }

        unsafe {
            self.device.destroy_image_view(vk_texture.default_view, None);
            self.device.destroy_image(vk_texture.image, None);
        }
        if let Some(allocator) = &self.allocator {
            let _ = allocator.lock().free(vk_texture.allocation);
        }
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        let program = VkProgram::create(&self.device, desc)?;
        let id = self.next_handle();
        log::debug!(
            "Program {} created ({})",
            id,
            desc.label.as_deref().unwrap_or("unnamed")
        );
        self.programs.insert(id, program);
        Ok(ProgramHandle(id))
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        let Some(vk_program) = self.programs.remove(&program.0) else {
            return;
        };
        self.wait_if_between_frames();

        let stale: Vec<PipelineKey> = self
            .pipelines
            .keys()
            .filter(|key| key.program == program.0)
            .cloned()
            .collect();
        for key in stale {
            if let Some(pipeline) = self.pipelines.remove(&key) {
                if self.state.bound_pipeline == Some(pipeline) {
                    self.state.bound_pipeline = None;
                }
                unsafe { self.device.destroy_pipeline(pipeline, None) };
            }
        }
        self.frame_descriptor_sets.retain(|key, _| key.program != program.0);
        if self.state.program == Some(program.0) {
            self.state.program = None;
        }

        unsafe { vk_program.destroy(&self.device) };
    }

    fn set_program(&mut self, program: ProgramHandle) {
        if self.programs.contains_key(&program.0) {
            self.state.program = Some(program.0);
        } else {
            log::warn!("Unknown program {:?}", program);
        }
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        if !self.is_recording {
            log::warn!("Render pass '{:?}' outside of a frame ignored", desc.label);
            return;
        }
        self.end_open_render_pass();

        let color = self
            .texture_views
            .get(&desc.color_attachment.view.0)
            .and_then(|view| Some((view.view, view.texture, self.textures.get(&view.texture)?)));
        let Some((color_view, color_texture, color_tex)) = color else {
            log::warn!("Render pass color attachment not found");
            return;
        };
        let color_load = matches!(desc.color_attachment.load_op, LoadOp::Load);

        let depth = match &desc.depth_stencil_attachment {
            Some(attachment) => {
                let found = self.texture_views.get(&attachment.view.0).and_then(|view| {
                    Some((view.view, view.texture, self.textures.get(&view.texture)?))
                });
                match found {
                    Some((view, texture, tex)) => Some((view, texture, tex.format, attachment)),
                    None => {
                        log::warn!("Render pass depth attachment not found");
                        return;
                    }
                }
            }
            None => None,
        };

        let key = RenderPassKey {
            color_format: convert_format(color_tex.format),
            color_load,
            color_store: desc.color_attachment.store_op == StoreOp::Store,
            color_initial: if color_load {
                color_tex.layout
            } else {
                vk::ImageLayout::UNDEFINED
            },
            depth_format: depth.map(|(_, _, format, _)| convert_format(format)),
            depth_load: depth
                .map(|(_, _, _, attachment)| matches!(attachment.depth_load_op, LoadOp::Load))
                .unwrap_or(false),
        };

        let render_pass = match self.render_pass_for(key) {
            Ok(render_pass) => render_pass,
            Err(e) => {
                log::error!("{}", e);
                return;
            }
        };

        let mut views = vec![color_view];
        if let Some((view, _, _, _)) = depth {
            views.push(view);
        }
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(desc.width)
            .height(desc.height)
            .layers(1);
        let framebuffer = match unsafe { self.device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                log::error!("Failed to create framebuffer: {:?}", e);
                return;
            }
        };
        self.frame_framebuffers.push(framebuffer);

        let clear_color = match desc.color_attachment.load_op {
            LoadOp::Clear(color) => color,
            LoadOp::Load => [0.0; 4],
        };
        let mut clear_values = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];
        if let Some((_, _, _, attachment)) = depth {
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: attachment.depth_clear_value,
                    stencil: attachment.stencil_clear_value,
                },
            });
        }

        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
        };
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(area)
            .clear_values(&clear_values);

        unsafe {
            self.device
                .cmd_begin_render_pass(self.command_buffer, &begin_info, vk::SubpassContents::INLINE);
            self.device.cmd_set_scissor(self.command_buffer, 0, &[area]);
        }

        if let Some(tex) = self.textures.get_mut(&color_texture) {
            tex.layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        }
        if let Some((_, depth_texture, _, _)) = depth {
            if let Some(tex) = self.textures.get_mut(&depth_texture) {
                tex.layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
            }
        }

        self.state.render_pass = Some(render_pass);
        self.state.bound_pipeline = None;
    }

    fn end_render_pass(&mut self) {
        self.end_open_render_pass();
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        if !self.is_recording {
            return;
        }
        // Negative height keeps the y-up clip space of the shaders
        let viewport = vk::Viewport {
            x,
            y: y + height,
            width,
            height: -height,
            min_depth,
            max_depth,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: x as i32,
                y: y as i32,
            },
            extent: vk::Extent2D {
                width: width as u32,
                height: height as u32,
            },
        };
        unsafe {
            self.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, layout: &VertexBufferLayout) {
        let Some(vk_buffer) = self.buffers.get(&buffer.0) else {
            log::warn!("Unknown vertex buffer {:?}", buffer);
            return;
        };
        if self.is_recording {
            unsafe {
                self.device
                    .cmd_bind_vertex_buffers(self.command_buffer, slot, &[vk_buffer.buffer], &[0])
            };
        }
        let layouts = &mut self.state.vertex_layouts;
        layouts.retain(|(s, _)| *s != slot);
        layouts.push((slot, layout.clone()));
        layouts.sort_by_key(|(s, _)| *s);
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, format: IndexFormat) {
        let Some(vk_buffer) = self.buffers.get(&buffer.0) else {
            log::warn!("Unknown index buffer {:?}", buffer);
            return;
        };
        if !self.is_recording {
            return;
        }
        let index_type = match format {
            IndexFormat::Uint16 => vk::IndexType::UINT16,
            IndexFormat::Uint32 => vk::IndexType::UINT32,
        };
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.command_buffer, vk_buffer.buffer, 0, index_type)
        };
    }

    fn clear_vertex_buffers(&mut self) {
        self.state.vertex_layouts.clear();
    }

    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) {
        if !self.is_recording || !self.prepare_draw() {
            return;
        }
        unsafe {
            self.device.cmd_draw_indexed(
                self.command_buffer,
                indices.end - indices.start,
                instances.end - instances.start,
                indices.start,
                base_vertex,
                instances.start,
            );
        }
    }

    fn set_shading_rate_palette(&mut self, palette: u32, rates: &[ShadingRate]) {
        let expected = self.shading_rate_properties.palette_size as usize;
        if rates.len() != expected {
            log::warn!(
                "Palette {} has {} entries, the device expects {}",
                palette,
                rates.len(),
                expected
            );
        }
        let index = palette as usize;
        if self.state.palettes.len() <= index {
            self.state.palettes.resize(index + 1, Vec::new());
        }
        self.state.palettes[index] = rates.iter().copied().map(convert_shading_rate).collect();
    }

    fn select_shading_rate_palette(&mut self, palette: u32) {
        self.state.selected_palette = palette;
    }

    fn bind_shading_rate_image(&mut self, texture: TextureHandle) {
        match self.textures.get(&texture.0) {
            Some(tex) if tex.usage.contains(TextureUsage::SHADING_RATE) => {
                self.state.rate_image = Some(texture.0);
                self.state.rate_image_recorded = false;
            }
            Some(_) => log::warn!("Texture {:?} was not created as a shading rate image", texture),
            None => log::warn!("Unknown shading rate image {:?}", texture),
        }
    }

    fn set_shading_rate_image_enabled(&mut self, enabled: bool) {
        self.state.shading_rate_enabled = enabled;
    }

    fn blit_to_surface(&mut self, texture: TextureHandle, src_width: u32, src_height: u32) {
        if !self.is_recording {
            return;
        }
        self.end_open_render_pass();

        let Some(tex) = self.textures.get(&texture.0) else {
            log::warn!("Unknown blit source {:?}", texture);
            return;
        };
        let (src_image, src_layout) = (tex.image, tex.layout);
        let dst_image = self.swapchain_images[self.current_image_index as usize];
        let cmd = self.command_buffer;

        if src_layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
            self.image_barrier(
                cmd,
                src_image,
                color_range(),
                src_layout,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                (vk::PipelineStageFlags::ALL_COMMANDS, vk::AccessFlags::MEMORY_WRITE),
                (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ),
            );
            if let Some(tex) = self.textures.get_mut(&texture.0) {
                tex.layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            }
        }

        self.image_barrier(
            cmd,
            dst_image,
            color_range(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        );

        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: subresource,
            src_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src_width as i32,
                    y: src_height as i32,
                    z: 1,
                },
            ],
            dst_subresource: subresource,
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: self.swapchain_extent.width as i32,
                    y: self.swapchain_extent.height as i32,
                    z: 1,
                },
            ],
        };
        unsafe {
            self.device.cmd_blit_image(
                cmd,
                src_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::NEAREST,
            );
        }

        self.image_barrier(
            cmd,
            dst_image,
            color_range(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
            (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
        );
        self.surface_written = true;
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, program) in self.programs.drain() {
                program.destroy(&self.device);
            }
            for (_, render_pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(render_pass, None);
            }
            for framebuffer in self.frame_framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for (_, view) in self.texture_views.drain() {
                self.device.destroy_image_view(view.view, None);
            }

            if let Some(allocator) = self.allocator.take() {
                let mut allocator = allocator.lock();
                for (_, buffer) in self.buffers.drain() {
                    self.device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.free(buffer.allocation);
                }
                if let Some(ring) = self.uniform_ring.take() {
                    self.device.destroy_buffer(ring.buffer, None);
                    let _ = allocator.free(ring.allocation);
                }
                for (_, texture) in self.textures.drain() {
                    self.device.destroy_image_view(texture.default_view, None);
                    self.device.destroy_image(texture.image, None);
                    let _ = allocator.free(texture.allocation);
                }
            }

            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);

            self.device.destroy_semaphore(self.image_available_semaphore, None);
            self.device.destroy_semaphore(self.render_finished_semaphore, None);
            self.device.destroy_fence(self.in_flight_fence, None);

            self.device.destroy_render_pass(self.egui_render_pass, None);

            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_fn.destroy_swapchain(self.swapchain, None);

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn palette(rates: &[vk::ShadingRatePaletteEntryNV]) -> Vec<vk::ShadingRatePaletteEntryNV> {
        rates.to_vec()
    }

    #[rstest]
    #[case::adaptive(0, vk::ShadingRatePaletteEntryNV::NO_INVOCATIONS)]
    #[case::full_rate(1, vk::ShadingRatePaletteEntryNV::TYPE_1_INVOCATION_PER_PIXEL)]
    #[case::out_of_range_falls_back(7, vk::ShadingRatePaletteEntryNV::NO_INVOCATIONS)]
    fn test_selected_palette(
        #[case] selected: u32,
        #[case] first_entry: vk::ShadingRatePaletteEntryNV,
    ) {
        let palettes = vec![
            palette(&[
                vk::ShadingRatePaletteEntryNV::NO_INVOCATIONS,
                vk::ShadingRatePaletteEntryNV::TYPE_1_INVOCATION_PER_4X4_PIXELS,
            ]),
            palette(&[vk::ShadingRatePaletteEntryNV::TYPE_1_INVOCATION_PER_PIXEL; 2]),
        ];
        let entries = selected_palette(&palettes, selected).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first_entry);
    }

    #[test]
    fn test_no_palette_is_recorded_until_one_is_set() {
        assert!(selected_palette(&[], 0).is_none());
        assert!(selected_palette(&[Vec::new()], 0).is_none());
    }
}
