//! egui GUI integration for the Vulkan backend

mod vulkan;

pub use self::vulkan::VulkanEguiIntegration;
