/*!
# xr_bridge - Vulkan Backend

Vulkan implementation of the xr_bridge graphics device traits.

This crate provides [`VulkanGraphicsDevice`], a [`GraphicsDevice`] built on
Ash for Vulkan bindings and gpu-allocator for memory management, and
[`VulkanDeviceFactory`], which creates headless submission devices on the
adapter the headset is connected to.

Shared images and fences travel between devices as opaque FDs on Unix and
Win32 handles on Windows.

[`GraphicsDevice`]: xr_bridge::graphics_device::GraphicsDevice
*/

mod vulkan_context;
mod vulkan_device;
mod vulkan_external;
mod vulkan_fence;
mod vulkan_format;
mod vulkan_image;
mod vulkan_commands;
mod vulkan_timer;
#[cfg(feature = "vulkan-validation")]
mod debug;

pub use vulkan_device::{enumerate_adapters, VulkanDeviceConfig, VulkanDeviceFactory, VulkanGraphicsDevice};
pub use vulkan_fence::VulkanFence;
pub use vulkan_image::VulkanImage;
pub use vulkan_format::pixel_format_to_vk;

// Re-export debug utilities
#[cfg(feature = "vulkan-validation")]
pub use debug::{get_validation_stats, print_validation_stats_report, ValidationStats};
