/// Format, usage and sample-count conversions between xr_bridge and Vulkan

use ash::vk;
use xr_bridge::graphics_device::{ImageDesc, ImageUsage, PixelFormat};

/// Convert PixelFormat to Vulkan format
///
/// Vulkan has no X8 formats: BGRX images are stored as BGRA and the
/// compositor ignores alpha for them.
pub fn pixel_format_to_vk(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::R8G8B8A8_SRGB => vk::Format::R8G8B8A8_SRGB,
        PixelFormat::B8G8R8A8_SRGB => vk::Format::B8G8R8A8_SRGB,
        PixelFormat::R8G8B8A8_UNORM => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::B8G8R8A8_UNORM => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::B8G8R8X8_SRGB => vk::Format::B8G8R8A8_SRGB,
        PixelFormat::B8G8R8X8_UNORM => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::R16G16B16A16_FLOAT => vk::Format::R16G16B16A16_SFLOAT,
        PixelFormat::D32_FLOAT => vk::Format::D32_SFLOAT,
        PixelFormat::D32_FLOAT_S8X24_UINT => vk::Format::D32_SFLOAT_S8_UINT,
        PixelFormat::D24_UNORM_S8_UINT => vk::Format::D24_UNORM_S8_UINT,
        PixelFormat::D16_UNORM => vk::Format::D16_UNORM,
    }
}

/// Every aspect stored in an image of this format
pub fn aspect_mask(format: PixelFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Aspect read when copying or resolving into the compositor image
///
/// The stencil plane never reaches the compositor.
pub fn transfer_aspect(format: PixelFormat) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn sample_count_to_vk(samples: u32) -> Option<vk::SampleCountFlags> {
    match samples {
        1 => Some(vk::SampleCountFlags::TYPE_1),
        2 => Some(vk::SampleCountFlags::TYPE_2),
        4 => Some(vk::SampleCountFlags::TYPE_4),
        8 => Some(vk::SampleCountFlags::TYPE_8),
        16 => Some(vk::SampleCountFlags::TYPE_16),
        _ => None,
    }
}

/// Convert ImageUsage to Vulkan usage flags
///
/// Transfer in both directions is always enabled: every runtime image is
/// either a copy source, a copy destination, or both.
pub fn image_usage_to_vk(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(ImageUsage::UNORDERED_ACCESS) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    flags
}

pub fn image_create_flags(desc: &ImageDesc) -> vk::ImageCreateFlags {
    let mut flags = vk::ImageCreateFlags::empty();
    if desc.typeless {
        flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
    }
    if desc.face_count == 6 {
        flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
    }
    flags
}

#[cfg(test)]
#[path = "vulkan_format_tests.rs"]
mod tests;
