/// Slice copy, resolve and precomposition commands
///
/// Every command writes layer 0 of a single-sample destination. A full memory
/// barrier is recorded on both sides of each command; all images stay in
/// `GENERAL` layout.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use xr_bridge::bridge::{Error, Result};
use xr_bridge::graphics_device::{PixelFormat, Rect2D};
use xr_bridge::{bridge_err, bridge_trace};

use crate::vulkan_context::{lock, GpuContext, Retired, SOURCE};
use crate::vulkan_format::{aspect_mask, pixel_format_to_vk, transfer_aspect};
use crate::vulkan_image::VulkanImage;

fn memory_barrier(device: &ash::Device, command_buffer: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

fn layers(aspect: vk::ImageAspectFlags, layer: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: aspect,
        mip_level: 0,
        base_array_layer: layer,
        layer_count: 1,
    }
}

fn extent(src: &VulkanImage, dst: &VulkanImage) -> vk::Extent3D {
    vk::Extent3D {
        width: src.info.width.min(dst.info.width),
        height: src.info.height.min(dst.info.height),
        depth: 1,
    }
}

fn check_slice(src: &VulkanImage, slice: u32, dst: &VulkanImage) -> Result<()> {
    if slice >= src.info.layers {
        return Err(Error::ValidationFailure(format!(
            "Slice {} out of range ({} layers)",
            slice, src.info.layers
        )));
    }
    if dst.info.samples != 1 {
        return Err(Error::ValidationFailure("Resolve destination must be single-sample".to_string()));
    }
    Ok(())
}

// ===== COPY / RESOLVE =====

pub(crate) fn copy_slice(context: &GpuContext, src: &VulkanImage, slice: u32, dst: &VulkanImage) -> Result<()> {
    check_slice(src, slice, dst)?;
    if src.info.samples != 1 {
        return Err(Error::ValidationFailure("Copy source must be single-sample".to_string()));
    }

    let region = vk::ImageCopy {
        src_subresource: layers(transfer_aspect(src.info.format), slice),
        src_offset: vk::Offset3D::default(),
        dst_subresource: layers(transfer_aspect(dst.info.format), 0),
        dst_offset: vk::Offset3D::default(),
        extent: extent(src, dst),
    };
    context.record(|device, command_buffer| {
        memory_barrier(device, command_buffer);
        unsafe {
            device.cmd_copy_image(
                command_buffer,
                src.image,
                vk::ImageLayout::GENERAL,
                dst.image,
                vk::ImageLayout::GENERAL,
                &[region],
            );
        }
        memory_barrier(device, command_buffer);
        Ok(())
    })
}

pub(crate) fn resolve_color(context: &GpuContext, src: &VulkanImage, slice: u32, dst: &VulkanImage) -> Result<()> {
    check_slice(src, slice, dst)?;
    if src.format != dst.format {
        return Err(Error::ValidationFailure(format!(
            "Color resolve between {:?} and {:?}",
            src.info.format, dst.info.format
        )));
    }

    let region = vk::ImageResolve {
        src_subresource: layers(vk::ImageAspectFlags::COLOR, slice),
        src_offset: vk::Offset3D::default(),
        dst_subresource: layers(vk::ImageAspectFlags::COLOR, 0),
        dst_offset: vk::Offset3D::default(),
        extent: extent(src, dst),
    };
    context.record(|device, command_buffer| {
        memory_barrier(device, command_buffer);
        unsafe {
            device.cmd_resolve_image(
                command_buffer,
                src.image,
                vk::ImageLayout::GENERAL,
                dst.image,
                vk::ImageLayout::GENERAL,
                &[region],
            );
        }
        memory_barrier(device, command_buffer);
        Ok(())
    })
}

/// Resolve a depth slice into a single-sample depth image
///
/// - single-sample source: image copy, or a depth-plane copy through a buffer when
///   the formats differ (drops stencil, converts D32S8 to D32)
/// - multisampled, same format: dynamic rendering pass with a depth resolve attachment
/// - multisampled, different format: resolve into a scratch image, then depth-plane copy
pub(crate) fn resolve_depth(context: &GpuContext, src: &VulkanImage, slice: u32, dst: &VulkanImage) -> Result<()> {
    check_slice(src, slice, dst)?;
    if !src.info.format.is_depth() || !dst.info.format.is_depth() {
        return Err(Error::ValidationFailure("Depth resolve on a color image".to_string()));
    }

    if src.info.samples == 1 {
        if src.format == dst.format {
            return copy_slice(context, src, slice, dst);
        }
        // Image copies need identical depth formats; the depth plane goes through a buffer
        let extent = extent(src, dst);
        return copy_depth_plane(context, src.image, slice, dst, extent.width, extent.height);
    }

    let full_aspect = aspect_mask(src.info.format);
    let src_view = src.layer_view(slice, full_aspect, src.format)?;

    if src.format == dst.format {
        let dst_view = match dst.layer_view(0, aspect_mask(dst.info.format), dst.format) {
            Ok(view) => view,
            Err(e) => {
                context.retire(Retired::View(src_view))?;
                return Err(e);
            }
        };
        let result = render_depth_resolve(context, src_view, dst_view, dst.info.width, dst.info.height);
        context.retire(Retired::View(src_view))?;
        context.retire(Retired::View(dst_view))?;
        return result;
    }

    bridge_trace!(SOURCE, "Depth resolve through scratch {:?} image", src.info.format);
    let result = resolve_through_scratch(context, src, src_view, full_aspect, dst);
    context.retire(Retired::View(src_view))?;
    result
}

fn resolve_through_scratch(
    context: &GpuContext,
    src: &VulkanImage,
    src_view: vk::ImageView,
    full_aspect: vk::ImageAspectFlags,
    dst: &VulkanImage,
) -> Result<()> {
    let (scratch, allocation) = create_scratch(context, src.info.format, dst.info.width, dst.info.height)?;
    let scratch_view = match create_view(context, scratch, src.format, full_aspect) {
        Ok(view) => view,
        Err(e) => {
            context.retire(Retired::Scratch(scratch, allocation))?;
            return Err(e);
        }
    };

    let result = render_depth_resolve(context, src_view, scratch_view, dst.info.width, dst.info.height)
        .and_then(|_| copy_depth_plane(context, scratch, 0, dst, dst.info.width, dst.info.height));

    // Freed once the commands above have executed
    context.retire(Retired::View(scratch_view))?;
    context.retire(Retired::Scratch(scratch, allocation))?;
    result
}

/// Copy the depth plane of `layer` of `src` into layer 0 of `dst` through a staging buffer
///
/// Depth planes of D32 and D32S8 share the 4-byte-per-texel buffer layout.
fn copy_depth_plane(
    context: &GpuContext,
    src: vk::Image,
    layer: u32,
    dst: &VulkanImage,
    width: u32,
    height: u32,
) -> Result<()> {
    let size = width as u64 * height as u64 * 4;
    let (buffer, allocation) = create_staging(context, size)?;

    let region = |layer| vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: layers(vk::ImageAspectFlags::DEPTH, layer),
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D { width, height, depth: 1 },
    };
    let result = context.record(|device, command_buffer| {
        memory_barrier(device, command_buffer);
        unsafe {
            device.cmd_copy_image_to_buffer(command_buffer, src, vk::ImageLayout::GENERAL, buffer, &[region(layer)]);
        }
        memory_barrier(device, command_buffer);
        unsafe {
            device.cmd_copy_buffer_to_image(command_buffer, buffer, dst.image, vk::ImageLayout::GENERAL, &[region(0)]);
        }
        memory_barrier(device, command_buffer);
        Ok(())
    });

    context.retire(Retired::Staging(buffer, allocation))?;
    result
}

fn create_staging(context: &GpuContext, size: u64) -> Result<(vk::Buffer, Allocation)> {
    let create_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let device = &context.device;
    let buffer = unsafe { device.create_buffer(&create_info, None) }
        .map_err(|e| bridge_err!(SOURCE, "Failed to create depth staging buffer: {:?}", e))?;
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let allocation = lock(&context.allocator, "Allocator").and_then(|mut allocator| {
        allocator
            .allocate(&AllocationCreateDesc {
                name: "depth staging",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|_| Error::OutOfMemory)
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };
    if let Err(e) = unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
        context.retire(Retired::Staging(buffer, allocation))?;
        return Err(bridge_err!(SOURCE, "Failed to bind staging memory: {:?}", e));
    }
    Ok((buffer, allocation))
}

fn render_depth_resolve(
    context: &GpuContext,
    src_view: vk::ImageView,
    dst_view: vk::ImageView,
    width: u32,
    height: u32,
) -> Result<()> {
    context.record(|device, command_buffer| {
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(src_view)
            .image_layout(vk::ImageLayout::GENERAL)
            .resolve_mode(vk::ResolveModeFlags::SAMPLE_ZERO)
            .resolve_image_view(dst_view)
            .resolve_image_layout(vk::ImageLayout::GENERAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE);
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D { width, height },
            })
            .layer_count(1)
            .depth_attachment(&depth_attachment);

        memory_barrier(device, command_buffer);
        unsafe {
            device.cmd_begin_rendering(command_buffer, &rendering_info);
            device.cmd_end_rendering(command_buffer);
        }
        memory_barrier(device, command_buffer);
        Ok(())
    })
}

fn create_scratch(context: &GpuContext, format: PixelFormat, width: u32, height: u32) -> Result<(vk::Image, Allocation)> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(pixel_format_to_vk(format))
        .extent(vk::Extent3D { width, height, depth: 1 })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let device = &context.device;
    let image = unsafe { device.create_image(&create_info, None) }
        .map_err(|e| bridge_err!(SOURCE, "Failed to create scratch depth image: {:?}", e))?;
    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let allocation = lock(&context.allocator, "Allocator").and_then(|mut allocator| {
        allocator
            .allocate(&AllocationCreateDesc {
                name: "depth resolve scratch",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|_| Error::OutOfMemory)
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }
    };
    if let Err(e) = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
        context.retire(Retired::Scratch(image, allocation))?;
        return Err(bridge_err!(SOURCE, "Failed to bind scratch memory: {:?}", e));
    }

    let range = vk::ImageSubresourceRange {
        aspect_mask: aspect_mask(format),
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };
    context.record(|device, command_buffer| {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        Ok(())
    })?;
    Ok((image, allocation))
}

fn create_view(context: &GpuContext, image: vk::Image, format: vk::Format, aspect: vk::ImageAspectFlags) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { context.device.create_image_view(&view_info, None) }
        .map_err(|e| bridge_err!(SOURCE, "Failed to create scratch view: {:?}", e))
}

// ===== PRECOMPOSITION =====

/// Scale `src_rect` of layer 0 into the whole of `dst` with a linear blit
pub(crate) fn precompose(context: &GpuContext, src: &VulkanImage, src_rect: Rect2D, dst: &VulkanImage) -> Result<()> {
    if src.info.format.is_depth() || dst.info.format.is_depth() {
        return Err(Error::ValidationFailure("Precomposition of a depth image".to_string()));
    }
    if !src_rect.fits_within(src.info.width, src.info.height) {
        return Err(Error::SwapchainRectInvalid);
    }
    let region = vk::ImageBlit {
        src_subresource: layers(vk::ImageAspectFlags::COLOR, 0),
        src_offsets: [
            vk::Offset3D { x: src_rect.x, y: src_rect.y, z: 0 },
            vk::Offset3D {
                x: src_rect.x + src_rect.width as i32,
                y: src_rect.y + src_rect.height as i32,
                z: 1,
            },
        ],
        dst_subresource: layers(vk::ImageAspectFlags::COLOR, 0),
        dst_offsets: [
            vk::Offset3D::default(),
            vk::Offset3D { x: dst.info.width as i32, y: dst.info.height as i32, z: 1 },
        ],
    };
    context.record(|device, command_buffer| {
        memory_barrier(device, command_buffer);
        unsafe {
            device.cmd_blit_image(
                command_buffer,
                src.image,
                vk::ImageLayout::GENERAL,
                dst.image,
                vk::ImageLayout::GENERAL,
                &[region],
                vk::Filter::LINEAR,
            );
        }
        memory_barrier(device, command_buffer);
        Ok(())
    })
}
