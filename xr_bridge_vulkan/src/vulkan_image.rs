/// Image - Vulkan implementation of the Image trait
///
/// Every image lives in `GENERAL` layout from creation on. Images are shared
/// across devices and queues, and a single layout keeps the importer and the
/// exporter in agreement without ownership transfers.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::any::Any;
use std::sync::Arc;
use xr_bridge::bridge::{Error, Result};
use xr_bridge::graphics_device::{HandleKind, Image, ImageDesc, ImageInfo, ImageUsage, PixelFormat};
use xr_bridge::{bridge_err, bridge_error};

use crate::vulkan_context::{lock, GpuContext, SOURCE};
use crate::vulkan_external::ExternalHandles;
use crate::vulkan_format::{aspect_mask, image_create_flags, image_usage_to_vk, pixel_format_to_vk, sample_count_to_vk};

enum ImageMemory {
    /// Sub-allocated by gpu-allocator
    Allocated(Option<Allocation>),
    /// Dedicated allocation, exported or imported
    Dedicated(vk::DeviceMemory),
}

/// Vulkan image implementation
pub struct VulkanImage {
    pub(crate) image: vk::Image,
    memory: ImageMemory,
    pub(crate) format: vk::Format,
    pub(crate) info: ImageInfo,
    context: Arc<GpuContext>,
}

/// Handle types every shared image is created exportable as
fn export_handle_types() -> vk::ExternalMemoryHandleTypeFlags {
    [HandleKind::Named, HandleKind::Legacy]
        .iter()
        .filter_map(|kind| ExternalHandles::memory_handle_type(*kind).ok())
        .fold(vk::ExternalMemoryHandleTypeFlags::empty(), |acc, flags| acc | flags)
}

fn image_create_info<'a>(desc: &ImageDesc) -> Result<vk::ImageCreateInfo<'a>> {
    let samples = sample_count_to_vk(desc.sample_count)
        .ok_or_else(|| Error::ValidationFailure(format!("Unsupported sample count {}", desc.sample_count)))?;
    Ok(vk::ImageCreateInfo::default()
        .flags(image_create_flags(desc))
        .image_type(vk::ImageType::TYPE_2D)
        .format(pixel_format_to_vk(desc.format))
        .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
        .mip_levels(desc.mip_count.max(1))
        .array_layers(desc.layer_count().max(1))
        .samples(samples)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(image_usage_to_vk(desc.usage))
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED))
}

impl VulkanImage {
    pub(crate) fn create(context: Arc<GpuContext>, desc: &ImageDesc) -> Result<Self> {
        let shared = desc.usage.contains(ImageUsage::SHARED);
        let mut external_info = vk::ExternalMemoryImageCreateInfo::default().handle_types(export_handle_types());
        let mut create_info = image_create_info(desc)?;
        if shared {
            create_info = create_info.push_next(&mut external_info);
        }

        let device = &context.device;
        let image = unsafe { device.create_image(&create_info, None) }
            .map_err(|e| bridge_err!(SOURCE, "Failed to create image '{}' ({}x{}): {:?}", desc.label, desc.width, desc.height, e))?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory = if shared {
            match Self::allocate_exportable(&context, image, &requirements) {
                Ok(memory) => ImageMemory::Dedicated(memory),
                Err(e) => {
                    unsafe { device.destroy_image(image, None) };
                    return Err(e);
                }
            }
        } else {
            let allocation = lock(&context.allocator, "Allocator")?
                .allocate(&AllocationCreateDesc {
                    name: &desc.label,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|_| {
                    let size_mb = requirements.size as f64 / (1024.0 * 1024.0);
                    bridge_error!(SOURCE, "Out of GPU memory for image '{}' (required: {:.2} MB)", desc.label, size_mb);
                    Error::OutOfMemory
                });
            let allocation = match allocation {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { device.destroy_image(image, None) };
                    return Err(e);
                }
            };
            unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
                .map_err(|e| bridge_err!(SOURCE, "Failed to bind image memory: {:?}", e))?;
            ImageMemory::Allocated(Some(allocation))
        };

        let vk_image = Self {
            image,
            memory,
            format: create_info.format,
            info: ImageInfo::from(desc),
            context,
        };
        vk_image.transition_to_general()?;
        Ok(vk_image)
    }

    fn allocate_exportable(
        context: &GpuContext,
        image: vk::Image,
        requirements: &vk::MemoryRequirements,
    ) -> Result<vk::DeviceMemory> {
        let memory_type_index = context
            .memory_type_index(requirements.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .ok_or(Error::OutOfMemory)?;
        let mut export_info = vk::ExportMemoryAllocateInfo::default().handle_types(export_handle_types());
        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut export_info)
            .push_next(&mut dedicated);

        unsafe {
            let memory = context.device.allocate_memory(&alloc_info, None).map_err(|e| {
                bridge_error!(SOURCE, "Failed to allocate exportable image memory: {:?}", e);
                Error::OutOfMemory
            })?;
            if let Err(e) = context.device.bind_image_memory(image, memory, 0) {
                context.device.free_memory(memory, None);
                return Err(bridge_err!(SOURCE, "Failed to bind image memory: {:?}", e));
            }
            Ok(memory)
        }
    }

    /// Open an image exported by another device
    pub(crate) fn import(context: Arc<GpuContext>, kind: HandleKind, raw: u64, desc: &ImageDesc) -> Result<Self> {
        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(ExternalHandles::memory_handle_type(kind)?);
        let create_info = image_create_info(desc)?.push_next(&mut external_info);

        let device = &context.device;
        let image = unsafe { device.create_image(&create_info, None) }
            .map_err(|e| Error::GraphicsDeviceInvalid(format!("Failed to create imported image: {:?}", e)))?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = context
            .memory_type_index(requirements.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .or_else(|| context.memory_type_index(requirements.memory_type_bits, vk::MemoryPropertyFlags::empty()))
            .ok_or_else(|| Error::GraphicsDeviceInvalid("No memory type for imported image".to_string()))?;

        let memory = unsafe {
            context
                .external
                .import_memory(device, image, &requirements, memory_type_index, kind, raw)
                .and_then(|memory| {
                    device.bind_image_memory(image, memory, 0).map_err(|e| {
                        device.free_memory(memory, None);
                        Error::GraphicsDeviceInvalid(format!("Failed to bind imported memory: {:?}", e))
                    })?;
                    Ok(memory)
                })
        };
        let memory = match memory {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                bridge_error!(SOURCE, "{}", e);
                return Err(e);
            }
        };

        Ok(Self {
            image,
            memory: ImageMemory::Dedicated(memory),
            format: create_info.format,
            info: ImageInfo::from(desc),
            context,
        })
    }

    pub(crate) fn export(&self, kind: HandleKind) -> Result<u64> {
        match self.memory {
            ImageMemory::Dedicated(memory) => unsafe { self.context.external.export_memory(memory, kind) },
            ImageMemory::Allocated(_) => Err(Error::ValidationFailure(
                "Image was not created shareable".to_string(),
            )),
        }
    }

    fn transition_to_general(&self) -> Result<()> {
        let range = self.full_range();
        self.context.record(|device, command_buffer| {
            let barrier = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.image)
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
        })
    }

    fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_mask(self.info.format),
            base_mip_level: 0,
            level_count: self.info.mip_levels.max(1),
            base_array_layer: 0,
            layer_count: self.info.layers.max(1),
        }
    }

    /// 2D view of one layer, for use as a rendering attachment
    pub(crate) fn layer_view(&self, layer: u32, aspect: vk::ImageAspectFlags, format: vk::Format) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: layer,
                layer_count: 1,
            });
        unsafe { self.context.device.create_image_view(&view_info, None) }
            .map_err(|e| bridge_err!(SOURCE, "Failed to create image view: {:?}", e))
    }

    pub fn raw(&self) -> vk::Image {
        self.image
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.info.format
    }
}

impl Image for VulkanImage {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        unsafe {
            match &mut self.memory {
                ImageMemory::Allocated(allocation) => {
                    if let (Some(allocation), Ok(mut allocator)) = (allocation.take(), self.context.allocator.lock()) {
                        allocator.free(allocation).ok();
                    }
                }
                ImageMemory::Dedicated(memory) => self.context.device.free_memory(*memory, None),
            }
            self.context.device.destroy_image(self.image, None);
        }
    }
}

/// Downcast a trait object created by this backend
pub(crate) fn vk_image(image: &dyn Image) -> Result<&VulkanImage> {
    image
        .as_any()
        .downcast_ref::<VulkanImage>()
        .ok_or_else(|| bridge_err!(SOURCE, "Image was not created by the Vulkan backend"))
}
