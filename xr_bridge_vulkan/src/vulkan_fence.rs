/// Fence - Vulkan timeline semaphore implementing the shared fence trait

use ash::vk;
use std::any::Any;
use std::sync::Arc;
use xr_bridge::bridge::Result;
use xr_bridge::bridge_err;
use xr_bridge::graphics_device::{Fence, HandleKind};

use crate::vulkan_context::{GpuContext, SOURCE};
use crate::vulkan_external::ExternalHandles;

pub struct VulkanFence {
    pub(crate) semaphore: vk::Semaphore,
    context: Arc<GpuContext>,
}

impl VulkanFence {
    /// Create a timeline semaphore at 0, exportable as `export_kinds`
    pub(crate) fn new(context: Arc<GpuContext>, export_kinds: &[HandleKind]) -> Result<Self> {
        let mut handle_types = vk::ExternalSemaphoreHandleTypeFlags::empty();
        for kind in export_kinds {
            if let Ok(flags) = ExternalHandles::semaphore_handle_type(*kind) {
                handle_types |= flags;
            }
        }

        let mut timeline = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let mut export = vk::ExportSemaphoreCreateInfo::default().handle_types(handle_types);
        let mut create_info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline);
        if !handle_types.is_empty() {
            create_info = create_info.push_next(&mut export);
        }

        let semaphore = unsafe { context.device.create_semaphore(&create_info, None) }
            .map_err(|e| bridge_err!(SOURCE, "Failed to create timeline semaphore: {:?}", e))?;
        Ok(Self { semaphore, context })
    }

    /// Create a timeline semaphore whose payload comes from another device
    pub(crate) fn import(context: Arc<GpuContext>, kind: HandleKind, raw: u64) -> Result<Self> {
        let fence = Self::new(context, &[])?;
        unsafe { fence.context.external.import_semaphore(fence.semaphore, kind, raw)? };
        Ok(fence)
    }

    pub(crate) fn export(&self, kind: HandleKind) -> Result<u64> {
        unsafe { self.context.external.export_semaphore(self.semaphore, kind) }
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Fence for VulkanFence {
    fn completed_value(&self) -> Result<u64> {
        unsafe { self.context.device.get_semaphore_counter_value(self.semaphore) }
            .map_err(|e| bridge_err!(SOURCE, "Failed to read semaphore counter: {:?}", e))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_semaphore(self.semaphore, None);
        }
    }
}
