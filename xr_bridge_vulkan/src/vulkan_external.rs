/// External memory and semaphore handles
///
/// Unix shares through opaque FDs (`Named` handles only). Windows shares
/// through NT handles for `Named` and KMT handles for `Legacy`.

use ash::vk;
use std::ffi::CStr;
use xr_bridge::bridge::{Error, Result};
use xr_bridge::graphics_device::HandleKind;

/// Device extensions required for cross-device sharing on this platform
#[cfg(unix)]
pub(crate) const DEVICE_EXTENSIONS: [&CStr; 2] = [
    ash::khr::external_memory_fd::NAME,
    ash::khr::external_semaphore_fd::NAME,
];

#[cfg(windows)]
pub(crate) const DEVICE_EXTENSIONS: [&CStr; 2] = [
    ash::khr::external_memory_win32::NAME,
    ash::khr::external_semaphore_win32::NAME,
];

#[cfg(unix)]
pub(crate) struct ExternalHandles {
    memory: ash::khr::external_memory_fd::Device,
    semaphore: ash::khr::external_semaphore_fd::Device,
}

#[cfg(windows)]
pub(crate) struct ExternalHandles {
    memory: ash::khr::external_memory_win32::Device,
    semaphore: ash::khr::external_semaphore_win32::Device,
}

fn unsupported(kind: HandleKind) -> Error {
    Error::FeatureUnsupported(format!("{:?} handles are not available on this platform", kind))
}

#[cfg(unix)]
impl ExternalHandles {
    pub(crate) fn new(instance: &ash::Instance, device: &ash::Device) -> Self {
        Self {
            memory: ash::khr::external_memory_fd::Device::new(instance, device),
            semaphore: ash::khr::external_semaphore_fd::Device::new(instance, device),
        }
    }

    pub(crate) fn memory_handle_type(kind: HandleKind) -> Result<vk::ExternalMemoryHandleTypeFlags> {
        match kind {
            HandleKind::Named => Ok(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD),
            HandleKind::Legacy => Err(unsupported(kind)),
        }
    }

    pub(crate) fn semaphore_handle_type(kind: HandleKind) -> Result<vk::ExternalSemaphoreHandleTypeFlags> {
        match kind {
            HandleKind::Named => Ok(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD),
            HandleKind::Legacy => Err(unsupported(kind)),
        }
    }

    pub(crate) unsafe fn export_memory(&self, memory: vk::DeviceMemory, kind: HandleKind) -> Result<u64> {
        let info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory)
            .handle_type(Self::memory_handle_type(kind)?);
        let fd = self
            .memory
            .get_memory_fd(&info)
            .map_err(|e| Error::BackendError(format!("Failed to export image memory: {:?}", e)))?;
        Ok(fd as u64)
    }

    pub(crate) unsafe fn export_semaphore(&self, semaphore: vk::Semaphore, kind: HandleKind) -> Result<u64> {
        let info = vk::SemaphoreGetFdInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(Self::semaphore_handle_type(kind)?);
        let fd = self
            .semaphore
            .get_semaphore_fd(&info)
            .map_err(|e| Error::BackendError(format!("Failed to export semaphore: {:?}", e)))?;
        Ok(fd as u64)
    }

    /// Import a semaphore payload; the FD is consumed on success
    pub(crate) unsafe fn import_semaphore(&self, semaphore: vk::Semaphore, kind: HandleKind, raw: u64) -> Result<()> {
        let info = vk::ImportSemaphoreFdInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(Self::semaphore_handle_type(kind)?)
            .fd(raw as i32);
        self.semaphore
            .import_semaphore_fd(&info)
            .map_err(|e| Error::GraphicsDeviceInvalid(format!("Failed to import semaphore: {:?}", e)))
    }

    /// Allocate dedicated memory for `image` backed by an imported payload
    pub(crate) unsafe fn import_memory(
        &self,
        device: &ash::Device,
        image: vk::Image,
        requirements: &vk::MemoryRequirements,
        memory_type_index: u32,
        kind: HandleKind,
        raw: u64,
    ) -> Result<vk::DeviceMemory> {
        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(Self::memory_handle_type(kind)?)
            .fd(raw as i32);
        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info)
            .push_next(&mut dedicated);
        device
            .allocate_memory(&alloc_info, None)
            .map_err(|e| Error::GraphicsDeviceInvalid(format!("Failed to import image memory: {:?}", e)))
    }
}

#[cfg(windows)]
impl ExternalHandles {
    pub(crate) fn new(instance: &ash::Instance, device: &ash::Device) -> Self {
        Self {
            memory: ash::khr::external_memory_win32::Device::new(instance, device),
            semaphore: ash::khr::external_semaphore_win32::Device::new(instance, device),
        }
    }

    pub(crate) fn memory_handle_type(kind: HandleKind) -> Result<vk::ExternalMemoryHandleTypeFlags> {
        Ok(match kind {
            HandleKind::Named => vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32,
            HandleKind::Legacy => vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32_KMT,
        })
    }

    pub(crate) fn semaphore_handle_type(kind: HandleKind) -> Result<vk::ExternalSemaphoreHandleTypeFlags> {
        Ok(match kind {
            HandleKind::Named => vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32,
            HandleKind::Legacy => vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32_KMT,
        })
    }

    pub(crate) unsafe fn export_memory(&self, memory: vk::DeviceMemory, kind: HandleKind) -> Result<u64> {
        let info = vk::MemoryGetWin32HandleInfoKHR::default()
            .memory(memory)
            .handle_type(Self::memory_handle_type(kind)?);
        let handle = self
            .memory
            .get_memory_win32_handle(&info)
            .map_err(|e| Error::BackendError(format!("Failed to export image memory: {:?}", e)))?;
        Ok(handle as usize as u64)
    }

    pub(crate) unsafe fn export_semaphore(&self, semaphore: vk::Semaphore, kind: HandleKind) -> Result<u64> {
        let info = vk::SemaphoreGetWin32HandleInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(Self::semaphore_handle_type(kind)?);
        let handle = self
            .semaphore
            .get_semaphore_win32_handle(&info)
            .map_err(|e| Error::BackendError(format!("Failed to export semaphore: {:?}", e)))?;
        Ok(handle as usize as u64)
    }

    pub(crate) unsafe fn import_semaphore(&self, semaphore: vk::Semaphore, kind: HandleKind, raw: u64) -> Result<()> {
        let info = vk::ImportSemaphoreWin32HandleInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(Self::semaphore_handle_type(kind)?)
            .handle(raw as usize as vk::HANDLE);
        self.semaphore
            .import_semaphore_win32_handle(&info)
            .map_err(|e| Error::GraphicsDeviceInvalid(format!("Failed to import semaphore: {:?}", e)))
    }

    pub(crate) unsafe fn import_memory(
        &self,
        device: &ash::Device,
        image: vk::Image,
        requirements: &vk::MemoryRequirements,
        memory_type_index: u32,
        kind: HandleKind,
        raw: u64,
    ) -> Result<vk::DeviceMemory> {
        let mut import_info = vk::ImportMemoryWin32HandleInfoKHR::default()
            .handle_type(Self::memory_handle_type(kind)?)
            .handle(raw as usize as vk::HANDLE);
        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info)
            .push_next(&mut dedicated);
        device
            .allocate_memory(&alloc_info, None)
            .map_err(|e| Error::GraphicsDeviceInvalid(format!("Failed to import image memory: {:?}", e)))
    }
}
