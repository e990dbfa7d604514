/// VulkanGraphicsDevice - Vulkan implementation of the GraphicsDevice trait
///
/// Either created headless on the adapter the headset is connected to (the
/// compositor-side submission device), or wrapped around a device the
/// application created itself.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;
use xr_bridge::bridge::{Error, Result};
use xr_bridge::device::DeviceFactory;
use xr_bridge::graphics_device::{
    AdapterLuid, DeviceCapabilities, Fence, GpuTimer, GraphicsApi, GraphicsBinding, GraphicsDevice,
    HandleKind, Image, ImageDesc, Rect2D, SharedHandle,
};
use xr_bridge::{bridge_err, bridge_error, bridge_info, bridge_warn};

use crate::vulkan_commands;
use crate::vulkan_context::{ContextParts, GpuContext, SOURCE};
use crate::vulkan_external::DEVICE_EXTENSIONS;
use crate::vulkan_fence::VulkanFence;
use crate::vulkan_image::{vk_image, VulkanImage};
use crate::vulkan_timer::VulkanTimer;

/// Settings for devices the backend creates itself
#[derive(Debug, Clone)]
pub struct VulkanDeviceConfig {
    pub application_name: String,
    /// Enable VK_LAYER_KHRONOS_validation (needs the `vulkan-validation` feature)
    pub enable_validation: bool,
}

impl Default for VulkanDeviceConfig {
    fn default() -> Self {
        Self {
            application_name: "xr_bridge".to_string(),
            enable_validation: false,
        }
    }
}

/// Vulkan device implementation
pub struct VulkanGraphicsDevice {
    context: Arc<GpuContext>,
    adapter_luid: AdapterLuid,
    queue_index: u32,
    name: String,
    /// Keeps the Vulkan loader alive for devices created here
    _entry: Option<ash::Entry>,
}

/// LUID of a physical device, when the driver reports one
fn physical_device_luid(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<AdapterLuid> {
    let mut id_properties = vk::PhysicalDeviceIDProperties::default();
    {
        let mut properties = vk::PhysicalDeviceProperties2::default().push_next(&mut id_properties);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties) };
    }
    if id_properties.device_luid_valid == vk::FALSE {
        return None;
    }
    Some(AdapterLuid(u64::from_le_bytes(id_properties.device_luid)))
}

fn physical_device_name(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> String {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    properties
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn graphics_queue_family(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<u32> {
    unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

/// Pick the physical device matching `adapter`
///
/// Drivers that report no LUID at all (common outside Windows) fall back to
/// the first device with a graphics queue.
fn select_physical_device(instance: &ash::Instance, adapter: AdapterLuid) -> Result<(vk::PhysicalDevice, u32)> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| bridge_err!(SOURCE, "Failed to enumerate physical devices: {:?}", e))?;

    let candidates: Vec<(vk::PhysicalDevice, u32, Option<AdapterLuid>)> = physical_devices
        .into_iter()
        .filter_map(|pd| graphics_queue_family(instance, pd).map(|family| (pd, family, physical_device_luid(instance, pd))))
        .collect();

    if let Some((pd, family, _)) = candidates.iter().find(|(_, _, luid)| *luid == Some(adapter)) {
        return Ok((*pd, *family));
    }

    if candidates.iter().all(|(_, _, luid)| luid.is_none()) {
        if let Some((pd, family, _)) = candidates.first() {
            bridge_warn!(SOURCE, "No adapter reports a LUID, using '{}' for {}", physical_device_name(instance, *pd), adapter);
            return Ok((*pd, *family));
        }
    }

    bridge_error!(SOURCE, "No Vulkan adapter matches the headset adapter {}", adapter);
    Err(Error::GraphicsDeviceInvalid(format!("No Vulkan adapter matches {}", adapter)))
}

/// Adapters visible to Vulkan, with their LUID (default when the driver reports none) and name
pub fn enumerate_adapters() -> Result<Vec<(AdapterLuid, String)>> {
    unsafe {
        let entry = ash::Entry::load()
            .map_err(|e| bridge_err!(SOURCE, "Failed to load Vulkan library: {:?}", e))?;
        let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_3);
        let instance = entry
            .create_instance(&vk::InstanceCreateInfo::default().application_info(&app_info), None)
            .map_err(|e| bridge_err!(SOURCE, "Failed to create Vulkan instance: {:?}", e))?;

        let adapters = instance.enumerate_physical_devices().map(|devices| {
            devices
                .into_iter()
                .map(|pd| (physical_device_luid(&instance, pd).unwrap_or_default(), physical_device_name(&instance, pd)))
                .collect()
        });
        instance.destroy_instance(None);
        adapters.map_err(|e| bridge_err!(SOURCE, "Failed to enumerate physical devices: {:?}", e))
    }
}

impl VulkanGraphicsDevice {
    /// Create a headless device on `adapter`
    pub fn new_headless(adapter: AdapterLuid, config: &VulkanDeviceConfig) -> Result<Arc<Self>> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| bridge_err!(SOURCE, "Failed to load Vulkan library: {:?}", e))?;

            let app_name = std::ffi::CString::new(config.application_name.clone())
                .map_err(|_| Error::ValidationFailure("Application name contains a NUL byte".to_string()))?;
            let app_info = vk::ApplicationInfo::default()
                .application_name(&app_name)
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(c"xr_bridge")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_3);

            #[allow(unused_mut)]
            let mut extension_names: Vec<*const std::os::raw::c_char> = Vec::new();
            #[allow(unused_mut)]
            let mut layer_names: Vec<*const std::os::raw::c_char> = Vec::new();

            #[cfg(feature = "vulkan-validation")]
            if config.enable_validation {
                extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
                layer_names.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
            }
            #[cfg(not(feature = "vulkan-validation"))]
            if config.enable_validation {
                bridge_warn!(SOURCE, "Validation requested but the vulkan-validation feature is disabled");
            }

            let create_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(&layer_names)
                .enabled_extension_names(&extension_names);

            let instance = entry
                .create_instance(&create_info, None)
                .map_err(|e| bridge_err!(SOURCE, "Failed to create Vulkan instance: {:?}", e))?;

            #[cfg(feature = "vulkan-validation")]
            let (debug_utils_loader, debug_messenger) = if config.enable_validation {
                match crate::debug::create_messenger(&entry, &instance) {
                    Ok((loader, messenger)) => (Some(loader), Some(messenger)),
                    Err(e) => {
                        instance.destroy_instance(None);
                        return Err(e);
                    }
                }
            } else {
                (None, None)
            };
            #[cfg(not(feature = "vulkan-validation"))]
            let (debug_utils_loader, debug_messenger): (
                Option<ash::ext::debug_utils::Instance>,
                Option<vk::DebugUtilsMessengerEXT>,
            ) = (None, None);

            let (physical_device, queue_family) = match select_physical_device(&instance, adapter) {
                Ok(selected) => selected,
                Err(e) => {
                    if let (Some(loader), Some(messenger)) = (&debug_utils_loader, debug_messenger) {
                        loader.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };

            let queue_priorities = [1.0];
            let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family)
                .queue_priorities(&queue_priorities)];
            let device_extension_names: Vec<_> = DEVICE_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();
            let mut features12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
            let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);
            let device_create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_create_infos)
                .enabled_extension_names(&device_extension_names)
                .push_next(&mut features12)
                .push_next(&mut features13);

            let device = match instance.create_device(physical_device, &device_create_info, None) {
                Ok(device) => device,
                Err(e) => {
                    if let (Some(loader), Some(messenger)) = (&debug_utils_loader, debug_messenger) {
                        loader.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                    return Err(bridge_err!(SOURCE, "Failed to create logical device: {:?}", e));
                }
            };

            let name = physical_device_name(&instance, physical_device);
            let adapter_luid = physical_device_luid(&instance, physical_device).unwrap_or(adapter);
            let context = GpuContext::new(ContextParts {
                instance,
                physical_device,
                device,
                queue_family,
                queue_index: 0,
                owned: true,
                debug_utils_loader,
                debug_messenger,
            })?;

            bridge_info!(SOURCE, "Vulkan device created on '{}' ({})", name, adapter_luid);
            Ok(Arc::new(Self {
                context: Arc::new(context),
                adapter_luid,
                queue_index: 0,
                name,
                _entry: Some(entry),
            }))
        }
    }

    /// Wrap a device created by the application
    ///
    /// The device and instance stay owned by the application and are not
    /// destroyed when this wrapper drops.
    ///
    /// # Safety
    ///
    /// The handles must be valid for the wrapper's lifetime, and `device` must
    /// have been created with timeline semaphores, dynamic rendering and the
    /// external memory/semaphore extensions of this platform enabled.
    pub unsafe fn from_raw(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_index: u32,
        queue_index: u32,
    ) -> Result<Arc<Self>> {
        let name = physical_device_name(&instance, physical_device);
        let adapter_luid = physical_device_luid(&instance, physical_device).unwrap_or_default();
        let context = GpuContext::new(ContextParts {
            instance,
            physical_device,
            device,
            queue_family: queue_family_index,
            queue_index,
            owned: false,
            debug_utils_loader: None,
            debug_messenger: None,
        })?;

        bridge_info!(SOURCE, "Wrapped application Vulkan device on '{}' ({})", name, adapter_luid);
        Ok(Arc::new(Self {
            context: Arc::new(context),
            adapter_luid,
            queue_index,
            name,
            _entry: None,
        }))
    }

    /// Application binding for a wrapped device
    pub fn binding(self: &Arc<Self>) -> GraphicsBinding {
        let device: Arc<dyn GraphicsDevice> = self.clone();
        GraphicsBinding::Vulkan {
            device: Some(device),
            queue_family_index: self.context.queue_family,
            queue_index: self.queue_index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }
}

fn vk_fence(fence: &dyn Fence) -> Result<&VulkanFence> {
    fence
        .as_any()
        .downcast_ref::<VulkanFence>()
        .ok_or_else(|| bridge_err!(SOURCE, "Fence was not created by the Vulkan backend"))
}

impl GraphicsDevice for VulkanGraphicsDevice {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Vulkan
    }

    fn adapter_luid(&self) -> AdapterLuid {
        self.adapter_luid
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            shared_fence: true,
            context_state: false,
            named_handles: true,
            stencil_sharing: true,
            // Precomposition is a plain blit
            sharpening: false,
        }
    }

    // ===== SYNCHRONIZATION =====

    fn create_fence(&self) -> Result<Arc<dyn Fence>> {
        let fence = VulkanFence::new(self.context.clone(), &[HandleKind::Named, HandleKind::Legacy])?;
        Ok(Arc::new(fence))
    }

    fn export_fence(&self, fence: &dyn Fence, kind: HandleKind) -> Result<SharedHandle> {
        let raw = vk_fence(fence)?.export(kind)?;
        Ok(SharedHandle { kind, raw })
    }

    fn import_fence(&self, handle: &SharedHandle) -> Result<Arc<dyn Fence>> {
        let fence = VulkanFence::import(self.context.clone(), handle.kind, handle.raw).map_err(|e| {
            bridge_error!(SOURCE, "Shared fence import failed: {}", e);
            e
        })?;
        Ok(Arc::new(fence))
    }

    fn signal(&self, fence: &dyn Fence, value: u64) -> Result<()> {
        let semaphore = vk_fence(fence)?.semaphore;
        self.context.submit(Some((semaphore, value)))
    }

    fn wait(&self, fence: &dyn Fence, value: u64) -> Result<()> {
        let semaphore = vk_fence(fence)?.semaphore;
        self.context.add_wait(semaphore, value)
    }

    fn wait_cpu(&self, fence: &dyn Fence, value: u64, timeout: Duration) -> Result<()> {
        let semaphores = [vk_fence(fence)?.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.context.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(Error::RuntimeFailure(format!("timed out waiting for {}", value))),
            Err(e) => Err(bridge_err!(SOURCE, "Failed to wait for semaphore: {:?}", e)),
        }
    }

    // ===== IMAGES =====

    fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn Image>> {
        Ok(Arc::new(VulkanImage::create(self.context.clone(), desc)?))
    }

    fn export_image(&self, image: &dyn Image, kind: HandleKind) -> Result<SharedHandle> {
        let raw = vk_image(image)?.export(kind)?;
        Ok(SharedHandle { kind, raw })
    }

    fn import_image(&self, handle: &SharedHandle, desc: &ImageDesc) -> Result<Arc<dyn Image>> {
        Ok(Arc::new(VulkanImage::import(self.context.clone(), handle.kind, handle.raw, desc)?))
    }

    // ===== SLICE RESOLUTION =====

    fn copy_slice(&self, src: &dyn Image, src_slice: u32, dst: &dyn Image) -> Result<()> {
        vulkan_commands::copy_slice(&self.context, vk_image(src)?, src_slice, vk_image(dst)?)
    }

    fn resolve_color(&self, src: &dyn Image, src_slice: u32, dst: &dyn Image) -> Result<()> {
        vulkan_commands::resolve_color(&self.context, vk_image(src)?, src_slice, vk_image(dst)?)
    }

    fn resolve_depth(&self, src: &dyn Image, src_slice: u32, dst: &dyn Image) -> Result<()> {
        vulkan_commands::resolve_depth(&self.context, vk_image(src)?, src_slice, vk_image(dst)?)
    }

    fn precompose(&self, src: &dyn Image, src_rect: Rect2D, dst: &dyn Image, _sharpen: f32) -> Result<()> {
        vulkan_commands::precompose(&self.context, vk_image(src)?, src_rect, vk_image(dst)?)
    }

    // ===== MISC =====

    fn create_timer(&self) -> Result<Arc<dyn GpuTimer>> {
        Ok(Arc::new(VulkanTimer::new(self.context.clone())?))
    }

    fn flush(&self) -> Result<()> {
        self.context.submit(None)
    }
}

// ============================================================================
// Device factory
// ============================================================================

/// Creates headless Vulkan submission devices
#[derive(Debug, Clone, Default)]
pub struct VulkanDeviceFactory {
    config: VulkanDeviceConfig,
}

impl VulkanDeviceFactory {
    pub fn new(config: VulkanDeviceConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }
}

impl DeviceFactory for VulkanDeviceFactory {
    fn create_submission_device(&self, adapter: AdapterLuid) -> Result<Arc<dyn GraphicsDevice>> {
        let device: Arc<dyn GraphicsDevice> = VulkanGraphicsDevice::new_headless(adapter, &self.config)?;
        Ok(device)
    }
}
