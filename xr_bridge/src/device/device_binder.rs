/// Device binding: application device validation and submission device selection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::device::{CrossDeviceSynchronizer, QueueSide};
use crate::error::{Error, Result};
use crate::graphics_device::{
    AdapterLuid, GpuTimerRing, GraphicsApi, GraphicsBinding, GraphicsDevice, HandleKind,
};

/// Creates compositor-side devices on a given adapter
///
/// Implemented by backends (e.g., the Vulkan crate creates a headless device).
pub trait DeviceFactory: Send + Sync {
    fn create_submission_device(&self, adapter: AdapterLuid) -> Result<Arc<dyn GraphicsDevice>>;
}

/// Answer to a graphics requirements query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsRequirements {
    pub adapter_luid: AdapterLuid,
    /// Packed major.minor.patch (major << 22 | minor << 12 | patch)
    pub min_api_version: u32,
    pub max_api_version: u32,
}

const fn make_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 22) | (minor << 12) | patch
}

/// Everything bound for the lifetime of a session
pub struct DeviceContext {
    pub binding: GraphicsBinding,
    pub app_device: Arc<dyn GraphicsDevice>,
    pub submission_device: Arc<dyn GraphicsDevice>,
    /// Submission device is the application device
    pub shares_device: bool,
    pub synchronizer: CrossDeviceSynchronizer,
    /// Handle flavor negotiated for image and fence sharing
    pub handle_kind: HandleKind,
    /// Stencil planes survive the share between the two devices
    pub stencil_shareable: bool,
    pub app_timers: GpuTimerRing,
    pub precomposition_timers: GpuTimerRing,
}

impl DeviceContext {
    pub fn api(&self) -> GraphicsApi {
        self.binding.api()
    }

    /// Order application work submitted so far before the next submission device work
    pub fn serialize_app_work(&self) -> Result<()> {
        if self.shares_device {
            return Ok(());
        }
        self.synchronizer
            .signal_and_wait(QueueSide::Application, QueueSide::Submission)
            .map(|_| ())
    }

    /// Order submission device work before later application work
    pub fn serialize_submission_work(&self) -> Result<()> {
        if self.shares_device {
            return Ok(());
        }
        self.synchronizer
            .signal_and_wait(QueueSide::Submission, QueueSide::Application)
            .map(|_| ())
    }

    /// Block until both devices are idle
    pub fn flush_all(&self) -> Result<()> {
        self.synchronizer.flush(QueueSide::Application)?;
        if !self.shares_device {
            self.synchronizer.flush(QueueSide::Submission)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("binding", &self.binding)
            .field("shares_device", &self.shares_device)
            .field("handle_kind", &self.handle_kind)
            .finish()
    }
}

pub struct DeviceBinder {
    target_adapter: AdapterLuid,
    factory: Arc<dyn DeviceFactory>,
    requirements_queried: AtomicBool,
}

impl DeviceBinder {
    pub fn new(target_adapter: AdapterLuid, factory: Arc<dyn DeviceFactory>) -> Self {
        Self {
            target_adapter,
            factory,
            requirements_queried: AtomicBool::new(false),
        }
    }

    pub fn target_adapter(&self) -> AdapterLuid {
        self.target_adapter
    }

    pub fn requirements_queried(&self) -> bool {
        self.requirements_queried.load(Ordering::SeqCst)
    }

    /// Report the adapter and API versions the application must use
    pub fn graphics_requirements(&self, api: GraphicsApi) -> GraphicsRequirements {
        self.requirements_queried.store(true, Ordering::SeqCst);
        let (min_api_version, max_api_version) = match api {
            GraphicsApi::D3D11 => (make_version(11, 0, 0), make_version(11, 1, 0)),
            GraphicsApi::D3D12 => (make_version(12, 0, 0), make_version(12, 1, 0)),
            GraphicsApi::Vulkan => (make_version(1, 1, 0), make_version(1, 3, 0)),
            GraphicsApi::OpenGL => (make_version(4, 3, 0), make_version(4, 6, 0)),
        };
        GraphicsRequirements {
            adapter_luid: self.target_adapter,
            min_api_version,
            max_api_version,
        }
    }

    /// Validate the application's device and establish the submission device
    pub fn bind_device(&self, binding: GraphicsBinding, config: &RuntimeConfig) -> Result<DeviceContext> {
        if !self.requirements_queried() {
            return Err(Error::GraphicsRequirementsCallMissing);
        }

        let api = binding.api();
        let app_device = binding
            .device()
            .cloned()
            .ok_or_else(|| Error::GraphicsDeviceInvalid(format!("{} binding has no device", api)))?;
        binding.validate().map_err(Error::GraphicsDeviceInvalid)?;

        let adapter = app_device.adapter_luid();
        if adapter != self.target_adapter {
            crate::bridge_error!(
                "xr_bridge::DeviceBinder",
                "Application device is on adapter {} but the headset is on {}",
                adapter,
                self.target_adapter
            );
            return Err(Error::GraphicsDeviceInvalid(format!(
                "adapter {} does not drive the headset",
                adapter
            )));
        }

        let app_caps = app_device.capabilities();
        let shares_device = api.can_share_device_with_compositor()
            && config.use_application_device_for_submission
            && app_caps.context_state
            && app_caps.shared_fence;

        let submission_device = if shares_device {
            app_device.clone()
        } else {
            let device = self.factory.create_submission_device(self.target_adapter).map_err(|e| {
                Error::GraphicsDeviceInvalid(format!("failed to create submission device: {}", e))
            })?;
            if device.adapter_luid() != self.target_adapter {
                return Err(Error::GraphicsDeviceInvalid(
                    "submission device created on the wrong adapter".to_string(),
                ));
            }
            device
        };
        let submission_caps = submission_device.capabilities();

        let handle_kind = if config.slow_path.vendor_requires_named_handles {
            HandleKind::Named
        } else {
            api.native_handle_kind()
        };
        if !shares_device
            && handle_kind == HandleKind::Named
            && !(app_caps.named_handles && submission_caps.named_handles)
        {
            return Err(Error::GraphicsDeviceInvalid(
                "devices cannot share name-based handles".to_string(),
            ));
        }
        let stencil_shareable =
            shares_device || (app_caps.stencil_sharing && submission_caps.stencil_sharing);

        let synchronizer = if shares_device {
            CrossDeviceSynchronizer::single(submission_device.clone())?
        } else {
            CrossDeviceSynchronizer::new(app_device.clone(), submission_device.clone(), handle_kind)?
        };

        let app_timers = GpuTimerRing::new(app_device.as_ref())?;
        let precomposition_timers = GpuTimerRing::new(submission_device.as_ref())?;

        crate::bridge_info!(
            "xr_bridge::DeviceBinder",
            "Bound {} device on adapter {} ({}, {:?} handles)",
            api,
            adapter,
            if shares_device { "shared submission device" } else { "dedicated submission device" },
            handle_kind
        );

        Ok(DeviceContext {
            binding,
            app_device,
            submission_device,
            shares_device,
            synchronizer,
            handle_kind,
            stencil_shareable,
            app_timers,
            precomposition_timers,
        })
    }
}

#[cfg(test)]
#[path = "device_binder_tests.rs"]
mod tests;
