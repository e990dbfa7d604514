/// Mock device factory and binding helpers for unit tests

#[cfg(test)]
use std::sync::{Arc, Mutex};

#[cfg(test)]
use crate::config::RuntimeConfig;
#[cfg(test)]
use crate::device::{DeviceBinder, DeviceContext, DeviceFactory};
#[cfg(test)]
use crate::error::Result;
#[cfg(test)]
use crate::graphics_device::mock_graphics_device::MockGraphicsDevice;
#[cfg(test)]
use crate::graphics_device::{AdapterLuid, DeviceCapabilities, GraphicsApi, GraphicsBinding, GraphicsDevice};

#[cfg(test)]
pub const MOCK_ADAPTER: AdapterLuid = AdapterLuid(0x0000_0001_0000_2a00);

/// Creates D3D11 mock submission devices and keeps them for inspection
#[cfg(test)]
pub struct MockDeviceFactory {
    pub created: Mutex<Vec<Arc<MockGraphicsDevice>>>,
    /// Create devices on this adapter instead of the requested one
    pub adapter_override: Option<AdapterLuid>,
}

#[cfg(test)]
impl MockDeviceFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { created: Mutex::new(Vec::new()), adapter_override: None })
    }

    pub fn on_adapter(adapter: AdapterLuid) -> Arc<Self> {
        Arc::new(Self { created: Mutex::new(Vec::new()), adapter_override: Some(adapter) })
    }

    pub fn last(&self) -> Option<Arc<MockGraphicsDevice>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[cfg(test)]
impl DeviceFactory for MockDeviceFactory {
    fn create_submission_device(&self, adapter: AdapterLuid) -> Result<Arc<dyn GraphicsDevice>> {
        let device = Arc::new(MockGraphicsDevice::new(
            GraphicsApi::D3D11,
            self.adapter_override.unwrap_or(adapter),
        ));
        self.created.lock().unwrap().push(device.clone());
        Ok(device as Arc<dyn GraphicsDevice>)
    }
}

/// Mock binding for `api` on the headset adapter
#[cfg(test)]
pub fn mock_binding(device: Arc<MockGraphicsDevice>) -> GraphicsBinding {
    let api = device.api;
    let device = Some(device as Arc<dyn GraphicsDevice>);
    match api {
        GraphicsApi::D3D11 => GraphicsBinding::D3D11 { device },
        GraphicsApi::D3D12 => GraphicsBinding::D3D12 { device, queue: 0x1000 },
        GraphicsApi::Vulkan => GraphicsBinding::Vulkan { device, queue_family_index: 0, queue_index: 0 },
        GraphicsApi::OpenGL => GraphicsBinding::OpenGL { device, hdc: 0x10, hglrc: 0x20 },
    }
}

/// A bound device context plus the mocks behind it
#[cfg(test)]
pub struct MockBinding {
    pub context: DeviceContext,
    pub app: Arc<MockGraphicsDevice>,
    pub submission: Arc<MockGraphicsDevice>,
}

/// Bind a fresh mock application device of `api`
///
/// D3D11 bindings share the device when `shared` is set.
#[cfg(test)]
pub fn bind_mock(api: GraphicsApi, shared: bool, config: &RuntimeConfig) -> MockBinding {
    let factory = MockDeviceFactory::new();
    let binder = DeviceBinder::new(MOCK_ADAPTER, factory.clone());
    binder.graphics_requirements(api);
    let caps = DeviceCapabilities { context_state: shared, ..DeviceCapabilities::default() };
    let app = Arc::new(MockGraphicsDevice::with_capabilities(api, MOCK_ADAPTER, caps));
    let config = RuntimeConfig {
        use_application_device_for_submission: shared,
        ..config.clone()
    };
    let context = binder.bind_device(mock_binding(app.clone()), &config).unwrap();
    let submission = factory.last().unwrap_or_else(|| app.clone());
    MockBinding { context, app, submission }
}
