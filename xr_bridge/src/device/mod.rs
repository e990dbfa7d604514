/// Device module - application device binding and cross-device synchronization

pub mod device_binder;
pub mod synchronizer;

pub use device_binder::{DeviceBinder, DeviceContext, DeviceFactory, GraphicsRequirements};
pub use synchronizer::{CrossDeviceSynchronizer, QueueSide, FLUSH_TIMEOUT};

// Mock device factory for tests
#[cfg(test)]
pub mod mock_device_factory;
