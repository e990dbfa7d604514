/// Graphics device module - device/image/fence traits, API bindings and formats

pub mod graphics_device;
pub mod graphics_binding;
pub mod format;
pub mod gpu_timer;

pub use graphics_device::*;
pub use graphics_binding::*;
pub use format::{PixelFormat, TypelessFamily, supported_formats, supported_format_codes};
pub use gpu_timer::{GpuTimerRing, GPU_TIMER_LATENCY};

// Mock graphics device for tests (no GPU required)
#[cfg(test)]
pub mod mock_graphics_device;
