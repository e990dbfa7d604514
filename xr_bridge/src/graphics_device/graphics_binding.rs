/// Graphics API bindings supplied by the application at session creation

use std::fmt;
use std::sync::Arc;

use crate::graphics_device::{GraphicsDevice, HandleKind};

/// Client-facing graphics API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphicsApi {
    D3D11,
    D3D12,
    Vulkan,
    OpenGL,
}

impl fmt::Display for GraphicsApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphicsApi::D3D11 => "D3D11",
            GraphicsApi::D3D12 => "D3D12",
            GraphicsApi::Vulkan => "Vulkan",
            GraphicsApi::OpenGL => "OpenGL",
        };
        f.write_str(name)
    }
}

impl GraphicsApi {
    /// Only an immediate-context API can hand its own device to the compositor
    pub fn can_share_device_with_compositor(self) -> bool {
        matches!(self, GraphicsApi::D3D11)
    }

    /// Handle flavor this API can import without extra negotiation
    pub fn native_handle_kind(self) -> HandleKind {
        match self {
            GraphicsApi::D3D11 => HandleKind::Legacy,
            GraphicsApi::D3D12 | GraphicsApi::Vulkan | GraphicsApi::OpenGL => HandleKind::Named,
        }
    }
}

/// Application graphics binding
///
/// Each variant carries only what its API needs. `device` is `None` when the
/// application passed a null device.
#[derive(Clone)]
pub enum GraphicsBinding {
    D3D11 {
        device: Option<Arc<dyn GraphicsDevice>>,
    },
    D3D12 {
        device: Option<Arc<dyn GraphicsDevice>>,
        /// Application command queue the runtime signals on
        queue: u64,
    },
    Vulkan {
        device: Option<Arc<dyn GraphicsDevice>>,
        queue_family_index: u32,
        queue_index: u32,
    },
    OpenGL {
        device: Option<Arc<dyn GraphicsDevice>>,
        /// Device context and rendering context the application made current
        hdc: u64,
        hglrc: u64,
    },
}

impl GraphicsBinding {
    pub fn api(&self) -> GraphicsApi {
        match self {
            GraphicsBinding::D3D11 { .. } => GraphicsApi::D3D11,
            GraphicsBinding::D3D12 { .. } => GraphicsApi::D3D12,
            GraphicsBinding::Vulkan { .. } => GraphicsApi::Vulkan,
            GraphicsBinding::OpenGL { .. } => GraphicsApi::OpenGL,
        }
    }

    pub fn device(&self) -> Option<&Arc<dyn GraphicsDevice>> {
        match self {
            GraphicsBinding::D3D11 { device }
            | GraphicsBinding::D3D12 { device, .. }
            | GraphicsBinding::Vulkan { device, .. }
            | GraphicsBinding::OpenGL { device, .. } => device.as_ref(),
        }
    }

    /// Binding-specific sanity checks beyond the device itself
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            GraphicsBinding::D3D12 { queue, .. } if *queue == 0 => {
                Err("D3D12 binding without a command queue".to_string())
            }
            GraphicsBinding::OpenGL { hglrc, .. } if *hglrc == 0 => {
                Err("OpenGL binding without a rendering context".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for GraphicsBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicsBinding::D3D11 { device } => f
                .debug_struct("D3D11")
                .field("device", &device.is_some())
                .finish(),
            GraphicsBinding::D3D12 { device, queue } => f
                .debug_struct("D3D12")
                .field("device", &device.is_some())
                .field("queue", &format_args!("{:#x}", queue))
                .finish(),
            GraphicsBinding::Vulkan { device, queue_family_index, queue_index } => f
                .debug_struct("Vulkan")
                .field("device", &device.is_some())
                .field("queue_family_index", queue_family_index)
                .field("queue_index", queue_index)
                .finish(),
            GraphicsBinding::OpenGL { device, hdc, hglrc } => f
                .debug_struct("OpenGL")
                .field("device", &device.is_some())
                .field("hdc", &format_args!("{:#x}", hdc))
                .field("hglrc", &format_args!("{:#x}", hglrc))
                .finish(),
        }
    }
}
