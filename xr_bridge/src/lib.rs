/*!
# xr_bridge

Core of a VR runtime that sits between an application's graphics API and a
vendor compositor SDK.

The application renders into runtime-owned swapchains on its own graphics
device. At end of frame the runtime orders that work before a compositor-side
submission device, resolves every referenced array slice into a single-sample
compositor image, commits it, and submits the layer set, either inline or on
a background worker thread.

## Architecture

- **GraphicsDevice**: backend trait for one GPU context (images, fences, copy/resolve work)
- **DeviceBinder**: validates the application device and picks the submission device
- **CrossDeviceSynchronizer**: shared-fence ordering between the two devices
- **SwapchainRegistry**: handle table and acquire/wait/release image rings
- **ResourceProvisioner**: compositor-owned (fast) or self-allocated (slow) backing images
- **SliceResolver**: per-slice copy/resolve and at-most-once commit
- **Session**: lifecycle state machine and the wait/begin/end frame protocol

Backends (Vulkan today) implement [`graphics_device::GraphicsDevice`] and
[`device::DeviceFactory`] in their own crates.
*/

// Internal modules
mod error;
mod runtime;
pub mod log;
pub mod config;
pub mod services;
pub mod graphics_device;
pub mod compositor;
pub mod device;
pub mod swapchain;
pub mod session;

// Main bridge namespace module
pub mod bridge {
    // Error types
    pub use crate::error::{Error, Result};

    // Runtime singleton
    pub use crate::runtime::Runtime;

    // Configuration
    pub use crate::config::{RuntimeConfig, Settings, SettingValue, MapSettings, SlowPathPolicy};

    // Session entry points
    pub use crate::session::{Session, SessionCreateInfo, FrameState, ViewConfiguration};

    // Logging sub-module (types only, macros are exported at the crate root)
    pub mod log {
        pub use crate::log::{Logger, LogEntry, LogSeverity, DefaultLogger, format_entry};
    }
}

// Re-export math library at crate root
pub use glam;
