//! Error types for the xr_bridge runtime
//!
//! This module defines the error taxonomy shared by every component:
//! validation and ordering errors (caller mistakes, no state mutated),
//! device and synchronization failures (fatal to the session's graphics
//! resources), and backend errors raised by graphics or compositor backends.

use std::fmt;

/// Result type for xr_bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// xr_bridge runtime errors
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed descriptor or argument
    ValidationFailure(String),

    /// Unknown or already destroyed handle
    HandleInvalid,

    /// Operation issued out of sequence (acquire/wait/release, frame calls)
    CallOrderInvalid,

    /// Adapter mismatch, null device, lost device or failed shared-handle import
    GraphicsDeviceInvalid(String),

    /// Swapchain or device binding requested before graphics requirements were queried
    GraphicsRequirementsCallMissing,

    /// Unrecoverable runtime failure (fence creation, wait registration, compositor loss)
    RuntimeFailure(String),

    /// Pixel format not supported by the graphics binding
    SwapchainFormatUnsupported,

    /// Requested feature not available on this runtime or hardware
    FeatureUnsupported(String),

    /// Session has not been begun
    SessionNotRunning,

    /// Session was already begun
    SessionRunning,

    /// Session is not in the Ready state
    SessionNotReady,

    /// Session is not in the Stopping state
    SessionNotStopping,

    /// Composition layer is malformed or references unusable content
    LayerInvalid(String),

    /// Too many composition layers submitted in one frame
    LayerLimitExceeded,

    /// Sub-image rectangle falls outside the swapchain image
    SwapchainRectInvalid,

    /// Layer pose orientation is not a unit quaternion
    PoseInvalid,

    /// A resource limit was reached (ring full, session already exists)
    LimitReached(String),

    /// Backend-specific error (Vulkan, compositor SDK, etc.)
    BackendError(String),

    /// Out of GPU memory
    OutOfMemory,
}

impl Error {
    /// Device and synchronization failures are fatal to the current session's
    /// graphics resources and must not be retried internally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::GraphicsDeviceInvalid(_) | Error::RuntimeFailure(_) | Error::OutOfMemory
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ValidationFailure(msg) => write!(f, "Validation failure: {}", msg),
            Error::HandleInvalid => write!(f, "Invalid handle"),
            Error::CallOrderInvalid => write!(f, "Call order invalid"),
            Error::GraphicsDeviceInvalid(msg) => write!(f, "Graphics device invalid: {}", msg),
            Error::GraphicsRequirementsCallMissing => {
                write!(f, "Graphics requirements were not queried before use")
            }
            Error::RuntimeFailure(msg) => write!(f, "Runtime failure: {}", msg),
            Error::SwapchainFormatUnsupported => write!(f, "Swapchain format unsupported"),
            Error::FeatureUnsupported(msg) => write!(f, "Feature unsupported: {}", msg),
            Error::SessionNotRunning => write!(f, "Session not running"),
            Error::SessionRunning => write!(f, "Session already running"),
            Error::SessionNotReady => write!(f, "Session not ready"),
            Error::SessionNotStopping => write!(f, "Session not stopping"),
            Error::LayerInvalid(msg) => write!(f, "Layer invalid: {}", msg),
            Error::LayerLimitExceeded => write!(f, "Layer limit exceeded"),
            Error::SwapchainRectInvalid => write!(f, "Swapchain rect invalid"),
            Error::PoseInvalid => write!(f, "Pose invalid"),
            Error::LimitReached(msg) => write!(f, "Limit reached: {}", msg),
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::OutOfMemory => write!(f, "Out of GPU memory"),
        }
    }
}

impl std::error::Error for Error {}

// ===== ERROR MACROS =====

/// Log an ERROR (with file:line) and build an `Error::BackendError` from the same message
///
/// # Example
///
/// ```no_run
/// # use xr_bridge::bridge_err;
/// let err = bridge_err!("xr_bridge::vulkan", "Failed to create image: {}", "oom");
/// ```
#[macro_export]
macro_rules! bridge_err {
    ($source:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::bridge::Runtime::log_detailed(
            $crate::bridge::log::LogSeverity::Error,
            $source,
            message.clone(),
            file!(),
            line!()
        );
        $crate::bridge::Error::BackendError(message)
    }};
}

/// Log a WARN and build an `Error::BackendError` from the same message
#[macro_export]
macro_rules! bridge_warn_err {
    ($source:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::bridge::Runtime::log(
            $crate::bridge::log::LogSeverity::Warn,
            $source,
            message.clone()
        );
        $crate::bridge::Error::BackendError(message)
    }};
}

/// Log an ERROR (with file:line) and return `Err(Error::BackendError)` from the enclosing function
#[macro_export]
macro_rules! bridge_bail {
    ($source:expr, $($arg:tt)*) => {
        return Err($crate::bridge_err!($source, $($arg)*))
    };
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
