/// GraphicsDevice trait - one GPU context (application-visible or compositor-visible)
///
/// Backends wrap a native device and its submission queue. All GPU work is
/// enqueued, never executed synchronously, except for `wait_cpu`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;
use crate::graphics_device::{GraphicsApi, PixelFormat};

// ============================================================================
// Identity and capabilities
// ============================================================================

/// Locally unique adapter identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AdapterLuid(pub u64);

impl fmt::Display for AdapterLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

/// OS handle flavor used to share images and fences across devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Global (KMT-style) handle
    Legacy,
    /// Name-based handle with explicit lifetime
    Named,
}

/// A shareable OS handle exported by one device and importable by another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedHandle {
    pub kind: HandleKind,
    pub raw: u64,
}

/// Primitives a device supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Can create and import shareable timeline fences
    pub shared_fence: bool,
    /// Can save and restore its pipeline state around runtime work
    pub context_state: bool,
    /// Can export and import name-based handles
    pub named_handles: bool,
    /// Stencil planes survive a cross-device share
    pub stencil_sharing: bool,
    /// `precompose` applies its sharpen factor
    pub sharpening: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            shared_fence: true,
            context_state: false,
            named_handles: true,
            stencil_sharing: true,
            sharpening: true,
        }
    }
}

// ============================================================================
// Images
// ============================================================================

bitflags! {
    /// How an image will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const COLOR_ATTACHMENT = 1 << 0;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 1;
        const SAMPLED = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
        /// Exportable through a shared handle
        const SHARED = 1 << 6;
    }
}

/// Descriptor for creating or importing an image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    /// Array layers per face
    pub array_size: u32,
    /// 1, or 6 for cubemaps
    pub face_count: u32,
    pub mip_count: u32,
    pub sample_count: u32,
    pub format: PixelFormat,
    /// Allocate storage for the whole typeless family of `format`
    pub typeless: bool,
    pub usage: ImageUsage,
    /// Debug name
    pub label: String,
}

impl ImageDesc {
    /// Total layers including cube faces
    pub fn layer_count(&self) -> u32 {
        self.array_size * self.face_count
    }
}

/// Read-only properties of a created image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_levels: u32,
    pub samples: u32,
    pub format: PixelFormat,
}

impl From<&ImageDesc> for ImageInfo {
    fn from(desc: &ImageDesc) -> Self {
        Self {
            width: desc.width,
            height: desc.height,
            layers: desc.layer_count(),
            mip_levels: desc.mip_count,
            samples: desc.sample_count,
            format: desc.format,
        }
    }
}

/// GPU image owned by one device
///
/// Dropping the last reference releases the native object.
pub trait Image: Send + Sync {
    fn info(&self) -> &ImageInfo;

    /// Backend downcast
    fn as_any(&self) -> &dyn Any;
}

// ============================================================================
// Fences and timers
// ============================================================================

/// GPU-visible monotonic 64-bit counter
pub trait Fence: Send + Sync {
    /// Highest value the GPU has reached
    fn completed_value(&self) -> Result<u64>;

    /// Backend downcast
    fn as_any(&self) -> &dyn Any;
}

/// GPU duration measurement around a span of queue work
pub trait GpuTimer: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    /// Last measured duration in microseconds, 0 when not yet available
    fn query(&self) -> Result<u64>;
}

/// Integer rectangle inside an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Non-empty and fully contained in a `width` x `height` image
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

// ============================================================================
// GraphicsDevice trait
// ============================================================================

/// One graphics context with its submission queue
///
/// Implemented by backends (e.g., `VulkanGraphicsDevice`). Copy and resolve
/// operations write into slice 0 of a single-layer destination.
pub trait GraphicsDevice: Send + Sync {
    fn api(&self) -> GraphicsApi;

    /// Adapter this device was created on
    fn adapter_luid(&self) -> AdapterLuid;

    fn capabilities(&self) -> DeviceCapabilities;

    // ----- synchronization -----

    /// Create a shareable timeline fence starting at 0
    fn create_fence(&self) -> Result<Arc<dyn Fence>>;

    fn export_fence(&self, fence: &dyn Fence, kind: HandleKind) -> Result<SharedHandle>;

    fn import_fence(&self, handle: &SharedHandle) -> Result<Arc<dyn Fence>>;

    /// Enqueue a signal of `value` after all previously enqueued work
    fn signal(&self, fence: &dyn Fence, value: u64) -> Result<()>;

    /// Enqueue a GPU-side wait: later work starts once `fence` reaches `value`
    fn wait(&self, fence: &dyn Fence, value: u64) -> Result<()>;

    /// Block the calling thread until `fence` reaches `value`
    fn wait_cpu(&self, fence: &dyn Fence, value: u64, timeout: Duration) -> Result<()>;

    // ----- images -----

    fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn Image>>;

    fn export_image(&self, image: &dyn Image, kind: HandleKind) -> Result<SharedHandle>;

    fn import_image(&self, handle: &SharedHandle, desc: &ImageDesc) -> Result<Arc<dyn Image>>;

    // ----- slice resolution -----

    /// Copy layer `src_slice` of `src` into `dst`
    fn copy_slice(&self, src: &dyn Image, src_slice: u32, dst: &dyn Image) -> Result<()>;

    /// Hardware multisample resolve of color layer `src_slice` into `dst`
    fn resolve_color(&self, src: &dyn Image, src_slice: u32, dst: &dyn Image) -> Result<()>;

    /// Depth resolve through a graphics pass (full-screen triangle sampling the depth view)
    fn resolve_depth(&self, src: &dyn Image, src_slice: u32, dst: &dyn Image) -> Result<()>;

    /// Write `src_rect` of `src` into the whole of `dst`, scaling and sharpening
    ///
    /// Devices without the `sharpening` capability are always passed 0.
    fn precompose(&self, src: &dyn Image, src_rect: Rect2D, dst: &dyn Image, sharpen: f32) -> Result<()>;

    // ----- misc -----

    fn create_timer(&self) -> Result<Arc<dyn GpuTimer>>;

    /// Submit any recorded but unsubmitted work
    fn flush(&self) -> Result<()>;
}
