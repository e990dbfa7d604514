/// Vendor compositor boundary
///
/// The compositor owns its own image rings (created on the submission device),
/// paces frames and displays submitted layers on the headset.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use glam::Vec2;

use crate::error::Result;
use crate::graphics_device::{GraphicsDevice, Image, PixelFormat, Rect2D};
use crate::services::{Fov, Pose};

/// Identifier of a compositor-owned swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompositorSwapchainId(pub u64);

impl fmt::Display for CompositorSwapchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ovr#{}", self.0)
    }
}

/// Compositor swapchain creation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CompositorSwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub face_count: u32,
    pub mip_count: u32,
    pub sample_count: u32,
    pub format: PixelFormat,
    /// Single image, written once
    pub is_static: bool,
    pub label: String,
}

bitflags! {
    /// Per-layer composition flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LayerFlags: u32 {
        const BLEND_TEXTURE_SOURCE_ALPHA = 1 << 0;
        const UNPREMULTIPLIED_ALPHA = 1 << 1;
        const HEAD_LOCKED = 1 << 2;
    }
}

/// Region of a compositor swapchain read by a layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositorViewport {
    pub swapchain: CompositorSwapchainId,
    pub rect: Rect2D,
}

/// Depth range and projection planes for an eye's depth buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositorDepth {
    pub viewport: CompositorViewport,
    pub near_z: f32,
    pub far_z: f32,
}

/// One layer as submitted to the compositor
#[derive(Debug, Clone, PartialEq)]
pub enum CompositorLayer {
    /// Placeholder keeping frame timing alive when nothing is visible
    Disabled,
    EyeFov {
        color: [CompositorViewport; 2],
        depth: Option<[CompositorDepth; 2]>,
        fov: [Fov; 2],
        poses: [Pose; 2],
        flags: LayerFlags,
    },
    Quad {
        color: CompositorViewport,
        pose: Pose,
        size: Vec2,
        flags: LayerFlags,
    },
}

/// Vendor compositor SDK
///
/// Implementations must be callable from the submission worker thread.
pub trait CompositorSdk: Send + Sync {
    fn create_swapchain(
        &self,
        device: &dyn GraphicsDevice,
        desc: &CompositorSwapchainDesc,
    ) -> Result<CompositorSwapchainId>;

    fn destroy_swapchain(&self, id: CompositorSwapchainId) -> Result<()>;

    fn swapchain_length(&self, id: CompositorSwapchainId) -> Result<u32>;

    fn swapchain_image(&self, id: CompositorSwapchainId, index: u32) -> Result<Arc<dyn Image>>;

    /// Ring position the next commit will publish
    fn current_index(&self, id: CompositorSwapchainId) -> Result<u32>;

    /// Publish the current image and advance the ring
    fn commit(&self, id: CompositorSwapchainId) -> Result<()>;

    /// Block until the compositor is ready to start `frame_id`
    fn wait_to_begin_frame(&self, frame_id: u64) -> Result<()>;

    fn begin_frame(&self, frame_id: u64) -> Result<()>;

    fn submit_frame(&self, frame_id: u64, layers: &[CompositorLayer]) -> Result<()>;

    /// Predicted mid-photon time of `frame_id`, in seconds on the compositor clock
    fn predicted_display_time(&self, frame_id: u64) -> f64;

    /// Ideal duration of one display refresh
    fn frame_duration(&self) -> Duration;

    /// Seconds on the compositor clock
    fn elapsed_time(&self) -> f64;
}
