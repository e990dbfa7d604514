/// Composition layers submitted by the application at end of frame

use glam::Vec2;

use crate::compositor::LayerFlags;
use crate::error::{Error, Result};
use crate::graphics_device::Rect2D;
use crate::services::{Fov, Pose};
use crate::swapchain::{SwapchainHandle, SwapchainRegistry};

/// Most layers accepted in one frame
pub const MAX_LAYERS: usize = 16;

/// Region of one array slice of a swapchain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubImage {
    pub swapchain: SwapchainHandle,
    pub image_rect: Rect2D,
    pub image_array_index: u32,
}

/// Depth buffer attached to a projection view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthInfo {
    pub sub_image: SubImage,
    pub min_depth: f32,
    pub max_depth: f32,
    pub near_z: f32,
    pub far_z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionView {
    pub sub_image: SubImage,
    pub pose: Pose,
    pub fov: Fov,
    pub depth: Option<DepthInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompositionLayer {
    /// Stereo projection; exactly two views
    Projection {
        views: Vec<ProjectionView>,
        flags: LayerFlags,
    },
    /// World- or head-locked quad
    Quad {
        sub_image: SubImage,
        pose: Pose,
        size: Vec2,
        head_locked: bool,
        flags: LayerFlags,
    },
}

impl CompositionLayer {
    /// Every sub-image the layer reads, color first
    pub fn sub_images(&self) -> Vec<SubImage> {
        match self {
            CompositionLayer::Projection { views, .. } => views
                .iter()
                .map(|v| v.sub_image)
                .chain(views.iter().filter_map(|v| v.depth.map(|d| d.sub_image)))
                .collect(),
            CompositionLayer::Quad { sub_image, .. } => vec![*sub_image],
        }
    }

    fn poses(&self) -> Vec<Pose> {
        match self {
            CompositionLayer::Projection { views, .. } => views.iter().map(|v| v.pose).collect(),
            CompositionLayer::Quad { pose, .. } => vec![*pose],
        }
    }
}

/// Frame submission parameters
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEndInfo {
    /// Predicted display time the frame was rendered for, nanoseconds
    pub display_time: i64,
    pub layers: Vec<CompositionLayer>,
}

/// Check every layer before any resolve work is recorded
pub fn validate_layers(layers: &[CompositionLayer], registry: &SwapchainRegistry) -> Result<()> {
    if layers.len() > MAX_LAYERS {
        return Err(Error::LayerLimitExceeded);
    }

    for layer in layers {
        if let CompositionLayer::Projection { views, .. } = layer {
            if views.len() != 2 {
                return Err(Error::ValidationFailure(format!(
                    "projection layer has {} views, expected 2",
                    views.len()
                )));
            }
        }
        if !layer.poses().iter().all(Pose::is_normalized) {
            return Err(Error::PoseInvalid);
        }

        for sub_image in layer.sub_images() {
            let swapchain = registry.get(sub_image.swapchain)?;
            if swapchain.ring.last_released().is_none() {
                return Err(Error::LayerInvalid("swapchain image was never released".to_string()));
            }
            if sub_image.image_array_index >= swapchain.desc.array_size {
                return Err(Error::ValidationFailure(format!(
                    "image array index {} out of range ({} slices)",
                    sub_image.image_array_index, swapchain.desc.array_size
                )));
            }
            if !sub_image
                .image_rect
                .fits_within(swapchain.desc.width, swapchain.desc.height)
            {
                return Err(Error::SwapchainRectInvalid);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "layer_tests.rs"]
mod tests;
