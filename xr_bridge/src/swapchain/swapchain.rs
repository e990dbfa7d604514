/// Swapchain descriptor, image ring state machine and the swapchain record

use std::collections::VecDeque;
use std::sync::Arc;

use bitflags::bitflags;

use crate::compositor::CompositorSwapchainId;
use crate::error::{Error, Result};
use crate::graphics_device::{Image, ImageUsage, PixelFormat};
use crate::swapchain::Slice;

// ============================================================================
// Descriptor
// ============================================================================

bitflags! {
    /// Application-declared image usage
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SwapchainUsage: u32 {
        const COLOR_ATTACHMENT = 1 << 0;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 1;
        const UNORDERED_ACCESS = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
        const SAMPLED = 1 << 5;
        const MUTABLE_FORMAT = 1 << 6;
        const INPUT_ATTACHMENT = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SwapchainCreateFlags: u32 {
        const PROTECTED_CONTENT = 1 << 0;
        /// Single image, acquired once
        const STATIC_IMAGE = 1 << 1;
    }
}

impl SwapchainUsage {
    /// Device usage bits backing images need
    pub fn image_usage(self) -> ImageUsage {
        let mut usage = ImageUsage::SAMPLED | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST;
        if self.contains(SwapchainUsage::COLOR_ATTACHMENT) {
            usage |= ImageUsage::COLOR_ATTACHMENT;
        }
        if self.contains(SwapchainUsage::DEPTH_STENCIL_ATTACHMENT) {
            usage |= ImageUsage::DEPTH_STENCIL_ATTACHMENT;
        }
        if self.contains(SwapchainUsage::UNORDERED_ACCESS) {
            usage |= ImageUsage::UNORDERED_ACCESS;
        }
        usage
    }
}

/// Swapchain creation parameters as passed by the application
#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainDesc {
    pub create_flags: SwapchainCreateFlags,
    pub usage: SwapchainUsage,
    /// Native format code of the session's graphics API
    pub format: i64,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
    /// 1, or 6 for a cubemap
    pub face_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
}

impl SwapchainDesc {
    pub fn is_static(&self) -> bool {
        self.create_flags.contains(SwapchainCreateFlags::STATIC_IMAGE)
    }

    pub fn is_cubemap(&self) -> bool {
        self.face_count == 6
    }
}

// ============================================================================
// Image ring
// ============================================================================

/// Acquire -> wait -> release protocol over `length` ring positions
///
/// Indices are handed out strictly round-robin. At most `length` indices may
/// be acquired at once and only the oldest acquired index may be waited and
/// released.
#[derive(Debug, Clone)]
pub struct ImageRing {
    length: u32,
    next_index: u32,
    acquired: VecDeque<u32>,
    last_waited: Option<u32>,
    last_released: Option<u32>,
    /// Released since the last commit
    dirty: bool,
    frozen: bool,
    is_static: bool,
    allow_static_reuse: bool,
    /// Bumped on every release
    generation: u64,
}

impl ImageRing {
    pub fn new(length: u32, is_static: bool, allow_static_reuse: bool) -> Self {
        Self {
            length: length.max(1),
            next_index: 0,
            acquired: VecDeque::with_capacity(length as usize),
            last_waited: None,
            last_released: None,
            dirty: false,
            frozen: false,
            is_static,
            allow_static_reuse,
            generation: 0,
        }
    }

    pub fn acquire(&mut self) -> Result<u32> {
        if self.frozen && !self.allow_static_reuse {
            return Err(Error::CallOrderInvalid);
        }
        if self.acquired.len() as u32 >= self.length {
            return Err(Error::CallOrderInvalid);
        }
        let index = self.next_index;
        self.acquired.push_back(index);
        self.next_index = (self.next_index + 1) % self.length;
        if self.is_static {
            self.frozen = true;
        }
        Ok(index)
    }

    /// Mark the oldest acquired image as waited
    pub fn wait(&mut self) -> Result<u32> {
        let front = *self.acquired.front().ok_or(Error::CallOrderInvalid)?;
        if self.last_waited == Some(front) {
            return Err(Error::CallOrderInvalid);
        }
        self.last_waited = Some(front);
        Ok(front)
    }

    /// Release the waited image; returns its index
    pub fn release(&mut self) -> Result<u32> {
        let front = *self.acquired.front().ok_or(Error::CallOrderInvalid)?;
        if self.last_waited != Some(front) {
            return Err(Error::CallOrderInvalid);
        }
        self.acquired.pop_front();
        self.last_waited = None;
        self.last_released = Some(front);
        self.dirty = true;
        self.generation += 1;
        Ok(front)
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.len()
    }

    pub fn last_waited(&self) -> Option<u32> {
        self.last_waited
    }

    pub fn last_released(&self) -> Option<u32> {
        self.last_released
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

// ============================================================================
// Swapchain record
// ============================================================================

/// Where backing images come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionPath {
    /// Images belong to this compositor swapchain
    Fast(CompositorSwapchainId),
    /// Images were allocated by the runtime on the submission device
    Slow,
}

/// Work needed to turn one slice into a compositor image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOp {
    /// Compositor reads the application image as is
    Direct,
    CopySlice,
    ResolveColor,
    /// Graphics pass; also drops stencil when the submission format differs
    ResolveDepth,
}

/// Compositor swapchains holding the precomposed left and right eye
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecompositionTargets {
    pub eyes: [CompositorSwapchainId; 2],
    pub width: [u32; 2],
    pub height: [u32; 2],
}

pub struct Swapchain {
    pub desc: SwapchainDesc,
    pub format: PixelFormat,
    /// Format handed to the compositor (stencil dropped for D32_S8)
    pub submission_format: PixelFormat,
    pub ring: ImageRing,
    pub path: ProvisionPath,
    /// Backing images on the submission device, one per ring position
    pub images: Vec<Arc<dyn Image>>,
    /// One record per array slice
    pub slices: Vec<Slice>,
    /// One pair per projection layer this swapchain is the left eye of
    pub precomposition: Vec<PrecompositionTargets>,
}

impl Swapchain {
    pub fn new(
        desc: SwapchainDesc,
        format: PixelFormat,
        ring: ImageRing,
        path: ProvisionPath,
        images: Vec<Arc<dyn Image>>,
    ) -> Self {
        let slices = (0..desc.array_size).map(Slice::new).collect();
        Self {
            submission_format: format.submission_format(),
            desc,
            format,
            ring,
            path,
            images,
            slices,
            precomposition: Vec::new(),
        }
    }

    pub fn length(&self) -> u32 {
        self.ring.length()
    }

    /// Compositor swapchain the application renders into directly, if any
    pub fn direct_compositor_swapchain(&self) -> Option<CompositorSwapchainId> {
        match self.path {
            ProvisionPath::Fast(id) => Some(id),
            ProvisionPath::Slow => None,
        }
    }

    /// Pick the resolve operation for one slice
    pub fn resolve_op(&self, slice: u32) -> ResolveOp {
        let multisampled = self.desc.sample_count > 1;
        if self.format.is_depth() && (multisampled || self.format != self.submission_format) {
            ResolveOp::ResolveDepth
        } else if multisampled {
            ResolveOp::ResolveColor
        } else if slice == 0 && self.direct_compositor_swapchain().is_some() {
            ResolveOp::Direct
        } else {
            ResolveOp::CopySlice
        }
    }

    /// Every compositor swapchain this swapchain owns
    pub fn compositor_swapchains(&self) -> Vec<CompositorSwapchainId> {
        let mut ids: Vec<CompositorSwapchainId> = self.direct_compositor_swapchain().into_iter().collect();
        ids.extend(self.slices.iter().filter_map(|s| s.compositor));
        ids.extend(self.precomposition.iter().flat_map(|targets| targets.eyes));
        ids
    }
}

#[cfg(test)]
#[path = "swapchain_tests.rs"]
mod tests;
