/// Slice resolution: one single-sample, single-slice compositor image per
/// (swapchain, array slice)
///
/// All work is recorded on the submission device, after the application's
/// rendering has been ordered before it by the synchronizer.

use std::sync::Arc;

use crate::compositor::{CompositorSdk, CompositorSwapchainDesc, CompositorSwapchainId};
use crate::error::{Error, Result};
use crate::graphics_device::{GraphicsDevice, Image};
use crate::services::{TraceEvent, TraceSink, TraceValue};
use crate::swapchain::{ResolveOp, Swapchain};

/// Per array-slice resolve bookkeeping
#[derive(Debug, Clone)]
pub struct Slice {
    pub index: u32,
    /// Dedicated compositor swapchain, created on first resolve
    pub compositor: Option<CompositorSwapchainId>,
    /// Source generation last written into each destination ring position
    pub resolved: Vec<Option<u64>>,
    /// Source generation last committed to the compositor
    pub committed_generation: Option<u64>,
}

impl Slice {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            compositor: None,
            resolved: Vec::new(),
            committed_generation: None,
        }
    }
}

/// What `prepare` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// GPU work was recorded
    Resolved(ResolveOp),
    /// Destination already holds this generation
    UpToDate,
    /// This generation was already committed; nothing to publish
    AlreadyCommitted,
}

/// A slice ready to be referenced by a layer
#[derive(Clone)]
pub struct PreparedSlice {
    pub compositor: CompositorSwapchainId,
    /// Compositor image holding the content, for passes that read it back
    pub image: Arc<dyn Image>,
    pub outcome: ResolveOutcome,
}

impl PreparedSlice {
    pub fn needs_commit(&self) -> bool {
        self.outcome != ResolveOutcome::AlreadyCommitted
    }
}

pub struct SliceResolver {
    device: Arc<dyn GraphicsDevice>,
    compositor: Arc<dyn CompositorSdk>,
    trace: Arc<dyn TraceSink>,
}

impl SliceResolver {
    pub fn new(
        device: Arc<dyn GraphicsDevice>,
        compositor: Arc<dyn CompositorSdk>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self { device, compositor, trace }
    }

    /// Make slice `slice` of the last released image available to the compositor
    pub fn prepare(&self, swapchain: &mut Swapchain, slice: u32) -> Result<PreparedSlice> {
        let released = swapchain
            .ring
            .last_released()
            .ok_or_else(|| Error::LayerInvalid("swapchain image was never released".to_string()))?;
        if slice >= swapchain.desc.array_size {
            return Err(Error::ValidationFailure(format!(
                "slice {} out of range ({} slices)",
                slice, swapchain.desc.array_size
            )));
        }
        let generation = swapchain.ring.generation();
        let op = swapchain.resolve_op(slice);

        let target = match (op, swapchain.direct_compositor_swapchain()) {
            (ResolveOp::Direct, Some(id)) => id,
            _ => self.slice_swapchain(swapchain, slice)?,
        };
        let destination = self.compositor.current_index(target)?;
        let image = self.compositor.swapchain_image(target, destination)?;

        let record = &swapchain.slices[slice as usize];
        if record.committed_generation == Some(generation) {
            return Ok(PreparedSlice { compositor: target, image, outcome: ResolveOutcome::AlreadyCommitted });
        }
        if record.resolved.get(destination as usize).copied().flatten() == Some(generation) {
            return Ok(PreparedSlice { compositor: target, image, outcome: ResolveOutcome::UpToDate });
        }

        let source = swapchain
            .images
            .get(released as usize)
            .cloned()
            .ok_or(Error::HandleInvalid)?;
        let issued = match op {
            // The application may have released an index the compositor is not pointing at
            ResolveOp::Direct if destination == released => None,
            ResolveOp::Direct | ResolveOp::CopySlice => {
                self.device.copy_slice(source.as_ref(), slice, image.as_ref())?;
                Some(ResolveOp::CopySlice)
            }
            ResolveOp::ResolveColor => {
                self.device.resolve_color(source.as_ref(), slice, image.as_ref())?;
                Some(op)
            }
            ResolveOp::ResolveDepth => {
                self.device.resolve_depth(source.as_ref(), slice, image.as_ref())?;
                Some(op)
            }
        };

        let record = &mut swapchain.slices[slice as usize];
        if record.resolved.len() <= destination as usize {
            record.resolved.resize(destination as usize + 1, None);
        }
        record.resolved[destination as usize] = Some(generation);

        let outcome = match issued {
            Some(op) => {
                self.trace.emit(
                    TraceEvent::new("Resolve")
                        .with("slice", TraceValue::U64(slice as u64))
                        .with("op", TraceValue::Str(format!("{:?}", op)))
                        .with("generation", TraceValue::U64(generation)),
                );
                ResolveOutcome::Resolved(op)
            }
            None => ResolveOutcome::UpToDate,
        };
        Ok(PreparedSlice { compositor: target, image, outcome })
    }

    /// Publish a prepared slice, at most once per source generation
    pub fn commit(&self, swapchain: &mut Swapchain, slice: u32, prepared: &PreparedSlice) -> Result<()> {
        if !prepared.needs_commit() {
            return Ok(());
        }
        self.compositor.commit(prepared.compositor)?;
        let generation = swapchain.ring.generation();
        swapchain.slices[slice as usize].committed_generation = Some(generation);
        swapchain.ring.clear_dirty();
        self.trace.emit(
            TraceEvent::new("Commit")
                .with("swapchain", TraceValue::U64(prepared.compositor.0))
                .with("generation", TraceValue::U64(generation)),
        );
        Ok(())
    }

    fn slice_swapchain(&self, swapchain: &mut Swapchain, slice: u32) -> Result<CompositorSwapchainId> {
        if let Some(id) = swapchain.slices[slice as usize].compositor {
            return Ok(id);
        }
        let desc = CompositorSwapchainDesc {
            width: swapchain.desc.width,
            height: swapchain.desc.height,
            array_size: 1,
            face_count: 1,
            mip_count: 1,
            sample_count: 1,
            format: swapchain.submission_format,
            is_static: swapchain.desc.is_static(),
            label: format!("Slice {}", slice),
        };
        let id = self.compositor.create_swapchain(self.device.as_ref(), &desc)?;
        let length = self.compositor.swapchain_length(id)?;
        let record = &mut swapchain.slices[slice as usize];
        record.compositor = Some(id);
        record.resolved = vec![None; length as usize];
        crate::bridge_debug!("xr_bridge::SliceResolver", "Created {} for slice {}", id, slice);
        Ok(id)
    }
}

#[cfg(test)]
#[path = "slice_resolver_tests.rs"]
mod tests;
