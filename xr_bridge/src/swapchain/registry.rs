/// Swapchain registry - live swapchains, handle validation and the
/// acquire/wait/release protocol

use std::time::Duration;

use slotmap::{new_key_type, SlotMap};

use crate::error::{Error, Result};
use crate::graphics_device::{GraphicsApi, PixelFormat};
use crate::swapchain::{Swapchain, SwapchainDesc, SwapchainUsage};

new_key_type! {
    /// Application-visible swapchain handle
    pub struct SwapchainHandle;
}

/// Validate a creation descriptor and resolve its native format code
///
/// Nothing is mutated on failure.
pub fn validate_desc(
    desc: &SwapchainDesc,
    api: GraphicsApi,
    stencil_shareable: bool,
    cubemaps_supported: bool,
) -> Result<PixelFormat> {
    if desc.face_count != 1 && desc.face_count != 6 {
        crate::bridge_debug!("xr_bridge::Registry", "Face count {} is not 1 or 6", desc.face_count);
        return Err(Error::SwapchainFormatUnsupported);
    }
    if desc.width == 0 || desc.height == 0 || desc.array_size == 0 || desc.mip_count == 0 || desc.sample_count == 0 {
        return Err(Error::ValidationFailure("zero-sized swapchain dimension".to_string()));
    }
    if desc.is_cubemap() {
        if !cubemaps_supported {
            return Err(Error::FeatureUnsupported("cubemap swapchains".to_string()));
        }
        // Cubes are a single square array of six faces
        if desc.array_size != 1 || desc.width != desc.height {
            crate::bridge_debug!(
                "xr_bridge::Registry",
                "Cubemap {}x{} with array size {} cannot be created",
                desc.width,
                desc.height,
                desc.array_size
            );
            return Err(Error::SwapchainFormatUnsupported);
        }
    }
    if desc
        .usage
        .contains(SwapchainUsage::COLOR_ATTACHMENT | SwapchainUsage::DEPTH_STENCIL_ATTACHMENT)
    {
        return Err(Error::ValidationFailure("swapchain cannot be both color and depth".to_string()));
    }

    let format = PixelFormat::from_api(api, desc.format).ok_or(Error::SwapchainFormatUnsupported)?;
    if format.has_stencil() && !stencil_shareable {
        return Err(Error::SwapchainFormatUnsupported);
    }
    if format.is_depth() && desc.usage.contains(SwapchainUsage::COLOR_ATTACHMENT) {
        return Err(Error::ValidationFailure("depth format with color usage".to_string()));
    }
    Ok(format)
}

#[derive(Default)]
pub struct SwapchainRegistry {
    swapchains: SlotMap<SwapchainHandle, Swapchain>,
}

impl SwapchainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, swapchain: Swapchain) -> SwapchainHandle {
        self.swapchains.insert(swapchain)
    }

    pub fn remove(&mut self, handle: SwapchainHandle) -> Result<Swapchain> {
        self.swapchains.remove(handle).ok_or(Error::HandleInvalid)
    }

    pub fn get(&self, handle: SwapchainHandle) -> Result<&Swapchain> {
        self.swapchains.get(handle).ok_or(Error::HandleInvalid)
    }

    pub fn get_mut(&mut self, handle: SwapchainHandle) -> Result<&mut Swapchain> {
        self.swapchains.get_mut(handle).ok_or(Error::HandleInvalid)
    }

    pub fn contains(&self, handle: SwapchainHandle) -> bool {
        self.swapchains.contains_key(handle)
    }

    pub fn handles(&self) -> Vec<SwapchainHandle> {
        self.swapchains.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.swapchains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swapchains.is_empty()
    }

    pub fn acquire(&mut self, handle: SwapchainHandle) -> Result<u32> {
        let index = self.get_mut(handle)?.ring.acquire()?;
        crate::bridge_trace!("xr_bridge::Registry", "Acquired image {} of {:?}", index, handle);
        Ok(index)
    }

    /// Mark the oldest acquired image as ready for rendering
    ///
    /// Never blocks: pacing guarantees the image is already available.
    pub fn wait(&mut self, handle: SwapchainHandle, timeout: Duration) -> Result<()> {
        let index = self.get_mut(handle)?.ring.wait()?;
        crate::bridge_trace!(
            "xr_bridge::Registry",
            "Waited image {} of {:?} (timeout {:?})",
            index,
            handle,
            timeout
        );
        Ok(())
    }

    pub fn release(&mut self, handle: SwapchainHandle) -> Result<u32> {
        let index = self.get_mut(handle)?.ring.release()?;
        crate::bridge_trace!("xr_bridge::Registry", "Released image {} of {:?}", index, handle);
        Ok(index)
    }

    /// Remove every swapchain, for teardown
    pub fn drain(&mut self) -> Vec<(SwapchainHandle, Swapchain)> {
        self.swapchains.drain().collect()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
