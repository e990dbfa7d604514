/// Resource provisioner - backing image allocation and cross-device imports
///
/// Fast path: the compositor creates the ring and the application renders
/// straight into it. Slow path: the runtime allocates a typeless ring on the
/// submission device and resolves into dedicated compositor swapchains at end
/// of frame. Either way the images live on the submission device and are
/// imported into the application device once per ring position.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::compositor::{CompositorSdk, CompositorSwapchainDesc};
use crate::config::SlowPathPolicy;
use crate::device::DeviceContext;
use crate::error::{Error, Result};
use crate::graphics_device::{GraphicsApi, HandleKind, Image, ImageDesc, ImageUsage, PixelFormat};
use crate::swapchain::{ProvisionPath, Swapchain, SwapchainDesc, SwapchainHandle};

/// Ring depth of self-allocated swapchains
pub const SLOW_PATH_RING_LENGTH: u32 = 3;

/// One imported image: (swapchain, ring position, consuming API)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImportKey {
    pub swapchain: SwapchainHandle,
    pub index: u32,
    pub consumer: GraphicsApi,
}

/// Backing storage for a new swapchain
pub struct Provisioned {
    pub path: ProvisionPath,
    pub images: Vec<Arc<dyn Image>>,
    pub length: u32,
}

pub struct ResourceProvisioner {
    policy: SlowPathPolicy,
    imports: FxHashMap<ImportKey, Arc<dyn Image>>,
}

impl ResourceProvisioner {
    pub fn new(policy: SlowPathPolicy) -> Self {
        Self {
            policy,
            imports: FxHashMap::default(),
        }
    }

    /// Whether this swapchain must be self-allocated
    pub fn requires_slow_path(&self, desc: &SwapchainDesc, format: PixelFormat, handle_kind: HandleKind) -> bool {
        self.policy.always
            || (self.policy.cubemaps && desc.is_cubemap())
            || (self.policy.multisample && desc.sample_count > 1)
            || (self.policy.vendor_requires_named_handles && handle_kind == HandleKind::Named)
            // The compositor only ever sees submission formats
            || format != format.submission_format()
    }

    /// Allocate the ring for a validated descriptor
    pub fn provision(
        &self,
        context: &DeviceContext,
        compositor: &dyn CompositorSdk,
        desc: &SwapchainDesc,
        format: PixelFormat,
    ) -> Result<Provisioned> {
        let submission = context.submission_device.as_ref();

        if !self.requires_slow_path(desc, format, context.handle_kind) {
            let id = compositor.create_swapchain(
                submission,
                &CompositorSwapchainDesc {
                    width: desc.width,
                    height: desc.height,
                    array_size: desc.array_size,
                    face_count: desc.face_count,
                    mip_count: desc.mip_count,
                    sample_count: desc.sample_count,
                    format,
                    is_static: desc.is_static(),
                    label: "Application swapchain".to_string(),
                },
            )?;
            let length = compositor.swapchain_length(id)?;
            let images = (0..length)
                .map(|i| compositor.swapchain_image(id, i))
                .collect::<Result<Vec<_>>>();
            return match images {
                Ok(images) => Ok(Provisioned { path: ProvisionPath::Fast(id), images, length }),
                Err(e) => {
                    if let Err(destroy) = compositor.destroy_swapchain(id) {
                        crate::bridge_warn!("xr_bridge::Provisioner", "Failed to destroy {}: {}", id, destroy);
                    }
                    Err(e)
                }
            };
        }

        let length = if desc.is_static() { 1 } else { SLOW_PATH_RING_LENGTH };
        let images = (0..length)
            .map(|i| submission.create_image(&Self::image_desc(desc, format, i)))
            .collect::<Result<Vec<_>>>()?;
        crate::bridge_debug!(
            "xr_bridge::Provisioner",
            "Self-allocated {} images {}x{}x{} ({:?}, {} samples)",
            length,
            desc.width,
            desc.height,
            desc.array_size * desc.face_count,
            format,
            desc.sample_count
        );
        Ok(Provisioned { path: ProvisionPath::Slow, images, length })
    }

    fn image_desc(desc: &SwapchainDesc, format: PixelFormat, index: u32) -> ImageDesc {
        ImageDesc {
            width: desc.width,
            height: desc.height,
            array_size: desc.array_size,
            face_count: desc.face_count,
            mip_count: desc.mip_count,
            sample_count: desc.sample_count,
            format,
            typeless: true,
            usage: desc.usage.image_usage() | ImageUsage::SHARED,
            label: format!("Swapchain image {}", index),
        }
    }

    /// Application-visible images of a swapchain, importing each one at most once
    pub fn app_images(
        &mut self,
        handle: SwapchainHandle,
        swapchain: &Swapchain,
        context: &DeviceContext,
    ) -> Result<Vec<Arc<dyn Image>>> {
        if context.shares_device {
            return Ok(swapchain.images.clone());
        }

        let consumer = context.api();
        let mut images = Vec::with_capacity(swapchain.images.len());
        for (index, image) in swapchain.images.iter().enumerate() {
            let key = ImportKey { swapchain: handle, index: index as u32, consumer };
            if let Some(imported) = self.imports.get(&key) {
                images.push(imported.clone());
                continue;
            }

            let shared = context
                .submission_device
                .export_image(image.as_ref(), context.handle_kind)
                .map_err(|e| Error::GraphicsDeviceInvalid(format!("failed to export image {}: {}", index, e)))?;
            let imported = context
                .app_device
                .import_image(&shared, &Self::image_desc(&swapchain.desc, swapchain.format, index as u32))
                .map_err(|e| {
                    crate::bridge_error!("xr_bridge::Provisioner", "Failed to import image {} into {}: {}", index, consumer, e);
                    Error::GraphicsDeviceInvalid(format!("failed to import image {}: {}", index, e))
                })?;
            self.imports.insert(key, imported.clone());
            images.push(imported);
        }
        Ok(images)
    }

    /// Drop every import of a swapchain; returns how many were released
    pub fn release_imports(&mut self, handle: SwapchainHandle) -> usize {
        let before = self.imports.len();
        self.imports.retain(|key, _| key.swapchain != handle);
        before - self.imports.len()
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub fn clear(&mut self) {
        self.imports.clear();
    }
}

#[cfg(test)]
#[path = "provisioner_tests.rs"]
mod tests;
