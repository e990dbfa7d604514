/// Mock compositor for unit tests (no headset required)
///
/// Swapchain images are created on whatever device the runtime passes in, so
/// tests can use the mock graphics device end to end.

#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use rustc_hash::FxHashMap;

#[cfg(test)]
use crate::compositor::{CompositorLayer, CompositorSdk, CompositorSwapchainDesc, CompositorSwapchainId};
#[cfg(test)]
use crate::error::{Error, Result};
#[cfg(test)]
use crate::graphics_device::{GraphicsDevice, Image, ImageDesc, ImageUsage};

#[cfg(test)]
pub const MOCK_RING_LENGTH: u32 = 3;

#[cfg(test)]
pub struct MockSwapchain {
    pub desc: CompositorSwapchainDesc,
    pub images: Vec<Arc<dyn Image>>,
    pub current: u32,
    pub commits: u32,
}

#[cfg(test)]
pub struct MockCompositor {
    pub swapchains: Mutex<FxHashMap<u64, MockSwapchain>>,
    /// Every call in order, e.g. "commit(ovr#3)", "submit_frame(2)"
    pub calls: Mutex<Vec<String>>,
    /// Layers of every submitted frame, in order
    pub submitted: Mutex<Vec<(u64, Vec<CompositorLayer>)>>,
    pub frame_duration: Duration,
    /// How long `submit_frame` takes
    pub submit_delay: Mutex<Duration>,
    /// Layer swapchains that were already destroyed when their frame was submitted
    pub dangling_at_submit: Mutex<Vec<u64>>,
    /// `destroy_swapchain` fails for this id and leaves it alive
    pub fail_destroy: Mutex<Option<CompositorSwapchainId>>,
    next_id: AtomicU64,
}

#[cfg(test)]
impl MockCompositor {
    pub fn new() -> Self {
        Self {
            swapchains: Mutex::new(FxHashMap::default()),
            calls: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            frame_duration: Duration::from_micros(11_111),
            submit_delay: Mutex::new(Duration::ZERO),
            dangling_at_submit: Mutex::new(Vec::new()),
            fail_destroy: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.split('(').next() == Some(name))
            .count()
    }

    pub fn commits(&self, id: CompositorSwapchainId) -> u32 {
        self.swapchains.lock().unwrap().get(&id.0).map(|s| s.commits).unwrap_or(0)
    }

    pub fn live_swapchains(&self) -> usize {
        self.swapchains.lock().unwrap().len()
    }

    pub fn last_submission(&self) -> Option<(u64, Vec<CompositorLayer>)> {
        self.submitted.lock().unwrap().last().cloned()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[cfg(test)]
fn layer_swapchains(layer: &CompositorLayer) -> Vec<CompositorSwapchainId> {
    match layer {
        CompositorLayer::Disabled => Vec::new(),
        CompositorLayer::EyeFov { color, depth, .. } => color
            .iter()
            .map(|v| v.swapchain)
            .chain(depth.iter().flatten().map(|d| d.viewport.swapchain))
            .collect(),
        CompositorLayer::Quad { color, .. } => vec![color.swapchain],
    }
}

#[cfg(test)]
impl CompositorSdk for MockCompositor {
    fn create_swapchain(
        &self,
        device: &dyn GraphicsDevice,
        desc: &CompositorSwapchainDesc,
    ) -> Result<CompositorSwapchainId> {
        let id = CompositorSwapchainId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.record(format!("create_swapchain({})", id));
        let length = if desc.is_static { 1 } else { MOCK_RING_LENGTH };
        let usage = if desc.format.is_depth() {
            ImageUsage::DEPTH_STENCIL_ATTACHMENT
        } else {
            ImageUsage::COLOR_ATTACHMENT
        };
        let images = (0..length)
            .map(|i| {
                device.create_image(&ImageDesc {
                    width: desc.width,
                    height: desc.height,
                    array_size: desc.array_size,
                    face_count: desc.face_count,
                    mip_count: desc.mip_count,
                    sample_count: desc.sample_count,
                    format: desc.format,
                    typeless: true,
                    usage: usage | ImageUsage::SHARED | ImageUsage::TRANSFER_DST,
                    label: format!("{} #{}", desc.label, i),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.swapchains.lock().unwrap().insert(
            id.0,
            MockSwapchain { desc: desc.clone(), images, current: 0, commits: 0 },
        );
        Ok(id)
    }

    fn destroy_swapchain(&self, id: CompositorSwapchainId) -> Result<()> {
        self.record(format!("destroy_swapchain({})", id));
        if *self.fail_destroy.lock().unwrap() == Some(id) {
            return Err(Error::RuntimeFailure(format!("cannot destroy {}", id)));
        }
        self.swapchains
            .lock()
            .unwrap()
            .remove(&id.0)
            .map(|_| ())
            .ok_or(Error::HandleInvalid)
    }

    fn swapchain_length(&self, id: CompositorSwapchainId) -> Result<u32> {
        let swapchains = self.swapchains.lock().unwrap();
        let swapchain = swapchains.get(&id.0).ok_or(Error::HandleInvalid)?;
        Ok(swapchain.images.len() as u32)
    }

    fn swapchain_image(&self, id: CompositorSwapchainId, index: u32) -> Result<Arc<dyn Image>> {
        let swapchains = self.swapchains.lock().unwrap();
        let swapchain = swapchains.get(&id.0).ok_or(Error::HandleInvalid)?;
        swapchain
            .images
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Error::ValidationFailure(format!("image {} out of range", index)))
    }

    fn current_index(&self, id: CompositorSwapchainId) -> Result<u32> {
        let swapchains = self.swapchains.lock().unwrap();
        Ok(swapchains.get(&id.0).ok_or(Error::HandleInvalid)?.current)
    }

    fn commit(&self, id: CompositorSwapchainId) -> Result<()> {
        self.record(format!("commit({})", id));
        let mut swapchains = self.swapchains.lock().unwrap();
        let swapchain = swapchains.get_mut(&id.0).ok_or(Error::HandleInvalid)?;
        swapchain.current = (swapchain.current + 1) % swapchain.images.len() as u32;
        swapchain.commits += 1;
        Ok(())
    }

    fn wait_to_begin_frame(&self, frame_id: u64) -> Result<()> {
        self.record(format!("wait_to_begin_frame({})", frame_id));
        Ok(())
    }

    fn begin_frame(&self, frame_id: u64) -> Result<()> {
        self.record(format!("begin_frame({})", frame_id));
        Ok(())
    }

    fn submit_frame(&self, frame_id: u64, layers: &[CompositorLayer]) -> Result<()> {
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        {
            let swapchains = self.swapchains.lock().unwrap();
            let dangling = layers
                .iter()
                .flat_map(layer_swapchains)
                .filter(|id| !swapchains.contains_key(&id.0))
                .map(|id| id.0);
            self.dangling_at_submit.lock().unwrap().extend(dangling);
        }
        self.record(format!("submit_frame({})", frame_id));
        self.submitted.lock().unwrap().push((frame_id, layers.to_vec()));
        Ok(())
    }

    fn predicted_display_time(&self, frame_id: u64) -> f64 {
        // Each value repeats for two frames
        1.0 + (frame_id / 2) as f64 * self.frame_duration.as_secs_f64()
    }

    fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    fn elapsed_time(&self) -> f64 {
        0.5
    }
}
