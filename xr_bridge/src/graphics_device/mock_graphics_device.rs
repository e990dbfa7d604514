/// Mock graphics device for unit tests (no GPU required)
///
/// GPU work "executes" immediately: signals complete on enqueue, copies and
/// resolves only validate their arguments and bump a counter. Shared handles
/// go through a process-wide table so one mock device can import what another
/// exported.

#[cfg(test)]
use std::any::Any;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
#[cfg(test)]
use std::sync::{Arc, Mutex, OnceLock};
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use rustc_hash::FxHashMap;

#[cfg(test)]
use crate::error::{Error, Result};
#[cfg(test)]
use crate::graphics_device::{
    AdapterLuid, DeviceCapabilities, Fence, GpuTimer, GraphicsApi, GraphicsDevice, HandleKind,
    Image, ImageDesc, ImageInfo, Rect2D, SharedHandle,
};

// ============================================================================
// Shared handle table
// ============================================================================

#[cfg(test)]
#[derive(Clone)]
enum SharedObject {
    Fence(Arc<Mutex<MockFenceState>>),
    Image(ImageInfo),
}

#[cfg(test)]
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[cfg(test)]
fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
fn shared_table() -> &'static Mutex<FxHashMap<u64, (HandleKind, SharedObject)>> {
    static TABLE: OnceLock<Mutex<FxHashMap<u64, (HandleKind, SharedObject)>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(FxHashMap::default()))
}

// ============================================================================
// Mock Image
// ============================================================================

#[cfg(test)]
#[derive(Debug)]
pub struct MockImage {
    pub id: u64,
    pub info: ImageInfo,
    pub label: String,
    /// Raw handle this image was imported from
    pub imported_from: Option<u64>,
}

#[cfg(test)]
impl MockImage {
    pub fn new(info: ImageInfo, label: &str) -> Self {
        Self { id: next_id(), info, label: label.to_string(), imported_from: None }
    }
}

#[cfg(test)]
impl Image for MockImage {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Mock Fence
// ============================================================================

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockFenceState {
    /// Value reached by the (instant) GPU
    pub completed: u64,
    /// Highest value any queue has been asked to signal
    pub max_signaled: u64,
}

/// Imports of the same fence share one state
#[cfg(test)]
#[derive(Debug)]
pub struct MockFence {
    pub id: u64,
    pub state: Arc<Mutex<MockFenceState>>,
}

#[cfg(test)]
impl Fence for MockFence {
    fn completed_value(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().completed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Mock Timer
// ============================================================================

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockTimer {
    running: AtomicBool,
    measured: AtomicU64,
}

#[cfg(test)]
impl GpuTimer for MockTimer {
    fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.measured.store(1500, Ordering::SeqCst);
        }
        Ok(())
    }

    fn query(&self) -> Result<u64> {
        Ok(self.measured.load(Ordering::SeqCst))
    }
}

// ============================================================================
// Mock Graphics Device
// ============================================================================

#[cfg(test)]
pub struct MockGraphicsDevice {
    pub api: GraphicsApi,
    pub luid: AdapterLuid,
    pub capabilities: DeviceCapabilities,
    /// Every call in order, e.g. "signal(3)", "resolve_depth(0)"
    pub calls: Mutex<Vec<String>>,
    /// Values passed to `wait`, in order
    pub waited_values: Mutex<Vec<u64>>,
    /// Values passed to `signal`, in order
    pub signaled_values: Mutex<Vec<u64>>,
    /// Make every import fail (simulated device loss)
    pub fail_imports: AtomicBool,
    /// Make fence creation fail
    pub fail_fences: AtomicBool,
}

#[cfg(test)]
impl MockGraphicsDevice {
    pub fn new(api: GraphicsApi, luid: AdapterLuid) -> Self {
        Self::with_capabilities(api, luid, DeviceCapabilities::default())
    }

    pub fn with_capabilities(api: GraphicsApi, luid: AdapterLuid, capabilities: DeviceCapabilities) -> Self {
        Self {
            api,
            luid,
            capabilities,
            calls: Mutex::new(Vec::new()),
            waited_values: Mutex::new(Vec::new()),
            signaled_values: Mutex::new(Vec::new()),
            fail_imports: AtomicBool::new(false),
            fail_fences: AtomicBool::new(false),
        }
    }

    /// Number of recorded calls whose name is `name`
    pub fn count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.split('(').next() == Some(name))
            .count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn mock_fence<'a>(fence: &'a dyn Fence) -> Result<&'a MockFence> {
        fence
            .as_any()
            .downcast_ref::<MockFence>()
            .ok_or_else(|| Error::BackendError("Fence is not a MockFence".to_string()))
    }

    fn mock_image<'a>(image: &'a dyn Image) -> Result<&'a MockImage> {
        image
            .as_any()
            .downcast_ref::<MockImage>()
            .ok_or_else(|| Error::BackendError("Image is not a MockImage".to_string()))
    }

    fn check_slice(src: &MockImage, src_slice: u32, dst: &MockImage) -> Result<()> {
        if src_slice >= src.info.layers {
            return Err(Error::ValidationFailure(format!(
                "slice {} out of range ({} layers)",
                src_slice, src.info.layers
            )));
        }
        if dst.info.samples != 1 {
            return Err(Error::ValidationFailure("destination must be single-sampled".to_string()));
        }
        Ok(())
    }

    fn share(&self, kind: HandleKind, object: SharedObject) -> Result<SharedHandle> {
        if kind == HandleKind::Named && !self.capabilities.named_handles {
            return Err(Error::FeatureUnsupported("named handles".to_string()));
        }
        let raw = next_id();
        shared_table().lock().unwrap().insert(raw, (kind, object));
        Ok(SharedHandle { kind, raw })
    }

    fn open(&self, handle: &SharedHandle) -> Result<SharedObject> {
        if self.fail_imports.load(Ordering::SeqCst) {
            return Err(Error::GraphicsDeviceInvalid("device removed".to_string()));
        }
        let table = shared_table().lock().unwrap();
        match table.get(&handle.raw) {
            Some((kind, object)) if *kind == handle.kind => Ok(object.clone()),
            Some(_) => Err(Error::GraphicsDeviceInvalid("handle kind mismatch".to_string())),
            None => Err(Error::GraphicsDeviceInvalid(format!("unknown handle {:#x}", handle.raw))),
        }
    }
}

#[cfg(test)]
impl GraphicsDevice for MockGraphicsDevice {
    fn api(&self) -> GraphicsApi {
        self.api
    }

    fn adapter_luid(&self) -> AdapterLuid {
        self.luid
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_fence(&self) -> Result<Arc<dyn Fence>> {
        self.record("create_fence()".to_string());
        if self.fail_fences.load(Ordering::SeqCst) {
            return Err(Error::BackendError("fence creation failed".to_string()));
        }
        Ok(Arc::new(MockFence { id: next_id(), state: Arc::new(Mutex::new(MockFenceState::default())) }))
    }

    fn export_fence(&self, fence: &dyn Fence, kind: HandleKind) -> Result<SharedHandle> {
        let fence = Self::mock_fence(fence)?;
        self.record(format!("export_fence({})", fence.id));
        self.share(kind, SharedObject::Fence(fence.state.clone()))
    }

    fn import_fence(&self, handle: &SharedHandle) -> Result<Arc<dyn Fence>> {
        self.record(format!("import_fence({:#x})", handle.raw));
        match self.open(handle)? {
            SharedObject::Fence(state) => Ok(Arc::new(MockFence { id: next_id(), state })),
            SharedObject::Image(_) => Err(Error::GraphicsDeviceInvalid("handle is an image".to_string())),
        }
    }

    fn signal(&self, fence: &dyn Fence, value: u64) -> Result<()> {
        let fence = Self::mock_fence(fence)?;
        self.record(format!("signal({})", value));
        self.signaled_values.lock().unwrap().push(value);
        let mut state = fence.state.lock().unwrap();
        state.max_signaled = state.max_signaled.max(value);
        state.completed = state.completed.max(value);
        Ok(())
    }

    fn wait(&self, fence: &dyn Fence, value: u64) -> Result<()> {
        let fence = Self::mock_fence(fence)?;
        self.record(format!("wait({})", value));
        if value > fence.state.lock().unwrap().max_signaled {
            return Err(Error::RuntimeFailure(format!("wait on unreachable value {}", value)));
        }
        self.waited_values.lock().unwrap().push(value);
        Ok(())
    }

    fn wait_cpu(&self, fence: &dyn Fence, value: u64, _timeout: Duration) -> Result<()> {
        let fence = Self::mock_fence(fence)?;
        self.record(format!("wait_cpu({})", value));
        if fence.state.lock().unwrap().completed < value {
            return Err(Error::RuntimeFailure(format!("timed out waiting for {}", value)));
        }
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<Arc<dyn Image>> {
        self.record(format!("create_image({})", desc.label));
        Ok(Arc::new(MockImage::new(ImageInfo::from(desc), &desc.label)))
    }

    fn export_image(&self, image: &dyn Image, kind: HandleKind) -> Result<SharedHandle> {
        let image = Self::mock_image(image)?;
        self.record(format!("export_image({})", image.id));
        self.share(kind, SharedObject::Image(image.info.clone()))
    }

    fn import_image(&self, handle: &SharedHandle, desc: &ImageDesc) -> Result<Arc<dyn Image>> {
        self.record(format!("import_image({:#x})", handle.raw));
        match self.open(handle)? {
            SharedObject::Image(info) => {
                if info.width != desc.width || info.height != desc.height {
                    return Err(Error::GraphicsDeviceInvalid("imported image size mismatch".to_string()));
                }
                let mut image = MockImage::new(info, &desc.label);
                image.imported_from = Some(handle.raw);
                Ok(Arc::new(image))
            }
            SharedObject::Fence(_) => Err(Error::GraphicsDeviceInvalid("handle is a fence".to_string())),
        }
    }

    fn copy_slice(&self, src: &dyn Image, src_slice: u32, dst: &dyn Image) -> Result<()> {
        let (src, dst) = (Self::mock_image(src)?, Self::mock_image(dst)?);
        Self::check_slice(src, src_slice, dst)?;
        self.record(format!("copy_slice({})", src_slice));
        Ok(())
    }

    fn resolve_color(&self, src: &dyn Image, src_slice: u32, dst: &dyn Image) -> Result<()> {
        let (src, dst) = (Self::mock_image(src)?, Self::mock_image(dst)?);
        Self::check_slice(src, src_slice, dst)?;
        if src.info.samples < 2 || src.info.format.is_depth() {
            return Err(Error::ValidationFailure("color resolve needs a multisampled color image".to_string()));
        }
        self.record(format!("resolve_color({})", src_slice));
        Ok(())
    }

    fn resolve_depth(&self, src: &dyn Image, src_slice: u32, dst: &dyn Image) -> Result<()> {
        let (src, dst) = (Self::mock_image(src)?, Self::mock_image(dst)?);
        Self::check_slice(src, src_slice, dst)?;
        if !src.info.format.is_depth() || dst.info.format.has_stencil() {
            return Err(Error::ValidationFailure("depth resolve needs depth in, depth-only out".to_string()));
        }
        self.record(format!("resolve_depth({})", src_slice));
        Ok(())
    }

    fn precompose(&self, src: &dyn Image, src_rect: Rect2D, dst: &dyn Image, sharpen: f32) -> Result<()> {
        let (src, _dst) = (Self::mock_image(src)?, Self::mock_image(dst)?);
        if !src_rect.fits_within(src.info.width, src.info.height) {
            return Err(Error::SwapchainRectInvalid);
        }
        self.record(format!("precompose({:.2})", sharpen));
        Ok(())
    }

    fn create_timer(&self) -> Result<Arc<dyn GpuTimer>> {
        Ok(Arc::new(MockTimer::default()))
    }

    fn flush(&self) -> Result<()> {
        self.record("flush()".to_string());
        Ok(())
    }
}

#[cfg(test)]
#[path = "mock_graphics_device_tests.rs"]
mod tests;
