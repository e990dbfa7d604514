/// Session - frame pacing controller and owner of every per-session resource
///
/// The session drives the lifecycle state machine, the wait/begin/end frame
/// protocol and end-of-frame composition: validate layers, order application
/// work before the submission device, resolve and commit each referenced
/// slice once, then hand the compositor layers to the submission worker (or
/// submit synchronously).
///
/// Locking: the device context, the swapchain pool, the lifecycle, the frame
/// counters and the worker each sit behind their own mutex. No method holds
/// one of them while acquiring another, except the swapchain pool, which is
/// held across resolve work that only touches the (lock-free) device context
/// and compositor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::compositor::{
    CompositorDepth, CompositorLayer, CompositorSdk, CompositorSwapchainDesc, CompositorSwapchainId,
    CompositorViewport, LayerFlags,
};
use crate::config::RuntimeConfig;
use crate::device::{DeviceBinder, DeviceContext, DeviceFactory, GraphicsRequirements, QueueSide};
use crate::error::{Error, Result};
use crate::graphics_device::{
    supported_format_codes, AdapterLuid, GraphicsApi, GraphicsBinding, Image, PixelFormat, Rect2D,
};
use crate::services::{HmdStatus, TraceEvent, TraceSink, TraceValue, TrackingProvider};
use crate::session::async_submission::{AsyncSubmission, SubmissionJob};
use crate::session::layer::{validate_layers, CompositionLayer, FrameEndInfo, SubImage};
use crate::session::session_state::{SessionEvent, SessionInputs, SessionState, SessionStateMachine};
use crate::swapchain::{
    validate_desc, ImageRing, PrecompositionTargets, PreparedSlice, ResourceProvisioner, SliceResolver,
    Swapchain, SwapchainDesc, SwapchainHandle, SwapchainRegistry,
};

/// How far ahead of the worker's next frame start a running start gives up waiting
const RUNNING_START_MARGIN: Duration = Duration::from_millis(2);

// ============================================================================
// Public types
// ============================================================================

/// Services and settings a session is built from
#[derive(Clone)]
pub struct SessionCreateInfo {
    pub compositor: Arc<dyn CompositorSdk>,
    pub device_factory: Arc<dyn DeviceFactory>,
    pub tracking: Arc<dyn TrackingProvider>,
    pub trace: Arc<dyn TraceSink>,
    /// Adapter driving the headset
    pub target_adapter: AdapterLuid,
    pub config: RuntimeConfig,
}

/// View configuration requested when beginning the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewConfiguration {
    PrimaryStereo,
    PrimaryMono,
}

/// Result of `wait_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameState {
    /// Nanoseconds on the compositor clock; strictly increasing across calls
    pub predicted_display_time: i64,
    /// Nanoseconds
    pub predicted_display_period: i64,
    pub should_render: bool,
}

/// Frames waited, begun and completed so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCounters {
    pub waited: u64,
    pub begun: u64,
    pub completed: u64,
}

// ============================================================================
// Internal state
// ============================================================================

struct SwapchainPool {
    registry: SwapchainRegistry,
    provisioner: ResourceProvisioner,
}

struct Lifecycle {
    machine: SessionStateMachine,
    running: bool,
    stopping: bool,
    exiting: bool,
    frames_completed: u64,
    hmd: HmdStatus,
}

impl Lifecycle {
    fn inputs(&self) -> SessionInputs {
        SessionInputs {
            exiting: self.exiting,
            stopping: self.stopping,
            frames_completed: self.frames_completed,
            is_visible: self.hmd.is_visible,
            hmd_mounted: self.hmd.hmd_mounted,
        }
    }
}

struct FrameTiming {
    counters: FrameCounters,
    last_predicted_display_time: i64,
    /// Frame completions within the last second
    frame_times: VecDeque<Instant>,
}

type SliceKey = (SwapchainHandle, u32);

/// Left and right eye widths, then heights
type EyeSizes = ([u32; 2], [u32; 2]);

/// Slices prepared this frame, in first-reference order
#[derive(Default)]
struct PreparedFrame {
    order: Vec<SliceKey>,
    slices: FxHashMap<SliceKey, PreparedSlice>,
}

impl PreparedFrame {
    fn get(&self, sub_image: &SubImage) -> Result<&PreparedSlice> {
        self.slices
            .get(&(sub_image.swapchain, sub_image.image_array_index))
            .ok_or(Error::HandleInvalid)
    }

    fn viewport(&self, sub_image: &SubImage) -> Result<CompositorViewport> {
        Ok(CompositorViewport { swapchain: self.get(sub_image)?.compositor, rect: sub_image.image_rect })
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::BackendError(format!("{} lock poisoned", what)))
}

fn seconds_to_nanos(seconds: f64) -> i64 {
    (seconds * 1e9) as i64
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    config: RuntimeConfig,
    compositor: Arc<dyn CompositorSdk>,
    tracking: Arc<dyn TrackingProvider>,
    trace: Arc<dyn TraceSink>,
    binder: DeviceBinder,
    device: Mutex<Option<Arc<DeviceContext>>>,
    swapchains: Mutex<SwapchainPool>,
    lifecycle: Mutex<Lifecycle>,
    frames: Mutex<FrameTiming>,
    worker: Mutex<Option<AsyncSubmission>>,
}

impl Session {
    /// Create a session in the Idle state; the Idle and Ready events are queued immediately
    pub fn new(info: SessionCreateInfo) -> Self {
        let hmd = info.tracking.hmd_status();
        let mut lifecycle = Lifecycle {
            machine: SessionStateMachine::new(),
            running: false,
            stopping: false,
            exiting: false,
            frames_completed: 0,
            hmd,
        };
        let time = info.compositor.elapsed_time();
        let inputs = lifecycle.inputs();
        lifecycle.machine.update(&inputs, time, true);

        crate::bridge_info!(
            "xr_bridge::Session",
            "Session created on adapter {} (async submission {}, running start {})",
            info.target_adapter,
            if info.config.disable_async_submission { "disabled" } else { "allowed" },
            info.config.running_start
        );

        Self {
            binder: DeviceBinder::new(info.target_adapter, info.device_factory),
            swapchains: Mutex::new(SwapchainPool {
                registry: SwapchainRegistry::new(),
                provisioner: ResourceProvisioner::new(info.config.slow_path),
            }),
            config: info.config,
            compositor: info.compositor,
            tracking: info.tracking,
            trace: info.trace,
            device: Mutex::new(None),
            lifecycle: Mutex::new(lifecycle),
            frames: Mutex::new(FrameTiming {
                counters: FrameCounters::default(),
                last_predicted_display_time: 0,
                frame_times: VecDeque::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ===== DEVICE BINDING =====

    pub fn graphics_requirements(&self, api: GraphicsApi) -> GraphicsRequirements {
        self.binder.graphics_requirements(api)
    }

    /// Bind the application's graphics device; only one binding per session
    pub fn bind_device(&self, binding: GraphicsBinding) -> Result<()> {
        if lock(&self.device, "Device")?.is_some() {
            return Err(Error::CallOrderInvalid);
        }
        let context = Arc::new(self.binder.bind_device(binding, &self.config)?);
        if self.config.precomposition_enabled
            && self.config.sharpen_factor > 0.0
            && !context.submission_device.capabilities().sharpening
        {
            crate::bridge_warn!(
                "xr_bridge::Session",
                "Submission device cannot sharpen; precomposition runs without sharpening"
            );
        }
        let mut device = lock(&self.device, "Device")?;
        if device.is_some() {
            return Err(Error::CallOrderInvalid);
        }
        *device = Some(context);
        Ok(())
    }

    fn context(&self) -> Result<Arc<DeviceContext>> {
        lock(&self.device, "Device")?
            .clone()
            .ok_or(Error::GraphicsRequirementsCallMissing)
    }

    /// Bound device context, if any
    pub fn device_context(&self) -> Option<Arc<DeviceContext>> {
        self.device.lock().ok().and_then(|d| d.clone())
    }

    // ===== SWAPCHAINS =====

    /// Formats accepted by `create_swapchain`, most preferred first
    pub fn enumerate_formats(&self) -> Result<Vec<i64>> {
        let context = self.context()?;
        Ok(supported_format_codes(context.api(), context.stencil_shareable))
    }

    pub fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<SwapchainHandle> {
        if !self.binder.requirements_queried() {
            return Err(Error::GraphicsRequirementsCallMissing);
        }
        let context = self.context()?;
        let format = validate_desc(
            desc,
            context.api(),
            context.stencil_shareable,
            self.config.cubemap_layers_supported,
        )?;

        let mut guard = lock(&self.swapchains, "Swapchain")?;
        let pool = &mut *guard;
        let provisioned = pool.provisioner.provision(&context, self.compositor.as_ref(), desc, format)?;
        let ring = ImageRing::new(
            provisioned.length,
            desc.is_static(),
            self.config.allow_static_swapchain_reuse,
        );
        let handle = pool.registry.insert(Swapchain::new(
            desc.clone(),
            format,
            ring,
            provisioned.path,
            provisioned.images,
        ));

        // Import eagerly so a sharing failure surfaces at creation
        let imported = match pool.registry.get(handle) {
            Ok(swapchain) => pool.provisioner.app_images(handle, swapchain, &context),
            Err(e) => Err(e),
        };
        if let Err(e) = imported {
            pool.provisioner.release_imports(handle);
            let removed = pool.registry.remove(handle);
            drop(guard);
            if let Ok(swapchain) = removed {
                if let Err(wait) = self.wait_for_worker(|_| None) {
                    crate::bridge_warn!("xr_bridge::Session", "Submission worker not idle: {}", wait);
                }
                self.destroy_compositor_swapchains(&swapchain);
            }
            return Err(e);
        }

        crate::bridge_debug!(
            "xr_bridge::Session",
            "Created swapchain {:?}: {}x{} x{} {:?}, {} samples, ring {}",
            handle,
            desc.width,
            desc.height,
            desc.array_size,
            format,
            desc.sample_count,
            provisioned.length
        );
        Ok(handle)
    }

    /// Application-visible images of a swapchain, in ring order
    pub fn enumerate_images(&self, handle: SwapchainHandle) -> Result<Vec<Arc<dyn Image>>> {
        let context = self.context()?;
        let mut guard = lock(&self.swapchains, "Swapchain")?;
        let pool = &mut *guard;
        let swapchain = pool.registry.get(handle)?;
        pool.provisioner.app_images(handle, swapchain, &context)
    }

    pub fn acquire_image(&self, handle: SwapchainHandle) -> Result<u32> {
        let index = lock(&self.swapchains, "Swapchain")?.registry.acquire(handle)?;
        self.trace.emit(
            TraceEvent::new("xrAcquireSwapchainImage")
                .with("swapchain", TraceValue::Str(format!("{:?}", handle)))
                .with("index", TraceValue::U64(index as u64)),
        );
        Ok(index)
    }

    pub fn wait_image(&self, handle: SwapchainHandle, timeout: Duration) -> Result<()> {
        lock(&self.swapchains, "Swapchain")?.registry.wait(handle, timeout)
    }

    pub fn release_image(&self, handle: SwapchainHandle) -> Result<()> {
        lock(&self.swapchains, "Swapchain")?.registry.release(handle).map(|_| ())
    }

    /// Park the worker and drain GPU work, then drop the swapchain's images, imports and compositor swapchains
    pub fn destroy_swapchain(&self, handle: SwapchainHandle) -> Result<()> {
        let context = self.context()?;
        if !lock(&self.swapchains, "Swapchain")?.registry.contains(handle) {
            return Err(Error::HandleInvalid);
        }
        // A queued frame may still reference this swapchain's compositor images
        self.wait_for_worker(|_| None)?;

        let mut guard = lock(&self.swapchains, "Swapchain")?;
        if !guard.registry.contains(handle) {
            return Err(Error::HandleInvalid);
        }
        context.flush_all()?;

        let swapchain = guard.registry.remove(handle)?;
        let released = guard.provisioner.release_imports(handle);
        drop(guard);

        self.destroy_compositor_swapchains(&swapchain);
        crate::bridge_debug!(
            "xr_bridge::Session",
            "Destroyed swapchain {:?} ({} imports released)",
            handle,
            released
        );
        Ok(())
    }

    pub fn swapchain_count(&self) -> usize {
        self.swapchains.lock().map(|p| p.registry.len()).unwrap_or(0)
    }

    fn destroy_compositor_swapchains(&self, swapchain: &Swapchain) {
        for id in swapchain.compositor_swapchains() {
            if let Err(e) = self.compositor.destroy_swapchain(id) {
                crate::bridge_warn!("xr_bridge::Session", "Failed to destroy compositor swapchain {}: {}", id, e);
            }
        }
    }

    // ===== LIFECYCLE =====

    pub fn state(&self) -> SessionState {
        self.lifecycle
            .lock()
            .map(|l| l.machine.state())
            .unwrap_or(SessionState::Exiting)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().map(|l| l.running).unwrap_or(false)
    }

    /// Whether frames are handed to a background submission worker
    pub fn uses_async_submission(&self) -> bool {
        self.worker.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    fn update_state(&self, lifecycle: &mut Lifecycle) {
        let before = lifecycle.machine.state();
        let inputs = lifecycle.inputs();
        let transitions = lifecycle.machine.update(&inputs, self.compositor.elapsed_time(), false);
        if transitions > 0 {
            self.trace.emit(
                TraceEvent::new("SessionStateChanged")
                    .with("from", TraceValue::Str(before.to_string()))
                    .with("to", TraceValue::Str(lifecycle.machine.state().to_string()))
                    .with("transitions", TraceValue::U64(transitions as u64)),
            );
        }
    }

    /// Start the frame loop
    pub fn begin(&self, view_configuration: ViewConfiguration) -> Result<()> {
        if view_configuration != ViewConfiguration::PrimaryStereo {
            return Err(Error::ValidationFailure(format!(
                "unsupported view configuration {:?}",
                view_configuration
            )));
        }
        {
            let mut lifecycle = lock(&self.lifecycle, "Lifecycle")?;
            if lifecycle.running {
                return Err(Error::SessionRunning);
            }
            if lifecycle.machine.state() != SessionState::Ready {
                return Err(Error::SessionNotReady);
            }
            lifecycle.running = true;
        }

        let use_async = match self.context() {
            Ok(context) => !context.shares_device && !self.config.disable_async_submission,
            Err(e) => {
                lock(&self.lifecycle, "Lifecycle")?.running = false;
                return Err(e);
            }
        };
        if use_async {
            let first_frame = lock(&self.frames, "Frame")?.counters.waited;
            match AsyncSubmission::start(self.compositor.clone(), first_frame) {
                Ok(worker) => *lock(&self.worker, "Worker")? = Some(worker),
                Err(e) => {
                    lock(&self.lifecycle, "Lifecycle")?.running = false;
                    return Err(e);
                }
            }
        }

        crate::bridge_info!(
            "xr_bridge::Session",
            "Session begun ({} submission)",
            if use_async { "asynchronous" } else { "synchronous" }
        );
        Ok(())
    }

    /// Ask the session to stop; it moves to Stopping on the next state update
    pub fn request_exit(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle, "Lifecycle")?;
        if !lifecycle.running {
            return Err(Error::SessionNotRunning);
        }
        lifecycle.stopping = true;
        self.update_state(&mut lifecycle);
        Ok(())
    }

    /// Acknowledge Stopping: joins the worker and walks to Idle, then Exiting
    pub fn end(&self) -> Result<()> {
        if self.state() != SessionState::Stopping {
            return Err(Error::SessionNotStopping);
        }
        if let Some(mut worker) = lock(&self.worker, "Worker")?.take() {
            worker.stop();
        }
        let mut lifecycle = lock(&self.lifecycle, "Lifecycle")?;
        lifecycle.running = false;
        lifecycle.exiting = true;
        self.update_state(&mut lifecycle);
        crate::bridge_info!("xr_bridge::Session", "Session ended");
        Ok(())
    }

    /// Refresh headset status from the tracking provider
    pub fn update_hmd_status(&self) {
        let status = self.tracking.hmd_status();
        let Ok(mut lifecycle) = self.lifecycle.lock() else {
            return;
        };
        if status.should_quit || status.display_lost {
            if !lifecycle.stopping {
                crate::bridge_info!(
                    "xr_bridge::Session",
                    "Compositor requested stop (quit {}, display lost {})",
                    status.should_quit,
                    status.display_lost
                );
            }
            lifecycle.stopping = true;
        }
        lifecycle.hmd = status;
        self.update_state(&mut lifecycle);
    }

    /// Next queued state change, after refreshing headset status
    pub fn poll_event(&self) -> Option<SessionEvent> {
        self.update_hmd_status();
        self.lifecycle.lock().ok().and_then(|mut l| l.machine.poll_event())
    }

    fn ensure_running(&self) -> Result<()> {
        if lock(&self.lifecycle, "Lifecycle")?.running {
            Ok(())
        } else {
            Err(Error::SessionNotRunning)
        }
    }

    // ===== FRAME LOOP =====

    pub fn frame_counters(&self) -> FrameCounters {
        self.frames.lock().map(|f| f.counters).unwrap_or_default()
    }

    /// Frames completed during the last second
    pub fn fps(&self) -> usize {
        self.frames.lock().map(|f| f.frame_times.len()).unwrap_or(0)
    }

    /// Wait on the submission worker; returns `None` when submission is synchronous
    fn wait_for_worker(&self, deadline: impl FnOnce(&AsyncSubmission) -> Option<Instant>) -> Result<Option<bool>> {
        let mut guard = lock(&self.worker, "Worker")?;
        match guard.as_mut() {
            Some(worker) => {
                let deadline = deadline(worker);
                worker.wait_idle(deadline).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Throttle the application to the compositor and predict when the frame will be shown
    pub fn wait_frame(&self) -> Result<FrameState> {
        self.ensure_running()?;
        let frame_id = lock(&self.frames, "Frame")?.counters.waited;
        let started = Instant::now();

        let running_start = self.config.running_start && !self.config.lock_framerate;
        let frame_duration = self.compositor.frame_duration();
        let worker = self.wait_for_worker(|worker| {
            if !running_start {
                return None;
            }
            // Stop waiting shortly before the worker would start the next frame anyway
            worker
                .last_begin()
                .map(|begin| begin + frame_duration.saturating_sub(RUNNING_START_MARGIN))
        })?;

        let is_async = worker.is_some();
        if !is_async && (!self.config.defer_frame_wait || self.config.lock_framerate) {
            self.compositor.wait_to_begin_frame(frame_id)?;
        }

        let predicted = seconds_to_nanos(self.compositor.predicted_display_time(frame_id));
        let predicted_display_time = {
            let mut frames = lock(&self.frames, "Frame")?;
            // Compositor times may repeat early on; the application needs them strictly increasing
            let time = predicted.max(frames.last_predicted_display_time + 1);
            frames.last_predicted_display_time = time;
            frames.counters.waited += 1;
            time
        };

        let should_render = matches!(self.state(), SessionState::Visible | SessionState::Focused);
        self.trace.emit(
            TraceEvent::new("WaitFrame")
                .with("frame_id", TraceValue::U64(frame_id))
                .with("predicted_display_time", TraceValue::I64(predicted_display_time))
                .with("wait_us", TraceValue::U64(started.elapsed().as_micros() as u64))
                .with("worker_idle", TraceValue::Bool(worker.unwrap_or(true))),
        );

        Ok(FrameState {
            predicted_display_time,
            predicted_display_period: frame_duration.as_nanos() as i64,
            should_render,
        })
    }

    /// Start rendering the last waited frame; returns whether the previous begun frame was discarded
    pub fn begin_frame(&self) -> Result<bool> {
        self.ensure_running()?;
        let context = self.context()?;
        let (frame_id, waited, discarded) = {
            let frames = lock(&self.frames, "Frame")?;
            let counters = frames.counters;
            if counters.waited == counters.completed || counters.begun == counters.waited {
                return Err(Error::CallOrderInvalid);
            }
            (counters.waited - 1, counters.waited, counters.begun != counters.completed)
        };

        if !self.uses_async_submission() {
            if self.config.defer_frame_wait && !self.config.lock_framerate {
                self.compositor.wait_to_begin_frame(frame_id)?;
            }
            self.compositor.begin_frame(frame_id)?;
        }
        lock(&self.frames, "Frame")?.counters.begun = waited;

        let app_gpu_time_us = match context.app_timers.restart(frame_id) {
            Ok(us) => us,
            Err(e) => {
                crate::bridge_warn!("xr_bridge::Session", "Application GPU timer failed: {}", e);
                0
            }
        };
        if discarded {
            crate::bridge_debug!("xr_bridge::Session", "Frame {} discarded", frame_id.saturating_sub(1));
        }
        self.trace.emit(
            TraceEvent::new("BeginFrame")
                .with("frame_id", TraceValue::U64(frame_id))
                .with("discarded", TraceValue::Bool(discarded))
                .with("app_gpu_time_us", TraceValue::U64(app_gpu_time_us)),
        );
        Ok(discarded)
    }

    /// Compose and submit the begun frame
    pub fn end_frame(&self, info: &FrameEndInfo) -> Result<()> {
        self.ensure_running()?;
        let context = self.context()?;
        let frame_id = {
            let frames = lock(&self.frames, "Frame")?;
            if frames.counters.begun == frames.counters.completed {
                return Err(Error::CallOrderInvalid);
            }
            frames.counters.begun - 1
        };
        if info.display_time <= 0 {
            return Err(Error::ValidationFailure(format!("invalid display time {}", info.display_time)));
        }
        validate_layers(&info.layers, &lock(&self.swapchains, "Swapchain")?.registry)?;

        // The worker must be parked before compositor swapchains are touched
        self.wait_for_worker(|_| None)?;

        if let Err(e) = context.app_timers.stop(frame_id) {
            crate::bridge_warn!("xr_bridge::Session", "Application GPU timer failed: {}", e);
        }
        context.serialize_app_work()?;

        let (layers, precomposition_gpu_time_us) = {
            let mut guard = lock(&self.swapchains, "Swapchain")?;
            self.compose(&context, &mut guard, &info.layers, frame_id)?
        };
        context.serialize_submission_work()?;

        let layer_count = layers.len();
        let layers = if layers.is_empty() { vec![CompositorLayer::Disabled] } else { layers };
        match lock(&self.worker, "Worker")?.as_mut() {
            Some(worker) => worker.submit(SubmissionJob { frame_id, layers })?,
            None => self.compositor.submit_frame(frame_id, &layers)?,
        }
        if self.config.sync_gpu_work_in_end_frame {
            context.synchronizer.flush(QueueSide::Submission)?;
        }

        let (completed, fps) = {
            let mut frames = lock(&self.frames, "Frame")?;
            frames.counters.completed = frames.counters.begun;
            let now = Instant::now();
            frames.frame_times.push_back(now);
            while frames
                .frame_times
                .front()
                .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(1))
            {
                frames.frame_times.pop_front();
            }
            (frames.counters.completed, frames.frame_times.len())
        };
        {
            let mut lifecycle = lock(&self.lifecycle, "Lifecycle")?;
            lifecycle.frames_completed = completed;
            self.update_state(&mut lifecycle);
        }

        self.trace.emit(
            TraceEvent::new("EndFrame")
                .with("frame_id", TraceValue::U64(frame_id))
                .with("layers", TraceValue::U64(layer_count as u64))
                .with("fps", TraceValue::U64(fps as u64))
                .with("precomposition_gpu_time_us", TraceValue::U64(precomposition_gpu_time_us)),
        );
        Ok(())
    }

    /// Resolve, precompose and commit every referenced slice, then build the compositor layers
    fn compose(
        &self,
        context: &DeviceContext,
        pool: &mut SwapchainPool,
        layers: &[CompositionLayer],
        frame_id: u64,
    ) -> Result<(Vec<CompositorLayer>, u64)> {
        let resolver = SliceResolver::new(
            context.submission_device.clone(),
            self.compositor.clone(),
            self.trace.clone(),
        );

        let mut prepared = PreparedFrame::default();
        for layer in layers {
            for sub_image in layer.sub_images() {
                let key = (sub_image.swapchain, sub_image.image_array_index);
                if prepared.slices.contains_key(&key) {
                    continue;
                }
                let swapchain = pool.registry.get_mut(sub_image.swapchain)?;
                let slice = resolver.prepare(swapchain, sub_image.image_array_index)?;
                prepared.order.push(key);
                prepared.slices.insert(key, slice);
            }
        }

        let mut precomposed: FxHashMap<usize, [CompositorViewport; 2]> = FxHashMap::default();
        let mut precomposition_gpu_time_us = 0;
        if self.config.precomposition_enabled {
            precomposition_gpu_time_us = match context.precomposition_timers.restart(frame_id) {
                Ok(us) => us,
                Err(e) => {
                    crate::bridge_warn!("xr_bridge::Session", "Precomposition GPU timer failed: {}", e);
                    0
                }
            };
            // Every target this frame needs is settled before any eye is written
            let mut requests: Vec<(SwapchainHandle, Vec<(usize, EyeSizes)>)> = Vec::new();
            for (index, layer) in layers.iter().enumerate() {
                if let CompositionLayer::Projection { views, .. } = layer {
                    let sizes = (
                        [views[0].sub_image.image_rect.width, views[1].sub_image.image_rect.width],
                        [views[0].sub_image.image_rect.height, views[1].sub_image.image_rect.height],
                    );
                    let owner = views[0].sub_image.swapchain;
                    match requests.iter_mut().find(|(handle, _)| *handle == owner) {
                        Some((_, sizes_for_owner)) => sizes_for_owner.push((index, sizes)),
                        None => requests.push((owner, vec![(index, sizes)])),
                    }
                }
            }
            let mut assigned: FxHashMap<usize, PrecompositionTargets> = FxHashMap::default();
            for (owner, owner_requests) in &requests {
                let swapchain = pool.registry.get_mut(*owner)?;
                let sizes: Vec<EyeSizes> = owner_requests.iter().map(|(_, sizes)| *sizes).collect();
                let targets = self.precomposition_targets(context, swapchain, &sizes)?;
                for ((index, _), targets) in owner_requests.iter().zip(targets) {
                    assigned.insert(*index, targets);
                }
            }
            for (index, layer) in layers.iter().enumerate() {
                if let (CompositionLayer::Projection { views, .. }, Some(targets)) = (layer, assigned.get(&index)) {
                    let eyes = self.precompose(context, targets, [views[0].sub_image, views[1].sub_image], &prepared)?;
                    precomposed.insert(index, eyes);
                }
            }
            if let Err(e) = context.precomposition_timers.stop(frame_id) {
                crate::bridge_warn!("xr_bridge::Session", "Precomposition GPU timer failed: {}", e);
            }
        }

        for key in &prepared.order {
            let swapchain = pool.registry.get_mut(key.0)?;
            resolver.commit(swapchain, key.1, &prepared.slices[key])?;
        }
        for eyes in precomposed.values() {
            for eye in eyes {
                self.compositor.commit(eye.swapchain)?;
            }
        }

        let mut submitted = Vec::with_capacity(layers.len());
        for (index, layer) in layers.iter().enumerate() {
            submitted.push(match layer {
                CompositionLayer::Projection { views, flags } => {
                    let color = match precomposed.get(&index) {
                        Some(eyes) => *eyes,
                        None => [prepared.viewport(&views[0].sub_image)?, prepared.viewport(&views[1].sub_image)?],
                    };
                    let depth = match (views[0].depth, views[1].depth) {
                        (Some(left), Some(right)) => Some([
                            CompositorDepth {
                                viewport: prepared.viewport(&left.sub_image)?,
                                near_z: left.near_z,
                                far_z: left.far_z,
                            },
                            CompositorDepth {
                                viewport: prepared.viewport(&right.sub_image)?,
                                near_z: right.near_z,
                                far_z: right.far_z,
                            },
                        ]),
                        _ => None,
                    };
                    CompositorLayer::EyeFov {
                        color,
                        depth,
                        fov: [views[0].fov, views[1].fov],
                        poses: [views[0].pose, views[1].pose],
                        flags: *flags,
                    }
                }
                CompositionLayer::Quad { sub_image, pose, size, head_locked, flags } => {
                    let mut flags = *flags;
                    flags.set(LayerFlags::HEAD_LOCKED, *head_locked);
                    CompositorLayer::Quad { color: prepared.viewport(sub_image)?, pose: *pose, size: *size, flags }
                }
            });
        }
        Ok((submitted, precomposition_gpu_time_us))
    }

    /// Write both eyes of a projection into its precomposition targets
    fn precompose(
        &self,
        context: &DeviceContext,
        targets: &PrecompositionTargets,
        views: [SubImage; 2],
        prepared: &PreparedFrame,
    ) -> Result<[CompositorViewport; 2]> {
        let sharpen = if context.submission_device.capabilities().sharpening {
            self.config.sharpen_factor
        } else {
            0.0
        };
        let mut viewports = [CompositorViewport { swapchain: targets.eyes[0], rect: Rect2D::default() }; 2];
        for eye in 0..2 {
            let source = prepared.get(&views[eye])?;
            let destination_index = self.compositor.current_index(targets.eyes[eye])?;
            let destination = self.compositor.swapchain_image(targets.eyes[eye], destination_index)?;
            context.submission_device.precompose(
                source.image.as_ref(),
                views[eye].image_rect,
                destination.as_ref(),
                sharpen,
            )?;
            viewports[eye] = CompositorViewport {
                swapchain: targets.eyes[eye],
                rect: Rect2D::new(0, 0, targets.width[eye], targets.height[eye]),
            };
        }
        Ok(viewports)
    }

    /// One target pair per requested size, in request order
    ///
    /// Pairs whose size is still requested are kept, the rest are destroyed and
    /// missing sizes are created. Two requests never share a pair.
    fn precomposition_targets(
        &self,
        context: &DeviceContext,
        swapchain: &mut Swapchain,
        sizes: &[EyeSizes],
    ) -> Result<Vec<PrecompositionTargets>> {
        let mut available = std::mem::take(&mut swapchain.precomposition);
        let kept: Vec<Option<PrecompositionTargets>> = sizes
            .iter()
            .map(|(width, height)| {
                available
                    .iter()
                    .position(|t| t.width == *width && t.height == *height)
                    .map(|i| available.swap_remove(i))
            })
            .collect();

        for stale in available {
            for id in stale.eyes {
                if let Err(e) = self.compositor.destroy_swapchain(id) {
                    crate::bridge_warn!("xr_bridge::Session", "Failed to destroy precomposition {}: {}", id, e);
                }
            }
        }
        swapchain.precomposition = kept.iter().flatten().copied().collect();

        let mut targets = Vec::with_capacity(sizes.len());
        for (slot, (width, height)) in kept.into_iter().zip(sizes) {
            let pair = match slot {
                Some(pair) => pair,
                None => {
                    let pair = self.create_precomposition_targets(context, swapchain.submission_format, *width, *height)?;
                    swapchain.precomposition.push(pair);
                    pair
                }
            };
            targets.push(pair);
        }
        Ok(targets)
    }

    fn create_precomposition_targets(
        &self,
        context: &DeviceContext,
        format: PixelFormat,
        width: [u32; 2],
        height: [u32; 2],
    ) -> Result<PrecompositionTargets> {
        let mut eyes: [Option<CompositorSwapchainId>; 2] = [None, None];
        for eye in 0..2 {
            let desc = CompositorSwapchainDesc {
                width: width[eye],
                height: height[eye],
                array_size: 1,
                face_count: 1,
                mip_count: 1,
                sample_count: 1,
                format,
                is_static: false,
                label: format!("Precomposition {}", if eye == 0 { "left" } else { "right" }),
            };
            match self.compositor.create_swapchain(context.submission_device.as_ref(), &desc) {
                Ok(id) => eyes[eye] = Some(id),
                Err(e) => {
                    for id in eyes.into_iter().flatten() {
                        let _ = self.compositor.destroy_swapchain(id);
                    }
                    return Err(e);
                }
            }
        }
        let [Some(left), Some(right)] = eyes else {
            return Err(Error::RuntimeFailure("precomposition swapchains missing".to_string()));
        };
        crate::bridge_debug!(
            "xr_bridge::Session",
            "Created precomposition targets {} {} ({}x{}, {}x{})",
            left,
            right,
            width[0],
            height[0],
            width[1],
            height[1]
        );
        Ok(PrecompositionTargets { eyes: [left, right], width, height })
    }

    // ===== TEARDOWN =====

    /// Join the worker, drain both devices and release everything; safe to call twice
    pub fn destroy(&self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(mut worker) = worker.take() {
                worker.stop();
            }
        }

        let context = self.device.lock().ok().and_then(|d| d.clone());
        if let Some(context) = &context {
            if let Err(e) = context.flush_all() {
                crate::bridge_error!("xr_bridge::Session", "Failed to drain GPU work at teardown: {}", e);
            }
        }

        if let Ok(mut pool) = self.swapchains.lock() {
            let drained = pool.registry.drain();
            if !drained.is_empty() {
                crate::bridge_debug!("xr_bridge::Session", "Destroying {} swapchains", drained.len());
            }
            for (_, swapchain) in &drained {
                self.destroy_compositor_swapchains(swapchain);
            }
            pool.provisioner.clear();
        }

        if let Ok(mut device) = self.device.lock() {
            if device.take().is_some() {
                crate::bridge_info!("xr_bridge::Session", "Session destroyed");
            }
        }
        if let Ok(mut lifecycle) = self.lifecycle.lock() {
            lifecycle.running = false;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
