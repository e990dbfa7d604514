//! Unit tests for the session: lifecycle, frame pacing and end-of-frame composition

use std::sync::{Arc, Mutex};
use std::time::Duration;

use glam::Vec2;

use crate::compositor::mock_compositor::MockCompositor;
use crate::compositor::{CompositorLayer, LayerFlags};
use crate::config::RuntimeConfig;
use crate::device::mock_device_factory::{mock_binding, MockDeviceFactory, MOCK_ADAPTER};
use crate::error::Error;
use crate::graphics_device::mock_graphics_device::MockGraphicsDevice;
use crate::graphics_device::{DeviceCapabilities, GraphicsApi, Rect2D};
use crate::services::{Fov, HmdStatus, Pose, RecordingTraceSink, TrackingProvider};
use crate::session::layer::{CompositionLayer, DepthInfo, FrameEndInfo, ProjectionView, SubImage};
use crate::session::session::*;
use crate::session::session_state::SessionState;
use crate::swapchain::{SwapchainCreateFlags, SwapchainDesc, SwapchainHandle, SwapchainUsage};

// ============================================================================
// Harness
// ============================================================================

struct SwitchableTracking(Mutex<HmdStatus>);

impl TrackingProvider for SwitchableTracking {
    fn hmd_status(&self) -> HmdStatus {
        *self.0.lock().unwrap()
    }
}

struct Harness {
    session: Session,
    compositor: Arc<MockCompositor>,
    factory: Arc<MockDeviceFactory>,
    app: Arc<MockGraphicsDevice>,
    trace: Arc<RecordingTraceSink>,
    tracking: Arc<SwitchableTracking>,
}

impl Harness {
    fn submission(&self) -> Arc<MockGraphicsDevice> {
        self.factory.last().unwrap_or_else(|| self.app.clone())
    }

    fn set_status(&self, status: HmdStatus) {
        *self.tracking.0.lock().unwrap() = status;
    }
}

const PRESENT: HmdStatus = HmdStatus {
    is_visible: true,
    hmd_mounted: true,
    hmd_present: true,
    display_lost: false,
    should_quit: false,
};

fn sync_config() -> RuntimeConfig {
    RuntimeConfig { disable_async_submission: true, ..RuntimeConfig::default() }
}

fn harness_with(config: RuntimeConfig, caps: DeviceCapabilities) -> Harness {
    let compositor = Arc::new(MockCompositor::new());
    let factory = MockDeviceFactory::new();
    let trace = Arc::new(RecordingTraceSink::new());
    let tracking = Arc::new(SwitchableTracking(Mutex::new(PRESENT)));
    let session = Session::new(SessionCreateInfo {
        compositor: compositor.clone(),
        device_factory: factory.clone(),
        tracking: tracking.clone(),
        trace: trace.clone(),
        target_adapter: MOCK_ADAPTER,
        config,
    });
    let app = Arc::new(MockGraphicsDevice::with_capabilities(GraphicsApi::D3D11, MOCK_ADAPTER, caps));
    Harness { session, compositor, factory, app, trace, tracking }
}

fn harness(config: RuntimeConfig) -> Harness {
    harness_with(config, DeviceCapabilities::default())
}

fn bound(config: RuntimeConfig) -> Harness {
    let h = harness(config);
    h.session.graphics_requirements(GraphicsApi::D3D11);
    h.session.bind_device(mock_binding(h.app.clone())).unwrap();
    h
}

fn running(config: RuntimeConfig) -> Harness {
    let h = bound(config);
    h.session.begin(ViewConfiguration::PrimaryStereo).unwrap();
    h
}

fn color_desc(array_size: u32) -> SwapchainDesc {
    SwapchainDesc {
        create_flags: SwapchainCreateFlags::empty(),
        usage: SwapchainUsage::COLOR_ATTACHMENT | SwapchainUsage::SAMPLED,
        format: 29,
        sample_count: 1,
        width: 1024,
        height: 1024,
        face_count: 1,
        array_size,
        mip_count: 1,
    }
}

fn msaa_depth_desc() -> SwapchainDesc {
    SwapchainDesc {
        usage: SwapchainUsage::DEPTH_STENCIL_ATTACHMENT,
        format: 40,
        sample_count: 4,
        ..color_desc(1)
    }
}

fn render(h: &Harness, handle: SwapchainHandle) -> u32 {
    let index = h.session.acquire_image(handle).unwrap();
    h.session.wait_image(handle, Duration::from_millis(100)).unwrap();
    h.session.release_image(handle).unwrap();
    index
}

fn sub_image(swapchain: SwapchainHandle, slice: u32) -> SubImage {
    SubImage { swapchain, image_rect: Rect2D::new(0, 0, 1024, 1024), image_array_index: slice }
}

fn quad(swapchain: SwapchainHandle) -> CompositionLayer {
    CompositionLayer::Quad {
        sub_image: sub_image(swapchain, 0),
        pose: Pose::IDENTITY,
        size: Vec2::ONE,
        head_locked: false,
        flags: LayerFlags::empty(),
    }
}

fn projection(left: SubImage, right: SubImage) -> CompositionLayer {
    let view = |sub_image| ProjectionView { sub_image, pose: Pose::IDENTITY, fov: Fov::default(), depth: None };
    CompositionLayer::Projection { views: vec![view(left), view(right)], flags: LayerFlags::empty() }
}

fn run_frame(h: &Harness, layers: Vec<CompositionLayer>) -> crate::error::Result<()> {
    let state = h.session.wait_frame()?;
    h.session.begin_frame()?;
    h.session.end_frame(&FrameEndInfo { display_time: state.predicted_display_time, layers })
}

fn drain(session: &Session) -> Vec<SessionState> {
    std::iter::from_fn(|| session.poll_event()).map(|e| e.state).collect()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_creation_queues_idle_then_ready() {
    let h = harness(sync_config());
    assert_eq!(drain(&h.session), vec![SessionState::Idle, SessionState::Ready]);
    assert_eq!(h.session.state(), SessionState::Ready);
}

#[test]
fn test_begin_twice_fails() {
    let h = running(sync_config());
    assert_eq!(h.session.begin(ViewConfiguration::PrimaryStereo), Err(Error::SessionRunning));
}

#[test]
fn test_begin_rejects_mono() {
    let h = bound(sync_config());
    assert!(matches!(
        h.session.begin(ViewConfiguration::PrimaryMono),
        Err(Error::ValidationFailure(_))
    ));
    assert!(!h.session.is_running());
}

#[test]
fn test_first_frame_reaches_focused() {
    let h = running(sync_config());
    drain(&h.session);
    run_frame(&h, Vec::new()).unwrap();
    assert_eq!(
        drain(&h.session),
        vec![SessionState::Synchronized, SessionState::Visible, SessionState::Focused]
    );
    assert!(h.session.wait_frame().unwrap().should_render);
}

#[test]
fn test_invisible_session_should_not_render() {
    let h = running(sync_config());
    h.set_status(HmdStatus { is_visible: false, ..PRESENT });
    run_frame(&h, Vec::new()).unwrap();
    h.session.update_hmd_status();
    assert_eq!(h.session.state(), SessionState::Synchronized);
    assert!(!h.session.wait_frame().unwrap().should_render);
}

#[test]
fn test_exit_walks_stopping_idle_exiting() {
    let h = running(sync_config());
    run_frame(&h, Vec::new()).unwrap();
    drain(&h.session);

    h.session.request_exit().unwrap();
    assert_eq!(
        drain(&h.session),
        vec![SessionState::Visible, SessionState::Synchronized, SessionState::Stopping]
    );
    h.session.end().unwrap();
    assert_eq!(drain(&h.session), vec![SessionState::Idle, SessionState::Exiting]);
    assert!(!h.session.is_running());
    assert_eq!(h.session.begin(ViewConfiguration::PrimaryStereo), Err(Error::SessionNotReady));
}

#[test]
fn test_request_exit_needs_running_session() {
    let h = bound(sync_config());
    assert_eq!(h.session.request_exit(), Err(Error::SessionNotRunning));
}

#[test]
fn test_end_needs_stopping() {
    let h = running(sync_config());
    assert_eq!(h.session.end(), Err(Error::SessionNotStopping));
}

#[test]
fn test_compositor_quit_request_stops_session() {
    let h = running(sync_config());
    run_frame(&h, Vec::new()).unwrap();
    drain(&h.session);

    h.set_status(HmdStatus { should_quit: true, ..PRESENT });
    h.session.update_hmd_status();
    assert_eq!(h.session.state(), SessionState::Stopping);
}

// ============================================================================
// Device binding and swapchains
// ============================================================================

#[test]
fn test_swapchain_needs_requirements_query() {
    let h = harness(sync_config());
    assert_eq!(
        h.session.create_swapchain(&color_desc(1)),
        Err(Error::GraphicsRequirementsCallMissing)
    );
    h.session.graphics_requirements(GraphicsApi::D3D11);
    assert_eq!(
        h.session.create_swapchain(&color_desc(1)),
        Err(Error::GraphicsRequirementsCallMissing)
    );
}

#[test]
fn test_second_bind_is_rejected() {
    let h = bound(sync_config());
    assert_eq!(h.session.bind_device(mock_binding(h.app.clone())), Err(Error::CallOrderInvalid));
}

#[test]
fn test_formats_follow_api_preference() {
    let h = bound(sync_config());
    let formats = h.session.enumerate_formats().unwrap();
    assert_eq!(formats.first(), Some(&29));
    assert!(formats.contains(&40));
}

#[test]
fn test_fast_path_swapchain_is_imported_once() {
    let h = bound(sync_config());
    let handle = h.session.create_swapchain(&color_desc(1)).unwrap();
    assert_eq!(h.compositor.live_swapchains(), 1);
    assert_eq!(h.app.count("import_image"), 3);

    let images = h.session.enumerate_images(handle).unwrap();
    assert_eq!(images.len(), 3);
    assert_eq!(h.app.count("import_image"), 3);
}

#[test]
fn test_invalid_descriptor_creates_nothing() {
    let h = bound(sync_config());
    let desc = SwapchainDesc { face_count: 2, ..color_desc(1) };
    assert_eq!(h.session.create_swapchain(&desc), Err(Error::SwapchainFormatUnsupported));
    assert_eq!(h.session.swapchain_count(), 0);
    assert_eq!(h.compositor.live_swapchains(), 0);
}

#[test]
fn test_unknown_format_is_unsupported() {
    let h = bound(sync_config());
    let desc = SwapchainDesc { format: 9999, ..color_desc(1) };
    assert_eq!(h.session.create_swapchain(&desc), Err(Error::SwapchainFormatUnsupported));
}

#[test]
fn test_import_failure_rolls_back_creation() {
    let h = bound(sync_config());
    h.app.fail_imports.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(matches!(
        h.session.create_swapchain(&color_desc(1)),
        Err(Error::GraphicsDeviceInvalid(_))
    ));
    assert_eq!(h.session.swapchain_count(), 0);
    assert_eq!(h.compositor.live_swapchains(), 0);
}

#[test]
fn test_static_swapchain_acquires_once() {
    let h = bound(sync_config());
    let desc = SwapchainDesc { create_flags: SwapchainCreateFlags::STATIC_IMAGE, ..color_desc(1) };
    let handle = h.session.create_swapchain(&desc).unwrap();
    assert_eq!(h.session.enumerate_images(handle).unwrap().len(), 1);

    render(&h, handle);
    assert_eq!(h.session.acquire_image(handle), Err(Error::CallOrderInvalid));
}

#[test]
fn test_static_swapchain_reuse_when_allowed() {
    let h = bound(RuntimeConfig { allow_static_swapchain_reuse: true, ..sync_config() });
    let desc = SwapchainDesc { create_flags: SwapchainCreateFlags::STATIC_IMAGE, ..color_desc(1) };
    let handle = h.session.create_swapchain(&desc).unwrap();
    assert_eq!(render(&h, handle), 0);
    assert_eq!(render(&h, handle), 0);
}

#[test]
fn test_destroy_swapchain_drains_and_releases() {
    let h = running(sync_config());
    let handle = h.session.create_swapchain(&color_desc(2)).unwrap();
    render(&h, handle);
    run_frame(&h, vec![projection(sub_image(handle, 0), sub_image(handle, 1))]).unwrap();
    assert_eq!(h.compositor.live_swapchains(), 2);

    let flushes = h.submission().count("wait_cpu");
    h.session.destroy_swapchain(handle).unwrap();
    assert!(h.submission().count("wait_cpu") > flushes);
    assert_eq!(h.compositor.live_swapchains(), 0);
    assert_eq!(h.session.destroy_swapchain(handle), Err(Error::HandleInvalid));
}

#[test]
fn test_destroy_swapchain_waits_for_queued_submission() {
    let h = running(RuntimeConfig::default());
    *h.compositor.submit_delay.lock().unwrap() = Duration::from_millis(200);
    let handle = h.session.create_swapchain(&color_desc(1)).unwrap();
    render(&h, handle);
    run_frame(&h, vec![quad(handle)]).unwrap();

    // The frame is still with the worker when the swapchain goes away
    h.session.destroy_swapchain(handle).unwrap();
    assert!(h.compositor.dangling_at_submit.lock().unwrap().is_empty());

    let calls = h.compositor.calls.lock().unwrap().clone();
    let submit = calls.iter().position(|c| c == "submit_frame(0)").unwrap();
    let destroy = calls.iter().position(|c| c.starts_with("destroy_swapchain")).unwrap();
    assert!(submit < destroy);
}

// ============================================================================
// Frame pacing
// ============================================================================

#[test]
fn test_frame_calls_need_running_session() {
    let h = bound(sync_config());
    assert_eq!(h.session.wait_frame(), Err(Error::SessionNotRunning));
    assert_eq!(h.session.begin_frame(), Err(Error::SessionNotRunning));
}

#[test]
fn test_begin_frame_needs_wait() {
    let h = running(sync_config());
    assert_eq!(h.session.begin_frame(), Err(Error::CallOrderInvalid));

    h.session.wait_frame().unwrap();
    assert_eq!(h.session.begin_frame(), Ok(false));
    assert_eq!(h.session.begin_frame(), Err(Error::CallOrderInvalid));
}

#[test]
fn test_second_begin_discards_previous_frame() {
    let h = running(sync_config());
    h.session.wait_frame().unwrap();
    h.session.begin_frame().unwrap();
    let state = h.session.wait_frame().unwrap();
    assert_eq!(h.session.begin_frame(), Ok(true));
    h.session
        .end_frame(&FrameEndInfo { display_time: state.predicted_display_time, layers: Vec::new() })
        .unwrap();
    assert_eq!(h.session.frame_counters(), FrameCounters { waited: 2, begun: 2, completed: 2 });
}

#[test]
fn test_end_frame_needs_begin() {
    let h = running(sync_config());
    let state = h.session.wait_frame().unwrap();
    assert_eq!(
        h.session.end_frame(&FrameEndInfo { display_time: state.predicted_display_time, layers: Vec::new() }),
        Err(Error::CallOrderInvalid)
    );
}

#[test]
fn test_predicted_display_time_strictly_increases() {
    let h = running(sync_config());
    let mut last = 0;
    for _ in 0..6 {
        let state = h.session.wait_frame().unwrap();
        assert!(state.predicted_display_time > last);
        assert_eq!(state.predicted_display_period, 11_111_000);
        last = state.predicted_display_time;
        h.session.begin_frame().unwrap();
        h.session
            .end_frame(&FrameEndInfo { display_time: state.predicted_display_time, layers: Vec::new() })
            .unwrap();
    }
}

#[test]
fn test_sync_submission_calls_compositor_in_order() {
    let h = running(sync_config());
    run_frame(&h, Vec::new()).unwrap();
    let calls = h.compositor.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec!["wait_to_begin_frame(0)".to_string(), "begin_frame(0)".to_string(), "submit_frame(0)".to_string()]
    );
}

#[test]
fn test_deferred_frame_wait_moves_to_begin_frame() {
    let h = running(RuntimeConfig { defer_frame_wait: true, ..sync_config() });
    h.session.wait_frame().unwrap();
    assert_eq!(h.compositor.count("wait_to_begin_frame"), 0);
    h.session.begin_frame().unwrap();
    assert_eq!(h.compositor.count("wait_to_begin_frame"), 1);
}

#[test]
fn test_locked_framerate_keeps_wait_in_wait_frame() {
    let h = running(RuntimeConfig { defer_frame_wait: true, lock_framerate: true, ..sync_config() });
    h.session.wait_frame().unwrap();
    assert_eq!(h.compositor.count("wait_to_begin_frame"), 1);
}

#[test]
fn test_empty_frame_submits_disabled_layer() {
    let h = running(sync_config());
    run_frame(&h, Vec::new()).unwrap();
    assert_eq!(h.compositor.last_submission(), Some((0, vec![CompositorLayer::Disabled])));
}

#[test]
fn test_sync_gpu_work_flushes_submission_device() {
    let h = running(RuntimeConfig { sync_gpu_work_in_end_frame: true, ..sync_config() });
    run_frame(&h, Vec::new()).unwrap();
    assert_eq!(h.submission().count("wait_cpu"), 1);
}

#[test]
fn test_async_submission_hands_frame_to_worker() {
    let h = running(RuntimeConfig::default());
    assert!(h.session.uses_async_submission());
    run_frame(&h, Vec::new()).unwrap();
    h.session.destroy();

    assert_eq!(h.compositor.count("submit_frame"), 1);
    assert_eq!(h.compositor.last_submission().map(|(id, _)| id), Some(0));
}

#[test]
fn test_shared_device_submits_synchronously() {
    let caps = DeviceCapabilities { context_state: true, ..DeviceCapabilities::default() };
    let h = harness_with(
        RuntimeConfig { use_application_device_for_submission: true, ..RuntimeConfig::default() },
        caps,
    );
    h.session.graphics_requirements(GraphicsApi::D3D11);
    h.session.bind_device(mock_binding(h.app.clone())).unwrap();
    h.session.begin(ViewConfiguration::PrimaryStereo).unwrap();

    assert!(!h.session.uses_async_submission());
    assert!(h.factory.last().is_none());
}

// ============================================================================
// End-of-frame composition
// ============================================================================

#[test]
fn test_msaa_depth_resolves_and_commits_once() {
    let h = running(sync_config());
    let handle = h.session.create_swapchain(&msaa_depth_desc()).unwrap();
    assert_eq!(render(&h, handle), 0);

    run_frame(&h, vec![quad(handle)]).unwrap();
    assert_eq!(h.submission().count("resolve_depth"), 1);
    assert_eq!(h.compositor.count("commit"), 1);

    // Same generation again: no GPU work, no second commit
    run_frame(&h, vec![quad(handle)]).unwrap();
    assert_eq!(h.submission().count("resolve_depth"), 1);
    assert_eq!(h.compositor.count("commit"), 1);
}

#[test]
fn test_new_release_resolves_again() {
    let h = running(sync_config());
    let handle = h.session.create_swapchain(&msaa_depth_desc()).unwrap();
    render(&h, handle);
    run_frame(&h, vec![quad(handle)]).unwrap();
    assert_eq!(render(&h, handle), 1);
    run_frame(&h, vec![quad(handle)]).unwrap();
    assert_eq!(h.submission().count("resolve_depth"), 2);
    assert_eq!(h.compositor.count("commit"), 2);
}

#[test]
fn test_app_work_is_ordered_before_resolve() {
    let h = running(sync_config());
    let handle = h.session.create_swapchain(&msaa_depth_desc()).unwrap();
    render(&h, handle);
    run_frame(&h, vec![quad(handle)]).unwrap();

    let calls = h.submission().calls();
    let wait = calls.iter().position(|c| c.starts_with("wait(")).unwrap();
    let resolve = calls.iter().position(|c| c.starts_with("resolve_depth")).unwrap();
    assert!(wait < resolve);
}

#[test]
fn test_array_projection_copies_second_slice() {
    let h = running(sync_config());
    let handle = h.session.create_swapchain(&color_desc(2)).unwrap();
    render(&h, handle);

    run_frame(&h, vec![projection(sub_image(handle, 0), sub_image(handle, 1))]).unwrap();
    assert_eq!(h.submission().count("copy_slice"), 1);
    assert_eq!(h.compositor.count("commit"), 2);

    let (_, layers) = h.compositor.last_submission().unwrap();
    match &layers[0] {
        CompositorLayer::EyeFov { color, depth, .. } => {
            assert_ne!(color[0].swapchain, color[1].swapchain);
            assert_eq!(color[1].rect, Rect2D::new(0, 0, 1024, 1024));
            assert!(depth.is_none());
        }
        other => panic!("expected an eye layer, got {:?}", other),
    }
}

#[test]
fn test_shared_slice_is_prepared_once_per_frame() {
    let h = running(sync_config());
    let handle = h.session.create_swapchain(&color_desc(2)).unwrap();
    render(&h, handle);

    let layers = vec![
        projection(sub_image(handle, 1), sub_image(handle, 1)),
        CompositionLayer::Quad {
            sub_image: sub_image(handle, 1),
            pose: Pose::IDENTITY,
            size: Vec2::ONE,
            head_locked: true,
            flags: LayerFlags::empty(),
        },
    ];
    run_frame(&h, layers).unwrap();
    assert_eq!(h.submission().count("copy_slice"), 1);
    assert_eq!(h.compositor.count("commit"), 1);

    let (_, submitted) = h.compositor.last_submission().unwrap();
    assert!(matches!(
        &submitted[1],
        CompositorLayer::Quad { flags, .. } if flags.contains(LayerFlags::HEAD_LOCKED)
    ));
}

#[test]
fn test_projection_depth_is_forwarded() {
    let h = running(sync_config());
    let color = h.session.create_swapchain(&color_desc(2)).unwrap();
    let depth = h.session.create_swapchain(&SwapchainDesc { array_size: 2, ..msaa_depth_desc() }).unwrap();
    render(&h, color);
    render(&h, depth);

    let depth_info = |slice| DepthInfo {
        sub_image: sub_image(depth, slice),
        min_depth: 0.0,
        max_depth: 1.0,
        near_z: 0.1,
        far_z: 100.0,
    };
    let mut layer = projection(sub_image(color, 0), sub_image(color, 1));
    if let CompositionLayer::Projection { views, .. } = &mut layer {
        views[0].depth = Some(depth_info(0));
        views[1].depth = Some(depth_info(1));
    }
    run_frame(&h, vec![layer]).unwrap();
    assert_eq!(h.submission().count("resolve_depth"), 2);

    let (_, layers) = h.compositor.last_submission().unwrap();
    assert!(matches!(&layers[0], CompositorLayer::EyeFov { depth: Some(d), .. } if d[1].far_z == 100.0));
}

#[test]
fn test_invalid_layers_do_no_work() {
    let h = running(sync_config());
    let handle = h.session.create_swapchain(&msaa_depth_desc()).unwrap();
    let state = h.session.wait_frame().unwrap();
    h.session.begin_frame().unwrap();

    let result = h.session.end_frame(&FrameEndInfo {
        display_time: state.predicted_display_time,
        layers: vec![quad(handle)],
    });
    assert!(matches!(result, Err(Error::LayerInvalid(_))));
    assert_eq!(h.submission().count("resolve_depth"), 0);
    assert_eq!(h.session.frame_counters().completed, 0);
}

#[test]
fn test_precomposition_writes_both_eyes() {
    let h = running(RuntimeConfig { precomposition_enabled: true, ..sync_config() });
    let handle = h.session.create_swapchain(&color_desc(2)).unwrap();
    render(&h, handle);

    let mut left = sub_image(handle, 0);
    let mut right = sub_image(handle, 1);
    left.image_rect = Rect2D::new(0, 0, 512, 512);
    right.image_rect = Rect2D::new(0, 0, 512, 512);
    run_frame(&h, vec![projection(left, right)]).unwrap();

    assert_eq!(h.submission().count("precompose"), 2);
    assert!(h.submission().calls().contains(&"precompose(0.70)".to_string()));
    // Application swapchain, slice 1, two eyes
    assert_eq!(h.compositor.live_swapchains(), 4);

    let (_, layers) = h.compositor.last_submission().unwrap();
    let CompositorLayer::EyeFov { color, .. } = &layers[0] else {
        panic!("expected an eye layer");
    };
    assert_eq!(h.compositor.commits(color[0].swapchain), 1);
    assert_eq!(color[0].rect, Rect2D::new(0, 0, 512, 512));

    // Same size next frame: targets are reused
    render(&h, handle);
    run_frame(&h, vec![projection(left, right)]).unwrap();
    assert_eq!(h.compositor.live_swapchains(), 4);
}

#[test]
fn test_precomposition_targets_per_projection_layer() {
    let h = running(RuntimeConfig { precomposition_enabled: true, ..sync_config() });
    let handle = h.session.create_swapchain(&color_desc(2)).unwrap();
    render(&h, handle);

    let half = |slice| SubImage { image_rect: Rect2D::new(0, 0, 512, 512), ..sub_image(handle, slice) };
    let full = projection(sub_image(handle, 0), sub_image(handle, 1));
    let small = projection(half(0), half(1));
    run_frame(&h, vec![full.clone(), small.clone()]).unwrap();

    assert_eq!(h.submission().count("precompose"), 4);
    // Application swapchain, slice 1, two eye pairs
    assert_eq!(h.compositor.live_swapchains(), 6);
    let (_, layers) = h.compositor.last_submission().unwrap();
    let eyes: Vec<_> = layers
        .iter()
        .map(|layer| match layer {
            CompositorLayer::EyeFov { color, .. } => *color,
            other => panic!("expected an eye layer, got {:?}", other),
        })
        .collect();
    assert_ne!(eyes[0][0].swapchain, eyes[1][0].swapchain);
    assert_eq!(eyes[0][0].rect, Rect2D::new(0, 0, 1024, 1024));
    assert_eq!(eyes[1][1].rect, Rect2D::new(0, 0, 512, 512));

    // Both sizes again: every pair is reused
    render(&h, handle);
    run_frame(&h, vec![full, small.clone()]).unwrap();
    assert_eq!(h.compositor.count("create_swapchain"), 6);

    // Only the small layer left: the full-size pair is released
    render(&h, handle);
    run_frame(&h, vec![small]).unwrap();
    assert_eq!(h.compositor.live_swapchains(), 4);
    assert_eq!(h.compositor.count("create_swapchain"), 6);
}

#[test]
fn test_precomposition_without_sharpening_passes_zero() {
    let caps = DeviceCapabilities { context_state: true, sharpening: false, ..DeviceCapabilities::default() };
    let h = harness_with(
        RuntimeConfig {
            use_application_device_for_submission: true,
            precomposition_enabled: true,
            ..sync_config()
        },
        caps,
    );
    h.session.graphics_requirements(GraphicsApi::D3D11);
    h.session.bind_device(mock_binding(h.app.clone())).unwrap();
    h.session.begin(ViewConfiguration::PrimaryStereo).unwrap();
    let handle = h.session.create_swapchain(&color_desc(2)).unwrap();
    render(&h, handle);

    run_frame(&h, vec![projection(sub_image(handle, 0), sub_image(handle, 1))]).unwrap();
    assert_eq!(h.app.count("precompose"), 2);
    assert!(h.app.calls().iter().filter(|c| c.starts_with("precompose")).all(|c| c == "precompose(0.00)"));
}

// ============================================================================
// Telemetry and teardown
// ============================================================================

#[test]
fn test_frame_loop_emits_trace_events() {
    let h = running(sync_config());
    let handle = h.session.create_swapchain(&msaa_depth_desc()).unwrap();
    render(&h, handle);
    run_frame(&h, vec![quad(handle)]).unwrap();

    assert_eq!(h.trace.count("xrAcquireSwapchainImage"), 1);
    assert_eq!(h.trace.count("WaitFrame"), 1);
    assert_eq!(h.trace.count("BeginFrame"), 1);
    assert_eq!(h.trace.count("EndFrame"), 1);
    assert_eq!(h.trace.count("Resolve"), 1);
    assert_eq!(h.trace.count("Commit"), 1);
    assert!(h.trace.count("SessionStateChanged") >= 1);
    assert_eq!(h.session.fps(), 1);
}

#[test]
fn test_destroy_tears_everything_down() {
    let h = running(RuntimeConfig::default());
    let handle = h.session.create_swapchain(&color_desc(2)).unwrap();
    render(&h, handle);
    run_frame(&h, vec![projection(sub_image(handle, 0), sub_image(handle, 1))]).unwrap();

    h.session.destroy();
    assert!(!h.session.uses_async_submission());
    assert_eq!(h.session.swapchain_count(), 0);
    assert_eq!(h.compositor.live_swapchains(), 0);
    assert!(h.session.device_context().is_none());
    assert!(h.app.count("wait_cpu") >= 1);

    // Second call is a no-op
    h.session.destroy();
}

#[test]
fn test_destroy_continues_past_failed_compositor_destroy() {
    let h = running(sync_config());
    let array = h.session.create_swapchain(&color_desc(2)).unwrap();
    let single = h.session.create_swapchain(&color_desc(1)).unwrap();
    render(&h, array);
    render(&h, single);
    run_frame(&h, vec![projection(sub_image(array, 0), sub_image(array, 1)), quad(single)]).unwrap();
    assert_eq!(h.compositor.live_swapchains(), 3);

    let (_, layers) = h.compositor.last_submission().unwrap();
    let CompositorLayer::EyeFov { color, .. } = &layers[0] else {
        panic!("expected an eye layer");
    };
    *h.compositor.fail_destroy.lock().unwrap() = Some(color[0].swapchain);

    h.session.destroy();
    assert_eq!(h.compositor.count("destroy_swapchain"), 3);
    assert_eq!(h.compositor.live_swapchains(), 1);
    assert_eq!(h.session.swapchain_count(), 0);
    assert_eq!(h.session.swapchains.lock().unwrap().provisioner.import_count(), 0);
    assert!(h.session.device_context().is_none());
}
