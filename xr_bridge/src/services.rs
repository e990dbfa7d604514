//! External services consumed by the runtime
//!
//! - [`TraceSink`]: fire-and-forget telemetry events (never blocks the hot path)
//! - [`TrackingProvider`]: headset presence/visibility status
//!
//! Poses and field-of-view types shared with the compositor boundary also live here.

use glam::{Quat, Vec3};
use std::sync::Mutex;

// ===== GEOMETRY =====

/// Rigid transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    /// Orientation must be a unit quaternion (1% tolerance on the squared length)
    pub fn is_normalized(&self) -> bool {
        (self.orientation.length_squared() - 1.0).abs() <= 0.01
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Field of view as half-angles in radians (left and down are negative)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    /// Tangent form consumed by the compositor: (left, right, up, down), all positive
    pub fn tangents(&self) -> [f32; 4] {
        [
            -self.angle_left.tan(),
            self.angle_right.tan(),
            self.angle_up.tan(),
            -self.angle_down.tan(),
        ]
    }
}

// ===== TRACING =====

/// Value attached to a trace event field
#[derive(Debug, Clone, PartialEq)]
pub enum TraceValue {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
}

/// One telemetry event
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub name: &'static str,
    pub fields: Vec<(&'static str, TraceValue)>,
}

impl TraceEvent {
    pub fn new(name: &'static str) -> Self {
        Self { name, fields: Vec::new() }
    }

    pub fn with(mut self, key: &'static str, value: TraceValue) -> Self {
        self.fields.push((key, value));
        self
    }

    pub fn field(&self, key: &str) -> Option<&TraceValue> {
        self.fields.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// Telemetry sink
///
/// Implementations must not block: the runtime emits events from the frame loop.
pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Discards every event
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn emit(&self, _event: TraceEvent) {}
}

/// Keeps every event in memory, for tests and diagnostics tools
#[derive(Default)]
pub struct RecordingTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.name == name).count())
            .unwrap_or(0)
    }
}

impl TraceSink for RecordingTraceSink {
    fn emit(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

// ===== TRACKING =====

/// Headset status sampled by the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HmdStatus {
    /// Compositor is displaying this application's frames
    pub is_visible: bool,
    /// Headset is on the user's head
    pub hmd_mounted: bool,
    /// Headset is connected
    pub hmd_present: bool,
    /// Display was lost and the session must be torn down
    pub display_lost: bool,
    /// Compositor asked the application to quit
    pub should_quit: bool,
}

/// Headset status provider
pub trait TrackingProvider: Send + Sync {
    fn hmd_status(&self) -> HmdStatus;
}

/// Provider reporting a constant status
pub struct StaticTrackingProvider(pub HmdStatus);

impl TrackingProvider for StaticTrackingProvider {
    fn hmd_status(&self) -> HmdStatus {
        self.0
    }
}

#[cfg(test)]
#[path = "services_tests.rs"]
mod tests;
