//! Runtime configuration
//!
//! Settings come from an external key/value lookup (registry, command line,
//! environment). This module only reads them: [`RuntimeConfig::from_settings`]
//! turns raw values into the typed knobs the components consume.

use rustc_hash::FxHashMap;

/// A raw setting value
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    /// Interpret as a boolean flag (non-zero integers, "1"/"true" strings)
    pub fn as_bool(&self) -> bool {
        match self {
            SettingValue::Int(v) => *v != 0,
            SettingValue::Float(v) => *v != 0.0,
            SettingValue::Text(s) => matches!(s.trim(), "1" | "true" | "yes" | "on"),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Int(v) => Some(*v as f64),
            SettingValue::Float(v) => Some(*v),
            SettingValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// External settings lookup
pub trait Settings: Send + Sync {
    fn get(&self, key: &str) -> Option<SettingValue>;
}

/// In-memory settings store
#[derive(Debug, Default, Clone)]
pub struct MapSettings {
    values: FxHashMap<String, SettingValue>,
}

impl MapSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: SettingValue) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn set(&mut self, key: &str, value: SettingValue) {
        self.values.insert(key.to_string(), value);
    }
}

impl Settings for MapSettings {
    fn get(&self, key: &str) -> Option<SettingValue> {
        self.values.get(key).cloned()
    }
}

// ===== SETTING KEYS =====

pub const KEY_DISABLE_ASYNC_SUBMISSION: &str = "quirk_disable_async_submission";
pub const KEY_SYNC_GPU_WORK_IN_END_FRAME: &str = "quirk_sync_gpu_work_in_end_frame";
pub const KEY_USE_APPLICATION_DEVICE_FOR_SUBMISSION: &str =
    "quirk_use_application_device_for_submission";
pub const KEY_DISABLE_RUNNING_START: &str = "quirk_disable_running_start";
pub const KEY_LOCK_FRAMERATE: &str = "lock_framerate";
pub const KEY_DEFER_FRAME_WAIT: &str = "defer_frame_wait";
pub const KEY_ALLOW_STATIC_SWAPCHAIN_REUSE: &str = "allow_static_swapchain_reuse";
pub const KEY_SLOW_PATH_FOR_CUBEMAPS: &str = "slow_path_for_cubemaps";
pub const KEY_SLOW_PATH_FOR_MULTISAMPLE: &str = "slow_path_for_multisample";
pub const KEY_FORCE_SLOW_PATH: &str = "force_slow_path";
pub const KEY_VENDOR_REQUIRES_NAMED_HANDLES: &str = "vendor_requires_named_handles";
pub const KEY_CUBEMAP_LAYERS_SUPPORTED: &str = "cubemap_layers_supported";
pub const KEY_PRECOMPOSITION_ENABLED: &str = "precomposition_enabled";
pub const KEY_SHARPEN_FACTOR: &str = "sharpen_factor";

/// Conditions under which a swapchain bypasses the compositor's own image pools
///
/// These triggers are hardware workarounds, so they are data rather than constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowPathPolicy {
    /// Cubemaps (face count 6) are self-allocated
    pub cubemaps: bool,
    /// Multisampled swapchains are self-allocated
    pub multisample: bool,
    /// The vendor requires name-based shared handles the compositor cannot hand out
    pub vendor_requires_named_handles: bool,
    /// Every swapchain is self-allocated
    pub always: bool,
}

impl Default for SlowPathPolicy {
    fn default() -> Self {
        Self {
            cubemaps: true,
            multisample: true,
            vendor_requires_named_handles: false,
            always: false,
        }
    }
}

/// Typed runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Never spawn the async submission worker
    pub disable_async_submission: bool,
    /// CPU-wait on the submission device at the end of every frame
    pub sync_gpu_work_in_end_frame: bool,
    /// Reuse the application device for compositor submission when it is capable
    pub use_application_device_for_submission: bool,
    /// Let wait_frame return before the worker is fully idle
    pub running_start: bool,
    /// Frame pacing locked to the compositor's refresh rate
    pub lock_framerate: bool,
    /// Defer the compositor wait from wait_frame to begin_frame
    pub defer_frame_wait: bool,
    /// Allow a static swapchain to be acquired more than once
    pub allow_static_swapchain_reuse: bool,
    /// Compositor accepts six-face cubemap swapchains
    pub cubemap_layers_supported: bool,
    /// Self-allocation triggers
    pub slow_path: SlowPathPolicy,
    /// Precompose stereo projection layers into dedicated slices
    pub precomposition_enabled: bool,
    /// Sharpening strength for precomposition, clamped to [0, 1]
    pub sharpen_factor: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            disable_async_submission: false,
            sync_gpu_work_in_end_frame: false,
            use_application_device_for_submission: false,
            running_start: true,
            lock_framerate: false,
            defer_frame_wait: false,
            allow_static_swapchain_reuse: false,
            cubemap_layers_supported: true,
            slow_path: SlowPathPolicy::default(),
            precomposition_enabled: false,
            sharpen_factor: 0.7,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from the settings lookup, falling back to defaults
    pub fn from_settings(settings: &dyn Settings) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            settings.get(key).map(|v| v.as_bool()).unwrap_or(default)
        };

        let sharpen_factor = settings
            .get(KEY_SHARPEN_FACTOR)
            .and_then(|v| v.as_f64())
            .map(|v| (v as f32).clamp(0.0, 1.0))
            .unwrap_or(defaults.sharpen_factor);

        Self {
            disable_async_submission: flag(
                KEY_DISABLE_ASYNC_SUBMISSION,
                defaults.disable_async_submission,
            ),
            sync_gpu_work_in_end_frame: flag(
                KEY_SYNC_GPU_WORK_IN_END_FRAME,
                defaults.sync_gpu_work_in_end_frame,
            ),
            use_application_device_for_submission: flag(
                KEY_USE_APPLICATION_DEVICE_FOR_SUBMISSION,
                defaults.use_application_device_for_submission,
            ),
            running_start: !flag(KEY_DISABLE_RUNNING_START, !defaults.running_start),
            lock_framerate: flag(KEY_LOCK_FRAMERATE, defaults.lock_framerate),
            defer_frame_wait: flag(KEY_DEFER_FRAME_WAIT, defaults.defer_frame_wait),
            allow_static_swapchain_reuse: flag(
                KEY_ALLOW_STATIC_SWAPCHAIN_REUSE,
                defaults.allow_static_swapchain_reuse,
            ),
            cubemap_layers_supported: flag(
                KEY_CUBEMAP_LAYERS_SUPPORTED,
                defaults.cubemap_layers_supported,
            ),
            slow_path: SlowPathPolicy {
                cubemaps: flag(KEY_SLOW_PATH_FOR_CUBEMAPS, defaults.slow_path.cubemaps),
                multisample: flag(KEY_SLOW_PATH_FOR_MULTISAMPLE, defaults.slow_path.multisample),
                vendor_requires_named_handles: flag(
                    KEY_VENDOR_REQUIRES_NAMED_HANDLES,
                    defaults.slow_path.vendor_requires_named_handles,
                ),
                always: flag(KEY_FORCE_SLOW_PATH, defaults.slow_path.always),
            },
            precomposition_enabled: flag(
                KEY_PRECOMPOSITION_ENABLED,
                defaults.precomposition_enabled,
            ),
            sharpen_factor,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
