/// Cross-device fence protocol
///
/// One timeline fence is created on the submission device and imported into
/// the application device. Every ordering point bumps a single monotonic
/// counter; the source queue signals it and the target queue waits for it.
/// This is the only cross-device ordering primitive in the runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::graphics_device::{Fence, GraphicsDevice, HandleKind};

/// How long a CPU flush may block before the device is declared lost
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue owning side of the fence protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSide {
    Application,
    Submission,
}

pub struct CrossDeviceSynchronizer {
    app_device: Arc<dyn GraphicsDevice>,
    submission_device: Arc<dyn GraphicsDevice>,
    app_fence: Arc<dyn Fence>,
    submission_fence: Arc<dyn Fence>,
    value: Mutex<u64>,
}

fn sync_failure(what: &str, error: Error) -> Error {
    crate::bridge_error!("xr_bridge::Synchronizer", "{}: {}", what, error);
    Error::RuntimeFailure(format!("{}: {}", what, error))
}

impl CrossDeviceSynchronizer {
    /// Create the shared fence on the submission device and import it into the application device
    pub fn new(
        app_device: Arc<dyn GraphicsDevice>,
        submission_device: Arc<dyn GraphicsDevice>,
        kind: HandleKind,
    ) -> Result<Self> {
        let submission_fence = submission_device
            .create_fence()
            .map_err(|e| sync_failure("Failed to create shared fence", e))?;
        let handle = submission_device
            .export_fence(submission_fence.as_ref(), kind)
            .map_err(|e| sync_failure("Failed to export shared fence", e))?;
        let app_fence = app_device
            .import_fence(&handle)
            .map_err(|e| sync_failure("Failed to import shared fence", e))?;

        Ok(Self {
            app_device,
            submission_device,
            app_fence,
            submission_fence,
            value: Mutex::new(0),
        })
    }

    /// Single-device variant: both sides use the same fence
    pub fn single(device: Arc<dyn GraphicsDevice>) -> Result<Self> {
        let fence = device
            .create_fence()
            .map_err(|e| sync_failure("Failed to create fence", e))?;
        Ok(Self {
            app_device: device.clone(),
            submission_device: device,
            app_fence: fence.clone(),
            submission_fence: fence,
            value: Mutex::new(0),
        })
    }

    fn side(&self, side: QueueSide) -> (&dyn GraphicsDevice, &dyn Fence) {
        match side {
            QueueSide::Application => (self.app_device.as_ref(), self.app_fence.as_ref()),
            QueueSide::Submission => (self.submission_device.as_ref(), self.submission_fence.as_ref()),
        }
    }

    fn next_value(&self) -> Result<std::sync::MutexGuard<'_, u64>> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| Error::RuntimeFailure("Fence counter lock poisoned".to_string()))?;
        *value += 1;
        Ok(value)
    }

    /// Order all work enqueued on `source` so far before any later work on `target`
    ///
    /// Returns the fence value used. No CPU blocking.
    pub fn signal_and_wait(&self, source: QueueSide, target: QueueSide) -> Result<u64> {
        let value = self.next_value()?;
        let (source_device, source_fence) = self.side(source);
        let (target_device, target_fence) = self.side(target);

        source_device
            .signal(source_fence, *value)
            .map_err(|e| sync_failure("Failed to signal fence", e))?;
        source_device
            .flush()
            .map_err(|e| sync_failure("Failed to flush before signal", e))?;
        target_device
            .wait(target_fence, *value)
            .map_err(|e| sync_failure("Failed to register fence wait", e))?;

        crate::bridge_trace!("xr_bridge::Synchronizer", "{:?} -> {:?} at {}", source, target, *value);
        Ok(*value)
    }

    /// Block the calling thread until all work enqueued on `side` has completed
    pub fn flush(&self, side: QueueSide) -> Result<()> {
        let value = self.next_value()?;
        let (device, fence) = self.side(side);

        device
            .signal(fence, *value)
            .map_err(|e| sync_failure("Failed to signal fence", e))?;
        device
            .flush()
            .map_err(|e| sync_failure("Failed to submit pending work", e))?;
        device
            .wait_cpu(fence, *value, FLUSH_TIMEOUT)
            .map_err(|e| sync_failure("Failed to wait for fence", e))?;
        Ok(())
    }

    /// Last value handed out
    pub fn current_value(&self) -> u64 {
        self.value.lock().map(|v| *v).unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "synchronizer_tests.rs"]
mod tests;
