/// Ring of GPU timers read back with a fixed latency
///
/// A timer is always queried before it is restarted, so measurements arrive
/// `GPU_TIMER_LATENCY` frames late and reading never stalls the GPU.

use std::sync::Arc;

use crate::error::Result;
use crate::graphics_device::{GpuTimer, GraphicsDevice};

/// Number of timers per ring (frames of readback latency)
pub const GPU_TIMER_LATENCY: usize = 3;

pub struct GpuTimerRing {
    timers: Vec<Arc<dyn GpuTimer>>,
}

impl GpuTimerRing {
    pub fn new(device: &dyn GraphicsDevice) -> Result<Self> {
        let timers = (0..GPU_TIMER_LATENCY)
            .map(|_| device.create_timer())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { timers })
    }

    fn slot(&self, frame_index: u64) -> &Arc<dyn GpuTimer> {
        &self.timers[(frame_index % self.timers.len() as u64) as usize]
    }

    /// Read the previous measurement of this slot, then start a new one
    pub fn restart(&self, frame_index: u64) -> Result<u64> {
        let timer = self.slot(frame_index);
        let last = timer.query()?;
        timer.start()?;
        Ok(last)
    }

    pub fn stop(&self, frame_index: u64) -> Result<()> {
        self.slot(frame_index).stop()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
#[path = "gpu_timer_tests.rs"]
mod tests;
