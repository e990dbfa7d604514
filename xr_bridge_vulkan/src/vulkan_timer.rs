/// GPU timer - timestamp query pool with two queries (start, stop)

use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use xr_bridge::bridge::Result;
use xr_bridge::bridge_err;
use xr_bridge::graphics_device::GpuTimer;

use crate::vulkan_context::{GpuContext, SOURCE};

pub struct VulkanTimer {
    pool: vk::QueryPool,
    /// A stop has been recorded since creation
    stopped: AtomicBool,
    context: Arc<GpuContext>,
}

impl VulkanTimer {
    pub(crate) fn new(context: Arc<GpuContext>) -> Result<Self> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(2);
        let pool = unsafe { context.device.create_query_pool(&create_info, None) }
            .map_err(|e| bridge_err!(SOURCE, "Failed to create timestamp query pool: {:?}", e))?;
        Ok(Self { pool, stopped: AtomicBool::new(false), context })
    }
}

impl GpuTimer for VulkanTimer {
    fn start(&self) -> Result<()> {
        let pool = self.pool;
        self.context.record(|device, command_buffer| {
            unsafe {
                device.cmd_reset_query_pool(command_buffer, pool, 0, 2);
                device.cmd_write_timestamp(command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE, pool, 0);
            }
            Ok(())
        })
    }

    fn stop(&self) -> Result<()> {
        let pool = self.pool;
        self.context.record(|device, command_buffer| {
            unsafe {
                device.cmd_write_timestamp(command_buffer, vk::PipelineStageFlags::BOTTOM_OF_PIPE, pool, 1);
            }
            Ok(())
        })?;
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }

    fn query(&self) -> Result<u64> {
        if !self.stopped.load(Ordering::Acquire) {
            return Ok(0);
        }
        let mut ticks = [0u64; 2];
        let result = unsafe {
            self.context
                .device
                .get_query_pool_results(self.pool, 0, &mut ticks, vk::QueryResultFlags::TYPE_64)
        };
        match result {
            Ok(()) => {
                let nanos = ticks[1].saturating_sub(ticks[0]) as f64 * self.context.timestamp_period as f64;
                Ok((nanos / 1000.0) as u64)
            }
            // Not executed yet
            Err(vk::Result::NOT_READY) => Ok(0),
            Err(e) => Err(bridge_err!(SOURCE, "Failed to read timestamps: {:?}", e)),
        }
    }
}

impl Drop for VulkanTimer {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_query_pool(self.pool, None);
        }
    }
}
