/// GpuContext - Shared GPU state for all Vulkan objects of one device
///
/// Contains everything needed for GPU operations:
/// - Device for Vulkan API calls
/// - Allocator for memory management
/// - Queue and the command recorder that feeds it
/// - External handle loaders for cross-device sharing

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use std::mem::ManuallyDrop;
use std::sync::{Mutex, MutexGuard};
use xr_bridge::bridge::Result;
use xr_bridge::bridge_err;

use crate::vulkan_external::ExternalHandles;

pub(crate) const SOURCE: &str = "xr_bridge::vulkan";

/// Lock a mutex, turning poisoning into a backend error
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| bridge_err!(SOURCE, "{} lock poisoned", what))
}

/// Object kept alive until the GPU is done with the commands that use it
pub(crate) enum Retired {
    View(vk::ImageView),
    /// Intermediate image with its memory
    Scratch(vk::Image, Allocation),
    /// Staging buffer with its memory
    Staging(vk::Buffer, Allocation),
}

struct InFlight {
    progress_value: u64,
    command_buffer: Option<vk::CommandBuffer>,
    retired: Vec<Retired>,
}

/// Command buffer being recorded plus everything waiting for the next submit
///
/// All queue submissions of a context go through here, which is what keeps
/// `vkQueueSubmit` externally synchronized.
pub(crate) struct Recorder {
    command_pool: vk::CommandPool,
    current: Option<vk::CommandBuffer>,
    pending_waits: Vec<(vk::Semaphore, u64)>,
    retired: Vec<Retired>,
    in_flight: Vec<InFlight>,
    progress_value: u64,
}

/// Shared GPU context for all Vulkan resources of one device
///
/// Images, fences and timers hold an `Arc<GpuContext>`, so the device
/// outlives every object created from it.
pub struct GpuContext {
    /// Vulkan logical device
    pub device: ash::Device,

    /// GPU memory allocator
    /// Wrapped in ManuallyDrop to ensure it's dropped BEFORE the device is destroyed
    pub allocator: ManuallyDrop<Mutex<Allocator>>,

    pub physical_device: vk::PhysicalDevice,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,

    pub queue: vk::Queue,
    pub queue_family: u32,

    pub(crate) external: ExternalHandles,

    recorder: Mutex<Recorder>,

    /// Timeline semaphore signaled by every submit, used to recycle command buffers
    progress: vk::Semaphore,

    instance: ash::Instance,

    /// Device and instance were created here (false when wrapping an application device)
    owned: bool,

    /// Debug utils loader (for validation layers)
    pub(crate) debug_utils_loader: Option<ash::ext::debug_utils::Instance>,

    /// Debug messenger handle
    pub(crate) debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

/// Raw Vulkan objects a context is built from
pub(crate) struct ContextParts {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family: u32,
    pub queue_index: u32,
    pub owned: bool,
    pub debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl GpuContext {
    /// Create the allocator, command pool and progress semaphore around a device
    ///
    /// # Safety
    ///
    /// `parts.device` must have been created from `parts.physical_device` with
    /// timeline semaphores, dynamic rendering and the external handle extensions enabled.
    pub(crate) unsafe fn new(parts: ContextParts) -> Result<Self> {
        let ContextParts {
            instance,
            physical_device,
            device,
            queue_family,
            queue_index,
            owned,
            debug_utils_loader,
            debug_messenger,
        } = parts;

        let queue = device.get_device_queue(queue_family, queue_index);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let timestamp_period = instance
            .get_physical_device_properties(physical_device)
            .limits
            .timestamp_period;

        let allocator = Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| bridge_err!(SOURCE, "Failed to create GPU allocator: {:?}", e))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = device
            .create_command_pool(&pool_info, None)
            .map_err(|e| bridge_err!(SOURCE, "Failed to create command pool: {:?}", e))?;

        let mut timeline = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline);
        let progress = device
            .create_semaphore(&semaphore_info, None)
            .map_err(|e| bridge_err!(SOURCE, "Failed to create progress semaphore: {:?}", e))?;

        let external = ExternalHandles::new(&instance, &device);

        Ok(Self {
            device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            physical_device,
            memory_properties,
            timestamp_period,
            queue,
            queue_family,
            external,
            recorder: Mutex::new(Recorder {
                command_pool,
                current: None,
                pending_waits: Vec::new(),
                retired: Vec::new(),
                in_flight: Vec::new(),
                progress_value: 0,
            }),
            progress,
            instance,
            owned,
            debug_utils_loader,
            debug_messenger,
        })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Memory type index satisfying `type_bits` and `flags`
    pub(crate) fn memory_type_index(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
        })
    }

    // ===== RECORDING =====

    /// Record into the open command buffer, opening one if needed
    pub(crate) fn record<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let mut recorder = lock(&self.recorder, "Recorder")?;
        let command_buffer = match recorder.current {
            Some(command_buffer) => command_buffer,
            None => {
                let command_buffer = unsafe { self.begin_command_buffer(recorder.command_pool)? };
                recorder.current = Some(command_buffer);
                command_buffer
            }
        };
        f(&self.device, command_buffer)
    }

    unsafe fn begin_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = self
            .device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| bridge_err!(SOURCE, "Failed to allocate command buffer: {:?}", e))?
            .into_iter()
            .next()
            .ok_or_else(|| bridge_err!(SOURCE, "Driver returned no command buffer"))?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(|e| bridge_err!(SOURCE, "Failed to begin command buffer: {:?}", e))?;
        Ok(command_buffer)
    }

    /// Keep `object` alive until the commands recorded so far have executed
    pub(crate) fn retire(&self, object: Retired) -> Result<()> {
        lock(&self.recorder, "Recorder")?.retired.push(object);
        Ok(())
    }

    /// Make later submissions wait for `semaphore` to reach `value`
    ///
    /// Work already recorded is submitted first so it does not wait.
    pub(crate) fn add_wait(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        let mut recorder = lock(&self.recorder, "Recorder")?;
        if recorder.current.is_some() {
            self.submit_locked(&mut recorder, None)?;
        }
        recorder.pending_waits.push((semaphore, value));
        Ok(())
    }

    /// Submit recorded work and pending waits, optionally signaling a timeline value after it
    pub(crate) fn submit(&self, signal: Option<(vk::Semaphore, u64)>) -> Result<()> {
        let mut recorder = lock(&self.recorder, "Recorder")?;
        self.submit_locked(&mut recorder, signal)
    }

    fn submit_locked(&self, recorder: &mut Recorder, signal: Option<(vk::Semaphore, u64)>) -> Result<()> {
        if recorder.current.is_none() && recorder.pending_waits.is_empty() && signal.is_none() {
            return Ok(());
        }

        let command_buffer = recorder.current.take();
        if let Some(command_buffer) = command_buffer {
            unsafe {
                self.device
                    .end_command_buffer(command_buffer)
                    .map_err(|e| bridge_err!(SOURCE, "Failed to end command buffer: {:?}", e))?;
            }
        }

        recorder.progress_value += 1;
        let (wait_semaphores, wait_values): (Vec<_>, Vec<_>) = recorder.pending_waits.drain(..).unzip();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];

        let mut signal_semaphores = vec![self.progress];
        let mut signal_values = vec![recorder.progress_value];
        if let Some((semaphore, value)) = signal {
            signal_semaphores.push(semaphore);
            signal_values.push(value);
        }

        let command_buffers: Vec<vk::CommandBuffer> = command_buffer.into_iter().collect();
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())
                .map_err(|e| bridge_err!(SOURCE, "Failed to submit commands to GPU queue: {:?}", e))?;
        }

        let retired = std::mem::take(&mut recorder.retired);
        let progress_value = recorder.progress_value;
        recorder.in_flight.push(InFlight { progress_value, command_buffer, retired });
        self.collect_locked(recorder, false);
        Ok(())
    }

    /// Free command buffers and retired objects whose work has completed
    fn collect_locked(&self, recorder: &mut Recorder, all: bool) {
        let reached = if all {
            u64::MAX
        } else {
            unsafe { self.device.get_semaphore_counter_value(self.progress) }.unwrap_or(0)
        };
        let (done, pending): (Vec<InFlight>, Vec<InFlight>) = recorder
            .in_flight
            .drain(..)
            .partition(|entry| entry.progress_value <= reached);
        recorder.in_flight = pending;

        for entry in done {
            unsafe {
                if let Some(command_buffer) = entry.command_buffer {
                    self.device.free_command_buffers(recorder.command_pool, &[command_buffer]);
                }
                for object in entry.retired {
                    self.destroy_retired(object);
                }
            }
        }
    }

    unsafe fn destroy_retired(&self, object: Retired) {
        match object {
            Retired::View(view) => self.device.destroy_image_view(view, None),
            Retired::Scratch(image, allocation) => {
                if let Ok(mut allocator) = self.allocator.lock() {
                    allocator.free(allocation).ok();
                }
                self.device.destroy_image(image, None);
            }
            Retired::Staging(buffer, allocation) => {
                if let Ok(mut allocator) = self.allocator.lock() {
                    allocator.free(allocation).ok();
                }
                self.device.destroy_buffer(buffer, None);
            }
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            if let Ok(mut recorder) = self.recorder.lock() {
                if let Some(command_buffer) = recorder.current.take() {
                    self.device.free_command_buffers(recorder.command_pool, &[command_buffer]);
                }
                for object in std::mem::take(&mut recorder.retired) {
                    self.destroy_retired(object);
                }
                self.collect_locked(&mut recorder, true);
                self.device.destroy_command_pool(recorder.command_pool, None);
            }
            self.device.destroy_semaphore(self.progress, None);

            // Allocator must go before the device
            ManuallyDrop::drop(&mut self.allocator);

            if !self.owned {
                return;
            }

            self.device.destroy_device(None);
            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
