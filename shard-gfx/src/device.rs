//! C1 — Device & Lifetime Service.
//!
//! Owns the Vulkan instance/device/queues, a monotonic graphics timeline
//! semaphore, and two deferred-destruction queues: a per-frame-slot queue
//! (flushed once per frame at frame begin, for "at most one frame old"
//! destructions) and a timeline-tagged queue (flushed by `collect_garbage`
//! whenever the GPU-side counter has passed a destroy's target value).
//!
//! Ported from `RHI.Device.cpp`; queue-family selection, required feature
//! chain, and the layered teardown sequence below all mirror that file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::error::{Result, RuntimeError};

type DeferredFn = Box<dyn FnOnce() + Send + 'static>;

struct TimelineEntry {
    value: u64,
    f: DeferredFn,
}

pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: Option<u32>,
    pub transfer: u32,
}

/// Device-owned state behind the submit/present serialization mutex.
struct QueueState {
    graphics_queue: vk::Queue,
}

pub struct Device {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: QueueFamilyIndices,
    queue_state: Mutex<QueueState>,

    graphics_timeline: vk::Semaphore,
    timeline_next_value: AtomicU64,
    timeline_last_issued: AtomicU64,

    deletion_mutex: Mutex<()>,
    timeline_deletion_queue: Mutex<Vec<TimelineEntry>>,
    frame_slot_queues: Mutex<Vec<Vec<DeferredFn>>>,

    thread_pools_mutex: Mutex<Vec<vk::CommandPool>>,

    global_frame: AtomicU64,
}

// SAFETY: all interior mutability is behind parking_lot locks or atomics; the
// raw Vulkan handles themselves are `Copy` opaque integers per ash's design.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    /// Constructs the instance, selects a physical device, creates the
    /// logical device with the feature chain required by the render graph
    /// (dynamic rendering, synchronization2, buffer device address,
    /// descriptor indexing), and creates the graphics timeline semaphore.
    ///
    /// `frames_in_flight` sizes the per-frame-slot deletion queue array.
    pub fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_families: QueueFamilyIndices,
        frames_in_flight: u32,
    ) -> Result<Arc<Self>> {
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };

        let mut timeline_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_info);
        let graphics_timeline = unsafe { device.create_semaphore(&semaphore_info, None) }?;

        let frame_slot_queues = (0..frames_in_flight.max(1)).map(|_| Vec::new()).collect();

        log::info!("Device created (frames_in_flight={frames_in_flight})");

        Ok(Arc::new(Device {
            entry,
            instance,
            physical_device,
            device,
            memory_properties,
            queue_families,
            queue_state: Mutex::new(QueueState { graphics_queue }),
            graphics_timeline,
            timeline_next_value: AtomicU64::new(1),
            timeline_last_issued: AtomicU64::new(0),
            deletion_mutex: Mutex::new(()),
            timeline_deletion_queue: Mutex::new(Vec::new()),
            frame_slot_queues: Mutex::new(frame_slot_queues),
            thread_pools_mutex: Mutex::new(Vec::new()),
            global_frame: AtomicU64::new(0),
        }))
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    pub fn graphics_timeline_semaphore(&self) -> vk::Semaphore {
        self.graphics_timeline
    }

    pub fn global_frame(&self) -> u64 {
        self.global_frame.load(Ordering::Acquire)
    }

    pub fn increment_global_frame(&self) -> u64 {
        self.global_frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Atomically advances the graphics timeline counter and caches it as
    /// "last issued". The caller is expected to submit signaling exactly the
    /// returned value.
    pub fn signal_timeline(&self) -> u64 {
        let value = self.timeline_next_value.fetch_add(1, Ordering::AcqRel);
        self.timeline_last_issued.store(value, Ordering::Release);
        value
    }

    pub fn completed_timeline(&self) -> Result<u64> {
        Ok(unsafe { self.device.get_semaphore_counter_value(self.graphics_timeline) }?)
    }

    pub fn defer_destroy_after(&self, value: u64, f: impl FnOnce() + Send + 'static) {
        let _guard = self.deletion_mutex.lock();
        self.timeline_deletion_queue.lock().push(TimelineEntry { value, f: Box::new(f) });
    }

    /// Shorthand for `defer_destroy_after(last_issued + 1, f)`; if nothing
    /// has ever been signaled the target is 1, since the very first deferred
    /// destroy cannot wait on a timeline value that has never been signaled.
    pub fn defer_destroy(&self, f: impl FnOnce() + Send + 'static) {
        let last_issued = self.timeline_last_issued.load(Ordering::Acquire);
        let target = if last_issued > 0 { last_issued + 1 } else { 1 };
        self.defer_destroy_after(target, f);
    }

    pub fn collect_garbage(&self) -> Result<()> {
        let completed = self.completed_timeline()?;
        let mut queue = self.timeline_deletion_queue.lock();
        let mut ready = Vec::new();
        let mut i = 0;
        while i < queue.len() {
            if queue[i].value <= completed {
                ready.push(queue.remove(i));
            } else {
                i += 1;
            }
        }
        drop(queue);
        for entry in ready {
            (entry.f)();
        }
        Ok(())
    }

    /// Runs and clears the per-frame-slot queue for `slot`; called once per
    /// frame at frame begin for the slot whose fence has just been waited on.
    pub fn flush_slot(&self, slot: usize) {
        let taken = {
            let mut slots = self.frame_slot_queues.lock();
            if slot >= slots.len() {
                return;
            }
            std::mem::take(&mut slots[slot])
        };
        for f in taken {
            f();
        }
    }

    pub fn defer_destroy_frame_slot(&self, slot: usize, f: impl FnOnce() + Send + 'static) {
        let mut slots = self.frame_slot_queues.lock();
        if slot < slots.len() {
            slots[slot].push(Box::new(f));
        }
    }

    /// Drains both deletion queues unconditionally. Caller must ensure the
    /// GPU is idle first; this is only safe during teardown.
    pub fn flush_all(&self) {
        let timeline_entries: Vec<TimelineEntry> = std::mem::take(&mut *self.timeline_deletion_queue.lock());
        for entry in timeline_entries {
            (entry.f)();
        }
        let mut slots = self.frame_slot_queues.lock();
        for slot in slots.iter_mut() {
            for f in std::mem::take(slot) {
                f();
            }
        }
    }

    pub fn submit_to_graphics(&self, submit_info: &vk::SubmitInfo, fence: vk::Fence) -> Result<()> {
        let state = self.queue_state.lock();
        if state.graphics_queue == vk::Queue::null() {
            return Err(RuntimeError::DeviceLost);
        }
        unsafe {
            self.device
                .queue_submit(state.graphics_queue, std::slice::from_ref(submit_info), fence)
        }?;
        Ok(())
    }

    /// Submits to an arbitrary queue (e.g. the transfer queue) while holding
    /// the same mutex that serializes graphics submit/present. Needed because
    /// `select_transfer_family` can fall back to the graphics family, in
    /// which case `queue` aliases `graphics_queue` and `vkQueueSubmit`'s
    /// external-synchronization requirement applies across both call sites.
    pub fn submit_to_transfer(&self, queue: vk::Queue, submit_info: &vk::SubmitInfo, fence: vk::Fence) -> Result<()> {
        let _state = self.queue_state.lock();
        unsafe { self.device.queue_submit(queue, std::slice::from_ref(submit_info), fence) }?;
        Ok(())
    }

    pub fn present(&self, swapchain_loader: &ash::khr::swapchain::Device, present_info: &vk::PresentInfoKHR) -> Result<bool> {
        let state = self.queue_state.lock();
        if state.graphics_queue == vk::Queue::null() {
            return Err(RuntimeError::DeviceLost);
        }
        let suboptimal = unsafe { swapchain_loader.queue_present(state.graphics_queue, present_info) }?;
        Ok(suboptimal)
    }

    pub fn register_thread_local_pool(&self, pool: vk::CommandPool) {
        self.thread_pools_mutex.lock().push(pool);
    }

    /// Queue family selection: prefer a dedicated transfer-only family
    /// (TRANSFER set, GRAPHICS/COMPUTE clear); fall back to any
    /// TRANSFER-capable family; final fallback is the graphics family itself
    /// (every Vulkan graphics queue implicitly supports transfer).
    pub fn select_transfer_family(properties: &[vk::QueueFamilyProperties], graphics_family: u32) -> u32 {
        if let Some((i, _)) = properties.iter().enumerate().find(|(_, p)| {
            p.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !p.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && !p.queue_flags.contains(vk::QueueFlags::COMPUTE)
        }) {
            return i as u32;
        }
        if let Some((i, _)) = properties
            .iter()
            .enumerate()
            .find(|(_, p)| p.queue_flags.contains(vk::QueueFlags::TRANSFER))
        {
            return i as u32;
        }
        graphics_family
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // 1. Ensure no GPU work is in flight.
            let _ = self.device.device_wait_idle();

            // 2-3. Flush both queues, twice: destroying a later-owned
            // subsystem (e.g. the transient allocator, destroyed by its own
            // Drop before this one runs) can enqueue further deferred
            // destroys that must themselves be flushed before the device
            // handle goes away.
            self.flush_all();
            self.flush_all();

            // 4. Destroy the timeline semaphore.
            self.device.destroy_semaphore(self.graphics_timeline, None);

            // 7. Destroy all registered thread-local command pools.
            for pool in self.thread_pools_mutex.lock().drain(..) {
                self.device.destroy_command_pool(pool, None);
            }

            // 9. Destroy the logical device, then the instance.
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            timestamp_valid_bits: 0,
            min_image_transfer_granularity: vk::Extent3D::default(),
        }
    }

    #[test]
    fn prefers_dedicated_transfer_family() {
        let families = vec![
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(Device::select_transfer_family(&families, 0), 1);
    }

    #[test]
    fn falls_back_to_any_transfer_capable_family() {
        let families = vec![family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)];
        assert_eq!(Device::select_transfer_family(&families, 0), 0);
    }

    #[test]
    fn falls_back_to_graphics_family_when_no_other_transfer_support() {
        let families = vec![family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(Device::select_transfer_family(&families, 0), 0);
    }
}
