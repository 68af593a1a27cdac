//! C4 — Transfer Manager.
//!
//! Owns the transfer queue and a dedicated timeline semaphore (independent
//! from C1's graphics timeline). Vends one-time-submit primary command
//! buffers from per-thread transient command pools, registered with the
//! device so they are destroyed centrally at teardown. Embeds a private
//! [`StagingBelt`] (C3) sized per `RuntimeConfig::staging_belt_size`.
//!
//! Ported from `RHI.Transfer.cpp`.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::device::Device;
use crate::error::{Result, RuntimeError};
use crate::staging::StagingBelt;

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct TransferToken(pub u64);

impl TransferToken {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

struct PendingBatch {
    token: TransferToken,
    staging_buffers: Vec<vk::Buffer>,
}

thread_local! {
    static THREAD_POOL: RefCell<Option<(usize, vk::CommandPool)>> = const { RefCell::new(None) };
}

pub struct TransferManager {
    device: Arc<Device>,
    queue: vk::Queue,
    queue_family: u32,
    timeline: vk::Semaphore,
    next_ticket: AtomicU64,
    staging_belt: StagingBelt,
    in_flight: Mutex<Vec<PendingBatch>>,
}

impl TransferManager {
    pub fn new(device: Arc<Device>, staging_belt: StagingBelt) -> Result<Self> {
        let queue_family = device.queue_families().transfer;
        let queue = unsafe { device.raw().get_device_queue(queue_family, 0) };

        let mut timeline_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_info);
        let timeline = unsafe { device.raw().create_semaphore(&semaphore_info, None) }?;

        log::info!("Transfer system initialized");

        Ok(TransferManager {
            device,
            queue,
            queue_family,
            timeline,
            next_ticket: AtomicU64::new(1),
            staging_belt,
            in_flight: Mutex::new(Vec::new()),
        })
    }

    fn thread_pool(&self) -> Result<vk::CommandPool> {
        THREAD_POOL.with(|cell| {
            let mut slot = cell.borrow_mut();
            let self_ptr = self as *const Self as usize;
            if let Some((owner, pool)) = *slot {
                if owner == self_ptr {
                    return Ok(pool);
                }
            }
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(self.queue_family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);
            let pool = unsafe { self.device.raw().create_command_pool(&pool_info, None) }?;
            self.device.register_thread_local_pool(pool);
            *slot = Some((self_ptr, pool));
            Ok(pool)
        })
    }

    pub fn begin(&self) -> Result<vk::CommandBuffer> {
        let pool = self.thread_pool()?;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1)
            .command_pool(pool);
        let cmd = unsafe { self.device.raw().allocate_command_buffers(&alloc_info) }?[0];

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.raw().begin_command_buffer(cmd, &begin_info) }?;
        Ok(cmd)
    }

    pub fn allocate_staging(&self, size: usize, alignment: usize) -> Option<crate::staging::StagingAllocation> {
        self.staging_belt.allocate(size, alignment)
    }

    pub fn allocate_staging_for_image(
        &self,
        size: usize,
        texel_block_size: usize,
        row_pitch_bytes: usize,
        offset_alignment: usize,
        row_pitch_alignment: usize,
    ) -> Option<crate::staging::StagingAllocation> {
        self.staging_belt
            .allocate_for_image_upload(size, texel_block_size, row_pitch_bytes, offset_alignment, row_pitch_alignment)
    }

    pub fn submit(&self, cmd: vk::CommandBuffer, owned_staging_buffers: Vec<vk::Buffer>) -> Result<TransferToken> {
        unsafe { self.device.raw().end_command_buffer(cmd) }?;

        let signal_value = self.next_ticket.fetch_add(1, Ordering::AcqRel);

        let signal_values = [signal_value];
        let mut timeline_submit = vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&signal_values);
        let command_buffers = [cmd];
        let signal_semaphores = [self.timeline];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_submit);

        {
            let mut in_flight = self.in_flight.lock();
            self.device.submit_to_transfer(self.queue, &submit_info, vk::Fence::null())?;
            in_flight.push(PendingBatch {
                token: TransferToken(signal_value),
                staging_buffers: owned_staging_buffers,
            });
            self.staging_belt.retire(signal_value);
        }

        Ok(TransferToken(signal_value))
    }

    pub fn is_completed(&self, token: TransferToken) -> Result<bool> {
        if !token.is_valid() {
            return Ok(true);
        }
        let gpu_value = unsafe { self.device.raw().get_semaphore_counter_value(self.timeline) }?;
        Ok(gpu_value >= token.0)
    }

    pub fn garbage_collect(&self) -> Result<()> {
        let gpu_value = unsafe { self.device.raw().get_semaphore_counter_value(self.timeline) }?;
        self.staging_belt.garbage_collect(gpu_value);
        self.in_flight.lock().retain(|batch| gpu_value < batch.token.0);
        Ok(())
    }

    pub fn upload_buffer(&self, dst: vk::Buffer, src: &[u8], dst_offset: vk::DeviceSize, copy_offset_alignment: vk::DeviceSize) -> Result<TransferToken> {
        if dst == vk::Buffer::null() || src.is_empty() {
            return Ok(TransferToken::default());
        }
        let copy_align = copy_offset_alignment.max(16) as usize;

        let cmd = self.begin()?;
        let alloc = self.allocate_staging(src.len(), copy_align).ok_or(RuntimeError::StagingExhausted {
            requested: src.len(),
            capacity: 0,
        })?;

        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), alloc.mapped_ptr, src.len());
        }

        let region = vk::BufferCopy::default()
            .src_offset(alloc.offset as vk::DeviceSize)
            .dst_offset(dst_offset)
            .size(src.len() as vk::DeviceSize);
        unsafe {
            self.device
                .raw()
                .cmd_copy_buffer(cmd, alloc.buffer, dst, std::slice::from_ref(&region))
        };

        self.submit(cmd, Vec::new())
    }

    pub fn begin_upload_batch(&self) -> Result<vk::CommandBuffer> {
        self.begin()
    }

    pub fn enqueue_upload_buffer(
        &self,
        cmd: vk::CommandBuffer,
        dst: vk::Buffer,
        src: &[u8],
        dst_offset: vk::DeviceSize,
        copy_alignment: vk::DeviceSize,
    ) -> bool {
        if cmd == vk::CommandBuffer::null() || dst == vk::Buffer::null() {
            return false;
        }
        if src.is_empty() {
            return true;
        }
        let alignment = if copy_alignment == 0 { 16 } else { copy_alignment } as usize;
        let Some(alloc) = self.allocate_staging(src.len(), alignment) else {
            return false;
        };
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), alloc.mapped_ptr, src.len());
        }
        let region = vk::BufferCopy::default()
            .src_offset(alloc.offset as vk::DeviceSize)
            .dst_offset(dst_offset)
            .size(src.len() as vk::DeviceSize);
        unsafe {
            self.device
                .raw()
                .cmd_copy_buffer(cmd, alloc.buffer, dst, std::slice::from_ref(&region))
        };
        true
    }

    pub fn end_upload_batch(&self, cmd: vk::CommandBuffer) -> Result<TransferToken> {
        self.submit(cmd, Vec::new())
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.raw().device_wait_idle();
        }
        self.in_flight.lock().clear();

        // Layered flush, mirroring the device's own teardown: the staging
        // belt's destruction can enqueue further deferred frees.
        self.device.flush_all();
        let _ = self.device.collect_garbage();
        self.device.flush_all();

        let _ = self.staging_belt.destroy(self.device.raw());
        unsafe { self.device.raw().destroy_semaphore(self.timeline, None) };
    }
}
