//! C9 — Frame Orchestrator.
//!
//! Drives the acquire → record → submit → present loop, owns per-frame-in-
//! flight synchronization primitives and command buffers, and is the one
//! place that ties C1 (lifetime GC), C2 (transient reset), C7 (scene sync),
//! and C8 (graph compile/execute) together into a single frame.

use std::sync::Arc;

use ash::vk;
use shard_gfx::{Device, GpuProfiler, Swapchain, TransientAllocator};

struct FrameSlot {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    fence: vk::Fence,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

pub struct AcquiredFrame {
    pub slot: usize,
    pub image_index: u32,
    pub command_buffer: vk::CommandBuffer,
}

pub struct FrameOrchestrator {
    device: Arc<Device>,
    slots: Vec<FrameSlot>,
    current_slot: usize,
    profiler_lag_frames: u32,
}

impl FrameOrchestrator {
    pub fn new(device: Arc<Device>, frames_in_flight: u32) -> shard_gfx::Result<Self> {
        let mut slots = Vec::with_capacity(frames_in_flight as usize);
        for _ in 0..frames_in_flight {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(device.queue_families().graphics)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = unsafe { device.raw().create_command_pool(&pool_info, None) }?;
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_pool(command_pool)
                .command_buffer_count(1);
            let command_buffer = unsafe { device.raw().allocate_command_buffers(&alloc_info) }?[0];

            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let image_available = unsafe { device.raw().create_semaphore(&semaphore_info, None) }?;
            let render_finished = unsafe { device.raw().create_semaphore(&semaphore_info, None) }?;

            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let fence = unsafe { device.raw().create_fence(&fence_info, None) }?;

            slots.push(FrameSlot { image_available, render_finished, fence, command_pool, command_buffer });
        }

        Ok(FrameOrchestrator { device, slots, current_slot: 0, profiler_lag_frames: frames_in_flight.max(1) })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Returns `None` when the swapchain was out of date and has been
    /// recreated; the caller should retry `begin_frame` on the next tick.
    pub fn begin_frame(
        &mut self,
        swapchain: &mut Swapchain,
        profiler: Option<&GpuProfiler>,
    ) -> shard_gfx::Result<Option<AcquiredFrame>> {
        profiling::scope!("FrameOrchestrator::begin_frame");
        let slot_index = self.current_slot;
        let fence = self.slots[slot_index].fence;
        unsafe { self.device.raw().wait_for_fences(&[fence], true, u64::MAX) }?;

        self.device.flush_slot(slot_index);
        self.device.increment_global_frame();

        let image_available = self.slots[slot_index].image_available;
        let Some(image_index) = swapchain.acquire_next_image(image_available)? else {
            swapchain.recreate(self.device.physical_device(), swapchain.extent(), self.slots.len() as u32)?;
            return Ok(None);
        };

        unsafe { self.device.raw().reset_fences(&[fence]) }?;
        let cmd = self.slots[slot_index].command_buffer;
        unsafe { self.device.raw().reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }?;
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.raw().begin_command_buffer(cmd, &begin_info) }?;

        if let Some(profiler) = profiler {
            profiler.write_frame_start(self.device.raw(), cmd, slot_index as u32);
        }

        let image = swapchain.image(image_index).image;
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
            .src_access_mask(vk::AccessFlags2::empty())
            .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.raw().cmd_pipeline_barrier2(cmd, &dependency_info) };

        Ok(Some(AcquiredFrame { slot: slot_index, image_index, command_buffer: cmd }))
    }

    pub fn end_frame(
        &mut self,
        swapchain: &mut Swapchain,
        transient: &TransientAllocator,
        profiler: Option<&GpuProfiler>,
        frame: AcquiredFrame,
    ) -> shard_gfx::Result<()> {
        profiling::scope!("FrameOrchestrator::end_frame");
        let cmd = frame.command_buffer;
        let image = swapchain.image(frame.image_index).image;

        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
            .dst_access_mask(vk::AccessFlags2::empty())
            .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.raw().cmd_pipeline_barrier2(cmd, &dependency_info) };

        if let Some(profiler) = profiler {
            profiler.write_frame_end(self.device.raw(), cmd, frame.slot as u32);
        }

        unsafe { self.device.raw().end_command_buffer(cmd) }?;

        let wait_semaphores = [self.slots[frame.slot].image_available];
        let wait_stages = [vk::PipelineStageFlags::TOP_OF_PIPE];
        let signal_semaphores = [self.slots[frame.slot].render_finished];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        self.device.submit_to_graphics(&submit_info, self.slots[frame.slot].fence)?;

        if let Some(profiler) = profiler {
            let lagged_slot = (frame.slot + self.slots.len() - (self.profiler_lag_frames as usize % self.slots.len().max(1))) % self.slots.len().max(1);
            if let Some(ms) = profiler.resolve_frame_ms(self.device.raw(), lagged_slot as u32) {
                log::trace!("gpu frame time: {ms:.3} ms");
            }
        }

        let swapchains = [swapchain.handle()];
        let image_indices = [frame.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match self.device.present(swapchain.loader(), &present_info) {
            Ok(suboptimal) => {
                if suboptimal {
                    swapchain.recreate(self.device.physical_device(), swapchain.extent(), self.slots.len() as u32)?;
                }
            }
            Err(shard_gfx::RuntimeError::SwapchainOutOfDate) => {
                swapchain.recreate(self.device.physical_device(), swapchain.extent(), self.slots.len() as u32)?;
            }
            Err(shard_gfx::RuntimeError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                swapchain.recreate(self.device.physical_device(), swapchain.extent(), self.slots.len() as u32)?;
            }
            Err(e) => return Err(e),
        }

        transient.reset();
        self.current_slot = (self.current_slot + 1) % self.slots.len();
        Ok(())
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.raw().device_wait_idle();
            for slot in &self.slots {
                self.device.raw().destroy_fence(slot.fence, None);
                self.device.raw().destroy_semaphore(slot.image_available, None);
                self.device.raw().destroy_semaphore(slot.render_finished, None);
                self.device.raw().destroy_command_pool(slot.command_pool, None);
            }
        }
    }
}
