//! A5 — GPU Profiler.
//!
//! A small timestamp-query pool feeding the "GPU-frame-start"/"GPU-frame-end"
//! timestamp hooks named by the frame orchestrator (§4.9). Resolved
//! opportunistically, one frame behind, so resolving never stalls on a query
//! that hasn't landed yet. Grounded on `blade-graphics`'s own
//! `TimingQueryPool`, adapted to raw `vk::QueryPool` timestamps instead of
//! wgpu's higher-level timestamp-writes API.

use ash::vk;

pub struct GpuProfiler {
    pool: vk::QueryPool,
    frames_in_flight: u32,
    timestamp_period_ns: f32,
    enabled: bool,
}

impl GpuProfiler {
    pub fn new(device: &ash::Device, frames_in_flight: u32, timestamp_period_ns: f32, enabled: bool) -> Option<Self> {
        if !enabled {
            return None;
        }
        let query_count = frames_in_flight * 2; // start + end per frame slot
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(query_count);
        let pool = unsafe { device.create_query_pool(&info, None) }.ok()?;
        Some(GpuProfiler {
            pool,
            frames_in_flight,
            timestamp_period_ns,
            enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn start_query(&self, slot: u32) -> u32 {
        slot * 2
    }

    fn end_query(&self, slot: u32) -> u32 {
        slot * 2 + 1
    }

    pub fn write_frame_start(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: u32) {
        if !self.enabled {
            return;
        }
        unsafe {
            device.cmd_reset_query_pool(cmd, self.pool, self.start_query(slot), 2);
            device.cmd_write_timestamp(cmd, vk::PipelineStageFlags::TOP_OF_PIPE, self.pool, self.start_query(slot));
        }
    }

    pub fn write_frame_end(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: u32) {
        if !self.enabled {
            return;
        }
        unsafe {
            device.cmd_write_timestamp(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, self.pool, self.end_query(slot));
        }
    }

    /// Resolves a prior frame's pair of timestamps into a duration in
    /// milliseconds, returning `None` if the queries aren't ready yet
    /// (results are requested without `WAIT`, so this never stalls).
    pub fn resolve_frame_ms(&self, device: &ash::Device, slot: u32) -> Option<f32> {
        if !self.enabled {
            return None;
        }
        let mut data = [0u64; 2];
        unsafe {
            device
                .get_query_pool_results(self.pool, self.start_query(slot), &mut data, vk::QueryResultFlags::TYPE_64)
                .ok()?;
        }
        let [start, end] = data;
        if end <= start {
            return None;
        }
        Some((end - start) as f32 * self.timestamp_period_ns / 1_000_000.0)
    }

    /// # Safety
    /// Caller must route destruction through the device's deferred-destroy
    /// queue rather than call this directly while frames referencing the pool
    /// may still be in flight.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_query_pool(self.pool, None);
    }
}
