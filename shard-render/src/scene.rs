//! C7 — GPU Scene.
//!
//! A retained instance table: two GPU-local buffers of fixed capacity `M =
//! max_instances` (instance records, bounding spheres), a free-list slot
//! allocator, and per-frame packet merging feeding a compute scatter update.
//!
//! Merge semantics are transcribed directly from SPEC_FULL.md §4.7; the
//! original `Graphics.GPUScene.cpp` was consulted for the dispatch shape
//! (descriptor bindings 0/1/2, push-constant count, workgroup size 64).

use std::collections::HashMap;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use shard_gfx::Device;

pub const SENTINEL: u32 = u32::MAX;
pub const PRESERVE_GEO: u32 = 0xFFFF_FFFF;
const SCATTER_WORKGROUP_SIZE: u32 = 64;

#[repr(C, align(32))]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct InstanceRecord {
    pub model: [[f32; 4]; 4],
    pub texture_index: u32,
    pub entity_id: u32,
    pub geometry_id: u32,
    pub _pad: u32,
}

impl Default for InstanceRecord {
    fn default() -> Self {
        InstanceRecord {
            model: glam::Mat4::IDENTITY.to_cols_array_2d(),
            texture_index: 0,
            entity_id: 0,
            geometry_id: PRESERVE_GEO,
            _pad: 0,
        }
    }
}

/// `w > 0`: active with radius `w`. `w == 0`: deactivate. `w < 0`: update
/// other fields but preserve current bounds.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct BoundingSphere {
    pub center: [f32; 3],
    pub w: f32,
}

impl BoundingSphere {
    pub fn is_active(&self) -> bool {
        self.w > 0.0
    }
    pub fn is_deactivate(&self) -> bool {
        self.w == 0.0
    }
    pub fn is_preserve(&self) -> bool {
        self.w < 0.0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct UpdatePacket {
    pub slot: u32,
    pub _pad: [u32; 3],
    pub instance: InstanceRecord,
    pub bounds: BoundingSphere,
}

struct AllocState {
    free_list: Vec<u32>,
    next_slot: u32,
    capacity: u32,
    geometry_shadow: Vec<u32>,
    active_count: usize,
}

struct UpdateState {
    pending: Vec<UpdatePacket>,
    slot_to_index: HashMap<u32, usize>,
}

/// Pre-built compute pipeline performing the scatter update, supplied by the
/// caller since shader compilation is out of this crate's scope (§1).
/// Expected bindings: 0 = updates (storage, read), 1 = instance table
/// (storage, read-write), 2 = bounds table (storage, read-write). One
/// `u32` push constant carries the packet count.
pub struct ScatterPipeline {
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub descriptor_pool: vk::DescriptorPool,
}

struct StagingState {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped_ptr: *mut u8,
    capacity_bytes: vk::DeviceSize,
}

// SAFETY: `mapped_ptr` is a host-visible, host-coherent persistent mapping
// owned exclusively by this struct, accessed only while `staging`'s mutex is
// held.
unsafe impl Send for StagingState {}

pub struct GpuScene {
    capacity: u32,
    alloc: Mutex<AllocState>,
    updates: Mutex<UpdateState>,
    instance_buffer: vk::Buffer,
    bounds_buffer: vk::Buffer,
    staging: Mutex<StagingState>,
}

impl GpuScene {
    pub fn new(max_instances: u32, instance_buffer: vk::Buffer, bounds_buffer: vk::Buffer) -> Self {
        GpuScene {
            capacity: max_instances,
            alloc: Mutex::new(AllocState {
                free_list: Vec::new(),
                next_slot: 0,
                capacity: max_instances,
                geometry_shadow: vec![PRESERVE_GEO; max_instances as usize],
                active_count: 0,
            }),
            updates: Mutex::new(UpdateState {
                pending: Vec::new(),
                slot_to_index: HashMap::new(),
            }),
            instance_buffer,
            bounds_buffer,
            staging: Mutex::new(StagingState {
                buffer: vk::Buffer::null(),
                memory: vk::DeviceMemory::null(),
                mapped_ptr: std::ptr::null_mut(),
                capacity_bytes: 0,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocate_slot(&self) -> u32 {
        let mut alloc = self.alloc.lock();
        if let Some(slot) = alloc.free_list.pop() {
            alloc.active_count += 1;
            return slot;
        }
        if alloc.next_slot >= alloc.capacity {
            log::error!("GpuScene: slot exhaustion (capacity {})", alloc.capacity);
            return SENTINEL;
        }
        let slot = alloc.next_slot;
        alloc.next_slot += 1;
        alloc.active_count += 1;
        slot
    }

    pub fn free_slot(&self, slot: u32) {
        if slot == SENTINEL {
            return;
        }
        let mut alloc = self.alloc.lock();
        alloc.free_list.push(slot);
        if let Some(shadow) = alloc.geometry_shadow.get_mut(slot as usize) {
            *shadow = PRESERVE_GEO;
        }
        alloc.active_count = alloc.active_count.saturating_sub(1);
    }

    fn merge(dst: &mut UpdatePacket, incoming: &UpdatePacket) {
        // Deactivate beats active; preserve inherits dst's active state.
        let merged_w = if incoming.bounds.is_deactivate() {
            0.0
        } else if incoming.bounds.is_preserve() {
            dst.bounds.w
        } else {
            incoming.bounds.w
        };

        dst.instance.model = incoming.instance.model;
        dst.instance.texture_index = incoming.instance.texture_index;
        dst.instance.entity_id = incoming.instance.entity_id;
        if incoming.instance.geometry_id != PRESERVE_GEO {
            dst.instance.geometry_id = incoming.instance.geometry_id;
        }
        if incoming.bounds.w >= 0.0 {
            dst.bounds.center = incoming.bounds.center;
        }
        dst.bounds.w = merged_w;
    }

    pub fn queue_update(&self, slot: u32, mut data: InstanceRecord, mut sphere_bounds: BoundingSphere) {
        let mut alloc = self.alloc.lock();
        if data.geometry_id == PRESERVE_GEO {
            if let Some(shadow) = alloc.geometry_shadow.get(slot as usize) {
                data.geometry_id = *shadow;
            }
        } else if let Some(shadow) = alloc.geometry_shadow.get_mut(slot as usize) {
            *shadow = data.geometry_id;
        }
        drop(alloc);

        // Clamp a possibly-stale center of 0 for deactivate packets; center is
        // irrelevant once w == 0 but kept deterministic for testability.
        if sphere_bounds.w == 0.0 {
            sphere_bounds.center = [0.0; 3];
        }

        let incoming = UpdatePacket {
            slot,
            _pad: [0; 3],
            instance: data,
            bounds: sphere_bounds,
        };

        let mut updates = self.updates.lock();
        if let Some(&index) = updates.slot_to_index.get(&slot) {
            let dst = updates.pending[index];
            let mut merged = dst;
            Self::merge(&mut merged, &incoming);
            updates.pending[index] = merged;
        } else {
            let index = updates.pending.len();
            updates.pending.push(incoming);
            updates.slot_to_index.insert(slot, index);
        }
    }

    /// Swaps out the pending packet list; returns `None` if there was nothing
    /// to upload. The caller (frame orchestrator) is responsible for staging
    /// the packets and recording the scatter dispatch.
    pub fn take_pending(&self) -> Option<Vec<UpdatePacket>> {
        let mut updates = self.updates.lock();
        if updates.pending.is_empty() {
            return None;
        }
        updates.slot_to_index.clear();
        Some(std::mem::take(&mut updates.pending))
    }

    pub fn dispatch_workgroup_count(packet_count: u32) -> u32 {
        packet_count.div_ceil(SCATTER_WORKGROUP_SIZE)
    }

    pub fn instance_buffer(&self) -> vk::Buffer {
        self.instance_buffer
    }

    pub fn bounds_buffer(&self) -> vk::Buffer {
        self.bounds_buffer
    }

    fn find_memory_type(properties: vk::PhysicalDeviceMemoryProperties, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..properties.memory_type_count).find(|&i| {
            let supported = (type_bits & (1 << i)) != 0;
            supported && properties.memory_types[i as usize].property_flags.contains(flags)
        })
    }

    /// Ensures the staging buffer can hold at least `needed_bytes`, growing
    /// geometrically (doubling) and never shrinking.
    fn grow_staging_if_needed(&self, device: &Device, needed_bytes: vk::DeviceSize) -> shard_gfx::Result<()> {
        let mut staging = self.staging.lock();
        if staging.capacity_bytes >= needed_bytes {
            return Ok(());
        }
        let new_capacity = staging.capacity_bytes.max(1).max(needed_bytes).next_power_of_two().max(needed_bytes);

        if staging.buffer != vk::Buffer::null() {
            if staging.mapped_ptr != std::ptr::null_mut() {
                unsafe { device.raw().unmap_memory(staging.memory) };
            }
            unsafe {
                device.raw().destroy_buffer(staging.buffer, None);
                device.raw().free_memory(staging.memory, None);
            }
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(new_capacity)
            .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.raw().create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { device.raw().get_buffer_memory_requirements(buffer) };
        let type_index = Self::find_memory_type(
            device.memory_properties(),
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .ok_or(shard_gfx::RuntimeError::TransientExhausted { memory_type_index: u32::MAX })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        let memory = unsafe { device.raw().allocate_memory(&alloc_info, None) }?;
        unsafe { device.raw().bind_buffer_memory(buffer, memory, 0) }?;
        let mapped_ptr = unsafe { device.raw().map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }? as *mut u8;

        *staging = StagingState { buffer, memory, mapped_ptr, capacity_bytes: requirements.size };
        Ok(())
    }

    /// Drains pending updates, grows and fills the staging buffer, and
    /// records the descriptor-update + push-constant + dispatch sequence for
    /// the scatter compute pass. No-op if nothing is pending.
    #[allow(clippy::too_many_arguments)]
    pub fn sync(&self, device: &Device, pipeline: &ScatterPipeline, cmd: vk::CommandBuffer) -> shard_gfx::Result<()> {
        let Some(packets) = self.take_pending() else { return Ok(()) };

        let needed_bytes = (packets.len() * std::mem::size_of::<UpdatePacket>()) as vk::DeviceSize;
        self.grow_staging_if_needed(device, needed_bytes)?;

        let (staging_buffer, mapped_ptr) = {
            let staging = self.staging.lock();
            (staging.buffer, staging.mapped_ptr)
        };
        unsafe {
            std::ptr::copy_nonoverlapping(packets.as_ptr() as *const u8, mapped_ptr, needed_bytes as usize);
        }

        let set_layouts = [pipeline.descriptor_set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pipeline.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { device.raw().allocate_descriptor_sets(&alloc_info) }?[0];

        let updates_info = [vk::DescriptorBufferInfo::default().buffer(staging_buffer).offset(0).range(needed_bytes)];
        let instance_info = [vk::DescriptorBufferInfo::default().buffer(self.instance_buffer).offset(0).range(vk::WHOLE_SIZE)];
        let bounds_info = [vk::DescriptorBufferInfo::default().buffer(self.bounds_buffer).offset(0).range(vk::WHOLE_SIZE)];

        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&updates_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&instance_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(2)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&bounds_info),
        ];
        unsafe { device.raw().update_descriptor_sets(&writes, &[]) };

        let count = packets.len() as u32;
        unsafe {
            device.raw().cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            device
                .raw()
                .cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline_layout, 0, &[set], &[]);
            device.raw().cmd_push_constants(
                cmd,
                pipeline.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&count),
            );
            device.raw().cmd_dispatch(cmd, Self::dispatch_workgroup_count(count), 1, 1);
        }

        Ok(())
    }

    /// # Safety
    /// Caller must route through the device's deferred-destroy queue rather
    /// than call this while the scatter dispatch reading the staging buffer
    /// may still be in flight.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        let mut staging = self.staging.lock();
        if staging.buffer == vk::Buffer::null() {
            return;
        }
        if staging.mapped_ptr != std::ptr::null_mut() {
            device.unmap_memory(staging.memory);
        }
        device.destroy_buffer(staging.buffer, None);
        device.free_memory(staging.memory, None);
        *staging = StagingState { buffer: vk::Buffer::null(), memory: vk::DeviceMemory::null(), mapped_ptr: std::ptr::null_mut(), capacity_bytes: 0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_packet(slot: u32, entity: u32, radius: f32) -> (InstanceRecord, BoundingSphere) {
        let mut rec = InstanceRecord::default();
        rec.entity_id = entity;
        rec.geometry_id = 7;
        (rec, BoundingSphere { center: [1.0, 2.0, 3.0], w: radius })
    }

    #[test]
    fn allocating_capacity_then_one_more_returns_sentinel() {
        let scene = GpuScene::new(2, vk::Buffer::null(), vk::Buffer::null());
        assert_eq!(scene.allocate_slot(), 0);
        assert_eq!(scene.allocate_slot(), 1);
        assert_eq!(scene.allocate_slot(), SENTINEL);
    }

    #[test]
    fn freed_slot_is_reused() {
        let scene = GpuScene::new(2, vk::Buffer::null(), vk::Buffer::null());
        let a = scene.allocate_slot();
        scene.free_slot(a);
        let b = scene.allocate_slot();
        assert_eq!(a, b);
    }

    #[test]
    fn active_then_deactivate_then_active_merges_to_single_active_packet() {
        let scene = GpuScene::new(4, vk::Buffer::null(), vk::Buffer::null());
        let slot = scene.allocate_slot();

        let (rec1, bounds1) = active_packet(slot, 42, 1.0);
        scene.queue_update(slot, rec1, bounds1);

        let mut rec2 = rec1;
        rec2.entity_id = 43;
        scene.queue_update(slot, rec2, BoundingSphere { center: [0.0; 3], w: 0.0 });

        let mut rec3 = rec1;
        rec3.entity_id = 44;
        scene.queue_update(slot, rec3, BoundingSphere { center: [9.0, 9.0, 9.0], w: 2.0 });

        let pending = scene.take_pending().expect("one merged packet");
        assert_eq!(pending.len(), 1);
        let packet = pending[0];
        assert_eq!(packet.slot, slot);
        assert_eq!(packet.instance.entity_id, 44);
        assert!(packet.bounds.is_active());
        assert_eq!(packet.bounds.w, 2.0);
    }

    #[test]
    fn preserve_geo_inherits_shadow() {
        let scene = GpuScene::new(4, vk::Buffer::null(), vk::Buffer::null());
        let slot = scene.allocate_slot();

        let (mut rec, bounds) = active_packet(slot, 1, 1.0);
        rec.geometry_id = 55;
        scene.queue_update(slot, rec, bounds);
        scene.take_pending();

        let mut rec2 = rec;
        rec2.geometry_id = PRESERVE_GEO;
        scene.queue_update(slot, rec2, bounds);
        let pending = scene.take_pending().unwrap();
        assert_eq!(pending[0].instance.geometry_id, 55);
    }

    #[test]
    fn preserve_sphere_keeps_previous_center_and_radius() {
        let scene = GpuScene::new(4, vk::Buffer::null(), vk::Buffer::null());
        let slot = scene.allocate_slot();
        let (rec, bounds) = active_packet(slot, 1, 5.0);
        scene.queue_update(slot, rec, bounds);

        scene.queue_update(slot, rec, BoundingSphere { center: [0.0; 3], w: -1.0 });
        let pending = scene.take_pending().unwrap();
        assert_eq!(pending[0].bounds.center, bounds.center);
        assert_eq!(pending[0].bounds.w, bounds.w);
    }

    #[test]
    fn dispatch_workgroup_count_rounds_up() {
        assert_eq!(GpuScene::dispatch_workgroup_count(1), 1);
        assert_eq!(GpuScene::dispatch_workgroup_count(64), 1);
        assert_eq!(GpuScene::dispatch_workgroup_count(65), 2);
    }
}
