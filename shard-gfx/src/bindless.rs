//! C5 — Bindless Table.
//!
//! A single descriptor set with one combined-image-sampler array binding,
//! created with `PARTIALLY_BOUND | UPDATE_AFTER_BIND` so it can be written
//! while still bound. Updates are coalesced under a lock and applied in one
//! batched `vkUpdateDescriptorSets` call per `flush_pending`.
//!
//! Ported from `RHI.Bindless.cpp`.

use ash::vk;
use parking_lot::Mutex;

use crate::error::Result;

const HARDWARE_DESCRIPTOR_CAP: u32 = 65_536;
const FALLBACK_DESCRIPTOR_COUNT: u32 = 4_096;

struct PendingUpdate {
    index: u32,
    view: vk::ImageView,
    sampler: vk::Sampler,
    layout: vk::ImageLayout,
}

pub struct BindlessTable {
    device: ash::Device,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    capacity: u32,
    pending: Mutex<Vec<PendingUpdate>>,
    default_descriptor: Mutex<Option<(vk::ImageView, vk::Sampler)>>,
}

impl BindlessTable {
    pub fn new(
        device: ash::Device,
        descriptor_indexing_properties: &vk::PhysicalDeviceDescriptorIndexingProperties,
        requested_cap: u32,
    ) -> Result<Self> {
        let hw_limit = descriptor_indexing_properties.max_descriptor_set_update_after_bind_sampled_images;
        let hw_limit = if hw_limit == 0 {
            log::warn!("Bindless: hardware reported 0 update-after-bind sampled images; defaulting to {FALLBACK_DESCRIPTOR_COUNT}");
            FALLBACK_DESCRIPTOR_COUNT
        } else {
            hw_limit
        };

        let capacity = hw_limit.min(HARDWARE_DESCRIPTOR_CAP).min(requested_cap.max(1));
        log::info!("Bindless: allocating {capacity} slots (hw limit {hw_limit})");

        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT);

        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let bindings = [binding];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut flags_info);

        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }?;

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .pool_sizes(&pool_sizes)
            .max_sets(1);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }?;

        let set_layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }?[0];

        Ok(BindlessTable {
            device,
            layout,
            pool,
            set,
            capacity,
            pending: Mutex::new(Vec::with_capacity(1024)),
            default_descriptor: Mutex::new(None),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn set_default_descriptor(&self, view: vk::ImageView, sampler: vk::Sampler) {
        *self.default_descriptor.lock() = Some((view, sampler));
    }

    pub fn enqueue_update(&self, index: u32, view: vk::ImageView, sampler: vk::Sampler, layout: vk::ImageLayout) {
        if index >= self.capacity {
            log::error!("Bindless update out of bounds: {index} >= {}", self.capacity);
            return;
        }
        if view == vk::ImageView::null() || sampler == vk::Sampler::null() {
            log::warn!("Bindless: ignoring enqueue_update({index}) with null view/sampler (no null-descriptor feature)");
            return;
        }
        self.pending.lock().push(PendingUpdate { index, view, sampler, layout });
    }

    /// Rebinds `index` to the default descriptor rather than leaving it
    /// pointing at a view that is about to be destroyed. Never writes a null
    /// handle directly (see `unregister_texture`).
    pub fn rebind_to_default(&self, index: u32) {
        let default = *self.default_descriptor.lock();
        if let Some((view, sampler)) = default {
            self.enqueue_update(index, view, sampler, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
    }

    pub fn unregister_texture(&self, index: u32) {
        // Deliberately does not write VK_NULL_HANDLE: without the
        // null-descriptor feature that is undefined behavior. Callers (the
        // texture pool) must call `rebind_to_default` before this.
        if index >= self.capacity {
            return;
        }
    }

    pub fn flush_pending(&self) {
        let updates = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };

        let image_infos: Vec<vk::DescriptorImageInfo> = updates
            .iter()
            .map(|u| {
                vk::DescriptorImageInfo::default()
                    .sampler(u.sampler)
                    .image_view(u.view)
                    .image_layout(u.layout)
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet> = updates
            .iter()
            .zip(image_infos.iter())
            .map(|(u, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(0)
                    .dst_array_element(u.index)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info))
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }
}

impl Drop for BindlessTable {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

pub fn capacity_for(hw_limit: u32, requested_cap: u32) -> u32 {
    let hw_limit = if hw_limit == 0 { FALLBACK_DESCRIPTOR_COUNT } else { hw_limit };
    hw_limit.min(HARDWARE_DESCRIPTOR_CAP).min(requested_cap.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_clamps_to_hardware_cap() {
        assert_eq!(capacity_for(1_000_000, 65_536), HARDWARE_DESCRIPTOR_CAP);
    }

    #[test]
    fn zero_hw_limit_falls_back() {
        assert_eq!(capacity_for(0, 65_536), FALLBACK_DESCRIPTOR_COUNT);
    }

    #[test]
    fn requested_cap_can_further_restrict() {
        assert_eq!(capacity_for(65_536, 128), 128);
    }
}
