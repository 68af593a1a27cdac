//! C6 — Texture Pool.
//!
//! A generational slot pool (`slotmap`) of GPU textures. `destroy` enqueues a
//! slot for reclamation tagged with the current global frame number;
//! `process_deletions` drains entries whose frame + N has passed, rebinding
//! the freed bindless slot to the default descriptor before the underlying
//! image/view/sampler are routed through the device's deferred-destroy queue.

use ash::vk;
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::bindless::BindlessTable;
use crate::device::Device;

new_key_type! {
    pub struct TextureHandle;
}

pub struct TextureGpuData {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub bindless_slot: u32,
}

struct PendingReclaim {
    handle: TextureHandle,
    enqueued_frame: u64,
}

struct Inner {
    slots: SlotMap<TextureHandle, TextureGpuData>,
    pending: Vec<PendingReclaim>,
    next_bindless_slot: u32,
    free_bindless_slots: Vec<u32>,
}

pub struct TexturePool {
    device: std::sync::Arc<Device>,
    bindless: std::sync::Arc<BindlessTable>,
    frames_in_flight: u64,
    inner: Mutex<Inner>,
}

impl TexturePool {
    pub fn new(device: std::sync::Arc<Device>, bindless: std::sync::Arc<BindlessTable>, frames_in_flight: u32) -> Self {
        TexturePool {
            device,
            bindless,
            frames_in_flight: frames_in_flight as u64,
            inner: Mutex::new(Inner {
                slots: SlotMap::with_key(),
                pending: Vec::new(),
                // slot 0 is reserved for the default/error texture (§3).
                next_bindless_slot: 1,
                free_bindless_slots: Vec::new(),
            }),
        }
    }

    fn allocate_bindless_slot(&self, inner: &mut Inner) -> Option<u32> {
        if let Some(slot) = inner.free_bindless_slots.pop() {
            return Some(slot);
        }
        if inner.next_bindless_slot >= self.bindless.capacity() {
            return None;
        }
        let slot = inner.next_bindless_slot;
        inner.next_bindless_slot += 1;
        Some(slot)
    }

    /// Registers a texture that has already been created on the GPU (image,
    /// view, sampler) and publishes its view into the bindless table.
    pub fn create_pending(&self, image: vk::Image, memory: vk::DeviceMemory, view: vk::ImageView, sampler: vk::Sampler) -> Option<TextureHandle> {
        let mut inner = self.inner.lock();
        let bindless_slot = self.allocate_bindless_slot(&mut inner)?;

        self.bindless
            .enqueue_update(bindless_slot, view, sampler, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let handle = inner.slots.insert(TextureGpuData {
            image,
            memory,
            view,
            sampler,
            bindless_slot,
        });
        Some(handle)
    }

    /// Enqueues `handle` for reclamation; the underlying resources are not
    /// freed until `process_deletions` observes `enqueued_frame + N <=
    /// current_frame`.
    pub fn destroy(&self, handle: TextureHandle, current_frame: u64) {
        let mut inner = self.inner.lock();
        if !inner.slots.contains_key(handle) {
            return;
        }
        inner.pending.push(PendingReclaim {
            handle,
            enqueued_frame: current_frame,
        });
    }

    pub fn process_deletions(&self, current_frame: u64) {
        let mut inner = self.inner.lock();
        let threshold = self.frames_in_flight;

        let mut ready = Vec::new();
        inner.pending.retain(|p| {
            if p.enqueued_frame + threshold <= current_frame {
                ready.push(p.handle);
                false
            } else {
                true
            }
        });

        for handle in ready {
            let Some(data) = inner.slots.remove(handle) else { continue };

            // Rebind before destroy: the bindless slot must never be left
            // pointing at a view that is about to be destroyed.
            self.bindless.rebind_to_default(data.bindless_slot);
            inner.free_bindless_slots.push(data.bindless_slot);

            let device = self.device.clone();
            let image = data.image;
            let view = data.view;
            let sampler = data.sampler;
            let memory = data.memory;
            device.defer_destroy(move || unsafe {
                let raw = device.raw();
                raw.destroy_sampler(sampler, None);
                raw.destroy_image_view(view, None);
                raw.destroy_image(image, None);
                raw.free_memory(memory, None);
            });
        }
    }

    pub fn set_default_descriptor(&self, view: vk::ImageView, sampler: vk::Sampler) {
        self.bindless.set_default_descriptor(view, sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindless_slot_zero_is_reserved() {
        // next_bindless_slot starts at 1; this is asserted structurally by
        // construction rather than by spinning up a real pool (which needs a
        // live device), matching the "construction-only" testing note for
        // device-backed components.
        let inner = Inner {
            slots: SlotMap::with_key(),
            pending: Vec::new(),
            next_bindless_slot: 1,
            free_bindless_slots: Vec::new(),
        };
        assert_eq!(inner.next_bindless_slot, 1);
    }
}
