//! C2 — Transient Page Allocator.
//!
//! Per memory-type bucket, a vector of pages of default size `page_size`, each
//! with a bump-pointer cursor. `reset()` rewinds every cursor without freeing
//! any page; pages are freed only when the allocator itself is dropped.
//!
//! Ported from `RHI.TransientAllocator.cpp`'s bucket/page/cursor walk.

use ash::vk;
use parking_lot::Mutex;

use crate::error::{Result, RuntimeError};

#[derive(Clone, Copy)]
pub struct TransientAllocation {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

struct Page {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    used_offset: vk::DeviceSize,
}

struct Bucket {
    memory_type_index: u32,
    pages: Vec<Page>,
    active_page_index: usize,
}

pub struct TransientAllocator {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    page_size: vk::DeviceSize,
    buckets: Mutex<Vec<Bucket>>,
}

fn align_up_pow2(offset: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    (offset + alignment - 1) & !(alignment - 1)
}

impl TransientAllocator {
    pub fn new(
        device: ash::Device,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        page_size: vk::DeviceSize,
    ) -> Self {
        let buckets = (0..memory_properties.memory_type_count)
            .map(|i| Bucket {
                memory_type_index: i,
                pages: Vec::new(),
                active_page_index: 0,
            })
            .collect();

        log::info!("TransientAllocator created: page size {page_size} bytes");

        TransientAllocator {
            device,
            memory_properties,
            page_size,
            buckets: Mutex::new(buckets),
        }
    }

    /// Clears per-page cursors; does not free any page. Call once per frame
    /// once the frame's GPU work on this slot has been waited on.
    pub fn reset(&self) {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            for page in &mut bucket.pages {
                page.used_offset = 0;
            }
            bucket.active_page_index = 0;
        }
    }

    pub fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        preferred_flags: vk::MemoryPropertyFlags,
    ) -> Result<TransientAllocation> {
        if requirements.size == 0 {
            return Ok(TransientAllocation {
                memory: vk::DeviceMemory::null(),
                offset: 0,
                size: 0,
            });
        }

        let alignment = requirements.alignment.max(1);
        if alignment & (alignment - 1) != 0 {
            log::error!("TransientAllocator: non power-of-two alignment {alignment}");
            return Err(RuntimeError::TransientExhausted {
                memory_type_index: u32::MAX,
            });
        }

        let type_index = self
            .find_memory_type(requirements.memory_type_bits, preferred_flags)
            .or_else(|| self.find_memory_type(requirements.memory_type_bits, vk::MemoryPropertyFlags::empty()))
            .ok_or_else(|| {
                log::error!(
                    "TransientAllocator: no compatible memory type for type_bits=0x{:x}",
                    requirements.memory_type_bits
                );
                RuntimeError::TransientExhausted {
                    memory_type_index: u32::MAX,
                }
            })?;

        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[type_index as usize];

        for i in bucket.active_page_index..bucket.pages.len() {
            let page = &mut bucket.pages[i];
            let aligned = align_up_pow2(page.used_offset, alignment);
            if aligned + requirements.size <= page.size {
                bucket.active_page_index = i;
                page.used_offset = aligned + requirements.size;
                return Ok(TransientAllocation {
                    memory: page.memory,
                    offset: aligned,
                    size: requirements.size,
                });
            }
        }

        let new_page_size = self.page_size.max(requirements.size);
        let page = self.create_page(type_index, new_page_size)?;
        let memory = page.memory;
        bucket.pages.push(Page {
            used_offset: requirements.size,
            ..page
        });
        bucket.active_page_index = bucket.pages.len() - 1;

        Ok(TransientAllocation {
            memory,
            offset: 0,
            size: requirements.size,
        })
    }

    fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        for i in 0..self.memory_properties.memory_type_count {
            let supported = (type_bits & (1 << i)) != 0;
            if !supported {
                continue;
            }
            let flags = self.memory_properties.memory_types[i as usize].property_flags;
            if flags.contains(properties) {
                return Some(i);
            }
        }
        None
    }

    fn create_page(&self, memory_type_index: u32, size: vk::DeviceSize) -> Result<Page> {
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }.map_err(|e| {
            log::error!(
                "TransientAllocator: vkAllocateMemory failed (size={size}, type={memory_type_index}, res={e:?})"
            );
            RuntimeError::Vulkan(e)
        })?;

        Ok(Page {
            memory,
            size,
            used_offset: 0,
        })
    }
}

impl Drop for TransientAllocator {
    fn drop(&mut self) {
        // Transient pages live for the allocator's whole lifetime, so unlike
        // most GPU-owning types here they are freed immediately rather than
        // routed through the device's deferred-destruction queue.
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            for page in &bucket.pages {
                if page.memory != vk::DeviceMemory::null() {
                    unsafe { self.device.free_memory(page.memory, None) };
                }
            }
            bucket.pages.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_pow2_rounds_to_next_multiple() {
        assert_eq!(align_up_pow2(0, 256), 0);
        assert_eq!(align_up_pow2(1, 256), 256);
        assert_eq!(align_up_pow2(256, 256), 256);
        assert_eq!(align_up_pow2(257, 256), 512);
    }
}
