//! Keyed pool of transient GPU buffers, reused across passes within a frame
//! (and across frames) when a free entry's claimed `[start, end]` interval
//! does not overlap the requesting resource's interval.

use ash::vk;
use std::collections::HashMap;

use super::resource::{BufferDesc, Physical, ResourceNode};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    size: vk::DeviceSize,
    usage: u32,
}

struct Entry {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    memory_offset: vk::DeviceSize,
    claimed_start: u32,
    claimed_end: u32,
    frame_index: u64,
}

#[derive(Default)]
pub struct BufferPool {
    entries: HashMap<Key, Vec<Entry>>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool::default()
    }

    pub fn take_compatible(&mut self, resource: &ResourceNode, frame_index: u64) -> Option<Physical> {
        let desc = resource.buffer_desc?;
        let key = Key { size: desc.size, usage: desc.usage.as_raw() };
        let candidates = self.entries.get_mut(&key)?;
        let want_start = resource.start_pass.0;
        let want_end = resource.end_pass.0;
        for entry in candidates.iter_mut() {
            let overlaps = entry.frame_index == frame_index && want_start <= entry.claimed_end && entry.claimed_start <= want_end;
            if !overlaps {
                entry.claimed_start = want_start;
                entry.claimed_end = want_end;
                entry.frame_index = frame_index;
                return Some(Physical::Buffer {
                    buffer: entry.buffer,
                    memory: entry.memory,
                    memory_offset: entry.memory_offset,
                });
            }
        }
        None
    }

    pub fn register(&mut self, resource: &ResourceNode, buffer: vk::Buffer, desc: BufferDesc, frame_index: u64) {
        let key = Key { size: desc.size, usage: desc.usage.as_raw() };
        let (memory, memory_offset) = match resource.physical {
            Physical::Buffer { memory, memory_offset, .. } => (memory, memory_offset),
            _ => (vk::DeviceMemory::null(), 0),
        };
        self.entries.entry(key).or_default().push(Entry {
            buffer,
            memory,
            memory_offset,
            claimed_start: resource.start_pass.0,
            claimed_end: resource.end_pass.0,
            frame_index,
        });
    }
}
