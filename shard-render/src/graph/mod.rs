//! C8 — Render Graph: a per-frame DAG of passes, resolved to physical GPU
//! resources, synchronized with synthesized image/buffer barriers, and
//! recorded in parallel per topological layer via dynamic rendering.

mod buffer_pool;
pub mod builder;
mod compile;
mod execute;
pub mod resource;

use std::collections::HashMap;

use shard_gfx::{FrameArena, FrameScope, TransientAllocator};

use buffer_pool::BufferPool;
use builder::Pass;
use compile::{BufferBarrier, ImageBarrier};
use resource::ResourceNode;

pub use builder::PassBuilder;
pub use compile::{BufferBarrier as GraphBufferBarrier, ImageBarrier as GraphImageBarrier};
pub use resource::{
    AttachmentInfo, BufferDesc, PassIndex, Physical, ResourceId, ResourceKind, ResourceRegistry, TextureDesc,
};

pub struct RenderGraph {
    resources: Vec<ResourceNode>,
    passes: Vec<Pass>,
    name_to_id: HashMap<&'static str, ResourceId>,

    image_barriers: Vec<ImageBarrier>,
    buffer_barriers: Vec<BufferBarrier>,

    edges: Vec<Vec<u32>>,
    indegree: Vec<u32>,

    buffer_pool: BufferPool,

    frame_arena: FrameArena,
    frame_scope: FrameScope,
}

impl RenderGraph {
    pub fn new(arena_size: u64, scope_size: u64) -> Self {
        RenderGraph {
            resources: Vec::new(),
            passes: Vec::new(),
            name_to_id: HashMap::new(),
            image_barriers: Vec::new(),
            buffer_barriers: Vec::new(),
            edges: Vec::new(),
            indegree: Vec::new(),
            buffer_pool: BufferPool::new(),
            frame_arena: FrameArena::with_capacity(arena_size),
            frame_scope: FrameScope::with_capacity(scope_size),
        }
    }

    pub fn frame_arena(&self) -> &FrameArena {
        &self.frame_arena
    }

    pub fn frame_scope(&self) -> &FrameScope {
        &self.frame_scope
    }

    pub fn resource_id(&self, name: &str) -> Option<ResourceId> {
        self.name_to_id.get(name).copied()
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn active_resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Runs Compile steps 1-4 against the passes declared so far this frame.
    pub fn compile(
        &mut self,
        device: &shard_gfx::Device,
        transient: &TransientAllocator,
        frame_index: u64,
    ) -> shard_gfx::Result<()> {
        self.resolve_resources(device, transient, frame_index)?;
        self.synthesize_barriers();
        self.build_dag();
        Ok(())
    }

    /// Per §4.8 Reset: clears pass lists, barrier arrays, and the resource
    /// registry, and resets the frame-scoped bump allocators. The caller is
    /// responsible for also calling `TransientAllocator::reset` (C2), which
    /// this graph borrows only during `compile` and does not own.
    pub fn reset(&mut self) {
        self.passes.clear();
        self.resources.clear();
        self.name_to_id.clear();
        self.image_barriers.clear();
        self.buffer_barriers.clear();
        self.edges.clear();
        self.indegree.clear();
        self.frame_scope.reset();
        self.frame_arena.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::resource::{BufferDesc, TextureDesc};
    use super::*;
    use ash::vk;

    fn tex_desc() -> TextureDesc {
        TextureDesc {
            width: 64,
            height: 64,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    #[test]
    fn declaring_passes_builds_read_after_write_edges() {
        let mut graph = RenderGraph::new(4096, 4096);

        let color = graph.add_pass("opaque", |b| {
            let c = b.create_texture("color", tex_desc());
            b.write_color(
                c,
                AttachmentInfo {
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    clear: vk::ClearValue::default(),
                },
            );
        });

        let _post = graph.add_pass("post", |b| {
            let c = b.graph.resource_id("color").unwrap();
            b.read(c, vk::PipelineStageFlags2::FRAGMENT_SHADER, vk::AccessFlags2::SHADER_SAMPLED_READ);
        });

        graph.build_dag();
        let layers = graph.topological_layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0], vec![color.0]);
    }

    #[test]
    fn unrelated_passes_share_a_layer() {
        let mut graph = RenderGraph::new(4096, 4096);

        graph.add_pass("a", |b| {
            b.create_buffer("buf-a", BufferDesc { size: 256, usage: vk::BufferUsageFlags::STORAGE_BUFFER });
        });
        graph.add_pass("b", |b| {
            b.create_buffer("buf-b", BufferDesc { size: 256, usage: vk::BufferUsageFlags::STORAGE_BUFFER });
        });

        graph.build_dag();
        let layers = graph.topological_layers();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].len(), 2);
    }

    #[test]
    fn reset_clears_pass_and_resource_state() {
        let mut graph = RenderGraph::new(4096, 4096);
        graph.add_pass("a", |b| {
            b.create_buffer("buf", BufferDesc { size: 256, usage: vk::BufferUsageFlags::STORAGE_BUFFER });
        });
        assert_eq!(graph.pass_count(), 1);
        graph.reset();
        assert_eq!(graph.pass_count(), 0);
        assert_eq!(graph.active_resource_count(), 0);
        assert!(graph.resource_id("buf").is_none());
    }
}
