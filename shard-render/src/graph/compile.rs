//! Compile steps 1-4: resource resolution, barrier synthesis, DAG
//! construction, layered topological sort.

use ash::vk;
use shard_gfx::{Device, TransientAllocator};

use super::resource::{Physical, ResourceKind};
use super::RenderGraph;

#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl RenderGraph {
    /// Compile step 1: resolve transient textures/buffers to physical
    /// backing. Imports are already resolved at `import_*` time.
    pub(super) fn resolve_resources(&mut self, device: &Device, transient: &TransientAllocator, frame_index: u64) -> shard_gfx::Result<()> {
        for resource in &mut self.resources {
            match resource.kind {
                ResourceKind::Imported => {}
                ResourceKind::Texture => {
                    let desc = resource.texture_desc.expect("texture resource missing desc");
                    let image_info = vk::ImageCreateInfo::default()
                        .image_type(vk::ImageType::TYPE_2D)
                        .format(desc.format)
                        .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
                        .mip_levels(1)
                        .array_layers(1)
                        .samples(vk::SampleCountFlags::TYPE_1)
                        .tiling(vk::ImageTiling::OPTIMAL)
                        .usage(desc.usage)
                        .initial_layout(vk::ImageLayout::UNDEFINED)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE);
                    let image = unsafe { device.raw().create_image(&image_info, None) }?;
                    let requirements = unsafe { device.raw().get_image_memory_requirements(image) };
                    let allocation = transient.allocate(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
                    unsafe { device.raw().bind_image_memory(image, allocation.memory, allocation.offset) }?;

                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(desc.format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: desc.aspect,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    let view = unsafe { device.raw().create_image_view(&view_info, None) }?;

                    resource.physical = Physical::Image {
                        image,
                        view,
                        memory: allocation.memory,
                        memory_offset: allocation.offset,
                    };
                }
                ResourceKind::Buffer => {
                    if let Some(reused) = self.buffer_pool.take_compatible(resource, frame_index) {
                        resource.physical = reused;
                        continue;
                    }
                    let desc = resource.buffer_desc.expect("buffer resource missing desc");
                    let buffer_info = vk::BufferCreateInfo::default()
                        .size(desc.size)
                        .usage(desc.usage)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE);
                    let buffer = unsafe { device.raw().create_buffer(&buffer_info, None) }?;
                    let requirements = unsafe { device.raw().get_buffer_memory_requirements(buffer) };
                    let allocation = transient.allocate(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
                    unsafe { device.raw().bind_buffer_memory(buffer, allocation.memory, allocation.offset) }?;

                    resource.physical = Physical::Buffer {
                        buffer,
                        memory: allocation.memory,
                        memory_offset: allocation.offset,
                    };
                    self.buffer_pool.register(resource, buffer, desc, frame_index);
                }
            }
        }
        Ok(())
    }

    /// Compile step 2: barrier synthesis, in pass declaration order.
    pub(super) fn synthesize_barriers(&mut self) {
        for pass_index in 0..self.passes.len() {
            let image_start = self.image_barriers.len() as u32;
            let buffer_start = self.buffer_barriers.len() as u32;

            let attachments = std::mem::take(&mut self.passes[pass_index].attachment_nodes);
            for node in &attachments {
                let (dst_stage, dst_access, target_layout) = if node.is_depth {
                    (
                        vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    )
                } else {
                    (
                        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    )
                };
                self.emit_image_barrier(node.resource, dst_stage, dst_access, target_layout);
            }
            self.passes[pass_index].attachment_nodes = attachments;

            let accesses = std::mem::take(&mut self.passes[pass_index].access_nodes);
            for node in &accesses {
                let is_image = self.resources[node.resource.0 as usize].image().is_some();
                if is_image {
                    let current = self.resources[node.resource.0 as usize].current_layout;
                    let layout = target_layout_for(node.access).unwrap_or(current);
                    self.emit_image_barrier(node.resource, node.stage, node.access, layout);
                } else {
                    self.emit_buffer_barrier_if_imported_buffer(node.resource, node.stage, node.access);
                }
            }
            self.passes[pass_index].access_nodes = accesses;

            let image_count = self.image_barriers.len() as u32 - image_start;
            let buffer_count = self.buffer_barriers.len() as u32 - buffer_start;
            self.passes[pass_index].image_barrier_span = (image_start, image_count);
            self.passes[pass_index].buffer_barrier_span = (buffer_start, buffer_count);
        }
    }

    fn emit_image_barrier(
        &mut self,
        id: super::resource::ResourceId,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
        target_layout: vk::ImageLayout,
    ) {
        let resource = &mut self.resources[id.0 as usize];
        let Some(image) = resource.image() else { return };
        let aspect = resource.aspect;

        let prev_layout = resource.current_layout;
        let prev_stage = resource.last_stage;
        let prev_access = resource.last_access;
        let is_initial = prev_stage == vk::PipelineStageFlags2::TOP_OF_PIPE && prev_access.is_empty();
        let layout_mismatch = prev_layout != target_layout;
        let prev_write = is_write_access(prev_access);
        let curr_write = is_write_access(dst_access);

        let needed = if is_initial {
            layout_mismatch
        } else {
            layout_mismatch || prev_write || curr_write
        };

        if needed {
            let (src_stage, src_access) = if prev_layout == vk::ImageLayout::UNDEFINED {
                (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::empty())
            } else {
                (prev_stage, prev_access)
            };
            self.image_barriers.push(ImageBarrier {
                image,
                aspect,
                src_stage,
                src_access,
                dst_stage,
                dst_access,
                old_layout: prev_layout,
                new_layout: target_layout,
            });
            resource.current_layout = target_layout;
            resource.last_stage = dst_stage;
            resource.last_access = dst_access;
        } else {
            resource.last_stage |= dst_stage;
            resource.last_access |= dst_access;
        }
    }

    fn emit_buffer_barrier_if_imported_buffer(
        &mut self,
        id: super::resource::ResourceId,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let resource = &mut self.resources[id.0 as usize];
        let Some(buffer) = resource.buffer() else { return };

        let involves_write = is_write_access(dst_access) || is_write_access(resource.last_access);
        if involves_write && resource.last_stage != vk::PipelineStageFlags2::TOP_OF_PIPE {
            self.buffer_barriers.push(BufferBarrier {
                buffer,
                src_stage: resource.last_stage,
                src_access: resource.last_access,
                dst_stage,
                dst_access,
            });
        }
        resource.last_stage = dst_stage;
        resource.last_access = dst_access;
    }

    /// Compile step 3: builds `last_writer`/`last_readers` edges.
    pub(super) fn build_dag(&mut self) {
        let pass_count = self.passes.len();
        self.edges = vec![Vec::new(); pass_count];
        self.indegree = vec![0u32; pass_count];

        let mut last_writer: Vec<Option<u32>> = vec![None; self.resources.len()];
        let mut last_readers: Vec<Vec<u32>> = vec![Vec::new(); self.resources.len()];

        let mut add_edge = |edges: &mut Vec<Vec<u32>>, indegree: &mut [u32], from: u32, to: u32| {
            edges[from as usize].push(to);
            indegree[to as usize] += 1;
        };

        for pass_index in 0..pass_count {
            let pass = &self.passes[pass_index];
            let this = pass_index as u32;

            for node in &pass.access_nodes {
                let rid = node.resource.0 as usize;
                let is_write = is_write_access(node.access);
                if is_write {
                    if let Some(writer) = last_writer[rid] {
                        if writer != this {
                            add_edge(&mut self.edges, &mut self.indegree, writer, this);
                        }
                    }
                    for &reader in &last_readers[rid] {
                        if reader != this {
                            add_edge(&mut self.edges, &mut self.indegree, reader, this);
                        }
                    }
                    last_readers[rid].clear();
                    last_writer[rid] = Some(this);
                } else {
                    if let Some(writer) = last_writer[rid] {
                        if writer != this {
                            add_edge(&mut self.edges, &mut self.indegree, writer, this);
                        }
                    }
                    last_readers[rid].push(this);
                }
            }

            for node in &pass.attachment_nodes {
                let rid = node.resource.0 as usize;
                if let Some(writer) = last_writer[rid] {
                    if writer != this {
                        add_edge(&mut self.edges, &mut self.indegree, writer, this);
                    }
                }
                for &reader in &last_readers[rid] {
                    if reader != this {
                        add_edge(&mut self.edges, &mut self.indegree, reader, this);
                    }
                }
                last_readers[rid].clear();
                last_writer[rid] = Some(this);
            }
        }
    }

    /// Compile step 4: Kahn's algorithm layered by level, with a
    /// declaration-order single-layer fallback on cycle detection.
    pub(super) fn topological_layers(&self) -> Vec<Vec<u32>> {
        let pass_count = self.passes.len();
        let mut indegree = self.indegree.clone();
        let mut layers = Vec::new();
        let mut processed = 0usize;

        loop {
            let layer: Vec<u32> = (0..pass_count as u32).filter(|&p| indegree[p as usize] == 0).collect();
            if layer.is_empty() {
                break;
            }
            for &p in &layer {
                indegree[p as usize] = u32::MAX; // mark consumed
            }
            for &p in &layer {
                for &succ in &self.edges[p as usize] {
                    if indegree[succ as usize] != u32::MAX {
                        indegree[succ as usize] -= 1;
                    }
                }
            }
            processed += layer.len();
            layers.push(layer);
        }

        if processed != pass_count {
            log::error!(
                "render graph: cycle detected ({processed}/{pass_count} passes resolved); falling back to declaration order"
            );
            return vec![(0..pass_count as u32).collect()];
        }

        layers
    }
}

fn is_write_access(access: vk::AccessFlags2) -> bool {
    let write_bits = vk::AccessFlags2::SHADER_WRITE
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
        | vk::AccessFlags2::TRANSFER_WRITE
        | vk::AccessFlags2::HOST_WRITE
        | vk::AccessFlags2::MEMORY_WRITE;
    !(access & write_bits).is_empty()
}

/// First-matching-rule target layout for an explicit access node; `None`
/// means "not an image access" (buffer path handled separately).
fn target_layout_for(access: vk::AccessFlags2) -> Option<vk::ImageLayout> {
    if access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE) || access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_READ) {
        return Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }
    if access.contains(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE)
        || access.contains(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ)
    {
        return Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }
    if access.contains(vk::AccessFlags2::TRANSFER_WRITE) {
        return Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }
    if access.contains(vk::AccessFlags2::TRANSFER_READ) {
        return Some(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    }
    if access.contains(vk::AccessFlags2::SHADER_SAMPLED_READ) {
        return Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
    if access.contains(vk::AccessFlags2::SHADER_READ) {
        return Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
    if access.contains(vk::AccessFlags2::SHADER_STORAGE_READ) || access.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE) {
        return Some(vk::ImageLayout::GENERAL);
    }
    None
}
