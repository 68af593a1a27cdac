//! Compile-step-4 layers executed: per layer, passes record secondary command
//! buffers in parallel via the job scheduler (A4), then the primary command
//! buffer replays barriers and dynamic-rendering scopes in vector order.

use ash::vk;
use shard_gfx::Device;

use crate::job::JobScheduler;

use super::resource::ResourceRegistry;
use super::RenderGraph;

struct RasterInheritance {
    color_formats: Vec<vk::Format>,
    depth_format: vk::Format,
    stencil_format: vk::Format,
}

impl RenderGraph {
    pub fn execute(&mut self, device: &Device, scheduler: &JobScheduler, primary_cmd: vk::CommandBuffer, thread_pools: &[vk::CommandPool]) -> shard_gfx::Result<()> {
        profiling::scope!("RenderGraph::execute");
        let layers = self.topological_layers();

        for layer in layers {
            let secondaries = self.record_layer_parallel(device, scheduler, &layer, thread_pools)?;
            self.replay_layer(device, primary_cmd, &layer, &secondaries);
        }
        Ok(())
    }

    fn record_layer_parallel(
        &mut self,
        device: &Device,
        scheduler: &JobScheduler,
        layer: &[u32],
        thread_pools: &[vk::CommandPool],
    ) -> shard_gfx::Result<Vec<vk::CommandBuffer>> {
        let raw = device.raw().clone();
        let resources_ptr: *const [super::resource::ResourceNode] = self.resources.as_slice();

        let mut secondaries = vec![vk::CommandBuffer::null(); layer.len()];
        let mut handles = Vec::with_capacity(layer.len());

        for (slot, &pass_index) in layer.iter().enumerate() {
            let pass = &mut self.passes[pass_index as usize];
            let execute_fn = pass.execute.take();
            let inheritance = raster_inheritance(pass, unsafe { &*resources_ptr });
            let pool = thread_pools[slot % thread_pools.len().max(1)];
            let secondaries_ptr = secondaries.as_mut_ptr();
            let raw_clone = raw.clone();

            handles.push(scheduler.dispatch(pass.name, move || {
                let alloc_info = vk::CommandBufferAllocateInfo::default()
                    .level(vk::CommandBufferLevel::SECONDARY)
                    .command_pool(pool)
                    .command_buffer_count(1);
                let cmd = match unsafe { raw_clone.allocate_command_buffers(&alloc_info) } {
                    Ok(bufs) => bufs[0],
                    Err(e) => {
                        log::error!("render graph: failed to allocate secondary command buffer: {e:?}");
                        return;
                    }
                };

                let has_attachments = !inheritance.color_formats.is_empty() || inheritance.depth_format != vk::Format::UNDEFINED;
                let mut rendering_info = vk::CommandBufferInheritanceRenderingInfo::default()
                    .color_attachment_formats(&inheritance.color_formats)
                    .depth_attachment_format(inheritance.depth_format)
                    .stencil_attachment_format(inheritance.stencil_format);
                let mut inheritance_info = vk::CommandBufferInheritanceInfo::default();
                if has_attachments {
                    inheritance_info = inheritance_info.push_next(&mut rendering_info);
                }

                let usage = if has_attachments {
                    vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE
                } else {
                    vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                };
                let begin_info = vk::CommandBufferBeginInfo::default().flags(usage).inheritance_info(&inheritance_info);

                if let Err(e) = unsafe { raw_clone.begin_command_buffer(cmd, &begin_info) } {
                    log::error!("render graph: failed to begin secondary command buffer: {e:?}");
                    return;
                }

                if let Some(f) = execute_fn {
                    let registry = ResourceRegistry { resources: unsafe { &*resources_ptr } };
                    f(&registry, cmd);
                }

                if let Err(e) = unsafe { raw_clone.end_command_buffer(cmd) } {
                    log::error!("render graph: failed to end secondary command buffer: {e:?}");
                }

                unsafe { *secondaries_ptr.add(slot) = cmd };
            }));
        }

        scheduler.wait_for_all(handles);
        Ok(secondaries)
    }

    fn replay_layer(&self, device: &Device, primary_cmd: vk::CommandBuffer, layer: &[u32], secondaries: &[vk::CommandBuffer]) {
        for (slot, &pass_index) in layer.iter().enumerate() {
            let pass = &self.passes[pass_index as usize];

            let (image_start, image_count) = pass.image_barrier_span;
            let (buffer_start, buffer_count) = pass.buffer_barrier_span;
            if image_count > 0 || buffer_count > 0 {
                let image_barriers: Vec<vk::ImageMemoryBarrier2> = self.image_barriers
                    [image_start as usize..(image_start + image_count) as usize]
                    .iter()
                    .map(|b| {
                        vk::ImageMemoryBarrier2::default()
                            .src_stage_mask(b.src_stage)
                            .src_access_mask(b.src_access)
                            .dst_stage_mask(b.dst_stage)
                            .dst_access_mask(b.dst_access)
                            .old_layout(b.old_layout)
                            .new_layout(b.new_layout)
                            .image(b.image)
                            .subresource_range(vk::ImageSubresourceRange {
                                aspect_mask: b.aspect,
                                base_mip_level: 0,
                                level_count: vk::REMAINING_MIP_LEVELS,
                                base_array_layer: 0,
                                layer_count: vk::REMAINING_ARRAY_LAYERS,
                            })
                    })
                    .collect();
                let buffer_barriers: Vec<vk::BufferMemoryBarrier2> = self.buffer_barriers
                    [buffer_start as usize..(buffer_start + buffer_count) as usize]
                    .iter()
                    .map(|b| {
                        vk::BufferMemoryBarrier2::default()
                            .src_stage_mask(b.src_stage)
                            .src_access_mask(b.src_access)
                            .dst_stage_mask(b.dst_stage)
                            .dst_access_mask(b.dst_access)
                            .buffer(b.buffer)
                            .offset(0)
                            .size(vk::WHOLE_SIZE)
                    })
                    .collect();
                let dependency_info = vk::DependencyInfo::default()
                    .image_memory_barriers(&image_barriers)
                    .buffer_memory_barriers(&buffer_barriers);
                unsafe { device.raw().cmd_pipeline_barrier2(primary_cmd, &dependency_info) };
            }

            let has_attachments = !pass.attachment_nodes.is_empty();
            if has_attachments {
                let mut color_attachments = Vec::new();
                let mut depth_attachment = None;
                let mut render_area = vk::Extent2D::default();
                let mut first = true;

                for node in &pass.attachment_nodes {
                    let resource = &self.resources[node.resource.0 as usize];
                    if first {
                        render_area = vk::Extent2D { width: resource.extent.0, height: resource.extent.1 };
                        first = false;
                    }
                    let Some(view) = resource.view() else { continue };
                    let attachment = vk::RenderingAttachmentInfo::default()
                        .image_view(view)
                        .image_layout(if node.is_depth {
                            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                        } else {
                            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                        })
                        .load_op(node.info.load_op)
                        .store_op(node.info.store_op)
                        .clear_value(node.info.clear);
                    if node.is_depth {
                        depth_attachment = Some(attachment);
                    } else {
                        color_attachments.push(attachment);
                    }
                }

                let mut rendering_info = vk::RenderingInfo::default()
                    .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent: render_area })
                    .layer_count(1)
                    .color_attachments(&color_attachments)
                    .contents(vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
                if let Some(depth) = depth_attachment.as_ref() {
                    rendering_info = rendering_info.depth_attachment(depth);
                }
                unsafe { device.raw().cmd_begin_rendering(primary_cmd, &rendering_info) };
            }

            let cmd = secondaries[slot];
            if cmd != vk::CommandBuffer::null() {
                unsafe { device.raw().cmd_execute_commands(primary_cmd, std::slice::from_ref(&cmd)) };
            }

            if has_attachments {
                unsafe { device.raw().cmd_end_rendering(primary_cmd) };
            }
        }
    }
}

fn raster_inheritance(pass: &super::builder::Pass, resources: &[super::resource::ResourceNode]) -> RasterInheritance {
    let mut color_formats = Vec::new();
    let mut depth_format = vk::Format::UNDEFINED;
    let stencil_format = vk::Format::UNDEFINED;

    for node in &pass.attachment_nodes {
        let format = resources[node.resource.0 as usize].format;
        if node.is_depth {
            depth_format = format;
        } else {
            color_formats.push(format);
        }
    }

    RasterInheritance { color_formats, depth_format, stencil_format }
}
