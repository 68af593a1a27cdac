//! Per-pass builder surface: `create_texture`, `import_texture`, `read`,
//! `write_color`, etc. Calls during a pass's setup closure append access and
//! attachment nodes and widen the touched resource's `[start_pass, end_pass]`
//! interval.

use ash::vk;

use super::resource::{
    AccessNode, AttachmentInfo, AttachmentNode, BufferDesc, PassIndex, ResourceId, ResourceNode, TextureDesc,
};
use super::RenderGraph;

pub struct Pass {
    pub name: &'static str,
    pub access_nodes: Vec<AccessNode>,
    pub attachment_nodes: Vec<AttachmentNode>,
    pub image_barrier_span: (u32, u32),
    pub buffer_barrier_span: (u32, u32),
    pub execute: Option<Box<dyn FnOnce(&super::resource::ResourceRegistry, vk::CommandBuffer) + Send>>,
}

impl Pass {
    fn new(name: &'static str) -> Self {
        Pass {
            name,
            access_nodes: Vec::new(),
            attachment_nodes: Vec::new(),
            image_barrier_span: (0, 0),
            buffer_barrier_span: (0, 0),
            execute: None,
        }
    }
}

/// Handed to a pass's setup closure; borrows the graph's resource table and
/// appends to this pass's own node lists.
pub struct PassBuilder<'g> {
    pub(crate) graph: &'g mut RenderGraph,
    pub(crate) pass: PassIndex,
}

impl<'g> PassBuilder<'g> {
    fn touch(&mut self, id: ResourceId) {
        let pass = self.pass;
        self.graph.resources[id.0 as usize].touch(pass);
    }

    pub fn create_texture(&mut self, name: &'static str, desc: TextureDesc) -> ResourceId {
        let id = ResourceId(self.graph.resources.len() as u32);
        self.graph.resources.push(ResourceNode::new_texture(name, desc, self.pass));
        self.graph.name_to_id.insert(name, id);
        id
    }

    pub fn create_buffer(&mut self, name: &'static str, desc: BufferDesc) -> ResourceId {
        let id = ResourceId(self.graph.resources.len() as u32);
        self.graph.resources.push(ResourceNode::new_buffer(name, desc, self.pass));
        self.graph.name_to_id.insert(name, id);
        id
    }

    pub fn import_texture(
        &mut self,
        name: &'static str,
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: (u32, u32),
        current_layout: vk::ImageLayout,
    ) -> ResourceId {
        let id = ResourceId(self.graph.resources.len() as u32);
        self.graph.resources.push(ResourceNode::new_imported_texture(
            name,
            image,
            view,
            format,
            extent,
            current_layout,
            self.pass,
        ));
        self.graph.name_to_id.insert(name, id);
        id
    }

    pub fn import_buffer(&mut self, name: &'static str, buffer: vk::Buffer) -> ResourceId {
        let id = ResourceId(self.graph.resources.len() as u32);
        self.graph.resources.push(ResourceNode::new_imported_buffer(name, buffer, self.pass));
        self.graph.name_to_id.insert(name, id);
        id
    }

    pub fn read(&mut self, handle: ResourceId, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> ResourceId {
        self.touch(handle);
        self.graph.passes[self.pass.0 as usize]
            .access_nodes
            .push(AccessNode { resource: handle, stage, access });
        handle
    }

    pub fn write(&mut self, handle: ResourceId, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> ResourceId {
        self.touch(handle);
        self.graph.passes[self.pass.0 as usize]
            .access_nodes
            .push(AccessNode { resource: handle, stage, access });
        handle
    }

    pub fn write_color(&mut self, handle: ResourceId, info: AttachmentInfo) -> ResourceId {
        self.touch(handle);
        self.graph.passes[self.pass.0 as usize]
            .attachment_nodes
            .push(AttachmentNode { resource: handle, info, is_depth: false });
        handle
    }

    pub fn write_depth(&mut self, handle: ResourceId, info: AttachmentInfo) -> ResourceId {
        self.touch(handle);
        self.graph.passes[self.pass.0 as usize]
            .attachment_nodes
            .push(AttachmentNode { resource: handle, info, is_depth: true });
        handle
    }

    pub fn get_texture_extent(&self, handle: ResourceId) -> (u32, u32) {
        self.graph.resources[handle.0 as usize].extent
    }

    pub fn set_execute(&mut self, f: impl FnOnce(&super::resource::ResourceRegistry, vk::CommandBuffer) + Send + 'static) {
        self.graph.passes[self.pass.0 as usize].execute = Some(Box::new(f));
    }
}

impl RenderGraph {
    /// Declares a new pass, runs `setup` against its builder, and returns the
    /// pass index. `setup` is expected to call `builder.set_execute(...)`
    /// before returning.
    pub fn add_pass(&mut self, name: &'static str, setup: impl FnOnce(&mut PassBuilder)) -> PassIndex {
        let index = PassIndex(self.passes.len() as u32);
        self.passes.push(Pass::new(name));
        let mut builder = PassBuilder { graph: self, pass: index };
        setup(&mut builder);
        index
    }
}
