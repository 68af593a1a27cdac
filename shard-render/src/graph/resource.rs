//! C8 resource/access/attachment node types, shared by the builder and
//! compile stages.

use ash::vk;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct PassIndex(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResourceKind {
    Texture,
    Buffer,
    Imported,
}

#[derive(Clone, Copy, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

#[derive(Clone, Copy, Debug)]
pub struct AttachmentInfo {
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: vk::ClearValue,
}

/// Resolved physical backing for a resource, set during Compile step 1.
#[derive(Clone, Copy, Debug, Default)]
pub enum Physical {
    #[default]
    Unresolved,
    Image {
        image: vk::Image,
        view: vk::ImageView,
        memory: vk::DeviceMemory,
        memory_offset: vk::DeviceSize,
    },
    Buffer {
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        memory_offset: vk::DeviceSize,
    },
}

pub struct AccessNode {
    pub resource: ResourceId,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

pub struct AttachmentNode {
    pub resource: ResourceId,
    pub info: AttachmentInfo,
    pub is_depth: bool,
}

pub struct ResourceNode {
    pub name: &'static str,
    pub kind: ResourceKind,
    pub texture_desc: Option<TextureDesc>,
    pub buffer_desc: Option<BufferDesc>,
    /// Image format, set for both created and imported textures; `UNDEFINED`
    /// for buffers. Imports carry this because the original spec's
    /// `import_texture` takes `format` explicitly (it can't be read back from
    /// the image handle alone), and attachments need it for the secondary
    /// command buffers' `color_attachment_formats`/`depth_attachment_format`.
    pub format: vk::Format,
    /// Subresource aspect, set for both created and imported textures; empty
    /// for buffers.
    pub aspect: vk::ImageAspectFlags,
    pub extent: (u32, u32),
    pub physical: Physical,
    pub current_layout: vk::ImageLayout,
    pub last_stage: vk::PipelineStageFlags2,
    pub last_access: vk::AccessFlags2,
    pub start_pass: PassIndex,
    pub end_pass: PassIndex,
}

impl ResourceNode {
    pub fn new_texture(name: &'static str, desc: TextureDesc, pass: PassIndex) -> Self {
        ResourceNode {
            name,
            kind: ResourceKind::Texture,
            texture_desc: Some(desc),
            buffer_desc: None,
            format: desc.format,
            aspect: desc.aspect,
            extent: (desc.width, desc.height),
            physical: Physical::Unresolved,
            current_layout: vk::ImageLayout::UNDEFINED,
            last_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_access: vk::AccessFlags2::empty(),
            start_pass: pass,
            end_pass: pass,
        }
    }

    pub fn new_buffer(name: &'static str, desc: BufferDesc, pass: PassIndex) -> Self {
        ResourceNode {
            name,
            kind: ResourceKind::Buffer,
            texture_desc: None,
            buffer_desc: Some(desc),
            format: vk::Format::UNDEFINED,
            aspect: vk::ImageAspectFlags::empty(),
            extent: (0, 0),
            physical: Physical::Unresolved,
            current_layout: vk::ImageLayout::UNDEFINED,
            last_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_access: vk::AccessFlags2::empty(),
            start_pass: pass,
            end_pass: pass,
        }
    }

    pub fn new_imported_texture(
        name: &'static str,
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: (u32, u32),
        initial_layout: vk::ImageLayout,
        pass: PassIndex,
    ) -> Self {
        ResourceNode {
            name,
            kind: ResourceKind::Imported,
            texture_desc: None,
            buffer_desc: None,
            format,
            aspect: aspect_for_format(format),
            extent,
            physical: Physical::Image {
                image,
                view,
                memory: vk::DeviceMemory::null(),
                memory_offset: 0,
            },
            current_layout: initial_layout,
            last_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_access: vk::AccessFlags2::empty(),
            start_pass: pass,
            end_pass: pass,
        }
    }

    pub fn new_imported_buffer(name: &'static str, buffer: vk::Buffer, pass: PassIndex) -> Self {
        ResourceNode {
            name,
            kind: ResourceKind::Imported,
            texture_desc: None,
            buffer_desc: None,
            format: vk::Format::UNDEFINED,
            aspect: vk::ImageAspectFlags::empty(),
            extent: (0, 0),
            physical: Physical::Buffer {
                buffer,
                memory: vk::DeviceMemory::null(),
                memory_offset: 0,
            },
            current_layout: vk::ImageLayout::UNDEFINED,
            last_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_access: vk::AccessFlags2::empty(),
            start_pass: pass,
            end_pass: pass,
        }
    }

    pub fn touch(&mut self, pass: PassIndex) {
        if pass.0 < self.start_pass.0 {
            self.start_pass = pass;
        }
        if pass.0 > self.end_pass.0 {
            self.end_pass = pass;
        }
    }

    pub fn image(&self) -> Option<vk::Image> {
        match self.physical {
            Physical::Image { image, .. } => Some(image),
            _ => None,
        }
    }

    pub fn view(&self) -> Option<vk::ImageView> {
        match self.physical {
            Physical::Image { view, .. } => Some(view),
            _ => None,
        }
    }

    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self.physical {
            Physical::Buffer { buffer, .. } => Some(buffer),
            _ => None,
        }
    }
}

/// Depth/stencil aspect for imported textures, which don't carry a
/// `TextureDesc` to read an explicit aspect off of.
fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => vk::ImageAspectFlags::DEPTH,
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// User-facing resolved-resource lookup, handed to execute callbacks.
pub struct ResourceRegistry<'a> {
    pub(crate) resources: &'a [ResourceNode],
}

impl<'a> ResourceRegistry<'a> {
    pub fn image(&self, id: ResourceId) -> Option<vk::Image> {
        self.resources.get(id.0 as usize).and_then(ResourceNode::image)
    }

    pub fn view(&self, id: ResourceId) -> Option<vk::ImageView> {
        self.resources.get(id.0 as usize).and_then(ResourceNode::view)
    }

    pub fn buffer(&self, id: ResourceId) -> Option<vk::Buffer> {
        self.resources.get(id.0 as usize).and_then(ResourceNode::buffer)
    }

    pub fn extent(&self, id: ResourceId) -> (u32, u32) {
        self.resources.get(id.0 as usize).map(|r| r.extent).unwrap_or((0, 0))
    }
}
