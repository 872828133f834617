//! Declaration API (spec §4.I): three typed pass builders accumulate a
//! `PassDesc` and append it to the graph's pass list on finalization.

use ash::vk;

use crate::command::CommandBuffer;
use crate::handle::{BufferHandle, TextureHandle};

use super::execute::RecordContext;

/// The handful of layouts a pass declaration can name; maps to the full
/// internal [`crate::texture_state::ImageLayout`] set at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    General,
    Read,
    TransferSrc,
    TransferDst,
    Present,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Clone, Copy, Debug)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// `{texture_handle, base_mip?, num_mips?, base_layer?, num_layers?,
/// view_type?}`. The `?` fields default to "the whole resource" / "2D",
/// resolved against the tracker's registered total range at compile time.
#[derive(Clone, Copy, Debug)]
pub struct TextureDesc {
    pub texture_handle: TextureHandle,
    pub base_mip: u32,
    pub num_mips: Option<u32>,
    pub base_layer: u32,
    pub num_layers: Option<u32>,
    pub view_type: Option<vk::ImageViewType>,
}

impl TextureDesc {
    pub fn new(texture_handle: TextureHandle) -> Self {
        Self { texture_handle, base_mip: 0, num_mips: None, base_layer: 0, num_layers: None, view_type: None }
    }

    pub fn with_mips(mut self, base_mip: u32, num_mips: u32) -> Self {
        self.base_mip = base_mip;
        self.num_mips = Some(num_mips);
        self
    }

    pub fn with_layers(mut self, base_layer: u32, num_layers: u32) -> Self {
        self.base_layer = base_layer;
        self.num_layers = Some(num_layers);
        self
    }
}

#[derive(Clone, Copy)]
pub struct AttachmentDesc {
    pub texture_desc: TextureDesc,
    pub clear_value: ClearValue,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub resolve_texture_desc: Option<TextureDesc>,
}

#[derive(Clone, Copy)]
pub(crate) struct Dependency {
    pub texture_desc: TextureDesc,
    pub layout: Layout,
}

/// Canned subgraphs the intermediate pass builder compiles directly to a
/// barrier + copy/blit/mipmap command sequence, with no user callback.
#[derive(Clone, Copy)]
pub enum IntermediateOp {
    CopyBuffer { src: BufferHandle, dst: BufferHandle, size: u64, src_offset: u64, dst_offset: u64 },
    BlitTexture { src: TextureDesc, dst: TextureDesc },
    GenerateMipmaps { texture: TextureHandle },
}

pub(crate) type ExecuteCallback = Box<dyn FnMut(&mut CommandBuffer, &mut RecordContext)>;

pub(crate) enum PassKind {
    Graphics { attachments: Vec<AttachmentDesc> },
    Compute,
    Intermediate { op: IntermediateOp },
}

pub(crate) struct PassDesc {
    pub name: String,
    pub kind: PassKind,
    pub dependencies: Vec<Dependency>,
    pub callback: Option<ExecuteCallback>,
}

/// The declared-but-not-yet-compiled graph: a linear list of passes in
/// declaration order. `compile` (§4.J) turns this into `CompiledPass`es;
/// declaring a new pass after compiling clears `has_compiled` again.
pub struct RenderGraph {
    pub(crate) passes: Vec<PassDesc>,
    pub(crate) compiled: Vec<super::compile::CompiledPass>,
    pub(crate) has_compiled: bool,
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderGraph {
    pub fn new() -> Self {
        Self { passes: Vec::new(), compiled: Vec::new(), has_compiled: false }
    }

    pub fn add_graphics_pass(&mut self, name: impl Into<String>) -> GraphicsPassBuilder<'_> {
        GraphicsPassBuilder { graph: self, name: name.into(), attachments: Vec::new(), dependencies: Vec::new() }
    }

    pub fn add_compute_pass(&mut self, name: impl Into<String>) -> ComputePassBuilder<'_> {
        ComputePassBuilder { graph: self, name: name.into(), dependencies: Vec::new() }
    }

    /// Records a canned subgraph directly; there is no user callback to
    /// supply (spec §4.I, "intermediate builder records canned subgraphs").
    pub fn add_intermediate_pass(&mut self, name: impl Into<String>, op: IntermediateOp) {
        self.passes.push(PassDesc {
            name: name.into(),
            kind: PassKind::Intermediate { op },
            dependencies: Vec::new(),
            callback: None,
        });
        self.has_compiled = false;
    }

    pub fn has_compiled(&self) -> bool {
        self.has_compiled
    }
}

pub struct GraphicsPassBuilder<'g> {
    graph: &'g mut RenderGraph,
    name: String,
    attachments: Vec<AttachmentDesc>,
    dependencies: Vec<Dependency>,
}

impl<'g> GraphicsPassBuilder<'g> {
    pub fn attachment(mut self, desc: AttachmentDesc) -> Self {
        self.attachments.push(desc);
        self
    }

    pub fn dependency(mut self, texture_desc: TextureDesc, layout: Layout) -> Self {
        self.dependencies.push(Dependency { texture_desc, layout });
        self
    }

    pub fn set_execute_callback(self, callback: impl FnMut(&mut CommandBuffer, &mut RecordContext) + 'static) {
        assert!(!self.attachments.is_empty(), "a graphics pass requires at least one attachment");
        self.graph.passes.push(PassDesc {
            name: self.name,
            kind: PassKind::Graphics { attachments: self.attachments },
            dependencies: self.dependencies,
            callback: Some(Box::new(callback)),
        });
        self.graph.has_compiled = false;
    }
}

pub struct ComputePassBuilder<'g> {
    graph: &'g mut RenderGraph,
    name: String,
    dependencies: Vec<Dependency>,
}

impl<'g> ComputePassBuilder<'g> {
    /// Default layout for a compute dependency is `General` (spec §4.I).
    pub fn dependency(mut self, texture_desc: TextureDesc) -> Self {
        self.dependencies.push(Dependency { texture_desc, layout: Layout::General });
        self
    }

    pub fn set_execute_callback(self, callback: impl FnMut(&mut CommandBuffer, &mut RecordContext) + 'static) {
        self.graph.passes.push(PassDesc {
            name: self.name,
            kind: PassKind::Compute,
            dependencies: self.dependencies,
            callback: Some(Box::new(callback)),
        });
        self.graph.has_compiled = false;
    }
}
