//! Render graph (components I–K): a linear pass list declared against
//! handles, compiled into barrier-annotated `CompiledPass`es, then executed
//! against a live command buffer. See spec §4.I–K.

pub mod builder;
pub mod compile;
pub mod execute;
mod intermediate;

pub use builder::{
    AttachmentDesc, ClearValue, ComputePassBuilder, GraphicsPassBuilder, IntermediateOp, Layout,
    LoadOp, RenderGraph, StoreOp, TextureDesc,
};
pub use compile::{CompiledAttachment, CompiledPass};
pub use execute::RecordContext;
