//! Execute (spec §4.K): reconciles each compiled pass's pre-barriers
//! against the `TextureStateTracker`'s live state, emits the surviving
//! barriers in one dependency info, commits the new state back, then
//! invokes the pass callback.

use ash::vk;

use crate::command::CommandBuffer;
use crate::deferred::DeferredQueue;
use crate::pipeline::PipelineResolver;
use crate::resource::ResourceManager;
use crate::texture_state::{Access, ImageLayout, Stage, TextureState};
use crate::vulkan::Gpu;

use super::builder::RenderGraph;
use super::compile::{CompiledKind, PreBarrier};

/// Borrowed handles a pass callback needs to record into `cmd` or bind a
/// pipeline: the device, the resource manager (for handle→raw lookups),
/// the pipeline resolver, and the deferred queue + token a bindless/
/// pipeline rebuild might need to retire stale objects through.
pub struct RecordContext<'a> {
    pub(crate) gpu: &'a Gpu,
    pub(crate) resources: &'a mut ResourceManager,
    pub(crate) pipelines: &'a mut PipelineResolver,
    pub(crate) deferred: &'a mut DeferredQueue,
    pub(crate) token: crate::command::SubmitToken,
}

impl<'a> RecordContext<'a> {
    pub fn gpu(&self) -> &Gpu {
        self.gpu
    }

    pub fn resources(&self) -> &ResourceManager {
        self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        self.resources
    }

    pub fn pipelines_mut(&mut self) -> &mut PipelineResolver {
        self.pipelines
    }

    pub fn bindless(&self) -> &crate::bindless::BindlessDescriptorTable {
        &self.resources.bindless
    }

    pub fn token(&self) -> crate::command::SubmitToken {
        self.token
    }

    /// Binds a graphics pipeline plus the bindless set, building or
    /// rebuilding it first if necessary (spec §4.H/§4.J(5)). The single
    /// entry point a graphics pass callback needs to draw with.
    ///
    /// # Safety
    /// `self.gpu` must be a live device.
    pub unsafe fn bind_graphics_pipeline(
        &mut self,
        cmd: &mut CommandBuffer,
        handle: crate::handle::GraphicsPipelineHandle,
        shape: &crate::pipeline::RenderPassShape,
    ) {
        unsafe {
            crate::pipeline::cmd_bind_graphics_pipeline(
                cmd,
                self.pipelines,
                self.gpu,
                &self.resources.bindless,
                self.deferred,
                self.token,
                handle,
                shape,
            );
        }
    }

    /// Compute counterpart of [`Self::bind_graphics_pipeline`].
    ///
    /// # Safety
    /// `self.gpu` must be a live device.
    pub unsafe fn bind_compute_pipeline(&mut self, cmd: &mut CommandBuffer, handle: crate::handle::ComputePipelineHandle) {
        unsafe {
            crate::pipeline::cmd_bind_compute_pipeline(
                cmd,
                self.pipelines,
                self.gpu,
                &self.resources.bindless,
                self.deferred,
                self.token,
                handle,
            );
        }
    }
}

fn vk_image_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

fn vk_stage_mask(stage: Stage) -> vk::PipelineStageFlags2 {
    let mut mask = vk::PipelineStageFlags2::empty();
    if stage.contains(Stage::FRAGMENT_SHADER) {
        mask |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
    }
    if stage.contains(Stage::COMPUTE_SHADER) {
        mask |= vk::PipelineStageFlags2::COMPUTE_SHADER;
    }
    if stage.contains(Stage::COLOR_ATTACHMENT_OUTPUT) {
        mask |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
    }
    if stage.contains(Stage::EARLY_FRAGMENT_TESTS) {
        mask |= vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS;
    }
    if stage.contains(Stage::LATE_FRAGMENT_TESTS) {
        mask |= vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
    }
    if stage.contains(Stage::TRANSFER) {
        mask |= vk::PipelineStageFlags2::TRANSFER;
    }
    if stage.contains(Stage::ALL_COMMANDS) {
        mask |= vk::PipelineStageFlags2::ALL_COMMANDS;
    }
    if mask.is_empty() {
        mask = vk::PipelineStageFlags2::TOP_OF_PIPE;
    }
    mask
}

fn vk_access_mask(access: Access) -> vk::AccessFlags2 {
    let mut mask = vk::AccessFlags2::empty();
    if access.contains(Access::SHADER_READ) {
        mask |= vk::AccessFlags2::SHADER_READ;
    }
    if access.contains(Access::SHADER_WRITE) {
        mask |= vk::AccessFlags2::SHADER_WRITE;
    }
    if access.contains(Access::COLOR_ATTACHMENT_READ) {
        mask |= vk::AccessFlags2::COLOR_ATTACHMENT_READ;
    }
    if access.contains(Access::COLOR_ATTACHMENT_WRITE) {
        mask |= vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
    }
    if access.contains(Access::DEPTH_STENCIL_READ) {
        mask |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ;
    }
    if access.contains(Access::DEPTH_STENCIL_WRITE) {
        mask |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if access.contains(Access::TRANSFER_READ) {
        mask |= vk::AccessFlags2::TRANSFER_READ;
    }
    if access.contains(Access::TRANSFER_WRITE) {
        mask |= vk::AccessFlags2::TRANSFER_WRITE;
    }
    mask
}

/// True when an old→new layout/mask transition is a no-op worth dropping
/// the barrier for (spec §4.K(1)): identical layout and the new access is
/// already a subset of what was last made available.
fn barrier_is_redundant(old: &TextureState, new_layout: ImageLayout, new_access: Access) -> bool {
    old.layout == new_layout && old.access_mask.contains(new_access)
}

impl RenderGraph {
    /// `execute(&mut cmd)` (spec §4.K). Requires `has_compiled` and a
    /// non-dry-run command buffer; both violations are programmer errors
    /// and therefore fatal.
    pub fn execute(
        &mut self,
        cmd: &mut CommandBuffer,
        gpu: &Gpu,
        resources: &mut ResourceManager,
        pipelines: &mut PipelineResolver,
        deferred: &mut DeferredQueue,
        token: crate::command::SubmitToken,
    ) {
        assert!(self.has_compiled, "RenderGraph::execute called before compile (or after a pass was declared since)");
        assert!(!cmd.is_dry_run(), "RenderGraph::execute called with a dry-run command buffer");

        for index in 0..self.compiled.len() {
            reconcile_and_emit_barriers(cmd, gpu, resources, &self.compiled[index].pre_barriers);

            let pass = &mut self.compiled[index];
            cmd.active_pass = Some(index);

            match &pass.kind {
                CompiledKind::Graphics { attachments, render_area } => {
                    let color: Vec<_> = attachments
                        .iter()
                        .filter(|a| a.layout == ImageLayout::ColorAttachment)
                        .map(to_rendering_attachment)
                        .collect();
                    let depth = attachments.iter().find(|a| a.layout == ImageLayout::DepthStencilAttachment).map(to_rendering_attachment);
                    cmd.cmd_begin_rendering(gpu, *render_area, &color, depth.as_ref());
                    if let Some(callback) = &mut pass.callback {
                        let mut record_context = RecordContext { gpu, resources, pipelines, deferred, token };
                        callback(cmd, &mut record_context);
                    }
                    cmd.cmd_end_rendering(gpu);
                }
                CompiledKind::Compute => {
                    if let Some(callback) = &mut pass.callback {
                        let mut record_context = RecordContext { gpu, resources, pipelines, deferred, token };
                        callback(cmd, &mut record_context);
                    }
                }
                CompiledKind::Intermediate { op } => {
                    crate::graph::intermediate::record(cmd, gpu, resources, op);
                }
            }
        }

        log::debug!("RenderGraph: executed {} passes", self.compiled.len());
    }
}

fn to_rendering_attachment(attachment: &super::compile::CompiledAttachment) -> crate::command::RenderingAttachment {
    crate::command::RenderingAttachment {
        view: attachment.view,
        layout: vk_image_layout(attachment.layout),
        load_op: match attachment.load_op {
            super::builder::LoadOp::Load => vk::AttachmentLoadOp::LOAD,
            super::builder::LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
            super::builder::LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        },
        store_op: match attachment.store_op {
            super::builder::StoreOp::Store => vk::AttachmentStoreOp::STORE,
            super::builder::StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        },
        clear_value: match attachment.clear_value {
            super::builder::ClearValue::Color(c) => vk::ClearValue { color: vk::ClearColorValue { float32: c } },
            super::builder::ClearValue::DepthStencil { depth, stencil } => {
                vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth, stencil } }
            }
        },
        resolve: attachment.resolve.map(|(view, layout)| (view, vk_image_layout(layout))),
    }
}

fn reconcile_and_emit_barriers(cmd: &mut CommandBuffer, gpu: &Gpu, resources: &mut ResourceManager, pre_barriers: &[PreBarrier]) {
    let mut vk_barriers = Vec::with_capacity(pre_barriers.len());

    for barrier in pre_barriers {
        let current = resources.tracker.read(barrier.texture, barrier.range);
        if barrier_is_redundant(&current, barrier.new_layout, barrier.new_access) {
            continue;
        }

        let Some(image) = resources.texture_image(barrier.texture) else {
            // Not the "missing tracker entry" case above (that already
            // defaults to Undefined via `tracker.read` and still gets a
            // barrier) — this is a texture that no longer exists at all,
            // so there is no `vk::Image` to put in a barrier. Can only
            // happen if a compiled pass outlives one of its textures.
            log::warn!("RenderGraph: skipping barrier for destroyed or invalid texture handle {:?}", barrier.texture);
            continue;
        };
        let aspect_mask = resources.texture_format(barrier.texture).map(|f| f.aspect_mask()).unwrap_or(vk::ImageAspectFlags::COLOR);

        vk_barriers.push(
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk_stage_mask(current.stage_mask))
                .src_access_mask(vk_access_mask(current.access_mask))
                .dst_stage_mask(vk_stage_mask(barrier.new_stage))
                .dst_access_mask(vk_access_mask(barrier.new_access))
                .old_layout(vk_image_layout(current.layout))
                .new_layout(vk_image_layout(barrier.new_layout))
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: barrier.range.base_mip,
                    level_count: barrier.range.num_mips,
                    base_array_layer: barrier.range.base_layer,
                    layer_count: barrier.range.num_layers,
                }),
        );
    }

    if !vk_barriers.is_empty() {
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&vk_barriers);
        cmd.cmd_pipeline_barrier2(gpu, &dependency_info);
    }

    // Commit the surviving barriers' (newLayout, destStage/Access) back
    // into the tracker, whether or not the barrier itself was emitted —
    // a redundant barrier still represents the texture's current state.
    for barrier in pre_barriers {
        resources.tracker.write(
            barrier.texture,
            barrier.range,
            TextureState { layout: barrier.new_layout, stage_mask: barrier.new_stage, access_mask: barrier.new_access },
        );
    }
}
