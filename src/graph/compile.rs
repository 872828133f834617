//! Compile (spec §4.J): turns a declared pass list into an ordered list of
//! `CompiledPass`, pre-synthesizing image barriers and, in a final dry-run
//! walk, pre-resolving every pipeline the passes will bind.

use ash::vk;

use crate::command::CommandBuffer;
use crate::handle::TextureHandle;
use crate::resource::{Extent3d, ResourceManager};
use crate::texture_state::{stage_access_for_layout, Access, ImageLayout, Stage, SubresourceRange};
use crate::vulkan::Gpu;

use super::builder::{self, AttachmentDesc, ClearValue, IntermediateOp, Layout, LoadOp, PassKind, RenderGraph, StoreOp, TextureDesc};
use super::execute::RecordContext;

/// A pre-synthesized barrier: `newLayout`/`newStage`/`newAccess` are known
/// at compile time; `oldLayout`/`srcStage`/`srcAccess` are filled in from
/// the `TextureStateTracker` at execute time (§4.K(1)).
pub(crate) struct PreBarrier {
    pub texture: TextureHandle,
    pub range: SubresourceRange,
    pub new_layout: ImageLayout,
    pub new_stage: Stage,
    pub new_access: Access,
}

pub struct CompiledAttachment {
    pub(crate) view: vk::ImageView,
    pub(crate) layout: ImageLayout,
    pub(crate) load_op: LoadOp,
    pub(crate) store_op: StoreOp,
    pub(crate) clear_value: ClearValue,
    pub(crate) resolve: Option<(vk::ImageView, ImageLayout)>,
}

pub(crate) enum CompiledKind {
    Graphics { attachments: Vec<CompiledAttachment>, render_area: vk::Extent2D },
    Compute,
    Intermediate { op: IntermediateOp },
}

pub struct CompiledPass {
    pub name: String,
    pub(crate) kind: CompiledKind,
    pub(crate) pre_barriers: Vec<PreBarrier>,
    pub(crate) callback: Option<builder::ExecuteCallback>,
}

fn resolve_range(desc: &TextureDesc, total: SubresourceRange) -> SubresourceRange {
    SubresourceRange {
        base_mip: desc.base_mip,
        num_mips: desc.num_mips.unwrap_or(total.num_mips.saturating_sub(desc.base_mip)),
        base_layer: desc.base_layer,
        num_layers: desc.num_layers.unwrap_or(total.num_layers.saturating_sub(desc.base_layer)),
    }
}

fn layout_for_dependency(layout: Layout) -> ImageLayout {
    match layout {
        Layout::General => ImageLayout::General,
        Layout::Read => ImageLayout::ShaderReadOnly,
        Layout::TransferSrc => ImageLayout::TransferSrc,
        Layout::TransferDst => ImageLayout::TransferDst,
        Layout::Present => ImageLayout::PresentSrc,
    }
}

fn extent_to_vk2d(extent: Extent3d) -> vk::Extent2D {
    vk::Extent2D { width: extent.width, height: extent.height }
}

impl RenderGraph {
    /// `compile(&mut ctx)` (spec §4.J). Produces an ordered `CompiledPass`
    /// list, then walks it once with a dry-run command buffer so every
    /// pipeline bound in a callback is pre-resolved against the real
    /// `PipelineResolver` before the first real frame. Replaces any
    /// previously compiled list.
    pub fn compile(
        &mut self,
        gpu: &Gpu,
        resources: &mut ResourceManager,
        pipelines: &mut crate::pipeline::PipelineResolver,
        deferred: &mut crate::deferred::DeferredQueue,
    ) {
        let mut compiled = Vec::with_capacity(self.passes.len());

        for pass in self.passes.drain(..) {
            let mut pre_barriers = Vec::new();

            let kind = match pass.kind {
                PassKind::Graphics { attachments } => {
                    assert!(!attachments.is_empty(), "a graphics pass requires at least one attachment");
                    let (compiled_attachments, render_area) =
                        compile_attachments(resources, &attachments, &mut pre_barriers);
                    CompiledKind::Graphics { attachments: compiled_attachments, render_area }
                }
                PassKind::Compute => CompiledKind::Compute,
                PassKind::Intermediate { op } => {
                    compile_intermediate_barriers(resources, &op, &mut pre_barriers);
                    CompiledKind::Intermediate { op }
                }
            };

            for dependency in &pass.dependencies {
                let total = resources
                    .tracker
                    .total_range(dependency.texture_desc.texture_handle)
                    .unwrap_or(SubresourceRange { base_mip: 0, num_mips: 1, base_layer: 0, num_layers: 1 });
                let range = resolve_range(&dependency.texture_desc, total);
                let new_layout = layout_for_dependency(dependency.layout);
                let (new_stage, new_access) = stage_access_for_layout(new_layout);
                pre_barriers.push(PreBarrier {
                    texture: dependency.texture_desc.texture_handle,
                    range,
                    new_layout,
                    new_stage,
                    new_access,
                });
            }

            compiled.push(CompiledPass { name: pass.name, kind, pre_barriers, callback: pass.callback });
        }

        self.compiled = compiled;
        self.has_compiled = true;

        self.dry_run_resolve(gpu, resources, pipelines, deferred);
    }

    /// §4.J(5): iterate every compiled pass once with `is_dry_run = true`
    /// so `cmd_bind_graphics_pipeline`/`cmd_bind_compute_pipeline` only
    /// drive pipeline resolution, guaranteeing no pipeline build happens
    /// during the first real frame. Resolves against the real
    /// `PipelineResolver`/`DeferredQueue` so the cache it primes is the one
    /// `execute` later reads from.
    fn dry_run_resolve(
        &mut self,
        gpu: &Gpu,
        resources: &mut ResourceManager,
        pipelines: &mut crate::pipeline::PipelineResolver,
        deferred: &mut crate::deferred::DeferredQueue,
    ) {
        let mut record_context =
            RecordContext { gpu, resources, pipelines, deferred, token: crate::command::SubmitToken::sentinel() };

        for (index, pass) in self.compiled.iter_mut().enumerate() {
            let Some(callback) = &mut pass.callback else { continue };
            let mut cmd = CommandBuffer { raw: vk::CommandBuffer::null(), is_dry_run: true, active_pass: Some(index) };
            callback(&mut cmd, &mut record_context);
        }

        log::debug!("RenderGraph: compiled {} passes, dry-run resolved pipelines", self.compiled.len());
    }
}

fn compile_attachments(
    resources: &ResourceManager,
    attachments: &[AttachmentDesc],
    pre_barriers: &mut Vec<PreBarrier>,
) -> (Vec<CompiledAttachment>, vk::Extent2D) {
    let mut reference_extent = None;
    let mut seen_depth = false;
    let mut compiled = Vec::with_capacity(attachments.len());

    for attachment in attachments {
        let handle = attachment.texture_desc.texture_handle;
        let format = resources.texture_format(handle).expect("attachment references an invalid texture handle");
        let extent = resources.texture_extent(handle).expect("attachment references an invalid texture handle");

        let vk_extent = extent_to_vk2d(extent);
        if let Some(reference) = reference_extent {
            debug_assert!(
                vk_extent.width == reference.width && vk_extent.height == reference.height,
                "attachment extent mismatch within a single graphics pass"
            );
        } else {
            reference_extent = Some(vk_extent);
        }

        if format.is_depth() {
            assert!(!seen_depth, "a graphics pass may declare at most one depth attachment");
            seen_depth = true;
        }

        let layout = if format.is_depth() { ImageLayout::DepthStencilAttachment } else { ImageLayout::ColorAttachment };
        let (stage, access) = stage_access_for_layout(layout);
        let total = resources
            .texture_range(handle)
            .unwrap_or(SubresourceRange { base_mip: 0, num_mips: 1, base_layer: 0, num_layers: 1 });
        pre_barriers.push(PreBarrier {
            texture: handle,
            range: resolve_range(&attachment.texture_desc, total),
            new_layout: layout,
            new_stage: stage,
            new_access: access,
        });

        let resolve = attachment.resolve_texture_desc.map(|resolve_desc| {
            let resolve_handle = resolve_desc.texture_handle;
            let src_samples = resources.texture_sample_count(handle).unwrap_or(1);
            let dst_samples = resources.texture_sample_count(resolve_handle).unwrap_or(1);
            assert!(src_samples > 1, "a resolve target requires the source attachment to be multisampled");
            assert_eq!(dst_samples, 1, "a resolve target must itself be single-sampled");

            let resolve_total = resources
                .texture_range(resolve_handle)
                .unwrap_or(SubresourceRange { base_mip: 0, num_mips: 1, base_layer: 0, num_layers: 1 });
            pre_barriers.push(PreBarrier {
                texture: resolve_handle,
                range: resolve_range(&resolve_desc, resolve_total),
                new_layout: ImageLayout::ColorAttachment,
                new_stage: stage,
                new_access: access,
            });

            (resources.texture_view(resolve_handle).expect("invalid resolve target handle"), ImageLayout::ColorAttachment)
        });

        compiled.push(CompiledAttachment {
            view: resources.texture_view(handle).expect("invalid attachment texture handle"),
            layout,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
            clear_value: attachment.clear_value,
            resolve,
        });
    }

    (compiled, reference_extent.expect("a graphics pass requires at least one attachment"))
}

fn compile_intermediate_barriers(resources: &ResourceManager, op: &IntermediateOp, pre_barriers: &mut Vec<PreBarrier>) {
    let mut push = |handle: TextureHandle, desc: &TextureDesc, layout: ImageLayout| {
        let total = resources
            .texture_range(handle)
            .unwrap_or(SubresourceRange { base_mip: 0, num_mips: 1, base_layer: 0, num_layers: 1 });
        let (stage, access) = stage_access_for_layout(layout);
        pre_barriers.push(PreBarrier { texture: handle, range: resolve_range(desc, total), new_layout: layout, new_stage: stage, new_access: access });
    };

    match op {
        IntermediateOp::CopyBuffer { .. } => {}
        IntermediateOp::BlitTexture { src, dst } => {
            push(src.texture_handle, src, ImageLayout::TransferSrc);
            push(dst.texture_handle, dst, ImageLayout::TransferDst);
        }
        IntermediateOp::GenerateMipmaps { texture } => {
            let desc = TextureDesc::new(*texture);
            push(*texture, &desc, ImageLayout::TransferDst);
        }
    }
}

impl ResourceManager {
    pub(crate) fn texture_range(&self, handle: TextureHandle) -> Option<SubresourceRange> {
        self.tracker.total_range(handle)
    }
}
