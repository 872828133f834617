//! `PipelineResolver` (component H): pipelines are specified eagerly at
//! creation but built lazily at first use, against the attachment formats
//! and sample count the render graph discovers at compile time (spec
//! §4.H).

use ash::vk;

use crate::bindless::BindlessDescriptorTable;
use crate::command::CommandBuffer;
use crate::deferred::DeferredQueue;
use crate::handle::{ComputePipelineHandle, GraphicsPipelineHandle, ShaderHandle};
use crate::pool::HandlePool;
use crate::resource::Format;
use crate::vulkan::Gpu;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Clone, Copy, Debug)]
pub struct DepthState {
    pub test_enable: bool,
    pub write_enable: bool,
    pub compare: CompareOp,
}

#[derive(Clone, Copy, Debug)]
pub struct BlendState {
    pub enable: bool,
}

/// One specialization-constant entry, resolved either by explicit index or
/// by a name looked up in the shader's reflected `name → id` map.
#[derive(Clone, Debug)]
pub enum SpecializationTarget {
    Index(u32),
    Name(String),
}

#[derive(Clone, Debug)]
pub struct SpecializationEntry {
    pub target: SpecializationTarget,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct GraphicsPipelineSpec {
    pub vertex_shader: ShaderHandle,
    pub fragment_shader: ShaderHandle,
    pub topology: Topology,
    pub depth: Option<DepthState>,
    pub blend: BlendState,
    pub multisample_count: u32,
    pub specialization: Vec<SpecializationEntry>,
    pub debug_name: String,
}

#[derive(Clone, Debug)]
pub struct ComputePipelineSpec {
    pub shader: ShaderHandle,
    pub specialization: Vec<SpecializationEntry>,
    pub debug_name: String,
}

/// The render-pass-shaped context a graphics pipeline is built against,
/// discovered by the graph compiler (§4.J) and handed to the resolver at
/// the dry-run / first-bind trigger.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderPassShape {
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub sample_count: u32,
}

struct GraphicsPipelinePayload {
    spec: GraphicsPipelineSpec,
    reflected: crate::resource::ReflectedLayout,
    built: Option<(vk::Pipeline, vk::PipelineLayout, RenderPassShape, u64)>,
}

struct ComputePipelinePayload {
    spec: ComputePipelineSpec,
    reflected: crate::resource::ReflectedLayout,
    built: Option<(vk::Pipeline, vk::PipelineLayout, u64)>,
}

/// Owns every pipeline's specification, its lazily-built GPU object, and
/// invalidates/rebuilds on bindless-layout growth.
pub struct PipelineResolver {
    graphics: HandlePool<crate::handle::GraphicsPipeline, Option<GraphicsPipelinePayload>>,
    compute: HandlePool<crate::handle::ComputePipeline, Option<ComputePipelinePayload>>,
    shader_modules: HandlePool<crate::handle::Shader, Option<ShaderModulePayload>>,
    bindless_generation: u64,
}

struct ShaderModulePayload {
    module: vk::ShaderModule,
    entry_point: std::ffi::CString,
    stage: vk::ShaderStageFlags,
    reflected: crate::resource::ReflectedLayout,
}

impl Default for PipelineResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineResolver {
    pub fn new() -> Self {
        Self { graphics: HandlePool::new(), compute: HandlePool::new(), shader_modules: HandlePool::new(), bindless_generation: 0 }
    }

    /// # Safety
    /// `gpu` must be a live device.
    pub unsafe fn create_shader(&mut self, gpu: &Gpu, spec: &crate::resource::ShaderSpec) -> ShaderHandle {
        let info = vk::ShaderModuleCreateInfo::default().code(spec.spirv);
        let module = gpu.device.create_shader_module(&info, None).expect("vkCreateShaderModule failed");
        let entry_point = std::ffi::CString::new(spec.entry_point).expect("entry point must not contain a NUL byte");
        self.shader_modules.insert(Some(ShaderModulePayload {
            module,
            entry_point,
            stage: spec.stage,
            reflected: spec.reflected.clone(),
        }))
    }

    pub fn create_graphics_pipeline(&mut self, spec: GraphicsPipelineSpec, reflected: crate::resource::ReflectedLayout) -> GraphicsPipelineHandle {
        self.graphics.insert(Some(GraphicsPipelinePayload { spec, reflected, built: None }))
    }

    pub fn create_compute_pipeline(&mut self, spec: ComputePipelineSpec, reflected: crate::resource::ReflectedLayout) -> ComputePipelineHandle {
        self.compute.insert(Some(ComputePipelinePayload { spec, reflected, built: None }))
    }

    /// The reflected layout backing a graphics pipeline's push constants,
    /// used to resolve named writes in [`crate::DescriptorWriter`].
    pub(crate) fn graphics_reflected(&self, handle: GraphicsPipelineHandle) -> Option<&crate::resource::ReflectedLayout> {
        self.graphics.get(handle).and_then(|slot| slot.as_ref()).map(|p| &p.reflected)
    }

    pub(crate) fn compute_reflected(&self, handle: ComputePipelineHandle) -> Option<&crate::resource::ReflectedLayout> {
        self.compute.get(handle).and_then(|slot| slot.as_ref()).map(|p| &p.reflected)
    }

    /// Called once the bindless table has been rebuilt (capacity growth).
    /// Invalidates every already-built pipeline so the next bind rebuilds
    /// it against the new descriptor-set layout; destruction of the stale
    /// objects is deferred by the caller.
    pub fn invalidate_for_bindless_growth(&mut self) {
        self.bindless_generation += 1;
    }

    /// # Safety
    /// Must be called only at manager teardown, after a device-idle wait.
    pub unsafe fn destroy(&mut self, gpu: &Gpu) {
        let graphics_handles: Vec<_> = self.graphics.iter_active().map(|(h, _)| h).collect();
        for handle in graphics_handles {
            if let Some(Some(payload)) = self.graphics.get_mut(handle) {
                if let Some((pipeline, layout, _, _)) = payload.built.take() {
                    gpu.device.destroy_pipeline(pipeline, None);
                    gpu.device.destroy_pipeline_layout(layout, None);
                }
            }
        }

        let compute_handles: Vec<_> = self.compute.iter_active().map(|(h, _)| h).collect();
        for handle in compute_handles {
            if let Some(Some(payload)) = self.compute.get_mut(handle) {
                if let Some((pipeline, layout, _)) = payload.built.take() {
                    gpu.device.destroy_pipeline(pipeline, None);
                    gpu.device.destroy_pipeline_layout(layout, None);
                }
            }
        }

        let shader_handles: Vec<_> = self.shader_modules.iter_active().map(|(h, _)| h).collect();
        for handle in shader_handles {
            if let Some(Some(payload)) = self.shader_modules.get_mut(handle) {
                gpu.device.destroy_shader_module(payload.module, None);
            }
        }
    }

    /// Resolve (building if necessary) the graphics pipeline for `handle`
    /// against `shape`. Returns the raw pipeline plus the layout a bind
    /// call needs. Called from the dry-run execute (first resolution) and
    /// from the real execute's bind call (cache hit in steady state).
    ///
    /// # Safety
    /// `gpu` must be a live device; `bindless_layout` must be the table's
    /// current descriptor-set layout.
    pub unsafe fn resolve_graphics(
        &mut self,
        gpu: &Gpu,
        handle: GraphicsPipelineHandle,
        shape: &RenderPassShape,
        bindless_layout: vk::DescriptorSetLayout,
        deferred: &mut crate::deferred::DeferredQueue,
        token: crate::command::SubmitToken,
    ) -> (vk::Pipeline, vk::PipelineLayout) {
        let bindless_generation = self.bindless_generation;
        let slot = self.graphics.get_mut(handle).expect("invalid graphics pipeline handle").as_mut().unwrap();

        if let Some((pipeline, layout, built_shape, built_generation)) = &slot.built {
            if built_shape == shape && *built_generation == bindless_generation {
                return (*pipeline, *layout);
            }
            // Attachment shape or bindless layout changed: defer the stale
            // objects and rebuild.
            let (old_pipeline, old_layout) = (*pipeline, *layout);
            let gpu_device = gpu.device.clone();
            deferred.defer(
                move || unsafe {
                    gpu_device.destroy_pipeline(old_pipeline, None);
                    gpu_device.destroy_pipeline_layout(old_layout, None);
                },
                token,
            );
            slot.built = None;
        }

        let vertex = self.shader_modules.get(slot.spec.vertex_shader).expect("invalid vertex shader handle").as_ref().unwrap();
        let fragment = self.shader_modules.get(slot.spec.fragment_shader).expect("invalid fragment shader handle").as_ref().unwrap();

        let push_constant_size = slot.reflected.push_constant_size;
        let push_constant_ranges = if push_constant_size > 0 {
            vec![vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::ALL)
                .offset(0)
                .size(push_constant_size)]
        } else {
            Vec::new()
        };
        let set_layouts = [bindless_layout, bindless_layout, bindless_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = gpu.device.create_pipeline_layout(&layout_info, None).expect("vkCreatePipelineLayout failed");

        let specialization_data = resolve_specialization(&slot.spec.specialization, &slot.reflected);

        let (vertex_spec_entries, vertex_spec_data) = &specialization_data;
        let vertex_spec_info = vk::SpecializationInfo::default()
            .map_entries(vertex_spec_entries)
            .data(vertex_spec_data);
        let fragment_spec_info = vertex_spec_info;

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex.module)
                .name(&vertex.entry_point)
                .specialization_info(&vertex_spec_info),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment.module)
                .name(&fragment.entry_point)
                .specialization_info(&fragment_spec_info),
        ];

        let color_formats: Vec<vk::Format> = shape.color_formats.iter().map(|f| f.to_vk()).collect();
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
        if let Some(depth_format) = shape.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format.to_vk());
        }

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default().topology(map_topology(slot.spec.topology));
        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(sample_count_flags(shape.sample_count));
        let depth_stencil = slot.spec.depth.map(map_depth_state).unwrap_or_default();
        let attachments: Vec<_> = color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(slot.spec.blend.enable)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipeline = gpu
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
            .expect("vkCreateGraphicsPipelines failed")[0];

        log::info!("PipelineResolver: built graphics pipeline \"{}\"", slot.spec.debug_name);
        slot.built = Some((pipeline, layout, shape.clone(), bindless_generation));
        (pipeline, layout)
    }

    /// # Safety
    /// `gpu` must be a live device; `bindless_layout` must be the table's
    /// current descriptor-set layout.
    pub unsafe fn resolve_compute(
        &mut self,
        gpu: &Gpu,
        handle: ComputePipelineHandle,
        bindless_layout: vk::DescriptorSetLayout,
        deferred: &mut crate::deferred::DeferredQueue,
        token: crate::command::SubmitToken,
    ) -> (vk::Pipeline, vk::PipelineLayout) {
        let bindless_generation = self.bindless_generation;
        let slot = self.compute.get_mut(handle).expect("invalid compute pipeline handle").as_mut().unwrap();

        if let Some((pipeline, layout, built_generation)) = slot.built {
            if built_generation == bindless_generation {
                return (pipeline, layout);
            }
            let gpu_device = gpu.device.clone();
            deferred.defer(
                move || unsafe {
                    gpu_device.destroy_pipeline(pipeline, None);
                    gpu_device.destroy_pipeline_layout(layout, None);
                },
                token,
            );
            slot.built = None;
        }

        let shader = self.shader_modules.get(slot.spec.shader).expect("invalid compute shader handle").as_ref().unwrap();

        let push_constant_size = slot.reflected.push_constant_size;
        let push_constant_ranges = if push_constant_size > 0 {
            vec![vk::PushConstantRange::default().stage_flags(vk::ShaderStageFlags::COMPUTE).offset(0).size(push_constant_size)]
        } else {
            Vec::new()
        };
        let set_layouts = [bindless_layout, bindless_layout, bindless_layout];
        let layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts).push_constant_ranges(&push_constant_ranges);
        let layout = gpu.device.create_pipeline_layout(&layout_info, None).expect("vkCreatePipelineLayout failed");

        let (entries, data) = resolve_specialization(&slot.spec.specialization, &slot.reflected);
        let spec_info = vk::SpecializationInfo::default().map_entries(&entries).data(&data);
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module)
            .name(&shader.entry_point)
            .specialization_info(&spec_info);

        let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);
        let pipeline = gpu
            .device
            .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
            .expect("vkCreateComputePipelines failed")[0];

        log::info!("PipelineResolver: built compute pipeline \"{}\"", slot.spec.debug_name);
        slot.built = Some((pipeline, layout, bindless_generation));
        (pipeline, layout)
    }
}

/// `cmdBindGraphicsPipeline` (spec §4.H / §4.J(5)): under dry-run this only
/// drives the resolver so the pipeline is built against `shape`; otherwise
/// it binds the pipeline plus the bindless set at sets 0..2.
///
/// # Safety
/// `gpu` must be a live device; `bindless` must belong to the same manager
/// as `resolver`'s pipelines.
pub unsafe fn cmd_bind_graphics_pipeline(
    cmd: &mut CommandBuffer,
    resolver: &mut PipelineResolver,
    gpu: &Gpu,
    bindless: &BindlessDescriptorTable,
    deferred: &mut DeferredQueue,
    token: crate::command::SubmitToken,
    handle: GraphicsPipelineHandle,
    shape: &RenderPassShape,
) {
    let bindless_layout = bindless.layout().expect("bindless table must be built before binding a pipeline");
    let (pipeline, layout) = resolver.resolve_graphics(gpu, handle, shape, bindless_layout, deferred, token);
    if cmd.is_dry_run() {
        return;
    }
    unsafe {
        gpu.device.cmd_bind_pipeline(cmd.raw(), vk::PipelineBindPoint::GRAPHICS, pipeline);
    }
    let set = bindless.set().expect("bindless table must be built before binding a pipeline");
    cmd.cmd_bind_descriptor_sets(gpu, layout, set, vk::PipelineBindPoint::GRAPHICS);
}

/// `cmdBindComputePipeline`, the compute counterpart of
/// [`cmd_bind_graphics_pipeline`]. Compute pipelines don't depend on
/// attachment shape, only the shader module and spec constants (§4.H).
///
/// # Safety
/// `gpu` must be a live device; `bindless` must belong to the same manager
/// as `resolver`'s pipelines.
pub unsafe fn cmd_bind_compute_pipeline(
    cmd: &mut CommandBuffer,
    resolver: &mut PipelineResolver,
    gpu: &Gpu,
    bindless: &BindlessDescriptorTable,
    deferred: &mut DeferredQueue,
    token: crate::command::SubmitToken,
    handle: ComputePipelineHandle,
) {
    let bindless_layout = bindless.layout().expect("bindless table must be built before binding a pipeline");
    let (pipeline, layout) = resolver.resolve_compute(gpu, handle, bindless_layout, deferred, token);
    if cmd.is_dry_run() {
        return;
    }
    unsafe {
        gpu.device.cmd_bind_pipeline(cmd.raw(), vk::PipelineBindPoint::COMPUTE, pipeline);
    }
    let set = bindless.set().expect("bindless table must be built before binding a pipeline");
    cmd.cmd_bind_descriptor_sets(gpu, layout, set, vk::PipelineBindPoint::COMPUTE);
}

/// Turn each [`SpecializationEntry`] into a `(VkSpecializationMapEntry,
/// offset-into-data)` pair, resolving name-based targets via the shader's
/// reflected `name → id` map. Missing names are fatal (spec §4.H).
fn resolve_specialization(
    entries: &[SpecializationEntry],
    reflected: &crate::resource::ReflectedLayout,
) -> (Vec<vk::SpecializationMapEntry>, Vec<u8>) {
    let mut map_entries = Vec::with_capacity(entries.len());
    let mut data = Vec::new();
    for entry in entries {
        let constant_id = match &entry.target {
            SpecializationTarget::Index(id) => *id,
            SpecializationTarget::Name(name) => reflected
                .spec_constants
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
                .unwrap_or_else(|| panic!("specialization constant \"{name}\" not found in reflected shader layout")),
        };
        let offset = data.len() as u32;
        data.extend_from_slice(&entry.bytes);
        map_entries.push(vk::SpecializationMapEntry::default().constant_id(constant_id).offset(offset).size(entry.bytes.len()));
    }
    (map_entries, data)
}

fn map_topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

fn map_compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

fn map_depth_state(state: DepthState) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
    vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(state.test_enable)
        .depth_write_enable(state.write_enable)
        .depth_compare_op(map_compare_op(state.compare))
}

fn sample_count_flags(count: u32) -> vk::SampleCountFlags {
    match count {
        1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        other => panic!("unsupported sample count {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ReflectedLayout;

    #[test]
    fn specialization_resolves_by_explicit_index() {
        let reflected = ReflectedLayout { descriptor_sets: Vec::new(), push_constant_size: 0, spec_constants: Vec::new(), push_constant_members: Vec::new() };
        let entries = vec![SpecializationEntry { target: SpecializationTarget::Index(3), bytes: vec![1, 0, 0, 0] }];
        let (map_entries, data) = resolve_specialization(&entries, &reflected);
        assert_eq!(map_entries.len(), 1);
        assert_eq!(map_entries[0].constant_id, 3);
        assert_eq!(data, vec![1, 0, 0, 0]);
    }

    #[test]
    fn specialization_resolves_by_reflected_name() {
        let reflected = ReflectedLayout {
            descriptor_sets: Vec::new(),
            push_constant_size: 0,
            spec_constants: vec![("kTileSize".to_owned(), 7)],
            push_constant_members: Vec::new(),
        };
        let entries = vec![SpecializationEntry { target: SpecializationTarget::Name("kTileSize".to_owned()), bytes: vec![8, 0, 0, 0] }];
        let (map_entries, _) = resolve_specialization(&entries, &reflected);
        assert_eq!(map_entries[0].constant_id, 7);
    }

    #[test]
    #[should_panic(expected = "not found in reflected shader layout")]
    fn specialization_with_missing_name_is_fatal() {
        let reflected = ReflectedLayout { descriptor_sets: Vec::new(), push_constant_size: 0, spec_constants: Vec::new(), push_constant_members: Vec::new() };
        let entries = vec![SpecializationEntry { target: SpecializationTarget::Name("missing".to_owned()), bytes: vec![] }];
        resolve_specialization(&entries, &reflected);
    }
}
