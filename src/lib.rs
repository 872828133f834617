//! Public façade (spec §6): a one-shot `Context::init`, a thin pass-through
//! to every resource/pipeline/command operation the components below it
//! implement, and the `Managed` RAII convenience wrapper the source's
//! `Holder<T>` (`Holder.h`) corresponds to.
//!
//! Everything that actually does work lives in the modules below; this
//! file wires them together into the one object an application holds.

mod bindless;
mod command;
mod deferred;
mod error;
mod graph;
mod handle;
mod pipeline;
mod pool;
mod resource;
mod staging;
mod swapchain;
mod texture_state;
mod vulkan;

use std::cell::RefCell;
use std::ffi::CStr;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

pub use bindless::BindlessDescriptorTable;
pub use command::{CommandBuffer, ImmediateCommands, RenderingAttachment, SubmitToken, RING_SIZE};
pub use error::ResourceWarning;
pub use graph::{
    AttachmentDesc, ClearValue, CompiledAttachment, CompiledPass, ComputePassBuilder,
    GraphicsPassBuilder, IntermediateOp, Layout, LoadOp, RecordContext, RenderGraph, StoreOp,
    TextureDesc,
};
pub use handle::{
    Buffer, BufferHandle, ComputePipeline, ComputePipelineHandle, GraphicsPipeline,
    GraphicsPipelineHandle, Handle, Kind, Sampler, SamplerHandle, Shader, ShaderHandle, Texture,
    TextureHandle, TextureView, TextureViewHandle,
};
pub use pipeline::{
    BlendState, CompareOp, ComputePipelineSpec, DepthState, GraphicsPipelineSpec, RenderPassShape,
    SpecializationEntry, SpecializationTarget, Topology,
};
pub use resource::{
    AddressMode, BufferSpec, BufferUsage, DescriptorBinding, DescriptorSetSignature,
    DescriptorType, Extent3d, FilterMode, Format, ReflectedLayout, SamplerSpec, ShaderSpec,
    StorageClass, TextureSpec, TextureUploadRegion, TextureUsage,
};
pub use staging::StagingUploader;
pub use swapchain::{AcquireOutcome, SwapchainDesc, MAX_IMAGES};
pub use vulkan::Gpu;

use pipeline::PipelineResolver;
use resource::ResourceManager;
use swapchain::Swapchain;

/// One-shot configuration consumed by [`Context::init`] (spec §6). Borrows
/// rather than owns: the caller's window/display handles and extension
/// list only need to outlive the `init` call itself.
pub struct ContextDesc<'a> {
    pub app_name: &'a str,
    pub engine_name: &'a str,
    pub validation: bool,
    pub window: Option<RawWindowHandle>,
    pub display: Option<RawDisplayHandle>,
    pub extra_device_extensions: &'a [&'a CStr],
    /// Directories a shader compiler would search for `#include`s. Stored
    /// on the desc and otherwise unconsumed: this crate takes pre-compiled
    /// SPIR-V (see [`ShaderSpec`]), so there is no in-crate compiler to
    /// feed it to. Kept as a configuration surface for a caller that runs
    /// its own compilation step and wants one place to declare its search
    /// path alongside the rest of the context's one-shot configuration.
    pub shader_search_paths: &'a [std::path::PathBuf],
    pub swapchain: Option<SwapchainDesc>,
}

impl<'a> Default for ContextDesc<'a> {
    fn default() -> Self {
        Self {
            app_name: "ashforge-graphics",
            engine_name: "ashforge-graphics",
            validation: cfg!(debug_assertions),
            window: None,
            display: None,
            extra_device_extensions: &[],
            shader_search_paths: &[],
            swapchain: None,
        }
    }
}

/// Which pipeline a [`DescriptorWriter`] resolves its named bindings
/// against (spec §6, "open_descriptor_update").
#[derive(Clone, Copy, Debug)]
pub enum BoundPipeline {
    Graphics(GraphicsPipelineHandle),
    Compute(ComputePipelineHandle),
}

/// Accumulates `(name, buffer)` pairs for one descriptor update (spec §6's
/// `Writer`). This crate has no non-bindless descriptor sets — every
/// pipeline binds only the bindless table (§4.E) — so a named "binding" is
/// really a byte offset in the pipeline's push-constant block, and
/// updating it means writing the buffer's GPU address there. The spec's
/// alternate `(buffer_h, set, binding)` coordinate form has no referent in
/// a fully-bindless-by-construction layout and is deliberately not
/// implemented; see DESIGN.md.
pub struct DescriptorWriter {
    pipeline: BoundPipeline,
    pending: Vec<(String, BufferHandle)>,
}

impl DescriptorWriter {
    /// Stages `buffer`'s GPU address to be written at the push-constant
    /// member named `name` in the target pipeline's reflected layout.
    pub fn update_binding(&mut self, buffer: BufferHandle, name: &str) -> &mut Self {
        self.pending.push((name.to_owned(), buffer));
        self
    }
}

/// RAII handle wrapper external to the core (spec §9): holds a
/// `(context, handle)` pair and calls back into the owning `Context` for
/// destruction on drop. A weak reference plus lookup, never ownership —
/// mirrors the source's `Holder<T>` (`Holder.h`).
pub struct Managed<'ctx, K: Kind> {
    handle: Handle<K>,
    context: &'ctx Context,
    destroy: fn(&Context, Handle<K>),
}

impl<'ctx, K: Kind> Managed<'ctx, K> {
    pub fn handle(&self) -> Handle<K> {
        self.handle
    }
}

impl<'ctx, K: Kind> Drop for Managed<'ctx, K> {
    fn drop(&mut self) {
        (self.destroy)(self.context, self.handle);
    }
}

/// Owns the live GPU context: instance/device, every resource pool, the
/// pipeline resolver, the immediate-command ring, the deferred-destruction
/// queue, and (if configured) the swapchain. The single entry point
/// described by spec §6.
///
/// Internally single-threaded and cooperative (spec §5): the managers are
/// wrapped in `RefCell` purely so [`Managed`] can hold a shared `&Context`
/// back-reference; there is exactly one logical lock, checked at runtime
/// instead of compile time, and it is a programmer error (panic) to
/// violate it by re-entering a borrow.
pub struct Context {
    gpu: Gpu,
    resources: RefCell<ResourceManager>,
    pipelines: RefCell<PipelineResolver>,
    commands: RefCell<ImmediateCommands>,
    deferred: RefCell<DeferredQueueHandle>,
    swapchain: RefCell<Option<Swapchain>>,
}

/// Newtype so `RefCell<DeferredQueue>` doesn't need a `use` alias fight
/// with the `deferred` module name at the field-type site.
type DeferredQueueHandle = deferred::DeferredQueue;

impl Context {
    /// Brings up a Vulkan 1.3 instance/device/queue/allocator and every
    /// manager on top of it, plus (if `desc.window`/`desc.display`/
    /// `desc.swapchain` are all given) a live swapchain.
    ///
    /// # Safety
    /// See [`Gpu::init`]: the process must have a usable Vulkan loader, and
    /// any window/display handle given must name a live window for as long
    /// as the resulting swapchain exists.
    pub unsafe fn init(desc: &ContextDesc) -> Self {
        let gpu = Gpu::init(desc);
        let mut resources = ResourceManager::new(&gpu);
        let pipelines = PipelineResolver::new();
        let commands = ImmediateCommands::new(&gpu, gpu.queue_family_index);
        let deferred = deferred::DeferredQueue::new();

        let swapchain = match (desc.window, desc.display, desc.swapchain) {
            (Some(window), Some(display), Some(swapchain_desc)) => {
                let surface = ash_window::create_surface(&gpu.entry, &gpu.instance, display, window, None)
                    .expect("vkCreateSurfaceKHR failed");
                let surface_loader = ash::khr::surface::Instance::new(&gpu.entry, &gpu.instance);
                Some(Swapchain::new(&gpu, surface_loader, surface, &swapchain_desc, &mut resources))
            }
            _ => None,
        };

        Self {
            gpu,
            resources: RefCell::new(resources),
            pipelines: RefCell::new(pipelines),
            commands: RefCell::new(commands),
            deferred: RefCell::new(deferred),
            swapchain: RefCell::new(swapchain),
        }
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    /// The `SubmitToken` a newly-created destroy/defer call should be keyed
    /// with: the last real submission, or (per `DeferredQueue::defer_with_fallback`'s
    /// intent, applied here at the call site as `resource.rs`'s doc comments
    /// require) the *next* token if nothing has been submitted yet.
    fn destroy_token(&self) -> SubmitToken {
        let commands = self.commands.borrow();
        let last = commands.last_submit_token();
        if last.is_sentinel() {
            commands.next_submit_token()
        } else {
            last
        }
    }

    //=========================================================================
    // Per-frame maintenance and the command/submit loop (spec §4.D, §6)
    //=========================================================================

    /// Drains every deferred-destruction task whose token has retired, then
    /// grows/rewrites the bindless table if occupancy or dirtiness demands
    /// it. Call once near the start of each frame, before recording.
    pub fn begin_frame(&self) {
        let mut commands = self.commands.borrow_mut();
        let mut deferred = self.deferred.borrow_mut();
        deferred.drain_ready(|token| commands.is_retired(&self.gpu, token, true));

        let next_token = commands.next_submit_token();
        let mut resources = self.resources.borrow_mut();
        unsafe {
            resources.maintain_bindless(&self.gpu, &mut deferred, next_token);
        }
    }

    /// Acquires a recorder from the ring, blocking only if every recorder
    /// is still in flight (the one implicit block in the frame loop).
    pub fn open_command(&self) -> CommandBuffer {
        self.commands.borrow_mut().acquire(&self.gpu)
    }

    pub fn submit_command(&self, cmd: CommandBuffer) -> SubmitToken {
        self.commands.borrow_mut().submit(&self.gpu, cmd)
    }

    /// Blocks until `token` has retired.
    pub fn wait_command(&self, token: SubmitToken) {
        self.commands.borrow_mut().wait(&self.gpu, token);
    }

    pub fn request_wait(&self, semaphore: vk::Semaphore, stage_mask: vk::PipelineStageFlags2) {
        self.commands.borrow_mut().request_wait(semaphore, stage_mask);
    }

    pub fn request_signal(&self, semaphore: vk::Semaphore, value: u64, stage_mask: vk::PipelineStageFlags2) {
        self.commands.borrow_mut().request_signal(semaphore, value, stage_mask);
    }

    pub fn last_submit_token(&self) -> SubmitToken {
        self.commands.borrow().last_submit_token()
    }

    //=========================================================================
    // Render graph (spec §4.I–K)
    //=========================================================================

    pub fn compile_graph(&self, graph: &mut RenderGraph) {
        graph.compile(
            &self.gpu,
            &mut self.resources.borrow_mut(),
            &mut self.pipelines.borrow_mut(),
            &mut self.deferred.borrow_mut(),
        );
    }

    pub fn execute_graph(&self, graph: &mut RenderGraph, cmd: &mut CommandBuffer, token: SubmitToken) {
        graph.execute(
            cmd,
            &self.gpu,
            &mut self.resources.borrow_mut(),
            &mut self.pipelines.borrow_mut(),
            &mut self.deferred.borrow_mut(),
            token,
        );
    }

    //=========================================================================
    // Resource CRUD (spec §4.B, §4.F)
    //=========================================================================

    pub fn create_texture(&self, spec: &TextureSpec) -> TextureHandle {
        unsafe { self.resources.borrow_mut().create_texture(&self.gpu, spec) }
    }

    pub fn destroy_texture(&self, handle: TextureHandle) {
        let token = self.destroy_token();
        self.resources.borrow_mut().destroy_texture(&self.gpu, &mut self.deferred.borrow_mut(), handle, token);
    }

    /// # Safety
    /// `handle` must not be in use by a submission that has not yet
    /// retired; the caller is responsible for any synchronization the new
    /// extent implies for in-flight reads.
    pub unsafe fn resize_texture(&self, handle: TextureHandle, new_extent: Extent3d) {
        let token = self.destroy_token();
        self.resources.borrow_mut().resize_texture(&self.gpu, &mut self.deferred.borrow_mut(), handle, new_extent, token);
    }

    pub fn create_buffer(&self, spec: &BufferSpec) -> BufferHandle {
        unsafe { self.resources.borrow_mut().create_buffer(&self.gpu, spec) }
    }

    pub fn destroy_buffer(&self, handle: BufferHandle) {
        let token = self.destroy_token();
        self.resources.borrow_mut().destroy_buffer(&self.gpu, &mut self.deferred.borrow_mut(), handle, token);
    }

    pub fn create_sampler(&self, spec: &SamplerSpec) -> SamplerHandle {
        unsafe { self.resources.borrow_mut().create_sampler(&self.gpu, spec) }
    }

    pub fn destroy_sampler(&self, handle: SamplerHandle) {
        let token = self.destroy_token();
        self.resources.borrow_mut().destroy_sampler(&self.gpu, &mut self.deferred.borrow_mut(), handle, token);
    }

    pub fn create_shader(&self, spec: &ShaderSpec) -> ShaderHandle {
        unsafe { self.pipelines.borrow_mut().create_shader(&self.gpu, spec) }
    }

    pub fn create_graphics_pipeline(&self, spec: GraphicsPipelineSpec, reflected: ReflectedLayout) -> GraphicsPipelineHandle {
        self.pipelines.borrow_mut().create_graphics_pipeline(spec, reflected)
    }

    pub fn create_compute_pipeline(&self, spec: ComputePipelineSpec, reflected: ReflectedLayout) -> ComputePipelineHandle {
        self.pipelines.borrow_mut().create_compute_pipeline(spec, reflected)
    }

    pub fn upload(&self, uploader: &mut dyn StagingUploader, handle: BufferHandle, data: &[u8], offset: u64) -> Result<SubmitToken, ResourceWarning> {
        self.resources.borrow_mut().upload(uploader, handle, data, offset)
    }

    pub fn download(&self, uploader: &mut dyn StagingUploader, handle: BufferHandle, out: &mut [u8], offset: u64) -> Result<SubmitToken, ResourceWarning> {
        self.resources.borrow_mut().download(uploader, handle, out, offset)
    }

    /// Stages a texture upload through `uploader`. Unlike [`Self::upload`]
    /// there is no buffer-bounds class of warning to return: the region is
    /// either well-formed against the texture's payload or this is a
    /// programmer error and panics, matching `TextureStateTracker`'s own
    /// subresource-range assertions.
    pub fn upload_texture(&self, uploader: &mut dyn StagingUploader, handle: TextureHandle, data: &[u8], region: TextureUploadRegion) -> SubmitToken {
        if data.is_empty() {
            log::warn!("Context::upload_texture: {}", ResourceWarning::NullUploadData);
            return self.last_submit_token();
        }
        let resources = self.resources.borrow();
        let payload = resources.texture_payload(handle).expect("invalid texture handle");
        uploader.upload_texture(payload, data, region)
    }

    pub fn generate_mipmaps(&self, uploader: &mut dyn StagingUploader, handle: TextureHandle) -> SubmitToken {
        let resources = self.resources.borrow();
        let payload = resources.texture_payload(handle).expect("invalid texture handle");
        uploader.generate_mipmaps(payload)
    }

    pub fn gpu_address(&self, handle: BufferHandle, offset: u64) -> Option<vk::DeviceAddress> {
        self.resources.borrow().gpu_address(handle, offset)
    }

    //=========================================================================
    // Descriptor updates (spec §6)
    //=========================================================================

    pub fn open_descriptor_update(&self, pipeline: BoundPipeline) -> DescriptorWriter {
        DescriptorWriter { pipeline, pending: Vec::new() }
    }

    /// Resolves every staged `(name, buffer)` pair against the target
    /// pipeline's reflected push-constant layout and returns the resulting
    /// byte blob. The caller pushes it with [`CommandBuffer::cmd_push_constants`]
    /// the next time that pipeline is bound.
    pub fn submit_descriptor_update(&self, writer: DescriptorWriter) -> Vec<u8> {
        let pipelines = self.pipelines.borrow();
        let reflected = match writer.pipeline {
            BoundPipeline::Graphics(handle) => {
                pipelines.graphics_reflected(handle).expect("invalid graphics pipeline handle")
            }
            BoundPipeline::Compute(handle) => {
                pipelines.compute_reflected(handle).expect("invalid compute pipeline handle")
            }
        };

        let mut bytes = vec![0u8; reflected.push_constant_size as usize];
        let resources = self.resources.borrow();
        for (name, buffer) in &writer.pending {
            let offset = reflected
                .push_constant_members
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, offset)| *offset as usize)
                .unwrap_or_else(|| panic!("push-constant member \"{name}\" not found in reflected shader layout"));
            let address = resources
                .gpu_address(*buffer, 0)
                .unwrap_or_else(|| panic!("buffer bound to \"{name}\" has no GPU address (create it with BufferUsage::STORAGE)"));
            bytes[offset..offset + 8].copy_from_slice(bytemuck::bytes_of(&address));
        }
        bytes
    }

    //=========================================================================
    // Swapchain (spec §4.L, §6)
    //=========================================================================

    pub fn is_swapchain_dirty(&self) -> bool {
        self.swapchain.borrow().as_ref().map(Swapchain::is_dirty).unwrap_or(false)
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.borrow().as_ref().expect("Context has no swapchain").extent()
    }

    pub fn swapchain_format(&self) -> Format {
        self.swapchain.borrow().as_ref().expect("Context has no swapchain").format()
    }

    pub fn current_backbuffer(&self) -> TextureHandle {
        self.swapchain.borrow().as_ref().expect("Context has no swapchain").get_current_backbuffer_texture_handle()
    }

    pub fn acquire_swapchain(&self) -> AcquireOutcome {
        let mut swapchain = self.swapchain.borrow_mut();
        let swapchain = swapchain.as_mut().expect("Context has no swapchain");
        swapchain.acquire(&self.gpu, &mut self.commands.borrow_mut())
    }

    pub fn prepare_submit_signal(&self) {
        let mut swapchain = self.swapchain.borrow_mut();
        let swapchain = swapchain.as_mut().expect("Context has no swapchain");
        swapchain.prepare_submit_signal(&self.gpu, &mut self.commands.borrow_mut());
    }

    pub fn present(&self) {
        let mut swapchain = self.swapchain.borrow_mut();
        let swapchain = swapchain.as_mut().expect("Context has no swapchain");
        swapchain.present(&self.gpu, &self.commands.borrow());
    }

    /// # Safety
    /// Must only be called when no frame in flight references the current
    /// swapchain images (the caller should wait idle first, the way any
    /// `VK_ERROR_OUT_OF_DATE_KHR`/resize path does).
    pub unsafe fn recreate_swapchain(&self, width: u32, height: u32) {
        let mut swapchain = self.swapchain.borrow_mut();
        let swapchain = swapchain.as_mut().expect("Context has no swapchain");
        swapchain.recreate_standard(&self.gpu, &mut self.resources.borrow_mut(), width, height);
    }

    //=========================================================================
    // Managed convenience wrappers (spec §9)
    //=========================================================================

    pub fn manage_texture(&self, handle: TextureHandle) -> Managed<'_, handle::Texture> {
        Managed { handle, context: self, destroy: |ctx, h| ctx.destroy_texture(h) }
    }

    pub fn manage_buffer(&self, handle: BufferHandle) -> Managed<'_, handle::Buffer> {
        Managed { handle, context: self, destroy: |ctx, h| ctx.destroy_buffer(h) }
    }

    pub fn manage_sampler(&self, handle: SamplerHandle) -> Managed<'_, handle::Sampler> {
        Managed { handle, context: self, destroy: |ctx, h| ctx.destroy_sampler(h) }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.gpu.wait_idle();

        let mut deferred = self.deferred.borrow_mut();
        deferred.drain_all(|token| self.commands.borrow_mut().wait(&self.gpu, token));

        unsafe {
            if let Some(swapchain) = self.swapchain.borrow_mut().as_mut() {
                swapchain.destroy(&self.gpu, &mut self.resources.borrow_mut());
            }
            self.commands.borrow_mut().destroy(&self.gpu);
            self.pipelines.borrow_mut().destroy(&self.gpu);
            self.resources.borrow_mut().destroy(&self.gpu);
        }
    }
}
