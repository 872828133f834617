//! `ImmediateCommands`: a fixed ring of command buffers, each paired with a
//! fence and a binary semaphore, protected by a monotonically increasing
//! `SubmitToken`. Mirrors the source's `ImmediateCommands` (`ImmediateCommands.h`),
//! itself derived from lightweightvk's command-buffer ring.

use ash::vk;

use crate::vulkan::Gpu;

/// Fixed ring size. "Overkill" per the source's own comment — in practice a
/// handful of frames in flight is enough, but 64 recorders means acquiring
/// one essentially never blocks in steady state.
pub const RING_SIZE: usize = 64;

/// Library-internal name for "is this submission retired?". Compares as a
/// plain integer; retirement order equals submit order on the single
/// graphics queue. Token `0` is the sentinel meaning "never submitted".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmitToken(u64);

impl SubmitToken {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn sentinel() -> Self {
        Self(0)
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for SubmitToken {
    fn default() -> Self {
        Self::sentinel()
    }
}

impl std::fmt::Display for SubmitToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "submit#{}", self.0)
    }
}

struct Recorder {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    semaphore: vk::Semaphore,
    token: SubmitToken,
    is_encoding: bool,
}

/// Ring of [`RING_SIZE`] recorders over a single command pool on the
/// graphics queue. The only component in this crate allowed to block the
/// calling thread outside of explicit `wait` calls (see spec §5).
pub struct ImmediateCommands {
    command_pool: vk::CommandPool,
    recorders: Vec<Recorder>,
    /// Index of the recorder `acquire` will try next.
    cursor: usize,
    next_token: u64,
    last_token: SubmitToken,
    /// Cheap-check threshold: every token `<= retired_floor` is known
    /// retired without touching the fences again.
    retired_floor: u64,
    pending_wait: Option<(vk::Semaphore, vk::PipelineStageFlags2)>,
    pending_signal: Option<(vk::Semaphore, u64, vk::PipelineStageFlags2)>,
}

/// A command buffer handed out by [`ImmediateCommands::acquire`]. Also the
/// type the render graph records into; `is_dry_run` gates the §4.J(5)
/// dry-run execute so no real GPU commands are issued while pipelines are
/// being pre-resolved.
pub struct CommandBuffer {
    pub(crate) raw: vk::CommandBuffer,
    pub(crate) is_dry_run: bool,
    pub(crate) active_pass: Option<usize>,
}

/// A color or depth/stencil attachment resolved to raw Vulkan objects, the
/// shape `cmd_begin_rendering` needs. Built by the render graph's execute
/// step from a `CompiledPass`'s attachment list (§4.J/§4.K).
pub struct RenderingAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearValue,
    pub resolve: Option<(vk::ImageView, vk::ImageLayout)>,
}

impl CommandBuffer {
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn is_dry_run(&self) -> bool {
        self.is_dry_run
    }

    /// Index of the compiled pass this buffer is currently recording into,
    /// set by the render graph's execute loop (or dry-run walk).
    pub fn active_pass(&self) -> Option<usize> {
        self.active_pass
    }

    /// `vkCmdBeginRendering` over the given color/depth attachments. A
    /// no-op under dry-run, since there is no real command buffer behind
    /// `self.raw` at that point (spec §4.J(5)).
    pub fn cmd_begin_rendering(
        &mut self,
        gpu: &Gpu,
        extent: vk::Extent2D,
        color_attachments: &[RenderingAttachment],
        depth_attachment: Option<&RenderingAttachment>,
    ) {
        if self.is_dry_run {
            return;
        }
        let color_infos: Vec<vk::RenderingAttachmentInfo> = color_attachments
            .iter()
            .map(|a| {
                let mut info = vk::RenderingAttachmentInfo::default()
                    .image_view(a.view)
                    .image_layout(a.layout)
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .clear_value(a.clear_value);
                if let Some((resolve_view, resolve_layout)) = a.resolve {
                    info = info
                        .resolve_mode(vk::ResolveModeFlags::AVERAGE)
                        .resolve_image_view(resolve_view)
                        .resolve_image_layout(resolve_layout);
                }
                info
            })
            .collect();
        let depth_info = depth_attachment.map(|a| {
            vk::RenderingAttachmentInfo::default()
                .image_view(a.view)
                .image_layout(a.layout)
                .load_op(a.load_op)
                .store_op(a.store_op)
                .clear_value(a.clear_value)
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent })
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth_info) = &depth_info {
            rendering_info = rendering_info.depth_attachment(depth_info);
        }

        unsafe {
            gpu.device.cmd_begin_rendering(self.raw, &rendering_info);
            gpu.device.cmd_set_viewport(
                self.raw,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: extent.height as f32,
                    width: extent.width as f32,
                    height: -(extent.height as f32),
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            gpu.device.cmd_set_scissor(
                self.raw,
                0,
                &[vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent }],
            );
        }
    }

    pub fn cmd_end_rendering(&mut self, gpu: &Gpu) {
        if self.is_dry_run {
            return;
        }
        unsafe {
            gpu.device.cmd_end_rendering(self.raw);
        }
    }

    pub fn cmd_bind_descriptor_sets(&mut self, gpu: &Gpu, layout: vk::PipelineLayout, set: vk::DescriptorSet, bind_point: vk::PipelineBindPoint) {
        if self.is_dry_run {
            return;
        }
        // Usage contract (spec §4.E): every bound pipeline also binds the
        // bindless set at sets 0..2, three identical copies, so shader code
        // may reference it regardless of declared set index.
        let sets = [set, set, set];
        unsafe {
            gpu.device.cmd_bind_descriptor_sets(self.raw, bind_point, layout, 0, &sets, &[]);
        }
    }

    pub fn cmd_draw(&mut self, gpu: &Gpu, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        if self.is_dry_run {
            return;
        }
        unsafe {
            gpu.device.cmd_draw(self.raw, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    pub fn cmd_dispatch(&mut self, gpu: &Gpu, group_x: u32, group_y: u32, group_z: u32) {
        if self.is_dry_run {
            return;
        }
        unsafe {
            gpu.device.cmd_dispatch(self.raw, group_x, group_y, group_z);
        }
    }

    pub fn cmd_push_constants(&mut self, gpu: &Gpu, layout: vk::PipelineLayout, stage_flags: vk::ShaderStageFlags, data: &[u8]) {
        if self.is_dry_run {
            return;
        }
        unsafe {
            gpu.device.cmd_push_constants(self.raw, layout, stage_flags, 0, data);
        }
    }

    pub fn cmd_copy_buffer(&mut self, gpu: &Gpu, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        if self.is_dry_run {
            return;
        }
        unsafe {
            gpu.device.cmd_copy_buffer(self.raw, src, dst, regions);
        }
    }

    pub fn cmd_blit_image(
        &mut self,
        gpu: &Gpu,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        if self.is_dry_run {
            return;
        }
        unsafe {
            gpu.device.cmd_blit_image(self.raw, src, src_layout, dst, dst_layout, regions, filter);
        }
    }

    pub fn cmd_pipeline_barrier2(&mut self, gpu: &Gpu, dependency_info: &vk::DependencyInfo) {
        if self.is_dry_run {
            return;
        }
        unsafe {
            gpu.device.cmd_pipeline_barrier2(self.raw, dependency_info);
        }
    }
}

impl ImmediateCommands {
    /// # Safety
    /// `gpu.device` must outlive this `ImmediateCommands` and `queue_family_index`
    /// must name a queue family that supports graphics.
    pub unsafe fn new(gpu: &Gpu, queue_family_index: u32) -> Self {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = gpu
            .device
            .create_command_pool(&pool_info, None)
            .expect("vkCreateCommandPool failed");

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(RING_SIZE as u32);
        let command_buffers =
            gpu.device.allocate_command_buffers(&alloc_info).expect("vkAllocateCommandBuffers failed");

        let recorders = command_buffers
            .into_iter()
            .map(|command_buffer| {
                let fence = gpu
                    .device
                    .create_fence(&vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED), None)
                    .expect("vkCreateFence failed");
                let semaphore = gpu
                    .device
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                    .expect("vkCreateSemaphore failed");
                Recorder { command_buffer, fence, semaphore, token: SubmitToken::sentinel(), is_encoding: false }
            })
            .collect();

        log::info!("ImmediateCommands: created ring of {RING_SIZE} recorders");
        Self {
            command_pool,
            recorders,
            cursor: 0,
            next_token: 1,
            last_token: SubmitToken::sentinel(),
            retired_floor: 0,
            pending_wait: None,
            pending_signal: None,
        }
    }

    /// Walk the ring and mark retired any recorder whose fence is already
    /// signaled, advancing the cheap-check threshold accordingly.
    fn purge(&mut self, gpu: &Gpu) {
        let mut max_retired = self.retired_floor;
        for recorder in &self.recorders {
            if recorder.token.is_sentinel() || recorder.is_encoding {
                continue;
            }
            let signaled = unsafe { gpu.device.get_fence_status(recorder.fence) } == Ok(true);
            if signaled {
                max_retired = max_retired.max(recorder.token.value());
            }
        }
        self.retired_floor = max_retired;
    }

    /// Wait until a recorder is free, reset it, and begin recording. Blocks
    /// the caller if every recorder is currently in flight — the only
    /// implicit blocking point in the component.
    pub fn acquire(&mut self, gpu: &Gpu) -> CommandBuffer {
        self.purge(gpu);

        let start = self.cursor;
        loop {
            let recorder = &self.recorders[self.cursor];
            let free = recorder.token.is_sentinel()
                || unsafe { gpu.device.get_fence_status(recorder.fence) } == Ok(true);
            if free {
                break;
            }
            // Ring exhausted this lap: block on the oldest recorder's fence.
            if self.cursor == (start + RING_SIZE - 1) % RING_SIZE {
                unsafe {
                    gpu.device
                        .wait_for_fences(&[recorder.fence], true, u64::MAX)
                        .expect("vkWaitForFences timed out");
                }
                break;
            }
            self.cursor = (self.cursor + 1) % RING_SIZE;
        }

        let index = self.cursor;
        self.cursor = (self.cursor + 1) % RING_SIZE;

        {
            let recorder = &mut self.recorders[index];
            if !recorder.token.is_sentinel() {
                self.retired_floor = self.retired_floor.max(recorder.token.value());
            }
            unsafe {
                gpu.device
                    .reset_command_buffer(recorder.command_buffer, vk::CommandBufferResetFlags::empty())
                    .expect("vkResetCommandBuffer failed");
                gpu.device
                    .begin_command_buffer(
                        recorder.command_buffer,
                        &vk::CommandBufferBeginInfo::default()
                            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                    )
                    .expect("vkBeginCommandBuffer failed");
            }
            recorder.is_encoding = true;
        }

        CommandBuffer { raw: self.recorders[index].command_buffer, is_dry_run: false, active_pass: None }
    }

    /// End recording and submit to the graphics queue, consuming any
    /// pending extra wait/signal requested via [`Self::request_wait`] /
    /// [`Self::request_signal`]. Returns the newly issued [`SubmitToken`].
    pub fn submit(&mut self, gpu: &Gpu, cmd: CommandBuffer) -> SubmitToken {
        assert!(!cmd.is_dry_run, "submitting a dry-run command buffer is a programmer error");

        let index = self
            .recorders
            .iter()
            .position(|r| r.command_buffer == cmd.raw)
            .expect("CommandBuffer did not originate from this ImmediateCommands ring");

        unsafe {
            gpu.device.end_command_buffer(cmd.raw).expect("vkEndCommandBuffer failed");
        }

        let token = SubmitToken::new(self.next_token);
        self.next_token += 1;

        let mut wait_infos = Vec::with_capacity(1);
        if let Some((semaphore, stage_mask)) = self.pending_wait.take() {
            wait_infos.push(vk::SemaphoreSubmitInfo::default().semaphore(semaphore).stage_mask(stage_mask));
        }

        let recorder = &mut self.recorders[index];
        recorder.token = token;
        recorder.is_encoding = false;

        let mut signal_infos = vec![vk::SemaphoreSubmitInfo::default()
            .semaphore(recorder.semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        if let Some((semaphore, value, stage_mask)) = self.pending_signal.take() {
            signal_infos.push(
                vk::SemaphoreSubmitInfo::default().semaphore(semaphore).value(value).stage_mask(stage_mask),
            );
        }

        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd.raw)];
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&cmd_infos)
            .signal_semaphore_infos(&signal_infos);

        unsafe {
            gpu.device
                .reset_fences(&[recorder.fence])
                .expect("vkResetFences failed");
            gpu.device
                .queue_submit2(gpu.queue, &[submit_info], recorder.fence)
                .expect("vkQueueSubmit2 failed — a failed submission is fatal");
        }

        self.last_token = token;
        log::debug!("ImmediateCommands: submitted {token}");
        token
    }

    /// Block until `token` is retired.
    pub fn wait(&mut self, gpu: &Gpu, token: SubmitToken) {
        if token.is_sentinel() || self.is_retired(gpu, token, true) {
            return;
        }
        if let Some(recorder) = self.recorders.iter().find(|r| r.token == token) {
            unsafe {
                gpu.device
                    .wait_for_fences(&[recorder.fence], true, u64::MAX)
                    .expect("vkWaitForFences timed out");
            }
        }
        self.retired_floor = self.retired_floor.max(token.value());
    }

    /// True iff `token` is known retired. With `cheap_only`, consults only
    /// the cached floor (no Vulkan calls); otherwise polls the owning
    /// recorder's fence directly.
    pub fn is_retired(&mut self, gpu: &Gpu, token: SubmitToken, cheap_only: bool) -> bool {
        if token.is_sentinel() {
            return true;
        }
        if token.value() <= self.retired_floor {
            return true;
        }
        if cheap_only {
            return false;
        }
        if let Some(recorder) = self.recorders.iter().find(|r| r.token == token) {
            let signaled = unsafe { gpu.device.get_fence_status(recorder.fence) } == Ok(true);
            if signaled {
                self.retired_floor = self.retired_floor.max(token.value());
            }
            signaled
        } else {
            // No recorder currently holds this token: it was already
            // purged, which only happens after its fence signaled.
            true
        }
    }

    /// Stage one extra wait for the very next `submit` (consumed on use).
    /// Used by the swapchain to wait on the image-acquire semaphore.
    pub fn request_wait(&mut self, semaphore: vk::Semaphore, stage_mask: vk::PipelineStageFlags2) {
        self.pending_wait = Some((semaphore, stage_mask));
    }

    /// Stage one extra timeline signal for the very next `submit`.
    pub fn request_signal(&mut self, semaphore: vk::Semaphore, value: u64, stage_mask: vk::PipelineStageFlags2) {
        self.pending_signal = Some((semaphore, value, stage_mask));
    }

    pub fn last_submit_token(&self) -> SubmitToken {
        self.last_token
    }

    pub fn next_submit_token(&self) -> SubmitToken {
        SubmitToken::new(self.next_token)
    }

    /// The binary semaphore signaled by the most recent submit, for the
    /// swapchain's present call.
    pub(crate) fn last_submit_semaphore(&self) -> Option<vk::Semaphore> {
        self.recorders.iter().find(|r| r.token == self.last_token).map(|r| r.semaphore)
    }

    /// # Safety
    /// Must not be called while any recorder is mid-encode.
    pub unsafe fn destroy(&mut self, gpu: &Gpu) {
        for recorder in &self.recorders {
            gpu.device.destroy_fence(recorder.fence, None);
            gpu.device.destroy_semaphore(recorder.semaphore, None);
        }
        gpu.device.destroy_command_pool(self.command_pool, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_ordering_matches_integer_ordering() {
        assert!(SubmitToken::new(2) > SubmitToken::new(1));
        assert!(SubmitToken::sentinel().is_sentinel());
        assert!(!SubmitToken::new(1).is_sentinel());
    }

    #[test]
    fn retirement_is_monotonic_under_integer_comparison() {
        // For all t' < t, is_retired(t) implies is_retired(t') under a
        // threshold model — exercised directly over the predicate shape
        // used by `is_retired`/`drain_ready`, without a live device.
        let floor = 5u64;
        let retired = |t: u64| t <= floor;
        for t in 0..=10u64 {
            if retired(t) {
                for tp in 0..t {
                    assert!(retired(tp), "t={t} retired but tp={tp} is not");
                }
            }
        }
    }
}
