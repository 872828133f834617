//! Swapchain pacing (spec §4.L): acquire/present keyed off `frame_counter
//! mod N` (the frame-index timeline variant — see DESIGN.md for why the
//! image-index variant was not adopted), N capped at 16.

use ash::vk;

use crate::command::ImmediateCommands;
use crate::handle::TextureHandle;
use crate::resource::{Extent3d, Format, ResourceManager};
use crate::vulkan::Gpu;

/// Hard cap on in-flight swapchain images (spec §4.L).
pub const MAX_IMAGES: usize = 16;

/// One-shot swapchain configuration; consumed by [`Swapchain::new`] and
/// again by [`Swapchain::recreate_standard`] on a dirty swapchain.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub preferred_format: Format,
    pub present_mode: vk::PresentModeKHR,
    pub image_count: u32,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        Self { width: 0, height: 0, preferred_format: Format::Bgra8Unorm, present_mode: vk::PresentModeKHR::FIFO, image_count: 3 }
    }
}

/// Result of [`Swapchain::acquire`] (spec §1.2, class 3 — not an error, a
/// plain enum the caller `match`es).
pub enum AcquireOutcome {
    Acquired(TextureHandle),
    OutOfDate,
    Suboptimal(TextureHandle),
}

/// `frameIndex = frame_counter mod N` — the one piece of pure, testable
/// math behind the whole component (spec §4.L step 1).
fn frame_index(frame_counter: u64, image_count: usize) -> usize {
    (frame_counter % image_count as u64) as usize
}

/// The timeline value a submission must reach before `frame_index`'s slot
/// may be reused: `frame_counter + N` (spec §4.L step 2).
fn signal_value(frame_counter: u64, image_count: usize) -> u64 {
    frame_counter + image_count as u64
}

struct PerFrame {
    acquire_semaphore: vk::Semaphore,
    acquire_fence: vk::Fence,
    timeline_wait_value: u64,
}

pub struct Swapchain {
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    loader: ash::khr::swapchain::Device,
    raw: vk::SwapchainKHR,
    format: Format,
    color_space: vk::ColorSpaceKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    texture_handles: Vec<TextureHandle>,
    per_frame: Vec<PerFrame>,
    current_image_index: Option<u32>,
    frame_counter: u64,
    is_dirty: bool,
}

impl Swapchain {
    /// # Safety
    /// `gpu` must be a live device whose instance created `surface`, and
    /// `surface` must outlive this swapchain.
    pub unsafe fn new(
        gpu: &Gpu,
        surface_loader: ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDesc,
        resources: &mut ResourceManager,
    ) -> Self {
        let capabilities = surface_loader
            .get_physical_device_surface_capabilities(gpu.physical_device, surface)
            .expect("vkGetPhysicalDeviceSurfaceCapabilitiesKHR failed");
        let surface_formats = surface_loader
            .get_physical_device_surface_formats(gpu.physical_device, surface)
            .expect("vkGetPhysicalDeviceSurfaceFormatsKHR failed");

        let preferred_vk_format = desc.preferred_format.to_vk();
        let chosen = surface_formats
            .iter()
            .find(|f| f.format == preferred_vk_format)
            .or_else(|| surface_formats.first())
            .expect("surface reports no supported formats");
        let format = Format::from_vk_surface_format(chosen.format).unwrap_or(desc.preferred_format);
        let color_space = chosen.color_space;

        let extent = vk::Extent2D {
            width: desc.width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width.max(1)),
            height: desc.height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height.max(1)),
        };

        let image_count = (desc.image_count.max(capabilities.min_image_count) as usize).min(MAX_IMAGES);
        let image_count = if capabilities.max_image_count > 0 {
            image_count.min(capabilities.max_image_count as usize)
        } else {
            image_count
        };

        let loader = ash::khr::swapchain::Device::new(&gpu.instance, &gpu.device);

        let swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count as u32)
            .image_format(chosen.format)
            .image_color_space(color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);
        let raw = loader.create_swapchain(&swapchain_info, None).expect("vkCreateSwapchainKHR failed");

        let (texture_handles, per_frame) = Self::adopt_images(gpu, &loader, raw, extent, format, image_count, resources);

        log::info!("Swapchain: created {}x{} with {} images ({:?})", extent.width, extent.height, image_count, format);

        Self {
            surface_loader,
            surface,
            loader,
            raw,
            format,
            color_space,
            present_mode: desc.present_mode,
            extent,
            texture_handles,
            per_frame,
            current_image_index: None,
            frame_counter: 0,
            is_dirty: false,
        }
    }

    unsafe fn adopt_images(
        gpu: &Gpu,
        loader: &ash::khr::swapchain::Device,
        raw: vk::SwapchainKHR,
        extent: vk::Extent2D,
        format: Format,
        image_count: usize,
        resources: &mut ResourceManager,
    ) -> (Vec<TextureHandle>, Vec<PerFrame>) {
        let images = loader.get_swapchain_images(raw).expect("vkGetSwapchainImagesKHR failed");
        let texture_handles = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.to_vk())
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                let view = gpu.device.create_image_view(&view_info, None).expect("vkCreateImageView (swapchain) failed");
                resources.adopt_swapchain_texture(
                    image,
                    view,
                    Extent3d { width: extent.width, height: extent.height, depth: 1 },
                    format,
                )
            })
            .collect();

        let per_frame = (0..image_count)
            .map(|_| PerFrame {
                acquire_semaphore: gpu.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None).expect("vkCreateSemaphore failed"),
                acquire_fence: gpu
                    .device
                    .create_fence(&vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED), None)
                    .expect("vkCreateFence failed"),
                timeline_wait_value: 0,
            })
            .collect();

        (texture_handles, per_frame)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Panics if called before the first successful `acquire`.
    pub fn get_current_backbuffer_texture_handle(&self) -> TextureHandle {
        let index = self.current_image_index.expect("get_current_backbuffer_texture_handle called before acquire");
        self.texture_handles[index as usize]
    }

    /// `acquire()` (spec §4.L step 1). Blocks on the timeline reaching
    /// this frame slot's last recorded signal value, then on the slot's
    /// acquire fence, then calls the platform acquire.
    pub fn acquire(&mut self, gpu: &Gpu, commands: &mut ImmediateCommands) -> AcquireOutcome {
        let slot = frame_index(self.frame_counter, self.per_frame.len());
        let wait_value = self.per_frame[slot].timeline_wait_value;

        if wait_value > 0 {
            let wait_info = vk::SemaphoreWaitInfo::default()
                .semaphores(std::slice::from_ref(&gpu.timeline_semaphore))
                .values(std::slice::from_ref(&wait_value));
            unsafe {
                gpu.device.wait_semaphores(&wait_info, u64::MAX).expect("vkWaitSemaphores (timeline) timed out");
            }
        }

        let acquire_fence = self.per_frame[slot].acquire_fence;
        unsafe {
            gpu.device.wait_for_fences(&[acquire_fence], true, u64::MAX).expect("vkWaitForFences (acquire) timed out");
            gpu.device.reset_fences(&[acquire_fence]).expect("vkResetFences failed");
        }

        let acquire_semaphore = self.per_frame[slot].acquire_semaphore;
        let result = unsafe { self.loader.acquire_next_image(self.raw, u64::MAX, acquire_semaphore, acquire_fence) };

        let (image_index, suboptimal) = match result {
            Ok(pair) => pair,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.is_dirty = true;
                return AcquireOutcome::OutOfDate;
            }
            Err(e) => panic!("vkAcquireNextImageKHR failed: {e}"),
        };

        self.current_image_index = Some(image_index);
        commands.request_wait(acquire_semaphore, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);

        let handle = self.texture_handles[image_index as usize];
        if suboptimal {
            self.is_dirty = true;
            AcquireOutcome::Suboptimal(handle)
        } else {
            AcquireOutcome::Acquired(handle)
        }
    }

    /// Stage the timeline signal this frame's submission must carry (spec
    /// §4.L step 2). Call once after `acquire`, before the application's
    /// `submit_command`.
    pub fn prepare_submit_signal(&mut self, gpu: &Gpu, commands: &mut ImmediateCommands) {
        let slot = frame_index(self.frame_counter, self.per_frame.len());
        let signal = signal_value(self.frame_counter, self.per_frame.len());
        self.per_frame[slot].timeline_wait_value = signal;
        commands.request_signal(gpu.timeline_semaphore, signal, vk::PipelineStageFlags2::ALL_COMMANDS);
    }

    /// `present()` (spec §4.L step 3). Waits on the most recent submit's
    /// binary semaphore; out-of-date/suboptimal raises the dirty flag
    /// rather than erroring. Always increments `frame_counter`.
    pub fn present(&mut self, gpu: &Gpu, commands: &ImmediateCommands) {
        let image_index = self.current_image_index.expect("present called before acquire");
        let wait_semaphores: Vec<vk::Semaphore> = commands.last_submit_semaphore().into_iter().collect();
        let swapchains = [self.raw];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(gpu.queue, &present_info) };
        match result {
            Ok(suboptimal) => {
                if suboptimal {
                    self.is_dirty = true;
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => self.is_dirty = true,
            Err(e) => panic!("vkQueuePresentKHR failed: {e}"),
        }

        log::debug!("Swapchain: presented frame {}", self.frame_counter);
        self.frame_counter += 1;
    }

    /// Tears down and rebuilds the swapchain at a new extent, keeping the
    /// surface. Resets per-slot timeline wait values and `frame_counter`
    /// so the next `acquire()` only blocks on the rebuilt fences (spec
    /// §4.L point 5).
    ///
    /// # Safety
    /// The device must be idle with respect to any in-flight use of the
    /// old swapchain images before calling this.
    pub unsafe fn recreate_standard(&mut self, gpu: &Gpu, resources: &mut ResourceManager, width: u32, height: u32) {
        gpu.wait_idle();

        for &handle in &self.texture_handles {
            if let Some(view) = resources.texture_view(handle) {
                gpu.device.destroy_image_view(view, None);
            }
        }
        for frame in &self.per_frame {
            gpu.device.destroy_semaphore(frame.acquire_semaphore, None);
            gpu.device.destroy_fence(frame.acquire_fence, None);
        }
        let old = self.raw;

        let capabilities = self
            .surface_loader
            .get_physical_device_surface_capabilities(gpu.physical_device, self.surface)
            .expect("vkGetPhysicalDeviceSurfaceCapabilitiesKHR failed");
        let extent = vk::Extent2D {
            width: width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width.max(1)),
            height: height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height.max(1)),
        };
        let image_count = self.texture_handles.len();

        let swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count as u32)
            .image_format(self.format.to_vk())
            .image_color_space(self.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old);
        self.raw = self.loader.create_swapchain(&swapchain_info, None).expect("vkCreateSwapchainKHR (recreate) failed");
        self.loader.destroy_swapchain(old, None);

        let new_images = self.loader.get_swapchain_images(self.raw).expect("vkGetSwapchainImagesKHR failed");
        for (handle, &image) in self.texture_handles.iter().zip(new_images.iter()) {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format.to_vk())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = gpu.device.create_image_view(&view_info, None).expect("vkCreateImageView (swapchain) failed");
            resources.replace_swapchain_texture(*handle, image, view);
        }

        self.per_frame = (0..image_count)
            .map(|_| PerFrame {
                acquire_semaphore: gpu.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None).expect("vkCreateSemaphore failed"),
                acquire_fence: gpu
                    .device
                    .create_fence(&vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED), None)
                    .expect("vkCreateFence failed"),
                timeline_wait_value: 0,
            })
            .collect();

        self.extent = extent;
        self.frame_counter = 0;
        self.current_image_index = None;
        self.is_dirty = false;

        log::info!("Swapchain: recreated at {}x{}", extent.width, extent.height);
    }

    /// # Safety
    /// Must be called only after a device-idle wait, with no in-flight use
    /// of the swapchain's images.
    pub unsafe fn destroy(&mut self, gpu: &Gpu, resources: &mut ResourceManager) {
        for &handle in &self.texture_handles {
            if let Some(view) = resources.texture_view(handle) {
                gpu.device.destroy_image_view(view, None);
            }
        }
        for frame in &self.per_frame {
            gpu.device.destroy_semaphore(frame.acquire_semaphore, None);
            gpu.device.destroy_fence(frame.acquire_fence, None);
        }
        self.loader.destroy_swapchain(self.raw, None);
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_cycles_through_image_count() {
        assert_eq!(frame_index(0, 3), 0);
        assert_eq!(frame_index(1, 3), 1);
        assert_eq!(frame_index(2, 3), 2);
        assert_eq!(frame_index(3, 3), 0);
        assert_eq!(frame_index(7, 3), 1);
    }

    #[test]
    fn signal_value_is_frame_counter_plus_image_count() {
        assert_eq!(signal_value(0, 3), 3);
        assert_eq!(signal_value(5, 3), 8);
    }

    #[test]
    fn signal_value_for_slot_exceeds_that_slots_previous_signal() {
        // For any frame_counter, the signal value staged for its slot is
        // strictly greater than the value staged the previous time that
        // same slot was used (frame_counter - image_count).
        let image_count = 4usize;
        for frame_counter in image_count as u64..20 {
            let current = signal_value(frame_counter, image_count);
            let previous = signal_value(frame_counter - image_count as u64, image_count);
            assert!(current > previous);
        }
    }
}
