//! Thin Vulkan bring-up glue: instance/device/allocator creation.
//!
//! Deliberately minimal. Per spec §1 the physical-device/instance bring-up
//! and window/surface creation are external collaborators, not part of the
//! hard core this crate teaches; this module exists only so the rest of the
//! crate has concrete `ash` objects to call into, the way the source's
//! `CTXBuilder.cpp` exists alongside the real subject matter (`CTX.cpp`,
//! `RenderGraphBuilder.cpp`) without being the point of the exercise.

use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_alloc::{Config, GpuAllocator};
use gpu_alloc_ash::AshMemoryDevice;

use crate::ContextDesc;

/// The device-level feature set this crate requires: timeline semaphores,
/// synchronization2, dynamic rendering, descriptor indexing with
/// update-after-bind, and buffer device address (spec §1, §6).
struct RequiredFeatures {
    v12: vk::PhysicalDeviceVulkan12Features<'static>,
    v13: vk::PhysicalDeviceVulkan13Features<'static>,
}

impl RequiredFeatures {
    fn new() -> Self {
        Self {
            v12: vk::PhysicalDeviceVulkan12Features::default()
                .buffer_device_address(true)
                .timeline_semaphore(true)
                .descriptor_indexing(true)
                .shader_sampled_image_array_non_uniform_indexing(true)
                .descriptor_binding_sampled_image_update_after_bind(true)
                .descriptor_binding_storage_image_update_after_bind(true)
                .descriptor_binding_partially_bound(true)
                .descriptor_binding_update_unused_while_pending(true)
                .runtime_descriptor_array(true),
            v13: vk::PhysicalDeviceVulkan13Features::default()
                .dynamic_rendering(true)
                .synchronization2(true),
        }
    }
}

/// Owns the live Vulkan instance/device/queue/allocator this crate's
/// components are built on top of. Created once by [`crate::Context::init`]
/// and torn down on `Context` drop after a device-idle wait.
pub struct Gpu {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub allocator: Arc<Mutex<GpuAllocator<vk::DeviceMemory>>>,
    pub timeline_semaphore: vk::Semaphore,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Gpu {
    /// # Safety
    /// Caller must ensure the process has a usable Vulkan loader and that
    /// `desc` describes a valid (optional) window/display pair for
    /// swapchain creation.
    pub unsafe fn init(desc: &ContextDesc) -> Self {
        let entry = ash::Entry::linked();

        let app_name = CString::new(desc.app_name).unwrap();
        let engine_name = CString::new(desc.engine_name).unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .engine_name(&engine_name)
            .api_version(vk::API_VERSION_1_3);

        const VALIDATION_LAYER: &CStr =
            match CStr::from_bytes_with_nul(b"VK_LAYER_KHRONOS_validation\0") {
                Ok(name) => name,
                Err(_) => unreachable!(),
            };
        let mut layer_names = Vec::new();
        if desc.validation {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }
        let mut extension_names: Vec<*const i8> = Vec::new();
        if desc.window.is_some() {
            extension_names.extend(ash_window::enumerate_required_extensions(
                desc.display.expect("window handle given without a display handle"),
            ).expect("enumerate_required_extensions failed").iter());
        }

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);
        let instance = entry.create_instance(&instance_info, None).expect("vkCreateInstance failed");

        let physical_device = Self::pick_physical_device(&instance);

        let queue_family_index = Self::find_graphics_queue_family(&instance, physical_device);

        let queue_priorities = [1.0f32];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)];

        let mut device_extension_names: Vec<*const i8> =
            vec![ash::khr::dynamic_rendering::NAME.as_ptr(), ash::khr::synchronization2::NAME.as_ptr()];
        if desc.window.is_some() {
            device_extension_names.push(ash::khr::swapchain::NAME.as_ptr());
        }
        device_extension_names.extend(desc.extra_device_extensions.iter().map(|e: &&CStr| e.as_ptr()));

        let mut features = RequiredFeatures::new();
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&device_extension_names)
            .push_next(&mut features.v12)
            .push_next(&mut features.v13);
        let device =
            instance.create_device(physical_device, &device_info, None).expect("vkCreateDevice failed");

        let queue = device.get_device_queue(queue_family_index, 0);

        let device_properties = gpu_alloc_ash::device_properties(&instance, vk::API_VERSION_1_3, physical_device)
            .expect("failed to query device properties for allocator");
        let allocator = GpuAllocator::new(Config::i_am_prototyping(), device_properties);

        let mut timeline_type_info =
            vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE).initial_value(0);
        let timeline_semaphore = device
            .create_semaphore(&vk::SemaphoreCreateInfo::default().push_next(&mut timeline_type_info), None)
            .expect("vkCreateSemaphore (timeline) failed");

        log::info!(
            "Vulkan context created: {} on queue family {}",
            desc.app_name,
            queue_family_index
        );

        Self {
            entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            allocator: Arc::new(Mutex::new(allocator)),
            timeline_semaphore,
            debug_utils: None,
        }
    }

    unsafe fn pick_physical_device(instance: &ash::Instance) -> vk::PhysicalDevice {
        let devices = instance.enumerate_physical_devices().expect("vkEnumeratePhysicalDevices failed");
        assert!(!devices.is_empty(), "no Vulkan physical devices found");
        devices
            .iter()
            .copied()
            .max_by_key(|&pd| {
                let props = instance.get_physical_device_properties(pd);
                match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 3,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
                    vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
                    _ => 0,
                }
            })
            .unwrap()
    }

    unsafe fn find_graphics_queue_family(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> u32 {
        let families = instance.get_physical_device_queue_family_properties(physical_device);
        families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .expect("no graphics-capable queue family") as u32
    }

    /// Blocks until every submission to every queue on this device has
    /// completed. Only called from manager teardown (spec §5).
    pub fn wait_idle(&self) {
        unsafe {
            self.device.device_wait_idle().expect("vkDeviceWaitIdle failed");
        }
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.timeline_semaphore, None);
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
