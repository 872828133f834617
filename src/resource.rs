//! `ResourceManager` (component F): the public façade over the generational
//! pools (B), the bindless table (E), and the texture state tracker (G).
//! Every GPU resource in this crate is created, looked up, and destroyed
//! through here.

use ash::vk;

use crate::bindless::BindlessDescriptorTable;
use crate::command::SubmitToken;
use crate::deferred::DeferredQueue;
use crate::error::ResourceWarning;
use crate::handle::{BufferHandle, SamplerHandle, ShaderHandle, TextureHandle};
use crate::pool::HandlePool;
use crate::texture_state::{SubresourceRange, TextureStateTracker};
use crate::vulkan::Gpu;

//=============================================================================
// Formats
//=============================================================================

/// A subset of `VkFormat` this crate supports. Grows as needed; the two
/// helper predicates below are what the graph compiler and the bindless
/// table actually depend on, not exhaustive format coverage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Rgba32Float,
    R8Unorm,
    R16Float,
    R32Float,
    R32Uint,
    Depth32Float,
    Depth24Stencil8,
    Stencil8,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24Stencil8)
    }

    pub fn is_stencil(self) -> bool {
        matches!(self, Self::Depth24Stencil8 | Self::Stencil8)
    }

    pub fn aspect_mask(self) -> vk::ImageAspectFlags {
        match (self.is_depth(), self.is_stencil()) {
            (true, true) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            (true, false) => vk::ImageAspectFlags::DEPTH,
            (false, true) => vk::ImageAspectFlags::STENCIL,
            (false, false) => vk::ImageAspectFlags::COLOR,
        }
    }

    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Self::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Self::R8Unorm => vk::Format::R8_UNORM,
            Self::R16Float => vk::Format::R16_SFLOAT,
            Self::R32Float => vk::Format::R32_SFLOAT,
            Self::R32Uint => vk::Format::R32_UINT,
            Self::Depth32Float => vk::Format::D32_SFLOAT,
            Self::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
            Self::Stencil8 => vk::Format::S8_UINT,
        }
    }

    /// The handful of `VkFormat`s a presentable surface can hand back (spec
    /// §4.L); anything else is a surface this crate doesn't know how to
    /// adopt as a swapchain backbuffer.
    pub(crate) fn from_vk_surface_format(format: vk::Format) -> Option<Self> {
        match format {
            vk::Format::R8G8B8A8_UNORM => Some(Self::Rgba8Unorm),
            vk::Format::R8G8B8A8_SRGB => Some(Self::Rgba8Srgb),
            vk::Format::B8G8R8A8_UNORM => Some(Self::Bgra8Unorm),
            vk::Format::B8G8R8A8_SRGB => Some(Self::Bgra8Srgb),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TextureUsage: u32 {
        const SAMPLED  = 1 << 0;
        const STORAGE  = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BufferUsage: u32 {
        const UNIFORM  = 1 << 0;
        const STORAGE  = 1 << 1;
        const VERTEX   = 1 << 2;
        const INDEX    = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageClass {
    DeviceLocal,
    HostVisible,
    Memoryless,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// `vkutil::CalcNumMipLevels` equivalent: the full mip chain size for a
/// given extent, for callers that want `TextureSpec::mip_count` to cover
/// every level down to 1x1.
pub fn max_mip_count(extent: Extent3d) -> u32 {
    let largest = extent.width.max(extent.height).max(extent.depth).max(1);
    32 - largest.leading_zeros()
}

#[derive(Clone, Debug)]
pub struct TextureSpec<'a> {
    pub extent: Extent3d,
    pub format: Format,
    pub sample_count: u32,
    pub mip_count: u32,
    pub layer_count: u32,
    pub is_cube: bool,
    pub usage: TextureUsage,
    pub storage_class: StorageClass,
    pub initial_data: Option<&'a [u8]>,
    pub generate_mipmaps: bool,
    pub debug_name: &'a str,
}

#[derive(Clone, Debug)]
pub struct BufferSpec<'a> {
    pub size: u64,
    pub usage: BufferUsage,
    pub host_visible: bool,
    pub initial_data: Option<&'a [u8]>,
    pub debug_name: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMode {
    Repeat,
    MirrorRepeat,
    ClampToEdge,
}

#[derive(Clone, Debug)]
pub struct SamplerSpec<'a> {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode: [AddressMode; 3],
    pub debug_name: &'a str,
}

/// The reflected shape a compiled shader module hands back (spec §6,
/// "Shader reflection (consumed)"). Nothing in this crate parses SPIR-V;
/// the caller supplies this struct from whatever reflection tool it uses.
#[derive(Clone, Debug, Default)]
pub struct ReflectedLayout {
    pub descriptor_sets: Vec<DescriptorSetSignature>,
    pub push_constant_size: u32,
    pub spec_constants: Vec<(String, u32)>,
    /// `name -> byte offset` within the push-constant block. This crate has
    /// no non-bindless descriptor sets (every pipeline binds only the
    /// bindless table, §4.E), so a buffer "binding" is really a GPU address
    /// written into this block; see `Context::open_descriptor_update`.
    pub push_constant_members: Vec<(String, u32)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    Sampler,
}

#[derive(Clone, Debug)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub name: String,
}

#[derive(Clone, Debug, Default)]
pub struct DescriptorSetSignature {
    pub bindings: Vec<DescriptorBinding>,
    pub is_bindless: bool,
}

impl DescriptorSetSignature {
    pub fn binding_named(&self, name: &str) -> Option<u32> {
        self.bindings.iter().find(|b| b.name == name).map(|b| b.binding)
    }
}

#[derive(Clone, Debug)]
pub struct ShaderSpec<'a> {
    pub spirv: &'a [u32],
    pub entry_point: &'a str,
    pub stage: vk::ShaderStageFlags,
    pub reflected: ReflectedLayout,
    pub debug_name: &'a str,
}

/// A region of a texture for upload/download, in the same shape as
/// `SubresourceRange` but named separately since it also carries an offset.
#[derive(Clone, Copy, Debug)]
pub struct TextureUploadRegion {
    pub mip: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub offset: Extent3d,
    pub extent: Extent3d,
}

//=============================================================================
// Payloads
//=============================================================================

/// Fields are crate-private; external code (e.g. a [`crate::staging::StagingUploader`]
/// implementation) only ever sees `&TexturePayload` as an opaque handle to
/// pass back into this crate's own helpers.
#[derive(Default)]
pub struct TexturePayload {
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) storage_view: Option<vk::ImageView>,
    pub(crate) allocation: Option<gpu_alloc::MemoryBlock<vk::DeviceMemory>>,
    pub(crate) extent: Extent3d,
    pub(crate) format: Option<Format>,
    pub(crate) sample_count: u32,
    pub(crate) mip_count: u32,
    pub(crate) layer_count: u32,
    pub(crate) usage: TextureUsage,
    pub(crate) owning: bool,
    pub(crate) debug_name: String,
}

#[derive(Default)]
pub struct BufferPayload {
    pub(crate) buffer: vk::Buffer,
    pub(crate) allocation: Option<gpu_alloc::MemoryBlock<vk::DeviceMemory>>,
    pub(crate) size: u64,
    pub(crate) usage: BufferUsage,
    pub(crate) host_visible: bool,
    pub(crate) mapped_ptr: Option<std::ptr::NonNull<u8>>,
    pub(crate) device_address: Option<vk::DeviceAddress>,
}

// SAFETY: the mapped pointer is into host-visible device memory owned
// exclusively by this payload; access is serialized by the single logical
// context lock (spec §5), never aliased across threads.
unsafe impl Send for BufferPayload {}

#[derive(Default)]
pub(crate) struct SamplerPayload {
    pub(crate) sampler: vk::Sampler,
}

fn validate_texture_spec(spec: &TextureSpec) {
    assert!(spec.extent.width > 0 && spec.extent.height > 0 && spec.extent.depth > 0, "texture extent must be nonzero");
    assert!(spec.mip_count >= 1, "mip_count must be at least 1");
    assert!(!spec.usage.is_empty(), "texture usage bitmask must be nonempty");
    assert!(
        !(spec.usage.contains(TextureUsage::STORAGE) && spec.sample_count > 1),
        "storage usage combined with multisampling is disallowed"
    );
    if spec.is_cube {
        assert!(spec.layer_count % 6 == 0, "cube textures must have a layer count that is a multiple of six");
    }
}

fn validate_buffer_spec(spec: &BufferSpec) {
    assert!(spec.size > 0, "buffer size must be nonzero");
    assert!(!spec.usage.is_empty(), "buffer usage bitmask must be nonempty");
}

/// Owns every GPU resource pool, the bindless descriptor table, and the
/// texture state tracker. The single entry point for resource lifetime in
/// this crate (spec §4.F).
pub struct ResourceManager {
    textures: HandlePool<crate::handle::Texture, TexturePayload>,
    buffers: HandlePool<crate::handle::Buffer, BufferPayload>,
    samplers: HandlePool<crate::handle::Sampler, SamplerPayload>,
    pub(crate) bindless: BindlessDescriptorTable,
    pub(crate) tracker: TextureStateTracker,
    dummy_texture: TextureHandle,
    dummy_sampler: SamplerHandle,
}

impl ResourceManager {
    /// # Safety
    /// `gpu` must be a live device this manager will own resources on for
    /// its entire lifetime.
    pub unsafe fn new(gpu: &Gpu) -> Self {
        let mut textures = HandlePool::new();
        let mut samplers = HandlePool::new();

        let (dummy_image, dummy_view, dummy_allocation) = Self::create_dummy_texture(gpu);
        let dummy_texture = textures.insert(TexturePayload {
            image: dummy_image,
            view: dummy_view,
            storage_view: None,
            allocation: Some(dummy_allocation),
            extent: Extent3d { width: 1, height: 1, depth: 1 },
            format: Some(Format::Rgba8Unorm),
            sample_count: 1,
            mip_count: 1,
            layer_count: 1,
            usage: TextureUsage::SAMPLED,
            owning: true,
            debug_name: "<dummy texture>".into(),
        });

        let dummy_sampler_raw = gpu
            .device
            .create_sampler(
                &vk::SamplerCreateInfo::default()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR),
                None,
            )
            .expect("vkCreateSampler (dummy) failed");
        let dummy_sampler = samplers.insert(SamplerPayload { sampler: dummy_sampler_raw });

        let bindless = BindlessDescriptorTable::new(dummy_view, dummy_sampler_raw);

        Self {
            textures,
            buffers: HandlePool::new(),
            samplers,
            bindless,
            tracker: TextureStateTracker::new(),
            dummy_texture,
            dummy_sampler,
        }
    }

    unsafe fn create_dummy_texture(
        gpu: &Gpu,
    ) -> (vk::Image, vk::ImageView, gpu_alloc::MemoryBlock<vk::DeviceMemory>) {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D { width: 1, height: 1, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = gpu.device.create_image(&image_info, None).expect("vkCreateImage (dummy) failed");
        let requirements = gpu.device.get_image_memory_requirements(image);

        let allocation = gpu
            .allocator
            .lock()
            .unwrap()
            .alloc(
                gpu_alloc_ash::AshMemoryDevice::wrap(&gpu.device),
                gpu_alloc::Request {
                    size: requirements.size,
                    align_mask: requirements.alignment - 1,
                    usage: gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS,
                    memory_types: requirements.memory_type_bits,
                },
            )
            .expect("gpu-alloc allocation for dummy texture failed");
        gpu.device
            .bind_image_memory(image, *allocation.memory(), allocation.offset())
            .expect("vkBindImageMemory (dummy) failed");

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        let view = gpu.device.create_image_view(&view_info, None).expect("vkCreateImageView (dummy) failed");

        (image, view, allocation)
    }

    pub fn dummy_texture(&self) -> TextureHandle {
        self.dummy_texture
    }

    pub fn dummy_sampler(&self) -> SamplerHandle {
        self.dummy_sampler
    }

    //=========================================================================
    // Create
    //=========================================================================

    /// # Safety
    /// `gpu` must be the device this manager was created against.
    pub unsafe fn create_texture(&mut self, gpu: &Gpu, spec: &TextureSpec) -> TextureHandle {
        validate_texture_spec(spec);

        let actual_layers = if spec.is_cube { spec.layer_count } else { spec.layer_count.max(1) };

        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if spec.usage.contains(TextureUsage::SAMPLED) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if spec.usage.contains(TextureUsage::STORAGE) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        if spec.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if spec.usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(if spec.extent.depth > 1 { vk::ImageType::TYPE_3D } else { vk::ImageType::TYPE_2D })
            .format(spec.format.to_vk())
            .extent(vk::Extent3D { width: spec.extent.width, height: spec.extent.height, depth: spec.extent.depth })
            .mip_levels(spec.mip_count)
            .array_layers(actual_layers)
            .samples(sample_count_flags(spec.sample_count))
            .usage(usage)
            .flags(if spec.is_cube { vk::ImageCreateFlags::CUBE_COMPATIBLE } else { vk::ImageCreateFlags::empty() })
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = gpu.device.create_image(&image_info, None).expect("vkCreateImage failed");

        let requirements = gpu.device.get_image_memory_requirements(image);
        let usage_flags = match spec.storage_class {
            StorageClass::DeviceLocal => gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS,
            StorageClass::HostVisible => gpu_alloc::UsageFlags::HOST_ACCESS,
            StorageClass::Memoryless => gpu_alloc::UsageFlags::TRANSIENT_MEMORY,
        };
        let allocation = gpu
            .allocator
            .lock()
            .unwrap()
            .alloc(
                gpu_alloc_ash::AshMemoryDevice::wrap(&gpu.device),
                gpu_alloc::Request {
                    size: requirements.size,
                    align_mask: requirements.alignment - 1,
                    usage: usage_flags,
                    memory_types: requirements.memory_type_bits,
                },
            )
            .expect("gpu-alloc allocation for texture failed");
        gpu.device
            .bind_image_memory(image, *allocation.memory(), allocation.offset())
            .expect("vkBindImageMemory failed");

        let view_type = if spec.is_cube {
            vk::ImageViewType::CUBE
        } else if spec.extent.depth > 1 {
            vk::ImageViewType::TYPE_3D
        } else if actual_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(spec.format.to_vk())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(spec.format.aspect_mask())
                    .level_count(spec.mip_count)
                    .layer_count(actual_layers),
            );
        let view = gpu.device.create_image_view(&view_info, None).expect("vkCreateImageView failed");

        let storage_view = if spec.usage.contains(TextureUsage::STORAGE) {
            let storage_view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(view_type)
                .format(spec.format.to_vk())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(spec.format.aspect_mask())
                        .level_count(1)
                        .layer_count(actual_layers),
                );
            Some(gpu.device.create_image_view(&storage_view_info, None).expect("vkCreateImageView (storage) failed"))
        } else {
            None
        };

        let handle = self.textures.insert(TexturePayload {
            image,
            view,
            storage_view,
            allocation: Some(allocation),
            extent: spec.extent,
            format: Some(spec.format),
            sample_count: spec.sample_count,
            mip_count: spec.mip_count,
            layer_count: actual_layers,
            usage: spec.usage,
            owning: true,
            debug_name: spec.debug_name.to_owned(),
        });

        self.tracker.register(
            handle,
            SubresourceRange { base_mip: 0, num_mips: spec.mip_count, base_layer: 0, num_layers: actual_layers },
        );
        self.bindless.mark_dirty();
        log::debug!("ResourceManager: created texture {handle} \"{}\"", spec.debug_name);
        handle
    }

    /// Adopt a swapchain-owned image: not allocated or destroyed by this
    /// manager (`owning = false`), but tracked like any other texture so
    /// the render graph can barrier it.
    pub(crate) fn adopt_swapchain_texture(
        &mut self,
        image: vk::Image,
        view: vk::ImageView,
        extent: Extent3d,
        format: Format,
    ) -> TextureHandle {
        let handle = self.textures.insert(TexturePayload {
            image,
            view,
            storage_view: None,
            allocation: None,
            extent,
            format: Some(format),
            sample_count: 1,
            mip_count: 1,
            layer_count: 1,
            usage: TextureUsage::COLOR_ATTACHMENT,
            owning: false,
            debug_name: "<swapchain image>".into(),
        });
        self.tracker.register(handle, SubresourceRange { base_mip: 0, num_mips: 1, base_layer: 0, num_layers: 1 });
        handle
    }

    pub(crate) fn replace_swapchain_texture(&mut self, handle: TextureHandle, image: vk::Image, view: vk::ImageView) {
        if let Some(payload) = self.textures.get_mut(handle) {
            payload.image = image;
            payload.view = view;
        }
        self.tracker.write(
            handle,
            SubresourceRange { base_mip: 0, num_mips: 1, base_layer: 0, num_layers: 1 },
            crate::texture_state::TextureState::UNDEFINED,
        );
    }

    /// # Safety
    /// `gpu` must be the device this manager was created against.
    pub unsafe fn create_buffer(&mut self, gpu: &Gpu, spec: &BufferSpec) -> BufferHandle {
        validate_buffer_spec(spec);

        let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        if spec.usage.contains(BufferUsage::UNIFORM) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if spec.usage.contains(BufferUsage::STORAGE) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        if spec.usage.contains(BufferUsage::VERTEX) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if spec.usage.contains(BufferUsage::INDEX) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if spec.usage.contains(BufferUsage::INDIRECT) {
            usage |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }

        let buffer_info = vk::BufferCreateInfo::default().size(spec.size).usage(usage);
        let buffer = gpu.device.create_buffer(&buffer_info, None).expect("vkCreateBuffer failed");
        let requirements = gpu.device.get_buffer_memory_requirements(buffer);

        let usage_flags = if spec.host_visible {
            gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::UPLOAD
        } else {
            gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS
        };
        let mut allocation = gpu
            .allocator
            .lock()
            .unwrap()
            .alloc(
                gpu_alloc_ash::AshMemoryDevice::wrap(&gpu.device),
                gpu_alloc::Request {
                    size: requirements.size,
                    align_mask: requirements.alignment - 1,
                    usage: usage_flags,
                    memory_types: requirements.memory_type_bits,
                },
            )
            .expect("gpu-alloc allocation for buffer failed");
        gpu.device
            .bind_buffer_memory(buffer, *allocation.memory(), allocation.offset())
            .expect("vkBindBufferMemory failed");

        let mapped_ptr = if spec.host_visible {
            let ptr = allocation
                .map(gpu_alloc_ash::AshMemoryDevice::wrap(&gpu.device), 0, spec.size as usize)
                .expect("gpu-alloc map failed");
            Some(ptr)
        } else {
            None
        };

        let device_address = if spec.usage.contains(BufferUsage::STORAGE) {
            Some(gpu.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer)))
        } else {
            None
        };

        let handle = self.buffers.insert(BufferPayload {
            buffer,
            allocation: Some(allocation),
            size: spec.size,
            usage: spec.usage,
            host_visible: spec.host_visible,
            mapped_ptr,
            device_address,
        });
        log::debug!("ResourceManager: created buffer {handle} \"{}\"", spec.debug_name);
        handle
    }

    /// # Safety
    /// `gpu` must be the device this manager was created against.
    pub unsafe fn create_sampler(&mut self, gpu: &Gpu, spec: &SamplerSpec) -> SamplerHandle {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(map_filter(spec.mag_filter))
            .min_filter(map_filter(spec.min_filter))
            .mipmap_mode(match spec.mipmap_filter {
                FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
                FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
            })
            .address_mode_u(map_address_mode(spec.address_mode[0]))
            .address_mode_v(map_address_mode(spec.address_mode[1]))
            .address_mode_w(map_address_mode(spec.address_mode[2]))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = gpu.device.create_sampler(&info, None).expect("vkCreateSampler failed");
        let handle = self.samplers.insert(SamplerPayload { sampler });
        self.bindless.mark_dirty();
        handle
    }

    //=========================================================================
    // Destroy / resize
    //=========================================================================

    /// Defer API destruction onto `deferred`, keyed with `token` (normally
    /// the manager's `ImmediateCommands::last_submit_token`, with the
    /// sentinel-fallback behavior of [`DeferredQueue::defer_with_fallback`]
    /// applied by the caller). Frees the pool slot immediately.
    pub fn destroy_texture(&mut self, gpu: &Gpu, deferred: &mut DeferredQueue, handle: TextureHandle, token: SubmitToken) {
        let Some(payload) = self.textures.get_mut(handle) else { return };
        let view = payload.view;
        let storage_view = payload.storage_view;
        let image = payload.image;
        let owning = payload.owning;
        let allocation = payload.allocation.take();

        self.tracker.unregister(handle);
        self.textures.destroy(handle);
        self.bindless.mark_dirty();

        let gpu_device = gpu.device.clone();
        let allocator = gpu.allocator.clone();
        deferred.defer(
            move || unsafe {
                gpu_device.destroy_image_view(view, None);
                if let Some(storage_view) = storage_view {
                    gpu_device.destroy_image_view(storage_view, None);
                }
                if owning {
                    gpu_device.destroy_image(image, None);
                    if let Some(allocation) = allocation {
                        allocator.lock().unwrap().dealloc(gpu_alloc_ash::AshMemoryDevice::wrap(&gpu_device), allocation);
                    }
                }
            },
            token,
        );
    }

    pub fn destroy_buffer(&mut self, gpu: &Gpu, deferred: &mut DeferredQueue, handle: BufferHandle, token: SubmitToken) {
        let Some(payload) = self.buffers.get_mut(handle) else { return };
        let buffer = payload.buffer;
        let allocation = payload.allocation.take();
        self.buffers.destroy(handle);

        let gpu_device = gpu.device.clone();
        let allocator = gpu.allocator.clone();
        deferred.defer(
            move || unsafe {
                gpu_device.destroy_buffer(buffer, None);
                if let Some(allocation) = allocation {
                    allocator.lock().unwrap().dealloc(gpu_alloc_ash::AshMemoryDevice::wrap(&gpu_device), allocation);
                }
            },
            token,
        );
    }

    pub fn destroy_sampler(&mut self, gpu: &Gpu, deferred: &mut DeferredQueue, handle: SamplerHandle, token: SubmitToken) {
        let Some(payload) = self.samplers.get(handle) else { return };
        let sampler = payload.sampler;
        self.samplers.destroy(handle);
        self.bindless.mark_dirty();

        let gpu_device = gpu.device.clone();
        deferred.defer(
            move || unsafe {
                gpu_device.destroy_sampler(sampler, None);
            },
            token,
        );
    }

    /// Resize a texture in place: handle stays valid, generation unchanged.
    /// Current layout resets to Undefined. No-op if `new_extent` matches
    /// the current extent (spec §8, "resizing to the same dimensions").
    ///
    /// # Safety
    /// `gpu` must be the device this manager was created against.
    pub unsafe fn resize_texture(
        &mut self,
        gpu: &Gpu,
        deferred: &mut DeferredQueue,
        handle: TextureHandle,
        new_extent: Extent3d,
        token: SubmitToken,
    ) {
        let Some(payload) = self.textures.get(handle) else {
            log::warn!("ResourceManager: resize_texture on an invalid handle {handle}");
            return;
        };
        if payload.extent.width == new_extent.width
            && payload.extent.height == new_extent.height
            && payload.extent.depth == new_extent.depth
        {
            return;
        }

        let debug_name = payload.debug_name.clone();
        let spec = TextureSpec {
            extent: new_extent,
            format: payload.format.unwrap(),
            sample_count: payload.sample_count,
            mip_count: payload.mip_count,
            layer_count: payload.layer_count,
            is_cube: false,
            usage: payload.usage,
            storage_class: StorageClass::DeviceLocal,
            initial_data: None,
            generate_mipmaps: false,
            debug_name: &debug_name,
        };

        let old_payload = self.textures.get_mut(handle).unwrap();
        let old_image = old_payload.image;
        let old_view = old_payload.view;
        let old_storage_view = old_payload.storage_view;
        let old_allocation = old_payload.allocation.take();

        let gpu_device = gpu.device.clone();
        let allocator = gpu.allocator.clone();
        deferred.defer(
            move || unsafe {
                gpu_device.destroy_image_view(old_view, None);
                if let Some(v) = old_storage_view {
                    gpu_device.destroy_image_view(v, None);
                }
                gpu_device.destroy_image(old_image, None);
                if let Some(allocation) = old_allocation {
                    allocator.lock().unwrap().dealloc(gpu_alloc_ash::AshMemoryDevice::wrap(&gpu_device), allocation);
                }
            },
            token,
        );

        // Recreate into a throwaway slot, then move its guts into the
        // original handle's payload so `handle` itself stays valid.
        let new_handle = self.create_texture(gpu, &spec);
        let new_payload = self.textures.get_mut(new_handle).unwrap();
        let image = new_payload.image;
        let view = new_payload.view;
        let storage_view = new_payload.storage_view;
        let extent = new_payload.extent;
        let allocation = new_payload.allocation.take();
        self.textures.destroy(new_handle);
        self.tracker.unregister(new_handle);

        let payload = self.textures.get_mut(handle).unwrap();
        payload.image = image;
        payload.view = view;
        payload.storage_view = storage_view;
        payload.extent = extent;
        payload.allocation = allocation;

        self.tracker.write(
            handle,
            SubresourceRange {
                base_mip: 0,
                num_mips: payload.mip_count,
                base_layer: 0,
                num_layers: payload.layer_count,
            },
            crate::texture_state::TextureState::UNDEFINED,
        );
        self.bindless.mark_dirty();
        log::info!("ResourceManager: resized texture {handle} to {}x{}x{}", extent.width, extent.height, extent.depth);
    }

    //=========================================================================
    // Upload / download (delegated to a staging collaborator)
    //=========================================================================

    pub fn upload(
        &mut self,
        uploader: &mut dyn crate::staging::StagingUploader,
        handle: BufferHandle,
        data: &[u8],
        offset: u64,
    ) -> Result<SubmitToken, ResourceWarning> {
        if data.is_empty() {
            log::warn!("ResourceManager::upload: {}", ResourceWarning::NullUploadData);
            return Err(ResourceWarning::NullUploadData);
        }
        let Some(payload) = self.buffers.get(handle) else {
            log::warn!("ResourceManager::upload: invalid buffer handle {handle}");
            return Err(ResourceWarning::SubresourceOutOfRange);
        };
        if offset.checked_add(data.len() as u64).map(|end| end > payload.size).unwrap_or(true) {
            log::warn!("ResourceManager::upload: {}", ResourceWarning::UploadSizeOverflow);
            return Err(ResourceWarning::UploadSizeOverflow);
        }
        Ok(uploader.upload_buffer(payload, data, offset))
    }

    pub fn download(
        &mut self,
        uploader: &mut dyn crate::staging::StagingUploader,
        handle: BufferHandle,
        out: &mut [u8],
        offset: u64,
    ) -> Result<SubmitToken, ResourceWarning> {
        let Some(payload) = self.buffers.get(handle) else {
            log::warn!("ResourceManager::download: invalid buffer handle {handle}");
            return Err(ResourceWarning::SubresourceOutOfRange);
        };
        if offset.checked_add(out.len() as u64).map(|end| end > payload.size).unwrap_or(true) {
            log::warn!("ResourceManager::download: {}", ResourceWarning::DownloadSizeOverflow);
            return Err(ResourceWarning::DownloadSizeOverflow);
        }
        Ok(uploader.download_buffer(payload, out, offset))
    }

    pub fn gpu_address(&self, handle: BufferHandle, offset: u64) -> Option<vk::DeviceAddress> {
        self.buffers.get(handle).and_then(|p| p.device_address).map(|base| base + offset)
    }

    /// Per-frame bindless table maintenance (§4.E): grow capacity for the
    /// current occupancy, deferring destruction of any replaced descriptor
    /// pool under `token`, then fully rewrite the set if anything changed.
    ///
    /// # Safety
    /// Caller must ensure `gpu`'s device is the one that created any prior
    /// bindless descriptors.
    pub unsafe fn maintain_bindless(&mut self, gpu: &Gpu, deferred: &mut DeferredQueue, token: SubmitToken) {
        let texture_occupancy = self.texture_occupancy();
        let sampler_occupancy = self.sampler_occupancy();
        self.bindless.ensure_capacity(gpu, deferred, token, texture_occupancy, sampler_occupancy);

        if self.bindless.is_dirty() {
            let textures: Vec<_> = self.iter_texture_slots().collect();
            let samplers: Vec<_> = self.iter_sampler_slots().collect();
            self.bindless.rewrite(gpu, textures.into_iter(), samplers.into_iter());
        }
    }

    //=========================================================================
    // Accessors used by the graph/bindless/pipeline modules
    //=========================================================================

    pub(crate) fn buffer_raw(&self, handle: BufferHandle) -> Option<vk::Buffer> {
        self.buffers.get(handle).map(|p| p.buffer)
    }

    /// Exposes the opaque payload a [`crate::staging::StagingUploader`]
    /// implementation needs; callers outside this crate never see its
    /// fields, only this reference.
    pub(crate) fn buffer_payload(&self, handle: BufferHandle) -> Option<&BufferPayload> {
        self.buffers.get(handle)
    }

    pub(crate) fn texture_payload(&self, handle: TextureHandle) -> Option<&TexturePayload> {
        self.textures.get(handle)
    }

    pub(crate) fn texture_view(&self, handle: TextureHandle) -> Option<vk::ImageView> {
        self.textures.get(handle).map(|p| p.view)
    }

    pub(crate) fn texture_storage_view(&self, handle: TextureHandle) -> Option<vk::ImageView> {
        self.textures.get(handle).and_then(|p| p.storage_view)
    }

    pub(crate) fn texture_image(&self, handle: TextureHandle) -> Option<vk::Image> {
        self.textures.get(handle).map(|p| p.image)
    }

    pub(crate) fn texture_format(&self, handle: TextureHandle) -> Option<Format> {
        self.textures.get(handle).and_then(|p| p.format)
    }

    pub(crate) fn texture_sample_count(&self, handle: TextureHandle) -> Option<u32> {
        self.textures.get(handle).map(|p| p.sample_count)
    }

    pub(crate) fn texture_extent(&self, handle: TextureHandle) -> Option<Extent3d> {
        self.textures.get(handle).map(|p| p.extent)
    }

    pub(crate) fn sampler_raw(&self, handle: SamplerHandle) -> Option<vk::Sampler> {
        self.samplers.get(handle).map(|p| p.sampler)
    }

    pub(crate) fn iter_texture_slots(&self) -> impl Iterator<Item = crate::bindless::TextureSlot> + '_ {
        self.textures.iter_active().map(|(h, p)| crate::bindless::TextureSlot {
            index: h.index(),
            view: (p.sample_count == 1).then_some(p.view),
            storage_view: p.storage_view,
        })
    }

    pub(crate) fn iter_sampler_slots(&self) -> impl Iterator<Item = crate::bindless::SamplerSlot> + '_ {
        self.samplers.iter_active().map(|(h, p)| crate::bindless::SamplerSlot { index: h.index(), sampler: Some(p.sampler) })
    }

    pub(crate) fn texture_occupancy(&self) -> u32 {
        self.textures.len_active() as u32
    }

    pub(crate) fn sampler_occupancy(&self) -> u32 {
        self.samplers.len_active() as u32
    }

    /// # Safety
    /// Must be called only at manager teardown, after device-idle wait and
    /// after every deferred task has drained.
    pub unsafe fn destroy(&mut self, gpu: &Gpu) {
        let texture_handles: Vec<_> = self.textures.iter_active().map(|(h, _)| h).collect();
        for handle in texture_handles {
            let payload = self.textures.get_mut(handle).unwrap();
            let allocation = payload.allocation.take();
            if payload.owning {
                gpu.device.destroy_image_view(payload.view, None);
                if let Some(v) = payload.storage_view {
                    gpu.device.destroy_image_view(v, None);
                }
                gpu.device.destroy_image(payload.image, None);
                if let Some(allocation) = allocation {
                    gpu.allocator.lock().unwrap().dealloc(gpu_alloc_ash::AshMemoryDevice::wrap(&gpu.device), allocation);
                }
            }
        }

        let buffer_handles: Vec<_> = self.buffers.iter_active().map(|(h, _)| h).collect();
        for handle in buffer_handles {
            let payload = self.buffers.get_mut(handle).unwrap();
            let allocation = payload.allocation.take();
            gpu.device.destroy_buffer(payload.buffer, None);
            if let Some(allocation) = allocation {
                gpu.allocator.lock().unwrap().dealloc(gpu_alloc_ash::AshMemoryDevice::wrap(&gpu.device), allocation);
            }
        }

        for (_, payload) in self.samplers.iter_active() {
            gpu.device.destroy_sampler(payload.sampler, None);
        }
        self.bindless.destroy(gpu);
    }
}

fn map_filter(mode: FilterMode) -> vk::Filter {
    match mode {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

fn map_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    }
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

    #[test]
    fn format_depth_stencil_predicates() {
        assert!(Format::Depth32Float.is_depth());
        assert!(!Format::Depth32Float.is_stencil());
        assert!(Format::Depth24Stencil8.is_depth());
        assert!(Format::Depth24Stencil8.is_stencil());
        assert!(!Format::Rgba8Unorm.is_depth());
        assert!(!Format::Rgba8Unorm.is_stencil());
    }

    #[test]
    fn mip_count_covers_full_chain() {
        assert_eq!(max_mip_count(Extent3d { width: 1, height: 1, depth: 1 }), 1);
        assert_eq!(max_mip_count(Extent3d { width: 256, height: 256, depth: 1 }), 9);
        assert_eq!(max_mip_count(Extent3d { width: 640, height: 480, depth: 1 }), 10);
    }
}
