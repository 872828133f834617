//! `BindlessDescriptorTable` (component E): one descriptor set with three
//! arrays — sampled images, samplers, storage images — indexed by
//! `handle.index()`. Grows on demand, rewritten wholesale before the next
//! draw whenever anything has changed (spec §4.E).

use ash::vk;

use crate::deferred::DeferredQueue;
use crate::vulkan::Gpu;

pub const TEXTURE_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;
pub const STORAGE_IMAGE_BINDING: u32 = 2;

const INITIAL_CAPACITY: u32 = 16;

/// Smallest power of two `>= occupancy` that is also `>= current_capacity`.
/// Pure so the doubling behavior (including the "exactly one growth event
/// for 17 creates at capacity 16" case) can be checked without a device.
pub fn capacity_for_occupancy(occupancy: u32, current_capacity: u32) -> u32 {
    if occupancy <= current_capacity {
        return current_capacity;
    }
    let mut capacity = current_capacity.max(1);
    while capacity < occupancy {
        capacity = capacity.saturating_mul(2);
    }
    capacity
}

/// One slot's write payload for the rewrite pass. `index` is the owning
/// resource's `handle.index()`; image/sampler fields are `None` when the
/// slot should fall back to a dummy (destroyed, multisampled, or a plain
/// hole in the index space).
pub struct TextureSlot {
    pub index: u32,
    pub view: Option<vk::ImageView>,
    pub storage_view: Option<vk::ImageView>,
}

pub struct SamplerSlot {
    pub index: u32,
    pub sampler: Option<vk::Sampler>,
}

/// Output of [`BindlessDescriptorTable::assemble_infos`]: fully-populated
/// `DescriptorImageInfo` arrays, plus the owning slot index for each
/// storage-image entry (storage entries are sparse, unlike the other two
/// arrays which have one entry per input slot).
struct AssembledInfos {
    image_infos: Vec<vk::DescriptorImageInfo>,
    storage_infos: Vec<vk::DescriptorImageInfo>,
    storage_indices: Vec<u32>,
    sampler_infos: Vec<vk::DescriptorImageInfo>,
}

struct Descriptors {
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    texture_capacity: u32,
    sampler_capacity: u32,
}

/// Owns the live bindless descriptor set. Created lazily on first
/// `ensure_capacity` call so a `ResourceManager` with no resources yet
/// doesn't need a device-side set at all.
pub struct BindlessDescriptorTable {
    descriptors: Option<Descriptors>,
    dirty: bool,
    dummy_texture_view: vk::ImageView,
    dummy_sampler: vk::Sampler,
}

impl BindlessDescriptorTable {
    pub fn new(dummy_texture_view: vk::ImageView, dummy_sampler: vk::Sampler) -> Self {
        Self { descriptors: None, dirty: true, dummy_texture_view, dummy_sampler }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn texture_capacity(&self) -> u32 {
        self.descriptors.as_ref().map(|d| d.texture_capacity).unwrap_or(0)
    }

    pub fn sampler_capacity(&self) -> u32 {
        self.descriptors.as_ref().map(|d| d.sampler_capacity).unwrap_or(0)
    }

    pub fn set(&self) -> Option<vk::DescriptorSet> {
        self.descriptors.as_ref().map(|d| d.set)
    }

    pub fn layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.descriptors.as_ref().map(|d| d.layout)
    }

    /// Grow the set (rebuilding it from scratch) if `texture_occupancy` or
    /// `sampler_occupancy` would exceed current capacity. The stale set is
    /// handed to `deferred` keyed with `token` rather than destroyed
    /// immediately. Returns `true` if a rebuild happened.
    ///
    /// # Safety
    /// Caller must ensure `gpu`'s device is the one that created any prior
    /// descriptors held by this table.
    pub unsafe fn ensure_capacity(
        &mut self,
        gpu: &Gpu,
        deferred: &mut DeferredQueue,
        token: crate::command::SubmitToken,
        texture_occupancy: u32,
        sampler_occupancy: u32,
    ) -> bool {
        let (current_tex, current_samp) = match &self.descriptors {
            Some(d) => (d.texture_capacity, d.sampler_capacity),
            None => (0, 0),
        };
        let new_tex = capacity_for_occupancy(texture_occupancy, current_tex.max(INITIAL_CAPACITY));
        let new_samp = capacity_for_occupancy(sampler_occupancy, current_samp.max(INITIAL_CAPACITY));

        if self.descriptors.is_some() && new_tex == current_tex && new_samp == current_samp {
            return false;
        }

        let device_max_descriptors =
            gpu.instance.get_physical_device_properties(gpu.physical_device).limits.max_descriptor_set_sampled_images;
        assert!(
            new_tex <= device_max_descriptors && new_samp <= device_max_descriptors,
            "bindless table growth ({new_tex} textures, {new_samp} samplers) exceeds device descriptor-indexing maxima ({device_max_descriptors})"
        );

        let built = Self::build(gpu, new_tex, new_samp);

        if let Some(old) = self.descriptors.replace(built) {
            let device = gpu.device.clone();
            deferred.defer(
                move || unsafe {
                    device.destroy_descriptor_pool(old.pool, None);
                    device.destroy_descriptor_set_layout(old.layout, None);
                },
                token,
            );
            log::info!("BindlessDescriptorTable: grew to {new_tex} textures / {new_samp} samplers");
        } else {
            log::info!("BindlessDescriptorTable: created with {new_tex} textures / {new_samp} samplers");
        }

        self.dirty = true;
        true
    }

    unsafe fn build(gpu: &Gpu, texture_capacity: u32, sampler_capacity: u32) -> Descriptors {
        let binding_flags = vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(TEXTURE_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(texture_capacity)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(sampler_capacity)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(STORAGE_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(texture_capacity)
                .stage_flags(vk::ShaderStageFlags::ALL),
        ];
        let all_flags = [binding_flags; 3];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&all_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut flags_info);
        let layout = gpu
            .device
            .create_descriptor_set_layout(&layout_info, None)
            .expect("vkCreateDescriptorSetLayout (bindless) failed");

        let pool_sizes = [
            vk::DescriptorPoolSize { ty: vk::DescriptorType::SAMPLED_IMAGE, descriptor_count: texture_capacity },
            vk::DescriptorPoolSize { ty: vk::DescriptorType::SAMPLER, descriptor_count: sampler_capacity },
            vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_IMAGE, descriptor_count: texture_capacity },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(1)
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND);
        let pool = gpu.device.create_descriptor_pool(&pool_info, None).expect("vkCreateDescriptorPool (bindless) failed");

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&layouts);
        let set = gpu.device.allocate_descriptor_sets(&alloc_info).expect("vkAllocateDescriptorSets (bindless) failed")[0];

        Descriptors { layout, pool, set, texture_capacity, sampler_capacity }
    }

    /// Resolves each slot's real view/sampler (falling back to the dummy)
    /// into flat `DescriptorImageInfo` arrays, fully built before any
    /// `WriteDescriptorSet` borrows them. Pure and device-free so the
    /// dummy-fallback and storage-skip behavior can be checked without a
    /// device; `rewrite` is the only caller that turns this into writes.
    fn assemble_infos(
        dummy_texture_view: vk::ImageView,
        dummy_sampler: vk::Sampler,
        texture_slots: &[TextureSlot],
        sampler_slots: &[SamplerSlot],
    ) -> AssembledInfos {
        let mut image_infos = Vec::with_capacity(texture_slots.len());
        let mut storage_infos = Vec::new();
        let mut storage_indices = Vec::new();
        let mut sampler_infos = Vec::with_capacity(sampler_slots.len());

        for slot in texture_slots {
            let view = slot.view.unwrap_or(dummy_texture_view);
            image_infos
                .push(vk::DescriptorImageInfo::default().image_view(view).image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));

            if let Some(storage_view) = slot.storage_view {
                storage_infos.push(vk::DescriptorImageInfo::default().image_view(storage_view).image_layout(vk::ImageLayout::GENERAL));
                storage_indices.push(slot.index);
            }
        }

        for slot in sampler_slots {
            let sampler = slot.sampler.unwrap_or(dummy_sampler);
            sampler_infos.push(vk::DescriptorImageInfo::default().sampler(sampler));
        }

        AssembledInfos { image_infos, storage_infos, storage_indices, sampler_infos }
    }

    /// Rewrite every slot of the set: live resources get their real view or
    /// sampler, everything else falls back to the dummy. Called once per
    /// frame before the first draw, only when `dirty`.
    ///
    /// # Safety
    /// `gpu` must own the descriptors this table currently holds.
    pub unsafe fn rewrite(
        &mut self,
        gpu: &Gpu,
        textures: impl Iterator<Item = TextureSlot>,
        samplers: impl Iterator<Item = SamplerSlot>,
    ) {
        let Some(descriptors) = &self.descriptors else {
            self.dirty = false;
            return;
        };

        let texture_slots: Vec<TextureSlot> = textures.collect();
        let sampler_slots: Vec<SamplerSlot> = samplers.collect();
        let AssembledInfos { image_infos, storage_infos, storage_indices, sampler_infos } =
            Self::assemble_infos(self.dummy_texture_view, self.dummy_sampler, &texture_slots, &sampler_slots);

        // `image_infos`/`storage_infos`/`sampler_infos` are fully built and
        // never touched again below, so every `WriteDescriptorSet` can
        // borrow into them without risking a reallocation invalidating an
        // earlier write's pointer.
        let mut writes = Vec::with_capacity(texture_slots.len() + storage_infos.len() + sampler_slots.len());

        for (slot, info) in texture_slots.iter().zip(image_infos.iter()) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptors.set)
                    .dst_binding(TEXTURE_BINDING)
                    .dst_array_element(slot.index)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(std::slice::from_ref(info)),
            );
        }

        for (index, info) in storage_indices.iter().zip(storage_infos.iter()) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptors.set)
                    .dst_binding(STORAGE_IMAGE_BINDING)
                    .dst_array_element(*index)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(info)),
            );
        }

        for (slot, info) in sampler_slots.iter().zip(sampler_infos.iter()) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptors.set)
                    .dst_binding(SAMPLER_BINDING)
                    .dst_array_element(slot.index)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(std::slice::from_ref(info)),
            );
        }

        if !writes.is_empty() {
            gpu.device.update_descriptor_sets(&writes, &[]);
        }
        log::debug!("BindlessDescriptorTable: rewrote {} descriptors", writes.len());
        self.dirty = false;
    }

    /// # Safety
    /// Must only be called once, at manager teardown, after a device-idle
    /// wait.
    pub unsafe fn destroy(&mut self, gpu: &Gpu) {
        if let Some(descriptors) = self.descriptors.take() {
            gpu.device.destroy_descriptor_pool(descriptors.pool, None);
            gpu.device.destroy_descriptor_set_layout(descriptors.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn seventeen_creates_at_capacity_sixteen_double_once() {
        assert_eq!(capacity_for_occupancy(17, 16), 32);
        assert_eq!(capacity_for_occupancy(16, 16), 16);
        assert_eq!(capacity_for_occupancy(32, 32), 32);
    }

    #[test]
    fn growth_always_reaches_next_power_of_two_at_or_above_occupancy() {
        assert_eq!(capacity_for_occupancy(1, 0), 1);
        assert_eq!(capacity_for_occupancy(3, 1), 4);
        assert_eq!(capacity_for_occupancy(33, 32), 64);
        assert_eq!(capacity_for_occupancy(0, 16), 16);
    }

    #[test]
    fn capacity_never_shrinks() {
        assert_eq!(capacity_for_occupancy(5, 64), 64);
    }

    #[test]
    fn assemble_infos_falls_back_to_dummy_and_skips_missing_storage_views() {
        let dummy_view = vk::ImageView::from_raw(0xdead);
        let dummy_sampler = vk::Sampler::from_raw(0xbeef);
        let real_view = vk::ImageView::from_raw(1);
        let real_storage_view = vk::ImageView::from_raw(2);
        let real_sampler = vk::Sampler::from_raw(3);

        let texture_slots = vec![
            TextureSlot { index: 5, view: Some(real_view), storage_view: Some(real_storage_view) },
            TextureSlot { index: 6, view: None, storage_view: None },
        ];
        let sampler_slots = vec![
            SamplerSlot { index: 0, sampler: Some(real_sampler) },
            SamplerSlot { index: 1, sampler: None },
        ];

        let assembled = BindlessDescriptorTable::assemble_infos(dummy_view, dummy_sampler, &texture_slots, &sampler_slots);

        // One sampled-image entry per texture slot, dummy substituted for the hole.
        assert_eq!(assembled.image_infos.len(), 2);
        assert_eq!(assembled.image_infos[0].image_view, real_view);
        assert_eq!(assembled.image_infos[1].image_view, dummy_view);

        // Storage entries are sparse: only the slot with a storage view gets one,
        // tagged with its owning index for the write pass to pick up.
        assert_eq!(assembled.storage_infos.len(), 1);
        assert_eq!(assembled.storage_indices, vec![5]);
        assert_eq!(assembled.storage_infos[0].image_view, real_storage_view);

        // One sampler entry per sampler slot, dummy substituted for the hole.
        assert_eq!(assembled.sampler_infos.len(), 2);
        assert_eq!(assembled.sampler_infos[0].sampler, real_sampler);
        assert_eq!(assembled.sampler_infos[1].sampler, dummy_sampler);
    }
}
