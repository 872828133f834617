//! `TextureStateTracker`: per-texture layout + access bookkeeping consumed
//! by the render graph's barrier synthesis (§4.G). Pure logic — no `ash`
//! dependency — so the state machine and the layout→stage/access table can
//! be unit tested without a device.

use std::collections::HashMap;

use crate::handle::TextureHandle;

/// The full set of image layouts this crate reasons about internally. The
/// render graph's public [`crate::graph::Layout`] (the handful of layouts a
/// pass declaration can name) maps into this set at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

bitflags::bitflags! {
    /// Mirrors `VkAccessFlags2`'s subset this crate emits barriers for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Access: u32 {
        const SHADER_READ               = 1 << 0;
        const SHADER_WRITE              = 1 << 1;
        const COLOR_ATTACHMENT_READ      = 1 << 2;
        const COLOR_ATTACHMENT_WRITE     = 1 << 3;
        const DEPTH_STENCIL_READ         = 1 << 4;
        const DEPTH_STENCIL_WRITE        = 1 << 5;
        const TRANSFER_READ              = 1 << 6;
        const TRANSFER_WRITE             = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Mirrors `VkPipelineStageFlags2`'s subset this crate emits barriers for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Stage: u32 {
        const FRAGMENT_SHADER          = 1 << 0;
        const COMPUTE_SHADER           = 1 << 1;
        const COLOR_ATTACHMENT_OUTPUT  = 1 << 2;
        const EARLY_FRAGMENT_TESTS     = 1 << 3;
        const LATE_FRAGMENT_TESTS      = 1 << 4;
        const TRANSFER                 = 1 << 5;
        const ALL_COMMANDS             = 1 << 6;
    }
}

/// `{layout, stage_mask, access_mask}` — the unit the tracker stores and the
/// graph compiler diffs against to decide whether a barrier is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureState {
    pub layout: ImageLayout,
    pub stage_mask: Stage,
    pub access_mask: Access,
}

impl TextureState {
    pub const UNDEFINED: Self =
        Self { layout: ImageLayout::Undefined, stage_mask: Stage::empty(), access_mask: Access::empty() };
}

/// The canonical stage/access derivation table keyed by destination layout
/// (spec §9). Implementers may extend it but must preserve these mappings.
pub fn stage_access_for_layout(layout: ImageLayout) -> (Stage, Access) {
    match layout {
        ImageLayout::Undefined => (Stage::empty(), Access::empty()),
        ImageLayout::General => {
            (Stage::COMPUTE_SHADER | Stage::FRAGMENT_SHADER, Access::SHADER_READ | Access::SHADER_WRITE)
        }
        ImageLayout::ShaderReadOnly => (Stage::FRAGMENT_SHADER | Stage::COMPUTE_SHADER, Access::SHADER_READ),
        ImageLayout::ColorAttachment => {
            (Stage::COLOR_ATTACHMENT_OUTPUT, Access::COLOR_ATTACHMENT_READ | Access::COLOR_ATTACHMENT_WRITE)
        }
        ImageLayout::DepthStencilAttachment => (
            Stage::EARLY_FRAGMENT_TESTS | Stage::LATE_FRAGMENT_TESTS,
            Access::DEPTH_STENCIL_READ | Access::DEPTH_STENCIL_WRITE,
        ),
        ImageLayout::TransferSrc => (Stage::TRANSFER, Access::TRANSFER_READ),
        ImageLayout::TransferDst => (Stage::TRANSFER, Access::TRANSFER_WRITE),
        ImageLayout::PresentSrc => (Stage::ALL_COMMANDS, Access::empty()),
    }
}

/// A sub-region of a texture: a mip range and a layer range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub num_mips: u32,
    pub base_layer: u32,
    pub num_layers: u32,
}

impl SubresourceRange {
    pub fn contains(&self, other: &SubresourceRange) -> bool {
        other.base_mip >= self.base_mip
            && other.base_mip + other.num_mips <= self.base_mip + self.num_mips
            && other.base_layer >= self.base_layer
            && other.base_layer + other.num_layers <= self.base_layer + self.num_layers
    }

    pub fn overlaps(&self, other: &SubresourceRange) -> bool {
        let mips_overlap =
            self.base_mip < other.base_mip + other.num_mips && other.base_mip < self.base_mip + self.num_mips;
        let layers_overlap = self.base_layer < other.base_layer + other.num_layers
            && other.base_layer < self.base_layer + self.num_layers;
        mips_overlap && layers_overlap
    }
}

enum Storage {
    Whole(TextureState),
    PerSub(Vec<(SubresourceRange, TextureState)>),
}

struct TrackedTexture {
    total: SubresourceRange,
    storage: Storage,
}

impl TrackedTexture {
    fn new(total: SubresourceRange) -> Self {
        Self { total, storage: Storage::Whole(TextureState::UNDEFINED) }
    }

    fn write(&mut self, range: SubresourceRange, state: TextureState) {
        let is_total = range == self.total;
        match &mut self.storage {
            Storage::Whole(current) => {
                if is_total {
                    *current = state;
                } else {
                    let previous = *current;
                    self.storage = Storage::PerSub(vec![(range, state)]);
                    // The rest of `total` keeps the prior whole-resource state.
                    if let Storage::PerSub(entries) = &mut self.storage {
                        entries.insert(0, (self.total, previous));
                    }
                }
            }
            Storage::PerSub(entries) => {
                if is_total {
                    self.storage = Storage::Whole(state);
                } else {
                    // Upsert an exact-range entry; overlapping entries are
                    // intentionally not coalesced (spec §9).
                    if let Some(slot) = entries.iter_mut().find(|(r, _)| *r == range) {
                        slot.1 = state;
                    } else {
                        entries.push((range, state));
                    }
                }
            }
        }
    }

    fn read(&self, range: SubresourceRange) -> TextureState {
        match &self.storage {
            Storage::Whole(state) => *state,
            Storage::PerSub(entries) => entries
                .iter()
                .rev()
                .find(|(r, _)| r.contains(&range))
                .map(|(_, s)| *s)
                .unwrap_or(TextureState::UNDEFINED),
        }
    }
}

/// Tracks current layout+access per texture. Whole-resource fast path by
/// default; splits into per-subresource entries only once a write targets
/// less than the whole range, and collapses back to whole-resource the
/// moment a write covers the whole range again.
#[derive(Default)]
pub struct TextureStateTracker {
    textures: HashMap<TextureHandle, TrackedTexture>,
}

impl TextureStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `handle` with the given total extent, in the
    /// `Undefined` state. Called by the resource manager on texture
    /// creation/resize.
    pub fn register(&mut self, handle: TextureHandle, total: SubresourceRange) {
        self.textures.insert(handle, TrackedTexture::new(total));
    }

    pub fn unregister(&mut self, handle: TextureHandle) {
        self.textures.remove(&handle);
    }

    pub fn write(&mut self, handle: TextureHandle, range: SubresourceRange, state: TextureState) {
        if let Some(tracked) = self.textures.get_mut(&handle) {
            tracked.write(range, state);
        }
    }

    /// Returns the tracked state for `range`, or `Undefined` (a safe default
    /// that forces a conservative barrier) if nothing is known — either
    /// because the texture isn't tracked, or no per-subresource entry
    /// fully contains `range`.
    pub fn read(&self, handle: TextureHandle, range: SubresourceRange) -> TextureState {
        self.textures.get(&handle).map(|t| t.read(range)).unwrap_or(TextureState::UNDEFINED)
    }

    pub fn total_range(&self, handle: TextureHandle) -> Option<SubresourceRange> {
        self.textures.get(&handle).map(|t| t.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whole(mips: u32, layers: u32) -> SubresourceRange {
        SubresourceRange { base_mip: 0, num_mips: mips, base_layer: 0, num_layers: layers }
    }

    fn state(layout: ImageLayout) -> TextureState {
        let (stage_mask, access_mask) = stage_access_for_layout(layout);
        TextureState { layout, stage_mask, access_mask }
    }

    #[test]
    fn fresh_texture_reads_as_undefined() {
        let mut tracker = TextureStateTracker::new();
        let h = TextureHandle::new(0, 1);
        tracker.register(h, whole(1, 1));
        assert_eq!(tracker.read(h, whole(1, 1)).layout, ImageLayout::Undefined);
    }

    #[test]
    fn whole_write_then_whole_read_stays_fast_path() {
        let mut tracker = TextureStateTracker::new();
        let h = TextureHandle::new(0, 1);
        let total = whole(4, 1);
        tracker.register(h, total);
        tracker.write(h, total, state(ImageLayout::ColorAttachment));
        assert_eq!(tracker.read(h, total).layout, ImageLayout::ColorAttachment);
    }

    #[test]
    fn partial_write_splits_then_collapses() {
        let mut tracker = TextureStateTracker::new();
        let h = TextureHandle::new(0, 1);
        let total = whole(4, 1);
        tracker.register(h, total);

        let first_two = SubresourceRange { base_mip: 0, num_mips: 2, base_layer: 0, num_layers: 1 };
        tracker.write(h, first_two, state(ImageLayout::TransferSrc));
        // The untouched tail still reads the prior whole-resource state (Undefined).
        let tail = SubresourceRange { base_mip: 2, num_mips: 2, base_layer: 0, num_layers: 1 };
        assert_eq!(tracker.read(h, tail).layout, ImageLayout::Undefined);
        assert_eq!(tracker.read(h, first_two).layout, ImageLayout::TransferSrc);

        // A write to the whole range collapses back to the fast path.
        tracker.write(h, total, state(ImageLayout::ShaderReadOnly));
        assert_eq!(tracker.read(h, total).layout, ImageLayout::ShaderReadOnly);
        assert_eq!(tracker.read(h, first_two).layout, ImageLayout::ShaderReadOnly);
    }

    #[test]
    fn unknown_subrange_reads_as_undefined_safe_default() {
        let mut tracker = TextureStateTracker::new();
        let h = TextureHandle::new(0, 1);
        let total = whole(4, 1);
        tracker.register(h, total);
        let mips_0_1 = SubresourceRange { base_mip: 0, num_mips: 1, base_layer: 0, num_layers: 1 };
        tracker.write(h, mips_0_1, state(ImageLayout::TransferSrc));
        // Asking about mip 2, which no entry covers, stays conservative.
        let mip_2 = SubresourceRange { base_mip: 2, num_mips: 1, base_layer: 0, num_layers: 1 };
        assert_eq!(tracker.read(h, mip_2).layout, ImageLayout::Undefined);
    }

    #[test]
    fn overlapping_writes_are_not_coalesced() {
        let mut tracker = TextureStateTracker::new();
        let h = TextureHandle::new(0, 1);
        let total = whole(4, 1);
        tracker.register(h, total);
        let a = SubresourceRange { base_mip: 0, num_mips: 2, base_layer: 0, num_layers: 1 };
        let b = SubresourceRange { base_mip: 1, num_mips: 2, base_layer: 0, num_layers: 1 };
        tracker.write(h, a, state(ImageLayout::TransferSrc));
        tracker.write(h, b, state(ImageLayout::TransferDst));
        // Both entries exist independently; reading exactly `b` gets `b`'s state.
        assert_eq!(tracker.read(h, b).layout, ImageLayout::TransferDst);
        assert_eq!(tracker.read(h, a).layout, ImageLayout::TransferSrc);
    }

    #[test]
    fn stage_access_table_preserves_required_mappings() {
        assert_eq!(
            stage_access_for_layout(ImageLayout::ShaderReadOnly),
            (Stage::FRAGMENT_SHADER | Stage::COMPUTE_SHADER, Access::SHADER_READ)
        );
        assert_eq!(
            stage_access_for_layout(ImageLayout::ColorAttachment),
            (Stage::COLOR_ATTACHMENT_OUTPUT, Access::COLOR_ATTACHMENT_READ | Access::COLOR_ATTACHMENT_WRITE)
        );
        assert_eq!(
            stage_access_for_layout(ImageLayout::DepthStencilAttachment),
            (
                Stage::EARLY_FRAGMENT_TESTS | Stage::LATE_FRAGMENT_TESTS,
                Access::DEPTH_STENCIL_READ | Access::DEPTH_STENCIL_WRITE
            )
        );
        assert_eq!(stage_access_for_layout(ImageLayout::TransferSrc), (Stage::TRANSFER, Access::TRANSFER_READ));
        assert_eq!(stage_access_for_layout(ImageLayout::TransferDst), (Stage::TRANSFER, Access::TRANSFER_WRITE));
        assert_eq!(stage_access_for_layout(ImageLayout::PresentSrc), (Stage::ALL_COMMANDS, Access::empty()));
    }

    #[test]
    fn range_contains_and_overlaps() {
        let whole = whole(4, 2);
        let sub = SubresourceRange { base_mip: 1, num_mips: 2, base_layer: 0, num_layers: 1 };
        assert!(whole.contains(&sub));
        assert!(!sub.contains(&whole));
        let disjoint = SubresourceRange { base_mip: 3, num_mips: 1, base_layer: 1, num_layers: 1 };
        assert!(!sub.overlaps(&disjoint));
        let touching = SubresourceRange { base_mip: 2, num_mips: 2, base_layer: 0, num_layers: 1 };
        assert!(sub.overlaps(&touching));
    }
}
