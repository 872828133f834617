//! Generational handles: a 64-bit stable identity for every GPU resource.
//!
//! A handle is `{index, generation}`. `generation == 0` is reserved for the
//! empty handle; a pool never hands out generation 0 for a live slot.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Resource kinds a [`Handle`] can be tagged with. Purely a type-level marker
/// so `Handle<Buffer>` and `Handle<Texture>` cannot be confused at compile
/// time, mirroring the source's `InternalObjectHandle<Tag>` aliases.
pub trait Kind: 'static {}

macro_rules! kind {
    ($name:ident) => {
        #[derive(Debug)]
        pub enum $name {}
        impl Kind for $name {}
    };
}

kind!(Buffer);
kind!(Texture);
kind!(Sampler);
kind!(Shader);
kind!(GraphicsPipeline);
kind!(ComputePipeline);
kind!(TextureView);

/// Opaque 64-bit handle to a GPU resource of a given [`Kind`].
///
/// Two handles are equal iff both the index and the generation match. A
/// handle whose generation is reused after destruction compares unequal to
/// the one issued before, so stale references are detected rather than
/// silently resolving to a different resource.
pub struct Handle<K: Kind> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Kind> Handle<K> {
    /// Construct a handle from its raw parts. Used only by [`crate::pool::HandlePool`].
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation, _kind: PhantomData }
    }

    /// The handle that never refers to a live resource.
    pub const fn empty() -> Self {
        Self { index: 0, generation: 0, _kind: PhantomData }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_valid(&self) -> bool {
        self.generation != 0
    }

    pub fn is_empty(&self) -> bool {
        self.generation == 0
    }
}

impl<K: Kind> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K: Kind> Copy for Handle<K> {}

impl<K: Kind> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<K: Kind> Eq for Handle<K> {}

impl<K: Kind> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // (index << 32) | generation, per spec §4.A.
        let combined = ((self.index as u64) << 32) | self.generation as u64;
        combined.hash(state);
    }
}

impl<K: Kind> std::fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("index", &self.index).field("generation", &self.generation).finish()
    }
}

impl<K: Kind> Default for Handle<K> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Formats a handle as `{index}#{generation}` for logs and the wire, with
/// generation 0 printed as `<null>` (spec §6, "Handle encoding on the wire").
impl<K: Kind> std::fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.generation == 0 {
            write!(f, "<null>")
        } else {
            write!(f, "{}#{}", self.index, self.generation)
        }
    }
}

pub type BufferHandle = Handle<Buffer>;
pub type TextureHandle = Handle<Texture>;
pub type SamplerHandle = Handle<Sampler>;
pub type ShaderHandle = Handle<Shader>;
pub type GraphicsPipelineHandle = Handle<GraphicsPipeline>;
pub type ComputePipelineHandle = Handle<ComputePipeline>;
pub type TextureViewHandle = Handle<TextureView>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_handle_is_invalid() {
        let h = TextureHandle::empty();
        assert!(h.is_empty());
        assert!(!h.is_valid());
        assert_eq!(h.generation(), 0);
    }

    #[test]
    fn equality_requires_both_fields() {
        let a = TextureHandle::new(3, 1);
        let b = TextureHandle::new(3, 2);
        let c = TextureHandle::new(4, 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, TextureHandle::new(3, 1));
    }

    #[test]
    fn display_formats_null_and_live() {
        assert_eq!(format!("{}", TextureHandle::empty()), "<null>");
        assert_eq!(format!("{}", TextureHandle::new(5, 2)), "5#2");
    }

    #[test]
    fn hash_combines_index_and_generation() {
        use std::collections::hash_map::DefaultHasher;
        fn hash_of(h: &TextureHandle) -> u64 {
            let mut s = DefaultHasher::new();
            h.hash(&mut s);
            s.finish()
        }
        let a = TextureHandle::new(1, 1);
        let b = TextureHandle::new(1, 2);
        assert_ne!(hash_of(&a), hash_of(&b));
    }
}
