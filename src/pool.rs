//! `HandlePool<K, Payload>`: a slab with a free-list, generational reuse.
//!
//! Built on the `slab` crate for the backing growable array — O(1)
//! insert/remove, freed indices reused by the next insert — with a
//! generation counter layered per index on top, since `slab::Slab` itself
//! has no notion of generations: a `Handle<K>` that outlives its slot's
//! reuse must read back as gone rather than resolving to whatever new
//! payload landed on the same index. Mirrors the source's `lvk`-derived
//! `HandlePool` (`ObjectHandles.h`).

use slab::Slab;

use crate::handle::{Handle, Kind};

/// Slab-backed pool of `Payload`, addressed by `Handle<K>`. Every operation
/// is O(1) except [`HandlePool::find_handle_for`].
pub struct HandlePool<K: Kind, Payload> {
    entries: Slab<Payload>,
    generations: Vec<u32>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: Kind, Payload> Default for HandlePool<K, Payload> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Kind, Payload> HandlePool<K, Payload> {
    pub fn new() -> Self {
        Self { entries: Slab::new(), generations: Vec::new(), _kind: std::marker::PhantomData }
    }

    /// Insert `payload`, reusing a free slot if one exists. O(1).
    ///
    /// The slot's generation is preserved across reuse and only incremented
    /// on destroy, so the first insert into a fresh slot observes
    /// generation 1.
    pub fn insert(&mut self, payload: Payload) -> Handle<K> {
        let index = self.entries.insert(payload);
        if index == self.generations.len() {
            self.generations.push(1);
        }
        Handle::new(index as u32, self.generations[index])
    }

    fn slot_matches(&self, handle: Handle<K>) -> Option<usize> {
        if handle.is_empty() {
            return None;
        }
        let index = handle.index() as usize;
        if self.generations.get(index).copied() != Some(handle.generation()) {
            return None;
        }
        self.entries.contains(index).then_some(index)
    }

    /// Destroy `handle`. No-op if the handle is invalid (empty, out of
    /// range, stale, or already destroyed).
    pub fn destroy(&mut self, handle: Handle<K>) {
        let Some(index) = self.slot_matches(handle) else { return };
        self.entries.remove(index);
        // Skip generation 0 on wrap so "empty" stays unambiguous.
        self.generations[index] = self.generations[index].wrapping_add(1).max(1);
    }

    pub fn get(&self, handle: Handle<K>) -> Option<&Payload> {
        let index = self.slot_matches(handle)?;
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> Option<&mut Payload> {
        let index = self.slot_matches(handle)?;
        self.entries.get_mut(index)
    }

    /// Number of live (non-destroyed) entries.
    pub fn len_active(&self) -> usize {
        self.entries.len()
    }

    /// Linear search by address identity. Used only during shutdown, where
    /// a caller holds a `&Payload` and needs its handle back.
    pub fn find_handle_for(&self, payload: &Payload) -> Option<Handle<K>> {
        for (index, entry) in self.entries.iter() {
            if std::ptr::eq(entry, payload) {
                return Some(Handle::new(index as u32, self.generations[index]));
            }
        }
        None
    }

    /// Iterate every live slot as `(handle, &payload)`, skipping free slots.
    pub fn iter_active(&self) -> impl Iterator<Item = (Handle<K>, &Payload)> {
        self.entries.iter().map(move |(index, payload)| (Handle::new(index as u32, self.generations[index]), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Texture as TextureTag;

    type TestPool = HandlePool<TextureTag, u32>;

    #[test]
    fn insert_then_destroy_invalidates_forever() {
        let mut pool = TestPool::new();
        let h = pool.insert(10);
        assert_eq!(pool.get(h), Some(&10));
        pool.destroy(h);
        assert_eq!(pool.get(h), None);
        // Re-destroying is a no-op, doesn't panic or double-free the list.
        pool.destroy(h);
        assert_eq!(pool.get(h), None);
    }

    #[test]
    fn reused_slot_gets_strictly_greater_generation() {
        let mut pool = TestPool::new();
        let h1 = pool.insert(1);
        pool.destroy(h1);
        let h2 = pool.insert(2);
        assert_eq!(h1.index(), h2.index());
        assert!(h2.generation() > h1.generation());
        assert_eq!(pool.get(h1), None);
        assert_eq!(pool.get(h2), Some(&2));
    }

    #[test]
    fn len_active_tracks_inserts_minus_destroys() {
        let mut pool = TestPool::new();
        let a = pool.insert(1);
        let b = pool.insert(2);
        let _c = pool.insert(3);
        assert_eq!(pool.len_active(), 3);
        pool.destroy(a);
        assert_eq!(pool.len_active(), 2);
        pool.destroy(b);
        assert_eq!(pool.len_active(), 1);
    }

    #[test]
    fn destroying_empty_handle_is_noop() {
        let mut pool = TestPool::new();
        pool.destroy(Handle::empty());
        assert_eq!(pool.len_active(), 0);
    }

    #[test]
    fn iter_active_skips_free_slots() {
        let mut pool = TestPool::new();
        let a = pool.insert(1);
        let b = pool.insert(2);
        pool.destroy(a);
        let live: Vec<_> = pool.iter_active().map(|(h, v)| (h, *v)).collect();
        assert_eq!(live, vec![(b, 2)]);
    }

    #[test]
    fn get_mut_allows_in_place_update() {
        let mut pool = TestPool::new();
        let h = pool.insert(1);
        *pool.get_mut(h).unwrap() = 42;
        assert_eq!(pool.get(h), Some(&42));
    }

    #[test]
    fn stale_handle_never_resolves_to_resurrected_slot() {
        let mut pool = TestPool::new();
        let h1 = pool.insert(1);
        pool.destroy(h1);
        let _h2 = pool.insert(99);
        assert_eq!(pool.get(h1), None);
    }
}
