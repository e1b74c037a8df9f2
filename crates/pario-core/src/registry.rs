//! Process-local handle registries for IOSystems, Decompositions, and Files.
//!
//! Reference: spec §4.2. Every handle returned across the public API is a
//! plain integer id, looked up through one of these tables rather than
//! exposed as a pointer — the same opaque-handle discipline the teacher
//! applies to `FileHandle`/`XferToken` in its transfer layer, just backed
//! by a table instead of an `Any` box since every entry here is the same
//! concrete type.

use std::cell::Cell;
use std::collections::HashMap;

/// First id handed out for decompositions (spec §4.2); IOSystem and File ids
/// use disjoint ranges starting at 0 so the three id spaces never collide.
pub const DECOMP_ID_BASE: i32 = 512;

/// A process-local table mapping monotonically increasing integer ids to
/// `T`. Each `Registry<T>` owns one disjoint id range, fixed at construction.
pub struct Registry<T> {
    next_id: Cell<i32>,
    entries: HashMap<i32, T>,
}

impl<T> Registry<T> {
    pub fn new(first_id: i32) -> Self {
        Registry {
            next_id: Cell::new(first_id),
            entries: HashMap::new(),
        }
    }

    /// Reserve a fresh id and insert `value` under it.
    pub fn insert(&mut self, value: T) -> i32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.insert(id, value);
        id
    }

    pub fn get(&self, id: i32) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: i32) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: i32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&i32, &T)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_disjoint_from_base() {
        let mut reg: Registry<&str> = Registry::new(DECOMP_ID_BASE);
        let a = reg.insert("a");
        let b = reg.insert("b");
        assert_eq!(a, DECOMP_ID_BASE);
        assert_eq!(b, DECOMP_ID_BASE + 1);
        assert_eq!(reg.get(a), Some(&"a"));
    }

    #[test]
    fn remove_frees_entry_but_not_id() {
        let mut reg: Registry<i32> = Registry::new(0);
        let id = reg.insert(42);
        assert_eq!(reg.remove(id), Some(42));
        assert!(!reg.contains(id));
        let next = reg.insert(7);
        assert_ne!(next, id);
    }

    #[test]
    fn independent_registries_do_not_collide() {
        let mut iosys: Registry<()> = Registry::new(0);
        let mut decomp: Registry<()> = Registry::new(DECOMP_ID_BASE);
        let a = iosys.insert(());
        let b = decomp.insert(());
        assert!(a < DECOMP_ID_BASE);
        assert!(b >= DECOMP_ID_BASE);
    }
}
