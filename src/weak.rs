//! Generation-tagged weak handles.
//!
//! A weak handle is a slot id plus the generation the slot had when the
//! handle was created. Dereferencing re-checks the generation, so a handle
//! whose target has been invalidated — or whose slot has since been reused
//! for a different value — fails closed instead of resurrecting a zombie.

use core::fmt;

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    struct WeakKey;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// WeakHandle
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A copyable handle into a [`WeakTable`] that never outlives its target's
/// validity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WeakHandle {
    key: WeakKey,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// WeakTable
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The versioned slot table backing weak handles.
pub struct WeakTable<T> {
    slots: SlotMap<WeakKey, T>,
}

/********** impl inherent *************************************************************************/

impl<T> WeakTable<T> {
    /// Creates an empty table.
    #[inline]
    pub fn new() -> Self {
        Self { slots: SlotMap::with_key() }
    }

    /// Registers `value` and returns a handle to it.
    #[inline]
    pub fn register(&mut self, value: T) -> WeakHandle {
        WeakHandle { key: self.slots.insert(value) }
    }

    /// Dereferences `handle`, returning `None` for stale handles.
    #[inline]
    pub fn get(&self, handle: WeakHandle) -> Option<&T> {
        self.slots.get(handle.key)
    }

    /// Mutably dereferences `handle`, returning `None` for stale handles.
    #[inline]
    pub fn get_mut(&mut self, handle: WeakHandle) -> Option<&mut T> {
        self.slots.get_mut(handle.key)
    }

    /// Returns `true` while `handle` is still valid.
    #[inline]
    pub fn is_valid(&self, handle: WeakHandle) -> bool {
        self.slots.contains_key(handle.key)
    }

    /// Invalidates `handle`, returning the stored value; every copy of the
    /// handle is stale from here on, even if the slot is later reused.
    #[inline]
    pub fn invalidate(&mut self, handle: WeakHandle) -> Option<T> {
        self.slots.remove(handle.key)
    }

    /// Returns the number of live slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if no slots are live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/********** impl Default **************************************************************************/

impl<T> Default for WeakTable<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for WeakTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WeakTable").field("slots", &self.slots.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::WeakTable;

    #[test]
    fn handles_deref_while_valid() {
        let mut table = WeakTable::new();
        let handle = table.register("alive");

        assert!(table.is_valid(handle));
        assert_eq!(table.get(handle), Some(&"alive"));
    }

    #[test]
    fn invalidated_handles_fail_closed() {
        let mut table = WeakTable::new();
        let handle = table.register(1);

        assert_eq!(table.invalidate(handle), Some(1));
        assert!(!table.is_valid(handle));
        assert!(table.get(handle).is_none());
        assert!(table.invalidate(handle).is_none());
    }

    #[test]
    fn reused_slots_do_not_resurrect_old_handles() {
        let mut table = WeakTable::new();
        let old = table.register(1);
        table.invalidate(old);

        // the slot may be recycled, but the generation moved on
        let new = table.register(2);
        assert!(table.get(old).is_none());
        assert_eq!(table.get(new), Some(&2));
        assert_ne!(old, new);
    }
}
