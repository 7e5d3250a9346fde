//! Symmetric reference counting with scope-rooted ownership.
//!
//! Every object carries two counts: `external` references from roots
//! (scopes, the stack) and `internal` references from other heap objects.
//! An object dies when both reach zero; an object with no external but
//! remaining internal references is *orphaned* — it belongs to a garbage
//! cycle that only the SCC collector can reclaim, and the split counts
//! detect that situation without tracing.
//!
//! Destruction cascades through outgoing references via an explicit
//! worklist; a recursive release would overflow on long chains.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use core::fmt;

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Key of an object in a [`SymHeap`].
    pub struct SymKey;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// SymHeap
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The slab of symmetrically counted objects.
///
/// Keys are versioned: any operation on a key whose object has already
/// been destroyed is a no-op and reads return zero/false, so double
/// releases can not touch recycled slots.
pub struct SymHeap<T> {
    objs: SlotMap<SymKey, SymObj<T>>,
}

struct SymObj<T> {
    external: usize,
    internal: usize,
    refs: Vec<SymKey>,
    payload: T,
}

/********** impl inherent *************************************************************************/

impl<T> SymHeap<T> {
    /// Creates an empty heap.
    #[inline]
    pub fn new() -> Self {
        Self { objs: SlotMap::with_key() }
    }

    /// Inserts an object with both counts zero and no outgoing references.
    ///
    /// A fresh object is kept alive by the first `inc_external` (usually
    /// via [`SymCtx::own`]) or incoming `add_ref`; dropping the payload is
    /// its destructor.
    #[inline]
    pub fn insert(&mut self, payload: T) -> SymKey {
        self.objs.insert(SymObj { external: 0, internal: 0, refs: Vec::new(), payload })
    }

    /// Records a reference from `from` to `to`.
    ///
    /// Increments `to`'s internal count and remembers the edge in `from`'s
    /// outgoing vector so that `from`'s destruction releases it again.
    pub fn add_ref(&mut self, from: SymKey, to: SymKey) {
        if !self.objs.contains_key(from) || !self.objs.contains_key(to) {
            return;
        }
        if let Some(target) = self.objs.get_mut(to) {
            target.internal += 1;
        }
        if let Some(source) = self.objs.get_mut(from) {
            source.refs.push(to);
        }
    }

    /// Increments the external (root) count of `key`.
    pub fn inc_external(&mut self, key: SymKey) {
        if let Some(obj) = self.objs.get_mut(key) {
            obj.external += 1;
        }
    }

    /// Decrements the external count of `key`, destroying it (and
    /// cascading) once both counts are zero.
    pub fn dec_external(&mut self, key: SymKey) {
        if let Some(obj) = self.objs.get_mut(key) {
            debug_assert!(obj.external > 0, "external count underflow");
            obj.external = obj.external.saturating_sub(1);
            self.collect(key);
        }
    }

    /// Decrements the internal count of `key`, destroying it (and
    /// cascading) once both counts are zero.
    pub fn dec_internal(&mut self, key: SymKey) {
        if let Some(obj) = self.objs.get_mut(key) {
            debug_assert!(obj.internal > 0, "internal count underflow");
            obj.internal = obj.internal.saturating_sub(1);
            self.collect(key);
        }
    }

    /// Returns `true` if `key` is unreachable from any root but still has
    /// incoming heap references — the signature of a garbage cycle.
    #[inline]
    pub fn is_orphaned(&self, key: SymKey) -> bool {
        match self.objs.get(key) {
            Some(obj) => obj.external == 0 && obj.internal > 0,
            None => false,
        }
    }

    /// Returns the sum of both counts, or zero for a dead key.
    #[inline]
    pub fn total_rc(&self, key: SymKey) -> usize {
        match self.objs.get(key) {
            Some(obj) => obj.external + obj.internal,
            None => 0,
        }
    }

    /// Returns the external count, or zero for a dead key.
    #[inline]
    pub fn external_rc(&self, key: SymKey) -> usize {
        self.objs.get(key).map_or(0, |obj| obj.external)
    }

    /// Returns the internal count, or zero for a dead key.
    #[inline]
    pub fn internal_rc(&self, key: SymKey) -> usize {
        self.objs.get(key).map_or(0, |obj| obj.internal)
    }

    /// Returns a reference to the payload of a live object.
    #[inline]
    pub fn get(&self, key: SymKey) -> Option<&T> {
        self.objs.get(key).map(|obj| &obj.payload)
    }

    /// Returns `true` if `key` refers to a live object.
    #[inline]
    pub fn contains(&self, key: SymKey) -> bool {
        self.objs.contains_key(key)
    }

    /// Returns the number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.objs.len()
    }

    /// Returns `true` if the heap holds no live objects.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    /// Destroys `key` if both its counts are zero, cascading through its
    /// outgoing references with an explicit worklist.
    fn collect(&mut self, key: SymKey) {
        let mut work = vec![key];

        while let Some(key) = work.pop() {
            let dead = match self.objs.get(key) {
                Some(obj) => obj.external == 0 && obj.internal == 0,
                None => false,
            };
            if !dead {
                continue;
            }

            // removing first makes the destruction idempotent: nothing can
            // reach the object once its slot version is bumped
            if let Some(obj) = self.objs.remove(key) {
                drop(obj.payload);
                for target in obj.refs {
                    if let Some(referenced) = self.objs.get_mut(target) {
                        debug_assert!(referenced.internal > 0, "internal count underflow");
                        referenced.internal = referenced.internal.saturating_sub(1);
                        if referenced.external == 0 && referenced.internal == 0 {
                            work.push(target);
                        }
                    }
                }
            }
        }
    }
}

/********** impl Default **************************************************************************/

impl<T> Default for SymHeap<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for SymHeap<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SymHeap").field("objects", &self.objs.len()).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// SymCtx
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A heap plus a stack of ownership scopes.
///
/// Scopes root objects: owning an object raises its external count, and
/// releasing the scope (explicitly or by dropping the context) lowers it
/// again. Objects that only cycles keep alive after their scope dies show
/// up as orphaned.
pub struct SymCtx<T> {
    heap: SymHeap<T>,
    scopes: Vec<Scope>,
}

struct Scope {
    owned: Vec<SymKey>,
}

/********** impl inherent *************************************************************************/

impl<T> SymCtx<T> {
    /// Creates a context with a single root scope.
    #[inline]
    pub fn new() -> Self {
        Self { heap: SymHeap::new(), scopes: vec![Scope { owned: Vec::new() }] }
    }

    /// Returns the heap.
    #[inline]
    pub fn heap(&self) -> &SymHeap<T> {
        &self.heap
    }

    /// Returns the heap mutably.
    #[inline]
    pub fn heap_mut(&mut self) -> &mut SymHeap<T> {
        &mut self.heap
    }

    /// Returns the index of the current scope (root = 0).
    #[inline]
    pub fn current_scope(&self) -> usize {
        self.scopes.len() - 1
    }

    /// Pushes a child scope and returns its index.
    #[inline]
    pub fn enter_scope(&mut self) -> usize {
        self.scopes.push(Scope { owned: Vec::new() });
        self.current_scope()
    }

    /// Makes the current scope own `key`, raising its external count.
    pub fn own(&mut self, key: SymKey) {
        if !self.heap.contains(key) {
            return;
        }
        self.heap.inc_external(key);
        let current = self.current_scope();
        self.scopes[current].owned.push(key);
    }

    /// Releases the current scope, dropping the external count of every
    /// owned object; the root scope is released but never popped.
    ///
    /// Returns `false` when called on the root scope.
    pub fn exit_scope(&mut self) -> bool {
        if self.scopes.len() == 1 {
            return false;
        }
        if let Some(scope) = self.scopes.pop() {
            release_scope(&mut self.heap, scope);
        }
        true
    }
}

fn release_scope<T>(heap: &mut SymHeap<T>, scope: Scope) {
    for key in scope.owned {
        heap.dec_external(key);
    }
}

/********** impl Default **************************************************************************/

impl<T> Default for SymCtx<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for SymCtx<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SymCtx")
            .field("objects", &self.heap.len())
            .field("scopes", &self.scopes.len())
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for SymCtx<T> {
    fn drop(&mut self) {
        while let Some(scope) = self.scopes.pop() {
            release_scope(&mut self.heap, scope);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::{SymCtx, SymHeap};

    struct DropCounter(Rc<Cell<usize>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn counter() -> (Rc<Cell<usize>>, impl Fn() -> DropCounter) {
        let drops = Rc::new(Cell::new(0));
        let make = {
            let drops = drops.clone();
            move || DropCounter(drops.clone())
        };
        (drops, make)
    }

    #[test]
    fn object_dies_when_both_counts_reach_zero() {
        let (drops, make) = counter();
        let mut heap = SymHeap::new();
        let obj = heap.insert(make());

        heap.inc_external(obj);
        heap.inc_external(obj);
        assert_eq!(heap.total_rc(obj), 2);

        heap.dec_external(obj);
        assert_eq!(drops.get(), 0);
        heap.dec_external(obj);
        assert_eq!(drops.get(), 1);
        assert!(!heap.contains(obj));

        // stale keys are no-ops everywhere
        heap.dec_external(obj);
        heap.inc_external(obj);
        assert_eq!(heap.total_rc(obj), 0);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn destruction_cascades_through_outgoing_refs() {
        let (drops, make) = counter();
        let mut heap = SymHeap::new();

        // a -> b -> c, only a is rooted
        let c = heap.insert(make());
        let b = heap.insert(make());
        let a = heap.insert(make());
        heap.add_ref(b, c);
        heap.add_ref(a, b);
        heap.inc_external(a);

        heap.dec_external(a);
        assert_eq!(drops.get(), 3);
        assert!(heap.is_empty());
    }

    #[test]
    fn long_chain_releases_iteratively() {
        let (drops, make) = counter();
        let mut heap = SymHeap::new();

        let mut prev = heap.insert(make());
        let head = prev;
        for _ in 0..100_000 {
            let next = heap.insert(make());
            heap.add_ref(prev, next);
            prev = next;
        }

        heap.inc_external(head);
        heap.dec_external(head);
        assert_eq!(drops.get(), 100_001);
    }

    #[test]
    fn cycle_members_become_orphaned_not_destroyed() {
        let (drops, make) = counter();
        let mut heap = SymHeap::new();

        let a = heap.insert(make());
        let b = heap.insert(make());
        heap.add_ref(a, b);
        heap.add_ref(b, a);
        heap.inc_external(a);

        assert!(!heap.is_orphaned(a));
        heap.dec_external(a);

        // the cycle keeps both alive; plain counting can not reclaim it
        assert_eq!(drops.get(), 0);
        assert!(heap.is_orphaned(a));
        assert!(heap.is_orphaned(b));
        assert_eq!(heap.total_rc(a), 1);
        assert_eq!(heap.internal_rc(a), 1);
        assert_eq!(heap.external_rc(a), 0);
    }

    #[test]
    fn scopes_root_objects() {
        let (drops, make) = counter();
        let mut ctx = SymCtx::new();

        let outer = ctx.heap_mut().insert(make());
        ctx.own(outer);

        ctx.enter_scope();
        let inner = ctx.heap_mut().insert(make());
        ctx.own(inner);
        assert_eq!(ctx.heap().external_rc(inner), 1);

        assert!(ctx.exit_scope());
        assert_eq!(drops.get(), 1);
        assert!(!ctx.heap().contains(inner));
        assert!(ctx.heap().contains(outer));

        // the root scope is released on drop
        drop(ctx);
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn root_scope_can_not_be_exited() {
        let mut ctx: SymCtx<()> = SymCtx::new();
        assert_eq!(ctx.current_scope(), 0);
        assert!(!ctx.exit_scope());
        assert_eq!(ctx.current_scope(), 0);
    }

    #[test]
    fn scope_release_orphans_cycles() {
        let (drops, make) = counter();
        let mut ctx = SymCtx::new();

        ctx.enter_scope();
        let a = ctx.heap_mut().insert(make());
        let b = ctx.heap_mut().insert(make());
        ctx.heap_mut().add_ref(a, b);
        ctx.heap_mut().add_ref(b, a);
        ctx.own(a);
        ctx.own(b);

        ctx.exit_scope();
        assert_eq!(drops.get(), 0);
        assert!(ctx.heap().is_orphaned(a));
        assert!(ctx.heap().is_orphaned(b));
    }
}
