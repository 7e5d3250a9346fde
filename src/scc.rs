//! Strongly-connected-component collection for cyclic values.
//!
//! Cyclic ownership can not be expressed with per-object counts: every
//! member of a cycle keeps every other alive. The registry instead groups
//! mutually reachable objects into SCCs sharing a single group ref-count;
//! when it drops to zero the whole group is finalized together.
//!
//! The object graph lives in a versioned-key slab and edges are keys, not
//! pointers, so operations on already collected nodes degrade to no-ops
//! instead of touching freed memory. Graph traversal is strictly
//! iterative: a cycle of two nodes would overflow any recursive walk.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use slotmap::{new_key_type, SecondaryMap, SlotMap};

new_key_type! {
    /// Key of an object in an [`SccRegistry`]'s node store.
    pub struct NodeKey;
}

/// Identifier of a discovered SCC group.
pub type SccId = u32;

////////////////////////////////////////////////////////////////////////////////////////////////////
// SccRegistry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A registry of pair-shaped objects and the SCC groups discovered over
/// them.
///
/// Mutation of the graph invalidates previous discoveries: a new
/// [`compute`][SccRegistry::compute] pass resets the `scc_id` of every
/// reachable node (detaching it from its stale group) before assigning
/// fresh groups, so cycles created after the last pass are found
/// correctly.
pub struct SccRegistry<T> {
    nodes: SlotMap<NodeKey, Node<T>>,
    groups: Vec<Scc>,
    next_id: SccId,
}

struct Node<T> {
    a: Option<NodeKey>,
    b: Option<NodeKey>,
    scc: Option<SccId>,
    payload: T,
}

/// An SCC group: its members and their shared reference count.
pub struct Scc {
    id: SccId,
    members: Vec<NodeKey>,
    ref_count: AtomicUsize,
}

impl Scc {
    /// Returns the group id.
    #[inline]
    pub fn id(&self) -> SccId {
        self.id
    }

    /// Returns the member keys in the order they were added.
    #[inline]
    pub fn members(&self) -> &[NodeKey] {
        &self.members
    }

    /// Returns the current group reference count.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }
}

/********** impl inherent *************************************************************************/

impl<T> SccRegistry<T> {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self { nodes: SlotMap::with_key(), groups: Vec::new(), next_id: 0 }
    }

    /// Inserts a new leaf object and returns its key.
    #[inline]
    pub fn insert(&mut self, payload: T) -> NodeKey {
        self.nodes.insert(Node { a: None, b: None, scc: None, payload })
    }

    /// Sets both child edges of `key`; a stale key is a no-op.
    pub fn set_children(&mut self, key: NodeKey, a: Option<NodeKey>, b: Option<NodeKey>) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.a = a;
            node.b = b;
        }
    }

    /// Returns the child edges of `key`.
    #[inline]
    pub fn children(&self, key: NodeKey) -> (Option<NodeKey>, Option<NodeKey>) {
        match self.nodes.get(key) {
            Some(node) => (node.a, node.b),
            None => (None, None),
        }
    }

    /// Returns a reference to the payload of `key`.
    #[inline]
    pub fn get(&self, key: NodeKey) -> Option<&T> {
        self.nodes.get(key).map(|node| &node.payload)
    }

    /// Returns a mutable reference to the payload of `key`.
    #[inline]
    pub fn get_mut(&mut self, key: NodeKey) -> Option<&mut T> {
        self.nodes.get_mut(key).map(|node| &mut node.payload)
    }

    /// Returns `true` if `key` refers to a live node.
    #[inline]
    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Returns the number of live nodes.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the group currently assigned to `key`, if any.
    #[inline]
    pub fn scc_of(&self, key: NodeKey) -> Option<SccId> {
        self.nodes.get(key).and_then(|node| node.scc)
    }

    /// Returns the number of live groups.
    #[inline]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Creates a fresh, empty group with a reference count of one.
    pub fn create_scc(&mut self) -> SccId {
        let id = self.next_id;
        self.next_id += 1;
        self.groups.push(Scc { id, members: Vec::new(), ref_count: AtomicUsize::new(1) });
        id
    }

    /// Appends `key` to the members of `id` and records the assignment on
    /// the node. Stale keys and unknown groups are no-ops.
    pub fn add_to_scc(&mut self, id: SccId, key: NodeKey) {
        if !self.nodes.contains_key(key) {
            return;
        }
        if let Some(group) = self.groups.iter_mut().find(|group| group.id == id) {
            group.members.push(key);
            if let Some(node) = self.nodes.get_mut(key) {
                node.scc = Some(id);
            }
        }
    }

    /// Looks up a group by id, scanning the registry list.
    #[inline]
    pub fn find(&self, id: SccId) -> Option<&Scc> {
        self.groups.iter().find(|group| group.id == id)
    }

    /// Increments the reference count of group `id`.
    ///
    /// Incrementing is always safe; a missing group is a no-op.
    pub fn inc(&self, id: SccId) {
        if let Some(group) = self.find(id) {
            group.ref_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Decrements the reference count of group `id`, finalizing every
    /// member together when it reaches zero.
    ///
    /// The fetch-sub/old-equals-one protocol guarantees exactly one caller
    /// performs the finalization.
    pub fn release(&mut self, id: SccId) {
        let idx = match self.groups.iter().position(|group| group.id == id) {
            Some(idx) => idx,
            None => return,
        };

        let old = self.groups[idx].ref_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old > 0, "released an SCC group with zero references");
        if old != 1 {
            return;
        }

        let group = self.groups.swap_remove(idx);
        for member in group.members {
            // only nodes still assigned to this group die with it; members
            // reassigned by a later compute pass belong to their new group
            if self.nodes.get(member).map(|node| node.scc) == Some(Some(id)) {
                self.nodes.remove(member);
            }
        }
    }

    /// Repurposes a pair cell as a leaf, releasing its outbound edges
    /// first.
    ///
    /// `on_child` is invoked for every (live) child the cell owned before
    /// the payload is replaced, so the caller can decrement or defer the
    /// release of those children; skipping this step would leak them.
    /// Returns the previous payload, or `None` for a stale key.
    pub fn reuse_as_leaf(
        &mut self,
        key: NodeKey,
        payload: T,
        mut on_child: impl FnMut(NodeKey),
    ) -> Option<T> {
        let (a, b) = match self.nodes.get_mut(key) {
            Some(node) => (node.a.take(), node.b.take()),
            None => return None,
        };

        for child in a.into_iter().chain(b) {
            if self.nodes.contains_key(child) {
                on_child(child);
            }
        }

        self.nodes.get_mut(key).map(|node| core::mem::replace(&mut node.payload, payload))
    }

    /// Recomputes the SCCs of every object reachable from `root` and
    /// returns the new group ids in discovery order.
    ///
    /// Reachable nodes are first detached from their previous groups; each
    /// discovered group starts with a reference count of one. A stale root
    /// yields an empty list.
    pub fn compute(&mut self, root: NodeKey) -> Vec<SccId> {
        if !self.nodes.contains_key(root) {
            return Vec::new();
        }

        // pass 1: reset stale assignments of every reachable node
        let mut seen: SecondaryMap<NodeKey, ()> = SecondaryMap::new();
        let mut work = vec![root];
        while let Some(key) = work.pop() {
            if seen.contains_key(key) || !self.nodes.contains_key(key) {
                continue;
            }
            seen.insert(key, ());
            self.detach(key);

            let (a, b) = self.children(key);
            work.extend(a.into_iter().chain(b));
        }

        // pass 2: iterative Tarjan
        self.tarjan(root)
    }

    /// Removes `key` from its previously assigned group, if any.
    fn detach(&mut self, key: NodeKey) {
        let old = match self.nodes.get_mut(key) {
            Some(node) => node.scc.take(),
            None => None,
        };
        if let Some(old) = old {
            if let Some(group) = self.groups.iter_mut().find(|group| group.id == old) {
                group.members.retain(|&member| member != key);
            }
        }
    }

    fn tarjan(&mut self, root: NodeKey) -> Vec<SccId> {
        struct Visit {
            index: u32,
            lowlink: u32,
            on_stack: bool,
        }

        let mut states: SecondaryMap<NodeKey, Visit> = SecondaryMap::new();
        let mut next_index = 0u32;
        let mut stack: Vec<NodeKey> = Vec::new();
        let mut frames: Vec<(NodeKey, u8)> = Vec::new();
        let mut result = Vec::new();

        states.insert(root, Visit { index: 0, lowlink: 0, on_stack: true });
        next_index += 1;
        stack.push(root);
        frames.push((root, 0));

        while let Some(frame) = frames.last_mut() {
            let node = frame.0;

            if frame.1 < 2 {
                let which = frame.1;
                frame.1 += 1;

                let (a, b) = self.children(node);
                let child = if which == 0 { a } else { b };
                let child = match child.filter(|&key| self.nodes.contains_key(key)) {
                    Some(child) => child,
                    None => continue,
                };

                match states.get(child) {
                    Some(visit) if visit.on_stack => {
                        let child_index = visit.index;
                        if let Some(visit) = states.get_mut(node) {
                            if child_index < visit.lowlink {
                                visit.lowlink = child_index;
                            }
                        }
                    }
                    // a cross edge into an already emitted SCC contributes
                    // nothing to the lowlink
                    Some(_) => {}
                    None => {
                        states.insert(
                            child,
                            Visit { index: next_index, lowlink: next_index, on_stack: true },
                        );
                        next_index += 1;
                        stack.push(child);
                        frames.push((child, 0));
                    }
                }
            } else {
                frames.pop();

                let (index, lowlink) = match states.get(node) {
                    Some(visit) => (visit.index, visit.lowlink),
                    None => continue,
                };

                if let Some(&(parent, _)) = frames.last() {
                    if let Some(visit) = states.get_mut(parent) {
                        if lowlink < visit.lowlink {
                            visit.lowlink = lowlink;
                        }
                    }
                }

                if lowlink == index {
                    // node is the root of an SCC: pop the component
                    let id = self.create_scc();
                    while let Some(member) = stack.pop() {
                        if let Some(visit) = states.get_mut(member) {
                            visit.on_stack = false;
                        }
                        self.add_to_scc(id, member);
                        if member == node {
                            break;
                        }
                    }
                    result.push(id);
                }
            }
        }

        result
    }
}

/********** impl Default **************************************************************************/

impl<T> Default for SccRegistry<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for SccRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SccRegistry")
            .field("nodes", &self.nodes.len())
            .field("groups", &self.groups.len())
            .finish()
    }
}
