//! Shape-directed hybrid memory reclamation for dynamic language runtimes.
//!
//! The crate is the memory-management core of a compiler/runtime for a
//! small functional surface language (pairs, symbols, integers, closures,
//! recursive bindings). It couples a static analysis with a family of
//! dynamic reclamation primitives:
//!
//! - [`shape`] classifies every binding over the lattice
//!   `unknown ⊑ tree ⊑ dag ⊑ cyclic` by a monotone fixpoint over the
//!   [`ast`] the parser hands in.
//! - [`strategy`] maps the proven shape to a reclamation primitive:
//!   tree-shaped values go into bump [`arena`]s (with externally
//!   registered finalizers), dag-shaped values use plain reference
//!   counting, cyclic values are grouped by the [`scc`] registry and their
//!   decrements are batched through the [`deferred`] queue.
//! - [`region`] enforces the scoped-allocation discipline (inner regions
//!   may reference outer ones, never the reverse), [`sym`] detects
//!   orphaned cycles via split external/internal counts, and the
//!   `concurrent` module provides atomically counted objects plus
//!   channels that transfer ownership between threads without touching
//!   any count.
//!
//! All contexts are explicit, single-threaded values unless documented
//! otherwise; the only ambient state is the per-thread integer id used by
//! the concurrent runtime.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

use core::fmt;

use cfg_if::cfg_if;

pub mod arena;
pub mod ast;
pub mod deferred;
pub mod map;
pub mod region;
pub mod scc;
pub mod shape;
pub mod strategy;
pub mod sym;
pub mod weak;

cfg_if! {
    if #[cfg(feature = "std")] {
        pub mod concurrent;
        pub use crate::concurrent::{current_thread_id, Channel, ConcRef, SendError, DETACHED};
    }
}

pub use crate::arena::Arena;
pub use crate::ast::Sexp;
pub use crate::deferred::DeferredQueue;
pub use crate::map::PtrMap;
pub use crate::region::{RegionCtx, RegionError, RegionObjId, RegionRef};
pub use crate::scc::{NodeKey, Scc, SccId, SccRegistry};
pub use crate::shape::{Shape, ShapeCtx};
pub use crate::strategy::ReclaimStrategy;
pub use crate::sym::{SymCtx, SymHeap, SymKey};
pub use crate::weak::{WeakHandle, WeakTable};

#[cfg(test)]
mod tests;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Finalizer
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A type-erased `(pointer, release-fn)` pair.
///
/// Arenas and regions register resources they do not allocate themselves
/// as finalizers and run each exactly once, in LIFO order, when the
/// owning scope dies.
pub struct Finalizer {
    ptr: *mut u8,
    release: unsafe fn(*mut u8),
}

/********** impl inherent *************************************************************************/

impl Finalizer {
    /// Pairs `ptr` with the function releasing it.
    #[inline]
    pub fn new(ptr: *mut u8, release: unsafe fn(*mut u8)) -> Self {
        Self { ptr, release }
    }

    /// Returns the registered pointer.
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Consumes the finalizer and invokes its release function.
    ///
    /// # Safety
    ///
    /// The caller must ensure the registered pointer is still valid and
    /// that the release function has not already run for it.
    #[inline]
    pub unsafe fn run(self) {
        (self.release)(self.ptr)
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Finalizer").field("ptr", &self.ptr).finish()
    }
}
