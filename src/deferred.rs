//! Batched, coalesced deferral of reference-count decrements.
//!
//! Decrementing a cyclic value eagerly can trigger a cascading release
//! storm in the middle of a mutator operation. Instead, decrements are
//! parked here and applied in bounded batches. Deferring the same object
//! repeatedly coalesces onto a single queue entry whose count tracks how
//! many real decrements are still outstanding, so the queue length stays
//! proportional to the number of *distinct* objects.

#[cfg(not(feature = "std"))]
use alloc::collections::VecDeque;
#[cfg(feature = "std")]
use std::collections::VecDeque;

use core::fmt;

use crate::map::PtrMap;

/// Default number of distinct pending entries that triggers processing.
const DEFAULT_BATCH_SIZE: usize = 32;

////////////////////////////////////////////////////////////////////////////////////////////////////
// DeferredQueue
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A FIFO queue of coalesced pending decrements.
///
/// Entries keep their arrival order; an entry that still has outstanding
/// decrements after a processing step is reinserted at the tail, so every
/// object makes progress and a single [`flush`][DeferredQueue::flush]
/// drains the queue completely no matter how heavily entries were
/// coalesced.
pub struct DeferredQueue<T> {
    /// Distinct objects in processing order.
    order: VecDeque<*const T>,
    /// Outstanding decrements per object.
    entries: PtrMap<usize>,
    batch_size: usize,
    total_deferred: u64,
}

/********** impl inherent *************************************************************************/

impl<T> DeferredQueue<T> {
    /// Creates a queue with the default batch size (32).
    #[inline]
    pub fn new() -> Self {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    /// Creates a queue that reports [`should_process`][Self::should_process]
    /// once `batch_size` distinct entries are pending.
    #[inline]
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: PtrMap::new(),
            batch_size: batch_size.max(1),
            total_deferred: 0,
        }
    }

    /// Parks one decrement of `obj`.
    ///
    /// A null pointer is ignored. Deferring an already pending object
    /// increments its entry's count instead of queueing it twice.
    pub fn defer(&mut self, obj: *const T) {
        if obj.is_null() {
            return;
        }

        let key = obj as *const ();
        match self.entries.get_mut(key) {
            Some(count) => *count += 1,
            None => {
                self.entries.insert(key, 1);
                self.order.push_back(obj);
            }
        }
        self.total_deferred += 1;
    }

    /// Applies up to `k` real decrements via `apply`, in queue order.
    ///
    /// Each step pops the head entry, applies one decrement and reinserts
    /// the entry at the tail if it still has outstanding decrements.
    /// Returns the number of decrements applied.
    pub fn process(&mut self, k: usize, mut apply: impl FnMut(*const T)) -> usize {
        let mut applied = 0;

        while applied < k {
            let obj = match self.order.pop_front() {
                Some(obj) => obj,
                None => break,
            };
            let key = obj as *const ();

            let outstanding = match self.entries.get_mut(key) {
                Some(count) => {
                    debug_assert!(*count > 0, "pending entry with zero count");
                    *count -= 1;
                    *count
                }
                None => continue,
            };

            apply(obj);
            applied += 1;

            if outstanding > 0 {
                self.order.push_back(obj);
            } else {
                self.entries.remove(key);
            }
        }

        applied
    }

    /// Applies every outstanding decrement, returning how many were
    /// applied.
    ///
    /// Every processing step strictly decreases the outstanding total, so
    /// one flush always drains the queue.
    pub fn flush(&mut self, mut apply: impl FnMut(*const T)) -> usize {
        let mut applied = 0;
        while !self.order.is_empty() {
            applied += self.process(self.batch_size, &mut apply);
        }
        applied
    }

    /// Returns `true` once at least `batch_size` distinct entries are
    /// pending.
    #[inline]
    pub fn should_process(&self) -> bool {
        self.pending_count() >= self.batch_size
    }

    /// Returns the number of distinct pending entries.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the total number of decrements ever deferred, including
    /// coalesced ones.
    #[inline]
    pub fn total_deferred(&self) -> u64 {
        self.total_deferred
    }

    /// Returns the configured batch size.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns `true` if no decrements are outstanding.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/********** impl Default **************************************************************************/

impl<T> Default for DeferredQueue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for DeferredQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("pending", &self.pending_count())
            .field("batch_size", &self.batch_size)
            .field("total_deferred", &self.total_deferred)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::DeferredQueue;

    #[test]
    fn defer_coalesces_repeated_objects() {
        let mut queue = DeferredQueue::new();
        let obj = &0u32 as *const u32;

        for _ in 0..100 {
            queue.defer(obj);
        }

        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.total_deferred(), 100);
    }

    #[test]
    fn null_defer_is_a_no_op() {
        let mut queue: DeferredQueue<u32> = DeferredQueue::new();
        queue.defer(std::ptr::null());
        assert!(queue.is_empty());
        assert_eq!(queue.total_deferred(), 0);
    }

    #[test]
    fn process_reinserts_partial_entries_at_tail() {
        let mut queue = DeferredQueue::new();
        let a = &1u32 as *const u32;
        let b = &2u32 as *const u32;

        queue.defer(a);
        queue.defer(a);
        queue.defer(b);

        let mut log = Vec::new();
        queue.process(1, |obj| log.push(obj as usize));
        // a still has one decrement outstanding and moved behind b
        assert_eq!(queue.pending_count(), 2);

        queue.process(2, |obj| log.push(obj as usize));
        assert_eq!(log, vec![a as usize, b as usize, a as usize]);
        assert!(queue.is_empty());
    }

    #[test]
    fn single_flush_drains_coalesced_entries() {
        let mut queue = DeferredQueue::with_batch_size(8);
        let obj = &7u32 as *const u32;

        for _ in 0..100 {
            queue.defer(obj);
        }

        let mut applied = 0;
        let drained = queue.flush(|_| applied += 1);

        assert_eq!(drained, 100);
        assert_eq!(applied, 100);
        assert_eq!(queue.pending_count(), 0);

        // a second flush has nothing left to do
        assert_eq!(queue.flush(|_| applied += 1), 0);
        assert_eq!(applied, 100);
    }

    #[test]
    fn should_process_tracks_distinct_entries() {
        let values: Vec<u32> = (0..4).collect();
        let mut queue = DeferredQueue::with_batch_size(4);

        for value in &values[..3] {
            queue.defer(value as *const u32);
        }
        // coalesced defers never push the queue over the batch threshold
        queue.defer(&values[0] as *const u32);
        assert!(!queue.should_process());

        queue.defer(&values[3] as *const u32);
        assert!(queue.should_process());
    }
}
