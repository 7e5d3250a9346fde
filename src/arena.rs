//! A bump allocator for tree-shaped values.
//!
//! Values whose shape analysis proves the absence of sharing are allocated
//! here and never individually counted: dropping the arena reclaims the
//! whole region at once. Resources that live outside the arena's chunks
//! (file handles, boxed externals, counted objects owned by the region) are
//! registered as [`Finalizer`]s and released in reverse registration order
//! before the chunks are freed.

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec, vec::Vec};

use core::cell::RefCell;
use core::cmp;
use core::fmt;
use core::mem;
use core::ptr::NonNull;

use crate::Finalizer;

/// Default chunk size in bytes.
const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Allocation granularity; every returned pointer is aligned to this.
const WORD: usize = mem::size_of::<u64>();

////////////////////////////////////////////////////////////////////////////////////////////////////
// Arena
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A growable bump allocator with externally registered finalizers.
///
/// Allocations are zeroed, word-aligned and valid until the arena is
/// dropped; nothing is ever reclaimed early. On drop, every registered
/// external release function runs exactly once, in reverse registration
/// order, before the chunk memory is freed.
pub struct Arena {
    chunks: RefCell<Vec<Chunk>>,
    chunk_size: usize,
    externals: RefCell<Vec<Finalizer>>,
}

struct Chunk {
    storage: Box<[u64]>,
    /// Bump offset in words.
    used: usize,
}

/********** impl inherent *************************************************************************/

impl Arena {
    /// Creates an arena with the default chunk size.
    #[inline]
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Creates an arena that requests chunks of `chunk_size` bytes.
    ///
    /// Individual allocations larger than `chunk_size` get a dedicated
    /// chunk of their own size.
    #[inline]
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: RefCell::new(Vec::new()),
            chunk_size: cmp::max(chunk_size, WORD),
            externals: RefCell::new(Vec::new()),
        }
    }

    /// Bump-allocates `len` zeroed bytes.
    ///
    /// The returned pointer is aligned to 8 bytes and valid until the arena
    /// is dropped. A zero-sized request yields a dangling, non-null
    /// pointer. Returns `None` only if the rounded size overflows.
    pub fn alloc(&self, len: usize) -> Option<NonNull<u8>> {
        if len == 0 {
            return Some(NonNull::dangling());
        }

        let words = len.checked_add(WORD - 1)? / WORD;
        let mut chunks = self.chunks.borrow_mut();

        let exhausted = match chunks.last() {
            Some(chunk) => chunk.used + words > chunk.storage.len(),
            None => true,
        };

        if exhausted {
            let cap = cmp::max(self.chunk_size / WORD, words);
            chunks.push(Chunk { storage: vec![0u64; cap].into_boxed_slice(), used: 0 });
        }

        let chunk = chunks.last_mut()?;
        let ptr = unsafe { chunk.storage.as_mut_ptr().add(chunk.used) as *mut u8 };
        chunk.used += words;

        NonNull::new(ptr)
    }

    /// Registers an external resource to be released when the arena is
    /// dropped.
    ///
    /// Release functions run in reverse registration order, each exactly
    /// once, before any chunk memory is freed.
    ///
    /// # Safety
    ///
    /// `release` will be invoked with `ptr` during drop; the caller must
    /// ensure the pointee is still valid at that point and that running the
    /// function once is sound.
    #[inline]
    pub unsafe fn register_external(&self, ptr: *mut u8, release: unsafe fn(*mut u8)) {
        self.externals.borrow_mut().push(Finalizer::new(ptr, release));
    }

    /// Returns the number of registered, not yet released externals.
    #[inline]
    pub fn external_count(&self) -> usize {
        self.externals.borrow().len()
    }

    /// Returns the total number of bytes handed out so far.
    pub fn allocated_bytes(&self) -> usize {
        self.chunks.borrow().iter().map(|chunk| chunk.used * WORD).sum()
    }
}

/********** impl Default **************************************************************************/

impl Default for Arena {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Arena")
            .field("chunks", &self.chunks.borrow().len())
            .field("allocated_bytes", &self.allocated_bytes())
            .field("externals", &self.external_count())
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Arena {
    fn drop(&mut self) {
        let externals = mem::take(self.externals.get_mut());
        for finalizer in externals.into_iter().rev() {
            // safety: the registration contract guarantees each release
            // function is sound to run exactly once at arena destruction
            unsafe { finalizer.run() };
        }
    }
}
