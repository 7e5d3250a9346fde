//! Atomically counted records with an owner-thread discipline.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use memoffset::offset_of;

/// Owner id of a record that is buffered in a channel (in transit) or
/// otherwise detached from any thread; such a record may not be mutated by
/// anyone.
pub const DETACHED: i64 = -1;

static NEXT_THREAD_ID: AtomicI64 = AtomicI64::new(0);

std::thread_local! {
    static THREAD_ID: i64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Returns the small integer id of the calling thread.
///
/// Ids are assigned on first use and never reused; they are the only
/// ambient state of the crate.
#[inline]
pub fn current_thread_id() -> i64 {
    THREAD_ID.with(|id| *id)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Header & Record
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Header {
    rc: AtomicUsize,
    owner: AtomicI64,
    immutable: bool,
}

/// The actual heap allocation: header and payload side by side.
struct Record<T> {
    header: Header,
    elem: T,
}

impl<T> Record<T> {
    #[inline]
    fn new(elem: T, owner: i64, immutable: bool) -> Self {
        Self { header: Header { rc: AtomicUsize::new(1), owner: AtomicI64::new(owner), immutable }, elem }
    }

    /// Returns a reference to the header of the record containing `elem`.
    ///
    /// # Safety
    ///
    /// `elem` must point at the `elem` field of a live `Record<T>`.
    #[inline]
    unsafe fn get_header<'a>(elem: NonNull<T>) -> &'a Header {
        let header = (elem.as_ptr() as usize) - Self::offset_elem() + Self::offset_header();
        &*(header as *const Header)
    }

    /// Returns the pointer to the record containing `elem`.
    ///
    /// # Safety
    ///
    /// `elem` must point at the `elem` field of a live `Record<T>`.
    #[inline]
    unsafe fn get_record(elem: NonNull<T>) -> *mut Self {
        ((elem.as_ptr() as usize) - Self::offset_elem()) as *mut Self
    }

    #[inline]
    fn offset_header() -> usize {
        offset_of!(Self, header)
    }

    #[inline]
    fn offset_elem() -> usize {
        offset_of!(Self, elem)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConcRef
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An owning handle to an atomically counted record.
///
/// Cloning increments and dropping decrements the shared count; the record
/// is freed when the count drops from one to zero. Records created as
/// immutable are never counted and never freed (they behave like interned
/// constants).
pub struct ConcRef<T> {
    inner: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for ConcRef<T> {}
unsafe impl<T: Sync> Sync for ConcRef<T> {}

/********** impl inherent *************************************************************************/

impl<T> ConcRef<T> {
    /// Allocates a record with a count of one, owned by the calling
    /// thread.
    #[inline]
    pub fn new(elem: T) -> Self {
        Self::alloc(elem, current_thread_id(), false)
    }

    /// Allocates an immutable record.
    ///
    /// Immutable records skip all count operations: handles to them can be
    /// cloned and dropped freely, and the record itself is deliberately
    /// leaked.
    #[inline]
    pub fn new_immutable(elem: T) -> Self {
        Self::alloc(elem, DETACHED, true)
    }

    fn alloc(elem: T, owner: i64, immutable: bool) -> Self {
        let record = Box::leak(Box::new(Record::new(elem, owner, immutable)));
        Self { inner: NonNull::from(&record.elem), _marker: PhantomData }
    }

    /// Returns the current reference count.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.header().rc.load(Ordering::SeqCst)
    }

    /// Returns the id of the owning thread, or [`DETACHED`] for records in
    /// transit.
    #[inline]
    pub fn owner(&self) -> i64 {
        self.header().owner.load(Ordering::SeqCst)
    }

    /// Returns `true` for records created with
    /// [`new_immutable`][Self::new_immutable].
    #[inline]
    pub fn is_immutable(&self) -> bool {
        self.header().immutable
    }

    /// Returns a mutable reference to the payload, but only for the unique
    /// handle, held on the record's owner thread, of a mutable record.
    ///
    /// Everyone else — immutable records, records in transit, foreign
    /// threads, aliased handles — gets `None`.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let header = self.header();
        if header.immutable
            || header.owner.load(Ordering::SeqCst) != current_thread_id()
            || header.rc.load(Ordering::SeqCst) != 1
        {
            return None;
        }

        // the count is one and we hold the only handle exclusively, so no
        // other thread can observe or clone the record concurrently
        Some(unsafe { &mut *self.inner.as_ptr() })
    }

    /// Consumes the handle without adjusting the count and returns the raw
    /// payload pointer.
    #[inline]
    pub fn into_raw(this: Self) -> *mut T {
        let ptr = this.inner.as_ptr();
        mem::forget(this);
        ptr
    }

    /// Re-creates a handle from [`into_raw`][Self::into_raw] output.
    ///
    /// # Safety
    ///
    /// `raw` must stem from `into_raw` and the count it represents must
    /// not have been claimed by another `from_raw` call in the meantime.
    #[inline]
    pub unsafe fn from_raw(raw: *mut T) -> Self {
        debug_assert!(!raw.is_null());
        Self { inner: NonNull::new_unchecked(raw), _marker: PhantomData }
    }

    /// Stamps a new owner id onto the record.
    #[inline]
    pub(super) fn set_owner(&self, owner: i64) {
        self.header().owner.store(owner, Ordering::SeqCst);
    }

    #[inline]
    fn header(&self) -> &Header {
        // safety: `inner` always points at the elem field of the record
        // this handle keeps alive
        unsafe { Record::get_header(self.inner) }
    }
}

/********** impl Clone ****************************************************************************/

impl<T> Clone for ConcRef<T> {
    #[inline]
    fn clone(&self) -> Self {
        let header = self.header();
        if !header.immutable {
            header.rc.fetch_add(1, Ordering::SeqCst);
        }
        Self { inner: self.inner, _marker: PhantomData }
    }
}

/********** impl Deref ****************************************************************************/

impl<T> Deref for ConcRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // safety: the record is alive for as long as this handle holds its
        // share of the count
        unsafe { self.inner.as_ref() }
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for ConcRef<T> {
    fn drop(&mut self) {
        let header = self.header();
        if header.immutable {
            return;
        }

        if header.rc.fetch_sub(1, Ordering::SeqCst) == 1 {
            // last count: reclaim the whole record
            unsafe {
                drop(Box::from_raw(Record::get_record(self.inner)));
            }
        }
    }
}

/********** impl Debug ****************************************************************************/

impl<T: fmt::Debug> fmt::Debug for ConcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConcRef")
            .field("value", &**self)
            .field("rc", &self.ref_count())
            .field("owner", &self.owner())
            .finish()
    }
}
