//! Bounded MPMC channels that transfer ownership.
//!
//! A channel never adjusts reference counts: a successful send *moves* the
//! sender's handle into the ring buffer and a receive moves it back out,
//! so the count a record had before the transfer is exactly the count it
//! has afterwards. While buffered, a record belongs to no thread (owner
//! [`DETACHED`]); the receiver stamps its own id on arrival.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use super::object::{current_thread_id, ConcRef, DETACHED};

////////////////////////////////////////////////////////////////////////////////////////////////////
// SendError
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Returned by [`Channel::send`] on a closed channel, handing the
/// undelivered handle back to the sender.
pub struct SendError<T>(pub ConcRef<T>);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("send on a closed channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A bounded multi-producer/multi-consumer channel of [`ConcRef`] handles.
///
/// Senders block while the buffer is full, receivers while it is empty;
/// both are woken by [`close`][Channel::close], after which sends fail and
/// receives drain the remaining buffer before returning `None`. Delivery
/// is FIFO, and the mutex orders the sender's writes before the receiver's
/// reads.
pub struct Channel<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    closed: AtomicBool,
    len: AtomicUsize,
    capacity: usize,
}

struct Ring<T> {
    buf: Box<[Option<ConcRef<T>>]>,
    head: usize,
    len: usize,
}

/********** impl inherent *************************************************************************/

impl<T> Channel<T> {
    /// Creates a channel buffering at most `capacity` handles (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                buf: (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice(),
                head: 0,
                len: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            closed: AtomicBool::new(false),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Returns the buffer capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of currently buffered handles (lock-free).
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    /// Returns `true` if no handles are buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the channel has been closed (lock-free).
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends `obj`, blocking while the buffer is full.
    ///
    /// On success the handle — count untouched — now lives in the buffer
    /// with its owner set to [`DETACHED`]; the sender keeps nothing and
    /// must not decrement anything. On a closed channel the handle is
    /// returned inside the error instead.
    pub fn send(&self, obj: ConcRef<T>) -> Result<(), SendError<T>> {
        if self.is_closed() {
            return Err(SendError(obj));
        }

        let mut ring = self.lock();
        while ring.len == self.capacity && !self.is_closed() {
            ring = self.wait(&self.not_full, ring);
        }
        if self.is_closed() {
            return Err(SendError(obj));
        }

        obj.set_owner(DETACHED);
        let slot = (ring.head + ring.len) % self.capacity;
        ring.buf[slot] = Some(obj);
        ring.len += 1;
        self.len.store(ring.len, Ordering::SeqCst);
        drop(ring);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Receives the oldest buffered handle, blocking while the buffer is
    /// empty.
    ///
    /// The returned handle is the very reference the sender gave up; its
    /// owner is stamped with the receiving thread's id. Once the channel
    /// is closed and drained, `None` is returned.
    pub fn recv(&self) -> Option<ConcRef<T>> {
        let mut ring = self.lock();
        loop {
            if ring.len > 0 {
                break;
            }
            if self.is_closed() {
                return None;
            }
            ring = self.wait(&self.not_empty, ring);
        }

        let head = ring.head;
        let obj = ring.buf[head].take();
        ring.head = (ring.head + 1) % self.capacity;
        ring.len -= 1;
        self.len.store(ring.len, Ordering::SeqCst);
        drop(ring);

        self.not_full.notify_one();

        let obj = obj?;
        obj.set_owner(current_thread_id());
        Some(obj)
    }

    /// Closes the channel and wakes every blocked sender and receiver.
    ///
    /// Subsequent sends fail; receivers drain the buffer and then observe
    /// the end of the stream.
    pub fn close(&self) {
        // flip the flag under the lock so no waiter can check-then-sleep
        // around it
        let ring = self.lock();
        self.closed.store(true, Ordering::SeqCst);
        drop(ring);

        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[inline]
    fn wait<'a>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, Ring<T>>,
    ) -> MutexGuard<'a, Ring<T>> {
        match condvar.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::super::object::{current_thread_id, ConcRef, DETACHED};
    use super::Channel;

    #[test]
    fn transfer_preserves_the_count() {
        let channel = Channel::with_capacity(10);
        let obj = ConcRef::new(7);
        assert_eq!(obj.ref_count(), 1);

        channel.send(obj).unwrap();
        assert_eq!(channel.len(), 1);

        let obj = channel.recv().unwrap();
        assert_eq!(obj.ref_count(), 1);
        assert_eq!(*obj, 7);
    }

    #[test]
    fn ownership_is_detached_while_buffered() {
        let channel = Channel::with_capacity(1);
        let obj = ConcRef::new(1);
        let probe = obj.clone();
        assert_eq!(probe.owner(), current_thread_id());

        channel.send(obj).unwrap();
        assert_eq!(probe.owner(), DETACHED);

        let received = channel.recv().unwrap();
        assert_eq!(received.owner(), current_thread_id());
    }

    #[test]
    fn delivery_is_fifo() {
        let channel = Channel::with_capacity(8);
        for i in 0..8 {
            channel.send(ConcRef::new(i)).unwrap();
        }
        for i in 0..8 {
            assert_eq!(*channel.recv().unwrap(), i);
        }
    }

    #[test]
    fn closed_send_returns_the_handle() {
        let channel = Channel::with_capacity(4);
        channel.close();

        let err = channel.send(ConcRef::new(9)).unwrap_err();
        assert_eq!(*err.0, 9);
        assert_eq!(err.0.ref_count(), 1);
    }

    #[test]
    fn receivers_drain_a_closed_channel() {
        let channel = Channel::with_capacity(4);
        channel.send(ConcRef::new(1)).unwrap();
        channel.send(ConcRef::new(2)).unwrap();
        channel.close();

        assert_eq!(*channel.recv().unwrap(), 1);
        assert_eq!(*channel.recv().unwrap(), 2);
        assert!(channel.recv().is_none());
    }

    #[test]
    fn close_wakes_blocked_receivers() {
        let channel: Arc<Channel<i64>> = Arc::new(Channel::with_capacity(1));
        let receiver = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.recv())
        };

        channel.close();
        assert!(receiver.join().unwrap().is_none());
    }

    #[test]
    fn blocking_send_resumes_after_recv() {
        let channel = Arc::new(Channel::with_capacity(1));
        channel.send(ConcRef::new(0)).unwrap();

        let sender = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.send(ConcRef::new(1)))
        };

        assert_eq!(*channel.recv().unwrap(), 0);
        sender.join().unwrap().unwrap();
        assert_eq!(*channel.recv().unwrap(), 1);
    }

    #[test]
    fn cross_thread_pipeline_keeps_counts_balanced() {
        let channel = Arc::new(Channel::with_capacity(4));
        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                for i in 0..100i64 {
                    channel.send(ConcRef::new(i)).unwrap();
                }
                channel.close();
            })
        };

        let mut sum = 0i64;
        while let Some(obj) = channel.recv() {
            assert_eq!(obj.ref_count(), 1);
            assert_eq!(obj.owner(), current_thread_id());
            sum += *obj;
        }
        producer.join().unwrap();
        assert_eq!(sum, (0..100i64).sum::<i64>());
    }
}
