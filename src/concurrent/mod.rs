//! Concurrent objects and ownership-transferring channels.
//!
//! Objects shared between threads are allocated as intrusive records: an
//! atomically counted header prepended to the payload. The owning handle,
//! [`ConcRef`], increments on clone and decrements on drop, freeing the
//! record when the last count dies. Channels move handles between threads
//! without touching the count at all: a successful send surrenders the
//! sender's handle into the ring buffer and a receive hands that same
//! handle out again.

mod channel;
mod object;

pub use self::channel::{Channel, SendError};
pub use self::object::{current_thread_id, ConcRef, DETACHED};
