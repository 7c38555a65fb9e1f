//! Blocking lock primitives coordinating store access.
//!
//! The B-tree and the indexes built on it perform no internal logical
//! synchronization; callers serialize structural mutation and exclude
//! readers from writers using the managers in this module. Two managers are
//! provided:
//!
//! - [`ExclusiveLockManager`]: at most one holder at a time
//! - [`ReadWriteLockManager`]: many concurrent readers or one writer
//!
//! Both hand out [`Lock`] values that release on [`Lock::release`] or, as a
//! safety net, on drop (with a logged warning). Neither manager guarantees
//! FIFO fairness: after a release, any waiter may win the race.
//!
//! Lock acquisition blocks the calling OS thread. There is no timeout or
//! cancellation; a caller that needs bounded waits must arrange them
//! externally.

mod exclusive;
mod lock;
mod read_write;

pub use exclusive::ExclusiveLockManager;
pub use lock::Lock;
pub use read_write::ReadWriteLockManager;
