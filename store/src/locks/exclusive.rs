//! A lock manager handing out one exclusive lock at a time.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::locks::Lock;
use crate::locks::lock::Releasable;

/// Grants exclusive access to a resource to one holder at a time.
///
/// `exclusive_lock()` blocks while another lock is active. Fairness is not
/// guaranteed: when a lock is released, any blocked caller may acquire the
/// next one regardless of arrival order.
#[derive(Default)]
pub struct ExclusiveLockManager {
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    locked: Mutex<bool>,
    released: Condvar,
}

impl ExclusiveLockManager {
    /// Create a new manager with no lock held.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock, blocking until it is available.
    pub fn exclusive_lock(&self) -> Lock {
        let mut locked = self.state.locked.lock();
        while *locked {
            self.state.released.wait(&mut locked);
        }
        *locked = true;
        drop(locked);

        Lock::new(
            Box::new(Exclusive {
                state: Arc::clone(&self.state),
            }),
            "exclusive lock",
        )
    }
}

impl std::fmt::Debug for ExclusiveLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveLockManager")
            .field("locked", &*self.state.locked.lock())
            .finish()
    }
}

/// Releaser delegating back to the owning manager's state.
struct Exclusive {
    state: Arc<State>,
}

impl Releasable for Exclusive {
    fn release(&self) {
        let mut locked = self.state.locked.lock();
        *locked = false;
        self.state.released.notify_all();
    }
}
