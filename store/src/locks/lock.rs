//! The lock handle shared by all lock managers.

/// Internal hook a lock manager installs into a [`Lock`] so that releasing
/// the handle can delegate back to the manager's state.
pub(crate) trait Releasable: Send {
    /// Release the underlying lock and wake any waiters.
    fn release(&self);
}

/// A handle on an acquired lock.
///
/// A lock has exactly two observable states: active and released. Releasing
/// is idempotent. Callers should release explicitly (ideally by scoping the
/// handle tightly); a `Lock` that is still active when dropped is released
/// by the drop glue as a last resort, with a warning logged, since that
/// usually indicates a leaked lock somewhere up the call chain.
pub struct Lock {
    target: Option<Box<dyn Releasable>>,
    description: &'static str,
}

impl Lock {
    /// Wrap a manager hook in a lock handle.
    ///
    /// `description` names the lock kind in the leak warning.
    pub(crate) fn new(target: Box<dyn Releasable>, description: &'static str) -> Self {
        Self {
            target: Some(target),
            description,
        }
    }

    /// Whether this lock is still held.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.target.is_some()
    }

    /// Release the lock. Releasing an already-released lock is a no-op.
    pub fn release(&mut self) {
        if let Some(target) = self.target.take() {
            target.release();
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.is_active() {
            tracing::warn!(
                "{} was dropped while still active; releasing it now",
                self.description
            );
            self.release();
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("description", &self.description)
            .field("active", &self.is_active())
            .finish()
    }
}
