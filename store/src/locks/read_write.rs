//! A lock manager allowing many concurrent readers or a single writer.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::locks::Lock;
use crate::locks::lock::Releasable;

/// Coordinates concurrent readers with a single writer.
///
/// Any number of read locks may be active simultaneously, but a write lock
/// excludes both readers and other writers. Once a writer has requested its
/// lock, no new read locks are granted; the writer proceeds as soon as the
/// readers that were already active have released. This bounds a writer's
/// wait by the duration of the in-flight reads, but back-to-back write
/// requests are served in arbitrary order, not FIFO.
#[derive(Default)]
pub struct ReadWriteLockManager {
    state: Arc<State>,
}

#[derive(Default)]
struct Counts {
    reading_threads: usize,
    write_requested: bool,
}

#[derive(Default)]
struct State {
    counts: Mutex<Counts>,
    changed: Condvar,
}

impl ReadWriteLockManager {
    /// Create a new manager with no locks held.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a read lock, blocking while a write lock is requested or held.
    pub fn read_lock(&self) -> Lock {
        let mut counts = self.state.counts.lock();
        while counts.write_requested {
            self.state.changed.wait(&mut counts);
        }
        counts.reading_threads += 1;
        drop(counts);

        Lock::new(
            Box::new(Read {
                state: Arc::clone(&self.state),
            }),
            "read lock",
        )
    }

    /// Acquire the write lock.
    ///
    /// Blocks while another write lock is requested or held, then waits for
    /// all active readers to release. New readers cannot start once the
    /// write request is registered.
    pub fn write_lock(&self) -> Lock {
        let mut counts = self.state.counts.lock();
        while counts.write_requested {
            self.state.changed.wait(&mut counts);
        }
        counts.write_requested = true;
        while counts.reading_threads > 0 {
            self.state.changed.wait(&mut counts);
        }
        drop(counts);

        Lock::new(
            Box::new(Write {
                state: Arc::clone(&self.state),
            }),
            "write lock",
        )
    }
}

impl std::fmt::Debug for ReadWriteLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts = self.state.counts.lock();
        f.debug_struct("ReadWriteLockManager")
            .field("reading_threads", &counts.reading_threads)
            .field("write_requested", &counts.write_requested)
            .finish()
    }
}

struct Read {
    state: Arc<State>,
}

impl Releasable for Read {
    fn release(&self) {
        let mut counts = self.state.counts.lock();
        counts.reading_threads -= 1;
        if counts.reading_threads == 0 {
            // A pending writer may now proceed.
            self.state.changed.notify_all();
        }
    }
}

struct Write {
    state: Arc<State>,
}

impl Releasable for Write {
    fn release(&self) {
        let mut counts = self.state.counts.lock();
        counts.write_requested = false;
        self.state.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_concurrent_readers() {
        const READERS: usize = 8;

        let manager = Arc::new(ReadWriteLockManager::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(READERS));

        let mut handles = Vec::new();
        for _ in 0..READERS {
            let manager = Arc::clone(&manager);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let mut lock = manager.read_lock();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                // Wait until every reader holds its lock simultaneously.
                barrier.wait();

                active.fetch_sub(1, Ordering::SeqCst);
                lock.release();
            }));
        }

        for handle in handles {
            handle.join().expect("reader thread panicked");
        }

        assert_eq!(peak.load(Ordering::SeqCst), READERS);
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let manager = Arc::new(ReadWriteLockManager::new());
        let readers_done = Arc::new(AtomicBool::new(false));

        let mut read_lock = manager.read_lock();

        let writer = {
            let manager = Arc::clone(&manager);
            let readers_done = Arc::clone(&readers_done);
            thread::spawn(move || {
                let mut lock = manager.write_lock();
                assert!(
                    readers_done.load(Ordering::SeqCst),
                    "write lock granted while a read lock was active"
                );
                lock.release();
            })
        };

        thread::sleep(Duration::from_millis(50));
        readers_done.store(true, Ordering::SeqCst);
        read_lock.release();

        writer.join().expect("writer thread panicked");
    }

    #[test]
    fn test_no_new_readers_while_writer_active() {
        let manager = Arc::new(ReadWriteLockManager::new());
        let writer_released = Arc::new(AtomicBool::new(false));

        let mut write_lock = manager.write_lock();

        let reader = {
            let manager = Arc::clone(&manager);
            let writer_released = Arc::clone(&writer_released);
            thread::spawn(move || {
                let lock = manager.read_lock();
                assert!(
                    writer_released.load(Ordering::SeqCst),
                    "read lock granted while the write lock was active"
                );
                drop(lock);
            })
        };

        thread::sleep(Duration::from_millis(50));
        writer_released.store(true, Ordering::SeqCst);
        write_lock.release();

        reader.join().expect("reader thread panicked");
    }

    #[test]
    fn test_writers_are_mutually_exclusive() {
        let manager = Arc::new(ReadWriteLockManager::new());
        let held = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            let held = Arc::clone(&held);
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    let mut lock = manager.write_lock();
                    assert!(
                        !held.swap(true, Ordering::SeqCst),
                        "two write locks were active at once"
                    );
                    held.store(false, Ordering::SeqCst);
                    lock.release();
                }
            }));
        }

        for handle in handles {
            handle.join().expect("writer thread panicked");
        }
    }
}
