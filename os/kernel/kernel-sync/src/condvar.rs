use crate::{SpinLock, SpinLockGuard};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// Condition variable paired with a [`SpinLock`].
///
/// Waiters snapshot a wake-up sequence number while still holding the lock,
/// release it, and spin until a notifier bumps the sequence. State changes
/// happen under the lock before [`Condvar::notify_all`], so a waiter either
/// sees the new state on its check or sees the bumped sequence afterwards.
///
/// ```
/// use kernel_sync::{Condvar, SpinLock};
///
/// let state = SpinLock::new(true);
/// let cv = Condvar::new();
/// let guard = cv.wait_while(state.lock(), |busy| {
///     // nobody else is around in this example, so clear it ourselves
///     *busy = false;
///     *busy
/// });
/// assert!(!*guard);
/// ```
pub struct Condvar {
    sequence: AtomicU32,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
        }
    }

    /// Release `guard`, wait for a notification, and re-acquire the lock.
    ///
    /// Spurious wake-ups are possible; callers re-check their predicate.
    pub fn wait<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let observed = self.sequence.load(Ordering::Acquire);
        let lock: &'a SpinLock<T> = SpinLockGuard::lock_ref(&guard);
        drop(guard);

        while self.sequence.load(Ordering::Acquire) == observed {
            spin_loop();
        }

        lock.lock()
    }

    /// Wait as long as `condition` holds.
    pub fn wait_while<'a, T>(
        &self,
        mut guard: SpinLockGuard<'a, T>,
        mut condition: impl FnMut(&mut T) -> bool,
    ) -> SpinLockGuard<'a, T> {
        while condition(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
    }
}
