// Short-term locks and the sleep channel.
//
// SpinLock is the "never held across a wait" tier of the lock order:
// bucket lists, the log state, the inode table. Condvar pairs with it
// to provide the atomic release-and-park the long-term code paths need:
// wait() gives the guard back to the caller re-acquired.
//
// Poisoning is swallowed on purpose. A panic anywhere in this crate is a
// fatal invariant violation, not a state other threads should limp past.

use std::ops::{Deref, DerefMut};
use std::sync;

pub struct SpinLock<T> {
    inner: sync::Mutex<T>,
    name: &'static str,
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    inner: Option<sync::MutexGuard<'a, T>>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            inner: sync::Mutex::new(data),
            name,
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        SpinLockGuard {
            lock: self,
            inner: Some(inner),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Release `guard`, returning the lock it came from so the caller can
    /// re-acquire later.
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        guard.lock
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().unwrap()
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().unwrap()
    }
}

pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    /// Atomically release the spinlock and park until notified; the lock
    /// is held again on return.
    pub fn wait<'a, T>(&self, mut guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let inner = guard.inner.take().unwrap();
        let inner = match self.inner.wait(inner) {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.inner = Some(inner);
        guard
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
