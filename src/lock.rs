//! Locks guarding the process-wide runtime slot and a runtime's shared state.
//!
//! Both are spin locks: they never allocate and never park, so they can be
//! taken on the failure path even when it is entered from a signal handler.

use core::{
    cell::Cell,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

use triomphe::Arc;

use crate::Forensics;

/// The slot holding the runtime installed by [`initialize`](crate::initialize).
#[repr(transparent)]
pub(crate) struct RuntimeLock(spin::RwLock<Option<Arc<Forensics>>>);

impl RuntimeLock {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self(spin::RwLock::new(None))
    }

    #[inline]
    pub(crate) fn get(&'static self) -> Option<Arc<Forensics>> {
        self.0.read().clone()
    }

    /// Like [`get`](Self::get), but gives up instead of waiting on a writer.
    #[inline]
    pub(crate) fn try_get(&'static self) -> Option<Arc<Forensics>> {
        self.0.try_read().and_then(|guard| guard.clone())
    }

    /// Installs `runtime`, handing it back if the slot is already taken.
    pub(crate) fn install(&'static self, runtime: Arc<Forensics>) -> Result<(), Arc<Forensics>> {
        let mut guard = self.0.write();
        if guard.is_some() {
            return Err(runtime);
        }
        *guard = Some(runtime);
        Ok(())
    }

    pub(crate) fn take(&'static self) -> Option<Arc<Forensics>> {
        self.0.write().take()
    }
}

/// Token value meaning "no owner".
const NO_OWNER: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(NO_OWNER) };
}

/// Returns a process-unique, never-zero token for the calling thread.
pub(crate) fn thread_token() -> u64 {
    THREAD_TOKEN
        .try_with(|token| match token.get() {
            NO_OWNER => {
                let fresh = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
                token.set(fresh);
                fresh
            }
            current => current,
        })
        .unwrap_or_else(|_| NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed))
}

/// A mutex that refuses, instead of deadlocking, when the thread already
/// holding it asks for it again.
///
/// Ownership is claimed by swapping the caller's token into `owner` before
/// `inner` is taken, and given up only after `inner` is released. A thread
/// interrupted anywhere between the two, including by a signal, sees its own
/// token and is refused.
pub(crate) struct ReportLock<T> {
    inner: spin::Mutex<T>,
    owner: AtomicU64,
}

pub(crate) struct ReportGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    owner: &'a AtomicU64,
}

impl<T> ReportLock<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    /// Acquires the lock, or returns `None` if the calling thread already
    /// holds it.
    pub(crate) fn lock(&self) -> Option<ReportGuard<'_, T>> {
        let token = thread_token();
        loop {
            match self.owner.compare_exchange_weak(
                NO_OWNER,
                token,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) if current == token => return None,
                Err(_) => core::hint::spin_loop(),
            }
        }
        // only the owner gets here, so this never waits
        let guard = ManuallyDrop::new(self.inner.lock());
        Some(ReportGuard {
            guard,
            owner: &self.owner,
        })
    }

    #[cfg(test)]
    fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }
}

impl<T> Deref for ReportGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ReportGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ReportGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once and never touched again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.owner.store(NO_OWNER, Ordering::Release);
    }
}
