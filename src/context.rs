//! Per-thread context stacks.
//!
//! Every thread gets its own stack of context names per runtime, created on
//! the thread's first [`begin`](ContextRegistry::begin). The stack is owned
//! jointly by a thread-local entry and by the runtime's [`ContextRegistry`]:
//!
//! - when the thread exits first, the thread-local destructor removes the
//!   stack from the registry, which frees it;
//! - when the runtime shuts down first, the registry releases the memory of
//!   every stack still registered and marks itself closed. The thread-local
//!   entries left behind are empty and are pruned on the thread's next use.
//!
//! Only the owning thread pushes and pops its stack. The per-stack mutex is
//! there so that shutdown, running on another thread, can release it.

use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    thread::ThreadId,
};

use forensics_internals::{FixedBuf, SharedAllocator};
use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use triomphe::Arc;

/// A bounded LIFO stack of context names owned by one thread.
pub(crate) struct ContextStack {
    frames: spin::Mutex<ContextFrames>,
}

struct ContextFrames {
    names: FixedBuf<&'static str>,
    depth: usize,
    /// Pushes that did not fit and are still waiting for their pop.
    overflow: usize,
}

/// What a push did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Push {
    Pushed,
    /// The stack was full; carries the overflow count after the push.
    Overflowed(usize),
}

impl ContextStack {
    fn new(names: FixedBuf<&'static str>) -> Self {
        Self {
            frames: spin::Mutex::new(ContextFrames {
                names,
                depth: 0,
                overflow: 0,
            }),
        }
    }

    pub(crate) fn push(&self, name: &'static str) -> Push {
        let mut frames = self.frames.lock();
        if frames.depth < frames.names.capacity() {
            let depth = frames.depth;
            frames.names[depth] = name;
            frames.depth += 1;
            Push::Pushed
        } else {
            frames.overflow += 1;
            Push::Overflowed(frames.overflow)
        }
    }

    /// Pops the newest frame, returning `false` if there was nothing to pop.
    pub(crate) fn pop(&self) -> bool {
        let mut frames = self.frames.lock();
        if frames.overflow > 0 {
            frames.overflow -= 1;
            true
        } else if frames.depth > 0 {
            frames.depth -= 1;
            let depth = frames.depth;
            frames.names[depth] = "";
            true
        } else {
            false
        }
    }

    /// Copies the live frames, outermost first, into `out`.
    ///
    /// Copies nothing if the stack is locked, which only happens when the
    /// calling thread was interrupted inside a push or pop, or while the
    /// runtime shuts down.
    pub(crate) fn copy_into(&self, out: &mut [&'static str]) -> usize {
        let Some(frames) = self.frames.try_lock() else {
            return 0;
        };
        let count = frames.depth.min(out.len());
        out[..count].copy_from_slice(&frames.names[..count]);
        count
    }

    fn depth(&self) -> usize {
        self.frames.lock().depth
    }

    fn overflow(&self) -> usize {
        self.frames.lock().overflow
    }

    fn release(&self) {
        let mut frames = self.frames.lock();
        frames.names.release();
        frames.depth = 0;
        frames.overflow = 0;
    }
}

type StackMap = HashMap<ThreadId, Arc<ContextStack>, FxBuildHasher>;

/// All context stacks created for one runtime.
pub(crate) struct ContextRegistry {
    stacks: Mutex<StackMap>,
    closed: AtomicBool,
    max_depth: usize,
    allocator: SharedAllocator,
}

/// The calling thread's entry for one runtime.
struct LocalStack {
    stack: Arc<ContextStack>,
    registry: Arc<ContextRegistry>,
    thread: ThreadId,
}

impl Drop for LocalStack {
    fn drop(&mut self) {
        self.registry.deregister(self.thread);
    }
}

std::thread_local! {
    /// Keyed by runtime id.
    static LOCAL_STACKS: RefCell<HashMap<u64, LocalStack, FxBuildHasher>> =
        RefCell::new(HashMap::with_hasher(FxBuildHasher));
}

/// Runs `f` with the calling thread's existing stack for `runtime_id`.
///
/// Never creates a stack, and yields `None` when thread-local storage is
/// unavailable or already borrowed further up the calling thread's stack.
fn with_existing<R>(runtime_id: u64, f: impl FnOnce(Option<&ContextStack>) -> R) -> R {
    let stack = LOCAL_STACKS
        .try_with(|cell| {
            let stacks = cell.try_borrow().ok()?;
            let local = stacks
                .get(&runtime_id)
                .filter(|local| !local.registry.is_closed())?;
            Some(local.stack.clone())
        })
        .ok()
        .flatten();
    f(stack.as_deref())
}

impl ContextRegistry {
    pub(crate) fn new(max_depth: usize, allocator: SharedAllocator) -> Self {
        Self {
            stacks: Mutex::new(HashMap::with_hasher(FxBuildHasher)),
            closed: AtomicBool::new(false),
            max_depth,
            allocator,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_stacks(&self) -> MutexGuard<'_, StackMap> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes `name` onto the calling thread's stack, creating it if needed.
    pub(crate) fn begin(this: &Arc<Self>, runtime_id: u64, name: &'static str) {
        if this.is_closed() {
            return;
        }

        let stack = LOCAL_STACKS.try_with(|cell| {
            let mut stacks = cell.try_borrow_mut().ok()?;
            stacks.retain(|_, local| !local.registry.is_closed());
            let local = stacks
                .entry(runtime_id)
                .or_insert_with(|| Self::register(this));
            Some(local.stack.clone())
        });

        match stack {
            Ok(Some(stack)) => {
                if stack.push(name) == Push::Overflowed(1) {
                    tracing::debug!(
                        context = name,
                        max_context_depth = this.max_depth,
                        "forensics context stack overflowed"
                    );
                }
            }
            _ => tracing::warn!(
                context = name,
                "forensics context stack is unavailable on this thread"
            ),
        }
    }

    /// Pops the calling thread's stack, returning `false` on underflow.
    pub(crate) fn end(&self, runtime_id: u64) -> bool {
        if self.is_closed() {
            return true;
        }
        with_existing(runtime_id, |stack| stack.is_some_and(ContextStack::pop))
    }

    /// Copies the calling thread's frames, outermost first, into `out`.
    pub(crate) fn copy_current(&self, runtime_id: u64, out: &mut [&'static str]) -> usize {
        if out.is_empty() {
            return 0;
        }
        with_existing(runtime_id, |stack| stack.map_or(0, |stack| stack.copy_into(out)))
    }

    pub(crate) fn depth(&self, runtime_id: u64) -> usize {
        with_existing(runtime_id, |stack| stack.map_or(0, ContextStack::depth))
    }

    pub(crate) fn overflow(&self, runtime_id: u64) -> usize {
        with_existing(runtime_id, |stack| stack.map_or(0, ContextStack::overflow))
    }

    /// Number of threads that currently own a stack.
    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.lock_stacks().len()
    }

    fn register(this: &Arc<Self>) -> LocalStack {
        let names = FixedBuf::new_in(this.max_depth, "", &this.allocator).unwrap_or_else(|error| {
            tracing::warn!(%error, "every context on this thread will count as overflow");
            FixedBuf::empty(&this.allocator)
        });
        let stack = Arc::new(ContextStack::new(names));
        let thread = std::thread::current().id();

        let mut stacks = this.lock_stacks();
        if this.is_closed() {
            // lost the race against shutdown
            stack.release();
        } else {
            stacks.insert(thread, stack.clone());
        }
        drop(stacks);

        LocalStack {
            stack,
            registry: this.clone(),
            thread,
        }
    }

    fn deregister(&self, thread: ThreadId) {
        if self.is_closed() {
            return;
        }
        self.lock_stacks().remove(&thread);
    }

    /// Releases every registered stack and refuses new ones, returning how
    /// many were released.
    pub(crate) fn close(&self) -> usize {
        let mut stacks = self.lock_stacks();
        self.closed.store(true, Ordering::Release);
        let released = stacks.len();
        for stack in stacks.values() {
            stack.release();
        }
        stacks.clear();
        released
    }
}

#[cfg(test)]
mod tests {
    use forensics_internals::{SystemAllocator, shared_allocator};

    use super::*;

    fn registry(max_depth: usize) -> Arc<ContextRegistry> {
        Arc::new(ContextRegistry::new(max_depth, shared_allocator(SystemAllocator)))
    }

    fn frames(registry: &ContextRegistry, runtime_id: u64) -> Vec<&'static str> {
        let mut out = [""; 16];
        let count = registry.copy_current(runtime_id, &mut out);
        out[..count].to_vec()
    }

    #[test]
    fn test_balanced_begin_end() {
        let registry = registry(4);
        ContextRegistry::begin(&registry, 1, "a");
        ContextRegistry::begin(&registry, 1, "b");
        assert_eq!(frames(&registry, 1), ["a", "b"]);
        assert!(registry.end(1));
        assert!(registry.end(1));
        assert_eq!(registry.depth(1), 0);
        assert!(!registry.end(1));
    }

    #[test]
    fn test_overflow_drains_without_underflow() {
        let registry = registry(2);
        for name in ["a", "b", "c", "d", "e"] {
            ContextRegistry::begin(&registry, 2, name);
        }
        assert_eq!(registry.depth(2), 2);
        assert_eq!(registry.overflow(2), 3);
        assert_eq!(frames(&registry, 2), ["a", "b"]);

        for _ in 0..5 {
            assert!(registry.end(2));
        }
        assert_eq!((registry.depth(2), registry.overflow(2)), (0, 0));
        assert!(!registry.end(2));
    }

    #[test]
    fn test_zero_depth_counts_everything_as_overflow() {
        let registry = registry(0);
        ContextRegistry::begin(&registry, 3, "a");
        assert_eq!(registry.depth(3), 0);
        assert_eq!(registry.overflow(3), 1);
        assert!(frames(&registry, 3).is_empty());
        assert!(registry.end(3));
    }

    #[test]
    fn test_stacks_are_per_runtime_and_per_thread() {
        let registry = registry(4);
        ContextRegistry::begin(&registry, 4, "main");
        assert!(frames(&registry, 5).is_empty());

        let other = registry.clone();
        std::thread::spawn(move || {
            assert!(frames(&other, 4).is_empty());
            ContextRegistry::begin(&other, 4, "worker");
            assert_eq!(frames(&other, 4), ["worker"]);
        })
        .join()
        .unwrap();

        // the worker deregistered itself on exit
        assert_eq!(registry.registered(), 1);
        assert_eq!(frames(&registry, 4), ["main"]);
        assert!(registry.end(4));
    }

    #[test]
    fn test_close_releases_live_threads() {
        let registry = registry(4);
        ContextRegistry::begin(&registry, 6, "a");
        assert_eq!(registry.close(), 1);
        assert_eq!(registry.registered(), 0);

        // everything is a no-op once closed
        ContextRegistry::begin(&registry, 6, "b");
        assert_eq!(registry.depth(6), 0);
        assert!(registry.end(6));
    }
}
