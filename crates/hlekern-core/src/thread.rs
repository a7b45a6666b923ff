//! Guest thread handles and the thread registry
//!
//! A [`GuestThread`] is the kernel's view of one emulated execution context:
//! an ID, a scheduling priority and a private wait/wake handle. The thread
//! lifecycle manager owns the handles; the kernel only borrows them while a
//! thread is blocked in one of its sleep queues.

use crate::kernel::KernelState;
use dashmap::DashMap;
use parking_lot::{Condvar, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// First ID handed out by [`ThreadRegistry`]
pub const THREAD_ID_BASE: u32 = 0x0100_0000;

/// Unique identifier for a guest thread
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Get the numeric ID value
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Create a ThreadId from a raw guest value
    pub fn from_u32(id: u32) -> Self {
        ThreadId(id)
    }
}

/// Kernel-side handle of one guest execution context
pub struct GuestThread {
    id: ThreadId,

    /// Scheduling priority (lower value = more urgent)
    priority: AtomicI32,

    /// Set by a waker once it has popped this thread from a queue.
    /// Only touched with the kernel lock held.
    signaled: AtomicBool,

    /// Whether the thread currently sits in a sleep queue
    queued: AtomicBool,

    /// Wait/wake handle, always paired with the kernel lock
    wake: Condvar,
}

impl GuestThread {
    fn new(id: ThreadId, priority: i32) -> Self {
        Self {
            id,
            priority: AtomicI32::new(priority),
            signaled: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            wake: Condvar::new(),
        }
    }

    /// Get the thread ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Current scheduling priority
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Change the scheduling priority
    ///
    /// Takes effect at the next PRIORITY-protocol selection.
    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Whether the thread is currently linked into a sleep queue
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn set_queued(&self, queued: bool) {
        self.queued.store(queued, Ordering::Relaxed);
    }

    /// Mark the thread runnable and wake it. Caller holds the kernel lock.
    pub(crate) fn signal(&self) {
        self.signaled.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    /// Consume a pending wake-up. Caller holds the kernel lock.
    pub(crate) fn take_signal(&self) -> bool {
        self.signaled.swap(false, Ordering::Relaxed)
    }

    /// Nudge the thread without granting anything (used at shutdown)
    pub(crate) fn nudge(&self) {
        self.wake.notify_one();
    }

    /// Release the kernel lock and sleep until notified or `deadline`
    pub(crate) fn park(&self, guard: &mut MutexGuard<'_, KernelState>, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => {
                self.wake.wait_until(guard, deadline);
            }
            None => self.wake.wait(guard),
        }
    }
}

impl std::fmt::Debug for GuestThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestThread")
            .field("id", &self.id)
            .field("priority", &self.priority())
            .field("queued", &self.is_queued())
            .finish()
    }
}

/// Registry of live guest threads
///
/// Stands in for the thread lifecycle manager: it hands out thread IDs and
/// resolves them back to handles for targeted wakes and priority lookups.
pub struct ThreadRegistry {
    threads: DashMap<ThreadId, Arc<GuestThread>>,
    next_id: AtomicU32,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            threads: DashMap::new(),
            next_id: AtomicU32::new(THREAD_ID_BASE),
        }
    }

    /// Register a new guest thread with the given priority
    pub fn register(&self, priority: i32) -> Arc<GuestThread> {
        let id = ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(GuestThread::new(id, priority));
        self.threads.insert(id, thread.clone());
        thread
    }

    /// Look up a thread by ID
    pub fn lookup(&self, id: ThreadId) -> Option<Arc<GuestThread>> {
        self.threads.get(&id).map(|entry| entry.clone())
    }

    /// Remove a thread that has exited
    pub fn unregister(&self, id: ThreadId) -> Option<Arc<GuestThread>> {
        self.threads.remove(&id).map(|(_, thread)| thread)
    }

    /// Number of registered threads
    pub fn count(&self) -> usize {
        self.threads.len()
    }

    /// Snapshot of every registered thread
    pub fn all(&self) -> Vec<Arc<GuestThread>> {
        self.threads.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
