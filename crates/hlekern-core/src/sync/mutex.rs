//! Kernel mutex with recursion counting

use crate::error::{KernelError, KernelResult};
use crate::kernel::{deadline_after, Kernel};
use crate::sync::lock::{MutexRef, Ownership};
use crate::sync::{Protocol, SleepQueue};
use crate::thread::{GuestThread, ThreadId};
use std::sync::Arc;

/// Guest attribute value for a recursive mutex
pub const SYNC_RECURSIVE: u32 = 0x10;
/// Guest attribute value for a non-recursive mutex
pub const SYNC_NOT_RECURSIVE: u32 = 0x20;

/// Decode the guest recursion attribute
pub fn recursive_from_raw(raw: u32) -> KernelResult<bool> {
    match raw {
        SYNC_RECURSIVE => Ok(true),
        SYNC_NOT_RECURSIVE => Ok(false),
        _ => Err(KernelError::InvalidArgument),
    }
}

/// Exclusive-ownership lock
pub struct Mutex {
    /// Whether the owner may lock again
    recursive: bool,

    /// Current owner and depth
    ownership: Ownership,

    /// Threads waiting for ownership
    queue: SleepQueue,

    /// Condition variables bound to this mutex
    cond_count: u32,

    /// Guest-supplied name
    name: u64,
}

impl Mutex {
    /// Create an unowned mutex
    pub fn new(protocol: Protocol, recursive: bool, name: u64) -> Self {
        Self {
            recursive,
            ownership: Ownership::default(),
            queue: SleepQueue::new(protocol),
            cond_count: 0,
            name,
        }
    }

    /// Wake-order protocol
    pub fn protocol(&self) -> Protocol {
        self.queue.protocol()
    }

    /// Whether the owner may lock again
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Current owner and depth
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub(crate) fn set_ownership(&mut self, ownership: Ownership) {
        self.ownership = ownership;
    }

    /// Waiting threads
    pub fn queue(&self) -> &SleepQueue {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut SleepQueue {
        &mut self.queue
    }

    /// Number of bound condition variables
    pub fn cond_count(&self) -> u32 {
        self.cond_count
    }

    pub(crate) fn attach_cond(&mut self) {
        self.cond_count += 1;
    }

    pub(crate) fn detach_cond(&mut self) {
        debug_assert!(self.cond_count > 0);
        self.cond_count = self.cond_count.saturating_sub(1);
    }

    /// Guest-supplied name
    pub fn name(&self) -> u64 {
        self.name
    }
}

impl Kernel {
    /// Create a mutex
    pub fn mutex_create(&self, protocol: Protocol, recursive: bool, name: u64) -> KernelResult<u32> {
        if protocol == Protocol::Retry {
            return Err(KernelError::InvalidArgument);
        }
        self.lock()
            .objects
            .create(Mutex::new(protocol, recursive, name))
    }

    /// Destroy an unowned, unwaited mutex with no bound condition variables
    pub fn mutex_destroy(&self, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let mutex = st.objects.get::<Mutex>(id)?;
        if mutex.ownership.owner.is_some() || mutex.cond_count > 0 || !mutex.queue.is_empty() {
            return Err(KernelError::Busy);
        }
        st.objects.remove::<Mutex>(id).map(drop)
    }

    /// Lock a mutex, waiting up to `timeout` microseconds (0 = forever)
    pub fn mutex_lock(&self, thread: &Arc<GuestThread>, id: u32, timeout: u64) -> KernelResult<()> {
        let deadline = deadline_after(timeout);
        let mut st = self.lock();
        self.acquire_lock(&mut st, MutexRef::Heavy(id), thread, deadline)
    }

    /// Lock a mutex only if that needs no waiting
    pub fn mutex_trylock(&self, thread: &Arc<GuestThread>, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        self.try_acquire_lock(&mut st, MutexRef::Heavy(id), thread.id())
    }

    /// Unlock one level; the last level hands the mutex to the next waiter
    pub fn mutex_unlock(&self, thread: &Arc<GuestThread>, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        self.release_lock(&mut st, MutexRef::Heavy(id), thread.id())
    }

    /// Current owner of a mutex
    pub fn mutex_owner(&self, id: u32) -> KernelResult<Option<ThreadId>> {
        Ok(self.lock().objects.get::<Mutex>(id)?.ownership.owner)
    }
}
