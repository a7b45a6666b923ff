//! Lightweight mutex
//!
//! The owner and recursion count live in a control block in guest memory;
//! the kernel keeps only the sleep queue, as an object referenced by ID from
//! the control block. Operations name the mutex by its control block
//! address.

use crate::error::{KernelError, KernelResult};
use crate::kernel::{deadline_after, Kernel};
use crate::memory::GuestMemory;
use crate::sync::lock::{MutexRef, Ownership};
use crate::sync::mutex::{SYNC_NOT_RECURSIVE, SYNC_RECURSIVE};
use crate::sync::{Protocol, SleepQueue};
use crate::thread::{GuestThread, ThreadId};
use std::sync::Arc;

/// Owner word of an unowned lightweight mutex
pub const LWMUTEX_FREE: u32 = 0xFFFF_FFFF;
/// Owner word of a destroyed lightweight mutex
pub const LWMUTEX_DEAD: u32 = 0xFFFF_FFFE;

const OWNER: u32 = 0;
const WAITER: u32 = 4;
const ATTRIBUTE: u32 = 8;
const RECURSIVE_COUNT: u32 = 12;
const SLEEP_QUEUE: u32 = 16;

/// Guest-resident control block of a lightweight mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LwMutexControl {
    /// Owning thread ID, or [`LWMUTEX_FREE`] / [`LWMUTEX_DEAD`]
    pub owner: u32,
    /// Number of threads queued in the kernel
    pub waiter: u32,
    /// Protocol value OR'd with the recursion attribute
    pub attribute: u32,
    /// Lock depth
    pub recursive_count: u32,
    /// ID of the kernel-side sleep queue object
    pub sleep_queue: u32,
}

impl LwMutexControl {
    /// Size of the control block in guest memory
    pub const SIZE: u32 = 20;

    /// Read a control block
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> KernelResult<Self> {
        let field = |offset: u32| {
            addr.checked_add(offset)
                .ok_or(KernelError::Fault(addr))
                .and_then(|at| mem.read_u32(at))
        };
        Ok(Self {
            owner: field(OWNER)?,
            waiter: field(WAITER)?,
            attribute: field(ATTRIBUTE)?,
            recursive_count: field(RECURSIVE_COUNT)?,
            sleep_queue: field(SLEEP_QUEUE)?,
        })
    }

    /// Write the whole control block
    pub fn write(&self, mem: &dyn GuestMemory, addr: u32) -> KernelResult<()> {
        addr.checked_add(Self::SIZE).ok_or(KernelError::Fault(addr))?;
        mem.write_u32(addr + OWNER, self.owner)?;
        mem.write_u32(addr + WAITER, self.waiter)?;
        mem.write_u32(addr + ATTRIBUTE, self.attribute)?;
        mem.write_u32(addr + RECURSIVE_COUNT, self.recursive_count)?;
        mem.write_u32(addr + SLEEP_QUEUE, self.sleep_queue)
    }

    /// Whether the block carries the destroyed marker
    pub fn is_dead(&self) -> bool {
        self.owner == LWMUTEX_DEAD
    }

    /// Owner and depth as stored in the block
    pub fn ownership(&self) -> Ownership {
        match self.owner {
            LWMUTEX_FREE => Ownership::default(),
            owner => Ownership {
                owner: Some(ThreadId::from_u32(owner)),
                recursion: self.recursive_count,
            },
        }
    }

    pub(crate) fn store_ownership(
        mem: &dyn GuestMemory,
        addr: u32,
        ownership: Ownership,
        waiters: u32,
    ) -> KernelResult<()> {
        let owner = ownership.owner.map_or(LWMUTEX_FREE, ThreadId::as_u32);
        mem.write_u32(addr + OWNER, owner)?;
        mem.write_u32(addr + RECURSIVE_COUNT, ownership.recursion)?;
        mem.write_u32(addr + WAITER, waiters)
    }

    pub(crate) fn store_waiters(mem: &dyn GuestMemory, addr: u32, waiters: u32) -> KernelResult<()> {
        mem.write_u32(addr + WAITER, waiters)
    }
}

/// Kernel side of a lightweight mutex
pub struct LwMutex {
    /// Guest address of the control block
    control: u32,
    recursive: bool,
    queue: SleepQueue,
    cond_count: u32,
    name: u64,
}

impl LwMutex {
    /// Create the kernel side for a control block at `control`
    pub fn new(control: u32, protocol: Protocol, recursive: bool, name: u64) -> Self {
        Self {
            control,
            recursive,
            queue: SleepQueue::new(protocol),
            cond_count: 0,
            name,
        }
    }

    /// Guest address of the control block
    pub fn control(&self) -> u32 {
        self.control
    }

    /// Wake-order protocol
    pub fn protocol(&self) -> Protocol {
        self.queue.protocol()
    }

    /// Whether the owner may lock again
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Waiting threads
    pub fn queue(&self) -> &SleepQueue {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut SleepQueue {
        &mut self.queue
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
    /// Initialize a lightweight mutex control block at `control`
    ///
    /// Returns the ID of the kernel-side sleep queue, which is also stored in
    /// the control block. A block that still backs a live lightweight mutex
    /// is `Busy`.
    pub fn lwmutex_create(
        &self,
        control: u32,
        protocol: Protocol,
        recursive: bool,
        name: u64,
    ) -> KernelResult<u32> {
        let mut st = self.lock();
        // Probe the whole block so a bad address leaves nothing behind
        let current = LwMutexControl::read(self.memory(), control)?;
        if !current.is_dead() {
            let live = st.objects.get::<LwMutex>(current.sleep_queue);
            if live.map_or(false, |mutex| mutex.control() == control) {
                return Err(KernelError::Busy);
            }
        }
        let id = st
            .objects
            .create(LwMutex::new(control, protocol, recursive, name))?;

        let recursion_attr = if recursive { SYNC_RECURSIVE } else { SYNC_NOT_RECURSIVE };
        let block = LwMutexControl {
            owner: LWMUTEX_FREE,
            waiter: 0,
            attribute: protocol.as_raw() | recursion_attr,
            recursive_count: 0,
            sleep_queue: id,
        };
        if let Err(err) = block.write(self.memory(), control) {
            st.objects.remove::<LwMutex>(id)?;
            return Err(err);
        }
        Ok(id)
    }

    /// Destroy a lightweight mutex and mark its control block dead
    pub fn lwmutex_destroy(&self, control: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let mutex = self.lwmutex_ref(control)?;
        let view = self.load_lock(&st, mutex)?;
        let MutexRef::Light { queue, .. } = mutex else {
            return Err(KernelError::NotFound);
        };
        let kernel_side = st.objects.get::<LwMutex>(queue)?;
        if view.ownership.owner.is_some() || !kernel_side.queue.is_empty() || kernel_side.cond_count > 0 {
            return Err(KernelError::Busy);
        }
        st.objects.remove::<LwMutex>(queue)?;
        self.memory().write_u32(control + OWNER, LWMUTEX_DEAD)
    }

    /// Lock a lightweight mutex, waiting up to `timeout` microseconds
    ///
    /// Under the RETRY protocol a contended lock returns `Busy` instead of
    /// waiting.
    pub fn lwmutex_lock(
        &self,
        thread: &Arc<GuestThread>,
        control: u32,
        timeout: u64,
    ) -> KernelResult<()> {
        let deadline = deadline_after(timeout);
        let mut st = self.lock();
        let mutex = self.lwmutex_ref(control)?;
        self.acquire_lock(&mut st, mutex, thread, deadline)
    }

    /// Lock a lightweight mutex only if that needs no waiting
    pub fn lwmutex_trylock(&self, thread: &Arc<GuestThread>, control: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let mutex = self.lwmutex_ref(control)?;
        self.try_acquire_lock(&mut st, mutex, thread.id())
    }

    /// Unlock one level of a lightweight mutex
    pub fn lwmutex_unlock(&self, thread: &Arc<GuestThread>, control: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let mutex = self.lwmutex_ref(control)?;
        self.release_lock(&mut st, mutex, thread.id())
    }

    /// Current owner of a lightweight mutex
    pub fn lwmutex_owner(&self, control: u32) -> KernelResult<Option<ThreadId>> {
        let st = self.lock();
        let mutex = self.lwmutex_ref(control)?;
        Ok(self.load_lock(&st, mutex)?.ownership.owner)
    }
}
