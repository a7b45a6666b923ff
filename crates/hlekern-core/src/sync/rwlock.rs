//! Reader/writer lock with writer preference
//!
//! A reader is admitted only while no writer owns the lock *and* no writer
//! is queued, so a stream of readers cannot starve a writer. Releases hand
//! the lock over directly: the next writer becomes owner, or every queued
//! reader is admitted at once.

use crate::error::{KernelError, KernelResult};
use crate::kernel::{deadline_after, Kernel};
use crate::sync::{Protocol, SleepQueue};
use crate::thread::{GuestThread, ThreadId};
use std::sync::Arc;

/// Reader/writer lock
pub struct RwLock {
    /// Number of admitted readers
    readers: u32,

    /// Owning writer, if any
    writer: Option<ThreadId>,

    /// Threads waiting to read
    read_queue: SleepQueue,

    /// Threads waiting to write
    write_queue: SleepQueue,

    /// Guest-supplied name
    name: u64,
}

impl RwLock {
    /// Create an unlocked rwlock
    pub fn new(protocol: Protocol, name: u64) -> Self {
        Self {
            readers: 0,
            writer: None,
            read_queue: SleepQueue::new(protocol),
            write_queue: SleepQueue::new(protocol),
            name,
        }
    }

    /// Number of admitted readers
    pub fn readers(&self) -> u32 {
        self.readers
    }

    /// Owning writer
    pub fn writer(&self) -> Option<ThreadId> {
        self.writer
    }

    /// Threads waiting to read
    pub fn read_queue(&self) -> &SleepQueue {
        &self.read_queue
    }

    /// Threads waiting to write
    pub fn write_queue(&self) -> &SleepQueue {
        &self.write_queue
    }

    /// Guest-supplied name
    pub fn name(&self) -> u64 {
        self.name
    }

    fn try_read(&mut self, caller: ThreadId) -> KernelResult<()> {
        if self.writer == Some(caller) {
            return Err(KernelError::Deadlock);
        }
        if self.writer.is_none() && self.write_queue.is_empty() {
            self.readers += 1;
            return Ok(());
        }
        Err(KernelError::Busy)
    }

    fn try_write(&mut self, caller: ThreadId) -> KernelResult<()> {
        if self.writer == Some(caller) {
            return Err(KernelError::Deadlock);
        }
        if self.writer.is_none() && self.readers == 0 {
            self.writer = Some(caller);
            return Ok(());
        }
        Err(KernelError::Busy)
    }

    /// Hand the released lock to the next writer, or admit every queued
    /// reader
    fn notify(&mut self) {
        debug_assert!(self.writer.is_none() && self.readers == 0);
        if let Some(writer) = self.write_queue.pop() {
            self.writer = Some(writer.id());
            writer.signal();
            return;
        }
        self.admit_readers();
    }

    fn admit_readers(&mut self) {
        let admitted = self.read_queue.drain();
        self.readers += admitted.len() as u32;
        for reader in admitted {
            reader.signal();
        }
    }
}

impl Kernel {
    /// Create a reader/writer lock
    pub fn rwlock_create(&self, protocol: Protocol, name: u64) -> KernelResult<u32> {
        if protocol == Protocol::Retry {
            return Err(KernelError::InvalidArgument);
        }
        self.lock().objects.create(RwLock::new(protocol, name))
    }

    /// Destroy an idle rwlock
    pub fn rwlock_destroy(&self, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let rw = st.objects.get::<RwLock>(id)?;
        if rw.readers > 0
            || rw.writer.is_some()
            || !rw.read_queue.is_empty()
            || !rw.write_queue.is_empty()
        {
            return Err(KernelError::Busy);
        }
        st.objects.remove::<RwLock>(id).map(drop)
    }

    /// Acquire shared access, waiting up to `timeout` microseconds
    pub fn rwlock_read_lock(&self, thread: &Arc<GuestThread>, id: u32, timeout: u64) -> KernelResult<()> {
        let deadline = deadline_after(timeout);
        let mut st = self.lock();
        let rw = st.objects.get_mut::<RwLock>(id)?;
        match rw.try_read(thread.id()) {
            Err(KernelError::Busy) => {}
            other => return other,
        }
        rw.read_queue.push(thread.clone());

        let tid = thread.id();
        self.block_on(&mut st, thread, deadline, |st| {
            if let Ok(rw) = st.objects.get_mut::<RwLock>(id) {
                rw.read_queue.invalidate(tid);
            }
        })
    }

    /// Acquire shared access only if that needs no waiting
    pub fn rwlock_try_read_lock(&self, thread: &Arc<GuestThread>, id: u32) -> KernelResult<()> {
        self.lock().objects.get_mut::<RwLock>(id)?.try_read(thread.id())
    }

    /// Release shared access
    pub fn rwlock_read_unlock(&self, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let rw = st.objects.get_mut::<RwLock>(id)?;
        if rw.readers == 0 {
            return Err(KernelError::Permission);
        }
        rw.readers -= 1;
        if rw.readers == 0 {
            rw.notify();
        }
        Ok(())
    }

    /// Acquire exclusive access, waiting up to `timeout` microseconds
    pub fn rwlock_write_lock(&self, thread: &Arc<GuestThread>, id: u32, timeout: u64) -> KernelResult<()> {
        let deadline = deadline_after(timeout);
        let mut st = self.lock();
        let rw = st.objects.get_mut::<RwLock>(id)?;
        match rw.try_write(thread.id()) {
            Err(KernelError::Busy) => {}
            other => return other,
        }
        rw.write_queue.push(thread.clone());

        let tid = thread.id();
        self.block_on(&mut st, thread, deadline, |st| {
            if let Ok(rw) = st.objects.get_mut::<RwLock>(id) {
                rw.write_queue.invalidate(tid);
                // readers held back only by this writer may go now
                if rw.writer.is_none() && rw.write_queue.is_empty() {
                    rw.admit_readers();
                }
            }
        })
    }

    /// Acquire exclusive access only if that needs no waiting
    pub fn rwlock_try_write_lock(&self, thread: &Arc<GuestThread>, id: u32) -> KernelResult<()> {
        self.lock().objects.get_mut::<RwLock>(id)?.try_write(thread.id())
    }

    /// Release exclusive access
    pub fn rwlock_write_unlock(&self, thread: &Arc<GuestThread>, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let rw = st.objects.get_mut::<RwLock>(id)?;
        if rw.writer != Some(thread.id()) {
            return Err(KernelError::Permission);
        }
        rw.writer = None;
        rw.notify();
        Ok(())
    }
}
