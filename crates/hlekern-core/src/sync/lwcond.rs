//! Lightweight condition variable
//!
//! The guest control block names the lightweight mutex (by control block
//! address) and the kernel-side queue (by ID). Operations take the control
//! block address.

use crate::error::{KernelError, KernelResult};
use crate::kernel::{deadline_after, Kernel, KernelState};
use crate::memory::GuestMemory;
use crate::sync::lock::MutexRef;
use crate::sync::{LwMutex, Protocol, SleepQueue};
use crate::thread::{GuestThread, ThreadId};
use std::sync::Arc;

/// Guest-resident control block of a lightweight condition variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LwCondControl {
    /// Control block address of the bound lightweight mutex
    pub lwmutex: u32,
    /// ID of the kernel-side queue
    pub lwcond_queue: u32,
}

impl LwCondControl {
    /// Size of the control block in guest memory
    pub const SIZE: u32 = 8;

    /// Read a control block
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> KernelResult<Self> {
        let second = addr.checked_add(4).ok_or(KernelError::Fault(addr))?;
        Ok(Self {
            lwmutex: mem.read_u32(addr)?,
            lwcond_queue: mem.read_u32(second)?,
        })
    }

    /// Write the control block
    pub fn write(&self, mem: &dyn GuestMemory, addr: u32) -> KernelResult<()> {
        let second = addr.checked_add(4).ok_or(KernelError::Fault(addr))?;
        mem.write_u32(addr, self.lwmutex)?;
        mem.write_u32(second, self.lwcond_queue)
    }
}

/// Kernel side of a lightweight condition variable
pub struct LwCond {
    lwmutex: u32,
    queue: SleepQueue,
    name: u64,
}

impl LwCond {
    /// Control block address of the bound lightweight mutex
    pub fn lwmutex(&self) -> u32 {
        self.lwmutex
    }

    /// Waiting threads
    pub fn queue(&self) -> &SleepQueue {
        &self.queue
    }

    /// Guest-supplied name
    pub fn name(&self) -> u64 {
        self.name
    }
}

impl Kernel {
    /// Resolve a control block into its queue ID and bound mutex
    fn lwcond_ref(&self, st: &KernelState, control: u32) -> KernelResult<(u32, MutexRef)> {
        let block = LwCondControl::read(self.memory(), control)?;
        let cond = st.objects.get::<LwCond>(block.lwcond_queue)?;
        if cond.lwmutex != block.lwmutex {
            return Err(KernelError::NotFound);
        }
        Ok((block.lwcond_queue, self.lwmutex_ref(block.lwmutex)?))
    }

    /// Initialize a lightweight condition variable at `control` bound to
    /// the lightweight mutex at `lwmutex`
    pub fn lwcond_create(&self, control: u32, lwmutex: u32, name: u64) -> KernelResult<u32> {
        let mut st = self.lock();
        let MutexRef::Light { queue: mutex_queue, .. } = self.lwmutex_ref(lwmutex)? else {
            return Err(KernelError::NotFound);
        };
        let protocol = st.objects.get::<LwMutex>(mutex_queue)?.protocol();
        if protocol == Protocol::Retry {
            return Err(KernelError::InvalidArgument);
        }
        LwCondControl::read(self.memory(), control)?;

        let id = st.objects.create(LwCond {
            lwmutex,
            queue: SleepQueue::new(protocol),
            name,
        })?;
        let block = LwCondControl {
            lwmutex,
            lwcond_queue: id,
        };
        block.write(self.memory(), control)?;
        st.objects.get_mut::<LwMutex>(mutex_queue)?.attach_cond();
        Ok(id)
    }

    /// Destroy a lightweight condition variable with no waiters
    pub fn lwcond_destroy(&self, control: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let block = LwCondControl::read(self.memory(), control)?;
        if !st.objects.get::<LwCond>(block.lwcond_queue)?.queue.is_empty() {
            return Err(KernelError::Busy);
        }
        st.objects.remove::<LwCond>(block.lwcond_queue)?;
        if let Ok(MutexRef::Light { queue, .. }) = self.lwmutex_ref(block.lwmutex) {
            if let Ok(mutex) = st.objects.get_mut::<LwMutex>(queue) {
                mutex.detach_cond();
            }
        }
        LwCondControl { lwcond_queue: 0, ..block }.write(self.memory(), control)
    }

    /// Release the bound lightweight mutex and wait for a signal
    pub fn lwcond_wait(&self, thread: &Arc<GuestThread>, control: u32, timeout: u64) -> KernelResult<()> {
        let deadline = deadline_after(timeout);
        let mut st = self.lock();
        let (id, mutex) = self.lwcond_ref(&st, control)?;
        self.cond_wait_on(&mut st, mutex, thread, deadline, |st| {
            Ok(&mut st.objects.get_mut::<LwCond>(id)?.queue)
        })
    }

    /// Wake one waiter
    pub fn lwcond_signal(&self, control: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let (id, _) = self.lwcond_ref(&st, control)?;
        if let Some(thread) = st.objects.get_mut::<LwCond>(id)?.queue.pop() {
            thread.signal();
        }
        Ok(())
    }

    /// Wake every waiter; returns how many were woken
    pub fn lwcond_signal_all(&self, control: u32) -> KernelResult<usize> {
        let mut st = self.lock();
        let (id, _) = self.lwcond_ref(&st, control)?;
        let woken = st.objects.get_mut::<LwCond>(id)?.queue.drain();
        for thread in &woken {
            thread.signal();
        }
        Ok(woken.len())
    }

    /// Wake a specific waiter
    pub fn lwcond_signal_to(&self, control: u32, target: ThreadId) -> KernelResult<()> {
        let mut st = self.lock();
        let (id, _) = self.lwcond_ref(&st, control)?;
        let thread = st
            .objects
            .get_mut::<LwCond>(id)?
            .queue
            .pop_matching(|t| t.id() == target)
            .ok_or(KernelError::Permission)?;
        thread.signal();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::memory::FlatMemory;
    use std::thread;
    use std::time::Duration;

    const MUTEX: u32 = 0x40;
    const COND: u32 = 0x80;

    fn kernel() -> Arc<Kernel> {
        Arc::new(Kernel::new(KernelConfig::default(), Arc::new(FlatMemory::new(0x100))))
    }

    #[test]
    fn test_create_writes_control_block() {
        let kernel = kernel();
        kernel.lwmutex_create(MUTEX, Protocol::Fifo, false, 0).unwrap();
        let id = kernel.lwcond_create(COND, MUTEX, 3).unwrap();

        let block = LwCondControl::read(kernel.memory(), COND).unwrap();
        assert_eq!(block, LwCondControl { lwmutex: MUTEX, lwcond_queue: id });
        assert_eq!(kernel.lwmutex_destroy(MUTEX), Err(KernelError::Busy));
    }

    #[test]
    fn test_create_rejects_retry_mutex() {
        let kernel = kernel();
        kernel.lwmutex_create(MUTEX, Protocol::Retry, false, 0).unwrap();
        assert_eq!(
            kernel.lwcond_create(COND, MUTEX, 0),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_destroy_then_use_is_not_found() {
        let kernel = kernel();
        kernel.lwmutex_create(MUTEX, Protocol::Fifo, false, 0).unwrap();
        kernel.lwcond_create(COND, MUTEX, 0).unwrap();

        kernel.lwcond_destroy(COND).unwrap();
        assert_eq!(kernel.lwcond_signal(COND), Err(KernelError::NotFound));
        kernel.lwmutex_destroy(MUTEX).unwrap();
    }

    #[test]
    fn test_wait_without_mutex_is_permission() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        kernel.lwmutex_create(MUTEX, Protocol::Fifo, false, 0).unwrap();
        kernel.lwcond_create(COND, MUTEX, 0).unwrap();

        assert_eq!(kernel.lwcond_wait(&t, COND, 0), Err(KernelError::Permission));
    }

    #[test]
    fn test_signal_round_trip() {
        let kernel = kernel();
        let waiter = kernel.threads().register(1000);
        let signaler = kernel.threads().register(1000);
        kernel.lwmutex_create(MUTEX, Protocol::Priority, false, 0).unwrap();
        kernel.lwcond_create(COND, MUTEX, 0).unwrap();

        let k = kernel.clone();
        let w = waiter.clone();
        let handle = thread::spawn(move || {
            k.lwmutex_lock(&w, MUTEX, 0)?;
            k.lwcond_wait(&w, COND, 0)?;
            let owner = k.lwmutex_owner(MUTEX)?;
            k.lwmutex_unlock(&w, MUTEX)?;
            Ok::<_, KernelError>(owner)
        });
        while !waiter.is_queued() {
            thread::sleep(Duration::from_millis(1));
        }

        kernel.lwmutex_lock(&signaler, MUTEX, 0).unwrap();
        kernel.lwcond_signal_to(COND, waiter.id()).unwrap();
        kernel.lwmutex_unlock(&signaler, MUTEX).unwrap();

        assert_eq!(handle.join().unwrap(), Ok(Some(waiter.id())));
        assert_eq!(kernel.lwcond_signal_all(COND), Ok(0));
    }

    #[test]
    fn test_wait_timeout() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        kernel.lwmutex_create(MUTEX, Protocol::Fifo, false, 0).unwrap();
        kernel.lwcond_create(COND, MUTEX, 0).unwrap();

        kernel.lwmutex_lock(&t, MUTEX, 0).unwrap();
        assert_eq!(kernel.lwcond_wait(&t, COND, 5_000), Err(KernelError::TimedOut));
        assert_eq!(kernel.lwmutex_owner(MUTEX), Ok(Some(t.id())));
        assert_eq!(kernel.lwcond_signal_to(COND, t.id()), Err(KernelError::Permission));
    }
}
