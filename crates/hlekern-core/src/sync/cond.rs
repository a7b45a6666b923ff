//! Condition variable bound to a kernel mutex

use crate::error::{KernelError, KernelResult};
use crate::kernel::{deadline_after, Kernel};
use crate::sync::lock::MutexRef;
use crate::sync::{Mutex, SleepQueue};
use crate::thread::{GuestThread, ThreadId};
use std::sync::Arc;

/// Condition variable
pub struct Cond {
    /// ID of the associated mutex
    mutex: u32,

    /// Waiting threads, ordered by the mutex's protocol
    queue: SleepQueue,

    /// Guest-supplied name
    name: u64,
}

impl Cond {
    /// ID of the associated mutex
    pub fn mutex(&self) -> u32 {
        self.mutex
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
    /// Create a condition variable over mutex `mutex_id`
    pub fn cond_create(&self, mutex_id: u32, name: u64) -> KernelResult<u32> {
        let mut st = self.lock();
        let protocol = st.objects.get::<Mutex>(mutex_id)?.protocol();
        let id = st.objects.create(Cond {
            mutex: mutex_id,
            queue: SleepQueue::new(protocol),
            name,
        })?;
        st.objects.get_mut::<Mutex>(mutex_id)?.attach_cond();
        Ok(id)
    }

    /// Destroy a condition variable with no waiters
    pub fn cond_destroy(&self, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        if !st.objects.get::<Cond>(id)?.queue.is_empty() {
            return Err(KernelError::Busy);
        }
        let cond = st.objects.remove::<Cond>(id)?;
        if let Ok(mutex) = st.objects.get_mut::<Mutex>(cond.mutex) {
            mutex.detach_cond();
        }
        Ok(())
    }

    /// Release the associated mutex and wait for a signal
    ///
    /// The mutex is held again, at its previous depth, when this returns
    /// `Ok` or `TimedOut`.
    pub fn cond_wait(&self, thread: &Arc<GuestThread>, id: u32, timeout: u64) -> KernelResult<()> {
        let deadline = deadline_after(timeout);
        let mut st = self.lock();
        let mutex = MutexRef::Heavy(st.objects.get::<Cond>(id)?.mutex);
        self.cond_wait_on(&mut st, mutex, thread, deadline, |st| {
            Ok(&mut st.objects.get_mut::<Cond>(id)?.queue)
        })
    }

    /// Wake one waiter
    pub fn cond_signal(&self, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        if let Some(thread) = st.objects.get_mut::<Cond>(id)?.queue.pop() {
            thread.signal();
        }
        Ok(())
    }

    /// Wake every waiter; returns how many were woken
    pub fn cond_signal_all(&self, id: u32) -> KernelResult<usize> {
        let mut st = self.lock();
        let woken = st.objects.get_mut::<Cond>(id)?.queue.drain();
        for thread in &woken {
            thread.signal();
        }
        Ok(woken.len())
    }

    /// Wake a specific waiter
    pub fn cond_signal_to(&self, id: u32, target: ThreadId) -> KernelResult<()> {
        let mut st = self.lock();
        let thread = st
            .objects
            .get_mut::<Cond>(id)?
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
    use crate::sync::Protocol;
    use std::thread;
    use std::time::{Duration, Instant};

    fn kernel() -> Arc<Kernel> {
        Arc::new(Kernel::new(KernelConfig::default(), Arc::new(FlatMemory::new(0x100))))
    }

    fn wait_queued(thread: &GuestThread) {
        while !thread.is_queued() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_create_binds_mutex() {
        let kernel = kernel();
        let m = kernel.mutex_create(Protocol::Priority, false, 0).unwrap();
        let c = kernel.cond_create(m, 7).unwrap();

        kernel.with_kernel_lock(|st| {
            let cond = st.objects.get::<Cond>(c).unwrap();
            assert_eq!(cond.mutex(), m);
            assert_eq!(cond.queue().protocol(), Protocol::Priority);
            assert_eq!(cond.name(), 7);
        });
        assert_eq!(kernel.mutex_destroy(m), Err(KernelError::Busy));
        kernel.cond_destroy(c).unwrap();
        kernel.mutex_destroy(m).unwrap();
    }

    #[test]
    fn test_create_on_missing_mutex() {
        let kernel = kernel();
        assert_eq!(kernel.cond_create(0x8500_0001, 0), Err(KernelError::NotFound));
        assert_eq!(kernel.object_count(), 0);
    }

    #[test]
    fn test_wait_requires_ownership() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let m = kernel.mutex_create(Protocol::Fifo, false, 0).unwrap();
        let c = kernel.cond_create(m, 0).unwrap();

        assert_eq!(kernel.cond_wait(&t, c, 0), Err(KernelError::Permission));
    }

    #[test]
    fn test_wait_timeout_reacquires_mutex() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let m = kernel.mutex_create(Protocol::Fifo, true, 0).unwrap();
        let c = kernel.cond_create(m, 0).unwrap();

        kernel.mutex_lock(&t, m, 0).unwrap();
        kernel.mutex_lock(&t, m, 0).unwrap();

        let start = Instant::now();
        assert_eq!(kernel.cond_wait(&t, c, 10_000), Err(KernelError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(!t.is_queued());

        // depth restored: two unlocks needed
        assert_eq!(kernel.mutex_owner(m), Ok(Some(t.id())));
        kernel.mutex_unlock(&t, m).unwrap();
        assert_eq!(kernel.mutex_owner(m), Ok(Some(t.id())));
        kernel.mutex_unlock(&t, m).unwrap();
        assert_eq!(kernel.mutex_owner(m), Ok(None));
    }

    #[test]
    fn test_signal_wakes_waiter_with_mutex() {
        let kernel = kernel();
        let waiter = kernel.threads().register(1000);
        let signaler = kernel.threads().register(1000);
        let m = kernel.mutex_create(Protocol::Fifo, false, 0).unwrap();
        let c = kernel.cond_create(m, 0).unwrap();

        let k = kernel.clone();
        let w = waiter.clone();
        let handle = thread::spawn(move || {
            k.mutex_lock(&w, m, 0)?;
            k.cond_wait(&w, c, 0)?;
            let owner = k.mutex_owner(m)?;
            k.mutex_unlock(&w, m)?;
            Ok::<_, KernelError>(owner)
        });

        wait_queued(&waiter);
        // the waiter released the mutex while waiting
        kernel.mutex_lock(&signaler, m, 0).unwrap();
        kernel.cond_signal(c).unwrap();
        kernel.mutex_unlock(&signaler, m).unwrap();

        assert_eq!(handle.join().unwrap(), Ok(Some(waiter.id())));
    }

    #[test]
    fn test_signal_all_and_signal_to() {
        let kernel = kernel();
        let m = kernel.mutex_create(Protocol::Fifo, false, 0).unwrap();
        let c = kernel.cond_create(m, 0).unwrap();
        let waiters: Vec<_> = (0..3).map(|_| kernel.threads().register(1000)).collect();

        let handles: Vec<_> = waiters
            .iter()
            .map(|w| {
                let k = kernel.clone();
                let w = w.clone();
                thread::spawn(move || {
                    k.mutex_lock(&w, m, 0)?;
                    k.cond_wait(&w, c, 0)?;
                    k.mutex_unlock(&w, m)
                })
            })
            .collect();
        for w in &waiters {
            wait_queued(w);
        }
        // every waiter sits in the cond queue once all three are queued there
        while kernel.with_kernel_lock(|st| st.objects.get::<Cond>(c).unwrap().queue().len()) < 3 {
            thread::sleep(Duration::from_millis(1));
        }

        kernel.cond_signal_to(c, waiters[1].id()).unwrap();
        assert_eq!(
            kernel.cond_signal_to(c, waiters[1].id()),
            Err(KernelError::Permission)
        );
        assert_eq!(kernel.cond_signal_all(c), Ok(2));

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
        assert_eq!(kernel.mutex_owner(m), Ok(None));
    }

    #[test]
    fn test_destroy_busy_with_waiter() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let m = kernel.mutex_create(Protocol::Fifo, false, 0).unwrap();
        let c = kernel.cond_create(m, 0).unwrap();

        let k = kernel.clone();
        let w = t.clone();
        let handle = thread::spawn(move || {
            k.mutex_lock(&w, m, 0)?;
            k.cond_wait(&w, c, 0)?;
            k.mutex_unlock(&w, m)
        });
        wait_queued(&t);

        assert_eq!(kernel.cond_destroy(c), Err(KernelError::Busy));
        kernel.cond_signal(c).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(()));
        kernel.cond_destroy(c).unwrap();
    }
}
