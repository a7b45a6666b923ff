//! Counting semaphore
//!
//! A post that finds a queued waiter hands its unit directly to that thread
//! instead of raising the count, so a thread that arrives later can never
//! steal a unit meant for a woken waiter.

use crate::error::{KernelError, KernelResult};
use crate::kernel::{deadline_after, Kernel};
use crate::sync::{Handoff, Protocol, SleepQueue};
use crate::thread::GuestThread;
use std::sync::Arc;

/// Counting semaphore
pub struct Semaphore {
    /// Available units
    count: i32,

    /// Upper bound on `count` plus outstanding waiters
    max: i32,

    /// Threads waiting for a unit
    queue: SleepQueue,

    /// Units handed to woken waiters but not yet collected
    handoff: Handoff<()>,

    /// Guest-supplied name
    name: u64,
}

impl Semaphore {
    /// Create a semaphore holding `initial` units
    pub fn new(protocol: Protocol, initial: i32, max: i32, name: u64) -> Self {
        Self {
            count: initial,
            max,
            queue: SleepQueue::new(protocol),
            handoff: Handoff::new(),
            name,
        }
    }

    /// Available units
    pub fn count(&self) -> i32 {
        self.count
    }

    /// Capacity
    pub fn max(&self) -> i32 {
        self.max
    }

    /// Waiting threads
    pub fn queue(&self) -> &SleepQueue {
        &self.queue
    }

    /// Guest-supplied name
    pub fn name(&self) -> u64 {
        self.name
    }

    fn try_take(&mut self) -> bool {
        if self.count > 0 {
            self.count -= 1;
            return true;
        }
        false
    }
}

impl Kernel {
    /// Create a semaphore
    pub fn semaphore_create(
        &self,
        protocol: Protocol,
        initial: i32,
        max: i32,
        name: u64,
    ) -> KernelResult<u32> {
        if protocol == Protocol::Retry || max <= 0 || !(0..=max).contains(&initial) {
            return Err(KernelError::InvalidArgument);
        }
        self.lock()
            .objects
            .create(Semaphore::new(protocol, initial, max, name))
    }

    /// Destroy a semaphore with no waiters and no uncollected units
    pub fn semaphore_destroy(&self, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let sema = st.objects.get::<Semaphore>(id)?;
        if !sema.queue.is_empty() || !sema.handoff.is_empty() {
            return Err(KernelError::Busy);
        }
        st.objects.remove::<Semaphore>(id).map(drop)
    }

    /// Take one unit, waiting up to `timeout` microseconds (0 = forever)
    pub fn semaphore_wait(&self, thread: &Arc<GuestThread>, id: u32, timeout: u64) -> KernelResult<()> {
        let deadline = deadline_after(timeout);
        let mut st = self.lock();
        let sema = st.objects.get_mut::<Semaphore>(id)?;
        if sema.try_take() {
            return Ok(());
        }
        sema.queue.push(thread.clone());

        let tid = thread.id();
        self.block_on(&mut st, thread, deadline, |st| {
            if let Ok(sema) = st.objects.get_mut::<Semaphore>(id) {
                sema.queue.invalidate(tid);
            }
        })?;

        let granted = st.objects.get_mut::<Semaphore>(id)?.handoff.take(tid);
        debug_assert!(granted.is_some(), "semaphore waiter woken without a unit");
        Ok(())
    }

    /// Take one unit only if one is available
    pub fn semaphore_trywait(&self, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        if st.objects.get_mut::<Semaphore>(id)?.try_take() {
            Ok(())
        } else {
            Err(KernelError::Busy)
        }
    }

    /// Release `count` units, handing them to waiters first
    pub fn semaphore_post(&self, id: u32, count: i32) -> KernelResult<()> {
        if count < 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut st = self.lock();
        let sema = st.objects.get_mut::<Semaphore>(id)?;

        let waiters = sema.queue.len() as i64;
        if count as i64 + sema.count as i64 - waiters > sema.max as i64 {
            return Err(KernelError::Busy);
        }

        let mut remaining = count;
        while remaining > 0 {
            let Some(thread) = sema.queue.pop() else {
                sema.count += remaining;
                break;
            };
            sema.handoff.grant(thread.id(), ());
            thread.signal();
            remaining -= 1;
        }
        Ok(())
    }

    /// Available units
    pub fn semaphore_get_value(&self, id: u32) -> KernelResult<i32> {
        Ok(self.lock().objects.get::<Semaphore>(id)?.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::memory::FlatMemory;
    use std::thread;
    use std::time::{Duration, Instant};

    fn kernel() -> Arc<Kernel> {
        Arc::new(Kernel::new(KernelConfig::default(), Arc::new(FlatMemory::new(0x10))))
    }

    #[test]
    fn test_create_validation() {
        let kernel = kernel();
        assert_eq!(
            kernel.semaphore_create(Protocol::Fifo, 0, 0, 0),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.semaphore_create(Protocol::Fifo, 3, 2, 0),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.semaphore_create(Protocol::Fifo, -1, 2, 0),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.semaphore_create(Protocol::Retry, 0, 2, 0),
            Err(KernelError::InvalidArgument)
        );
        assert!(kernel.semaphore_create(Protocol::Priority, 2, 2, 0).is_ok());
    }

    #[test]
    fn test_trywait_and_post() {
        let kernel = kernel();
        let id = kernel.semaphore_create(Protocol::Fifo, 1, 3, 0).unwrap();

        kernel.semaphore_trywait(id).unwrap();
        assert_eq!(kernel.semaphore_trywait(id), Err(KernelError::Busy));
        kernel.semaphore_post(id, 3).unwrap();
        assert_eq!(kernel.semaphore_get_value(id), Ok(3));
    }

    #[test]
    fn test_post_rejects_negative_and_overcommit() {
        let kernel = kernel();
        let id = kernel.semaphore_create(Protocol::Fifo, 1, 2, 0).unwrap();

        assert_eq!(kernel.semaphore_post(id, -1), Err(KernelError::InvalidArgument));
        assert_eq!(kernel.semaphore_post(id, 2), Err(KernelError::Busy));
        assert_eq!(kernel.semaphore_get_value(id), Ok(1));
        kernel.semaphore_post(id, 1).unwrap();
        kernel.semaphore_post(id, 0).unwrap();
        assert_eq!(kernel.semaphore_get_value(id), Ok(2));
    }

    #[test]
    fn test_wait_timeout_leaves_queue() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let id = kernel.semaphore_create(Protocol::Fifo, 0, 1, 0).unwrap();

        let start = Instant::now();
        assert_eq!(kernel.semaphore_wait(&t, id, 15_000), Err(KernelError::TimedOut));
        assert!(start.elapsed() >= Duration::from_micros(15_000));
        assert!(!t.is_queued());

        // no waiter left, so the post lands in the count
        kernel.semaphore_post(id, 1).unwrap();
        assert_eq!(kernel.semaphore_get_value(id), Ok(1));
    }

    #[test]
    fn test_post_hands_unit_to_waiter() {
        let kernel = kernel();
        let a = kernel.threads().register(1000);
        let id = kernel.semaphore_create(Protocol::Fifo, 0, 1, 0).unwrap();

        let k = kernel.clone();
        let waiter = a.clone();
        let handle = thread::spawn(move || k.semaphore_wait(&waiter, id, 0));
        while !a.is_queued() {
            thread::sleep(Duration::from_millis(1));
        }

        kernel.semaphore_post(id, 1).unwrap();
        // the unit went to the waiter, not to the count
        assert_eq!(kernel.semaphore_get_value(id), Ok(0));
        assert_eq!(kernel.semaphore_trywait(id), Err(KernelError::Busy));
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(kernel.semaphore_get_value(id), Ok(0));
    }

    #[test]
    fn test_destroy_busy_with_waiter() {
        let kernel = kernel();
        let a = kernel.threads().register(1000);
        let id = kernel.semaphore_create(Protocol::Fifo, 0, 1, 0).unwrap();

        let k = kernel.clone();
        let waiter = a.clone();
        let handle = thread::spawn(move || k.semaphore_wait(&waiter, id, 0));
        while !a.is_queued() {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(kernel.semaphore_destroy(id), Err(KernelError::Busy));
        kernel.semaphore_post(id, 1).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(()));
        kernel.semaphore_destroy(id).unwrap();
        assert_eq!(kernel.semaphore_get_value(id), Err(KernelError::NotFound));
    }
}
