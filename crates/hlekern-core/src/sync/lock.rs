//! Shared ownership machinery for mutexes and lightweight mutexes
//!
//! Both mutex flavours keep the same state (owner + recursion count + sleep
//! queue); they differ only in where owner and count are stored. A
//! [`MutexRef`] names either flavour, and the kernel reads it into an
//! [`Ownership`] value, applies the transition and writes it back.

use crate::error::{KernelError, KernelResult};
use crate::kernel::{Kernel, KernelState};
use crate::sync::lwmutex::LwMutexControl;
use crate::sync::{LwMutex, Mutex, Protocol, SleepQueue};
use crate::thread::{GuestThread, ThreadId};
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Instant;

/// Owner and recursion count of a mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ownership {
    /// Owning thread, if any
    pub owner: Option<ThreadId>,
    /// Lock depth; 0 exactly when unowned
    pub recursion: u32,
}

impl Ownership {
    /// Ownership granted fresh to `owner` (or cleared)
    pub fn handed_to(owner: Option<ThreadId>) -> Self {
        Self {
            owner,
            recursion: u32::from(owner.is_some()),
        }
    }

    /// Attempt to take the lock for `caller` without blocking
    pub fn try_acquire(
        &mut self,
        caller: ThreadId,
        recursive: bool,
        max_recursion: u32,
    ) -> KernelResult<()> {
        match self.owner {
            None => {
                *self = Self::handed_to(Some(caller));
                Ok(())
            }
            Some(owner) if owner == caller => {
                if !recursive {
                    return Err(KernelError::Deadlock);
                }
                if self.recursion >= max_recursion {
                    return Err(KernelError::RecursionOverflow);
                }
                self.recursion += 1;
                Ok(())
            }
            Some(_) => Err(KernelError::Busy),
        }
    }

    /// Drop one level of the lock held by `caller`
    ///
    /// Returns `true` once the lock is fully released.
    pub fn release(&mut self, caller: ThreadId) -> KernelResult<bool> {
        if self.owner != Some(caller) {
            return Err(KernelError::Permission);
        }
        debug_assert!(self.recursion > 0, "owned mutex with zero recursion");
        self.recursion = self.recursion.saturating_sub(1);
        if self.recursion == 0 {
            self.owner = None;
            return Ok(true);
        }
        Ok(false)
    }
}

/// A mutex of either flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutexRef {
    /// Kernel mutex by ID
    Heavy(u32),
    /// Lightweight mutex by control block address and kernel queue ID
    Light { control: u32, queue: u32 },
}

/// Snapshot of a mutex taken under the kernel lock
pub(crate) struct LockView {
    pub ownership: Ownership,
    pub recursive: bool,
    pub protocol: Protocol,
}

impl Kernel {
    /// Resolve a lightweight mutex control block into a reference
    pub(crate) fn lwmutex_ref(&self, control: u32) -> KernelResult<MutexRef> {
        let block = LwMutexControl::read(self.memory(), control)?;
        if block.is_dead() {
            return Err(KernelError::NotFound);
        }
        Ok(MutexRef::Light {
            control,
            queue: block.sleep_queue,
        })
    }

    pub(crate) fn load_lock(&self, st: &KernelState, mutex: MutexRef) -> KernelResult<LockView> {
        match mutex {
            MutexRef::Heavy(id) => {
                let m = st.objects.get::<Mutex>(id)?;
                Ok(LockView {
                    ownership: m.ownership(),
                    recursive: m.is_recursive(),
                    protocol: m.protocol(),
                })
            }
            MutexRef::Light { control, queue } => {
                let m = st.objects.get::<LwMutex>(queue)?;
                let block = LwMutexControl::read(self.memory(), control)?;
                if block.is_dead() || m.control() != control {
                    return Err(KernelError::NotFound);
                }
                Ok(LockView {
                    ownership: block.ownership(),
                    recursive: m.is_recursive(),
                    protocol: m.protocol(),
                })
            }
        }
    }

    pub(crate) fn store_lock(
        &self,
        st: &mut KernelState,
        mutex: MutexRef,
        ownership: Ownership,
    ) -> KernelResult<()> {
        debug_assert_eq!(ownership.owner.is_none(), ownership.recursion == 0);
        match mutex {
            MutexRef::Heavy(id) => {
                st.objects.get_mut::<Mutex>(id)?.set_ownership(ownership);
                Ok(())
            }
            MutexRef::Light { control, queue } => {
                let waiters = st.objects.get::<LwMutex>(queue)?.queue().len();
                LwMutexControl::store_ownership(self.memory(), control, ownership, waiters as u32)
            }
        }
    }

    pub(crate) fn lock_queue<'a>(
        st: &'a mut KernelState,
        mutex: MutexRef,
    ) -> KernelResult<&'a mut SleepQueue> {
        match mutex {
            MutexRef::Heavy(id) => Ok(st.objects.get_mut::<Mutex>(id)?.queue_mut()),
            MutexRef::Light { queue, .. } => Ok(st.objects.get_mut::<LwMutex>(queue)?.queue_mut()),
        }
    }

    /// Mirror the waiter count of a lightweight mutex into its control block
    fn refresh_waiters(&self, st: &KernelState, mutex: MutexRef) -> KernelResult<()> {
        if let MutexRef::Light { control, queue } = mutex {
            let waiters = st.objects.get::<LwMutex>(queue)?.queue().len();
            LwMutexControl::store_waiters(self.memory(), control, waiters as u32)?;
        }
        Ok(())
    }

    /// Take the lock without blocking
    pub(crate) fn try_acquire_lock(
        &self,
        st: &mut KernelState,
        mutex: MutexRef,
        caller: ThreadId,
    ) -> KernelResult<()> {
        let mut view = self.load_lock(st, mutex)?;
        view.ownership
            .try_acquire(caller, view.recursive, self.config().max_recursion)?;
        self.store_lock(st, mutex, view.ownership)
    }

    /// Take the lock, blocking until it is handed over or `deadline` passes
    pub(crate) fn acquire_lock(
        &self,
        guard: &mut MutexGuard<'_, KernelState>,
        mutex: MutexRef,
        thread: &Arc<GuestThread>,
        deadline: Option<Instant>,
    ) -> KernelResult<()> {
        match self.try_acquire_lock(guard, mutex, thread.id()) {
            Err(KernelError::Busy) => {}
            other => return other,
        }
        if self.load_lock(guard, mutex)?.protocol == Protocol::Retry {
            return Err(KernelError::Busy);
        }

        Self::lock_queue(guard, mutex)?.push(thread.clone());
        self.refresh_waiters(guard, mutex)?;

        let tid = thread.id();
        self.block_on(guard, thread, deadline, |st| {
            if let Ok(queue) = Self::lock_queue(st, mutex) {
                queue.invalidate(tid);
            }
            // the wait's own outcome is reported; a failed mirror is only logged
            if let Err(err) = self.refresh_waiters(st, mutex) {
                log::warn!("waiter count of {:?} not updated: {}", mutex, err);
            }
        })?;

        debug_assert_eq!(
            self.load_lock(guard, mutex).map(|v| v.ownership.owner),
            Ok(Some(tid)),
            "woken without ownership"
        );
        Ok(())
    }

    /// Drop one level of the lock; on full release hand it to the next
    /// waiter in protocol order
    pub(crate) fn release_lock(
        &self,
        st: &mut KernelState,
        mutex: MutexRef,
        caller: ThreadId,
    ) -> KernelResult<()> {
        let mut view = self.load_lock(st, mutex)?;
        if view.ownership.release(caller)? {
            self.hand_off_lock(st, mutex)
        } else {
            self.store_lock(st, mutex, view.ownership)
        }
    }

    /// Give a released lock to the next waiter, or leave it unowned
    pub(crate) fn hand_off_lock(&self, st: &mut KernelState, mutex: MutexRef) -> KernelResult<()> {
        let next = Self::lock_queue(st, mutex)?.pop();
        self.store_lock(st, mutex, Ownership::handed_to(next.as_ref().map(|t| t.id())))?;
        if let Some(next) = next {
            log::trace!("mutex {:?} handed to {:#x}", mutex, next.id().as_u32());
            next.signal();
        }
        Ok(())
    }

    /// Condition-variable wait over either mutex flavour
    ///
    /// Releases the mutex completely (remembering its depth), parks on the
    /// queue selected by `cond_queue`, then re-acquires the mutex through
    /// the contended path and restores the depth. A timeout is reported
    /// only after the mutex is held again; shutdown returns at once.
    pub(crate) fn cond_wait_on(
        &self,
        guard: &mut MutexGuard<'_, KernelState>,
        mutex: MutexRef,
        thread: &Arc<GuestThread>,
        deadline: Option<Instant>,
        cond_queue: impl Fn(&mut KernelState) -> KernelResult<&mut SleepQueue>,
    ) -> KernelResult<()> {
        let tid = thread.id();
        let view = self.load_lock(guard, mutex)?;
        if view.ownership.owner != Some(tid) {
            return Err(KernelError::Permission);
        }
        let saved = view.ownership.recursion;

        cond_queue(guard)?.push(thread.clone());
        self.hand_off_lock(guard, mutex)?;

        let waited = self.block_on(guard, thread, deadline, |st| {
            if let Ok(queue) = cond_queue(st) {
                queue.invalidate(tid);
            }
        });
        if waited == Err(KernelError::Shutdown) {
            return waited;
        }

        self.acquire_lock(guard, mutex, thread, None)?;
        let mut view = self.load_lock(guard, mutex)?;
        view.ownership.recursion = saved;
        self.store_lock(guard, mutex, view.ownership)?;

        waited
    }
}
