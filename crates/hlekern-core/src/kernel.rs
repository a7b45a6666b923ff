//! Kernel context: the process-wide kernel lock and the blocking primitive
//!
//! All kernel-object state lives in [`KernelState`] behind a single
//! `parking_lot::Mutex`. A blocking operation enqueues the caller, then
//! parks on the caller's own condvar *with the kernel lock as its mutex*,
//! which releases the lock for the duration of the sleep and re-acquires it
//! before the caller looks at any state again.

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::memory::GuestMemory;
use crate::object::ObjectTable;
use crate::thread::{GuestThread, ThreadRegistry};
use parking_lot::{Mutex as ParkingLotMutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State guarded by the kernel lock
pub struct KernelState {
    /// Live kernel objects
    pub objects: ObjectTable,

    /// Event queue IPC keys -> queue ID
    pub(crate) ipc_keys: FxHashMap<u64, u32>,
}

impl KernelState {
    fn new(config: &KernelConfig) -> Self {
        Self {
            objects: ObjectTable::new(config.max_objects),
            ipc_keys: FxHashMap::default(),
        }
    }
}

/// Synchronization kernel of one emulated process
pub struct Kernel {
    /// The kernel lock
    state: ParkingLotMutex<KernelState>,

    /// Guest threads known to this kernel
    threads: ThreadRegistry,

    /// Guest memory holding lightweight control blocks
    memory: Arc<dyn GuestMemory>,

    /// Tunables
    config: KernelConfig,

    /// Set once the emulator begins shutting down
    stopping: AtomicBool,
}

impl Kernel {
    /// Create a kernel over the given guest memory
    pub fn new(config: KernelConfig, memory: Arc<dyn GuestMemory>) -> Self {
        Self {
            state: ParkingLotMutex::new(KernelState::new(&config)),
            threads: ThreadRegistry::new(),
            memory,
            config,
            stopping: AtomicBool::new(false),
        }
    }

    /// Thread registry
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Guest memory
    pub fn memory(&self) -> &dyn GuestMemory {
        &*self.memory
    }

    /// Configuration
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Run `f` with the kernel lock held
    pub fn with_kernel_lock<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock()
    }

    /// Number of live kernel objects
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Begin emulator shutdown
    ///
    /// Every thread blocked in a kernel wait leaves its queue and returns
    /// [`KernelError::Shutdown`]; later waits fail the same way.
    pub fn shutdown(&self) {
        let _guard = self.state.lock();
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("kernel shutting down, waking {} threads", self.threads.count());
        for thread in self.threads.all() {
            thread.nudge();
        }
    }

    /// Whether shutdown has begun
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Sleep until a waker signals `thread`, the deadline passes or the
    /// kernel stops
    ///
    /// Must be called with the kernel lock held and `thread` already linked
    /// into the waited-on queue. On timeout or shutdown `abandon` runs
    /// under the lock to unlink the thread before the error is returned.
    pub(crate) fn block_on(
        &self,
        guard: &mut MutexGuard<'_, KernelState>,
        thread: &GuestThread,
        deadline: Option<Instant>,
        abandon: impl FnOnce(&mut KernelState),
    ) -> KernelResult<()> {
        loop {
            if thread.take_signal() {
                log::trace!("thread {:#x} woken", thread.id().as_u32());
                return Ok(());
            }
            if self.is_stopping() {
                abandon(&mut **guard);
                return Err(KernelError::Shutdown);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    abandon(&mut **guard);
                    return Err(KernelError::TimedOut);
                }
            }
            log::trace!("thread {:#x} blocking", thread.id().as_u32());
            thread.park(guard, deadline);
        }
    }
}

/// Deadline for a guest timeout in microseconds (0 = wait forever)
pub(crate) fn deadline_after(timeout_us: u64) -> Option<Instant> {
    if timeout_us == 0 {
        return None;
    }
    Instant::now().checked_add(Duration::from_micros(timeout_us))
}
