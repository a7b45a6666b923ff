//! Event flag: a 64-bit pattern waited on with AND/OR predicates

use crate::error::{KernelError, KernelResult};
use crate::kernel::{deadline_after, Kernel};
use crate::sync::{Handoff, Protocol, SleepQueue};
use crate::thread::{GuestThread, ThreadId};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// How many threads may wait on an event flag at once
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventFlagType {
    /// One waiter at a time
    Single,
    /// Any number of waiters
    Multiple,
}

impl EventFlagType {
    /// Guest value of `Single`
    pub const SINGLE: u32 = 0x10000;
    /// Guest value of `Multiple`
    pub const MULTIPLE: u32 = 0x20000;

    /// Decode a guest type value
    pub fn from_raw(raw: u32) -> KernelResult<Self> {
        match raw {
            Self::SINGLE => Ok(EventFlagType::Single),
            Self::MULTIPLE => Ok(EventFlagType::Multiple),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// Predicate combining the requested bits
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Combine {
    /// Every requested bit must be set
    And,
    /// At least one requested bit must be set
    Or,
}

/// What a satisfied wait does to the pattern
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClearMode {
    /// Leave the pattern alone
    None,
    /// Clear the requested bits
    Bits,
    /// Clear the whole pattern
    All,
}

/// Decoded wait mode
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WaitMode {
    /// Predicate
    pub combine: Combine,
    /// Clear behavior on success
    pub clear: ClearMode,
}

impl WaitMode {
    /// Guest bit for AND
    pub const AND: u32 = 0x01;
    /// Guest bit for OR
    pub const OR: u32 = 0x02;
    /// Guest bit for clearing the requested bits
    pub const CLEAR: u32 = 0x10;
    /// Guest bit for clearing the whole pattern
    pub const CLEAR_ALL: u32 = 0x20;

    /// Decode a guest mode value
    pub fn from_raw(raw: u32) -> KernelResult<Self> {
        let combine = match raw & 0x0F {
            Self::AND => Combine::And,
            Self::OR => Combine::Or,
            _ => return Err(KernelError::InvalidArgument),
        };
        let clear = match raw & !0x0F {
            0 => ClearMode::None,
            Self::CLEAR => ClearMode::Bits,
            Self::CLEAR_ALL => ClearMode::All,
            _ => return Err(KernelError::InvalidArgument),
        };
        Ok(Self { combine, clear })
    }

    /// Whether `pattern` satisfies a request for `bitptn`
    pub fn matches(self, pattern: u64, bitptn: u64) -> bool {
        match self.combine {
            Combine::And => pattern & bitptn == bitptn,
            Combine::Or => pattern & bitptn != 0,
        }
    }

    /// Pattern left behind by a satisfied request for `bitptn`
    pub fn cleared(self, pattern: u64, bitptn: u64) -> u64 {
        match self.clear {
            ClearMode::None => pattern,
            ClearMode::Bits => pattern & !bitptn,
            ClearMode::All => 0,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct Request {
    bitptn: u64,
    mode: WaitMode,
}

/// Event flag
pub struct EventFlag {
    pattern: u64,
    kind: EventFlagType,
    queue: SleepQueue,

    /// Outstanding requests of queued threads
    requests: FxHashMap<ThreadId, Request>,

    /// Outcomes delivered to woken waiters
    results: Handoff<KernelResult<u64>>,

    name: u64,
}

impl EventFlag {
    /// Create an event flag holding `pattern`
    pub fn new(pattern: u64, protocol: Protocol, kind: EventFlagType, name: u64) -> Self {
        Self {
            pattern,
            kind,
            queue: SleepQueue::new(protocol),
            requests: FxHashMap::default(),
            results: Handoff::new(),
            name,
        }
    }

    /// Current pattern
    pub fn pattern(&self) -> u64 {
        self.pattern
    }

    /// Waiter multiplicity
    pub fn kind(&self) -> EventFlagType {
        self.kind
    }

    /// Waiting threads
    pub fn queue(&self) -> &SleepQueue {
        &self.queue
    }

    /// Guest-supplied name
    pub fn name(&self) -> u64 {
        self.name
    }

    /// Satisfy `mode`/`bitptn` against the current pattern, returning the
    /// pattern as it was before clearing
    fn try_satisfy(&mut self, bitptn: u64, mode: WaitMode) -> Option<u64> {
        if !mode.matches(self.pattern, bitptn) {
            return None;
        }
        let seen = self.pattern;
        self.pattern = mode.cleared(seen, bitptn);
        Some(seen)
    }

    /// Wake the first satisfied waiter in protocol order
    fn wake_one(&mut self) {
        let pattern = self.pattern;
        let requests = &self.requests;
        let Some(thread) = self.queue.pop_matching(|t| {
            requests
                .get(&t.id())
                .is_some_and(|r| r.mode.matches(pattern, r.bitptn))
        }) else {
            return;
        };

        let tid = thread.id();
        if let Some(request) = self.requests.remove(&tid) {
            let seen = self.try_satisfy(request.bitptn, request.mode);
            self.results.grant(tid, seen.ok_or(KernelError::Busy));
            thread.signal();
        }
    }
}

impl Kernel {
    /// Create an event flag
    pub fn event_flag_create(
        &self,
        pattern: u64,
        protocol: Protocol,
        kind: EventFlagType,
        name: u64,
    ) -> KernelResult<u32> {
        if !matches!(protocol, Protocol::Fifo | Protocol::Priority) {
            return Err(KernelError::InvalidArgument);
        }
        self.lock()
            .objects
            .create(EventFlag::new(pattern, protocol, kind, name))
    }

    /// Destroy an event flag with no waiters
    pub fn event_flag_destroy(&self, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let flag = st.objects.get::<EventFlag>(id)?;
        if !flag.queue.is_empty() || !flag.results.is_empty() {
            return Err(KernelError::Busy);
        }
        st.objects.remove::<EventFlag>(id).map(drop)
    }

    /// Wait until the pattern satisfies `bitptn` under `mode`
    ///
    /// Returns the pattern as observed before the mode's clear was applied.
    pub fn event_flag_wait(
        &self,
        thread: &Arc<GuestThread>,
        id: u32,
        bitptn: u64,
        mode: WaitMode,
        timeout: u64,
    ) -> KernelResult<u64> {
        if bitptn == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let deadline = deadline_after(timeout);
        let mut st = self.lock();
        let flag = st.objects.get_mut::<EventFlag>(id)?;
        if flag.kind == EventFlagType::Single && !flag.queue.is_empty() {
            return Err(KernelError::Permission);
        }
        if let Some(seen) = flag.try_satisfy(bitptn, mode) {
            return Ok(seen);
        }

        let tid = thread.id();
        flag.requests.insert(tid, Request { bitptn, mode });
        flag.queue.push(thread.clone());

        self.block_on(&mut st, thread, deadline, |st| {
            if let Ok(flag) = st.objects.get_mut::<EventFlag>(id) {
                flag.queue.invalidate(tid);
                flag.requests.remove(&tid);
            }
        })?;

        st.objects
            .get_mut::<EventFlag>(id)?
            .results
            .take(tid)
            .unwrap_or(Err(KernelError::Canceled))
    }

    /// Test the pattern without waiting
    pub fn event_flag_trywait(&self, id: u32, bitptn: u64, mode: WaitMode) -> KernelResult<u64> {
        if bitptn == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.lock()
            .objects
            .get_mut::<EventFlag>(id)?
            .try_satisfy(bitptn, mode)
            .ok_or(KernelError::Busy)
    }

    /// OR `bitptn` into the pattern and wake one satisfied waiter
    pub fn event_flag_set(&self, id: u32, bitptn: u64) -> KernelResult<()> {
        let mut st = self.lock();
        let flag = st.objects.get_mut::<EventFlag>(id)?;
        flag.pattern |= bitptn;
        flag.wake_one();
        Ok(())
    }

    /// Keep only the bits of the pattern that are also in `bitptn`
    pub fn event_flag_clear(&self, id: u32, bitptn: u64) -> KernelResult<()> {
        self.lock().objects.get_mut::<EventFlag>(id)?.pattern &= bitptn;
        Ok(())
    }

    /// Wake every waiter with `Canceled`; returns how many were woken
    pub fn event_flag_cancel(&self, id: u32) -> KernelResult<usize> {
        let mut st = self.lock();
        let flag = st.objects.get_mut::<EventFlag>(id)?;
        let woken = flag.queue.drain();
        for thread in &woken {
            flag.requests.remove(&thread.id());
            flag.results.grant(thread.id(), Err(KernelError::Canceled));
            thread.signal();
        }
        Ok(woken.len())
    }

    /// Current pattern
    pub fn event_flag_get(&self, id: u32) -> KernelResult<u64> {
        Ok(self.lock().objects.get::<EventFlag>(id)?.pattern)
    }
}
