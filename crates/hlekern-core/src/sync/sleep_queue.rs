//! Protocol-ordered queue of blocked guest threads
//!
//! Every blocking primitive owns one or more sleep queues. Entries keep
//! arrival order; selection either takes the head (FIFO) or scans for the
//! numerically lowest priority (PRIORITY), breaking ties by arrival.

use crate::sync::Protocol;
use crate::thread::{GuestThread, ThreadId};
use std::collections::VecDeque;
use std::sync::Arc;

/// Ordered collection of waiting thread handles
pub struct SleepQueue {
    protocol: Protocol,
    waiters: VecDeque<Arc<GuestThread>>,
}

impl SleepQueue {
    /// Create an empty queue for the given protocol
    pub fn new(protocol: Protocol) -> Self {
        if protocol == Protocol::PriorityInherit {
            log::warn!("PRIORITY_INHERIT protocol is not implemented, selecting by PRIORITY");
        }
        Self {
            protocol,
            waiters: VecDeque::new(),
        }
    }

    /// Protocol fixed at creation
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Append a thread. No-op under RETRY.
    pub fn push(&mut self, thread: Arc<GuestThread>) {
        if self.protocol == Protocol::Retry {
            return;
        }
        debug_assert!(
            !thread.is_queued(),
            "thread {:?} is already in a sleep queue",
            thread.id()
        );
        thread.set_queued(true);
        self.waiters.push_back(thread);
    }

    /// Remove and return the next thread in protocol order
    pub fn pop(&mut self) -> Option<Arc<GuestThread>> {
        self.pop_matching(|_| true)
    }

    /// Remove and return the next thread in protocol order among those
    /// accepted by `accept`
    pub fn pop_matching(
        &mut self,
        mut accept: impl FnMut(&GuestThread) -> bool,
    ) -> Option<Arc<GuestThread>> {
        if self.protocol == Protocol::Retry {
            return None;
        }

        let mut chosen: Option<(usize, i32)> = None;
        for (index, thread) in self.waiters.iter().enumerate() {
            if !accept(thread) {
                continue;
            }
            if !self.protocol.by_priority() {
                chosen = Some((index, 0));
                break;
            }
            let priority = thread.priority();
            match chosen {
                Some((_, best)) if best <= priority => {}
                _ => chosen = Some((index, priority)),
            }
        }

        let (index, _) = chosen?;
        let thread = self.waiters.remove(index)?;
        thread.set_queued(false);
        Some(thread)
    }

    /// Remove a specific thread without selecting it
    ///
    /// Returns whether the thread was queued.
    pub fn invalidate(&mut self, id: ThreadId) -> bool {
        match self.waiters.iter().position(|t| t.id() == id) {
            Some(index) => {
                if let Some(thread) = self.waiters.remove(index) {
                    thread.set_queued(false);
                }
                true
            }
            None => false,
        }
    }

    /// Remove every thread in protocol order
    pub fn drain(&mut self) -> Vec<Arc<GuestThread>> {
        let mut drained = Vec::with_capacity(self.waiters.len());
        while let Some(thread) = self.pop() {
            drained.push(thread);
        }
        drained
    }

    /// Whether the thread is queued here
    pub fn contains(&self, id: ThreadId) -> bool {
        self.waiters.iter().any(|t| t.id() == id)
    }

    /// Number of queued threads
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether no thread is queued
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Queued thread IDs in arrival order
    pub fn ids(&self) -> Vec<ThreadId> {
        self.waiters.iter().map(|t| t.id()).collect()
    }
}

impl Drop for SleepQueue {
    fn drop(&mut self) {
        for thread in self.waiters.drain(..) {
            thread.set_queued(false);
        }
    }
}
