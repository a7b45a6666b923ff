//! Direct hand-over of a unit or value to one woken waiter

use crate::thread::ThreadId;
use rustc_hash::FxHashMap;

/// Grants addressed to specific threads
///
/// A waker pops a thread from a sleep queue, records what it handed over
/// here and signals the thread; the woken thread takes its grant back out
/// once it re-acquires the kernel lock. Lives inside the kernel state, so
/// grants are only touched under the kernel lock.
pub struct Handoff<T> {
    slots: FxHashMap<ThreadId, T>,
}

impl<T> Handoff<T> {
    /// Create an empty handoff table
    pub fn new() -> Self {
        Self {
            slots: FxHashMap::default(),
        }
    }

    /// Authorize `thread` to proceed with `value`
    pub fn grant(&mut self, thread: ThreadId, value: T) {
        let previous = self.slots.insert(thread, value);
        debug_assert!(previous.is_none(), "second grant for {:?}", thread);
    }

    /// Take the grant addressed to `thread`, if any
    pub fn take(&mut self, thread: ThreadId) -> Option<T> {
        self.slots.remove(&thread)
    }

    /// Whether `thread` holds a grant
    pub fn is_granted(&self, thread: ThreadId) -> bool {
        self.slots.contains_key(&thread)
    }

    /// Number of outstanding grants
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no grant is outstanding
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}
