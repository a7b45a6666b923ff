//! Blocking synchronization primitives
//!
//! Every primitive is a kernel object stored in the [`ObjectTable`](crate::object::ObjectTable)
//! and operated on through methods of [`Kernel`](crate::Kernel). Waiters
//! park in protocol-ordered [`SleepQueue`]s.

mod cond;
mod event_flag;
mod event_queue;
mod handoff;
pub(crate) mod lock;
pub mod lwcond;
pub mod lwmutex;
pub mod mutex;
mod protocol;
mod rwlock;
mod semaphore;
mod sleep_queue;

pub use cond::Cond;
pub use event_flag::{ClearMode, Combine, EventFlag, EventFlagType, WaitMode};
pub use event_queue::{Event, EventPort, EventPortKind, EventQueue, EventQueueKind};
pub use handoff::Handoff;
pub use lock::Ownership;
pub use lwcond::{LwCond, LwCondControl};
pub use lwmutex::{LwMutex, LwMutexControl, LWMUTEX_DEAD, LWMUTEX_FREE};
pub use mutex::{recursive_from_raw, Mutex, SYNC_NOT_RECURSIVE, SYNC_RECURSIVE};
pub use protocol::Protocol;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use sleep_queue::SleepQueue;
