//! Guest kernel synchronization for high-level emulation
//!
//! This crate reimplements, on host threads, the blocking primitives a guest
//! binary expects from its kernel:
//! - Mutex and lightweight (guest-memory resident) mutex
//! - Condition variable and lightweight condition variable
//! - Counting semaphore
//! - Reader/writer lock
//! - Event flag
//! - Event queue and event port
//!
//! All object state sits behind one kernel lock owned by [`Kernel`]. Each
//! guest thread blocks on its own wait handle, and every primitive orders
//! its waiters through a [`SleepQueue`](sync::SleepQueue).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod object;
pub mod sync;
pub mod thread;

pub use config::{ConfigError, KernelConfig};
pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, KernelState};
pub use memory::{FlatMemory, GuestMemory};
pub use object::{ObjectTable, ObjectType};
pub use sync::{Event, EventFlagType, EventPortKind, EventQueueKind, Protocol, WaitMode};
pub use thread::{GuestThread, ThreadId, ThreadRegistry};
