//! Guest syscall boundary for hlekern
//!
//! Translates raw syscall numbers and register frames into calls on a
//! [`hlekern_core::Kernel`], and kernel results back into guest status codes.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod dispatch;
pub mod status;
pub mod syscall;

pub use dispatch::dispatch;
pub use status::CellStatus;
pub use syscall::{Syscall, SyscallFrame};
