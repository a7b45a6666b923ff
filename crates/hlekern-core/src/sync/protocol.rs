//! Wake-order protocols

use crate::error::{KernelError, KernelResult};

/// Wake-order policy of a primitive's sleep queue, fixed at creation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// First come, first served
    Fifo,
    /// Lowest priority value first, ties in arrival order
    Priority,
    /// Accepted for compatibility; selects exactly like `Priority`
    PriorityInherit,
    /// Never blocks: the caller gets `Busy` and retries itself
    Retry,
}

impl Protocol {
    /// Guest value of `Fifo`
    pub const FIFO: u32 = 1;
    /// Guest value of `Priority`
    pub const PRIORITY: u32 = 2;
    /// Guest value of `PriorityInherit`
    pub const PRIORITY_INHERIT: u32 = 3;
    /// Guest value of `Retry`
    pub const RETRY: u32 = 4;

    /// Decode a guest protocol value
    pub fn from_raw(raw: u32) -> KernelResult<Self> {
        match raw {
            Self::FIFO => Ok(Protocol::Fifo),
            Self::PRIORITY => Ok(Protocol::Priority),
            Self::PRIORITY_INHERIT => Ok(Protocol::PriorityInherit),
            Self::RETRY => Ok(Protocol::Retry),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Decode a guest protocol value for a primitive that always blocks
    pub fn blocking_from_raw(raw: u32) -> KernelResult<Self> {
        match Self::from_raw(raw)? {
            Protocol::Retry => Err(KernelError::InvalidArgument),
            protocol => Ok(protocol),
        }
    }

    /// Decode a guest protocol value for a primitive that only knows
    /// FIFO and PRIORITY (event flags, event queues)
    pub fn ordered_from_raw(raw: u32) -> KernelResult<Self> {
        match Self::from_raw(raw)? {
            protocol @ (Protocol::Fifo | Protocol::Priority) => Ok(protocol),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Guest value of this protocol
    pub fn as_raw(self) -> u32 {
        match self {
            Protocol::Fifo => Self::FIFO,
            Protocol::Priority => Self::PRIORITY,
            Protocol::PriorityInherit => Self::PRIORITY_INHERIT,
            Protocol::Retry => Self::RETRY,
        }
    }

    /// Whether selection scans for the most urgent priority
    pub fn by_priority(self) -> bool {
        matches!(self, Protocol::Priority | Protocol::PriorityInherit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_values() {
        for raw in 1..=4 {
            assert_eq!(Protocol::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(Protocol::from_raw(0), Err(KernelError::InvalidArgument));
        assert_eq!(Protocol::from_raw(5), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_blocking_rejects_retry() {
        assert_eq!(
            Protocol::blocking_from_raw(Protocol::RETRY),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            Protocol::blocking_from_raw(Protocol::PRIORITY_INHERIT),
            Ok(Protocol::PriorityInherit)
        );
    }

    #[test]
    fn test_ordered_accepts_fifo_and_priority_only() {
        assert!(Protocol::ordered_from_raw(Protocol::FIFO).is_ok());
        assert!(Protocol::ordered_from_raw(Protocol::PRIORITY).is_ok());
        assert!(Protocol::ordered_from_raw(Protocol::PRIORITY_INHERIT).is_err());
        assert!(Protocol::ordered_from_raw(Protocol::RETRY).is_err());
    }

    #[test]
    fn test_priority_inherit_selects_by_priority() {
        assert!(Protocol::PriorityInherit.by_priority());
        assert!(!Protocol::Fifo.by_priority());
    }
}
