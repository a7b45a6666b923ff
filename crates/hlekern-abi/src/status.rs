//! 32-bit guest status codes

use hlekern_core::{KernelError, KernelResult};
use std::fmt;

/// Status value returned to the guest in the first result register
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct CellStatus(pub u32);

impl CellStatus {
    /// Success
    pub const OK: Self = Self(0);
    /// Resource temporarily unavailable
    pub const EAGAIN: Self = Self(0x8001_0001);
    /// Invalid argument
    pub const EINVAL: Self = Self(0x8001_0002);
    /// Not implemented
    pub const ENOSYS: Self = Self(0x8001_0003);
    /// No such object
    pub const ESRCH: Self = Self(0x8001_0005);
    /// Deadlock
    pub const EDEADLK: Self = Self(0x8001_0008);
    /// Not permitted
    pub const EPERM: Self = Self(0x8001_0009);
    /// Busy
    pub const EBUSY: Self = Self(0x8001_000A);
    /// Timed out
    pub const ETIMEDOUT: Self = Self(0x8001_000B);
    /// Bad address
    pub const EFAULT: Self = Self(0x8001_000D);
    /// Kernel resource exhausted
    pub const EKRESOURCE: Self = Self(0x8001_0011);
    /// Canceled
    pub const ECANCELED: Self = Self(0x8001_0013);
    /// Already exists
    pub const EEXIST: Self = Self(0x8001_0014);
    /// Already connected
    pub const EISCONN: Self = Self(0x8001_0015);
    /// Not connected
    pub const ENOTCONN: Self = Self(0x8001_0016);

    /// Raw guest value
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Whether this is a failure code
    pub fn is_error(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Status reported for the outcome of an operation
    pub fn from_result<T>(result: &KernelResult<T>) -> Self {
        match result {
            Ok(_) => Self::OK,
            Err(err) => Self::from(*err),
        }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::OK => "CELL_OK",
            Self::EAGAIN => "CELL_EAGAIN",
            Self::EINVAL => "CELL_EINVAL",
            Self::ENOSYS => "CELL_ENOSYS",
            Self::ESRCH => "CELL_ESRCH",
            Self::EDEADLK => "CELL_EDEADLK",
            Self::EPERM => "CELL_EPERM",
            Self::EBUSY => "CELL_EBUSY",
            Self::ETIMEDOUT => "CELL_ETIMEDOUT",
            Self::EFAULT => "CELL_EFAULT",
            Self::EKRESOURCE => "CELL_EKRESOURCE",
            Self::ECANCELED => "CELL_ECANCELED",
            Self::EEXIST => "CELL_EEXIST",
            Self::EISCONN => "CELL_EISCONN",
            Self::ENOTCONN => "CELL_ENOTCONN",
            _ => return None,
        })
    }
}

impl From<KernelError> for CellStatus {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::NotFound => Self::ESRCH,
            KernelError::Busy => Self::EBUSY,
            KernelError::Permission => Self::EPERM,
            KernelError::Deadlock => Self::EDEADLK,
            KernelError::RecursionOverflow => Self::EKRESOURCE,
            KernelError::InvalidArgument => Self::EINVAL,
            KernelError::TimedOut => Self::ETIMEDOUT,
            KernelError::Canceled => Self::ECANCELED,
            // the guest is being torn down; it must not see a failure
            KernelError::Shutdown => Self::OK,
            KernelError::NotConnected => Self::ENOTCONN,
            KernelError::IsConnected => Self::EISCONN,
            KernelError::Full => Self::EBUSY,
            KernelError::Exists => Self::EEXIST,
            KernelError::TableFull => Self::EAGAIN,
            KernelError::Fault(_) => Self::EFAULT,
        }
    }
}

impl fmt::Debug for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "CellStatus({:#010x})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(CellStatus::from(KernelError::NotFound), CellStatus::ESRCH);
        assert_eq!(CellStatus::from(KernelError::Full), CellStatus::EBUSY);
        assert_eq!(CellStatus::from(KernelError::RecursionOverflow), CellStatus::EKRESOURCE);
        assert_eq!(CellStatus::from(KernelError::TableFull), CellStatus::EAGAIN);
        assert_eq!(CellStatus::from(KernelError::Fault(0x10)), CellStatus::EFAULT);
        assert_eq!(CellStatus::from(KernelError::Canceled), CellStatus::ECANCELED);
    }

    #[test]
    fn test_shutdown_is_not_an_error() {
        let status = CellStatus::from(KernelError::Shutdown);
        assert_eq!(status, CellStatus::OK);
        assert!(!status.is_error());
    }

    #[test]
    fn test_every_error_sets_high_bit() {
        let errors = [
            KernelError::NotFound,
            KernelError::Busy,
            KernelError::Permission,
            KernelError::Deadlock,
            KernelError::InvalidArgument,
            KernelError::TimedOut,
            KernelError::NotConnected,
            KernelError::IsConnected,
            KernelError::Exists,
        ];
        for err in errors {
            assert!(CellStatus::from(err).is_error(), "{:?}", err);
        }
    }

    #[test]
    fn test_debug_names() {
        assert_eq!(format!("{:?}", CellStatus::ETIMEDOUT), "CELL_ETIMEDOUT");
        assert_eq!(format!("{:?}", CellStatus(0x1234)), "CellStatus(0x00001234)");
    }
}
