//! Syscall numbers and the register frame
//!
//! Numbers follow the guest's lv2 numbering for the synchronization
//! services. Argument layouts are listed next to each handler in
//! [`dispatch`](crate::dispatch).

/// Synchronization syscall codes
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Syscall {
    // ===== Event flag =====
    /// Create an event flag
    EventFlagCreate = 82,
    /// Destroy an event flag
    EventFlagDestroy = 83,
    /// Wait on an event flag
    EventFlagWait = 85,
    /// Test an event flag without waiting
    EventFlagTrywait = 86,
    /// Set event flag bits
    EventFlagSet = 87,
    /// Mask event flag bits
    EventFlagClear = 118,
    /// Cancel every event flag waiter
    EventFlagCancel = 132,
    /// Read an event flag pattern
    EventFlagGet = 139,

    // ===== Semaphore =====
    /// Create a semaphore
    SemaphoreCreate = 90,
    /// Destroy a semaphore
    SemaphoreDestroy = 91,
    /// Wait on a semaphore
    SemaphoreWait = 92,
    /// Take a unit without waiting
    SemaphoreTrywait = 93,
    /// Release units
    SemaphorePost = 94,
    /// Read the unit count
    SemaphoreGetValue = 114,

    // ===== Lightweight mutex =====
    /// Initialize a lightweight mutex
    LwMutexCreate = 95,
    /// Destroy a lightweight mutex
    LwMutexDestroy = 96,
    /// Lock a lightweight mutex
    LwMutexLock = 97,
    /// Unlock a lightweight mutex
    LwMutexUnlock = 98,
    /// Lock a lightweight mutex without waiting
    LwMutexTrylock = 99,

    // ===== Mutex =====
    /// Create a mutex
    MutexCreate = 100,
    /// Destroy a mutex
    MutexDestroy = 101,
    /// Lock a mutex
    MutexLock = 102,
    /// Lock a mutex without waiting
    MutexTrylock = 103,
    /// Unlock a mutex
    MutexUnlock = 104,

    // ===== Condition variable =====
    /// Create a condition variable
    CondCreate = 105,
    /// Destroy a condition variable
    CondDestroy = 106,
    /// Wait on a condition variable
    CondWait = 107,
    /// Wake one waiter
    CondSignal = 108,
    /// Wake every waiter
    CondSignalAll = 109,
    /// Wake a specific waiter
    CondSignalTo = 110,

    // ===== Lightweight condition variable =====
    /// Initialize a lightweight condition variable
    LwCondCreate = 111,
    /// Destroy a lightweight condition variable
    LwCondDestroy = 112,
    /// Wait on a lightweight condition variable
    LwCondWait = 113,
    /// Wake one waiter, or a specific one
    LwCondSignal = 115,
    /// Wake every waiter
    LwCondSignalAll = 116,

    // ===== Reader/writer lock =====
    /// Create a reader/writer lock
    RwLockCreate = 120,
    /// Destroy a reader/writer lock
    RwLockDestroy = 121,
    /// Acquire shared access
    RwLockRlock = 122,
    /// Acquire shared access without waiting
    RwLockTryrlock = 123,
    /// Release shared access
    RwLockRunlock = 124,
    /// Acquire exclusive access
    RwLockWlock = 125,
    /// Acquire exclusive access without waiting
    RwLockTrywlock = 126,
    /// Release exclusive access
    RwLockWunlock = 127,

    // ===== Event queue / port =====
    /// Create an event queue
    EventQueueCreate = 128,
    /// Destroy an event queue
    EventQueueDestroy = 129,
    /// Receive one event
    EventQueueReceive = 130,
    /// Receive pending events without waiting
    EventQueueTryreceive = 131,
    /// Discard pending events
    EventQueueDrain = 133,
    /// Create an event port
    EventPortCreate = 134,
    /// Destroy an event port
    EventPortDestroy = 135,
    /// Connect a port to a local queue
    EventPortConnectLocal = 136,
    /// Disconnect a port
    EventPortDisconnect = 137,
    /// Send an event
    EventPortSend = 138,
    /// Connect a port to a queue by IPC key
    EventPortConnectIpc = 140,
}

impl Syscall {
    /// Decode a guest syscall code
    ///
    /// Returns None for codes outside the synchronization services.
    pub fn from_u32(code: u32) -> Option<Self> {
        use Syscall::*;
        Some(match code {
            82 => EventFlagCreate,
            83 => EventFlagDestroy,
            85 => EventFlagWait,
            86 => EventFlagTrywait,
            87 => EventFlagSet,
            118 => EventFlagClear,
            132 => EventFlagCancel,
            139 => EventFlagGet,

            90 => SemaphoreCreate,
            91 => SemaphoreDestroy,
            92 => SemaphoreWait,
            93 => SemaphoreTrywait,
            94 => SemaphorePost,
            114 => SemaphoreGetValue,

            95 => LwMutexCreate,
            96 => LwMutexDestroy,
            97 => LwMutexLock,
            98 => LwMutexUnlock,
            99 => LwMutexTrylock,

            100 => MutexCreate,
            101 => MutexDestroy,
            102 => MutexLock,
            103 => MutexTrylock,
            104 => MutexUnlock,

            105 => CondCreate,
            106 => CondDestroy,
            107 => CondWait,
            108 => CondSignal,
            109 => CondSignalAll,
            110 => CondSignalTo,

            111 => LwCondCreate,
            112 => LwCondDestroy,
            113 => LwCondWait,
            115 => LwCondSignal,
            116 => LwCondSignalAll,

            120 => RwLockCreate,
            121 => RwLockDestroy,
            122 => RwLockRlock,
            123 => RwLockTryrlock,
            124 => RwLockRunlock,
            125 => RwLockWlock,
            126 => RwLockTrywlock,
            127 => RwLockWunlock,

            128 => EventQueueCreate,
            129 => EventQueueDestroy,
            130 => EventQueueReceive,
            131 => EventQueueTryreceive,
            133 => EventQueueDrain,
            134 => EventPortCreate,
            135 => EventPortDestroy,
            136 => EventPortConnectLocal,
            137 => EventPortDisconnect,
            138 => EventPortSend,
            140 => EventPortConnectIpc,

            _ => return None,
        })
    }

    /// Guest syscall code
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Argument/result registers of one syscall
///
/// Arguments arrive in `gpr[0..]`. On return `gpr[0]` holds the status and
/// any extra results follow in `gpr[1..]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallFrame {
    /// General-purpose registers r3..r10
    pub gpr: [u64; 8],
}

impl SyscallFrame {
    /// Build a frame from leading argument values
    pub fn new(args: &[u64]) -> Self {
        let mut frame = Self::default();
        let count = args.len().min(frame.gpr.len());
        frame.gpr[..count].copy_from_slice(&args[..count]);
        frame
    }

    /// Argument `n` as a full register
    pub fn arg(&self, n: usize) -> u64 {
        self.gpr[n]
    }

    /// Argument `n` truncated to 32 bits
    pub fn arg_u32(&self, n: usize) -> u32 {
        self.gpr[n] as u32
    }

    /// Argument `n` as a signed 32-bit value
    pub fn arg_i32(&self, n: usize) -> i32 {
        self.gpr[n] as u32 as i32
    }

    /// Status left in the frame by the last dispatch
    pub fn status(&self) -> u32 {
        self.gpr[0] as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for code in 0..512 {
            if let Some(syscall) = Syscall::from_u32(code) {
                assert_eq!(syscall.code(), code);
            }
        }
        assert_eq!(Syscall::from_u32(102), Some(Syscall::MutexLock));
        assert_eq!(Syscall::from_u32(84), None);
    }

    #[test]
    fn test_frame_argument_views() {
        let frame = SyscallFrame::new(&[0xFFFF_FFFF, 0x1_0000_0002, 7]);
        assert_eq!(frame.arg_i32(0), -1);
        assert_eq!(frame.arg_u32(1), 2);
        assert_eq!(frame.arg(1), 0x1_0000_0002);
        assert_eq!(frame.arg(7), 0);
    }
}
