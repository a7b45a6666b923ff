//! Syscall dispatcher
//!
//! Decodes the register frame, calls the matching kernel operation, writes
//! output values through guest pointers and translates the outcome into a
//! [`CellStatus`]. Output pointers are 32-bit guest addresses; a null output
//! pointer is `EFAULT` unless noted as optional.

use crate::status::CellStatus;
use crate::syscall::{Syscall, SyscallFrame};
use hlekern_core::config::EVENT_QUEUE_CAPACITY_LIMIT;
use hlekern_core::sync::{recursive_from_raw, EventFlagType, WaitMode};
use hlekern_core::{
    EventPortKind, EventQueueKind, GuestThread, Kernel, KernelError, KernelResult, Protocol,
    ThreadId,
};
use std::sync::Arc;

/// `ppu_thread_id` value that lets `LwCondSignal` pick any waiter
pub const ANY_THREAD: u32 = 0xFFFF_FFFF;

/// `mode` value of `EventQueueDestroy` that cancels blocked consumers
pub const EVENT_QUEUE_DESTROY_FORCE: u32 = 1;

/// Size of one event record written by `EventQueueTryreceive`
pub const EVENT_RECORD_SIZE: u32 = 32;

type Handler = fn(&Kernel, &Arc<GuestThread>, &mut SyscallFrame) -> KernelResult<()>;

/// Execute syscall `code` for `thread`
///
/// The status is stored in `frame.gpr[0]` and also returned.
pub fn dispatch(
    kernel: &Kernel,
    thread: &Arc<GuestThread>,
    code: u32,
    frame: &mut SyscallFrame,
) -> CellStatus {
    let Some(syscall) = Syscall::from_u32(code) else {
        log::warn!("unimplemented syscall {} from thread {:#x}", code, thread.id().as_u32());
        frame.gpr[0] = CellStatus::ENOSYS.raw() as u64;
        return CellStatus::ENOSYS;
    };
    log::debug!(
        "{:?}({:#x}, {:#x}, {:#x}, {:#x}) from thread {:#x}",
        syscall,
        frame.gpr[0],
        frame.gpr[1],
        frame.gpr[2],
        frame.gpr[3],
        thread.id().as_u32()
    );

    let result = handler(syscall)(kernel, thread, frame);
    if result == Err(KernelError::Shutdown) {
        log::debug!("{:?} interrupted by shutdown", syscall);
    }
    let status = CellStatus::from_result(&result);
    frame.gpr[0] = status.raw() as u64;
    status
}

fn handler(syscall: Syscall) -> Handler {
    use Syscall::*;
    match syscall {
        EventFlagCreate => event_flag_create,
        EventFlagDestroy => |k, _, f| k.event_flag_destroy(f.arg_u32(0)),
        EventFlagWait => event_flag_wait,
        EventFlagTrywait => event_flag_trywait,
        EventFlagSet => |k, _, f| k.event_flag_set(f.arg_u32(0), f.arg(1)),
        EventFlagClear => |k, _, f| k.event_flag_clear(f.arg_u32(0), f.arg(1)),
        EventFlagCancel => event_flag_cancel,
        EventFlagGet => event_flag_get,

        SemaphoreCreate => semaphore_create,
        SemaphoreDestroy => |k, _, f| k.semaphore_destroy(f.arg_u32(0)),
        SemaphoreWait => |k, t, f| k.semaphore_wait(t, f.arg_u32(0), f.arg(1)),
        SemaphoreTrywait => |k, _, f| k.semaphore_trywait(f.arg_u32(0)),
        SemaphorePost => |k, _, f| k.semaphore_post(f.arg_u32(0), f.arg_i32(1)),
        SemaphoreGetValue => semaphore_get_value,

        LwMutexCreate => lwmutex_create,
        LwMutexDestroy => |k, _, f| k.lwmutex_destroy(f.arg_u32(0)),
        LwMutexLock => |k, t, f| k.lwmutex_lock(t, f.arg_u32(0), f.arg(1)),
        LwMutexUnlock => |k, t, f| k.lwmutex_unlock(t, f.arg_u32(0)),
        LwMutexTrylock => |k, t, f| k.lwmutex_trylock(t, f.arg_u32(0)),

        MutexCreate => mutex_create,
        MutexDestroy => |k, _, f| k.mutex_destroy(f.arg_u32(0)),
        MutexLock => |k, t, f| k.mutex_lock(t, f.arg_u32(0), f.arg(1)),
        MutexTrylock => |k, t, f| k.mutex_trylock(t, f.arg_u32(0)),
        MutexUnlock => |k, t, f| k.mutex_unlock(t, f.arg_u32(0)),

        CondCreate => cond_create,
        CondDestroy => |k, _, f| k.cond_destroy(f.arg_u32(0)),
        CondWait => |k, t, f| k.cond_wait(t, f.arg_u32(0), f.arg(1)),
        CondSignal => |k, _, f| k.cond_signal(f.arg_u32(0)),
        CondSignalAll => |k, _, f| k.cond_signal_all(f.arg_u32(0)).map(drop),
        CondSignalTo => |k, _, f| k.cond_signal_to(f.arg_u32(0), ThreadId::from_u32(f.arg_u32(1))),

        LwCondCreate => |k, _, f| k.lwcond_create(f.arg_u32(0), f.arg_u32(1), f.arg(2)).map(drop),
        LwCondDestroy => |k, _, f| k.lwcond_destroy(f.arg_u32(0)),
        LwCondWait => |k, t, f| k.lwcond_wait(t, f.arg_u32(0), f.arg(1)),
        LwCondSignal => lwcond_signal,
        LwCondSignalAll => |k, _, f| k.lwcond_signal_all(f.arg_u32(0)).map(drop),

        RwLockCreate => rwlock_create,
        RwLockDestroy => |k, _, f| k.rwlock_destroy(f.arg_u32(0)),
        RwLockRlock => |k, t, f| k.rwlock_read_lock(t, f.arg_u32(0), f.arg(1)),
        RwLockTryrlock => |k, t, f| k.rwlock_try_read_lock(t, f.arg_u32(0)),
        RwLockRunlock => |k, _, f| k.rwlock_read_unlock(f.arg_u32(0)),
        RwLockWlock => |k, t, f| k.rwlock_write_lock(t, f.arg_u32(0), f.arg(1)),
        RwLockTrywlock => |k, t, f| k.rwlock_try_write_lock(t, f.arg_u32(0)),
        RwLockWunlock => |k, t, f| k.rwlock_write_unlock(t, f.arg_u32(0)),

        EventQueueCreate => event_queue_create,
        EventQueueDestroy => |k, _, f| {
            k.event_queue_destroy(f.arg_u32(0), f.arg_u32(1) == EVENT_QUEUE_DESTROY_FORCE)
        },
        EventQueueReceive => event_queue_receive,
        EventQueueTryreceive => event_queue_tryreceive,
        EventQueueDrain => |k, _, f| k.event_queue_drain(f.arg_u32(0)),
        EventPortCreate => event_port_create,
        EventPortDestroy => |k, _, f| k.event_port_destroy(f.arg_u32(0)),
        EventPortConnectLocal => |k, _, f| k.event_port_connect(f.arg_u32(0), f.arg_u32(1)),
        EventPortDisconnect => |k, _, f| k.event_port_disconnect(f.arg_u32(0)),
        EventPortSend => |k, _, f| k.event_port_send(f.arg_u32(0), f.arg(1), f.arg(2), f.arg(3)),
        EventPortConnectIpc => |k, _, f| {
            let queue = k.lookup_event_queue(f.arg(1))?;
            k.event_port_connect(f.arg_u32(0), queue)
        },
    }
}

/// Fail with `EFAULT` unless `len` bytes at `ptr` can be written
///
/// Handlers call this before the kernel operation so a bad pointer leaves
/// no object or state change behind.
fn check_out(kernel: &Kernel, ptr: u32, len: u32) -> KernelResult<()> {
    if ptr == 0 {
        return Err(KernelError::Fault(ptr));
    }
    kernel.memory().check_range(ptr, len)
}

fn check_optional_out(kernel: &Kernel, ptr: u32, len: u32) -> KernelResult<()> {
    match ptr {
        0 => Ok(()),
        ptr => check_out(kernel, ptr, len),
    }
}

fn write_out(kernel: &Kernel, ptr: u32, value: u32) -> KernelResult<()> {
    if ptr == 0 {
        return Err(KernelError::Fault(ptr));
    }
    kernel.memory().write_u32(ptr, value)
}

fn write_out_u64(kernel: &Kernel, ptr: u32, value: u64) -> KernelResult<()> {
    if ptr == 0 {
        return Err(KernelError::Fault(ptr));
    }
    kernel.memory().write_u64(ptr, value)
}

/// (id_ptr, init_pattern, protocol, type, name)
fn event_flag_create(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let protocol = Protocol::ordered_from_raw(f.arg_u32(2))?;
    let kind = EventFlagType::from_raw(f.arg_u32(3))?;
    check_out(kernel, f.arg_u32(0), 4)?;
    let id = kernel.event_flag_create(f.arg(1), protocol, kind, f.arg(4))?;
    write_out(kernel, f.arg_u32(0), id)
}

/// (id, bitptn, mode, result_ptr?, timeout)
fn event_flag_wait(kernel: &Kernel, thread: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let mode = WaitMode::from_raw(f.arg_u32(2))?;
    check_optional_out(kernel, f.arg_u32(3), 8)?;
    let seen = kernel.event_flag_wait(thread, f.arg_u32(0), f.arg(1), mode, f.arg(4))?;
    match f.arg_u32(3) {
        0 => Ok(()),
        ptr => write_out_u64(kernel, ptr, seen),
    }
}

/// (id, bitptn, mode, result_ptr?)
fn event_flag_trywait(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let mode = WaitMode::from_raw(f.arg_u32(2))?;
    check_optional_out(kernel, f.arg_u32(3), 8)?;
    let seen = kernel.event_flag_trywait(f.arg_u32(0), f.arg(1), mode)?;
    match f.arg_u32(3) {
        0 => Ok(()),
        ptr => write_out_u64(kernel, ptr, seen),
    }
}

/// (id, num_ptr?)
fn event_flag_cancel(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    check_optional_out(kernel, f.arg_u32(1), 4)?;
    let count = kernel.event_flag_cancel(f.arg_u32(0))?;
    match f.arg_u32(1) {
        0 => Ok(()),
        ptr => write_out(kernel, ptr, count as u32),
    }
}

/// (id, flags_ptr)
fn event_flag_get(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let pattern = kernel.event_flag_get(f.arg_u32(0))?;
    write_out_u64(kernel, f.arg_u32(1), pattern)
}

/// (id_ptr, protocol, initial, max, name)
fn semaphore_create(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let protocol = Protocol::blocking_from_raw(f.arg_u32(1))?;
    check_out(kernel, f.arg_u32(0), 4)?;
    let id = kernel.semaphore_create(protocol, f.arg_i32(2), f.arg_i32(3), f.arg(4))?;
    write_out(kernel, f.arg_u32(0), id)
}

/// (id, count_ptr)
fn semaphore_get_value(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let value = kernel.semaphore_get_value(f.arg_u32(0))?;
    write_out(kernel, f.arg_u32(1), value as u32)
}

/// (control, protocol, recursive, name) -> gpr[1] = queue id
fn lwmutex_create(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let protocol = Protocol::from_raw(f.arg_u32(1))?;
    let recursive = recursive_from_raw(f.arg_u32(2))?;
    let id = kernel.lwmutex_create(f.arg_u32(0), protocol, recursive, f.arg(3))?;
    f.gpr[1] = u64::from(id);
    Ok(())
}

/// (id_ptr, protocol, recursive, name)
fn mutex_create(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let protocol = Protocol::blocking_from_raw(f.arg_u32(1))?;
    let recursive = recursive_from_raw(f.arg_u32(2))?;
    check_out(kernel, f.arg_u32(0), 4)?;
    let id = kernel.mutex_create(protocol, recursive, f.arg(3))?;
    write_out(kernel, f.arg_u32(0), id)
}

/// (id_ptr, mutex_id, name)
fn cond_create(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    check_out(kernel, f.arg_u32(0), 4)?;
    let id = kernel.cond_create(f.arg_u32(1), f.arg(2))?;
    write_out(kernel, f.arg_u32(0), id)
}

/// (control, ppu_thread_id); [`ANY_THREAD`] wakes the next waiter
fn lwcond_signal(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    match f.arg_u32(1) {
        ANY_THREAD => kernel.lwcond_signal(f.arg_u32(0)),
        target => kernel.lwcond_signal_to(f.arg_u32(0), ThreadId::from_u32(target)),
    }
}

/// (id_ptr, protocol, name)
fn rwlock_create(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let protocol = Protocol::blocking_from_raw(f.arg_u32(1))?;
    check_out(kernel, f.arg_u32(0), 4)?;
    let id = kernel.rwlock_create(protocol, f.arg(2))?;
    write_out(kernel, f.arg_u32(0), id)
}

/// (id_ptr, protocol, kind, key, capacity, name)
fn event_queue_create(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let protocol = Protocol::ordered_from_raw(f.arg_u32(1))?;
    let kind = EventQueueKind::from_raw(f.arg_u32(2))?;
    check_out(kernel, f.arg_u32(0), 4)?;
    let id = kernel.event_queue_create(protocol, kind, f.arg(5), f.arg(3), f.arg_u32(4))?;
    write_out(kernel, f.arg_u32(0), id)
}

/// (id, timeout) -> gpr[1..=4] = source, data1, data2, data3
fn event_queue_receive(kernel: &Kernel, thread: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let event = kernel.event_queue_receive(thread, f.arg_u32(0), f.arg(1))?;
    f.gpr[1] = event.source;
    f.gpr[2] = event.data1;
    f.gpr[3] = event.data2;
    f.gpr[4] = event.data3;
    Ok(())
}

/// (id, event_array_ptr, size, number_ptr)
///
/// `size` is clamped to the largest possible backlog.
fn event_queue_tryreceive(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let array = f.arg_u32(1);
    let max = f
        .arg_u32(2)
        .min(kernel.config().event_queue_max_capacity)
        .min(EVENT_QUEUE_CAPACITY_LIMIT);
    if max > 0 {
        check_out(kernel, array, max * EVENT_RECORD_SIZE)?;
    }
    check_out(kernel, f.arg_u32(3), 4)?;

    let events = kernel.event_queue_try_receive(f.arg_u32(0), max as usize)?;
    for (index, event) in events.iter().enumerate() {
        let base = array + index as u32 * EVENT_RECORD_SIZE;
        let record = [event.source, event.data1, event.data2, event.data3];
        for (word, value) in record.into_iter().enumerate() {
            write_out_u64(kernel, base + word as u32 * 8, value)?;
        }
    }
    write_out(kernel, f.arg_u32(3), events.len() as u32)
}

/// (id_ptr, kind, name)
fn event_port_create(kernel: &Kernel, _: &Arc<GuestThread>, f: &mut SyscallFrame) -> KernelResult<()> {
    let kind = EventPortKind::from_raw(f.arg_u32(1))?;
    check_out(kernel, f.arg_u32(0), 4)?;
    let id = kernel.event_port_create(kind, f.arg(2))?;
    write_out(kernel, f.arg_u32(0), id)
}
