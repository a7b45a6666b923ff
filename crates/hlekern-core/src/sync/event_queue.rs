//! Event queues and the ports that feed them
//!
//! A port is connected to at most one queue. Sending through a port either
//! hands the event straight to a consumer blocked in `receive` or appends it
//! to the queue's bounded backlog; a sender never blocks.

use crate::config::EVENT_QUEUE_CAPACITY_LIMIT;
use crate::error::{KernelError, KernelResult};
use crate::kernel::{deadline_after, Kernel};
use crate::sync::{Handoff, Protocol, SleepQueue};
use crate::thread::GuestThread;
use std::collections::VecDeque;
use std::sync::Arc;

/// One delivered event
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Event {
    /// Name of the sending port
    pub source: u64,
    /// First payload word
    pub data1: u64,
    /// Second payload word
    pub data2: u64,
    /// Third payload word
    pub data3: u64,
}

/// Consumer class of an event queue
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventQueueKind {
    /// Received by PPU threads
    Ppu,
    /// Received by SPU threads; `receive` is not available
    Spu,
}

impl EventQueueKind {
    /// Guest value of `Ppu`
    pub const PPU: u32 = 1;
    /// Guest value of `Spu`
    pub const SPU: u32 = 2;

    /// Decode a guest kind value
    pub fn from_raw(raw: u32) -> KernelResult<Self> {
        match raw {
            Self::PPU => Ok(EventQueueKind::Ppu),
            Self::SPU => Ok(EventQueueKind::Spu),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// Event queue
pub struct EventQueue {
    kind: EventQueueKind,

    /// IPC key, 0 when local
    key: u64,

    /// Maximum backlog
    capacity: u32,

    /// Backlog in arrival order
    events: VecDeque<Event>,

    /// Consumers blocked in `receive`
    queue: SleepQueue,

    /// Events handed straight to woken consumers
    delivered: Handoff<KernelResult<Event>>,

    /// Connected port IDs
    ports: Vec<u32>,

    name: u64,
}

impl EventQueue {
    /// Consumer class
    pub fn kind(&self) -> EventQueueKind {
        self.kind
    }

    /// IPC key, 0 when local
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Maximum backlog
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of events waiting to be received
    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// Blocked consumers
    pub fn queue(&self) -> &SleepQueue {
        &self.queue
    }

    /// IDs of connected ports
    pub fn ports(&self) -> &[u32] {
        &self.ports
    }

    /// Guest-supplied name
    pub fn name(&self) -> u64 {
        self.name
    }
}

/// Reach of an event port
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventPortKind {
    /// Same-process queues
    Local,
    /// Queues found by IPC key
    Ipc,
}

impl EventPortKind {
    /// Guest value of `Local`
    pub const LOCAL: u32 = 1;
    /// Guest value of `Ipc`
    pub const IPC: u32 = 3;

    /// Decode a guest kind value
    pub fn from_raw(raw: u32) -> KernelResult<Self> {
        match raw {
            Self::LOCAL => Ok(EventPortKind::Local),
            Self::IPC => Ok(EventPortKind::Ipc),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// Event port
pub struct EventPort {
    kind: EventPortKind,
    name: u64,
    queue: Option<u32>,
}

impl EventPort {
    /// Create an unconnected port
    pub fn new(kind: EventPortKind, name: u64) -> Self {
        Self {
            kind,
            name,
            queue: None,
        }
    }

    /// Reach
    pub fn kind(&self) -> EventPortKind {
        self.kind
    }

    /// Source value stamped on sent events
    pub fn name(&self) -> u64 {
        self.name
    }

    /// Connected queue
    pub fn queue(&self) -> Option<u32> {
        self.queue
    }
}

impl Kernel {
    /// Create an event queue
    ///
    /// A non-zero `key` registers the queue for [`Kernel::lookup_event_queue`].
    pub fn event_queue_create(
        &self,
        protocol: Protocol,
        kind: EventQueueKind,
        name: u64,
        key: u64,
        capacity: u32,
    ) -> KernelResult<u32> {
        if !matches!(protocol, Protocol::Fifo | Protocol::Priority) {
            return Err(KernelError::InvalidArgument);
        }
        let limit = self
            .config()
            .event_queue_max_capacity
            .min(EVENT_QUEUE_CAPACITY_LIMIT);
        if capacity == 0 || capacity > limit {
            return Err(KernelError::InvalidArgument);
        }

        let mut st = self.lock();
        if key != 0 && st.ipc_keys.contains_key(&key) {
            return Err(KernelError::Exists);
        }
        let id = st.objects.create(EventQueue {
            kind,
            key,
            capacity,
            events: VecDeque::with_capacity(capacity as usize),
            queue: SleepQueue::new(protocol),
            delivered: Handoff::new(),
            ports: Vec::new(),
            name,
        })?;
        if key != 0 {
            st.ipc_keys.insert(key, id);
        }
        Ok(id)
    }

    /// Destroy an event queue, disconnecting its ports
    ///
    /// Blocked consumers make this `Busy` unless `force` is set, in which
    /// case they are woken with `Canceled`. An event already handed to a
    /// consumer that has not collected it yet is `Busy` either way.
    pub fn event_queue_destroy(&self, id: u32, force: bool) -> KernelResult<()> {
        let mut st = self.lock();
        let equeue = st.objects.get_mut::<EventQueue>(id)?;
        if !equeue.delivered.is_empty() || (!force && !equeue.queue.is_empty()) {
            return Err(KernelError::Busy);
        }
        for consumer in equeue.queue.drain() {
            consumer.signal();
        }

        let equeue = st.objects.remove::<EventQueue>(id)?;
        for port in &equeue.ports {
            if let Ok(port) = st.objects.get_mut::<EventPort>(*port) {
                port.queue = None;
            }
        }
        if equeue.key != 0 {
            st.ipc_keys.remove(&equeue.key);
        }
        Ok(())
    }

    /// Take the oldest event, waiting up to `timeout` microseconds
    pub fn event_queue_receive(
        &self,
        thread: &Arc<GuestThread>,
        id: u32,
        timeout: u64,
    ) -> KernelResult<Event> {
        let deadline = deadline_after(timeout);
        let mut st = self.lock();
        let equeue = st.objects.get_mut::<EventQueue>(id)?;
        if equeue.kind == EventQueueKind::Spu {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(event) = equeue.events.pop_front() {
            return Ok(event);
        }
        equeue.queue.push(thread.clone());

        let tid = thread.id();
        self.block_on(&mut st, thread, deadline, |st| {
            if let Ok(equeue) = st.objects.get_mut::<EventQueue>(id) {
                equeue.queue.invalidate(tid);
            }
        })?;

        // a forced destroy wakes consumers without an event
        match st.objects.get_mut::<EventQueue>(id) {
            Ok(equeue) => equeue.delivered.take(tid).unwrap_or(Err(KernelError::Canceled)),
            Err(_) => Err(KernelError::Canceled),
        }
    }

    /// Take up to `max` pending events without waiting
    pub fn event_queue_try_receive(&self, id: u32, max: usize) -> KernelResult<Vec<Event>> {
        let mut st = self.lock();
        let equeue = st.objects.get_mut::<EventQueue>(id)?;
        let count = max.min(equeue.events.len());
        Ok(equeue.events.drain(..count).collect())
    }

    /// Discard every pending event
    pub fn event_queue_drain(&self, id: u32) -> KernelResult<()> {
        self.lock().objects.get_mut::<EventQueue>(id)?.events.clear();
        Ok(())
    }

    /// Number of pending events
    pub fn event_queue_pending(&self, id: u32) -> KernelResult<usize> {
        Ok(self.lock().objects.get::<EventQueue>(id)?.pending())
    }

    /// Resolve a registered IPC key
    pub fn lookup_event_queue(&self, key: u64) -> KernelResult<u32> {
        if key == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.lock()
            .ipc_keys
            .get(&key)
            .copied()
            .ok_or(KernelError::NotFound)
    }

    /// Create an event port
    ///
    /// A `name` of 0 is replaced by `(process_id << 32) | port_id`.
    pub fn event_port_create(&self, kind: EventPortKind, name: u64) -> KernelResult<u32> {
        let process = u64::from(self.config().process_id);
        self.lock().objects.create_with(|id| {
            let name = if name == 0 {
                (process << 32) | u64::from(id)
            } else {
                name
            };
            EventPort::new(kind, name)
        })
    }

    /// Destroy an unconnected port
    pub fn event_port_destroy(&self, id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        if st.objects.get::<EventPort>(id)?.queue.is_some() {
            return Err(KernelError::IsConnected);
        }
        st.objects.remove::<EventPort>(id).map(drop)
    }

    /// Connect a port to a queue
    pub fn event_port_connect(&self, port_id: u32, queue_id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        st.objects.get::<EventQueue>(queue_id)?;
        let port = st.objects.get_mut::<EventPort>(port_id)?;
        if port.queue.is_some() {
            return Err(KernelError::IsConnected);
        }
        port.queue = Some(queue_id);
        st.objects.get_mut::<EventQueue>(queue_id)?.ports.push(port_id);
        Ok(())
    }

    /// Disconnect a port from its queue
    pub fn event_port_disconnect(&self, port_id: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let queue_id = st
            .objects
            .get_mut::<EventPort>(port_id)?
            .queue
            .take()
            .ok_or(KernelError::NotConnected)?;
        if let Ok(equeue) = st.objects.get_mut::<EventQueue>(queue_id) {
            equeue.ports.retain(|&p| p != port_id);
        }
        Ok(())
    }

    /// Send an event through a port
    pub fn event_port_send(&self, port_id: u32, data1: u64, data2: u64, data3: u64) -> KernelResult<()> {
        let mut st = self.lock();
        let port = st.objects.get::<EventPort>(port_id)?;
        let event = Event {
            source: port.name,
            data1,
            data2,
            data3,
        };
        let queue_id = port.queue.ok_or(KernelError::NotConnected)?;
        let equeue = st
            .objects
            .get_mut::<EventQueue>(queue_id)
            .map_err(|_| KernelError::NotConnected)?;

        if let Some(consumer) = equeue.queue.pop() {
            equeue.delivered.grant(consumer.id(), Ok(event));
            consumer.signal();
            return Ok(());
        }
        if equeue.events.len() >= equeue.capacity as usize {
            return Err(KernelError::Full);
        }
        equeue.events.push_back(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::memory::FlatMemory;
    use std::thread;
    use std::time::Duration;

    fn kernel() -> Arc<Kernel> {
        Arc::new(Kernel::new(KernelConfig::default(), Arc::new(FlatMemory::new(0x10))))
    }

    fn local_queue(kernel: &Kernel, capacity: u32) -> u32 {
        kernel
            .event_queue_create(Protocol::Fifo, EventQueueKind::Ppu, 0, 0, capacity)
            .unwrap()
    }

    fn wait_queued(thread: &GuestThread) {
        while !thread.is_queued() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_capacity_bounds() {
        let kernel = kernel();
        for capacity in [0, 128] {
            assert_eq!(
                kernel.event_queue_create(Protocol::Fifo, EventQueueKind::Ppu, 0, 0, capacity),
                Err(KernelError::InvalidArgument)
            );
        }
        assert!(kernel
            .event_queue_create(Protocol::Fifo, EventQueueKind::Ppu, 0, 0, 127)
            .is_ok());
    }

    #[test]
    fn test_configured_capacity_limit() {
        let config = KernelConfig {
            event_queue_max_capacity: 4,
            ..KernelConfig::default()
        };
        let kernel = Kernel::new(config, Arc::new(FlatMemory::new(0x10)));
        assert_eq!(
            kernel.event_queue_create(Protocol::Fifo, EventQueueKind::Ppu, 0, 0, 5),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_ipc_keys() {
        let kernel = kernel();
        let id = kernel
            .event_queue_create(Protocol::Fifo, EventQueueKind::Ppu, 0, 0xABCD, 8)
            .unwrap();
        assert_eq!(
            kernel.event_queue_create(Protocol::Fifo, EventQueueKind::Ppu, 0, 0xABCD, 8),
            Err(KernelError::Exists)
        );
        assert_eq!(kernel.lookup_event_queue(0xABCD), Ok(id));

        kernel.event_queue_destroy(id, false).unwrap();
        assert_eq!(kernel.lookup_event_queue(0xABCD), Err(KernelError::NotFound));
        assert!(kernel
            .event_queue_create(Protocol::Fifo, EventQueueKind::Ppu, 0, 0xABCD, 8)
            .is_ok());
    }

    #[test]
    fn test_port_name_derivation() {
        let kernel = kernel();
        let derived = kernel.event_port_create(EventPortKind::Local, 0).unwrap();
        let named = kernel.event_port_create(EventPortKind::Local, 0x55).unwrap();

        kernel.with_kernel_lock(|st| {
            assert_eq!(
                st.objects.get::<EventPort>(derived).unwrap().name(),
                (1u64 << 32) | u64::from(derived)
            );
            assert_eq!(st.objects.get::<EventPort>(named).unwrap().name(), 0x55);
        });
    }

    #[test]
    fn test_connection_state_errors() {
        let kernel = kernel();
        let q = local_queue(&kernel, 4);
        let p = kernel.event_port_create(EventPortKind::Local, 0).unwrap();

        assert_eq!(kernel.event_port_send(p, 1, 2, 3), Err(KernelError::NotConnected));
        assert_eq!(kernel.event_port_disconnect(p), Err(KernelError::NotConnected));
        kernel.event_port_connect(p, q).unwrap();
        assert_eq!(kernel.event_port_connect(p, q), Err(KernelError::IsConnected));
        assert_eq!(kernel.event_port_destroy(p), Err(KernelError::IsConnected));
        kernel.event_port_disconnect(p).unwrap();
        kernel.event_port_destroy(p).unwrap();
    }

    #[test]
    fn test_send_full_then_receive() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let q = local_queue(&kernel, 1);
        let p = kernel.event_port_create(EventPortKind::Local, 0x77).unwrap();
        kernel.event_port_connect(p, q).unwrap();

        kernel.event_port_send(p, 1, 2, 3).unwrap();
        assert_eq!(kernel.event_port_send(p, 4, 5, 6), Err(KernelError::Full));
        assert_eq!(kernel.event_queue_pending(q), Ok(1));

        let event = kernel.event_queue_receive(&t, q, 0).unwrap();
        assert_eq!(
            event,
            Event {
                source: 0x77,
                data1: 1,
                data2: 2,
                data3: 3
            }
        );
        kernel.event_port_send(p, 4, 5, 6).unwrap();
    }

    #[test]
    fn test_try_receive_and_drain() {
        let kernel = kernel();
        let q = local_queue(&kernel, 8);
        let p = kernel.event_port_create(EventPortKind::Local, 0).unwrap();
        kernel.event_port_connect(p, q).unwrap();
        for n in 0..5 {
            kernel.event_port_send(p, n, 0, 0).unwrap();
        }

        let first: Vec<_> = kernel
            .event_queue_try_receive(q, 2)
            .unwrap()
            .iter()
            .map(|e| e.data1)
            .collect();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(kernel.event_queue_pending(q), Ok(3));

        kernel.event_queue_drain(q).unwrap();
        assert_eq!(kernel.event_queue_try_receive(q, 10), Ok(Vec::new()));
    }

    #[test]
    fn test_send_hands_event_to_waiting_consumer() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let q = local_queue(&kernel, 1);
        let p = kernel.event_port_create(EventPortKind::Local, 9).unwrap();
        kernel.event_port_connect(p, q).unwrap();

        let k = kernel.clone();
        let consumer = t.clone();
        let handle = thread::spawn(move || k.event_queue_receive(&consumer, q, 0));
        wait_queued(&t);

        kernel.event_port_send(p, 10, 20, 30).unwrap();
        assert_eq!(kernel.event_queue_pending(q), Ok(0));
        assert_eq!(handle.join().unwrap().map(|e| e.data2), Ok(20));
    }

    #[test]
    fn test_receive_on_spu_queue() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let q = kernel
            .event_queue_create(Protocol::Fifo, EventQueueKind::Spu, 0, 0, 4)
            .unwrap();
        assert_eq!(kernel.event_queue_receive(&t, q, 0), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_destroy_with_consumer() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let q = local_queue(&kernel, 4);
        let p = kernel.event_port_create(EventPortKind::Local, 0).unwrap();
        kernel.event_port_connect(p, q).unwrap();

        let k = kernel.clone();
        let consumer = t.clone();
        let handle = thread::spawn(move || k.event_queue_receive(&consumer, q, 0));
        wait_queued(&t);

        assert_eq!(kernel.event_queue_destroy(q, false), Err(KernelError::Busy));
        kernel.event_queue_destroy(q, true).unwrap();
        assert_eq!(handle.join().unwrap(), Err(KernelError::Canceled));

        assert_eq!(kernel.event_port_send(p, 1, 2, 3), Err(KernelError::NotConnected));
        kernel.event_port_destroy(p).unwrap();
    }

    #[test]
    fn test_forced_destroy_keeps_handed_over_event() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let q = local_queue(&kernel, 4);
        let event = Event {
            source: 7,
            data1: 1,
            data2: 2,
            data3: 3,
        };

        // a send woke `t` and the event waits for it to take the lock again
        kernel.with_kernel_lock(|st| {
            st.objects.get_mut::<EventQueue>(q).unwrap().delivered.grant(t.id(), Ok(event));
        });
        assert_eq!(kernel.event_queue_destroy(q, true), Err(KernelError::Busy));
        assert_eq!(kernel.object_count(), 1);

        let taken = kernel.with_kernel_lock(|st| {
            st.objects.get_mut::<EventQueue>(q).unwrap().delivered.take(t.id())
        });
        assert_eq!(taken, Some(Ok(event)));
        kernel.event_queue_destroy(q, true).unwrap();
        assert_eq!(kernel.object_count(), 0);
    }

    #[test]
    fn test_receive_timeout() {
        let kernel = kernel();
        let t = kernel.threads().register(1000);
        let q = local_queue(&kernel, 4);

        assert_eq!(kernel.event_queue_receive(&t, q, 5_000), Err(KernelError::TimedOut));
        assert!(!t.is_queued());
        kernel.event_queue_destroy(q, false).unwrap();
    }
}
