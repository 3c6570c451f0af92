//! The node-level transfer dispatcher: port registry, per-session transfer
//! id counters, subscriber/handler/in-flight-request tables, and the
//! timeout sweep — the piece every transport and task is plugged into.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::codec::{InStream, OutStream};
use crate::port::{PortInfo, PortRegistry};
use crate::time::{deadline_after, deadline_due, Duration, Timestamp};
use crate::transfer::{Transfer, TransferHeader, TransferKind};
use crate::transport::{Task, Transport};
use crate::types::{DatatypeHash, NodeId, PortId, TransferId, SERVICE_PORT_BIT};
use crate::Priority;

/// How long a request waits for its response before the callback is
/// invoked with `None`.
pub const REQUEST_TIMEOUT_MS: u32 = 2000;

/// Size of the stack buffer a service handler writes its reply into.
/// Large enough for the small fixed-layout replies this single-frame
/// design supports (e.g. `uavcan.node.GetInfo`); a service that needs more
/// room is out of scope the same way multi-frame transfers are.
pub const MAX_REPLY_SIZE: usize = 512;

/// Default cadence, in milliseconds, at which tasks are ticked.
const DEFAULT_TASK_SCHEDULE_MS: u32 = 10;

/// Subscriber callback for a subject: `(remote_node_id, payload)`.
pub type Subscriber = Box<dyn for<'a> FnMut(NodeId, InStream<'a>)>;

/// Pending-request callback, invoked with `Some(payload)` on a matching
/// response or `None` on timeout.
pub type ResponseCallback = Box<dyn for<'a> FnOnce(Option<InStream<'a>>)>;

/// Service request handler. Takes `&mut Node` (unlike message subscribers
/// and response callbacks) so a handler may recursively publish, request,
/// or respond from within its own dispatch, matching the reference
/// implementation's `UAVPortFunction` signature.
pub type RequestHandler =
    Box<dyn for<'a, 'b> FnMut(&mut Node, NodeId, InStream<'a>, &mut Replier<'b>)>;

/// Accumulates a service reply. The first handler in a service's list to
/// call [`Replier::reply`] wins; later calls, from that handler or any
/// other, are ignored.
pub struct Replier<'b> {
    buffer: &'b mut [u8],
    written: Option<usize>,
}

impl<'b> Replier<'b> {
    fn new(buffer: &'b mut [u8]) -> Self {
        Self {
            buffer,
            written: None,
        }
    }

    pub fn reply(&mut self, build: impl FnOnce(&mut OutStream)) {
        if self.written.is_some() {
            return;
        }
        let mut out = OutStream::new(self.buffer);
        build(&mut out);
        self.written = Some(out.written());
    }

    fn written(&self) -> Option<usize> {
        self.written
    }
}

/// The node: one local identity, its declared ports, the transports and
/// tasks attached to it, and the transfer-dispatch state shared by all of
/// them.
pub struct Node {
    local_node_id: NodeId,
    registry: PortRegistry,
    transports: Vec<Box<dyn Transport>>,
    tasks: Vec<Box<dyn Task>>,

    subject_tid: BTreeMap<PortId, TransferId>,
    session_tid: BTreeMap<(PortId, NodeId), TransferId>,

    subscribers: BTreeMap<(PortId, DatatypeHash), Subscriber>,
    inflight: BTreeMap<(PortId, TransferId), ResponseCallback>,
    timeouts: BTreeMap<u32, Vec<(PortId, TransferId)>>,

    now_us: Box<dyn FnMut() -> u64>,
    now_ms: u32,
    task_timer: u32,
    task_schedule: u32,
}

impl Node {
    pub fn new(local_node_id: NodeId, now_us: impl FnMut() -> u64 + 'static) -> Self {
        Self {
            local_node_id,
            registry: PortRegistry::new(),
            transports: Vec::new(),
            tasks: Vec::new(),
            subject_tid: BTreeMap::new(),
            session_tid: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            inflight: BTreeMap::new(),
            timeouts: BTreeMap::new(),
            now_us: Box::new(now_us),
            now_ms: 0,
            task_timer: 0,
            task_schedule: DEFAULT_TASK_SCHEDULE_MS,
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortInfo> {
        self.registry.iter()
    }

    pub fn set_task_schedule_ms(&mut self, ms: u32) {
        self.task_schedule = ms;
    }

    // ---- transports & tasks -------------------------------------------------

    pub fn add_transport(&mut self, mut transport: Box<dyn Transport>) {
        transport.start();
        for info in self.registry.iter() {
            transport.port(info.port_id, Some(info));
        }
        self.transports.push(transport);
    }

    pub fn remove_transport(&mut self, index: usize) -> Option<Box<dyn Transport>> {
        if index >= self.transports.len() {
            return None;
        }
        let mut transport = self.transports.remove(index);
        transport.stop();
        Some(transport)
    }

    pub fn add_task(&mut self, mut task: Box<dyn Task>) {
        task.start(self);
        self.tasks.push(task);
    }

    pub fn remove_task(&mut self, index: usize) -> Option<Box<dyn Task>> {
        if index >= self.tasks.len() {
            return None;
        }
        let mut task = self.tasks.remove(index);
        task.stop(self);
        Some(task)
    }

    // ---- port declaration ----------------------------------------------------

    pub fn subscribe(&mut self, subject_id: PortId, name: &'static str, callback: Subscriber) {
        let (created, flipped, datatype_hash) = {
            let (created, info) = self.registry.claim(subject_id, name);
            let flipped = !info.is_input;
            info.is_input = true;
            (created, flipped, info.data_type_hash)
        };
        if created || flipped {
            self.notify_transports(subject_id);
        }
        self.subscribers.insert((subject_id, datatype_hash), callback);
    }

    pub fn define_subject(&mut self, subject_id: PortId, name: &'static str) {
        let (created, flipped) = {
            let (created, info) = self.registry.claim(subject_id, name);
            let flipped = !info.is_output;
            info.is_output = true;
            (created, flipped)
        };
        if created || flipped {
            self.notify_transports(subject_id);
        }
    }

    pub fn define_service(&mut self, service_id: PortId, name: &'static str, handler: RequestHandler) {
        let port_id = service_id | SERVICE_PORT_BIT;
        let (created, flipped) = {
            let (created, info) = self.registry.claim(port_id, name);
            let flipped = !info.is_input;
            info.is_input = true;
            info.is_output = true;
            info.handlers.insert(0, handler);
            (created, flipped)
        };
        if created || flipped {
            self.notify_transports(port_id);
        }
    }

    fn notify_transports(&mut self, port_id: PortId) {
        let info = self.registry.get(port_id);
        if let Some(info) = info {
            for transport in self.transports.iter_mut() {
                transport.port(port_id, Some(info));
            }
        }
    }

    // ---- transfer id counters -------------------------------------------------

    fn next_subject_tid(&mut self, port_id: PortId) -> TransferId {
        let counter = self.subject_tid.entry(port_id).or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }

    fn next_session_tid(&mut self, port_id: PortId, remote: NodeId) -> TransferId {
        let counter = self.session_tid.entry((port_id, remote)).or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }

    // ---- outbound --------------------------------------------------------------

    pub fn publish(
        &mut self,
        subject_id: PortId,
        datatype: DatatypeHash,
        priority: Priority,
        payload: &[u8],
        on_complete: Option<Box<dyn FnOnce()>>,
    ) {
        let transfer_id = self.next_subject_tid(subject_id);
        let header = TransferHeader {
            timestamp: Timestamp((self.now_us)()),
            priority,
            kind: TransferKind::Message,
            port_id: subject_id,
            datatype,
            local_node_id: self.local_node_id,
            remote_node_id: crate::types::ANONYMOUS_NODE_ID,
            transfer_id,
        };
        let transfer = Transfer::new(header, payload, on_complete);
        for transport in self.transports.iter_mut() {
            transport.send(&transfer);
        }
        if let Some(info) = self.registry.get_mut(subject_id) {
            info.emitted += 1;
        }
    }

    pub fn request(
        &mut self,
        node_id: NodeId,
        service_id: PortId,
        datatype: DatatypeHash,
        priority: Priority,
        payload: &[u8],
        callback: ResponseCallback,
    ) {
        let port_id = service_id | SERVICE_PORT_BIT;
        let transfer_id = self.next_session_tid(port_id, node_id);
        let key = (port_id, transfer_id);

        self.inflight.insert(key, callback);
        let deadline = deadline_after(self.now_ms, Duration::from_millis(REQUEST_TIMEOUT_MS));
        self.timeouts.entry(deadline).or_insert_with(Vec::new).push(key);

        let header = TransferHeader {
            timestamp: Timestamp((self.now_us)()),
            priority,
            kind: TransferKind::Request,
            port_id,
            datatype,
            local_node_id: self.local_node_id,
            remote_node_id: node_id,
            transfer_id,
        };
        let transfer = Transfer::new(header, payload, None);
        for transport in self.transports.iter_mut() {
            transport.send(&transfer);
        }
        if let Some(info) = self.registry.get_mut(port_id) {
            info.emitted += 1;
        }
    }

    pub fn respond(
        &mut self,
        node_id: NodeId,
        service_id: PortId,
        transfer_id: TransferId,
        datatype: DatatypeHash,
        priority: Priority,
        payload: &[u8],
    ) {
        let port_id = service_id | SERVICE_PORT_BIT;
        let header = TransferHeader {
            timestamp: Timestamp((self.now_us)()),
            priority,
            kind: TransferKind::Response,
            port_id,
            datatype,
            local_node_id: self.local_node_id,
            remote_node_id: node_id,
            transfer_id,
        };
        let transfer = Transfer::new(header, payload, None);
        for transport in self.transports.iter_mut() {
            transport.send(&transfer);
        }
        if let Some(info) = self.registry.get_mut(port_id) {
            info.emitted += 1;
        }
    }

    // ---- inbound ----------------------------------------------------------------

    /// Dispatches one decoded transfer. Transports call this (via the
    /// `deliver` closure passed to their `poll`) rather than calling it
    /// directly, so [`Self::poll`] can buffer decoded transfers until the
    /// transport loop's mutable borrow of `self.transports` has ended.
    pub fn transfer_receive(&mut self, header: TransferHeader, payload: &[u8]) {
        if header.kind == TransferKind::Message {
            let key = (header.port_id, header.datatype);
            let dispatched = if let Some(sub) = self.subscribers.get_mut(&key) {
                sub(header.remote_node_id, InStream::new(payload));
                true
            } else {
                false
            };
            if let Some(info) = self.registry.get_mut(header.port_id) {
                if dispatched {
                    info.received += 1;
                } else {
                    info.errored += 1;
                }
            }
            return;
        }

        if header.local_node_id != self.local_node_id {
            return;
        }

        match header.kind {
            TransferKind::Request => {
                let port_id = header.port_id;
                if let Some(mut handlers) = self.registry.take_handlers(port_id) {
                    let mut reply_buf = [0u8; MAX_REPLY_SIZE];
                    let mut reply_len = None;
                    {
                        let mut replier = Replier::new(&mut reply_buf);
                        for handler in handlers.iter_mut() {
                            handler(self, header.remote_node_id, InStream::new(payload), &mut replier);
                            if let Some(n) = replier.written() {
                                reply_len = Some(n);
                                break;
                            }
                        }
                    }
                    self.registry.put_handlers(port_id, handlers);
                    if let Some(info) = self.registry.get_mut(port_id) {
                        info.received += 1;
                    }
                    if let Some(n) = reply_len {
                        let service_id = port_id & !SERVICE_PORT_BIT;
                        self.respond(
                            header.remote_node_id,
                            service_id,
                            header.transfer_id,
                            header.datatype,
                            header.priority,
                            &reply_buf[..n],
                        );
                    }
                } else if let Some(info) = self.registry.get_mut(port_id) {
                    info.errored += 1;
                }
            }
            TransferKind::Response => {
                if let Some(cb) = self.inflight.remove(&(header.port_id, header.transfer_id)) {
                    cb(Some(InStream::new(payload)));
                }
                // Absent: late or duplicate response, silently dropped.
            }
            // Handled by the early return above; kept only for exhaustiveness.
            TransferKind::Message => unreachable!(),
        }
    }

    // ---- scheduling ---------------------------------------------------------------

    /// Pumps every transport, dispatches whatever they decoded, sweeps
    /// expired requests, and ticks tasks whose schedule has elapsed.
    /// `t_ms` is the absolute millisecond tick (may wrap at 2^32);
    /// `dt_ms` is the elapsed time since the previous call.
    pub fn poll(&mut self, t_ms: u32, dt_ms: u32) {
        self.now_ms = t_ms;

        let mut inbound: Vec<(TransferHeader, Vec<u8>)> = Vec::new();
        for transport in self.transports.iter_mut() {
            transport.poll(t_ms, dt_ms, &mut |header, payload| {
                inbound.push((header, payload.to_vec()));
            });
        }
        for (header, payload) in inbound {
            self.transfer_receive(header, &payload);
        }

        if dt_ms == 0 {
            return;
        }

        let prev = t_ms.wrapping_sub(dt_ms);
        self.sweep_timeouts(prev, t_ms);

        self.task_timer += dt_ms;
        if self.task_timer >= self.task_schedule {
            let task_timer = self.task_timer;
            let mut tasks = core::mem::take(&mut self.tasks);
            for task in tasks.iter_mut() {
                task.poll(self, t_ms, task_timer);
            }
            self.tasks = tasks;
            self.task_timer = 0;
        }
    }

    /// Fires every timeout whose deadline is due as of `now`, given the
    /// tick before this one was `prev`. Delegates the wraparound-safe
    /// due-check to [`deadline_due`] rather than splitting `[prev,
    /// 0xFFFFFFFF] ∪ [0, now]` into two range queries by hand.
    fn sweep_timeouts(&mut self, prev: u32, now: u32) {
        let due: Vec<u32> = self
            .timeouts
            .keys()
            .copied()
            .filter(|&deadline| deadline_due(deadline, prev, now))
            .collect();
        for key in due {
            if let Some(entries) = self.timeouts.remove(&key) {
                for (port_id, transfer_id) in entries {
                    if let Some(cb) = self.inflight.remove(&(port_id, transfer_id)) {
                        cb(None);
                    }
                }
            }
        }
    }
}
