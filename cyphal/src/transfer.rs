//! Transfer model: the uniform record carrying one message, request, or
//! response across any transport, and its reference-counted completion.

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;

use crate::time::Timestamp;
use crate::types::{DatatypeHash, NodeId, PortId, TransferId};
use crate::Priority;

/// Protocol-level transfer kinds.
#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum TransferKind {
    Message,
    Request,
    Response,
}

/// Transport-agnostic transfer metadata. `port_id` always carries the
/// registry's normalized convention: the raw subject id for `Message`,
/// `service_id | SERVICE_PORT_BIT` for `Request` and `Response` alike,
/// whether the header was built for sending or decoded off the wire.
#[derive(Clone, Debug)]
pub struct TransferHeader {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub kind: TransferKind,
    pub port_id: PortId,
    pub datatype: DatatypeHash,
    pub local_node_id: NodeId,
    pub remote_node_id: NodeId,
    pub transfer_id: TransferId,
}

/// Fires its completion callback exactly once, when the last clone of the
/// `Rc` wrapping it is dropped. Replaces the reference implementation's
/// manual `ref()`/`unref()` transfer refcount with ordinary Rust ownership.
pub struct CompletionGuard {
    callback: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl CompletionGuard {
    fn new(callback: Option<Box<dyn FnOnce()>>) -> Self {
        Self {
            callback: RefCell::new(callback),
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(cb) = self.callback.borrow_mut().take() {
            cb();
        }
    }
}

/// One logical message/request/response, borrowing its payload for the
/// duration of a single `publish`/`request`/`respond`/`send` call.
///
/// A transport that sends synchronously (UDP) never needs to hold onto
/// anything past its `send` call. A transport that queues frames for later
/// transmission (the serial transport) copies the payload into its own
/// encoded buffer immediately and clones [`Transfer::completion_handle`]
/// into its queue entry; the completion fires only once every clone —
/// the node's own handle included — has been dropped.
pub struct Transfer<'p> {
    pub header: TransferHeader,
    pub payload: &'p [u8],
    completion: Rc<CompletionGuard>,
}

impl<'p> Transfer<'p> {
    pub fn new(
        header: TransferHeader,
        payload: &'p [u8],
        on_complete: Option<Box<dyn FnOnce()>>,
    ) -> Self {
        Self {
            header,
            payload,
            completion: Rc::new(CompletionGuard::new(on_complete)),
        }
    }

    /// Clones the reference-counted completion handle.
    pub fn completion_handle(&self) -> Rc<CompletionGuard> {
        self.completion.clone()
    }
}
