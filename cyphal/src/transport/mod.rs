//! Transport polymorphism consumed by [`crate::node::Node`].
//!
//! Unlike the generic, compile-time-selected `Transport<C>` this crate
//! started from, a node here holds a heterogeneous set of transports
//! behind `Box<dyn Transport>` — a node can run its serial link and a UDP
//! socket side by side, each receiving and transmitting the same
//! transfers.

pub mod serial;
pub mod udp;

use crate::port::PortInfo;
use crate::transfer::{Transfer, TransferHeader};
use crate::types::PortId;

/// A physical/link layer that moves [`Transfer`]s on and off the wire.
pub trait Transport {
    /// Called once when the transport is added to a node.
    fn start(&mut self) {}

    /// Called once when the transport is removed from a node.
    fn stop(&mut self) {}

    /// Called whenever a port's direction is declared or changes, and once
    /// more with `info = None` when the transport itself is torn down
    /// (after `stop`) for every port it had been told about — transports
    /// that bind per-port resources (UDP sockets) use this to know what to
    /// release. `info = None` outside of teardown is not sent; ports are
    /// never un-declared.
    fn port(&mut self, port_id: PortId, info: Option<&PortInfo>);

    /// Pumps the transport once. Any transfer decoded off the wire is
    /// reported through `deliver` before this call returns.
    fn poll(&mut self, t_ms: u32, dt_ms: u32, deliver: &mut dyn FnMut(TransferHeader, &[u8]));

    /// Hands a transfer to the transport for transmission. Transports that
    /// cannot send the whole thing synchronously must encode it into their
    /// own storage and retain a clone of `transfer.completion_handle()`
    /// before returning.
    fn send(&mut self, transfer: &Transfer);
}

/// A periodic node-level activity (e.g. heartbeat publication) that runs
/// alongside transports. See [`crate::tasks`].
pub trait Task {
    fn start(&mut self, node: &mut crate::node::Node);
    fn stop(&mut self, node: &mut crate::node::Node);
    fn poll(&mut self, node: &mut crate::node::Node, t_ms: u32, dt_ms: u32);
}
