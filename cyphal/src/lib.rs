//! # Cyphal/UAVCAN v1 node core
//!
//! A polyglot-transport publish/subscribe and request/response engine for
//! small networked embedded devices. A [`node::Node`] multiplexes one or
//! more [`transport::Transport`]s behind a uniform [`transfer::Transfer`]
//! abstraction, dispatches inbound transfers to subject subscribers or
//! service handlers, correlates outgoing requests with their responses
//! under a timeout, and leans on [`codec`] to serialize/deserialize the
//! little-endian compact wire format shared by every transport.
//!
//! ## Scope
//!
//! Single-frame transfers only — there is no multi-frame reassembly here,
//! by design: a small node publishing heartbeats and a handful of small
//! service replies never needs it, and the reassembly state machine is a
//! disproportionate amount of complexity for what it buys. Redundant
//! transports are supported by running more than one [`transport::Transport`]
//! on the same node; deduplication beyond "a duplicate response is
//! silently ignored" is left to the application. Dynamic node-id
//! allocation and frame-level authentication are out of scope as well.
//!
//! ## Layout
//!
//! - [`codec`] — little-endian primitive/array/string codec, fp16 conversion.
//! - [`crc`] — CRC-32C, the integrity primitive used by every wire format here.
//! - [`hash`] — the compact data-type hash.
//! - [`types`] — small protocol-level type aliases (`NodeId`, `PortId`, ...).
//! - [`time`] — timestamp/duration newtypes around the injected clock.
//! - [`priority_map`] — the sorted fixed-capacity multimap backing the serial
//!   transmit queue.
//! - [`transfer`] — the uniform, reference-counted transfer record.
//! - [`port`] — the port registry (subjects, services, handler lists).
//! - [`sink`] — the byte-sink contract the serial transport is built on.
//! - [`node`] — the dispatcher: [`node::Node`].
//! - [`transport`] — the `Transport`/`Task` trait objects, plus the serial
//!   and UDP transport implementations.
//! - [`tasks`] — periodic in-process work units; the heartbeat publisher.
#![no_std]
#![allow(clippy::too_many_arguments)]

#[cfg(test)]
extern crate std;

#[macro_use]
extern crate num_derive;

extern crate alloc;

pub mod codec;
pub mod crc;
pub mod hash;
pub mod node;
pub mod port;
pub mod priority_map;
pub mod sink;
pub mod tasks;
pub mod time;
pub mod transfer;
pub mod transport;
pub mod types;

pub use node::Node;
pub use transfer::{Transfer, TransferHeader, TransferKind};

/// Reasons a piece of traffic can be silently dropped rather than
/// dispatched. Nothing in this crate panics or returns one of these as an
/// `Err` — every drop is either reflected in a [`port::PortInfo`] counter or
/// (for `RequestTimeout`) surfaced through the caller's own callback. The
/// enum exists so transports and the dispatcher have a common vocabulary
/// for the handful of places traffic is discarded, so a host application
/// wiring up its own logging has one set of names to match on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// A codec read ran past the end of its buffer; the stream is now
    /// exhausted and the decoded value should not be trusted.
    TruncatedInput,
    /// A serial frame's header or payload CRC did not match.
    FrameCrcFailed,
    /// The first byte of what looked like a frame was not the known
    /// version; the bytes are treated as out-of-band instead.
    UnknownFrameVersion,
    /// A frame/datagram declared itself part of a multi-frame transfer,
    /// which this crate does not reassemble.
    MultiFrameUnsupported,
    /// An inbound request named a service port with no registered handler.
    PortNotRegistered,
    /// An inbound message named a `(port, datatype)` pair with no
    /// subscriber.
    NoMatchingSubscriber,
    /// A request's `REQUEST_TIMEOUT_MS` deadline elapsed with no response.
    RequestTimeout,
    /// The serial transmit queue was full; the lowest-priority entry was
    /// evicted and its completion fired without ever reaching the wire.
    QueueOverflow,
}

/// Protocol-level priorities, 0 (`Exceptional`) through 7 (`Optional`).
/// Transports may support more fine-grained priority than this on the
/// wire, but there is currently no API surface above these eight levels.
#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Hash)]
pub enum Priority {
    Exceptional,
    Immediate,
    Fast,
    High,
    Nominal,
    Low,
    Slow,
    Optional,
}
