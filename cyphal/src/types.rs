//! Protocol-level type aliases shared across the crate.

/// 16-bit node identifier. `0xFFFF` is reserved to mean "anonymous / broadcast".
pub type NodeId = u16;

/// Value a node uses to address itself when it has no assigned identity.
pub const ANONYMOUS_NODE_ID: NodeId = 0xFFFF;

/// 16-bit port identifier. The high bit distinguishes subjects (0) from
/// services (1); the low 15 bits are the subject id or service id.
pub type PortId = u16;

/// Bit that, when set in a [`PortId`], marks it as a service port.
pub const SERVICE_PORT_BIT: PortId = 0x8000;

/// Whether a registered/decoded port id refers to a service (request or
/// response) rather than a subject.
pub fn is_service_port(port_id: PortId) -> bool {
    port_id & SERVICE_PORT_BIT != 0
}

/// Monotonically increasing transfer counter. Never decrements, never wraps
/// in practice at 64 bits wide.
pub type TransferId = u64;

/// 64-bit compact data-type hash, see [`crate::hash`].
pub type DatatypeHash = u64;
