//! UDP/IPv4 transport: UAVCAN port ids are mapped onto UDP port numbers,
//! node ids onto the low bits of the local subnet's host address range.
//! Single-frame datagrams only, in keeping with the rest of this crate.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use num_traits::FromPrimitive;

use crate::codec::{InStream, OutStream};
use crate::port::PortInfo;
use crate::time::Timestamp;
use crate::transfer::{Transfer, TransferHeader, TransferKind};
use crate::transport::Transport;
use crate::types::{is_service_port, PortId, ANONYMOUS_NODE_ID, SERVICE_PORT_BIT};
use crate::Priority;

const UDP_VERSION: u8 = 0;
/// Fixed `frame_index_eot` value; any other value means a multi-frame
/// datagram, which this transport cannot reassemble and so discards.
const UDP_FRAME_INDEX_EOT: u32 = 0x0000_8000;
const UDP_HEADER_SIZE: usize = 24;

/// Maps a port id to the UDP port number it is sent/received on.
/// Messages: `16384 + (port_id & 0x7FFF)`. Requests and responses for the
/// same service land on adjacent UDP ports two apart, distinguished by
/// parity: `16384 - (service_id & 0xFFF) * 2 - 2` for requests (even),
/// `... - 1` for responses (odd).
pub fn udp_port_number(port_id: PortId, kind: TransferKind) -> u16 {
    match kind {
        TransferKind::Message => 16384u16.wrapping_add(port_id & 0x7FFF),
        TransferKind::Request => 16384u16
            .wrapping_sub((port_id & 0x0FFF).wrapping_mul(2))
            .wrapping_sub(2),
        TransferKind::Response => 16384u16
            .wrapping_sub((port_id & 0x0FFF).wrapping_mul(2))
            .wrapping_sub(1),
    }
}

/// Inverse of [`udp_port_number`]. Returns `None` for port numbers outside
/// any mapped range (`8192..=16384` exclusive-ish boundary, see below).
pub fn udp_port_id(udp_port: u16) -> Option<(TransferKind, PortId)> {
    if udp_port >= 16384 {
        Some((TransferKind::Message, udp_port - 16384))
    } else if udp_port > 8192 {
        let port_id = (((16384u32 - udp_port as u32 - 1) >> 1) as u16) | SERVICE_PORT_BIT;
        let kind = if udp_port & 1 == 1 {
            TransferKind::Response
        } else {
            TransferKind::Request
        };
        Some((kind, port_id))
    } else {
        None
    }
}

fn node_id_from_addr(addr: Ipv4Addr, mask: [u8; 4]) -> crate::types::NodeId {
    let o = addr.octets();
    let h2 = o[2] & !mask[2];
    let h3 = o[3] & !mask[3];
    ((h2 as u16) << 8) | h3 as u16
}

fn encode_datagram(header: &TransferHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = alloc::vec![0u8; UDP_HEADER_SIZE + payload.len()];
    {
        let mut out = OutStream::new(&mut buf);
        out.write_u8(UDP_VERSION)
            .write_u8(header.priority as u8)
            .write_u16(0)
            .write_u32(UDP_FRAME_INDEX_EOT)
            .write_u64(header.transfer_id)
            .write_u64(header.datatype)
            .write_bytes(payload);
    }
    buf
}

/// Returns `(priority_raw, transfer_id, datatype, payload_offset)`.
fn decode_datagram(buf: &[u8]) -> Option<(u8, u64, u64, usize)> {
    if buf.len() < UDP_HEADER_SIZE {
        return None;
    }
    let mut version = 0u8;
    let mut priority_raw = 0u8;
    let mut reserved = 0u16;
    let mut frame_index_eot = 0u32;
    let mut transfer_id = 0u64;
    let mut datatype = 0u64;
    let mut ins = InStream::new(buf);
    ins.read_u8(&mut version);
    if version != UDP_VERSION {
        return None;
    }
    ins.read_u8(&mut priority_raw)
        .read_u16(&mut reserved)
        .read_u32(&mut frame_index_eot)
        .read_u64(&mut transfer_id)
        .read_u64(&mut datatype);
    if frame_index_eot != UDP_FRAME_INDEX_EOT {
        return None;
    }
    Some((priority_raw, transfer_id, datatype, UDP_HEADER_SIZE))
}

/// The socket layer UdpTransport is built on. A concrete backend owns real
/// sockets (or, in tests, an in-memory double); this trait only carries
/// the shape the transport needs.
pub trait UdpBackend {
    /// Binds to receive datagrams on `port`. Idempotent.
    fn bind(&mut self, port: u16);
    /// Releases a previously bound port. Idempotent.
    fn unbind(&mut self, port: u16);
    /// Sends one datagram to `dest:port`.
    fn send_to(&mut self, dest: Ipv4Addr, port: u16, data: &[u8]);
    /// Drains every bound socket once, calling `recv(local_port, source_ip,
    /// payload)` for each datagram received.
    fn poll_recv(&mut self, recv: &mut dyn FnMut(u16, Ipv4Addr, &[u8]));
}

/// UDP transport binding a socket per declared port direction, the way
/// the reference implementation's listener-based UDP transport does
/// (rather than its alternative promiscuous-socket variant).
pub struct UdpTransport<B: UdpBackend> {
    backend: B,
    local_node_id: crate::types::NodeId,
    subnet_mask: Ipv4Addr,
    subnet_ip: Ipv4Addr,
    broadcast_ip: Ipv4Addr,
    bound: BTreeSet<u16>,
}

impl<B: UdpBackend> UdpTransport<B> {
    pub fn new(
        local_node_id: crate::types::NodeId,
        local_ip: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        backend: B,
    ) -> Self {
        let lo = local_ip.octets();
        let mo = subnet_mask.octets();
        let mut subnet = [0u8; 4];
        let mut broadcast = [0u8; 4];
        for i in 0..4 {
            subnet[i] = lo[i] & mo[i];
            broadcast[i] = lo[i] | !mo[i];
        }
        Self {
            backend,
            local_node_id,
            subnet_mask,
            subnet_ip: Ipv4Addr::from(subnet),
            broadcast_ip: Ipv4Addr::from(broadcast),
            bound: BTreeSet::new(),
        }
    }

    fn node_addr(&self, node_id: crate::types::NodeId) -> Ipv4Addr {
        if node_id == ANONYMOUS_NODE_ID {
            return self.broadcast_ip;
        }
        let mut o = self.subnet_ip.octets();
        o[2] = (node_id >> 8) as u8;
        o[3] = node_id as u8;
        Ipv4Addr::from(o)
    }

    fn bind_or_unbind(&mut self, port: u16, want: bool) {
        if port == 0 {
            return;
        }
        let bound = self.bound.contains(&port);
        if want && !bound {
            self.backend.bind(port);
            self.bound.insert(port);
        } else if !want && bound {
            self.backend.unbind(port);
            self.bound.remove(&port);
        }
    }
}

impl<B: UdpBackend> Transport for UdpTransport<B> {
    fn start(&mut self) {}

    fn stop(&mut self) {
        let ports: Vec<u16> = self.bound.iter().copied().collect();
        for port in ports {
            self.backend.unbind(port);
        }
        self.bound.clear();
    }

    fn port(&mut self, port_id: PortId, info: Option<&PortInfo>) {
        let service = is_service_port(port_id);
        let udp_in = if service {
            udp_port_number(port_id, TransferKind::Request)
        } else {
            udp_port_number(port_id, TransferKind::Message)
        };
        let udp_out = if service {
            udp_port_number(port_id, TransferKind::Response)
        } else {
            0
        };
        match info {
            None => {
                self.bind_or_unbind(udp_in, false);
                self.bind_or_unbind(udp_out, false);
            }
            Some(info) => {
                self.bind_or_unbind(udp_in, info.is_input);
                self.bind_or_unbind(udp_out, info.is_output && service);
            }
        }
    }

    fn poll(&mut self, _t_ms: u32, _dt_ms: u32, deliver: &mut dyn FnMut(TransferHeader, &[u8])) {
        let local_node_id = self.local_node_id;
        let mask_octets = self.subnet_mask.octets();
        self.backend.poll_recv(&mut |udp_port, src_ip, data| {
            let Some((priority_raw, transfer_id, datatype, payload_start)) = decode_datagram(data)
            else {
                return;
            };
            let Some(priority) = Priority::from_u8(priority_raw) else {
                return;
            };
            let Some((kind, port_id)) = udp_port_id(udp_port) else {
                return;
            };
            let remote_node_id = node_id_from_addr(src_ip, mask_octets);
            let local = if matches!(kind, TransferKind::Message) {
                ANONYMOUS_NODE_ID
            } else {
                local_node_id
            };
            let header = TransferHeader {
                timestamp: Timestamp::UNSET,
                priority,
                kind,
                port_id,
                datatype,
                local_node_id: local,
                remote_node_id,
                transfer_id,
            };
            deliver(header, &data[payload_start..]);
        });
    }

    fn send(&mut self, transfer: &Transfer) {
        let dest = self.node_addr(transfer.header.remote_node_id);
        let port = udp_port_number(transfer.header.port_id, transfer.header.kind);
        let datagram = encode_datagram(&transfer.header, transfer.payload);
        self.backend.send_to(dest, port, &datagram);
    }
}
