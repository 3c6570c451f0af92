//! Framed serial transport: a byte-stuffed single-frame envelope over any
//! [`ByteSink`](crate::sink::ByteSink), a CRC-32C-guarded header and
//! payload, a stable priority-sorted transmit queue, and an out-of-band
//! byte pass-through for sharing the wire with a human-readable protocol.

use alloc::boxed::Box;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use num_traits::FromPrimitive;

use crate::codec::{InStream, OutStream};
use crate::crc::crc32c;
use crate::priority_map::PriorityMap;
use crate::sink::ByteSink;
use crate::transfer::{CompletionGuard, Transfer, TransferHeader, TransferKind};
use crate::transport::Transport;
use crate::types::{PortId, SERVICE_PORT_BIT};
use crate::time::Timestamp;
use crate::Priority;
use alloc::rc::Rc;

const FRAME_DELIMITER: u8 = 0x9E;
const ESCAPE_PREFIX: u8 = 0x8E;
const FRAME_VERSION_0: u8 = 0x00;

/// Largest frame the receive parser will hold. A frame that would overrun
/// this is truncated at the buffer; the truncated bytes never reassemble
/// into a frame whose CRC matches, so it is silently dropped when the
/// closing delimiter arrives.
pub const MAX_FRAME_SIZE: usize = 1024;
const HEADER_WITHOUT_CRC_SIZE: usize = 28;
const HEADER_WITH_CRC_SIZE: usize = HEADER_WITHOUT_CRC_SIZE + 4;
const MIN_FRAME_SIZE: usize = HEADER_WITH_CRC_SIZE + 4;
/// Fixed `frame_index_eot`: frame index 0, end-of-transfer set. Any other
/// value denotes a multi-frame transfer, which this transport cannot
/// reassemble.
const SINGLE_FRAME_EOT: u32 = 0x8000_0000;
/// Default transmit queue depth.
pub const DEFAULT_TX_QUEUE_CAPACITY: usize = 32;

/// Bit set in the data specifier field to mark a service transfer; the low
/// bit distinguishes request (clear) from response (set) within that.
const DATASPEC_SERVICE_BIT: u16 = 0x8000;
const DATASPEC_RESPONSE_BIT: u16 = 0x4000;
const DATASPEC_PORT_MASK: u16 = 0x3FFF;

fn data_specifier(header: &TransferHeader) -> u16 {
    match header.kind {
        TransferKind::Message => header.port_id,
        TransferKind::Request => header.port_id,
        TransferKind::Response => header.port_id | DATASPEC_RESPONSE_BIT,
    }
}

fn decode_data_specifier(dataspec: u16) -> (TransferKind, PortId) {
    if dataspec & DATASPEC_SERVICE_BIT == 0 {
        (TransferKind::Message, dataspec)
    } else if dataspec & DATASPEC_RESPONSE_BIT == 0 {
        (TransferKind::Request, (dataspec & DATASPEC_PORT_MASK) | SERVICE_PORT_BIT)
    } else {
        (TransferKind::Response, (dataspec & DATASPEC_PORT_MASK) | SERVICE_PORT_BIT)
    }
}

/// Encodes one transfer into a standalone frame body (without byte
/// stuffing or delimiters — those are applied by the transmit pump as the
/// frame is written to the wire).
fn encode_frame(header: &TransferHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = alloc::vec![0u8; MIN_FRAME_SIZE + payload.len()];
    {
        let mut out = OutStream::new(&mut buf);
        out.write_u8(FRAME_VERSION_0)
            .write_u8(header.priority as u8)
            .write_u16(header.local_node_id)
            .write_u16(header.remote_node_id)
            .write_u16(data_specifier(header))
            .write_u64(header.datatype)
            .write_u64(header.transfer_id)
            .write_u32(SINGLE_FRAME_EOT);
    }
    let header_crc = crc32c(&buf[..HEADER_WITHOUT_CRC_SIZE]);
    buf[HEADER_WITHOUT_CRC_SIZE..HEADER_WITH_CRC_SIZE].copy_from_slice(&header_crc.to_le_bytes());
    let payload_off = HEADER_WITH_CRC_SIZE;
    buf[payload_off..payload_off + payload.len()].copy_from_slice(payload);
    let payload_crc = crc32c(payload);
    let crc_off = payload_off + payload.len();
    buf[crc_off..crc_off + 4].copy_from_slice(&payload_crc.to_le_bytes());
    buf
}

/// Decodes a complete, de-stuffed frame body. Returns the transfer header
/// and the `(offset, length)` of the payload within `buf` on success; `None`
/// on any CRC mismatch, unknown version, too-short buffer, unknown
/// priority, or a `frame_index_eot` other than [`SINGLE_FRAME_EOT`].
fn decode_frame(buf: &[u8]) -> Option<(TransferHeader, usize, usize)> {
    if buf.len() < MIN_FRAME_SIZE || buf[0] != FRAME_VERSION_0 {
        return None;
    }

    let header_crc_value = u32::from_le_bytes(
        buf[HEADER_WITHOUT_CRC_SIZE..HEADER_WITH_CRC_SIZE]
            .try_into()
            .ok()?,
    );
    if crc32c(&buf[..HEADER_WITHOUT_CRC_SIZE]) != header_crc_value {
        return None;
    }

    let payload_off = HEADER_WITH_CRC_SIZE;
    let payload_len = buf.len() - MIN_FRAME_SIZE;
    let payload = &buf[payload_off..payload_off + payload_len];
    let payload_crc_value = u32::from_le_bytes(buf[payload_off + payload_len..].try_into().ok()?);
    if crc32c(payload) != payload_crc_value {
        return None;
    }

    let mut version = 0u8;
    let mut priority_raw = 0u8;
    let mut src = 0u16;
    let mut dst = 0u16;
    let mut dataspec = 0u16;
    let mut datatype = 0u64;
    let mut transfer_id = 0u64;
    let mut frame_index_eot = 0u32;
    let mut ins = InStream::new(buf);
    ins.read_u8(&mut version)
        .read_u8(&mut priority_raw)
        .read_u16(&mut src)
        .read_u16(&mut dst)
        .read_u16(&mut dataspec)
        .read_u64(&mut datatype)
        .read_u64(&mut transfer_id)
        .read_u32(&mut frame_index_eot);

    if frame_index_eot != SINGLE_FRAME_EOT {
        return None;
    }

    let priority = Priority::from_u8(priority_raw)?;
    let (kind, port_id) = decode_data_specifier(dataspec);

    let header = TransferHeader {
        timestamp: Timestamp::UNSET,
        priority,
        kind,
        port_id,
        datatype,
        local_node_id: dst,
        remote_node_id: src,
        transfer_id,
    };
    Some((header, payload_off, payload_len))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RxState {
    /// Bytes that are not part of any frame. Merges the reference
    /// implementation's distinct `NONE`/`OOB` states, which behave
    /// identically.
    Oob,
    /// Just saw at least one delimiter; waiting to learn whether the next
    /// byte starts a known frame version or is itself out-of-band.
    Delimiter,
    /// Accumulating de-stuffed frame bytes.
    Frame,
    /// Saw an escape prefix with no following byte yet available.
    Escape,
}

struct TxFrame {
    data: Vec<u8>,
    completion: Rc<CompletionGuard>,
}

struct TxActive {
    frame: TxFrame,
    cursor: usize,
    opened: bool,
}

/// The framed serial transport, generic over its byte sink and transmit
/// queue depth (defaulting to [`DEFAULT_TX_QUEUE_CAPACITY`]).
pub struct SerialTransport<S: ByteSink, const N: usize = DEFAULT_TX_QUEUE_CAPACITY> {
    sink: S,
    oob_handler: Option<Box<dyn FnMut(&[u8])>>,
    rx_state: RxState,
    rx_buf: ArrayVec<[u8; MAX_FRAME_SIZE]>,
    tx_queue: PriorityMap<TxFrame, N>,
    tx_active: Option<TxActive>,
}

impl<S: ByteSink, const N: usize> SerialTransport<S, N> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            oob_handler: None,
            rx_state: RxState::Oob,
            rx_buf: ArrayVec::new(),
            tx_queue: PriorityMap::new(),
            tx_active: None,
        }
    }

    pub fn with_oob_handler(sink: S, oob_handler: Box<dyn FnMut(&[u8])>) -> Self {
        Self {
            oob_handler: Some(oob_handler),
            ..Self::new(sink)
        }
    }

    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue.len()
    }

    fn push_rx_byte(&mut self, byte: u8) {
        let _ = self.rx_buf.try_push(byte);
    }

    fn close_frame(&mut self, deliver: &mut dyn FnMut(TransferHeader, &[u8])) {
        if !self.rx_buf.is_empty() {
            if let Some((header, off, len)) = decode_frame(&self.rx_buf) {
                deliver(header, &self.rx_buf[off..off + len]);
            }
            self.rx_buf.clear();
        }
    }

    /// Runs the byte-stuffing parser state machine over `buf`, delivering
    /// every successfully decoded frame through `deliver` and every
    /// out-of-band byte run through the configured OOB handler.
    fn parse_buffer(&mut self, mut buf: &[u8], deliver: &mut dyn FnMut(TransferHeader, &[u8])) {
        while !buf.is_empty() {
            match self.rx_state {
                RxState::Oob => match buf.iter().position(|&b| b == FRAME_DELIMITER) {
                    Some(pos) => {
                        if pos > 0 {
                            if let Some(handler) = self.oob_handler.as_mut() {
                                handler(&buf[..pos]);
                            }
                        }
                        buf = &buf[pos + 1..];
                        self.rx_state = RxState::Delimiter;
                    }
                    None => {
                        if let Some(handler) = self.oob_handler.as_mut() {
                            handler(buf);
                        }
                        buf = &[];
                    }
                },
                RxState::Delimiter => {
                    let skip = buf.iter().take_while(|&&b| b == FRAME_DELIMITER).count();
                    buf = &buf[skip..];
                    if buf.is_empty() {
                        break;
                    }
                    self.rx_state = if buf[0] == FRAME_VERSION_0 {
                        RxState::Frame
                    } else {
                        RxState::Oob
                    };
                }
                RxState::Frame => {
                    let mut i = 0;
                    while i < buf.len() {
                        let byte = buf[i];
                        i += 1;
                        match byte {
                            ESCAPE_PREFIX => {
                                if i < buf.len() {
                                    let escaped = buf[i];
                                    i += 1;
                                    self.push_rx_byte(escaped ^ 0xFF);
                                } else {
                                    self.rx_state = RxState::Escape;
                                    break;
                                }
                            }
                            FRAME_DELIMITER => {
                                self.close_frame(deliver);
                                self.rx_state = RxState::Delimiter;
                                break;
                            }
                            _ => self.push_rx_byte(byte),
                        }
                    }
                    buf = &buf[i..];
                }
                RxState::Escape => {
                    self.push_rx_byte(buf[0] ^ 0xFF);
                    buf = &buf[1..];
                    self.rx_state = RxState::Frame;
                }
            }
        }
    }

    fn pump_rx(&mut self, deliver: &mut dyn FnMut(TransferHeader, &[u8])) {
        let mut chunk = [0u8; 64];
        loop {
            let available = self.sink.available_read();
            if available == 0 {
                return;
            }
            let n = self.sink.read(&mut chunk[..available.min(chunk.len())]);
            if n == 0 {
                return;
            }
            self.parse_buffer(&chunk[..n], deliver);
        }
    }

    /// Drains the transmit queue into the sink, a writable-capacity chunk
    /// at a time, escaping the frame body as it goes and flushing once a
    /// whole frame has reached the wire.
    fn pump_tx(&mut self) {
        loop {
            if self.tx_active.is_none() {
                match self.tx_queue.pop_front() {
                    Some((_, frame)) => {
                        self.tx_active = Some(TxActive {
                            frame,
                            cursor: 0,
                            opened: false,
                        });
                    }
                    None => return,
                }
            }

            let avail = self.sink.available_write();
            if avail == 0 {
                return;
            }

            let mut chunk = [0u8; 64];
            let mut n = 0usize;
            let mut room = avail.min(chunk.len());

            let Some(active) = self.tx_active.as_mut() else {
                return;
            };

            if !active.opened {
                if room == 0 {
                    return;
                }
                chunk[n] = FRAME_DELIMITER;
                n += 1;
                room -= 1;
                active.opened = true;
            }

            while room >= 1 && active.cursor < active.frame.data.len() {
                let byte = active.frame.data[active.cursor];
                let escapes = matches!(byte, FRAME_DELIMITER | ESCAPE_PREFIX);
                let needed = if escapes { 2 } else { 1 };
                if room < needed || n + needed > chunk.len() {
                    break;
                }
                if escapes {
                    chunk[n] = ESCAPE_PREFIX;
                    chunk[n + 1] = byte ^ 0xFF;
                } else {
                    chunk[n] = byte;
                }
                n += needed;
                room -= needed;
                active.cursor += 1;
            }

            let body_done = active.cursor == active.frame.data.len();
            let mut closed = false;
            if body_done && room >= 1 {
                chunk[n] = FRAME_DELIMITER;
                n += 1;
                closed = true;
            }

            if n == 0 {
                return;
            }
            self.sink.write(&chunk[..n]);

            if body_done && closed {
                self.sink.flush();
                // Dropping `tx_active` drops its `TxFrame`, which drops the
                // last (or not-last) clone of the transfer's completion
                // handle — the completion fires once every transport's
                // clone has gone, this one included.
                self.tx_active = None;
            } else {
                return;
            }
        }
    }
}

impl<S: ByteSink, const N: usize> Transport for SerialTransport<S, N> {
    fn port(&mut self, _port_id: PortId, _info: Option<&crate::port::PortInfo>) {
        // The serial transport carries every declared port over the same
        // byte stream; it has no per-port resource to bind or release.
    }

    fn poll(&mut self, _t_ms: u32, _dt_ms: u32, deliver: &mut dyn FnMut(TransferHeader, &[u8])) {
        self.pump_rx(deliver);
        self.pump_tx();
    }

    fn send(&mut self, transfer: &Transfer) {
        let data = encode_frame(&transfer.header, transfer.payload);
        let frame = TxFrame {
            data,
            completion: transfer.completion_handle(),
        };
        // `insert` evicts the numerically-largest (lowest-priority) entry
        // when the queue is already full, or rejects the new entry outright
        // if it would itself be that entry; either way the evicted frame's
        // `TxFrame` drops here and its completion fires without the frame
        // ever reaching the wire.
        let _evicted = self.tx_queue.insert(transfer.header.priority as i32, frame);
    }
}
