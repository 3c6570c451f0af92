//! Periodic in-process work units that run alongside transports.
//!
//! A [`Task`](crate::transport::Task) is ticked by [`crate::node::Node::poll`]
//! at the node's configured schedule (10 ms by default). [`HeartbeatTask`] is
//! the one this crate ships: every node running a real network wants a
//! `uavcan.node.Heartbeat.1.0` publisher, and its wire layout doubles as a
//! worked example of the codec.

use crate::codec::OutStream;
use crate::hash::datatype_hash;
use crate::node::Node;
use crate::transport::Task;
use crate::Priority;

/// `uavcan.node.Heartbeat.1.0`'s subject id, fixed by the standard.
pub const HEARTBEAT_SUBJECT_ID: u16 = 32085;
/// Publication cadence.
pub const HEARTBEAT_PERIOD_MS: u32 = 1000;

/// 2-bit health code, carried in the top two bits of the status byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Health {
    Nominal = 0,
    Advisory = 1,
    Caution = 2,
    Warning = 3,
}

/// 3-bit mode code, carried in bits 3..6 of the status byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Mode {
    Operational = 0,
    Initialization = 1,
    Maintenance = 2,
    SoftwareUpdate = 3,
    Offline = 7,
}

/// `{uptime_s: u32, health: 2 bits, mode: 3 bits, vendor_status: 19 bits}`
/// packed into 4 bytes after the uptime, matching the standard heartbeat
/// layout bit-for-bit.
#[derive(Copy, Clone, Debug)]
pub struct Heartbeat {
    pub uptime_s: u32,
    pub health: Health,
    pub mode: Mode,
    pub vendor_status: u32,
}

impl Heartbeat {
    pub fn write(&self, out: &mut OutStream) {
        let vendor = self.vendor_status & 0x0007_FFFF;
        let status = [
            ((self.health as u8) << 6) | ((self.mode as u8) << 3) | ((vendor >> 16) as u8 & 0x07),
            (vendor >> 8) as u8,
            vendor as u8,
        ];
        out.write_u32(self.uptime_s)
            .write_u8(status[0])
            .write_u8(status[1])
            .write_u8(status[2]);
    }
}

/// Publishes a heartbeat every [`HEARTBEAT_PERIOD_MS`]. On [`Task::start`]
/// it sends one `Initialization`-mode heartbeat immediately and switches to
/// `Operational` for every heartbeat after; on [`Task::stop`] it sends one
/// final `Offline`-mode heartbeat.
pub struct HeartbeatTask {
    datatype: u64,
    health: Health,
    mode: Mode,
    vendor_status: u32,
    uptime_ms: u64,
    timer_ms: u32,
}

impl HeartbeatTask {
    pub fn new() -> Self {
        Self {
            datatype: datatype_hash("uavcan.node.Heartbeat.1.0"),
            health: Health::Nominal,
            mode: Mode::Initialization,
            vendor_status: 0,
            uptime_ms: 0,
            timer_ms: 0,
        }
    }

    pub fn set_status(&mut self, health: Health, mode: Mode, vendor_status: u32) {
        self.health = health;
        self.mode = mode;
        self.vendor_status = vendor_status;
    }

    fn send(&self, node: &mut Node) {
        let heartbeat = Heartbeat {
            uptime_s: (self.uptime_ms / 1000) as u32,
            health: self.health,
            mode: self.mode,
            vendor_status: self.vendor_status,
        };
        let mut buf = [0u8; 7];
        let len = {
            let mut out = OutStream::new(&mut buf);
            heartbeat.write(&mut out);
            out.written()
        };
        node.publish(
            HEARTBEAT_SUBJECT_ID,
            self.datatype,
            Priority::Nominal,
            &buf[..len],
            None,
        );
    }
}

impl Default for HeartbeatTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for HeartbeatTask {
    fn start(&mut self, node: &mut Node) {
        node.define_subject(HEARTBEAT_SUBJECT_ID, "uavcan.node.Heartbeat.1.0");
        self.set_status(Health::Nominal, Mode::Initialization, 0);
        self.send(node);
        self.set_status(Health::Nominal, Mode::Operational, self.vendor_status);
        self.timer_ms = 0;
    }

    fn stop(&mut self, node: &mut Node) {
        self.set_status(Health::Nominal, Mode::Offline, 0);
        self.send(node);
    }

    fn poll(&mut self, node: &mut Node, _t_ms: u32, dt_ms: u32) {
        self.timer_ms += dt_ms;
        self.uptime_ms += dt_ms as u64;
        while self.timer_ms >= HEARTBEAT_PERIOD_MS {
            self.timer_ms -= HEARTBEAT_PERIOD_MS;
            self.send(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    fn node() -> Node {
        Node::new(42, || 0)
    }

    #[test]
    fn heartbeat_wire_layout_matches_reference() {
        // §8 scenario 1: {uptime=7, health=0, mode=1, vendor=0x4241} -> first
        // status byte (0<<6)|(1<<3)|((0x4241>>16)&7) = 0x08.
        let hb = Heartbeat {
            uptime_s: 7,
            health: Health::Nominal,
            mode: Mode::Initialization,
            vendor_status: 0x4241,
        };
        let mut buf = [0u8; 7];
        let len = {
            let mut out = OutStream::new(&mut buf);
            hb.write(&mut out);
            out.written()
        };
        assert_eq!(len, 7);
        assert_eq!(&buf[0..4], &7u32.to_le_bytes());
        assert_eq!(buf[4], 0x08);
        assert_eq!(buf[5], 0x42);
        assert_eq!(buf[6], 0x41);
    }

    #[test]
    fn start_publishes_initialization_then_switches_to_operational() {
        let mut n = node();
        let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = seen.clone();
        n.subscribe(
            HEARTBEAT_SUBJECT_ID,
            "uavcan.node.Heartbeat.1.0",
            Box::new(move |_remote, mut ins| {
                let mut uptime = 0u32;
                let mut s0 = 0u8;
                ins.read_u32(&mut uptime).read_u8(&mut s0);
                seen_cb.borrow_mut().push((s0 >> 3) & 0x07);
            }),
        );
        let mut task = HeartbeatTask::new();
        task.start(&mut n);
        assert_eq!(*seen.borrow(), alloc::vec![Mode::Initialization as u8]);

        task.poll(&mut n, 1000, 1000);
        assert_eq!(
            *seen.borrow(),
            alloc::vec![Mode::Initialization as u8, Mode::Operational as u8]
        );
    }

    #[test]
    fn stop_publishes_offline_mode() {
        let mut n = node();
        let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = seen.clone();
        n.subscribe(
            HEARTBEAT_SUBJECT_ID,
            "uavcan.node.Heartbeat.1.0",
            Box::new(move |_remote, mut ins| {
                let mut uptime = 0u32;
                let mut s0 = 0u8;
                ins.read_u32(&mut uptime).read_u8(&mut s0);
                seen_cb.borrow_mut().push((s0 >> 3) & 0x07);
            }),
        );
        let mut task = HeartbeatTask::new();
        task.start(&mut n);
        task.stop(&mut n);
        assert_eq!(
            *seen.borrow(),
            alloc::vec![Mode::Initialization as u8, Mode::Offline as u8]
        );
    }
}
