//! Port registry: the set of subjects/services a node has declared, each
//! one's direction, its data-type binding, and — for services — the
//! ordered list of request handlers.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::hash::datatype_hash;
use crate::node::RequestHandler;
use crate::types::{DatatypeHash, PortId};

/// Per-port bookkeeping. A port is created the first time it is mentioned
/// by `subscribe`/`define_subject`/`define_service` and is never removed;
/// `is_input`/`is_output` are set but never cleared, matching the
/// reference implementation's "ports only ever grow capability".
pub struct PortInfo {
    pub port_id: PortId,
    pub data_type_name: &'static str,
    pub data_type_hash: DatatypeHash,
    pub is_input: bool,
    pub is_output: bool,
    pub emitted: u64,
    pub received: u64,
    pub errored: u64,
    pub(crate) handlers: Vec<RequestHandler>,
}

impl PortInfo {
    fn new(port_id: PortId, name: &'static str) -> Self {
        Self {
            port_id,
            data_type_name: name,
            data_type_hash: datatype_hash(name),
            is_input: false,
            is_output: false,
            emitted: 0,
            received: 0,
            errored: 0,
            handlers: Vec::new(),
        }
    }
}

/// The node's full set of declared ports, keyed by normalized port id.
#[derive(Default)]
pub struct PortRegistry {
    ports: BTreeMap<PortId, PortInfo>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            ports: BTreeMap::new(),
        }
    }

    /// Looks up or creates the port, binding `name` only at creation time.
    /// Returns whether this call created the entry alongside a mutable
    /// reference to it.
    pub fn claim(&mut self, port_id: PortId, name: &'static str) -> (bool, &mut PortInfo) {
        let mut created = false;
        let info = self.ports.entry(port_id).or_insert_with(|| {
            created = true;
            PortInfo::new(port_id, name)
        });
        (created, info)
    }

    pub fn get(&self, port_id: PortId) -> Option<&PortInfo> {
        self.ports.get(&port_id)
    }

    pub fn get_mut(&mut self, port_id: PortId) -> Option<&mut PortInfo> {
        self.ports.get_mut(&port_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortInfo> {
        self.ports.values()
    }

    /// Takes the handler list out of a port so it can be iterated while
    /// also passing `&mut Node` into each handler, without the registry
    /// itself staying borrowed. Must be paired with [`Self::put_handlers`].
    pub(crate) fn take_handlers(&mut self, port_id: PortId) -> Option<Vec<RequestHandler>> {
        self.ports
            .get_mut(&port_id)
            .map(|p| core::mem::take(&mut p.handlers))
    }

    pub(crate) fn put_handlers(&mut self, port_id: PortId, handlers: Vec<RequestHandler>) {
        if let Some(p) = self.ports.get_mut(&port_id) {
            p.handlers = handlers;
        }
    }
}
