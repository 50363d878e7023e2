//! # Interface Model
//!
//! The routing core does not own network interfaces; it consumes a small
//! view of them: up/down state, the tick period that scales every link
//! timeout, a priority used to pick the better of two candidate
//! interfaces, and the outgoing packet sequence counter.

use serde::Serialize;

/// Index into the interface table, 0..[`MAX_INTERFACES`]. Interface ids
/// appear on the wire as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InterfaceId(pub u8);

/// Upper bound on interface ids a link advertisement may carry.
pub const MAX_INTERFACES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Up,
    Down,
}

/// One attachment to a broadcast or unicast medium.
#[derive(Debug, Clone)]
pub struct OverlayInterface {
    /// Human-readable name, only used in logs.
    pub name: String,
    pub state: InterfaceState,
    /// Heartbeat period in milliseconds; link timeouts are five ticks.
    pub tick_ms: u64,
    /// Lower ranks ahead: when a neighbour is heard on two interfaces the
    /// one with the smaller priority carries the traffic.
    pub priority: u8,
    /// Outgoing packet sequence, one per interface, wrapping at 8 bits.
    pub sequence_number: u8,
}

impl OverlayInterface {
    pub fn new(name: impl Into<String>, tick_ms: u64, priority: u8) -> Self {
        OverlayInterface {
            name: name.into(),
            state: InterfaceState::Up,
            tick_ms,
            priority,
            sequence_number: 0,
        }
    }

    /// Take the next outgoing sequence number.
    pub fn next_sequence(&mut self) -> u8 {
        let seq = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        seq
    }
}

/// The embedder's interface list, indexed by [`InterfaceId`].
#[derive(Debug, Default)]
pub struct InterfaceTable {
    interfaces: Vec<OverlayInterface>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface; at most [`MAX_INTERFACES`] are addressable on
    /// the wire.
    pub fn add(&mut self, interface: OverlayInterface) -> InterfaceId {
        let id = InterfaceId(self.interfaces.len() as u8);
        self.interfaces.push(interface);
        id
    }

    pub fn get(&self, id: InterfaceId) -> Option<&OverlayInterface> {
        self.interfaces.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: InterfaceId) -> Option<&mut OverlayInterface> {
        self.interfaces.get_mut(id.0 as usize)
    }

    pub fn is_up(&self, id: InterfaceId) -> bool {
        matches!(self.get(id), Some(i) if i.state == InterfaceState::Up)
    }

    /// Whether `candidate` should carry traffic in preference to `current`.
    /// Equal priorities keep the incumbent, which damps churn between
    /// interchangeable interfaces.
    pub fn ranks_ahead(&self, candidate: InterfaceId, current: InterfaceId) -> bool {
        match (self.get(candidate), self.get(current)) {
            (Some(c), Some(cur)) => c.priority < cur.priority,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (InterfaceId, &OverlayInterface)> {
        self.interfaces
            .iter()
            .enumerate()
            .map(|(i, iface)| (InterfaceId(i as u8), iface))
    }
}
