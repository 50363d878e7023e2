//! # trellis-routing
//!
//! Link-state routing core for the Trellis mesh overlay.
//!
//! Each node measures per-link quality from the packets it hears,
//! exchanges condensed link advertisements with its neighbours, and
//! computes a best next hop for every other subscriber. The core is pure
//! logic on a virtual millisecond clock: the embedding event loop feeds it
//! packet arrivals and fires its single send alarm, and it hands back
//! frames through the outbound queue trait.
//!
//! ## Crate structure
//!
//! - [`config`] — protocol timers
//! - [`env`] — traits the embedding daemon implements
//! - [`iface`] — the interface view the core consumes
//! - [`record`] — link advertisement wire records
//! - `neighbour` — per-neighbour claim tables, ack windows, path scoring
//! - [`table`] — the route table, best-hop selection, reachability
//! - `receive` — inbound packet stats and advertisement parsing
//! - `send` — the periodic advertisement composer

pub mod config;
pub mod env;
pub mod iface;
mod neighbour;
pub mod record;
mod receive;
mod send;
pub mod table;

pub use config::ProtocolConfig;
pub use env::{EnqueueError, FrameQueue, LinkObserver, SubscriberDirectory};
pub use iface::{InterfaceId, InterfaceState, InterfaceTable, OverlayInterface};
pub use table::{Reachable, RouteSnapshot, RouteTable};
