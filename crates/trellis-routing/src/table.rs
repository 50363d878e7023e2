//! # Route Table
//!
//! The routing core's single state value: every neighbour, every
//! per-subscriber routing decision, the global route version, and the send
//! alarm. One instance exists per node; grouping the state in a value
//! (rather than process globals) keeps the core testable.
//!
//! Best-hop selection walks the live neighbours, validates that a claimed
//! path actually terminates through the neighbour advertising it, scores
//! the candidate links, and commits the winner atomically. Decisions are
//! cached against `route_version`, which is bumped on every topology
//! change.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use bitflags::bitflags;
use serde::Serialize;
use tracing::debug;
use trellis_overlay::address::SubscriberId;

use crate::config::ProtocolConfig;
use crate::env::{LinkObserver, SubscriberDirectory};
use crate::iface::{InterfaceId, InterfaceTable};
use crate::neighbour::Neighbour;

// ─── Reachability ───────────────────────────────────────────────────────────

bitflags! {
    /// How (and whether) a subscriber can currently be reached.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Reachable: u8 {
        /// Assumed reachable without evidence; retained until contradicted.
        const ASSUMED   = 0x01;
        /// Direct neighbour via broadcast reception.
        const BROADCAST = 0x02;
        /// Direct neighbour with a working unicast address.
        const UNICAST   = 0x04;
        /// Reachable through another subscriber.
        const INDIRECT  = 0x08;
        /// One of our own identities.
        const SELF      = 0x10;
    }
}

impl Reachable {
    /// Any kind of actual reachability, as opposed to none/assumed.
    pub fn is_reachable(self) -> bool {
        self.intersects(
            Reachable::BROADCAST | Reachable::UNICAST | Reachable::INDIRECT | Reachable::SELF,
        )
    }
}

// ─── Per-Subscriber State ───────────────────────────────────────────────────

/// The routing fields the core owns for one subscriber, created lazily on
/// first query.
#[derive(Debug, Clone)]
pub(crate) struct LinkState {
    pub reachable: Reachable,
    /// Best next hop: the subscriber itself when direct, another subscriber
    /// when indirect, `None` when unreachable.
    pub next_hop: Option<SubscriberId>,
    pub transmitter: Option<SubscriberId>,
    pub hop_count: i32,
    /// Interface carrying the traffic when the subscriber is a direct
    /// neighbour.
    pub interface: Option<InterfaceId>,
    /// `route_version` the decision was computed against.
    pub route_version: u32,
    /// Winning claim as `(neighbour, receiver)` keys, re-resolved on use;
    /// survives neighbour teardown harmlessly.
    pub link: Option<(SubscriberId, SubscriberId)>,
    /// Recursion guard for mutually dependent decisions.
    pub calculating: bool,
    /// When this subscriber's record must next be advertised.
    pub next_update: u64,
    /// Unicast probe bookkeeping, reset when the interface changes.
    pub last_probe: u64,
    pub probe_address: Option<SocketAddr>,
}

// ─── Send Alarm ─────────────────────────────────────────────────────────────

/// The single alarm driving the send path. `pull` only moves the fire time
/// earlier; the ceiling is re-established by each pass.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SendAlarm {
    pub at: Option<u64>,
    pub deadline: u64,
}

impl SendAlarm {
    /// Pull the fire time to `limit` if that is earlier, with the given
    /// slack before the deadline.
    pub fn pull(&mut self, limit: u64, slack: u64) {
        if self.at.map_or(true, |at| at > limit) {
            self.at = Some(limit);
            self.deadline = limit + slack;
        }
    }
}

// ─── Route Table ────────────────────────────────────────────────────────────

/// The link-state routing core.
pub struct RouteTable {
    pub(crate) my_sid: SubscriberId,
    pub(crate) config: ProtocolConfig,
    pub(crate) neighbours: BTreeMap<SubscriberId, Neighbour>,
    pub(crate) states: HashMap<SubscriberId, LinkState>,
    pub(crate) route_version: u32,
    pub(crate) alarm: SendAlarm,
}

impl RouteTable {
    pub fn new(my_sid: SubscriberId, config: ProtocolConfig) -> Self {
        RouteTable {
            my_sid,
            config,
            neighbours: BTreeMap::new(),
            states: HashMap::new(),
            route_version: 0,
            alarm: SendAlarm::default(),
        }
    }

    pub fn my_sid(&self) -> SubscriberId {
        self.my_sid
    }

    /// Bumped on any topology change; per-subscriber decisions older than
    /// this are recomputed on demand.
    pub fn route_version(&self) -> u32 {
        self.route_version
    }

    /// Next `(fire, deadline)` of the send alarm, if armed.
    pub fn next_alarm(&self) -> Option<(u64, u64)> {
        self.alarm.at.map(|at| (at, self.alarm.deadline))
    }

    /// Pull the send alarm forward to `limit` (never later).
    pub(crate) fn update_alarm(&mut self, limit: u64) {
        self.alarm.pull(limit, self.config.drain_deadline_ms);
    }

    // ─── Subscriber State ───────────────────────────────────────────────

    pub(crate) fn state_mut(
        &mut self,
        sid: SubscriberId,
        directory: &dyn SubscriberDirectory,
    ) -> &mut LinkState {
        let route_version = self.route_version;
        self.states.entry(sid).or_insert_with(|| LinkState {
            reachable: if directory.is_own_identity(&sid) {
                Reachable::SELF
            } else {
                Reachable::empty()
            },
            next_hop: None,
            transmitter: None,
            hop_count: -1,
            interface: None,
            route_version: route_version.wrapping_sub(1),
            link: None,
            calculating: false,
            next_update: 0,
            last_probe: 0,
            probe_address: None,
        })
    }

    /// Current reachability of a subscriber.
    pub fn reachable(&self, sid: &SubscriberId) -> Reachable {
        self.states
            .get(sid)
            .map(|s| s.reachable)
            .unwrap_or(Reachable::empty())
    }

    /// The committed next hop for a subscriber, if any.
    pub fn next_hop(&self, sid: &SubscriberId) -> Option<SubscriberId> {
        self.states.get(sid).and_then(|s| s.next_hop)
    }

    /// Assume a subscriber is reachable until the routing table says
    /// otherwise.
    pub fn set_assumed(&mut self, sid: SubscriberId, directory: &dyn SubscriberDirectory) {
        self.state_mut(sid, directory).reachable |= Reachable::ASSUMED;
    }

    /// Record the outcome of an external unicast probe. Probe state is
    /// cleared whenever the carrying interface changes.
    pub fn note_unicast_probe(
        &mut self,
        sid: SubscriberId,
        address: SocketAddr,
        now: u64,
        directory: &dyn SubscriberDirectory,
    ) {
        let state = self.state_mut(sid, directory);
        state.last_probe = now;
        state.probe_address = Some(address);
        if state.reachable.contains(Reachable::BROADCAST) {
            state.reachable |= Reachable::UNICAST;
        }
    }

    // ─── Neighbour Lifecycle ────────────────────────────────────────────

    pub(crate) fn neighbour_mut(
        &mut self,
        sid: SubscriberId,
        create: bool,
    ) -> Option<&mut Neighbour> {
        if create && !self.neighbours.contains_key(&sid) {
            self.neighbours.insert(sid, Neighbour::new(sid));
        }
        self.neighbours.get_mut(&sid)
    }

    /// Number of live neighbours.
    pub fn neighbour_count(&self) -> usize {
        self.neighbours.len()
    }

    /// Tear down one neighbour and everything it owns.
    pub(crate) fn free_neighbour(&mut self, sid: &SubscriberId) {
        if self.neighbours.remove(sid).is_some() {
            debug!(neighbour = %sid, "all links from neighbour have died");
            self.route_version = self.route_version.wrapping_add(1);
        }
    }

    /// Drop expired interface paths, then the neighbours that lost their
    /// last one.
    pub fn clean_neighbours(&mut self, now: u64, ifaces: &InterfaceTable) {
        let mut emptied: Vec<SubscriberId> = Vec::new();
        for (sid, neighbour) in self.neighbours.iter_mut() {
            neighbour.iface_links.retain(|link| {
                let alive = ifaces.is_up(link.interface) && link.link_timeout >= now;
                if !alive {
                    debug!(
                        neighbour = %sid,
                        interface = link.interface.0,
                        "link expired from neighbour"
                    );
                }
                alive
            });
            neighbour.best_link = None;
            if neighbour.iface_links.is_empty() {
                emptied.push(*sid);
            }
        }
        for sid in emptied {
            self.free_neighbour(&sid);
        }
    }

    /// An interface went down: reap everything that was riding on it.
    pub fn link_interface_down(&mut self, now: u64, ifaces: &InterfaceTable) {
        self.clean_neighbours(now, ifaces);
    }

    /// A neighbour asked us to explain `sid`: re-advertise it immediately.
    pub fn link_explained(
        &mut self,
        sid: SubscriberId,
        now: u64,
        directory: &dyn SubscriberDirectory,
    ) {
        self.state_mut(sid, directory).next_update = now;
        self.update_alarm(now);
    }

    // ─── Best-Hop Selection ─────────────────────────────────────────────

    /// Recompute (or fetch the cached) best next hop for `sid`.
    ///
    /// Returns `false` when the decision is already mid-computation higher
    /// up the stack; the caller skips the subscriber for this pass.
    pub fn find_best_link(
        &mut self,
        sid: SubscriberId,
        now: u64,
        directory: &dyn SubscriberDirectory,
        observer: &mut dyn LinkObserver,
    ) -> bool {
        let route_version = self.route_version;
        {
            let state = self.state_mut(sid, directory);
            if state.reachable.contains(Reachable::SELF) {
                return true;
            }
            if state.route_version == route_version {
                return true;
            }
            if state.calculating {
                return false;
            }
            state.calculating = true;
        }

        let my_sid = self.my_sid;
        let mut best_hop_count = 99;
        let mut best_drop_rate = 99;
        let mut next_hop: Option<SubscriberId> = None;
        let mut transmitter: Option<SubscriberId> = None;
        let mut interface: Option<InterfaceId> = None;
        let mut best_link: Option<(SubscriberId, SubscriberId)> = None;

        let neighbour_sids: Vec<SubscriberId> = self.neighbours.keys().copied().collect();
        for n_sid in neighbour_sids {
            let claim_transmitter = {
                let neighbour = match self.neighbours.get(&n_sid) {
                    Some(n) => n,
                    None => continue,
                };
                if !neighbour.is_live(now) {
                    continue;
                }
                match neighbour.links.get(&sid).and_then(|l| l.transmitter) {
                    Some(t) => t,
                    None => continue,
                }
            };

            if claim_transmitter != my_sid {
                // the claimed path must terminate through this neighbour:
                // the transmitter's own best hop has to agree
                self.find_best_link(claim_transmitter, now, directory, observer);
                let parent_next = self
                    .states
                    .get(&claim_transmitter)
                    .and_then(|s| s.next_hop);
                if parent_next != Some(n_sid) {
                    continue;
                }
            }

            if let Some(neighbour) = self.neighbours.get_mut(&n_sid) {
                neighbour.update_path_score(sid, &my_sid);
                if let Some(link) = neighbour.links.get(&sid) {
                    if link.hop_count > 0
                        && (link.path_drop_rate < best_drop_rate
                            || (link.path_drop_rate == best_drop_rate
                                && link.hop_count < best_hop_count))
                    {
                        next_hop = Some(n_sid);
                        best_hop_count = link.hop_count;
                        best_drop_rate = link.path_drop_rate;
                        transmitter = link.transmitter;
                        interface = link.interface;
                        best_link = Some((n_sid, sid));
                    }
                }
            }
        }

        // commit atomically, then derive reachability
        let state = match self.states.get_mut(&sid) {
            Some(state) => state,
            None => return false,
        };
        let mut changed = state.next_hop != next_hop
            || state.transmitter != transmitter
            || state.link != best_link;
        if next_hop == Some(sid) && state.interface != interface {
            changed = true;
        }

        state.next_hop = next_hop;
        state.transmitter = transmitter;
        state.hop_count = best_hop_count;
        state.route_version = route_version;
        state.link = best_link;
        state.calculating = false;

        match next_hop {
            None => {
                if !state.reachable.contains(Reachable::ASSUMED) {
                    state.reachable = Reachable::empty();
                }
            }
            Some(winner) if winner == sid => {
                let mut retained = Reachable::empty();
                if state.interface == interface {
                    retained = state.reachable & Reachable::UNICAST;
                } else {
                    // carrying interface changed: restart unicast probing
                    state.last_probe = 0;
                    state.probe_address = None;
                }
                state.reachable = Reachable::BROADCAST | retained;
                state.interface = interface;
            }
            Some(_) => {
                state.reachable = Reachable::INDIRECT;
            }
        }

        if changed {
            match next_hop {
                Some(winner) if winner == sid => debug!(
                    subscriber = %sid,
                    interface = interface.map(|i| i.0),
                    "neighbour is directly reachable"
                ),
                Some(via) => debug!(
                    subscriber = %sid,
                    hop_count = best_hop_count,
                    via = %via,
                    "next hop changed"
                ),
                None => debug!(subscriber = %sid, "unreachable"),
            }
            observer.link_changed(best_hop_count, transmitter, sid);
            if let Some(state) = self.states.get_mut(&sid) {
                state.next_update = now;
            }
        }

        true
    }

    /// Re-announce every reachable subscriber through the observer, for a
    /// monitor that just attached.
    pub fn announce_all(&self, observer: &mut dyn LinkObserver) {
        for (sid, state) in &self.states {
            if state.reachable.is_reachable() {
                observer.link_changed(state.hop_count, state.transmitter, *sid);
            }
        }
    }

    // ─── Snapshot ───────────────────────────────────────────────────────

    /// Serialisable summary of the routing table for diagnostics.
    pub fn snapshot(&self) -> RouteSnapshot {
        let mut entries: Vec<RouteEntry> = self
            .states
            .iter()
            .map(|(sid, state)| RouteEntry {
                subscriber: sid.to_hex(),
                reachable: format!("{:?}", state.reachable),
                next_hop: state.next_hop.map(|s| s.to_hex()),
                hop_count: state.hop_count,
            })
            .collect();
        entries.sort_by(|a, b| a.subscriber.cmp(&b.subscriber));
        RouteSnapshot {
            route_version: self.route_version,
            neighbours: self.neighbours.len(),
            entries,
        }
    }
}

/// Diagnostic view of the routing table.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSnapshot {
    pub route_version: u32,
    pub neighbours: usize,
    pub entries: Vec<RouteEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteEntry {
    pub subscriber: String,
    pub reachable: String,
    pub next_hop: Option<String>,
    pub hop_count: i32,
}
