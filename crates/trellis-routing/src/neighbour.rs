//! # Neighbours and Links
//!
//! Per-neighbour routing state: the map of link claims the neighbour has
//! advertised, the list of interface paths we have heard the neighbour on,
//! and the path scorer that turns claims into hop counts.
//!
//! A **link** is one claim out of a neighbour's advertisements: "receiver R
//! hears transmitter T". The claims form a forest rooted at the entries
//! whose transmitter is us; scoring a link walks the transmitter chain to a
//! root and accumulates hop count and drop rate. Scores are cached against
//! the neighbour's `path_version` and a `calculating` marker breaks cycles
//! in inconsistent advertisement sets.

use std::collections::BTreeMap;

use tracing::{debug, trace};
use trellis_overlay::address::SubscriberId;

use crate::iface::InterfaceId;

// ─── Link ───────────────────────────────────────────────────────────────────

/// One advertised claim, keyed in [`Neighbour::links`] by its receiver.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    /// Who the receiver hears. `None` means the neighbour lost its path.
    pub transmitter: Option<SubscriberId>,
    /// Our interface, for the claims that say a neighbour hears us.
    pub interface: Option<InterfaceId>,
    /// Bumped by the transmitter whenever its link properties change.
    pub link_version: u8,
    /// 0–32 quality indicator; 0–2 is measurement noise.
    pub drop_rate: u8,
    /// Computed path length, `-1` when there is no usable path.
    pub hop_count: i32,
    /// Accumulated drop rate along the path.
    pub path_drop_rate: i32,
    /// Neighbour `path_version` the scores were computed against.
    pub path_version: u8,
    /// Cycle guard for the scorer.
    pub calculating: bool,
}

// ─── Neighbour Link ─────────────────────────────────────────────────────────

/// One `(our interface, their interface, unicast)` path a neighbour has
/// been heard on, with its packet-level quality window.
#[derive(Debug, Clone)]
pub(crate) struct NeighbourLink {
    pub interface: InterfaceId,
    /// Which of *their* interfaces these stats are for, 0–31.
    pub neighbour_interface: u8,
    pub unicast: bool,
    /// When we will consider this path broken.
    pub link_timeout: u64,
    /// Most recent in-order sequence observed; `None` until the first
    /// packet arrives.
    pub ack_sequence: Option<u8>,
    /// Window of the trailing 32 sequences; bit 0 is `ack_sequence` itself,
    /// bit k is `ack_sequence - k`.
    pub ack_mask: u32,
}

/// What a received sequence number did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqOutcome {
    /// First sequence on this path.
    Adopted,
    /// Repeat of the current sequence.
    Duplicate,
    /// Back-fill of a previously missed sequence.
    Late,
    /// Window advanced; `missed` sequences were skipped on the way.
    Advanced { missed: u32 },
}

impl NeighbourLink {
    fn new(interface: InterfaceId, neighbour_interface: u8, unicast: bool) -> Self {
        NeighbourLink {
            interface,
            neighbour_interface,
            unicast,
            link_timeout: 0,
            ack_sequence: None,
            ack_mask: 0,
        }
    }

    /// Fold a received sequence number into the ack window.
    pub fn record_sequence(&mut self, seq: u8) -> SeqOutcome {
        let current = match self.ack_sequence {
            None => {
                self.ack_sequence = Some(seq);
                self.ack_mask = 1;
                return SeqOutcome::Adopted;
            }
            Some(current) => current,
        };

        let offset = current.wrapping_sub(seq);
        if offset == 0 {
            return SeqOutcome::Duplicate;
        }
        if (offset as u32) < 32 {
            self.ack_mask |= 1 << offset;
            return SeqOutcome::Late;
        }

        // the sequence is ahead of the window: one shift per step, then
        // mark the new head received
        let delta = seq.wrapping_sub(current) as u32;
        if delta >= 32 {
            self.ack_mask = 0;
        } else {
            self.ack_mask <<= delta;
        }
        self.ack_mask |= 1;
        self.ack_sequence = Some(seq);
        SeqOutcome::Advanced { missed: delta - 1 }
    }
}

// ─── Neighbour ──────────────────────────────────────────────────────────────

/// A subscriber we hear directly on at least one interface.
#[derive(Debug)]
pub(crate) struct Neighbour {
    pub subscriber: SubscriberId,
    /// Bumped whenever received advertisements change anything; invalidates
    /// every cached link score.
    pub path_version: u8,
    /// Deadline after which we assume the neighbour no longer hears us.
    pub neighbour_link_timeout: u64,
    /// When this neighbour's record next goes out.
    pub next_neighbour_update: u64,
    pub last_update: u64,
    /// Countdown toward forcing an acknowledging update.
    pub ack_counter: i32,
    /// Link claims keyed by receiver SID, ordered lexicographically.
    pub links: BTreeMap<SubscriberId, Link>,
    /// Interface paths the neighbour has been heard on.
    pub iface_links: Vec<NeighbourLink>,
    /// Index into `iface_links`, elected by the send pass.
    pub best_link: Option<usize>,
    /// The neighbour still speaks the self-announce-ack dialect.
    pub legacy_protocol: bool,
}

impl Neighbour {
    pub fn new(subscriber: SubscriberId) -> Self {
        debug!(neighbour = %subscriber, "new neighbour");
        Neighbour {
            subscriber,
            path_version: 0,
            neighbour_link_timeout: 0,
            next_neighbour_update: 0,
            last_update: 0,
            ack_counter: 0,
            links: BTreeMap::new(),
            iface_links: Vec::new(),
            best_link: None,
            legacy_protocol: false,
        }
    }

    /// Whether the neighbour currently hears us.
    pub fn is_live(&self, now: u64) -> bool {
        self.neighbour_link_timeout >= now
    }

    /// Look up the claim for `receiver`, creating a blank one when asked.
    /// New claims start with a stale `path_version` so they are scored on
    /// first use.
    pub fn find_link(&mut self, receiver: SubscriberId, create: bool) -> Option<&mut Link> {
        if create && !self.links.contains_key(&receiver) {
            self.links.insert(
                receiver,
                Link {
                    transmitter: None,
                    interface: None,
                    link_version: 0,
                    drop_rate: 0,
                    hop_count: -1,
                    path_drop_rate: 0,
                    path_version: self.path_version.wrapping_sub(1),
                    calculating: false,
                },
            );
        }
        self.links.get_mut(&receiver)
    }

    /// Find or append the stats slot for an interface path.
    pub fn neighbour_link(
        &mut self,
        interface: InterfaceId,
        neighbour_interface: u8,
        unicast: bool,
    ) -> &mut NeighbourLink {
        if let Some(index) = self.iface_links.iter().position(|l| {
            l.interface == interface
                && l.neighbour_interface == neighbour_interface
                && l.unicast == unicast
        }) {
            return &mut self.iface_links[index];
        }
        trace!(
            neighbour = %self.subscriber,
            interface = interface.0,
            neighbour_interface,
            "new possible link from neighbour"
        );
        self.iface_links
            .push(NeighbourLink::new(interface, neighbour_interface, unicast));
        self.best_link = None;
        let last = self.iface_links.len() - 1;
        &mut self.iface_links[last]
    }

    // ─── Path Scorer ────────────────────────────────────────────────────

    /// Recompute the hop count and accumulated drop rate for `receiver`'s
    /// claim, walking the transmitter chain toward us.
    ///
    /// Scores are cached against `path_version`; the `calculating` marker
    /// stops cycles, and a link whose chain runs into one keeps
    /// `hop_count = -1` for this round.
    pub fn update_path_score(&mut self, receiver: SubscriberId, my_sid: &SubscriberId) {
        // walk up the chain, marking each visited link
        let mut chain: Vec<SubscriberId> = Vec::new();
        let mut cursor = receiver;
        loop {
            let link = match self.links.get_mut(&cursor) {
                Some(link) => link,
                None => break,
            };
            if link.path_version == self.path_version || link.calculating {
                break;
            }
            link.calculating = true;
            chain.push(cursor);
            match link.transmitter {
                // claims about the neighbour itself and claims transmitted
                // by us are roots of the forest
                Some(t) if t != *my_sid && cursor != self.subscriber => cursor = t,
                _ => break,
            }
        }

        // commit scores deepest ancestor first, so each link sees its
        // parent's final values
        for &sid in chain.iter().rev() {
            let (transmitter, own_drop_rate) = match self.links.get(&sid) {
                Some(link) => (link.transmitter, link.drop_rate),
                None => continue,
            };

            let mut hop_count = -1;
            let mut path_drop_rate = 0;
            if transmitter == Some(*my_sid) {
                if sid == self.subscriber {
                    hop_count = 1;
                }
            } else if sid != self.subscriber {
                if let Some(parent) = transmitter.and_then(|t| self.links.get(&t)) {
                    if !parent.calculating && parent.hop_count > 0 {
                        hop_count = parent.hop_count + 1;
                        path_drop_rate = parent.path_drop_rate;
                    }
                }
            }

            // ignore occasional drops from collisions
            if own_drop_rate > 2 {
                path_drop_rate += own_drop_rate as i32;
            }

            let path_version = self.path_version;
            if let Some(link) = self.links.get_mut(&sid) {
                if hop_count != link.hop_count {
                    trace!(
                        receiver = %sid,
                        via = %self.subscriber,
                        version = path_version,
                        hop_count,
                        "path score"
                    );
                }
                link.hop_count = hop_count;
                link.path_drop_rate = path_drop_rate;
                link.path_version = path_version;
                link.calculating = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_overlay::address::SID_LEN;

    fn sid(seed: u8) -> SubscriberId {
        SubscriberId([seed; SID_LEN])
    }

    fn link(transmitter: Option<SubscriberId>, drop_rate: u8) -> Link {
        Link {
            transmitter,
            interface: None,
            link_version: 1,
            drop_rate,
            hop_count: -1,
            path_drop_rate: 0,
            path_version: 0xFF,
            calculating: false,
        }
    }

    // ─── Ack Window Tests ───────────────────────────────────────────────

    #[test]
    fn first_sequence_adopted_with_bit_zero() {
        let mut nl = NeighbourLink::new(InterfaceId(0), 0, false);
        assert_eq!(nl.record_sequence(0), SeqOutcome::Adopted);
        assert_eq!(nl.ack_sequence, Some(0));
        assert_eq!(nl.ack_mask, 1);
    }

    #[test]
    fn in_order_sequences_fill_the_window() {
        let mut nl = NeighbourLink::new(InterfaceId(0), 0, false);
        for seq in 0..6 {
            nl.record_sequence(seq);
        }
        assert_eq!(nl.ack_sequence, Some(5));
        assert_eq!(nl.ack_mask, 0x3F);
    }

    #[test]
    fn gap_shifts_and_marks_head() {
        let mut nl = NeighbourLink::new(InterfaceId(0), 0, false);
        for seq in 0..6 {
            nl.record_sequence(seq);
        }
        assert_eq!(
            nl.record_sequence(8),
            SeqOutcome::Advanced { missed: 2 }
        );
        assert_eq!(nl.ack_sequence, Some(8));
        assert_eq!(nl.ack_mask, 0x1F9);
    }

    #[test]
    fn late_arrival_backfills() {
        let mut nl = NeighbourLink::new(InterfaceId(0), 0, false);
        for seq in 0..6 {
            nl.record_sequence(seq);
        }
        nl.record_sequence(8);
        assert_eq!(nl.record_sequence(7), SeqOutcome::Late);
        assert_eq!(nl.ack_mask, 0x1FB);
        assert_eq!(nl.record_sequence(6), SeqOutcome::Late);
        assert_eq!(nl.ack_mask, 0x1FF);
    }

    #[test]
    fn duplicate_of_head_is_a_no_op() {
        let mut nl = NeighbourLink::new(InterfaceId(0), 0, false);
        nl.record_sequence(5);
        let mask = nl.ack_mask;
        assert_eq!(nl.record_sequence(5), SeqOutcome::Duplicate);
        assert_eq!(nl.ack_mask, mask);
    }

    #[test]
    fn sequence_wraps_across_255() {
        let mut nl = NeighbourLink::new(InterfaceId(0), 0, false);
        nl.record_sequence(254);
        nl.record_sequence(255);
        assert_eq!(nl.record_sequence(0), SeqOutcome::Advanced { missed: 0 });
        assert_eq!(nl.ack_sequence, Some(0));
        assert_eq!(nl.ack_mask, 0b111);
    }

    #[test]
    fn huge_jump_resets_the_window() {
        let mut nl = NeighbourLink::new(InterfaceId(0), 0, false);
        nl.record_sequence(0);
        assert_eq!(
            nl.record_sequence(100),
            SeqOutcome::Advanced { missed: 99 }
        );
        assert_eq!(nl.ack_mask, 1);
    }

    // ─── Path Scorer Tests ──────────────────────────────────────────────

    #[test]
    fn direct_claim_scores_one_hop() {
        let me = sid(1);
        let n_sid = sid(2);
        let mut n = Neighbour::new(n_sid);
        n.links.insert(n_sid, link(Some(me), 0));

        n.update_path_score(n_sid, &me);
        let l = &n.links[&n_sid];
        assert_eq!(l.hop_count, 1);
        assert_eq!(l.path_drop_rate, 0);
        assert_eq!(l.path_version, n.path_version);
    }

    #[test]
    fn chained_claim_adds_hops_and_drop_rate() {
        let me = sid(1);
        let n_sid = sid(2);
        let c = sid(3);
        let mut n = Neighbour::new(n_sid);
        n.links.insert(n_sid, link(Some(me), 0));
        n.links.insert(c, link(Some(n_sid), 5));

        n.update_path_score(c, &me);
        let l = &n.links[&c];
        assert_eq!(l.hop_count, 2);
        assert_eq!(l.path_drop_rate, 5);
    }

    #[test]
    fn low_drop_rates_are_noise() {
        let me = sid(1);
        let n_sid = sid(2);
        let c = sid(3);
        let mut n = Neighbour::new(n_sid);
        n.links.insert(n_sid, link(Some(me), 2));
        n.links.insert(c, link(Some(n_sid), 2));

        n.update_path_score(c, &me);
        assert_eq!(n.links[&c].path_drop_rate, 0);
    }

    #[test]
    fn cycle_is_detected_and_scores_no_path() {
        let me = sid(1);
        let n_sid = sid(2);
        let a = sid(3);
        let b = sid(4);
        let mut n = Neighbour::new(n_sid);
        // a hears b, b hears a: no route to us anywhere
        n.links.insert(a, link(Some(b), 0));
        n.links.insert(b, link(Some(a), 0));

        n.update_path_score(a, &me);
        assert_eq!(n.links[&a].hop_count, -1);
        assert_eq!(n.links[&b].hop_count, -1);
        assert!(!n.links[&a].calculating);
        assert!(!n.links[&b].calculating);
    }

    #[test]
    fn scores_are_cached_until_version_bump() {
        let me = sid(1);
        let n_sid = sid(2);
        let mut n = Neighbour::new(n_sid);
        n.links.insert(n_sid, link(Some(me), 0));

        n.update_path_score(n_sid, &me);
        // sever the claim without bumping the version: cache hides it
        if let Some(l) = n.links.get_mut(&n_sid) {
            l.transmitter = None;
        }
        n.update_path_score(n_sid, &me);
        assert_eq!(n.links[&n_sid].hop_count, 1);

        n.path_version = n.path_version.wrapping_add(1);
        n.update_path_score(n_sid, &me);
        assert_eq!(n.links[&n_sid].hop_count, -1);
    }

    #[test]
    fn claim_with_unknown_parent_scores_no_path() {
        let me = sid(1);
        let n_sid = sid(2);
        let c = sid(3);
        let ghost = sid(9);
        let mut n = Neighbour::new(n_sid);
        n.links.insert(c, link(Some(ghost), 0));

        n.update_path_score(c, &me);
        assert_eq!(n.links[&c].hop_count, -1);
    }

    #[test]
    fn btree_keeps_receivers_in_sid_order() {
        let mut n = Neighbour::new(sid(1));
        for seed in [9u8, 3, 7, 1] {
            n.find_link(sid(seed), true);
        }
        let keys: Vec<_> = n.links.keys().copied().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 4);
    }
}
