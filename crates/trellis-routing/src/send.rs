//! # Send Path
//!
//! One alarm drives everything outbound. Each firing builds at most one
//! link-state frame: neighbour records first (they carry the ack windows
//! the other side is waiting for), then a record per subscriber whose
//! advertisement is due. A record that no longer fits rewinds cleanly and
//! re-arms the alarm for *now*, so the remainder goes out in a fresh frame
//! immediately after.
//!
//! Legacy neighbours get a self-announce ack in their own dialect instead
//! of a record; those ride in separate unicast frames.

use tracing::debug;
use trellis_overlay::address::{DecodeContext, SubscriberId};
use trellis_overlay::buffer::OverlayBuffer;
use trellis_overlay::OverlayError;
use trellis_overlay::frame::{FrameType, OverlayFrame, QueueClass};
use trellis_overlay::mdp::{self, PORT_LINKSTATE};

use crate::env::{FrameQueue, LinkObserver, SubscriberDirectory};
use crate::iface::InterfaceTable;
use crate::record::{AckField, LinkRecord};
use crate::table::{Reachable, RouteTable};

/// What the neighbour pass decided to emit for one neighbour.
enum NeighbourAction {
    Record { record: LinkRecord, tick_ms: u64 },
    LegacyAck {
        last_update: u64,
        neighbour_interface: u8,
        tick_ms: u64,
    },
}

impl RouteTable {
    /// The send alarm fired: compose and enqueue this round's link-state
    /// frame, re-arming the alarm for whichever deadline comes first.
    pub fn link_send(
        &mut self,
        now: u64,
        ifaces: &InterfaceTable,
        directory: &dyn SubscriberDirectory,
        queue: &mut dyn FrameQueue,
        observer: &mut dyn LinkObserver,
    ) {
        // ceiling; pulled in below as deadlines surface
        self.alarm.at = Some(now + self.config.alarm_ceiling_ms);

        let mut payload = OverlayBuffer::with_limit(self.config.payload_cap);
        let mut ctx = DecodeContext::new(Some(self.my_sid));
        if mdp::encode_port_pair(&mut payload, PORT_LINKSTATE, PORT_LINKSTATE).is_err() {
            return;
        }
        payload.checkpoint();
        let base = payload.position();

        let overflow = self.send_neighbour_records(&mut payload, &mut ctx, now, ifaces, queue);
        if !overflow {
            self.send_subscriber_records(&mut payload, &mut ctx, now, directory, observer);
        }

        if payload.position() > base {
            let mut frame = OverlayFrame::new_broadcast(self.my_sid, QueueClass::MeshManagement);
            frame.payload = payload;
            if queue.enqueue(frame).is_err() {
                // drop it; the next alarm rebuilds from current state
                debug!("outbound queue rejected link-state frame");
            }
        }

        if let Some(at) = self.alarm.at {
            self.alarm.deadline = at;
        }
    }

    /// Emit a record (or legacy ack) for every neighbour whose update is
    /// due. Returns `true` when the payload overflowed and the pass must
    /// resume in a fresh frame.
    fn send_neighbour_records(
        &mut self,
        payload: &mut OverlayBuffer,
        ctx: &mut DecodeContext<'_>,
        now: u64,
        ifaces: &InterfaceTable,
        queue: &mut dyn FrameQueue,
    ) -> bool {
        self.clean_neighbours(now, ifaces);

        let my_sid = self.my_sid;
        let include_anyway = self.config.include_anyway_ms;
        let ack_window = self.config.ack_window;
        let drain = self.config.drain_deadline_ms;

        let neighbour_sids: Vec<_> = self.neighbours.keys().copied().collect();
        for n_sid in neighbour_sids {
            let action = {
                let neighbour = match self.neighbours.get_mut(&n_sid) {
                    Some(n) => n,
                    None => continue,
                };

                // elect the best interface path; same interface keeps the
                // incumbent so routes don't flap between equivalent paths
                let mut best: Option<usize> = None;
                for (index, link) in neighbour.iface_links.iter().enumerate() {
                    best = match best {
                        None => Some(index),
                        Some(current) => {
                            let incumbent = &neighbour.iface_links[current];
                            if link.interface != incumbent.interface
                                && ifaces.ranks_ahead(link.interface, incumbent.interface)
                            {
                                Some(index)
                            } else {
                                Some(current)
                            }
                        }
                    };
                }
                let best_index = match best {
                    Some(index) => index,
                    None => continue,
                };
                if neighbour.best_link != Some(best_index) {
                    neighbour.best_link = Some(best_index);
                    neighbour.next_neighbour_update = now;
                    debug!(
                        neighbour = %n_sid,
                        interface = neighbour.iface_links[best_index].interface.0,
                        "best link changed"
                    );
                }

                if neighbour.next_neighbour_update.saturating_sub(include_anyway) > now {
                    None
                } else {
                    let best = &neighbour.iface_links[best_index];
                    let tick_ms = match ifaces.get(best.interface) {
                        Some(iface) => iface.tick_ms,
                        None => continue,
                    };
                    if neighbour.legacy_protocol {
                        Some(NeighbourAction::LegacyAck {
                            last_update: neighbour.last_update,
                            neighbour_interface: best.neighbour_interface,
                            tick_ms,
                        })
                    } else {
                        Some(NeighbourAction::Record {
                            tick_ms,
                            record: LinkRecord {
                                receiver: my_sid,
                                transmitter: Some(n_sid),
                                version: 1,
                                interface_id: Some(best.neighbour_interface),
                                ack: best.ack_sequence.map(|sequence| AckField {
                                    sequence,
                                    mask: best.ack_mask,
                                }),
                                drop_rate: None,
                                unicast: best.unicast,
                                broadcast: !best.unicast,
                            },
                        })
                    }
                }
            };

            let sent_tick_ms = match action {
                None => None,
                Some(NeighbourAction::LegacyAck {
                    last_update,
                    neighbour_interface,
                    tick_ms,
                }) => {
                    self.send_legacy_self_announce_ack(
                        n_sid,
                        last_update,
                        neighbour_interface,
                        now,
                        queue,
                    );
                    Some(tick_ms)
                }
                Some(NeighbourAction::Record { record, tick_ms }) => {
                    if record.append(ctx, payload).is_err() {
                        // out of payload: finish in the next frame
                        self.alarm.pull(now, drain);
                        return true;
                    }
                    Some(tick_ms)
                }
            };

            let next_update = {
                let neighbour = match self.neighbours.get_mut(&n_sid) {
                    Some(n) => n,
                    None => continue,
                };
                if let Some(tick_ms) = sent_tick_ms {
                    neighbour.last_update = now;
                    neighbour.next_neighbour_update = now + tick_ms;
                    neighbour.ack_counter = ack_window;
                }
                neighbour.next_neighbour_update
            };
            self.alarm.pull(next_update, drain);
        }
        false
    }

    /// Emit a record for every subscriber whose advertisement is due.
    fn send_subscriber_records(
        &mut self,
        payload: &mut OverlayBuffer,
        ctx: &mut DecodeContext<'_>,
        now: u64,
        directory: &dyn SubscriberDirectory,
        observer: &mut dyn LinkObserver,
    ) {
        let my_sid = self.my_sid;
        let include_anyway = self.config.include_anyway_ms;
        let period = self.config.subscriber_update_ms;
        let drain = self.config.drain_deadline_ms;

        for sid in directory.subscribers() {
            if sid == my_sid {
                continue;
            }
            if !self.find_best_link(sid, now, directory, observer) {
                continue;
            }

            let decision = self.states.get(&sid).map(|state| {
                (
                    state.next_update.saturating_sub(include_anyway) <= now,
                    state.reachable.contains(Reachable::SELF),
                    state.link,
                    state.transmitter,
                )
            });
            let (due, is_own, link_key, transmitter) = match decision {
                Some(d) => d,
                None => continue,
            };

            if due {
                let record = if is_own {
                    // other identities in our keyring are one hop away
                    LinkRecord {
                        receiver: sid,
                        transmitter: Some(my_sid),
                        version: 1,
                        interface_id: None,
                        ack: None,
                        drop_rate: Some(0),
                        unicast: false,
                        broadcast: false,
                    }
                } else {
                    // the cached claim is re-resolved; a freed neighbour
                    // just degrades to the no-claim defaults
                    let claim = link_key.and_then(|(n_sid, r_sid)| {
                        self.neighbours
                            .get(&n_sid)
                            .and_then(|n| n.links.get(&r_sid))
                    });
                    LinkRecord {
                        receiver: sid,
                        transmitter,
                        version: claim.map(|l| l.link_version).unwrap_or(0xFF),
                        interface_id: None,
                        ack: None,
                        drop_rate: Some(claim.map(|l| l.drop_rate).unwrap_or(32)),
                        unicast: false,
                        broadcast: false,
                    }
                };
                if record.append(ctx, payload).is_err() {
                    // out of payload: the rest goes in the next frame
                    self.alarm.pull(now, drain);
                    return;
                }
                if let Some(state) = self.states.get_mut(&sid) {
                    state.next_update = now + period;
                }
            }

            if let Some(next_update) = self.states.get(&sid).map(|s| s.next_update) {
                self.alarm.pull(next_update, drain);
            }
        }
    }

    /// Answer a legacy neighbour in its own dialect: 9 bytes of timing plus
    /// the interface we heard it on, unicast back at it.
    fn send_legacy_self_announce_ack(
        &self,
        neighbour: SubscriberId,
        last_update: u64,
        neighbour_interface: u8,
        now: u64,
        queue: &mut dyn FrameQueue,
    ) {
        let mut frame = OverlayFrame::new_unicast(
            self.my_sid,
            neighbour,
            FrameType::SelfAnnounceAck,
            QueueClass::MeshManagement,
            6,
        );
        let body = (|| -> Result<(), OverlayError> {
            frame.payload.append_u32_be(last_update as u32)?;
            frame.payload.append_u32_be(now as u32)?;
            frame.payload.append_byte(neighbour_interface)
        })();
        if body.is_err() {
            return;
        }
        if queue.enqueue(frame).is_err() {
            debug!(neighbour = %neighbour, "outbound queue rejected legacy ack");
        }
    }
}
