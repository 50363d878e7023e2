//! # Receive Path
//!
//! Two inbound flows feed the routing core:
//!
//! - every packet arrival (any port) updates the per-path ack window via
//!   [`RouteTable::link_received_packet`];
//! - link-state payloads are parsed record by record via
//!   [`RouteTable::link_receive`], updating the sender's claim table.
//!
//! Both can pull the send alarm forward: gaps in the sequence space, a
//! drained ack budget, a revived path, or any topology change all warrant
//! an earlier advertisement.

use tracing::{debug, trace, warn};
use trellis_overlay::address::{AddressResolver, DecodeContext, SubscriberId, PREFIX_LEN};
use trellis_overlay::buffer::BufferReader;
use trellis_overlay::OverlayError;

use crate::iface::{InterfaceId, InterfaceTable};
use crate::neighbour::SeqOutcome;
use crate::record::LinkRecord;
use crate::table::RouteTable;

/// Packet-loss estimate from the low 15 bits of an ack mask; a couple of
/// missing packets is collision noise, not signal.
fn derive_drop_rate(mask: u32) -> u8 {
    let drop_rate = 15 - (mask & 0x7FFF).count_ones() as u8;
    if drop_rate <= 2 {
        0
    } else {
        drop_rate
    }
}

impl RouteTable {
    /// Track reception stats for a packet heard from `sender`.
    ///
    /// `seq` is the sender's per-interface sequence number, `None` when the
    /// encapsulation carried none. Unicast receptions are not used for
    /// routing and are ignored.
    pub fn link_received_packet(
        &mut self,
        sender: SubscriberId,
        our_interface: InterfaceId,
        their_interface: u8,
        seq: Option<u8>,
        unicast: bool,
        now: u64,
        ifaces: &InterfaceTable,
    ) {
        if unicast {
            return;
        }
        let tick_ms = match ifaces.get(our_interface) {
            Some(iface) => iface.tick_ms,
            None => return,
        };
        let timeout_ticks = self.config.link_timeout_ticks;
        let drain = self.config.drain_deadline_ms;
        let missed_ms = self.config.missed_seq_update_ms;

        let limit = {
            let neighbour = match self.neighbour_mut(sender, true) {
                Some(n) => n,
                None => return,
            };
            neighbour.ack_counter -= 1;
            let mut next_update = neighbour.next_neighbour_update;

            let link = neighbour.neighbour_link(our_interface, their_interface, unicast);
            if let Some(seq) = seq {
                match link.record_sequence(seq) {
                    SeqOutcome::Advanced { missed } if missed > 0 => {
                        trace!(seq, missed, neighbour = %sender, "missed sequences");
                        next_update = now + missed_ms;
                    }
                    SeqOutcome::Late => {
                        trace!(seq, neighbour = %sender, "late sequence");
                    }
                    _ => {}
                }
            }
            let was_timed_out = link.link_timeout < now;
            link.link_timeout = now + tick_ms * timeout_ticks;

            // force an update soon when the ack budget is spent
            if neighbour.ack_counter <= 0 {
                next_update = now + drain;
            }
            // and immediately when a new or revived path appears
            if was_timed_out {
                next_update = now;
            }
            if next_update < neighbour.next_neighbour_update {
                neighbour.next_neighbour_update = next_update;
            }
            neighbour.next_neighbour_update
        };
        self.update_alarm(limit);
    }

    /// Parse a link-state payload from `sender` and apply it.
    ///
    /// Returns the address prefixes that could not be resolved; the caller
    /// batches them into a please-explain request back to the sender.
    pub fn link_receive(
        &mut self,
        sender: SubscriberId,
        payload: &[u8],
        now: u64,
        ifaces: &InterfaceTable,
        resolver: &dyn AddressResolver,
    ) -> Vec<[u8; PREFIX_LEN]> {
        let my_sid = self.my_sid;
        let timeout_ticks = self.config.link_timeout_ticks;

        let mut ctx = DecodeContext::new(Some(sender)).with_resolver(resolver);
        let mut reader = BufferReader::new(payload);
        let mut changed = false;

        if let Some(neighbour) = self.neighbour_mut(sender, true) {
            while reader.remaining() > 0 {
                ctx.clear_invalid();
                let record = match LinkRecord::parse(&mut ctx, &mut reader) {
                    Ok(Some(record)) => record,
                    // unresolved addresses: skip the record, ask later
                    Ok(None) => continue,
                    // truncation ends the payload
                    Err(_) => break,
                };
                trace!(
                    receiver = %record.receiver,
                    transmitter = record.transmitter.map(tracing::field::display),
                    version = record.version,
                    interface = record.interface_id,
                    drop_rate = record.drop_rate,
                    neighbour = %sender,
                    "link record"
                );

                // ignore links the neighbour is routing through us
                if record.receiver == my_sid {
                    continue;
                }

                let mut transmitter = record.transmitter;
                let mut interface: Option<InterfaceId> = None;
                if record.receiver == sender {
                    // who can our neighbour hear?
                    let heard_us = transmitter == Some(my_sid);
                    let id = match record.interface_id {
                        Some(id) if heard_us => InterfaceId(id),
                        _ => continue,
                    };
                    // they can hear us, so we can route through them
                    let tick_ms = match ifaces.get(id) {
                        Some(iface) if ifaces.is_up(id) => iface.tick_ms,
                        _ => continue,
                    };
                    if neighbour.neighbour_link_timeout < now {
                        changed = true;
                    }
                    neighbour.neighbour_link_timeout = now + tick_ms * timeout_ticks;
                    interface = Some(id);
                } else if transmitter == Some(my_sid) {
                    // never store ourselves as an intermediate hop
                    transmitter = None;
                }

                let mut drop_rate = 0;
                if let Some(ack) = record.ack {
                    drop_rate = derive_drop_rate(ack.mask);
                }
                if let Some(explicit) = record.drop_rate {
                    drop_rate = explicit;
                }

                let mut version = record.version;
                if let Some(link) = neighbour.find_link(record.receiver, transmitter.is_some()) {
                    if transmitter == Some(my_sid) {
                        // our own inbound links version locally
                        version = link.link_version;
                        if drop_rate != link.drop_rate || transmitter != link.transmitter {
                            version = version.wrapping_add(1);
                        }
                    }
                    if link.transmitter != transmitter
                        || link.link_version != version
                        || link.drop_rate != drop_rate
                    {
                        changed = true;
                        link.transmitter = transmitter;
                        link.link_version = version;
                        link.interface = interface;
                        link.drop_rate = drop_rate;
                    }
                }
            }
        }

        if changed {
            self.route_version = self.route_version.wrapping_add(1);
            if let Some(neighbour) = self.neighbours.get_mut(&sender) {
                neighbour.path_version = neighbour.path_version.wrapping_add(1);
            }
            // advertise soon, but let queued inbound packets drain first
            self.update_alarm(now);
        }

        ctx.take_unresolved()
    }

    /// An ancient node told us it can hear us, in its old dialect. Treat
    /// the link as up, but give it a cost that keeps it out of real routes,
    /// and answer in the same dialect on the next send pass.
    pub fn link_state_legacy_ack(
        &mut self,
        source: SubscriberId,
        payload: &[u8],
        now: u64,
        ifaces: &InterfaceTable,
    ) -> Result<(), OverlayError> {
        let mut reader = BufferReader::new(payload);
        let _their_last_update = reader.get_u32_be().ok_or(OverlayError::Truncated)?;
        let _their_clock = reader.get_u32_be().ok_or(OverlayError::Truncated)?;
        let interface_id = InterfaceId(reader.get_byte().ok_or(OverlayError::Truncated)?);

        let tick_ms = match ifaces.get(interface_id) {
            Some(iface) => iface.tick_ms,
            None => {
                warn!(interface = interface_id.0, "legacy ack names an unknown interface");
                return Ok(());
            }
        };
        let timeout_ticks = self.config.link_timeout_ticks;
        let my_sid = self.my_sid;

        let mut changed = false;
        if let Some(neighbour) = self.neighbour_mut(source, true) {
            if !neighbour.legacy_protocol {
                changed = true;
                debug!(neighbour = %source, "new legacy neighbour");
            }
            if neighbour.neighbour_link_timeout < now {
                changed = true;
            }
            if let Some(link) = neighbour.find_link(source, true) {
                if link.transmitter != Some(my_sid) {
                    changed = true;
                }
                link.transmitter = Some(my_sid);
                link.link_version = 1;
                link.interface = Some(interface_id);
                // high cost: the legacy link stays a last resort
                link.drop_rate = 32;
            }
            neighbour.legacy_protocol = true;
            neighbour.neighbour_link_timeout = now + tick_ms * timeout_ticks;
        }

        if changed {
            self.route_version = self.route_version.wrapping_add(1);
            if let Some(neighbour) = self.neighbours.get_mut(&source) {
                neighbour.path_version = neighbour.path_version.wrapping_add(1);
            }
            self.update_alarm(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_drop_rate_complements_popcount() {
        // property: popcount(mask & 0x7FFF) + derived == 15, modulo the
        // noise clamp
        assert_eq!(derive_drop_rate(0x7FFF), 0);
        assert_eq!(derive_drop_rate(0xFFFF_FFFF), 0);
        assert_eq!(derive_drop_rate(0), 15);
        assert_eq!(derive_drop_rate(0b111), 12);
        // 13 and 14 bits set clamp to zero
        assert_eq!(derive_drop_rate(0x7FFD), 0);
        assert_eq!(derive_drop_rate(0x3FFD), 0);
        // 12 bits set is past the clamp
        assert_eq!(derive_drop_rate(0x0FFF), 3);
    }
}
