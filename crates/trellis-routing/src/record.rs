//! # Link Advertisement Records
//!
//! The variable-length records that make up a link-state payload.
//!
//! ```text
//! offset  size  field
//! 0       1     record_length (total bytes of this record)
//! 1       1     flags
//! 2       v     receiver (abbreviated address)
//! 2+v     1     version
//!         v'    transmitter    (if !NO_PATH)
//!         1     interface_id   (if HAS_INTERFACE)
//!         1     ack_sequence   (if HAS_ACK)
//!         4     ack_mask BE    (if HAS_ACK)
//!         1     drop_rate      (if HAS_DROP_RATE)
//! ```
//!
//! Unknown flag bits are ignored and unknown trailing bytes inside the
//! declared length are skipped, so old nodes stay compatible with records
//! that grow new fields.

use trellis_overlay::address::{append_address, parse_address, DecodeContext, SubscriberId};
use trellis_overlay::buffer::{BufferReader, OverlayBuffer};
use trellis_overlay::OverlayError;

use crate::iface::MAX_INTERFACES;

// ─── Flags ──────────────────────────────────────────────────────────────────

/// An interface id byte is present.
pub const FLAG_HAS_INTERFACE: u8 = 0x01;
/// No transmitter follows; the receiver is unreachable from the emitter.
pub const FLAG_NO_PATH: u8 = 0x02;
/// The link was heard via broadcast reception.
pub const FLAG_BROADCAST: u8 = 0x04;
/// The link was heard via unicast reception.
pub const FLAG_UNICAST: u8 = 0x08;
/// An ack sequence and 32-bit ack mask are present.
pub const FLAG_HAS_ACK: u8 = 0x10;
/// An explicit drop-rate byte is present.
pub const FLAG_HAS_DROP_RATE: u8 = 0x20;

// ─── Record ─────────────────────────────────────────────────────────────────

/// Acknowledgement window carried by neighbour records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckField {
    /// Most recent in-order sequence observed.
    pub sequence: u8,
    /// Bitmap of the trailing window; bit 0 is `sequence` itself.
    pub mask: u32,
}

/// One parsed (or to-be-emitted) link advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub receiver: SubscriberId,
    /// `None` is emitted as `NO_PATH`.
    pub transmitter: Option<SubscriberId>,
    pub version: u8,
    /// The *emitter's* interface the link was heard on.
    pub interface_id: Option<u8>,
    pub ack: Option<AckField>,
    pub drop_rate: Option<u8>,
    pub unicast: bool,
    pub broadcast: bool,
}

impl LinkRecord {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.interface_id.is_some() {
            flags |= FLAG_HAS_INTERFACE;
        }
        if self.transmitter.is_none() {
            flags |= FLAG_NO_PATH;
        }
        if self.broadcast {
            flags |= FLAG_BROADCAST;
        }
        if self.unicast {
            flags |= FLAG_UNICAST;
        }
        if self.ack.is_some() {
            flags |= FLAG_HAS_ACK;
        }
        if self.drop_rate.is_some() {
            flags |= FLAG_HAS_DROP_RATE;
        }
        flags
    }

    /// Append this record to a payload. The record lands whole or not at
    /// all: any failure rewinds to the position before the record, and a
    /// successful append moves the payload checkpoint past it.
    pub fn append(
        &self,
        ctx: &mut DecodeContext<'_>,
        payload: &mut OverlayBuffer,
    ) -> Result<(), OverlayError> {
        payload.checkpoint();
        match self.append_fields(ctx, payload) {
            Ok(()) => {
                payload.checkpoint();
                Ok(())
            }
            Err(e) => {
                payload.rewind();
                Err(e)
            }
        }
    }

    fn append_fields(
        &self,
        ctx: &mut DecodeContext<'_>,
        payload: &mut OverlayBuffer,
    ) -> Result<(), OverlayError> {
        let length_pos = payload.position();
        payload.append_byte(0)?;
        payload.append_byte(self.flags())?;
        append_address(ctx, payload, &self.receiver)?;
        payload.append_byte(self.version)?;
        if let Some(transmitter) = &self.transmitter {
            append_address(ctx, payload, transmitter)?;
        }
        if let Some(id) = self.interface_id {
            payload.append_byte(id)?;
        }
        if let Some(ack) = &self.ack {
            payload.append_byte(ack.sequence)?;
            payload.append_u32_be(ack.mask)?;
        }
        if let Some(drop_rate) = self.drop_rate {
            payload.append_byte(drop_rate)?;
        }
        // future fields go here, inside the declared length

        let end_pos = payload.position();
        payload.set(length_pos, (end_pos - length_pos) as u8)
    }

    /// Parse one record off the reader.
    ///
    /// `Err(Truncated)` aborts the surrounding loop; `Ok(None)` skips a
    /// record whose addresses could not be resolved or whose interface id
    /// is out of range. In every `Ok` case the reader is left at the next
    /// record boundary, so unknown trailing bytes are ignored.
    pub fn parse(
        ctx: &mut DecodeContext<'_>,
        reader: &mut BufferReader<'_>,
    ) -> Result<Option<LinkRecord>, OverlayError> {
        let start = reader.position();
        let length = reader.get_byte().ok_or(OverlayError::Truncated)?;
        if length == 0 {
            return Err(OverlayError::Truncated);
        }
        let end = start + length as usize;

        let flags = reader.get_byte().ok_or(OverlayError::Truncated)?;
        let receiver = parse_address(ctx, reader)?;
        let version = reader.get_byte().ok_or(OverlayError::Truncated)?;
        let transmitter = if flags & FLAG_NO_PATH == 0 {
            parse_address(ctx, reader)?
        } else {
            None
        };
        let interface_id = if flags & FLAG_HAS_INTERFACE != 0 {
            Some(reader.get_byte().ok_or(OverlayError::Truncated)?)
        } else {
            None
        };
        let ack = if flags & FLAG_HAS_ACK != 0 {
            let sequence = reader.get_byte().ok_or(OverlayError::Truncated)?;
            let mask = reader.get_u32_be().ok_or(OverlayError::Truncated)?;
            Some(AckField { sequence, mask })
        } else {
            None
        };
        let drop_rate = if flags & FLAG_HAS_DROP_RATE != 0 {
            Some(reader.get_byte().ok_or(OverlayError::Truncated)?)
        } else {
            None
        };

        // jump to the next record even if this one carried fields we don't
        // understand
        reader.seek(end);

        if ctx.invalid_addresses() {
            return Ok(None);
        }
        let receiver = match receiver {
            Some(receiver) => receiver,
            None => return Ok(None),
        };
        if matches!(interface_id, Some(id) if id as usize >= MAX_INTERFACES) {
            return Ok(None);
        }

        Ok(Some(LinkRecord {
            receiver,
            transmitter,
            version,
            interface_id,
            ack,
            drop_rate,
            unicast: flags & FLAG_UNICAST != 0,
            broadcast: flags & FLAG_BROADCAST != 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_overlay::address::SID_LEN;

    fn sid(seed: u8) -> SubscriberId {
        SubscriberId([seed; SID_LEN])
    }

    fn roundtrip(record: &LinkRecord, sender: SubscriberId) -> LinkRecord {
        let mut ctx = DecodeContext::new(Some(sender));
        let mut payload = OverlayBuffer::new();
        record.append(&mut ctx, &mut payload).unwrap();

        let mut ctx = DecodeContext::new(Some(sender));
        let mut reader = BufferReader::new(payload.as_slice());
        let parsed = LinkRecord::parse(&mut ctx, &mut reader).unwrap().unwrap();
        assert_eq!(reader.remaining(), 0);
        parsed
    }

    #[test]
    fn neighbour_record_roundtrips() {
        let record = LinkRecord {
            receiver: sid(1),
            transmitter: Some(sid(2)),
            version: 1,
            interface_id: Some(3),
            ack: Some(AckField {
                sequence: 0x42,
                mask: 0xDEAD_BEEF,
            }),
            drop_rate: None,
            unicast: false,
            broadcast: true,
        };
        assert_eq!(roundtrip(&record, sid(1)), record);
    }

    #[test]
    fn no_path_record_roundtrips() {
        let record = LinkRecord {
            receiver: sid(4),
            transmitter: None,
            version: 0xFF,
            interface_id: None,
            ack: None,
            drop_rate: Some(32),
            unicast: false,
            broadcast: false,
        };
        assert_eq!(roundtrip(&record, sid(1)), record);
    }

    #[test]
    fn unknown_trailing_bytes_are_skipped() {
        let record = LinkRecord {
            receiver: sid(1),
            transmitter: Some(sid(2)),
            version: 7,
            interface_id: None,
            ack: None,
            drop_rate: None,
            unicast: false,
            broadcast: false,
        };
        let mut ctx = DecodeContext::new(Some(sid(2)));
        let mut payload = OverlayBuffer::new();
        record.append(&mut ctx, &mut payload).unwrap();

        // splice three future-field bytes into the record and patch the length
        let mut bytes = payload.as_slice().to_vec();
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        bytes[0] += 3;

        let mut ctx = DecodeContext::new(Some(sid(2)));
        let mut reader = BufferReader::new(&bytes);
        let parsed = LinkRecord::parse(&mut ctx, &mut reader).unwrap().unwrap();
        assert_eq!(parsed, record);
        assert_eq!(reader.remaining(), 0, "tail must be consumed");
    }

    #[test]
    fn out_of_range_interface_skips_record_cleanly() {
        let record = LinkRecord {
            receiver: sid(1),
            transmitter: Some(sid(2)),
            version: 1,
            interface_id: Some(MAX_INTERFACES as u8),
            ack: None,
            drop_rate: None,
            unicast: false,
            broadcast: false,
        };
        let mut ctx = DecodeContext::new(Some(sid(2)));
        let mut payload = OverlayBuffer::new();
        record.append(&mut ctx, &mut payload).unwrap();
        let end = payload.position();

        let mut ctx = DecodeContext::new(Some(sid(2)));
        let mut reader = BufferReader::new(payload.as_slice());
        assert_eq!(LinkRecord::parse(&mut ctx, &mut reader), Ok(None));
        assert_eq!(reader.position(), end, "skip must land on the boundary");
    }

    #[test]
    fn truncated_record_aborts() {
        let record = LinkRecord {
            receiver: sid(1),
            transmitter: Some(sid(2)),
            version: 1,
            interface_id: None,
            ack: Some(AckField {
                sequence: 1,
                mask: 2,
            }),
            drop_rate: None,
            unicast: false,
            broadcast: false,
        };
        let mut ctx = DecodeContext::new(Some(sid(2)));
        let mut payload = OverlayBuffer::new();
        record.append(&mut ctx, &mut payload).unwrap();

        let cut = &payload.as_slice()[..payload.position() - 3];
        let mut ctx = DecodeContext::new(Some(sid(2)));
        let mut reader = BufferReader::new(cut);
        assert_eq!(
            LinkRecord::parse(&mut ctx, &mut reader),
            Err(OverlayError::Truncated)
        );
    }

    #[test]
    fn failed_append_rewinds_to_record_boundary() {
        let record = LinkRecord {
            receiver: sid(1),
            transmitter: Some(sid(2)),
            version: 1,
            interface_id: None,
            ack: None,
            drop_rate: None,
            unicast: false,
            broadcast: false,
        };
        let mut ctx = DecodeContext::new(Some(sid(9)));
        let mut payload = OverlayBuffer::with_limit(40);
        record.append(&mut ctx, &mut payload).unwrap();
        let pos = payload.position();

        let bigger = LinkRecord {
            receiver: sid(3),
            ..record
        };
        assert_eq!(
            bigger.append(&mut ctx, &mut payload),
            Err(OverlayError::BufferFull)
        );
        assert_eq!(payload.position(), pos);
    }
}
