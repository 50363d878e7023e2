//! # Overlay Frame Header
//!
//! Variable-layout header for overlay frames. The flag byte decides which
//! fields follow, so single-hop and broadcast frames elide everything they
//! can:
//!
//! ```text
//! +-------+----------+----------------------+-----------+------+
//! | flags | [source] | [bcast-id | dst,nh]  | [ttl|q<<5]| [typ]|
//! +-------+----------+----------------------+-----------+------+
//!           !SENDER_SAME                      !ONE_HOP    LEGACY_TYPE
//! ```
//!
//! The body written by [`append_frame`] is a 16-bit big-endian length
//! followed by the payload bytes.

use crate::address::{append_address, BroadcastId, DecodeContext, SubscriberId};
use crate::buffer::OverlayBuffer;
use crate::OverlayError;

// ─── Flags ──────────────────────────────────────────────────────────────────

/// Payload is encrypted.
pub const FLAG_CIPHERED: u8 = 0x01;
/// Payload carries a signature.
pub const FLAG_SIGNED: u8 = 0x02;
/// Frame will not be forwarded; ttl/queue byte and next-hop are elided.
pub const FLAG_ONE_HOP: u8 = 0x04;
/// Source is the packet sender; source address is elided.
pub const FLAG_SENDER_SAME: u8 = 0x08;
/// No destination address follows; the frame is a broadcast.
pub const FLAG_TO_BROADCAST: u8 = 0x10;
/// An explicit type byte follows the header.
pub const FLAG_LEGACY_TYPE: u8 = 0x20;

/// Highest ttl the combined ttl/queue byte can carry.
pub const PAYLOAD_TTL_MAX: u8 = 31;

// ─── Frame Descriptor ───────────────────────────────────────────────────────

/// Dispatch queue of a frame, two bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueClass {
    IsochronousVoice = 0,
    MeshManagement = 1,
    Ordinary = 2,
    Opportunistic = 3,
}

/// Frame type. Everything except `Data` is flagged `LEGACY_TYPE` and spelled
/// out as a trailing byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x40,
    SelfAnnounceAck = 0x20,
}

/// An outbound overlay frame: routing envelope plus payload.
#[derive(Debug, Clone)]
pub struct OverlayFrame {
    pub queue: QueueClass,
    pub frame_type: FrameType,
    pub ciphered: bool,
    pub signed: bool,
    /// 0..=[`PAYLOAD_TTL_MAX`].
    pub ttl: u8,
    /// Duplicate-suppression id for multi-hop broadcasts.
    pub broadcast_id: Option<BroadcastId>,
    pub next_hop: Option<SubscriberId>,
    /// `None` makes the frame a broadcast.
    pub destination: Option<SubscriberId>,
    pub source: SubscriberId,
    pub payload: OverlayBuffer,
}

impl OverlayFrame {
    /// A single-hop broadcast frame, the shape every link advertisement
    /// uses.
    pub fn new_broadcast(source: SubscriberId, queue: QueueClass) -> Self {
        OverlayFrame {
            queue,
            frame_type: FrameType::Data,
            ciphered: false,
            signed: false,
            ttl: 1,
            broadcast_id: None,
            next_hop: None,
            destination: None,
            source,
            payload: OverlayBuffer::new(),
        }
    }

    /// A unicast frame addressed directly to `destination`.
    pub fn new_unicast(
        source: SubscriberId,
        destination: SubscriberId,
        frame_type: FrameType,
        queue: QueueClass,
        ttl: u8,
    ) -> Self {
        OverlayFrame {
            queue,
            frame_type,
            ciphered: false,
            signed: false,
            ttl,
            broadcast_id: None,
            next_hop: Some(destination),
            destination: Some(destination),
            source,
            payload: OverlayBuffer::new(),
        }
    }
}

// ─── Header Builder ─────────────────────────────────────────────────────────

/// Compute the flag byte for a frame in the given packet context.
fn header_flags(ctx: &DecodeContext<'_>, frame: &OverlayFrame) -> u8 {
    let mut flags = 0;
    if frame.ciphered {
        flags |= FLAG_CIPHERED;
    }
    if frame.signed {
        flags |= FLAG_SIGNED;
    }
    if frame.ttl == 1 && frame.broadcast_id.is_none() {
        flags |= FLAG_ONE_HOP;
    }
    if frame.destination.is_some() && frame.destination == frame.next_hop {
        flags |= FLAG_ONE_HOP;
    }
    if ctx.sender() == Some(frame.source) {
        flags |= FLAG_SENDER_SAME;
    }
    if frame.destination.is_none() {
        flags |= FLAG_TO_BROADCAST;
    }
    if frame.frame_type != FrameType::Data {
        flags |= FLAG_LEGACY_TYPE;
    }
    flags
}

/// Emit the frame header into `buf`.
///
/// Layout: flag byte; source unless `SENDER_SAME`; broadcast id
/// (broadcast, multi-hop) or destination plus next hop (unicast, next hop
/// only when forwarding); combined `ttl | queue << 5` byte unless
/// `ONE_HOP`; type byte when `LEGACY_TYPE`.
pub fn build_header(
    ctx: &mut DecodeContext<'_>,
    buf: &mut OverlayBuffer,
    frame: &OverlayFrame,
) -> Result<(), OverlayError> {
    if frame.ttl > PAYLOAD_TTL_MAX {
        return Err(OverlayError::InvalidTtl(frame.ttl));
    }

    let flags = header_flags(ctx, frame);
    buf.append_byte(flags)?;

    if flags & FLAG_SENDER_SAME == 0 {
        append_address(ctx, buf, &frame.source)?;
    }

    if flags & FLAG_TO_BROADCAST != 0 {
        if flags & FLAG_ONE_HOP == 0 {
            let id = frame.broadcast_id.ok_or(OverlayError::InvalidAddress)?;
            buf.append_bytes(id.as_bytes())?;
        }
    } else {
        // destination presence is implied by !TO_BROADCAST
        let destination = frame.destination.ok_or(OverlayError::InvalidAddress)?;
        append_address(ctx, buf, &destination)?;
        if flags & FLAG_ONE_HOP == 0 {
            let next_hop = frame.next_hop.ok_or(OverlayError::InvalidAddress)?;
            append_address(ctx, buf, &next_hop)?;
        }
    }

    if flags & FLAG_ONE_HOP == 0 {
        buf.append_byte((frame.ttl & 0x1f) | ((frame.queue as u8 & 3) << 5))?;
    }

    if flags & FLAG_LEGACY_TYPE != 0 {
        buf.append_byte(frame.frame_type as u8)?;
    }

    Ok(())
}

/// Append a complete frame (header, 16-bit big-endian body length, body) to
/// an interface transmit buffer. Rewinds to the last checkpoint and keeps
/// the error on any failure, so a frame either lands whole or not at all.
pub fn append_frame(
    ctx: &mut DecodeContext<'_>,
    buf: &mut OverlayBuffer,
    frame: &OverlayFrame,
) -> Result<(), OverlayError> {
    buf.checkpoint();
    let result = (|| -> Result<(), OverlayError> {
        build_header(ctx, buf, frame)?;
        buf.append_u16_be(frame.payload.position() as u16)?;
        buf.append_bytes(frame.payload.as_slice())
    })();
    if result.is_err() {
        buf.rewind();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SID_LEN;

    fn sid(seed: u8) -> SubscriberId {
        SubscriberId([seed; SID_LEN])
    }

    fn build(ctx_sender: Option<SubscriberId>, frame: &OverlayFrame) -> Vec<u8> {
        let mut ctx = DecodeContext::new(ctx_sender);
        let mut buf = OverlayBuffer::new();
        build_header(&mut ctx, &mut buf, frame).unwrap();
        buf.as_slice().to_vec()
    }

    #[test]
    fn one_hop_broadcast_from_sender_is_one_byte() {
        let me = sid(1);
        let frame = OverlayFrame::new_broadcast(me, QueueClass::MeshManagement);
        let bytes = build(Some(me), &frame);
        assert_eq!(
            bytes,
            vec![FLAG_ONE_HOP | FLAG_SENDER_SAME | FLAG_TO_BROADCAST]
        );
    }

    #[test]
    fn unicast_to_next_hop_elides_ttl_byte() {
        let me = sid(1);
        let dst = sid(2);
        let frame = OverlayFrame::new_unicast(
            me,
            dst,
            FrameType::Data,
            QueueClass::Ordinary,
            6,
        );
        let bytes = build(Some(me), &frame);
        // destination == next_hop, so ONE_HOP despite ttl 6
        assert_eq!(bytes[0], FLAG_ONE_HOP | FLAG_SENDER_SAME);
        // flag byte + destination reference only
        assert_eq!(bytes.len(), 1 + 1 + SID_LEN);
    }

    #[test]
    fn forwarded_unicast_carries_next_hop_and_ttl_queue_byte() {
        let src = sid(1);
        let dst = sid(2);
        let hop = sid(3);
        let mut frame =
            OverlayFrame::new_unicast(src, dst, FrameType::Data, QueueClass::Ordinary, 7);
        frame.next_hop = Some(hop);
        let bytes = build(Some(sid(9)), &frame);
        assert_eq!(bytes[0], 0, "no flag applies");
        let ttl_queue = bytes[bytes.len() - 1];
        assert_eq!(ttl_queue & 0x1f, 7);
        assert_eq!((ttl_queue >> 5) & 3, QueueClass::Ordinary as u8);
    }

    #[test]
    fn multi_hop_broadcast_requires_an_id() {
        let me = sid(1);
        let mut frame = OverlayFrame::new_broadcast(me, QueueClass::Ordinary);
        frame.ttl = 4;
        let mut ctx = DecodeContext::new(Some(me));
        let mut buf = OverlayBuffer::new();
        assert_eq!(
            build_header(&mut ctx, &mut buf, &frame),
            Err(OverlayError::InvalidAddress)
        );

        frame.broadcast_id = Some(BroadcastId([7u8; crate::address::BROADCAST_LEN]));
        let bytes = build(Some(me), &frame);
        assert_eq!(bytes[0], FLAG_SENDER_SAME | FLAG_TO_BROADCAST);
        // flags + broadcast id + ttl/queue byte
        assert_eq!(bytes.len(), 1 + crate::address::BROADCAST_LEN + 1);
    }

    #[test]
    fn legacy_type_appends_type_byte() {
        let me = sid(1);
        let dst = sid(2);
        let frame = OverlayFrame::new_unicast(
            me,
            dst,
            FrameType::SelfAnnounceAck,
            QueueClass::MeshManagement,
            6,
        );
        let bytes = build(Some(me), &frame);
        assert_eq!(bytes[0] & FLAG_LEGACY_TYPE, FLAG_LEGACY_TYPE);
        assert_eq!(*bytes.last().unwrap(), FrameType::SelfAnnounceAck as u8);
    }

    #[test]
    fn ttl_out_of_range_rejected() {
        let me = sid(1);
        let mut frame = OverlayFrame::new_broadcast(me, QueueClass::Ordinary);
        frame.ttl = 32;
        let mut ctx = DecodeContext::new(Some(me));
        let mut buf = OverlayBuffer::new();
        assert_eq!(
            build_header(&mut ctx, &mut buf, &frame),
            Err(OverlayError::InvalidTtl(32))
        );
    }

    #[test]
    fn append_frame_rewinds_on_overflow() {
        let me = sid(1);
        let mut frame = OverlayFrame::new_broadcast(me, QueueClass::Ordinary);
        frame.payload.append_bytes(&[0u8; 64]).unwrap();

        let mut ctx = DecodeContext::new(Some(me));
        let mut buf = OverlayBuffer::with_limit(16);
        buf.append_bytes(b"prior").unwrap();
        assert_eq!(
            append_frame(&mut ctx, &mut buf, &frame),
            Err(OverlayError::BufferFull)
        );
        assert_eq!(buf.as_slice(), b"prior");
    }

    #[test]
    fn append_frame_writes_length_prefixed_body() {
        let me = sid(1);
        let mut frame = OverlayFrame::new_broadcast(me, QueueClass::MeshManagement);
        frame.payload.append_bytes(b"abc").unwrap();

        let mut ctx = DecodeContext::new(Some(me));
        let mut buf = OverlayBuffer::new();
        append_frame(&mut ctx, &mut buf, &frame).unwrap();
        assert_eq!(buf.as_slice(), &[0x1c, 0x00, 0x03, b'a', b'b', b'c']);
    }
}
