//! # Subscriber Addresses
//!
//! 32-byte subscriber identities (SIDs) and the per-packet abbreviating
//! codec used to reference them on the wire.
//!
//! ## Encoding
//!
//! A reference is a 1-byte tag followed by its operand:
//!
//! | tag | operand | meaning |
//! |-----|---------|---------|
//! | `0x00` | —        | the packet's sender |
//! | `0x01` | 32 bytes | a full SID; becomes abbreviatable for the rest of the packet |
//! | `0x02` | 8 bytes  | prefix abbreviation of a SID spelled earlier in the packet, or one the resolver knows |
//!
//! Abbreviation state lives in a per-packet [`DecodeContext`]; both sides
//! rebuild the same seen-list as they walk the payload, so the encoder may
//! abbreviate any SID it has already written in full. A prefix the parser
//! cannot resolve sets the context's `invalid_addresses` flag and is
//! remembered so the caller can ask the sender to explain it.

use std::fmt;

use crate::buffer::{BufferReader, OverlayBuffer};
use crate::OverlayError;

// ─── Subscriber Identity ────────────────────────────────────────────────────

/// Length of a subscriber identity in bytes.
pub const SID_LEN: usize = 32;

/// Length of a prefix abbreviation on the wire.
pub const PREFIX_LEN: usize = 8;

/// A stable 32-byte cryptographic subscriber identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub [u8; SID_LEN]);

impl SubscriberId {
    pub fn as_bytes(&self) -> &[u8; SID_LEN] {
        &self.0
    }

    /// The wire abbreviation prefix.
    pub fn prefix(&self) -> [u8; PREFIX_LEN] {
        let mut p = [0u8; PREFIX_LEN];
        p.copy_from_slice(&self.0[..PREFIX_LEN]);
        p
    }

    /// Full lowercase hex spelling.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(SID_LEN * 2);
        for b in self.0 {
            use fmt::Write;
            let _ = write!(s, "{b:02x}");
        }
        s
    }
}

impl fmt::Display for SubscriberId {
    /// Abbreviated to the first four bytes; logs don't need all 64 digits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "*")
    }
}

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({self})")
    }
}

// ─── Broadcast Identifier ───────────────────────────────────────────────────

/// Length of a broadcast identifier.
pub const BROADCAST_LEN: usize = 24;

/// Random identifier carried by multi-hop broadcast frames for duplicate
/// suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastId(pub [u8; BROADCAST_LEN]);

impl BroadcastId {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut id = [0u8; BROADCAST_LEN];
        rand::rng().fill_bytes(&mut id);
        BroadcastId(id)
    }

    pub fn as_bytes(&self) -> &[u8; BROADCAST_LEN] {
        &self.0
    }
}

// ─── Decode Context ─────────────────────────────────────────────────────────

/// Resolves prefix abbreviations the packet itself has not spelled out.
pub trait AddressResolver {
    /// Look up a full SID whose first [`PREFIX_LEN`] bytes match `prefix`.
    fn resolve_prefix(&self, prefix: &[u8; PREFIX_LEN]) -> Option<SubscriberId>;
}

/// Per-packet abbreviation state shared by the encoder and the parser.
pub struct DecodeContext<'a> {
    sender: Option<SubscriberId>,
    seen: Vec<SubscriberId>,
    invalid_addresses: bool,
    unresolved: Vec<[u8; PREFIX_LEN]>,
    resolver: Option<&'a dyn AddressResolver>,
}

impl<'a> DecodeContext<'a> {
    /// Context for a packet from (or to be parsed as sent by) `sender`.
    pub fn new(sender: Option<SubscriberId>) -> Self {
        DecodeContext {
            sender,
            seen: Vec::new(),
            invalid_addresses: false,
            unresolved: Vec::new(),
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: &'a dyn AddressResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn sender(&self) -> Option<SubscriberId> {
        self.sender
    }

    /// Whether the most recent parse hit an unresolvable reference.
    pub fn invalid_addresses(&self) -> bool {
        self.invalid_addresses
    }

    /// Reset the per-record invalid flag before parsing the next record.
    pub fn clear_invalid(&mut self) {
        self.invalid_addresses = false;
    }

    /// Prefixes that could not be resolved while parsing this packet, in
    /// arrival order, deduplicated. The caller batches these into a
    /// please-explain request for the sender.
    pub fn take_unresolved(&mut self) -> Vec<[u8; PREFIX_LEN]> {
        std::mem::take(&mut self.unresolved)
    }

    fn note_seen(&mut self, sid: SubscriberId) {
        if !self.seen.contains(&sid) {
            self.seen.push(sid);
        }
    }

    fn lookup_prefix(&self, prefix: &[u8; PREFIX_LEN]) -> Option<SubscriberId> {
        self.seen
            .iter()
            .copied()
            .find(|sid| &sid.prefix() == prefix)
            .or_else(|| self.resolver.and_then(|r| r.resolve_prefix(prefix)))
    }
}

// ─── Codec ──────────────────────────────────────────────────────────────────

const TAG_SENDER: u8 = 0x00;
const TAG_FULL: u8 = 0x01;
const TAG_PREFIX: u8 = 0x02;

/// Append a subscriber reference, abbreviating where the context allows.
pub fn append_address(
    ctx: &mut DecodeContext<'_>,
    buf: &mut OverlayBuffer,
    sid: &SubscriberId,
) -> Result<(), OverlayError> {
    if ctx.sender == Some(*sid) {
        return buf.append_byte(TAG_SENDER);
    }
    if ctx.seen.contains(sid) {
        // probe the space for both bytes up front so a failure is atomic
        if buf.remaining() < 1 + PREFIX_LEN {
            return Err(OverlayError::BufferFull);
        }
        buf.append_byte(TAG_PREFIX)?;
        return buf.append_bytes(&sid.prefix());
    }
    if buf.remaining() < 1 + SID_LEN {
        return Err(OverlayError::BufferFull);
    }
    buf.append_byte(TAG_FULL)?;
    buf.append_bytes(sid.as_bytes())?;
    ctx.note_seen(*sid);
    Ok(())
}

/// Parse a subscriber reference.
///
/// `Ok(None)` means the reference was syntactically valid but could not be
/// resolved; the context's invalid flag is set and the record should be
/// skipped. `Err(Truncated)` means the payload ended mid-reference.
pub fn parse_address(
    ctx: &mut DecodeContext<'_>,
    reader: &mut BufferReader<'_>,
) -> Result<Option<SubscriberId>, OverlayError> {
    let tag = reader.get_byte().ok_or(OverlayError::Truncated)?;
    match tag {
        TAG_SENDER => match ctx.sender {
            Some(sid) => Ok(Some(sid)),
            None => {
                ctx.invalid_addresses = true;
                Ok(None)
            }
        },
        TAG_FULL => {
            let raw = reader.get_bytes(SID_LEN).ok_or(OverlayError::Truncated)?;
            let mut sid = [0u8; SID_LEN];
            sid.copy_from_slice(raw);
            let sid = SubscriberId(sid);
            ctx.note_seen(sid);
            Ok(Some(sid))
        }
        TAG_PREFIX => {
            let raw = reader.get_bytes(PREFIX_LEN).ok_or(OverlayError::Truncated)?;
            let mut prefix = [0u8; PREFIX_LEN];
            prefix.copy_from_slice(raw);
            match ctx.lookup_prefix(&prefix) {
                Some(sid) => Ok(Some(sid)),
                None => {
                    ctx.invalid_addresses = true;
                    if !ctx.unresolved.contains(&prefix) {
                        ctx.unresolved.push(prefix);
                    }
                    Ok(None)
                }
            }
        }
        _ => Err(OverlayError::InvalidAddress),
    }
}
