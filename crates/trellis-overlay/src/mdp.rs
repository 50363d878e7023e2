//! # MDP Port Prefix
//!
//! The port-multiplex layer prefixes every payload with a source and
//! destination port pair; this core only consumes that one ability. Ports
//! are packed 7-bits-per-byte so the common low-numbered ports cost a
//! single byte each.

use crate::buffer::{BufferReader, OverlayBuffer};
use crate::OverlayError;

/// Port carrying link-state advertisements.
pub const PORT_LINKSTATE: u32 = 9;

/// Prefix `payload` with a source/destination port pair.
pub fn encode_port_pair(
    buf: &mut OverlayBuffer,
    source: u32,
    destination: u32,
) -> Result<(), OverlayError> {
    buf.append_packed_u32(source)?;
    buf.append_packed_u32(destination)
}

/// Read a source/destination port pair off the front of a payload.
pub fn decode_port_pair(reader: &mut BufferReader<'_>) -> Option<(u32, u32)> {
    let source = reader.get_packed_u32()?;
    let destination = reader.get_packed_u32()?;
    Some((source, destination))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linkstate_pair_is_two_bytes() {
        let mut buf = OverlayBuffer::new();
        encode_port_pair(&mut buf, PORT_LINKSTATE, PORT_LINKSTATE).unwrap();
        assert_eq!(buf.as_slice(), &[9, 9]);

        let mut r = BufferReader::new(buf.as_slice());
        assert_eq!(
            decode_port_pair(&mut r),
            Some((PORT_LINKSTATE, PORT_LINKSTATE))
        );
    }

    #[test]
    fn wide_ports_roundtrip() {
        let mut buf = OverlayBuffer::new();
        encode_port_pair(&mut buf, 0x3FFF, 0x1234_5678).unwrap();
        let mut r = BufferReader::new(buf.as_slice());
        assert_eq!(decode_port_pair(&mut r), Some((0x3FFF, 0x1234_5678)));
        assert_eq!(r.remaining(), 0);
    }
}
