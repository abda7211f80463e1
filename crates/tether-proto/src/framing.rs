//! Variable-length frame headers.
//!
//! A header is 1..=4 little-endian bytes. The low 2 bits of byte 0 carry
//! `header_size - 1`, bits 2..3 carry the RPC-kind flag bits, and the
//! remaining bits carry `body_size - 1`. Bodies are 1..=2^28 bytes; an empty
//! body is unencodable.

use crate::{ByteBuffer, Flags, FramingError, STORAGE_HEADER_SIZE, wire::RESERVED_PREFIX};

pub const MAX_BODY_SIZE: u32 = 1 << 28;
pub const MAX_HEADER_SIZE: u32 = 4;

/// Header length needed for a body of `body_size` bytes, `None` when the
/// size cannot be framed.
#[inline]
pub fn header_size_for(body_size: u32) -> Option<u32> {
    match body_size {
        0 => None,
        s if s <= 1 << 4 => Some(1),
        s if s <= 1 << 12 => Some(2),
        s if s <= 1 << 20 => Some(3),
        s if s <= MAX_BODY_SIZE => Some(4),
        _ => None,
    }
}

/// Encodes a header into `out[..header_size]`. `header_size` must come from
/// [`header_size_for`] for this `body_size`.
pub fn write_header(out: &mut [u8], header_size: u32, body_size: u32, flags: Flags) {
    let mut h: u32 = 0;
    h |= (flags.0 & Flags::RPC_KIND_MASK) << 1;
    h |= header_size - 1;
    h |= (body_size - 1) << 4;
    for (i, byte) in out.iter_mut().take(header_size as usize).enumerate() {
        *byte = (h >> (i * 8)) as u8;
    }
}

/// Header length announced by the first header byte.
#[inline]
pub fn packet_header_size(first_byte: u8) -> u32 {
    (first_byte & 3) as u32 + 1
}

/// Re-derives packet flags: the two wire-visible kind bits merged over
/// whatever runtime-side bits the receiver supplies.
#[inline]
pub fn packet_flags(header: &[u8], other: Flags) -> Flags {
    other | Flags(((header[0] >> 1) & Flags::RPC_KIND_MASK as u8) as u32)
}

/// Body length encoded in `header[..header_size]`.
pub fn packet_body_size(header: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for (i, b) in header.iter().enumerate() {
        h |= (*b as u32) << (i * 8);
    }
    (h >> 4) + 1
}

/// Frames the buffer in place: stores `flags` in the reserved slot, writes
/// the header into the reserved prefix directly before the payload, and
/// extends the visible frame over it. No payload bytes move.
///
/// Fails when the buffer carries no reserved prefix or the payload is empty
/// or oversized — all programming errors on the caller's side.
pub fn write_header_into(buffer: &mut ByteBuffer, flags: Flags) -> Result<(), FramingError> {
    if buffer.size() == 0 {
        return Err(FramingError::EmptyBody);
    }
    if buffer.head_offset() != (STORAGE_HEADER_SIZE + RESERVED_PREFIX) as usize {
        return Err(FramingError::MissingPrefix);
    }
    let body = buffer.size() as u32;
    let header_size =
        header_size_for(body).ok_or(FramingError::BodyTooLarge(buffer.size()))?;

    buffer.write_reserved_flags(flags.0);
    let mut header = [0u8; MAX_HEADER_SIZE as usize];
    write_header(&mut header, header_size, body, flags);
    buffer.grow_head(header_size);
    buffer.as_mut_slice()[..header_size as usize]
        .copy_from_slice(&header[..header_size as usize]);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(flags: Flags, body_size: u32) -> (Flags, u32, u32) {
        let hs = header_size_for(body_size).unwrap();
        let mut header = [0u8; 4];
        write_header(&mut header, hs, body_size, flags);
        let got_hs = packet_header_size(header[0]);
        assert_eq!(got_hs, hs);
        let got_body = packet_body_size(&header[..hs as usize]);
        let got_flags = packet_flags(&header, Flags::UNRELIABLE);
        (got_flags, got_body, got_hs)
    }

    #[test]
    fn header_sizes() {
        assert_eq!(header_size_for(0), None);
        assert_eq!(header_size_for(1), Some(1));
        assert_eq!(header_size_for(16), Some(1));
        assert_eq!(header_size_for(17), Some(2));
        assert_eq!(header_size_for(4096), Some(2));
        assert_eq!(header_size_for(4097), Some(3));
        assert_eq!(header_size_for(1 << 20), Some(3));
        assert_eq!(header_size_for((1 << 20) + 1), Some(4));
        assert_eq!(header_size_for(MAX_BODY_SIZE), Some(4));
        assert_eq!(header_size_for(MAX_BODY_SIZE + 1), None);
    }

    #[test]
    fn boundary_bodies_round_trip() {
        for body in [1u32, 16, 17, 4096, 4097, 65536, MAX_BODY_SIZE] {
            for kind in
                [Flags::CALL_NO_FEEDBACK, Flags::CALL, Flags::RETURN_FEEDBACK, Flags::PROTOCOL_CONTROL]
            {
                let (flags, got_body, _) = round_trip(kind, body);
                assert_eq!(flags.kind(), kind, "body {body}");
                assert_eq!(got_body, body);
            }
        }
    }

    #[test]
    fn only_kind_bits_survive_the_wire() {
        let sent = Flags::RELIABLE | Flags::CALL | Flags(0xF0);
        let (flags, _, _) = round_trip(sent, 100);
        assert_eq!(flags, Flags::CALL);
        let (flags, _, _) = {
            let hs = header_size_for(100).unwrap();
            let mut header = [0u8; 4];
            write_header(&mut header, hs, 100, sent);
            (packet_flags(&header, Flags::RELIABLE), 0, 0)
        };
        assert_eq!(flags, Flags::RELIABLE | Flags::CALL);
    }

    #[test]
    fn frames_buffer_in_place() {
        let mut w = crate::WireWriter::new(64);
        w.write_u32(0xDEAD_BEEF);
        let mut buf = w.into_buffer();
        let payload_ptr = buf.data() as usize;
        write_header_into(&mut buf, Flags::RELIABLE | Flags::CALL).unwrap();
        assert_eq!(buf.size(), 5);
        assert_eq!(buf.data() as usize, payload_ptr - 1);
        assert_eq!(packet_header_size(buf.as_slice()[0]), 1);
        assert_eq!(packet_body_size(&buf.as_slice()[..1]), 4);
    }

    #[test]
    fn rejects_empty_and_unprefixed() {
        let w = crate::WireWriter::new(16);
        let mut empty = w.into_buffer();
        assert_eq!(write_header_into(&mut empty, Flags::RELIABLE), Err(FramingError::EmptyBody));

        let mut plain = ByteBuffer::with_capacity(16);
        plain.append(&[1, 2, 3]);
        assert_eq!(
            write_header_into(&mut plain, Flags::RELIABLE),
            Err(FramingError::MissingPrefix)
        );
    }
}
