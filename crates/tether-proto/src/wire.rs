//! Byte-level value codec.
//!
//! Integers are fixed-width little-endian; floats are their LE bit patterns;
//! strings, byte strings and sequences carry a u32-LE length prefix.
//! Writers reserve an 8-byte prefix (4 bytes flags + up to 4 bytes frame
//! header) so framing can complete the buffer in place without copying.

use crate::{ByteBuffer, Flags, FramingError, WireError, framing};

/// 4 bytes for the flags word plus up to 4 bytes of frame header.
pub const RESERVED_PREFIX: u32 = 8;

const DEFAULT_CAPACITY: u32 = 108;

/// Serialiser over a [`ByteBuffer`] with the framing prefix reserved.
pub struct WireWriter {
    buf: ByteBuffer,
}

impl WireWriter {
    pub fn new(initial_capacity: u32) -> Self {
        let mut buf = ByteBuffer::with_capacity(initial_capacity + RESERVED_PREFIX);
        buf.reserve_writer_prefix();
        Self { buf }
    }

    /// Reuses `buf`'s storage when possible, resetting it to an empty
    /// prefix-reserved state. Invalid handles get fresh storage.
    pub fn from_buffer(mut buf: ByteBuffer) -> Self {
        if !buf.valid() {
            return Self::new(DEFAULT_CAPACITY);
        }
        buf.reset_offset();
        buf.reserve_writer_prefix();
        Self { buf }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.size() == 0
    }

    #[inline]
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.append(bytes);
    }

    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.buf.append(&[v]);
    }

    #[inline]
    pub fn write_u16(&mut self, v: u16) {
        self.buf.append(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_u32(&mut self, v: u32) {
        self.buf.append(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_u64(&mut self, v: u64) {
        self.buf.append(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_i8(&mut self, v: i8) {
        self.buf.append(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_i16(&mut self, v: i16) {
        self.buf.append(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_i32(&mut self, v: i32) {
        self.buf.append(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_i64(&mut self, v: i64) {
        self.buf.append(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_f32(&mut self, v: f32) {
        self.buf.append(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_f64(&mut self, v: f64) {
        self.buf.append(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.append(s.as_bytes());
    }

    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.append(bytes);
    }

    /// Frames the accumulated payload in place and hands the buffer out,
    /// ready for a peer send queue.
    pub fn finish(mut self, flags: Flags) -> Result<ByteBuffer, FramingError> {
        framing::write_header_into(&mut self.buf, flags)?;
        Ok(self.buf)
    }

    /// The unframed buffer (prefix still reserved).
    pub fn into_buffer(self) -> ByteBuffer {
        self.buf
    }

    pub fn buffer(&self) -> &ByteBuffer {
        &self.buf
    }
}

/// Cursor over a frame body. Owns the frame buffer so dispatch can hand the
/// reader across threads.
pub struct WireReader {
    buf: ByteBuffer,
    pos: usize,
}

impl WireReader {
    /// `offset` is where reading starts, usually the frame's header size.
    pub fn new(buf: ByteBuffer, offset: usize) -> Self {
        Self { buf, pos: offset }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.size().saturating_sub(self.pos)
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn buffer(&self) -> &ByteBuffer {
        &self.buf
    }

    pub fn into_buffer(self) -> ByteBuffer {
        self.buf
    }

    fn take(&mut self, n: usize) -> Result<&[u8], WireError> {
        let have = self.remaining();
        if have < n {
            return Err(WireError::TooShort { needed: n, have });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf.as_slice()[start..start + n])
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_i8(&mut self) -> Result<i8, WireError> {
        Ok(self.read_u8()? as i8)
    }

    #[inline]
    pub fn read_i16(&mut self) -> Result<i16, WireError> {
        Ok(self.read_u16()? as i16)
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(self.read_u32()? as i32)
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(self.read_u64()? as i64)
    }

    #[inline]
    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_str(&mut self) -> Result<String, WireError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Utf8)
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Everything left in the body, without a length prefix.
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let rest = self.buf.as_slice()[self.pos..].to_vec();
        self.pos = self.buf.size();
        rest
    }
}

/// A value that serialises itself onto a [`WireWriter`].
pub trait Encode {
    fn encode(&self, w: &mut WireWriter);
}

/// A value that deserialises itself from a [`WireReader`].
pub trait Decode: Sized {
    fn decode(r: &mut WireReader) -> Result<Self, WireError>;
}

macro_rules! impl_scalar {
    ($($t:ty => $write:ident, $read:ident;)*) => {$(
        impl Encode for $t {
            #[inline]
            fn encode(&self, w: &mut WireWriter) {
                w.$write(*self);
            }
        }
        impl Decode for $t {
            #[inline]
            fn decode(r: &mut WireReader) -> Result<Self, WireError> {
                r.$read()
            }
        }
    )*};
}

impl_scalar! {
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i8 => write_i8, read_i8;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    bool => write_bool, read_bool;
}

impl Encode for str {
    fn encode(&self, w: &mut WireWriter) {
        w.write_str(self);
    }
}

impl Encode for String {
    fn encode(&self, w: &mut WireWriter) {
        w.write_str(self);
    }
}

impl Decode for String {
    fn decode(r: &mut WireReader) -> Result<Self, WireError> {
        r.read_str()
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, w: &mut WireWriter) {
        w.write_u32(self.len() as u32);
        for item in self {
            item.encode(w);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, w: &mut WireWriter) {
        self.as_slice().encode(w);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(r: &mut WireReader) -> Result<Self, WireError> {
        let len = r.read_u32()? as usize;
        // Bounded by what's actually in the body, so a hostile length prefix
        // can't balloon the allocation.
        let mut out = Vec::with_capacity(len.min(r.remaining()));
        for _ in 0..len {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, w: &mut WireWriter) {
        (**self).encode(w);
    }
}

/// Argument pack for RPC send/call: a tuple of up to eight `Encode` values.
/// Single arguments are written as one-element tuples, e.g. `(42u32,)`.
pub trait EncodeArgs {
    fn encode_all(&self, w: &mut WireWriter);
}

macro_rules! impl_encode_args {
    ($(($($name:ident : $idx:tt),*);)*) => {$(
        impl<$($name: Encode),*> EncodeArgs for ($($name,)*) {
            #[allow(unused_variables)]
            fn encode_all(&self, w: &mut WireWriter) {
                $(self.$idx.encode(w);)*
            }
        }
    )*};
}

impl_encode_args! {
    ();
    (A0: 0);
    (A0: 0, A1: 1);
    (A0: 0, A1: 1, A2: 2);
    (A0: 0, A1: 1, A2: 2, A3: 3);
    (A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
    (A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);
    (A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6);
    (A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6, A7: 7);
}
