//! Wire layer of the tether runtime: packet flags, the pooled refcounted
//! byte buffer, variable-length frame headers, the incremental frame
//! decoder, and the byte-level value codec.

mod buffer;
mod decoder;
mod error;
mod flags;
pub mod framing;
mod wire;

pub use buffer::{ByteBuffer, STORAGE_HEADER_SIZE};
pub use decoder::FrameDecoder;
pub use error::{FramingError, WireError};
pub use flags::Flags;
pub use wire::{Decode, Encode, EncodeArgs, RESERVED_PREFIX, WireReader, WireWriter};
