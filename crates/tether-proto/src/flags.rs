use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Per-packet flag word.
///
/// Only bits 1..2 (the RPC kind) travel on the wire, packed into the frame
/// header; everything else is runtime-side. Bits above the low three are
/// application-private.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Hash)]
pub struct Flags(pub u32);

impl Flags {
    pub const UNRELIABLE: Flags = Flags(0);
    /// Delivery hint; TCP frames are always reliable in practice.
    pub const RELIABLE: Flags = Flags(1);

    pub const CALL_NO_FEEDBACK: Flags = Flags(0);
    pub const CALL: Flags = Flags(2);
    pub const RETURN_FEEDBACK: Flags = Flags(4);
    pub const PROTOCOL_CONTROL: Flags = Flags(6);

    pub const RPC_KIND_MASK: u32 = 6;

    /// The RPC kind bits, one of the four `CALL_*`/`RETURN_*`/`PROTOCOL_*`
    /// values.
    #[inline]
    pub fn kind(self) -> Flags {
        Flags(self.0 & Self::RPC_KIND_MASK)
    }

    /// Replaces the RPC kind bits, keeping everything else.
    #[inline]
    pub fn with_kind(self, kind: Flags) -> Flags {
        Flags((self.0 & !Self::RPC_KIND_MASK) | (kind.0 & Self::RPC_KIND_MASK))
    }

    #[inline]
    pub fn is_reliable(self) -> bool {
        self.0 & Self::RELIABLE.0 != 0
    }

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    #[inline]
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    #[inline]
    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}
