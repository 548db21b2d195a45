//! Generation-checked handle type

use core::fmt;

/// Handle into an [`Arena`](crate::arena::Arena).
///
/// `index` selects the slot, `generation` must match the slot's current
/// generation. A token outliving its entry therefore never aliases a
/// newer occupant of the same slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    /// Sentinel value indicating no entry
    pub const NONE: Token = Token { index: u32::MAX, generation: 0 };

    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Token { index, generation }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.index == u32::MAX
    }

    /// Pack into a single opaque integer, e.g. a callback context value.
    #[inline]
    pub const fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Token { index: raw as u32, generation: (raw >> 32) as u32 }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Token(NONE)")
        } else {
            write!(f, "Token({}v{})", self.index, self.generation)
        }
    }
}
