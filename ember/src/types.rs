//! Type tags for memory bytes and frame slots.

use crate::WordSize;

/// Runtime type of a memory byte or a frame slot.
///
/// Used as the per-byte tag of an image's type map and as the slot
/// classification produced by
/// [`decode_type_map`](crate::method_header::decode_type_map). The type
/// table of a method header stores these tags as its class ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressType {
    Undefined = 0,
    Byte,
    Short,
    Int,
    Float,
    Long,
    /// Second half of a long in a 32-bit slot pair.
    Long2,
    Double,
    /// Second half of a double in a 32-bit slot pair.
    Double2,
    Ref,
    /// Word sized primitive with no finer classification.
    Word,
    UWord,
    Offset,
    Address,
}

impl AddressType {
    pub const COUNT: usize = Self::Address as usize + 1;

    pub fn from_u8(raw: u8) -> Option<Self> {
        use AddressType::*;
        Some(match raw {
            0 => Undefined,
            1 => Byte,
            2 => Short,
            3 => Int,
            4 => Float,
            5 => Long,
            6 => Long2,
            7 => Double,
            8 => Double2,
            9 => Ref,
            10 => Word,
            11 => UWord,
            12 => Offset,
            13 => Address,
            _ => return None,
        })
    }

    /// Width in bytes of a field tagged with this type.
    ///
    /// Slot halves and undefined bytes report 1 so that an endian swap
    /// leaves them alone.
    pub fn width(self, word: WordSize) -> usize {
        use AddressType::*;
        match self {
            Undefined | Byte | Long2 | Double2 => 1,
            Short => 2,
            Int | Float => 4,
            Long | Double => 8,
            Ref | Word | UWord | Offset | Address => word.bytes(),
        }
    }

    /// Type given to the paired slot of a double word entry.
    pub fn second_half(self) -> Option<Self> {
        match self {
            AddressType::Long => Some(AddressType::Long2),
            AddressType::Double => Some(AddressType::Double2),
            _ => None,
        }
    }
}
