//! Address spaces of a heap image.
//!
//! A heap image is addressed two ways: by the real address it occupies
//! in the running VM, and by a position independent canonical address
//! derived from the sizes of its ancestors. Both are plain integers
//! underneath, so they get separate types and only meet through
//! [`HeapImage::to_canonical`](crate::HeapImage::to_canonical) and
//! [`HeapImage::from_canonical`](crate::HeapImage::from_canonical).

use std::fmt;

/// Address in the running VM's memory.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RealAddr(u64);

/// Position independent address of a word inside an image chain.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CanonicalAddr(u64);

macro_rules! address_space {
    ($ty:ident, $prefix:literal) => {
        impl $ty {
            pub const NULL: Self = Self(0);

            #[inline(always)]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            #[inline(always)]
            pub const fn raw(self) -> u64 {
                self.0
            }

            #[inline(always)]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            #[inline(always)]
            pub const fn add(self, bytes: u64) -> Self {
                Self(self.0.wrapping_add(bytes))
            }

            /// Byte distance from `base` to `self`.
            #[inline(always)]
            pub const fn offset_from(self, base: Self) -> u64 {
                self.0.wrapping_sub(base.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{:#x}"), self.0)
            }
        }
    };
}

address_space!(RealAddr, "real:");
address_space!(CanonicalAddr, "canonical:");

/// Width of a pointer-sized word in a region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WordSize {
    Four,
    Eight,
}

impl WordSize {
    pub const fn host() -> Self {
        if cfg!(target_pointer_width = "32") {
            WordSize::Four
        } else {
            WordSize::Eight
        }
    }

    #[inline(always)]
    pub const fn bytes(self) -> usize {
        match self {
            WordSize::Four => 4,
            WordSize::Eight => 8,
        }
    }

    /// Largest value a word of this width can hold.
    pub const fn max_value(self) -> u64 {
        match self {
            WordSize::Four => u32::MAX as u64,
            WordSize::Eight => u64::MAX,
        }
    }

    /// Read the word at word index `index` in host byte order.
    #[inline]
    pub fn read(self, bytes: &[u8], index: usize) -> u64 {
        let at = index * self.bytes();
        match self {
            WordSize::Four => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&bytes[at..at + 4]);
                u32::from_ne_bytes(b) as u64
            }
            WordSize::Eight => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[at..at + 8]);
                u64::from_ne_bytes(b)
            }
        }
    }

    /// Write `value` into word index `index` in host byte order.
    /// Values wider than the word are truncated.
    #[inline]
    pub fn write(self, bytes: &mut [u8], index: usize, value: u64) {
        let at = index * self.bytes();
        match self {
            WordSize::Four => {
                bytes[at..at + 4].copy_from_slice(&(value as u32).to_ne_bytes())
            }
            WordSize::Eight => {
                bytes[at..at + 8].copy_from_slice(&value.to_ne_bytes())
            }
        }
    }

    /// Reverse the bytes of the word at word index `index`.
    #[inline]
    pub fn swap(self, bytes: &mut [u8], index: usize) {
        let at = index * self.bytes();
        bytes[at..at + self.bytes()].reverse();
    }

    /// Number of whole words in `len` bytes.
    #[inline]
    pub const fn words_in(self, len: usize) -> usize {
        len / self.bytes()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub const fn host() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    #[inline(always)]
    pub fn is_host(self) -> bool {
        self == Self::host()
    }
}
