/// Bit per word of a region: set means "this word holds a pointer that
/// the current relocation has not claimed yet".
///
/// Bit `i` lives in byte `i / 8` under mask `1 << (i % 8)`, which is also
/// the on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OopMap {
    bits: Vec<u8>,
    len: usize,
}

impl OopMap {
    /// Bytes needed to cover `words` words.
    #[inline]
    pub const fn byte_len(words: usize) -> usize {
        words.div_ceil(8)
    }

    pub fn new(words: usize) -> Self {
        Self {
            bits: vec![0; Self::byte_len(words)],
            len: words,
        }
    }

    /// Rebuild from serialized bytes. Bits past `words` are dropped.
    pub fn from_bytes(bytes: &[u8], words: usize) -> Self {
        let mut bits = vec![0; Self::byte_len(words)];
        let n = bits.len().min(bytes.len());
        bits[..n].copy_from_slice(&bytes[..n]);
        let mut map = Self { bits, len: words };
        map.mask_tail();
        map
    }

    fn mask_tail(&mut self) {
        let rem = self.len % 8;
        if rem != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u8 << rem) - 1;
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of words covered.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        assert!(index < self.len, "oop map index {index} out of range");
        self.bits[index >> 3] |= 1 << (index & 7);
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        assert!(index < self.len, "oop map index {index} out of range");
        self.bits[index >> 3] &= !(1 << (index & 7));
    }

    #[inline]
    pub fn is_set(&self, index: usize) -> bool {
        index < self.len && self.bits[index >> 3] & (1 << (index & 7)) != 0
    }

    pub fn cardinality(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// First set bit at or after `from`.
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        if from >= self.len {
            return None;
        }
        let mut byte = from >> 3;
        let mut current = self.bits[byte] & (0xFF << (from & 7));
        loop {
            if current != 0 {
                let index = (byte << 3) + current.trailing_zeros() as usize;
                return (index < self.len).then_some(index);
            }
            byte += 1;
            if byte >= self.bits.len() {
                return None;
            }
            current = self.bits[byte];
        }
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.next_set_bit(0), |&i| self.next_set_bit(i + 1))
    }
}
