//! Pointer relocation between real and canonical address spaces.
//!
//! Every set bit of an [`OopMap`] names a word of the region that holds a
//! pointer. A pass over one target span rewrites the pointers that land in
//! that span and clears their bits; pointers into other spans keep their
//! bits for a later pass over another ancestor. Once every ancestor and
//! the region's own span have been visited the map must be empty.

use log::{error, trace};

use crate::{Error, HeapImage, OopMap, RelocationSpan, Result, WordSize};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    ToCanonical,
    FromCanonical,
}

impl Direction {
    pub fn inverse(self) -> Self {
        match self {
            Direction::ToCanonical => Direction::FromCanonical,
            Direction::FromCanonical => Direction::ToCanonical,
        }
    }
}

/// Reports where a live, possibly moving object currently resides.
///
/// Detached snapshot buffers have no backing and skip the check.
pub trait BackingIdentity {
    fn identity(&self) -> u64;
}

struct LiveBacking<'a> {
    backing: &'a dyn BackingIdentity,
    expected: u64,
}

/// A block of words being relocated in place.
pub struct Region<'a> {
    bytes: &'a mut [u8],
    word: WordSize,
    live: Option<LiveBacking<'a>>,
}

impl<'a> Region<'a> {
    /// A detached buffer that nothing else can move.
    pub fn new(bytes: &'a mut [u8], word: WordSize) -> Self {
        Self {
            bytes,
            word,
            live: None,
        }
    }

    /// A view onto a live heap object whose identity must stay `expected`
    /// for the whole walk.
    pub fn live(
        bytes: &'a mut [u8],
        word: WordSize,
        backing: &'a dyn BackingIdentity,
        expected: u64,
    ) -> Self {
        Self {
            bytes,
            word,
            live: Some(LiveBacking { backing, expected }),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn word(&self) -> WordSize {
        self.word
    }

    pub fn words(&self) -> usize {
        self.word.words_in(self.bytes.len())
    }

    fn check_backing(&self) -> Result<()> {
        let Some(live) = &self.live else {
            return Ok(());
        };
        let found = live.backing.identity();
        if found != live.expected {
            error!(
                target: "ember::image",
                "backing object moved from {:#x} to {:#x} during relocation",
                live.expected, found
            );
            return Err(Error::ConcurrentMutation {
                expected: live.expected,
                found,
            });
        }
        Ok(())
    }
}

/// Relocate the pointers of `region` that point into `target`.
///
/// A pointer is claimed when `start < pointer <= end` in the source space
/// of `direction`. A pointer equal to `start` designates nothing and is
/// never claimed. Null words have their bits cleared untouched. With
/// `endian_swap` each pointer word is read in the opposite byte order;
/// claimed words are written back in host order and unclaimed words are
/// restored to the order they came in.
///
/// Returns the number of pointers rewritten.
pub fn relocate(
    region: &mut Region<'_>,
    oop_map: &mut OopMap,
    target: &RelocationSpan,
    direction: Direction,
    endian_swap: bool,
) -> Result<usize> {
    let word = region.word;
    let words = region.words();
    if oop_map.len() > words {
        return Err(Error::format(format!(
            "oop map covers {} words but region holds {words}",
            oop_map.len()
        )));
    }

    let (from_start, from_end, to_start) = match direction {
        Direction::ToCanonical => (
            target.real_start.raw(),
            target.real_end().raw(),
            target.canonical_start.raw(),
        ),
        Direction::FromCanonical => (
            target.canonical_start.raw(),
            target.canonical_end().raw(),
            target.real_start.raw(),
        ),
    };

    let mut relocated = 0;
    let mut next = oop_map.next_set_bit(0);
    while let Some(offset) = next {
        region.check_backing()?;

        if word.read(region.bytes, offset) == 0 {
            oop_map.clear(offset);
            next = oop_map.next_set_bit(offset + 1);
            continue;
        }

        if endian_swap {
            word.swap(region.bytes, offset);
        }
        let pointer = word.read(region.bytes, offset);

        if pointer > from_start && pointer <= from_end {
            let moved = pointer.wrapping_sub(from_start).wrapping_add(to_start);
            if moved > word.max_value() {
                return Err(Error::format(format!(
                    "relocated pointer {moved:#x} does not fit a {}-byte word",
                    word.bytes()
                )));
            }
            word.write(region.bytes, offset, moved);
            oop_map.clear(offset);
            relocated += 1;
        } else if endian_swap {
            word.swap(region.bytes, offset);
        }

        next = oop_map.next_set_bit(offset + 1);
    }

    trace!(
        target: "ember::image",
        "{direction:?}: {relocated} pointer(s) claimed by span {}..{}",
        target.real_start, target.real_end()
    );
    Ok(relocated)
}

/// Run [`relocate`] once per ancestor, nearest parent first.
///
/// Ancestor ranges never overlap, so the first image that claims a
/// pointer is the only one that can.
pub fn relocate_parents(
    region: &mut Region<'_>,
    oop_map: &mut OopMap,
    parent: Option<&HeapImage>,
    direction: Direction,
    endian_swap: bool,
) -> Result<usize> {
    let mut relocated = 0;
    let Some(parent) = parent else {
        return Ok(0);
    };
    for image in parent.ancestors() {
        if oop_map.cardinality() == 0 {
            break;
        }
        relocated += relocate(region, oop_map, &image.span(), direction, endian_swap)?;
    }
    Ok(relocated)
}

/// Fail unless every pointer bit has been claimed.
pub fn verify_clear_oop_map(oop_map: &OopMap, uri: &str) -> Result<()> {
    let remaining = oop_map.cardinality();
    if remaining == 0 {
        return Ok(());
    }
    for offset in oop_map.iter_set().take(8) {
        error!(target: "ember::image", "{uri}: unrelocated pointer at word {offset}");
    }
    Err(Error::IntegrityViolation {
        uri: uri.to_string(),
        remaining,
    })
}

/// Relocate against the whole parent chain, then the region's own span,
/// and verify that nothing is left over.
pub fn relocate_chain(
    region: &mut Region<'_>,
    oop_map: &mut OopMap,
    own: &RelocationSpan,
    parent: Option<&HeapImage>,
    direction: Direction,
    endian_swap: bool,
    uri: &str,
) -> Result<usize> {
    let mut relocated = relocate_parents(region, oop_map, parent, direction, endian_swap)?;
    relocated += relocate(region, oop_map, own, direction, endian_swap)?;
    verify_clear_oop_map(oop_map, uri)?;
    Ok(relocated)
}
