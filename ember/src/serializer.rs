//! Binary layout of saved heap images.
//!
//! ```text
//! magic          u32   0xDEADBEEF
//! minor_version  u16
//! major_version  u16
//! attributes     u32   bit0 32-bit pointers, bit1 big endian, bit2 type map
//! parent_hash    u32   0 without parent
//! parent_uri     u16 length + UTF-8 bytes, empty without parent
//! root_offset    u32
//! size           u32
//! oopmap         ceil(size / word / 8) bytes
//! padding        word-aligns `memory`
//! memory         size bytes, pointers canonical
//! typemap        size bytes, only with the type map attribute
//! ```
//!
//! Integers use the byte order named by the big endian attribute.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
    sync::Arc,
};

use bitflags::bitflags;
use log::{debug, error};

use crate::{
    AddressType, ByteOrder, CanonicalAddr, Error, HeapImage, OopMap, RealAddr,
    RelocationSpan, Result, WordSize,
    relocate::{Direction, Region, relocate_chain},
};

pub const IMAGE_MAGIC: u32 = 0xDEAD_BEEF;
pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 0;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Attributes: u32 {
        const POINTERS_32 = 1 << 0;
        const BIG_ENDIAN = 1 << 1;
        const TYPEMAP = 1 << 2;
    }
}

/// How an image is laid out on disk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageFormat {
    pub word: WordSize,
    pub byte_order: ByteOrder,
    /// Ignored unless the `typemap` feature is enabled.
    pub type_map: bool,
}

impl Default for ImageFormat {
    fn default() -> Self {
        Self {
            word: WordSize::host(),
            byte_order: ByteOrder::host(),
            type_map: cfg!(feature = "typemap"),
        }
    }
}

impl ImageFormat {
    pub fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::empty();
        if self.word == WordSize::Four {
            attrs.insert(Attributes::POINTERS_32);
        }
        if self.byte_order == ByteOrder::Big {
            attrs.insert(Attributes::BIG_ENDIAN);
        }
        if self.type_map && cfg!(feature = "typemap") {
            attrs.insert(Attributes::TYPEMAP);
        }
        attrs
    }

    fn from_attributes(attrs: Attributes) -> Self {
        Self {
            word: if attrs.contains(Attributes::POINTERS_32) {
                WordSize::Four
            } else {
                WordSize::Eight
            },
            byte_order: if attrs.contains(Attributes::BIG_ENDIAN) {
                ByteOrder::Big
            } else {
                ByteOrder::Little
            },
            type_map: attrs.contains(Attributes::TYPEMAP),
        }
    }
}

/// A copied object graph ready to be written once.
#[derive(Debug)]
pub struct ControlBlock {
    pub memory: Vec<u8>,
    /// Real address the copied objects were laid out for.
    pub start: RealAddr,
    pub oop_map: OopMap,
    /// Byte offset of the root object in `memory`.
    pub root: u32,
    /// One [`AddressType`] tag per memory byte, if the copier tracked them.
    pub type_map: Option<Vec<u8>>,
}

/// Everything in front of the padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub minor_version: u16,
    pub major_version: u16,
    pub attributes: Attributes,
    pub parent_hash: u32,
    pub parent_uri: String,
    pub root_offset: u32,
    pub size: u32,
    pub oop_map: Vec<u8>,
}

impl ImageHeader {
    pub fn format(&self) -> ImageFormat {
        ImageFormat::from_attributes(self.attributes)
    }

    pub fn has_parent(&self) -> bool {
        !self.parent_uri.is_empty()
    }

    /// Bytes from the magic up to the end of the oop map.
    pub fn encoded_len(&self) -> usize {
        fixed_header_len(self.parent_uri.len(), self.oop_map.len())
    }

    pub fn words(&self) -> usize {
        self.format().word.words_in(self.size as usize)
    }
}

/// A freshly loaded image with its relocated memory.
#[derive(Debug)]
pub struct LoadedImage {
    pub image: Arc<HeapImage>,
    pub header: ImageHeader,
    /// Memory with pointers in real coordinates, host byte order.
    pub memory: Vec<u8>,
    pub type_map: Option<Vec<u8>>,
}

fn fixed_header_len(parent_uri_len: usize, oop_map_len: usize) -> usize {
    4 + 2 + 2 + 4 + 4 + 2 + parent_uri_len + 4 + 4 + oop_map_len
}

/// Padding that puts `memory` on a word boundary both in the file and in
/// canonical space, where it starts after all ancestor sizes.
pub fn memory_padding(
    parent_uri_len: usize,
    oop_map_len: usize,
    canonical_start: CanonicalAddr,
    word: WordSize,
) -> usize {
    let w = word.bytes() as u64;
    let before = fixed_header_len(parent_uri_len, oop_map_len) as u64 + canonical_start.raw();
    ((w - before % w) % w) as usize
}

/// 32-bit FNV-1a over the memory block as it appears in the file.
pub fn image_hash(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(0x0100_0193)
    })
}

/// Reverse the byte order of every field in `memory`.
///
/// With a type map, each field is swapped at the width of its tag and
/// untyped bytes stay put; without one, every whole word is swapped.
/// Applying it twice restores the input.
pub fn swap_endian(memory: &mut [u8], word: WordSize, type_map: Option<&[u8]>) -> Result<()> {
    let Some(types) = type_map else {
        for index in 0..word.words_in(memory.len()) {
            word.swap(memory, index);
        }
        return Ok(());
    };

    if types.len() != memory.len() {
        return Err(Error::format(format!(
            "type map has {} entries for {} memory bytes",
            types.len(),
            memory.len()
        )));
    }

    let mut at = 0;
    while at < memory.len() {
        let tag = AddressType::from_u8(types[at])
            .ok_or_else(|| Error::format(format!("bad type tag {} at byte {at}", types[at])))?;
        let width = tag.width(word);
        if at + width > memory.len() {
            return Err(Error::format(format!(
                "{tag:?} field at byte {at} runs past the end of memory"
            )));
        }
        memory[at..at + width].reverse();
        at += width;
    }
    Ok(())
}

/// Write `block` as the image `uri`, canonicalizing its pointers against
/// `parent`'s chain and its own span first.
///
/// Returns the hash recorded for the written memory, which children of
/// this image will store as their `parent_hash`.
pub fn save(
    output: &mut dyn Write,
    uri: &str,
    block: ControlBlock,
    parent: Option<&HeapImage>,
    format: &ImageFormat,
) -> Result<u32> {
    let ControlBlock {
        mut memory,
        start,
        mut oop_map,
        root,
        type_map,
    } = block;

    let word = format.word;
    let order = format.byte_order;
    let size = u32::try_from(memory.len())
        .map_err(|_| Error::format("image memory does not fit a 32-bit size"))?;
    if memory.len() % word.bytes() != 0 {
        return Err(Error::format(format!(
            "image size {size} is not a multiple of the {}-byte word",
            word.bytes()
        )));
    }
    if size > 0 && root >= size {
        return Err(Error::format(format!("root offset {root} outside {size}-byte image")));
    }
    let words = word.words_in(memory.len());
    if oop_map.len() != words {
        return Err(Error::format(format!(
            "oop map covers {} words, image holds {words}",
            oop_map.len()
        )));
    }
    let mut attributes = format.attributes();
    let types = match type_map {
        Some(types) if attributes.contains(Attributes::TYPEMAP) => {
            if types.len() != memory.len() {
                return Err(Error::format("type map length differs from memory length"));
            }
            Some(types)
        }
        _ => {
            // without tracked types every word is swapped whole
            attributes.remove(Attributes::TYPEMAP);
            None
        }
    };

    let (parent_hash, parent_uri) = parent.map_or((0, ""), |p| (p.hash(), p.uri()));
    let canonical_start = parent.map_or(CanonicalAddr::NULL, |p| p.canonical_end());

    // Relocation clears the map, the file keeps the original bits.
    let oop_bytes = oop_map.as_bytes().to_vec();
    let span = RelocationSpan {
        real_start: start,
        canonical_start,
        size: size as u64,
    };
    let relocated = relocate_chain(
        &mut Region::new(&mut memory, word),
        &mut oop_map,
        &span,
        parent,
        Direction::ToCanonical,
        false,
        uri,
    )
    .inspect_err(|e| error!(target: "ember::image", "saving {uri} failed: {e}"))?;

    if !order.is_host() {
        swap_endian(&mut memory, word, types.as_deref())?;
    }

    write_u32(output, IMAGE_MAGIC, order)?;
    write_u16(output, MINOR_VERSION, order)?;
    write_u16(output, MAJOR_VERSION, order)?;
    write_u32(output, attributes.bits(), order)?;
    write_u32(output, parent_hash, order)?;
    write_string(output, parent_uri, order)?;
    write_u32(output, root, order)?;
    write_u32(output, size, order)?;
    output.write_all(&oop_bytes)?;

    let pad = memory_padding(parent_uri.len(), oop_bytes.len(), canonical_start, word);
    output.write_all(&[0u8; 8][..pad])?;
    output.write_all(&memory)?;
    if let Some(types) = &types {
        output.write_all(types)?;
    }

    let hash = image_hash(&memory);
    debug!(
        target: "ember::image",
        "saved {uri}: {size} bytes, {relocated} pointer(s), parent `{parent_uri}`, \
         hash {hash:#010x}"
    );
    Ok(hash)
}

pub fn save_to_path(
    path: &Path,
    uri: &str,
    block: ControlBlock,
    parent: Option<&HeapImage>,
    format: &ImageFormat,
) -> Result<u32> {
    let mut writer = BufWriter::new(File::create(path)?);
    let saved = save(&mut writer, uri, block, parent, format).and_then(|hash| {
        writer.flush()?;
        Ok(hash)
    });
    if saved.is_err() {
        drop(writer);
        let _ = fs::remove_file(path);
    }
    saved
}

/// Read everything up to the padding.
pub fn read_header(input: &mut dyn Read) -> Result<ImageHeader> {
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    let order = if u32::from_be_bytes(magic) == IMAGE_MAGIC {
        ByteOrder::Big
    } else if u32::from_le_bytes(magic) == IMAGE_MAGIC {
        ByteOrder::Little
    } else {
        return Err(Error::format("invalid image magic"));
    };

    let minor_version = read_u16(input, order)?;
    let major_version = read_u16(input, order)?;
    if major_version != MAJOR_VERSION {
        return Err(Error::format(format!(
            "unsupported image version {major_version}.{minor_version}"
        )));
    }

    let raw = read_u32(input, order)?;
    let attributes = Attributes::from_bits(raw)
        .ok_or_else(|| Error::format(format!("unknown image attributes {raw:#x}")))?;
    let declared = if attributes.contains(Attributes::BIG_ENDIAN) {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    };
    if declared != order {
        return Err(Error::format("byte order attribute contradicts the magic"));
    }
    if attributes.contains(Attributes::TYPEMAP) && !cfg!(feature = "typemap") {
        return Err(Error::format("image carries a type map but type maps are disabled"));
    }

    let parent_hash = read_u32(input, order)?;
    let parent_uri = read_string(input, order)?;
    let root_offset = read_u32(input, order)?;
    let size = read_u32(input, order)?;

    let format = ImageFormat::from_attributes(attributes);
    if size as usize % format.word.bytes() != 0 {
        return Err(Error::format(format!("image size {size} is not word aligned")));
    }
    if size > 0 && root_offset >= size {
        return Err(Error::format(format!("root offset {root_offset} outside {size}-byte image")));
    }
    let mut oop_map = vec![0u8; OopMap::byte_len(format.word.words_in(size as usize))];
    input.read_exact(&mut oop_map)?;

    Ok(ImageHeader {
        minor_version,
        major_version,
        attributes,
        parent_hash,
        parent_uri,
        root_offset,
        size,
        oop_map,
    })
}

/// Load the image `uri` and relocate it to `place_at`.
pub fn load(
    input: &mut dyn Read,
    uri: &str,
    parent: Option<Arc<HeapImage>>,
    place_at: RealAddr,
) -> Result<LoadedImage> {
    let header = read_header(input)?;
    load_with_header(input, header, uri, parent, place_at)
}

pub fn load_from_path(
    path: &Path,
    uri: &str,
    parent: Option<Arc<HeapImage>>,
    place_at: RealAddr,
) -> Result<LoadedImage> {
    let mut reader = BufReader::new(File::open(path)?);
    load(&mut reader, uri, parent, place_at)
}

/// Continue a load after [`read_header`], for callers that need the parent
/// URI before they can supply the parent.
pub fn load_with_header(
    input: &mut dyn Read,
    header: ImageHeader,
    uri: &str,
    parent: Option<Arc<HeapImage>>,
    place_at: RealAddr,
) -> Result<LoadedImage> {
    check_parent(&header, parent.as_deref())?;

    let format = header.format();
    let word = format.word;
    let canonical_start = parent
        .as_ref()
        .map_or(CanonicalAddr::NULL, |p| p.canonical_end());

    let pad = memory_padding(header.parent_uri.len(), header.oop_map.len(), canonical_start, word);
    let mut skip = [0u8; 8];
    input.read_exact(&mut skip[..pad])?;

    let mut memory = vec![0u8; header.size as usize];
    input.read_exact(&mut memory)?;
    let hash = image_hash(&memory);

    let type_map = if header.attributes.contains(Attributes::TYPEMAP) {
        let mut types = vec![0u8; header.size as usize];
        input.read_exact(&mut types)?;
        Some(types)
    } else {
        None
    };

    if !format.byte_order.is_host() {
        swap_endian(&mut memory, word, type_map.as_deref())?;
    }

    let mut oop_map = OopMap::from_bytes(&header.oop_map, header.words());
    let span = RelocationSpan {
        real_start: place_at,
        canonical_start,
        size: header.size as u64,
    };
    let relocated = relocate_chain(
        &mut Region::new(&mut memory, word),
        &mut oop_map,
        &span,
        parent.as_deref(),
        Direction::FromCanonical,
        false,
        uri,
    )
    .inspect_err(|e| error!(target: "ember::image", "loading {uri} failed: {e}"))?;

    let image = HeapImage::new(place_at, header.size, uri, None, hash, parent);
    image.set_root(place_at.add(header.root_offset as u64));

    debug!(
        target: "ember::image",
        "loaded {uri} at {place_at}: {} bytes, {relocated} pointer(s), hash {hash:#010x}",
        header.size
    );
    Ok(LoadedImage {
        image,
        header,
        memory,
        type_map,
    })
}

fn check_parent(header: &ImageHeader, parent: Option<&HeapImage>) -> Result<()> {
    let (found_uri, found_hash) = parent.map_or(("", 0), |p| (p.uri(), p.hash()));
    if header.parent_uri != found_uri || header.parent_hash != found_hash {
        return Err(Error::ParentMismatch {
            expected_uri: header.parent_uri.clone(),
            expected_hash: header.parent_hash,
            found_uri: found_uri.to_string(),
            found_hash,
        });
    }
    Ok(())
}

fn write_u16(w: &mut dyn Write, v: u16, order: ByteOrder) -> io::Result<()> {
    match order {
        ByteOrder::Little => w.write_all(&v.to_le_bytes()),
        ByteOrder::Big => w.write_all(&v.to_be_bytes()),
    }
}

fn read_u16(r: &mut dyn Read, order: ByteOrder) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(match order {
        ByteOrder::Little => u16::from_le_bytes(b),
        ByteOrder::Big => u16::from_be_bytes(b),
    })
}

fn write_u32(w: &mut dyn Write, v: u32, order: ByteOrder) -> io::Result<()> {
    match order {
        ByteOrder::Little => w.write_all(&v.to_le_bytes()),
        ByteOrder::Big => w.write_all(&v.to_be_bytes()),
    }
}

fn read_u32(r: &mut dyn Read, order: ByteOrder) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(match order {
        ByteOrder::Little => u32::from_le_bytes(b),
        ByteOrder::Big => u32::from_be_bytes(b),
    })
}

fn write_string(w: &mut dyn Write, s: &str, order: ByteOrder) -> Result<()> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| Error::format(format!("uri of {} bytes is too long", bytes.len())))?;
    write_u16(w, len, order)?;
    w.write_all(bytes)?;
    Ok(())
}

fn read_string(r: &mut dyn Read, order: ByteOrder) -> Result<String> {
    let len = read_u16(r, order)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| Error::format("invalid utf-8 in image"))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    const W: WordSize = WordSize::Eight;

    fn parent_chain() -> Arc<HeapImage> {
        let boot = HeapImage::bootstrap(RealAddr::new(0x1_0000), 96, 0x1111);
        HeapImage::new(RealAddr::new(0x2_0000), 64, "file://lib.img", None, 0x2222, Some(boot))
    }

    /// Four words: a pointer into the bootstrap image, a pointer into the
    /// parent, a pointer back into the block itself and a plain integer.
    fn block(start: RealAddr, parent: &HeapImage) -> ControlBlock {
        let boot = parent.parent().unwrap();
        let mut memory = vec![0u8; 4 * W.bytes()];
        W.write(&mut memory, 0, boot.start().raw() + 16);
        W.write(&mut memory, 1, parent.start().raw() + 8);
        W.write(&mut memory, 2, start.raw() + 24);
        W.write(&mut memory, 3, 0xABCD);
        let mut oop_map = OopMap::new(4);
        (0..3).for_each(|i| oop_map.set(i));
        ControlBlock {
            memory,
            start,
            oop_map,
            root: 8,
            type_map: None,
        }
    }

    fn save_to_vec(
        block: ControlBlock,
        parent: Option<&HeapImage>,
        format: &ImageFormat,
    ) -> (Vec<u8>, u32) {
        let mut out = Vec::new();
        let hash = save(&mut out, "file://app.img", block, parent, format).expect("save");
        (out, hash)
    }

    fn host_format() -> ImageFormat {
        ImageFormat {
            word: W,
            byte_order: ByteOrder::host(),
            type_map: false,
        }
    }

    #[test]
    fn header_fields_are_written_in_order() {
        let parent = parent_chain();
        let format = ImageFormat {
            byte_order: ByteOrder::Big,
            ..host_format()
        };
        let cb = block(RealAddr::new(0x9_0000), &parent);
        let (bytes, _) = save_to_vec(cb, Some(&parent), &format);

        assert_eq!(&bytes[0..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&bytes[4..6], &MINOR_VERSION.to_be_bytes());
        assert_eq!(&bytes[6..8], &MAJOR_VERSION.to_be_bytes());
        assert_eq!(&bytes[8..12], &Attributes::BIG_ENDIAN.bits().to_be_bytes());
        assert_eq!(&bytes[12..16], &0x2222u32.to_be_bytes());
        assert_eq!(&bytes[16..18], &14u16.to_be_bytes());
        assert_eq!(&bytes[18..32], b"file://lib.img");
        assert_eq!(&bytes[32..36], &8u32.to_be_bytes());
        assert_eq!(&bytes[36..40], &32u32.to_be_bytes());
        assert_eq!(bytes[40], 0b0000_0111);

        let header = read_header(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(header.encoded_len(), 41);
        assert_eq!(header.parent_uri, "file://lib.img");
        assert_eq!(header.format().byte_order, ByteOrder::Big);
    }

    #[test]
    fn saved_memory_is_canonical_and_word_aligned() {
        let parent = parent_chain();
        let start = RealAddr::new(0x9_0000);
        let (bytes, hash) = save_to_vec(block(start, &parent), Some(&parent), &host_format());

        let pad = memory_padding(14, 1, parent.canonical_end(), W);
        let memory_at = 41 + pad;
        assert_eq!((memory_at as u64 + parent.canonical_end().raw()) % 8, 0);
        assert_eq!(bytes.len(), memory_at + 32);

        let memory = &bytes[memory_at..];
        assert_eq!(W.read(memory, 0), 16);
        assert_eq!(W.read(memory, 1), 96 + 8);
        assert_eq!(W.read(memory, 2), 160 + 24);
        assert_eq!(W.read(memory, 3), 0xABCD);
        assert_eq!(hash, image_hash(memory));
    }

    #[test]
    fn round_trip_restores_memory_root_and_hash() {
        let parent = parent_chain();
        let start = RealAddr::new(0x9_0000);
        let original = block(start, &parent).memory;
        let (bytes, hash) = save_to_vec(block(start, &parent), Some(&parent), &host_format());

        let loaded =
            load(&mut Cursor::new(&bytes), "file://app.img", Some(parent.clone()), start).unwrap();
        assert_eq!(loaded.memory, original);
        assert_eq!(loaded.image.hash(), hash);
        assert_eq!(loaded.image.root(), Some(start.add(8)));
        assert_eq!(loaded.image.canonical_start(), parent.canonical_end());
        assert_eq!(loaded.header.root_offset, 8);
        assert_eq!(loaded.image.parent().unwrap().uri(), "file://lib.img");
    }

    #[test]
    fn loading_elsewhere_rebases_self_pointers_only() {
        let parent = parent_chain();
        let start = RealAddr::new(0x9_0000);
        let (bytes, _) = save_to_vec(block(start, &parent), Some(&parent), &host_format());

        let moved = RealAddr::new(0x40_0000);
        let loaded =
            load(&mut Cursor::new(&bytes), "file://app.img", Some(parent.clone()), moved).unwrap();
        let boot = parent.parent().unwrap();
        assert_eq!(W.read(&loaded.memory, 0), boot.start().raw() + 16);
        assert_eq!(W.read(&loaded.memory, 1), parent.start().raw() + 8);
        assert_eq!(W.read(&loaded.memory, 2), moved.raw() + 24);
        assert_eq!(loaded.image.start(), moved);
    }

    #[test]
    fn foreign_byte_order_round_trips() {
        let parent = parent_chain();
        let start = RealAddr::new(0x9_0000);
        let original = block(start, &parent).memory;
        let foreign = match ByteOrder::host() {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        };
        let format = ImageFormat {
            byte_order: foreign,
            ..host_format()
        };
        let (bytes, _) = save_to_vec(block(start, &parent), Some(&parent), &format);
        let loaded = load(&mut Cursor::new(&bytes), "file://app.img", Some(parent), start).unwrap();
        assert_eq!(loaded.memory, original);
    }

    #[test]
    fn thirty_two_bit_image_without_parent() {
        let start = RealAddr::new(0x1000);
        let mut memory = vec![0u8; 16];
        WordSize::Four.write(&mut memory, 0, 0x1008);
        WordSize::Four.write(&mut memory, 2, 77);
        let mut oop_map = OopMap::new(4);
        oop_map.set(0);
        oop_map.set(1);
        let cb = ControlBlock {
            memory: memory.clone(),
            start,
            oop_map,
            root: 0,
            type_map: None,
        };
        let format = ImageFormat {
            word: WordSize::Four,
            ..host_format()
        };
        let (bytes, _) = save_to_vec(cb, None, &format);
        let header = read_header(&mut Cursor::new(&bytes)).unwrap();
        assert!(header.attributes.contains(Attributes::POINTERS_32));
        assert!(!header.has_parent());

        let loaded = load(&mut Cursor::new(&bytes), "file://app.img", None, start).unwrap();
        assert_eq!(loaded.memory, memory);
        assert_eq!(loaded.image.canonical_start(), CanonicalAddr::NULL);
    }

    #[test]
    fn stray_pointer_is_an_integrity_violation() {
        let parent = parent_chain();
        let start = RealAddr::new(0x9_0000);
        let mut cb = block(start, &parent);
        W.write(&mut cb.memory, 3, 0x7777_0000);
        cb.oop_map.set(3);
        let mut out = Vec::new();
        let err = save(&mut out, "file://app.img", cb, Some(&parent), &host_format())
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { remaining: 1, .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn failed_save_to_path_leaves_no_file() {
        let mut path = std::env::temp_dir();
        path.push(format!("ember-image-stray-{}.img", std::process::id()));
        let parent = parent_chain();
        let mut cb = block(RealAddr::new(0x9_0000), &parent);
        W.write(&mut cb.memory, 3, 0x7777_0000);
        cb.oop_map.set(3);

        let err = save_to_path(&path, "file://app.img", cb, Some(&parent), &host_format())
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn pointer_outside_every_span_fails_the_load() {
        let parent = parent_chain();
        let start = RealAddr::new(0x9_0000);
        let (mut bytes, _) =
            save_to_vec(block(start, &parent), Some(&parent), &host_format());

        let header = read_header(&mut Cursor::new(&bytes)).unwrap();
        let pad = memory_padding(14, 1, parent.canonical_end(), W);
        let memory_at = header.encoded_len() + pad;
        // canonical spans end at 96 + 64 + 32
        W.write(&mut bytes[memory_at..], 1, 0x5000);

        let err = load(&mut Cursor::new(&bytes), "file://app.img", Some(parent), start)
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { remaining: 1, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn foreign_order_without_tracked_types_swaps_whole_words() {
        let parent = parent_chain();
        let foreign = match ByteOrder::host() {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        };
        let format = ImageFormat {
            byte_order: foreign,
            type_map: true,
            ..host_format()
        };
        let cb = block(RealAddr::new(0x9_0000), &parent);
        assert!(cb.type_map.is_none());
        let (bytes, _) = save_to_vec(cb, Some(&parent), &format);

        let header = read_header(&mut Cursor::new(&bytes)).unwrap();
        assert!(!header.attributes.contains(Attributes::TYPEMAP));
        let memory_at = header.encoded_len() + memory_padding(14, 1, parent.canonical_end(), W);
        assert_eq!(bytes.len(), memory_at + 32);

        let word = |value: u64| match foreign {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        };
        assert_eq!(&bytes[memory_at..memory_at + 8], &word(16));
        assert_eq!(&bytes[memory_at + 24..memory_at + 32], &word(0xABCD));
    }

    #[test]
    fn wrong_parent_is_rejected() {
        let parent = parent_chain();
        let start = RealAddr::new(0x9_0000);
        let (bytes, _) = save_to_vec(block(start, &parent), Some(&parent), &host_format());

        let impostor =
            HeapImage::new(RealAddr::new(0x2_0000), 64, "file://lib.img", None, 0x3333, None);
        let err =
            load(&mut Cursor::new(&bytes), "file://app.img", Some(impostor), start).unwrap_err();
        assert!(matches!(
            err,
            Error::ParentMismatch {
                expected_hash: 0x2222,
                found_hash: 0x3333,
                ..
            }
        ));

        let err = load(&mut Cursor::new(&bytes), "file://app.img", None, start).unwrap_err();
        assert!(matches!(err, Error::ParentMismatch { .. }));
    }

    #[test]
    fn bad_magic_and_truncation() {
        let err = read_header(&mut Cursor::new(&[1u8, 2, 3, 4])).unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        let parent = parent_chain();
        let cb = block(RealAddr::new(0x9_0000), &parent);
        let (bytes, _) = save_to_vec(cb, Some(&parent), &host_format());
        let err = load(
            &mut Cursor::new(&bytes[..bytes.len() - 3]),
            "file://app.img",
            Some(parent),
            RealAddr::new(0x9_0000),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn unaligned_memory_is_refused() {
        let cb = ControlBlock {
            memory: vec![0u8; 12],
            start: RealAddr::new(0x1000),
            oop_map: OopMap::new(1),
            root: 0,
            type_map: None,
        };
        let mut out = Vec::new();
        assert!(save(&mut out, "file://x.img", cb, None, &host_format()).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn word_swap_is_self_inverse() {
        let original: Vec<u8> = (0u8..37).collect();
        let mut bytes = original.clone();
        swap_endian(&mut bytes, W, None).unwrap();
        assert_ne!(bytes, original);
        assert_eq!(bytes[36], 36);
        swap_endian(&mut bytes, W, None).unwrap();
        assert_eq!(bytes, original);
    }

    #[test]
    fn typed_swap_uses_field_widths() {
        let original: Vec<u8> = (1u8..=16).collect();
        let mut types = vec![AddressType::Undefined as u8; 16];
        types[0] = AddressType::Byte as u8;
        types[1] = AddressType::Undefined as u8;
        types[2] = AddressType::Short as u8;
        types[4] = AddressType::Int as u8;
        types[8] = AddressType::Ref as u8;

        let mut bytes = original.clone();
        swap_endian(&mut bytes, W, Some(&types)).unwrap();
        assert_eq!(&bytes[..8], &[1, 2, 4, 3, 8, 7, 6, 5]);
        assert_eq!(&bytes[8..], &[16, 15, 14, 13, 12, 11, 10, 9]);
        swap_endian(&mut bytes, W, Some(&types)).unwrap();
        assert_eq!(bytes, original);
    }

    #[cfg(feature = "typemap")]
    #[test]
    fn type_map_is_appended_and_read_back() {
        let parent = parent_chain();
        let start = RealAddr::new(0x9_0000);
        let mut cb = block(start, &parent);
        let mut types = vec![AddressType::Ref as u8; 32];
        types[24..].fill(AddressType::Long as u8);
        cb.type_map = Some(types.clone());
        let format = ImageFormat {
            type_map: true,
            ..host_format()
        };
        let (bytes, _) = save_to_vec(cb, Some(&parent), &format);
        assert_eq!(&bytes[bytes.len() - 32..], &types[..]);

        let loaded = load(&mut Cursor::new(&bytes), "file://app.img", Some(parent), start).unwrap();
        assert_eq!(loaded.type_map, Some(types));
        assert!(loaded.header.attributes.contains(Attributes::TYPEMAP));
    }

    #[test]
    fn path_helpers_round_trip() {
        let mut path = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before unix epoch")
            .as_nanos();
        path.push(format!("ember-image-test-{}-{nanos}.img", std::process::id()));

        let parent = parent_chain();
        let start = RealAddr::new(0x9_0000);
        let original = block(start, &parent).memory;
        let hash = save_to_path(
            &path,
            "file://app.img",
            block(start, &parent),
            Some(&parent),
            &host_format(),
        )
        .expect("save image");
        let loaded =
            load_from_path(&path, "file://app.img", Some(parent), start).expect("load image");
        assert_eq!(loaded.memory, original);
        assert_eq!(loaded.image.hash(), hash);

        let _ = std::fs::remove_file(path);
    }
}
