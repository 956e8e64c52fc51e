//! Relocatable heap images and their ancestor chains.

use std::{fmt, sync::Arc, sync::OnceLock};

use crate::{CanonicalAddr, Error, RealAddr, Result};

/// URI of the synthetic image at the root of every chain.
pub const BOOTSTRAP_URI: &str = "memory:bootstrap";

/// Real and canonical placement of one contiguous region.
///
/// A [`HeapImage`] produces one through [`HeapImage::span`]; a region that
/// has not become an image yet (the memory being saved or loaded) builds
/// one directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RelocationSpan {
    pub real_start: RealAddr,
    pub canonical_start: CanonicalAddr,
    pub size: u64,
}

impl RelocationSpan {
    #[inline]
    pub fn real_end(&self) -> RealAddr {
        self.real_start.add(self.size)
    }

    #[inline]
    pub fn canonical_end(&self) -> CanonicalAddr {
        self.canonical_start.add(self.size)
    }
}

/// One relocatable snapshot of objects.
///
/// Images are immutable once built, apart from the root object which the
/// loader binds exactly once. A child keeps its whole parent chain alive.
pub struct HeapImage {
    start: RealAddr,
    size: u32,
    uri: String,
    root: OnceLock<RealAddr>,
    hash: u32,
    parent: Option<Arc<HeapImage>>,
    canonical_start: CanonicalAddr,
}

impl HeapImage {
    pub fn new(
        start: RealAddr,
        size: u32,
        uri: impl Into<String>,
        root: Option<RealAddr>,
        hash: u32,
        parent: Option<Arc<HeapImage>>,
    ) -> Arc<Self> {
        let canonical_start = parent
            .as_ref()
            .map_or(CanonicalAddr::NULL, |p| p.canonical_end());
        let cell = OnceLock::new();
        if let Some(root) = root {
            let _ = cell.set(root);
        }
        Arc::new(Self {
            start,
            size,
            uri: uri.into(),
            root: cell,
            hash,
            parent,
            canonical_start,
        })
    }

    /// The parentless image every chain grows from.
    pub fn bootstrap(start: RealAddr, size: u32, hash: u32) -> Arc<Self> {
        Self::new(start, size, BOOTSTRAP_URI, None, hash, None)
    }

    #[inline]
    pub fn start(&self) -> RealAddr {
        self.start
    }

    #[inline]
    pub fn end(&self) -> RealAddr {
        self.start.add(self.size as u64)
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn root(&self) -> Option<RealAddr> {
        self.root.get().copied()
    }

    /// Bind the root object. Returns `false` if a root was already bound.
    pub fn set_root(&self, root: RealAddr) -> bool {
        self.root.set(root).is_ok()
    }

    pub fn parent(&self) -> Option<&Arc<HeapImage>> {
        self.parent.as_ref()
    }

    pub fn is_bootstrap(&self) -> bool {
        self.parent.is_none() && self.uri == BOOTSTRAP_URI
    }

    #[inline]
    pub fn canonical_start(&self) -> CanonicalAddr {
        self.canonical_start
    }

    #[inline]
    pub fn canonical_end(&self) -> CanonicalAddr {
        self.canonical_start.add(self.size as u64)
    }

    pub fn span(&self) -> RelocationSpan {
        RelocationSpan {
            real_start: self.start,
            canonical_start: self.canonical_start,
            size: self.size as u64,
        }
    }

    #[inline]
    pub fn contains_address(&self, addr: RealAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    #[inline]
    pub fn contains_canonical_address(&self, addr: CanonicalAddr) -> bool {
        addr >= self.canonical_start && addr < self.canonical_end()
    }

    /// Self first, then each parent up to the root of the chain.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors { next: Some(self) }
    }

    /// Number of images in the chain including this one.
    pub fn chain_len(&self) -> usize {
        self.ancestors().count()
    }

    /// The nearest image in the chain whose real range holds `addr`.
    pub fn find_address(&self, addr: RealAddr) -> Result<&HeapImage> {
        self.ancestors()
            .find(|image| image.contains_address(addr))
            .ok_or(Error::OutOfRange { address: addr.raw() })
    }

    /// The nearest image in the chain whose canonical range holds `addr`.
    pub fn find_canonical_address(&self, addr: CanonicalAddr) -> Result<&HeapImage> {
        self.ancestors()
            .find(|image| image.contains_canonical_address(addr))
            .ok_or(Error::OutOfRange { address: addr.raw() })
    }

    /// Translate an address inside this image (not its ancestors).
    pub fn to_canonical(&self, addr: RealAddr) -> Result<CanonicalAddr> {
        if !self.contains_address(addr) {
            return Err(Error::OutOfRange { address: addr.raw() });
        }
        Ok(self.canonical_start.add(addr.offset_from(self.start)))
    }

    /// Inverse of [`to_canonical`](Self::to_canonical).
    pub fn from_canonical(&self, addr: CanonicalAddr) -> Result<RealAddr> {
        if !self.contains_canonical_address(addr) {
            return Err(Error::OutOfRange { address: addr.raw() });
        }
        Ok(self.start.add(addr.offset_from(self.canonical_start)))
    }
}

impl fmt::Debug for HeapImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapImage")
            .field("uri", &self.uri)
            .field("start", &self.start)
            .field("size", &self.size)
            .field("canonical_start", &self.canonical_start)
            .field("hash", &format_args!("{:#010x}", self.hash))
            .field("root", &self.root())
            .field("parent", &self.parent.as_ref().map(|p| p.uri()))
            .finish()
    }
}

pub struct Ancestors<'a> {
    next: Option<&'a HeapImage>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a HeapImage;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent.as_deref();
        Some(current)
    }
}
