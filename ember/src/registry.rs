//! Resident images by URI.

use std::{collections::HashMap, io::Read, sync::Arc};

use log::debug;
use parking_lot::RwLock;

use crate::{
    Error, HeapImage, RealAddr, Result,
    serializer::{LoadedImage, load_with_header, read_header},
};

/// Images currently resident, by URI.
///
/// A child image names its parent only by URI and hash, so loading goes
/// through the registry to find the parent chain.
#[derive(Debug, Default)]
pub struct ImageRegistry {
    images: RwLock<HashMap<String, Arc<HeapImage>>>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `image`, replacing any image previously registered under its URI.
    pub fn register(&self, image: Arc<HeapImage>) -> Option<Arc<HeapImage>> {
        self.images.write().insert(image.uri().to_string(), image)
    }

    pub fn get(&self, uri: &str) -> Option<Arc<HeapImage>> {
        self.images.read().get(uri).cloned()
    }

    pub fn remove(&self, uri: &str) -> Option<Arc<HeapImage>> {
        self.images.write().remove(uri)
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }

    /// Image in the registry whose real range holds `addr`.
    pub fn find_address(&self, addr: RealAddr) -> Result<Arc<HeapImage>> {
        self.images
            .read()
            .values()
            .find(|image| image.contains_address(addr))
            .cloned()
            .ok_or(Error::OutOfRange { address: addr.raw() })
    }

    /// Load `uri`, resolving its parent from the registry, and register it.
    pub fn load(&self, input: &mut dyn Read, uri: &str, place_at: RealAddr) -> Result<LoadedImage> {
        let header = read_header(input)?;
        let parent = if header.has_parent() {
            let parent = self.get(&header.parent_uri).ok_or_else(|| Error::UnknownImage {
                uri: header.parent_uri.clone(),
            })?;
            Some(parent)
        } else {
            None
        };
        let loaded = load_with_header(input, header, uri, parent, place_at)?;
        if let Some(old) = self.register(loaded.image.clone()) {
            debug!(target: "ember::image", "replaced resident image {}", old.uri());
        }
        Ok(loaded)
    }
}
