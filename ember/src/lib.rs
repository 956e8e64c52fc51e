//! Heap images, pointer relocation, image files and method metadata for a
//! small bytecode VM, plus the facade its collectors run behind.

mod address;
pub mod collector;
mod error;
mod image;
pub mod method_header;
mod oopmap;
pub mod registry;
pub mod relocate;
pub mod serializer;
mod types;

pub use address::{ByteOrder, CanonicalAddr, RealAddr, WordSize};
pub use collector::{CollectionRoutine, GarbageCollector, GcCreateInfo, ManagedMemory};
pub use error::{Error, Result};
pub use image::{Ancestors, BOOTSTRAP_URI, HeapImage, RelocationSpan};
pub use method_header::{MethodHeader, MethodRef};
pub use oopmap::OopMap;
pub use registry::ImageRegistry;
pub use types::AddressType;
