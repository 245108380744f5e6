//! Draw submission types shared with the rendering backend.

use crate::xenos::{Endian, IndexFormat};

/// Index buffer description handed to the backend on an indexed draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBufferInfo {
    /// Guest physical base, masked to the index size alignment.
    pub guest_base: u32,
    pub endianness: Endian,
    pub format: IndexFormat,
    /// Total byte length of the index data.
    pub length: u32,
    /// Number of indices the draw consumes.
    pub count: u32,
}
