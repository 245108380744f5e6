//! Xenos ISA vocabulary: endian swap modes, shader and primitive types, draw
//! source selection, and the guest structures the command processor touches.

use crate::guest_memory::{GuestMemory, GuestMemoryError};

/// Byte-swap mode encoded in the low 2 bits of 4-byte-aligned guest address
/// fields. Producers mask the address before dereferencing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Endian {
    None = 0,
    Format8in16 = 1,
    Format8in32 = 2,
    Format16in32 = 3,
}

impl Endian {
    pub fn from_address(address: u32) -> Self {
        match address & 0x3 {
            0 => Endian::None,
            1 => Endian::Format8in16,
            2 => Endian::Format8in32,
            _ => Endian::Format16in32,
        }
    }
}

/// Swaps a value between guest and host representation under `endian`.
///
/// The operation is an involution: applying it twice yields the input.
pub fn gpu_swap(value: u32, endian: Endian) -> u32 {
    match endian {
        Endian::None => value,
        Endian::Format8in16 => ((value & 0x00FF00FF) << 8) | ((value >> 8) & 0x00FF00FF),
        Endian::Format8in32 => value.swap_bytes(),
        Endian::Format16in32 => value.rotate_right(16),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ShaderType {
    Vertex = 0,
    Pixel = 1,
}

impl ShaderType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Vertex),
            1 => Some(Self::Pixel),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PrimitiveType {
    None = 0x00,
    PointList = 0x01,
    LineList = 0x02,
    LineStrip = 0x03,
    TriangleList = 0x04,
    TriangleFan = 0x05,
    TriangleStrip = 0x06,
    TriangleWithWFlags = 0x07,
    RectangleList = 0x08,
    LineLoop = 0x0C,
    QuadList = 0x0D,
    QuadStrip = 0x0E,
    Polygon = 0x0F,
    // Explicit-major-mode primitives used by the 2D blitter paths.
    CopyRectListV0 = 0x10,
    CopyRectListV1 = 0x11,
    CopyRectListV2 = 0x12,
    CopyRectListV3 = 0x13,
    FillRectList = 0x14,
    CopyFullRectList = 0x15,
    LineStrip2D = 0x16,
}

impl PrimitiveType {
    /// First primitive type that forces explicit major mode.
    pub const EXPLICIT_MAJOR_MODE_FORCE_START: u32 = 0x10;

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0x00 => Self::None,
            0x01 => Self::PointList,
            0x02 => Self::LineList,
            0x03 => Self::LineStrip,
            0x04 => Self::TriangleList,
            0x05 => Self::TriangleFan,
            0x06 => Self::TriangleStrip,
            0x07 => Self::TriangleWithWFlags,
            0x08 => Self::RectangleList,
            0x0C => Self::LineLoop,
            0x0D => Self::QuadList,
            0x0E => Self::QuadStrip,
            0x0F => Self::Polygon,
            0x10 => Self::CopyRectListV0,
            0x11 => Self::CopyRectListV1,
            0x12 => Self::CopyRectListV2,
            0x13 => Self::CopyRectListV3,
            0x14 => Self::FillRectList,
            0x15 => Self::CopyFullRectList,
            0x16 => Self::LineStrip2D,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MajorMode {
    Implicit = 0,
    Explicit = 1,
}

pub fn is_major_mode_explicit(major_mode: MajorMode, primitive_type: PrimitiveType) -> bool {
    major_mode != MajorMode::Implicit
        || primitive_type as u32 >= PrimitiveType::EXPLICIT_MAJOR_MODE_FORCE_START
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum IndexFormat {
    Int16 = 0,
    Int32 = 1,
}

impl IndexFormat {
    pub fn size_bytes(self) -> u32 {
        match self {
            IndexFormat::Int16 => 2,
            IndexFormat::Int32 => 4,
        }
    }
}

/// Draw index source in `VGT_DRAW_INITIATOR`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SourceSelect {
    Dma = 0,
    Immediate = 1,
    AutoIndex = 2,
}

impl SourceSelect {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Dma),
            1 => Some(Self::Immediate),
            2 => Some(Self::AutoIndex),
            _ => None,
        }
    }
}

/// First payload word of an `XE_SWAP` packet.
pub const SWAP_SIGNATURE: u32 = u32::from_be_bytes(*b"SWAP");

/// VGT event initiator ids observed by downstream blocks.
pub const VIZQUERY_START: u32 = 0x07;
pub const VIZQUERY_END: u32 = 0x08;

pub const TEXTURE_2D_CUBE_MAX_WIDTH_HEIGHT: u32 = 8192;

/// Written by guest Direct3D into the sample-count structure as a big-endian
/// marker; the structure ABI itself is little-endian, so the sentinel shows up
/// byte-swapped when the fields are read natively.
pub const QUERY_FINISHED_SENTINEL: u32 = 0xFFFF_FEED_u32.swap_bytes();

/// Guest occlusion-query sample-count structure at `RB_SAMPLE_COUNT_ADDR`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DepthSampleCounts {
    pub z_pass_a: u32,
    pub z_pass_b: u32,
    pub z_fail_a: u32,
    pub z_fail_b: u32,
    pub total_a: u32,
    pub total_b: u32,
}

impl DepthSampleCounts {
    pub const SIZE_BYTES: usize = 24;

    pub fn read_from(
        memory: &impl GuestMemory,
        guest_addr: u32,
    ) -> Result<Self, GuestMemoryError> {
        let mut bytes = [0u8; Self::SIZE_BYTES];
        memory.read(guest_addr, &mut bytes)?;
        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        Ok(Self {
            z_pass_a: word(0),
            z_pass_b: word(1),
            z_fail_a: word(2),
            z_fail_b: word(3),
            total_a: word(4),
            total_b: word(5),
        })
    }

    pub fn write_to(
        &self,
        memory: &impl GuestMemory,
        guest_addr: u32,
    ) -> Result<(), GuestMemoryError> {
        let mut bytes = [0u8; Self::SIZE_BYTES];
        for (i, value) in [
            self.z_pass_a,
            self.z_pass_b,
            self.z_fail_a,
            self.z_fail_b,
            self.total_a,
            self.total_b,
        ]
        .into_iter()
        .enumerate()
        {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        memory.write(guest_addr, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn gpu_swap_modes() {
        assert_eq!(gpu_swap(0x11223344, Endian::None), 0x11223344);
        assert_eq!(gpu_swap(0x11223344, Endian::Format8in16), 0x22114433);
        assert_eq!(gpu_swap(0x11223344, Endian::Format8in32), 0x44332211);
        assert_eq!(gpu_swap(0x11223344, Endian::Format16in32), 0x33441122);
    }

    #[test]
    fn gpu_swap_is_an_involution() {
        for endian in [
            Endian::None,
            Endian::Format8in16,
            Endian::Format8in32,
            Endian::Format16in32,
        ] {
            for value in [0u32, 0xDEADBEEF, 0x00FF00FF, 0x12345678] {
                assert_eq!(gpu_swap(gpu_swap(value, endian), endian), value);
            }
        }
    }

    #[test]
    fn endian_decodes_from_address_low_bits() {
        assert_eq!(Endian::from_address(0x10000000), Endian::None);
        assert_eq!(Endian::from_address(0x10000001), Endian::Format8in16);
        assert_eq!(Endian::from_address(0x10000002), Endian::Format8in32);
        assert_eq!(Endian::from_address(0x10000003), Endian::Format16in32);
    }

    #[test]
    fn explicit_major_mode() {
        assert!(!is_major_mode_explicit(
            MajorMode::Implicit,
            PrimitiveType::TriangleList
        ));
        assert!(is_major_mode_explicit(
            MajorMode::Explicit,
            PrimitiveType::TriangleList
        ));
        assert!(is_major_mode_explicit(
            MajorMode::Implicit,
            PrimitiveType::FillRectList
        ));
    }

    #[test]
    fn depth_sample_counts_round_trip() {
        use crate::guest_memory::VecGuestMemory;
        let memory = VecGuestMemory::new(0x100);
        let counts = DepthSampleCounts {
            z_pass_a: 1,
            z_pass_b: 2,
            z_fail_a: 3,
            z_fail_b: 4,
            total_a: 5,
            total_b: 6,
        };
        counts.write_to(&memory, 0x20).unwrap();
        assert_eq!(DepthSampleCounts::read_from(&memory, 0x20).unwrap(), counts);
    }
}
