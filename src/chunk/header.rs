//! Management header shared by class and instance chunks.

use crate::primitives::bytes::le;

use super::DataPtr;

/// Magic number identifying a class chunk.
pub const CLASS_MAGIC: u32 = 0xF00F_ABCD;
/// Magic number identifying an instance chunk.
pub const INSTANCE_MAGIC: u32 = 0xD00D_1234;
/// Length of the management header in bytes.
pub const HEADER_LEN: usize = 48;

/// Byte offsets for fixed header fields.
#[allow(missing_docs)]
pub mod offsets {
    pub const MAGIC: usize = 0;
    pub const RESERVED: usize = 4;
    pub const TOTAL_SIZE: usize = 8;
    pub const FREE_BYTES: usize = 16;
    pub const START_OF_FREE: usize = 24;
    pub const NUM_EXT_REF: usize = 32;
    pub const EXT_REF_CAPACITY: usize = 36;
    pub const EXT_REF_ARRAY: usize = 40;
}

/// Decoded copy of a chunk's management header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkHeader {
    /// Chunk kind marker.
    pub magic: u32,
    /// Allocated size of the chunk, header included.
    pub total_size: u64,
    /// Bytes still available after `start_of_free`.
    pub free_bytes: u64,
    /// Offset of the first unused byte; equals the in-use length.
    pub start_of_free: u64,
    /// Number of live external references.
    pub num_ext_ref: u32,
    /// Capacity of the external-reference index array, in entries.
    pub ext_ref_capacity: u32,
    /// Relative start of the external-reference index array.
    pub ext_ref_array: u64,
}

impl ChunkHeader {
    /// Header for a freshly allocated chunk whose fixed part ends at `fixed_len`.
    pub fn new(magic: u32, total_size: u64, fixed_len: u64) -> Self {
        Self {
            magic,
            total_size,
            free_bytes: total_size - fixed_len,
            start_of_free: fixed_len,
            num_ext_ref: 0,
            ext_ref_capacity: 0,
            ext_ref_array: 0,
        }
    }

    /// Writes the header into the first [`HEADER_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) {
        le::put_u32(dst, offsets::MAGIC, self.magic);
        le::put_u32(dst, offsets::RESERVED, 0);
        le::put_u64(dst, offsets::TOTAL_SIZE, self.total_size);
        le::put_u64(dst, offsets::FREE_BYTES, self.free_bytes);
        le::put_u64(dst, offsets::START_OF_FREE, self.start_of_free);
        le::put_u32(dst, offsets::NUM_EXT_REF, self.num_ext_ref);
        le::put_u32(dst, offsets::EXT_REF_CAPACITY, self.ext_ref_capacity);
        le::put_u64(dst, offsets::EXT_REF_ARRAY, self.ext_ref_array);
    }

    /// Decodes the header without validating it against the chunk length.
    pub fn decode(src: &[u8]) -> Option<Self> {
        Some(Self {
            magic: le::get_u32(src, offsets::MAGIC)?,
            total_size: le::get_u64(src, offsets::TOTAL_SIZE)?,
            free_bytes: le::get_u64(src, offsets::FREE_BYTES)?,
            start_of_free: le::get_u64(src, offsets::START_OF_FREE)?,
            num_ext_ref: le::get_u32(src, offsets::NUM_EXT_REF)?,
            ext_ref_capacity: le::get_u32(src, offsets::EXT_REF_CAPACITY)?,
            ext_ref_array: le::get_u64(src, offsets::EXT_REF_ARRAY)?,
        })
    }

    /// Relative pointer covering the external-reference index array.
    pub fn ext_ref_region(&self) -> DataPtr {
        DataPtr::new(self.ext_ref_array, u64::from(self.ext_ref_capacity) * 8)
    }
}
