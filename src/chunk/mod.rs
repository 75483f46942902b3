//! Single-chunk memory buffers.
//!
//! A chunk is one contiguous allocation that starts with a [`ChunkHeader`] and
//! carries variable-length records addressed by [`DataPtr`] offsets relative to
//! the chunk start. Because every internal reference is an offset, growing the
//! chunk (which may move it) never requires fixing up its contents.

pub mod header;

use tracing::trace;

use crate::error::{Result, ScmoError};
use crate::primitives::bytes::le;

pub use header::{ChunkHeader, CLASS_MAGIC, HEADER_LEN, INSTANCE_MAGIC};

/// Alignment applied to every allocation inside a chunk.
pub const CHUNK_ALIGN: u64 = 8;
/// Initial size used when building classes and instances from scratch.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
/// Encoded length of a [`DataPtr`].
pub const DATA_PTR_LEN: usize = 16;
/// Number of entries added whenever the external-reference index array fills up.
pub const EXT_REF_ARRAY_STEP: u32 = 8;

/// Relative pointer to a byte range inside a chunk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct DataPtr {
    /// Offset of the first byte, relative to the chunk start.
    pub start: u64,
    /// Length of the range in bytes.
    pub size: u64,
}

impl DataPtr {
    /// The empty range.
    pub const NULL: DataPtr = DataPtr { start: 0, size: 0 };

    /// Creates a new relative pointer.
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Returns true when the range is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the end offset, or `None` on overflow.
    pub fn checked_end(&self) -> Option<u64> {
        self.start.checked_add(self.size)
    }

    fn encode(&self, dst: &mut [u8], off: usize) {
        le::put_u64(dst, off, self.start);
        le::put_u64(dst, off + 8, self.size);
    }
}

/// Size accounting snapshot of a chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkStats {
    /// Allocated size, header included.
    pub total_size: u64,
    /// Unused bytes at the end of the chunk.
    pub free_bytes: u64,
    /// Bytes in use, header included.
    pub used_bytes: u64,
}

/// Allocates a zeroed byte vector, reporting failure instead of aborting.
pub(crate) fn raw_alloc(len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| ScmoError::OutOfMemory {
            requested: len as u64,
        })?;
    data.resize(len, 0);
    Ok(data)
}

/// A growable single-allocation buffer formatted as a chunk.
///
/// Reads that take offsets from chunk content are bounds-checked against the
/// in-use region and fail with [`ScmoError::Malformed`]; writes take offsets
/// computed by the owning layout and panic on overrun.
pub struct ChunkBuf {
    data: Vec<u8>,
}

impl ChunkBuf {
    /// Allocates a new chunk of `initial_size` bytes whose fixed part (header
    /// plus the owner's main record) occupies the first `fixed_len` bytes.
    pub fn allocate(magic: u32, initial_size: usize, fixed_len: usize) -> Result<Self> {
        if fixed_len < HEADER_LEN || initial_size < fixed_len {
            return Err(ScmoError::InvalidArgument(format!(
                "chunk of {initial_size} bytes cannot hold a fixed part of {fixed_len} bytes"
            )));
        }
        let mut data = raw_alloc(initial_size)?;
        ChunkHeader::new(magic, initial_size as u64, fixed_len as u64).encode(&mut data);
        Ok(Self { data })
    }

    /// Rebuilds a chunk from its packed (in-use) bytes, reserving `headroom`
    /// free bytes for later in-place edits.
    ///
    /// The transient header fields are recomputed: the size fields of the
    /// incoming bytes are never trusted.
    pub fn from_packed(magic: u32, packed: &[u8], headroom: usize) -> Result<Self> {
        let header = ChunkHeader::decode(packed)
            .ok_or_else(|| ScmoError::malformed("chunk shorter than its header"))?;
        if header.magic != magic {
            return Err(ScmoError::malformed(format!(
                "chunk magic 0x{:08X} does not match expected 0x{magic:08X}",
                header.magic
            )));
        }
        if header.start_of_free != packed.len() as u64 {
            return Err(ScmoError::malformed(format!(
                "chunk claims {} used bytes but carries {}",
                header.start_of_free,
                packed.len()
            )));
        }
        let total = packed
            .len()
            .checked_add(headroom)
            .ok_or(ScmoError::OutOfMemory {
                requested: u64::MAX,
            })?;
        let mut data = raw_alloc(total)?;
        data[..packed.len()].copy_from_slice(packed);
        le::put_u64(&mut data, header::offsets::TOTAL_SIZE, total as u64);
        le::put_u64(&mut data, header::offsets::FREE_BYTES, headroom as u64);
        Ok(Self { data })
    }

    /// Copies the whole chunk, slack included.
    pub fn try_clone(&self) -> Result<Self> {
        let mut data = raw_alloc(self.data.len())?;
        data.copy_from_slice(&self.data);
        Ok(Self { data })
    }

    fn header_u32(&self, off: usize) -> u32 {
        le::get_u32(&self.data, off).unwrap_or_default()
    }

    fn header_u64(&self, off: usize) -> u64 {
        le::get_u64(&self.data, off).unwrap_or_default()
    }

    /// Decodes the management header.
    pub fn header(&self) -> ChunkHeader {
        ChunkHeader {
            magic: self.header_u32(header::offsets::MAGIC),
            total_size: self.total_size(),
            free_bytes: self.free_bytes(),
            start_of_free: self.used(),
            num_ext_ref: self.num_ext_refs(),
            ext_ref_capacity: self.header_u32(header::offsets::EXT_REF_CAPACITY),
            ext_ref_array: self.header_u64(header::offsets::EXT_REF_ARRAY),
        }
    }

    /// Allocated size of the chunk.
    pub fn total_size(&self) -> u64 {
        self.header_u64(header::offsets::TOTAL_SIZE)
    }

    /// Unused bytes at the end of the chunk.
    pub fn free_bytes(&self) -> u64 {
        self.header_u64(header::offsets::FREE_BYTES)
    }

    /// Bytes in use, which is also the offset of the first free byte.
    pub fn used(&self) -> u64 {
        self.header_u64(header::offsets::START_OF_FREE)
    }

    /// Size accounting snapshot.
    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            total_size: self.total_size(),
            free_bytes: self.free_bytes(),
            used_bytes: self.used(),
        }
    }

    /// The in-use bytes; this is exactly what goes on the wire.
    pub fn packed(&self) -> &[u8] {
        &self.data[..self.used() as usize]
    }

    /// Grows the chunk until at least `additional` bytes are free.
    ///
    /// The chunk doubles its size on each step. On growth the backing
    /// allocation may move, so borrowed slices must be re-acquired.
    pub fn ensure_capacity(&mut self, additional: u64) -> Result<()> {
        let mut total = self.total_size();
        let mut free = self.free_bytes();
        if free >= additional {
            return Ok(());
        }
        let old_total = total;
        while free < additional {
            let grown = total.checked_mul(2).ok_or(ScmoError::OutOfMemory {
                requested: u64::MAX,
            })?;
            free += grown - total;
            total = grown;
        }
        let new_len = usize::try_from(total).map_err(|_| ScmoError::OutOfMemory {
            requested: total,
        })?;
        self.data
            .try_reserve_exact(new_len - self.data.len())
            .map_err(|_| ScmoError::OutOfMemory { requested: total })?;
        self.data.resize(new_len, 0);
        le::put_u64(&mut self.data, header::offsets::TOTAL_SIZE, total);
        le::put_u64(&mut self.data, header::offsets::FREE_BYTES, free);
        trace!(old_total, new_total = total, "chunk.grow");
        Ok(())
    }

    /// Reserves `size` zeroed bytes at the next 8-byte boundary.
    pub fn alloc(&mut self, size: u64) -> Result<DataPtr> {
        if size == 0 {
            return Ok(DataPtr::NULL);
        }
        let start = self.used();
        let aligned = (start + CHUNK_ALIGN - 1) & !(CHUNK_ALIGN - 1);
        let required = size
            .checked_add(aligned - start)
            .ok_or_else(|| ScmoError::InvalidArgument(format!("allocation of {size} bytes")))?;
        self.ensure_capacity(required)?;
        let free = self.free_bytes() - required;
        le::put_u64(&mut self.data, header::offsets::FREE_BYTES, free);
        le::put_u64(&mut self.data, header::offsets::START_OF_FREE, aligned + size);
        self.data[start as usize..(start + required) as usize].fill(0);
        debug_assert_eq!(
            self.free_bytes() + self.used(),
            self.total_size(),
            "chunk size accounting"
        );
        Ok(DataPtr::new(aligned, size))
    }

    /// Allocates space for `bytes` and copies them in.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<DataPtr> {
        let ptr = self.alloc(bytes.len() as u64)?;
        if !ptr.is_empty() {
            let start = ptr.start as usize;
            self.data[start..start + bytes.len()].copy_from_slice(bytes);
        }
        Ok(ptr)
    }

    /// Allocates space for a UTF-8 string and copies it in.
    pub fn put_str(&mut self, s: &str) -> Result<DataPtr> {
        self.put_bytes(s.as_bytes())
    }

    /// Returns the bytes covered by `ptr`, which must lie in the in-use region.
    pub fn slice(&self, ptr: DataPtr) -> Result<&[u8]> {
        if ptr.is_empty() {
            return Ok(&[]);
        }
        match ptr.checked_end() {
            Some(end) if end <= self.used() => Ok(&self.data[ptr.start as usize..end as usize]),
            _ => Err(ScmoError::malformed(format!(
                "relative pointer {}+{} outside {} used bytes",
                ptr.start,
                ptr.size,
                self.used()
            ))),
        }
    }

    /// Returns the UTF-8 string covered by `ptr`.
    pub fn str_at(&self, ptr: DataPtr) -> Result<&str> {
        std::str::from_utf8(self.slice(ptr)?)
            .map_err(|_| ScmoError::malformed("string is not valid UTF-8"))
    }

    /// Reads a byte at `off` inside the in-use region.
    pub fn read_u8(&self, off: u64) -> Result<u8> {
        Ok(self.slice(DataPtr::new(off, 1))?[0])
    }

    /// Reads a u32 at `off` inside the in-use region.
    pub fn read_u32(&self, off: u64) -> Result<u32> {
        let field = self.slice(DataPtr::new(off, 4))?;
        le::get_u32(field, 0).ok_or_else(|| ScmoError::malformed("u32 field truncated"))
    }

    /// Reads a u64 at `off` inside the in-use region.
    pub fn read_u64(&self, off: u64) -> Result<u64> {
        let field = self.slice(DataPtr::new(off, 8))?;
        le::get_u64(field, 0).ok_or_else(|| ScmoError::malformed("u64 field truncated"))
    }

    /// Reads a relative pointer stored at `off`.
    pub fn read_data_ptr(&self, off: u64) -> Result<DataPtr> {
        Ok(DataPtr::new(self.read_u64(off)?, self.read_u64(off + 8)?))
    }

    /// Writes a byte at `off`.
    pub fn write_u8(&mut self, off: u64, v: u8) {
        self.data[off as usize] = v;
    }

    /// Writes a u32 at `off`.
    pub fn write_u32(&mut self, off: u64, v: u32) {
        le::put_u32(&mut self.data, off as usize, v);
    }

    /// Writes a u64 at `off`.
    pub fn write_u64(&mut self, off: u64, v: u64) {
        le::put_u64(&mut self.data, off as usize, v);
    }

    /// Writes a relative pointer at `off`.
    pub fn write_data_ptr(&mut self, off: u64, ptr: DataPtr) {
        ptr.encode(&mut self.data, off as usize);
    }

    /// Number of live external references recorded in the header.
    pub fn num_ext_refs(&self) -> u32 {
        self.header_u32(header::offsets::NUM_EXT_REF)
    }

    /// Offset of the slot that holds external reference `idx`.
    pub fn ext_ref_slot(&self, idx: u32) -> Result<u64> {
        let hdr = self.header();
        if idx >= hdr.num_ext_ref || hdr.num_ext_ref > hdr.ext_ref_capacity {
            return Err(ScmoError::InvalidArgument(format!(
                "external reference {idx} out of range ({} present)",
                hdr.num_ext_ref
            )));
        }
        self.read_u64(hdr.ext_ref_array + u64::from(idx) * 8)
    }

    /// Returns the index of the external reference stored at `slot`, if any.
    pub fn find_ext_ref(&self, slot: u64) -> Option<u32> {
        (0..self.num_ext_refs()).find(|&i| self.ext_ref_slot(i).ok() == Some(slot))
    }

    /// Records `slot` in the external-reference index array and returns its
    /// index. A slot that is already recorded keeps its index.
    pub fn push_ext_ref(&mut self, slot: u64) -> Result<u32> {
        if let Some(idx) = self.find_ext_ref(slot) {
            return Ok(idx);
        }
        let hdr = self.header();
        let mut array = hdr.ext_ref_array;
        if hdr.num_ext_ref == hdr.ext_ref_capacity {
            let capacity = hdr.ext_ref_capacity + EXT_REF_ARRAY_STEP;
            let grown = self.alloc(u64::from(capacity) * 8)?;
            for i in 0..u64::from(hdr.num_ext_ref) {
                let entry = self.read_u64(array + i * 8)?;
                self.write_u64(grown.start + i * 8, entry);
            }
            array = grown.start;
            self.write_u64(header::offsets::EXT_REF_ARRAY as u64, array);
            self.write_u32(header::offsets::EXT_REF_CAPACITY as u64, capacity);
        }
        self.write_u64(array + u64::from(hdr.num_ext_ref) * 8, slot);
        self.write_u32(header::offsets::NUM_EXT_REF as u64, hdr.num_ext_ref + 1);
        Ok(hdr.num_ext_ref)
    }

    /// Removes external reference `idx`, shifting later entries down.
    pub fn remove_ext_ref(&mut self, idx: u32) -> Result<()> {
        let hdr = self.header();
        if idx >= hdr.num_ext_ref {
            return Err(ScmoError::InvalidArgument(format!(
                "external reference {idx} out of range ({} present)",
                hdr.num_ext_ref
            )));
        }
        let base = hdr.ext_ref_array;
        for i in u64::from(idx) + 1..u64::from(hdr.num_ext_ref) {
            let entry = self.read_u64(base + i * 8)?;
            self.write_u64(base + (i - 1) * 8, entry);
        }
        self.write_u64(base + u64::from(hdr.num_ext_ref - 1) * 8, 0);
        self.write_u32(header::offsets::NUM_EXT_REF as u64, hdr.num_ext_ref - 1);
        Ok(())
    }
}

impl std::fmt::Debug for ChunkBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuf")
            .field("header", &self.header())
            .finish()
    }
}
