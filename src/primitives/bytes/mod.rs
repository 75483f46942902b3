#![forbid(unsafe_code)]
//! Fixed-width encoding and buffer utilities shared across the chunk and stream layers.

pub mod le {
    //! Little-endian field access at absolute offsets.
    //!
    //! Writers assume the caller computed the offset from its own layout and
    //! panic on overrun. Readers are used on untrusted bytes and return `None`.

    use core::convert::TryInto;

    const U32_LEN: usize = core::mem::size_of::<u32>();
    const U64_LEN: usize = core::mem::size_of::<u64>();

    /// Writes a u32 at `off`.
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + U32_LEN].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a u64 at `off`.
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + U64_LEN].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a u32 at `off`, or `None` when the slice is too short.
    pub fn get_u32(src: &[u8], off: usize) -> Option<u32> {
        let end = off.checked_add(U32_LEN)?;
        let bytes: [u8; U32_LEN] = src.get(off..end)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Reads a u64 at `off`, or `None` when the slice is too short.
    pub fn get_u64(src: &[u8], off: usize) -> Option<u64> {
        let end = off.checked_add(U64_LEN)?;
        let bytes: [u8; U64_LEN] = src.get(off..end)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }
}

pub mod sink {
    //! Output side of the stream format.

    use bytes::BufMut;

    /// Destination for serialized streams.
    ///
    /// Every [`BufMut`] (including `Vec<u8>` and `BytesMut`) is a sink.
    pub trait ByteSink {
        /// Appends a little-endian u32.
        fn write_u32(&mut self, v: u32);
        /// Appends a little-endian u64.
        fn write_u64(&mut self, v: u64);
        /// Appends raw bytes.
        fn write_bytes(&mut self, bytes: &[u8]);
    }

    impl<B: BufMut> ByteSink for B {
        fn write_u32(&mut self, v: u32) {
            self.put_u32_le(v);
        }

        fn write_u64(&mut self, v: u64) {
            self.put_u64_le(v);
        }

        fn write_bytes(&mut self, bytes: &[u8]) {
            self.put_slice(bytes);
        }
    }
}

pub mod buf {
    //! A slice-backed cursor for parsing untrusted streams.

    use core::fmt;

    use bytes::Buf;

    use crate::error::{Result, ScmoError};

    /// Reads fixed-width fields from a byte slice, failing instead of panicking
    /// when the slice runs out.
    pub struct WireReader<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> WireReader<'a> {
        /// Creates a new reader starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Returns the current read offset.
        pub fn position(&self) -> usize {
            self.off
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn read_bytes(&mut self, n: u64) -> Result<&'a [u8]> {
            let remaining = self.remaining();
            let n = usize::try_from(n)
                .ok()
                .filter(|n| *n <= remaining)
                .ok_or_else(|| {
                    ScmoError::malformed(format!(
                        "unexpected end of stream at offset {}: need {} bytes, {} remaining",
                        self.off, n, remaining
                    ))
                })?;
            let slice = &self.buf[self.off..self.off + n];
            self.off += n;
            Ok(slice)
        }

        /// Reads a little-endian u32.
        pub fn read_u32(&mut self) -> Result<u32> {
            let mut field = self.read_bytes(4)?;
            Ok(field.get_u32_le())
        }

        /// Reads a little-endian u64.
        pub fn read_u64(&mut self) -> Result<u64> {
            let mut field = self.read_bytes(8)?;
            Ok(field.get_u64_le())
        }

        /// Fails unless every byte has been consumed.
        pub fn ensure_consumed(&self) -> Result<()> {
            if self.remaining() != 0 {
                return Err(ScmoError::malformed(format!(
                    "{} trailing bytes after stream",
                    self.remaining()
                )));
            }
            Ok(())
        }
    }

    impl<'a> fmt::Debug for WireReader<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("WireReader")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
