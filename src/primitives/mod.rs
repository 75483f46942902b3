//! Low-level primitives shared by the chunk and streaming layers.

/// Byte-level utilities and encoding/decoding.
///
/// Fixed-width field access, the output sink trait, and the fallible input cursor.
pub mod bytes;
