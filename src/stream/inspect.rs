//! Structural walk over a stream that decodes headers and tables without
//! rebuilding the instance graph.

use serde::Serialize;

use crate::chunk::{ChunkHeader, INSTANCE_MAGIC};
use crate::error::{Result, ScmoError};
use crate::model::Class;
use crate::primitives::bytes::buf::WireReader;

use super::options::StreamerOptions;
use super::resolve::ResolutionEntry;

const PREVIEW_LEN: usize = 16;

/// Description of one class chunk in a stream.
#[derive(Clone, Debug, Serialize)]
pub struct ClassSummary {
    /// Class name.
    pub name: String,
    /// Number of declared properties.
    pub properties: usize,
    /// Packed length in bytes.
    pub packed_len: u64,
    /// Hex dump of the first bytes of the chunk.
    pub preview: String,
}

/// Description of one instance chunk in a stream.
#[derive(Clone, Debug, Serialize)]
pub struct InstanceSummary {
    /// Index into the class table.
    pub class_index: u64,
    /// Position in the original root list, if the instance was a root.
    pub root_ordinal: Option<u64>,
    /// Packed length in bytes.
    pub packed_len: u64,
    /// Number of external references recorded in the chunk header.
    pub external_references: u32,
}

/// Everything `summarize` learns about a stream.
#[derive(Clone, Debug, Serialize)]
pub struct StreamSummary {
    /// Stream length in bytes.
    pub total_bytes: u64,
    /// Class table.
    pub classes: Vec<ClassSummary>,
    /// Class resolution table.
    pub class_resolution: Vec<ResolutionEntry>,
    /// Instance reference table.
    pub instance_references: Vec<ResolutionEntry>,
    /// Instance chunks, in table order.
    pub instances: Vec<InstanceSummary>,
}

fn read_count(reader: &mut WireReader<'_>, options: &StreamerOptions) -> Result<u32> {
    let count = reader.read_u32()?;
    if count > options.max_object_count {
        return Err(ScmoError::malformed(format!("table of {count} entries")));
    }
    Ok(count)
}

fn read_chunk<'a>(reader: &mut WireReader<'a>, options: &StreamerOptions) -> Result<&'a [u8]> {
    let len = reader.read_u64()?;
    if len > options.max_chunk_len {
        return Err(ScmoError::malformed(format!("chunk of {len} bytes")));
    }
    reader.read_bytes(len)
}

fn read_table(reader: &mut WireReader<'_>, options: &StreamerOptions) -> Result<Vec<ResolutionEntry>> {
    let count = read_count(reader, options)?;
    (0..count).map(|_| ResolutionEntry::read(reader)).collect()
}

/// Walks a serialized stream and describes its tables and chunks.
pub fn summarize(bytes: &[u8], options: &StreamerOptions) -> Result<StreamSummary> {
    let mut reader = WireReader::new(bytes);

    let class_count = read_count(&mut reader, options)?;
    let mut classes = Vec::new();
    for _ in 0..class_count {
        let packed = read_chunk(&mut reader, options)?;
        let class = Class::from_packed(packed)?;
        classes.push(ClassSummary {
            name: class.name().to_owned(),
            properties: class.property_count(),
            packed_len: packed.len() as u64,
            preview: hex::encode(&packed[..packed.len().min(PREVIEW_LEN)]),
        });
    }

    let class_resolution = read_table(&mut reader, options)?;
    let instance_references = read_table(&mut reader, options)?;
    let mut instances = Vec::with_capacity(class_resolution.len());
    for entry in &class_resolution {
        let packed = read_chunk(&mut reader, options)?;
        let header = ChunkHeader::decode(packed)
            .filter(|h| h.magic == INSTANCE_MAGIC)
            .ok_or_else(|| ScmoError::malformed("instance chunk header"))?;
        instances.push(InstanceSummary {
            class_index: entry.index,
            root_ordinal: entry.source_slot.checked_sub(1),
            packed_len: packed.len() as u64,
            external_references: header.num_ext_ref,
        });
    }
    reader.ensure_consumed()?;

    Ok(StreamSummary {
        total_bytes: bytes.len() as u64,
        classes,
        class_resolution,
        instance_references,
        instances,
    })
}
