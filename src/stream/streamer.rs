use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::chunk::{ChunkBuf, INSTANCE_MAGIC};
use crate::error::{Result, ScmoError};
use crate::model::instance::validate_packed;
use crate::model::{Class, Instance};
use crate::primitives::bytes::buf::WireReader;
use crate::primitives::bytes::sink::ByteSink;

use super::metrics::{default_metrics, StreamMetrics};
use super::options::StreamerOptions;
use super::resolve::{ResolutionEntry, ResolutionTables, RESOLUTION_ENTRY_LEN};

/// Serializes instance graphs into self-describing byte streams and rebuilds
/// them on the receiving side.
///
/// Stream layout, all integers little-endian:
///
/// ```text
/// u32 class count
///     { u64 length, packed class chunk } per class
/// u32 instance count
///     class resolution table, 16 bytes per instance
/// u32 reference count
///     instance reference table, 16 bytes per reference
/// { u64 length, packed instance chunk } per instance
/// ```
pub struct Streamer {
    options: StreamerOptions,
    metrics: Arc<dyn StreamMetrics>,
}

/// Instance chunks decoded and validated, not yet linked.
struct Decoded {
    classes: Vec<Class>,
    chunks: Vec<(ChunkBuf, Class)>,
    links: Vec<SmallVec<[usize; 4]>>,
    roots: Vec<usize>,
}

impl Streamer {
    /// Creates a streamer.
    pub fn new(options: StreamerOptions) -> Self {
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        Self { options, metrics }
    }

    /// Options in effect.
    pub fn options(&self) -> &StreamerOptions {
        &self.options
    }

    /// Writes `instances`, every instance they reach, and every class involved.
    /// Returns the number of bytes written.
    pub fn serialize<S: ByteSink>(&self, sink: &mut S, instances: &[Instance]) -> Result<u64> {
        let tables = ResolutionTables::build(instances)?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tables.dump();
        }

        let mut written = put_classes(sink, tables.classes())?;

        let class_resolution = tables.class_resolution();
        sink.write_u32(table_len(class_resolution.len(), "instance")?);
        for entry in class_resolution {
            entry.write(sink);
        }
        let references = tables.instance_references();
        sink.write_u32(table_len(references.len(), "reference")?);
        for entry in references {
            entry.write(sink);
        }
        written += 8 + (class_resolution.len() + references.len()) as u64 * RESOLUTION_ENTRY_LEN;

        for (i, inst) in tables.instances().iter().enumerate() {
            written += 8 + inst.write_tagged(sink, tables.slot_tags(i))?;
        }

        debug!(
            roots = instances.len(),
            classes = tables.classes().len(),
            instances = tables.instances().len(),
            references = references.len(),
            bytes = written,
            "streamer.serialize"
        );
        self.metrics.stream_written(
            tables.classes().len() as u64,
            tables.instances().len() as u64,
            written,
        );
        Ok(written)
    }

    /// Serializes into a fresh buffer.
    pub fn serialize_to_vec(&self, instances: &[Instance]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.serialize(&mut out, instances)?;
        Ok(out)
    }

    /// Writes a stream holding exactly one class and no instances.
    pub fn serialize_class<S: ByteSink>(&self, sink: &mut S, class: &Class) -> Result<u64> {
        let written = put_classes(sink, std::slice::from_ref(class))?;
        debug!(class = class.name(), bytes = written, "streamer.serialize_class");
        self.metrics.stream_written(1, 0, written);
        Ok(written)
    }

    /// Rebuilds the instances of a stream that spans all of `bytes`.
    ///
    /// The result holds the instances passed to `serialize`, in their original
    /// order, followed by any instance no other instance refers to.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Vec<Instance>> {
        let mut reader = WireReader::new(bytes);
        self.read_instances(&mut reader, true)
    }

    /// Rebuilds the instances of a stream that starts at the reader position,
    /// leaving any bytes after the stream unread.
    pub fn deserialize_from(&self, reader: &mut WireReader<'_>) -> Result<Vec<Instance>> {
        self.read_instances(reader, false)
    }

    /// Reads a stream written by [`Streamer::serialize_class`].
    pub fn deserialize_class(&self, bytes: &[u8]) -> Result<Class> {
        let mut reader = WireReader::new(bytes);
        let result = self.read_single_class(&mut reader);
        self.finish(result, bytes.len() as u64, |_| (1, 0))
    }

    fn read_single_class(&self, reader: &mut WireReader<'_>) -> Result<Class> {
        let count = reader.read_u32()?;
        if count != 1 {
            return Err(ScmoError::malformed(format!(
                "single-class stream holds {count} classes"
            )));
        }
        let class = self.read_class(reader)?;
        reader.ensure_consumed()?;
        Ok(class)
    }

    fn read_instances(&self, reader: &mut WireReader<'_>, to_end: bool) -> Result<Vec<Instance>> {
        let start = reader.position();
        let decoded = self.decode(reader, to_end);
        let consumed = (reader.position() - start) as u64;
        let linked = decoded.and_then(link);
        self.finish(linked, consumed, |(classes, out)| (*classes as u64, out.len() as u64))
            .map(|(_, out)| out)
    }

    fn finish<T>(&self, result: Result<T>, bytes: u64, counts: impl Fn(&T) -> (u64, u64)) -> Result<T> {
        match &result {
            Ok(value) => {
                let (classes, instances) = counts(value);
                self.metrics.stream_read(classes, instances, bytes);
            }
            Err(err) => {
                warn!(error = %err, "streamer.deserialize.rejected");
                self.metrics.stream_rejected();
            }
        }
        result
    }

    fn read_count(&self, reader: &mut WireReader<'_>, what: &str) -> Result<usize> {
        let count = reader.read_u32()?;
        if count > self.options.max_object_count {
            return Err(ScmoError::malformed(format!(
                "{count} {what} entries exceed the limit of {}",
                self.options.max_object_count
            )));
        }
        Ok(count as usize)
    }

    fn read_chunk<'a>(&self, reader: &mut WireReader<'a>) -> Result<&'a [u8]> {
        let len = reader.read_u64()?;
        if len > self.options.max_chunk_len {
            return Err(ScmoError::malformed(format!(
                "chunk length {len} exceeds the limit of {}",
                self.options.max_chunk_len
            )));
        }
        reader.read_bytes(len)
    }

    fn read_class(&self, reader: &mut WireReader<'_>) -> Result<Class> {
        Class::from_packed(self.read_chunk(reader)?)
    }

    fn read_table(&self, reader: &mut WireReader<'_>, what: &str) -> Result<Vec<ResolutionEntry>> {
        let count = self.read_count(reader, what)?;
        if count as u64 * RESOLUTION_ENTRY_LEN > reader.remaining() as u64 {
            return Err(ScmoError::malformed(format!(
                "{what} table of {count} entries is longer than the remaining {} bytes",
                reader.remaining()
            )));
        }
        (0..count).map(|_| ResolutionEntry::read(reader)).collect()
    }

    /// Reads and validates the whole stream. Nothing is linked here, so a
    /// failure leaves no reference cycles behind.
    fn decode(&self, reader: &mut WireReader<'_>, to_end: bool) -> Result<Decoded> {
        let class_count = self.read_count(reader, "class")?;
        let mut classes = Vec::with_capacity(class_count.min(reader.remaining() / 8));
        for _ in 0..class_count {
            classes.push(self.read_class(reader)?);
        }

        let class_resolution = self.read_table(reader, "instance")?;
        let references = self.read_table(reader, "reference")?;
        let count = class_resolution.len();

        let mut chunks = Vec::with_capacity(count.min(reader.remaining() / 8));
        let mut slot_tags = Vec::with_capacity(chunks.capacity());
        for (i, entry) in class_resolution.iter().enumerate() {
            let class = usize::try_from(entry.index)
                .ok()
                .and_then(|idx| classes.get(idx))
                .ok_or_else(|| {
                    ScmoError::malformed(format!(
                        "instance {i} refers to class {} of {}",
                        entry.index,
                        classes.len()
                    ))
                })?
                .clone();
            let bytes = self.read_chunk(reader)?;
            let mut chunk = ChunkBuf::from_packed(INSTANCE_MAGIC, bytes, self.options.instance_headroom)?;
            slot_tags.push(validate_packed(&mut chunk, &class)?);
            chunks.push((chunk, class));
        }
        if to_end {
            reader.ensure_consumed()?;
        }

        let mut by_tag = FxHashMap::with_capacity_and_hasher(references.len(), Default::default());
        for entry in &references {
            if entry.index >= count as u64 {
                return Err(ScmoError::malformed(format!(
                    "reference {} targets instance {} of {count}",
                    entry.source_slot, entry.index
                )));
            }
            if entry.source_slot == 0 || by_tag.insert(entry.source_slot, entry.index as usize).is_some() {
                return Err(ScmoError::malformed(format!(
                    "reference tag {} is zero or repeated",
                    entry.source_slot
                )));
            }
        }
        let mut claimed = FxHashSet::with_capacity_and_hasher(references.len(), Default::default());
        let links = slot_tags
            .iter()
            .map(|tags| {
                tags.iter()
                    .map(|tag| {
                        let target = by_tag.get(tag).copied().ok_or_else(|| {
                            ScmoError::malformed(format!("reference slot carries unknown tag {tag}"))
                        })?;
                        if !claimed.insert(*tag) {
                            return Err(ScmoError::malformed(format!(
                                "reference tag {tag} is carried by two slots"
                            )));
                        }
                        Ok(target)
                    })
                    .collect::<Result<SmallVec<[usize; 4]>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        if claimed.len() != references.len() {
            return Err(ScmoError::malformed(format!(
                "{} references recorded, {} carried by reference slots",
                references.len(),
                claimed.len()
            )));
        }

        let mut ordered: Vec<(u64, usize)> = class_resolution
            .iter()
            .enumerate()
            .filter(|(_, e)| e.source_slot != 0)
            .map(|(i, e)| (e.source_slot, i))
            .collect();
        ordered.sort_unstable();
        if ordered.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(ScmoError::malformed("two instances claim the same root ordinal"));
        }

        Ok(Decoded {
            classes,
            chunks,
            links,
            roots: ordered.into_iter().map(|(_, i)| i).collect(),
        })
    }
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new(StreamerOptions::default())
    }
}

/// Creates the handles and points every reference slot at its target.
/// Returns the class count and the top-level instances.
fn link(decoded: Decoded) -> Result<(usize, Vec<Instance>)> {
    let Decoded {
        classes,
        chunks,
        links,
        roots,
    } = decoded;
    let handles: Vec<Instance> = chunks
        .into_iter()
        .map(|(chunk, class)| Instance::from_validated(chunk, class))
        .collect();

    let mut consumed = vec![false; handles.len()];
    for (inst, targets) in handles.iter().zip(&links) {
        for (slot, &target) in targets.iter().enumerate() {
            inst.set_external_reference(slot, handles[target].clone())?;
            consumed[target] = true;
        }
    }

    let mut returned = vec![false; handles.len()];
    let mut out = Vec::with_capacity(roots.len());
    for idx in roots {
        returned[idx] = true;
        out.push(handles[idx].clone());
    }
    for (idx, inst) in handles.iter().enumerate() {
        if !consumed[idx] && !returned[idx] {
            out.push(inst.clone());
        }
    }
    debug!(
        classes = classes.len(),
        instances = handles.len(),
        returned = out.len(),
        "streamer.deserialize"
    );
    Ok((classes.len(), out))
}

fn table_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| ScmoError::InvalidArgument(format!("{len} {what} entries do not fit a stream")))
}

fn put_classes<S: ByteSink>(sink: &mut S, classes: &[Class]) -> Result<u64> {
    sink.write_u32(table_len(classes.len(), "class")?);
    let mut written = 4;
    for class in classes {
        let packed = class.packed_extent();
        sink.write_u64(packed.len() as u64);
        sink.write_bytes(packed);
        written += 8 + packed.len() as u64;
    }
    Ok(written)
}
