//! Resolution tables: the position-independent form of an instance graph.
//!
//! Building the tables linearizes every instance reachable from the roots in
//! depth-first post-order (references before the instance that holds them),
//! deduplicates classes by chunk identity, and replaces every reference slot
//! with a small integer tag that names an entry of the reference table.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::debug;

use crate::error::{Result, ScmoError};
use crate::model::{Class, Instance};
use crate::primitives::bytes::buf::WireReader;
use crate::primitives::bytes::sink::ByteSink;

/// Encoded length of a [`ResolutionEntry`].
pub const RESOLUTION_ENTRY_LEN: u64 = 16;

/// One `(source slot, index)` pair of a resolution table.
///
/// In the class resolution table `source_slot` is the root ordinal plus one
/// (zero for instances reached only through references) and `index` points
/// into the class table. In the instance reference table `source_slot` is the
/// tag carried by the referencing slot and `index` points into the instance
/// table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize)]
pub struct ResolutionEntry {
    /// Root ordinal plus one, or the slot tag.
    pub source_slot: u64,
    /// Target table index.
    pub index: u64,
}

impl ResolutionEntry {
    /// Appends the entry to `sink`.
    pub fn write<S: ByteSink>(&self, sink: &mut S) {
        sink.write_u64(self.source_slot);
        sink.write_u64(self.index);
    }

    /// Reads one entry.
    pub fn read(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            source_slot: reader.read_u64()?,
            index: reader.read_u64()?,
        })
    }
}

type SlotTags = SmallVec<[u64; 4]>;

struct Frame {
    inst: Instance,
    refs: Vec<Option<Instance>>,
    next: usize,
    tags: SlotTags,
    root: Option<u64>,
}

impl Frame {
    fn new(inst: Instance, root: Option<u64>) -> Self {
        // Snapshot the targets so no lock is held while descending.
        let refs = inst.external_references();
        Self {
            inst,
            refs,
            next: 0,
            tags: SlotTags::new(),
            root,
        }
    }
}

/// Tables built for one serialization pass.
#[derive(Default)]
pub struct ResolutionTables {
    classes: Vec<Class>,
    class_index: FxHashMap<usize, usize>,
    instances: Vec<Instance>,
    placed: FxHashMap<usize, usize>,
    in_progress: FxHashSet<usize>,
    pending: Vec<(usize, usize)>,
    class_resolution: Vec<ResolutionEntry>,
    instance_references: Vec<ResolutionEntry>,
    slot_tags: Vec<SlotTags>,
}

impl ResolutionTables {
    /// Builds the tables for `roots`, in root order.
    pub fn build(roots: &[Instance]) -> Result<Self> {
        let mut tables = Self::default();
        for (ordinal, root) in roots.iter().enumerate() {
            tables.visit(root, ordinal as u64)?;
        }
        tables.resolve_pending()?;
        Ok(tables)
    }

    fn visit(&mut self, root: &Instance, ordinal: u64) -> Result<()> {
        if let Some(&idx) = self.placed.get(&root.addr()) {
            let entry = &mut self.class_resolution[idx];
            if entry.source_slot == 0 {
                entry.source_slot = ordinal + 1;
            }
            return Ok(());
        }

        self.in_progress.insert(root.addr());
        let mut stack = vec![Frame::new(root.clone(), Some(ordinal))];
        while let Some(frame) = stack.last_mut() {
            if let Some(next) = frame.refs.get(frame.next) {
                let target = next.clone().ok_or_else(|| {
                    ScmoError::InvalidArgument("instance has an unresolved external reference".into())
                })?;
                let addr = target.addr();
                let placed = self.placed.get(&addr).copied();
                if placed.is_some() || self.in_progress.contains(&addr) {
                    let tag = self.push_reference(placed, addr);
                    frame.tags.push(tag);
                    frame.next += 1;
                } else {
                    // Revisited once the target is placed, which records the
                    // reference entry after the target's own entries.
                    self.in_progress.insert(addr);
                    stack.push(Frame::new(target, None));
                }
            } else if let Some(done) = stack.pop() {
                self.place(done);
            }
        }
        Ok(())
    }

    fn push_reference(&mut self, placed: Option<usize>, addr: usize) -> u64 {
        let entry = self.instance_references.len();
        let tag = entry as u64 + 1;
        self.instance_references.push(ResolutionEntry {
            source_slot: tag,
            index: placed.unwrap_or_default() as u64,
        });
        if placed.is_none() {
            self.pending.push((entry, addr));
        }
        tag
    }

    fn place(&mut self, frame: Frame) {
        let addr = frame.inst.addr();
        self.in_progress.remove(&addr);
        let class_idx = self.class_slot(frame.inst.class());
        let idx = self.instances.len();
        self.class_resolution.push(ResolutionEntry {
            source_slot: frame.root.map_or(0, |ordinal| ordinal + 1),
            index: class_idx as u64,
        });
        self.instances.push(frame.inst);
        self.slot_tags.push(frame.tags);
        self.placed.insert(addr, idx);
    }

    fn class_slot(&mut self, class: Class) -> usize {
        let next = self.classes.len();
        let idx = *self.class_index.entry(class.addr()).or_insert(next);
        if idx == next {
            self.classes.push(class);
        }
        idx
    }

    fn resolve_pending(&mut self) -> Result<()> {
        for (entry, addr) in self.pending.drain(..) {
            let idx = self.placed.get(&addr).copied().ok_or_else(|| {
                ScmoError::InvalidArgument("reference target was never placed".into())
            })?;
            self.instance_references[entry].index = idx as u64;
        }
        Ok(())
    }

    /// Deduplicated classes, in first-seen order.
    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    /// Every reachable instance, each exactly once.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// One entry per instance, giving its class index.
    pub fn class_resolution(&self) -> &[ResolutionEntry] {
        &self.class_resolution
    }

    /// One entry per non-null reference slot, giving its target index.
    pub fn instance_references(&self) -> &[ResolutionEntry] {
        &self.instance_references
    }

    /// Tags assigned to the external references of instance `idx`.
    pub fn slot_tags(&self, idx: usize) -> &[u64] {
        self.slot_tags.get(idx).map(|t| t.as_slice()).unwrap_or_default()
    }

    /// Logs every table at debug level.
    pub fn dump(&self) {
        for (i, class) in self.classes.iter().enumerate() {
            debug!(index = i, class = class.name(), "resolve.dump.class");
        }
        for (i, entry) in self.class_resolution.iter().enumerate() {
            debug!(
                instance = i,
                root_slot = entry.source_slot,
                class_index = entry.index,
                tags = ?self.slot_tags(i),
                "resolve.dump.instance"
            );
        }
        for entry in &self.instance_references {
            debug!(
                tag = entry.source_slot,
                target = entry.index,
                "resolve.dump.reference"
            );
        }
    }
}
