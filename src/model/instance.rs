//! Instance chunks and their external references.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use tracing::trace;

use crate::chunk::{
    ChunkBuf, ChunkStats, DataPtr, CHUNK_ALIGN, DEFAULT_CHUNK_SIZE, INSTANCE_MAGIC,
};
use crate::error::{Result, ScmoError};
use crate::primitives::bytes::sink::ByteSink;

use super::class::Class;
use super::types::{names_eq, CimType, Value};
use super::value::{self, flags, Slot, VALUE_SLOT_LEN};

/// Length of the header plus the instance main record.
pub const INSTANCE_FIXED_LEN: usize = 112;

mod layout {
    pub const CLASS_NAME: u64 = 48;
    pub const HOST_NAME: u64 = 64;
    pub const NAMESPACE: u64 = 80;
    pub const PROPERTY_COUNT: u64 = 96;
    pub const VALUE_ARRAY: u64 = 104;
}

/// Instance chunk, its class, and the handles behind its reference slots.
///
/// `ext_refs[i]` is the target of the slot recorded at position `i` of the
/// chunk's external-reference index array.
pub struct InstanceChunk {
    chunk: ChunkBuf,
    class: Class,
    ext_refs: Vec<Option<Instance>>,
}

impl InstanceChunk {
    fn slot_offset(&self, idx: usize) -> Result<u64> {
        if idx >= self.class.property_count() {
            return Err(ScmoError::NotFound(format!(
                "property #{idx} of {}",
                self.class.name()
            )));
        }
        Ok(self.chunk.read_u64(layout::VALUE_ARRAY)? + idx as u64 * VALUE_SLOT_LEN)
    }

    fn set_value(&mut self, idx: usize, value: Option<Value>) -> Result<()> {
        let meta = self
            .class
            .prop_meta(idx)
            .ok_or_else(|| ScmoError::NotFound(format!("property #{idx}")))?;
        if let Some(v) = &value {
            if !v.matches(meta.cim_type, meta.is_array) {
                return Err(ScmoError::TypeMismatch(format!(
                    "property {} is declared {}{}",
                    self.class.property_name(idx).unwrap_or_default(),
                    meta.cim_type,
                    if meta.is_array { "[]" } else { "" }
                )));
            }
        }
        let off = self.slot_offset(idx)?;
        if !meta.cim_type.is_reference_like() {
            return value::write_inline(
                &mut self.chunk,
                off,
                meta.cim_type,
                meta.is_array,
                value.as_ref(),
            );
        }

        let mut slot = Slot::null(meta.cim_type, false);
        slot.flags |= flags::SET;
        match value.as_ref().and_then(Value::as_instance) {
            Some(target) => {
                let pos = self.chunk.push_ext_ref(off)? as usize;
                if pos == self.ext_refs.len() {
                    self.ext_refs.push(Some(target.clone()));
                } else {
                    self.ext_refs[pos] = Some(target.clone());
                }
                slot.flags &= !flags::NULL;
            }
            None => {
                if let Some(pos) = self.chunk.find_ext_ref(off) {
                    self.chunk.remove_ext_ref(pos)?;
                    self.ext_refs.remove(pos as usize);
                }
            }
        }
        slot.write(&mut self.chunk, off);
        debug_assert_eq!(self.chunk.num_ext_refs() as usize, self.ext_refs.len());
        Ok(())
    }

    fn get_value(&self, idx: usize) -> Result<Option<Value>> {
        let meta = self
            .class
            .prop_meta(idx)
            .ok_or_else(|| ScmoError::NotFound(format!("property #{idx}")))?;
        let off = self.slot_offset(idx)?;
        if !meta.cim_type.is_reference_like() {
            return value::read_inline(&self.chunk, off, meta.cim_type, meta.is_array);
        }
        if Slot::read(&self.chunk, off)?.is_null() {
            return Ok(None);
        }
        let target = self
            .chunk
            .find_ext_ref(off)
            .and_then(|pos| self.ext_refs.get(pos as usize).cloned().flatten())
            .ok_or_else(|| ScmoError::malformed("unresolved external reference"))?;
        Ok(Some(match meta.cim_type {
            CimType::Reference => Value::Reference(target),
            CimType::Object => Value::Object(target),
            _ => Value::Instance(target),
        }))
    }

    fn text(&self, field: u64) -> Result<String> {
        Ok(self.chunk.str_at(self.chunk.read_data_ptr(field)?)?.to_owned())
    }
}

/// Shared handle to a mutable instance chunk. Equality is handle identity.
#[derive(Clone)]
pub struct Instance(Arc<RwLock<InstanceChunk>>);

impl Instance {
    /// Creates an instance of `class` with every property null and unset.
    pub fn new(class: &Class) -> Result<Self> {
        let mut chunk = ChunkBuf::allocate(INSTANCE_MAGIC, DEFAULT_CHUNK_SIZE, INSTANCE_FIXED_LEN)?;
        let class_name = chunk.put_str(class.name())?;
        chunk.write_data_ptr(layout::CLASS_NAME, class_name);
        let namespace = chunk.put_str(class.namespace().as_deref().unwrap_or(""))?;
        chunk.write_data_ptr(layout::NAMESPACE, namespace);

        let count = class.property_count();
        let values = chunk.alloc(VALUE_SLOT_LEN * count as u64)?;
        chunk.write_u32(layout::PROPERTY_COUNT, count as u32);
        chunk.write_u64(layout::VALUE_ARRAY, values.start);
        for idx in 0..count {
            if let Some(meta) = class.prop_meta(idx) {
                Slot::null(meta.cim_type, meta.is_array)
                    .write(&mut chunk, values.start + idx as u64 * VALUE_SLOT_LEN);
            }
        }
        Ok(Self::from_parts(chunk, class.clone(), Vec::new()))
    }

    fn from_parts(chunk: ChunkBuf, class: Class, ext_refs: Vec<Option<Instance>>) -> Self {
        Instance(Arc::new(RwLock::new(InstanceChunk {
            chunk,
            class,
            ext_refs,
        })))
    }

    /// Wraps a chunk accepted by [`validate_packed`]; every reference slot
    /// stays a placeholder until [`Instance::set_external_reference`] fills it.
    pub(crate) fn from_validated(chunk: ChunkBuf, class: Class) -> Self {
        let pending = chunk.num_ext_refs() as usize;
        Self::from_parts(chunk, class, vec![None; pending])
    }

    /// The class this instance was created from.
    pub fn class(&self) -> Class {
        self.0.read().class.clone()
    }

    /// Class name stored in the instance chunk.
    pub fn class_name(&self) -> Result<String> {
        self.0.read().text(layout::CLASS_NAME)
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        let guard = self.0.read();
        guard
            .class
            .property_index(name)
            .ok_or_else(|| ScmoError::NotFound(format!("property {name} of {}", guard.class.name())))
    }

    /// Assigns a property by name.
    pub fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let idx = self.index_of(name)?;
        self.set_property_at(idx, value)
    }

    /// Assigns a property by declaration index.
    pub fn set_property_at(&self, idx: usize, value: Value) -> Result<()> {
        self.0.write().set_value(idx, Some(value))
    }

    /// Sets a property to an explicit null.
    pub fn clear_property(&self, name: &str) -> Result<()> {
        let idx = self.index_of(name)?;
        self.0.write().set_value(idx, None)
    }

    /// Reads a property by name; `None` is null.
    pub fn property(&self, name: &str) -> Result<Option<Value>> {
        let idx = self.index_of(name)?;
        self.property_at(idx)
    }

    /// Reads a property by declaration index; `None` is null.
    pub fn property_at(&self, idx: usize) -> Result<Option<Value>> {
        self.0.read().get_value(idx)
    }

    /// Returns true once the property has been assigned, null included.
    pub fn is_property_set(&self, name: &str) -> Result<bool> {
        let idx = self.index_of(name)?;
        let guard = self.0.read();
        let off = guard.slot_offset(idx)?;
        Ok(Slot::read(&guard.chunk, off)?.is_set())
    }

    /// Host name the instance belongs to; empty when unset.
    pub fn host_name(&self) -> Result<String> {
        self.0.read().text(layout::HOST_NAME)
    }

    /// Namespace the instance belongs to; empty when unset.
    pub fn namespace(&self) -> Result<String> {
        self.0.read().text(layout::NAMESPACE)
    }

    /// Rewrites the host name in place.
    pub fn set_host_name(&self, host: &str) -> Result<()> {
        self.rewrite_text(layout::HOST_NAME, host)
    }

    /// Rewrites the namespace in place.
    pub fn set_namespace(&self, namespace: &str) -> Result<()> {
        self.rewrite_text(layout::NAMESPACE, namespace)
    }

    fn rewrite_text(&self, field: u64, text: &str) -> Result<()> {
        let mut guard = self.0.write();
        let ptr = guard.chunk.put_str(text)?;
        guard.chunk.write_data_ptr(field, ptr);
        Ok(())
    }

    /// Copies the instance chunk byte for byte. Referenced instances are
    /// shared, not copied.
    pub fn duplicate(&self) -> Result<Instance> {
        let guard = self.0.read();
        Ok(Self::from_parts(
            guard.chunk.try_clone()?,
            guard.class.clone(),
            guard.ext_refs.clone(),
        ))
    }

    /// Number of non-null reference-like slots.
    pub fn number_of_external_references(&self) -> usize {
        self.0.read().ext_refs.len()
    }

    /// Target of external reference `idx`.
    pub fn external_reference(&self, idx: usize) -> Result<Instance> {
        self.0
            .read()
            .ext_refs
            .get(idx)
            .cloned()
            .flatten()
            .ok_or_else(|| ScmoError::InvalidArgument(format!("no external reference {idx}")))
    }

    /// Snapshot of every external-reference target, in index order.
    pub(crate) fn external_references(&self) -> Vec<Option<Instance>> {
        self.0.read().ext_refs.clone()
    }

    /// Points external reference `idx` at `target`.
    pub fn set_external_reference(&self, idx: usize, target: Instance) -> Result<()> {
        let mut guard = self.0.write();
        let slot = guard
            .ext_refs
            .get_mut(idx)
            .ok_or_else(|| ScmoError::InvalidArgument(format!("no external reference {idx}")))?;
        *slot = Some(target);
        Ok(())
    }

    /// Size accounting of the chunk.
    pub fn chunk_stats(&self) -> ChunkStats {
        self.0.read().chunk.stats()
    }

    /// Returns true when both handles share one chunk.
    pub fn ptr_eq(a: &Instance, b: &Instance) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Chunk address, stable for the lifetime of the handle.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Writes the length-prefixed packed chunk to `sink`, placing `tags[i]` in
    /// the payload word of the slot behind external reference `i`. Returns the
    /// packed length.
    pub(crate) fn write_tagged<S: ByteSink>(&self, sink: &mut S, tags: &[u64]) -> Result<u64> {
        let guard = self.0.read();
        let chunk = &guard.chunk;
        if tags.len() != guard.ext_refs.len() {
            return Err(ScmoError::InvalidArgument(format!(
                "{} tags for {} external references",
                tags.len(),
                guard.ext_refs.len()
            )));
        }
        let mut patches = Vec::with_capacity(tags.len());
        for (i, tag) in tags.iter().enumerate() {
            patches.push((chunk.ext_ref_slot(i as u32)? + 8, *tag));
        }
        patches.sort_unstable_by_key(|(at, _)| *at);

        let packed = chunk.packed();
        sink.write_u64(packed.len() as u64);
        let mut from = 0usize;
        for (at, tag) in patches {
            let at = at as usize;
            sink.write_bytes(&packed[from..at]);
            sink.write_u64(tag);
            from = at + 8;
        }
        sink.write_bytes(&packed[from..]);
        Ok(packed.len() as u64)
    }
}

/// Checks an instance chunk received from a stream against its class and
/// returns the stream tag found in each external-reference slot, in index
/// order. Tags are cleared from the chunk so it matches the in-memory form.
pub(crate) fn validate_packed(chunk: &mut ChunkBuf, class: &Class) -> Result<Vec<u64>> {
    let class_name = chunk.str_at(chunk.read_data_ptr(layout::CLASS_NAME)?)?;
    if !names_eq(class_name, class.name()) {
        return Err(ScmoError::malformed(format!(
            "instance of {class_name} resolved to class {}",
            class.name()
        )));
    }
    chunk.str_at(chunk.read_data_ptr(layout::HOST_NAME)?)?;
    chunk.str_at(chunk.read_data_ptr(layout::NAMESPACE)?)?;

    let count = chunk.read_u32(layout::PROPERTY_COUNT)? as usize;
    if count != class.property_count() {
        return Err(ScmoError::malformed(format!(
            "instance carries {count} properties, class {} declares {}",
            class.name(),
            class.property_count()
        )));
    }
    let values = chunk.read_u64(layout::VALUE_ARRAY)?;
    let value_region = DataPtr::new(values, count as u64 * VALUE_SLOT_LEN);
    check_variable_region(chunk, value_region, "value array")?;

    let mut ref_slots = FxHashSet::default();
    for idx in 0..count {
        let Some(meta) = class.prop_meta(idx) else {
            break;
        };
        let off = values + idx as u64 * VALUE_SLOT_LEN;
        if meta.cim_type.is_reference_like() {
            let slot = Slot::read(chunk, off)?;
            value::check_header(&slot, meta.cim_type, false)?;
            if !slot.is_null() {
                ref_slots.insert(off);
            }
        } else {
            value::read_inline(chunk, off, meta.cim_type, meta.is_array)?;
        }
    }

    let header = chunk.header();
    if header.num_ext_ref > header.ext_ref_capacity {
        return Err(ScmoError::malformed("external reference count exceeds capacity"));
    }
    let ext_ref_region = header.ext_ref_region();
    check_variable_region(chunk, ext_ref_region, "external reference array")?;
    if overlaps(ext_ref_region, value_region) {
        return Err(ScmoError::malformed(
            "external reference array overlaps the value array",
        ));
    }
    if header.num_ext_ref as usize != ref_slots.len() {
        return Err(ScmoError::malformed(format!(
            "{} external references recorded for {} non-null reference slots",
            header.num_ext_ref,
            ref_slots.len()
        )));
    }
    let mut tags = Vec::with_capacity(ref_slots.len());
    for i in 0..header.num_ext_ref {
        let off = chunk.ext_ref_slot(i)?;
        if !ref_slots.remove(&off) {
            return Err(ScmoError::malformed(format!(
                "external reference {i} points at offset {off}, not a reference slot"
            )));
        }
        let tag = Slot::read(chunk, off)?.word0;
        if tag == 0 {
            return Err(ScmoError::malformed(format!(
                "external reference {i} carries no stream tag"
            )));
        }
        value::write_word0(chunk, off, 0);
        tags.push(tag);
    }
    trace!(class = class.name(), refs = tags.len(), "instance.validate");
    Ok(tags)
}

/// Writable regions must sit aligned behind the main record, inside the used
/// bytes. Empty regions are never written in place.
fn check_variable_region(chunk: &ChunkBuf, region: DataPtr, what: &str) -> Result<()> {
    if region.is_empty() {
        return Ok(());
    }
    if region.start < INSTANCE_FIXED_LEN as u64 || region.start % CHUNK_ALIGN != 0 {
        return Err(ScmoError::malformed(format!(
            "{what} at offset {} is misplaced",
            region.start
        )));
    }
    chunk.slice(region).map(|_| ())
}

fn overlaps(a: DataPtr, b: DataPtr) -> bool {
    match (a.checked_end(), b.checked_end()) {
        (Some(a_end), Some(b_end)) => {
            !a.is_empty() && !b.is_empty() && a.start < b_end && b.start < a_end
        }
        _ => true,
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Instance::ptr_eq(self, other)
    }
}

impl Eq for Instance {}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Some(guard) => f
                .debug_struct("Instance")
                .field("class", &guard.class.name())
                .field("external_refs", &guard.ext_refs.len())
                .field("used", &guard.chunk.used())
                .finish(),
            None => f.write_str("Instance { <locked> }"),
        }
    }
}
