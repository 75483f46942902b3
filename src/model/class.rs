//! Immutable, shareable class chunks.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::chunk::{ChunkBuf, ChunkStats, DataPtr, CLASS_MAGIC, DEFAULT_CHUNK_SIZE};
use crate::error::{Result, ScmoError};

use super::types::{CimType, PropertyDecl, Qualifier, Value};
use super::value::{self, Slot};

/// Length of the header plus the class main record.
pub const CLASS_FIXED_LEN: usize = 120;

mod layout {
    pub const NAME: u64 = 48;
    pub const SUPER_CLASS: u64 = 64;
    pub const NAMESPACE: u64 = 80;
    pub const PROPERTY_COUNT: u64 = 96;
    pub const QUALIFIER_COUNT: u64 = 100;
    pub const PROPERTY_ARRAY: u64 = 104;
    pub const QUALIFIER_ARRAY: u64 = 112;

    pub mod property {
        pub const NAME: u64 = 0;
        pub const TYPE: u64 = 16;
        pub const FLAGS: u64 = 17;
        pub const QUALIFIER_COUNT: u64 = 20;
        pub const REFERENCE_CLASS: u64 = 24;
        pub const QUALIFIER_ARRAY: u64 = 40;
        pub const ORIGIN_CLASS: u64 = 48;
        pub const LEN: u64 = 64;

        pub const FLAG_ARRAY: u8 = 0x01;
        pub const FLAG_KEY: u8 = 0x02;
        pub const FLAG_PROPAGATED: u8 = 0x04;
    }

    pub mod qualifier {
        pub const NAME: u64 = 0;
        pub const FLAVOR: u64 = 16;
        pub const PROPAGATED: u64 = 20;
        pub const VALUE: u64 = 24;
        pub const LEN: u64 = 48;
    }
}

/// Builder for [`Class`].
#[derive(Clone, Debug, Default)]
pub struct ClassBuilder {
    name: String,
    super_class: Option<String>,
    namespace: Option<String>,
    qualifiers: Vec<Qualifier>,
    properties: Vec<PropertyDecl>,
}

impl ClassBuilder {
    /// Starts a class definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the super class name.
    pub fn super_class(mut self, name: impl Into<String>) -> Self {
        self.super_class = Some(name.into());
        self
    }

    /// Sets the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Adds a class qualifier.
    pub fn qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifiers.push(qualifier);
        self
    }

    /// Adds a property declaration.
    pub fn property(mut self, decl: PropertyDecl) -> Self {
        self.properties.push(decl);
        self
    }

    /// Validates the definition and packs it into a new class chunk.
    pub fn build(self) -> Result<Class> {
        self.validate()?;
        let mut chunk = ChunkBuf::allocate(CLASS_MAGIC, DEFAULT_CHUNK_SIZE, CLASS_FIXED_LEN)?;

        let name = chunk.put_str(&self.name)?;
        chunk.write_data_ptr(layout::NAME, name);
        let super_class = chunk.put_str(self.super_class.as_deref().unwrap_or(""))?;
        chunk.write_data_ptr(layout::SUPER_CLASS, super_class);
        let namespace = chunk.put_str(self.namespace.as_deref().unwrap_or(""))?;
        chunk.write_data_ptr(layout::NAMESPACE, namespace);

        let qualifiers = write_qualifiers(&mut chunk, &self.qualifiers)?;
        chunk.write_u32(layout::QUALIFIER_COUNT, self.qualifiers.len() as u32);
        chunk.write_u64(layout::QUALIFIER_ARRAY, qualifiers);

        let records = chunk.alloc(layout::property::LEN * self.properties.len() as u64)?;
        chunk.write_u32(layout::PROPERTY_COUNT, self.properties.len() as u32);
        chunk.write_u64(layout::PROPERTY_ARRAY, records.start);
        for (i, decl) in self.properties.iter().enumerate() {
            let rec = records.start + i as u64 * layout::property::LEN;
            write_property(&mut chunk, rec, decl)?;
        }

        let class = ClassChunk::index(chunk)?;
        debug!(
            class = %self.name,
            properties = self.properties.len(),
            used = class.chunk.used(),
            "class.build"
        );
        Ok(Class(Arc::new(class)))
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ScmoError::structural("class name is empty"));
        }
        validate_qualifiers(&self.qualifiers, &self.name)?;
        let mut seen = FxHashSet::default();
        for decl in &self.properties {
            if decl.name.is_empty() {
                return Err(ScmoError::structural(format!(
                    "class {} has a property with an empty name",
                    self.name
                )));
            }
            if !seen.insert(decl.name.to_ascii_lowercase()) {
                return Err(ScmoError::structural(format!(
                    "duplicate property {} in class {}",
                    decl.name, self.name
                )));
            }
            if decl.is_array && decl.cim_type.is_reference_like() {
                return Err(ScmoError::structural(format!(
                    "property {} cannot be an array of {}",
                    decl.name, decl.cim_type
                )));
            }
            if decl.reference_class.is_some() && decl.cim_type != CimType::Reference {
                return Err(ScmoError::structural(format!(
                    "property {} of type {} cannot name a reference class",
                    decl.name, decl.cim_type
                )));
            }
            validate_qualifiers(&decl.qualifiers, &decl.name)?;
        }
        Ok(())
    }
}

fn validate_qualifiers(qualifiers: &[Qualifier], owner: &str) -> Result<()> {
    let mut seen = FxHashSet::default();
    for q in qualifiers {
        if q.name.is_empty() {
            return Err(ScmoError::structural(format!(
                "{owner} has a qualifier with an empty name"
            )));
        }
        if !seen.insert(q.name.to_ascii_lowercase()) {
            return Err(ScmoError::structural(format!(
                "duplicate qualifier {} on {owner}",
                q.name
            )));
        }
        qualifier_type(&q.value).map_err(|_| {
            ScmoError::structural(format!("qualifier {} on {owner} has an invalid value", q.name))
        })?;
    }
    Ok(())
}

fn qualifier_type(value: &Value) -> Result<(CimType, bool)> {
    let (cim_type, is_array) = match value {
        Value::Array(items) => {
            let ty = items
                .first()
                .and_then(Value::scalar_type)
                .unwrap_or(CimType::String);
            (ty, true)
        }
        other => (other.scalar_type().unwrap_or(CimType::Reference), false),
    };
    if cim_type.is_reference_like() || !value.matches(cim_type, is_array) {
        return Err(ScmoError::structural("qualifier value must be scalar"));
    }
    Ok((cim_type, is_array))
}

fn write_qualifiers(chunk: &mut ChunkBuf, qualifiers: &[Qualifier]) -> Result<u64> {
    let region = chunk.alloc(layout::qualifier::LEN * qualifiers.len() as u64)?;
    for (i, q) in qualifiers.iter().enumerate() {
        let rec = region.start + i as u64 * layout::qualifier::LEN;
        let name = chunk.put_str(&q.name)?;
        chunk.write_data_ptr(rec + layout::qualifier::NAME, name);
        chunk.write_u32(rec + layout::qualifier::FLAVOR, q.flavor);
        chunk.write_u32(rec + layout::qualifier::PROPAGATED, u32::from(q.propagated));
        let (ty, is_array) = qualifier_type(&q.value)?;
        value::write_inline(chunk, rec + layout::qualifier::VALUE, ty, is_array, Some(&q.value))?;
    }
    Ok(region.start)
}

fn read_qualifiers(chunk: &ChunkBuf, start: u64, count: u32) -> Result<Vec<Qualifier>> {
    chunk.slice(DataPtr::new(start, u64::from(count) * layout::qualifier::LEN))?;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..u64::from(count) {
        let rec = start + i * layout::qualifier::LEN;
        let name = chunk.str_at(chunk.read_data_ptr(rec + layout::qualifier::NAME)?)?;
        let slot = Slot::read(chunk, rec + layout::qualifier::VALUE)?;
        let ty = CimType::from_tag(slot.cim_type)
            .ok_or_else(|| ScmoError::malformed(format!("unknown type tag {}", slot.cim_type)))?;
        let value = value::read_inline(chunk, rec + layout::qualifier::VALUE, ty, slot.is_array())?
            .ok_or_else(|| ScmoError::malformed(format!("qualifier {name} is null")))?;
        out.push(Qualifier {
            name: name.to_owned(),
            value,
            flavor: chunk.read_u32(rec + layout::qualifier::FLAVOR)?,
            propagated: chunk.read_u32(rec + layout::qualifier::PROPAGATED)? != 0,
        });
    }
    Ok(out)
}

fn write_property(chunk: &mut ChunkBuf, rec: u64, decl: &PropertyDecl) -> Result<()> {
    let name = chunk.put_str(&decl.name)?;
    chunk.write_data_ptr(rec + layout::property::NAME, name);
    chunk.write_u8(rec + layout::property::TYPE, decl.cim_type.tag());
    let mut flags = 0;
    if decl.is_array {
        flags |= layout::property::FLAG_ARRAY;
    }
    if decl.is_key {
        flags |= layout::property::FLAG_KEY;
    }
    if decl.propagated {
        flags |= layout::property::FLAG_PROPAGATED;
    }
    chunk.write_u8(rec + layout::property::FLAGS, flags);
    let reference_class = chunk.put_str(decl.reference_class.as_deref().unwrap_or(""))?;
    chunk.write_data_ptr(rec + layout::property::REFERENCE_CLASS, reference_class);
    let origin_class = chunk.put_str(decl.origin_class.as_deref().unwrap_or(""))?;
    chunk.write_data_ptr(rec + layout::property::ORIGIN_CLASS, origin_class);
    let qualifiers = write_qualifiers(chunk, &decl.qualifiers)?;
    chunk.write_u32(rec + layout::property::QUALIFIER_COUNT, decl.qualifiers.len() as u32);
    chunk.write_u64(rec + layout::property::QUALIFIER_ARRAY, qualifiers);
    Ok(())
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PropMeta {
    pub cim_type: CimType,
    pub is_array: bool,
    record: u64,
    name: DataPtr,
}

/// Class chunk plus lookup structures derived from it.
pub struct ClassChunk {
    chunk: ChunkBuf,
    name: DataPtr,
    props: Vec<PropMeta>,
    by_name: FxHashMap<String, usize>,
}

impl ClassChunk {
    /// Walks and validates a packed class chunk, deriving its property index.
    fn index(chunk: ChunkBuf) -> Result<Self> {
        let name = chunk.read_data_ptr(layout::NAME)?;
        let class_name = chunk.str_at(name)?;
        if class_name.is_empty() {
            return Err(ScmoError::malformed("class chunk without a name"));
        }
        chunk.str_at(chunk.read_data_ptr(layout::SUPER_CLASS)?)?;
        chunk.str_at(chunk.read_data_ptr(layout::NAMESPACE)?)?;
        read_qualifiers(
            &chunk,
            chunk.read_u64(layout::QUALIFIER_ARRAY)?,
            chunk.read_u32(layout::QUALIFIER_COUNT)?,
        )?;

        let count = chunk.read_u32(layout::PROPERTY_COUNT)?;
        let array = chunk.read_u64(layout::PROPERTY_ARRAY)?;
        chunk.slice(DataPtr::new(array, u64::from(count) * layout::property::LEN))?;
        let mut props = Vec::with_capacity(count as usize);
        let mut by_name = FxHashMap::default();
        for i in 0..count as usize {
            let record = array + i as u64 * layout::property::LEN;
            let name_ptr = chunk.read_data_ptr(record + layout::property::NAME)?;
            let prop_name = chunk.str_at(name_ptr)?;
            let tag = chunk.read_u8(record + layout::property::TYPE)?;
            let cim_type = CimType::from_tag(tag)
                .ok_or_else(|| ScmoError::malformed(format!("unknown type tag {tag}")))?;
            let flags = chunk.read_u8(record + layout::property::FLAGS)?;
            let is_array = flags & layout::property::FLAG_ARRAY != 0;
            if prop_name.is_empty() || (is_array && cim_type.is_reference_like()) {
                return Err(ScmoError::malformed(format!(
                    "invalid property record {i} in class {class_name}"
                )));
            }
            chunk.str_at(chunk.read_data_ptr(record + layout::property::REFERENCE_CLASS)?)?;
            chunk.str_at(chunk.read_data_ptr(record + layout::property::ORIGIN_CLASS)?)?;
            read_qualifiers(
                &chunk,
                chunk.read_u64(record + layout::property::QUALIFIER_ARRAY)?,
                chunk.read_u32(record + layout::property::QUALIFIER_COUNT)?,
            )?;
            if by_name.insert(prop_name.to_ascii_lowercase(), i).is_some() {
                return Err(ScmoError::malformed(format!(
                    "duplicate property {prop_name} in class {class_name}"
                )));
            }
            props.push(PropMeta {
                cim_type,
                is_array,
                record,
                name: name_ptr,
            });
        }
        Ok(Self {
            chunk,
            name,
            props,
            by_name,
        })
    }

    fn text(&self, ptr: DataPtr) -> &str {
        // Every string pointer was checked by `index`.
        self.chunk.str_at(ptr).unwrap_or_default()
    }

    fn text_at(&self, off: u64) -> Option<String> {
        let ptr = self.chunk.read_data_ptr(off).ok()?;
        non_empty(self.text(ptr))
    }
}

/// Shared handle to an immutable class chunk.
#[derive(Clone)]
pub struct Class(Arc<ClassChunk>);

impl Class {
    /// Rebuilds a class from packed bytes received over the wire.
    pub fn from_packed(bytes: &[u8]) -> Result<Self> {
        let chunk = ChunkBuf::from_packed(CLASS_MAGIC, bytes, 0)?;
        Ok(Class(Arc::new(ClassChunk::index(chunk)?)))
    }

    /// Class name.
    pub fn name(&self) -> &str {
        self.0.text(self.0.name)
    }

    /// Super class name, if any.
    pub fn super_class(&self) -> Option<String> {
        self.0.text_at(layout::SUPER_CLASS)
    }

    /// Namespace the class was defined in, if any.
    pub fn namespace(&self) -> Option<String> {
        self.0.text_at(layout::NAMESPACE)
    }

    /// Number of declared properties.
    pub fn property_count(&self) -> usize {
        self.0.props.len()
    }

    /// Index of the named property (case-insensitive).
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.0.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    /// Name of property `idx`.
    pub fn property_name(&self, idx: usize) -> Option<&str> {
        self.0.props.get(idx).map(|p| self.0.text(p.name))
    }

    pub(crate) fn prop_meta(&self, idx: usize) -> Option<PropMeta> {
        self.0.props.get(idx).copied()
    }

    /// Decodes the full declaration of property `idx`.
    pub fn property(&self, idx: usize) -> Result<PropertyDecl> {
        let meta = self
            .prop_meta(idx)
            .ok_or_else(|| ScmoError::NotFound(format!("property #{idx} of {}", self.name())))?;
        let chunk = &self.0.chunk;
        let rec = meta.record;
        let flags = chunk.read_u8(rec + layout::property::FLAGS)?;
        Ok(PropertyDecl {
            name: self.0.text(meta.name).to_owned(),
            cim_type: meta.cim_type,
            is_array: meta.is_array,
            is_key: flags & layout::property::FLAG_KEY != 0,
            reference_class: self.0.text_at(rec + layout::property::REFERENCE_CLASS),
            origin_class: self.0.text_at(rec + layout::property::ORIGIN_CLASS),
            propagated: flags & layout::property::FLAG_PROPAGATED != 0,
            qualifiers: read_qualifiers(
                chunk,
                chunk.read_u64(rec + layout::property::QUALIFIER_ARRAY)?,
                chunk.read_u32(rec + layout::property::QUALIFIER_COUNT)?,
            )?,
        })
    }

    /// Decodes every property declaration, in declaration order.
    pub fn properties(&self) -> Result<Vec<PropertyDecl>> {
        (0..self.property_count()).map(|i| self.property(i)).collect()
    }

    /// Decodes the class qualifiers.
    pub fn qualifiers(&self) -> Result<Vec<Qualifier>> {
        let chunk = &self.0.chunk;
        read_qualifiers(
            chunk,
            chunk.read_u64(layout::QUALIFIER_ARRAY)?,
            chunk.read_u32(layout::QUALIFIER_COUNT)?,
        )
    }

    /// Names of the key properties, in declaration order.
    pub fn key_properties(&self) -> Vec<String> {
        self.0
            .props
            .iter()
            .filter(|p| {
                self.0
                    .chunk
                    .read_u8(p.record + layout::property::FLAGS)
                    .map(|f| f & layout::property::FLAG_KEY != 0)
                    .unwrap_or(false)
            })
            .map(|p| self.0.text(p.name).to_owned())
            .collect()
    }

    /// The in-use bytes of the chunk, exactly what is written to a stream.
    pub fn packed_extent(&self) -> &[u8] {
        self.0.chunk.packed()
    }

    /// Size accounting of the chunk.
    pub fn chunk_stats(&self) -> ChunkStats {
        self.0.chunk.stats()
    }

    /// Returns true when both handles share one chunk.
    pub fn ptr_eq(a: &Class, b: &Class) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Number of live handles to this chunk.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Chunk address, stable for the lifetime of the handle.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        Class::ptr_eq(self, other)
    }
}

impl Eq for Class {}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name())
            .field("properties", &self.property_count())
            .field("used", &self.0.chunk.used())
            .finish()
    }
}
