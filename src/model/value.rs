//! Fixed-size value slots stored inside class and instance chunks.
//!
//! A slot is 24 bytes: type tag, flags, array length, and two payload words.
//! Scalars live inline in the first word. Strings and arrays store a relative
//! pointer (start, size) in the two words; array elements are 8 bytes for
//! scalars and 16 bytes (a relative string pointer) for strings. Reference-like
//! slots carry no inline payload: the handle lives in the owning instance's
//! external-reference table and the first word is free to carry a stream tag.

use crate::chunk::{ChunkBuf, DataPtr, DATA_PTR_LEN};
use crate::error::{Result, ScmoError};

use super::types::{CimType, Value};

/// Encoded length of a value slot.
pub const VALUE_SLOT_LEN: u64 = 24;

/// Slot flag bits.
pub mod flags {
    /// The value is null.
    pub const NULL: u8 = 0x01;
    /// The value is an array.
    pub const ARRAY: u8 = 0x02;
    /// The value was explicitly assigned.
    pub const SET: u8 = 0x04;
}

mod offsets {
    pub const TYPE: u64 = 0;
    pub const FLAGS: u64 = 1;
    pub const ARRAY_LEN: u64 = 4;
    pub const WORD0: u64 = 8;
    pub const WORD1: u64 = 16;
}

const SCALAR_ELEM_LEN: u64 = 8;

/// Decoded value slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Slot {
    pub cim_type: u8,
    pub flags: u8,
    pub array_len: u32,
    pub word0: u64,
    pub word1: u64,
}

impl Slot {
    pub(crate) fn null(cim_type: CimType, is_array: bool) -> Self {
        let mut flags = flags::NULL;
        if is_array {
            flags |= flags::ARRAY;
        }
        Self {
            cim_type: cim_type.tag(),
            flags,
            ..Self::default()
        }
    }

    pub(crate) fn read(chunk: &ChunkBuf, off: u64) -> Result<Self> {
        Ok(Self {
            cim_type: chunk.read_u8(off + offsets::TYPE)?,
            flags: chunk.read_u8(off + offsets::FLAGS)?,
            array_len: chunk.read_u32(off + offsets::ARRAY_LEN)?,
            word0: chunk.read_u64(off + offsets::WORD0)?,
            word1: chunk.read_u64(off + offsets::WORD1)?,
        })
    }

    pub(crate) fn write(&self, chunk: &mut ChunkBuf, off: u64) {
        chunk.write_u8(off + offsets::TYPE, self.cim_type);
        chunk.write_u8(off + offsets::FLAGS, self.flags);
        chunk.write_u8(off + 2, 0);
        chunk.write_u8(off + 3, 0);
        chunk.write_u32(off + offsets::ARRAY_LEN, self.array_len);
        chunk.write_u64(off + offsets::WORD0, self.word0);
        chunk.write_u64(off + offsets::WORD1, self.word1);
    }

    pub(crate) fn is_null(&self) -> bool {
        self.flags & flags::NULL != 0
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flags & flags::SET != 0
    }

    pub(crate) fn is_array(&self) -> bool {
        self.flags & flags::ARRAY != 0
    }
}

/// Overwrites the first payload word of the slot at `off`.
pub(crate) fn write_word0(chunk: &mut ChunkBuf, off: u64, word: u64) {
    chunk.write_u64(off + offsets::WORD0, word);
}

fn scalar_bits(value: &Value) -> Option<u64> {
    Some(match *value {
        Value::Boolean(v) => u64::from(v),
        Value::Uint8(v) => u64::from(v),
        Value::Sint8(v) => i64::from(v) as u64,
        Value::Uint16(v) => u64::from(v),
        Value::Sint16(v) => i64::from(v) as u64,
        Value::Uint32(v) => u64::from(v),
        Value::Sint32(v) => i64::from(v) as u64,
        Value::Uint64(v) => v,
        Value::Sint64(v) => v as u64,
        Value::Real32(v) => u64::from(v.to_bits()),
        Value::Real64(v) => v.to_bits(),
        Value::Char16(v) => u64::from(v),
        _ => return None,
    })
}

fn scalar_from_bits(cim_type: CimType, bits: u64) -> Option<Value> {
    Some(match cim_type {
        CimType::Boolean => Value::Boolean(bits != 0),
        CimType::Uint8 => Value::Uint8(bits as u8),
        CimType::Sint8 => Value::Sint8(bits as i8),
        CimType::Uint16 => Value::Uint16(bits as u16),
        CimType::Sint16 => Value::Sint16(bits as i16),
        CimType::Uint32 => Value::Uint32(bits as u32),
        CimType::Sint32 => Value::Sint32(bits as i32),
        CimType::Uint64 => Value::Uint64(bits),
        CimType::Sint64 => Value::Sint64(bits as i64),
        CimType::Real32 => Value::Real32(f32::from_bits(bits as u32)),
        CimType::Real64 => Value::Real64(f64::from_bits(bits)),
        CimType::Char16 => Value::Char16(bits as u16),
        _ => return None,
    })
}

/// Writes an inline (non reference-like) value into the slot at `off`.
///
/// The value must already have been checked against the declaration.
pub(crate) fn write_inline(
    chunk: &mut ChunkBuf,
    off: u64,
    cim_type: CimType,
    is_array: bool,
    value: Option<&Value>,
) -> Result<()> {
    let mut slot = Slot::null(cim_type, is_array);
    slot.flags |= flags::SET;
    match value {
        None => {}
        Some(Value::Array(items)) => {
            slot.flags &= !flags::NULL;
            slot.array_len = u32::try_from(items.len()).map_err(|_| {
                ScmoError::InvalidArgument(format!("array of {} elements", items.len()))
            })?;
            let elem_len = if cim_type == CimType::String {
                DATA_PTR_LEN as u64
            } else {
                SCALAR_ELEM_LEN
            };
            let region = chunk.alloc(elem_len * items.len() as u64)?;
            for (i, item) in items.iter().enumerate() {
                let at = region.start + i as u64 * elem_len;
                match item {
                    Value::String(s) => {
                        let ptr = chunk.put_str(s)?;
                        chunk.write_data_ptr(at, ptr);
                    }
                    other => {
                        let bits = scalar_bits(other).ok_or_else(|| {
                            ScmoError::TypeMismatch(format!("{cim_type} array element"))
                        })?;
                        chunk.write_u64(at, bits);
                    }
                }
            }
            slot.word0 = region.start;
            slot.word1 = region.size;
        }
        Some(Value::String(s)) => {
            slot.flags &= !flags::NULL;
            let ptr = chunk.put_str(s)?;
            slot.word0 = ptr.start;
            slot.word1 = ptr.size;
        }
        Some(other) => {
            slot.flags &= !flags::NULL;
            slot.word0 = scalar_bits(other)
                .ok_or_else(|| ScmoError::TypeMismatch(format!("{cim_type} slot")))?;
        }
    }
    slot.write(chunk, off);
    Ok(())
}

/// Decodes the inline value of the slot at `off`, checking it against the
/// declared type. Every pointer is bounds-checked, so this doubles as the
/// validation of untrusted slots.
pub(crate) fn read_inline(
    chunk: &ChunkBuf,
    off: u64,
    cim_type: CimType,
    is_array: bool,
) -> Result<Option<Value>> {
    let slot = Slot::read(chunk, off)?;
    check_header(&slot, cim_type, is_array)?;
    if slot.is_null() {
        return Ok(None);
    }
    if is_array {
        let elem_len = if cim_type == CimType::String {
            DATA_PTR_LEN as u64
        } else {
            SCALAR_ELEM_LEN
        };
        let len = u64::from(slot.array_len);
        if len.checked_mul(elem_len) != Some(slot.word1) {
            return Err(ScmoError::malformed(format!(
                "array of {len} {cim_type} elements spans {} bytes",
                slot.word1
            )));
        }
        let region = DataPtr::new(slot.word0, slot.word1);
        chunk.slice(region)?;
        let mut items = Vec::with_capacity(len as usize);
        for i in 0..len {
            let at = region.start + i * elem_len;
            let item = if cim_type == CimType::String {
                Value::String(chunk.str_at(chunk.read_data_ptr(at)?)?.to_owned())
            } else {
                scalar_value(cim_type, chunk.read_u64(at)?)?
            };
            items.push(item);
        }
        return Ok(Some(Value::Array(items)));
    }
    if cim_type == CimType::String {
        let s = chunk.str_at(DataPtr::new(slot.word0, slot.word1))?;
        return Ok(Some(Value::String(s.to_owned())));
    }
    scalar_value(cim_type, slot.word0).map(Some)
}

fn scalar_value(cim_type: CimType, bits: u64) -> Result<Value> {
    scalar_from_bits(cim_type, bits)
        .ok_or_else(|| ScmoError::malformed(format!("{cim_type} cannot be stored inline")))
}

/// Checks the type tag and array flag of a slot against its declaration.
pub(crate) fn check_header(slot: &Slot, cim_type: CimType, is_array: bool) -> Result<()> {
    if slot.cim_type != cim_type.tag() || slot.is_array() != is_array {
        return Err(ScmoError::malformed(format!(
            "slot tag {} (array: {}) does not match declared {cim_type} (array: {is_array})",
            slot.cim_type,
            slot.is_array()
        )));
    }
    Ok(())
}
