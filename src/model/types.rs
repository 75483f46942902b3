use std::fmt;

use serde::Serialize;

use super::instance::Instance;

/// CIM type tags as stored in property records and value slots.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum CimType {
    Boolean = 0,
    Uint8 = 1,
    Sint8 = 2,
    Uint16 = 3,
    Sint16 = 4,
    Uint32 = 5,
    Sint32 = 6,
    Uint64 = 7,
    Sint64 = 8,
    Real32 = 9,
    Real64 = 10,
    Char16 = 11,
    String = 12,
    Reference = 13,
    Object = 14,
    Instance = 15,
}

impl CimType {
    const ALL: [CimType; 16] = [
        CimType::Boolean,
        CimType::Uint8,
        CimType::Sint8,
        CimType::Uint16,
        CimType::Sint16,
        CimType::Uint32,
        CimType::Sint32,
        CimType::Uint64,
        CimType::Sint64,
        CimType::Real32,
        CimType::Real64,
        CimType::Char16,
        CimType::String,
        CimType::Reference,
        CimType::Object,
        CimType::Instance,
    ];

    /// Decodes a stored tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Returns the stored tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Returns true for types whose values are handles to other instances.
    pub fn is_reference_like(self) -> bool {
        matches!(self, CimType::Reference | CimType::Object | CimType::Instance)
    }

    /// Lowercase CIM name of the type.
    pub fn name(self) -> &'static str {
        match self {
            CimType::Boolean => "boolean",
            CimType::Uint8 => "uint8",
            CimType::Sint8 => "sint8",
            CimType::Uint16 => "uint16",
            CimType::Sint16 => "sint16",
            CimType::Uint32 => "uint32",
            CimType::Sint32 => "sint32",
            CimType::Uint64 => "uint64",
            CimType::Sint64 => "sint64",
            CimType::Real32 => "real32",
            CimType::Real64 => "real64",
            CimType::Char16 => "char16",
            CimType::String => "string",
            CimType::Reference => "reference",
            CimType::Object => "object",
            CimType::Instance => "instance",
        }
    }
}

impl fmt::Display for CimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed property or qualifier value. Null is expressed as `Option::None`
/// at the API boundary.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Value {
    Boolean(bool),
    Uint8(u8),
    Sint8(i8),
    Uint16(u16),
    Sint16(i16),
    Uint32(u32),
    Sint32(i32),
    Uint64(u64),
    Sint64(i64),
    Real32(f32),
    Real64(f64),
    Char16(u16),
    String(String),
    /// Homogeneous array of scalars or strings.
    Array(Vec<Value>),
    /// Reference to another instance.
    Reference(Instance),
    /// Embedded object.
    Object(Instance),
    /// Embedded instance.
    Instance(Instance),
}

impl Value {
    /// Type of a non-array value; `None` for arrays.
    pub fn scalar_type(&self) -> Option<CimType> {
        Some(match self {
            Value::Boolean(_) => CimType::Boolean,
            Value::Uint8(_) => CimType::Uint8,
            Value::Sint8(_) => CimType::Sint8,
            Value::Uint16(_) => CimType::Uint16,
            Value::Sint16(_) => CimType::Sint16,
            Value::Uint32(_) => CimType::Uint32,
            Value::Sint32(_) => CimType::Sint32,
            Value::Uint64(_) => CimType::Uint64,
            Value::Sint64(_) => CimType::Sint64,
            Value::Real32(_) => CimType::Real32,
            Value::Real64(_) => CimType::Real64,
            Value::Char16(_) => CimType::Char16,
            Value::String(_) => CimType::String,
            Value::Reference(_) => CimType::Reference,
            Value::Object(_) => CimType::Object,
            Value::Instance(_) => CimType::Instance,
            Value::Array(_) => return None,
        })
    }

    /// Returns true for array values.
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Returns the instance handle carried by reference-like values.
    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Value::Reference(inst) | Value::Object(inst) | Value::Instance(inst) => Some(inst),
            _ => None,
        }
    }

    /// Returns true when the value fits a declaration of `cim_type`/`is_array`.
    pub fn matches(&self, cim_type: CimType, is_array: bool) -> bool {
        match self {
            Value::Array(items) => {
                is_array && items.iter().all(|v| v.scalar_type() == Some(cim_type))
            }
            other => !is_array && other.scalar_type() == Some(cim_type),
        }
    }
}

/// Compares CIM element names, which are ASCII case-insensitive.
pub fn names_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Qualifier flavor bits.
#[allow(missing_docs)]
pub mod flavor {
    pub const NONE: u32 = 0;
    pub const OVERRIDABLE: u32 = 0x01;
    pub const TOSUBCLASS: u32 = 0x02;
    pub const TOINSTANCE: u32 = 0x04;
    pub const TRANSLATABLE: u32 = 0x08;
    pub const DISABLEOVERRIDE: u32 = 0x10;
    pub const RESTRICTED: u32 = 0x20;
    pub const DEFAULTS: u32 = OVERRIDABLE | TOSUBCLASS;
}

/// A named, typed annotation on a class or property.
#[derive(Clone, Debug, PartialEq)]
pub struct Qualifier {
    /// Qualifier name.
    pub name: String,
    /// Qualifier value; never reference-like.
    pub value: Value,
    /// Flavor bits, see [`flavor`].
    pub flavor: u32,
    /// Whether the qualifier was inherited.
    pub propagated: bool,
}

impl Qualifier {
    /// Creates a qualifier with default flavor.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            flavor: flavor::DEFAULTS,
            propagated: false,
        }
    }

    /// Sets the flavor bits.
    pub fn with_flavor(mut self, flavor: u32) -> Self {
        self.flavor = flavor;
        self
    }

    /// Marks the qualifier as propagated.
    pub fn propagated(mut self) -> Self {
        self.propagated = true;
        self
    }
}

/// Declaration of one class property.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyDecl {
    /// Property name.
    pub name: String,
    /// Declared element type.
    pub cim_type: CimType,
    /// Whether the property holds an array.
    pub is_array: bool,
    /// Whether the property is part of the instance key.
    pub is_key: bool,
    /// Class a reference property points at.
    pub reference_class: Option<String>,
    /// Class that introduced the property.
    pub origin_class: Option<String>,
    /// Whether the property was inherited.
    pub propagated: bool,
    /// Property qualifiers.
    pub qualifiers: Vec<Qualifier>,
}

impl PropertyDecl {
    /// Declares a scalar property.
    pub fn new(name: impl Into<String>, cim_type: CimType) -> Self {
        Self {
            name: name.into(),
            cim_type,
            is_array: false,
            is_key: false,
            reference_class: None,
            origin_class: None,
            propagated: false,
            qualifiers: Vec::new(),
        }
    }

    /// Declares a reference property targeting `class`.
    pub fn reference(name: impl Into<String>, class: impl Into<String>) -> Self {
        let mut decl = Self::new(name, CimType::Reference);
        decl.reference_class = Some(class.into());
        decl
    }

    /// Makes the property an array.
    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }

    /// Marks the property as a key.
    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    /// Records the class that introduced the property.
    pub fn origin_class(mut self, class: impl Into<String>) -> Self {
        self.origin_class = Some(class.into());
        self
    }

    /// Marks the property as inherited.
    pub fn propagated(mut self) -> Self {
        self.propagated = true;
        self
    }

    /// Adds a qualifier.
    pub fn qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifiers.push(qualifier);
        self
    }
}
