//! Typed object model packed into chunks: classes, instances and their values.

pub mod class;
pub mod instance;
pub mod types;
pub mod value;

pub use class::{Class, ClassBuilder, CLASS_FIXED_LEN};
pub use instance::{Instance, INSTANCE_FIXED_LEN};
pub use types::{flavor, names_eq, CimType, PropertyDecl, Qualifier, Value};
