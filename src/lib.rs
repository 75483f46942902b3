//! Single-chunk memory objects.
//!
//! Classes and instances of a CIM-style object model are packed into single
//! contiguous chunks so they can be copied byte for byte, and a [`Streamer`]
//! moves whole instance graphs across process boundaries by replacing every
//! in-memory reference with position-independent resolution tables.

#![warn(missing_docs)]

pub mod chunk;
pub mod error;
pub mod model;
pub mod primitives;
pub mod stream;

pub use error::{Result, ScmoError};
pub use model::{CimType, Class, ClassBuilder, Instance, PropertyDecl, Qualifier, Value};
pub use stream::{Streamer, StreamerOptions};
