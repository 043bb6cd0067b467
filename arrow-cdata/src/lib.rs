//! Arrow C data, C stream and C device interface structures.
//!
//! Every structure here is owned by whoever holds it and ends its life by
//! calling its own `release` callback exactly once. The handle types wrap
//! that contract:
//!
//! * [`SchemaHandle`] / [`ArrayHandle`] / [`StreamHandle`] own a live
//!   structure and release it on drop;
//! * `from_raw` moves a foreign structure in and marks the source released;
//! * `export_to` / `into_raw` move it back out.
//!
//! Arrays are assembled as owned [`ArrayData`] (reference-counted
//! [`Buffer`]s), then exported. [`validate`] checks an array tree against its
//! schema before a consumer touches it.

pub mod array;
pub mod buffer;
pub mod capsule;
pub mod error;
pub mod ffi;
pub mod format;
pub mod layout;
pub mod pointer;
pub mod schema;
pub mod stream;
pub mod validate;

pub use array::{ArrayData, ArrayHandle, ArrayView};
pub use buffer::Buffer;
pub use capsule::{Capsule, CapsulePayload};
pub use error::{Error, Result, ValidationError};
pub use ffi::{ArrowArray, ArrowArrayStream, ArrowDeviceArray, ArrowSchema};
pub use format::{format_of, parse_format};
pub use layout::{BufferKind, Layout};
pub use pointer::Releasable;
pub use schema::{Schema, SchemaHandle, SchemaView};
pub use stream::{export_stream, BasicArrayStream, StreamHandle};
pub use validate::validate;

/// Version of this crate, as built.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
