//! Purpose: Typed record streams, their binary codec, selectors, and URI adapters.
//! Exports: `core` (schemas, codec, streams, selectors, errors), `adapter` (URI dispatch, sources, sinks).
//! Role: Library backing the `rdump` CLI and embedders that read or write record streams.
//! Invariants: Reading is pull-based on the caller's thread; no background work is spawned.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state, except the descriptor registry.
pub mod adapter;
pub mod core;

pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::record::Record;
pub use crate::core::schema::{Descriptor, Registry};
pub use crate::core::selector::CompiledSelector;
pub use crate::core::stream::{StreamReader, StreamWriter};
pub use crate::core::value::{FieldType, Value};
