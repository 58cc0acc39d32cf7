// Core modules implementing schemas, the record codec, streams, and selectors.
pub mod codec;
pub mod error;
pub mod format;
pub mod frame;
pub mod record;
pub mod schema;
pub mod selector;
pub mod stream;
pub mod value;
pub mod varint;
