//! Shared substrate for the backfill engine: ordered storage keys, the
//! key-value store abstraction, table metadata and the table codec, tunable
//! knobs, exponential backoff, and pause-based test hooks.

pub mod backoff;
pub mod codec;
pub mod env;
pub mod key;
pub mod knobs;
pub mod kv;
pub mod pause;
pub mod table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use key::{
    Key,
    KeyRange,
};
