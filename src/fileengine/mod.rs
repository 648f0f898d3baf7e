//! Binary file engine: header + B+tree area + document region.

pub mod engine;
pub mod header;

pub use engine::FileEngine;
pub use header::{DEFAULT_BTREE_RESERVATION, HEADER_SIZE, Header};
