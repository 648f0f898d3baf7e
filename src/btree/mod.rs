//! Disk-resident B+tree primary index.

pub mod node;
pub mod tree;

pub use node::{MAX_KEYS, MIN_KEYS, NODE_SIZE, Node, Payload};
pub use tree::{BTree, NodeIo};
