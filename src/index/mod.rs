//! # Index Module
//!
//! Persistent order-64 B-tree indexes mapping fixed-length keys to value
//! locations in the shared data files. Each logical index owns a series of
//! numbered node files and a memory-cached subtree bounded by a byte budget.
//!
//! - `node`: element and node representations, on-disk node images
//! - `tree`: descent, insert with median-promotion splits, tombstone delete,
//!   in-order scans, cache and tail management

mod node;
mod tree;

pub use node::{Child, IndexValue, Node};
pub use tree::{lexicographic, BTreeIndex, KeyCompare};
