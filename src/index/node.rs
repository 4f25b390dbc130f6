//! # Index Nodes
//!
//! In-memory and on-disk representation of one B-tree node. Every node holds
//! up to 64 elements sorted under the index's comparator; each element is a
//! full [`IndexValue`] (key plus data location), so a lookup can terminate at
//! any level of the tree.
//!
//! ## On-Disk Layout
//!
//! ```text
//! [num_elements : 1 byte]
//! [ 64 × element slot: key (key_size bytes) | file_id:2 | pos:4 | length:4 ]
//! [ 65 × child slot:   index_file:2 | offset:4 ]
//! ```
//!
//! Unused element and child slots are zero. A leaf writes all child slots as
//! zero; `(0, 0)` can never name a real node because every index file starts
//! with its 6-byte header. Deleted elements stay in position with
//! `length == DELETED_SENTINEL` so that pointers held by cached parents stay
//! valid; leaf splits purge them.
//!
//! ## Child Pointers
//!
//! In memory a child is either still on disk or resident in the per-index
//! node arena, a plain sum type rather than an owning pointer. Cached nodes
//! carry a back-link to their parent's arena slot and their position in it.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    node_disk_size, BTREE_ELEMENTS, CHILD_POINTER_SIZE, DELETED_SENTINEL, INDEX_VALUE_META_SIZE,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct IndexValueMeta {
    file_id: U16<LittleEndian>,
    pos: U32<LittleEndian>,
    length: U32<LittleEndian>,
}

const _: () = assert!(size_of::<IndexValueMeta>() == INDEX_VALUE_META_SIZE);

/// One index element: a key and the location of its value in a data file.
///
/// `length == DELETED_SENTINEL` marks a tombstone that is kept in place for
/// cache coherence but is not semantically alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexValue {
    pub key: Vec<u8>,
    pub file_id: u16,
    pub pos: u32,
    pub length: u32,
}

impl IndexValue {
    pub fn new(key: Vec<u8>, file_id: u16, pos: u32, length: u32) -> Self {
        Self {
            key,
            file_id,
            pos,
            length,
        }
    }

    pub fn tombstone(key: Vec<u8>) -> Self {
        Self::new(key, 0, 0, DELETED_SENTINEL)
    }

    pub fn is_tombstone(&self) -> bool {
        self.length == DELETED_SENTINEL
    }
}

/// Location of a child node: still on disk, or resident in the index's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Disk { file: u16, offset: u32 },
    Cached(usize),
}

/// One B-tree node. `children` is empty for a leaf and holds
/// `elements.len() + 1` entries otherwise.
#[derive(Debug, Clone)]
pub struct Node {
    /// `(index_file, offset)` where this node lives on disk.
    pub disk: (u16, u32),
    /// Arena slot of the parent and this node's child position in it.
    /// `None` for the root and for transiently loaded nodes.
    pub parent: Option<(usize, u8)>,
    pub elements: Vec<IndexValue>,
    pub children: Vec<Child>,
}

impl Node {
    pub fn new_leaf(disk: (u16, u32)) -> Self {
        Self {
            disk,
            parent: None,
            elements: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Element count excluding tombstones.
    pub fn live_count(&self) -> usize {
        self.elements.iter().filter(|el| !el.is_tombstone()).count()
    }

    /// Binary search under `compare`. `Ok` holds the matching element index,
    /// `Err` the slot where the key would be inserted.
    pub fn search(
        &self,
        key: &[u8],
        compare: fn(&[u8], &[u8]) -> Ordering,
    ) -> std::result::Result<usize, usize> {
        self.elements
            .binary_search_by(|el| compare(&el.key, key))
    }

    /// Serializes the node. `resolve` maps a cached child's arena slot to its
    /// disk location, since the arena is not visible from here.
    pub fn serialize(
        &self,
        key_size: u8,
        resolve: impl Fn(usize) -> (u16, u32),
    ) -> Result<Vec<u8>> {
        ensure!(
            self.elements.len() <= BTREE_ELEMENTS,
            "node holds {} elements, limit is {}",
            self.elements.len(),
            BTREE_ELEMENTS
        );
        ensure!(
            self.is_leaf() || self.children.len() == self.elements.len() + 1,
            "internal node has {} children for {} elements",
            self.children.len(),
            self.elements.len()
        );

        let element_size = key_size as usize + INDEX_VALUE_META_SIZE;
        let mut out = vec![0u8; node_disk_size(key_size) as usize];
        out[0] = self.elements.len() as u8;

        for (i, el) in self.elements.iter().enumerate() {
            ensure!(
                el.key.len() == key_size as usize,
                "element key is {} bytes, index key size is {}",
                el.key.len(),
                key_size
            );
            let start = 1 + i * element_size;
            out[start..start + key_size as usize].copy_from_slice(&el.key);
            let meta = IndexValueMeta {
                file_id: U16::new(el.file_id),
                pos: U32::new(el.pos),
                length: U32::new(el.length),
            };
            out[start + key_size as usize..start + element_size].copy_from_slice(meta.as_bytes());
        }

        let children_start = 1 + BTREE_ELEMENTS * element_size;
        for (i, child) in self.children.iter().enumerate() {
            let (file, offset) = match *child {
                Child::Disk { file, offset } => (file, offset),
                Child::Cached(slot) => resolve(slot),
            };
            let start = children_start + i * CHILD_POINTER_SIZE;
            out[start..start + 2].copy_from_slice(&file.to_le_bytes());
            out[start + 2..start + 6].copy_from_slice(&offset.to_le_bytes());
        }

        Ok(out)
    }

    /// Parses a node image read from `disk`. Children come back as
    /// [`Child::Disk`]; the tree promotes them to cached handles as needed.
    pub fn deserialize(bytes: &[u8], key_size: u8, disk: (u16, u32)) -> Result<Self> {
        let expected = node_disk_size(key_size) as usize;
        ensure!(
            bytes.len() >= expected,
            "node image is {} bytes, expected {}",
            bytes.len(),
            expected
        );

        let num_elements = bytes[0] as usize;
        ensure!(
            num_elements <= BTREE_ELEMENTS,
            "node claims {} elements, limit is {}",
            num_elements,
            BTREE_ELEMENTS
        );

        let element_size = key_size as usize + INDEX_VALUE_META_SIZE;
        let mut elements = Vec::with_capacity(num_elements);
        for i in 0..num_elements {
            let start = 1 + i * element_size;
            let key = bytes[start..start + key_size as usize].to_vec();
            let meta = IndexValueMeta::ref_from_bytes(
                &bytes[start + key_size as usize..start + element_size],
            )
            .map_err(|e| eyre::eyre!("failed to parse index element: {:?}", e))?;
            elements.push(IndexValue {
                key,
                file_id: meta.file_id.get(),
                pos: meta.pos.get(),
                length: meta.length.get(),
            });
        }

        let children_start = 1 + BTREE_ELEMENTS * element_size;
        let first_child = read_child(bytes, children_start);
        let children = if first_child == (0, 0) {
            Vec::new()
        } else {
            (0..=num_elements)
                .map(|i| {
                    let (file, offset) = read_child(bytes, children_start + i * CHILD_POINTER_SIZE);
                    Child::Disk { file, offset }
                })
                .collect()
        };

        Ok(Self {
            disk,
            parent: None,
            elements,
            children,
        })
    }
}

fn read_child(bytes: &[u8], start: usize) -> (u16, u32) {
    let file = u16::from_le_bytes(bytes[start..start + 2].try_into().unwrap());
    let offset = u32::from_le_bytes(bytes[start + 2..start + 6].try_into().unwrap());
    (file, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8, size: usize) -> Vec<u8> {
        let mut k = vec![0u8; size];
        k[0] = byte;
        k
    }

    #[test]
    fn leaf_round_trips_through_disk_image() {
        let mut node = Node::new_leaf((0, 6));
        node.elements.push(IndexValue::new(key(1, 4), 2, 100, 7));
        node.elements.push(IndexValue::new(key(9, 4), 0, 40, 12));

        let bytes = node.serialize(4, |_| unreachable!()).unwrap();
        let parsed = Node::deserialize(&bytes, 4, (0, 6)).unwrap();

        assert!(parsed.is_leaf());
        assert_eq!(parsed.elements, node.elements);
        assert_eq!(parsed.disk, (0, 6));
    }

    #[test]
    fn internal_node_serializes_cached_children_by_location() {
        let mut node = Node::new_leaf((1, 6));
        node.elements.push(IndexValue::new(key(5, 2), 0, 0, 3));
        node.children = vec![Child::Cached(7), Child::Disk { file: 2, offset: 90 }];

        let bytes = node
            .serialize(2, |slot| {
                assert_eq!(slot, 7);
                (1, 1234)
            })
            .unwrap();
        let parsed = Node::deserialize(&bytes, 2, (1, 6)).unwrap();

        assert_eq!(
            parsed.children,
            vec![
                Child::Disk { file: 1, offset: 1234 },
                Child::Disk { file: 2, offset: 90 }
            ]
        );
    }

    #[test]
    fn tombstones_survive_serialization() {
        let mut node = Node::new_leaf((0, 6));
        node.elements.push(IndexValue::tombstone(key(3, 4)));

        let bytes = node.serialize(4, |_| unreachable!()).unwrap();
        let parsed = Node::deserialize(&bytes, 4, (0, 6)).unwrap();

        assert!(parsed.elements[0].is_tombstone());
        assert_eq!(parsed.live_count(), 0);
    }

    #[test]
    fn search_returns_insertion_slot_for_missing_keys() {
        let mut node = Node::new_leaf((0, 6));
        for b in [10u8, 20, 30] {
            node.elements.push(IndexValue::new(key(b, 2), 0, 0, 1));
        }
        let cmp: fn(&[u8], &[u8]) -> std::cmp::Ordering = |a, b| a.cmp(b);

        assert_eq!(node.search(&key(20, 2), cmp), Ok(1));
        assert_eq!(node.search(&key(15, 2), cmp), Err(1));
        assert_eq!(node.search(&key(35, 2), cmp), Err(3));
    }

    #[test]
    fn oversized_node_refuses_to_serialize() {
        let mut node = Node::new_leaf((0, 6));
        for i in 0..=BTREE_ELEMENTS {
            node.elements
                .push(IndexValue::new(key(i as u8, 2), 0, 0, 1));
        }

        assert!(node.serialize(2, |_| (0, 0)).is_err());
    }

    #[test]
    fn mismatched_key_size_refuses_to_serialize() {
        let mut node = Node::new_leaf((0, 6));
        node.elements.push(IndexValue::new(vec![1, 2, 3], 0, 0, 1));

        assert!(node.serialize(4, |_| (0, 0)).is_err());
    }
}
