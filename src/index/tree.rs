//! # B-Tree Index
//!
//! One persistent order-64 B-tree per logical index, stored across numbered
//! index files. Keys are fixed-length per index; values are references into
//! the shared data files. Keys live in internal nodes as well as leaves, so
//! a search can stop at any level.
//!
//! ## Structure
//!
//! ```text
//!                 [root, pinned at file 0 offset 6]
//!                 /              |               \
//!        [node]            [node]              [node]      cached levels
//!        /    \            /    \              /    \
//!     (disk) (disk)     (disk) [cached]     (disk) (disk)
//! ```
//!
//! The root and as many lower levels as fit in the index's byte budget are
//! held in a per-index arena (`Vec` of nodes addressed by slot). A child
//! pointer is either an on-disk location or an arena slot; cached nodes keep
//! a back-link naming their parent slot and child position. Nodes below the
//! cached levels are read from disk transiently and never keep pointers into
//! the arena.
//!
//! ## Insert and Split
//!
//! Insertion descends with a path stack and places the element in its leaf
//! slot. A full node splits: 32 elements stay, element 32 promotes, 32 move
//! to a new right sibling appended at the index's staged tail. Promotion
//! recurses; when the root itself splits, the left half moves to a fresh
//! node and the root is rewritten in place with a single element, so the
//! root's disk location never changes and the tree grows in height.
//!
//! ## Delete and Compaction
//!
//! Deletion tombstones the element in place (`length = DELETED_SENTINEL`);
//! no rebalancing happens, which keeps crash semantics trivial. Re-inserting
//! the same key reuses the slot. Leaf splits purge tombstones before
//! splitting, which often absorbs the insert without splitting at all.
//! Tombstones in internal nodes persist, since removing one would have to
//! merge the subtrees around it.
//!
//! ## Tail Staging
//!
//! New nodes are appended at `new_last_file`/`new_last_size`, the staged
//! copies of the index tail. The committed tail moves only after the commit
//! protocol truncates its log, so a crashed commit rolls back cleanly.

use std::cmp::Ordering;
use std::collections::VecDeque;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::config::{node_disk_size, BTREE_ELEMENTS, BTREE_HALF_ELEMENTS, INDEX_FILE_HEADER_SIZE};
use crate::error::StorageError;
use crate::storage::{FileIo, FileKey, FileManager};

use super::node::{Child, IndexValue, Node};

/// Per-index key ordering, supplied when the index is loaded.
pub type KeyCompare = fn(&[u8], &[u8]) -> Ordering;

/// Default comparator: lexicographic over the fixed-length key bytes.
pub fn lexicographic(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// A node being visited: resident in the arena, or transiently read from disk.
enum NodeRef {
    Cached(usize),
    Loaded(Node),
}

type Path = SmallVec<[(NodeRef, usize); 8]>;

/// One loaded index: descriptor, staged tail, and the cached subtree arena.
pub struct BTreeIndex {
    id: u8,
    key_size: u8,
    cache_limit: u32,
    max_file_size: u32,
    pub(crate) last_file: u16,
    pub(crate) last_size: u32,
    pub(crate) new_last_file: u16,
    pub(crate) new_last_size: u32,
    compare: KeyCompare,
    /// Node arena; slot 0 is the root, which is always cached.
    nodes: Vec<Node>,
    cached_bytes: u64,
}

impl BTreeIndex {
    /// Loads the index from its files, creating them on first use. The cache
    /// is filled breadth-first from the root until `cache_limit` is reached.
    pub fn load(
        files: &mut FileManager,
        id: u8,
        key_size: u8,
        cache_limit: u32,
        max_file_size: u32,
        compare: KeyCompare,
    ) -> Result<Self> {
        if key_size == 0 {
            bail!(StorageError::InvariantViolation(
                "index key size must be at least one byte".into()
            ));
        }

        let node_size = node_disk_size(key_size);
        let file0 = FileKey::index(id, 0);
        let fresh =
            !files.exists(file0) || files.len(file0)? < INDEX_FILE_HEADER_SIZE + node_size;

        let mut index = Self {
            id,
            key_size,
            cache_limit,
            max_file_size,
            last_file: 0,
            last_size: INDEX_FILE_HEADER_SIZE + node_size,
            new_last_file: 0,
            new_last_size: INDEX_FILE_HEADER_SIZE + node_size,
            compare,
            nodes: vec![Node::new_leaf((0, INDEX_FILE_HEADER_SIZE))],
            cached_bytes: node_size as u64,
        };

        if fresh {
            files.write_at(file0, 0, &index.header_image())?;
            index.write_node_slot(files, 0)?;
            files.sync(file0)?;
            return Ok(index);
        }

        let mut header = [0u8; INDEX_FILE_HEADER_SIZE as usize];
        files.read_at(file0, 0, &mut header)?;
        index.last_file = u16::from_le_bytes(header[0..2].try_into().unwrap());
        index.last_size = u32::from_le_bytes(header[2..6].try_into().unwrap());
        index.new_last_file = index.last_file;
        index.new_last_size = index.last_size;

        let root = index.read_node(files, (0, INDEX_FILE_HEADER_SIZE))?;
        index.nodes[0] = root;
        index.fill_cache(files)?;
        Ok(index)
    }

    fn fill_cache(&mut self, files: &mut FileManager) -> Result<()> {
        let node_size = node_disk_size(self.key_size) as u64;
        let mut queue = VecDeque::from([0usize]);

        while let Some(slot) = queue.pop_front() {
            let disk_children: Vec<(usize, u16, u32)> = self.nodes[slot]
                .children
                .iter()
                .enumerate()
                .filter_map(|(i, child)| match child {
                    Child::Disk { file, offset } => Some((i, *file, *offset)),
                    Child::Cached(_) => None,
                })
                .collect();

            for (i, file, offset) in disk_children {
                if self.cached_bytes + node_size > self.cache_limit as u64 {
                    return Ok(());
                }
                let mut node = self.read_node(files, (file, offset))?;
                node.parent = Some((slot, i as u8));
                let child_slot = self.nodes.len();
                self.nodes.push(node);
                self.cached_bytes += node_size;
                self.nodes[slot].children[i] = Child::Cached(child_slot);
                queue.push_back(child_slot);
            }
        }
        Ok(())
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn key_size(&self) -> u8 {
        self.key_size
    }

    pub fn last_file(&self) -> u16 {
        self.last_file
    }

    pub fn last_size(&self) -> u32 {
        self.last_size
    }

    /// Serialized tail header carrying the *staged* values, written by the
    /// commit protocol at its promote step.
    pub(crate) fn header_image(&self) -> [u8; INDEX_FILE_HEADER_SIZE as usize] {
        let mut out = [0u8; INDEX_FILE_HEADER_SIZE as usize];
        out[0..2].copy_from_slice(&self.new_last_file.to_le_bytes());
        out[2..6].copy_from_slice(&self.new_last_size.to_le_bytes());
        out
    }

    /// Resets the staged tail to the committed tail at the start of a commit.
    pub(crate) fn stage_reset(&mut self) {
        self.new_last_file = self.last_file;
        self.new_last_size = self.last_size;
    }

    /// Moves the committed tail to the staged values, after log truncation.
    pub(crate) fn promote_tails(&mut self) {
        self.last_file = self.new_last_file;
        self.last_size = self.new_last_size;
    }

    /// Looks up a key. Tombstoned entries read as absent.
    pub fn find<F: FileIo>(&self, files: &mut F, key: &[u8]) -> Result<Option<IndexValue>> {
        self.check_key(key)?;
        let mut current = NodeRef::Cached(0);
        loop {
            let next = {
                let node = self.node(&current);
                match node.search(key, self.compare) {
                    Ok(i) => {
                        let el = &node.elements[i];
                        return Ok(if el.is_tombstone() {
                            None
                        } else {
                            Some(el.clone())
                        });
                    }
                    Err(_) if node.is_leaf() => return Ok(None),
                    Err(i) => node.children[i],
                }
            };
            current = self.resolve_child(files, next)?;
        }
    }

    /// Inserts or overwrites an element. An existing element with the same
    /// key, tombstoned or live, has its slot reused.
    pub fn insert<F: FileIo>(&mut self, files: &mut F, value: IndexValue) -> Result<()> {
        self.check_key(&value.key)?;
        let mut path: Path = SmallVec::new();
        let mut current = NodeRef::Cached(0);
        loop {
            let step = {
                let node = self.node(&current);
                match node.search(&value.key, self.compare) {
                    Ok(i) => Step::Overwrite(i),
                    Err(i) if node.is_leaf() => Step::Place(i),
                    Err(i) => Step::Descend(i, node.children[i]),
                }
            };
            match step {
                Step::Overwrite(i) => {
                    self.with_node_mut(&mut current, |node| node.elements[i] = value);
                    self.write_node(files, &current)?;
                    return Ok(());
                }
                Step::Place(i) => {
                    return self.insert_in_node(files, &mut path, current, i, value, None);
                }
                Step::Descend(i, child) => {
                    let next = self.resolve_child(files, child)?;
                    path.push((current, i));
                    current = next;
                }
            }
        }
    }

    /// Tombstones a key, returning the element it previously held. Absent
    /// and already-tombstoned keys return `None`.
    pub fn delete<F: FileIo>(&mut self, files: &mut F, key: &[u8]) -> Result<Option<IndexValue>> {
        self.check_key(key)?;
        let mut current = NodeRef::Cached(0);
        loop {
            let step = {
                let node = self.node(&current);
                match node.search(key, self.compare) {
                    Ok(i) => Step::Overwrite(i),
                    Err(_) if node.is_leaf() => return Ok(None),
                    Err(i) => Step::Descend(i, node.children[i]),
                }
            };
            match step {
                Step::Overwrite(i) => {
                    let old = self.node(&current).elements[i].clone();
                    if old.is_tombstone() {
                        return Ok(None);
                    }
                    self.with_node_mut(&mut current, |node| {
                        node.elements[i] = IndexValue::tombstone(old.key.clone());
                    });
                    self.write_node(files, &current)?;
                    return Ok(Some(old));
                }
                Step::Descend(_, child) => current = self.resolve_child(files, child)?,
                Step::Place(_) => unreachable!(),
            }
        }
    }

    /// In-order traversal of live elements, ascending under the comparator.
    pub fn scan<F: FileIo>(
        &self,
        files: &mut F,
        visit: &mut dyn FnMut(&IndexValue),
    ) -> Result<()> {
        self.scan_ref(files, NodeRef::Cached(0), visit)
    }

    fn scan_ref<F: FileIo>(
        &self,
        files: &mut F,
        current: NodeRef,
        visit: &mut dyn FnMut(&IndexValue),
    ) -> Result<()> {
        let node: &Node = match &current {
            NodeRef::Cached(slot) => &self.nodes[*slot],
            NodeRef::Loaded(node) => node,
        };

        if node.is_leaf() {
            for el in &node.elements {
                if !el.is_tombstone() {
                    visit(el);
                }
            }
            return Ok(());
        }

        for i in 0..node.elements.len() {
            let child = self.resolve_child(files, node.children[i])?;
            self.scan_ref(files, child, visit)?;
            let el = &node.elements[i];
            if !el.is_tombstone() {
                visit(el);
            }
        }
        let last = self.resolve_child(files, *node.children.last().unwrap())?;
        self.scan_ref(files, last, visit)
    }

    fn insert_in_node<F: FileIo>(
        &mut self,
        files: &mut F,
        path: &mut Path,
        mut node_ref: NodeRef,
        pos: usize,
        value: IndexValue,
        right_child: Option<Child>,
    ) -> Result<()> {
        if self.node(&node_ref).elements.len() < BTREE_ELEMENTS {
            self.with_node_mut(&mut node_ref, |node| {
                node.elements.insert(pos, value);
                if let Some(rc) = right_child {
                    node.children.insert(pos + 1, rc);
                }
            });
            if let NodeRef::Cached(slot) = &node_ref {
                self.refresh_child_links(*slot);
            }
            return self.write_node(files, &node_ref);
        }

        // Full node: build the 65-element (and, if internal, 66-child) view.
        let (mut elems, mut children, is_leaf) = {
            let node = self.node(&node_ref);
            (node.elements.clone(), node.children.clone(), node.is_leaf())
        };
        elems.insert(pos, value);
        if let Some(rc) = right_child {
            children.insert(pos + 1, rc);
        }

        if is_leaf {
            // Compaction point: purge tombstones before paying for a split.
            let before = elems.len();
            elems.retain(|el| !el.is_tombstone());
            if elems.len() < before && elems.len() <= BTREE_ELEMENTS {
                self.with_node_mut(&mut node_ref, |node| node.elements = elems);
                return self.write_node(files, &node_ref);
            }
        }

        let right_elems = elems.split_off(BTREE_HALF_ELEMENTS + 1);
        let median = elems.pop().expect("split leaves a median");
        let (left_children, right_children) = if is_leaf {
            (Vec::new(), Vec::new())
        } else {
            let right_children = children.split_off(BTREE_HALF_ELEMENTS + 1);
            (children, right_children)
        };

        let right_loc = self.allocate_node_location()?;
        let node_size = node_disk_size(self.key_size) as u64;

        match node_ref {
            NodeRef::Cached(slot) => {
                // Siblings of cached nodes join the cache so that no cached
                // node ends up under an uncached parent.
                let right_slot = self.nodes.len();
                self.nodes.push(Node {
                    disk: right_loc,
                    parent: None,
                    elements: right_elems,
                    children: right_children,
                });
                self.cached_bytes += node_size;
                self.refresh_child_links(right_slot);

                if path.is_empty() {
                    ensure!(slot == 0, "unparented non-root node in split");
                    // Root split: the root stays pinned at its disk location;
                    // its left half moves out to a fresh node.
                    let left_loc = self.allocate_node_location()?;
                    let left_slot = self.nodes.len();
                    self.nodes.push(Node {
                        disk: left_loc,
                        parent: None,
                        elements: elems,
                        children: left_children,
                    });
                    self.cached_bytes += node_size;
                    self.refresh_child_links(left_slot);

                    let root = &mut self.nodes[slot];
                    root.elements = vec![median];
                    root.children = vec![Child::Cached(left_slot), Child::Cached(right_slot)];
                    self.refresh_child_links(slot);

                    self.write_node_slot(files, left_slot)?;
                    self.write_node_slot(files, right_slot)?;
                    return self.write_node_slot(files, slot);
                }

                let node = &mut self.nodes[slot];
                node.elements = elems;
                node.children = left_children;
                self.refresh_child_links(slot);
                self.write_node_slot(files, slot)?;
                self.write_node_slot(files, right_slot)?;

                let (parent_ref, parent_pos) = path.pop().expect("non-root node has a parent");
                self.insert_in_node(
                    files,
                    path,
                    parent_ref,
                    parent_pos,
                    median,
                    Some(Child::Cached(right_slot)),
                )
            }
            NodeRef::Loaded(mut node) => {
                ensure!(!path.is_empty(), "transient node cannot be the root");
                let right = Node {
                    disk: right_loc,
                    parent: None,
                    elements: right_elems,
                    children: right_children,
                };
                node.elements = elems;
                node.children = left_children;
                self.write_node_obj(files, &node)?;
                self.write_node_obj(files, &right)?;

                let (parent_ref, parent_pos) = path.pop().expect("non-root node has a parent");
                self.insert_in_node(
                    files,
                    path,
                    parent_ref,
                    parent_pos,
                    median,
                    Some(Child::Disk {
                        file: right_loc.0,
                        offset: right_loc.1,
                    }),
                )
            }
        }
    }

    /// Reserves space for a new node at the staged tail, rolling to the next
    /// index file when the current one is full.
    fn allocate_node_location(&mut self) -> Result<(u16, u32)> {
        let node_size = node_disk_size(self.key_size);
        let end = self.new_last_size.checked_add(node_size);
        if end.is_none() || end.unwrap() > self.max_file_size {
            if self.new_last_file == u16::MAX {
                bail!(StorageError::Full(format!(
                    "index {} has no file ids left",
                    self.id
                )));
            }
            self.new_last_file += 1;
            self.new_last_size = INDEX_FILE_HEADER_SIZE;
        }
        let loc = (self.new_last_file, self.new_last_size);
        self.new_last_size += node_size;
        Ok(loc)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size as usize {
            bail!(StorageError::InvariantViolation(format!(
                "key is {} bytes, index {} uses {}-byte keys",
                key.len(),
                self.id,
                self.key_size
            )));
        }
        Ok(())
    }

    fn node<'a>(&'a self, node_ref: &'a NodeRef) -> &'a Node {
        match node_ref {
            NodeRef::Cached(slot) => &self.nodes[*slot],
            NodeRef::Loaded(node) => node,
        }
    }

    fn with_node_mut<R>(&mut self, node_ref: &mut NodeRef, f: impl FnOnce(&mut Node) -> R) -> R {
        match node_ref {
            NodeRef::Cached(slot) => f(&mut self.nodes[*slot]),
            NodeRef::Loaded(node) => f(node),
        }
    }

    fn resolve_child<F: FileIo>(&self, files: &mut F, child: Child) -> Result<NodeRef> {
        match child {
            Child::Cached(slot) => Ok(NodeRef::Cached(slot)),
            Child::Disk { file, offset } => {
                Ok(NodeRef::Loaded(self.read_node(files, (file, offset))?))
            }
        }
    }

    fn read_node<F: FileIo>(&self, files: &mut F, loc: (u16, u32)) -> Result<Node> {
        let mut buf = vec![0u8; node_disk_size(self.key_size) as usize];
        files.read_at(FileKey::index(self.id, loc.0), loc.1, &mut buf)?;
        Node::deserialize(&buf, self.key_size, loc)
    }

    /// Repoints the parent back-links of every cached child of `slot`.
    fn refresh_child_links(&mut self, slot: usize) {
        let cached: Vec<(usize, usize)> = self.nodes[slot]
            .children
            .iter()
            .enumerate()
            .filter_map(|(i, child)| match child {
                Child::Cached(c) => Some((i, *c)),
                Child::Disk { .. } => None,
            })
            .collect();
        for (i, child_slot) in cached {
            self.nodes[child_slot].parent = Some((slot, i as u8));
        }
    }

    fn write_node<F: FileIo>(&self, files: &mut F, node_ref: &NodeRef) -> Result<()> {
        match node_ref {
            NodeRef::Cached(slot) => self.write_node_slot(files, *slot),
            NodeRef::Loaded(node) => self.write_node_obj(files, node),
        }
    }

    fn write_node_slot<F: FileIo>(&self, files: &mut F, slot: usize) -> Result<()> {
        let node = &self.nodes[slot];
        self.write_node_obj(files, node)
    }

    fn write_node_obj<F: FileIo>(&self, files: &mut F, node: &Node) -> Result<()> {
        let bytes = node.serialize(self.key_size, |slot| self.nodes[slot].disk)?;
        files.write_at(FileKey::index(self.id, node.disk.0), node.disk.1, &bytes)
    }

    #[cfg(test)]
    fn root(&self) -> &Node {
        &self.nodes[0]
    }
}

enum Step {
    Overwrite(usize),
    Place(usize),
    Descend(usize, Child),
}
