//! # Transaction Buffer
//!
//! In-memory staging area for one transaction's pending operations, keyed by
//! `(index, key)`. Nothing here touches a file; the commit engine replays the
//! buffered state atomically, and dropping a transaction discards it.
//!
//! ## Coalescing Rules
//!
//! The buffer folds each submitted operation into three collections so that
//! commit can replay them in a fixed order (renames, then writes, then
//! deletes) while preserving the semantics of the submission order:
//!
//! - A full write replaces any pending write for the key, absorbs its pending
//!   sub-sections, and cancels a pending delete.
//! - A sub-section write against a pending full write splices into the
//!   buffered bytes directly, zero-filling any gap and extending the buffer
//!   when it reaches past the end. Otherwise it stacks up for replay in
//!   insertion order against the committed base value.
//! - A delete drops the key's pending writes. Deleting the target of a
//!   pending rename also cancels the rename and redirects the delete to the
//!   rename's source, so the moved value dies with it.
//! - A rename retargets the key's pending writes. Rename chains collapse
//!   (`a→b` then `b→c` becomes `a→c`), so each recorded rename is a single
//!   hop from a committed key.
//!
//! The database layer validates operations (key sizes, base-value existence)
//! before they reach the buffer; this type only owns the bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use super::IndexId;

/// Pending state for one key: a full replacement, or a stack of sub-section
/// overwrites replayed in insertion order. Never both, because a full write
/// absorbs the stack.
#[derive(Debug, Default, Clone)]
pub(crate) struct PendingValue {
    pub full: Option<Vec<u8>>,
    pub subsections: Vec<(u32, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingRename {
    pub index: IndexId,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// One live transaction's buffered operations.
#[derive(Debug, Default)]
pub struct Transaction {
    pub(crate) writes: BTreeMap<(IndexId, Vec<u8>), PendingValue>,
    pub(crate) deletes: BTreeSet<(IndexId, Vec<u8>)>,
    pub(crate) renames: Vec<PendingRename>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// True when commit would have nothing to do.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty() && self.renames.is_empty()
    }

    /// Removes all pending operations, leaving the transaction reusable.
    pub fn clear_pending(&mut self) {
        self.writes.clear();
        self.deletes.clear();
        self.renames.clear();
    }

    pub(crate) fn stage_full_write(&mut self, index: IndexId, key: Vec<u8>, data: Vec<u8>) {
        self.deletes.remove(&(index, key.clone()));
        let entry = self.writes.entry((index, key)).or_default();
        entry.full = Some(data);
        entry.subsections.clear();
    }

    /// Stages a sub-section overwrite. When a full write is pending the bytes
    /// splice straight into it; otherwise they stack for replay at commit.
    pub(crate) fn stage_subsection(
        &mut self,
        index: IndexId,
        key: Vec<u8>,
        offset: u32,
        data: Vec<u8>,
    ) {
        let entry = self.writes.entry((index, key)).or_default();
        match &mut entry.full {
            Some(full) => splice(full, offset as usize, &data),
            None => entry.subsections.push((offset, data)),
        }
    }

    pub(crate) fn stage_delete(&mut self, index: IndexId, key: Vec<u8>) {
        self.writes.remove(&(index, key.clone()));

        // Deleting a rename target kills the moved value: cancel the rename
        // and delete its committed source instead.
        if let Some(pos) = self
            .renames
            .iter()
            .position(|r| r.index == index && r.new == key)
        {
            let rename = self.renames.remove(pos);
            self.deletes.insert((index, rename.old));
        }
        self.deletes.insert((index, key));
    }

    /// Moves any pending writes for `old` over to `new` and cancels a pending
    /// delete of `new`. Returns whether writes were moved.
    pub(crate) fn retarget_write(&mut self, index: IndexId, old: &[u8], new: &[u8]) -> bool {
        match self.writes.remove(&(index, old.to_vec())) {
            Some(pending) => {
                self.deletes.remove(&(index, new.to_vec()));
                self.writes.insert((index, new.to_vec()), pending);
                true
            }
            None => false,
        }
    }

    /// Records a rename of a committed key, collapsing chains so that every
    /// recorded rename is one hop.
    pub(crate) fn stage_rename(&mut self, index: IndexId, old: Vec<u8>, new: Vec<u8>) {
        if let Some(rename) = self
            .renames
            .iter_mut()
            .find(|r| r.index == index && r.new == old)
        {
            rename.new = new;
            return;
        }
        self.renames.push(PendingRename { index, old, new });
    }

    pub(crate) fn is_deleted(&self, index: IndexId, key: &[u8]) -> bool {
        self.deletes.contains(&(index, key.to_vec()))
    }

    pub(crate) fn pending(&self, index: IndexId, key: &[u8]) -> Option<&PendingValue> {
        self.writes.get(&(index, key.to_vec()))
    }

    /// The committed key whose value will move to `key`, if one is staged.
    pub(crate) fn rename_source_of(&self, index: IndexId, key: &[u8]) -> Option<&[u8]> {
        self.renames
            .iter()
            .find(|r| r.index == index && r.new == key)
            .map(|r| r.old.as_slice())
    }

    /// Whether `key`'s committed value is staged to move to another key.
    pub(crate) fn is_renamed_away(&self, index: IndexId, key: &[u8]) -> bool {
        self.renames.iter().any(|r| r.index == index && r.old == key)
    }
}

/// Copies `data` into `buf` at `offset`, zero-filling any gap and extending
/// the buffer when the write reaches past its end.
pub(crate) fn splice(buf: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if end > buf.len() {
        buf.resize(end, 0);
    }
    buf[offset..end].copy_from_slice(data);
}
