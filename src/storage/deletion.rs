//! # Deletion Index
//!
//! In-memory ordered collection of the free extents inside data files,
//! backing best-fit allocation. Every extent that a commit frees (a deleted
//! value, or the tail of a value that shrank) becomes a record here and can
//! be carved up by later writes instead of growing the data files.
//!
//! ## Record Layout
//!
//! Each record is 12 bytes in the `del` file, after the database header:
//!
//! ```text
//! Offset  Size  Description
//! 0       1     active flag (1 = reusable, 0 = retired)
//! 1       4     extent length, big-endian
//! 5       2     data file id, little-endian
//! 7       4     extent offset, little-endian
//! 11      1     reserved
//! ```
//!
//! The length field is big-endian so that the in-memory ordering (active
//! first, then length descending) matches a lexicographic sort of the raw
//! record key, the layout the original file format was designed around.
//!
//! ## Best Fit In O(log n)
//!
//! The collection orders active extents before inactive ones and longer
//! extents before shorter ones, so "largest active extent" is the first
//! element. An allocation inspects only that element: either it is long
//! enough and gets carved from its high end, or no extent fits and the
//! caller appends to the current data file instead.
//!
//! ## Retired Records
//!
//! Records are never removed from the file. A fully consumed extent has its
//! active flag cleared in place, and the record slot is reused the next time
//! an extent is freed. Adjacent free extents are not coalesced; the
//! accounting workload rarely produces near-miss neighbors.
//!
//! ## Persistence
//!
//! This type never touches files itself. Mutations return
//! [`SectionRecordWrite`] values naming the record slot and its new 12 bytes;
//! the commit engine stages those through the write-ahead log like any other
//! overwrite, and the index is rebuilt from the `del` file on open.

use std::collections::BTreeMap;

use eyre::{ensure, Result};
use smallvec::SmallVec;
use zerocopy::byteorder::{BigEndian, LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{DB_HEADER_SIZE, DELETED_SECTION_SIZE};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SectionRecord {
    active: u8,
    length: U32<BigEndian>,
    file_id: U16<LittleEndian>,
    offset: U32<LittleEndian>,
    reserved: u8,
}

const _: () = assert!(size_of::<SectionRecord>() == DELETED_SECTION_SIZE as usize);

/// One free (or retired) extent inside a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedSection {
    pub active: bool,
    pub length: u32,
    pub file_id: u16,
    pub offset: u32,
}

impl DeletedSection {
    pub fn encode(&self) -> [u8; DELETED_SECTION_SIZE as usize] {
        let record = SectionRecord {
            active: self.active as u8,
            length: U32::new(self.length),
            file_id: U16::new(self.file_id),
            offset: U32::new(self.offset),
            reserved: 0,
        };
        let mut out = [0u8; DELETED_SECTION_SIZE as usize];
        out.copy_from_slice(record.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= DELETED_SECTION_SIZE as usize,
            "buffer too small for deleted-section record: {} < {}",
            bytes.len(),
            DELETED_SECTION_SIZE
        );
        let record = SectionRecord::ref_from_bytes(&bytes[..DELETED_SECTION_SIZE as usize])
            .map_err(|e| eyre::eyre!("failed to parse deleted-section record: {:?}", e))?;
        Ok(Self {
            active: record.active != 0,
            length: record.length.get(),
            file_id: record.file_id.get(),
            offset: record.offset.get(),
        })
    }
}

// Active extents first, longest first, so the best fit is the first element
// of an ordered map.
impl Ord for DeletedSection {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .active
            .cmp(&self.active)
            .then(other.length.cmp(&self.length))
            .then(self.file_id.cmp(&other.file_id))
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for DeletedSection {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A pending overwrite of one record slot in the `del` file.
#[derive(Debug, Clone, Copy)]
pub struct SectionRecordWrite {
    pub slot: u32,
    pub record: [u8; DELETED_SECTION_SIZE as usize],
}

impl SectionRecordWrite {
    /// Byte offset of the record inside the `del` file.
    pub fn file_offset(&self) -> u32 {
        DB_HEADER_SIZE + self.slot * DELETED_SECTION_SIZE
    }
}

/// Ordered free-extent index with slot bookkeeping for the `del` file.
#[derive(Debug, Default)]
pub struct DeletionIndex {
    sections: BTreeMap<DeletedSection, u32>,
    inactive: Vec<DeletedSection>,
    num_records: u32,
}

impl DeletionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the index from the record region of the `del` file.
    pub fn load(records: &[u8], num_records: u32) -> Result<Self> {
        ensure!(
            records.len() as u32 >= num_records * DELETED_SECTION_SIZE,
            "deletion index truncated: {} records claimed, {} bytes present",
            num_records,
            records.len()
        );

        let mut index = Self::new();
        for slot in 0..num_records {
            let start = (slot * DELETED_SECTION_SIZE) as usize;
            let section = DeletedSection::decode(&records[start..])?;
            index.sections.insert(section, slot);
            if !section.active {
                index.inactive.push(section);
            }
        }
        index.num_records = num_records;
        Ok(index)
    }

    pub fn num_records(&self) -> u32 {
        self.num_records
    }

    /// The largest reusable extent, if any extent is active at all.
    pub fn largest_active(&self) -> Option<DeletedSection> {
        self.sections
            .first_key_value()
            .map(|(section, _)| *section)
            .filter(|section| section.active)
    }

    /// Carves `length` bytes from the high end of the best-fitting extent.
    ///
    /// Returns the placement and the record overwrites the caller must stage.
    /// `None` means no active extent fits and the data file tail must grow.
    pub fn allocate(&mut self, length: u32) -> Option<(u16, u32, SmallVec<[SectionRecordWrite; 1]>)> {
        let best = self.largest_active()?;
        if best.length < length {
            return None;
        }

        let slot = self.sections.remove(&best).expect("best extent is present");
        let remaining = best.length - length;
        let placement = (best.file_id, best.offset + remaining);

        let updated = DeletedSection {
            active: remaining > 0,
            length: remaining,
            file_id: best.file_id,
            offset: best.offset,
        };
        self.sections.insert(updated, slot);
        if !updated.active {
            self.inactive.push(updated);
        }

        let mut writes = SmallVec::new();
        writes.push(SectionRecordWrite {
            slot,
            record: updated.encode(),
        });
        Some((placement.0, placement.1, writes))
    }

    /// Registers a freed extent as active, reusing a retired record slot when
    /// one exists.
    pub fn release(&mut self, file_id: u16, offset: u32, length: u32) -> SectionRecordWrite {
        let slot = match self.inactive.pop() {
            Some(retired) => self
                .sections
                .remove(&retired)
                .expect("retired extent is present"),
            None => {
                let slot = self.num_records;
                self.num_records += 1;
                slot
            }
        };

        let section = DeletedSection {
            active: true,
            length,
            file_id,
            offset,
        };
        self.sections.insert(section, slot);
        SectionRecordWrite {
            slot,
            record: section.encode(),
        }
    }

    /// All currently active extents, largest first.
    pub fn active_sections(&self) -> impl Iterator<Item = DeletedSection> + '_ {
        self.sections
            .keys()
            .take_while(|section| section.active)
            .copied()
    }
}
