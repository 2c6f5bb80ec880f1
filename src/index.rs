// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RAM index of live records.
//!
//! The index is a vector of `(hash, offset)` pairs sorted by hash. Distinct
//! keys can share a hash, so a hash hit is only a candidate; the caller
//! confirms it by comparing the key stored on flash.

use std::collections::TryReserveError;

/// One live record: the hash of its key and the area-relative offset of its
/// header in the active area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    pub hash: u32,
    pub offset: u32,
}

/// Outcome of [`RamIndex::find`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Lookup {
    /// The key lives at this position.
    Found(usize),
    /// The key is absent; this is where it would be inserted.
    Vacant(usize),
}

#[derive(Debug)]
pub struct RamIndex {
    entries: Vec<IndexEntry>,
    /// Lower bound on how much to grow by when full.
    min_growth: usize,
}

impl RamIndex {
    pub fn new(min_growth: usize) -> Self {
        Self {
            entries: Vec::new(),
            min_growth: min_growth.max(1),
        }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, pos: usize) -> Option<IndexEntry> {
        self.entries.get(pos).copied()
    }

    /// Searches for a key with hash `hash`. Every entry with an equal hash is
    /// offered to `is_match` (by offset) in index order until it says yes.
    ///
    /// A `Vacant` result points past the last entry with an equal hash, so new
    /// colliding keys land after the existing ones.
    pub fn find<E>(
        &self,
        hash: u32,
        mut is_match: impl FnMut(u32) -> Result<bool, E>,
    ) -> Result<Lookup, E> {
        let mut pos = self.entries.partition_point(|e| e.hash < hash);
        while let Some(e) = self.entries.get(pos) {
            if e.hash != hash {
                break;
            }
            if is_match(e.offset)? {
                return Ok(Lookup::Found(pos));
            }
            pos += 1;
        }
        Ok(Lookup::Vacant(pos))
    }

    /// Makes sure there's room for one more entry, doubling if not.
    pub fn grow_capacity(&mut self) -> Result<(), TryReserveError> {
        if self.entries.len() == self.entries.capacity() {
            let extra = self.entries.len().max(self.min_growth);
            self.entries.try_reserve_exact(extra)?;
        }
        Ok(())
    }

    /// Inserts an entry at `pos`, which must come from a `Vacant` lookup.
    pub fn insert_at(&mut self, pos: usize, hash: u32, offset: u32) -> Result<(), TryReserveError> {
        self.grow_capacity()?;
        self.entries.insert(pos, IndexEntry { hash, offset });
        Ok(())
    }

    pub fn remove_at(&mut self, pos: usize) -> IndexEntry {
        self.entries.remove(pos)
    }

    pub fn set_offset(&mut self, pos: usize, offset: u32) {
        self.entries[pos].offset = offset;
    }

    /// Replaces every offset at once, e.g. after records have been moved.
    /// `offsets` must be in index order.
    pub fn relocate(&mut self, offsets: &[u32]) {
        for (e, &offset) in self.entries.iter_mut().zip(offsets) {
            e.offset = offset;
        }
    }
}
