//! In-memory sorted write buffer.
//!
//! The memtable holds the most recent mutation per record key — later
//! writes overwrite earlier ones, so a key appears at most once. Deletes
//! are kept as tombstones so they can mask older versions living in
//! SSTables below.
//!
//! Size is tracked in approximate bytes; when the engine sees the budget
//! exceeded it seals the table into a [`FrozenMemtable`] (paired with its
//! WAL segment) and installs a fresh one. A frozen table serves reads until
//! its flush to an SSTable completes.
//!
//! The memtable itself is not synchronized — the engine guards it, taking
//! a read lock for lookups and a write lock for mutations.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::wal::{EntryKind, WalEntry};

/// The newest mutation recorded for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    /// Sequence number of the mutation.
    pub seq: u64,
    /// Put or Delete (tombstone).
    pub kind: EntryKind,
    /// Value bytes; empty for tombstones.
    pub value: Vec<u8>,
}

impl TableEntry {
    /// True when this entry masks the key rather than storing a value.
    pub fn is_tombstone(&self) -> bool {
        self.kind == EntryKind::Delete
    }
}

/// Sorted map from record key to its latest [`TableEntry`].
#[derive(Debug, Default)]
pub struct Memtable {
    tree: BTreeMap<Vec<u8>, TableEntry>,
    approximate_bytes: usize,
    max_seq: u64,
}

impl Memtable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one mutation, overwriting any previous entry for the key.
    ///
    /// Out-of-order replays are tolerated: an entry older than what the
    /// table already holds for the key is ignored.
    pub fn apply(&mut self, entry: WalEntry) {
        let WalEntry {
            seq,
            kind,
            key,
            value,
        } = entry;

        if let Some(existing) = self.tree.get(&key)
            && existing.seq >= seq
        {
            return;
        }

        self.max_seq = self.max_seq.max(seq);

        let new_size = entry_overhead(&key, &value);
        let old_size = self
            .tree
            .insert(key.clone(), TableEntry { seq, kind, value })
            .map(|old| entry_overhead(&key, &old.value))
            .unwrap_or(0);

        self.approximate_bytes = self.approximate_bytes + new_size - old_size;
    }

    /// Returns the latest entry for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<&TableEntry> {
        self.tree.get(key)
    }

    /// Iterates entries with keys in `[start, end)`, ascending.
    pub fn range<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a TableEntry)> {
        self.tree.range::<[u8], _>((
            Bound::Included(start),
            Bound::Excluded(end),
        ))
    }

    /// Iterates every entry in key order, tombstones included. This is the
    /// stream an SSTable flush consumes.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &TableEntry)> {
        self.tree.iter()
    }

    /// Approximate in-memory footprint in bytes.
    pub fn approximate_bytes(&self) -> usize {
        self.approximate_bytes
    }

    /// Number of distinct keys (tombstones included).
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True when no entry has been applied.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Highest sequence number applied so far.
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    /// Seals this table for flushing, recording the WAL segment that holds
    /// its entries.
    pub fn freeze(self, wal_segment: u64) -> FrozenMemtable {
        FrozenMemtable {
            table: self,
            wal_segment,
        }
    }
}

/// A sealed, read-only memtable awaiting flush.
#[derive(Debug)]
pub struct FrozenMemtable {
    /// The sealed table.
    pub table: Memtable,
    /// Id of the sealed WAL segment covering these entries; reclaimable
    /// once the flush is durable.
    pub wal_segment: u64,
}

impl FrozenMemtable {
    /// Latest entry for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<&TableEntry> {
        self.table.get(key)
    }
}

fn entry_overhead(key: &[u8], value: &[u8]) -> usize {
    std::mem::size_of::<TableEntry>() + key.len() + value.len()
}
