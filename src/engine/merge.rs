//! Bounded k-way merge of sorted entry streams.
//!
//! Sources (active memtable, frozen memtables, SSTable scans) each yield
//! `(key, entry)` pairs in ascending key order. The merge interleaves them
//! into a single stream ordered by **key ascending, then sequence
//! descending** — so for any key, the first pair out is the authoritative
//! version and everything after it for the same key is shadowed history.
//!
//! The heap holds one pending pair per source, so memory is bounded by the
//! number of sources, not by the data; a limit-bounded scan stops pulling
//! as soon as it has its rows.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::memtable::TableEntry;
use crate::sstable::SstableError;

/// One sorted input stream.
pub type MergeSource<'a> =
    Box<dyn Iterator<Item = Result<(Vec<u8>, TableEntry), SstableError>> + 'a>;

struct HeapItem {
    key: Vec<u8>,
    entry: TableEntry,
    source: usize,
}

// Max-heap: smaller key = greater priority; among equal keys, higher
// sequence = greater priority.
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.entry.seq == other.entry.seq
    }
}

impl Eq for HeapItem {}

/// Merging iterator over any number of sorted sources.
pub struct MergeIter<'a> {
    sources: Vec<MergeSource<'a>>,
    heap: BinaryHeap<HeapItem>,
    failed: Option<SstableError>,
}

impl<'a> MergeIter<'a> {
    /// Builds the merge, pulling the first pair from every source.
    pub fn new(mut sources: Vec<MergeSource<'a>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut failed = None;

        for (idx, source) in sources.iter_mut().enumerate() {
            match source.next() {
                Some(Ok((key, entry))) => heap.push(HeapItem {
                    key,
                    entry,
                    source: idx,
                }),
                Some(Err(e)) => {
                    failed = Some(e);
                    break;
                }
                None => {}
            }
        }

        Self {
            sources,
            heap,
            failed,
        }
    }
}

impl Iterator for MergeIter<'_> {
    type Item = Result<(Vec<u8>, TableEntry), SstableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.failed.take() {
            self.heap.clear();
            return Some(Err(e));
        }

        let top = self.heap.pop()?;

        match self.sources[top.source].next() {
            Some(Ok((key, entry))) => self.heap.push(HeapItem {
                key,
                entry,
                source: top.source,
            }),
            Some(Err(e)) => self.failed = Some(e),
            None => {}
        }

        Some(Ok((top.key, top.entry)))
    }
}

/// Collapses a merged stream to visible rows: one entry per key (the
/// first, i.e. newest), tombstones dropped.
pub struct VisibleRows<'a> {
    merge: MergeIter<'a>,
    last_key: Option<Vec<u8>>,
}

impl<'a> VisibleRows<'a> {
    /// Wraps a merge stream.
    pub fn new(merge: MergeIter<'a>) -> Self {
        Self {
            merge,
            last_key: None,
        }
    }
}

impl Iterator for VisibleRows<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), SstableError>;

    fn next(&mut self) -> Option<Self::Item> {
        for item in self.merge.by_ref() {
            let (key, entry) = match item {
                Ok(pair) => pair,
                Err(e) => return Some(Err(e)),
            };

            if self.last_key.as_deref() == Some(key.as_slice()) {
                continue; // shadowed older version
            }
            self.last_key = Some(key.clone());

            if entry.is_tombstone() {
                continue;
            }
            return Some(Ok((key, entry.value)));
        }
        None
    }
}
