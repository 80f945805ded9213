use std::path::{Path, PathBuf};

use crate::memtable::TableEntry;
use crate::sstable::{SsTable, SstWriter, run_file_name};
use crate::wal::EntryKind;

/// Builds a run at level 0 from `(key, seq, value)` triples; a `None`
/// value writes a tombstone.
pub fn build_table(
    dir: &Path,
    id: u64,
    rows: &[(&[u8], u64, Option<&[u8]>)],
) -> (PathBuf, SsTable) {
    let path = dir.join(run_file_name(0, id));
    let entries: Vec<(Vec<u8>, TableEntry)> = rows
        .iter()
        .map(|&(key, seq, value)| {
            (
                key.to_vec(),
                TableEntry {
                    seq,
                    kind: if value.is_some() {
                        EntryKind::Put
                    } else {
                        EntryKind::Delete
                    },
                    value: value.map(|v| v.to_vec()).unwrap_or_default(),
                },
            )
        })
        .collect();

    SstWriter::new(&path)
        .build(0, 0.01, entries.len(), entries.into_iter())
        .expect("build");
    let table = SsTable::open(&path).expect("open");
    (path, table)
}

/// `num` sequential rows `key_0000…` with small values.
pub fn sequential_rows(num: usize) -> Vec<(Vec<u8>, TableEntry)> {
    (0..num)
        .map(|i| {
            (
                format!("key_{i:06}").into_bytes(),
                TableEntry {
                    seq: i as u64 + 1,
                    kind: EntryKind::Put,
                    value: format!("value_{i:06}").into_bytes(),
                },
            )
        })
        .collect()
}
