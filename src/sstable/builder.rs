//! SSTable writer — builds a run and its bloom sidecar from a sorted
//! entry stream.
//!
//! # Input requirements
//!
//! Entries must arrive **sorted by key, strictly ascending** — at most one
//! entry per key, the caller (memtable flush or compaction merge) having
//! already collapsed versions. Tombstones are stored like any other entry.
//!
//! # Atomicity
//!
//! Both files are written to `.tmp` paths, fsynced, then renamed into
//! place, bloom sidecar first so a visible `.sst` always has its filter.
//! The parent directory is fsynced after the renames. A crash mid-build
//! leaves only `.tmp` litter, which the engine sweeps on open.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Seek, Write},
    mem,
    path::{Path, PathBuf},
};

use crc32fast::Hasher as Crc32;
use tracing::debug;

use crate::bloom::BloomFilter;
use crate::encoding::{self, Encode};
use crate::memtable::TableEntry;
use crate::wal::EntryKind;

use super::{
    BLOCK_TARGET_SIZE, BlockHandle, IndexEntry, SST_MAGIC, SstCell, SstProperties, SstableError,
    bloom_sidecar_path,
};

/// Builds one SSTable file plus its `.bloom` sidecar.
pub struct SstWriter {
    path: PathBuf,
}

impl SstWriter {
    /// Creates a writer targeting the given `.sst` path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Consumes a sorted entry stream and writes the complete run.
    ///
    /// `expected_count` sizes the bloom filter; `level` is recorded in the
    /// properties block. Building from an empty stream is an error — the
    /// engine never schedules one.
    pub fn build(
        self,
        level: u32,
        bloom_fp_rate: f64,
        expected_count: usize,
        entries: impl Iterator<Item = (Vec<u8>, TableEntry)>,
    ) -> Result<(), SstableError> {
        let tmp_path = self.path.with_extension("sst.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        let mut bloom = BloomFilter::with_rate(expected_count, bloom_fp_rate);
        let mut stats = BuildStats::new(level);
        let mut index: Vec<IndexEntry> = Vec::new();

        let mut current_block = Vec::<u8>::new();
        let mut block_first_key: Option<Vec<u8>> = None;

        for (key, entry) in entries {
            stats.track(&key, &entry);
            bloom.add(&key);

            if block_first_key.is_none() {
                block_first_key = Some(key.clone());
            }

            let cell = SstCell {
                key,
                seq: entry.seq,
                kind: entry.kind,
                value: entry.value,
            };
            cell.encode_to(&mut current_block)?;

            if current_block.len() >= BLOCK_TARGET_SIZE {
                flush_data_block(&mut writer, &mut current_block, &mut block_first_key, &mut index)?;
            }
        }

        if !current_block.is_empty() {
            flush_data_block(&mut writer, &mut current_block, &mut block_first_key, &mut index)?;
        }

        if stats.entry_count == 0 {
            drop(writer);
            let _ = fs::remove_file(&tmp_path);
            return Err(SstableError::Internal(
                "refusing to build an empty SSTable".into(),
            ));
        }

        // Index block.
        let mut index_bytes = Vec::new();
        encoding::encode_vec(&index, &mut index_bytes)?;
        let index_handle = write_framed_block(&mut writer, &index_bytes)?;

        // Properties block.
        let props = stats.into_properties();
        let props_bytes = encoding::encode_to_vec(&props)?;
        let props_handle = write_framed_block(&mut writer, &props_bytes)?;

        // Footer.
        let mut footer = Vec::with_capacity(super::FOOTER_SIZE);
        index_handle.encode_to(&mut footer)?;
        props_handle.encode_to(&mut footer)?;
        SST_MAGIC.encode_to(&mut footer)?;
        writer.write_all(&footer)?;

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| SstableError::Internal(format!("buffered writer: {e}")))?;
        file.sync_all()?;

        // Bloom sidecar, then both renames: sidecar first so a visible
        // .sst never lacks its filter.
        let bloom_path = bloom_sidecar_path(&self.path);
        let bloom_tmp = bloom_path.with_extension("bloom.tmp");
        {
            let mut bloom_file = File::create(&bloom_tmp)?;
            bloom_file.write_all(&bloom.to_bytes())?;
            bloom_file.sync_all()?;
        }
        fs::rename(&bloom_tmp, &bloom_path)?;
        fs::rename(&tmp_path, &self.path)?;

        if let Some(dir) = self.path.parent() {
            File::open(dir)?.sync_all()?;
        }

        debug!(
            path = %self.path.display(),
            entries = props.entry_count,
            blocks = index.len(),
            level,
            "SSTable built"
        );
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Build helpers
// ------------------------------------------------------------------------------------------------

/// Accumulates properties while the entry stream is consumed.
struct BuildStats {
    entry_count: u64,
    tombstone_count: u64,
    min_key: Option<Vec<u8>>,
    max_key: Vec<u8>,
    min_seq: u64,
    max_seq: u64,
    level: u32,
}

impl BuildStats {
    fn new(level: u32) -> Self {
        Self {
            entry_count: 0,
            tombstone_count: 0,
            min_key: None,
            max_key: Vec::new(),
            min_seq: u64::MAX,
            max_seq: 0,
            level,
        }
    }

    fn track(&mut self, key: &[u8], entry: &TableEntry) {
        self.entry_count += 1;
        if entry.kind == EntryKind::Delete {
            self.tombstone_count += 1;
        }
        self.min_seq = self.min_seq.min(entry.seq);
        self.max_seq = self.max_seq.max(entry.seq);

        // Sorted input: first key is min, last key is max.
        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.max_key = key.to_vec();
    }

    fn into_properties(self) -> SstProperties {
        SstProperties {
            entry_count: self.entry_count,
            tombstone_count: self.tombstone_count,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key,
            min_seq: self.min_seq,
            max_seq: self.max_seq,
            level: self.level,
        }
    }
}

/// Writes `[len][data][crc]` at the current position, returning the handle.
fn write_framed_block(
    writer: &mut (impl Write + Seek),
    data: &[u8],
) -> Result<BlockHandle, SstableError> {
    let offset = writer.stream_position()?;

    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();

    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&crc.to_le_bytes())?;

    Ok(BlockHandle {
        offset,
        size: (data.len() + super::BLOCK_FRAME_OVERHEAD) as u64,
    })
}

fn flush_data_block(
    writer: &mut (impl Write + Seek),
    current_block: &mut Vec<u8>,
    block_first_key: &mut Option<Vec<u8>>,
    index: &mut Vec<IndexEntry>,
) -> Result<(), SstableError> {
    let data = mem::take(current_block);
    let handle = write_framed_block(writer, &data)?;

    let first_key = block_first_key
        .take()
        .ok_or_else(|| SstableError::Internal("data block without a first key".into()))?;
    index.push(IndexEntry {
        first_key,
        handle,
    });
    Ok(())
}
