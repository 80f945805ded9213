//! Sorted String Tables — immutable on-disk runs.
//!
//! An SSTable is a closed, sorted file of point entries produced by a
//! memtable flush or a compaction. Each table carries one entry per key
//! (the newest at write time, tombstones included); the engine resolves
//! versions across tables by sequence number.
//!
//! # On-disk layout
//!
//! ```text
//! [DATA_BLOCK]…[DATA_BLOCK][INDEX_BLOCK][PROPS_BLOCK][FOOTER]
//! ```
//!
//! Every block is framed `[len: u32][bytes][crc32: u32]` (little-endian,
//! CRC over the bytes). Data blocks hold a run of self-delimiting cells
//! (`key, seq, kind, value` via [`crate::encoding`]) and are cut at about
//! 4 KiB. The index block is a sparse list of `(first_key, handle)` pairs,
//! one per data block; the properties block carries entry counts, key and
//! sequence ranges, and the table's level. The fixed-size footer points at
//! the index and properties blocks and ends in the format magic.
//!
//! The bloom filter lives in a sibling `.bloom` file (see
//! [`crate::bloom`] for its format); point lookups consult it before
//! touching the table.
//!
//! # Concurrency and lifetime
//!
//! Tables are immutable, so readers share them freely — the engine hands
//! out `Arc<SsTable>` clones. A table obsoleted by compaction is marked
//! via [`SsTable::mark_obsolete`]; the backing files are unlinked when the
//! last reference drops, so in-flight scans keep working.
//!
//! Files are written to a `.tmp` path and renamed into place after fsync;
//! a crash cannot leave a half-written table behind.

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::SstWriter;

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::memtable::TableEntry;
use crate::wal::EntryKind;

pub(crate) const SST_MAGIC: u32 = 0x4E53_5354; // "NSST"
pub(crate) const BLOCK_TARGET_SIZE: usize = 4096;
pub(crate) const BLOCK_FRAME_OVERHEAD: usize = 8; // len + crc
pub(crate) const FOOTER_SIZE: usize = 36; // two handles + magic

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SstableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A block or footer failed its integrity check.
    #[error("corruption in {path}: {detail}")]
    Corruption {
        /// File the corruption was detected in.
        path: PathBuf,
        /// What failed.
        detail: String,
    },

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Formats the file name of a run: `L<level>-<id>.sst`.
pub fn run_file_name(level: u32, id: u64) -> String {
    format!("L{level}-{id}.sst")
}

/// Parses `L<level>-<id>.sst` back into `(level, id)`.
pub fn parse_run_file_name(name: &str) -> Option<(u32, u64)> {
    let stem = name.strip_suffix(".sst")?.strip_prefix('L')?;
    let (level, id) = stem.split_once('-')?;
    Some((level.parse().ok()?, id.parse().ok()?))
}

/// Path of the bloom sidecar belonging to an `.sst` path.
pub fn bloom_sidecar_path(sst_path: &Path) -> PathBuf {
    sst_path.with_extension("bloom")
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Offset and framed size of a block within the file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { offset, size }, off))
    }
}

/// Sparse index entry: the first key of a data block and its handle.
#[derive(Debug)]
pub(crate) struct IndexEntry {
    pub(crate) first_key: Vec<u8>,
    pub(crate) handle: BlockHandle,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_key.encode_to(buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (first_key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { first_key, handle }, off))
    }
}

/// Table-level metadata stored in the properties block.
#[derive(Debug, Clone)]
pub struct SstProperties {
    /// Number of cells (tombstones included).
    pub entry_count: u64,
    /// Number of tombstone cells.
    pub tombstone_count: u64,
    /// Smallest key in the table.
    pub min_key: Vec<u8>,
    /// Largest key in the table.
    pub max_key: Vec<u8>,
    /// Lowest sequence number present.
    pub min_seq: u64,
    /// Highest sequence number present.
    pub max_seq: u64,
    /// LSM level this run was written to.
    pub level: u32,
}

impl Encode for SstProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.entry_count.encode_to(buf)?;
        self.tombstone_count.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.min_seq.encode_to(buf)?;
        self.max_seq.encode_to(buf)?;
        self.level.encode_to(buf)
    }
}

impl Decode for SstProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (entry_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (tombstone_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (min_key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (max_key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (min_seq, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (max_seq, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (level, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                entry_count,
                tombstone_count,
                min_key,
                max_key,
                min_seq,
                max_seq,
                level,
            },
            off,
        ))
    }
}

/// One point entry within a data block.
#[derive(Debug)]
pub(crate) struct SstCell {
    pub(crate) key: Vec<u8>,
    pub(crate) seq: u64,
    pub(crate) kind: EntryKind,
    pub(crate) value: Vec<u8>,
}

impl Encode for SstCell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.seq.encode_to(buf)?;
        (self.kind as u8).encode_to(buf)?;
        self.value.encode_to(buf)
    }
}

impl Decode for SstCell {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (seq, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (kind_byte, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let kind = EntryKind::try_from(kind_byte).map_err(|tag| EncodingError::InvalidTag {
            tag: tag as u32,
            type_name: "EntryKind",
        })?;
        let (value, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                key,
                seq,
                kind,
                value,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SSTable — immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable sorted run. See the [module docs](self).
pub struct SsTable {
    /// Path of the `.sst` file.
    pub path: PathBuf,

    /// Id parsed from the file name.
    pub file_id: u64,

    mmap: Mmap,
    bloom: Option<BloomFilter>,

    /// Table metadata.
    pub props: SstProperties,

    index: Vec<IndexEntry>,
    file_size: u64,
    suspect: AtomicBool,
    obsolete: AtomicBool,
}

impl SsTable {
    /// Opens a table, verifying footer magic and block checksums for the
    /// index and properties blocks.
    ///
    /// A missing or unreadable bloom sidecar downgrades to "no filter"
    /// (every lookup probes the table) rather than failing the open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstableError> {
        let path = path.as_ref().to_path_buf();

        let file_id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_run_file_name)
            .map(|(_, id)| id)
            .ok_or_else(|| SstableError::Internal(format!("bad run file name: {path:?}")))?;

        let file = File::open(&path)?;
        // Immutable after rename-into-place and read-only mapped; block
        // bounds are validated before any slice.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FOOTER_SIZE {
            return Err(SstableError::Corruption {
                path,
                detail: "file shorter than footer".into(),
            });
        }

        let footer = &mmap[mmap.len() - FOOTER_SIZE..];
        let (index_handle, n1) = BlockHandle::decode_from(footer)?;
        let (props_handle, n2) = BlockHandle::decode_from(&footer[n1..])?;
        let (magic, _) = u32::decode_from(&footer[n1 + n2..])?;
        if magic != SST_MAGIC {
            return Err(SstableError::Corruption {
                path,
                detail: format!("bad footer magic 0x{magic:08X}"),
            });
        }

        let index_bytes = read_block(&mmap, index_handle, &path)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(&index_bytes)?;

        let props_bytes = read_block(&mmap, props_handle, &path)?;
        let (props, _) = SstProperties::decode_from(&props_bytes)?;

        let bloom = match fs::read(bloom_sidecar_path(&path)) {
            Ok(bytes) => match BloomFilter::from_bytes(&bytes) {
                Ok(filter) => Some(filter),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "bloom sidecar unreadable; lookups will probe the table");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "bloom sidecar missing; lookups will probe the table");
                None
            }
        };

        let file_size = mmap.len() as u64;
        Ok(Self {
            path,
            file_id,
            mmap,
            bloom,
            props,
            index,
            file_size,
            suspect: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
        })
    }

    /// On-disk size of the `.sst` file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bloom + key-range gate: false means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if key < self.props.min_key.as_slice() || key > self.props.max_key.as_slice() {
            return false;
        }
        match &self.bloom {
            Some(filter) => filter.contains(key),
            None => true,
        }
    }

    /// True when the table's key range `[min_key, max_key]` intersects the
    /// half-open query range `[start, end)`.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.props.max_key.as_slice() >= start && self.props.min_key.as_slice() < end
    }

    /// Looks up the entry stored for `key` in this table alone.
    ///
    /// Returns the highest-sequence cell when the builder wrote several
    /// (possible after merging runs with duplicate keys).
    pub fn get(&self, key: &[u8]) -> Result<Option<TableEntry>, SstableError> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        if self.index.is_empty() {
            return Ok(None);
        }

        let block_idx = self.block_for_key(key);
        let cells = self.decode_block(block_idx)?;

        let mut best: Option<TableEntry> = None;
        for cell in cells {
            if cell.key.as_slice() > key {
                break;
            }
            if cell.key == key
                && best.as_ref().is_none_or(|b| cell.seq > b.seq)
            {
                best = Some(TableEntry {
                    seq: cell.seq,
                    kind: cell.kind,
                    value: cell.value,
                });
            }
        }
        Ok(best)
    }

    /// Streams entries with keys in `[start, end)`, ascending.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> ScanIter<'_> {
        let start_block = if self.index.is_empty() {
            0
        } else {
            self.block_for_key(start)
        };
        ScanIter {
            table: self,
            next_block: start_block,
            pending: std::collections::VecDeque::new(),
            start: start.to_vec(),
            end: Some(end.to_vec()),
            done: self.index.is_empty(),
        }
    }

    /// Streams every entry in the table, ascending.
    pub fn scan_all(&self) -> ScanIter<'_> {
        ScanIter {
            table: self,
            next_block: 0,
            pending: std::collections::VecDeque::new(),
            start: Vec::new(),
            end: None,
            done: self.index.is_empty(),
        }
    }

    /// Flags the table after a checksum failure; the engine skips suspect
    /// tables where a redundant copy can serve the read.
    pub fn mark_suspect(&self) {
        self.suspect.store(true, Ordering::Release);
    }

    /// True once a read hit corruption in this table.
    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::Acquire)
    }

    /// Schedules the backing files for deletion when the last shared
    /// reference drops (used after compaction consumes this run).
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    fn block_for_key(&self, key: &[u8]) -> usize {
        match self
            .index
            .binary_search_by(|entry| entry.first_key.as_slice().cmp(key))
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    fn decode_block(&self, block_idx: usize) -> Result<Vec<SstCell>, SstableError> {
        let handle = self.index[block_idx].handle;
        let bytes = read_block(&self.mmap, handle, &self.path)?;

        let mut cells = Vec::new();
        let mut off = 0;
        while off < bytes.len() {
            let (cell, n) = SstCell::decode_from(&bytes[off..])?;
            off += n;
            cells.push(cell);
        }
        Ok(cells)
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("path", &self.path)
            .field("level", &self.props.level)
            .field("entries", &self.props.entry_count)
            .finish_non_exhaustive()
    }
}

impl Drop for SsTable {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            debug!(path = %self.path.display(), "removing obsolete run");
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove obsolete run");
            }
            let bloom = bloom_sidecar_path(&self.path);
            if let Err(e) = fs::remove_file(&bloom) {
                warn!(path = %bloom.display(), error = %e, "failed to remove obsolete bloom sidecar");
            }
        }
    }
}

/// Ascending scan over one table. Decodes one data block at a time.
pub struct ScanIter<'a> {
    table: &'a SsTable,
    next_block: usize,
    pending: std::collections::VecDeque<(Vec<u8>, TableEntry)>,
    start: Vec<u8>,
    end: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for ScanIter<'_> {
    type Item = Result<(Vec<u8>, TableEntry), SstableError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, entry)) = self.pending.pop_front() {
                return Some(Ok((key, entry)));
            }
            if self.done || self.next_block >= self.table.index.len() {
                return None;
            }

            let block_idx = self.next_block;
            self.next_block += 1;

            let cells = match self.table.decode_block(block_idx) {
                Ok(cells) => cells,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            for cell in cells {
                if cell.key.as_slice() < self.start.as_slice() {
                    continue;
                }
                if let Some(end) = &self.end
                    && cell.key.as_slice() >= end.as_slice()
                {
                    self.done = true;
                    break;
                }
                self.pending.push_back((
                    cell.key,
                    TableEntry {
                        seq: cell.seq,
                        kind: cell.kind,
                        value: cell.value,
                    },
                ));
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O
// ------------------------------------------------------------------------------------------------

/// Reads a framed block `[len][bytes][crc]` and verifies its checksum.
pub(crate) fn read_block(
    mmap: &Mmap,
    handle: BlockHandle,
    path: &Path,
) -> Result<Vec<u8>, SstableError> {
    let start = usize::try_from(handle.offset)
        .map_err(|_| SstableError::Internal("block offset out of range".into()))?;
    let size = usize::try_from(handle.size)
        .map_err(|_| SstableError::Internal("block size out of range".into()))?;

    if size < BLOCK_FRAME_OVERHEAD || start + size > mmap.len() {
        return Err(SstableError::Corruption {
            path: path.to_path_buf(),
            detail: "block handle out of bounds".into(),
        });
    }

    let len_bytes: [u8; 4] = mmap[start..start + 4]
        .try_into()
        .map_err(|_| SstableError::Internal("short block length".into()))?;
    let content_len = u32::from_le_bytes(len_bytes) as usize;
    if content_len + BLOCK_FRAME_OVERHEAD != size {
        return Err(SstableError::Corruption {
            path: path.to_path_buf(),
            detail: "block length disagrees with handle".into(),
        });
    }

    let content = &mmap[start + 4..start + 4 + content_len];

    let crc_bytes: [u8; 4] = mmap[start + 4 + content_len..start + size]
        .try_into()
        .map_err(|_| SstableError::Internal("short block checksum".into()))?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Crc32::new();
    hasher.update(content);
    if hasher.finalize() != stored_crc {
        return Err(SstableError::Corruption {
            path: path.to_path_buf(),
            detail: "block checksum mismatch".into(),
        });
    }

    Ok(content.to_vec())
}
