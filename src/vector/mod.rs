//! Vector indexes — approximate nearest-neighbour search over
//! fixed-dimension `f32` vectors keyed by document id.
//!
//! Two interchangeable variants implement [`AnnIndex`]:
//!
//! - [`BruteForceIndex`] — exact search over a flat row-major array,
//!   `O(n·d)` per query. The baseline, and the recall reference.
//! - [`HnswIndex`] — hierarchical navigable small-world graph with
//!   logarithmic search cost. The default for collections.
//!
//! Both enforce the collection's dimension (wrong-length vectors fail
//! with [`VectorError::DimensionMismatch`] and leave the index
//! unchanged), support lazy removal via tombstone flags that searches
//! skip, and return up to *k* hits sorted by ascending distance.
//! Searching an empty index returns an empty result.
//!
//! Distance is squared L2 by default; cosine distance is available per
//! collection. See [`distance`] for the kernels.
//!
//! # Snapshots
//!
//! An index persists to `db/<database>/<collection>/vec/index.bin`:
//!
//! ```text
//! [magic: u32 "NVEC"][version: u8][kind: u8][metric: u8][dim: u32][body][crc32: u32]
//! ```
//!
//! written atomically (temp + fsync + rename). The CRC covers everything
//! before it. A missing or corrupt snapshot is not fatal — the store
//! rebuilds the index from the documents.

pub mod distance;

mod brute;
mod hnsw;


pub use brute::BruteForceIndex;
pub use hnsw::{HnswIndex, HnswParams};

use std::{
    fs::{self, File},
    io::{self, Write},
    path::Path,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::debug;

use crate::encoding::{Decode, EncodingError};

/// Per-collection subdirectory holding the vector index snapshot.
pub const VEC_DIR: &str = "vec";
/// Snapshot file name.
pub const INDEX_FILE: &str = "index.bin";

const SNAPSHOT_MAGIC: u32 = 0x4E56_4543; // "NVEC"
const SNAPSHOT_VERSION: u8 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by vector index operations.
#[derive(Debug, Error)]
pub enum VectorError {
    /// The vector's length does not match the collection's dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension fixed at collection creation.
        expected: usize,
        /// Length of the offending vector.
        actual: usize,
    },

    /// Encoding / decoding error in a snapshot.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot failed its integrity or header checks.
    #[error("corrupt index snapshot: {0}")]
    CorruptSnapshot(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Common types
// ------------------------------------------------------------------------------------------------

/// Distance metric used by a collection's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Metric {
    /// Squared Euclidean distance (no square root).
    #[default]
    SquaredL2 = 0,
    /// Cosine distance, `1 − cos(a, b)`.
    Cosine = 1,
}

impl TryFrom<u8> for Metric {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0 => Ok(Metric::SquaredL2),
            1 => Ok(Metric::Cosine),
            other => Err(other),
        }
    }
}

/// Which index variant a collection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IndexKind {
    /// Flat exact scan.
    BruteForce = 0,
    /// Navigable small-world graph.
    #[default]
    Hnsw = 1,
}

impl TryFrom<u8> for IndexKind {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0 => Ok(IndexKind::BruteForce),
            1 => Ok(IndexKind::Hnsw),
            other => Err(other),
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// Document id the vector belongs to.
    pub id: String,
    /// Distance to the query under the collection's metric.
    pub distance: f32,
}

/// Contract shared by the index variants.
pub trait AnnIndex: Send + Sync {
    /// Fixed vector dimension.
    fn dim(&self) -> usize;

    /// Which variant this is.
    fn kind(&self) -> IndexKind;

    /// Live (non-tombstoned) vector count.
    fn len(&self) -> usize;

    /// True when no live vector is indexed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indexes a vector under `id`, replacing any previous vector for the
    /// same id. Fails with [`VectorError::DimensionMismatch`] — leaving
    /// the index unchanged — when the length is wrong.
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<(), VectorError>;

    /// Removes `id` (lazy tombstone). Returns false when absent.
    fn remove(&mut self, id: &str) -> bool;

    /// Returns up to `k` nearest live vectors, ascending by distance.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VectorError>;

    /// Metric in use.
    fn metric(&self) -> Metric;

    /// Appends the variant-specific snapshot body to `buf`.
    fn save_body(&self, buf: &mut Vec<u8>) -> Result<(), VectorError>;
}

// ------------------------------------------------------------------------------------------------
// Snapshot I/O
// ------------------------------------------------------------------------------------------------

/// Writes an index snapshot atomically.
pub fn save_index(path: &Path, index: &dyn AnnIndex) -> Result<(), VectorError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
    buf.push(SNAPSHOT_VERSION);
    buf.push(index.kind() as u8);
    buf.push(index.metric() as u8);
    buf.extend_from_slice(&(index.dim() as u32).to_le_bytes());
    index.save_body(&mut buf)?;

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("bin.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }

    debug!(path = %path.display(), vectors = index.len(), "vector index snapshot written");
    Ok(())
}

/// Loads a snapshot, verifying CRC, magic, version, and dimension.
///
/// `params` supplies the runtime HNSW knobs (search breadth is not part
/// of the snapshot).
pub fn load_index(
    path: &Path,
    expected_dim: usize,
    params: &HnswParams,
) -> Result<Box<dyn AnnIndex>, VectorError> {
    let data = fs::read(path)?;
    if data.len() < 15 {
        return Err(VectorError::CorruptSnapshot("snapshot too short".into()));
    }

    let (payload, crc_bytes) = data.split_at(data.len() - 4);
    let stored_crc = u32::from_le_bytes(
        crc_bytes
            .try_into()
            .map_err(|_| VectorError::Internal("split_at produced wrong tail".into()))?,
    );
    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(VectorError::CorruptSnapshot("checksum mismatch".into()));
    }

    let magic = u32::from_le_bytes(
        payload[..4]
            .try_into()
            .map_err(|_| VectorError::Internal("short magic".into()))?,
    );
    if magic != SNAPSHOT_MAGIC {
        return Err(VectorError::CorruptSnapshot(format!(
            "bad magic 0x{magic:08X}"
        )));
    }
    if payload[4] != SNAPSHOT_VERSION {
        return Err(VectorError::CorruptSnapshot(format!(
            "unsupported version {}",
            payload[4]
        )));
    }

    let kind = IndexKind::try_from(payload[5])
        .map_err(|b| VectorError::CorruptSnapshot(format!("unknown index kind {b}")))?;
    let metric = Metric::try_from(payload[6])
        .map_err(|b| VectorError::CorruptSnapshot(format!("unknown metric {b}")))?;
    let dim = u32::from_le_bytes(
        payload[7..11]
            .try_into()
            .map_err(|_| VectorError::Internal("short dim".into()))?,
    ) as usize;
    if dim != expected_dim {
        return Err(VectorError::CorruptSnapshot(format!(
            "snapshot dimension {dim} disagrees with collection dimension {expected_dim}"
        )));
    }

    let body = &payload[11..];
    let index: Box<dyn AnnIndex> = match kind {
        IndexKind::BruteForce => Box::new(BruteForceIndex::load_body(dim, metric, body)?),
        IndexKind::Hnsw => Box::new(HnswIndex::load_body(dim, metric, params, body)?),
    };

    debug!(path = %path.display(), vectors = index.len(), "vector index snapshot loaded");
    Ok(index)
}

/// Creates a fresh, empty index of the requested kind.
pub fn new_index(
    kind: IndexKind,
    dim: usize,
    metric: Metric,
    params: &HnswParams,
) -> Box<dyn AnnIndex> {
    match kind {
        IndexKind::BruteForce => Box::new(BruteForceIndex::new(dim, metric)),
        IndexKind::Hnsw => Box::new(HnswIndex::new(dim, metric, params.clone())),
    }
}

// Shared by the variant snapshot bodies.
pub(crate) fn decode_f32_vec(buf: &[u8]) -> Result<(Vec<f32>, usize), EncodingError> {
    let (count, mut offset) = u32::decode_from(buf)?;
    if count > crate::encoding::MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "f32 vector length {count} exceeds limit"
        )));
    }
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (v, n) = f32::decode_from(&buf[offset..])?;
        offset += n;
        values.push(v);
    }
    Ok((values, offset))
}

pub(crate) fn encode_f32_vec(values: &[f32], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}
