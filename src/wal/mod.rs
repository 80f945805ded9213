//! Write-Ahead Log with group commit.
//!
//! Every mutation is appended here before it becomes visible in the
//! memtable. Appends are **buffered**: the caller gets its sequence number
//! back immediately, and a dedicated flusher thread writes and fsyncs the
//! buffer when either
//!
//! - the pending entry count reaches `batch_size`, or
//! - the oldest buffered entry is `flush_interval` old.
//!
//! Batching converts N fsyncs into one — the dominant write cost — at the
//! price of a bounded data-loss window on crash equal to `flush_interval`.
//! Callers that need durability *now* use [`Wal::sync`].
//!
//! # On-disk layout
//!
//! Segments live under `<data_dir>/wal/` as `000001.log`, `000002.log`, …
//! Each segment is a flat run of frames (all integers little-endian):
//!
//! ```text
//! [len: u32][crc: u32][seq: u64][kind: u8][key_len: u32][key][value_len: u32][value]
//! ```
//!
//! `len` counts everything after `crc`; `crc` is CRC32 over the same span.
//!
//! # Recovery
//!
//! On open, segments are scanned in order and every frame's CRC verified.
//! A short read or checksum mismatch is treated as the crash tail: the
//! segment is truncated back to the last good frame boundary and replay
//! continues. The highest sequence seen seeds the engine's global counter.
//!
//! # Rotation
//!
//! The engine rotates to a fresh segment whenever it freezes a memtable,
//! so each frozen memtable owns a whole number of segments. Once a frozen
//! memtable is durably flushed to an SSTable, its segments are deleted via
//! [`Wal::remove_segments_through`].
//!
//! # Failure
//!
//! A write or fsync error on the append path marks the log **degraded**;
//! every subsequent append fails fast with [`WalError::Degraded`] until the
//! process restarts. Reads are unaffected.

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crc32fast::Hasher as Crc32;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Subdirectory of the data dir holding WAL segments.
pub const WAL_DIR: &str = "wal";

const FRAME_HEADER_SIZE: usize = 8; // len + crc
const FRAME_BODY_MIN: usize = 8 + 1 + 4 + 4; // seq + kind + two length prefixes
const MAX_FRAME_BODY: u32 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The log previously hit an I/O error and refuses further appends.
    #[error("write-ahead log is degraded; restart required")]
    Degraded,

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Entries
// ------------------------------------------------------------------------------------------------

/// Kind tag of a logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Insert or replace a key.
    Put = 0,
    /// Tombstone masking all older versions of a key.
    Delete = 1,
}

impl TryFrom<u8> for EntryKind {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0 => Ok(EntryKind::Put),
            1 => Ok(EntryKind::Delete),
            other => Err(other),
        }
    }
}

/// A mutation recovered from (or destined for) the log.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    /// Globally monotonic sequence number, assigned at append.
    pub seq: u64,
    /// Put or Delete.
    pub kind: EntryKind,
    /// Record key.
    pub key: Vec<u8>,
    /// Value bytes; empty for a delete.
    pub value: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// WAL core
// ------------------------------------------------------------------------------------------------

enum FlusherMsg {
    Kick,
    Shutdown,
}

struct WalState {
    /// Active segment file handle (append mode).
    file: File,

    /// Active segment id (the `NNNNNN` in the file name).
    segment_id: u64,

    /// Encoded frames not yet written to the file.
    buffer: Vec<u8>,

    /// Number of entries currently buffered.
    pending: usize,

    /// When the oldest buffered entry was appended.
    first_buffered_at: Option<Instant>,

    /// Next sequence number to hand out.
    next_seq: u64,
}

struct WalShared {
    dir: PathBuf,
    batch_size: usize,
    flush_interval: Duration,
    state: Mutex<WalState>,
    degraded: AtomicBool,
}

/// Group-commit write-ahead log. See the [module docs](self).
pub struct Wal {
    shared: Arc<WalShared>,
    kick_tx: Sender<FlusherMsg>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Opens the log under `<data_dir>/wal/`, replaying any existing
    /// segments.
    ///
    /// Returns the handle plus every recovered entry in sequence order.
    /// Corrupt tails are truncated in place (crash recovery); the global
    /// sequence counter resumes past the highest recovered sequence.
    pub fn open(
        data_dir: impl AsRef<Path>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Result<(Self, Vec<WalEntry>), WalError> {
        let dir = data_dir.as_ref().join(WAL_DIR);
        fs::create_dir_all(&dir)?;

        let mut segment_ids = list_segments(&dir)?;
        segment_ids.sort_unstable();

        let mut recovered = Vec::new();
        let mut max_seq = 0u64;
        for &id in &segment_ids {
            let entries = replay_segment(&segment_path(&dir, id))?;
            for entry in entries {
                max_seq = max_seq.max(entry.seq);
                recovered.push(entry);
            }
        }
        recovered.sort_by_key(|e| e.seq);

        let segment_id = segment_ids.last().copied().unwrap_or(0).max(1);
        let file = open_segment(&dir, segment_id)?;

        info!(
            segments = segment_ids.len(),
            recovered = recovered.len(),
            next_seq = max_seq + 1,
            "WAL opened"
        );

        let shared = Arc::new(WalShared {
            dir,
            batch_size: batch_size.max(1),
            flush_interval,
            state: Mutex::new(WalState {
                file,
                segment_id,
                buffer: Vec::new(),
                pending: 0,
                first_buffered_at: None,
                next_seq: max_seq + 1,
            }),
            degraded: AtomicBool::new(false),
        });

        let (kick_tx, kick_rx) = unbounded();
        let flusher = spawn_flusher(Arc::clone(&shared), kick_rx)?;

        Ok((
            Self {
                shared,
                kick_tx,
                flusher: Mutex::new(Some(flusher)),
            },
            recovered,
        ))
    }

    /// Appends one mutation and returns its sequence number.
    ///
    /// The entry is buffered; it becomes durable at the next group commit.
    pub fn append(&self, kind: EntryKind, key: &[u8], value: &[u8]) -> Result<u64, WalError> {
        let (first, _) = self.append_all(&[(kind, key, value)])?;
        Ok(first)
    }

    /// Appends a batch of mutations under one lock acquisition, assigning
    /// contiguous sequence numbers.
    ///
    /// Frames land in the buffer back-to-back, so a crash can only lose a
    /// contiguous suffix: what survives is always a prefix of the batch.
    ///
    /// Returns the `(first, last)` assigned sequence numbers.
    pub fn append_all(
        &self,
        ops: &[(EntryKind, &[u8], &[u8])],
    ) -> Result<(u64, u64), WalError> {
        if self.shared.degraded.load(Ordering::Acquire) {
            return Err(WalError::Degraded);
        }
        if ops.is_empty() {
            return Err(WalError::Internal("empty append batch".into()));
        }

        let (do_kick, range) = {
            let mut state = lock_state(&self.shared)?;

            let first = state.next_seq;
            for &(kind, key, value) in ops {
                let seq = state.next_seq;
                state.next_seq += 1;
                encode_frame(&mut state.buffer, seq, kind, key, value);
            }
            state.pending += ops.len();
            if state.first_buffered_at.is_none() {
                state.first_buffered_at = Some(Instant::now());
            }

            trace!(
                first,
                count = ops.len(),
                pending = state.pending,
                "WAL entries buffered"
            );

            let last = state.next_seq - 1;
            (state.pending >= self.shared.batch_size, (first, last))
        };

        if do_kick {
            // Flusher gone is not fatal here; sync() still works.
            let _ = self.kick_tx.send(FlusherMsg::Kick);
        }
        Ok(range)
    }

    /// Forces every buffered entry to disk and fsyncs.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut state = lock_state(&self.shared)?;
        flush_locked(&self.shared, &mut state)
    }

    /// Finishes the active segment (flush + fsync) and starts a new one.
    ///
    /// Returns the id of the segment that was just sealed.
    pub fn rotate(&self) -> Result<u64, WalError> {
        let mut state = lock_state(&self.shared)?;
        flush_locked(&self.shared, &mut state)?;

        let sealed = state.segment_id;
        let next = sealed + 1;
        state.file = open_segment(&self.shared.dir, next)?;
        state.segment_id = next;

        debug!(sealed, next, "WAL rotated");
        Ok(sealed)
    }

    /// Deletes every sealed segment with id ≤ `through`.
    ///
    /// Called once a flush has made the covered entries durable in an
    /// SSTable. The active segment is never removed.
    pub fn remove_segments_through(&self, through: u64) -> Result<(), WalError> {
        let active = lock_state(&self.shared)?.segment_id;

        for id in list_segments(&self.shared.dir)? {
            if id <= through && id != active {
                let path = segment_path(&self.shared.dir, id);
                fs::remove_file(&path)?;
                debug!(segment = id, "WAL segment removed");
            }
        }
        // Make the unlink durable before the caller forgets the data
        // existed anywhere else.
        File::open(&self.shared.dir)?.sync_all()?;
        Ok(())
    }

    /// Highest sequence number assigned so far (0 before the first append).
    pub fn last_seq(&self) -> u64 {
        self.shared
            .state
            .lock()
            .map(|s| s.next_seq.saturating_sub(1))
            .unwrap_or(0)
    }

    /// True once an append-path I/O error has poisoned the log.
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Acquire)
    }

    /// Flushes outstanding entries and stops the flusher thread.
    pub fn close(&self) -> Result<(), WalError> {
        let _ = self.kick_tx.send(FlusherMsg::Shutdown);
        if let Some(handle) = self
            .flusher
            .lock()
            .map_err(|_| WalError::Internal("flusher handle lock poisoned".into()))?
            .take()
        {
            let _ = handle.join();
        }
        self.sync()
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.kick_tx.send(FlusherMsg::Shutdown);
        if let Ok(mut guard) = self.flusher.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }
        if let Ok(mut state) = self.shared.state.lock()
            && let Err(e) = flush_locked(&self.shared, &mut state)
        {
            error!(error = %e, "WAL sync failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Flusher thread
// ------------------------------------------------------------------------------------------------

fn spawn_flusher(
    shared: Arc<WalShared>,
    rx: Receiver<FlusherMsg>,
) -> Result<JoinHandle<()>, WalError> {
    std::thread::Builder::new()
        .name("nexadb-wal-flush".into())
        .spawn(move || flusher_loop(&shared, &rx))
        .map_err(WalError::Io)
}

fn flusher_loop(shared: &WalShared, rx: &Receiver<FlusherMsg>) {
    loop {
        match rx.recv_timeout(shared.flush_interval) {
            Ok(FlusherMsg::Kick) | Err(RecvTimeoutError::Timeout) => {
                let Ok(mut state) = shared.state.lock() else {
                    error!("WAL state lock poisoned; flusher exiting");
                    return;
                };
                let due = state.pending >= shared.batch_size
                    || state
                        .first_buffered_at
                        .is_some_and(|t| t.elapsed() >= shared.flush_interval);
                if state.pending > 0
                    && due
                    && let Err(e) = flush_locked(shared, &mut state)
                {
                    error!(error = %e, "WAL group commit failed");
                }
            }
            Ok(FlusherMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                if let Ok(mut state) = shared.state.lock() {
                    let _ = flush_locked(shared, &mut state);
                }
                return;
            }
        }
    }
}

/// Writes the buffer and fsyncs. Marks the log degraded on failure.
fn flush_locked(shared: &WalShared, state: &mut WalState) -> Result<(), WalError> {
    if state.pending == 0 {
        return Ok(());
    }

    let result: io::Result<()> = (|| {
        state.file.write_all(&state.buffer)?;
        state.file.sync_data()
    })();

    match result {
        Ok(()) => {
            trace!(entries = state.pending, bytes = state.buffer.len(), "WAL group commit");
            state.buffer.clear();
            state.pending = 0;
            state.first_buffered_at = None;
            Ok(())
        }
        Err(e) => {
            shared.degraded.store(true, Ordering::Release);
            error!(error = %e, "WAL write failed; log is now degraded");
            Err(WalError::Io(e))
        }
    }
}

fn lock_state<'a>(shared: &'a WalShared) -> Result<std::sync::MutexGuard<'a, WalState>, WalError> {
    shared
        .state
        .lock()
        .map_err(|_| WalError::Internal("WAL state lock poisoned".into()))
}

// ------------------------------------------------------------------------------------------------
// Frame codec
// ------------------------------------------------------------------------------------------------

fn encode_frame(buf: &mut Vec<u8>, seq: u64, kind: EntryKind, key: &[u8], value: &[u8]) {
    let body_len = FRAME_BODY_MIN + key.len() + value.len();

    let mut body = Vec::with_capacity(body_len);
    body.extend_from_slice(&seq.to_le_bytes());
    body.push(kind as u8);
    body.extend_from_slice(&(key.len() as u32).to_le_bytes());
    body.extend_from_slice(key);
    body.extend_from_slice(&(value.len() as u32).to_le_bytes());
    body.extend_from_slice(value);

    let mut hasher = Crc32::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&body);
}

/// Parses one frame starting at `data[offset]`.
///
/// Returns `Ok(Some((entry, next_offset)))`, `Ok(None)` at a clean EOF, or
/// `Err(())` on a corrupt / truncated frame.
fn decode_frame(data: &[u8], offset: usize) -> Result<Option<(WalEntry, usize)>, ()> {
    if offset == data.len() {
        return Ok(None);
    }
    if data.len() - offset < FRAME_HEADER_SIZE {
        return Err(());
    }

    let len = u32::from_le_bytes(data[offset..offset + 4].try_into().map_err(|_| ())?);
    let crc = u32::from_le_bytes(data[offset + 4..offset + 8].try_into().map_err(|_| ())?);
    if len > MAX_FRAME_BODY || (len as usize) < FRAME_BODY_MIN {
        return Err(());
    }

    let body_start = offset + FRAME_HEADER_SIZE;
    let body_end = body_start + len as usize;
    if body_end > data.len() {
        return Err(());
    }
    let body = &data[body_start..body_end];

    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != crc {
        return Err(());
    }

    let seq = u64::from_le_bytes(body[..8].try_into().map_err(|_| ())?);
    let kind = EntryKind::try_from(body[8]).map_err(|_| ())?;

    let key_len = u32::from_le_bytes(body[9..13].try_into().map_err(|_| ())?) as usize;
    let key_end = 13 + key_len;
    if key_end + 4 > body.len() {
        return Err(());
    }
    let key = body[13..key_end].to_vec();

    let value_len =
        u32::from_le_bytes(body[key_end..key_end + 4].try_into().map_err(|_| ())?) as usize;
    if key_end + 4 + value_len != body.len() {
        return Err(());
    }
    let value = body[key_end + 4..].to_vec();

    Ok(Some((
        WalEntry {
            seq,
            kind,
            key,
            value,
        },
        body_end,
    )))
}

// ------------------------------------------------------------------------------------------------
// Segment I/O
// ------------------------------------------------------------------------------------------------

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:06}.log"))
}

fn open_segment(dir: &Path, id: u64) -> Result<File, WalError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment_path(dir, id))?;
    Ok(file)
}

fn list_segments(dir: &Path) -> Result<Vec<u64>, WalError> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str()
            && let Some(stem) = name.strip_suffix(".log")
            && let Ok(id) = stem.parse::<u64>()
        {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Reads a segment, truncating any corrupt tail in place.
fn replay_segment(path: &Path) -> Result<Vec<WalEntry>, WalError> {
    let data = fs::read(path)?;
    let mut entries = Vec::new();
    let mut offset = 0usize;

    loop {
        match decode_frame(&data, offset) {
            Ok(Some((entry, next))) => {
                entries.push(entry);
                offset = next;
            }
            Ok(None) => break,
            Err(()) => {
                warn!(
                    path = %path.display(),
                    good_bytes = offset,
                    total_bytes = data.len(),
                    "WAL crash tail truncated"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(offset as u64)?;
                file.sync_all()?;
                break;
            }
        }
    }

    Ok(entries)
}
