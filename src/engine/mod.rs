//! LSM storage engine.
//!
//! Binds the WAL, the active/frozen memtables, and the per-collection
//! SSTable sets into one durable key-value core. The document layer sits
//! above (see [`crate::store`]); the engine works on flattened record keys
//! (`database 0x00 collection 0x00 id`) and opaque value bytes.
//!
//! ## Write path
//!
//! `put`/`delete` append to the WAL first (group commit — the sequence
//! number returns immediately, durability follows within the flush
//! interval), then insert into the active memtable. Crossing the memtable
//! byte budget seals the table: the WAL rotates, the memtable freezes, and
//! a background flush is scheduled. `batch_write` logs a whole batch as
//! one contiguous group so a crash can only keep a prefix of it.
//!
//! ## Read path
//!
//! `get` probes newest-first: active memtable → frozen memtables →
//! SSTable runs (bloom-gated, ordered by max sequence, early-terminating
//! once no older run can win). A tombstone anywhere masks older versions.
//! `scan` k-way-merges all overlapping sources and keeps the newest
//! version per key, skipping tombstones, until `limit` live rows.
//!
//! ## Background work
//!
//! One worker thread handles flushes and compactions, so writers never
//! block on either. Flush turns the oldest frozen memtable into level-0
//! runs (one per collection touched), publishes a new table-set snapshot,
//! then reclaims the covered WAL segments. Compaction (see
//! [`crate::compaction`]) keeps each level at or below the configured
//! fanout.
//!
//! ## Snapshots and reclamation
//!
//! The live run set is an immutable [`TableSet`] behind
//! `RwLock<Arc<…>>`: readers clone the `Arc` and keep a consistent view
//! for the whole query while flush/compaction publish replacements.
//! Runs consumed by compaction are marked obsolete and their files are
//! unlinked when the last reference drops.
//!
//! ## Failure
//!
//! A WAL I/O failure flips the engine read-only ([`EngineError::ReadOnly`]
//! on every subsequent write) until restart. A corrupt SSTable block marks
//! the run suspect; reads are served from redundant older runs when
//! possible and fail with the corruption otherwise.

pub mod merge;

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compaction::{self, CompactionError, CompactionPlan};
use crate::memtable::{FrozenMemtable, Memtable, TableEntry};
use crate::sstable::{SsTable, SstWriter, SstableError, parse_run_file_name, run_file_name};
use crate::wal::{EntryKind, Wal, WalEntry, WalError};

use merge::{MergeIter, MergeSource, VisibleRows};

/// Subdirectory of the data dir holding per-collection state.
pub const DB_DIR: &str = "db";
/// Per-collection subdirectory holding that collection's runs.
pub const SST_DIR: &str = "sst";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Error originating from compaction.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The engine is in read-only degraded mode after a storage failure.
    #[error("engine is read-only after a storage failure; restart required")]
    ReadOnly,

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Storage-engine slice of the runtime configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root path for all persistent state.
    pub data_dir: PathBuf,
    /// Memtable byte budget before freeze.
    pub memtable_bytes: usize,
    /// WAL group-commit entry threshold.
    pub wal_batch_size: usize,
    /// WAL group-commit time bound.
    pub wal_flush_interval_ms: u64,
    /// Bloom filter target false-positive rate.
    pub bloom_fp_rate: f64,
    /// Runs tolerated per level before compaction.
    pub compaction_level_fanout: usize,
}

impl From<&crate::config::Config> for EngineConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            memtable_bytes: config.memtable_bytes,
            wal_batch_size: config.wal_batch_size,
            wal_flush_interval_ms: config.wal_flush_interval_ms,
            bloom_fp_rate: config.bloom_fp_rate,
            compaction_level_fanout: config.compaction_level_fanout,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Public value types
// ------------------------------------------------------------------------------------------------

/// One operation inside a [`Engine::batch_write`].
#[derive(Debug, Clone)]
pub struct BatchOp {
    /// Put or Delete.
    pub kind: EntryKind,
    /// Record key.
    pub key: Vec<u8>,
    /// Value bytes; ignored for deletes.
    pub value: Vec<u8>,
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug)]
pub struct EngineStats {
    /// Frozen memtables pending flush.
    pub frozen_count: usize,
    /// Total number of live runs across all collections.
    pub run_count: usize,
    /// Sum of live run file sizes in bytes.
    pub total_run_bytes: u64,
}

// ------------------------------------------------------------------------------------------------
// Table set — immutable snapshot of the live runs
// ------------------------------------------------------------------------------------------------

/// The live SSTable runs, grouped per collection prefix, each group sorted
/// newest-first by max sequence. Snapshots are immutable; mutation clones
/// the set (cheap `Arc` clones) and republishes.
#[derive(Debug, Clone, Default)]
struct TableSet {
    collections: BTreeMap<Vec<u8>, Vec<Arc<SsTable>>>,
}

impl TableSet {
    fn runs_for_key(&self, key: &[u8]) -> &[Arc<SsTable>] {
        key_prefix(key)
            .and_then(|prefix| self.collections.get(&prefix))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn runs_for_prefix(&self, prefix: &[u8]) -> &[Arc<SsTable>] {
        self.collections
            .get(prefix)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn all_runs(&self) -> impl Iterator<Item = &Arc<SsTable>> {
        self.collections.values().flatten()
    }

    fn add_run(&mut self, prefix: Vec<u8>, run: Arc<SsTable>) {
        let runs = self.collections.entry(prefix).or_default();
        runs.push(run);
        runs.sort_by(|a, b| b.props.max_seq.cmp(&a.props.max_seq));
    }

    fn replace_runs(
        &mut self,
        prefix: &[u8],
        consumed: &[u64],
        replacement: Option<Arc<SsTable>>,
    ) {
        if let Some(runs) = self.collections.get_mut(prefix) {
            runs.retain(|run| !consumed.contains(&run.file_id));
            if let Some(run) = replacement {
                runs.push(run);
            }
            runs.sort_by(|a, b| b.props.max_seq.cmp(&a.props.max_seq));
            if runs.is_empty() {
                self.collections.remove(prefix);
            }
        }
    }
}

/// Extracts the `db 0x00 coll 0x00` prefix of a record key.
fn key_prefix(key: &[u8]) -> Option<Vec<u8>> {
    let first = key.iter().position(|&b| b == 0)?;
    let second = key[first + 1..].iter().position(|&b| b == 0)? + first + 1;
    Some(key[..=second].to_vec())
}

/// Splits a collection prefix back into `(database, collection)` names.
fn prefix_names(prefix: &[u8]) -> Option<(String, String)> {
    let first = prefix.iter().position(|&b| b == 0)?;
    let database = std::str::from_utf8(&prefix[..first]).ok()?;
    let collection = std::str::from_utf8(&prefix[first + 1..prefix.len().checked_sub(1)?]).ok()?;
    Some((database.to_string(), collection.to_string()))
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

enum WorkerTask {
    Flush,
    Shutdown,
}

struct MemState {
    active: Memtable,
    /// Frozen memtables, newest first.
    frozen: Vec<Arc<FrozenMemtable>>,
}

struct EngineShared {
    config: EngineConfig,
    wal: Wal,
    mem: RwLock<MemState>,
    tables: RwLock<Arc<TableSet>>,
    next_file_id: AtomicU64,
    worker_tx: Sender<WorkerTask>,
    /// Serializes flush and compaction passes (worker thread vs. explicit flush).
    maintenance_lock: Mutex<()>,
}

/// The storage engine handle. See the [module docs](self).
pub struct Engine {
    shared: Arc<EngineShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Opens (or creates) an engine rooted at `config.data_dir`.
    ///
    /// Replays the WAL into a fresh memtable, discovers existing runs
    /// under `db/<database>/<collection>/sst/`, sweeps `.tmp` litter from
    /// interrupted builds, and starts the background worker.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        fs::create_dir_all(config.data_dir.join(DB_DIR))?;

        let (wal, recovered) = Wal::open(
            &config.data_dir,
            config.wal_batch_size,
            Duration::from_millis(config.wal_flush_interval_ms),
        )?;

        let mut active = Memtable::new();
        let recovered_count = recovered.len();
        for entry in recovered {
            active.apply(entry);
        }

        let (tables, max_file_id) = discover_runs(&config.data_dir)?;

        info!(
            recovered = recovered_count,
            runs = tables.all_runs().count(),
            last_seq = wal.last_seq(),
            "engine opened"
        );

        let (worker_tx, worker_rx) = unbounded();

        let shared = Arc::new(EngineShared {
            config,
            wal,
            mem: RwLock::new(MemState {
                active,
                frozen: Vec::new(),
            }),
            tables: RwLock::new(Arc::new(tables)),
            next_file_id: AtomicU64::new(max_file_id + 1),
            worker_tx,
            maintenance_lock: Mutex::new(()),
        });

        let worker = spawn_worker(Arc::clone(&shared), worker_rx)?;

        let engine = Self {
            shared,
            worker: Mutex::new(Some(worker)),
        };

        // A replay can overshoot the budget; seal it before taking writes.
        let over_budget = {
            let mem = engine.read_mem()?;
            mem.active.approximate_bytes() > engine.shared.config.memtable_bytes
        };
        if over_budget {
            let mut mem = engine.write_mem()?;
            engine.freeze_active_locked(&mut mem)?;
            engine.schedule_flush();
        }

        Ok(engine)
    }

    /// Inserts or replaces a record. Returns the assigned sequence number.
    ///
    /// The sequence implies memtable visibility, **not** durability —
    /// durability follows within the WAL flush interval.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<u64, EngineError> {
        self.mutate(EntryKind::Put, key, value)
    }

    /// Writes a tombstone masking every older version of the key.
    pub fn delete(&self, key: Vec<u8>) -> Result<u64, EngineError> {
        self.mutate(EntryKind::Delete, key, Vec::new())
    }

    fn mutate(&self, kind: EntryKind, key: Vec<u8>, value: Vec<u8>) -> Result<u64, EngineError> {
        let seq = self
            .shared
            .wal
            .append(kind, &key, &value)
            .map_err(map_wal_error)?;

        let mut mem = self.write_mem()?;
        mem.active.apply(WalEntry {
            seq,
            kind,
            key,
            value,
        });

        if mem.active.approximate_bytes() > self.shared.config.memtable_bytes {
            self.freeze_active_locked(&mut mem)?;
            drop(mem);
            self.schedule_flush();
        }
        Ok(seq)
    }

    /// Applies a batch of operations as one WAL group commit.
    ///
    /// Sequences are contiguous; on crash, a contiguous prefix of the
    /// batch survives. Returns `(first_seq, last_seq)`.
    pub fn batch_write(&self, ops: Vec<BatchOp>) -> Result<(u64, u64), EngineError> {
        if ops.is_empty() {
            return Err(EngineError::Internal("empty batch".into()));
        }

        let refs: Vec<(EntryKind, &[u8], &[u8])> = ops
            .iter()
            .map(|op| (op.kind, op.key.as_slice(), op.value.as_slice()))
            .collect();
        let (first, last) = self.shared.wal.append_all(&refs).map_err(map_wal_error)?;

        let mut mem = self.write_mem()?;
        let mut seq = first;
        for op in ops {
            mem.active.apply(WalEntry {
                seq,
                kind: op.kind,
                key: op.key,
                value: op.value,
            });
            seq += 1;
        }

        if mem.active.approximate_bytes() > self.shared.config.memtable_bytes {
            self.freeze_active_locked(&mut mem)?;
            drop(mem);
            self.schedule_flush();
        }
        Ok((first, last))
    }

    /// Looks up the visible value for a key.
    ///
    /// Probes newest-first (active → frozen → runs); a tombstone masks
    /// everything older. A corrupt run is marked suspect and skipped; the
    /// corruption propagates only when no redundant copy can answer.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        {
            let mem = self.read_mem()?;
            if let Some(entry) = mem.active.get(key) {
                return Ok(visible_value(entry));
            }
            for frozen in &mem.frozen {
                if let Some(entry) = frozen.get(key) {
                    return Ok(visible_value(entry));
                }
            }
        }

        let tables = self.tables_snapshot()?;
        let mut best: Option<TableEntry> = None;
        let mut corruption: Option<EngineError> = None;

        for run in tables.runs_for_key(key) {
            // Runs are ordered by max_seq descending: once the best found
            // version outranks everything a run could hold, stop.
            if let Some(b) = &best
                && run.props.max_seq <= b.seq
            {
                break;
            }
            if run.is_suspect() {
                continue;
            }

            match run.get(key) {
                Ok(Some(entry)) => {
                    if best.as_ref().is_none_or(|b| entry.seq > b.seq) {
                        best = Some(entry);
                    }
                }
                Ok(None) => {}
                Err(e @ SstableError::Corruption { .. }) => {
                    warn!(path = %run.path.display(), error = %e, "run marked suspect during get");
                    run.mark_suspect();
                    corruption = Some(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        match best {
            Some(entry) => Ok(visible_value(&entry)),
            None => match corruption {
                Some(e) => Err(e),
                None => Ok(None),
            },
        }
    }

    /// Scans live rows with keys in `[start, end)`, ascending, stopping
    /// after `limit` rows. Tombstoned and shadowed versions are skipped.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        if start >= end || limit == 0 {
            return Ok(Vec::new());
        }

        // Memtable rows are copied out so the lock drops before any I/O.
        let (active_rows, frozen_rows) = {
            let mem = self.read_mem()?;
            let active: Vec<(Vec<u8>, TableEntry)> = mem
                .active
                .range(start, end)
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect();
            let frozen: Vec<Vec<(Vec<u8>, TableEntry)>> = mem
                .frozen
                .iter()
                .map(|f| {
                    f.table
                        .range(start, end)
                        .map(|(k, e)| (k.clone(), e.clone()))
                        .collect()
                })
                .collect();
            (active, frozen)
        };

        let tables = self.tables_snapshot()?;
        let runs: Vec<Arc<SsTable>> = tables
            .all_runs()
            .filter(|run| run.overlaps(start, end) && !run.is_suspect())
            .cloned()
            .collect();

        let mut sources: Vec<MergeSource<'_>> = Vec::new();
        sources.push(Box::new(active_rows.into_iter().map(Ok)));
        for rows in frozen_rows {
            sources.push(Box::new(rows.into_iter().map(Ok)));
        }
        for run in &runs {
            sources.push(Box::new(run.scan(start, end)));
        }

        let mut out = Vec::new();
        for row in VisibleRows::new(MergeIter::new(sources)) {
            out.push(row?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Forces all buffered WAL entries to disk.
    pub fn sync(&self) -> Result<(), EngineError> {
        self.shared.wal.sync().map_err(map_wal_error)
    }

    /// Seals the active memtable (if non-empty) and flushes every frozen
    /// memtable to SSTables, synchronously.
    pub fn flush_all(&self) -> Result<(), EngineError> {
        {
            let mut mem = self.write_mem()?;
            if !mem.active.is_empty() {
                self.freeze_active_locked(&mut mem)?;
            }
        }
        while flush_oldest_frozen(&self.shared)? {}
        run_compactions(&self.shared);
        Ok(())
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let frozen_count = self.read_mem()?.frozen.len();
        let tables = self.tables_snapshot()?;
        let run_count = tables.all_runs().count();
        let total_run_bytes = tables.all_runs().map(|r| r.file_size()).sum();
        Ok(EngineStats {
            frozen_count,
            run_count,
            total_run_bytes,
        })
    }

    /// True once a storage failure has forced read-only mode.
    pub fn is_read_only(&self) -> bool {
        self.shared.wal.is_degraded()
    }

    /// Gracefully shuts down: stops the worker, flushes frozen memtables,
    /// and syncs the WAL. The active memtable stays in the WAL and is
    /// replayed on the next open.
    pub fn close(&self) -> Result<(), EngineError> {
        let _ = self.shared.worker_tx.send(WorkerTask::Shutdown);
        if let Some(handle) = self
            .worker
            .lock()
            .map_err(|_| EngineError::Internal("worker handle lock poisoned".into()))?
            .take()
        {
            let _ = handle.join();
        }

        while flush_oldest_frozen(&self.shared)? {}
        self.shared.wal.close().map_err(map_wal_error)?;

        if let Ok(root) = fs::File::open(&self.shared.config.data_dir) {
            root.sync_all()?;
        }
        info!("engine closed");
        Ok(())
    }

    // ----------------------------------------------------------------
    // Internals
    // ----------------------------------------------------------------

    fn freeze_active_locked(&self, mem: &mut MemState) -> Result<(), EngineError> {
        let sealed_segment = self.shared.wal.rotate().map_err(map_wal_error)?;
        let old_active = std::mem::replace(&mut mem.active, Memtable::new());
        debug!(
            entries = old_active.len(),
            bytes = old_active.approximate_bytes(),
            sealed_segment,
            "memtable frozen"
        );
        mem.frozen.insert(0, Arc::new(old_active.freeze(sealed_segment)));
        Ok(())
    }

    fn schedule_flush(&self) {
        let _ = self.shared.worker_tx.send(WorkerTask::Flush);
    }

    fn read_mem(&self) -> Result<std::sync::RwLockReadGuard<'_, MemState>, EngineError> {
        self.shared
            .mem
            .read()
            .map_err(|_| EngineError::Internal("mem lock poisoned".into()))
    }

    fn write_mem(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemState>, EngineError> {
        self.shared
            .mem
            .write()
            .map_err(|_| EngineError::Internal("mem lock poisoned".into()))
    }

    fn tables_snapshot(&self) -> Result<Arc<TableSet>, EngineError> {
        let guard = self
            .shared
            .tables
            .read()
            .map_err(|_| EngineError::Internal("tables lock poisoned".into()))?;
        Ok(Arc::clone(&guard))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shared.worker_tx.send(WorkerTask::Shutdown);
        if let Ok(mut guard) = self.worker.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }
    }
}

fn visible_value(entry: &TableEntry) -> Option<Vec<u8>> {
    if entry.is_tombstone() {
        None
    } else {
        Some(entry.value.clone())
    }
}

fn map_wal_error(e: WalError) -> EngineError {
    match e {
        WalError::Degraded => EngineError::ReadOnly,
        other => EngineError::Wal(other),
    }
}

// ------------------------------------------------------------------------------------------------
// Open-time discovery
// ------------------------------------------------------------------------------------------------

/// Walks `db/<database>/<collection>/sst/`, sweeping `.tmp` litter and
/// opening every run. Returns the table set and the highest file id seen.
fn discover_runs(data_dir: &Path) -> Result<(TableSet, u64), EngineError> {
    let mut set = TableSet::default();
    let mut max_file_id = 0u64;

    let db_root = data_dir.join(DB_DIR);
    for db_entry in fs::read_dir(&db_root)? {
        let db_path = db_entry?.path();
        if !db_path.is_dir() {
            continue;
        }
        for coll_entry in fs::read_dir(&db_path)? {
            let coll_path = coll_entry?.path();
            let sst_dir = coll_path.join(SST_DIR);
            if !sst_dir.is_dir() {
                continue;
            }

            let prefix = match (
                db_path.file_name().and_then(|n| n.to_str()),
                coll_path.file_name().and_then(|n| n.to_str()),
            ) {
                (Some(db), Some(coll)) => {
                    let mut p = db.as_bytes().to_vec();
                    p.push(0);
                    p.extend_from_slice(coll.as_bytes());
                    p.push(0);
                    p
                }
                _ => continue,
            };

            for file_entry in fs::read_dir(&sst_dir)? {
                let file_path = file_entry?.path();
                let Some(name) = file_path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };

                if name.ends_with(".tmp") {
                    warn!(path = %file_path.display(), "sweeping interrupted build");
                    let _ = fs::remove_file(&file_path);
                    continue;
                }

                if let Some((_, id)) = parse_run_file_name(name) {
                    match SsTable::open(&file_path) {
                        Ok(table) => {
                            max_file_id = max_file_id.max(id);
                            set.add_run(prefix.clone(), Arc::new(table));
                        }
                        Err(e) => {
                            warn!(path = %file_path.display(), error = %e, "unreadable run skipped at open");
                        }
                    }
                }
            }
        }
    }

    Ok((set, max_file_id))
}

// ------------------------------------------------------------------------------------------------
// Background worker — flush and compaction
// ------------------------------------------------------------------------------------------------

fn spawn_worker(
    shared: Arc<EngineShared>,
    rx: Receiver<WorkerTask>,
) -> Result<JoinHandle<()>, EngineError> {
    std::thread::Builder::new()
        .name("nexadb-engine-worker".into())
        .spawn(move || {
            while let Ok(task) = rx.recv() {
                match task {
                    WorkerTask::Flush => {
                        loop {
                            match flush_oldest_frozen(&shared) {
                                Ok(true) => continue,
                                Ok(false) => break,
                                Err(e) => {
                                    // The frozen memtable stays queued and
                                    // the next flush retries it.
                                    error!(error = %e, "flush failed");
                                    break;
                                }
                            }
                        }
                        run_compactions(&shared);
                    }
                    WorkerTask::Shutdown => return,
                }
            }
        })
        .map_err(EngineError::Io)
}

/// Flushes the oldest frozen memtable into level-0 runs (one per
/// collection present in it), publishes the new table set, then drops the
/// memtable and reclaims its WAL segments.
///
/// Returns `false` when there was nothing to flush.
fn flush_oldest_frozen(shared: &EngineShared) -> Result<bool, EngineError> {
    let _guard = shared
        .maintenance_lock
        .lock()
        .map_err(|_| EngineError::Internal("maintenance lock poisoned".into()))?;

    let frozen = {
        let mem = shared
            .mem
            .read()
            .map_err(|_| EngineError::Internal("mem lock poisoned".into()))?;
        match mem.frozen.last() {
            Some(frozen) => Arc::clone(frozen),
            None => return Ok(false),
        }
    };

    // Group entries per collection; each group becomes one level-0 run.
    let mut groups: BTreeMap<Vec<u8>, Vec<(Vec<u8>, TableEntry)>> = BTreeMap::new();
    for (key, entry) in frozen.table.iter() {
        match key_prefix(key) {
            Some(prefix) => groups
                .entry(prefix)
                .or_default()
                .push((key.clone(), entry.clone())),
            None => {
                warn!("record key without collection prefix skipped during flush");
            }
        }
    }

    let mut new_runs: Vec<(Vec<u8>, Arc<SsTable>)> = Vec::new();
    for (prefix, entries) in groups {
        let (database, collection) = prefix_names(&prefix)
            .ok_or_else(|| EngineError::Internal("undecodable collection prefix".into()))?;

        let sst_dir = shared
            .config
            .data_dir
            .join(DB_DIR)
            .join(&database)
            .join(&collection)
            .join(SST_DIR);
        fs::create_dir_all(&sst_dir)?;

        let file_id = shared.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = sst_dir.join(run_file_name(0, file_id));

        let count = entries.len();
        SstWriter::new(&path).build(
            0,
            shared.config.bloom_fp_rate,
            count,
            entries.into_iter(),
        )?;

        let table = Arc::new(SsTable::open(&path)?);
        debug!(
            path = %path.display(),
            entries = count,
            "memtable flushed to run"
        );
        new_runs.push((prefix, table));
    }

    // Publish the new runs before dropping the frozen memtable so no
    // window exists where the data is in neither place.
    {
        let mut tables = shared
            .tables
            .write()
            .map_err(|_| EngineError::Internal("tables lock poisoned".into()))?;
        let mut set = (**tables).clone();
        for (prefix, run) in new_runs {
            set.add_run(prefix, run);
        }
        *tables = Arc::new(set);
    }

    {
        let mut mem = shared
            .mem
            .write()
            .map_err(|_| EngineError::Internal("mem lock poisoned".into()))?;
        mem.frozen.pop();
    }

    shared
        .wal
        .remove_segments_through(frozen.wal_segment)
        .map_err(map_wal_error)?;

    Ok(true)
}

/// Runs compactions until every collection's levels are within fanout.
fn run_compactions(shared: &EngineShared) {
    let Ok(_guard) = shared.maintenance_lock.lock() else {
        return;
    };
    loop {
        let snapshot = match shared.tables.read() {
            Ok(tables) => Arc::clone(&tables),
            Err(_) => return,
        };

        let mut picked: Option<(Vec<u8>, CompactionPlan)> = None;
        for (prefix, runs) in &snapshot.collections {
            if let Some(plan) = compaction::plan(runs, shared.config.compaction_level_fanout) {
                picked = Some((prefix.clone(), plan));
                break;
            }
        }

        let Some((prefix, plan)) = picked else { return };
        if let Err(e) = execute_compaction(shared, &prefix, plan) {
            // Inputs stay live; state is unchanged.
            error!(error = %e, "compaction failed");
            return;
        }
    }
}

fn execute_compaction(
    shared: &EngineShared,
    prefix: &[u8],
    plan: CompactionPlan,
) -> Result<(), EngineError> {
    let (database, collection) = prefix_names(prefix)
        .ok_or_else(|| EngineError::Internal("undecodable collection prefix".into()))?;

    let input_ids: Vec<u64> = plan.inputs.iter().map(|r| r.file_id).collect();

    let outside: Vec<Arc<SsTable>> = {
        let tables = shared
            .tables
            .read()
            .map_err(|_| EngineError::Internal("tables lock poisoned".into()))?;
        tables
            .runs_for_prefix(prefix)
            .iter()
            .filter(|run| !input_ids.contains(&run.file_id))
            .cloned()
            .collect()
    };

    let sst_dir = shared
        .config
        .data_dir
        .join(DB_DIR)
        .join(&database)
        .join(&collection)
        .join(SST_DIR);

    let file_id = shared.next_file_id.fetch_add(1, Ordering::SeqCst);
    let output_path = sst_dir.join(run_file_name(plan.output_level(), file_id));

    let wrote = compaction::compact(
        &plan,
        &outside,
        &output_path,
        shared.config.bloom_fp_rate,
    )?;

    let replacement = if wrote {
        Some(Arc::new(SsTable::open(&output_path)?))
    } else {
        None
    };

    {
        let mut tables = shared
            .tables
            .write()
            .map_err(|_| EngineError::Internal("tables lock poisoned".into()))?;
        let mut set = (**tables).clone();
        set.replace_runs(prefix, &input_ids, replacement);
        *tables = Arc::new(set);
    }

    // Files disappear when the last in-flight reader drops its handle.
    for input in &plan.inputs {
        input.mark_obsolete();
    }

    info!(
        database,
        collection,
        level = plan.level,
        inputs = plan.inputs.len(),
        wrote_output = wrote,
        "compaction applied"
    );
    Ok(())
}
