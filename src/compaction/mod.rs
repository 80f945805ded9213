//! Size-tiered levelled compaction.
//!
//! Runs accumulate per collection, tagged with the level they were written
//! to (flushes land at level 0). A level tolerates up to
//! `compaction_level_fanout` runs; when it overflows, every run at that
//! level — plus any run at the next level whose key range overlaps them —
//! is merged into a single new run at the next level.
//!
//! The merge keeps the highest-sequence version of each key. A tombstone
//! is dropped only when **no run outside the compaction inputs** could
//! still hold an older version of its key (checked against the outside
//! runs' key ranges); otherwise it is carried into the output to keep
//! masking.
//!
//! Compaction runs on the engine's background worker and never blocks
//! writers: the merge happens against immutable inputs, and only the final
//! table-set swap takes the write lock. On failure the partial output is
//! discarded and the inputs stay live.


use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::engine::merge::{MergeIter, MergeSource};
use crate::memtable::TableEntry;
use crate::sstable::{SsTable, SstWriter, SstableError};

/// Errors surfaced by a compaction attempt.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Reading an input or writing the output failed.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A selected set of input runs to merge into `level + 1`.
#[derive(Debug)]
pub struct CompactionPlan {
    /// The overflowing level.
    pub level: u32,
    /// Runs to consume: all of `level`, plus overlapping runs of `level+1`.
    pub inputs: Vec<Arc<SsTable>>,
}

impl CompactionPlan {
    /// Level the merged output run is written to.
    pub fn output_level(&self) -> u32 {
        self.level + 1
    }
}

/// Picks the lowest overflowing level of one collection's runs, if any.
///
/// `runs` is the collection's full live set. Returns `None` while every
/// level holds at most `fanout` runs.
pub fn plan(runs: &[Arc<SsTable>], fanout: usize) -> Option<CompactionPlan> {
    let mut by_level: BTreeMap<u32, Vec<Arc<SsTable>>> = BTreeMap::new();
    for run in runs {
        by_level
            .entry(run.props.level)
            .or_default()
            .push(Arc::clone(run));
    }

    let (&level, overflow) = by_level.iter().find(|(_, runs)| runs.len() > fanout)?;

    let mut inputs = overflow.clone();

    // Combined key range of the overflowing level.
    let min_key = inputs.iter().map(|r| r.props.min_key.clone()).min()?;
    let max_key = inputs.iter().map(|r| r.props.max_key.clone()).max()?;

    // Pull in next-level runs whose range overlaps it.
    if let Some(next_level) = by_level.get(&(level + 1)) {
        for run in next_level {
            if run.props.min_key <= max_key && run.props.max_key >= min_key {
                inputs.push(Arc::clone(run));
            }
        }
    }

    Some(CompactionPlan { level, inputs })
}

/// Merges the plan's inputs into a single run at `output_path`.
///
/// `outside` is every live run of the collection **not** in the inputs; a
/// tombstone is dropped only when no outside run's key range covers its
/// key. Does not touch the engine's table set — the caller publishes the
/// result after the file is durable.
///
/// Returns `true` when an output run was written, `false` when every
/// entry was a droppable tombstone and the inputs can simply disappear.
pub fn compact(
    plan: &CompactionPlan,
    outside: &[Arc<SsTable>],
    output_path: &Path,
    bloom_fp_rate: f64,
) -> Result<bool, CompactionError> {
    let sources: Vec<MergeSource<'_>> = plan
        .inputs
        .iter()
        .map(|run| Box::new(run.scan_all()) as MergeSource<'_>)
        .collect();

    let mut merged: Vec<(Vec<u8>, TableEntry)> = Vec::new();
    let mut last_key: Option<Vec<u8>> = None;
    let mut dropped_tombstones = 0usize;

    for item in MergeIter::new(sources) {
        let (key, entry) = item?;

        // Keys arrive (key ASC, seq DESC): the first version wins.
        if last_key.as_deref() == Some(key.as_slice()) {
            continue;
        }
        last_key = Some(key.clone());

        if entry.is_tombstone() && !key_may_exist_outside(&key, outside) {
            dropped_tombstones += 1;
            continue;
        }
        merged.push((key, entry));
    }

    if merged.is_empty() {
        debug!(
            inputs = plan.inputs.len(),
            level = plan.level,
            dropped_tombstones,
            "compaction left nothing to write"
        );
        return Ok(false);
    }

    let count = merged.len();
    SstWriter::new(output_path).build(
        plan.output_level(),
        bloom_fp_rate,
        count,
        merged.into_iter(),
    )?;

    debug!(
        inputs = plan.inputs.len(),
        level = plan.level,
        output_level = plan.output_level(),
        survivors = count,
        dropped_tombstones,
        "compaction merged runs"
    );
    Ok(true)
}

fn key_may_exist_outside(key: &[u8], outside: &[Arc<SsTable>]) -> bool {
    outside.iter().any(|run| {
        run.props.min_key.as_slice() <= key && key <= run.props.max_key.as_slice()
    })
}
