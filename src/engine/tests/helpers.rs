use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig};

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly —
/// only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config large enough that nothing flushes on its own.
pub fn memtable_only_config(dir: &Path) -> EngineConfig {
    init_tracing();
    EngineConfig {
        data_dir: dir.to_path_buf(),
        memtable_bytes: 64 * 1024 * 1024,
        wal_batch_size: 100,
        wal_flush_interval_ms: 10,
        bloom_fp_rate: 0.01,
        compaction_level_fanout: 4,
    }
}

/// Small write buffer that freezes and flushes quickly.
pub fn small_buffer_config(dir: &Path) -> EngineConfig {
    init_tracing();
    EngineConfig {
        data_dir: dir.to_path_buf(),
        memtable_bytes: 4 * 1024,
        wal_batch_size: 100,
        wal_flush_interval_ms: 10,
        bloom_fp_rate: 0.01,
        compaction_level_fanout: 4,
    }
}

/// Record key in the shared test collection.
pub fn key(id: &str) -> Vec<u8> {
    let mut k = b"testdb".to_vec();
    k.push(0);
    k.extend_from_slice(b"items");
    k.push(0);
    k.extend_from_slice(id.as_bytes());
    k
}

/// Record key in a second collection, for isolation tests.
pub fn other_key(id: &str) -> Vec<u8> {
    let mut k = b"testdb".to_vec();
    k.push(0);
    k.extend_from_slice(b"orders");
    k.push(0);
    k.extend_from_slice(id.as_bytes());
    k
}

/// Key-range bounds covering the whole `items` collection.
pub fn items_range() -> (Vec<u8>, Vec<u8>) {
    let mut start = b"testdb".to_vec();
    start.push(0);
    start.extend_from_slice(b"items");
    start.push(0);
    let mut end = start.clone();
    let last = end.len() - 1;
    end[last] = 1;
    (start, end)
}

/// Opens an engine and fills the `items` collection with `num` rows,
/// flushing everything to runs.
pub fn engine_with_runs(dir: &Path, num: usize) -> Engine {
    let engine = Engine::open(small_buffer_config(dir)).expect("open");
    for i in 0..num {
        engine
            .put(
                key(&format!("id{i:05}")),
                format!("value_with_some_padding_{i:05}").into_bytes(),
            )
            .expect("put");
    }
    engine.flush_all().expect("flush");
    let stats = engine.stats().expect("stats");
    assert!(stats.run_count > 0, "expected runs on disk");
    engine
}
