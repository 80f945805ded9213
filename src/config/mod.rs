//! Runtime configuration.
//!
//! One flat struct covering the storage engine, the vector index defaults,
//! and the connection server. Every field has a documented default; the
//! server binary overrides them from `NEXADB_*` environment variables.

use std::path::PathBuf;

/// Default TCP port for the connection server.
pub const DEFAULT_PORT: u16 = 7878;

/// Per-request socket inactivity timeout, in seconds.
pub const SOCKET_TIMEOUT_SECS: u64 = 30;

/// Configuration for a [`Store`](crate::store::Store) / server instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root path for all persistent state.
    pub data_dir: PathBuf,

    /// TCP bind host.
    pub listen_host: String,

    /// TCP bind port.
    pub listen_port: u16,

    /// Memtable byte budget before a freeze + flush is scheduled.
    pub memtable_bytes: usize,

    /// WAL group-commit size: a sync is forced once this many entries are
    /// buffered.
    pub wal_batch_size: usize,

    /// WAL group-commit time bound in milliseconds: buffered entries are
    /// synced at least this often. This is also the documented worst-case
    /// data-loss window on crash.
    pub wal_flush_interval_ms: u64,

    /// Target false-positive rate for SSTable bloom filters.
    pub bloom_fp_rate: f64,

    /// Runs tolerated per level before compaction into the next level.
    pub compaction_level_fanout: usize,

    /// HNSW `M` — neighbours kept per node at layers above 0.
    pub vector_hnsw_m: usize,

    /// HNSW construction breadth (`ef_construction`).
    pub vector_hnsw_ef_construction: usize,

    /// HNSW search breadth (`ef_search`).
    pub vector_hnsw_ef_search: usize,

    /// When true, connections must authenticate via CONNECT before any
    /// other request is served.
    pub auth_required: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("nexadb-data"),
            listen_host: "127.0.0.1".to_string(),
            listen_port: DEFAULT_PORT,
            memtable_bytes: 4 * 1024 * 1024,
            wal_batch_size: 100,
            wal_flush_interval_ms: 10,
            bloom_fp_rate: 0.01,
            compaction_level_fanout: 4,
            vector_hnsw_m: 16,
            vector_hnsw_ef_construction: 200,
            vector_hnsw_ef_search: 100,
            auth_required: true,
        }
    }
}

impl Config {
    /// Builds a config from `NEXADB_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("NEXADB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(host) = std::env::var("NEXADB_LISTEN_HOST") {
            config.listen_host = host;
        }
        if let Some(port) = env_parse("NEXADB_LISTEN_PORT") {
            config.listen_port = port;
        }
        if let Some(bytes) = env_parse("NEXADB_MEMTABLE_BYTES") {
            config.memtable_bytes = bytes;
        }
        if let Some(batch) = env_parse("NEXADB_WAL_BATCH_SIZE") {
            config.wal_batch_size = batch;
        }
        if let Some(interval) = env_parse("NEXADB_WAL_FLUSH_INTERVAL_MS") {
            config.wal_flush_interval_ms = interval;
        }
        if let Some(rate) = env_parse("NEXADB_BLOOM_FP_RATE") {
            config.bloom_fp_rate = rate;
        }
        if let Some(fanout) = env_parse("NEXADB_COMPACTION_LEVEL_FANOUT") {
            config.compaction_level_fanout = fanout;
        }
        if let Some(m) = env_parse("NEXADB_VECTOR_HNSW_M") {
            config.vector_hnsw_m = m;
        }
        if let Some(efc) = env_parse("NEXADB_VECTOR_HNSW_EF_CONSTRUCTION") {
            config.vector_hnsw_ef_construction = efc;
        }
        if let Some(efs) = env_parse("NEXADB_VECTOR_HNSW_EF_SEARCH") {
            config.vector_hnsw_ef_search = efs;
        }
        if let Some(required) = env_parse("NEXADB_AUTH_REQUIRED") {
            config.auth_required = required;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
