//! # NexaDB
//!
//! An embeddable, persistent **document database** built on a
//! log-structured merge-tree (LSM) storage engine, with approximate
//! nearest-neighbour vector search and a framed binary TCP protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Server                              │
//! │   TCP accept loop → per-connection handler → dispatcher    │
//! ├────────────────────────────────────────────────────────────┤
//! │                        Store                               │
//! │   catalog (databases / collections / credentials)          │
//! │   documents (CRUD, queries)      vector indexes (ANN)      │
//! ├────────────────────────────────────────────────────────────┤
//! │                        Engine                              │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────────┐    │
//! │  │  Active    │  │   Frozen     │  │  SSTables        │    │
//! │  │  memtable  │  │  memtables   │  │  (per collection,│    │
//! │  │            │  │              │  │   levelled)      │    │
//! │  └─────┬──────┘  └──────┬───────┘  └────────┬─────────┘    │
//! │        │   freeze       │   flush           │              │
//! │        └────────►       └────────►    compaction           │
//! │                                                            │
//! │  WAL (group commit, segment per memtable generation)       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | LSM storage engine — open, read, write, scan, flush, compact |
//! | [`memtable`] | In-memory sorted write buffer with byte accounting |
//! | [`wal`] | Segmented, CRC-protected write-ahead log with group commit |
//! | [`sstable`] | Immutable, sorted, mmap'd on-disk runs with bloom sidecars |
//! | [`bloom`] | Bloom filter with double hashing and a fixed wire format |
//! | [`compaction`] | Size-tiered levelled compaction policy |
//! | [`vector`] | Brute-force and HNSW vector indexes |
//! | [`catalog`] | Databases, collections, and credential metadata |
//! | [`value`] | Dynamic document values, payload codec, record keys |
//! | [`encoding`] | Byte-stable binary encoding for on-disk structures |
//! | [`store`] | Document-level semantics binding catalog + engine + vectors |
//! | [`protocol`] | Binary wire framing and request/response types |
//! | [`server`] | TCP connection server and request dispatcher |
//! | [`auth`] | Salted credential hashing |
//! | [`config`] | Runtime configuration with documented defaults |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nexadb::config::Config;
//! use nexadb::store::Store;
//! use nexadb::value::{Document, Value};
//!
//! let config = Config {
//!     data_dir: "/tmp/nexadb".into(),
//!     ..Config::default()
//! };
//!
//! let store = Store::open(config).unwrap();
//!
//! let mut doc = Document::new();
//! doc.insert("_id".into(), Value::Str("u1".into()));
//! doc.insert("name".into(), Value::Str("Alice".into()));
//! store.create_document("default", "users", doc).unwrap();
//!
//! let found = store.read_document("default", "users", "u1").unwrap();
//! assert!(found.is_some());
//!
//! store.close().unwrap();
//! ```

pub mod auth;
pub mod bloom;
pub mod catalog;
pub mod compaction;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod memtable;
pub mod protocol;
pub mod server;
pub mod sstable;
pub mod store;
pub mod value;
pub mod vector;
pub mod wal;
