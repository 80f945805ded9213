//! Catalog — databases, collections, and credentials.
//!
//! The catalog is the metadata authority: which databases exist, which
//! collections they own, each collection's vector configuration, and the
//! credential store. It persists as one CRC-protected snapshot file,
//! `catalog.meta`, rewritten atomically (write-temp + fsync + rename +
//! directory fsync) on **every** mutation — the metadata is tiny and a
//! full rewrite is simpler to reason about than a metadata log.
//!
//! A per-collection `meta` file mirrors that collection's entry under
//! `db/<database>/<collection>/` so on-disk trees are self-describing;
//! the snapshot remains the source of truth on open.
//!
//! A catalog snapshot that fails its checksum at startup is **fatal** —
//! unlike a WAL tail, there is no safe way to truncate metadata.
//!
//! The `default` database always exists.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::Credential;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::vector::{IndexKind, Metric};

/// Snapshot file name under the data dir.
pub const CATALOG_FILE: &str = "catalog.meta";
/// Per-collection mirror file name.
pub const COLLECTION_META_FILE: &str = "meta";
/// The database targeted when a request names none.
pub const DEFAULT_DATABASE: &str = "default";

/// Highest permitted vector dimensionality.
pub const MAX_VECTOR_DIMENSIONS: u32 = 4096;

const CATALOG_MAGIC: u32 = 0x4E43_4154; // "NCAT"
const CATALOG_VERSION: u8 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The snapshot failed integrity checks. Fatal at startup.
    #[error("corrupt catalog: {0}")]
    Corrupt(String),

    /// The named entity already exists.
    #[error("{what} '{name}' already exists")]
    AlreadyExists {
        /// Entity kind ("database", "collection", "user").
        what: &'static str,
        /// Offending name.
        name: String,
    },

    /// The named entity does not exist.
    #[error("{what} '{name}' not found")]
    NotFound {
        /// Entity kind.
        what: &'static str,
        /// Requested name.
        name: String,
    },

    /// The name is empty, contains NUL, or the dimension is out of range.
    #[error("invalid {0}")]
    Invalid(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Metadata structures
// ------------------------------------------------------------------------------------------------

/// A collection's durable attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMeta {
    /// Collection name, unique within its database.
    pub name: String,
    /// Vector dimensionality, fixed at creation. `None` for plain
    /// document collections.
    pub vector_dimensions: Option<u32>,
    /// Distance metric for the vector index.
    pub vector_metric: Metric,
    /// Which index variant backs vector search.
    pub vector_index_kind: IndexKind,
}

impl CollectionMeta {
    /// True when this collection maintains a vector index.
    pub fn is_vector_enabled(&self) -> bool {
        self.vector_dimensions.is_some()
    }
}

impl Encode for CollectionMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.vector_dimensions.encode_to(buf)?;
        (self.vector_metric as u8).encode_to(buf)?;
        (self.vector_index_kind as u8).encode_to(buf)
    }
}

impl Decode for CollectionMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (name, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (vector_dimensions, n) = Option::<u32>::decode_from(&buf[off..])?;
        off += n;
        let (metric_byte, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (kind_byte, n) = u8::decode_from(&buf[off..])?;
        off += n;

        let vector_metric = Metric::try_from(metric_byte).map_err(|b| {
            EncodingError::InvalidTag {
                tag: b as u32,
                type_name: "Metric",
            }
        })?;
        let vector_index_kind = IndexKind::try_from(kind_byte).map_err(|b| {
            EncodingError::InvalidTag {
                tag: b as u32,
                type_name: "IndexKind",
            }
        })?;

        Ok((
            Self {
                name,
                vector_dimensions,
                vector_metric,
                vector_index_kind,
            },
            off,
        ))
    }
}

#[derive(Debug, Clone, Default)]
struct CatalogData {
    databases: BTreeMap<String, BTreeMap<String, CollectionMeta>>,
    users: Vec<Credential>,
}

impl Encode for CatalogData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.databases.len() as u32).encode_to(buf)?;
        for (db_name, collections) in &self.databases {
            db_name.encode_to(buf)?;
            let metas: Vec<CollectionMeta> = collections.values().cloned().collect();
            encoding::encode_vec(&metas, buf)?;
        }
        encoding::encode_vec(&self.users, buf)
    }
}

impl Decode for CatalogData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (db_count, n) = u32::decode_from(&buf[off..])?;
        off += n;

        let mut databases = BTreeMap::new();
        for _ in 0..db_count {
            let (db_name, n) = String::decode_from(&buf[off..])?;
            off += n;
            let (metas, n) = encoding::decode_vec::<CollectionMeta>(&buf[off..])?;
            off += n;
            let collections = metas.into_iter().map(|m| (m.name.clone(), m)).collect();
            databases.insert(db_name, collections);
        }

        let (users, n) = encoding::decode_vec::<Credential>(&buf[off..])?;
        off += n;

        Ok((Self { databases, users }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// Catalog
// ------------------------------------------------------------------------------------------------

/// Thread-safe catalog handle. Every mutation persists before returning.
pub struct Catalog {
    data_dir: PathBuf,
    state: Mutex<CatalogData>,
}

impl Catalog {
    /// Opens the catalog under `data_dir`, creating a fresh one (with the
    /// `default` database) when no snapshot exists.
    ///
    /// A snapshot that fails its CRC is a fatal [`CatalogError::Corrupt`].
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        let path = data_dir.join(CATALOG_FILE);

        let mut data = if path.exists() {
            let bytes = fs::read(&path)?;
            decode_snapshot(&bytes)?
        } else {
            info!("creating fresh catalog");
            CatalogData::default()
        };

        let fresh_default = !data.databases.contains_key(DEFAULT_DATABASE);
        if fresh_default {
            data.databases
                .insert(DEFAULT_DATABASE.to_string(), BTreeMap::new());
        }

        let catalog = Self {
            data_dir,
            state: Mutex::new(data),
        };
        if fresh_default {
            let state = catalog.lock()?;
            catalog.persist(&state)?;
        }
        Ok(catalog)
    }

    /// Creates a database.
    pub fn create_database(&self, name: &str) -> Result<(), CatalogError> {
        if !crate::value::valid_name(name) {
            return Err(CatalogError::Invalid(format!("database name {name:?}")));
        }
        let mut state = self.lock()?;
        if state.databases.contains_key(name) {
            return Err(CatalogError::AlreadyExists {
                what: "database",
                name: name.to_string(),
            });
        }
        state.databases.insert(name.to_string(), BTreeMap::new());
        self.persist(&state)?;
        info!(database = name, "database created");
        Ok(())
    }

    /// Drops a database, returning the metadata of every collection it
    /// owned so the caller can cascade (data dirs, vector indexes).
    pub fn drop_database(&self, name: &str) -> Result<Vec<CollectionMeta>, CatalogError> {
        let mut state = self.lock()?;
        let collections = state
            .databases
            .remove(name)
            .ok_or_else(|| CatalogError::NotFound {
                what: "database",
                name: name.to_string(),
            })?;
        // Dropping `default` only empties it.
        if name == DEFAULT_DATABASE {
            state
                .databases
                .insert(DEFAULT_DATABASE.to_string(), BTreeMap::new());
        }
        self.persist(&state)?;
        info!(database = name, "database dropped");
        Ok(collections.into_values().collect())
    }

    /// Creates a collection. `vector_dimensions` of `Some(d)` (1…4096)
    /// makes it vector-enabled with the given metric and index kind.
    pub fn create_collection(
        &self,
        database: &str,
        meta: CollectionMeta,
    ) -> Result<(), CatalogError> {
        if !crate::value::valid_name(&meta.name) {
            return Err(CatalogError::Invalid(format!(
                "collection name {:?}",
                meta.name
            )));
        }
        if let Some(dim) = meta.vector_dimensions
            && !(1..=MAX_VECTOR_DIMENSIONS).contains(&dim)
        {
            return Err(CatalogError::Invalid(format!(
                "vector dimensionality {dim} (allowed 1..={MAX_VECTOR_DIMENSIONS})"
            )));
        }

        let mut state = self.lock()?;
        let collections =
            state
                .databases
                .get_mut(database)
                .ok_or_else(|| CatalogError::NotFound {
                    what: "database",
                    name: database.to_string(),
                })?;
        if collections.contains_key(&meta.name) {
            return Err(CatalogError::AlreadyExists {
                what: "collection",
                name: meta.name.clone(),
            });
        }

        collections.insert(meta.name.clone(), meta.clone());
        self.persist(&state)?;
        drop(state);

        if let Err(e) = self.write_collection_mirror(database, &meta) {
            warn!(error = %e, "collection meta mirror write failed");
        }
        info!(
            database,
            collection = meta.name,
            vector_dimensions = ?meta.vector_dimensions,
            "collection created"
        );
        Ok(())
    }

    /// Drops a collection, returning its metadata for cascading.
    pub fn drop_collection(
        &self,
        database: &str,
        name: &str,
    ) -> Result<CollectionMeta, CatalogError> {
        let mut state = self.lock()?;
        let collections =
            state
                .databases
                .get_mut(database)
                .ok_or_else(|| CatalogError::NotFound {
                    what: "database",
                    name: database.to_string(),
                })?;
        let meta = collections
            .remove(name)
            .ok_or_else(|| CatalogError::NotFound {
                what: "collection",
                name: name.to_string(),
            })?;
        self.persist(&state)?;
        info!(database, collection = name, "collection dropped");
        Ok(meta)
    }

    /// Looks up a collection's metadata.
    pub fn collection(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<CollectionMeta>, CatalogError> {
        let state = self.lock()?;
        Ok(state
            .databases
            .get(database)
            .and_then(|colls| colls.get(name))
            .cloned())
    }

    /// True when the database exists.
    pub fn database_exists(&self, name: &str) -> Result<bool, CatalogError> {
        Ok(self.lock()?.databases.contains_key(name))
    }

    /// Names of all databases.
    pub fn database_names(&self) -> Result<Vec<String>, CatalogError> {
        Ok(self.lock()?.databases.keys().cloned().collect())
    }

    /// Names of all collections in a database.
    pub fn list_collections(&self, database: &str) -> Result<Vec<String>, CatalogError> {
        let state = self.lock()?;
        Ok(state
            .databases
            .get(database)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Adds a user. Fails when the username is taken.
    pub fn add_user(&self, username: &str, password: &str) -> Result<(), CatalogError> {
        if username.is_empty() {
            return Err(CatalogError::Invalid("empty username".into()));
        }
        let mut state = self.lock()?;
        if state.users.iter().any(|u| u.username == username) {
            return Err(CatalogError::AlreadyExists {
                what: "user",
                name: username.to_string(),
            });
        }
        state.users.push(Credential::new(username, password));
        self.persist(&state)?;
        info!(username, "user added");
        Ok(())
    }

    /// True when the credentials match a stored user.
    pub fn verify_user(&self, username: &str, password: &str) -> Result<bool, CatalogError> {
        let state = self.lock()?;
        Ok(state
            .users
            .iter()
            .any(|u| u.username == username && u.verify(password)))
    }

    /// True when at least one user exists.
    pub fn has_users(&self) -> Result<bool, CatalogError> {
        Ok(!self.lock()?.users.is_empty())
    }

    // ----------------------------------------------------------------
    // Persistence
    // ----------------------------------------------------------------

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CatalogData>, CatalogError> {
        self.state
            .lock()
            .map_err(|_| CatalogError::Internal("catalog lock poisoned".into()))
    }

    fn persist(&self, data: &CatalogData) -> Result<(), CatalogError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CATALOG_MAGIC.to_le_bytes());
        buf.push(CATALOG_VERSION);
        data.encode_to(&mut buf)?;

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        let path = self.data_dir.join(CATALOG_FILE);
        let tmp = self.data_dir.join(format!("{CATALOG_FILE}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        File::open(&self.data_dir)?.sync_all()?;
        Ok(())
    }

    fn write_collection_mirror(
        &self,
        database: &str,
        meta: &CollectionMeta,
    ) -> Result<(), CatalogError> {
        let dir = self
            .data_dir
            .join(crate::engine::DB_DIR)
            .join(database)
            .join(&meta.name);
        fs::create_dir_all(&dir)?;

        let mut buf = encoding::encode_to_vec(meta)?;
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        let path = dir.join(COLLECTION_META_FILE);
        let tmp = dir.join(format!("{COLLECTION_META_FILE}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        File::open(&dir)?.sync_all()?;
        Ok(())
    }
}

fn decode_snapshot(bytes: &[u8]) -> Result<CatalogData, CatalogError> {
    if bytes.len() < 9 {
        return Err(CatalogError::Corrupt("snapshot too short".into()));
    }

    let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(
        crc_bytes
            .try_into()
            .map_err(|_| CatalogError::Internal("split_at produced wrong tail".into()))?,
    );
    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(CatalogError::Corrupt("checksum mismatch".into()));
    }

    let magic = u32::from_le_bytes(
        payload[..4]
            .try_into()
            .map_err(|_| CatalogError::Internal("short magic".into()))?,
    );
    if magic != CATALOG_MAGIC {
        return Err(CatalogError::Corrupt(format!("bad magic 0x{magic:08X}")));
    }
    if payload[4] != CATALOG_VERSION {
        return Err(CatalogError::Corrupt(format!(
            "unsupported version {}",
            payload[4]
        )));
    }

    let (data, _) = CatalogData::decode_from(&payload[5..])?;
    Ok(data)
}
