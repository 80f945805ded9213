//! Document store — the semantic layer the dispatcher talks to.
//!
//! Binds the [`Catalog`] (what exists), the [`Engine`] (where bytes
//! live), and the per-collection vector indexes into document-level
//! operations: CREATE with id generation and conflict detection, READ,
//! shallow-merge UPDATE, DELETE, filtered QUERY, vector search, and
//! batched writes.
//!
//! ## Documents and collections
//!
//! A document is a string-keyed [`Value`] map. `_id` is the primary key;
//! omitted on CREATE, one is generated. Field names starting with `_`
//! are otherwise reserved and rejected. Plain collections are created
//! implicitly on first write; vector-enabled collections are created
//! through [`Store::create_collection`], where the dimension is fixed.
//!
//! In a vector-enabled collection every document carries a `vector`
//! field — a list of exactly *d* numbers. It is an ordinary data field
//! (it is stored and returned like any other); the store mirrors it into
//! the collection's ANN index on every write and removes it on delete,
//! keeping the index and the document set in agreement.
//!
//! ## Updates are shallow
//!
//! UPDATE merges top-level fields only: scalars overwrite, nested maps
//! replace wholesale. CREATE stores the full document. This asymmetry is
//! part of the external contract.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogError, CollectionMeta};
use crate::config::Config;
use crate::encoding::EncodingError;
use crate::engine::{BatchOp, Engine, EngineConfig, EngineError};
use crate::value::{
    self, Document, Value, collection_end, collection_prefix, record_key, valid_name,
};
use crate::vector::{
    AnnIndex, HnswParams, IndexKind, Metric, VEC_DIR, VectorError, load_index, new_index,
    save_index,
};
use crate::wal::EntryKind;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by document-level operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed or semantically invalid request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Referenced database or collection does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// CREATE with an `_id` that already exists, or a duplicate entity.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Vector length disagrees with the collection dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Collection dimension.
        expected: usize,
        /// Offending length.
        actual: usize,
    },

    /// Storage engine failure.
    #[error("storage error: {0}")]
    Storage(#[from] EngineError),

    /// Catalog failure.
    #[error("catalog error: {0}")]
    Catalog(CatalogError),

    /// Stored document bytes failed to decode.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CatalogError> for StoreError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::AlreadyExists { what, name } => {
                StoreError::AlreadyExists(format!("{what} '{name}'"))
            }
            CatalogError::NotFound { what, name } => {
                StoreError::NotFound(format!("{what} '{name}'"))
            }
            CatalogError::Invalid(detail) => StoreError::BadRequest(detail),
            other => StoreError::Catalog(other),
        }
    }
}

impl From<VectorError> for StoreError {
    fn from(e: VectorError) -> Self {
        match e {
            VectorError::DimensionMismatch { expected, actual } => {
                StoreError::DimensionMismatch { expected, actual }
            }
            other => StoreError::Internal(other.to_string()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Batch items
// ------------------------------------------------------------------------------------------------

/// One operation inside [`Store::batch_write`].
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Put or Delete.
    pub kind: EntryKind,
    /// Document id.
    pub id: String,
    /// Full document for puts; `None` for deletes.
    pub data: Option<Document>,
}

/// One vector search hit joined with its document.
#[derive(Debug)]
pub struct VectorHit {
    /// Document id.
    pub id: String,
    /// Distance under the collection metric.
    pub distance: f32,
    /// The document, fetched from the store.
    pub document: Document,
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

type SharedIndex = Arc<RwLock<Box<dyn AnnIndex>>>;

/// The document store. See the [module docs](self).
pub struct Store {
    config: Config,
    catalog: Catalog,
    engine: Engine,
    vectors: RwLock<HashMap<(String, String), SharedIndex>>,
    hnsw_params: HnswParams,
}

impl Store {
    /// Opens the store: catalog (fatal on corruption), engine (WAL replay
    /// + run discovery), and every vector-enabled collection's index
    /// (snapshot when present and sound, rebuilt from documents
    /// otherwise). Seeds a default `admin` user on a fresh catalog when
    /// authentication is required.
    pub fn open(config: Config) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.data_dir).map_err(EngineError::Io)?;

        let catalog = Catalog::open(&config.data_dir)?;
        let engine = Engine::open(EngineConfig::from(&config))?;

        if config.auth_required && !catalog.has_users()? {
            warn!("no users provisioned; seeding default 'admin' credentials");
            catalog.add_user("admin", "admin")?;
        }

        let hnsw_params = HnswParams {
            m: config.vector_hnsw_m,
            ef_construction: config.vector_hnsw_ef_construction,
            ef_search: config.vector_hnsw_ef_search,
        };

        let store = Self {
            config,
            catalog,
            engine,
            vectors: RwLock::new(HashMap::new()),
            hnsw_params,
        };
        store.load_vector_indexes()?;
        Ok(store)
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying storage engine (used by benchmarks and tests).
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Checks login credentials.
    pub fn verify_credentials(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        Ok(self.catalog.verify_user(username, password)?)
    }

    /// Adds a user (embedded API; there is no wire operation for this).
    pub fn add_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        Ok(self.catalog.add_user(username, password)?)
    }

    /// Persists vector snapshots and shuts the engine down cleanly.
    pub fn close(&self) -> Result<(), StoreError> {
        self.persist_vector_indexes();
        self.engine.close()?;
        info!("store closed");
        Ok(())
    }

    // ----------------------------------------------------------------
    // Catalog operations
    // ----------------------------------------------------------------

    /// Creates a database.
    pub fn create_database(&self, name: &str) -> Result<(), StoreError> {
        Ok(self.catalog.create_database(name)?)
    }

    /// Drops a database and all its collections.
    pub fn drop_database(&self, name: &str) -> Result<(), StoreError> {
        let dropped = self.catalog.drop_database(name)?;
        for meta in dropped {
            self.cascade_drop_collection(name, &meta)?;
        }
        Ok(())
    }

    /// Creates a collection explicitly. A `vector_dimensions` of
    /// `Some(d)` materializes an empty vector index with the given
    /// metric and kind.
    pub fn create_collection(
        &self,
        database: &str,
        name: &str,
        vector_dimensions: Option<u32>,
        metric: Metric,
        kind: IndexKind,
    ) -> Result<(), StoreError> {
        let meta = CollectionMeta {
            name: name.to_string(),
            vector_dimensions,
            vector_metric: metric,
            vector_index_kind: kind,
        };
        self.catalog.create_collection(database, meta)?;

        if let Some(dim) = vector_dimensions {
            let index = new_index(kind, dim as usize, metric, &self.hnsw_params);
            self.write_vectors()?.insert(
                (database.to_string(), name.to_string()),
                Arc::new(RwLock::new(index)),
            );
        }
        Ok(())
    }

    /// Drops a collection, its documents, and its vector index.
    pub fn drop_collection(&self, database: &str, name: &str) -> Result<(), StoreError> {
        let meta = self.catalog.drop_collection(database, name)?;
        self.cascade_drop_collection(database, &meta)
    }

    fn cascade_drop_collection(
        &self,
        database: &str,
        meta: &CollectionMeta,
    ) -> Result<(), StoreError> {
        self.write_vectors()?
            .remove(&(database.to_string(), meta.name.clone()));

        let vec_dir = self.collection_dir(database, &meta.name).join(VEC_DIR);
        if vec_dir.exists()
            && let Err(e) = std::fs::remove_dir_all(&vec_dir)
        {
            warn!(error = %e, "vector dir removal failed");
        }

        // Tombstone every document; the masked run data ages out through
        // compaction.
        let start = collection_prefix(database, &meta.name);
        let end = collection_end(database, &meta.name);
        loop {
            let rows = self.engine.scan(&start, &end, 1000)?;
            if rows.is_empty() {
                break;
            }
            let ops: Vec<BatchOp> = rows
                .into_iter()
                .map(|(key, _)| BatchOp {
                    kind: EntryKind::Delete,
                    key,
                    value: Vec::new(),
                })
                .collect();
            self.engine.batch_write(ops)?;
        }
        info!(database, collection = %meta.name, "collection dropped");
        Ok(())
    }

    // ----------------------------------------------------------------
    // Document operations
    // ----------------------------------------------------------------

    /// Inserts a full document. A missing `_id` gets a generated one;
    /// an explicit `_id` that already exists is a conflict with no side
    /// effect. Returns the document id.
    pub fn create_document(
        &self,
        database: &str,
        collection: &str,
        mut doc: Document,
    ) -> Result<String, StoreError> {
        let meta = self.resolve_collection(database, collection, true)?;
        validate_field_names(&doc)?;

        let id = match doc.get("_id") {
            Some(Value::Str(id)) if !id.is_empty() => id.clone(),
            Some(Value::Str(_)) => {
                return Err(StoreError::BadRequest("_id must be non-empty".into()));
            }
            Some(other) => {
                return Err(StoreError::BadRequest(format!(
                    "_id must be a string, got {}",
                    other.type_name()
                )));
            }
            None => {
                let id = generate_id();
                doc.insert("_id".to_string(), Value::Str(id.clone()));
                id
            }
        };

        let key = record_key(database, collection, &id);
        if self.engine.get(&key)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("document '{id}'")));
        }

        // Validate the vector before any side effect lands.
        let vector = match &meta {
            Some(meta) if meta.is_vector_enabled() => Some(extract_vector(&doc, meta)?),
            _ => None,
        };

        self.engine.put(key, value::pack_document(&doc)?)?;

        if let Some(vector) = vector
            && let Some(index) = self.index_for(database, collection)?
        {
            index
                .write()
                .map_err(|_| StoreError::Internal("vector index lock poisoned".into()))?
                .add(&id, &vector)?;
        }

        debug!(database, collection, id = %id, "document created");
        Ok(id)
    }

    /// Fetches a document by id.
    pub fn read_document(
        &self,
        database: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        self.resolve_collection(database, collection, false)?;
        let key = record_key(database, collection, id);
        match self.engine.get(&key)? {
            Some(bytes) => Ok(Some(value::unpack_document(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Shallow-merges `updates` into an existing document: top-level
    /// scalars overwrite, nested maps replace wholesale. Returns `false`
    /// when the document does not exist. `_id` cannot be changed.
    pub fn update_document(
        &self,
        database: &str,
        collection: &str,
        id: &str,
        updates: Document,
    ) -> Result<bool, StoreError> {
        let meta = self.resolve_collection(database, collection, false)?;
        if updates.contains_key("_id") {
            return Err(StoreError::BadRequest("_id cannot be updated".into()));
        }
        validate_field_names(&updates)?;

        let key = record_key(database, collection, id);
        let Some(bytes) = self.engine.get(&key)? else {
            return Ok(false);
        };
        let mut doc = value::unpack_document(&bytes)?;

        let vector_changed = updates.contains_key("vector");
        for (field, new_value) in updates {
            doc.insert(field, new_value);
        }

        let vector = match &meta {
            Some(meta) if meta.is_vector_enabled() && vector_changed => {
                Some(extract_vector(&doc, meta)?)
            }
            _ => None,
        };

        self.engine.put(key, value::pack_document(&doc)?)?;

        if let Some(vector) = vector
            && let Some(index) = self.index_for(database, collection)?
        {
            index
                .write()
                .map_err(|_| StoreError::Internal("vector index lock poisoned".into()))?
                .add(id, &vector)?;
        }

        debug!(database, collection, id, "document updated");
        Ok(true)
    }

    /// Deletes a document. Returns `false` when it does not exist.
    pub fn delete_document(
        &self,
        database: &str,
        collection: &str,
        id: &str,
    ) -> Result<bool, StoreError> {
        self.resolve_collection(database, collection, false)?;
        let key = record_key(database, collection, id);
        if self.engine.get(&key)?.is_none() {
            return Ok(false);
        }

        self.engine.delete(key)?;

        if let Some(index) = self.index_for(database, collection)? {
            index
                .write()
                .map_err(|_| StoreError::Internal("vector index lock poisoned".into()))?
                .remove(id);
        }

        debug!(database, collection, id, "document deleted");
        Ok(true)
    }

    /// Runs a filtered query. `filters` is the request's constraint map;
    /// constraints AND together. `_id` range constraints bound the
    /// underlying key scan; everything else is evaluated per document.
    /// A `limit` of `None` returns every match.
    pub fn query(
        &self,
        database: &str,
        collection: &str,
        filters: &BTreeMap<String, Value>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        self.resolve_collection(database, collection, false)?;
        let constraints = parse_filters(filters)?;

        let (start, end) = scan_bounds(database, collection, &constraints);
        let limit = limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }

        // When every constraint is an _id range (those are fully encoded
        // in the scan bounds), the engine-side limit is exact; otherwise
        // over-fetch and filter. `$in` on _id is not a range.
        let id_only = constraints
            .iter()
            .all(|(field, c)| field == "_id" && !matches!(c, Constraint::In(_)));
        let engine_limit = if id_only { limit } else { usize::MAX };

        let rows = self.engine.scan(&start, &end, engine_limit)?;

        let mut out = Vec::new();
        for (_, bytes) in rows {
            let doc = value::unpack_document(&bytes)?;
            if matches_constraints(&doc, &constraints) {
                out.push(doc);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// k-nearest-neighbour search over a vector-enabled collection,
    /// joining each hit with its document.
    pub fn vector_search(
        &self,
        database: &str,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        let meta = self
            .resolve_collection(database, collection, false)?
            .ok_or_else(|| StoreError::NotFound(format!("collection '{collection}'")))?;
        if !meta.is_vector_enabled() {
            return Err(StoreError::BadRequest(format!(
                "collection '{collection}' has no vector index"
            )));
        }

        let index = self
            .index_for(database, collection)?
            .ok_or_else(|| StoreError::Internal("vector index missing".into()))?;
        let neighbors = index
            .read()
            .map_err(|_| StoreError::Internal("vector index lock poisoned".into()))?
            .search(query, k)?;

        let mut hits = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            match self.read_document(database, collection, &neighbor.id)? {
                Some(document) => hits.push(VectorHit {
                    id: neighbor.id,
                    distance: neighbor.distance,
                    document,
                }),
                None => {
                    warn!(id = %neighbor.id, "vector hit without document skipped");
                }
            }
        }
        Ok(hits)
    }

    /// Applies a batch of puts/deletes as one engine group commit.
    /// Returns the number of operations applied.
    pub fn batch_write(
        &self,
        database: &str,
        collection: &str,
        items: Vec<BatchItem>,
    ) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Err(StoreError::BadRequest("empty batch".into()));
        }
        let meta = self.resolve_collection(database, collection, true)?;

        // Validate everything (field names, vectors) before any effect.
        let mut vector_ops: Vec<(String, Option<Vec<f32>>)> = Vec::new();
        let mut ops = Vec::with_capacity(items.len());
        for item in items {
            match item.kind {
                EntryKind::Put => {
                    let mut doc = item.data.ok_or_else(|| {
                        StoreError::BadRequest("put without document data".into())
                    })?;
                    validate_field_names(&doc)?;
                    doc.insert("_id".to_string(), Value::Str(item.id.clone()));

                    if let Some(meta) = &meta
                        && meta.is_vector_enabled()
                    {
                        vector_ops.push((item.id.clone(), Some(extract_vector(&doc, meta)?)));
                    }
                    ops.push(BatchOp {
                        kind: EntryKind::Put,
                        key: record_key(database, collection, &item.id),
                        value: value::pack_document(&doc)?,
                    });
                }
                EntryKind::Delete => {
                    if meta.as_ref().is_some_and(CollectionMeta::is_vector_enabled) {
                        vector_ops.push((item.id.clone(), None));
                    }
                    ops.push(BatchOp {
                        kind: EntryKind::Delete,
                        key: record_key(database, collection, &item.id),
                        value: Vec::new(),
                    });
                }
            }
        }

        let count = ops.len();
        self.engine.batch_write(ops)?;

        if !vector_ops.is_empty()
            && let Some(index) = self.index_for(database, collection)?
        {
            let mut index = index
                .write()
                .map_err(|_| StoreError::Internal("vector index lock poisoned".into()))?;
            for (id, vector) in vector_ops {
                match vector {
                    Some(v) => index.add(&id, &v)?,
                    None => {
                        index.remove(&id);
                    }
                }
            }
        }

        debug!(database, collection, count, "batch applied");
        Ok(count)
    }

    // ----------------------------------------------------------------
    // Internals
    // ----------------------------------------------------------------

    /// Validates names, checks the database, and returns the collection
    /// metadata. With `create_if_missing`, an absent collection is
    /// auto-created as a plain document collection.
    fn resolve_collection(
        &self,
        database: &str,
        collection: &str,
        create_if_missing: bool,
    ) -> Result<Option<CollectionMeta>, StoreError> {
        if !valid_name(database) {
            return Err(StoreError::BadRequest(format!(
                "invalid database name {database:?}"
            )));
        }
        if !valid_name(collection) {
            return Err(StoreError::BadRequest(format!(
                "invalid collection name {collection:?}"
            )));
        }
        if !self.catalog.database_exists(database)? {
            return Err(StoreError::NotFound(format!("database '{database}'")));
        }

        match self.catalog.collection(database, collection)? {
            Some(meta) => Ok(Some(meta)),
            None if create_if_missing => {
                let meta = CollectionMeta {
                    name: collection.to_string(),
                    vector_dimensions: None,
                    vector_metric: Metric::default(),
                    vector_index_kind: IndexKind::default(),
                };
                match self.catalog.create_collection(database, meta.clone()) {
                    Ok(()) => {}
                    // Another connection may have won the race.
                    Err(CatalogError::AlreadyExists { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    fn index_for(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Option<SharedIndex>, StoreError> {
        Ok(self
            .vectors
            .read()
            .map_err(|_| StoreError::Internal("vectors lock poisoned".into()))?
            .get(&(database.to_string(), collection.to_string()))
            .cloned())
    }

    fn write_vectors(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<(String, String), SharedIndex>>, StoreError>
    {
        self.vectors
            .write()
            .map_err(|_| StoreError::Internal("vectors lock poisoned".into()))
    }

    fn collection_dir(&self, database: &str, collection: &str) -> std::path::PathBuf {
        self.config
            .data_dir
            .join(crate::engine::DB_DIR)
            .join(database)
            .join(collection)
    }

    fn index_path(&self, database: &str, collection: &str) -> std::path::PathBuf {
        self.collection_dir(database, collection)
            .join(VEC_DIR)
            .join(crate::vector::INDEX_FILE)
    }

    fn load_vector_indexes(&self) -> Result<(), StoreError> {
        let mut loaded = HashMap::new();

        for database in self.list_databases()? {
            for collection in self.catalog.list_collections(&database)? {
                let Some(meta) = self.catalog.collection(&database, &collection)? else {
                    continue;
                };
                let Some(dim) = meta.vector_dimensions else {
                    continue;
                };

                let path = self.index_path(&database, &collection);
                let index = match load_index(&path, dim as usize, &self.hnsw_params) {
                    Ok(index) => index,
                    Err(e) => {
                        if path.exists() {
                            warn!(
                                database,
                                collection,
                                error = %e,
                                "vector snapshot unusable; rebuilding from documents"
                            );
                        }
                        self.rebuild_index(&database, &meta)?
                    }
                };
                loaded.insert((database.clone(), collection.clone()), {
                    Arc::new(RwLock::new(index))
                });
            }
        }

        *self.write_vectors()? = loaded;
        Ok(())
    }

    fn rebuild_index(
        &self,
        database: &str,
        meta: &CollectionMeta,
    ) -> Result<Box<dyn AnnIndex>, StoreError> {
        let dim = meta
            .vector_dimensions
            .ok_or_else(|| StoreError::Internal("rebuild on non-vector collection".into()))?;
        let mut index = new_index(
            meta.vector_index_kind,
            dim as usize,
            meta.vector_metric,
            &self.hnsw_params,
        );

        let start = collection_prefix(database, &meta.name);
        let end = collection_end(database, &meta.name);
        let rows = self.engine.scan(&start, &end, usize::MAX)?;
        let mut count = 0usize;
        for (_, bytes) in rows {
            let doc = value::unpack_document(&bytes)?;
            let Some(Value::Str(id)) = doc.get("_id") else {
                continue;
            };
            match extract_vector(&doc, meta) {
                Ok(vector) => {
                    index.add(id, &vector)?;
                    count += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "document without usable vector skipped in rebuild");
                }
            }
        }
        info!(
            database,
            collection = meta.name,
            vectors = count,
            "vector index rebuilt"
        );
        Ok(index)
    }

    fn persist_vector_indexes(&self) {
        let Ok(vectors) = self.vectors.read() else {
            warn!("vectors lock poisoned; skipping snapshots");
            return;
        };
        for ((database, collection), index) in vectors.iter() {
            let path = self.index_path(database, collection);
            let Ok(index) = index.read() else {
                warn!(database = %database, collection = %collection, "index lock poisoned; snapshot skipped");
                continue;
            };
            if let Err(e) = save_index(&path, index.as_ref()) {
                warn!(database = %database, collection = %collection, error = %e, "vector snapshot failed");
            }
        }
    }

    fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.catalog.database_names()?)
    }
}

// ------------------------------------------------------------------------------------------------
// Documents and filters
// ------------------------------------------------------------------------------------------------

fn generate_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

fn validate_field_names(doc: &Document) -> Result<(), StoreError> {
    for field in doc.keys() {
        if field.starts_with('_') && field != "_id" {
            return Err(StoreError::BadRequest(format!(
                "field name '{field}' is reserved"
            )));
        }
    }
    Ok(())
}

/// Pulls the `vector` field out of a document in a vector-enabled
/// collection and checks its dimension.
fn extract_vector(doc: &Document, meta: &CollectionMeta) -> Result<Vec<f32>, StoreError> {
    let expected = meta.vector_dimensions.unwrap_or(0) as usize;

    let list = match doc.get("vector") {
        Some(Value::List(items)) => items,
        Some(other) => {
            return Err(StoreError::BadRequest(format!(
                "'vector' must be a list of numbers, got {}",
                other.type_name()
            )));
        }
        None => {
            return Err(StoreError::BadRequest(
                "documents in a vector collection require a 'vector' field".into(),
            ));
        }
    };

    let mut vector = Vec::with_capacity(list.len());
    for item in list {
        match item.as_f64() {
            Some(v) => vector.push(v as f32),
            None => {
                return Err(StoreError::BadRequest(format!(
                    "'vector' elements must be numbers, got {}",
                    item.type_name()
                )));
            }
        }
    }

    if vector.len() != expected {
        return Err(StoreError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(vector)
}

/// One parsed field constraint.
#[derive(Debug, Clone)]
enum Constraint {
    Eq(Value),
    Gte(Value),
    Gt(Value),
    Lte(Value),
    Lt(Value),
    In(Vec<Value>),
}

/// Parses the wire filter map. A field maps either to an exact value or
/// to an operator map; unknown operators are a client error.
fn parse_filters(
    filters: &BTreeMap<String, Value>,
) -> Result<Vec<(String, Constraint)>, StoreError> {
    let mut constraints = Vec::new();
    for (field, spec) in filters {
        match spec {
            Value::Map(ops) => {
                for (op, operand) in ops {
                    let constraint = match op.as_str() {
                        "$gte" => Constraint::Gte(operand.clone()),
                        "$gt" => Constraint::Gt(operand.clone()),
                        "$lte" => Constraint::Lte(operand.clone()),
                        "$lt" => Constraint::Lt(operand.clone()),
                        "$in" => match operand {
                            Value::List(items) => Constraint::In(items.clone()),
                            other => {
                                return Err(StoreError::BadRequest(format!(
                                    "$in requires a list, got {}",
                                    other.type_name()
                                )));
                            }
                        },
                        unknown => {
                            return Err(StoreError::BadRequest(format!(
                                "unknown operator '{unknown}'"
                            )));
                        }
                    };
                    constraints.push((field.clone(), constraint));
                }
            }
            exact => constraints.push((field.clone(), Constraint::Eq(exact.clone()))),
        }
    }
    Ok(constraints)
}

/// Derives the key-scan bounds from `_id` constraints.
fn scan_bounds(
    database: &str,
    collection: &str,
    constraints: &[(String, Constraint)],
) -> (Vec<u8>, Vec<u8>) {
    let mut start = collection_prefix(database, collection);
    let mut end = collection_end(database, collection);

    for (field, constraint) in constraints {
        if field != "_id" {
            continue;
        }
        match constraint {
            Constraint::Eq(Value::Str(id)) => {
                let key = record_key(database, collection, id);
                let mut just_past = key.clone();
                just_past.push(0);
                start = start.max(key);
                end = end.min(just_past);
            }
            Constraint::Gte(Value::Str(id)) => {
                start = start.max(record_key(database, collection, id));
            }
            Constraint::Gt(Value::Str(id)) => {
                let mut key = record_key(database, collection, id);
                key.push(0);
                start = start.max(key);
            }
            Constraint::Lte(Value::Str(id)) => {
                let mut key = record_key(database, collection, id);
                key.push(0);
                end = end.min(key);
            }
            Constraint::Lt(Value::Str(id)) => {
                end = end.min(record_key(database, collection, id));
            }
            _ => {}
        }
    }
    (start, end)
}

fn matches_constraints(doc: &Document, constraints: &[(String, Constraint)]) -> bool {
    constraints.iter().all(|(field, constraint)| {
        let Some(actual) = doc.get(field) else {
            return false;
        };
        match constraint {
            Constraint::Eq(expected) => actual == expected,
            Constraint::Gte(bound) => {
                matches!(actual.compare(bound), Some(o) if o.is_ge())
            }
            Constraint::Gt(bound) => {
                matches!(actual.compare(bound), Some(o) if o.is_gt())
            }
            Constraint::Lte(bound) => {
                matches!(actual.compare(bound), Some(o) if o.is_le())
            }
            Constraint::Lt(bound) => {
                matches!(actual.compare(bound), Some(o) if o.is_lt())
            }
            Constraint::In(allowed) => allowed.contains(actual),
        }
    })
}
