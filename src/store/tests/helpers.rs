use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::store::Store;
use crate::value::{Document, Value};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Store on a temp dir with auth off (wire auth is covered in the
/// integration tests).
pub fn open_store(dir: &Path) -> Store {
    init_tracing();
    let config = Config {
        data_dir: dir.to_path_buf(),
        auth_required: false,
        ..Config::default()
    };
    Store::open(config).expect("open store")
}

/// `{_id: id, name: name}` document.
pub fn doc(id: &str, name: &str) -> Document {
    let mut doc = Document::new();
    doc.insert("_id".to_string(), Value::Str(id.to_string()));
    doc.insert("name".to_string(), Value::Str(name.to_string()));
    doc
}

/// Document carrying a vector field alongside `_id`.
pub fn vector_doc(id: &str, vector: &[f32]) -> Document {
    let mut doc = Document::new();
    doc.insert("_id".to_string(), Value::Str(id.to_string()));
    doc.insert(
        "vector".to_string(),
        Value::List(vector.iter().map(|&v| Value::Float(v as f64)).collect()),
    );
    doc
}
