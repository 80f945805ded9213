//! Vector collection flows: index maintenance, search, persistence.

#[cfg(test)]
mod tests {
    use crate::store::tests::helpers::*;
    use crate::store::StoreError;
    use crate::value::{Document, Value};
    use crate::vector::{IndexKind, Metric};
    use tempfile::TempDir;

    fn store_with_vector_collection(dir: &std::path::Path, dim: u32) -> crate::store::Store {
        let store = open_store(dir);
        store
            .create_collection("default", "embeddings", Some(dim), Metric::SquaredL2, IndexKind::Hnsw)
            .unwrap();
        store
    }

    #[test]
    fn create_and_search() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_vector_collection(tmp.path(), 3);

        store
            .create_document("default", "embeddings", vector_doc("a", &[0.0, 0.0, 0.0]))
            .unwrap();
        store
            .create_document("default", "embeddings", vector_doc("b", &[1.0, 0.0, 0.0]))
            .unwrap();
        store
            .create_document("default", "embeddings", vector_doc("c", &[5.0, 5.0, 5.0]))
            .unwrap();

        let hits = store
            .vector_search("default", "embeddings", &[0.9, 0.0, 0.0], 2)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "b");
        // The joined document includes the vector field itself.
        assert!(hits[0].document.contains_key("vector"));
        store.close().unwrap();
    }

    #[test]
    fn search_on_empty_index_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_vector_collection(tmp.path(), 4);
        let hits = store
            .vector_search("default", "embeddings", &[0.0; 4], 10)
            .unwrap();
        assert!(hits.is_empty());
        store.close().unwrap();
    }

    #[test]
    fn wrong_dimension_rejected_without_side_effect() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_vector_collection(tmp.path(), 3);

        let err = store
            .create_document("default", "embeddings", vector_doc("bad", &[1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: 3, actual: 2 }
        ));

        // Neither the document nor the vector landed.
        assert!(
            store
                .read_document("default", "embeddings", "bad")
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .vector_search("default", "embeddings", &[1.0, 2.0, 0.0], 10)
                .unwrap()
                .is_empty()
        );
        store.close().unwrap();
    }

    #[test]
    fn document_without_vector_field_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_vector_collection(tmp.path(), 3);

        let mut d = Document::new();
        d.insert("_id".to_string(), Value::Str("x".into()));
        assert!(matches!(
            store.create_document("default", "embeddings", d),
            Err(StoreError::BadRequest(_))
        ));
        store.close().unwrap();
    }

    #[test]
    fn query_vector_dimension_checked() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_vector_collection(tmp.path(), 3);
        store
            .create_document("default", "embeddings", vector_doc("a", &[0.0, 0.0, 0.0]))
            .unwrap();

        assert!(matches!(
            store.vector_search("default", "embeddings", &[0.0; 5], 1),
            Err(StoreError::DimensionMismatch { expected: 3, actual: 5 })
        ));
        store.close().unwrap();
    }

    #[test]
    fn delete_removes_vector_from_index() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_vector_collection(tmp.path(), 2);

        store
            .create_document("default", "embeddings", vector_doc("a", &[1.0, 1.0]))
            .unwrap();
        store.delete_document("default", "embeddings", "a").unwrap();

        assert!(
            store
                .vector_search("default", "embeddings", &[1.0, 1.0], 10)
                .unwrap()
                .is_empty()
        );
        store.close().unwrap();
    }

    #[test]
    fn update_with_new_vector_moves_the_point() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_vector_collection(tmp.path(), 2);

        store
            .create_document("default", "embeddings", vector_doc("a", &[0.0, 0.0]))
            .unwrap();
        store
            .create_document("default", "embeddings", vector_doc("b", &[10.0, 10.0]))
            .unwrap();

        let mut updates = Document::new();
        updates.insert(
            "vector".to_string(),
            Value::List(vec![Value::Float(9.0), Value::Float(9.0)]),
        );
        store
            .update_document("default", "embeddings", "a", updates)
            .unwrap();

        let hits = store
            .vector_search("default", "embeddings", &[9.1, 9.1], 1)
            .unwrap();
        assert_eq!(hits[0].id, "a");
        store.close().unwrap();
    }

    #[test]
    fn vector_search_on_plain_collection_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        store
            .create_document("default", "plain", doc("u1", "A"))
            .unwrap();

        assert!(matches!(
            store.vector_search("default", "plain", &[0.0], 1),
            Err(StoreError::BadRequest(_))
        ));
        store.close().unwrap();
    }

    #[test]
    fn index_restored_from_snapshot_on_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = store_with_vector_collection(tmp.path(), 2);
            store
                .create_document("default", "embeddings", vector_doc("a", &[1.0, 0.0]))
                .unwrap();
            store
                .create_document("default", "embeddings", vector_doc("b", &[0.0, 1.0]))
                .unwrap();
            store.close().unwrap();
        }

        // Snapshot file exists and the reopened index answers correctly.
        assert!(
            tmp.path()
                .join("db")
                .join("default")
                .join("embeddings")
                .join("vec")
                .join("index.bin")
                .exists()
        );

        let store = open_store(tmp.path());
        let hits = store
            .vector_search("default", "embeddings", &[1.0, 0.1], 1)
            .unwrap();
        assert_eq!(hits[0].id, "a");
        store.close().unwrap();
    }

    #[test]
    fn index_rebuilt_when_snapshot_missing() {
        let tmp = TempDir::new().unwrap();
        {
            let store = store_with_vector_collection(tmp.path(), 2);
            store
                .create_document("default", "embeddings", vector_doc("a", &[1.0, 0.0]))
                .unwrap();
            store.close().unwrap();
        }

        let snapshot = tmp
            .path()
            .join("db")
            .join("default")
            .join("embeddings")
            .join("vec")
            .join("index.bin");
        std::fs::remove_file(&snapshot).unwrap();

        let store = open_store(tmp.path());
        let hits = store
            .vector_search("default", "embeddings", &[1.0, 0.0], 1)
            .unwrap();
        assert_eq!(hits[0].id, "a");
        store.close().unwrap();
    }
}
