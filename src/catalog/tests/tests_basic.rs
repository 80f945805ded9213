//! Database / collection / user lifecycle.

#[cfg(test)]
mod tests {
    use crate::catalog::{Catalog, CatalogError, CollectionMeta, DEFAULT_DATABASE};
    use crate::vector::{IndexKind, Metric};
    use tempfile::TempDir;

    fn plain_meta(name: &str) -> CollectionMeta {
        CollectionMeta {
            name: name.to_string(),
            vector_dimensions: None,
            vector_metric: Metric::SquaredL2,
            vector_index_kind: IndexKind::Hnsw,
        }
    }

    fn vector_meta(name: &str, dim: u32) -> CollectionMeta {
        CollectionMeta {
            vector_dimensions: Some(dim),
            ..plain_meta(name)
        }
    }

    #[test]
    fn default_database_always_exists() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();
        assert!(catalog.database_exists(DEFAULT_DATABASE).unwrap());
    }

    #[test]
    fn create_and_drop_database() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();

        catalog.create_database("app").unwrap();
        assert!(catalog.database_exists("app").unwrap());

        assert!(matches!(
            catalog.create_database("app"),
            Err(CatalogError::AlreadyExists { .. })
        ));

        catalog.drop_database("app").unwrap();
        assert!(!catalog.database_exists("app").unwrap());
        assert!(matches!(
            catalog.drop_database("app"),
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[test]
    fn dropping_default_database_just_empties_it() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();

        catalog
            .create_collection(DEFAULT_DATABASE, plain_meta("users"))
            .unwrap();
        let dropped = catalog.drop_database(DEFAULT_DATABASE).unwrap();
        assert_eq!(dropped.len(), 1);

        assert!(catalog.database_exists(DEFAULT_DATABASE).unwrap());
        assert!(catalog.list_collections(DEFAULT_DATABASE).unwrap().is_empty());
    }

    #[test]
    fn invalid_names_rejected() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();

        assert!(matches!(
            catalog.create_database(""),
            Err(CatalogError::Invalid(_))
        ));
        assert!(matches!(
            catalog.create_database("with\0nul"),
            Err(CatalogError::Invalid(_))
        ));
        assert!(matches!(
            catalog.create_collection(DEFAULT_DATABASE, plain_meta("")),
            Err(CatalogError::Invalid(_))
        ));
    }

    #[test]
    fn collection_lifecycle_with_cascade_metadata() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();

        catalog
            .create_collection(DEFAULT_DATABASE, vector_meta("embeddings", 128))
            .unwrap();

        let meta = catalog
            .collection(DEFAULT_DATABASE, "embeddings")
            .unwrap()
            .expect("exists");
        assert!(meta.is_vector_enabled());
        assert_eq!(meta.vector_dimensions, Some(128));

        assert!(matches!(
            catalog.create_collection(DEFAULT_DATABASE, plain_meta("embeddings")),
            Err(CatalogError::AlreadyExists { .. })
        ));

        let dropped = catalog.drop_collection(DEFAULT_DATABASE, "embeddings").unwrap();
        assert_eq!(dropped.vector_dimensions, Some(128));
        assert!(catalog.collection(DEFAULT_DATABASE, "embeddings").unwrap().is_none());
    }

    #[test]
    fn vector_dimension_bounds_enforced() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();

        assert!(matches!(
            catalog.create_collection(DEFAULT_DATABASE, vector_meta("zero", 0)),
            Err(CatalogError::Invalid(_))
        ));
        assert!(matches!(
            catalog.create_collection(DEFAULT_DATABASE, vector_meta("huge", 4097)),
            Err(CatalogError::Invalid(_))
        ));
        catalog
            .create_collection(DEFAULT_DATABASE, vector_meta("edge", 4096))
            .unwrap();
    }

    #[test]
    fn collection_in_missing_database_rejected() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();
        assert!(matches!(
            catalog.create_collection("ghost", plain_meta("c")),
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[test]
    fn user_management() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();

        assert!(!catalog.has_users().unwrap());
        catalog.add_user("admin", "secret").unwrap();
        assert!(catalog.has_users().unwrap());

        assert!(catalog.verify_user("admin", "secret").unwrap());
        assert!(!catalog.verify_user("admin", "wrong").unwrap());
        assert!(!catalog.verify_user("ghost", "secret").unwrap());

        assert!(matches!(
            catalog.add_user("admin", "other"),
            Err(CatalogError::AlreadyExists { .. })
        ));
    }
}
