//! Tombstone semantics.

#[cfg(test)]
mod tests {
    use crate::engine::Engine;
    use crate::engine::tests::helpers::*;
    use tempfile::TempDir;

    #[test]
    fn delete_then_get_is_none() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(memtable_only_config(tmp.path())).unwrap();

        engine.put(key("k"), b"v".to_vec()).unwrap();
        engine.delete(key("k")).unwrap();
        assert_eq!(engine.get(&key("k")).unwrap(), None);
        engine.close().unwrap();
    }

    #[test]
    fn delete_of_missing_key_still_assigns_seq() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(memtable_only_config(tmp.path())).unwrap();

        let seq = engine.delete(key("ghost")).unwrap();
        assert!(seq > 0);
        assert_eq!(engine.get(&key("ghost")).unwrap(), None);
        engine.close().unwrap();
    }

    #[test]
    fn tombstone_masks_value_in_runs() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_runs(tmp.path(), 100);

        // Value sits in an SSTable; tombstone goes to the memtable.
        engine.delete(key("id00042")).unwrap();
        assert_eq!(engine.get(&key("id00042")).unwrap(), None);

        // And survives its own flush.
        engine.flush_all().unwrap();
        assert_eq!(engine.get(&key("id00042")).unwrap(), None);
        engine.close().unwrap();
    }

    #[test]
    fn put_after_delete_resurrects() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(memtable_only_config(tmp.path())).unwrap();

        engine.put(key("k"), b"v1".to_vec()).unwrap();
        engine.delete(key("k")).unwrap();
        engine.put(key("k"), b"v2".to_vec()).unwrap();

        assert_eq!(engine.get(&key("k")).unwrap(), Some(b"v2".to_vec()));
        engine.close().unwrap();
    }

    #[test]
    fn deleted_rows_are_absent_from_scans() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(memtable_only_config(tmp.path())).unwrap();

        for i in 0..10 {
            engine.put(key(&format!("id{i}")), b"v".to_vec()).unwrap();
        }
        engine.delete(key("id4")).unwrap();
        engine.delete(key("id7")).unwrap();

        let (start, end) = items_range();
        let rows = engine.scan(&start, &end, usize::MAX).unwrap();
        assert_eq!(rows.len(), 8);
        assert!(!rows.iter().any(|(k, _)| k == &key("id4") || k == &key("id7")));
        engine.close().unwrap();
    }
}
