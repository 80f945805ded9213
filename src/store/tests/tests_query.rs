//! QUERY filter sublanguage.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::store::tests::helpers::*;
    use crate::store::{Store, StoreError};
    use crate::value::{Document, Value};
    use tempfile::TempDir;

    fn seed_users(store: &Store) {
        for i in 0..100 {
            let mut d = Document::new();
            d.insert("_id".to_string(), Value::Str(format!("user{i:010}")));
            d.insert("n".to_string(), Value::Int(i));
            d.insert(
                "parity".to_string(),
                Value::Str(if i % 2 == 0 { "even" } else { "odd" }.into()),
            );
            store.create_document("default", "users", d).unwrap();
        }
    }

    fn filters(spec: &[(&str, Value)]) -> BTreeMap<String, Value> {
        spec.iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn op(name: &str, value: Value) -> Value {
        let mut map = BTreeMap::new();
        map.insert(name.to_string(), value);
        Value::Map(map)
    }

    #[test]
    fn empty_filters_return_everything_in_order() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);

        let rows = store
            .query("default", "users", &BTreeMap::new(), None)
            .unwrap();
        assert_eq!(rows.len(), 100);
        let ids: Vec<&str> = rows
            .iter()
            .map(|d| d.get("_id").and_then(Value::as_str).unwrap())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        store.close().unwrap();
    }

    #[test]
    fn empty_collection_queries_empty_not_error() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        let rows = store
            .query("default", "nothing_here", &BTreeMap::new(), None)
            .unwrap();
        assert!(rows.is_empty());
        store.close().unwrap();
    }

    #[test]
    fn id_range_with_limit_matches_spec_scenario() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);

        let f = filters(&[("_id", op("$gte", Value::Str("user0000000050".into())))]);
        let rows = store.query("default", "users", &f, Some(5)).unwrap();

        let ids: Vec<&str> = rows
            .iter()
            .map(|d| d.get("_id").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(
            ids,
            vec![
                "user0000000050",
                "user0000000051",
                "user0000000052",
                "user0000000053",
                "user0000000054"
            ]
        );
        store.close().unwrap();
    }

    #[test]
    fn id_bounds_gt_lt() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);

        let f = filters(&[(
            "_id",
            Value::Map(
                [
                    ("$gt".to_string(), Value::Str("user0000000010".into())),
                    ("$lt".to_string(), Value::Str("user0000000013".into())),
                ]
                .into_iter()
                .collect(),
            ),
        )]);
        let rows = store.query("default", "users", &f, None).unwrap();
        let ids: Vec<&str> = rows
            .iter()
            .map(|d| d.get("_id").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(ids, vec!["user0000000011", "user0000000012"]);
        store.close().unwrap();
    }

    #[test]
    fn exact_match_on_ordinary_field() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);

        let f = filters(&[("parity", Value::Str("even".into()))]);
        let rows = store.query("default", "users", &f, None).unwrap();
        assert_eq!(rows.len(), 50);
        store.close().unwrap();
    }

    #[test]
    fn numeric_range_on_ordinary_field() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);

        let f = filters(&[("n", op("$gte", Value::Int(95)))]);
        let rows = store.query("default", "users", &f, None).unwrap();
        assert_eq!(rows.len(), 5);

        // Float bound against int fields compares numerically.
        let f = filters(&[("n", op("$lt", Value::Float(2.5)))]);
        let rows = store.query("default", "users", &f, None).unwrap();
        assert_eq!(rows.len(), 3);
        store.close().unwrap();
    }

    #[test]
    fn filters_compose_with_and() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);

        let f = filters(&[
            ("parity", Value::Str("odd".into())),
            ("n", op("$lt", Value::Int(10))),
        ]);
        let rows = store.query("default", "users", &f, None).unwrap();
        assert_eq!(rows.len(), 5); // 1,3,5,7,9
        store.close().unwrap();
    }

    #[test]
    fn in_operator_accepts_heterogeneous_lists() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);

        let f = filters(&[(
            "n",
            op(
                "$in",
                Value::List(vec![
                    Value::Int(3),
                    Value::Str("not-a-number".into()),
                    Value::Int(7),
                ]),
            ),
        )]);
        let rows = store.query("default", "users", &f, None).unwrap();
        assert_eq!(rows.len(), 2);
        store.close().unwrap();
    }

    #[test]
    fn unknown_operator_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);

        let f = filters(&[("n", op("$regex", Value::Str(".*".into())))]);
        assert!(matches!(
            store.query("default", "users", &f, None),
            Err(StoreError::BadRequest(_))
        ));
        store.close().unwrap();
    }

    #[test]
    fn missing_field_never_matches() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);

        let f = filters(&[("absent", op("$gte", Value::Int(0)))]);
        assert!(store.query("default", "users", &f, None).unwrap().is_empty());
        store.close().unwrap();
    }

    #[test]
    fn zero_limit_returns_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        seed_users(&store);
        assert!(
            store
                .query("default", "users", &BTreeMap::new(), Some(0))
                .unwrap()
                .is_empty()
        );
        store.close().unwrap();
    }
}
