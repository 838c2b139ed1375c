//! Query pipelines evaluated against live records of either backend.

mod common;

use serde_json::{Value, json};
use tessera_storage::{Condition, ConditionType, Direction, Predicate, StorageError};

use common::{BACKENDS, ids, open, users};

#[tokio::test]
async fn test_filter_and_sort_by_city() {
    for backend in BACKENDS {
        let storage = open(backend).await;
        storage.bulk_put("users", users(), None).await.unwrap();

        let parisians = storage
            .query("users")
            .unwrap()
            .equals("city", "Paris")
            .order_by("age", Direction::Desc)
            .to_vec()
            .await
            .unwrap();

        assert_eq!(ids(&parisians), vec![3, 1], "{backend}");
    }
}

#[tokio::test]
async fn test_both_backends_agree() {
    let mut results: Vec<Vec<Value>> = Vec::new();
    for backend in BACKENDS {
        let storage = open(backend).await;
        // Insertion order differs from key order on purpose.
        let mut records = users();
        records.reverse();
        storage.bulk_put("users", records, None).await.unwrap();

        let out = storage
            .query("users")
            .unwrap()
            .above("age", 26)
            .order_by("name", Direction::Asc)
            .page(1, 2)
            .to_vec()
            .await
            .unwrap();
        results.push(out);
    }

    assert_eq!(results[0], results[1]);
    assert_eq!(ids(&results[0]), vec![1, 3]);
}

#[tokio::test]
async fn test_ascending_reversed_equals_descending() {
    for backend in BACKENDS {
        let storage = open(backend).await;
        storage.bulk_put("users", users(), None).await.unwrap();
        let query = storage.query("users").unwrap();

        let asc = query.clone().order_by("age", Direction::Asc).to_vec().await.unwrap();
        let again = query.clone().order_by("age", Direction::Asc).to_vec().await.unwrap();
        let mut reversed = asc.clone();
        reversed.reverse();
        let desc = query.order_by("age", Direction::Desc).to_vec().await.unwrap();

        assert_eq!(asc, again, "{backend}");
        assert_eq!(reversed, desc, "{backend}");
    }
}

#[tokio::test]
async fn test_descending_mirrors_ascending_on_ties() {
    for backend in BACKENDS {
        let storage = open(backend).await;
        let mut records = users();
        records.push(json!({ "id": 5, "name": "Emil", "age": 30, "city": "Oslo" }));
        records.push(json!({ "id": 6, "name": "Fatou", "age": 25, "city": "Dakar" }));
        storage.bulk_put("users", records, None).await.unwrap();
        let query = storage.query("users").unwrap();

        let mut reversed = query.clone().order_by("age", Direction::Asc).to_vec().await.unwrap();
        reversed.reverse();
        let desc = query.order_by("age", Direction::Desc).to_vec().await.unwrap();

        assert_eq!(reversed, desc, "{backend}");
        assert_eq!(ids(&desc), vec![3, 5, 1, 4, 6, 2], "{backend}");
    }
}

#[tokio::test]
async fn test_pagination_walks_every_record_once() {
    let storage = open(tessera_storage::BackendKind::Flat).await;
    let records: Vec<Value> = (1..=7).map(|i| json!({ "id": i, "age": 20 + i })).collect();
    storage.bulk_put("users", records, None).await.unwrap();

    let mut seen = Vec::new();
    for page in 1..=4 {
        let chunk = storage
            .query("users")
            .unwrap()
            .order_by("age", Direction::Asc)
            .page(page, 2)
            .to_vec()
            .await
            .unwrap();
        seen.extend(ids(&chunk));
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7]);
}

#[tokio::test]
async fn test_predicate_combinators() {
    for backend in BACKENDS {
        let storage = open(backend).await;
        storage.bulk_put("users", users(), None).await.unwrap();

        let out = storage
            .query("users")
            .unwrap()
            .or([
                Predicate::equals("city", "Berlin"),
                Predicate::below("age", 26),
            ])
            .not(Predicate::starts_with("name", "B"))
            .to_vec()
            .await
            .unwrap();

        assert_eq!(ids(&out), vec![4], "{backend}");
    }
}

#[tokio::test]
async fn test_aggregates() {
    for backend in BACKENDS {
        let storage = open(backend).await;
        storage.bulk_put("users", users(), None).await.unwrap();
        let query = storage.query("users").unwrap();

        assert_eq!(query.sum("age").await.unwrap(), 118.0, "{backend}");
        assert_eq!(query.min("age").await.unwrap(), Some(25.0), "{backend}");
        assert_eq!(query.max("age").await.unwrap(), Some(35.0), "{backend}");
        assert_eq!(query.average("age").await.unwrap(), Some(29.5), "{backend}");
    }
}

#[tokio::test]
async fn test_aggregate_over_text_fails() {
    let storage = open(tessera_storage::BackendKind::Indexed).await;
    storage.bulk_put("users", users(), None).await.unwrap();

    let err = storage.query("users").unwrap().sum("name").await.unwrap_err();
    assert!(matches!(err, StorageError::Aggregate { .. }), "{err}");
}

#[tokio::test]
async fn test_group_by_city() {
    for backend in BACKENDS {
        let storage = open(backend).await;
        storage.bulk_put("users", users(), None).await.unwrap();

        let groups = storage.query("users").unwrap().group_by("city").await.unwrap();
        let keys: Vec<&str> = groups.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["Berlin", "London", "Paris"], "{backend}");
        assert_eq!(groups["Paris"].len(), 2, "{backend}");
    }
}

#[tokio::test]
async fn test_modify_does_not_write_back() {
    for backend in BACKENDS {
        let storage = open(backend).await;
        storage.bulk_put("users", users(), None).await.unwrap();

        let renamed = storage
            .query("users")
            .unwrap()
            .equals("id", 1)
            .modify(|mut record| {
                record["name"] = json!("ALICE");
                record
            })
            .first()
            .await
            .unwrap();

        assert_eq!(renamed.unwrap()["name"], "ALICE", "{backend}");
        assert_eq!(
            storage.get("users", 1).await.unwrap().unwrap()["name"],
            "Alice",
            "{backend}"
        );
    }
}

#[tokio::test]
async fn test_fuzzy_search_tolerates_typos() {
    for backend in BACKENDS {
        let storage = open(backend).await;
        storage.bulk_put("users", users(), None).await.unwrap();

        let found = storage.query("users").unwrap().search("Dmitry", 0.8).to_vec().await.unwrap();
        assert_eq!(ids(&found), vec![4], "{backend}");
    }
}

#[tokio::test]
async fn test_conditions_from_json() {
    for backend in BACKENDS {
        let storage = open(backend).await;
        storage.bulk_put("users", users(), None).await.unwrap();

        let conditions: Vec<Condition> = serde_json::from_value(json!([
            { "field": "age", "type": "between", "value": [26, 35] },
            { "field": "city", "type": "anyOf", "value": ["Paris", "Berlin"] },
        ]))
        .unwrap();

        let out = storage
            .query("users")
            .unwrap()
            .build(conditions)
            .unwrap()
            .order_by("id", Direction::Asc)
            .to_vec()
            .await
            .unwrap();
        assert_eq!(ids(&out), vec![1, 3, 4], "{backend}");
    }
}

#[tokio::test]
async fn test_malformed_condition_is_rejected() {
    let storage = open(tessera_storage::BackendKind::Flat).await;
    let bad = Condition::new("age", ConditionType::Between, json!(5));
    assert!(matches!(
        storage.query("users").unwrap().build([bad]),
        Err(StorageError::InvalidQuery(_))
    ));
}
