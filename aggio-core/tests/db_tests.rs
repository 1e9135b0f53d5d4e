// tests/db_tests.rs
//! End-to-end collection behavior through the public API.

use aggio_core::{Db, DbOptions, IndexOptions, RemoveOptions, UpdateOptions};
use serde_json::json;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn memory_db() -> Db {
    Db::create(DbOptions::default()).unwrap()
}

#[test]
fn insert_find_roundtrip() {
    init_logging();
    let db = memory_db();
    let inserted = db
        .insert(json!({"name": "Antonio", "tags": ["admin", "staff"]}))
        .unwrap();
    let id = inserted["_id"].as_str().unwrap().to_string();

    let by_id = db.find_one(json!({"_id": id})).unwrap().unwrap();
    assert_eq!(by_id["name"], json!("Antonio"));

    // Array fields match element-wise and as whole arrays.
    assert_eq!(db.count(json!({"tags": "admin"})).unwrap(), 1);
    assert_eq!(db.count(json!({"tags": ["admin", "staff"]})).unwrap(), 1);
    assert_eq!(db.count(json!({"tags": ["staff", "admin"]})).unwrap(), 0);
}

#[test]
fn batch_insert_is_atomic() {
    let db = memory_db();
    db.ensure_index(IndexOptions {
        field_name: "slug".to_string(),
        unique: true,
        ..Default::default()
    })
    .unwrap();
    db.insert(json!({"slug": "taken"})).unwrap();

    let err = db.insert_many(vec![
        json!({"slug": "fresh-1"}),
        json!({"slug": "taken"}),
        json!({"slug": "fresh-2"}),
    ]);
    assert!(err.is_err());
    assert_eq!(db.count(json!({})).unwrap(), 1);
}

#[test]
fn query_operators_cover_common_cases() {
    let db = memory_db();
    db.insert_many(vec![
        json!({"n": 1, "name": "alpha"}),
        json!({"n": 5, "name": "beta"}),
        json!({"n": 9, "name": "gamma", "extra": null}),
    ])
    .unwrap();

    assert_eq!(db.count(json!({"n": {"$gt": 1, "$lte": 9}})).unwrap(), 2);
    assert_eq!(db.count(json!({"n": {"$ne": 5}})).unwrap(), 2);
    assert_eq!(db.count(json!({"n": {"$in": [1, 9]}})).unwrap(), 2);
    assert_eq!(db.count(json!({"name": {"$regex": "^a"}})).unwrap(), 1);
    assert_eq!(db.count(json!({"extra": {"$exists": false}})).unwrap(), 2);
    assert_eq!(
        db.count(json!({"$or": [{"n": 1}, {"name": "gamma"}]})).unwrap(),
        2
    );
    assert_eq!(
        db.count(json!({"$and": [{"n": {"$gt": 0}}, {"n": {"$lt": 6}}]}))
            .unwrap(),
        2
    );
    assert!(db.count(json!({"n": {"$fancy": 1}})).is_err());
}

#[test]
fn update_modifiers_through_public_api() {
    let db = memory_db();
    db.insert(json!({"name": "cart", "total": 10, "items": ["a"]}))
        .unwrap();

    db.update(
        &json!({"name": "cart"}),
        &json!({"$inc": {"total": 5}, "$push": {"items": "b"}}),
        UpdateOptions::default(),
    )
    .unwrap();
    db.update(
        &json!({"name": "cart"}),
        &json!({"$addToSet": {"items": "b"}, "$setIfNull": {"owner": "none"}}),
        UpdateOptions::default(),
    )
    .unwrap();

    let doc = db.find_one(json!({"name": "cart"})).unwrap().unwrap();
    assert_eq!(doc["total"], json!(15));
    assert_eq!(doc["items"], json!(["a", "b"]));
    assert_eq!(doc["owner"], json!("none"));
}

#[test]
fn replacement_update_keeps_id() {
    let db = memory_db();
    let inserted = db.insert(json!({"name": "old", "n": 1})).unwrap();
    let id = inserted["_id"].clone();

    let res = db
        .update(
            &json!({"name": "old"}),
            &json!({"name": "new"}),
            UpdateOptions::default(),
        )
        .unwrap();
    assert_eq!(res.num_affected, 1);

    let doc = db.find_one(json!({"name": "new"})).unwrap().unwrap();
    assert_eq!(doc["_id"], id);
    assert!(doc.get("n").is_none());
}

#[test]
fn positional_update_targets_matching_elements_only() {
    let db = memory_db();
    db.insert(json!({
        "name": "Antonio",
        "access": [
            {"kind": "email", "value": "antonio@old.example"},
            {"kind": "phone", "value": "+351000000"},
            {"kind": "email", "value": "backup@old.example"}
        ]
    }))
    .unwrap();

    db.update(
        &json!({"name": "Antonio", "access.kind": "email"}),
        &json!({"$set": {"access.$.value": "antonio@new.example"}}),
        UpdateOptions::default(),
    )
    .unwrap();

    let doc = db.find_one(json!({"name": "Antonio"})).unwrap().unwrap();
    // Both email entries match the filter, the phone entry is untouched.
    assert_eq!(doc["access"][0]["value"], json!("antonio@new.example"));
    assert_eq!(doc["access"][1]["value"], json!("+351000000"));
    assert_eq!(doc["access"][2]["value"], json!("antonio@new.example"));
}

#[test]
fn remove_single_then_none() {
    let db = memory_db();
    db.insert_many(vec![json!({"k": 1}), json!({"k": 1})]).unwrap();
    assert_eq!(
        db.remove(&json!({"k": 1}), RemoveOptions::default()).unwrap(),
        1
    );
    assert_eq!(
        db.remove(&json!({"k": 1}), RemoveOptions { multi: true }).unwrap(),
        1
    );
    assert_eq!(
        db.remove(&json!({"k": 1}), RemoveOptions { multi: true }).unwrap(),
        0
    );
}

#[test]
fn sparse_unique_index_allows_missing_fields() {
    let db = memory_db();
    db.ensure_index(IndexOptions {
        field_name: "email".to_string(),
        unique: true,
        sparse: true,
        ..Default::default()
    })
    .unwrap();

    db.insert(json!({"name": "a"})).unwrap();
    db.insert(json!({"name": "b"})).unwrap();
    db.insert(json!({"name": "c", "email": "c@x"})).unwrap();
    assert!(db.insert(json!({"name": "d", "email": "c@x"})).is_err());
    assert_eq!(db.count(json!({})).unwrap(), 3);
}

#[test]
fn find_sort_project_combination() {
    let db = memory_db();
    db.insert_many(vec![
        json!({"name": "Bruno", "age": 40, "city": "Porto"}),
        json!({"name": "Antonio", "age": 30, "city": "Lisbon"}),
        json!({"name": "Rafaela", "age": 25, "city": "Braga"}),
    ])
    .unwrap();

    let docs = db
        .find(json!({"age": {"$gte": 30}}))
        .sort(json!({"age": -1}))
        .project(json!({"name": 1, "_id": 0}))
        .exec()
        .unwrap();
    assert_eq!(docs, json!([{"name": "Bruno"}, {"name": "Antonio"}]).as_array().unwrap().clone());
}

#[test]
fn dates_sort_between_strings_and_arrays() {
    let db = memory_db();
    db.insert_many(vec![
        json!({"v": [1]}),
        json!({"v": aggio_core::date_value(0)}),
        json!({"v": "string"}),
        json!({"v": 3}),
    ])
    .unwrap();
    let docs = db.find(json!({})).sort(json!({"v": 1})).exec().unwrap();
    assert_eq!(docs[0]["v"], json!(3));
    assert_eq!(docs[1]["v"], json!("string"));
    assert_eq!(docs[2]["v"], aggio_core::date_value(0));
    assert!(docs[3]["v"].is_array());
}
