// tests/aggregation_tests.rs
//! Pipeline scenarios over realistic document sets.

use aggio_core::{aggio, aggio_with_options, AggioInput, AggioOptions, Db, DbOptions};
use serde_json::{json, Value};

fn contacts() -> Vec<Value> {
    vec![
        json!({
            "name": "Antonio", "surname": "Silva", "age": 30,
            "access": [{"kind": "email", "value": "antonio@x.y"}]
        }),
        json!({
            "name": "Rafaela", "surname": "Costa", "age": 25,
            "access": [{"kind": "email", "value": "rafaela@x.y"}, {"kind": "phone", "value": "911"}]
        }),
        json!({
            "name": "Bruno", "surname": "Alves", "age": 25,
            "access": [{"kind": "phone", "value": "912"}]
        }),
    ]
}

#[test]
fn match_sort_pick_chain() {
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[
            json!({"$match": {"age": 25}}),
            json!({"$sort": {"name": 1}}),
            json!({"$pick": "name"}),
        ],
    )
    .unwrap();
    assert_eq!(res, json!("Bruno"));
}

#[test]
fn group_by_age_buckets() {
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[json!({"$sort": {"name": 1}}), json!({"$groupBy": "age"})],
    )
    .unwrap();
    assert_eq!(res["25"].as_array().unwrap().len(), 2);
    assert_eq!(res["30"].as_array().unwrap().len(), 1);
    assert_eq!(res["25"][0]["name"], json!("Bruno"));
}

#[test]
fn key_by_name_is_an_object_of_docs() {
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[json!({"$keyBy": "name"})],
    )
    .unwrap();
    assert_eq!(res.as_object().unwrap().len(), 3);
    assert_eq!(res["Rafaela"]["surname"], json!("Costa"));
}

#[test]
fn key_by_template_key() {
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[json!({"$keyBy": {"$template": "{{name}}-{{age}}"}})],
    )
    .unwrap();
    assert_eq!(res["Antonio-30"]["surname"], json!("Silva"));
}

#[test]
fn template_renders_every_doc() {
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[
            json!({"$sort": {"age": -1, "name": 1}}),
            json!({"$template": "{{name}} {{surname}} ({{age}})"}),
        ],
    )
    .unwrap();
    assert_eq!(
        res,
        json!(["Antonio Silva (30)", "Bruno Alves (25)", "Rafaela Costa (25)"])
    );
}

#[test]
fn pick_join_builds_full_names() {
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[
            json!({"$sort": {"name": 1}}),
            json!({"$pick": {"$joinEach": ["name", "# ", "surname"]}}),
        ],
    )
    .unwrap();
    assert_eq!(
        res,
        json!(["Antonio Silva", "Bruno Alves", "Rafaela Costa"])
    );
}

#[test]
fn pick_join_with_stringify_case() {
    let res = aggio(
        AggioInput::Docs(vec![json!({"first": "ana maria", "last": "souza"})]),
        &[json!({"$pick": {
            "$join": ["first", "#_", "last"],
            "$stringify": "snake_case"
        }})],
    )
    .unwrap();
    assert_eq!(res, json!("ana_maria_souza"));
}

#[test]
fn pick_into_nested_array_then_key_by() {
    // $pick on an array field materializes its object elements for the
    // following stages.
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[
            json!({"$matchOne": {"name": "Rafaela"}}),
            json!({"$pick": "access"}),
            json!({"$keyBy": "kind"}),
        ],
    )
    .unwrap();
    assert_eq!(res["email"]["value"], json!("rafaela@x.y"));
    assert_eq!(res["phone"]["value"], json!("911"));
}

#[test]
fn update_stage_then_group() {
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[
            json!({"$update": {"$match": {"age": {"$lt": 28}}, "$set": {"segment": "young"}}}),
            json!({"$update": {"$match": {"age": {"$gte": 28}}, "$set": {"segment": "senior"}}}),
            json!({"$groupBy": "segment"}),
        ],
    )
    .unwrap();
    assert_eq!(res["young"].as_array().unwrap().len(), 2);
    assert_eq!(res["senior"].as_array().unwrap().len(), 1);
}

#[test]
fn exclude_id_can_be_disabled() {
    let res = aggio_with_options(
        AggioInput::Docs(contacts()),
        &[json!({"$match": {"name": "Antonio"}})],
        AggioOptions { exclude_id: false },
    )
    .unwrap();
    assert!(res[0].get("_id").is_some());

    let res = aggio(
        AggioInput::Docs(contacts()),
        &[json!({"$match": {"name": "Antonio"}})],
    )
    .unwrap();
    assert!(res[0].get("_id").is_none());
}

#[test]
fn collection_input_leaves_source_untouched() {
    let db = Db::create(DbOptions {
        docs: Some(contacts()),
        ..Default::default()
    })
    .unwrap();

    let res = aggio(
        AggioInput::Collection(&db),
        &[
            json!({"$update": {"$set": {"mutated": true}}}),
            json!({"$match": {"mutated": true}}),
        ],
    )
    .unwrap();
    assert_eq!(res.as_array().unwrap().len(), 3);
    assert_eq!(db.count(json!({"mutated": true})).unwrap(), 0);
}

#[test]
fn first_last_limit_flags() {
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[
            json!({"$sort": {"age": 1, "name": 1}}),
            json!({"$pick": {"$joinEach": ["name"]}}),
            json!({"$limit": 2}),
        ],
    )
    .unwrap();
    assert_eq!(res, json!(["Bruno", "Rafaela"]));

    let res = aggio(
        AggioInput::Docs(contacts()),
        &[
            json!({"$sort": {"age": 1, "name": 1}}),
            json!({"$first": true}),
        ],
    )
    .unwrap();
    assert_eq!(res["name"], json!("Bruno"));
}

#[test]
fn key_by_collision_without_policy_is_an_error() {
    let err = aggio(
        AggioInput::Docs(contacts()),
        &[json!({"$keyBy": "age"})],
    );
    assert!(err.is_err());
}

#[test]
fn key_by_collision_list_policy() {
    let res = aggio(
        AggioInput::Docs(contacts()),
        &[
            json!({"$sort": {"name": 1}}),
            json!({"$keyBy": {"$pick": "age", "$onMany": "list"}}),
        ],
    )
    .unwrap();
    assert_eq!(res["25"].as_array().unwrap().len(), 2);
    assert!(res["30"].is_object());
}
