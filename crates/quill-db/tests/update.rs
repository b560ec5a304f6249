use bson::{Bson, doc};
use quill_db::{Database, DatabaseOptions, DbError, FindOptions, MemoryStore};

fn open() -> Database<MemoryStore> {
    Database::open_in_memory(DatabaseOptions::default()).unwrap()
}

#[test]
fn inc_and_set_in_one_update() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1, "age": 30 }).unwrap();

    let result = db
        .update_one(
            "users",
            &doc! { "_id": 1 },
            &doc! { "$inc": { "age": 1 }, "$set": { "active": true } },
            false,
        )
        .unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(result.modified, 1);

    let found = db
        .find_one("users", &doc! { "_id": 1 }, &FindOptions::new())
        .unwrap()
        .unwrap();
    assert_eq!(found, doc! { "_id": 1, "age": 31, "active": true });
}

#[test]
fn set_id_fails_immutable() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1, "age": 30 }).unwrap();
    let err = db.update_one("users", &doc! { "_id": 1 }, &doc! { "$set": { "_id": 2 } }, false);
    assert!(matches!(err, Err(DbError::ImmutableId)));
}

#[test]
fn replace_with_different_id_fails() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1, "a": 1 }).unwrap();
    let err = db.replace_one("users", &doc! { "_id": 1 }, &doc! { "_id": 2, "a": 9 }, false);
    assert!(matches!(err, Err(DbError::ImmutableId)));

    // the failed replace left the document alone
    let found = db
        .find_one("users", &doc! { "_id": 1 }, &FindOptions::new())
        .unwrap()
        .unwrap();
    assert_eq!(found.get_i32("a").unwrap(), 1);
}

#[test]
fn replace_one_swaps_body_and_keeps_id() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1, "a": 1, "b": 2 }).unwrap();

    let result = db
        .replace_one("users", &doc! { "_id": 1 }, &doc! { "c": 3 }, false)
        .unwrap();
    assert_eq!(result.modified, 1);

    let found = db
        .find_one("users", &doc! { "_id": 1 }, &FindOptions::new())
        .unwrap()
        .unwrap();
    assert_eq!(found, doc! { "_id": 1, "c": 3 });
}

#[test]
fn replace_rejects_operator_documents() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1 }).unwrap();
    assert!(matches!(
        db.replace_one("users", &doc! { "_id": 1 }, &doc! { "$set": { "a": 1 } }, false),
        Err(DbError::BadUpdate(_))
    ));
}

#[test]
fn update_one_touches_only_first_match() {
    let db = open();
    db.insert_many(
        "users",
        vec![
            doc! { "_id": 1, "status": "new" },
            doc! { "_id": 2, "status": "new" },
        ],
    )
    .unwrap();

    let result = db
        .update_one("users", &doc! { "status": "new" }, &doc! { "$set": { "status": "seen" } }, false)
        .unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(db.count("users", Some(&doc! { "status": "new" })).unwrap(), 1);
}

#[test]
fn update_many_touches_all_matches() {
    let db = open();
    db.insert_many(
        "users",
        vec![
            doc! { "_id": 1, "status": "new" },
            doc! { "_id": 2, "status": "new" },
            doc! { "_id": 3, "status": "done" },
        ],
    )
    .unwrap();

    let result = db
        .update_many("users", &doc! { "status": "new" }, &doc! { "$set": { "status": "seen" } }, false)
        .unwrap();
    assert_eq!(result.matched, 2);
    assert_eq!(result.modified, 2);
    assert_eq!(db.count("users", Some(&doc! { "status": "seen" })).unwrap(), 2);
    assert_eq!(db.count("users", Some(&doc! { "status": "done" })).unwrap(), 1);
}

#[test]
fn noop_update_counts_matched_not_modified() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1, "v": 5 }).unwrap();

    let before = db
        .find_one("users", &doc! { "_id": 1 }, &FindOptions::new())
        .unwrap()
        .unwrap();
    let result = db
        .update_one("users", &doc! { "_id": 1 }, &doc! { "$set": { "v": 5 } }, false)
        .unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(result.modified, 0);

    let after = db
        .find_one("users", &doc! { "_id": 1 }, &FindOptions::new())
        .unwrap()
        .unwrap();
    assert_eq!(bson::serialize_to_vec(&after).unwrap(), bson::serialize_to_vec(&before).unwrap());
}

#[test]
fn update_without_match_reports_zero() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1 }).unwrap();
    let result = db
        .update_one("users", &doc! { "_id": 99 }, &doc! { "$set": { "a": 1 } }, false)
        .unwrap();
    assert_eq!(result, quill_db::UpdateResult::default());
}

#[test]
fn upsert_inserts_synthesized_document() {
    let db = open();
    let result = db
        .update_one(
            "users",
            &doc! { "email": "a@x", "age": { "$gt": 1 } },
            &doc! { "$set": { "active": true }, "$inc": { "visits": 1 } },
            true,
        )
        .unwrap();
    assert_eq!(result.matched, 0);
    let id = result.upserted_id.expect("upsert inserted");

    let found = db
        .find_one("users", &doc! { "_id": id }, &FindOptions::new())
        .unwrap()
        .unwrap();
    assert_eq!(found.get_str("email").unwrap(), "a@x");
    assert_eq!(found.get_bool("active").unwrap(), true);
    assert_eq!(found.get_i32("visits").unwrap(), 1);
    assert!(found.get("age").is_none());
    assert_eq!(db.count("users", None).unwrap(), 1);
}

#[test]
fn upsert_with_supplied_id() {
    let db = open();
    let result = db
        .update_one("users", &doc! { "_id": 42 }, &doc! { "$set": { "v": 1 } }, true)
        .unwrap();
    assert_eq!(result.upserted_id, Some(Bson::Int32(42)));
    assert_eq!(
        db.find_one("users", &doc! { "_id": 42 }, &FindOptions::new())
            .unwrap()
            .unwrap(),
        doc! { "_id": 42, "v": 1 }
    );
}

#[test]
fn upsert_does_not_fire_when_matched() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1, "v": 1 }).unwrap();
    let result = db
        .update_one("users", &doc! { "_id": 1 }, &doc! { "$set": { "v": 2 } }, true)
        .unwrap();
    assert_eq!(result.matched, 1);
    assert!(result.upserted_id.is_none());
    assert_eq!(db.count("users", None).unwrap(), 1);
}

#[test]
fn upsert_rejects_logical_filters() {
    let db = open();
    let err = db.update_one(
        "users",
        &doc! { "$or": [ { "a": 1 } ] },
        &doc! { "$set": { "v": 1 } },
        true,
    );
    assert!(matches!(err, Err(DbError::BadUpdate(_))));
}

#[test]
fn dotted_updates_and_array_operators() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1, "profile": { "city": "LA" }, "tags": ["a"] })
        .unwrap();

    db.update_one(
        "users",
        &doc! { "_id": 1 },
        &doc! {
            "$set": { "profile.city": "NYC", "profile.zip": 10001 },
            "$push": { "tags": "b" },
            "$addToSet": { "tags": "a" },
        },
        false,
    )
    .unwrap();

    let found = db
        .find_one("users", &doc! { "_id": 1 }, &FindOptions::new())
        .unwrap()
        .unwrap();
    assert_eq!(
        found,
        doc! { "_id": 1, "profile": { "city": "NYC", "zip": 10001 }, "tags": ["a", "b"] }
    );
}

#[test]
fn min_max_mul_rename() {
    let db = open();
    db.insert_one("stats", doc! { "_id": 1, "lo": 10, "hi": 10, "n": 3, "old": "keep" })
        .unwrap();

    db.update_one(
        "stats",
        &doc! { "_id": 1 },
        &doc! {
            "$min": { "lo": 4 },
            "$max": { "hi": 40 },
            "$mul": { "n": 7 },
            "$rename": { "old": "fresh" },
        },
        false,
    )
    .unwrap();

    let found = db
        .find_one("stats", &doc! { "_id": 1 }, &FindOptions::new())
        .unwrap()
        .unwrap();
    assert_eq!(found.get_i32("lo").unwrap(), 4);
    assert_eq!(found.get_i32("hi").unwrap(), 40);
    assert_eq!(found.get_i32("n").unwrap(), 21);
    assert!(found.get("old").is_none());
    assert_eq!(found.get_str("fresh").unwrap(), "keep");
}

#[test]
fn unknown_update_operator_rejected() {
    let db = open();
    db.insert_one("users", doc! { "_id": 1 }).unwrap();
    assert!(matches!(
        db.update_one("users", &doc! { "_id": 1 }, &doc! { "$bump": { "a": 1 } }, false),
        Err(DbError::BadUpdate(_))
    ));
}
