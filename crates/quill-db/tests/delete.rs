use bson::doc;
use quill_db::{Database, DatabaseOptions, FindOptions, MemoryStore};

fn open() -> Database<MemoryStore> {
    Database::open_in_memory(DatabaseOptions::default()).unwrap()
}

fn seed(db: &Database<MemoryStore>) {
    db.insert_many(
        "events",
        vec![
            doc! { "_id": 1, "kind": "click" },
            doc! { "_id": 2, "kind": "view" },
            doc! { "_id": 3, "kind": "click" },
            doc! { "_id": 4, "kind": "click" },
        ],
    )
    .unwrap();
}

#[test]
fn delete_one_removes_first_match_only() {
    let db = open();
    seed(&db);

    let result = db.delete_one("events", &doc! { "kind": "click" }).unwrap();
    assert_eq!(result.deleted, 1);
    assert_eq!(db.count("events", None).unwrap(), 3);
    assert!(
        db.find_one("events", &doc! { "_id": 1 }, &FindOptions::new())
            .unwrap()
            .is_none()
    );
}

#[test]
fn delete_many_removes_all_matches() {
    let db = open();
    seed(&db);

    let result = db.delete_many("events", &doc! { "kind": "click" }).unwrap();
    assert_eq!(result.deleted, 3);
    assert_eq!(db.count("events", None).unwrap(), 1);
    assert_eq!(
        db.find("events", &doc! {}, &FindOptions::new()).unwrap()[0].get_i32("_id").unwrap(),
        2
    );
}

#[test]
fn delete_by_id_then_lookup_misses() {
    let db = open();
    seed(&db);

    db.delete_one("events", &doc! { "_id": 2 }).unwrap();
    assert!(
        db.find_one("events", &doc! { "_id": 2 }, &FindOptions::new())
            .unwrap()
            .is_none()
    );
}

#[test]
fn delete_without_match_is_zero() {
    let db = open();
    seed(&db);
    let result = db.delete_many("events", &doc! { "kind": "scroll" }).unwrap();
    assert_eq!(result.deleted, 0);
    assert_eq!(db.count("events", None).unwrap(), 4);
}

#[test]
fn delete_on_missing_collection_is_zero() {
    let db = open();
    assert_eq!(db.delete_many("ghosts", &doc! {}).unwrap().deleted, 0);
}

#[test]
fn delete_all_then_reinsert_same_ids() {
    let db = open();
    seed(&db);
    db.delete_many("events", &doc! {}).unwrap();
    assert_eq!(db.count("events", None).unwrap(), 0);

    db.insert_one("events", doc! { "_id": 1, "kind": "fresh" }).unwrap();
    assert_eq!(db.count("events", None).unwrap(), 1);
}
