//! Query fingerprinting.
//!
//! Turns a profiled operation into mongosh-like text where every literal is
//! replaced by `?`, so that queries of the same shape group together.

pub mod mask;

use bson::{Bson, Document};
use serde::Serialize;

use crate::error::{QanError, Result};
use crate::event::{OpKind, RawEvent};

use mask::{mask_document, mask_value, render_bson, render_document, Masked, COMMAND_RULES, NO_RULES};

/// Canonical description of a query shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub namespace: String,
    pub database: String,
    pub collection: String,
    pub operation: String,
    /// Masked query text, used as the aggregation key.
    pub fingerprint: String,
    /// Masked filter (or stage list), a secondary grouping aid.
    pub keys: String,
}

/// Build the fingerprint of one event.
pub fn fingerprint(event: &RawEvent) -> Result<Fingerprint> {
    if event.namespace.is_empty() {
        return Err(QanError::Fingerprint("empty namespace".into()));
    }

    let (database, collection) = match event.namespace.split_once('.') {
        Some((db, coll)) => (db.to_string(), coll.to_string()),
        None => (event.namespace.clone(), String::new()),
    };
    let fp = Fingerprint {
        namespace: event.namespace.clone(),
        database,
        collection,
        operation: event.operation.clone(),
        ..Default::default()
    };

    let cmd = &event.command;
    match event.kind() {
        OpKind::Find => Ok(find(fp, cmd)),
        OpKind::Insert => Ok(insert(fp)),
        OpKind::Update => update(fp, cmd),
        OpKind::Delete => delete(fp, cmd),
        OpKind::Command => command(fp, cmd),
    }
}

// ─── Builders ────────────────────────────────────────────────────

fn find(mut fp: Fingerprint, cmd: &Document) -> Fingerprint {
    let filter = cmd
        .get("filter")
        .map(|f| mask_value(f, NO_RULES).render())
        .unwrap_or_default();

    let mut text = format!("db.{}.find({}", fp.collection, filter);
    if let Some(projection) = cmd.get("projection") {
        text.push_str(", ");
        text.push_str(&render_bson(projection));
    }
    text.push(')');

    if let Some(sort) = cmd.get("sort") {
        text.push_str(&format!(".sort({})", mask_value(sort, NO_RULES).render()));
    }
    if cmd.contains_key("limit") {
        text.push_str(".limit(?)");
    }
    if cmd.contains_key("skip") {
        text.push_str(".skip(?)");
    }
    if let Some(batch_size) = cmd.get("batchSize") {
        text.push_str(&format!(".batchSize({})", render_bson(batch_size)));
    }

    fp.fingerprint = text;
    fp.keys = filter;
    fp
}

fn insert(mut fp: Fingerprint) -> Fingerprint {
    fp.fingerprint = format!("db.{}.insert(?)", fp.collection);
    fp
}

fn update(mut fp: Fingerprint, cmd: &Document) -> Result<Fingerprint> {
    let filter = required_masked(cmd, "q", "update")?;
    let update = cmd
        .get("u")
        .map_or(Masked::Placeholder, |u| mask_value(u, NO_RULES))
        .render();

    let mut text = format!("db.{}.update({}, {}", fp.collection, filter, update);

    let options: Vec<&str> = ["multi", "upsert"]
        .into_iter()
        .filter(|flag| cmd.get_bool(*flag).unwrap_or(false))
        .collect();
    if !options.is_empty() {
        let body: Vec<String> = options.iter().map(|o| format!("\"{o}\":true")).collect();
        text.push_str(&format!(", {{{}}}", body.join(",")));
    }
    text.push(')');

    fp.fingerprint = text;
    fp.keys = filter;
    Ok(fp)
}

fn delete(mut fp: Fingerprint, cmd: &Document) -> Result<Fingerprint> {
    let filter = required_masked(cmd, "q", "delete")?;
    let method = if cmd.get("limit").is_some_and(is_one) {
        "deleteOne"
    } else {
        "deleteMany"
    };

    fp.fingerprint = format!("db.{}.{}({})", fp.collection, method, filter);
    fp.keys = filter;
    Ok(fp)
}

fn command(mut fp: Fingerprint, cmd: &Document) -> Result<Fingerprint> {
    if !cmd.contains_key("aggregate") {
        let masked = mask_document(cmd, COMMAND_RULES).render();
        fp.fingerprint = format!("db.runCommand({masked})");
        fp.keys = masked;
        return Ok(fp);
    }

    let stages = match cmd.get("pipeline") {
        None => Vec::new(),
        Some(Bson::Array(stages)) => stages
            .iter()
            .map(|stage| match stage {
                Bson::Document(stage) if stage.contains_key("$match") => {
                    Ok(mask_document(stage, COMMAND_RULES).render())
                }
                Bson::Document(stage) => Ok(render_document(stage)),
                other => Err(QanError::Fingerprint(format!(
                    "aggregate stage is not a document: {:?}",
                    other.element_type()
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(QanError::Fingerprint(format!(
                "aggregate pipeline is not an array: {:?}",
                other.element_type()
            )))
        }
    };

    let joined = stages.join(", ");
    let mut text = format!("db.{}.aggregate([{}])", fp.collection, joined);
    if let Some(collation) = cmd.get("collation") {
        text.push_str(&format!(
            ", collation: {}",
            mask_value(collation, COMMAND_RULES).render()
        ));
    }

    fp.fingerprint = text;
    fp.keys = joined;
    Ok(fp)
}

fn required_masked(cmd: &Document, key: &str, op: &str) -> Result<String> {
    cmd.get(key)
        .map(|v| mask_value(v, NO_RULES).render())
        .ok_or_else(|| QanError::Fingerprint(format!("{op} command without '{key}'")))
}

fn is_one(value: &Bson) -> bool {
    match value {
        Bson::Int32(v) => *v == 1,
        Bson::Int64(v) => *v == 1,
        Bson::Double(v) => *v == 1.0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn event(ns: &str, op: &str, command: Document) -> RawEvent {
        RawEvent::new(ns, op, command)
    }

    fn text(ns: &str, op: &str, command: Document) -> String {
        fingerprint(&event(ns, op, command)).unwrap().fingerprint
    }

    #[test]
    fn find_with_sort_limit_skip() {
        let fp = fingerprint(&event(
            "test.collection",
            "query",
            doc! {
                "find": "collection",
                "filter": { "name": "test" },
                "sort": { "_id": 1 },
                "limit": 4,
                "skip": 5,
            },
        ))
        .unwrap();
        assert_eq!(
            fp.fingerprint,
            r#"db.collection.find({"name":"?"}).sort({"_id":"?"}).limit(?).skip(?)"#
        );
        assert_eq!(fp.namespace, "test.collection");
        assert_eq!(fp.database, "test");
        assert_eq!(fp.collection, "collection");
        assert_eq!(fp.operation, "query");
        assert_eq!(fp.keys, r#"{"name":"?"}"#);
    }

    #[test]
    fn find_keeps_projection_and_batch_size() {
        assert_eq!(
            text(
                "test.c",
                "query",
                doc! { "filter": { "a": { "$in": [1, 2] } }, "projection": { "a": 1 }, "batchSize": 101 }
            ),
            r#"db.c.find({"a":{"$in":["?","?"]}}, {"a":1}).batchSize(101)"#
        );
        assert_eq!(text("test.c", "query", doc! {}), "db.c.find()");
    }

    #[test]
    fn insert_ignores_body() {
        assert_eq!(
            text("test.insert_collection", "insert", doc! { "documents": [{ "a": 1 }] }),
            "db.insert_collection.insert(?)"
        );
        assert_eq!(text("test_00.people", "insert", doc! {}), "db.people.insert(?)");
    }

    #[test]
    fn update_plain_and_with_options() {
        assert_eq!(
            text(
                "test.update_collection",
                "update",
                doc! { "q": { "name": "test" }, "u": { "$set": { "name": "new" } } }
            ),
            r#"db.update_collection.update({"name":"?"}, {"$set":{"name":"?"}})"#
        );

        let fp = fingerprint(&event(
            "test.people",
            "update",
            doc! { "q": { "name": "x" }, "u": { "$set": { "name": "y" } }, "upsert": true },
        ))
        .unwrap();
        assert_eq!(
            fp.fingerprint,
            r#"db.people.update({"name":"?"}, {"$set":{"name":"?"}}, {"upsert":true})"#
        );
        assert_eq!(fp.keys, r#"{"name":"?"}"#);

        assert_eq!(
            text(
                "test.people",
                "update",
                doc! { "q": {}, "u": { "$inc": { "n": 1 } }, "upsert": true, "multi": true }
            ),
            r#"db.people.update({}, {"$inc":{"n":"?"}}, {"multi":true,"upsert":true})"#
        );
    }

    #[test]
    fn update_with_pipeline_and_dotted_collection() {
        let fp = fingerprint(&event(
            "config.system.sessions",
            "update",
            doc! {
                "q": { "_id": { "id": bson::oid::ObjectId::new(), "uid": "abc" } },
                "u": [ { "$set": { "lastUse": "$$NOW" } } ],
                "multi": false,
                "upsert": true,
            },
        ))
        .unwrap();
        assert_eq!(
            fp.fingerprint,
            r#"db.system.sessions.update({"_id":{"id":"?","uid":"?"}}, [{"$set":{"lastUse":"?"}}], {"upsert":true})"#
        );
        assert_eq!(fp.database, "config");
        assert_eq!(fp.collection, "system.sessions");
    }

    #[test]
    fn update_without_filter_fails() {
        let err = fingerprint(&event("a.b", "update", doc! { "u": {} })).unwrap_err();
        assert!(err.is_per_event());
    }

    #[test]
    fn update_without_body_masks_it_as_placeholder() {
        assert_eq!(
            text("a.b", "update", doc! { "q": { "x": 1 } }),
            r#"db.b.update({"x":"?"}, "?")"#
        );
    }

    #[test]
    fn delete_one_only_for_limit_one() {
        assert_eq!(
            text("test.c", "remove", doc! { "q": { "id": 0 }, "limit": 1 }),
            r#"db.c.deleteOne({"id":"?"})"#
        );
        assert_eq!(
            text("test.c", "delete", doc! { "q": { "id": 0 }, "limit": 1_i64 }),
            r#"db.c.deleteOne({"id":"?"})"#
        );
        assert_eq!(
            text("test.c", "remove", doc! { "q": { "name": "test" }, "limit": 0 }),
            r#"db.c.deleteMany({"name":"?"})"#
        );
        assert_eq!(
            text("test.delete_collection", "remove", doc! { "q": { "name": "test" } }),
            r#"db.delete_collection.deleteMany({"name":"?"})"#
        );
    }

    #[test]
    fn aggregate_masks_only_match_stages() {
        let fp = fingerprint(&event(
            "test.test",
            "command",
            doc! {
                "aggregate": "test",
                "pipeline": [
                    { "$match": { "id": 0, "time": { "$gt": bson::DateTime::now() } } },
                    { "$group": { "_id": "$id", "count": { "$sum": 1 } } },
                    { "$sort": { "_id": 1 } },
                ],
                "cursor": {},
                "$db": "test",
                "lsid": { "id": 1 },
            },
        ))
        .unwrap();
        assert_eq!(
            fp.fingerprint,
            r#"db.test.aggregate([{"$match":{"id":"?","time":{"$gt":"?"}}}, {"$group":{"_id":"$id","count":{"$sum":1}}}, {"$sort":{"_id":1}}])"#
        );
        assert_eq!(
            fp.keys,
            r#"{"$match":{"id":"?","time":{"$gt":"?"}}}, {"$group":{"_id":"$id","count":{"$sum":1}}}, {"$sort":{"_id":1}}"#
        );
    }

    #[test]
    fn aggregate_with_collation() {
        assert_eq!(
            text(
                "test.c",
                "command",
                doc! {
                    "aggregate": "c",
                    "pipeline": [ { "$match": { "a": "b" } } ],
                    "collation": { "locale": "fr" },
                }
            ),
            r#"db.c.aggregate([{"$match":{"a":"?"}}]), collation: {"locale":"?"}"#
        );
    }

    #[test]
    fn aggregate_rejects_malformed_pipeline() {
        assert!(fingerprint(&event("a.b", "command", doc! { "aggregate": "b", "pipeline": 3 })).is_err());
        assert!(fingerprint(&event("a.b", "command", doc! { "aggregate": "b", "pipeline": [1] })).is_err());
    }

    #[test]
    fn generic_commands_strip_metadata() {
        assert_eq!(
            text(
                "test.$cmd",
                "command",
                doc! {
                    "findAndModify": "test",
                    "query": { "id": 0 },
                    "update": { "$set": { "name": "new" } },
                    "$db": "test",
                    "$readPreference": { "mode": "primary" },
                }
            ),
            r#"db.runCommand({"findAndModify":"test","query":{"id":"?"},"update":{"$set":{"name":"?"}}})"#
        );
        assert_eq!(
            text(
                "test.$cmd",
                "command",
                doc! { "findAndModify": "test", "query": { "id": 1 }, "remove": true }
            ),
            r#"db.runCommand({"findAndModify":"test","query":{"id":"?"},"remove":true})"#
        );
    }

    #[test]
    fn literals_do_not_affect_fingerprint() {
        let a = fingerprint(&event(
            "db.c",
            "query",
            doc! { "filter": { "x": 1, "y": { "$in": ["a", "b"] } }, "limit": 10 },
        ))
        .unwrap();
        let b = fingerprint(&event(
            "db.c",
            "query",
            doc! { "filter": { "x": 999, "y": { "$in": ["zz", "yy"] } }, "limit": 1 },
        ))
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn output_is_reproducible() {
        let cmd = doc! { "b": 1, "a": 2, "c": { "z": 1, "y": 2 } };
        let first = text("d.c", "command", cmd.clone());
        for _ in 0..20 {
            assert_eq!(text("d.c", "command", cmd.clone()), first);
        }
        assert_eq!(first, r#"db.runCommand({"b":"?","a":"?","c":{"z":"?","y":"?"}})"#);
    }

    #[test]
    fn empty_namespace_fails() {
        assert!(matches!(
            fingerprint(&event("", "insert", doc! {})),
            Err(QanError::Fingerprint(_))
        ));
    }
}
