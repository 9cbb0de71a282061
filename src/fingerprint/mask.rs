//! Literal masking over ordered BSON documents.
//!
//! Masking never goes through an unordered map: keys come out in the same
//! order they were read, so the rendered text is reproducible.

use bson::{Bson, Document};
use serde_json::Value;

/// Placeholder substituted for every literal.
pub const PLACEHOLDER: &str = "?";

/// How a single key is treated while masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRule {
    /// Drop the key and its value.
    Remove,
    /// Keep the value as-is; it names an object, not user data.
    KeepValue,
}

/// Per-key rules; keys without a rule are masked.
pub type KeyRules = &'static [(&'static str, KeyRule)];

/// No special keys.
pub const NO_RULES: KeyRules = &[];

/// Transport and session metadata stripped from commands, plus keys whose
/// values are collection names.
pub const COMMAND_RULES: KeyRules = &[
    ("$db", KeyRule::Remove),
    ("$readPreference", KeyRule::Remove),
    ("$readConcern", KeyRule::Remove),
    ("$writeConcern", KeyRule::Remove),
    ("$clusterTime", KeyRule::Remove),
    ("$oplogQueryData", KeyRule::Remove),
    ("$replData", KeyRule::Remove),
    ("lastKnownCommittedOpTime", KeyRule::Remove),
    ("lsid", KeyRule::Remove),
    ("findAndModify", KeyRule::KeepValue),
    ("remove", KeyRule::KeepValue),
];

fn rule_for(rules: KeyRules, key: &str) -> Option<KeyRule> {
    rules.iter().find(|(k, _)| *k == key).map(|(_, r)| *r)
}

// ─── Masked tree ─────────────────────────────────────────────────

/// Result of masking: an ordered tree where literals are either replaced
/// or explicitly kept.
#[derive(Debug, Clone, PartialEq)]
pub enum Masked {
    Placeholder,
    Raw(Bson),
    Document(Vec<(String, Masked)>),
    Array(Vec<Masked>),
}

/// Mask a whole document.
pub fn mask_document(doc: &Document, rules: KeyRules) -> Masked {
    let mut fields = Vec::with_capacity(doc.len());
    for (key, value) in doc {
        match rule_for(rules, key) {
            Some(KeyRule::Remove) => continue,
            Some(KeyRule::KeepValue) => fields.push((key.clone(), Masked::Raw(value.clone()))),
            None => fields.push((key.clone(), mask_value(value, rules))),
        }
    }
    Masked::Document(fields)
}

/// Mask any value: containers recurse, everything else becomes `?`.
pub fn mask_value(value: &Bson, rules: KeyRules) -> Masked {
    match value {
        Bson::Document(doc) => mask_document(doc, rules),
        Bson::Array(items) => Masked::Array(items.iter().map(|v| mask_value(v, rules)).collect()),
        _ => Masked::Placeholder,
    }
}

impl Masked {
    /// Compact JSON-like text, keys in original order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            Masked::Placeholder => push_json_str(out, PLACEHOLDER),
            Masked::Raw(value) => render_bson_into(value, out),
            Masked::Document(fields) => {
                out.push('{');
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    push_json_str(out, key);
                    out.push(':');
                    value.render_into(out);
                }
                out.push('}');
            }
            Masked::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.render_into(out);
                }
                out.push(']');
            }
        }
    }
}

// ─── Unmasked rendering ──────────────────────────────────────────

/// Render a document with its original structure and values.
pub fn render_document(doc: &Document) -> String {
    let mut out = String::new();
    render_document_into(doc, &mut out);
    out
}

/// Render a single value with its original structure.
pub fn render_bson(value: &Bson) -> String {
    let mut out = String::new();
    render_bson_into(value, &mut out);
    out
}

fn render_document_into(doc: &Document, out: &mut String) {
    out.push('{');
    for (i, (key, value)) in doc.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_json_str(out, key);
        out.push(':');
        render_bson_into(value, out);
    }
    out.push('}');
}

fn render_bson_into(value: &Bson, out: &mut String) {
    match value {
        Bson::Document(doc) => render_document_into(doc, out),
        Bson::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_bson_into(item, out);
            }
            out.push(']');
        }
        // Scalars: relaxed extended JSON (plain numbers, {"$oid": ...}, ...).
        scalar => out.push_str(&scalar.clone().into_relaxed_extjson().to_string()),
    }
}

fn push_json_str(out: &mut String, s: &str) {
    out.push_str(&Value::String(s.to_owned()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn masks_literals_and_keeps_key_order() {
        let d = doc! { "zeta": 1, "alpha": { "$gt": 5, "$lt": "x" }, "mid": [1, { "k": true }] };
        assert_eq!(
            mask_document(&d, NO_RULES).render(),
            r#"{"zeta":"?","alpha":{"$gt":"?","$lt":"?"},"mid":["?",{"k":"?"}]}"#
        );
    }

    #[test]
    fn command_rules_remove_and_keep() {
        let d = doc! {
            "findAndModify": "people",
            "query": { "id": 3 },
            "remove": true,
            "$db": "test",
            "lsid": { "id": 1 },
        };
        assert_eq!(
            mask_document(&d, COMMAND_RULES).render(),
            r#"{"findAndModify":"people","query":{"id":"?"},"remove":true}"#
        );
    }

    #[test]
    fn unmasked_rendering_is_ordered_and_relaxed() {
        let d = doc! { "$group": { "_id": "$id", "count": { "$sum": 1 } }, "n": 2.5 };
        assert_eq!(
            render_document(&d),
            r#"{"$group":{"_id":"$id","count":{"$sum":1}},"n":2.5}"#
        );
    }

    #[test]
    fn rendering_escapes_strings() {
        let d = doc! { "we\"ird": "quote\"d" };
        assert_eq!(render_document(&d), r#"{"we\"ird":"quote\"d"}"#);
        assert_eq!(mask_document(&d, NO_RULES).render(), r#"{"we\"ird":"?"}"#);
    }
}
