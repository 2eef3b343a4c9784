//! Saved visualizations: rewriting field references and the dashboard defaults.

use std::collections::BTreeSet;

use analytics_storage::Document;
use serde_json::{Map, Value, json};

use super::fields::EXT_FIELD;

const VIS_STATE: &str = "visState";
/// Query clauses keyed by the field they match on, e.g. `{"term": {"coins": 3}}`.
const FIELD_KEYED_CLAUSES: [&str; 8] = [
    "match",
    "match_phrase",
    "match_phrase_prefix",
    "term",
    "terms",
    "range",
    "prefix",
    "wildcard",
];
pub const SAVED_OBJECT_META: &str = "kibanaSavedObjectMeta";
pub const SEARCH_SOURCE: &str = "searchSourceJSON";

/// The saved-object body: nested under `visualization` in newer layouts,
/// at the top level in older ones.
pub fn saved_object_body_mut(document: &mut Document) -> Option<&mut Document> {
    if document
        .get("visualization")
        .is_some_and(|v| v.get(VIS_STATE).is_some())
    {
        return document
            .get_mut("visualization")
            .and_then(Value::as_object_mut);
    }
    document.contains_key(VIS_STATE).then_some(document)
}

pub fn is_visualization(document: &Document) -> bool {
    document.contains_key(VIS_STATE)
        || document
            .get("visualization")
            .is_some_and(|v| v.get(VIS_STATE).is_some())
}

fn ext_path(field: &str) -> String {
    format!("{EXT_FIELD}.{field}")
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '@')
}

/// Rewrites `field:` terms of a query string to `ext.field:`.
/// Returns `None` when nothing changed.
pub fn rewrite_query_text(text: &str, extensions: &BTreeSet<String>) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut changed = false;
    let mut rest = text;
    let mut at_boundary = true;
    while let Some(c) = rest.chars().next() {
        if at_boundary
            && let Some(field) = extensions.iter().find(|field| {
                rest.strip_prefix(field.as_str())
                    .is_some_and(|after| after.starts_with(':'))
            })
        {
            out.push_str(&ext_path(field));
            rest = &rest[field.len()..];
            changed = true;
            at_boundary = false;
            continue;
        }
        out.push(c);
        at_boundary = !is_name_char(c);
        rest = &rest[c.len_utf8()..];
    }
    changed.then_some(out)
}

/// Renames the keys of a field-keyed query clause.
fn rewrite_clause_keys(clause: &mut Map<String, Value>, extensions: &BTreeSet<String>) -> bool {
    if !clause.keys().any(|key| extensions.contains(key.as_str())) {
        return false;
    }
    *clause = std::mem::take(clause)
        .into_iter()
        .map(|(key, value)| {
            if extensions.contains(key.as_str()) {
                (ext_path(&key), value)
            } else {
                (key, value)
            }
        })
        .collect();
    true
}

fn rewrite_field_name(name: &mut String, extensions: &BTreeSet<String>) -> bool {
    if !extensions.contains(name.as_str()) {
        return false;
    }
    *name = ext_path(name);
    true
}

fn rewrite_object(map: &mut Map<String, Value>, extensions: &BTreeSet<String>) -> bool {
    let mut changed = false;
    for (key, entry) in map.iter_mut() {
        changed |= match (key.as_str(), entry) {
            ("field", Value::String(field)) => rewrite_field_name(field, extensions),
            ("fields", Value::Array(fields)) => {
                let mut any = false;
                for field in fields.iter_mut() {
                    if let Value::String(name) = field {
                        any |= rewrite_field_name(name, extensions);
                    }
                }
                any
            }
            ("query", Value::String(query)) => match rewrite_query_text(query, extensions) {
                Some(rewritten) => {
                    *query = rewritten;
                    true
                }
                None => false,
            },
            // filter pills name their field in `meta.key`
            ("meta", Value::Object(meta)) => {
                let mut any = false;
                if let Some(Value::String(name)) = meta.get_mut("key") {
                    any |= rewrite_field_name(name, extensions);
                }
                any | rewrite_object(meta, extensions)
            }
            (clause, Value::Object(fields)) if FIELD_KEYED_CLAUSES.contains(&clause) => {
                rewrite_clause_keys(fields, extensions)
            }
            (_, other) => rewrite_value(other, extensions),
        };
    }
    changed
}

/// Rewrites field references inside a parsed visualization state or search source.
fn rewrite_value(value: &mut Value, extensions: &BTreeSet<String>) -> bool {
    match value {
        Value::Object(map) => rewrite_object(map, extensions),
        Value::Array(items) => {
            let mut changed = false;
            for item in items {
                changed |= rewrite_value(item, extensions);
            }
            changed
        }
        _ => false,
    }
}

/// Rewrites a JSON document serialized inside a string field.
fn rewrite_serialized(
    holder: &mut Document,
    key: &str,
    extensions: &BTreeSet<String>,
) -> Result<bool, serde_json::Error> {
    let Some(Value::String(serialized)) = holder.get(key) else {
        return Ok(false);
    };
    let mut parsed: Value = serde_json::from_str(serialized)?;
    if !rewrite_value(&mut parsed, extensions) {
        return Ok(false);
    }
    holder.insert(key.to_owned(), Value::String(serde_json::to_string(&parsed)?));
    Ok(true)
}

/// Points every reference to a relocated field at its `ext.` path.
/// Returns whether the visualization changed.
pub fn rewrite_visualization(
    document: &mut Document,
    extensions: &BTreeSet<String>,
) -> Result<bool, serde_json::Error> {
    if extensions.is_empty() {
        return Ok(false);
    }
    let Some(body) = saved_object_body_mut(document) else {
        return Ok(false);
    };
    let mut changed = rewrite_serialized(body, VIS_STATE, extensions)?;
    if let Some(Value::Object(meta)) = body.get_mut(SAVED_OBJECT_META) {
        changed |= rewrite_serialized(meta, SEARCH_SOURCE, extensions)?;
    }
    Ok(changed)
}

fn saved_visualization(title: &str, vis_state: Value) -> Document {
    let search_source = json!({
        "query": { "query_string": { "query": "*", "analyze_wildcard": true } },
        "filter": [],
    });
    let body = json!({
        "title": title,
        "visState": vis_state.to_string(),
        "uiStateJSON": "{}",
        "description": "",
        "version": 1,
        "kibanaSavedObjectMeta": { "searchSourceJSON": search_source.to_string() },
    });
    body.as_object().cloned().unwrap_or_default()
}

/// The two visualizations every games dashboard starts with, keyed by id.
pub fn default_visualizations() -> Vec<(String, Document)> {
    let sessions = json!({
        "title": "Sessions over time",
        "type": "histogram",
        "params": { "addLegend": true, "addTooltip": true, "mode": "stacked" },
        "aggs": [
            { "id": "1", "type": "cardinality", "schema": "metric",
              "params": { "field": "gameplayId" } },
            { "id": "2", "type": "date_histogram", "schema": "segment",
              "params": { "field": "timestamp", "interval": "auto", "min_doc_count": 1 } },
        ],
        "listeners": {},
    });
    let verbs = json!({
        "title": "xAPI verbs",
        "type": "pie",
        "params": { "addLegend": true, "addTooltip": true, "isDonut": false },
        "aggs": [
            { "id": "1", "type": "count", "schema": "metric", "params": {} },
            { "id": "2", "type": "terms", "schema": "segment",
              "params": { "field": "event", "size": 10, "order": "desc", "orderBy": "1" } },
        ],
        "listeners": {},
    });
    vec![
        (
            "default-sessions-over-time".to_owned(),
            saved_visualization("Sessions over time", sessions),
        ),
        (
            "default-xapi-verbs".to_owned(),
            saved_visualization("xAPI verbs", verbs),
        ),
    ]
}
