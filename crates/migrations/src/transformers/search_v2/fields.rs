use analytics_storage::Document;
use serde_json::{Map, Value};

/// Namespace that receives every non-canonical trace field.
pub const EXT_FIELD: &str = "ext";

/// Top-level attributes a trace document may keep.
pub const CANONICAL_FIELDS: [&str; 28] = [
    "activityId",
    "animalName",
    "classId",
    "completion",
    "currentSessionStarted",
    "event",
    "ext",
    "firstSessionStarted",
    "gameId",
    "gameplayId",
    "glpId",
    "health",
    "name",
    "out",
    "playerName",
    "progress",
    "response",
    "score",
    "selected",
    "session",
    "stored",
    "success",
    "target",
    "timestamp",
    "trace",
    "type",
    "versionId",
    "verb",
];

pub fn is_canonical(field: &str) -> bool {
    CANONICAL_FIELDS.contains(&field)
}

/// Keys of `source` that do not belong at the top level.
pub fn non_canonical_keys(source: &Document) -> impl Iterator<Item = &String> {
    source.keys().filter(|key| !is_canonical(key))
}

/// A top-level field and an `ext` entry of the same name hold different values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("field {field} is set both at the top level ({top_level}) and under ext ({existing})")]
pub struct ExtensionConflict {
    pub field: String,
    pub top_level: Value,
    pub existing: Value,
}

/// Moves every non-canonical key of `source` under `ext`, returning the moved names.
///
/// An existing `ext` object is merged into. A non-object `ext` is kept as
/// `ext.value`. When a moved key already exists under `ext` with a different
/// value, `source` is left untouched and the conflict is returned.
pub fn relocate_extensions(source: &mut Document) -> Result<Vec<String>, ExtensionConflict> {
    let moved: Vec<String> = non_canonical_keys(source).cloned().collect();
    if moved.is_empty() {
        return Ok(moved);
    }
    let mut ext = match source.get(EXT_FIELD) {
        Some(Value::Object(ext)) => ext.clone(),
        Some(other) => Map::from_iter([("value".to_owned(), other.clone())]),
        None => Map::new(),
    };
    for key in &moved {
        let Some(value) = source.get(key) else {
            continue;
        };
        if let Some(existing) = ext.get(key)
            && existing != value
        {
            return Err(ExtensionConflict {
                field: key.clone(),
                top_level: value.clone(),
                existing: existing.clone(),
            });
        }
        ext.insert(key.clone(), value.clone());
    }
    for key in &moved {
        source.remove(key);
    }
    source.insert(EXT_FIELD.to_owned(), Value::Object(ext));
    Ok(moved)
}
