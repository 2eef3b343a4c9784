//! Store-agnostic document predicates.
//!
//! A [`Filter`] is evaluated in-process by the in-memory and SQL engines and
//! translated into the query DSL by the HTTP search engine, so every engine
//! agrees on which documents a migration touches.

use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Field (dotted path) equals the value.
    Eq(String, Value),
    /// Field is present and not null.
    Exists(String),
    /// Field is absent or null.
    Missing(String),
    /// Field equals any of the values.
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists(field.into())
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing(field.into())
    }

    pub fn matches(&self, document: &Map<String, Value>) -> bool {
        match self {
            Self::All => true,
            Self::Eq(field, expected) => lookup(document, field) == Some(expected),
            Self::Exists(field) => lookup(document, field).is_some_and(|value| !value.is_null()),
            Self::Missing(field) => lookup(document, field).is_none_or(Value::is_null),
            Self::In(field, values) => {
                lookup(document, field).is_some_and(|value| values.contains(value))
            }
            Self::And(filters) => filters.iter().all(|filter| filter.matches(document)),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(document)),
        }
    }

    /// Elasticsearch query DSL equivalent of this filter.
    pub fn to_query_dsl(&self) -> Value {
        match self {
            Self::All => json!({ "match_all": {} }),
            Self::Eq(field, value) => json!({ "term": { field: value } }),
            Self::Exists(field) => json!({ "exists": { "field": field } }),
            Self::Missing(field) => {
                json!({ "bool": { "must_not": [{ "exists": { "field": field } }] } })
            }
            Self::In(field, values) => json!({ "terms": { field: values } }),
            Self::And(filters) => {
                let must: Vec<Value> = filters.iter().map(Self::to_query_dsl).collect();
                json!({ "bool": { "must": must } })
            }
            Self::Or(filters) => {
                let should: Vec<Value> = filters.iter().map(Self::to_query_dsl).collect();
                json!({ "bool": { "should": should, "minimum_should_match": 1 } })
            }
        }
    }
}

/// Resolves a dotted path (`participants.students`) inside a document.
pub fn lookup<'a>(document: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
