use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Schema version the document store is migrated to.
pub const DOCUMENTS_TARGET_VERSION: SchemaVersion = SchemaVersion(4);
/// Schema version the search store is migrated to.
pub const SEARCH_TARGET_VERSION: SchemaVersion = SchemaVersion(2);

/// Version assumed when a store carries no version record.
pub const INITIAL_VERSION: SchemaVersion = SchemaVersion(1);

/// Persisted schema version of one store.
///
/// Stored as a string (`"3"`) inside the store's version record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SchemaVersion(pub u32);

impl SchemaVersion {
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid schema version `{0}`")]
pub struct ParseVersionError(pub String);

impl FromStr for SchemaVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(SchemaVersion)
            .map_err(|_| ParseVersionError(s.to_owned()))
    }
}

impl From<SchemaVersion> for String {
    fn from(version: SchemaVersion) -> Self {
        version.to_string()
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = ParseVersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The two independently versioned stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Documents,
    Search,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::Search => "search",
        }
    }

    pub fn target_version(self) -> SchemaVersion {
        match self {
            Self::Documents => DOCUMENTS_TARGET_VERSION,
            Self::Search => SEARCH_TARGET_VERSION,
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_numerically_not_lexically() {
        let nine: SchemaVersion = "9".parse().expect("valid version");
        let ten: SchemaVersion = "10".parse().expect("valid version");
        assert!(nine < ten);
    }

    #[test]
    fn versions_serialize_as_strings() {
        let encoded = serde_json::to_string(&SchemaVersion(3)).expect("serializable");
        assert_eq!(encoded, "\"3\"");
        let decoded: SchemaVersion = serde_json::from_str("\" 4 \"").expect("deserializable");
        assert_eq!(decoded, SchemaVersion(4));
    }

    #[test]
    fn garbage_version_is_rejected() {
        assert_eq!(
            "v2".parse::<SchemaVersion>(),
            Err(ParseVersionError("v2".to_owned()))
        );
    }
}
