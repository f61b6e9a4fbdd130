//! Common types used throughout Outpost.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a queued mutation.
///
/// Assigned once at enqueue time and stable for the life of the entry,
/// including across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(String);

impl MutationId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing id string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "MutationId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of mutation a queued entry represents.
///
/// The core never interprets the kind; it is handed back untouched to the
/// remote-call function supplied by the application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Application-defined kind.
    Custom(String),
}

impl OperationKind {
    /// Parse a kind from its textual form. Unknown names become `Custom`.
    pub fn parse(kind: &str) -> crate::Result<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "" => Err(crate::Error::InvalidInput(
                "Operation kind cannot be empty".to_string(),
            )),
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Ok(Self::Custom(kind.to_string())),
        }
    }

    /// Get the textual form of the kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque descriptor of the remote resource a mutation applies to.
///
/// Typically a collection name plus an optional record id. The core only
/// stores and displays it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub collection: String,
    pub record_id: Option<String>,
}

impl Target {
    /// Target a whole collection (e.g. for creates).
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            record_id: None,
        }
    }

    /// Target a single record in a collection.
    pub fn record(collection: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            record_id: Some(record_id.into()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record_id {
            Some(id) => write!(f, "{}/{}", self.collection, id),
            None => write!(f, "{}", self.collection),
        }
    }
}
