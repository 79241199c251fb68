//! Core data models shared by the indexing and answer pipelines.
//!
//! [`Document`] is the retrievable unit written to document stores;
//! [`DocumentType`] is the `meta.type` discriminator schema documents carry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Meta key holding the project scope of a document.
pub const PROJECT_ID: &str = "project_id";
/// Meta key holding the [`DocumentType`] discriminator.
pub const DOCUMENT_TYPE: &str = "type";

/// Kind of schema document produced by indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    /// DDL chunk of a model, view, or metric.
    TableSchema,
    TableDescription,
    View,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::TableSchema => "TABLE_SCHEMA",
            DocumentType::TableDescription => "TABLE_DESCRIPTION",
            DocumentType::View => "VIEW",
        }
    }
}

/// A retrievable unit: text content plus key-value metadata, optionally
/// carrying an embedding vector once it has passed through an embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Document {
    /// New document with a fresh UUID v4 id and no embedding.
    pub fn new(content: impl Into<String>, meta: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            meta,
            embedding: None,
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.meta_str(PROJECT_ID)
    }
}

/// Start a meta map, adding `project_id` first when a scope is given.
pub fn scoped_meta(project_id: Option<&str>) -> Map<String, Value> {
    let mut meta = Map::new();
    if let Some(id) = project_id {
        meta.insert(PROJECT_ID.to_string(), Value::String(id.to_string()));
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_has_unique_id() {
        let a = Document::new("a", Map::new());
        let b = Document::new("a", Map::new());
        assert_ne!(a.id, b.id);
        assert!(a.embedding.is_none());
    }

    #[test]
    fn test_scoped_meta() {
        assert!(scoped_meta(None).is_empty());
        let meta = scoped_meta(Some("p1"));
        let doc = Document::new("x", meta);
        assert_eq!(doc.project_id(), Some("p1"));
    }

    #[test]
    fn test_document_type_serializes_screaming_snake() {
        let json = serde_json::to_string(&DocumentType::TableDescription).unwrap();
        assert_eq!(json, "\"TABLE_DESCRIPTION\"");
        assert_eq!(DocumentType::TableSchema.as_str(), "TABLE_SCHEMA");
    }
}
