//! Document store abstraction.
//!
//! The [`DocumentStore`] trait is the only way pipelines touch persisted
//! documents, so backends are pluggable: [`memory::InMemoryDocumentStore`]
//! for tests and ephemeral servers, [`sqlite::SqliteDocumentStore`] for a
//! persistent index. Each store instance serves one dataset (one purpose:
//! schema DDL, table descriptions, or view questions).
//!
//! Implementations must be `Send + Sync` to be shared across pipeline nodes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::{Document, PROJECT_ID};

/// Dataset holding DDL chunks.
pub const DBSCHEMA_DATASET: &str = "db_schema";
/// Dataset holding one description record per model, metric, and view.
pub const TABLE_DESCRIPTIONS_DATASET: &str = "table_descriptions";
/// Dataset holding historical view questions.
pub const VIEW_QUESTIONS_DATASET: &str = "view_questions";

/// What to do when a written document's id already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Replace the stored document.
    #[default]
    Overwrite,
    /// Keep the stored document and do not count the write.
    Skip,
    /// Abort the write with an error.
    Fail,
}

/// One `field == value` test against document metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub value: Value,
}

/// An AND-combination of equality conditions over metadata fields.
///
/// An empty filter matches every document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::default().and_eq(field, value)
    }

    pub fn and_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    /// Filter for one project scope; `None` means "everything".
    pub fn for_project(project_id: Option<&str>) -> Option<Self> {
        project_id.map(|id| Self::eq(PROJECT_ID, id))
    }

    pub fn matches(&self, meta: &Map<String, Value>) -> bool {
        self.conditions.iter().all(|c| match meta.get(&c.field) {
            Some(v) => v == &c.value,
            None => c.value.is_null(),
        })
    }
}

/// Abstract document store for one dataset.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`write_documents`](DocumentStore::write_documents) | Insert documents under a [`DuplicatePolicy`] |
/// | [`delete_documents`](DocumentStore::delete_documents) | Delete everything matching a [`Filter`] |
/// | [`filter_documents`](DocumentStore::filter_documents) | Read documents matching a [`Filter`] |
/// | [`count_documents`](DocumentStore::count_documents) | Number of stored documents |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Dataset name, used in logs and aggregated errors.
    fn name(&self) -> &str;

    /// Write `documents`, returning how many were actually stored.
    async fn write_documents(&self, documents: &[Document], policy: DuplicatePolicy)
        -> Result<usize>;

    /// Delete documents matching `filter` (all documents when `None`),
    /// returning how many were removed.
    async fn delete_documents(&self, filter: Option<&Filter>) -> Result<usize>;

    async fn filter_documents(&self, filter: Option<&Filter>) -> Result<Vec<Document>>;

    async fn count_documents(&self) -> Result<usize>;
}
