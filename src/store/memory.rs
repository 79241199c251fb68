//! In-memory [`DocumentStore`] for tests and ephemeral servers.
//!
//! Documents live in a `Vec` behind `std::sync::RwLock`, kept in insertion
//! order; an overwrite replaces the document in place.

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::Error;
use crate::models::Document;

use super::{DocumentStore, DuplicatePolicy, Filter};

pub struct InMemoryDocumentStore {
    name: String,
    docs: RwLock<Vec<Document>>,
}

impl InMemoryDocumentStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            docs: RwLock::new(Vec::new()),
        }
    }

    fn poisoned(&self) -> anyhow::Error {
        Error::StoreOperation(format!("{}: lock poisoned", self.name)).into()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_documents(
        &self,
        documents: &[Document],
        policy: DuplicatePolicy,
    ) -> Result<usize> {
        let mut docs = self.docs.write().map_err(|_| self.poisoned())?;

        if policy == DuplicatePolicy::Fail {
            if let Some(dup) = documents
                .iter()
                .find(|d| docs.iter().any(|existing| existing.id == d.id))
            {
                return Err(Error::StoreOperation(format!(
                    "{}: document {} already exists",
                    self.name, dup.id
                ))
                .into());
            }
        }

        let mut written = 0;
        for doc in documents {
            match docs.iter().position(|existing| existing.id == doc.id) {
                Some(pos) => {
                    if policy == DuplicatePolicy::Overwrite {
                        docs[pos] = doc.clone();
                        written += 1;
                    }
                }
                None => {
                    docs.push(doc.clone());
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn delete_documents(&self, filter: Option<&Filter>) -> Result<usize> {
        let mut docs = self.docs.write().map_err(|_| self.poisoned())?;
        let before = docs.len();
        match filter {
            Some(f) => docs.retain(|d| !f.matches(&d.meta)),
            None => docs.clear(),
        }
        Ok(before - docs.len())
    }

    async fn filter_documents(&self, filter: Option<&Filter>) -> Result<Vec<Document>> {
        let docs = self.docs.read().map_err(|_| self.poisoned())?;
        Ok(docs
            .iter()
            .filter(|d| filter.map_or(true, |f| f.matches(&d.meta)))
            .cloned()
            .collect())
    }

    async fn count_documents(&self) -> Result<usize> {
        Ok(self.docs.read().map_err(|_| self.poisoned())?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::scoped_meta;

    fn doc(id: &str, project: Option<&str>, content: &str) -> Document {
        let mut d = Document::new(content, scoped_meta(project));
        d.id = id.to_string();
        d
    }

    #[tokio::test]
    async fn test_write_policies() {
        let store = InMemoryDocumentStore::new("test");
        let n = store
            .write_documents(&[doc("1", None, "a"), doc("2", None, "b")], DuplicatePolicy::Overwrite)
            .await
            .unwrap();
        assert_eq!(n, 2);

        let n = store
            .write_documents(&[doc("1", None, "a2")], DuplicatePolicy::Overwrite)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let n = store
            .write_documents(&[doc("2", None, "b2")], DuplicatePolicy::Skip)
            .await
            .unwrap();
        assert_eq!(n, 0);

        let err = store
            .write_documents(&[doc("2", None, "b3")], DuplicatePolicy::Fail)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::StoreOperation(_))
        ));

        let docs = store.filter_documents(None).await.unwrap();
        let contents: Vec<&str> = docs.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(contents, vec!["a2", "b"]);
    }

    #[tokio::test]
    async fn test_delete_by_scope() {
        let store = InMemoryDocumentStore::new("test");
        store
            .write_documents(
                &[
                    doc("1", Some("p1"), "a"),
                    doc("2", Some("p2"), "b"),
                    doc("3", Some("p1"), "c"),
                ],
                DuplicatePolicy::Overwrite,
            )
            .await
            .unwrap();

        let removed = store
            .delete_documents(Filter::for_project(Some("p1")).as_ref())
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count_documents().await.unwrap(), 1);

        let removed = store.delete_documents(None).await.unwrap();
        assert_eq!(removed, 1);
        // Deleting from an empty store is a no-op.
        assert_eq!(store.delete_documents(None).await.unwrap(), 0);
    }
}
