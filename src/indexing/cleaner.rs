//! Delete a project's documents from every indexing store.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::{DocumentStore, Filter};

/// Delete documents scoped to `project_id` (everything when `None`) from
/// all `stores` concurrently.
///
/// Every deletion runs to completion. If any store fails, the failures are
/// reported together as one [`Error::StoreOperation`]; stores that succeeded
/// stay cleaned.
pub async fn clean_stores(
    stores: &[Arc<dyn DocumentStore>],
    project_id: Option<&str>,
) -> Result<usize> {
    let filter = Filter::for_project(project_id);
    let outcomes = join_all(
        stores
            .iter()
            .map(|store| store.delete_documents(filter.as_ref())),
    )
    .await;

    let mut deleted = 0;
    let mut failures = Vec::new();
    for (store, outcome) in stores.iter().zip(outcomes) {
        match outcome {
            Ok(n) => deleted += n,
            Err(e) => {
                warn!(store = store.name(), error = %e, "failed to clean document store");
                failures.push(format!("{} ({})", store.name(), e));
            }
        }
    }

    if !failures.is_empty() {
        return Err(Error::StoreOperation(format!(
            "cleaning failed for {}",
            failures.join(", ")
        )));
    }
    info!(deleted, project_id = project_id.unwrap_or("*"), "cleaned document stores");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{scoped_meta, Document};
    use crate::store::memory::InMemoryDocumentStore;
    use crate::store::DuplicatePolicy;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }
        async fn write_documents(
            &self,
            _documents: &[Document],
            _policy: DuplicatePolicy,
        ) -> anyhow::Result<usize> {
            anyhow::bail!("read-only")
        }
        async fn delete_documents(&self, _filter: Option<&Filter>) -> anyhow::Result<usize> {
            anyhow::bail!("connection refused")
        }
        async fn filter_documents(
            &self,
            _filter: Option<&Filter>,
        ) -> anyhow::Result<Vec<Document>> {
            Ok(Vec::new())
        }
        async fn count_documents(&self) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    async fn seeded(name: &str) -> Arc<InMemoryDocumentStore> {
        let store = Arc::new(InMemoryDocumentStore::new(name));
        store
            .write_documents(
                &[
                    Document::new("a", scoped_meta(Some("p1"))),
                    Document::new("b", scoped_meta(Some("p2"))),
                ],
                DuplicatePolicy::Overwrite,
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_scoped_clean_leaves_other_projects() {
        let a = seeded("a").await;
        let b = seeded("b").await;
        let stores: Vec<Arc<dyn DocumentStore>> = vec![a.clone(), b.clone()];

        let deleted = clean_stores(&stores, Some("p1")).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(a.count_documents().await.unwrap(), 1);
        assert_eq!(b.count_documents().await.unwrap(), 1);

        assert_eq!(clean_stores(&stores, None).await.unwrap(), 2);
        assert_eq!(clean_stores(&stores, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_aggregated_and_others_still_cleaned() {
        let good = seeded("good").await;
        let stores: Vec<Arc<dyn DocumentStore>> =
            vec![Arc::new(BrokenStore), good.clone(), Arc::new(BrokenStore)];

        let err = clean_stores(&stores, None).await.unwrap_err();
        let Error::StoreOperation(message) = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(message.matches("broken").count(), 2);
        assert!(message.contains("connection refused"));
        assert_eq!(good.count_documents().await.unwrap(), 0);
    }
}
