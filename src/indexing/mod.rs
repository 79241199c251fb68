//! MDL indexing pipeline.
//!
//! Turns an MDL manifest into retrievable documents in three stores:
//!
//! ```text
//! clean_document_store ─► validate_mdl ─┬─► convert_to_table_descriptions ─► embed_table_descriptions ─► write_table_description
//!                                       ├─► convert_to_ddl ──────────────────► embed_dbschema ──────────► write_dbschema
//!                                       └─► view_chunk ──────────────────────► embed_view ──────────────► write_view
//! ```
//!
//! A run first deletes everything previously indexed for the same project
//! scope, so re-indexing replaces rather than accumulates. The three
//! branches interleave after validation; the first failing node aborts the
//! run.

pub mod cleaner;
pub mod ddl;
pub mod description;
pub mod view;

use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::db::connect;
use crate::embedding::{create_embedder, Embedder};
use crate::error::Result;
use crate::migrate::migrate_pool;
use crate::mdl::{validate_mdl, Mdl};
use crate::models::Document;
use crate::pipeline::{Inputs, Pipeline, PipelineBuilder};
use crate::store::memory::InMemoryDocumentStore;
use crate::store::sqlite::SqliteDocumentStore;
use crate::store::{
    DocumentStore, DuplicatePolicy, DBSCHEMA_DATASET, TABLE_DESCRIPTIONS_DATASET,
    VIEW_QUESTIONS_DATASET,
};

const OUTPUTS: [&str; 3] = ["write_dbschema", "write_view", "write_table_description"];

/// The three per-purpose stores an indexing run writes to.
#[derive(Clone)]
pub struct IndexingStores {
    pub dbschema: Arc<dyn DocumentStore>,
    pub table_descriptions: Arc<dyn DocumentStore>,
    pub view_questions: Arc<dyn DocumentStore>,
}

impl IndexingStores {
    pub fn in_memory() -> Self {
        Self {
            dbschema: Arc::new(InMemoryDocumentStore::new(DBSCHEMA_DATASET)),
            table_descriptions: Arc::new(InMemoryDocumentStore::new(TABLE_DESCRIPTIONS_DATASET)),
            view_questions: Arc::new(InMemoryDocumentStore::new(VIEW_QUESTIONS_DATASET)),
        }
    }

    /// Stores sharing one migrated SQLite pool.
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            dbschema: Arc::new(SqliteDocumentStore::new(pool.clone(), DBSCHEMA_DATASET)),
            table_descriptions: Arc::new(SqliteDocumentStore::new(
                pool.clone(),
                TABLE_DESCRIPTIONS_DATASET,
            )),
            view_questions: Arc::new(SqliteDocumentStore::new(pool, VIEW_QUESTIONS_DATASET)),
        }
    }

    /// Stores selected by `[document_store].provider`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        match config.document_store.provider.as_str() {
            "memory" => Ok(Self::in_memory()),
            "sqlite" => {
                let pool = connect(config).await?;
                migrate_pool(&pool).await?;
                Ok(Self::sqlite(pool))
            }
            other => anyhow::bail!("Unknown document store provider: {}", other),
        }
    }

    pub fn all(&self) -> Vec<Arc<dyn DocumentStore>> {
        vec![
            self.dbschema.clone(),
            self.table_descriptions.clone(),
            self.view_questions.clone(),
        ]
    }
}

/// Documents written per store by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexingResult {
    pub write_dbschema: usize,
    pub write_view: usize,
    pub write_table_description: usize,
}

pub struct Indexing {
    pipeline: Pipeline,
    column_indexing_batch_size: usize,
}

impl Indexing {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        stores: IndexingStores,
        column_indexing_batch_size: usize,
    ) -> Result<Self> {
        let all_stores = stores.all();

        let mut builder = PipelineBuilder::new()
            .input("mdl_str")
            .input("id")
            .input("column_indexing_batch_size")
            .node(
                "clean_document_store",
                &["mdl_str", "id"],
                move |inputs| {
                    let stores = all_stores.clone();
                    async move {
                        let id = inputs.get::<Option<String>>("id")?;
                        cleaner::clean_stores(&stores, id.as_deref()).await?;
                        anyhow::Ok(inputs.get::<String>("mdl_str")?.clone())
                    }
                },
            )
            .node("validate_mdl", &["clean_document_store"], |inputs| async move {
                anyhow::Ok(validate_mdl(inputs.get::<String>("clean_document_store")?)?)
            })
            .node(
                "convert_to_table_descriptions",
                &["validate_mdl", "id"],
                |inputs| async move {
                    let mdl = inputs.get::<Mdl>("validate_mdl")?;
                    let id = inputs.get::<Option<String>>("id")?;
                    description::table_description_documents(mdl, id.as_deref())
                },
            )
            .node(
                "convert_to_ddl",
                &["validate_mdl", "column_indexing_batch_size", "id"],
                |inputs| async move {
                    let mdl = inputs.get::<Mdl>("validate_mdl")?;
                    let batch_size = *inputs.get::<usize>("column_indexing_batch_size")?;
                    let id = inputs.get::<Option<String>>("id")?;
                    ddl::convert_to_ddl(mdl, batch_size)
                        .iter()
                        .map(|chunk| chunk.to_document(id.as_deref()))
                        .collect::<anyhow::Result<Vec<Document>>>()
                },
            )
            .node("view_chunk", &["validate_mdl", "id"], |inputs| async move {
                let mdl = inputs.get::<Mdl>("validate_mdl")?;
                let id = inputs.get::<Option<String>>("id")?;
                anyhow::Ok(view::view_documents(mdl, id.as_deref()))
            });

        for (embed, convert, write, store) in [
            (
                "embed_table_descriptions",
                "convert_to_table_descriptions",
                "write_table_description",
                stores.table_descriptions,
            ),
            ("embed_dbschema", "convert_to_ddl", "write_dbschema", stores.dbschema),
            ("embed_view", "view_chunk", "write_view", stores.view_questions),
        ] {
            let embedder = embedder.clone();
            builder = builder
                .node(embed, &[convert], move |inputs| {
                    let embedder = embedder.clone();
                    let convert = convert.to_string();
                    async move {
                        let documents = inputs.get::<Vec<Document>>(&convert)?.clone();
                        embedder.embed_documents(documents).await
                    }
                })
                .node(write, &[embed], move |inputs| {
                    let store = store.clone();
                    let embed = embed.to_string();
                    async move {
                        let documents = inputs.get::<Vec<Document>>(&embed)?;
                        store
                            .write_documents(documents, DuplicatePolicy::Overwrite)
                            .await
                    }
                });
        }

        Ok(Self {
            pipeline: builder.build()?,
            column_indexing_batch_size,
        })
    }

    /// Indexing wired from `config`: configured embedder and stores.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let stores = IndexingStores::from_config(config).await?;
        Ok(Self::new(
            embedder,
            stores,
            config.indexing.column_indexing_batch_size,
        )?)
    }

    /// Replace the indexed documents for `id` with those derived from
    /// `mdl_str`.
    pub async fn run(&self, mdl_str: &str, id: Option<&str>) -> Result<IndexingResult> {
        info!(project_id = id.unwrap_or("*"), "indexing MDL");
        let inputs = Inputs::new()
            .with("mdl_str", mdl_str.to_string())
            .with("id", id.map(str::to_string))
            .with("column_indexing_batch_size", self.column_indexing_batch_size);

        let outputs = self.pipeline.execute(&OUTPUTS, inputs).await?;
        let result = IndexingResult {
            write_dbschema: *outputs.require::<usize>("write_dbschema")?,
            write_view: *outputs.require::<usize>("write_view")?,
            write_table_description: *outputs.require::<usize>("write_table_description")?,
        };
        info!(
            dbschema = result.write_dbschema,
            views = result.write_view,
            table_descriptions = result.write_table_description,
            "indexing finished"
        );
        Ok(result)
    }

    /// Graphviz rendering of the indexing graph.
    pub fn to_dot(&self) -> Result<String> {
        self.pipeline.to_dot(&OUTPUTS)
    }
}
