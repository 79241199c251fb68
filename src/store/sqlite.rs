//! SQLite-backed [`DocumentStore`].
//!
//! All datasets share the `documents` table created by
//! [`migrate`](crate::migrate); each store instance is scoped to one
//! `dataset` value. Metadata is stored as JSON and filtered with
//! `json_extract`, embeddings as little-endian `f32` BLOBs.

use std::fmt::Display;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::Error;
use crate::models::Document;

use super::{DocumentStore, DuplicatePolicy, Filter};

pub struct SqliteDocumentStore {
    pool: SqlitePool,
    dataset: String,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool, dataset: &str) -> Self {
        Self {
            pool,
            dataset: dataset.to_string(),
        }
    }

    fn op_err(&self, e: impl Display) -> anyhow::Error {
        Error::StoreOperation(format!("{}: {}", self.dataset, e)).into()
    }
}

enum Bind {
    Text(String),
    Int(i64),
    Real(f64),
}

/// Append ` AND ...` clauses for `filter` to `sql`, returning the values to
/// bind after the dataset parameter.
fn push_filter(sql: &mut String, filter: Option<&Filter>) -> Vec<Bind> {
    let mut binds = Vec::new();
    let Some(filter) = filter else {
        return binds;
    };
    for condition in &filter.conditions {
        binds.push(Bind::Text(format!("$.\"{}\"", condition.field)));
        match &condition.value {
            Value::Null => sql.push_str(" AND json_extract(meta_json, ?) IS NULL"),
            Value::Bool(b) => {
                sql.push_str(" AND json_extract(meta_json, ?) = ?");
                binds.push(Bind::Int(i64::from(*b)));
            }
            Value::Number(n) => {
                sql.push_str(" AND json_extract(meta_json, ?) = ?");
                match n.as_i64() {
                    Some(i) => binds.push(Bind::Int(i)),
                    None => binds.push(Bind::Real(n.as_f64().unwrap_or_default())),
                }
            }
            Value::String(s) => {
                sql.push_str(" AND json_extract(meta_json, ?) = ?");
                binds.push(Bind::Text(s.clone()));
            }
            other => {
                sql.push_str(" AND json_extract(meta_json, ?) = json(?)");
                binds.push(Bind::Text(other.to_string()));
            }
        }
    }
    binds
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn name(&self) -> &str {
        &self.dataset
    }

    async fn write_documents(
        &self,
        documents: &[Document],
        policy: DuplicatePolicy,
    ) -> Result<usize> {
        let sql = match policy {
            DuplicatePolicy::Overwrite => {
                r#"
                INSERT INTO documents (dataset, id, content, meta_json, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(dataset, id) DO UPDATE SET
                    content = excluded.content,
                    meta_json = excluded.meta_json,
                    embedding = excluded.embedding
                "#
            }
            DuplicatePolicy::Skip => {
                "INSERT OR IGNORE INTO documents (dataset, id, content, meta_json, embedding) VALUES (?, ?, ?, ?, ?)"
            }
            DuplicatePolicy::Fail => {
                "INSERT INTO documents (dataset, id, content, meta_json, embedding) VALUES (?, ?, ?, ?, ?)"
            }
        };

        let mut tx = self.pool.begin().await.map_err(|e| self.op_err(e))?;
        let mut written = 0usize;
        for doc in documents {
            let meta_json = serde_json::to_string(&doc.meta)?;
            let blob = doc.embedding.as_deref().map(vec_to_blob);
            let result = sqlx::query(sql)
                .bind(&self.dataset)
                .bind(&doc.id)
                .bind(&doc.content)
                .bind(meta_json)
                .bind(blob)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.op_err(e))?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(|e| self.op_err(e))?;

        Ok(written)
    }

    async fn delete_documents(&self, filter: Option<&Filter>) -> Result<usize> {
        let mut sql = String::from("DELETE FROM documents WHERE dataset = ?");
        let binds = push_filter(&mut sql, filter);

        let mut query = sqlx::query(&sql).bind(&self.dataset);
        for b in binds {
            query = match b {
                Bind::Text(s) => query.bind(s),
                Bind::Int(i) => query.bind(i),
                Bind::Real(f) => query.bind(f),
            };
        }
        let result = query.execute(&self.pool).await.map_err(|e| self.op_err(e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn filter_documents(&self, filter: Option<&Filter>) -> Result<Vec<Document>> {
        let mut sql =
            String::from("SELECT id, content, meta_json, embedding FROM documents WHERE dataset = ?");
        let binds = push_filter(&mut sql, filter);
        sql.push_str(" ORDER BY rowid");

        let mut query = sqlx::query(&sql).bind(&self.dataset);
        for b in binds {
            query = match b {
                Bind::Text(s) => query.bind(s),
                Bind::Int(i) => query.bind(i),
                Bind::Real(f) => query.bind(f),
            };
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.op_err(e))?;

        rows.iter()
            .map(|row| {
                let meta_json: String = row.get("meta_json");
                let meta: Map<String, Value> = serde_json::from_str(&meta_json)?;
                let blob: Option<Vec<u8>> = row.get("embedding");
                Ok(Document {
                    id: row.get("id"),
                    content: row.get("content"),
                    meta,
                    embedding: blob.map(|b| blob_to_vec(&b)),
                })
            })
            .collect()
    }

    async fn count_documents(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE dataset = ?")
            .bind(&self.dataset)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.op_err(e))?;
        Ok(count as usize)
    }
}
