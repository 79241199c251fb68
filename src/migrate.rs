use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the document tables in the configured database. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // One table for every dataset; a dataset is one logical store.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            dataset TEXT NOT NULL,
            id TEXT NOT NULL,
            content TEXT NOT NULL,
            meta_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            PRIMARY KEY (dataset, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_dataset ON documents(dataset)")
        .execute(pool)
        .await?;

    Ok(())
}
