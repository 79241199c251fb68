use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::config::Config;

/// Open the document database configured in `[db]`.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_path(&config.db.path, true).await
}

/// Open a SQLite file. Read-only pools never create the file.
pub async fn connect_path(db_path: &Path, writable: bool) -> Result<SqlitePool> {
    if writable {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(writable)
        .read_only(!writable);
    let options = if writable {
        options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
    } else {
        options
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
