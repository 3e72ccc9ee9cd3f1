use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// File name of each knowledge base's database inside its storage directory.
pub const DB_FILE: &str = "index.sqlite";

/// Open (creating if needed) the SQLite database of one knowledge base.
pub async fn connect(base_dir: &Path) -> Result<SqlitePool> {
    std::fs::create_dir_all(base_dir)?;
    let db_path = base_dir.join(DB_FILE);

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
