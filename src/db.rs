//! SQLite connection and schema migrations.

use crate::error::{DbError, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr as _;

/// Database handle shared by every store.
#[derive(Debug, Clone)]
pub struct Db {
    pub sqlite: SqlitePool,
}

impl Db {
    /// Open (creating if needed) `berth.db` under the data directory and run
    /// pending migrations.
    pub async fn connect(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("berth.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(DbError::SqliteConnect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let sqlite = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::SqliteConnect)?;

        Self::migrate(&sqlite).await?;
        tracing::debug!(path = %path.display(), "sqlite ready");

        Ok(Self { sqlite })
    }

    /// Single-connection in-memory database with the schema applied.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DbError::SqliteConnect)?
            .foreign_keys(true);

        // One connection: every connection to `:memory:` is a separate database.
        let sqlite = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(DbError::SqliteConnect)?;

        Self::migrate(&sqlite).await?;
        Ok(Self { sqlite })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|error| DbError::Migration(error.to_string()))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.sqlite.close().await;
    }
}
