use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::db::MIGRATOR;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMeta {
    /// Last observed remote directory token; `None` if the directory did not
    /// exist at the last check.
    pub dir_token: Option<String>,
    pub dirty_cache_valid: bool,
}

/// Durable per-account sync state: last-synced checksums, the dirty set and
/// the remote directory token. Rows of all accounts share one database.
#[derive(Clone)]
pub struct SyncStateStore {
    pool: SqlitePool,
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl SyncStateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<(), StateError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// A missing row reads as "no token, cache invalid".
    pub async fn load_meta(&self, account_id: u64) -> Result<SyncMeta, StateError> {
        let row = sqlx::query(
            "SELECT dir_token, dirty_cache_valid FROM sync_meta WHERE account_id = ?1",
        )
        .bind(account_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(SyncMeta::default());
        };
        Ok(SyncMeta {
            dir_token: row.try_get("dir_token")?,
            dirty_cache_valid: row.try_get("dirty_cache_valid")?,
        })
    }

    pub async fn set_dir_token(
        &self,
        account_id: u64,
        token: Option<&str>,
    ) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO sync_meta (account_id, dir_token) VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET dir_token = excluded.dir_token",
        )
        .bind(account_id as i64)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_dirty_cache_valid(
        &self,
        account_id: u64,
        valid: bool,
    ) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO sync_meta (account_id, dirty_cache_valid) VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET dirty_cache_valid = excluded.dirty_cache_valid",
        )
        .bind(account_id as i64)
        .bind(valid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn checksums(&self, account_id: u64) -> Result<HashMap<PathBuf, String>, StateError> {
        let rows = sqlx::query("SELECT path, checksum FROM checksums WHERE account_id = ?1")
            .bind(account_id as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let path: String = row.try_get("path")?;
            out.insert(PathBuf::from(path), row.try_get("checksum")?);
        }
        Ok(out)
    }

    pub async fn checksum(
        &self,
        account_id: u64,
        path: &Path,
    ) -> Result<Option<String>, StateError> {
        let row = sqlx::query(
            "SELECT checksum FROM checksums WHERE account_id = ?1 AND path = ?2",
        )
        .bind(account_id as i64)
        .bind(path_key(path))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row.try_get("checksum"))
            .transpose()
            .map_err(StateError::from)
    }

    pub async fn set_checksum(
        &self,
        account_id: u64,
        path: &Path,
        checksum: &str,
    ) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO checksums (account_id, path, checksum) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id, path) DO UPDATE SET checksum = excluded.checksum",
        )
        .bind(account_id as i64)
        .bind(path_key(path))
        .bind(checksum)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_checksum(&self, account_id: u64, path: &Path) -> Result<(), StateError> {
        sqlx::query("DELETE FROM checksums WHERE account_id = ?1 AND path = ?2")
            .bind(account_id as i64)
            .bind(path_key(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn dirty_files(&self, account_id: u64) -> Result<BTreeSet<PathBuf>, StateError> {
        let rows = sqlx::query("SELECT path FROM dirty_files WHERE account_id = ?1")
            .bind(account_id as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeSet::new();
        for row in rows {
            let path: String = row.try_get("path")?;
            out.insert(PathBuf::from(path));
        }
        Ok(out)
    }

    pub async fn add_dirty<'a>(
        &self,
        account_id: u64,
        paths: impl IntoIterator<Item = &'a Path>,
    ) -> Result<(), StateError> {
        let mut tx = self.pool.begin().await?;
        for path in paths {
            sqlx::query("INSERT OR IGNORE INTO dirty_files (account_id, path) VALUES (?1, ?2)")
                .bind(account_id as i64)
                .bind(path_key(path))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_dirty(&self, account_id: u64, path: &Path) -> Result<(), StateError> {
        sqlx::query("DELETE FROM dirty_files WHERE account_id = ?1 AND path = ?2")
            .bind(account_id as i64)
            .bind(path_key(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_dirty(&self, account_id: u64) -> Result<(), StateError> {
        sqlx::query("DELETE FROM dirty_files WHERE account_id = ?1")
            .bind(account_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Forgets every checksum and the directory token. The dirty set is left
    /// to the caller, which rebuilds it from a scan.
    pub async fn reset(&self, account_id: u64) -> Result<(), StateError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checksums WHERE account_id = ?1")
            .bind(account_id as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_meta WHERE account_id = ?1")
            .bind(account_id as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
