use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;

use crate::db::MIGRATOR;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("malformed auth state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown backend id: {0}")]
    InvalidBackend(i64),
}

/// Cloud backend an account talks to. The numeric ids are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Nextcloud,
    GoogleDrive,
}

impl BackendKind {
    pub fn id(self) -> i64 {
        match self {
            BackendKind::Nextcloud => 0,
            BackendKind::GoogleDrive => 1,
        }
    }

    pub fn from_id(id: i64) -> Result<Self, AccountError> {
        match id {
            0 => Ok(BackendKind::Nextcloud),
            1 => Ok(BackendKind::GoogleDrive),
            other => Err(AccountError::InvalidBackend(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Nextcloud => "nextcloud",
            BackendKind::GoogleDrive => "google-drive",
        }
    }
}

/// Credentials and identity of one cloud account.
///
/// Equality compares the remote identity only, so re-adding an account with a
/// fresh app password or refresh token is recognized as the same account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthState {
    Nextcloud {
        server: String,
        login_name: String,
        app_password: String,
    },
    GoogleDrive {
        refresh_token: String,
        email: String,
        /// OpenID subject, stable across e-mail changes.
        sub: String,
    },
}

impl AuthState {
    pub fn backend(&self) -> BackendKind {
        match self {
            AuthState::Nextcloud { .. } => BackendKind::Nextcloud,
            AuthState::GoogleDrive { .. } => BackendKind::GoogleDrive,
        }
    }

    pub fn is_same_identity(&self, other: &AuthState) -> bool {
        match (self, other) {
            (
                AuthState::Nextcloud {
                    server: a_server,
                    login_name: a_login,
                    ..
                },
                AuthState::Nextcloud {
                    server: b_server,
                    login_name: b_login,
                    ..
                },
            ) => normalize_server(a_server) == normalize_server(b_server) && a_login == b_login,
            (AuthState::GoogleDrive { sub: a, .. }, AuthState::GoogleDrive { sub: b, .. }) => {
                a == b
            }
            _ => false,
        }
    }

    /// Name shown to the user for this account.
    pub fn username(&self) -> String {
        match self {
            AuthState::Nextcloud {
                server, login_name, ..
            } => format!("{login_name}@{}", server_host(server)),
            AuthState::GoogleDrive { email, .. } => email.clone(),
        }
    }
}

impl PartialEq for AuthState {
    fn eq(&self, other: &Self) -> bool {
        self.is_same_identity(other)
    }
}

impl Eq for AuthState {}

fn normalize_server(server: &str) -> String {
    server.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn server_host(server: &str) -> String {
    url::Url::parse(server)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| server.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: u64,
    pub backend: BackendKind,
    pub auth: AuthState,
    pub enabled: bool,
    /// Unix time in milliseconds of the last successful sync.
    pub last_synced: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddAccountResult {
    Success(u64),
    AlreadyExists,
    UnexpectedError,
}

/// Persistent list of sync accounts. Ids come from an AUTOINCREMENT column
/// and are never handed out twice, even after removal.
#[derive(Clone)]
pub struct AccountRegistry {
    pool: SqlitePool,
}

impl AccountRegistry {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<(), AccountError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn add_account(&self, auth: AuthState) -> AddAccountResult {
        match self.try_add_account(auth).await {
            Ok(Some(id)) => AddAccountResult::Success(id),
            Ok(None) => AddAccountResult::AlreadyExists,
            Err(err) => {
                tracing::error!(error = %err, "failed to add account");
                AddAccountResult::UnexpectedError
            }
        }
    }

    async fn try_add_account(&self, auth: AuthState) -> Result<Option<u64>, AccountError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT auth FROM accounts WHERE backend = ?1")
            .bind(auth.backend().id())
            .fetch_all(&mut *tx)
            .await?;
        for row in rows {
            let raw: String = row.try_get("auth")?;
            let existing: AuthState = serde_json::from_str(&raw)?;
            if existing.is_same_identity(&auth) {
                return Ok(None);
            }
        }
        let result = sqlx::query("INSERT INTO accounts (backend, auth, enabled) VALUES (?1, ?2, 1)")
            .bind(auth.backend().id())
            .bind(serde_json::to_string(&auth)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        let id = result.last_insert_rowid() as u64;
        tracing::info!(account_id = id, backend = auth.backend().as_str(), "account added");
        Ok(Some(id))
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, AccountError> {
        let rows = sqlx::query(
            "SELECT id, backend, auth, enabled, last_synced FROM accounts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn enabled_accounts(&self) -> Result<Vec<Account>, AccountError> {
        Ok(self
            .list_accounts()
            .await?
            .into_iter()
            .filter(|account| account.enabled)
            .collect())
    }

    pub async fn get_account(&self, id: u64) -> Result<Option<Account>, AccountError> {
        let row = sqlx::query(
            "SELECT id, backend, auth, enabled, last_synced FROM accounts WHERE id = ?1",
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    /// Returns `false` if no such account exists. Disabling also marks the
    /// account's dirty set stale: edits made while it is off are only found by
    /// a rescan once it is enabled again.
    pub async fn set_enabled(&self, id: u64, enabled: bool) -> Result<bool, AccountError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE accounts SET enabled = ?1 WHERE id = ?2")
            .bind(enabled)
            .bind(id as i64)
            .execute(&mut *tx)
            .await?;
        let found = result.rows_affected() > 0;
        if found && !enabled {
            sqlx::query(
                "INSERT INTO sync_meta (account_id, dirty_cache_valid) VALUES (?1, 0)
                 ON CONFLICT(account_id) DO UPDATE SET dirty_cache_valid = 0",
            )
            .bind(id as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(found)
    }

    pub async fn set_last_synced(&self, id: u64, unix_millis: i64) -> Result<(), AccountError> {
        sqlx::query("UPDATE accounts SET last_synced = ?1 WHERE id = ?2")
            .bind(unix_millis)
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the account together with all of its sync state.
    pub async fn remove_account(&self, id: u64) -> Result<bool, AccountError> {
        let mut tx = self.pool.begin().await?;
        for table in ["checksums", "dirty_files", "sync_meta"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE account_id = ?1"))
                .bind(id as i64)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(id as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

fn account_from_row(row: &SqliteRow) -> Result<Account, AccountError> {
    let id: i64 = row.try_get("id")?;
    let backend: i64 = row.try_get("backend")?;
    let auth: String = row.try_get("auth")?;
    Ok(Account {
        id: id as u64,
        backend: BackendKind::from_id(backend)?,
        auth: serde_json::from_str(&auth)?,
        enabled: row.try_get("enabled")?,
        last_synced: row.try_get("last_synced")?,
    })
}
