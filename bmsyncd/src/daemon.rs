use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bmsync_core::DavOptions;
use sqlx::SqlitePool;

use crate::accounts::{Account, AccountRegistry, AuthState};
use crate::db;
use crate::sync::backend::SyncClient;
use crate::sync::hub::SyncHub;
use crate::sync::local::{BookmarkStore, DocumentSink, FsBookmarkStore, LoggingDocumentSink};
use crate::sync::local_watcher::{forward_to_hub, start_notify_watcher};
use crate::sync::scheduler::Scheduler;
use crate::sync::state::SyncStateStore;
use crate::sync::syncer::Syncer;
use crate::sync::webdav::{WebDavSettings, WebDavSyncClient};

const APP_DIR_NAME: &str = "bmsync";
const DEFAULT_BOOKMARKS_DIR_NAME: &str = "bookmarks";
const DEFAULT_REMOTE_DIR: &str = "bmsync";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub bookmarks_dir: PathBuf,
    pub state_db: PathBuf,
    pub remote_dir: String,
    pub sync_interval: Duration,
    pub enable_local_watcher: bool,
    pub recompute_checksums: bool,
    pub accept_invalid_certs: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_root = dirs::data_dir()
            .unwrap_or_else(|| home.join(".local/share"))
            .join(APP_DIR_NAME);
        let bookmarks_dir = std::env::var("BMSYNC_BOOKMARKS_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| data_root.join(DEFAULT_BOOKMARKS_DIR_NAME));
        let state_db = std::env::var("BMSYNC_STATE_DB")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .or_else(db::default_db_path)
            .unwrap_or_else(|| data_root.join("state.db"));
        let remote_dir =
            std::env::var("BMSYNC_REMOTE_DIR").unwrap_or_else(|_| DEFAULT_REMOTE_DIR.to_string());
        let sync_interval = Duration::from_secs(read_u64_env(
            "BMSYNC_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
        ));

        Ok(Self {
            bookmarks_dir,
            state_db,
            remote_dir,
            sync_interval,
            enable_local_watcher: read_bool_env("BMSYNC_ENABLE_LOCAL_WATCHER", true),
            recompute_checksums: read_bool_env("BMSYNC_RECOMPUTE_CHECKSUMS", true),
            accept_invalid_certs: read_bool_env("BMSYNC_ACCEPT_INVALID_CERTS", false),
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    registry: AccountRegistry,
    state: SyncStateStore,
    hub: Arc<SyncHub>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.bookmarks_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create bookmarks directory at {:?}",
                    config.bookmarks_dir
                )
            })?;
        let pool = db::open_pool(&config.state_db)
            .await
            .with_context(|| format!("failed to open state database at {:?}", config.state_db))?;
        Ok(Self::with_pool(config, pool))
    }

    pub fn with_pool(config: DaemonConfig, pool: SqlitePool) -> Self {
        Self {
            config,
            registry: AccountRegistry::from_pool(pool.clone()),
            state: SyncStateStore::from_pool(pool),
            hub: Arc::new(SyncHub::new()),
        }
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    /// Builds an engine for every enabled account this build can talk to.
    pub async fn start_syncers(&self) -> anyhow::Result<Vec<Arc<Syncer>>> {
        let files: Arc<dyn BookmarkStore> =
            Arc::new(FsBookmarkStore::new(&self.config.bookmarks_dir));
        let sink: Arc<dyn DocumentSink> = Arc::new(LoggingDocumentSink);
        let accounts = self
            .registry
            .enabled_accounts()
            .await
            .context("failed to load accounts")?;

        let mut syncers = Vec::with_capacity(accounts.len());
        for account in accounts {
            let Some(client) = client_for(&self.config, &account)? else {
                tracing::info!(
                    account_id = account.id,
                    backend = account.backend.as_str(),
                    "backend not supported by this daemon, skipping account"
                );
                continue;
            };
            let syncer = Syncer::new(
                account.id,
                client,
                Arc::clone(&files),
                self.state.clone(),
                Arc::clone(&self.hub),
                Arc::clone(&sink),
            )
            .await
            .with_context(|| format!("failed to start sync for account {}", account.id))?;
            tracing::info!(
                account_id = account.id,
                user = %account.auth.username(),
                "account sync enabled"
            );
            syncers.push(Arc::new(syncer));
        }
        Ok(syncers)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            bookmarks_dir = %self.config.bookmarks_dir.display(),
            remote_dir = %self.config.remote_dir,
            local_watcher = self.config.enable_local_watcher,
            "bmsyncd started"
        );

        let syncers = self.start_syncers().await?;
        if syncers.is_empty() {
            tracing::warn!("no enabled accounts, add one with --add-nextcloud");
        }

        // Started before the first cycle so no edit slips between rescan and
        // watch.
        let (watcher, forward_handle) = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.bookmarks_dir) {
                Ok((watcher, rx)) => (Some(watcher), Some(forward_to_hub(rx, Arc::clone(&self.hub)))),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to start local watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let mut scheduler = Scheduler::new(self.config.sync_interval, self.registry.clone());
        for syncer in &syncers {
            scheduler.spawn_account(Arc::clone(syncer));
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        tracing::info!("shutting down");

        drop(watcher);
        scheduler.shutdown().await;
        if let Some(handle) = forward_handle {
            handle.abort();
        }
        // Nothing watches the folder until the next start.
        for syncer in &syncers {
            if let Err(err) = syncer.on_sync_disabled().await {
                tracing::warn!(account_id = syncer.account_id(), error = %err, "failed to mark sync state stale");
            }
        }
        Ok(())
    }
}

/// The backend client for an account, or `None` if this build has no
/// implementation for its backend.
pub fn client_for(
    config: &DaemonConfig,
    account: &Account,
) -> anyhow::Result<Option<Arc<dyn SyncClient>>> {
    match &account.auth {
        AuthState::Nextcloud {
            server,
            login_name,
            app_password,
        } => {
            let client = WebDavSyncClient::new(WebDavSettings {
                server: server.clone(),
                login_name: login_name.clone(),
                app_password: app_password.clone(),
                remote_dir: config.remote_dir.clone(),
                recompute_checksums: config.recompute_checksums,
                dav: DavOptions {
                    accept_invalid_certs: config.accept_invalid_certs,
                    ..DavOptions::default()
                },
            })
            .with_context(|| format!("invalid server address for account {}", account.id))?;
            Ok(Some(Arc::new(client)))
        }
        AuthState::GoogleDrive { .. } => Ok(None),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
