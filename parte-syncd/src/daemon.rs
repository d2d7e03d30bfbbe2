use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parte_core::RestClient;
use tracing::{debug, info, warn};

use crate::sync::backoff::Backoff;
use crate::sync::engine::{EngineConfig, EngineError, PullReport, SyncEngine, SyncResult};
use crate::sync::remote::{RemoteAdapter, RestRemote};
use crate::sync::store::{EntityType, LocalStore, default_db_path};

const DEFAULT_PULL_SECS: u64 = 30;
const DEFAULT_PUSH_SECS: u64 = 10;
const DEFAULT_MAX_RETRIES: u64 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub remote_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub db_path: PathBuf,
    pub pull_interval: Duration,
    pub push_interval: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub seed_on_start: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let db_path = match non_empty_env("PARTE_DB_PATH") {
            Some(value) => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            None => default_db_path().context("no data directory for the offline store")?,
        };
        let pull_interval =
            Duration::from_secs(read_u64_env("PARTE_PULL_SECS", DEFAULT_PULL_SECS));
        let push_interval =
            Duration::from_secs(read_u64_env("PARTE_PUSH_SECS", DEFAULT_PUSH_SECS));
        let max_retries = u32::try_from(read_u64_env("PARTE_MAX_RETRIES", DEFAULT_MAX_RETRIES))
            .context("PARTE_MAX_RETRIES is out of range")?;
        let backoff_base = Duration::from_millis(read_u64_env(
            "PARTE_BACKOFF_BASE_MS",
            DEFAULT_BACKOFF_BASE_MS,
        ));
        let backoff_max = Duration::from_millis(read_u64_env(
            "PARTE_BACKOFF_MAX_MS",
            DEFAULT_BACKOFF_MAX_MS,
        ));

        Ok(Self {
            remote_url: non_empty_env("PARTE_REMOTE_URL"),
            api_key: non_empty_env("PARTE_API_KEY"),
            access_token: non_empty_env("PARTE_ACCESS_TOKEN"),
            db_path,
            pull_interval,
            push_interval,
            max_retries,
            backoff_base,
            backoff_max,
            seed_on_start: read_bool_env("PARTE_SEED_ON_START", true),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_retries: self.max_retries,
            backoff: Backoff::new(self.backoff_base, self.backoff_max, true),
        }
    }

    /// Builds the PostgREST adapter; only network commands need one.
    pub fn remote(&self) -> anyhow::Result<RestRemote> {
        let url = self
            .remote_url
            .as_deref()
            .context("PARTE_REMOTE_URL is not set")?;
        let api_key = self.api_key.as_deref().context("PARTE_API_KEY is not set")?;
        let mut client = RestClient::new(url, api_key).context("invalid remote url")?;
        if let Some(token) = &self.access_token {
            client = client.with_access_token(token.clone());
        }
        Ok(RestRemote::new(client))
    }

    pub async fn open_store(&self) -> anyhow::Result<LocalStore> {
        LocalStore::open(&self.db_path)
            .await
            .with_context(|| format!("failed to open offline store at {:?}", self.db_path))
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let remote = config.remote()?;
        let store = config.open_store().await?;
        let engine = Arc::new(SyncEngine::new(remote, store, config.engine_config()));
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            db = %self.config.db_path.display(),
            pull_secs = self.config.pull_interval.as_secs(),
            push_secs = self.config.push_interval.as_secs(),
            "daemon started"
        );

        if self.config.seed_on_start {
            match seed_if_empty(&self.engine).await {
                Ok(Some(reports)) => log_pull(&reports),
                Ok(None) => debug!("store already seeded"),
                Err(err) => warn!(error = %err, "initial download failed"),
            }
        }

        let engine_for_pull = Arc::clone(&self.engine);
        let pull_interval = self.config.pull_interval;
        let pull_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(pull_interval).await;
                if !pull_once(&engine_for_pull).await {
                    break;
                }
            }
        });

        let engine_for_push = Arc::clone(&self.engine);
        let push_interval = self.config.push_interval;
        let push_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(push_interval).await;
                if !push_once(&engine_for_push).await {
                    break;
                }
            }
        });

        let cancel = self.engine.cancellation_token();
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed waiting for shutdown signal")?;
                info!("shutdown requested");
            }
            _ = cancel.cancelled() => {}
        }

        cancel.cancel();
        pull_handle.abort();
        push_handle.abort();
        self.engine.store().close().await;
        info!("daemon stopped");

        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
