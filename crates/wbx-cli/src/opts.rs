//! Global CLI options and environment resolution.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use wbx_host::{AssetIndex, EnvConfig, Environment, HttpFetcher};
use wbx_store::FsStore;

const DEFAULT_STORE_DIR: &str = ".wbx-cache";

/// Global options for CLI commands.
#[derive(Args, Debug, Clone)]
pub struct EnvOpts {
    /// Durable cache directory (env: WBX_STORE, default: ./.wbx-cache)
    #[arg(long, global = true, env = "WBX_STORE")]
    pub store: Option<PathBuf>,

    /// JSON environment config; unset fields keep their defaults (env: WBX_CONFIG)
    #[arg(long, global = true, env = "WBX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Asset base URL; overrides the config file and WBX_BASE_URL
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Local asset index instead of fetching <base-url>/index.json
    #[arg(long, global = true)]
    pub index: Option<PathBuf>,

    /// Directory for compiled tool images (env: WBX_MODULE_CACHE)
    #[arg(long, global = true, env = "WBX_MODULE_CACHE")]
    pub module_cache: Option<PathBuf>,

    /// Print the exit code and captured output as JSON instead of streaming
    #[arg(long, global = true)]
    pub json: bool,

    /// Debug logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl EnvOpts {
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR))
    }

    pub fn open_store(&self) -> Result<FsStore> {
        let dir = self.store_dir();
        FsStore::open(&dir).with_context(|| format!("open store {}", dir.display()))
    }

    /// File config, then environment overrides, then flags.
    pub fn env_config(&self) -> Result<EnvConfig> {
        let mut config = match &self.config {
            Some(path) => EnvConfig::from_file(path)?,
            None => EnvConfig::default(),
        };
        config.apply_env()?;
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if self.module_cache.is_some() {
            config.module_cache_dir = self.module_cache.clone();
        }
        Ok(config)
    }

    pub async fn start(&self) -> Result<Environment> {
        let config = self.env_config()?;
        let index = match &self.index {
            Some(path) => AssetIndex::load(path)?,
            None => {
                let fetcher = HttpFetcher::new(&config.fetch)?;
                Environment::fetch_index(&fetcher, &config.base_url()?)
                    .await
                    .context("fetch asset index")?
            }
        };
        let store = Arc::new(self.open_store()?);
        let env = Environment::start(config, &index, store)
            .await
            .context("start environment")?;
        Ok(env)
    }
}
