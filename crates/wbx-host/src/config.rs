use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wbx_cbor::Digest;

use crate::error::HostError;

pub const BASE_URL_ENV: &str = "WBX_BASE_URL";
pub const FETCH_TIMEOUT_ENV: &str = "WBX_FETCH_TIMEOUT_MS";

/// Layout of the virtual environment and where its assets come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Prefix for `root_pack/...` and `lazy_cache/...` asset URLs.
    pub base_url: String,
    /// Durable-backed subtree holding cached assets by digest.
    pub cache_root: String,
    pub toolchain_root: String,
    /// cwd for commands started through [`crate::Dispatcher::run`].
    pub working_dir: String,
    pub scratch_dir: String,
    /// Path that always routes to `bootstrap_tool`, bypassing directives.
    pub interpreter: String,
    pub bootstrap_tool: String,
    /// Tool that runs toolchain entry scripts.
    pub entry_tool: String,
    /// Lock files a crashed session may leave in the tree.
    pub lock_markers: Vec<String>,
    pub tools: Vec<ToolSpec>,
    pub fetch: FetchConfig,
    /// Optional directory for compiled tool images.
    pub module_cache_dir: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/static_lib".into(),
            cache_root: "/cache".into(),
            toolchain_root: "/emscripten".into(),
            working_dir: "/working".into(),
            scratch_dir: "/tmp".into(),
            interpreter: "/usr/bin/python".into(),
            bootstrap_tool: "python".into(),
            entry_tool: "main-python".into(),
            lock_markers: vec!["/emscripten/cache/cache.lock".into()],
            tools: vec![
                ToolSpec::new("llvm-box", "/wasm/llvm-box.wasm"),
                ToolSpec::new("binaryen-box", "/wasm/binaryen-box.wasm"),
                ToolSpec::new("node", "/wasm/quicknode.wasm"),
                ToolSpec::new("python", "/wasm/python.wasm"),
                ToolSpec::new("main-python", "/wasm/python.wasm"),
            ],
            fetch: FetchConfig::default(),
            module_cache_dir: None,
        }
    }
}

impl EnvConfig {
    /// Defaults overridden by `WBX_BASE_URL` and `WBX_FETCH_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, HostError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Read a JSON config file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, HostError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| HostError::Config(format!("read {}: {err}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|err| HostError::Config(format!("parse {}: {err}", path.display())))
    }

    pub fn apply_env(&mut self) -> Result<(), HostError> {
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            self.base_url = base_url;
        }
        if let Ok(raw) = std::env::var(FETCH_TIMEOUT_ENV) {
            let ms = raw.parse::<u64>().map_err(|_| {
                HostError::Config(format!("{FETCH_TIMEOUT_ENV} must be milliseconds, got '{raw}'"))
            })?;
            self.fetch.timeout_ms = ms;
        }
        Ok(())
    }

    /// `base_url` without trailing slashes, checked to be an absolute URL.
    pub fn base_url(&self) -> Result<String, HostError> {
        let trimmed = self.base_url.trim_end_matches('/');
        url::Url::parse(trimmed)
            .map_err(|err| HostError::Config(format!("invalid base url '{trimmed}': {err}")))?;
        Ok(trimmed.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    /// Tool image path inside the virtual tree.
    pub image: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
}

/// Configuration for remote asset fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { timeout_ms: 120_000 }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The assets an environment is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetIndex {
    /// Archive unpacked into `/` at startup; fetched from `<base>/root_pack<path>`.
    pub root_pack: AssetEntry,
    /// Files registered lazily below the toolchain root; fetched from
    /// `<base>/lazy_cache/<digest>.a`.
    #[serde(default)]
    pub lazy_cache: Vec<AssetEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub path: String,
    pub size: u64,
    pub digest: Digest,
}

impl AssetIndex {
    pub fn from_json(text: &str) -> Result<Self, HostError> {
        serde_json::from_str(text).map_err(|err| HostError::Config(format!("asset index: {err}")))
    }

    pub fn load(path: &Path) -> Result<Self, HostError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| HostError::Config(format!("read {}: {err}", path.display())))?;
        Self::from_json(&text)
    }
}
