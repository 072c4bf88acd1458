use std::sync::Arc;

use wbx_abi::{DynSandbox, ExecRequest, ExecResult, OutputSink};
use wbx_store::DynStore;
use wbx_vfs::path::join;
use wbx_vfs::{DynFetcher, Fetcher, Vfs, VirtualFileSystem};
use wbx_wasm::{ToolRuntime, WasmTool};

use crate::config::{AssetIndex, EnvConfig};
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::error::HostError;
use crate::fetch::HttpFetcher;
use crate::registry::ToolRegistry;

pub const INDEX_FILE: &str = "index.json";

/// A started environment: populated tree, initialized tools, and the
/// dispatcher that routes processes between them.
pub struct Environment {
    config: EnvConfig,
    fs: Arc<VirtualFileSystem>,
    registry: Arc<ToolRegistry>,
    dispatcher: Dispatcher,
}

impl Environment {
    /// Start with HTTP fetching and the configured wasm tool images.
    pub async fn start(
        config: EnvConfig,
        index: &AssetIndex,
        store: DynStore,
    ) -> Result<Self, HostError> {
        let fetcher: DynFetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
        let runtime = Arc::new(
            ToolRuntime::new_with_disk_cache(config.module_cache_dir.clone())
                .map_err(|err| HostError::Runtime(format!("{err:#}")))?,
        );
        let specs = config.tools.clone();
        Self::start_with(config, index, store, fetcher, move |vfs| {
            specs
                .into_iter()
                .map(|spec| {
                    let tool: DynSandbox = Arc::new(WasmTool::new(
                        spec.name.clone(),
                        spec.image,
                        vfs.clone(),
                        runtime.clone(),
                    ));
                    (spec.name, tool)
                })
                .collect()
        })
        .await
    }

    /// Start with an explicit fetcher and tool set. `make_tools` sees the
    /// tree the tools will run against.
    pub async fn start_with<F>(
        config: EnvConfig,
        index: &AssetIndex,
        store: DynStore,
        fetcher: DynFetcher,
        make_tools: F,
    ) -> Result<Self, HostError>
    where
        F: FnOnce(&Vfs) -> Vec<(String, DynSandbox)> + Send,
    {
        let base = config.base_url()?;
        let vfs = Vfs::new();
        let fs = Arc::new(
            VirtualFileSystem::open(
                vfs.clone(),
                &config.cache_root,
                &config.scratch_dir,
                store,
                fetcher,
            )
            .await?,
        );

        let root_pack = &index.root_pack;
        let pack_path = absolute(&root_pack.path);
        fs.cached_lazy_file(
            &pack_path,
            root_pack.size,
            &root_pack.digest,
            &format!("{base}/root_pack{pack_path}"),
        )
        .await?;
        fs.unpack(&[pack_path.as_str()]).await?;

        for entry in &index.lazy_cache {
            let rel = entry.path.trim_start_matches("./").trim_start_matches('/');
            let path = join(&config.toolchain_root, rel);
            let url = format!("{base}/lazy_cache/{}.a", entry.digest.as_str());
            fs.cached_lazy_file(&path, entry.size, &entry.digest, &url)
                .await?;
        }
        tracing::info!(entries = index.lazy_cache.len(), "lazy cache registered");

        for marker in &config.lock_markers {
            fs.remove_stale_lock(marker)?;
        }
        fs.mkdir_tree(&config.working_dir)?;

        let mut registry = ToolRegistry::new();
        for (name, tool) in make_tools(&vfs) {
            registry.register(name, tool);
        }
        registry.init_all().await?;
        let registry = Arc::new(registry);

        let dispatcher = Dispatcher::new(
            fs.clone(),
            registry.clone(),
            DispatchConfig::from(&config),
        );
        tracing::info!(base_url = %base, "environment started");
        Ok(Self {
            config,
            fs,
            registry,
            dispatcher,
        })
    }

    /// Fetch `<base>/index.json`.
    pub async fn fetch_index(fetcher: &dyn Fetcher, base_url: &str) -> Result<AssetIndex, HostError> {
        let url = format!("{}/{INDEX_FILE}", base_url.trim_end_matches('/'));
        let bytes = fetcher
            .fetch(&url)
            .await
            .map_err(wbx_vfs::VfsError::from)?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|err| HostError::Config(format!("asset index is not utf-8: {err}")))?;
        AssetIndex::from_json(text)
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn fs(&self) -> &Arc<VirtualFileSystem> {
        &self.fs
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn run(&self, args: Vec<String>, sink: OutputSink) -> Result<ExecResult, HostError> {
        self.dispatcher.run(args, sink).await
    }

    pub async fn exec(&self, request: ExecRequest) -> Result<ExecResult, HostError> {
        self.dispatcher.dispatch(request).await
    }
}

fn absolute(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path.trim_start_matches("./"))
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("base_url", &self.config.base_url)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
