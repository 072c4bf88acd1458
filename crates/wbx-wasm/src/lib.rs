//! Wasmtime runner for sandboxed tool images.

mod host;
mod images;
mod tool;

pub use host::{HOST_MODULE, ToolContext, errno};
pub use tool::WasmTool;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use wasmtime::{Config, Engine, Linker, Module, Store};
use wbx_abi::{ExecResult, StdStream, ToolInput, ToolOutput};

use crate::host::HostState;
use crate::images::ImageCache;

const RUN_EXPORT: &str = "run";
pub(crate) const ALLOC_EXPORT: &str = "alloc";
pub(crate) const MEMORY_EXPORT: &str = "memory";

/// One engine shared by every tool, plus its compiled images.
pub struct ToolRuntime {
    engine: Engine,
    images: ImageCache,
}

pub(crate) fn engine_config() -> Config {
    let mut cfg = Config::new();
    cfg.wasm_multi_value(true);
    cfg.wasm_threads(false);
    cfg.wasm_reference_types(true);
    cfg.debug_info(false);
    cfg
}

impl ToolRuntime {
    pub fn new() -> Result<Self> {
        Self::new_with_disk_cache(None)
    }

    /// With `cache_dir`, compiled images are also kept on disk and reused by
    /// later runtimes.
    pub fn new_with_disk_cache(cache_dir: Option<PathBuf>) -> Result<Self> {
        let engine = Engine::new(&engine_config()).context("create wasm engine")?;
        Ok(Self {
            engine,
            images: ImageCache::new(cache_dir)?,
        })
    }

    pub fn compile(&self, wasm_bytes: &[u8]) -> Result<Module> {
        Module::new(&self.engine, wasm_bytes)
    }

    /// Compiled module for an image, compiling only on first sight.
    pub fn cached_module(&self, wasm_bytes: &[u8]) -> Result<Arc<Module>> {
        self.images.get_or_compile(&self.engine, wasm_bytes)
    }

    /// Run one process in a fresh instance of `module`. Blocks the calling
    /// thread; host imports reach the async world through `ctx.handle`.
    pub fn run_compiled(
        &self,
        module: &Module,
        ctx: ToolContext,
        input: &ToolInput,
    ) -> Result<ExecResult> {
        let cwd = input.cwd.clone().unwrap_or_else(|| "/".to_string());
        let mut store = Store::new(&self.engine, HostState::new(ctx, cwd));
        let mut linker = Linker::new(&self.engine);
        host::add_to_linker(&mut linker)?;
        let instance = linker
            .instantiate(&mut store, module)
            .context("instantiate tool image")?;
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .with_context(|| format!("tool image exports no '{MEMORY_EXPORT}'"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .with_context(|| format!("tool image export '{ALLOC_EXPORT}'"))?;
        let run = instance
            .get_typed_func::<(i32, i32), (i32, i32)>(&mut store, RUN_EXPORT)
            .with_context(|| format!("tool image export '{RUN_EXPORT}'"))?;

        let request = input.encode()?;
        let request_len = i32::try_from(request.len()).context("request exceeds wasm32 memory")?;
        let request_ptr = alloc.call(&mut store, request_len)?;
        memory.write(&mut store, request_ptr as u32 as usize, &request)?;

        let (reply_ptr, reply_len) = run.call(&mut store, (request_ptr, request_len))?;
        let mut reply = vec![0u8; usize::try_from(reply_len).context("negative reply length")?];
        memory.read(&store, reply_ptr as u32 as usize, &mut reply)?;
        let output = ToolOutput::decode(&reply)?;

        // Output printed through the host comes before the final streams.
        let mut capture = store.into_data().output;
        capture.push(StdStream::Stdout, &output.stdout);
        capture.push(StdStream::Stderr, &output.stderr);
        Ok(capture.finish(output.returncode))
    }

    #[cfg(test)]
    fn cached_module_count(&self) -> usize {
        self.images.len()
    }
}
