use std::sync::{Arc, OnceLock};

use anyhow::Context;
use async_trait::async_trait;
use tokio::runtime::Handle;
use wasmtime::Module;
use wbx_abi::{ExecRequest, ExecResult, Sandbox, Spawner, ToolInput};
use wbx_vfs::Vfs;

use crate::{ToolContext, ToolRuntime};

/// A tool image stored in the shared tree, compiled once at `init`.
pub struct WasmTool {
    name: String,
    image: String,
    vfs: Vfs,
    runtime: Arc<ToolRuntime>,
    module: OnceLock<Arc<Module>>,
}

impl WasmTool {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        vfs: Vfs,
        runtime: Arc<ToolRuntime>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            vfs,
            runtime,
            module: OnceLock::new(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }
}

#[async_trait]
impl Sandbox for WasmTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> anyhow::Result<()> {
        if self.module.get().is_some() {
            return Ok(());
        }
        let bytes = self
            .vfs
            .read_file(&self.image)
            .await
            .with_context(|| format!("read image {}", self.image))?;
        let runtime = self.runtime.clone();
        let module = tokio::task::spawn_blocking(move || runtime.cached_module(&bytes))
            .await
            .context("compile task aborted")?
            .with_context(|| format!("compile image {}", self.image))?;
        log::info!("tool {} ready ({})", self.name, self.image);
        let _ = self.module.set(module);
        Ok(())
    }

    async fn execute(&self, request: ExecRequest, spawner: Spawner) -> ExecResult {
        let Some(module) = self.module.get().cloned() else {
            return ExecResult::failure(1, format!("{}: tool is not initialized\n", self.name));
        };
        let ctx = ToolContext {
            vfs: self.vfs.clone(),
            spawner,
            handle: Handle::current(),
            sink: request.sink.clone(),
        };
        let input = ToolInput::from(&request);
        let runtime = self.runtime.clone();
        let outcome =
            tokio::task::spawn_blocking(move || runtime.run_compiled(&module, ctx, &input)).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                log::warn!("tool {} failed: {err:#}", self.name);
                ExecResult::failure(1, format!("{}: {err:#}\n", self.name))
            }
            Err(err) => ExecResult::failure(1, format!("{}: {err}\n", self.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixed_output_module;
    use wbx_abi::ToolOutput;

    #[tokio::test(flavor = "multi_thread")]
    async fn init_compiles_image_from_tree() {
        let vfs = Vfs::new();
        vfs.mkdir_tree("/wasm").unwrap();
        let expected = ToolOutput {
            returncode: 0,
            stdout: "ok".into(),
            stderr: String::new(),
        };
        vfs.write_file("/wasm/echo.wasm", fixed_output_module(&expected))
            .unwrap();
        let runtime = Arc::new(ToolRuntime::new().unwrap());
        let tool = WasmTool::new("echo", "/wasm/echo.wasm", vfs, runtime);

        let early = tool
            .execute(ExecRequest::new(["echo"]), Spawner::detached())
            .await;
        assert_eq!(early.returncode, 1);
        assert!(early.stderr.contains("not initialized"));

        tool.init().await.unwrap();
        let result = tool
            .execute(ExecRequest::new(["echo"]), Spawner::detached())
            .await;
        assert_eq!(result, ExecResult::success("ok"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn init_fails_for_missing_or_invalid_image() {
        let vfs = Vfs::new();
        let runtime = Arc::new(ToolRuntime::new().unwrap());
        let missing = WasmTool::new("python", "/wasm/python.wasm", vfs.clone(), runtime.clone());
        let err = missing.init().await.unwrap_err();
        assert!(format!("{err:#}").contains("/wasm/python.wasm"));

        vfs.write_file("/bad.wasm", "not wasm").unwrap();
        let invalid = WasmTool::new("bad", "/bad.wasm", vfs, runtime);
        assert!(invalid.init().await.is_err());
    }
}
