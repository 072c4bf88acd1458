use std::sync::Arc;

use async_trait::async_trait;

use crate::{ExecRequest, ExecResult, Spawner};

pub type DynSandbox = Arc<dyn Sandbox>;

/// An isolated executable unit. All it exposes is `execute(argv, options) -> result`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &str;

    /// One-time startup. Called by the registry before the first `execute`.
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run one process. Nested processes go through `spawner`.
    async fn execute(&self, request: ExecRequest, spawner: Spawner) -> ExecResult;
}
