use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use wbx_abi::DynSandbox;

use crate::error::HostError;

/// Logical tool name → sandbox capability. Filled at startup, then shared
/// read-only for the rest of the session.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, DynSandbox>,
    ready: AtomicBool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, tool: DynSandbox) {
        let name = name.into();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "replacing registered tool");
        }
        *self.ready.get_mut() = false;
    }

    /// Initialize every tool, in name order. The first failure aborts and
    /// leaves the registry not ready.
    pub async fn init_all(&self) -> Result<(), HostError> {
        for (name, tool) in &self.tools {
            tool.init().await.map_err(|err| HostError::ToolInit {
                name: name.clone(),
                message: format!("{err:#}"),
            })?;
            tracing::debug!(tool = %name, "tool initialized");
        }
        self.ready.store(true, Ordering::Release);
        tracing::info!(tools = self.tools.len(), "tool registry ready");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<DynSandbox> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("ready", &self.is_ready())
            .finish()
    }
}
