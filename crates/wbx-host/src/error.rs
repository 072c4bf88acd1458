use thiserror::Error;
use wbx_store::StoreError;
use wbx_vfs::VfsError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("filesystem error: {0}")]
    Vfs(#[from] VfsError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("tool '{name}' failed to initialize: {message}")]
    ToolInit { name: String, message: String },
    #[error("tool runtime error: {0}")]
    Runtime(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("http client error: {0}")]
    Http(String),
}
