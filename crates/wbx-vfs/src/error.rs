use thiserror::Error;
use wbx_cbor::Digest;
use wbx_store::StoreError;

pub type VfsResult<T> = Result<T, VfsError>;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("no such file or directory: {path}")]
    NotFound { path: String },
    #[error("file exists: {path}")]
    AlreadyExists { path: String },
    #[error("not a directory: {path}")]
    NotADirectory { path: String },
    #[error("is a directory: {path}")]
    IsADirectory { path: String },
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },
    #[error("permission denied: {path}")]
    PermissionDenied { path: String },
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("file content not materialized yet: {path}")]
    NotLoaded { path: String },
    #[error("{path} is not valid UTF-8")]
    Utf8 { path: String },
    #[error("cache entry {digest} not found")]
    CacheMiss { digest: Digest },
    #[error("unpacking {archive} failed with code {returncode}: {stderr}")]
    Unpack {
        archive: String,
        returncode: i32,
        stderr: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Mount(#[from] MountError),
}

impl VfsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        VfsError::NotFound { path: path.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound { .. } | VfsError::CacheMiss { .. })
    }
}

/// Remote asset unreachable or answered with a bad status.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("couldn't load {url}. Status: {status}")]
    Status { url: String, status: u16 },
    #[error("couldn't load {url}. Request failed: {message}")]
    Transport { url: String, message: String },
}

/// Durable-store synchronization failed; filesystem consistency is no longer guaranteed.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("durable store: {0}")]
    Store(#[from] StoreError),
    #[error("sync task aborted: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("{path} is already mounted")]
    AlreadyMounted { path: String },
    #[error("cannot mount {requested}: durable store already mounted at {existing}")]
    DurableInUse { existing: String, requested: String },
}
