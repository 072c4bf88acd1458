//! Shared virtual filesystem: an in-memory tree with lazily-fetched files,
//! a content-addressed cache mirrored into a durable store, and archive
//! unpacking.

pub mod archive;
pub mod cache;
pub mod error;
pub mod fs;
pub mod mount;
pub mod path;
pub mod remote;
pub mod tree;

#[cfg(any(feature = "test-fixtures", test))]
pub mod mock;

pub use archive::{ArchiveUnpacker, BrotliTool, PackTool};
pub use cache::ContentCache;
pub use error::{FetchError, MountError, SyncError, VfsError, VfsResult};
pub use fs::VirtualFileSystem;
pub use mount::{MountPolicy, MountRecord};
pub use remote::{DynFetcher, Fetcher, LoadedHook, RemoteBackedFile, RemoteDescriptor};
pub use tree::{Metadata, NodeKind, Perms, Vfs};
