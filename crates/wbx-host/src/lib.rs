//! Host side of the virtual toolchain: configuration, asset fetching, the
//! tool registry, process dispatch, and environment startup.

pub mod config;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod fetch;
pub mod registry;

#[cfg(any(feature = "test-fixtures", test))]
pub mod mock;

pub use config::{AssetEntry, AssetIndex, EnvConfig, FetchConfig, ToolSpec};
pub use dispatch::{DispatchConfig, Dispatcher, Resolution};
pub use env::Environment;
pub use error::HostError;
pub use fetch::HttpFetcher;
pub use registry::ToolRegistry;
