//! Process-level types shared by the dispatcher and every sandboxed tool.

mod envelope;
mod process;
mod sandbox;
mod spawn;

pub use envelope::{ABI_VERSION, AbiDecodeError, AbiEncodeError, ToolInput, ToolOutput};
pub use process::{ExecRequest, ExecResult, OutputCapture, OutputSink, StdStream};
pub use sandbox::{DynSandbox, Sandbox};
pub use spawn::{FatalError, FatalSlot, SpawnInbox, SpawnMsg, Spawner};
