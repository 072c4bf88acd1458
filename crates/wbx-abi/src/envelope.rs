//! CBOR envelopes exchanged with wasm tool images.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ExecRequest, ExecResult};

/// Current ABI version carried in tool input envelopes.
pub const ABI_VERSION: u8 = 1;

/// Host → guest: the process to run. Also used guest → host for spawns.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ToolInput {
    pub version: u8,
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ToolInput {
    pub fn decode(bytes: &[u8]) -> Result<Self, AbiDecodeError> {
        let input: ToolInput = serde_cbor::from_slice(bytes)?;
        if input.version != ABI_VERSION {
            return Err(AbiDecodeError::UnsupportedVersion {
                found: input.version,
            });
        }
        Ok(input)
    }

    pub fn encode(&self) -> Result<Vec<u8>, AbiEncodeError> {
        serde_cbor::to_vec(self).map_err(AbiEncodeError::Cbor)
    }

    pub fn into_request(self) -> ExecRequest {
        ExecRequest {
            argv: self.argv,
            cwd: self.cwd,
            path: self.path,
            env: self.env,
            sink: Default::default(),
        }
    }
}

impl From<&ExecRequest> for ToolInput {
    fn from(request: &ExecRequest) -> Self {
        Self {
            version: ABI_VERSION,
            argv: request.argv.clone(),
            cwd: request.cwd.clone(),
            path: request.path.clone(),
            env: request.env.clone(),
        }
    }
}

/// Guest → host: the process outcome. Also host → guest for spawn replies.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct ToolOutput {
    pub returncode: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ToolOutput {
    pub fn decode(bytes: &[u8]) -> Result<Self, AbiDecodeError> {
        serde_cbor::from_slice(bytes).map_err(AbiDecodeError::Cbor)
    }

    pub fn encode(&self) -> Result<Vec<u8>, AbiEncodeError> {
        serde_cbor::to_vec(self).map_err(AbiEncodeError::Cbor)
    }
}

impl From<ToolOutput> for ExecResult {
    fn from(out: ToolOutput) -> Self {
        ExecResult {
            returncode: out.returncode,
            stdout: out.stdout,
            stderr: out.stderr,
        }
    }
}

impl From<ExecResult> for ToolOutput {
    fn from(result: ExecResult) -> Self {
        ToolOutput {
            returncode: result.returncode,
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }
}

#[derive(Debug, Error)]
pub enum AbiDecodeError {
    #[error("cbor decode error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("unsupported ABI version {found}")]
    UnsupportedVersion { found: u8 },
}

#[derive(Debug, Error)]
pub enum AbiEncodeError {
    #[error("cbor encode error: {0}")]
    Cbor(serde_cbor::Error),
}
