//! Archive unpacking into the shared tree.
//!
//! The unpack step and the decompression step are both sandboxed commands
//! (`wasm-package` and `brotli`); [`ArchiveUnpacker`] only stages bytes in
//! the scratch directory and drives the two commands.

mod brotli_tool;
mod pack_tool;

pub use brotli_tool::BrotliTool;
pub use pack_tool::PackTool;

use std::sync::Arc;

use bytes::Bytes;
use wbx_abi::{DynSandbox, ExecRequest, ExecResult, Spawner};

use crate::error::{VfsError, VfsResult};
use crate::path::{join, normalize};
use crate::tree::Vfs;

/// Suffix marking a brotli-compressed archive.
pub const BROTLI_SUFFIX: &str = ".br";

const SCRATCH_PACK: &str = "archive.pack";
const SCRATCH_PACK_BR: &str = "archive.pack.br";

pub struct ArchiveUnpacker {
    vfs: Vfs,
    decompressor: DynSandbox,
    unpacker: DynSandbox,
    scratch_dir: String,
}

impl ArchiveUnpacker {
    pub fn new(
        vfs: Vfs,
        decompressor: DynSandbox,
        unpacker: DynSandbox,
        scratch_dir: &str,
    ) -> VfsResult<Self> {
        Ok(Self {
            vfs,
            decompressor,
            unpacker,
            scratch_dir: normalize(scratch_dir)?,
        })
    }

    /// Unpacker backed by the in-process brotli and pack tools.
    pub fn native(vfs: Vfs, scratch_dir: &str) -> VfsResult<Self> {
        let decompressor = Arc::new(BrotliTool::new(vfs.clone()));
        let unpacker = Arc::new(PackTool::new(vfs.clone()));
        Self::new(vfs, decompressor, unpacker, scratch_dir)
    }

    pub fn scratch_dir(&self) -> &str {
        &self.scratch_dir
    }

    /// Unpack the archive stored at `source` into the tree rooted at `/`.
    ///
    /// `source` is read through the tree, so a lazy file is fetched here.
    /// Scratch files are removed whether or not unpacking succeeds.
    pub async fn unpack(&self, source: &str) -> VfsResult<()> {
        let bytes = self.vfs.read_file(source).await?;
        let result = self.unpack_bytes(source, bytes).await;
        self.cleanup();
        result
    }

    async fn unpack_bytes(&self, source: &str, bytes: Bytes) -> VfsResult<()> {
        self.vfs.mkdir_tree(&self.scratch_dir)?;
        let pack = join(&self.scratch_dir, SCRATCH_PACK);
        if source.ends_with(BROTLI_SUFFIX) {
            let compressed = join(&self.scratch_dir, SCRATCH_PACK_BR);
            self.vfs.write_file(&compressed, bytes)?;
            tracing::debug!(%source, "decompressing archive");
            let request = ExecRequest::new(["brotli", "--decompress", compressed.as_str()]);
            let result = self.decompressor.execute(request, Spawner::detached()).await;
            check(source, result)?;
        } else {
            self.vfs.write_file(&pack, bytes)?;
        }

        tracing::debug!(%source, "unpacking archive");
        let request = ExecRequest::new(["wasm-package", "unpack", pack.as_str()]).with_cwd("/");
        let result = self.unpacker.execute(request, Spawner::detached()).await;
        check(source, result)
    }

    fn cleanup(&self) {
        for name in [SCRATCH_PACK_BR, SCRATCH_PACK] {
            let path = join(&self.scratch_dir, name);
            match self.vfs.unlink(&path) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => tracing::warn!(%path, error = %err, "failed to remove scratch file"),
            }
        }
    }
}

fn check(source: &str, result: ExecResult) -> VfsResult<()> {
    if result.is_success() {
        return Ok(());
    }
    Err(VfsError::Unpack {
        archive: source.to_string(),
        returncode: result.returncode,
        stderr: result.stderr,
    })
}
