//! Host functions imported by tool images (module `wbx`).
//!
//! Buffers returned to the guest are allocated through its `alloc` export;
//! the resulting `(ptr, len)` pair is stored little-endian at `out_ptr`.
//! Filesystem calls return [`errno`] codes. Out-of-bounds guest pointers trap,
//! and so do fetch and sync failures after being reported to the spawner.

use anyhow::{Context, Result, anyhow};
use tokio::runtime::Handle;
use wasmtime::{Caller, Extern, Linker};
use wbx_abi::{OutputCapture, OutputSink, Spawner, StdStream, ToolInput, ToolOutput};
use wbx_vfs::{Vfs, VfsError, path::resolve};

use crate::{ALLOC_EXPORT, MEMORY_EXPORT};

pub const HOST_MODULE: &str = "wbx";

pub mod errno {
    pub const OK: i32 = 0;
    pub const NOT_FOUND: i32 = -1;
    pub const IO: i32 = -2;
    pub const ACCESS: i32 = -3;
    pub const INVALID: i32 = -4;
}

/// What a running tool instance can reach on the host side.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub vfs: Vfs,
    pub spawner: Spawner,
    pub handle: Handle,
    pub sink: OutputSink,
}

pub(crate) struct HostState {
    ctx: ToolContext,
    cwd: String,
    pub(crate) output: OutputCapture,
}

impl HostState {
    pub(crate) fn new(ctx: ToolContext, cwd: String) -> Self {
        let output = OutputCapture::new(ctx.sink.clone());
        Self { ctx, cwd, output }
    }
}

pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "read_file",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32, out: i32| -> Result<i32> {
            let Some(path) = guest_path(&mut caller, ptr, len)? else {
                return Ok(errno::INVALID);
            };
            let ctx = caller.data().ctx.clone();
            match ctx.handle.block_on(ctx.vfs.read_file(&path)) {
                Ok(bytes) => {
                    write_to_guest(&mut caller, &bytes, out)?;
                    Ok(errno::OK)
                }
                Err(err) => vfs_failure(&ctx, &path, err),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "write_file",
        |mut caller: Caller<'_, HostState>,
         ptr: i32,
         len: i32,
         data_ptr: i32,
         data_len: i32|
         -> Result<i32> {
            let Some(path) = guest_path(&mut caller, ptr, len)? else {
                return Ok(errno::INVALID);
            };
            let data = read_guest(&mut caller, data_ptr, data_len)?;
            let ctx = &caller.data().ctx;
            match ctx.vfs.write_file(&path, data) {
                Ok(()) => Ok(errno::OK),
                Err(err) => vfs_failure(ctx, &path, err),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "unlink",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<i32> {
            let Some(path) = guest_path(&mut caller, ptr, len)? else {
                return Ok(errno::INVALID);
            };
            let ctx = &caller.data().ctx;
            match ctx.vfs.unlink(&path) {
                Ok(()) => Ok(errno::OK),
                Err(err) => vfs_failure(ctx, &path, err),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "exists",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<i32> {
            let Some(path) = guest_path(&mut caller, ptr, len)? else {
                return Ok(0);
            };
            Ok(i32::from(caller.data().ctx.vfs.exists(&path)))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "spawn",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32, out: i32| -> Result<i32> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let input = match ToolInput::decode(&bytes) {
                Ok(input) => input,
                Err(err) => {
                    log::warn!("rejecting spawn with bad envelope: {err}");
                    return Ok(errno::INVALID);
                }
            };
            let ctx = caller.data().ctx.clone();
            let request = input.into_request().with_sink(ctx.sink.clone());
            log::debug!("tool spawns {:?}", request.argv);
            let result = ctx.spawner.spawn_blocking(request);
            let reply = ToolOutput::from(result)
                .encode()
                .context("encode spawn reply")?;
            write_to_guest(&mut caller, &reply, out)?;
            Ok(errno::OK)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "print",
        |mut caller: Caller<'_, HostState>, stream: i32, ptr: i32, len: i32| -> Result<()> {
            let stream = match stream {
                1 => StdStream::Stdout,
                2 => StdStream::Stderr,
                other => return Err(anyhow!("print to unknown stream {other}")),
            };
            let bytes = read_guest(&mut caller, ptr, len)?;
            let text = String::from_utf8_lossy(&bytes);
            caller.data_mut().output.push(stream, &text);
            Ok(())
        },
    )?;

    Ok(())
}

/// Fetch and sync failures are not the guest's to handle: report them and
/// trap. Everything else becomes an errno.
fn vfs_failure(ctx: &ToolContext, path: &str, err: VfsError) -> Result<i32> {
    if matches!(err, VfsError::Fetch(_) | VfsError::Sync(_)) {
        let message = format!("{path}: {err}");
        ctx.spawner.report_fatal(err);
        return Err(anyhow!(message));
    }
    Ok(errno_for(path, &err))
}

fn errno_for(path: &str, err: &VfsError) -> i32 {
    log::debug!("host call on {path} failed: {err}");
    match err {
        VfsError::NotFound { .. } => errno::NOT_FOUND,
        VfsError::PermissionDenied { .. } => errno::ACCESS,
        VfsError::InvalidPath { .. } => errno::INVALID,
        _ => errno::IO,
    }
}

/// A guest path resolved against the tool's cwd; `None` if it is not a valid path.
fn guest_path(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Result<Option<String>> {
    let bytes = read_guest(caller, ptr, len)?;
    let Ok(raw) = String::from_utf8(bytes) else {
        return Ok(None);
    };
    Ok(resolve(&caller.data().cwd, &raw).ok())
}

fn memory(caller: &mut Caller<'_, HostState>) -> Result<wasmtime::Memory> {
    match caller.get_export(MEMORY_EXPORT) {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(anyhow!("wasm export '{MEMORY_EXPORT}' not found")),
    }
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let memory = memory(caller)?;
    let len = usize::try_from(len).context("negative buffer length")?;
    let mut buf = vec![0u8; len];
    memory
        .read(&*caller, ptr as u32 as usize, &mut buf)
        .context("guest buffer out of bounds")?;
    Ok(buf)
}

fn write_to_guest(caller: &mut Caller<'_, HostState>, bytes: &[u8], out: i32) -> Result<()> {
    let alloc = match caller.get_export(ALLOC_EXPORT) {
        Some(Extern::Func(func)) => func.typed::<i32, i32>(&*caller)?,
        _ => return Err(anyhow!("wasm export '{ALLOC_EXPORT}' not found")),
    };
    let len = i32::try_from(bytes.len()).context("buffer too large for wasm32")?;
    let ptr = alloc.call(&mut *caller, len)?;
    let memory = memory(caller)?;
    memory
        .write(&mut *caller, ptr as u32 as usize, bytes)
        .context("guest allocation out of bounds")?;
    let mut pair = [0u8; 8];
    pair[..4].copy_from_slice(&ptr.to_le_bytes());
    pair[4..].copy_from_slice(&len.to_le_bytes());
    memory
        .write(&mut *caller, out as u32 as usize, &pair)
        .context("guest out pointer out of bounds")?;
    Ok(())
}
