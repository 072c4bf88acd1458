use std::io::{Cursor, Read};
use std::path::{Component, Path};

use async_trait::async_trait;
use bytes::Bytes;
use wbx_abi::{ExecRequest, ExecResult, OutputCapture, Sandbox, Spawner};

use crate::path::{resolve, split_parent};
use crate::tree::{Perms, Vfs};

const USAGE: &str = "usage: wasm-package (unpack|list) ARCHIVE";

/// `wasm-package` command: extracts or lists a tar pack inside the shared
/// tree, relative to the request cwd.
pub struct PackTool {
    vfs: Vfs,
}

impl PackTool {
    pub fn new(vfs: Vfs) -> Self {
        Self { vfs }
    }

    async fn run(&self, request: &ExecRequest, out: &mut OutputCapture) -> Result<(), String> {
        let (command, archive) = match request.argv.get(1..).unwrap_or_default() {
            [command, archive] => (command.as_str(), archive.as_str()),
            _ => return Err(USAGE.to_string()),
        };
        let cwd = request.cwd_or("/");
        let archive = resolve(cwd, archive).map_err(|err| err.to_string())?;
        let bytes = self
            .vfs
            .read_file(&archive)
            .await
            .map_err(|err| err.to_string())?;
        match command {
            "unpack" => {
                let count = extract(&self.vfs, cwd, bytes).map_err(|err| format!("{archive}: {err}"))?;
                tracing::debug!(%archive, entries = count, "unpacked pack");
                Ok(())
            }
            "list" => {
                for name in list(bytes).map_err(|err| format!("{archive}: {err}"))? {
                    out.println(&name);
                }
                Ok(())
            }
            other => Err(format!("unknown command {other}\n{USAGE}")),
        }
    }
}

#[async_trait]
impl Sandbox for PackTool {
    fn name(&self) -> &str {
        "wasm-package"
    }

    async fn execute(&self, request: ExecRequest, _spawner: Spawner) -> ExecResult {
        let mut out = OutputCapture::new(request.sink.clone());
        match self.run(&request, &mut out).await {
            Ok(()) => out.finish(0),
            Err(message) => {
                out.eprintln(&format!("wasm-package: {message}"));
                out.finish(1)
            }
        }
    }
}

fn extract(vfs: &Vfs, dest: &str, bytes: Bytes) -> Result<usize, String> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut count = 0;
    for entry in archive.entries().map_err(|err| err.to_string())? {
        let mut entry = entry.map_err(|err| err.to_string())?;
        let rel = entry_name(&entry.path().map_err(|err| err.to_string())?)?;
        let Some(rel) = rel else { continue };
        let target = resolve(dest, &rel).map_err(|err| err.to_string())?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            vfs.mkdir_tree(&target).map_err(|err| err.to_string())?;
            continue;
        }
        if !entry_type.is_file() {
            tracing::warn!(path = %target, ?entry_type, "skipping unsupported pack entry");
            continue;
        }

        let mode = entry.header().mode().map_err(|err| err.to_string())?;
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).map_err(|err| err.to_string())?;
        if let Some((parent, _)) = split_parent(&target) {
            vfs.mkdir_tree(parent).map_err(|err| err.to_string())?;
        }
        // Entries replace whatever is there, read-only or not.
        if vfs.stat(&target).is_ok_and(|meta| meta.is_file()) {
            vfs.unlink(&target).map_err(|err| err.to_string())?;
        }
        vfs.write_file_with_perms(&target, buf, Perms::from_mode(mode))
            .map_err(|err| err.to_string())?;
        count += 1;
    }
    Ok(count)
}

fn list(bytes: Bytes) -> Result<Vec<String>, String> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut names = Vec::new();
    for entry in archive.entries().map_err(|err| err.to_string())? {
        let entry = entry.map_err(|err| err.to_string())?;
        if let Some(name) = entry_name(&entry.path().map_err(|err| err.to_string())?)? {
            names.push(name);
        }
    }
    Ok(names)
}

/// Relative, `/`-joined entry name. `None` for the archive root itself.
fn entry_name(path: &Path) -> Result<Option<String>, String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| format!("non UTF-8 entry name {path:?}"))?;
                parts.push(part);
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(format!("entry escapes the destination: {path:?}"));
            }
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::tar_pack;

    #[test]
    fn entry_names_are_relative() {
        assert_eq!(
            entry_name(Path::new("./bin/echo")).unwrap().as_deref(),
            Some("bin/echo")
        );
        assert_eq!(
            entry_name(Path::new("/abs/x")).unwrap().as_deref(),
            Some("abs/x")
        );
        assert_eq!(entry_name(Path::new("./")).unwrap(), None);
        assert!(entry_name(Path::new("a/../../etc")).is_err());
    }

    #[tokio::test]
    async fn unpack_relative_to_cwd_and_overwrite_read_only() {
        let vfs = Vfs::new();
        vfs.mkdir_tree("/opt/bin").unwrap();
        vfs.write_file_with_perms("/opt/bin/tool", "old", Perms::READ_ONLY)
            .unwrap();
        vfs.write_file(
            "/pkg.pack",
            tar_pack(&[("bin/tool", b"python;-E", 0o755), ("share/doc", b"d", 0o600)]),
        )
        .unwrap();

        let result = PackTool::new(vfs.clone())
            .execute(
                ExecRequest::new(["wasm-package", "unpack", "/pkg.pack"]).with_cwd("/opt"),
                Spawner::detached(),
            )
            .await;
        assert!(result.is_success(), "{}", result.stderr);
        assert_eq!(vfs.read_loaded("/opt/bin/tool").unwrap(), "python;-E");
        let perms = vfs.stat("/opt/bin/tool").unwrap().perms;
        assert!(perms.exec && perms.write);
        assert!(vfs.exists("/opt/share/doc"));
    }

    #[tokio::test]
    async fn list_prints_entry_names() {
        let vfs = Vfs::new();
        vfs.write_file(
            "/p.pack",
            tar_pack(&[("lib/", b"", 0o755), ("lib/a.a", b"!<arch>", 0o644)]),
        )
        .unwrap();
        let result = PackTool::new(vfs)
            .execute(
                ExecRequest::new(["wasm-package", "list", "p.pack"]),
                Spawner::detached(),
            )
            .await;
        assert_eq!(result.stdout, "lib\nlib/a.a\n");
    }

    #[tokio::test]
    async fn bad_usage_and_missing_archive_fail() {
        let tool = PackTool::new(Vfs::new());
        let result = tool
            .execute(ExecRequest::new(["wasm-package"]), Spawner::detached())
            .await;
        assert_eq!(result.returncode, 1);
        assert!(result.stderr.contains("usage"));

        let result = tool
            .execute(
                ExecRequest::new(["wasm-package", "unpack", "/missing.pack"]),
                Spawner::detached(),
            )
            .await;
        assert_eq!(result.returncode, 1);
        assert!(result.stderr.contains("/missing.pack"));
    }
}
