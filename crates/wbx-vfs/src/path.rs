//! Absolute, `/`-separated path helpers for the in-memory tree.

use crate::error::{VfsError, VfsResult};

/// Normalize `path` into an absolute path without `.`/`..` or repeated slashes.
/// Relative inputs are taken relative to `/`.
pub fn normalize(path: &str) -> VfsResult<String> {
    resolve("/", path)
}

/// Resolve `path` against `cwd` (itself absolute).
pub fn resolve(cwd: &str, path: &str) -> VfsResult<String> {
    if path.is_empty() {
        return Err(VfsError::InvalidPath {
            path: path.to_string(),
            reason: "empty path",
        });
    }
    if path.contains('\0') {
        return Err(VfsError::InvalidPath {
            path: path.to_string(),
            reason: "embedded NUL",
        });
    }
    let mut parts: Vec<&str> = Vec::new();
    let start = if path.starts_with('/') { "" } else { cwd };
    for part in start.split('/').chain(path.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Split a normalized path into its components (`/` has none).
pub fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Split a normalized path into (parent, name). `None` for `/`.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

pub fn join(base: &str, rel: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{rel}")
    } else {
        format!("{base}/{rel}")
    }
}

/// `path` relative to `root` when it lies strictly below it.
pub fn strip_root<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    if root == "/" {
        return path.strip_prefix('/').filter(|r| !r.is_empty());
    }
    path.strip_prefix(root)?.strip_prefix('/').filter(|r| !r.is_empty())
}

/// Whether `path` equals `prefix` or lies below it.
pub fn is_within(prefix: &str, path: &str) -> bool {
    prefix == "/" || path == prefix || strip_root(prefix, path).is_some()
}
