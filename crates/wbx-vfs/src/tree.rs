//! The shared in-memory file tree.
//!
//! Every operation normalizes its path first and holds the tree lock only for
//! the duration of the call; the lock is never held across a fetch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::error::{VfsError, VfsResult};
use crate::mount::{MountPolicy, MountRecord, MountTable};
use crate::path::{components, join, normalize, split_parent};
use crate::remote::RemoteBackedFile;

/// Permission bits. `exec` marks a file whose content is a routing directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Perms {
    pub const READ_WRITE: Perms = Perms {
        read: true,
        write: true,
        exec: false,
    };
    pub const READ_ONLY: Perms = Perms {
        read: true,
        write: false,
        exec: false,
    };

    /// Map unix mode bits; any class having a bit set counts.
    pub fn from_mode(mode: u32) -> Self {
        Perms {
            read: mode & 0o444 != 0,
            write: mode & 0o222 != 0,
            exec: mode & 0o111 != 0,
        }
    }

    pub fn executable(self) -> Self {
        Perms { exec: true, ..self }
    }
}

impl Default for Perms {
    fn default() -> Self {
        Perms::READ_WRITE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub kind: NodeKind,
    /// Byte length. For an unmaterialized file this is the declared length.
    pub len: u64,
    pub loaded: bool,
    pub perms: Perms,
    /// Bumped on every write; directories report 0.
    pub version: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

#[derive(Clone)]
enum Content {
    Loaded(Bytes),
    Lazy(Arc<RemoteBackedFile>),
}

struct FileNode {
    content: Content,
    perms: Perms,
    version: u64,
}

impl FileNode {
    fn metadata(&self) -> Metadata {
        let (len, loaded) = match &self.content {
            Content::Loaded(bytes) => (bytes.len() as u64, true),
            Content::Lazy(file) => (file.len(), file.is_loaded()),
        };
        Metadata {
            kind: NodeKind::File,
            len,
            loaded,
            perms: self.perms,
            version: self.version,
        }
    }
}

enum Node {
    Dir(BTreeMap<String, Node>),
    File(FileNode),
}

impl Node {
    fn metadata(&self) -> Metadata {
        match self {
            Node::Dir(_) => Metadata {
                kind: NodeKind::Dir,
                len: 0,
                loaded: true,
                perms: Perms::READ_WRITE.executable(),
                version: 0,
            },
            Node::File(file) => file.metadata(),
        }
    }
}

struct Tree {
    root: Node,
    next_version: u64,
    mounts: MountTable,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            root: Node::Dir(BTreeMap::new()),
            next_version: 1,
            mounts: MountTable::default(),
        }
    }
}

impl Tree {
    fn bump(&mut self) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }

    fn node(&self, path: &str) -> Option<&Node> {
        let mut cur = &self.root;
        for name in components(path) {
            cur = match cur {
                Node::Dir(children) => children.get(name)?,
                Node::File(_) => return None,
            };
        }
        Some(cur)
    }

    fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut cur = &mut self.root;
        for name in components(path) {
            cur = match cur {
                Node::Dir(children) => children.get_mut(name)?,
                Node::File(_) => return None,
            };
        }
        Some(cur)
    }

    fn file(&self, path: &str) -> VfsResult<&FileNode> {
        match self.node(path) {
            Some(Node::File(file)) => Ok(file),
            Some(Node::Dir(_)) => Err(VfsError::IsADirectory {
                path: path.to_string(),
            }),
            None => Err(VfsError::not_found(path)),
        }
    }

    fn parent_dir_mut<'p>(
        &mut self,
        path: &'p str,
    ) -> VfsResult<(&mut BTreeMap<String, Node>, &'p str)> {
        let (parent, name) = split_parent(path).ok_or(VfsError::InvalidPath {
            path: path.to_string(),
            reason: "operation not permitted on /",
        })?;
        match self.node_mut(parent) {
            Some(Node::Dir(children)) => Ok((children, name)),
            Some(Node::File(_)) => Err(VfsError::NotADirectory {
                path: parent.to_string(),
            }),
            None => Err(VfsError::not_found(parent)),
        }
    }
}

/// Cheap-to-clone handle on the process-wide tree.
#[derive(Clone, Default)]
pub struct Vfs {
    inner: Arc<Mutex<Tree>>,
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vfs")
            .field("mounts", &self.lock().mounts)
            .finish()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.inner.lock().expect("vfs tree poisoned")
    }

    pub fn exists(&self, path: &str) -> bool {
        match normalize(path) {
            Ok(path) => self.lock().node(&path).is_some(),
            Err(_) => false,
        }
    }

    /// Metadata without forcing a fetch.
    pub fn stat(&self, path: &str) -> VfsResult<Metadata> {
        let path = normalize(path)?;
        self.lock()
            .node(&path)
            .map(Node::metadata)
            .ok_or_else(|| VfsError::not_found(path))
    }

    pub fn mkdir(&self, path: &str) -> VfsResult<()> {
        let path = normalize(path)?;
        let mut tree = self.lock();
        let (dir, name) = tree.parent_dir_mut(&path)?;
        if dir.contains_key(name) {
            return Err(VfsError::AlreadyExists { path });
        }
        dir.insert(name.to_string(), Node::Dir(BTreeMap::new()));
        Ok(())
    }

    /// Create `path` and any missing ancestors. Existing directories are fine.
    pub fn mkdir_tree(&self, path: &str) -> VfsResult<()> {
        let path = normalize(path)?;
        let mut tree = self.lock();
        let mut cur = &mut tree.root;
        let mut walked = String::new();
        for name in components(&path) {
            let Node::Dir(children) = cur else {
                return Err(VfsError::NotADirectory { path: walked });
            };
            walked.push('/');
            walked.push_str(name);
            cur = children
                .entry(name.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
        }
        if matches!(cur, Node::File(_)) {
            return Err(VfsError::NotADirectory { path: walked });
        }
        Ok(())
    }

    pub fn write_file(&self, path: &str, bytes: impl Into<Bytes>) -> VfsResult<()> {
        self.write_inner(path, bytes.into(), None)
    }

    /// Write and set permissions in one step (used when unpacking archives).
    pub fn write_file_with_perms(
        &self,
        path: &str,
        bytes: impl Into<Bytes>,
        perms: Perms,
    ) -> VfsResult<()> {
        self.write_inner(path, bytes.into(), Some(perms))
    }

    fn write_inner(&self, path: &str, bytes: Bytes, perms: Option<Perms>) -> VfsResult<()> {
        let path = normalize(path)?;
        let mut tree = self.lock();
        let version = tree.bump();
        let (dir, name) = tree.parent_dir_mut(&path)?;
        match dir.get_mut(name) {
            Some(Node::Dir(_)) => Err(VfsError::IsADirectory { path }),
            Some(Node::File(file)) => {
                if !file.perms.write {
                    return Err(VfsError::PermissionDenied { path });
                }
                file.content = Content::Loaded(bytes);
                file.version = version;
                if let Some(perms) = perms {
                    file.perms = perms;
                }
                Ok(())
            }
            None => {
                dir.insert(
                    name.to_string(),
                    Node::File(FileNode {
                        content: Content::Loaded(bytes),
                        perms: perms.unwrap_or_default(),
                        version,
                    }),
                );
                Ok(())
            }
        }
    }

    /// Register a lazily-fetched, read-only file. `path` must not exist yet.
    pub fn insert_lazy(&self, path: &str, file: Arc<RemoteBackedFile>) -> VfsResult<()> {
        let path = normalize(path)?;
        let mut tree = self.lock();
        let version = tree.bump();
        let (dir, name) = tree.parent_dir_mut(&path)?;
        if dir.contains_key(name) {
            return Err(VfsError::AlreadyExists { path });
        }
        dir.insert(
            name.to_string(),
            Node::File(FileNode {
                content: Content::Lazy(file),
                perms: Perms::READ_ONLY,
                version,
            }),
        );
        Ok(())
    }

    pub fn set_perms(&self, path: &str, perms: Perms) -> VfsResult<()> {
        let path = normalize(path)?;
        let mut tree = self.lock();
        match tree.node_mut(&path) {
            Some(Node::File(file)) => {
                file.perms = perms;
                Ok(())
            }
            Some(Node::Dir(_)) => Err(VfsError::IsADirectory { path }),
            None => Err(VfsError::not_found(path)),
        }
    }

    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        let path = normalize(path)?;
        let mut tree = self.lock();
        let (dir, name) = tree.parent_dir_mut(&path)?;
        let is_dir = match dir.get(name) {
            Some(node) => matches!(node, Node::Dir(_)),
            None => return Err(VfsError::not_found(path)),
        };
        if is_dir {
            return Err(VfsError::IsADirectory { path });
        }
        dir.remove(name);
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        let path = normalize(path)?;
        let mut tree = self.lock();
        let (dir, name) = tree.parent_dir_mut(&path)?;
        let empty = match dir.get(name) {
            Some(Node::Dir(children)) => children.is_empty(),
            Some(Node::File(_)) => return Err(VfsError::NotADirectory { path }),
            None => return Err(VfsError::not_found(path)),
        };
        if !empty {
            return Err(VfsError::DirectoryNotEmpty { path });
        }
        dir.remove(name);
        Ok(())
    }

    /// Remove a file or a whole directory subtree.
    pub fn remove_tree(&self, path: &str) -> VfsResult<()> {
        let path = normalize(path)?;
        let mut tree = self.lock();
        let (dir, name) = tree.parent_dir_mut(&path)?;
        dir.remove(name).map(|_| ()).ok_or(VfsError::NotFound { path })
    }

    pub fn read_dir(&self, path: &str) -> VfsResult<Vec<String>> {
        let path = normalize(path)?;
        match self.lock().node(&path) {
            Some(Node::Dir(children)) => Ok(children.keys().cloned().collect()),
            Some(Node::File(_)) => Err(VfsError::NotADirectory { path }),
            None => Err(VfsError::not_found(path)),
        }
    }

    /// Read content that is already in memory; unmaterialized files fail
    /// with [`VfsError::NotLoaded`] instead of fetching.
    pub fn read_loaded(&self, path: &str) -> VfsResult<Bytes> {
        let path = normalize(path)?;
        let tree = self.lock();
        let file = tree.file(&path)?;
        if !file.perms.read {
            return Err(VfsError::PermissionDenied { path });
        }
        match &file.content {
            Content::Loaded(bytes) => Ok(bytes.clone()),
            Content::Lazy(_) => Err(VfsError::NotLoaded { path }),
        }
    }

    /// Read a file, materializing it first if it is still remote.
    pub async fn read_file(&self, path: &str) -> VfsResult<Bytes> {
        let path = normalize(path)?;
        let lazy = {
            let tree = self.lock();
            let file = tree.file(&path)?;
            if !file.perms.read {
                return Err(VfsError::PermissionDenied { path });
            }
            match &file.content {
                Content::Loaded(bytes) => return Ok(bytes.clone()),
                Content::Lazy(lazy) => lazy.clone(),
            }
        };
        let bytes = lazy.materialize(self).await?;
        self.settle(&path, &lazy, bytes.clone());
        Ok(bytes)
    }

    pub async fn read_file_utf8(&self, path: &str) -> VfsResult<String> {
        let bytes = self.read_file(path).await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| VfsError::Utf8 {
            path: path.to_string(),
        })
    }

    /// Read up to `len` bytes at `offset`; short reads past the end.
    pub async fn read_at(&self, path: &str, offset: u64, len: usize) -> VfsResult<Bytes> {
        let bytes = self.read_file(path).await?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        Ok(bytes.slice(start..end))
    }

    /// Swap a materialized lazy node for plain content, unless the node was
    /// replaced while the fetch was in flight.
    fn settle(&self, path: &str, lazy: &Arc<RemoteBackedFile>, bytes: Bytes) {
        let mut tree = self.lock();
        if let Some(Node::File(file)) = tree.node_mut(path)
            && let Content::Lazy(current) = &file.content
            && Arc::ptr_eq(current, lazy)
        {
            file.content = Content::Loaded(bytes);
        }
    }

    /// All files below `root`, as (path relative to `root`, metadata), in
    /// lexical order.
    pub fn walk_files(&self, root: &str) -> VfsResult<Vec<(String, Metadata)>> {
        let root = normalize(root)?;
        let tree = self.lock();
        let children = match tree.node(&root) {
            Some(Node::Dir(children)) => children,
            Some(Node::File(_)) => return Err(VfsError::NotADirectory { path: root }),
            None => return Err(VfsError::not_found(root)),
        };
        let mut out = Vec::new();
        collect_files(children, "", &mut out);
        Ok(out)
    }

    pub fn mount(&self, path: &str, policy: MountPolicy) -> VfsResult<()> {
        let path = normalize(path)?;
        self.lock().mounts.mount(&path, policy)?;
        Ok(())
    }

    pub fn mount_policy(&self, path: &str) -> MountPolicy {
        match normalize(path) {
            Ok(path) => self.lock().mounts.policy_for(&path),
            Err(_) => MountPolicy::None,
        }
    }

    pub fn durable_mount(&self) -> Option<String> {
        self.lock().mounts.durable_prefix().map(str::to_string)
    }

    pub fn mounts(&self) -> Vec<MountRecord> {
        self.lock().mounts.records()
    }
}

fn collect_files(children: &BTreeMap<String, Node>, prefix: &str, out: &mut Vec<(String, Metadata)>) {
    for (name, node) in children {
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            join(prefix, name)
        };
        match node {
            Node::Dir(grandchildren) => collect_files(grandchildren, &rel, out),
            Node::File(file) => out.push((rel, file.metadata())),
        }
    }
}
