//! In-memory filesystem tree shared by every image codec.
//!
//! The tree is a flat map from normalized absolute paths to nodes; the
//! directory structure is implied by path prefixes. `/` always exists and is
//! a directory, and every node's parent path is itself a directory node.
//! Iteration is always in path order, which is what keeps every writer
//! deterministic.
use std::collections::BTreeMap;
use thiserror::Error;

// POSIX file type bits (shared by ext2, cpio and tar)
pub const S_IFMT: u32 = 0o170000;
pub const S_IFIFO: u32 = 0o010000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Permission, setuid/setgid and sticky bits.
pub const PERM_MASK: u16 = 0o7777;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("the root of the tree must be a directory")]
    RootNotDirectory,

    #[error("cannot remove the root directory")]
    RemoveRoot,
}

/// What a node is, with the payload only that kind carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File(Vec<u8>),
    Symlink(String),
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
    Fifo,
}

/// A single filesystem object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    /// Permission bits only; the type bits come from `kind`.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: u32,
}

impl Node {
    fn new(kind: NodeKind, mode: u16) -> Self {
        Node {
            kind,
            mode: mode & PERM_MASK,
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }

    pub fn directory(mode: u16) -> Self {
        Self::new(NodeKind::Directory, mode)
    }

    pub fn file(data: impl Into<Vec<u8>>, mode: u16) -> Self {
        Self::new(NodeKind::File(data.into()), mode)
    }

    /// Symlinks are created 0777, as on Linux.
    pub fn symlink(target: impl Into<String>) -> Self {
        Self::new(NodeKind::Symlink(target.into()), 0o777)
    }

    pub fn char_device(major: u32, minor: u32, mode: u16) -> Self {
        Self::new(NodeKind::CharDevice { major, minor }, mode)
    }

    pub fn block_device(major: u32, minor: u32, mode: u16) -> Self {
        Self::new(NodeKind::BlockDevice { major, minor }, mode)
    }

    pub fn fifo(mode: u16) -> Self {
        Self::new(NodeKind::Fifo, mode)
    }

    pub fn owned_by(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn modified_at(mut self, mtime: u32) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    /// POSIX type bits for this node's kind.
    pub fn type_bits(&self) -> u32 {
        match self.kind {
            NodeKind::Directory => S_IFDIR,
            NodeKind::File(_) => S_IFREG,
            NodeKind::Symlink(_) => S_IFLNK,
            NodeKind::CharDevice { .. } => S_IFCHR,
            NodeKind::BlockDevice { .. } => S_IFBLK,
            NodeKind::Fifo => S_IFIFO,
        }
    }

    /// Full `st_mode`: type bits plus permissions.
    pub fn st_mode(&self) -> u32 {
        self.type_bits() | u32::from(self.mode)
    }

    /// Payload length: file data or symlink target bytes.
    pub fn payload_len(&self) -> usize {
        match &self.kind {
            NodeKind::File(data) => data.len(),
            NodeKind::Symlink(target) => target.len(),
            _ => 0,
        }
    }

    /// Device numbers for character and block devices.
    pub fn device(&self) -> Option<(u32, u32)> {
        match self.kind {
            NodeKind::CharDevice { major, minor } | NodeKind::BlockDevice { major, minor } => {
                Some((major, minor))
            }
            _ => None,
        }
    }
}

/// Normalize a path: absolute, `/`-separated, no empty/`.`/`..` components.
///
/// `..` at the root stays at the root, so a normalized path never escapes `/`.
/// Only `/` separates components; any other byte, `\` included, is part of
/// a name.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Parent of a normalized path; `None` for `/`.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => Some("/"),
    }
}

/// Last component of a normalized path (`/` for the root).
pub fn file_name(path: &str) -> &str {
    if path == "/" {
        return path;
    }
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a normalized directory path and a single component.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    nodes: BTreeMap<String, Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// A tree holding only `/` (0755, root-owned).
    pub fn new() -> Self {
        Self::with_root(Node::directory(0o755))
    }

    pub fn with_root(root: Node) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), root);
        Tree { nodes }
    }

    pub fn root(&self) -> &Node {
        &self.nodes["/"]
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(&normalize(path))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.nodes.get_mut(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// All nodes in path order, root first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(path, node)| (path.as_str(), node))
    }

    /// Immediate children of a directory, sorted by name.
    pub fn children<'a>(&'a self, dir: &str) -> Vec<(&'a str, &'a Node)> {
        let dir = normalize(dir);
        let prefix = if dir == "/" { dir.clone() } else { format!("{dir}/") };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| {
                let rest = &path[prefix.len()..];
                !rest.is_empty() && !rest.contains('/')
            })
            .map(|(path, node)| (path.as_str(), node))
            .collect()
    }

    /// Sum of all regular file sizes.
    pub fn total_data_size(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::File(_)))
            .map(Node::payload_len)
            .sum()
    }

    /// Create every missing directory along `path`. New directories are
    /// 0755 and take their owner and mtime from `template`.
    pub fn mkdir_all(&mut self, path: &str, template: &Node) -> Result<(), TreeError> {
        let path = normalize(path);
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            match self.nodes.get(&current) {
                Some(node) if node.is_dir() => {}
                Some(_) => return Err(TreeError::NotADirectory(current)),
                None => {
                    let dir = Node::directory(0o755)
                        .owned_by(template.uid, template.gid)
                        .modified_at(template.mtime);
                    self.nodes.insert(current.clone(), dir);
                }
            }
        }
        Ok(())
    }

    /// Insert or replace the node at `path`, creating missing parents.
    ///
    /// Replacing a directory with anything else drops its subtree; replacing
    /// a directory with a directory keeps its children. Returns the
    /// normalized path.
    pub fn insert(&mut self, path: &str, node: Node) -> Result<String, TreeError> {
        let path = normalize(path);
        if path == "/" {
            if !node.is_dir() {
                return Err(TreeError::RootNotDirectory);
            }
            self.nodes.insert(path.clone(), node);
            return Ok(path);
        }

        if let Some(dir) = parent(&path) {
            self.mkdir_all(dir, &node)?;
        }
        if !node.is_dir() && self.nodes.get(&path).is_some_and(Node::is_dir) {
            self.remove_descendants(&path);
        }
        self.nodes.insert(path.clone(), node);
        Ok(path)
    }

    pub fn put_dir(
        &mut self,
        path: &str,
        mode: u16,
        uid: u32,
        gid: u32,
        mtime: u32,
    ) -> Result<String, TreeError> {
        self.insert(path, Node::directory(mode).owned_by(uid, gid).modified_at(mtime))
    }

    pub fn put_file(
        &mut self,
        path: &str,
        data: impl Into<Vec<u8>>,
        mode: u16,
        uid: u32,
        gid: u32,
        mtime: u32,
    ) -> Result<String, TreeError> {
        self.insert(path, Node::file(data, mode).owned_by(uid, gid).modified_at(mtime))
    }

    pub fn put_symlink(
        &mut self,
        path: &str,
        target: &str,
        uid: u32,
        gid: u32,
        mtime: u32,
    ) -> Result<String, TreeError> {
        self.insert(path, Node::symlink(target).owned_by(uid, gid).modified_at(mtime))
    }

    /// Character or block device node.
    #[allow(clippy::too_many_arguments)]
    pub fn put_device(
        &mut self,
        path: &str,
        block: bool,
        major: u32,
        minor: u32,
        mode: u16,
        uid: u32,
        gid: u32,
        mtime: u32,
    ) -> Result<String, TreeError> {
        let node = if block {
            Node::block_device(major, minor, mode)
        } else {
            Node::char_device(major, minor, mode)
        };
        self.insert(path, node.owned_by(uid, gid).modified_at(mtime))
    }

    pub fn put_fifo(
        &mut self,
        path: &str,
        mode: u16,
        uid: u32,
        gid: u32,
        mtime: u32,
    ) -> Result<String, TreeError> {
        self.insert(path, Node::fifo(mode).owned_by(uid, gid).modified_at(mtime))
    }

    /// Insert every node of `subtree` below `at`. The subtree's root lands
    /// on `at` itself, so grafting onto `/` replaces the root's metadata.
    pub fn graft(&mut self, at: &str, subtree: Tree) -> Result<(), TreeError> {
        let at = normalize(at);
        for (path, node) in subtree.nodes {
            let target = if path == "/" { at.clone() } else { normalize(&format!("{at}{path}")) };
            self.insert(&target, node)?;
        }
        Ok(())
    }

    /// Remove a node and everything below it. Returns whether it existed.
    pub fn remove(&mut self, path: &str) -> Result<bool, TreeError> {
        let path = normalize(path);
        if path == "/" {
            return Err(TreeError::RemoveRoot);
        }
        self.remove_descendants(&path);
        Ok(self.nodes.remove(&path).is_some())
    }

    fn remove_descendants(&mut self, path: &str) {
        let prefix = format!("{path}/");
        let doomed: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p.clone())
            .collect();
        for p in doomed {
            self.nodes.remove(&p);
        }
    }
}
