//! Moving trees between the host filesystem and memory.
//!
//! Importing only needs `std`; extracting needs `mknod`, `mkfifo` and
//! `lchown`, which go through the [`HostOps`] capability so that an
//! unprivileged run can substitute placeholders.
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::ffi::CString;
use std::fs;
use std::io::{self, Write};
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::vfs::{self, Node, NodeKind, Tree, PERM_MASK};

#[cfg(target_os = "linux")]
mod sys {
    pub type ModeT = u32;
    pub type DevT = u64;

    pub fn makedev(major: u32, minor: u32) -> DevT {
        let (major, minor) = (u64::from(major), u64::from(minor));
        ((major & 0xfffff000) << 32)
            | ((major & 0xfff) << 8)
            | ((minor & 0xffffff00) << 12)
            | (minor & 0xff)
    }

    pub fn major_minor(dev: u64) -> (u32, u32) {
        let major = ((dev >> 32) & 0xfffff000) | ((dev >> 8) & 0xfff);
        let minor = ((dev >> 12) & 0xffffff00) | (dev & 0xff);
        (major as u32, minor as u32)
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    // BSD-style dev_t: 8-bit major, 24-bit minor
    pub type ModeT = u16;
    pub type DevT = i32;

    pub fn makedev(major: u32, minor: u32) -> DevT {
        (((major & 0xff) << 24) | (minor & 0xffffff)) as i32
    }

    pub fn major_minor(dev: u64) -> (u32, u32) {
        let dev = dev as u32;
        ((dev >> 24) & 0xff, dev & 0xffffff)
    }
}

extern "C" {
    fn mknod(path: *const c_char, mode: sys::ModeT, dev: sys::DevT) -> c_int;
    fn mkfifo(path: *const c_char, mode: sys::ModeT) -> c_int;
}

/// Privileged operations extraction needs.
pub trait HostOps {
    fn mknod(&self, path: &Path, block: bool, mode: u16, major: u32, minor: u32) -> io::Result<()>;
    fn mkfifo(&self, path: &Path, mode: u16) -> io::Result<()>;
    /// Change ownership without following symlinks.
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;
}

/// The real system calls.
pub struct NativeHost;

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

impl HostOps for NativeHost {
    fn mknod(&self, path: &Path, block: bool, mode: u16, major: u32, minor: u32) -> io::Result<()> {
        let kind = if block { vfs::S_IFBLK } else { vfs::S_IFCHR };
        let c = c_path(path)?;
        let mode = (kind | u32::from(mode & PERM_MASK)) as sys::ModeT;
        let rc = unsafe { mknod(c.as_ptr(), mode, sys::makedev(major, minor)) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn mkfifo(&self, path: &Path, mode: u16) -> io::Result<()> {
        let c = c_path(path)?;
        let rc = unsafe { mkfifo(c.as_ptr(), (mode & PERM_MASK) as sys::ModeT) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
    }
}

/// Stands in for device nodes and fifos with empty regular files and
/// leaves ownership alone.
pub struct PlaceholderHost;

impl HostOps for PlaceholderHost {
    fn mknod(&self, path: &Path, _block: bool, mode: u16, _: u32, _: u32) -> io::Result<()> {
        write_placeholder(path, mode)
    }

    fn mkfifo(&self, path: &Path, mode: u16) -> io::Result<()> {
        write_placeholder(path, mode)
    }

    fn chown(&self, _path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
        Ok(())
    }
}

fn write_placeholder(path: &Path, mode: u16) -> io::Result<()> {
    fs::write(path, [])?;
    fs::set_permissions(path, fs::Permissions::from_mode(u32::from(mode & PERM_MASK)))
}

fn mtime_of(meta: &fs::Metadata) -> u32 {
    meta.mtime().clamp(0, i64::from(u32::MAX)) as u32
}

/// Read one host entry, not following symlinks. Directories come back
/// without children; unsupported types such as sockets are `None`.
pub fn import_node(path: &Path) -> Result<Option<Node>> {
    let metadata = fs::symlink_metadata(path).with_context(|| format!("Failed to stat {path:?}"))?;
    let ft = metadata.file_type();
    let perm = (metadata.mode() & 0o7777) as u16;

    let node = if ft.is_symlink() {
        let target = fs::read_link(path).with_context(|| format!("Failed to read link {path:?}"))?;
        let mut node = Node::symlink(target.to_string_lossy().to_string());
        node.mode = perm;
        node
    } else if ft.is_dir() {
        Node::directory(perm)
    } else if ft.is_file() {
        let data = fs::read(path).with_context(|| format!("Failed to read {path:?}"))?;
        Node::file(data, perm)
    } else if ft.is_char_device() || ft.is_block_device() {
        let (major, minor) = sys::major_minor(metadata.rdev());
        if ft.is_block_device() {
            Node::block_device(major, minor, perm)
        } else {
            Node::char_device(major, minor, perm)
        }
    } else if ft.is_fifo() {
        Node::fifo(perm)
    } else {
        return Ok(None);
    };

    Ok(Some(
        node.owned_by(metadata.uid(), metadata.gid())
            .modified_at(mtime_of(&metadata)),
    ))
}

/// Build a tree from a host directory without following symlinks.
pub fn import_dir(root: &Path) -> Result<Tree> {
    let root_node = match import_node(root)? {
        Some(node) if node.is_dir() => node,
        _ => bail!("{root:?} is not a directory"),
    };
    let mut tree = Tree::with_root(root_node);

    let mut stack: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), "/".to_string())];
    while let Some((host_dir, dir)) = stack.pop() {
        let read_dir = fs::read_dir(&host_dir)
            .with_context(|| format!("Failed to read directory {host_dir:?}"))?;
        let mut entries = read_dir.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let vpath = vfs::join(&dir, &name);

            let Some(node) = import_node(&path)? else {
                warn!("skipping {path:?}: unsupported file type");
                continue;
            };
            if node.is_dir() {
                stack.push((path, vpath.clone()));
            }
            tree.insert(&vpath, node)?;
        }
    }

    debug!("imported {} nodes ({} bytes) from {root:?}", tree.len(), tree.total_data_size());
    Ok(tree)
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Materialize a tree under `dest`.
///
/// Ownership is set before permissions, since `chown` clears the setuid
/// and setgid bits. Directory permissions are applied last (deepest first)
/// so read-only directories can still be populated. Ownership is best
/// effort: failures are logged, not fatal.
pub fn extract(tree: &Tree, dest: &Path, host: &dyn HostOps) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {dest:?}"))?;
    let mut dirs: Vec<(PathBuf, u16)> = Vec::new();

    for (path, node) in tree.iter() {
        let target = dest.join(path.trim_start_matches('/'));
        match &node.kind {
            NodeKind::Directory => {
                fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create {target:?}"))?;
                dirs.push((target.clone(), node.mode));
            }
            NodeKind::File(data) => {
                remove_existing(&target)?;
                let mut file = fs::File::create(&target)
                    .with_context(|| format!("Failed to create {target:?}"))?;
                file.write_all(data).with_context(|| format!("Failed to write {target:?}"))?;
                let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(u64::from(node.mtime));
                file.set_modified(mtime)?;
            }
            NodeKind::Symlink(link) => {
                remove_existing(&target)?;
                std::os::unix::fs::symlink(link, &target)
                    .with_context(|| format!("Failed to create symlink {target:?}"))?;
            }
            NodeKind::CharDevice { major, minor } | NodeKind::BlockDevice { major, minor } => {
                remove_existing(&target)?;
                let block = matches!(node.kind, NodeKind::BlockDevice { .. });
                match host.mknod(&target, block, node.mode, *major, *minor) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        warn!("{path}: no permission for mknod, writing a placeholder");
                        write_placeholder(&target, node.mode)?;
                    }
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("Failed to create device {target:?}"));
                    }
                }
            }
            NodeKind::Fifo => {
                remove_existing(&target)?;
                host.mkfifo(&target, node.mode)
                    .with_context(|| format!("Failed to create fifo {target:?}"))?;
            }
        }

        if let Err(e) = host.chown(&target, node.uid, node.gid) {
            debug!("{path}: chown {}:{} failed: {e}", node.uid, node.gid);
        }
        // Symlink modes are not settable; directories are handled below
        if !matches!(node.kind, NodeKind::Directory | NodeKind::Symlink(_)) {
            fs::set_permissions(&target, fs::Permissions::from_mode(u32::from(node.mode)))
                .with_context(|| format!("Failed to set permissions on {target:?}"))?;
        }
    }

    for (dir, mode) in dirs.iter().rev() {
        fs::set_permissions(dir, fs::Permissions::from_mode(u32::from(*mode)))
            .with_context(|| format!("Failed to set permissions on {dir:?}"))?;
    }
    debug!("extracted {} nodes into {dest:?}", tree.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_number_packing() {
        for (major, minor) in [(1, 3), (8, 17), (136, 0)] {
            assert_eq!(sys::major_minor(sys::makedev(major, minor) as u64), (major, minor));
        }
    }

    #[test]
    fn test_extract_then_import() {
        let dir = tempfile::tempdir().unwrap();
        let uid = fs::metadata(dir.path()).unwrap().uid();
        let gid = fs::metadata(dir.path()).unwrap().gid();

        let mut tree = Tree::new();
        let hosts = b"127.0.0.1 localhost\n".to_vec();
        tree.put_file("/etc/hosts", hosts, 0o644, uid, gid, 1_600_000_000).unwrap();
        tree.put_file("/bin/run", b"#!/bin/sh\n".to_vec(), 0o755, uid, gid, 5).unwrap();
        tree.put_dir("/secret", 0o500, uid, gid, 0).unwrap();
        tree.put_file("/secret/key", b"k".to_vec(), 0o400, uid, gid, 0).unwrap();
        tree.put_symlink("/bin/sh", "run", uid, gid, 0).unwrap();
        tree.insert("/run/ctl", Node::fifo(0o600).owned_by(uid, gid)).unwrap();

        let out = dir.path().join("root");
        extract(&tree, &out, &NativeHost).unwrap();

        assert_eq!(fs::read(out.join("etc/hosts")).unwrap(), b"127.0.0.1 localhost\n");
        assert_eq!(fs::read_link(out.join("bin/sh")).unwrap(), Path::new("run"));
        let meta = fs::metadata(out.join("bin/run")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o755);
        assert_eq!(meta.mtime(), 5);
        assert!(fs::symlink_metadata(out.join("run/ctl")).unwrap().file_type().is_fifo());
        let secret = fs::metadata(out.join("secret")).unwrap();
        assert_eq!(secret.permissions().mode() & 0o7777, 0o500);

        let imported = import_dir(&out).unwrap();
        for path in ["/etc/hosts", "/bin/run", "/bin/sh", "/secret/key", "/run/ctl"] {
            let (a, b) = (tree.get(path).unwrap(), imported.get(path).unwrap());
            assert_eq!(a.kind, b.kind, "{path}");
            assert_eq!((b.uid, b.gid), (uid, gid), "{path}");
        }
        assert_eq!(imported.get("/secret").unwrap().mode, 0o500);
        assert_eq!(imported.get("/etc/hosts").unwrap().mtime, 1_600_000_000);

        // Let the tempdir cleanup descend again
        fs::set_permissions(out.join("secret"), fs::Permissions::from_mode(0o700)).unwrap();
    }

    /// Records the order of ownership changes against the mode at the time.
    struct RecordingHost(std::cell::RefCell<Vec<(PathBuf, u32)>>);

    impl HostOps for RecordingHost {
        fn mknod(
            &self,
            path: &Path,
            block: bool,
            mode: u16,
            major: u32,
            minor: u32,
        ) -> io::Result<()> {
            PlaceholderHost.mknod(path, block, mode, major, minor)
        }

        fn mkfifo(&self, path: &Path, mode: u16) -> io::Result<()> {
            PlaceholderHost.mkfifo(path, mode)
        }

        fn chown(&self, path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
            let mode = fs::symlink_metadata(path)?.mode() & 0o7777;
            self.0.borrow_mut().push((path.to_path_buf(), mode));
            Ok(())
        }
    }

    #[test]
    fn test_setuid_survives_extract() {
        let dir = tempfile::tempdir().unwrap();
        let meta = fs::metadata(dir.path()).unwrap();
        let mut tree = Tree::new();
        let (uid, gid) = (meta.uid(), meta.gid());
        tree.put_file("/bin/su", b"\x7fELF".to_vec(), 0o4755, uid, gid, 0).unwrap();

        // A real chown to ourselves still clears setuid on Linux
        let out = dir.path().join("native");
        extract(&tree, &out, &NativeHost).unwrap();
        let mode = fs::metadata(out.join("bin/su")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o4755);

        // Ownership is applied before the final mode
        let host = RecordingHost(Default::default());
        let out = dir.path().join("recorded");
        extract(&tree, &out, &host).unwrap();
        let calls = host.0.borrow();
        let (_, mode_at_chown) = calls.iter().find(|(p, _)| p.ends_with("bin/su")).unwrap();
        assert_ne!(*mode_at_chown, 0o4755);
        let mode = fs::metadata(out.join("bin/su")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o4755);
    }

    #[test]
    fn test_placeholders_for_special_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = Tree::new();
        tree.insert("/dev/null", Node::char_device(1, 3, 0o666)).unwrap();
        tree.insert("/dev/fifo", Node::fifo(0o600)).unwrap();
        extract(&tree, dir.path(), &PlaceholderHost).unwrap();

        for name in ["dev/null", "dev/fifo"] {
            let meta = fs::symlink_metadata(dir.path().join(name)).unwrap();
            assert!(meta.is_file(), "{name}");
            assert_eq!(meta.len(), 0);
        }
        assert_eq!(
            fs::metadata(dir.path().join("dev/null")).unwrap().permissions().mode() & 0o777,
            0o666
        );
    }

    #[test]
    fn test_import_rejects_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(import_dir(file.path()).is_err());
    }

    #[test]
    fn test_import_single_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("motd");
        fs::write(&file, b"welcome\n").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();
        std::os::unix::fs::symlink("motd", dir.path().join("link")).unwrap();

        let node = import_node(&file).unwrap().unwrap();
        assert_eq!(node.kind, NodeKind::File(b"welcome\n".to_vec()));
        assert_eq!(node.mode, 0o640);
        let link = import_node(&dir.path().join("link")).unwrap().unwrap();
        assert_eq!(link.kind, NodeKind::Symlink("motd".to_string()));
        assert!(import_node(dir.path()).unwrap().unwrap().is_dir());
        assert!(import_node(&dir.path().join("missing")).is_err());
    }
}
