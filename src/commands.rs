//! Subcommand implementations.
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cli::{Args, Command, Owner, SpecialKind};
use crate::ext2;
use crate::host::{self, HostOps, NativeHost, PlaceholderHost};
use crate::image::{self, ImageFormat, StoreOptions};
use crate::vfs::{self, Node, NodeKind, Tree};

pub fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Ls { image, path, long } => {
            let (tree, _) = read_image(&image)?;
            for line in list(&tree, &path, long)? {
                println!("{line}");
            }
        }
        Command::Info { image } => {
            let data = fs::read(&image).with_context(|| format!("Failed to read {image:?}"))?;
            for line in describe(&data)? {
                println!("{line}");
            }
        }
        Command::Convert {
            input,
            output,
            to,
            block_size,
            gzip,
            uimage,
        } => {
            let (tree, detected) = read_image(&input)?;
            info!("converting {detected} image {input:?} to {to}");
            let opts = StoreOptions { block_size, gzip, uimage };
            write_image(&tree, &output, to, &opts)?;
        }
        Command::Pack {
            dir,
            output,
            to,
            block_size,
            gzip,
            uimage,
        } => {
            let tree = host::import_dir(&dir)?;
            if tree.is_empty() {
                warn!("{dir:?} is empty, the image will hold only a root directory");
            }
            info!("packing {} nodes from {dir:?} as {to}", tree.len());
            let opts = StoreOptions { block_size, gzip, uimage };
            write_image(&tree, &output, to, &opts)?;
        }
        Command::Extract {
            image,
            dir,
            placeholders,
        } => {
            let (tree, _) = read_image(&image)?;
            let ops: &dyn HostOps = if placeholders { &PlaceholderHost } else { &NativeHost };
            host::extract(&tree, &dir, ops)?;
        }
        Command::Add { image, src, dest } => edit_image(&image, |tree| add(tree, &src, &dest))?,
        Command::Mkdir {
            image,
            path,
            mode,
            owner,
        } => edit_image(&image, |tree| {
            tree.put_dir(&path, mode, owner.uid, owner.gid, now())?;
            Ok(())
        })?,
        Command::Rm { image, path } => edit_image(&image, |tree| {
            if !tree.remove(&path)? {
                bail!("{path}: no such file or directory");
            }
            Ok(())
        })?,
        Command::Ln {
            image,
            target,
            path,
            owner,
        } => edit_image(&image, |tree| {
            tree.put_symlink(&path, &target, owner.uid, owner.gid, now())?;
            Ok(())
        })?,
        Command::Mknod {
            image,
            path,
            kind,
            major,
            minor,
            mode,
            owner,
        } => edit_image(&image, |tree| mknod(tree, &path, kind, (major, minor), mode, owner))?,
    }
    Ok(())
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs().min(u64::from(u32::MAX)) as u32)
}

/// Load an image, apply `edit`, and write it back in the shape it was read.
fn edit_image(path: &Path, edit: impl FnOnce(&mut Tree) -> Result<()>) -> Result<()> {
    let (mut tree, detected) = read_image(path)?;
    edit(&mut tree)?;
    info!("rewriting {detected} image {path:?}");
    write_image(&tree, path, detected.format, &detected.store_options())
}

/// Copy a host file, or a whole directory, to `dest` in the tree.
fn add(tree: &mut Tree, src: &Path, dest: &str) -> Result<()> {
    let Some(node) = host::import_node(src)? else {
        bail!("{src:?}: unsupported file type");
    };
    if node.is_dir() {
        tree.graft(dest, host::import_dir(src)?)?;
    } else {
        tree.insert(dest, node)?;
    }
    Ok(())
}

fn mknod(
    tree: &mut Tree,
    path: &str,
    kind: SpecialKind,
    numbers: (Option<u32>, Option<u32>),
    mode: u16,
    owner: Owner,
) -> Result<()> {
    let block = match kind {
        SpecialKind::Fifo => {
            tree.put_fifo(path, mode, owner.uid, owner.gid, now())?;
            return Ok(());
        }
        SpecialKind::Block => true,
        SpecialKind::Char => false,
    };
    let (Some(major), Some(minor)) = numbers else {
        bail!("{path}: device nodes need a major and a minor number");
    };
    tree.put_device(path, block, major, minor, mode, owner.uid, owner.gid, now())?;
    Ok(())
}

fn read_image(path: &Path) -> Result<(Tree, image::Detected)> {
    let data = fs::read(path).with_context(|| format!("Failed to read {path:?}"))?;
    image::load(&data).with_context(|| format!("Failed to load {path:?}"))
}

fn write_image(tree: &Tree, path: &Path, format: ImageFormat, opts: &StoreOptions) -> Result<()> {
    let bytes = image::store(tree, format, opts)?;
    fs::write(path, &bytes).with_context(|| format!("Failed to write {path:?}"))?;
    info!("wrote {} bytes to {path:?}", bytes.len());
    Ok(())
}

/// `ls -l` style type and permission string.
pub fn mode_string(node: &Node) -> String {
    let kind = match node.kind {
        NodeKind::Directory => 'd',
        NodeKind::File(_) => '-',
        NodeKind::Symlink(_) => 'l',
        NodeKind::CharDevice { .. } => 'c',
        NodeKind::BlockDevice { .. } => 'b',
        NodeKind::Fifo => 'p',
    };
    let mut s = String::with_capacity(10);
    s.push(kind);
    for (shift, special, special_char) in [(6, 0o4000, 's'), (3, 0o2000, 's'), (0, 0o1000, 't')] {
        let bits = (node.mode >> shift) & 0o7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        let exec = bits & 1 != 0;
        s.push(match (node.mode & special != 0, exec) {
            (true, true) => special_char,
            (true, false) => special_char.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    s
}

fn list_line(path: &str, node: &Node, long: bool) -> String {
    let name = vfs::file_name(path);
    if !long {
        return name.to_string();
    }
    let size = match node.device() {
        Some((major, minor)) => format!("{major}, {minor}"),
        None => node.payload_len().to_string(),
    };
    let mode = mode_string(node);
    let mut line = format!("{mode} {:>5} {:>5} {size:>10} {name}", node.uid, node.gid);
    if let NodeKind::Symlink(target) = &node.kind {
        line.push_str(" -> ");
        line.push_str(target);
    }
    line
}

/// Lines for `ls`: a directory's children, or the single node at `path`.
pub fn list(tree: &Tree, path: &str, long: bool) -> Result<Vec<String>> {
    let path = vfs::normalize(path);
    let Some(node) = tree.get(&path) else {
        bail!("{path}: no such file or directory");
    };
    if !node.is_dir() {
        return Ok(vec![list_line(&path, node, long)]);
    }
    Ok(tree
        .children(&path)
        .into_iter()
        .map(|(child, node)| list_line(child, node, long))
        .collect())
}

/// Summary lines for `info`.
pub fn describe(data: &[u8]) -> Result<Vec<String>> {
    let (tree, detected) = image::load(data)?;
    let mut lines = vec![format!("format: {detected}")];
    if let Some(header) = &detected.uimage {
        lines.push(header.to_string());
    }

    if detected.format == ImageFormat::Ext2 {
        let (raw, _) = image::unwrap(data)?;
        let reader = ext2::Reader::open(&raw)?;
        let sb = reader.superblock();
        lines.push(format!("volume: {}", sb.volume_label()));
        lines.push(format!("block size: {}", reader.block_size()));
        lines.push(format!("blocks: {} ({} free)", sb.blocks_count, sb.free_blocks_count));
        lines.push(format!("inodes: {} ({} free)", sb.inodes_count, sb.free_inodes_count));
        lines.push(format!("inode table: block {}", reader.group_descriptor().inode_table));
        lines.push(format!("revision: {}", sb.rev_level));
    }

    let count = |pred: fn(&Node) -> bool| tree.iter().filter(|(_, n)| pred(n)).count();
    lines.push(format!(
        "entries: {} ({} directories, {} files, {} symlinks, {} devices, {} fifos)",
        tree.len(),
        count(Node::is_dir),
        count(|n| matches!(n.kind, NodeKind::File(_))),
        count(|n| matches!(n.kind, NodeKind::Symlink(_))),
        count(|n| n.device().is_some()),
        count(|n| matches!(n.kind, NodeKind::Fifo)),
    ));
    lines.push(format!("file data: {} bytes", tree.total_data_size()));
    Ok(lines)
}
