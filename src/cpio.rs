/// cpio "newc" archives, the format Linux expects for initramfs images.
///
/// Format reference: https://www.kernel.org/doc/Documentation/early-userspace/buffer-format.txt
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::collections::HashMap;

use crate::vfs::{
    self, Node, Tree, PERM_MASK, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG,
};

pub const NEWC_MAGIC: &[u8; 6] = b"070701";
/// newc with a byte-sum checksum over the file data.
pub const CRC_MAGIC: &[u8; 6] = b"070702";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

/// Header fields of one archive member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpioHeader {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub filesize: u32,
    pub rdevmajor: u32,
    pub rdevminor: u32,
    pub namesize: u32,
    pub check: u32,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Write a single cpio "newc" format entry.
pub fn write_cpio_entry(archive: &mut Vec<u8>, name: &str, hdr: &CpioHeader, data: &[u8]) {
    // The name in cpio must NOT have a leading '/'
    let name = name.trim_start_matches('/');

    // namesize includes the trailing NUL
    let namesize = name.len() + 1;
    let filesize = data.len();

    // Write header (110 bytes of ASCII hex fields)
    let header = format!(
        "070701\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}\
         {:08X}",
        hdr.ino,       // inode
        hdr.mode,      // mode
        hdr.uid,       // uid
        hdr.gid,       // gid
        hdr.nlink,     // nlink
        hdr.mtime,     // mtime
        filesize,      // filesize
        0u32,          // devmajor (filesystem device, not used)
        0u32,          // devminor (filesystem device, not used)
        hdr.rdevmajor, // rdevmajor (character/block device major)
        hdr.rdevminor, // rdevminor (character/block device minor)
        namesize,      // namesize
        0u32,          // checksum (always 0 for newc)
    );
    debug_assert_eq!(header.len(), HEADER_LEN);
    archive.extend_from_slice(header.as_bytes());

    // Write filename + NUL
    archive.extend_from_slice(name.as_bytes());
    archive.push(0);

    // Pad to 4-byte boundary (header + name must be 4-byte aligned)
    archive.resize(archive.len() + align4(HEADER_LEN + namesize) - (HEADER_LEN + namesize), 0);

    // Write file data, padded to 4-byte boundary
    archive.extend_from_slice(data);
    archive.resize(archive.len() + align4(filesize) - filesize, 0);
}

/// Serialize every node except `/` in path order, followed by the trailer.
pub fn store(tree: &Tree) -> Result<Vec<u8>> {
    let mut archive = Vec::with_capacity(tree.total_data_size() + tree.len() * 128);
    let mut ino = 0u32;

    for (path, node) in tree.iter().filter(|(p, _)| *p != "/") {
        ino += 1;
        let data: &[u8] = match &node.kind {
            vfs::NodeKind::File(data) => data,
            vfs::NodeKind::Symlink(target) => target.as_bytes(),
            _ => &[],
        };
        if u32::try_from(data.len()).is_err() {
            bail!("{path}: {} bytes do not fit a cpio size field", data.len());
        }
        let (rdevmajor, rdevminor) = node.device().unwrap_or((0, 0));
        let hdr = CpioHeader {
            ino,
            mode: node.st_mode(),
            uid: node.uid,
            gid: node.gid,
            nlink: if node.is_dir() { 2 } else { 1 },
            mtime: node.mtime,
            rdevmajor,
            rdevminor,
            ..Default::default()
        };
        write_cpio_entry(&mut archive, path, &hdr, data);
    }

    let trailer = CpioHeader {
        nlink: 1,
        ..Default::default()
    };
    write_cpio_entry(&mut archive, TRAILER, &trailer, &[]);
    debug!("cpio: wrote {ino} entries, {} bytes", archive.len());
    Ok(archive)
}

fn parse_hex(field: &[u8], offset: usize) -> Result<u32> {
    let s = std::str::from_utf8(field)
        .with_context(|| format!("non-ASCII cpio header field at {offset}"))?;
    u32::from_str_radix(s, 16).with_context(|| format!("bad cpio header field {s:?} at {offset}"))
}

fn parse_header(raw: &[u8], offset: usize) -> Result<CpioHeader> {
    let field = |i: usize| {
        let start = 6 + i * 8;
        parse_hex(&raw[start..start + 8], offset + start)
    };
    Ok(CpioHeader {
        ino: field(0)?,
        mode: field(1)?,
        uid: field(2)?,
        gid: field(3)?,
        nlink: field(4)?,
        mtime: field(5)?,
        filesize: field(6)?,
        // fields 7 and 8 are the archive's own device
        rdevmajor: field(9)?,
        rdevminor: field(10)?,
        namesize: field(11)?,
        check: field(12)?,
    })
}

/// Parse a newc (or newc+crc) archive into a tree.
///
/// Hard-linked regular files share an inode number and carry their data
/// on one member only; every name in the group ends up with that data.
pub fn load(data: &[u8]) -> Result<Tree> {
    let mut tree = Tree::new();
    let mut pos = 0usize;
    // ino -> paths of regular files with nlink > 1
    let mut links: HashMap<u32, Vec<String>> = HashMap::new();

    loop {
        let Some(raw) = data.get(pos..pos + HEADER_LEN) else {
            bail!("truncated cpio header at offset {pos}");
        };
        let magic = &raw[..6];
        let with_crc = magic == CRC_MAGIC;
        if magic != NEWC_MAGIC && !with_crc {
            bail!("bad cpio magic {:?} at offset {pos}", String::from_utf8_lossy(magic));
        }
        let hdr = parse_header(raw, pos)?;

        let name_start = pos + HEADER_LEN;
        let name_end = name_start + hdr.namesize as usize;
        let Some(name_raw) = data.get(name_start..name_end) else {
            bail!("truncated cpio name at offset {name_start}");
        };
        let name_raw = name_raw.strip_suffix(&[0]).unwrap_or(name_raw);
        let name = String::from_utf8_lossy(name_raw).into_owned();

        let data_start = pos + align4(HEADER_LEN + hdr.namesize as usize);
        let data_end = data_start + hdr.filesize as usize;
        let Some(body) = data.get(data_start..data_end) else {
            bail!("{name}: truncated cpio data at offset {data_start}");
        };
        pos = data_start + align4(hdr.filesize as usize);

        if name == TRAILER {
            break;
        }
        if with_crc {
            let sum = body.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
            if sum != hdr.check {
                bail!("{name}: cpio checksum mismatch (header {:#x}, data {sum:#x})", hdr.check);
            }
        }

        let path = vfs::normalize(&name);
        let perm = (hdr.mode & u32::from(PERM_MASK)) as u16;
        let node = match hdr.mode & S_IFMT {
            S_IFDIR => Node::directory(perm),
            S_IFREG => Node::file(body.to_vec(), perm),
            S_IFLNK => {
                let mut node = Node::symlink(String::from_utf8_lossy(body));
                node.mode = perm;
                node
            }
            S_IFCHR => Node::char_device(hdr.rdevmajor, hdr.rdevminor, perm),
            S_IFBLK => Node::block_device(hdr.rdevmajor, hdr.rdevminor, perm),
            S_IFIFO => Node::fifo(perm),
            other => {
                warn!("cpio: skipping {name}: unsupported file type {other:#o}");
                continue;
            }
        };
        let node = node.owned_by(hdr.uid, hdr.gid).modified_at(hdr.mtime);

        if path == "/" && !node.is_dir() {
            warn!("cpio: ignoring non-directory entry for the archive root");
            continue;
        }
        let is_linked_file = hdr.mode & S_IFMT == S_IFREG && hdr.nlink > 1;
        tree.insert(&path, node).with_context(|| format!("cpio entry {name}"))?;

        if is_linked_file {
            let group = links.entry(hdr.ino).or_default();
            group.push(path);
            if !body.is_empty() {
                for linked in group.iter() {
                    let kind = tree.get_mut(linked).map(|n| &mut n.kind);
                    if let Some(vfs::NodeKind::File(contents)) = kind {
                        *contents = body.to_vec();
                    }
                }
            }
        }
    }

    debug!("cpio: loaded {} nodes", tree.len());
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout() {
        let mut archive = Vec::new();
        let hdr = CpioHeader {
            ino: 1,
            mode: 0o100644,
            nlink: 1,
            ..Default::default()
        };
        write_cpio_entry(&mut archive, "/init", &hdr, b"#!/bin/sh\n");
        assert_eq!(&archive[..6], b"070701");
        // namesize of "init\0"
        assert_eq!(&archive[94..102], b"00000005");
        // 110 + 5 -> 116, then 10 data bytes -> 12
        assert_eq!(archive.len(), 116 + 12);
        assert_eq!(&archive[110..115], b"init\0");
        assert_eq!(&archive[116..126], b"#!/bin/sh\n");
    }

    #[test]
    fn test_round_trip() {
        let mut tree = Tree::new();
        tree.put_file("/init", b"#!/bin/sh\nexec /sbin/init\n".to_vec(), 0o755, 0, 0, 100).unwrap();
        tree.put_dir("/proc", 0o555, 0, 0, 100).unwrap();
        tree.put_symlink("/bin/sh", "busybox", 0, 0, 100).unwrap();
        tree.insert("/dev/console", Node::char_device(5, 1, 0o600)).unwrap();
        tree.insert("/dev/loop0", Node::block_device(7, 0, 0o660).owned_by(0, 6)).unwrap();
        tree.insert("/run/fifo", Node::fifo(0o644)).unwrap();

        let archive = store(&tree).unwrap();
        assert!(archive.len() % 4 == 0);
        assert_eq!(load(&archive).unwrap(), tree);
    }

    #[test]
    fn test_dot_entry_sets_root_metadata() {
        let mut archive = Vec::new();
        let dot = CpioHeader {
            mode: 0o040700,
            uid: 1000,
            gid: 1000,
            nlink: 2,
            mtime: 9,
            ..Default::default()
        };
        write_cpio_entry(&mut archive, ".", &dot, &[]);
        write_cpio_entry(&mut archive, TRAILER, &CpioHeader::default(), &[]);
        let tree = load(&archive).unwrap();
        assert_eq!(tree.root().mode, 0o700);
        assert_eq!((tree.root().uid, tree.root().mtime), (1000, 9));
    }

    #[test]
    fn test_hard_links_share_data() {
        let mut archive = Vec::new();
        let hdr = CpioHeader {
            ino: 42,
            mode: 0o100755,
            nlink: 2,
            ..Default::default()
        };
        write_cpio_entry(&mut archive, "bin/true", &hdr, &[]);
        write_cpio_entry(&mut archive, "bin/false", &hdr, b"ELF");
        write_cpio_entry(&mut archive, TRAILER, &CpioHeader::default(), &[]);

        let tree = load(&archive).unwrap();
        assert_eq!(tree.get("/bin/true").unwrap().kind, vfs::NodeKind::File(b"ELF".to_vec()));
        assert_eq!(tree.get("/bin/false").unwrap().payload_len(), 3);
    }

    #[test]
    fn test_crc_variant_is_verified() {
        let mut archive = Vec::new();
        let hdr = CpioHeader {
            ino: 1,
            mode: 0o100644,
            nlink: 1,
            ..Default::default()
        };
        write_cpio_entry(&mut archive, "f", &hdr, b"ab");
        write_cpio_entry(&mut archive, TRAILER, &CpioHeader::default(), &[]);
        archive[..6].copy_from_slice(CRC_MAGIC);
        // checksum field: 'a' + 'b' = 0xC3
        archive[102..110].copy_from_slice(b"000000C3");
        assert!(load(&archive).is_ok());

        archive[102..110].copy_from_slice(b"000000C4");
        assert!(load(&archive).unwrap_err().to_string().contains("checksum"));
    }

    #[test]
    fn test_malformed_archives() {
        assert!(load(b"").is_err());
        assert!(load(&[b'0'; 200]).unwrap_err().to_string().contains("magic"));

        let archive = store(&Tree::new()).unwrap();
        assert!(load(&archive[..archive.len() - 4]).is_err());
    }
}
