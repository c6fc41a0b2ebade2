//! ustar archive reader and writer.
//!
//! Reads plain ustar plus the GNU (`L`/`K`) and pax (`x`) long-name
//! extensions. Writes ustar, splitting long paths into prefix/name and
//! falling back to GNU long-name records when that is not enough.
use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::vfs::{self, Node, NodeKind, Tree, PERM_MASK};

const BLOCK: usize = 512;
const ZERO_BLOCK: [u8; BLOCK] = [0u8; BLOCK];
const USTAR_MAGIC: &[u8] = b"ustar";
const GNU_LONGLINK: &str = "././@LongLink";

/// Tar entry types we support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarEntryType {
    File,
    HardLink,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
}

impl TarEntryType {
    fn from_flag(flag: u8) -> Option<Self> {
        Some(match flag {
            b'0' | b'7' | 0 => TarEntryType::File,
            b'1' => TarEntryType::HardLink,
            b'2' => TarEntryType::Symlink,
            b'3' => TarEntryType::CharDevice,
            b'4' => TarEntryType::BlockDevice,
            b'5' => TarEntryType::Directory,
            b'6' => TarEntryType::Fifo,
            _ => return None,
        })
    }

    fn flag(self) -> u8 {
        match self {
            TarEntryType::File => b'0',
            TarEntryType::HardLink => b'1',
            TarEntryType::Symlink => b'2',
            TarEntryType::CharDevice => b'3',
            TarEntryType::BlockDevice => b'4',
            TarEntryType::Directory => b'5',
            TarEntryType::Fifo => b'6',
        }
    }
}

/// A single entry in a tar archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    /// Normalized relative path; empty for the archive root (`./`).
    pub path: String,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub entry_type: TarEntryType,
    pub link_target: String,
    pub data: Vec<u8>,
    pub dev_major: u32,
    pub dev_minor: u32,
}

/// Overrides collected from GNU and pax extension records for the next entry.
#[derive(Debug, Default)]
struct Pending {
    path: Option<String>,
    link: Option<String>,
    size: Option<usize>,
    uid: Option<u32>,
    gid: Option<u32>,
    mtime: Option<u32>,
}

/// Parse an uncompressed tar archive into a list of entries.
pub fn parse_tar(data: &[u8]) -> Result<Vec<TarEntry>> {
    let mut entries = Vec::new();
    let mut pending = Pending::default();
    let mut pos = 0;

    while pos + BLOCK <= data.len() {
        // End of archive is a zero block (normally two)
        if data[pos..pos + BLOCK] == ZERO_BLOCK {
            break;
        }

        let header = &data[pos..pos + BLOCK];
        verify_checksum(header, pos)?;

        let typeflag = header[156];
        let header_size = parse_numeric(&header[124..136]) as usize;
        let size = match typeflag {
            b'x' | b'L' | b'K' | b'g' => header_size,
            _ => pending.size.take().unwrap_or(header_size),
        };
        let data_start = pos + BLOCK;
        let Some(end) = data_start.checked_add(size).filter(|&end| end <= data.len()) else {
            bail!("truncated tar archive: entry at offset {pos} needs {size} bytes");
        };
        let body = &data[data_start..end];
        // Advance past header + data (padded to 512-byte boundary)
        pos = end.next_multiple_of(BLOCK);

        match typeflag {
            b'L' => {
                pending.path = Some(c_string(body));
                continue;
            }
            b'K' => {
                pending.link = Some(c_string(body));
                continue;
            }
            b'x' => {
                apply_pax(body, &mut pending)
                    .with_context(|| format!("pax header before offset {pos}"))?;
                continue;
            }
            b'g' => {
                debug!("tar: ignoring pax global header");
                continue;
            }
            _ => {}
        }

        let Some(entry_type) = TarEntryType::from_flag(typeflag) else {
            warn!("tar: skipping entry with unsupported type {:?}", typeflag as char);
            pending = Pending::default();
            continue;
        };

        let full_path = match pending.path.take() {
            Some(path) => path,
            None => ustar_path(header),
        };
        let link_target = pending.link.take().unwrap_or_else(|| c_string(&header[157..257]));

        entries.push(TarEntry {
            path: relative(&full_path),
            mode: (parse_numeric(&header[100..108]) as u32 & u32::from(PERM_MASK)) as u16,
            uid: pending.uid.take().unwrap_or(parse_numeric(&header[108..116]) as u32),
            gid: pending.gid.take().unwrap_or(parse_numeric(&header[116..124]) as u32),
            mtime: pending.mtime.take().unwrap_or(parse_numeric(&header[136..148]) as u32),
            entry_type,
            link_target,
            data: if entry_type == TarEntryType::File {
                body.to_vec()
            } else {
                Vec::new()
            },
            dev_major: parse_numeric(&header[329..337]) as u32,
            dev_minor: parse_numeric(&header[337..345]) as u32,
        });
    }

    Ok(entries)
}

/// Build a tree from a tar archive.
///
/// Hard links copy the contents of the previously loaded target; a link to
/// something not yet seen is an error.
pub fn load(data: &[u8]) -> Result<Tree> {
    let mut tree = Tree::new();
    for entry in parse_tar(data)? {
        let path = vfs::normalize(&entry.path);
        let node = match entry.entry_type {
            TarEntryType::File => Node::file(entry.data, entry.mode),
            TarEntryType::Directory => Node::directory(entry.mode),
            TarEntryType::Symlink => {
                let mut node = Node::symlink(entry.link_target);
                node.mode = entry.mode;
                node
            }
            TarEntryType::CharDevice => {
                Node::char_device(entry.dev_major, entry.dev_minor, entry.mode)
            }
            TarEntryType::BlockDevice => {
                Node::block_device(entry.dev_major, entry.dev_minor, entry.mode)
            }
            TarEntryType::Fifo => Node::fifo(entry.mode),
            TarEntryType::HardLink => {
                let target = vfs::normalize(&entry.link_target);
                let Some(existing) = tree.get(&target) else {
                    bail!("{path}: hard link to {target}, which is not in the archive");
                };
                let mut node = existing.clone();
                node.mode = entry.mode;
                node
            }
        };

        let node = node.owned_by(entry.uid, entry.gid).modified_at(entry.mtime);
        if path == "/" && !node.is_dir() {
            warn!("tar: ignoring non-directory entry for the archive root");
            continue;
        }
        tree.insert(&path, node).with_context(|| format!("tar entry {}", entry.path))?;
    }
    debug!("tar: loaded {} nodes", tree.len());
    Ok(tree)
}

/// Serialize a tree as a ustar archive. The root is written as `./`.
pub fn store(tree: &Tree) -> Result<Vec<u8>> {
    let mut archive = Vec::with_capacity(tree.total_data_size() + tree.len() * 2 * BLOCK);

    for (path, node) in tree.iter() {
        let mut name = if path == "/" {
            "./".to_string()
        } else {
            path.trim_start_matches('/').to_string()
        };
        if node.is_dir() && path != "/" {
            name.push('/');
        }

        let (entry_type, link, data): (TarEntryType, &str, &[u8]) = match &node.kind {
            NodeKind::File(data) => (TarEntryType::File, "", data),
            NodeKind::Directory => (TarEntryType::Directory, "", &[]),
            NodeKind::Symlink(target) => (TarEntryType::Symlink, target, &[]),
            NodeKind::CharDevice { .. } => (TarEntryType::CharDevice, "", &[]),
            NodeKind::BlockDevice { .. } => (TarEntryType::BlockDevice, "", &[]),
            NodeKind::Fifo => (TarEntryType::Fifo, "", &[]),
        };

        if link.len() > 100 {
            write_long_name(&mut archive, b'K', link);
        }
        let (prefix, short) = match split_ustar_path(&name) {
            Some(split) => split,
            None => {
                write_long_name(&mut archive, b'L', &name);
                ("", truncate(&name, 100))
            }
        };

        let (major, minor) = node.device().unwrap_or((0, 0));
        let mut header = [0u8; BLOCK];
        put_str(&mut header[0..100], short);
        put_numeric(&mut header[100..108], u64::from(node.mode));
        put_numeric(&mut header[108..116], u64::from(node.uid));
        put_numeric(&mut header[116..124], u64::from(node.gid));
        put_numeric(&mut header[124..136], data.len() as u64);
        put_numeric(&mut header[136..148], u64::from(node.mtime));
        header[156] = entry_type.flag();
        put_str(&mut header[157..257], truncate(link, 100));
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");
        put_numeric(&mut header[329..337], u64::from(major));
        put_numeric(&mut header[337..345], u64::from(minor));
        put_str(&mut header[345..500], prefix);
        write_checksum(&mut header);

        archive.extend_from_slice(&header);
        write_padded(&mut archive, data);
    }

    // Two zero blocks mark the end of the archive
    archive.extend_from_slice(&ZERO_BLOCK);
    archive.extend_from_slice(&ZERO_BLOCK);
    debug!("tar: wrote {} entries, {} bytes", tree.len(), archive.len());
    Ok(archive)
}

/// Whether `data` starts with a ustar (or GNU) header.
pub fn is_tar(data: &[u8]) -> bool {
    data.len() >= BLOCK && &data[257..262] == USTAR_MAGIC
}

fn write_padded(archive: &mut Vec<u8>, data: &[u8]) {
    archive.extend_from_slice(data);
    archive.resize(archive.len() + data.len().div_ceil(BLOCK) * BLOCK - data.len(), 0);
}

/// GNU `././@LongLink` record carrying a name that does not fit the header.
fn write_long_name(archive: &mut Vec<u8>, flag: u8, name: &str) {
    let mut body = name.as_bytes().to_vec();
    body.push(0);

    let mut header = [0u8; BLOCK];
    put_str(&mut header[0..100], GNU_LONGLINK);
    put_numeric(&mut header[100..108], 0o644);
    put_numeric(&mut header[108..116], 0);
    put_numeric(&mut header[116..124], 0);
    put_numeric(&mut header[124..136], body.len() as u64);
    put_numeric(&mut header[136..148], 0);
    header[156] = flag;
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");
    write_checksum(&mut header);

    archive.extend_from_slice(&header);
    write_padded(archive, &body);
}

/// Split a path into a ustar prefix (<= 155) and name (<= 100) at a `/`.
fn split_ustar_path(path: &str) -> Option<(&str, &str)> {
    if path.len() <= 100 {
        return Some(("", path));
    }
    // Directory names keep their trailing slash in the name part
    let search = path.strip_suffix('/').unwrap_or(path);
    search
        .char_indices()
        .filter(|&(_, c)| c == '/')
        .map(|(i, _)| (&path[..i], &path[i + 1..]))
        .find(|(prefix, name)| prefix.len() <= 155 && name.len() <= 100 && !name.is_empty())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn ustar_path(header: &[u8]) -> String {
    let name = c_string(&header[0..100]);
    let prefix = if &header[257..262] == USTAR_MAGIC {
        c_string(&header[345..500])
    } else {
        String::new()
    };
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Normalize: strip leading "./" and "/" and trailing "/"
fn relative(path: &str) -> String {
    vfs::normalize(path).trim_start_matches('/').to_string()
}

fn c_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn put_str(field: &mut [u8], s: &str) {
    let n = s.len().min(field.len());
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// Parse a numeric header field: octal text, or GNU base-256 when the
/// high bit of the first byte is set.
fn parse_numeric(field: &[u8]) -> u64 {
    if field.first().is_some_and(|&b| b & 0x80 != 0) {
        return field[1..]
            .iter()
            .fold(u64::from(field[0] & 0x7f), |acc, &b| (acc << 8) | u64::from(b));
    }
    let s: String = field
        .iter()
        .skip_while(|&&b| b == b' ')
        .take_while(|&&b| b != 0 && b != b' ')
        .filter(|&&b| (b'0'..=b'7').contains(&b))
        .map(|&b| b as char)
        .collect();
    u64::from_str_radix(&s, 8).unwrap_or(0)
}

/// Zero-padded octal with a trailing NUL, or base-256 if it does not fit.
fn put_numeric(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let octal = format!("{value:0digits$o}");
    if octal.len() <= digits {
        field[..digits].copy_from_slice(octal.as_bytes());
        field[digits] = 0;
        return;
    }
    field.fill(0);
    let bytes = value.to_be_bytes();
    let n = bytes.len().min(field.len() - 1);
    let start = field.len() - n;
    field[start..].copy_from_slice(&bytes[bytes.len() - n..]);
    field[0] |= 0x80;
}

fn header_sum(header: &[u8]) -> u64 {
    header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { u64::from(b' ') } else { u64::from(b) })
        .sum()
}

fn write_checksum(header: &mut [u8; BLOCK]) {
    let sum = header_sum(header);
    let field = format!("{sum:06o}\0 ");
    header[148..156].copy_from_slice(field.as_bytes());
}

fn verify_checksum(header: &[u8], offset: usize) -> Result<()> {
    let stored = parse_numeric(&header[148..156]);
    let unsigned = header_sum(header);
    // Some old writers summed signed bytes
    let signed: i64 = header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { i64::from(b' ') } else { i64::from(b as i8) })
        .sum();
    if stored != unsigned && stored as i64 != signed {
        bail!(
            "tar header checksum mismatch at offset {offset}: \
             stored {stored:o}, computed {unsigned:o}"
        );
    }
    Ok(())
}

/// Apply `path`, `linkpath`, `size`, `uid`, `gid` and `mtime` records of a
/// pax extended header.
fn apply_pax(body: &[u8], pending: &mut Pending) -> Result<()> {
    let mut rest = body;
    while !rest.is_empty() {
        let Some(space) = rest.iter().position(|&b| b == b' ') else {
            break;
        };
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .context("bad pax record length")?;
        if len <= space || len > rest.len() {
            bail!("pax record length {len} out of range");
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        rest = &rest[len..];

        let Some(eq) = record.iter().position(|&b| b == b'=') else {
            continue;
        };
        let key = String::from_utf8_lossy(&record[..eq]);
        let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();
        // Integer part only; pax times may carry a fraction
        let number = || value.split('.').next().and_then(|v| v.parse::<u64>().ok());
        match key.as_ref() {
            "path" => pending.path = Some(value.clone()),
            "linkpath" => pending.link = Some(value.clone()),
            "size" => pending.size = number().map(|n| n as usize),
            "uid" => pending.uid = number().map(|n| n as u32),
            "gid" => pending.gid = number().map(|n| n as u32),
            "mtime" => pending.mtime = number().map(|n| n as u32),
            _ => {}
        }
    }
    Ok(())
}
