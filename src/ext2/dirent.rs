//! `ext2_dir_entry_2` records: packing a directory's payload and parsing it
//! back.
//!
//! Each record is an 8-byte header (`inode:u32, rec_len:u16, name_len:u8,
//! file_type:u8`) followed by the name, padded to 4 bytes. Records never
//! cross a block boundary: the last record in every block is stretched to
//! the end of the block.
use super::error::Ext2Error;
use super::layout::{read_le16, read_le32, write_le16, write_le32};
use crate::vfs::{Node, NodeKind};

const DIRENT_HEADER: usize = 8;
pub const MAX_NAME_LEN: usize = 255;

// File type tags for directory entries
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SYMLINK: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u32,
    pub name: Vec<u8>,
    pub file_type: u8,
}

impl DirEntry {
    pub fn new(ino: u32, name: impl Into<Vec<u8>>, file_type: u8) -> Self {
        DirEntry {
            ino,
            name: name.into(),
            file_type,
        }
    }
}

pub fn file_type_of(node: &Node) -> u8 {
    match node.kind {
        NodeKind::File(_) => EXT2_FT_REG_FILE,
        NodeKind::Directory => EXT2_FT_DIR,
        NodeKind::CharDevice { .. } => EXT2_FT_CHRDEV,
        NodeKind::BlockDevice { .. } => EXT2_FT_BLKDEV,
        NodeKind::Fifo => EXT2_FT_FIFO,
        NodeKind::Symlink(_) => EXT2_FT_SYMLINK,
    }
}

/// Minimal record length for a name: header plus name, 4-byte aligned.
pub fn record_len(name_len: usize) -> usize {
    (DIRENT_HEADER + name_len + 3) & !3
}

/// Payload size `pack` produces for entries with these name lengths.
pub fn packed_len(name_lens: impl IntoIterator<Item = usize>, block_size: usize) -> usize {
    let mut blocks = 0;
    let mut used = 0;
    for len in name_lens {
        let rec = record_len(len);
        if used > 0 && used + rec > block_size {
            blocks += 1;
            used = 0;
        }
        used += rec;
        if used == block_size {
            blocks += 1;
            used = 0;
        }
    }
    if used > 0 {
        blocks += 1;
    }
    blocks * block_size
}

/// Pack entries (`.` and `..` included, in order) into whole blocks.
///
/// A record that would cross a block boundary starts the next block, and the
/// previous record's `rec_len` grows to cover the rest of its block.
pub fn pack(entries: &[DirEntry], block_size: usize) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    let mut block_start = 0usize;
    // Offset of the last record written into the current block
    let mut last: Option<usize> = None;

    for entry in entries {
        let rec = record_len(entry.name.len());
        let used = out.len() - block_start;
        if used > 0 && used + rec > block_size {
            if let Some(prev) = last.take() {
                write_le16(&mut out, prev + 4, (block_start + block_size - prev) as u16);
            }
            block_start += block_size;
            out.resize(block_start, 0);
        }

        let offset = out.len();
        out.resize(offset + rec, 0);
        let ent = &mut out[offset..offset + rec];
        // d_inode
        write_le32(ent, 0, entry.ino);
        // d_rec_len
        write_le16(ent, 4, rec as u16);
        // d_name_len
        ent[6] = entry.name.len() as u8;
        // d_file_type
        ent[7] = entry.file_type;
        // d_name
        ent[DIRENT_HEADER..DIRENT_HEADER + entry.name.len()].copy_from_slice(&entry.name);
        last = Some(offset);

        if out.len() - block_start == block_size {
            block_start += block_size;
            last = None;
        }
    }

    // Last entry fills remaining block
    if let Some(prev) = last {
        let end = block_start + block_size;
        write_le16(&mut out, prev + 4, (end - prev) as u16);
        out.resize(end, 0);
    }
    out
}

/// Parse every live record (inode != 0) of a directory payload.
pub fn parse(data: &[u8], block_size: usize) -> Result<Vec<DirEntry>, Ext2Error> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + DIRENT_HEADER <= data.len() {
        let ino = read_le32(data, pos);
        let rec_len = usize::from(read_le16(data, pos + 4));
        let name_len = usize::from(data[pos + 6]);
        let file_type = data[pos + 7];

        if rec_len < DIRENT_HEADER || rec_len % 4 != 0 {
            return Err(Ext2Error::CorruptImage(format!(
                "directory record at {pos} has rec_len {rec_len}"
            )));
        }
        if pos % block_size + rec_len > block_size || pos + rec_len > data.len() {
            return Err(Ext2Error::CorruptImage(format!(
                "directory record at {pos} crosses a block boundary"
            )));
        }
        if DIRENT_HEADER + name_len > rec_len {
            return Err(Ext2Error::CorruptImage(format!(
                "directory record at {pos}: name of {name_len} bytes in a {rec_len}-byte record"
            )));
        }

        if ino != 0 {
            let name = data[pos + DIRENT_HEADER..pos + DIRENT_HEADER + name_len].to_vec();
            entries.push(DirEntry { ino, name, file_type });
        }
        pos += rec_len;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_with(names: &[String]) -> Vec<DirEntry> {
        let mut entries = vec![
            DirEntry::new(2, ".", EXT2_FT_DIR),
            DirEntry::new(2, "..", EXT2_FT_DIR),
        ];
        for (i, name) in names.iter().enumerate() {
            entries.push(DirEntry::new(11 + i as u32, name.as_bytes(), EXT2_FT_REG_FILE));
        }
        entries
    }

    #[test]
    fn test_record_alignment() {
        assert_eq!(record_len(1), 12);
        assert_eq!(record_len(2), 12);
        assert_eq!(record_len(4), 12);
        assert_eq!(record_len(5), 16);
        assert_eq!(record_len(255), 264);
    }

    #[test]
    fn empty_directory_is_one_block() {
        let payload = pack(&dir_with(&[]), 1024);
        assert_eq!(payload.len(), 1024);
        // "." keeps its minimal length, ".." stretches to the end
        assert_eq!(read_le16(&payload, 4), 12);
        assert_eq!(read_le16(&payload, 12 + 4), 1024 - 12);
        assert_eq!(packed_len([1, 2], 1024), 1024);
    }

    #[test]
    fn records_never_cross_block_boundaries() {
        // 12 + 12 + 41 * 24 = 1008 fits, a 42nd 24-byte record does not.
        let names: Vec<String> = (0..45).map(|i| format!("file-{i:011}")).collect();
        assert_eq!(record_len(names[0].len()), 24);
        let entries = dir_with(&names);
        let payload = pack(&entries, 1024);
        assert_eq!(payload.len(), 2048);
        assert_eq!(packed_len(entries.iter().map(|e| e.name.len()), 1024), 2048);

        // Walk the first block: rec_lens sum to exactly one block, and the
        // last record before the boundary was stretched.
        let mut pos = 0;
        let mut last = 0;
        while pos < 1024 {
            last = pos;
            pos += usize::from(read_le16(&payload, pos + 4));
        }
        assert_eq!(pos, 1024);
        assert_eq!(usize::from(read_le16(&payload, last + 4)), 1024 - last);
        assert_eq!(last, 24 + 40 * 24);

        // Second block starts with the 42nd child.
        assert_eq!(read_le32(&payload, 1024), 11 + 41);

        let parsed = parse(&payload, 1024).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn exact_fill_needs_no_stretching() {
        // 12 + 12 + 3 * 264 + 208 = 1024: the last child ends on the boundary.
        let mut names: Vec<String> = vec!["a".repeat(255); 3];
        names.push("b".repeat(200));
        let entries = dir_with(&names);
        let payload = pack(&entries, 1024);
        assert_eq!(payload.len(), 1024);
        assert_eq!(read_le16(&payload, 1024 - 208 + 4), 208);
        assert_eq!(packed_len(entries.iter().map(|e| e.name.len()), 1024), 1024);
        assert_eq!(parse(&payload, 1024).unwrap().len(), 6);
    }

    #[test]
    fn parse_skips_deleted_and_rejects_garbage() {
        let mut payload = pack(&dir_with(&["gone".to_string(), "kept".to_string()]), 1024);
        // Zero the inode of "gone" (third record at offset 24).
        write_le32(&mut payload, 24, 0);
        let names: Vec<Vec<u8>> =
            parse(&payload, 1024).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![b".".to_vec(), b"..".to_vec(), b"kept".to_vec()]);

        write_le16(&mut payload, 4, 0);
        assert!(matches!(parse(&payload, 1024), Err(Ext2Error::CorruptImage(_))));
    }
}
