//! Decodes an ext2 image back into a tree without mounting it.
//!
//! Every offset derived from the image is bounds-checked before use, so a
//! hostile or truncated image yields an error, never a panic. Block chains
//! and the directory walk are driven by explicit worklists.
use std::collections::HashSet;

use log::{debug, warn};

use super::adapters::{decode_device, unpack_inline_symlink, INLINE_SYMLINK_MAX};
use super::dirent::{self, DirEntry};
use super::error::Ext2Error;
use super::layout::{
    GroupDescriptor, Inode, Superblock, DYNAMIC_REV, EXT2_SUPER_MAGIC, FEATURE_INCOMPAT_FILETYPE,
    GOOD_OLD_REV, GROUP_DESC_SIZE, INODE_SIZE, N_BLOCKS, N_DIRECT, ROOT_INO, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE,
};
use crate::vfs::{self, Node, Tree, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFREG};

/// Decode a whole image into a tree.
pub fn load(image: &[u8]) -> Result<Tree, Ext2Error> {
    Reader::open(image)?.read_tree()
}

/// A validated view over an ext2 image.
pub struct Reader<'a> {
    image: &'a [u8],
    sb: Superblock,
    gd: GroupDescriptor,
    block_size: usize,
    inode_size: usize,
}

impl<'a> Reader<'a> {
    /// Validate the superblock and group descriptor.
    pub fn open(image: &'a [u8]) -> Result<Self, Ext2Error> {
        if image.len() < SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE {
            return Err(Ext2Error::CorruptImage(format!(
                "{} bytes is too small to hold a superblock",
                image.len()
            )));
        }
        let sb = Superblock::parse(&image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE])?;

        if sb.magic != EXT2_SUPER_MAGIC {
            return Err(Ext2Error::BadMagic {
                expected: EXT2_SUPER_MAGIC,
                actual: sb.magic,
            });
        }
        if sb.rev_level > DYNAMIC_REV {
            return Err(Ext2Error::UnsupportedRevision(sb.rev_level));
        }
        if sb.log_block_size > 2 {
            return Err(Ext2Error::UnsupportedBlockSize(format!(
                "log2 exponent {} (1024 << {})",
                sb.log_block_size, sb.log_block_size
            )));
        }
        let unknown = sb.feature_incompat & !FEATURE_INCOMPAT_FILETYPE;
        if unknown != 0 {
            return Err(Ext2Error::UnsupportedFeature(format!(
                "incompatible feature flags {unknown:#x}"
            )));
        }

        let block_size = 1024usize << sb.log_block_size;
        let inode_size = match (sb.rev_level, sb.inode_size) {
            (GOOD_OLD_REV, _) | (_, 0) => INODE_SIZE,
            (_, size) => usize::from(size),
        };
        if inode_size < INODE_SIZE || !inode_size.is_power_of_two() || inode_size > block_size {
            return Err(Ext2Error::CorruptImage(format!("inode size {inode_size}")));
        }
        if sb.inodes_per_group == 0 {
            return Err(Ext2Error::CorruptImage("zero inodes per group".to_string()));
        }

        let gd_offset = (u64::from(sb.first_data_block) + 1) * block_size as u64;
        let gd_raw = slice(image, gd_offset, GROUP_DESC_SIZE as u64)?;
        let gd = GroupDescriptor::parse(gd_raw, gd_offset)?;

        debug!(
            "ext2: {} blocks of {} bytes, {} inodes of {} bytes, inode table at block {}",
            sb.blocks_count, block_size, sb.inodes_count, inode_size, gd.inode_table
        );
        Ok(Reader {
            image,
            sb,
            gd,
            block_size,
            inode_size,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn group_descriptor(&self) -> &GroupDescriptor {
        &self.gd
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn block(&self, blk: u32) -> Result<&'a [u8], Ext2Error> {
        let bs = self.block_size as u64;
        slice(self.image, u64::from(blk) * bs, bs)
    }

    /// Read inode `ino` (1-based).
    pub fn inode(&self, ino: u32) -> Result<Inode, Ext2Error> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(Ext2Error::InodeOutOfRange {
                ino,
                count: self.sb.inodes_count,
            });
        }
        if ino > self.sb.inodes_per_group {
            return Err(Ext2Error::UnsupportedFeature(format!(
                "inode {ino} lives outside the first block group"
            )));
        }
        let offset = u64::from(self.gd.inode_table) * self.block_size as u64
            + u64::from(ino - 1) * self.inode_size as u64;
        let raw = slice(self.image, offset, INODE_SIZE as u64)?;
        Inode::parse(raw, offset)
    }

    /// Data block numbers of an inode, in file order.
    ///
    /// Stops at the first zero pointer and never returns more blocks than
    /// the inode's size needs.
    fn data_blocks(&self, inode: &Inode) -> Result<Vec<u32>, Ext2Error> {
        let needed = (inode.size as usize).div_ceil(self.block_size);
        let mut blocks = Vec::with_capacity(needed.min(self.image.len() / self.block_size));

        // (block, depth): depth 0 is a data block, 1..=3 are pointer blocks
        let mut work: Vec<(u32, u8)> = Vec::new();
        for (slot, &ptr) in inode.block.iter().enumerate().rev() {
            let depth = match slot {
                s if s < N_DIRECT => 0,
                s => (s - N_DIRECT + 1) as u8,
            };
            work.push((ptr, depth));
        }
        debug_assert_eq!(work.len(), N_BLOCKS);

        while let Some((blk, depth)) = work.pop() {
            if blocks.len() >= needed || blk == 0 {
                break;
            }
            let contents = self.block(blk)?;
            if depth == 0 {
                blocks.push(blk);
                continue;
            }
            for ptr in contents.chunks_exact(4).rev() {
                let ptr = u32::from_le_bytes([ptr[0], ptr[1], ptr[2], ptr[3]]);
                work.push((ptr, depth - 1));
            }
        }
        Ok(blocks)
    }

    /// Full contents of an inode. Blocks missing from a short chain read
    /// as zeros.
    ///
    /// The declared size is checked against the image buffer itself, not
    /// the superblock's block count, which comes from the same untrusted
    /// bytes.
    pub fn read_data(&self, inode: &Inode) -> Result<Vec<u8>, Ext2Error> {
        let size = u64::from(inode.size);
        if size > self.image.len() as u64 {
            return Err(Ext2Error::CorruptImage(format!(
                "inode size {size} exceeds the {}-byte image",
                self.image.len()
            )));
        }

        let mut data = vec![0u8; size as usize];
        let blocks = self.data_blocks(inode)?;
        for (chunk, blk) in data.chunks_mut(self.block_size).zip(blocks) {
            let src = self.block(blk)?;
            chunk.copy_from_slice(&src[..chunk.len()]);
        }
        Ok(data)
    }

    /// Live entries of a directory inode, `.` and `..` included.
    pub fn read_dir(&self, inode: &Inode) -> Result<Vec<DirEntry>, Ext2Error> {
        let data = self.read_data(inode)?;
        dirent::parse(&data, self.block_size)
    }

    /// Walk the directory hierarchy from the root inode.
    pub fn read_tree(&self) -> Result<Tree, Ext2Error> {
        let root = self.inode(ROOT_INO)?;
        if root.file_type() != S_IFDIR {
            return Err(Ext2Error::CorruptImage("root inode is not a directory".to_string()));
        }
        let mut tree = Tree::with_root(
            Node::directory(root.permissions())
                .owned_by(root.uid, root.gid)
                .modified_at(root.mtime),
        );

        let mut visited: HashSet<u32> = HashSet::from([ROOT_INO]);
        let mut stack: Vec<(String, Inode)> = vec![("/".to_string(), root)];

        while let Some((dir, dir_inode)) = stack.pop() {
            for entry in self.read_dir(&dir_inode)? {
                if entry.name == b"." || entry.name == b".." {
                    continue;
                }
                if entry.name.is_empty() || entry.name.contains(&b'/') || entry.name.contains(&0) {
                    return Err(Ext2Error::CorruptImage(format!(
                        "invalid entry name {:?} in {dir}",
                        String::from_utf8_lossy(&entry.name)
                    )));
                }
                let name = String::from_utf8_lossy(&entry.name);
                let path = vfs::join(&dir, &name);
                let inode = self.inode(entry.ino)?;

                let node = match inode.file_type() {
                    S_IFDIR => {
                        if !visited.insert(entry.ino) {
                            debug!("ext2: {path} revisits directory inode {}, skipping", entry.ino);
                            continue;
                        }
                        let node = Node::directory(inode.permissions());
                        stack.push((path.clone(), inode.clone()));
                        node
                    }
                    S_IFREG => Node::file(self.read_data(&inode)?, inode.permissions()),
                    S_IFLNK => {
                        let target = self.read_symlink(&inode)?;
                        let mut node = Node::symlink(String::from_utf8_lossy(&target));
                        node.mode = inode.permissions();
                        node
                    }
                    S_IFCHR => {
                        let (major, minor) = decode_device(&inode.block);
                        Node::char_device(major, minor, inode.permissions())
                    }
                    S_IFBLK => {
                        let (major, minor) = decode_device(&inode.block);
                        Node::block_device(major, minor, inode.permissions())
                    }
                    S_IFIFO => Node::fifo(inode.permissions()),
                    other => {
                        warn!("ext2: skipping {path}: unsupported file type {other:#o}");
                        continue;
                    }
                };

                let node = node.owned_by(inode.uid, inode.gid).modified_at(inode.mtime);
                tree.insert(&path, node)
                    .map_err(|e| Ext2Error::CorruptImage(format!("{path}: {e}")))?;
            }
        }

        debug!("ext2: decoded {} nodes", tree.len());
        Ok(tree)
    }

    /// Fast symlinks keep the target in `i_block` and own no sectors.
    fn read_symlink(&self, inode: &Inode) -> Result<Vec<u8>, Ext2Error> {
        if inode.size as usize <= INLINE_SYMLINK_MAX && inode.sectors == 0 {
            Ok(unpack_inline_symlink(&inode.block, inode.size as usize))
        } else {
            self.read_data(inode)
        }
    }
}

fn slice(image: &[u8], offset: u64, len: u64) -> Result<&[u8], Ext2Error> {
    let end = offset.checked_add(len).filter(|&end| end <= image.len() as u64);
    match end {
        Some(end) => Ok(&image[offset as usize..end as usize]),
        None => Err(Ext2Error::TruncatedImage {
            offset,
            len,
            actual: image.len(),
        }),
    }
}
