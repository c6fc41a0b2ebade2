//! Synthesizes a complete single-group ext2 image from a tree.
//!
//! The allocator decides every inode number and block position up front;
//! this module only serializes: superblock, group descriptor, bitmaps, the
//! inode table, pointer blocks, directory payloads and file data.
use std::borrow::Cow;

use log::debug;

use super::adapters::{encode_device, pack_inline_symlink, INLINE_SYMLINK_MAX};
use super::alloc::{self, Allocation, AllocationPlan, IndirectBlocks};
use super::dirent::{self, DirEntry, EXT2_FT_DIR};
use super::error::Ext2Error;
use super::layout::{
    write_le32, GroupDescriptor, Inode, Superblock, DYNAMIC_REV, EXT2_SUPER_MAGIC,
    FEATURE_INCOMPAT_FILETYPE, FIRST_FREE_INO, GROUP_DESC_SIZE, INODE_SIZE, N_BLOCKS, N_DIRECT,
    ROOT_INO, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};
use super::SUPPORTED_BLOCK_SIZES;
use crate::vfs::{self, Node, NodeKind, Tree};

const VOLUME_NAME: &[u8] = b"fsimg";
// s_state
const EXT2_VALID_FS: u16 = 1;

/// Serialize `tree` into an ext2 image with the given block size.
pub fn store(tree: &Tree, block_size: u32) -> Result<Vec<u8>, Ext2Error> {
    if !SUPPORTED_BLOCK_SIZES.contains(&block_size) {
        return Err(Ext2Error::UnsupportedBlockSize(format!(
            "{block_size} (expected 1024, 2048 or 4096)"
        )));
    }
    let plan = alloc::plan(tree, block_size)?;
    let writer = Ext2Writer {
        tree,
        plan: &plan,
        bs: block_size as usize,
    };
    writer.build()
}

struct Ext2Writer<'a> {
    tree: &'a Tree,
    plan: &'a AllocationPlan,
    bs: usize,
}

impl Ext2Writer<'_> {
    fn build(&self) -> Result<Vec<u8>, Ext2Error> {
        let layout = &self.plan.layout;
        let mut image = vec![0u8; layout.total_blocks as usize * self.bs];

        self.write_superblock(&mut image);
        self.write_bgdt(&mut image);
        self.write_block_bitmap(&mut image);
        self.write_inode_bitmap(&mut image);

        for (path, node) in self.tree.iter() {
            let alloc = self.allocation(self.ino(path)?)?;
            let payload = self.payload(path, node)?;

            self.write_inode(&mut image, path, node, alloc, payload.len())?;
            self.write_data(&mut image, &payload, &alloc.data);
            self.write_pointer_blocks(&mut image, alloc);
        }

        debug!(
            "ext2: wrote {} inodes into {} bytes",
            self.plan.inodes.len(),
            image.len()
        );
        Ok(image)
    }

    fn ino(&self, path: &str) -> Result<u32, Ext2Error> {
        self.plan
            .ino(path)
            .ok_or_else(|| Ext2Error::CorruptImage(format!("{path} has no inode in the plan")))
    }

    fn allocation(&self, ino: u32) -> Result<&Allocation, Ext2Error> {
        self.plan
            .allocations
            .get(&ino)
            .ok_or_else(|| Ext2Error::CorruptImage(format!("inode {ino} has no allocation")))
    }

    fn write_superblock(&self, image: &mut [u8]) {
        let layout = &self.plan.layout;
        let mut volume_name = [0u8; 16];
        volume_name[..VOLUME_NAME.len()].copy_from_slice(VOLUME_NAME);
        let root_mtime = self.tree.root().mtime;

        let sb = Superblock {
            inodes_count: layout.inodes_count,
            blocks_count: layout.total_blocks,
            // Images are sized exactly, nothing is left over
            free_blocks_count: 0,
            free_inodes_count: layout.inodes_count - layout.last_ino,
            first_data_block: layout.first_data_block,
            log_block_size: self.bs.trailing_zeros() - 10,
            // One group spanning the whole image
            blocks_per_group: layout.total_blocks,
            inodes_per_group: layout.inodes_count,
            mtime: root_mtime,
            wtime: root_mtime,
            magic: EXT2_SUPER_MAGIC,
            state: EXT2_VALID_FS,
            rev_level: DYNAMIC_REV,
            first_ino: FIRST_FREE_INO,
            inode_size: INODE_SIZE as u16,
            feature_compat: 0,
            feature_incompat: FEATURE_INCOMPAT_FILETYPE,
            feature_ro_compat: 0,
            volume_name,
        };
        sb.write(&mut image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE]);
    }

    fn write_bgdt(&self, image: &mut [u8]) {
        let layout = &self.plan.layout;
        let dir_count = self.tree.iter().filter(|(_, n)| n.is_dir()).count();
        let gd = GroupDescriptor {
            block_bitmap: layout.block_bitmap,
            inode_bitmap: layout.inode_bitmap,
            inode_table: layout.inode_table,
            free_blocks_count: 0,
            free_inodes_count: (layout.inodes_count - layout.last_ino) as u16,
            used_dirs_count: dir_count as u16,
        };
        let offset = layout.group_desc_block as usize * self.bs;
        gd.write(&mut image[offset..offset + GROUP_DESC_SIZE]);
    }

    fn bitmap<'i>(&self, image: &'i mut [u8], block: u32) -> &'i mut [u8] {
        let offset = block as usize * self.bs;
        &mut image[offset..offset + self.bs]
    }

    fn write_block_bitmap(&self, image: &mut [u8]) {
        // Every block of the group is in use and the bits past its end are
        // padding, so the whole bitmap block is set.
        self.bitmap(image, self.plan.layout.block_bitmap).fill(0xff);
    }

    fn write_inode_bitmap(&self, image: &mut [u8]) {
        let layout = &self.plan.layout;
        let bitmap = self.bitmap(image, layout.inode_bitmap);

        // Bad-blocks inode, root and every inode the plan handed out
        for i in 0..layout.last_ino as usize {
            bitmap[i / 8] |= 1 << (i % 8);
        }

        // Mark inodes beyond the inode count as used (padding)
        let bits_in_bitmap = self.bs * 8;
        for i in layout.inodes_count as usize..bits_in_bitmap {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }

    /// Bytes a node keeps in its data blocks.
    fn payload<'n>(&self, path: &str, node: &'n Node) -> Result<Cow<'n, [u8]>, Ext2Error> {
        Ok(match &node.kind {
            NodeKind::Directory => Cow::Owned(self.directory_payload(path)?),
            NodeKind::File(data) => Cow::Borrowed(data.as_slice()),
            NodeKind::Symlink(target) if target.len() > INLINE_SYMLINK_MAX => {
                Cow::Borrowed(target.as_bytes())
            }
            _ => Cow::Borrowed(&[]),
        })
    }

    fn directory_payload(&self, path: &str) -> Result<Vec<u8>, Ext2Error> {
        let ino = self.ino(path)?;
        let parent_ino = match vfs::parent(path) {
            Some(parent) => self.ino(parent)?,
            None => ROOT_INO,
        };

        let mut entries = vec![
            DirEntry::new(ino, ".", EXT2_FT_DIR),
            DirEntry::new(parent_ino, "..", EXT2_FT_DIR),
        ];
        for (child, node) in self.tree.children(path) {
            let name = vfs::file_name(child);
            entries.push(DirEntry::new(self.ino(child)?, name, dirent::file_type_of(node)));
        }
        Ok(dirent::pack(&entries, self.bs))
    }

    fn write_inode(
        &self,
        image: &mut [u8],
        path: &str,
        node: &Node,
        alloc: &Allocation,
        payload_len: usize,
    ) -> Result<(), Ext2Error> {
        let ino = self.ino(path)?;
        let mut block = [0u32; N_BLOCKS];
        let size = match &node.kind {
            NodeKind::Symlink(target) if target.len() <= INLINE_SYMLINK_MAX => {
                block = pack_inline_symlink(target.as_bytes());
                target.len()
            }
            NodeKind::CharDevice { major, minor } | NodeKind::BlockDevice { major, minor } => {
                encode_device(*major, *minor, &mut block);
                0
            }
            _ => {
                fill_block_pointers(&mut block, &alloc.data, &alloc.indirect);
                payload_len
            }
        };
        let size = u32::try_from(size).map_err(|_| Ext2Error::SizeOverflow {
            path: path.to_string(),
            size: size as u64,
        })?;

        // Entry in the parent, ".", and one ".." per subdirectory
        let links_count = if node.is_dir() {
            let subdirs = self.tree.children(path).iter().filter(|(_, n)| n.is_dir()).count();
            2 + subdirs as u16
        } else {
            1
        };

        let inode = Inode {
            mode: node.st_mode() as u16,
            uid: node.uid,
            size,
            atime: node.mtime,
            ctime: node.mtime,
            mtime: node.mtime,
            gid: node.gid,
            links_count,
            sectors: (alloc.total_blocks() * (self.bs / 512)) as u32,
            flags: 0,
            block,
        };

        let table = self.plan.layout.inode_table as usize * self.bs;
        let offset = table + (ino as usize - 1) * INODE_SIZE;
        inode.write(&mut image[offset..offset + INODE_SIZE]);
        Ok(())
    }

    fn write_data(&self, image: &mut [u8], payload: &[u8], blocks: &[u32]) {
        for (chunk, &blk) in payload.chunks(self.bs).zip(blocks) {
            let offset = blk as usize * self.bs;
            image[offset..offset + chunk.len()].copy_from_slice(chunk);
        }
    }

    fn write_pointers(&self, image: &mut [u8], blk: u32, ptrs: &[u32]) {
        let offset = blk as usize * self.bs;
        for (i, &ptr) in ptrs.iter().enumerate() {
            write_le32(image, offset + i * 4, ptr);
        }
    }

    /// Fill single, double and triple indirect blocks with the pointers the
    /// plan reserved for them.
    ///
    /// A triple indirect root only appears past `12 + ppb + ppb^2` data
    /// blocks, more than one group of `8 * bs` blocks holds, so images from
    /// [`store`] never reach that branch. It still handles any shape
    /// [`alloc::IndirectShape`] describes.
    fn write_pointer_blocks(&self, image: &mut [u8], alloc: &Allocation) {
        let ppb = self.bs / 4;
        let ind = &alloc.indirect;
        let Some(single) = ind.single else {
            return;
        };

        let rest = &alloc.data[N_DIRECT..];
        let (single_data, rest) = rest.split_at(rest.len().min(ppb));
        self.write_pointers(image, single, single_data);

        let (double_data, triple_data) = rest.split_at(rest.len().min(ppb * ppb));
        if let Some(double) = ind.double {
            self.write_pointers(image, double, &ind.double_l1);
            for (&l1, chunk) in ind.double_l1.iter().zip(double_data.chunks(ppb)) {
                self.write_pointers(image, l1, chunk);
            }
        }

        if let Some(triple) = ind.triple {
            self.write_pointers(image, triple, &ind.triple_l2);
            for (&l2, l1s) in ind.triple_l2.iter().zip(ind.triple_l1.chunks(ppb)) {
                self.write_pointers(image, l2, l1s);
            }
            for (&l1, chunk) in ind.triple_l1.iter().zip(triple_data.chunks(ppb)) {
                self.write_pointers(image, l1, chunk);
            }
        }
    }
}

/// Slots 0-11 point at data, 12/13/14 at the indirect roots.
fn fill_block_pointers(block: &mut [u32; N_BLOCKS], data: &[u32], indirect: &IndirectBlocks) {
    for (slot, &blk) in block.iter_mut().zip(data.iter().take(N_DIRECT)) {
        *slot = blk;
    }
    block[12] = indirect.single.unwrap_or(0);
    block[13] = indirect.double.unwrap_or(0);
    block[14] = indirect.triple.unwrap_or(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext2::layout::{read_le16, read_le32, GOOD_OLD_REV};

    fn superblock(image: &[u8]) -> Superblock {
        Superblock::parse(&image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE]).unwrap()
    }

    fn inode(image: &[u8], bs: usize, ino: u32) -> Inode {
        let sb = superblock(image);
        let gd_off = (sb.first_data_block as usize + 1) * bs;
        let gd_raw = &image[gd_off..gd_off + GROUP_DESC_SIZE];
        let gd = GroupDescriptor::parse(gd_raw, gd_off as u64).unwrap();
        let off = gd.inode_table as usize * bs + (ino as usize - 1) * INODE_SIZE;
        Inode::parse(&image[off..off + INODE_SIZE], off as u64).unwrap()
    }

    #[test]
    fn test_superblock_invariants() {
        let mut tree = Tree::new();
        tree.insert("/", Node::directory(0o755).modified_at(1_700_000_000)).unwrap();
        tree.put_file("/etc/hostname", b"fsimg\n".to_vec(), 0o644, 0, 0, 5).unwrap();

        for (bs, inodes) in SUPPORTED_BLOCK_SIZES.into_iter().zip([16, 16, 32]) {
            let image = store(&tree, bs).unwrap();
            let sb = superblock(&image);
            assert_eq!(sb.magic, EXT2_SUPER_MAGIC);
            assert_eq!(1024u32 << sb.log_block_size, bs);
            assert_eq!(sb.first_data_block, u32::from(bs == 1024));
            assert_eq!(image.len(), sb.blocks_count as usize * bs as usize);
            assert_eq!(sb.blocks_per_group, sb.blocks_count);
            assert_eq!(read_le32(&image, SUPERBLOCK_OFFSET + 36), sb.blocks_count);
            assert_eq!(sb.inodes_per_group, sb.inodes_count);
            assert_eq!(sb.inodes_count, inodes);
            // Whole inode table blocks
            assert_eq!(sb.inodes_count % (bs / INODE_SIZE as u32), 0);
            assert!(sb.inodes_count >= FIRST_FREE_INO);
            assert_eq!(sb.free_blocks_count, 0);
            // Root, /etc and /etc/hostname are 2, 3 and 4
            assert_eq!(sb.free_inodes_count, inodes - 4);
            assert_eq!(sb.rev_level, DYNAMIC_REV);
            assert_ne!(sb.rev_level, GOOD_OLD_REV);
            assert_eq!(sb.inode_size, 128);
            assert_eq!(sb.feature_incompat, FEATURE_INCOMPAT_FILETYPE);
            assert_eq!(sb.volume_label(), "fsimg");
            assert_eq!(sb.wtime, 1_700_000_000);
        }
    }

    #[test]
    fn test_bitmaps_are_full_and_padded() {
        let mut tree = Tree::new();
        tree.put_file("/a", b"a".to_vec(), 0o644, 0, 0, 0).unwrap();
        let image = store(&tree, 1024).unwrap();

        // Block bitmap at block 3: every bit set
        assert!(image[3 * 1024..4 * 1024].iter().all(|&b| b == 0xff));

        // Inode bitmap at block 4: inodes 1..=3 used, 4..=16 free, bits from 16 on are padding
        let bitmap = &image[4 * 1024..5 * 1024];
        assert_eq!(bitmap[0], 0b0000_0111);
        assert_eq!(bitmap[1], 0);
        assert!(bitmap[2..].iter().all(|&b| b == 0xff));

        // An empty tree at 1 KiB is eight blocks in one eight-block group
        let sb = superblock(&store(&Tree::new(), 1024).unwrap());
        assert_eq!((sb.blocks_count, sb.blocks_per_group), (8, 8));
    }

    #[test]
    fn test_hello_file_inode() {
        let mut tree = Tree::new();
        tree.put_file("/hello.txt", b"hello, world\n".to_vec(), 0o644, 1000, 1000, 42).unwrap();
        let image = store(&tree, 1024).unwrap();

        let hello = inode(&image, 1024, 3);
        assert_eq!(hello.mode, 0o100644);
        assert_eq!(hello.size, 13);
        assert_eq!((hello.uid, hello.gid, hello.mtime), (1000, 1000, 42));
        assert_eq!(hello.links_count, 1);
        assert_eq!(hello.sectors, 2);
        let blk = hello.block[0] as usize;
        assert_eq!(&image[blk * 1024..blk * 1024 + 13], b"hello, world\n");
        assert!(hello.block[1..].iter().all(|&b| b == 0));

        let root = inode(&image, 1024, ROOT_INO);
        assert_eq!(root.mode, 0o040755);
        assert_eq!(root.links_count, 2);
        assert_eq!(root.size, 1024);
    }

    #[test]
    fn test_device_and_symlink_inodes() {
        let mut tree = Tree::new();
        tree.insert("/dev/null", Node::char_device(1, 3, 0o666)).unwrap();
        tree.insert("/dev/sda", Node::block_device(8, 0, 0o660)).unwrap();
        tree.insert("/short", Node::symlink("a".repeat(60))).unwrap();
        tree.insert("/long", Node::symlink("b".repeat(61))).unwrap();
        let plan = alloc::plan(&tree, 1024).unwrap();
        let image = store(&tree, 1024).unwrap();

        let null = inode(&image, 1024, plan.ino("/dev/null").unwrap());
        assert_eq!(null.mode, 0o020666);
        assert_eq!(null.block[0], 0x0103);
        assert_eq!((null.size, null.sectors), (0, 0));

        let sda = inode(&image, 1024, plan.ino("/dev/sda").unwrap());
        assert_eq!(sda.file_type(), vfs::S_IFBLK);
        assert_eq!(sda.block[0], 0x0800);

        let short = inode(&image, 1024, plan.ino("/short").unwrap());
        assert_eq!((short.size, short.sectors), (60, 0));
        assert_eq!(short.block[14].to_le_bytes(), *b"aaaa");

        let long = inode(&image, 1024, plan.ino("/long").unwrap());
        assert_eq!((long.size, long.sectors), (61, 2));
        let blk = long.block[0] as usize;
        assert_eq!(&image[blk * 1024..blk * 1024 + 61], "b".repeat(61).as_bytes());
    }

    #[test]
    fn test_directory_links_and_entries() {
        let mut tree = Tree::new();
        tree.put_dir("/bin", 0o755, 0, 0, 0).unwrap();
        tree.put_dir("/usr/lib", 0o755, 0, 0, 0).unwrap();
        tree.put_file("/usr/README", b"x".to_vec(), 0o644, 0, 0, 0).unwrap();
        let image = store(&tree, 1024).unwrap();
        let plan = alloc::plan(&tree, 1024).unwrap();

        assert_eq!(inode(&image, 1024, ROOT_INO).links_count, 4);
        let usr = inode(&image, 1024, plan.ino("/usr").unwrap());
        assert_eq!(usr.links_count, 3);

        // "/usr" entries: ".", "..", "README", "lib"
        let blk = usr.block[0] as usize;
        let entries = dirent::parse(&image[blk * 1024..(blk + 1) * 1024], 1024).unwrap();
        let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, vec![&b"."[..], b"..", b"README", b"lib"]);
        assert_eq!(entries[1].ino, ROOT_INO);
        assert_eq!(entries[2].file_type, dirent::EXT2_FT_REG_FILE);
        assert_eq!(entries[3].ino, plan.ino("/usr/lib").unwrap());
    }

    #[test]
    fn test_double_indirect_pointers() {
        let ppb = 1024 / 4;
        let blocks = 12 + ppb + 1;
        let data: Vec<u8> = (0..blocks * 1024).map(|i| (i / 1024) as u8).collect();
        let mut tree = Tree::new();
        tree.put_file("/big", data, 0o644, 0, 0, 0).unwrap();
        let image = store(&tree, 1024).unwrap();

        let big = inode(&image, 1024, 3);
        assert_eq!(big.sectors as usize, (blocks + 3) * 2);
        let single = big.block[12] as usize;
        let double = big.block[13] as usize;
        assert_ne!(single, 0);
        assert_eq!(big.block[14], 0);

        let l1 = read_le32(&image, double * 1024) as usize;
        assert_eq!(read_le32(&image, double * 1024 + 4), 0);
        let last_data = read_le32(&image, l1 * 1024) as usize;
        assert_eq!(image[last_data * 1024], (blocks - 1) as u8);
        let first_single = read_le32(&image, single * 1024) as usize;
        assert_eq!(image[first_single * 1024], 12);
    }

    #[test]
    fn test_triple_indirect_pointer_blocks() {
        let tree = Tree::new();
        let plan = alloc::plan(&tree, 1024).unwrap();
        let writer = Ext2Writer { tree: &tree, plan: &plan, bs: 1024 };
        let ppb = 256;

        // Data block numbers are never dereferenced here, only recorded
        let first_triple = 12 + ppb + ppb * ppb;
        let data: Vec<u32> = (0..first_triple as u32 + 2).map(|i| 100_000 + i).collect();
        let alloc = Allocation {
            indirect: IndirectBlocks {
                single: Some(1),
                double: Some(2),
                double_l1: (3..3 + ppb as u32).collect(),
                triple: Some(259),
                triple_l2: vec![260],
                triple_l1: vec![261],
            },
            data,
        };
        let mut image = vec![0u8; 262 * 1024];
        writer.write_pointer_blocks(&mut image, &alloc);

        let ptr = |blk: usize, i: usize| read_le32(&image, blk * 1024 + i * 4);
        assert_eq!(ptr(1, 0), alloc.data[12]);
        assert_eq!(ptr(1, 255), alloc.data[12 + 255]);
        assert_eq!((ptr(2, 0), ptr(2, 255)), (3, 258));
        assert_eq!(ptr(3, 0), alloc.data[12 + ppb]);
        assert_eq!(ptr(258, 255), alloc.data[first_triple - 1]);
        assert_eq!((ptr(259, 0), ptr(259, 1)), (260, 0));
        assert_eq!((ptr(260, 0), ptr(260, 1)), (261, 0));
        assert_eq!(ptr(261, 0), alloc.data[first_triple]);
        assert_eq!(ptr(261, 1), alloc.data[first_triple + 1]);
        assert_eq!(ptr(261, 2), 0);
    }

    #[test]
    fn test_large_owner_ids() {
        let mut tree = Tree::new();
        tree.put_file("/f", b"".to_vec(), 0o600, 100_000, 70_000, 0).unwrap();
        let image = store(&tree, 4096).unwrap();
        let f = inode(&image, 4096, 3);
        assert_eq!((f.uid, f.gid), (100_000, 70_000));
        let off = 4 * 4096 + 2 * INODE_SIZE;
        assert_eq!(read_le16(&image, off + 120), (100_000u32 >> 16) as u16);
    }

    #[test]
    fn test_rejects_odd_block_sizes() {
        let tree = Tree::new();
        for bs in [512, 3000, 8192] {
            assert!(matches!(store(&tree, bs), Err(Ext2Error::UnsupportedBlockSize(_))));
        }
    }
}
