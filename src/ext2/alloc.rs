//! Writer planning: inode numbering, block counts, indirect-block topology
//! and a deterministic linear block allocation for a single block group.
//!
//! Layout (1 KiB blocks; larger block sizes drop the boot block and shift
//! everything down by one):
//!   Block 0: Boot record
//!   Block 1: Superblock
//!   Block 2: Block group descriptor table
//!   Block 3: Data block bitmap
//!   Block 4: Inode bitmap
//!   Blocks 5..5+N: Inode table
//!   Blocks 5+N..: Directory payloads, file data and pointer blocks
use std::collections::BTreeMap;

use log::debug;

use super::adapters::INLINE_SYMLINK_MAX;
use super::dirent::{self, MAX_NAME_LEN};
use super::error::Ext2Error;
use super::layout::{FIRST_FREE_INO, INODE_SIZE, N_DIRECT, ROOT_INO};
use crate::vfs::{self, Node, NodeKind, Tree};

/// Where the fixed metadata lives and how big the image is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub block_size: u32,
    /// 1 for 1 KiB blocks (block 0 is the boot record), else 0.
    pub first_data_block: u32,
    pub group_desc_block: u32,
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub inode_table_blocks: u32,
    pub first_free_block: u32,
    pub total_blocks: u32,
    pub inodes_count: u32,
    /// Highest inode number handed out.
    pub last_ino: u32,
}

/// How many pointer blocks each indirection level needs for a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndirectShape {
    pub single: bool,
    /// Level-1 blocks under the double-indirect root (0 = no double root).
    pub double_l1: u64,
    pub triple_l2: u64,
    /// Level-1 blocks under the triple-indirect tree (0 = no triple root).
    pub triple_l1: u64,
}

impl IndirectShape {
    /// Shape for `data_blocks` data blocks, or `None` past triple-indirect
    /// capacity.
    pub fn for_blocks(data_blocks: u64, block_size: u32) -> Option<Self> {
        let ppb = u64::from(block_size / 4);
        let mut shape = IndirectShape::default();
        if data_blocks <= N_DIRECT as u64 {
            return Some(shape);
        }

        let mut rem = data_blocks - N_DIRECT as u64;
        shape.single = true;
        rem -= rem.min(ppb);

        if rem > 0 {
            let used = rem.min(ppb * ppb);
            shape.double_l1 = used.div_ceil(ppb);
            rem -= used;
        }

        if rem > 0 {
            let used = rem.min(ppb * ppb * ppb);
            shape.triple_l2 = used.div_ceil(ppb * ppb);
            shape.triple_l1 = used.div_ceil(ppb);
            rem -= used;
        }

        (rem == 0).then_some(shape)
    }

    /// Total pointer (meta) blocks, roots included.
    pub fn pointer_blocks(&self) -> u64 {
        let mut meta = u64::from(self.single);
        if self.double_l1 > 0 {
            meta += 1 + self.double_l1;
        }
        if self.triple_l1 > 0 {
            meta += 1 + self.triple_l2 + self.triple_l1;
        }
        meta
    }
}

/// Block numbers of a node's pointer blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndirectBlocks {
    pub single: Option<u32>,
    pub double: Option<u32>,
    pub double_l1: Vec<u32>,
    pub triple: Option<u32>,
    pub triple_l2: Vec<u32>,
    pub triple_l1: Vec<u32>,
}

impl IndirectBlocks {
    pub fn count(&self) -> usize {
        usize::from(self.single.is_some())
            + usize::from(self.double.is_some())
            + self.double_l1.len()
            + usize::from(self.triple.is_some())
            + self.triple_l2.len()
            + self.triple_l1.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub data: Vec<u32>,
    pub indirect: IndirectBlocks,
}

impl Allocation {
    /// Data plus pointer blocks, i.e. what `i_blocks` accounts for.
    pub fn total_blocks(&self) -> usize {
        self.data.len() + self.indirect.count()
    }
}

#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub layout: Layout,
    /// Path → inode number, root included.
    pub inodes: BTreeMap<String, u32>,
    /// Inode number → its blocks.
    pub allocations: BTreeMap<u32, Allocation>,
}

impl AllocationPlan {
    pub fn ino(&self, path: &str) -> Option<u32> {
        self.inodes.get(path).copied()
    }
}

/// Size in bytes of a directory's packed entry payload.
pub fn directory_payload_len(tree: &Tree, path: &str, block_size: u32) -> Result<u64, Ext2Error> {
    let children = tree.children(path);
    let mut name_lens = vec![1, 2]; // "." and ".."
    for (child, _) in &children {
        let name = vfs::file_name(child);
        if name.len() > MAX_NAME_LEN {
            return Err(Ext2Error::NameTooLong {
                path: child.to_string(),
            });
        }
        name_lens.push(name.len());
    }
    Ok(dirent::packed_len(name_lens, block_size as usize) as u64)
}

/// Payload bytes a node stores in data blocks.
fn payload_bytes(tree: &Tree, path: &str, node: &Node, block_size: u32) -> Result<u64, Ext2Error> {
    let bytes = match &node.kind {
        NodeKind::Directory => directory_payload_len(tree, path, block_size)?,
        NodeKind::File(data) => data.len() as u64,
        NodeKind::Symlink(target) if target.len() > INLINE_SYMLINK_MAX => target.len() as u64,
        // Inline symlinks, devices and fifos live entirely in the inode
        _ => 0,
    };
    if bytes > u64::from(u32::MAX) {
        return Err(Ext2Error::SizeOverflow {
            path: path.to_string(),
            size: bytes,
        });
    }
    Ok(bytes)
}

fn take_blocks(cursor: &mut u32, n: u64) -> Vec<u32> {
    let start = *cursor;
    *cursor += n as u32;
    (start..*cursor).collect()
}

fn take_block(cursor: &mut u32) -> u32 {
    let blk = *cursor;
    *cursor += 1;
    blk
}

fn allocate_indirect(shape: &IndirectShape, cursor: &mut u32) -> IndirectBlocks {
    let mut blocks = IndirectBlocks::default();
    if shape.single {
        blocks.single = Some(take_block(cursor));
    }
    if shape.double_l1 > 0 {
        blocks.double = Some(take_block(cursor));
        blocks.double_l1 = take_blocks(cursor, shape.double_l1);
    }
    if shape.triple_l1 > 0 {
        blocks.triple = Some(take_block(cursor));
        blocks.triple_l2 = take_blocks(cursor, shape.triple_l2);
        blocks.triple_l1 = take_blocks(cursor, shape.triple_l1);
    }
    blocks
}

/// Plan inode numbers and block placement for `tree`.
///
/// Inodes are numbered from 3: directories first, then everything else,
/// each in path order. Blocks are handed out linearly after the inode
/// table in inode order, so the root directory's payload comes first.
pub fn plan(tree: &Tree, block_size: u32) -> Result<AllocationPlan, Ext2Error> {
    let bs = u64::from(block_size);
    let group_limit = 8 * bs; // one bitmap block

    // Inode numbering: root, directories, then others
    let mut inodes: BTreeMap<String, u32> = BTreeMap::new();
    let mut order: Vec<(u32, &str, &Node)> = Vec::with_capacity(tree.len());
    inodes.insert("/".to_string(), ROOT_INO);
    order.push((ROOT_INO, "/", tree.root()));
    let mut next_ino = ROOT_INO + 1;
    let dirs = tree.iter().filter(|(p, n)| *p != "/" && n.is_dir());
    let others = tree.iter().filter(|(_, n)| !n.is_dir());
    for (path, node) in dirs.chain(others) {
        inodes.insert(path.to_string(), next_ino);
        order.push((next_ino, path, node));
        next_ino += 1;
    }
    let last_ino = next_ino - 1;
    // e2fsck wants whole, byte-aligned inode table blocks
    let inodes_per_block = block_size / INODE_SIZE as u32;
    let inodes_count = last_ino.max(FIRST_FREE_INO).next_multiple_of(inodes_per_block);
    if u64::from(inodes_count) > group_limit {
        return Err(Ext2Error::TooManyInodes {
            needed: u64::from(inodes_count),
            limit: group_limit,
        });
    }

    // Fixed metadata
    let first_data_block: u32 = if block_size == 1024 { 1 } else { 0 };
    let group_desc_block = first_data_block + 1;
    let block_bitmap = group_desc_block + 1;
    let inode_bitmap = block_bitmap + 1;
    let inode_table = inode_bitmap + 1;
    let inode_table_blocks = (u64::from(inodes_count) * INODE_SIZE as u64).div_ceil(bs) as u32;
    let first_free_block = inode_table + inode_table_blocks;

    // First pass: figure out how many blocks we need (data + indirect)
    let mut shapes: Vec<(u32, u64, IndirectShape)> = Vec::with_capacity(order.len());
    let mut total = u64::from(first_free_block);
    for &(ino, path, node) in &order {
        let data_blocks = payload_bytes(tree, path, node, block_size)?.div_ceil(bs);
        let shape = IndirectShape::for_blocks(data_blocks, block_size).ok_or_else(|| {
            Ext2Error::FileTooLarge {
                path: path.to_string(),
                blocks: data_blocks,
            }
        })?;
        total += data_blocks + shape.pointer_blocks();
        shapes.push((ino, data_blocks, shape));
    }

    if total > group_limit {
        return Err(Ext2Error::TooManyBlocks {
            needed: total,
            limit: group_limit,
        });
    }

    // Second pass: hand out blocks, each node's data followed by its pointers
    let mut cursor = first_free_block;
    let mut allocations = BTreeMap::new();
    for (ino, data_blocks, shape) in shapes {
        let data = take_blocks(&mut cursor, data_blocks);
        let indirect = allocate_indirect(&shape, &mut cursor);
        allocations.insert(ino, Allocation { data, indirect });
    }
    debug_assert_eq!(u64::from(cursor), total);

    let layout = Layout {
        block_size,
        first_data_block,
        group_desc_block,
        block_bitmap,
        inode_bitmap,
        inode_table,
        inode_table_blocks,
        first_free_block,
        total_blocks: cursor,
        inodes_count,
        last_ino,
    };
    debug!(
        "ext2 plan: {} inodes ({} used), {} blocks of {} bytes, data from block {}",
        inodes_count, last_ino, cursor, block_size, first_free_block
    );

    Ok(AllocationPlan {
        layout,
        inodes,
        allocations,
    })
}
