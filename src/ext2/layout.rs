//! Fixed-offset little-endian records: superblock, group descriptor, inode.
//!
//! Parsers take a slice that starts at the record and check its length;
//! serializers write into a caller-provided, zero-initialized slice.
use super::error::Ext2Error;

pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const GROUP_DESC_SIZE: usize = 32;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Default (and written) inode record size; also the bytes of any larger
/// record this codec interprets.
pub const INODE_SIZE: usize = 128;

// Inode numbers
pub const ROOT_INO: u32 = 2;

pub const GOOD_OLD_REV: u32 = 0;
pub const DYNAMIC_REV: u32 = 1;
pub const FIRST_FREE_INO: u32 = 11;

pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;

pub const N_BLOCKS: usize = 15;
pub const N_DIRECT: usize = 12;

/// Fields this codec reads or writes; the rest of the superblock stays zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub volume_name: [u8; 16],
}

impl Superblock {
    pub fn parse(sb: &[u8]) -> Result<Self, Ext2Error> {
        check_len(sb, SUPERBLOCK_SIZE, SUPERBLOCK_OFFSET as u64)?;
        let mut volume_name = [0u8; 16];
        volume_name.copy_from_slice(&sb[120..136]);
        Ok(Superblock {
            inodes_count: read_le32(sb, 0),
            blocks_count: read_le32(sb, 4),
            free_blocks_count: read_le32(sb, 12),
            free_inodes_count: read_le32(sb, 16),
            first_data_block: read_le32(sb, 20),
            log_block_size: read_le32(sb, 24),
            blocks_per_group: read_le32(sb, 32),
            inodes_per_group: read_le32(sb, 40),
            mtime: read_le32(sb, 44),
            wtime: read_le32(sb, 48),
            magic: read_le16(sb, 56),
            state: read_le16(sb, 58),
            rev_level: read_le32(sb, 76),
            first_ino: read_le32(sb, 84),
            inode_size: read_le16(sb, 88),
            feature_compat: read_le32(sb, 92),
            feature_incompat: read_le32(sb, 96),
            feature_ro_compat: read_le32(sb, 100),
            volume_name,
        })
    }

    pub fn write(&self, sb: &mut [u8]) {
        // s_inodes_count
        write_le32(sb, 0, self.inodes_count);
        // s_blocks_count
        write_le32(sb, 4, self.blocks_count);
        // s_r_blocks_count (reserved)
        write_le32(sb, 8, 0);
        // s_free_blocks_count
        write_le32(sb, 12, self.free_blocks_count);
        // s_free_inodes_count
        write_le32(sb, 16, self.free_inodes_count);
        // s_first_data_block
        write_le32(sb, 20, self.first_data_block);
        // s_log_block_size, s_log_frag_size
        write_le32(sb, 24, self.log_block_size);
        write_le32(sb, 28, self.log_block_size);
        // s_blocks_per_group, s_frags_per_group
        write_le32(sb, 32, self.blocks_per_group);
        write_le32(sb, 36, self.blocks_per_group);
        // s_inodes_per_group
        write_le32(sb, 40, self.inodes_per_group);
        // s_mtime, s_wtime
        write_le32(sb, 44, self.mtime);
        write_le32(sb, 48, self.wtime);
        // s_mnt_count
        write_le16(sb, 52, 0);
        // s_max_mnt_count
        write_le16(sb, 54, u16::MAX);
        write_le16(sb, 56, self.magic);
        write_le16(sb, 58, self.state);
        // s_errors (continue)
        write_le16(sb, 60, 1);
        // s_lastcheck
        write_le32(sb, 64, self.wtime);
        // s_creator_os (Linux)
        write_le32(sb, 72, 0);
        write_le32(sb, 76, self.rev_level);
        // == EXT2_DYNAMIC_REV fields ==
        write_le32(sb, 84, self.first_ino);
        write_le16(sb, 88, self.inode_size);
        // s_block_group_nr
        write_le16(sb, 90, 0);
        write_le32(sb, 92, self.feature_compat);
        write_le32(sb, 96, self.feature_incompat);
        write_le32(sb, 100, self.feature_ro_compat);
        sb[120..136].copy_from_slice(&self.volume_name);
    }

    /// Volume label up to the first NUL.
    pub fn volume_label(&self) -> String {
        let end = self.volume_name.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.volume_name[..end]).into_owned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDescriptor {
    pub fn parse(gd: &[u8], offset: u64) -> Result<Self, Ext2Error> {
        check_len(gd, GROUP_DESC_SIZE, offset)?;
        Ok(GroupDescriptor {
            block_bitmap: read_le32(gd, 0),
            inode_bitmap: read_le32(gd, 4),
            inode_table: read_le32(gd, 8),
            free_blocks_count: read_le16(gd, 12),
            free_inodes_count: read_le16(gd, 14),
            used_dirs_count: read_le16(gd, 16),
        })
    }

    pub fn write(&self, gd: &mut [u8]) {
        write_le32(gd, 0, self.block_bitmap);
        write_le32(gd, 4, self.inode_bitmap);
        write_le32(gd, 8, self.inode_table);
        write_le16(gd, 12, self.free_blocks_count);
        write_le16(gd, 14, self.free_inodes_count);
        write_le16(gd, 16, self.used_dirs_count);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inode {
    pub mode: u16,
    pub uid: u32,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub gid: u32,
    pub links_count: u16,
    /// Allocated space in 512-byte sectors.
    pub sectors: u32,
    pub flags: u32,
    /// Block pointers, or the target of an inline symlink.
    pub block: [u32; N_BLOCKS],
}

impl Inode {
    pub fn parse(raw: &[u8], offset: u64) -> Result<Self, Ext2Error> {
        check_len(raw, INODE_SIZE, offset)?;
        let mut block = [0u32; N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le32(raw, 40 + i * 4);
        }
        // Linux keeps the high 16 bits of uid/gid in osd2.
        let uid = u32::from(read_le16(raw, 2)) | (u32::from(read_le16(raw, 120)) << 16);
        let gid = u32::from(read_le16(raw, 24)) | (u32::from(read_le16(raw, 122)) << 16);
        Ok(Inode {
            mode: read_le16(raw, 0),
            uid,
            size: read_le32(raw, 4),
            atime: read_le32(raw, 8),
            ctime: read_le32(raw, 12),
            mtime: read_le32(raw, 16),
            gid,
            links_count: read_le16(raw, 26),
            sectors: read_le32(raw, 28),
            flags: read_le32(raw, 32),
            block,
        })
    }

    pub fn write(&self, raw: &mut [u8]) {
        // i_mode
        write_le16(raw, 0, self.mode);
        // i_uid (low)
        write_le16(raw, 2, self.uid as u16);
        // i_size
        write_le32(raw, 4, self.size);
        // i_atime, i_ctime, i_mtime, i_dtime
        write_le32(raw, 8, self.atime);
        write_le32(raw, 12, self.ctime);
        write_le32(raw, 16, self.mtime);
        write_le32(raw, 20, 0);
        // i_gid (low)
        write_le16(raw, 24, self.gid as u16);
        // i_links_count
        write_le16(raw, 26, self.links_count);
        // i_blocks (512-byte sectors)
        write_le32(raw, 28, self.sectors);
        // i_flags
        write_le32(raw, 32, self.flags);
        // i_block[0..15]
        for (i, &ptr) in self.block.iter().enumerate() {
            write_le32(raw, 40 + i * 4, ptr);
        }
        // l_i_uid_high, l_i_gid_high
        write_le16(raw, 120, (self.uid >> 16) as u16);
        write_le16(raw, 122, (self.gid >> 16) as u16);
    }

    pub fn file_type(&self) -> u32 {
        u32::from(self.mode) & crate::vfs::S_IFMT
    }

    pub fn permissions(&self) -> u16 {
        self.mode & crate::vfs::PERM_MASK
    }
}

fn check_len(buf: &[u8], needed: usize, offset: u64) -> Result<(), Ext2Error> {
    if buf.len() < needed {
        return Err(Ext2Error::TruncatedImage {
            offset,
            len: needed as u64,
            actual: buf.len(),
        });
    }
    Ok(())
}

pub fn read_le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub fn read_le32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

pub fn write_le16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn write_le32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
