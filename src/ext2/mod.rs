//! Native ext2 codec.
//!
//! `load` decodes an image into a [`Tree`](crate::vfs::Tree) and `store`
//! synthesizes a single-block-group image from one. Neither needs
//! `mke2fs`, `debugfs` or a mount.
pub mod adapters;
pub mod alloc;
pub mod dirent;
pub mod error;
pub mod layout;
pub mod reader;
pub mod writer;

pub use reader::{load, Reader};
pub use writer::store;

/// Block sizes the writer produces and the reader accepts.
pub const SUPPORTED_BLOCK_SIZES: [u32; 3] = [1024, 2048, 4096];

pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Cheap check for the superblock magic, without validating anything else.
pub fn is_ext2(image: &[u8]) -> bool {
    let off = layout::SUPERBLOCK_OFFSET + 56;
    image.len() >= off + 2 && layout::read_le16(image, off) == layout::EXT2_SUPER_MAGIC
}
