use thiserror::Error;

/// Everything that can go wrong decoding or synthesizing an ext2 image.
///
/// All variants are fatal; the codec never repairs or guesses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Ext2Error {
    /// Superblock signature mismatch.
    #[error("bad superblock magic: expected {expected:#06x}, got {actual:#06x}")]
    BadMagic { expected: u16, actual: u16 },

    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(String),

    #[error("unsupported ext2 revision {0}")]
    UnsupportedRevision(u32),

    /// Incompatible feature bits, or a layout this codec does not read.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("corrupt image: {0}")]
    CorruptImage(String),

    /// A structure or pointer reaches past the end of the buffer.
    #[error("truncated image: need {len} bytes at offset {offset}, image is {actual} bytes")]
    TruncatedImage { offset: u64, len: u64, actual: usize },

    #[error("inode {ino} out of range (image has {count} inodes)")]
    InodeOutOfRange { ino: u32, count: u32 },

    /// The image would need a second block group.
    #[error("image needs {needed} blocks but a single block group holds at most {limit}")]
    TooManyBlocks { needed: u64, limit: u64 },

    #[error("tree needs {needed} inodes but a single block group holds at most {limit}")]
    TooManyInodes { needed: u64, limit: u64 },

    /// Beyond the triple-indirect capacity for the block size.
    #[error("{path}: {blocks} blocks exceed the triple-indirect limit")]
    FileTooLarge { path: String, blocks: u64 },

    #[error("{path}: size {size} does not fit a 32-bit size field")]
    SizeOverflow { path: String, size: u64 },

    #[error("{path}: name longer than 255 bytes")]
    NameTooLong { path: String },
}
