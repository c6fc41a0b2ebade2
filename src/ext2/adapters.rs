//! Payloads that live inside the inode's block-pointer array: device
//! numbers and fast symlink targets.
use super::layout::N_BLOCKS;

/// Longest symlink target stored inline in `i_block`.
pub const INLINE_SYMLINK_MAX: usize = N_BLOCKS * 4;

/// Encode device numbers into `i_block`.
///
/// Numbers that fit 8 bits each use the legacy `(major << 8) | minor` word in
/// slot 0. Larger ones leave slot 0 zero and use Linux's new encoding in
/// slot 1, which is what the kernel itself does.
pub fn encode_device(major: u32, minor: u32, block: &mut [u32; N_BLOCKS]) {
    if major < 256 && minor < 256 {
        block[0] = (major << 8) | (minor & 0xff);
        block[1] = 0;
    } else {
        block[0] = 0;
        block[1] = (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12);
    }
}

pub fn decode_device(block: &[u32; N_BLOCKS]) -> (u32, u32) {
    let old = block[0];
    if old != 0 {
        return ((old >> 8) & 0xff, old & 0xff);
    }
    let new = block[1];
    let major = (new & 0xfff00) >> 8;
    let minor = (new & 0xff) | ((new >> 12) & 0xfff00);
    (major, minor)
}

/// Pack a short symlink target into the pointer array as raw bytes.
pub fn pack_inline_symlink(target: &[u8]) -> [u32; N_BLOCKS] {
    debug_assert!(target.len() <= INLINE_SYMLINK_MAX);
    let mut raw = [0u8; INLINE_SYMLINK_MAX];
    raw[..target.len()].copy_from_slice(target);
    let mut block = [0u32; N_BLOCKS];
    for (slot, word) in block.iter_mut().zip(raw.chunks_exact(4)) {
        *slot = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
    }
    block
}

/// Recover `size` bytes of an inline symlink target.
pub fn unpack_inline_symlink(block: &[u32; N_BLOCKS], size: usize) -> Vec<u8> {
    let raw: Vec<u8> = block.iter().flat_map(|word| word.to_le_bytes()).collect();
    raw[..size.min(INLINE_SYMLINK_MAX)].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_device_encoding() {
        let mut block = [0u32; N_BLOCKS];
        encode_device(1, 3, &mut block);
        assert_eq!(block[0], 0x0103);
        assert_eq!(decode_device(&block), (1, 3));

        encode_device(204, 64, &mut block);
        assert_eq!(decode_device(&block), (204, 64));
    }

    #[test]
    fn test_large_device_numbers_use_new_encoding() {
        let mut block = [0u32; N_BLOCKS];
        encode_device(259, 65536, &mut block);
        assert_eq!(block[0], 0);
        assert_ne!(block[1], 0);
        assert_eq!(decode_device(&block), (259, 65536));
    }

    #[test]
    fn test_inline_symlink_bytes() {
        let target = b"/usr/lib/libc.so.6";
        let block = pack_inline_symlink(target);
        // Bytes are laid out little-endian in slot order.
        assert_eq!(block[0].to_le_bytes(), *b"/usr");
        assert_eq!(unpack_inline_symlink(&block, target.len()), target);

        let full = [b'x'; INLINE_SYMLINK_MAX];
        let block = pack_inline_symlink(&full);
        assert_eq!(unpack_inline_symlink(&block, 60), full.to_vec());
    }
}
