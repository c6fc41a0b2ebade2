//! Legacy U-Boot image wrapper, as produced by `mkimage -T ramdisk`.
//!
//! A 64-byte big-endian header precedes the payload. The header carries a
//! CRC32 of itself (computed with the CRC field zeroed) and of the payload.
use anyhow::{bail, Result};
use std::fmt;

pub const MAGIC: u32 = 0x2705_1956;
pub const HEADER_SIZE: usize = 64;
const NAME_LEN: usize = 32;

pub const OS_LINUX: u8 = 5;
pub const ARCH_ARM: u8 = 2;
pub const TYPE_RAMDISK: u8 = 3;
pub const COMP_NONE: u8 = 0;
pub const COMP_GZIP: u8 = 1;

/// Header fields other than the ones derived from the payload (magic,
/// size and both CRCs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub time: u32,
    pub load: u32,
    pub entry: u32,
    pub os: u8,
    pub arch: u8,
    pub image_type: u8,
    pub comp: u8,
    pub name: [u8; NAME_LEN],
}

impl Header {
    /// A Linux ramdisk header. Names longer than 32 bytes are cut.
    pub fn ramdisk(name: &str, time: u32, gzipped: bool) -> Self {
        let mut raw = [0u8; NAME_LEN];
        let n = name.len().min(NAME_LEN);
        raw[..n].copy_from_slice(&name.as_bytes()[..n]);
        Header {
            time,
            load: 0,
            entry: 0,
            os: OS_LINUX,
            arch: ARCH_ARM,
            image_type: TYPE_RAMDISK,
            comp: if gzipped { COMP_GZIP } else { COMP_NONE },
            name: raw,
        }
    }

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    fn encode(&self, size: u32, data_crc: u32) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        raw[8..12].copy_from_slice(&self.time.to_be_bytes());
        raw[12..16].copy_from_slice(&size.to_be_bytes());
        raw[16..20].copy_from_slice(&self.load.to_be_bytes());
        raw[20..24].copy_from_slice(&self.entry.to_be_bytes());
        raw[24..28].copy_from_slice(&data_crc.to_be_bytes());
        raw[28] = self.os;
        raw[29] = self.arch;
        raw[30] = self.image_type;
        raw[31] = self.comp;
        raw[32..64].copy_from_slice(&self.name);
        let header_crc = crc32fast::hash(&raw);
        raw[4..8].copy_from_slice(&header_crc.to_be_bytes());
        raw
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uImage name={:?} load={:#010x} entry={:#010x} type={} comp={}",
            self.name(),
            self.load,
            self.entry,
            self.image_type,
            self.comp
        )
    }
}

fn be32(raw: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

pub fn is_uimage(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE && be32(data, 0) == MAGIC
}

/// Check both CRCs and split off the payload. Bytes past the declared size
/// are ignored.
pub fn unwrap(data: &[u8]) -> Result<(Header, &[u8])> {
    if !is_uimage(data) {
        bail!("not a legacy uImage");
    }
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&data[..HEADER_SIZE]);
    let stored_crc = be32(&raw, 4);
    raw[4..8].fill(0);
    if crc32fast::hash(&raw) != stored_crc {
        bail!("uImage header CRC mismatch");
    }

    let size = be32(&raw, 12) as usize;
    let Some(payload) = data.get(HEADER_SIZE..HEADER_SIZE + size) else {
        let present = data.len() - HEADER_SIZE;
        bail!("truncated uImage: header declares {size} bytes, {present} present");
    };
    if crc32fast::hash(payload) != be32(&raw, 24) {
        bail!("uImage data CRC mismatch");
    }

    let mut name = [0u8; NAME_LEN];
    name.copy_from_slice(&raw[32..64]);
    let header = Header {
        time: be32(&raw, 8),
        load: be32(&raw, 16),
        entry: be32(&raw, 20),
        os: raw[28],
        arch: raw[29],
        image_type: raw[30],
        comp: raw[31],
        name,
    };
    Ok((header, payload))
}

/// Prefix `payload` with a header carrying its size and CRCs.
pub fn wrap(header: &Header, payload: &[u8]) -> Result<Vec<u8>> {
    let Ok(size) = u32::try_from(payload.len()) else {
        bail!("{} bytes do not fit a uImage", payload.len());
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.encode(size, crc32fast::hash(payload)));
    out.extend_from_slice(payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_and_unwrap() {
        let header = Header::ramdisk("initramfs", 1_700_000_000, true);
        let image = wrap(&header, b"070701payload").unwrap();
        assert!(is_uimage(&image));
        assert_eq!(image.len(), HEADER_SIZE + 13);
        assert_eq!(be32(&image, 12), 13);
        assert_eq!(be32(&image, 24), crc32fast::hash(b"070701payload"));

        let (parsed, payload) = unwrap(&image).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.name(), "initramfs");
        assert_eq!(parsed.comp, COMP_GZIP);
        assert_eq!(payload, b"070701payload");
    }

    #[test]
    fn test_corruption_is_detected() {
        let image = wrap(&Header::ramdisk("rd", 0, false), b"data").unwrap();

        let mut bad_header = image.clone();
        bad_header[40] ^= 1;
        assert!(unwrap(&bad_header).unwrap_err().to_string().contains("header CRC"));

        let mut bad_data = image.clone();
        bad_data[HEADER_SIZE] ^= 1;
        assert!(unwrap(&bad_data).unwrap_err().to_string().contains("data CRC"));

        let err = unwrap(&image[..HEADER_SIZE + 2]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
        assert!(!is_uimage(&image[..HEADER_SIZE - 1]));
    }

    #[test]
    fn test_long_names_are_cut() {
        let header = Header::ramdisk(&"n".repeat(40), 0, false);
        assert_eq!(header.name(), "n".repeat(32));
        assert!(header.to_string().contains("type=3"));
    }
}
