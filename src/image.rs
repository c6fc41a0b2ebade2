//! Format detection and load/store dispatch across the image codecs.
//!
//! An image may be wrapped in a legacy uImage header, then gzip, around the
//! actual ext2, cpio or tar bytes. Loading peels the wrappers in that order
//! and remembers them so an edited tree can be written back the same way.
use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use log::debug;
use std::fmt;

use crate::vfs::Tree;
use crate::{compress, cpio, ext2, tar, uimage};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Ext2,
    Cpio,
    Tar,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Ext2 => "ext2",
            ImageFormat::Cpio => "cpio",
            ImageFormat::Tar => "tar",
        };
        f.write_str(name)
    }
}

/// How an input image was recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    pub format: ImageFormat,
    pub gzipped: bool,
    pub uimage: Option<uimage::Header>,
    /// ext2 only.
    pub block_size: Option<u32>,
}

impl Detected {
    /// Options that write a tree back in the shape it was read.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            block_size: self.block_size.unwrap_or(ext2::DEFAULT_BLOCK_SIZE),
            gzip: self.gzipped,
            uimage: self.uimage.as_ref().map(uimage::Header::name),
        }
    }
}

impl fmt::Display for Detected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format)?;
        let mut wrappers = Vec::new();
        if self.gzipped {
            wrappers.push("gzip");
        }
        if self.uimage.is_some() {
            wrappers.push("uImage");
        }
        if !wrappers.is_empty() {
            write!(f, " ({})", wrappers.join(", "))?;
        }
        Ok(())
    }
}

/// Options for producing an image.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub block_size: u32,
    pub gzip: bool,
    /// Wrap the result in a uImage ramdisk header with this name.
    pub uimage: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            block_size: ext2::DEFAULT_BLOCK_SIZE,
            gzip: false,
            uimage: None,
        }
    }
}

/// Identify an uncompressed image by its magic.
pub fn detect(data: &[u8]) -> Option<ImageFormat> {
    if ext2::is_ext2(data) {
        Some(ImageFormat::Ext2)
    } else if data.starts_with(cpio::NEWC_MAGIC) || data.starts_with(cpio::CRC_MAGIC) {
        Some(ImageFormat::Cpio)
    } else if tar::is_tar(data) {
        Some(ImageFormat::Tar)
    } else {
        None
    }
}

/// Peel a uImage header and gzip if present and detect the inner format.
pub fn unwrap(data: &[u8]) -> Result<(Vec<u8>, Detected)> {
    let (header, data) = if uimage::is_uimage(data) {
        let (header, payload) = uimage::unwrap(data)?;
        debug!("{header}");
        (Some(header), payload)
    } else {
        (None, data)
    };
    let gzipped = compress::is_gzip(data);
    let raw = if gzipped {
        compress::gzip_decompress(data)?
    } else {
        data.to_vec()
    };
    let Some(format) = detect(&raw) else {
        bail!("unrecognized image format");
    };
    let block_size = match format {
        ImageFormat::Ext2 => Some(ext2::Reader::open(&raw)?.block_size() as u32),
        _ => None,
    };
    let detected = Detected {
        format,
        gzipped,
        uimage: header,
        block_size,
    };
    Ok((raw, detected))
}

/// Decode any supported image into a tree.
pub fn load(data: &[u8]) -> Result<(Tree, Detected)> {
    let (raw, detected) = unwrap(data)?;
    debug!("loading {} bytes as {detected}", raw.len());
    let tree = match detected.format {
        ImageFormat::Ext2 => ext2::load(&raw)?,
        ImageFormat::Cpio => cpio::load(&raw)?,
        ImageFormat::Tar => tar::load(&raw)?,
    };
    Ok((tree, detected))
}

/// Encode a tree in the requested format.
pub fn store(tree: &Tree, format: ImageFormat, opts: &StoreOptions) -> Result<Vec<u8>> {
    let raw = match format {
        ImageFormat::Ext2 => ext2::store(tree, opts.block_size).with_context(|| {
            format!("Failed to build ext2 image ({} byte blocks)", opts.block_size)
        })?,
        ImageFormat::Cpio => cpio::store(tree)?,
        ImageFormat::Tar => tar::store(tree)?,
    };
    let data = if opts.gzip {
        compress::gzip_compress(&raw)?
    } else {
        raw
    };
    match &opts.uimage {
        Some(name) => {
            let header = uimage::Header::ramdisk(name, tree.root().mtime, opts.gzip);
            uimage::wrap(&header, &data)
        }
        None => Ok(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::Node;

    fn tree() -> Tree {
        let mut tree = Tree::new();
        tree.put_file("/etc/os-release", b"ID=fsimg\n".to_vec(), 0o644, 0, 0, 10).unwrap();
        tree.insert("/dev/null", Node::char_device(1, 3, 0o666)).unwrap();
        tree.put_symlink("/sbin/init", "/bin/busybox", 0, 0, 11).unwrap();
        tree.put_file("/srv/C:\\Übersicht.txt", b"x".to_vec(), 0o600, 0, 0, 12).unwrap();
        tree
    }

    #[test]
    fn test_detect_and_convert_every_format() {
        let source = tree();
        for format in [ImageFormat::Ext2, ImageFormat::Cpio, ImageFormat::Tar] {
            for gzip in [false, true] {
                let opts = StoreOptions { gzip, ..Default::default() };
                let bytes = store(&source, format, &opts).unwrap();
                let (loaded, detected) = load(&bytes).unwrap();
                assert_eq!((detected.format, detected.gzipped), (format, gzip));
                assert!(detected.uimage.is_none());
                assert_eq!(loaded, source, "{detected}");
            }
        }
    }

    #[test]
    fn test_uimage_wrapped_ramdisk() {
        let source = tree();
        let opts = StoreOptions {
            gzip: true,
            uimage: Some("rootfs".to_string()),
            ..Default::default()
        };
        let bytes = store(&source, ImageFormat::Cpio, &opts).unwrap();
        assert!(uimage::is_uimage(&bytes));

        let (loaded, detected) = load(&bytes).unwrap();
        assert_eq!(loaded, source);
        assert_eq!(detected.to_string(), "cpio (gzip, uImage)");
        let header = detected.uimage.as_ref().unwrap();
        assert_eq!((header.image_type, header.comp), (uimage::TYPE_RAMDISK, uimage::COMP_GZIP));

        // Writing back with the detected options reproduces the image
        let again = store(&loaded, detected.format, &detected.store_options()).unwrap();
        assert_eq!(load(&again).unwrap().1, detected);
    }

    #[test]
    fn test_ext2_block_size_is_remembered() {
        let opts = StoreOptions { block_size: 4096, ..Default::default() };
        let bytes = store(&tree(), ImageFormat::Ext2, &opts).unwrap();
        let (_, detected) = load(&bytes).unwrap();
        assert_eq!(detected.block_size, Some(4096));
        assert_eq!(detected.store_options().block_size, 4096);
        assert_eq!(detected.to_string(), "ext2");
    }

    #[test]
    fn test_unknown_format() {
        assert!(detect(b"hello").is_none());
        assert!(load(&[0u8; 4096]).is_err());
    }

    #[test]
    fn test_ext2_errors_carry_context() {
        let opts = StoreOptions { block_size: 512, ..Default::default() };
        let err = store(&tree(), ImageFormat::Ext2, &opts).unwrap_err();
        assert!(err.to_string().contains("512 byte blocks"));
        assert!(err.downcast_ref::<ext2::error::Ext2Error>().is_some());
    }
}
