//! gzip wrapping for any image format.
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

pub fn gzip_decompress(gz_data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(gz_data);
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .context("Failed to decompress gzip data")?;
    Ok(data)
}

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).context("Failed to compress gzip data")?;
    encoder.finish().context("Failed to finish gzip stream")
}
