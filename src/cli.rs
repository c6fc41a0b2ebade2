use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::image::ImageFormat;

#[derive(Parser, Debug)]
#[command(
    name = "fsimg",
    about = "Inspect, edit and convert embedded Linux filesystem images",
    long_about = "Read and write ext2, cpio (newc) and tar images, optionally \
                  gzip-compressed or wrapped in a uImage header, without mounting anything"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List a directory inside an image
    Ls {
        image: PathBuf,

        /// Directory (or file) inside the image
        #[arg(default_value = "/")]
        path: String,

        /// Long listing: mode, owner, size and link targets
        #[arg(short = 'l', long = "long")]
        long: bool,
    },

    /// Show the detected format and a summary of an image
    Info { image: PathBuf },

    /// Convert an image to another format
    Convert {
        input: PathBuf,
        output: PathBuf,

        /// Output format
        #[arg(long = "to", value_enum)]
        to: ImageFormat,

        /// ext2 block size in bytes (1024, 2048 or 4096)
        #[arg(short = 'b', long = "block-size", default_value = "1024")]
        block_size: u32,

        /// gzip the output
        #[arg(short = 'z', long = "gzip")]
        gzip: bool,

        /// Wrap the output in a uImage ramdisk header with this name
        #[arg(long = "uimage", value_name = "NAME")]
        uimage: Option<String>,
    },

    /// Build an image from a host directory
    Pack {
        dir: PathBuf,
        output: PathBuf,

        /// Output format
        #[arg(long = "to", value_enum, default_value = "ext2")]
        to: ImageFormat,

        /// ext2 block size in bytes (1024, 2048 or 4096)
        #[arg(short = 'b', long = "block-size", default_value = "1024")]
        block_size: u32,

        /// gzip the output
        #[arg(short = 'z', long = "gzip")]
        gzip: bool,

        /// Wrap the output in a uImage ramdisk header with this name
        #[arg(long = "uimage", value_name = "NAME")]
        uimage: Option<String>,
    },

    /// Unpack an image into a host directory
    Extract {
        image: PathBuf,
        dir: PathBuf,

        /// Write empty files for device nodes and fifos and skip chown
        #[arg(long = "placeholders")]
        placeholders: bool,
    },

    /// Copy a host file or directory into an image
    Add {
        image: PathBuf,
        src: PathBuf,
        /// Destination path inside the image
        dest: String,
    },

    /// Create a directory inside an image
    Mkdir {
        image: PathBuf,
        path: String,

        /// Permission bits, octal
        #[arg(short = 'm', long = "mode", default_value = "755", value_parser = parse_mode)]
        mode: u16,

        #[command(flatten)]
        owner: Owner,
    },

    /// Remove a file or a directory tree from an image
    Rm { image: PathBuf, path: String },

    /// Create a symbolic link inside an image
    Ln {
        image: PathBuf,
        target: String,
        path: String,

        #[command(flatten)]
        owner: Owner,
    },

    /// Create a device node or fifo inside an image
    Mknod {
        image: PathBuf,
        path: String,

        #[arg(value_enum)]
        kind: SpecialKind,

        /// Required for c and b
        major: Option<u32>,
        minor: Option<u32>,

        /// Permission bits, octal
        #[arg(short = 'm', long = "mode", default_value = "666", value_parser = parse_mode)]
        mode: u16,

        #[command(flatten)]
        owner: Owner,
    },
}

#[derive(clap::Args, Debug, Clone, Copy)]
pub struct Owner {
    #[arg(long = "uid", default_value = "0")]
    pub uid: u32,

    #[arg(long = "gid", default_value = "0")]
    pub gid: u32,
}

/// `mknod` node types, named as mknod(1) names them.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    #[value(name = "c")]
    Char,
    #[value(name = "b")]
    Block,
    #[value(name = "p")]
    Fifo,
}

fn parse_mode(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("{s:?} is not an octal mode"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_args() {
        let args = Args::parse_from([
            "fsimg", "-v", "convert", "in.cpio.gz", "out.img", "--to", "ext2", "-b", "4096",
        ]);
        assert!(args.verbose);
        match args.command {
            Command::Convert { to, block_size, gzip, uimage, .. } => {
                assert_eq!(to, ImageFormat::Ext2);
                assert_eq!(block_size, 4096);
                assert!(!gzip);
                assert_eq!(uimage, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_ls_defaults_to_root() {
        let args = Args::parse_from(["fsimg", "ls", "rootfs.img"]);
        match args.command {
            Command::Ls { path, long, .. } => {
                assert_eq!(path, "/");
                assert!(!long);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Args::try_parse_from(["fsimg", "convert", "a", "b", "--to", "zip"]).is_err());
    }

    #[test]
    fn test_mknod_args() {
        let args = Args::parse_from(["fsimg", "mknod", "rd.img", "/dev/sda", "b", "8", "0"]);
        match args.command {
            Command::Mknod { kind, major, minor, mode, owner, .. } => {
                assert_eq!(kind, SpecialKind::Block);
                assert_eq!((major, minor), (Some(8), Some(0)));
                assert_eq!(mode, 0o666);
                assert_eq!((owner.uid, owner.gid), (0, 0));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args = Args::parse_from(["fsimg", "mknod", "rd.img", "/run/ctl", "p", "-m", "600"]);
        match args.command {
            Command::Mknod { kind, major, mode, .. } => {
                assert_eq!(kind, SpecialKind::Fifo);
                assert_eq!(major, None);
                assert_eq!(mode, 0o600);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_mode_is_octal() {
        assert_eq!(parse_mode("1777"), Ok(0o1777));
        assert!(parse_mode("999").is_err());
        assert!(parse_mode("17777").is_err());
        let argv = ["fsimg", "mkdir", "r.img", "/tmp", "-m", "1777", "--uid", "5"];
        let args = Args::parse_from(argv);
        match args.command {
            Command::Mkdir { mode, owner, .. } => assert_eq!((mode, owner.uid), (0o1777, 5)),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Args::try_parse_from(["fsimg", "mkdir", "r.img", "/tmp", "-m", "rwx"]).is_err());
    }
}
