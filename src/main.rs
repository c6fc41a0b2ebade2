mod cli;
mod commands;
mod compress;
mod cpio;
mod ext2;
mod host;
mod image;
mod tar;
mod uimage;
mod vfs;

use anyhow::Result;
use clap::Parser;
use cli::Args;

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    commands::run(args)
}
