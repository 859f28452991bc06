use std::fs::OpenOptions;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use lsfs::{BlockDevice, Lsfs};

mod fs;

use crate::fs::Fs;

fn main() -> Result<()> {
	let cli = lsfs::cli::Cli::parse();

	env_logger::Builder::new()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let readonly = cli.options().contains(&MountOption::RO);
	let file = OpenOptions::new()
		.read(true)
		.write(!readonly)
		.open(&cli.device)
		.with_context(|| format!("failed to open {}", cli.device.display()))?;
	let dev = BlockDevice::open(file, readonly).context("failed to open block device")?;
	let lsfs = Lsfs::mount(dev).context("failed to mount lsfs image")?;
	let fs = Fs::new(lsfs);

	if cli.foreground {
		fuser::mount2(fs, &cli.mountpoint, &cli.options())?;
	} else {
		fuser::spawn_mount2(fs, &cli.mountpoint, &cli.options())?;
	}

	Ok(())
}
