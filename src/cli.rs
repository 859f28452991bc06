//! Command-line surface for the `fuse-lsfs` attachment binary.
//!
//! Supports a read-write filesystem: `rw` is accepted instead of
//! panicking, and `RO` is no longer forced into the default mount
//! options.

use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use fuser::MountOption;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// Mount options to pass to the kernel
	#[arg(short, long, value_delimiter(','))]
	pub options: Vec<String>,

	/// Path to the device or image file
	pub device: PathBuf,
	/// Path to the mount point
	pub mountpoint: PathBuf,

	/// Run in the foreground instead of daemonizing
	#[arg(short, long)]
	pub foreground: bool,

	#[command(flatten)]
	pub verbose: Verbosity<WarnLevel>,
}

impl Cli {
	pub fn options(&self) -> Vec<MountOption> {
		let mut opts = vec![
			MountOption::FSName("lsfs".into()),
			MountOption::Subtype("lsfs".into()),
			MountOption::DefaultPermissions,
		];

		for opt in &self.options {
			let opt = match opt.as_str() {
				"allow_other" => MountOption::AllowOther,
				"allow_root" => MountOption::AllowRoot,
				"async" => MountOption::Async,
				"atime" => MountOption::Atime,
				"auto_unmount" => MountOption::AutoUnmount,
				"default_permissions" => continue,
				"dev" => MountOption::Dev,
				"dirsync" => MountOption::DirSync,
				"exec" => MountOption::Exec,
				"noatime" => MountOption::NoAtime,
				"nodev" => MountOption::NoDev,
				"noexec" => MountOption::NoExec,
				"nosuid" => MountOption::NoSuid,
				"ro" => MountOption::RO,
				"rw" => MountOption::RW,
				"suid" => MountOption::Suid,
				"sync" => MountOption::Sync,
				custom => MountOption::CUSTOM(custom.into()),
			};
			opts.push(opt);
		}

		opts
	}
}
