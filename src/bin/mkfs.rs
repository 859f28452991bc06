use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

/// Lays out a fresh LSFS image.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
	/// Path to the image file to create (or truncate)
	device: PathBuf,

	/// Image size in mebibytes, clamped to a 4-to-256-segment image
	#[arg(short, long, default_value_t = 64)]
	size: u64,

	#[command(flatten)]
	verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::WarnLevel>,
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).init();

	lsfs::format_image(&cli.device, cli.size)
		.with_context(|| format!("failed to format {}", cli.device.display()))?;
	log::info!("formatted {} ({size} MiB)", cli.device.display(), size = cli.size);
	Ok(())
}
