use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

/// Checks (and optionally repairs) an LSFS image.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
	/// Path to the image file to check
	device: PathBuf,

	/// Apply the documented repairs (flip active checkpoint index,
	/// recompute free-segment count) instead of only reporting them
	#[arg(long)]
	repair: bool,

	#[command(flatten)]
	verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::WarnLevel>,
}

fn main() -> Result<ExitCode> {
	let cli = Cli::parse();
	env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).init();

	let report = lsfs::check_image(&cli.device, cli.repair)
		.with_context(|| format!("failed to check {}", cli.device.display()))?;

	for finding in &report.findings {
		if finding.repaired {
			log::info!("repaired: {}", finding.message);
		} else {
			log::warn!("{}", finding.message);
		}
	}
	println!(
		"{}: {} segment(s), {} inode(s) checked, {} finding(s){}",
		cli.device.display(),
		report.segments_checked,
		report.inodes_checked,
		report.findings.len(),
		if report.is_clean() { "" } else { " (unrepaired issues remain)" },
	);

	Ok(if report.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
