//! Check utility: validates an image's superblock, checkpoint regions,
//! segment headers, and inode-map locations, with an optional repair pass.
//!
//! Grounded in the reference `tools/fsck.lsfs.c`'s check list; reuses
//! `checkpoint.rs`'s region/header/segtable readers rather than
//! re-deriving the checkpoint layout here.

use std::fs::OpenOptions;
use std::path::Path;

use crate::blockio::BlockDevice;
use crate::checkpoint;
use crate::error::{LsfsError, Result};
use crate::imap::InodeMap;
use crate::ondisk::{
	self, segment_to_block, Superblock, BLOCK_SIZE, CHECKPOINT_MAGIC, LOG_START, LSFS_MAGIC,
	LSFS_VERSION, ROOT_INO, SEGMENT_BLOCKS, SEGMENT_MAGIC, SEGSTATE_FREE,
};

/// One violated (or, with `repair`, corrected) invariant.
#[derive(Debug, Clone)]
pub struct Finding {
	pub message: String,
	pub repaired: bool,
}

/// Outcome of a check (optionally repair) pass over an image.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
	pub findings: Vec<Finding>,
	pub segments_checked: u32,
	pub inodes_checked: u32,
}

impl CheckReport {
	/// True if nothing was found wrong, or everything found wrong was
	/// repaired.
	pub fn is_clean(&self) -> bool {
		self.findings.iter().all(|f| f.repaired)
	}

	fn fail(&mut self, message: impl Into<String>) {
		self.findings.push(Finding { message: message.into(), repaired: false });
	}

	fn fixed(&mut self, message: impl Into<String>) {
		self.findings.push(Finding { message: message.into(), repaired: true });
	}
}

/// Opens `path` (read-write only when `repair` is set) and walks every
/// invariant the format utility establishes: superblock identity, at
/// least one valid checkpoint region, every full segment's header, every
/// inode-map location's bounds, and the root identifier's shape.
///
/// With `repair`, flips the active-checkpoint index to a valid sibling
/// when the recorded one is invalid, and recomputes the free-segment
/// count when it disagrees with what the segment-table scan found.
pub fn check_image(path: &Path, repair: bool) -> Result<CheckReport> {
	let file = OpenOptions::new().read(true).write(repair).open(path)?;
	let dev = BlockDevice::open(file, !repair)?;
	let mut report = CheckReport::default();

	let mut sb = read_superblock(&dev)?;
	if sb.magic != LSFS_MAGIC {
		report.fail(format!("superblock magic {:#x} != {:#x}", sb.magic, LSFS_MAGIC));
	}
	if sb.version != LSFS_VERSION {
		report.fail(format!("superblock version {} != {}", sb.version, LSFS_VERSION));
	}
	if sb.block_size != BLOCK_SIZE as u32 {
		report.fail(format!("superblock block_size {} != {}", sb.block_size, BLOCK_SIZE));
	}
	if sb.segment_size != SEGMENT_BLOCKS as u32 {
		report.fail(format!("superblock segment_size {} != {}", sb.segment_size, SEGMENT_BLOCKS));
	}
	if sb.total_blocks != dev.total_blocks() {
		report.fail(format!(
			"superblock total_blocks {} != image size {} blocks",
			sb.total_blocks,
			dev.total_blocks()
		));
	}

	let region0_valid = checkpoint_region_valid(&dev, 0);
	let region1_valid = checkpoint_region_valid(&dev, 1);
	if !region0_valid && !region1_valid {
		report.fail("neither checkpoint region is valid");
	} else {
		let active_valid = if sb.active_checkpoint == 0 { region0_valid } else { region1_valid };
		if !active_valid {
			let other = 1 - sb.active_checkpoint;
			if repair {
				sb.active_checkpoint = other;
				report.fixed(format!("active checkpoint region was invalid, switched to region {}", other));
			} else {
				report.fail(format!(
					"active checkpoint region {} is invalid, region {} is valid",
					sb.active_checkpoint, other
				));
			}
		}
	}

	let valid_region = if sb.active_checkpoint == 0 && region0_valid {
		Some(0)
	} else if sb.active_checkpoint == 1 && region1_valid {
		Some(1)
	} else if region0_valid {
		Some(0)
	} else if region1_valid {
		Some(1)
	} else {
		None
	};

	let mut scanned_free = 0u32;
	if let Some(region) = valid_region {
		let (start, _) = checkpoint::region_bounds(region);
		let header = checkpoint::read_header(&dev, start)?;
		let imap_start = start + 1;
		let segtable_start = imap_start + imap_blocks(header.imap_entries);
		let segtable = checkpoint::read_segtable(&dev, segtable_start, header.segment_entries)?;

		report.segments_checked = segtable.len() as u32;
		for entry in &segtable {
			if entry.state == SEGSTATE_FREE {
				scanned_free += 1;
				continue;
			}
			let block = segment_to_block(entry.segment_id);
			let mut buf = [0u8; BLOCK_SIZE];
			if dev.read_block(block, &mut buf).is_err() {
				report.fail(format!("segment {} unreadable", entry.segment_id));
				continue;
			}
			let (hdr, _): (ondisk::SegmentHeader, usize) = match bincode::decode_from_slice(&buf, ondisk::CODEC) {
				Ok(v) => v,
				Err(_) => {
					report.fail(format!("segment {} header undecodable", entry.segment_id));
					continue;
				}
			};
			if hdr.magic != SEGMENT_MAGIC {
				report.fail(format!("segment {} missing segment magic", entry.segment_id));
				continue;
			}
			if hdr.segment_id != entry.segment_id {
				report.fail(format!("segment {} header claims identifier {}", entry.segment_id, hdr.segment_id));
			}
			if hdr.used_block_count as u64 > SEGMENT_BLOCKS {
				report.fail(format!(
					"segment {} used_block_count {} exceeds {} blocks",
					entry.segment_id, hdr.used_block_count, SEGMENT_BLOCKS
				));
			}
		}

		let imap = InodeMap::new();
		imap.load(&dev, imap_start, header.imap_entries)?;
		report.inodes_checked = imap.count();
		let mut root_seen = false;
		for entry in imap.snapshot() {
			if entry.location < LOG_START || entry.location >= dev.total_blocks() {
				report.fail(format!(
					"inode {} location {} outside log region [{}, {})",
					entry.ino,
					entry.location,
					LOG_START,
					dev.total_blocks()
				));
				continue;
			}
			if entry.ino == ROOT_INO {
				root_seen = true;
				let mut buf = [0u8; BLOCK_SIZE];
				if dev.read_block(entry.location, &mut buf).is_err() {
					report.fail("root inode block unreadable");
				} else {
					match bincode::decode_from_slice::<ondisk::DiskInode, _>(&buf[0..ondisk::INODE_SIZE], ondisk::CODEC) {
						Ok((inode, _)) => {
							if inode.ino != ROOT_INO {
								report.fail(format!("root inode block holds identifier {} instead of {}", inode.ino, ROOT_INO));
							}
							if inode.mode & libc::S_IFMT != libc::S_IFDIR {
								report.fail("root identifier does not resolve to a directory");
							}
						}
						Err(_) => report.fail("root inode undecodable"),
					}
				}
			}
		}
		if !root_seen {
			report.fail(format!("inode map has no entry for root identifier {}", ROOT_INO));
		}

		if sb.free_segments != scanned_free {
			if repair {
				report.fixed(format!(
					"superblock free_segments {} disagreed with scan ({}), updated",
					sb.free_segments, scanned_free
				));
				sb.free_segments = scanned_free;
			} else {
				report.fail(format!(
					"superblock free_segments {} disagrees with scan ({})",
					sb.free_segments, scanned_free
				));
			}
		}
	}

	if repair {
		write_superblock(&dev, &sb)?;
		dev.sync()?;
	}

	Ok(report)
}

fn read_superblock(dev: &BlockDevice) -> Result<Superblock> {
	let mut block = [0u8; BLOCK_SIZE];
	dev.read_block(ondisk::SUPERBLOCK_BLOCK, &mut block)?;
	let (sb, _): (Superblock, usize) =
		bincode::decode_from_slice(&block, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
	Ok(sb)
}

fn write_superblock(dev: &BlockDevice, sb: &Superblock) -> Result<()> {
	let mut block = [0u8; BLOCK_SIZE];
	let bytes = bincode::encode_to_vec(sb, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
	block[..bytes.len()].copy_from_slice(&bytes);
	dev.write_block(ondisk::SUPERBLOCK_BLOCK, &block)
}

fn checkpoint_region_valid(dev: &BlockDevice, region: u32) -> bool {
	let (start, _) = checkpoint::region_bounds(region);
	match checkpoint::read_header(dev, start) {
		Ok(h) => h.magic == CHECKPOINT_MAGIC && h.complete == 1,
		Err(_) => false,
	}
}

fn imap_blocks(imap_entries: u32) -> u64 {
	let per = (BLOCK_SIZE / ondisk::IMAP_ENTRY_SIZE) as u32;
	if imap_entries == 0 {
		0
	} else {
		((imap_entries + per - 1) / per) as u64
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::format::format_image;
	use tempfile::NamedTempFile;

	#[test]
	fn fresh_image_is_clean() {
		let tmp = NamedTempFile::new().unwrap();
		format_image(tmp.path(), 8).unwrap();
		let report = check_image(tmp.path(), false).unwrap();
		assert!(report.is_clean(), "{:?}", report.findings);
		assert_eq!(report.inodes_checked, 1);
	}

	#[test]
	fn corrupt_magic_is_detected() {
		use std::os::unix::fs::FileExt;

		let tmp = NamedTempFile::new().unwrap();
		format_image(tmp.path(), 8).unwrap();
		let file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
		file.write_at(&[0u8; 4], 0).unwrap();
		let report = check_image(tmp.path(), false).unwrap();
		assert!(!report.is_clean());
	}

	#[test]
	fn repair_flips_to_valid_checkpoint_region() {
		let tmp = NamedTempFile::new().unwrap();
		format_image(tmp.path(), 8).unwrap();
		{
			let file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
			let dev = BlockDevice::open(file, false).unwrap();
			let mut sb = read_superblock(&dev).unwrap();
			sb.active_checkpoint = 1;
			write_superblock(&dev, &sb).unwrap();
		}
		let report = check_image(tmp.path(), true).unwrap();
		assert!(report.findings.iter().any(|f| f.repaired));
		let report = check_image(tmp.path(), false).unwrap();
		assert!(report.is_clean(), "{:?}", report.findings);
	}
}
