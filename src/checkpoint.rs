//! Two-phase alternating checkpoint: the durable root of the whole
//! filesystem. Two regions (0 and 1) each hold a header, the packed
//! inode map, and the segment table; writes alternate between them so
//! one complete, self-consistent checkpoint always survives a crash
//! mid-write to the other.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::blockio::BlockDevice;
use crate::error::{LsfsError, Result};
use crate::imap::InodeMap;
use crate::ondisk::{
	self, CheckpointHeader, SegmentTableEntry, BLOCK_SIZE, CHECKPOINT0_BLOCKS, CHECKPOINT0_START,
	CHECKPOINT1_BLOCKS, CHECKPOINT1_START, CHECKPOINT_MAGIC, SEGTABLE_ENTRY_SIZE,
};
use crate::segment::SegmentTable;

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

pub(crate) fn region_bounds(region: u32) -> (u64, u64) {
	if region == 0 {
		(CHECKPOINT0_START, CHECKPOINT0_BLOCKS)
	} else {
		(CHECKPOINT1_START, CHECKPOINT1_BLOCKS)
	}
}

/// Budget reserved for the inode map within a checkpoint region: one
/// block for the header, the rest split between imap and segment table.
/// The segment table has a fixed size (one entry per segment); whatever
/// remains goes to the inode map.
pub(crate) fn imap_block_budget(region_blocks: u64, total_segments: u64) -> u64 {
	let entries_per_block = (BLOCK_SIZE / SEGTABLE_ENTRY_SIZE) as u64;
	let segtable_blocks = (total_segments + entries_per_block - 1).max(1) / entries_per_block.max(1);
	region_blocks.saturating_sub(1).saturating_sub(segtable_blocks.max(1))
}

/// Writes a full checkpoint to `region` (0 or 1): header with
/// `complete = 0`, then the inode map, then the segment table, then
/// rewrites the header with `complete = 1` and fsyncs. The two-step
/// header write is what makes a torn checkpoint detectable on replay:
/// a region whose header reads `complete == 0` is never trusted.
pub fn write_checkpoint(
	dev: &BlockDevice,
	region: u32,
	sequence: u64,
	log_head: u64,
	imap: &InodeMap,
	segtable: &SegmentTable,
) -> Result<()> {
	let (start, blocks) = region_bounds(region);
	let total_segments = segtable.snapshot().len() as u64;
	let imap_budget = imap_block_budget(blocks, total_segments);

	let imap_start = start + 1;
	let imap_entries = imap.save(dev, imap_start, imap_budget)?;
	let entries_per_block = (BLOCK_SIZE / SEGTABLE_ENTRY_SIZE) as u64;
	let imap_blocks_used = if imap_entries == 0 {
		0
	} else {
		let per = (BLOCK_SIZE / ondisk::IMAP_ENTRY_SIZE) as u32;
		((imap_entries + per - 1) / per) as u64
	};
	let segtable_start = imap_start + imap_blocks_used;
	let entries = segtable.snapshot();
	let segtable_blocks = (entries.len() as u64 + entries_per_block - 1).max(1) / entries_per_block.max(1);
	if segtable_start + segtable_blocks > start + blocks {
		return Err(LsfsError::NoSpc);
	}
	write_segtable(dev, segtable_start, &entries)?;

	let header = CheckpointHeader {
		magic: CHECKPOINT_MAGIC,
		version: ondisk::LSFS_VERSION,
		sequence,
		timestamp: now_secs(),
		log_head,
		imap_entries,
		segment_entries: entries.len() as u32,
		checksum: 0,
		complete: 0,
	};
	write_header(dev, start, &header)?;
	dev.sync()?;

	let mut committed = header;
	committed.complete = 1;
	write_header(dev, start, &committed)?;
	dev.sync()?;
	Ok(())
}

fn write_header(dev: &BlockDevice, start: u64, header: &CheckpointHeader) -> Result<()> {
	let mut block = [0u8; BLOCK_SIZE];
	let bytes = bincode::encode_to_vec(header, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
	block[0..bytes.len()].copy_from_slice(&bytes);
	dev.write_block(start, &block)
}

fn write_segtable(dev: &BlockDevice, start: u64, entries: &[SegmentTableEntry]) -> Result<()> {
	let entries_per_block = BLOCK_SIZE / SEGTABLE_ENTRY_SIZE;
	let blocks = (entries.len() + entries_per_block - 1).max(1) / entries_per_block.max(1);
	let mut buf = vec![0u8; blocks.max(if entries.is_empty() { 0 } else { 1 }) * BLOCK_SIZE];
	for (i, e) in entries.iter().enumerate() {
		let bytes = bincode::encode_to_vec(e, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
		let off = i * SEGTABLE_ENTRY_SIZE;
		buf[off..off + SEGTABLE_ENTRY_SIZE].copy_from_slice(&bytes);
	}
	if !buf.is_empty() {
		dev.write_blocks(start, (buf.len() / BLOCK_SIZE) as u64, &buf)?;
	}
	Ok(())
}

pub(crate) fn read_header(dev: &BlockDevice, start: u64) -> Result<CheckpointHeader> {
	let mut block = [0u8; BLOCK_SIZE];
	dev.read_block(start, &mut block)?;
	let (header, _): (CheckpointHeader, usize) =
		bincode::decode_from_slice(&block, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
	Ok(header)
}

pub(crate) fn read_segtable(dev: &BlockDevice, start: u64, count: u32) -> Result<Vec<SegmentTableEntry>> {
	let entries_per_block = (BLOCK_SIZE / SEGTABLE_ENTRY_SIZE) as u32;
	let blocks = if count == 0 { 0 } else { (count + entries_per_block - 1) / entries_per_block };
	let mut buf = vec![0u8; blocks as usize * BLOCK_SIZE];
	if blocks > 0 {
		dev.read_blocks(start, blocks as u64, &mut buf)?;
	}
	let mut entries = Vec::with_capacity(count as usize);
	for i in 0..count as usize {
		let off = i * SEGTABLE_ENTRY_SIZE;
		let (e, _): (SegmentTableEntry, usize) =
			bincode::decode_from_slice(&buf[off..off + SEGTABLE_ENTRY_SIZE], ondisk::CODEC)
				.map_err(|_| LsfsError::Corrupt)?;
		entries.push(e);
	}
	Ok(entries)
}

/// Result of choosing a recovery checkpoint: which region won, its
/// header, and the loaded segment table (the inode map is loaded
/// directly into an `InodeMap` by the caller).
pub struct Recovered {
	pub region: u32,
	pub header: CheckpointHeader,
	pub segtable_entries: Vec<SegmentTableEntry>,
}

/// Reads both checkpoint regions and picks the valid one with the
/// higher sequence number. A region is valid only if its header reads
/// `complete == 1` with the expected magic; an incomplete or corrupt
/// region is ignored in favor of its sibling.
pub fn recover(dev: &BlockDevice, imap: &InodeMap) -> Result<Recovered> {
	let candidates = [0u32, 1u32].into_iter().filter_map(|region| {
		let (start, _) = region_bounds(region);
		let header = read_header(dev, start).ok()?;
		if header.magic != CHECKPOINT_MAGIC || header.complete != 1 {
			return None;
		}
		Some((region, header))
	});
	let (region, header) = candidates
		.max_by_key(|(_, h)| h.sequence)
		.ok_or(LsfsError::Corrupt)?;

	let (start, blocks) = region_bounds(region);
	let total_segments_hint = header.segment_entries as u64;
	let imap_budget = imap_block_budget(blocks, total_segments_hint);
	let imap_start = start + 1;
	imap.load(dev, imap_start, header.imap_entries)?;

	let per = (BLOCK_SIZE / ondisk::IMAP_ENTRY_SIZE) as u32;
	let imap_blocks_used = if header.imap_entries == 0 {
		0
	} else {
		(header.imap_entries + per - 1) / per
	};
	let segtable_start = imap_start + imap_blocks_used as u64;
	let _ = imap_budget;
	let segtable_entries = read_segtable(dev, segtable_start, header.segment_entries)?;

	Ok(Recovered { region, header, segtable_entries })
}

/// The region a fresh checkpoint should target: the one the last
/// successful write did *not* use, so the previous checkpoint remains
/// intact until the new one's header is committed.
pub fn next_region(current: u32) -> u32 {
	1 - current
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs::OpenOptions;
	use tempfile::NamedTempFile;

	fn test_dev() -> (NamedTempFile, BlockDevice) {
		let tmp = NamedTempFile::new().unwrap();
		let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
		let mut dev = BlockDevice::open(file, false).unwrap();
		dev.set_total_blocks(CHECKPOINT1_START + CHECKPOINT1_BLOCKS + 8).unwrap();
		(tmp, dev)
	}

	#[test]
	fn next_region_alternates() {
		assert_eq!(next_region(0), 1);
		assert_eq!(next_region(1), 0);
	}

	#[test]
	fn write_then_recover_round_trips_imap_and_segtable() {
		let (_tmp, dev) = test_dev();
		let imap = InodeMap::new();
		imap.set(ondisk::ROOT_INO, 2000).unwrap();
		imap.set(ondisk::ROOT_INO + 1, 3000).unwrap();
		let table = SegmentTable::new(4);
		table.mark_full(0, 10, 500);

		write_checkpoint(&dev, 0, 1, 4096, &imap, &table).unwrap();

		let loaded_imap = InodeMap::new();
		let recovered = recover(&dev, &loaded_imap).unwrap();
		assert_eq!(recovered.region, 0);
		assert_eq!(recovered.header.sequence, 1);
		assert_eq!(recovered.header.log_head, 4096);
		assert_eq!(loaded_imap.get(ondisk::ROOT_INO).unwrap().0, 2000);
		assert_eq!(loaded_imap.get(ondisk::ROOT_INO + 1).unwrap().0, 3000);
		assert_eq!(recovered.segtable_entries[0].live_blocks, 10);
	}

	#[test]
	fn recover_picks_higher_sequence_across_regions() {
		let (_tmp, dev) = test_dev();
		let imap = InodeMap::new();
		let table = SegmentTable::new(4);
		write_checkpoint(&dev, 0, 1, 0, &imap, &table).unwrap();
		write_checkpoint(&dev, 1, 2, 0, &imap, &table).unwrap();

		let loaded_imap = InodeMap::new();
		let recovered = recover(&dev, &loaded_imap).unwrap();
		assert_eq!(recovered.region, 1);
		assert_eq!(recovered.header.sequence, 2);
	}

	#[test]
	fn recover_ignores_incomplete_region() {
		let (_tmp, dev) = test_dev();
		let imap = InodeMap::new();
		let table = SegmentTable::new(4);
		write_checkpoint(&dev, 0, 1, 0, &imap, &table).unwrap();
		write_checkpoint(&dev, 1, 5, 0, &imap, &table).unwrap();

		// Corrupt region 1's header back to incomplete.
		let mut header = read_header(&dev, CHECKPOINT1_START).unwrap();
		header.complete = 0;
		write_header(&dev, CHECKPOINT1_START, &header).unwrap();

		let loaded_imap = InodeMap::new();
		let recovered = recover(&dev, &loaded_imap).unwrap();
		assert_eq!(recovered.region, 0);
		assert_eq!(recovered.header.sequence, 1);
	}
}
