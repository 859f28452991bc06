//! Format utility: lays out a fresh image with a populated superblock, a
//! single full segment holding the root inode and its directory data,
//! one valid checkpoint, and an otherwise-empty segment table.
//!
//! Grounded in the reference `tools/mkfs.lsfs.c`'s layout, but expressed
//! as plain library calls into the same structures mount/recovery use,
//! rather than a hand-rolled duplicate of the on-disk writer.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::blockio::BlockDevice;
use crate::checkpoint;
use crate::error::{LsfsError, Result};
use crate::imap::InodeMap;
use crate::ondisk::{
	self, BlockInfo, CheckpointHeader, DiskInode, SegmentHeader, BLOCK_SIZE,
	BLOCK_TYPE_DATA, BLOCK_TYPE_INODE, CHECKPOINT1_START, DIRECT_BLOCKS, FT_DIR, LOG_START,
	ROOT_INO, SEGMENT_BLOCKS, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, SEGSTATE_FULL, SYMLINK_INLINE_MAX,
	Superblock,
};
use crate::segment::SegmentTable;

const MIN_SEGMENTS: u64 = 4;
const MAX_SEGMENTS: u64 = ondisk::MAX_SEGMENTS;

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Creates (or truncates) the image at `path` sized for `size_mib`
/// mebibytes, clamped to a 4-to-256-segment image, and writes the
/// initial on-disk layout described in the format utility contract.
pub fn format_image(path: &Path, size_mib: u64) -> Result<()> {
	let requested_segments = (size_mib * 1024 * 1024) / (SEGMENT_BLOCKS * BLOCK_SIZE as u64);
	let total_segments = requested_segments.clamp(MIN_SEGMENTS, MAX_SEGMENTS) as u32;
	let total_blocks = LOG_START + total_segments as u64 * SEGMENT_BLOCKS;

	let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
	let mut dev = BlockDevice::open(file, false)?;
	dev.set_total_blocks(total_blocks)?;

	let now = now_secs();
	let now_ns = now * 1_000_000_000;

	let root_data_addr = LOG_START + 2;
	let root_inode_addr = LOG_START + 1;

	// Root directory data block: `.` and `..` both point at identifier 1.
	let mut dir_block = [0u8; BLOCK_SIZE];
	let dot_len = ondisk::dirent_size(1);
	write_dirent(&mut dir_block, 0, ROOT_INO, b".", FT_DIR, dot_len);
	write_dirent(&mut dir_block, dot_len as usize, ROOT_INO, b"..", FT_DIR, BLOCK_SIZE as u16 - dot_len);
	dev.write_block(root_data_addr, &dir_block)?;

	// Root inode, in its own dedicated block at offset 0.
	let root_inode = DiskInode {
		ino: ROOT_INO,
		mode: libc::S_IFDIR | 0o755,
		uid: 0,
		gid: 0,
		size: BLOCK_SIZE as u64,
		blocks: 1,
		atime_ns: now_ns,
		mtime_ns: now_ns,
		ctime_ns: now_ns,
		nlink: 2,
		flags: 0,
		direct: {
			let mut d = [0u64; DIRECT_BLOCKS];
			d[0] = root_data_addr;
			d
		},
		indirect: 0,
		double_indirect: 0,
		symlink: [0u8; SYMLINK_INLINE_MAX],
		generation: rand::random(),
		reserved: [0u8; 8],
	};
	let mut inode_block = [0u8; BLOCK_SIZE];
	let bytes = bincode::encode_to_vec(&root_inode, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
	inode_block[..bytes.len()].copy_from_slice(&bytes);
	dev.write_block(root_inode_addr, &inode_block)?;

	// Segment 0's summary: two live blocks (the inode, then the data).
	let header = SegmentHeader { magic: SEGMENT_MAGIC, segment_id: 0, timestamp: now, used_block_count: 3, checksum: 0 };
	let mut header_block = [0u8; BLOCK_SIZE];
	let mut header_bytes = bincode::encode_to_vec(&header, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
	header_bytes.resize(SEGMENT_HEADER_SIZE, 0);
	header_block[..SEGMENT_HEADER_SIZE].copy_from_slice(&header_bytes);
	let infos = [
		BlockInfo { ino: ROOT_INO, offset: 0, block_type: BLOCK_TYPE_INODE, reserved: [0; 3] },
		BlockInfo { ino: ROOT_INO, offset: 0, block_type: BLOCK_TYPE_DATA, reserved: [0; 3] },
	];
	let mut off = SEGMENT_HEADER_SIZE;
	for bi in &infos {
		let bytes = bincode::encode_to_vec(bi, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
		header_block[off..off + bytes.len()].copy_from_slice(&bytes);
		off += ondisk::BLOCK_INFO_SIZE;
	}
	dev.write_block(LOG_START, &header_block)?;

	// Checkpoint region 0: the one-entry inode map and a segment table
	// with segment 0 `full` and every other segment `free`.
	let imap = InodeMap::new();
	imap.set(ROOT_INO, root_inode_addr)?;
	let table = SegmentTable::new(total_segments);
	table.mark_full(0, 2, now);
	let log_head = LOG_START + 3;
	checkpoint::write_checkpoint(&dev, 0, 1, log_head, &imap, &table)?;

	// Checkpoint region 1 stays invalid: an explicit zero-magic header
	// (rather than relying on the freshly truncated file already being
	// zero) so reformatting an existing image can't resurrect a stale
	// region.
	let invalid = CheckpointHeader::default();
	let mut invalid_block = [0u8; BLOCK_SIZE];
	let bytes = bincode::encode_to_vec(&invalid, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
	invalid_block[..bytes.len()].copy_from_slice(&bytes);
	dev.write_block(CHECKPOINT1_START, &invalid_block)?;

	let mut sb = Superblock {
		total_blocks,
		total_segments: total_segments as u64,
		inode_count: 1,
		active_checkpoint: 0,
		log_head,
		free_segments: total_segments - 1,
		created_at: now,
		..Superblock::default()
	};
	sb.uuid = rand::random();
	let bytes = bincode::encode_to_vec(&sb, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
	let mut sb_block = [0u8; BLOCK_SIZE];
	sb_block[..bytes.len()].copy_from_slice(&bytes);
	dev.write_block(ondisk::SUPERBLOCK_BLOCK, &sb_block)?;

	dev.sync()?;
	Ok(())
}

fn write_dirent(block: &mut [u8; BLOCK_SIZE], off: usize, ino: u32, name: &[u8], file_type: u8, rec_len: u16) {
	let hdr = ondisk::DirentHeader { ino, rec_len, name_len: name.len() as u8, file_type };
	let bytes = bincode::encode_to_vec(hdr, ondisk::CODEC).unwrap();
	block[off..off + bytes.len()].copy_from_slice(&bytes);
	let name_start = off + ondisk::DIRENT_HEADER_SIZE;
	block[name_start..name_start + name.len()].copy_from_slice(name);
}
