//! On-disk structure definitions: magic numbers, layout constants, and the
//! packed records that make up the superblock, segment summaries, inodes,
//! directory entries, inode-map entries, segment-table entries, and
//! checkpoint headers.
//!
//! All multi-byte integers are little-endian; every struct here derives
//! [`bincode::Encode`]/[`bincode::Decode`] under a fixed-width,
//! little-endian configuration (see [`CODEC`]), which gives the same
//! stable, padding-free wire layout a hand-written packed C struct would
//! have, one field at a time, in declaration order.

use bincode::config::{self, Configuration, Fixint, LittleEndian, NoLimit};
use bincode::{Decode, Encode};

/// The codec every on-disk struct in this crate is encoded/decoded with.
pub const CODEC: Configuration<LittleEndian, Fixint, NoLimit> = config::standard()
	.with_little_endian()
	.with_fixed_int_encoding()
	.with_no_limit();

pub const BLOCK_SIZE: usize = 4096;
pub const SEGMENT_BLOCKS: u64 = 1024;
pub const MAX_SEGMENTS: u64 = 256;
pub const MAX_INODES: u32 = 65536;

pub const SUPERBLOCK_BLOCK: u64 = 0;
pub const CHECKPOINT0_START: u64 = 1;
pub const CHECKPOINT0_BLOCKS: u64 = 256;
pub const CHECKPOINT1_START: u64 = 257;
pub const CHECKPOINT1_BLOCKS: u64 = 256;
pub const SEGTABLE_START: u64 = 513;
pub const SEGTABLE_BLOCKS: u64 = 512;
pub const LOG_START: u64 = 1025;

pub const LSFS_MAGIC: u32 = 0x4C53_4653;
pub const SEGMENT_MAGIC: u32 = 0x5345_474D;
pub const CHECKPOINT_MAGIC: u32 = 0x4348_4B50;
pub const LSFS_VERSION: u32 = 1;

pub const ROOT_INO: u32 = 1;
pub const DIRECT_BLOCKS: usize = 12;
pub const PTRS_PER_BLOCK: u64 = 512;
pub const SYMLINK_INLINE_MAX: usize = 64;
pub const NAME_MAX: usize = 255;

pub const INODE_SIZE: usize = 256;

/// Bytes available for `block_info` entries in a segment summary block,
/// and how many of them fit.
///
/// A segment's nominal data capacity (1024 blocks) is larger than what a
/// single summary block can describe with one `block_info` record per data
/// block (`SEGMENT_HEADER_SIZE` + N * `BLOCK_INFO_SIZE` must fit in one 4096
/// byte block). The segment writer (`segment.rs`) still fills segments to
/// the full 1024 blocks before flushing; only the `block_info` entries for
/// slots beyond this capacity are left out of the summary, so recovery and
/// the cleaner have no recorded owner/type for that tail. See DESIGN.md.
pub const SEGMENT_HEADER_SIZE: usize = 24;
pub const BLOCK_INFO_SIZE: usize = 12;
pub const SUMMARY_CAPACITY: usize = (BLOCK_SIZE - SEGMENT_HEADER_SIZE) / BLOCK_INFO_SIZE;

pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_SYMLINK: u8 = 3;

pub const INODE_FLAG_DELETED: u32 = 1 << 0;
pub const INODE_FLAG_DIRTY: u32 = 1 << 1;

pub const BLOCK_TYPE_DATA: u8 = 0;
pub const BLOCK_TYPE_INODE: u8 = 1;
pub const BLOCK_TYPE_INDIRECT: u8 = 2;
pub const BLOCK_TYPE_DIRENT: u8 = 3;

pub const SEGSTATE_FREE: u8 = 0;
pub const SEGSTATE_ACTIVE: u8 = 1;
pub const SEGSTATE_FULL: u8 = 2;
pub const SEGSTATE_CLEANING: u8 = 3;

/// Block 0. Padded to exactly [`BLOCK_SIZE`] bytes.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Superblock {
	pub magic: u32,
	pub version: u32,
	pub block_size: u32,
	pub segment_size: u32,
	pub total_blocks: u64,
	pub total_segments: u64,
	pub inode_count: u32,
	pub checkpoint_region: [u64; 2],
	pub active_checkpoint: u32,
	pub padding1: u32,
	pub log_head: u64,
	pub free_segments: u32,
	pub uuid: [u8; 16],
	pub created_at: u64,
	pub mounted_at: u64,
	pub mount_count: u32,
	pub state: u32,
	pub reserved: [u8; 3984],
}

impl Default for Superblock {
	fn default() -> Self {
		Self {
			magic: LSFS_MAGIC,
			version: LSFS_VERSION,
			block_size: BLOCK_SIZE as u32,
			segment_size: SEGMENT_BLOCKS as u32,
			total_blocks: 0,
			total_segments: 0,
			inode_count: 0,
			checkpoint_region: [CHECKPOINT0_START, CHECKPOINT1_START],
			active_checkpoint: 0,
			padding1: 0,
			log_head: LOG_START,
			free_segments: 0,
			uuid: [0u8; 16],
			created_at: 0,
			mounted_at: 0,
			mount_count: 0,
			state: 0,
			reserved: [0u8; 3984],
		}
	}
}

/// First block of a segment.
#[derive(Debug, Clone, Encode, Decode)]
pub struct SegmentHeader {
	pub magic: u32,
	pub segment_id: u32,
	pub timestamp: u64,
	pub used_block_count: u32,
	pub checksum: u32,
}

impl Default for SegmentHeader {
	fn default() -> Self {
		Self { magic: 0, segment_id: 0, timestamp: 0, used_block_count: 0, checksum: 0 }
	}
}

/// One entry per data block in a segment, describing the block's owner.
#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct BlockInfo {
	pub ino: u32,
	pub offset: u32,
	pub block_type: u8,
	pub reserved: [u8; 3],
}

/// 256-byte packed on-disk inode.
///
/// Field widths were chosen to land the struct at exactly 256 bytes;
/// only the total size and the set of fields are fixed, not each
/// field's individual width. See DESIGN.md.
#[derive(Debug, Clone, Encode, Decode)]
pub struct DiskInode {
	pub ino: u32,
	pub mode: u32,
	pub uid: u32,
	pub gid: u32,
	pub size: u64,
	pub blocks: u64,
	pub atime_ns: u64,
	pub mtime_ns: u64,
	pub ctime_ns: u64,
	pub nlink: u32,
	pub flags: u32,
	pub direct: [u64; DIRECT_BLOCKS],
	pub indirect: u64,
	pub double_indirect: u64,
	pub symlink: [u8; SYMLINK_INLINE_MAX],
	pub generation: u64,
	pub reserved: [u8; 8],
}

impl Default for DiskInode {
	fn default() -> Self {
		Self {
			ino: 0,
			mode: 0,
			uid: 0,
			gid: 0,
			size: 0,
			blocks: 0,
			atime_ns: 0,
			mtime_ns: 0,
			ctime_ns: 0,
			nlink: 0,
			flags: 0,
			direct: [0; DIRECT_BLOCKS],
			indirect: 0,
			double_indirect: 0,
			symlink: [0; SYMLINK_INLINE_MAX],
			generation: 0,
			reserved: [0u8; 8],
		}
	}
}

const _: () = assert!(std::mem::size_of::<u64>() == 8);

/// Header of the directory-entry record; the variable-length name bytes
/// follow immediately after this struct in the block.
#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct DirentHeader {
	pub ino: u32,
	pub rec_len: u16,
	pub name_len: u8,
	pub file_type: u8,
}

pub const DIRENT_HEADER_SIZE: usize = 8;

/// Rounds a raw record size up to the next multiple of 4, as required by
/// the directory-tiling invariant.
pub fn dirent_size(name_len: usize) -> u16 {
	(((DIRENT_HEADER_SIZE + name_len + 3) / 4) * 4) as u16
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct ImapEntryOnDisk {
	pub ino: u32,
	pub version: u32,
	pub location: u64,
}

pub const IMAP_ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct SegmentTableEntry {
	pub segment_id: u32,
	pub state: u8,
	pub reserved: [u8; 3],
	pub live_blocks: u32,
	pub timestamp: u64,
}

pub const SEGTABLE_ENTRY_SIZE: usize = 20;

#[derive(Debug, Clone, Encode, Decode)]
pub struct CheckpointHeader {
	pub magic: u32,
	pub version: u32,
	pub sequence: u64,
	pub timestamp: u64,
	pub log_head: u64,
	pub imap_entries: u32,
	pub segment_entries: u32,
	pub checksum: u32,
	pub complete: u32,
}

impl Default for CheckpointHeader {
	fn default() -> Self {
		Self {
			magic: 0,
			version: LSFS_VERSION,
			sequence: 0,
			timestamp: 0,
			log_head: 0,
			imap_entries: 0,
			segment_entries: 0,
			checksum: 0,
			complete: 0,
		}
	}
}

/// Absolute block number of the first block of `segment_id`.
pub fn segment_to_block(segment_id: u32) -> u64 {
	LOG_START + segment_id as u64 * SEGMENT_BLOCKS
}

/// Inverse of [`segment_to_block`] for any block within the log region.
pub fn block_to_segment(block: u64) -> u32 {
	((block - LOG_START) / SEGMENT_BLOCKS) as u32
}
