//! Directory encoding: variable-length records packed into a directory
//! inode's data blocks, with tombstoned removal and a tiling invariant
//! (every block is fully covered by records, with no gaps other than a
//! trailing tombstone absorbing the remainder of the block).

use crate::blockio::BlockDevice;
use crate::bufferpool::BufferPool;
use crate::error::{LsfsError, Result};
use crate::inode::{read_block, resolve_block, write_block};
use crate::ondisk::{
	self, dirent_size, DirentHeader, DiskInode, BLOCK_SIZE, DIRENT_HEADER_SIZE, FT_DIR, NAME_MAX,
};
use crate::segment::{CleanerTrigger, SegmentWriter};

/// Reads block `b` of a directory's data through the buffer pool rather
/// than going straight to the device, since directory blocks are reread
/// far more often than they are written (every `lookup` during a path
/// walk). Falls back to a zeroed buffer for a hole, though a directory
/// in normal operation never has one.
fn read_dir_block(dev: &BlockDevice, pool: &BufferPool, inode: &DiskInode, b: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
	match resolve_block(dev, inode, b)? {
		Some(addr) => {
			*buf = pool.with_block(dev, addr, |data| *data)?;
			Ok(())
		}
		None => {
			buf.iter_mut().for_each(|x| *x = 0);
			Ok(())
		}
	}
}

/// A decoded directory record together with its block and byte offset,
/// for callers that need to rewrite it in place (e.g. rename).
pub struct DirEntryRef {
	pub ino: u32,
	pub name: Vec<u8>,
	pub file_type: u8,
	pub block_index: u64,
	pub byte_offset: usize,
}

fn blocks_in_use(inode: &DiskInode) -> u64 {
	(inode.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}

/// Scans every block of `inode` looking for `name`. Tombstones
/// (`ino == 0`) are skipped.
pub fn lookup(dev: &BlockDevice, pool: &BufferPool, inode: &DiskInode, name: &[u8]) -> Result<Option<DirEntryRef>> {
	let nblocks = blocks_in_use(inode);
	let mut block = [0u8; BLOCK_SIZE];
	for b in 0..nblocks {
		read_dir_block(dev, pool, inode, b, &mut block)?;
		let mut off = 0usize;
		while off + DIRENT_HEADER_SIZE <= BLOCK_SIZE {
			let (hdr, _): (DirentHeader, usize) =
				bincode::decode_from_slice(&block[off..off + DIRENT_HEADER_SIZE], ondisk::CODEC)
					.map_err(|_| LsfsError::Corrupt)?;
			if hdr.rec_len == 0 {
				break;
			}
			if hdr.ino != 0 {
				let name_start = off + DIRENT_HEADER_SIZE;
				let name_end = name_start + hdr.name_len as usize;
				if name_end > BLOCK_SIZE {
					return Err(LsfsError::Corrupt);
				}
				if &block[name_start..name_end] == name {
					return Ok(Some(DirEntryRef {
						ino: hdr.ino,
						name: block[name_start..name_end].to_vec(),
						file_type: hdr.file_type,
						block_index: b,
						byte_offset: off,
					}));
				}
			}
			off += hdr.rec_len as usize;
		}
	}
	Ok(None)
}

/// Invokes `f` with `(name, ino, file_type)` for every live entry, in
/// on-disk order, starting at a resumable `(block_index, byte_offset)`
/// cursor. Returns the cursor position to resume from on the next call,
/// or `None` once the directory has been fully walked.
pub fn dir_iter(
	dev: &BlockDevice,
	pool: &BufferPool,
	inode: &DiskInode,
	start: (u64, usize),
	mut f: impl FnMut(&[u8], u32, u8) -> bool,
) -> Result<Option<(u64, usize)>> {
	let nblocks = blocks_in_use(inode);
	let mut block = [0u8; BLOCK_SIZE];
	let (mut b, mut off) = start;
	while b < nblocks {
		read_dir_block(dev, pool, inode, b, &mut block)?;
		while off + DIRENT_HEADER_SIZE <= BLOCK_SIZE {
			let (hdr, _): (DirentHeader, usize) =
				bincode::decode_from_slice(&block[off..off + DIRENT_HEADER_SIZE], ondisk::CODEC)
					.map_err(|_| LsfsError::Corrupt)?;
			if hdr.rec_len == 0 {
				break;
			}
			if hdr.ino != 0 {
				let name_start = off + DIRENT_HEADER_SIZE;
				let name_end = name_start + hdr.name_len as usize;
				let cont = f(&block[name_start..name_end], hdr.ino, hdr.file_type);
				if !cont {
					return Ok(Some((b, off)));
				}
			}
			off += hdr.rec_len as usize;
		}
		b += 1;
		off = 0;
	}
	Ok(None)
}

/// True if a live (non-tombstone) record named `name` already exists.
fn name_exists(dev: &BlockDevice, inode: &DiskInode, name: &[u8]) -> Result<bool> {
	let nblocks = blocks_in_use(inode);
	let mut block = [0u8; BLOCK_SIZE];
	for b in 0..nblocks {
		read_block(dev, inode, b, &mut block)?;
		let mut off = 0usize;
		while off + DIRENT_HEADER_SIZE <= BLOCK_SIZE {
			let (hdr, _): (DirentHeader, usize) =
				bincode::decode_from_slice(&block[off..off + DIRENT_HEADER_SIZE], ondisk::CODEC)
					.map_err(|_| LsfsError::Corrupt)?;
			if hdr.rec_len == 0 {
				break;
			}
			if hdr.ino != 0 {
				let name_start = off + DIRENT_HEADER_SIZE;
				let name_end = name_start + hdr.name_len as usize;
				if &block[name_start..name_end] == name {
					return Ok(true);
				}
			}
			off += hdr.rec_len as usize;
		}
	}
	Ok(false)
}

/// Appends `(name, ino, file_type)` to the directory: first rejects a
/// duplicate name (`exist`), then reuses a tombstoned or trailing-free
/// record if one is large enough, else extends the directory with a
/// fresh block.
pub fn add(
	dev: &BlockDevice,
	writer: &SegmentWriter,
	cleaner: &dyn CleanerTrigger,
	inode: &mut DiskInode,
	name: &[u8],
	ino: u32,
	file_type: u8,
) -> Result<()> {
	if name.len() > NAME_MAX {
		return Err(LsfsError::Inval);
	}
	if name_exists(dev, inode, name)? {
		return Err(LsfsError::Exist);
	}
	let needed = dirent_size(name.len());
	let nblocks = blocks_in_use(inode);
	let mut block = [0u8; BLOCK_SIZE];

	for b in 0..nblocks {
		read_block(dev, inode, b, &mut block)?;
		let mut off = 0usize;
		while off + DIRENT_HEADER_SIZE <= BLOCK_SIZE {
			let (hdr, _): (DirentHeader, usize) =
				bincode::decode_from_slice(&block[off..off + DIRENT_HEADER_SIZE], ondisk::CODEC)
					.map_err(|_| LsfsError::Corrupt)?;
			if hdr.rec_len == 0 {
				break;
			}
			if hdr.ino == 0 && hdr.rec_len >= needed {
				write_entry(&mut block, off, ino, name, file_type, hdr.rec_len);
				write_block(dev, writer, cleaner, inode, b, &block)?;
				return Ok(());
			}
			off += hdr.rec_len as usize;
		}
		// `off` now sits at the first unused byte of the block; if the
		// remainder is large enough, this record becomes the new tail.
		let remaining = BLOCK_SIZE - off;
		if remaining >= needed as usize {
			write_entry(&mut block, off, ino, name, file_type, remaining as u16);
			write_block(dev, writer, cleaner, inode, b, &block)?;
			return Ok(());
		}
	}

	// No room in any existing block: append a fresh one, the new record
	// claiming the whole block (tiling invariant).
	let mut block = [0u8; BLOCK_SIZE];
	write_entry(&mut block, 0, ino, name, file_type, BLOCK_SIZE as u16);
	write_block(dev, writer, cleaner, inode, nblocks, &block)?;
	inode.size = (nblocks + 1) * BLOCK_SIZE as u64;
	Ok(())
}

fn write_entry(block: &mut [u8; BLOCK_SIZE], off: usize, ino: u32, name: &[u8], file_type: u8, rec_len: u16) {
	let hdr = DirentHeader { ino, rec_len, name_len: name.len() as u8, file_type };
	let bytes = bincode::encode_to_vec(hdr, ondisk::CODEC).unwrap();
	block[off..off + bytes.len()].copy_from_slice(&bytes);
	let name_start = off + DIRENT_HEADER_SIZE;
	block[name_start..name_start + name.len()].copy_from_slice(name);
}

/// Removes the entry matching `name`. If it is the first record of its
/// block, it is tombstoned in place (`ino` zeroed, `rec_len` preserved);
/// otherwise it is coalesced into the immediately preceding record of
/// the same block by adding its length onto that record's, so the
/// reclaimed space is available to a future `add` without leaving a
/// free-floating, unreachable gap.
pub fn remove(
	dev: &BlockDevice,
	writer: &SegmentWriter,
	cleaner: &dyn CleanerTrigger,
	inode: &mut DiskInode,
	name: &[u8],
) -> Result<u32> {
	let nblocks = blocks_in_use(inode);
	let mut block = [0u8; BLOCK_SIZE];
	for b in 0..nblocks {
		read_block(dev, inode, b, &mut block)?;
		let mut off = 0usize;
		let mut prev_off: Option<usize> = None;
		while off + DIRENT_HEADER_SIZE <= BLOCK_SIZE {
			let (hdr, _): (DirentHeader, usize) =
				bincode::decode_from_slice(&block[off..off + DIRENT_HEADER_SIZE], ondisk::CODEC)
					.map_err(|_| LsfsError::Corrupt)?;
			if hdr.rec_len == 0 {
				break;
			}
			if hdr.ino != 0 {
				let name_start = off + DIRENT_HEADER_SIZE;
				let name_end = name_start + hdr.name_len as usize;
				if &block[name_start..name_end] == name {
					let removed_ino = hdr.ino;
					match prev_off {
						None => {
							let tombstone = DirentHeader { ino: 0, rec_len: hdr.rec_len, name_len: 0, file_type: 0 };
							let bytes = bincode::encode_to_vec(tombstone, ondisk::CODEC).unwrap();
							block[off..off + bytes.len()].copy_from_slice(&bytes);
						}
						Some(prev) => {
							let (prev_hdr, _): (DirentHeader, usize) = bincode::decode_from_slice(
								&block[prev..prev + DIRENT_HEADER_SIZE],
								ondisk::CODEC,
							)
							.map_err(|_| LsfsError::Corrupt)?;
							let merged = DirentHeader { rec_len: prev_hdr.rec_len + hdr.rec_len, ..prev_hdr };
							let bytes = bincode::encode_to_vec(merged, ondisk::CODEC).unwrap();
							block[prev..prev + bytes.len()].copy_from_slice(&bytes);
						}
					}
					write_block(dev, writer, cleaner, inode, b, &block)?;
					return Ok(removed_ino);
				}
			}
			prev_off = Some(off);
			off += hdr.rec_len as usize;
		}
	}
	Err(LsfsError::NoEnt)
}

/// Initializes a freshly allocated directory's first block with `.` and
/// `..` entries.
pub fn init(
	dev: &BlockDevice,
	writer: &SegmentWriter,
	cleaner: &dyn CleanerTrigger,
	inode: &mut DiskInode,
	self_ino: u32,
	parent_ino: u32,
) -> Result<()> {
	let mut block = [0u8; BLOCK_SIZE];
	let dot_len = dirent_size(1);
	write_entry(&mut block, 0, self_ino, b".", FT_DIR, dot_len);
	let remaining = BLOCK_SIZE as u16 - dot_len;
	write_entry(&mut block, dot_len as usize, parent_ino, b"..", FT_DIR, remaining);
	write_block(dev, writer, cleaner, inode, 0, &block)?;
	inode.size = BLOCK_SIZE as u64;
	Ok(())
}

/// True if every entry is either `.`, `..`, or a tombstone.
pub fn is_empty(dev: &BlockDevice, pool: &BufferPool, inode: &DiskInode) -> Result<bool> {
	let mut empty = true;
	dir_iter(dev, pool, inode, (0, 0), |name, _ino, _ft| {
		if name != b"." && name != b".." {
			empty = false;
			return false;
		}
		true
	})?;
	Ok(empty)
}

/// Rewrites the `..` entry of `inode` (a directory being moved to a new
/// parent) to point at `new_parent_ino`.
///
/// The reference implementation leaves a moved directory's `..` pointer
/// stale; this implementation fixes it up on every cross-directory
/// rename, since the on-disk directory is self-contained and checked at
/// lookup time (see SPEC_FULL.md REDESIGN FLAGS).
pub fn set_parent(
	dev: &BlockDevice,
	writer: &SegmentWriter,
	cleaner: &dyn CleanerTrigger,
	inode: &mut DiskInode,
	new_parent_ino: u32,
) -> Result<()> {
	let mut block = [0u8; BLOCK_SIZE];
	read_block(dev, inode, 0, &mut block)?;
	let mut off = 0usize;
	while off + DIRENT_HEADER_SIZE <= BLOCK_SIZE {
		let (hdr, _): (DirentHeader, usize) =
			bincode::decode_from_slice(&block[off..off + DIRENT_HEADER_SIZE], ondisk::CODEC)
				.map_err(|_| LsfsError::Corrupt)?;
		if hdr.rec_len == 0 {
			break;
		}
		if hdr.ino != 0 {
			let name_start = off + DIRENT_HEADER_SIZE;
			let name_end = name_start + hdr.name_len as usize;
			if &block[name_start..name_end] == b".." {
				let new_hdr = DirentHeader { ino: new_parent_ino, ..hdr };
				let bytes = bincode::encode_to_vec(new_hdr, ondisk::CODEC).unwrap();
				block[off..off + bytes.len()].copy_from_slice(&bytes);
				write_block(dev, writer, cleaner, inode, 0, &block)?;
				return Ok(());
			}
		}
		off += hdr.rec_len as usize;
	}
	Err(LsfsError::Corrupt)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ondisk::{ROOT_INO, SEGMENT_BLOCKS};
	use crate::segment::SegmentTable;
	use std::fs::OpenOptions;
	use tempfile::NamedTempFile;

	struct NullTrigger;
	impl CleanerTrigger for NullTrigger {
		fn trigger(&self) {}
	}

	fn test_dev() -> (NamedTempFile, BlockDevice) {
		let tmp = NamedTempFile::new().unwrap();
		let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
		let mut dev = BlockDevice::open(file, false).unwrap();
		dev.set_total_blocks(SEGMENT_BLOCKS * 2 + ondisk::LOG_START).unwrap();
		(tmp, dev)
	}

	fn test_writer() -> SegmentWriter {
		let table = SegmentTable::new(2);
		let seg = table.alloc_segment().unwrap();
		SegmentWriter::new(table, seg)
	}

	#[test]
	fn init_creates_dot_and_dotdot() {
		let (_tmp, dev) = test_dev();
		let writer = test_writer();
		let pool = BufferPool::new();
		let mut inode = DiskInode { ino: ROOT_INO, mode: libc::S_IFDIR, ..Default::default() };
		init(&dev, &writer, &NullTrigger, &mut inode, ROOT_INO, ROOT_INO).unwrap();

		let dot = lookup(&dev, &pool, &inode, b".").unwrap().unwrap();
		assert_eq!(dot.ino, ROOT_INO);
		let dotdot = lookup(&dev, &pool, &inode, b"..").unwrap().unwrap();
		assert_eq!(dotdot.ino, ROOT_INO);
		assert!(is_empty(&dev, &pool, &inode).unwrap());
	}

	#[test]
	fn add_then_lookup_then_remove() {
		let (_tmp, dev) = test_dev();
		let writer = test_writer();
		let pool = BufferPool::new();
		let mut inode = DiskInode { ino: ROOT_INO, mode: libc::S_IFDIR, ..Default::default() };
		init(&dev, &writer, &NullTrigger, &mut inode, ROOT_INO, ROOT_INO).unwrap();

		add(&dev, &writer, &NullTrigger, &mut inode, b"child", 42, FT_DIR).unwrap();
		let found = lookup(&dev, &pool, &inode, b"child").unwrap().unwrap();
		assert_eq!(found.ino, 42);
		assert!(!is_empty(&dev, &pool, &inode).unwrap());

		let removed_ino = remove(&dev, &writer, &NullTrigger, &mut inode, b"child").unwrap();
		assert_eq!(removed_ino, 42);
		assert!(lookup(&dev, &pool, &inode, b"child").unwrap().is_none());
		assert!(is_empty(&dev, &pool, &inode).unwrap());
	}

	#[test]
	fn add_rejects_duplicate_name() {
		let (_tmp, dev) = test_dev();
		let writer = test_writer();
		let mut inode = DiskInode { ino: ROOT_INO, mode: libc::S_IFDIR, ..Default::default() };
		init(&dev, &writer, &NullTrigger, &mut inode, ROOT_INO, ROOT_INO).unwrap();

		add(&dev, &writer, &NullTrigger, &mut inode, b"child", 42, FT_DIR).unwrap();
		let err = add(&dev, &writer, &NullTrigger, &mut inode, b"child", 43, FT_DIR).unwrap_err();
		assert_eq!(err, LsfsError::Exist);

		let pool = BufferPool::new();
		let found = lookup(&dev, &pool, &inode, b"child").unwrap().unwrap();
		assert_eq!(found.ino, 42);
	}

	#[test]
	fn set_parent_rewrites_dotdot() {
		let (_tmp, dev) = test_dev();
		let writer = test_writer();
		let mut inode = DiskInode { ino: ROOT_INO, mode: libc::S_IFDIR, ..Default::default() };
		init(&dev, &writer, &NullTrigger, &mut inode, ROOT_INO, ROOT_INO).unwrap();

		set_parent(&dev, &writer, &NullTrigger, &mut inode, 99).unwrap();
		let pool = BufferPool::new();
		let dotdot = lookup(&dev, &pool, &inode, b"..").unwrap().unwrap();
		assert_eq!(dotdot.ino, 99);
	}

	#[test]
	fn add_extends_directory_past_direct_blocks() {
		let (_tmp, dev) = test_dev();
		let writer = test_writer();
		let pool = BufferPool::new();
		let mut inode = DiskInode { ino: ROOT_INO, mode: libc::S_IFDIR, ..Default::default() };
		init(&dev, &writer, &NullTrigger, &mut inode, ROOT_INO, ROOT_INO).unwrap();

		// Every `add` past the root's already-tiled first block claims a
		// whole fresh block (the tiling invariant for a newly grown
		// block), so a handful of entries is enough to outgrow the 12
		// direct block pointers and force single-indirect addressing.
		for i in 0..15u32 {
			let name = format!("f{i:02}");
			add(&dev, &writer, &NullTrigger, &mut inode, name.as_bytes(), i + 100, FT_DIR).unwrap();
		}
		assert!(inode.size > 12 * BLOCK_SIZE as u64);
		let found = lookup(&dev, &pool, &inode, b"f14").unwrap().unwrap();
		assert_eq!(found.ino, 114);
	}
}
