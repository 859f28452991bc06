//! Inode cache: a hash-and-LRU in-memory cache of decoded inodes, with
//! per-entry locking, reference counting, and write-back of dirty
//! entries through the segment writer. Also owns indirect-block address
//! resolution, since both live in the same lock-ordering tier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::blockio::BlockDevice;
use crate::error::{LsfsError, Result};
use crate::imap::InodeMap;
use crate::ondisk::{
	self, DiskInode, BLOCK_SIZE, BLOCK_TYPE_DATA, BLOCK_TYPE_INDIRECT, BLOCK_TYPE_INODE,
	DIRECT_BLOCKS, PTRS_PER_BLOCK,
};
use crate::segment::{CleanerTrigger, SegmentWriter};

const CACHE_CAPACITY: usize = 1024;

pub fn now_ns() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
}

/// A cached, decoded inode. Mutable fields are guarded by `lock`; the
/// reference count tracks outstanding [`InodeHandle`]s and gates both
/// eviction and (together with link count) destruction.
pub struct CacheEntry {
	pub ino: u32,
	pub lock: Mutex<DiskInode>,
	pub version: u32,
	pub dirty: std::sync::atomic::AtomicBool,
	refcount: std::sync::atomic::AtomicU32,
}

/// A reference-counted handle into the inode cache. Dropping the last
/// handle releases the reference; the entry itself survives in the
/// cache (and LRU) until evicted, keeping a freed-but-still-referenced
/// inode's blocks readable until the last handle goes away.
#[derive(Clone)]
pub struct InodeHandle {
	entry: Arc<CacheEntry>,
}

impl InodeHandle {
	pub fn ino(&self) -> u32 {
		self.entry.ino
	}

	pub fn with<R>(&self, f: impl FnOnce(&DiskInode) -> R) -> R {
		let guard = self.entry.lock.lock().unwrap();
		f(&guard)
	}

	pub fn with_mut<R>(&self, f: impl FnOnce(&mut DiskInode) -> R) -> R {
		let mut guard = self.entry.lock.lock().unwrap();
		let r = f(&mut guard);
		self.entry.dirty.store(true, std::sync::atomic::Ordering::SeqCst);
		r
	}

	pub fn is_dirty(&self) -> bool {
		self.entry.dirty.load(std::sync::atomic::Ordering::SeqCst)
	}
}

struct Inner {
	entries: HashMap<u32, Arc<CacheEntry>>,
	lru: Vec<u32>,
}

pub struct InodeCache {
	inner: Mutex<Inner>,
}

impl InodeCache {
	pub fn new() -> Self {
		Self { inner: Mutex::new(Inner { entries: HashMap::new(), lru: Vec::new() }) }
	}

	fn touch(inner: &mut Inner, ino: u32) {
		inner.lru.retain(|&x| x != ino);
		inner.lru.push(ino);
	}

	/// Evicts the least-recently-used entry with a zero reference count,
	/// writing it back first if dirty. A no-op if the cache has room or
	/// nothing is evictable.
	fn evict_if_needed(
		&self,
		dev: &BlockDevice,
		imap: &InodeMap,
		writer: &SegmentWriter,
		cleaner: &dyn CleanerTrigger,
	) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		if inner.entries.len() < CACHE_CAPACITY {
			return Ok(());
		}
		let victim = inner.lru.iter().find(|ino| {
			inner.entries.get(ino).map_or(false, |e| {
				e.refcount.load(std::sync::atomic::Ordering::SeqCst) == 0
			})
		}).copied();
		let Some(ino) = victim else { return Ok(()) };
		let entry = inner.entries.remove(&ino).unwrap();
		inner.lru.retain(|&x| x != ino);
		drop(inner);
		if entry.dirty.load(std::sync::atomic::Ordering::SeqCst) {
			let handle = InodeHandle { entry };
			write_back(dev, imap, writer, cleaner, &handle)?;
		}
		Ok(())
	}

	/// Hit updates LRU; miss reads the block at the inode map's location,
	/// extracts the `(ino mod 16)` slot, verifies identifier match, and
	/// installs a fresh entry.
	pub fn get(
		&self,
		dev: &BlockDevice,
		imap: &InodeMap,
		writer: &SegmentWriter,
		cleaner: &dyn CleanerTrigger,
		ino: u32,
	) -> Result<InodeHandle> {
		{
			let mut inner = self.inner.lock().unwrap();
			if let Some(entry) = inner.entries.get(&ino).cloned() {
				entry.refcount.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
				Self::touch(&mut inner, ino);
				return Ok(InodeHandle { entry });
			}
		}

		let (location, version) = imap.get(ino)?;
		let mut block = [0u8; BLOCK_SIZE];
		dev.read_block(location, &mut block)?;
		// Every inode is written back in a dedicated full block at offset 0
		// (see `write_back`), never packed several-per-block.
		let (disk_inode, _): (DiskInode, usize) =
			bincode::decode_from_slice(&block[0..ondisk::INODE_SIZE], ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
		if disk_inode.ino != ino {
			return Err(LsfsError::Corrupt);
		}

		self.evict_if_needed(dev, imap, writer, cleaner)?;

		let entry = Arc::new(CacheEntry {
			ino,
			lock: Mutex::new(disk_inode),
			version,
			dirty: std::sync::atomic::AtomicBool::new(false),
			refcount: std::sync::atomic::AtomicU32::new(1),
		});
		let mut inner = self.inner.lock().unwrap();
		inner.entries.insert(ino, entry.clone());
		Self::touch(&mut inner, ino);
		Ok(InodeHandle { entry })
	}

	pub fn put(&self, _handle: &InodeHandle) {
		_handle.entry.refcount.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
	}

	/// Obtains a new identifier from the inode map and installs a fresh,
	/// dirty cache entry for it.
	pub fn alloc(
		&self,
		dev: &BlockDevice,
		imap: &InodeMap,
		writer: &SegmentWriter,
		cleaner: &dyn CleanerTrigger,
		mode: u32,
		uid: u32,
		gid: u32,
	) -> Result<InodeHandle> {
		let ino = imap.alloc_identifier()?;
		self.evict_if_needed(dev, imap, writer, cleaner)?;
		let now = now_ns();
		let disk_inode = DiskInode {
			ino,
			mode,
			uid,
			gid,
			size: 0,
			blocks: 0,
			atime_ns: now,
			mtime_ns: now,
			ctime_ns: now,
			nlink: 1,
			flags: 0,
			generation: rand::random(),
			..Default::default()
		};
		let entry = Arc::new(CacheEntry {
			ino,
			lock: Mutex::new(disk_inode),
			version: 0,
			dirty: std::sync::atomic::AtomicBool::new(true),
			refcount: std::sync::atomic::AtomicU32::new(1),
		});
		let mut inner = self.inner.lock().unwrap();
		inner.entries.insert(ino, entry.clone());
		Self::touch(&mut inner, ino);
		Ok(InodeHandle { entry })
	}

	/// Marks every referenced block dead, removes the inode-map entry,
	/// and sets the deleted flag. The cache entry itself is left in
	/// place; the LRU reaps it once its last reference drops. Callers
	/// are responsible for reflecting the shrunk inode-map count into
	/// the superblock's in-use inode counter.
	pub fn free(&self, imap: &InodeMap, writer: &SegmentWriter, handle: &InodeHandle) -> Result<()> {
		handle.with_mut(|inode| {
			for d in inode.direct.iter() {
				if *d != 0 {
					writer.table.mark_dead(*d);
				}
			}
			if inode.indirect != 0 {
				writer.table.mark_dead(inode.indirect);
			}
			if inode.double_indirect != 0 {
				writer.table.mark_dead(inode.double_indirect);
			}
			let (location, _) = imap.get(inode.ino).unwrap_or((0, 0));
			if location != 0 {
				writer.table.mark_dead(location);
			}
			inode.flags |= ondisk::INODE_FLAG_DELETED;
		});
		let _ = imap.remove(handle.ino());
		// The inode map entry is gone; nothing must write this inode back
		// through the normal path anymore, or `write_back` would silently
		// resurrect a map entry for a freed identifier.
		handle.entry.dirty.store(false, std::sync::atomic::Ordering::SeqCst);
		Ok(())
	}

	/// Writes back every remaining dirty entry, used at unmount.
	pub fn flush_all(&self, dev: &BlockDevice, imap: &InodeMap, writer: &SegmentWriter, cleaner: &dyn CleanerTrigger) -> Result<()> {
		let handles: Vec<InodeHandle> = {
			let inner = self.inner.lock().unwrap();
			inner.entries.values().cloned().map(|entry| InodeHandle { entry }).collect()
		};
		for handle in handles {
			if handle.is_dirty() {
				write_back(dev, imap, writer, cleaner, &handle)?;
			}
		}
		Ok(())
	}
}

impl Default for InodeCache {
	fn default() -> Self {
		Self::new()
	}
}

/// Appends the 256-byte inode (in its own full 4096-byte block — other
/// 15 slots are zero), marks the previous location dead, updates the
/// inode map (bumping its version), and clears dirty.
pub fn write_back(
	dev: &BlockDevice,
	imap: &InodeMap,
	writer: &SegmentWriter,
	cleaner: &dyn CleanerTrigger,
	handle: &InodeHandle,
) -> Result<()> {
	let (ino, bytes, old_location) = handle.with(|inode| {
		let bytes = bincode::encode_to_vec(inode, ondisk::CODEC).unwrap();
		let old = imap.get(inode.ino).map(|(loc, _)| loc).unwrap_or(0);
		(inode.ino, bytes, old)
	});
	let mut block = [0u8; BLOCK_SIZE];
	block[0..bytes.len()].copy_from_slice(&bytes);
	let new_location = writer.append(dev, cleaner, &block, ino, 0, BLOCK_TYPE_INODE)?;
	if old_location != 0 {
		writer.table.mark_dead(old_location);
	}
	imap.set(ino, new_location)?;
	handle.entry.dirty.store(false, std::sync::atomic::Ordering::SeqCst);
	Ok(())
}

/// Resolves block index `b` of `inode` to an absolute block address,
/// reading through single/double indirect blocks as needed. Returns
/// `None` for a sparse hole (zero pointer anywhere along the chain).
pub fn resolve_block(dev: &BlockDevice, inode: &DiskInode, b: u64) -> Result<Option<u64>> {
	let p = PTRS_PER_BLOCK;
	if b < DIRECT_BLOCKS as u64 {
		let addr = inode.direct[b as usize];
		return Ok(if addr == 0 { None } else { Some(addr) });
	}
	let b = b - DIRECT_BLOCKS as u64;
	if b < p {
		if inode.indirect == 0 {
			return Ok(None);
		}
		return read_ptr(dev, inode.indirect, b);
	}
	let b = b - p;
	if b < p * p {
		if inode.double_indirect == 0 {
			return Ok(None);
		}
		let d_idx = b / p;
		let i_idx = b % p;
		let Some(l2) = read_ptr(dev, inode.double_indirect, d_idx)? else { return Ok(None) };
		return read_ptr(dev, l2, i_idx);
	}
	Err(LsfsError::Inval)
}

fn read_ptr(dev: &BlockDevice, block_addr: u64, idx: u64) -> Result<Option<u64>> {
	let mut block = [0u8; BLOCK_SIZE];
	dev.read_block(block_addr, &mut block)?;
	let off = (idx as usize) * 8;
	let ptr = u64::from_le_bytes(block[off..off + 8].try_into().unwrap());
	Ok(if ptr == 0 { None } else { Some(ptr) })
}

/// Reads the block at intra-file index `b`, zero-filling sparse holes.
pub fn read_block(dev: &BlockDevice, inode: &DiskInode, b: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
	match resolve_block(dev, inode, b)? {
		Some(addr) => dev.read_block(addr, buf),
		None => {
			buf.iter_mut().for_each(|x| *x = 0);
			Ok(())
		}
	}
}

/// Writes the block at intra-file index `b`. Direct and single-indirect
/// regions are fully supported (read-modify-write of the indirect
/// pointer block, marking the old one dead). Double-indirect writes are
/// not implemented — see SPEC_FULL.md §4.5 — and fail with `nospc` for
/// any index at or beyond `12 + 512`.
pub fn write_block(
	dev: &BlockDevice,
	writer: &SegmentWriter,
	cleaner: &dyn CleanerTrigger,
	inode: &mut DiskInode,
	b: u64,
	data: &[u8; BLOCK_SIZE],
) -> Result<()> {
	let p = PTRS_PER_BLOCK;
	if b < DIRECT_BLOCKS as u64 {
		let old = inode.direct[b as usize];
		let addr = writer.append(dev, cleaner, data, inode.ino, b as u32, BLOCK_TYPE_DATA)?;
		if old != 0 {
			writer.table.mark_dead(old);
		}
		inode.direct[b as usize] = addr;
		inode.blocks = inode.blocks.max(b + 1);
		return Ok(());
	}
	let ib = b - DIRECT_BLOCKS as u64;
	if ib < p {
		let mut ptrs = [0u8; BLOCK_SIZE];
		if inode.indirect != 0 {
			dev.read_block(inode.indirect, &mut ptrs)?;
		}
		let off = (ib as usize) * 8;
		let old_data_addr = u64::from_le_bytes(ptrs[off..off + 8].try_into().unwrap());

		let data_addr = writer.append(dev, cleaner, data, inode.ino, b as u32, BLOCK_TYPE_DATA)?;
		if old_data_addr != 0 {
			writer.table.mark_dead(old_data_addr);
		}
		ptrs[off..off + 8].copy_from_slice(&data_addr.to_le_bytes());

		let old_indirect = inode.indirect;
		let new_indirect = writer.append(dev, cleaner, &ptrs, inode.ino, 0, BLOCK_TYPE_INDIRECT)?;
		if old_indirect != 0 {
			writer.table.mark_dead(old_indirect);
		}
		inode.indirect = new_indirect;
		inode.blocks = inode.blocks.max(b + 1);
		return Ok(());
	}
	Err(LsfsError::NoSpc)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs::OpenOptions;
	use tempfile::NamedTempFile;

	use crate::segment::{CleanerTrigger, SegmentTable, SegmentWriter};

	struct NullTrigger;
	impl CleanerTrigger for NullTrigger {
		fn trigger(&self) {}
	}

	fn test_dev(segments: u32) -> (NamedTempFile, BlockDevice) {
		let tmp = NamedTempFile::new().unwrap();
		let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
		let mut dev = BlockDevice::open(file, false).unwrap();
		dev.set_total_blocks(ondisk::LOG_START + segments as u64 * ondisk::SEGMENT_BLOCKS).unwrap();
		(tmp, dev)
	}

	fn test_writer(segments: u32) -> SegmentWriter {
		let table = SegmentTable::new(segments);
		let first = table.alloc_segment().unwrap();
		SegmentWriter::new(table, first)
	}

	#[test]
	fn cache_get_after_write_back_round_trips() {
		let (_tmp, dev) = test_dev(2);
		let writer = test_writer(2);
		let imap = InodeMap::new();
		let cache = InodeCache::new();

		let handle = cache.alloc(&dev, &imap, &writer, &NullTrigger, libc::S_IFREG, 0, 0).unwrap();
		let ino = handle.ino();
		handle.with_mut(|inode| inode.size = 4096);
		write_back(&dev, &imap, &writer, &NullTrigger, &handle).unwrap();
		cache.put(&handle);

		// Still resident in the cache, so this is a hit, but it confirms
		// write_back left both the cache entry and the inode map consistent.
		let reloaded = cache.get(&dev, &imap, &writer, &NullTrigger, ino).unwrap();
		reloaded.with(|inode| {
			assert_eq!(inode.ino, ino);
			assert_eq!(inode.size, 4096);
		});
		cache.put(&reloaded);
	}

	#[test]
	fn free_marks_referenced_blocks_dead_and_removes_imap_entry() {
		let (_tmp, dev) = test_dev(2);
		let writer = test_writer(2);
		let imap = InodeMap::new();
		let cache = InodeCache::new();

		let handle = cache.alloc(&dev, &imap, &writer, &NullTrigger, libc::S_IFREG, 0, 0).unwrap();
		let data = [0u8; BLOCK_SIZE];
		handle.with_mut(|inode| write_block(&dev, &writer, &NullTrigger, inode, 0, &data).unwrap());
		let ino = handle.ino();
		write_back(&dev, &imap, &writer, &NullTrigger, &handle).unwrap();
		writer.flush(&dev, &NullTrigger).unwrap();

		let direct0 = handle.with(|inode| inode.direct[0]);
		let seg_of_block = |b: u64| ondisk::block_to_segment(b);
		let live_before = writer.table.entry(seg_of_block(direct0)).live_blocks;

		cache.free(&imap, &writer, &handle).unwrap();
		assert_eq!(imap.get(ino), Err(LsfsError::NoEnt));
		assert!(handle.with(|inode| inode.flags & ondisk::INODE_FLAG_DELETED != 0));

		// `free` marks both the data block and the inode's own on-disk
		// location dead; both landed in the same segment here, so the
		// live count drops by two.
		let live_after = writer.table.entry(seg_of_block(direct0)).live_blocks;
		assert_eq!(live_after, live_before - 2);
	}

	#[test]
	fn resolve_block_direct_and_sparse_hole() {
		let (_tmp, dev) = test_dev(2);
		let mut inode = DiskInode { ino: 1, mode: libc::S_IFREG, ..Default::default() };
		inode.direct[0] = 4096;
		assert_eq!(resolve_block(&dev, &inode, 0).unwrap(), Some(4096));
		assert_eq!(resolve_block(&dev, &inode, 1).unwrap(), None);
	}

	#[test]
	fn write_block_then_read_block_through_single_indirect() {
		let (_tmp, dev) = test_dev(4);
		let writer = test_writer(4);
		let mut inode = DiskInode { ino: 1, mode: libc::S_IFREG, ..Default::default() };

		let b = DIRECT_BLOCKS as u64 + 3;
		let mut data = [0u8; BLOCK_SIZE];
		data[0..4].copy_from_slice(b"abcd");
		write_block(&dev, &writer, &NullTrigger, &mut inode, b, &data).unwrap();
		assert_ne!(inode.indirect, 0);

		let mut readback = [0u8; BLOCK_SIZE];
		read_block(&dev, &inode, b, &mut readback).unwrap();
		assert_eq!(&readback[0..4], b"abcd");

		// A hole elsewhere in the same indirect block still reads zero.
		let mut hole = [0xffu8; BLOCK_SIZE];
		read_block(&dev, &inode, DIRECT_BLOCKS as u64 + 1, &mut hole).unwrap();
		assert_eq!(hole, [0u8; BLOCK_SIZE]);
	}

	#[test]
	fn write_block_beyond_double_indirect_capacity_fails_nospc() {
		let (_tmp, dev) = test_dev(2);
		let writer = test_writer(2);
		let mut inode = DiskInode { ino: 1, mode: libc::S_IFREG, ..Default::default() };
		let beyond = DIRECT_BLOCKS as u64 + PTRS_PER_BLOCK;
		let data = [0u8; BLOCK_SIZE];
		assert_eq!(write_block(&dev, &writer, &NullTrigger, &mut inode, beyond, &data), Err(LsfsError::NoSpc));
	}
}
