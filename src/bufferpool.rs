//! Buffer pool: a fixed-capacity, hash-indexed, LRU write-back cache over
//! [`BlockDevice`]. Used by metadata readers (directory block access); the
//! segment writer and the inode cache bypass it and talk to block I/O
//! directly.
//!
//! An index-and-arena LRU rather than an intrusive doubly-linked one: one
//! `Vec<Slot>`, plain `Option<usize>` links for the LRU, and separate
//! chaining by slot index for the hash buckets.

use std::sync::Mutex;

use crate::blockio::BlockDevice;
use crate::error::{LsfsError, Result};
use crate::ondisk::BLOCK_SIZE;

const POOL_SIZE: usize = 256;
const HASH_BUCKETS: usize = 64;

struct Slot {
	data: [u8; BLOCK_SIZE],
	block_num: u64,
	valid: bool,
	dirty: bool,
	refcount: u32,
	hash_next: Option<usize>,
	lru_prev: Option<usize>,
	lru_next: Option<usize>,
}

impl Slot {
	fn empty() -> Self {
		Self {
			data: [0u8; BLOCK_SIZE],
			block_num: 0,
			valid: false,
			dirty: false,
			refcount: 0,
			hash_next: None,
			lru_prev: None,
			lru_next: None,
		}
	}
}

struct Inner {
	slots: Vec<Slot>,
	hash: [Option<usize>; HASH_BUCKETS],
	lru_head: Option<usize>,
	lru_tail: Option<usize>,
}

fn bucket(block_num: u64) -> usize {
	(block_num % HASH_BUCKETS as u64) as usize
}

impl Inner {
	fn new() -> Self {
		let mut slots = Vec::with_capacity(POOL_SIZE);
		for _ in 0..POOL_SIZE {
			slots.push(Slot::empty());
		}
		let mut pool = Self { slots, hash: [None; HASH_BUCKETS], lru_head: None, lru_tail: None };
		for i in 0..POOL_SIZE {
			pool.lru_push_tail(i);
		}
		pool
	}

	fn lru_remove(&mut self, idx: usize) {
		let prev = self.slots[idx].lru_prev;
		let next = self.slots[idx].lru_next;
		match prev {
			Some(p) => self.slots[p].lru_next = next,
			None => self.lru_head = next,
		}
		match next {
			Some(n) => self.slots[n].lru_prev = prev,
			None => self.lru_tail = prev,
		}
		self.slots[idx].lru_prev = None;
		self.slots[idx].lru_next = None;
	}

	fn lru_push_tail(&mut self, idx: usize) {
		self.slots[idx].lru_prev = self.lru_tail;
		self.slots[idx].lru_next = None;
		if let Some(t) = self.lru_tail {
			self.slots[t].lru_next = Some(idx);
		} else {
			self.lru_head = Some(idx);
		}
		self.lru_tail = Some(idx);
	}

	fn touch(&mut self, idx: usize) {
		if self.lru_tail == Some(idx) {
			return;
		}
		self.lru_remove(idx);
		self.lru_push_tail(idx);
	}

	fn hash_insert(&mut self, idx: usize) {
		let b = bucket(self.slots[idx].block_num);
		self.slots[idx].hash_next = self.hash[b];
		self.hash[b] = Some(idx);
	}

	fn hash_remove(&mut self, idx: usize) {
		let b = bucket(self.slots[idx].block_num);
		let mut cur = self.hash[b];
		let mut prev: Option<usize> = None;
		while let Some(c) = cur {
			if c == idx {
				match prev {
					Some(p) => self.slots[p].hash_next = self.slots[c].hash_next,
					None => self.hash[b] = self.slots[c].hash_next,
				}
				return;
			}
			prev = Some(c);
			cur = self.slots[c].hash_next;
		}
	}

	fn find(&self, block_num: u64) -> Option<usize> {
		let mut cur = self.hash[bucket(block_num)];
		while let Some(c) = cur {
			if self.slots[c].valid && self.slots[c].block_num == block_num {
				return Some(c);
			}
			cur = self.slots[c].hash_next;
		}
		None
	}

	/// Evicts the least-recently-used unreferenced slot, writing it back
	/// first if dirty. Returns the freed slot index, or `None` if every
	/// slot is referenced.
	fn evict(&mut self, dev: &BlockDevice) -> Result<Option<usize>> {
		let mut cur = self.lru_head;
		while let Some(idx) = cur {
			if self.slots[idx].refcount == 0 {
				if self.slots[idx].valid && self.slots[idx].dirty {
					dev.write_block(self.slots[idx].block_num, &self.slots[idx].data)?;
				}
				if self.slots[idx].valid {
					self.hash_remove(idx);
				}
				self.slots[idx].valid = false;
				self.slots[idx].dirty = false;
				return Ok(Some(idx));
			}
			cur = self.slots[idx].lru_next;
		}
		Ok(None)
	}
}

pub struct BufferPool {
	inner: Mutex<Inner>,
}

impl BufferPool {
	pub fn new() -> Self {
		Self { inner: Mutex::new(Inner::new()) }
	}

	/// Reads the given block (through the cache), invokes `f` with its
	/// contents, and releases the reference. A cache miss evicts an
	/// unreferenced victim and reads from `dev`; failure to find one
	/// fails with [`LsfsError::NoMem`].
	pub fn with_block<R>(
		&self,
		dev: &BlockDevice,
		block_num: u64,
		f: impl FnOnce(&[u8; BLOCK_SIZE]) -> R,
	) -> Result<R> {
		let mut inner = self.inner.lock().unwrap();
		let idx = if let Some(idx) = inner.find(block_num) {
			inner.touch(idx);
			idx
		} else {
			let idx = match inner.evict(dev)? {
				Some(idx) => idx,
				None => return Err(LsfsError::NoMem),
			};
			drop(inner);
			let mut data = [0u8; BLOCK_SIZE];
			dev.read_block(block_num, &mut data)?;
			inner = self.inner.lock().unwrap();
			inner.slots[idx].data = data;
			inner.slots[idx].block_num = block_num;
			inner.slots[idx].valid = true;
			inner.slots[idx].dirty = false;
			inner.hash_insert(idx);
			inner.touch(idx);
			idx
		};
		inner.slots[idx].refcount += 1;
		let result = f(&inner.slots[idx].data);
		inner.slots[idx].refcount = inner.slots[idx].refcount.saturating_sub(1);
		Ok(result)
	}

	/// Like [`Self::with_block`], but allows `f` to mutate the buffer and
	/// marks it dirty afterward so a future eviction or [`Self::flush`]
	/// writes it back.
	pub fn with_block_mut<R>(
		&self,
		dev: &BlockDevice,
		block_num: u64,
		f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R,
	) -> Result<R> {
		let mut inner = self.inner.lock().unwrap();
		let idx = if let Some(idx) = inner.find(block_num) {
			inner.touch(idx);
			idx
		} else {
			let idx = match inner.evict(dev)? {
				Some(idx) => idx,
				None => return Err(LsfsError::NoMem),
			};
			drop(inner);
			let mut data = [0u8; BLOCK_SIZE];
			dev.read_block(block_num, &mut data)?;
			inner = self.inner.lock().unwrap();
			inner.slots[idx].data = data;
			inner.slots[idx].block_num = block_num;
			inner.slots[idx].valid = true;
			inner.slots[idx].dirty = false;
			inner.hash_insert(idx);
			inner.touch(idx);
			idx
		};
		inner.slots[idx].refcount += 1;
		let result = f(&mut inner.slots[idx].data);
		inner.slots[idx].dirty = true;
		inner.slots[idx].refcount = inner.slots[idx].refcount.saturating_sub(1);
		Ok(result)
	}

	/// Writes back every dirty, valid entry.
	pub fn flush(&self, dev: &BlockDevice) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		for i in 0..inner.slots.len() {
			if inner.slots[i].valid && inner.slots[i].dirty {
				dev.write_block(inner.slots[i].block_num, &inner.slots[i].data)?;
				inner.slots[i].dirty = false;
			}
		}
		Ok(())
	}

	/// Drops any cached copy of `block_num` without writing it back,
	/// used when the block's owner has rewritten it through a different
	/// path (e.g. the segment writer) and the pool's copy is now stale.
	pub fn invalidate(&self, block_num: u64) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(idx) = inner.find(block_num) {
			inner.hash_remove(idx);
			inner.slots[idx].valid = false;
			inner.slots[idx].dirty = false;
		}
	}
}

impl Default for BufferPool {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs::OpenOptions;
	use tempfile::NamedTempFile;

	fn dev_with_blocks(n: u64) -> (NamedTempFile, BlockDevice) {
		let tmp = NamedTempFile::new().unwrap();
		let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
		let mut dev = BlockDevice::open(file, false).unwrap();
		dev.set_total_blocks(n).unwrap();
		(tmp, dev)
	}

	#[test]
	fn write_then_read_round_trips_through_cache() {
		let (_tmp, dev) = dev_with_blocks(4);
		let pool = BufferPool::new();
		pool.with_block_mut(&dev, 1, |data| data[0..5].copy_from_slice(b"hello")).unwrap();
		let first_byte = pool.with_block(&dev, 1, |data| data[0]).unwrap();
		assert_eq!(first_byte, b'h');
	}

	#[test]
	fn flush_persists_dirty_blocks_to_device() {
		let (_tmp, dev) = dev_with_blocks(4);
		let pool = BufferPool::new();
		pool.with_block_mut(&dev, 2, |data| data[0] = 0x42).unwrap();
		pool.flush(&dev).unwrap();
		let mut raw = [0u8; BLOCK_SIZE];
		dev.read_block(2, &mut raw).unwrap();
		assert_eq!(raw[0], 0x42);
	}

	#[test]
	fn invalidate_drops_cached_copy_without_writeback() {
		let (_tmp, dev) = dev_with_blocks(4);
		let pool = BufferPool::new();
		pool.with_block_mut(&dev, 3, |data| data[0] = 0x99).unwrap();
		pool.invalidate(3);
		pool.flush(&dev).unwrap();
		let mut raw = [0u8; BLOCK_SIZE];
		dev.read_block(3, &mut raw).unwrap();
		assert_eq!(raw[0], 0, "invalidated block must not be written back");
	}

	#[test]
	fn eviction_writes_back_lru_victim_under_pressure() {
		let (_tmp, dev) = dev_with_blocks(POOL_SIZE as u64 + 2);
		let pool = BufferPool::new();
		for b in 0..POOL_SIZE as u64 {
			pool.with_block_mut(&dev, b, |data| data[0] = 0xcc).unwrap();
		}
		// Block 0 is now the least-recently-used entry; filling one more
		// distinct block evicts it and must write its dirty content back.
		pool.with_block_mut(&dev, POOL_SIZE as u64, |data| data[0] = 0xaa).unwrap();
		let mut raw = [0u8; BLOCK_SIZE];
		dev.read_block(0, &mut raw).unwrap();
		assert_eq!(raw[0], 0xcc);
	}
}
