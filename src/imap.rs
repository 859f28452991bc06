//! Inode map: a sorted, densely packed mapping from inode identifier to
//! the disk block holding its latest copy, plus a monotonic version
//! bumped on every relocation. Persisted as part of each checkpoint.

use std::sync::RwLock;

use crate::blockio::BlockDevice;
use crate::error::{LsfsError, Result};
use crate::ondisk::{self, ImapEntryOnDisk, BLOCK_SIZE, IMAP_ENTRY_SIZE, MAX_INODES, ROOT_INO};

#[derive(Debug, Clone, Copy)]
pub struct ImapEntry {
	pub ino: u32,
	pub version: u32,
	pub location: u64,
}

struct Inner {
	entries: Vec<ImapEntry>,
	next_ino: u32,
}

impl Inner {
	fn find(&self, ino: u32) -> std::result::Result<usize, usize> {
		self.entries.binary_search_by_key(&ino, |e| e.ino)
	}
}

/// The in-memory inode map. Wrapped in a single `RwLock` rather than a
/// hand-rolled reader/writer primitive; `get` takes a read lock, every
/// mutating operation takes a write lock.
pub struct InodeMap {
	inner: RwLock<Inner>,
}

impl InodeMap {
	pub fn new() -> Self {
		Self { inner: RwLock::new(Inner { entries: Vec::new(), next_ino: ROOT_INO + 1 }) }
	}

	pub fn get(&self, ino: u32) -> Result<(u64, u32)> {
		let inner = self.inner.read().unwrap();
		match inner.find(ino) {
			Ok(idx) => Ok((inner.entries[idx].location, inner.entries[idx].version)),
			Err(_) => Err(LsfsError::NoEnt),
		}
	}

	/// Updates `ino`'s location, bumping its version, or inserts a fresh
	/// entry at version 1.
	pub fn set(&self, ino: u32, location: u64) -> Result<()> {
		let mut inner = self.inner.write().unwrap();
		match inner.find(ino) {
			Ok(idx) => {
				inner.entries[idx].location = location;
				inner.entries[idx].version += 1;
			}
			Err(pos) => {
				if inner.entries.len() as u32 >= MAX_INODES {
					return Err(LsfsError::NoSpc);
				}
				inner.entries.insert(pos, ImapEntry { ino, version: 1, location });
			}
		}
		Ok(())
	}

	pub fn remove(&self, ino: u32) -> Result<()> {
		let mut inner = self.inner.write().unwrap();
		match inner.find(ino) {
			Ok(idx) => {
				inner.entries.remove(idx);
				Ok(())
			}
			Err(_) => Err(LsfsError::NoEnt),
		}
	}

	/// Returns the next monotonic identifier, or scans for the lowest
	/// free identifier above the root once the high-water mark reaches
	/// the 16-bit limit.
	pub fn alloc_identifier(&self) -> Result<u32> {
		let mut inner = self.inner.write().unwrap();
		if inner.next_ino < MAX_INODES {
			let ino = inner.next_ino;
			inner.next_ino += 1;
			return Ok(ino);
		}
		for candidate in (ROOT_INO + 1)..MAX_INODES {
			if inner.find(candidate).is_err() {
				return Ok(candidate);
			}
		}
		Err(LsfsError::NoSpc)
	}

	pub fn count(&self) -> u32 {
		self.inner.read().unwrap().entries.len() as u32
	}

	/// Copies the packed entries into consecutive blocks starting at
	/// `start_block`. Fails with `nospc` if the map no longer fits in the
	/// budget reserved for it within a checkpoint region.
	pub fn save(&self, dev: &BlockDevice, start_block: u64, max_blocks: u64) -> Result<u32> {
		let inner = self.inner.read().unwrap();
		let entries_per_block = (BLOCK_SIZE / IMAP_ENTRY_SIZE) as u32;
		let count = inner.entries.len() as u32;
		let blocks_needed = (count + entries_per_block - 1).max(1) / entries_per_block.max(1);
		let blocks_needed = if count == 0 { 0 } else { blocks_needed.max(1) };
		if blocks_needed as u64 > max_blocks {
			return Err(LsfsError::NoSpc);
		}
		let mut buf = vec![0u8; (blocks_needed as usize) * BLOCK_SIZE];
		for (i, e) in inner.entries.iter().enumerate() {
			let on_disk = ImapEntryOnDisk { ino: e.ino, version: e.version, location: e.location };
			let bytes = bincode::encode_to_vec(on_disk, ondisk::CODEC)
				.map_err(|_| LsfsError::Corrupt)?;
			let off = i * IMAP_ENTRY_SIZE;
			buf[off..off + IMAP_ENTRY_SIZE].copy_from_slice(&bytes);
		}
		if blocks_needed > 0 {
			dev.write_blocks(start_block, blocks_needed as u64, &buf)?;
		}
		Ok(count)
	}

	/// Loads `count` entries from consecutive blocks starting at
	/// `start_block`, replacing the current map and recomputing the
	/// high-water mark as `max(ino) + 1`.
	pub fn load(&self, dev: &BlockDevice, start_block: u64, count: u32) -> Result<()> {
		let entries_per_block = (BLOCK_SIZE / IMAP_ENTRY_SIZE) as u32;
		let blocks_needed = if count == 0 { 0 } else { (count + entries_per_block - 1) / entries_per_block };
		let mut buf = vec![0u8; (blocks_needed as usize) * BLOCK_SIZE];
		if blocks_needed > 0 {
			dev.read_blocks(start_block, blocks_needed as u64, &mut buf)?;
		}
		let mut entries = Vec::with_capacity(count as usize);
		for i in 0..count as usize {
			let off = i * IMAP_ENTRY_SIZE;
			let (on_disk, _): (ImapEntryOnDisk, usize) =
				bincode::decode_from_slice(&buf[off..off + IMAP_ENTRY_SIZE], ondisk::CODEC)
					.map_err(|_| LsfsError::Corrupt)?;
			entries.push(ImapEntry { ino: on_disk.ino, version: on_disk.version, location: on_disk.location });
		}
		let mut next_ino = ROOT_INO + 1;
		for e in &entries {
			if e.ino >= next_ino {
				next_ino = e.ino + 1;
			}
		}
		let mut inner = self.inner.write().unwrap();
		inner.entries = entries;
		inner.next_ino = next_ino;
		Ok(())
	}

	/// Snapshot of every `(ino, location)` pair, used by the cleaner and
	/// by recovery roll-forward.
	pub fn snapshot(&self) -> Vec<ImapEntry> {
		self.inner.read().unwrap().entries.clone()
	}
}

impl Default for InodeMap {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs::OpenOptions;
	use tempfile::NamedTempFile;

	#[test]
	fn set_then_get_round_trips() {
		let map = InodeMap::new();
		map.set(5, 1000).unwrap();
		let (loc, version) = map.get(5).unwrap();
		assert_eq!(loc, 1000);
		assert_eq!(version, 1);
	}

	#[test]
	fn set_again_bumps_version() {
		let map = InodeMap::new();
		map.set(5, 1000).unwrap();
		map.set(5, 2000).unwrap();
		let (loc, version) = map.get(5).unwrap();
		assert_eq!(loc, 2000);
		assert_eq!(version, 2);
	}

	#[test]
	fn get_missing_is_noent() {
		let map = InodeMap::new();
		assert_eq!(map.get(42), Err(LsfsError::NoEnt));
	}

	#[test]
	fn remove_drops_entry() {
		let map = InodeMap::new();
		map.set(5, 1000).unwrap();
		map.remove(5).unwrap();
		assert_eq!(map.get(5), Err(LsfsError::NoEnt));
		assert_eq!(map.remove(5), Err(LsfsError::NoEnt));
	}

	#[test]
	fn alloc_identifier_is_monotonic_then_scans_for_gaps() {
		let map = InodeMap::new();
		let a = map.alloc_identifier().unwrap();
		let b = map.alloc_identifier().unwrap();
		assert_eq!(b, a + 1);

		// Force the high-water mark to its ceiling; subsequent allocation
		// must fall back to scanning for the lowest free identifier.
		{
			let mut inner = map.inner.write().unwrap();
			inner.next_ino = MAX_INODES;
		}
		map.set(ROOT_INO + 1, 42).unwrap();
		let scanned = map.alloc_identifier().unwrap();
		assert_ne!(scanned, ROOT_INO + 1);
		assert!(scanned > ROOT_INO);
	}

	#[test]
	fn save_and_load_round_trip_through_device() {
		let tmp = NamedTempFile::new().unwrap();
		let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
		let mut dev = BlockDevice::open(file, false).unwrap();
		dev.set_total_blocks(16).unwrap();

		let map = InodeMap::new();
		map.set(ROOT_INO, 10).unwrap();
		map.set(ROOT_INO + 1, 20).unwrap();
		map.set(ROOT_INO + 2, 30).unwrap();
		let saved = map.save(&dev, 0, 16).unwrap();
		assert_eq!(saved, 3);

		let loaded = InodeMap::new();
		loaded.load(&dev, 0, saved).unwrap();
		assert_eq!(loaded.count(), 3);
		assert_eq!(loaded.get(ROOT_INO + 1).unwrap().0, 20);
	}
}
