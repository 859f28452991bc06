//! Background cost-benefit segment cleaner.
//!
//! Runs on its own thread, woken either by a timed wait or by an
//! explicit trigger from [`crate::segment::SegmentWriter`] when it fails
//! to allocate a fresh active segment. Picks the segment with the
//! highest cost-benefit score, relocates every block still live, and
//! returns the segment to the free list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::blockio::BlockDevice;
use crate::bufferpool::BufferPool;
use crate::error::Result;
use crate::imap::InodeMap;
use crate::inode::InodeCache;
use crate::ondisk::{
	self, BlockInfo, SegmentHeader, BLOCK_SIZE, BLOCK_TYPE_DATA, BLOCK_TYPE_INDIRECT,
	BLOCK_TYPE_INODE, DIRECT_BLOCKS, SEGMENT_HEADER_SIZE, SEGSTATE_FULL, SUMMARY_CAPACITY,
};
use crate::segment::{CleanerTrigger, SegmentTable, SegmentWriter};

const WAIT_INTERVAL: Duration = Duration::from_secs(5);
/// A segment is skipped as a cleaning candidate once its utilization
/// reaches this fraction of its data capacity.
const CLEAN_THRESHOLD: f64 = 0.5;
/// The cleaner runs a pass once the free-segment ratio drops below this.
const LOW_WATER: f64 = 0.10;
/// ...and stops once the ratio climbs back up to this (or the per-pass
/// segment budget below is exhausted), whichever comes first.
const HIGH_WATER: f64 = 0.20;
/// Maximum segments reclaimed in a single pass, regardless of ratio.
const MAX_PER_PASS: u32 = 5;

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

struct Signal {
	woken: Mutex<bool>,
	condvar: Condvar,
}

pub struct Cleaner {
	signal: Arc<Signal>,
	shutdown: Arc<AtomicBool>,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanerTrigger for Cleaner {
	fn trigger(&self) {
		let mut woken = self.signal.woken.lock().unwrap();
		*woken = true;
		self.signal.condvar.notify_one();
	}
}

impl Cleaner {
	pub fn new() -> Self {
		Self {
			signal: Arc::new(Signal { woken: Mutex::new(false), condvar: Condvar::new() }),
			shutdown: Arc::new(AtomicBool::new(false)),
			handle: Mutex::new(None),
		}
	}

	/// Spawns the background thread. `dev`/`writer`/`imap`/`cache`/`pool`
	/// are shared with the rest of the mounted filesystem.
	pub fn start(
		&self,
		dev: Arc<BlockDevice>,
		writer: Arc<SegmentWriter>,
		imap: Arc<InodeMap>,
		cache: Arc<InodeCache>,
		pool: Arc<BufferPool>,
	) {
		let signal = self.signal.clone();
		let shutdown = self.shutdown.clone();
		let handle = std::thread::Builder::new()
			.name("lsfs-cleaner".into())
			.spawn(move || run(signal, shutdown, dev, writer, imap, cache, pool))
			.expect("failed to spawn cleaner thread");
		*self.handle.lock().unwrap() = Some(handle);
	}

	pub fn stop(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
		self.trigger();
		if let Some(handle) = self.handle.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}

impl Default for Cleaner {
	fn default() -> Self {
		Self::new()
	}
}

fn run(
	signal: Arc<Signal>,
	shutdown: Arc<AtomicBool>,
	dev: Arc<BlockDevice>,
	writer: Arc<SegmentWriter>,
	imap: Arc<InodeMap>,
	cache: Arc<InodeCache>,
	pool: Arc<BufferPool>,
) {
	loop {
		{
			let woken = signal.woken.lock().unwrap();
			let (mut woken, _) = signal.condvar.wait_timeout(woken, WAIT_INTERVAL).unwrap();
			*woken = false;
		}
		if shutdown.load(Ordering::SeqCst) {
			return;
		}
		if let Err(e) = clean_pass(&dev, &writer, &imap, &cache, &pool) {
			warn!("cleaner pass failed: {e}");
		}
	}
}

/// Cost-benefit score: `age * (1 - u) / (1 + u)`, where `u` is the
/// fraction of the segment's data blocks still live. Higher scores are
/// cleaned first — old, mostly-dead segments reclaim the most space for
/// the least copying.
fn score(live_blocks: u32, age_secs: u64) -> f64 {
	let capacity = (ondisk::SEGMENT_BLOCKS - 1) as f64;
	let u = (live_blocks as f64 / capacity).clamp(0.0, 1.0);
	let age = age_secs as f64;
	age * (1.0 - u) / (1.0 + u)
}

/// Picks the best cleaning candidate among full segments below the
/// utilization threshold, or returns `None` if nothing is worth
/// cleaning right now.
fn select_candidate(table: &SegmentTable) -> Option<u32> {
	let now = now_secs();
	let capacity = (ondisk::SEGMENT_BLOCKS - 1) as f64;
	// `fold` rather than `max_by` so that on a tied score the *first*
	// segment encountered (lowest id, since the table is indexed by id)
	// wins; `Iterator::max_by` would instead keep the *last* of equal
	// elements.
	table
		.snapshot()
		.into_iter()
		.filter(|e| e.state == SEGSTATE_FULL)
		.filter(|e| (e.live_blocks as f64 / capacity) < CLEAN_THRESHOLD)
		.map(|e| {
			let age = now.saturating_sub(e.timestamp);
			(e.segment_id, score(e.live_blocks, age))
		})
		.fold(None, |best: Option<(u32, f64)>, cand| match best {
			Some(b) if b.1 >= cand.1 => Some(b),
			_ => Some(cand),
		})
		.map(|(id, _)| id)
}

/// Runs while the free-segment ratio is below the low-water mark,
/// cleaning one segment at a time until the ratio recovers to the
/// high-water mark or the per-pass budget is spent, whichever is
/// first. A no-op (not even a ratio check) once there's nothing worth
/// cleaning, so an explicit wake from a failed allocation can't spin.
fn clean_pass(
	dev: &BlockDevice,
	writer: &SegmentWriter,
	imap: &InodeMap,
	cache: &InodeCache,
	pool: &BufferPool,
) -> Result<()> {
	let total = writer.table.snapshot().len() as f64;
	if total == 0.0 {
		return Ok(());
	}
	let ratio = |table: &SegmentTable| table.free_count() as f64 / total;
	if ratio(&writer.table) >= LOW_WATER {
		return Ok(());
	}
	for cleaned in 0..MAX_PER_PASS {
		if ratio(&writer.table) >= HIGH_WATER {
			break;
		}
		let Some(segment_id) = select_candidate(&writer.table) else {
			break;
		};
		clean_segment(dev, writer, imap, cache, pool, segment_id)?;
		debug!("cleaner: pass cleaned {}/{MAX_PER_PASS} segment(s) so far", cleaned + 1);
	}
	Ok(())
}

/// Relocates every still-live block out of `segment_id` and returns it
/// to the free list. A block is live when the structure that is
/// supposed to own it (an inode-map entry, or an inode's direct/indirect
/// pointer) still points at this exact address; anything else is
/// already-dead data the segment summary hasn't been updated to reflect
/// yet.
fn clean_segment(
	dev: &BlockDevice,
	writer: &SegmentWriter,
	imap: &InodeMap,
	cache: &InodeCache,
	pool: &BufferPool,
	segment_id: u32,
) -> Result<()> {
	let seg_start = ondisk::segment_to_block(segment_id);
	let mut header_block = [0u8; BLOCK_SIZE];
	dev.read_block(seg_start, &mut header_block)?;
	let (header, _): (SegmentHeader, usize) =
		bincode::decode_from_slice(&header_block, ondisk::CODEC)
			.map_err(|_| crate::error::LsfsError::Corrupt)?;
	let used = header.used_block_count as usize;
	let summary_count = (used.saturating_sub(1)).min(SUMMARY_CAPACITY);

	let mut infos = Vec::with_capacity(summary_count);
	let mut off = SEGMENT_HEADER_SIZE;
	for _ in 0..summary_count {
		let (bi, _): (BlockInfo, usize) =
			bincode::decode_from_slice(&header_block[off..], ondisk::CODEC)
				.map_err(|_| crate::error::LsfsError::Corrupt)?;
		infos.push(bi);
		off += ondisk::BLOCK_INFO_SIZE;
	}

	let mut relocated = 0u32;
	for (slot, info) in infos.iter().enumerate() {
		let addr = seg_start + 1 + slot as u64;
		if relocate_if_live(dev, writer, imap, cache, *info, addr)? {
			relocated += 1;
		}
	}
	debug!("cleaner: segment {segment_id} relocated {relocated}/{summary_count} blocks");

	writer.table.with_entry_mut(segment_id, |e| {
		e.state = ondisk::SEGSTATE_FREE;
		e.live_blocks = 0;
		e.timestamp = 0;
	});
	// The segment's physical blocks will be overwritten in place the next
	// time this segment is allocated active; drop any buffer-pool copies
	// now so a later reader never sees pre-reclaim content.
	for i in 0..ondisk::SEGMENT_BLOCKS {
		pool.invalidate(seg_start + i);
	}
	info!("cleaner: segment {segment_id} reclaimed");
	Ok(())
}

fn relocate_if_live(
	dev: &BlockDevice,
	writer: &SegmentWriter,
	imap: &InodeMap,
	cache: &InodeCache,
	info: BlockInfo,
	addr: u64,
) -> Result<bool> {
	match info.block_type {
		BLOCK_TYPE_INODE => {
			let Ok((location, _)) = imap.get(info.ino) else { return Ok(false) };
			if location != addr {
				return Ok(false);
			}
			let mut data = [0u8; BLOCK_SIZE];
			dev.read_block(addr, &mut data)?;
			let new_addr = writer.append(dev, &NullTrigger, &data, info.ino, info.offset, BLOCK_TYPE_INODE)?;
			imap.set(info.ino, new_addr)?;
			Ok(true)
		}
		BLOCK_TYPE_DATA => {
			let Ok((location, _)) = imap.get(info.ino) else { return Ok(false) };
			let mut inode_block = [0u8; BLOCK_SIZE];
			dev.read_block(location, &mut inode_block)?;
			// Inodes are written back one per dedicated block at offset 0.
			let (disk_inode, _): (ondisk::DiskInode, usize) =
				bincode::decode_from_slice(&inode_block[0..ondisk::INODE_SIZE], ondisk::CODEC)
					.map_err(|_| crate::error::LsfsError::Corrupt)?;
			let current = if (info.offset as usize) < DIRECT_BLOCKS {
				disk_inode.direct[info.offset as usize]
			} else {
				0
			};
			if current != addr {
				return Ok(false);
			}
			let mut data = [0u8; BLOCK_SIZE];
			dev.read_block(addr, &mut data)?;
			let new_addr = writer.append(dev, &NullTrigger, &data, info.ino, info.offset, BLOCK_TYPE_DATA)?;
			let handle = cache.get(dev, imap, writer, &NullTrigger, info.ino)?;
			handle.with_mut(|inode| {
				if (info.offset as usize) < DIRECT_BLOCKS {
					inode.direct[info.offset as usize] = new_addr;
				}
			});
			crate::inode::write_back(dev, imap, writer, &NullTrigger, &handle)?;
			cache.put(&handle);
			Ok(true)
		}
		BLOCK_TYPE_INDIRECT => {
			let Ok((location, _)) = imap.get(info.ino) else { return Ok(false) };
			let mut inode_block = [0u8; BLOCK_SIZE];
			dev.read_block(location, &mut inode_block)?;
			// Inodes are written back one per dedicated block at offset 0.
			let (disk_inode, _): (ondisk::DiskInode, usize) =
				bincode::decode_from_slice(&inode_block[0..ondisk::INODE_SIZE], ondisk::CODEC)
					.map_err(|_| crate::error::LsfsError::Corrupt)?;
			if disk_inode.indirect != addr {
				return Ok(false);
			}
			let mut data = [0u8; BLOCK_SIZE];
			dev.read_block(addr, &mut data)?;
			let new_addr = writer.append(dev, &NullTrigger, &data, info.ino, info.offset, BLOCK_TYPE_INDIRECT)?;
			let handle = cache.get(dev, imap, writer, &NullTrigger, info.ino)?;
			handle.with_mut(|inode| inode.indirect = new_addr);
			crate::inode::write_back(dev, imap, writer, &NullTrigger, &handle)?;
			cache.put(&handle);
			Ok(true)
		}
		_ => Ok(false),
	}
}

/// A cleaner that relocates blocks must never itself be the trigger for
/// another cleaning pass; it runs to completion instead of recursing.
struct NullTrigger;
impl CleanerTrigger for NullTrigger {
	fn trigger(&self) {}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::format::format_image;
	use std::fs::OpenOptions;
	use tempfile::NamedTempFile;

	#[test]
	fn score_prefers_older_emptier_segments() {
		// Same age, lower utilization scores higher.
		assert!(score(10, 100) > score(500, 100));
		// Same utilization, older scores higher.
		assert!(score(10, 1000) > score(10, 100));
	}

	#[test]
	fn select_candidate_ties_favor_lowest_segment_id() {
		let table = SegmentTable::new(4);
		let now = now_secs();
		table.mark_full(0, 10, now - 500);
		table.mark_full(1, 10, now - 500);
		assert_eq!(select_candidate(&table), Some(0));
	}

	#[test]
	fn select_candidate_skips_above_threshold_utilization() {
		let table = SegmentTable::new(4);
		let capacity = (ondisk::SEGMENT_BLOCKS - 1) as f64;
		let nearly_full = (capacity * 0.9) as u32;
		table.mark_full(0, nearly_full, now_secs() - 10_000);
		assert_eq!(select_candidate(&table), None);
	}

	#[test]
	fn clean_pass_relocates_live_blocks_and_frees_segment() {
		// A 20-segment image so the free-segment ratio can be pushed below
		// the cleaner's low-water mark by marking most segments busy.
		let tmp = NamedTempFile::new().unwrap();
		format_image(tmp.path(), 80).unwrap();
		let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
		let dev = BlockDevice::open(file, false).unwrap();

		let imap = InodeMap::new();
		let recovered = crate::checkpoint::recover(&dev, &imap).unwrap();
		let (location, _) = imap.get(ondisk::ROOT_INO).unwrap();
		let table = SegmentTable::from_entries(recovered.segtable_entries);
		let total = table.snapshot().len() as u32;
		assert_eq!(total, 20);

		// Segment 0 (holding the root inode) is old and sparsely used: the
		// best cleaning candidate. Segments 1..=17 are busy and recent, so
		// they're both excluded from candidacy and eat into the free ratio.
		table.with_entry_mut(0, |e| e.timestamp = now_secs() - 10_000);
		let busy_blocks = ((ondisk::SEGMENT_BLOCKS - 1) as f64 * 0.9) as u32;
		for id in 1..=17 {
			table.with_entry_mut(id, |e| {
				e.state = ondisk::SEGSTATE_FULL;
				e.live_blocks = busy_blocks;
				e.timestamp = now_secs();
			});
		}
		let free_id = table.alloc_segment().unwrap();
		let writer = SegmentWriter::new(table, free_id);
		let cache = InodeCache::new();
		let pool = BufferPool::new();

		clean_pass(&dev, &writer, &imap, &cache, &pool).unwrap();

		// Segment 0 should be free again and the root inode relocated
		// elsewhere since it was the only live block referencing it.
		let snapshot = writer.table.snapshot();
		assert_eq!(snapshot[0].state, ondisk::SEGSTATE_FREE);
		let (new_location, _) = imap.get(ondisk::ROOT_INO).unwrap();
		assert_ne!(new_location, location);
	}
}
