//! Segment writer and segment table.
//!
//! The writer owns one in-memory active segment (4 MiB = 1024 blocks)
//! plus a parallel `block_info` sidecar; the table tracks the state and
//! live-block count of every segment on the image.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::blockio::BlockDevice;
use crate::error::{LsfsError, Result};
use crate::ondisk::{
	self, segment_to_block, BlockInfo, SegmentHeader, SegmentTableEntry, BLOCK_SIZE, LOG_START,
	SEGMENT_BLOCKS, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, SEGSTATE_ACTIVE, SEGSTATE_FREE,
	SEGSTATE_FULL, SUMMARY_CAPACITY,
};

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// `{segment id, state, live block count, last timestamp}` for every
/// segment on the image.
pub struct SegmentTable {
	entries: Mutex<Vec<SegmentTableEntry>>,
}

impl SegmentTable {
	pub fn new(total_segments: u32) -> Self {
		let entries = (0..total_segments)
			.map(|id| SegmentTableEntry { segment_id: id, state: SEGSTATE_FREE, reserved: [0; 3], live_blocks: 0, timestamp: 0 })
			.collect();
		Self { entries: Mutex::new(entries) }
	}

	pub fn from_entries(entries: Vec<SegmentTableEntry>) -> Self {
		Self { entries: Mutex::new(entries) }
	}

	pub fn free_count(&self) -> u32 {
		self.entries.lock().unwrap().iter().filter(|e| e.state == SEGSTATE_FREE).count() as u32
	}

	pub fn snapshot(&self) -> Vec<SegmentTableEntry> {
		self.entries.lock().unwrap().clone()
	}

	/// Linear scan for the first `free` entry, transitioning it to
	/// `active`. Fails with `nospc` when none exists.
	pub fn alloc_segment(&self) -> Result<u32> {
		let mut entries = self.entries.lock().unwrap();
		for e in entries.iter_mut() {
			if e.state == SEGSTATE_FREE {
				e.state = SEGSTATE_ACTIVE;
				return Ok(e.segment_id);
			}
		}
		Err(LsfsError::NoSpc)
	}

	pub fn mark_full(&self, segment_id: u32, live_blocks: u32, timestamp: u64) {
		let mut entries = self.entries.lock().unwrap();
		let e = &mut entries[segment_id as usize];
		e.state = SEGSTATE_FULL;
		e.live_blocks = live_blocks;
		e.timestamp = timestamp;
	}

	/// Decrements the owning segment's live-block counter, clamped at
	/// zero. Called on every overwrite or logical delete.
	pub fn mark_dead(&self, absolute_address: u64) {
		if absolute_address < LOG_START {
			return;
		}
		let segment_id = ondisk::block_to_segment(absolute_address);
		let mut entries = self.entries.lock().unwrap();
		if let Some(e) = entries.get_mut(segment_id as usize) {
			e.live_blocks = e.live_blocks.saturating_sub(1);
		}
	}

	pub fn with_entry_mut<R>(&self, segment_id: u32, f: impl FnOnce(&mut SegmentTableEntry) -> R) -> R {
		let mut entries = self.entries.lock().unwrap();
		f(&mut entries[segment_id as usize])
	}

	pub fn entry(&self, segment_id: u32) -> SegmentTableEntry {
		self.entries.lock().unwrap()[segment_id as usize]
	}

	pub fn set_state(&self, segment_id: u32, state: u8) {
		self.entries.lock().unwrap()[segment_id as usize].state = state;
	}

	/// Resets every segment still in state `active` back to `free`. Used
	/// right after recovery: an `active` entry in the recovered table was
	/// the writer's in-flight buffer at the last checkpoint, which lived
	/// only in memory and did not survive the crash, so whatever is on
	/// disk at that segment's blocks is unreferenced and safe to reuse.
	pub fn reclaim_stale_active(&self) {
		let mut entries = self.entries.lock().unwrap();
		for e in entries.iter_mut() {
			if e.state == SEGSTATE_ACTIVE {
				e.state = SEGSTATE_FREE;
				e.live_blocks = 0;
				e.timestamp = 0;
			}
		}
	}
}

struct Buffer {
	segment_id: u32,
	data: Vec<u8>,
	block_info: Vec<BlockInfo>,
	used: usize,
	/// Set once the buffer's contents have been written to disk but no
	/// replacement active segment could be allocated yet. A later flush
	/// call on a sealed buffer only retries allocation; it never
	/// rewrites already-committed data.
	sealed: bool,
}

impl Buffer {
	fn new(segment_id: u32) -> Self {
		Self {
			segment_id,
			data: vec![0u8; SEGMENT_BLOCKS as usize * BLOCK_SIZE],
			block_info: vec![BlockInfo::default(); SEGMENT_BLOCKS as usize - 1],
			used: 1,
			sealed: false,
		}
	}

	fn reset(&mut self, segment_id: u32) {
		self.segment_id = segment_id;
		self.data.iter_mut().for_each(|b| *b = 0);
		self.block_info.iter_mut().for_each(|b| *b = BlockInfo::default());
		self.used = 1;
		self.sealed = false;
	}
}

/// Signal for the background cleaner; a thin wrapper so `segment.rs`
/// doesn't need to know about `cleaner.rs`'s condvar internals.
pub trait CleanerTrigger: Send + Sync {
	fn trigger(&self);
}

pub struct SegmentWriter {
	buffer: Mutex<Buffer>,
	pub table: SegmentTable,
	/// Total data/metadata blocks appended over the writer's lifetime
	/// (the summary block itself is not counted). The checkpoint policy
	/// compares a snapshot of this against its own baseline to decide
	/// whether 100 log blocks have gone by since the last checkpoint.
	blocks_appended: std::sync::atomic::AtomicU64,
}

impl SegmentWriter {
	pub fn new(table: SegmentTable, initial_segment: u32) -> Self {
		Self {
			buffer: Mutex::new(Buffer::new(initial_segment)),
			table,
			blocks_appended: std::sync::atomic::AtomicU64::new(0),
		}
	}

	pub fn current_segment(&self) -> u32 {
		self.buffer.lock().unwrap().segment_id
	}

	/// Total blocks appended since this writer was constructed, used by
	/// the checkpoint policy's "100 log blocks" trigger.
	pub fn blocks_appended(&self) -> u64 {
		self.blocks_appended.load(std::sync::atomic::Ordering::Relaxed)
	}

	/// True if the buffer holds more than the reserved summary slot.
	pub fn has_pending(&self) -> bool {
		self.buffer.lock().unwrap().used > 1
	}

	/// Appends a 4096-byte payload, returning its published absolute
	/// block address. Flushes first once the buffer holds 1024 blocks.
	pub fn append(
		&self,
		dev: &BlockDevice,
		cleaner: &dyn CleanerTrigger,
		data: &[u8; BLOCK_SIZE],
		ino: u32,
		offset: u32,
		block_type: u8,
	) -> Result<u64> {
		loop {
			let mut buf = self.buffer.lock().unwrap();
			if buf.sealed || buf.used >= SEGMENT_BLOCKS as usize {
				drop(buf);
				self.flush(dev, cleaner)?;
				continue;
			}
			let slot = buf.used;
			let seg_id = buf.segment_id;
			let off = slot * BLOCK_SIZE;
			buf.data[off..off + BLOCK_SIZE].copy_from_slice(data);
			buf.block_info[slot - 1] = BlockInfo { ino, offset, block_type, reserved: [0; 3] };
			buf.used += 1;
			self.blocks_appended.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
			return Ok(segment_to_block(seg_id) + slot as u64);
		}
	}

	/// The commit point: writes the summary + used data blocks in one
	/// contiguous request, marks the segment full, advances the log
	/// head (via the returned new head), and allocates the next active
	/// segment, triggering the cleaner if none is free.
	///
	/// Returns `(old_segment_id, new_log_head)` so the caller (which owns
	/// the superblock) can update it and evaluate checkpoint policy.
	pub fn flush(&self, dev: &BlockDevice, cleaner: &dyn CleanerTrigger) -> Result<Option<(u32, u64)>> {
		let mut buf = self.buffer.lock().unwrap();
		if !buf.sealed {
			if buf.used <= 1 {
				return Ok(None);
			}
			let seg_id = buf.segment_id;
			let used = buf.used;
			let timestamp = now_secs();

			let header = SegmentHeader { magic: SEGMENT_MAGIC, segment_id: seg_id, timestamp, used_block_count: used as u32, checksum: 0 };
			let mut header_bytes = bincode::encode_to_vec(&header, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
			header_bytes.resize(SEGMENT_HEADER_SIZE, 0);
			buf.data[0..SEGMENT_HEADER_SIZE].copy_from_slice(&header_bytes);
			// The summary block can only describe as many data blocks as fit
			// after its header; entries beyond `SUMMARY_CAPACITY` are written
			// to disk as data but have no recorded owner/type (see
			// `ondisk::SUMMARY_CAPACITY`).
			let summary_count = (used - 1).min(SUMMARY_CAPACITY);
			let mut off = SEGMENT_HEADER_SIZE;
			for bi in &buf.block_info[0..summary_count] {
				let bytes = bincode::encode_to_vec(bi, ondisk::CODEC).map_err(|_| LsfsError::Corrupt)?;
				buf.data[off..off + bytes.len()].copy_from_slice(&bytes);
				off += bytes.len();
			}

			let seg_start = segment_to_block(seg_id);
			dev.write_blocks(seg_start, used as u64, &buf.data[0..used * BLOCK_SIZE])?;

			self.table.mark_full(seg_id, (used - 1) as u32, timestamp);
			buf.sealed = true;
		}

		let seg_id = buf.segment_id;
		let used = buf.used;
		let seg_start = segment_to_block(seg_id);
		let new_log_head = seg_start + used as u64;

		let new_segment = match self.table.alloc_segment() {
			Ok(id) => id,
			Err(_) => {
				cleaner.trigger();
				return Err(LsfsError::NoSpc);
			}
		};
		buf.reset(new_segment);

		Ok(Some((seg_id, new_log_head)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs::OpenOptions;
	use tempfile::NamedTempFile;

	struct NullTrigger;
	impl CleanerTrigger for NullTrigger {
		fn trigger(&self) {}
	}

	fn test_dev(segments: u32) -> (NamedTempFile, BlockDevice) {
		let tmp = NamedTempFile::new().unwrap();
		let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
		let mut dev = BlockDevice::open(file, false).unwrap();
		dev.set_total_blocks(LOG_START + segments as u64 * SEGMENT_BLOCKS).unwrap();
		(tmp, dev)
	}

	#[test]
	fn alloc_segment_exhausts_then_fails_nospc() {
		let table = SegmentTable::new(2);
		assert_eq!(table.free_count(), 2);
		let a = table.alloc_segment().unwrap();
		let b = table.alloc_segment().unwrap();
		assert_ne!(a, b);
		assert_eq!(table.free_count(), 0);
		assert_eq!(table.alloc_segment(), Err(LsfsError::NoSpc));
	}

	#[test]
	fn reclaim_stale_active_resets_only_active_segments() {
		let table = SegmentTable::new(3);
		table.alloc_segment().unwrap();
		table.mark_full(1, 5, 100);
		table.reclaim_stale_active();
		let snapshot = table.snapshot();
		assert_eq!(snapshot[0].state, SEGSTATE_FREE);
		assert_eq!(snapshot[1].state, SEGSTATE_FULL);
		assert_eq!(snapshot[2].state, SEGSTATE_FREE);
	}

	#[test]
	fn append_tracks_lifetime_block_count_and_flush_reopens_segment() {
		let (_tmp, dev) = test_dev(2);
		let table = SegmentTable::new(2);
		let seg = table.alloc_segment().unwrap();
		let writer = SegmentWriter::new(table, seg);
		assert_eq!(writer.blocks_appended(), 0);

		let data = [0x11u8; BLOCK_SIZE];
		writer.append(&dev, &NullTrigger, &data, 7, 0, ondisk::BLOCK_TYPE_DATA).unwrap();
		writer.append(&dev, &NullTrigger, &data, 7, 1, ondisk::BLOCK_TYPE_DATA).unwrap();
		assert_eq!(writer.blocks_appended(), 2);
		assert!(writer.has_pending());

		let (old_seg, _new_head) = writer.flush(&dev, &NullTrigger).unwrap().unwrap();
		assert_eq!(old_seg, seg);
		assert!(!writer.has_pending());
		assert_eq!(writer.table.snapshot()[old_seg as usize].state, SEGSTATE_FULL);
	}

	#[test]
	fn flush_triggers_cleaner_when_no_free_segment() {
		struct CountingTrigger(std::sync::atomic::AtomicU32);
		impl CleanerTrigger for CountingTrigger {
			fn trigger(&self) {
				self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			}
		}
		let (_tmp, dev) = test_dev(1);
		let table = SegmentTable::new(1);
		let seg = table.alloc_segment().unwrap();
		let writer = SegmentWriter::new(table, seg);
		let data = [0x22u8; BLOCK_SIZE];
		writer.append(&dev, &NullTrigger, &data, 1, 0, ondisk::BLOCK_TYPE_DATA).unwrap();

		let trigger = CountingTrigger(std::sync::atomic::AtomicU32::new(0));
		let err = writer.flush(&dev, &trigger).unwrap_err();
		assert_eq!(err, LsfsError::NoSpc);
		assert_eq!(trigger.0.load(std::sync::atomic::Ordering::SeqCst), 1);
	}
}
