//! Block I/O: positional 4096-byte reads/writes over a file-backed image.
//!
//! Every other component in this crate addresses storage in block
//! numbers and goes through a `BlockDevice`; nothing else touches the
//! underlying `File` directly.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::{LsfsError, Result};
use crate::ondisk::BLOCK_SIZE;

pub struct BlockDevice {
	file: File,
	total_blocks: u64,
	readonly: bool,
}

impl BlockDevice {
	pub fn open(file: File, readonly: bool) -> Result<Self> {
		let len = file.metadata()?.len();
		let total_blocks = len / BLOCK_SIZE as u64;
		Ok(Self { file, total_blocks, readonly })
	}

	pub fn total_blocks(&self) -> u64 {
		self.total_blocks
	}

	pub fn readonly(&self) -> bool {
		self.readonly
	}

	fn check_range(&self, block: u64, count: u64) -> Result<()> {
		if block.checked_add(count).map_or(true, |end| end > self.total_blocks) {
			return Err(LsfsError::Io);
		}
		Ok(())
	}

	/// Reads exactly one 4096-byte block into `buf`.
	pub fn read_block(&self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
		self.check_range(block, 1)?;
		let n = self.file.read_at(buf, block * BLOCK_SIZE as u64)?;
		if n != BLOCK_SIZE {
			return Err(LsfsError::Io);
		}
		Ok(())
	}

	/// Writes exactly one 4096-byte block from `buf`.
	pub fn write_block(&self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
		if self.readonly {
			return Err(LsfsError::Io);
		}
		self.check_range(block, 1)?;
		let n = self.file.write_at(buf, block * BLOCK_SIZE as u64)?;
		if n != BLOCK_SIZE {
			return Err(LsfsError::Io);
		}
		Ok(())
	}

	/// Reads `count` contiguous blocks starting at `start` into `buf`,
	/// which must be exactly `count * BLOCK_SIZE` bytes.
	pub fn read_blocks(&self, start: u64, count: u64, buf: &mut [u8]) -> Result<()> {
		self.check_range(start, count)?;
		if buf.len() as u64 != count * BLOCK_SIZE as u64 {
			return Err(LsfsError::Inval);
		}
		let n = self.file.read_at(buf, start * BLOCK_SIZE as u64)?;
		if n != buf.len() {
			return Err(LsfsError::Io);
		}
		Ok(())
	}

	/// Writes `count` contiguous blocks starting at `start` from `buf`.
	pub fn write_blocks(&self, start: u64, count: u64, buf: &[u8]) -> Result<()> {
		if self.readonly {
			return Err(LsfsError::Io);
		}
		self.check_range(start, count)?;
		if buf.len() as u64 != count * BLOCK_SIZE as u64 {
			return Err(LsfsError::Inval);
		}
		let n = self.file.write_at(buf, start * BLOCK_SIZE as u64)?;
		if n != buf.len() {
			return Err(LsfsError::Io);
		}
		Ok(())
	}

	/// Synchronous flush of the backing file.
	pub fn sync(&self) -> Result<()> {
		self.file.sync_all()?;
		Ok(())
	}

	/// Grows the backing file to hold `total_blocks` blocks, used only by
	/// the format utility.
	pub fn set_total_blocks(&mut self, total_blocks: u64) -> Result<()> {
		self.file.set_len(total_blocks * BLOCK_SIZE as u64)?;
		self.total_blocks = total_blocks;
		Ok(())
	}
}
