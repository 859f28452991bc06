use std::{
	ffi::{c_int, OsStr},
	os::unix::ffi::OsStrExt,
	path::Path,
	sync::atomic::{AtomicBool, Ordering},
	time::{Duration, SystemTime},
};

use fuser::{
	FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
	ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use lsfs::{Attr, LsfsError, Lsfs, Result};

const MAX_CACHE: Duration = Duration::MAX;

fn run<T>(f: impl FnOnce() -> Result<T>) -> std::result::Result<T, c_int> {
	f().map_err(|e| {
		if e != LsfsError::NoEnt {
			log::error!("error: {e}");
		}
		e.errno()
	})
}

fn time_or_now(t: Option<TimeOrNow>) -> Option<u64> {
	t.map(|t| match t {
		TimeOrNow::SpecificTime(t) => t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_nanos() as u64,
		TimeOrNow::Now => SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_nanos() as u64,
	})
}

fn as_fileattr(attr: &Attr) -> FileAttr {
	let kind = match attr.mode & libc::S_IFMT {
		libc::S_IFDIR => FileType::Directory,
		libc::S_IFLNK => FileType::Symlink,
		_ => FileType::RegularFile,
	};
	let epoch = |ns: u64| SystemTime::UNIX_EPOCH + Duration::from_nanos(ns);
	FileAttr {
		ino: attr.ino as u64,
		size: attr.size,
		blocks: attr.blocks,
		atime: epoch(attr.atime_ns),
		mtime: epoch(attr.mtime_ns),
		ctime: epoch(attr.ctime_ns),
		crtime: epoch(attr.ctime_ns),
		kind,
		perm: (attr.mode & 0o7777) as u16,
		nlink: attr.nlink,
		uid: attr.uid,
		gid: attr.gid,
		rdev: 0,
		blksize: lsfs::BLOCK_SIZE as u32,
		flags: 0,
	}
}

pub struct Fs {
	lsfs: Lsfs,
	unmounted: AtomicBool,
}

impl Fs {
	pub fn new(lsfs: Lsfs) -> Self {
		Self { lsfs, unmounted: AtomicBool::new(false) }
	}

	/// Runs teardown exactly once no matter which path gets there first:
	/// the kernel's `destroy` request on a clean `fusermount -u`, or this
	/// struct's own `Drop` on any other exit from the mount loop.
	fn unmount_once(&self) {
		if self.unmounted.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Err(e) = self.lsfs.unmount() {
			log::error!("error during unmount: {e}");
		}
	}
}

impl Drop for Fs {
	fn drop(&mut self) {
		self.unmount_once();
	}
}

impl Filesystem for Fs {
	fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
		Ok(())
	}

	fn destroy(&mut self) {
		self.unmount_once();
	}

	fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
		match run(|| self.lsfs.lookup(parent as u32, name.as_encoded_bytes())) {
			Ok(attr) => reply.entry(&Duration::ZERO, &as_fileattr(&attr), attr.generation),
			Err(e) => reply.error(e),
		}
	}

	fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
		match run(|| self.lsfs.getattr(ino as u32)) {
			Ok(attr) => reply.attr(&MAX_CACHE, &as_fileattr(&attr)),
			Err(e) => reply.error(e),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn setattr(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		mode: Option<u32>,
		uid: Option<u32>,
		gid: Option<u32>,
		size: Option<u64>,
		atime: Option<TimeOrNow>,
		mtime: Option<TimeOrNow>,
		_ctime: Option<SystemTime>,
		_fh: Option<u64>,
		_crtime: Option<SystemTime>,
		_chgtime: Option<SystemTime>,
		_bkuptime: Option<SystemTime>,
		_flags: Option<u32>,
		reply: ReplyAttr,
	) {
		let atime_ns = time_or_now(atime);
		let mtime_ns = time_or_now(mtime);
		match run(|| self.lsfs.setattr(ino as u32, size, mode, uid, gid, atime_ns, mtime_ns)) {
			Ok(attr) => reply.attr(&MAX_CACHE, &as_fileattr(&attr)),
			Err(e) => reply.error(e),
		}
	}

	fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
		reply.opened(0, 0);
	}

	fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
		reply.opened(0, 0);
	}

	fn read(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyData,
	) {
		let f = || {
			let mut buf = vec![0u8; size as usize];
			let n = self.lsfs.read(ino as u32, offset as u64, &mut buf)?;
			buf.truncate(n);
			Ok(buf)
		};
		match run(f) {
			Ok(buf) => reply.data(&buf),
			Err(e) => reply.error(e),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn write(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		data: &[u8],
		_write_flags: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyWrite,
	) {
		match run(|| self.lsfs.write(ino as u32, offset as u64, data)) {
			Ok(n) => reply.written(n as u32),
			Err(e) => reply.error(e),
		}
	}

	// The core's directory cursor is a (block, in-block-offset) pair, not
	// a flat index, so it doesn't round-trip through FUSE's single `i64`
	// resume offset. Every call re-walks from the start and skips the
	// entries already handed to the kernel; directories are small enough
	// (single-digit to low-hundreds of entries) that this is cheap.
	fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
		let f = || self.lsfs.readdir(ino as u32, (0, 0), usize::MAX);
		match run(f) {
			Ok((entries, _)) => {
				for (i, entry) in entries.into_iter().enumerate().skip(offset as usize) {
					let kind = match entry.file_type {
						lsfs::FT_DIR => FileType::Directory,
						lsfs::FT_SYMLINK => FileType::Symlink,
						_ => FileType::RegularFile,
					};
					let full = reply.add(entry.ino as u64, (i + 1) as i64, kind, OsStr::from_bytes(&entry.name));
					if full {
						break;
					}
				}
				reply.ok();
			}
			Err(e) => reply.error(e),
		}
	}

	fn create(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		umask: u32,
		_flags: i32,
		reply: ReplyCreate,
	) {
		let mode = mode & !umask;
		match run(|| self.lsfs.create(parent as u32, name.as_encoded_bytes(), mode, req.uid(), req.gid())) {
			Ok(attr) => reply.created(&Duration::ZERO, &as_fileattr(&attr), attr.generation, 0, 0),
			Err(e) => reply.error(e),
		}
	}

	fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
		let mode = mode & !umask;
		match run(|| self.lsfs.mkdir(parent as u32, name.as_encoded_bytes(), mode, req.uid(), req.gid())) {
			Ok(attr) => reply.entry(&Duration::ZERO, &as_fileattr(&attr), attr.generation),
			Err(e) => reply.error(e),
		}
	}

	fn symlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, target: &Path, reply: ReplyEntry) {
		let target = target.as_os_str().as_encoded_bytes();
		match run(|| self.lsfs.symlink(parent as u32, name.as_encoded_bytes(), target, req.uid(), req.gid())) {
			Ok(attr) => reply.entry(&Duration::ZERO, &as_fileattr(&attr), attr.generation),
			Err(e) => reply.error(e),
		}
	}

	fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
		match run(|| self.lsfs.readlink(ino as u32)) {
			Ok(target) => reply.data(&target),
			Err(e) => reply.error(e),
		}
	}

	fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		match run(|| self.lsfs.unlink(parent as u32, name.as_encoded_bytes())) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		match run(|| self.lsfs.rmdir(parent as u32, name.as_encoded_bytes())) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn rename(
		&mut self,
		_req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		newparent: u64,
		newname: &OsStr,
		_flags: u32,
		reply: ReplyEmpty,
	) {
		let f = || {
			self.lsfs.rename(
				parent as u32,
				name.as_encoded_bytes(),
				newparent as u32,
				newname.as_encoded_bytes(),
			)
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
		let (total_blocks, free_blocks, files) = self.lsfs.statfs();
		reply.statfs(total_blocks, free_blocks, free_blocks, files as u64, 0, lsfs::BLOCK_SIZE as u32, 255, lsfs::BLOCK_SIZE as u32);
	}

	fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
		match run(|| self.lsfs.fsync(ino as u32)) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}
}
