//! Error taxonomy for the LSFS core.
//!
//! The reference C implementation returns small negative integers
//! (`LSFS_ERR_IO`, `LSFS_ERR_NOSPC`, ...) from every fallible call. This
//! port keeps the same closed set of discriminants but represents them as
//! a normal Rust enum so callers can match on them instead of comparing
//! magic numbers.

use std::fmt;
use std::io;

/// Stable error discriminants, one per `LSFS_ERR_*` constant in the
/// reference's `lsfs.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsfsError {
	/// Backing store read/write short or refused.
	Io,
	/// Allocation failure.
	NoMem,
	/// No free segment or inode identifier available.
	NoSpc,
	/// On-disk invariant violated (magic, identifier mismatch, no valid
	/// checkpoint, over-long segment).
	Corrupt,
	/// Name already exists in a directory.
	Exist,
	/// Name does not exist.
	NoEnt,
	/// Expected a directory, found something else.
	NotDir,
	/// Expected a non-directory, found a directory.
	IsDir,
	/// Directory is not empty.
	NotEmpty,
	/// Invalid argument.
	Inval,
}

pub type Result<T> = std::result::Result<T, LsfsError>;

impl fmt::Display for LsfsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			LsfsError::Io => "I/O error",
			LsfsError::NoMem => "out of memory",
			LsfsError::NoSpc => "no space left on device",
			LsfsError::Corrupt => "on-disk structure corrupt",
			LsfsError::Exist => "file exists",
			LsfsError::NoEnt => "no such file or directory",
			LsfsError::NotDir => "not a directory",
			LsfsError::IsDir => "is a directory",
			LsfsError::NotEmpty => "directory not empty",
			LsfsError::Inval => "invalid argument",
		};
		f.write_str(s)
	}
}

impl std::error::Error for LsfsError {}

impl From<io::Error> for LsfsError {
	fn from(_: io::Error) -> Self {
		LsfsError::Io
	}
}

impl LsfsError {
	/// Maps a core error to the errno the FUSE attachment layer should
	/// report back to the kernel.
	pub fn errno(self) -> libc::c_int {
		match self {
			LsfsError::Io => libc::EIO,
			LsfsError::NoMem => libc::ENOMEM,
			LsfsError::NoSpc => libc::ENOSPC,
			LsfsError::Corrupt => libc::EIO,
			LsfsError::Exist => libc::EEXIST,
			LsfsError::NoEnt => libc::ENOENT,
			LsfsError::NotDir => libc::ENOTDIR,
			LsfsError::IsDir => libc::EISDIR,
			LsfsError::NotEmpty => libc::ENOTEMPTY,
			LsfsError::Inval => libc::EINVAL,
		}
	}

	/// Converts this error into a `std::io::Error` carrying the matching
	/// raw OS error code, for boundaries (like `fuser`) that speak in
	/// terms of `io::Result`.
	pub fn into_io_error(self) -> io::Error {
		io::Error::from_raw_os_error(self.errno())
	}
}
