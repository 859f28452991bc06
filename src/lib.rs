mod blockio;
mod bufferpool;
mod checkpoint;
mod cleaner;
pub mod cli;
mod core;
mod dir;
mod error;
mod format;
mod fsck;
mod imap;
mod inode;
mod ondisk;
mod segment;

pub use crate::blockio::BlockDevice;
pub use crate::core::{Attr, DirEntry, Lsfs};
pub use crate::error::{LsfsError, Result};
pub use crate::format::format_image;
pub use crate::fsck::{check_image, CheckReport, Finding};
pub use crate::ondisk::{BLOCK_SIZE, FT_DIR, FT_REG, FT_SYMLINK, FT_UNKNOWN, ROOT_INO};
