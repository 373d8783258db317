//! Read-only filesystem (ROFS) images
//!
//! A ROFS image is a flat file of 512-byte blocks: a superblock at block 0,
//! file contents from block 1 on, and a trailing "structure info" region
//! holding the directory-entry, symlink and inode tables.

use std::path::PathBuf;

pub mod builder;
pub mod layout;
pub mod reader;

pub use builder::MkfsOpts;
pub use reader::InspectOpts;

pub const BLOCK_SIZE: usize = 512;
pub const ROFS_MAGIC: u64 = 0xDEAD_BEAD;
pub const ROFS_VERSION: u64 = 1;

pub const MODE_DIR: u64 = 0x4000;
pub const MODE_REGULAR: u64 = 0x8000;
pub const MODE_SYMLINK: u64 = 0xA000;

/// Structural problems with a tree being packed or an image being read.
#[derive(Debug, thiserror::Error)]
pub enum RofsError {
    #[error("name is {len} bytes, longer than the {max} bytes ROFS can store", max = u16::MAX)]
    NameTooLong { len: usize },
    #[error("{}: unsupported file type (only regular files, directories and symlinks)", .0.display())]
    UnsupportedFileType(PathBuf),
    #[error("not a ROFS image: bad magic {0:#x}")]
    BadMagic(u64),
    #[error("unsupported ROFS version {0}")]
    UnsupportedVersion(u64),
    #[error("unsupported ROFS block size {0}")]
    UnsupportedBlockSize(u64),
    #[error("corrupt ROFS image: {0}")]
    Corrupt(String),
}
