//! On-disk records of a ROFS image, all little-endian.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use super::{RofsError, BLOCK_SIZE, ROFS_MAGIC, ROFS_VERSION};

/// Block 0 of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SuperBlock {
    pub magic: u64,
    pub version: u64,
    pub block_size: u64,
    pub structure_info_first_block: u64,
    pub structure_info_blocks_count: u64,
    pub directory_entries_count: u64,
    pub symlinks_count: u64,
    pub inodes_count: u64,
}

impl SuperBlock {
    pub fn new() -> Self {
        Self {
            magic: ROFS_MAGIC,
            version: ROFS_VERSION,
            block_size: BLOCK_SIZE as u64,
            ..Default::default()
        }
    }

    /// Encode into a full, zero-padded block.
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        let fields = [
            self.magic,
            self.version,
            self.block_size,
            self.structure_info_first_block,
            self.structure_info_blocks_count,
            self.directory_entries_count,
            self.symlinks_count,
            self.inodes_count,
        ];
        for (chunk, v) in block.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        block
    }

    /// Decode and validate a superblock.
    pub fn decode(mut r: impl Read) -> color_eyre::Result<Self> {
        let sb = Self {
            magic: r.read_u64::<LittleEndian>()?,
            version: r.read_u64::<LittleEndian>()?,
            block_size: r.read_u64::<LittleEndian>()?,
            structure_info_first_block: r.read_u64::<LittleEndian>()?,
            structure_info_blocks_count: r.read_u64::<LittleEndian>()?,
            directory_entries_count: r.read_u64::<LittleEndian>()?,
            symlinks_count: r.read_u64::<LittleEndian>()?,
            inodes_count: r.read_u64::<LittleEndian>()?,
        };
        if sb.magic != ROFS_MAGIC {
            return Err(RofsError::BadMagic(sb.magic).into());
        }
        if sb.version != ROFS_VERSION {
            return Err(RofsError::UnsupportedVersion(sb.version).into());
        }
        if sb.block_size != BLOCK_SIZE as u64 {
            return Err(RofsError::UnsupportedBlockSize(sb.block_size).into());
        }
        Ok(sb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub mode: u64,
    pub number: u64,
    /// First data block for files, index of the first child entry for
    /// directories, index into the symlink table for symlinks.
    pub data_offset: u64,
    /// Byte length for files, child count for directories, 1 for symlinks.
    pub count: u64,
}

impl Inode {
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.mode)?;
        w.write_u64::<LittleEndian>(self.number)?;
        w.write_u64::<LittleEndian>(self.data_offset)?;
        w.write_u64::<LittleEndian>(self.count)
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            mode: r.read_u64::<LittleEndian>()?,
            number: r.read_u64::<LittleEndian>()?,
            data_offset: r.read_u64::<LittleEndian>()?,
            count: r.read_u64::<LittleEndian>()?,
        })
    }
}

fn check_len(bytes: &[u8]) -> Result<u16, RofsError> {
    u16::try_from(bytes.len()).map_err(|_| RofsError::NameTooLong { len: bytes.len() })
}

fn read_prefixed(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = r.read_u16::<LittleEndian>()?;
    let mut buf = vec![0u8; len.into()];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// A named link from a directory to an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u64,
    name: Vec<u8>,
}

impl DirEntry {
    pub fn new(inode: u64, name: &[u8]) -> Result<Self, RofsError> {
        check_len(name)?;
        Ok(Self {
            inode,
            name: name.to_vec(),
        })
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.inode)?;
        // Length checked in new()
        w.write_u16::<LittleEndian>(self.name.len() as u16)?;
        w.write_all(&self.name)
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<Self> {
        let inode = r.read_u64::<LittleEndian>()?;
        Ok(Self {
            inode,
            name: read_prefixed(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symlink {
    target: Vec<u8>,
}

impl Symlink {
    pub fn new(target: &[u8]) -> Result<Self, RofsError> {
        check_len(target)?;
        Ok(Self {
            target: target.to_vec(),
        })
    }

    pub fn target(&self) -> &[u8] {
        &self.target
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u16::<LittleEndian>(self.target.len() as u16)?;
        w.write_all(&self.target)
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            target: read_prefixed(r)?,
        })
    }
}

/// Number of blocks needed to hold `len` bytes.
pub fn blocks_for(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE as u64)
}
