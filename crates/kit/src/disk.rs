//! Sector-level editing of disk images
//!
//! NBD only moves whole sectors around, so arbitrary byte ranges are
//! patched with a read-modify-write of the smallest sector-aligned range
//! containing them. On top of that, this module knows two structures a
//! bootloader reads straight off the disk:
//!
//! - the MBR partition table in sector 0 (entries at `0x1BE + 16 * (n - 1)`)
//! - the kernel command line block, starting at sector 1 (byte 512)
//!
//! The image-path entry points ([`set_partition`], [`set_cmdline`]) export
//! the image with a private `qemu-nbd`, apply the edit, disconnect and reap
//! the server.

use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::nbd::{NbdServer, NbdServerOpts, Session};
use crate::utils;

pub const SECTOR_SIZE: u64 = 512;
pub const PARTITION_TABLE_OFFSET: u64 = 0x1BE;
pub const PARTITION_ENTRY_SIZE: u64 = 16;
/// Linux native partition type.
pub const LINUX_PARTITION_TYPE: u8 = 0x83;
pub const CMDLINE_OFFSET: u64 = SECTOR_SIZE;

const SECTORS_PER_TRACK: u64 = 63;
const HEADS_PER_CYLINDER: u64 = 255;
const MAX_CYLINDER: u64 = 1023;

/// Sector-granular storage the editor patches.
pub trait BlockDevice {
    /// Read `len` bytes at `offset`. Both are sector aligned.
    fn read_at(&mut self, offset: u64, len: u32) -> Result<Vec<u8>>;
    /// Write `data` at `offset`. Both are sector aligned.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

impl<S: Read + Write> BlockDevice for Session<S> {
    fn read_at(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        Ok(self.read(offset, len)?)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        Ok(self.write(offset, data)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(Session::flush(self)?)
    }
}

/// Cylinder/head/sector address as stored in an MBR partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Chs {
    pub cylinder: u16,
    pub head: u8,
    pub sector: u8,
}

impl Chs {
    /// The largest address CHS can express; everything beyond clamps to it.
    pub const MAX: Chs = Chs {
        cylinder: MAX_CYLINDER as u16,
        head: (HEADS_PER_CYLINDER - 1) as u8,
        sector: SECTORS_PER_TRACK as u8,
    };

    /// Convert an LBA sector number using the classic 255 heads, 63 sectors
    /// per track geometry.
    pub fn from_lba(lba: u64) -> Self {
        let cylinder = (lba / SECTORS_PER_TRACK) / HEADS_PER_CYLINDER;
        if cylinder > MAX_CYLINDER {
            return Self::MAX;
        }
        Self {
            cylinder: cylinder as u16,
            head: ((lba / SECTORS_PER_TRACK) % HEADS_PER_CYLINDER) as u8,
            sector: ((lba % SECTORS_PER_TRACK) + 1) as u8,
        }
    }

    /// Cylinder and sector packed as `cylinder << 6 | sector`.
    pub fn packed(&self) -> u16 {
        (self.cylinder << 6) | u16::from(self.sector)
    }

    pub fn from_packed(head: u8, packed: u16) -> Self {
        Self {
            cylinder: packed >> 6,
            head,
            sector: (packed & 0x3f) as u8,
        }
    }
}

/// A decoded 16-byte MBR partition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub boot_indicator: u8,
    pub start: Chs,
    pub partition_type: u8,
    pub end: Chs,
    pub start_lba: u32,
    pub sectors: u32,
}

impl PartitionEntry {
    pub fn decode(raw: &[u8; PARTITION_ENTRY_SIZE as usize]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            boot_indicator: raw[0],
            start: Chs::from_packed(raw[1], u16_at(2)),
            partition_type: raw[4],
            end: Chs::from_packed(raw[5], u16_at(6)),
            start_lba: u32_at(8),
            sectors: u32_at(12),
        }
    }
}

fn partition_offset(index: u8) -> Result<u64> {
    if !(1..=4).contains(&index) {
        return Err(eyre!("Partition index must be between 1 and 4, got {index}"));
    }
    Ok(PARTITION_TABLE_OFFSET + u64::from(index - 1) * PARTITION_ENTRY_SIZE)
}

fn sectors_u32(bytes: u64, what: &str) -> Result<u32> {
    u32::try_from(bytes / SECTOR_SIZE)
        .map_err(|_| eyre!("Partition {what} of {bytes} bytes exceeds the MBR 32-bit sector limit"))
}

/// Validate a partition request without touching any disk.
pub fn validate_partition(index: u8, start: u64, size: u64) -> Result<()> {
    partition_offset(index)?;
    sectors_u32(start, "start")?;
    sectors_u32(size, "size")?;
    start
        .checked_add(size)
        .ok_or_else(|| eyre!("Partition end overflows 64 bits"))?;
    Ok(())
}

/// Byte-addressable editing on top of a [`BlockDevice`].
#[derive(Debug)]
pub struct DiskEditor<D> {
    dev: D,
}

impl<D: BlockDevice> DiskEditor<D> {
    pub fn new(dev: D) -> Self {
        Self { dev }
    }

    pub fn into_inner(self) -> D {
        self.dev
    }

    /// Read back an arbitrary byte range.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (start, aligned_len) = aligned_range(offset, len)?;
        let buf = self.dev.read_at(start, aligned_len)?;
        let skip = (offset - start) as usize;
        Ok(buf[skip..skip + len].to_vec())
    }

    /// Write `data` at an arbitrary byte `offset`, preserving every other
    /// byte of the sectors it touches.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (start, aligned_len) = aligned_range(offset, data.len())?;
        let mut buf = self.dev.read_at(start, aligned_len)?;
        if buf.len() != aligned_len as usize {
            return Err(eyre!(
                "Short read at {start}: wanted {aligned_len} bytes, got {}",
                buf.len()
            ));
        }
        let skip = (offset - start) as usize;
        buf[skip..skip + data.len()].copy_from_slice(data);
        self.dev.write_at(start, &buf)?;
        self.dev.flush()
    }

    pub fn write_u8(&mut self, offset: u64, v: u8) -> Result<()> {
        self.write(offset, &[v])
    }

    pub fn write_u16(&mut self, offset: u64, v: u16) -> Result<()> {
        self.write(offset, &v.to_le_bytes())
    }

    pub fn write_u32(&mut self, offset: u64, v: u32) -> Result<()> {
        self.write(offset, &v.to_le_bytes())
    }

    /// Point MBR entry `index` (1-based) at `size` bytes starting at byte
    /// `start`, as a Linux partition. The boot indicator is left alone.
    ///
    /// The entry is read back afterwards and returned decoded; a device that
    /// silently dropped any of the writes is an error.
    pub fn set_partition(&mut self, index: u8, start: u64, size: u64) -> Result<PartitionEntry> {
        validate_partition(index, start, size)?;
        let entry = partition_offset(index)?;
        let first = Chs::from_lba(start / SECTOR_SIZE);
        let last = Chs::from_lba((start + size) / SECTOR_SIZE);
        debug!("Partition {index}: start {first:?}, end {last:?}");

        self.write_u8(entry + 1, first.head)?;
        self.write_u8(entry + 5, last.head)?;
        self.write_u16(entry + 2, first.packed())?;
        self.write_u16(entry + 6, last.packed())?;
        self.write_u8(entry + 4, LINUX_PARTITION_TYPE)?;
        let start_lba = sectors_u32(start, "start")?;
        let sectors = sectors_u32(size, "size")?;
        self.write_u32(entry + 8, start_lba)?;
        self.write_u32(entry + 12, sectors)?;

        let written = self.read_partition(index)?;
        let matches = written.start == first
            && written.end == last
            && written.partition_type == LINUX_PARTITION_TYPE
            && written.start_lba == start_lba
            && written.sectors == sectors;
        if !matches {
            return Err(eyre!(
                "Partition {index} read back as {written:?} after writing it"
            ));
        }
        Ok(written)
    }

    pub fn read_partition(&mut self, index: u8) -> Result<PartitionEntry> {
        let entry = partition_offset(index)?;
        let raw = self.read(entry, PARTITION_ENTRY_SIZE as usize)?;
        let raw: [u8; PARTITION_ENTRY_SIZE as usize] = raw
            .try_into()
            .map_err(|_| eyre!("Short partition entry read"))?;
        Ok(PartitionEntry::decode(&raw))
    }

    /// Store `cmdline` in the block following the MBR, zero padded to a
    /// sector boundary.
    ///
    /// At least one zero byte always follows the text: a cmdline that is
    /// already a multiple of the sector size gets a full extra sector.
    pub fn set_cmdline(&mut self, cmdline: &str) -> Result<()> {
        self.write(CMDLINE_OFFSET, &cmdline_block(cmdline))
    }
}

fn cmdline_block(cmdline: &str) -> Vec<u8> {
    let sector = SECTOR_SIZE as usize;
    let padding = sector - cmdline.len() % sector;
    let mut buf = Vec::with_capacity(cmdline.len() + padding);
    buf.extend_from_slice(cmdline.as_bytes());
    buf.resize(cmdline.len() + padding, 0);
    buf
}

/// The sector-aligned `(start, len)` range covering `len` bytes at `offset`.
fn aligned_range(offset: u64, len: usize) -> Result<(u64, u32)> {
    let start = offset / SECTOR_SIZE * SECTOR_SIZE;
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| eyre!("Write range overflows 64 bits"))?
        .div_ceil(SECTOR_SIZE)
        * SECTOR_SIZE;
    let aligned = u32::try_from(end - start)
        .map_err(|_| eyre!("Write of {len} bytes at {offset} is too large"))?;
    Ok((start, aligned))
}

/// Export `image` over NBD and run `f` against it.
///
/// The server is disconnected and reaped on success; on failure the session
/// is dropped and the server killed. Read-only exports are refused up front.
fn with_nbd_disk<T, F>(opts: &NbdServerOpts, image: &Utf8Path, f: F) -> Result<T>
where
    F: FnOnce(&mut DiskEditor<Session<std::os::unix::net::UnixStream>>) -> Result<T>,
{
    let mut server = NbdServer::spawn(opts, image)?;
    let session = server.connect()?;
    debug!(
        "Exported {image}: {} bytes, flags {:#x}",
        session.size(),
        session.flags()
    );
    if session.is_read_only() {
        return Err(eyre!("{image} is exported read-only"));
    }
    let mut disk = DiskEditor::new(session);
    let value = f(&mut disk)?;
    disk.into_inner().disconnect().context("NBD disconnect")?;
    let status = server.shutdown()?;
    if !status.success() {
        warn!("NBD server for {image} exited with {status}");
    }
    Ok(value)
}

/// Write MBR partition entry `index` of `image`.
pub fn set_partition(
    opts: &NbdServerOpts,
    image: &Utf8Path,
    index: u8,
    start: u64,
    size: u64,
) -> Result<PartitionEntry> {
    validate_partition(index, start, size)?;
    with_nbd_disk(opts, image, |disk| disk.set_partition(index, start, size))
        .with_context(|| format!("Setting partition {index} of {image}"))
}

/// Write the kernel command line block of `image`.
pub fn set_cmdline(opts: &NbdServerOpts, image: &Utf8Path, cmdline: &str) -> Result<()> {
    with_nbd_disk(opts, image, |disk| disk.set_cmdline(cmdline))
        .with_context(|| format!("Setting command line of {image}"))
}

/// Options for writing an MBR partition entry
#[derive(Debug, Parser)]
pub struct SetPartitionOpts {
    /// Disk image to edit
    pub image: Utf8PathBuf,

    /// Partition table entry to write (1-4)
    #[clap(long)]
    pub index: u8,

    /// Partition start offset (e.g. 10M, or plain number for bytes)
    #[clap(long)]
    pub start: String,

    /// Partition size (e.g. 10G, 5120M, or plain number for bytes)
    #[clap(long)]
    pub size: String,

    #[clap(flatten)]
    pub nbd: NbdServerOpts,
}

pub fn run_set_partition(opts: SetPartitionOpts) -> Result<()> {
    let start = utils::parse_size(&opts.start)?;
    let size = utils::parse_size(&opts.size)?;
    let entry = set_partition(&opts.nbd, &opts.image, opts.index, start, size)?;
    info!(
        "Partition {} of {}: {} sectors at sector {}, CHS {}/{}/{} to {}/{}/{}",
        opts.index,
        opts.image,
        entry.sectors,
        entry.start_lba,
        entry.start.cylinder,
        entry.start.head,
        entry.start.sector,
        entry.end.cylinder,
        entry.end.head,
        entry.end.sector
    );
    Ok(())
}

/// Options for writing the kernel command line block
#[derive(Debug, Parser)]
pub struct SetCmdlineOpts {
    /// Disk image to edit
    pub image: Utf8PathBuf,

    /// Command line; multiple arguments are joined with single spaces
    #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmdline: Vec<String>,

    #[clap(flatten)]
    pub nbd: NbdServerOpts,
}

pub fn run_set_cmdline(opts: SetCmdlineOpts) -> Result<()> {
    let cmdline = opts.cmdline.join(" ");
    set_cmdline(&opts.nbd, &opts.image, &cmdline)?;
    info!("Command line of {}: {cmdline}", opts.image);
    Ok(())
}
