//! Decoding and listing existing ROFS images.

use std::fs::File;
use std::io::Cursor;
use std::os::unix::fs::FileExt;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use tracing::{debug, info};

use super::layout::{DirEntry, Inode, SuperBlock, Symlink};
use super::{RofsError, BLOCK_SIZE, MODE_DIR, MODE_REGULAR, MODE_SYMLINK};
use crate::common_opts::OutputOpts;

fn corrupt(msg: impl Into<String>) -> color_eyre::Report {
    RofsError::Corrupt(msg.into()).into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

impl EntryKind {
    fn from_mode(mode: u64) -> Option<Self> {
        match mode {
            MODE_DIR => Some(Self::Directory),
            MODE_REGULAR => Some(Self::File),
            MODE_SYMLINK => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// One path found by [`RofsImage::walk`].
#[derive(Debug, Clone, Serialize)]
pub struct WalkEntry {
    pub path: String,
    pub inode: u64,
    pub kind: EntryKind,
    /// Bytes for files, children for directories, 1 for symlinks.
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A ROFS image opened for reading, with its tables decoded.
#[derive(Debug)]
pub struct RofsImage {
    file: File,
    superblock: SuperBlock,
    dirents: Vec<DirEntry>,
    symlinks: Vec<Symlink>,
    inodes: Vec<Inode>,
}

impl RofsImage {
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening {path}"))?;
        let mut block = [0u8; BLOCK_SIZE];
        file.read_exact_at(&mut block, 0)
            .with_context(|| format!("Reading superblock of {path}"))?;
        let superblock = SuperBlock::decode(&block[..]).with_context(|| format!("Decoding {path}"))?;

        let len = superblock
            .structure_info_blocks_count
            .checked_mul(BLOCK_SIZE as u64)
            .and_then(|l| usize::try_from(l).ok())
            .ok_or_else(|| corrupt("structure info region too large"))?;
        let mut tables = vec![0u8; len];
        let offset = block_offset(superblock.structure_info_first_block)?;
        file.read_exact_at(&mut tables, offset)
            .with_context(|| format!("Reading structure info of {path}"))?;

        let mut r = Cursor::new(tables);
        let dirents = read_table(&mut r, superblock.directory_entries_count, |r| {
            DirEntry::read_from(r)
        })?;
        let symlinks = read_table(&mut r, superblock.symlinks_count, |r| Symlink::read_from(r))?;
        let inodes = read_table(&mut r, superblock.inodes_count, |r| Inode::read_from(r))?;

        for (i, inode) in inodes.iter().enumerate() {
            if inode.number != i as u64 + 1 {
                return Err(corrupt(format!(
                    "inode at index {i} has number {}",
                    inode.number
                )));
            }
        }
        match inodes.first() {
            Some(root) if root.mode == MODE_DIR => {}
            _ => return Err(corrupt("root inode is missing or not a directory")),
        }

        Ok(Self {
            file,
            superblock,
            dirents,
            symlinks,
            inodes,
        })
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    pub fn dirents(&self) -> &[DirEntry] {
        &self.dirents
    }

    pub fn symlinks(&self) -> &[Symlink] {
        &self.symlinks
    }

    /// Look up an inode by its 1-based number.
    pub fn inode(&self, number: u64) -> Option<Inode> {
        let index = usize::try_from(number.checked_sub(1)?).ok()?;
        self.inodes.get(index).copied()
    }

    pub fn children(&self, dir: &Inode) -> Result<&[DirEntry]> {
        if dir.mode != MODE_DIR {
            return Err(corrupt(format!("inode {} is not a directory", dir.number)));
        }
        slice(&self.dirents, dir.data_offset, dir.count)
            .ok_or_else(|| corrupt(format!("children of inode {} out of range", dir.number)))
    }

    pub fn symlink_target(&self, link: &Inode) -> Result<&[u8]> {
        if link.mode != MODE_SYMLINK {
            return Err(corrupt(format!("inode {} is not a symlink", link.number)));
        }
        usize::try_from(link.data_offset)
            .ok()
            .and_then(|i| self.symlinks.get(i))
            .map(|s| s.target())
            .ok_or_else(|| corrupt(format!("symlink of inode {} out of range", link.number)))
    }

    pub fn read_file(&self, inode: &Inode) -> Result<Vec<u8>> {
        if inode.mode != MODE_REGULAR {
            return Err(corrupt(format!("inode {} is not a regular file", inode.number)));
        }
        let len = usize::try_from(inode.count).map_err(|_| corrupt("file too large"))?;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, block_offset(inode.data_offset)?)
            .with_context(|| format!("Reading data of inode {}", inode.number))?;
        Ok(buf)
    }

    /// Every path in the image, pre-order from the root.
    pub fn walk(&self) -> Result<Vec<WalkEntry>> {
        let mut out = Vec::with_capacity(self.inodes.len());
        // (path, inode number); children pushed reversed to keep table order
        let mut stack = vec![(String::from("/"), 1u64)];
        while let Some((path, number)) = stack.pop() {
            if out.len() >= self.inodes.len() {
                return Err(corrupt("directory cycle"));
            }
            let inode = self
                .inode(number)
                .ok_or_else(|| corrupt(format!("{path}: no inode {number}")))?;
            let kind = EntryKind::from_mode(inode.mode)
                .ok_or_else(|| corrupt(format!("{path}: unknown mode {:#x}", inode.mode)))?;
            let target = match kind {
                EntryKind::Symlink => {
                    Some(String::from_utf8_lossy(self.symlink_target(&inode)?).into_owned())
                }
                _ => None,
            };
            if kind == EntryKind::Directory {
                for child in self.children(&inode)?.iter().rev() {
                    let name = String::from_utf8_lossy(child.name());
                    let child_path = if path == "/" {
                        format!("/{name}")
                    } else {
                        format!("{path}/{name}")
                    };
                    stack.push((child_path, child.inode));
                }
            }
            out.push(WalkEntry {
                path,
                inode: number,
                kind,
                count: inode.count,
                target,
            });
        }
        Ok(out)
    }
}

/// Totals gathered by [`RofsImage::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub files: u64,
    pub bytes: u64,
}

impl RofsImage {
    /// Cross-check the tables against a [`walk`](Self::walk) of the image
    /// and read back every file's data.
    ///
    /// Each directory entry must be reached exactly once from the root and
    /// each symlink record must belong to a reachable symlink.
    pub fn verify(&self, entries: &[WalkEntry]) -> Result<Verification> {
        let reachable = entries.len().saturating_sub(1);
        if self.dirents().len() != reachable {
            return Err(corrupt(format!(
                "{} directory entries but {reachable} paths reachable from the root",
                self.dirents().len()
            )));
        }
        let links = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Symlink)
            .count();
        if self.symlinks().len() != links {
            return Err(corrupt(format!(
                "{} symlink records but {links} symlinks reachable from the root",
                self.symlinks().len()
            )));
        }

        let mut totals = Verification { files: 0, bytes: 0 };
        for entry in entries.iter().filter(|e| e.kind == EntryKind::File) {
            let inode = self
                .inode(entry.inode)
                .ok_or_else(|| corrupt(format!("{}: no inode {}", entry.path, entry.inode)))?;
            let data = self
                .read_file(&inode)
                .with_context(|| format!("Verifying {}", entry.path))?;
            debug!("Verified {} ({} bytes)", entry.path, data.len());
            totals.files += 1;
            totals.bytes += data.len() as u64;
        }
        Ok(totals)
    }
}

fn block_offset(block: u64) -> Result<u64> {
    block
        .checked_mul(BLOCK_SIZE as u64)
        .ok_or_else(|| corrupt(format!("block {block} out of range")))
}

fn slice<T>(items: &[T], start: u64, count: u64) -> Option<&[T]> {
    let start = usize::try_from(start).ok()?;
    let end = start.checked_add(usize::try_from(count).ok()?)?;
    items.get(start..end)
}

fn read_table<T>(
    r: &mut Cursor<Vec<u8>>,
    count: u64,
    read: fn(&mut Cursor<Vec<u8>>) -> std::io::Result<T>,
) -> Result<Vec<T>> {
    let remaining = r.get_ref().len() as u64 - r.position();
    // Each record takes at least one byte; reject absurd counts before allocating
    if count > remaining {
        return Err(corrupt(format!("table of {count} records exceeds structure info")));
    }
    (0..count)
        .map(|_| read(r).map_err(|_| corrupt("truncated structure info")))
        .collect()
}

/// List the contents of a ROFS image
#[derive(Parser, Debug)]
pub struct InspectOpts {
    /// Image to inspect
    pub image: Utf8PathBuf,

    /// Also check the tables for consistency and read back every file
    #[clap(long)]
    pub verify: bool,

    #[clap(flatten)]
    pub output_opts: OutputOpts,
}

#[derive(Debug, Serialize)]
struct InspectReport<'a> {
    superblock: &'a SuperBlock,
    entries: Vec<WalkEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verified: Option<Verification>,
}

pub fn run_inspect(opts: InspectOpts) -> Result<()> {
    let image = RofsImage::open(&opts.image)?;
    let entries = image.walk()?;
    let verified = if opts.verify {
        let totals = image.verify(&entries)?;
        info!(
            "Verified {}: {} files, {} bytes",
            opts.image, totals.files, totals.bytes
        );
        Some(totals)
    } else {
        None
    };

    if opts.output_opts.json {
        let report = InspectReport {
            superblock: image.superblock(),
            entries,
            verified,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["PATH", "INODE", "TYPE", "SIZE", "TARGET"]);
    for entry in entries {
        let size = match entry.kind {
            EntryKind::File => indicatif::BinaryBytes(entry.count).to_string(),
            EntryKind::Directory => format!("{} entries", entry.count),
            EntryKind::Symlink => String::new(),
        };
        table.add_row(vec![
            entry.path,
            entry.inode.to_string(),
            entry.kind.to_string(),
            size,
            entry.target.unwrap_or_default(),
        ]);
    }
    println!("{}", table);
    Ok(())
}
