//! Single-pass ROFS image writer
//!
//! The source tree is walked depth-first with children in sorted order.
//! File contents are streamed straight into the image as they are met, so
//! only the metadata tables are held in memory. Directory entries land in
//! the global table in post-order: a directory's own slice of children is
//! appended only after all of its subdirectories have been flattened. The
//! tables follow the last data block, and the superblock is written last
//! once their position is known.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use indicatif::ProgressBar;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::layout::{blocks_for, DirEntry, Inode, SuperBlock, Symlink};
use super::{RofsError, BLOCK_SIZE, MODE_DIR, MODE_REGULAR, MODE_SYMLINK};
use crate::common_opts::OutputOpts;
use crate::path_mapping::{MappingEntry, PathMapping};

/// Summary of a finished build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub output: Utf8PathBuf,
    pub inodes: u64,
    pub directory_entries: u64,
    pub symlinks: u64,
    pub data_blocks: u64,
    pub structure_info_first_block: u64,
    pub structure_info_blocks: u64,
    pub size: u64,
    pub digest: String,
}

struct RofsBuilder<'a, W> {
    out: W,
    /// Next free block; block 0 holds the superblock.
    next_block: u64,
    inodes: Vec<Inode>,
    dirents: Vec<DirEntry>,
    symlinks: Vec<Symlink>,
    children: HashMap<std::path::PathBuf, Vec<OsString>>,
    mapping: &'a PathMapping,
    progress: ProgressBar,
}

impl<'a, W: Write + Seek> RofsBuilder<'a, W> {
    fn new(
        out: W,
        children: HashMap<std::path::PathBuf, Vec<OsString>>,
        mapping: &'a PathMapping,
        progress: ProgressBar,
    ) -> Self {
        Self {
            out,
            next_block: 1,
            inodes: Vec::new(),
            dirents: Vec::new(),
            symlinks: Vec::new(),
            children,
            mapping,
            progress,
        }
    }

    fn build(mut self, root: &Path) -> Result<(W, SuperBlock)> {
        // Reserve block 0, rewritten once the tables are placed
        self.out.write_all(&[0u8; BLOCK_SIZE])?;

        self.inodes.push(Inode {
            mode: MODE_DIR,
            number: 1,
            data_offset: 0,
            count: 0,
        });
        let (count, start) = self.add_directory(root)?;
        self.inodes[0].data_offset = start;
        self.inodes[0].count = count;

        self.finish()
    }

    /// Pack the children of `dir`, returning `(count, start index)` of its
    /// slice in the directory-entry table.
    fn add_directory(&mut self, dir: &Path) -> Result<(u64, u64)> {
        let names = self
            .children
            .remove(dir)
            .ok_or_else(|| eyre!("Directory {} appeared during the build", dir.display()))?;

        let mut local = Vec::with_capacity(names.len());
        for name in names {
            let path = dir.join(&name);
            let number = self.inodes.len() as u64 + 1;
            let slot = self.inodes.len();
            // Placeholder so descendants get higher numbers
            self.inodes.push(Inode {
                mode: 0,
                number,
                data_offset: 0,
                count: 0,
            });
            local.push(
                DirEntry::new(number, name.as_bytes())
                    .with_context(|| format!("Packing {}", path.display()))?,
            );

            let meta = std::fs::symlink_metadata(&path)
                .with_context(|| format!("Reading metadata of {}", path.display()))?;
            let file_type = meta.file_type();
            let (mode, data_offset, count) = if file_type.is_symlink() {
                (MODE_SYMLINK, self.add_symlink(&path)?, 1)
            } else if file_type.is_dir() {
                let (count, start) = self.add_directory(&path)?;
                (MODE_DIR, start, count)
            } else if file_type.is_file() {
                let (block, len) = self.add_file(&path)?;
                (MODE_REGULAR, block, len)
            } else {
                return Err(RofsError::UnsupportedFileType(path).into());
            };
            self.inodes[slot] = Inode {
                mode,
                number,
                data_offset,
                count,
            };
            self.progress.inc(1);
        }

        let start = self.dirents.len() as u64;
        let count = local.len() as u64;
        self.dirents.extend(local);
        Ok((count, start))
    }

    fn add_symlink(&mut self, path: &Path) -> Result<u64> {
        let target = std::fs::read_link(path)
            .with_context(|| format!("Reading symlink {}", path.display()))?;
        let target = self.mapping.rewrite_symlink_target(path, &target);
        let index = self.symlinks.len() as u64;
        self.symlinks.push(
            Symlink::new(target.as_os_str().as_bytes())
                .with_context(|| format!("Packing symlink {}", path.display()))?,
        );
        Ok(index)
    }

    /// Stream a file into the image; returns its first block and byte length.
    fn add_file(&mut self, path: &Path) -> Result<(u64, u64)> {
        let mut f = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
        let first_block = self.next_block;
        let mut total = 0u64;
        let mut buf = [0u8; BLOCK_SIZE];
        loop {
            let n = read_block(&mut f, &mut buf)
                .with_context(|| format!("Reading {}", path.display()))?;
            if n == 0 {
                break;
            }
            buf[n..].fill(0);
            self.out.write_all(&buf)?;
            self.next_block += 1;
            total += n as u64;
            if n < BLOCK_SIZE {
                break;
            }
        }
        debug!("Packed {} ({total} bytes) at block {first_block}", path.display());
        Ok((first_block, total))
    }

    fn finish(mut self) -> Result<(W, SuperBlock)> {
        let mut tables = Vec::new();
        for d in &self.dirents {
            d.write_to(&mut tables)?;
        }
        for s in &self.symlinks {
            s.write_to(&mut tables)?;
        }
        for i in &self.inodes {
            i.write_to(&mut tables)?;
        }
        let blocks = blocks_for(tables.len() as u64);
        tables.resize(blocks as usize * BLOCK_SIZE, 0);
        self.out.write_all(&tables)?;

        let sb = SuperBlock {
            structure_info_first_block: self.next_block,
            structure_info_blocks_count: blocks,
            directory_entries_count: self.dirents.len() as u64,
            symlinks_count: self.symlinks.len() as u64,
            inodes_count: self.inodes.len() as u64,
            ..SuperBlock::new()
        };
        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&sb.encode())?;
        self.out.flush()?;
        Ok((self.out, sb))
    }
}

/// Fill `buf` as far as the reader allows; short only at end of file.
fn read_block(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Map every directory under `root` (inclusive) to its sorted child names.
fn scan_tree(root: &Path) -> Result<(HashMap<std::path::PathBuf, Vec<OsString>>, u64)> {
    let mut children = HashMap::new();
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut names = Vec::new();
        for entry in
            std::fs::read_dir(&dir).with_context(|| format!("Reading directory {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            }
            names.push(entry.file_name());
        }
        names.sort();
        total += names.len() as u64;
        children.insert(dir, names);
    }
    Ok((children, total))
}

fn sha256_file(path: &Utf8Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("Opening {path}"))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher)?;
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Build a ROFS image at `output` from the tree at `source_root`.
///
/// An empty `mapping` maps `source_root` to the image root. A failed build
/// leaves the partial output on disk.
pub fn write_filesystem_image(
    output: &Utf8Path,
    mapping: &PathMapping,
    source_root: &Utf8Path,
) -> Result<BuildReport> {
    let root = std::fs::canonicalize(source_root)
        .with_context(|| format!("Resolving source root {source_root}"))?;
    if !root.is_dir() {
        return Err(eyre!("Source root {source_root} is not a directory"));
    }

    let output_dir = match output.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };
    let output_dir = std::fs::canonicalize(output_dir)
        .with_context(|| format!("Resolving output directory {output_dir}"))?;
    if output_dir.starts_with(&root) {
        return Err(eyre!(
            "Output image {output} must not be inside the source tree {source_root}"
        ));
    }

    let mapping = if mapping.is_empty() {
        let root = Utf8PathBuf::from_path_buf(root.clone())
            .map_err(|p| eyre!("Source root is not UTF-8: {}", p.display()))?;
        PathMapping::new(vec![MappingEntry {
            host: root,
            image: "/".into(),
        }])
    } else {
        mapping.absolutize()?
    };

    let (children, total) = scan_tree(&root)?;
    info!("Packing {total} entries from {source_root} into {output}");

    let file = File::create(output).with_context(|| format!("Creating {output}"))?;
    let progress = ProgressBar::new(total);
    let builder = RofsBuilder::new(BufWriter::new(file), children, &mapping, progress.clone());
    let (out, sb) = builder.build(&root)?;
    progress.finish_and_clear();
    out.into_inner()
        .map_err(|e| e.into_error())
        .and_then(|f| f.sync_all())
        .with_context(|| format!("Writing {output}"))?;

    let size = (sb.structure_info_first_block + sb.structure_info_blocks_count) * BLOCK_SIZE as u64;
    Ok(BuildReport {
        output: output.to_owned(),
        inodes: sb.inodes_count,
        directory_entries: sb.directory_entries_count,
        symlinks: sb.symlinks_count,
        data_blocks: sb.structure_info_first_block - 1,
        structure_info_first_block: sb.structure_info_first_block,
        structure_info_blocks: sb.structure_info_blocks_count,
        size,
        digest: sha256_file(output)?,
    })
}

/// Build a read-only filesystem image from a directory tree
#[derive(Parser, Debug)]
pub struct MkfsOpts {
    /// Path of the image to create
    pub output: Utf8PathBuf,

    /// Directory whose contents become the image root
    pub source_root: Utf8PathBuf,

    /// Map a host path to its path inside the image, used to rewrite
    /// symlink targets (can be repeated)
    #[clap(long = "map", value_name = "HOST:DEST")]
    pub map: Vec<MappingEntry>,

    /// JSON file holding an object of host path to image path pairs
    #[clap(long)]
    pub mapping_file: Option<Utf8PathBuf>,

    #[clap(flatten)]
    pub output_opts: OutputOpts,
}

pub fn run_mkfs(opts: MkfsOpts) -> Result<()> {
    let mut mapping = match &opts.mapping_file {
        Some(path) => PathMapping::from_json_file(path)?,
        None => PathMapping::default(),
    };
    for entry in opts.map {
        mapping.push(entry);
    }
    for entry in mapping.entries() {
        debug!("Mapping {entry}");
    }

    let report = write_filesystem_image(&opts.output, &mapping, &opts.source_root)?;
    if opts.output_opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            "Wrote {} ({} inodes, {} data blocks, {})",
            report.output,
            report.inodes,
            report.data_blocks,
            indicatif::BinaryBytes(report.size)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rofs::reader::RofsImage;
    use std::os::unix::fs::symlink;

    fn utf8(p: std::path::PathBuf) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(p).unwrap()
    }

    /// Three directories, six files and one symlink below the root.
    fn fixture(root: &Path) {
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::create_dir(root.join("c")).unwrap();
        std::fs::write(root.join("a/f1"), "one").unwrap();
        std::fs::write(root.join("a/b/f2"), "two").unwrap();
        std::fs::write(root.join("a/b/f3"), "").unwrap();
        std::fs::write(root.join("c/f4"), "four").unwrap();
        std::fs::write(root.join("top.txt"), "top level\n").unwrap();
        std::fs::write(root.join("big.bin"), vec![0xAB; 1300]).unwrap();
        symlink("a/f1", root.join("link")).unwrap();
    }

    fn build(src: &Path, out_dir: &Path, name: &str) -> (Utf8PathBuf, BuildReport) {
        let out = utf8(out_dir.join(name));
        let report =
            write_filesystem_image(&out, &PathMapping::default(), &utf8(src.to_path_buf()))
                .unwrap();
        (out, report)
    }

    #[test]
    fn test_empty_tree() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (path, report) = build(src.path(), out.path(), "empty.rofs");
        assert_eq!(report.inodes, 1);
        assert_eq!(report.directory_entries, 0);
        assert_eq!(report.symlinks, 0);
        assert_eq!(report.data_blocks, 0);

        let img = RofsImage::open(&path).unwrap();
        let root = img.inode(1).unwrap();
        assert_eq!(root.number, 1);
        assert_eq!(root.mode, MODE_DIR);
        assert_eq!(root.count, 0);
    }

    #[test]
    fn test_fixture_counts() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fixture(src.path());
        let (path, report) = build(src.path(), out.path(), "img.rofs");
        assert_eq!(report.inodes, 11);
        assert_eq!(report.directory_entries, 10);
        assert_eq!(report.symlinks, 1);
        // f1, f2, f4, top.txt take one block each, big.bin three, f3 none
        assert_eq!(report.data_blocks, 7);

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len % BLOCK_SIZE as u64, 0);
        assert_eq!(len, report.size);
        assert!(report.digest.starts_with("sha256:"));
    }

    #[test]
    fn test_post_order_and_numbering() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fixture(src.path());
        let (path, _) = build(src.path(), out.path(), "img.rofs");
        let img = RofsImage::open(&path).unwrap();

        let names: Vec<_> = img
            .dirents()
            .iter()
            .map(|d| String::from_utf8_lossy(d.name()).into_owned())
            .collect();
        assert_eq!(
            names,
            ["f2", "f3", "b", "f1", "f4", "a", "big.bin", "c", "link", "top.txt"]
        );

        let root = img.inode(1).unwrap();
        assert_eq!((root.data_offset, root.count), (5, 5));
        // Depth-first numbering: a=2, b=3, f2=4, f3=5, f1=6, big.bin=7
        let a = img.inode(2).unwrap();
        assert_eq!((a.mode, a.data_offset, a.count), (MODE_DIR, 2, 2));
        let b = img.inode(3).unwrap();
        assert_eq!((b.mode, b.data_offset, b.count), (MODE_DIR, 0, 2));
        let link = img.inode(10).unwrap();
        assert_eq!((link.mode, link.data_offset, link.count), (MODE_SYMLINK, 0, 1));
        assert_eq!(img.symlinks()[0].target(), b"a/f1");
    }

    #[test]
    fn test_file_contents() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fixture(src.path());
        let (path, _) = build(src.path(), out.path(), "img.rofs");
        let img = RofsImage::open(&path).unwrap();

        let big = img.inode(7).unwrap();
        assert_eq!(big.count, 1300);
        assert_eq!(img.read_file(&big).unwrap(), vec![0xAB; 1300]);
        let empty = img.inode(5).unwrap();
        assert_eq!(img.read_file(&empty).unwrap(), Vec::<u8>::new());
        let top = img.inode(11).unwrap();
        assert_eq!(img.read_file(&top).unwrap(), b"top level\n");
    }

    #[test]
    fn test_idempotent() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fixture(src.path());
        let (first, r1) = build(src.path(), out.path(), "one.rofs");
        let (second, r2) = build(src.path(), out.path(), "two.rofs");
        assert_eq!(std::fs::read(first).unwrap(), std::fs::read(second).unwrap());
        assert_eq!(r1.digest, r2.digest);
    }

    #[test]
    fn test_symlink_rewritten_through_mapping() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(src.path()).unwrap();
        std::fs::create_dir(root.join("lib")).unwrap();
        std::fs::write(root.join("lib/libz.so.1"), "z").unwrap();
        symlink(root.join("lib/libz.so.1"), root.join("lib/libz.so")).unwrap();

        let mapping = PathMapping::new(vec![MappingEntry {
            host: utf8(root.clone()),
            image: "/opt/app".into(),
        }]);
        let path = utf8(out.path().join("img.rofs"));
        write_filesystem_image(&path, &mapping, &utf8(root)).unwrap();
        let img = RofsImage::open(&path).unwrap();
        assert_eq!(img.symlinks()[0].target(), b"/opt/app/lib/libz.so.1");
    }

    #[test]
    fn test_symlink_to_directory_not_descended() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("d")).unwrap();
        std::fs::write(src.path().join("d/f"), "f").unwrap();
        symlink("d", src.path().join("dl")).unwrap();
        let (path, report) = build(src.path(), out.path(), "img.rofs");
        // root, d, d/f, dl: the link's target is not packed a second time
        assert_eq!(report.inodes, 4);
        assert_eq!(report.directory_entries, 3);
        assert_eq!(report.symlinks, 1);

        let img = RofsImage::open(&path).unwrap();
        let paths: Vec<_> = img.walk().unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, ["/", "/d", "/d/f", "/dl"]);
        let link = img.inode(4).unwrap();
        assert_eq!(link.mode, MODE_SYMLINK);
        assert_eq!(img.symlink_target(&link).unwrap(), b"d");
    }

    #[test]
    fn test_parent_symlink_kept() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("d")).unwrap();
        symlink("..", src.path().join("d/up")).unwrap();
        let (path, report) = build(src.path(), out.path(), "img.rofs");
        assert_eq!(report.symlinks, 1);

        let img = RofsImage::open(&path).unwrap();
        assert_eq!(img.symlinks()[0].target(), b"..");
        let up = img.inode(3).unwrap();
        assert_eq!(up.mode, MODE_SYMLINK);
    }

    #[test]
    fn test_unsupported_file_type() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let _sock = std::os::unix::net::UnixListener::bind(src.path().join("sock")).unwrap();
        let path = utf8(out.path().join("img.rofs"));
        let err = write_filesystem_image(&path, &PathMapping::default(), &utf8(src.path().into()))
            .unwrap_err();
        assert!(err.to_string().contains("unsupported file type"), "{err}");
    }

    #[test]
    fn test_output_inside_source_rejected() {
        let src = tempfile::tempdir().unwrap();
        let path = utf8(src.path().join("img.rofs"));
        let err = write_filesystem_image(&path, &PathMapping::default(), &utf8(src.path().into()))
            .unwrap_err();
        assert!(err.to_string().contains("must not be inside"), "{err}");
    }
}
