//! Association between host paths and their location inside an image
//!
//! A mapping such as `out/app:/` says that the host directory `out/app`
//! becomes the image root. The filesystem builder uses it to translate
//! symlink targets that point at host locations (absolute targets, or
//! targets climbing out with `..`) into paths that still resolve inside the
//! produced image.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::{Report, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One `host -> image` association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub host: Utf8PathBuf,
    pub image: Utf8PathBuf,
}

impl FromStr for MappingEntry {
    type Err = Report;

    /// Parse `HOST:IMAGE`; the image path must be absolute.
    fn from_str(s: &str) -> Result<Self> {
        let (host, image) = s.rsplit_once(':').ok_or_else(|| {
            eyre!("Invalid mapping '{s}'. Expected format: host_path:image_path")
        })?;
        if host.is_empty() || image.is_empty() {
            return Err(eyre!(
                "Invalid mapping '{s}'. Both host path and image path must be non-empty"
            ));
        }
        let image = Utf8PathBuf::from(image);
        if !image.is_absolute() {
            return Err(eyre!("Image path in mapping '{s}' must be absolute"));
        }
        Ok(Self {
            host: host.into(),
            image,
        })
    }
}

impl std::fmt::Display for MappingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.image)
    }
}

/// Ordered set of host to image path associations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathMapping {
    entries: Vec<MappingEntry>,
}

impl PathMapping {
    pub fn new(entries: Vec<MappingEntry>) -> Self {
        Self { entries }
    }

    /// Load a JSON object of `{"host path": "image path"}` pairs.
    pub fn from_json_file(path: &Utf8Path) -> Result<Self> {
        let f = std::fs::File::open(path).with_context(|| format!("Opening {path}"))?;
        let raw: BTreeMap<Utf8PathBuf, Utf8PathBuf> =
            serde_json::from_reader(std::io::BufReader::new(f))
                .with_context(|| format!("Parsing mapping file {path}"))?;
        let entries = raw
            .into_iter()
            .map(|(host, image)| {
                if image.is_absolute() {
                    Ok(MappingEntry { host, image })
                } else {
                    Err(eyre!("Image path {image} for {host} must be absolute"))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn push(&mut self, entry: MappingEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    /// Make every host path absolute and lexically normal, so prefix
    /// matching works against the absolute paths seen during a tree walk.
    pub fn absolutize(&self) -> Result<Self> {
        let cwd = std::env::current_dir().context("Getting current directory")?;
        let entries = self
            .entries
            .iter()
            .map(|e| {
                let host = std::fs::canonicalize(&e.host)
                    .unwrap_or_else(|_| normalize(&cwd.join(&e.host)));
                let host = Utf8PathBuf::from_path_buf(host)
                    .map_err(|p| eyre!("Mapped host path is not UTF-8: {}", p.display()))?;
                let image = Utf8PathBuf::from_path_buf(normalize(e.image.as_std_path()))
                    .map_err(|p| eyre!("Image path is not UTF-8: {}", p.display()))?;
                Ok(MappingEntry { host, image })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Translate an absolute, normalized host path to its image path using
    /// the longest mapping that contains it.
    pub fn to_image_path(&self, host: &Path) -> Option<PathBuf> {
        self.entries
            .iter()
            .filter_map(|e| {
                host.strip_prefix(e.host.as_std_path())
                    .ok()
                    .map(|rest| (e.host.as_std_path().components().count(), e, rest))
            })
            .max_by_key(|(depth, _, _)| *depth)
            .map(|(_, e, rest)| {
                // Joining an empty path would append a trailing separator
                if rest.as_os_str().is_empty() {
                    e.image.as_std_path().to_path_buf()
                } else {
                    e.image.as_std_path().join(rest)
                }
            })
    }

    /// Rewrite the target of the symlink at host path `link` so it resolves
    /// inside the image.
    ///
    /// Only absolute targets and targets starting with `..` are touched;
    /// they are resolved against the link's host directory and translated
    /// through the mapping. Absolute targets stay absolute, `..` targets are
    /// made relative to the link's directory inside the image. Targets the
    /// mapping does not cover are returned unchanged.
    pub fn rewrite_symlink_target(&self, link: &Path, target: &Path) -> PathBuf {
        let climbs_out = target.components().next() == Some(Component::ParentDir);
        if !target.is_absolute() && !climbs_out {
            return target.to_path_buf();
        }

        let link_dir = link.parent().unwrap_or(Path::new("/"));
        let resolved = normalize(&link_dir.join(target));
        let Some(image_target) = self.to_image_path(&resolved) else {
            warn!(
                "Symlink {} points outside mapped paths ({}), keeping target as is",
                link.display(),
                target.display()
            );
            return target.to_path_buf();
        };

        let rewritten = if target.is_absolute() {
            image_target
        } else {
            match self.to_image_path(link_dir) {
                Some(image_dir) => relative_path(&image_dir, &image_target),
                None => image_target,
            }
        };
        if rewritten != target {
            debug!(
                "Rewrote symlink {}: {} -> {}",
                link.display(),
                target.display(),
                rewritten.display()
            );
        }
        rewritten
    }
}

/// Lexically resolve `.` and `..` components. `..` never climbs above the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let leading_parent =
                    matches!(out.components().next_back(), Some(Component::ParentDir));
                if leading_parent || (!out.pop() && !path.is_absolute()) {
                    out.push("..");
                }
            }
            c => out.push(c.as_os_str()),
        }
    }
    out
}

/// Path leading from directory `from` to `to`; both absolute and normalized.
fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for c in &to[common..] {
        out.push(c.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
