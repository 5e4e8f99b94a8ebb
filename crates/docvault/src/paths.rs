//! Canonical path handling
//!
//! Every path that crosses the crate boundary is normalized into the
//! canonical form: absolute, `/`-separated, no empty segments and no
//! trailing slash except for the root itself. Disk locations are derived
//! from canonical paths through [`StorageRoot`], never from caller input.

use std::path::{Component, Path, PathBuf};

use crate::error::{VaultError, VaultResult};

pub const ROOT: &str = "/";

/// Normalize caller input into a canonical path.
///
/// Backslashes count as separators and repeated separators collapse.
/// `.` and `..` segments are rejected rather than resolved.
pub fn normalize(raw: &str) -> VaultResult<String> {
    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" => continue,
            "." | ".." => {
                return Err(VaultError::invalid_path(
                    raw,
                    "relative segments are not allowed",
                ))
            }
            s if s.chars().any(char::is_control) => {
                return Err(VaultError::invalid_path(raw, "control characters in path"))
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        Ok(ROOT.to_string())
    } else {
        Ok(format!("/{}", segments.join("/")))
    }
}

pub fn is_root(path: &str) -> bool {
    path == ROOT
}

/// Non-empty segments of a canonical path
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Parent of a canonical path; `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if is_root(path) {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some(ROOT),
        Some((head, _)) => Some(head),
        None => Some(ROOT),
    }
}

/// Last segment of a canonical path; empty for the root
pub fn name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

pub fn join(parent: &str, name: &str) -> String {
    if is_root(parent) {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// First segment, which decides team governance
pub fn top_segment(path: &str) -> Option<&str> {
    segments(path).next()
}

pub fn depth(path: &str) -> usize {
    segments(path).count()
}

/// Proper ancestors of `path` excluding the root, nearest first.
///
/// `/a/b/c` yields `["/a/b", "/a"]`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if is_root(p) {
            break;
        }
        chain.push(p.to_string());
        current = parent(p);
    }
    chain
}

/// True if `path` equals `prefix` or lies below it
pub fn is_within(path: &str, prefix: &str) -> bool {
    if is_root(prefix) {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Move `path` from under `old_prefix` to under `new_prefix`, keeping the suffix
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(old_prefix)?;
    if rest.is_empty() {
        Some(new_prefix.to_string())
    } else if rest.starts_with('/') {
        Some(format!("{}{}", new_prefix, rest))
    } else {
        None
    }
}

/// Physical storage root of the document tree
#[derive(Debug, Clone)]
pub struct StorageRoot {
    root: PathBuf,
}

impl StorageRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Disk location of a canonical path. Anything that would land outside
    /// the root is rejected.
    pub fn resolve(&self, canonical: &str) -> VaultResult<PathBuf> {
        let mut disk = self.root.clone();
        for segment in segments(canonical) {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => disk.push(segment),
                _ => {
                    return Err(VaultError::invalid_path(
                        canonical,
                        "segment does not name a single directory entry",
                    ))
                }
            }
        }

        if !disk.starts_with(&self.root) {
            return Err(VaultError::invalid_path(canonical, "outside storage root"));
        }
        Ok(disk)
    }

    /// Canonical path of a disk location under the root
    pub fn to_canonical(&self, disk: &Path) -> Option<String> {
        let relative = disk.strip_prefix(&self.root).ok()?;
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(s) => segments.push(s.to_string_lossy().into_owned()),
                _ => return None,
            }
        }
        if segments.is_empty() {
            Some(ROOT.to_string())
        } else {
            Some(format!("/{}", segments.join("/")))
        }
    }
}
