//! Remote paths.
//!
//! `RemotePath` is a plain value (segments + absolute flag). `FtpPath`
//! ties one to the file system it belongs to.

use crate::ftpfs::filesystem::FtpFileSystem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Immutable `/`-separated remote path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemotePath {
    absolute: bool,
    segments: Vec<String>,
}

impl RemotePath {
    /// Split on `/`; empty segments are dropped, `.` and `..` are kept
    /// until `normalize`.
    pub fn parse(raw: &str) -> Self {
        Self {
            absolute: raw.starts_with('/'),
            segments: raw
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn root() -> Self {
        Self {
            absolute: true,
            segments: Vec::new(),
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.absolute && self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// `None` for the root and for single-segment relative paths.
    pub fn parent(&self) -> Option<RemotePath> {
        if self.segments.is_empty() || (!self.absolute && self.segments.len() == 1) {
            return None;
        }
        Some(Self {
            absolute: self.absolute,
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Remove `.` segments and fold `..` into the preceding segment.
    /// `..` above the root of an absolute path is dropped.
    pub fn normalize(&self) -> RemotePath {
        let mut out: Vec<String> = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            match seg.as_str() {
                "." => {}
                ".." => match out.last() {
                    Some(last) if last != ".." => {
                        out.pop();
                    }
                    _ if self.absolute => {}
                    _ => out.push(seg.clone()),
                },
                _ => out.push(seg.clone()),
            }
        }
        Self {
            absolute: self.absolute,
            segments: out,
        }
    }

    /// An absolute `other` replaces `self`; a relative one is appended.
    pub fn resolve(&self, other: &RemotePath) -> RemotePath {
        if other.absolute {
            return other.clone();
        }
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self {
            absolute: self.absolute,
            segments,
        }
    }

    pub fn join(&self, name: &str) -> RemotePath {
        self.resolve(&RemotePath::parse(name))
    }

    /// Resolve against `base` (if relative) and normalize.
    pub fn to_absolute(&self, base: &RemotePath) -> RemotePath {
        if self.absolute {
            self.normalize()
        } else {
            base.resolve(self).normalize()
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            f.write_str("/")?;
        }
        f.write_str(&self.segments.join("/"))
    }
}

impl From<&str> for RemotePath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

/// A path on a specific `FtpFileSystem`.
#[derive(Clone)]
pub struct FtpPath {
    fs: FtpFileSystem,
    path: RemotePath,
}

impl FtpPath {
    pub(crate) fn new(fs: FtpFileSystem, path: RemotePath) -> Self {
        Self { fs, path }
    }

    pub fn file_system(&self) -> &FtpFileSystem {
        &self.fs
    }

    pub fn remote(&self) -> &RemotePath {
        &self.path
    }

    pub fn is_absolute(&self) -> bool {
        self.path.is_absolute()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name()
    }

    pub fn parent(&self) -> Option<FtpPath> {
        self.path.parent().map(|p| self.with_path(p))
    }

    pub fn resolve(&self, other: &str) -> FtpPath {
        self.with_path(self.path.join(other))
    }

    pub fn normalize(&self) -> FtpPath {
        self.with_path(self.path.normalize())
    }

    /// Resolved against the file system's working directory.
    pub fn to_absolute_path(&self) -> FtpPath {
        self.with_path(self.absolute_remote())
    }

    pub(crate) fn absolute_remote(&self) -> RemotePath {
        self.path.to_absolute(self.fs.working_directory())
    }

    /// Absolute normalized form, as sent on the wire.
    pub fn path_string(&self) -> String {
        self.absolute_remote().to_string()
    }

    pub(crate) fn with_path(&self, path: RemotePath) -> FtpPath {
        Self {
            fs: self.fs.clone(),
            path,
        }
    }
}

impl PartialEq for FtpPath {
    fn eq(&self, other: &Self) -> bool {
        self.fs.id() == other.fs.id() && self.path == other.path
    }
}

impl Eq for FtpPath {}

impl Hash for FtpPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fs.id().hash(state);
        self.path.hash(state);
    }
}

impl fmt::Debug for FtpPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpPath")
            .field("fs", &self.fs.id())
            .field("path", &self.path.to_string())
            .finish()
    }
}

impl fmt::Display for FtpPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.path, f)
    }
}
