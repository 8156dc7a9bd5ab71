//! Backend-scoped path values.
//!
//! A `VfsPath` is an immutable sequence of raw name segments (byte strings,
//! not Unicode-validated) tagged with the backend instance it belongs to.
//! Derived paths (parent, resolve, normalize) always produce new values.

use std::fmt;

use crate::backend::{BackendKey, FsError};

/// Path separator used by every backend's textual form.
pub const SEPARATOR: u8 = b'/';

/// An immutable, backend-scoped path.
///
/// Two paths are equal iff they belong to the same backend instance, have the
/// same absolute flag, and carry byte-identical segment sequences.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VfsPath {
    key: BackendKey,
    absolute: bool,
    segments: Vec<Vec<u8>>,
}

impl VfsPath {
    /// Parses a raw byte path belonging to the given backend instance.
    ///
    /// A leading separator makes the path absolute. Empty segments (repeated
    /// separators) and NUL bytes are rejected as malformed.
    pub fn parse(key: BackendKey, raw: &[u8]) -> Result<VfsPath, FsError> {
        let (absolute, rest) = match raw.first() {
            Some(&SEPARATOR) => (true, &raw[1..]),
            _ => (false, raw),
        };
        // A single trailing separator is tolerated, "a//b" is not.
        let rest = rest.strip_suffix(&[SEPARATOR]).unwrap_or(rest);
        let mut segments = Vec::new();
        if !rest.is_empty() {
            for segment in rest.split(|&b| b == SEPARATOR) {
                if segment.is_empty() {
                    return Err(FsError::InvalidPath {
                        path: String::from_utf8_lossy(raw).to_string(),
                        message: "empty name segment".to_string(),
                    });
                }
                if segment.contains(&0) {
                    return Err(FsError::InvalidPath {
                        path: String::from_utf8_lossy(raw).to_string(),
                        message: "NUL byte in name segment".to_string(),
                    });
                }
                segments.push(segment.to_vec());
            }
        }
        Ok(VfsPath {
            key,
            absolute,
            segments,
        })
    }

    /// The root path of a backend instance.
    pub fn root(key: BackendKey) -> VfsPath {
        VfsPath {
            key,
            absolute: true,
            segments: Vec::new(),
        }
    }

    /// The backend instance this path belongs to.
    pub fn key(&self) -> &BackendKey {
        &self.key
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// True for an absolute path with no segments.
    pub fn is_root(&self) -> bool {
        self.absolute && self.segments.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// The last name segment, if any.
    pub fn file_name(&self) -> Option<&[u8]> {
        self.segments.last().map(|s| s.as_slice())
    }

    /// The parent path, or `None` for the root and for single-segment
    /// relative paths.
    pub fn parent(&self) -> Option<VfsPath> {
        if self.segments.is_empty() {
            return None;
        }
        if !self.absolute && self.segments.len() == 1 {
            return None;
        }
        Some(VfsPath {
            key: self.key.clone(),
            absolute: self.absolute,
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Appends one raw name segment.
    pub fn join(&self, name: &[u8]) -> Result<VfsPath, FsError> {
        if name.is_empty() || name.contains(&SEPARATOR) || name.contains(&0) {
            return Err(FsError::InvalidPath {
                path: String::from_utf8_lossy(name).to_string(),
                message: "invalid name segment".to_string(),
            });
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_vec());
        Ok(VfsPath {
            key: self.key.clone(),
            absolute: self.absolute,
            segments,
        })
    }

    /// Resolves `other` against this path: an absolute `other` wins, a
    /// relative one is appended segment by segment.
    pub fn resolve(&self, other: &VfsPath) -> VfsPath {
        if other.absolute {
            return other.clone();
        }
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        VfsPath {
            key: self.key.clone(),
            absolute: self.absolute,
            segments,
        }
    }

    /// Parses `raw` as a relative path of this backend and resolves it.
    pub fn resolve_raw(&self, raw: &[u8]) -> Result<VfsPath, FsError> {
        let child = VfsPath::parse(self.key.clone(), raw)?;
        Ok(self.resolve(&child))
    }

    /// Resolves a sibling name against this path's parent.
    pub fn resolve_sibling(&self, name: &[u8]) -> Result<VfsPath, FsError> {
        match self.parent() {
            Some(parent) => parent.join(name),
            None => VfsPath::parse(self.key.clone(), name),
        }
    }

    /// Collapses `.` and `..` segments without touching the backend.
    ///
    /// Absolute paths clamp at their root (a `..` at the root is dropped).
    /// A relative path that would pop past its start is malformed, as is a
    /// relative path that normalizes to nothing.
    pub fn normalize(&self) -> Result<VfsPath, FsError> {
        let mut out: Vec<Vec<u8>> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment.as_slice() {
                b"." => {}
                b".." => {
                    if out.pop().is_none() {
                        if !self.absolute {
                            return Err(FsError::InvalidPath {
                                path: self.display(),
                                message: "relative path escapes its start".to_string(),
                            });
                        }
                        // Absolute paths clamp at the root.
                    }
                }
                _ => out.push(segment.clone()),
            }
        }
        if !self.absolute && out.is_empty() && !self.segments.is_empty() {
            return Err(FsError::InvalidPath {
                path: self.display(),
                message: "relative path normalizes to nothing".to_string(),
            });
        }
        Ok(VfsPath {
            key: self.key.clone(),
            absolute: self.absolute,
            segments: out,
        })
    }

    /// True when `prefix` belongs to the same backend instance, has the same
    /// absolute flag, and its segments are a prefix of this path's segments.
    pub fn starts_with(&self, prefix: &VfsPath) -> bool {
        self.key == prefix.key
            && self.absolute == prefix.absolute
            && self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Constructs the relative path from `self` to `other`.
    ///
    /// Both paths must belong to the same backend instance and share the
    /// absolute flag.
    pub fn relativize(&self, other: &VfsPath) -> Result<VfsPath, FsError> {
        if self.key != other.key || self.absolute != other.absolute {
            return Err(FsError::InvalidPath {
                path: other.display(),
                message: "cannot relativize across backends or absoluteness".to_string(),
            });
        }
        let common = self
            .segments
            .iter()
            .zip(other.segments.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let mut segments: Vec<Vec<u8>> = Vec::new();
        for _ in common..self.segments.len() {
            segments.push(b"..".to_vec());
        }
        segments.extend(other.segments[common..].iter().cloned());
        Ok(VfsPath {
            key: self.key.clone(),
            absolute: false,
            segments,
        })
    }

    /// Lossy textual form for messages and logging.
    pub fn display(&self) -> String {
        let mut out = String::new();
        if self.absolute {
            out.push('/');
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            out.push_str(&String::from_utf8_lossy(segment));
        }
        if out.is_empty() {
            out.push('.');
        }
        out
    }

    /// Raw byte form, suitable for handing back to a backend.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.absolute {
            out.push(SEPARATOR);
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            out.extend_from_slice(segment);
        }
        out
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.key.scheme, self.key.instance, self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> BackendKey {
        BackendKey::new("local", "/")
    }

    fn path(raw: &str) -> VfsPath {
        VfsPath::parse(key(), raw.as_bytes()).unwrap()
    }

    #[test]
    fn parse_absolute_and_relative() {
        assert!(path("/a/b").is_absolute());
        assert!(!path("a/b").is_absolute());
        assert_eq!(path("/a/b").segment_count(), 2);
        assert!(path("/").is_root());
    }

    #[test]
    fn parse_rejects_empty_segments() {
        assert!(VfsPath::parse(key(), b"/a//b").is_err());
        assert!(VfsPath::parse(key(), b"a\0b").is_err());
        // A single trailing separator is tolerated.
        assert_eq!(path("/a/b/"), path("/a/b"));
    }

    #[test]
    fn equality_is_byte_exact_and_instance_scoped() {
        assert_eq!(path("/a/b"), path("/a/b"));
        assert_ne!(path("/a/b"), path("a/b"));
        let other = VfsPath::parse(BackendKey::new("local", "/mnt"), b"/a/b").unwrap();
        assert_ne!(path("/a/b"), other);
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(path("/a/./b/../c").normalize().unwrap(), path("/a/c"));
        assert_eq!(path("/..").normalize().unwrap(), path("/"));
        assert_eq!(path("a/b/..").normalize().unwrap(), path("a"));
    }

    #[test]
    fn normalize_rejects_escaping_relative_paths() {
        assert!(path("../a").normalize().is_err());
        assert!(path("a/..").normalize().is_err());
    }

    #[test]
    fn resolve_dot_is_normalize_identity() {
        // normalize(resolve(p, ".")) structurally equals normalize(p)
        for raw in ["/a/b", "/a/./b", "a/b/c", "/"] {
            let p = path(raw);
            let resolved = p.resolve_raw(b".").unwrap();
            assert_eq!(resolved.normalize().unwrap(), p.normalize().unwrap());
        }
    }

    #[test]
    fn parent_and_file_name() {
        assert_eq!(path("/a/b").parent().unwrap(), path("/a"));
        assert_eq!(path("/a").parent().unwrap(), path("/"));
        assert!(path("/").parent().is_none());
        assert!(path("a").parent().is_none());
        assert_eq!(path("/a/b").file_name().unwrap(), b"b");
        assert!(path("/").file_name().is_none());
    }

    #[test]
    fn starts_with_is_segment_wise() {
        assert!(path("/a/b/c").starts_with(&path("/a/b")));
        assert!(path("/a/b").starts_with(&path("/a/b")));
        assert!(!path("/ab/c").starts_with(&path("/a")));
        assert!(!path("/a").starts_with(&path("a")));
    }

    #[test]
    fn relativize_round_trips_through_resolve() {
        let base = path("/a/b");
        let other = path("/a/x/y");
        let rel = base.relativize(&other).unwrap();
        assert_eq!(rel, path("../x/y"));
        assert_eq!(
            base.resolve(&rel).normalize().unwrap(),
            other.normalize().unwrap()
        );
    }

    #[test]
    fn join_rejects_separators() {
        assert!(path("/a").join(b"b/c").is_err());
        assert_eq!(path("/a").join(b"b").unwrap(), path("/a/b"));
    }
}
