//! Virtual directory tree materialized from container entries.
//!
//! Built once per container in a single pass and cached process-wide; the
//! cache is invalidated when the underlying file changes and evicted when
//! the container stops being tracked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::backend::{BackendKey, FileType, FsError};
use crate::path::VfsPath;

/// Metadata for one entry of the virtual tree.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Entry name as stored in the container, used for extraction lookup.
    /// `None` for synthesized entries, which have nothing to extract.
    pub stored_name: Option<Vec<u8>>,
    pub file_type: FileType,
    pub size: u64,
    /// Modification time (Unix timestamp in seconds); `None` is the
    /// sentinel for synthesized entries and formats without times.
    pub modified: Option<i64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Native link target for formats that store one (tar).
    pub link_target: Option<Vec<u8>>,
    /// Inserted because a deeper entry implied it.
    pub synthesized: bool,
}

impl ArchiveEntry {
    pub(super) fn synthesized_directory() -> ArchiveEntry {
        ArchiveEntry {
            stored_name: None,
            file_type: FileType::Directory,
            size: 0,
            modified: None,
            mode: None,
            uid: None,
            gid: None,
            link_target: None,
            synthesized: true,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// Mapping from virtual path to entry metadata plus the parent→children
/// adjacency table. The root path always exists, synthesized if need be.
#[derive(Debug)]
pub struct ArchiveTree {
    entries: HashMap<VfsPath, ArchiveEntry>,
    children: HashMap<VfsPath, Vec<VfsPath>>,
}

impl ArchiveTree {
    pub fn entry(&self, path: &VfsPath) -> Option<&ArchiveEntry> {
        self.entries.get(path)
    }

    pub fn children(&self, path: &VfsPath) -> Option<&[VfsPath]> {
        self.children.get(path).map(|c| c.as_slice())
    }

    pub fn contains(&self, path: &VfsPath) -> bool {
        self.entries.contains_key(path)
    }

    #[cfg(test)]
    pub(super) fn paths(&self) -> Vec<&VfsPath> {
        self.entries.keys().collect()
    }
}

/// Normalizes a raw entry name against the container root.
///
/// Returns `None` for entries that must be dropped: names that ascend above
/// the root (path traversal guard) and names that collapse to the root only
/// after normalization.
fn entry_path(key: &BackendKey, name: &[u8]) -> Option<VfsPath> {
    let root = VfsPath::root(key.clone());
    let resolved = root.resolve_raw(name).ok()?;
    let mut segments: Vec<Vec<u8>> = Vec::new();
    for segment in resolved.segments() {
        match segment.as_slice() {
            b"." => {}
            b".." => {
                // Popping past the root means the entry escapes the
                // container; drop it rather than clamping.
                segments.pop()?;
            }
            _ => segments.push(segment.clone()),
        }
    }
    if segments.is_empty() {
        // Don't allow an entry to become the root only after normalization.
        return None;
    }
    let mut path = root;
    for segment in &segments {
        path = path.join(segment).ok()?;
    }
    Some(path)
}

/// Builds the virtual tree from raw `(name, entry)` records in one pass.
///
/// The first entry seen for a path wins on duplicate names. Every path
/// reachable through a deeper entry gets a synthesized directory entry,
/// walking upward until an existing ancestor is found.
pub fn build_tree(key: &BackendKey, raw_entries: Vec<(Vec<u8>, ArchiveEntry)>) -> ArchiveTree {
    let root = VfsPath::root(key.clone());

    let mut entries: HashMap<VfsPath, ArchiveEntry> = HashMap::new();
    for (name, entry) in raw_entries {
        let Some(path) = entry_path(key, &name) else {
            log::debug!(
                "archive: dropping traversal-unsafe entry {:?}",
                String::from_utf8_lossy(&name)
            );
            continue;
        };
        entries.entry(path).or_insert(entry);
    }
    entries
        .entry(root.clone())
        .or_insert_with(ArchiveEntry::synthesized_directory);

    let mut children: HashMap<VfsPath, Vec<VfsPath>> = HashMap::new();
    children.insert(root.clone(), Vec::new());
    let paths: Vec<VfsPath> = entries.keys().cloned().collect();
    for path in paths {
        let mut path = path;
        while let Some(parent) = path.parent() {
            if entries
                .get(&path)
                .is_some_and(|entry| entry.is_directory())
            {
                children.entry(path.clone()).or_default();
            }
            children.entry(parent.clone()).or_default().push(path);
            if entries.contains_key(&parent) {
                break;
            }
            entries.insert(parent.clone(), ArchiveEntry::synthesized_directory());
            path = parent;
        }
    }

    ArchiveTree { entries, children }
}

// ============================================================================
// Cache
// ============================================================================

struct CachedTree {
    tree: Arc<ArchiveTree>,
    /// Container fingerprint at build time; a mismatch invalidates.
    size: u64,
    mtime: i64,
}

/// Process-wide archive tree cache keyed by container path.
///
/// `get_or_build` is atomic: the lock is held across the build so concurrent
/// callers never duplicate an expensive parse.
pub struct ArchiveTreeCache {
    trees: Mutex<HashMap<PathBuf, CachedTree>>,
}

impl ArchiveTreeCache {
    pub fn new() -> Self {
        Self {
            trees: Mutex::new(HashMap::new()),
        }
    }

    fn fingerprint(container: &Path) -> Result<(u64, i64), FsError> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(container)
            .map_err(|e| FsError::from_io_kind(container.display().to_string(), e))?;
        Ok((meta.len(), meta.mtime()))
    }

    /// Returns the cached tree for `container`, building it under the cache
    /// lock when absent or stale.
    pub fn get_or_build(
        &self,
        container: &Path,
        build: impl FnOnce() -> Result<ArchiveTree, FsError>,
    ) -> Result<Arc<ArchiveTree>, FsError> {
        let (size, mtime) = Self::fingerprint(container)?;
        let mut trees = self.trees.lock().expect("archive cache lock poisoned");
        if let Some(cached) = trees.get(container) {
            if cached.size == size && cached.mtime == mtime {
                return Ok(Arc::clone(&cached.tree));
            }
            log::debug!("archive: cached tree for {} is stale, rebuilding", container.display());
        }
        let tree = Arc::new(build()?);
        trees.insert(
            container.to_path_buf(),
            CachedTree {
                tree: Arc::clone(&tree),
                size,
                mtime,
            },
        );
        Ok(tree)
    }

    /// Drops the cached tree because the container's content changed.
    pub fn invalidate(&self, container: &Path) {
        self.trees
            .lock()
            .expect("archive cache lock poisoned")
            .remove(container);
    }

    /// Drops the cached tree because the container stopped being tracked.
    pub fn evict(&self, container: &Path) {
        self.invalidate(container);
    }
}

impl Default for ArchiveTreeCache {
    fn default() -> Self {
        Self::new()
    }
}
