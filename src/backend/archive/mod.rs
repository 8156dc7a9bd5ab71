//! Read-only backend over a compressed/archived container.
//!
//! A container (zip, 7z, tar family) is materialized into a virtual
//! directory tree once and cached process-wide; paths inside the container
//! then answer the common backend contract. Mutating an existing container
//! in place is not supported; new containers are produced by [`writer`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::backend::{
    ArchiveAttributes, AttributeExtra, Backend, FileAttributes, FileType, FsError, ReadStream,
    sort_children,
};
use crate::config::ArchiveNameEncoding;
use crate::path::VfsPath;
use crate::watch::{ChangeListener, PollWatch, WatchHandle};

pub mod format;
mod reader;
pub mod tree;
pub mod writer;

use tree::{ArchiveEntry, ArchiveTree, ArchiveTreeCache};

/// Scheme identifier the archive backend registers under.
pub const SCHEME: &str = "archive";

/// Backend over one container file; the instance identifier is the
/// container's resolved local path.
pub struct ArchiveBackend {
    container: PathBuf,
    instance: String,
    encoding: ArchiveNameEncoding,
    cache: Arc<ArchiveTreeCache>,
    closed: AtomicBool,
}

impl ArchiveBackend {
    /// Opens a container, verifying its format up front. The tree itself is
    /// built lazily on first path access and served from `cache` after that.
    pub fn open(
        container: impl Into<PathBuf>,
        encoding: ArchiveNameEncoding,
        cache: Arc<ArchiveTreeCache>,
    ) -> Result<Self, FsError> {
        let container = container.into();
        format::detect_format(&container)?;
        let instance = container.display().to_string();
        Ok(Self {
            container,
            instance,
            encoding,
            cache,
            closed: AtomicBool::new(false),
        })
    }

    pub fn container(&self) -> &Path {
        &self.container
    }

    /// Drops the cached tree; the next access re-parses the container.
    pub fn invalidate(&self) {
        self.cache.invalidate(&self.container);
    }

    fn ensure_open(&self) -> Result<(), FsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::BackendClosed {
                instance: self.instance.clone(),
            });
        }
        Ok(())
    }

    fn tree(&self) -> Result<Arc<ArchiveTree>, FsError> {
        let key = self.key();
        let encoding = self.encoding;
        let container = self.container.clone();
        self.cache.get_or_build(&self.container, || {
            log::debug!("archive: building tree for {}", container.display());
            let raw = reader::read_raw_entries(&container, encoding)?;
            Ok(tree::build_tree(&key, raw))
        })
    }

    /// Looks up the (normalized) path's entry in the tree.
    fn lookup<'t>(&self, tree: &'t ArchiveTree, path: &VfsPath) -> Result<(&'t ArchiveEntry, VfsPath), FsError> {
        let normalized = path.normalize()?;
        match tree.entry(&normalized) {
            Some(entry) => Ok((entry, normalized)),
            None => Err(FsError::NotFound { path: path.display() }),
        }
    }

    fn attributes_from(entry: &ArchiveEntry) -> FileAttributes {
        FileAttributes {
            file_type: entry.file_type,
            size: entry.size,
            modified: entry.modified,
            extra: AttributeExtra::Archive(ArchiveAttributes {
                synthesized: entry.synthesized,
                entry_name: entry
                    .stored_name
                    .as_ref()
                    .map(|name| String::from_utf8_lossy(name).to_string()),
            }),
        }
    }
}

impl Backend for ArchiveBackend {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cache.evict(&self.container);
        }
    }

    fn read_attributes(&self, path: &VfsPath, _follow_links: bool) -> Result<FileAttributes, FsError> {
        // Link targets are not resolved inside containers; attributes always
        // describe the entry itself.
        self.ensure_open()?;
        let tree = self.tree()?;
        let (entry, _) = self.lookup(&tree, path)?;
        Ok(Self::attributes_from(entry))
    }

    fn list_children(&self, path: &VfsPath) -> Result<Vec<(Vec<u8>, FileAttributes)>, FsError> {
        self.ensure_open()?;
        let tree = self.tree()?;
        let (entry, normalized) = self.lookup(&tree, path)?;
        if !entry.is_directory() {
            return Err(FsError::NotDirectory { path: path.display() });
        }
        let mut children = Vec::new();
        for child in tree.children(&normalized).unwrap_or(&[]) {
            let Some(child_entry) = tree.entry(child) else {
                continue;
            };
            let Some(name) = child.file_name() else {
                continue;
            };
            children.push((name.to_vec(), Self::attributes_from(child_entry)));
        }
        sort_children(&mut children);
        Ok(children)
    }

    fn open_read(&self, path: &VfsPath) -> Result<ReadStream, FsError> {
        self.ensure_open()?;
        let tree = self.tree()?;
        let (entry, _) = self.lookup(&tree, path)?;
        if entry.is_directory() {
            return Err(FsError::IsDirectory { path: path.display() });
        }
        let Some(stored_name) = entry.stored_name.as_ref() else {
            return Err(FsError::NotFound { path: path.display() });
        };
        reader::open_entry(&self.container, stored_name)
    }

    fn read_symbolic_link(&self, path: &VfsPath) -> Result<Vec<u8>, FsError> {
        self.ensure_open()?;
        let tree = self.tree()?;
        let (entry, _) = self.lookup(&tree, path)?;
        if entry.file_type != FileType::SymbolicLink {
            return Err(FsError::InvalidPath {
                path: path.display(),
                message: "not a symbolic link entry".to_string(),
            });
        }
        // Tar stores the target in the header; zip stores it as entry data.
        if let Some(target) = entry.link_target.as_ref() {
            return Ok(target.clone());
        }
        let Some(stored_name) = entry.stored_name.as_ref() else {
            return Err(FsError::NotFound { path: path.display() });
        };
        reader::read_entry_bytes(&self.container, stored_name)
    }

    fn observe(
        &self,
        _path: &VfsPath,
        interval: Duration,
        listener: ChangeListener,
    ) -> Result<Box<dyn WatchHandle>, FsError> {
        use std::os::unix::fs::MetadataExt;

        self.ensure_open()?;
        // No native notification for containers; poll the container file's
        // fingerprint. Granularity is the whole container.
        let container = self.container.clone();
        let probe = Box::new(move || {
            std::fs::metadata(&container)
                .ok()
                .map(|meta| format!("{}:{}", meta.len(), meta.mtime()))
        });
        Ok(Box::new(PollWatch::spawn(interval, probe, listener)))
    }
}
