//! Permission-scoped document tree backend.
//!
//! Documents live behind a capability-limited provider (content-resolver
//! style): no symlinks, push-based change notification, and optional
//! provider-side copy. The backend adapts that surface to the common
//! `Backend` contract; the provider itself is an external collaborator.

use std::io::Read;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::backend::{
    AttributeExtra, Backend, CopyOptions, DocumentAttributes, FileAttributes, FileType, FsError,
    ReadStream, sort_children,
};
use crate::path::VfsPath;
use crate::watch::{ChangeListener, WatchHandle};

pub mod memory;

/// Scheme identifier the document backend registers under.
pub const SCHEME: &str = "document";

/// MIME type marking a document as a directory.
pub const DIRECTORY_MIME_TYPE: &str = "inode/directory";

/// Provider advertises document-side copy for this document.
pub const FLAG_SUPPORTS_COPY: u32 = 1 << 0;
/// Provider advertises document-side move for this document.
pub const FLAG_SUPPORTS_MOVE: u32 = 1 << 1;

/// Point-in-time document metadata as reported by a provider.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub mime_type: String,
    pub size: u64,
    /// Modification time (Unix timestamp in seconds), when known.
    pub modified: Option<i64>,
    pub flags: u32,
}

impl DocumentInfo {
    pub fn is_directory(&self) -> bool {
        self.mime_type == DIRECTORY_MIME_TYPE
    }
}

/// Narrow collaborator interface over a permission-scoped document tree.
///
/// Paths are absolute byte paths within the tree (the grant's root is `/`).
pub trait DocumentProvider: Send + Sync {
    /// The permission grant's tree identifier; doubles as the backend
    /// instance identifier.
    fn tree_id(&self) -> &str;

    /// Metadata for a document, `None` when absent.
    fn query(&self, path: &[u8]) -> Result<Option<DocumentInfo>, FsError>;

    fn list(&self, path: &[u8]) -> Result<Vec<(Vec<u8>, DocumentInfo)>, FsError>;

    /// Creates an empty document with the given MIME type (the directory
    /// MIME creates a directory).
    fn create(&self, path: &[u8], mime_type: &str) -> Result<(), FsError>;

    fn delete(&self, path: &[u8]) -> Result<(), FsError>;

    fn rename(&self, from: &[u8], to: &[u8]) -> Result<(), FsError>;

    /// Provider-side copy, only called when the source document advertises
    /// `FLAG_SUPPORTS_COPY`.
    fn copy(&self, from: &[u8], to: &[u8]) -> Result<(), FsError> {
        let _ = (from, to);
        Err(FsError::unsupported("provider copy"))
    }

    fn open_read(&self, path: &[u8]) -> Result<ReadStream, FsError>;

    /// Writes a full document body, replacing any existing content.
    fn write(&self, path: &[u8], data: &mut dyn Read) -> Result<u64, FsError>;

    /// Push-based change subscription for a document and its children.
    fn subscribe(&self, path: &[u8], listener: ChangeListener) -> Result<Box<dyn WatchHandle>, FsError>;
}

/// Backend over one document tree grant.
pub struct DocumentBackend {
    provider: std::sync::Arc<dyn DocumentProvider>,
    closed: AtomicBool,
}

impl DocumentBackend {
    pub fn new(provider: std::sync::Arc<dyn DocumentProvider>) -> Self {
        Self {
            provider,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), FsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::BackendClosed {
                instance: self.provider.tree_id().to_string(),
            });
        }
        Ok(())
    }

    fn query_existing(&self, path: &VfsPath) -> Result<DocumentInfo, FsError> {
        self.provider
            .query(&path.to_bytes())?
            .ok_or_else(|| FsError::NotFound { path: path.display() })
    }

    fn attributes_from(info: &DocumentInfo) -> FileAttributes {
        FileAttributes {
            file_type: if info.is_directory() {
                FileType::Directory
            } else {
                FileType::Regular
            },
            size: info.size,
            modified: info.modified,
            extra: AttributeExtra::Document(DocumentAttributes {
                mime_type: info.mime_type.clone(),
                flags: info.flags,
            }),
        }
    }

    /// Streams source content into the target, reporting progress at the
    /// configured byte interval.
    fn stream_copy(
        &self,
        from: &VfsPath,
        to: &VfsPath,
        size: u64,
        options: &CopyOptions<'_>,
    ) -> Result<(), FsError> {
        let source = self.provider.open_read(&from.to_bytes())?;
        let mut counting = CountingReader {
            inner: source,
            transferred: 0,
            last_notified: 0,
            options,
        };
        let written = self.provider.write(&to.to_bytes(), &mut counting)?;
        if written != size {
            log::debug!(
                "document: copy of {} transferred {} bytes, metadata said {}",
                from.display(),
                written,
                size
            );
        }
        Ok(())
    }
}

/// Read adapter that surfaces progress and cancellation at chunk granularity.
struct CountingReader<'a> {
    inner: ReadStream,
    transferred: u64,
    last_notified: u64,
    options: &'a CopyOptions<'a>,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.options.check_cancelled().is_err() {
            return Err(std::io::Error::from(std::io::ErrorKind::Interrupted));
        }
        let read = self.inner.read(buf)?;
        self.transferred += read as u64;
        if self.transferred - self.last_notified >= self.options.progress_interval_bytes {
            self.options.notify_progress(self.transferred);
            self.last_notified = self.transferred;
        }
        Ok(read)
    }
}

impl Backend for DocumentBackend {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn instance(&self) -> &str {
        self.provider.tree_id()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn read_attributes(&self, path: &VfsPath, _follow_links: bool) -> Result<FileAttributes, FsError> {
        self.ensure_open()?;
        let info = self.query_existing(path)?;
        Ok(Self::attributes_from(&info))
    }

    fn list_children(&self, path: &VfsPath) -> Result<Vec<(Vec<u8>, FileAttributes)>, FsError> {
        self.ensure_open()?;
        let info = self.query_existing(path)?;
        if !info.is_directory() {
            return Err(FsError::NotDirectory { path: path.display() });
        }
        let mut children: Vec<(Vec<u8>, FileAttributes)> = self
            .provider
            .list(&path.to_bytes())?
            .into_iter()
            .map(|(name, info)| (name, Self::attributes_from(&info)))
            .collect();
        sort_children(&mut children);
        Ok(children)
    }

    fn create_file(&self, path: &VfsPath) -> Result<(), FsError> {
        self.ensure_open()?;
        if self.provider.query(&path.to_bytes())?.is_some() {
            return Err(FsError::AlreadyExists { path: path.display() });
        }
        self.provider.create(&path.to_bytes(), "application/octet-stream")
    }

    fn create_directory(&self, path: &VfsPath) -> Result<(), FsError> {
        self.ensure_open()?;
        if self.provider.query(&path.to_bytes())?.is_some() {
            return Err(FsError::AlreadyExists { path: path.display() });
        }
        self.provider.create(&path.to_bytes(), DIRECTORY_MIME_TYPE)
    }

    fn delete(&self, path: &VfsPath) -> Result<(), FsError> {
        self.ensure_open()?;
        self.query_existing(path)?;
        self.provider.delete(&path.to_bytes())
    }

    fn rename(&self, from: &VfsPath, to: &VfsPath, replace: bool) -> Result<(), FsError> {
        self.ensure_open()?;
        let _ = replace;
        if self.provider.query(&to.to_bytes())?.is_some() {
            return Err(FsError::AlreadyExists { path: to.display() });
        }
        self.provider.rename(&from.to_bytes(), &to.to_bytes())
    }

    fn copy(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        self.ensure_open()?;
        let info = self.query_existing(from)?;

        // Copying a document onto itself is the identity; the progress
        // listener still hears the resolved size.
        if from == to {
            options.notify_progress(info.size);
            return Ok(());
        }

        if self.provider.query(&to.to_bytes())?.is_some() {
            if !options.replace_existing {
                return Err(FsError::AlreadyExists { path: to.display() });
            }
            self.provider.delete(&to.to_bytes())?;
        }

        if info.is_directory() {
            self.provider.create(&to.to_bytes(), DIRECTORY_MIME_TYPE)?;
        } else if info.flags & FLAG_SUPPORTS_COPY != 0 {
            self.provider.copy(&from.to_bytes(), &to.to_bytes())?;
        } else {
            self.provider.create(&to.to_bytes(), &info.mime_type)?;
            self.stream_copy(from, to, info.size, options)?;
        }
        options.notify_progress(info.size);
        Ok(())
    }

    fn move_to(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        self.ensure_open()?;
        let info = self.query_existing(from)?;
        if from == to {
            options.notify_progress(info.size);
            return Ok(());
        }

        if self.provider.query(&to.to_bytes())?.is_some() {
            if !options.replace_existing {
                return Err(FsError::AlreadyExists { path: to.display() });
            }
            self.provider.delete(&to.to_bytes())?;
        }

        match self.provider.rename(&from.to_bytes(), &to.to_bytes()) {
            Ok(()) => {
                options.notify_progress(info.size);
                Ok(())
            }
            Err(e) => {
                log::debug!(
                    "document: rename {} -> {} failed ({}), falling back to copy",
                    from.display(),
                    to.display(),
                    e
                );
                let copy_options = CopyOptions {
                    replace_existing: options.replace_existing,
                    copy_attributes: true,
                    ..*options
                };
                self.copy(from, to, &copy_options)?;
                self.provider.delete(&from.to_bytes())
            }
        }
    }

    fn open_read(&self, path: &VfsPath) -> Result<ReadStream, FsError> {
        self.ensure_open()?;
        let info = self.query_existing(path)?;
        if info.is_directory() {
            return Err(FsError::IsDirectory { path: path.display() });
        }
        self.provider.open_read(&path.to_bytes())
    }

    fn write_from_stream(
        &self,
        path: &VfsPath,
        _size: u64,
        mut stream: ReadStream,
        replace: bool,
    ) -> Result<u64, FsError> {
        self.ensure_open()?;
        if self.provider.query(&path.to_bytes())?.is_some() {
            if !replace {
                return Err(FsError::AlreadyExists { path: path.display() });
            }
        } else {
            self.provider.create(&path.to_bytes(), "application/octet-stream")?;
        }
        self.provider.write(&path.to_bytes(), &mut stream)
    }

    fn observe(
        &self,
        path: &VfsPath,
        interval: Duration,
        listener: ChangeListener,
    ) -> Result<Box<dyn WatchHandle>, FsError> {
        self.ensure_open()?;
        // Push-based: the interval only throttles bursts.
        let last_fired: Mutex<Option<Instant>> = Mutex::new(None);
        let debounced: ChangeListener = Box::new(move || {
            let mut last = last_fired.lock().expect("watch debounce lock poisoned");
            let now = Instant::now();
            let due = match *last {
                Some(at) => now.duration_since(at) >= interval,
                None => true,
            };
            if due {
                *last = Some(now);
                listener();
            }
        });
        self.provider.subscribe(&path.to_bytes(), debounced)
    }
}
