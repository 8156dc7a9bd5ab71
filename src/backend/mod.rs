//! Backend trait for abstracting file system access.
//!
//! This module provides the `Backend` trait which abstracts file system
//! operations over heterogeneous storage (local POSIX, permission-scoped
//! document trees, archive containers), plus the shared attribute model,
//! the error taxonomy, and the process-wide backend registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::path::VfsPath;
use crate::watch::{ChangeListener, WatchHandle};

pub mod archive;
pub mod document;
pub mod local;

// ============================================================================
// Backend identity
// ============================================================================

/// Identifies one backend instance: a scheme (`local`, `document`, `archive`)
/// plus an instance identifier (filesystem root, document tree id, container
/// path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendKey {
    pub scheme: String,
    pub instance: String,
}

impl BackendKey {
    pub fn new(scheme: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            instance: instance.into(),
        }
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Errors surfaced by backend operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FsError {
    /// Path not found
    NotFound { path: String },
    /// Path already exists (and replace not requested)
    AlreadyExists { path: String },
    /// Permission denied
    AccessDenied { path: String, message: String },
    /// Path is a directory where a non-directory was required
    IsDirectory { path: String },
    /// Path is not a directory where one was required
    NotDirectory { path: String },
    /// Malformed path, including archive path traversal
    InvalidPath { path: String, message: String },
    /// Target lies inside the source being copied (would recurse forever)
    CannotCopyIntoItself { source: String, destination: String },
    /// Target is the source itself or one of its ancestors
    CannotOverwriteSource { source: String, destination: String },
    /// Operation not supported by this backend
    Unsupported { operation: String },
    /// Corrupt or unrecognized archive container
    ArchiveFormat { path: String, message: String },
    /// The backend instance behind a path has been closed
    BackendClosed { instance: String },
    /// Privileged broker unavailable, dead, or timed out
    Channel { message: String },
    /// Operation cancelled cooperatively
    Interrupted,
    /// Generic I/O error
    Io { path: String, message: String },
}

impl FsError {
    /// Maps an `io::Error` onto the taxonomy, attaching the offending path.
    pub fn from_io(path: &VfsPath, err: std::io::Error) -> Self {
        Self::from_io_kind(path.display(), err)
    }

    pub(crate) fn from_io_kind(path: String, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => FsError::NotFound { path },
            ErrorKind::AlreadyExists => FsError::AlreadyExists { path },
            ErrorKind::PermissionDenied => FsError::AccessDenied {
                path,
                message: err.to_string(),
            },
            ErrorKind::IsADirectory => FsError::IsDirectory { path },
            ErrorKind::NotADirectory => FsError::NotDirectory { path },
            ErrorKind::Interrupted => FsError::Interrupted,
            _ => FsError::Io {
                path,
                message: err.to_string(),
            },
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        FsError::Unsupported {
            operation: operation.to_string(),
        }
    }

    /// True for the access-denied class the root router intercepts.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, FsError::AccessDenied { .. })
    }

    /// True for remote-channel failures that trigger local fallback.
    pub fn is_channel_error(&self) -> bool {
        matches!(self, FsError::Channel { .. })
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsError::NotFound { path } => write!(f, "Path not found: {}", path),
            FsError::AlreadyExists { path } => write!(f, "Already exists: {}", path),
            FsError::AccessDenied { path, message } => {
                write!(f, "Permission denied: {}: {}", path, message)
            }
            FsError::IsDirectory { path } => write!(f, "Is a directory: {}", path),
            FsError::NotDirectory { path } => write!(f, "Not a directory: {}", path),
            FsError::InvalidPath { path, message } => {
                write!(f, "Invalid path: {}: {}", path, message)
            }
            FsError::CannotCopyIntoItself { source, destination } => {
                write!(f, "Cannot copy {} into itself ({})", source, destination)
            }
            FsError::CannotOverwriteSource { source, destination } => {
                write!(f, "Cannot overwrite source {} with {}", source, destination)
            }
            FsError::Unsupported { operation } => {
                write!(f, "Operation not supported: {}", operation)
            }
            FsError::ArchiveFormat { path, message } => {
                write!(f, "Archive format error: {}: {}", path, message)
            }
            FsError::BackendClosed { instance } => write!(f, "Backend closed: {}", instance),
            FsError::Channel { message } => write!(f, "Channel error: {}", message),
            FsError::Interrupted => write!(f, "Operation interrupted"),
            FsError::Io { path, message } => write!(f, "I/O error: {}: {}", path, message),
        }
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::from_io_kind(String::new(), err)
    }
}

// ============================================================================
// File attributes
// ============================================================================

/// File type as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Regular,
    Directory,
    SymbolicLink,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

impl FileType {
    /// Maps a POSIX `st_mode` to a file type.
    #[cfg(unix)]
    pub fn from_mode(mode: u32) -> FileType {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FileType::Regular,
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::SymbolicLink,
            libc::S_IFCHR => FileType::CharacterDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFIFO => FileType::Fifo,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }
}

/// POSIX attribute extension carried by the local backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PosixAttributes {
    /// Permission and type bits (`st_mode`).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// SELinux security context, when the filesystem carries one.
    pub selinux_context: Option<String>,
}

/// Document attribute extension carried by the document backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAttributes {
    pub mime_type: String,
    /// Provider capability flags for this document.
    pub flags: u32,
}

/// Archive attribute extension carried by the archive backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveAttributes {
    /// True for directory entries inserted because a deeper entry implied
    /// them, with no explicit entry of their own in the container.
    pub synthesized: bool,
    /// Entry name as stored in the container, for extraction lookup.
    pub entry_name: Option<String>,
}

/// Backend-specific attribute payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum AttributeExtra {
    None,
    Posix(PosixAttributes),
    Document(DocumentAttributes),
    Archive(ArchiveAttributes),
}

/// Point-in-time snapshot of a file's metadata. Re-read to observe changes;
/// there is no live binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttributes {
    pub file_type: FileType,
    pub size: u64,
    /// Modification time (Unix timestamp in seconds), when known.
    pub modified: Option<i64>,
    pub extra: AttributeExtra,
}

impl FileAttributes {
    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::SymbolicLink
    }

    pub fn is_regular(&self) -> bool {
        self.file_type == FileType::Regular
    }

    pub fn posix(&self) -> Option<&PosixAttributes> {
        match &self.extra {
            AttributeExtra::Posix(p) => Some(p),
            _ => None,
        }
    }
}

// ============================================================================
// Copy options and progress
// ============================================================================

/// Progress callback: invoked with cumulative bytes transferred, at a
/// caller-specified minimum byte interval, and always once at completion
/// with the final size.
pub type ProgressListener<'a> = &'a (dyn Fn(u64) + Sync);

/// Options threaded through backend copy/move operations.
#[derive(Clone, Copy)]
pub struct CopyOptions<'a> {
    /// Overwrite an existing target.
    pub replace_existing: bool,
    /// Move semantics: also copy ownership, access time, and every extended
    /// attribute instead of only the `user.` namespace.
    pub copy_attributes: bool,
    /// Operate on symlinks themselves instead of their targets.
    pub no_follow_links: bool,
    /// Minimum number of bytes between intermediate progress notifications.
    pub progress_interval_bytes: u64,
    pub progress: Option<ProgressListener<'a>>,
    /// Cooperative cancellation flag, checked at every chunk boundary.
    pub cancelled: Option<&'a AtomicBool>,
}

impl Default for CopyOptions<'_> {
    fn default() -> Self {
        Self {
            replace_existing: false,
            copy_attributes: false,
            no_follow_links: true,
            progress_interval_bytes: crate::config::DEFAULT_PROGRESS_INTERVAL_BYTES,
            progress: None,
            cancelled: None,
        }
    }
}

impl CopyOptions<'_> {
    pub(crate) fn notify_progress(&self, transferred: u64) {
        if let Some(listener) = self.progress {
            listener(transferred);
        }
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), FsError> {
        if let Some(flag) = self.cancelled {
            if flag.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(FsError::Interrupted);
            }
        }
        Ok(())
    }
}

/// A blocking byte stream read from a backend.
pub type ReadStream = Box<dyn std::io::Read + Send>;

// ============================================================================
// Backend trait
// ============================================================================

/// One concrete filesystem implementation exposed through the common
/// path/attribute contract.
///
/// Required operations cover metadata and listing; everything else defaults
/// to `Unsupported` so capability-limited backends only implement what they
/// can represent.
pub trait Backend: Send + Sync {
    /// Scheme identifier this backend registers under (e.g. "local").
    fn scheme(&self) -> &str;

    /// Instance identifier within the scheme (root path, tree id, container).
    fn instance(&self) -> &str;

    fn key(&self) -> BackendKey {
        BackendKey::new(self.scheme(), self.instance())
    }

    /// True once `close` has been called; paths into a closed backend are
    /// inert and operations on them fail with `BackendClosed`.
    fn is_closed(&self) -> bool {
        false
    }

    /// Releases backend resources. Idempotent.
    fn close(&self) {}

    // ========================================
    // Required: metadata and listing
    // ========================================

    fn read_attributes(&self, path: &VfsPath, follow_links: bool) -> Result<FileAttributes, FsError>;

    /// Lists directory children as `(name, attributes)` pairs, directories
    /// first, then alphanumeric within each group.
    fn list_children(&self, path: &VfsPath) -> Result<Vec<(Vec<u8>, FileAttributes)>, FsError>;

    // ========================================
    // Optional: default to Unsupported
    // ========================================

    /// Creates an empty regular file, failing if the path exists.
    fn create_file(&self, path: &VfsPath) -> Result<(), FsError> {
        let _ = path;
        Err(FsError::unsupported("create_file"))
    }

    fn create_directory(&self, path: &VfsPath) -> Result<(), FsError> {
        let _ = path;
        Err(FsError::unsupported("create_directory"))
    }

    /// Deletes a file, symlink, or empty directory.
    fn delete(&self, path: &VfsPath) -> Result<(), FsError> {
        let _ = path;
        Err(FsError::unsupported("delete"))
    }

    /// Atomically renames within this backend. With `replace`, the
    /// destination is re-checked immediately before the rename; without it,
    /// an existing destination fails with `AlreadyExists`.
    fn rename(&self, from: &VfsPath, to: &VfsPath, replace: bool) -> Result<(), FsError> {
        let _ = (from, to, replace);
        Err(FsError::unsupported("rename"))
    }

    /// Copies one node (no recursion) within this backend.
    fn copy(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        let _ = (from, to, options);
        Err(FsError::unsupported("copy"))
    }

    /// Moves one node within this backend: rename first, copy-with-move-
    /// semantics plus source delete as the fallback.
    fn move_to(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        let _ = (from, to, options);
        Err(FsError::unsupported("move"))
    }

    fn read_symbolic_link(&self, path: &VfsPath) -> Result<Vec<u8>, FsError> {
        let _ = path;
        Err(FsError::unsupported("read_symbolic_link"))
    }

    fn create_symbolic_link(&self, path: &VfsPath, target: &[u8]) -> Result<(), FsError> {
        let _ = (path, target);
        Err(FsError::unsupported("create_symbolic_link"))
    }

    /// Opens a blocking read stream over a regular file's content.
    fn open_read(&self, path: &VfsPath) -> Result<ReadStream, FsError> {
        let _ = path;
        Err(FsError::unsupported("open_read"))
    }

    /// Writes a stream to `path`. `size` is the expected total, for backends
    /// whose protocol needs it up front. Returns bytes written.
    fn write_from_stream(
        &self,
        path: &VfsPath,
        size: u64,
        stream: ReadStream,
        replace: bool,
    ) -> Result<u64, FsError> {
        let _ = (path, size, stream, replace);
        Err(FsError::unsupported("write_from_stream"))
    }

    /// Subscribes to change notification for `path`. Push-based backends use
    /// `interval` as a debounce window; poll-based backends use it as the
    /// poll period.
    fn observe(
        &self,
        path: &VfsPath,
        interval: Duration,
        listener: ChangeListener,
    ) -> Result<Box<dyn WatchHandle>, FsError> {
        let _ = (path, interval, listener);
        Err(FsError::unsupported("observe"))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide lookup from `(scheme, instance)` to live backend instances.
///
/// Closing a backend removes it; later lookups fail with `BackendClosed` so
/// paths held by callers turn inert instead of dangling.
pub struct BackendRegistry {
    backends: Mutex<HashMap<BackendKey, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, backend: Arc<dyn Backend>) {
        let key = backend.key();
        log::debug!("registry: registering {}://{}", key.scheme, key.instance);
        self.backends
            .lock()
            .expect("backend registry lock poisoned")
            .insert(key, backend);
    }

    pub fn lookup(&self, key: &BackendKey) -> Result<Arc<dyn Backend>, FsError> {
        let backends = self.backends.lock().expect("backend registry lock poisoned");
        match backends.get(key) {
            Some(backend) if !backend.is_closed() => Ok(Arc::clone(backend)),
            _ => Err(FsError::BackendClosed {
                instance: format!("{}://{}", key.scheme, key.instance),
            }),
        }
    }

    /// Resolves the backend a path belongs to.
    pub fn resolve(&self, path: &VfsPath) -> Result<Arc<dyn Backend>, FsError> {
        self.lookup(path.key())
    }

    /// Closes a backend and removes it from the registry.
    pub fn close(&self, key: &BackendKey) {
        let removed = self
            .backends
            .lock()
            .expect("backend registry lock poisoned")
            .remove(key);
        if let Some(backend) = removed {
            log::debug!("registry: closing {}://{}", key.scheme, key.instance);
            backend.close();
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorts `(name, attributes)` child listings directories-first, then
/// alphanumerically within each group.
pub(crate) fn sort_children(children: &mut [(Vec<u8>, FileAttributes)]) {
    children.sort_by(|(a_name, a_attr), (b_name, b_attr)| {
        b_attr
            .is_directory()
            .cmp(&a_attr.is_directory())
            .then_with(|| {
                alphanumeric_sort::compare_str(
                    &String::from_utf8_lossy(a_name),
                    &String::from_utf8_lossy(b_name),
                )
            })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(FsError::from(err), FsError::NotFound { .. }));
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(FsError::from(err).is_access_denied());
    }

    #[test]
    fn sort_children_orders_directories_first() {
        let dir = FileAttributes {
            file_type: FileType::Directory,
            size: 0,
            modified: None,
            extra: AttributeExtra::None,
        };
        let file = FileAttributes {
            file_type: FileType::Regular,
            size: 1,
            modified: None,
            extra: AttributeExtra::None,
        };
        let mut children = vec![
            (b"b.txt".to_vec(), file.clone()),
            (b"a10".to_vec(), dir.clone()),
            (b"a2".to_vec(), dir.clone()),
            (b"a.txt".to_vec(), file.clone()),
        ];
        sort_children(&mut children);
        let names: Vec<&[u8]> = children.iter().map(|(n, _)| n.as_slice()).collect();
        assert_eq!(names, vec![&b"a2"[..], b"a10", b"a.txt", b"b.txt"]);
    }
}
