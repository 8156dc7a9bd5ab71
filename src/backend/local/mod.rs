//! Local POSIX file system backend.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::backend::{
    AttributeExtra, Backend, CopyOptions, FileAttributes, FileType, FsError, PosixAttributes,
    ReadStream, sort_children,
};
use crate::path::VfsPath;
use crate::watch::{ChangeListener, WatchHandle};

mod copy_move;
mod metadata;

#[cfg(test)]
mod local_test;

/// Scheme identifier the local backend registers under.
pub const SCHEME: &str = "local";

/// A backend rooted at a directory of the local POSIX filesystem.
///
/// The instance identifier is the root path; `VfsPath` segments resolve
/// beneath it.
pub struct LocalBackend {
    root: PathBuf,
    closed: AtomicBool,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            closed: AtomicBool::new(false),
        }
    }

    /// Resolves a backend path to an OS path beneath the root.
    pub(crate) fn resolve(&self, path: &VfsPath) -> PathBuf {
        let mut out = self.root.clone();
        for segment in path.segments() {
            out.push(os_name(segment));
        }
        out
    }

    fn ensure_open(&self) -> Result<(), FsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::BackendClosed {
                instance: self.root.display().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(unix)]
fn os_name(segment: &[u8]) -> &std::ffi::OsStr {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::OsStr::from_bytes(segment)
}

/// Reads attributes for an OS path without going through a backend path.
pub(crate) fn read_os_attributes(os_path: &Path, follow_links: bool) -> std::io::Result<FileAttributes> {
    use std::os::unix::fs::MetadataExt;

    let meta = if follow_links {
        std::fs::metadata(os_path)?
    } else {
        std::fs::symlink_metadata(os_path)?
    };
    let selinux_context = xattr::get(os_path, "security.selinux")
        .ok()
        .flatten()
        .map(|raw| {
            let trimmed = raw.strip_suffix(&[0]).unwrap_or(&raw);
            String::from_utf8_lossy(trimmed).to_string()
        });
    Ok(FileAttributes {
        file_type: FileType::from_mode(meta.mode()),
        size: meta.len(),
        modified: Some(meta.mtime()),
        extra: AttributeExtra::Posix(PosixAttributes {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            selinux_context,
        }),
    })
}

impl Backend for LocalBackend {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn instance(&self) -> &str {
        self.root.to_str().unwrap_or("")
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn read_attributes(&self, path: &VfsPath, follow_links: bool) -> Result<FileAttributes, FsError> {
        self.ensure_open()?;
        let os_path = self.resolve(path);
        read_os_attributes(&os_path, follow_links).map_err(|e| FsError::from_io(path, e))
    }

    fn list_children(&self, path: &VfsPath) -> Result<Vec<(Vec<u8>, FileAttributes)>, FsError> {
        use std::os::unix::ffi::OsStrExt;

        self.ensure_open()?;
        let os_path = self.resolve(path);
        let mut children = Vec::new();
        let entries = std::fs::read_dir(&os_path).map_err(|e| FsError::from_io(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| FsError::from_io(path, e))?;
            let name = entry.file_name().as_os_str().as_bytes().to_vec();
            match read_os_attributes(&entry.path(), false) {
                Ok(attributes) => children.push((name, attributes)),
                Err(e) => {
                    // Raced with concurrent removal; skip the vanished entry.
                    log::debug!(
                        "local: skipping unreadable child {} of {}: {}",
                        String::from_utf8_lossy(&name),
                        os_path.display(),
                        e
                    );
                }
            }
        }
        sort_children(&mut children);
        Ok(children)
    }

    fn create_file(&self, path: &VfsPath) -> Result<(), FsError> {
        self.ensure_open()?;
        let os_path = self.resolve(path);
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&os_path)
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(())
    }

    fn create_directory(&self, path: &VfsPath) -> Result<(), FsError> {
        self.ensure_open()?;
        let os_path = self.resolve(path);
        std::fs::create_dir(&os_path).map_err(|e| FsError::from_io(path, e))
    }

    fn delete(&self, path: &VfsPath) -> Result<(), FsError> {
        self.ensure_open()?;
        let os_path = self.resolve(path);
        let meta = std::fs::symlink_metadata(&os_path).map_err(|e| FsError::from_io(path, e))?;
        if meta.is_dir() {
            std::fs::remove_dir(&os_path).map_err(|e| FsError::from_io(path, e))
        } else {
            std::fs::remove_file(&os_path).map_err(|e| FsError::from_io(path, e))
        }
    }

    fn rename(&self, from: &VfsPath, to: &VfsPath, replace: bool) -> Result<(), FsError> {
        self.ensure_open()?;
        let from_os = self.resolve(from);
        let to_os = self.resolve(to);
        // Rename never clobbers. Without `replace` a stale existence check is
        // enough to fail; with it the destination is re-checked freshly right
        // here, accepting only the "not found" race between check and rename.
        let _ = replace;
        if std::fs::symlink_metadata(&to_os).is_ok() {
            return Err(FsError::AlreadyExists { path: to.display() });
        }
        std::fs::rename(&from_os, &to_os).map_err(|e| FsError::from_io(from, e))
    }

    fn copy(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        self.ensure_open()?;
        copy_move::copy(self, from, to, options)
    }

    fn move_to(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        self.ensure_open()?;
        copy_move::move_to(self, from, to, options)
    }

    fn read_symbolic_link(&self, path: &VfsPath) -> Result<Vec<u8>, FsError> {
        use std::os::unix::ffi::OsStrExt;

        self.ensure_open()?;
        let os_path = self.resolve(path);
        let target = std::fs::read_link(&os_path).map_err(|e| FsError::from_io(path, e))?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    fn create_symbolic_link(&self, path: &VfsPath, target: &[u8]) -> Result<(), FsError> {
        self.ensure_open()?;
        let os_path = self.resolve(path);
        std::os::unix::fs::symlink(os_name(target), &os_path).map_err(|e| FsError::from_io(path, e))
    }

    fn open_read(&self, path: &VfsPath) -> Result<ReadStream, FsError> {
        self.ensure_open()?;
        let os_path = self.resolve(path);
        let file = std::fs::File::open(&os_path).map_err(|e| FsError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    fn write_from_stream(
        &self,
        path: &VfsPath,
        size: u64,
        mut stream: ReadStream,
        replace: bool,
    ) -> Result<u64, FsError> {
        self.ensure_open()?;
        let os_path = self.resolve(path);
        let mut open_options = std::fs::OpenOptions::new();
        open_options.write(true);
        if replace {
            open_options.create(true).truncate(true);
        } else {
            open_options.create_new(true);
        }
        let mut file = open_options.open(&os_path).map_err(|e| FsError::from_io(path, e))?;
        match std::io::copy(&mut stream, &mut file) {
            Ok(written) => {
                if size > 0 && written != size {
                    log::warn!(
                        "local: stream write to {} produced {} bytes, expected {}",
                        os_path.display(),
                        written,
                        size
                    );
                }
                Ok(written)
            }
            Err(e) => {
                drop(file);
                let _ = std::fs::remove_file(&os_path);
                Err(FsError::from_io(path, e))
            }
        }
    }

    fn observe(
        &self,
        path: &VfsPath,
        interval: Duration,
        listener: ChangeListener,
    ) -> Result<Box<dyn WatchHandle>, FsError> {
        use notify::Watcher;

        self.ensure_open()?;
        let os_path = self.resolve(path);
        // Push-based: the interval only debounces bursts of events.
        let last_fired: Mutex<Option<Instant>> = Mutex::new(None);
        let mut watcher = notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
            if result.is_err() {
                return;
            }
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
        })
        .map_err(|e| FsError::Io {
            path: path.display(),
            message: format!("failed to create watcher: {}", e),
        })?;
        watcher
            .watch(&os_path, notify::RecursiveMode::NonRecursive)
            .map_err(|e| FsError::Io {
                path: path.display(),
                message: format!("failed to watch: {}", e),
            })?;
        Ok(Box::new(LocalWatchHandle {
            watcher: Some(watcher),
        }))
    }
}

struct LocalWatchHandle {
    watcher: Option<notify::RecommendedWatcher>,
}

impl WatchHandle for LocalWatchHandle {
    fn close(&mut self) {
        self.watcher.take();
    }
}
