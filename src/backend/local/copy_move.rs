//! Single-node copy and move for the local backend.
//!
//! Data transfer runs in bounded chunks with a cancellation check and a
//! byte-interval progress notification per chunk. Metadata (ownership,
//! permission bits, timestamps, extended attributes) is copied best-effort
//! after the data; only data failures fail the operation.

use std::io::{Read, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::Path;

use super::metadata::{copy_metadata, remove_any};
use super::LocalBackend;
use crate::backend::{CopyOptions, FsError};
use crate::path::VfsPath;

/// Chunk size for data copies. Bounded so cancellation and progress stay
/// responsive without degrading I/O throughput.
const CHUNK_SIZE: usize = 1024 * 1024;

pub(super) fn copy(
    backend: &LocalBackend,
    from: &VfsPath,
    to: &VfsPath,
    options: &CopyOptions<'_>,
) -> Result<(), FsError> {
    let from_os = backend.resolve(from);
    let to_os = backend.resolve(to);

    let source_meta = if options.no_follow_links {
        std::fs::symlink_metadata(&from_os)
    } else {
        std::fs::metadata(&from_os)
    }
    .map_err(|e| FsError::from_io(from, e))?;

    let target_meta = match std::fs::symlink_metadata(&to_os) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(FsError::from_io(to, e)),
    };

    if let Some(target_meta) = &target_meta {
        if source_meta.dev() == target_meta.dev() && source_meta.ino() == target_meta.ino() {
            // Identity copy: nothing to transfer, still notify the listener.
            options.notify_progress(source_meta.len());
            return Ok(());
        }
        if !options.replace_existing {
            return Err(FsError::AlreadyExists { path: to.display() });
        }
    }

    let file_type = source_meta.file_type();
    if file_type.is_file() {
        if target_meta.is_some() {
            remove_any(&to_os).map_err(|e| FsError::from_io(to, e))?;
        }
        copy_regular_file(&from_os, &to_os, &source_meta, from, to, options)?;
    } else if file_type.is_dir() {
        if target_meta.is_some() {
            remove_any(&to_os).map_err(|e| FsError::from_io(to, e))?;
        }
        let mut builder = std::fs::DirBuilder::new();
        builder.mode(source_meta.mode() & 0o7777);
        builder.create(&to_os).map_err(|e| FsError::from_io(to, e))?;
        options.notify_progress(source_meta.len());
    } else if file_type.is_symlink() {
        copy_symlink(&from_os, &to_os, from, to, options)?;
        options.notify_progress(source_meta.len());
    } else {
        return Err(FsError::Io {
            path: from.display(),
            message: format!("cannot copy special file (mode {:o})", source_meta.mode()),
        });
    }

    // Metadata failures are logged and swallowed from here on.
    copy_metadata(&from_os, &to_os, &source_meta, options);
    Ok(())
}

fn copy_regular_file(
    from_os: &Path,
    to_os: &Path,
    source_meta: &std::fs::Metadata,
    from: &VfsPath,
    to: &VfsPath,
    options: &CopyOptions<'_>,
) -> Result<(), FsError> {
    let mut source = std::fs::File::open(from_os).map_err(|e| FsError::from_io(from, e))?;

    let mut open_options = std::fs::OpenOptions::new();
    open_options
        .write(true)
        .create(true)
        .truncate(true)
        .mode(source_meta.mode() & 0o7777);
    if !options.replace_existing {
        open_options.create_new(true);
    }
    let mut target = open_options.open(to_os).map_err(|e| FsError::from_io(to, e))?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut transferred = 0u64;
    let mut last_notified = 0u64;
    let result: Result<(), FsError> = loop {
        if let Err(e) = options.check_cancelled() {
            break Err(e);
        }
        let read = match source.read(&mut buffer) {
            Ok(read) => read,
            Err(e) => break Err(FsError::from_io(from, e)),
        };
        if read == 0 {
            break Ok(());
        }
        if let Err(e) = target.write_all(&buffer[..read]) {
            break Err(FsError::from_io(to, e));
        }
        transferred += read as u64;
        if transferred - last_notified >= options.progress_interval_bytes {
            options.notify_progress(transferred);
            last_notified = transferred;
        }
    };

    match result {
        Ok(()) => {
            // Final notification always fires, with the final size.
            options.notify_progress(transferred);
            Ok(())
        }
        Err(e) => {
            // Data failure is fatal; don't leave a partial target behind.
            drop(target);
            let _ = std::fs::remove_file(to_os);
            Err(e)
        }
    }
}

fn copy_symlink(
    from_os: &Path,
    to_os: &Path,
    from: &VfsPath,
    to: &VfsPath,
    options: &CopyOptions<'_>,
) -> Result<(), FsError> {
    let link_target = std::fs::read_link(from_os).map_err(|e| FsError::from_io(from, e))?;
    match std::os::unix::fs::symlink(&link_target, to_os) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && options.replace_existing => {
            let existing = std::fs::symlink_metadata(to_os).map_err(|e2| FsError::from_io(to, e2))?;
            if existing.is_dir() {
                return Err(FsError::IsDirectory { path: to.display() });
            }
            std::fs::remove_file(to_os).map_err(|e2| FsError::from_io(to, e2))?;
            std::os::unix::fs::symlink(&link_target, to_os).map_err(|e2| FsError::from_io(to, e2))
        }
        Err(e) => Err(FsError::from_io(to, e)),
    }
}

pub(super) fn move_to(
    backend: &LocalBackend,
    from: &VfsPath,
    to: &VfsPath,
    options: &CopyOptions<'_>,
) -> Result<(), FsError> {
    let from_os = backend.resolve(from);
    let to_os = backend.resolve(to);

    let source_meta = std::fs::symlink_metadata(&from_os).map_err(|e| FsError::from_io(from, e))?;
    let target_meta = match std::fs::symlink_metadata(&to_os) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(FsError::from_io(to, e)),
    };

    if let Some(target_meta) = &target_meta {
        if source_meta.dev() == target_meta.dev() && source_meta.ino() == target_meta.ino() {
            options.notify_progress(source_meta.len());
            return Ok(());
        }
        if !options.replace_existing {
            return Err(FsError::AlreadyExists { path: to.display() });
        }
        remove_any(&to_os).map_err(|e| FsError::from_io(to, e))?;
    }

    // Atomic rename first; any failure reason falls back to copy + delete.
    match std::fs::rename(&from_os, &to_os) {
        Ok(()) => {
            options.notify_progress(source_meta.len());
            return Ok(());
        }
        Err(e) => {
            log::debug!(
                "local: rename {} -> {} failed ({}), falling back to copy",
                from_os.display(),
                to_os.display(),
                e
            );
        }
    }

    let copy_options = CopyOptions {
        replace_existing: options.replace_existing,
        copy_attributes: true,
        no_follow_links: true,
        ..*options
    };
    copy(backend, from, to, &copy_options)?;

    if let Err(e) = remove_any(&from_os) {
        if e.kind() != std::io::ErrorKind::NotFound {
            // Couldn't remove the source; take the half-moved target back out.
            let _ = remove_any(&to_os);
            return Err(FsError::from_io(from, e));
        }
    }
    Ok(())
}
