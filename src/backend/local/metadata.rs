//! Best-effort metadata propagation after a data copy.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use crate::backend::CopyOptions;

/// Extended attribute namespace propagated even when not performing a full
/// attribute copy.
const XATTR_USER_PREFIX: &str = "user.";

/// Removes a path regardless of whether it is a file, symlink, or (empty)
/// directory.
pub(crate) fn remove_any(os_path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(os_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::IsADirectory => std::fs::remove_dir(os_path),
        Err(e) => Err(e),
    }
}

/// Copies ownership, permission bits, timestamps, and extended attributes
/// from `from_os` to `to_os`.
///
/// Ownership goes first so special permission bits like setuid survive the
/// later chmod. None of these failures fail the copy; data integrity of the
/// primary transfer is the only hard requirement.
pub(super) fn copy_metadata(
    from_os: &Path,
    to_os: &Path,
    source_meta: &std::fs::Metadata,
    options: &CopyOptions<'_>,
) {
    let is_symlink = source_meta.file_type().is_symlink();

    if options.copy_attributes {
        if let Err(e) = std::os::unix::fs::lchown(to_os, Some(source_meta.uid()), Some(source_meta.gid())) {
            log::warn!("local: failed to copy ownership to {}: {}", to_os.display(), e);
        }
    }

    if !is_symlink {
        let permissions = std::fs::Permissions::from_mode(source_meta.mode() & 0o7777);
        if let Err(e) = std::fs::set_permissions(to_os, permissions) {
            log::warn!("local: failed to copy permissions to {}: {}", to_os.display(), e);
        }
    }

    copy_timestamps(from_os, to_os, source_meta, options, is_symlink);
    copy_xattrs(from_os, to_os, options.copy_attributes);
}

fn copy_timestamps(
    _from_os: &Path,
    to_os: &Path,
    source_meta: &std::fs::Metadata,
    options: &CopyOptions<'_>,
    is_symlink: bool,
) {
    let mtime = filetime::FileTime::from_unix_time(source_meta.mtime(), source_meta.mtime_nsec() as u32);
    let result = if options.copy_attributes {
        // Move semantics: preserve access time too.
        let atime = filetime::FileTime::from_unix_time(source_meta.atime(), source_meta.atime_nsec() as u32);
        filetime::set_symlink_file_times(to_os, atime, mtime)
    } else if is_symlink {
        let atime = filetime::FileTime::now();
        filetime::set_symlink_file_times(to_os, atime, mtime)
    } else {
        filetime::set_file_mtime(to_os, mtime)
    };
    if let Err(e) = result {
        log::warn!("local: failed to copy timestamps to {}: {}", to_os.display(), e);
    }
}

/// Copies extended attributes, restricted to the `user.` namespace unless a
/// full attribute copy was requested.
fn copy_xattrs(from_os: &Path, to_os: &Path, copy_all: bool) {
    let names = match xattr::list(from_os) {
        Ok(names) => names,
        Err(e) => {
            // Not all filesystems support xattrs.
            log::debug!("local: failed to list xattrs on {}: {}", from_os.display(), e);
            return;
        }
    };
    for name in names {
        if !copy_all && !name.to_string_lossy().starts_with(XATTR_USER_PREFIX) {
            continue;
        }
        let value = match xattr::get(from_os, &name) {
            Ok(Some(value)) => value,
            Ok(None) => continue,
            Err(e) => {
                log::debug!(
                    "local: failed to read xattr {:?} from {}: {}",
                    name,
                    from_os.display(),
                    e
                );
                continue;
            }
        };
        if let Err(e) = xattr::set(to_os, &name, &value) {
            log::debug!("local: failed to set xattr {:?} on {}: {}", name, to_os.display(), e);
        }
    }
}
