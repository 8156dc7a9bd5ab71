//! Pre-flight source scanning.
//!
//! Walks the sources once before the operation proper to supply file/byte
//! totals for progress reporting. Unreadable nodes are skipped with a log
//! line; totals are informational, not authoritative, and the operation
//! refreshes every attribute again when it actually runs.

use super::state::JobShared;
use crate::backend::{BackendRegistry, FsError};
use crate::path::VfsPath;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTotals {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Totals over all sources. Fails only on interruption.
pub(super) fn scan_sources(
    registry: &BackendRegistry,
    sources: &[VfsPath],
    shared: &JobShared,
) -> Result<ScanTotals, FsError> {
    let mut totals = ScanTotals::default();
    for source in sources {
        scan_node(registry, source, shared, &mut totals)?;
    }
    log::debug!(
        "scan: {} files, {} directories, {} bytes across {} sources",
        totals.files,
        totals.directories,
        totals.bytes,
        sources.len()
    );
    Ok(totals)
}

fn scan_node(
    registry: &BackendRegistry,
    path: &VfsPath,
    shared: &JobShared,
    totals: &mut ScanTotals,
) -> Result<(), FsError> {
    shared.check_interrupted()?;
    let backend = match registry.resolve(path) {
        Ok(backend) => backend,
        Err(e) => {
            log::debug!("scan: skipping {} ({})", path.display(), e);
            return Ok(());
        }
    };
    let attributes = match backend.read_attributes(path, false) {
        Ok(attributes) => attributes,
        Err(e) => {
            log::debug!("scan: skipping {} ({})", path.display(), e);
            return Ok(());
        }
    };
    if attributes.is_directory() {
        totals.directories += 1;
        match backend.list_children(path) {
            Ok(children) => {
                for (name, _) in children {
                    let child = match path.join(&name) {
                        Ok(child) => child,
                        Err(e) => {
                            log::debug!("scan: skipping malformed child name ({})", e);
                            continue;
                        }
                    };
                    scan_node(registry, &child, shared, totals)?;
                }
            }
            Err(e) => log::debug!("scan: cannot list {} ({})", path.display(), e),
        }
    } else {
        totals.files += 1;
        if attributes.is_regular() {
            totals.bytes += attributes.size;
        }
    }
    Ok(())
}
