//! Recursive copy with self-containment guards.

use std::io::Read;
use std::sync::Arc;

use super::OpCtx;
use super::state::{JobShared, ProgressState};
use super::types::ItemReport;
use crate::backend::{Backend, FileAttributes, FileType, FsError, ReadStream};
use crate::path::VfsPath;

/// Rejects targets that would recurse into the source or clobber it.
///
/// Only meaningful within one backend instance; paths on different
/// instances cannot contain each other.
pub(super) fn check_containment(source: &VfsPath, target: &VfsPath) -> Result<(), FsError> {
    if source.key() != target.key() {
        return Ok(());
    }
    if target.starts_with(source) {
        return Err(FsError::CannotCopyIntoItself {
            source: source.display(),
            destination: target.display(),
        });
    }
    if source.starts_with(target) {
        return Err(FsError::CannotOverwriteSource {
            source: source.display(),
            destination: target.display(),
        });
    }
    Ok(())
}

pub(super) fn run_copy(ctx: &OpCtx, sources: &[VfsPath], target_dir: &VfsPath) -> Vec<ItemReport> {
    let mut items = Vec::with_capacity(sources.len());
    for source in sources {
        let path = source.display();
        let result = if ctx.shared.is_cancelled() {
            Err(FsError::Interrupted)
        } else {
            copy_one(ctx, source, target_dir)
        };
        ctx.progress.item_finished(path.clone(), result.as_ref().err());
        items.push(ItemReport::from_result(path, result));
    }
    items
}

fn copy_one(ctx: &OpCtx, source: &VfsPath, target_dir: &VfsPath) -> Result<(), FsError> {
    let name = source.file_name().ok_or_else(|| FsError::InvalidPath {
        path: source.display(),
        message: "source has no name".to_string(),
    })?;
    let mut target = target_dir.join(name)?;
    if &target == source {
        // Copying into the source's own directory duplicates under a
        // " (n)" name instead of failing.
        target = duplicate_target(ctx, target_dir, name)?;
        log::debug!("copy: duplicating {} as {}", source.display(), target.display());
    }
    check_containment(source, &target)?;
    copy_recursive(ctx, source, &target, false)
}

/// Copies one node, then recurses into directory children (symlinks are
/// copied as links, never followed).
pub(super) fn copy_recursive(
    ctx: &OpCtx,
    source: &VfsPath,
    target: &VfsPath,
    move_semantics: bool,
) -> Result<(), FsError> {
    ctx.shared.check_interrupted()?;
    let src = ctx.registry().resolve(source)?;
    let attributes = src.read_attributes(source, false)?;
    copy_node(ctx, &attributes, source, target, move_semantics)?;
    ctx.progress.node_done(if attributes.is_regular() { attributes.size } else { 0 });
    if attributes.is_directory() {
        for (name, _) in src.list_children(source)? {
            let child_source = source.join(&name)?;
            let child_target = target.join(&name)?;
            copy_recursive(ctx, &child_source, &child_target, move_semantics)?;
        }
    }
    Ok(())
}

fn copy_node(
    ctx: &OpCtx,
    attributes: &FileAttributes,
    source: &VfsPath,
    target: &VfsPath,
    move_semantics: bool,
) -> Result<(), FsError> {
    let src = ctx.registry().resolve(source)?;
    let dst = ctx.registry().resolve(target)?;
    if src.key() == dst.key() {
        let options = ctx.copy_options(move_semantics);
        return src.copy(source, target, &options);
    }
    foreign_copy(ctx, attributes, &*src, &*dst, source, target)
}

/// Cross-backend copy of one node through the stream contract.
fn foreign_copy(
    ctx: &OpCtx,
    attributes: &FileAttributes,
    src: &dyn Backend,
    dst: &dyn Backend,
    source: &VfsPath,
    target: &VfsPath,
) -> Result<(), FsError> {
    match attributes.file_type {
        FileType::Directory => {
            match dst.read_attributes(target, false) {
                Ok(_) if !ctx.replace_existing => {
                    return Err(FsError::AlreadyExists { path: target.display() });
                }
                Ok(_) => dst.delete(target)?,
                Err(FsError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            dst.create_directory(target)
        }
        FileType::Regular => {
            let stream = src.open_read(source)?;
            let counting = StreamCopyReader {
                inner: stream,
                shared: Arc::clone(&ctx.shared),
                progress: Arc::clone(&ctx.progress),
                interval: ctx.progress_interval_bytes,
                transferred: 0,
                last_notified: 0,
            };
            let written =
                dst.write_from_stream(target, attributes.size, Box::new(counting), ctx.replace_existing)?;
            ctx.progress.notify_bytes(written);
            Ok(())
        }
        FileType::SymbolicLink => {
            let link_target = src.read_symbolic_link(source)?;
            match dst.create_symbolic_link(target, &link_target) {
                Err(FsError::AlreadyExists { .. }) if ctx.replace_existing => {
                    dst.delete(target)?;
                    dst.create_symbolic_link(target, &link_target)
                }
                other => other,
            }
        }
        other => Err(FsError::Io {
            path: source.display(),
            message: format!("cannot copy special file across backends ({:?})", other),
        }),
    }
}

/// Read adapter surfacing cancellation and progress for foreign copies.
struct StreamCopyReader {
    inner: ReadStream,
    shared: Arc<JobShared>,
    progress: Arc<ProgressState>,
    interval: u64,
    transferred: u64,
    last_notified: u64,
}

impl Read for StreamCopyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.shared.is_cancelled() {
            return Err(std::io::Error::from(std::io::ErrorKind::Interrupted));
        }
        let read = self.inner.read(buf)?;
        self.transferred += read as u64;
        if self.transferred - self.last_notified >= self.interval {
            self.progress.notify_bytes(self.transferred);
            self.last_notified = self.transferred;
        }
        Ok(read)
    }
}

/// Finds the first free ` (n)` duplicate name in the target directory.
fn duplicate_target(ctx: &OpCtx, target_dir: &VfsPath, name: &[u8]) -> Result<VfsPath, FsError> {
    let backend = ctx.registry().resolve(target_dir)?;
    let mut counter = 1u32;
    loop {
        let candidate = target_dir.join(&duplicate_name(name, counter))?;
        match backend.read_attributes(&candidate, false) {
            Err(FsError::NotFound { .. }) => return Ok(candidate),
            Ok(_) => counter += 1,
            Err(e) => return Err(e),
        }
    }
}

/// `report.txt` -> `report (1).txt`; dotfiles and extensionless names get
/// the suffix appended.
pub(super) fn duplicate_name(name: &[u8], counter: u32) -> Vec<u8> {
    let suffix = format!(" ({})", counter);
    let split = match name.iter().rposition(|&b| b == b'.') {
        Some(0) | None => name.len(),
        Some(at) => at,
    };
    let mut out = Vec::with_capacity(name.len() + suffix.len());
    out.extend_from_slice(&name[..split]);
    out.extend_from_slice(suffix.as_bytes());
    out.extend_from_slice(&name[split..]);
    out
}
