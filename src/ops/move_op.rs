//! Rename-first move with copy-and-delete fallback.
//!
//! Pass one tries the cheap atomic rename into the target directory for
//! every source; whatever fails is deferred. Pass two refreshes each
//! deferred source, retries the rename once, then falls back: directories
//! are copied subtree-first and deleted bottom-up, plain nodes go through
//! the backend's copy-with-move-semantics path. The rename failure reason
//! is deliberately not discriminated before falling back.

use super::OpCtx;
use super::copy::{check_containment, copy_recursive};
use super::delete::delete_recursive;
use super::types::ItemReport;
use crate::backend::FsError;
use crate::path::VfsPath;

pub(super) fn run_move(ctx: &OpCtx, sources: &[VfsPath], target_dir: &VfsPath) -> Vec<ItemReport> {
    let mut items = Vec::with_capacity(sources.len());
    let mut deferred: Vec<(VfsPath, VfsPath)> = Vec::new();

    for source in sources {
        let path = source.display();
        if ctx.shared.is_cancelled() {
            let result = Err(FsError::Interrupted);
            ctx.progress.item_finished(path.clone(), result.as_ref().err());
            items.push(ItemReport::from_result(path, result));
            continue;
        }
        match fast_rename(ctx, source, target_dir) {
            Ok(None) => {
                ctx.progress.item_finished(path.clone(), None);
                items.push(ItemReport::ok(path));
            }
            Ok(Some(target)) => deferred.push((source.clone(), target)),
            Err(e) => {
                ctx.progress.item_finished(path.clone(), Some(&e));
                items.push(ItemReport { path, error: Some(e) });
            }
        }
    }

    for (source, target) in deferred {
        let path = source.display();
        let result = if ctx.shared.is_cancelled() {
            Err(FsError::Interrupted)
        } else {
            slow_move(ctx, &source, &target)
        };
        ctx.progress.item_finished(path.clone(), result.as_ref().err());
        items.push(ItemReport::from_result(path, result));
    }
    items
}

/// Attempts the rename fast path. `Ok(None)` means the source moved;
/// `Ok(Some(target))` defers it to pass two.
fn fast_rename(
    ctx: &OpCtx,
    source: &VfsPath,
    target_dir: &VfsPath,
) -> Result<Option<VfsPath>, FsError> {
    let name = source.file_name().ok_or_else(|| FsError::InvalidPath {
        path: source.display(),
        message: "source has no name".to_string(),
    })?;
    let target = target_dir.join(name)?;
    if &target == source {
        // Moving into its own directory is the identity.
        ctx.progress.node_done(0);
        return Ok(None);
    }
    if source.key() != target.key() {
        return Ok(Some(target));
    }
    let backend = ctx.registry().resolve(source)?;
    match backend.rename(source, &target, ctx.replace_existing) {
        Ok(()) => {
            ctx.progress.node_done(0);
            Ok(None)
        }
        Err(e) => {
            log::debug!(
                "move: rename fast path for {} failed ({}), deferring",
                source.display(),
                e
            );
            Ok(Some(target))
        }
    }
}

fn slow_move(ctx: &OpCtx, source: &VfsPath, target: &VfsPath) -> Result<(), FsError> {
    ctx.shared.check_interrupted()?;
    let backend = ctx.registry().resolve(source)?;
    let attributes = backend.read_attributes(source, false)?;

    // One more rename attempt against refreshed state.
    if source.key() == target.key()
        && backend.rename(source, target, ctx.replace_existing).is_ok()
    {
        ctx.progress.node_done(0);
        return Ok(());
    }

    check_containment(source, target)?;
    if attributes.is_directory() {
        copy_recursive(ctx, source, target, true)?;
        delete_recursive(ctx, source)
    } else if source.key() == target.key() {
        let options = ctx.copy_options(true);
        backend.move_to(source, target, &options)?;
        ctx.progress
            .node_done(if attributes.is_regular() { attributes.size } else { 0 });
        Ok(())
    } else {
        copy_recursive(ctx, source, target, true)?;
        backend.delete(source)
    }
}
