//! Bottom-up recursive delete.

use super::OpCtx;
use super::types::ItemReport;
use crate::backend::FsError;
use crate::path::VfsPath;

pub(super) fn run_delete(ctx: &OpCtx, sources: &[VfsPath]) -> Vec<ItemReport> {
    let mut items = Vec::with_capacity(sources.len());
    for source in sources {
        let path = source.display();
        let result = if ctx.shared.is_cancelled() {
            Err(FsError::Interrupted)
        } else {
            delete_recursive(ctx, source)
        };
        ctx.progress.item_finished(path.clone(), result.as_ref().err());
        items.push(ItemReport::from_result(path, result));
    }
    items
}

/// Removes children before the node itself. The interruption flag is
/// checked before every removal, so a cancellation between two siblings
/// leaves the rest of the tree (including already-emptied ancestors) on
/// disk.
pub(super) fn delete_recursive(ctx: &OpCtx, path: &VfsPath) -> Result<(), FsError> {
    ctx.shared.check_interrupted()?;
    let backend = ctx.registry().resolve(path)?;
    let attributes = backend.read_attributes(path, false)?;
    if attributes.is_directory() {
        for (name, _) in backend.list_children(path)? {
            delete_recursive(ctx, &path.join(&name)?)?;
        }
        ctx.shared.check_interrupted()?;
    }
    backend.delete(path)?;
    ctx.progress.node_removed(path);
    ctx.progress
        .node_done(if attributes.is_regular() { attributes.size } else { 0 });
    Ok(())
}
