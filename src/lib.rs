//! Unified virtual filesystem over heterogeneous backends.
//!
//! One path/attribute/stream abstraction covers a direct local POSIX tree,
//! a permission-scoped document tree, and virtual trees materialized from
//! archive containers. Operations on local paths can transparently retry
//! through a privilege-escalated broker process when they hit a permission
//! wall, and batch copy/move/delete jobs run on worker threads with
//! per-item outcomes and cooperative cancellation.
//!
//! Everything hangs off an [`FsContext`]: backends are mounted into its
//! registry under a `(scheme, instance)` key, paths carry that key, and the
//! [`ops::FileOperationEngine`] resolves each path back to its backend per
//! call. There are no globals; the archive tree cache and the broker handle
//! are owned by the context and torn down explicitly.

pub mod backend;
pub mod config;
pub mod ops;
pub mod path;
pub mod root;
pub mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use backend::archive::ArchiveBackend;
use backend::archive::tree::ArchiveTreeCache;
use backend::document::{DocumentBackend, DocumentProvider};
use backend::local::LocalBackend;
use root::broker::{Broker, RemoteBackend};
use root::{ConfiguredPrivileges, PrivilegeSource, RootableBackend};

pub use backend::{
    Backend, BackendKey, BackendRegistry, CopyOptions, FileAttributes, FileType, FsError,
};
pub use config::FsConfig;
pub use ops::{FileJobKind, FileOperationEngine, JobOptions, JobReport, JobState};
pub use path::VfsPath;
pub use root::RootStrategy;

/// Process-scoped owning context: configuration, the backend registry, the
/// archive tree cache, and the privileged broker handle.
pub struct FsContext {
    config: FsConfig,
    registry: BackendRegistry,
    archive_trees: Arc<ArchiveTreeCache>,
    broker: Arc<Broker>,
}

impl FsContext {
    pub fn new(config: FsConfig) -> Self {
        let broker = Arc::new(Broker::new(
            config.broker_command.clone(),
            config.broker_connect_timeout,
        ));
        Self {
            config,
            registry: BackendRegistry::new(),
            archive_trees: Arc::new(ArchiveTreeCache::new()),
            broker,
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn archive_trees(&self) -> &Arc<ArchiveTreeCache> {
        &self.archive_trees
    }

    /// Mounts a local backend rooted at `root`.
    pub fn mount_local(&self, root: impl Into<PathBuf>) -> Arc<dyn Backend> {
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(root));
        self.registry.register(Arc::clone(&backend));
        backend
    }

    /// Mounts a local backend whose operations may escalate through the
    /// privileged broker, governed by `strategy`.
    pub fn mount_local_escalating(
        &self,
        root: impl Into<PathBuf>,
        strategy: RootStrategy,
    ) -> Arc<dyn Backend> {
        let root = root.into();
        let local: Arc<dyn Backend> = Arc::new(LocalBackend::new(root.clone()));
        let remote: Arc<dyn Backend> =
            Arc::new(RemoteBackend::mirroring(&*local, root, Arc::clone(&self.broker)));
        let privileges: Arc<dyn PrivilegeSource> = Arc::new(ConfiguredPrivileges::new(&self.config));
        let backend: Arc<dyn Backend> =
            Arc::new(RootableBackend::new(local, remote, strategy, privileges));
        self.registry.register(Arc::clone(&backend));
        backend
    }

    /// Mounts a document backend over one permission grant's tree.
    pub fn mount_document(&self, provider: Arc<dyn DocumentProvider>) -> Arc<dyn Backend> {
        let backend: Arc<dyn Backend> = Arc::new(DocumentBackend::new(provider));
        self.registry.register(Arc::clone(&backend));
        backend
    }

    /// Mounts a read-only archive backend over `container`, verifying its
    /// format up front.
    pub fn mount_archive(&self, container: impl AsRef<Path>) -> Result<Arc<dyn Backend>, FsError> {
        let backend = ArchiveBackend::open(
            container.as_ref(),
            self.config.archive_name_encoding,
            Arc::clone(&self.archive_trees),
        )?;
        let backend: Arc<dyn Backend> = Arc::new(backend);
        self.registry.register(Arc::clone(&backend));
        Ok(backend)
    }

    /// Closes a backend and removes it from the registry; paths into it
    /// turn inert.
    pub fn unmount(&self, key: &BackendKey) {
        self.registry.close(key);
    }

    /// Tears down shared resources, including the broker helper process.
    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn unmounting_turns_paths_inert() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let context = FsContext::new(FsConfig::default());
        let backend = context.mount_local(dir.path());
        let path = VfsPath::parse(backend.key(), b"/f").unwrap();

        assert!(context.registry().resolve(&path).is_ok());
        context.unmount(&backend.key());
        let err = context.registry().resolve(&path).err().unwrap();
        assert!(matches!(err, FsError::BackendClosed { .. }));
    }

    #[test]
    fn archive_mounts_resolve_through_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("a.zip");
        let file = std::fs::File::create(&container).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("inner.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"zip bytes").unwrap();
        writer.finish().unwrap();

        let context = FsContext::new(FsConfig::default());
        let backend = context.mount_archive(&container).unwrap();
        let path = VfsPath::parse(backend.key(), b"/inner.txt").unwrap();
        let resolved = context.registry().resolve(&path).unwrap();
        let attributes = resolved.read_attributes(&path, false).unwrap();
        assert_eq!(attributes.size, 9);
    }

    #[test]
    fn escalating_mount_stays_local_without_a_broker_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let context = FsContext::new(FsConfig::default());
        let backend = context.mount_local_escalating(dir.path(), RootStrategy::PreferNo);

        let path = VfsPath::parse(backend.key(), b"/f").unwrap();
        let attributes = backend.read_attributes(&path, false).unwrap();
        assert!(attributes.is_regular());
    }
}
