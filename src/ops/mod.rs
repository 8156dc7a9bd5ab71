//! File operation engine: batch copy/move/delete/create jobs over the
//! registered backends.
//!
//! Each submitted batch runs on its own worker thread; independent batches
//! execute concurrently without shared job state. Items within a batch
//! succeed or fail independently, and cancellation is cooperative: the flag
//! is checked at every recursion step and every chunk boundary, with no
//! rollback of completed items.

mod copy;
mod delete;
mod move_op;
mod scan;
mod state;
mod types;

#[cfg(test)]
mod ops_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::FsContext;
use crate::backend::{Backend, BackendRegistry, CopyOptions, FsError};
use crate::path::VfsPath;

pub use scan::ScanTotals;
pub use state::JobShared;
use state::ProgressState;
pub use types::{
    FileJobKind, ItemReport, JobEvent, JobListener, JobOptions, JobProgressEvent, JobReport,
    JobState,
};

// ============================================================================
// Worker context
// ============================================================================

/// Everything a job's recursion needs, owned so streams and callbacks can
/// outlive individual stack frames.
pub(super) struct OpCtx {
    pub context: Arc<FsContext>,
    pub shared: Arc<JobShared>,
    pub progress: Arc<ProgressState>,
    node_progress: Arc<dyn Fn(u64) + Send + Sync>,
    pub replace_existing: bool,
    pub progress_interval_bytes: u64,
}

impl OpCtx {
    pub fn registry(&self) -> &BackendRegistry {
        self.context.registry()
    }

    /// Options for a single-node backend copy, wired to this job's progress
    /// accounting and cancellation flag.
    pub fn copy_options(&self, move_semantics: bool) -> CopyOptions<'_> {
        let progress: &(dyn Fn(u64) + Sync) = self.node_progress.as_ref();
        CopyOptions {
            replace_existing: self.replace_existing,
            copy_attributes: move_semantics,
            no_follow_links: true,
            progress_interval_bytes: self.progress_interval_bytes,
            progress: Some(progress),
            cancelled: Some(self.shared.cancelled_flag()),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

type JobMap = Arc<Mutex<HashMap<String, Arc<JobShared>>>>;

/// Submits batch jobs and tracks the running ones for cancellation.
pub struct FileOperationEngine {
    context: Arc<FsContext>,
    jobs: JobMap,
}

/// Handle to one submitted job.
pub struct JobTicket {
    shared: Arc<JobShared>,
    handle: std::thread::JoinHandle<JobReport>,
}

impl JobTicket {
    pub fn id(&self) -> &str {
        self.shared.id()
    }

    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Blocks until the worker finishes and returns the final report.
    pub fn join(self) -> JobReport {
        self.handle.join().expect("job worker panicked")
    }
}

impl FileOperationEngine {
    pub fn new(context: Arc<FsContext>) -> Self {
        Self {
            context,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queues a job on its own worker thread and returns immediately.
    pub fn submit(&self, kind: FileJobKind, options: JobOptions) -> JobTicket {
        let job_id = Uuid::new_v4().to_string();
        let shared = Arc::new(JobShared::new(job_id.clone()));
        self.jobs
            .lock()
            .expect("job map lock poisoned")
            .insert(job_id.clone(), Arc::clone(&shared));
        shared.set_state(JobState::Queued);
        log::info!("ops: job {} ({}) queued", job_id, kind.label());

        let context = Arc::clone(&self.context);
        let worker_shared = Arc::clone(&shared);
        let jobs = Arc::clone(&self.jobs);
        let handle = std::thread::Builder::new()
            .name(format!("polyfs-job-{}", &job_id[..8]))
            .spawn(move || run_job(context, worker_shared, jobs, kind, options))
            .expect("failed to spawn job worker");
        JobTicket { shared, handle }
    }

    /// Requests cancellation of a running job; returns false when the job
    /// is unknown or already finished.
    pub fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        match jobs.get(job_id) {
            Some(shared) => {
                shared.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running_jobs(&self) -> Vec<String> {
        self.jobs
            .lock()
            .expect("job map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

// ============================================================================
// Worker
// ============================================================================

fn run_job(
    context: Arc<FsContext>,
    shared: Arc<JobShared>,
    jobs: JobMap,
    kind: FileJobKind,
    options: JobOptions,
) -> JobReport {
    shared.set_state(JobState::Running);
    if let Some(listener) = &options.listener {
        listener(&JobEvent::Started {
            job_id: shared.id().to_string(),
        });
    }

    let totals = match &kind {
        FileJobKind::Copy { sources, .. }
        | FileJobKind::Move { sources, .. }
        | FileJobKind::Delete { sources } => {
            scan::scan_sources(context.registry(), sources, &shared).unwrap_or_default()
        }
        _ => ScanTotals::default(),
    };

    let progress = Arc::new(ProgressState::new(
        shared.id().to_string(),
        options.listener.clone(),
        totals.files,
        totals.bytes,
    ));
    let node_progress: Arc<dyn Fn(u64) + Send + Sync> = {
        let progress = Arc::clone(&progress);
        Arc::new(move |bytes| progress.notify_bytes(bytes))
    };
    let ctx = OpCtx {
        context: Arc::clone(&context),
        shared: Arc::clone(&shared),
        progress,
        node_progress,
        replace_existing: options.replace_existing,
        progress_interval_bytes: options
            .progress_interval_bytes
            .unwrap_or(context.config().progress_interval_bytes),
    };

    let items = match kind {
        FileJobKind::Copy { sources, target_dir } => copy::run_copy(&ctx, &sources, &target_dir),
        FileJobKind::Move { sources, target_dir } => move_op::run_move(&ctx, &sources, &target_dir),
        FileJobKind::Delete { sources } => delete::run_delete(&ctx, &sources),
        FileJobKind::CreateFile { path } => run_single(&ctx, &path, |backend, path| {
            backend.create_file(path)
        }),
        FileJobKind::CreateDirectory { path } => run_single(&ctx, &path, |backend, path| {
            backend.create_directory(path)
        }),
        FileJobKind::Rename { path, new_name } => run_single(&ctx, &path, |backend, path| {
            let target = path.resolve_sibling(&new_name)?;
            backend.rename(path, &target, ctx.replace_existing)
        }),
    };

    let state = final_state(&shared, &items);
    shared.set_state(state);
    jobs.lock().expect("job map lock poisoned").remove(shared.id());
    log::info!(
        "ops: job {} finished with {:?} ({} items, {} failed)",
        shared.id(),
        state,
        items.len(),
        items.iter().filter(|item| item.error.is_some()).count()
    );
    JobReport {
        job_id: shared.id().to_string(),
        state,
        items,
        files_total: totals.files,
        bytes_total: totals.bytes,
    }
}

fn run_single(
    ctx: &OpCtx,
    path: &VfsPath,
    op: impl FnOnce(&dyn Backend, &VfsPath) -> Result<(), FsError>,
) -> Vec<ItemReport> {
    let display = path.display();
    let result = if ctx.shared.is_cancelled() {
        Err(FsError::Interrupted)
    } else {
        ctx.registry().resolve(path).and_then(|backend| op(&*backend, path))
    };
    ctx.progress.item_finished(display.clone(), result.as_ref().err());
    vec![ItemReport::from_result(display, result)]
}

fn final_state(shared: &JobShared, items: &[ItemReport]) -> JobState {
    let interrupted = shared.is_cancelled()
        || items
            .iter()
            .any(|item| matches!(item.error, Some(FsError::Interrupted)));
    if interrupted {
        JobState::Cancelled
    } else if items.iter().any(|item| item.error.is_some()) {
        JobState::PartiallyFailed
    } else {
        JobState::Completed
    }
}
