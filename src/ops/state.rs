//! Job lifecycle state, cooperative cancellation, and progress accounting.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::types::{JobEvent, JobListener, JobProgressEvent, JobState};
use crate::backend::FsError;
use crate::path::VfsPath;

/// State shared between a job's worker thread and its callers.
pub struct JobShared {
    id: String,
    state: Mutex<JobState>,
    cancelled: AtomicBool,
}

impl JobShared {
    pub(super) fn new(id: String) -> Self {
        Self {
            id,
            state: Mutex::new(JobState::Created),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().expect("job state lock poisoned")
    }

    pub(super) fn set_state(&self, state: JobState) {
        *self.state.lock().expect("job state lock poisoned") = state;
    }

    /// Requests cooperative cancellation; the worker aborts at its next
    /// recursion step or chunk boundary. Completed items stay as they are.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn cancelled_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    /// Proactive interruption check, used at every recursion step.
    pub(super) fn check_interrupted(&self) -> Result<(), FsError> {
        if self.is_cancelled() {
            return Err(FsError::Interrupted);
        }
        Ok(())
    }
}

/// Per-job progress accounting: completed-node bytes plus the in-flight
/// node's transferred bytes, reported against the scan totals.
pub(super) struct ProgressState {
    pub job_id: String,
    pub listener: Option<JobListener>,
    pub files_total: usize,
    pub bytes_total: u64,
    files_done: AtomicUsize,
    bytes_base: AtomicU64,
}

impl ProgressState {
    pub fn new(
        job_id: String,
        listener: Option<JobListener>,
        files_total: usize,
        bytes_total: u64,
    ) -> Self {
        Self {
            job_id,
            listener,
            files_total,
            bytes_total,
            files_done: AtomicUsize::new(0),
            bytes_base: AtomicU64::new(0),
        }
    }

    pub fn emit(&self, event: &JobEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    fn progress_event(&self, in_flight: u64) -> JobProgressEvent {
        JobProgressEvent {
            job_id: self.job_id.clone(),
            files_done: self.files_done.load(Ordering::Relaxed),
            files_total: self.files_total,
            bytes_done: self.bytes_base.load(Ordering::Relaxed) + in_flight,
            bytes_total: self.bytes_total,
        }
    }

    /// Mid-node progress: `in_flight` bytes of the current node are done.
    pub fn notify_bytes(&self, in_flight: u64) {
        self.emit(&JobEvent::Progress(self.progress_event(in_flight)));
    }

    /// One node finished; its bytes move from in-flight to the base.
    pub fn node_done(&self, bytes: u64) {
        self.bytes_base.fetch_add(bytes, Ordering::Relaxed);
        self.files_done.fetch_add(1, Ordering::Relaxed);
        self.emit(&JobEvent::Progress(self.progress_event(0)));
    }

    pub fn node_removed(&self, path: &VfsPath) {
        self.emit(&JobEvent::NodeRemoved {
            path: path.display(),
        });
    }

    pub fn item_finished(&self, path: String, error: Option<&FsError>) {
        self.emit(&JobEvent::ItemFinished {
            path,
            error: error.cloned(),
        });
    }
}
