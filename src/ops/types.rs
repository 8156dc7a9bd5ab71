//! Job kinds, per-item outcomes, and event payloads for the operation
//! engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::FsError;
use crate::path::VfsPath;

// ============================================================================
// Job model
// ============================================================================

/// One submitted unit of work with its input paths.
#[derive(Debug, Clone)]
pub enum FileJobKind {
    /// Recursively copy every source into the target directory.
    Copy { sources: Vec<VfsPath>, target_dir: VfsPath },
    /// Move every source into the target directory (rename-first).
    Move { sources: Vec<VfsPath>, target_dir: VfsPath },
    /// Recursively delete every source, children before parents.
    Delete { sources: Vec<VfsPath> },
    CreateFile { path: VfsPath },
    CreateDirectory { path: VfsPath },
    /// Rename in place to a new name within the same parent.
    Rename { path: VfsPath, new_name: Vec<u8> },
}

impl FileJobKind {
    pub fn label(&self) -> &'static str {
        match self {
            FileJobKind::Copy { .. } => "copy",
            FileJobKind::Move { .. } => "move",
            FileJobKind::Delete { .. } => "delete",
            FileJobKind::CreateFile { .. } => "create_file",
            FileJobKind::CreateDirectory { .. } => "create_directory",
            FileJobKind::Rename { .. } => "rename",
        }
    }
}

/// Job lifecycle. Jobs retain no state after reaching a terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Queued,
    Running,
    Completed,
    PartiallyFailed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::PartiallyFailed | JobState::Cancelled
        )
    }
}

// ============================================================================
// Reporting
// ============================================================================

/// Outcome of one batch item. Failures never abort sibling items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReport {
    pub path: String,
    pub error: Option<FsError>,
}

impl ItemReport {
    pub fn ok(path: String) -> Self {
        Self { path, error: None }
    }

    pub fn from_result(path: String, result: Result<(), FsError>) -> Self {
        Self {
            path,
            error: result.err(),
        }
    }
}

/// Final report of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    pub state: JobState,
    pub items: Vec<ItemReport>,
    pub files_total: usize,
    pub bytes_total: u64,
}

impl JobReport {
    pub fn failed_items(&self) -> impl Iterator<Item = &ItemReport> {
        self.items.iter().filter(|item| item.error.is_some())
    }
}

/// Progress payload emitted while a job runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub files_done: usize,
    pub files_total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Events delivered synchronously on the worker thread. Dispatching them to
/// a UI thread is the embedder's business.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started { job_id: String },
    Progress(JobProgressEvent),
    /// One batch item finished, successfully or not.
    ItemFinished { path: String, error: Option<FsError> },
    /// One node was removed during a delete (children before parents).
    NodeRemoved { path: String },
}

pub type JobListener = Arc<dyn Fn(&JobEvent) + Send + Sync>;

/// Options for one submitted job.
#[derive(Clone, Default)]
pub struct JobOptions {
    /// Overwrite existing targets instead of failing with `AlreadyExists`.
    pub replace_existing: bool,
    /// Minimum bytes between progress events; the context default applies
    /// when unset.
    pub progress_interval_bytes: Option<u64>,
    pub listener: Option<JobListener>,
}
