//! Engine scenarios against the local backend on temp directories.

use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};

use super::*;
use crate::backend::BackendKey;
use crate::backend::document::memory::MemoryDocumentProvider;
use crate::config::FsConfig;

fn setup() -> (tempfile::TempDir, Arc<FsContext>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let context = Arc::new(FsContext::new(FsConfig::default()));
    context.mount_local(dir.path());
    (dir, context)
}

fn local_key(dir: &tempfile::TempDir) -> BackendKey {
    BackendKey::new(crate::backend::local::SCHEME, dir.path().display().to_string())
}

fn vpath(key: &BackendKey, raw: &str) -> VfsPath {
    VfsPath::parse(key.clone(), raw.as_bytes()).unwrap()
}

#[test]
fn copy_file_reports_progress_with_final_size() {
    let (dir, context) = setup();
    std::fs::create_dir(dir.path().join("a")).unwrap();
    std::fs::write(dir.path().join("a/file.txt"), b"0123456789").unwrap();
    std::fs::create_dir(dir.path().join("b")).unwrap();
    let key = local_key(&dir);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: JobListener = Arc::new(move |event| {
        if let JobEvent::Progress(progress) = event {
            sink.lock().unwrap().push(progress.bytes_done);
        }
    });

    let engine = FileOperationEngine::new(Arc::clone(&context));
    let report = engine
        .submit(
            FileJobKind::Copy {
                sources: vec![vpath(&key, "/a/file.txt")],
                target_dir: vpath(&key, "/b"),
            },
            JobOptions {
                listener: Some(listener),
                ..JobOptions::default()
            },
        )
        .join();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.bytes_total, 10);
    assert_eq!(std::fs::read(dir.path().join("b/file.txt")).unwrap(), b"0123456789");
    assert!(seen.lock().unwrap().contains(&10));
}

#[test]
fn delete_removes_tree_bottom_up() {
    let (dir, context) = setup();
    std::fs::create_dir(dir.path().join("a")).unwrap();
    std::fs::write(dir.path().join("a/x"), b"x").unwrap();
    std::fs::create_dir(dir.path().join("a/y")).unwrap();
    std::fs::write(dir.path().join("a/y/z"), b"z").unwrap();
    let key = local_key(&dir);

    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&removed);
    let listener: JobListener = Arc::new(move |event| {
        if let JobEvent::NodeRemoved { path } = event {
            sink.lock().unwrap().push(path.clone());
        }
    });

    let engine = FileOperationEngine::new(Arc::clone(&context));
    let report = engine
        .submit(
            FileJobKind::Delete {
                sources: vec![vpath(&key, "/a")],
            },
            JobOptions {
                listener: Some(listener),
                ..JobOptions::default()
            },
        )
        .join();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(
        *removed.lock().unwrap(),
        vec!["/a/y/z", "/a/y", "/a/x", "/a"]
    );
    assert!(!dir.path().join("a").exists());
}

#[test]
fn delete_interruption_leaves_remaining_nodes() {
    let (dir, context) = setup();
    std::fs::create_dir(dir.path().join("a")).unwrap();
    std::fs::write(dir.path().join("a/x"), b"x").unwrap();
    std::fs::create_dir(dir.path().join("a/y")).unwrap();
    std::fs::write(dir.path().join("a/y/z"), b"z").unwrap();
    let key = local_key(&dir);

    let engine = Arc::new(FileOperationEngine::new(Arc::clone(&context)));
    let job_id = Arc::new(Mutex::new(None::<String>));

    // Cancel as soon as /a/y is gone; events fire synchronously on the
    // worker, so the cancellation lands before the next removal's check.
    let cancel_engine = Arc::clone(&engine);
    let cancel_id = Arc::clone(&job_id);
    let listener: JobListener = Arc::new(move |event| match event {
        JobEvent::Started { job_id } => {
            *cancel_id.lock().unwrap() = Some(job_id.clone());
        }
        JobEvent::NodeRemoved { path } if path.as_str() == "/a/y" => {
            if let Some(id) = cancel_id.lock().unwrap().as_deref() {
                cancel_engine.cancel(id);
            }
        }
        _ => {}
    });

    let report = engine
        .submit(
            FileJobKind::Delete {
                sources: vec![vpath(&key, "/a")],
            },
            JobOptions {
                listener: Some(listener),
                ..JobOptions::default()
            },
        )
        .join();

    assert_eq!(report.state, JobState::Cancelled);
    assert!(!dir.path().join("a/y").exists());
    assert!(dir.path().join("a/x").exists());
    assert!(dir.path().join("a").exists());
}

#[test]
fn move_via_rename_leaves_no_residue_and_keeps_mode() {
    let (dir, context) = setup();
    std::fs::create_dir(dir.path().join("a")).unwrap();
    std::fs::create_dir(dir.path().join("b")).unwrap();
    let source = dir.path().join("a/tool.sh");
    std::fs::write(&source, b"#!/bin/sh").unwrap();
    std::fs::set_permissions(&source, std::fs::Permissions::from_mode(0o640)).unwrap();
    let key = local_key(&dir);

    let engine = FileOperationEngine::new(Arc::clone(&context));
    let report = engine
        .submit(
            FileJobKind::Move {
                sources: vec![vpath(&key, "/a/tool.sh")],
                target_dir: vpath(&key, "/b"),
            },
            JobOptions::default(),
        )
        .join();

    assert_eq!(report.state, JobState::Completed);
    assert!(!source.exists());
    let meta = std::fs::metadata(dir.path().join("b/tool.sh")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o777, 0o640);
}

#[test]
fn copy_into_own_descendant_fails_and_changes_nothing() {
    let (dir, context) = setup();
    std::fs::create_dir(dir.path().join("d")).unwrap();
    std::fs::create_dir(dir.path().join("d/sub")).unwrap();
    std::fs::write(dir.path().join("d/f"), b"data").unwrap();
    let key = local_key(&dir);

    let engine = FileOperationEngine::new(Arc::clone(&context));
    let report = engine
        .submit(
            FileJobKind::Copy {
                sources: vec![vpath(&key, "/d")],
                target_dir: vpath(&key, "/d/sub"),
            },
            JobOptions::default(),
        )
        .join();

    assert_eq!(report.state, JobState::PartiallyFailed);
    assert!(matches!(
        report.items[0].error,
        Some(FsError::CannotCopyIntoItself { .. })
    ));
    assert!(!dir.path().join("d/sub/d").exists());
}

#[test]
fn copy_into_same_directory_duplicates_the_name() {
    let (dir, context) = setup();
    std::fs::create_dir(dir.path().join("a")).unwrap();
    std::fs::write(dir.path().join("a/f.txt"), b"original").unwrap();
    let key = local_key(&dir);

    let engine = FileOperationEngine::new(Arc::clone(&context));
    let report = engine
        .submit(
            FileJobKind::Copy {
                sources: vec![vpath(&key, "/a/f.txt")],
                target_dir: vpath(&key, "/a"),
            },
            JobOptions::default(),
        )
        .join();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(std::fs::read(dir.path().join("a/f (1).txt")).unwrap(), b"original");
    assert_eq!(std::fs::read(dir.path().join("a/f.txt")).unwrap(), b"original");
}

#[test]
fn failed_item_does_not_abort_siblings() {
    let (dir, context) = setup();
    std::fs::write(dir.path().join("good.txt"), b"fine").unwrap();
    std::fs::create_dir(dir.path().join("out")).unwrap();
    let key = local_key(&dir);

    let engine = FileOperationEngine::new(Arc::clone(&context));
    let report = engine
        .submit(
            FileJobKind::Copy {
                sources: vec![vpath(&key, "/missing.txt"), vpath(&key, "/good.txt")],
                target_dir: vpath(&key, "/out"),
            },
            JobOptions::default(),
        )
        .join();

    assert_eq!(report.state, JobState::PartiallyFailed);
    assert!(matches!(report.items[0].error, Some(FsError::NotFound { .. })));
    assert!(report.items[1].error.is_none());
    assert_eq!(std::fs::read(dir.path().join("out/good.txt")).unwrap(), b"fine");
}

#[test]
fn cross_backend_copy_streams_between_instances() {
    let (dir, context) = setup();
    std::fs::write(dir.path().join("src.bin"), b"across backends").unwrap();
    let key = local_key(&dir);
    let document = context.mount_document(Arc::new(MemoryDocumentProvider::new("grant-1")));
    let doc_root = VfsPath::root(document.key());

    let engine = FileOperationEngine::new(Arc::clone(&context));
    let report = engine
        .submit(
            FileJobKind::Copy {
                sources: vec![vpath(&key, "/src.bin")],
                target_dir: doc_root.clone(),
            },
            JobOptions::default(),
        )
        .join();

    assert_eq!(report.state, JobState::Completed);
    let mut stream = document
        .open_read(&doc_root.join(b"src.bin").unwrap())
        .unwrap();
    let mut content = Vec::new();
    std::io::Read::read_to_end(&mut stream, &mut content).unwrap();
    assert_eq!(content, b"across backends");
}

#[test]
fn cross_backend_move_copies_then_deletes_source() {
    let (dir, context) = setup();
    std::fs::write(dir.path().join("src.bin"), b"gone after").unwrap();
    let key = local_key(&dir);
    let document = context.mount_document(Arc::new(MemoryDocumentProvider::new("grant-2")));
    let doc_root = VfsPath::root(document.key());

    let engine = FileOperationEngine::new(Arc::clone(&context));
    let report = engine
        .submit(
            FileJobKind::Move {
                sources: vec![vpath(&key, "/src.bin")],
                target_dir: doc_root.clone(),
            },
            JobOptions::default(),
        )
        .join();

    assert_eq!(report.state, JobState::Completed);
    assert!(!dir.path().join("src.bin").exists());
    assert!(
        document
            .read_attributes(&doc_root.join(b"src.bin").unwrap(), false)
            .is_ok()
    );
}

#[test]
fn rename_job_renames_in_place() {
    let (dir, context) = setup();
    std::fs::write(dir.path().join("old.txt"), b"same bytes").unwrap();
    let key = local_key(&dir);

    let engine = FileOperationEngine::new(Arc::clone(&context));
    let report = engine
        .submit(
            FileJobKind::Rename {
                path: vpath(&key, "/old.txt"),
                new_name: b"new.txt".to_vec(),
            },
            JobOptions::default(),
        )
        .join();

    assert_eq!(report.state, JobState::Completed);
    assert!(!dir.path().join("old.txt").exists());
    assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"same bytes");
}

#[test]
fn create_jobs_report_already_exists() {
    let (dir, context) = setup();
    let key = local_key(&dir);
    let engine = FileOperationEngine::new(Arc::clone(&context));

    let report = engine
        .submit(
            FileJobKind::CreateDirectory {
                path: vpath(&key, "/made"),
            },
            JobOptions::default(),
        )
        .join();
    assert_eq!(report.state, JobState::Completed);
    assert!(dir.path().join("made").is_dir());

    let report = engine
        .submit(
            FileJobKind::CreateFile {
                path: vpath(&key, "/made"),
            },
            JobOptions::default(),
        )
        .join();
    assert_eq!(report.state, JobState::PartiallyFailed);
    assert!(matches!(report.items[0].error, Some(FsError::AlreadyExists { .. })));
}
