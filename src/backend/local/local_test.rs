//! Tests for the local backend against real temp directories.

use std::os::unix::fs::PermissionsExt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::LocalBackend;
use crate::backend::{Backend, CopyOptions, FileType, FsError};
use crate::path::VfsPath;

fn setup() -> (tempfile::TempDir, LocalBackend) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let backend = LocalBackend::new(dir.path());
    (dir, backend)
}

fn vpath(backend: &LocalBackend, raw: &str) -> VfsPath {
    VfsPath::parse(backend.key(), raw.as_bytes()).unwrap()
}

#[test]
fn read_attributes_reports_type_and_size() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("file.txt"), b"hello").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();

    let attrs = backend.read_attributes(&vpath(&backend, "/file.txt"), false).unwrap();
    assert_eq!(attrs.file_type, FileType::Regular);
    assert_eq!(attrs.size, 5);
    assert!(attrs.posix().is_some());

    let attrs = backend.read_attributes(&vpath(&backend, "/sub"), false).unwrap();
    assert_eq!(attrs.file_type, FileType::Directory);
}

#[test]
fn read_attributes_missing_is_not_found() {
    let (_dir, backend) = setup();
    let err = backend
        .read_attributes(&vpath(&backend, "/missing"), false)
        .unwrap_err();
    assert!(matches!(err, FsError::NotFound { .. }));
}

#[test]
fn list_children_sorts_directories_first() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("b.txt"), b"").unwrap();
    std::fs::write(dir.path().join("a.txt"), b"").unwrap();
    std::fs::create_dir(dir.path().join("zdir")).unwrap();

    let children = backend.list_children(&vpath(&backend, "/")).unwrap();
    let names: Vec<String> = children
        .iter()
        .map(|(n, _)| String::from_utf8_lossy(n).to_string())
        .collect();
    assert_eq!(names, vec!["zdir", "a.txt", "b.txt"]);
}

#[test]
fn copy_file_transfers_bytes_and_reports_progress() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("src.txt"), b"0123456789").unwrap();
    std::fs::create_dir(dir.path().join("b")).unwrap();

    let reported = Mutex::new(Vec::new());
    let progress = |bytes: u64| reported.lock().unwrap().push(bytes);
    let options = CopyOptions {
        progress: Some(&progress),
        ..CopyOptions::default()
    };
    backend
        .copy(&vpath(&backend, "/src.txt"), &vpath(&backend, "/b/src.txt"), &options)
        .unwrap();

    assert_eq!(std::fs::read(dir.path().join("b/src.txt")).unwrap(), b"0123456789");
    let reported = reported.lock().unwrap();
    // Invoked at least once, with the final size.
    assert!(!reported.is_empty());
    assert_eq!(*reported.last().unwrap(), 10);
}

#[test]
fn copy_refuses_existing_target_without_replace() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("src"), b"new").unwrap();
    std::fs::write(dir.path().join("dst"), b"old").unwrap();

    let err = backend
        .copy(
            &vpath(&backend, "/src"),
            &vpath(&backend, "/dst"),
            &CopyOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists { .. }));
    assert_eq!(std::fs::read(dir.path().join("dst")).unwrap(), b"old");

    let options = CopyOptions {
        replace_existing: true,
        ..CopyOptions::default()
    };
    backend
        .copy(&vpath(&backend, "/src"), &vpath(&backend, "/dst"), &options)
        .unwrap();
    assert_eq!(std::fs::read(dir.path().join("dst")).unwrap(), b"new");
}

#[test]
fn copy_preserves_permission_bits() {
    let (dir, backend) = setup();
    let src = dir.path().join("script.sh");
    std::fs::write(&src, b"#!/bin/sh").unwrap();
    std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o755)).unwrap();

    backend
        .copy(
            &vpath(&backend, "/script.sh"),
            &vpath(&backend, "/copy.sh"),
            &CopyOptions::default(),
        )
        .unwrap();
    let mode = std::fs::metadata(dir.path().join("copy.sh")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn copy_recreates_symlink() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("target"), b"x").unwrap();
    std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();

    backend
        .copy(
            &vpath(&backend, "/link"),
            &vpath(&backend, "/link2"),
            &CopyOptions::default(),
        )
        .unwrap();
    let target = std::fs::read_link(dir.path().join("link2")).unwrap();
    assert_eq!(target.to_str().unwrap(), "target");
}

#[test]
fn copy_symlink_over_directory_is_rejected() {
    let (dir, backend) = setup();
    std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();
    std::fs::create_dir(dir.path().join("d")).unwrap();

    let options = CopyOptions {
        replace_existing: true,
        ..CopyOptions::default()
    };
    let err = backend
        .copy(&vpath(&backend, "/link"), &vpath(&backend, "/d"), &options)
        .unwrap_err();
    assert!(matches!(err, FsError::IsDirectory { .. }));
}

#[test]
fn copy_onto_same_inode_is_identity() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("file"), b"content").unwrap();
    std::fs::hard_link(dir.path().join("file"), dir.path().join("alias")).unwrap();

    let reported = Mutex::new(Vec::new());
    let progress = |bytes: u64| reported.lock().unwrap().push(bytes);
    let options = CopyOptions {
        replace_existing: true,
        progress: Some(&progress),
        ..CopyOptions::default()
    };
    backend
        .copy(&vpath(&backend, "/file"), &vpath(&backend, "/alias"), &options)
        .unwrap();
    assert_eq!(std::fs::read(dir.path().join("alias")).unwrap(), b"content");
    assert_eq!(*reported.lock().unwrap(), vec![7]);
}

#[test]
fn copy_cancelled_before_transfer_leaves_no_target() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("src"), b"data").unwrap();

    let cancelled = AtomicBool::new(true);
    let options = CopyOptions {
        cancelled: Some(&cancelled),
        ..CopyOptions::default()
    };
    let err = backend
        .copy(&vpath(&backend, "/src"), &vpath(&backend, "/dst"), &options)
        .unwrap_err();
    assert!(matches!(err, FsError::Interrupted));
    assert!(!dir.path().join("dst").exists());
    cancelled.store(false, Ordering::Relaxed);
}

#[test]
fn move_renames_and_preserves_mode() {
    let (dir, backend) = setup();
    let src = dir.path().join("src");
    std::fs::write(&src, b"payload").unwrap();
    std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o640)).unwrap();

    backend
        .move_to(
            &vpath(&backend, "/src"),
            &vpath(&backend, "/dst"),
            &CopyOptions::default(),
        )
        .unwrap();
    assert!(!src.exists());
    let meta = std::fs::metadata(dir.path().join("dst")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o777, 0o640);
    assert_eq!(std::fs::read(dir.path().join("dst")).unwrap(), b"payload");
}

#[test]
fn rename_refuses_existing_destination() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("a"), b"").unwrap();
    std::fs::write(dir.path().join("b"), b"").unwrap();

    let err = backend
        .rename(&vpath(&backend, "/a"), &vpath(&backend, "/b"), false)
        .unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists { .. }));

    backend
        .rename(&vpath(&backend, "/a"), &vpath(&backend, "/c"), false)
        .unwrap();
    assert!(dir.path().join("c").exists());
}

#[test]
fn delete_removes_files_and_empty_directories() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    std::fs::create_dir(dir.path().join("d")).unwrap();

    backend.delete(&vpath(&backend, "/f")).unwrap();
    backend.delete(&vpath(&backend, "/d")).unwrap();
    assert!(!dir.path().join("f").exists());
    assert!(!dir.path().join("d").exists());
}

#[test]
fn create_file_is_exclusive() {
    let (dir, backend) = setup();
    backend.create_file(&vpath(&backend, "/new")).unwrap();
    assert!(dir.path().join("new").exists());
    let err = backend.create_file(&vpath(&backend, "/new")).unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists { .. }));
}

#[test]
fn closed_backend_turns_paths_inert() {
    let (dir, backend) = setup();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    let path = vpath(&backend, "/f");
    backend.close();
    let err = backend.read_attributes(&path, false).unwrap_err();
    assert!(matches!(err, FsError::BackendClosed { .. }));
}

#[test]
fn write_from_stream_writes_all_bytes() {
    let (dir, backend) = setup();
    let data: Vec<u8> = (0..=255u8).collect();
    let written = backend
        .write_from_stream(
            &vpath(&backend, "/blob"),
            data.len() as u64,
            Box::new(std::io::Cursor::new(data.clone())),
            false,
        )
        .unwrap();
    assert_eq!(written, 256);
    assert_eq!(std::fs::read(dir.path().join("blob")).unwrap(), data);
}
