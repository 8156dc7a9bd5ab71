//! In-memory document provider.
//!
//! A complete provider over an in-memory tree, used by tests and as the
//! reference implementation of the provider contract.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{DIRECTORY_MIME_TYPE, DocumentInfo, DocumentProvider, FLAG_SUPPORTS_COPY};
use crate::backend::{FsError, ReadStream};
use crate::watch::{ChangeListener, WatchHandle};

struct MemoryDocument {
    mime_type: String,
    data: Vec<u8>,
    modified: i64,
}

impl MemoryDocument {
    fn is_directory(&self) -> bool {
        self.mime_type == DIRECTORY_MIME_TYPE
    }
}

type Subscriber = (u64, Vec<u8>, Arc<ChangeListener>);

/// Document provider over an in-memory tree keyed by absolute byte paths.
pub struct MemoryDocumentProvider {
    tree_id: String,
    docs: Mutex<HashMap<Vec<u8>, MemoryDocument>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_subscriber: AtomicU64,
    /// Advertise provider-side copy on regular documents.
    advertise_copy: bool,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn parent_of(path: &[u8]) -> Option<Vec<u8>> {
    if path == b"/" {
        return None;
    }
    match path.iter().rposition(|&b| b == b'/') {
        Some(0) => Some(b"/".to_vec()),
        Some(at) => Some(path[..at].to_vec()),
        None => None,
    }
}

fn file_name_of(path: &[u8]) -> Vec<u8> {
    match path.iter().rposition(|&b| b == b'/') {
        Some(at) => path[at + 1..].to_vec(),
        None => path.to_vec(),
    }
}

fn is_descendant(path: &[u8], ancestor: &[u8]) -> bool {
    if ancestor == b"/" {
        return path != b"/";
    }
    path.len() > ancestor.len() && path.starts_with(ancestor) && path[ancestor.len()] == b'/'
}

impl MemoryDocumentProvider {
    pub fn new(tree_id: impl Into<String>) -> Self {
        let mut docs = HashMap::new();
        docs.insert(
            b"/".to_vec(),
            MemoryDocument {
                mime_type: DIRECTORY_MIME_TYPE.to_string(),
                data: Vec::new(),
                modified: now_unix(),
            },
        );
        Self {
            tree_id: tree_id.into(),
            docs: Mutex::new(docs),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: AtomicU64::new(1),
            advertise_copy: false,
        }
    }

    /// Advertise provider-side copy, exercising the backend's fast path.
    pub fn with_provider_copy(mut self) -> Self {
        self.advertise_copy = true;
        self
    }

    fn flags_for(&self, doc: &MemoryDocument) -> u32 {
        if self.advertise_copy && !doc.is_directory() {
            FLAG_SUPPORTS_COPY
        } else {
            0
        }
    }

    fn notify(&self, changed: &[u8]) {
        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for (_, observed, listener) in subscribers.iter() {
            if observed.as_slice() == changed
                || is_descendant(changed, observed)
                || parent_of(changed).as_deref() == Some(observed)
            {
                listener();
            }
        }
    }
}

impl DocumentProvider for MemoryDocumentProvider {
    fn tree_id(&self) -> &str {
        &self.tree_id
    }

    fn query(&self, path: &[u8]) -> Result<Option<DocumentInfo>, FsError> {
        let docs = self.docs.lock().expect("document lock poisoned");
        Ok(docs.get(path).map(|doc| DocumentInfo {
            mime_type: doc.mime_type.clone(),
            size: doc.data.len() as u64,
            modified: Some(doc.modified),
            flags: self.flags_for(doc),
        }))
    }

    fn list(&self, path: &[u8]) -> Result<Vec<(Vec<u8>, DocumentInfo)>, FsError> {
        let docs = self.docs.lock().expect("document lock poisoned");
        let mut children = Vec::new();
        for (doc_path, doc) in docs.iter() {
            if parent_of(doc_path).as_deref() == Some(path) {
                children.push((
                    file_name_of(doc_path),
                    DocumentInfo {
                        mime_type: doc.mime_type.clone(),
                        size: doc.data.len() as u64,
                        modified: Some(doc.modified),
                        flags: self.flags_for(doc),
                    },
                ));
            }
        }
        Ok(children)
    }

    fn create(&self, path: &[u8], mime_type: &str) -> Result<(), FsError> {
        {
            let mut docs = self.docs.lock().expect("document lock poisoned");
            if docs.contains_key(path) {
                return Err(FsError::AlreadyExists {
                    path: String::from_utf8_lossy(path).to_string(),
                });
            }
            let parent = parent_of(path).ok_or_else(|| FsError::InvalidPath {
                path: String::from_utf8_lossy(path).to_string(),
                message: "document path has no parent".to_string(),
            })?;
            match docs.get(&parent) {
                Some(doc) if doc.is_directory() => {}
                Some(_) => {
                    return Err(FsError::NotDirectory {
                        path: String::from_utf8_lossy(&parent).to_string(),
                    });
                }
                None => {
                    return Err(FsError::NotFound {
                        path: String::from_utf8_lossy(&parent).to_string(),
                    });
                }
            }
            docs.insert(
                path.to_vec(),
                MemoryDocument {
                    mime_type: mime_type.to_string(),
                    data: Vec::new(),
                    modified: now_unix(),
                },
            );
        }
        self.notify(path);
        Ok(())
    }

    fn delete(&self, path: &[u8]) -> Result<(), FsError> {
        {
            let mut docs = self.docs.lock().expect("document lock poisoned");
            if docs.remove(path).is_none() {
                return Err(FsError::NotFound {
                    path: String::from_utf8_lossy(path).to_string(),
                });
            }
            // Provider-side delete takes descendants with it.
            docs.retain(|doc_path, _| !is_descendant(doc_path, path));
        }
        self.notify(path);
        Ok(())
    }

    fn rename(&self, from: &[u8], to: &[u8]) -> Result<(), FsError> {
        {
            let mut docs = self.docs.lock().expect("document lock poisoned");
            if !docs.contains_key(from) {
                return Err(FsError::NotFound {
                    path: String::from_utf8_lossy(from).to_string(),
                });
            }
            if docs.contains_key(to) {
                return Err(FsError::AlreadyExists {
                    path: String::from_utf8_lossy(to).to_string(),
                });
            }
            let moved: Vec<Vec<u8>> = docs
                .keys()
                .filter(|p| p.as_slice() == from || is_descendant(p, from))
                .cloned()
                .collect();
            for old_path in moved {
                let mut new_path = to.to_vec();
                new_path.extend_from_slice(&old_path[from.len()..]);
                if let Some(doc) = docs.remove(&old_path) {
                    docs.insert(new_path, doc);
                }
            }
        }
        self.notify(from);
        self.notify(to);
        Ok(())
    }

    fn copy(&self, from: &[u8], to: &[u8]) -> Result<(), FsError> {
        {
            let mut docs = self.docs.lock().expect("document lock poisoned");
            let source = docs.get(from).ok_or_else(|| FsError::NotFound {
                path: String::from_utf8_lossy(from).to_string(),
            })?;
            let copied = MemoryDocument {
                mime_type: source.mime_type.clone(),
                data: source.data.clone(),
                modified: now_unix(),
            };
            docs.insert(to.to_vec(), copied);
        }
        self.notify(to);
        Ok(())
    }

    fn open_read(&self, path: &[u8]) -> Result<ReadStream, FsError> {
        let docs = self.docs.lock().expect("document lock poisoned");
        let doc = docs.get(path).ok_or_else(|| FsError::NotFound {
            path: String::from_utf8_lossy(path).to_string(),
        })?;
        Ok(Box::new(std::io::Cursor::new(doc.data.clone())))
    }

    fn write(&self, path: &[u8], data: &mut dyn Read) -> Result<u64, FsError> {
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer).map_err(|e| {
            FsError::from_io_kind(String::from_utf8_lossy(path).to_string(), e)
        })?;
        let written = buffer.len() as u64;
        {
            let mut docs = self.docs.lock().expect("document lock poisoned");
            let doc = docs.get_mut(path).ok_or_else(|| FsError::NotFound {
                path: String::from_utf8_lossy(path).to_string(),
            })?;
            doc.data = buffer;
            doc.modified = now_unix();
        }
        self.notify(path);
        Ok(written)
    }

    fn subscribe(&self, path: &[u8], listener: ChangeListener) -> Result<Box<dyn WatchHandle>, FsError> {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push((id, path.to_vec(), Arc::new(listener)));
        Ok(Box::new(MemoryWatchHandle {
            id,
            subscribers: Arc::clone(&self.subscribers),
        }))
    }
}

struct MemoryWatchHandle {
    id: u64,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl WatchHandle for MemoryWatchHandle {
    fn close(&mut self) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|(id, _, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::backend::document::DocumentBackend;
    use crate::backend::{Backend, CopyOptions, FsError};
    use crate::path::VfsPath;

    fn backend() -> DocumentBackend {
        DocumentBackend::new(Arc::new(MemoryDocumentProvider::new("tree-1")))
    }

    fn vpath(backend: &DocumentBackend, raw: &str) -> VfsPath {
        VfsPath::parse(backend.key(), raw.as_bytes()).unwrap()
    }

    #[test]
    fn create_list_and_delete() {
        let backend = backend();
        backend.create_directory(&vpath(&backend, "/docs")).unwrap();
        backend.create_file(&vpath(&backend, "/docs/a.txt")).unwrap();
        backend.create_file(&vpath(&backend, "/docs/b.txt")).unwrap();

        let children = backend.list_children(&vpath(&backend, "/docs")).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].0, b"a.txt".to_vec());

        backend.delete(&vpath(&backend, "/docs/a.txt")).unwrap();
        assert_eq!(backend.list_children(&vpath(&backend, "/docs")).unwrap().len(), 1);
    }

    #[test]
    fn copy_to_same_path_is_identity_with_progress() {
        let backend = backend();
        backend.create_file(&vpath(&backend, "/f")).unwrap();
        backend
            .write_from_stream(
                &vpath(&backend, "/f"),
                4,
                Box::new(std::io::Cursor::new(b"data".to_vec())),
                true,
            )
            .unwrap();

        let reported = Mutex::new(Vec::new());
        let progress = |bytes: u64| reported.lock().unwrap().push(bytes);
        let options = CopyOptions {
            progress: Some(&progress),
            ..CopyOptions::default()
        };
        backend
            .copy(&vpath(&backend, "/f"), &vpath(&backend, "/f"), &options)
            .unwrap();
        assert_eq!(*reported.lock().unwrap(), vec![4]);
    }

    #[test]
    fn copy_streams_content_between_documents() {
        let backend = backend();
        backend.create_file(&vpath(&backend, "/src")).unwrap();
        backend
            .write_from_stream(
                &vpath(&backend, "/src"),
                5,
                Box::new(std::io::Cursor::new(b"bytes".to_vec())),
                true,
            )
            .unwrap();

        backend
            .copy(&vpath(&backend, "/src"), &vpath(&backend, "/dst"), &CopyOptions::default())
            .unwrap();
        let mut stream = backend.open_read(&vpath(&backend, "/dst")).unwrap();
        let mut content = Vec::new();
        stream.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"bytes");
    }

    #[test]
    fn symlinks_are_unsupported() {
        let backend = backend();
        let err = backend.read_symbolic_link(&vpath(&backend, "/f")).unwrap_err();
        assert!(matches!(err, FsError::Unsupported { .. }));
        let err = backend
            .create_symbolic_link(&vpath(&backend, "/f"), b"target")
            .unwrap_err();
        assert!(matches!(err, FsError::Unsupported { .. }));
    }

    #[test]
    fn move_within_tree_renames() {
        let backend = backend();
        backend.create_directory(&vpath(&backend, "/a")).unwrap();
        backend.create_file(&vpath(&backend, "/a/f")).unwrap();
        backend.create_directory(&vpath(&backend, "/b")).unwrap();

        backend
            .move_to(&vpath(&backend, "/a/f"), &vpath(&backend, "/b/f"), &CopyOptions::default())
            .unwrap();
        assert!(backend.read_attributes(&vpath(&backend, "/a/f"), false).is_err());
        assert!(backend.read_attributes(&vpath(&backend, "/b/f"), false).is_ok());
    }

    #[test]
    fn observe_pushes_change_notifications() {
        let backend = backend();
        backend.create_directory(&vpath(&backend, "/watched")).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_count = Arc::clone(&fired);
        let mut handle = backend
            .observe(
                &vpath(&backend, "/watched"),
                std::time::Duration::from_millis(0),
                Box::new(move || {
                    fired_count.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        backend.create_file(&vpath(&backend, "/watched/new")).unwrap();
        assert!(fired.load(Ordering::Relaxed) >= 1);

        handle.close();
        backend.create_file(&vpath(&backend, "/watched/another")).unwrap();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }
}
