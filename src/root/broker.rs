//! Long-lived privileged broker channel.
//!
//! A privileged helper process is launched once per context, under a mutex
//! so concurrent first calls never race two launches. The handshake is one
//! token line read within a bounded timeout through an mpsc-polled reader
//! thread; after that every call is a synchronous JSON request/response
//! line pair over the child's stdio. Channel death is detected by call
//! failure, and the next call relaunches the helper transparently.
//!
//! The helper side lives here too ([`serve`]) so an embedding can exec
//! itself (under `su`, `sudo`, or similar) as the broker.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::local::LocalBackend;
use crate::backend::{Backend, BackendKey, CopyOptions, FileAttributes, FsError};
use crate::path::VfsPath;

/// First token of the handshake line the helper prints when ready.
pub const HANDSHAKE_PREFIX: &str = "polyfs-broker";

// ============================================================================
// Protocol
// ============================================================================

/// One privileged request. Paths are absolute OS paths on the helper side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerRequest {
    ReadAttributes { path: String, follow_links: bool },
    ListChildren { path: String },
    CreateFile { path: String },
    CreateDirectory { path: String },
    Delete { path: String },
    Rename { from: String, to: String, replace: bool },
    Copy { from: String, to: String, replace: bool, move_semantics: bool },
    MoveTo { from: String, to: String, replace: bool },
    ReadSymbolicLink { path: String },
    CreateSymbolicLink { path: String, target: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BrokerResponse {
    Ok {
        #[serde(default)]
        value: serde_json::Value,
    },
    Err {
        error: FsError,
    },
}

/// Child listing entry as shipped over the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChild {
    pub name: String,
    pub attributes: FileAttributes,
}

fn channel_error(message: impl std::fmt::Display) -> FsError {
    FsError::Channel {
        message: message.to_string(),
    }
}

// ============================================================================
// Client side
// ============================================================================

struct BrokerChannel {
    child: Child,
    stdin: ChildStdin,
    lines: mpsc::Receiver<String>,
}

impl BrokerChannel {
    fn call(&mut self, request: &BrokerRequest) -> Result<BrokerResponse, FsError> {
        let line = serde_json::to_string(request).map_err(channel_error)?;
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.write_all(b"\n"))
            .and_then(|_| self.stdin.flush())
            .map_err(|e| channel_error(format!("broker write failed: {}", e)))?;
        match self.lines.recv() {
            Ok(line) => serde_json::from_str(&line)
                .map_err(|e| channel_error(format!("malformed broker response: {}", e))),
            Err(mpsc::RecvError) => Err(channel_error("broker process exited")),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for BrokerChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Client handle over the privileged helper. Shared process-wide; all calls
/// serialize on the channel mutex, which also makes get-or-launch atomic.
pub struct Broker {
    command: Vec<String>,
    connect_timeout: Duration,
    channel: Mutex<Option<BrokerChannel>>,
}

impl Broker {
    pub fn new(command: Vec<String>, connect_timeout: Duration) -> Self {
        Self {
            command,
            connect_timeout,
            channel: Mutex::new(None),
        }
    }

    /// Sends one request, launching the helper first if no channel is live.
    ///
    /// Transport failures tear the channel down and surface as
    /// `FsError::Channel`; the next call relaunches.
    pub fn call(&self, request: &BrokerRequest) -> Result<BrokerResponse, FsError> {
        let mut guard = self.channel.lock().expect("broker channel lock poisoned");
        if guard.is_none() {
            *guard = Some(self.launch()?);
        }
        let channel = guard.as_mut().expect("channel just ensured");
        match channel.call(request) {
            Ok(response) => Ok(response),
            Err(e) => {
                log::warn!("broker: channel died ({}), will relaunch on next call", e);
                guard.take();
                Err(e)
            }
        }
    }

    /// Tears the helper down explicitly.
    pub fn shutdown(&self) {
        self.channel.lock().expect("broker channel lock poisoned").take();
    }

    fn launch(&self) -> Result<BrokerChannel, FsError> {
        let Some(program) = self.command.first() else {
            return Err(channel_error("no broker command configured"));
        };
        log::info!("broker: launching privileged helper: {}", self.command.join(" "));
        let mut child = Command::new(program)
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| channel_error(format!("failed to launch broker: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| channel_error("broker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| channel_error("broker stdout unavailable"))?;

        // Reader thread pumps response lines into a channel so the
        // handshake wait can be bounded without platform select calls.
        let (sender, lines) = mpsc::channel::<String>();
        std::thread::Builder::new()
            .name("polyfs-broker-read".to_string())
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if sender.send(line).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| channel_error(format!("failed to spawn broker reader: {}", e)))?;

        let mut channel = BrokerChannel { child, stdin, lines };
        match channel.lines.recv_timeout(self.connect_timeout) {
            Ok(line) if line.starts_with(HANDSHAKE_PREFIX) => {
                log::debug!("broker: connected ({})", line);
                Ok(channel)
            }
            Ok(line) => {
                channel.shutdown();
                Err(channel_error(format!("unexpected broker handshake: {:?}", line)))
            }
            Err(_) => {
                channel.shutdown();
                Err(channel_error(format!(
                    "broker handshake timed out after {:?}",
                    self.connect_timeout
                )))
            }
        }
    }
}

// ============================================================================
// Remote backend
// ============================================================================

/// Backend whose operations run in the privileged helper, mirroring a local
/// backend instance. Streams and observers are not proxied; the routing
/// layer keeps those on the local side.
pub struct RemoteBackend {
    scheme: String,
    instance: String,
    root: PathBuf,
    broker: Arc<Broker>,
}

impl RemoteBackend {
    /// Mirrors the identity of `local`, rooted at the same OS directory.
    pub fn mirroring(local: &dyn Backend, root: impl Into<PathBuf>, broker: Arc<Broker>) -> Self {
        Self {
            scheme: local.scheme().to_string(),
            instance: local.instance().to_string(),
            root: root.into(),
            broker,
        }
    }

    fn resolve(&self, path: &VfsPath) -> String {
        let mut out = self.root.clone();
        for segment in path.segments() {
            #[cfg(unix)]
            {
                use std::os::unix::ffi::OsStrExt;
                out.push(std::ffi::OsStr::from_bytes(segment));
            }
        }
        out.display().to_string()
    }

    fn call(&self, request: BrokerRequest) -> Result<serde_json::Value, FsError> {
        match self.broker.call(&request)? {
            BrokerResponse::Ok { value } => Ok(value),
            BrokerResponse::Err { error } => Err(error),
        }
    }
}

impl Backend for RemoteBackend {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    fn read_attributes(&self, path: &VfsPath, follow_links: bool) -> Result<FileAttributes, FsError> {
        let value = self.call(BrokerRequest::ReadAttributes {
            path: self.resolve(path),
            follow_links,
        })?;
        serde_json::from_value(value).map_err(channel_error)
    }

    fn list_children(&self, path: &VfsPath) -> Result<Vec<(Vec<u8>, FileAttributes)>, FsError> {
        let value = self.call(BrokerRequest::ListChildren {
            path: self.resolve(path),
        })?;
        let children: Vec<RemoteChild> = serde_json::from_value(value).map_err(channel_error)?;
        Ok(children
            .into_iter()
            .map(|child| (child.name.into_bytes(), child.attributes))
            .collect())
    }

    fn create_file(&self, path: &VfsPath) -> Result<(), FsError> {
        self.call(BrokerRequest::CreateFile {
            path: self.resolve(path),
        })
        .map(|_| ())
    }

    fn create_directory(&self, path: &VfsPath) -> Result<(), FsError> {
        self.call(BrokerRequest::CreateDirectory {
            path: self.resolve(path),
        })
        .map(|_| ())
    }

    fn delete(&self, path: &VfsPath) -> Result<(), FsError> {
        self.call(BrokerRequest::Delete {
            path: self.resolve(path),
        })
        .map(|_| ())
    }

    fn rename(&self, from: &VfsPath, to: &VfsPath, replace: bool) -> Result<(), FsError> {
        self.call(BrokerRequest::Rename {
            from: self.resolve(from),
            to: self.resolve(to),
            replace,
        })
        .map(|_| ())
    }

    fn copy(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        // Progress callbacks are not forwarded over the channel; the helper
        // copies synchronously and reports completion only.
        self.call(BrokerRequest::Copy {
            from: self.resolve(from),
            to: self.resolve(to),
            replace: options.replace_existing,
            move_semantics: options.copy_attributes,
        })
        .map(|_| ())
    }

    fn move_to(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        self.call(BrokerRequest::MoveTo {
            from: self.resolve(from),
            to: self.resolve(to),
            replace: options.replace_existing,
        })
        .map(|_| ())
    }

    fn read_symbolic_link(&self, path: &VfsPath) -> Result<Vec<u8>, FsError> {
        let value = self.call(BrokerRequest::ReadSymbolicLink {
            path: self.resolve(path),
        })?;
        let target: String = serde_json::from_value(value).map_err(channel_error)?;
        Ok(target.into_bytes())
    }

    fn create_symbolic_link(&self, path: &VfsPath, target: &[u8]) -> Result<(), FsError> {
        self.call(BrokerRequest::CreateSymbolicLink {
            path: self.resolve(path),
            target: String::from_utf8_lossy(target).to_string(),
        })
        .map(|_| ())
    }
}

// ============================================================================
// Helper side
// ============================================================================

/// Runs the helper loop: prints the handshake token, then answers one JSON
/// request per line until EOF. Meant to be called from a privileged process
/// whose stdio is the broker channel.
pub fn serve(input: impl BufRead, mut output: impl Write) -> std::io::Result<()> {
    let backend = LocalBackend::new("/");
    writeln!(output, "{} {}", HANDSHAKE_PREFIX, uuid::Uuid::new_v4())?;
    output.flush()?;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<BrokerRequest>(&line) {
            Ok(request) => handle(&backend, request),
            Err(e) => BrokerResponse::Err {
                error: channel_error(format!("malformed request: {}", e)),
            },
        };
        let encoded = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        writeln!(output, "{}", encoded)?;
        output.flush()?;
    }
    Ok(())
}

fn parse_request_path(key: &BackendKey, raw: &str) -> Result<VfsPath, FsError> {
    VfsPath::parse(key.clone(), raw.as_bytes())
}

fn handle(backend: &LocalBackend, request: BrokerRequest) -> BrokerResponse {
    let key = backend.key();
    let result: Result<serde_json::Value, FsError> = (|| match request {
        BrokerRequest::ReadAttributes { path, follow_links } => {
            let path = parse_request_path(&key, &path)?;
            let attributes = backend.read_attributes(&path, follow_links)?;
            serde_json::to_value(attributes).map_err(channel_error)
        }
        BrokerRequest::ListChildren { path } => {
            let path = parse_request_path(&key, &path)?;
            let children: Vec<RemoteChild> = backend
                .list_children(&path)?
                .into_iter()
                .map(|(name, attributes)| RemoteChild {
                    name: String::from_utf8_lossy(&name).to_string(),
                    attributes,
                })
                .collect();
            serde_json::to_value(children).map_err(channel_error)
        }
        BrokerRequest::CreateFile { path } => {
            backend.create_file(&parse_request_path(&key, &path)?)?;
            Ok(serde_json::Value::Null)
        }
        BrokerRequest::CreateDirectory { path } => {
            backend.create_directory(&parse_request_path(&key, &path)?)?;
            Ok(serde_json::Value::Null)
        }
        BrokerRequest::Delete { path } => {
            backend.delete(&parse_request_path(&key, &path)?)?;
            Ok(serde_json::Value::Null)
        }
        BrokerRequest::Rename { from, to, replace } => {
            backend.rename(
                &parse_request_path(&key, &from)?,
                &parse_request_path(&key, &to)?,
                replace,
            )?;
            Ok(serde_json::Value::Null)
        }
        BrokerRequest::Copy {
            from,
            to,
            replace,
            move_semantics,
        } => {
            let options = CopyOptions {
                replace_existing: replace,
                copy_attributes: move_semantics,
                ..CopyOptions::default()
            };
            backend.copy(
                &parse_request_path(&key, &from)?,
                &parse_request_path(&key, &to)?,
                &options,
            )?;
            Ok(serde_json::Value::Null)
        }
        BrokerRequest::MoveTo { from, to, replace } => {
            let options = CopyOptions {
                replace_existing: replace,
                ..CopyOptions::default()
            };
            backend.move_to(
                &parse_request_path(&key, &from)?,
                &parse_request_path(&key, &to)?,
                &options,
            )?;
            Ok(serde_json::Value::Null)
        }
        BrokerRequest::ReadSymbolicLink { path } => {
            let target = backend.read_symbolic_link(&parse_request_path(&key, &path)?)?;
            serde_json::to_value(String::from_utf8_lossy(&target)).map_err(channel_error)
        }
        BrokerRequest::CreateSymbolicLink { path, target } => {
            backend.create_symbolic_link(&parse_request_path(&key, &path)?, target.as_bytes())?;
            Ok(serde_json::Value::Null)
        }
    })();
    match result {
        Ok(value) => BrokerResponse::Ok { value },
        Err(error) => BrokerResponse::Err { error },
    }
}
