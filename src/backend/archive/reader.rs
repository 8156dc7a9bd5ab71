//! Container entry enumeration and entry streaming.
//!
//! Enumeration streams all entries once per container. Extraction hands the
//! consumer an ordinary blocking `Read` regardless of the underlying format:
//! a producer thread pumps entry bytes into a bounded pipe, so seekable
//! formats (zip, 7z) and forward-only ones (tar family) look the same from
//! the outside. Back-pressure comes from the pipe's bounded buffer.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::mpsc;

use super::format::{ArchiveFormat, CompressionFormat, detect_format, open_decompressor};
use super::tree::ArchiveEntry;
use crate::backend::{FileType, FsError, ReadStream};
use crate::config::ArchiveNameEncoding;

/// Pipe chunk size for entry streaming.
const PIPE_CHUNK: usize = 64 * 1024;
/// Bounded pipe depth: the producer blocks once this many chunks are queued.
const PIPE_DEPTH: usize = 16;

// ============================================================================
// Entry enumeration
// ============================================================================

/// Reads all raw `(name, entry)` records of a container in one pass.
pub(super) fn read_raw_entries(
    container: &Path,
    encoding: ArchiveNameEncoding,
) -> Result<Vec<(Vec<u8>, ArchiveEntry)>, FsError> {
    let (format, compression) = detect_format(container)?;
    match format {
        ArchiveFormat::Zip => read_zip_entries(container),
        ArchiveFormat::SevenZ => read_seven_z_entries(container),
        ArchiveFormat::Tar => read_tar_entries(container, compression, encoding),
        ArchiveFormat::Rar => Err(FsError::unsupported("rar containers")),
    }
}

fn archive_error(container: &Path, message: impl std::fmt::Display) -> FsError {
    FsError::ArchiveFormat {
        path: container.display().to_string(),
        message: message.to_string(),
    }
}

fn read_zip_entries(container: &Path) -> Result<Vec<(Vec<u8>, ArchiveEntry)>, FsError> {
    let file = std::fs::File::open(container)
        .map_err(|e| FsError::from_io_kind(container.display().to_string(), e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| archive_error(container, e))?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(|e| archive_error(container, e))?;
        let name = entry.name_raw().to_vec();
        let mode = entry.unix_mode();
        let file_type = if entry.is_dir() {
            FileType::Directory
        } else {
            match mode {
                Some(mode) if mode & 0o170000 == 0o120000 => FileType::SymbolicLink,
                _ => FileType::Regular,
            }
        };
        entries.push((
            name.clone(),
            ArchiveEntry {
                stored_name: Some(name),
                file_type,
                size: entry.size(),
                modified: entry.last_modified().and_then(zip_datetime_to_unix),
                mode,
                uid: None,
                gid: None,
                link_target: None,
                synthesized: false,
            },
        ));
    }
    Ok(entries)
}

fn zip_datetime_to_unix(datetime: zip::DateTime) -> Option<i64> {
    let month = time::Month::try_from(datetime.month()).ok()?;
    let date = time::Date::from_calendar_date(datetime.year() as i32, month, datetime.day()).ok()?;
    let tod = time::Time::from_hms(datetime.hour(), datetime.minute(), datetime.second()).ok()?;
    Some(time::PrimitiveDateTime::new(date, tod).assume_utc().unix_timestamp())
}

fn read_seven_z_entries(container: &Path) -> Result<Vec<(Vec<u8>, ArchiveEntry)>, FsError> {
    let file = std::fs::File::open(container)
        .map_err(|e| FsError::from_io_kind(container.display().to_string(), e))?;
    let reader = sevenz_rust2::SevenZReader::new(file, sevenz_rust2::Password::empty())
        .map_err(|e| archive_error(container, e))?;
    let entries = reader
        .archive()
        .files
        .iter()
        .map(|entry| {
            let name = entry.name.as_bytes().to_vec();
            (
                name.clone(),
                ArchiveEntry {
                    stored_name: Some(name),
                    file_type: if entry.is_directory {
                        FileType::Directory
                    } else {
                        FileType::Regular
                    },
                    size: entry.size,
                    modified: None,
                    mode: None,
                    uid: None,
                    gid: None,
                    link_target: None,
                    synthesized: false,
                },
            )
        })
        .collect();
    Ok(entries)
}

fn read_tar_entries(
    container: &Path,
    compression: Option<CompressionFormat>,
    encoding: ArchiveNameEncoding,
) -> Result<Vec<(Vec<u8>, ArchiveEntry)>, FsError> {
    let stream = open_tar_stream(container, compression)
        .map_err(|e| FsError::from_io_kind(container.display().to_string(), e))?;
    let mut archive = tar::Archive::new(stream);
    let mut entries = Vec::new();
    let iter = archive.entries().map_err(|e| archive_error(container, e))?;
    for entry in iter {
        let entry = entry.map_err(|e| archive_error(container, e))?;
        let raw_name = entry
            .path_bytes()
            .to_vec();
        let header = entry.header();
        let file_type = match header.entry_type() {
            tar::EntryType::Directory => FileType::Directory,
            tar::EntryType::Symlink => FileType::SymbolicLink,
            tar::EntryType::Regular | tar::EntryType::GNUSparse | tar::EntryType::Continuous => {
                FileType::Regular
            }
            tar::EntryType::Char => FileType::CharacterDevice,
            tar::EntryType::Block => FileType::BlockDevice,
            tar::EntryType::Fifo => FileType::Fifo,
            tar::EntryType::Link => FileType::Regular,
            _ => FileType::Unknown,
        };
        let link_target = entry
            .link_name_bytes()
            .map(|bytes| bytes.to_vec());
        entries.push((
            encoding.decode(&raw_name),
            ArchiveEntry {
                stored_name: Some(raw_name),
                file_type,
                size: entry.size(),
                modified: header.mtime().ok().map(|t| t as i64),
                mode: header.mode().ok(),
                uid: header.uid().ok().map(|v| v as u32),
                gid: header.gid().ok().map(|v| v as u32),
                link_target,
                synthesized: false,
            },
        ));
    }
    Ok(entries)
}

fn open_tar_stream(
    container: &Path,
    compression: Option<CompressionFormat>,
) -> std::io::Result<Box<dyn Read + Send>> {
    let file = std::fs::File::open(container)?;
    Ok(match compression {
        Some(compression) => open_decompressor(compression, Box::new(file)),
        None => Box::new(file),
    })
}

// ============================================================================
// Entry streaming
// ============================================================================

/// Opens a blocking read stream over one entry's bytes.
///
/// The producer side runs on its own thread and owns the container handle;
/// dropping the returned stream tears the pipe down, which releases the
/// handle. An entry missing at extraction time (container truncated or
/// modified concurrently) surfaces as a `NotFound` read error.
pub(super) fn open_entry(container: &Path, stored_name: &[u8]) -> Result<ReadStream, FsError> {
    let (format, compression) = detect_format(container)?;
    let (sender, receiver) = mpsc::sync_channel::<std::io::Result<Vec<u8>>>(PIPE_DEPTH);
    let container = container.to_path_buf();
    let stored_name = stored_name.to_vec();

    std::thread::Builder::new()
        .name("polyfs-archive-extract".to_string())
        .spawn(move || {
            let mut writer = PipeWriter {
                sender: sender.clone(),
                buffer: Vec::with_capacity(PIPE_CHUNK),
            };
            let result = match format {
                ArchiveFormat::Zip => pump_zip_entry(&container, &stored_name, &mut writer),
                ArchiveFormat::SevenZ => pump_seven_z_entry(&container, &stored_name, &mut writer),
                ArchiveFormat::Tar => {
                    pump_tar_entry(&container, compression, &stored_name, &mut writer)
                }
                ArchiveFormat::Rar => Err(std::io::Error::other("rar containers are unsupported")),
            };
            match result {
                Ok(()) => {
                    let _ = writer.flush();
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        let _ = sender.send(Err(e));
                    }
                }
            }
        })
        .map_err(|e| FsError::Io {
            path: String::new(),
            message: format!("failed to spawn extraction thread: {}", e),
        })?;

    Ok(Box::new(PipeReader {
        receiver,
        current: Vec::new(),
        position: 0,
        finished: false,
    }))
}

fn entry_not_found() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotFound, "entry not found in container")
}

fn pump_zip_entry(container: &Path, stored_name: &[u8], writer: &mut PipeWriter) -> std::io::Result<()> {
    let file = std::fs::File::open(container)?;
    let mut archive = zip::ZipArchive::new(file).map_err(std::io::Error::other)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(std::io::Error::other)?;
        if entry.name_raw() == stored_name {
            std::io::copy(&mut entry, writer)?;
            return Ok(());
        }
    }
    Err(entry_not_found())
}

fn pump_seven_z_entry(
    container: &Path,
    stored_name: &[u8],
    writer: &mut PipeWriter,
) -> std::io::Result<()> {
    let file = std::fs::File::open(container)?;
    let mut found = false;
    let mut pump_error: Option<std::io::Error> = None;
    sevenz_rust2::decompress_with_extract_fn(file, std::env::temp_dir(), |entry, reader, _dest| {
        if entry.name.as_bytes() != stored_name {
            return Ok(true);
        }
        found = true;
        if let Err(e) = std::io::copy(reader, writer) {
            pump_error = Some(e);
        }
        // Stop the single-pass extraction once our entry is done.
        Ok(false)
    })
    .map_err(std::io::Error::other)?;
    if let Some(e) = pump_error {
        return Err(e);
    }
    if !found {
        return Err(entry_not_found());
    }
    Ok(())
}

fn pump_tar_entry(
    container: &Path,
    compression: Option<CompressionFormat>,
    stored_name: &[u8],
    writer: &mut PipeWriter,
) -> std::io::Result<()> {
    let stream = open_tar_stream(container, compression)?;
    let mut archive = tar::Archive::new(stream);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path_bytes().as_ref() == stored_name {
            std::io::copy(&mut entry, writer)?;
            return Ok(());
        }
    }
    Err(entry_not_found())
}

/// Reads one entry fully into memory (symlink targets stored as data).
pub(super) fn read_entry_bytes(container: &Path, stored_name: &[u8]) -> Result<Vec<u8>, FsError> {
    let mut stream = open_entry(container, stored_name)?;
    let mut bytes = Vec::new();
    stream
        .read_to_end(&mut bytes)
        .map_err(|e| FsError::from_io_kind(container.display().to_string(), e))?;
    Ok(bytes)
}

// ============================================================================
// Bounded pipe
// ============================================================================

struct PipeWriter {
    sender: mpsc::SyncSender<std::io::Result<Vec<u8>>>,
    buffer: Vec<u8>,
}

impl PipeWriter {
    fn send_buffer(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(PIPE_CHUNK));
        self.sender
            .send(Ok(chunk))
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= PIPE_CHUNK {
            self.send_buffer()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.send_buffer()
    }
}

struct PipeReader {
    receiver: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    current: Vec<u8>,
    position: usize,
    finished: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        while self.position >= self.current.len() {
            match self.receiver.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.position = 0;
                }
                Ok(Err(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                Err(mpsc::RecvError) => {
                    // Producer finished and hung up.
                    self.finished = true;
                    return Ok(0);
                }
            }
        }
        let available = &self.current[self.position..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.position += count;
        Ok(count)
    }
}
