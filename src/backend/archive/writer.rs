//! Writing new containers from backend paths.
//!
//! A container is produced entry by entry: input paths are classified by
//! their attributes, directories contribute bare entry records, regular
//! files stream their data, and symbolic links are encoded natively (both
//! tar and zip can represent them). POSIX mode/owner/group are attached on
//! tar-family containers; zip carries permission bits only. Writing 7z or
//! rar containers is not supported.

use std::io::{Read, Write};
use std::path::Path;

use super::format::{ArchiveFormat, CompressionFormat};
use crate::backend::{AttributeExtra, Backend, CopyOptions, FileAttributes, FileType, FsError};
use crate::path::VfsPath;

/// Sentinel modification time for entries whose source reports none.
const FALLBACK_MTIME: i64 = 0;

// ============================================================================
// Sinks
// ============================================================================

/// Output stream that knows how to finalize itself (compressors must flush
/// their trailing blocks explicitly).
trait ContainerSink: Write + Send {
    fn finish(self: Box<Self>) -> std::io::Result<()>;
}

impl ContainerSink for std::fs::File {
    fn finish(mut self: Box<Self>) -> std::io::Result<()> {
        self.flush()
    }
}

impl ContainerSink for flate2::write::GzEncoder<std::fs::File> {
    fn finish(self: Box<Self>) -> std::io::Result<()> {
        (*self).finish().map(|_| ())
    }
}

impl ContainerSink for xz2::write::XzEncoder<std::fs::File> {
    fn finish(self: Box<Self>) -> std::io::Result<()> {
        (*self).finish().map(|_| ())
    }
}

impl ContainerSink for bzip2::write::BzEncoder<std::fs::File> {
    fn finish(self: Box<Self>) -> std::io::Result<()> {
        (*self).finish().map(|_| ())
    }
}

impl ContainerSink for zstd::stream::write::Encoder<'static, std::fs::File> {
    fn finish(self: Box<Self>) -> std::io::Result<()> {
        (*self).finish().map(|_| ())
    }
}

fn open_sink(
    file: std::fs::File,
    compression: Option<CompressionFormat>,
) -> std::io::Result<Box<dyn ContainerSink>> {
    Ok(match compression {
        None => Box::new(file),
        Some(CompressionFormat::Gzip) => {
            Box::new(flate2::write::GzEncoder::new(file, flate2::Compression::default()))
        }
        Some(CompressionFormat::Xz) => Box::new(xz2::write::XzEncoder::new(file, 6)),
        Some(CompressionFormat::Bzip2) => {
            Box::new(bzip2::write::BzEncoder::new(file, bzip2::Compression::default()))
        }
        Some(CompressionFormat::Zstd) => Box::new(zstd::stream::write::Encoder::new(file, 0)?),
    })
}

// ============================================================================
// Container writer
// ============================================================================

/// Incremental writer over one output container.
pub struct ContainerWriter {
    inner: WriterKind,
    out: String,
}

enum WriterKind {
    Zip(zip::ZipWriter<std::fs::File>),
    Tar(tar::Builder<Box<dyn ContainerSink>>),
}

impl ContainerWriter {
    /// Creates the output container file. Compression only applies to tar.
    pub fn create(
        out: &Path,
        archive_format: ArchiveFormat,
        compression: Option<CompressionFormat>,
    ) -> Result<Self, FsError> {
        let out_display = out.display().to_string();
        let io_err = |e| FsError::from_io_kind(out.display().to_string(), e);
        let file = std::fs::File::create(out).map_err(io_err)?;
        let inner = match archive_format {
            ArchiveFormat::Zip => {
                if compression.is_some() {
                    return Err(FsError::unsupported("stream compression over zip"));
                }
                WriterKind::Zip(zip::ZipWriter::new(file))
            }
            ArchiveFormat::Tar => WriterKind::Tar(tar::Builder::new(open_sink(file, compression).map_err(io_err)?)),
            ArchiveFormat::SevenZ => return Err(FsError::unsupported("writing 7z containers")),
            ArchiveFormat::Rar => return Err(FsError::unsupported("writing rar containers")),
        };
        Ok(Self {
            inner,
            out: out_display,
        })
    }

    fn zip_options(attributes: &FileAttributes) -> zip::write::SimpleFileOptions {
        let mut options = zip::write::SimpleFileOptions::default();
        if let AttributeExtra::Posix(posix) = &attributes.extra {
            options = options.unix_permissions(posix.mode & 0o7777);
        }
        options
    }

    fn tar_header(attributes: &FileAttributes, entry_type: tar::EntryType) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_size(0);
        header.set_mtime(attributes.modified.unwrap_or(FALLBACK_MTIME).max(0) as u64);
        match &attributes.extra {
            AttributeExtra::Posix(posix) => {
                header.set_mode(posix.mode & 0o7777);
                header.set_uid(posix.uid as u64);
                header.set_gid(posix.gid as u64);
            }
            _ => {
                header.set_mode(if entry_type == tar::EntryType::Directory {
                    0o755
                } else {
                    0o644
                });
            }
        }
        header
    }

    pub fn add_directory(&mut self, name: &str, attributes: &FileAttributes) -> Result<(), FsError> {
        let out = self.out.clone();
        match &mut self.inner {
            WriterKind::Zip(writer) => writer
                .add_directory(name, Self::zip_options(attributes))
                .map_err(|e| zip_error(&out, e))?,
            WriterKind::Tar(builder) => {
                let mut header = Self::tar_header(attributes, tar::EntryType::Directory);
                let name = format!("{}/", name.trim_end_matches('/'));
                builder
                    .append_data(&mut header, name, std::io::empty())
                    .map_err(|e| io_error(&out, e))?;
            }
        }
        Ok(())
    }

    pub fn add_file(
        &mut self,
        name: &str,
        attributes: &FileAttributes,
        data: &mut dyn Read,
    ) -> Result<u64, FsError> {
        let out = self.out.clone();
        match &mut self.inner {
            WriterKind::Zip(writer) => {
                writer
                    .start_file(name, Self::zip_options(attributes))
                    .map_err(|e| zip_error(&out, e))?;
                std::io::copy(data, writer).map_err(|e| io_error(&out, e))
            }
            WriterKind::Tar(builder) => {
                let mut header = Self::tar_header(attributes, tar::EntryType::Regular);
                header.set_size(attributes.size);
                builder
                    .append_data(&mut header, name, data)
                    .map_err(|e| io_error(&out, e))?;
                Ok(attributes.size)
            }
        }
    }

    pub fn add_symlink(
        &mut self,
        name: &str,
        target: &[u8],
        attributes: &FileAttributes,
    ) -> Result<(), FsError> {
        let out = self.out.clone();
        let target = String::from_utf8_lossy(target).to_string();
        match &mut self.inner {
            WriterKind::Zip(writer) => writer
                .add_symlink(name, &target, Self::zip_options(attributes))
                .map_err(|e| zip_error(&out, e))?,
            WriterKind::Tar(builder) => {
                let mut header = Self::tar_header(attributes, tar::EntryType::Symlink);
                builder
                    .append_link(&mut header, name, &target)
                    .map_err(|e| io_error(&out, e))?;
            }
        }
        Ok(())
    }

    /// Finalizes and flushes the container.
    pub fn finish(self) -> Result<(), FsError> {
        let out = self.out;
        match self.inner {
            WriterKind::Zip(writer) => {
                writer.finish().map_err(|e| zip_error(&out, e))?;
            }
            WriterKind::Tar(builder) => {
                let sink = builder.into_inner().map_err(|e| io_error(&out, e))?;
                sink.finish().map_err(|e| io_error(&out, e))?;
            }
        }
        Ok(())
    }
}

fn io_error(out: &str, e: std::io::Error) -> FsError {
    FsError::from_io_kind(out.to_string(), e)
}

fn zip_error(out: &str, e: zip::result::ZipError) -> FsError {
    FsError::ArchiveFormat {
        path: out.to_string(),
        message: e.to_string(),
    }
}

// ============================================================================
// Recursive packing
// ============================================================================

/// Packs `sources` (and their subtrees) from `backend` into a new container
/// at `out`. Entry names are relative to each source's parent, so packing
/// `/a/b` yields entries under `b/`. Progress is reported in data bytes.
pub fn write_container(
    backend: &dyn Backend,
    sources: &[VfsPath],
    out: &Path,
    archive_format: ArchiveFormat,
    compression: Option<CompressionFormat>,
    options: &CopyOptions<'_>,
) -> Result<(), FsError> {
    let mut writer = ContainerWriter::create(out, archive_format, compression)?;
    let mut written = 0u64;
    for source in sources {
        let name = entry_base_name(source)?;
        pack_node(backend, source, &name, &mut writer, options, &mut written)?;
    }
    writer.finish()?;
    options.notify_progress(written);
    Ok(())
}

fn entry_base_name(source: &VfsPath) -> Result<String, FsError> {
    match source.file_name() {
        Some(name) => Ok(String::from_utf8_lossy(name).to_string()),
        None => Err(FsError::InvalidPath {
            path: source.display(),
            message: "cannot pack a backend root directly".to_string(),
        }),
    }
}

fn pack_node(
    backend: &dyn Backend,
    path: &VfsPath,
    name: &str,
    writer: &mut ContainerWriter,
    options: &CopyOptions<'_>,
    written: &mut u64,
) -> Result<(), FsError> {
    options.check_cancelled()?;
    let attributes = backend.read_attributes(path, false)?;
    match attributes.file_type {
        FileType::Directory => {
            writer.add_directory(name, &attributes)?;
            for (child_name, _) in backend.list_children(path)? {
                let child = path.join(&child_name)?;
                let child_entry = format!("{}/{}", name, String::from_utf8_lossy(&child_name));
                pack_node(backend, &child, &child_entry, writer, options, written)?;
            }
        }
        FileType::Regular => {
            let mut data = backend.open_read(path)?;
            *written += writer.add_file(name, &attributes, &mut data)?;
            options.notify_progress(*written);
        }
        FileType::SymbolicLink => {
            let target = backend.read_symbolic_link(path)?;
            writer.add_symlink(name, &target, &attributes)?;
        }
        other => {
            // Sockets, devices and the like have no archive representation.
            log::warn!("archive: skipping special file {} ({:?})", path.display(), other);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    use super::*;
    use crate::backend::archive::ArchiveBackend;
    use crate::backend::archive::tree::ArchiveTreeCache;
    use crate::backend::local::LocalBackend;
    use crate::config::ArchiveNameEncoding;

    fn populate(root: &Path) {
        std::fs::create_dir(root.join("pack")).unwrap();
        std::fs::write(root.join("pack/file.txt"), b"payload").unwrap();
        std::fs::create_dir(root.join("pack/sub")).unwrap();
        std::fs::write(root.join("pack/sub/inner.bin"), vec![7u8; 2048]).unwrap();
        std::os::unix::fs::symlink("file.txt", root.join("pack/link")).unwrap();
        std::fs::set_permissions(root.join("pack/file.txt"), std::fs::Permissions::from_mode(0o640))
            .unwrap();
    }

    fn mount(container: &Path) -> ArchiveBackend {
        ArchiveBackend::open(container, ArchiveNameEncoding::default(), Arc::new(ArchiveTreeCache::new()))
            .unwrap()
    }

    fn round_trip(archive_format: ArchiveFormat, compression: Option<CompressionFormat>, out_name: &str) {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let backend = LocalBackend::new(dir.path());
        let source = VfsPath::parse(backend.key(), b"/pack").unwrap();
        let out = dir.path().join(out_name);

        write_container(
            &backend,
            &[source],
            &out,
            archive_format,
            compression,
            &CopyOptions::default(),
        )
        .unwrap();

        let archive = mount(&out);
        let root = VfsPath::root(archive.key());
        let read = |raw: &str| VfsPath::parse(archive.key(), raw.as_bytes()).unwrap();

        let children = archive.list_children(&root).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, b"pack".to_vec());

        let mut content = Vec::new();
        archive
            .open_read(&read("/pack/file.txt"))
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"payload");

        let attrs = archive.read_attributes(&read("/pack/sub/inner.bin"), false).unwrap();
        assert_eq!(attrs.size, 2048);

        let target = archive.read_symbolic_link(&read("/pack/link")).unwrap();
        assert_eq!(target, b"file.txt".to_vec());
    }

    #[test]
    fn zip_round_trip() {
        round_trip(ArchiveFormat::Zip, None, "out.zip");
    }

    #[test]
    fn tar_gz_round_trip() {
        round_trip(ArchiveFormat::Tar, Some(CompressionFormat::Gzip), "out.tar.gz");
    }

    #[test]
    fn tar_zstd_round_trip() {
        round_trip(ArchiveFormat::Tar, Some(CompressionFormat::Zstd), "out.tar.zst");
    }

    #[test]
    fn seven_z_writing_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ContainerWriter::create(&dir.path().join("x.7z"), ArchiveFormat::SevenZ, None).err().unwrap();
        assert!(matches!(err, FsError::Unsupported { .. }));
    }

    #[test]
    fn progress_reports_data_bytes() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let backend = LocalBackend::new(dir.path());
        let source = VfsPath::parse(backend.key(), b"/pack").unwrap();
        let out = dir.path().join("p.tar");

        let reported = std::sync::Mutex::new(Vec::new());
        let progress = |bytes: u64| reported.lock().unwrap().push(bytes);
        let options = CopyOptions {
            progress: Some(&progress),
            ..CopyOptions::default()
        };
        write_container(&backend, &[source], &out, ArchiveFormat::Tar, None, &options).unwrap();
        // 7 payload bytes + 2048 inner bytes, final notification included.
        assert_eq!(*reported.lock().unwrap().last().unwrap(), 2055);
    }
}
