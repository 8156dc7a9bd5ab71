//! Container format detection by sniffing a bounded byte prefix.

use std::io::Read;
use std::path::Path;

use crate::backend::FsError;

/// Archive container layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZ,
    Tar,
    Rar,
}

/// Stream compression layered over a (tar) container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Xz,
    Bzip2,
    Zstd,
}

/// One tar header block; the magic lives at offset 257.
const SNIFF_LEN: usize = 512;

/// Detects the container format of `container` from its first bytes.
///
/// Compression magics are checked first; a compressed container is then
/// re-sniffed through its decompressor for the inner tar layout.
pub fn detect_format(container: &Path) -> Result<(ArchiveFormat, Option<CompressionFormat>), FsError> {
    let mut file = std::fs::File::open(container)
        .map_err(|e| FsError::from_io_kind(container.display().to_string(), e))?;
    let mut prefix = [0u8; SNIFF_LEN];
    let read = read_up_to(&mut file, &mut prefix)
        .map_err(|e| FsError::from_io_kind(container.display().to_string(), e))?;
    let prefix = &prefix[..read];

    if let Some(compression) = detect_compression(prefix) {
        // Only tar exists under a stream compressor; verify by sniffing the
        // decompressed prefix.
        let file = std::fs::File::open(container)
            .map_err(|e| FsError::from_io_kind(container.display().to_string(), e))?;
        let mut decompressed = open_decompressor(compression, Box::new(file));
        let mut inner = [0u8; SNIFF_LEN];
        let read = read_up_to(&mut decompressed, &mut inner).map_err(|_| FsError::ArchiveFormat {
            path: container.display().to_string(),
            message: "corrupt compressed stream".to_string(),
        })?;
        if looks_like_tar(&inner[..read]) {
            return Ok((ArchiveFormat::Tar, Some(compression)));
        }
        return Err(FsError::ArchiveFormat {
            path: container.display().to_string(),
            message: "compressed stream does not contain a tar archive".to_string(),
        });
    }

    if prefix.starts_with(b"PK\x03\x04") || prefix.starts_with(b"PK\x05\x06") {
        return Ok((ArchiveFormat::Zip, None));
    }
    if prefix.starts_with(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]) {
        return Ok((ArchiveFormat::SevenZ, None));
    }
    if prefix.starts_with(b"Rar!\x1A\x07") {
        return Ok((ArchiveFormat::Rar, None));
    }
    if looks_like_tar(prefix) {
        return Ok((ArchiveFormat::Tar, None));
    }

    Err(FsError::ArchiveFormat {
        path: container.display().to_string(),
        message: "unrecognized container format".to_string(),
    })
}

fn detect_compression(prefix: &[u8]) -> Option<CompressionFormat> {
    if prefix.starts_with(&[0x1F, 0x8B]) {
        Some(CompressionFormat::Gzip)
    } else if prefix.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
        Some(CompressionFormat::Xz)
    } else if prefix.starts_with(b"BZh") {
        Some(CompressionFormat::Bzip2)
    } else if prefix.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
        Some(CompressionFormat::Zstd)
    } else {
        None
    }
}

/// Wraps a raw container stream in the matching decompressor.
pub(super) fn open_decompressor(
    compression: CompressionFormat,
    raw: Box<dyn Read + Send>,
) -> Box<dyn Read + Send> {
    match compression {
        CompressionFormat::Gzip => Box::new(flate2::read::GzDecoder::new(raw)),
        CompressionFormat::Xz => Box::new(xz2::read::XzDecoder::new(raw)),
        CompressionFormat::Bzip2 => Box::new(bzip2::read::BzDecoder::new(raw)),
        CompressionFormat::Zstd => match zstd::stream::read::Decoder::new(raw) {
            Ok(decoder) => Box::new(decoder),
            Err(e) => Box::new(FailingReader(Some(e))),
        },
    }
}

/// Reader that surfaces a deferred construction error on first read.
struct FailingReader(Option<std::io::Error>);

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        match self.0.take() {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }
}

/// Recognizes a tar header block: the ustar magic, or for pre-POSIX tars a
/// valid header checksum.
fn looks_like_tar(block: &[u8]) -> bool {
    if block.len() < SNIFF_LEN {
        return false;
    }
    if &block[257..262] == b"ustar" {
        return true;
    }
    header_checksum_valid(block)
}

fn header_checksum_valid(block: &[u8]) -> bool {
    let recorded = parse_octal(&block[148..156]);
    let Some(recorded) = recorded else {
        return false;
    };
    let mut sum: u64 = 0;
    for (i, &byte) in block[..SNIFF_LEN].iter().enumerate() {
        if (148..156).contains(&i) {
            sum += b' ' as u64;
        } else {
            sum += byte as u64;
        }
    }
    sum == recorded && sum != 8 * b' ' as u64
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut seen_digit = false;
    for &byte in field {
        match byte {
            b'0'..=b'7' => {
                value = value * 8 + (byte - b'0') as u64;
                seen_digit = true;
            }
            b' ' | 0 => {
                if seen_digit {
                    break;
                }
            }
            _ => return None,
        }
    }
    seen_digit.then_some(value)
}

fn read_up_to(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn detects_zip_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("hello.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"hi").unwrap();
        writer.finish().unwrap();

        let (format, compression) = detect_format(&path).unwrap();
        assert_eq!(format, ArchiveFormat::Zip);
        assert_eq!(compression, None);
    }

    #[test]
    fn detects_tar_and_tar_gz() {
        let dir = tempfile::tempdir().unwrap();

        let tar_path = dir.path().join("a.tar");
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_ustar();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "f.txt", &b"hi"[..]).unwrap();
        builder.finish().unwrap();
        assert_eq!(detect_format(&tar_path).unwrap(), (ArchiveFormat::Tar, None));

        let gz_path = dir.path().join("a.tar.gz");
        let file = std::fs::File::create(&gz_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_ustar();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "f.txt", &b"hi"[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        assert_eq!(
            detect_format(&gz_path).unwrap(),
            (ArchiveFormat::Tar, Some(CompressionFormat::Gzip))
        );
    }

    #[test]
    fn rejects_unrecognized_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-archive");
        std::fs::write(&path, vec![0x42; 1024]).unwrap();
        let err = detect_format(&path).unwrap_err();
        assert!(matches!(err, FsError::ArchiveFormat { .. }));
    }
}
