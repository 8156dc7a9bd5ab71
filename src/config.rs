//! Process-wide configuration consumed by the backends and the broker.

use std::time::Duration;

/// Default minimum number of bytes between intermediate progress
/// notifications during data transfer.
pub const DEFAULT_PROGRESS_INTERVAL_BYTES: u64 = 1024 * 1024;

/// Default bound on the privileged broker connection handshake.
pub const DEFAULT_BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Decoding applied to archive entry names that are not valid UTF-8.
///
/// Tar and zip containers store names as raw bytes; when a name fails UTF-8
/// validation we either keep the bytes as-is (`Raw`) or decode them as
/// Latin-1 for display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveNameEncoding {
    #[default]
    Raw,
    Latin1,
}

impl ArchiveNameEncoding {
    /// Decodes raw entry-name bytes to path bytes under this encoding.
    pub fn decode(&self, raw: &[u8]) -> Vec<u8> {
        match self {
            ArchiveNameEncoding::Raw => raw.to_vec(),
            ArchiveNameEncoding::Latin1 => {
                if raw.is_ascii() {
                    raw.to_vec()
                } else {
                    // Latin-1 maps each byte to the same Unicode scalar.
                    raw.iter().map(|&b| b as char).collect::<String>().into_bytes()
                }
            }
        }
    }
}

/// Settings source for the filesystem layer. Passed into `FsContext`; there
/// are no globals.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Decoding for archive entry names that are not valid UTF-8.
    pub archive_name_encoding: ArchiveNameEncoding,
    /// Default progress byte interval when a caller does not specify one.
    pub progress_interval_bytes: u64,
    /// Command line used to launch the privileged helper process
    /// (e.g. `["su", "-c", "/path/to/helper"]`). Empty disables escalation.
    pub broker_command: Vec<String>,
    /// Bound on the broker connection handshake.
    pub broker_connect_timeout: Duration,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            archive_name_encoding: ArchiveNameEncoding::default(),
            progress_interval_bytes: DEFAULT_PROGRESS_INTERVAL_BYTES,
            broker_command: Vec::new(),
            broker_connect_timeout: DEFAULT_BROKER_CONNECT_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_decoding_maps_high_bytes() {
        let encoding = ArchiveNameEncoding::Latin1;
        assert_eq!(encoding.decode(b"plain"), b"plain".to_vec());
        // 0xE9 is 'é' in Latin-1.
        assert_eq!(encoding.decode(&[0xE9]), "é".as_bytes().to_vec());
    }

    #[test]
    fn raw_decoding_is_identity() {
        let encoding = ArchiveNameEncoding::Raw;
        assert_eq!(encoding.decode(&[0xFF, 0x00]), vec![0xFF, 0x00]);
    }
}
