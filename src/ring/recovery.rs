//! Ring startup with automatic recovery.
//!
//! When the ring files turn out corrupt, or carry an older format version,
//! the configured recovery policy decides what happens:
//!
//! - `auto_recovery = 0`: fail startup
//! - `auto_recovery = 1`: move the files aside (`.corrupt` or `.versionN`),
//!   re-create the ring, and for version-1 files replay the backed-up
//!   packets into the new ring before removing the backups
//! - `auto_recovery = 2`: delete the files and re-create the ring
//!
//! A failure of the second initialization attempt is always fatal.

use std::io;
use std::path::{Path, PathBuf};

use super::format;
use super::{Ring, RingInitError, PACKET_BUFFER_FILE, STREAM_INDEX_FILE};
use crate::config::schema::RingConfig;

/// Error opening the ring, including the recovery path.
#[derive(Debug)]
pub enum RingOpenError {
    Init(RingInitError),
    Backup(io::Error),
    Convert(io::Error),
    Unconvertible(u16),
}

impl std::fmt::Display for RingOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingOpenError::Init(e) => write!(f, "{}", e),
            RingOpenError::Backup(e) => write!(f, "error moving ring files aside: {}", e),
            RingOpenError::Convert(e) => write!(f, "error converting ring backup: {}", e),
            RingOpenError::Unconvertible(v) => {
                write!(f, "unsupported conversion version {}", v)
            }
        }
    }
}

impl std::error::Error for RingOpenError {}

/// Open the ring per the configured recovery policy.
pub fn open_ring(config: &RingConfig) -> Result<Ring, RingOpenError> {
    let dir = config.dir.as_deref().map(Path::new);

    let first = Ring::initialize(
        dir,
        config.size,
        config.pkt_size,
        config.memory_map,
        config.volatile,
    );

    let error = match first {
        Ok(ring) => return Ok(ring),
        Err(e @ RingInitError::Io(_)) => return Err(RingOpenError::Init(e)),
        Err(e) if config.auto_recovery == 0 => return Err(RingOpenError::Init(e)),
        Err(e) => e,
    };

    // Recoverable: dir must be present since volatile rings never fail
    let dir = dir.expect("non-volatile ring has a directory");
    let buf_path = dir.join(PACKET_BUFFER_FILE);
    let idx_path = dir.join(STREAM_INDEX_FILE);

    let convert_version = match &error {
        RingInitError::UnsupportedVersion(v) => Some(*v),
        _ => None,
    };

    let mut buf_backup = None;
    let mut idx_backup = None;
    if config.auto_recovery == 1 {
        let suffix = match convert_version {
            Some(v) => format!(".version{}", v),
            None => ".corrupt".to_string(),
        };
        tracing::warn!(
            "Auto recovery, moving packet buffer and stream index files to {}",
            suffix
        );
        buf_backup = Some(move_aside(&buf_path, &suffix).map_err(RingOpenError::Backup)?);
        idx_backup = Some(move_aside(&idx_path, &suffix).map_err(RingOpenError::Backup)?);
    } else {
        tracing::warn!("Auto recovery, removing existing packet buffer and stream index files");
        remove_if_present(&buf_path).map_err(RingOpenError::Backup)?;
        remove_if_present(&idx_path).map_err(RingOpenError::Backup)?;
    }

    let ring = Ring::initialize(
        Some(dir),
        config.size,
        config.pkt_size,
        config.memory_map,
        config.volatile,
    )
    .map_err(RingOpenError::Init)?;

    if let Some(version) = convert_version {
        if version != 1 {
            return Err(RingOpenError::Unconvertible(version));
        }
        let backup = buf_backup.as_deref().expect("recovery mode 1 made a backup");
        let loaded = load_buffer_v1(backup, &ring).map_err(RingOpenError::Convert)?;
        tracing::info!(packets = loaded, "Loaded packets from version-1 buffer, removing backup files");
        remove_if_present(backup).map_err(RingOpenError::Convert)?;
        if let Some(idx_backup) = idx_backup.as_deref() {
            remove_if_present(idx_backup).map_err(RingOpenError::Convert)?;
        }
    }

    Ok(ring)
}

/// Rename `path` to `path<suffix>`, appending a numeric tag when that
/// backup already exists so earlier backups are never clobbered.
fn move_aside(path: &Path, suffix: &str) -> io::Result<PathBuf> {
    let base = PathBuf::from(format!("{}{}", path.display(), suffix));
    let mut backup = base.clone();
    let mut n = 0;
    while backup.exists() {
        n += 1;
        backup = PathBuf::from(format!("{}.{}", base.display(), n));
    }
    match std::fs::rename(path, &backup) {
        Ok(()) => Ok(backup),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(backup),
        Err(e) => Err(e),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Replay packets from a version-1 packet buffer into a fresh ring.
/// Packets too large for the new geometry are skipped with a warning.
/// Returns the number of packets loaded.
pub fn load_buffer_v1(backup: &Path, ring: &Ring) -> io::Result<u64> {
    let content = std::fs::read(backup)?;
    let header = format::FileHeader::decode(&content)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if header.version != 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected version 1, found {}", header.version),
        ));
    }

    let pkt_size = header.pkt_size as usize;
    let mut packets = Vec::new();
    let mut pos = format::HEADER_LEN as usize;
    while pos + pkt_size <= content.len() {
        let slot = format::decode_v1_slot(&content[pos..pos + pkt_size])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(packet) = slot {
            packets.push(packet);
        }
        pos += pkt_size;
    }

    // Replay in id order so the new ring keeps the original sequence
    packets.sort_by_key(|p| p.pkt_id);

    let mut loaded = 0;
    for packet in packets {
        match ring.write_packet(&packet.stream, &packet.data) {
            Ok(_) => loaded += 1,
            Err(super::RingError::PacketTooLarge { len, max }) => {
                tracing::warn!(
                    pkt_id = packet.pkt_id,
                    len,
                    max,
                    "Skipping backup packet too large for the new ring"
                );
            }
            Err(super::RingError::Io(e)) => return Err(e),
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;

    fn base_config(dir: &Path) -> RingConfig {
        RingConfig {
            dir: Some(dir.to_str().unwrap().to_string()),
            size: 8 * 256,
            pkt_size: 256,
            memory_map: false,
            volatile: false,
            auto_recovery: 1,
        }
    }

    fn write_v1_file(path: &Path, packets: &[(u64, &str, &[u8])]) {
        let header = format::FileHeader {
            version: 1,
            ring_size: 8 * 256,
            pkt_size: 256,
        };
        let mut content = header.encode().to_vec();
        for (id, stream, data) in packets {
            let mut slot = format::encode_v1_slot(*id, stream, data);
            slot.resize(256, 0);
            content.extend_from_slice(&slot);
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_clean_start_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let ring = open_ring(&base_config(dir.path())).unwrap();
        assert_eq!(ring.packet_count(), 0);
        assert!(dir.path().join(PACKET_BUFFER_FILE).exists());
    }

    #[test]
    fn test_corrupt_file_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PACKET_BUFFER_FILE), b"garbage").unwrap();

        let ring = open_ring(&base_config(dir.path())).unwrap();
        assert_eq!(ring.packet_count(), 0);
        assert!(dir
            .path()
            .join(format!("{}.corrupt", PACKET_BUFFER_FILE))
            .exists());
    }

    #[test]
    fn test_second_corrupt_backup_does_not_clobber_first() {
        let dir = tempfile::tempdir().unwrap();
        let buf = dir.path().join(PACKET_BUFFER_FILE);

        std::fs::write(&buf, b"first garbage").unwrap();
        open_ring(&base_config(dir.path())).unwrap();

        std::fs::write(&buf, b"second garbage").unwrap();
        open_ring(&base_config(dir.path())).unwrap();

        let first = dir.path().join(format!("{}.corrupt", PACKET_BUFFER_FILE));
        let second = dir.path().join(format!("{}.corrupt.1", PACKET_BUFFER_FILE));
        assert_eq!(std::fs::read(&first).unwrap(), b"first garbage");
        assert_eq!(std::fs::read(&second).unwrap(), b"second garbage");
    }

    #[test]
    fn test_corrupt_file_removed_with_delete_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PACKET_BUFFER_FILE), b"garbage").unwrap();

        let mut config = base_config(dir.path());
        config.auto_recovery = 2;
        open_ring(&config).unwrap();
        assert!(!dir
            .path()
            .join(format!("{}.corrupt", PACKET_BUFFER_FILE))
            .exists());
    }

    #[test]
    fn test_no_recovery_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PACKET_BUFFER_FILE), b"garbage").unwrap();

        let mut config = base_config(dir.path());
        config.auto_recovery = 0;
        assert!(matches!(
            open_ring(&config),
            Err(RingOpenError::Init(RingInitError::Corrupt(_)))
        ));
    }

    #[test]
    fn test_version1_conversion_replays_packets() {
        let dir = tempfile::tempdir().unwrap();
        write_v1_file(
            &dir.path().join(PACKET_BUFFER_FILE),
            &[(1, "NET_A", b"alpha"), (2, "NET_B", b"beta")],
        );

        let ring = open_ring(&base_config(dir.path())).unwrap();
        assert_eq!(ring.packet_count(), 2);

        let mut reader = super::super::RingReader::new();
        let p = ring.read_next(&mut reader).unwrap();
        assert_eq!(p.stream, "NET_A");
        assert_eq!(p.payload, b"alpha");

        // Converted backups are removed once loaded
        assert!(!dir
            .path()
            .join(format!("{}.version1", PACKET_BUFFER_FILE))
            .exists());
    }

    #[test]
    fn test_version1_replay_is_id_ordered() {
        let dir = tempfile::tempdir().unwrap();
        write_v1_file(
            &dir.path().join(PACKET_BUFFER_FILE),
            &[(5, "S", b"five"), (3, "S", b"three"), (4, "S", b"four")],
        );

        let ring = open_ring(&base_config(dir.path())).unwrap();
        let mut reader = super::super::RingReader::new();
        let order: Vec<Vec<u8>> = std::iter::from_fn(|| {
            ring.read_next(&mut reader).map(|p| p.payload)
        })
        .collect();
        assert_eq!(order, vec![b"three".to_vec(), b"four".to_vec(), b"five".to_vec()]);
    }

    #[test]
    fn test_truncated_valid_header_is_corrupt_not_version() {
        let dir = tempfile::tempdir().unwrap();
        let buf = dir.path().join(PACKET_BUFFER_FILE);
        {
            let ring = open_ring(&base_config(dir.path())).unwrap();
            ring.write_packet("S", b"data").unwrap();
            ring.shutdown().unwrap();
        }
        // Flip a slot into an inconsistent state
        let file = std::fs::OpenOptions::new().write(true).open(&buf).unwrap();
        let bad_len = (u32::MAX).to_le_bytes();
        file.write_all_at(&bad_len, format::HEADER_LEN + 14).unwrap();
        drop(file);

        let ring = open_ring(&base_config(dir.path())).unwrap();
        assert_eq!(ring.packet_count(), 0);
    }
}
