//! Directory-scanning ingest.
//!
//! A scanner unit walks its directory once a second, reads new bytes from
//! files matching its patterns, and writes them into the ring in
//! packet-sized chunks with the file name as the stream ID. Per-file read
//! offsets persist to the state file so a restart resumes where the last
//! run stopped.
//!
//! Scanners go through the same lifecycle as listeners: the supervisor
//! restarts a crashed scanner and requests close on shutdown.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::config::schema::ScanConfig;
use crate::ring::Ring;
use crate::server::registry::LifecycleCell;
use crate::server::Shared;

/// One directory-scan job, the payload of a scanner server unit.
pub struct ScanJob {
    pub dir: PathBuf,
    pub state_file: Option<PathBuf>,
    pub match_pattern: Option<Regex>,
    pub reject_pattern: Option<Regex>,
    pub init_current_state: bool,
}

impl ScanJob {
    pub fn from_config(config: &ScanConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            dir: PathBuf::from(&config.dir),
            state_file: config.state_file.as_ref().map(PathBuf::from),
            match_pattern: config
                .match_pattern
                .as_deref()
                .map(Regex::new)
                .transpose()?,
            reject_pattern: config
                .reject_pattern
                .as_deref()
                .map(Regex::new)
                .transpose()?,
            init_current_state: config.init_current_state,
        })
    }

    fn accepts(&self, name: &str) -> bool {
        if let Some(pattern) = &self.match_pattern {
            if !pattern.is_match(name) {
                return false;
            }
        }
        if let Some(pattern) = &self.reject_pattern {
            if pattern.is_match(name) {
                return false;
            }
        }
        true
    }

    fn load_state(&self) -> HashMap<String, u64> {
        let Some(path) = &self.state_file else {
            return HashMap::new();
        };
        match std::fs::read(path) {
            Ok(content) => serde_json::from_slice(&content).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn save_state(&self, offsets: &HashMap<String, u64>) -> io::Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let content = serde_json::to_vec(offsets)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

/// Scanner worker: one task per scanner unit.
pub async fn scan_task(shared: Arc<Shared>, job: Arc<ScanJob>, lifecycle: Arc<LifecycleCell>) {
    lifecycle.set_active();
    tracing::info!(dir = %job.dir.display(), "Scanning directory for packets");

    let mut offsets = job.load_state();
    let pkt_size = shared.snapshot().config.ring.pkt_size;
    let chunk_size = chunk_size_for(pkt_size);
    let mut first_pass = true;

    loop {
        if let Err(e) = scan_pass(&shared.ring, &job, &mut offsets, chunk_size, first_pass) {
            tracing::warn!(dir = %job.dir.display(), error = %e, "Scan pass failed");
        }
        first_pass = false;
        if let Err(e) = job.save_state(&offsets) {
            tracing::warn!(error = %e, "Could not persist scan state");
        }

        tokio::select! {
            biased;
            _ = shared.shutdown.requested() => break,
            _ = lifecycle.close_requested() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }

    if let Err(e) = job.save_state(&offsets) {
        tracing::warn!(error = %e, "Could not persist scan state");
    }
    lifecycle.set_closed();
    tracing::info!(dir = %job.dir.display(), "Scanner closing");
}

/// Usable chunk size leaving room for the slot header and a stream ID.
fn chunk_size_for(pkt_size: u32) -> usize {
    (pkt_size as usize).saturating_sub(128).max(64)
}

/// One pass over the directory: ingest new bytes of every accepted file.
pub(crate) fn scan_pass(
    ring: &Ring,
    job: &ScanJob,
    offsets: &mut HashMap<String, u64>,
    chunk_size: usize,
    first_pass: bool,
) -> io::Result<()> {
    for entry in std::fs::read_dir(&job.dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if !job.accepts(&name) {
            continue;
        }

        let len = entry.metadata()?.len();
        let offset = match offsets.get(&name) {
            Some(&offset) => {
                if offset > len {
                    // Truncated underneath us; resume from the new end
                    tracing::debug!(file = %name, "File shrank, resetting offset");
                    offsets.insert(name.clone(), len);
                    continue;
                }
                offset
            }
            // Files already present at startup are skipped unless the job
            // ingests current state
            None if first_pass && !job.init_current_state => {
                offsets.insert(name.clone(), len);
                continue;
            }
            None => 0,
        };

        if len > offset {
            let ingested = ingest_file(ring, &entry.path(), &name, offset, len, chunk_size)?;
            offsets.insert(name, offset + ingested);
        }
    }
    Ok(())
}

fn ingest_file(
    ring: &Ring,
    path: &std::path::Path,
    stream: &str,
    offset: u64,
    len: u64,
    chunk_size: usize,
) -> io::Result<u64> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut remaining = len - offset;
    let mut ingested = 0u64;
    let mut buf = vec![0u8; chunk_size];

    while remaining > 0 {
        let want = remaining.min(chunk_size as u64) as usize;
        file.read_exact(&mut buf[..want])?;
        match ring.write_packet(stream, &buf[..want]) {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(file = %stream, error = %e, "Could not write scanned packet");
                break;
            }
        }
        ingested += want as u64;
        remaining -= want as u64;
    }
    Ok(ingested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingReader;

    fn job_for(dir: &std::path::Path) -> ScanJob {
        ScanJob {
            dir: dir.to_path_buf(),
            state_file: None,
            match_pattern: None,
            reject_pattern: None,
            init_current_state: true,
        }
    }

    fn test_ring() -> Ring {
        Ring::initialize(None, 64 * 512, 512, false, true).unwrap()
    }

    #[test]
    fn test_ingests_new_files_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.pkt"), vec![7u8; 300]).unwrap();

        let ring = test_ring();
        let mut offsets = HashMap::new();
        scan_pass(&ring, &job_for(dir.path()), &mut offsets, 256, true).unwrap();

        assert_eq!(offsets["data.pkt"], 300);
        assert_eq!(ring.packet_count(), 2); // 256 + 44 bytes

        let mut reader = RingReader::new();
        let p = ring.read_next(&mut reader).unwrap();
        assert_eq!(p.stream, "data.pkt");
        assert_eq!(p.payload.len(), 256);
    }

    #[test]
    fn test_only_appended_bytes_are_ingested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.pkt");
        std::fs::write(&path, b"first").unwrap();

        let ring = test_ring();
        let job = job_for(dir.path());
        let mut offsets = HashMap::new();
        scan_pass(&ring, &job, &mut offsets, 256, true).unwrap();
        assert_eq!(ring.packet_count(), 1);

        let mut content = std::fs::read(&path).unwrap();
        content.extend_from_slice(b"second");
        std::fs::write(&path, content).unwrap();
        scan_pass(&ring, &job, &mut offsets, 256, false).unwrap();

        assert_eq!(ring.packet_count(), 2);
        let mut reader = RingReader::new();
        ring.read_next(&mut reader).unwrap();
        let p = ring.read_next(&mut reader).unwrap();
        assert_eq!(p.payload, b"second");
    }

    #[test]
    fn test_existing_files_skipped_without_init_current_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.pkt"), b"existing").unwrap();

        let ring = test_ring();
        let mut job = job_for(dir.path());
        job.init_current_state = false;
        let mut offsets = HashMap::new();
        scan_pass(&ring, &job, &mut offsets, 256, true).unwrap();
        assert_eq!(ring.packet_count(), 0);

        // Appends after the first pass are picked up
        let mut content = std::fs::read(dir.path().join("old.pkt")).unwrap();
        content.extend_from_slice(b"fresh");
        std::fs::write(dir.path().join("old.pkt"), content).unwrap();
        scan_pass(&ring, &job, &mut offsets, 256, false).unwrap();
        assert_eq!(ring.packet_count(), 1);
    }

    #[test]
    fn test_match_and_reject_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.pkt"), b"yes").unwrap();
        std::fs::write(dir.path().join("keep.tmp"), b"no").unwrap();
        std::fs::write(dir.path().join("other.log"), b"no").unwrap();

        let ring = test_ring();
        let job = ScanJob {
            dir: dir.path().to_path_buf(),
            state_file: None,
            match_pattern: Some(Regex::new(r"^keep\.").unwrap()),
            reject_pattern: Some(Regex::new(r"\.tmp$").unwrap()),
            init_current_state: true,
        };
        let mut offsets = HashMap::new();
        scan_pass(&ring, &job, &mut offsets, 256, true).unwrap();

        assert_eq!(ring.packet_count(), 1);
        let mut reader = RingReader::new();
        assert_eq!(ring.read_next(&mut reader).unwrap().stream, "keep.pkt");
    }

    #[test]
    fn test_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("scan.state");
        let job = ScanJob {
            state_file: Some(state.clone()),
            ..job_for(dir.path())
        };

        let mut offsets = HashMap::new();
        offsets.insert("a.pkt".to_string(), 42u64);
        job.save_state(&offsets).unwrap();

        assert_eq!(job.load_state(), offsets);
    }
}
