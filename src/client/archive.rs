//! Per-client archive writer.
//!
//! When an archive directory is configured, every admitted client carries
//! an [`ArchiveSpec`] and its protocol handler appends received packets to
//! per-stream files under `<dir>/<YYYYMMDD>/`. The writer is owned by one
//! client task, so it needs no locking.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::AsyncWriteExt;

/// Archive settings copied from the config snapshot at connect time.
#[derive(Debug, Clone)]
pub struct ArchiveSpec {
    pub dir: String,
    pub idle_timeout: Duration,
}

/// Cap on simultaneously open archive files per client.
const MAX_OPEN_FILES: usize = 50;

struct OpenFile {
    file: tokio::fs::File,
    last_write: Instant,
}

/// Appends packets to per-stream archive files, keeping a bounded set of
/// open handles and closing those idle past the configured timeout.
pub struct ArchiveWriter {
    spec: ArchiveSpec,
    open: HashMap<String, OpenFile>,
}

impl ArchiveWriter {
    pub fn new(spec: ArchiveSpec) -> Self {
        Self {
            spec,
            open: HashMap::new(),
        }
    }

    /// Append one packet to the stream's archive file.
    pub async fn archive(&mut self, stream: &str, payload: &[u8]) -> io::Result<()> {
        self.close_idle();

        if !self.open.contains_key(stream) {
            if self.open.len() >= MAX_OPEN_FILES {
                self.close_oldest();
            }
            let path = self.file_path(stream);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            self.open.insert(
                stream.to_string(),
                OpenFile {
                    file,
                    last_write: Instant::now(),
                },
            );
        }

        let entry = self.open.get_mut(stream).expect("just inserted");
        entry.file.write_all(payload).await?;
        entry.last_write = Instant::now();
        Ok(())
    }

    fn file_path(&self, stream: &str) -> PathBuf {
        let day = Utc::now().format("%Y%m%d").to_string();
        let name: String = stream
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        PathBuf::from(&self.spec.dir).join(day).join(name)
    }

    fn close_idle(&mut self) {
        let timeout = self.spec.idle_timeout;
        self.open.retain(|_, f| f.last_write.elapsed() < timeout);
    }

    fn close_oldest(&mut self) {
        if let Some(stream) = self
            .open
            .iter()
            .min_by_key(|(_, f)| f.last_write)
            .map(|(s, _)| s.clone())
        {
            self.open.remove(&stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_archive_appends_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::new(ArchiveSpec {
            dir: dir.path().to_str().unwrap().to_string(),
            idle_timeout: Duration::from_secs(300),
        });

        writer.archive("NET_STA", b"one").await.unwrap();
        writer.archive("NET_STA", b"two").await.unwrap();
        writer.archive("NET_OTHER", b"x").await.unwrap();

        let day = Utc::now().format("%Y%m%d").to_string();
        let content = std::fs::read(dir.path().join(&day).join("NET_STA")).unwrap();
        assert_eq!(content, b"onetwo");
        assert!(dir.path().join(&day).join("NET_OTHER").exists());
    }

    #[tokio::test]
    async fn test_stream_names_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::new(ArchiveSpec {
            dir: dir.path().to_str().unwrap().to_string(),
            idle_timeout: Duration::from_secs(300),
        });

        writer.archive("NET/STA", b"data").await.unwrap();
        let day = Utc::now().format("%Y%m%d").to_string();
        assert!(dir.path().join(&day).join("NET_STA").exists());
    }
}
