//! Periodic per-client transfer logging.
//!
//! When a base directory is configured, the supervisor writes one row per
//! live client whenever the interval window rolls over. Windows are
//! aligned to the interval boundary; a configuration reload resets the
//! window from the current time.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::client::ClientRecord;
use crate::config::schema::TransferLogConfig;

/// The active transfer-log window and its settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferLog {
    dir: PathBuf,
    prefix: String,
    interval_secs: i64,
    tx_log: bool,
    rx_log: bool,
    window_start: i64,
    window_end: i64,
}

/// Align a window to the interval boundary containing `now`.
pub fn calc_interval_window(now: i64, interval_secs: i64) -> (i64, i64) {
    let start = now - now.rem_euclid(interval_secs);
    (start, start + interval_secs)
}

impl TransferLog {
    /// Build from config; None when transfer logging is off.
    pub fn from_config(config: &TransferLogConfig, now: i64) -> Option<Self> {
        let dir = config.dir.as_ref()?;
        let interval_secs = ((config.interval_hours * 3600.0) as i64).max(1);
        let (window_start, window_end) = calc_interval_window(now, interval_secs);
        Some(Self {
            dir: PathBuf::from(dir),
            prefix: config.prefix.clone().unwrap_or_default(),
            interval_secs,
            tx_log: config.tx_log,
            rx_log: config.rx_log,
            window_start,
            window_end,
        })
    }

    /// Whether the current window has ended.
    pub fn rollover_due(&self, now: i64) -> bool {
        now >= self.window_end
    }

    pub fn window(&self) -> (i64, i64) {
        (self.window_start, self.window_end)
    }

    /// Append this client's interval totals to the per-direction log
    /// files for the current window.
    pub fn write_row(&self, record: &ClientRecord) -> std::io::Result<()> {
        let totals = record.stats.take_interval_totals();
        let start = format_time(self.window_start);
        let end = format_time(self.window_end);

        std::fs::create_dir_all(&self.dir)?;

        if self.tx_log {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_path("tx"))?;
            writeln!(
                file,
                "{} - {} {} {} {}",
                start,
                end,
                record.address(),
                totals.tx_packets,
                totals.tx_bytes
            )?;
        }
        if self.rx_log {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_path("rx"))?;
            writeln!(
                file,
                "{} - {} {} {} {}",
                start,
                end,
                record.address(),
                totals.rx_packets,
                totals.rx_bytes
            )?;
        }
        Ok(())
    }

    fn file_path(&self, direction: &str) -> PathBuf {
        let stamp = DateTime::from_timestamp(self.window_start, 0)
            .map(|t| t.format("%Y%m%dT%H%M%S").to_string())
            .unwrap_or_else(|| self.window_start.to_string());
        self.dir
            .join(format!("{}{}-{}.log", self.prefix, direction, stamp))
    }
}

fn format_time(epoch: i64) -> String {
    DateTime::from_timestamp(epoch, 0)
        .map(|t: DateTime<Utc>| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| epoch.to_string())
}
