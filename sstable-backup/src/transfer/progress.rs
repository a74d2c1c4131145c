//! Session progress reporting.
//!
//! Progress is unit based (finished / submitted); bytes are reported
//! alongside so the log shows throughput of long transfers.

use std::fmt;
use std::time::Duration;

/// Snapshot of a transfer session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProgress {
    /// Units submitted to the session
    pub total_units: usize,

    /// Units in a terminal state
    pub finished_units: usize,

    /// Units that failed, were cancelled or ignored
    pub failed_units: usize,

    /// Size of every unit in the session
    pub total_bytes: u64,

    /// Size of the units that finished successfully
    pub transferred_bytes: u64,

    pub elapsed: Duration,
}

impl SessionProgress {
    /// Fraction in `[0, 1]`, 0 while nothing was submitted.
    pub fn fraction(&self) -> f64 {
        if self.total_units == 0 {
            0.0
        } else {
            self.finished_units as f64 / self.total_units as f64
        }
    }

    pub fn percent_complete(&self) -> f64 {
        self.fraction() * 100.0
    }

    /// Average speed since the session started
    pub fn bytes_per_second(&self) -> u64 {
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed > 0.0 {
            (self.transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn eta_seconds(&self) -> Option<u64> {
        let speed = self.bytes_per_second();
        if speed == 0 {
            return None;
        }
        Some(self.total_bytes.saturating_sub(self.transferred_bytes) / speed)
    }
}

impl fmt::Display for SessionProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} units ({:.2}%), {} of {}, {}",
            self.finished_units,
            self.total_units,
            self.percent_complete(),
            format_bytes(self.transferred_bytes),
            format_bytes(self.total_bytes),
            format_speed(self.bytes_per_second()),
        )?;
        if let Some(eta) = self.eta_seconds() {
            write!(f, ", eta {}", format_duration(eta))?;
        }
        if self.failed_units > 0 {
            write!(f, ", {} failed", self.failed_units)?;
        }
        Ok(())
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
