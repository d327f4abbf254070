//! Worker and publisher statistics.
//!
//! Counters are atomics shared by every consumer task; a [`DownloadSummary`]
//! snapshot is taken at shutdown and printed as a table (TTY) or logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use pixeline_core::fmt_num;

use crate::admission::RejectReason;

/// Live counters for one worker process
#[derive(Debug, Default)]
pub struct DownloadStats {
    downloaded: AtomicU64,
    errors: AtomicU64,
    not_found: AtomicU64,
    rejected_locked: AtomicU64,
    rejected_filter: AtomicU64,
    rejected_downloaded: AtomicU64,
    rejected_not_found: AtomicU64,
    malformed: AtomicU64,
    bytes: AtomicU64,
    fetch_micros: AtomicU64,
}

impl DownloadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, bytes: usize, latency: Duration) {
        self.downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.fetch_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::Locked => &self.rejected_locked,
            RejectReason::ProbablyDuplicate => &self.rejected_filter,
            RejectReason::Downloaded => &self.rejected_downloaded,
            RejectReason::NotFound => &self.rejected_not_found,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Delivery dropped because its payload could not be parsed
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DownloadSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DownloadSummary {
            downloaded: load(&self.downloaded),
            errors: load(&self.errors),
            not_found: load(&self.not_found),
            rejected_locked: load(&self.rejected_locked),
            rejected_filter: load(&self.rejected_filter),
            rejected_downloaded: load(&self.rejected_downloaded),
            rejected_not_found: load(&self.rejected_not_found),
            malformed: load(&self.malformed),
            bytes: load(&self.bytes),
            fetch_time: Duration::from_micros(load(&self.fetch_micros)),
        }
    }
}

/// Point-in-time copy of [`DownloadStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub downloaded: u64,
    pub errors: u64,
    pub not_found: u64,
    pub rejected_locked: u64,
    pub rejected_filter: u64,
    pub rejected_downloaded: u64,
    pub rejected_not_found: u64,
    pub malformed: u64,
    pub bytes: u64,
    /// Cumulative fetch latency of successful downloads
    pub fetch_time: Duration,
}

impl DownloadSummary {
    pub fn rejected(&self) -> u64 {
        self.rejected_locked + self.rejected_filter + self.rejected_downloaded + self.rejected_not_found
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        u32::try_from(self.downloaded)
            .ok()
            .filter(|&n| n > 0)
            .map(|n| self.fetch_time / n)
    }

    pub fn format_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Downloads")
                    .fg(Color::Cyan)
                    .add_attribute(comfy_table::Attribute::Bold),
                Cell::new("Value").fg(Color::Cyan),
            ]);

        let rows = [
            ("Downloaded", fmt_num(self.downloaded)),
            ("Not found (404/410)", fmt_num(self.not_found)),
            ("Errors", fmt_num(self.errors)),
            ("Rejected: locked", fmt_num(self.rejected_locked)),
            ("Rejected: filter", fmt_num(self.rejected_filter)),
            ("Rejected: downloaded", fmt_num(self.rejected_downloaded)),
            ("Rejected: not found", fmt_num(self.rejected_not_found)),
            ("Malformed messages", fmt_num(self.malformed)),
            ("Bytes", fmt_num(self.bytes)),
        ];
        for (name, value) in rows {
            table.add_row(vec![Cell::new(name), Cell::new(value)]);
        }
        let latency = self
            .mean_latency()
            .map(|d| format!("{} ms", d.as_millis()))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![Cell::new("Mean fetch latency"), Cell::new(latency)]);
        table.to_string()
    }

    pub fn log(&self) {
        log::info!(
            "downloaded={} not_found={} errors={} rejected={} (locked={} filter={} downloaded={} not_found={}) malformed={} bytes={}",
            self.downloaded,
            self.not_found,
            self.errors,
            self.rejected(),
            self.rejected_locked,
            self.rejected_filter,
            self.rejected_downloaded,
            self.rejected_not_found,
            self.malformed,
            self.bytes
        );
    }
}

/// Outcome of one corpus publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub lines_read: u64,
    /// Blank and `#` comment lines
    pub skipped: u64,
    pub chunks: u64,
    /// Already downloaded or known not-found
    pub filtered_out: u64,
    pub published: u64,
}

impl PublishStats {
    pub fn format_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Publish")
                    .fg(Color::Cyan)
                    .add_attribute(comfy_table::Attribute::Bold),
                Cell::new("Value").fg(Color::Cyan),
            ]);
        let rows = [
            ("Lines read", self.lines_read),
            ("Skipped", self.skipped),
            ("Chunks", self.chunks),
            ("Filtered out", self.filtered_out),
            ("Published", self.published),
        ];
        for (name, value) in rows {
            table.add_row(vec![Cell::new(name), Cell::new(fmt_num(value))]);
        }
        table.to_string()
    }

    pub fn log(&self) {
        log::info!(
            "lines={} skipped={} chunks={} filtered_out={} published={}",
            self.lines_read,
            self.skipped,
            self.chunks,
            self.filtered_out,
            self.published
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = DownloadStats::new();
        stats.record_success(100, Duration::from_millis(20));
        stats.record_success(50, Duration::from_millis(40));
        stats.record_error();
        stats.record_not_found();
        stats.record_rejection(RejectReason::Locked);
        stats.record_rejection(RejectReason::Downloaded);
        stats.record_rejection(RejectReason::Downloaded);

        let s = stats.snapshot();
        assert_eq!(s.downloaded, 2);
        assert_eq!(s.bytes, 150);
        assert_eq!(s.errors, 1);
        assert_eq!(s.not_found, 1);
        assert_eq!(s.rejected_downloaded, 2);
        assert_eq!(s.rejected(), 3);
        assert_eq!(s.mean_latency(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn no_latency_without_downloads() {
        assert_eq!(DownloadSummary::default().mean_latency(), None);
    }

    #[test]
    fn tables_render() {
        let s = DownloadSummary {
            downloaded: 1234,
            ..Default::default()
        };
        let table = s.format_table();
        assert!(table.contains("Downloaded"));
        assert!(table.contains("1,234"));

        let p = PublishStats {
            published: 10,
            ..Default::default()
        };
        assert!(p.format_table().contains("Published"));
    }
}
