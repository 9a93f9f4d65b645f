use std::io::Write;

use crate::{store::FetchStatus, util};

#[derive(Debug, Default, Clone)]
pub struct DownloadStatistics {
    pub bytes_downloaded: u64,
    pub segments_downloaded: u64,
    pub segments_existing: u64,
    pub segments_missing: u64,
    pub segments_failed: u64,
    pub segments_total: u64,
}

impl DownloadStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, status: &FetchStatus) {
        match status {
            FetchStatus::Stored(size) => {
                self.segments_downloaded += 1;
                self.bytes_downloaded += size;
            }
            FetchStatus::AlreadyExists => self.segments_existing += 1,
            FetchStatus::Http(_) => self.segments_missing += 1,
        }
    }

    /// A request that failed below HTTP (connection, I/O).
    pub fn record_failure(&mut self) {
        self.segments_failed += 1;
    }

    pub fn finished(&self) -> u64 {
        self.segments_downloaded + self.segments_existing + self.segments_missing + self.segments_failed
    }

    pub fn summary(&self) -> String {
        format!(
            "{} downloaded ({}), {} already present, {} missing, {} failed",
            self.segments_downloaded,
            util::format_bytes(self.bytes_downloaded),
            self.segments_existing,
            self.segments_missing,
            self.segments_failed,
        )
    }

    pub fn print(&self) {
        print!(
            "\x1b[2K\rFinished {} of {} segments ({})",
            self.finished(),
            self.segments_total,
            util::format_bytes(self.bytes_downloaded)
        );
        let _ = std::io::stdout().lock().flush();
    }
}
