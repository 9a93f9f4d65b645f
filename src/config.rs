use std::{path::PathBuf, time::Duration};

/// Direction the backfill walk moves through segment ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Backward,
    Forward,
}

impl Direction {
    pub fn sign(self) -> i64 {
        match self {
            Direction::Backward => -1,
            Direction::Forward => 1,
        }
    }

    /// Whether `candidate` lies strictly past `prev` in this direction.
    pub fn is_ahead(self, candidate: i64, prev: i64) -> bool {
        (candidate - prev) * self.sign() > 0
    }
}

/// Tunables for segment discovery, auditing and live polling.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DownloaderConfig {
    pub save_dir: PathBuf,
    /// Video quality hint, `None` or `"highest"` for the best track.
    pub quality: Option<String>,
    /// Start the backfill walk here instead of at the newest manifest id.
    pub last_id: Option<i64>,
    pub direction: Direction,
    /// Stop the backfill walk after this many accepted segments.
    pub debug_segment_cap: Option<usize>,
    /// Inclusive id range for a manual sweep, the worst gap if unset.
    pub manual_range: Option<(i64, i64)>,

    /// Half width of the local-file probe window, as a fraction of the
    /// interval.
    pub tolerance: f64,
    /// Wide search reaches `behind * interval * (1 + tolerance)` back toward
    /// the previous segment...
    pub wide_search_behind: f64,
    /// ...and `ahead * interval * (1 + tolerance)` past the guess.
    pub wide_search_ahead: f64,
    /// Observed deltas at or above `cutoff * interval` are gaps, not
    /// intervals.
    pub histogram_cutoff: f64,
    pub audit_tolerance: f64,

    pub search_concurrency: usize,
    pub bulk_concurrency: usize,

    pub max_idle_polls: u32,
    pub min_poll_interval: Duration,
    pub poll_retries: usize,

    pub http_retries: u32,

    /// Program used to remux the merged tracks.
    pub ffmpeg: PathBuf,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("."),
            quality: None,
            last_id: None,
            direction: Direction::Backward,
            debug_segment_cap: None,
            manual_range: None,
            tolerance: 0.2,
            wide_search_behind: 0.5,
            wide_search_ahead: 1.0,
            histogram_cutoff: 1.6,
            audit_tolerance: 0.1,
            search_concurrency: 20,
            bulk_concurrency: 20,
            max_idle_polls: 20,
            min_poll_interval: Duration::from_secs(2),
            poll_retries: 3,
            http_retries: 3,
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}
