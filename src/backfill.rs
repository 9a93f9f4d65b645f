//! Walking the segment timeline back (or forward) from a known id.
//!
//! The manifest only lists the newest few segments, and older ids can't be
//! computed exactly: the interval drifts and segments go missing. Each step
//! escalates from free to expensive until the next segment is found:
//!
//! 1. a file already on disk near the best guess,
//! 2. sequential requests for the guesses, most common interval first,
//! 3. a concurrent sweep of a window around the best guess, first hit wins.
//!
//! When all three come up empty the walk is over.

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Direction, DownloaderConfig},
    interval::IntervalHistogram,
    stats::DownloadStatistics,
    store::{FetchStatus, SegmentStore, StoreError},
};

/// Run `probe` over `candidates` in order with at most `concurrency`
/// probes in flight. Returns the first id whose probe reports the segment
/// available; probes still in flight at that point are dropped, which
/// cancels their requests.
pub async fn race_first_success<F, Fut>(
    candidates: Vec<i64>,
    concurrency: usize,
    token: &CancellationToken,
    probe: F,
) -> Option<(i64, FetchStatus)>
where
    F: Fn(i64) -> Fut,
    Fut: Future<Output = Option<FetchStatus>>,
{
    let probe = &probe;
    let start = move |id: i64| async move { (id, probe(id).await) };

    let mut pending = candidates.into_iter();
    let mut in_flight = FuturesUnordered::new();
    for id in pending.by_ref().take(concurrency.max(1)) {
        in_flight.push(start(id));
    }

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            next = in_flight.next() => match next {
                None => return None,
                Some((id, Some(status))) if status.is_available() => return Some((id, status)),
                Some(_) => {
                    if let Some(id) = pending.next() {
                        in_flight.push(start(id));
                    }
                }
            },
        }
    }
}

/// Probe one segment, treating transport failures as a miss.
async fn probe(store: &SegmentStore, id: i64) -> Option<FetchStatus> {
    match store.fetch(id).await {
        Ok(status) => {
            debug!("Segment {}: {}", id, status);
            Some(status)
        }
        Err(e) => {
            warn!("Segment {}: {}", id, e);
            None
        }
    }
}

/// Sweep `start..=end` (descending if `start > end`) for any available
/// segment, at most `concurrency` requests at a time.
pub async fn sweep_range(
    store: &SegmentStore,
    start: i64,
    end: i64,
    concurrency: usize,
    token: &CancellationToken,
) -> Option<(i64, FetchStatus)> {
    let ids: Vec<i64> = if start <= end {
        (start..=end).filter(|id| *id > 0).collect()
    } else {
        (end..=start).rev().filter(|id| *id > 0).collect()
    };
    let first = ids.first()?;

    info!(
        "Checking {} ids starting from {} with {} workers",
        ids.len(),
        first,
        concurrency
    );
    race_first_success(ids, concurrency, token, |id| probe(store, id)).await
}

#[derive(Debug, Default, Clone)]
pub struct BackfillReport {
    /// Segments found, on disk before or downloaded now.
    pub accepted: usize,
    /// Last segment reached by the walk.
    pub last_id: Option<i64>,
    pub stats: DownloadStatistics,
}

pub struct BackfillWalker<'a> {
    store: &'a SegmentStore,
    config: &'a DownloaderConfig,
    interval: i64,
    histogram: IntervalHistogram,
    token: CancellationToken,
}

impl<'a> BackfillWalker<'a> {
    pub fn new(
        store: &'a SegmentStore,
        interval: i64,
        config: &'a DownloaderConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            interval,
            histogram: IntervalHistogram::new(interval, config.histogram_cutoff),
            token,
        }
    }

    pub fn histogram(&self) -> &IntervalHistogram {
        &self.histogram
    }

    fn direction(&self) -> Direction {
        self.config.direction
    }

    fn is_ahead(&self, candidate: i64, prev: Option<i64>) -> bool {
        prev.map_or(true, |p| self.direction().is_ahead(candidate, p))
    }

    fn scaled(&self, factor: f64) -> i64 {
        (self.interval as f64 * factor).round() as i64
    }

    /// Look for a stored segment within `tolerance * interval` of `guess`,
    /// nearest first.
    async fn probe_local(&self, guess: i64, prev: Option<i64>) -> Result<Option<i64>, StoreError> {
        let reach = self.scaled(self.config.tolerance);
        let mut candidates: Vec<i64> = (guess - reach..=guess + reach)
            .filter(|c| self.is_ahead(*c, prev))
            .collect();
        candidates.sort_by_key(|c| (c - guess).abs());

        for candidate in candidates {
            if self.store.has(candidate).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn probe_guesses(&self, guesses: &[i64], prev: Option<i64>) -> Option<(i64, FetchStatus)> {
        for &guess in guesses.iter().filter(|g| **g > 0 && self.is_ahead(**g, prev)) {
            if self.token.is_cancelled() {
                return None;
            }
            if let Some(status) = probe(self.store, guess).await {
                if status.is_available() {
                    return Some((guess, status));
                }
            }
        }
        None
    }

    /// Candidate ids for the concurrent sweep around `guess`, nearest first.
    fn wide_window(&self, guess: i64, prev: Option<i64>, tried: &[i64]) -> Vec<i64> {
        let sign = self.direction().sign();
        let widen = 1.0 + self.config.tolerance;
        let behind = guess - self.scaled(self.config.wide_search_behind * widen) * sign;
        let ahead = guess + self.scaled(self.config.wide_search_ahead * widen) * sign;

        let mut ids: Vec<i64> = (behind.min(ahead)..=behind.max(ahead))
            .filter(|c| *c > 0 && !tried.contains(c) && self.is_ahead(*c, prev))
            .collect();
        ids.sort_by_key(|c| (c - guess).abs());
        ids
    }

    /// Walk from `start` until no further segment can be found, the debug
    /// cap is hit, or the token is cancelled.
    pub async fn run(&mut self, start: i64) -> Result<BackfillReport, StoreError> {
        let sign = self.direction().sign();
        let mut report = BackfillReport::default();
        let mut guesses = vec![start];
        let mut prev: Option<i64> = None;

        info!(
            "Walking {:?} from segment {} (interval {})",
            self.direction(),
            start,
            self.interval
        );

        loop {
            if self.token.is_cancelled() {
                info!("Backfill interrupted");
                break;
            }

            let guess = guesses[0];
            let found = match self.probe_local(guess, prev).await? {
                Some(id) => Some((id, FetchStatus::AlreadyExists)),
                None => match self.probe_guesses(&guesses, prev).await {
                    Some(hit) => Some(hit),
                    None => {
                        let window = self.wide_window(guess, prev, &guesses);
                        debug!("Sweeping {} ids around {}", window.len(), guess);
                        race_first_success(
                            window,
                            self.config.search_concurrency,
                            &self.token,
                            |id| probe(self.store, id),
                        )
                        .await
                    }
                },
            };

            let Some((id, status)) = found else {
                if !self.token.is_cancelled() {
                    info!(
                        "No segment found around {}, assuming everything is downloaded",
                        guess
                    );
                }
                break;
            };

            info!("Segment {}: {}", id, status);
            report.stats.record(&status);
            report.accepted += 1;
            report.last_id = Some(id);

            if let Some(p) = prev {
                self.histogram.record(id - p);
            }
            if let Some(cap) = self.config.debug_segment_cap {
                if report.accepted >= cap {
                    info!("Stopping after {} segments (debug)", cap);
                    break;
                }
            }

            prev = Some(id);
            guesses = self.histogram.guesses(id, sign);
        }

        info!("Backfill finished: {}", report.stats.summary());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::store::{
        tests::{video_store, FakeFetcher},
        MemoryStorage,
    };

    fn config() -> DownloaderConfig {
        DownloaderConfig::default()
    }

    fn id_of(url: &str) -> i64 {
        let name = crate::util::web_name(url);
        let digits = name
            .trim_end_matches(".m4v")
            .rsplit('-')
            .next()
            .unwrap()
            .to_string();
        digits.parse().unwrap()
    }

    #[tokio::test]
    async fn stops_at_earliest_without_refetching() {
        let storage = MemoryStorage::new();
        let fetcher = Arc::new(FakeFetcher::default());
        let store = video_store(&storage, &fetcher);
        for id in [100000, 98000, 96000] {
            store.put(id, b"segment").await.unwrap();
        }

        let config = config();
        let mut walker = BackfillWalker::new(&store, 2000, &config, CancellationToken::new());
        let report = walker.run(100000).await.unwrap();

        assert_eq!(report.accepted, 3);
        assert_eq!(report.last_id, Some(96000));
        assert_eq!(report.stats.segments_existing, 3);
        assert_eq!(walker.histogram().count(2000), 2);

        // Only ids past the earliest stored one ever hit the network.
        let requested: Vec<i64> = fetcher.requested().iter().map(|u| id_of(u)).collect();
        assert!(!requested.is_empty());
        assert!(requested.iter().all(|id| *id < 96000), "{:?}", requested);
        assert!(requested.contains(&94000));
    }

    #[tokio::test]
    async fn recovers_from_drift_and_missing_segment() {
        let storage = MemoryStorage::new();
        let fetcher = Arc::new(FakeFetcher::default());
        let store = video_store(&storage, &fetcher);
        let track = store.track().clone();

        // 93967 is two drifting intervals away from 98000, 91967 missing
        // entirely, 89967 one more interval back.
        for id in [98000, 96001, 93967, 89967] {
            fetcher.serve(track.segment_url(id), b"segment");
        }

        let config = config();
        let mut walker = BackfillWalker::new(&store, 2000, &config, CancellationToken::new());
        let report = walker.run(98000).await.unwrap();

        assert_eq!(report.accepted, 4);
        assert_eq!(report.last_id, Some(89967));
        assert_eq!(report.stats.segments_downloaded, 4);
        for id in [98000, 96001, 93967, 89967] {
            assert!(store.has(id).await.unwrap());
        }
        assert_eq!(walker.histogram().count(1999), 1);
        assert_eq!(walker.histogram().count(2034), 1);
        // 93967 -> 89967 spans a missing segment and is not an interval.
        assert_eq!(walker.histogram().count(4000), 0);
    }

    #[tokio::test]
    async fn forward_walk_and_debug_cap() {
        let storage = MemoryStorage::new();
        let fetcher = Arc::new(FakeFetcher::default());
        let store = video_store(&storage, &fetcher);
        let track = store.track().clone();
        for id in (0..10).map(|k| 100000 + k * 2000) {
            fetcher.serve(track.segment_url(id), b"segment");
        }

        let config = DownloaderConfig {
            direction: Direction::Forward,
            debug_segment_cap: Some(3),
            ..config()
        };
        let mut walker = BackfillWalker::new(&store, 2000, &config, CancellationToken::new());
        let report = walker.run(100000).await.unwrap();

        assert_eq!(report.accepted, 3);
        assert_eq!(report.last_id, Some(104000));
        assert!(!store.has(106000).await.unwrap());
    }

    #[tokio::test]
    async fn unit_interval_terminates() {
        let storage = MemoryStorage::new();
        let fetcher = Arc::new(FakeFetcher::default());
        let store = video_store(&storage, &fetcher);
        for id in [100, 99, 98] {
            store.put(id, b"segment").await.unwrap();
        }

        let config = config();
        let mut walker = BackfillWalker::new(&store, 1, &config, CancellationToken::new());
        let report = tokio::time::timeout(std::time::Duration::from_secs(5), walker.run(100))
            .await
            .expect("walk did not terminate")
            .unwrap();

        assert_eq!(report.accepted, 3);
        assert_eq!(report.last_id, Some(98));
        assert_eq!(walker.histogram().count(1), 2);
        let requested: Vec<i64> = fetcher.requested().iter().map(|u| id_of(u)).collect();
        assert!(requested.iter().all(|id| *id < 98), "{:?}", requested);
    }

    #[test]
    fn wide_window_bounds() {
        let storage = MemoryStorage::new();
        let fetcher = Arc::new(FakeFetcher::default());
        let store = video_store(&storage, &fetcher);
        let config = config();
        let walker = BackfillWalker::new(&store, 2000, &config, CancellationToken::new());

        let window = walker.wide_window(94000, Some(96000), &[94000, 94001, 93999]);
        assert_eq!(window[0], 93998);
        assert_eq!(window.iter().max(), Some(&95200));
        assert_eq!(window.iter().min(), Some(&91600));
        assert!(!window.contains(&94000));
        assert_eq!(window.len(), 3601 - 3);

        // Nothing at or behind the previous segment.
        let window = walker.wide_window(97000, Some(96000), &[]);
        assert!(window.iter().all(|id| *id < 96000));
    }

    #[tokio::test]
    async fn race_returns_first_success_and_stops() {
        let probed = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let candidates: Vec<i64> = (1..=100).collect();

        let hit = race_first_success(candidates, 4, &token, |id| {
            probed.fetch_add(1, Ordering::SeqCst);
            async move {
                if id == 10 {
                    Some(FetchStatus::Stored(1))
                } else {
                    Some(FetchStatus::Http(404))
                }
            }
        })
        .await;

        assert_eq!(hit, Some((10, FetchStatus::Stored(1))));
        assert!(probed.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn race_respects_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let hit = race_first_success(vec![1, 2, 3], 2, &token, |_| async {
            Some(FetchStatus::Stored(1))
        })
        .await;
        assert_eq!(hit, None);
    }

    #[tokio::test]
    async fn sweep_descending_range() {
        let storage = MemoryStorage::new();
        let fetcher = Arc::new(FakeFetcher::default());
        let store = video_store(&storage, &fetcher);
        fetcher.serve(store.track().segment_url(50), b"segment");

        let token = CancellationToken::new();
        let hit = sweep_range(&store, 60, -5, 1, &token).await;
        assert_eq!(hit, Some((50, FetchStatus::Stored(7))));
        assert_eq!(fetcher.requested().len(), 11);

        assert_eq!(sweep_range(&store, -5, 0, 4, &token).await, None);
    }
}
