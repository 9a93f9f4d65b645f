use std::{collections::HashSet, time::Duration};

use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::DownloaderConfig,
    dash::{ManifestClient, ManifestError, ManifestSnapshot},
    stats::DownloadStatistics,
    store::{SegmentStore, StoreError},
};

#[derive(thiserror::Error, Debug)]
pub enum LiveError {
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Polling,
    /// Consecutive polls without a new segment.
    Idle(u32),
    Stopped,
}

/// Follows the newest segments of a live manifest, downloading video then
/// audio for each id as it appears.
pub struct LiveTailFollower<'a> {
    client: &'a ManifestClient,
    video: &'a SegmentStore,
    audio: &'a SegmentStore,
    config: &'a DownloaderConfig,
    poll_interval: Duration,
    token: CancellationToken,
    seen: HashSet<i64>,
    state: LiveState,
    stats: DownloadStatistics,
}

impl<'a> LiveTailFollower<'a> {
    pub fn new(
        client: &'a ManifestClient,
        video: &'a SegmentStore,
        audio: &'a SegmentStore,
        config: &'a DownloaderConfig,
        poll_interval: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            video,
            audio,
            config,
            poll_interval,
            token,
            seen: HashSet::new(),
            state: LiveState::Polling,
            stats: DownloadStatistics::new(),
        }
    }

    pub fn state(&self) -> LiveState {
        self.state
    }

    pub fn stats(&self) -> &DownloadStatistics {
        &self.stats
    }

    /// Fetch the manifest, retrying transport failures with backoff.
    async fn fetch_snapshot(&self) -> Result<ManifestSnapshot, ManifestError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(8))
            .map(jitter)
            .take(self.config.poll_retries);

        RetryIf::spawn(
            strategy,
            || self.client.fetch(),
            |e: &ManifestError| {
                if e.is_transient() {
                    warn!("Manifest poll failed, retrying: {}", e);
                }
                e.is_transient()
            },
        )
        .await
    }

    /// Whether segment `id` is on disk afterwards.
    async fn download(&mut self, store: &SegmentStore, id: i64) -> Result<bool, StoreError> {
        match store.fetch(id).await {
            Ok(status) => {
                info!("Live {} segment {}: {}", store.track().kind, id, status);
                self.stats.record(&status);
                Ok(status.is_available())
            }
            Err(StoreError::Download(e)) => {
                warn!("Live {} segment {}: {}", store.track().kind, id, e);
                self.stats.record_failure();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll the manifest once and download every id not seen yet.
    pub async fn poll_once(&mut self) -> Result<LiveState, LiveError> {
        let snapshot = self.fetch_snapshot().await?;
        let track = self.video.track();
        let ids = snapshot
            .relocate_video(track.index, &track.id)?
            .segment_ids
            .clone();

        let new: Vec<i64> = ids.iter().copied().filter(|id| !self.seen.contains(id)).collect();
        info!(
            "Live poll: {} segments listed, {} new",
            ids.len(),
            new.len()
        );

        let mut stored_any = false;
        for id in &new {
            if self.token.is_cancelled() {
                break;
            }
            let (video, audio) = (self.video, self.audio);
            let video_ok = self.download(video, *id).await?;
            let audio_ok = self.download(audio, *id).await?;
            // Anything short of both tracks on disk is retried on the next poll.
            if video_ok && audio_ok {
                self.seen.insert(*id);
                stored_any = true;
            }
        }

        if stored_any {
            self.state = LiveState::Polling;
            Ok(self.state)
        } else {
            Ok(self.idle(!snapshot.is_dynamic))
        }
    }

    /// Count a poll that brought nothing new. Stops once enough of them
    /// have piled up and the stream has `ended`.
    fn idle(&mut self, ended: bool) -> LiveState {
        let idle = match self.state {
            LiveState::Idle(n) => n + 1,
            _ => 1,
        };
        self.state = if idle >= self.config.max_idle_polls && ended {
            info!("No new segments for {} polls and the stream has ended", idle);
            LiveState::Stopped
        } else {
            LiveState::Idle(idle)
        };
        self.state
    }

    /// Poll until the stream has ended or the token is cancelled.
    pub async fn run(&mut self) -> Result<DownloadStatistics, LiveError> {
        info!("Following live manifest every {:?}", self.poll_interval);

        while self.state != LiveState::Stopped {
            if self.token.is_cancelled() {
                break;
            }
            match self.poll_once().await {
                Ok(_) => (),
                // An unreachable manifest counts as an idle poll of an ended
                // stream; a malformed one is fatal.
                Err(LiveError::Manifest(e)) if e.is_transient() => {
                    warn!("Manifest unavailable: {}", e);
                    self.idle(true);
                }
                Err(e) => return Err(e),
            }
            if self.state == LiveState::Stopped {
                break;
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Live tail finished: {}", self.stats.summary());
        Ok(self.stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use super::*;
    use crate::{
        dash::tests::{fixture, fixture_manifest, MANIFEST_URL},
        store::{tests::FakeFetcher, MemoryStorage},
        util::Fetch,
    };

    struct Setup {
        fetcher: Arc<FakeFetcher>,
        client: ManifestClient,
        video: SegmentStore,
        audio: SegmentStore,
    }

    fn setup(manifest: &str) -> Setup {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(MANIFEST_URL.to_string(), manifest.as_bytes());
        let storage = Arc::new(MemoryStorage::new());
        let snapshot = fixture_manifest();
        let dyn_fetcher: Arc<dyn Fetch> = fetcher.clone();

        let video_track = &snapshot.video_tracks[0];
        let audio_track = &snapshot.audio_tracks[0];
        for id in &video_track.segment_ids {
            fetcher.serve(video_track.segment_url(*id), b"video");
            fetcher.serve(audio_track.segment_url(*id), b"audio");
        }

        Setup {
            client: ManifestClient::new(MANIFEST_URL, dyn_fetcher.clone()).unwrap(),
            video: SegmentStore::new(Path::new("/save"), video_track, storage.clone(), dyn_fetcher.clone()),
            audio: SegmentStore::new(Path::new("/save"), audio_track, storage, dyn_fetcher),
            fetcher,
        }
    }

    fn config(max_idle_polls: u32) -> DownloaderConfig {
        DownloaderConfig {
            max_idle_polls,
            ..DownloaderConfig::default()
        }
    }

    #[tokio::test]
    async fn downloads_video_then_audio_and_stops_when_static() {
        let manifest = fixture("live_manifest.mpd").replace("type=\"dynamic\"", "type=\"static\"");
        let s = setup(&manifest);
        let config = config(3);
        let mut live = LiveTailFollower::new(
            &s.client,
            &s.video,
            &s.audio,
            &config,
            Duration::ZERO,
            CancellationToken::new(),
        );

        let stats = live.run().await.unwrap();
        assert_eq!(live.state(), LiveState::Stopped);
        assert_eq!(stats.segments_downloaded, 12);

        let segment_requests: Vec<String> = s
            .fetcher
            .requested()
            .into_iter()
            .filter(|u| u != MANIFEST_URL)
            .collect();
        let mut expected = Vec::new();
        for id in [90000, 92000, 94000, 96000, 98000, 100000] {
            expected.push(s.video.track().segment_url(id));
            expected.push(s.audio.track().segment_url(id));
        }
        assert_eq!(segment_requests, expected);

        // One poll with new segments, then three idle ones.
        let manifest_polls = s
            .fetcher
            .requested()
            .iter()
            .filter(|u| *u == MANIFEST_URL)
            .count();
        assert_eq!(manifest_polls, 4);
    }

    #[tokio::test]
    async fn keeps_polling_dynamic_manifest() {
        let s = setup(&fixture("live_manifest.mpd"));
        let config = config(2);
        let mut live = LiveTailFollower::new(
            &s.client,
            &s.video,
            &s.audio,
            &config,
            Duration::ZERO,
            CancellationToken::new(),
        );

        assert_eq!(live.poll_once().await.unwrap(), LiveState::Polling);
        assert_eq!(live.poll_once().await.unwrap(), LiveState::Idle(1));
        assert_eq!(live.poll_once().await.unwrap(), LiveState::Idle(2));
        assert_eq!(live.poll_once().await.unwrap(), LiveState::Idle(3));
    }

    #[tokio::test]
    async fn missing_segment_is_retried_next_poll() {
        let s = setup(&fixture("live_manifest.mpd"));
        let late = s.video.track().segment_url(100000);
        s.fetcher.forget(&late);
        let config = config(2);
        let mut live = LiveTailFollower::new(
            &s.client,
            &s.video,
            &s.audio,
            &config,
            Duration::ZERO,
            CancellationToken::new(),
        );

        assert_eq!(live.poll_once().await.unwrap(), LiveState::Polling);
        assert!(!s.video.has(100000).await.unwrap());
        assert!(s.video.has(98000).await.unwrap());

        s.fetcher.serve(late.clone(), b"video");
        assert_eq!(live.poll_once().await.unwrap(), LiveState::Polling);
        assert!(s.video.has(100000).await.unwrap());
        assert_eq!(s.fetcher.requested().iter().filter(|u| **u == late).count(), 2);

        assert_eq!(live.poll_once().await.unwrap(), LiveState::Idle(1));
        assert_eq!(s.fetcher.requested().iter().filter(|u| **u == late).count(), 2);
    }

    #[tokio::test]
    async fn segment_that_never_appears_does_not_keep_tail_alive() {
        let manifest = fixture("live_manifest.mpd").replace("type=\"dynamic\"", "type=\"static\"");
        let s = setup(&manifest);
        let gone = s.video.track().segment_url(90000);
        s.fetcher.forget(&gone);
        let config = config(2);
        let mut live = LiveTailFollower::new(
            &s.client,
            &s.video,
            &s.audio,
            &config,
            Duration::ZERO,
            CancellationToken::new(),
        );

        let stats = live.run().await.unwrap();
        assert_eq!(live.state(), LiveState::Stopped);
        assert_eq!(stats.segments_downloaded, 11);
        // Every poll asks for it again.
        assert_eq!(s.fetcher.requested().iter().filter(|u| **u == gone).count(), 3);
    }

    #[tokio::test]
    async fn unreachable_manifest_ends_tail_without_error() {
        let s = setup(&fixture("live_manifest.mpd"));
        s.fetcher.forget(MANIFEST_URL);
        let config = DownloaderConfig {
            poll_retries: 0,
            ..config(3)
        };
        let mut live = LiveTailFollower::new(
            &s.client,
            &s.video,
            &s.audio,
            &config,
            Duration::ZERO,
            CancellationToken::new(),
        );

        let stats = live.run().await.unwrap();
        assert_eq!(live.state(), LiveState::Stopped);
        assert_eq!(stats.finished(), 0);
        assert_eq!(s.fetcher.requested(), vec![MANIFEST_URL.to_string(); 3]);
    }

    #[tokio::test]
    async fn reordered_manifest_is_fatal() {
        let manifest = fixture("live_manifest.mpd")
            .replace("dash-lp-pst-v\" mimeType", "dash-lp-tmp-v\" mimeType")
            .replace("dash-lp-abr-v\" mimeType", "dash-lp-pst-v\" mimeType");
        let s = setup(&manifest);
        let config = config(2);
        let mut live = LiveTailFollower::new(
            &s.client,
            &s.video,
            &s.audio,
            &config,
            Duration::ZERO,
            CancellationToken::new(),
        );

        assert!(matches!(
            live.poll_once().await,
            Err(LiveError::Manifest(ManifestError::TrackMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let s = setup(&fixture("live_manifest.mpd"));
        let config = config(2);
        let token = CancellationToken::new();
        token.cancel();
        let mut live = LiveTailFollower::new(&s.client, &s.video, &s.audio, &config, Duration::ZERO, token);

        let stats = live.run().await.unwrap();
        assert_eq!(stats.finished(), 0);
        assert!(s.fetcher.requested().is_empty());
    }
}
