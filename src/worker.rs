use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::{stream, try_join, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    audit::{self, AuditReport, Gap},
    backfill::{self, BackfillReport, BackfillWalker},
    config::DownloaderConfig,
    dash::{ManifestClient, ManifestError, ManifestSnapshot, Track},
    import::{self, ImportError, ImportReport},
    interval,
    live::{LiveError, LiveTailFollower},
    merge::{self, segment_key, MergeError, SegmentKey},
    select::{self, SelectError},
    stats::DownloadStatistics,
    store::{FetchStatus, SegmentStore, Storage, StoreError},
    util::{self, Fetch},
};

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("{0}")]
    Select(#[from] SelectError),
    #[error("selected video track has an empty timeline")]
    EmptyTimeline,
    #[error("could not download {kind} init segment: {status}")]
    InitSegment {
        kind: &'static str,
        status: FetchStatus,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("live error: {0}")]
    Live(#[from] LiveError),
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),
    #[error("import error: {0}")]
    Import(#[from] ImportError),
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

/// Everything fixed at setup time, as shown by the `info` action.
#[derive(Debug, Serialize)]
pub struct SessionInfo<'a> {
    pub manifest_url: &'a str,
    pub is_dynamic: bool,
    pub video: &'a Track,
    pub audio: &'a Track,
    pub last_id: i64,
    pub interval: i64,
    pub poll_interval: Duration,
    pub video_dir: &'a Path,
    pub audio_dir: &'a Path,
    pub config: &'a DownloaderConfig,
}

/// One recording: the selected tracks, the learned interval and the stores
/// both tracks are saved into.
pub struct Session {
    pub config: DownloaderConfig,
    pub client: ManifestClient,
    pub snapshot: ManifestSnapshot,
    pub manifest_text: String,
    pub video: SegmentStore,
    pub audio: SegmentStore,
    /// Id the backfill walk starts from.
    pub last_id: i64,
    pub interval: i64,
    pub poll_interval: Duration,
    storage: Arc<dyn Storage>,
}

impl Session {
    /// Fetch the manifest and pick tracks, start id and interval.
    pub async fn prepare(
        url: &str,
        fetcher: Arc<dyn Fetch>,
        storage: Arc<dyn Storage>,
        config: DownloaderConfig,
    ) -> Result<Self, WorkerError> {
        let client = ManifestClient::new(url, fetcher.clone())?;

        info!("Fetching manifest {}", url);
        let (snapshot, manifest_text) = client.fetch_with_text().await?;

        if let Some(start) = &snapshot.availability_start {
            info!("Availability start: {} ({})", start, util::format_relative(start));
        }
        if let Some(end) = &snapshot.availability_end {
            info!("Availability end: {} ({})", end, util::format_relative(end));
        }

        info!("Video representations:");
        for t in &snapshot.video_tracks {
            info!("  {}", t.describe());
        }
        let video = select::select_video(&snapshot.video_tracks, config.quality.as_deref())?;
        info!("Using video {}", video.describe());
        let audio = select::select_audio(&snapshot.audio_tracks)?;
        info!("Using audio {}", audio.describe());

        let newest = video.last_segment_id().ok_or(WorkerError::EmptyTimeline)?;
        let last_id = config.last_id.unwrap_or(newest);
        info!("Last video segment t={}, starting from {}", newest, last_id);

        let interval =
            interval::estimate(&video.segment_durations).ok_or(WorkerError::EmptyTimeline)?;
        info!(
            "Segment durations: {}",
            video
                .segment_durations
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        info!("Interval set to {}", interval);

        let poll_interval = snapshot.poll_interval(config.min_poll_interval);
        let video_store = SegmentStore::new(&config.save_dir, video, storage.clone(), fetcher.clone());
        let audio_store = SegmentStore::new(&config.save_dir, audio, storage.clone(), fetcher);
        for store in [&video_store, &audio_store] {
            store.remove_stale_temp().await?;
        }

        Ok(Self {
            client,
            manifest_text,
            video: video_store,
            audio: audio_store,
            last_id,
            interval,
            poll_interval,
            storage,
            snapshot,
            config,
        })
    }

    fn output(&self, name: &str) -> PathBuf {
        self.config.save_dir.join(name)
    }

    pub fn info(&self) -> SessionInfo<'_> {
        SessionInfo {
            manifest_url: self.client.url().as_str(),
            is_dynamic: self.snapshot.is_dynamic,
            video: self.video.track(),
            audio: self.audio.track(),
            last_id: self.last_id,
            interval: self.interval,
            poll_interval: self.poll_interval,
            video_dir: self.video.dir(),
            audio_dir: self.audio.dir(),
            config: &self.config,
        }
    }

    /// Keep the raw manifest next to the recording.
    pub async fn save_manifest(&self) -> Result<(), WorkerError> {
        let path = self.output("mpd.mpd");
        info!("Saving manifest to {}", path.display());
        self.storage.create_dir_all(&self.config.save_dir).await?;
        self.storage
            .write_atomic(&path, self.manifest_text.as_bytes())
            .await?;
        Ok(())
    }

    pub async fn download_init(&self) -> Result<(), WorkerError> {
        info!("Downloading init segments");
        for (kind, store) in [("video", &self.video), ("audio", &self.audio)] {
            let status = store.fetch_init().await?;
            if !status.is_available() {
                return Err(WorkerError::InitSegment { kind, status });
            }
            debug!("{} init segment: {}", kind, status);
        }
        Ok(())
    }

    pub async fn backfill(&self, token: &CancellationToken) -> Result<BackfillReport, WorkerError> {
        let mut walker = BackfillWalker::new(&self.video, self.interval, &self.config, token.clone());
        Ok(walker.run(self.last_id).await?)
    }

    pub async fn live(&self, token: &CancellationToken) -> Result<DownloadStatistics, WorkerError> {
        if !self.snapshot.is_dynamic {
            info!("Manifest is not dynamic, not following the live stream");
            return Ok(DownloadStatistics::new());
        }

        let mut follower = LiveTailFollower::new(
            &self.client,
            &self.video,
            &self.audio,
            &self.config,
            self.poll_interval,
            token.clone(),
        );
        Ok(follower.run().await?)
    }

    /// Fetch the audio segment for every video segment on disk.
    pub async fn download_audio(&self, token: &CancellationToken) -> Result<DownloadStatistics, WorkerError> {
        let keys: Vec<SegmentKey> = self
            .video
            .files()
            .await?
            .iter()
            .filter_map(|p| segment_key(p))
            .collect();

        let mut stats = DownloadStatistics::new();
        stats.segments_total = keys.len() as u64;
        info!("Downloading {} audio segments", keys.len());

        let audio = &self.audio;
        let mut downloads = stream::iter(keys)
            .map(|key| async move {
                match key {
                    SegmentKey::Init => audio.fetch_init().await,
                    SegmentKey::Id(id) => audio.fetch(id).await,
                }
            })
            .buffer_unordered(self.config.bulk_concurrency.max(1));

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    println!();
                    info!("Audio download interrupted");
                    break;
                }
                next = downloads.next() => match next {
                    None => break,
                    Some(Ok(status)) => stats.record(&status),
                    Some(Err(StoreError::Download(e))) => {
                        debug!("Audio segment failed: {}", e);
                        stats.record_failure();
                    }
                    Some(Err(e)) => return Err(e.into()),
                },
            }
            stats.print();
        }
        println!();

        info!("Audio finished: {}", stats.summary());
        Ok(stats)
    }

    pub async fn check(&self) -> Result<AuditReport, WorkerError> {
        info!("Checking for missing segments");
        let report = audit::audit_store(&self.video, self.interval, self.config.audit_tolerance).await?;
        report.log();
        Ok(report)
    }

    pub async fn merge(&self) -> Result<(), WorkerError> {
        for store in [&self.video, &self.audio] {
            store.remove_stale_temp().await?;
        }
        let video = self.video.files().await?;
        let audio = self.audio.files().await?;
        info!("Found {} video and {} audio segments", video.len(), audio.len());

        merge::merge(
            &self.config.ffmpeg,
            &video,
            &audio,
            &self.output("video.m4v"),
            &self.output("audio.m4a"),
            &self.output("merged.mp4"),
        )
        .await?;
        Ok(())
    }

    /// Sweep an explicit range, or the worst gap on disk when none is given.
    pub async fn manual(
        &self,
        range: Option<(i64, i64)>,
        token: &CancellationToken,
    ) -> Result<Option<(i64, FetchStatus)>, WorkerError> {
        let (start, end) = match range {
            Some((start, end)) => {
                info!("Sweeping {} to {} (inclusive)", start, end);
                (start, end)
            }
            None => {
                let report = self.check().await?;
                let Some(gap) = report.gap else {
                    info!("No gap found, nothing to do");
                    return Ok(None);
                };
                let (start, end) = gap.missing_range();
                info!("Sweeping largest gap {} to {} (inclusive)", start, end);
                (start, end)
            }
        };

        let hit = backfill::sweep_range(&self.video, start, end, self.config.search_concurrency, token).await;
        match hit {
            Some((id, status)) => info!("Segment {}: {}", id, status),
            None => info!("Nothing found between {} and {}", start, end),
        }
        Ok(hit)
    }

    pub async fn import(&self, root: &Path) -> Result<ImportReport, WorkerError> {
        let report = import::import_segments(root, &self.video, &self.audio).await?;
        info!("Imported {} segments, {} already present", report.copied, report.skipped);
        Ok(report)
    }

    /// Backfill then audio, alongside the live tail; then audit and merge.
    pub async fn run_all(&self, token: &CancellationToken) -> Result<Option<Gap>, WorkerError> {
        self.save_manifest().await?;
        self.download_init().await?;

        let history = async {
            self.backfill(token).await?;
            self.download_audio(token).await
        };
        try_join!(history, self.live(token))?;

        if token.is_cancelled() {
            return Ok(None);
        }

        let report = self.check().await?;
        self.merge().await?;
        Ok(report.gap)
    }
}
