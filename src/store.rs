//! File-system backed segment sink.
//!
//! There is no download log: a non-empty file at a segment's canonical path
//! means the segment is downloaded. Writes go to a unique temporary file that
//! is renamed into place, so an interrupted download never leaves partial
//! bytes under the final name and two writers racing on the same id both
//! end up with a complete file.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_stream::wrappers::ReadDirStream;

use crate::{
    dash::Track,
    util::{DownloadError, Fetch, Fetched},
};

/// Suffix of in-flight temporary files.
pub const TEMP_SUFFIX: &str = ".part";

#[async_trait]
pub trait Storage: Send + Sync {
    /// Size of the file at `path`, `None` if there is no such file.
    async fn size(&self, path: &Path) -> io::Result<Option<u64>>;
    /// Write `data` to `path` via a temporary file and a rename.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    /// Files (not directories) directly inside `dir`.
    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
    /// Sub-directories directly inside `dir`.
    async fn list_dirs(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
    async fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;
    async fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
    /// Remove a file. Removing a missing file is not an error.
    async fn remove(&self, path: &Path) -> io::Result<()>;

    async fn exists_nonempty(&self, path: &Path) -> io::Result<bool> {
        Ok(self.size(path).await?.unwrap_or(0) > 0)
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path(path: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}-{}{}", std::process::id(), n, TEMP_SUFFIX));
    PathBuf::from(name)
}

fn is_temp(path: &Path) -> bool {
    path.to_string_lossy().ends_with(TEMP_SUFFIX)
}

/// The real file system.
#[derive(Debug, Default, Clone)]
pub struct LocalStorage;

async fn entries(dir: &Path) -> io::Result<Vec<tokio::fs::DirEntry>> {
    ReadDirStream::new(tokio::fs::read_dir(dir).await?)
        .try_collect()
        .await
}

#[async_trait]
impl Storage for LocalStorage {
    async fn size(&self, path: &Path) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => Ok(Some(m.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let temp = temp_path(path);
        let result = async {
            let mut file = File::create(&temp).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, path).await
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        result
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in entries(dir).await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn list_dirs(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in entries(dir).await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let temp = temp_path(to);
        let result = async {
            let copied = tokio::fs::copy(from, &temp).await?;
            tokio::fs::rename(&temp, to).await?;
            Ok::<u64, io::Error>(copied)
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        result
    }

    async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(dir).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// In-memory file system. Directories exist implicitly.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.lock().insert(path.into(), data.into());
    }

    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>> {
        // A panic while holding the lock can't leave the map half-updated.
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn size(&self, path: &Path) -> io::Result<Option<u64>> {
        Ok(self.lock().get(path).map(|d| d.len() as u64))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.insert(path, data);
        Ok(())
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .lock()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }

    async fn list_dirs(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut dirs: Vec<PathBuf> = self
            .lock()
            .keys()
            .filter_map(|p| {
                let rest = p.strip_prefix(dir).ok()?;
                let mut components = rest.components();
                let first = components.next()?;
                components.next().map(|_| dir.join(first))
            })
            .collect();
        dirs.dedup();
        Ok(dirs)
    }

    async fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let data = self
            .get(from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, from.display().to_string()))?;
        let len = data.len() as u64;
        self.insert(to, data);
        Ok(len)
    }

    async fn create_dir_all(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.lock().remove(path);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// What happened to one segment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Stored(u64),
    AlreadyExists,
    Http(u16),
}

impl FetchStatus {
    /// The segment is on disk after this call.
    pub fn is_available(&self) -> bool {
        matches!(self, FetchStatus::Stored(_) | FetchStatus::AlreadyExists)
    }
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStatus::Stored(_) => f.write_str("HTTP 200"),
            FetchStatus::AlreadyExists => f.write_str("exists"),
            FetchStatus::Http(code) => write!(f, "HTTP {}", code),
        }
    }
}

/// Segments of one track, stored under `{root}/{track id}/`.
#[derive(Clone)]
pub struct SegmentStore {
    dir: PathBuf,
    track: Track,
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn Fetch>,
}

impl SegmentStore {
    pub fn new(root: &Path, track: &Track, storage: Arc<dyn Storage>, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            dir: root.join(&track.id),
            track: track.clone(),
            storage,
            fetcher,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Canonical path of segment `id`.
    pub fn path_for(&self, id: i64) -> PathBuf {
        self.dir.join(self.track.segment_filename(id))
    }

    pub fn init_path(&self) -> PathBuf {
        self.dir.join(self.track.init_filename())
    }

    fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub async fn has(&self, id: i64) -> Result<bool, StoreError> {
        let path = self.path_for(id);
        self.storage
            .exists_nonempty(&path)
            .await
            .map_err(Self::io_err(&path))
    }

    /// Store `data` as segment `id` unless it is already there.
    pub async fn put(&self, id: i64, data: &[u8]) -> Result<FetchStatus, StoreError> {
        let path = self.path_for(id);
        self.put_at(&path, data).await
    }

    async fn put_at(&self, path: &Path, data: &[u8]) -> Result<FetchStatus, StoreError> {
        if self
            .storage
            .exists_nonempty(path)
            .await
            .map_err(Self::io_err(path))?
        {
            return Ok(FetchStatus::AlreadyExists);
        }

        self.storage
            .create_dir_all(&self.dir)
            .await
            .map_err(Self::io_err(&self.dir))?;
        self.storage
            .write_atomic(path, data)
            .await
            .map_err(Self::io_err(path))?;

        Ok(FetchStatus::Stored(data.len() as u64))
    }

    async fn download_to(&self, url: &str, path: &Path) -> Result<FetchStatus, StoreError> {
        if self
            .storage
            .exists_nonempty(path)
            .await
            .map_err(Self::io_err(path))?
        {
            return Ok(FetchStatus::AlreadyExists);
        }

        match self.fetcher.fetch(url).await? {
            Fetched::Status(code) => Ok(FetchStatus::Http(code)),
            Fetched::Body(body) => self.put_at(path, &body).await,
        }
    }

    /// Download segment `id` unless it is already on disk.
    pub async fn fetch(&self, id: i64) -> Result<FetchStatus, StoreError> {
        let path = self.path_for(id);
        self.download_to(&self.track.segment_url(id), &path).await
    }

    pub async fn fetch_init(&self) -> Result<FetchStatus, StoreError> {
        let path = self.init_path();
        self.download_to(&self.track.init_url, &path).await
    }

    async fn list_all(&self) -> Result<Vec<PathBuf>, StoreError> {
        match self.storage.list(&self.dir).await {
            Ok(files) => Ok(files),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Self::io_err(&self.dir)(e)),
        }
    }

    /// Every stored file of this track, temporary files excluded.
    pub async fn files(&self) -> Result<Vec<PathBuf>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|p| !is_temp(p))
            .collect())
    }

    /// Delete temporary files left by interrupted or abandoned downloads.
    /// Only call this while nothing is writing to the track.
    pub async fn remove_stale_temp(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for path in self.list_all().await?.into_iter().filter(|p| is_temp(p)) {
            self.storage
                .remove(&path)
                .await
                .map_err(Self::io_err(&path))?;
            removed += 1;
        }
        if removed > 0 {
            debug!("Removed {} stale temporary files from {}", removed, self.dir.display());
        }
        Ok(removed)
    }
}
