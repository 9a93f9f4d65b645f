//! Import segments saved by N_m3u8DL-RE into the canonical layout.
//!
//! Its output directory holds one sub-directory per track, each with an
//! `_init.mp4` and one file per segment named by segment id.

use std::path::{Path, PathBuf};

use crate::store::{SegmentStore, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    #[error("{target} already exists with {existing} bytes, {source_path} has {incoming}")]
    SizeMismatch {
        source_path: PathBuf,
        target: PathBuf,
        existing: u64,
        incoming: u64,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub copied: usize,
    pub skipped: usize,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ImportError + '_ {
    move |source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn numeric_stem(path: &Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

async fn import_track(dir: &Path, store: &SegmentStore) -> Result<ImportReport, ImportError> {
    let storage = store.storage();
    let mut report = ImportReport::default();

    storage
        .create_dir_all(store.dir())
        .await
        .map_err(io_err(store.dir()))?;

    for file in storage.list(dir).await.map_err(io_err(dir))? {
        let Some(id) = numeric_stem(&file) else {
            continue;
        };
        let target = store.path_for(id);
        let incoming = storage
            .size(&file)
            .await
            .map_err(io_err(&file))?
            .unwrap_or(0);

        match storage.size(&target).await.map_err(io_err(&target))? {
            Some(existing) if existing == incoming => {
                debug!("{}: {} already exists, skipping", id, target.display());
                report.skipped += 1;
            }
            Some(existing) => {
                return Err(ImportError::SizeMismatch {
                    source_path: file,
                    target,
                    existing,
                    incoming,
                })
            }
            None => {
                info!("{}: copying {} to {}", id, file.display(), target.display());
                storage
                    .copy(&file, &target)
                    .await
                    .map_err(io_err(&target))?;
                report.copied += 1;
            }
        }
    }

    Ok(report)
}

/// Import every track directory under `root`. Directories whose name
/// contains `avc` are video, the rest audio.
pub async fn import_segments(
    root: &Path,
    video: &SegmentStore,
    audio: &SegmentStore,
) -> Result<ImportReport, ImportError> {
    let storage = video.storage();
    let mut total = ImportReport::default();

    for dir in storage.list_dirs(root).await.map_err(io_err(root))? {
        if !storage
            .exists_nonempty(&dir.join("_init.mp4"))
            .await
            .map_err(io_err(&dir))?
        {
            continue;
        }

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let store = if name.contains("avc") { video } else { audio };
        info!("Importing {} as {}", dir.display(), store.track().kind);

        let report = import_track(&dir, store).await?;
        total.copied += report.copied;
        total.skipped += report.skipped;
    }

    Ok(total)
}
