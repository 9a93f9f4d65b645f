use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use tokio::{fs::File, io::AsyncWriteExt};

use crate::{ffmpeg, store::TEMP_SUFFIX};

#[derive(thiserror::Error, Debug)]
pub enum MergeError {
    #[error("no {0} segments to merge")]
    NoSegments(&'static str),
    #[error("{0} has no init segment")]
    NoInit(&'static str),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("remux failed: {0}")]
    Remux(#[from] ffmpeg::FfmpegError),
}

/// Sort key of a stored segment file: the init segment precedes every
/// numbered segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentKey {
    Init,
    Id(i64),
}

/// Key for a segment file name such as `1798_0-init.m4v` or
/// `1798_0-1297029.m4v`. `None` for temporary and unrelated files.
pub fn segment_key(path: &Path) -> Option<SegmentKey> {
    static TRAILING_ID: OnceLock<Regex> = OnceLock::new();
    let trailing_id = TRAILING_ID.get_or_init(|| Regex::new(r"(\d+)$").expect("static regex"));

    let name = path.file_name()?.to_str()?;
    if name.ends_with(TEMP_SUFFIX) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.ends_with("init") {
        return Some(SegmentKey::Init);
    }

    trailing_id
        .captures(stem)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
        .map(SegmentKey::Id)
}

/// Segment files in concatenation order, files that aren't segments
/// dropped.
pub fn merge_order(files: &[PathBuf]) -> Vec<PathBuf> {
    let mut keyed: Vec<(SegmentKey, &PathBuf)> = files
        .iter()
        .filter_map(|f| segment_key(f).map(|k| (k, f)))
        .collect();
    keyed.sort_by_key(|(k, _)| *k);
    keyed.into_iter().map(|(_, f)| f.clone()).collect()
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> MergeError + '_ {
    move |source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Append `files` byte for byte into `output`. The output only appears
/// under its final name once every file has been copied.
pub async fn concat(files: &[PathBuf], output: &Path) -> Result<u64, MergeError> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_err(parent))?;
    }

    let mut temp = output.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = PathBuf::from(temp);

    let result = async {
        let mut out = File::create(&temp).await.map_err(io_err(&temp))?;
        let mut total = 0;
        for f in files {
            debug!("Appending {}", f.display());
            let mut input = File::open(f).await.map_err(io_err(f))?;
            total += tokio::io::copy(&mut input, &mut out)
                .await
                .map_err(io_err(f))?;
        }
        out.flush().await.map_err(io_err(&temp))?;
        drop(out);
        tokio::fs::rename(&temp, output)
            .await
            .map_err(io_err(output))?;
        Ok::<u64, MergeError>(total)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

/// Concatenate one track's segments in merge order. `kind` names the
/// track in errors.
pub async fn concat_track(
    kind: &'static str,
    files: &[PathBuf],
    output: &Path,
) -> Result<u64, MergeError> {
    let ordered = merge_order(files);
    match ordered.first().and_then(|f| segment_key(f)) {
        None => return Err(MergeError::NoSegments(kind)),
        Some(SegmentKey::Id(_)) => return Err(MergeError::NoInit(kind)),
        Some(SegmentKey::Init) => (),
    }

    info!("Merging {} {} segments into {}", ordered.len(), kind, output.display());
    concat(&ordered, output).await
}

/// Concatenate both tracks, then remux them into `output` with `ffmpeg`
/// without re-encoding.
pub async fn merge(
    ffmpeg: &Path,
    video_segments: &[PathBuf],
    audio_segments: &[PathBuf],
    video_out: &Path,
    audio_out: &Path,
    output: &Path,
) -> Result<(), MergeError> {
    concat_track("video", video_segments, video_out).await?;
    concat_track("audio", audio_segments, audio_out).await?;

    info!("Remuxing video and audio into {}", output.display());
    ffmpeg::remux(ffmpeg, video_out, audio_out, output).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys() {
        assert_eq!(
            segment_key(Path::new("/v/17981336783244063_0-init.m4v")),
            Some(SegmentKey::Init)
        );
        assert_eq!(
            segment_key(Path::new("/v/17981336783244063_0-1297029.m4v")),
            Some(SegmentKey::Id(1297029))
        );
        assert_eq!(segment_key(Path::new("/v/431.m4s")), Some(SegmentKey::Id(431)));
        assert_eq!(segment_key(Path::new("/v/1798_0-100.m4v.12-0.part")), None);
        assert_eq!(segment_key(Path::new("/v/notes.txt")), None);
        assert!(SegmentKey::Init < SegmentKey::Id(i64::MIN));
    }

    #[test]
    fn init_first_then_ascending() {
        let files: Vec<PathBuf> = [
            "/v/1798_0-500.m4v",
            "/v/1798_0-init.m4v",
            "/v/1798_0-100.m4v",
            "/v/1798_0-99.m4v",
            "/v/notes.txt",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();

        assert_eq!(
            merge_order(&files),
            vec![
                PathBuf::from("/v/1798_0-init.m4v"),
                PathBuf::from("/v/1798_0-99.m4v"),
                PathBuf::from("/v/1798_0-100.m4v"),
                PathBuf::from("/v/1798_0-500.m4v"),
            ]
        );
    }

    #[tokio::test]
    async fn concat_appends_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("a_0-200.m4v"), b"CC").unwrap();
        std::fs::write(dir.join("a_0-init.m4v"), b"AA").unwrap();
        std::fs::write(dir.join("a_0-100.m4v"), b"BB").unwrap();

        let files = vec![
            dir.join("a_0-200.m4v"),
            dir.join("a_0-init.m4v"),
            dir.join("a_0-100.m4v"),
        ];
        let out = dir.join("out").join("video.m4v");
        let written = concat_track("video", &files, &out).await.unwrap();

        assert_eq!(written, 6);
        assert_eq!(std::fs::read(&out).unwrap(), b"AABBCC");
        assert_eq!(std::fs::read_dir(dir.join("out")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn remux_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        for (name, data) in [("v_0-init.m4v", "I"), ("v_0-1.m4v", "V"), ("a_0-init.m4a", "i"), ("a_0-1.m4a", "A")] {
            std::fs::write(dir.join(name), data).unwrap();
        }
        let video = vec![dir.join("v_0-1.m4v"), dir.join("v_0-init.m4v")];
        let audio = vec![dir.join("a_0-init.m4a"), dir.join("a_0-1.m4a")];
        let out = dir.join("out");

        let result = merge(
            Path::new("false"),
            &video,
            &audio,
            &out.join("video.m4v"),
            &out.join("audio.m4a"),
            &out.join("merged.mp4"),
        )
        .await;

        assert!(matches!(result, Err(MergeError::Remux(ffmpeg::FfmpegError::Failed(_)))));
        assert_eq!(std::fs::read(out.join("video.m4v")).unwrap(), b"IV");
        assert!(!out.join("merged.mp4").exists());
        assert!(!out.join("merged.mp4.part").exists());
    }

    #[tokio::test]
    async fn concat_requires_init() {
        let files = vec![PathBuf::from("/v/a_0-100.m4v")];
        let out = std::env::temp_dir().join("never-written.m4v");
        assert!(matches!(
            concat_track("video", &files, &out).await,
            Err(MergeError::NoInit("video"))
        ));
        assert!(matches!(
            concat_track("audio", &[], &out).await,
            Err(MergeError::NoSegments("audio"))
        ));
    }
}
