use std::cmp::Ordering;

use crate::dash::{Track, TrackKind};

#[derive(thiserror::Error, Debug)]
pub enum SelectError {
    #[error("quality {hint:?} not found, available: {}", available.join(", "))]
    QualityNotFound {
        hint: String,
        available: Vec<String>,
    },
    #[error("manifest has no {0} representation")]
    NoTracks(TrackKind),
    #[error("only one audio representation is supported, manifest has {0}")]
    MultipleAudioTracks(usize),
}

/// `(width, height, frameRate, bandwidth)`, compared lexicographically.
fn cmp_video(a: &Track, b: &Track) -> Ordering {
    a.width
        .unwrap_or_default()
        .cmp(&b.width.unwrap_or_default())
        .then(a.height.unwrap_or_default().cmp(&b.height.unwrap_or_default()))
        .then(
            a.frame_rate
                .unwrap_or_default()
                .total_cmp(&b.frame_rate.unwrap_or_default()),
        )
        .then(a.bandwidth.total_cmp(&b.bandwidth))
}

/// `(bandwidth, samplingRate)`, compared lexicographically.
fn cmp_audio(a: &Track, b: &Track) -> Ordering {
    a.bandwidth.total_cmp(&b.bandwidth).then(
        a.sampling_rate
            .unwrap_or_default()
            .cmp(&b.sampling_rate.unwrap_or_default()),
    )
}

/// Best track by `cmp`; on ties the first one listed wins.
fn best<'a>(tracks: &'a [Track], cmp: fn(&Track, &Track) -> Ordering) -> Option<&'a Track> {
    tracks.iter().reduce(|best, t| {
        if cmp(t, best) == Ordering::Greater {
            t
        } else {
            best
        }
    })
}

fn matches_hint(track: &Track, hint: &str) -> bool {
    track.id == hint || track.id.contains(&format!("{}-v", hint))
}

/// Pick a video track. An empty hint or `"highest"` selects the best
/// quality; anything else must equal a track id or appear in one as
/// `"{hint}-v"`.
pub fn select_video<'a>(tracks: &'a [Track], hint: Option<&str>) -> Result<&'a Track, SelectError> {
    match hint.map(str::trim) {
        None | Some("") | Some("highest") => {
            best(tracks, cmp_video).ok_or(SelectError::NoTracks(TrackKind::Video))
        }
        Some(hint) => tracks
            .iter()
            .find(|t| matches_hint(t, hint))
            .ok_or_else(|| SelectError::QualityNotFound {
                hint: hint.to_string(),
                available: tracks.iter().map(|t| t.id.clone()).collect(),
            }),
    }
}

/// Pick the audio track. Live manifests so far carry exactly one; anything
/// else is refused rather than guessed.
pub fn select_audio(tracks: &[Track]) -> Result<&Track, SelectError> {
    match tracks.len() {
        0 => Err(SelectError::NoTracks(TrackKind::Audio)),
        1 => best(tracks, cmp_audio).ok_or(SelectError::NoTracks(TrackKind::Audio)),
        n => Err(SelectError::MultipleAudioTracks(n)),
    }
}

/// Select from a track list of one kind. The hint only applies to video.
pub fn select<'a>(tracks: &'a [Track], hint: Option<&str>) -> Result<&'a Track, SelectError> {
    match tracks.first().map(|t| t.kind) {
        Some(TrackKind::Audio) => select_audio(tracks),
        _ => select_video(tracks, hint),
    }
}
