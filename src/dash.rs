use std::{str::FromStr, sync::Arc, sync::OnceLock, time::Duration};

use chrono::{DateTime, FixedOffset};
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use regex::Regex;
use serde::Serialize;
use url::Url;

use crate::util::{self, DownloadError, Fetch, Fetched};

/// Token in a media template that is replaced with the segment id.
pub const TIME_TOKEN: &str = "$Time$";
const REPRESENTATION_TOKEN: &str = "$RepresentationID$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => f.write_str("video"),
            TrackKind::Audio => f.write_str("audio"),
        }
    }
}

/// Immutable result of one manifest fetch.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestSnapshot {
    pub is_dynamic: bool,
    pub availability_start: Option<DateTime<FixedOffset>>,
    pub availability_end: Option<DateTime<FixedOffset>>,
    pub minimum_update_period: Option<Duration>,
    pub time_shift_buffer_depth: Option<Duration>,
    pub video_tracks: Vec<Track>,
    pub audio_tracks: Vec<Track>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: String,
    /// Position within the adaptation set, used to find the track again in
    /// later snapshots.
    pub index: usize,
    pub kind: TrackKind,
    pub bandwidth: f64,

    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub sampling_rate: Option<u32>,

    pub timescale: Option<u64>,
    pub init_url: String,
    pub media_url_template: String,

    #[serde(skip)]
    pub segment_ids: Vec<i64>,
    #[serde(skip)]
    pub segment_durations: Vec<i64>,
}

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("could not download manifest: {0}")]
    Fetch(#[from] DownloadError),
    #[error("manifest request returned HTTP {0}")]
    Status(u16),
    #[error("invalid manifest url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("could not parse manifest: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("manifest is missing <{0}>")]
    MissingNode(&'static str),
    #[error("<{node}> is missing attribute {attr}")]
    MissingAttribute { node: &'static str, attr: &'static str },
    #[error("<{node}> has invalid {attr}={value:?}")]
    InvalidAttribute {
        node: &'static str,
        attr: &'static str,
        value: String,
    },
    #[error("track at index {index} is {found:?}, expected {expected:?}")]
    TrackMismatch {
        index: usize,
        expected: String,
        found: Option<String>,
    },
}

impl ManifestError {
    /// Transport failures may go away on retry, a malformed manifest won't.
    pub fn is_transient(&self) -> bool {
        matches!(self, ManifestError::Fetch(_) | ManifestError::Status(_))
    }
}

/// Parse an ISO-8601 duration (`P[n]DT[n]H[n]M[n(.f)]S`) into whole seconds.
/// Fractional seconds are truncated.
pub fn parse_iso8601_duration(duration: &str) -> Option<u64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:([.\d]+)S)?)?$")
            .expect("static regex")
    });

    let caps = pattern.captures(duration.trim())?;
    let int = |i: usize| -> Option<u64> {
        caps.get(i)
            .map(|m| m.as_str().parse().ok())
            .unwrap_or(Some(0))
    };
    let seconds = match caps.get(4) {
        Some(m) => m.as_str().parse::<f64>().ok()?.trunc() as u64,
        None => 0,
    };

    int(1)?
        .checked_mul(86400)?
        .checked_add(int(2)?.checked_mul(3600)?)?
        .checked_add(int(3)?.checked_mul(60)?)?
        .checked_add(seconds)
}

fn parse_frame_rate(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let (num, den): (f64, f64) = (num.parse().ok()?, den.parse().ok()?);
            (den != 0.0).then(|| num / den)
        }
        None => value.parse().ok(),
    }
}

fn get_attr<T>(e: &BytesStart, attr: &str) -> Option<T>
where
    T: FromStr,
{
    e.try_get_attribute(attr)
        .ok()?
        .and_then(|a| a.unescape_value().ok()?.parse().ok())
}

fn get_string(e: &BytesStart, attr: &str) -> Option<String> {
    get_attr::<String>(e, attr)
}

fn require_string(
    e: &BytesStart,
    node: &'static str,
    attr: &'static str,
) -> Result<String, ManifestError> {
    get_string(e, attr).ok_or(ManifestError::MissingAttribute { node, attr })
}

/// Like `get_attr` but an attribute that is present and unparsable is an
/// error instead of being silently ignored.
fn parse_attr<T>(e: &BytesStart, node: &'static str, attr: &'static str) -> Result<Option<T>, ManifestError>
where
    T: FromStr,
{
    match get_string(e, attr) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ManifestError::InvalidAttribute { node, attr, value }),
    }
}

fn parse_timestamp(
    e: &BytesStart,
    attr: &'static str,
) -> Result<Option<DateTime<FixedOffset>>, ManifestError> {
    match get_string(e, attr) {
        None => Ok(None),
        Some(value) => DateTime::parse_from_rfc3339(&value)
            .map(Some)
            .map_err(|_| ManifestError::InvalidAttribute {
                node: "MPD",
                attr,
                value,
            }),
    }
}

fn parse_duration(e: &BytesStart, attr: &'static str) -> Result<Option<Duration>, ManifestError> {
    match get_string(e, attr) {
        None => Ok(None),
        Some(value) => parse_iso8601_duration(&value)
            .map(|s| Some(Duration::from_secs(s)))
            .ok_or(ManifestError::InvalidAttribute {
                node: "MPD",
                attr,
                value,
            }),
    }
}

impl ManifestSnapshot {
    fn from_root(e: &BytesStart) -> Result<Self, ManifestError> {
        Ok(Self {
            is_dynamic: get_string(e, "type").as_deref() == Some("dynamic"),
            availability_start: parse_timestamp(e, "availabilityStartTime")?,
            availability_end: parse_timestamp(e, "availabilityEndTime")?,
            minimum_update_period: parse_duration(e, "minimumUpdatePeriod")?,
            time_shift_buffer_depth: parse_duration(e, "timeShiftBufferDepth")?,
            video_tracks: Vec::new(),
            audio_tracks: Vec::new(),
        })
    }

    /// How often the live manifest should be polled: the minimum update
    /// period if set, otherwise half the time shift buffer minus a second,
    /// never below `floor`.
    pub fn poll_interval(&self, floor: Duration) -> Duration {
        let secs = match self.minimum_update_period.map(|d| d.as_secs()) {
            Some(mup) if mup > 0 => mup,
            _ => self
                .time_shift_buffer_depth
                .map(|d| (d.as_secs() / 2).saturating_sub(1))
                .unwrap_or(0),
        };

        Duration::from_secs(secs).max(floor)
    }

    /// Re-locate a previously selected video track. The index is only a
    /// hint; a track with a different id at that position means the manifest
    /// was reordered and continuing would file segments under the wrong
    /// track.
    pub fn relocate_video(&self, index: usize, id: &str) -> Result<&Track, ManifestError> {
        let track = self.video_tracks.get(index);
        match track {
            Some(t) if t.id == id => Ok(t),
            _ => Err(ManifestError::TrackMismatch {
                index,
                expected: id.to_string(),
                found: track.map(|t| t.id.clone()),
            }),
        }
    }
}

impl Track {
    fn from_start_event(
        e: &BytesStart,
        reader: &mut Reader<&[u8]>,
        kind: TrackKind,
        index: usize,
        base: &Url,
    ) -> Result<Self, ManifestError> {
        let id = require_string(e, "Representation", "id")?;
        let frame_rate = match get_string(e, "frameRate") {
            None => None,
            Some(value) => Some(parse_frame_rate(&value).ok_or(
                ManifestError::InvalidAttribute {
                    node: "Representation",
                    attr: "frameRate",
                    value,
                },
            )?),
        };

        let mut track = Self {
            bandwidth: parse_attr(e, "Representation", "bandwidth")?.unwrap_or(0.0),
            width: parse_attr(e, "Representation", "width")?,
            height: parse_attr(e, "Representation", "height")?,
            frame_rate,
            sampling_rate: parse_attr(e, "Representation", "audioSamplingRate")?,
            timescale: None,
            init_url: String::default(),
            media_url_template: String::default(),
            segment_ids: Vec::new(),
            segment_durations: Vec::new(),
            id,
            index,
            kind,
        };

        let mut has_template = false;
        let mut next_t: i64 = 0;
        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                    b"SegmentTemplate" => {
                        has_template = true;
                        track.timescale = parse_attr(&e, "SegmentTemplate", "timescale")?;
                        track.init_url = track.resolve(
                            base,
                            &require_string(&e, "SegmentTemplate", "initialization")?,
                        )?;
                        track.media_url_template = track
                            .resolve(base, &require_string(&e, "SegmentTemplate", "media")?)?;
                    }
                    b"S" => {
                        let d: i64 = parse_attr(&e, "S", "d")?
                            .ok_or(ManifestError::MissingAttribute { node: "S", attr: "d" })?;
                        if d <= 0 {
                            return Err(ManifestError::InvalidAttribute {
                                node: "S",
                                attr: "d",
                                value: d.to_string(),
                            });
                        }
                        let r: i64 = parse_attr(&e, "S", "r")?.unwrap_or(0);
                        let mut t: i64 = parse_attr(&e, "S", "t")?.unwrap_or(next_t);
                        for _ in 0..=r.max(0) {
                            track.segment_ids.push(t);
                            track.segment_durations.push(d);
                            t += d;
                        }
                        next_t = t;
                    }
                    _ => (),
                },
                Event::End(e) => {
                    if e.local_name().as_ref() == b"Representation" {
                        break;
                    }
                }
                Event::Eof => return Err(ManifestError::MissingNode("/Representation")),
                _ => (),
            }
        }

        if !has_template {
            return Err(ManifestError::MissingNode("SegmentTemplate"));
        }
        if track.segment_ids.is_empty() {
            return Err(ManifestError::MissingNode("SegmentTimeline"));
        }

        Ok(track)
    }

    fn resolve(&self, base: &Url, template: &str) -> Result<String, ManifestError> {
        let template = template.replace(REPRESENTATION_TOKEN, &self.id);
        base.join(&template)
            .map(|u| u.to_string())
            .map_err(|source| ManifestError::InvalidUrl {
                url: template,
                source,
            })
    }

    /// URL of segment `id`.
    pub fn segment_url(&self, id: i64) -> String {
        self.media_url_template.replace(TIME_TOKEN, &id.to_string())
    }

    /// File name segment `id` is stored under. Pure function of the media
    /// template, so the same id always maps to the same file.
    pub fn segment_filename(&self, id: i64) -> String {
        util::web_name(&self.segment_url(id))
    }

    pub fn init_filename(&self) -> String {
        util::web_name(&self.init_url)
    }

    /// Last (newest) segment id in this track's timeline.
    pub fn last_segment_id(&self) -> Option<i64> {
        self.segment_ids.last().copied()
    }

    pub fn describe(&self) -> String {
        match self.kind {
            TrackKind::Video => format!(
                "[{}] {} {}x{}, {}fps, {:.1} kbps",
                self.index,
                self.id,
                self.width.unwrap_or_default(),
                self.height.unwrap_or_default(),
                self.frame_rate.unwrap_or_default(),
                self.bandwidth / 1024.0
            ),
            TrackKind::Audio => format!(
                "[{}] {} {}Hz, {:.1} kbps",
                self.index,
                self.id,
                self.sampling_rate.unwrap_or_default(),
                self.bandwidth / 1024.0
            ),
        }
    }
}

fn parse_adaptation_set(
    reader: &mut Reader<&[u8]>,
    kind: TrackKind,
    base: &Url,
) -> Result<Vec<Track>, ManifestError> {
    let mut tracks = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"Representation" {
                    let index = tracks.len();
                    tracks.push(Track::from_start_event(&e, reader, kind, index, base)?);
                }
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"Representation" {
                    return Err(ManifestError::MissingNode("SegmentTemplate"));
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"AdaptationSet" {
                    break;
                }
            }
            Event::Eof => return Err(ManifestError::MissingNode("/AdaptationSet")),
            _ => (),
        }
    }

    Ok(tracks)
}

/// Parse a manifest. Only the first period is read: its first adaptation
/// set holds the video representations, the second the audio ones.
/// Relative segment URLs are resolved against `base`.
pub fn parse_manifest(manifest: &str, base: &Url) -> Result<ManifestSnapshot, ManifestError> {
    let mut reader = Reader::from_str(manifest);
    reader.trim_text(true);

    let mut snapshot: Option<ManifestSnapshot> = None;
    let mut periods = 0;
    let mut adaptation_sets = 0;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => match e.local_name().as_ref() {
                b"MPD" => snapshot = Some(ManifestSnapshot::from_root(&e)?),
                b"Period" => periods += 1,
                b"AdaptationSet" if periods == 1 && adaptation_sets < 2 => {
                    let m = snapshot.as_mut().ok_or(ManifestError::MissingNode("MPD"))?;
                    if adaptation_sets == 0 {
                        m.video_tracks = parse_adaptation_set(&mut reader, TrackKind::Video, base)?;
                    } else {
                        m.audio_tracks = parse_adaptation_set(&mut reader, TrackKind::Audio, base)?;
                    }
                    adaptation_sets += 1;
                }
                _ => (),
            },
            _ => (),
        }
    }

    let snapshot = snapshot.ok_or(ManifestError::MissingNode("MPD"))?;
    if periods == 0 {
        return Err(ManifestError::MissingNode("Period"));
    }
    if snapshot.video_tracks.is_empty() {
        return Err(ManifestError::MissingNode("AdaptationSet (video)"));
    }
    if snapshot.audio_tracks.is_empty() {
        return Err(ManifestError::MissingNode("AdaptationSet (audio)"));
    }

    Ok(snapshot)
}

/// Fetches and parses the live manifest. Stateless per call and does not
/// retry; retrying is up to the caller.
#[derive(Clone)]
pub struct ManifestClient {
    url: Url,
    fetcher: Arc<dyn Fetch>,
}

impl ManifestClient {
    pub fn new(url: &str, fetcher: Arc<dyn Fetch>) -> Result<Self, ManifestError> {
        let parsed = Url::parse(url).map_err(|source| ManifestError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        Ok(Self {
            url: parsed,
            fetcher,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn fetch_text(&self) -> Result<String, ManifestError> {
        match self.fetcher.fetch(self.url.as_str()).await? {
            Fetched::Body(body) => Ok(String::from_utf8_lossy(&body).into_owned()),
            Fetched::Status(code) => Err(ManifestError::Status(code)),
        }
    }

    pub async fn fetch(&self) -> Result<ManifestSnapshot, ManifestError> {
        self.fetch_with_text().await.map(|(snapshot, _)| snapshot)
    }

    /// Fetch the manifest and keep its raw text next to the parsed snapshot.
    pub async fn fetch_with_text(&self) -> Result<(ManifestSnapshot, String), ManifestError> {
        let text = self.fetch_text().await?;
        let snapshot = parse_manifest(&text, &self.url)?;
        Ok((snapshot, text))
    }
}
