//! Core types for Duet

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which elementary stream a controller, buffer or event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

/// Container family, which decides how the index range is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexFormat {
    /// ISO-BMFF `sidx` box
    Sidx,
    /// WebM/Matroska `Cues` element
    Cues,
}

/// Inclusive byte range, as carried by the `Range` request header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusiveRange {
    pub start: u64,
    pub end: u64,
}

impl InclusiveRange {
    /// Marker for "through the end of the resource"
    pub const OPEN_END: u64 = u64::MAX;

    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn is_open_ended(&self) -> bool {
        self.end == Self::OPEN_END
    }

    /// Number of bytes covered, if the end is known
    pub fn len(&self) -> Option<u64> {
        if self.is_open_ended() || self.end < self.start {
            None
        } else {
            Some(self.end - self.start + 1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// True when `next` begins on the byte right after this range
    pub fn is_adjacent_to(&self, next: &InclusiveRange) -> bool {
        !self.is_open_ended() && self.end + 1 == next.start
    }

    pub fn to_http_range(&self) -> String {
        if self.is_open_ended() {
            format!("bytes={}-", self.start)
        } else {
            format!("bytes={}-{}", self.start, self.end)
        }
    }
}

impl std::fmt::Display for InclusiveRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_open_ended() {
            write!(f, "{}-", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Half-open span of playback time in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// True if `[start, end]` lies entirely inside this range
    pub fn covers(&self, start: f64, end: f64) -> bool {
        self.start <= start && end <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One elementary stream as described by the page data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSource {
    /// Resource holding the whole encoded stream
    pub url: Url,
    /// MIME type with codecs, e.g. `video/webm; codecs="vp9"`
    pub mime_codec: String,
    /// Initialization segment bytes
    pub init_range: InclusiveRange,
    /// Segment index bytes (`sidx` box or `Cues` element)
    pub index_range: InclusiveRange,
    /// Content length of the resource, when advertised
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
}

impl StreamSource {
    /// Audio iff an audio codec is named
    pub fn kind(&self) -> StreamKind {
        match self.acodec.as_deref() {
            Some(codec) if !codec.is_empty() && codec != "none" => StreamKind::Audio,
            _ => StreamKind::Video,
        }
    }

    /// Index format implied by the container in the MIME type
    pub fn index_format(&self) -> Option<IndexFormat> {
        let container = self
            .mime_codec
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if container.ends_with("/mp4") {
            Some(IndexFormat::Sidx)
        } else if container.ends_with("/webm") {
            Some(IndexFormat::Cues)
        } else {
            None
        }
    }
}

/// A video source and an audio source played together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePair {
    pub video: StreamSource,
    pub audio: StreamSource,
    /// Label shown by a quality selector, e.g. `1080p60 vp9`
    #[serde(default)]
    pub quality_string: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(mime: &str, acodec: Option<&str>) -> StreamSource {
        StreamSource {
            url: Url::parse("https://media.example.com/videoplayback").unwrap(),
            mime_codec: mime.to_string(),
            init_range: InclusiveRange::new(0, 219),
            index_range: InclusiveRange::new(220, 1199),
            file_size: Some(1_000_000),
            acodec: acodec.map(str::to_string),
            vcodec: None,
        }
    }

    #[test]
    fn test_http_range() {
        assert_eq!(InclusiveRange::new(10, 19).to_http_range(), "bytes=10-19");
        assert_eq!(
            InclusiveRange::new(10, InclusiveRange::OPEN_END).to_http_range(),
            "bytes=10-"
        );
        assert_eq!(InclusiveRange::new(10, 19).len(), Some(10));
    }

    #[test]
    fn test_adjacency() {
        let init = InclusiveRange::new(0, 219);
        assert!(init.is_adjacent_to(&InclusiveRange::new(220, 1199)));
        assert!(!init.is_adjacent_to(&InclusiveRange::new(221, 1199)));
    }

    #[test]
    fn test_stream_kind_and_format() {
        let video = source("video/mp4; codecs=\"avc1.640028\"", Some("none"));
        assert_eq!(video.kind(), StreamKind::Video);
        assert_eq!(video.index_format(), Some(IndexFormat::Sidx));

        let audio = source("audio/webm; codecs=\"opus\"", Some("opus"));
        assert_eq!(audio.kind(), StreamKind::Audio);
        assert_eq!(audio.index_format(), Some(IndexFormat::Cues));

        assert_eq!(source("video/x-flv", None).index_format(), None);
    }

    #[test]
    fn test_source_pair_from_json() {
        let json = r#"{
            "video": {
                "url": "https://media.example.com/v",
                "mime_codec": "video/webm; codecs=\"vp9\"",
                "init_range": {"start": 0, "end": 219},
                "index_range": {"start": 220, "end": 1199},
                "file_size": 5000000
            },
            "audio": {
                "url": "https://media.example.com/a",
                "mime_codec": "audio/mp4; codecs=\"mp4a.40.2\"",
                "init_range": {"start": 0, "end": 631},
                "index_range": {"start": 632, "end": 1083},
                "acodec": "mp4a.40.2"
            },
            "quality_string": "1080p vp9"
        }"#;
        let pair: SourcePair = serde_json::from_str(json).unwrap();
        assert_eq!(pair.video.kind(), StreamKind::Video);
        assert_eq!(pair.audio.kind(), StreamKind::Audio);
        assert_eq!(pair.audio.file_size, None);
        assert_eq!(pair.quality_string.as_deref(), Some("1080p vp9"));
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(0.0, 10.0);
        assert!(range.covers(1.0, 9.99));
        assert!(!range.covers(1.0, 10.5));
        assert!(range.overlaps(&TimeRange::new(9.0, 12.0)));
        assert!(!range.overlaps(&TimeRange::new(10.0, 12.0)));
    }
}
