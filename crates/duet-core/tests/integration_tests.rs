//! Integration tests for Duet Core

use duet_core::{
    index::ebml::ids, AvSyncCoordinator, EngineConfig, HttpRangeFetcher, InclusiveRange,
    ManualClock, MemoryFetcher, MemorySink, RangeFetcher, RetryConfig, SinkEvent, SourcePair,
    StreamKind, StreamSource, TimeRange,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Media Builders
// =============================================================================

const MP4_INIT_LEN: usize = 64;
const WEBM_CLUSTER_BASE: usize = 4096;

/// A fragmented MP4 resource with one-second segments, plus its init and index ranges
struct Resource {
    data: Vec<u8>,
    init: InclusiveRange,
    index: InclusiveRange,
}

fn sidx(refs: &[(u32, u32)]) -> Vec<u8> {
    let mut body = vec![0, 0, 0, 0];
    body.extend_from_slice(&1u32.to_be_bytes());
    body.extend_from_slice(&1000u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&[0, 0]);
    body.extend_from_slice(&(refs.len() as u16).to_be_bytes());
    for &(size, duration) in refs {
        body.extend_from_slice(&size.to_be_bytes());
        body.extend_from_slice(&duration.to_be_bytes());
        body.extend_from_slice(&0x9000_0000u32.to_be_bytes());
    }
    let mut data = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    data.extend_from_slice(b"sidx");
    data.extend_from_slice(&body);
    data
}

fn mp4_resource(segments: usize, size: u32) -> Resource {
    let mut data = vec![0u8; MP4_INIT_LEN];
    data.extend_from_slice(&sidx(&vec![(size, 1000); segments]));
    let index = InclusiveRange::new(MP4_INIT_LEN as u64, data.len() as u64 - 1);
    data.extend(std::iter::repeat(0x5A).take(segments * size as usize));
    Resource {
        data,
        init: InclusiveRange::new(0, MP4_INIT_LEN as u64 - 1),
        index,
    }
}

fn ebml_size(size: u64) -> Vec<u8> {
    let mut length = 1;
    while length < 8 && size >= (1u64 << (7 * length)) - 1 {
        length += 1;
    }
    let marked = size | (1u64 << (7 * length));
    marked.to_be_bytes()[8 - length..].to_vec()
}

fn element(id: u32, payload: &[u8]) -> Vec<u8> {
    let id_bytes = id.to_be_bytes();
    let skip = id_bytes.iter().take_while(|&&b| b == 0).count();
    [&id_bytes[skip..], ebml_size(payload.len() as u64).as_slice(), payload].concat()
}

fn uint(id: u32, value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    element(id, &bytes[skip..])
}

/// WebM resource: init segment, Cues right after it, clusters from a fixed offset
fn webm_resource(segments: usize, size: usize) -> Resource {
    let header = element(ids::EBML, &element(0x4282, b"webm"));
    let info = element(
        ids::INFO,
        &[
            uint(ids::TIMECODE_SCALE, 1_000_000),
            element(ids::DURATION, &(segments as f64 * 1000.0).to_be_bytes()),
        ]
        .concat(),
    );
    let segment_header = vec![0x18, 0x53, 0x80, 0x67, 0x01, 0, 0, 0, 0, 0x10, 0, 0];
    let cues_offset = header.len() + segment_header.len();
    let init = [header, segment_header, info].concat();

    let points: Vec<u8> = (0..segments)
        .flat_map(|k| {
            let position = (WEBM_CLUSTER_BASE + k * size - cues_offset) as u64;
            let positions = element(
                ids::CUE_TRACK_POSITIONS,
                &[uint(ids::CUE_TRACK, 1), uint(ids::CUE_CLUSTER_POSITION, position)].concat(),
            );
            element(ids::CUE_POINT, &[uint(ids::CUE_TIME, k as u64 * 1000), positions].concat())
        })
        .collect();
    let cues = element(ids::CUES, &points);
    assert!(init.len() + cues.len() < WEBM_CLUSTER_BASE);

    let mut data = init.clone();
    data.extend_from_slice(&cues);
    let index = InclusiveRange::new(init.len() as u64, data.len() as u64 - 1);
    data.resize(WEBM_CLUSTER_BASE, 0);
    data.extend(std::iter::repeat(0xA3).take(segments * size));
    Resource {
        data,
        init: InclusiveRange::new(0, init.len() as u64 - 1),
        index,
    }
}

fn source(url: &Url, mime: &str, resource: &Resource, acodec: Option<&str>) -> StreamSource {
    StreamSource {
        url: url.clone(),
        mime_codec: mime.to_string(),
        init_range: resource.init,
        index_range: resource.index,
        file_size: Some(resource.data.len() as u64),
        acodec: acodec.map(str::to_string),
        vcodec: None,
    }
}

fn urls() -> (Url, Url) {
    (
        Url::parse("https://media.example/video").unwrap(),
        Url::parse("https://media.example/audio").unwrap(),
    )
}

fn mp4_pair(video_segments: usize, audio_segments: usize) -> (SourcePair, MemoryFetcher) {
    let (video_url, audio_url) = urls();
    let video = mp4_resource(video_segments, 2000);
    let audio = mp4_resource(audio_segments, 300);
    let pair = SourcePair {
        video: source(&video_url, "video/mp4; codecs=\"avc1.640028\"", &video, None),
        audio: source(&audio_url, "audio/mp4; codecs=\"mp4a.40.2\"", &audio, Some("mp4a.40.2")),
        quality_string: Some("720p".into()),
    };
    let fetcher = MemoryFetcher::new()
        .with_resource(video_url, video.data)
        .with_resource(audio_url, audio.data);
    (pair, fetcher)
}

fn webm_pair(segments: usize) -> (SourcePair, MemoryFetcher) {
    let (video_url, audio_url) = urls();
    let video = webm_resource(segments, 1500);
    let audio = webm_resource(segments, 200);
    let pair = SourcePair {
        video: source(&video_url, "video/webm; codecs=\"vp9\"", &video, None),
        audio: source(&audio_url, "audio/webm; codecs=\"opus\"", &audio, Some("opus")),
        quality_string: Some("1080p60 vp9".into()),
    };
    let fetcher = MemoryFetcher::new()
        .with_resource(video_url, video.data)
        .with_resource(audio_url, audio.data);
    (pair, fetcher)
}

// =============================================================================
// Playback Harness
// =============================================================================

struct Playback {
    sink: MemorySink,
    clock: ManualClock,
    shutdown: CancellationToken,
    task: JoinHandle<duet_core::Result<()>>,
}

fn start(
    pair: SourcePair,
    fetcher: Arc<dyn RangeFetcher>,
    sink: MemorySink,
    events: mpsc::UnboundedReceiver<SinkEvent>,
    config: EngineConfig,
) -> Playback {
    let clock = ManualClock::new(config.start_time);
    let coordinator = AvSyncCoordinator::new(
        pair,
        config,
        Box::new(sink.clone()),
        fetcher,
        Arc::new(clock.clone()),
    )
    .unwrap();
    let shutdown = coordinator.shutdown_token();
    let task = tokio::spawn(coordinator.run(events));
    Playback {
        sink,
        clock,
        shutdown,
        task,
    }
}

impl Playback {
    /// Advance the clock in quarter-second steps
    async fn play(&self, from: f64, to: f64, step: Duration) {
        let mut position = from;
        while position <= to {
            self.clock.tick(position);
            tokio::time::sleep(step).await;
            position += 0.25;
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

fn covers(ranges: &[TimeRange], start: f64, end: f64) -> bool {
    ranges.iter().any(|r| r.covers(start, end))
}

// =============================================================================
// Playback Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_mp4_pair_plays_to_end() {
    let (pair, fetcher) = mp4_pair(12, 12);
    let (sink, events) = MemorySink::new(u64::MAX, u64::MAX);
    let playback = start(pair, Arc::new(fetcher), sink, events, EngineConfig::default());

    tokio::time::sleep(Duration::from_millis(100)).await;
    playback.play(0.0, 14.0, Duration::from_millis(250)).await;

    for kind in [StreamKind::Video, StreamKind::Audio] {
        assert_eq!(playback.sink.buffered(kind), vec![TimeRange::new(0.0, 12.0)]);
    }
    assert_eq!(playback.sink.end_of_stream_calls(), 1);
    playback.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_webm_pair_plays_to_end() {
    let (pair, fetcher) = webm_pair(6);
    let (sink, events) = MemorySink::new(u64::MAX, u64::MAX);
    let fetcher = Arc::new(fetcher);
    let playback = start(pair, fetcher.clone(), sink, events, EngineConfig::default());

    tokio::time::sleep(Duration::from_millis(100)).await;
    playback.play(0.0, 8.0, Duration::from_millis(250)).await;

    for kind in [StreamKind::Video, StreamKind::Audio] {
        assert_eq!(playback.sink.buffered(kind), vec![TimeRange::new(0.0, 6.0)]);
    }
    assert_eq!(playback.sink.end_of_stream_calls(), 1);

    // Init and Cues came in one request per stream; the last cluster runs to end of file
    let requests = fetcher.requests().await;
    assert_eq!(requests.len(), 2 + 2 * 6);
    let (video_url, _) = urls();
    let last = requests
        .iter()
        .filter(|(url, _)| *url == video_url)
        .map(|(_, range)| *range)
        .max_by_key(|range| range.start)
        .unwrap();
    assert_eq!(last.start, (WEBM_CLUSTER_BASE + 5 * 1500) as u64);
    assert_eq!(last.end, (WEBM_CLUSTER_BASE + 6 * 1500) as u64 - 1);
    playback.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_time_fetches_from_offset() {
    let (pair, fetcher) = mp4_pair(10, 10);
    let fetcher = Arc::new(fetcher);
    let (sink, events) = MemorySink::new(u64::MAX, u64::MAX);
    let config = EngineConfig {
        start_time: 7.5,
        ..EngineConfig::default()
    };
    let playback = start(pair, fetcher.clone(), sink, events, config);

    tokio::time::sleep(Duration::from_millis(100)).await;
    for kind in [StreamKind::Video, StreamKind::Audio] {
        assert_eq!(playback.sink.buffered(kind), vec![TimeRange::new(7.0, 8.0)]);
    }
    playback.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_seek_during_playback() {
    let (pair, fetcher) = mp4_pair(20, 20);
    let (sink, events) = MemorySink::new(u64::MAX, u64::MAX);
    let playback = start(pair, Arc::new(fetcher), sink, events, EngineConfig::default());

    tokio::time::sleep(Duration::from_millis(100)).await;
    playback.play(0.0, 1.0, Duration::from_millis(250)).await;
    assert!(!covers(&playback.sink.buffered(StreamKind::Video), 15.0, 16.0));

    playback.clock.seek(15.5);
    tokio::time::sleep(Duration::from_millis(700)).await;
    for kind in [StreamKind::Video, StreamKind::Audio] {
        assert!(covers(&playback.sink.buffered(kind), 15.0, 16.0), "{kind}");
    }

    // Lookahead resumes from the new position
    playback.play(15.75, 17.0, Duration::from_millis(250)).await;
    assert!(covers(&playback.sink.buffered(StreamKind::Video), 15.0, 19.0));
    assert_eq!(playback.sink.end_of_stream_calls(), 0);
    playback.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_playback_under_memory_pressure() {
    let (pair, fetcher) = mp4_pair(10, 10);
    let capacity = MP4_INIT_LEN as u64 + 3 * 2000;
    let (sink, events) = MemorySink::new(capacity, u64::MAX);
    let playback = start(pair, Arc::new(fetcher), sink, events, EngineConfig::default());

    tokio::time::sleep(Duration::from_millis(100)).await;
    playback.play(0.0, 12.0, Duration::from_millis(250)).await;

    assert!(playback.sink.remove_count(StreamKind::Video) > 0);
    assert!(playback.sink.used_bytes(StreamKind::Video) <= capacity);
    assert_eq!(playback.sink.remove_count(StreamKind::Audio), 0);
    assert_eq!(playback.sink.end_of_stream_calls(), 1);
    playback.stop().await;
}

// =============================================================================
// Failure Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_forbidden_stream_never_ends() {
    let (pair, fetcher) = mp4_pair(4, 4);
    let (video_url, _) = urls();
    fetcher.fail_next(&video_url, &[403]).await;
    let (sink, events) = MemorySink::new(u64::MAX, u64::MAX);
    let playback = start(pair, Arc::new(fetcher), sink, events, EngineConfig::default());

    tokio::time::sleep(Duration::from_millis(100)).await;
    playback.play(0.0, 6.0, Duration::from_millis(250)).await;

    assert!(playback.sink.buffered(StreamKind::Video).is_empty());
    assert_eq!(playback.sink.buffered(StreamKind::Audio), vec![TimeRange::new(0.0, 4.0)]);
    assert_eq!(playback.sink.end_of_stream_calls(), 0);
    playback.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_segment_is_requested_again() {
    let (pair, fetcher) = mp4_pair(4, 4);
    let fetcher = Arc::new(fetcher);
    let (video_url, _) = urls();
    let (sink, events) = MemorySink::new(u64::MAX, u64::MAX);
    let playback = start(pair, fetcher.clone(), sink, events, EngineConfig::default());

    tokio::time::sleep(Duration::from_millis(100)).await;
    fetcher.fail_next(&video_url, &[503]).await;
    playback.play(0.0, 6.0, Duration::from_millis(250)).await;

    assert_eq!(playback.sink.buffered(StreamKind::Video), vec![TimeRange::new(0.0, 4.0)]);
    assert_eq!(playback.sink.end_of_stream_calls(), 1);

    let video_requests: Vec<_> = fetcher
        .requests()
        .await
        .into_iter()
        .filter(|(url, _)| *url == video_url)
        .collect();
    // header, then segments 0..4 with segment 1 asked for twice
    assert_eq!(video_requests.len(), 6);
    assert_eq!(video_requests[2].1, video_requests[3].1);
    playback.stop().await;
}

// =============================================================================
// HTTP Tests
// =============================================================================

async fn mount_ranges(server: &MockServer, route: &str, resource: &Resource, segments: usize, size: usize) {
    let header_end = resource.index.end as usize;
    let mut ranges = vec![(0, header_end)];
    let media_start = header_end + 1;
    ranges.extend((0..segments).map(|k| (media_start + k * size, media_start + (k + 1) * size - 1)));

    for (start, end) in ranges {
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("range", format!("bytes={start}-{end}").as_str()))
            .respond_with(
                ResponseTemplate::new(206).set_body_bytes(resource.data[start..=end].to_vec()),
            )
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_http_playback() {
    let server = MockServer::start().await;
    let video = mp4_resource(3, 2000);
    let audio = mp4_resource(3, 300);
    mount_ranges(&server, "/video.mp4", &video, 3, 2000).await;
    mount_ranges(&server, "/audio.mp4", &audio, 3, 300).await;

    let base = Url::parse(&server.uri()).unwrap();
    let pair = SourcePair {
        video: source(&base.join("/video.mp4").unwrap(), "video/mp4; codecs=\"avc1\"", &video, None),
        audio: source(&base.join("/audio.mp4").unwrap(), "audio/mp4; codecs=\"mp4a.40.2\"", &audio, Some("mp4a.40.2")),
        quality_string: None,
    };
    let fetcher = HttpRangeFetcher::new(RetryConfig {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(10),
        request_timeout: Duration::from_secs(2),
    })
    .unwrap();

    let (sink, events) = MemorySink::new(u64::MAX, u64::MAX);
    let playback = start(pair, Arc::new(fetcher), sink, events, EngineConfig::default());
    tokio::time::sleep(Duration::from_millis(200)).await;
    playback.play(0.0, 4.0, Duration::from_millis(100)).await;

    for kind in [StreamKind::Video, StreamKind::Audio] {
        assert_eq!(playback.sink.buffered(kind), vec![TimeRange::new(0.0, 3.0)]);
    }
    assert_eq!(playback.sink.end_of_stream_calls(), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2 + 2 * 3);
    playback.stop().await;
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_source_pair_from_json() {
    let json = r#"{
        "video": {
            "url": "https://media.example/v.webm",
            "mime_codec": "video/webm; codecs=\"vp9\"",
            "init_range": {"start": 0, "end": 219},
            "index_range": {"start": 220, "end": 1021},
            "file_size": 7340032
        },
        "audio": {
            "url": "https://media.example/a.webm",
            "mime_codec": "audio/webm; codecs=\"opus\"",
            "init_range": {"start": 0, "end": 258},
            "index_range": {"start": 259, "end": 700},
            "acodec": "opus"
        },
        "quality_string": "1080p vp9"
    }"#;
    let pair: SourcePair = serde_json::from_str(json).unwrap();
    assert_eq!(pair.video.kind(), StreamKind::Video);
    assert_eq!(pair.audio.kind(), StreamKind::Audio);
    assert!(pair.video.init_range.is_adjacent_to(&pair.video.index_range));
    assert_eq!(pair.audio.file_size, None);
}

#[test]
fn test_engine_config_partial_json() {
    let config = EngineConfig::from_json_str(r#"{"video_buffer_target": 1000000, "discard_stale_fetches": true}"#).unwrap();
    assert_eq!(config.video_buffer_target, 1_000_000);
    assert_eq!(config.audio_buffer_target, EngineConfig::default().audio_buffer_target);
    assert!(config.discard_stale_fetches);

    assert!(EngineConfig::from_json_str(r#"{"target_shrink_factor": 1.5}"#).is_err());
}

#[test]
fn test_http_range_rendering() {
    assert_eq!(InclusiveRange::new(220, 1021).to_http_range(), "bytes=220-1021");
    assert_eq!(
        InclusiveRange::new(4096, InclusiveRange::OPEN_END).to_http_range(),
        "bytes=4096-"
    );
}
