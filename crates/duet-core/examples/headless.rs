//! Headless playback example
//!
//! Builds a small fragmented MP4 pair in memory, plays it through the
//! coordinator and prints what the sink ended up holding.
//!
//! Run with: cargo run -p duet-core --example headless

use duet_core::{
    AvSyncCoordinator, EngineConfig, InclusiveRange, ManualClock, MemoryFetcher, MemorySink,
    SourcePair, StreamKind, StreamSource,
};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const INIT_LEN: usize = 32;

/// Init bytes, a version 0 `sidx`, then the segments themselves
fn build_stream(segments: usize, size: u32) -> (Vec<u8>, InclusiveRange, InclusiveRange) {
    let mut sidx = Vec::new();
    sidx.extend_from_slice(&[0, 0, 0, 0]);
    sidx.extend_from_slice(&1u32.to_be_bytes());
    sidx.extend_from_slice(&1000u32.to_be_bytes());
    sidx.extend_from_slice(&[0; 8]);
    sidx.extend_from_slice(&[0, 0]);
    sidx.extend_from_slice(&(segments as u16).to_be_bytes());
    for _ in 0..segments {
        sidx.extend_from_slice(&size.to_be_bytes());
        sidx.extend_from_slice(&2000u32.to_be_bytes());
        sidx.extend_from_slice(&0x9000_0000u32.to_be_bytes());
    }

    let mut data = vec![0u8; INIT_LEN];
    data.extend_from_slice(&((sidx.len() + 8) as u32).to_be_bytes());
    data.extend_from_slice(b"sidx");
    data.extend_from_slice(&sidx);
    let index = InclusiveRange::new(INIT_LEN as u64, data.len() as u64 - 1);
    data.resize(data.len() + segments * size as usize, 0xEE);
    (data, InclusiveRange::new(0, INIT_LEN as u64 - 1), index)
}

fn stream(
    url: &Url,
    mime: &str,
    acodec: Option<&str>,
    parts: &(Vec<u8>, InclusiveRange, InclusiveRange),
) -> StreamSource {
    StreamSource {
        url: url.clone(),
        mime_codec: mime.to_string(),
        init_range: parts.1,
        index_range: parts.2,
        file_size: Some(parts.0.len() as u64),
        acodec: acodec.map(str::to_string),
        vcodec: None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Duet Core - Headless Playback Example");
    println!("=====================================\n");

    let video_url = Url::parse("https://media.example/clip-video.mp4")?;
    let audio_url = Url::parse("https://media.example/clip-audio.mp4")?;
    let video = build_stream(8, 40_000);
    let audio = build_stream(8, 4_000);

    let pair = SourcePair {
        video: stream(&video_url, "video/mp4; codecs=\"avc1.4d401f\"", None, &video),
        audio: stream(&audio_url, "audio/mp4; codecs=\"mp4a.40.2\"", Some("mp4a.40.2"), &audio),
        quality_string: Some("480p".into()),
    };
    let fetcher = MemoryFetcher::new()
        .with_resource(video_url, video.0)
        .with_resource(audio_url, audio.0);

    // Room for about four video segments at a time
    let (sink, events) = MemorySink::new(INIT_LEN as u64 + 4 * 40_000, u64::MAX);
    let clock = ManualClock::new(0.0);
    let config = EngineConfig {
        video_buffer_target: 100_000,
        ..EngineConfig::default()
    };

    let coordinator = AvSyncCoordinator::new(
        pair,
        config,
        Box::new(sink.clone()),
        Arc::new(fetcher),
        Arc::new(clock.clone()),
    )?;
    let shutdown = coordinator.shutdown_token();
    let task = tokio::spawn(coordinator.run(events));

    let mut position = 0.0;
    while position <= 16.0 {
        clock.tick(position);
        tokio::time::sleep(Duration::from_millis(20)).await;
        position += 0.5;
    }
    shutdown.cancel();
    task.await??;

    for kind in [StreamKind::Video, StreamKind::Audio] {
        println!(
            "{kind}: {} appends, {} removals, buffered {:?}",
            sink.append_count(kind),
            sink.remove_count(kind),
            sink.buffered(kind)
        );
    }
    println!("End of stream signalled: {}", sink.end_of_stream_calls() > 0);
    Ok(())
}
