//! CLI command implementations

use crate::output::{self, OutputFormat};
use crate::StreamArg;
use duet_core::{
    parse_index, AvSyncCoordinator, EngineConfig, HttpRangeFetcher, InclusiveRange, ManualClock,
    MemorySink, RangeFetcher, SegmentIndex, SourcePair, StreamKind, StreamSource, TimeRange,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Media seconds advanced per clock tick
const TICK_SECONDS: f64 = 0.25;

fn load_sources(path: &Path) -> anyhow::Result<SourcePair> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

fn selected(pair: &SourcePair, stream: StreamArg) -> Vec<&StreamSource> {
    match stream {
        StreamArg::Video => vec![&pair.video],
        StreamArg::Audio => vec![&pair.audio],
        StreamArg::Both => vec![&pair.video, &pair.audio],
    }
}

/// Fetch the init and index ranges of one stream and decode its segment table
async fn load_index(fetcher: &HttpRangeFetcher, source: &StreamSource) -> anyhow::Result<SegmentIndex> {
    let (init, index) = if source.init_range.is_adjacent_to(&source.index_range) {
        let range = InclusiveRange::new(source.init_range.start, source.index_range.end);
        let header = fetcher.fetch_range(&source.url, range).await?;
        let split = ((source.init_range.end - source.init_range.start + 1) as usize).min(header.len());
        (header.slice(..split), header.slice(split..))
    } else {
        let init = fetcher.fetch_range(&source.url, source.init_range).await?;
        let index = fetcher.fetch_range(&source.url, source.index_range).await?;
        (init, index)
    };
    Ok(parse_index(source, &init, &index)?)
}

#[derive(Serialize, Tabled)]
struct SegmentRow {
    #[tabled(rename = "#")]
    index: usize,
    start: String,
    end: String,
    bytes: String,
    size: String,
}

#[derive(Serialize)]
struct IndexReport {
    stream: StreamKind,
    mime_codec: String,
    segments: usize,
    duration: f64,
    contiguous: bool,
    rows: Vec<SegmentRow>,
}

/// Print the segment index of each selected stream
pub async fn index(sources: &Path, stream: StreamArg, limit: usize, format: &str) -> anyhow::Result<()> {
    let pair = load_sources(sources)?;
    let fetcher = HttpRangeFetcher::new(EngineConfig::default().retry)?;

    let mut reports = Vec::new();
    for source in selected(&pair, stream) {
        let index = load_index(&fetcher, source).await?;
        let take = if limit == 0 { index.len() } else { limit };
        let rows = (0..index.len())
            .take(take)
            .filter_map(|i| {
                let entry = index.get(i)?;
                let span = index.time_range(i)?;
                Some(SegmentRow {
                    index: i,
                    start: output::timestamp(span.start),
                    end: output::timestamp(span.end),
                    bytes: entry.byte_range().to_string(),
                    size: entry
                        .byte_range()
                        .len()
                        .map_or_else(|| "to end".to_string(), output::bytes),
                })
            })
            .collect();
        reports.push(IndexReport {
            stream: source.kind(),
            mime_codec: source.mime_codec.clone(),
            segments: index.len(),
            duration: index.duration(),
            contiguous: index.is_contiguous(),
            rows,
        });
    }

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", output::to_json(&reports)),
        OutputFormat::Table | OutputFormat::Text => {
            for report in reports {
                println!(
                    "\n{} ({}): {} segments, {:.3}s{}",
                    report.stream,
                    report.mime_codec,
                    report.segments,
                    report.duration,
                    if report.contiguous { "" } else { ", gaps in byte ranges" }
                );
                let shown = report.rows.len();
                println!("{}", output::table(report.rows));
                if shown < report.segments {
                    println!("  ... and {} more", report.segments - shown);
                }
            }
        }
    }

    Ok(())
}

/// Knobs for a headless playback run
pub struct PlayOptions {
    pub start: Option<f64>,
    pub duration: f64,
    pub speed: f64,
    pub seek: Option<f64>,
    pub video_capacity: u64,
    pub audio_capacity: u64,
}

#[derive(Serialize, Tabled)]
struct StreamSummary {
    stream: StreamKind,
    buffered: String,
    resident: String,
    appends: usize,
    removals: usize,
}

#[derive(Serialize)]
struct PlayReport {
    session: String,
    position: f64,
    end_of_stream: bool,
    streams: Vec<StreamSummary>,
}

fn describe_ranges(ranges: &[TimeRange]) -> String {
    if ranges.is_empty() {
        return "-".to_string();
    }
    ranges
        .iter()
        .map(|r| format!("{:.2}-{:.2}", r.start, r.end))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Play a source pair into an in-memory sink driven by a wall-clock ticker
pub async fn play(
    sources: &Path,
    config: Option<&Path>,
    options: PlayOptions,
    format: &str,
) -> anyhow::Result<()> {
    if !(options.speed > 0.0 && options.speed.is_finite()) {
        anyhow::bail!("speed must be a positive number, got {}", options.speed);
    }
    let pair = load_sources(sources)?;
    let mut config = match config {
        Some(path) => EngineConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };
    if let Some(start) = options.start {
        config.start_time = start;
    }

    let (sink, events) = MemorySink::new(options.video_capacity, options.audio_capacity);
    let clock = ManualClock::new(config.start_time);
    let fetcher = Arc::new(HttpRangeFetcher::new(config.retry.clone())?);
    let mut position = config.start_time;

    let coordinator = AvSyncCoordinator::new(
        pair,
        config,
        Box::new(sink.clone()),
        fetcher,
        Arc::new(clock.clone()),
    )?;
    let session = coordinator.session_id();
    let shutdown = coordinator.shutdown_token();
    let task = tokio::spawn(coordinator.run(events));

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(TICK_SECONDS / options.speed));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pending_seek = options.seek;
    let mut elapsed = 0.0;

    info!(%session, position, duration = options.duration, "Playing");
    while elapsed < options.duration {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
                break;
            }
        }
        if task.is_finished() {
            warn!("Engine stopped early");
            break;
        }
        if let Some(target) = pending_seek.filter(|_| elapsed >= options.duration / 2.0) {
            pending_seek = None;
            position = target;
            clock.seek(position);
            continue;
        }
        elapsed += TICK_SECONDS;
        position += TICK_SECONDS;
        clock.tick(position);
    }

    shutdown.cancel();
    task.await??;

    let streams = [StreamKind::Video, StreamKind::Audio]
        .into_iter()
        .map(|kind| StreamSummary {
            stream: kind,
            buffered: describe_ranges(&sink.buffered(kind)),
            resident: output::bytes(sink.used_bytes(kind)),
            appends: sink.append_count(kind),
            removals: sink.remove_count(kind),
        })
        .collect::<Vec<_>>();
    let report = PlayReport {
        session: session.to_string(),
        position,
        end_of_stream: sink.end_of_stream_calls() > 0,
        streams,
    };

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", output::to_json(&report)),
        OutputFormat::Table | OutputFormat::Text => {
            println!("\nSession {} stopped at {}", report.session, output::timestamp(report.position));
            println!("  End of stream: {}", report.end_of_stream);
            println!("{}", output::table(report.streams));
        }
    }

    Ok(())
}

#[derive(Debug, Tabled, PartialEq)]
struct SettingRow {
    #[tabled(rename = "Setting")]
    setting: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Flatten the configuration's JSON form into dotted key/value rows
fn setting_rows(config: &EngineConfig) -> anyhow::Result<Vec<SettingRow>> {
    fn walk(prefix: &str, value: &serde_json::Value, rows: &mut Vec<SettingRow>) {
        match value {
            serde_json::Value::Object(fields) => {
                for (key, field) in fields {
                    let name = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&name, field, rows);
                }
            }
            other => rows.push(SettingRow {
                setting: prefix.to_string(),
                value: other.to_string(),
            }),
        }
    }

    let mut rows = Vec::new();
    walk("", &serde_json::to_value(config)?, &mut rows);
    Ok(rows)
}

/// Print the default engine configuration
pub fn config(format: &str) -> anyhow::Result<()> {
    let config = EngineConfig::default();
    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", output::to_json(&config)),
        OutputFormat::Table => println!("{}", output::table(setting_rows(&config)?)),
        OutputFormat::Text => {
            for row in setting_rows(&config)? {
                println!("{} = {}", row.setting, row.value);
            }
        }
    }
    Ok(())
}
