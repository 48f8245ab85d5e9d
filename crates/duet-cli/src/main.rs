//! Duet CLI - Headless Dual-Stream Player
//!
//! Features:
//! - Segment index inspection (sidx and Cues)
//! - Headless playback against an in-memory sink
//! - Engine configuration dump

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

/// Duet CLI - Dual-stream segment buffering toolkit
#[derive(Parser)]
#[command(name = "duet")]
#[command(author = "Purple Squirrel Media")]
#[command(version)]
#[command(about = "Inspect and play separately-encoded audio/video streams", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Output format (text, json, table)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

/// Which streams of a source pair to act on
#[derive(Clone, Copy, ValueEnum)]
pub enum StreamArg {
    Video,
    Audio,
    Both,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and print the segment index of a source pair
    Index {
        /// JSON file describing the video and audio sources
        sources: PathBuf,

        /// Streams to index
        #[arg(short, long, value_enum, default_value = "both")]
        stream: StreamArg,

        /// Number of segments to list per stream (0 = all)
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Play a source pair headlessly and report what was buffered
    Play {
        /// JSON file describing the video and audio sources
        sources: PathBuf,

        /// Engine configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Start position in seconds, overriding the configuration
        #[arg(long)]
        start: Option<f64>,

        /// Seconds of playback to simulate
        #[arg(short, long, default_value = "30")]
        duration: f64,

        /// Playback rate relative to wall-clock time
        #[arg(long, default_value = "1.0")]
        speed: f64,

        /// Seek to this position once, halfway through the run
        #[arg(long)]
        seek: Option<f64>,

        /// Sink capacity for video in bytes
        #[arg(long)]
        video_capacity: Option<u64>,

        /// Sink capacity for audio in bytes
        #[arg(long)]
        audio_capacity: Option<u64>,
    },

    /// Print the default engine configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    duet_core::init();

    match cli.command {
        Commands::Index { sources, stream, limit } => {
            commands::index(&sources, stream, limit, &cli.format).await?;
        }
        Commands::Play {
            sources,
            config,
            start,
            duration,
            speed,
            seek,
            video_capacity,
            audio_capacity,
        } => {
            let options = commands::PlayOptions {
                start,
                duration,
                speed,
                seek,
                video_capacity: video_capacity.unwrap_or(u64::MAX),
                audio_capacity: audio_capacity.unwrap_or(u64::MAX),
            };
            commands::play(&sources, config.as_deref(), options, &cli.format).await?;
        }
        Commands::Config => {
            commands::config(&cli.format)?;
        }
    }

    Ok(())
}
