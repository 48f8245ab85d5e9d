//! Duet Core - Adaptive Segment Buffering for Duet
//!
//! This crate feeds a separately-encoded video stream and audio stream into
//! one playback sink:
//! - Segment index parsing (ISO-BMFF `sidx`, WebM/Matroska `Cues`)
//! - HTTP byte-range fetching with retry and backoff
//! - Per-stream buffer control with byte-based lookahead and eviction
//! - Audio/video coordination, seek debouncing and end of stream
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Duet Core                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Segment    │  │    Range     │  │   Playback   │           │
//! │  │    Index     │  │   Fetcher    │  │    Clock     │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │  ┌──────┴─────────────────┴───┐             │                   │
//! │  │  Stream Buffer Controller  │ x2          │                   │
//! │  └──────────────┬─────────────┘             │                   │
//! │                 │                           │                   │
//! │          ┌──────┴───────────────────────────┴──┐                │
//! │          │          A/V Coordinator            │                │
//! │          └──────────────────┬──────────────────┘                │
//! │                             │                                   │
//! │                      ┌──────┴──────┐                            │
//! │                      │ Media Sink  │                            │
//! │                      └─────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod index;
pub mod reader;
pub mod sink;
pub mod types;

pub use clock::{ClockEvent, ManualClock, PlaybackClock};
pub use config::{EngineConfig, RetryConfig};
pub use controller::{BufferCheck, ControllerStats, Phase, StreamBufferController};
pub use coordinator::AvSyncCoordinator;
pub use error::{Error, Result};
pub use fetch::{HttpRangeFetcher, MemoryFetcher, RangeFetcher};
pub use index::{parse_index, SegmentEntry, SegmentIndex};
pub use sink::{MediaSink, MemorySink, ReadyState, SinkEvent, SourceBuffer};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine library
pub fn init() {
    tracing::info!(version = VERSION, "Duet Core initialized");
}
