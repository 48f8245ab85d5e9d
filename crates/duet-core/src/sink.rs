//! Playback sink contracts and an in-memory sink
//!
//! A [`MediaSink`] hands out one [`SourceBuffer`] per elementary stream.
//! Mutating buffer operations finish asynchronously: the sink reports
//! completion with [`SinkEvent::UpdateEnd`] on its event channel, and only
//! one mutating operation per buffer may be outstanding.

use crate::{
    types::{StreamKind, TimeRange},
    Error, Result,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lifecycle of the sink as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReadyState {
    Closed,
    Open,
    Ended,
}

/// Notifications raised by a sink
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// The sink is ready to accept source buffers, or re-opened after ending
    SourceOpen,
    /// The last append or remove on this stream's buffer finished
    UpdateEnd(StreamKind),
    /// End of stream was accepted
    SourceEnded,
}

/// Per-stream buffer inside a sink
pub trait SourceBuffer: Send {
    /// True while a mutating operation is in progress
    fn updating(&self) -> bool;

    /// Append encoded media
    ///
    /// `span` is the playback time the bytes cover, when known; it is
    /// `None` for initialization data. Fails with [`Error::QuotaExceeded`]
    /// when the buffer is full.
    fn append(&mut self, data: Bytes, span: Option<TimeRange>) -> Result<()>;

    /// Drop buffered media overlapping `range`
    fn remove(&mut self, range: TimeRange) -> Result<()>;

    /// Abandon the operation in progress, if any
    fn abort(&mut self);

    /// Buffered playback time, ascending and non-overlapping
    fn buffered(&self) -> Vec<TimeRange>;
}

/// The consumer of both streams
pub trait MediaSink: Send {
    fn ready_state(&self) -> ReadyState;

    fn is_type_supported(&self, mime: &str) -> bool;

    fn add_source_buffer(&mut self, kind: StreamKind, mime: &str) -> Result<Box<dyn SourceBuffer>>;

    fn remove_source_buffer(&mut self, kind: StreamKind);

    /// Tell the consumer no more media will arrive
    fn end_of_stream(&mut self) -> Result<()>;
}

/// Merge spans into sorted, non-overlapping ranges
///
/// Spans closer than `gap` are joined.
pub fn merge_ranges(mut spans: Vec<TimeRange>, gap: f64) -> Vec<TimeRange> {
    spans.sort_by(|a, b| a.start.total_cmp(&b.start));
    let mut merged: Vec<TimeRange> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(current) if span.start <= current.end + gap => {
                current.end = current.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

const MERGE_GAP: f64 = 1e-6;

#[derive(Debug)]
struct Chunk {
    span: Option<TimeRange>,
    bytes: u64,
}

#[derive(Debug)]
struct BufferState {
    mime: String,
    capacity: u64,
    chunks: Vec<Chunk>,
    appends: usize,
    removes: usize,
    aborts: usize,
    attached: bool,
}

impl BufferState {
    fn used(&self) -> u64 {
        self.chunks.iter().map(|c| c.bytes).sum()
    }
}

#[derive(Debug)]
struct SinkState {
    ready_state: ReadyState,
    capacities: HashMap<StreamKind, u64>,
    buffers: HashMap<StreamKind, Arc<Mutex<BufferState>>>,
    end_of_stream_calls: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Byte-bounded sink that keeps appended spans in memory
///
/// Operations complete immediately; `UpdateEnd` is still delivered through
/// the event channel so callers observe the same sequencing as with a real
/// sink. Clones share state, so a clone kept aside can inspect or disturb
/// the buffers after another clone has been handed to a coordinator.
#[derive(Debug, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
    events: mpsc::UnboundedSender<SinkEvent>,
}

impl MemorySink {
    /// Create an open sink with per-stream byte capacities
    ///
    /// `SourceOpen` is already queued on the returned receiver.
    pub fn new(video_capacity: u64, audio_capacity: u64) -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let capacities = HashMap::from([
            (StreamKind::Video, video_capacity),
            (StreamKind::Audio, audio_capacity),
        ]);
        let sink = Self {
            state: Arc::new(Mutex::new(SinkState {
                ready_state: ReadyState::Open,
                capacities,
                buffers: HashMap::new(),
                end_of_stream_calls: 0,
            })),
            events,
        };
        let _ = sink.events.send(SinkEvent::SourceOpen);
        (sink, rx)
    }

    fn buffer(&self, kind: StreamKind) -> Option<Arc<Mutex<BufferState>>> {
        lock(&self.state).buffers.get(&kind).cloned()
    }

    pub fn buffered(&self, kind: StreamKind) -> Vec<TimeRange> {
        self.buffer(kind)
            .map(|b| buffered_of(&lock(&b)))
            .unwrap_or_default()
    }

    pub fn used_bytes(&self, kind: StreamKind) -> u64 {
        self.buffer(kind).map(|b| lock(&b).used()).unwrap_or(0)
    }

    pub fn append_count(&self, kind: StreamKind) -> usize {
        self.buffer(kind).map(|b| lock(&b).appends).unwrap_or(0)
    }

    pub fn remove_count(&self, kind: StreamKind) -> usize {
        self.buffer(kind).map(|b| lock(&b).removes).unwrap_or(0)
    }

    pub fn abort_count(&self, kind: StreamKind) -> usize {
        self.buffer(kind).map(|b| lock(&b).aborts).unwrap_or(0)
    }

    pub fn end_of_stream_calls(&self) -> usize {
        lock(&self.state).end_of_stream_calls
    }

    pub fn has_source_buffer(&self, kind: StreamKind) -> bool {
        self.buffer(kind).is_some_and(|b| lock(&b).attached)
    }

    /// Drop media without any request from the engine, as a consumer under
    /// memory pressure may do
    pub fn evict_externally(&self, kind: StreamKind, range: TimeRange) {
        if let Some(buffer) = self.buffer(kind) {
            let mut buffer = lock(&buffer);
            buffer
                .chunks
                .retain(|c| c.span.map_or(true, |span| !span.overlaps(&range)));
        }
    }

    /// Change a stream's capacity; applies to buffers created later too
    pub fn set_capacity(&self, kind: StreamKind, capacity: u64) {
        let mut state = lock(&self.state);
        state.capacities.insert(kind, capacity);
        if let Some(buffer) = state.buffers.get(&kind) {
            lock(buffer).capacity = capacity;
        }
    }
}

fn buffered_of(state: &BufferState) -> Vec<TimeRange> {
    merge_ranges(state.chunks.iter().filter_map(|c| c.span).collect(), MERGE_GAP)
}

impl MediaSink for MemorySink {
    fn ready_state(&self) -> ReadyState {
        lock(&self.state).ready_state
    }

    fn is_type_supported(&self, mime: &str) -> bool {
        let container = mime.split(';').next().unwrap_or_default().trim();
        matches!(
            container,
            "video/mp4" | "audio/mp4" | "video/webm" | "audio/webm"
        )
    }

    fn add_source_buffer(&mut self, kind: StreamKind, mime: &str) -> Result<Box<dyn SourceBuffer>> {
        if !self.is_type_supported(mime) {
            return Err(Error::UnsupportedCodec { codec: mime.to_string() });
        }
        let mut state = lock(&self.state);
        if state.ready_state != ReadyState::Open {
            return Err(Error::SinkState(format!(
                "cannot add a source buffer while {:?}",
                state.ready_state
            )));
        }
        if state.buffers.get(&kind).is_some_and(|b| lock(b).attached) {
            return Err(Error::SinkState(format!("{kind} source buffer already exists")));
        }

        let capacity = state.capacities.get(&kind).copied().unwrap_or(u64::MAX);
        let buffer = Arc::new(Mutex::new(BufferState {
            mime: mime.to_string(),
            capacity,
            chunks: Vec::new(),
            appends: 0,
            removes: 0,
            aborts: 0,
            attached: true,
        }));
        state.buffers.insert(kind, buffer.clone());
        debug!(stream = %kind, mime, capacity, "Source buffer added");

        Ok(Box::new(MemorySourceBuffer {
            kind,
            buffer,
            sink: self.state.clone(),
            events: self.events.clone(),
        }))
    }

    fn remove_source_buffer(&mut self, kind: StreamKind) {
        if let Some(buffer) = self.buffer(kind) {
            let mut buffer = lock(&buffer);
            buffer.attached = false;
            buffer.chunks.clear();
            debug!(stream = %kind, mime = %buffer.mime, "Source buffer removed");
        }
    }

    fn end_of_stream(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.ready_state != ReadyState::Open {
            return Err(Error::SinkState(format!(
                "end of stream while {:?}",
                state.ready_state
            )));
        }
        state.ready_state = ReadyState::Ended;
        state.end_of_stream_calls += 1;
        drop(state);
        let _ = self.events.send(SinkEvent::SourceEnded);
        Ok(())
    }
}

/// Buffer handed out by [`MemorySink`]
#[derive(Debug)]
pub struct MemorySourceBuffer {
    kind: StreamKind,
    buffer: Arc<Mutex<BufferState>>,
    sink: Arc<Mutex<SinkState>>,
    events: mpsc::UnboundedSender<SinkEvent>,
}

impl MemorySourceBuffer {
    /// Appending after end of stream re-opens the sink
    fn reopen_if_ended(&self) -> Result<()> {
        let mut sink = lock(&self.sink);
        match sink.ready_state {
            ReadyState::Open => Ok(()),
            ReadyState::Ended => {
                sink.ready_state = ReadyState::Open;
                drop(sink);
                debug!(stream = %self.kind, "Sink re-opened by append");
                let _ = self.events.send(SinkEvent::SourceOpen);
                Ok(())
            }
            ReadyState::Closed => Err(Error::SinkState("sink is closed".into())),
        }
    }

    fn finish(&self) {
        let _ = self.events.send(SinkEvent::UpdateEnd(self.kind));
    }
}

impl SourceBuffer for MemorySourceBuffer {
    fn updating(&self) -> bool {
        false
    }

    fn append(&mut self, data: Bytes, span: Option<TimeRange>) -> Result<()> {
        {
            let buffer = lock(&self.buffer);
            if !buffer.attached {
                return Err(Error::SinkState(format!("{} source buffer detached", self.kind)));
            }
            let size = data.len() as u64;
            if buffer.used().saturating_add(size) > buffer.capacity {
                warn!(
                    stream = %self.kind,
                    used = buffer.used(),
                    size,
                    capacity = buffer.capacity,
                    "Sink buffer full"
                );
                return Err(Error::QuotaExceeded);
            }
        }
        self.reopen_if_ended()?;

        let mut buffer = lock(&self.buffer);
        buffer.chunks.push(Chunk {
            span,
            bytes: data.len() as u64,
        });
        buffer.appends += 1;
        drop(buffer);
        self.finish();
        Ok(())
    }

    fn remove(&mut self, range: TimeRange) -> Result<()> {
        let mut buffer = lock(&self.buffer);
        if !buffer.attached {
            return Err(Error::SinkState(format!("{} source buffer detached", self.kind)));
        }
        buffer
            .chunks
            .retain(|c| c.span.map_or(true, |span| !span.overlaps(&range)));
        buffer.removes += 1;
        drop(buffer);
        self.finish();
        Ok(())
    }

    fn abort(&mut self) {
        lock(&self.buffer).aborts += 1;
    }

    fn buffered(&self) -> Vec<TimeRange> {
        buffered_of(&lock(&self.buffer))
    }
}
