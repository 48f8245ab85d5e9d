//! Per-stream buffering state machine
//!
//! A [`StreamBufferController`] owns one stream's segment index and source
//! buffer. It never performs I/O itself: fetches it wants are queued as
//! [`FetchRequest`]s for the caller to run, and their results come back
//! through [`StreamBufferController::on_fetch_complete`]. Sink completion
//! notifications arrive through [`StreamBufferController::on_update_end`].
//!
//! At most one mutating sink operation is outstanding at a time. The
//! current one lives in a single operation slot; appends arriving while the
//! slot is occupied wait in the append queue, and an eviction chain holds
//! the slot until its last removal has finished.

use crate::{
    config::EngineConfig,
    index::{parse_index, SegmentEntry, SegmentIndex},
    sink::SourceBuffer,
    types::{InclusiveRange, StreamKind, StreamSource, TimeRange},
    Error, Result,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// What a fetch is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchTarget {
    /// Initialization and index data in one adjacent range
    Header,
    Init,
    Index,
    Segment(usize),
}

/// A range fetch the controller wants performed
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub kind: StreamKind,
    pub target: FetchTarget,
    pub url: Url,
    pub range: InclusiveRange,
    /// Seek generation the request was issued in
    pub generation: u64,
    /// Cancelled when the result is no longer wanted
    pub cancel: CancellationToken,
}

/// A finished fetch, handed back to the controller that asked for it
#[derive(Debug)]
pub struct FetchDone {
    pub request: FetchRequest,
    pub result: Result<Bytes>,
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    /// Waiting for initialization and index data
    Loading,
    Ready,
    /// A terminal error stopped this stream
    Failed,
    Closed,
}

/// Result of a buffer check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCheck {
    /// No segment index yet, or the stream has stopped
    NotReady,
    /// A fetch for this segment was queued
    Requested(usize),
    /// This segment is the next one needed and is already on its way
    Waiting(usize),
    /// Enough is buffered ahead of the playhead
    Full,
    /// Every segment from the playhead through the last is resident
    EndOfStream,
}

#[derive(Debug)]
struct PendingAppend {
    /// `None` for initialization data
    entry: Option<usize>,
    data: Bytes,
}

#[derive(Debug, Default)]
enum Operation {
    #[default]
    Idle,
    Append {
        entry: Option<usize>,
    },
    Evict {
        victims: VecDeque<usize>,
        evicted: usize,
        pending: PendingAppend,
    },
}

/// Snapshot of a controller for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub kind: StreamKind,
    pub phase: Phase,
    pub segments: usize,
    pub have: usize,
    pub requested: usize,
    pub resident_bytes: u64,
    pub buffer_target: u64,
    pub queue_depth: usize,
    pub generation: u64,
}

/// Buffering engine for one elementary stream
pub struct StreamBufferController {
    kind: StreamKind,
    source: StreamSource,
    buffer: Box<dyn SourceBuffer>,
    config: EngineConfig,
    phase: Phase,
    index: Option<SegmentIndex>,
    init_data: Option<Bytes>,
    /// Byte budget ahead of the playhead; only ever shrinks
    buffer_target: u64,
    append_queue: VecDeque<PendingAppend>,
    operation: Operation,
    append_retries: u32,
    generation: u64,
    lifetime: CancellationToken,
    segment_token: CancellationToken,
    outbox: Vec<FetchRequest>,
}

impl std::fmt::Debug for StreamBufferController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBufferController")
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("buffer_target", &self.buffer_target)
            .field("queue_depth", &self.append_queue.len())
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl StreamBufferController {
    pub fn new(source: StreamSource, buffer: Box<dyn SourceBuffer>, config: &EngineConfig) -> Self {
        let kind = source.kind();
        let lifetime = CancellationToken::new();
        let segment_token = lifetime.child_token();
        Self {
            kind,
            source,
            buffer,
            config: config.clone(),
            phase: Phase::Created,
            index: None,
            init_data: None,
            buffer_target: config.buffer_target(kind),
            append_queue: VecDeque::new(),
            operation: Operation::Idle,
            append_retries: 0,
            generation: 0,
            lifetime,
            segment_token,
            outbox: Vec::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn source(&self) -> &StreamSource {
        &self.source
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn index(&self) -> Option<&SegmentIndex> {
        self.index.as_ref()
    }

    pub fn buffer_target(&self) -> u64 {
        self.buffer_target
    }

    pub fn queue_depth(&self) -> usize {
        self.append_queue.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while a sink operation is outstanding
    pub fn is_busy(&self) -> bool {
        !matches!(self.operation, Operation::Idle) || self.buffer.updating()
    }

    /// Fetches queued since the last call
    pub fn take_fetch_requests(&mut self) -> Vec<FetchRequest> {
        std::mem::take(&mut self.outbox)
    }

    pub fn stats(&self) -> ControllerStats {
        let entries = self.index.as_ref().map(|i| i.entries()).unwrap_or_default();
        ControllerStats {
            kind: self.kind,
            phase: self.phase,
            segments: entries.len(),
            have: entries.iter().filter(|e| e.have).count(),
            requested: entries.iter().filter(|e| e.requested).count(),
            resident_bytes: self.index.as_ref().map_or(0, |i| i.resident_bytes()),
            buffer_target: self.buffer_target,
            queue_depth: self.append_queue.len(),
            generation: self.generation,
        }
    }

    /// Queue the initialization and index fetches
    ///
    /// Byte-adjacent ranges go out as one request. Otherwise the index is
    /// requested only once the initialization data has arrived.
    #[instrument(skip(self), fields(stream = %self.kind))]
    pub fn initialize(&mut self) {
        if self.phase != Phase::Created {
            warn!(phase = ?self.phase, "Stream already initialized");
            return;
        }
        self.phase = Phase::Loading;

        let (init, index) = (self.source.init_range, self.source.index_range);
        let token = self.lifetime.child_token();
        if init.is_adjacent_to(&index) {
            let range = InclusiveRange::new(init.start, index.end);
            debug!(range = %range, "Fetching init and index together");
            self.request(FetchTarget::Header, range, token);
        } else {
            debug!(init = %init, index = %index, "Fetching init, then index");
            self.request(FetchTarget::Init, init, token);
        }
    }

    /// Segment containing `time`, or the first segment if none does
    pub fn locate_segment_index(&self, time: f64) -> usize {
        let Some(index) = &self.index else {
            return 0;
        };
        index.locate(time).unwrap_or_else(|e| {
            error!(stream = %self.kind, error = %e, "Segment lookup failed, using first segment");
            0
        })
    }

    /// Walk forward from the playhead and request the next segment if the
    /// bytes buffered ahead are under target
    #[instrument(skip(self), fields(stream = %self.kind))]
    pub fn check_buffer(&mut self, position: f64) -> BufferCheck {
        if self.phase != Phase::Ready {
            return BufferCheck::NotReady;
        }
        let Some(last) = self.index.as_ref().and_then(|i| i.last_index()) else {
            return BufferCheck::NotReady;
        };

        let ranges = self.buffer.buffered();
        let mut ahead = 0u64;
        let mut idx = self.locate_segment_index(position);
        while idx <= last {
            self.reconcile(idx, &ranges);
            let Some(entry) = self.entry(idx) else {
                break;
            };
            if !entry.have {
                break;
            }
            ahead = ahead.saturating_add(entry.referenced_size);
            if ahead > self.buffer_target {
                return if idx == last {
                    BufferCheck::EndOfStream
                } else {
                    BufferCheck::Full
                };
            }
            idx += 1;
        }

        if idx > last {
            return BufferCheck::EndOfStream;
        }
        if self.entry(idx).is_some_and(|e| e.requested) {
            return BufferCheck::Waiting(idx);
        }
        self.fetch_segment(idx);
        BufferCheck::Requested(idx)
    }

    /// Make sure the segment under the new playhead is resident or on its way
    #[instrument(skip(self), fields(stream = %self.kind))]
    pub fn handle_seek(&mut self, position: f64) {
        if self.phase != Phase::Ready {
            debug!(phase = ?self.phase, "Seek before segment index is ready");
            return;
        }
        if self.config.discard_stale_fetches {
            self.discard_in_flight();
        }
        let idx = self.locate_segment_index(position);
        self.fetch_segment_if_needed(idx);
    }

    /// Stop the stream: later fetch results are dropped and any sink
    /// operation in progress is aborted
    #[instrument(skip(self), fields(stream = %self.kind))]
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        if self.is_busy() {
            self.buffer.abort();
        }
        self.phase = Phase::Closed;
        self.lifetime.cancel();
        self.operation = Operation::Idle;
        self.append_queue.clear();
        self.outbox.clear();
        info!("Stream closed");
    }

    /// Route a finished fetch
    #[instrument(skip(self, done), fields(stream = %self.kind, target = ?done.request.target))]
    pub fn on_fetch_complete(&mut self, done: FetchDone, position: f64) {
        let FetchDone { request, result } = done;
        if self.phase == Phase::Closed {
            debug!("Stream closed, dropping fetched data");
            return;
        }
        if matches!(request.target, FetchTarget::Segment(_)) && request.generation != self.generation {
            debug!(
                issued = request.generation,
                current = self.generation,
                "Dropping segment fetched before seek"
            );
            return;
        }

        let data = match result {
            Ok(data) => data,
            Err(e) => return self.fetch_failed(request.target, e),
        };

        match request.target {
            FetchTarget::Header => {
                let base = self.source.init_range.start;
                let init_end = clamp_offset(self.source.init_range.end - base + 1, &data);
                let index_start = clamp_offset(self.source.index_range.start - base, &data);
                let index_end = clamp_offset(self.source.index_range.end - base + 1, &data);
                let init = data.slice(..init_end);
                let index = data.slice(index_start..index_end.max(index_start));
                self.append_segment(None, init.clone(), position);
                self.init_data = Some(init);
                self.setup_segments(&index);
            }
            FetchTarget::Init => {
                self.append_segment(None, data.clone(), position);
                self.init_data = Some(data);
                let token = self.lifetime.child_token();
                self.request(FetchTarget::Index, self.source.index_range, token);
            }
            FetchTarget::Index => self.setup_segments(&data),
            FetchTarget::Segment(idx) => self.append_segment(Some(idx), data, position),
        }
    }

    /// Hand bytes to the sink, or queue them while the sink is busy
    pub fn append_segment(&mut self, entry: Option<usize>, data: Bytes, position: f64) {
        if self.phase == Phase::Closed {
            return;
        }
        let pending = PendingAppend { entry, data };
        if self.is_busy() {
            self.append_queue.push_back(pending);
            debug!(
                stream = %self.kind,
                segment = ?entry,
                queued = self.append_queue.len(),
                "Sink busy, queueing append"
            );
            if self.append_queue.len() > self.config.append_queue_warn_depth {
                warn!(
                    stream = %self.kind,
                    depth = self.append_queue.len(),
                    "Append queue is backing up"
                );
            }
            return;
        }
        self.try_append(pending, position);
    }

    /// The sink finished the outstanding operation
    pub fn on_update_end(&mut self, position: f64) {
        if self.phase == Phase::Closed {
            return;
        }
        match std::mem::take(&mut self.operation) {
            Operation::Idle => {}
            Operation::Append { entry } => {
                debug!(stream = %self.kind, segment = ?entry, "Append finished");
            }
            chain @ Operation::Evict { .. } => {
                self.operation = chain;
                self.remove_next(position);
            }
        }
        while !self.is_busy() {
            let Some(next) = self.append_queue.pop_front() else {
                break;
            };
            self.try_append(next, position);
        }
    }

    /// Eviction candidates under capacity pressure
    ///
    /// Resident segments before the playhead come first, oldest first, then
    /// resident segments after it, farthest first. The playhead segment is
    /// never a candidate.
    pub fn select_victims(&self, playhead: usize) -> Vec<usize> {
        let Some(index) = &self.index else {
            return Vec::new();
        };
        let len = index.len();
        (0..playhead.min(len))
            .chain((playhead.saturating_add(1)..len).rev())
            .filter(|&i| index.get(i).is_some_and(|e| e.have))
            .take(self.config.max_evictions)
            .collect()
    }

    fn request(&mut self, target: FetchTarget, range: InclusiveRange, cancel: CancellationToken) {
        self.outbox.push(FetchRequest {
            kind: self.kind,
            target,
            url: self.source.url.clone(),
            range,
            generation: self.generation,
            cancel,
        });
    }

    fn entry(&self, idx: usize) -> Option<&SegmentEntry> {
        self.index.as_ref()?.get(idx)
    }

    fn entry_mut(&mut self, idx: usize) -> Option<&mut SegmentEntry> {
        self.index.as_mut()?.get_mut(idx)
    }

    fn setup_segments(&mut self, index_data: &[u8]) {
        let init = self.init_data.clone().unwrap_or_default();
        match parse_index(&self.source, &init, index_data) {
            Ok(index) if !index.is_empty() => {
                info!(
                    stream = %self.kind,
                    segments = index.len(),
                    duration = index.duration(),
                    contiguous = index.is_contiguous(),
                    "Segment index ready"
                );
                self.index = Some(index);
                self.phase = Phase::Ready;
                let first = self.locate_segment_index(self.config.start_time);
                self.fetch_segment_if_needed(first);
            }
            Ok(_) => {
                error!(stream = %self.kind, "Segment index has no entries");
                self.phase = Phase::Failed;
            }
            Err(e) => {
                error!(stream = %self.kind, error = %e, "Could not build segment index");
                self.phase = Phase::Failed;
            }
        }
    }

    fn fetch_failed(&mut self, target: FetchTarget, e: Error) {
        match target {
            FetchTarget::Segment(idx) if !e.is_terminal() => {
                warn!(stream = %self.kind, segment = idx, error = %e, "Segment fetch failed");
                if let Some(entry) = self.entry_mut(idx) {
                    entry.requested = false;
                }
            }
            _ => {
                error!(
                    stream = %self.kind,
                    target = ?target,
                    code = e.error_code(),
                    error = %e,
                    "Fetch failed, stream stopped"
                );
                self.phase = Phase::Failed;
            }
        }
    }

    fn fetch_segment(&mut self, idx: usize) {
        let Some(entry) = self.entry_mut(idx) else {
            return;
        };
        entry.requested = true;
        let range = entry.byte_range();
        debug!(stream = %self.kind, segment = idx, range = %range, "Requesting segment");
        let token = self.segment_token.child_token();
        self.request(FetchTarget::Segment(idx), range, token);
    }

    fn fetch_segment_if_needed(&mut self, idx: usize) {
        if self.entry(idx).is_none() {
            return;
        }
        let ranges = self.buffer.buffered();
        self.reconcile(idx, &ranges);
        if self.entry(idx).is_some_and(|e| e.requested) {
            return;
        }
        self.fetch_segment(idx);
    }

    /// Forget fetches issued before now and let them be requested again
    fn discard_in_flight(&mut self) {
        self.generation += 1;
        self.segment_token.cancel();
        self.segment_token = self.lifetime.child_token();

        let mut discarded = 0;
        if let Some(index) = self.index.as_mut() {
            for idx in 0..index.len() {
                if let Some(entry) = index.get_mut(idx) {
                    if entry.requested && !entry.have {
                        entry.requested = false;
                        discarded += 1;
                    }
                }
            }
        }
        // Fetched but not yet appended data is still wanted
        for pending in &self.append_queue {
            if let Some(entry) = pending.entry.and_then(|i| self.index.as_mut()?.get_mut(i)) {
                entry.requested = true;
            }
        }
        debug!(stream = %self.kind, generation = self.generation, discarded, "Discarded in-flight fetches");
    }

    /// True if the segment's time span lies within the sink's buffered ranges
    fn is_resident(&self, idx: usize, ranges: &[TimeRange]) -> bool {
        let (Some(index), tolerance) = (&self.index, self.config.buffered_tolerance) else {
            return false;
        };
        let Some(entry) = index.get(idx) else {
            return false;
        };
        let start = entry.tick_start as f64 / index.time_scale() + tolerance;
        let end = entry.tick_end as f64 / index.time_scale() - tolerance;
        ranges.iter().any(|r| r.covers(start, end))
    }

    /// Demote a segment believed resident that the sink no longer holds
    ///
    /// The segment being appended right now is left alone: the sink only
    /// reports it once the append finishes.
    fn reconcile(&mut self, idx: usize, ranges: &[TimeRange]) {
        if matches!(self.operation, Operation::Append { entry: Some(current) } if current == idx) {
            return;
        }
        let vanished = self.entry(idx).is_some_and(|e| e.have) && !self.is_resident(idx, ranges);
        if vanished {
            warn!(stream = %self.kind, segment = idx, "Segment evicted externally");
            if let Some(entry) = self.entry_mut(idx) {
                entry.demote();
            }
        }
    }

    fn try_append(&mut self, pending: PendingAppend, position: f64) {
        let span = pending.entry.and_then(|i| self.index.as_ref()?.time_range(i));
        match self.buffer.append(pending.data.clone(), span) {
            Ok(()) => {
                if let Some(entry) = pending.entry.and_then(|i| self.entry_mut(i)) {
                    entry.have = true;
                    entry.requested = true;
                }
                debug!(
                    stream = %self.kind,
                    segment = ?pending.entry,
                    bytes = pending.data.len(),
                    "Appending"
                );
                self.append_retries = 0;
                self.operation = Operation::Append { entry: pending.entry };
            }
            Err(Error::QuotaExceeded) => self.handle_quota_exceeded(pending, position),
            Err(e) => {
                error!(stream = %self.kind, segment = ?pending.entry, error = %e, "Append rejected");
                if let Some(entry) = pending.entry.and_then(|i| self.entry_mut(i)) {
                    entry.requested = false;
                }
            }
        }
    }

    /// Reconcile, shrink the target, then start removing victims
    fn handle_quota_exceeded(&mut self, pending: PendingAppend, position: f64) {
        let Some(len) = self.index.as_ref().map(|i| i.len()) else {
            error!(stream = %self.kind, "Sink full before the segment index was built");
            self.phase = Phase::Failed;
            return;
        };

        let ranges = self.buffer.buffered();
        for idx in 0..len {
            self.reconcile(idx, &ranges);
        }
        let occupancy = self.index.as_ref().map_or(0, |i| i.resident_bytes());
        let shrunk = (occupancy as f64 * self.config.target_shrink_factor) as u64;
        if shrunk > 0 && shrunk < self.buffer_target {
            info!(
                stream = %self.kind,
                from = self.buffer_target,
                to = shrunk,
                "Shrinking buffer target"
            );
            self.buffer_target = shrunk;
        }

        let playhead = self.locate_segment_index(position);
        let victims = self.select_victims(playhead);
        warn!(
            stream = %self.kind,
            segment = ?pending.entry,
            occupancy,
            victims = ?victims,
            "Sink full, evicting"
        );

        if victims.is_empty() {
            self.finish_eviction(pending, 0, position);
            return;
        }
        self.operation = Operation::Evict {
            victims: victims.into(),
            evicted: 0,
            pending,
        };
        self.remove_next(position);
    }

    /// Issue the next removal of the chain, or finish it
    fn remove_next(&mut self, position: f64) {
        loop {
            let Operation::Evict { victims, .. } = &mut self.operation else {
                return;
            };
            let Some(victim) = victims.pop_front() else {
                if let Operation::Evict { evicted, pending, .. } = std::mem::take(&mut self.operation) {
                    self.finish_eviction(pending, evicted, position);
                }
                return;
            };
            let Some(range) = self.index.as_ref().and_then(|i| i.time_range(victim)) else {
                continue;
            };

            match self.buffer.remove(range) {
                Ok(()) => {
                    debug!(
                        stream = %self.kind,
                        segment = victim,
                        start = range.start,
                        end = range.end,
                        "Evicting segment"
                    );
                    if let Some(entry) = self.entry_mut(victim) {
                        entry.demote();
                    }
                    if let Operation::Evict { evicted, .. } = &mut self.operation {
                        *evicted += 1;
                    }
                    return;
                }
                Err(e) => {
                    warn!(stream = %self.kind, segment = victim, error = %e, "Removal rejected");
                }
            }
        }
    }

    /// Retry the append that triggered eviction if it is still needed
    fn finish_eviction(&mut self, pending: PendingAppend, evicted: usize, position: f64) {
        let needed = self.locate_segment_index(position);
        let is_needed = pending.entry.map_or(true, |i| i == needed);

        if evicted > 0 && is_needed && self.append_retries < self.config.max_append_retries {
            self.append_retries += 1;
            debug!(
                stream = %self.kind,
                segment = ?pending.entry,
                attempt = self.append_retries,
                "Retrying append after eviction"
            );
            self.try_append(pending, position);
            return;
        }

        match pending.entry {
            Some(idx) => {
                debug!(stream = %self.kind, segment = idx, evicted, "Dropping append");
                if let Some(entry) = self.entry_mut(idx) {
                    entry.requested = false;
                }
            }
            None => {
                error!(stream = %self.kind, "Initialization data does not fit in the sink");
                self.phase = Phase::Failed;
            }
        }
    }
}

fn clamp_offset(offset: u64, data: &Bytes) -> usize {
    usize::try_from(offset).unwrap_or(usize::MAX).min(data.len())
}
