//! Segment index parsing for ISO-BMFF and WebM
//!
//! Both container families describe the same thing: an ordered table of
//! segments, each with a byte range in the resource and a time range in
//! index ticks. The parsers in this module reduce a `sidx` box or a `Cues`
//! element to that uniform [`SegmentIndex`].

pub mod cues;
pub mod ebml;
pub mod sidx;

pub use cues::{parse_cues, parse_webm_init, WebmInit};
pub use sidx::{parse_sidx, SidxBox};

use crate::{
    types::{IndexFormat, InclusiveRange, StreamSource, TimeRange},
    Error, Result,
};
use serde::Serialize;

/// One segment of an elementary stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentEntry {
    /// First byte, inclusive
    pub byte_start: u64,
    /// Last byte, inclusive
    pub byte_end: u64,
    /// First tick, inclusive
    pub tick_start: u64,
    /// Last tick, inclusive
    pub tick_end: u64,
    /// `byte_end - byte_start + 1`
    pub referenced_size: u64,
    /// `tick_end - tick_start + 1`
    pub sub_segment_duration: u64,
    /// Bytes believed resident in the sink
    pub have: bool,
    /// Fetch outstanding, or completed while `have` still holds
    pub requested: bool,
}

impl SegmentEntry {
    pub fn new(byte_start: u64, byte_end: u64, tick_start: u64, tick_end: u64) -> Self {
        Self {
            byte_start,
            byte_end,
            tick_start,
            tick_end,
            referenced_size: byte_end.saturating_sub(byte_start).saturating_add(1),
            sub_segment_duration: tick_end.saturating_sub(tick_start).saturating_add(1),
            have: false,
            requested: false,
        }
    }

    pub fn byte_range(&self) -> InclusiveRange {
        InclusiveRange::new(self.byte_start, self.byte_end)
    }

    /// Forget residency after an eviction
    pub fn demote(&mut self) {
        self.have = false;
        self.requested = false;
    }
}

/// Ordered segment table for one stream
///
/// Built once; entries' `have`/`requested` flags change afterwards but the
/// table is never resized or reordered.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentIndex {
    /// Ticks per second
    time_scale: f64,
    entries: Vec<SegmentEntry>,
}

impl SegmentIndex {
    pub fn new(time_scale: f64, entries: Vec<SegmentEntry>) -> Self {
        Self { time_scale, entries }
    }

    pub fn time_scale(&self) -> f64 {
        self.time_scale
    }

    pub fn entries(&self) -> &[SegmentEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&SegmentEntry> {
        self.entries.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut SegmentEntry> {
        self.entries.get_mut(idx)
    }

    pub fn last_index(&self) -> Option<usize> {
        self.entries.len().checked_sub(1)
    }

    /// Total covered duration in seconds
    pub fn duration(&self) -> f64 {
        self.entries
            .last()
            .map(|e| (e.tick_end + 1) as f64 / self.time_scale)
            .unwrap_or(0.0)
    }

    /// Playback span of an entry in seconds, end exclusive
    pub fn time_range(&self, idx: usize) -> Option<TimeRange> {
        self.entries.get(idx).map(|e| {
            TimeRange::new(
                e.tick_start as f64 / self.time_scale,
                (e.tick_end + 1) as f64 / self.time_scale,
            )
        })
    }

    /// Index of the entry whose tick range contains `time` (seconds)
    ///
    /// Starts from an estimate based on the first entry's duration and
    /// walks towards the target. Times before zero map to the first entry
    /// and times past the end to the last one.
    pub fn locate(&self, time: f64) -> Result<usize> {
        let last = self.last_index().ok_or(Error::SegmentNotFound { time })?;
        if !time.is_finite() {
            return Err(Error::SegmentNotFound { time });
        }

        let tick = (time.max(0.0) * self.time_scale).floor() as u64;
        if tick > self.entries[last].tick_end {
            return Ok(last);
        }

        let first_duration = self.entries[0].sub_segment_duration.max(1);
        let estimate = 1u64.saturating_add(tick / first_duration);
        let mut index = estimate.min(last as u64) as usize;

        let step_down = tick < self.entries[index].tick_start;
        loop {
            let entry = &self.entries[index];
            if entry.tick_start <= tick && tick <= entry.tick_end {
                return Ok(index);
            }
            if step_down {
                if index == 0 {
                    break;
                }
                index -= 1;
            } else {
                if index == last {
                    break;
                }
                index += 1;
            }
        }
        Err(Error::SegmentNotFound { time })
    }

    /// True when entries tile byte and tick space without gaps or overlaps
    pub fn is_contiguous(&self) -> bool {
        self.entries.windows(2).all(|pair| {
            pair[0].byte_end.checked_add(1) == Some(pair[1].byte_start)
                && pair[0].tick_end.checked_add(1) == Some(pair[1].tick_start)
        })
    }

    /// Sum of `referenced_size` over entries marked `have`
    pub fn resident_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.have)
            .fold(0u64, |acc, e| acc.saturating_add(e.referenced_size))
    }
}

/// Decode a stream's index bytes into a segment table
///
/// `init` is only consulted for WebM, where the initialization segment
/// carries the timescale, the duration and the Segment data offset.
pub fn parse_index(source: &StreamSource, init: &[u8], index: &[u8]) -> Result<SegmentIndex> {
    match source.index_format() {
        Some(IndexFormat::Sidx) => {
            let sidx = parse_sidx(index)?;
            Ok(sidx.into_index(source.index_range.end.saturating_add(1)))
        }
        Some(IndexFormat::Cues) => {
            let webm = parse_webm_init(init, source.init_range.start)?;
            parse_cues(index, source.index_range.start, &webm, source.file_size)
        }
        None => Err(Error::UnsupportedCodec {
            codec: source.mime_codec.clone(),
        }),
    }
}
