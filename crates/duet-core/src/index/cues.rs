//! WebM segment index built from the `Cues` element

use super::{
    ebml::{decode_float, decode_unsigned, ids, EbmlEvent, EbmlReader},
    SegmentEntry, SegmentIndex,
};
use crate::{types::InclusiveRange, Error, Result};
use tracing::{debug, warn};

/// Default `TimecodeScale`: one tick per millisecond
pub const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

/// Facts taken from the initialization segment
#[derive(Debug, Clone, PartialEq)]
pub struct WebmInit {
    /// Nanoseconds per tick
    pub timecode_scale: u64,
    /// Duration in ticks, stored by the muxer as a float
    pub duration: Option<f64>,
    /// Absolute offset of the Segment payload; cluster positions are relative to it
    pub cues_offset: u64,
}

impl WebmInit {
    /// Ticks per second
    pub fn time_scale(&self) -> f64 {
        1e9 / self.timecode_scale as f64
    }

    /// Duration rounded to whole ticks
    pub fn duration_ticks(&self) -> Option<u64> {
        self.duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d.round() as u64)
    }
}

/// Walk the initialization segment for timescale, duration and Segment offset
///
/// `base_offset` is the resource offset of `data[0]`.
pub fn parse_webm_init(data: &[u8], base_offset: u64) -> Result<WebmInit> {
    let mut reader = EbmlReader::new(base_offset);
    reader.push(data);

    let mut timecode_scale = None;
    let mut duration = None;
    let mut cues_offset = None;

    loop {
        let event = match reader.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, offset = reader.offset(), "Stopping init segment walk");
                break;
            }
        };
        match event {
            EbmlEvent::Start { id: ids::SEGMENT, data_offset, .. } => {
                cues_offset.get_or_insert(data_offset);
            }
            EbmlEvent::Tag { id: ids::TIMECODE_SCALE, data, .. } => match decode_unsigned(&data) {
                Ok(scale) => timecode_scale = Some(scale),
                Err(e) => warn!(error = %e, "Unreadable TimecodeScale, using default"),
            },
            EbmlEvent::Tag { id: ids::DURATION, data, .. } => match decode_float(&data) {
                Ok(value) => duration = Some(value),
                Err(e) => warn!(error = %e, "Unreadable Duration, ignored"),
            },
            // Media data begins; nothing further of interest
            EbmlEvent::Start { id: ids::CLUSTER, .. } => break,
            _ => {}
        }
    }

    let cues_offset =
        cues_offset.ok_or_else(|| Error::IndexParse("no Segment element in init data".into()))?;
    let timecode_scale = match timecode_scale {
        Some(0) => {
            warn!("TimecodeScale of zero, using default");
            DEFAULT_TIMECODE_SCALE
        }
        Some(scale) => scale,
        None => DEFAULT_TIMECODE_SCALE,
    };
    if duration.is_none() {
        warn!("init segment has no Duration");
    }

    debug!(timecode_scale, ?duration, cues_offset, "Parsed WebM init");
    Ok(WebmInit {
        timecode_scale,
        duration,
        cues_offset,
    })
}

#[derive(Debug, Default)]
struct PendingCue {
    time: Option<u64>,
    position: Option<u64>,
}

/// Build the segment table from a `Cues` element
///
/// `index_offset` is the resource offset of `data[0]`. Each entry's end is
/// filled in when the following cue point is read; the last entry ends at
/// the stream duration and the end of the file.
pub fn parse_cues(
    data: &[u8],
    index_offset: u64,
    init: &WebmInit,
    file_size: Option<u64>,
) -> Result<SegmentIndex> {
    let mut reader = EbmlReader::new(index_offset);
    reader.push(data);

    let mut entries: Vec<SegmentEntry> = Vec::new();
    let mut cue: Option<PendingCue> = None;
    let mut saw_cues = false;

    loop {
        let event = match reader.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, offset = reader.offset(), "Stopping Cues walk");
                break;
            }
        };
        match event {
            EbmlEvent::Start { id: ids::CUES, .. } => saw_cues = true,
            EbmlEvent::Start { id: ids::CUE_POINT, .. } => cue = Some(PendingCue::default()),
            EbmlEvent::Tag { id: ids::CUE_TIME, data, .. } => {
                if let Some(cue) = cue.as_mut() {
                    match decode_unsigned(&data) {
                        Ok(time) => cue.time = Some(time),
                        Err(e) => {
                            warn!(error = %e, parsed = entries.len(), "Unreadable CueTime, stopping Cues walk");
                            break;
                        }
                    }
                }
            }
            EbmlEvent::Tag { id: ids::CUE_CLUSTER_POSITION, data, .. } => {
                // Only the first track's position matters for a single-track stream
                if let Some(cue) = cue.as_mut().filter(|c| c.position.is_none()) {
                    match decode_unsigned(&data) {
                        Ok(position) => cue.position = Some(position),
                        Err(e) => {
                            warn!(
                                error = %e,
                                parsed = entries.len(),
                                "Unreadable CueClusterPosition, stopping Cues walk"
                            );
                            break;
                        }
                    }
                }
            }
            EbmlEvent::End { id: ids::CUE_POINT, .. } => {
                if let Some(done) = cue.take() {
                    push_cue(&mut entries, done, init.cues_offset);
                }
            }
            _ => {}
        }
    }

    if !saw_cues {
        return Err(Error::IndexParse("index range holds no Cues element".into()));
    }
    if reader.buffered() > 0 || !reader.path().is_empty() {
        warn!(
            parsed = entries.len(),
            leftover = reader.buffered(),
            "Cues element is cut off"
        );
    }

    if let Some(last) = entries.len().checked_sub(1) {
        let (byte_start, tick_start) = (entries[last].byte_start, entries[last].tick_start);
        let tick_end = match init.duration_ticks() {
            Some(total) if total > tick_start => total - 1,
            _ => {
                let previous = last
                    .checked_sub(1)
                    .map(|i| entries[i].sub_segment_duration)
                    .unwrap_or(1);
                warn!(
                    estimate = previous,
                    "No usable Duration, reusing previous cue length for the last entry"
                );
                tick_start.saturating_add(previous) - 1
            }
        };
        let byte_end = match file_size {
            Some(size) if size > byte_start => size - 1,
            _ => InclusiveRange::OPEN_END,
        };
        entries[last] = SegmentEntry::new(byte_start, byte_end, tick_start, tick_end);
    }

    debug!(entries = entries.len(), "Parsed Cues");
    Ok(SegmentIndex::new(init.time_scale(), entries))
}

fn push_cue(entries: &mut Vec<SegmentEntry>, cue: PendingCue, cues_offset: u64) {
    let (Some(time), Some(position)) = (cue.time, cue.position) else {
        warn!(?cue, "CuePoint without time or cluster position, skipped");
        return;
    };
    let Some(byte_start) = cues_offset.checked_add(position) else {
        warn!(position, "CueClusterPosition out of range, skipped");
        return;
    };

    if let Some(prev) = entries.last_mut() {
        if time <= prev.tick_start || byte_start <= prev.byte_start {
            warn!(time, byte_start, "CuePoint out of order, skipped");
            return;
        }
        *prev = SegmentEntry::new(prev.byte_start, byte_start - 1, prev.tick_start, time - 1);
    }
    // End fields are provisional until the next cue point or the end of the walk
    entries.push(SegmentEntry::new(byte_start, byte_start, time, time));
}
