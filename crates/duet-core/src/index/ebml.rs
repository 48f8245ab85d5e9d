//! Push-style EBML reader
//!
//! Bytes are fed in with [`EbmlReader::push`] as they arrive and events are
//! pulled out with [`EbmlReader::next_event`]. Containers produce a
//! [`EbmlEvent::Start`] as soon as their header is read; leaf elements
//! produce a single [`EbmlEvent::Tag`] once their whole payload is buffered;
//! [`EbmlEvent::End`] follows the last byte of every sized container.

use crate::{Error, Result};
use std::collections::VecDeque;

/// Value part of a variable-length integer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VintValue {
    Known(u64),
    /// All value bits set: the reserved "unknown size" marker
    Unknown,
}

/// A decoded variable-length integer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vint {
    /// Encoded length in bytes (1..=8)
    pub length: usize,
    pub value: VintValue,
}

/// Decode the vint at the start of `data`
///
/// Returns `Ok(None)` when more bytes are needed. With `keep_marker` the
/// length-marker bit stays in the value, which is how element IDs are
/// conventionally written.
pub fn read_vint(data: &[u8], keep_marker: bool) -> Result<Option<Vint>> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };
    if first == 0 {
        return Err(Error::InvalidVint { offset: 0 });
    }
    let length = first.leading_zeros() as usize + 1;
    if data.len() < length {
        return Ok(None);
    }

    let marker = 0x80u8 >> (length - 1);
    let head = if keep_marker { first } else { first & !marker };
    let raw = data[1..length]
        .iter()
        .fold(u64::from(head), |acc, &b| (acc << 8) | u64::from(b));

    let value_bits = 7 * length as u32;
    let all_ones = (1u64 << value_bits) - 1;
    let value = if !keep_marker && raw == all_ones {
        VintValue::Unknown
    } else {
        VintValue::Known(raw)
    };
    Ok(Some(Vint { length, value }))
}

/// How an element's payload is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Container,
    Unsigned,
    Float,
    Unknown,
}

/// Element IDs used while reading WebM initialization and index data
pub mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const SEGMENT: u32 = 0x1853_8067;
    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_POSITION: u32 = 0x53AC;
    pub const INFO: u32 = 0x1549_A966;
    pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
    pub const DURATION: u32 = 0x4489;
    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
    pub const CUE_RELATIVE_POSITION: u32 = 0xF0;
    pub const CUE_DURATION: u32 = 0xB2;
    pub const CUE_BLOCK_NUMBER: u32 = 0x5378;
}

const SCHEMA: &[(u32, &str, ElementKind)] = &[
    (ids::EBML, "EBML", ElementKind::Container),
    (ids::SEGMENT, "Segment", ElementKind::Container),
    (ids::SEEK_HEAD, "SeekHead", ElementKind::Container),
    (ids::SEEK, "Seek", ElementKind::Container),
    (ids::SEEK_POSITION, "SeekPosition", ElementKind::Unsigned),
    (ids::INFO, "Info", ElementKind::Container),
    (ids::TIMECODE_SCALE, "TimecodeScale", ElementKind::Unsigned),
    (ids::DURATION, "Duration", ElementKind::Float),
    (ids::TRACKS, "Tracks", ElementKind::Container),
    (ids::CLUSTER, "Cluster", ElementKind::Container),
    (ids::CUES, "Cues", ElementKind::Container),
    (ids::CUE_POINT, "CuePoint", ElementKind::Container),
    (ids::CUE_TIME, "CueTime", ElementKind::Unsigned),
    (ids::CUE_TRACK_POSITIONS, "CueTrackPositions", ElementKind::Container),
    (ids::CUE_TRACK, "CueTrack", ElementKind::Unsigned),
    (ids::CUE_CLUSTER_POSITION, "CueClusterPosition", ElementKind::Unsigned),
    (ids::CUE_RELATIVE_POSITION, "CueRelativePosition", ElementKind::Unsigned),
    (ids::CUE_DURATION, "CueDuration", ElementKind::Unsigned),
    (ids::CUE_BLOCK_NUMBER, "CueBlockNumber", ElementKind::Unsigned),
];

/// Name and kind for an element ID
pub fn lookup(id: u32) -> (&'static str, ElementKind) {
    SCHEMA
        .iter()
        .find(|(known, _, _)| *known == id)
        .map(|&(_, name, kind)| (name, kind))
        .unwrap_or(("unknown", ElementKind::Unknown))
}

/// Big-endian unsigned payload
pub fn decode_unsigned(data: &[u8]) -> Result<u64> {
    if data.len() > 8 {
        return Err(Error::IndexParse(format!("{}-byte unsigned integer", data.len())));
    }
    Ok(data.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

/// Float payload; the field width decides single or double precision
pub fn decode_float(data: &[u8]) -> Result<f64> {
    match data.len() {
        0 => Ok(0.0),
        4 => Ok(f64::from(f32::from_be_bytes([data[0], data[1], data[2], data[3]]))),
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(data);
            Ok(f64::from_be_bytes(raw))
        }
        n => Err(Error::IndexParse(format!("{n}-byte float"))),
    }
}

/// One step of the element walk
#[derive(Debug, Clone, PartialEq)]
pub enum EbmlEvent {
    Start {
        id: u32,
        name: &'static str,
        /// Absolute offset of the element's first header byte
        offset: u64,
        /// Absolute offset of the first payload byte
        data_offset: u64,
        /// Payload size, `None` for unknown-size containers
        size: Option<u64>,
    },
    Tag {
        id: u32,
        name: &'static str,
        kind: ElementKind,
        offset: u64,
        data: Vec<u8>,
    },
    End {
        id: u32,
        name: &'static str,
    },
}

#[derive(Debug)]
struct OpenContainer {
    id: u32,
    name: &'static str,
    end: Option<u64>,
}

/// Incremental EBML element reader
#[derive(Debug)]
pub struct EbmlReader {
    buf: Vec<u8>,
    /// Read position within `buf`
    pos: usize,
    /// Absolute offset of `buf[0]`
    base: u64,
    stack: Vec<OpenContainer>,
    pending: VecDeque<EbmlEvent>,
}

impl EbmlReader {
    /// `base_offset` is the absolute resource offset of the first pushed byte
    pub fn new(base_offset: u64) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            base: base_offset,
            stack: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.pos > 0 && self.pos == self.buf.len() {
            self.base += self.pos as u64;
            self.buf.clear();
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Absolute offset of the next unread byte
    pub fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Bytes held back waiting for the rest of an element
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Names of the containers currently open, outermost first
    pub fn path(&self) -> Vec<&'static str> {
        self.stack.iter().map(|c| c.name).collect()
    }

    /// Next event, or `Ok(None)` when more input is required
    pub fn next_event(&mut self) -> Result<Option<EbmlEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        let data = &self.buf[self.pos..];
        let offset = self.offset();
        let header_error = |e: Error| match e {
            Error::InvalidVint { offset: rel } => Error::InvalidVint {
                offset: (offset as usize).saturating_add(rel),
            },
            other => other,
        };

        let Some(id) = read_vint(data, true).map_err(header_error)? else {
            return Ok(None);
        };
        if id.length > 4 {
            return Err(Error::InvalidVint { offset: offset as usize });
        }
        let Some(size) = read_vint(&data[id.length..], false).map_err(header_error)? else {
            return Ok(None);
        };
        let header_len = id.length + size.length;
        let VintValue::Known(id_value) = id.value else {
            return Err(Error::InvalidVint { offset: offset as usize });
        };
        let id_value = id_value as u32;
        let (name, kind) = lookup(id_value);
        let data_offset = offset + header_len as u64;

        let event = match (kind, size.value) {
            (ElementKind::Container, VintValue::Known(len)) => {
                self.pos += header_len;
                self.stack.push(OpenContainer {
                    id: id_value,
                    name,
                    end: Some(data_offset + len),
                });
                EbmlEvent::Start {
                    id: id_value,
                    name,
                    offset,
                    data_offset,
                    size: Some(len),
                }
            }
            (ElementKind::Container, VintValue::Unknown) => {
                self.pos += header_len;
                self.stack.push(OpenContainer {
                    id: id_value,
                    name,
                    end: None,
                });
                EbmlEvent::Start {
                    id: id_value,
                    name,
                    offset,
                    data_offset,
                    size: None,
                }
            }
            (_, VintValue::Unknown) => {
                return Err(Error::IndexParse(format!(
                    "{name} (0x{id_value:X}) at {offset} has unknown size"
                )));
            }
            (_, VintValue::Known(len)) => {
                let Ok(len) = usize::try_from(len) else {
                    return Err(Error::IndexParse(format!("{name} payload too large")));
                };
                if data.len() < header_len + len {
                    return Ok(None);
                }
                let payload = data[header_len..header_len + len].to_vec();
                self.pos += header_len + len;
                EbmlEvent::Tag {
                    id: id_value,
                    name,
                    kind,
                    offset,
                    data: payload,
                }
            }
        };

        self.close_finished();
        Ok(Some(event))
    }

    /// Queue `End` events for every container whose extent is consumed
    fn close_finished(&mut self) {
        let here = self.offset();
        while self
            .stack
            .last()
            .is_some_and(|top| top.end.is_some_and(|end| end <= here))
        {
            if let Some(closed) = self.stack.pop() {
                self.pending.push_back(EbmlEvent::End {
                    id: closed.id,
                    name: closed.name,
                });
            }
        }
    }

    /// Drain every event available from the bytes pushed so far
    pub fn drain(&mut self) -> Result<Vec<EbmlEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event()? {
            events.push(event);
        }
        Ok(events)
    }
}
