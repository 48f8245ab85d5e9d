//! ISO-BMFF segment index (`sidx`) box parser

use super::{SegmentEntry, SegmentIndex};
use crate::{reader::ByteReader, Error, Result};
use tracing::{debug, warn};

const BOX_HEADER_LEN: usize = 8;

/// One reference row of a `sidx` box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidxReference {
    /// Set when the reference points at another `sidx` rather than media
    pub reference_type: bool,
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub sap_delta_time: u32,
}

/// Decoded `sidx` box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidxBox {
    pub version: u8,
    pub flags: u32,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    pub first_offset: u64,
    /// Number of references the box declared
    pub declared_count: u16,
    /// References actually present; shorter than declared if truncated
    pub references: Vec<SidxReference>,
}

impl SidxBox {
    pub fn is_truncated(&self) -> bool {
        self.references.len() < self.declared_count as usize
    }

    /// Lay the references out in byte and tick space
    ///
    /// `origin` is the offset of the first byte after the `sidx` box, which
    /// `first_offset` is relative to. References whose byte range would not
    /// fit in a `u64` are dropped along with everything after them.
    pub fn into_index(self, origin: u64) -> SegmentIndex {
        let mut entries = Vec::with_capacity(self.references.len());
        let Some(mut byte_offset) = self.first_offset.checked_add(origin) else {
            warn!(first_offset = self.first_offset, origin, "sidx first_offset overflows");
            return SegmentIndex::new(f64::from(self.timescale), entries);
        };
        let mut tick_offset = 0u64;

        for (i, reference) in self.references.iter().enumerate() {
            let size = u64::from(reference.referenced_size);
            let duration = u64::from(reference.subsegment_duration);
            let (Some(next_byte), Some(next_tick)) =
                (byte_offset.checked_add(size), tick_offset.checked_add(duration))
            else {
                warn!(reference = i, byte_offset, "sidx reference overflows, stopping");
                break;
            };
            entries.push(SegmentEntry::new(
                byte_offset,
                next_byte - 1,
                tick_offset,
                next_tick - 1,
            ));
            byte_offset = next_byte;
            tick_offset = next_tick;
        }

        SegmentIndex::new(f64::from(self.timescale), entries)
    }
}

/// Parse a complete `sidx` box, header included
///
/// A box whose declared size runs past the supplied bytes is parsed as far
/// as the data goes; a warning is logged and the partial table returned.
pub fn parse_sidx(data: &[u8]) -> Result<SidxBox> {
    let mut reader = ByteReader::new(data);
    let declared = reader
        .read_u32()
        .map_err(|e| Error::IndexParse(format!("sidx header: {e}")))? as u64;
    let box_type = reader
        .read_bytes(4)
        .map_err(|e| Error::IndexParse(format!("sidx header: {e}")))?;
    if box_type != b"sidx" {
        return Err(Error::IndexParse(format!(
            "expected sidx box, found {:?}",
            String::from_utf8_lossy(box_type)
        )));
    }

    let mut header_len = BOX_HEADER_LEN as u64;
    let declared = if declared == 1 {
        header_len += 8;
        reader
            .read_u64()
            .map_err(|e| Error::IndexParse(format!("sidx largesize: {e}")))?
    } else if declared == 0 {
        data.len() as u64
    } else {
        declared
    };

    let payload = if declared > data.len() as u64 {
        warn!(declared, available = data.len(), "sidx box is cut off");
        reader.rest()
    } else if declared < header_len {
        return Err(Error::IndexParse(format!("sidx box size {declared} too small")));
    } else {
        reader.read_bytes((declared - header_len) as usize)?
    };

    parse_sidx_payload(payload)
}

/// Parse the body of a `sidx` box (everything after the 8-byte header)
pub fn parse_sidx_payload(payload: &[u8]) -> Result<SidxBox> {
    let mut reader = ByteReader::new(payload);
    let header = |e: Error| Error::IndexParse(format!("sidx fields: {e}"));

    let version = reader.read_u8().map_err(header)?;
    let flags = reader.read_uint(3).map_err(header)? as u32;
    let reference_id = reader.read_u32().map_err(header)?;
    let timescale = reader.read_u32().map_err(header)?;
    let (earliest_presentation_time, first_offset) = if version == 0 {
        (
            u64::from(reader.read_u32().map_err(header)?),
            u64::from(reader.read_u32().map_err(header)?),
        )
    } else {
        (reader.read_u64().map_err(header)?, reader.read_u64().map_err(header)?)
    };
    reader.skip(2).map_err(header)?;
    let declared_count = reader.read_u16().map_err(header)?;

    if timescale == 0 {
        return Err(Error::IndexParse("sidx timescale is zero".into()));
    }

    let mut references = Vec::with_capacity(declared_count as usize);
    for i in 0..declared_count {
        match read_reference(&mut reader) {
            Ok(reference) => {
                if reference.reference_type {
                    warn!(reference = i, "hierarchical sidx reference is not followed");
                }
                if reference.referenced_size == 0 || reference.subsegment_duration == 0 {
                    warn!(reference = i, "empty sidx reference, stopping");
                    break;
                }
                references.push(reference);
            }
            Err(e) => {
                warn!(
                    parsed = references.len(),
                    declared = declared_count,
                    error = %e,
                    "sidx table is cut off"
                );
                break;
            }
        }
    }

    debug!(
        version,
        timescale,
        references = references.len(),
        first_offset,
        "Parsed sidx"
    );

    Ok(SidxBox {
        version,
        flags,
        reference_id,
        timescale,
        earliest_presentation_time,
        first_offset,
        declared_count,
        references,
    })
}

fn read_reference(reader: &mut ByteReader<'_>) -> Result<SidxReference> {
    let row = reader.read_bytes(12)?;
    let mut row = ByteReader::new(row);
    let word = row.read_u32()?;
    let subsegment_duration = row.read_u32()?;
    let sap = row.read_u32()?;
    Ok(SidxReference {
        reference_type: word & 0x8000_0000 != 0,
        referenced_size: word & 0x7fff_ffff,
        subsegment_duration,
        starts_with_sap: sap & 0x8000_0000 != 0,
        sap_type: ((sap >> 28) & 0x7) as u8,
        sap_delta_time: sap & 0x0fff_ffff,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Serialize a version 0 `sidx` box with the given (size, duration) references
    pub(crate) fn build_sidx(timescale: u32, first_offset: u32, refs: &[(u32, u32)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0, 0, 0, 0]); // version 0, flags
        body.extend_from_slice(&1u32.to_be_bytes()); // reference_ID
        body.extend_from_slice(&timescale.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // earliest_presentation_time
        body.extend_from_slice(&first_offset.to_be_bytes());
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(&(refs.len() as u16).to_be_bytes());
        for &(size, duration) in refs {
            body.extend_from_slice(&size.to_be_bytes());
            body.extend_from_slice(&duration.to_be_bytes());
            body.extend_from_slice(&0x9000_0000u32.to_be_bytes());
        }
        let mut data = Vec::new();
        data.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        data.extend_from_slice(b"sidx");
        data.extend_from_slice(&body);
        data
    }

    #[test]
    fn test_parse_builds_contiguous_table() {
        let refs = [(1000, 5000), (1500, 5000), (800, 4000), (1200, 5005)];
        let data = build_sidx(1000, 16, &refs);
        let sidx = parse_sidx(&data).unwrap();
        assert_eq!(sidx.timescale, 1000);
        assert_eq!(sidx.references.len(), 4);
        assert!(!sidx.is_truncated());
        assert!(sidx.references[0].starts_with_sap);
        assert_eq!(sidx.references[0].sap_type, 1);

        let origin = 1200;
        let index = sidx.into_index(origin);
        assert_eq!(index.len(), 4);
        assert!(index.is_contiguous());
        assert_eq!(index.entries()[0].byte_start, 16 + origin);
        assert_eq!(index.entries()[0].tick_start, 0);
        assert_eq!(index.entries()[1].tick_start, 5000);

        let total: u64 = refs.iter().map(|&(size, _)| size as u64).sum();
        assert_eq!(index.entries()[3].byte_end, 16 + origin + total - 1);
        assert_eq!(index.entries()[3].tick_end, 5000 + 5000 + 4000 + 5005 - 1);
        assert_eq!(index.entries()[2].referenced_size, 800);
        assert_eq!(index.entries()[2].sub_segment_duration, 4000);
    }

    #[test]
    fn test_truncated_box_keeps_prefix() {
        let data = build_sidx(90000, 0, &[(100, 9000), (200, 9000), (300, 9000)]);
        let cut = &data[..data.len() - 14];
        let sidx = parse_sidx(cut).unwrap();
        assert_eq!(sidx.declared_count, 3);
        assert_eq!(sidx.references.len(), 1);
        assert!(sidx.is_truncated());
        assert_eq!(sidx.into_index(0).len(), 1);
    }

    #[test]
    fn test_version_one_wide_fields() {
        let mut body = vec![1, 0, 0, 0];
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(&48000u32.to_be_bytes());
        body.extend_from_slice(&(1u64 << 33).to_be_bytes());
        body.extend_from_slice(&4u64.to_be_bytes());
        body.extend_from_slice(&[0, 0, 0, 1]);
        body.extend_from_slice(&500u32.to_be_bytes());
        body.extend_from_slice(&48000u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());

        let sidx = parse_sidx_payload(&body).unwrap();
        assert_eq!(sidx.version, 1);
        assert_eq!(sidx.earliest_presentation_time, 1 << 33);
        assert_eq!(sidx.first_offset, 4);
        let index = sidx.into_index(100);
        assert_eq!(index.entries()[0].byte_start, 104);
        assert_eq!(index.entries()[0].byte_end, 603);
        assert_eq!(index.duration(), 1.0);
    }

    #[test]
    fn test_overflowing_offsets_are_dropped() {
        let wide = |first_offset: u64, sizes: &[u32]| {
            let mut body = vec![1, 0, 0, 0];
            body.extend_from_slice(&1u32.to_be_bytes());
            body.extend_from_slice(&1000u32.to_be_bytes());
            body.extend_from_slice(&0u64.to_be_bytes());
            body.extend_from_slice(&first_offset.to_be_bytes());
            body.extend_from_slice(&[0, 0]);
            body.extend_from_slice(&(sizes.len() as u16).to_be_bytes());
            for size in sizes {
                body.extend_from_slice(&size.to_be_bytes());
                body.extend_from_slice(&1000u32.to_be_bytes());
                body.extend_from_slice(&0u32.to_be_bytes());
            }
            parse_sidx_payload(&body).unwrap()
        };

        assert!(wide(u64::MAX, &[100]).into_index(1000).is_empty());

        // Room for the first reference only
        let index = wide(u64::MAX - 1199, &[100, 100]).into_index(1000);
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].byte_start, u64::MAX - 199);
        assert_eq!(index.entries()[0].byte_end, u64::MAX - 100);
    }

    #[test]
    fn test_rejects_other_boxes() {
        let mut data = build_sidx(1000, 0, &[(10, 10)]);
        data[4..8].copy_from_slice(b"moof");
        assert!(matches!(parse_sidx(&data), Err(Error::IndexParse(_))));
        assert!(parse_sidx(&[0, 0]).is_err());
    }
}
