//! H.264 bitstream helpers
//!
//! RTSP depacketizers hand out AVC (length-prefixed) access units while the
//! WebRTC payloader wants Annex B (start-code delimited) NAL units.

use bytes::{BufMut, Bytes, BytesMut};

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL type constants
pub mod nal {
    pub const IDR_SLICE: u8 = 5;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
    pub const FILLER: u8 = 12;
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// SPS/PPS from an `AVCDecoderConfigurationRecord`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
    /// Size of the NAL length prefix used by the stream
    pub length_size: usize,
}

impl ParameterSets {
    /// Parse an avcC record (ISO/IEC 14496-15 5.3.3.1)
    pub fn from_avcc(record: &[u8]) -> Option<Self> {
        if record.len() < 7 || record[0] != 1 {
            return None;
        }
        let length_size = usize::from(record[4] & 0x03) + 1;

        let mut pos = 5;
        let sps_count = usize::from(record[pos] & 0x1F);
        pos += 1;
        let mut sps = Vec::with_capacity(sps_count);
        for _ in 0..sps_count {
            let (unit, next) = read_u16_prefixed(record, pos)?;
            sps.push(unit);
            pos = next;
        }

        let pps_count = usize::from(*record.get(pos)?);
        pos += 1;
        let mut pps = Vec::with_capacity(pps_count);
        for _ in 0..pps_count {
            let (unit, next) = read_u16_prefixed(record, pos)?;
            pps.push(unit);
            pos = next;
        }

        Some(Self {
            sps,
            pps,
            length_size,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sps.is_empty() || self.pps.is_empty()
    }

    /// Append SPS then PPS in Annex B form
    pub fn write_annexb(&self, out: &mut BytesMut) {
        for unit in self.sps.iter().chain(self.pps.iter()) {
            out.put_slice(&START_CODE);
            out.put_slice(unit);
        }
    }
}

fn read_u16_prefixed(buf: &[u8], pos: usize) -> Option<(Bytes, usize)> {
    let len = usize::from(u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]));
    let start = pos + 2;
    let unit = buf.get(start..start + len)?;
    Some((Bytes::copy_from_slice(unit), start + len))
}

/// Convert a length-prefixed access unit to Annex B.
///
/// Returns `None` on a truncated or malformed unit.
pub fn avcc_to_annexb(data: &[u8], length_size: usize, out: &mut BytesMut) -> Option<()> {
    if !(1..=4).contains(&length_size) {
        return None;
    }
    let mut pos = 0;
    while pos < data.len() {
        let prefix = data.get(pos..pos + length_size)?;
        let len = prefix
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        pos += length_size;
        let unit = data.get(pos..pos + len)?;
        out.put_slice(&START_CODE);
        out.put_slice(unit);
        pos += len;
    }
    Some(())
}

/// Split an Annex B buffer into NAL units (start codes removed)
pub fn annexb_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &(_, payload)) in starts.iter().enumerate() {
        let end = match starts.get(n + 1) {
            // 4-byte start code: the zero before belongs to the prefix
            Some(&(next, _)) if next > 0 && data[next - 1] == 0 => next - 1,
            Some(&(next, _)) => next,
            None => data.len(),
        };
        if end > payload {
            units.push(&data[payload..end]);
        }
    }
    units
}
