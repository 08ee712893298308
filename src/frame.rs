//! # Wire Codec
//!
//! Bit-exact encode/decode of the three frame types moved over the
//! transport. The first byte is the type tag; every multi-byte field is
//! little-endian. Data frames carry the run-fixed record layout and nothing
//! else, so the decoder must be told the layout it is expecting; any
//! mismatch is a protocol violation, not a recoverable condition.

use crate::config::ShuffleConfig;
use crate::error::ShuffleError;
use anyhow::Result;

/// Data frame: `tag | id | 0x00 | payload | padding`.
pub const TAG_DATA: u8 = 0x01;
/// Renegotiation begin: `tag | round | sender`.
pub const TAG_RENEG_BEGIN: u8 = 0x02;
/// Pivot upload / boundary install: `tag | round | count | width | pivots`.
pub const TAG_RENEG_PIVOTS: u8 = 0x03;

/// A decoded frame. Owned, so the delivery path can hand it across threads.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data {
        id: Vec<u8>,
        payload: Vec<u8>,
    },
    RenegBegin {
        round: u32,
        sender: u32,
    },
    RenegPivots {
        round: u32,
        width: f32,
        pivots: Vec<f32>,
    },
}

impl Frame {
    /// The wire tag for this frame.
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Data { .. } => TAG_DATA,
            Frame::RenegBegin { .. } => TAG_RENEG_BEGIN,
            Frame::RenegPivots { .. } => TAG_RENEG_PIVOTS,
        }
    }
}

/// Encode a data frame under the run-fixed layout. The caller has already
/// validated the id and payload lengths.
pub fn encode_data(cfg: &ShuffleConfig, id: &[u8], payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(id.len(), cfg.id_size);
    debug_assert_eq!(payload.len(), cfg.payload_size);
    let mut buf = Vec::with_capacity(cfg.data_frame_size());
    buf.push(TAG_DATA);
    buf.extend_from_slice(id);
    buf.push(0x00);
    buf.extend_from_slice(payload);
    buf.resize(cfg.data_frame_size(), 0);
    buf
}

/// Encode a `RENEG_BEGIN` control frame.
pub fn encode_reneg_begin(round: u32, sender: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(TAG_RENEG_BEGIN);
    buf.extend_from_slice(&round.to_le_bytes());
    buf.extend_from_slice(&sender.to_le_bytes());
    buf
}

/// Encode a `RENEG_PIVOTS` frame. Used both for pivot uploads to the
/// coordinator (`count = K + 1`) and for the boundary scatter
/// (`count = N + 1`, `width = 0`).
pub fn encode_reneg_pivots(round: u32, width: f32, pivots: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(13 + pivots.len() * 4);
    buf.push(TAG_RENEG_PIVOTS);
    buf.extend_from_slice(&round.to_le_bytes());
    buf.extend_from_slice(&(pivots.len() as u32).to_le_bytes());
    buf.extend_from_slice(&width.to_le_bytes());
    for pivot in pivots {
        buf.extend_from_slice(&pivot.to_le_bytes());
    }
    buf
}

/// Decode an inbound frame. Every malformation is a `Protocol` error; the
/// dispatcher escalates those to a group abort.
pub fn decode(cfg: &ShuffleConfig, bytes: &[u8]) -> Result<Frame> {
    let tag = *bytes
        .first()
        .ok_or_else(|| ShuffleError::protocol("empty frame"))?;
    match tag {
        TAG_DATA => decode_data(cfg, bytes),
        TAG_RENEG_BEGIN => decode_reneg_begin(bytes),
        TAG_RENEG_PIVOTS => decode_reneg_pivots(bytes),
        other => Err(ShuffleError::protocol(format!("unknown frame tag {other:#04x}")).into()),
    }
}

fn decode_data(cfg: &ShuffleConfig, bytes: &[u8]) -> Result<Frame> {
    if bytes.len() != cfg.data_frame_size() {
        return Err(ShuffleError::protocol(format!(
            "data frame is {} bytes, run layout needs {}",
            bytes.len(),
            cfg.data_frame_size()
        ))
        .into());
    }
    let id_end = 1 + cfg.id_size;
    if bytes[id_end] != 0x00 {
        return Err(ShuffleError::protocol("data frame missing id separator").into());
    }
    let payload_start = id_end + 1;
    Ok(Frame::Data {
        id: bytes[1..id_end].to_vec(),
        payload: bytes[payload_start..payload_start + cfg.payload_size].to_vec(),
    })
}

fn decode_reneg_begin(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() != 9 {
        return Err(ShuffleError::protocol(format!(
            "reneg begin frame is {} bytes, expected 9",
            bytes.len()
        ))
        .into());
    }
    Ok(Frame::RenegBegin {
        round: read_u32_le(bytes, 1),
        sender: read_u32_le(bytes, 5),
    })
}

fn decode_reneg_pivots(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < 13 {
        return Err(ShuffleError::protocol(format!(
            "reneg pivots frame is {} bytes, header alone needs 13",
            bytes.len()
        ))
        .into());
    }
    let round = read_u32_le(bytes, 1);
    let count = read_u32_le(bytes, 5) as usize;
    let expected = 13 + count * 4;
    if bytes.len() != expected {
        return Err(ShuffleError::protocol(format!(
            "reneg pivots frame is {} bytes, count {count} needs {expected}",
            bytes.len()
        ))
        .into());
    }
    let width = f32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
    let mut pivots = Vec::with_capacity(count);
    for i in 0..count {
        let at = 13 + i * 4;
        pivots.push(f32::from_le_bytes([
            bytes[at],
            bytes[at + 1],
            bytes[at + 2],
            bytes[at + 3],
        ]));
    }
    Ok(Frame::RenegPivots {
        round,
        width,
        pivots,
    })
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
