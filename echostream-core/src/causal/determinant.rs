//! The determinant model and its tagged binary codec.
//!
//! A causal log is a plain concatenation of encoded determinants with no
//! framing. Layout, big-endian throughout:
//!
//! ```text
//! Order       : [0x00][channel:u8]
//! RandomEmit  : [0x01][channel:u8]
//! Timestamp   : [0x02][ts:i64]
//! RNG         : [0x03][n:i32]
//! BufferBuilt : [0x04][idUpper:i64][idLower:i64][subpartition:u8][bytes:i32]
//! ```
//!
//! The tags are wire format and must never be renumbered; logs written by
//! one task version must decode on any other.

use super::CausalError;
use crate::types::{DatasetId, SubpartitionIndex};

pub const ORDER_TAG: u8 = 0;
pub const RANDOM_EMIT_TAG: u8 = 1;
pub const TIMESTAMP_TAG: u8 = 2;
pub const RNG_TAG: u8 = 3;
pub const BUFFER_BUILT_TAG: u8 = 4;

/// A recorded non-deterministic decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Determinant {
    /// The next record was read from this input channel.
    Order { channel: u8 },
    /// Random routing selected this output channel.
    RandomEmit { channel: u8 },
    /// The wall clock returned this value (ms since epoch).
    Timestamp { millis: i64 },
    /// The task RNG produced this value.
    Rng { value: i32 },
    /// An output buffer of `bytes` bytes was cut on (dataset, subpartition).
    BufferBuilt {
        dataset: DatasetId,
        subpartition: SubpartitionIndex,
        bytes: i32,
    },
}

impl Determinant {
    /// The wire tag of this variant.
    pub fn tag(&self) -> u8 {
        match self {
            Determinant::Order { .. } => ORDER_TAG,
            Determinant::RandomEmit { .. } => RANDOM_EMIT_TAG,
            Determinant::Timestamp { .. } => TIMESTAMP_TAG,
            Determinant::Rng { .. } => RNG_TAG,
            Determinant::BufferBuilt { .. } => BUFFER_BUILT_TAG,
        }
    }

    /// Encoded length in bytes, tag included.
    pub fn encoded_len(&self) -> usize {
        match self {
            Determinant::Order { .. } | Determinant::RandomEmit { .. } => 2,
            Determinant::Timestamp { .. } => 9,
            Determinant::Rng { .. } => 5,
            Determinant::BufferBuilt { .. } => 22,
        }
    }

    /// Whether this determinant is replayed asynchronously, driven by the
    /// record counter rather than pulled inline by the input loop.
    pub fn is_async(&self) -> bool {
        matches!(self, Determinant::BufferBuilt { .. })
    }

    /// Short variant name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Determinant::Order { .. } => "Order",
            Determinant::RandomEmit { .. } => "RandomEmit",
            Determinant::Timestamp { .. } => "Timestamp",
            Determinant::Rng { .. } => "RNG",
            Determinant::BufferBuilt { .. } => "BufferBuilt",
        }
    }

    /// Append the encoding of this determinant to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match *self {
            Determinant::Order { channel } => {
                out.push(ORDER_TAG);
                out.push(channel);
            }
            Determinant::RandomEmit { channel } => {
                out.push(RANDOM_EMIT_TAG);
                out.push(channel);
            }
            Determinant::Timestamp { millis } => {
                out.push(TIMESTAMP_TAG);
                out.extend_from_slice(&millis.to_be_bytes());
            }
            Determinant::Rng { value } => {
                out.push(RNG_TAG);
                out.extend_from_slice(&value.to_be_bytes());
            }
            Determinant::BufferBuilt {
                dataset,
                subpartition,
                bytes,
            } => {
                out.push(BUFFER_BUILT_TAG);
                out.extend_from_slice(&dataset.upper.to_be_bytes());
                out.extend_from_slice(&dataset.lower.to_be_bytes());
                out.push(subpartition);
                out.extend_from_slice(&bytes.to_be_bytes());
            }
        }
    }

    /// One-shot encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }
}

impl std::fmt::Display for Determinant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Determinant::Order { channel } => write!(f, "Order(ch={channel})"),
            Determinant::RandomEmit { channel } => write!(f, "RandomEmit(ch={channel})"),
            Determinant::Timestamp { millis } => write!(f, "Timestamp({millis}ms)"),
            Determinant::Rng { value } => write!(f, "RNG({value})"),
            Determinant::BufferBuilt {
                dataset,
                subpartition,
                bytes,
            } => write!(f, "BufferBuilt({dataset}[{subpartition}], {bytes}B)"),
        }
    }
}

/// Forward-only decoder over a raw determinant byte stream.
pub struct DeterminantCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DeterminantCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Bytes left in the stream.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Decode the next determinant, advancing the cursor.
    ///
    /// Returns `Ok(None)` at end of stream. An unknown tag or a payload
    /// shorter than the tag requires is a [`CausalError::CorruptLog`].
    pub fn decode_next(&mut self) -> Result<Option<Determinant>, CausalError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let tag = self.buf[self.pos];
        self.pos += 1;

        let determinant = match tag {
            ORDER_TAG => Determinant::Order {
                channel: self.read_u8("Order channel")?,
            },
            RANDOM_EMIT_TAG => Determinant::RandomEmit {
                channel: self.read_u8("RandomEmit channel")?,
            },
            TIMESTAMP_TAG => Determinant::Timestamp {
                millis: self.read_i64("Timestamp payload")?,
            },
            RNG_TAG => Determinant::Rng {
                value: self.read_i32("RNG payload")?,
            },
            BUFFER_BUILT_TAG => {
                let upper = self.read_i64("BufferBuilt dataset id")?;
                let lower = self.read_i64("BufferBuilt dataset id")?;
                let subpartition = self.read_u8("BufferBuilt subpartition")?;
                let bytes = self.read_i32("BufferBuilt length")?;
                Determinant::BufferBuilt {
                    dataset: DatasetId::new(upper, lower),
                    subpartition,
                    bytes,
                }
            }
            other => {
                return Err(CausalError::CorruptLog(format!(
                    "unknown determinant tag {other:#04x} at offset {}",
                    self.pos - 1
                )))
            }
        };
        Ok(Some(determinant))
    }

    fn read_u8(&mut self, what: &str) -> Result<u8, CausalError> {
        if self.remaining() < 1 {
            return Err(CausalError::CorruptLog(format!("truncated {what}")));
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_i32(&mut self, what: &str) -> Result<i32, CausalError> {
        if self.remaining() < 4 {
            return Err(CausalError::CorruptLog(format!("truncated {what}")));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(i32::from_be_bytes(raw))
    }

    fn read_i64(&mut self, what: &str) -> Result<i64, CausalError> {
        if self.remaining() < 8 {
            return Err(CausalError::CorruptLog(format!("truncated {what}")));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(i64::from_be_bytes(raw))
    }
}

/// Decode a full determinant stream to end of input.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Determinant>, CausalError> {
    let mut cursor = DeterminantCursor::new(bytes);
    let mut out = Vec::new();
    while let Some(d) = cursor.decode_next()? {
        out.push(d);
    }
    Ok(out)
}

#[cfg(test)]
#[path = "tests/determinant_tests.rs"]
mod tests;
