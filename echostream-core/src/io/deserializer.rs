//! Per-channel record deserialization.
//!
//! Each input channel owns one deserializer. The processor hands it network
//! buffers one at a time and pulls typed elements back out; a record that
//! spans a buffer boundary is held internally until the next buffer
//! arrives, so buffers can be recycled as soon as they are consumed.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

use super::buffer::NetworkBuffer;
use crate::causal::log::VertexCausalLogDelta;
use crate::types::{StreamData, StreamElement};

/// Outcome of one deserialization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeserializationResult {
    /// No full record; the current buffer is consumed.
    PartialRecord,
    /// Full record produced; the current buffer has more data.
    IntermediateRecord,
    /// Full record produced and the current buffer is consumed.
    LastRecord,
}

impl DeserializationResult {
    pub fn is_full_record(&self) -> bool {
        !matches!(self, DeserializationResult::PartialRecord)
    }

    pub fn is_buffer_consumed(&self) -> bool {
        !matches!(self, DeserializationResult::IntermediateRecord)
    }
}

/// One stream element together with the upstream causal-log deltas that
/// were piggy-backed on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElementEnvelope<T> {
    pub element: StreamElement<T>,
    pub log_deltas: Vec<VertexCausalLogDelta>,
}

impl<T> ElementEnvelope<T> {
    pub fn new(element: StreamElement<T>) -> Self {
        Self {
            element,
            log_deltas: Vec::new(),
        }
    }

    pub fn with_deltas(element: StreamElement<T>, log_deltas: Vec<VertexCausalLogDelta>) -> Self {
        Self {
            element,
            log_deltas,
        }
    }

    /// Encode as one wire frame: `[len:u32][bincode body]`.
    pub fn encode_frame(&self) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// The per-channel deserializer contract.
pub trait RecordDeserializer<T>: Send {
    /// Hand over the next network buffer. Fails if the previous buffer was
    /// not consumed yet.
    fn set_next_buffer(&mut self, buffer: NetworkBuffer) -> Result<()>;

    /// Attempt to produce the next element.
    fn next_element(&mut self) -> Result<(DeserializationResult, Option<ElementEnvelope<T>>)>;

    /// Take back the buffer most recently handed over, for recycling.
    fn take_current_buffer(&mut self) -> Option<NetworkBuffer>;

    /// Whether a buffer is currently held.
    fn has_buffer(&self) -> bool;

    /// Drop all internal state, recycling any held buffer.
    fn clear(&mut self);
}

/// Deserializer for length-prefixed bincode frames.
pub struct FramedRecordDeserializer<T> {
    /// Unparsed bytes, including any partial frame spanning from consumed
    /// buffers.
    pending: Vec<u8>,
    current: Option<NetworkBuffer>,
    _marker: PhantomData<T>,
}

impl<T> Default for FramedRecordDeserializer<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            current: None,
            _marker: PhantomData,
        }
    }
}

impl<T> FramedRecordDeserializer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `pending` holds at least one complete frame.
    fn has_complete_frame(&self) -> bool {
        if self.pending.len() < 4 {
            return false;
        }
        let len =
            u32::from_be_bytes([self.pending[0], self.pending[1], self.pending[2], self.pending[3]])
                as usize;
        self.pending.len() >= 4 + len
    }
}

impl<T: StreamData> RecordDeserializer<T> for FramedRecordDeserializer<T> {
    fn set_next_buffer(&mut self, buffer: NetworkBuffer) -> Result<()> {
        if self.current.is_some() {
            return Err(anyhow!("previous buffer was not consumed"));
        }
        self.pending.extend_from_slice(buffer.data());
        self.current = Some(buffer);
        Ok(())
    }

    fn next_element(&mut self) -> Result<(DeserializationResult, Option<ElementEnvelope<T>>)> {
        if self.current.is_none() {
            return Err(anyhow!("no buffer set"));
        }

        if !self.has_complete_frame() {
            // Keep the partial frame as spanning state for the next buffer.
            return Ok((DeserializationResult::PartialRecord, None));
        }

        let len =
            u32::from_be_bytes([self.pending[0], self.pending[1], self.pending[2], self.pending[3]])
                as usize;
        let envelope: ElementEnvelope<T> = bincode::deserialize(&self.pending[4..4 + len])?;
        self.pending.drain(..4 + len);

        let result = if self.has_complete_frame() {
            DeserializationResult::IntermediateRecord
        } else {
            DeserializationResult::LastRecord
        };
        Ok((result, Some(envelope)))
    }

    fn take_current_buffer(&mut self) -> Option<NetworkBuffer> {
        self.current.take()
    }

    fn has_buffer(&self) -> bool {
        self.current.is_some()
    }

    fn clear(&mut self) {
        self.pending.clear();
        if let Some(mut buffer) = self.current.take() {
            buffer.recycle();
        }
    }
}

#[cfg(test)]
#[path = "tests/deserializer_tests.rs"]
mod tests;
