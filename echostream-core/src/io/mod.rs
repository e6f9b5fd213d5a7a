//! Input pipeline: buffers, the buffer/event stream, per-channel
//! deserialization, watermark/status aggregation and the two input loops
//! (live and force-fed replay).

pub mod barrier;
pub mod buffer;
pub mod deserializer;
pub mod force_feeder;
pub mod input_processor;
pub mod valve;

pub use barrier::{BufferOrEvent, ChannelBarrierHandler, CheckpointBarrierHandler, InputChannel, TaskEvent};
pub use buffer::{BufferPool, NetworkBuffer};
pub use deserializer::{
    DeserializationResult, ElementEnvelope, FramedRecordDeserializer, RecordDeserializer,
};
pub use force_feeder::ForceFeederInputProcessor;
pub use input_processor::{InputLoop, StreamInputProcessor};
pub use valve::{StatusWatermarkValve, ValveOutput};
