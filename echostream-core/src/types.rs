use serde::{Deserialize, Serialize};

/// Event time in milliseconds since epoch.
pub type EventTime = i64;

/// Minimum possible event time. Used as the initial "no watermark" sentinel.
pub const EVENT_TIME_MIN: EventTime = i64::MIN;

/// Epoch identifier (one per completed global snapshot).
pub type EpochId = u64;

/// Absolute input channel index within a task's input gate.
pub type ChannelIndex = usize;

/// Index of one subpartition within a result partition.
///
/// Kept at `u8` because that is the width the causal log encodes.
pub type SubpartitionIndex = u8;

/// Identifier of an intermediate dataset produced by a task.
///
/// 128 bits, split the way the causal log writes it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId {
    pub upper: i64,
    pub lower: i64,
}

impl DatasetId {
    pub fn new(upper: i64, lower: i64) -> Self {
        Self { upper, lower }
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.upper as u64, self.lower as u64)
    }
}

/// A record in the stream, carrying user data and optional event time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamRecord<T> {
    pub value: T,
    pub timestamp: Option<EventTime>,
}

impl<T> StreamRecord<T> {
    /// Create a record with no event time.
    pub fn new(value: T) -> Self {
        Self {
            value,
            timestamp: None,
        }
    }

    /// Create a record with an explicit event time.
    pub fn with_timestamp(value: T, timestamp: EventTime) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
        }
    }
}

/// Watermark indicates that no elements with timestamp <= this value will arrive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    pub timestamp: EventTime,
}

impl Watermark {
    /// Create a new watermark at the given timestamp.
    pub fn new(timestamp: EventTime) -> Self {
        Self { timestamp }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Watermark({}ms)", self.timestamp)
    }
}

/// Per-channel stream liveness signal.
///
/// An idle upstream announces `Idle` so that its stalled watermark does not
/// hold back the aggregate; the first element after that flips it back to
/// `Active`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    Active,
    Idle,
}

impl StreamStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, StreamStatus::Active)
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStatus::Active => f.write_str("ACTIVE"),
            StreamStatus::Idle => f.write_str("IDLE"),
        }
    }
}

/// Marker injected at the sources to measure end-to-end latency.
///
/// Operators forward it without treating it as data; only the emission time
/// travels with it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LatencyMarker {
    pub marked_time: EventTime,
}

impl LatencyMarker {
    pub fn new(marked_time: EventTime) -> Self {
        Self { marked_time }
    }
}

/// The fundamental unit flowing through the input pipeline.
///
/// Everything the per-channel deserializer produces is a stream element:
/// data records, watermarks, status changes and latency markers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamElement<T> {
    /// User data record.
    Record(StreamRecord<T>),
    /// Watermark for event time progress tracking.
    Watermark(Watermark),
    /// Channel liveness change.
    Status(StreamStatus),
    /// Latency measurement marker.
    LatencyMarker(LatencyMarker),
}

impl<T> StreamElement<T> {
    /// Create a record element with no timestamp.
    pub fn record(value: T) -> Self {
        Self::Record(StreamRecord::new(value))
    }

    /// Create a record element with a timestamp.
    pub fn timestamped_record(value: T, timestamp: EventTime) -> Self {
        Self::Record(StreamRecord::with_timestamp(value, timestamp))
    }

    /// Create a watermark element.
    pub fn watermark(timestamp: EventTime) -> Self {
        Self::Watermark(Watermark::new(timestamp))
    }

    /// Create a status element.
    pub fn status(status: StreamStatus) -> Self {
        Self::Status(status)
    }

    /// Create a latency marker element.
    pub fn latency_marker(marked_time: EventTime) -> Self {
        Self::LatencyMarker(LatencyMarker::new(marked_time))
    }

    pub fn is_record(&self) -> bool {
        matches!(self, StreamElement::Record(_))
    }
}

/// Trait bound for types that can flow through the stream.
/// All user data types must satisfy this.
pub trait StreamData: Send + Clone + Serialize + for<'de> Deserialize<'de> + 'static {}

// Blanket implementation: any type satisfying the bounds is StreamData.
impl<T> StreamData for T where T: Send + Clone + Serialize + for<'de> Deserialize<'de> + 'static {}
