//! Contracts of the components the input pipeline drives.
//!
//! The operator itself lives outside this crate; the input processors only
//! ever touch it through [`OneInputStreamOperator`], and always under the
//! task lock.

use anyhow::Result;
use std::sync::Mutex;

use crate::metrics::OperatorMetricGroup;
use crate::types::{LatencyMarker, StreamRecord, StreamStatus, Watermark};

/// A single-input stream operator, as seen from the input pipeline.
///
/// All methods are called with the task lock held, so implementations never
/// observe concurrent calls from the input side and timer callbacks.
pub trait OneInputStreamOperator<T>: Send {
    /// Process one data record.
    fn process_element(&mut self, record: StreamRecord<T>) -> Result<()>;

    /// Receive the aggregated watermark from the valve.
    fn process_watermark(&mut self, watermark: Watermark) -> Result<()>;

    /// Receive a latency marker.
    fn process_latency_marker(&mut self, marker: LatencyMarker) -> Result<()>;

    /// Select the keyed-state context for the record about to be processed.
    fn set_key_context(&mut self, _record: &StreamRecord<T>) -> Result<()> {
        Ok(())
    }

    /// The operator's metric group, if the runtime registered one.
    fn metric_group(&self) -> Option<&OperatorMetricGroup> {
        None
    }
}

/// Holds the task's current stream status and propagates toggles downstream.
pub trait StreamStatusMaintainer: Send + Sync {
    fn toggle_stream_status(&self, status: StreamStatus);

    fn stream_status(&self) -> StreamStatus;
}

/// Default maintainer: keeps the status locally.
pub struct SimpleStatusMaintainer {
    status: Mutex<StreamStatus>,
}

impl Default for SimpleStatusMaintainer {
    fn default() -> Self {
        Self {
            status: Mutex::new(StreamStatus::Active),
        }
    }
}

impl SimpleStatusMaintainer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamStatusMaintainer for SimpleStatusMaintainer {
    fn toggle_stream_status(&self, status: StreamStatus) {
        *self.status.lock().expect("status lock") = status;
    }

    fn stream_status(&self) -> StreamStatus {
        *self.status.lock().expect("status lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_maintainer_toggles() {
        let maintainer = SimpleStatusMaintainer::new();
        assert_eq!(maintainer.stream_status(), StreamStatus::Active);
        maintainer.toggle_stream_status(StreamStatus::Idle);
        assert_eq!(maintainer.stream_status(), StreamStatus::Idle);
    }
}
