//! Per-channel watermark and stream-status aggregation.
//!
//! Each input channel reports watermarks and liveness independently; the
//! valve decides when the operator should see an aggregate watermark or a
//! status change. Outputs are returned to the caller rather than delivered
//! through a callback, so the dispatcher can apply them while it already
//! holds the task lock.

use crate::types::{ChannelIndex, EventTime, StreamStatus, Watermark, EVENT_TIME_MIN};

/// What the valve decided to emit in response to one input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValveOutput {
    pub watermark: Option<Watermark>,
    pub status: Option<StreamStatus>,
}

impl ValveOutput {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.watermark.is_none() && self.status.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelState {
    watermark: EventTime,
    seen_watermark: bool,
    status: StreamStatus,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            watermark: EVENT_TIME_MIN,
            seen_watermark: false,
            status: StreamStatus::Active,
        }
    }
}

/// Valve state for one multi-channel input.
///
/// The aggregate watermark only starts advancing once every active channel
/// has reported at least one watermark; from then on it follows the highest
/// reported timestamp, monotonically. Idle channels are excluded entirely:
/// a quiet upstream neither gates nor contributes.
pub struct StatusWatermarkValve {
    channels: Vec<ChannelState>,
    last_output_watermark: EventTime,
    last_output_status: StreamStatus,
}

impl StatusWatermarkValve {
    pub fn new(num_channels: usize) -> Self {
        Self {
            channels: vec![ChannelState::default(); num_channels],
            last_output_watermark: EVENT_TIME_MIN,
            last_output_status: StreamStatus::Active,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Feed one channel watermark; returns what to emit, if anything.
    pub fn input_watermark(&mut self, watermark: Watermark, channel: ChannelIndex) -> ValveOutput {
        // Watermarks from idle channels are ignored; they will re-announce
        // themselves as active before sending real progress.
        if !self.channels[channel].status.is_active() || !self.last_output_status.is_active() {
            return ValveOutput::none();
        }

        let state = &mut self.channels[channel];
        state.seen_watermark = true;
        if watermark.timestamp > state.watermark {
            state.watermark = watermark.timestamp;
        }
        self.advance_watermark()
    }

    /// Feed one channel status change; returns what to emit, if anything.
    pub fn input_stream_status(
        &mut self,
        status: StreamStatus,
        channel: ChannelIndex,
    ) -> ValveOutput {
        if self.channels[channel].status == status {
            return ValveOutput::none();
        }
        self.channels[channel].status = status;

        match status {
            StreamStatus::Idle => {
                if self.channels.iter().all(|c| !c.status.is_active()) {
                    self.last_output_status = StreamStatus::Idle;
                    return ValveOutput {
                        watermark: None,
                        status: Some(StreamStatus::Idle),
                    };
                }
                // Removing this channel from the aggregate may unblock it.
                self.advance_watermark()
            }
            StreamStatus::Active => {
                if !self.last_output_status.is_active() {
                    self.last_output_status = StreamStatus::Active;
                    return ValveOutput {
                        watermark: None,
                        status: Some(StreamStatus::Active),
                    };
                }
                ValveOutput::none()
            }
        }
    }

    /// Last watermark handed to the operator.
    pub fn last_output_watermark(&self) -> EventTime {
        self.last_output_watermark
    }

    fn advance_watermark(&mut self) -> ValveOutput {
        let Some(aggregate) = self.aggregate_watermark() else {
            return ValveOutput::none();
        };
        if aggregate > self.last_output_watermark {
            self.last_output_watermark = aggregate;
            return ValveOutput {
                watermark: Some(Watermark::new(aggregate)),
                status: None,
            };
        }
        ValveOutput::none()
    }

    /// Aggregate over active channels; `None` until each of them has
    /// reported at least once (or when none is active).
    fn aggregate_watermark(&self) -> Option<EventTime> {
        let mut max: Option<EventTime> = None;
        for state in self.channels.iter().filter(|c| c.status.is_active()) {
            if !state.seen_watermark {
                return None;
            }
            max = Some(max.map_or(state.watermark, |m: EventTime| m.max(state.watermark)));
        }
        max
    }
}

#[cfg(test)]
#[path = "tests/valve_tests.rs"]
mod tests;
