//! The live input loop.
//!
//! One `process_input` call drives one unit of progress: pull a record from
//! the pinned per-channel deserializer, or fetch the next buffer from the
//! barrier handler. Every interaction with the operator (including valve
//! output) happens under the single task lock, and every consumed element
//! records an `Order` determinant and bumps the record counter exactly
//! once.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};

use super::barrier::{BufferOrEvent, CheckpointBarrierHandler, TaskEvent};
use super::deserializer::RecordDeserializer;
use super::valve::{StatusWatermarkValve, ValveOutput};
use crate::causal::determinant::Determinant;
use crate::causal::epoch::EpochTracker;
use crate::causal::log::JobCausalLog;
use crate::causal::CausalError;
use crate::metrics::{Counter, TaskIoMetricGroup, WatermarkGauge};
use crate::operator::{OneInputStreamOperator, StreamStatusMaintainer};
use crate::types::{ChannelIndex, StreamElement};

/// Gauge name under which the barrier handler's alignment time is exposed.
pub const CHECKPOINT_ALIGNMENT_GAUGE: &str = "checkpoint_alignment_time";

/// One input loop driving a task, live or replaying.
pub trait InputLoop {
    /// Drive one unit of progress. `true` while more input may be
    /// available, `false` once the upstream is definitively finished.
    fn process_input(&mut self) -> Result<bool>;

    /// Recycle pinned buffers and release handler resources.
    fn cleanup(&mut self) -> Result<()>;
}

/// Shared dispatch path of the live and force-feeder loops: takes the task
/// lock, routes the element, applies valve output and counts the element.
pub(super) struct ElementDispatcher<T, Op: OneInputStreamOperator<T>> {
    operator: Arc<Mutex<Op>>,
    valve: StatusWatermarkValve,
    status_maintainer: Arc<dyn StreamStatusMaintainer>,
    watermark_gauge: WatermarkGauge,
    num_records_in: Counter,
    epoch_tracker: Arc<EpochTracker>,
    _marker: PhantomData<fn(T)>,
}

impl<T, Op: OneInputStreamOperator<T>> ElementDispatcher<T, Op> {
    pub(super) fn new(
        task_name: &str,
        operator: Arc<Mutex<Op>>,
        num_channels: usize,
        status_maintainer: Arc<dyn StreamStatusMaintainer>,
        watermark_gauge: WatermarkGauge,
        epoch_tracker: Arc<EpochTracker>,
    ) -> Result<Self> {
        // Resolve the record counter eagerly; a missing metric group must
        // never fail the task.
        let num_records_in = {
            let operator = operator
                .lock()
                .map_err(|_| anyhow!("task lock poisoned"))?;
            match operator.metric_group() {
                Some(group) => group.num_records_in.clone(),
                None => {
                    tracing::warn!(
                        "task {task_name}: operator metric group unavailable, using a local record counter"
                    );
                    Counter::new()
                }
            }
        };

        Ok(Self {
            operator,
            valve: StatusWatermarkValve::new(num_channels),
            status_maintainer,
            watermark_gauge,
            num_records_in,
            epoch_tracker,
            _marker: PhantomData,
        })
    }

    /// Route one element. With `replaying` set, valve bookkeeping runs
    /// outside the task lock; operator calls always happen under it.
    pub(super) fn dispatch(
        &mut self,
        element: StreamElement<T>,
        channel: ChannelIndex,
        replaying: bool,
    ) -> Result<()> {
        match element {
            StreamElement::Watermark(watermark) => {
                if replaying {
                    let output = self.valve.input_watermark(watermark, channel);
                    self.apply_valve_output(output)?;
                } else {
                    let Self {
                        operator,
                        valve,
                        status_maintainer,
                        watermark_gauge,
                        ..
                    } = self;
                    let mut operator =
                        operator.lock().map_err(|_| anyhow!("task lock poisoned"))?;
                    let output = valve.input_watermark(watermark, channel);
                    Self::apply_valve_output_locked(
                        &mut operator,
                        status_maintainer,
                        watermark_gauge,
                        output,
                    )?;
                }
            }
            StreamElement::Status(status) => {
                if replaying {
                    let output = self.valve.input_stream_status(status, channel);
                    self.apply_valve_output(output)?;
                } else {
                    let Self {
                        operator,
                        valve,
                        status_maintainer,
                        watermark_gauge,
                        ..
                    } = self;
                    let mut operator =
                        operator.lock().map_err(|_| anyhow!("task lock poisoned"))?;
                    let output = valve.input_stream_status(status, channel);
                    Self::apply_valve_output_locked(
                        &mut operator,
                        status_maintainer,
                        watermark_gauge,
                        output,
                    )?;
                }
            }
            StreamElement::LatencyMarker(marker) => {
                let mut operator = self.lock_operator()?;
                operator.process_latency_marker(marker)?;
            }
            StreamElement::Record(record) => {
                let mut operator = self.lock_operator()?;
                self.num_records_in.inc();
                operator.set_key_context(&record)?;
                operator.process_element(record)?;
            }
        }
        self.epoch_tracker.inc_record_count();
        Ok(())
    }

    pub(super) fn num_records_in(&self) -> &Counter {
        &self.num_records_in
    }

    fn lock_operator(&self) -> Result<std::sync::MutexGuard<'_, Op>> {
        self.operator.lock().map_err(|_| anyhow!("task lock poisoned"))
    }

    /// Replay path: take the lock only when the valve actually emitted.
    fn apply_valve_output(&self, output: ValveOutput) -> Result<()> {
        if output.is_empty() {
            return Ok(());
        }
        let mut operator = self.lock_operator()?;
        Self::apply_valve_output_locked(
            &mut operator,
            &self.status_maintainer,
            &self.watermark_gauge,
            output,
        )
    }

    fn apply_valve_output_locked(
        operator: &mut Op,
        status_maintainer: &Arc<dyn StreamStatusMaintainer>,
        watermark_gauge: &WatermarkGauge,
        output: ValveOutput,
    ) -> Result<()> {
        if let Some(watermark) = output.watermark {
            watermark_gauge.set(watermark.timestamp);
            operator
                .process_watermark(watermark)
                .context("valve output watermark processing failed")?;
        }
        if let Some(status) = output.status {
            status_maintainer.toggle_stream_status(status);
        }
        Ok(())
    }
}

/// Input processor for live execution.
pub struct StreamInputProcessor<T, Op: OneInputStreamOperator<T>> {
    task_name: String,
    barrier_handler: Box<dyn CheckpointBarrierHandler>,
    deserializers: Vec<Box<dyn RecordDeserializer<T>>>,
    dispatcher: ElementDispatcher<T, Op>,
    causal_log: Arc<dyn JobCausalLog>,
    current_channel: Option<ChannelIndex>,
    finished: bool,
}

impl<T, Op: OneInputStreamOperator<T>> StreamInputProcessor<T, Op> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_name: impl Into<String>,
        barrier_handler: Box<dyn CheckpointBarrierHandler>,
        deserializers: Vec<Box<dyn RecordDeserializer<T>>>,
        operator: Arc<Mutex<Op>>,
        status_maintainer: Arc<dyn StreamStatusMaintainer>,
        watermark_gauge: WatermarkGauge,
        causal_log: Arc<dyn JobCausalLog>,
        epoch_tracker: Arc<EpochTracker>,
        task_metrics: &TaskIoMetricGroup,
    ) -> Result<Self> {
        let task_name = task_name.into();
        if deserializers.len() > u8::MAX as usize + 1 {
            return Err(anyhow!(
                "task {task_name}: {} input channels exceed the loggable range",
                deserializers.len()
            ));
        }

        task_metrics.register_gauge(CHECKPOINT_ALIGNMENT_GAUGE, barrier_handler.alignment_gauge());

        let dispatcher = ElementDispatcher::new(
            &task_name,
            operator,
            deserializers.len(),
            status_maintainer,
            watermark_gauge,
            epoch_tracker,
        )?;

        Ok(Self {
            task_name,
            barrier_handler,
            deserializers,
            dispatcher,
            causal_log,
            current_channel: None,
            finished: false,
        })
    }

    /// The channel the pinned deserializer belongs to, if any.
    pub fn current_channel(&self) -> Option<ChannelIndex> {
        self.current_channel
    }

    /// Records consumed through the operator's `num_records_in` counter.
    pub fn num_records_in(&self) -> u64 {
        self.dispatcher.num_records_in().count()
    }

    /// A reconnected channel starts over: drop its partial deserialization
    /// state and let the barrier handler release it if it was blocked.
    pub fn reset_channel_deserializer(&mut self, channel: ChannelIndex) {
        self.deserializers[channel].clear();
        if self.current_channel == Some(channel) {
            self.current_channel = None;
        }
        self.barrier_handler.unblock_channel(channel);
    }
}

impl<T, Op: OneInputStreamOperator<T>> InputLoop for StreamInputProcessor<T, Op> {
    fn process_input(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }

        if let Some(channel) = self.current_channel {
            let deserializer = &mut self.deserializers[channel];
            let (result, element) = deserializer.next_element()?;

            // Record extraction and buffer consumption are independent
            // signals; both may fire on the same call.
            if result.is_buffer_consumed() {
                if let Some(mut buffer) = deserializer.take_current_buffer() {
                    buffer.recycle();
                }
                self.current_channel = None;
            }

            if let Some(envelope) = element {
                self.causal_log.append_main_thread(&Determinant::Order {
                    channel: channel as u8,
                });
                self.dispatcher.dispatch(envelope.element, channel, false)?;
                return Ok(true);
            }
        }

        match self.barrier_handler.next_non_blocked()? {
            Some(BufferOrEvent::Buffer { channel, buffer }) => {
                if channel >= self.deserializers.len() {
                    return Err(anyhow!(
                        "buffer for unknown channel {channel} ({} channels)",
                        self.deserializers.len()
                    ));
                }
                self.current_channel = Some(channel);
                self.deserializers[channel].set_next_buffer(buffer)?;
                Ok(true)
            }
            Some(BufferOrEvent::Event { event, .. }) => match event {
                TaskEvent::EndOfPartition => Ok(true),
                other => Err(CausalError::UnexpectedEvent(other.to_string()).into()),
            },
            None => {
                self.finished = true;
                tracing::debug!("task {}: input stream finished", self.task_name);
                if !self.barrier_handler.is_empty() {
                    return Err(CausalError::TrailingBarrierData.into());
                }
                Ok(false)
            }
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        // Clear the buffers first; this part must not fail.
        for deserializer in &mut self.deserializers {
            if let Some(mut buffer) = deserializer.take_current_buffer() {
                if !buffer.is_recycled() {
                    buffer.recycle();
                }
            }
            deserializer.clear();
        }
        self.barrier_handler.cleanup()
    }
}

#[cfg(test)]
#[path = "tests/input_processor_tests.rs"]
mod tests;
