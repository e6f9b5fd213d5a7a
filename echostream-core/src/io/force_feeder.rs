//! The replay input loop.
//!
//! During replay the upstream may deliver buffers in a different arrival
//! order than the original run. The force feeder never lets arrival order
//! decide anything: each element is read from the channel the next `Order`
//! determinant names, so the logical interleaving — and therefore every
//! operator call — is exactly the one the failed execution produced.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::barrier::{BufferOrEvent, CheckpointBarrierHandler, TaskEvent};
use super::deserializer::{ElementEnvelope, RecordDeserializer};
use super::input_processor::{ElementDispatcher, InputLoop, CHECKPOINT_ALIGNMENT_GAUGE};
use crate::causal::epoch::EpochTracker;
use crate::causal::log::JobCausalLog;
use crate::causal::recovery::RecoveryManager;
use crate::causal::CausalError;
use crate::metrics::{TaskIoMetricGroup, WatermarkGauge};
use crate::operator::{OneInputStreamOperator, StreamStatusMaintainer};
use crate::types::ChannelIndex;

/// Input processor active while the recovery manager is replaying.
pub struct ForceFeederInputProcessor<T, Op: OneInputStreamOperator<T>> {
    task_name: String,
    barrier_handler: Box<dyn CheckpointBarrierHandler>,
    deserializers: Vec<Box<dyn RecordDeserializer<T>>>,
    /// Buffers that arrived for a channel whose deserializer is still busy;
    /// force-fed in arrival order once the determinant stream asks for them.
    queued_buffers: Vec<VecDeque<crate::io::buffer::NetworkBuffer>>,
    dispatcher: ElementDispatcher<T, Op>,
    causal_log: Arc<dyn JobCausalLog>,
    recovery: Arc<RecoveryManager>,
    current_channel: Option<ChannelIndex>,
    finished: bool,
}

impl<T, Op: OneInputStreamOperator<T>> ForceFeederInputProcessor<T, Op> {
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
        recovery: Arc<RecoveryManager>,
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

        let queued_buffers = (0..deserializers.len()).map(|_| VecDeque::new()).collect();
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
            queued_buffers,
            dispatcher,
            causal_log,
            recovery,
            current_channel: None,
            finished: false,
        })
    }

    pub fn current_channel(&self) -> Option<ChannelIndex> {
        self.current_channel
    }

    /// Pull one full element from `channel`, force-feeding queued and
    /// freshly arriving buffers until the channel can produce it.
    ///
    /// Returns `None` when the upstream stream definitively ends first.
    fn pull_element(&mut self, channel: ChannelIndex) -> Result<Option<ElementEnvelope<T>>> {
        loop {
            if !self.deserializers[channel].has_buffer() {
                if let Some(buffer) = self.queued_buffers[channel].pop_front() {
                    self.deserializers[channel].set_next_buffer(buffer)?;
                } else if !self.fetch_next_buffer()? {
                    return Ok(None);
                } else {
                    continue;
                }
            }

            let (result, element) = self.deserializers[channel].next_element()?;
            if result.is_buffer_consumed() {
                if let Some(mut buffer) = self.deserializers[channel].take_current_buffer() {
                    buffer.recycle();
                }
            }
            if let Some(envelope) = element {
                return Ok(Some(envelope));
            }
        }
    }

    /// Accept the next buffer or event from the barrier handler and park it
    /// on the channel it belongs to. `false` means the stream is finished.
    fn fetch_next_buffer(&mut self) -> Result<bool> {
        match self.barrier_handler.next_non_blocked()? {
            Some(BufferOrEvent::Buffer { channel, buffer }) => {
                if channel >= self.deserializers.len() {
                    return Err(anyhow!(
                        "buffer for unknown channel {channel} ({} channels)",
                        self.deserializers.len()
                    ));
                }
                if self.deserializers[channel].has_buffer() {
                    self.queued_buffers[channel].push_back(buffer);
                } else {
                    self.deserializers[channel].set_next_buffer(buffer)?;
                }
                Ok(true)
            }
            Some(BufferOrEvent::Event { event, .. }) => match event {
                TaskEvent::EndOfPartition => Ok(true),
                other => Err(CausalError::UnexpectedEvent(other.to_string()).into()),
            },
            None => {
                self.finished = true;
                tracing::debug!("task {}: input stream finished during replay", self.task_name);
                if !self.barrier_handler.is_empty() {
                    return Err(CausalError::TrailingBarrierData.into());
                }
                Ok(false)
            }
        }
    }
}

impl<T, Op: OneInputStreamOperator<T>> InputLoop for ForceFeederInputProcessor<T, Op> {
    fn process_input(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        if let Some(failure) = self.recovery.context().take_failure() {
            return Err(failure);
        }

        loop {
            // Replay can end between elements; the task then swaps in the
            // live loop at its next scheduling boundary.
            if !self.recovery.is_replaying() {
                return Ok(true);
            }
            self.recovery.check_async_event()?;
            if !self.recovery.is_replaying() {
                return Ok(true);
            }

            let channel = self.recovery.replay_next_channel()?;
            if channel >= self.deserializers.len() {
                return Err(CausalError::CorruptLog(format!(
                    "order determinant names channel {channel} but task has {}",
                    self.deserializers.len()
                ))
                .into());
            }
            self.current_channel = Some(channel);

            let Some(envelope) = self.pull_element(channel)? else {
                return Ok(false);
            };

            // Upstream logs ride piggy-back on every element.
            for delta in &envelope.log_deltas {
                self.causal_log.process_upstream_delta(delta);
            }

            // The consumed order determinant was already re-appended, so
            // the local log stays continuous through the replay.
            let is_record = envelope.element.is_record();
            self.dispatcher.dispatch(envelope.element, channel, true)?;
            if is_record {
                return Ok(true);
            }
            // Watermarks, status changes and markers keep feeding.
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        for deserializer in &mut self.deserializers {
            if let Some(mut buffer) = deserializer.take_current_buffer() {
                if !buffer.is_recycled() {
                    buffer.recycle();
                }
            }
            deserializer.clear();
        }
        for queue in &mut self.queued_buffers {
            for buffer in queue.iter_mut() {
                buffer.recycle();
            }
            queue.clear();
        }
        self.barrier_handler.cleanup()
    }
}

#[cfg(test)]
#[path = "tests/force_feeder_tests.rs"]
mod tests;
