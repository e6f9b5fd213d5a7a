//! The buffer/event stream the input processors consume.
//!
//! Barrier alignment itself is owned by the surrounding runtime; the replay
//! core sees an already-aligned stream of [`BufferOrEvent`] through the
//! [`CheckpointBarrierHandler`] contract, plus a channel-backed
//! implementation for local pipelines and tests.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use super::buffer::NetworkBuffer;
use crate::partition::InFlightLogRequestEvent;
use crate::types::ChannelIndex;

/// Control events that may appear interleaved with data buffers.
#[derive(Debug)]
pub enum TaskEvent {
    /// The upstream subpartition finished; no more data on this channel.
    EndOfPartition,
    /// A downstream task asked for an in-flight log replay. Travels
    /// upstream-ward and must never surface on the consuming path.
    InFlightLogRequest(InFlightLogRequestEvent),
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskEvent::EndOfPartition => f.write_str("EndOfPartition"),
            TaskEvent::InFlightLogRequest(req) => {
                write!(f, "InFlightLogRequest({}[{}])", req.dataset, req.subpartition)
            }
        }
    }
}

/// One unit delivered by the barrier handler: a data buffer or an event,
/// tagged with the absolute channel it arrived on.
#[derive(Debug)]
pub enum BufferOrEvent {
    Buffer {
        channel: ChannelIndex,
        buffer: NetworkBuffer,
    },
    Event {
        channel: ChannelIndex,
        event: TaskEvent,
    },
}

impl BufferOrEvent {
    pub fn channel(&self) -> ChannelIndex {
        match self {
            BufferOrEvent::Buffer { channel, .. } | BufferOrEvent::Event { channel, .. } => {
                *channel
            }
        }
    }
}

/// The aligned buffer/event stream contract (consumed, not owned).
pub trait CheckpointBarrierHandler: Send {
    /// Block for the next buffer or event; `None` means the stream is
    /// definitively finished.
    fn next_non_blocked(&mut self) -> Result<Option<BufferOrEvent>>;

    /// Whether any data is still queued. Checked after end of stream.
    fn is_empty(&self) -> bool;

    /// Release a channel blocked by barrier alignment.
    fn unblock_channel(&mut self, channel: ChannelIndex);

    /// Release handler resources.
    fn cleanup(&mut self) -> Result<()>;

    /// Time spent aligning the current checkpoint.
    fn alignment_duration_nanos(&self) -> i64;

    /// Gauge over [`alignment_duration_nanos`](Self::alignment_duration_nanos)
    /// that outlives the handler borrow, for task IO metric registration.
    fn alignment_gauge(&self) -> crate::metrics::Gauge;
}

/// Barrier handler over a local bounded channel.
///
/// This is the non-aligning variant (no exactly-once barriers flow through
/// local pipelines), so the alignment gauge always reads zero and
/// `unblock_channel` has nothing to release.
pub struct ChannelBarrierHandler {
    receiver: Receiver<BufferOrEvent>,
    ended: bool,
}

impl ChannelBarrierHandler {
    pub fn new(receiver: Receiver<BufferOrEvent>) -> Self {
        Self {
            receiver,
            ended: false,
        }
    }

    /// Create a connected (sender, handler) pair.
    pub fn channel(capacity: usize) -> (Sender<BufferOrEvent>, Self) {
        let (sender, receiver) = bounded(capacity);
        (sender, Self::new(receiver))
    }
}

impl CheckpointBarrierHandler for ChannelBarrierHandler {
    fn next_non_blocked(&mut self) -> Result<Option<BufferOrEvent>> {
        if self.ended {
            return Ok(None);
        }
        match self.receiver.recv() {
            Ok(next) => Ok(Some(next)),
            Err(_) => {
                // All senders dropped: the stream is finished.
                self.ended = true;
                Ok(None)
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    fn unblock_channel(&mut self, _channel: ChannelIndex) {}

    fn cleanup(&mut self) -> Result<()> {
        // Drain and recycle anything still queued.
        loop {
            match self.receiver.try_recv() {
                Ok(BufferOrEvent::Buffer { mut buffer, .. }) => buffer.recycle(),
                Ok(BufferOrEvent::Event { .. }) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(())
    }

    fn alignment_duration_nanos(&self) -> i64 {
        // No alignment happens on local channels.
        0
    }

    fn alignment_gauge(&self) -> crate::metrics::Gauge {
        crate::metrics::Gauge::new(|| 0)
    }
}

/// Upstream-facing handle of one input channel: where task events such as
/// in-flight log replay requests are sent.
pub struct InputChannel {
    pub index: ChannelIndex,
    /// Result partition this channel consumes from.
    pub partition: crate::types::DatasetId,
    /// Subpartition of that partition this channel is subscribed to.
    pub consumed_subpartition: crate::types::SubpartitionIndex,
    event_sender: Sender<InFlightLogRequestEvent>,
}

impl InputChannel {
    pub fn new(
        index: ChannelIndex,
        partition: crate::types::DatasetId,
        consumed_subpartition: crate::types::SubpartitionIndex,
        event_sender: Sender<InFlightLogRequestEvent>,
    ) -> Self {
        Self {
            index,
            partition,
            consumed_subpartition,
            event_sender,
        }
    }

    /// Send a task event to the producer of this channel.
    pub fn send_task_event(&self, event: InFlightLogRequestEvent) -> Result<()> {
        self.event_sender
            .send(event)
            .map_err(|_| anyhow!("input channel {} event peer disconnected", self.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::buffer::BufferPool;

    #[test]
    fn test_stream_ends_when_senders_drop() {
        let pool = BufferPool::new(64);
        let (sender, mut handler) = ChannelBarrierHandler::channel(8);

        sender
            .send(BufferOrEvent::Buffer {
                channel: 1,
                buffer: pool.request_buffer_with(vec![1]),
            })
            .unwrap();
        drop(sender);

        let first = handler.next_non_blocked().unwrap().unwrap();
        assert_eq!(first.channel(), 1);
        match first {
            BufferOrEvent::Buffer { mut buffer, .. } => buffer.recycle(),
            _ => panic!("expected buffer"),
        }

        assert!(handler.next_non_blocked().unwrap().is_none());
        // Finished is latched.
        assert!(handler.next_non_blocked().unwrap().is_none());
        assert!(handler.is_empty());
    }

    #[test]
    fn test_cleanup_recycles_queued_buffers() {
        let pool = BufferPool::new(64);
        let (sender, mut handler) = ChannelBarrierHandler::channel(8);
        sender
            .send(BufferOrEvent::Buffer {
                channel: 0,
                buffer: pool.request_buffer_with(vec![1, 2]),
            })
            .unwrap();
        assert_eq!(pool.outstanding(), 1);
        handler.cleanup().unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_input_channel_send_fails_when_peer_gone() {
        let (sender, receiver) = bounded(1);
        let channel = InputChannel::new(0, crate::types::DatasetId::new(0, 1), 0, sender);
        drop(receiver);
        assert!(channel
            .send_task_event(InFlightLogRequestEvent::new(
                crate::types::DatasetId::new(0, 1),
                0,
                1,
                0
            ))
            .is_err());
    }
}
