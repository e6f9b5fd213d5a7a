use super::*;
use crate::causal::decode_all;
use crate::causal::epoch::EpochTracker;
use crate::causal::log::InMemoryJobCausalLog;
use crate::io::barrier::{BufferOrEvent, ChannelBarrierHandler, TaskEvent};
use crate::io::buffer::BufferPool;
use crate::io::deserializer::{ElementEnvelope, FramedRecordDeserializer};
use crate::metrics::{OperatorMetricGroup, TaskIoMetricGroup, WatermarkGauge};
use crate::operator::SimpleStatusMaintainer;
use crate::partition::InFlightLogRequestEvent;
use crate::types::{DatasetId, StreamElement, StreamRecord, StreamStatus};
use crossbeam_channel::Sender;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OperatorCall {
    Element(i64),
    Watermark(i64),
    LatencyMarker(i64),
}

pub(crate) struct RecordingOperator {
    pub calls: Arc<Mutex<Vec<OperatorCall>>>,
    pub metrics: Option<OperatorMetricGroup>,
}

impl RecordingOperator {
    pub fn with_metrics() -> (Self, Arc<Mutex<Vec<OperatorCall>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                calls: calls.clone(),
                metrics: Some(OperatorMetricGroup::new()),
            },
            calls,
        )
    }

    pub fn without_metrics() -> (Self, Arc<Mutex<Vec<OperatorCall>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                calls: calls.clone(),
                metrics: None,
            },
            calls,
        )
    }
}

impl crate::operator::OneInputStreamOperator<i64> for RecordingOperator {
    fn process_element(&mut self, record: StreamRecord<i64>) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(OperatorCall::Element(record.value));
        Ok(())
    }

    fn process_watermark(&mut self, watermark: crate::types::Watermark) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(OperatorCall::Watermark(watermark.timestamp));
        Ok(())
    }

    fn process_latency_marker(&mut self, marker: crate::types::LatencyMarker) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(OperatorCall::LatencyMarker(marker.marked_time));
        Ok(())
    }

    fn metric_group(&self) -> Option<&OperatorMetricGroup> {
        self.metrics.as_ref()
    }
}

struct Harness {
    sender: Option<Sender<BufferOrEvent>>,
    pool: Arc<BufferPool>,
    processor: StreamInputProcessor<i64, RecordingOperator>,
    calls: Arc<Mutex<Vec<OperatorCall>>>,
    causal_log: Arc<InMemoryJobCausalLog>,
    epoch_tracker: Arc<EpochTracker>,
    watermark_gauge: WatermarkGauge,
}

fn harness(num_channels: usize, with_metrics: bool) -> Harness {
    let (operator, calls) = if with_metrics {
        RecordingOperator::with_metrics()
    } else {
        RecordingOperator::without_metrics()
    };

    let pool = BufferPool::new(4096);
    let (sender, handler) = ChannelBarrierHandler::channel(64);
    let causal_log = Arc::new(InMemoryJobCausalLog::new());
    let epoch_tracker = Arc::new(EpochTracker::new());
    let watermark_gauge = WatermarkGauge::new();
    let task_metrics = TaskIoMetricGroup::new();

    let deserializers = (0..num_channels)
        .map(|_| {
            Box::new(FramedRecordDeserializer::<i64>::new())
                as Box<dyn crate::io::deserializer::RecordDeserializer<i64>>
        })
        .collect();

    let processor = StreamInputProcessor::new(
        "test-task",
        Box::new(handler),
        deserializers,
        Arc::new(Mutex::new(operator)),
        Arc::new(SimpleStatusMaintainer::new()),
        watermark_gauge.clone(),
        causal_log.clone(),
        epoch_tracker.clone(),
        &task_metrics,
    )
    .unwrap();

    Harness {
        sender: Some(sender),
        pool,
        processor,
        calls,
        causal_log,
        epoch_tracker,
        watermark_gauge,
    }
}

impl Harness {
    fn send_buffer(&self, channel: usize, elements: &[StreamElement<i64>]) {
        let mut bytes = Vec::new();
        for element in elements {
            bytes.extend(ElementEnvelope::new(element.clone()).encode_frame().unwrap());
        }
        self.sender
            .as_ref()
            .unwrap()
            .send(BufferOrEvent::Buffer {
                channel,
                buffer: self.pool.request_buffer_with(bytes),
            })
            .unwrap();
    }

    fn send_event(&self, channel: usize, event: TaskEvent) {
        self.sender
            .as_ref()
            .unwrap()
            .send(BufferOrEvent::Event { channel, event })
            .unwrap();
    }

    fn close_input(&mut self) {
        self.sender = None;
    }

    fn run_to_end(&mut self) {
        while self.processor.process_input().unwrap() {}
    }

    fn recorded(&self) -> Vec<OperatorCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[test]
fn test_two_channel_interleaving() {
    let mut h = harness(2, true);
    h.send_buffer(0, &[StreamElement::record(1)]); // A
    h.send_buffer(1, &[StreamElement::record(3)]); // C
    h.send_buffer(0, &[StreamElement::record(2)]); // B
    h.send_event(0, TaskEvent::EndOfPartition);
    h.send_event(1, TaskEvent::EndOfPartition);
    h.close_input();

    h.run_to_end();

    assert_eq!(
        h.recorded(),
        vec![
            OperatorCall::Element(1),
            OperatorCall::Element(3),
            OperatorCall::Element(2)
        ]
    );
    assert_eq!(h.epoch_tracker.record_count(), 3);
    assert_eq!(
        decode_all(&h.causal_log.main_thread_log()).unwrap(),
        vec![
            crate::causal::Determinant::Order { channel: 0 },
            crate::causal::Determinant::Order { channel: 1 },
            crate::causal::Determinant::Order { channel: 0 },
        ]
    );
    assert_eq!(h.processor.num_records_in(), 3);
    // Every buffer went back to the pool exactly once.
    assert_eq!(h.pool.outstanding(), 0);
}

#[test]
fn test_record_counter_counts_every_element_kind() {
    let mut h = harness(1, true);
    h.send_buffer(
        0,
        &[
            StreamElement::record(1),
            StreamElement::watermark(10),
            StreamElement::latency_marker(99),
            StreamElement::status(StreamStatus::Idle),
        ],
    );
    h.close_input();
    h.run_to_end();

    // One increment per consumed element regardless of kind.
    assert_eq!(h.epoch_tracker.record_count(), 4);
    // Only the data record hits the operator's record counter.
    assert_eq!(h.processor.num_records_in(), 1);
}

#[test]
fn test_watermark_aggregation_across_channels() {
    let mut h = harness(2, true);
    h.send_buffer(0, &[StreamElement::watermark(100)]);
    h.send_buffer(1, &[StreamElement::watermark(50)]);
    h.send_buffer(1, &[StreamElement::watermark(120)]);
    h.close_input();
    h.run_to_end();

    assert_eq!(
        h.recorded(),
        vec![OperatorCall::Watermark(100), OperatorCall::Watermark(120)]
    );
    assert_eq!(h.watermark_gauge.value(), 120);
}

#[test]
fn test_unexpected_event_is_fatal() {
    let mut h = harness(1, true);
    h.send_event(
        0,
        TaskEvent::InFlightLogRequest(InFlightLogRequestEvent::new(
            DatasetId::new(1, 1),
            0,
            0,
            0,
        )),
    );
    h.close_input();

    let err = loop {
        match h.processor.process_input() {
            Ok(true) => continue,
            Ok(false) => panic!("stream ended without the expected failure"),
            Err(err) => break err,
        }
    };
    assert!(matches!(
        err.downcast_ref::<crate::causal::CausalError>(),
        Some(crate::causal::CausalError::UnexpectedEvent(_))
    ));
    assert!(h.recorded().is_empty());
}

#[test]
fn test_buffer_for_unknown_channel_is_fatal() {
    let mut h = harness(1, true);
    h.send_buffer(5, &[StreamElement::record(1)]);
    h.close_input();

    let err = h.processor.process_input().unwrap_err();
    assert!(err.to_string().contains("unknown channel"));
    assert!(h.recorded().is_empty());
}

#[test]
fn test_end_of_partition_is_tolerated_and_finish_latches() {
    let mut h = harness(1, true);
    h.send_event(0, TaskEvent::EndOfPartition);
    h.close_input();

    assert!(h.processor.process_input().unwrap());
    assert!(!h.processor.process_input().unwrap());
    // Latched.
    assert!(!h.processor.process_input().unwrap());
}

#[test]
fn test_metrics_fallback_without_operator_group() {
    let mut h = harness(1, false);
    h.send_buffer(0, &[StreamElement::record(7)]);
    h.close_input();
    h.run_to_end();

    assert_eq!(h.recorded(), vec![OperatorCall::Element(7)]);
    // The local fallback counter still counts.
    assert_eq!(h.processor.num_records_in(), 1);
}

#[test]
fn test_cleanup_recycles_pinned_buffer() {
    let mut h = harness(1, true);
    h.send_buffer(0, &[StreamElement::record(1), StreamElement::record(2)]);

    // Pin the channel and extract only the first record, leaving the
    // buffer held by the deserializer.
    assert!(h.processor.process_input().unwrap());
    assert!(h.processor.process_input().unwrap());
    assert_eq!(h.processor.current_channel(), Some(0));
    assert_eq!(h.pool.outstanding(), 1);

    h.processor.cleanup().unwrap();
    assert_eq!(h.pool.outstanding(), 0);
}

#[test]
fn test_reset_channel_deserializer_unpins() {
    let mut h = harness(1, true);
    h.send_buffer(0, &[StreamElement::record(1), StreamElement::record(2)]);
    assert!(h.processor.process_input().unwrap());
    assert_eq!(h.processor.current_channel(), Some(0));

    h.processor.reset_channel_deserializer(0);
    assert_eq!(h.processor.current_channel(), None);
    assert_eq!(h.pool.outstanding(), 0);
}

// --- trailing data needs a scripted handler ---

struct ScriptedHandler {
    items: VecDeque<BufferOrEvent>,
    trailing_data_at_eof: bool,
}

impl crate::io::barrier::CheckpointBarrierHandler for ScriptedHandler {
    fn next_non_blocked(&mut self) -> anyhow::Result<Option<BufferOrEvent>> {
        Ok(self.items.pop_front())
    }

    fn is_empty(&self) -> bool {
        !self.trailing_data_at_eof
    }

    fn unblock_channel(&mut self, _channel: usize) {}

    fn cleanup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn alignment_duration_nanos(&self) -> i64 {
        0
    }

    fn alignment_gauge(&self) -> crate::metrics::Gauge {
        crate::metrics::Gauge::new(|| 0)
    }
}

#[test]
fn test_trailing_barrier_data_is_fatal() {
    let (operator, _calls) = RecordingOperator::with_metrics();
    let processor_result = StreamInputProcessor::new(
        "trailing-task",
        Box::new(ScriptedHandler {
            items: VecDeque::new(),
            trailing_data_at_eof: true,
        }),
        vec![
            Box::new(FramedRecordDeserializer::<i64>::new())
                as Box<dyn crate::io::deserializer::RecordDeserializer<i64>>,
        ],
        Arc::new(Mutex::new(operator)),
        Arc::new(SimpleStatusMaintainer::new()),
        WatermarkGauge::new(),
        Arc::new(InMemoryJobCausalLog::new()),
        Arc::new(EpochTracker::new()),
        &TaskIoMetricGroup::new(),
    );
    let mut processor = processor_result.unwrap();

    let err = processor.process_input().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<crate::causal::CausalError>(),
        Some(crate::causal::CausalError::TrailingBarrierData)
    ));
}
