//! The replaying state: cursor over the main-thread determinant stream and
//! parallel rebuild of the output in-flight logs.
//!
//! Every determinant consumed here is re-appended to the local causal log,
//! so the log stays continuous across the failure: when the last byte of
//! the recovery buffer is consumed, the rebuilt log must be byte-for-byte
//! as long as the authoritative one.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::RecoveryContext;
use crate::causal::determinant::{Determinant, DeterminantCursor};
use crate::causal::log::VertexCausalLogDelta;
use crate::causal::CausalError;
use crate::partition::PipelinedSubpartition;
use crate::types::{DatasetId, EventTime, SubpartitionIndex};

/// A decoded determinant waiting to be consumed, plus the record count at
/// which it fires if it is asynchronous.
struct PendingDeterminant {
    determinant: Determinant,
    /// For async determinants: the record count at emission time,
    /// reconstructed as the number of `Order` determinants preceding it in
    /// the stream. Unused for synchronous kinds.
    target_record_count: u64,
}

pub(super) struct ReplayingState {
    main_buffer: Vec<u8>,
    position: usize,
    next: Option<PendingDeterminant>,
    /// `Order` determinants consumed so far; equals the record count during
    /// a consistent replay.
    orders_consumed: u64,
    had_main_delta: bool,
}

impl ReplayingState {
    /// Enter replay: spawn subpartition recovery threads and prepare the
    /// first main-thread determinant.
    pub(super) fn enter(
        context: &Arc<RecoveryContext>,
        delta: VertexCausalLogDelta,
    ) -> Result<Self> {
        for (dataset, subpartitions) in &delta.partition_deltas {
            for (index, buffer) in subpartitions {
                spawn_subpartition_recovery(context, *dataset, *index, buffer.clone())?;
            }
        }

        let had_main_delta = delta.main_thread_delta.is_some();
        let mut state = Self {
            main_buffer: delta.main_thread_delta.unwrap_or_default(),
            position: 0,
            next: None,
            orders_consumed: 0,
            had_main_delta,
        };
        state.prepare_next()?;
        Ok(state)
    }

    /// Whether the main-thread stream has no determinant left to serve.
    pub(super) fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }

    pub(super) fn replay_next_channel(&mut self, context: &Arc<RecoveryContext>) -> Result<u8> {
        match self.peek()? {
            Determinant::Order { channel } => {
                self.consume_and_relog(context)?;
                Ok(channel)
            }
            other => Err(unexpected("Order", other)),
        }
    }

    pub(super) fn replay_next_timestamp(
        &mut self,
        context: &Arc<RecoveryContext>,
    ) -> Result<EventTime> {
        match self.peek()? {
            Determinant::Timestamp { millis } => {
                self.consume_and_relog(context)?;
                Ok(millis)
            }
            other => Err(unexpected("Timestamp", other)),
        }
    }

    pub(super) fn replay_random_int(&mut self, context: &Arc<RecoveryContext>) -> Result<i32> {
        match self.peek()? {
            Determinant::Rng { value } => {
                self.consume_and_relog(context)?;
                Ok(value)
            }
            other => Err(unexpected("RNG", other)),
        }
    }

    pub(super) fn replay_random_emit(&mut self, context: &Arc<RecoveryContext>) -> Result<u8> {
        match self.peek()? {
            Determinant::RandomEmit { channel } => {
                self.consume_and_relog(context)?;
                Ok(channel)
            }
            other => Err(unexpected("RandomEmit", other)),
        }
    }

    /// Drive async determinants that are due at the current record count.
    ///
    /// An async determinant fires when the record counter reaches its
    /// target exactly; a counter past the target means the replay diverged
    /// and the task must fail.
    pub(super) fn check_async_event(&mut self, context: &Arc<RecoveryContext>) -> Result<()> {
        while let Some(pending) = &self.next {
            if !pending.determinant.is_async() {
                break;
            }
            let current = context.epoch_tracker.record_count();
            let target = pending.target_record_count;
            if current > target {
                return Err(CausalError::RecordCountOvershot { current, target }.into());
            }
            if current < target {
                break;
            }

            let determinant = pending.determinant;
            tracing::debug!("firing async determinant {determinant} at record count {current}");
            // Prepare the following determinant first: processing the async
            // event may itself consume determinants.
            self.next = None;
            context.job_causal_log.append_main_thread(&determinant);
            self.prepare_next()?;
            apply_async(&determinant, context)?;
        }
        Ok(())
    }

    /// Exit replay: the rebuilt main-thread log must be exactly as long as
    /// the recovery buffer we consumed. A missing main-thread delta means
    /// there is nothing to compare.
    pub(super) fn finish(self, context: &Arc<RecoveryContext>) -> Result<()> {
        if self.had_main_delta {
            let authoritative = context.job_causal_log.main_thread_log_length();
            if self.main_buffer.len() != authoritative {
                return Err(CausalError::ReplayLengthMismatch {
                    consumed: self.main_buffer.len(),
                    authoritative,
                }
                .into());
            }
        }
        tracing::info!("finished replaying main thread, transitioning to running");
        Ok(())
    }

    fn peek(&self) -> Result<Determinant> {
        self.next
            .as_ref()
            .map(|pending| pending.determinant)
            .ok_or_else(|| anyhow!("no determinant prepared in replaying state"))
    }

    /// Consume the prepared determinant, append it to the local log and
    /// prepare the next one.
    fn consume_and_relog(&mut self, context: &Arc<RecoveryContext>) -> Result<()> {
        let pending = self
            .next
            .take()
            .ok_or_else(|| anyhow!("no determinant prepared in replaying state"))?;
        if matches!(pending.determinant, Determinant::Order { .. }) {
            self.orders_consumed += 1;
        }
        context.job_causal_log.append_main_thread(&pending.determinant);
        self.prepare_next()?;
        Ok(())
    }

    fn prepare_next(&mut self) -> Result<(), CausalError> {
        self.next = None;
        let mut cursor = DeterminantCursor::new(&self.main_buffer[self.position..]);
        if let Some(determinant) = cursor.decode_next()? {
            self.position += cursor.consumed();
            self.next = Some(PendingDeterminant {
                determinant,
                target_record_count: self.orders_consumed,
            });
        }
        Ok(())
    }
}

fn unexpected(expected: &'static str, got: Determinant) -> anyhow::Error {
    CausalError::UnexpectedDeterminant {
        expected,
        got: got.to_string(),
    }
    .into()
}

/// Apply a due async determinant against the recovery context.
fn apply_async(determinant: &Determinant, context: &Arc<RecoveryContext>) -> Result<()> {
    match *determinant {
        Determinant::BufferBuilt {
            dataset,
            subpartition,
            bytes,
        } => {
            let target = context
                .subpartition_table
                .get(dataset, subpartition)
                .ok_or_else(|| anyhow!("async determinant names unknown subpartition {dataset}[{subpartition}]"))?;
            target.build_buffer(bytes as usize, &context.cancelled)
        }
        ref other => Err(anyhow!("determinant {other} is not asynchronous")),
    }
}

/// One recovery thread per (dataset, subpartition) delta.
///
/// Threads run detached and in parallel; `recovering_subpartitions` tracks
/// how many are still at work, and fatal errors are parked on the context
/// for the task thread to pick up.
fn spawn_subpartition_recovery(
    context: &Arc<RecoveryContext>,
    dataset: DatasetId,
    index: SubpartitionIndex,
    buffer: Vec<u8>,
) -> Result<()> {
    let subpartition = context
        .subpartition_table
        .get(dataset, index)
        .ok_or_else(|| anyhow!("no subpartition {dataset}[{index}] to recover"))?;
    let context = Arc::clone(context);

    std::thread::Builder::new()
        .name(format!("subpartition-recovery-{dataset}-{index}"))
        .spawn(move || {
            tracing::info!(
                "recovering subpartition {dataset}[{index}] from {} log bytes",
                buffer.len()
            );
            context.recovering_subpartitions.fetch_add(1, Ordering::SeqCst);
            let outcome = recover_subpartition(&context, &subpartition, dataset, index, &buffer);
            // Balanced on every exit path, success, failure or cancellation.
            context.recovering_subpartitions.fetch_sub(1, Ordering::SeqCst);
            match outcome {
                Ok(()) => {
                    tracing::info!("subpartition {dataset}[{index}] free to resume sending");
                }
                Err(err) => {
                    tracing::error!("subpartition {dataset}[{index}] recovery failed: {err}");
                    context.record_failure(err);
                }
            }
        })
        .map_err(|err| anyhow!("failed to spawn recovery thread: {err}"))?;
    Ok(())
}

fn recover_subpartition(
    context: &Arc<RecoveryContext>,
    subpartition: &Arc<PipelinedSubpartition>,
    dataset: DatasetId,
    index: SubpartitionIndex,
    buffer: &[u8],
) -> Result<()> {
    // While flagged, the network layer reports no data for this subpartition.
    subpartition.set_recovering_in_flight(true);

    let mut cursor = DeterminantCursor::new(buffer);
    loop {
        if context.cancelled.load(Ordering::SeqCst) {
            return Ok(());
        }
        match cursor.decode_next()? {
            None => break,
            Some(Determinant::BufferBuilt { bytes, .. }) => {
                tracing::debug!("rebuilding buffer of {bytes} bytes on {dataset}[{index}]");
                subpartition.build_and_log_buffer(bytes as usize, &context.cancelled)?;
            }
            Some(other) => return Err(unexpected("BufferBuilt", other)),
        }
    }

    let authoritative = context.job_causal_log.subpartition_log_length(dataset, index);
    if cursor.consumed() != authoritative {
        return Err(CausalError::ReplayLengthMismatch {
            consumed: cursor.consumed(),
            authoritative,
        }
        .into());
    }

    // Serve a replay request that arrived mid-recovery before un-flagging,
    // so downstream never observes a half-rebuilt log.
    let unanswered = context
        .unanswered_requests
        .lock()
        .expect("unanswered request lock")
        .remove(&(dataset, index));
    if let Some(request) = unanswered {
        tracing::info!("answering queued in-flight log request for {dataset}[{index}]");
        subpartition.request_replay(request.epoch, request.buffers_to_skip);
    }

    subpartition.set_recovering_in_flight(false);
    subpartition.notify_data_available();
    Ok(())
}
