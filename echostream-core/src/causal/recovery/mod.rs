//! Recovery state machine: `WaitingConnections → Replaying → Running`.
//!
//! A standby replica sits in `WaitingConnections` until the causal log
//! delta of the failed task arrives. `start_replay` moves it into
//! `Replaying`: subpartition recovery threads rebuild the output in-flight
//! logs in parallel while the task thread force-feeds input through the
//! main-thread determinant stream. When the stream is exhausted and the
//! rebuilt log matches the authoritative length, the task transitions to
//! `Running` and processes live input from then on.

mod replaying;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ahash::AHashMap;
use anyhow::{anyhow, Result};

use self::replaying::ReplayingState;
use super::epoch::EpochTracker;
use super::log::{JobCausalLog, VertexCausalLogDelta};
use crate::io::barrier::InputChannel;
use crate::partition::{InFlightLogRequestEvent, SubpartitionTable};
use crate::types::{ChannelIndex, DatasetId, EventTime, SubpartitionIndex};

/// One-shot completion signal.
///
/// The task's run method blocks on this until recovery is far enough along
/// that replay (or live processing) may begin.
#[derive(Default)]
pub struct ReadySignal {
    complete: Mutex<bool>,
    cond: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the signal. Idempotent.
    pub fn complete(&self) {
        let mut complete = self.complete.lock().expect("ready signal lock");
        if !*complete {
            *complete = true;
            self.cond.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.lock().expect("ready signal lock")
    }

    /// Block until completed.
    pub fn wait(&self) {
        let mut complete = self.complete.lock().expect("ready signal lock");
        while !*complete {
            complete = self.cond.wait(complete).expect("ready signal lock");
        }
    }
}

/// State shared between the recovery manager, the input processors and the
/// subpartition recovery threads.
pub struct RecoveryContext {
    pub job_causal_log: Arc<dyn JobCausalLog>,
    pub epoch_tracker: Arc<EpochTracker>,
    pub subpartition_table: Arc<SubpartitionTable>,
    /// Replay requests that arrived while the matching subpartition was
    /// still recovering; answered by its recovery thread on completion.
    pub unanswered_requests: Mutex<AHashMap<(DatasetId, SubpartitionIndex), InFlightLogRequestEvent>>,
    /// Subpartition recovery threads currently in flight. Observation only.
    pub recovering_subpartitions: AtomicI32,
    pub ready_to_replay: ReadySignal,
    /// Raised on task teardown; recovery threads observe it and bail out.
    pub cancelled: AtomicBool,
    failure: Mutex<Option<anyhow::Error>>,
}

impl RecoveryContext {
    fn new(
        job_causal_log: Arc<dyn JobCausalLog>,
        epoch_tracker: Arc<EpochTracker>,
        subpartition_table: Arc<SubpartitionTable>,
    ) -> Self {
        Self {
            job_causal_log,
            epoch_tracker,
            subpartition_table,
            unanswered_requests: Mutex::new(AHashMap::new()),
            recovering_subpartitions: AtomicI32::new(0),
            ready_to_replay: ReadySignal::new(),
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Record a fatal failure raised off the task thread. First one wins.
    pub fn record_failure(&self, err: anyhow::Error) {
        let mut slot = self.failure.lock().expect("failure lock");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Take the recorded failure, if any. The task checks this at its
    /// scheduling boundaries.
    pub fn take_failure(&self) -> Option<anyhow::Error> {
        self.failure.lock().expect("failure lock").take()
    }
}

enum RecoveryState {
    WaitingConnections,
    Replaying(ReplayingState),
    Running,
}

impl RecoveryState {
    fn name(&self) -> &'static str {
        match self {
            RecoveryState::WaitingConnections => "WaitingConnections",
            RecoveryState::Replaying(_) => "Replaying",
            RecoveryState::Running => "Running",
        }
    }
}

/// Drives a task through recovery and answers replay queries.
pub struct RecoveryManager {
    context: Arc<RecoveryContext>,
    state: Mutex<RecoveryState>,
}

impl RecoveryManager {
    pub fn new(
        job_causal_log: Arc<dyn JobCausalLog>,
        epoch_tracker: Arc<EpochTracker>,
        subpartition_table: Arc<SubpartitionTable>,
    ) -> Self {
        Self {
            context: Arc::new(RecoveryContext::new(
                job_causal_log,
                epoch_tracker,
                subpartition_table,
            )),
            state: Mutex::new(RecoveryState::WaitingConnections),
        }
    }

    pub fn context(&self) -> &Arc<RecoveryContext> {
        &self.context
    }

    /// Whether the task is anywhere short of live processing.
    pub fn is_recovering(&self) -> bool {
        !matches!(*self.state.lock().expect("recovery state lock"), RecoveryState::Running)
    }

    /// Whether the main-thread determinant stream is still being replayed.
    pub fn is_replaying(&self) -> bool {
        matches!(
            *self.state.lock().expect("recovery state lock"),
            RecoveryState::Replaying(_)
        )
    }

    /// Fresh start with nothing to recover.
    pub fn start_running(&self) -> Result<()> {
        let mut slot = self.state.lock().map_err(|_| anyhow!("recovery state lock poisoned"))?;
        match *slot {
            RecoveryState::WaitingConnections => {
                *slot = RecoveryState::Running;
                self.context.ready_to_replay.complete();
                Ok(())
            }
            ref other => Err(anyhow!("cannot start running from state {}", other.name())),
        }
    }

    /// Enter the replaying state with the recovered causal log delta.
    ///
    /// Spawns one recovery thread per subpartition delta, prepares the
    /// first main-thread determinant and unblocks the task's run method.
    /// An empty main-thread delta finishes replaying immediately.
    pub fn start_replay(&self, delta: VertexCausalLogDelta) -> Result<()> {
        let mut slot = self.state.lock().map_err(|_| anyhow!("recovery state lock poisoned"))?;
        if !matches!(*slot, RecoveryState::WaitingConnections) {
            return Err(anyhow!("cannot start replay from state {}", slot.name()));
        }

        tracing::info!(
            "entering replaying state: main delta {} bytes, {} partition delta(s)",
            delta.main_thread_delta.as_ref().map_or(0, Vec::len),
            delta.partition_deltas.values().map(|subs| subs.len()).sum::<usize>(),
        );

        let state = ReplayingState::enter(&self.context, delta)?;
        if state.is_exhausted() {
            state.finish(&self.context)?;
            *slot = RecoveryState::Running;
        } else {
            *slot = RecoveryState::Replaying(state);
        }
        self.context.ready_to_replay.complete();
        Ok(())
    }

    /// Next input channel to read, per the `Order` determinant stream.
    pub fn replay_next_channel(&self) -> Result<ChannelIndex> {
        self.with_replaying("replay_next_channel", |state, context| {
            state.replay_next_channel(context)
        })
        .map(|channel| channel as ChannelIndex)
    }

    /// Next logged wall-clock reading.
    pub fn replay_next_timestamp(&self) -> Result<EventTime> {
        self.with_replaying("replay_next_timestamp", ReplayingState::replay_next_timestamp)
    }

    /// Next logged RNG draw.
    pub fn replay_random_int(&self) -> Result<i32> {
        self.with_replaying("replay_random_int", ReplayingState::replay_random_int)
    }

    /// Next logged random-routing channel pick.
    pub fn replay_random_emit_channel(&self) -> Result<ChannelIndex> {
        self.with_replaying("replay_random_emit_channel", |state, context| {
            state.replay_random_emit(context)
        })
        .map(|channel| channel as ChannelIndex)
    }

    /// Fire any async determinants whose record count has been reached.
    /// No-op outside the replaying state.
    pub fn check_async_event(&self) -> Result<()> {
        let mut slot = self.state.lock().map_err(|_| anyhow!("recovery state lock poisoned"))?;
        let RecoveryState::Replaying(state) = &mut *slot else {
            return Ok(());
        };
        state.check_async_event(&self.context)?;
        if state.is_exhausted() {
            self.finish_slot(&mut slot)?;
        }
        Ok(())
    }

    /// A new input channel appeared while we were replaying: ask its
    /// producer to resend the in-flight log, skipping what we already have.
    /// IO failure is logged, not fatal.
    pub fn notify_new_input_channel(&self, channel: &InputChannel, buffers_removed: usize) {
        let slot = self.state.lock().expect("recovery state lock");
        if !matches!(*slot, RecoveryState::Replaying(_)) {
            tracing::debug!(
                "new input channel {} in state {}, nothing to re-request",
                channel.index,
                slot.name()
            );
            return;
        }
        let event = InFlightLogRequestEvent::new(
            channel.partition,
            channel.consumed_subpartition,
            self.context.epoch_tracker.current_epoch(),
            buffers_removed,
        );
        tracing::info!(
            "new input channel {} while replaying, re-requesting in-flight log (skip {})",
            channel.index,
            buffers_removed
        );
        if let Err(err) = channel.send_task_event(event) {
            tracing::warn!("in-flight log request on channel {} failed: {err}", channel.index);
        }
    }

    /// A downstream task asked us to resend a subpartition's in-flight log.
    pub fn notify_in_flight_log_request(&self, event: InFlightLogRequestEvent) {
        let slot = self.state.lock().expect("recovery state lock");
        if matches!(*slot, RecoveryState::Running) {
            match self
                .context
                .subpartition_table
                .get(event.dataset, event.subpartition)
            {
                Some(subpartition) => {
                    subpartition.request_replay(event.epoch, event.buffers_to_skip)
                }
                None => tracing::warn!(
                    "in-flight log request for unknown subpartition {}[{}]",
                    event.dataset,
                    event.subpartition
                ),
            }
        } else {
            // Answered by the subpartition's recovery thread once it is done.
            self.context
                .unanswered_requests
                .lock()
                .expect("unanswered request lock")
                .insert((event.dataset, event.subpartition), event);
        }
    }

    /// Task teardown: recovery threads observe this and stop.
    pub fn cancel(&self) {
        self.context.cancelled.store(true, Ordering::SeqCst);
        // Unblock a task waiting on the signal.
        self.context.ready_to_replay.complete();
    }

    fn with_replaying<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut ReplayingState, &Arc<RecoveryContext>) -> Result<R>,
    ) -> Result<R> {
        let mut slot = self.state.lock().map_err(|_| anyhow!("recovery state lock poisoned"))?;
        match &mut *slot {
            RecoveryState::Replaying(state) => {
                let out = f(state, &self.context)?;
                if state.is_exhausted() {
                    self.finish_slot(&mut slot)?;
                }
                Ok(out)
            }
            other => Err(anyhow!("{op} called in state {}", other.name())),
        }
    }

    fn finish_slot(&self, slot: &mut RecoveryState) -> Result<()> {
        let finished = std::mem::replace(slot, RecoveryState::Running);
        match finished {
            RecoveryState::Replaying(state) => state.finish(&self.context),
            _ => unreachable!("finish_slot outside replaying state"),
        }
    }
}

#[cfg(test)]
#[path = "../tests/recovery_tests.rs"]
mod tests;
