//! Output subpartitions and their recoverable in-flight logs.
//!
//! Each output channel of a task's result partition is a
//! [`PipelinedSubpartition`]. Buffers that went downstream but are not yet
//! covered by a completed epoch form the *in-flight log*; a recovering
//! downstream asks for them again via [`InFlightLogRequestEvent`], and a
//! recovering upstream rebuilds them from `BufferBuilt` determinants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{anyhow, Result};

use crate::causal::determinant::Determinant;
use crate::causal::log::JobCausalLog;
use crate::types::{DatasetId, EpochId, SubpartitionIndex};

/// Request from a recovering downstream task: resend the in-flight log of
/// one subpartition, skipping the buffers it already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightLogRequestEvent {
    pub dataset: DatasetId,
    pub subpartition: SubpartitionIndex,
    pub epoch: EpochId,
    pub buffers_to_skip: usize,
}

impl InFlightLogRequestEvent {
    pub fn new(
        dataset: DatasetId,
        subpartition: SubpartitionIndex,
        epoch: EpochId,
        buffers_to_skip: usize,
    ) -> Self {
        Self {
            dataset,
            subpartition,
            epoch,
            buffers_to_skip,
        }
    }
}

#[derive(Debug, Default)]
struct SubpartitionInner {
    /// Bytes emitted by the operator but not yet cut into a buffer.
    pending: Vec<u8>,
    /// Finished buffers downstream has not acknowledged past.
    in_flight: Vec<Vec<u8>>,
    /// Next in-flight buffer the downstream poll will see.
    read_cursor: usize,
}

/// One output subpartition with a rebuildable in-flight log.
pub struct PipelinedSubpartition {
    dataset: DatasetId,
    index: SubpartitionIndex,
    causal_log: Arc<dyn JobCausalLog>,
    inner: Mutex<SubpartitionInner>,
    data_arrived: Condvar,
    /// While set, downstream polls report no data.
    recovering_in_flight: AtomicBool,
    data_available: AtomicBool,
}

impl PipelinedSubpartition {
    pub fn new(
        dataset: DatasetId,
        index: SubpartitionIndex,
        causal_log: Arc<dyn JobCausalLog>,
    ) -> Self {
        Self {
            dataset,
            index,
            causal_log,
            inner: Mutex::new(SubpartitionInner::default()),
            data_arrived: Condvar::new(),
            recovering_in_flight: AtomicBool::new(false),
            data_available: AtomicBool::new(false),
        }
    }

    pub fn dataset(&self) -> DatasetId {
        self.dataset
    }

    pub fn index(&self) -> SubpartitionIndex {
        self.index
    }

    /// Stage operator output for the next buffer cut.
    pub fn add_data(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("subpartition lock");
        inner.pending.extend_from_slice(bytes);
        self.data_arrived.notify_all();
    }

    /// Cut all currently staged bytes into one finished buffer and log the
    /// cut point. Live output path.
    pub fn cut_buffer(&self) -> Result<usize> {
        let mut inner = self.inner.lock().expect("subpartition lock");
        if inner.pending.is_empty() {
            return Ok(0);
        }
        let bytes = std::mem::take(&mut inner.pending);
        let len = bytes.len();
        inner.in_flight.push(bytes);
        self.causal_log.append_subpartition(
            self.dataset,
            self.index,
            &Determinant::BufferBuilt {
                dataset: self.dataset,
                subpartition: self.index,
                bytes: len as i32,
            },
        );
        self.data_available.store(true, Ordering::SeqCst);
        Ok(len)
    }

    /// Rebuild one in-flight buffer of exactly `num_bytes` bytes and re-log
    /// the cut point. Recovery path; blocks until the replaying operator
    /// has staged enough output, or `abort` is raised.
    pub fn build_and_log_buffer(&self, num_bytes: usize, abort: &AtomicBool) -> Result<()> {
        self.rebuild_buffer(num_bytes, abort, true)
    }

    /// Rebuild one in-flight buffer without touching the causal log, for
    /// cut points that were logged on the task thread.
    pub fn build_buffer(&self, num_bytes: usize, abort: &AtomicBool) -> Result<()> {
        self.rebuild_buffer(num_bytes, abort, false)
    }

    fn rebuild_buffer(&self, num_bytes: usize, abort: &AtomicBool, log_cut: bool) -> Result<()> {
        let mut inner = self.inner.lock().expect("subpartition lock");
        while inner.pending.len() < num_bytes {
            if abort.load(Ordering::SeqCst) {
                return Err(anyhow!(
                    "subpartition {}[{}] recovery aborted",
                    self.dataset,
                    self.index
                ));
            }
            let (guard, _timeout) = self
                .data_arrived
                .wait_timeout(inner, Duration::from_millis(50))
                .map_err(|_| anyhow!("subpartition lock poisoned"))?;
            inner = guard;
        }
        let rest = inner.pending.split_off(num_bytes);
        let buffer = std::mem::replace(&mut inner.pending, rest);
        inner.in_flight.push(buffer);
        if log_cut {
            self.causal_log.append_subpartition(
                self.dataset,
                self.index,
                &Determinant::BufferBuilt {
                    dataset: self.dataset,
                    subpartition: self.index,
                    bytes: num_bytes as i32,
                },
            );
        }
        Ok(())
    }

    /// Flag or clear in-flight recovery. While flagged, the network layer
    /// sees no data for this subpartition.
    pub fn set_recovering_in_flight(&self, recovering: bool) {
        self.recovering_in_flight.store(recovering, Ordering::SeqCst);
    }

    pub fn is_recovering_in_flight(&self) -> bool {
        self.recovering_in_flight.load(Ordering::SeqCst)
    }

    /// Restart downstream consumption at `buffers_to_skip` buffers into the
    /// in-flight log.
    pub fn request_replay(&self, epoch: EpochId, buffers_to_skip: usize) {
        let mut inner = self.inner.lock().expect("subpartition lock");
        inner.read_cursor = buffers_to_skip;
        tracing::info!(
            "subpartition {}[{}]: replay requested for epoch {epoch}, skipping {buffers_to_skip} buffers",
            self.dataset,
            self.index
        );
        self.data_available.store(true, Ordering::SeqCst);
    }

    pub fn notify_data_available(&self) {
        self.data_available.store(true, Ordering::SeqCst);
    }

    pub fn is_data_available(&self) -> bool {
        self.data_available.load(Ordering::SeqCst)
    }

    /// Next in-flight buffer for downstream, or `None` while the
    /// subpartition is being recovered or the log is drained.
    pub fn poll_next_buffer(&self) -> Option<Vec<u8>> {
        if self.is_recovering_in_flight() {
            return None;
        }
        let mut inner = self.inner.lock().expect("subpartition lock");
        if inner.read_cursor >= inner.in_flight.len() {
            self.data_available.store(false, Ordering::SeqCst);
            return None;
        }
        let buffer = inner.in_flight[inner.read_cursor].clone();
        inner.read_cursor += 1;
        Some(buffer)
    }

    /// Number of buffers in the in-flight log.
    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().expect("subpartition lock").in_flight.len()
    }
}

/// Lookup table from (dataset, subpartition) to the live subpartition.
#[derive(Default)]
pub struct SubpartitionTable {
    entries: Mutex<AHashMap<(DatasetId, SubpartitionIndex), Arc<PipelinedSubpartition>>>,
}

impl SubpartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subpartition: Arc<PipelinedSubpartition>) {
        self.entries
            .lock()
            .expect("subpartition table lock")
            .insert((subpartition.dataset(), subpartition.index()), subpartition);
    }

    pub fn get(
        &self,
        dataset: DatasetId,
        index: SubpartitionIndex,
    ) -> Option<Arc<PipelinedSubpartition>> {
        self.entries
            .lock()
            .expect("subpartition table lock")
            .get(&(dataset, index))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causal::log::InMemoryJobCausalLog;

    fn subpartition() -> (Arc<InMemoryJobCausalLog>, PipelinedSubpartition) {
        let log = Arc::new(InMemoryJobCausalLog::new());
        let sub = PipelinedSubpartition::new(DatasetId::new(1, 2), 0, log.clone());
        (log, sub)
    }

    #[test]
    fn test_cut_buffer_logs_cut_point() {
        let (log, sub) = subpartition();
        sub.add_data(&[1, 2, 3, 4]);
        assert_eq!(sub.cut_buffer().unwrap(), 4);
        assert_eq!(sub.in_flight_len(), 1);
        // One BufferBuilt determinant: 22 bytes.
        assert_eq!(log.subpartition_log_length(DatasetId::new(1, 2), 0), 22);
    }

    #[test]
    fn test_cut_buffer_with_nothing_staged() {
        let (log, sub) = subpartition();
        assert_eq!(sub.cut_buffer().unwrap(), 0);
        assert_eq!(sub.in_flight_len(), 0);
        assert_eq!(log.subpartition_log_length(DatasetId::new(1, 2), 0), 0);
    }

    #[test]
    fn test_build_and_log_cuts_exact_lengths() {
        let (log, sub) = subpartition();
        let abort = AtomicBool::new(false);
        sub.add_data(&[0; 10]);
        sub.build_and_log_buffer(6, &abort).unwrap();
        sub.build_and_log_buffer(4, &abort).unwrap();
        assert_eq!(sub.in_flight_len(), 2);
        assert_eq!(log.subpartition_log_length(DatasetId::new(1, 2), 0), 44);
    }

    #[test]
    fn test_build_aborts_when_flagged() {
        let (_log, sub) = subpartition();
        let abort = AtomicBool::new(true);
        // Nothing staged and abort raised: must return an error, not hang.
        assert!(sub.build_and_log_buffer(8, &abort).is_err());
    }

    #[test]
    fn test_poll_respects_recovering_flag_and_cursor() {
        let (_log, sub) = subpartition();
        sub.add_data(&[1, 2]);
        sub.cut_buffer().unwrap();
        sub.add_data(&[3, 4]);
        sub.cut_buffer().unwrap();

        sub.set_recovering_in_flight(true);
        assert_eq!(sub.poll_next_buffer(), None);

        sub.set_recovering_in_flight(false);
        assert_eq!(sub.poll_next_buffer(), Some(vec![1, 2]));

        sub.request_replay(1, 0);
        assert_eq!(sub.poll_next_buffer(), Some(vec![1, 2]));
        assert_eq!(sub.poll_next_buffer(), Some(vec![3, 4]));
        assert_eq!(sub.poll_next_buffer(), None);
    }

    #[test]
    fn test_table_lookup() {
        let log: Arc<InMemoryJobCausalLog> = Arc::new(InMemoryJobCausalLog::new());
        let table = SubpartitionTable::new();
        let sub = Arc::new(PipelinedSubpartition::new(DatasetId::new(7, 8), 3, log));
        table.insert(sub.clone());
        assert!(table.get(DatasetId::new(7, 8), 3).is_some());
        assert!(table.get(DatasetId::new(7, 8), 4).is_none());
    }
}
