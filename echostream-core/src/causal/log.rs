//! Causal log storage contract and the in-memory reference store.
//!
//! Durable storage and shipping of causal logs is owned by the surrounding
//! runtime; this module defines the contract the replay core programs
//! against plus an in-memory implementation used for local pipelines and
//! tests.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use super::determinant::Determinant;
use crate::types::{DatasetId, SubpartitionIndex};

/// Causal log delta delivered to a recovering task.
///
/// `main_thread_delta` carries the task thread's determinants in generation
/// order (`None` means the main-thread log was empty). `partition_deltas`
/// carries the `BufferBuilt` determinants of each output subpartition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexCausalLogDelta {
    pub main_thread_delta: Option<Vec<u8>>,
    pub partition_deltas: AHashMap<DatasetId, AHashMap<SubpartitionIndex, Vec<u8>>>,
}

impl VertexCausalLogDelta {
    pub fn new(
        main_thread_delta: Option<Vec<u8>>,
        partition_deltas: AHashMap<DatasetId, AHashMap<SubpartitionIndex, Vec<u8>>>,
    ) -> Self {
        Self {
            main_thread_delta,
            partition_deltas,
        }
    }

    /// Delta with only a main-thread log.
    pub fn main_only(bytes: Vec<u8>) -> Self {
        Self {
            main_thread_delta: Some(bytes),
            partition_deltas: AHashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.main_thread_delta.is_none() && self.partition_deltas.is_empty()
    }
}

/// The task's handle onto causal log storage.
///
/// Appends happen on the hot path (one `Order` determinant per consumed
/// element), so implementations keep them cheap. Length queries return the
/// authoritative byte length used by the replay end-of-log assertions.
pub trait JobCausalLog: Send + Sync {
    /// Append a determinant to the task thread's log.
    fn append_main_thread(&self, determinant: &Determinant);

    /// Append a determinant to one output subpartition's log.
    fn append_subpartition(
        &self,
        dataset: DatasetId,
        subpartition: SubpartitionIndex,
        determinant: &Determinant,
    );

    /// Authoritative byte length of the main-thread log.
    fn main_thread_log_length(&self) -> usize;

    /// Authoritative byte length of one subpartition's log.
    fn subpartition_log_length(&self, dataset: DatasetId, subpartition: SubpartitionIndex)
        -> usize;

    /// Absorb a delta piggy-backed on an upstream element, so this task can
    /// serve its own downstream recoveries.
    fn process_upstream_delta(&self, delta: &VertexCausalLogDelta);
}

/// In-memory causal log store.
#[derive(Default)]
pub struct InMemoryJobCausalLog {
    main_thread: Mutex<Vec<u8>>,
    subpartitions: Mutex<AHashMap<(DatasetId, SubpartitionIndex), Vec<u8>>>,
    upstream: Mutex<Vec<VertexCausalLogDelta>>,
}

impl InMemoryJobCausalLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of the main-thread log.
    pub fn main_thread_log(&self) -> Vec<u8> {
        self.main_thread.lock().expect("causal log lock").clone()
    }

    /// Raw bytes of one subpartition log.
    pub fn subpartition_log(
        &self,
        dataset: DatasetId,
        subpartition: SubpartitionIndex,
    ) -> Vec<u8> {
        self.subpartitions
            .lock()
            .expect("causal log lock")
            .get(&(dataset, subpartition))
            .cloned()
            .unwrap_or_default()
    }

    /// Upstream deltas absorbed so far, in arrival order.
    pub fn upstream_deltas(&self) -> Vec<VertexCausalLogDelta> {
        self.upstream.lock().expect("causal log lock").clone()
    }

    /// Snapshot the whole log as a recovery delta.
    ///
    /// This is what the causal log shipping layer would hand to a standby
    /// replica of this task.
    pub fn collect_delta(&self) -> VertexCausalLogDelta {
        let main = self.main_thread.lock().expect("causal log lock");
        let subs = self.subpartitions.lock().expect("causal log lock");

        let mut partition_deltas: AHashMap<DatasetId, AHashMap<SubpartitionIndex, Vec<u8>>> =
            AHashMap::new();
        for ((dataset, subpartition), bytes) in subs.iter() {
            partition_deltas
                .entry(*dataset)
                .or_default()
                .insert(*subpartition, bytes.clone());
        }

        VertexCausalLogDelta {
            main_thread_delta: if main.is_empty() {
                None
            } else {
                Some(main.clone())
            },
            partition_deltas,
        }
    }
}

impl JobCausalLog for InMemoryJobCausalLog {
    fn append_main_thread(&self, determinant: &Determinant) {
        determinant.encode_into(&mut self.main_thread.lock().expect("causal log lock"));
    }

    fn append_subpartition(
        &self,
        dataset: DatasetId,
        subpartition: SubpartitionIndex,
        determinant: &Determinant,
    ) {
        let mut subs = self.subpartitions.lock().expect("causal log lock");
        determinant.encode_into(subs.entry((dataset, subpartition)).or_default());
    }

    fn main_thread_log_length(&self) -> usize {
        self.main_thread.lock().expect("causal log lock").len()
    }

    fn subpartition_log_length(
        &self,
        dataset: DatasetId,
        subpartition: SubpartitionIndex,
    ) -> usize {
        self.subpartitions
            .lock()
            .expect("causal log lock")
            .get(&(dataset, subpartition))
            .map_or(0, Vec::len)
    }

    fn process_upstream_delta(&self, delta: &VertexCausalLogDelta) {
        self.upstream
            .lock()
            .expect("causal log lock")
            .push(delta.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_lengths() {
        let log = InMemoryJobCausalLog::new();
        let dataset = DatasetId::new(1, 2);

        log.append_main_thread(&Determinant::Order { channel: 0 });
        log.append_main_thread(&Determinant::Rng { value: 9 });
        assert_eq!(log.main_thread_log_length(), 2 + 5);

        log.append_subpartition(
            dataset,
            1,
            &Determinant::BufferBuilt {
                dataset,
                subpartition: 1,
                bytes: 128,
            },
        );
        assert_eq!(log.subpartition_log_length(dataset, 1), 22);
        assert_eq!(log.subpartition_log_length(dataset, 0), 0);
    }

    #[test]
    fn test_collect_delta_roundtrips_logs() {
        let log = InMemoryJobCausalLog::new();
        let dataset = DatasetId::new(3, 4);

        log.append_main_thread(&Determinant::Order { channel: 1 });
        log.append_subpartition(
            dataset,
            0,
            &Determinant::BufferBuilt {
                dataset,
                subpartition: 0,
                bytes: 64,
            },
        );

        let delta = log.collect_delta();
        assert_eq!(delta.main_thread_delta, Some(log.main_thread_log()));
        assert_eq!(
            delta.partition_deltas[&dataset][&0],
            log.subpartition_log(dataset, 0)
        );
    }

    #[test]
    fn test_empty_main_log_collects_as_none() {
        let log = InMemoryJobCausalLog::new();
        assert!(log.collect_delta().main_thread_delta.is_none());
        assert!(log.collect_delta().is_empty());
    }

    #[test]
    fn test_upstream_deltas_are_retained_in_order() {
        let log = InMemoryJobCausalLog::new();
        let first = VertexCausalLogDelta::main_only(vec![0, 1]);
        let second = VertexCausalLogDelta::main_only(vec![0, 2]);
        log.process_upstream_delta(&first);
        log.process_upstream_delta(&second);
        assert_eq!(log.upstream_deltas(), vec![first, second]);
    }
}
