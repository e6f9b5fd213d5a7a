//! Routing of output records to result subpartitions.
//!
//! Hash routing is a pure function of the record and needs no causal
//! logging. Random routing is a non-deterministic decision, so it draws
//! through the [`CausalRandomService`] and is reproduced exactly during
//! replay.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use ahash::AHasher;
use anyhow::Result;

use crate::causal::services::CausalRandomService;

/// Picks the subpartition (0..num_partitions) an output record goes to.
pub trait Partitioner<T>: Send + Sync {
    fn partition(&self, value: &T, num_partitions: usize) -> Result<usize>;
}

/// Hash-based partitioner using a key selector function.
pub struct HashPartitioner<K, F> {
    key_selector: F,
    _phantom: PhantomData<K>,
}

impl<K, F> HashPartitioner<K, F> {
    pub fn new(key_selector: F) -> Self {
        Self {
            key_selector,
            _phantom: PhantomData,
        }
    }
}

impl<K, T, F> Partitioner<T> for HashPartitioner<K, F>
where
    K: Hash + Send + Sync,
    F: Fn(&T) -> K + Send + Sync,
{
    fn partition(&self, value: &T, num_partitions: usize) -> Result<usize> {
        let key = (self.key_selector)(value);
        let mut hasher = AHasher::default();
        key.hash(&mut hasher);
        Ok((hasher.finish() as usize) % num_partitions)
    }
}

/// Random-routing partitioner whose picks are logged as `RandomEmit`
/// determinants and therefore replayable.
pub struct RandomPartitioner {
    service: Arc<CausalRandomService>,
}

impl RandomPartitioner {
    pub fn new(service: Arc<CausalRandomService>) -> Self {
        Self { service }
    }
}

impl<T> Partitioner<T> for RandomPartitioner {
    fn partition(&self, _value: &T, num_partitions: usize) -> Result<usize> {
        self.service.next_emit_channel(num_partitions)
    }
}
