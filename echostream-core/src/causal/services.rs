//! Record-or-replay façades over the task's sources of non-determinism.
//!
//! The operator and the output side never read the wall clock or an RNG
//! directly. They go through these services, which during live execution
//! draw a fresh value and log it, and during replay return the logged value
//! instead. Either way the caller cannot tell which execution it is in.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::determinant::Determinant;
use super::log::JobCausalLog;
use super::recovery::RecoveryManager;
use crate::types::{ChannelIndex, EventTime};

/// Wall-clock reads, recorded or replayed.
pub struct CausalTimeService {
    causal_log: Arc<dyn JobCausalLog>,
    recovery: Arc<RecoveryManager>,
}

impl CausalTimeService {
    pub fn new(causal_log: Arc<dyn JobCausalLog>, recovery: Arc<RecoveryManager>) -> Self {
        Self {
            causal_log,
            recovery,
        }
    }

    /// Current time in milliseconds; deterministic under replay.
    pub fn current_time_millis(&self) -> Result<EventTime> {
        if self.recovery.is_replaying() {
            return self.recovery.replay_next_timestamp();
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| anyhow!("system clock before unix epoch: {err}"))?
            .as_millis() as EventTime;
        self.causal_log
            .append_main_thread(&Determinant::Timestamp { millis });
        Ok(millis)
    }
}

/// Random draws, recorded or replayed.
pub struct CausalRandomService {
    causal_log: Arc<dyn JobCausalLog>,
    recovery: Arc<RecoveryManager>,
    rng: Mutex<SmallRng>,
}

impl CausalRandomService {
    pub fn new(causal_log: Arc<dyn JobCausalLog>, recovery: Arc<RecoveryManager>) -> Self {
        Self {
            causal_log,
            recovery,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Next random i32; deterministic under replay.
    pub fn next_int(&self) -> Result<i32> {
        if self.recovery.is_replaying() {
            return self.recovery.replay_random_int();
        }
        let value = self.rng.lock().map_err(|_| anyhow!("rng lock poisoned"))?.gen::<i32>();
        self.causal_log.append_main_thread(&Determinant::Rng { value });
        Ok(value)
    }

    /// Pick an output channel for random routing; deterministic under
    /// replay.
    pub fn next_emit_channel(&self, num_channels: usize) -> Result<ChannelIndex> {
        if num_channels == 0 || num_channels > u8::MAX as usize + 1 {
            return Err(anyhow!("invalid output channel count {num_channels}"));
        }
        if self.recovery.is_replaying() {
            return self.recovery.replay_random_emit_channel();
        }
        let channel = self
            .rng
            .lock()
            .map_err(|_| anyhow!("rng lock poisoned"))?
            .gen_range(0..num_channels);
        self.causal_log.append_main_thread(&Determinant::RandomEmit {
            channel: channel as u8,
        });
        Ok(channel)
    }
}
