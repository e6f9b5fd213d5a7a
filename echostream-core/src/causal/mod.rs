//! Causal logging and deterministic replay.
//!
//! A task records every non-deterministic decision it makes into a causal
//! log of [`Determinant`]s:
//!
//! - which input channel the next record was read from ([`Determinant::Order`]),
//! - which output channel random routing picked ([`Determinant::RandomEmit`]),
//! - what the wall clock returned ([`Determinant::Timestamp`]),
//! - what the task RNG produced ([`Determinant::Rng`]),
//! - where an output buffer boundary was cut ([`Determinant::BufferBuilt`]).
//!
//! On recovery a standby replica receives the logged determinants as a
//! [`VertexCausalLogDelta`](log::VertexCausalLogDelta) and replays them
//! through the [`recovery`] state machine, reproducing the exact decision
//! sequence of the failed execution.

pub mod determinant;
pub mod epoch;
pub mod log;
pub mod recovery;
pub mod services;

pub use determinant::{decode_all, Determinant, DeterminantCursor};
pub use epoch::EpochTracker;
pub use log::{InMemoryJobCausalLog, JobCausalLog, VertexCausalLogDelta};
pub use recovery::{RecoveryContext, RecoveryManager};
pub use services::{CausalRandomService, CausalTimeService};

/// Fatal causal-log and replay errors.
///
/// These all abort the task; only construction sites differ. Operational
/// errors elsewhere in the crate go through `anyhow` directly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CausalError {
    /// The decoder hit an unknown tag or a truncated payload.
    #[error("corrupt causal log: {0}")]
    CorruptLog(String),

    /// A replay operation found a determinant of the wrong kind.
    #[error("unexpected determinant: expected {expected}, got {got}")]
    UnexpectedDeterminant { expected: &'static str, got: String },

    /// The buffer stream delivered an event other than end-of-partition.
    #[error("unexpected event in buffer stream: {0}")]
    UnexpectedEvent(String),

    /// The barrier handler still held data when the stream ended.
    #[error("trailing data in checkpoint barrier handler at end of stream")]
    TrailingBarrierData,

    /// Replay consumed a different number of bytes than the causal log holds.
    #[error("replay length mismatch: consumed {consumed} bytes, causal log holds {authoritative}")]
    ReplayLengthMismatch {
        consumed: usize,
        authoritative: usize,
    },

    /// The record counter advanced past an async determinant's target.
    #[error("record count overshot async determinant: current {current}, determinant {target}")]
    RecordCountOvershot { current: u64, target: u64 },
}
