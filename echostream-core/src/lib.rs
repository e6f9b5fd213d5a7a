//! # echostream Core
//!
//! Causal-order deterministic replay core for the echostream stream
//! processor. A task records every non-deterministic decision of its input
//! pipeline into a compact causal log; on failure, a standby replica
//! replays that log to reproduce the exact same execution before going
//! live.
//!
//! The crate is organised around four pieces:
//!
//! - [`causal`] — the determinant model and codec
//!   ([`Determinant`](causal::Determinant)), causal log storage
//!   ([`JobCausalLog`](causal::JobCausalLog)), and the recovery state
//!   machine ([`RecoveryManager`](causal::RecoveryManager)).
//! - [`io`] — the input pipeline: pooled buffers, the buffer/event stream,
//!   per-channel deserializers, the watermark/status valve, and the live
//!   ([`StreamInputProcessor`](io::StreamInputProcessor)) and replay
//!   ([`ForceFeederInputProcessor`](io::ForceFeederInputProcessor)) loops.
//! - [`partition`] — output subpartitions with rebuildable in-flight logs.
//! - [`types`] — the stream element model shared by all of the above.

pub mod causal;
pub mod io;
pub mod metrics;
pub mod operator;
pub mod partition;
pub mod partitioner;
pub mod types;
