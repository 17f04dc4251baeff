//! QBFT instance state machine.
//!
//! This crate implements the per-height consensus state machine driving
//! PROPOSAL → PREPARE → COMMIT → (ROUND-CHANGE) for one (validator, role)
//! duty, together with its supporting pieces:
//!
//! - [`MessageContainer`]: per-round collections with the
//!   longest-unique-signers search that detects commit quorum across
//!   fragments of aggregated commits
//! - [`Pipeline`]: composable validation predicates
//! - [`RoundTimer`]: the monotonically lengthening round timer
//! - [`LeaderSelector`]: round-robin leader election over the committee
//! - [`QbftStore`]: the abstract decided-certificate store
//!
//! # Safety
//!
//! - **Quorum intersection**: any two quorums of `2f+1` overlap in at least
//!   one honest operator, so conflicting values cannot both be decided.
//! - **Prepared locking**: once prepared, an operator carries its
//!   `(prepared_round, prepared_value)` into every round change, and
//!   proposals for later rounds must re-propose the highest prepared value.
//!
//! # Liveness
//!
//! Round timeouts grow exponentially (`T₀ · 2^min(r-1, K)`), and `f+1`
//! round-change messages for higher rounds pull lagging operators forward.

mod config;
mod container;
mod instance;
mod justification;
mod leader;
mod pipeline;
mod round_timer;
mod storage;

pub use config::{BroadcastError, Broadcaster, Config, InstanceConfig};
pub use container::MessageContainer;
pub use instance::{Instance, InstanceError, InstanceState, Stage};
pub use justification::{highest_prepared, justify_proposal};
pub use leader::{LeaderSelector, RoundRobinLeader};
pub use pipeline::{
    authorize, basic, identifier_check, leader_check, msg_type_check, round_check, sequence_check,
    single_signer, verify_authorization, Check, Pipeline, Severity, ValidationError,
};
pub use round_timer::{RoundTimeout, RoundTimer};
pub use storage::{InMemoryStore, QbftStore, StorageError, StoredInstance};
