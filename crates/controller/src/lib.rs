//! QBFT controller layer.
//!
//! The controller owns everything around the per-height instance: lifecycle
//! and height tracking, the multi-index message queue and its worker pool,
//! the future-message buffer, decided-certificate storage and publication,
//! sync protocols, and fork transitions.
//!
//! # Architecture
//!
//! ```text
//! transport ──► Controller::process_msg ──► MsgQueue (bounded, multi-index)
//!                                              │
//!                              WorkerPool (W tasks, priority pop)
//!                                              │
//!                    classify: current-instance │ decided │ future │ stale
//!                                              │
//!                               Instance (mutex-serialized)
//!                                              │
//!                        decided certificate ──► storage + decided topic
//! ```

mod controller;
mod fork;
mod future_msgs;
mod handlers;
pub mod metrics;
mod network;
mod queue;
mod sync;
mod worker;

pub use controller::{
    Controller, ControllerError, ControllerOptions, ControllerState, DecidedHandler,
};
pub use fork::{DecidedMode, Fork, ForkVersion};
pub use future_msgs::FutureMsgBuffer;
pub use handlers::{decided_history_handler, last_change_round_handler, last_decided_handler};
pub use network::{Network, NetworkError, PeerId, StreamHandler, ValidationResult};
pub use queue::{MsgQueue, QueuedMessage};
pub use sync::{DecidedSync, SyncConfig, SyncError};
pub use worker::WorkerPool;
