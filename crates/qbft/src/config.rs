//! Instance configuration.

use crate::leader::LeaderSelector;
use crate::storage::QbftStore;
use dvq_messages::SsvMessage;
use dvq_types::{DomainType, KeyManager};
use std::sync::Arc;
use std::time::Duration;

/// Errors from the outbound side of the transport.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Minimal outbound surface an instance needs: fire-and-forget publication
/// on the duty's topic. The full network trait lives with the controller.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, msg: SsvMessage) -> Result<(), BroadcastError>;
}

/// Timing knobs for a single instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Round 1 timeout; doubles every round.
    pub round_timeout_base: Duration,
    /// Cap on the doubling exponent.
    pub round_timeout_max_exponent: u32,
    /// Window after deciding during which late commits still merge their
    /// signers into the stored certificate.
    pub late_commit_grace: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig {
            round_timeout_base: Duration::from_secs(2),
            round_timeout_max_exponent: 6,
            late_commit_grace: Duration::from_secs(2),
        }
    }
}

/// Everything an instance needs from its environment.
pub struct Config {
    /// Signer for the local operator's share.
    pub key_manager: Arc<dyn KeyManager>,
    /// Network domain for signing roots.
    pub domain: DomainType,
    /// Wire tag of the fork this instance encodes envelopes for.
    pub fork_version: u64,
    /// Proposer rotation.
    pub leader_selector: Arc<dyn LeaderSelector>,
    /// Decided-certificate store (checkpoints go through here too).
    pub storage: Arc<dyn QbftStore>,
    /// Outbound transport.
    pub network: Arc<dyn Broadcaster>,
    /// Timing.
    pub instance: InstanceConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("domain", &self.domain)
            .field("fork_version", &self.fork_version)
            .field("instance", &self.instance)
            .finish()
    }
}
