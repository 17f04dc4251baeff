//! The transport surface consumed by the controller.
//!
//! Peer-to-peer plumbing (gossip, subnets, peer scoring) lives outside the
//! engine; this trait is the full contract between them.

use async_trait::async_trait;
use dvq_messages::SsvMessage;
use dvq_qbft::{BroadcastError, Broadcaster, Severity};
use dvq_types::ValidatorPublicKey;
use std::fmt;
use std::sync::Arc;

/// Opaque transport peer identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome reported back to the transport's gossip validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Accept,
    Ignore,
    RejectLow,
    RejectMedium,
    RejectHigh,
}

impl From<Severity> for ValidationResult {
    fn from(severity: Severity) -> ValidationResult {
        match severity {
            Severity::Low => ValidationResult::RejectLow,
            Severity::Medium => ValidationResult::RejectMedium,
            Severity::High => ValidationResult::RejectHigh,
        }
    }
}

/// Errors from the transport.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("network is not ready")]
    NotReady,
    #[error("peer {0} unreachable")]
    PeerUnreachable(PeerId),
    #[error("request timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

/// A registered request/response handler: consumes the request envelope and
/// produces the response envelope.
pub type StreamHandler =
    Arc<dyn Fn(SsvMessage) -> Result<SsvMessage, NetworkError> + Send + Sync>;

/// Full transport contract. `Broadcaster` supplies the plain
/// consensus-topic broadcast used by instances.
#[async_trait]
pub trait Network: Broadcaster {
    /// Start receiving traffic for a validator.
    fn subscribe(&self, validator_pk: &ValidatorPublicKey) -> Result<(), NetworkError>;

    /// Stop receiving traffic for a validator.
    fn unsubscribe(&self, validator_pk: &ValidatorPublicKey) -> Result<(), NetworkError>;

    /// Publish a decided certificate on the decided topic.
    fn broadcast_decided(&self, msg: SsvMessage) -> Result<(), NetworkError>;

    /// Connected peers serving a validator's subnet.
    fn peers(&self, validator_pk: &ValidatorPublicKey) -> Vec<PeerId>;

    /// Send a request to one peer over a sync protocol and await the raw
    /// response. Carries its own deadline independent of the caller's.
    async fn request(
        &self,
        peer: &PeerId,
        protocol: &str,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, NetworkError>;

    /// Serve a sync protocol.
    fn register_stream_handler(&self, protocol: &str, handler: StreamHandler);

    /// Feed the gossip scorer with a validation outcome.
    fn report_validation(&self, msg: &SsvMessage, result: ValidationResult);
}
