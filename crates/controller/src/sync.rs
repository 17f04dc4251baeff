//! Client side of the decided sync protocols.
//!
//! Requests fan out to a random subset of peers, each with its own deadline.
//! Responses are deduplicated, every returned message runs through
//! validation, and only the best certificate survives.

use crate::network::{Network, NetworkError};
use dvq_messages::{
    CodecError, MessageType, SignedMessage, Status, SsvMessage, SsvMsgType, SyncMessage,
    SyncProtocol,
};
use dvq_qbft::{verify_authorization, ValidationError};
use dvq_types::{DomainType, Height, MessageId, Share};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Knobs for the sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Per-request deadline, independent of the caller's.
    pub request_timeout: Duration,
    /// Peers contacted per round of requests.
    pub peer_count: usize,
    /// Heights requested per history batch (the server clamps to its own
    /// window as well).
    pub max_batch_size: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            request_timeout: Duration::from_secs(10),
            peer_count: 10,
            max_batch_size: 25,
        }
    }
}

/// Sync failures.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no peers available")]
    NoPeers,
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Fetches decided certificates from peers.
pub struct DecidedSync {
    network: Arc<dyn Network>,
    share: Arc<Share>,
    identifier: MessageId,
    domain: DomainType,
    fork_version: u64,
    config: SyncConfig,
}

impl DecidedSync {
    pub fn new(
        network: Arc<dyn Network>,
        share: Arc<Share>,
        identifier: MessageId,
        domain: DomainType,
        fork_version: u64,
        config: SyncConfig,
    ) -> DecidedSync {
        DecidedSync {
            network,
            share,
            identifier,
            domain,
            fork_version,
            config,
        }
    }

    /// Ask a random peer subset for their highest decided certificate and
    /// return the best verified one.
    pub async fn last_decided(&self, protocol: &str) -> Result<Option<SignedMessage>, SyncError> {
        let request = SyncMessage::request(SyncProtocol::LastDecided, self.identifier, vec![]);
        let responses = self.fan_out(protocol, &request).await?;

        let mut best: Option<SignedMessage> = None;
        for sm in responses {
            if sm.status != Status::Success {
                continue;
            }
            for msg in sm.data {
                if let Err(err) = self.validate_decided(&msg) {
                    debug!(%err, "dropping invalid synced certificate");
                    continue;
                }
                let better = best
                    .as_ref()
                    .is_none_or(|b| msg.message.height > b.message.height);
                if better {
                    best = Some(msg);
                }
            }
        }
        Ok(best)
    }

    /// Fetch decided history for `[from, to]`, batching requests and
    /// validating every certificate. Stops early when peers run dry.
    pub async fn history(
        &self,
        protocol: &str,
        from: Height,
        to: Height,
    ) -> Result<Vec<SignedMessage>, SyncError> {
        let mut collected = Vec::new();
        let mut cursor = from;

        while cursor <= to {
            let batch_end = Height((cursor.0 + self.config.max_batch_size).min(to.0));
            let request = SyncMessage::request(
                SyncProtocol::DecidedHistory,
                self.identifier,
                vec![cursor, batch_end],
            );
            let responses = self.fan_out(protocol, &request).await?;

            let mut batch: Vec<SignedMessage> = Vec::new();
            for sm in responses {
                if sm.status != Status::Success {
                    continue;
                }
                for msg in sm.data {
                    if self.validate_decided(&msg).is_err() {
                        continue;
                    }
                    // Dedupe across peers by height; keep the heaviest
                    // certificate.
                    match batch
                        .iter_mut()
                        .find(|b| b.message.height == msg.message.height)
                    {
                        Some(existing) => {
                            if msg.signers.len() > existing.signers.len() {
                                *existing = msg;
                            }
                        }
                        None => batch.push(msg),
                    }
                }
            }

            if batch.is_empty() {
                break;
            }
            batch.sort_by_key(|m| m.message.height);
            let last = batch[batch.len() - 1].message.height;
            collected.extend(batch);
            if last >= to {
                break;
            }
            cursor = last.next();
        }

        Ok(collected)
    }

    /// Send one request to a random peer subset; collect decodable replies.
    async fn fan_out(
        &self,
        protocol: &str,
        request: &SyncMessage,
    ) -> Result<Vec<SyncMessage>, SyncError> {
        let validator_pk = self.identifier.validator_pk();
        let mut peers = self.network.peers(&validator_pk);
        if peers.is_empty() {
            return Err(SyncError::NoPeers);
        }
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.config.peer_count);

        let envelope = SsvMessage {
            msg_type: SsvMsgType::Sync,
            msg_id: self.identifier,
            fork_version: self.fork_version,
            data: request.encode()?,
        };

        let requests = peers.iter().map(|peer| {
            let network = Arc::clone(&self.network);
            let data = envelope.encode();
            let peer = peer.clone();
            let deadline = self.config.request_timeout;
            let protocol = protocol.to_string();
            async move {
                let result =
                    tokio::time::timeout(deadline, network.request(&peer, &protocol, data)).await;
                (peer, result)
            }
        });

        let mut responses = Vec::new();
        for (peer, result) in futures::future::join_all(requests).await {
            let bytes = match result {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(err)) => {
                    trace!(%peer, %err, "sync request failed");
                    continue;
                }
                Err(_) => {
                    trace!(%peer, "sync request timed out");
                    continue;
                }
            };
            let parsed = SsvMessage::decode(&bytes)
                .ok()
                .filter(|m| m.msg_id == self.identifier)
                .and_then(|m| SyncMessage::decode(&m.data).ok());
            match parsed {
                Some(sm) => responses.push(sm),
                None => warn!(%peer, "undecodable sync response"),
            }
        }
        Ok(responses)
    }

    /// A synced certificate must target this duty, be an aggregated commit
    /// with quorum signers, and verify under the aggregate of their keys.
    fn validate_decided(&self, msg: &SignedMessage) -> Result<(), ValidationError> {
        msg.validate().map_err(ValidationError::Codec)?;
        if msg.message.identifier != self.identifier {
            return Err(ValidationError::WrongIdentifier);
        }
        if msg.message.msg_type != MessageType::Commit {
            return Err(ValidationError::WrongMsgType {
                expected: MessageType::Commit,
                got: msg.message.msg_type,
            });
        }
        if !self.share.has_quorum(msg.signers.len()) {
            return Err(ValidationError::NotJustified(
                "decided certificate without quorum".into(),
            ));
        }
        verify_authorization(&self.share, self.domain, msg)
    }
}
