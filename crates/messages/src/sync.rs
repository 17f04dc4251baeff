//! Sync request/response bodies.
//!
//! Sync messages travel as JSON inside [`crate::SsvMessage`] envelopes of
//! type `Sync`. The codec is deliberately self-describing: peers on older
//! forks must still be able to parse responses.

use crate::consensus::{CodecError, SignedMessage};
use dvq_types::{Height, MessageId};
use serde::{Deserialize, Serialize};

/// Which sync protocol a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncProtocol {
    LastDecided,
    LastChangeRound,
    DecidedHistory,
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Unknown,
    Success,
    NotFound,
    Error,
    BadRequest,
    InternalError,
    Backoff,
}

/// Request parameters: the duty identifier plus up to two heights bounding a
/// range (a single height for point queries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParams {
    pub identifier: MessageId,
    pub heights: Vec<Height>,
}

/// A sync request or response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub protocol: SyncProtocol,
    pub params: SyncParams,
    pub data: Vec<SignedMessage>,
    pub status: Status,
}

impl SyncMessage {
    /// Build a request with no results yet.
    pub fn request(protocol: SyncProtocol, identifier: MessageId, heights: Vec<Height>) -> Self {
        SyncMessage {
            protocol,
            params: SyncParams {
                identifier,
                heights,
            },
            data: vec![],
            status: Status::Unknown,
        }
    }

    /// Fill in results, setting the status and reflecting the actual height
    /// range of the returned messages in `params`.
    pub fn update_results(&mut self, results: Vec<SignedMessage>) {
        if results.is_empty() {
            self.status = Status::NotFound;
            return;
        }
        let first = results[0].message.height;
        let last = results[results.len() - 1].message.height;
        self.params.heights = if results.len() > 1 {
            vec![first, last]
        } else {
            vec![first]
        };
        self.data = results;
        self.status = Status::Success;
    }

    /// Mark the message as failed on the server side.
    pub fn update_error(&mut self, status: Status) {
        self.data.clear();
        self.status = status;
    }

    /// JSON encoding.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// JSON decoding.
    pub fn decode(bytes: &[u8]) -> Result<SyncMessage, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
